//! Feature flags: named boolean switches read from construct context.

use serde_json::Value;
use tracing::debug;

use crate::app::{App, Phase};
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult};

/// Grants rely on identity policies and the key's default policy.
pub const KMS_DEFAULT_KEY_POLICIES: &str = "@canopy/kms:default-key-policies";
/// New file systems are encrypted unless told otherwise.
pub const EFS_DEFAULT_ENCRYPTION_AT_REST: &str = "@canopy/efs:default-encryption-at-rest";
/// New file systems deny anonymous client access in their policy.
pub const EFS_DENY_ANONYMOUS_ACCESS: &str = "@canopy/efs:deny-anonymous-access";
/// Queue targets in the rule's account get a queue policy scoped to the rule.
pub const EVENTS_QUEUE_SAME_ACCOUNT: &str = "@canopy/events:queue-same-account";

const FLAG_PREFIX: &str = "@canopy/";

/// A known feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlag {
    pub name: &'static str,
    pub default: bool,
    pub summary: &'static str,
}

/// Every flag this library reads.
pub const FEATURE_FLAGS: &[FeatureFlag] = &[
    FeatureFlag {
        name: KMS_DEFAULT_KEY_POLICIES,
        default: false,
        summary: "grant through identity policies instead of key policies",
    },
    FeatureFlag {
        name: EFS_DEFAULT_ENCRYPTION_AT_REST,
        default: true,
        summary: "encrypt file systems by default",
    },
    FeatureFlag {
        name: EFS_DENY_ANONYMOUS_ACCESS,
        default: true,
        summary: "deny anonymous access in file system policies",
    },
    FeatureFlag {
        name: EVENTS_QUEUE_SAME_ACCOUNT,
        default: true,
        summary: "scope queue policies for rule targets to the rule",
    },
];

/// Registry entry for a flag name.
pub fn feature_flag(name: &str) -> Option<&'static FeatureFlag> {
    FEATURE_FLAGS.iter().find(|f| f.name == name)
}

pub fn is_flag_key(key: &str) -> bool {
    key.starts_with(FLAG_PREFIX)
}

impl App {
    /// Context value visible from `scope`: the nearest node that sets it.
    pub fn context_value(&self, scope: ConstructId, key: &str) -> Option<&Value> {
        self.ancestors(scope)
            .into_iter()
            .find_map(|id| self.node(id).context.get(key))
    }

    /// Set a context entry on a construct. Flags cannot change after they
    /// were read, after the construct has children, or after construction.
    pub fn set_context(&mut self, scope: ConstructId, key: &str, value: Value) -> CoreResult<()> {
        if is_flag_key(key) {
            let path = self.path(scope);
            let mutation = |message: &str| CoreError::FlagMutation {
                path: path.clone(),
                flag: key.to_string(),
                message: message.to_string(),
            };
            if !matches!(self.phase, Phase::Construction) {
                return Err(mutation("construction has ended"));
            }
            if !self.node(scope).children().is_empty() {
                return Err(mutation("the construct already has children"));
            }
            let Some(enabled) = value.as_bool() else {
                return Err(mutation("flag values must be booleans"));
            };
            let current = self.flag_value(scope, key);
            if self.flag_reads.borrow().contains(key) && current != enabled {
                return Err(mutation("the flag has already been read"));
            }
        } else {
            self.ensure_mutable(scope, "set context")?;
        }
        self.node_mut(scope).context.insert(key.to_string(), value);
        Ok(())
    }

    fn flag_value(&self, scope: ConstructId, name: &str) -> bool {
        if let Some(value) = self.context_value(scope, name).and_then(Value::as_bool) {
            return value;
        }
        if let Some(value) = self.config.flags.get(name) {
            return *value;
        }
        feature_flag(name).map(|f| f.default).unwrap_or(false)
    }

    /// Read a feature flag as seen from `scope`.
    pub fn feature_flag(&self, scope: ConstructId, name: &str) -> CoreResult<bool> {
        if feature_flag(name).is_none() {
            return Err(CoreError::invalid(
                self.path(scope),
                format!("unknown feature flag '{}'", name),
            ));
        }
        let value = self.flag_value(scope, name);
        self.flag_reads.borrow_mut().insert(name.to_string());
        debug!("Flag {} = {} at {}", name, value, self.path(scope));
        Ok(value)
    }
}
