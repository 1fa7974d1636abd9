//! Aliases: a name for a key with a lifecycle of its own.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use canopy_core::{contains_token, App, ConstructId, GrantTarget, PolicySlot, ResourceNode};
use canopy_policy::PolicyStatement;

use super::KeyRef;
use crate::error::{ConstructError, ConstructResult};

pub const ALIAS_TYPE: &str = "AWS::KMS::Alias";

const ALIAS_PREFIX: &str = "alias/";
const RESERVED_PREFIX: &str = "alias/aws/";
const MAX_ALIAS_LENGTH: usize = 256;
const ALIAS_METADATA: &str = "canopy:kms-alias";

fn alias_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9:/_-]+$").expect("valid alias regex"))
}

/// Check an alias name. Names containing tokens are accepted as-is.
pub fn validate_alias_name(name: &str) -> Result<(), String> {
    if contains_token(name) {
        return Ok(());
    }
    if !name.starts_with(ALIAS_PREFIX) || name.len() == ALIAS_PREFIX.len() {
        return Err(format!("alias '{}' must start with '{}'", name, ALIAS_PREFIX));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(format!(
            "alias '{}' cannot start with the reserved prefix '{}'",
            name, RESERVED_PREFIX
        ));
    }
    if name.len() > MAX_ALIAS_LENGTH {
        return Err(format!(
            "alias '{}' is longer than {} characters",
            name, MAX_ALIAS_LENGTH
        ));
    }
    if !alias_pattern().is_match(name) {
        return Err(format!(
            "alias '{}' may only contain alphanumerics and ':/_-'",
            name
        ));
    }
    Ok(())
}

/// Reject a by-name alias and a bound alias with the same name.
fn check_conflict(app: &App, node: ConstructId, name: &str, bound: bool) -> ConstructResult<()> {
    for other in app.descendants(app.root()) {
        let Some(entry) = app.metadata(other, ALIAS_METADATA) else {
            continue;
        };
        let same_name = entry.get("name").and_then(Value::as_str) == Some(name);
        let other_bound = entry.get("bound").and_then(Value::as_bool).unwrap_or(false);
        if same_name && other_bound != bound {
            return Err(ConstructError::invalid(
                app.path(node),
                format!(
                    "alias '{}' is both defined at {} and imported by name; use the defined alias",
                    name,
                    app.path(other)
                ),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct BoundKey {
    target: GrantTarget,
    policy_holder: Option<ConstructId>,
}

/// A KMS alias, bound to a key in this app or imported by name.
#[derive(Debug, Clone)]
pub struct Alias {
    node: ConstructId,
    resource: Option<ConstructId>,
    name: String,
    arn: String,
    key: Option<BoundKey>,
}

impl Alias {
    /// Create an alias for `target`. Aliasing another alias is rejected.
    pub fn new(
        app: &mut App,
        scope: ConstructId,
        id: &str,
        alias_name: &str,
        target: &dyn KeyRef,
    ) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        validate_alias_name(alias_name).map_err(|msg| ConstructError::invalid(app.path(node), msg))?;
        if target.is_alias() {
            return Err(ConstructError::invalid(
                app.path(node),
                "cannot create an alias of an alias; point it at the key instead",
            ));
        }
        check_conflict(app, node, alias_name, true)?;
        app.add_metadata(node, ALIAS_METADATA, json!({ "name": alias_name, "bound": true }))?;

        let resource = app.add_resource(
            node,
            "Resource",
            ResourceNode::new(ALIAS_TYPE)
                .with_property("aliasName", alias_name)
                .with_property("targetKeyId", target.key_id()),
        )?;

        let target_grant = target.grant_target();
        let policy_holder = match &target_grant {
            GrantTarget::Owned { policy_holder, .. } => *policy_holder,
            _ => None,
        };
        let arn = app.format_arn(node, "kms", None, None, alias_name)?;
        debug!("Alias {} -> {}", alias_name, app.path(target.node()));
        Ok(Self {
            node,
            resource: Some(resource),
            name: alias_name.to_string(),
            arn,
            key: Some(BoundKey {
                target: target_grant,
                policy_holder,
            }),
        })
    }

    /// Reference an alias by name only. Grants and policy changes are
    /// accepted but do nothing.
    pub fn from_alias_name(app: &mut App, scope: ConstructId, id: &str, alias_name: &str) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        validate_alias_name(alias_name).map_err(|msg| ConstructError::invalid(app.path(node), msg))?;
        check_conflict(app, node, alias_name, false)?;
        app.add_metadata(node, ALIAS_METADATA, json!({ "name": alias_name, "bound": false }))?;
        let arn = app.format_arn(node, "kms", None, None, alias_name)?;
        Ok(Self {
            node,
            resource: None,
            name: alias_name.to_string(),
            arn,
            key: None,
        })
    }

    pub fn alias_name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> Option<ConstructId> {
        self.resource
    }

    pub fn is_bound(&self) -> bool {
        self.key.is_some()
    }
}

impl KeyRef for Alias {
    fn node(&self) -> ConstructId {
        self.node
    }

    fn key_arn(&self) -> &str {
        &self.arn
    }

    fn key_id(&self) -> &str {
        &self.name
    }

    fn grant_target(&self) -> GrantTarget {
        match &self.key {
            Some(bound) => bound.target.clone(),
            None => GrantTarget::Unresolved {
                scope: self.node,
                reason: format!(
                    "alias '{}' was imported by name, so its key is unknown",
                    self.name
                ),
            },
        }
    }

    fn is_alias(&self) -> bool {
        true
    }

    fn add_to_resource_policy(
        &self,
        app: &mut App,
        statement: PolicyStatement,
    ) -> ConstructResult<bool> {
        match self.key.as_ref().and_then(|k| k.policy_holder) {
            Some(holder) => Ok(app.add_policy_statement(holder, PolicySlot::Resource, statement)?),
            None => {
                if self.key.is_none() {
                    app.add_warning(
                        self.node,
                        format!(
                            "policy statement ignored: alias '{}' was imported by name",
                            self.name
                        ),
                    );
                }
                Ok(false)
            }
        }
    }
}
