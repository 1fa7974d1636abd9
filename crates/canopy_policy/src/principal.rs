//! Principals: who a statement applies to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Conditions;
use crate::error::{PolicyError, PolicyResult};

/// Partition used when formatting principal ARNs.
pub const DEFAULT_PARTITION: &str = "aws";

/// A policy principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    /// The root of an account; delegates to the account's identity policies.
    AccountRoot { account: String },
    /// A service principal such as `events.amazonaws.com`.
    Service { service: String },
    /// A federated identity provider.
    Federated {
        provider: String,
        #[serde(default = "default_federated_action")]
        assume_action: String,
    },
    /// Anyone.
    Any,
    Role { arn: String },
    User { arn: String },
    /// Any other principal identified by ARN.
    Arn { arn: String },
    /// A principal that only matches under extra conditions, e.g. a service
    /// acting on behalf of a specific source.
    Wrapped {
        inner: Box<Principal>,
        conditions: Conditions,
    },
}

fn default_federated_action() -> String {
    "sts:AssumeRoleWithWebIdentity".to_string()
}

/// What a principal contributes to a rendered statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalFragment {
    /// Principal type (`AWS`, `Service`, `Federated`) to identifiers.
    pub principal_json: BTreeMap<String, Vec<String>>,
    /// Conditions the principal requires on any statement naming it.
    pub conditions: Conditions,
}

impl PrincipalFragment {
    fn single(kind: &str, value: impl Into<String>) -> Self {
        let mut principal_json = BTreeMap::new();
        principal_json.insert(kind.to_string(), vec![value.into()]);
        Self {
            principal_json,
            conditions: Conditions::new(),
        }
    }

    /// Fold another fragment into this one, deduplicating identifiers.
    pub fn merge(&mut self, other: PrincipalFragment) {
        for (kind, values) in other.principal_json {
            let entry = self.principal_json.entry(kind).or_default();
            for value in values {
                if !entry.contains(&value) {
                    entry.push(value);
                }
            }
        }
        self.conditions.extend(&other.conditions);
    }

    /// Render the `Principal` element. Single identifiers collapse to a
    /// scalar and identifier lists are sorted so output is stable.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (kind, values) in &self.principal_json {
            let mut values = values.clone();
            values.sort();
            map.insert(kind.clone(), collapse(values));
        }
        Value::Object(map)
    }
}

pub(crate) fn collapse(values: Vec<String>) -> Value {
    if values.len() == 1 {
        Value::String(values.into_iter().next().unwrap_or_default())
    } else {
        Value::Array(values.into_iter().map(Value::String).collect())
    }
}

impl Principal {
    pub fn account_root(account: impl Into<String>) -> Self {
        Self::AccountRoot {
            account: account.into(),
        }
    }

    pub fn service(service: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
        }
    }

    pub fn federated(provider: impl Into<String>) -> Self {
        Self::Federated {
            provider: provider.into(),
            assume_action: default_federated_action(),
        }
    }

    pub fn role(arn: impl Into<String>) -> Self {
        Self::Role { arn: arn.into() }
    }

    pub fn user(arn: impl Into<String>) -> Self {
        Self::User { arn: arn.into() }
    }

    pub fn arn(arn: impl Into<String>) -> Self {
        Self::Arn { arn: arn.into() }
    }

    /// Wrap this principal with additional conditions.
    pub fn with_conditions(self, conditions: Conditions) -> Self {
        match self {
            Self::Wrapped {
                inner,
                conditions: mut existing,
            } => {
                existing.extend(&conditions);
                Self::Wrapped {
                    inner,
                    conditions: existing,
                }
            }
            other => Self::Wrapped {
                inner: Box::new(other),
                conditions,
            },
        }
    }

    /// The policy fragment used when this principal is rendered into a statement.
    pub fn policy_fragment(&self) -> PrincipalFragment {
        match self {
            Self::AccountRoot { account } => {
                PrincipalFragment::single("AWS", account_root_arn(account))
            }
            Self::Service { service } => PrincipalFragment::single("Service", service.clone()),
            Self::Federated { provider, .. } => {
                PrincipalFragment::single("Federated", provider.clone())
            }
            Self::Any => PrincipalFragment::single("AWS", "*"),
            Self::Role { arn } | Self::User { arn } | Self::Arn { arn } => {
                PrincipalFragment::single("AWS", arn.clone())
            }
            Self::Wrapped { inner, conditions } => {
                let mut fragment = inner.policy_fragment();
                fragment.conditions.extend(conditions);
                fragment
            }
        }
    }

    /// Action used in trust policies to let this principal assume a role.
    pub fn assume_role_action(&self) -> &str {
        match self {
            Self::Federated { assume_action, .. } => assume_action,
            Self::Wrapped { inner, .. } => inner.assume_role_action(),
            _ => "sts:AssumeRole",
        }
    }

    /// The account this principal belongs to, when it can be determined
    /// from literal values.
    pub fn principal_account(&self) -> Option<String> {
        match self {
            Self::AccountRoot { account } => Some(account.clone()),
            Self::Role { arn } | Self::User { arn } | Self::Arn { arn } => arn_account(arn),
            Self::Wrapped { inner, .. } => inner.principal_account(),
            Self::Service { .. } | Self::Federated { .. } | Self::Any => None,
        }
    }

    pub fn is_any(&self) -> bool {
        match self {
            Self::Any => true,
            Self::Wrapped { inner, .. } => inner.is_any(),
            _ => false,
        }
    }

    /// Parse the `Principal` element of a JSON statement.
    pub fn from_json(value: &Value) -> PolicyResult<Vec<Principal>> {
        match value {
            Value::String(s) if s == "*" => Ok(vec![Principal::Any]),
            Value::Object(map) => {
                let mut principals = Vec::new();
                for (kind, ids) in map {
                    for id in string_list(ids)? {
                        principals.push(match kind.as_str() {
                            "AWS" => parse_aws_principal(&id),
                            "Service" => Principal::service(id),
                            "Federated" => Principal::federated(id),
                            other => {
                                return Err(PolicyError::InvalidPrincipal(format!(
                                    "unsupported principal type '{}'",
                                    other
                                )))
                            }
                        });
                    }
                }
                Ok(principals)
            }
            other => Err(PolicyError::InvalidPrincipal(format!(
                "expected '*' or an object, got {}",
                other
            ))),
        }
    }
}

/// ARN of an account's root principal.
pub fn account_root_arn(account: &str) -> String {
    format!("arn:{}:iam::{}:root", DEFAULT_PARTITION, account)
}

fn parse_aws_principal(id: &str) -> Principal {
    if id == "*" {
        return Principal::Any;
    }
    if id.len() == 12 && id.chars().all(|c| c.is_ascii_digit()) {
        return Principal::account_root(id);
    }
    if let Some(account) = id.strip_suffix(":root").and_then(|_| arn_account(id)) {
        return Principal::account_root(account);
    }
    if id.contains(":role/") {
        Principal::role(id)
    } else if id.contains(":user/") {
        Principal::user(id)
    } else {
        Principal::arn(id)
    }
}

/// Extract the account field of a literal ARN (`arn:partition:service:region:account:...`).
pub fn arn_account(arn: &str) -> Option<String> {
    if !arn.starts_with("arn:") || arn.contains("${Token[") {
        return None;
    }
    arn.split(':')
        .nth(4)
        .filter(|account| !account.is_empty())
        .map(str::to_string)
}

pub(crate) fn string_list(value: &Value) -> PolicyResult<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    PolicyError::InvalidDocument(format!("expected a string, got {}", item))
                })
            })
            .collect(),
        other => Err(PolicyError::InvalidDocument(format!(
            "expected a string or list of strings, got {}",
            other
        ))),
    }
}
