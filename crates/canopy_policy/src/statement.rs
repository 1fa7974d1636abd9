//! Policy statements.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::Conditions;
use crate::error::{PolicyError, PolicyResult};
use crate::principal::{collapse, string_list, Principal, PrincipalFragment};

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "Allow",
            Effect::Deny => "Deny",
        }
    }
}

/// A single statement in a policy document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub effect: Effect,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub not_actions: Vec<String>,
    #[serde(default)]
    pub principals: Vec<Principal>,
    #[serde(default)]
    pub not_principals: Vec<Principal>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub not_resources: Vec<String>,
    #[serde(default)]
    pub conditions: Conditions,
}

impl PolicyStatement {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn deny() -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::default()
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_actions(actions);
        self
    }

    pub fn with_not_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for action in actions {
            push_unique(&mut self.not_actions, action.into());
        }
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.add_principal(principal);
        self
    }

    pub fn with_not_principal(mut self, principal: Principal) -> Self {
        if !self.not_principals.contains(&principal) {
            self.not_principals.push(principal);
        }
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_resources(resources);
        self
    }

    pub fn with_not_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for resource in resources {
            push_unique(&mut self.not_resources, resource.into());
        }
        self
    }

    pub fn with_condition(mut self, operator: &str, key: &str, value: Value) -> Self {
        self.conditions.add(operator, key, value);
        self
    }

    pub fn add_actions<I, S>(&mut self, actions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for action in actions {
            push_unique(&mut self.actions, action.into());
        }
    }

    pub fn add_principal(&mut self, principal: Principal) {
        if !self.principals.contains(&principal) {
            self.principals.push(principal);
        }
    }

    pub fn add_resources<I, S>(&mut self, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for resource in resources {
            push_unique(&mut self.resources, resource.into());
        }
    }

    pub fn has_principal(&self) -> bool {
        !self.principals.is_empty() || !self.not_principals.is_empty()
    }

    pub fn has_resource(&self) -> bool {
        !self.resources.is_empty() || !self.not_resources.is_empty()
    }

    pub fn has_action(&self) -> bool {
        !self.actions.is_empty() || !self.not_actions.is_empty()
    }

    /// Whether every action in `actions` is already covered by this statement.
    pub fn covers_actions(&self, actions: &[String]) -> bool {
        actions.iter().all(|a| self.actions.contains(a))
    }

    fn principal_fragment(principals: &[Principal]) -> PrincipalFragment {
        let mut fragment = PrincipalFragment::default();
        for principal in principals {
            fragment.merge(principal.policy_fragment());
        }
        fragment
    }

    /// Conditions including those contributed by wrapped principals.
    pub fn effective_conditions(&self) -> Conditions {
        let mut conditions = self.conditions.clone();
        conditions.extend(&Self::principal_fragment(&self.principals).conditions);
        conditions
    }

    /// Two statements share a scope when every field except the action list
    /// renders identically; such statements can be coalesced.
    pub fn same_scope(&self, other: &PolicyStatement) -> bool {
        self.sid == other.sid
            && self.effect == other.effect
            && self.not_actions == other.not_actions
            && sorted(&self.resources) == sorted(&other.resources)
            && sorted(&self.not_resources) == sorted(&other.not_resources)
            && Self::principal_fragment(&self.principals).to_json()
                == Self::principal_fragment(&other.principals).to_json()
            && Self::principal_fragment(&self.not_principals).to_json()
                == Self::principal_fragment(&other.not_principals).to_json()
            && self.effective_conditions() == other.effective_conditions()
    }

    /// Render the statement. Single-element lists collapse to scalars.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(sid) = &self.sid {
            map.insert("Sid".to_string(), Value::String(sid.clone()));
        }
        map.insert(
            "Effect".to_string(),
            Value::String(self.effect.as_str().to_string()),
        );
        if !self.actions.is_empty() {
            map.insert("Action".to_string(), collapse(self.actions.clone()));
        }
        if !self.not_actions.is_empty() {
            map.insert("NotAction".to_string(), collapse(self.not_actions.clone()));
        }
        if !self.principals.is_empty() {
            map.insert(
                "Principal".to_string(),
                Self::principal_fragment(&self.principals).to_json(),
            );
        }
        if !self.not_principals.is_empty() {
            map.insert(
                "NotPrincipal".to_string(),
                Self::principal_fragment(&self.not_principals).to_json(),
            );
        }
        if !self.resources.is_empty() {
            map.insert("Resource".to_string(), collapse(self.resources.clone()));
        }
        if !self.not_resources.is_empty() {
            map.insert(
                "NotResource".to_string(),
                collapse(self.not_resources.clone()),
            );
        }
        let conditions = self.effective_conditions();
        if !conditions.is_empty() {
            map.insert("Condition".to_string(), conditions.to_json());
        }
        Value::Object(map)
    }

    /// Parse a statement from its JSON form.
    pub fn from_json(index: usize, value: &Value) -> PolicyResult<Self> {
        let obj = value.as_object().ok_or_else(|| PolicyError::InvalidStatement {
            index,
            message: "statement must be an object".to_string(),
        })?;

        let effect = match obj.get("Effect").and_then(Value::as_str) {
            Some("Allow") | None => Effect::Allow,
            Some("Deny") => Effect::Deny,
            Some(other) => {
                return Err(PolicyError::InvalidStatement {
                    index,
                    message: format!("unknown effect '{}'", other),
                })
            }
        };

        let list = |key: &str| -> PolicyResult<Vec<String>> {
            obj.get(key).map(string_list).transpose().map(Option::unwrap_or_default)
        };
        let principals = |key: &str| -> PolicyResult<Vec<Principal>> {
            obj.get(key)
                .map(Principal::from_json)
                .transpose()
                .map(Option::unwrap_or_default)
        };

        let conditions = match obj.get("Condition") {
            None => Conditions::new(),
            Some(value) => Conditions::from_json(value).ok_or_else(|| {
                PolicyError::InvalidStatement {
                    index,
                    message: "malformed Condition block".to_string(),
                }
            })?,
        };

        Ok(Self {
            sid: obj.get("Sid").and_then(Value::as_str).map(str::to_string),
            effect,
            actions: list("Action")?,
            not_actions: list("NotAction")?,
            principals: principals("Principal")?,
            not_principals: principals("NotPrincipal")?,
            resources: list("Resource")?,
            not_resources: list("NotResource")?,
            conditions,
        })
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn sorted(values: &[String]) -> Vec<&String> {
    let mut refs: Vec<&String> = values.iter().collect();
    refs.sort();
    refs.dedup();
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_collapses_single_values() {
        let statement = PolicyStatement::allow()
            .with_actions(["kms:Decrypt"])
            .with_principal(Principal::role("arn:aws:iam::111111111111:role/app"))
            .with_resources(["*"]);

        assert_eq!(
            statement.to_json(),
            json!({
                "Action": "kms:Decrypt",
                "Effect": "Allow",
                "Principal": {"AWS": "arn:aws:iam::111111111111:role/app"},
                "Resource": "*"
            })
        );
    }

    #[test]
    fn test_actions_are_deduplicated_in_order() {
        let statement = PolicyStatement::allow()
            .with_actions(["b", "a"])
            .with_actions(["a", "c"]);
        assert_eq!(statement.actions, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_same_scope_ignores_actions_but_not_conditions() {
        let a = PolicyStatement::allow()
            .with_actions(["kms:Encrypt"])
            .with_principal(Principal::account_root("111"))
            .with_resources(["*"]);
        let b = PolicyStatement::allow()
            .with_actions(["kms:Decrypt"])
            .with_principal(Principal::account_root("111"))
            .with_resources(["*"]);
        assert!(a.same_scope(&b));

        let c = b.clone().with_condition("Bool", "aws:SecureTransport", json!("true"));
        assert!(!a.same_scope(&c));
    }

    #[test]
    fn test_parse_statement() {
        let statement = PolicyStatement::from_json(
            0,
            &json!({
                "Effect": "Deny",
                "Action": ["s3:*"],
                "Principal": "*",
                "Resource": "*",
                "Condition": {"Bool": {"aws:SecureTransport": "false"}}
            }),
        )
        .unwrap();

        assert_eq!(statement.effect, Effect::Deny);
        assert_eq!(statement.principals, vec![Principal::Any]);
        assert_eq!(statement.conditions.len(), 1);
    }

    #[test]
    fn test_parse_rejects_unknown_effect() {
        let err = PolicyStatement::from_json(3, &json!({"Effect": "Maybe"})).unwrap_err();
        assert!(err.to_string().contains("#3"));
    }
}
