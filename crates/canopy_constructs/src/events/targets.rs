//! Rule targets.
//!
//! A target binds to a rule and returns a [`RuleTargetConfig`]; binding is
//! where permissions are granted (queue policies, bus policies, roles).

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use canopy_core::{App, ConstructId, EVENTS_QUEUE_SAME_ACCOUNT};
use canopy_policy::{Conditions, Principal};

use super::{EventBus, Rule, EVENTS_SERVICE};
use crate::error::{ConstructError, ConstructResult};
use crate::iam::{Role, RoleProps};
use crate::sqs::Queue;

/// What the rule sends to the target.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleTargetInput {
    /// A literal string, sent as a JSON string.
    Text(String),
    /// A JSON value, sent serialized.
    Object(Value),
    /// A JSONPath into the event.
    EventPath(String),
    /// Values extracted from the event substituted into a template.
    Transformer {
        paths: BTreeMap<String, String>,
        template: String,
    },
}

impl RuleTargetInput {
    /// Template-ready fields for this input.
    fn render(&self, out: &mut Map<String, Value>) {
        match self {
            RuleTargetInput::Text(text) => {
                out.insert("Input".to_string(), Value::String(Value::String(text.clone()).to_string()));
            }
            RuleTargetInput::Object(value) => {
                out.insert("Input".to_string(), Value::String(value.to_string()));
            }
            RuleTargetInput::EventPath(path) => {
                out.insert("InputPath".to_string(), Value::String(path.clone()));
            }
            RuleTargetInput::Transformer { paths, template } => {
                out.insert(
                    "InputTransformer".to_string(),
                    json!({ "InputPathsMap": paths, "InputTemplate": template }),
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_event_age_secs: Option<u32>,
    pub max_retry_attempts: Option<u32>,
}

/// A bound target, ready to be rendered into a rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTargetConfig {
    pub arn: String,
    pub role_arn: Option<String>,
    pub input: Option<RuleTargetInput>,
    pub dead_letter_arn: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub message_group_id: Option<String>,
    /// Resource backing the target, used to detect cross-environment routing.
    pub target_resource: Option<ConstructId>,
}

impl RuleTargetConfig {
    pub fn new(arn: impl Into<String>) -> Self {
        Self {
            arn: arn.into(),
            ..Default::default()
        }
    }

    /// The `Targets` entry for this target.
    pub fn to_json(&self, id: &str) -> Value {
        let mut out = Map::new();
        out.insert("Id".to_string(), Value::String(id.to_string()));
        out.insert("Arn".to_string(), Value::String(self.arn.clone()));
        if let Some(role_arn) = &self.role_arn {
            out.insert("RoleArn".to_string(), Value::String(role_arn.clone()));
        }
        if let Some(input) = &self.input {
            input.render(&mut out);
        }
        if let Some(arn) = &self.dead_letter_arn {
            out.insert("DeadLetterConfig".to_string(), json!({ "Arn": arn }));
        }
        if let Some(retry) = &self.retry_policy {
            let mut policy = Map::new();
            if let Some(age) = retry.max_event_age_secs {
                policy.insert("MaximumEventAgeInSeconds".to_string(), json!(age));
            }
            if let Some(attempts) = retry.max_retry_attempts {
                policy.insert("MaximumRetryAttempts".to_string(), json!(attempts));
            }
            out.insert("RetryPolicy".to_string(), Value::Object(policy));
        }
        if let Some(group) = &self.message_group_id {
            out.insert("SqsParameters".to_string(), json!({ "MessageGroupId": group }));
        }
        Value::Object(out)
    }
}

/// Something a rule can deliver events to.
pub trait RuleTarget {
    fn bind(&self, app: &mut App, rule: &Rule) -> ConstructResult<RuleTargetConfig>;

    /// Construct owning the target, when it is defined in this app.
    fn target_scope(&self) -> Option<ConstructId> {
        None
    }
}

/// A role events can assume on behalf of `rule`, shared by its targets.
pub fn singleton_events_role(app: &mut App, rule: &Rule) -> ConstructResult<Role> {
    let role = match app.find_child(rule.node(), "EventsRole") {
        Some(node) => {
            let resource = app.find_child(node, "Resource").ok_or_else(|| {
                ConstructError::invalid(app.path(node), "events role has no resource")
            })?;
            Role::from_resource(app, node, resource)
        }
        None => Role::new(
            app,
            rule.node(),
            "EventsRole",
            RoleProps::new(Principal::service(EVENTS_SERVICE)),
        )?,
    };
    Ok(role)
}

/// Deliver events to an SQS queue.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    pub queue: Queue,
    pub message_group_id: Option<String>,
    pub input: Option<RuleTargetInput>,
    pub dead_letter_queue: Option<Queue>,
    pub retry_policy: Option<RetryPolicy>,
}

impl SqsQueue {
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            message_group_id: None,
            input: None,
            dead_letter_queue: None,
            retry_policy: None,
        }
    }

    pub fn with_message_group_id(mut self, group: impl Into<String>) -> Self {
        self.message_group_id = Some(group.into());
        self
    }

    pub fn with_input(mut self, input: RuleTargetInput) -> Self {
        self.input = Some(input);
        self
    }
}

impl RuleTarget for SqsQueue {
    fn bind(&self, app: &mut App, rule: &Rule) -> ConstructResult<RuleTargetConfig> {
        if self.queue.is_fifo() && self.message_group_id.is_none() {
            return Err(ConstructError::invalid(
                app.path(rule.node()),
                "a message group id is required for FIFO queue targets",
            ));
        }
        if !self.queue.is_fifo() && self.message_group_id.is_some() {
            return Err(ConstructError::invalid(
                app.path(rule.node()),
                "a message group id is only valid for FIFO queue targets",
            ));
        }

        // Scoping an encrypted queue to the rule arn would make the key
        // policy depend on the rule, and the rule on the key.
        let mut conditions = Conditions::new();
        if self.queue.encryption_key().is_none() {
            conditions.add("ArnEquals", "aws:SourceArn", json!(rule.arn()));
        } else if app.feature_flag(rule.node(), EVENTS_QUEUE_SAME_ACCOUNT)? {
            let account = app.account(rule.node())?;
            conditions.add("StringEquals", "aws:SourceAccount", json!(account));
        }
        let principal = Principal::service(EVENTS_SERVICE).with_conditions(conditions);
        self.queue.grant_send_messages(app, &principal)?;

        if let Some(dlq) = &self.dead_letter_queue {
            let mut conditions = Conditions::new();
            conditions.add("ArnEquals", "aws:SourceArn", json!(rule.arn()));
            dlq.grant_send_messages(
                app,
                &Principal::service(EVENTS_SERVICE).with_conditions(conditions),
            )?;
        }

        Ok(RuleTargetConfig {
            arn: self.queue.arn().to_string(),
            input: self.input.clone(),
            dead_letter_arn: self.dead_letter_queue.as_ref().map(|q| q.arn().to_string()),
            retry_policy: self.retry_policy,
            message_group_id: self.message_group_id.clone(),
            target_resource: self.queue.resource(),
            ..Default::default()
        })
    }

    fn target_scope(&self) -> Option<ConstructId> {
        self.queue.resource().map(|_| self.queue.node())
    }
}

/// Forward events to another event bus.
#[derive(Debug, Clone)]
pub struct EventBusTarget {
    pub bus: EventBus,
    pub role: Option<Role>,
}

impl EventBusTarget {
    pub fn new(bus: EventBus) -> Self {
        Self { bus, role: None }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

impl RuleTarget for EventBusTarget {
    fn bind(&self, app: &mut App, rule: &Rule) -> ConstructResult<RuleTargetConfig> {
        let role = match &self.role {
            Some(role) => role.clone(),
            None => singleton_events_role(app, rule)?,
        };
        self.bus.grant_put_events_to(app, &role)?;
        Ok(RuleTargetConfig {
            arn: self.bus.arn().to_string(),
            role_arn: Some(role.arn().to_string()),
            target_resource: self.bus.resource(),
            ..Default::default()
        })
    }

    fn target_scope(&self) -> Option<ConstructId> {
        self.bus.resource().map(|_| self.bus.node())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_input_is_a_json_string() {
        let mut config = RuleTargetConfig::new("arn:aws:sqs:us-east-1:111111111111:jobs");
        config.input = Some(RuleTargetInput::Text("hello".to_string()));
        let rendered = config.to_json("Target0");
        assert_eq!(rendered["Input"], json!("\"hello\""));
        assert_eq!(rendered["Id"], json!("Target0"));
    }

    #[test]
    fn test_transformer_keeps_path_names() {
        let mut config = RuleTargetConfig::new("arn");
        config.input = Some(RuleTargetInput::Transformer {
            paths: BTreeMap::from([("instance".to_string(), "$.detail.instance-id".to_string())]),
            template: "\"<instance> changed\"".to_string(),
        });
        config.retry_policy = Some(RetryPolicy {
            max_event_age_secs: Some(3600),
            max_retry_attempts: None,
        });
        let rendered = config.to_json("Target1");
        assert_eq!(
            rendered["InputTransformer"]["InputPathsMap"],
            json!({"instance": "$.detail.instance-id"})
        );
        assert_eq!(rendered["RetryPolicy"], json!({"MaximumEventAgeInSeconds": 3600}));
        assert!(rendered.get("RoleArn").is_none());
    }
}
