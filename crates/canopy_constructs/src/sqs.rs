//! SQS queues and their queue policies.

use serde_json::json;
use tracing::debug;

use canopy_core::{
    contains_token, App, ConstructId, Grant, GrantTarget, PolicyRender, PolicySlot,
    RemovalPolicy, ResourceNode, TagFormat,
};
use canopy_policy::PolicyStatement;

use crate::error::{ConstructError, ConstructResult};
use crate::iam::Grantable;
use crate::kms::{Key, KeyRef};

pub const QUEUE_TYPE: &str = "AWS::SQS::Queue";
pub const QUEUE_POLICY_TYPE: &str = "AWS::SQS::QueuePolicy";

pub const SEND_ACTIONS: &[&str] = &[
    "sqs:SendMessage",
    "sqs:GetQueueAttributes",
    "sqs:GetQueueUrl",
];
pub const CONSUME_ACTIONS: &[&str] = &[
    "sqs:ReceiveMessage",
    "sqs:ChangeMessageVisibility",
    "sqs:GetQueueUrl",
    "sqs:DeleteMessage",
    "sqs:GetQueueAttributes",
];
pub const PURGE_ACTIONS: &[&str] = &[
    "sqs:PurgeQueue",
    "sqs:GetQueueAttributes",
    "sqs:GetQueueUrl",
];

const FIFO_SUFFIX: &str = ".fifo";

/// Where failed messages go.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    pub queue: Queue,
    pub max_receive_count: u32,
}

/// Properties for [`Queue::new`].
#[derive(Debug, Clone, Default)]
pub struct QueueProps {
    pub queue_name: Option<String>,
    pub fifo: Option<bool>,
    pub content_based_deduplication: Option<bool>,
    pub visibility_timeout_secs: Option<u32>,
    pub retention_period_secs: Option<u32>,
    pub delivery_delay_secs: Option<u32>,
    pub encryption_key: Option<Key>,
    pub dead_letter_queue: Option<DeadLetterQueue>,
    pub removal_policy: Option<RemovalPolicy>,
}

fn check_range(errors: &mut Vec<String>, name: &str, value: Option<u32>, min: u32, max: u32) {
    if let Some(value) = value {
        if !(min..=max).contains(&value) {
            errors.push(format!(
                "{} must be between {} and {} seconds, got {}",
                name, min, max, value
            ));
        }
    }
}

fn check_props(props: &QueueProps) -> (bool, Vec<String>) {
    let mut errors = Vec::new();
    let named_fifo = props
        .queue_name
        .as_deref()
        .is_some_and(|n| !contains_token(n) && n.ends_with(FIFO_SUFFIX));
    let fifo = props.fifo.unwrap_or(named_fifo);
    if fifo && props.queue_name.is_some() && !named_fifo {
        if let Some(name) = props.queue_name.as_deref().filter(|n| !contains_token(n)) {
            errors.push(format!("FIFO queue name '{}' must end in '{}'", name, FIFO_SUFFIX));
        }
    }
    if props.content_based_deduplication == Some(true) && !fifo {
        errors.push("content-based deduplication is only available for FIFO queues".to_string());
    }
    check_range(&mut errors, "visibility timeout", props.visibility_timeout_secs, 0, 43_200);
    check_range(&mut errors, "retention period", props.retention_period_secs, 60, 1_209_600);
    check_range(&mut errors, "delivery delay", props.delivery_delay_secs, 0, 900);
    (fifo, errors)
}

/// An SQS queue, defined here or imported by arn.
#[derive(Debug, Clone)]
pub struct Queue {
    node: ConstructId,
    resource: Option<ConstructId>,
    arn: String,
    url: String,
    name: String,
    fifo: bool,
    encryption_key: Option<Key>,
}

impl Queue {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: QueueProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let (fifo, errors) = check_props(&props);
        if !errors.is_empty() {
            return Err(ConstructError::invalid(app.path(node), errors.join("; ")));
        }

        let mut resource = ResourceNode::new(QUEUE_TYPE).taggable(TagFormat::Standard);
        if fifo {
            resource = resource.with_property("fifoQueue", true);
        }
        if let Some(dedup) = props.content_based_deduplication {
            resource = resource.with_property("contentBasedDeduplication", dedup);
        }
        if let Some(secs) = props.visibility_timeout_secs {
            resource = resource.with_property("visibilityTimeout", secs);
        }
        if let Some(secs) = props.retention_period_secs {
            resource = resource.with_property("messageRetentionPeriod", secs);
        }
        if let Some(secs) = props.delivery_delay_secs {
            resource = resource.with_property("delaySeconds", secs);
        }
        if let Some(key) = &props.encryption_key {
            resource = resource.with_property("kmsMasterKeyId", key.key_arn());
        }
        if let Some(dlq) = &props.dead_letter_queue {
            resource = resource.with_property(
                "redrivePolicy",
                json!({
                    "deadLetterTargetArn": dlq.queue.arn(),
                    "maxReceiveCount": dlq.max_receive_count,
                }),
            );
        }
        if let Some(name) = &props.queue_name {
            let arn = app.format_arn(scope, "sqs", None, None, name)?;
            let region = app.region(scope)?;
            let account = app.account(scope)?;
            resource = resource
                .with_property("queueName", name.clone())
                .with_physical_name(name.clone())
                .with_cross_env_attribute("Arn", arn)
                .with_cross_env_attribute("QueueName", name.clone())
                .with_cross_env_attribute(
                    "Ref",
                    format!("https://sqs.{}.amazonaws.com/{}/{}", region, account, name),
                );
        }

        let resource = app.add_resource(node, "Resource", resource)?;
        if let Some(policy) = props.removal_policy {
            app.apply_removal_policy(resource, policy)?;
        }
        debug!("Queue {}", app.path(node));
        Ok(Self {
            node,
            resource: Some(resource),
            arn: app.get_att(resource, "Arn"),
            url: app.ref_token(resource),
            name: app.get_att(resource, "QueueName"),
            fifo,
            encryption_key: props.encryption_key,
        })
    }

    /// Reference an existing queue by arn (`arn:aws:sqs:<region>:<account>:<name>`).
    pub fn from_queue_arn(app: &mut App, scope: ConstructId, id: &str, arn: &str) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let parts: Vec<&str> = arn.split(':').collect();
        if parts.len() != 6 || parts[2] != "sqs" {
            return Err(ConstructError::invalid(
                app.path(node),
                format!("'{}' is not a queue arn", arn),
            ));
        }
        let (region, account, name) = (parts[3], parts[4], parts[5]);
        Ok(Self {
            node,
            resource: None,
            arn: arn.to_string(),
            url: format!("https://sqs.{}.amazonaws.com/{}/{}", region, account, name),
            name: name.to_string(),
            fifo: name.ends_with(FIFO_SUFFIX),
            encryption_key: None,
        })
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn resource(&self) -> Option<ConstructId> {
        self.resource
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo
    }

    pub fn encryption_key(&self) -> Option<&Key> {
        self.encryption_key.as_ref()
    }

    /// The queue policy resource, created on first use.
    fn ensure_policy(&self, app: &mut App) -> ConstructResult<Option<ConstructId>> {
        if self.resource.is_none() {
            return Ok(None);
        }
        if let Some(policy) = app.find_child(self.node, "Policy") {
            return Ok(Some(policy));
        }
        let policy = app.add_resource(
            self.node,
            "Policy",
            ResourceNode::new(QUEUE_POLICY_TYPE)
                .with_property("queues", json!([self.url]))
                .with_policy(
                    PolicySlot::Resource,
                    PolicyRender::Property("policyDocument".to_string()),
                    true,
                ),
        )?;
        Ok(Some(policy))
    }

    /// Append a statement to the queue policy. Imported queues return `false`.
    pub fn add_to_resource_policy(
        &self,
        app: &mut App,
        statement: PolicyStatement,
    ) -> ConstructResult<bool> {
        match self.ensure_policy(app)? {
            Some(policy) => Ok(app.add_policy_statement(policy, PolicySlot::Resource, statement)?),
            None => Ok(false),
        }
    }

    /// Grant `actions` on this queue. Grantees with an identity in the same
    /// account get an identity statement; anyone else goes through the
    /// queue policy.
    pub fn grant(&self, app: &mut App, grantee: &dyn Grantable, actions: &[&str]) -> ConstructResult<Grant> {
        let grantee = grantee.grantee();
        let target = match self.resource {
            None => GrantTarget::Imported {
                scope: self.node,
                arns: vec![self.arn.clone()],
            },
            Some(resource) => {
                let same_account = match grantee.identity {
                    Some(identity) => {
                        let ours = app.environment(self.node)?.account.clone();
                        let theirs = app.environment(identity)?.account.clone();
                        ours.is_none() || theirs.is_none() || ours == theirs
                    }
                    None => false,
                };
                let policy_holder = if same_account {
                    None
                } else {
                    self.ensure_policy(app)?
                };
                GrantTarget::Owned {
                    resource,
                    policy_holder,
                    arns: vec![self.arn.clone()],
                    policy_resources: vec![self.arn.clone()],
                }
            }
        };
        Ok(app.grant(&grantee, &target, actions)?)
    }

    pub fn grant_send_messages(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        let grant = self.grant(app, grantee, SEND_ACTIONS)?;
        if let Some(key) = &self.encryption_key {
            key.grant_encrypt_decrypt(app, grantee)?;
        }
        Ok(grant)
    }

    pub fn grant_consume_messages(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        let grant = self.grant(app, grantee, CONSUME_ACTIONS)?;
        if let Some(key) = &self.encryption_key {
            key.grant_decrypt(app, grantee)?;
        }
        Ok(grant)
    }

    pub fn grant_purge(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, PURGE_ACTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iam::{Role, RoleProps};
    use canopy_core::{synthesize, StackProps};
    use canopy_policy::Principal;
    use serde_json::Value;

    fn app_with_stack() -> (App, ConstructId) {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Queues", StackProps::default()).unwrap();
        (app, stack)
    }

    #[test]
    fn test_fifo_name_rules() {
        let (mut app, stack) = app_with_stack();
        let named = Queue::new(
            &mut app,
            stack,
            "Orders",
            QueueProps {
                queue_name: Some("orders.fifo".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(named.is_fifo());

        let err = Queue::new(
            &mut app,
            stack,
            "Broken",
            QueueProps {
                queue_name: Some("broken".to_string()),
                fifo: Some(true),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains(".fifo"));
    }

    #[test]
    fn test_role_grant_uses_identity_policy() {
        let (mut app, stack) = app_with_stack();
        let queue = Queue::new(&mut app, stack, "Jobs", QueueProps::default()).unwrap();
        let role = Role::new(
            &mut app,
            stack,
            "Worker",
            RoleProps::new(Principal::service("lambda.amazonaws.com")),
        )
        .unwrap();
        let grant = queue.grant_consume_messages(&mut app, &role).unwrap();
        assert!(grant.principal_statement.is_some());
        assert!(grant.resource_statement.is_none());
        assert!(app.find_child(queue.node(), "Policy").is_none());
    }

    #[test]
    fn test_service_grant_creates_queue_policy() {
        let (mut app, stack) = app_with_stack();
        let queue = Queue::new(&mut app, stack, "Jobs", QueueProps::default()).unwrap();
        let service = Principal::service("sns.amazonaws.com");
        queue.grant_send_messages(&mut app, &service).unwrap();
        queue.grant_send_messages(&mut app, &service).unwrap();
        let policy = app.find_child(queue.node(), "Policy").unwrap();
        let queue_id = app.logical_id(queue.resource().unwrap());
        let policy_id = app.logical_id(policy);

        let assembly = synthesize(&mut app).unwrap();
        let rendered = assembly.template("Queues").unwrap().resource(&policy_id).unwrap();
        assert_eq!(rendered.resource_type, QUEUE_POLICY_TYPE);
        assert_eq!(rendered.property("Queues").unwrap(), &json!([{"Ref": queue_id}]));
        let statements = rendered.property("PolicyDocument").unwrap()["Statement"].clone();
        assert_eq!(statements.as_array().map(Vec::len), Some(1));
        assert_eq!(statements[0]["Principal"], json!({"Service": "sns.amazonaws.com"}));
        assert_eq!(statements[0]["Resource"], json!({"Fn::GetAtt": [queue_id, "Arn"]}));
    }

    #[test]
    fn test_imported_queue_from_arn() {
        let (mut app, stack) = app_with_stack();
        let queue = Queue::from_queue_arn(
            &mut app,
            stack,
            "Imported",
            "arn:aws:sqs:eu-west-1:222222222222:events.fifo",
        )
        .unwrap();
        assert_eq!(queue.url(), "https://sqs.eu-west-1.amazonaws.com/222222222222/events.fifo");
        assert!(queue.is_fifo());
        let changed = queue
            .add_to_resource_policy(&mut app, PolicyStatement::allow().with_actions(["sqs:*"]))
            .unwrap();
        assert!(!changed);
        assert!(Queue::from_queue_arn(&mut app, stack, "Bad", "not-an-arn").is_err());
    }

    #[test]
    fn test_dead_letter_queue_is_wired() {
        let (mut app, stack) = app_with_stack();
        let dlq = Queue::new(&mut app, stack, "Dead", QueueProps::default()).unwrap();
        let queue = Queue::new(
            &mut app,
            stack,
            "Live",
            QueueProps {
                dead_letter_queue: Some(DeadLetterQueue {
                    queue: dlq.clone(),
                    max_receive_count: 3,
                }),
                ..Default::default()
            },
        )
        .unwrap();
        let dlq_id = app.logical_id(dlq.resource().unwrap());
        let queue_id = app.logical_id(queue.resource().unwrap());
        let assembly = synthesize(&mut app).unwrap();
        let redrive: &Value = assembly
            .template("Queues")
            .unwrap()
            .resource(&queue_id)
            .unwrap()
            .property("RedrivePolicy")
            .unwrap();
        assert_eq!(
            redrive,
            &json!({"DeadLetterTargetArn": {"Fn::GetAtt": [dlq_id, "Arn"]}, "MaxReceiveCount": 3})
        );
    }
}
