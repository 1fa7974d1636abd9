//! Event rules.

use serde_json::Value;
use tracing::{debug, info};

use canopy_core::{App, ConstructId, CoreError, ResourceNode};

use super::relay::EventRelay;
use super::{EventBus, EventPattern, RuleTarget, RuleTargetConfig, Schedule, MAX_TARGETS, RULE_TYPE};
use crate::error::{ConstructError, ConstructResult};

const PATTERN_KEY: &str = "eventPattern";
const SCHEDULE_KEY: &str = "scheduleExpression";
const TARGETS_KEY: &str = "targets";

/// Properties for [`Rule::new`].
#[derive(Debug, Clone, Default)]
pub struct RuleProps {
    pub rule_name: Option<String>,
    pub description: Option<String>,
    /// Defaults to enabled.
    pub enabled: Option<bool>,
    pub event_pattern: Option<EventPattern>,
    pub schedule: Option<Schedule>,
    /// Custom bus to attach to; the account default bus when unset.
    pub event_bus: Option<EventBus>,
}

/// An event rule. Patterns and targets can be added after creation.
#[derive(Debug, Clone)]
pub struct Rule {
    node: ConstructId,
    resource: ConstructId,
    arn: String,
    name: String,
}

fn check_rule(app: &App, resource: ConstructId) -> Vec<String> {
    let Some(node) = app.resource(resource) else {
        return Vec::new();
    };
    let pattern = node.property(PATTERN_KEY).and_then(EventPattern::from_json);
    let has_schedule = node.property(SCHEDULE_KEY).is_some_and(|v| !v.is_null());
    let mut errors = Vec::new();
    match &pattern {
        Some(pattern) if !pattern.is_empty() => errors.extend(pattern.validate()),
        _ if !has_schedule => {
            errors.push("either an event pattern or a schedule must be defined".to_string())
        }
        _ => {}
    }
    errors
}

impl Rule {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: RuleProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let custom_bus = props.event_bus.as_ref().filter(|bus| !bus.is_default());
        if props.schedule.is_some() && custom_bus.is_some() {
            return Err(ConstructError::invalid(
                app.path(node),
                "scheduled rules can only be attached to the default event bus",
            ));
        }

        let enabled = props.enabled.unwrap_or(true);
        let mut resource = ResourceNode::new(RULE_TYPE)
            .with_property("state", if enabled { "ENABLED" } else { "DISABLED" })
            .raw_key(PATTERN_KEY)
            .raw_key(TARGETS_KEY);
        if let Some(description) = &props.description {
            resource = resource.with_property("description", description.clone());
        }
        if let Some(bus) = custom_bus {
            resource = resource.with_property("eventBusName", bus.name());
        }
        if let Some(schedule) = &props.schedule {
            resource = resource.with_property(SCHEDULE_KEY, schedule.expression());
        }
        if let Some(pattern) = props.event_pattern.as_ref().filter(|p| !p.is_empty()) {
            resource = resource.with_property(PATTERN_KEY, pattern.to_json());
        }
        if let Some(name) = &props.rule_name {
            let arn = app.format_arn(scope, "events", None, None, &format!("rule/{}", name))?;
            resource = resource
                .with_property("name", name.clone())
                .with_physical_name(name.clone())
                .with_cross_env_attribute("Arn", arn);
        }

        let resource = app.add_resource(node, "Resource", resource)?;
        app.add_validation(node, move |app, _| check_rule(app, resource))?;
        debug!("Rule {}", app.path(node));
        Ok(Self::from_resource(app, node, resource))
    }

    fn from_resource(app: &mut App, node: ConstructId, resource: ConstructId) -> Self {
        Self {
            node,
            resource,
            arn: app.get_att(resource, "Arn"),
            name: app.ref_token(resource),
        }
    }

    /// Handle for a rule created earlier under `node`.
    pub(crate) fn from_node(app: &mut App, node: ConstructId) -> ConstructResult<Self> {
        let resource = app
            .find_child(node, "Resource")
            .filter(|r| app.resource(*r).is_some_and(|n| n.resource_type() == RULE_TYPE))
            .ok_or_else(|| ConstructError::invalid(app.path(node), "construct is not a rule"))?;
        Ok(Self::from_resource(app, node, resource))
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn resource(&self) -> ConstructId {
        self.resource
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pattern as it stands now.
    pub fn event_pattern(&self, app: &App) -> Option<EventPattern> {
        app.resource(self.resource)
            .and_then(|node| node.property(PATTERN_KEY))
            .and_then(EventPattern::from_json)
    }

    /// Union `pattern` into the rule's pattern.
    pub fn add_event_pattern(&self, app: &mut App, pattern: &EventPattern) -> ConstructResult<()> {
        let mut merged = self.event_pattern(app).unwrap_or_default();
        merged.merge(pattern);
        if !merged.is_empty() {
            app.resource_mut(self.resource)?
                .set_property(PATTERN_KEY, merged.to_json());
        }
        Ok(())
    }

    pub fn target_count(&self, app: &App) -> usize {
        app.resource(self.resource)
            .and_then(|node| node.property(TARGETS_KEY))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    /// Add a target. Targets in another account or region are reached
    /// through that environment's default bus; see [`EventRelay`].
    pub fn add_target<T>(&self, app: &mut App, target: T) -> ConstructResult<()>
    where
        T: RuleTarget + 'static,
    {
        if let Some(scope) = target.target_scope() {
            let ours = app.environment(self.node)?.clone();
            let theirs = app.environment(scope)?.clone();
            if ours != theirs {
                if !ours.is_concrete() || !theirs.is_concrete() {
                    return Err(CoreError::UnknownEnvironment {
                        path: app.path(self.node),
                        message: format!(
                            "cannot route events from {} to a target in {}; both environments must be known",
                            ours, theirs
                        ),
                    }
                    .into());
                }
                let target_stack = app.stack_of(scope)?;
                info!(
                    "Routing {} to {} through the default event bus of {}",
                    app.path(self.node),
                    app.path(scope),
                    theirs
                );
                app.add_linker(Box::new(EventRelay::new(self.clone(), Box::new(target), target_stack)))?;
                return Ok(());
            }
        }
        self.bind_target(app, &target)?;
        Ok(())
    }

    /// Bind `target` against this rule and append it. Returns the target id.
    pub(crate) fn bind_target(&self, app: &mut App, target: &dyn RuleTarget) -> ConstructResult<String> {
        self.check_capacity(app)?;
        let config = target.bind(app, self)?;
        self.append_target(app, &config)
    }

    fn check_capacity(&self, app: &App) -> ConstructResult<()> {
        if self.target_count(app) >= MAX_TARGETS {
            return Err(ConstructError::invalid(
                app.path(self.node),
                format!("a rule can have at most {} targets", MAX_TARGETS),
            ));
        }
        Ok(())
    }

    pub(crate) fn append_target(&self, app: &mut App, config: &RuleTargetConfig) -> ConstructResult<String> {
        self.check_capacity(app)?;
        let index = self.target_count(app);
        let id = format!("Target{}", index);
        let entry = config.to_json(&id);
        let node = app.resource_mut(self.resource)?;
        match node.property(TARGETS_KEY).cloned() {
            Some(Value::Array(mut targets)) => {
                targets.push(entry);
                node.set_property(TARGETS_KEY, Value::Array(targets));
            }
            _ => node.set_property(TARGETS_KEY, Value::Array(vec![entry])),
        }
        Ok(id)
    }

    /// Whether a target with this arn is already attached.
    pub(crate) fn has_target_arn(&self, app: &App, arn: &str) -> bool {
        app.resource(self.resource)
            .and_then(|node| node.property(TARGETS_KEY))
            .and_then(Value::as_array)
            .is_some_and(|targets| targets.iter().any(|t| t.get("Arn").and_then(Value::as_str) == Some(arn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBusProps, SqsQueue, TimeUnit};
    use crate::sqs::{Queue, QueueProps};
    use canopy_core::{synthesize, ErrorKind, StackProps};
    use serde_json::json;

    fn app_with_stack() -> (App, ConstructId) {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Events", StackProps::default()).unwrap();
        (app, stack)
    }

    #[test]
    fn test_rule_without_pattern_or_schedule_fails_validation() {
        let (mut app, stack) = app_with_stack();
        Rule::new(&mut app, stack, "Empty", RuleProps::default()).unwrap();
        let err = synthesize(&mut app).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
        assert!(err.to_string().contains("Events/Empty"));
        assert!(err.to_string().contains("event pattern or a schedule"));
    }

    #[test]
    fn test_pattern_added_later_satisfies_validation() {
        let (mut app, stack) = app_with_stack();
        let rule = Rule::new(&mut app, stack, "Late", RuleProps::default()).unwrap();
        rule.add_event_pattern(&mut app, &EventPattern::new().with_source(["orders"]))
            .unwrap();
        rule.add_event_pattern(&mut app, &EventPattern::new().with_source(["billing"]))
            .unwrap();
        let logical_id = app.logical_id(rule.resource());
        let assembly = synthesize(&mut app).unwrap();
        let rendered = assembly.template("Events").unwrap().resource(&logical_id).unwrap();
        assert_eq!(
            rendered.property("EventPattern").unwrap(),
            &json!({"source": ["orders", "billing"]})
        );
        assert_eq!(rendered.property("State").unwrap(), &json!("ENABLED"));
    }

    #[test]
    fn test_schedule_on_custom_bus_is_rejected() {
        let (mut app, stack) = app_with_stack();
        let bus = EventBus::new(&mut app, stack, "Bus", EventBusProps::default()).unwrap();
        let err = Rule::new(
            &mut app,
            stack,
            "Nightly",
            RuleProps {
                schedule: Some(Schedule::rate(1, TimeUnit::Day).unwrap()),
                event_bus: Some(bus),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("default event bus"));
    }

    #[test]
    fn test_at_most_five_targets() {
        let (mut app, stack) = app_with_stack();
        let rule = Rule::new(
            &mut app,
            stack,
            "Fanout",
            RuleProps {
                schedule: Some(Schedule::rate(5, TimeUnit::Minute).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..MAX_TARGETS {
            let queue = Queue::new(&mut app, stack, &format!("Queue{}", i), QueueProps::default()).unwrap();
            rule.add_target(&mut app, SqsQueue::new(queue)).unwrap();
        }
        let extra = Queue::new(&mut app, stack, "Extra", QueueProps::default()).unwrap();
        let err = rule.add_target(&mut app, SqsQueue::new(extra)).unwrap_err();
        assert!(err.to_string().contains("at most 5 targets"));
        assert_eq!(rule.target_count(&app), MAX_TARGETS);
    }

    #[test]
    fn test_queue_target_is_scoped_to_the_rule() {
        let (mut app, stack) = app_with_stack();
        let queue = Queue::new(&mut app, stack, "Jobs", QueueProps::default()).unwrap();
        let rule = Rule::new(
            &mut app,
            stack,
            "OnOrder",
            RuleProps {
                event_pattern: Some(EventPattern::new().with_source(["orders"])),
                ..Default::default()
            },
        )
        .unwrap();
        rule.add_target(&mut app, SqsQueue::new(queue.clone())).unwrap();
        let rule_id = app.logical_id(rule.resource());
        let queue_id = app.logical_id(queue.resource().unwrap());
        let policy_id = app.logical_id(app.find_child(queue.node(), "Policy").unwrap());

        let assembly = synthesize(&mut app).unwrap();
        let template = assembly.template("Events").unwrap();
        let targets = template.resource(&rule_id).unwrap().property("Targets").unwrap();
        assert_eq!(
            targets,
            &json!([{"Id": "Target0", "Arn": {"Fn::GetAtt": [queue_id, "Arn"]}}])
        );
        let statement = template
            .resource(&policy_id)
            .unwrap()
            .property("PolicyDocument")
            .unwrap()["Statement"][0]
            .clone();
        assert_eq!(statement["Principal"], json!({"Service": "events.amazonaws.com"}));
        assert_eq!(
            statement["Condition"],
            json!({"ArnEquals": {"aws:SourceArn": {"Fn::GetAtt": [rule_id, "Arn"]}}})
        );
    }
}
