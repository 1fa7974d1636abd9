//! Event rules, buses and targets.
//!
//! Rules match events by [`EventPattern`] or fire on a [`Schedule`], and
//! deliver to up to five [`RuleTarget`]s. Targets in another account or
//! region are reached through an [`EventRelay`].

pub mod bus;
pub mod pattern;
pub mod relay;
pub mod rule;
pub mod schedule;
pub mod targets;

pub use bus::{EventBus, EventBusProps};
pub use pattern::EventPattern;
pub use relay::EventRelay;
pub use rule::{Rule, RuleProps};
pub use schedule::{CronOptions, Schedule, TimeUnit};
pub use targets::{
    singleton_events_role, EventBusTarget, RetryPolicy, RuleTarget, RuleTargetConfig,
    RuleTargetInput, SqsQueue,
};

pub const RULE_TYPE: &str = "AWS::Events::Rule";
pub const EVENT_BUS_TYPE: &str = "AWS::Events::EventBus";
pub const EVENT_BUS_POLICY_TYPE: &str = "AWS::Events::EventBusPolicy";

pub const DEFAULT_BUS_NAME: &str = "default";
pub const EVENTS_SERVICE: &str = "events.amazonaws.com";
pub const PUT_EVENTS_ACTION: &str = "events:PutEvents";

/// Targets per rule.
pub const MAX_TARGETS: usize = 5;
