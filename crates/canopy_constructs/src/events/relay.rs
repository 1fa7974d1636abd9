//! Cross-environment event routing.
//!
//! A rule in stack A cannot target a resource in another account or region
//! directly. Instead A sends matching events to the default bus of the
//! target's environment, and a forwarding rule there (same pattern) delivers
//! them to the real target:
//!
//! - in B: an event bus policy letting A's account put events, and the
//!   forwarding rule;
//! - in A: a role allowed to put events on B's default bus, and a rule
//!   target pointing at that bus.
//!
//! Relay resources are created once per (rule, target stack).

use serde_json::json;
use tracing::debug;

use canopy_core::{App, ConstructId, CoreResult, Linker, ResourceNode};
use canopy_policy::{PolicyStatement, Principal};

use super::{
    EventPattern, Rule, RuleProps, RuleTarget, RuleTargetConfig, DEFAULT_BUS_NAME,
    EVENTS_SERVICE, EVENT_BUS_POLICY_TYPE, PUT_EVENTS_ACTION,
};
use crate::error::{ConstructError, ConstructResult};
use crate::iam::{Role, RoleProps};

const MAX_STATEMENT_ID_LENGTH: usize = 64;

fn alphanumeric(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Deferred routing of one rule target into another environment.
pub struct EventRelay {
    rule: Rule,
    target: Box<dyn RuleTarget>,
    target_stack: ConstructId,
}

impl EventRelay {
    pub(crate) fn new(rule: Rule, target: Box<dyn RuleTarget>, target_stack: ConstructId) -> Self {
        Self {
            rule,
            target,
            target_stack,
        }
    }

    fn relay(&self, app: &mut App) -> ConstructResult<()> {
        let rule_node = self.rule.node();
        let source_stack = app.stack_of(rule_node)?;
        let source = app.require_concrete_env(rule_node, "cross-environment event routing")?;
        let target = app.require_concrete_env(self.target_stack, "cross-environment event routing")?;
        let (Some(source_account), Some(target_account), Some(target_region)) =
            (source.account.clone(), target.account.clone(), target.region.clone())
        else {
            return Ok(());
        };
        let pattern = self
            .rule
            .event_pattern(app)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ConstructError::invalid(
                    app.path(rule_node),
                    "routing events to another account or region requires an event pattern",
                )
            })?;

        let relay_id = format!("Relay-{}", app.path(rule_node).replace('/', "-"));
        let forward = match app.find_child(self.target_stack, &relay_id) {
            Some(container) => {
                let node = app.find_child(container, "Rule").ok_or_else(|| {
                    ConstructError::invalid(app.path(container), "relay has no forwarding rule")
                })?;
                Rule::from_node(app, node)?
            }
            None => self.create_target_side(app, &relay_id, &source_account, &pattern)?,
        };
        forward.bind_target(app, self.target.as_ref())?;

        let role_id = format!("{}RelayRole", alphanumeric(app.stack(self.target_stack)?.name()));
        if app.find_child(rule_node, &role_id).is_none() {
            let bus_arn = app.format_arn(
                rule_node,
                "events",
                Some(&target_region),
                Some(&target_account),
                &format!("event-bus/{}", DEFAULT_BUS_NAME),
            )?;
            let role = Role::new(
                app,
                rule_node,
                &role_id,
                RoleProps::new(Principal::service(EVENTS_SERVICE)),
            )?;
            role.add_to_principal_policy(
                app,
                PolicyStatement::allow()
                    .with_actions([PUT_EVENTS_ACTION])
                    .with_resources([bus_arn.clone()]),
            )?;
            if !self.rule.has_target_arn(app, &bus_arn) {
                let mut config = RuleTargetConfig::new(bus_arn);
                config.role_arn = Some(role.arn().to_string());
                self.rule.append_target(app, &config)?;
            }
            app.add_stack_dependency(source_stack, self.target_stack)?;
        }
        Ok(())
    }

    fn create_target_side(
        &self,
        app: &mut App,
        relay_id: &str,
        source_account: &str,
        pattern: &EventPattern,
    ) -> ConstructResult<Rule> {
        let rule_path = app.path(self.rule.node());
        let container = app.add_construct(self.target_stack, relay_id)?;

        let statement_id: String = format!("allow-account-{}-{}", source_account, alphanumeric(&rule_path))
            .chars()
            .take(MAX_STATEMENT_ID_LENGTH)
            .collect();
        app.add_resource(
            container,
            "BusPolicy",
            ResourceNode::new(EVENT_BUS_POLICY_TYPE)
                .with_property("eventBusName", DEFAULT_BUS_NAME)
                .with_property("statementId", statement_id)
                .with_property("action", PUT_EVENTS_ACTION)
                .with_property("principal", source_account),
        )?;

        let forward = Rule::new(
            app,
            container,
            "Rule",
            RuleProps {
                description: Some(format!("Forwards events matched by {}", rule_path)),
                event_pattern: Some(pattern.clone()),
                ..Default::default()
            },
        )?;
        app.add_metadata(
            container,
            "canopy:event-relay",
            json!({ "source": rule_path, "sourceAccount": source_account }),
        )?;
        debug!("Created event relay {} for {}", app.path(container), rule_path);
        Ok(forward)
    }
}

impl Linker for EventRelay {
    fn name(&self) -> &str {
        "event-relay"
    }

    fn link(&self, app: &mut App) -> CoreResult<()> {
        self.relay(app).map_err(ConstructError::into_core)
    }
}
