//! Event buses.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use canopy_core::{
    contains_token, App, ConstructId, Grant, GrantTarget, PolicyRender, PolicySlot, ResourceNode,
};
use canopy_policy::PolicyStatement;

use super::{DEFAULT_BUS_NAME, EVENT_BUS_TYPE, PUT_EVENTS_ACTION};
use crate::error::{ConstructError, ConstructResult};
use crate::iam::Grantable;

const MAX_BUS_NAME_LENGTH: usize = 256;

fn bus_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[/\.\-_A-Za-z0-9]+$").expect("valid bus name regex"))
}

fn validate_bus_name(name: &str) -> Result<(), String> {
    if contains_token(name) {
        return Ok(());
    }
    if name == DEFAULT_BUS_NAME {
        return Err("a custom event bus cannot be named 'default'".to_string());
    }
    if name.is_empty() || name.len() > MAX_BUS_NAME_LENGTH {
        return Err(format!(
            "event bus name must be 1-{} characters, got {}",
            MAX_BUS_NAME_LENGTH,
            name.len()
        ));
    }
    if !bus_name_pattern().is_match(name) {
        return Err(format!(
            "event bus name '{}' may only contain alphanumerics and '/._-'",
            name
        ));
    }
    Ok(())
}

/// Properties for [`EventBus::new`].
#[derive(Debug, Clone, Default)]
pub struct EventBusProps {
    pub event_bus_name: Option<String>,
    /// Partner event source; the bus takes its name from it.
    pub event_source_name: Option<String>,
}

/// An event bus: a custom bus defined here, or an imported one (including an
/// account's default bus).
#[derive(Debug, Clone)]
pub struct EventBus {
    node: ConstructId,
    resource: Option<ConstructId>,
    name: String,
    arn: String,
}

impl EventBus {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: EventBusProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let name = match (&props.event_bus_name, &props.event_source_name) {
            (Some(_), Some(_)) => {
                return Err(ConstructError::invalid(
                    app.path(node),
                    "set either 'eventBusName' or 'eventSourceName', not both",
                ))
            }
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => app.path(node).replace('/', "-"),
        };
        let name: String = name.chars().take(MAX_BUS_NAME_LENGTH).collect();
        validate_bus_name(&name).map_err(|msg| ConstructError::invalid(app.path(node), msg))?;

        let arn = app.format_arn(scope, "events", None, None, &format!("event-bus/{}", name))?;
        let mut resource = ResourceNode::new(EVENT_BUS_TYPE)
            .with_property("name", name.clone())
            .with_policy(
                PolicySlot::Resource,
                PolicyRender::Property("policy".to_string()),
                false,
            )
            .with_physical_name(name.clone())
            .with_cross_env_attribute("Ref", name.clone())
            .with_cross_env_attribute("Name", name.clone())
            .with_cross_env_attribute("Arn", arn);
        if let Some(source) = &props.event_source_name {
            resource = resource.with_property("eventSourceName", source.clone());
        }
        let resource = app.add_resource(node, "Resource", resource)?;
        debug!("EventBus {} ({})", app.path(node), name);
        Ok(Self {
            node,
            resource: Some(resource),
            name: app.ref_token(resource),
            arn: app.get_att(resource, "Arn"),
        })
    }

    /// The default bus of `account` in `region`.
    pub fn default_bus_in(
        app: &mut App,
        scope: ConstructId,
        id: &str,
        account: &str,
        region: &str,
    ) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let arn = app.format_arn(
            scope,
            "events",
            Some(region),
            Some(account),
            &format!("event-bus/{}", DEFAULT_BUS_NAME),
        )?;
        Ok(Self {
            node,
            resource: None,
            name: DEFAULT_BUS_NAME.to_string(),
            arn,
        })
    }

    /// The default bus of the environment `scope` deploys to.
    pub fn default_bus(app: &mut App, scope: ConstructId, id: &str) -> ConstructResult<Self> {
        let account = app.account(scope)?;
        let region = app.region(scope)?;
        Self::default_bus_in(app, scope, id, &account, &region)
    }

    /// Reference a bus by arn (`arn:aws:events:<region>:<account>:event-bus/<name>`).
    pub fn from_event_bus_arn(app: &mut App, scope: ConstructId, id: &str, arn: &str) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let Some((_, name)) = arn.split_once(":event-bus/") else {
            return Err(ConstructError::invalid(
                app.path(node),
                format!("'{}' is not an event bus arn", arn),
            ));
        };
        Ok(Self {
            node,
            resource: None,
            name: name.to_string(),
            arn: arn.to_string(),
        })
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn resource(&self) -> Option<ConstructId> {
        self.resource
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_BUS_NAME
    }

    pub fn add_to_resource_policy(&self, app: &mut App, statement: PolicyStatement) -> ConstructResult<bool> {
        match self.resource {
            Some(resource) => Ok(app.add_policy_statement(resource, PolicySlot::Resource, statement)?),
            None => Ok(false),
        }
    }

    /// Allow `grantee` to put events on this bus.
    pub fn grant_put_events_to(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        let target = match self.resource {
            Some(resource) => GrantTarget::Owned {
                resource,
                policy_holder: Some(resource),
                arns: vec![self.arn.clone()],
                policy_resources: vec![self.arn.clone()],
            },
            None => GrantTarget::Imported {
                scope: self.node,
                arns: vec![self.arn.clone()],
            },
        };
        Ok(app.grant(&grantee.grantee(), &target, &[PUT_EVENTS_ACTION])?)
    }
}
