//! IAM roles and the grantee abstraction used by every grant method.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use canopy_core::{
    App, ConstructId, Grantee, PolicyRender, PolicySlot, ResourceNode, TagFormat,
};
use canopy_policy::{PolicyDocument, PolicyStatement, Principal};

use crate::error::{ConstructError, ConstructResult};

pub const ROLE_TYPE: &str = "AWS::IAM::Role";

const MIN_SESSION_SECS: u32 = 3_600;
const MAX_SESSION_SECS: u32 = 43_200;

/// Anything that can be named in a grant.
pub trait Grantable {
    fn grantee(&self) -> Grantee;
}

impl Grantable for Principal {
    fn grantee(&self) -> Grantee {
        Grantee::principal(self.clone())
    }
}

impl Grantable for Grantee {
    fn grantee(&self) -> Grantee {
        self.clone()
    }
}

/// Properties for [`Role::new`].
#[derive(Debug, Clone)]
pub struct RoleProps {
    pub assumed_by: Principal,
    pub role_name: Option<String>,
    pub description: Option<String>,
    pub path: Option<String>,
    pub managed_policy_arns: Vec<String>,
    pub inline_policies: BTreeMap<String, PolicyDocument>,
    pub max_session_duration_secs: Option<u32>,
}

impl RoleProps {
    pub fn new(assumed_by: Principal) -> Self {
        Self {
            assumed_by,
            role_name: None,
            description: None,
            path: None,
            managed_policy_arns: Vec::new(),
            inline_policies: BTreeMap::new(),
            max_session_duration_secs: None,
        }
    }

    pub fn with_role_name(mut self, name: impl Into<String>) -> Self {
        self.role_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_managed_policy(mut self, arn: impl Into<String>) -> Self {
        self.managed_policy_arns.push(arn.into());
        self
    }

    pub fn with_inline_policy(mut self, name: impl Into<String>, document: PolicyDocument) -> Self {
        self.inline_policies.insert(name.into(), document);
        self
    }
}

fn role_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\w+=,.@-]{1,64}$").expect("valid role name regex"))
}

fn validate_props(props: &RoleProps) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(name) = &props.role_name {
        if !canopy_core::contains_token(name) && !role_name_pattern().is_match(name) {
            errors.push(format!(
                "role name '{}' must be 1-64 characters of [A-Za-z0-9+=,.@_-]",
                name
            ));
        }
    }
    if let Some(path) = &props.path {
        if !path.starts_with('/') || !path.ends_with('/') || path.len() > 512 {
            errors.push(format!(
                "role path '{}' must start and end with '/' and be at most 512 characters",
                path
            ));
        }
    }
    if let Some(secs) = props.max_session_duration_secs {
        if !(MIN_SESSION_SECS..=MAX_SESSION_SECS).contains(&secs) {
            errors.push(format!(
                "max session duration must be between {} and {} seconds, got {}",
                MIN_SESSION_SECS, MAX_SESSION_SECS, secs
            ));
        }
    }
    errors
}

/// An IAM role, either defined here or imported by arn.
#[derive(Debug, Clone)]
pub struct Role {
    node: ConstructId,
    resource: Option<ConstructId>,
    arn: String,
    name: String,
    /// Arn built from the physical name, usable in other stacks' policies.
    physical_arn: Option<String>,
}

impl Role {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: RoleProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let errors = validate_props(&props);
        if !errors.is_empty() {
            return Err(ConstructError::invalid(app.path(node), errors.join("; ")));
        }

        let mut resource = ResourceNode::new(ROLE_TYPE)
            .with_policy(
                PolicySlot::AssumeRole,
                PolicyRender::Property("assumeRolePolicyDocument".to_string()),
                true,
            )
            .with_policy(
                PolicySlot::Identity,
                PolicyRender::InlinePolicies {
                    policy_name: format!("{}DefaultPolicy", app.node(node).id()),
                },
                false,
            )
            .taggable(TagFormat::Standard)
            .raw_key("policies");
        if let Some(description) = &props.description {
            resource = resource.with_property("description", description.clone());
        }
        if let Some(path) = &props.path {
            resource = resource.with_property("path", path.clone());
        }
        if let Some(secs) = props.max_session_duration_secs {
            resource = resource.with_property("maxSessionDuration", secs);
        }
        if !props.managed_policy_arns.is_empty() {
            resource = resource.with_property("managedPolicyArns", json!(props.managed_policy_arns));
        }
        let inline: Vec<Value> = props
            .inline_policies
            .iter()
            .filter_map(|(name, doc)| {
                doc.to_json()
                    .map(|doc| json!({ "PolicyName": name, "PolicyDocument": doc }))
            })
            .collect();
        if !inline.is_empty() {
            resource = resource.with_property("policies", Value::Array(inline));
        }
        let mut physical_arn = None;
        if let Some(name) = &props.role_name {
            let arn = app.format_arn(scope, "iam", Some(""), None, &format!("role/{}", name))?;
            resource = resource
                .with_property("roleName", name.clone())
                .with_physical_name(name.clone())
                .with_cross_env_attribute("Ref", name.clone())
                .with_cross_env_attribute("Arn", arn.clone());
            physical_arn = Some(arn);
        }

        let resource = app.add_resource(node, "Resource", resource)?;
        let statement = PolicyStatement::allow()
            .with_actions([props.assumed_by.assume_role_action().to_string()])
            .with_principal(props.assumed_by.clone());
        app.add_policy_statement(resource, PolicySlot::AssumeRole, statement)?;

        let arn = app.get_att(resource, "Arn");
        let name = app.ref_token(resource);
        debug!("Role {}", app.path(node));
        Ok(Self {
            node,
            resource: Some(resource),
            arn,
            name,
            physical_arn,
        })
    }

    /// Reference an existing role. Its identity policy cannot be edited.
    pub fn from_role_arn(app: &mut App, scope: ConstructId, id: &str, arn: &str) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let name = arn
            .rsplit_once('/')
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| arn.to_string());
        Ok(Self {
            node,
            resource: None,
            arn: arn.to_string(),
            name,
            physical_arn: None,
        })
    }

    /// Handle for a role created earlier, given its construct and resource.
    pub(crate) fn from_resource(app: &mut App, node: ConstructId, resource: ConstructId) -> Self {
        Self {
            node,
            resource: Some(resource),
            arn: app.get_att(resource, "Arn"),
            name: app.ref_token(resource),
            physical_arn: None,
        }
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_imported(&self) -> bool {
        self.resource.is_none()
    }

    /// Add a statement to the role's identity policy. Imported roles accept
    /// nothing and return `false`.
    pub fn add_to_principal_policy(
        &self,
        app: &mut App,
        statement: PolicyStatement,
    ) -> ConstructResult<bool> {
        match self.resource {
            Some(resource) => Ok(app.add_policy_statement(resource, PolicySlot::Identity, statement)?),
            None => Ok(false),
        }
    }
}

impl Grantable for Role {
    fn grantee(&self) -> Grantee {
        Grantee {
            principal: Principal::role(self.physical_arn.as_ref().unwrap_or(&self.arn).clone()),
            identity: self.resource,
        }
    }
}
