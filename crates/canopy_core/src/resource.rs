//! Resource nodes: the provider-level building block every construct lowers to.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use canopy_policy::{PolicyDocument, PolicyStatement};

use crate::app::App;
use crate::construct::{ConstructId, NodeKind};
use crate::error::{CoreError, CoreResult};

/// What happens to a resource when it leaves the template or is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    Retain,
    Destroy,
    Snapshot,
}

impl RemovalPolicy {
    /// Value of `DeletionPolicy` / `UpdateReplacePolicy`.
    pub fn as_template_value(&self) -> &'static str {
        match self {
            RemovalPolicy::Retain => "Retain",
            RemovalPolicy::Destroy => "Delete",
            RemovalPolicy::Snapshot => "Snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Some(Self::Retain),
            "destroy" | "delete" => Some(Self::Destroy),
            "snapshot" => Some(Self::Snapshot),
            _ => None,
        }
    }
}

impl fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_template_value())
    }
}

/// How a taggable resource renders its `Tags` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagFormat {
    /// `[{"Key": .., "Value": ..}]`, sorted by key.
    Standard,
    /// `{"key": "value"}`.
    Map,
}

/// Role of a policy document attached to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicySlot {
    /// Who may act on this resource.
    Resource,
    /// What this identity may do.
    Identity,
    /// Who may assume this role.
    AssumeRole,
}

/// Where a policy document lands in the rendered properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRender {
    /// Under a property key (camelCase, mapped like any other key).
    Property(String),
    /// Appended to `Policies` as `{PolicyName, PolicyDocument}`.
    InlinePolicies { policy_name: String },
}

#[derive(Debug, Clone)]
pub struct AttachedPolicy {
    pub slot: PolicySlot,
    pub document: PolicyDocument,
    pub render: PolicyRender,
    /// An empty required document fails validation.
    pub required: bool,
}

/// A provider resource: type, property bag and rendering options.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub(crate) resource_type: String,
    pub(crate) properties: Map<String, Value>,
    pub(crate) raw_keys: BTreeSet<String>,
    pub(crate) required_keys: BTreeSet<String>,
    pub(crate) removal_policy: Option<RemovalPolicy>,
    pub(crate) default_removal_policy: RemovalPolicy,
    pub(crate) supports_snapshot: bool,
    pub(crate) tag_format: Option<TagFormat>,
    pub(crate) depends_on: Vec<ConstructId>,
    pub(crate) overrides: Vec<(String, Option<Value>)>,
    pub(crate) logical_id_override: Option<String>,
    pub(crate) policies: Vec<AttachedPolicy>,
    pub(crate) physical_name: Option<String>,
    pub(crate) cross_env_attributes: BTreeMap<String, Value>,
    pub(crate) template_metadata: Map<String, Value>,
    pub(crate) condition: Option<String>,
}

impl ResourceNode {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: Map::new(),
            raw_keys: BTreeSet::new(),
            required_keys: BTreeSet::new(),
            removal_policy: None,
            default_removal_policy: RemovalPolicy::Destroy,
            supports_snapshot: false,
            tag_format: None,
            depends_on: Vec::new(),
            overrides: Vec::new(),
            logical_id_override: None,
            policies: Vec::new(),
            physical_name: None,
            cross_env_attributes: BTreeMap::new(),
            template_metadata: Map::new(),
            condition: None,
        }
    }

    /// Set a camelCase property.
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Merge every entry of a JSON object into the property bag.
    pub fn with_properties(mut self, properties: Value) -> Self {
        if let Value::Object(map) = properties {
            self.properties.extend(map);
        }
        self
    }

    /// Keep nested keys of this property verbatim.
    pub fn raw_key(mut self, key: &str) -> Self {
        self.raw_keys.insert(key.to_string());
        self
    }

    /// Render this property even when it is an empty list or map.
    pub fn required_key(mut self, key: &str) -> Self {
        self.required_keys.insert(key.to_string());
        self
    }

    pub fn default_removal(mut self, policy: RemovalPolicy) -> Self {
        self.default_removal_policy = policy;
        self
    }

    pub fn supports_snapshot(mut self) -> Self {
        self.supports_snapshot = true;
        self
    }

    pub fn taggable(mut self, format: TagFormat) -> Self {
        self.tag_format = Some(format);
        self
    }

    pub fn with_physical_name(mut self, name: impl Into<String>) -> Self {
        self.physical_name = Some(name.into());
        self
    }

    /// Value used in place of `Ref` (`"Ref"`) or an attribute when the
    /// resource is referenced from another account.
    pub fn with_cross_env_attribute(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.cross_env_attributes
            .insert(attribute.to_string(), value.into());
        self
    }

    pub fn with_policy(mut self, slot: PolicySlot, render: PolicyRender, required: bool) -> Self {
        self.policies.push(AttachedPolicy {
            slot,
            document: PolicyDocument::new(),
            render,
            required,
        });
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<Value>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn mark_raw(&mut self, key: &str) {
        self.raw_keys.insert(key.to_string());
    }

    pub fn physical_name(&self) -> Option<&str> {
        self.physical_name.as_deref()
    }

    pub fn set_physical_name(&mut self, name: impl Into<String>) {
        self.physical_name = Some(name.into());
    }

    pub fn set_cross_env_attribute(&mut self, attribute: &str, value: impl Into<Value>) {
        self.cross_env_attributes
            .insert(attribute.to_string(), value.into());
    }

    pub fn cross_env_attribute(&self, attribute: &str) -> Option<&Value> {
        self.cross_env_attributes.get(attribute)
    }

    pub fn is_taggable(&self) -> bool {
        self.tag_format.is_some()
    }

    pub fn tag_format(&self) -> Option<TagFormat> {
        self.tag_format
    }

    pub fn removal_policy(&self) -> Option<RemovalPolicy> {
        self.removal_policy
    }

    pub fn depends_on(&self) -> &[ConstructId] {
        &self.depends_on
    }

    pub fn policy(&self, slot: PolicySlot) -> Option<&PolicyDocument> {
        self.policies
            .iter()
            .find(|p| p.slot == slot)
            .map(|p| &p.document)
    }

    pub fn policy_mut(&mut self, slot: PolicySlot) -> Option<&mut PolicyDocument> {
        self.policies
            .iter_mut()
            .find(|p| p.slot == slot)
            .map(|p| &mut p.document)
    }

    pub fn attached_policies(&self) -> &[AttachedPolicy] {
        &self.policies
    }
}

impl App {
    /// Add a resource to the tree. The resource belongs to the nearest stack
    /// at or above `scope`.
    pub fn add_resource(
        &mut self,
        scope: ConstructId,
        id: &str,
        resource: ResourceNode,
    ) -> CoreResult<ConstructId> {
        self.stack_of(scope)?;
        let resource_type = resource.resource_type.clone();
        let handle = self.attach(scope, id, NodeKind::Resource(Box::new(resource)))?;
        debug!("Resource {} ({})", self.path(handle), resource_type);
        Ok(handle)
    }

    fn resource_or_err(&self, id: ConstructId) -> CoreResult<&ResourceNode> {
        self.resource(id)
            .ok_or_else(|| CoreError::invalid(self.path(id), "construct is not a resource"))
    }

    /// Set the removal policy of a resource.
    pub fn apply_removal_policy(
        &mut self,
        resource: ConstructId,
        policy: RemovalPolicy,
    ) -> CoreResult<()> {
        let path = self.path(resource);
        let node = self.resource_mut(resource)?;
        if policy == RemovalPolicy::Snapshot && !node.supports_snapshot {
            return Err(CoreError::invalid(
                path,
                format!(
                    "{} does not support the snapshot removal policy",
                    node.resource_type
                ),
            ));
        }
        node.removal_policy = Some(policy);
        Ok(())
    }

    /// Removal policy after applying precedence: explicit, then the stack
    /// default, then the resource type default.
    pub fn effective_removal_policy(&self, resource: ConstructId) -> CoreResult<RemovalPolicy> {
        let node = self.resource_or_err(resource)?;
        if let Some(explicit) = node.removal_policy {
            return Ok(explicit);
        }
        let stack = self.stack(self.stack_of(resource)?)?;
        match stack.default_removal_policy {
            Some(RemovalPolicy::Snapshot) if !node.supports_snapshot => {
                Ok(node.default_removal_policy)
            }
            Some(policy) => Ok(policy),
            None => Ok(node.default_removal_policy),
        }
    }

    /// Override a rendered property by dot path (`Properties.A.B`, or a path
    /// relative to `Properties`). `null` deletes.
    pub fn add_property_override(
        &mut self,
        resource: ConstructId,
        path: &str,
        value: Value,
    ) -> CoreResult<()> {
        if path.is_empty() {
            return Err(CoreError::invalid(self.path(resource), "empty override path"));
        }
        let entry = if value.is_null() { None } else { Some(value) };
        self.resource_mut(resource)?
            .overrides
            .push((path.to_string(), entry));
        Ok(())
    }

    pub fn add_property_deletion_override(
        &mut self,
        resource: ConstructId,
        path: &str,
    ) -> CoreResult<()> {
        self.add_property_override(resource, path, Value::Null)
    }

    /// Order `resource` after `other`. Edges between stacks become stack
    /// dependencies during linking.
    pub fn add_depends_on(&mut self, resource: ConstructId, other: ConstructId) -> CoreResult<()> {
        if resource == other {
            return Err(CoreError::invalid(
                self.path(resource),
                "a resource cannot depend on itself",
            ));
        }
        self.resource_or_err(other)?;
        let node = self.resource_mut(resource)?;
        if !node.depends_on.contains(&other) {
            node.depends_on.push(other);
        }
        Ok(())
    }

    /// Add a metadata entry rendered under the resource's `Metadata`.
    pub fn add_resource_metadata(
        &mut self,
        resource: ConstructId,
        key: &str,
        value: Value,
    ) -> CoreResult<()> {
        self.resource_mut(resource)?
            .template_metadata
            .insert(key.to_string(), value);
        Ok(())
    }

    /// `{"Ref": ..}` token for a resource.
    pub fn ref_token(&mut self, resource: ConstructId) -> String {
        let hint = self.node(resource).id().to_string();
        let id = self.tokens.reference(resource, &hint);
        self.tokens.encoded(id)
    }

    /// `{"Fn::GetAtt": ..}` token for a resource attribute.
    pub fn get_att(&mut self, resource: ConstructId, attribute: &str) -> String {
        let hint = format!("{}.{}", self.node(resource).id(), attribute);
        let id = self.tokens.attribute(resource, attribute, &hint);
        self.tokens.encoded(id)
    }

    /// Append a statement to one of a resource's attached policies. Returns
    /// whether the document changed.
    pub fn add_policy_statement(
        &mut self,
        resource: ConstructId,
        slot: PolicySlot,
        statement: PolicyStatement,
    ) -> CoreResult<bool> {
        let path = self.path(resource);
        let node = self.resource_mut(resource)?;
        let resource_type = node.resource_type.clone();
        let document = node.policy_mut(slot).ok_or_else(|| {
            CoreError::invalid(
                path,
                format!("{} has no {:?} policy", resource_type, slot),
            )
        })?;
        Ok(document.add_statement(statement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackProps;

    fn app_with_stack() -> (App, ConstructId) {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Stack", StackProps::default()).unwrap();
        (app, stack)
    }

    #[test]
    fn test_resource_requires_stack() {
        let mut app = App::new();
        let root = app.root();
        let err = app
            .add_resource(root, "Loose", ResourceNode::new("AWS::SQS::Queue"))
            .unwrap_err();
        assert!(err.to_string().contains("not defined within a stack"));
    }

    #[test]
    fn test_removal_policy_precedence() {
        let mut app = App::new();
        let root = app.root();
        let props = StackProps {
            default_removal_policy: Some(RemovalPolicy::Retain),
            ..Default::default()
        };
        let stack = app.add_stack(root, "Stack", props).unwrap();
        let queue = app
            .add_resource(stack, "Queue", ResourceNode::new("AWS::SQS::Queue"))
            .unwrap();
        assert_eq!(
            app.effective_removal_policy(queue).unwrap(),
            RemovalPolicy::Retain
        );

        app.apply_removal_policy(queue, RemovalPolicy::Destroy).unwrap();
        assert_eq!(
            app.effective_removal_policy(queue).unwrap(),
            RemovalPolicy::Destroy
        );
    }

    #[test]
    fn test_type_default_applies_without_stack_default() {
        let (mut app, stack) = app_with_stack();
        let key = app
            .add_resource(
                stack,
                "Key",
                ResourceNode::new("AWS::KMS::Key").default_removal(RemovalPolicy::Retain),
            )
            .unwrap();
        assert_eq!(
            app.effective_removal_policy(key).unwrap(),
            RemovalPolicy::Retain
        );
    }

    #[test]
    fn test_snapshot_rejected_when_unsupported() {
        let (mut app, stack) = app_with_stack();
        let queue = app
            .add_resource(stack, "Queue", ResourceNode::new("AWS::SQS::Queue"))
            .unwrap();
        assert!(app.apply_removal_policy(queue, RemovalPolicy::Snapshot).is_err());

        let fs = app
            .add_resource(
                stack,
                "Fs",
                ResourceNode::new("AWS::EFS::FileSystem").supports_snapshot(),
            )
            .unwrap();
        assert!(app.apply_removal_policy(fs, RemovalPolicy::Snapshot).is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let (mut app, stack) = app_with_stack();
        let queue = app
            .add_resource(stack, "Queue", ResourceNode::new("AWS::SQS::Queue"))
            .unwrap();
        assert!(app.add_depends_on(queue, queue).is_err());
    }

    #[test]
    fn test_policy_statement_requires_slot() {
        let (mut app, stack) = app_with_stack();
        let queue = app
            .add_resource(stack, "Queue", ResourceNode::new("AWS::SQS::Queue"))
            .unwrap();
        let statement = PolicyStatement::allow().with_actions(["sqs:SendMessage"]);
        assert!(app
            .add_policy_statement(queue, PolicySlot::Resource, statement)
            .is_err());
    }

    #[test]
    fn test_removal_policy_parse() {
        assert_eq!(RemovalPolicy::parse("RETAIN"), Some(RemovalPolicy::Retain));
        assert_eq!(RemovalPolicy::parse("delete"), Some(RemovalPolicy::Destroy));
        assert_eq!(RemovalPolicy::parse("keep"), None);
    }
}
