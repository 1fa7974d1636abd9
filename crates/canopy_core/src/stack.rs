//! Stacks: units of deployment, each rendered to one template document.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::app::App;
use crate::construct::{sanitize_id, ConstructId, NodeKind};
use crate::error::{CoreError, CoreResult};
use crate::flags::KMS_DEFAULT_KEY_POLICIES;
use crate::grant::GrantMode;
use crate::resource::{RemovalPolicy, ResourceNode};
use crate::tags::TagOptions;

/// Longest stack name accepted by the provider.
pub const MAX_STACK_NAME_LENGTH: usize = 128;

/// Resource type of the parent-side handle of a nested stack.
pub const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

fn stack_name_regex() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("stack name pattern is valid"))
}

/// Target account and region. `None` means unknown until deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            region: Some(region.into()),
        }
    }

    /// An environment resolved at deployment time.
    pub fn agnostic() -> Self {
        Self::default()
    }

    pub fn is_concrete(&self) -> bool {
        self.account.is_some() && self.region.is_some()
    }

    pub fn is_agnostic(&self) -> bool {
        self.account.is_none() && self.region.is_none()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region.as_deref().unwrap_or("unknown-region")
        )
    }
}

/// Properties of a top-level stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackProps {
    pub stack_name: Option<String>,
    pub env: Environment,
    pub description: Option<String>,
    pub termination_protection: bool,
    pub default_removal_policy: Option<RemovalPolicy>,
    /// Context entries, including feature flags.
    pub context: BTreeMap<String, Value>,
    pub tags: BTreeMap<String, String>,
}

/// Properties of a nested stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedStackProps {
    pub description: Option<String>,
    /// Explicit parameter values passed from the parent.
    pub parameters: BTreeMap<String, Value>,
    pub timeout_in_minutes: Option<u32>,
    pub notification_arns: Vec<String>,
    pub default_removal_policy: Option<RemovalPolicy>,
}

/// A template parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub no_echo: bool,
}

impl Parameter {
    pub fn string() -> Self {
        Self {
            param_type: "String".to_string(),
            default: None,
            description: None,
            no_echo: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("Type".to_string(), json!(self.param_type));
        if let Some(default) = &self.default {
            map.insert("Default".to_string(), default.clone());
        }
        if let Some(description) = &self.description {
            map.insert("Description".to_string(), json!(description));
        }
        if self.no_echo {
            map.insert("NoEcho".to_string(), json!(true));
        }
        Value::Object(map)
    }
}

/// A template output.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    /// May contain tokens.
    pub value: Value,
    pub description: Option<String>,
    pub export_name: Option<String>,
    pub condition: Option<String>,
}

impl Output {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            description: None,
            export_name: None,
            condition: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_export_name(mut self, name: impl Into<String>) -> Self {
        self.export_name = Some(name.into());
        self
    }
}

/// Template sections other than resources, parameters and outputs.
#[derive(Debug, Clone, Default)]
pub struct TemplateSections {
    pub transforms: Vec<String>,
    pub metadata: Map<String, Value>,
    pub mappings: Map<String, Value>,
    pub conditions: Map<String, Value>,
    pub rules: Map<String, Value>,
}

/// Parent-side wiring of a nested stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedStackLink {
    pub parent_stack: ConstructId,
    /// The `AWS::CloudFormation::Stack` resource in the parent.
    pub resource: ConstructId,
}

/// Data owned by a stack node.
#[derive(Debug, Clone)]
pub struct StackData {
    pub(crate) name: String,
    pub(crate) env: Environment,
    pub(crate) description: Option<String>,
    pub(crate) termination_protection: bool,
    pub(crate) default_removal_policy: Option<RemovalPolicy>,
    pub(crate) parameters: IndexMap<String, Parameter>,
    pub(crate) outputs: IndexMap<String, Output>,
    pub(crate) sections: TemplateSections,
    pub(crate) dependencies: Vec<ConstructId>,
    pub(crate) grant_mode: GrantMode,
    pub(crate) imports: BTreeSet<String>,
    pub(crate) exports: BTreeSet<String>,
    pub(crate) nested: Option<NestedStackLink>,
}

impl StackData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn grant_mode(&self) -> GrantMode {
        self.grant_mode
    }

    pub fn parameters(&self) -> &IndexMap<String, Parameter> {
        &self.parameters
    }

    pub fn outputs(&self) -> &IndexMap<String, Output> {
        &self.outputs
    }

    pub fn sections(&self) -> &TemplateSections {
        &self.sections
    }

    pub fn dependencies(&self) -> &[ConstructId] {
        &self.dependencies
    }

    pub fn imports(&self) -> &BTreeSet<String> {
        &self.imports
    }

    pub fn exports(&self) -> &BTreeSet<String> {
        &self.exports
    }

    pub fn nested(&self) -> Option<NestedStackLink> {
        self.nested
    }

    pub fn is_nested(&self) -> bool {
        self.nested.is_some()
    }

    pub fn template_file(&self) -> String {
        format!("{}.template.json", self.name)
    }
}

/// Derive a stack name from a construct path.
fn name_from_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            segment
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect::<String>()
        })
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Check a stack name against the provider's naming rules.
pub fn validate_stack_name(name: &str) -> Result<(), String> {
    if name.len() > MAX_STACK_NAME_LENGTH {
        return Err(format!(
            "stack name '{}' exceeds {} characters",
            name, MAX_STACK_NAME_LENGTH
        ));
    }
    if !stack_name_regex().is_match(name) {
        return Err(format!(
            "stack name '{}' must start with a letter and contain only letters, digits and hyphens",
            name
        ));
    }
    Ok(())
}

impl App {
    /// Add a top-level stack. Stacks cannot be placed inside other stacks;
    /// use [`App::add_nested_stack`] for that.
    pub fn add_stack(
        &mut self,
        parent: ConstructId,
        id: &str,
        props: StackProps,
    ) -> CoreResult<ConstructId> {
        if self.stack_of(parent).is_ok() {
            return Err(CoreError::invalid(
                self.path(parent),
                format!("stack '{}' cannot be defined inside another stack", id),
            ));
        }

        let env = Environment {
            account: props.env.account.clone().or_else(|| self.config.account.clone()),
            region: props.env.region.clone().or_else(|| self.config.region.clone()),
        };
        let data = StackData {
            name: String::new(),
            env,
            description: props.description.clone(),
            termination_protection: props.termination_protection,
            default_removal_policy: props.default_removal_policy,
            parameters: IndexMap::new(),
            outputs: IndexMap::new(),
            sections: TemplateSections::default(),
            dependencies: Vec::new(),
            grant_mode: GrantMode::StrictResource,
            imports: BTreeSet::new(),
            exports: BTreeSet::new(),
            nested: None,
        };
        let name = match &props.stack_name {
            Some(name) => name.clone(),
            None => {
                let parent_path = self.path(parent);
                name_from_path(&format!("{}/{}", parent_path, sanitize_id(id)))
            }
        };
        validate_stack_name(&name).map_err(|msg| {
            CoreError::invalid(format!("{}/{}", self.path(parent), id), msg)
        })?;
        if let Some(other) = self
            .stacks()
            .into_iter()
            .find(|s| self.stack_data(*s).map(|d| d.name.as_str()) == Some(name.as_str()))
        {
            return Err(CoreError::DuplicateId {
                path: self.path(other),
                id: name,
            });
        }

        let stack = self.attach(parent, id, NodeKind::Stack(Box::new(data)))?;
        for (key, value) in &props.context {
            self.node_mut(stack).context.insert(key.clone(), value.clone());
        }
        for (key, value) in &props.tags {
            self.set_tag(stack, key, value, TagOptions::default())?;
        }

        let grant_mode = GrantMode::from_flag(self.feature_flag(stack, KMS_DEFAULT_KEY_POLICIES)?);
        let data = self.stack_data_mut(stack)?;
        data.name = name;
        data.grant_mode = grant_mode;

        let data = self.stack(stack)?;
        info!(
            "Stack '{}' ({}) grant mode {:?}",
            data.name, data.env, data.grant_mode
        );
        Ok(stack)
    }

    /// Add a nested stack under `scope`, which must belong to a stack. The
    /// nested stack's `AWS::CloudFormation::Stack` resource is created next
    /// to it in the parent stack.
    pub fn add_nested_stack(
        &mut self,
        scope: ConstructId,
        id: &str,
        props: NestedStackProps,
    ) -> CoreResult<ConstructId> {
        let parent_stack = self.stack_of(scope)?;
        let parent = self.stack(parent_stack)?;
        let env = parent.env.clone();
        let parent_name = parent.name.clone();
        let default_removal_policy = props.default_removal_policy.or(parent.default_removal_policy);

        let data = StackData {
            name: String::new(),
            env,
            description: props.description.clone(),
            termination_protection: false,
            default_removal_policy,
            parameters: IndexMap::new(),
            outputs: IndexMap::new(),
            sections: TemplateSections::default(),
            dependencies: Vec::new(),
            grant_mode: GrantMode::StrictResource,
            imports: BTreeSet::new(),
            exports: BTreeSet::new(),
            nested: None,
        };
        let stack = self.attach(scope, id, NodeKind::Stack(Box::new(data)))?;
        let name = format!("{}-{}", parent_name, name_from_path(self.node(stack).id()));

        let mut resource = ResourceNode::new(NESTED_STACK_TYPE)
            .with_property("templateUrl", format!("{}.template.json", name))
            .raw_key("parameters");
        if let Some(timeout) = props.timeout_in_minutes {
            resource = resource.with_property("timeoutInMinutes", timeout);
        }
        if !props.notification_arns.is_empty() {
            resource = resource.with_property("notificationArns", json!(props.notification_arns));
        }
        if !props.parameters.is_empty() {
            resource = resource.with_property("parameters", json!(props.parameters));
        }
        let handle = self.add_resource(scope, &format!("{}.NestedStackResource", id), resource)?;

        let grant_mode = GrantMode::from_flag(self.feature_flag(stack, KMS_DEFAULT_KEY_POLICIES)?);
        let data = self.stack_data_mut(stack)?;
        data.name = name;
        data.grant_mode = grant_mode;
        data.nested = Some(NestedStackLink {
            parent_stack,
            resource: handle,
        });
        debug!("Nested stack {} under {}", self.path(stack), parent_name);
        Ok(stack)
    }

    /// The outermost stack containing `stack`.
    pub fn top_level_stack(&self, stack: ConstructId) -> ConstructId {
        let mut current = stack;
        while let Some(link) = self.stack_data(current).and_then(|d| d.nested) {
            current = link.parent_stack;
        }
        current
    }

    /// Add a parameter to a stack; returns a token referencing it.
    pub fn add_parameter(
        &mut self,
        stack: ConstructId,
        name: &str,
        parameter: Parameter,
    ) -> CoreResult<String> {
        self.ensure_mutable(stack, "add a parameter")?;
        let path = self.path(stack);
        let data = self.stack_data_mut(stack)?;
        if data.parameters.contains_key(name) {
            return Err(CoreError::DuplicateId {
                path,
                id: name.to_string(),
            });
        }
        data.parameters.insert(name.to_string(), parameter);
        let id = self.tokens.parameter(stack, name);
        Ok(self.tokens.encoded(id))
    }

    /// Add an output to a stack.
    pub fn add_output(&mut self, stack: ConstructId, name: &str, output: Output) -> CoreResult<()> {
        self.ensure_mutable(stack, "add an output")?;
        let path = self.path(stack);
        let data = self.stack_data_mut(stack)?;
        if data.outputs.contains_key(name) {
            return Err(CoreError::DuplicateId {
                path,
                id: name.to_string(),
            });
        }
        if let Some(export) = &output.export_name {
            data.exports.insert(export.clone());
        }
        data.outputs.insert(name.to_string(), output);
        Ok(())
    }

    /// Declare that `stack` deploys after `dependency`. Edges between stacks
    /// under the same top-level stack are ordered by their nested-stack
    /// resources instead.
    pub fn add_stack_dependency(
        &mut self,
        stack: ConstructId,
        dependency: ConstructId,
    ) -> CoreResult<()> {
        self.ensure_mutable(stack, "add a stack dependency")?;
        self.stack(stack)?;
        self.stack(dependency)?;
        let from = self.top_level_stack(stack);
        let to = self.top_level_stack(dependency);
        if from == to {
            return self.order_nested_stacks(stack, dependency);
        }
        let data = self.stack_data_mut(from)?;
        if !data.dependencies.contains(&to) {
            debug!("Stack dependency {} -> {}", from, to);
            data.dependencies.push(to);
        }
        Ok(())
    }

    fn order_nested_stacks(&mut self, stack: ConstructId, dependency: ConstructId) -> CoreResult<()> {
        // Walk both up to siblings under a common parent stack.
        let chain_of = |app: &App, s: ConstructId| {
            let mut chain = vec![s];
            let mut current = s;
            while let Some(link) = app.stack_data(current).and_then(|d| d.nested) {
                current = link.parent_stack;
                chain.push(current);
            }
            chain
        };
        let from_chain = chain_of(self, stack);
        let to_chain = chain_of(self, dependency);
        for (i, from) in from_chain.iter().enumerate() {
            if let Some(j) = to_chain.iter().position(|s| s == from) {
                if i == 0 || j == 0 {
                    // One contains the other; the template parameters order them.
                    return Ok(());
                }
                let from_link = self.stack(from_chain[i - 1])?.nested;
                let to_link = self.stack(to_chain[j - 1])?.nested;
                if let (Some(a), Some(b)) = (from_link, to_link) {
                    return self.add_depends_on(a.resource, b.resource);
                }
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn add_transform(&mut self, stack: ConstructId, transform: &str) -> CoreResult<()> {
        self.ensure_mutable(stack, "add a transform")?;
        let transforms = &mut self.stack_data_mut(stack)?.sections.transforms;
        if !transforms.iter().any(|t| t == transform) {
            transforms.push(transform.to_string());
        }
        Ok(())
    }

    pub fn add_mapping(&mut self, stack: ConstructId, name: &str, mapping: Value) -> CoreResult<()> {
        self.ensure_mutable(stack, "add a mapping")?;
        self.stack_data_mut(stack)?
            .sections
            .mappings
            .insert(name.to_string(), mapping);
        Ok(())
    }

    pub fn add_condition(&mut self, stack: ConstructId, name: &str, condition: Value) -> CoreResult<()> {
        self.ensure_mutable(stack, "add a condition")?;
        self.stack_data_mut(stack)?
            .sections
            .conditions
            .insert(name.to_string(), condition);
        Ok(())
    }

    pub fn add_rule(&mut self, stack: ConstructId, name: &str, rule: Value) -> CoreResult<()> {
        self.ensure_mutable(stack, "add a rule")?;
        self.stack_data_mut(stack)?
            .sections
            .rules
            .insert(name.to_string(), rule);
        Ok(())
    }

    pub fn add_template_metadata(&mut self, stack: ConstructId, key: &str, value: Value) -> CoreResult<()> {
        self.ensure_mutable(stack, "add template metadata")?;
        self.stack_data_mut(stack)?
            .sections
            .metadata
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Environment of the stack owning `scope`.
    pub fn environment(&self, scope: ConstructId) -> CoreResult<&Environment> {
        Ok(&self.stack(self.stack_of(scope)?)?.env)
    }

    /// Account of the stack owning `scope`; a pseudo-parameter token when unknown.
    pub fn account(&mut self, scope: ConstructId) -> CoreResult<String> {
        match self.environment(scope)?.account.clone() {
            Some(account) => Ok(account),
            None => Ok(self.pseudo("AWS::AccountId")),
        }
    }

    /// Region of the stack owning `scope`; a pseudo-parameter token when unknown.
    pub fn region(&mut self, scope: ConstructId) -> CoreResult<String> {
        match self.environment(scope)?.region.clone() {
            Some(region) => Ok(region),
            None => Ok(self.pseudo("AWS::Region")),
        }
    }

    /// `arn:<partition>:<service>:<region>:<account>:<resource>` in the
    /// environment of `scope`. Empty region or account stay empty.
    pub fn format_arn(
        &mut self,
        scope: ConstructId,
        service: &str,
        region: Option<&str>,
        account: Option<&str>,
        resource: &str,
    ) -> CoreResult<String> {
        let region = match region {
            Some(r) => r.to_string(),
            None => self.region(scope)?,
        };
        let account = match account {
            Some(a) => a.to_string(),
            None => self.account(scope)?,
        };
        Ok(format!(
            "arn:{}:{}:{}:{}:{}",
            canopy_policy::DEFAULT_PARTITION,
            service,
            region,
            account,
            resource
        ))
    }

    /// Require a concrete account and region for `scope`'s stack.
    pub fn require_concrete_env(&self, scope: ConstructId, operation: &str) -> CoreResult<Environment> {
        let env = self.environment(scope)?.clone();
        if env.is_concrete() {
            Ok(env)
        } else {
            Err(CoreError::UnknownEnvironment {
                path: self.path(scope),
                message: format!(
                    "{} requires a concrete account and region, but the stack targets {}",
                    operation, env
                ),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_stack_name_from_path() {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Orders", StackProps::default()).unwrap();
        assert_eq!(app.stack(stack).unwrap().name(), "Orders");
    }

    #[test]
    fn test_invalid_stack_name_rejected() {
        assert!(validate_stack_name("1bad").is_err());
        assert!(validate_stack_name("has_underscore").is_err());
        assert!(validate_stack_name(&"a".repeat(129)).is_err());
        assert!(validate_stack_name("Good-Name-1").is_ok());
    }

    #[test]
    fn test_stack_inside_stack_rejected() {
        let mut app = App::new();
        let root = app.root();
        let outer = app.add_stack(root, "Outer", StackProps::default()).unwrap();
        assert!(app.add_stack(outer, "Inner", StackProps::default()).is_err());
    }

    #[test]
    fn test_duplicate_stack_name_rejected() {
        let mut app = App::new();
        let root = app.root();
        let props = StackProps {
            stack_name: Some("Shared".to_string()),
            ..Default::default()
        };
        app.add_stack(root, "A", props.clone()).unwrap();
        let err = app.add_stack(root, "B", props).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateId);
    }

    #[test]
    fn test_nested_stack_creates_parent_resource() {
        let mut app = App::new();
        let root = app.root();
        let parent = app.add_stack(root, "Parent", StackProps::default()).unwrap();
        let nested = app
            .add_nested_stack(parent, "Child", NestedStackProps::default())
            .unwrap();

        let link = app.stack(nested).unwrap().nested().unwrap();
        assert_eq!(link.parent_stack, parent);
        assert_eq!(
            app.resource(link.resource).unwrap().resource_type(),
            NESTED_STACK_TYPE
        );
        assert_eq!(app.stack_of(link.resource).unwrap(), parent);
        assert_eq!(app.top_level_stack(nested), parent);
        assert_eq!(app.stack(nested).unwrap().name(), "Parent-Child");
    }

    #[test]
    fn test_unknown_env_uses_pseudo_parameters() {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Agnostic", StackProps::default()).unwrap();
        let account = app.account(stack).unwrap();
        assert!(crate::token::is_token(&account));

        let err = app.require_concrete_env(stack, "lookup").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownEnvironment);
    }

    #[test]
    fn test_format_arn_with_concrete_env() {
        let mut app = App::new();
        let root = app.root();
        let props = StackProps {
            env: Environment::new("111111111111", "us-east-1"),
            ..Default::default()
        };
        let stack = app.add_stack(root, "Concrete", props).unwrap();
        let arn = app
            .format_arn(stack, "events", None, None, "event-bus/default")
            .unwrap();
        assert_eq!(arn, "arn:aws:events:us-east-1:111111111111:event-bus/default");
    }

    #[test]
    fn test_parameter_and_output_names_unique() {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "S", StackProps::default()).unwrap();
        app.add_parameter(stack, "Env", Parameter::string()).unwrap();
        assert!(app.add_parameter(stack, "Env", Parameter::string()).is_err());
        app.add_output(stack, "Out", Output::new("x")).unwrap();
        assert!(app.add_output(stack, "Out", Output::new("y")).is_err());
    }
}
