//! Synthesis: link, validate and render an app into a cloud assembly.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet, HashMap};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::app::{App, Phase};
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult, ErrorKind, ValidationFailure};
use crate::resolve::{ResolveMode, Resolver};
use crate::resource::{PolicyRender, PolicySlot, ResourceNode, TagFormat};
use crate::template::{
    AssemblyManifest, CloudAssembly, RenderedResource, StackArtifact, TemplateDocument,
    ASSEMBLY_VERSION,
};

/// Property names whose PascalCase form is not a plain capitalization.
const NAME_EXCEPTIONS: &[(&str, &str)] = &[
    ("templateUrl", "TemplateURL"),
    ("notificationArns", "NotificationARNs"),
];

/// Map a camelCase property name to its template name.
pub fn template_property_name(key: &str) -> String {
    if let Some((_, mapped)) = NAME_EXCEPTIONS.iter().find(|(k, _)| *k == key) {
        return mapped.to_string();
    }
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_elided(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn render_nested(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                let rendered = render_nested(item);
                if !is_elided(&rendered) {
                    out.insert(template_property_name(key), rendered);
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| !item.is_null())
                .map(render_nested)
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a resource's property bag: names mapped, raw keys kept verbatim,
/// nulls and empty collections dropped unless required.
fn render_properties(node: &ResourceNode) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in &node.properties {
        if value.is_null() {
            continue;
        }
        let rendered = if node.raw_keys.contains(key) {
            value.clone()
        } else {
            render_nested(value)
        };
        if is_elided(&rendered) && !node.required_keys.contains(key) {
            continue;
        }
        out.insert(template_property_name(key), rendered);
    }
    out
}

fn attach_policies(node: &ResourceNode, props: &mut Map<String, Value>) {
    for policy in &node.policies {
        let Some(document) = policy.document.minimized().to_json() else {
            continue;
        };
        match &policy.render {
            PolicyRender::Property(key) => {
                props.insert(template_property_name(key), document);
            }
            PolicyRender::InlinePolicies { policy_name } => {
                let entry = json!({ "PolicyName": policy_name, "PolicyDocument": document });
                match props.get_mut("Policies") {
                    Some(Value::Array(list)) => list.push(entry),
                    _ => {
                        props.insert("Policies".to_string(), json!([entry]));
                    }
                }
            }
        }
    }
}

fn attach_tags(app: &App, resource: ConstructId, node: &ResourceNode, props: &mut Map<String, Value>) {
    let Some(format) = node.tag_format else {
        return;
    };
    let tags = app.tags_for(resource);
    if tags.is_empty() || props.contains_key("Tags") {
        return;
    }
    let rendered = match format {
        TagFormat::Standard => Value::Array(
            tags.into_iter()
                .map(|(key, value)| json!({ "Key": key, "Value": value }))
                .collect(),
        ),
        TagFormat::Map => Value::Object(
            tags.into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        ),
    };
    props.insert("Tags".to_string(), rendered);
}

/// Apply a dot-path override to rendered properties. `None` deletes.
fn apply_override(props: &mut Map<String, Value>, path: &str, value: Option<&Value>) {
    let mut segments: Vec<&str> = path.split('.').collect();
    if segments.first() == Some(&"Properties") {
        segments.remove(0);
    }
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = props;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            if value.is_none() {
                return;
            }
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    match value {
        Some(value) => {
            current.insert(last.to_string(), value.clone());
        }
        None => {
            current.remove(*last);
        }
    }
}

fn render_resource(
    app: &App,
    stack: ConstructId,
    resource: ConstructId,
    resolver: &Resolver<'_>,
) -> CoreResult<RenderedResource> {
    let node = app
        .resource(resource)
        .ok_or_else(|| CoreError::invalid(app.path(resource), "construct is not a resource"))?;

    let mut props = render_properties(node);
    attach_policies(node, &mut props);
    attach_tags(app, resource, node, &mut props);
    for (path, value) in &node.overrides {
        apply_override(&mut props, path, value.as_ref());
    }
    let properties = match resolver.resolve(&Value::Object(props))? {
        Value::Object(map) if map.is_empty() => None,
        other => Some(other),
    };

    let metadata = if node.template_metadata.is_empty() {
        None
    } else {
        Some(resolver.resolve(&Value::Object(node.template_metadata.clone()))?)
    };

    let depends_on: BTreeSet<String> = node
        .depends_on
        .iter()
        .filter(|other| app.stack_of(**other).ok() == Some(stack))
        .map(|other| app.logical_id(*other))
        .collect();

    let removal = app.effective_removal_policy(resource)?;
    Ok(RenderedResource {
        resource_type: node.resource_type.clone(),
        properties,
        metadata,
        depends_on: depends_on.into_iter().collect(),
        deletion_policy: Some(removal.as_template_value().to_string()),
        update_replace_policy: Some(removal.as_template_value().to_string()),
        condition: node.condition.clone(),
    })
}

/// Resources of a stack in dependency order; ties keep declaration order.
pub fn order_resources(app: &App, stack: ConstructId) -> CoreResult<Vec<ConstructId>> {
    let resources = app.stack_resources(stack);
    let position: HashMap<ConstructId, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();

    let mut indegree = vec![0usize; resources.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];
    for (i, id) in resources.iter().enumerate() {
        let Some(node) = app.resource(*id) else {
            continue;
        };
        let deps: BTreeSet<usize> = node
            .depends_on
            .iter()
            .filter_map(|dep| position.get(dep).copied())
            .collect();
        for dep in deps {
            indegree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(resources.len());
    while let Some(Reverse(next)) = ready.pop() {
        order.push(resources[next]);
        for dependent in &dependents[next] {
            indegree[*dependent] -= 1;
            if indegree[*dependent] == 0 {
                ready.push(Reverse(*dependent));
            }
        }
    }

    if order.len() < resources.len() {
        let stuck: Vec<String> = resources
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, id)| app.path(*id))
            .collect();
        return Err(CoreError::CyclicReference {
            path: stuck.first().cloned().unwrap_or_default(),
            message: format!("resource dependencies form a cycle: {}", stuck.join(", ")),
        });
    }
    Ok(order)
}

/// Render one stack's template with the given resolver.
pub fn render_stack(
    app: &App,
    stack: ConstructId,
    resolver: &Resolver<'_>,
) -> CoreResult<TemplateDocument> {
    let data = app.stack(stack)?;
    let sections = data.sections();
    let resolve_map = |map: &Map<String, Value>| -> CoreResult<Map<String, Value>> {
        match resolver.resolve(&Value::Object(map.clone()))? {
            Value::Object(out) => Ok(out),
            _ => Ok(Map::new()),
        }
    };

    let mut doc = TemplateDocument {
        description: data.description().map(str::to_string),
        transform: sections.transforms.clone(),
        metadata: resolve_map(&sections.metadata)?,
        mappings: resolve_map(&sections.mappings)?,
        conditions: resolve_map(&sections.conditions)?,
        rules: resolve_map(&sections.rules)?,
        ..Default::default()
    };

    for (name, parameter) in data.parameters() {
        doc.parameters.insert(name.clone(), parameter.to_json());
    }

    for resource in order_resources(app, stack)? {
        let rendered = render_resource(app, stack, resource, resolver)?;
        doc.resources.insert(app.logical_id(resource), rendered);
    }

    for (name, output) in data.outputs() {
        let mut entry = Map::new();
        entry.insert("Value".to_string(), resolver.resolve(&output.value)?);
        if let Some(description) = &output.description {
            entry.insert("Description".to_string(), json!(description));
        }
        if let Some(export) = &output.export_name {
            entry.insert("Export".to_string(), json!({ "Name": export }));
        }
        if let Some(condition) = &output.condition {
            entry.insert("Condition".to_string(), json!(condition));
        }
        doc.outputs.insert(name.clone(), Value::Object(entry));
    }

    Ok(doc)
}

fn validate_tree(app: &App) -> Vec<ValidationFailure> {
    let mut failures = Vec::new();

    for id in app.descendants(app.root()) {
        let node = app.node(id);
        for validator in &node.validators {
            for message in validator(app, id) {
                failures.push(ValidationFailure::new(
                    app.path(id),
                    ErrorKind::ValidationFailure,
                    message,
                ));
            }
        }

        let Some(resource) = app.resource(id) else {
            continue;
        };
        for policy in resource.attached_policies() {
            if policy.document.is_empty() {
                if policy.required {
                    failures.push(ValidationFailure::new(
                        app.path(id),
                        ErrorKind::InvalidPolicy,
                        format!("{:?} policy must contain at least one statement", policy.slot),
                    ));
                }
                continue;
            }
            let result = match policy.slot {
                PolicySlot::Identity => policy.document.validate_for_identity_policy(),
                PolicySlot::Resource | PolicySlot::AssumeRole => {
                    policy.document.validate_for_resource_policy()
                }
            };
            for error in result.errors {
                failures.push(ValidationFailure::new(app.path(id), ErrorKind::InvalidPolicy, error));
            }
            for warning in result.warnings {
                app.add_warning(id, warning);
            }
        }
    }

    for stack in app.stacks() {
        let mut seen: HashMap<String, ConstructId> = HashMap::new();
        for resource in app.stack_resources(stack) {
            let logical_id = app.logical_id(resource);
            if let Some(other) = seen.insert(logical_id.clone(), resource) {
                failures.push(ValidationFailure::new(
                    app.path(resource),
                    ErrorKind::DuplicateId,
                    format!(
                        "logical id '{}' is already used by {}",
                        logical_id,
                        app.path(other)
                    ),
                ));
            }
        }
    }

    failures
}

fn check_stack_cycles(app: &App) -> CoreResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(
        app: &App,
        stack: ConstructId,
        marks: &mut HashMap<ConstructId, Mark>,
        trail: &mut Vec<ConstructId>,
    ) -> CoreResult<()> {
        match marks.get(&stack).copied().unwrap_or(Mark::New) {
            Mark::Done => return Ok(()),
            Mark::Active => {
                let start = trail.iter().position(|s| *s == stack).unwrap_or(0);
                let names: Vec<String> = trail[start..]
                    .iter()
                    .chain(std::iter::once(&stack))
                    .filter_map(|s| app.stack_data(*s).map(|d| d.name().to_string()))
                    .collect();
                return Err(CoreError::CyclicReference {
                    path: app.path(stack),
                    message: format!("stack dependencies form a cycle: {}", names.join(" -> ")),
                });
            }
            Mark::New => {}
        }
        marks.insert(stack, Mark::Active);
        trail.push(stack);
        for dependency in app.stack(stack)?.dependencies() {
            visit(app, *dependency, marks, trail)?;
        }
        trail.pop();
        marks.insert(stack, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut trail = Vec::new();
    for stack in app.stacks() {
        visit(app, stack, &mut marks, &mut trail)?;
    }
    Ok(())
}

fn artifact(app: &App, stack: ConstructId) -> CoreResult<StackArtifact> {
    let data = app.stack(stack)?;
    let mut dependencies: Vec<String> = data
        .dependencies()
        .iter()
        .filter_map(|s| app.stack_data(*s).map(|d| d.name().to_string()))
        .collect();
    dependencies.sort();
    dependencies.dedup();
    Ok(StackArtifact {
        stack_name: data.name().to_string(),
        path: app.path(stack),
        environment: data.env().clone(),
        template_file: data.template_file(),
        termination_protection: data.termination_protection,
        dependencies,
        exports: data.exports().iter().cloned().collect(),
        imports: data.imports().iter().cloned().collect(),
        nested_parent: data
            .nested()
            .and_then(|link| app.stack_data(link.parent_stack))
            .map(|d| d.name().to_string()),
    })
}

/// Run linking, validation and rendering.
///
/// Fails with `missing-context` before anything else when a context lookup
/// missed the cache; otherwise fatal errors abort immediately and validation
/// failures are reported together.
pub fn synthesize(app: &mut App) -> CoreResult<CloudAssembly> {
    if app.phase != Phase::Construction {
        return Err(CoreError::invalid("", "the app has already been synthesized"));
    }

    let missing = app.missing_context();
    if !missing.is_empty() {
        return Err(CoreError::MissingContext(missing));
    }

    app.phase = Phase::Linking;
    info!("Linking {} constructs", app.len());
    app.run_linkers()?;
    app.expand_dependencies()?;
    app.link_references()?;

    let missing = app.missing_context();
    if !missing.is_empty() {
        return Err(CoreError::MissingContext(missing));
    }

    app.phase = Phase::Validation;
    check_stack_cycles(app)?;
    let failures = validate_tree(app);
    if !failures.is_empty() {
        return Err(CoreError::Validation(failures));
    }

    app.phase = Phase::Synthesis;
    let mut templates = indexmap::IndexMap::new();
    let mut artifacts = Vec::new();
    for stack in app.stacks() {
        let resolver = Resolver::new(app, stack, ResolveMode::Render);
        let doc = render_stack(app, stack, &resolver)?;
        let artifact = artifact(app, stack)?;
        debug!(
            "Rendered {} with {} resource(s)",
            artifact.stack_name,
            doc.resources.len()
        );
        templates.insert(artifact.stack_name.clone(), doc);
        artifacts.push(artifact);
    }

    app.phase = Phase::Done;
    info!("Synthesized {} stack(s)", artifacts.len());
    Ok(CloudAssembly {
        manifest: AssemblyManifest {
            version: ASSEMBLY_VERSION.to_string(),
            artifacts,
            diagnostics: app.diagnostics(),
        },
        templates,
    })
}
