//! Linking: the sub-phase between construction and validation.
//!
//! Deferred [`Linker`]s run first and may add peer resources. Then every
//! reference that crosses a stack boundary is materialized: nested-stack
//! outputs and parameters, exports and imports, cross-region parameter
//! writers, or physical values across accounts. Linking repeats until a
//! discovery pass finds nothing new, since one replacement can introduce
//! another crossing (deeply nested stacks, cross-region writers).

use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult};
use crate::resolve::{ResolveMode, Resolver};
use crate::resource::ResourceNode;
use crate::stack::{Output, Parameter, StackProps};
use crate::synth::render_stack;
use crate::token::{Token, TokenId, TokenKind};

const MAX_LINK_ROUNDS: usize = 64;

/// Resource type publishing values for consumers in other regions.
pub const CROSS_REGION_WRITER_TYPE: &str = "Custom::CrossRegionExportWriter";
/// Prefix of the parameter names written by cross-region writers.
pub const CROSS_REGION_PARAMETER_PREFIX: &str = "/canopy/exports";

/// Work deferred to the end of construction, when the whole tree is known.
pub trait Linker {
    fn name(&self) -> &str;

    fn link(&self, app: &mut App) -> CoreResult<()>;
}

/// Replacement token strings per (reference token, consuming stack).
#[derive(Debug, Default)]
pub(crate) struct ReferenceTable {
    entries: HashMap<(TokenId, ConstructId), String>,
}

impl ReferenceTable {
    pub(crate) fn get(&self, token: TokenId, consumer: ConstructId) -> Option<&str> {
        self.entries.get(&(token, consumer)).map(String::as_str)
    }

    fn insert(&mut self, token: TokenId, consumer: ConstructId, replacement: String) {
        self.entries.insert((token, consumer), replacement);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn alphanumeric(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Stable name for what a reference token points at.
fn reference_name(app: &App, token: &Token) -> String {
    match &token.kind {
        TokenKind::Ref { resource } => format!("Ref{}", app.logical_id(*resource)),
        TokenKind::GetAtt {
            resource,
            attribute,
        } => format!(
            "FnGetAtt{}{}",
            app.logical_id(*resource),
            alphanumeric(attribute)
        ),
        TokenKind::Parameter { name, .. } => format!("Param{}", alphanumeric(name)),
        _ => alphanumeric(&token.hint),
    }
}

impl App {
    /// Register work to run when construction ends.
    pub fn add_linker(&mut self, linker: Box<dyn Linker>) -> CoreResult<()> {
        self.ensure_mutable(self.root(), "add a linker")?;
        self.linkers.push(linker);
        Ok(())
    }

    pub(crate) fn run_linkers(&mut self) -> CoreResult<()> {
        loop {
            let batch = std::mem::take(&mut self.linkers);
            if batch.is_empty() {
                return Ok(());
            }
            for linker in batch {
                debug!("Running linker {}", linker.name());
                linker.link(self)?;
            }
        }
    }

    /// Turn construct-level dependencies into resource or stack dependencies,
    /// and resource dependencies across stacks into stack dependencies.
    pub(crate) fn expand_dependencies(&mut self) -> CoreResult<()> {
        let mut resource_edges = Vec::new();
        for from in self.descendants(self.root()) {
            for to in self.node(from).dependencies().to_vec() {
                let sources: Vec<ConstructId> = self
                    .descendants(from)
                    .into_iter()
                    .filter(|id| self.node(*id).is_resource())
                    .collect();
                let targets: Vec<ConstructId> = self
                    .descendants(to)
                    .into_iter()
                    .filter(|id| self.node(*id).is_resource())
                    .collect();
                for source in &sources {
                    for target in &targets {
                        if source != target {
                            resource_edges.push((*source, *target));
                        }
                    }
                }
                if self.node(from).is_stack() && self.node(to).is_stack() {
                    self.add_stack_dependency(from, to)?;
                }
            }
        }

        for (source, target) in resource_edges {
            if self.stack_of(source)? == self.stack_of(target)? {
                self.add_depends_on(source, target)?;
            }
        }

        let mut stack_edges = BTreeSet::new();
        for id in self.descendants(self.root()) {
            if let Some(resource) = self.resource(id) {
                let own = self.stack_of(id)?;
                for other in resource.depends_on() {
                    let theirs = self.stack_of(*other)?;
                    if theirs != own {
                        stack_edges.insert((own, theirs));
                    }
                }
            }
        }
        for (from, to) in stack_edges {
            self.add_stack_dependency(from, to)?;
        }
        Ok(())
    }

    /// Materialize every cross-stack reference until none is left.
    pub(crate) fn link_references(&mut self) -> CoreResult<()> {
        for round in 0..MAX_LINK_ROUNDS {
            let pending = self.discover_references()?;
            if pending.is_empty() {
                info!(
                    "Linked {} cross-stack reference(s) in {} round(s)",
                    self.references.len(),
                    round
                );
                return Ok(());
            }
            for (token, consumer) in pending {
                self.materialize(token, consumer)?;
            }
        }
        Err(CoreError::CyclicReference {
            path: String::new(),
            message: format!(
                "cross-stack references did not settle after {} linking rounds",
                MAX_LINK_ROUNDS
            ),
        })
    }

    fn discover_references(&self) -> CoreResult<BTreeSet<(TokenId, ConstructId)>> {
        let mut pending = BTreeSet::new();
        for stack in self.stacks() {
            let resolver = Resolver::new(self, stack, ResolveMode::Discover);
            render_stack(self, stack, &resolver)?;
            pending.extend(resolver.into_discovered());
        }
        Ok(pending)
    }

    fn materialize(&mut self, token_id: TokenId, consumer: ConstructId) -> CoreResult<()> {
        if self.references.get(token_id, consumer).is_some() {
            return Ok(());
        }
        let token = self
            .token(token_id)
            .cloned()
            .ok_or_else(|| CoreError::invalid("", format!("unknown {}", token_id)))?;
        let (producer, producer_stack) = match &token.kind {
            TokenKind::Ref { resource } | TokenKind::GetAtt { resource, .. } => {
                (*resource, self.stack_of(*resource)?)
            }
            TokenKind::Parameter { stack, .. } => (*stack, *stack),
            _ => {
                return Err(CoreError::invalid(
                    "",
                    format!("{} is not a reference", token.encoded()),
                ))
            }
        };
        let encoded = token.encoded();
        let name = reference_name(self, &token);

        if let Some(link) = self.stack(producer_stack)?.nested() {
            if !self.is_within(consumer, producer_stack) {
                if !self.stack(producer_stack)?.outputs().contains_key(&name) {
                    self.add_output(producer_stack, &name, Output::new(encoded.clone()))?;
                }
                let replacement = self.get_att(link.resource, &format!("Outputs.{}", name));
                debug!("Nested output {} for {}", name, self.path(consumer));
                self.references.insert(token_id, consumer, replacement);
                return Ok(());
            }
        }

        if let Some(link) = self.stack(consumer)?.nested() {
            let parameter = format!(
                "referenceto{}{}",
                alphanumeric(self.stack(producer_stack)?.name()),
                name
            );
            let replacement = if self.stack(consumer)?.parameters().contains_key(&parameter) {
                let id = self.tokens.parameter(consumer, &parameter);
                self.tokens.encoded(id)
            } else {
                self.add_parameter(consumer, &parameter, Parameter::string())?
            };
            let handle = self.resource_mut(link.resource)?;
            let mut parameters = match handle.property("parameters") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            parameters.insert(parameter.clone(), Value::String(encoded));
            handle.set_property("parameters", Value::Object(parameters));
            debug!("Nested parameter {} for {}", parameter, self.path(consumer));
            self.references.insert(token_id, consumer, replacement);
            return Ok(());
        }

        let producer_env = self.stack(producer_stack)?.env().clone();
        let consumer_env = self.stack(consumer)?.env().clone();

        if producer_env == consumer_env {
            return self.link_export(token_id, consumer, producer_stack, &name, encoded);
        }

        if !producer_env.is_concrete() || !consumer_env.is_concrete() {
            return Err(CoreError::UnknownEnvironment {
                path: self.path(consumer),
                message: format!(
                    "cannot reference {} in {} from {}: both stacks need a concrete account and region",
                    self.path(producer),
                    producer_env,
                    consumer_env
                ),
            });
        }

        if producer_env.account == consumer_env.account {
            return self.link_cross_region(token_id, consumer, producer_stack, &name, encoded);
        }

        let attribute = match &token.kind {
            TokenKind::Ref { .. } => Some("Ref"),
            TokenKind::GetAtt { attribute, .. } => Some(attribute.as_str()),
            _ => None,
        };
        let value = attribute.and_then(|attribute| {
            self.resource(producer)
                .and_then(|r| r.cross_env_attribute(attribute))
                .cloned()
        });
        let Some(value) = value else {
            return Err(CoreError::invalid(
                self.path(producer),
                format!(
                    "referenced from stack '{}' in another account ({}); give it a physical name so it can be referenced across accounts",
                    self.stack(consumer)?.name(),
                    consumer_env
                ),
            ));
        };
        let replacement = self.intrinsic(Some(producer), "CrossAccount", value);
        self.add_stack_dependency(consumer, producer_stack)?;
        self.references.insert(token_id, consumer, replacement);
        Ok(())
    }

    fn link_export(
        &mut self,
        token_id: TokenId,
        consumer: ConstructId,
        producer_stack: ConstructId,
        name: &str,
        encoded: String,
    ) -> CoreResult<()> {
        let output_name = format!("ExportsOutput{}", name);
        let export_name = format!("{}:{}", self.stack(producer_stack)?.name(), output_name);
        if !self.stack(producer_stack)?.outputs().contains_key(&output_name) {
            self.add_output(
                producer_stack,
                &output_name,
                Output::new(encoded).with_export_name(export_name.clone()),
            )?;
        }
        let replacement = self.intrinsic(
            None,
            "ImportValue",
            json!({ "Fn::ImportValue": export_name }),
        );
        self.stack_data_mut(consumer)?
            .imports
            .insert(export_name.clone());
        self.add_stack_dependency(consumer, producer_stack)?;
        debug!("Export {} imported by {}", export_name, self.path(consumer));
        self.references.insert(token_id, consumer, replacement);
        Ok(())
    }

    fn link_cross_region(
        &mut self,
        token_id: TokenId,
        consumer: ConstructId,
        producer_stack: ConstructId,
        name: &str,
        encoded: String,
    ) -> CoreResult<()> {
        let producer = self.stack(producer_stack)?;
        let producer_name = producer.name().to_string();
        let producer_env = producer.env().clone();
        let consumer_data = self.stack(consumer)?;
        let consumer_name = consumer_data.name().to_string();
        let consumer_region = consumer_data.env().region.clone().unwrap_or_default();

        let side_id = format!("{}-CrossRegionExports-{}", producer_name, consumer_region);
        let root = self.root();
        let side = match self.find_child(root, &side_id) {
            Some(side) => side,
            None => {
                let side = self.add_stack(
                    root,
                    &side_id,
                    StackProps {
                        env: producer_env.clone(),
                        description: Some(format!(
                            "Publishes values of {} to {}",
                            producer_name, consumer_region
                        )),
                        ..Default::default()
                    },
                )?;
                let service_token = format!(
                    "arn:aws:lambda:{}:{}:function:canopy-cross-region-export-writer",
                    producer_env.region.clone().unwrap_or_default(),
                    producer_env.account.clone().unwrap_or_default()
                );
                let writer = ResourceNode::new(CROSS_REGION_WRITER_TYPE)
                    .with_property("serviceToken", service_token)
                    .with_property(
                        "writerProps",
                        json!({ "region": consumer_region, "exports": {} }),
                    )
                    .raw_key("writerProps")
                    .required_key("writerProps");
                self.add_resource(side, "ExportsWriter", writer)?;
                info!("Created cross-region writer stack {}", side_id);
                side
            }
        };

        let parameter = format!(
            "{}/{}/{}-{}",
            CROSS_REGION_PARAMETER_PREFIX, consumer_name, producer_name, name
        );
        let writer = self
            .find_child(side, "ExportsWriter")
            .ok_or_else(|| CoreError::invalid(self.path(side), "missing ExportsWriter"))?;
        let node = self.resource_mut(writer)?;
        let mut props = node.property("writerProps").cloned().unwrap_or_else(|| json!({}));
        if let Some(exports) = props.get_mut("exports").and_then(Value::as_object_mut) {
            exports.insert(parameter.clone(), Value::String(encoded));
        }
        node.set_property("writerProps", props);

        let replacement = self.intrinsic(
            None,
            "SsmParameter",
            Value::String(format!("{{{{resolve:ssm:{}}}}}", parameter)),
        );
        self.add_stack_dependency(side, producer_stack)?;
        self.add_stack_dependency(consumer, side)?;
        self.references.insert(token_id, consumer, replacement);
        Ok(())
    }
}
