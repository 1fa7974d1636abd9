//! The app: root of the construct tree and owner of every process-wide
//! service used during construction (token registry, context cache,
//! diagnostics sink, deferred linkers).

use std::cell::RefCell;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::construct::{sanitize_id, ConstructId, Node, NodeKind, PATH_SEPARATOR};
use crate::context::{ContextProvider, ContextStore, FileContextProvider};
use crate::error::{CoreError, CoreResult};
use crate::linker::{Linker, ReferenceTable};
use crate::resource::ResourceNode;
use crate::stack::StackData;
use crate::token::TokenRegistry;

/// Lifecycle phase of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// User code is building the tree.
    Construction,
    /// Deferred linkers and cross-stack references are being materialized.
    Linking,
    /// Validators run; the tree is frozen.
    Validation,
    /// Templates are being rendered.
    Synthesis,
    Done,
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// A message attached to a construct during construction or synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

/// Root of a construct tree.
pub struct App {
    pub(crate) nodes: Vec<Node>,
    pub(crate) tokens: TokenRegistry,
    pub(crate) phase: Phase,
    pub(crate) config: AppConfig,
    pub(crate) context: ContextStore,
    pub(crate) flag_reads: RefCell<BTreeSet<String>>,
    pub(crate) diagnostics: RefCell<Vec<Diagnostic>>,
    pub(crate) linkers: Vec<Box<dyn Linker>>,
    pub(crate) references: ReferenceTable,
    pub(crate) tag_sequence: u64,
}

impl App {
    /// Create an app with default configuration and an empty context cache.
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    /// Create an app with the given configuration and an empty context cache.
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            nodes: vec![Node::new(String::new(), None, NodeKind::Root)],
            tokens: TokenRegistry::new(),
            phase: Phase::Construction,
            config,
            context: ContextStore::new(Box::new(FileContextProvider::empty())),
            flag_reads: RefCell::new(BTreeSet::new()),
            diagnostics: RefCell::new(Vec::new()),
            linkers: Vec::new(),
            references: ReferenceTable::default(),
            tag_sequence: 0,
        }
    }

    /// Create an app and load the context cache named by the configuration.
    pub fn from_config(config: AppConfig) -> CoreResult<Self> {
        let provider = FileContextProvider::load(&config.context_file)?;
        let mut app = Self::with_config(config);
        app.set_context_provider(Box::new(provider));
        Ok(app)
    }

    /// Replace the context cache used for lookups.
    pub fn set_context_provider(&mut self, provider: Box<dyn ContextProvider>) {
        self.context = ContextStore::new(provider);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn root(&self) -> ConstructId {
        ConstructId(0)
    }

    pub(crate) fn ensure_mutable(&self, id: ConstructId, what: &str) -> CoreResult<()> {
        match self.phase {
            Phase::Construction | Phase::Linking => Ok(()),
            _ => Err(CoreError::invalid(
                self.path(id),
                format!("cannot {}: construction has ended", what),
            )),
        }
    }

    pub(crate) fn attach(
        &mut self,
        parent: ConstructId,
        id: &str,
        kind: NodeKind,
    ) -> CoreResult<ConstructId> {
        self.ensure_mutable(parent, "add a construct")?;
        self.check_exists(parent)?;
        let id = sanitize_id(id);
        if id.is_empty() {
            return Err(CoreError::invalid(
                self.path(parent),
                "only the app root may have an empty id",
            ));
        }
        if self.find_child(parent, &id).is_some() {
            return Err(CoreError::DuplicateId {
                path: self.path(parent),
                id,
            });
        }

        let handle = ConstructId(self.nodes.len());
        debug!("Adding {} '{}' under {}", kind.label(), id, self.path(parent));
        self.nodes.push(Node::new(id, Some(parent), kind));
        self.nodes[parent.0].children.push(handle);
        Ok(handle)
    }

    fn check_exists(&self, id: ConstructId) -> CoreResult<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(CoreError::invalid("", format!("unknown construct {}", id)))
        }
    }

    /// Add a plain grouping construct.
    pub fn add_construct(&mut self, parent: ConstructId, id: &str) -> CoreResult<ConstructId> {
        self.attach(parent, id, NodeKind::Construct)
    }

    pub fn node(&self, id: ConstructId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: ConstructId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Number of constructs in the tree, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn children(&self, id: ConstructId) -> &[ConstructId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: ConstructId) -> Option<ConstructId> {
        self.nodes[id.0].parent
    }

    pub fn find_child(&self, parent: ConstructId, id: &str) -> Option<ConstructId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child.0].id == id)
    }

    /// Find a construct by its full path.
    pub fn find_by_path(&self, path: &str) -> Option<ConstructId> {
        let mut current = self.root();
        for segment in path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()) {
            current = self.find_child(current, segment)?;
        }
        Some(current)
    }

    /// The construct itself followed by each ancestor up to the root.
    pub fn ancestors(&self, id: ConstructId) -> Vec<ConstructId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// The construct and everything below it, in pre-order.
    pub fn descendants(&self, id: ConstructId) -> Vec<ConstructId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            for child in self.nodes[next.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Whether `id` is `ancestor` or lies below it.
    pub fn is_within(&self, id: ConstructId, ancestor: ConstructId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    /// Path of a construct: ancestor ids below the root joined by `/`.
    pub fn path(&self, id: ConstructId) -> String {
        if id.0 >= self.nodes.len() {
            return String::new();
        }
        let mut segments: Vec<&str> = self
            .ancestors(id)
            .into_iter()
            .filter(|a| self.nodes[a.0].parent.is_some())
            .map(|a| self.nodes[a.0].id.as_str())
            .collect();
        segments.reverse();
        segments.join(&PATH_SEPARATOR.to_string())
    }

    /// Register a validator invoked once at the end of construction.
    pub fn add_validation<F>(&mut self, id: ConstructId, validator: F) -> CoreResult<()>
    where
        F: Fn(&App, ConstructId) -> Vec<String> + 'static,
    {
        self.ensure_mutable(id, "add a validation")?;
        self.nodes[id.0].validators.push(Box::new(validator));
        Ok(())
    }

    pub fn add_metadata(&mut self, id: ConstructId, key: &str, value: Value) -> CoreResult<()> {
        self.ensure_mutable(id, "add metadata")?;
        self.nodes[id.0].metadata.insert(key.to_string(), value);
        Ok(())
    }

    pub fn metadata(&self, id: ConstructId, key: &str) -> Option<&Value> {
        self.nodes[id.0].metadata.get(key)
    }

    /// Declare that `from` depends on `to`. Both may be any construct; the
    /// edge is expanded to every resource below them during linking.
    pub fn add_dependency(&mut self, from: ConstructId, to: ConstructId) -> CoreResult<()> {
        self.ensure_mutable(from, "add a dependency")?;
        if from == to {
            return Err(CoreError::invalid(
                self.path(from),
                "a construct cannot depend on itself",
            ));
        }
        let deps = &mut self.nodes[from.0].dependencies;
        if !deps.contains(&to) {
            deps.push(to);
        }
        Ok(())
    }

    /// Nearest stack at or above `id`.
    pub fn stack_of(&self, id: ConstructId) -> CoreResult<ConstructId> {
        self.ancestors(id)
            .into_iter()
            .find(|a| self.nodes[a.0].is_stack())
            .ok_or_else(|| {
                CoreError::invalid(self.path(id), "construct is not defined within a stack")
            })
    }

    pub fn stack_data(&self, id: ConstructId) -> Option<&StackData> {
        match &self.nodes[id.0].kind {
            NodeKind::Stack(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn stack_data_mut(&mut self, id: ConstructId) -> CoreResult<&mut StackData> {
        let path = self.path(id);
        match &mut self.nodes[id.0].kind {
            NodeKind::Stack(data) => Ok(data),
            _ => Err(CoreError::invalid(path, "construct is not a stack")),
        }
    }

    /// Stack data for a construct that must be a stack.
    pub fn stack(&self, id: ConstructId) -> CoreResult<&StackData> {
        self.stack_data(id)
            .ok_or_else(|| CoreError::invalid(self.path(id), "construct is not a stack"))
    }

    pub fn resource(&self, id: ConstructId) -> Option<&ResourceNode> {
        match &self.nodes[id.0].kind {
            NodeKind::Resource(node) => Some(node),
            _ => None,
        }
    }

    /// Mutable access to a resource node during construction.
    pub fn resource_mut(&mut self, id: ConstructId) -> CoreResult<&mut ResourceNode> {
        self.ensure_mutable(id, "modify a resource")?;
        let path = self.path(id);
        match &mut self.nodes[id.0].kind {
            NodeKind::Resource(node) => Ok(node),
            _ => Err(CoreError::invalid(path, "construct is not a resource")),
        }
    }

    /// Every stack in the tree, in pre-order.
    pub fn stacks(&self) -> Vec<ConstructId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|id| self.nodes[id.0].is_stack())
            .collect()
    }

    /// Resources owned directly by `stack`, in declaration order.
    pub fn stack_resources(&self, stack: ConstructId) -> Vec<ConstructId> {
        self.descendants(stack)
            .into_iter()
            .filter(|id| self.nodes[id.0].is_resource())
            .filter(|id| self.stack_of(*id).ok() == Some(stack))
            .collect()
    }

    /// Record a warning against a construct.
    pub fn add_warning(&self, id: ConstructId, message: impl Into<String>) {
        let message = message.into();
        let path = self.path(id);
        warn!("{}: {}", path, message);
        self.diagnostics.borrow_mut().push(Diagnostic {
            level: DiagnosticLevel::Warning,
            path,
            message,
        });
    }

    /// Record an informational message against a construct.
    pub fn add_info(&self, id: ConstructId, message: impl Into<String>) {
        let message = message.into();
        let path = self.path(id);
        info!("{}: {}", path, message);
        self.diagnostics.borrow_mut().push(Diagnostic {
            level: DiagnosticLevel::Info,
            path,
            message,
        });
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow().clone()
    }

    pub fn warnings(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .borrow()
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Warning)
            .cloned()
            .collect()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("phase", &self.phase)
            .field("constructs", &self.nodes.len())
            .field("tokens", &self.tokens.len())
            .finish()
    }
}
