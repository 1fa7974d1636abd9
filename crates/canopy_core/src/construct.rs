//! Construct tree nodes.
//!
//! The tree lives in an arena owned by [`App`](crate::App). Nodes refer to
//! each other through [`ConstructId`] handles, never through owned pointers,
//! so a rule can refer to its targets and a target to its rule without
//! ownership cycles.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::app::App;
use crate::resource::ResourceNode;
use crate::stack::StackData;
use crate::tags::TagEntry;

/// Separator between construct ids in a path.
pub const PATH_SEPARATOR: char = '/';

/// Handle to a node in the construct arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConstructId(pub(crate) usize);

impl ConstructId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ConstructId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A validator registered on a construct; returns zero or more messages.
pub type Validator = Box<dyn Fn(&App, ConstructId) -> Vec<String>>;

/// What a node is.
pub enum NodeKind {
    /// The singleton app root.
    Root,
    /// A plain grouping construct.
    Construct,
    Stack(Box<StackData>),
    Resource(Box<ResourceNode>),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Construct => "construct",
            NodeKind::Stack(_) => "stack",
            NodeKind::Resource(_) => "resource",
        }
    }
}

/// A node in the construct tree.
pub struct Node {
    pub(crate) id: String,
    pub(crate) parent: Option<ConstructId>,
    pub(crate) children: Vec<ConstructId>,
    pub(crate) kind: NodeKind,
    pub(crate) context: BTreeMap<String, Value>,
    pub(crate) metadata: BTreeMap<String, Value>,
    pub(crate) tags: Vec<TagEntry>,
    pub(crate) dependencies: Vec<ConstructId>,
    pub(crate) validators: Vec<Validator>,
}

impl Node {
    pub(crate) fn new(id: String, parent: Option<ConstructId>, kind: NodeKind) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            kind,
            context: BTreeMap::new(),
            metadata: BTreeMap::new(),
            tags: Vec::new(),
            dependencies: Vec::new(),
            validators: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<ConstructId> {
        self.parent
    }

    pub fn children(&self) -> &[ConstructId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn dependencies(&self) -> &[ConstructId] {
        &self.dependencies
    }

    pub fn is_stack(&self) -> bool {
        matches!(self.kind, NodeKind::Stack(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.kind, NodeKind::Resource(_))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("kind", &self.kind.label())
            .field("children", &self.children.len())
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// Make an id safe for use as a path segment.
pub fn sanitize_id(id: &str) -> String {
    id.replace(PATH_SEPARATOR, "--")
}
