use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute map of a node. Ordered so serialization is deterministic.
pub type AttrMap = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Type tags the engine gives meaning to. Any other tag is accepted and
/// behaves as a transparent grouping node.
pub mod kinds {
    pub const ROOT: &str = "root";
    pub const CLAUDE: &str = "claude";
    pub const AGENT: &str = "agent";
    pub const COMMAND: &str = "command";
    pub const APPROVAL: &str = "approval";
    pub const PHASE: &str = "phase";
    pub const STEP: &str = "step";
    pub const PARALLEL: &str = "parallel";
    pub const IF: &str = "if";
    pub const WHILE: &str = "while";
    pub const FRAGMENT: &str = "fragment";
    pub const STOP: &str = "stop";

    /// Kinds whose dispatch spawns an external process.
    pub fn is_runnable(kind: &str) -> bool {
        matches!(kind, CLAUDE | AGENT | COMMAND)
    }

    /// Kinds that get an ExecutionRecord when dispatched.
    pub fn is_dispatchable(kind: &str) -> bool {
        is_runnable(kind) || kind == APPROVAL
    }

    pub fn is_agent(kind: &str) -> bool {
        matches!(kind, CLAUDE | AGENT)
    }

    pub fn required_attrs(kind: &str) -> &'static [&'static str] {
        match kind {
            CLAUDE | AGENT | APPROVAL => &["prompt"],
            COMMAND => &["program"],
            PHASE | STEP => &["name"],
            IF | WHILE => &["condition"],
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A malformed intent tree. Always fatal for the run that produced it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecificationError {
    #[error("duplicate key `{key}` among the children of `{parent}`")]
    DuplicateKey { parent: String, key: String },

    #[error("`{kind}` node at `{path}` is missing required attribute `{attr}`")]
    MissingAttribute {
        kind: String,
        path: String,
        attr: String,
    },

    #[error("empty key on `{kind}` node under `{parent}`")]
    EmptyKey { kind: String, parent: String },

    /// Loop state is stored by key, so `while` nodes need one.
    #[error("`while` node at `{path}` needs a key")]
    UnkeyedLoop { path: String },

    #[error("invalid attribute `{attr}` at `{path}`: {reason}")]
    InvalidAttribute {
        path: String,
        attr: String,
        reason: String,
    },

    #[error("specification failed: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// In-memory identity of a node for the lifetime of one mount.
///
/// Identity survives reconciliation passes as long as the node keeps
/// matching; it is never reused after the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Immutable text fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLeaf(Arc<str>);

impl TextLeaf {
    pub fn new(text: impl AsRef<str>) -> Self {
        Self(Arc::from(text.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeChild {
    Node(NodeId),
    Text(TextLeaf),
}

// ---------------------------------------------------------------------------
// IntentNode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IntentNode {
    pub id: NodeId,
    pub kind: String,
    pub key: Option<String>,
    pub attrs: AttrMap,
    /// Back-reference for tree walks. The tree owns every node.
    pub parent: Option<NodeId>,
    pub children: Vec<TreeChild>,
    /// Deterministic location: `parent/(key | ordinal):kind`.
    pub path: String,
    /// ExecutionRecord currently linked to this node, if any.
    pub record_id: Option<String>,
    /// Reconciler generation in which the node was created.
    pub mounted_at: u64,
}

impl IntentNode {
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }

    /// Booleans may arrive as JSON booleans or as `"true"`/`"false"` strings.
    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        match self.attrs.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        match self.attrs.get(name)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn child_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().filter_map(|c| match c {
            TreeChild::Node(id) => Some(*id),
            TreeChild::Text(_) => None,
        })
    }

    /// `skip="true"`, an `if`/`while` whose condition is false, or a loop
    /// that has finished.
    pub fn is_skipped(&self) -> bool {
        if self.attr_bool("skip") == Some(true) {
            return true;
        }
        if self.kind == kinds::WHILE && self.attr_bool("finished") == Some(true) {
            return true;
        }
        matches!(self.kind.as_str(), kinds::IF | kinds::WHILE)
            && self.attr_bool("condition") != Some(true)
    }

    /// Structural nodes are active unless they carry `active="false"`.
    pub fn is_active(&self) -> bool {
        self.attr_bool("active") != Some(false)
    }

    pub fn is_dispatchable(&self) -> bool {
        kinds::is_dispatchable(&self.kind)
    }
}

// ---------------------------------------------------------------------------
// IntentTree
// ---------------------------------------------------------------------------

/// Arena holding every node of one mount, rooted at a synthetic `root`.
#[derive(Debug, Clone)]
pub struct IntentTree {
    nodes: HashMap<NodeId, IntentNode>,
    root: NodeId,
    next_id: u64,
}

impl IntentTree {
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            IntentNode {
                id: root,
                kind: kinds::ROOT.to_string(),
                key: None,
                attrs: AttrMap::new(),
                parent: None,
                children: Vec::new(),
                path: kinds::ROOT.to_string(),
                record_id: None,
                mounted_at: 0,
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&IntentNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes, excluding the synthetic root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|n| n.child_nodes().collect())
            .unwrap_or_default()
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Ancestors from the direct parent up to (but excluding) the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.parent_of(id);
        while let Some(p) = cursor {
            if p == self.root {
                break;
            }
            out.push(p);
            cursor = self.parent_of(p);
        }
        out
    }

    /// Pre-order traversal of every node below the root.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack: Vec<NodeId> = self.children_of(self.root).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children_of(id).into_iter().rev());
        }
        out
    }

    pub fn find_by_key(&self, key: &str) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|id| self.nodes[id].key.as_deref() == Some(key))
    }

    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        self.nodes.values().find(|n| n.path == path).map(|n| n.id)
    }

    /// First node of `kind` in traversal order.
    pub fn find_kind(&self, kind: &str) -> Option<NodeId> {
        self.walk().into_iter().find(|id| self.nodes[id].kind == kind)
    }

    /// Link an ExecutionRecord to a node. Returns `false` if the node is gone.
    pub fn attach_record(&mut self, id: NodeId, record_id: impl Into<String>) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.record_id = Some(record_id.into());
                true
            }
            None => false,
        }
    }

    pub fn detach_record(&mut self, id: NodeId) -> Option<String> {
        self.nodes.get_mut(&id).and_then(|n| n.record_id.take())
    }

    // ----- crate-internal mutation (reconciler only) -----

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut IntentNode> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn alloc(
        &mut self,
        kind: String,
        key: Option<String>,
        attrs: AttrMap,
        parent: NodeId,
        path: String,
        generation: u64,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            IntentNode {
                id,
                kind,
                key,
                attrs,
                parent: Some(parent),
                children: Vec::new(),
                path,
                record_id: None,
                mounted_at: generation,
            },
        );
        id
    }

    /// Remove `id` and its whole subtree, returning the removed nodes.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) -> Vec<IntentNode> {
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.child_nodes().collect::<Vec<_>>().into_iter().rev());
                removed.push(node);
            }
        }
        removed
    }
}

impl Default for IntentTree {
    fn default() -> Self {
        Self::new()
    }
}
