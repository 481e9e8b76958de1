//! Content tree: the declaration API and the arena it is stored in.
//!
//! Callers declare content as nested, owned [`Node`] values. [`Tree::new`]
//! moves them into a flat arena where every node is addressed by a
//! [`NodeId`] and owned by exactly one parent. Structural problems are
//! rejected right there, before any asynchronous work starts.
//!
//! Nodes are only ever appended (expansion attaches new children to an
//! existing parent), so a parent's id is always lower than its children's.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokenloom_core::{Fingerprint, InvalidTreeError, MeasureInput, Role};

use crate::component::Component;

/// Priority of content that declares none anywhere on its ancestor chain.
pub const DEFAULT_PRIORITY: u32 = u32::MAX;

// ── Declaration ───────────────────────────────────────────────────────────

/// Index of a node inside a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of a list survives longest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepEnd {
    /// Earliest items rank highest; the tail is pruned first.
    Oldest,
    /// Latest items rank highest; the head is pruned first.
    #[default]
    Newest,
}

/// The closed set of node variants.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A text fragment. Adjacent surviving fragments of one owner and role
    /// are joined into a single output message.
    Leaf { role: Role, text: String },
    /// A complete message that maps 1:1 to an output entry.
    Message { role: Role, content: String },
    /// Ordered children.
    Container,
    /// Ordered children sharing the list's priority. A positional list
    /// lowers each item's priority by its rank from the kept end.
    List { keep: KeepEnd, positional: bool },
}

impl NodeKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Leaf { .. } | Self::Message { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Leaf { .. } => "leaf",
            Self::Message { .. } => "message",
            Self::Container => "container",
            Self::List { .. } => "list",
        }
    }
}

/// Attributes shared by every node variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeAttrs {
    /// Explicit priority; `None` inherits from the nearest ancestor.
    pub priority: Option<u32>,
    /// Weight for distributing surplus budget among siblings.
    pub flex_grow: f64,
    /// Absolute ceiling on this subtree's size.
    pub hard_cap: Option<u64>,
    /// Fixed minimum estimate used during negotiation (containers and lists).
    pub reserve: Option<u64>,
    /// Mandatory content is never evicted. Inherited by descendants.
    pub mandatory: bool,
    /// Human-readable name for diagnostics.
    pub label: Option<String>,
}

/// A declared node with its nested children.
pub struct Node {
    kind: NodeKind,
    attrs: NodeAttrs,
    children: Vec<Node>,
    component: Option<Arc<dyn Component>>,
}

impl Node {
    fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind,
            attrs: NodeAttrs::default(),
            children: Vec::new(),
            component: None,
        }
    }

    /// A text fragment attributed to `role`.
    pub fn leaf(role: Role, text: impl Into<String>) -> Self {
        Self::with_kind(NodeKind::Leaf {
            role,
            text: text.into(),
        })
    }

    /// A standalone message.
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        Self::with_kind(NodeKind::Message {
            role,
            content: content.into(),
        })
    }

    pub fn container() -> Self {
        Self::with_kind(NodeKind::Container)
    }

    /// A list whose items all share the list's priority.
    pub fn list(keep: KeepEnd) -> Self {
        Self::with_kind(NodeKind::List {
            keep,
            positional: false,
        })
    }

    /// A list whose items lose one priority point per rank away from `keep`.
    pub fn positional_list(keep: KeepEnd) -> Self {
        Self::with_kind(NodeKind::List {
            keep,
            positional: true,
        })
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.attrs.priority = Some(priority);
        self
    }

    pub fn flex_grow(mut self, weight: f64) -> Self {
        self.attrs.flex_grow = weight;
        self
    }

    pub fn hard_cap(mut self, cap: u64) -> Self {
        self.attrs.hard_cap = Some(cap);
        self
    }

    pub fn reserve(mut self, estimate: u64) -> Self {
        self.attrs.reserve = Some(estimate);
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.attrs.mandatory = true;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.attrs.label = Some(label.into());
        self
    }

    pub fn child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Attach a component whose expansion is appended after declared children.
    pub fn component(mut self, component: Arc<dyn Component>) -> Self {
        self.component = Some(component);
        self
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn attrs(&self) -> &NodeAttrs {
        &self.attrs
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("attrs", &self.attrs)
            .field("children", &self.children)
            .field("component", &self.component.as_ref().map(|c| c.name()))
            .finish()
    }
}

// ── Arena ─────────────────────────────────────────────────────────────────

/// Inherited attributes of one node, as computed by [`Tree::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub priority: u32,
    pub mandatory: bool,
}

impl Default for Resolved {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            mandatory: false,
        }
    }
}

/// Measured size of a terminal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRecord {
    pub size: u64,
    /// `false` when measurement failed and the size is a stand-in.
    pub measured: bool,
    pub fingerprint: Fingerprint,
}

struct NodeData {
    kind: NodeKind,
    attrs: NodeAttrs,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    component: Option<Arc<dyn Component>>,
    size: Option<SizeRecord>,
}

/// A validated, arena-backed content tree, consumed by a single render.
pub struct Tree {
    nodes: Vec<NodeData>,
    root: NodeId,
}

impl Tree {
    /// Move a declared node hierarchy into an arena, validating as it goes.
    pub fn new(root: Node) -> Result<Self, InvalidTreeError> {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        tree.root = tree.insert(None, root)?;
        tree.check_acyclic()?;
        Ok(tree)
    }

    fn insert(&mut self, parent: Option<NodeId>, node: Node) -> Result<NodeId, InvalidTreeError> {
        let id = NodeId(self.nodes.len());
        let describe = || describe_parts(&node.kind, &node.attrs, id);

        let weight = node.attrs.flex_grow;
        if !weight.is_finite() || weight < 0.0 {
            return Err(InvalidTreeError::InvalidFlexGrow {
                node: describe(),
                value: weight,
            });
        }
        if node.kind.is_terminal() && !node.children.is_empty() {
            return Err(InvalidTreeError::ChildrenOnTerminal { node: describe() });
        }
        if node.kind.is_terminal() && node.component.is_some() {
            return Err(InvalidTreeError::ComponentOnTerminal { node: describe() });
        }

        let Node {
            kind,
            attrs,
            children,
            component,
        } = node;
        self.nodes.push(NodeData {
            kind,
            attrs,
            parent,
            children: Vec::with_capacity(children.len()),
            component,
            size: None,
        });

        for child in children {
            let child_id = self.insert(Some(id), child)?;
            self.nodes[id.0].children.push(child_id);
        }
        Ok(id)
    }

    /// Append expanded children to `parent`, after any existing ones.
    pub(crate) fn attach(
        &mut self,
        parent: NodeId,
        nodes: Vec<Node>,
    ) -> Result<Vec<NodeId>, InvalidTreeError> {
        if self.nodes[parent.0].kind.is_terminal() && !nodes.is_empty() {
            return Err(InvalidTreeError::ChildrenOnTerminal {
                node: self.describe(parent),
            });
        }
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let id = self.insert(Some(parent), node)?;
            self.nodes[parent.0].children.push(id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Detach every child of `id`, leaving an empty subtree.
    pub(crate) fn clear_children(&mut self, id: NodeId) {
        self.nodes[id.0].children.clear();
    }

    /// Verify every reachable node has exactly one parent.
    fn check_acyclic(&self) -> Result<(), InvalidTreeError> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.0], true) {
                return Err(InvalidTreeError::Cycle {
                    node: self.describe(id),
                });
            }
            for &child in &self.nodes[id.0].children {
                if self.nodes[child.0].parent != Some(id) {
                    return Err(InvalidTreeError::Cycle {
                        node: self.describe(child),
                    });
                }
                stack.push(child);
            }
        }
        Ok(())
    }

    /// Reject any hard cap larger than the budget it inherits.
    pub fn validate_caps(&self, budget: u64) -> Result<(), InvalidTreeError> {
        self.validate_caps_from(self.root, budget)
    }

    pub(crate) fn validate_caps_from(
        &self,
        start: NodeId,
        inherited: u64,
    ) -> Result<(), InvalidTreeError> {
        let mut stack = vec![(start, inherited)];
        while let Some((id, inherited)) = stack.pop() {
            let mut limit = inherited;
            if let Some(cap) = self.nodes[id.0].attrs.hard_cap {
                if cap > inherited {
                    return Err(InvalidTreeError::HardCapExceedsBudget {
                        node: self.describe(id),
                        cap,
                        inherited,
                    });
                }
                limit = cap;
            }
            for &child in &self.nodes[id.0].children {
                stack.push((child, limit));
            }
        }
        Ok(())
    }

    /// The tightest ceiling that applies to children of `id`.
    pub(crate) fn limit_below(&self, id: NodeId, budget: u64) -> u64 {
        let mut limit = budget;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if let Some(cap) = self.nodes[current.0].attrs.hard_cap {
                limit = limit.min(cap);
            }
            cursor = self.nodes[current.0].parent;
        }
        limit
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes in the arena, including detached ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    pub fn attrs(&self, id: NodeId) -> &NodeAttrs {
        &self.nodes[id.0].attrs
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn size(&self, id: NodeId) -> Option<SizeRecord> {
        self.nodes[id.0].size
    }

    pub(crate) fn set_size(&mut self, id: NodeId, record: SizeRecord) {
        self.nodes[id.0].size = Some(record);
    }

    pub(crate) fn has_component(&self, id: NodeId) -> bool {
        self.nodes[id.0].component.is_some()
    }

    /// Take the node's component so it is expanded at most once.
    pub(crate) fn take_component(&mut self, id: NodeId) -> Option<Arc<dyn Component>> {
        self.nodes[id.0].component.take()
    }

    /// The content to measure for a terminal node.
    pub fn measure_input(&self, id: NodeId) -> Option<MeasureInput> {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf { role, text } => Some(MeasureInput::new(*role, text.clone())),
            NodeKind::Message { role, content } => Some(MeasureInput::new(*role, content.clone())),
            _ => None,
        }
    }

    /// Fixed-size estimate handed to the negotiator.
    pub fn min_estimate(&self, id: NodeId) -> u64 {
        let data = &self.nodes[id.0];
        if data.kind.is_terminal() {
            data.size.map_or(0, |s| s.size)
        } else {
            data.attrs.reserve.unwrap_or(0)
        }
    }

    /// Priority after inheritance and positional-list adjustment.
    ///
    /// Walks the ancestor chain; use [`Tree::resolve`] when every node's
    /// priority is needed.
    pub fn effective_priority(&self, id: NodeId) -> u32 {
        let data = &self.nodes[id.0];
        if let Some(priority) = data.attrs.priority {
            return priority;
        }
        let Some(parent) = data.parent else {
            return DEFAULT_PRIORITY;
        };
        let siblings = &self.nodes[parent.0].children;
        let position = siblings.iter().position(|&c| c == id).unwrap_or(0);
        inherited_priority(
            &self.nodes[parent.0].kind,
            self.effective_priority(parent),
            siblings.len(),
            position,
        )
    }

    /// Effective priorities of the children of `id`, in order.
    pub fn child_priorities(&self, id: NodeId) -> Vec<u32> {
        let data = &self.nodes[id.0];
        let base = self.effective_priority(id);
        data.children
            .iter()
            .enumerate()
            .map(|(position, &child)| {
                self.nodes[child.0].attrs.priority.unwrap_or_else(|| {
                    inherited_priority(&data.kind, base, data.children.len(), position)
                })
            })
            .collect()
    }

    /// Effective priority and mandatory flag of every node, indexed by
    /// [`NodeId::index`]. Parents precede their children in the arena, so a
    /// single forward sweep settles each node from its parent.
    pub fn resolve(&self) -> Vec<Resolved> {
        let mut out = vec![Resolved::default(); self.nodes.len()];
        let root = &self.nodes[self.root.0].attrs;
        out[self.root.0] = Resolved {
            priority: root.priority.unwrap_or(DEFAULT_PRIORITY),
            mandatory: root.mandatory,
        };

        for (index, data) in self.nodes.iter().enumerate() {
            let parent = out[index];
            for (position, &child) in data.children.iter().enumerate() {
                let attrs = &self.nodes[child.0].attrs;
                out[child.0] = Resolved {
                    priority: attrs.priority.unwrap_or_else(|| {
                        inherited_priority(&data.kind, parent.priority, data.children.len(), position)
                    }),
                    mandatory: parent.mandatory || attrs.mandatory,
                };
            }
        }
        out
    }

    /// Whether this node or any ancestor is marked mandatory.
    pub fn is_mandatory(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.nodes[current.0].attrs.mandatory {
                return true;
            }
            cursor = self.nodes[current.0].parent;
        }
        false
    }

    /// Label if one was given, otherwise `kind#index`.
    pub fn describe(&self, id: NodeId) -> String {
        let data = &self.nodes[id.0];
        describe_parts(&data.kind, &data.attrs, id)
    }
}

/// Priority a child without its own inherits from a parent of `kind`.
fn inherited_priority(kind: &NodeKind, base: u32, siblings: usize, position: usize) -> u32 {
    match kind {
        NodeKind::List {
            keep,
            positional: true,
        } => {
            let rank = match keep {
                KeepEnd::Oldest => position,
                KeepEnd::Newest => siblings - 1 - position,
            };
            base.saturating_sub(u32::try_from(rank).unwrap_or(u32::MAX))
        }
        _ => base,
    }
}

fn describe_parts(kind: &NodeKind, attrs: &NodeAttrs, id: NodeId) -> String {
    match &attrs.label {
        Some(label) => label.clone(),
        None => format!("{}{}", kind.name(), id),
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .finish()
    }
}
