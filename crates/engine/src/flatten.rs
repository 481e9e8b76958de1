//! Flattener — linearizes a materialized tree into prunable units.
//!
//! Pre-order walk, so units come out in declaration order and every
//! subtree occupies one contiguous range of the output. Hard-capped
//! containers are reported as [`CapScope`]s over those ranges.

use std::ops::Range;

use tokenloom_config::EvictionGranularity;
use tokenloom_core::{Fingerprint, Role};

use crate::tree::{NodeId, NodeKind, Resolved, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Leaf,
    Message,
}

/// The smallest prunable piece of output.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUnit {
    pub role: Role,
    pub content: String,
    pub size: u64,
    pub priority: u32,
    /// Running counter of the walk; strictly increasing along the output.
    pub order: u64,
    /// Parent of the terminal node (the node itself when it is the root).
    pub owner: NodeId,
    pub node: NodeId,
    pub kind: UnitKind,
    pub mandatory: bool,
    /// `false` when measurement failed and `size` is a stand-in.
    pub measured: bool,
    /// Atomic group root, when evicting uniform subtrees as a whole.
    pub group: Option<NodeId>,
    pub fingerprint: Fingerprint,
}

/// The unit range covered by one hard-capped node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapScope {
    pub container: NodeId,
    pub label: String,
    pub cap: u64,
    pub depth: usize,
    pub units: Range<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    pub units: Vec<MessageUnit>,
    pub scopes: Vec<CapScope>,
}

impl Flattened {
    pub fn total(&self) -> u64 {
        self.units
            .iter()
            .fold(0u64, |acc, u| acc.saturating_add(u.size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Uniformity {
    Empty,
    Uniform { priority: u32, mandatory: bool },
    Mixed,
}

impl Uniformity {
    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, x) | (x, Self::Empty) => x,
            (a @ Self::Uniform { .. }, b @ Self::Uniform { .. }) if a == b => a,
            _ => Self::Mixed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Flattener {
    granularity: EvictionGranularity,
}

impl Flattener {
    pub fn new(granularity: EvictionGranularity) -> Self {
        Self { granularity }
    }

    pub fn flatten(&self, tree: &Tree) -> Flattened {
        let resolved = tree.resolve();
        let groups = match self.granularity {
            EvictionGranularity::Unit => None,
            EvictionGranularity::UniformSubtree => Some(uniformity(tree, &resolved)),
        };

        let mut walker = Walker {
            tree,
            resolved: &resolved,
            groups: groups.as_deref(),
            out: Flattened::default(),
        };
        walker.walk(tree.root(), 0);
        let out = walker.out;

        tracing::debug!(
            units = out.units.len(),
            scopes = out.scopes.len(),
            "Flattened tree"
        );
        out
    }
}

struct Walker<'a> {
    tree: &'a Tree,
    resolved: &'a [Resolved],
    groups: Option<&'a [Uniformity]>,
    out: Flattened,
}

impl Walker<'_> {
    fn walk(&mut self, id: NodeId, depth: usize) {
        let tree = self.tree;
        let start = self.out.units.len();

        match tree.kind(id) {
            NodeKind::Leaf { role, text } => self.emit(id, *role, text, UnitKind::Leaf),
            NodeKind::Message { role, content } => self.emit(id, *role, content, UnitKind::Message),
            NodeKind::Container | NodeKind::List { .. } => {
                for &child in tree.children(id) {
                    self.walk(child, depth + 1);
                }
            }
        }

        if let Some(cap) = tree.attrs(id).hard_cap {
            self.out.scopes.push(CapScope {
                container: id,
                label: tree.describe(id),
                cap,
                depth,
                units: start..self.out.units.len(),
            });
        }
    }

    fn emit(&mut self, id: NodeId, role: Role, content: &str, kind: UnitKind) {
        let tree = self.tree;
        let record = tree.size(id);
        let fingerprint = match record {
            Some(r) => r.fingerprint,
            None => tokenloom_core::MeasureInput::new(role, content).fingerprint(),
        };
        let resolved = self.resolved[id.index()];
        let order = self.out.units.len() as u64;
        self.out.units.push(MessageUnit {
            role,
            content: content.to_string(),
            size: record.map_or(0, |r| r.size),
            priority: resolved.priority,
            order,
            owner: tree.parent(id).unwrap_or(id),
            node: id,
            kind,
            mandatory: resolved.mandatory,
            measured: record.is_some_and(|r| r.measured),
            group: self.groups.and_then(|g| group_root(tree, id, g)),
            fingerprint,
        });
    }
}

/// Uniformity of every node's subtree. Children always have larger ids than
/// their parent, so a reverse sweep visits children first.
fn uniformity(tree: &Tree, resolved: &[Resolved]) -> Vec<Uniformity> {
    let mut result = vec![Uniformity::Empty; tree.len()];
    for index in (0..tree.len()).rev() {
        let id = NodeId::from_index(index);
        let value = if tree.kind(id).is_terminal() {
            Uniformity::Uniform {
                priority: resolved[index].priority,
                mandatory: resolved[index].mandatory,
            }
        } else {
            tree.children(id)
                .iter()
                .fold(Uniformity::Empty, |acc, c| acc.merge(result[c.index()]))
        };
        result[index] = value;
    }
    result
}

/// Top-most non-root container above `leaf` whose subtree is uniform.
fn group_root(tree: &Tree, leaf: NodeId, uniform: &[Uniformity]) -> Option<NodeId> {
    let mut found = None;
    let mut cursor = tree.parent(leaf);
    while let Some(id) = cursor {
        if id == tree.root() || uniform[id.index()] == Uniformity::Mixed {
            break;
        }
        if matches!(tree.kind(id), NodeKind::Container) {
            found = Some(id);
        }
        if tree.attrs(id).hard_cap.is_some() {
            break;
        }
        cursor = tree.parent(id);
    }
    found
}
