//! Serializable tree declarations.
//!
//! Lets a static tree be written as JSON or TOML and turned into a [`Node`].
//! Components cannot be declared this way; they only exist in code.
//!
//! ```json
//! { "kind": "container", "children": [
//!     { "kind": "message", "role": "system", "content": "Be concise.", "mandatory": true },
//!     { "kind": "list", "keep": "newest", "positional": true, "priority": 500,
//!       "hard_cap": 2000, "children": [] }
//! ] }
//! ```

use serde::{Deserialize, Serialize};
use tokenloom_core::Role;

use crate::tree::{KeepEnd, Node};

/// Attributes shared by every declared node. All optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrsDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    #[serde(default)]
    pub flex_grow: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_cap: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve: Option<u64>,

    #[serde(default)]
    pub mandatory: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A declared node, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDecl {
    Leaf {
        role: Role,
        text: String,
        #[serde(flatten)]
        attrs: AttrsDecl,
    },
    Message {
        role: Role,
        content: String,
        #[serde(flatten)]
        attrs: AttrsDecl,
    },
    Container {
        #[serde(default)]
        children: Vec<NodeDecl>,
        #[serde(flatten)]
        attrs: AttrsDecl,
    },
    List {
        #[serde(default)]
        keep: KeepEnd,
        #[serde(default)]
        positional: bool,
        #[serde(default)]
        children: Vec<NodeDecl>,
        #[serde(flatten)]
        attrs: AttrsDecl,
    },
}

impl AttrsDecl {
    fn apply(self, mut node: Node) -> Node {
        if let Some(priority) = self.priority {
            node = node.priority(priority);
        }
        if let Some(cap) = self.hard_cap {
            node = node.hard_cap(cap);
        }
        if let Some(reserve) = self.reserve {
            node = node.reserve(reserve);
        }
        if self.mandatory {
            node = node.mandatory();
        }
        if let Some(label) = self.label {
            node = node.label(label);
        }
        node.flex_grow(self.flex_grow)
    }
}

impl From<NodeDecl> for Node {
    fn from(decl: NodeDecl) -> Self {
        match decl {
            NodeDecl::Leaf { role, text, attrs } => attrs.apply(Node::leaf(role, text)),
            NodeDecl::Message {
                role,
                content,
                attrs,
            } => attrs.apply(Node::message(role, content)),
            NodeDecl::Container { children, attrs } => {
                attrs.apply(Node::container().children(children.into_iter().map(Node::from)))
            }
            NodeDecl::List {
                keep,
                positional,
                children,
                attrs,
            } => {
                let list = if positional {
                    Node::positional_list(keep)
                } else {
                    Node::list(keep)
                };
                attrs.apply(list.children(children.into_iter().map(Node::from)))
            }
        }
    }
}
