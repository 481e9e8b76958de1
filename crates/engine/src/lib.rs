//! The tokenloom render engine.
//!
//! Turns a declared tree of weighted content nodes into a flat, ordered
//! list of messages whose combined size fits a budget:
//!
//! 1. **Materialize**: prepare and expand components level by level,
//!    handing each child its negotiated share of the budget
//! 2. **Flatten**: walk the finished tree in declaration order, emitting
//!    one prunable unit per leaf with its effective priority
//! 3. **Evict**: drop the lowest-priority units (later declarations first
//!    on ties) until hard caps and the root budget are met
//! 4. **Assemble**: package the survivors plus diagnostics
//!
//! # Determinism
//!
//! Everything after the materialization join is pure and synchronous.
//! Given the same tree, budget and a deterministic measurer, a render
//! always yields the same messages and the same eviction record.

pub mod assemble;
pub mod cache;
pub mod component;
pub mod declare;
pub mod evict;
pub mod flatten;
mod materialize;
pub mod negotiate;
pub mod render;
pub mod token;
pub mod tree;

pub use assemble::{DegradedSubtree, EvictedUnit, RenderResult};
pub use cache::{CacheStats, Lookup, LookupSource, RequestMeasurer, SizeCache};
pub use component::{Component, PreparedState, RenderContext};
pub use declare::{AttrsDecl, NodeDecl};
pub use evict::{Eviction, EvictionReason, EvictionRecord, Evictor, evict};
pub use flatten::{CapScope, Flattened, Flattener, MessageUnit, UnitKind};
pub use negotiate::{ChildSizing, negotiate};
pub use render::Renderer;
pub use token::CharHeuristicMeasurer;
pub use tree::{
    DEFAULT_PRIORITY, KeepEnd, Node, NodeAttrs, NodeId, NodeKind, Resolved, SizeRecord, Tree,
};

pub use tokio_util::sync::CancellationToken;
