//! Result Assembler — packages surviving units into the final output.
//!
//! Re-sums the surviving sizes as a consistency check against the
//! evictor, joins adjacent leaf fragments of the same owner and role, and
//! collects the diagnostics a caller needs to see what was dropped.

use serde::Serialize;
use tokenloom_core::{Phase, RenderError, RenderedMessage, Role};

use crate::cache::CacheStats;
use crate::evict::{Eviction, EvictionReason};
use crate::flatten::{MessageUnit, UnitKind};
use crate::tree::Tree;

// ── Types ─────────────────────────────────────────────────────────────────

/// A unit removed by the evictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedUnit {
    /// Hex fingerprint of the unit's role and content.
    pub content_id: String,
    /// Label or `kind#index` of the terminal node.
    pub node: String,
    pub role: Role,
    pub priority: u32,
    pub order: u64,
    pub size: u64,
    pub reason: EvictionReason,
}

/// A component whose failure was isolated to its own subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedSubtree {
    pub node: String,
    pub component: String,
    pub phase: Phase,
    pub reason: String,
}

/// The outcome of a successful render.
#[derive(Debug, Clone, Serialize)]
pub struct RenderResult {
    /// Surviving content in declaration order.
    pub messages: Vec<RenderedMessage>,
    /// Sum of surviving unit sizes.
    pub total_size: u64,
    /// The budget the render was asked to meet.
    pub budget: u64,
    /// Budget utilization percentage (0.0–100.0, higher when unsatisfiable).
    pub utilization_pct: f32,
    /// Removed units, in declaration order.
    pub evicted: Vec<EvictedUnit>,
    /// Mandatory content alone exceeds the budget or a hard cap.
    pub budget_unsatisfiable: bool,
    /// Subtrees emptied because their component failed.
    pub degraded: Vec<DegradedSubtree>,
    /// Cache lookups made by this request.
    pub cache_stats: CacheStats,
}

impl RenderResult {
    /// Nothing was evicted.
    pub fn is_lossless(&self) -> bool {
        self.evicted.is_empty()
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────

/// Everything the assembler needs beyond the plan itself.
pub(crate) struct AssemblyInput<'a> {
    pub tree: &'a Tree,
    pub units: &'a [MessageUnit],
    pub budget: u64,
    pub leaf_separator: &'a str,
    pub degraded: Vec<DegradedSubtree>,
    pub cache_stats: CacheStats,
}

pub(crate) fn assemble(input: AssemblyInput<'_>, eviction: Eviction) -> Result<RenderResult, RenderError> {
    let AssemblyInput {
        tree,
        units,
        budget,
        leaf_separator,
        degraded,
        cache_stats,
    } = input;

    let actual = eviction
        .kept
        .iter()
        .fold(0u64, |acc, &i| acc.saturating_add(units[i].size));
    if actual != eviction.total {
        return Err(RenderError::Inconsistent {
            expected: eviction.total,
            actual,
        });
    }

    let mut messages: Vec<RenderedMessage> = Vec::with_capacity(eviction.kept.len());
    let mut previous: Option<&MessageUnit> = None;
    for &index in &eviction.kept {
        let unit = &units[index];
        let merge = previous.is_some_and(|p| {
            p.kind == UnitKind::Leaf
                && unit.kind == UnitKind::Leaf
                && p.owner == unit.owner
                && p.role == unit.role
        });
        previous = Some(unit);
        if merge && let Some(last) = messages.last_mut() {
            last.content.push_str(leaf_separator);
            last.content.push_str(&unit.content);
            continue;
        }
        messages.push(RenderedMessage::new(unit.role, unit.content.clone()));
    }

    let evicted = eviction
        .evicted
        .into_iter()
        .map(|record| {
            let unit = &units[record.index];
            EvictedUnit {
                content_id: unit.fingerprint.to_string(),
                node: tree.describe(unit.node),
                role: unit.role,
                priority: unit.priority,
                order: unit.order,
                size: unit.size,
                reason: record.reason,
            }
        })
        .collect();

    let utilization_pct = if budget == 0 {
        0.0
    } else {
        (actual as f64 / budget as f64 * 100.0) as f32
    };

    Ok(RenderResult {
        messages,
        total_size: actual,
        budget,
        utilization_pct,
        evicted,
        budget_unsatisfiable: !eviction.satisfiable,
        degraded,
        cache_stats,
    })
}
