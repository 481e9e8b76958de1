//! Evictor — priority-driven, order-preserving pruning.
//!
//! Units are removed one at a time (or one atomic group at a time) until
//! the remaining total fits. Removal order:
//!
//! 1. unmeasured units (size unknown, treated as maximal)
//! 2. lowest effective priority
//! 3. on equal priority, the later-declared unit goes first
//!
//! Mandatory and zero-size units are never removed. Hard-capped scopes are
//! pruned to their own cap first, deepest scope first, then the whole
//! sequence is pruned to the budget. Survivors keep their original order.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::ops::Range;

use serde::Serialize;

use crate::flatten::{CapScope, MessageUnit};
use crate::tree::NodeId;

/// Why a unit was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvictionReason {
    /// Needed to bring the whole sequence within the request budget.
    Budget,
    /// Needed to bring a hard-capped subtree within its cap.
    HardCap { container: String, cap: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionRecord {
    /// Index into the flattened unit list.
    pub index: usize,
    pub reason: EvictionReason,
}

/// Outcome of an eviction plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// Surviving unit indices, ascending.
    pub kept: Vec<usize>,
    /// Removed units, ascending by index.
    pub evicted: Vec<EvictionRecord>,
    /// Sum of kept sizes, saturating.
    pub total: u64,
    /// `false` when mandatory content alone overflows a cap or the budget.
    pub satisfiable: bool,
}

impl Eviction {
    pub fn is_lossless(&self) -> bool {
        self.evicted.is_empty()
    }
}

/// Pure, synchronous eviction planner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evictor;

impl Evictor {
    /// Plan which units survive. Never reorders; only removes.
    pub fn plan(units: &[MessageUnit], scopes: &[CapScope], budget: u64) -> Eviction {
        let groups = group_members(units);
        let mut removed: Vec<Option<EvictionReason>> = vec![None; units.len()];
        let mut satisfiable = true;

        let mut ordered: Vec<&CapScope> = scopes.iter().collect();
        ordered.sort_by_key(|s| (Reverse(s.depth), s.units.start));
        for scope in ordered {
            let reason = EvictionReason::HardCap {
                container: scope.label.clone(),
                cap: scope.cap,
            };
            satisfiable &= evict_range(
                units,
                scope.units.clone(),
                scope.cap,
                &reason,
                &groups,
                &mut removed,
            );
        }

        satisfiable &= evict_range(
            units,
            0..units.len(),
            budget,
            &EvictionReason::Budget,
            &groups,
            &mut removed,
        );

        let mut kept = Vec::new();
        let mut evicted = Vec::new();
        let mut total = 0u64;
        for (index, reason) in removed.into_iter().enumerate() {
            match reason {
                Some(reason) => evicted.push(EvictionRecord { index, reason }),
                None => {
                    total = total.saturating_add(units[index].size);
                    kept.push(index);
                }
            }
        }

        if !satisfiable {
            tracing::warn!(total, budget, "Mandatory content exceeds the available budget");
        }

        Eviction {
            kept,
            evicted,
            total,
            satisfiable,
        }
    }
}

/// Convenience for a plan without hard caps.
pub fn evict(units: &[MessageUnit], budget: u64) -> Eviction {
    Evictor::plan(units, &[], budget)
}

fn group_members(units: &[MessageUnit]) -> HashMap<NodeId, Vec<usize>> {
    let mut groups: HashMap<NodeId, Vec<usize>> = HashMap::new();
    for (index, unit) in units.iter().enumerate() {
        if let Some(group) = unit.group {
            groups.entry(group).or_default().push(index);
        }
    }
    groups
}

/// Remove units inside `range` until what is left fits `limit`.
/// Returns whether the limit was reached.
fn evict_range(
    units: &[MessageUnit],
    range: Range<usize>,
    limit: u64,
    reason: &EvictionReason,
    groups: &HashMap<NodeId, Vec<usize>>,
    removed: &mut [Option<EvictionReason>],
) -> bool {
    let limit = u128::from(limit);
    let mut total: u128 = range
        .clone()
        .filter(|&i| removed[i].is_none())
        .map(|i| u128::from(units[i].size))
        .sum();
    if total <= limit {
        return true;
    }

    let mut candidates: Vec<usize> = range
        .clone()
        .filter(|&i| removed[i].is_none() && !units[i].mandatory && units[i].size > 0)
        .collect();
    candidates.sort_by_key(|&i| {
        let u = &units[i];
        (u.measured, u.priority, Reverse(u.order))
    });

    for index in candidates {
        if total <= limit {
            break;
        }
        if removed[index].is_some() {
            continue;
        }

        let single = [index];
        let victims: &[usize] = match units[index].group.and_then(|g| groups.get(&g)) {
            Some(members) => members,
            None => &single,
        };
        for &victim in victims {
            if !range.contains(&victim) || removed[victim].is_some() || units[victim].mandatory {
                continue;
            }
            tracing::trace!(
                order = units[victim].order,
                priority = units[victim].priority,
                size = units[victim].size,
                ?reason,
                "Evicting unit"
            );
            removed[victim] = Some(reason.clone());
            total -= u128::from(units[victim].size);
        }
    }

    total <= limit
}
