//! Budget negotiation between siblings.
//!
//! Water-filling: every child first gets its fixed minimum (clipped to its
//! hard cap), then whatever is left over is split among flexible children
//! in proportion to their `flex_grow` weight. Children that would overshoot
//! their cap are pinned at the cap and the rest is split again among the
//! others. Pure and synchronous.
//!
//! # Rounding
//!
//! Weights are converted to fixed-point integers (millionths, at least 1)
//! and each share is floored. When the largest weight is above a million,
//! every weight is scaled down by the same factor first so the fixed-point
//! products stay within `u128`. The units lost to flooring are handed out one
//! at a time to flexible children ordered by priority (highest first), then
//! by declaration order. The result is independent of float formatting and
//! identical across platforms.

/// What the negotiator needs to know about one child.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildSizing {
    /// Size reserved before any surplus is handed out.
    pub min: u64,
    pub flex_grow: f64,
    pub hard_cap: Option<u64>,
    /// Effective priority; only used to place rounding remainders.
    pub priority: u32,
}

impl ChildSizing {
    pub fn fixed(min: u64) -> Self {
        Self {
            min,
            flex_grow: 0.0,
            hard_cap: None,
            priority: 0,
        }
    }

    pub fn flexible(min: u64, flex_grow: f64) -> Self {
        Self {
            flex_grow,
            ..Self::fixed(min)
        }
    }

    pub fn with_cap(mut self, cap: u64) -> Self {
        self.hard_cap = Some(cap);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn below_cap(&self, allotted: u64) -> bool {
        self.hard_cap.is_none_or(|cap| allotted < cap)
    }
}

const WEIGHT_SCALE: f64 = 1_000_000.0;

/// Upper bound of a fixed-point weight. `u64::MAX * MAX_FIXED` fits in `u128`.
const MAX_FIXED: f64 = 1e12;

fn fixed_point(weight: f64, scale: f64) -> u128 {
    ((weight * scale).round() as u128).max(1)
}

/// Scale for a set of weights whose largest member is `max`.
fn weight_scale(max: f64) -> f64 {
    if max * WEIGHT_SCALE <= MAX_FIXED {
        WEIGHT_SCALE
    } else {
        MAX_FIXED / max
    }
}

/// Assign each child a share of `budget`. Output is index-aligned with input.
///
/// When the minimums alone exceed the budget every child gets exactly its
/// minimum; overflow is left for eviction to resolve.
pub fn negotiate(budget: u64, children: &[ChildSizing]) -> Vec<u64> {
    let mut allotted: Vec<u64> = children
        .iter()
        .map(|c| c.hard_cap.map_or(c.min, |cap| c.min.min(cap)))
        .collect();

    let reserved = allotted.iter().fold(0u64, |acc, &a| acc.saturating_add(a));
    if reserved >= budget {
        return allotted;
    }
    let mut surplus = budget - reserved;

    let mut flexible: Vec<usize> = (0..children.len())
        .filter(|&i| children[i].flex_grow > 0.0 && children[i].below_cap(allotted[i]))
        .collect();

    while surplus > 0 && !flexible.is_empty() {
        let shares = split(surplus, &flexible, children);

        let mut over = Vec::new();
        for (&i, &share) in flexible.iter().zip(&shares) {
            if let Some(cap) = children[i].hard_cap
                && allotted[i].saturating_add(share) > cap
            {
                over.push(i);
            }
        }

        if over.is_empty() {
            for (&i, &share) in flexible.iter().zip(&shares) {
                allotted[i] += share;
            }
            break;
        }

        for &i in &over {
            if let Some(cap) = children[i].hard_cap {
                surplus = surplus.saturating_sub(cap - allotted[i]);
                allotted[i] = cap;
            }
        }
        flexible.retain(|i| !over.contains(i));
    }

    allotted
}

/// Floor-proportional split of `surplus` with deterministic remainder placement.
fn split(surplus: u64, flexible: &[usize], children: &[ChildSizing]) -> Vec<u64> {
    let max = flexible
        .iter()
        .map(|&i| children[i].flex_grow)
        .fold(0.0, f64::max);
    let scale = weight_scale(max);
    let weights: Vec<u128> = flexible
        .iter()
        .map(|&i| fixed_point(children[i].flex_grow, scale))
        .collect();
    let total: u128 = weights.iter().sum();

    let mut shares: Vec<u64> = weights
        .iter()
        .map(|&w| (u128::from(surplus) * w / total) as u64)
        .collect();

    let handed: u64 = shares.iter().sum();
    let mut remainder = surplus.saturating_sub(handed);
    if remainder == 0 {
        return shares;
    }

    let mut order: Vec<usize> = (0..flexible.len()).collect();
    order.sort_by(|&a, &b| {
        children[flexible[b]]
            .priority
            .cmp(&children[flexible[a]].priority)
            .then(flexible[a].cmp(&flexible[b]))
    });
    for &slot in order.iter().cycle() {
        if remainder == 0 {
            break;
        }
        shares[slot] += 1;
        remainder -= 1;
    }
    shares
}
