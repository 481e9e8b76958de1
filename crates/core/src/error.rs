//! Error types for the tokenloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! `RenderError` is the only failure a render request can end with; the
//! narrower enums describe where it came from.

use serde::Serialize;
use thiserror::Error;

/// The typed failure of a single render request.
///
/// A request that runs out of budget is *not* an error: the result carries a
/// `budget_unsatisfiable` flag instead.
#[derive(Debug, Error)]
pub enum RenderError {
    // --- Structural errors ---
    #[error("Invalid tree: {0}")]
    InvalidTree(#[from] InvalidTreeError),

    // --- Cancellation ---
    #[error("Render cancelled")]
    Cancelled,

    // --- Measurement errors ---
    #[error("Measurement failed for {content}: {source}")]
    Measurement {
        content: String,
        #[source]
        source: MeasureError,
    },

    // --- Component errors ---
    #[error("Component '{component}' failed during {phase}: {source}")]
    Component {
        component: String,
        phase: Phase,
        #[source]
        source: ComponentError,
    },

    // --- Internal consistency ---
    #[error("Size accounting mismatch: evictor reported {expected}, assembled output sums to {actual}")]
    Inconsistent { expected: u64, actual: u64 },
}

/// Result type alias using `RenderError`.
pub type Result<T> = std::result::Result<T, RenderError>;

/// Which materialization step a component was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Expand,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Expand => write!(f, "expand"),
        }
    }
}

// --- Bounded context errors ---

/// Structural violations, detected before (or while attaching) content.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidTreeError {
    #[error("flexGrow of {node} must be a finite non-negative number, got {value}")]
    InvalidFlexGrow { node: String, value: f64 },

    #[error("{node} is terminal content and cannot have children")]
    ChildrenOnTerminal { node: String },

    #[error("{node} is terminal content and cannot carry a component")]
    ComponentOnTerminal { node: String },

    #[error("hardCap {cap} on {node} exceeds its inherited budget of {inherited}")]
    HardCapExceedsBudget {
        node: String,
        cap: u64,
        inherited: u64,
    },

    #[error("{node} is reachable through more than one parent")]
    Cycle { node: String },

    #[error("component expansion did not reach a fix-point within {limit} levels")]
    DepthExceeded { limit: usize },
}

/// Failures reported by an injected `Measurer`.
///
/// `Clone` because a single in-flight measurement result is handed to every
/// caller that was coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeasureError {
    #[error("Measurer '{measurer}' failed: {reason}")]
    Failed { measurer: String, reason: String },

    #[error("Measurer unavailable: {0}")]
    Unavailable(String),
}

/// Failures raised by a component's `prepare` or `expand` hook.
#[derive(Debug, Clone, Error)]
pub enum ComponentError {
    #[error("{0}")]
    Failed(String),

    #[error("Missing prepared state: expected {expected}")]
    MissingState { expected: &'static str },

    #[error("Measurement inside component failed: {0}")]
    Measure(#[from] MeasureError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_tree_wraps_into_render_error() {
        let err: RenderError = InvalidTreeError::HardCapExceedsBudget {
            node: "history".into(),
            cap: 9000,
            inherited: 4096,
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("history"));
        assert!(msg.contains("9000"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn component_error_displays_phase() {
        let err = RenderError::Component {
            component: "file_contents".into(),
            phase: Phase::Prepare,
            source: ComponentError::Failed("disk on fire".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("file_contents"));
        assert!(msg.contains("prepare"));
        assert!(msg.contains("disk on fire"));
    }

    #[test]
    fn measurement_error_keeps_source() {
        let err = RenderError::Measurement {
            content: "#3".into(),
            source: MeasureError::Unavailable("tokenizer offline".into()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Measurer unavailable: tokenizer offline"));
    }
}
