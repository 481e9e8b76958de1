//! # tokenloom core
//!
//! Domain types, traits, and error definitions shared by every tokenloom crate.
//! This crate carries no engine logic: it defines the vocabulary the engine
//! and its callers agree on.
//!
//! ## Design Philosophy
//!
//! The one expensive external capability, measuring content, is a trait
//! here. Implementations live elsewhere (a heuristic one ships with the
//! engine, real tokenizers plug in from outside). This enables:
//! - Swapping measurers without touching the engine
//! - Easy testing with counting or failing mock measurers
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod measure;
pub mod message;

// Re-export key types at crate root for ergonomics
pub use error::{ComponentError, InvalidTreeError, MeasureError, Phase, RenderError, Result};
pub use measure::{Fingerprint, MeasureInput, Measurer};
pub use message::{RenderedMessage, Role};
