//! Measurer trait — the abstraction over content sizing.
//!
//! Measuring is the one expensive capability the engine depends on. It may
//! run a real tokenizer or call out to a remote service, so the engine
//! memoizes results by content fingerprint and never measures the same
//! fingerprint twice while a lookup is in flight.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::MeasureError;
use crate::message::Role;

/// A piece of content to be measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureInput {
    pub role: Role,
    pub text: String,
}

impl MeasureInput {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// Structural identity of this content: SHA-256 over role and text.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.text.as_bytes());
        Fingerprint(hasher.finalize().into())
    }
}

/// Content identity used as the size cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes as hex, enough to tell content apart in diagnostics.
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The core Measurer trait.
///
/// Implementations must be deterministic for a given input: the engine's
/// idempotence guarantee only holds when the same content always measures
/// to the same size.
#[async_trait]
pub trait Measurer: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Measure the size of `input` in budget units (usually tokens).
    async fn measure(&self, input: &MeasureInput) -> std::result::Result<u64, MeasureError>;
}
