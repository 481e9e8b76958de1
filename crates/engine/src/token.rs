//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token by default.
//! Good enough for budgeting when no real tokenizer is wired in, and fully
//! deterministic, which is what the size cache relies on.

use async_trait::async_trait;
use tokenloom_config::MeasurerConfig;
use tokenloom_core::{MeasureError, MeasureInput, Measurer};

/// Estimate the token count for a string.
///
/// Counts characters, not bytes, and rounds up.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> u64 {
    let chars_per_token = chars_per_token.max(1);
    let chars = text.chars().count();
    chars.div_ceil(chars_per_token) as u64
}

/// Measurer backed by [`estimate_tokens`] plus a fixed per-message overhead.
///
/// The overhead stands in for role names and delimiters in the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharHeuristicMeasurer {
    chars_per_token: usize,
    per_message_overhead: u64,
}

impl CharHeuristicMeasurer {
    pub fn new(chars_per_token: usize, per_message_overhead: u64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
            per_message_overhead,
        }
    }

    pub fn from_config(config: &MeasurerConfig) -> Self {
        Self::new(config.chars_per_token, config.per_message_overhead)
    }

    /// Synchronous size, same value `measure` resolves to.
    pub fn size_of(&self, text: &str) -> u64 {
        self.per_message_overhead + estimate_tokens(text, self.chars_per_token)
    }
}

impl Default for CharHeuristicMeasurer {
    fn default() -> Self {
        Self::from_config(&MeasurerConfig::default())
    }
}

#[async_trait]
impl Measurer for CharHeuristicMeasurer {
    fn name(&self) -> &str {
        "char_heuristic"
    }

    async fn measure(&self, input: &MeasureInput) -> Result<u64, MeasureError> {
        Ok(self.size_of(&input.text))
    }
}
