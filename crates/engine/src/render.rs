//! Renderer — the single entry point tying the pipeline together.
//!
//! ```text
//! Tree ─▶ validate caps ─▶ Materializer ─▶ Flattener ─▶ Evictor ─▶ Assembler ─▶ RenderResult
//!                          (async, joins)   (pure)       (pure)      (pure)
//! ```
//!
//! A `Renderer` owns a handle to the shared [`SizeCache`] and is cheap to
//! share between tasks; every call to [`Renderer::render`] is an independent
//! request.

use std::sync::Arc;

use tokenloom_config::EngineConfig;
use tokenloom_core::{Measurer, RenderError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::assemble::{AssemblyInput, RenderResult, assemble};
use crate::cache::{RequestMeasurer, SizeCache};
use crate::evict::Evictor;
use crate::flatten::Flattener;
use crate::materialize::Materializer;
use crate::tree::{Node, Tree};

pub struct Renderer {
    cache: Arc<SizeCache>,
    config: EngineConfig,
}

impl Renderer {
    /// Render against an existing, possibly shared, cache.
    pub fn new(cache: Arc<SizeCache>, config: EngineConfig) -> Self {
        Self { cache, config }
    }

    /// Build a private cache sized from `config.cache_capacity`.
    pub fn with_measurer(measurer: Arc<dyn Measurer>, config: EngineConfig) -> Self {
        let cache = Arc::new(SizeCache::new(measurer, config.cache_capacity));
        Self::new(cache, config)
    }

    pub fn cache(&self) -> &Arc<SizeCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Turn `tree` into an ordered message list that fits `budget`.
    ///
    /// Fails fast on structural problems, before any component runs. Once
    /// `cancel` fires, no partial result is produced.
    pub async fn render(
        &self,
        tree: Tree,
        budget: u64,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, RenderError> {
        let span = tracing::info_span!(
            "render",
            request_id = %uuid::Uuid::new_v4(),
            budget
        );
        self.render_inner(tree, budget, cancel).instrument(span).await
    }

    /// Convenience wrapper that validates a declared node first.
    pub async fn render_node(
        &self,
        root: Node,
        budget: u64,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, RenderError> {
        self.render(Tree::new(root)?, budget, cancel).await
    }

    async fn render_inner(
        &self,
        mut tree: Tree,
        budget: u64,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, RenderError> {
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        tree.validate_caps(budget)?;

        let measurer = RequestMeasurer::new(self.cache.clone());
        let degraded = Materializer::new(&self.config, measurer.clone(), cancel.clone(), budget)
            .run(&mut tree)
            .await?;

        // Nothing below suspends; this is the last chance to observe a cancel.
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let flat = Flattener::new(self.config.eviction).flatten(&tree);
        let plan = Evictor::plan(&flat.units, &flat.scopes, budget);

        let result = assemble(
            AssemblyInput {
                tree: &tree,
                units: &flat.units,
                budget,
                leaf_separator: &self.config.leaf_separator,
                degraded,
                cache_stats: measurer.stats(),
            },
            plan,
        )?;

        tracing::info!(
            units = flat.units.len(),
            messages = result.messages.len(),
            evicted = result.evicted.len(),
            total = result.total_size,
            unsatisfiable = result.budget_unsatisfiable,
            hits = result.cache_stats.hits,
            misses = result.cache_stats.misses,
            "Render complete"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}
