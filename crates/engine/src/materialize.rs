//! Async Materializer — drives component preparation and expansion.
//!
//! Works level by level from the root. For each level:
//!
//! 1. every component on the level runs `prepare` concurrently; all results
//!    are joined before any `expand` starts
//! 2. every prepared component runs `expand` concurrently and the produced
//!    children are appended to their node
//! 3. unsized terminal children are measured (concurrently, through the
//!    shared cache) and each node negotiates its budget among its children
//!
//! Non-terminal children with their allotments form the next level. The
//! loop ends at the fix-point where no level has anything left to expand.
//! Cancellation is checked at every await boundary and aborts the whole
//! request.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokenloom_config::{ComponentFailurePolicy, EngineConfig, MeasurementFailurePolicy};
use tokenloom_core::{ComponentError, InvalidTreeError, MeasureInput, Phase, RenderError};
use tokio_util::sync::CancellationToken;

use crate::assemble::DegradedSubtree;
use crate::cache::RequestMeasurer;
use crate::component::{Component, RenderContext};
use crate::negotiate::{ChildSizing, negotiate};
use crate::tree::{NodeId, SizeRecord, Tree};

/// A node waiting to be expanded, with the budget it was allotted.
#[derive(Debug, Clone, Copy)]
struct Pending {
    node: NodeId,
    budget: u64,
}

pub(crate) struct Materializer<'a> {
    config: &'a EngineConfig,
    measurer: RequestMeasurer,
    cancel: CancellationToken,
    budget: u64,
    degraded: Vec<DegradedSubtree>,
}

/// Race `fut` against cancellation. Cancellation wins ties.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, RenderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RenderError::Cancelled),
        out = fut => Ok(out),
    }
}

impl<'a> Materializer<'a> {
    pub(crate) fn new(
        config: &'a EngineConfig,
        measurer: RequestMeasurer,
        cancel: CancellationToken,
        budget: u64,
    ) -> Self {
        Self {
            config,
            measurer,
            cancel,
            budget,
            degraded: Vec::new(),
        }
    }

    /// Expand and measure the whole tree. Returns the subtrees that were
    /// degraded to empty under the isolation policy.
    pub(crate) async fn run(mut self, tree: &mut Tree) -> Result<Vec<DegradedSubtree>, RenderError> {
        let root = tree.root();
        let root_budget = tree
            .attrs(root)
            .hard_cap
            .map_or(self.budget, |cap| cap.min(self.budget));

        if tree.kind(root).is_terminal() {
            self.measure_nodes(tree, &[root]).await?;
            return Ok(self.degraded);
        }

        let mut frontier = vec![Pending {
            node: root,
            budget: root_budget,
        }];
        let mut levels = 0usize;
        let mut expansions = 0usize;

        while !frontier.is_empty() {
            self.check_cancelled()?;
            // Static nesting does not count toward the limit.
            if frontier.iter().any(|p| tree.has_component(p.node)) {
                if expansions >= self.config.max_depth {
                    return Err(InvalidTreeError::DepthExceeded {
                        limit: self.config.max_depth,
                    }
                    .into());
                }
                expansions += 1;
                self.expand_level(tree, &frontier).await?;
            }

            frontier = self.negotiate_level(tree, &frontier).await?;
            levels += 1;
        }

        tracing::debug!(levels, expansions, nodes = tree.len(), "Materialization complete");
        Ok(self.degraded)
    }

    fn check_cancelled(&self) -> Result<(), RenderError> {
        if self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        Ok(())
    }

    fn context(&self, node: NodeId, budget: u64) -> RenderContext {
        RenderContext::new(budget, node, self.cancel.clone(), self.measurer.clone())
    }

    // ── Expansion ─────────────────────────────────────────────────────────

    async fn expand_level(&mut self, tree: &mut Tree, frontier: &[Pending]) -> Result<(), RenderError> {
        let jobs: Vec<(Pending, Arc<dyn Component>)> = frontier
            .iter()
            .filter_map(|p| tree.take_component(p.node).map(|c| (*p, c)))
            .collect();
        if jobs.is_empty() {
            return Ok(());
        }

        tracing::debug!(components = jobs.len(), "Preparing components");

        let prepared = join_all(jobs.iter().map(|(pending, component)| {
            let ctx = self.context(pending.node, pending.budget);
            let cancel = self.cancel.clone();
            async move { guarded(&cancel, component.prepare(&ctx)).await }
        }))
        .await;
        self.check_cancelled()?;

        let mut ready = Vec::with_capacity(jobs.len());
        for ((pending, component), outcome) in jobs.into_iter().zip(prepared) {
            match outcome? {
                Ok(state) => ready.push((pending, component, state)),
                Err(source) => self.fail(tree, pending.node, component.as_ref(), Phase::Prepare, source)?,
            }
        }

        let expanded = join_all(ready.into_iter().map(|(pending, component, state)| {
            let ctx = self.context(pending.node, pending.budget);
            let cancel = self.cancel.clone();
            async move {
                let outcome = guarded(&cancel, component.expand(state, &ctx)).await;
                (pending, component, outcome)
            }
        }))
        .await;
        self.check_cancelled()?;

        for (pending, component, outcome) in expanded {
            match outcome? {
                Ok(children) => {
                    let count = children.len();
                    let ids = tree.attach(pending.node, children)?;
                    let limit = tree.limit_below(pending.node, self.budget);
                    for id in ids {
                        tree.validate_caps_from(id, limit)?;
                    }
                    tracing::debug!(
                        node = %tree.describe(pending.node),
                        component = component.name(),
                        children = count,
                        "Component expanded"
                    );
                }
                Err(source) => self.fail(tree, pending.node, component.as_ref(), Phase::Expand, source)?,
            }
        }
        Ok(())
    }

    fn fail(
        &mut self,
        tree: &mut Tree,
        node: NodeId,
        component: &dyn Component,
        phase: Phase,
        source: ComponentError,
    ) -> Result<(), RenderError> {
        match self.config.component_failure {
            ComponentFailurePolicy::Abort => Err(RenderError::Component {
                component: component.name().to_string(),
                phase,
                source,
            }),
            ComponentFailurePolicy::IsolateSubtree => {
                let label = tree.describe(node);
                tracing::warn!(
                    node = %label,
                    component = component.name(),
                    %phase,
                    error = %source,
                    "Component failed, degrading subtree to empty"
                );
                tree.clear_children(node);
                self.degraded.push(DegradedSubtree {
                    node: label,
                    component: component.name().to_string(),
                    phase,
                    reason: source.to_string(),
                });
                Ok(())
            }
        }
    }

    // ── Measurement and negotiation ───────────────────────────────────────

    async fn negotiate_level(
        &mut self,
        tree: &mut Tree,
        frontier: &[Pending],
    ) -> Result<Vec<Pending>, RenderError> {
        let unsized_terminals: Vec<NodeId> = frontier
            .iter()
            .flat_map(|p| tree.children(p.node).iter().copied())
            .filter(|&c| tree.kind(c).is_terminal() && tree.size(c).is_none())
            .collect();
        self.measure_nodes(tree, &unsized_terminals).await?;

        let mut next = Vec::new();
        for pending in frontier {
            let children = tree.children(pending.node).to_vec();
            if children.is_empty() {
                continue;
            }

            let sizing: Vec<ChildSizing> = children
                .iter()
                .zip(tree.child_priorities(pending.node))
                .map(|(&c, priority)| {
                    let attrs = tree.attrs(c);
                    ChildSizing {
                        min: tree.min_estimate(c),
                        flex_grow: attrs.flex_grow,
                        hard_cap: attrs.hard_cap,
                        priority,
                    }
                })
                .collect();
            let allotted = negotiate(pending.budget, &sizing);

            tracing::debug!(
                node = %tree.describe(pending.node),
                budget = pending.budget,
                children = children.len(),
                ?allotted,
                "Negotiated child budgets"
            );

            for (&child, budget) in children.iter().zip(allotted) {
                if !tree.kind(child).is_terminal() {
                    next.push(Pending { node: child, budget });
                }
            }
        }
        Ok(next)
    }

    async fn measure_nodes(&self, tree: &mut Tree, ids: &[NodeId]) -> Result<(), RenderError> {
        let inputs: Vec<(NodeId, MeasureInput)> = ids
            .iter()
            .filter_map(|&id| tree.measure_input(id).map(|input| (id, input)))
            .collect();
        if inputs.is_empty() {
            return Ok(());
        }

        let measurer = &self.measurer;
        let results = guarded(
            &self.cancel,
            join_all(inputs.iter().map(|(_, input)| measurer.measure(input))),
        )
        .await?;

        for ((id, input), result) in inputs.iter().zip(results) {
            let fingerprint = input.fingerprint();
            let record = match result {
                Ok(lookup) => SizeRecord {
                    size: lookup.size,
                    measured: true,
                    fingerprint,
                },
                Err(source) => match self.config.measurement_failure {
                    MeasurementFailurePolicy::Propagate => {
                        return Err(RenderError::Measurement {
                            content: tree.describe(*id),
                            source,
                        });
                    }
                    MeasurementFailurePolicy::TreatAsMaximal => {
                        tracing::warn!(
                            node = %tree.describe(*id),
                            error = %source,
                            "Measurement failed, treating content as maximal"
                        );
                        SizeRecord {
                            size: u64::MAX,
                            measured: false,
                            fingerprint,
                        }
                    }
                },
            };
            tree.set_size(*id, record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SizeCache;
    use crate::component::PreparedState;
    use crate::token::CharHeuristicMeasurer;
    use crate::tree::{Node, NodeKind};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokenloom_core::{MeasureError, Measurer, Role};

    fn request_measurer(measurer: Arc<dyn Measurer>) -> RequestMeasurer {
        RequestMeasurer::new(Arc::new(SizeCache::new(measurer, 64)))
    }

    fn heuristic() -> RequestMeasurer {
        request_measurer(Arc::new(CharHeuristicMeasurer::new(1, 0)))
    }

    async fn materialize(
        tree: &mut Tree,
        config: &EngineConfig,
        budget: u64,
    ) -> Result<Vec<DegradedSubtree>, RenderError> {
        Materializer::new(config, heuristic(), CancellationToken::new(), budget)
            .run(tree)
            .await
    }

    fn texts(tree: &Tree, id: NodeId) -> Vec<String> {
        tree.children(id)
            .iter()
            .filter_map(|&c| match tree.kind(c) {
                NodeKind::Message { content, .. } | NodeKind::Leaf { text: content, .. } => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Expands into fixed messages.
    struct Lines(Vec<&'static str>);

    #[async_trait]
    impl Component for Lines {
        fn name(&self) -> &str {
            "lines"
        }

        async fn prepare(&self, _ctx: &RenderContext) -> Result<PreparedState, ComponentError> {
            Ok(PreparedState::new(self.0.clone()))
        }

        async fn expand(
            &self,
            state: PreparedState,
            _ctx: &RenderContext,
        ) -> Result<Vec<Node>, ComponentError> {
            let lines: Vec<&'static str> = state.take()?;
            Ok(lines.into_iter().map(|l| Node::message(Role::User, l)).collect())
        }
    }

    /// Records the budget it was handed.
    struct BudgetProbe(Arc<Mutex<Vec<u64>>>);

    #[async_trait]
    impl Component for BudgetProbe {
        fn name(&self) -> &str {
            "budget_probe"
        }

        async fn expand(
            &self,
            _state: PreparedState,
            ctx: &RenderContext,
        ) -> Result<Vec<Node>, ComponentError> {
            self.0.lock().unwrap().push(ctx.budget());
            Ok(Vec::new())
        }
    }

    struct Failing;

    #[async_trait]
    impl Component for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn prepare(&self, _ctx: &RenderContext) -> Result<PreparedState, ComponentError> {
            Err(ComponentError::Failed("source unavailable".into()))
        }

        async fn expand(
            &self,
            _state: PreparedState,
            _ctx: &RenderContext,
        ) -> Result<Vec<Node>, ComponentError> {
            Ok(Vec::new())
        }
    }

    /// Never finishes preparing.
    struct Stuck;

    #[async_trait]
    impl Component for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn prepare(&self, _ctx: &RenderContext) -> Result<PreparedState, ComponentError> {
            std::future::pending::<()>().await;
            Ok(PreparedState::empty())
        }

        async fn expand(
            &self,
            _state: PreparedState,
            _ctx: &RenderContext,
        ) -> Result<Vec<Node>, ComponentError> {
            Ok(Vec::new())
        }
    }

    /// Both siblings must be preparing at once to get past the barrier.
    struct Rendezvous(Arc<tokio::sync::Barrier>);

    #[async_trait]
    impl Component for Rendezvous {
        fn name(&self) -> &str {
            "rendezvous"
        }

        async fn prepare(&self, _ctx: &RenderContext) -> Result<PreparedState, ComponentError> {
            self.0.wait().await;
            Ok(PreparedState::empty())
        }

        async fn expand(
            &self,
            _state: PreparedState,
            _ctx: &RenderContext,
        ) -> Result<Vec<Node>, ComponentError> {
            Ok(vec![Node::message(Role::User, "met")])
        }
    }

    /// Expands into another container carrying itself, forever.
    struct Recursive;

    #[async_trait]
    impl Component for Recursive {
        fn name(&self) -> &str {
            "recursive"
        }

        async fn expand(
            &self,
            _state: PreparedState,
            _ctx: &RenderContext,
        ) -> Result<Vec<Node>, ComponentError> {
            Ok(vec![Node::container().component(Arc::new(Recursive))])
        }
    }

    struct BrokenMeasurer;

    #[async_trait]
    impl Measurer for BrokenMeasurer {
        fn name(&self) -> &str {
            "broken"
        }

        async fn measure(&self, input: &MeasureInput) -> Result<u64, MeasureError> {
            if input.text.contains("bad") {
                return Err(MeasureError::Unavailable("tokenizer offline".into()));
            }
            Ok(1)
        }
    }

    #[tokio::test]
    async fn expansion_appends_after_declared_children() {
        let mut tree = Tree::new(
            Node::container()
                .child(Node::message(Role::System, "declared"))
                .component(Arc::new(Lines(vec!["one", "two"]))),
        )
        .unwrap();
        materialize(&mut tree, &EngineConfig::default(), 100).await.unwrap();
        assert_eq!(texts(&tree, tree.root()), vec!["declared", "one", "two"]);
    }

    #[tokio::test]
    async fn terminals_are_measured() {
        let mut tree = Tree::new(Node::container().child(Node::message(Role::User, "abcd"))).unwrap();
        materialize(&mut tree, &EngineConfig::default(), 100).await.unwrap();
        let child = tree.children(tree.root())[0];
        assert_eq!(tree.size(child).map(|s| s.size), Some(4));
    }

    #[tokio::test]
    async fn components_see_negotiated_budget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tree = Tree::new(
            Node::container()
                .child(Node::message(Role::System, "x".repeat(20)).priority(1000))
                .child(
                    Node::container()
                        .priority(900)
                        .flex_grow(1.0)
                        .component(Arc::new(BudgetProbe(seen.clone()))),
                )
                .child(
                    Node::container()
                        .priority(800)
                        .flex_grow(2.0)
                        .component(Arc::new(BudgetProbe(seen.clone()))),
                ),
        )
        .unwrap();
        materialize(&mut tree, &EngineConfig::default(), 100).await.unwrap();

        let mut budgets = seen.lock().unwrap().clone();
        budgets.sort();
        assert_eq!(budgets, vec![27, 53]);
    }

    #[tokio::test]
    async fn hard_cap_limits_component_budget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tree = Tree::new(
            Node::container().child(
                Node::container()
                    .flex_grow(1.0)
                    .hard_cap(5000)
                    .component(Arc::new(BudgetProbe(seen.clone()))),
            ),
        )
        .unwrap();
        materialize(&mut tree, &EngineConfig::default(), 10_000).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![5000]);
    }

    #[tokio::test]
    async fn sibling_prepares_run_concurrently() {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut tree = Tree::new(
            Node::container()
                .child(Node::container().component(Arc::new(Rendezvous(barrier.clone()))))
                .child(Node::container().component(Arc::new(Rendezvous(barrier)))),
        )
        .unwrap();

        let config = EngineConfig::default();
        let run = materialize(&mut tree, &config, 100);
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("sibling prepares deadlocked")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_prepare() {
        let mut tree = Tree::new(Node::container().component(Arc::new(Stuck))).unwrap();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = Materializer::new(&config, heuristic(), cancel, 100)
            .run(&mut tree)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_does_no_work() {
        let mut tree = Tree::new(
            Node::container().component(Arc::new(Lines(vec!["never"]))),
        )
        .unwrap();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Materializer::new(&config, heuristic(), cancel, 100)
            .run(&mut tree)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Cancelled));
        assert!(tree.children(tree.root()).is_empty());
    }

    #[tokio::test]
    async fn component_failure_aborts_by_default() {
        let mut tree = Tree::new(Node::container().child(
            Node::container().component(Arc::new(Failing)),
        ))
        .unwrap();
        let err = materialize(&mut tree, &EngineConfig::default(), 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::Component {
                phase: Phase::Prepare,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn component_failure_isolated_to_subtree() {
        let config = EngineConfig {
            component_failure: ComponentFailurePolicy::IsolateSubtree,
            ..EngineConfig::default()
        };
        let mut tree = Tree::new(
            Node::container()
                .child(
                    Node::container()
                        .label("flaky")
                        .child(Node::message(Role::User, "declared"))
                        .component(Arc::new(Failing)),
                )
                .child(Node::container().component(Arc::new(Lines(vec!["fine"])))),
        )
        .unwrap();

        let degraded = materialize(&mut tree, &config, 100).await.unwrap();
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].node, "flaky");
        assert_eq!(degraded[0].component, "failing");
        assert_eq!(degraded[0].phase, Phase::Prepare);

        let kids = tree.children(tree.root()).to_vec();
        assert!(tree.children(kids[0]).is_empty());
        assert_eq!(texts(&tree, kids[1]), vec!["fine"]);
    }

    #[tokio::test]
    async fn runaway_expansion_hits_depth_limit() {
        let config = EngineConfig {
            max_depth: 8,
            ..EngineConfig::default()
        };
        let mut tree = Tree::new(Node::container().component(Arc::new(Recursive))).unwrap();
        let err = materialize(&mut tree, &config, 100).await.unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidTree(InvalidTreeError::DepthExceeded { limit: 8 })
        ));
    }

    #[tokio::test]
    async fn deep_static_nesting_is_not_limited() {
        let mut node = Node::message(Role::User, "deep");
        for _ in 0..70 {
            node = Node::container().child(node);
        }
        let mut tree = Tree::new(node).unwrap();
        materialize(&mut tree, &EngineConfig::default(), 100).await.unwrap();

        let mut cursor = tree.root();
        while let [child] = tree.children(cursor) {
            cursor = *child;
        }
        assert_eq!(tree.size(cursor).unwrap().size, 4);
    }

    #[tokio::test]
    async fn depth_limit_counts_component_levels_only() {
        let config = EngineConfig {
            max_depth: 1,
            ..EngineConfig::default()
        };
        let mut inner = Node::container().component(Arc::new(Lines(vec!["leaf"])));
        for _ in 0..5 {
            inner = Node::container().child(inner);
        }
        let mut tree = Tree::new(inner).unwrap();
        materialize(&mut tree, &config, 100).await.unwrap();
    }

    #[tokio::test]
    async fn measurement_failure_propagates_by_default() {
        let mut tree = Tree::new(
            Node::container().child(Node::message(Role::User, "bad content").label("doc")),
        )
        .unwrap();
        let config = EngineConfig::default();
        let err = Materializer::new(
            &config,
            request_measurer(Arc::new(BrokenMeasurer)),
            CancellationToken::new(),
            100,
        )
        .run(&mut tree)
        .await
        .unwrap_err();
        match err {
            RenderError::Measurement { content, .. } => assert_eq!(content, "doc"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn measurement_failure_treated_as_maximal() {
        let config = EngineConfig {
            measurement_failure: MeasurementFailurePolicy::TreatAsMaximal,
            ..EngineConfig::default()
        };
        let mut tree = Tree::new(
            Node::container()
                .child(Node::message(Role::User, "good"))
                .child(Node::message(Role::User, "bad")),
        )
        .unwrap();
        Materializer::new(
            &config,
            request_measurer(Arc::new(BrokenMeasurer)),
            CancellationToken::new(),
            100,
        )
        .run(&mut tree)
        .await
        .unwrap();

        let kids = tree.children(tree.root()).to_vec();
        let bad = tree.size(kids[1]).unwrap();
        assert_eq!(bad.size, u64::MAX);
        assert!(!bad.measured);
        assert!(tree.size(kids[0]).unwrap().measured);
    }

    #[tokio::test]
    async fn expanded_cap_above_allotment_rejected() {
        struct Greedy;

        #[async_trait]
        impl Component for Greedy {
            fn name(&self) -> &str {
                "greedy"
            }

            async fn expand(
                &self,
                _state: PreparedState,
                _ctx: &RenderContext,
            ) -> Result<Vec<Node>, ComponentError> {
                Ok(vec![Node::container().hard_cap(500)])
            }
        }

        let mut tree = Tree::new(
            Node::container()
                .hard_cap(100)
                .component(Arc::new(Greedy)),
        )
        .unwrap();
        let err = materialize(&mut tree, &EngineConfig::default(), 1000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidTree(InvalidTreeError::HardCapExceedsBudget { cap: 500, .. })
        ));
    }
}
