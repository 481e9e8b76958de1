//! Components — user-defined nodes that expand into more content.
//!
//! A component runs in two steps. `prepare` does the slow I/O (reading
//! files, querying stores) and returns opaque state. `expand` turns that
//! state into child nodes. Siblings at the same depth prepare concurrently,
//! and every component sees the budget share its node was allotted.

use std::any::Any;

use async_trait::async_trait;
use tokenloom_core::{ComponentError, MeasureError, Role};
use tokio_util::sync::CancellationToken;

use crate::cache::RequestMeasurer;
use crate::tree::{Node, NodeId};

/// Opaque state handed from `prepare` to `expand`.
#[derive(Default)]
pub struct PreparedState(Option<Box<dyn Any + Send>>);

impl PreparedState {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Recover the prepared value, failing if it is absent or of another type.
    pub fn take<T: Any + Send>(self) -> Result<T, ComponentError> {
        self.0
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
            .ok_or(ComponentError::MissingState {
                expected: std::any::type_name::<T>(),
            })
    }
}

impl std::fmt::Debug for PreparedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty() {
            "PreparedState(empty)"
        } else {
            "PreparedState(..)"
        })
    }
}

/// What a component can see and do while it runs.
#[derive(Clone)]
pub struct RenderContext {
    budget: u64,
    node: NodeId,
    cancel: CancellationToken,
    measurer: RequestMeasurer,
}

impl RenderContext {
    pub(crate) fn new(
        budget: u64,
        node: NodeId,
        cancel: CancellationToken,
        measurer: RequestMeasurer,
    ) -> Self {
        Self {
            budget,
            node,
            cancel,
            measurer,
        }
    }

    /// The budget share negotiated for this component's node.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token to select on inside long-running hooks.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Measure text through the shared size cache.
    pub async fn measure(&self, role: Role, text: &str) -> Result<u64, MeasureError> {
        let input = tokenloom_core::MeasureInput::new(role, text);
        self.measurer.measure(&input).await.map(|lookup| lookup.size)
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("budget", &self.budget)
            .field("node", &self.node)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// A node that produces its children at render time.
///
/// Expanded children are appended after any children declared on the node.
#[async_trait]
pub trait Component: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Gather whatever `expand` needs. Defaults to no state.
    async fn prepare(&self, _ctx: &RenderContext) -> Result<PreparedState, ComponentError> {
        Ok(PreparedState::empty())
    }

    /// Produce child nodes from prepared state.
    async fn expand(
        &self,
        state: PreparedState,
        ctx: &RenderContext,
    ) -> Result<Vec<Node>, ComponentError>;
}
