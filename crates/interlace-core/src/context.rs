// Context Propagation
//
// Tracks the stack of currently open nodes for each logical call chain so
// new events attach to the right parent.
//
// The ambient slot is a tokio task_local, which is bound to the future being
// polled rather than to an OS thread: a chain that suspends on one worker and
// resumes on another still sees its own stack, and two unrelated tasks never
// see each other's. The slot is restored when the scoped future completes,
// fails, panics or is dropped, so push/pop is always paired.
//
// `TraceContext` is the explicit carrier. Capture it with
// `TraceContext::current()` and re-enter it with `scope` wherever a chain
// continues outside the original future (spawned tasks, callbacks).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::task::futures::TaskLocalFuture;
use tokio::task::JoinHandle;

use crate::model::EventKind;
use crate::tree::SharedTree;

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// What kind of node is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Interaction,
    Event(EventKind),
}

/// An open node that new children should attach to
#[derive(Clone)]
pub struct ActiveNode {
    /// Tree owning the node
    pub tree: SharedTree,
    /// Interaction id or event id
    pub node_id: String,
    /// Root interaction id
    pub interaction_id: String,
    pub kind: NodeKind,
}

impl ActiveNode {
    /// The root interaction of `tree`
    pub fn root(tree: SharedTree) -> Self {
        let interaction_id = tree.lock().interaction_id().to_string();
        Self {
            tree,
            node_id: interaction_id.clone(),
            interaction_id,
            kind: NodeKind::Interaction,
        }
    }

    /// An event inside `tree`
    pub fn event(tree: SharedTree, event_id: impl Into<String>, kind: EventKind) -> Self {
        let interaction_id = tree.lock().interaction_id().to_string();
        Self {
            tree,
            node_id: event_id.into(),
            interaction_id,
            kind: NodeKind::Event(kind),
        }
    }

    /// Whether the node can still accept children
    pub fn is_open(&self) -> bool {
        self.tree.lock().is_open(&self.node_id)
    }
}

impl fmt::Debug for ActiveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveNode")
            .field("node_id", &self.node_id)
            .field("interaction_id", &self.interaction_id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Frame {
    node: ActiveNode,
    parent: Option<Arc<Frame>>,
    depth: usize,
}

/// Immutable stack of open nodes for one logical call chain
///
/// Cloning is cheap (shared frames); pushing returns a new context and
/// leaves the original untouched.
#[derive(Clone, Default)]
pub struct TraceContext {
    head: Option<Arc<Frame>>,
}

impl TraceContext {
    /// Context with no active node
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture the caller's context (empty outside any scope)
    pub fn current() -> Self {
        CURRENT.try_with(|ctx| ctx.clone()).unwrap_or_default()
    }

    /// New context with `node` as the innermost active node
    pub fn push(&self, node: ActiveNode) -> Self {
        let depth = self.depth() + 1;
        Self {
            head: Some(Arc::new(Frame {
                node,
                parent: self.head.clone(),
                depth,
            })),
        }
    }

    /// Innermost active node
    pub fn active(&self) -> Option<&ActiveNode> {
        self.head.as_ref().map(|frame| &frame.node)
    }

    /// Context with the innermost node removed
    pub fn parent(&self) -> Self {
        Self {
            head: self.head.as_ref().and_then(|frame| frame.parent.clone()),
        }
    }

    pub fn depth(&self) -> usize {
        self.head.as_ref().map(|frame| frame.depth).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Active nodes, innermost first
    pub fn nodes(&self) -> Vec<ActiveNode> {
        let mut out = Vec::with_capacity(self.depth());
        let mut cursor = self.head.as_ref();
        while let Some(frame) = cursor {
            out.push(frame.node.clone());
            cursor = frame.parent.as_ref();
        }
        out
    }

    /// Innermost node that is still open
    ///
    /// Nodes captured by a carrier can close while it is held (a spawned
    /// task outliving its parent); those are skipped.
    pub fn innermost_open(&self) -> Option<ActiveNode> {
        self.nodes().into_iter().find(|node| node.is_open())
    }

    /// Run `fut` with this context active
    pub fn scope<F: Future>(self, fut: F) -> TaskLocalFuture<TraceContext, F> {
        CURRENT.scope(self, fut)
    }

    /// Run `f` with this context active
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT.sync_scope(self, f)
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.nodes().into_iter().map(|n| n.node_id).collect();
        f.debug_struct("TraceContext").field("stack", &ids).finish()
    }
}

// ============================================================================
// Free functions
// ============================================================================

/// Push `node` for the duration of `fut`
pub fn with_context<F: Future>(node: ActiveNode, fut: F) -> TaskLocalFuture<TraceContext, F> {
    TraceContext::current().push(node).scope(fut)
}

/// Push `node` for the duration of `f`
pub fn with_context_sync<F, R>(node: ActiveNode, f: F) -> R
where
    F: FnOnce() -> R,
{
    TraceContext::current().push(node).sync_scope(f)
}

/// Innermost open node of the caller's chain, if any
pub fn current() -> Option<ActiveNode> {
    TraceContext::current().innermost_open()
}

/// Run `fut` with no active node (background work)
pub fn run_detached<F: Future>(fut: F) -> TaskLocalFuture<TraceContext, F> {
    TraceContext::empty().scope(fut)
}

/// Run `f` with no active node
pub fn run_detached_sync<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    TraceContext::empty().sync_scope(f)
}

/// `tokio::spawn` that carries the caller's context into the new task
pub fn spawn_in_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(TraceContext::current().scope(fut))
}
