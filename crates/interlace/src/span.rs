// Span Lifecycle
//
// OpenSpan is the single open/close primitive behind wrapped model calls,
// wrapped tools and scoped tool/task blocks. It attaches an event under the
// caller's current node (or under a fresh standalone interaction when there
// is none), runs the body with that event as the active node, and closes it
// with the body's outcome.
//
// Dropping an OpenSpan that was never closed means the body's future was
// cancelled: the event is closed with a `cancelled` error and still
// delivered.

use std::future::Future;

use serde::Serialize;
use serde_json::Value;

use interlace_core::{
    context, new_id, ActiveNode, ErrorInfo, Event, EventKind, FinishedTree, Interaction, Outcome,
    Properties, SharedTree, TraceTree, Usage,
};

use crate::tracer::Tracer;

/// Ids that correlate a result with its recorded event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceIds {
    pub event_id: String,
    pub interaction_id: String,
}

impl TraceIds {
    /// Fresh ids for untraced results (tracer disabled or closed)
    pub fn placeholder() -> Self {
        Self {
            event_id: new_id(),
            interaction_id: new_id(),
        }
    }
}

/// Result types whose outcome can be recorded on a span
pub trait SpanResult {
    fn outcome(&self) -> Outcome;
}

impl<T: Serialize, E: std::fmt::Display> SpanResult for Result<T, E> {
    fn outcome(&self) -> Outcome {
        match self {
            Ok(value) => serde_json::to_value(value)
                .map(Outcome::Output)
                .unwrap_or(Outcome::Empty),
            Err(err) => Outcome::Error(ErrorInfo::from_error(err)),
        }
    }
}

impl SpanResult for () {
    fn outcome(&self) -> Outcome {
        Outcome::Empty
    }
}

/// What an event is opened with
#[derive(Debug, Clone)]
pub(crate) struct SpanStart {
    pub kind: EventKind,
    pub name: String,
    pub input: Option<Value>,
    pub model: Option<String>,
    pub properties: Properties,
    /// Event name for the standalone interaction, when one is needed
    pub root_event: String,
}

impl SpanStart {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let root_event = match kind {
            EventKind::Llm => "llm_call".to_string(),
            _ => name.clone(),
        };
        Self {
            kind,
            name,
            input: None,
            model: None,
            properties: Properties::new(),
            root_event,
        }
    }

    pub fn with_input(mut self, input: Option<Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }
}

/// What an event is closed with
#[derive(Debug, Clone)]
pub(crate) struct SpanEnd {
    pub outcome: Outcome,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

impl SpanEnd {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            model: None,
            usage: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(Outcome::cancelled())
    }
}

/// A closed event and whatever closing it completed
#[derive(Debug, Clone)]
pub(crate) struct Settled {
    pub span: Event,
    /// The owning interaction finished before the event closed
    pub late: bool,
    /// The standalone interaction this event was the only child of
    pub finished: Option<FinishedTree>,
}

struct SpanState {
    tracer: Tracer,
    tree: SharedTree,
    event_id: String,
    interaction_id: String,
    kind: EventKind,
    standalone: bool,
}

/// An event that is open until `close` or drop
pub(crate) struct OpenSpan {
    state: Option<SpanState>,
}

impl OpenSpan {
    /// Open a span, firing `on_interaction_start` for a standalone root
    pub async fn open(tracer: &Tracer, start: SpanStart) -> Self {
        let (span, started) = Self::attach(tracer, start);
        if let Some(root) = started {
            tracer.hub().on_interaction_start(&root).await;
        }
        span
    }

    /// Open from synchronous code; hooks run on the runtime when there is one
    pub fn open_sync(tracer: &Tracer, start: SpanStart) -> Self {
        let (span, started) = Self::attach(tracer, start);
        if let Some(root) = started {
            tracer.spawn_interaction_start(root);
        }
        span
    }

    fn inert() -> Self {
        Self { state: None }
    }

    fn attach(tracer: &Tracer, start: SpanStart) -> (Self, Option<Interaction>) {
        if !tracer.is_recording() {
            return (Self::inert(), None);
        }

        let mut event = Event::new(start.kind, &start.name, "", "").with_properties(start.properties);
        event.input = start.input;
        event.model = start.model;

        if let Some(parent) = context::current() {
            let attached = parent.tree.lock().attach(&parent.node_id, event.clone());
            match attached {
                Ok(event_id) => {
                    let span = Self::live(tracer, parent.tree, event_id, start.kind, false);
                    return (span, None);
                }
                // The parent closed after it was looked up
                Err(e) => tracer.diagnostics().absorb(&e, "attach span"),
            }
        }

        let mut root = Interaction::new(start.root_event);
        root.input = event.input.clone();
        let tree = TraceTree::shared(root);
        let (snapshot, attached) = {
            let mut guard = tree.lock();
            let root_id = guard.interaction_id().to_string();
            (guard.snapshot(), guard.attach(&root_id, event))
        };

        match attached {
            Ok(event_id) => (
                Self::live(tracer, tree, event_id, start.kind, true),
                Some(snapshot),
            ),
            Err(e) => {
                tracer.diagnostics().absorb(&e, "attach standalone span");
                (Self::inert(), None)
            }
        }
    }

    fn live(
        tracer: &Tracer,
        tree: SharedTree,
        event_id: String,
        kind: EventKind,
        standalone: bool,
    ) -> Self {
        let interaction_id = tree.lock().interaction_id().to_string();
        Self {
            state: Some(SpanState {
                tracer: tracer.clone(),
                tree,
                event_id,
                interaction_id,
                kind,
                standalone,
            }),
        }
    }

    /// Ids of the recorded event, or placeholders when nothing is recorded
    pub fn ids(&self) -> TraceIds {
        match &self.state {
            Some(state) => TraceIds {
                event_id: state.event_id.clone(),
                interaction_id: state.interaction_id.clone(),
            },
            None => TraceIds::placeholder(),
        }
    }

    fn node(&self) -> Option<ActiveNode> {
        self.state
            .as_ref()
            .map(|s| ActiveNode::event(s.tree.clone(), s.event_id.clone(), s.kind))
    }

    /// Run `fut` with this span as the active node
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        match self.node() {
            Some(node) => context::with_context(node, fut).await,
            None => fut.await,
        }
    }

    /// Run `f` with this span as the active node
    pub fn run_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match self.node() {
            Some(node) => context::with_context_sync(node, f),
            None => f(),
        }
    }

    /// Close the span and dispatch hooks and delivery
    pub async fn close(mut self, end: SpanEnd) {
        let Some(state) = self.state.take() else {
            return;
        };
        if let Some(settled) = state.settle(end) {
            state.tracer.dispatch(settled).await;
        }
    }

    /// Close from synchronous code
    pub fn close_sync(mut self, end: SpanEnd) {
        let Some(state) = self.state.take() else {
            return;
        };
        if let Some(settled) = state.settle(end) {
            state.tracer.dispatch_detached(settled);
        }
    }
}

impl Drop for OpenSpan {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(settled) = state.settle(SpanEnd::cancelled()) {
                state.tracer.dispatch_detached(settled);
            }
        }
    }
}

impl SpanState {
    fn settle(&self, end: SpanEnd) -> Option<Settled> {
        let diagnostics = self.tracer.diagnostics();
        let root_outcome = end.outcome.clone();
        let mut tree = self.tree.lock();

        if end.model.is_some() || end.usage.is_some() {
            let updated = tree.update_event(&self.event_id, |event| {
                if end.model.is_some() {
                    event.model = end.model;
                }
                if end.usage.is_some() {
                    event.usage = end.usage;
                }
            });
            if let Err(e) = updated {
                diagnostics.absorb(&e, "update span");
            }
        }

        let closed = match tree.close_event(&self.event_id, end.outcome) {
            Ok(closed) => closed,
            Err(e) => {
                diagnostics.absorb(&e, "close span");
                return None;
            }
        };

        let finished = if self.standalone {
            match tree.finish(root_outcome) {
                Ok(finished) => Some(finished),
                Err(e) => {
                    diagnostics.absorb(&e, "finish standalone interaction");
                    None
                }
            }
        } else {
            None
        };

        Some(Settled {
            span: closed.event,
            late: closed.late,
            finished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_outcome() {
        let ok: Result<Vec<u32>, String> = Ok(vec![1, 2]);
        assert_eq!(ok.outcome(), Outcome::output(serde_json::json!([1, 2])));

        let err: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        match err.outcome() {
            Outcome::Error(info) => {
                assert_eq!(info.kind, "Error");
                assert_eq!(info.message, "disk full");
            }
            other => panic!("expected error outcome, got {:?}", other),
        }

        assert_eq!(().outcome(), Outcome::Empty);
    }

    #[test]
    fn test_root_event_names() {
        assert_eq!(SpanStart::new(EventKind::Llm, "chat.completions").root_event, "llm_call");
        assert_eq!(SpanStart::new(EventKind::Tool, "search").root_event, "search");
    }
}
