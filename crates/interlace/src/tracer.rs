// Tracer Facade
//
// An explicit, cheaply clonable tracer instance. Everything a host does
// goes through it: opening interactions, wrapping clients and tools,
// tracking signals, flushing and closing.
//
// No operation here ever fails the host. Internal errors are absorbed by
// Diagnostics; a disabled or closed tracer turns every call into a no-op
// that still hands back well-formed handles and ids.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use interlace_core::{
    context, new_id, ActiveNode, Attachment, EventKind, FinishedTree, Interaction,
    Outcome, PluginHub, Properties, Result, SharedTree, Signal, SignalType, TraceContext,
    TraceTree, UserIdentity,
};

use crate::config::TracerConfig;
use crate::logging::Diagnostics;
use crate::options::{
    BeginOptions, FeedbackOptions, FinishOptions, SignalOptions, TrackEventOptions,
};
use crate::pipeline::{
    DeliveryNotice, HttpTransport, Pipeline, PipelineSettings, PipelineStats, QueueItem,
    Transport,
};
use crate::span::{OpenSpan, Settled, SpanEnd, SpanResult, SpanStart};
use crate::tool::WrappedTool;
use crate::wrap::{ModelClient, Wrapped};

struct TracerInner {
    /// Identity used to recognise clients this tracer already wrapped
    id: String,
    config: TracerConfig,
    hub: Arc<PluginHub>,
    /// None when disabled
    pipeline: Option<Pipeline>,
    diagnostics: Diagnostics,
}

/// Handle to a tracing pipeline
///
/// Clones share the same queue, plugins and worker.
///
/// # Example
///
/// ```ignore
/// use interlace::{BeginOptions, FinishOptions, Tracer, TracerConfig};
///
/// let tracer = Tracer::new(TracerConfig::from_env())?;
/// let client = tracer.wrap(OpenAiClient::new());
///
/// let handle = tracer.begin(BeginOptions::new("rag_query").with_input("Q")).await;
/// let answer = handle.run(client.call(request)).await?;
/// handle.finish(FinishOptions::new().with_output("A")).await;
///
/// tracer.close().await;
/// ```
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Create a tracer delivering over HTTP
    ///
    /// Must be called inside a Tokio runtime unless the config is disabled.
    /// A missing API key is not an error: tracing runs and batches are
    /// dropped at delivery.
    pub fn new(config: TracerConfig) -> Result<Self> {
        if config.disabled {
            return Ok(Self::build(config, None));
        }
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a tracer delivering through a custom transport
    pub fn with_transport(config: TracerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        if config.disabled {
            return Ok(Self::build(config, None));
        }

        if config.resolved_api_key().is_none() {
            Diagnostics::new(config.debug).ignored(
                "configure",
                "no API key configured, batches will be dropped at delivery",
            );
        }

        let hub = Arc::new(PluginHub::new(config.plugins.clone(), config.hook_timeout));
        let pipeline = Pipeline::start(PipelineSettings::from_config(&config), transport, hub.clone())?;
        Ok(Self::build_with_hub(config, hub, Some(pipeline)))
    }

    /// Create from `INTERLACE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(TracerConfig::from_env())
    }

    /// A tracer that records nothing; usable without a runtime
    pub fn disabled() -> Self {
        Self::build(TracerConfig::default().with_disabled(true), None)
    }

    fn build(config: TracerConfig, pipeline: Option<Pipeline>) -> Self {
        let hub = Arc::new(PluginHub::new(config.plugins.clone(), config.hook_timeout));
        Self::build_with_hub(config, hub, pipeline)
    }

    fn build_with_hub(config: TracerConfig, hub: Arc<PluginHub>, pipeline: Option<Pipeline>) -> Self {
        let diagnostics = Diagnostics::new(config.debug);
        debug!(
            disabled = pipeline.is_none(),
            plugins = hub.len(),
            base_url = %config.base_url,
            "Tracer created"
        );
        Self {
            inner: Arc::new(TracerInner {
                id: new_id(),
                config,
                hub,
                pipeline,
                diagnostics,
            }),
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.inner.config
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.pipeline.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pipeline.as_ref().is_some_and(Pipeline::is_closed)
    }

    // ========================================================================
    // Interactions
    // ========================================================================

    /// Open a root interaction
    ///
    /// Nested calls attach to it only inside `InteractionHandle::run`
    /// (or a scope entered with `InteractionHandle::context`).
    pub async fn begin(&self, options: BeginOptions) -> InteractionHandle {
        let Some((handle, snapshot)) = self.open_interaction(options) else {
            return InteractionHandle::placeholder(self.clone());
        };
        self.inner.hub.on_interaction_start(&snapshot).await;
        handle
    }

    fn open_interaction(&self, options: BeginOptions) -> Option<(InteractionHandle, Interaction)> {
        if !self.is_recording() {
            self.inner.diagnostics.ignored("begin", "tracer disabled or closed");
            return None;
        }

        let mut interaction = match options.id {
            Some(id) => Interaction::with_id(id, options.event),
            None => Interaction::new(options.event),
        };
        interaction.user_id = options.user_id;
        interaction.input = options.input;
        interaction.properties = options.properties;
        interaction.attachments = options.attachments;

        let snapshot = interaction.clone();
        let id = interaction.id.clone();
        let handle = InteractionHandle {
            tracer: self.clone(),
            id,
            tree: Some(TraceTree::shared(interaction)),
        };
        Some((handle, snapshot))
    }

    /// Run `f` inside a new interaction and finish it with the result
    ///
    /// The result is returned unchanged. If the returned future is dropped
    /// before completing, the interaction is finished as cancelled.
    pub async fn with_interaction<F, Fut>(&self, options: BeginOptions, f: F) -> Fut::Output
    where
        F: FnOnce(InteractionHandle) -> Fut,
        Fut: Future,
        Fut::Output: SpanResult,
    {
        let handle = self.begin(options).await;
        let guard = InteractionGuard {
            handle: Some(handle.clone()),
        };

        let inner = handle.clone();
        let output = handle.run(async move { f(inner).await }).await;

        guard.disarm();
        handle.finish(FinishOptions::from_outcome(output.outcome())).await;
        output
    }

    // ========================================================================
    // Wrapping
    // ========================================================================

    /// Wrap a model client so every call is recorded as an `llm` event
    ///
    /// Wrapping a client this tracer already wrapped records nothing extra:
    /// the result shares the inner wrapper's identity.
    pub fn wrap<C: ModelClient>(&self, client: C) -> Wrapped<C> {
        Wrapped::new(self.clone(), client)
    }

    /// Wrap a function so every call is recorded as a `tool` event
    pub fn wrap_tool<F>(&self, name: impl Into<String>, f: F) -> WrappedTool<F> {
        WrappedTool::new(self.clone(), name.into(), f)
    }

    /// Record `fut` as a `tool` event
    pub async fn with_tool<I, F>(&self, name: &str, input: I, fut: F) -> F::Output
    where
        I: Serialize,
        F: Future,
        F::Output: SpanResult,
    {
        let input = serde_json::to_value(input).ok();
        self.with_span(EventKind::Tool, name, input, fut).await
    }

    /// Record a synchronous block as a `tool` event
    pub fn with_tool_sync<I, F, R>(&self, name: &str, input: I, f: F) -> R
    where
        I: Serialize,
        F: FnOnce() -> R,
        R: SpanResult,
    {
        let start = SpanStart::new(EventKind::Tool, name).with_input(serde_json::to_value(input).ok());
        let span = OpenSpan::open_sync(self, start);
        let output = span.run_sync(f);
        span.close_sync(SpanEnd::new(output.outcome()));
        output
    }

    /// Record `fut` as a `task` event
    pub async fn with_task<F>(&self, name: &str, fut: F) -> F::Output
    where
        F: Future,
        F::Output: SpanResult,
    {
        self.with_span(EventKind::Task, name, None, fut).await
    }

    /// Record `fut` as an event of `kind`, nested calls attaching under it
    pub async fn with_span<F>(
        &self,
        kind: EventKind,
        name: &str,
        input: Option<Value>,
        fut: F,
    ) -> F::Output
    where
        F: Future,
        F::Output: SpanResult,
    {
        let span = OpenSpan::open(self, SpanStart::new(kind, name).with_input(input)).await;
        let output = span.run(fut).await;
        span.close(SpanEnd::new(output.outcome())).await;
        output
    }

    // ========================================================================
    // Manual tracking
    // ========================================================================

    /// Record an already completed model call; returns its event id
    ///
    /// Attaches under the current node when there is one and is delivered
    /// as a standalone interaction otherwise.
    pub async fn track_event(&self, options: TrackEventOptions) -> String {
        let start = SpanStart::new(EventKind::Llm, options.name)
            .with_input(options.input)
            .with_model(options.model)
            .with_properties(options.properties);
        let span = OpenSpan::open(self, start).await;
        let event_id = span.ids().event_id;

        let outcome = match (options.error, options.output) {
            (Some(error), _) => Outcome::Error(error),
            (None, Some(output)) => Outcome::Output(output),
            (None, None) => Outcome::Empty,
        };
        let mut end = SpanEnd::new(outcome);
        end.usage = options.usage;
        span.close(end).await;
        event_id
    }

    /// Attach rich content to the innermost open node of the caller's chain
    pub fn add_attachment(&self, attachment: Attachment) {
        if !self.is_recording() {
            return;
        }
        let Some(node) = context::current() else {
            self.inner.diagnostics.ignored("add_attachment", "no active interaction");
            return;
        };
        let result = node.tree.lock().add_attachment(&node.node_id, attachment);
        if let Err(e) = result {
            self.inner.diagnostics.absorb(&e, "add_attachment");
        }
    }

    /// Associate traits with a user id
    pub fn identify(&self, user_id: impl Into<String>, traits: Properties) {
        self.enqueue(QueueItem::Identify(UserIdentity::new(user_id, traits)));
    }

    /// Record a signal; returns its id
    pub fn track_signal(&self, options: SignalOptions) -> String {
        let mut signal = Signal::new(options.event_id, options.name);
        signal.signal_type = options.signal_type;
        signal.sentiment = options.sentiment;
        signal.comment = options.comment;
        signal.after = options.after;
        signal.properties = options.properties;

        let id = signal.id.clone();
        self.enqueue(QueueItem::Signal(signal));
        id
    }

    /// Record end-user feedback on an event or interaction; returns the signal id
    pub fn feedback(&self, event_or_interaction_id: impl Into<String>, options: FeedbackOptions) -> String {
        let sentiment = options.resolved_sentiment();
        let mut signal = SignalOptions::new(
            event_or_interaction_id,
            options.name.unwrap_or_else(|| "feedback".to_string()),
        )
        .with_type(SignalType::Feedback);
        signal.sentiment = sentiment;
        signal.comment = options.comment;
        signal.properties = options.properties;
        if let Some(score) = options.score {
            signal = signal.with_property("score", score);
        }
        self.track_signal(signal)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Deliver everything queued so far and flush plugins
    pub async fn flush(&self) {
        if let Some(pipeline) = &self.inner.pipeline {
            pipeline.flush().await;
        }
    }

    /// Flush, shut plugins down and stop; later tracking calls are no-ops
    pub async fn close(&self) {
        if let Some(pipeline) = &self.inner.pipeline {
            pipeline.close().await;
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner
            .pipeline
            .as_ref()
            .map(Pipeline::stats)
            .unwrap_or_default()
    }

    /// Subscribe to evictions and dropped batches
    pub fn subscribe_notices(&self) -> broadcast::Receiver<DeliveryNotice> {
        match &self.inner.pipeline {
            Some(pipeline) => pipeline.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    // ========================================================================
    // Internals shared with spans and wrappers
    // ========================================================================

    pub(crate) fn id(&self) -> &str {
        &self.inner.id
    }

    pub(crate) fn hub(&self) -> &PluginHub {
        &self.inner.hub
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        self.inner.diagnostics
    }

    /// Whether new telemetry should be recorded
    pub(crate) fn is_recording(&self) -> bool {
        self.inner
            .pipeline
            .as_ref()
            .is_some_and(|pipeline| !pipeline.is_closed())
    }

    fn enqueue(&self, item: QueueItem) {
        match &self.inner.pipeline {
            Some(pipeline) => pipeline.enqueue(item),
            None => self.inner.diagnostics.ignored(item.kind(), "tracer disabled"),
        }
    }

    fn enqueue_finished(&self, finished: FinishedTree) {
        self.enqueue(QueueItem::Interaction(finished.interaction));
        for event in finished.detached {
            self.enqueue(QueueItem::Event(event));
        }
    }

    /// Queue a finished tree, then run its end hooks
    ///
    /// Queued first so a caller dropped mid-hook loses nothing.
    async fn complete(&self, finished: FinishedTree) {
        self.enqueue_finished(finished.clone());
        self.end_hooks(&finished.interaction).await;
    }

    async fn end_hooks(&self, interaction: &Interaction) {
        let mut header = interaction.clone();
        header.events.clear();
        self.inner.hub.on_interaction_end(&header).await;
        self.inner.hub.on_trace(interaction).await;
    }

    /// Delivery, then hooks, for a closed span
    pub(crate) async fn dispatch(&self, settled: Settled) {
        if settled.late {
            self.enqueue(QueueItem::Event(settled.span.clone()));
        }
        if let Some(finished) = &settled.finished {
            self.enqueue_finished(finished.clone());
        }

        self.inner.hub.on_span(&settled.span).await;
        if let Some(finished) = &settled.finished {
            self.end_hooks(&finished.interaction).await;
        }
    }

    /// Delivery now, hooks on the runtime (sync close and cancellation)
    pub(crate) fn dispatch_detached(&self, settled: Settled) {
        if settled.late {
            self.enqueue(QueueItem::Event(settled.span.clone()));
        }
        if let Some(finished) = settled.finished.clone() {
            self.enqueue_finished(finished);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tracer = self.clone();
        runtime.spawn(context::run_detached(async move {
            tracer.inner.hub.on_span(&settled.span).await;
            if let Some(finished) = &settled.finished {
                tracer.end_hooks(&finished.interaction).await;
            }
        }));
    }

    pub(crate) fn spawn_interaction_start(&self, snapshot: Interaction) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tracer = self.clone();
        runtime.spawn(async move {
            tracer.inner.hub.on_interaction_start(&snapshot).await;
        });
    }

    fn finish_detached(&self, tree: &SharedTree, outcome: Outcome) {
        let finished = tree.lock().finish(outcome);
        match finished {
            Ok(finished) => {
                self.enqueue_finished(finished.clone());
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let tracer = self.clone();
                runtime.spawn(async move {
                    tracer.end_hooks(&finished.interaction).await;
                });
            }
            Err(e) => self.inner.diagnostics.absorb(&e, "finish interaction"),
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("id", &self.inner.id)
            .field("disabled", &self.is_disabled())
            .field("closed", &self.is_closed())
            .field("hub", &self.inner.hub)
            .finish()
    }
}

// ============================================================================
// InteractionHandle
// ============================================================================

/// An open root interaction
///
/// Cheap to clone; every clone refers to the same interaction.
#[derive(Clone)]
pub struct InteractionHandle {
    tracer: Tracer,
    id: String,
    /// None for placeholder handles (disabled or closed tracer)
    tree: Option<SharedTree>,
}

impl InteractionHandle {
    fn placeholder(tracer: Tracer) -> Self {
        Self {
            tracer,
            id: new_id(),
            tree: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this handle records anything
    pub fn is_recording(&self) -> bool {
        self.tree.is_some()
    }

    /// Run `fut` with this interaction as the active root
    pub fn run<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        let node = self.tree.clone().map(ActiveNode::root);
        async move {
            match node {
                Some(node) => context::with_context(node, fut).await,
                None => fut.await,
            }
        }
    }

    /// Run `f` with this interaction as the active root
    pub fn run_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match &self.tree {
            Some(tree) => context::with_context_sync(ActiveNode::root(tree.clone()), f),
            None => f(),
        }
    }

    /// Carrier for re-entering this interaction from another task
    pub fn context(&self) -> TraceContext {
        match &self.tree {
            Some(tree) => TraceContext::empty().push(ActiveNode::root(tree.clone())),
            None => TraceContext::empty(),
        }
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<Value>) {
        let (key, value) = (key.into(), value.into());
        self.update("set_property", |root| {
            root.properties.insert(key, value);
        });
    }

    pub fn set_input(&self, input: impl Into<Value>) {
        let input = input.into();
        self.update("set_input", |root| root.input = Some(input));
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.update("set_user_id", |root| root.user_id = Some(user_id));
    }

    /// Attach rich content to the interaction itself
    pub fn add_attachment(&self, attachment: Attachment) {
        let Some(tree) = &self.tree else {
            return;
        };
        let result = tree.lock().add_attachment(&self.id, attachment);
        if let Err(e) = result {
            self.tracer.diagnostics().absorb(&e, "add_attachment");
        }
    }

    fn update<F>(&self, operation: &str, f: F)
    where
        F: FnOnce(&mut Interaction),
    {
        let Some(tree) = &self.tree else {
            return;
        };
        let result = tree.lock().update_root(f);
        if let Err(e) = result {
            self.tracer.diagnostics().absorb(&e, operation);
        }
    }

    /// Close the interaction and queue it for delivery
    ///
    /// Finishing twice is absorbed (logged in debug mode).
    pub async fn finish(&self, options: FinishOptions) {
        let Some(tree) = &self.tree else {
            return;
        };

        let outcome = options.outcome();
        if !options.properties.is_empty() {
            let properties = options.properties;
            self.update("finish interaction", |root| root.properties.extend(properties));
        }

        let finished = tree.lock().finish(outcome);

        match finished {
            Ok(finished) => self.tracer.complete(finished).await,
            Err(e) => self.tracer.diagnostics().absorb(&e, "finish interaction"),
        }
    }
}

impl std::fmt::Debug for InteractionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionHandle")
            .field("id", &self.id)
            .field("recording", &self.is_recording())
            .finish()
    }
}

/// Finishes an interaction as cancelled if `with_interaction` is dropped
struct InteractionGuard {
    handle: Option<InteractionHandle>,
}

impl InteractionGuard {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InteractionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(tree) = &handle.tree {
                handle.tracer.finish_detached(tree, Outcome::cancelled());
            }
        }
    }
}
