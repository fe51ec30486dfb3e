// Model Client Interception
//
// `Tracer::wrap` turns any ModelClient into a behaviour-preserving wrapper
// that records each call as an `llm` event. Results and errors pass
// through untouched; successful responses come back as `Traced<R>`, which
// derefs to the original response and carries the event's ids.

use std::ops::Deref;

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use interlace_core::{new_id, ErrorInfo, EventKind, Outcome};

use crate::extract::{Capability, RequestFields, ResponseFields};
use crate::span::{OpenSpan, SpanEnd, SpanStart, TraceIds};
use crate::tracer::Tracer;

/// Marks a client as already instrumented by a tracer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrumentation {
    tracer_id: String,
    wrapper_id: String,
}

impl Instrumentation {
    pub fn tracer_id(&self) -> &str {
        &self.tracer_id
    }

    pub fn wrapper_id(&self) -> &str {
        &self.wrapper_id
    }
}

/// A model provider's call surface
///
/// Implement this for a provider client to make it wrappable. The request
/// and response are serialized for extraction only; the client always sees
/// the original values.
///
/// ```ignore
/// #[async_trait]
/// impl ModelClient for OpenAiClient {
///     type Request = ChatRequest;
///     type Response = ChatResponse;
///     type Error = OpenAiError;
///
///     fn capability(&self) -> Capability {
///         Capability::ChatCompletions
///     }
///
///     async fn call(&self, request: ChatRequest) -> Result<ChatResponse, OpenAiError> {
///         self.chat(request).await
///     }
/// }
/// ```
#[async_trait]
pub trait ModelClient: Send + Sync {
    type Request: Serialize + Send;
    type Response: Serialize + Send;
    type Error: std::error::Error + Send;

    /// Call shape used to extract model, input, output and usage
    fn capability(&self) -> Capability {
        Capability::Raw
    }

    /// Set by wrappers; plain clients keep the default
    fn instrumentation(&self) -> Option<&Instrumentation> {
        None
    }

    /// Ids already attached to a response by an inner wrapper
    fn trace_ids(_response: &Self::Response) -> Option<TraceIds>
    where
        Self: Sized,
    {
        None
    }

    async fn call(&self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

// ============================================================================
// Traced
// ============================================================================

/// A response paired with the ids of the event that recorded it
#[derive(Debug, Clone, PartialEq)]
pub struct Traced<R> {
    inner: R,
    ids: TraceIds,
}

impl<R> Traced<R> {
    pub(crate) fn new(inner: R, ids: TraceIds) -> Self {
        Self { inner, ids }
    }

    /// Id to reference in `feedback` or `track_signal`
    pub fn event_id(&self) -> &str {
        &self.ids.event_id
    }

    pub fn interaction_id(&self) -> &str {
        &self.ids.interaction_id
    }

    pub fn ids(&self) -> &TraceIds {
        &self.ids
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> Deref for Traced<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner
    }
}

impl<R: Serialize> Serialize for Traced<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}

// ============================================================================
// Wrapped
// ============================================================================

/// A ModelClient that records its calls
///
/// Derefs to the inner client so its other methods stay reachable.
pub struct Wrapped<C> {
    client: C,
    tracer: Tracer,
    instrumentation: Instrumentation,
    /// Inner client is already instrumented by the same tracer
    pass_through: bool,
}

impl<C: ModelClient> Wrapped<C> {
    pub(crate) fn new(tracer: Tracer, client: C) -> Self {
        let existing = client
            .instrumentation()
            .filter(|existing| existing.tracer_id == tracer.id())
            .cloned();

        let pass_through = existing.is_some();
        let instrumentation = existing.unwrap_or_else(|| Instrumentation {
            tracer_id: tracer.id().to_string(),
            wrapper_id: new_id(),
        });

        Self {
            client,
            tracer,
            instrumentation,
            pass_through,
        }
    }

    /// Whether both wrappers are the same instrumentation of one client
    pub fn same_instance<D>(&self, other: &Wrapped<D>) -> bool {
        self.instrumentation == other.instrumentation
    }

    pub fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    pub fn inner(&self) -> &C {
        &self.client
    }

    pub fn into_inner(self) -> C {
        self.client
    }

    fn request_fields(&self, capability: &Capability, request: &C::Request) -> RequestFields {
        match serde_json::to_value(request) {
            Ok(value) => capability.extractor().request(&value),
            Err(e) => {
                self.tracer.diagnostics().absorb(&e, "serialize model request");
                RequestFields::default()
            }
        }
    }

    fn response_fields(&self, capability: &Capability, response: &C::Response) -> ResponseFields {
        match serde_json::to_value(response) {
            Ok(value) => capability.extractor().response(&value),
            Err(e) => {
                self.tracer.diagnostics().absorb(&e, "serialize model response");
                ResponseFields::default()
            }
        }
    }
}

impl<C> Deref for Wrapped<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C> std::fmt::Debug for Wrapped<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wrapped")
            .field("client", &std::any::type_name::<C>())
            .field("wrapper_id", &self.instrumentation.wrapper_id)
            .field("pass_through", &self.pass_through)
            .finish()
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for Wrapped<C> {
    type Request = C::Request;
    type Response = Traced<C::Response>;
    type Error = C::Error;

    fn capability(&self) -> Capability {
        self.client.capability()
    }

    fn instrumentation(&self) -> Option<&Instrumentation> {
        Some(&self.instrumentation)
    }

    fn trace_ids(response: &Traced<C::Response>) -> Option<TraceIds> {
        Some(response.ids.clone())
    }

    async fn call(&self, request: C::Request) -> Result<Traced<C::Response>, C::Error> {
        if self.pass_through {
            let response = self.client.call(request).await?;
            let ids = C::trace_ids(&response).unwrap_or_else(TraceIds::placeholder);
            return Ok(Traced::new(response, ids));
        }

        if !self.tracer.is_recording() {
            let response = self.client.call(request).await?;
            return Ok(Traced::new(response, TraceIds::placeholder()));
        }

        let capability = self.client.capability();
        let fields = self.request_fields(&capability, &request);
        let start = SpanStart::new(EventKind::Llm, capability.extractor().operation())
            .with_input(fields.input)
            .with_model(fields.model);

        let span = OpenSpan::open(&self.tracer, start).await;
        let ids = span.ids();
        let result = span.run(self.client.call(request)).await;

        let end = match &result {
            Ok(response) => {
                let fields = self.response_fields(&capability, response);
                SpanEnd {
                    outcome: fields.output.map(Outcome::Output).unwrap_or(Outcome::Empty),
                    model: fields.model,
                    usage: fields.usage,
                }
            }
            Err(e) => SpanEnd::new(Outcome::Error(ErrorInfo::from_error(e))),
        };
        span.close(end).await;

        result.map(|response| Traced::new(response, ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::options::{BeginOptions, FinishOptions};
    use crate::testing::{MemoryTransport, RecordingPlugin};
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("rate limited: {0}")]
    struct RateLimited(String);

    /// Answers with a fixed chat-completions payload, or fails when asked
    struct ChatClient;

    #[async_trait]
    impl ModelClient for ChatClient {
        type Request = Value;
        type Response = Value;
        type Error = RateLimited;

        fn capability(&self) -> Capability {
            Capability::ChatCompletions
        }

        async fn call(&self, request: Value) -> Result<Value, RateLimited> {
            if request["fail"] == json!(true) {
                return Err(RateLimited("retry in 2s".into()));
            }
            Ok(json!({
                "model": "gpt-4o-2024-08-06",
                "choices": [{"message": {"role": "assistant", "content": "A"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            }))
        }
    }

    fn tracer_with_plugin() -> (Tracer, Arc<MemoryTransport>, Arc<RecordingPlugin>) {
        let transport = Arc::new(MemoryTransport::new());
        let plugin = Arc::new(RecordingPlugin::new("rec"));
        let config = TracerConfig::default()
            .with_api_key("test")
            .with_plugin(plugin.clone());
        let tracer = Tracer::with_transport(config, transport.clone()).unwrap();
        (tracer, transport, plugin)
    }

    #[tokio::test]
    async fn test_wrapped_call_records_llm_event() {
        let (tracer, transport, _) = tracer_with_plugin();
        let client = tracer.wrap(ChatClient);

        let handle = tracer.begin(BeginOptions::new("chat")).await;
        let request = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Q"}]});
        let response = handle.run(client.call(request)).await.unwrap();
        handle.finish(FinishOptions::new().with_output("A")).await;
        tracer.flush().await;

        assert_eq!(response["choices"][0]["message"]["content"], json!("A"));
        assert_eq!(response.interaction_id(), handle.id());

        let interaction = &transport.interactions()[0];
        let event = &interaction.events[0];
        assert_eq!(event.id, response.event_id());
        assert_eq!(event.kind, EventKind::Llm);
        assert_eq!(event.name, "chat.completions");
        assert_eq!(event.model.as_deref(), Some("gpt-4o-2024-08-06"));
        assert_eq!(event.output, Some(json!("A")));
        assert_eq!(event.usage.unwrap().total_tokens, Some(4));
        assert!(event.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_wrapped_error_is_identical() {
        let (tracer, transport, plugin) = tracer_with_plugin();
        let client = tracer.wrap(ChatClient);

        let err = client.call(json!({"fail": true})).await.unwrap_err();
        tracer.flush().await;

        assert_eq!(err, RateLimited("retry in 2s".into()));
        let spans = plugin.spans();
        assert_eq!(spans.len(), 1);
        let error = spans[0].error.as_ref().unwrap();
        assert_eq!(error.kind, "RateLimited");
        assert_eq!(error.message, "rate limited: retry in 2s");
        assert_eq!(transport.interactions()[0].event, "llm_call");
    }

    #[tokio::test]
    async fn test_wrap_is_idempotent() {
        let (tracer, transport, plugin) = tracer_with_plugin();
        let once = tracer.wrap(ChatClient);
        let twice = tracer.wrap(tracer.wrap(ChatClient));
        assert!(!once.is_pass_through());
        assert!(twice.is_pass_through());
        assert!(twice.same_instance(twice.inner()));
        assert!(!once.same_instance(&twice));

        let response = twice.call(json!({"model": "gpt-4o"})).await.unwrap();
        tracer.flush().await;

        assert_eq!(plugin.spans().len(), 1);
        assert_eq!(response.event_id(), plugin.spans()[0].id);
        assert_eq!(transport.interactions().len(), 1);
    }

    #[tokio::test]
    async fn test_other_tracer_instruments_again() {
        let (first, _, first_plugin) = tracer_with_plugin();
        let (second, _, second_plugin) = tracer_with_plugin();
        let client = second.wrap(first.wrap(ChatClient));
        assert!(!client.is_pass_through());

        client.call(json!({})).await.unwrap();
        first.flush().await;
        second.flush().await;
        assert_eq!(first_plugin.spans().len(), 1);
        assert_eq!(second_plugin.spans().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_tracer_passes_through() {
        let tracer = Tracer::disabled();
        let client = tracer.wrap(ChatClient);
        let response = client.call(json!({})).await.unwrap();
        assert!(!response.event_id().is_empty());
        assert_eq!(response.into_inner()["model"], json!("gpt-4o-2024-08-06"));
    }

    #[test]
    fn test_traced_serializes_transparently() {
        let traced = Traced::new(json!({"a": 1}), TraceIds::placeholder());
        assert_eq!(serde_json::to_value(&traced).unwrap(), json!({"a": 1}));
    }
}
