// Tool wrappers
//
// Higher-order form of `Tracer::with_tool`: a function wrapped once and
// recorded as a `tool` event on every call, with its arguments as input
// and its result as output.

use std::future::Future;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use interlace_core::{context, EventKind};

use crate::span::{OpenSpan, SpanEnd, SpanResult, SpanStart};
use crate::tracer::Tracer;

/// A function whose calls are recorded as `tool` events
///
/// ```ignore
/// let search = tracer.wrap_tool("search", |query: String| async move {
///     index.search(&query).await
/// });
/// let hits = search.call("rust tracing".to_string()).await?;
/// ```
#[derive(Clone)]
pub struct WrappedTool<F> {
    tracer: Tracer,
    name: String,
    f: F,
}

impl<F> WrappedTool<F> {
    pub(crate) fn new(tracer: Tracer, name: String, f: F) -> Self {
        Self { tracer, name, f }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call and await the tool
    pub async fn call<A, Fut>(&self, args: A) -> Fut::Output
    where
        F: Fn(A) -> Fut,
        A: Serialize,
        Fut: Future,
        Fut::Output: SpanResult,
    {
        let input = arguments(&args);
        self.tracer
            .with_span(EventKind::Tool, &self.name, input, (self.f)(args))
            .await
    }

    /// Run the tool on a new task; the event still attaches to the caller's
    /// current node
    pub fn spawn<A, Fut>(&self, args: A) -> JoinHandle<Fut::Output>
    where
        F: Fn(A) -> Fut,
        A: Serialize,
        Fut: Future + Send + 'static,
        Fut::Output: SpanResult + Send + 'static,
    {
        let tracer = self.tracer.clone();
        let name = self.name.clone();
        let input = arguments(&args);
        let fut = (self.f)(args);
        context::spawn_in_context(async move {
            tracer.with_span(EventKind::Tool, &name, input, fut).await
        })
    }

    /// Call a synchronous tool
    pub fn call_sync<A, R>(&self, args: A) -> R
    where
        F: Fn(A) -> R,
        A: Serialize,
        R: SpanResult,
    {
        let start = SpanStart::new(EventKind::Tool, self.name.as_str()).with_input(arguments(&args));
        let span = OpenSpan::open_sync(&self.tracer, start);
        let output = span.run_sync(|| (self.f)(args));
        span.close_sync(SpanEnd::new(output.outcome()));
        output
    }
}

fn arguments<A: Serialize>(args: &A) -> Option<Value> {
    serde_json::to_value(args).ok().filter(|value| !value.is_null())
}

impl<F> std::fmt::Debug for WrappedTool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedTool").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::options::{BeginOptions, FinishOptions};
    use crate::testing::MemoryTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn tracer() -> (Tracer, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::with_transport(
            TracerConfig::default().with_api_key("test"),
            transport.clone(),
        )
        .unwrap();
        (tracer, transport)
    }

    #[tokio::test]
    async fn test_awaited_tool_records_args_and_result() {
        let (tracer, transport) = tracer();
        let lookup = tracer.wrap_tool("lookup", |id: u32| async move {
            if id == 0 {
                Err("no such id".to_string())
            } else {
                Ok(json!({"id": id, "name": "widget"}))
            }
        });

        let handle = tracer.begin(BeginOptions::new("order")).await;
        let found = handle.run(lookup.call(7)).await;
        let missing = handle.run(lookup.call(0)).await;
        handle.finish(FinishOptions::new()).await;
        tracer.flush().await;

        assert_eq!(found.unwrap()["name"], json!("widget"));
        assert_eq!(missing, Err("no such id".to_string()));

        let events = &transport.interactions()[0].events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Tool);
        assert_eq!(events[0].name, "lookup");
        assert_eq!(events[0].input, Some(json!(7)));
        assert_eq!(events[0].output.as_ref().unwrap()["id"], json!(7));
        assert_eq!(events[1].error.as_ref().unwrap().message, "no such id");
    }

    #[tokio::test]
    async fn test_spawned_tool_attaches_to_caller() {
        let (tracer, transport) = tracer();
        let notify = tracer.wrap_tool("notify", |user: String| async move {
            Ok::<_, std::io::Error>(format!("sent to {}", user))
        });

        let handle = tracer.begin(BeginOptions::new("signup")).await;
        let task = handle.run(async { notify.spawn("ada".to_string()) }).await;
        assert_eq!(task.await.unwrap().unwrap(), "sent to ada");
        handle.finish(FinishOptions::new()).await;
        tracer.flush().await;

        let interaction = &transport.interactions()[0];
        assert_eq!(interaction.events.len(), 1);
        assert_eq!(interaction.events[0].parent_id, interaction.id);
    }

    #[tokio::test]
    async fn test_sync_tool() {
        let (tracer, transport) = tracer();
        let add = tracer.wrap_tool("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b));

        let handle = tracer.begin(BeginOptions::new("math")).await;
        let sum = handle.run_sync(|| add.call_sync((2, 3)));
        handle.finish(FinishOptions::new()).await;
        tracer.flush().await;

        assert_eq!(sum, Ok(5));
        let event = &transport.interactions()[0].events[0];
        assert_eq!(event.input, Some(json!([2, 3])));
        assert_eq!(event.output, Some(json!(5)));
    }
}
