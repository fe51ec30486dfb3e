// Integration tests for context propagation across tasks and worker threads
//
// Run with: cargo test -p interlace-core --test context_propagation_test

use std::time::Duration;

use interlace_core::{
    current, spawn_in_context, with_context, ActiveNode, Event, EventKind, Interaction, Outcome,
    TraceContext, TraceTree,
};

/// Attach a child event under whatever node is current, then close it
async fn record_step(name: &str) -> Option<String> {
    let parent = current()?;
    let id = parent
        .tree
        .lock()
        .attach(&parent.node_id, Event::new(EventKind::Tool, name, "", ""))
        .ok()?;

    // Suspend so the chain can resume on a different worker
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    parent.tree.lock().close_event(&id, Outcome::Empty).ok()?;
    Some(parent.interaction_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_interactions_do_not_cross_talk() {
    let mut handles = Vec::new();

    for i in 0..16 {
        handles.push(tokio::spawn(async move {
            let tree = TraceTree::shared(Interaction::new(format!("request-{i}")));
            let root = ActiveNode::root(tree.clone());
            let root_id = root.node_id.clone();

            let seen = with_context(root, async {
                let mut seen = Vec::new();
                for step in 0..5 {
                    seen.push(record_step(&format!("step-{step}")).await);
                }
                seen
            })
            .await;

            let finished = tree.lock().finish(Outcome::Empty).unwrap();
            (root_id, seen, finished.interaction)
        }));
    }

    for handle in handles {
        let (root_id, seen, interaction) = handle.await.unwrap();
        assert!(seen.iter().all(|id| id.as_deref() == Some(root_id.as_str())));
        assert_eq!(interaction.events.len(), 5);
        let names: Vec<_> = interaction.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["step-0", "step-1", "step-2", "step-3", "step-4"]);
        assert!(interaction
            .events
            .iter()
            .all(|e| e.interaction_id == root_id && e.parent_id == root_id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_scope_restores_context() {
    let tree = TraceTree::shared(Interaction::new("outer"));
    let outer = ActiveNode::root(tree.clone());
    let outer_id = outer.node_id.clone();

    let after = with_context(outer, async {
        let inner_tree = TraceTree::shared(Interaction::new("inner"));
        let inner = ActiveNode::root(inner_tree);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            with_context(inner, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }),
        )
        .await;
        assert!(cancelled.is_err());

        current().map(|n| n.node_id)
    })
    .await;

    assert_eq!(after, Some(outer_id));
    assert!(current().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_scope_restores_context() {
    let tree = TraceTree::shared(Interaction::new("outer"));
    let outer = ActiveNode::root(tree);

    let joined = tokio::spawn(with_context(outer, async {
        panic!("boom");
    }))
    .await;
    assert!(joined.is_err());
    assert!(current().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_children_attach_to_parent() {
    let tree = TraceTree::shared(Interaction::new("fan_out"));
    let root = ActiveNode::root(tree.clone());
    let root_id = root.node_id.clone();

    let results = with_context(root, async {
        let a = spawn_in_context(record_step("a"));
        let b = spawn_in_context(record_step("b"));
        (a.await.unwrap(), b.await.unwrap())
    })
    .await;

    assert_eq!(results.0.as_deref(), Some(root_id.as_str()));
    assert_eq!(results.1.as_deref(), Some(root_id.as_str()));

    let interaction = tree.lock().finish(Outcome::Empty).unwrap().interaction;
    assert_eq!(interaction.events.len(), 2);
}

#[tokio::test]
async fn test_captured_carrier_reenters_chain() {
    let tree = TraceTree::shared(Interaction::new("callback"));
    let root = ActiveNode::root(tree);
    let root_id = root.node_id.clone();

    let carrier = with_context(root, async { TraceContext::current() }).await;
    assert!(current().is_none());

    let seen = carrier.scope(async { current().map(|n| n.node_id) }).await;
    assert_eq!(seen, Some(root_id));
}
