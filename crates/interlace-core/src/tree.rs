// Open Interaction Tree
//
// A TraceTree owns one interaction while it is open and tracks which nodes
// are still open. Events are attached in call order and stored flat until
// the interaction finishes, at which point the closed ones are assembled
// into the nested tree that gets delivered.
//
// Events that close after the interaction finished are "late": they are
// handed back to the caller for standalone delivery instead of being
// attached to a node that is already closed.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Result, TracerError};
use crate::model::{Attachment, Event, Interaction, Outcome};

/// Tree shared between every call chain participating in one interaction
///
/// The lock is only held for structural updates, never across an await.
pub type SharedTree = Arc<Mutex<TraceTree>>;

/// An event that has just been closed
#[derive(Debug, Clone)]
pub struct ClosedEvent {
    pub event: Event,
    /// The owning interaction had already finished when the event closed
    pub late: bool,
}

/// Result of finishing an interaction
#[derive(Debug, Clone)]
pub struct FinishedTree {
    pub interaction: Interaction,
    /// Closed events whose parent event was still open at finish time
    pub detached: Vec<Event>,
}

/// Structural state of one open interaction
#[derive(Debug)]
pub struct TraceTree {
    interaction: Interaction,
    open: HashMap<String, Event>,
    closed: HashMap<String, Event>,
    closed_ids: HashSet<String>,
    children: HashMap<String, Vec<String>>,
    order: Vec<String>,
    finished: bool,
}

impl TraceTree {
    pub fn new(interaction: Interaction) -> Self {
        Self {
            interaction,
            open: HashMap::new(),
            closed: HashMap::new(),
            closed_ids: HashSet::new(),
            children: HashMap::new(),
            order: Vec::new(),
            finished: false,
        }
    }

    /// Wrap in the shared handle used by the context manager
    pub fn shared(interaction: Interaction) -> SharedTree {
        Arc::new(Mutex::new(Self::new(interaction)))
    }

    pub fn interaction_id(&self) -> &str {
        &self.interaction.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether `node_id` names the open root or an open event
    pub fn is_open(&self, node_id: &str) -> bool {
        if node_id == self.interaction.id {
            !self.finished
        } else {
            self.open.contains_key(node_id)
        }
    }

    pub fn open_event_count(&self) -> usize {
        self.open.len()
    }

    /// Header of the root interaction (no children), for hooks
    pub fn snapshot(&self) -> Interaction {
        let mut snapshot = self.interaction.clone();
        snapshot.events.clear();
        snapshot
    }

    /// Mutate the root while it is still open
    pub fn update_root<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Interaction),
    {
        if self.finished {
            return Err(TracerError::already_closed(&self.interaction.id));
        }
        f(&mut self.interaction);
        Ok(())
    }

    /// Mutate an open event
    pub fn update_event<F>(&mut self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Event),
    {
        match self.open.get_mut(id) {
            Some(event) => {
                f(event);
                Ok(())
            }
            None if self.closed_ids.contains(id) => Err(TracerError::already_closed(id)),
            None => Err(TracerError::unknown_node(id)),
        }
    }

    /// Attach an open event under `parent_id`
    ///
    /// Fails with `InvalidParent` unless the parent is the open root or an
    /// open event of this tree. Siblings keep attach (call) order.
    pub fn attach(&mut self, parent_id: &str, mut child: Event) -> Result<String> {
        if !self.is_open(parent_id) {
            return Err(TracerError::invalid_parent(parent_id));
        }

        child.parent_id = parent_id.to_string();
        child.interaction_id = self.interaction.id.clone();
        let id = child.id.clone();

        self.children
            .entry(parent_id.to_string())
            .or_default()
            .push(id.clone());
        self.order.push(id.clone());
        self.open.insert(id.clone(), child);
        Ok(id)
    }

    /// Append an attachment to an open node, preserving insertion order
    pub fn add_attachment(&mut self, node_id: &str, attachment: Attachment) -> Result<()> {
        if node_id == self.interaction.id {
            return self.update_root(|root| root.attachments.push(attachment));
        }
        self.update_event(node_id, |event| event.attachments.push(attachment))
    }

    /// Close an open event
    pub fn close_event(&mut self, id: &str, outcome: Outcome) -> Result<ClosedEvent> {
        let Some(mut event) = self.open.remove(id) else {
            if self.closed_ids.contains(id) {
                return Err(TracerError::already_closed(id));
            }
            return Err(TracerError::unknown_node(id));
        };

        event.close(outcome)?;
        self.closed_ids.insert(id.to_string());

        if self.finished {
            return Ok(ClosedEvent { event, late: true });
        }

        self.closed.insert(id.to_string(), event.clone());
        Ok(ClosedEvent {
            event,
            late: false,
        })
    }

    /// Finish the root and assemble the delivered tree
    pub fn finish(&mut self, outcome: Outcome) -> Result<FinishedTree> {
        if self.finished {
            return Err(TracerError::already_closed(&self.interaction.id));
        }
        self.interaction.close(outcome)?;
        self.finished = true;

        let root_id = self.interaction.id.clone();
        let mut interaction = self.interaction.clone();
        interaction.events = self.assemble(&root_id);

        // Closed subtrees hanging off events that are still open
        let mut detached = Vec::new();
        let order = std::mem::take(&mut self.order);
        for id in &order {
            let parent_open = self
                .closed
                .get(id)
                .map(|event| self.open.contains_key(&event.parent_id));
            if parent_open == Some(true) {
                if let Some(mut event) = self.closed.remove(id) {
                    event.children = self.assemble(id);
                    detached.push(event);
                }
            }
        }

        self.closed.clear();
        self.children.clear();

        Ok(FinishedTree {
            interaction,
            detached,
        })
    }

    fn assemble(&mut self, parent_id: &str) -> Vec<Event> {
        let child_ids = self.children.remove(parent_id).unwrap_or_default();
        let mut out = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            if let Some(mut event) = self.closed.remove(&child_id) {
                event.children = self.assemble(&child_id);
                out.push(event);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttachmentRole, EventKind};
    use serde_json::json;

    fn tree() -> TraceTree {
        TraceTree::new(Interaction::new("rag_query"))
    }

    fn event(kind: EventKind, name: &str) -> Event {
        Event::new(kind, name, "", "")
    }

    #[test]
    fn test_attach_to_unknown_parent_fails() {
        let mut tree = tree();
        let err = tree
            .attach("nope", event(EventKind::Llm, "chat"))
            .unwrap_err();
        assert_eq!(err, TracerError::invalid_parent("nope"));
    }

    #[test]
    fn test_attach_to_closed_event_fails() {
        let mut tree = tree();
        let root = tree.interaction_id().to_string();
        let tool = tree.attach(&root, event(EventKind::Tool, "search")).unwrap();
        tree.close_event(&tool, Outcome::Empty).unwrap();

        let err = tree
            .attach(&tool, event(EventKind::Llm, "chat"))
            .unwrap_err();
        assert!(matches!(err, TracerError::InvalidParent { .. }));
    }

    #[test]
    fn test_attach_after_finish_fails() {
        let mut tree = tree();
        let root = tree.interaction_id().to_string();
        tree.finish(Outcome::Empty).unwrap();
        assert!(tree.attach(&root, event(EventKind::Llm, "chat")).is_err());
    }

    #[test]
    fn test_close_twice_and_unknown() {
        let mut tree = tree();
        let root = tree.interaction_id().to_string();
        let id = tree.attach(&root, event(EventKind::Llm, "chat")).unwrap();
        tree.close_event(&id, Outcome::output("A")).unwrap();

        assert_eq!(
            tree.close_event(&id, Outcome::Empty).unwrap_err(),
            TracerError::already_closed(&id)
        );
        assert_eq!(
            tree.close_event("ghost", Outcome::Empty).unwrap_err(),
            TracerError::unknown_node("ghost")
        );
    }

    #[test]
    fn test_finish_assembles_nested_tree_in_call_order() {
        let mut tree = tree();
        let root = tree.interaction_id().to_string();

        let first = tree.attach(&root, event(EventKind::Task, "plan")).unwrap();
        let second = tree.attach(&root, event(EventKind::Llm, "chat")).unwrap();
        let nested = tree.attach(&first, event(EventKind::Tool, "search")).unwrap();

        // Close out of open order
        tree.close_event(&second, Outcome::output("A")).unwrap();
        tree.close_event(&nested, Outcome::output("hits")).unwrap();
        tree.close_event(&first, Outcome::Empty).unwrap();

        let finished = tree.finish(Outcome::output("A")).unwrap();
        let interaction = finished.interaction;
        assert!(finished.detached.is_empty());

        assert_eq!(interaction.events.len(), 2);
        assert_eq!(interaction.events[0].id, first);
        assert_eq!(interaction.events[1].id, second);
        assert_eq!(interaction.events[0].children.len(), 1);
        assert_eq!(interaction.events[0].children[0].id, nested);
        assert_eq!(interaction.events[0].children[0].parent_id, first);
        assert_eq!(interaction.output, Some(json!("A")));
        assert!(interaction
            .all_events()
            .iter()
            .all(|e| e.interaction_id == root));
    }

    #[test]
    fn test_open_events_are_late_after_finish() {
        let mut tree = tree();
        let root = tree.interaction_id().to_string();
        let slow = tree.attach(&root, event(EventKind::Tool, "slow")).unwrap();
        let child = tree.attach(&slow, event(EventKind::Llm, "chat")).unwrap();
        tree.close_event(&child, Outcome::Empty).unwrap();

        let finished = tree.finish(Outcome::Empty).unwrap();
        assert!(finished.interaction.events.is_empty());
        assert_eq!(finished.detached.len(), 1);
        assert_eq!(finished.detached[0].id, child);

        let closed = tree.close_event(&slow, Outcome::Empty).unwrap();
        assert!(closed.late);
        assert_eq!(closed.event.parent_id, root);
    }

    #[test]
    fn test_finish_twice_fails() {
        let mut tree = tree();
        tree.finish(Outcome::Empty).unwrap();
        assert!(matches!(
            tree.finish(Outcome::Empty),
            Err(TracerError::AlreadyClosed { .. })
        ));
    }

    #[test]
    fn test_attachments_preserve_insertion_order() {
        let mut tree = tree();
        let root = tree.interaction_id().to_string();
        let id = tree.attach(&root, event(EventKind::Llm, "chat")).unwrap();

        tree.add_attachment(&id, Attachment::text(AttachmentRole::Input, "one"))
            .unwrap();
        tree.add_attachment(&id, Attachment::text(AttachmentRole::Output, "two"))
            .unwrap();
        tree.add_attachment(&root, Attachment::text(AttachmentRole::Input, "root"))
            .unwrap();
        tree.close_event(&id, Outcome::Empty).unwrap();

        assert!(matches!(
            tree.add_attachment(&id, Attachment::text(AttachmentRole::Input, "x")),
            Err(TracerError::AlreadyClosed { .. })
        ));

        let interaction = tree.finish(Outcome::Empty).unwrap().interaction;
        let values: Vec<_> = interaction.events[0]
            .attachments
            .iter()
            .map(|a| a.value.as_str())
            .collect();
        assert_eq!(values, vec!["one", "two"]);
        assert_eq!(interaction.attachments.len(), 1);
    }
}
