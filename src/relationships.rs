//! Parent/child task relationship table.
//!
//! The engine keeps addressing some events to a parent task while a delegated
//! sub-task is the active unit of work. This table rewrites such events onto
//! the active child and annotates child events with their parent, so UI
//! observers see one coherent conversation without understanding delegation.
//!
//! Edges are never deleted on unpause — only the active-child pointer is
//! cleared, keeping historical attribution. To bound memory in a long-lived
//! relay the table evicts the least-recently-referenced edge once it exceeds
//! capacity.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{TaskEventPayload, EVENT_TASK_SPAWNED, EVENT_TASK_UNPAUSED};

pub const DEFAULT_EDGE_CAPACITY: usize = 4096;

#[derive(Debug)]
struct ParentEdge {
    parent: String,
    last_ref: u64,
}

#[derive(Debug)]
pub struct TaskRelationshipTable {
    capacity: usize,
    counter: u64,
    /// child task id -> parent edge
    parents: HashMap<String, ParentEdge>,
    /// parent task id -> currently active child
    active_children: HashMap<String, String>,
}

impl Default for TaskRelationshipTable {
    fn default() -> Self {
        Self::new(DEFAULT_EDGE_CAPACITY)
    }
}

impl TaskRelationshipTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            counter: 0,
            parents: HashMap::new(),
            active_children: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parent_of(&self, child: &str) -> Option<&str> {
        self.parents.get(child).map(|e| e.parent.as_str())
    }

    pub fn active_child_of(&self, parent: &str) -> Option<&str> {
        self.active_children.get(parent).map(String::as_str)
    }

    /// Record a delegation: insert the child -> parent edge and mark the
    /// child as the parent's active sub-task.
    pub fn spawn(&mut self, parent: &str, child: &str) {
        self.counter += 1;
        self.parents.insert(
            child.to_string(),
            ParentEdge {
                parent: parent.to_string(),
                last_ref: self.counter,
            },
        );
        self.active_children
            .insert(parent.to_string(), child.to_string());

        if self.parents.len() > self.capacity {
            self.evict_least_recent();
        }
    }

    /// The parent was resumed: clear its active-child pointer. The edge
    /// itself survives for attribution.
    pub fn unpause(&mut self, parent: &str) -> bool {
        self.active_children.remove(parent).is_some()
    }

    /// Feed a task event's lifecycle meaning into the table. Returns true if
    /// the event mutated a relationship.
    pub fn apply_lifecycle(&mut self, event: &TaskEventPayload) -> bool {
        match event.event_name.as_str() {
            EVENT_TASK_SPAWNED => {
                let child = event
                    .message
                    .get("childTaskId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match child {
                    Some(child) => {
                        self.spawn(&event.task_id, &child);
                        true
                    }
                    None => {
                        tracing::warn!(
                            target = "session_relay::relationships",
                            parent = %event.task_id,
                            "taskSpawned event without childTaskId"
                        );
                        false
                    }
                }
            }
            EVENT_TASK_UNPAUSED => self.unpause(&event.task_id),
            _ => false,
        }
    }

    /// Rewrite/annotate an event before broadcast.
    ///
    /// An event addressed to a parent with a live active child is rewritten
    /// onto that child (`isSubtask`, `parentTaskId`). An event addressed
    /// directly to a known child keeps its task id and gains `parentTaskId`.
    /// Anything else passes through untouched.
    pub fn annotate(&mut self, event: &mut TaskEventPayload) {
        if let Some(child) = self.active_children.get(&event.task_id).cloned() {
            let parent = std::mem::replace(&mut event.task_id, child.clone());
            event.parent_task_id = Some(parent);
            event.is_subtask = Some(true);
            self.touch_edge(&child);
        } else if let Some(parent) = self.parents.get(&event.task_id).map(|e| e.parent.clone()) {
            event.parent_task_id = Some(parent);
            let child = event.task_id.clone();
            self.touch_edge(&child);
        }
    }

    fn touch_edge(&mut self, child: &str) {
        self.counter += 1;
        if let Some(edge) = self.parents.get_mut(child) {
            edge.last_ref = self.counter;
        }
    }

    fn evict_least_recent(&mut self) {
        let victim = self
            .parents
            .iter()
            .min_by_key(|(_, edge)| edge.last_ref)
            .map(|(child, _)| child.clone());
        if let Some(child) = victim {
            if let Some(edge) = self.parents.remove(&child) {
                // Keep the active pointer consistent with the edges.
                if self.active_children.get(&edge.parent) == Some(&child) {
                    self.active_children.remove(&edge.parent);
                }
                tracing::debug!(
                    target = "session_relay::relationships",
                    child = %child,
                    parent = %edge.parent,
                    "evicted least-recently-referenced task edge"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::TaskRelationshipTable;
    use crate::protocol::TaskEventPayload;

    fn event(name: &str, task_id: &str, message: serde_json::Value) -> TaskEventPayload {
        TaskEventPayload {
            event_name: name.to_string(),
            task_id: task_id.to_string(),
            parent_task_id: None,
            is_subtask: None,
            message,
        }
    }

    #[test]
    fn parent_event_is_rewritten_onto_active_child() {
        let mut table = TaskRelationshipTable::default();
        table.spawn("P", "C");

        let mut ev = event("message", "P", json!({}));
        table.annotate(&mut ev);

        assert_eq!(ev.task_id, "C");
        assert_eq!(ev.parent_task_id.as_deref(), Some("P"));
        assert_eq!(ev.is_subtask, Some(true));
    }

    #[test]
    fn direct_child_event_keeps_id_and_gains_parent() {
        let mut table = TaskRelationshipTable::default();
        table.spawn("P", "C");

        let mut ev = event("message", "C", json!({}));
        table.annotate(&mut ev);

        assert_eq!(ev.task_id, "C");
        assert_eq!(ev.parent_task_id.as_deref(), Some("P"));
        assert_eq!(ev.is_subtask, None);
    }

    #[test]
    fn unpause_clears_pointer_but_keeps_edge() {
        let mut table = TaskRelationshipTable::default();
        table.spawn("P", "C");
        assert!(table.unpause("P"));

        let mut parent_ev = event("message", "P", json!({}));
        table.annotate(&mut parent_ev);
        assert_eq!(parent_ev.task_id, "P");
        assert_eq!(parent_ev.parent_task_id, None);
        assert_eq!(parent_ev.is_subtask, None);

        let mut child_ev = event("message", "C", json!({}));
        table.annotate(&mut child_ev);
        assert_eq!(child_ev.parent_task_id.as_deref(), Some("P"));
    }

    #[test]
    fn unpause_without_active_child_is_a_noop() {
        let mut table = TaskRelationshipTable::default();
        assert!(!table.unpause("P"));
    }

    #[test]
    fn lifecycle_events_drive_the_table() {
        let mut table = TaskRelationshipTable::default();

        let spawn = event("taskSpawned", "P", json!({"childTaskId": "C"}));
        assert!(table.apply_lifecycle(&spawn));
        assert_eq!(table.active_child_of("P"), Some("C"));
        assert_eq!(table.parent_of("C"), Some("P"));

        let unpause = event("taskUnpaused", "P", json!({}));
        assert!(table.apply_lifecycle(&unpause));
        assert_eq!(table.active_child_of("P"), None);
        assert_eq!(table.parent_of("C"), Some("P"));
    }

    #[test]
    fn spawn_without_child_id_is_ignored() {
        let mut table = TaskRelationshipTable::default();
        let bad = event("taskSpawned", "P", json!({}));
        assert!(!table.apply_lifecycle(&bad));
        assert!(table.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_referenced_edge() {
        let mut table = TaskRelationshipTable::new(2);
        table.spawn("P1", "C1");
        table.spawn("P2", "C2");

        // Reference C1 so C2 becomes the LRU edge.
        let mut ev = event("message", "C1", json!({}));
        table.annotate(&mut ev);

        table.spawn("P3", "C3");
        assert_eq!(table.len(), 2);
        assert_eq!(table.parent_of("C2"), None);
        assert_eq!(table.parent_of("C1"), Some("P1"));
        assert_eq!(table.parent_of("C3"), Some("P3"));
        // The evicted child's parent must not keep a dangling active pointer.
        assert_eq!(table.active_child_of("P2"), None);
    }
}
