//! Run lifecycle events.
//!
//! `WorkflowEvent` is both the append-only audit record persisted per run and
//! the payload broadcast on the in-process event bus. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reason recorded on `run_resumed` when a checkpoint drove the resume point.
pub const RESUME_REASON_CHECKPOINT: &str = "deterministic_resume_checkpoint";

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventType {
    RunStarted,
    RunResumed,
    RunPaused,
    RunCompleted,
    RunFailed,
    RunCancelled,
    NodeStarted,
    NodeSucceeded,
    NodeFailed,
    NodePaused,
    CompensationFailed,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventType::RunStarted => "run_started",
            WorkflowEventType::RunResumed => "run_resumed",
            WorkflowEventType::RunPaused => "run_paused",
            WorkflowEventType::RunCompleted => "run_completed",
            WorkflowEventType::RunFailed => "run_failed",
            WorkflowEventType::RunCancelled => "run_cancelled",
            WorkflowEventType::NodeStarted => "node_started",
            WorkflowEventType::NodeSucceeded => "node_succeeded",
            WorkflowEventType::NodeFailed => "node_failed",
            WorkflowEventType::NodePaused => "node_paused",
            WorkflowEventType::CompensationFailed => "compensation_failed",
        }
    }

    /// Whether this event ends a driver session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEventType::RunCompleted
                | WorkflowEventType::RunFailed
                | WorkflowEventType::RunCancelled
                | WorkflowEventType::RunPaused
        )
    }
}

impl fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended audit/observability record for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: WorkflowEventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Build a new event stamped with the current time.
    pub fn new(run_id: Uuid, event_type: WorkflowEventType, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_snake_case_type() {
        let event = WorkflowEvent::new(
            Uuid::nil(),
            WorkflowEventType::NodeFailed,
            json!({ "node_id": "charge", "compensation_applied": true }),
        );
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "node_failed");
        assert_eq!(v["payload"]["compensation_applied"], true);

        let parsed: WorkflowEvent = serde_json::from_value(v).unwrap();
        assert_eq!(parsed.event_type, WorkflowEventType::NodeFailed);
    }

    #[test]
    fn terminal_event_types() {
        assert!(WorkflowEventType::RunCompleted.is_terminal());
        assert!(WorkflowEventType::RunPaused.is_terminal());
        assert!(!WorkflowEventType::NodeSucceeded.is_terminal());
        assert_eq!(WorkflowEventType::RunResumed.to_string(), "run_resumed");
    }
}
