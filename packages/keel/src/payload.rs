//! Typed payloads for the behaviorally significant events.
//!
//! Events whose payloads only feed the trace surface (thoughts, decisions,
//! audit marks) stay as free-form JSON; everything the replay builder folds
//! over gets a struct here so the wire shape is pinned by serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::{NodeResultType, TaskGraph, WaitKind};

/// `job_created`: written together with the metadata insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreated {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub goal: String,
    pub queue_class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// `job_running`: a worker took the job under a fresh attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunning {
    pub worker_id: String,
    pub attempt_id: Uuid,
}

/// `plan_generated`: the task graph the executor will drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGenerated {
    pub plan: TaskGraph,
    pub plan_hash: String,
}

/// `node_started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStarted {
    pub node_id: String,
}

/// `node_finished`: only `result_type == success` marks the node complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFinished {
    pub node_id: String,
    pub result_type: NodeResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `command_emitted`: intent, written before the side effect runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEmitted {
    pub node_id: String,
    pub command_id: String,
    pub kind: String,
    pub input: serde_json::Value,
}

/// `command_committed`: the side effect ran; replay injects `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCommitted {
    pub node_id: String,
    pub command_id: String,
    pub result: serde_json::Value,
    pub input_hash: String,
}

/// `tool_invocation_started`: ledger-backed, lease-fenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationStarted {
    pub invocation_id: Uuid,
    pub idempotency_key: String,
    pub step_id: String,
    pub tool_name: String,
    pub args_hash: String,
    pub started_at: DateTime<Utc>,
}

/// Outcome classification for a finished tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Failure,
}

/// `tool_invocation_finished`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationFinished {
    pub invocation_id: Uuid,
    pub idempotency_key: String,
    pub outcome: ToolOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// `job_waiting`: the job parked itself until an external signal arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWaiting {
    pub node_id: String,
    pub wait_type: WaitKind,
    pub correlation_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Snapshot of payload results plus the plan decision id, echoed back on
    /// resume so the unblocking side can act without re-deriving state.
    pub resumption_context: serde_json::Value,
}

/// `wait_completed`: the only path out of a wait; must carry the same
/// correlation key as the `job_waiting` it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitCompleted {
    pub correlation_key: String,
    pub payload: serde_json::Value,
}

/// `job_requeued`: a retryable failure sent the job back to Pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequeued {
    pub retry_count: i32,
    pub backoff_ms: i64,
    pub reason: String,
}

/// `job_completed`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobCompleted {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// `job_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailed {
    pub reason: String,
    pub failure_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// `job_cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobCancelled {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `timer_fired`: a recorded `Now` effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerFired {
    pub effect_id: String,
    pub now: DateTime<Utc>,
}

/// `uuid_recorded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UuidRecorded {
    pub effect_id: String,
    pub value: Uuid,
}

/// `random_recorded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomRecorded {
    pub effect_id: String,
    pub value: u64,
}

/// Request half of a recorded HTTP effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestRecord {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response half of a recorded HTTP effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseRecord {
    pub status: u16,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, String>,
    pub body: String,
}

/// `http_recorded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRecorded {
    pub effect_id: String,
    pub request: HttpRequestRecord,
    pub response: HttpResponseRecord,
}

/// `state_changed`: a per-step working-state mutation, kept for
/// resource-reference checks during replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub step_id: String,
    pub key: String,
    pub value: serde_json::Value,
}

/// `step_compensated`: rollback ran for a node after a compensatable failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompensated {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{TaskNode, WaitKind};

    #[test]
    fn node_finished_serializes_result_type_snake_case() {
        let payload = NodeFinished {
            node_id: "n1".into(),
            result_type: NodeResultType::Success,
            payload: Some(serde_json::json!({"answer": "ok"})),
            error: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["result_type"], "success");
        assert_eq!(json["node_id"], "n1");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn job_waiting_round_trips() {
        let payload = JobWaiting {
            node_id: "approve".into(),
            wait_type: WaitKind::Human,
            correlation_key: "approval-1".into(),
            expires_at: None,
            resumption_context: serde_json::json!({"decision": "d1"}),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"wait_type\":\"human\""));
        let back: JobWaiting = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correlation_key, "approval-1");
    }

    #[test]
    fn plan_generated_round_trips() {
        let plan = TaskGraph::new(vec![TaskNode::new("n1", "answer")]);
        let plan_hash = plan.plan_hash();
        let payload = PlanGenerated { plan, plan_hash };
        let json = serde_json::to_string(&payload).unwrap();
        let back: PlanGenerated = serde_json::from_str(&json).unwrap();
        assert_eq!(back.plan.nodes.len(), 1);
        assert_eq!(back.plan_hash, payload.plan_hash);
    }

    #[test]
    fn tool_outcome_wire_strings() {
        assert_eq!(
            serde_json::to_string(&ToolOutcome::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&ToolOutcome::Failure).unwrap(),
            "\"failure\""
        );
    }
}
