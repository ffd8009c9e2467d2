//! Deterministic reconstruction of in-flight state from the event stream.
//!
//! Replay is a pure fold: the same events always produce the same
//! [`ReplayContext`], byte-for-byte after serialization (all maps are
//! BTree-ordered). The context tells the executor what already happened so
//! committed commands, tools, and recorded effects are injected instead of
//! re-executed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{Event, EventType};
use crate::payload::{
    self, HttpRequestRecord, HttpResponseRecord, ToolOutcome,
};
use crate::plan::{NodeResultType, TaskGraph};

/// Coarse phase of a run, derived from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Planning,
    Executing,
    Waiting,
    Finished,
}

/// A recorded HTTP exchange, keyed by effect id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedHttp {
    pub request: HttpRequestRecord,
    pub response: HttpResponseRecord,
}

/// Everything a resuming worker needs to continue a job without repeating
/// committed side effects. Derived, never stored authoritatively — except
/// as an optional snapshot blob to accelerate long histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplayContext {
    pub task_graph: Option<TaskGraph>,
    pub plan_hash: Option<String>,
    /// Node most recently finished successfully.
    pub cursor_node: Option<String>,
    pub completed_node_ids: BTreeSet<String>,
    /// Successful node payloads by node id.
    pub payload_results: BTreeMap<String, serde_json::Value>,
    pub completed_command_ids: BTreeSet<String>,
    pub command_results: BTreeMap<String, serde_json::Value>,
    /// Successful tool results by idempotency key.
    pub completed_tool_invocations: BTreeMap<String, serde_json::Value>,
    /// Started-but-unfinished invocations; these require confirmation
    /// replay before the step may proceed.
    pub pending_tool_invocations: BTreeSet<String>,
    /// Wait payloads by correlation key.
    pub approved_correlation_keys: BTreeMap<String, serde_json::Value>,
    /// Per-step `state_changed` values, in stream order.
    pub state_changes: BTreeMap<String, Vec<serde_json::Value>>,
    pub working_memory: BTreeMap<String, serde_json::Value>,
    pub phase: RunPhase,
    pub recorded_time: BTreeMap<String, DateTime<Utc>>,
    pub recorded_uuid: BTreeMap<String, Uuid>,
    pub recorded_random: BTreeMap<String, u64>,
    pub recorded_http: BTreeMap<String, RecordedHttp>,
    /// Stream version this context reflects.
    pub last_version: i64,
}

impl ReplayContext {
    /// Rebuild from a full history.
    pub fn from_events(events: &[Event]) -> Result<Self, StoreError> {
        let mut ctx = Self::default();
        ctx.apply_all(events)?;
        Ok(ctx)
    }

    /// Resume from a snapshot, then fold only the events past it.
    pub fn from_snapshot(blob: &[u8], tail: &[Event]) -> Result<Self, StoreError> {
        let mut ctx: ReplayContext = serde_json::from_slice(blob)?;
        ctx.apply_all(tail)?;
        Ok(ctx)
    }

    /// Snapshot blob for [`Self::from_snapshot`]. BTree ordering makes the
    /// serialize → deserialize → serialize round trip byte-stable.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn apply_all(&mut self, events: &[Event]) -> Result<(), StoreError> {
        for event in events {
            if event.version <= self.last_version {
                continue;
            }
            self.apply(event)?;
            self.last_version = event.version;
        }
        Ok(())
    }

    fn apply(&mut self, event: &Event) -> Result<(), StoreError> {
        match event.event_type {
            EventType::PlanGenerated => {
                let p: payload::PlanGenerated = serde_json::from_value(event.payload.clone())?;
                self.plan_hash = Some(p.plan_hash);
                self.task_graph = Some(p.plan);
                self.phase = RunPhase::Executing;
            }
            EventType::NodeFinished => {
                let p: payload::NodeFinished = serde_json::from_value(event.payload.clone())?;
                // Only success marks a node complete; failures and
                // cancellations leave it runnable on the next attempt.
                if p.result_type == NodeResultType::Success {
                    self.completed_node_ids.insert(p.node_id.clone());
                    if let Some(value) = p.payload {
                        self.payload_results.insert(p.node_id.clone(), value);
                    }
                    self.cursor_node = Some(p.node_id);
                }
            }
            EventType::CommandCommitted => {
                let p: payload::CommandCommitted = serde_json::from_value(event.payload.clone())?;
                self.completed_command_ids.insert(p.command_id.clone());
                self.command_results.insert(p.command_id, p.result);
            }
            EventType::ToolInvocationStarted => {
                let p: payload::ToolInvocationStarted =
                    serde_json::from_value(event.payload.clone())?;
                if !self
                    .completed_tool_invocations
                    .contains_key(&p.idempotency_key)
                {
                    self.pending_tool_invocations.insert(p.idempotency_key);
                }
            }
            EventType::ToolInvocationFinished => {
                let p: payload::ToolInvocationFinished =
                    serde_json::from_value(event.payload.clone())?;
                self.pending_tool_invocations.remove(&p.idempotency_key);
                if p.outcome == ToolOutcome::Success {
                    self.completed_tool_invocations
                        .insert(p.idempotency_key, p.result.unwrap_or(serde_json::Value::Null));
                }
            }
            EventType::JobWaiting => {
                self.phase = RunPhase::Waiting;
            }
            EventType::WaitCompleted => {
                let p: payload::WaitCompleted = serde_json::from_value(event.payload.clone())?;
                self.approved_correlation_keys
                    .insert(p.correlation_key, p.payload);
                self.phase = RunPhase::Executing;
            }
            EventType::TimerFired => {
                let p: payload::TimerFired = serde_json::from_value(event.payload.clone())?;
                self.recorded_time.insert(p.effect_id, p.now);
            }
            EventType::UuidRecorded => {
                let p: payload::UuidRecorded = serde_json::from_value(event.payload.clone())?;
                self.recorded_uuid.insert(p.effect_id, p.value);
            }
            EventType::RandomRecorded => {
                let p: payload::RandomRecorded = serde_json::from_value(event.payload.clone())?;
                self.recorded_random.insert(p.effect_id, p.value);
            }
            EventType::HttpRecorded => {
                let p: payload::HttpRecorded = serde_json::from_value(event.payload.clone())?;
                self.recorded_http.insert(
                    p.effect_id,
                    RecordedHttp {
                        request: p.request,
                        response: p.response,
                    },
                );
            }
            EventType::StateChanged => {
                let p: payload::StateChanged = serde_json::from_value(event.payload.clone())?;
                self.state_changes.entry(p.step_id).or_default().push(
                    serde_json::json!({"key": p.key, "value": p.value}),
                );
            }
            EventType::MemoryWrite => {
                if let (Some(key), Some(value)) = (
                    event.payload.get("key").and_then(|k| k.as_str()),
                    event.payload.get("value"),
                ) {
                    self.working_memory.insert(key.to_string(), value.clone());
                }
            }
            EventType::JobCompleted | EventType::JobFailed | EventType::JobCancelled => {
                self.phase = RunPhase::Finished;
            }
            // Everything else is trace-only and does not affect resume state.
            _ => {}
        }
        Ok(())
    }

    /// True when the step with this command id already committed.
    pub fn command_committed(&self, command_id: &str) -> bool {
        self.completed_command_ids.contains(command_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{seal_event, NewEvent};
    use crate::plan::{TaskNode, WaitKind};

    struct StreamBuilder {
        job_id: Uuid,
        prev_hash: String,
        version: i64,
        events: Vec<Event>,
    }

    impl StreamBuilder {
        fn new() -> Self {
            Self {
                job_id: Uuid::new_v4(),
                prev_hash: String::new(),
                version: 0,
                events: Vec::new(),
            }
        }

        fn push(&mut self, ty: EventType, payload: serde_json::Value) -> &mut Self {
            self.version += 1;
            let e = seal_event(
                self.job_id,
                self.version,
                &self.prev_hash,
                NewEvent::new(ty, payload),
                Utc::now(),
            );
            self.prev_hash = e.hash.clone();
            self.events.push(e);
            self
        }
    }

    fn plan_payload() -> serde_json::Value {
        let plan = TaskGraph::new(vec![
            TaskNode::new("n1", "step"),
            TaskNode::new("n2", "step").depends_on(["n1"]),
        ]);
        let plan_hash = plan.plan_hash();
        serde_json::to_value(payload::PlanGenerated { plan, plan_hash }).unwrap()
    }

    #[test]
    fn plan_and_success_populate_cursor_and_results() {
        let mut b = StreamBuilder::new();
        b.push(EventType::PlanGenerated, plan_payload());
        b.push(
            EventType::NodeFinished,
            serde_json::json!({
                "node_id": "n1",
                "result_type": "success",
                "payload": {"answer": "ok"}
            }),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert!(ctx.completed_node_ids.contains("n1"));
        assert_eq!(ctx.cursor_node.as_deref(), Some("n1"));
        assert_eq!(ctx.payload_results["n1"]["answer"], "ok");
        assert_eq!(ctx.phase, RunPhase::Executing);
        assert_eq!(ctx.last_version, 2);
    }

    #[test]
    fn failed_node_is_not_marked_complete() {
        let mut b = StreamBuilder::new();
        b.push(
            EventType::NodeFinished,
            serde_json::json!({"node_id": "n1", "result_type": "failure", "error": "boom"}),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert!(ctx.completed_node_ids.is_empty());
        assert!(ctx.cursor_node.is_none());
    }

    #[test]
    fn committed_commands_are_injectable() {
        let mut b = StreamBuilder::new();
        b.push(
            EventType::CommandEmitted,
            serde_json::json!({"node_id": "n1", "command_id": "n1", "kind": "charge", "input": {}}),
        );
        b.push(
            EventType::CommandCommitted,
            serde_json::json!({
                "node_id": "n1", "command_id": "n1",
                "result": {"charge_id": "ch_1"}, "input_hash": "00"
            }),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert!(ctx.command_committed("n1"));
        assert_eq!(ctx.command_results["n1"]["charge_id"], "ch_1");
    }

    #[test]
    fn started_without_finished_is_pending_tool() {
        let mut b = StreamBuilder::new();
        b.push(
            EventType::ToolInvocationStarted,
            serde_json::json!({
                "invocation_id": Uuid::new_v4(),
                "idempotency_key": "p1",
                "step_id": "n1",
                "tool_name": "charge_card",
                "args_hash": "ab",
                "started_at": Utc::now()
            }),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert!(ctx.pending_tool_invocations.contains("p1"));
        assert!(ctx.completed_tool_invocations.is_empty());
    }

    #[test]
    fn finished_tool_moves_from_pending_to_completed() {
        let mut b = StreamBuilder::new();
        let inv = Uuid::new_v4();
        b.push(
            EventType::ToolInvocationStarted,
            serde_json::json!({
                "invocation_id": inv, "idempotency_key": "p1", "step_id": "n1",
                "tool_name": "charge_card", "args_hash": "ab", "started_at": Utc::now()
            }),
        );
        b.push(
            EventType::ToolInvocationFinished,
            serde_json::json!({
                "invocation_id": inv, "idempotency_key": "p1", "outcome": "success",
                "result": {"charge_id": "ch_1"}, "finished_at": Utc::now()
            }),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert!(ctx.pending_tool_invocations.is_empty());
        assert_eq!(ctx.completed_tool_invocations["p1"]["charge_id"], "ch_1");
    }

    #[test]
    fn failed_tool_clears_pending_without_completing() {
        let mut b = StreamBuilder::new();
        let inv = Uuid::new_v4();
        b.push(
            EventType::ToolInvocationStarted,
            serde_json::json!({
                "invocation_id": inv, "idempotency_key": "p1", "step_id": "n1",
                "tool_name": "charge_card", "args_hash": "ab", "started_at": Utc::now()
            }),
        );
        b.push(
            EventType::ToolInvocationFinished,
            serde_json::json!({
                "invocation_id": inv, "idempotency_key": "p1", "outcome": "failure",
                "error": "card declined", "finished_at": Utc::now()
            }),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert!(ctx.pending_tool_invocations.is_empty());
        assert!(ctx.completed_tool_invocations.is_empty());
    }

    #[test]
    fn wait_and_resume_track_correlation_keys() {
        let mut b = StreamBuilder::new();
        b.push(
            EventType::JobWaiting,
            serde_json::to_value(payload::JobWaiting {
                node_id: "approve".into(),
                wait_type: WaitKind::Human,
                correlation_key: "k1".into(),
                expires_at: None,
                resumption_context: serde_json::json!({}),
            })
            .unwrap(),
        );
        let waiting = ReplayContext::from_events(&b.events).unwrap();
        assert_eq!(waiting.phase, RunPhase::Waiting);

        b.push(
            EventType::WaitCompleted,
            serde_json::json!({"correlation_key": "k1", "payload": {"approved": true}}),
        );
        let resumed = ReplayContext::from_events(&b.events).unwrap();
        assert_eq!(resumed.phase, RunPhase::Executing);
        assert_eq!(resumed.approved_correlation_keys["k1"]["approved"], true);
    }

    #[test]
    fn recorded_effects_are_indexed_by_effect_id() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut b = StreamBuilder::new();
        b.push(
            EventType::TimerFired,
            serde_json::json!({"effect_id": "n1:now:0", "now": now}),
        );
        b.push(
            EventType::UuidRecorded,
            serde_json::json!({"effect_id": "n1:uuid:0", "value": id}),
        );
        b.push(
            EventType::RandomRecorded,
            serde_json::json!({"effect_id": "n1:random:0", "value": 42}),
        );
        b.push(
            EventType::HttpRecorded,
            serde_json::json!({
                "effect_id": "n1:http:0",
                "request": {"method": "GET", "url": "https://api.test/x"},
                "response": {"status": 200, "body": "{}"}
            }),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        assert_eq!(ctx.recorded_time["n1:now:0"], now);
        assert_eq!(ctx.recorded_uuid["n1:uuid:0"], id);
        assert_eq!(ctx.recorded_random["n1:random:0"], 42);
        assert_eq!(ctx.recorded_http["n1:http:0"].response.status, 200);
    }

    #[test]
    fn replay_is_deterministic_and_byte_stable() {
        let mut b = StreamBuilder::new();
        b.push(EventType::PlanGenerated, plan_payload());
        b.push(
            EventType::NodeFinished,
            serde_json::json!({"node_id": "n1", "result_type": "success", "payload": {"v": 1}}),
        );
        b.push(
            EventType::RandomRecorded,
            serde_json::json!({"effect_id": "n2:random:0", "value": 7}),
        );
        let a = ReplayContext::from_events(&b.events).unwrap();
        let c = ReplayContext::from_events(&b.events).unwrap();
        assert_eq!(a, c);
        assert_eq!(a.to_snapshot().unwrap(), c.to_snapshot().unwrap());
    }

    #[test]
    fn snapshot_round_trip_is_byte_stable() {
        let mut b = StreamBuilder::new();
        b.push(EventType::PlanGenerated, plan_payload());
        b.push(
            EventType::NodeFinished,
            serde_json::json!({"node_id": "n1", "result_type": "success"}),
        );
        let ctx = ReplayContext::from_events(&b.events).unwrap();
        let blob = ctx.to_snapshot().unwrap();
        let restored = ReplayContext::from_snapshot(&blob, &[]).unwrap();
        assert_eq!(restored, ctx);
        assert_eq!(restored.to_snapshot().unwrap(), blob);
    }

    #[test]
    fn snapshot_plus_tail_equals_full_fold() {
        let mut b = StreamBuilder::new();
        b.push(EventType::PlanGenerated, plan_payload());
        b.push(
            EventType::NodeFinished,
            serde_json::json!({"node_id": "n1", "result_type": "success"}),
        );
        let at_two = ReplayContext::from_events(&b.events).unwrap();
        let blob = at_two.to_snapshot().unwrap();

        b.push(
            EventType::NodeFinished,
            serde_json::json!({"node_id": "n2", "result_type": "success"}),
        );
        let full = ReplayContext::from_events(&b.events).unwrap();
        let resumed = ReplayContext::from_snapshot(&blob, &b.events).unwrap();
        assert_eq!(resumed, full);
    }
}
