//! The executor: drives a task graph over a replay context.
//!
//! The executor does not know what a node computes. Node kinds route to
//! registered [`NodeHandler`]s; handlers express side effects through the
//! step context (two-phase commands, ledgered tools, recorded effects,
//! waits) so that a resumed run injects committed results instead of
//! executing them again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::effects::{EffectRecorder, HttpClient, RecordedEffects};
use crate::error::{FailureKind, StepFailure, StoreError};
use crate::event::EventType;
use crate::payload::{
    CommandCommitted, CommandEmitted, JobCompleted, JobWaiting, NodeFinished, NodeStarted,
    PlanGenerated, StepCompensated, ToolInvocationFinished, ToolInvocationStarted, ToolOutcome,
};
use crate::plan::{NodeResultType, TaskGraph, TaskNode, WaitKind};
use crate::replay::ReplayContext;
use crate::store::{ToolInvocationLedger, ToolInvocationRecord, ToolInvocationStatus};
use crate::writer::EventWriter;

// ============================================================================
// Collaborator seams
// ============================================================================

/// Authors task graphs. Lives outside the core; a job claimed before its
/// plan exists gets one through this seam.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, ctx: &ReplayContext) -> anyhow::Result<TaskGraph>;
}

/// What a tool call produced. `external_id` is the provider-side handle the
/// ledger stores for confirmation replay.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub result: serde_json::Value,
    pub external_id: Option<String>,
}

/// Executes tools. Implementations live outside the core.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call(&self, name: &str, args: &serde_json::Value) -> anyhow::Result<ToolCallResult>;

    /// Confirmation replay: given a started-but-unfinished ledger row, ask
    /// the external system whether the effect committed. `Some(result)`
    /// means it did; `None` means the outcome is not recoverable yet.
    async fn confirm(&self, record: &ToolInvocationRecord)
        -> anyhow::Result<Option<serde_json::Value>>;
}

// ============================================================================
// Node handlers
// ============================================================================

/// What a node run produced.
#[derive(Debug)]
pub enum NodeOutcome {
    /// The node finished; the payload is stored by node id and available to
    /// downstream nodes.
    Completed(serde_json::Value),
    /// The node needs an external signal. The executor writes `job_waiting`
    /// and the worker releases the lease.
    Wait(WaitRequest),
}

/// A request to park the job until a matching signal arrives.
#[derive(Debug, Clone)]
pub struct WaitRequest {
    pub wait_type: WaitKind,
    pub correlation_key: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A unit of domain logic attached to a node kind.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, step: &mut StepContext<'_>) -> Result<NodeOutcome, StepFailure>;

    /// Rollback hook invoked after a compensatable failure of this node.
    async fn compensate(&self, _step: &CompensationContext<'_>) -> Result<(), StepFailure> {
        Ok(())
    }
}

/// Maps node kinds to handlers. Registration is boot-time wiring, so a
/// duplicate kind is a programming error and panics.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            panic!("handler already registered for node kind: {kind}");
        }
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Step context
// ============================================================================

/// Everything a handler may touch while running one node.
pub struct StepContext<'a> {
    node: TaskNode,
    replay: &'a ReplayContext,
    writer: &'a EventWriter,
    effects: EffectRecorder<'a>,
    tools: &'a dyn ToolDispatcher,
    ledger: &'a dyn ToolInvocationLedger,
}

impl<'a> StepContext<'a> {
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.node.config
    }

    pub fn job_id(&self) -> Uuid {
        self.writer.job_id()
    }

    /// Successful payload of an upstream node.
    pub fn payload_of(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.replay.payload_results.get(node_id)
    }

    /// The payload delivered for a correlation key, if its wait completed.
    pub fn approved_signal(&self, correlation_key: &str) -> Option<&serde_json::Value> {
        self.replay.approved_correlation_keys.get(correlation_key)
    }

    /// Recorded time/UUID/random/HTTP effects for this step.
    pub fn effects(&mut self) -> &mut EffectRecorder<'a> {
        &mut self.effects
    }

    /// Build a wait request; sugar so handlers park consistently.
    pub fn wait(
        &self,
        wait_type: WaitKind,
        correlation_key: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> NodeOutcome {
        NodeOutcome::Wait(WaitRequest {
            wait_type,
            correlation_key: correlation_key.into(),
            expires_at,
        })
    }

    /// Two-phase command: `command_emitted` before the side effect,
    /// `command_committed` after. On replay a committed command id injects
    /// the stored result and the closure never runs.
    ///
    /// `command_id := step_id` (and `step_id := node_id` for single-command
    /// nodes); replay looks results up under exactly this rule.
    pub async fn command<F, Fut>(
        &self,
        kind: &str,
        input: serde_json::Value,
        run: F,
    ) -> Result<serde_json::Value, StepFailure>
    where
        F: FnOnce(serde_json::Value) -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send,
    {
        let command_id = self.node.id.clone();
        if self.replay.command_committed(&command_id) {
            debug!(command_id = %command_id, "command already committed, injecting result");
            return Ok(self.replay.command_results[&command_id].clone());
        }

        self.writer
            .append(
                EventType::CommandEmitted,
                &CommandEmitted {
                    node_id: self.node.id.clone(),
                    command_id: command_id.clone(),
                    kind: kind.to_string(),
                    input: input.clone(),
                },
            )
            .await
            .map_err(|e| StepFailure::retryable(&self.node.id, e.into()))?;

        let input_hash = sha256_json(&input);
        let result = run(input)
            .await
            .map_err(|e| StepFailure::unclassified(&self.node.id, e))?;

        self.writer
            .append(
                EventType::CommandCommitted,
                &CommandCommitted {
                    node_id: self.node.id.clone(),
                    command_id,
                    result: result.clone(),
                    input_hash,
                },
            )
            .await
            .map_err(|e| StepFailure::new(FailureKind::SideEffectCommitted, &self.node.id, e.into()))?;

        Ok(result)
    }

    /// Ledgered tool call. The idempotency key is deterministic across
    /// replays within a job; the ledger is the only authority on whether
    /// the side effect committed.
    pub async fn tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, StepFailure> {
        let node_id = self.node.id.clone();
        let args_hash = sha256_json(&args);
        let idempotency_key = tool_idempotency_key(self.job_id(), &node_id, name, &args_hash);

        // Already committed: inject.
        if let Some(result) = self.replay.completed_tool_invocations.get(&idempotency_key) {
            debug!(key = %idempotency_key, tool = name, "tool already committed, injecting result");
            return Ok(result.clone());
        }

        let attempt_id = self.writer.attempt_id().ok_or_else(|| {
            StepFailure::permanent(
                &node_id,
                anyhow::anyhow!("tool calls require a leased attempt"),
            )
        })?;

        // Started but never finished: confirmation replay.
        if self.replay.pending_tool_invocations.contains(&idempotency_key) {
            return self
                .confirm_pending(attempt_id, &node_id, name, &idempotency_key)
                .await;
        }

        // Fresh invocation.
        let invocation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let record = ToolInvocationRecord {
            job_id: self.job_id(),
            idempotency_key: idempotency_key.clone(),
            invocation_id,
            step_id: node_id.clone(),
            tool_name: name.to_string(),
            args_hash: args_hash.clone(),
            status: ToolInvocationStatus::Started,
            result: None,
            committed: false,
            external_id: None,
            started_at,
            finished_at: None,
        };
        self.ledger
            .begin(attempt_id, record)
            .await
            .map_err(|e| StepFailure::retryable(&node_id, e.into()))?;
        self.writer
            .append(
                EventType::ToolInvocationStarted,
                &ToolInvocationStarted {
                    invocation_id,
                    idempotency_key: idempotency_key.clone(),
                    step_id: node_id.clone(),
                    tool_name: name.to_string(),
                    args_hash,
                    started_at,
                },
            )
            .await
            .map_err(|e| StepFailure::retryable(&node_id, e.into()))?;

        match self.tools.call(name, &args).await {
            Ok(outcome) => {
                self.ledger
                    .commit(
                        attempt_id,
                        self.job_id(),
                        &idempotency_key,
                        ToolInvocationStatus::Succeeded,
                        Some(outcome.result.clone()),
                        outcome.external_id,
                    )
                    .await
                    .map_err(|e| {
                        StepFailure::new(FailureKind::SideEffectCommitted, &node_id, e.into())
                    })?;
                self.writer
                    .append(
                        EventType::ToolInvocationFinished,
                        &ToolInvocationFinished {
                            invocation_id,
                            idempotency_key,
                            outcome: ToolOutcome::Success,
                            result: Some(outcome.result.clone()),
                            error: None,
                            finished_at: Utc::now(),
                        },
                    )
                    .await
                    .map_err(|e| {
                        StepFailure::new(FailureKind::SideEffectCommitted, &node_id, e.into())
                    })?;
                Ok(outcome.result)
            }
            Err(error) => {
                let message = error.to_string();
                self.ledger
                    .commit(
                        attempt_id,
                        self.job_id(),
                        &idempotency_key,
                        ToolInvocationStatus::Failed,
                        None,
                        None,
                    )
                    .await
                    .map_err(|e| StepFailure::retryable(&node_id, e.into()))?;
                self.writer
                    .append(
                        EventType::ToolInvocationFinished,
                        &ToolInvocationFinished {
                            invocation_id,
                            idempotency_key,
                            outcome: ToolOutcome::Failure,
                            result: None,
                            error: Some(message),
                            finished_at: Utc::now(),
                        },
                    )
                    .await
                    .map_err(|e| StepFailure::retryable(&node_id, e.into()))?;
                Err(StepFailure::retryable(&node_id, error))
            }
        }
    }

    async fn confirm_pending(
        &self,
        attempt_id: Uuid,
        node_id: &str,
        name: &str,
        idempotency_key: &str,
    ) -> Result<serde_json::Value, StepFailure> {
        let record = self
            .ledger
            .find(self.job_id(), idempotency_key)
            .await
            .map_err(|e| StepFailure::retryable(node_id, e.into()))?
            .ok_or_else(|| {
                StepFailure::retryable(
                    node_id,
                    anyhow::anyhow!("pending invocation {idempotency_key} missing from ledger"),
                )
            })?;

        let confirmed = self
            .tools
            .confirm(&record)
            .await
            .map_err(|e| StepFailure::retryable(node_id, e))?;

        match confirmed {
            Some(result) => {
                warn!(key = %idempotency_key, tool = name, "recovered committed invocation via confirmation replay");
                self.ledger
                    .commit(
                        attempt_id,
                        self.job_id(),
                        idempotency_key,
                        ToolInvocationStatus::Succeeded,
                        Some(result.clone()),
                        record.external_id.clone(),
                    )
                    .await
                    .map_err(|e| StepFailure::retryable(node_id, e.into()))?;
                self.writer
                    .append(
                        EventType::ToolInvocationFinished,
                        &ToolInvocationFinished {
                            invocation_id: record.invocation_id,
                            idempotency_key: idempotency_key.to_string(),
                            outcome: ToolOutcome::Success,
                            result: Some(result.clone()),
                            error: None,
                            finished_at: Utc::now(),
                        },
                    )
                    .await
                    .map_err(|e| StepFailure::retryable(node_id, e.into()))?;
                Ok(result)
            }
            None => Err(StepFailure::retryable(
                node_id,
                anyhow::anyhow!("invocation {idempotency_key} pending and not yet confirmable"),
            )),
        }
    }

    /// Record a per-step working-state mutation (`state_changed`).
    pub async fn set_state(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StepFailure> {
        self.writer
            .append(
                EventType::StateChanged,
                &crate::payload::StateChanged {
                    step_id: self.node.id.clone(),
                    key: key.to_string(),
                    value,
                },
            )
            .await
            .map_err(|e| StepFailure::retryable(&self.node.id, e.into()))?;
        Ok(())
    }

    /// Append an `agent_thought_recorded` trace event.
    pub async fn record_thought(&self, text: &str) -> Result<(), StepFailure> {
        self.writer
            .append_value(
                EventType::AgentThoughtRecorded,
                serde_json::json!({"node_id": &self.node.id, "text": text}),
            )
            .await
            .map_err(|e| StepFailure::retryable(&self.node.id, e.into()))?;
        Ok(())
    }

    /// Append a `decision_made` trace event.
    pub async fn record_decision(
        &self,
        decision: &str,
        rationale: &str,
    ) -> Result<(), StepFailure> {
        self.writer
            .append_value(
                EventType::DecisionMade,
                serde_json::json!({
                    "node_id": &self.node.id,
                    "decision": decision,
                    "rationale": rationale,
                }),
            )
            .await
            .map_err(|e| StepFailure::retryable(&self.node.id, e.into()))?;
        Ok(())
    }
}

/// Read-only view handed to `compensate`.
pub struct CompensationContext<'a> {
    pub node: &'a TaskNode,
    pub payload_results: &'a std::collections::BTreeMap<String, serde_json::Value>,
    pub writer: &'a EventWriter,
}

// ============================================================================
// Executor
// ============================================================================

/// How a drive over the graph ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Waiting {
        node_id: String,
        correlation_key: String,
    },
    Cancelled,
    Failed(StepFailure),
}

/// Drives the task graph for one claimed job.
pub struct Executor {
    handlers: Arc<HandlerRegistry>,
    tools: Arc<dyn ToolDispatcher>,
    ledger: Arc<dyn ToolInvocationLedger>,
    planner: Option<Arc<dyn Planner>>,
    http: Option<Arc<dyn HttpClient>>,
}

impl Executor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        tools: Arc<dyn ToolDispatcher>,
        ledger: Arc<dyn ToolInvocationLedger>,
    ) -> Self {
        Self {
            handlers,
            tools,
            ledger,
            planner: None,
            http: None,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Run the job forward until it completes, parks, fails, or is
    /// cancelled. `ctx` must reflect the stream `writer` is positioned at.
    pub async fn drive(
        &self,
        goal: &str,
        ctx: &mut ReplayContext,
        writer: &EventWriter,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, StoreError> {
        if ctx.task_graph.is_none() {
            match self.generate_plan(goal, ctx, writer).await? {
                Some(graph) => {
                    ctx.plan_hash = Some(graph.plan_hash());
                    ctx.task_graph = Some(graph);
                }
                None => {
                    let failure = StepFailure::permanent(
                        "plan",
                        anyhow::anyhow!("no plan in history and no planner configured"),
                    );
                    return Ok(RunOutcome::Failed(failure));
                }
            }
        }
        let graph = ctx
            .task_graph
            .clone()
            .unwrap_or_default();
        if let Err(e) = graph.validate() {
            return Ok(RunOutcome::Failed(StepFailure::permanent(
                "plan",
                anyhow::anyhow!(e),
            )));
        }

        let recorded = RecordedEffects::from_context(ctx);

        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let Some(node) = graph.next_ready(&ctx.completed_node_ids).cloned() else {
                if graph.is_complete(&ctx.completed_node_ids) || graph.is_empty() {
                    writer
                        .append(EventType::JobCompleted, &JobCompleted::default())
                        .await?;
                    return Ok(RunOutcome::Completed);
                }
                // validate() rejects cycles, so this is unreachable in
                // practice; fail deterministically anyway.
                return Ok(RunOutcome::Failed(StepFailure::permanent(
                    "plan",
                    anyhow::anyhow!("no runnable node but plan incomplete"),
                )));
            };

            writer
                .append(
                    EventType::NodeStarted,
                    &NodeStarted {
                        node_id: node.id.clone(),
                    },
                )
                .await?;

            let Some(handler) = self.handlers.get(&node.kind) else {
                let failure = StepFailure::permanent(
                    &node.id,
                    anyhow::anyhow!("no handler registered for node kind: {}", node.kind),
                );
                self.finish_node(writer, &node.id, NodeResultType::Failure, None, Some(&failure))
                    .await?;
                return Ok(RunOutcome::Failed(failure));
            };

            let outcome = {
                let mut step = StepContext {
                    node: node.clone(),
                    replay: &*ctx,
                    writer,
                    effects: EffectRecorder::new(
                        node.id.clone(),
                        &recorded,
                        writer,
                        self.http.as_deref(),
                    ),
                    tools: self.tools.as_ref(),
                    ledger: self.ledger.as_ref(),
                };
                handler.run(&mut step).await
            };

            match outcome {
                Ok(NodeOutcome::Completed(payload)) => {
                    self.finish_node(
                        writer,
                        &node.id,
                        NodeResultType::Success,
                        Some(payload.clone()),
                        None,
                    )
                    .await?;
                    ctx.completed_node_ids.insert(node.id.clone());
                    ctx.payload_results.insert(node.id.clone(), payload);
                    ctx.cursor_node = Some(node.id.clone());
                }
                Ok(NodeOutcome::Wait(request)) => {
                    let resumption_context = serde_json::json!({
                        "payload_results": &ctx.payload_results,
                        "decision_node": &ctx.cursor_node,
                    });
                    writer
                        .append(
                            EventType::JobWaiting,
                            &JobWaiting {
                                node_id: node.id.clone(),
                                wait_type: request.wait_type,
                                correlation_key: request.correlation_key.clone(),
                                expires_at: request.expires_at,
                                resumption_context,
                            },
                        )
                        .await?;
                    return Ok(RunOutcome::Waiting {
                        node_id: node.id,
                        correlation_key: request.correlation_key,
                    });
                }
                Err(failure) => {
                    // A failure observed after the token flipped is part of
                    // the cancellation, not a reason to retry: the worker
                    // must still honor the cancel.
                    if cancel.is_cancelled() {
                        self.finish_node(
                            writer,
                            &node.id,
                            NodeResultType::Cancelled,
                            None,
                            Some(&failure),
                        )
                        .await?;
                        return Ok(RunOutcome::Cancelled);
                    }
                    self.finish_node(writer, &node.id, NodeResultType::Failure, None, Some(&failure))
                        .await?;
                    return Ok(RunOutcome::Failed(failure));
                }
            }
        }
    }

    /// Run the compensate hook for a failed node and record it.
    pub async fn compensate(
        &self,
        node_id: &str,
        ctx: &ReplayContext,
        writer: &EventWriter,
    ) -> Result<(), StoreError> {
        writer
            .append_value(
                EventType::RecoveryStarted,
                serde_json::json!({"node_id": node_id}),
            )
            .await?;

        let node = ctx
            .task_graph
            .as_ref()
            .and_then(|g| g.node(node_id))
            .cloned();
        if let Some(node) = node {
            if let Some(handler) = self.handlers.get(&node.kind) {
                let comp = CompensationContext {
                    node: &node,
                    payload_results: &ctx.payload_results,
                    writer,
                };
                if let Err(e) = handler.compensate(&comp).await {
                    warn!(node_id, error = %e, "compensation hook failed");
                }
            }
        }

        writer
            .append(
                EventType::StepCompensated,
                &StepCompensated {
                    node_id: node_id.to_string(),
                    detail: None,
                },
            )
            .await?;
        writer
            .append_value(
                EventType::RecoveryCompleted,
                serde_json::json!({"node_id": node_id}),
            )
            .await?;
        Ok(())
    }

    async fn generate_plan(
        &self,
        goal: &str,
        ctx: &ReplayContext,
        writer: &EventWriter,
    ) -> Result<Option<TaskGraph>, StoreError> {
        let Some(planner) = &self.planner else {
            return Ok(None);
        };
        let graph = planner
            .plan(goal, ctx)
            .await
            .map_err(StoreError::Backend)?;
        let plan_hash = graph.plan_hash();
        writer
            .append(
                EventType::PlanGenerated,
                &PlanGenerated {
                    plan: graph.clone(),
                    plan_hash,
                },
            )
            .await?;
        Ok(Some(graph))
    }

    async fn finish_node(
        &self,
        writer: &EventWriter,
        node_id: &str,
        result_type: NodeResultType,
        payload: Option<serde_json::Value>,
        failure: Option<&StepFailure>,
    ) -> Result<(), StoreError> {
        writer
            .append(
                EventType::NodeFinished,
                &NodeFinished {
                    node_id: node_id.to_string(),
                    result_type,
                    payload,
                    error: failure.map(|f| f.inner.to_string()),
                },
            )
            .await?;
        Ok(())
    }
}

/// `H(job_id, step_id, tool_name, args_hash)`: deterministic across replays
/// within a job. The attempt id is excluded so retries on a new worker reuse
/// the ledger row instead of double-firing the tool.
pub fn tool_idempotency_key(job_id: Uuid, step_id: &str, tool_name: &str, args_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(step_id.as_bytes());
    hasher.update(b"|");
    hasher.update(tool_name.as_bytes());
    hasher.update(b"|");
    hasher.update(args_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase hex SHA-256 of a JSON value's canonical bytes.
pub fn sha256_json(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
