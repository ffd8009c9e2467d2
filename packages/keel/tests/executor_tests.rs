//! End-to-end executor runs against the in-memory backend: claim, replay,
//! drive, crash, resume. These are the behaviors a worker composes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel::{
    create_job, deliver_signal, derive_status, execution_hash, memory::MemoryBackend, sha256_json,
    tool_idempotency_key, AppendContext, Claim, EventStore, EventType, EventWriter, Executor,
    FailureKind, HandlerRegistry, JobStatus, MetadataStore, NewJob, NodeHandler,
    NodeOutcome, Planner, ReplayContext, RunOutcome, StepContext, StepFailure, TaskGraph,
    TaskNode, ToolCallResult, ToolDispatcher, ToolInvocationLedger, ToolInvocationRecord,
    ToolInvocationStatus, WaitKind,
};

// ============================================================================
// Test fixtures
// ============================================================================

struct FixedPlanner(TaskGraph);

#[async_trait]
impl Planner for FixedPlanner {
    async fn plan(&self, _goal: &str, _ctx: &ReplayContext) -> anyhow::Result<TaskGraph> {
        Ok(self.0.clone())
    }
}

/// Tool dispatcher that counts calls and can confirm a committed charge.
#[derive(Default)]
struct CountingTools {
    calls: AtomicU32,
    confirmable: std::sync::Mutex<Option<serde_json::Value>>,
}

#[async_trait]
impl ToolDispatcher for CountingTools {
    async fn call(&self, _name: &str, args: &serde_json::Value) -> anyhow::Result<ToolCallResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolCallResult {
            result: serde_json::json!({"charged": args["amount"]}),
            external_id: Some("ext-123".to_string()),
        })
    }

    async fn confirm(
        &self,
        _record: &ToolInvocationRecord,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.confirmable.lock().unwrap().clone())
    }
}

/// Answers through a two-phase command, counting live executions.
struct AnswerHandler {
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl NodeHandler for AnswerHandler {
    async fn run(&self, step: &mut StepContext<'_>) -> Result<NodeOutcome, StepFailure> {
        let executions = self.executions.clone();
        let result = step
            .command("answer", serde_json::json!({"q": "g1"}), |_input| async move {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"answer": "ok"}))
            })
            .await?;
        Ok(NodeOutcome::Completed(result))
    }
}

/// Fails retryably until the fuse burns out.
struct FlakyHandler {
    remaining_failures: Arc<AtomicU32>,
}

#[async_trait]
impl NodeHandler for FlakyHandler {
    async fn run(&self, _step: &mut StepContext<'_>) -> Result<NodeOutcome, StepFailure> {
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StepFailure::retryable(
                "flaky",
                anyhow::anyhow!("transient upstream error"),
            ));
        }
        Ok(NodeOutcome::Completed(serde_json::json!({"ok": true})))
    }
}

struct ChargeHandler;

#[async_trait]
impl NodeHandler for ChargeHandler {
    async fn run(&self, step: &mut StepContext<'_>) -> Result<NodeOutcome, StepFailure> {
        let result = step
            .tool("charge_card", serde_json::json!({"amount": 100}))
            .await?;
        Ok(NodeOutcome::Completed(result))
    }
}

struct ApprovalHandler;

#[async_trait]
impl NodeHandler for ApprovalHandler {
    async fn run(&self, step: &mut StepContext<'_>) -> Result<NodeOutcome, StepFailure> {
        let key = format!("approval:{}", step.node_id());
        match step.approved_signal(&key) {
            Some(payload) => Ok(NodeOutcome::Completed(payload.clone())),
            None => Ok(step.wait(WaitKind::Human, key, None)),
        }
    }
}

async fn claimed_writer(backend: &Arc<MemoryBackend>, worker: &str, job_id: Uuid) -> (Claim, EventWriter) {
    let claim = backend.claim_job(worker, job_id).await.unwrap();
    let writer = EventWriter::new(
        backend.clone() as Arc<dyn EventStore>,
        job_id,
        AppendContext::fenced(claim.attempt_id),
        claim.version,
    );
    (claim, writer)
}

async fn replay(backend: &MemoryBackend, job_id: Uuid) -> ReplayContext {
    let (events, _) = backend.list_events(job_id).await.unwrap();
    ReplayContext::from_events(&events).unwrap()
}

fn executor_with(
    handlers: HandlerRegistry,
    tools: Arc<CountingTools>,
    backend: Arc<MemoryBackend>,
    plan: TaskGraph,
) -> Executor {
    Executor::new(
        Arc::new(handlers),
        tools,
        backend as Arc<dyn ToolInvocationLedger>,
    )
    .with_planner(Arc::new(FixedPlanner(plan)))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn create_run_complete_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    let executions = Arc::new(AtomicU32::new(0));

    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "answer",
        Arc::new(AnswerHandler {
            executions: executions.clone(),
        }),
    );
    let plan = TaskGraph::new(vec![TaskNode::new("n1", "answer")]);
    let executor = executor_with(handlers, Arc::new(CountingTools::default()), backend.clone(), plan);

    let (_claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    writer
        .append_value(EventType::JobRunning, serde_json::json!({"worker_id": "w1"}))
        .await
        .unwrap();

    let mut ctx = replay(backend.as_ref(), job_id).await;
    let outcome = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let (events, _) = backend.list_events(job_id).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "job_created",
            "job_running",
            "plan_generated",
            "node_started",
            "command_emitted",
            "command_committed",
            "node_finished",
            "job_completed",
        ]
    );
    assert_eq!(derive_status(&events, Utc::now()), JobStatus::Completed);
    keel::verify_chain(&events).unwrap();

    // The execution hash is stable across two computations.
    assert_eq!(execution_hash(&events), execution_hash(&events));
}

#[tokio::test]
async fn resume_after_failure_skips_committed_commands() {
    let backend = Arc::new(MemoryBackend::new());
    let executions = Arc::new(AtomicU32::new(0));
    let failures = Arc::new(AtomicU32::new(1));

    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let plan = TaskGraph::new(vec![
        TaskNode::new("pay", "answer"),
        TaskNode::new("flaky", "flaky").depends_on(["pay"]),
    ]);
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "answer",
        Arc::new(AnswerHandler {
            executions: executions.clone(),
        }),
    );
    handlers.register(
        "flaky",
        Arc::new(FlakyHandler {
            remaining_failures: failures.clone(),
        }),
    );
    let executor = executor_with(
        handlers,
        Arc::new(CountingTools::default()),
        backend.clone(),
        plan,
    );

    // First attempt: the command commits, then the flaky node fails.
    let (_claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let first = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    match first {
        RunOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::Retryable),
        other => panic!("expected failure, got {other:?}"),
    }
    backend.release_claim("w1", job_id).await.unwrap();

    // Second attempt on another worker: replay injects the committed
    // command; only the flaky node re-runs.
    let (_claim, writer) = claimed_writer(&backend, "w2", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let second = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(second, RunOutcome::Completed));
    assert_eq!(executions.load(Ordering::SeqCst), 1, "command must run once");

    let (events, _) = backend.list_events(job_id).await.unwrap();
    let committed = events
        .iter()
        .filter(|e| e.event_type == EventType::CommandCommitted)
        .count();
    assert_eq!(committed, 1);
}

#[tokio::test]
async fn pending_tool_invocation_recovers_via_confirmation_replay() {
    let backend = Arc::new(MemoryBackend::new());
    let tools = Arc::new(CountingTools::default());

    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    // First worker wrote tool_invocation_started, then died before the
    // finish. Reconstruct exactly that state.
    let (claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let args = serde_json::json!({"amount": 100});
    let args_hash = sha256_json(&args);
    let key = tool_idempotency_key(job_id, "pay", "charge_card", &args_hash);
    let invocation_id = Uuid::new_v4();
    backend
        .begin(
            claim.attempt_id,
            ToolInvocationRecord {
                job_id,
                idempotency_key: key.clone(),
                invocation_id,
                step_id: "pay".to_string(),
                tool_name: "charge_card".to_string(),
                args_hash: args_hash.clone(),
                status: ToolInvocationStatus::Started,
                result: None,
                committed: false,
                external_id: Some("ext-123".to_string()),
                started_at: Utc::now(),
                finished_at: None,
            },
        )
        .await
        .unwrap();
    writer
        .append_value(
            EventType::ToolInvocationStarted,
            serde_json::json!({
                "invocation_id": invocation_id,
                "idempotency_key": key,
                "step_id": "pay",
                "tool_name": "charge_card",
                "args_hash": args_hash,
                "started_at": Utc::now(),
            }),
        )
        .await
        .unwrap();
    backend.expire_lease(job_id).await;

    // The external system did commit the charge.
    *tools.confirmable.lock().unwrap() = Some(serde_json::json!({"charged": 100}));

    let plan = TaskGraph::new(vec![TaskNode::new("pay", "charge")]);
    let mut handlers = HandlerRegistry::new();
    handlers.register("charge", Arc::new(ChargeHandler));
    let executor = executor_with(handlers, tools.clone(), backend.clone(), plan);

    let (_claim, writer) = claimed_writer(&backend, "w2", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    assert!(ctx.pending_tool_invocations.contains(&key));

    let outcome = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed));

    // The tool itself was never re-called: one charge total.
    assert_eq!(tools.calls.load(Ordering::SeqCst), 0);

    let (events, _) = backend.list_events(job_id).await.unwrap();
    let finished: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::ToolInvocationFinished)
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].payload["outcome"], "success");

    let record = ToolInvocationLedger::find(backend.as_ref(), job_id, &key)
        .await
        .unwrap()
        .unwrap();
    assert!(record.committed);
    assert_eq!(record.status, ToolInvocationStatus::Succeeded);
}

#[tokio::test]
async fn unconfirmable_pending_invocation_is_retryable() {
    let backend = Arc::new(MemoryBackend::new());
    let tools = Arc::new(CountingTools::default());

    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let (claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let args = serde_json::json!({"amount": 100});
    let args_hash = sha256_json(&args);
    let key = tool_idempotency_key(job_id, "pay", "charge_card", &args_hash);
    backend
        .begin(
            claim.attempt_id,
            ToolInvocationRecord {
                job_id,
                idempotency_key: key.clone(),
                invocation_id: Uuid::new_v4(),
                step_id: "pay".to_string(),
                tool_name: "charge_card".to_string(),
                args_hash: args_hash.clone(),
                status: ToolInvocationStatus::Started,
                result: None,
                committed: false,
                external_id: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        )
        .await
        .unwrap();
    writer
        .append_value(
            EventType::ToolInvocationStarted,
            serde_json::json!({
                "invocation_id": Uuid::new_v4(),
                "idempotency_key": key,
                "step_id": "pay",
                "tool_name": "charge_card",
                "args_hash": args_hash,
                "started_at": Utc::now(),
            }),
        )
        .await
        .unwrap();
    backend.expire_lease(job_id).await;

    let plan = TaskGraph::new(vec![TaskNode::new("pay", "charge")]);
    let mut handlers = HandlerRegistry::new();
    handlers.register("charge", Arc::new(ChargeHandler));
    let executor = executor_with(handlers, tools.clone(), backend.clone(), plan);

    let (_claim, writer) = claimed_writer(&backend, "w2", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let outcome = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        RunOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::Retryable),
        other => panic!("expected retryable failure, got {other:?}"),
    }
    assert_eq!(tools.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wait_then_signal_then_resume() {
    let backend = Arc::new(MemoryBackend::new());

    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let plan = TaskGraph::new(vec![
        TaskNode::new("approve", "approval"),
        TaskNode::new("after", "answer").depends_on(["approve"]),
    ]);
    let executions = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register("approval", Arc::new(ApprovalHandler));
    handlers.register(
        "answer",
        Arc::new(AnswerHandler {
            executions: executions.clone(),
        }),
    );
    let executor = executor_with(
        handlers,
        Arc::new(CountingTools::default()),
        backend.clone(),
        plan,
    );

    // First drive parks on the approval node.
    let (_claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let first = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    let correlation_key = match first {
        RunOutcome::Waiting {
            correlation_key, ..
        } => correlation_key,
        other => panic!("expected waiting, got {other:?}"),
    };
    assert_eq!(correlation_key, "approval:approve");
    backend.release_claim("w1", job_id).await.unwrap();
    backend
        .set_status(job_id, JobStatus::Waiting)
        .await
        .unwrap();

    let (events, _) = backend.list_events(job_id).await.unwrap();
    assert_eq!(derive_status(&events, Utc::now()), JobStatus::Waiting);

    // External approval arrives.
    deliver_signal(
        backend.as_ref(),
        backend.as_ref(),
        backend.as_ref(),
        job_id,
        &correlation_key,
        serde_json::json!({"approved": true}),
    )
    .await
    .unwrap();

    // Resume: the approval node completes with the signal payload and the
    // rest of the plan runs.
    let (_claim, writer) = claimed_writer(&backend, "w2", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let second = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(second, RunOutcome::Completed));

    let (events, _) = backend.list_events(job_id).await.unwrap();
    assert_eq!(derive_status(&events, Utc::now()), JobStatus::Completed);
    let approve_finish = events
        .iter()
        .find(|e| {
            e.event_type == EventType::NodeFinished && e.payload["node_id"] == "approve"
        })
        .unwrap();
    assert_eq!(approve_finish.payload["payload"]["approved"], true);
}

#[tokio::test]
async fn cancellation_stops_between_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let plan = TaskGraph::new(vec![TaskNode::new("n1", "answer")]);
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "answer",
        Arc::new(AnswerHandler {
            executions: Arc::new(AtomicU32::new(0)),
        }),
    );
    let executor = executor_with(
        handlers,
        Arc::new(CountingTools::default()),
        backend.clone(),
        plan,
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (_claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let outcome = executor
        .drive("g1", &mut ctx, &writer, &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));

    // No node ever started.
    let (events, _) = backend.list_events(job_id).await.unwrap();
    assert!(!events
        .iter()
        .any(|e| e.event_type == EventType::NodeStarted));
}

#[tokio::test]
async fn failure_after_cancel_is_reported_as_cancelled() {
    // A handler whose failure races the cancel token: the run must honor
    // the cancel, not surface a retryable failure that would requeue a
    // stopped job.
    struct CancelRacingHandler {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl NodeHandler for CancelRacingHandler {
        async fn run(&self, step: &mut StepContext<'_>) -> Result<NodeOutcome, StepFailure> {
            self.cancel.cancel();
            Err(StepFailure::retryable(
                step.node_id(),
                anyhow::anyhow!("upstream went away mid-cancel"),
            ))
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let cancel = CancellationToken::new();
    let plan = TaskGraph::new(vec![TaskNode::new("n1", "racing")]);
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "racing",
        Arc::new(CancelRacingHandler {
            cancel: cancel.clone(),
        }),
    );
    let executor = executor_with(
        handlers,
        Arc::new(CountingTools::default()),
        backend.clone(),
        plan,
    );

    let (_claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let outcome = executor
        .drive("g1", &mut ctx, &writer, &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));

    let (events, _) = backend.list_events(job_id).await.unwrap();
    let finish = events
        .iter()
        .find(|e| e.event_type == EventType::NodeFinished)
        .unwrap();
    assert_eq!(finish.payload["result_type"], "cancelled");
}

#[tokio::test]
async fn missing_handler_fails_permanently() {
    let backend = Arc::new(MemoryBackend::new());
    let outcome = create_job(backend.as_ref(), backend.as_ref(), NewJob::new("a1", "g1"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    let plan = TaskGraph::new(vec![TaskNode::new("n1", "nonexistent")]);
    let executor = executor_with(
        HandlerRegistry::new(),
        Arc::new(CountingTools::default()),
        backend.clone(),
        plan,
    );

    let (_claim, writer) = claimed_writer(&backend, "w1", job_id).await;
    let mut ctx = replay(backend.as_ref(), job_id).await;
    let outcome = executor
        .drive("g1", &mut ctx, &writer, &CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        RunOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::Permanent),
        other => panic!("expected permanent failure, got {other:?}"),
    }
}
