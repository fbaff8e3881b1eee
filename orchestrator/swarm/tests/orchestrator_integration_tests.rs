// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for the run orchestrator: the full loop of budget
//! grants, step delegation, failure classification and recovery, circuit
//! breaking, cancellation racing completion, and checkpoint/resume.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use hive_core::domain::circuit_breaker::CircuitState;
use hive_core::domain::classification::{FailureKind, StepFailure};
use hive_core::domain::config::EngineConfig;
use hive_core::domain::context::{AllocationPolicy, SwarmId};
use hive_core::domain::events::RunLifecycleEvent;
use hive_core::domain::resources::{AllocationPriority, ResourceQuantity, ResourceUsage};
use hive_core::domain::run::{RunState, StepState};
use hive_core::infrastructure::event_bus::{EngineEvent, EventBus};
use hive_core::infrastructure::kv::KeyValueStore;
use hive_core::infrastructure::memory_kv::InMemoryKeyValueStore;
use hive_swarm::application::context_store::SwarmContextManager;
use hive_swarm::application::orchestrator::{
    RunDefinition, RunOrchestrator, StepAttempt, StepDefinition, StepExecutor, StepOutcome,
};
use hive_swarm::application::run_context::RunContextManager;
use hive_swarm::domain::allocation_view::{
    RunResourceRequest, StepAllocation, StepResourceRequest,
};
use hive_swarm::domain::snapshot::RunContextSnapshot;

// ── Test executors ───────────────────────────────────────────────────────

/// Replays a per-step script of results, then succeeds by default.
struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<Result<StepOutcome, StepFailure>>>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, step: &str, result: Result<StepOutcome, StepFailure>) {
        self.script
            .lock()
            .entry(step.to_string())
            .or_default()
            .push_back(result);
    }
}

fn ok_outcome(credits_used: u128) -> StepOutcome {
    StepOutcome {
        output: serde_json::json!({"ok": true}),
        usage: ResourceUsage {
            credits_used,
            elapsed_ms: 5,
            memory_peak_mb: 16,
        },
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        _allocation: &StepAllocation,
        _context: &RunContextSnapshot,
        _attempt: &StepAttempt,
    ) -> Result<StepOutcome, StepFailure> {
        let scripted = self
            .script
            .lock()
            .get_mut(&step.name)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(ok_outcome(10)))
    }
}

/// Sleeps before succeeding; used to race cancellation.
struct SlowExecutor {
    delay: Duration,
}

#[async_trait]
impl StepExecutor for SlowExecutor {
    async fn execute(
        &self,
        _step: &StepDefinition,
        _allocation: &StepAllocation,
        _context: &RunContextSnapshot,
        _attempt: &StepAttempt,
    ) -> Result<StepOutcome, StepFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(ok_outcome(10))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    contexts: Arc<SwarmContextManager>,
    orchestrator: Arc<RunOrchestrator>,
    bus: Arc<EventBus>,
    swarm_id: SwarmId,
}

async fn harness_with(
    executor: Arc<dyn StepExecutor>,
    config: EngineConfig,
    pool_credits: u128,
) -> Harness {
    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::default());
    let bus = Arc::new(EventBus::new(256));
    let contexts = Arc::new(SwarmContextManager::new(kv.clone(), bus.clone(), &config));
    let run_contexts = Arc::new(RunContextManager::new(contexts.clone(), kv.clone(), &config));
    let orchestrator = Arc::new(RunOrchestrator::new(
        contexts.clone(),
        run_contexts,
        executor,
        bus.clone(),
        kv,
        &config,
    ));
    let swarm_id = SwarmId::new();
    contexts
        .create_swarm(
            swarm_id,
            ResourceQuantity::new(pool_credits, 3_600_000, 8192, 64),
            AllocationPolicy::default(),
        )
        .await
        .unwrap();
    Harness {
        contexts,
        orchestrator,
        bus,
        swarm_id,
    }
}

fn step(name: &str, credits: u128) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        component: "step-runner".to_string(),
        request: StepResourceRequest {
            credits,
            duration_ms: 5_000,
            memory_mb: 64,
            concurrency_slots: 1,
            purpose: format!("step {name}"),
        },
        max_attempts: 3,
        input: serde_json::Value::Null,
    }
}

fn definition(steps: Vec<StepDefinition>) -> RunDefinition {
    RunDefinition {
        name: "integration-run".to_string(),
        steps,
        inputs: serde_json::json!({"goal": "test"}),
    }
}

fn run_request(credits: u128) -> RunResourceRequest {
    RunResourceRequest {
        credits,
        duration_ms: 60_000,
        memory_mb: 512,
        concurrency_slots: 4,
        purpose: "integration run".to_string(),
        priority: AllocationPriority::Normal,
    }
}

// ── Happy path ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_completes_and_settles_budget() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push("gather", Ok(ok_outcome(100)));
    executor.push("summarize", Ok(ok_outcome(50)));
    let h = harness_with(executor, EngineConfig::default(), 5000).await;
    let mut events = h.bus.subscribe();

    let record = h
        .orchestrator
        .execute_run(
            h.swarm_id,
            definition(vec![step("gather", 200), step("summarize", 100)]),
            run_request(1000),
        )
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.step_executions.len(), 2);
    assert!(record
        .step_executions
        .iter()
        .all(|s| s.state == StepState::Completed));
    assert_eq!(record.total_usage().credits_used, 150);

    // 150 consumed credits retired from the pool, the rest returned.
    let context = h.contexts.get_context(h.swarm_id).await.unwrap();
    assert!(context.allocations.is_empty());
    assert_eq!(context.total.credits, 4850);
    assert_eq!(context.available.credits, 4850);
    assert!(context.validate().is_valid);

    // Lifecycle events in order: allocation, start, ..., release, completion.
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind().to_string());
    }
    assert!(kinds.contains(&"RESOURCE.ALLOCATED".to_string()));
    assert!(kinds.contains(&"RUN.STARTED".to_string()));
    assert!(kinds.contains(&"RESOURCE.RELEASED".to_string()));
    assert!(kinds.contains(&"RUN.COMPLETED".to_string()));
}

#[tokio::test]
async fn test_run_outputs_carry_step_results() {
    let executor = Arc::new(ScriptedExecutor::new());
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    let record = h
        .orchestrator
        .execute_run(
            h.swarm_id,
            definition(vec![step("only", 10)]),
            run_request(100),
        )
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Completed);
    let outputs = record.context.outputs.as_object().unwrap();
    assert!(outputs.contains_key("only"));
    assert_eq!(record.current_location.as_deref(), Some("only"));
}

// ── Recovery paths ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push(
        "flaky",
        Err(StepFailure::new("upstream timed out").with_kind(FailureKind::Timeout)),
    );
    executor.push("flaky", Ok(ok_outcome(40)));
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    let record = h
        .orchestrator
        .execute_run(
            h.swarm_id,
            definition(vec![step("flaky", 100)]),
            run_request(1000),
        )
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.step_executions.len(), 1);
    assert_eq!(record.step_executions[0].attempts, 2);

    // One failure then success: the breaker stays closed.
    let snapshot = h.orchestrator.breakers().snapshot("step-runner").unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_security_failure_emergency_stops_the_run() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push(
        "leaky",
        Err(StepFailure::new("permission denied reading credential store")
            .with_kind(FailureKind::AccessDenied)),
    );
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    let record = h
        .orchestrator
        .execute_run(
            h.swarm_id,
            definition(vec![step("leaky", 100)]),
            run_request(1000),
        )
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Cancelled);
    // Emergency stop released the run's budget.
    let context = h.contexts.get_context(h.swarm_id).await.unwrap();
    assert!(context.allocations.is_empty());
    assert!(context.validate().is_valid);
}

#[tokio::test]
async fn test_budget_exhaustion_pauses_for_human() {
    let executor = Arc::new(ScriptedExecutor::new());
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    // The run holds 100 credits; the single-attempt step wants 1000.
    let mut greedy = step("greedy", 1000);
    greedy.max_attempts = 1;
    let record = h
        .orchestrator
        .execute_run(h.swarm_id, definition(vec![greedy]), run_request(100))
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Paused);
    // Paused runs keep their allocation while awaiting intervention.
    let context = h.contexts.get_context(h.swarm_id).await.unwrap();
    assert_eq!(context.allocations.len(), 1);
}

#[tokio::test]
async fn test_circuit_opens_and_run_escalates() {
    let mut config = EngineConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.reset_timeout = Duration::from_secs(60);

    let executor = Arc::new(ScriptedExecutor::new());
    for _ in 0..5 {
        executor.push(
            "doomed",
            Err(StepFailure::new("connection reset").with_kind(FailureKind::ConnectionLost)),
        );
    }
    let mut doomed = step("doomed", 10);
    doomed.max_attempts = 10;
    let h = harness_with(executor, config, 5000).await;

    let record = h
        .orchestrator
        .execute_run(h.swarm_id, definition(vec![doomed]), run_request(1000))
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Failed);
    let snapshot = h.orchestrator.breakers().snapshot("step-runner").unwrap();
    assert_eq!(snapshot.state, CircuitState::Open);
    // A failed run returns its budget.
    let context = h.contexts.get_context(h.swarm_id).await.unwrap();
    assert!(context.allocations.is_empty());
}

// ── Cancellation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_races_running_run_cleanly() {
    let executor = Arc::new(SlowExecutor {
        delay: Duration::from_millis(300),
    });
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    // Subscribe before the driver starts so RUN.STARTED cannot slip past.
    let mut events = h.bus.subscribe();
    let orchestrator = h.orchestrator.clone();
    let swarm_id = h.swarm_id;
    let driver = tokio::spawn(async move {
        orchestrator
            .execute_run(
                swarm_id,
                definition(vec![step("slow-1", 10), step("slow-2", 10)]),
                run_request(1000),
            )
            .await
    });

    // Wait for the run to appear, then cancel while step 1 sleeps.
    let run_id = loop {
        if let EngineEvent::Run(RunLifecycleEvent::RunStarted { run_id, .. }) =
            events.recv().await.unwrap()
        {
            break run_id;
        }
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = h.orchestrator.cancel_run(run_id, Some("operator".to_string())).await.unwrap();
    assert_eq!(state, RunState::Cancelled);

    // Cancelling again is idempotent and observes the terminal state.
    let again = h.orchestrator.cancel_run(run_id, None).await.unwrap();
    assert_eq!(again, RunState::Cancelled);

    let record = driver.await.unwrap().unwrap();
    assert_eq!(record.state, RunState::Cancelled);

    // The pool holds nothing for the cancelled run.
    let context = h.contexts.get_context(h.swarm_id).await.unwrap();
    assert!(context.allocations.is_empty());
    assert!(context.validate().is_valid);
}

// ── Pause, checkpoint, resume ────────────────────────────────────────────

#[tokio::test]
async fn test_pause_checkpoint_resume_completes() {
    let executor = Arc::new(ScriptedExecutor::new());
    // Step 2 needs a human once, then succeeds after resume.
    executor.push(
        "review",
        Err(StepFailure::new("misconfigured approver")
            .with_kind(FailureKind::InvalidConfiguration)),
    );
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    let record = h
        .orchestrator
        .execute_run(
            h.swarm_id,
            definition(vec![step("draft", 50), step("review", 50)]),
            run_request(1000),
        )
        .await
        .unwrap();
    assert_eq!(record.state, RunState::Paused);
    assert_eq!(record.step_executions.len(), 1);
    let run_id = record.run_id;

    // Checkpoint the paused run; the index and record both carry it.
    let checkpoint_id = h.orchestrator.checkpoint_run(run_id).await.unwrap();
    let record = h.orchestrator.get_run(run_id).await.unwrap();
    assert_eq!(record.checkpoints.len(), 1);
    assert_eq!(record.checkpoints[0].checkpoint_id, checkpoint_id);

    // Resume finishes the remaining step.
    let record = h.orchestrator.resume_run(run_id).await.unwrap();
    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.step_executions.len(), 2);
    assert_eq!(record.step_executions[1].name, "review");

    // History reflects every committed transition.
    let history = h.orchestrator.run_history(run_id).await.unwrap();
    let states: Vec<String> = history
        .iter()
        .map(|entry| entry["state"].as_str().unwrap().to_string())
        .collect();
    assert!(states.contains(&"running".to_string()));
    assert!(states.contains(&"paused".to_string()));
    assert_eq!(states.last().unwrap(), "completed");
}

#[tokio::test]
async fn test_restore_rewinds_to_checkpoint() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push(
        "review",
        Err(StepFailure::new("misconfigured approver")
            .with_kind(FailureKind::InvalidConfiguration)),
    );
    let h = harness_with(executor, EngineConfig::default(), 5000).await;

    let record = h
        .orchestrator
        .execute_run(
            h.swarm_id,
            definition(vec![step("draft", 50), step("review", 50)]),
            run_request(1000),
        )
        .await
        .unwrap();
    assert_eq!(record.state, RunState::Paused);
    let run_id = record.run_id;

    let checkpoint_id = h.orchestrator.checkpoint_run(run_id).await.unwrap();
    h.orchestrator
        .restore_run(run_id, checkpoint_id)
        .await
        .unwrap();

    let restored = h.orchestrator.get_run(run_id).await.unwrap();
    assert_eq!(restored.state, RunState::Paused);
    assert_eq!(restored.current_location.as_deref(), Some("draft"));
}
