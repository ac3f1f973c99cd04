use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{MissionEngineError, Result};
use crate::model::{
    ControlAction, ControlRequest, ControlStatus, Domain, DomainLock, EventKind, ExecutionMode,
    Mission, MissionId, RiskLevel, Task, TaskId, TaskStatus, ToolOutcome,
};
use crate::scorer::SharedScorer;
use crate::store::MissionStore;
use crate::workers::{SharedWorkerPool, WorkerRequirements};
use tandem_observability::{emit_event, ObservabilityEvent, ProcessKind};

pub const DEFAULT_TASK_TIMEOUT_S: u64 = 120;
pub const DEFAULT_KILL_GRACE_S: u64 = 5;

/// Opaque external collaborator a Task is dispatched to (spec.md §6: "a
/// Tool is identified by `action_kind` ... exposes `invoke(params, mode,
/// deadline, cancel_signal) -> outcome`"). Mirrors the teacher's
/// `SidecarManager`-as-trait-object seam for swapping real/mock tools.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        action_kind: &str,
        params: &serde_json::Value,
        mode: ExecutionMode,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> (ToolOutcome, Option<String>, Option<String>);
}

/// Clamps a mission's execution mode against a task's risk level
/// (spec.md §4.5): HIGH-risk tasks in MOCK are DEFERRED; in DRY_RUN they
/// are recorded but not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveDisposition {
    Execute,
    RecordOnly,
    Defer,
}

pub fn effective_disposition(mission_mode: ExecutionMode, risk: RiskLevel) -> EffectiveDisposition {
    match (mission_mode, risk) {
        (ExecutionMode::Mock, RiskLevel::High) => EffectiveDisposition::Defer,
        (ExecutionMode::DryRun, RiskLevel::High) => EffectiveDisposition::RecordOnly,
        _ => EffectiveDisposition::Execute,
    }
}

/// Drives tasks through execution against a worker, enforcing the safety
/// state machine, approval gates, domain locks, and rollback. Grounded on
/// `src-tauri/src/orchestrator/engine.rs::OrchestratorEngine` (Arc<RwLock>
/// state, per-entity locks, CancellationToken-driven cancellation) and
/// `tandem-core/src/permissions.rs::PermissionManager` (watch-channel
/// approval-wait pattern).
pub struct ExecutionController {
    store: Arc<MissionStore>,
    workers: SharedWorkerPool,
    scorer: SharedScorer,
    tools: Arc<dyn ToolInvoker>,
    domain_locks: RwLock<HashMap<Domain, DomainLock>>,
    control_requests: RwLock<HashMap<String, ControlRequest>>,
    approval_waiters: RwLock<HashMap<String, watch::Sender<Option<bool>>>>,
    mission_cancel_tokens: RwLock<HashMap<MissionId, CancellationToken>>,
}

impl ExecutionController {
    pub fn new(store: Arc<MissionStore>, workers: SharedWorkerPool, scorer: SharedScorer, tools: Arc<dyn ToolInvoker>) -> Self {
        Self {
            store,
            workers,
            scorer,
            tools,
            domain_locks: RwLock::new(HashMap::new()),
            control_requests: RwLock::new(HashMap::new()),
            approval_waiters: RwLock::new(HashMap::new()),
            mission_cancel_tokens: RwLock::new(HashMap::new()),
        }
    }

    async fn cancel_token_for(&self, mission_id: MissionId) -> CancellationToken {
        if let Some(token) = self.mission_cancel_tokens.read().await.get(&mission_id) {
            return token.clone();
        }
        let token = CancellationToken::new();
        self.mission_cancel_tokens.write().await.insert(mission_id, token.clone());
        token
    }

    pub async fn is_domain_locked(&self, domain: Domain) -> bool {
        self.domain_locks
            .read()
            .await
            .get(&domain)
            .map(|lock| lock.is_active(Utc::now()))
            .unwrap_or(false)
    }

    /// The set of domains currently under an active lock, for building a
    /// [`crate::scheduler::SchedulingContext`].
    pub async fn locked_domains(&self) -> std::collections::HashSet<Domain> {
        let now = Utc::now();
        self.domain_locks
            .read()
            .await
            .iter()
            .filter(|(_, lock)| lock.is_active(now))
            .map(|(domain, _)| *domain)
            .collect()
    }

    /// Submits an operator action proposal. Appends CONTROL_SUBMITTED
    /// regardless of mission terminality (audit events bypass the
    /// terminal-mission guard in the Mission Store).
    pub async fn submit_control(&self, mission_id: MissionId, request: ControlRequest) -> Result<()> {
        self.store
            .append_event(mission_id, EventKind::ControlSubmitted, serde_json::to_value(&request)?)
            .await?;
        self.control_requests.write().await.insert(request.request_id.clone(), request);
        Ok(())
    }

    /// Approves a pending ControlRequest. Verifies `approver_id !=
    /// operator_id` (spec.md §4.5) and wakes anyone blocked in
    /// `wait_for_approval`.
    pub async fn approve_control(&self, mission_id: MissionId, request_id: &str, approver_id: &str, reason: String) -> Result<()> {
        let mut requests = self.control_requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| MissionEngineError::NonRetryable(format!("unknown control request {request_id}")))?;

        if request.requires_approval && request.operator_id == approver_id {
            return Err(MissionEngineError::PolicyViolation(
                "approver must differ from submitting operator".into(),
            ));
        }

        request.status = ControlStatus::Approved;
        request.approver_id = Some(approver_id.to_string());
        request.approval_reason = Some(reason);
        request.approved_at = Some(Utc::now());
        let request = request.clone();
        drop(requests);

        self.store
            .append_event(mission_id, EventKind::ControlApproved, serde_json::to_value(&request)?)
            .await?;

        if let Some(waiter) = self.approval_waiters.read().await.get(request_id).cloned() {
            let _ = waiter.send(Some(true));
        }

        self.apply_control_action(mission_id, &request).await
    }

    pub async fn reject_control(&self, mission_id: MissionId, request_id: &str, reason: String) -> Result<()> {
        let mut requests = self.control_requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| MissionEngineError::NonRetryable(format!("unknown control request {request_id}")))?;
        request.status = ControlStatus::Rejected;
        request.approval_reason = Some(reason);
        let request = request.clone();
        drop(requests);

        self.store
            .append_event(mission_id, EventKind::ControlRejected, serde_json::to_value(&request)?)
            .await?;
        if let Some(waiter) = self.approval_waiters.read().await.get(request_id).cloned() {
            let _ = waiter.send(Some(false));
        }
        Ok(())
    }

    /// Blocks until `request_id` is approved or rejected, or `cancel` fires.
    pub async fn wait_for_approval(&self, request_id: &str, cancel: CancellationToken) -> Option<bool> {
        let mut rx = {
            let mut waiters = self.approval_waiters.write().await;
            waiters.entry(request_id.to_string()).or_insert_with(|| watch::channel(None).0).subscribe()
        };
        let immediate = *rx.borrow();
        if let Some(decision) = immediate {
            return Some(decision);
        }
        tokio::select! {
            _ = cancel.cancelled() => None,
            changed = rx.changed() => changed.ok().and_then(|_| *rx.borrow()),
        }
    }

    async fn apply_control_action(&self, mission_id: MissionId, request: &ControlRequest) -> Result<()> {
        match request.action {
            ControlAction::PauseMission => {
                self.store
                    .append_event(mission_id, EventKind::StatusChange, serde_json::json!({"status": "PAUSED"}))
                    .await?;
            }
            ControlAction::ResumeMission => {
                self.store
                    .append_event(mission_id, EventKind::StatusChange, serde_json::json!({"status": "RUNNING"}))
                    .await?;
            }
            ControlAction::KillMission => {
                self.kill_mission(mission_id).await?;
            }
            ControlAction::LockDomain => {
                let domain: Domain = serde_json::from_str(&format!("\"{}\"", request.target_id))
                    .map_err(|e| MissionEngineError::NonRetryable(e.to_string()))?;
                self.domain_locks.write().await.insert(
                    domain,
                    DomainLock {
                        domain: request.target_id.clone(),
                        locked_by: request.operator_id.clone(),
                        locked_until: Utc::now() + chrono::Duration::hours(1),
                        reason: request.reason.clone(),
                    },
                );
            }
            ControlAction::UnlockDomain => {
                let domain: Domain = serde_json::from_str(&format!("\"{}\"", request.target_id))
                    .map_err(|e| MissionEngineError::NonRetryable(e.to_string()))?;
                self.domain_locks.write().await.remove(&domain);
            }
            ControlAction::PromoteForecast => {
                // Forecast promotion creates a new mission elsewhere; the
                // controller only records that the action executed.
            }
        }

        self.store
            .append_event(
                mission_id,
                EventKind::ControlExecuted,
                serde_json::json!({"request_id": request.request_id}),
            )
            .await?;
        Ok(())
    }

    /// Marks the mission KILLED, signals cancellation to EXECUTING tasks
    /// (each respects it within `DEFAULT_KILL_GRACE_S` or is forcibly
    /// drained), and skips PENDING tasks as CANCELLED (spec.md §5).
    async fn kill_mission(&self, mission_id: MissionId) -> Result<()> {
        let token = self.cancel_token_for(mission_id).await;
        token.cancel();

        for mut task in self.store.mission_tasks(mission_id).await {
            match task.status {
                TaskStatus::Executing => {
                    tokio::time::sleep(Duration::from_secs(DEFAULT_KILL_GRACE_S)).await;
                }
                TaskStatus::Pending => {
                    task.status = TaskStatus::Failed;
                    self.store.put_task(task.clone()).await?;
                    self.store
                        .append_event(
                            mission_id,
                            EventKind::TaskFailed,
                            serde_json::json!({"task_id": task.task_id, "reason": "cancelled"}),
                        )
                        .await?;
                }
                _ => {}
            }
        }

        self.store
            .append_event(mission_id, EventKind::StatusChange, serde_json::json!({"status": "KILLED"}))
            .await?;

        let mission_id_str = mission_id.to_string();
        emit_event(
            tracing::Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "mission.killed",
                component: "controller.kill_mission",
                correlation_id: None,
                session_id: None,
                run_id: Some(&mission_id_str),
                message_id: None,
                provider_id: None,
                model_id: None,
                status: Some("killed"),
                error_code: None,
                detail: None,
            },
        );
        Ok(())
    }

    /// Task execution algorithm (spec.md §4.5 steps 1-8).
    pub async fn execute_task(&self, mission: &Mission, mut task: Task, deadline: Duration) -> Result<Task> {
        if self.is_domain_locked(mission.domain).await {
            task.status = TaskStatus::Failed;
            self.store
                .append_event(
                    mission.mission_id,
                    EventKind::TaskFailed,
                    serde_json::json!({"task_id": task.task_id, "reason": "domain_locked"}),
                )
                .await?;
            return Ok(task);
        }

        if self.scorer.has_hard_constraint(&task.action_kind, &mission.domain.to_string()).await {
            task.status = TaskStatus::Failed;
            self.store
                .append_event(
                    mission.mission_id,
                    EventKind::TaskFailed,
                    serde_json::json!({"task_id": task.task_id, "reason": "feedback_constraint"}),
                )
                .await?;
            return Ok(task);
        }

        match effective_disposition(mission.execution_mode, task.risk_level) {
            EffectiveDisposition::Defer => {
                task.status = TaskStatus::Deferred;
                return Ok(task);
            }
            EffectiveDisposition::RecordOnly => {
                task.status = TaskStatus::Completed;
                self.store
                    .append_event(
                        mission.mission_id,
                        EventKind::TaskCompleted,
                        serde_json::json!({"task_id": task.task_id, "recorded_only": true}),
                    )
                    .await?;
                return Ok(task);
            }
            EffectiveDisposition::Execute => {}
        }

        task.status = TaskStatus::Executing;
        task.observed_start = Some(Utc::now());
        self.store
            .append_event(
                mission.mission_id,
                EventKind::TaskStarted,
                serde_json::json!({"task_id": task.task_id}),
            )
            .await?;

        let worker_id = self
            .workers
            .checkout_blocking(&WorkerRequirements, task.task_id, deadline)
            .await?;
        task.assigned_worker_id = Some(worker_id.clone());

        let cancel = self.cancel_token_for(mission.mission_id).await;
        let started = Utc::now();
        let (outcome, result_handle, failure_reason) = self
            .tools
            .invoke(&task.action_kind, &task.action_params, mission.execution_mode, deadline, cancel)
            .await;
        let latency_ms = Utc::now().signed_duration_since(started).num_milliseconds() as f64;

        self.store
            .append_event(
                mission.mission_id,
                EventKind::TaskAttempt,
                serde_json::json!({"task_id": task.task_id, "attempt_count": task.attempt_count + 1}),
            )
            .await?;

        self.workers.checkin(&worker_id, true, crate::workers::DEFAULT_SESSION_LIMIT).await?;

        let event_id = format!("{}-{}", task.task_id, task.attempt_count);
        self.scorer
            .record_outcome(&event_id, &task.action_kind, &mission.domain.to_string(), matches!(outcome, ToolOutcome::Success), latency_ms, failure_reason.clone())
            .await;

        match outcome {
            ToolOutcome::Success | ToolOutcome::PartialSuccess => {
                task.status = TaskStatus::Completed;
                task.observed_end = Some(Utc::now());
                task.result_handle = result_handle;
                self.store
                    .append_event(
                        mission.mission_id,
                        EventKind::TaskCompleted,
                        serde_json::json!({"task_id": task.task_id, "result_handle": task.result_handle}),
                    )
                    .await?;
            }
            ToolOutcome::RetryableFailure => {
                task.attempt_count += 1;
                if task.attempt_count < task.max_attempts {
                    task.status = TaskStatus::Retrying;
                } else {
                    task.status = TaskStatus::Failed;
                    self.store
                        .append_event(
                            mission.mission_id,
                            EventKind::TaskFailed,
                            serde_json::json!({"task_id": task.task_id, "reason": "max_retries_exceeded"}),
                        )
                        .await?;
                }
            }
            ToolOutcome::NonRetryableFailure => {
                task.status = TaskStatus::Failed;
                self.store
                    .append_event(
                        mission.mission_id,
                        EventKind::TaskFailed,
                        serde_json::json!({"task_id": task.task_id, "reason": failure_reason}),
                    )
                    .await?;
            }
        }

        self.store.put_task(task.clone()).await?;
        Ok(task)
    }

    /// Rolls back reversible completed sibling tasks within the same
    /// mission on a critical failure, then marks the mission FAILED.
    pub async fn rollback_mission(&self, mission_id: MissionId, reversible_task_ids: &[TaskId]) -> Result<()> {
        for task_id in reversible_task_ids {
            self.store
                .append_event(mission_id, EventKind::Rollback, serde_json::json!({"task_id": task_id}))
                .await?;
        }
        self.store
            .append_event(mission_id, EventKind::StatusChange, serde_json::json!({"status": "FAILED"}))
            .await?;

        let mission_id_str = mission_id.to_string();
        emit_event(
            tracing::Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "mission.rollback",
                component: "controller.rollback_mission",
                correlation_id: None,
                session_id: None,
                run_id: Some(&mission_id_str),
                message_id: None,
                provider_id: None,
                model_id: None,
                status: Some("failed"),
                error_code: None,
                detail: Some(&format!("rolled back {} task(s)", reversible_task_ids.len())),
            },
        );
        Ok(())
    }

    /// Crash recovery: any task left EXECUTING by a prior process without
    /// a subsequent COMPLETED/FAILED event is transitioned to RETRYING
    /// with an incremented `attempt_count` (spec.md §4.5).
    pub async fn recover_mission(&self, mission_id: MissionId) -> Result<()> {
        for mut task in self.store.mission_tasks(mission_id).await {
            if task.status == TaskStatus::Executing {
                task.attempt_count += 1;
                task.status = TaskStatus::Retrying;
                self.store.put_task(task.clone()).await?;
                self.store
                    .append_event(
                        mission_id,
                        EventKind::TaskAttempt,
                        serde_json::json!({"task_id": task.task_id, "attempt_count": task.attempt_count, "recovered": true}),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// A tool that always returns a fixed outcome; used by MOCK-mode
/// missions and tests in place of a real browser-backed tool.
pub struct MockToolInvoker {
    pub outcome: ToolOutcome,
}

#[async_trait]
impl ToolInvoker for MockToolInvoker {
    async fn invoke(
        &self,
        _action_kind: &str,
        _params: &serde_json::Value,
        _mode: ExecutionMode,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> (ToolOutcome, Option<String>, Option<String>) {
        match self.outcome {
            ToolOutcome::Success => (ToolOutcome::Success, Some("mock-result".to_string()), None),
            other => (other, None, Some("mock-failure".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MissionEventBus;
    use crate::model::Domain;
    use crate::scorer::Scorer;
    use crate::workers::WorkerPool;
    use tempfile::tempdir;

    async fn controller() -> (tempfile::TempDir, ExecutionController, Arc<MissionStore>) {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MissionEventBus::new());
        let store = Arc::new(MissionStore::open(dir.path(), bus).await.unwrap());
        let workers = Arc::new(WorkerPool::new());
        workers.register(crate::model::Worker::new(crate::model::WorkerId("w1".into()))).await;
        let scorer = Arc::new(Scorer::new());
        let tools = Arc::new(MockToolInvoker { outcome: ToolOutcome::Success });
        let controller = ExecutionController::new(store.clone(), workers, scorer, tools);
        (dir, controller, store)
    }

    #[test]
    fn high_risk_in_mock_mode_is_deferred() {
        assert_eq!(effective_disposition(ExecutionMode::Mock, RiskLevel::High), EffectiveDisposition::Defer);
    }

    #[test]
    fn high_risk_in_dry_run_is_record_only() {
        assert_eq!(effective_disposition(ExecutionMode::DryRun, RiskLevel::High), EffectiveDisposition::RecordOnly);
    }

    #[test]
    fn low_risk_always_executes() {
        assert_eq!(effective_disposition(ExecutionMode::Mock, RiskLevel::Low), EffectiveDisposition::Execute);
    }

    #[tokio::test]
    async fn approval_rejects_same_operator_as_approver() {
        let (_dir, controller, store) = controller().await;
        let mission_id = store
            .create_mission("obj".into(), "owner-1".into(), Domain::Research, ExecutionMode::Live)
            .await
            .unwrap();
        let request = ControlRequest::new(ControlAction::KillMission, mission_id.to_string(), "op-1".into(), "test".into());
        let request_id = request.request_id.clone();
        controller.submit_control(mission_id, request).await.unwrap();
        let result = controller.approve_control(mission_id, &request_id, "op-1", "self-approval".into()).await;
        assert!(matches!(result, Err(MissionEngineError::PolicyViolation(_))));
    }

    #[tokio::test]
    async fn successful_task_execution_marks_completed() {
        let (_dir, controller, store) = controller().await;
        let mission_id = store
            .create_mission("obj".into(), "owner-1".into(), Domain::Research, ExecutionMode::Live)
            .await
            .unwrap();
        let mission = store.get_mission(mission_id).await.unwrap();
        let task = Task::new(mission_id, "web_navigate.extract".into(), serde_json::json!({}));
        let result = controller.execute_task(&mission, task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn domain_locked_task_fails_without_retry() {
        let (_dir, controller, store) = controller().await;
        let mission_id = store
            .create_mission("obj".into(), "owner-1".into(), Domain::Research, ExecutionMode::Live)
            .await
            .unwrap();
        let mission = store.get_mission(mission_id).await.unwrap();
        controller.domain_locks.write().await.insert(
            Domain::Research,
            DomainLock {
                domain: "research".into(),
                locked_by: "op-1".into(),
                locked_until: Utc::now() + chrono::Duration::hours(1),
                reason: "test".into(),
            },
        );
        let task = Task::new(mission_id, "web_navigate.extract".into(), serde_json::json!({}));
        let result = controller.execute_task(&mission, task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn crash_recovery_retries_executing_tasks() {
        let (_dir, controller, store) = controller().await;
        let mission_id = store
            .create_mission("obj".into(), "owner-1".into(), Domain::Research, ExecutionMode::Live)
            .await
            .unwrap();
        let mut task = Task::new(mission_id, "web_navigate.extract".into(), serde_json::json!({}));
        task.status = TaskStatus::Executing;
        store.put_task(task.clone()).await.unwrap();

        controller.recover_mission(mission_id).await.unwrap();
        let recovered = store.get_task(task.task_id).await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Retrying);
        assert_eq!(recovered.attempt_count, 1);
    }
}
