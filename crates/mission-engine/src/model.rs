use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a [`Mission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MissionId(pub Uuid);

impl MissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a [`Worker`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed domain vocabulary used to scope tool statistics and locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Marketing,
    Engineering,
    Operations,
    Research,
    Unknown,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Domain::Marketing => "marketing",
            Domain::Engineering => "engineering",
            Domain::Operations => "operations",
            Domain::Research => "research",
            Domain::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Proposed,
    Approved,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionStatus::Completed
                | MissionStatus::Failed
                | MissionStatus::Killed
                | MissionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    // Declared low to high so derived Ord sorts ascending; callers that
    // want "most urgent first" iterate in reverse.
    Background,
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Mock,
    DryRun,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Recognized policy overrides a mission may carry (spec.md §3/§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_task_timeout_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries_per_task: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_delay_ms: Option<u64>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

/// An ordered sequence of Tasks derived from an Objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub mission_id: MissionId,
    pub objective_text: String,
    pub domain: Domain,
    pub status: MissionStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub owner_id: String,
    pub progress_percent: u8,
    pub execution_mode: ExecutionMode,
    pub policy_overrides: PolicyOverrides,
    pub task_ids: Vec<TaskId>,
}

impl Mission {
    pub fn new(objective_text: String, owner_id: String, domain: Domain) -> Self {
        Self {
            mission_id: MissionId::new(),
            objective_text,
            domain,
            status: MissionStatus::Proposed,
            priority: Priority::Normal,
            created_at: Utc::now(),
            owner_id,
            progress_percent: 0,
            execution_mode: ExecutionMode::Mock,
            policy_overrides: PolicyOverrides::default(),
            task_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
    Retrying,
    Deferred,
    RolledBack,
}

/// An atomic unit of work scheduled onto a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub mission_id: MissionId,
    pub depends_on: Vec<TaskId>,
    pub action_kind: String,
    pub action_params: serde_json::Value,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub assigned_worker_id: Option<WorkerId>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub observed_start: Option<DateTime<Utc>>,
    pub observed_end: Option<DateTime<Utc>>,
    pub result_handle: Option<String>,
}

impl Task {
    pub fn new(mission_id: MissionId, action_kind: String, action_params: serde_json::Value) -> Self {
        Self {
            task_id: TaskId::new(),
            mission_id,
            depends_on: Vec::new(),
            action_kind,
            action_params,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            risk_level: RiskLevel::Low,
            confidence: 1.0,
            assigned_worker_id: None,
            scheduled_start: None,
            observed_start: None,
            observed_end: None,
            result_handle: None,
        }
    }
}

/// Closed vocabulary of event kinds appended to a mission's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    MissionStart,
    StatusChange,
    TaskScheduled,
    TaskStarted,
    TaskAttempt,
    TaskCompleted,
    TaskFailed,
    Progress,
    MissionStop,
    ControlSubmitted,
    ControlApproved,
    ControlRejected,
    ControlExecuted,
    Rollback,
    /// Carries a full serialized [`Task`] snapshot so replay can rebuild
    /// task state without a dedicated task log; written by
    /// [`crate::store::MissionStore::put_task`].
    TaskUpdated,
    /// Not in the source event-kind vocabulary: synthesized locally by a
    /// lagging subscriber's stream handle, never written to the log.
    Gap,
}

/// An immutable record appended to a mission's event log. The sole
/// source of truth for reconstructing mission state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub mission_id: MissionId,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    CheckedOut,
    Unhealthy,
    Draining,
}

/// A long-lived browser instance, exclusively owned by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub tasks_completed_since_restart: u32,
    pub last_health_ok_at: DateTime<Utc>,
    pub current_task_id: Option<TaskId>,
}

impl Worker {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            tasks_completed_since_restart: 0,
            last_health_ok_at: Utc::now(),
            current_task_id: None,
        }
    }
}

/// Per-(tool × domain) accumulated outcome statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProfile {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub failure_modes: VecDeque<String>,
    pub avg_latency_ms: f64,
    pub usefulness_score: f64,
}

impl ToolProfile {
    pub const MAX_FAILURE_MODES: usize = 10;

    pub fn new() -> Self {
        Self {
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            failure_modes: VecDeque::new(),
            avg_latency_ms: 0.0,
            usefulness_score: 0.5,
        }
    }

    pub fn record_failure_mode(&mut self, mode: String) {
        if self.failure_modes.len() >= Self::MAX_FAILURE_MODES {
            self.failure_modes.pop_front();
        }
        self.failure_modes.push_back(mode);
    }
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// The distinguished domain key used for the cross-domain fallback profile.
pub const GLOBAL_DOMAIN: &str = "_global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackVerdict {
    Positive,
    Negative,
    Correction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackAction {
    Boost,
    Penalize,
    Constrain,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardConstraint {
    NeverUse,
}

/// Human-provided signal fed into the Scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub feedback_id: String,
    pub tool_name: String,
    pub domain: String,
    pub verdict: FeedbackVerdict,
    pub action: FeedbackAction,
    pub impact: Option<f64>,
    pub hard_constraint: Option<HardConstraint>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    PauseMission,
    KillMission,
    PromoteForecast,
    LockDomain,
    UnlockDomain,
    ResumeMission,
}

impl ControlAction {
    /// PAUSE, KILL, PROMOTE_FORECAST, LOCK_DOMAIN require approval;
    /// RESUME_MISSION and UNLOCK_DOMAIN do not (spec.md §4.5).
    pub fn requires_approval_by_default(self) -> bool {
        matches!(
            self,
            ControlAction::PauseMission
                | ControlAction::KillMission
                | ControlAction::PromoteForecast
                | ControlAction::LockDomain
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

/// An operator action proposal, subject to approval where configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: String,
    pub action: ControlAction,
    pub target_id: String,
    pub operator_id: String,
    pub reason: String,
    pub requires_approval: bool,
    pub status: ControlStatus,
    pub approver_id: Option<String>,
    pub approval_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ControlRequest {
    pub fn new(action: ControlAction, target_id: String, operator_id: String, reason: String) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            requires_approval: action.requires_approval_by_default(),
            action,
            target_id,
            operator_id,
            reason,
            status: ControlStatus::Pending,
            approver_id: None,
            approval_reason: None,
            submitted_at: Utc::now(),
            approved_at: None,
            executed_at: None,
        }
    }
}

/// A time-bounded prohibition on running missions targeting a given domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainLock {
    pub domain: String,
    pub locked_by: String,
    pub locked_until: DateTime<Utc>,
    pub reason: String,
}

impl DomainLock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.locked_until
    }
}

/// Normalized outcome of a tool invocation (spec.md §4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    RetryableFailure,
    NonRetryableFailure,
    PartialSuccess,
}

/// Conflict classes over action kinds (spec.md §4.3). Contents of the
/// conflict table are configuration; this is just the closed set of
/// classes the table may map into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictClass {
    Resource,
    Ordering,
    RateLimit,
    DuplicateAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    Delay,
    Reassign,
    Downgrade,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Local,
    Cloud,
}
