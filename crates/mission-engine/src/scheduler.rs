use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{
    ConflictClass, ConflictStrategy, Domain, ExecutionMode, Mission, MissionId, MissionStatus,
    Priority, RiskLevel, Task, TaskId, TaskStatus,
};

/// Everything the scheduler needs about the surrounding system to decide
/// eligibility, kept as borrowed views rather than owned so callers don't
/// pay for a copy on every selection pass.
pub struct SchedulingContext<'a> {
    pub missions: &'a HashMap<MissionId, Mission>,
    pub locked_domains: &'a HashSet<Domain>,
    pub control_approved_missions: &'a HashSet<MissionId>,
}

/// Eligibility rules from spec.md §4.3: all five conditions must hold.
pub fn is_eligible(task: &Task, completed: &HashSet<TaskId>, ctx: &SchedulingContext<'_>) -> bool {
    if task.status != TaskStatus::Pending {
        return false;
    }
    let Some(mission) = ctx.missions.get(&task.mission_id) else {
        return false;
    };

    let deps_done = task.depends_on.iter().all(|d| completed.contains(d));
    let mission_active = matches!(mission.status, MissionStatus::Queued | MissionStatus::Running);
    let domain_unlocked = !ctx.locked_domains.contains(&mission.domain);
    let attempts_remaining = task.attempt_count < task.max_attempts;
    let risk_ok = task.risk_level != RiskLevel::High
        || (mission.execution_mode == ExecutionMode::Live
            && ctx.control_approved_missions.contains(&mission.mission_id));

    deps_done && mission_active && domain_unlocked && attempts_remaining && risk_ok
}

/// Tracks per-mission dispatch order so round-robin fairness (spec.md
/// §4.3 step 3) doesn't drain one mission's tasks before touching
/// another's within the same priority class.
#[derive(Default)]
pub struct FairnessCursor {
    last_mission: Option<MissionId>,
}

impl FairnessCursor {
    /// Selects the next task from `eligible`, which must already be
    /// restricted to a single priority class. Orders by earliest
    /// `scheduled_start` (falling back to arrival order, i.e. input
    /// order) then `task_id`, then rotates away from the mission chosen
    /// last time when more than one mission has eligible work.
    pub fn select<'a>(&mut self, eligible: &'a [&'a Task]) -> Option<&'a Task> {
        if eligible.is_empty() {
            return None;
        }

        let mut ordered: Vec<&Task> = eligible.to_vec();
        ordered.sort_by(|a, b| {
            a.scheduled_start
                .cmp(&b.scheduled_start)
                .then_with(|| a.task_id.0.cmp(&b.task_id.0))
        });

        let chosen = if let Some(last) = self.last_mission {
            ordered
                .iter()
                .find(|t| t.mission_id != last)
                .or_else(|| ordered.first())
                .copied()
        } else {
            ordered.first().copied()
        };

        if let Some(task) = chosen {
            self.last_mission = Some(task.mission_id);
        }
        chosen
    }
}

/// Partitions eligible tasks by priority class, highest first, and picks
/// the next one to dispatch. Grounded on
/// `src-tauri/src/orchestrator/scheduler.rs::TaskScheduler::get_next_runnable`,
/// generalized from a single FIFO scan to priority partitioning plus
/// cross-mission fairness.
pub fn select_next_task<'a>(
    tasks: &'a [Task],
    priorities: &HashMap<TaskId, Priority>,
    ctx: &SchedulingContext<'_>,
    cursor: &mut FairnessCursor,
) -> Option<&'a Task> {
    let completed: HashSet<TaskId> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.task_id)
        .collect();

    let eligible: Vec<&Task> = tasks.iter().filter(|t| is_eligible(t, &completed, ctx)).collect();
    if eligible.is_empty() {
        return None;
    }

    for class in [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ] {
        let class_tasks: Vec<&Task> = eligible
            .iter()
            .copied()
            .filter(|t| priorities.get(&t.task_id).copied().unwrap_or(Priority::Normal) == class)
            .collect();
        if !class_tasks.is_empty() {
            return cursor.select(&class_tasks);
        }
    }
    None
}

/// Static mapping from conflict class to resolution strategy (spec.md
/// §4.3). Expressed as data so a deployment can override it rather than
/// recompiling; see DESIGN.md's Open Question decisions.
pub struct ConflictTable {
    strategies: HashMap<ConflictClass, ConflictStrategy>,
}

impl ConflictTable {
    pub fn strategy_for(&self, class: ConflictClass) -> ConflictStrategy {
        self.strategies.get(&class).copied().unwrap_or(ConflictStrategy::Delay)
    }
}

impl Default for ConflictTable {
    fn default() -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(ConflictClass::Resource, ConflictStrategy::Reassign);
        strategies.insert(ConflictClass::Ordering, ConflictStrategy::Delay);
        strategies.insert(ConflictClass::RateLimit, ConflictStrategy::Delay);
        strategies.insert(ConflictClass::DuplicateAction, ConflictStrategy::Abort);
        Self { strategies }
    }
}

/// Detects whether dispatching `candidate` alongside `executing` would
/// conflict, per the four conflict classes in spec.md §4.3.
pub fn detect_conflict(candidate: &Task, executing: &[&Task]) -> Option<ConflictClass> {
    for other in executing {
        if other.action_kind == candidate.action_kind && other.action_params == candidate.action_params {
            return Some(ConflictClass::DuplicateAction);
        }
        if let (Some(r1), Some(r2)) = (
            candidate.action_params.get("resource"),
            other.action_params.get("resource"),
        ) {
            if r1 == r2 {
                return Some(ConflictClass::Resource);
            }
        }
        if let (Some(h1), Some(h2)) = (candidate.action_params.get("host"), other.action_params.get("host")) {
            if h1 == h2 {
                return Some(ConflictClass::RateLimit);
            }
        }
        if ordering_conflict(&candidate.action_kind, &other.action_kind) {
            return Some(ConflictClass::Ordering);
        }
    }
    None
}

/// Action kinds with a fixed "must follow" relationship, e.g. a publish
/// step can never race ahead of its corresponding draft step.
fn ordering_conflict(a: &str, b: &str) -> bool {
    const PAIRS: &[(&str, &str)] = &[("publish", "draft"), ("deploy", "build")];
    PAIRS.iter().any(|(first, second)| {
        (a.starts_with(first) && b.starts_with(second)) || (a.starts_with(second) && b.starts_with(first))
    })
}

/// Default exponential backoff cap sequence (spec.md §6 `retry_backoff_caps_s`).
const DEFAULT_BACKOFF_CAPS_S: &[u64] = &[2, 4, 8, 16, 30];

/// Backoff delay in seconds for the given retry attempt (1-indexed),
/// reading the configured cap sequence or falling back to the default.
pub fn retry_backoff_s(attempt: u32, caps: Option<&[u64]>) -> u64 {
    let caps = caps.unwrap_or(DEFAULT_BACKOFF_CAPS_S);
    let idx = (attempt.saturating_sub(1)) as usize;
    caps.get(idx).copied().unwrap_or_else(|| *caps.last().unwrap_or(&30))
}

/// Whether a failed task's error is retryable. Policy violations, domain
/// locks, and explicit kill requests never retry (spec.md §4.3).
pub fn is_retryable(error_message: &str) -> bool {
    const NON_RETRYABLE_MARKERS: &[&str] = &["policy violation", "domain locked", "kill requested"];
    !NON_RETRYABLE_MARKERS.iter().any(|m| error_message.to_lowercase().contains(m))
}

/// Keeps DEFERRED tasks out of the eligible pool until their backoff
/// window elapses, re-surfacing them for [`select_next_task`] afterward.
/// Grounded on `src-tauri/src/orchestrator/scheduler.rs::update_blocked_tasks`'s
/// toggling pattern, generalized from a boolean gate to a time-gated queue.
#[derive(Default)]
pub struct DeferredQueue {
    entries: VecDeque<(TaskId, chrono::DateTime<chrono::Utc>)>,
}

impl DeferredQueue {
    pub fn defer(&mut self, task_id: TaskId, retry_at: chrono::DateTime<chrono::Utc>) {
        self.entries.push_back((task_id, retry_at));
    }

    /// Removes and returns task ids whose backoff window has elapsed.
    pub fn ready(&mut self, now: chrono::DateTime<chrono::Utc>) -> Vec<TaskId> {
        let mut ready = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((task_id, retry_at)) = self.entries.pop_front() {
            if retry_at <= now {
                ready.push(task_id);
            } else {
                remaining.push_back((task_id, retry_at));
            }
        }
        self.entries = remaining;
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn mission(status: MissionStatus, domain: Domain, mode: ExecutionMode) -> Mission {
        let mut m = Mission::new("obj".into(), "owner".into(), domain);
        m.status = status;
        m.execution_mode = mode;
        m
    }

    #[test]
    fn eligibility_requires_completed_deps_and_active_mission() {
        let m = mission(MissionStatus::Running, Domain::Research, ExecutionMode::Live);
        let mission_id = m.mission_id;
        let mut missions = HashMap::new();
        missions.insert(mission_id, m);
        let locked = HashSet::new();
        let approved = HashSet::new();
        let ctx = SchedulingContext {
            missions: &missions,
            locked_domains: &locked,
            control_approved_missions: &approved,
        };

        let blocking = Task::new(mission_id, "a".into(), json!({}));
        let mut dependent = Task::new(mission_id, "b".into(), json!({}));
        dependent.depends_on = vec![blocking.task_id];

        let completed = HashSet::new();
        assert!(!is_eligible(&dependent, &completed, &ctx));

        let mut completed_with_dep = HashSet::new();
        completed_with_dep.insert(blocking.task_id);
        assert!(is_eligible(&dependent, &completed_with_dep, &ctx));
    }

    #[test]
    fn high_risk_task_requires_live_mode_and_approval() {
        let m = mission(MissionStatus::Running, Domain::Research, ExecutionMode::DryRun);
        let mission_id = m.mission_id;
        let mut missions = HashMap::new();
        missions.insert(mission_id, m);
        let locked = HashSet::new();
        let approved = HashSet::new();
        let ctx = SchedulingContext {
            missions: &missions,
            locked_domains: &locked,
            control_approved_missions: &approved,
        };

        let mut task = Task::new(mission_id, "a".into(), json!({}));
        task.risk_level = RiskLevel::High;
        assert!(!is_eligible(&task, &HashSet::new(), &ctx));
    }

    #[test]
    fn domain_lock_blocks_eligibility() {
        let m = mission(MissionStatus::Running, Domain::Research, ExecutionMode::Live);
        let mission_id = m.mission_id;
        let mut missions = HashMap::new();
        missions.insert(mission_id, m);
        let mut locked = HashSet::new();
        locked.insert(Domain::Research);
        let approved = HashSet::new();
        let ctx = SchedulingContext {
            missions: &missions,
            locked_domains: &locked,
            control_approved_missions: &approved,
        };

        let task = Task::new(mission_id, "a".into(), json!({}));
        assert!(!is_eligible(&task, &HashSet::new(), &ctx));
    }

    #[test]
    fn fairness_cursor_rotates_across_missions() {
        let t1 = Task::new(MissionId::new(), "a".into(), json!({}));
        let t2 = Task::new(MissionId::new(), "a".into(), json!({}));
        let tasks = vec![t1, t2];
        let refs: Vec<&Task> = tasks.iter().collect();

        let mut cursor = FairnessCursor::default();
        let first = cursor.select(&refs).unwrap().mission_id;
        let second = cursor.select(&refs).unwrap().mission_id;
        assert_ne!(first, second);
    }

    #[test]
    fn duplicate_action_conflict_maps_to_abort() {
        let t1 = Task::new(MissionId::new(), "send_email".into(), json!({"to": "a@example.com"}));
        let t2 = Task::new(MissionId::new(), "send_email".into(), json!({"to": "a@example.com"}));
        let executing = vec![&t1];
        let class = detect_conflict(&t2, &executing).unwrap();
        assert_eq!(class, ConflictClass::DuplicateAction);
        assert_eq!(ConflictTable::default().strategy_for(class), ConflictStrategy::Abort);
    }

    #[test]
    fn retry_backoff_follows_configured_cap_sequence() {
        assert_eq!(retry_backoff_s(1, None), 2);
        assert_eq!(retry_backoff_s(2, None), 4);
        assert_eq!(retry_backoff_s(3, None), 8);
        assert_eq!(retry_backoff_s(10, None), 30);
    }

    #[test]
    fn policy_violation_is_not_retryable() {
        assert!(!is_retryable("policy violation: blocked domain"));
        assert!(is_retryable("connection reset"));
    }

    #[test]
    fn deferred_queue_releases_after_retry_time() {
        let mut queue = DeferredQueue::default();
        let task_id = TaskId::new();
        let now = Utc::now();
        queue.defer(task_id, now - chrono::Duration::seconds(1));
        let ready = queue.ready(now);
        assert_eq!(ready, vec![task_id]);
    }
}
