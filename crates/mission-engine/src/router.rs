use crate::model::{Lane, Priority, Task, TaskId, Worker, WorkerStatus};

/// A minimal view of local worker availability the router needs to make
/// its decision, without depending on the full pool implementation.
pub struct LocalAvailability<'a> {
    pub workers: &'a [Worker],
}

impl<'a> LocalAvailability<'a> {
    fn idle_workers(&self) -> impl Iterator<Item = &'a Worker> {
        self.workers.iter().filter(|w| w.status == WorkerStatus::Idle)
    }

    fn has_capacity(&self) -> bool {
        self.idle_workers().next().is_some()
    }

    /// Ties between equivalent local workers are broken by least-loaded
    /// (fewest completed tasks since last restart, then lowest
    /// `current_task_id`) per spec.md §4.2.
    fn least_loaded(&self) -> Option<&'a Worker> {
        self.idle_workers().min_by(|a, b| {
            a.tasks_completed_since_restart
                .cmp(&b.tasks_completed_since_restart)
                .then_with(|| task_id_key(a.current_task_id).cmp(&task_id_key(b.current_task_id)))
        })
    }
}

fn task_id_key(task_id: Option<TaskId>) -> uuid::Uuid {
    task_id.map(|t| t.0).unwrap_or(uuid::Uuid::nil())
}

/// Action kinds the router treats as requiring the cloud's API surface
/// (spec.md §4.2 step 1). A closed prefix set rather than a single
/// string, since action kinds are namespaced (e.g. `api.crm.lookup`).
const REQUIRES_API_PREFIXES: &[&str] = &["api.", "llm.", "email.send"];

/// Action kinds belonging to the `web_navigate` family (spec.md §4.2 step 4).
const WEB_NAVIGATE_PREFIXES: &[&str] = &["web_navigate", "browser."];

fn requires_api(action_kind: &str) -> bool {
    REQUIRES_API_PREFIXES.iter().any(|p| action_kind.starts_with(p))
}

fn is_web_navigate(action_kind: &str) -> bool {
    WEB_NAVIGATE_PREFIXES.iter().any(|p| action_kind.starts_with(p))
}

/// Decision tree from spec.md §4.2, evaluated top-to-bottom. Grounded on
/// `src-tauri/src/orchestrator/scheduler.rs`'s deterministic tie-break
/// style, generalized from task ordering to lane selection.
pub fn route(task: &Task, priority: Priority, local: &LocalAvailability<'_>) -> Lane {
    if requires_api(&task.action_kind) {
        return Lane::Cloud;
    }
    if priority == Priority::Urgent {
        return Lane::Cloud;
    }
    if !local.has_capacity() {
        return Lane::Cloud;
    }
    if is_web_navigate(&task.action_kind) {
        return Lane::Local;
    }
    Lane::Cloud
}

/// Picks the worker a `LOCAL` routing decision should be dispatched to.
/// Only meaningful when [`route`] returned [`Lane::Local`].
pub fn pick_local_worker<'a>(local: &LocalAvailability<'a>) -> Option<&'a Worker> {
    local.least_loaded()
}

/// Tracks consecutive dispatch-time re-routing failures for a task so the
/// scheduler can mark it DEFERRED after two in a row (spec.md §4.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct RerouteAttempts(u8);

impl RerouteAttempts {
    pub const DEFER_AFTER: u8 = 2;

    pub fn record_failure(&mut self) -> bool {
        self.0 += 1;
        self.0 >= Self::DEFER_AFTER
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MissionId, WorkerId};
    use serde_json::json;

    fn task(action_kind: &str) -> Task {
        Task::new(MissionId::new(), action_kind.to_string(), json!({}))
    }

    fn idle_worker(id: &str, completed: u32) -> Worker {
        Worker {
            worker_id: WorkerId(id.to_string()),
            status: WorkerStatus::Idle,
            tasks_completed_since_restart: completed,
            last_health_ok_at: chrono::Utc::now(),
            current_task_id: None,
        }
    }

    #[test]
    fn api_tagged_actions_always_route_to_cloud() {
        let workers = [idle_worker("w1", 0)];
        let local = LocalAvailability { workers: &workers };
        let t = task("api.crm.lookup");
        assert_eq!(route(&t, Priority::Low, &local), Lane::Cloud);
    }

    #[test]
    fn urgent_priority_routes_to_cloud_even_with_capacity() {
        let workers = [idle_worker("w1", 0)];
        let local = LocalAvailability { workers: &workers };
        let t = task("web_navigate.click");
        assert_eq!(route(&t, Priority::Urgent, &local), Lane::Cloud);
    }

    #[test]
    fn web_navigate_with_capacity_routes_local() {
        let workers = [idle_worker("w1", 0)];
        let local = LocalAvailability { workers: &workers };
        let t = task("web_navigate.click");
        assert_eq!(route(&t, Priority::Normal, &local), Lane::Local);
    }

    #[test]
    fn no_capacity_routes_to_cloud() {
        let workers: [Worker; 0] = [];
        let local = LocalAvailability { workers: &workers };
        let t = task("web_navigate.click");
        assert_eq!(route(&t, Priority::Normal, &local), Lane::Cloud);
    }

    #[test]
    fn non_web_navigate_default_routes_cloud() {
        let workers = [idle_worker("w1", 0)];
        let local = LocalAvailability { workers: &workers };
        let t = task("general.compute");
        assert_eq!(route(&t, Priority::Normal, &local), Lane::Cloud);
    }

    #[test]
    fn least_loaded_worker_is_chosen_on_ties() {
        let workers = [idle_worker("w1", 5), idle_worker("w2", 1)];
        let local = LocalAvailability { workers: &workers };
        let chosen = pick_local_worker(&local).unwrap();
        assert_eq!(chosen.worker_id, WorkerId("w2".to_string()));
    }

    #[test]
    fn reroute_attempts_defer_after_two_failures() {
        let mut attempts = RerouteAttempts::default();
        assert!(!attempts.record_failure());
        assert!(attempts.record_failure());
    }
}
