use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mission_engine::{
    router, scheduler, EventKind, ExecutionController, LocalAvailability, MissionFilter, MissionId,
    MissionStatus, MissionStore, Priority, SharedWorkerPool, TaskStatus,
};
use tracing::{info, warn};

const DISPATCH_INTERVAL_MS: u64 = 250;
const TASK_DEADLINE_S: u64 = 30;

/// Periodic dispatch sweep: selects the next eligible task across all
/// QUEUED/RUNNING missions, routes it, and drives it through the
/// controller. Mirrors `scheduling::spawn_schedule_sweep`'s interval-tick
/// shape; without this loop a mission's tasks never leave PENDING.
pub fn spawn_dispatch_loop(
    store: Arc<MissionStore>,
    workers: SharedWorkerPool,
    controller: Arc<ExecutionController>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(DISPATCH_INTERVAL_MS));
        let mut cursor = scheduler::FairnessCursor::default();
        loop {
            interval.tick().await;
            dispatch_once(&store, &workers, &controller, &mut cursor).await;
        }
    })
}

async fn dispatch_once(
    store: &Arc<MissionStore>,
    workers: &SharedWorkerPool,
    controller: &Arc<ExecutionController>,
    cursor: &mut scheduler::FairnessCursor,
) {
    let active: HashMap<MissionId, mission_engine::Mission> = store
        .list_missions(&MissionFilter::default())
        .await
        .into_iter()
        .filter(|m| matches!(m.status, MissionStatus::Queued | MissionStatus::Running))
        .map(|m| (m.mission_id, m))
        .collect();
    if active.is_empty() {
        return;
    }

    let mut tasks = Vec::new();
    for mission_id in active.keys() {
        tasks.extend(store.mission_tasks(*mission_id).await);
    }

    let priorities: HashMap<_, _> = tasks
        .iter()
        .filter_map(|t| active.get(&t.mission_id).map(|m| (t.task_id, m.priority)))
        .collect();

    let locked_domains = controller.locked_domains().await;
    let control_approved_missions = store.control_approved_missions().await;
    let ctx = scheduler::SchedulingContext {
        missions: &active,
        locked_domains: &locked_domains,
        control_approved_missions: &control_approved_missions,
    };

    let Some(task) = scheduler::select_next_task(&tasks, &priorities, &ctx, cursor) else {
        return;
    };
    let task = task.clone();
    let mission = active
        .get(&task.mission_id)
        .cloned()
        .expect("selected task's mission is in the active set");

    let priority = priorities.get(&task.task_id).copied().unwrap_or(Priority::Normal);
    let worker_snapshot = workers.snapshot().await;
    let local = LocalAvailability {
        workers: &worker_snapshot,
    };
    let lane = router::route(&task, priority, &local);
    info!(task_id = %task.task_id, mission_id = %mission.mission_id, ?lane, "dispatching task");

    if mission.status == MissionStatus::Queued {
        let _ = store
            .append_event(
                mission.mission_id,
                EventKind::StatusChange,
                serde_json::json!({"status": "RUNNING"}),
            )
            .await;
    }

    let deadline = Duration::from_secs(TASK_DEADLINE_S);
    match controller.execute_task(&mission, task, deadline).await {
        Ok(result) => {
            if let Err(e) = store.put_task(result.clone()).await {
                warn!(error = %e, "failed to persist dispatched task state");
                return;
            }
            if matches!(result.status, TaskStatus::Completed | TaskStatus::Failed) {
                finalize_mission_if_done(store, mission.mission_id).await;
            }
        }
        Err(e) => warn!(error = %e, "task execution failed"),
    }
}

/// Once every task in a mission has reached a terminal status, appends
/// the mission's own terminal StatusChange and a MissionStop (spec.md
/// §3's lifecycle ends in one of COMPLETED/FAILED/KILLED/CANCELLED).
async fn finalize_mission_if_done(store: &Arc<MissionStore>, mission_id: MissionId) {
    let Ok(mission) = store.get_mission(mission_id).await else {
        return;
    };
    if mission.status.is_terminal() {
        return;
    }

    let tasks = store.mission_tasks(mission_id).await;
    let all_terminal = !tasks.is_empty()
        && tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::RolledBack));
    if !all_terminal {
        return;
    }

    let final_status = if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        "COMPLETED"
    } else {
        "FAILED"
    };
    let _ = store
        .append_event(mission_id, EventKind::StatusChange, serde_json::json!({"status": final_status}))
        .await;
    let _ = store.append_event(mission_id, EventKind::MissionStop, serde_json::json!({})).await;
}
