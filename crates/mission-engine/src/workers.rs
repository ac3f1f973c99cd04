use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, RwLock};

use crate::error::{MissionEngineError, Result};
use crate::model::{TaskId, Worker, WorkerId, WorkerStatus};

/// Default session limit before a worker is drained and replaced
/// (spec.md §4.4).
pub const DEFAULT_SESSION_LIMIT: u32 = 50;

/// How often each worker is liveness-probed (spec.md §4.4).
pub const HEALTH_PROBE_INTERVAL_S: u64 = 30;

/// Requirements a checkout may place on the returned worker. Empty today
/// (any IDLE worker matches); kept as a struct rather than `()` so the
/// router's requirement set can grow without changing the pool's API.
#[derive(Debug, Clone, Default)]
pub struct WorkerRequirements;

/// Bounded set of ready-to-use browser workers, with checkout/checkin
/// semantics. Grounded on `mission_runner.rs`'s `CancellationToken` +
/// `JoinHandle` lifecycle tracking, generalized from one task's execution
/// handle to a pool of reusable workers.
pub struct WorkerPool {
    workers: RwLock<HashMap<WorkerId, Worker>>,
    consecutive_health_failures: RwLock<HashMap<WorkerId, u32>>,
    checkin_notify: Notify,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            consecutive_health_failures: RwLock::new(HashMap::new()),
            checkin_notify: Notify::new(),
        }
    }

    pub async fn register(&self, worker: Worker) {
        self.workers.write().await.insert(worker.worker_id.clone(), worker);
    }

    async fn try_checkout_once(&self, _requirements: &WorkerRequirements, task_id: TaskId) -> Option<WorkerId> {
        let mut workers = self.workers.write().await;
        let candidate = workers
            .values_mut()
            .filter(|w| w.status == WorkerStatus::Idle)
            .min_by_key(|w| w.tasks_completed_since_restart)?
            .worker_id
            .clone();
        let worker = workers.get_mut(&candidate)?;
        worker.status = WorkerStatus::CheckedOut;
        worker.current_task_id = Some(task_id);
        Some(candidate)
    }

    /// Non-blocking checkout: returns immediately if no worker matches.
    pub async fn checkout(&self, requirements: &WorkerRequirements, task_id: TaskId) -> Option<WorkerId> {
        self.try_checkout_once(requirements, task_id).await
    }

    /// Blocking checkout: waits (up to `deadline`) for a worker to free up.
    pub async fn checkout_blocking(
        &self,
        requirements: &WorkerRequirements,
        task_id: TaskId,
        deadline: Duration,
    ) -> Result<WorkerId> {
        let start = tokio::time::Instant::now();
        loop {
            if let Some(id) = self.try_checkout_once(requirements, task_id).await {
                return Ok(id);
            }
            let remaining = deadline.checked_sub(start.elapsed());
            let Some(remaining) = remaining else {
                return Err(MissionEngineError::ResourceExhaustion(
                    "no worker became available before deadline".into(),
                ));
            };
            tokio::select! {
                _ = self.checkin_notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(MissionEngineError::ResourceExhaustion(
                        "no worker became available before deadline".into(),
                    ));
                }
            }
        }
    }

    /// Returns a worker to IDLE after clearing per-task state. If the
    /// health probe fails or the worker has served `session_limit` tasks,
    /// it is drained and replaced by the caller (the pool only marks it
    /// UNHEALTHY; replacement is the caller's responsibility via `drain`
    /// followed by `register`).
    pub async fn checkin(&self, worker_id: &WorkerId, healthy: bool, session_limit: u32) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| MissionEngineError::NonRetryable(format!("unknown worker {worker_id}")))?;

        worker.current_task_id = None;
        worker.tasks_completed_since_restart += 1;

        if !healthy || worker.tasks_completed_since_restart >= session_limit {
            worker.status = WorkerStatus::Unhealthy;
        } else {
            worker.status = WorkerStatus::Idle;
        }
        drop(workers);
        self.checkin_notify.notify_waiters();
        Ok(())
    }

    /// Records the outcome of a periodic liveness check. Two consecutive
    /// failures mark the worker UNHEALTHY (spec.md §4.4).
    pub async fn health_probe(&self, worker_id: &WorkerId, ok: bool) -> Result<()> {
        let mut failures = self.consecutive_health_failures.write().await;
        let count = failures.entry(worker_id.clone()).or_insert(0);
        if ok {
            *count = 0;
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.last_health_ok_at = Utc::now();
            }
            return Ok(());
        }

        *count += 1;
        if *count >= 2 {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.status = WorkerStatus::Unhealthy;
            }
        }
        Ok(())
    }

    /// Marks every IDLE worker beyond `target_count` as DRAINING; they
    /// are removed from the pool on their next checkin. Growth is the
    /// caller's responsibility via `register`, bounded by the Resource
    /// Monitor's `safe_worker_count`.
    pub async fn scale(&self, target_count: usize) {
        let mut workers = self.workers.write().await;
        let idle_count = workers.values().filter(|w| w.status == WorkerStatus::Idle).count();
        if idle_count <= target_count {
            return;
        }
        let mut to_drain = idle_count - target_count;
        for worker in workers.values_mut() {
            if to_drain == 0 {
                break;
            }
            if worker.status == WorkerStatus::Idle {
                worker.status = WorkerStatus::Draining;
                to_drain -= 1;
            }
        }
    }

    /// Removes a worker entirely. Called once a DRAINING worker checks in,
    /// or once an UNHEALTHY worker has been replaced.
    pub async fn remove(&self, worker_id: &WorkerId) {
        self.workers.write().await.remove(worker_id);
        self.consecutive_health_failures.write().await.remove(worker_id);
    }

    pub async fn snapshot(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn idle_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedWorkerPool = Arc<WorkerPool>;

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str) -> Worker {
        Worker::new(WorkerId(id.to_string()))
    }

    #[tokio::test]
    async fn checkout_marks_worker_checked_out() {
        let pool = WorkerPool::new();
        pool.register(worker("w1")).await;
        let task_id = TaskId::new();
        let checked_out = pool.checkout(&WorkerRequirements, task_id).await.unwrap();
        let snapshot = pool.snapshot().await;
        let w = snapshot.iter().find(|w| w.worker_id == checked_out).unwrap();
        assert_eq!(w.status, WorkerStatus::CheckedOut);
        assert_eq!(w.current_task_id, Some(task_id));
    }

    #[tokio::test]
    async fn checkin_drains_worker_past_session_limit() {
        let pool = WorkerPool::new();
        let mut w = worker("w1");
        w.tasks_completed_since_restart = DEFAULT_SESSION_LIMIT - 1;
        pool.register(w).await;
        let task_id = TaskId::new();
        let id = pool.checkout(&WorkerRequirements, task_id).await.unwrap();
        pool.checkin(&id, true, DEFAULT_SESSION_LIMIT).await.unwrap();
        let snapshot = pool.snapshot().await;
        let w = snapshot.iter().find(|w| w.worker_id == id).unwrap();
        assert_eq!(w.status, WorkerStatus::Unhealthy);
    }

    #[tokio::test]
    async fn two_consecutive_health_failures_mark_unhealthy() {
        let pool = WorkerPool::new();
        pool.register(worker("w1")).await;
        let id = WorkerId("w1".to_string());
        pool.health_probe(&id, false).await.unwrap();
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].status, WorkerStatus::Idle);
        pool.health_probe(&id, false).await.unwrap();
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].status, WorkerStatus::Unhealthy);
    }

    #[tokio::test]
    async fn scale_down_marks_surplus_idle_workers_draining() {
        let pool = WorkerPool::new();
        pool.register(worker("w1")).await;
        pool.register(worker("w2")).await;
        pool.scale(1).await;
        let snapshot = pool.snapshot().await;
        let draining = snapshot.iter().filter(|w| w.status == WorkerStatus::Draining).count();
        assert_eq!(draining, 1);
    }

    #[tokio::test]
    async fn checkout_blocking_times_out_when_pool_empty() {
        let pool = WorkerPool::new();
        let result = pool
            .checkout_blocking(&WorkerRequirements, TaskId::new(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(MissionEngineError::ResourceExhaustion(_))));
    }
}
