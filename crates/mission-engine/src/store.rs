use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::bus::MissionEventBus;
use crate::error::{MissionEngineError, Result};
use crate::model::{Domain, Event, EventKind, Mission, MissionId, MissionStatus, Task, TaskId};

/// Persisted snapshot of a mission and its tasks, rewritten atomically
/// on a cadence (see [`MissionStore::maybe_snapshot`]) rather than on
/// every event — the event log is the durable source of truth.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct MissionSnapshot {
    mission: Mission,
    tasks: Vec<Task>,
    last_sequence_number: u64,
    schema_version: u32,
}

const SCHEMA_VERSION: u32 = 1;
const DEDUP_WINDOW: i64 = 60;

/// Durable, strongly-ordered storage of Missions, Tasks, and Events;
/// authoritative projection of mission state; resumption after process
/// restart (spec.md §4.1).
pub struct MissionStore {
    base_dir: PathBuf,
    missions: RwLock<HashMap<MissionId, Mission>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    last_seq: RwLock<HashMap<MissionId, u64>>,
    writers: RwLock<HashMap<MissionId, Arc<Mutex<()>>>>,
    control_approved: RwLock<std::collections::HashSet<MissionId>>,
    bus: Arc<MissionEventBus>,
}

impl MissionStore {
    /// Opens (or creates) the store at `base_dir`, replaying every
    /// mission's event log to rebuild the in-memory projection.
    pub async fn open(base_dir: impl Into<PathBuf>, bus: Arc<MissionEventBus>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let store = Self {
            base_dir,
            missions: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            last_seq: RwLock::new(HashMap::new()),
            writers: RwLock::new(HashMap::new()),
            control_approved: RwLock::new(std::collections::HashSet::new()),
            bus,
        };
        store.replay_all().await?;
        Ok(store)
    }

    fn mission_dir(&self, mission_id: MissionId) -> PathBuf {
        self.base_dir.join(mission_id.to_string())
    }

    async fn writer_for(&self, mission_id: MissionId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.writers.read().await.get(&mission_id) {
            return lock.clone();
        }
        let mut guard = self.writers.write().await;
        guard
            .entry(mission_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn replay_all(&self) -> Result<()> {
        if !self.base_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(mission_id) = entry
                .file_name()
                .to_string_lossy()
                .parse::<uuid::Uuid>()
                .map(MissionId)
            else {
                continue;
            };
            self.replay_mission(mission_id).await?;
        }
        Ok(())
    }

    async fn replay_mission(&self, mission_id: MissionId) -> Result<()> {
        let snapshot_path = self.mission_dir(mission_id).join("snapshot.json");
        let mut last_seq = 0u64;

        if snapshot_path.exists() {
            let content = fs::read_to_string(&snapshot_path)?;
            let snapshot: MissionSnapshot = serde_json::from_str(&content)?;
            if snapshot.schema_version != SCHEMA_VERSION {
                return Err(MissionEngineError::StorageUnavailable(format!(
                    "mission {mission_id} snapshot schema_version {} unsupported",
                    snapshot.schema_version
                )));
            }
            last_seq = snapshot.last_sequence_number;
            self.missions.write().await.insert(mission_id, snapshot.mission);
            let mut tasks = self.tasks.write().await;
            for task in snapshot.tasks {
                tasks.insert(task.task_id, task);
            }
        }

        // Every event kind that mutates the projection on the live write
        // path (see `append_event`) must also replay here, or a restart
        // between snapshots silently drops that mutation.
        for event in self.read_log(mission_id)? {
            if event.sequence_number <= last_seq {
                continue;
            }
            last_seq = event.sequence_number;

            if let EventKind::MissionStart = event.event_kind {
                if !self.missions.read().await.contains_key(&mission_id) {
                    if let Ok(m) = serde_json::from_value::<Mission>(event.payload.clone()) {
                        self.missions.write().await.insert(mission_id, m);
                    }
                }
                continue;
            }

            self.apply_projection(mission_id, &event).await;
        }

        self.last_seq.write().await.insert(mission_id, last_seq);
        Ok(())
    }

    fn read_log(&self, mission_id: MissionId) -> Result<Vec<Event>> {
        let path = self.mission_dir(mission_id).join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        events.sort_by_key(|e: &Event| e.sequence_number);
        Ok(events)
    }

    /// Creates a PROPOSED mission and a MISSION_START event. Fails with
    /// `DuplicateMission` if an identical objective within the last 60s
    /// from the same owner is detected.
    pub async fn create_mission(
        &self,
        objective_text: String,
        owner_id: String,
        domain: Domain,
        initial_mode: crate::model::ExecutionMode,
    ) -> Result<MissionId> {
        {
            let missions = self.missions.read().await;
            let now = Utc::now();
            for mission in missions.values() {
                if mission.owner_id == owner_id
                    && mission.objective_text == objective_text
                    && now.signed_duration_since(mission.created_at) < Duration::seconds(DEDUP_WINDOW)
                {
                    return Err(MissionEngineError::DuplicateMission(objective_text));
                }
            }
        }

        let mut mission = Mission::new(objective_text, owner_id, domain);
        mission.execution_mode = initial_mode;
        let mission_id = mission.mission_id;

        fs::create_dir_all(self.mission_dir(mission_id))?;
        self.missions.write().await.insert(mission_id, mission.clone());

        self.append_event(
            mission_id,
            EventKind::MissionStart,
            serde_json::to_value(&mission)?,
        )
        .await?;

        Ok(mission_id)
    }

    /// Single serialized writer per mission; the event is written to
    /// the durable log first, then the in-memory projection updates.
    /// Assigns the next sequence number atomically with respect to
    /// other writers of the same mission.
    pub async fn append_event(
        &self,
        mission_id: MissionId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<u64> {
        let writer = self.writer_for(mission_id).await;
        let _guard = writer.lock().await;

        let is_audit = matches!(
            kind,
            EventKind::ControlSubmitted | EventKind::ControlApproved | EventKind::ControlRejected
        );
        if kind != EventKind::MissionStart {
            let missions = self.missions.read().await;
            match missions.get(&mission_id) {
                None => return Err(MissionEngineError::MissionNotFound(mission_id.to_string())),
                Some(m) if m.status.is_terminal() && !is_audit => {
                    return Err(MissionEngineError::MissionTerminal(mission_id.to_string()));
                }
                _ => {}
            }
        }

        let next_seq = {
            let mut seqs = self.last_seq.write().await;
            let seq = seqs.entry(mission_id).or_insert(0);
            *seq += 1;
            *seq
        };

        let event = Event {
            mission_id,
            sequence_number: next_seq,
            timestamp: Utc::now(),
            event_kind: kind,
            payload,
        };

        if let Err(e) = self.write_log_line(mission_id, &event) {
            // Durable write failed: roll back the sequence counter so a
            // retry does not leave a gap, and surface as fatal for this
            // mission without touching the projection.
            let mut seqs = self.last_seq.write().await;
            if let Some(seq) = seqs.get_mut(&mission_id) {
                *seq = seq.saturating_sub(1);
            }
            return Err(MissionEngineError::StorageUnavailable(e.to_string()));
        }

        self.apply_projection(mission_id, &event).await;
        self.bus.publish(mission_id, event.clone()).await;
        self.maybe_snapshot(mission_id).await?;

        Ok(next_seq)
    }

    fn write_log_line(&self, mission_id: MissionId, event: &Event) -> Result<()> {
        let dir = self.mission_dir(mission_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join("events.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    async fn apply_projection(&self, mission_id: MissionId, event: &Event) {
        if let EventKind::TaskUpdated = event.event_kind {
            if let Ok(task) = serde_json::from_value::<Task>(event.payload.clone()) {
                self.tasks.write().await.insert(task.task_id, task);
            }
            return;
        }
        if let EventKind::ControlApproved = event.event_kind {
            self.control_approved.write().await.insert(mission_id);
            return;
        }

        let mut missions = self.missions.write().await;
        let Some(mission) = missions.get_mut(&mission_id) else {
            return;
        };
        match event.event_kind {
            EventKind::TaskScheduled => {
                if let Some(task_id) = event
                    .payload
                    .get("task_id")
                    .and_then(|v| serde_json::from_value::<TaskId>(v.clone()).ok())
                {
                    if !mission.task_ids.contains(&task_id) {
                        mission.task_ids.push(task_id);
                    }
                }
            }
            EventKind::StatusChange => {
                if let Some(status) = event
                    .payload
                    .get("status")
                    .and_then(|v| serde_json::from_value::<MissionStatus>(v.clone()).ok())
                {
                    mission.status = status;
                }
            }
            EventKind::Progress => {
                if let Some(pct) = event.payload.get("progress_percent").and_then(|v| v.as_u64()) {
                    mission.progress_percent = pct.min(100) as u8;
                }
            }
            EventKind::MissionStop => {
                mission.progress_percent = 100;
            }
            _ => {}
        }
    }

    /// Snapshots every 50 events so a restart replays at most a bounded
    /// tail of the log, not the whole history.
    async fn maybe_snapshot(&self, mission_id: MissionId) -> Result<()> {
        const SNAPSHOT_EVERY: u64 = 50;
        let seq = *self.last_seq.read().await.get(&mission_id).unwrap_or(&0);
        if seq % SNAPSHOT_EVERY != 0 {
            return Ok(());
        }
        self.write_snapshot(mission_id, seq).await
    }

    async fn write_snapshot(&self, mission_id: MissionId, seq: u64) -> Result<()> {
        let mission = self
            .missions
            .read()
            .await
            .get(&mission_id)
            .cloned()
            .ok_or_else(|| MissionEngineError::MissionNotFound(mission_id.to_string()))?;
        let tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.mission_id == mission_id)
            .cloned()
            .collect();

        let snapshot = MissionSnapshot {
            mission,
            tasks,
            last_sequence_number: seq,
            schema_version: SCHEMA_VERSION,
        };
        let path = self.mission_dir(mission_id).join("snapshot.json");
        atomic_write(&path, &serde_json::to_string_pretty(&snapshot)?)
    }

    pub async fn get_mission(&self, mission_id: MissionId) -> Result<Mission> {
        self.missions
            .read()
            .await
            .get(&mission_id)
            .cloned()
            .ok_or_else(|| MissionEngineError::MissionNotFound(mission_id.to_string()))
    }

    /// Upserts a task's in-memory state and durably logs it as a
    /// `TASK_UPDATED` event, so a crash before the next snapshot can
    /// still reconstruct `status`/`attempt_count`/`assigned_worker_id`
    /// from the event log on replay.
    pub async fn put_task(&self, task: Task) -> Result<()> {
        let mission_id = task.mission_id;
        let task_id = task.task_id;
        self.tasks.write().await.insert(task_id, task.clone());
        if let Some(mission) = self.missions.write().await.get_mut(&mission_id) {
            if !mission.task_ids.contains(&task_id) {
                mission.task_ids.push(task_id);
            }
        }
        self.append_event(mission_id, EventKind::TaskUpdated, serde_json::to_value(&task)?)
            .await?;
        Ok(())
    }

    /// Missions with at least one `CONTROL_APPROVED` event in their log
    /// (spec.md §4.3 eligibility rule (e): HIGH-risk tasks require the
    /// mission's execution_mode to be LIVE *and* a CONTROL_APPROVED event
    /// on record).
    pub async fn control_approved_missions(&self) -> std::collections::HashSet<MissionId> {
        self.control_approved.read().await.clone()
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| MissionEngineError::MissionNotFound(task_id.to_string()))
    }

    pub async fn mission_tasks(&self, mission_id: MissionId) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.mission_id == mission_id)
            .cloned()
            .collect()
    }

    /// Lazy, finite, non-restartable iteration over missions matching `filter`.
    pub async fn list_missions(&self, filter: &MissionFilter) -> Vec<Mission> {
        self.missions
            .read()
            .await
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    pub async fn subscribe_events(&self, mission_id: MissionId) -> crate::bus::MissionEventStream {
        self.bus.subscribe(mission_id).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct MissionFilter {
    pub status: Option<MissionStatus>,
    pub owner_id: Option<String>,
    pub domain: Option<Domain>,
}

impl MissionFilter {
    fn matches(&self, mission: &Mission) -> bool {
        self.status.map(|s| s == mission.status).unwrap_or(true)
            && self
                .owner_id
                .as_ref()
                .map(|o| o == &mission.owner_id)
                .unwrap_or(true)
            && self.domain.map(|d| d == mission.domain).unwrap_or(true)
    }
}

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionMode;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, MissionStore) {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MissionEventBus::new());
        let store = MissionStore::open(dir.path(), bus).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_and_get_mission() {
        let (_dir, store) = store().await;
        let id = store
            .create_mission(
                "Extract title from https://example.com".into(),
                "owner-1".into(),
                Domain::Research,
                ExecutionMode::Live,
            )
            .await
            .unwrap();
        let mission = store.get_mission(id).await.unwrap();
        assert_eq!(mission.status, MissionStatus::Proposed);
        assert_eq!(mission.domain, Domain::Research);
    }

    #[tokio::test]
    async fn duplicate_objective_within_window_is_rejected() {
        let (_dir, store) = store().await;
        store
            .create_mission(
                "dup objective".into(),
                "owner-1".into(),
                Domain::Unknown,
                ExecutionMode::Mock,
            )
            .await
            .unwrap();
        let result = store
            .create_mission(
                "dup objective".into(),
                "owner-1".into(),
                Domain::Unknown,
                ExecutionMode::Mock,
            )
            .await;
        assert!(matches!(result, Err(MissionEngineError::DuplicateMission(_))));
    }

    #[tokio::test]
    async fn sequence_numbers_are_contiguous() {
        let (_dir, store) = store().await;
        let id = store
            .create_mission("seq test".into(), "owner-1".into(), Domain::Unknown, ExecutionMode::Mock)
            .await
            .unwrap();
        let seq2 = store
            .append_event(id, EventKind::Progress, serde_json::json!({"progress_percent": 10}))
            .await
            .unwrap();
        let seq3 = store
            .append_event(id, EventKind::Progress, serde_json::json!({"progress_percent": 20}))
            .await
            .unwrap();
        assert_eq!(seq2, 2);
        assert_eq!(seq3, 3);
    }

    #[tokio::test]
    async fn terminal_mission_rejects_non_audit_events() {
        let (_dir, store) = store().await;
        let id = store
            .create_mission("terminal test".into(), "owner-1".into(), Domain::Unknown, ExecutionMode::Mock)
            .await
            .unwrap();
        store
            .append_event(
                id,
                EventKind::StatusChange,
                serde_json::json!({"status": "KILLED"}),
            )
            .await
            .unwrap();
        let result = store
            .append_event(id, EventKind::TaskStarted, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(MissionEngineError::MissionTerminal(_))));
    }

    #[tokio::test]
    async fn replay_after_reopen_rebuilds_projection() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MissionEventBus::new());
        let id = {
            let store = MissionStore::open(dir.path(), bus.clone()).await.unwrap();
            let id = store
                .create_mission("persisted".into(), "owner-1".into(), Domain::Engineering, ExecutionMode::Mock)
                .await
                .unwrap();
            store
                .append_event(id, EventKind::Progress, serde_json::json!({"progress_percent": 42}))
                .await
                .unwrap();
            id
        };

        let reopened = MissionStore::open(dir.path(), bus).await.unwrap();
        let mission = reopened.get_mission(id).await.unwrap();
        assert_eq!(mission.progress_percent, 42);
    }

    #[tokio::test]
    async fn put_task_survives_reopen_without_a_snapshot() {
        use crate::model::{Task, TaskStatus};

        let dir = tempdir().unwrap();
        let bus = Arc::new(MissionEventBus::new());
        let (mission_id, task_id) = {
            let store = MissionStore::open(dir.path(), bus.clone()).await.unwrap();
            let mission_id = store
                .create_mission("crash test".into(), "owner-1".into(), Domain::Engineering, ExecutionMode::Mock)
                .await
                .unwrap();
            let mut task = Task::new(mission_id, "web_navigate.extract".into(), serde_json::json!({}));
            task.status = TaskStatus::Executing;
            task.attempt_count = 2;
            store.put_task(task.clone()).await.unwrap();
            (mission_id, task.task_id)
        };

        let reopened = MissionStore::open(dir.path(), bus).await.unwrap();
        let task = reopened.get_task(task_id).await.unwrap();
        assert_eq!(task.mission_id, mission_id);
        assert_eq!(task.status, TaskStatus::Executing);
        assert_eq!(task.attempt_count, 2);
    }
}
