use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mission_engine::{EventKind, MissionId, MissionStatus, MissionStore};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// `PUT /missions/{id}/schedule` body (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub trigger_time: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekly,
}

impl Recurrence {
    fn advance(self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Recurrence::Daily => from + chrono::Duration::days(1),
            Recurrence::Weekly => from + chrono::Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduleEntry {
    trigger_time: DateTime<Utc>,
    recurrence: Option<Recurrence>,
}

pub type ScheduleRegistry = Arc<RwLock<HashMap<MissionId, ScheduleEntry>>>;

pub async fn schedule_mission(registry: &ScheduleRegistry, mission_id: MissionId, request: ScheduleRequest) {
    registry.write().await.insert(
        mission_id,
        ScheduleEntry {
            trigger_time: request.trigger_time,
            recurrence: request.recurrence,
        },
    );
}

const SWEEP_INTERVAL_S: u64 = 5;

/// Periodic sweep promoting due PROPOSED missions to QUEUED, mirroring
/// `tandem-server/src/http.rs::serve`'s background `tokio::spawn` tasks
/// (reaper, routine scheduler) spawned alongside the listener.
pub fn spawn_schedule_sweep(store: Arc<MissionStore>, registry: ScheduleRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_S));
        loop {
            interval.tick().await;
            let now = Utc::now();
            let due: Vec<MissionId> = registry
                .read()
                .await
                .iter()
                .filter(|(_, entry)| entry.trigger_time <= now)
                .map(|(id, _)| *id)
                .collect();

            for mission_id in due {
                let Ok(mission) = store.get_mission(mission_id).await else {
                    registry.write().await.remove(&mission_id);
                    continue;
                };
                if mission.status == MissionStatus::Proposed {
                    let _ = store
                        .append_event(
                            mission_id,
                            EventKind::StatusChange,
                            serde_json::json!({"status": "QUEUED", "reason": "scheduled_trigger"}),
                        )
                        .await;
                }

                let mut guard = registry.write().await;
                match guard.get(&mission_id).and_then(|e| e.recurrence) {
                    Some(recurrence) => {
                        let next = recurrence.advance(now);
                        guard.insert(mission_id, ScheduleEntry { trigger_time: next, recurrence: Some(recurrence) });
                    }
                    None => {
                        guard.remove(&mission_id);
                    }
                }
            }
        }
    })
}
