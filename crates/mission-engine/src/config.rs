use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::model::ControlAction;

/// Recognized configuration keys and defaults (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionEngineConfig {
    pub max_missions_per_worker_session: u32,
    pub per_worker_memory_budget_mib: u64,
    pub max_steps_per_mission: u32,
    pub max_subgoals: usize,
    pub per_task_timeout_s: u64,
    pub mission_deadline_s: u64,
    pub retry_backoff_caps_s: Vec<u64>,
    pub importance_threshold: f64,
    pub high_risk_confidence_threshold: f64,
    pub approval_required_actions: HashSet<ControlAction>,
    pub autonomy_level: u8,
}

impl Default for MissionEngineConfig {
    fn default() -> Self {
        Self {
            max_missions_per_worker_session: 50,
            per_worker_memory_budget_mib: 400,
            max_steps_per_mission: 8,
            max_subgoals: 4,
            per_task_timeout_s: 120,
            mission_deadline_s: 3600,
            retry_backoff_caps_s: vec![2, 4, 8, 16, 30],
            importance_threshold: 0.6,
            high_risk_confidence_threshold: 0.7,
            approval_required_actions: [
                ControlAction::PauseMission,
                ControlAction::KillMission,
                ControlAction::PromoteForecast,
                ControlAction::LockDomain,
            ]
            .into_iter()
            .collect(),
            autonomy_level: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
}

/// Layered configuration store: global < project < env < runtime,
/// merged on read. Mirrors `tandem-core/src/config.rs::ConfigStore`,
/// trimmed to this crate's fixed key set (no provider/channel secrets
/// to scrub here).
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(project_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let project = read_json_file(&project_path).await.unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            global: empty_object(),
            project,
            env: env_layer(),
            runtime: empty_object(),
        };

        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> MissionEngineConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(MissionEngineConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<MissionEngineConfig> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get().await)
    }

    /// Runtime overrides apply for the life of the process only (e.g. an
    /// operator temporarily raising `autonomy_level` via an approved
    /// escalation event); never persisted to disk.
    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<MissionEngineConfig> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn env_layer() -> Value {
    let mut root = empty_object();
    if let Ok(raw) = std::env::var("MISSION_ENGINE_AUTONOMY_LEVEL") {
        if let Ok(level) = raw.trim().parse::<u8>() {
            deep_merge(&mut root, &json!({ "autonomy_level": level }));
        }
    }
    if let Ok(raw) = std::env::var("MISSION_ENGINE_MEMORY_BUDGET_MIB") {
        if let Ok(mib) = raw.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "per_worker_memory_budget_mib": mib }));
        }
    }
    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_match_spec_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json")).await.unwrap();
        let config = store.get().await;
        assert_eq!(config.max_missions_per_worker_session, 50);
        assert_eq!(config.retry_backoff_caps_s, vec![2, 4, 8, 16, 30]);
        assert_eq!(config.autonomy_level, 1);
    }

    #[tokio::test]
    async fn project_patch_overrides_default_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();
        store.patch_project(json!({ "max_subgoals": 2 })).await.unwrap();

        let reopened = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reopened.get().await.max_subgoals, 2);
    }

    #[tokio::test]
    async fn runtime_patch_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();
        store.patch_runtime(json!({ "autonomy_level": 3 })).await.unwrap();
        assert_eq!(store.get().await.autonomy_level, 3);

        let reopened = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reopened.get().await.autonomy_level, 1);
    }
}
