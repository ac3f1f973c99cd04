use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::model::{FeedbackAction, FeedbackRecord, FeedbackVerdict, HardConstraint, MissionId, ToolProfile, GLOBAL_DOMAIN};

/// Learning signals below this usefulness delta are discarded
/// (spec.md §6 `importance_threshold`, default 0.6).
pub const DEFAULT_IMPORTANCE_THRESHOLD: f64 = 0.6;

fn key(tool: &str, domain: &str) -> (String, String) {
    (tool.to_string(), domain.to_string())
}

/// Feeds outcome and human feedback signals into per-(tool, domain)
/// ToolProfiles, and answers usefulness queries the Router/Scheduler use
/// to weight task confidence. Grounded on `MissionStore`'s per-key
/// single-writer pattern (spec.md §5: "the same pair is serialized").
pub struct Scorer {
    profiles: RwLock<HashMap<(String, String), ToolProfile>>,
    writers: RwLock<HashMap<(String, String), Arc<Mutex<()>>>>,
    hard_constraints: RwLock<HashSet<(String, String)>>,
    seen_event_ids: RwLock<HashSet<String>>,
    surveyed_missions: RwLock<HashSet<MissionId>>,
}

impl Scorer {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            writers: RwLock::new(HashMap::new()),
            hard_constraints: RwLock::new(HashSet::new()),
            seen_event_ids: RwLock::new(HashSet::new()),
            surveyed_missions: RwLock::new(HashSet::new()),
        }
    }

    async fn writer_for(&self, k: &(String, String)) -> Arc<Mutex<()>> {
        if let Some(lock) = self.writers.read().await.get(k) {
            return lock.clone();
        }
        let mut guard = self.writers.write().await;
        guard.entry(k.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Updates both the specific (tool, domain) profile and the
    /// `_global` aggregate atomically with respect to other writers of
    /// the same pair. Deduplicates by `event_id` so replays or duplicate
    /// deliveries are a no-op (spec.md P9).
    pub async fn record_outcome(
        &self,
        event_id: &str,
        tool: &str,
        domain: &str,
        success: bool,
        latency_ms: f64,
        failure_mode: Option<String>,
    ) {
        {
            let mut seen = self.seen_event_ids.write().await;
            if !seen.insert(event_id.to_string()) {
                return;
            }
        }

        for k in [key(tool, domain), key(tool, GLOBAL_DOMAIN)] {
            let writer = self.writer_for(&k).await;
            let _guard = writer.lock().await;
            let mut profiles = self.profiles.write().await;
            let profile = profiles.entry(k).or_insert_with(ToolProfile::new);
            profile.total_calls += 1;
            if success {
                profile.successful_calls += 1;
            } else {
                profile.failed_calls += 1;
                if let Some(mode) = &failure_mode {
                    profile.record_failure_mode(mode.clone());
                }
            }
            let n = profile.total_calls as f64;
            profile.avg_latency_ms += (latency_ms - profile.avg_latency_ms) / n;
            profile.usefulness_score = base_usefulness(profile);
        }
    }

    /// Usefulness in `[0, 1]` for `(tool, domain)`, falling back to the
    /// `_global` aggregate if the pair has no recorded calls yet, then to
    /// the neutral prior if even that is empty (spec.md §4.6).
    pub async fn usefulness(&self, tool: &str, domain: &str) -> f64 {
        if self.hard_constraints.read().await.contains(&key(tool, domain)) {
            return 0.0;
        }

        let profiles = self.profiles.read().await;
        if let Some(profile) = profiles.get(&key(tool, domain)) {
            if profile.total_calls >= 1 {
                return profile.usefulness_score;
            }
        }
        profiles.get(&key(tool, GLOBAL_DOMAIN)).map(|p| p.usefulness_score).unwrap_or(0.5)
    }

    /// Whether a `NEVER_USE` FeedbackRecord is active for `(tool, domain)`.
    /// Checked by the Controller at dispatch time (spec.md §4.5), kept
    /// distinct from `usefulness` so a legitimately-earned score of 0.0
    /// is never confused with a hard constraint.
    pub async fn has_hard_constraint(&self, tool: &str, domain: &str) -> bool {
        self.hard_constraints.read().await.contains(&key(tool, domain))
    }

    /// Applies a human FeedbackRecord. `NEVER_USE` is a hard gate
    /// (usefulness pinned to 0); other actions scale the profile's score
    /// by the record's impact multiplier.
    pub async fn apply_feedback(&self, record: &FeedbackRecord) {
        let k = key(&record.tool_name, &record.domain);

        if record.hard_constraint == Some(HardConstraint::NeverUse) {
            self.hard_constraints.write().await.insert(k.clone());
            return;
        }

        let Some(impact) = record.impact else { return };
        let writer = self.writer_for(&k).await;
        let _guard = writer.lock().await;
        let mut profiles = self.profiles.write().await;
        let profile = profiles.entry(k).or_insert_with(ToolProfile::new);

        let scaled = match (record.verdict, record.action) {
            (FeedbackVerdict::Negative, _) | (_, FeedbackAction::Penalize) => {
                profile.usefulness_score * (1.0 - impact.clamp(0.0, 1.0))
            }
            (FeedbackVerdict::Positive, _) | (_, FeedbackAction::Boost) => {
                (profile.usefulness_score + impact.clamp(0.0, 1.0) * (1.0 - profile.usefulness_score)).min(1.0)
            }
            _ => profile.usefulness_score,
        };
        profile.usefulness_score = scaled.clamp(0.0, 1.0);
    }

    /// Survey nudge, applied once per mission (spec.md §4.6). Rating ≥ 8
    /// nudges +0.05; rating ≤ 5 nudges −0.10; 6-7 is neutral.
    pub async fn apply_survey(&self, mission_id: MissionId, tool: &str, domain: &str, rating: u8) {
        {
            let mut surveyed = self.surveyed_missions.write().await;
            if !surveyed.insert(mission_id) {
                return;
            }
        }

        let nudge = if rating >= 8 {
            0.05
        } else if rating <= 5 {
            -0.10
        } else {
            return;
        };

        let k = key(tool, domain);
        let writer = self.writer_for(&k).await;
        let _guard = writer.lock().await;
        let mut profiles = self.profiles.write().await;
        let profile = profiles.entry(k).or_insert_with(ToolProfile::new);
        profile.usefulness_score = (profile.usefulness_score + nudge).clamp(0.0, 1.0);
    }

    pub async fn profile(&self, tool: &str, domain: &str) -> Option<ToolProfile> {
        self.profiles.read().await.get(&key(tool, domain)).cloned()
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new()
    }
}

/// base success rate × confidence shrinkage, blended with a neutral
/// prior of 0.5 when samples are few (spec.md §4.6).
fn base_usefulness(profile: &ToolProfile) -> f64 {
    let success_rate = profile.successful_calls as f64 / profile.total_calls.max(1) as f64;
    let shrinkage = (profile.total_calls as f64 / 10.0).min(1.0);
    success_rate * shrinkage + 0.5 * (1.0 - shrinkage)
}

pub type SharedScorer = Arc<Scorer>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn few_samples_blend_toward_prior() {
        let scorer = Scorer::new();
        scorer.record_outcome("e1", "web_search", "research", true, 100.0, None).await;
        let score = scorer.usefulness("web_search", "research").await;
        assert!(score > 0.5 && score < 0.6);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_idempotent() {
        let scorer = Scorer::new();
        scorer.record_outcome("e1", "web_search", "research", true, 100.0, None).await;
        scorer.record_outcome("e1", "web_search", "research", true, 100.0, None).await;
        let profile = scorer.profile("web_search", "research").await.unwrap();
        assert_eq!(profile.total_calls, 1);
    }

    #[tokio::test]
    async fn unknown_pair_falls_back_to_global_then_prior() {
        let scorer = Scorer::new();
        assert_eq!(scorer.usefulness("brand_new_tool", "marketing").await, 0.5);
        scorer.record_outcome("e1", "shared_tool", "research", true, 50.0, None).await;
        let fallback = scorer.usefulness("shared_tool", "operations").await;
        assert!(fallback > 0.5);
    }

    #[tokio::test]
    async fn never_use_constraint_forces_zero_score() {
        let scorer = Scorer::new();
        scorer.record_outcome("e1", "web_search", "marketing", true, 50.0, None).await;
        let record = FeedbackRecord {
            feedback_id: "f1".into(),
            tool_name: "web_search".into(),
            domain: "marketing".into(),
            verdict: FeedbackVerdict::Negative,
            action: FeedbackAction::Constrain,
            impact: None,
            hard_constraint: Some(HardConstraint::NeverUse),
            reason: "never works for marketing".into(),
            timestamp: Utc::now(),
        };
        scorer.apply_feedback(&record).await;
        assert_eq!(scorer.usefulness("web_search", "marketing").await, 0.0);
    }

    #[tokio::test]
    async fn survey_nudge_applies_once_per_mission() {
        let scorer = Scorer::new();
        scorer.record_outcome("e1", "web_search", "research", true, 50.0, None).await;
        let before = scorer.usefulness("web_search", "research").await;
        let mission_id = MissionId::new();
        scorer.apply_survey(mission_id, "web_search", "research", 9).await;
        let after_first = scorer.usefulness("web_search", "research").await;
        scorer.apply_survey(mission_id, "web_search", "research", 9).await;
        let after_second = scorer.usefulness("web_search", "research").await;
        assert!(after_first > before);
        assert_eq!(after_first, after_second);
    }
}
