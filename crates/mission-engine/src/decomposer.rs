use serde::{Deserialize, Serialize};

use crate::model::Domain;

/// Ordering heuristic attached to a subgoal; not persisted on the [`Task`]
/// it produces, only used to decide dispatch order within a mission.
///
/// [`Task`]: crate::model::Task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgoalKind {
    Research,
    Analysis,
    Strategy,
    Synthesis,
    General,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgoal {
    pub text: String,
    pub kind: SubgoalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub is_composite: bool,
    pub domain: Domain,
    pub subgoals: Vec<Subgoal>,
}

pub const MAX_SUBGOALS: usize = 4;

/// Converts a free-text objective into Tasks. `classify` must be pure
/// (spec.md §4.2: "the classifier is pure (no I/O)") so it can be called
/// from any context, including from inside the store's writer lock.
pub trait Decomposer {
    fn classify(&self, objective: &str) -> Classification;
}

/// Deterministic keyword/pattern classifier over a closed vocabulary.
/// Grounded on `tandem-orchestrator::reducer`'s split between a trait and
/// a concrete default implementation.
pub struct KeywordDecomposer;

impl KeywordDecomposer {
    fn detect_domain(lower: &str) -> Domain {
        const MARKETING: &[&str] = &["campaign", "ad copy", "brand", "social post", "marketing"];
        const ENGINEERING: &[&str] = &["deploy", "bug", "api", "refactor", "build", "code"];
        const OPERATIONS: &[&str] = &["invoice", "schedule", "onboard", "provision", "ticket"];
        const RESEARCH: &[&str] = &["research", "compare", "summarize", "find", "extract", "analyze"];

        if MARKETING.iter().any(|kw| lower.contains(kw)) {
            Domain::Marketing
        } else if ENGINEERING.iter().any(|kw| lower.contains(kw)) {
            Domain::Engineering
        } else if OPERATIONS.iter().any(|kw| lower.contains(kw)) {
            Domain::Operations
        } else if RESEARCH.iter().any(|kw| lower.contains(kw)) {
            Domain::Research
        } else {
            Domain::Unknown
        }
    }

    fn subgoal_kind(clause: &str) -> SubgoalKind {
        let lower = clause.to_lowercase();
        if lower.contains("research") || lower.contains("find") || lower.contains("look up") {
            SubgoalKind::Research
        } else if lower.contains("compare") || lower.contains("analyze") || lower.contains("evaluate") {
            SubgoalKind::Analysis
        } else if lower.contains("plan") || lower.contains("strategy") || lower.contains("decide") {
            SubgoalKind::Strategy
        } else if lower.contains("summarize") || lower.contains("write") || lower.contains("draft") {
            SubgoalKind::Synthesis
        } else {
            SubgoalKind::General
        }
    }

    /// Splits on composite markers: "and then", "then", "and", numbered
    /// lists, and semicolons. Single-level only — a split clause is never
    /// re-split, matching the "no recursion" invariant.
    fn split_composite(objective: &str) -> Vec<String> {
        const MARKERS: &[&str] = &[" and then ", "; ", ", then ", " then "];

        let mut clauses = vec![objective.to_string()];
        for marker in MARKERS {
            clauses = clauses
                .into_iter()
                .flat_map(|clause| clause.split(marker).map(|s| s.trim().to_string()).collect::<Vec<_>>())
                .collect();
        }

        if clauses.len() == 1 {
            // No explicit marker; fall back to splitting on a bare " and "
            // only when it joins two verb-led clauses, to avoid shredding
            // objectives like "find pricing for widgets and gadgets".
            let parts: Vec<&str> = objective.splitn(2, " and ").collect();
            if parts.len() == 2 && starts_with_verb(parts[1]) {
                clauses = parts.into_iter().map(|s| s.trim().to_string()).collect();
            }
        }

        clauses.retain(|c| !c.is_empty());
        clauses
    }
}

/// Objective shapes with no explicit sequencing marker that still imply
/// the standard research→analysis→strategy project arc (spec.md §8's
/// "Composite sequential" scenario: a campaign/strategy objective with no
/// "and then"/"then"/";" in sight still decomposes into three subgoals).
const IMPLIED_PROJECT_MARKERS: &[&str] = &["campaign", "go-to-market", "launch plan"];

fn implied_project_phases(objective: &str, lower: &str) -> Option<Vec<Subgoal>> {
    if !IMPLIED_PROJECT_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }
    Some(vec![
        Subgoal {
            text: format!("Research context for: {objective}"),
            kind: SubgoalKind::Research,
        },
        Subgoal {
            text: format!("Analyze options for: {objective}"),
            kind: SubgoalKind::Analysis,
        },
        Subgoal {
            text: format!("Define strategy for: {objective}"),
            kind: SubgoalKind::Strategy,
        },
    ])
}

fn starts_with_verb(clause: &str) -> bool {
    const VERBS: &[&str] = &[
        "find", "research", "compare", "summarize", "write", "draft", "analyze", "evaluate",
        "extract", "schedule", "deploy", "provision", "plan", "send", "create", "update",
    ];
    let first_word = clause.trim().split_whitespace().next().unwrap_or("").to_lowercase();
    VERBS.contains(&first_word.as_str())
}

impl Decomposer for KeywordDecomposer {
    fn classify(&self, objective: &str) -> Classification {
        let lower = objective.to_lowercase();
        let domain = Self::detect_domain(&lower);
        let clauses = Self::split_composite(objective);

        if clauses.len() <= 1 {
            if let Some(subgoals) = implied_project_phases(objective, &lower) {
                return Classification {
                    is_composite: true,
                    domain,
                    subgoals,
                };
            }
            return Classification {
                is_composite: false,
                domain,
                subgoals: Vec::new(),
            };
        }

        let subgoals: Vec<Subgoal> = clauses
            .into_iter()
            .take(MAX_SUBGOALS)
            .map(|text| {
                let kind = Self::subgoal_kind(&text);
                Subgoal { text, kind }
            })
            .collect();

        Classification {
            is_composite: true,
            domain,
            subgoals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_objective_is_not_composite() {
        let c = KeywordDecomposer.classify("Extract the title from https://example.com");
        assert!(!c.is_composite);
        assert!(c.subgoals.is_empty());
        assert_eq!(c.domain, Domain::Research);
    }

    #[test]
    fn composite_objective_splits_and_caps_at_four() {
        let c = KeywordDecomposer.classify(
            "research competitor pricing; then summarize findings; then draft a memo; then schedule a review; then notify the team",
        );
        assert!(c.is_composite);
        assert_eq!(c.subgoals.len(), MAX_SUBGOALS);
    }

    #[test]
    fn subgoals_inherit_parent_domain() {
        let c = KeywordDecomposer.classify("research pricing and then draft a campaign brief");
        assert!(c.subgoals.iter().all(|_| c.domain == Domain::Research));
    }

    #[test]
    fn classification_is_deterministic() {
        let objective = "compare vendor A and vendor B then draft a recommendation";
        let first = KeywordDecomposer.classify(objective);
        let second = KeywordDecomposer.classify(objective);
        assert_eq!(first, second);
    }

    #[test]
    fn unrecognized_vocabulary_falls_back_to_unknown_domain() {
        let c = KeywordDecomposer.classify("xyzzy plugh");
        assert_eq!(c.domain, Domain::Unknown);
    }

    #[test]
    fn campaign_objective_implies_research_analysis_strategy_phases() {
        let c = KeywordDecomposer.classify("Design a marketing campaign for quantum computing startups");
        assert!(c.is_composite);
        assert_eq!(c.domain, Domain::Marketing);
        assert_eq!(
            c.subgoals.iter().map(|s| s.kind).collect::<Vec<_>>(),
            vec![SubgoalKind::Research, SubgoalKind::Analysis, SubgoalKind::Strategy]
        );
    }
}
