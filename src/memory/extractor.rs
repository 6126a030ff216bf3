//! Procedure learning from transcripts.
//!
//! Human → agent exchanges whose reply lists at least three steps become
//! candidates. Candidates live in the scope's candidate file and gain weight
//! every time they are observed again (after half-life decay). Crossing the
//! usable weight makes a candidate eligible for prompt context; crossing the
//! permanent weight promotes it into `PROCEDURES.md`.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use regex::Regex;

use crate::config::AgentsConfig;
use crate::error::MemoryError;
use crate::memory::procedures::{
    self, Procedure, ProcedureStatus, STEP_PATTERN, normalize_text, tokenize, trigger_similarity,
};
use crate::memory::session::{Turn, TurnRole};
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "i", "in", "is", "it",
    "my", "of", "on", "or", "please", "the", "this", "to", "we", "with", "you",
];

const ACTION_VERBS: &[&str] = &[
    "add", "apply", "build", "check", "configure", "create", "deploy", "install", "open", "push",
    "reload", "restart", "review", "run", "save", "test", "update", "verify", "write",
];

const MIN_STEPS: usize = 3;
const MAX_STEPS: usize = 8;
const TRIGGER_TOKENS: usize = 5;

static SENTENCE_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\n.;]").expect("sentence pattern is valid"));

/// First five meaningful tokens of the human message.
pub fn derive_trigger(text: &str) -> String {
    let tokens = tokenize(text);
    let meaningful: Vec<&String> = tokens
        .iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect();
    let chosen: Vec<&str> = if meaningful.is_empty() {
        tokens.iter().map(String::as_str).take(TRIGGER_TOKENS).collect()
    } else {
        meaningful
            .into_iter()
            .map(String::as_str)
            .take(TRIGGER_TOKENS)
            .collect()
    };
    chosen.join(" ")
}

/// List items of a reply, or action-verb sentences when it has no list.
pub fn extract_steps(text: &str) -> Vec<String> {
    let listed: Vec<String> = text
        .lines()
        .filter_map(|line| STEP_PATTERN.captures(line))
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let steps = if listed.len() >= MIN_STEPS {
        listed
    } else {
        let mut steps = listed;
        for raw in SENTENCE_SPLIT.split(text) {
            let candidate = raw.trim_matches(|c: char| matches!(c, ' ' | '-' | '*' | '\t' | '\r'));
            let tokens = tokenize(candidate);
            if tokens.len() < 2 || !ACTION_VERBS.contains(&tokens[0].as_str()) {
                continue;
            }
            steps.push(candidate.to_string());
            if steps.len() >= MAX_STEPS {
                break;
            }
        }
        steps
    };

    let mut seen = std::collections::HashSet::new();
    steps
        .into_iter()
        .filter(|s| seen.insert(normalize_text(s)))
        .take(MAX_STEPS)
        .collect()
}

/// Candidates from every human turn directly answered by an agent turn.
pub fn extract_candidates(turns: &[Turn], today: NaiveDate) -> Vec<Procedure> {
    let mut pending_human: Option<&str> = None;
    let mut candidates = Vec::new();

    for turn in turns {
        let text = turn.text.trim();
        if text.is_empty() {
            continue;
        }
        match turn.role {
            TurnRole::Human => pending_human = Some(text),
            TurnRole::Agent => {
                let Some(question) = pending_human.take() else {
                    continue;
                };
                let trigger = derive_trigger(question);
                let steps = extract_steps(text);
                if trigger.is_empty() || steps.len() < MIN_STEPS {
                    continue;
                }
                candidates.push(Procedure::candidate(trigger, steps, today));
            }
            TurnRole::Summary => pending_human = None,
        }
    }
    candidates
}

/// What one learning pass changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LearnOutcome {
    /// Candidates mined from the turns.
    pub observed: usize,
    /// Triggers newly promoted to permanent.
    pub promoted: Vec<String>,
}

/// Weighted candidate learning backed by the document store.
pub struct ProcedureExtractor {
    store: Arc<dyn DocumentStore>,
    usable_weight: f64,
    permanent_weight: f64,
    similarity: f64,
}

impl ProcedureExtractor {
    pub fn new(store: Arc<dyn DocumentStore>, config: &AgentsConfig) -> Self {
        Self {
            store,
            usable_weight: config.procedure_usable_weight,
            permanent_weight: config.procedure_permanent_weight,
            similarity: config.procedure_similarity,
        }
    }

    /// Mine `turns` and fold the results into `scope`'s candidates.
    ///
    /// Callers must hold the scope's memory lock.
    pub async fn learn(
        &self,
        scope: &Scope,
        turns: &[Turn],
        today: NaiveDate,
    ) -> Result<LearnOutcome, MemoryError> {
        let mined = extract_candidates(turns, today);
        let mut outcome = LearnOutcome {
            observed: mined.len(),
            promoted: Vec::new(),
        };
        if mined.is_empty() {
            return Ok(outcome);
        }

        let mut candidates = self.load_candidates(scope).await?;
        let mut promoted = Vec::new();

        for candidate in mined {
            let existing_key = candidates
                .iter()
                .map(|(key, p)| (key.clone(), trigger_similarity(&p.trigger, &candidate.trigger)))
                .filter(|(_, score)| *score >= self.similarity)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(key, _)| key);

            let Some(key) = existing_key else {
                candidates.insert(candidate.key(), candidate);
                continue;
            };
            let Some(entry) = candidates.get_mut(&key) else {
                continue;
            };

            let was_permanent = entry.status == ProcedureStatus::Permanent;
            entry.weight = round2(entry.effective_weight(today) + 1.0);
            if candidate.steps.len() > entry.steps.len() {
                entry.steps = candidate.steps;
            }
            entry.last_seen = today;
            entry.status = if was_permanent || entry.weight >= self.permanent_weight {
                ProcedureStatus::Permanent
            } else if entry.weight >= self.usable_weight {
                ProcedureStatus::Usable
            } else {
                ProcedureStatus::Candidate
            };

            if entry.status == ProcedureStatus::Permanent && !was_permanent {
                promoted.push(entry.clone());
            }
        }

        self.save_candidates(scope, &candidates).await?;

        if !promoted.is_empty() {
            outcome.promoted = promoted.iter().map(|p| p.trigger.clone()).collect();
            let text = self
                .store
                .get_document(scope, DocumentKind::Procedures)
                .await?
                .unwrap_or_default();
            let mut permanent = procedures::parse_markdown(&text, today);
            procedures::upsert(&mut permanent, promoted, self.similarity);
            self.store
                .put_document(
                    scope,
                    DocumentKind::Procedures,
                    &procedures::render_markdown(&permanent),
                )
                .await?;
            tracing::info!(
                "Promoted {} procedure(s) to permanent in {}",
                outcome.promoted.len(),
                scope
            );
        }

        Ok(outcome)
    }

    /// Candidates whose decayed weight has reached the usable threshold.
    pub async fn usable(
        &self,
        scope: &Scope,
        today: NaiveDate,
    ) -> Result<Vec<Procedure>, MemoryError> {
        Ok(self
            .load_candidates(scope)
            .await?
            .into_values()
            .filter(|p| p.effective_weight(today) >= self.usable_weight)
            .collect())
    }

    async fn load_candidates(
        &self,
        scope: &Scope,
    ) -> Result<BTreeMap<String, Procedure>, MemoryError> {
        let Some(raw) = self
            .store
            .get_document(scope, DocumentKind::Candidates)
            .await?
        else {
            return Ok(BTreeMap::new());
        };
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                tracing::warn!("Discarding unreadable procedure candidates in {}: {}", scope, e);
                Ok(BTreeMap::new())
            }
        }
    }

    async fn save_candidates(
        &self,
        scope: &Scope,
        candidates: &BTreeMap<String, Procedure>,
    ) -> Result<(), MemoryError> {
        let mut text = serde_json::to_string_pretty(candidates)?;
        text.push('\n');
        self.store
            .put_document(scope, DocumentKind::Candidates, &text)
            .await
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::FileStore;
    use pretty_assertions::assert_eq;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn exchange() -> Vec<Turn> {
        vec![
            Turn::human("How do I deploy the staging service?"),
            Turn::agent("Sure:\n1. Build the image\n2. Push the image\n3. Restart the pods"),
        ]
    }

    #[test]
    fn test_derive_trigger_drops_stop_words() {
        assert_eq!(
            derive_trigger("How do I deploy the staging service please?"),
            "do deploy staging service"
        );
        assert_eq!(derive_trigger("the a"), "the a");
        assert_eq!(derive_trigger(""), "");
    }

    #[test]
    fn test_extract_steps_from_list() {
        let steps = extract_steps("Intro\n- one\n* two\n3) three\n- one");
        assert_eq!(steps, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_extract_steps_from_action_sentences() {
        let steps =
            extract_steps("Run the tests. Then relax; Check the logs. Deploy the build. ok");
        assert_eq!(steps, vec!["Run the tests", "Check the logs", "Deploy the build"]);
    }

    #[test]
    fn test_extract_candidates_pairs_turns() {
        let mut turns = exchange();
        turns.push(Turn::agent("1. a\n2. b\n3. c"));
        turns.push(Turn::human("thanks"));
        turns.push(Turn::agent("You're welcome"));

        let found = extract_candidates(&turns, day("2026-01-01"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].trigger, "do deploy staging service");
        assert_eq!(found[0].steps.len(), 3);
    }

    #[tokio::test]
    async fn test_learning_accumulates_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(dir.path()));
        let config = AgentsConfig::default();
        let extractor = ProcedureExtractor::new(store.clone(), &config);
        let scope = Scope::agent("a1");
        let today = day("2026-05-01");

        for _ in 0..2 {
            extractor.learn(&scope, &exchange(), today).await.unwrap();
        }
        assert!(extractor.usable(&scope, today).await.unwrap().is_empty());

        extractor.learn(&scope, &exchange(), today).await.unwrap();
        let usable = extractor.usable(&scope, today).await.unwrap();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].status, ProcedureStatus::Usable);

        let mut last = LearnOutcome::default();
        for _ in 0..7 {
            last = extractor.learn(&scope, &exchange(), today).await.unwrap();
        }
        assert_eq!(last.promoted, vec!["do deploy staging service".to_string()]);

        let md = store
            .get_document(&scope, DocumentKind::Procedures)
            .await
            .unwrap()
            .unwrap();
        let parsed = procedures::parse_markdown(&md, today);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].status, ProcedureStatus::Permanent);
    }

    #[tokio::test]
    async fn test_corrupt_candidates_are_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(dir.path()));
        let scope = Scope::agent("a1");
        store
            .put_document(&scope, DocumentKind::Candidates, "not json")
            .await
            .unwrap();

        let extractor = ProcedureExtractor::new(store, &AgentsConfig::default());
        let outcome = extractor
            .learn(&scope, &exchange(), day("2026-05-01"))
            .await
            .unwrap();
        assert_eq!(outcome.observed, 1);
    }
}
