//! Procedural memory.
//!
//! A procedure is a trigger phrase plus an ordered list of steps. Learned
//! procedures start as weighted candidates (see [`crate::memory::extractor`])
//! and are promoted into the scope's `PROCEDURES.md` once they have been
//! observed often enough. This module owns the procedure model, its markdown
//! format and trigger matching.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Numbered (`1.`, `2)`, `3:`) or bulleted (`-`, `*`) list item.
pub(crate) static STEP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+[\.\):]|[-*])\s+(.+?)\s*$").expect("step pattern is valid")
});

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("token pattern is valid"));

/// Minimum match score for a procedure to be offered for a query.
pub const MATCH_THRESHOLD: f64 = 0.45;

/// Procedures offered per scope for one query.
pub const MATCH_LIMIT: usize = 3;

/// Days for an unconfirmed candidate's weight to halve.
pub const DECAY_HALF_LIFE_DAYS: f64 = 30.0;

/// Learning stage of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureStatus {
    Candidate,
    Usable,
    Permanent,
}

impl ProcedureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureStatus::Candidate => "candidate",
            ProcedureStatus::Usable => "usable",
            ProcedureStatus::Permanent => "permanent",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "candidate" => Some(ProcedureStatus::Candidate),
            "usable" => Some(ProcedureStatus::Usable),
            "permanent" => Some(ProcedureStatus::Permanent),
            _ => None,
        }
    }
}

/// A repeatable multi-step action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub title: String,
    pub trigger: String,
    pub steps: Vec<String>,
    pub weight: f64,
    pub status: ProcedureStatus,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
}

impl Procedure {
    /// A freshly observed candidate.
    pub fn candidate(trigger: impl Into<String>, steps: Vec<String>, today: NaiveDate) -> Self {
        let trigger = trigger.into();
        Self {
            title: title_from_trigger(&trigger),
            trigger,
            steps,
            weight: 1.0,
            status: ProcedureStatus::Candidate,
            first_seen: today,
            last_seen: today,
        }
    }

    /// Normalised trigger used as the identity key.
    pub fn key(&self) -> String {
        normalize_text(&self.trigger)
    }

    /// Weight after half-life decay. Permanent procedures never decay.
    pub fn effective_weight(&self, today: NaiveDate) -> f64 {
        if self.status == ProcedureStatus::Permanent {
            return self.weight;
        }
        decay(self.weight, self.last_seen, today)
    }

    fn is_complete(&self) -> bool {
        !self.trigger.trim().is_empty() && !self.steps.is_empty()
    }
}

/// Exponential decay of `weight` since `last_seen`.
pub fn decay(weight: f64, last_seen: NaiveDate, today: NaiveDate) -> f64 {
    let days = (today - last_seen).num_days();
    if days <= 0 {
        return weight;
    }
    weight * 2f64.powf(-(days as f64) / DECAY_HALF_LIFE_DAYS)
}

pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let normalized = normalize_text(text);
    TOKEN_PATTERN
        .find_iter(&normalized)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn title_from_trigger(trigger: &str) -> String {
    let words: Vec<String> = normalize_text(trigger)
        .split(' ')
        .filter(|w| !w.is_empty())
        .take(6)
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        "Learned Procedure".to_string()
    } else {
        words.join(" ")
    }
}

// ==================== Similarity ====================

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    let total = a.union(b).count() as f64;
    shared / total
}

/// `1 - levenshtein / max_len` over characters.
fn edit_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    1.0 - prev[b.len()] as f64 / longest as f64
}

/// Similarity of two trigger phrases in `[0, 1]`.
pub fn trigger_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let ta: HashSet<String> = tokenize(&a).into_iter().collect();
    let tb: HashSet<String> = tokenize(&b).into_iter().collect();
    jaccard(&ta, &tb).max(edit_similarity(&a, &b))
}

/// How well a procedure's trigger matches a user query.
pub fn match_score(trigger: &str, query: &str) -> f64 {
    let trigger = normalize_text(trigger);
    let query = normalize_text(query);
    if trigger.is_empty() {
        return 0.0;
    }
    if query.contains(&trigger) {
        return 1.0;
    }
    if !query.is_empty() && trigger.contains(&query) {
        return 0.9;
    }

    let tq: HashSet<String> = tokenize(&query).into_iter().collect();
    let tt: HashSet<String> = tokenize(&trigger).into_iter().collect();
    jaccard(&tq, &tt).max(edit_similarity(&query, &trigger) * 0.8)
}

/// Best matching procedures for `query`, highest score first.
pub fn match_query<'a>(
    procedures: &'a [Procedure],
    query: &str,
    limit: usize,
) -> Vec<&'a Procedure> {
    let mut scored: Vec<(f64, &Procedure)> = procedures
        .iter()
        .map(|p| (match_score(&p.trigger, query), p))
        .filter(|(score, _)| *score >= MATCH_THRESHOLD)
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored
        .into_iter()
        .take(limit.max(1))
        .map(|(_, p)| p)
        .collect()
}

/// Merge `incoming` into `existing`, folding near-duplicate triggers.
///
/// An incoming procedure whose trigger is at least `threshold` similar to an
/// existing entry updates that entry: the longer step list wins, weight takes
/// the maximum, and `first_seen` is preserved.
pub fn upsert(existing: &mut Vec<Procedure>, incoming: Vec<Procedure>, threshold: f64) {
    for proc in incoming.into_iter().filter(Procedure::is_complete) {
        let best = existing
            .iter()
            .enumerate()
            .map(|(i, p)| (i, trigger_similarity(&p.trigger, &proc.trigger)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((index, _)) => {
                let current = &mut existing[index];
                if proc.steps.len() > current.steps.len() {
                    current.steps = proc.steps;
                }
                current.weight = current.weight.max(proc.weight);
                if proc.status == ProcedureStatus::Permanent {
                    current.status = ProcedureStatus::Permanent;
                }
                current.last_seen = current.last_seen.max(proc.last_seen);
            }
            None => existing.push(proc),
        }
    }
}

// ==================== Markdown format ====================

/// True when the document holds nothing but the optional `# PROCEDURES` header.
pub fn is_empty_document(content: &str) -> bool {
    let significant: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    match significant.as_slice() {
        [] => true,
        [only] => only.eq_ignore_ascii_case("# procedures"),
        _ => false,
    }
}

/// Parse `PROCEDURES.md`. Sections without steps are still returned.
pub fn parse_markdown(content: &str, today: NaiveDate) -> Vec<Procedure> {
    let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
    for line in content.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            sections.push((title.trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push(line);
        }
    }

    sections
        .into_iter()
        .filter(|(title, _)| !title.is_empty())
        .map(|(title, body)| parse_section(title, &body, today))
        .collect()
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim()
        .eq_ignore_ascii_case(name)
        .then_some(value.trim())
}

fn parse_section(title: String, body: &[&str], today: NaiveDate) -> Procedure {
    let mut trigger = String::new();
    let mut weight: Option<f64> = None;
    let mut status = None;
    let mut first_seen = None;
    let mut last_seen = None;
    let mut steps = Vec::new();
    let mut in_steps = false;

    for raw in body {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(v) = field(line, "trigger") {
            trigger = v.to_string();
            in_steps = false;
        } else if let Some(v) = field(line, "weight") {
            weight = Some(v.parse::<f64>().map(|w| w.max(0.0)).unwrap_or(1.0));
            in_steps = false;
        } else if let Some(v) = field(line, "frequency") {
            // Older files counted observations instead of weighting them.
            if weight.is_none() {
                weight = Some(v.parse::<u32>().map(|f| f.max(1) as f64).unwrap_or(1.0));
            }
            in_steps = false;
        } else if let Some(v) = field(line, "status") {
            status = ProcedureStatus::parse(v);
            in_steps = false;
        } else if let Some(v) = field(line, "first seen") {
            first_seen = NaiveDate::parse_from_str(v, "%Y-%m-%d").ok();
            in_steps = false;
        } else if let Some(v) = field(line, "last seen") {
            last_seen = NaiveDate::parse_from_str(v, "%Y-%m-%d").ok();
            in_steps = false;
        } else if line.to_lowercase().starts_with("steps:") {
            in_steps = true;
        } else if in_steps {
            if let Some(caps) = STEP_PATTERN.captures(line) {
                steps.push(caps[1].trim().to_string());
            }
        }
    }

    let last_seen = last_seen.unwrap_or(today);
    Procedure {
        trigger: if trigger.is_empty() {
            title.clone()
        } else {
            trigger
        },
        title,
        steps,
        weight: weight.unwrap_or(1.0),
        // Hand-written entries in PROCEDURES.md are treated as permanent.
        status: status.unwrap_or(ProcedureStatus::Permanent),
        first_seen: first_seen.unwrap_or(last_seen),
        last_seen,
    }
}

/// Render procedures as `PROCEDURES.md`, sorted by title then trigger.
pub fn render_markdown(procedures: &[Procedure]) -> String {
    let mut items: Vec<&Procedure> = procedures.iter().filter(|p| p.is_complete()).collect();
    items.sort_by_key(|p| (p.title.to_lowercase(), p.trigger.to_lowercase()));

    let mut out = String::from("# PROCEDURES\n\n");
    for p in items {
        out.push_str(&format!("## {}\n", p.title));
        out.push_str(&format!("Trigger: {}\n", p.trigger));
        out.push_str(&format!("Weight: {:.1}\n", p.weight));
        out.push_str(&format!("Status: {}\n", p.status.as_str()));
        out.push_str(&format!("First seen: {}\n", p.first_seen.format("%Y-%m-%d")));
        out.push_str(&format!("Last seen: {}\n", p.last_seen.format("%Y-%m-%d")));
        out.push_str("\nSteps:\n");
        for (i, step) in p.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out.push('\n');
    }
    format!("{}\n", out.trim_end())
}

/// Render only the procedures relevant to one turn, for prompt context.
pub fn render_for_context(procedures: &[&Procedure]) -> String {
    procedures
        .iter()
        .map(|p| {
            let steps: Vec<String> = p
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| format!("{}. {}", i + 1, s))
                .collect();
            format!("## {}\nTrigger: {}\n{}", p.title, p.trigger, steps.join("\n"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn deploy() -> Procedure {
        let mut p = Procedure::candidate(
            "deploy staging service",
            vec!["build image".into(), "push image".into(), "restart pods".into()],
            day("2026-01-01"),
        );
        p.weight = 10.0;
        p.status = ProcedureStatus::Permanent;
        p
    }

    #[test]
    fn test_markdown_roundtrip_keeps_fields() {
        let text = render_markdown(&[deploy()]);
        assert!(text.starts_with("# PROCEDURES\n\n## Deploy Staging Service\n"));
        assert!(text.contains("Weight: 10.0\n"));
        assert!(text.contains("Steps:\n1. build image\n2. push image\n3. restart pods\n"));

        let parsed = parse_markdown(&text, day("2026-06-01"));
        assert_eq!(parsed, vec![deploy()]);
    }

    #[test]
    fn test_parse_legacy_frequency_and_defaults() {
        let text = "## Release\nTrigger: cut a release\nFrequency: 4\nSteps:\n- tag\n- push\n";
        let parsed = parse_markdown(text, day("2026-02-02"));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].weight, 4.0);
        assert_eq!(parsed[0].status, ProcedureStatus::Permanent);
        assert_eq!(parsed[0].steps, vec!["tag", "push"]);
        assert_eq!(parsed[0].first_seen, day("2026-02-02"));
    }

    #[test]
    fn test_is_empty_document() {
        assert!(is_empty_document(""));
        assert!(is_empty_document("# PROCEDURES\n\n"));
        assert!(!is_empty_document("just some notes"));
    }

    #[test]
    fn test_decay_half_life() {
        let w = decay(4.0, day("2026-01-01"), day("2026-01-31"));
        assert!((w - 2.0).abs() < 1e-9);
        assert_eq!(decay(4.0, day("2026-01-31"), day("2026-01-01")), 4.0);

        let mut p = deploy();
        assert_eq!(p.effective_weight(day("2027-01-01")), 10.0);
        p.status = ProcedureStatus::Usable;
        assert!(p.effective_weight(day("2027-01-01")) < 1.0);
    }

    #[test]
    fn test_trigger_similarity() {
        assert_eq!(trigger_similarity("Deploy  Staging", "deploy staging"), 1.0);
        assert!(trigger_similarity("deploy staging service", "deploy staging services") > 0.8);
        assert!(trigger_similarity("deploy staging", "bake bread") < 0.5);
        assert_eq!(edit_similarity("kitten", "sitting"), 1.0 - 3.0 / 7.0);
    }

    #[test]
    fn test_match_query_scores_and_limits() {
        let procs = vec![
            deploy(),
            Procedure::candidate(
                "rotate api keys",
                vec!["a".into(), "b".into(), "c".into()],
                day("2026-01-01"),
            ),
        ];

        let hits = match_query(&procs, "please deploy staging service now", MATCH_LIMIT);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].trigger, "deploy staging service");

        assert!(match_query(&procs, "what is the weather", MATCH_LIMIT).is_empty());
    }

    #[test]
    fn test_upsert_folds_similar_triggers() {
        let mut existing = vec![deploy()];
        let mut incoming = Procedure::candidate(
            "deploy staging services",
            vec![
                "build image".into(),
                "push image".into(),
                "migrate db".into(),
                "restart pods".into(),
            ],
            day("2026-03-01"),
        );
        incoming.weight = 3.0;

        upsert(&mut existing, vec![incoming], 0.8);
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].steps.len(), 4);
        assert_eq!(existing[0].weight, 10.0);
        assert_eq!(existing[0].first_seen, day("2026-01-01"));
        assert_eq!(existing[0].last_seen, day("2026-03-01"));

        let other = Procedure::candidate(
            "bake sourdough bread",
            vec!["mix".into(), "proof".into(), "bake".into()],
            day("2026-03-01"),
        );
        upsert(&mut existing, vec![other], 0.8);
        assert_eq!(existing.len(), 2);
    }
}
