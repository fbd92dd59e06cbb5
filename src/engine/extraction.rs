// ── Opsleuth Engine: Heuristic Extraction ──────────────────────────────────
//
// Two regex/heuristic passes, both best-effort and LLM-free:
//   • fact extraction — reusable facts auto-captured from specialist
//     responses into memory (user preferences, infrastructure knowledge)
//   • investigation summary — timeline, actions, key findings, and a
//     resolution status pulled from the final response text before it is
//     written back to the Investigations namespace

use crate::engine::memory::MemoryKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// ── Fact extraction ────────────────────────────────────────────────────────

/// Extract memorable facts from one specialist response.
/// Simple substring heuristics, no LLM call. Returns (content, kind) pairs
/// suitable for memory storage; at most one per category per response.
pub fn extract_memorable_facts(text: &str) -> Vec<(String, MemoryKind)> {
    let mut facts: Vec<(String, MemoryKind)> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim().trim_start_matches(['-', '*', ' ']);
        if trimmed.len() < 12 || trimmed.len() > 500 {
            continue;
        }
        let lower = trimmed.to_lowercase();

        // User preference statements
        let preference_patterns = [
            "prefers ", "prefer ", "user likes ", "wants to be notified",
            "notification preference", "preferred channel", "escalation contact",
        ];
        if facts.iter().all(|(_, k)| *k != MemoryKind::Preferences)
            && preference_patterns.iter().any(|p| lower.contains(p))
        {
            facts.push((trimmed.to_string(), MemoryKind::Preferences));
            continue;
        }

        // Durable facts about the user's systems
        let infra_patterns = [
            "runs on ", "deployed in ", "deployed to ", "depends on ",
            "cluster ", "namespace ", "the service ", "is backed by ",
            "talks to ", "replicas", "connection pool", "load balancer",
        ];
        if facts.iter().all(|(_, k)| *k != MemoryKind::Infrastructure)
            && infra_patterns.iter().any(|p| lower.contains(p))
        {
            facts.push((trimmed.to_string(), MemoryKind::Infrastructure));
        }
    }

    facts
}

// ── Investigation summary ──────────────────────────────────────────────────

/// Condensed record of one investigation, derived from the final response
/// text and appended to the Investigations namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationSummary {
    pub query: String,
    pub timeline: Vec<String>,
    pub actions_taken: Vec<String>,
    pub key_findings: Vec<String>,
    /// "resolved" | "mitigated" | "ongoing" | "inconclusive"
    pub resolution_status: String,
}

// Timestamps like "14:32", "2026-08-05 14:32", "14:32:07 UTC"
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}[ T])?\d{1,2}:\d{2}(:\d{2})?( ?(UTC|Z))?").unwrap()
});

// Numbered or bulleted list items
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+[.)]|[-*•])\s+(.+)$").unwrap());

const ACTION_VERBS: &[&str] = &[
    "restart", "restarted", "scale", "scaled", "rollback", "rolled back",
    "redeploy", "redeployed", "increase", "increased", "apply", "applied",
    "patch", "patched", "drain", "drained", "failover", "clear", "cleared",
];

const FINDING_MARKERS: &[&str] = &[
    "root cause", "caused by", "due to", "error", "failure", "oom",
    "crashloop", "exhausted", "saturated", "leak", "timeout", "misconfigured",
];

/// Derive an investigation summary from the final response text.
/// Every field is best-effort; an unparseable response yields empty lists
/// and an "inconclusive" status rather than an error.
pub fn extract_investigation_summary(query: &str, final_text: &str) -> InvestigationSummary {
    let mut timeline = Vec::new();
    let mut actions_taken = Vec::new();
    let mut key_findings = Vec::new();

    for line in final_text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let lower = trimmed.to_lowercase();

        if timeline.len() < 10 && TIMESTAMP_RE.is_match(trimmed) {
            timeline.push(trimmed.to_string());
            continue;
        }

        let is_list_item = LIST_ITEM_RE.is_match(trimmed);
        if actions_taken.len() < 10
            && is_list_item
            && ACTION_VERBS.iter().any(|v| lower.contains(v))
        {
            actions_taken.push(strip_list_marker(trimmed));
            continue;
        }

        if key_findings.len() < 10 && FINDING_MARKERS.iter().any(|m| lower.contains(m)) {
            key_findings.push(trimmed.to_string());
        }
    }

    InvestigationSummary {
        query: query.to_string(),
        timeline,
        actions_taken,
        key_findings,
        resolution_status: classify_resolution(final_text).to_string(),
    }
}

fn strip_list_marker(line: &str) -> String {
    LIST_ITEM_RE
        .captures(line)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| line.to_string())
}

fn classify_resolution(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if lower.contains("resolved") || lower.contains("fixed") || lower.contains("recovered") {
        "resolved"
    } else if lower.contains("mitigated") || lower.contains("workaround") {
        "mitigated"
    } else if lower.contains("ongoing") || lower.contains("still investigating") {
        "ongoing"
    } else {
        "inconclusive"
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_preference_fact() {
        let text = "The user prefers Slack notifications over email for alerts.";
        let facts = extract_memorable_facts(text);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].1, MemoryKind::Preferences);
    }

    #[test]
    fn test_extract_infrastructure_fact() {
        let text = "- The checkout service runs on cluster prod-east with 12 replicas.";
        let facts = extract_memorable_facts(text);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].1, MemoryKind::Infrastructure);
        assert!(facts[0].0.contains("checkout service"));
    }

    #[test]
    fn test_extract_at_most_one_per_category() {
        let text = "payments runs on prod-east.\ncheckout runs on prod-west.\n";
        let facts = extract_memorable_facts(text);
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn test_extract_nothing_from_noise() {
        let facts = extract_memorable_facts("OK.\nDone.\nNo issues found today.");
        assert!(facts.is_empty());
    }

    #[test]
    fn test_summary_extraction() {
        let final_text = "\
## Investigation Results\n\
14:02 UTC first 5xx spike observed\n\
14:10 UTC pod restarts began\n\
The root cause was an exhausted connection pool in the payments service.\n\
1. Restarted the payment-api deployment\n\
2. Increased the pool size to 50\n\
The incident is resolved and error rates are back to baseline.";

        let summary = extract_investigation_summary("payments 5xx spike", final_text);
        assert_eq!(summary.timeline.len(), 2);
        assert_eq!(summary.actions_taken.len(), 2);
        assert_eq!(summary.actions_taken[0], "Restarted the payment-api deployment");
        assert!(!summary.key_findings.is_empty());
        assert_eq!(summary.resolution_status, "resolved");
    }

    #[test]
    fn test_summary_inconclusive_on_noise() {
        let summary = extract_investigation_summary("q", "Nothing conclusive here.");
        assert!(summary.timeline.is_empty());
        assert!(summary.actions_taken.is_empty());
        assert_eq!(summary.resolution_status, "inconclusive");
    }

    #[test]
    fn test_summary_mitigated() {
        let summary =
            extract_investigation_summary("q", "A workaround is in place; full fix pending.");
        assert_eq!(summary.resolution_status, "mitigated");
    }
}
