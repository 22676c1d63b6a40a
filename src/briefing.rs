//! Single-domain status briefing: since-window, ranked next actions, and
//! search hints for the status intent.

use crate::error::Result;
use crate::health;
use crate::repo;
use crate::store::Store;
use crate::synthesis::STOPWORDS;
use crate::types::Domain;
use serde::Serialize;
use std::collections::BTreeMap;

/// Max actions surfaced in a briefing.
const TOP_ACTIONS_CAP: usize = 5;
/// Max search hints emitted.
const SEARCH_HINTS_CAP: usize = 8;
/// Max chars per search hint keyword.
const KEYWORD_CHAR_CAP: usize = 24;

// Deadline action scoring
const DEADLINE_BASE: i64 = 60;
const DEADLINE_PER_DAY: i64 = 2;
const DEADLINE_PER_PRIORITY: i64 = 3;
const PRIORITY_MAX: i64 = 7;

// Gap-flag action scoring
const GAP_BASE: i64 = 40;
const GAP_AGE_DAYS: i64 = 14;
const GAP_AGE_BONUS: i64 = 6;
const GAP_DEFAULT_WEIGHT: i64 = 8;

// KB-staleness action scoring
const KB_BASE: i64 = 30;
const KB_MIN_WORST_DAYS: i64 = 14;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deadline,
    GapFlag,
    KbStaleness,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionItem {
    pub kind: ActionKind,
    pub label: String,
    pub priority_score: i64,
    /// Id of the backing row, when one exists.
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainBriefing {
    pub domain_id: String,
    pub domain_name: String,
    /// Start of the "what happened since" window: the last wrapped session's
    /// end, else the last session's start, else none.
    pub since_window: Option<String>,
    pub top_actions: Vec<ActionItem>,
    pub search_hints: Vec<String>,
}

// ---------------------------------------------------------------------------
// Category normalization
// ---------------------------------------------------------------------------

/// Normalize a gap-flag category: lowercase, letters only, singular, mapped
/// through the synonym table.
pub fn normalize_category(raw: &str) -> String {
    let lowered: String =
        raw.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()).collect();
    let singular = lowered.strip_suffix('s').unwrap_or(&lowered);
    match singular {
        "blocking" | "blocked" => "blocker",
        "decide" => "decision",
        "dep" | "dependencie" => "dependency",
        "unknown" => "question",
        "information" | "note" => "info",
        other => other,
    }
    .to_string()
}

fn category_weight(normalized: &str) -> i64 {
    match normalized {
        "blocker" => 20,
        "decision" => 15,
        "risk" => 12,
        "dependency" => 10,
        "question" => 8,
        "resource" => 7,
        "info" => 5,
        _ => GAP_DEFAULT_WEIGHT,
    }
}

// ---------------------------------------------------------------------------
// Keyword sanitization
// ---------------------------------------------------------------------------

fn sanitize_keyword(raw: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_lowercase();
    if stripped.chars().count() < 3 {
        return None;
    }
    // Pure numbers, including YYYYMMDD-shaped dates, carry no search signal
    if stripped.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if STOPWORDS.contains(&stripped.as_str()) {
        return None;
    }
    Some(stripped.chars().take(KEYWORD_CHAR_CAP).collect())
}

/// Up to `max` sanitized keywords from a free-text field, in order.
fn keywords_from(text: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    for token in text.split_whitespace() {
        if let Some(keyword) = sanitize_keyword(token) {
            if !out.contains(&keyword) {
                out.push(keyword);
                if out.len() == max {
                    break;
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Briefing
// ---------------------------------------------------------------------------

fn days_between_dates(earlier: &str, later: &str) -> i64 {
    let parse = |s: &str| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
    match (parse(earlier), parse(later)) {
        (Some(a), Some(b)) => (b - a).num_days(),
        _ => 0,
    }
}

fn age_days(created_at: &str, now_ms: i64) -> i64 {
    crate::store::iso_to_ms(created_at)
        .map(|ms| (now_ms - ms) / 86_400_000)
        .unwrap_or(0)
}

/// Build the status briefing for one domain.
pub fn build_briefing(store: &Store, domain: &Domain, now_ms: i64) -> Result<DomainBriefing> {
    let today = chrono::DateTime::from_timestamp_millis(now_ms)
        .map(|dt| dt.with_timezone(&chrono::Local).date_naive().to_string())
        .unwrap_or_default();

    let since_window = match repo::most_recent_wrapped_session(store, &domain.id)? {
        Some(session) => session.ended_at,
        None => repo::most_recent_session(store, &domain.id)?.map(|s| s.started_at),
    };

    // Candidate actions: overdue deadlines, open gap flags, KB staleness.
    let mut actions: Vec<ActionItem> = Vec::new();

    let overdue = repo::overdue_deadlines(store, &domain.id, &today)?;
    for deadline in &overdue {
        let days_overdue = days_between_dates(&deadline.due_date, &today).max(0);
        let priority = deadline.priority.clamp(1, PRIORITY_MAX);
        let score = DEADLINE_BASE
            + days_overdue * DEADLINE_PER_DAY
            + (PRIORITY_MAX + 1 - priority) * DEADLINE_PER_PRIORITY;
        actions.push(ActionItem {
            kind: ActionKind::Deadline,
            label: format!("Overdue: {} (due {}, P{})", deadline.text, deadline.due_date, priority),
            priority_score: score,
            source_id: Some(deadline.id.clone()),
        });
    }

    let open_gaps = repo::open_gap_flags(store, &domain.id)?;
    let mut gap_actions: Vec<ActionItem> = Vec::new();
    for gap in &open_gaps {
        let normalized = normalize_category(&gap.category);
        let age_bonus = if age_days(&gap.created_at, now_ms) > GAP_AGE_DAYS {
            GAP_AGE_BONUS
        } else {
            0
        };
        let score = GAP_BASE + category_weight(&normalized) + age_bonus;
        gap_actions.push(ActionItem {
            kind: ActionKind::GapFlag,
            label: format!("Open gap [{normalized}]: {}", gap.description),
            priority_score: score,
            source_id: Some(gap.id.clone()),
        });
    }
    actions.extend(gap_actions.iter().cloned());

    let worst = health::worst_kb_file(store, &domain.id, &domain.kb_path, now_ms)?;
    if let Some(worst) = &worst {
        if worst.days >= KB_MIN_WORST_DAYS {
            let score = KB_BASE + worst.days / 2;
            actions.push(ActionItem {
                kind: ActionKind::KbStaleness,
                label: format!(
                    "KB stale: {} is {}d old ({} tier)",
                    worst.path,
                    worst.days,
                    worst.tier.as_str()
                ),
                priority_score: score,
                source_id: None,
            });
        }
    }

    // Rank and slice; the stable sort keeps deadline > gap > staleness on
    // equal scores via insertion order.
    actions.sort_by_key(|a| std::cmp::Reverse(a.priority_score));
    let mut top_actions: Vec<ActionItem> = actions.into_iter().take(TOP_ACTIONS_CAP).collect();

    // Diversification guarantee: if gaps exist but none survived the slice,
    // the best gap takes the last slot.
    let has_gap_action = top_actions.iter().any(|a| a.kind == ActionKind::GapFlag);
    if !has_gap_action && !gap_actions.is_empty() && !top_actions.is_empty() {
        let best_gap =
            gap_actions.iter().max_by_key(|a| a.priority_score).cloned().unwrap();
        let last = top_actions.len() - 1;
        top_actions[last] = best_gap;
    }

    // Search hints: domain name, gap categories, deadline and decision
    // keywords, capped at 8.
    let mut search_hints: Vec<String> = vec![domain.name.clone()];

    let mut category_counts: BTreeMap<String, usize> = BTreeMap::new();
    for gap in &open_gaps {
        *category_counts.entry(normalize_category(&gap.category)).or_insert(0) += 1;
    }
    let mut ranked_categories: Vec<(String, usize)> = category_counts.into_iter().collect();
    ranked_categories.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (category, _) in ranked_categories.into_iter().take(3) {
        if !search_hints.contains(&category) {
            search_hints.push(category);
        }
    }

    for deadline in overdue.iter().take(2) {
        for keyword in keywords_from(&deadline.text, 2) {
            if !search_hints.contains(&keyword) {
                search_hints.push(keyword);
            }
        }
    }
    for decision in repo::recent_decisions(store, &domain.id, 2)? {
        for keyword in keywords_from(&decision.decision, 2) {
            if !search_hints.contains(&keyword) {
                search_hints.push(keyword);
            }
        }
    }
    search_hints.truncate(SEARCH_HINTS_CAP);

    Ok(DomainBriefing {
        domain_id: domain.id.clone(),
        domain_name: domain.name.clone(),
        since_window,
        top_actions,
        search_hints,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category("Blockers"), "blocker");
        assert_eq!(normalize_category("blocking"), "blocker");
        assert_eq!(normalize_category("Risks!"), "risk");
        assert_eq!(normalize_category("dependencies"), "dependency");
        assert_eq!(normalize_category("deps"), "dependency");
        assert_eq!(normalize_category("unknowns"), "question");
        assert_eq!(normalize_category("weird-thing"), "weirdthing");
    }

    #[test]
    fn test_category_weights() {
        assert_eq!(category_weight("blocker"), 20);
        assert_eq!(category_weight("info"), 5);
        assert_eq!(category_weight("anything-else"), GAP_DEFAULT_WEIGHT);
    }

    #[test]
    fn test_sanitize_keyword() {
        assert_eq!(sanitize_keyword("Ship!"), Some("ship".to_string()));
        assert_eq!(sanitize_keyword("a"), None, "too short");
        assert_eq!(sanitize_keyword("123"), None, "pure number");
        assert_eq!(sanitize_keyword("20260801"), None, "date-shaped");
        assert_eq!(sanitize_keyword("the"), None, "stopword");
        let long = "x".repeat(40);
        assert_eq!(sanitize_keyword(&long).unwrap().len(), KEYWORD_CHAR_CAP);
    }

    #[test]
    fn test_keywords_from_text() {
        let kws = keywords_from("Ship the migration plan by 2026-08-01", 2);
        assert_eq!(kws, vec!["ship", "migration"]);
    }

    #[test]
    fn test_days_between_dates() {
        assert_eq!(days_between_dates("2026-07-01", "2026-07-11"), 10);
        assert_eq!(days_between_dates("bogus", "2026-07-11"), 0);
    }
}
