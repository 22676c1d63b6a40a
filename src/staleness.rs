//! Tier classification and staleness scoring — pure functions on paths and
//! timestamps.

use crate::store::iso_to_ms;
use crate::types::{Staleness, StalenessBasis, StalenessLevel, Tier};

const DAY_MS: i64 = 86_400_000;

// ---------------------------------------------------------------------------
// Tier classification
// ---------------------------------------------------------------------------

/// Classify a KB file into a tier by its lowercased basename. Depends on
/// nothing but the basename.
pub fn classify_tier(relative_path: &str) -> Tier {
    let basename = relative_path.rsplit('/').next().unwrap_or(relative_path);
    match basename.to_lowercase().as_str() {
        "claude.md" => Tier::Structural,
        "kb_digest.md" => Tier::Status,
        "kb_intel.md" => Tier::Intelligence,
        _ => Tier::General,
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Per-tier thresholds in days: `(stale_at, critical_at)`.
fn thresholds(tier: Tier) -> (i64, i64) {
    match tier {
        Tier::Structural => (30, 90),
        Tier::Status => (7, 21),
        Tier::Intelligence => (14, 45),
        Tier::General => (14, 45),
    }
}

/// Compute staleness for a file. The semantic-update timestamp wins over the
/// filesystem mtime when it is present and parseable.
pub fn compute_staleness(
    mtime_ms: i64,
    last_semantic_update_at: Option<&str>,
    tier: Tier,
    now_ms: i64,
) -> Staleness {
    let (ref_ms, basis) = match last_semantic_update_at.and_then(iso_to_ms) {
        Some(semantic_ms) => (semantic_ms, StalenessBasis::Semantic),
        None => (mtime_ms, StalenessBasis::Mtime),
    };

    let days_since_update = ((now_ms - ref_ms) / DAY_MS).max(0);
    let (stale_at, critical_at) = thresholds(tier);
    let level = if days_since_update >= critical_at {
        StalenessLevel::Critical
    } else if days_since_update >= stale_at {
        StalenessLevel::Stale
    } else {
        StalenessLevel::Fresh
    };

    Staleness { level, days_since_update, basis }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tier_basename_only() {
        assert_eq!(classify_tier("CLAUDE.md"), Tier::Structural);
        assert_eq!(classify_tier("deep/nested/claude.md"), Tier::Structural);
        assert_eq!(classify_tier("kb_digest.md"), Tier::Status);
        assert_eq!(classify_tier("notes/KB_INTEL.md"), Tier::Intelligence);
        assert_eq!(classify_tier("notes/anything.md"), Tier::General);
        // Directory names must not leak into classification
        assert_eq!(classify_tier("claude.md/notes.md"), Tier::General);
    }

    #[test]
    fn test_staleness_thresholds_per_tier() {
        let now = 1_000 * DAY_MS;
        let at = |days: i64| now - days * DAY_MS;

        let s = compute_staleness(at(6), None, Tier::Status, now);
        assert_eq!(s.level, StalenessLevel::Fresh);
        let s = compute_staleness(at(7), None, Tier::Status, now);
        assert_eq!(s.level, StalenessLevel::Stale);
        let s = compute_staleness(at(21), None, Tier::Status, now);
        assert_eq!(s.level, StalenessLevel::Critical);

        let s = compute_staleness(at(29), None, Tier::Structural, now);
        assert_eq!(s.level, StalenessLevel::Fresh);
        let s = compute_staleness(at(45), None, Tier::Intelligence, now);
        assert_eq!(s.level, StalenessLevel::Critical);
        let s = compute_staleness(at(14), None, Tier::General, now);
        assert_eq!(s.level, StalenessLevel::Stale);
    }

    #[test]
    fn test_staleness_monotonic_in_days() {
        let now = 2_000 * DAY_MS;
        let mut last_rank = 0u8;
        for days in 0..120 {
            let s = compute_staleness(now - days * DAY_MS, None, Tier::Intelligence, now);
            let rank = match s.level {
                StalenessLevel::Fresh => 0,
                StalenessLevel::Stale => 1,
                StalenessLevel::Critical => 2,
            };
            assert!(rank >= last_rank, "level regressed at day {days}");
            assert_eq!(s.days_since_update, days);
            last_rank = rank;
        }
    }

    #[test]
    fn test_semantic_basis_wins_when_parseable() {
        let now = chrono::DateTime::parse_from_rfc3339("2026-07-01T00:00:00Z")
            .unwrap()
            .timestamp_millis();
        let mtime = now - 60 * DAY_MS;

        let s = compute_staleness(mtime, Some("2026-06-29T00:00:00Z"), Tier::Status, now);
        assert_eq!(s.basis, StalenessBasis::Semantic);
        assert_eq!(s.days_since_update, 2);
        assert_eq!(s.level, StalenessLevel::Fresh);

        // Unparseable semantic timestamp falls back to mtime
        let s = compute_staleness(mtime, Some("not-a-date"), Tier::Status, now);
        assert_eq!(s.basis, StalenessBasis::Mtime);
        assert_eq!(s.days_since_update, 60);
    }
}
