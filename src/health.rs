//! Portfolio health: per-domain severity, status derivation, cross-domain
//! alerts, and a deterministic snapshot hash.
//!
//! File stats fan out over a bounded thread pool (16 concurrent stats);
//! everything else is synchronous. The snapshot hash is computed over a
//! permutation-invariant projection, so re-ordering domains or relationships
//! never changes it.

use crate::error::Result;
use crate::hash::sha256_hex;
use crate::repo;
use crate::staleness::compute_staleness;
use crate::store::{iso_to_ms, now_iso, Store};
use crate::types::{DependencyType, StalenessLevel, Tier};
use rayon::prelude::*;
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Cap on concurrent filesystem stats.
const STAT_CONCURRENCY: usize = 16;

fn tier_mult(tier: Tier) -> i64 {
    match tier {
        Tier::Structural => 2,
        Tier::Status => 4,
        Tier::Intelligence => 3,
        Tier::General => 1,
    }
}

fn level_mult(level: StalenessLevel) -> i64 {
    match level {
        StalenessLevel::Fresh => 0,
        StalenessLevel::Stale => 1,
        StalenessLevel::Critical => 3,
    }
}

/// Per-deadline contribution, weighted by priority.
fn deadline_weight(priority: i64) -> i64 {
    match priority {
        1 | 2 => 4,
        3 | 4 => 2,
        _ => 1,
    }
}

const GAP_FLAG_WEIGHT: i64 = 2;
const DEADLINE_SEVERITY_CAP: i64 = 12;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LevelCounts {
    pub fresh: usize,
    pub stale: usize,
    pub critical: usize,
}

impl LevelCounts {
    fn bump(&mut self, level: StalenessLevel) {
        match level {
            StalenessLevel::Fresh => self.fresh += 1,
            StalenessLevel::Stale => self.stale += 1,
            StalenessLevel::Critical => self.critical += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StaleSummary {
    pub structural: LevelCounts,
    pub status: LevelCounts,
    pub intelligence: LevelCounts,
    pub total: LevelCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorstFile {
    pub path: String,
    pub tier: Tier,
    pub days: i64,
    pub level: StalenessLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainStatus {
    Active,
    Blocked,
    StaleRisk,
    Quiet,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Active => "active",
            DomainStatus::Blocked => "blocked",
            DomainStatus::StaleRisk => "stale-risk",
            DomainStatus::Quiet => "quiet",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainHealth {
    pub domain_id: String,
    pub name: String,
    pub severity: i64,
    pub status: DomainStatus,
    pub file_count_total: usize,
    pub stale_summary: StaleSummary,
    pub worst_file: Option<WorstFile>,
    pub open_gap_flags: usize,
    pub overdue_deadlines: usize,
    pub last_touched_at: Option<String>,
    /// Hard + soft outgoing edges as `(target_domain_id, dependency_type)`.
    pub outgoing_deps: Vec<(String, DependencyType)>,
    pub incoming_deps: Vec<(String, DependencyType)>,
}

impl DomainHealth {
    /// A structural block exists when structural- or status-tier files have
    /// gone critical; downstream hard dependents are marked blocked.
    pub fn has_structural_block(&self) -> bool {
        self.stale_summary.status.critical > 0 || self.stale_summary.structural.critical > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Monitor,
}

impl AlertSeverity {
    fn from_score(score: i64) -> Self {
        if score >= 7 {
            AlertSeverity::Critical
        } else if score >= 3 {
            AlertSeverity::Warning
        } else {
            AlertSeverity::Monitor
        }
    }

    /// One-step escalation with a ceiling at critical.
    fn escalate(self) -> Self {
        match self {
            AlertSeverity::Monitor => AlertSeverity::Warning,
            AlertSeverity::Warning | AlertSeverity::Critical => AlertSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioAlert {
    pub severity: AlertSeverity,
    pub source_domain_id: String,
    pub target_domain_id: String,
    pub dependency_type: DependencyType,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioHealth {
    pub domains: Vec<DomainHealth>,
    pub alerts: Vec<PortfolioAlert>,
    pub computed_at: String,
    pub snapshot_hash: String,
}

// ---------------------------------------------------------------------------
// Per-domain scoring
// ---------------------------------------------------------------------------

struct ScoredFile {
    path: String,
    tier: Tier,
    days: i64,
    level: StalenessLevel,
    mtime_ms: i64,
}

fn scored_tier(tier: Tier) -> bool {
    // General-tier files are skipped for stat cost; they rarely drive action.
    !matches!(tier, Tier::General)
}

fn stat_files(
    kb_path: &str,
    files: &[(String, Tier)],
    now_ms: i64,
) -> Vec<ScoredFile> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(STAT_CONCURRENCY.min(files.len().max(1)))
        .build();
    let stat_one = |(path, tier): &(String, Tier)| -> Option<ScoredFile> {
        let abs = std::path::Path::new(kb_path).join(path);
        let mtime = std::fs::metadata(&abs).ok()?.modified().ok()?;
        let mtime_ms = mtime.duration_since(std::time::UNIX_EPOCH).ok()?.as_millis() as i64;
        let staleness = compute_staleness(mtime_ms, None, *tier, now_ms);
        Some(ScoredFile {
            path: path.clone(),
            tier: *tier,
            days: staleness.days_since_update,
            level: staleness.level,
            mtime_ms,
        })
    };
    match pool {
        Ok(pool) => pool.install(|| files.par_iter().filter_map(stat_one).collect()),
        Err(_) => files.iter().filter_map(stat_one).collect(),
    }
}

fn pick_worst(scored: &[ScoredFile]) -> Option<WorstFile> {
    let mut worst: Option<(i64, WorstFile)> = None;
    for file in scored {
        if file.level == StalenessLevel::Fresh {
            continue;
        }
        let rank = tier_mult(file.tier) * 1000 + file.days;
        let is_worse = worst.as_ref().map(|(r, _)| rank > *r).unwrap_or(true);
        if is_worse {
            worst = Some((
                rank,
                WorstFile {
                    path: file.path.clone(),
                    tier: file.tier,
                    days: file.days,
                    level: file.level,
                },
            ));
        }
    }
    worst.map(|(_, w)| w)
}

fn scored_files_for_domain(
    store: &Store,
    domain_id: &str,
    kb_path: &str,
    now_ms: i64,
) -> Result<(usize, Vec<ScoredFile>)> {
    let files: Vec<(String, Tier)> = {
        let mut stmt = store
            .conn()
            .prepare("SELECT relative_path, tier FROM kb_files WHERE domain_id = ?1")?;
        let rows = stmt.query_map(params![domain_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (path, tier) = row?;
            out.push((path, Tier::parse(&tier).unwrap_or(Tier::General)));
        }
        out
    };
    let file_count_total = files.len();
    let scored_inputs: Vec<(String, Tier)> =
        files.into_iter().filter(|(_, tier)| scored_tier(*tier)).collect();
    Ok((file_count_total, stat_files(kb_path, &scored_inputs, now_ms)))
}

/// The domain's worst non-fresh scored-tier file, by
/// `tier_mult × 1000 + days`.
pub fn worst_kb_file(
    store: &Store,
    domain_id: &str,
    kb_path: &str,
    now_ms: i64,
) -> Result<Option<WorstFile>> {
    let (_, scored) = scored_files_for_domain(store, domain_id, kb_path, now_ms)?;
    Ok(pick_worst(&scored))
}

fn score_domain(
    store: &Store,
    domain_id: &str,
    name: &str,
    kb_path: &str,
    now_ms: i64,
    today: &str,
) -> Result<DomainHealth> {
    let (file_count_total, scored) = scored_files_for_domain(store, domain_id, kb_path, now_ms)?;

    let mut summary = StaleSummary::default();
    let mut severity = 0i64;
    let mut newest_mtime: Option<i64> = None;

    for file in &scored {
        severity += tier_mult(file.tier) * level_mult(file.level);
        match file.tier {
            Tier::Structural => summary.structural.bump(file.level),
            Tier::Status => summary.status.bump(file.level),
            Tier::Intelligence => summary.intelligence.bump(file.level),
            Tier::General => {}
        }
        summary.total.bump(file.level);
        newest_mtime = Some(newest_mtime.map_or(file.mtime_ms, |m| m.max(file.mtime_ms)));
    }
    let worst = pick_worst(&scored);

    let gap_flags = repo::list_gap_flags(store, domain_id)?;
    let open_gap_flags = gap_flags.iter().filter(|g| g.resolved_at.is_none()).count();
    severity += open_gap_flags as i64 * GAP_FLAG_WEIGHT;

    let overdue = repo::overdue_deadlines(store, domain_id, today)?;
    let deadline_severity: i64 = overdue.iter().map(|d| deadline_weight(d.priority)).sum();
    severity += deadline_severity.min(DEADLINE_SEVERITY_CAP);

    // Latest signal across scored mtimes and gap-flag lifecycle timestamps.
    let mut last_touched_ms = newest_mtime;
    for gap in &gap_flags {
        for ts in [Some(&gap.created_at), gap.resolved_at.as_ref()].into_iter().flatten() {
            if let Some(ms) = iso_to_ms(ts) {
                last_touched_ms = Some(last_touched_ms.map_or(ms, |m| m.max(ms)));
            }
        }
    }
    let last_touched_at = last_touched_ms.and_then(|ms| {
        chrono::DateTime::from_timestamp_millis(ms)
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    });

    Ok(DomainHealth {
        domain_id: domain_id.to_string(),
        name: name.to_string(),
        severity,
        status: DomainStatus::Active, // derived after all domains are scored
        file_count_total,
        stale_summary: summary,
        worst_file: worst,
        open_gap_flags,
        overdue_deadlines: overdue.len(),
        last_touched_at,
        outgoing_deps: Vec::new(),
        incoming_deps: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Portfolio computation
// ---------------------------------------------------------------------------

/// Compute the full portfolio snapshot at `now_ms`.
pub fn compute_portfolio_health(store: &Store, now_ms: i64) -> Result<PortfolioHealth> {
    let today = chrono::DateTime::from_timestamp_millis(now_ms)
        .map(|dt| dt.with_timezone(&chrono::Local).date_naive().to_string())
        .unwrap_or_default();

    let domains = repo::list_domains(store)?;
    let relationships = repo::list_all_relationships(store)?;

    let mut healths: Vec<DomainHealth> = Vec::with_capacity(domains.len());
    for domain in &domains {
        healths.push(score_domain(store, &domain.id, &domain.name, &domain.kb_path, now_ms, &today)?);
    }

    // Attach dependency edges, sorted for determinism.
    for health in healths.iter_mut() {
        let mut outgoing: Vec<(String, DependencyType)> = relationships
            .iter()
            .filter(|r| r.domain_id == health.domain_id)
            .map(|r| (r.sibling_domain_id.clone(), r.dependency_type))
            .collect();
        outgoing.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.as_str().cmp(b.1.as_str())));
        let mut incoming: Vec<(String, DependencyType)> = relationships
            .iter()
            .filter(|r| r.sibling_domain_id == health.domain_id)
            .map(|r| (r.domain_id.clone(), r.dependency_type))
            .collect();
        incoming.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.as_str().cmp(b.1.as_str())));
        health.outgoing_deps = outgoing;
        health.incoming_deps = incoming;
    }

    derive_statuses(&mut healths, now_ms);
    let alerts = build_alerts(&healths, &relationships);
    let snapshot_hash = snapshot_hash(&healths);

    debug!(domains = healths.len(), alerts = alerts.len(), "Portfolio health computed");
    Ok(PortfolioHealth { domains: healths, alerts, computed_at: now_iso(), snapshot_hash })
}

fn derive_statuses(healths: &mut [DomainHealth], now_ms: i64) {
    let blocks: BTreeMap<String, bool> = healths
        .iter()
        .map(|h| (h.domain_id.clone(), h.has_structural_block()))
        .collect();

    for health in healths.iter_mut() {
        let blocked = health
            .incoming_deps
            .iter()
            .any(|(source_id, dep)| dep.is_hard() && blocks.get(source_id).copied().unwrap_or(false));
        if blocked {
            health.status = DomainStatus::Blocked;
            continue;
        }

        let has_hard_outgoing = health.outgoing_deps.iter().any(|(_, dep)| dep.is_hard());
        if health.severity >= 3 && has_hard_outgoing {
            health.status = DomainStatus::StaleRisk;
            continue;
        }

        let days_since_touch = health
            .last_touched_at
            .as_deref()
            .and_then(iso_to_ms)
            .map(|ms| (now_ms - ms) / 86_400_000);
        let quiet = (health.severity == 0
            && !has_hard_outgoing
            && days_since_touch.map(|d| d > 14).unwrap_or(false))
            || (health.file_count_total == 0 && health.severity == 0)
            || (health.file_count_total > 0
                && health.last_touched_at.is_none()
                && health.severity == 0);
        health.status = if quiet { DomainStatus::Quiet } else { DomainStatus::Active };
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

fn build_alerts(
    healths: &[DomainHealth],
    relationships: &[crate::types::DomainRelationship],
) -> Vec<PortfolioAlert> {
    let by_id: BTreeMap<&str, &DomainHealth> =
        healths.iter().map(|h| (h.domain_id.as_str(), h)).collect();

    let mut alerts: Vec<PortfolioAlert> = Vec::new();
    for rel in relationships {
        if !rel.dependency_type.is_hard() {
            continue;
        }
        let (Some(source), Some(target)) = (
            by_id.get(rel.domain_id.as_str()),
            by_id.get(rel.sibling_domain_id.as_str()),
        ) else {
            continue;
        };
        if source.severity <= 0 {
            continue;
        }

        let base = AlertSeverity::from_score(source.severity);
        let severity = if rel.dependency_type == DependencyType::Blocks {
            base.escalate()
        } else {
            base
        };

        let lead = match &source.worst_file {
            Some(worst) => format!(
                "{} {} {}d stale ({} tier)",
                source.name,
                worst.path,
                worst.days,
                worst.tier.as_str()
            ),
            None => format!("{} severity score: {}", source.name, source.severity),
        };
        let verb = match rel.dependency_type {
            DependencyType::Blocks => "Blocks",
            _ => "Depended on by",
        };
        let described = match &rel.description {
            Some(desc) if !desc.is_empty() => format!("{verb} {}: '{desc}'", target.name),
            _ => format!("{verb} {}", target.name),
        };
        let mut message = format!("{lead}. {described}.");
        if target.open_gap_flags > 0 {
            message.push_str(&format!(
                " {} has {} open gap(s).",
                target.name, target.open_gap_flags
            ));
        }

        alerts.push(PortfolioAlert {
            severity,
            source_domain_id: rel.domain_id.clone(),
            target_domain_id: rel.sibling_domain_id.clone(),
            dependency_type: rel.dependency_type,
            message,
        });
    }

    // Severity first, then stable coordinates so input order never matters.
    alerts.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.source_domain_id.cmp(&b.source_domain_id))
            .then_with(|| a.target_domain_id.cmp(&b.target_domain_id))
    });
    alerts
}

// ---------------------------------------------------------------------------
// Snapshot hash
// ---------------------------------------------------------------------------

/// Canonical SHA-256 over a permutation-invariant projection of the
/// portfolio: domains sorted by id, dependency lists pre-sorted, object keys
/// emitted in sorted order.
pub fn snapshot_hash(healths: &[DomainHealth]) -> String {
    let mut ordered: Vec<&DomainHealth> = healths.iter().collect();
    ordered.sort_by(|a, b| a.domain_id.cmp(&b.domain_id));

    let projection: Vec<serde_json::Value> = ordered
        .iter()
        .map(|h| {
            json!({
                "id": h.domain_id,
                "stale_summary": h.stale_summary,
                "open_gap_flags": h.open_gap_flags,
                "overdue_deadlines": h.overdue_deadlines,
                "worst_file": h.worst_file.as_ref().map(|w| {
                    json!({ "path": w.path, "tier": w.tier.as_str(), "days": w.days })
                }),
                "outgoing_deps": h
                    .outgoing_deps
                    .iter()
                    .map(|(id, dep)| json!([id, dep.as_str()]))
                    .collect::<Vec<_>>(),
                "incoming_deps": h
                    .incoming_deps
                    .iter()
                    .map(|(id, dep)| json!([id, dep.as_str()]))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let canonical = serde_json::to_string(&projection).unwrap_or_default();
    sha256_hex(canonical.as_bytes())
}
