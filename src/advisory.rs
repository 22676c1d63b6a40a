//! Advisory artifact repository.
//!
//! Inserts are idempotent on `(domain_id, fingerprint)`; LLM-sourced saves
//! are rate-limited per domain (hourly and local-calendar-day caps) with
//! human-readable rejection messages.

use crate::error::{CoreError, Result};
use crate::store::{new_id, now_iso, Store};
use crate::types::{AdvisoryArtifact, AdvisorySource, AdvisoryStatus};
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use rusqlite::{params, Row};
use tracing::warn;

/// Per-domain cap on LLM-sourced artifact saves per rolling hour.
pub const HOURLY_LIMIT: usize = 10;
/// Per-domain cap on LLM-sourced artifact saves per local calendar day.
pub const DAILY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct AdvisoryInput {
    pub domain_id: String,
    pub artifact_type: String,
    pub title: String,
    pub content: serde_json::Value,
    pub fingerprint: Option<String>,
    pub source: AdvisorySource,
    pub status: AdvisoryStatus,
    pub schema_version: i64,
}

const ARTIFACT_COLS: &str = "id, domain_id, artifact_type, title, content, fingerprint, source, \
                             status, schema_version, created_at, updated_at";

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<(AdvisoryArtifact, String, String)> {
    let content: String = row.get(4)?;
    let source: String = row.get(6)?;
    let status: String = row.get(7)?;
    Ok((
        AdvisoryArtifact {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            artifact_type: row.get(2)?,
            title: row.get(3)?,
            content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
            fingerprint: row.get(5)?,
            source: AdvisorySource::Llm,     // patched below
            status: AdvisoryStatus::Active,  // patched below
            schema_version: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        },
        source,
        status,
    ))
}

fn finish_artifact(raw: (AdvisoryArtifact, String, String)) -> Result<AdvisoryArtifact> {
    let (mut artifact, source, status) = raw;
    artifact.source = AdvisorySource::parse(&source)
        .ok_or_else(|| CoreError::parse(format!("bad advisory source: {source}")))?;
    artifact.status = AdvisoryStatus::parse(&status)
        .ok_or_else(|| CoreError::parse(format!("bad advisory status: {status}")))?;
    Ok(artifact)
}

fn lookup_by_fingerprint(
    store: &Store,
    domain_id: &str,
    fingerprint: &str,
) -> Result<Option<AdvisoryArtifact>> {
    let raw = store
        .conn()
        .query_row(
            &format!(
                "SELECT {ARTIFACT_COLS} FROM advisory_artifacts
                 WHERE domain_id = ?1 AND fingerprint = ?2"
            ),
            params![domain_id, fingerprint],
            row_to_artifact,
        )
        .ok();
    raw.map(finish_artifact).transpose()
}

/// The local calendar day an RFC 3339 timestamp falls on. Deployments that
/// need UTC day boundaries override here.
fn local_day(ts: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(ts).ok().map(|dt| dt.with_timezone(&Local).date_naive())
}

fn check_llm_rate_limits(store: &Store, domain_id: &str) -> Result<()> {
    let hour_cutoff = (Utc::now() - Duration::hours(1))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let hourly: i64 = store.conn().query_row(
        "SELECT COUNT(*) FROM advisory_artifacts
         WHERE domain_id = ?1 AND source = 'llm' AND created_at >= ?2",
        params![domain_id, hour_cutoff],
        |row| row.get(0),
    )?;
    if hourly as usize >= HOURLY_LIMIT {
        return Err(CoreError::validation(format!(
            "[Advisory] Not saved: hourly save limit reached ({HOURLY_LIMIT}/hour)."
        )));
    }

    // Day boundary is the user's local timezone; scan a two-day window and
    // bucket by local date.
    let day_cutoff =
        (Utc::now() - Duration::hours(48)).to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let mut stmt = store.conn().prepare(
        "SELECT created_at FROM advisory_artifacts
         WHERE domain_id = ?1 AND source = 'llm' AND created_at >= ?2",
    )?;
    let rows = stmt.query_map(params![domain_id, day_cutoff], |row| row.get::<_, String>(0))?;
    let today = Local::now().date_naive();
    let mut daily = 0usize;
    for row in rows {
        if local_day(&row?) == Some(today) {
            daily += 1;
        }
    }
    if daily >= DAILY_LIMIT {
        return Err(CoreError::validation(format!(
            "[Advisory] Not saved: daily save limit reached ({DAILY_LIMIT}/day)."
        )));
    }
    Ok(())
}

/// Insert an artifact.
///
/// Order of operations: fingerprint dedupe (idempotent success), LLM rate
/// limits, insert. A UNIQUE race on the fingerprint index resolves to the
/// winner's row.
pub fn insert_artifact(store: &Store, input: AdvisoryInput) -> Result<AdvisoryArtifact> {
    let title_len = input.title.chars().count();
    if !(4..=120).contains(&title_len) {
        return Err(CoreError::validation(format!(
            "advisory title must be 4-120 chars, got {title_len}"
        )));
    }
    if input.schema_version != 1 {
        return Err(CoreError::validation(format!(
            "unsupported advisory schema_version: {}",
            input.schema_version
        )));
    }

    if let Some(fingerprint) = &input.fingerprint {
        if let Some(existing) = lookup_by_fingerprint(store, &input.domain_id, fingerprint)? {
            if existing.status != input.status {
                warn!(
                    fingerprint = %fingerprint,
                    stored = existing.status.as_str(),
                    incoming = input.status.as_str(),
                    "Duplicate advisory fingerprint with different status, keeping stored"
                );
            }
            return Ok(existing);
        }
    }

    if input.source == AdvisorySource::Llm {
        check_llm_rate_limits(store, &input.domain_id)?;
    }

    let id = new_id();
    let now = now_iso();
    let inserted = store.conn().execute(
        "INSERT INTO advisory_artifacts
           (id, domain_id, artifact_type, title, content, fingerprint, source, status,
            schema_version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id,
            input.domain_id,
            input.artifact_type,
            input.title,
            serde_json::to_string(&input.content)?,
            input.fingerprint,
            input.source.as_str(),
            input.status.as_str(),
            input.schema_version,
            now,
        ],
    );

    match inserted {
        Ok(_) => get_artifact(store, &id),
        Err(e) => {
            let core: CoreError = e.into();
            if core.is_constraint() {
                if let Some(fingerprint) = &input.fingerprint {
                    if let Some(existing) =
                        lookup_by_fingerprint(store, &input.domain_id, fingerprint)?
                    {
                        return Ok(existing);
                    }
                }
            }
            Err(core)
        }
    }
}

pub fn get_artifact(store: &Store, id: &str) -> Result<AdvisoryArtifact> {
    let raw = store
        .conn()
        .query_row(
            &format!("SELECT {ARTIFACT_COLS} FROM advisory_artifacts WHERE id = ?1"),
            params![id],
            row_to_artifact,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::not_found("advisory artifact", id),
            other => other.into(),
        })?;
    finish_artifact(raw)
}

pub fn list_artifacts(store: &Store, domain_id: &str) -> Result<Vec<AdvisoryArtifact>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {ARTIFACT_COLS} FROM advisory_artifacts
         WHERE domain_id = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params![domain_id], row_to_artifact)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_artifact(row?)?);
    }
    Ok(out)
}

pub fn set_artifact_status(
    store: &Store,
    id: &str,
    status: AdvisoryStatus,
) -> Result<AdvisoryArtifact> {
    let changed = store.conn().execute(
        "UPDATE advisory_artifacts SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_iso(), id],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found("advisory artifact", id));
    }
    get_artifact(store, id)
}
