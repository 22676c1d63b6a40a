//! Repositories: CRUD over domains, relationships, deadlines, gap flags,
//! sessions, decisions, tags, plugins, and installed commands.
//!
//! Conventions: validation runs before any DB I/O and fails with typed
//! `VALIDATION_ERROR`s; `get_by_id` misses are typed `NOT_FOUND`, never null;
//! list methods iterate in deterministic order; any mutation touching more
//! than one row runs in a transaction.

use crate::error::{CoreError, Result};
use crate::store::{new_id, now_iso, Store};
use crate::types::*;
use rusqlite::{params, Row};
use tracing::warn;

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NewDomain {
    pub name: String,
    pub description: String,
    pub kb_path: String,
    pub identity: Option<String>,
    pub escalation_triggers: Option<String>,
    pub allow_gmail: bool,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub force_tool_attempt: bool,
    pub sort_order: Option<i64>,
}

/// Default model per provider, used when a domain names a provider but not a
/// model.
fn default_model_for(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("claude-sonnet-4-5"),
        "openai" => Some("gpt-4o"),
        "ollama" => Some("llama3.1"),
        _ => None,
    }
}

fn row_to_domain(row: &Row<'_>) -> rusqlite::Result<Domain> {
    Ok(Domain {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        kb_path: row.get(3)?,
        identity: row.get(4)?,
        escalation_triggers: row.get(5)?,
        allow_gmail: row.get::<_, i64>(6)? != 0,
        model_provider: row.get(7)?,
        model_name: row.get(8)?,
        force_tool_attempt: row.get::<_, i64>(9)? != 0,
        sort_order: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

const DOMAIN_COLS: &str = "id, name, description, kb_path, identity, escalation_triggers, \
                           allow_gmail, model_provider, model_name, force_tool_attempt, \
                           sort_order, created_at, updated_at";

/// Repair inconsistent model config on read: a provider without a model gets
/// the provider default; a model without a provider is meaningless and both
/// are dropped.
fn normalize_model_config(domain: &mut Domain) {
    match (&domain.model_provider, &domain.model_name) {
        (Some(provider), None) => {
            domain.model_name = default_model_for(provider).map(|m| m.to_string());
        }
        (None, Some(model)) => {
            warn!(domain = %domain.name, model = %model, "model_name without provider, clearing");
            domain.model_name = None;
        }
        _ => {}
    }
}

pub fn create_domain(store: &Store, input: NewDomain) -> Result<Domain> {
    if input.name.trim().is_empty() {
        return Err(CoreError::validation("domain name must not be empty"));
    }
    if input.kb_path.trim().is_empty() {
        return Err(CoreError::validation("kb_path must not be empty"));
    }
    if !std::path::Path::new(&input.kb_path).is_absolute() {
        return Err(CoreError::validation(format!(
            "kb_path must be absolute: {}",
            input.kb_path
        )));
    }

    let sort_order = match input.sort_order {
        Some(order) => order,
        None => {
            let max: i64 = store.conn().query_row(
                "SELECT COALESCE(MAX(sort_order), -1) FROM domains",
                [],
                |r| r.get(0),
            )?;
            max + 1
        }
    };

    let id = new_id();
    let now = now_iso();
    store.conn().execute(
        "INSERT INTO domains
           (id, name, description, kb_path, identity, escalation_triggers, allow_gmail,
            model_provider, model_name, force_tool_attempt, sort_order, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            id,
            input.name.trim(),
            input.description,
            input.kb_path,
            input.identity,
            input.escalation_triggers,
            input.allow_gmail as i64,
            input.model_provider,
            input.model_name,
            input.force_tool_attempt as i64,
            sort_order,
            now,
        ],
    )?;
    get_domain(store, &id)
}

pub fn get_domain(store: &Store, id: &str) -> Result<Domain> {
    let mut domain = store
        .conn()
        .query_row(
            &format!("SELECT {DOMAIN_COLS} FROM domains WHERE id = ?1"),
            params![id],
            row_to_domain,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::not_found("domain", id),
            other => other.into(),
        })?;
    normalize_model_config(&mut domain);
    Ok(domain)
}

pub fn get_domain_by_name(store: &Store, name: &str) -> Result<Domain> {
    let mut domain = store
        .conn()
        .query_row(
            &format!("SELECT {DOMAIN_COLS} FROM domains WHERE name = ?1"),
            params![name],
            row_to_domain,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::not_found("domain", name),
            other => other.into(),
        })?;
    normalize_model_config(&mut domain);
    Ok(domain)
}

pub fn list_domains(store: &Store) -> Result<Vec<Domain>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {DOMAIN_COLS} FROM domains ORDER BY sort_order ASC, created_at ASC"
    ))?;
    let rows = stmt.query_map([], row_to_domain)?;
    let mut domains = Vec::new();
    for row in rows {
        let mut domain = row?;
        normalize_model_config(&mut domain);
        domains.push(domain);
    }
    Ok(domains)
}

#[derive(Debug, Clone, Default)]
pub struct DomainPatch {
    pub description: Option<String>,
    pub kb_path: Option<String>,
    pub identity: Option<Option<String>>,
    pub escalation_triggers: Option<Option<String>>,
    pub model_provider: Option<Option<String>>,
    pub model_name: Option<Option<String>>,
    pub sort_order: Option<i64>,
}

pub fn update_domain(store: &Store, id: &str, patch: DomainPatch) -> Result<Domain> {
    let current = get_domain(store, id)?;
    if let Some(kb_path) = &patch.kb_path {
        if !std::path::Path::new(kb_path).is_absolute() {
            return Err(CoreError::validation(format!("kb_path must be absolute: {kb_path}")));
        }
    }
    let description = patch.description.unwrap_or(current.description);
    let kb_path = patch.kb_path.unwrap_or(current.kb_path);
    let identity = patch.identity.unwrap_or(current.identity);
    let escalation_triggers = patch.escalation_triggers.unwrap_or(current.escalation_triggers);
    let model_provider = patch.model_provider.unwrap_or(current.model_provider);
    let model_name = patch.model_name.unwrap_or(current.model_name);
    let sort_order = patch.sort_order.unwrap_or(current.sort_order);

    store.conn().execute(
        "UPDATE domains
         SET description = ?1, kb_path = ?2, identity = ?3, escalation_triggers = ?4,
             model_provider = ?5, model_name = ?6, sort_order = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            description,
            kb_path,
            identity,
            escalation_triggers,
            model_provider,
            model_name,
            sort_order,
            now_iso(),
            id,
        ],
    )?;
    get_domain(store, id)
}

pub fn delete_domain(store: &Store, id: &str) -> Result<()> {
    let changed = store.conn().execute("DELETE FROM domains WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(CoreError::not_found("domain", id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// KB files
// ---------------------------------------------------------------------------

/// A domain's synced KB files, ordered by tier priority then path.
pub fn list_kb_files(store: &Store, domain_id: &str) -> Result<Vec<KbFile>> {
    let mut stmt = store.conn().prepare(
        "SELECT id, domain_id, relative_path, content_hash, size_bytes, last_synced_at,
                tier, tier_source
         FROM kb_files WHERE domain_id = ?1",
    )?;
    let rows = stmt.query_map(params![domain_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut files = Vec::new();
    for row in rows {
        let (id, domain_id, relative_path, content_hash, size_bytes, last_synced_at, tier, source) =
            row?;
        files.push(KbFile {
            id,
            domain_id,
            relative_path,
            content_hash,
            size_bytes,
            last_synced_at,
            tier: Tier::parse(&tier)
                .ok_or_else(|| CoreError::parse(format!("bad tier: {tier}")))?,
            tier_source: TierSource::parse(&source)
                .ok_or_else(|| CoreError::parse(format!("bad tier_source: {source}")))?,
        });
    }
    files.sort_by(|a, b| {
        a.tier.priority().cmp(&b.tier.priority()).then(a.relative_path.cmp(&b.relative_path))
    });
    Ok(files)
}

/// Pin a file's tier by hand. The scanner never re-classifies manual tiers.
pub fn set_file_tier(store: &Store, kb_file_id: &str, tier: Tier) -> Result<()> {
    let changed = store.conn().execute(
        "UPDATE kb_files SET tier = ?1, tier_source = 'manual' WHERE id = ?2",
        params![tier.as_str(), kb_file_id],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found("kb file", kb_file_id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<(DomainRelationship, String, String)> {
    let rel_type: String = row.get(3)?;
    let dep_type: String = row.get(4)?;
    Ok((
        DomainRelationship {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            sibling_domain_id: row.get(2)?,
            relationship_type: RelationshipType::Sibling, // patched below
            dependency_type: DependencyType::Informs,     // patched below
            description: row.get(5)?,
            created_at: row.get(6)?,
        },
        rel_type,
        dep_type,
    ))
}

fn finish_relationship(raw: (DomainRelationship, String, String)) -> Result<DomainRelationship> {
    let (mut rel, rel_type, dep_type) = raw;
    rel.relationship_type = RelationshipType::parse(&rel_type)
        .ok_or_else(|| CoreError::parse(format!("bad relationship_type: {rel_type}")))?;
    rel.dependency_type = DependencyType::parse(&dep_type)
        .ok_or_else(|| CoreError::parse(format!("bad dependency_type: {dep_type}")))?;
    Ok(rel)
}

const REL_COLS: &str = "id, domain_id, sibling_domain_id, relationship_type, dependency_type, \
                        description, created_at";

/// Create or refresh the directed edge `from → to`. Reciprocation is explicit:
/// callers wanting both directions add both edges (in one transaction).
pub fn upsert_relationship(
    store: &Store,
    from_domain_id: &str,
    to_domain_id: &str,
    relationship_type: RelationshipType,
    dependency_type: DependencyType,
    description: Option<&str>,
) -> Result<DomainRelationship> {
    if from_domain_id == to_domain_id {
        return Err(CoreError::validation("a domain cannot relate to itself"));
    }
    store.conn().execute(
        "INSERT INTO domain_relationships
           (id, domain_id, sibling_domain_id, relationship_type, dependency_type,
            description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(domain_id, sibling_domain_id) DO UPDATE SET
            relationship_type = excluded.relationship_type,
            dependency_type = excluded.dependency_type,
            description = excluded.description",
        params![
            new_id(),
            from_domain_id,
            to_domain_id,
            relationship_type.as_str(),
            dependency_type.as_str(),
            description,
            now_iso(),
        ],
    )?;
    let raw = store.conn().query_row(
        &format!(
            "SELECT {REL_COLS} FROM domain_relationships
             WHERE domain_id = ?1 AND sibling_domain_id = ?2"
        ),
        params![from_domain_id, to_domain_id],
        row_to_relationship,
    )?;
    finish_relationship(raw)
}

fn query_relationships(store: &Store, sql: &str, id: &str) -> Result<Vec<DomainRelationship>> {
    let mut stmt = store.conn().prepare(sql)?;
    let rows = stmt.query_map(params![id], row_to_relationship)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_relationship(row?)?);
    }
    Ok(out)
}

pub fn list_outgoing(store: &Store, domain_id: &str) -> Result<Vec<DomainRelationship>> {
    query_relationships(
        store,
        &format!(
            "SELECT {REL_COLS} FROM domain_relationships
             WHERE domain_id = ?1 ORDER BY sibling_domain_id ASC"
        ),
        domain_id,
    )
}

pub fn list_incoming(store: &Store, domain_id: &str) -> Result<Vec<DomainRelationship>> {
    query_relationships(
        store,
        &format!(
            "SELECT {REL_COLS} FROM domain_relationships
             WHERE sibling_domain_id = ?1 ORDER BY domain_id ASC"
        ),
        domain_id,
    )
}

pub fn list_all_relationships(store: &Store) -> Result<Vec<DomainRelationship>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {REL_COLS} FROM domain_relationships ORDER BY domain_id ASC, sibling_domain_id ASC"
    ))?;
    let rows = stmt.query_map([], row_to_relationship)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_relationship(row?)?);
    }
    Ok(out)
}

pub fn delete_relationship(store: &Store, from_domain_id: &str, to_domain_id: &str) -> Result<()> {
    store.conn().execute(
        "DELETE FROM domain_relationships WHERE domain_id = ?1 AND sibling_domain_id = ?2",
        params![from_domain_id, to_domain_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Deadlines
// ---------------------------------------------------------------------------

fn row_to_deadline(row: &Row<'_>) -> rusqlite::Result<(Deadline, String)> {
    let status: String = row.get(6)?;
    Ok((
        Deadline {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            text: row.get(2)?,
            due_date: row.get(3)?,
            priority: row.get(4)?,
            source_ref: row.get(5)?,
            status: DeadlineStatus::Active, // patched below
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        },
        status,
    ))
}

fn finish_deadline(raw: (Deadline, String)) -> Result<Deadline> {
    let (mut deadline, status) = raw;
    deadline.status = DeadlineStatus::parse(&status)
        .ok_or_else(|| CoreError::parse(format!("bad deadline status: {status}")))?;
    Ok(deadline)
}

const DEADLINE_COLS: &str =
    "id, domain_id, text, due_date, priority, source_ref, status, created_at, updated_at";

/// Create a deadline. When `source_ref` matches an existing non-cancelled
/// deadline in the domain, the existing row is returned instead (duplicate
/// prevention for LLM-emitted deadlines).
pub fn create_deadline(
    store: &Store,
    domain_id: &str,
    text: &str,
    due_date: &str,
    priority: Option<i64>,
    source_ref: Option<&str>,
) -> Result<Deadline> {
    if text.trim().is_empty() {
        return Err(CoreError::validation("deadline text must not be empty"));
    }
    if chrono::NaiveDate::parse_from_str(due_date, "%Y-%m-%d").is_err() {
        return Err(CoreError::validation(format!("due_date must be YYYY-MM-DD: {due_date}")));
    }
    let priority = priority.unwrap_or(4);
    if !(1..=7).contains(&priority) {
        return Err(CoreError::validation(format!("priority must be in 1..=7: {priority}")));
    }

    if let Some(source) = source_ref {
        let existing = store
            .conn()
            .query_row(
                &format!(
                    "SELECT {DEADLINE_COLS} FROM deadlines
                     WHERE domain_id = ?1 AND source_ref = ?2 AND status != 'cancelled'
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![domain_id, source],
                row_to_deadline,
            )
            .ok();
        if let Some(raw) = existing {
            return finish_deadline(raw);
        }
    }

    let id = new_id();
    let now = now_iso();
    store.conn().execute(
        "INSERT INTO deadlines (id, domain_id, text, due_date, priority, status, source_ref,
                                created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?7)",
        params![id, domain_id, text.trim(), due_date, priority, source_ref, now],
    )?;
    get_deadline(store, &id)
}

pub fn get_deadline(store: &Store, id: &str) -> Result<Deadline> {
    let raw = store
        .conn()
        .query_row(
            &format!("SELECT {DEADLINE_COLS} FROM deadlines WHERE id = ?1"),
            params![id],
            row_to_deadline,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::not_found("deadline", id),
            other => other.into(),
        })?;
    finish_deadline(raw)
}

pub fn list_deadlines(store: &Store, domain_id: &str) -> Result<Vec<Deadline>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {DEADLINE_COLS} FROM deadlines
         WHERE domain_id = ?1 ORDER BY due_date ASC, priority ASC, created_at ASC"
    ))?;
    let rows = stmt.query_map(params![domain_id], row_to_deadline)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_deadline(row?)?);
    }
    Ok(out)
}

/// Active deadlines with `due_date < today` (ISO dates compare
/// lexicographically).
pub fn overdue_deadlines(store: &Store, domain_id: &str, today: &str) -> Result<Vec<Deadline>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {DEADLINE_COLS} FROM deadlines
         WHERE domain_id = ?1 AND status = 'active' AND due_date < ?2
         ORDER BY due_date ASC, priority ASC, created_at ASC"
    ))?;
    let rows = stmt.query_map(params![domain_id, today], row_to_deadline)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_deadline(row?)?);
    }
    Ok(out)
}

pub fn set_deadline_status(store: &Store, id: &str, status: DeadlineStatus) -> Result<Deadline> {
    let changed = store.conn().execute(
        "UPDATE deadlines SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_iso(), id],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found("deadline", id));
    }
    get_deadline(store, id)
}

// ---------------------------------------------------------------------------
// Gap flags
// ---------------------------------------------------------------------------

fn row_to_gap_flag(row: &Row<'_>) -> rusqlite::Result<GapFlag> {
    Ok(GapFlag {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        category: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        resolved_at: row.get(5)?,
    })
}

const GAP_COLS: &str = "id, domain_id, category, description, created_at, resolved_at";

pub fn create_gap_flag(
    store: &Store,
    domain_id: &str,
    category: &str,
    description: &str,
) -> Result<GapFlag> {
    if category.trim().is_empty() {
        return Err(CoreError::validation("gap flag category must not be empty"));
    }
    let id = new_id();
    store.conn().execute(
        "INSERT INTO gap_flags (id, domain_id, category, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, domain_id, category.trim(), description, now_iso()],
    )?;
    store
        .conn()
        .query_row(
            &format!("SELECT {GAP_COLS} FROM gap_flags WHERE id = ?1"),
            params![id],
            row_to_gap_flag,
        )
        .map_err(Into::into)
}

/// Resolve a gap flag. Resolving an already-resolved flag is a no-op success.
pub fn resolve_gap_flag(store: &Store, id: &str) -> Result<GapFlag> {
    store.conn().execute(
        "UPDATE gap_flags SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
        params![now_iso(), id],
    )?;
    store
        .conn()
        .query_row(
            &format!("SELECT {GAP_COLS} FROM gap_flags WHERE id = ?1"),
            params![id],
            row_to_gap_flag,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::not_found("gap flag", id),
            other => other.into(),
        })
}

pub fn open_gap_flags(store: &Store, domain_id: &str) -> Result<Vec<GapFlag>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {GAP_COLS} FROM gap_flags
         WHERE domain_id = ?1 AND resolved_at IS NULL ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![domain_id], row_to_gap_flag)?;
    rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
}

pub fn list_gap_flags(store: &Store, domain_id: &str) -> Result<Vec<GapFlag>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {GAP_COLS} FROM gap_flags WHERE domain_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![domain_id], row_to_gap_flag)?;
    rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<(Session, String)> {
    let status: String = row.get(3)?;
    Ok((
        Session {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            scope: row.get(2)?,
            status: SessionStatus::Active, // patched below
            model_provider: row.get(4)?,
            model_name: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
        },
        status,
    ))
}

fn finish_session(raw: (Session, String)) -> Result<Session> {
    let (mut session, status) = raw;
    session.status = SessionStatus::parse(&status)
        .ok_or_else(|| CoreError::parse(format!("bad session status: {status}")))?;
    Ok(session)
}

const SESSION_COLS: &str =
    "id, domain_id, scope, status, model_provider, model_name, started_at, ended_at";

pub fn start_session(
    store: &Store,
    domain_id: &str,
    scope: &str,
    model_provider: Option<&str>,
    model_name: Option<&str>,
) -> Result<Session> {
    let id = new_id();
    store.conn().execute(
        "INSERT INTO sessions (id, domain_id, scope, status, model_provider, model_name, started_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
        params![id, domain_id, scope, model_provider, model_name, now_iso()],
    )?;
    get_session(store, &id)
}

pub fn get_session(store: &Store, id: &str) -> Result<Session> {
    let raw = store
        .conn()
        .query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
            params![id],
            row_to_session,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::not_found("session", id),
            other => other.into(),
        })?;
    finish_session(raw)
}

/// Wrap up a session. Wrapping an already-wrapped session is a no-op success.
pub fn wrap_up_session(store: &Store, id: &str) -> Result<Session> {
    store.conn().execute(
        "UPDATE sessions SET status = 'wrapped_up', ended_at = ?1
         WHERE id = ?2 AND status = 'active'",
        params![now_iso(), id],
    )?;
    get_session(store, id)
}

pub fn most_recent_session(store: &Store, domain_id: &str) -> Result<Option<Session>> {
    let raw = store
        .conn()
        .query_row(
            &format!(
                "SELECT {SESSION_COLS} FROM sessions
                 WHERE domain_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1"
            ),
            params![domain_id],
            row_to_session,
        )
        .ok();
    raw.map(finish_session).transpose()
}

pub fn most_recent_wrapped_session(store: &Store, domain_id: &str) -> Result<Option<Session>> {
    let raw = store
        .conn()
        .query_row(
            &format!(
                "SELECT {SESSION_COLS} FROM sessions
                 WHERE domain_id = ?1 AND status = 'wrapped_up' AND ended_at IS NOT NULL
                 ORDER BY ended_at DESC, id DESC LIMIT 1"
            ),
            params![domain_id],
            row_to_session,
        )
        .ok();
    raw.map(finish_session).transpose()
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

fn row_to_decision(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let linked: String = row.get(8)?;
    Ok(Decision {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        decision_key: row.get(2)?,
        decision: row.get(3)?,
        confidence: row.get(4)?,
        horizon: row.get(5)?,
        reversibility_class: row.get(6)?,
        category: row.get(7)?,
        linked_files: serde_json::from_str(&linked).unwrap_or_default(),
        created_at: row.get(9)?,
    })
}

const DECISION_COLS: &str = "id, domain_id, decision_key, decision, confidence, horizon, \
                             reversibility_class, category, linked_files, created_at";

#[derive(Debug, Clone, Default)]
pub struct DecisionInput {
    pub decision_key: String,
    pub decision: String,
    pub confidence: Option<String>,
    pub horizon: Option<String>,
    pub reversibility_class: Option<String>,
    pub category: Option<String>,
    pub linked_files: Vec<String>,
}

/// Record a decision; re-recording the same `decision_key` for a domain
/// updates the row in place.
pub fn record_decision(store: &Store, domain_id: &str, input: DecisionInput) -> Result<Decision> {
    if input.decision_key.trim().is_empty() || input.decision.trim().is_empty() {
        return Err(CoreError::validation("decision_key and decision are required"));
    }
    let linked = serde_json::to_string(&input.linked_files)?;
    store.conn().execute(
        "INSERT INTO decisions
           (id, domain_id, decision_key, decision, confidence, horizon, reversibility_class,
            category, linked_files, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(domain_id, decision_key) DO UPDATE SET
            decision = excluded.decision,
            confidence = excluded.confidence,
            horizon = excluded.horizon,
            reversibility_class = excluded.reversibility_class,
            category = excluded.category,
            linked_files = excluded.linked_files",
        params![
            new_id(),
            domain_id,
            input.decision_key.trim(),
            input.decision,
            input.confidence,
            input.horizon,
            input.reversibility_class,
            input.category,
            linked,
            now_iso(),
        ],
    )?;
    store
        .conn()
        .query_row(
            &format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE domain_id = ?1 AND decision_key = ?2"
            ),
            params![domain_id, input.decision_key.trim()],
            row_to_decision,
        )
        .map_err(Into::into)
}

pub fn recent_decisions(store: &Store, domain_id: &str, limit: usize) -> Result<Vec<Decision>> {
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {DECISION_COLS} FROM decisions
         WHERE domain_id = ?1 ORDER BY created_at DESC, decision_key ASC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![domain_id, limit as i64], row_to_decision)?;
    rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Replace a domain's tag set. Idempotent: setting the same tags twice stores
/// the same rows.
pub fn set_tags(store: &Store, domain_id: &str, tags: &[String]) -> Result<Vec<String>> {
    let mut cleaned: Vec<String> =
        tags.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
    cleaned.sort();
    cleaned.dedup();

    store.with_tx(|tx| {
        tx.execute("DELETE FROM domain_tags WHERE domain_id = ?1", params![domain_id])?;
        for tag in &cleaned {
            tx.execute(
                "INSERT INTO domain_tags (domain_id, tag) VALUES (?1, ?2)",
                params![domain_id, tag],
            )?;
        }
        Ok(())
    })?;
    Ok(cleaned)
}

pub fn get_tags(store: &Store, domain_id: &str) -> Result<Vec<String>> {
    let mut stmt = store
        .conn()
        .prepare("SELECT tag FROM domain_tags WHERE domain_id = ?1 ORDER BY tag ASC")?;
    let rows = stmt.query_map(params![domain_id], |row| row.get(0))?;
    rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Plugins and commands
// ---------------------------------------------------------------------------

fn row_to_plugin(row: &Row<'_>) -> rusqlite::Result<Plugin> {
    Ok(Plugin {
        id: row.get(0)?,
        name: row.get(1)?,
        source_url: row.get(2)?,
        source_hash: row.get(3)?,
        installed_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Install or refresh a plugin. Returns `(plugin, upstream_changed)` where
/// `upstream_changed` is true when an existing install's `source_hash`
/// differed.
pub fn install_plugin(
    store: &Store,
    name: &str,
    source_url: Option<&str>,
    source_hash: &str,
) -> Result<(Plugin, bool)> {
    if name.trim().is_empty() {
        return Err(CoreError::validation("plugin name must not be empty"));
    }
    let existing: Option<(String, String)> = store
        .conn()
        .query_row(
            "SELECT id, source_hash FROM plugins WHERE name = ?1",
            params![name.trim()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();

    let now = now_iso();
    let changed = match &existing {
        Some((id, old_hash)) => {
            let upstream_changed = old_hash != source_hash;
            store.conn().execute(
                "UPDATE plugins SET source_url = ?1, source_hash = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![source_url, source_hash, now, id],
            )?;
            upstream_changed
        }
        None => {
            store.conn().execute(
                "INSERT INTO plugins (id, name, source_url, source_hash, installed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![new_id(), name.trim(), source_url, source_hash, now],
            )?;
            false
        }
    };

    let plugin = store.conn().query_row(
        "SELECT id, name, source_url, source_hash, installed_at, updated_at
         FROM plugins WHERE name = ?1",
        params![name.trim()],
        row_to_plugin,
    )?;
    Ok((plugin, changed))
}

pub fn list_plugins(store: &Store) -> Result<Vec<Plugin>> {
    let mut stmt = store.conn().prepare(
        "SELECT id, name, source_url, source_hash, installed_at, updated_at
         FROM plugins ORDER BY name ASC",
    )?;
    let rows = stmt.query_map([], row_to_plugin)?;
    rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
}

pub fn install_command(
    store: &Store,
    domain_id: &str,
    slug: &str,
    source_hash: &str,
) -> Result<InstalledCommand> {
    if slug.trim().is_empty() {
        return Err(CoreError::validation("command slug must not be empty"));
    }
    store.conn().execute(
        "INSERT INTO commands (id, domain_id, slug, source_hash, installed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(domain_id, slug) DO UPDATE SET source_hash = excluded.source_hash",
        params![new_id(), domain_id, slug.trim(), source_hash, now_iso()],
    )?;
    store
        .conn()
        .query_row(
            "SELECT id, domain_id, slug, source_hash, installed_at
             FROM commands WHERE domain_id = ?1 AND slug = ?2",
            params![domain_id, slug.trim()],
            |row| {
                Ok(InstalledCommand {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    slug: row.get(2)?,
                    source_hash: row.get(3)?,
                    installed_at: row.get(4)?,
                })
            },
        )
        .map_err(Into::into)
}

/// The short form of a canonical slug: the part after `:` when present.
fn short_slug(slug: &str) -> &str {
    slug.split_once(':').map(|(_, short)| short).unwrap_or(slug)
}

/// List a domain's commands with collision-resolved display slugs: short
/// form when unique within the domain, full canonical slug otherwise.
pub fn list_commands_with_display(store: &Store, domain_id: &str) -> Result<Vec<CommandDisplay>> {
    let mut stmt = store.conn().prepare(
        "SELECT id, domain_id, slug, source_hash, installed_at
         FROM commands WHERE domain_id = ?1 ORDER BY slug ASC",
    )?;
    let rows = stmt.query_map(params![domain_id], |row| {
        Ok(InstalledCommand {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            slug: row.get(2)?,
            source_hash: row.get(3)?,
            installed_at: row.get(4)?,
        })
    })?;
    let commands: Vec<InstalledCommand> =
        rows.collect::<std::result::Result<_, _>>().map_err(CoreError::from)?;

    let mut short_counts: std::collections::HashMap<&str, usize> =
        std::collections::HashMap::new();
    for command in &commands {
        *short_counts.entry(short_slug(&command.slug)).or_insert(0) += 1;
    }

    Ok(commands
        .iter()
        .map(|command| {
            let short = short_slug(&command.slug);
            let display_slug = if short_counts[short] == 1 {
                short.to_string()
            } else {
                command.slug.clone()
            };
            CommandDisplay { command: command.clone(), display_slug }
        })
        .collect())
}
