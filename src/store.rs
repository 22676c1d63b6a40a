//! Embedded storage engine: a single-file SQLite database behind a
//! [`Store`] handle.
//!
//! `open` runs the migration ladder to the latest version (tracked via
//! `PRAGMA user_version`), enforces foreign keys, and enables WAL. All
//! multi-row writes that must be consistent go through [`Store::with_tx`].

use crate::error::{CoreError, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Migration ladder
// ---------------------------------------------------------------------------

/// Ordered schema migrations. `user_version` records how many have been
/// applied; new entries are appended, never edited.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
    CREATE TABLE domains (
        id                  TEXT PRIMARY KEY,
        name                TEXT NOT NULL UNIQUE,
        description         TEXT NOT NULL DEFAULT '',
        kb_path             TEXT NOT NULL,
        identity            TEXT,
        escalation_triggers TEXT,
        allow_gmail         INTEGER NOT NULL DEFAULT 0,
        model_provider      TEXT,
        model_name          TEXT,
        force_tool_attempt  INTEGER NOT NULL DEFAULT 0,
        sort_order          INTEGER NOT NULL DEFAULT 0,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );

    CREATE TABLE kb_files (
        id             TEXT PRIMARY KEY,
        domain_id      TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        relative_path  TEXT NOT NULL,
        content_hash   TEXT NOT NULL,
        size_bytes     INTEGER NOT NULL,
        last_synced_at TEXT NOT NULL,
        tier           TEXT NOT NULL,
        tier_source    TEXT NOT NULL DEFAULT 'inferred',
        UNIQUE(domain_id, relative_path)
    );

    CREATE TABLE kb_chunks (
        id                TEXT PRIMARY KEY,
        kb_file_id        TEXT NOT NULL REFERENCES kb_files(id) ON DELETE CASCADE,
        domain_id         TEXT NOT NULL,
        chunk_index       INTEGER NOT NULL,
        chunk_key         TEXT NOT NULL,
        heading_path      TEXT NOT NULL,
        content           TEXT NOT NULL,
        content_hash      TEXT NOT NULL,
        file_content_hash TEXT NOT NULL,
        char_count        INTEGER NOT NULL,
        token_estimate    INTEGER NOT NULL,
        start_line        INTEGER NOT NULL,
        end_line          INTEGER NOT NULL,
        UNIQUE(kb_file_id, chunk_key)
    );
    CREATE INDEX idx_kb_chunks_domain ON kb_chunks(domain_id);

    CREATE TABLE kb_chunk_embeddings (
        chunk_id             TEXT NOT NULL REFERENCES kb_chunks(id) ON DELETE CASCADE,
        model_name           TEXT NOT NULL,
        dimensions           INTEGER NOT NULL,
        embedding            BLOB NOT NULL,
        content_hash         TEXT NOT NULL,
        provider_fingerprint TEXT NOT NULL,
        PRIMARY KEY (chunk_id, model_name)
    );

    CREATE TABLE embedding_jobs (
        domain_id            TEXT NOT NULL,
        model_name           TEXT NOT NULL,
        run_id               TEXT NOT NULL,
        provider_fingerprint TEXT NOT NULL DEFAULT '',
        status               TEXT NOT NULL,
        total_files          INTEGER NOT NULL DEFAULT 0,
        processed_files      INTEGER NOT NULL DEFAULT 0,
        total_chunks         INTEGER NOT NULL DEFAULT 0,
        embedded_chunks      INTEGER NOT NULL DEFAULT 0,
        last_error           TEXT,
        started_at           TEXT NOT NULL,
        updated_at           TEXT NOT NULL,
        PRIMARY KEY (domain_id, model_name)
    );

    CREATE TABLE domain_relationships (
        id                TEXT PRIMARY KEY,
        domain_id         TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        sibling_domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        relationship_type TEXT NOT NULL,
        dependency_type   TEXT NOT NULL,
        description       TEXT,
        created_at        TEXT NOT NULL,
        UNIQUE(domain_id, sibling_domain_id)
    );

    CREATE TABLE sessions (
        id             TEXT PRIMARY KEY,
        domain_id      TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        scope          TEXT NOT NULL DEFAULT '',
        status         TEXT NOT NULL DEFAULT 'active',
        model_provider TEXT,
        model_name     TEXT,
        started_at     TEXT NOT NULL,
        ended_at       TEXT
    );

    CREATE TABLE deadlines (
        id         TEXT PRIMARY KEY,
        domain_id  TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        text       TEXT NOT NULL,
        due_date   TEXT NOT NULL,
        priority   INTEGER NOT NULL DEFAULT 4,
        status     TEXT NOT NULL DEFAULT 'active',
        source_ref TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE gap_flags (
        id          TEXT PRIMARY KEY,
        domain_id   TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        category    TEXT NOT NULL,
        description TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        resolved_at TEXT
    );

    CREATE TABLE decisions (
        id                  TEXT PRIMARY KEY,
        domain_id           TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        decision_key        TEXT NOT NULL,
        decision            TEXT NOT NULL,
        confidence          TEXT,
        horizon             TEXT,
        reversibility_class TEXT,
        category            TEXT,
        linked_files        TEXT NOT NULL DEFAULT '[]',
        created_at          TEXT NOT NULL,
        UNIQUE(domain_id, decision_key)
    );

    CREATE TABLE domain_tags (
        domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        tag       TEXT NOT NULL,
        PRIMARY KEY (domain_id, tag)
    );

    CREATE TABLE advisory_artifacts (
        id             TEXT PRIMARY KEY,
        domain_id      TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        artifact_type  TEXT NOT NULL,
        title          TEXT NOT NULL,
        content        TEXT NOT NULL,
        fingerprint    TEXT,
        source         TEXT NOT NULL,
        status         TEXT NOT NULL DEFAULT 'active',
        schema_version INTEGER NOT NULL DEFAULT 1,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    );
    CREATE UNIQUE INDEX idx_advisory_fingerprint
        ON advisory_artifacts(domain_id, fingerprint)
        WHERE fingerprint IS NOT NULL;

    CREATE TABLE brainstorm_sessions (
        id                  TEXT PRIMARY KEY,
        domain_id           TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        step                TEXT NOT NULL DEFAULT 'setup',
        is_paused           INTEGER NOT NULL DEFAULT 0,
        topic               TEXT NOT NULL,
        goals               TEXT,
        selected_techniques TEXT NOT NULL DEFAULT '[]',
        idea_count          INTEGER NOT NULL DEFAULT 0,
        synthesis_preview   TEXT,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );
    CREATE UNIQUE INDEX idx_brainstorm_active
        ON brainstorm_sessions(domain_id)
        WHERE step != 'completed';

    CREATE TABLE brainstorm_rounds (
        id                 TEXT PRIMARY KEY,
        session_id         TEXT NOT NULL REFERENCES brainstorm_sessions(id) ON DELETE CASCADE,
        round_number       INTEGER NOT NULL,
        technique_id       TEXT NOT NULL,
        technique_name     TEXT NOT NULL,
        technique_category TEXT NOT NULL,
        idea_count         INTEGER NOT NULL DEFAULT 0,
        started_at         TEXT NOT NULL,
        completed_at       TEXT,
        UNIQUE(session_id, round_number)
    );

    CREATE TABLE brainstorm_ideas (
        id                 TEXT PRIMARY KEY,
        session_id         TEXT NOT NULL REFERENCES brainstorm_sessions(id) ON DELETE CASCADE,
        round_number       INTEGER NOT NULL,
        technique_id       TEXT NOT NULL,
        technique_category TEXT NOT NULL,
        text               TEXT NOT NULL,
        created_at         TEXT NOT NULL
    );
    CREATE INDEX idx_brainstorm_ideas_session ON brainstorm_ideas(session_id);

    CREATE TABLE plugins (
        id           TEXT PRIMARY KEY,
        name         TEXT NOT NULL UNIQUE,
        source_url   TEXT,
        source_hash  TEXT NOT NULL,
        installed_at TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    );

    CREATE TABLE commands (
        id           TEXT PRIMARY KEY,
        domain_id    TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        slug         TEXT NOT NULL,
        source_hash  TEXT NOT NULL,
        installed_at TEXT NOT NULL,
        UNIQUE(domain_id, slug)
    );
    "#,
];

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Handle over the embedded database. Passed explicitly — there is no global
/// state anywhere in the core.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and migrate to the latest
    /// schema version.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::db(format!("open {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// In-memory database, used by tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let current: i64 =
            self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let target = MIGRATIONS.len() as i64;
        if current >= target {
            debug!(version = current, "Schema up to date");
            return Ok(());
        }

        for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
            let version = idx as i64 + 1;
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
            info!(version, "Applied schema migration");
        }
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Time and id helpers
// ---------------------------------------------------------------------------

/// Current UTC timestamp as RFC 3339, the format stored everywhere.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fresh v4 UUID string id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parse an RFC 3339 timestamp to epoch milliseconds. `None` on bad input.
pub fn iso_to_ms(ts: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(ts).ok().map(|dt| dt.timestamp_millis())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
