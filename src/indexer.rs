//! Incremental embedding indexer.
//!
//! Phase 1 re-chunks every KB file and reconciles `kb_chunks` by stable
//! `chunk_key`. Phase 2 embeds whatever chunks lack a current embedding for
//! the client's `(model, fingerprint)` pair, in batches bounded by both a
//! chunk count and a character budget. Progress is persisted to
//! `embedding_jobs` at every phase transition and batch boundary, so a
//! cancelled or crashed run resumes naturally — the `content_hash`
//! comparison drives idempotence.

use crate::chunker::{chunk_markdown, ChunkData, ChunkerConfig};
use crate::error::Result;
use crate::providers::EmbeddingClient;
use crate::store::{new_id, now_iso, Store};
use crate::types::{Domain, JobState};
use crate::vectors::pack_f32;
use rusqlite::params;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Hard cap on chunks per embedding batch.
pub const MAX_BATCH_CHUNKS: usize = 50;
/// Hard cap on total characters per embedding batch.
pub const MAX_BATCH_CHARS: usize = 100_000;

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IndexReport {
    pub files_processed: usize,
    pub chunks_inserted: usize,
    pub chunks_updated: usize,
    pub chunks_deleted: usize,
    pub chunks_embedded: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkSyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

// ---------------------------------------------------------------------------
// Chunk sync (phase 1)
// ---------------------------------------------------------------------------

/// Reconcile one file's chunks by `chunk_key` in a single transaction.
/// Unchanged chunks are left untouched; deletes cascade their embeddings.
pub fn sync_chunks(
    store: &Store,
    kb_file_id: &str,
    domain_id: &str,
    file_content_hash: &str,
    chunks: &[ChunkData],
) -> Result<ChunkSyncReport> {
    store.with_tx(|tx| {
        let mut existing: HashMap<String, (String, String)> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, chunk_key, content_hash FROM kb_chunks WHERE kb_file_id = ?1",
            )?;
            let rows = stmt.query_map(params![kb_file_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (id, chunk_key, content_hash) = row?;
                existing.insert(chunk_key, (id, content_hash));
            }
        }

        let mut report = ChunkSyncReport::default();
        let mut seen_keys: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for chunk in chunks {
            // Identical sections collapse to one stable key; keep the first.
            if !seen_keys.insert(chunk.chunk_key.as_str()) {
                continue;
            }
            match existing.remove(&chunk.chunk_key) {
                Some((id, stored_hash)) if stored_hash != chunk.content_hash => {
                    tx.execute(
                        "UPDATE kb_chunks
                         SET chunk_index = ?1, heading_path = ?2, content = ?3,
                             content_hash = ?4, file_content_hash = ?5, char_count = ?6,
                             token_estimate = ?7, start_line = ?8, end_line = ?9
                         WHERE id = ?10",
                        params![
                            chunk.chunk_index,
                            chunk.heading_path,
                            chunk.content,
                            chunk.content_hash,
                            file_content_hash,
                            chunk.char_count,
                            chunk.token_estimate,
                            chunk.start_line,
                            chunk.end_line,
                            id,
                        ],
                    )?;
                    report.updated += 1;
                }
                Some(_) => {}
                None => {
                    tx.execute(
                        "INSERT INTO kb_chunks
                           (id, kb_file_id, domain_id, chunk_index, chunk_key, heading_path,
                            content, content_hash, file_content_hash, char_count,
                            token_estimate, start_line, end_line)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        params![
                            new_id(),
                            kb_file_id,
                            domain_id,
                            chunk.chunk_index,
                            chunk.chunk_key,
                            chunk.heading_path,
                            chunk.content,
                            chunk.content_hash,
                            file_content_hash,
                            chunk.char_count,
                            chunk.token_estimate,
                            chunk.start_line,
                            chunk.end_line,
                        ],
                    )?;
                    report.inserted += 1;
                }
            }
        }

        for (id, _) in existing.values() {
            tx.execute("DELETE FROM kb_chunks WHERE id = ?1", params![id])?;
            report.deleted += 1;
        }

        Ok(report)
    })
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

struct JobProgress<'a> {
    domain_id: &'a str,
    model_name: &'a str,
    run_id: String,
    fingerprint: &'a str,
    started_at: String,
    total_files: usize,
    processed_files: usize,
    total_chunks: usize,
    embedded_chunks: usize,
    last_error: Option<String>,
}

impl JobProgress<'_> {
    fn upsert(&self, store: &Store, status: JobState) -> Result<()> {
        store.conn().execute(
            "INSERT INTO embedding_jobs
               (domain_id, model_name, run_id, provider_fingerprint, status, total_files,
                processed_files, total_chunks, embedded_chunks, last_error, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(domain_id, model_name) DO UPDATE SET
                run_id = excluded.run_id,
                provider_fingerprint = excluded.provider_fingerprint,
                status = excluded.status,
                total_files = excluded.total_files,
                processed_files = excluded.processed_files,
                total_chunks = excluded.total_chunks,
                embedded_chunks = excluded.embedded_chunks,
                last_error = excluded.last_error,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at",
            params![
                self.domain_id,
                self.model_name,
                self.run_id,
                self.fingerprint,
                status.as_str(),
                self.total_files as i64,
                self.processed_files as i64,
                self.total_chunks as i64,
                self.embedded_chunks as i64,
                self.last_error,
                self.started_at,
                now_iso(),
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Indexing run
// ---------------------------------------------------------------------------

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Run a full incremental index pass for one domain: chunk sync, then
/// embedding catch-up. The cancel flag is honored between files and between
/// batches; partial progress is kept either way.
pub fn index_domain(
    store: &Store,
    domain: &Domain,
    client: &dyn EmbeddingClient,
    cancel: Option<&AtomicBool>,
) -> Result<IndexReport> {
    let files: Vec<(String, String, String)> = {
        let mut stmt = store.conn().prepare(
            "SELECT id, relative_path, content_hash FROM kb_files
             WHERE domain_id = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![domain.id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let mut progress = JobProgress {
        domain_id: &domain.id,
        model_name: client.model_name(),
        run_id: new_id(),
        fingerprint: client.provider_fingerprint(),
        started_at: now_iso(),
        total_files: files.len(),
        processed_files: 0,
        total_chunks: 0,
        embedded_chunks: 0,
        last_error: None,
    };
    let mut report = IndexReport::default();
    progress.upsert(store, JobState::Running)?;

    // Phase 1: chunk sync.
    let config = ChunkerConfig::default();
    for (file_id, relative_path, content_hash) in &files {
        if is_cancelled(cancel) {
            return finish_cancelled(store, progress, report);
        }
        let abs = Path::new(&domain.kb_path).join(relative_path);
        let content = match std::fs::read_to_string(&abs) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "Skipping unreadable KB file");
                continue;
            }
        };
        let chunks = chunk_markdown(file_id, &content, &config);
        match sync_chunks(store, file_id, &domain.id, content_hash, &chunks) {
            Ok(sync) => {
                report.chunks_inserted += sync.inserted;
                report.chunks_updated += sync.updated;
                report.chunks_deleted += sync.deleted;
            }
            Err(e) => {
                // Storage failures are terminal; mark the job and bail.
                progress.last_error = Some(e.to_string());
                progress.upsert(store, JobState::Error)?;
                return Err(e);
            }
        }
        report.files_processed += 1;
        progress.processed_files = report.files_processed;
        progress.upsert(store, JobState::Running)?;
    }

    // Phase 2: embedding catch-up.
    let pending: Vec<(String, String)> = {
        let mut stmt = store.conn().prepare(
            "SELECT c.id, c.content
             FROM kb_chunks c
             LEFT JOIN kb_chunk_embeddings e
               ON e.chunk_id = c.id AND e.model_name = ?2
             WHERE c.domain_id = ?1
               AND (e.chunk_id IS NULL
                    OR e.content_hash != c.content_hash
                    OR e.provider_fingerprint != ?3)
             ORDER BY c.kb_file_id, c.chunk_index",
        )?;
        let rows = stmt.query_map(
            params![domain.id, client.model_name(), client.provider_fingerprint()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    progress.total_chunks = pending.len();
    progress.upsert(store, JobState::Running)?;
    debug!(domain = %domain.name, pending = pending.len(), "Embedding catch-up");

    let mut cursor = 0usize;
    while cursor < pending.len() {
        if is_cancelled(cancel) {
            return finish_cancelled(store, progress, report);
        }

        // Greedy batch respecting both limits; always at least one chunk.
        let mut end = cursor + 1;
        let mut chars = pending[cursor].1.len();
        while end < pending.len()
            && end - cursor < MAX_BATCH_CHUNKS
            && chars + pending[end].1.len() <= MAX_BATCH_CHARS
        {
            chars += pending[end].1.len();
            end += 1;
        }
        let batch = &pending[cursor..end];
        cursor = end;

        let texts: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
        match client.embed(&texts) {
            Ok(vectors) => {
                let stored = store.with_tx(|tx| {
                    let mut count = 0usize;
                    for ((chunk_id, _), vector) in batch.iter().zip(vectors.iter()) {
                        let changed = tx.execute(
                            "INSERT INTO kb_chunk_embeddings
                               (chunk_id, model_name, dimensions, embedding, content_hash,
                                provider_fingerprint)
                             SELECT c.id, ?2, ?3, ?4, c.content_hash, ?5
                             FROM kb_chunks c WHERE c.id = ?1
                             ON CONFLICT(chunk_id, model_name) DO UPDATE SET
                                dimensions = excluded.dimensions,
                                embedding = excluded.embedding,
                                content_hash = excluded.content_hash,
                                provider_fingerprint = excluded.provider_fingerprint",
                            params![
                                chunk_id,
                                client.model_name(),
                                client.dimensions() as i64,
                                pack_f32(vector),
                                client.provider_fingerprint(),
                            ],
                        )?;
                        count += changed;
                    }
                    Ok(count)
                });
                let stored = match stored {
                    Ok(count) => count,
                    Err(e) => {
                        // Storage failures are terminal; mark the job and bail.
                        progress.last_error = Some(e.to_string());
                        progress.upsert(store, JobState::Error)?;
                        return Err(e);
                    }
                };
                report.chunks_embedded += stored;
                progress.embedded_chunks = report.chunks_embedded;
            }
            Err(e) => {
                // Partial success beats none: log, remember, move on.
                warn!(error = %e, batch = batch.len(), "Embedding batch failed, continuing");
                progress.last_error = Some(e.to_string());
            }
        }
        progress.upsert(store, JobState::Running)?;
    }

    progress.upsert(store, JobState::Idle)?;
    info!(
        domain = %domain.name,
        files = report.files_processed,
        embedded = report.chunks_embedded,
        "Index run complete"
    );
    Ok(report)
}

/// Current job row for `(domain, model)`, if a run was ever recorded.
pub fn job_status(
    store: &Store,
    domain_id: &str,
    model_name: &str,
) -> Result<Option<crate::types::EmbeddingJobStatus>> {
    let row = store
        .conn()
        .query_row(
            "SELECT domain_id, model_name, run_id, provider_fingerprint, status, total_files,
                    processed_files, total_chunks, embedded_chunks, last_error, started_at,
                    updated_at
             FROM embedding_jobs WHERE domain_id = ?1 AND model_name = ?2",
            params![domain_id, model_name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            },
        )
        .ok();
    let Some((
        domain_id,
        model_name,
        run_id,
        provider_fingerprint,
        status,
        total_files,
        processed_files,
        total_chunks,
        embedded_chunks,
        last_error,
        started_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };
    Ok(Some(crate::types::EmbeddingJobStatus {
        domain_id,
        model_name,
        run_id,
        provider_fingerprint,
        status: JobState::parse(&status)
            .ok_or_else(|| crate::error::CoreError::parse(format!("bad job status: {status}")))?,
        total_files,
        processed_files,
        total_chunks,
        embedded_chunks,
        last_error,
        started_at,
        updated_at,
    }))
}

/// A file's stored chunks in document order.
pub fn list_chunks_for_file(store: &Store, kb_file_id: &str) -> Result<Vec<crate::types::KbChunk>> {
    let mut stmt = store.conn().prepare(
        "SELECT id, kb_file_id, domain_id, chunk_index, chunk_key, heading_path, content,
                content_hash, file_content_hash, char_count, token_estimate, start_line, end_line
         FROM kb_chunks WHERE kb_file_id = ?1 ORDER BY chunk_index ASC",
    )?;
    let rows = stmt.query_map(params![kb_file_id], |row| {
        Ok(crate::types::KbChunk {
            id: row.get(0)?,
            kb_file_id: row.get(1)?,
            domain_id: row.get(2)?,
            chunk_index: row.get(3)?,
            chunk_key: row.get(4)?,
            heading_path: row.get(5)?,
            content: row.get(6)?,
            content_hash: row.get(7)?,
            file_content_hash: row.get(8)?,
            char_count: row.get(9)?,
            token_estimate: row.get(10)?,
            start_line: row.get(11)?,
            end_line: row.get(12)?,
        })
    })?;
    rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// One semantic search result joined with its file coordinates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DomainSearchHit {
    pub chunk_id: String,
    pub relative_path: String,
    pub heading_path: String,
    /// First 200 chars of the chunk for display.
    pub snippet: String,
    pub score: f32,
}

/// Embed the query and run diversity-aware search over the domain's stored
/// embeddings for the client's `(model, fingerprint)`.
pub fn search_domain(
    store: &Store,
    domain: &Domain,
    client: &dyn EmbeddingClient,
    query: &str,
    opts: &crate::vectors::SearchOptions,
) -> Result<Vec<DomainSearchHit>> {
    let query_vec = client
        .embed(&[query.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| crate::error::CoreError::llm("provider returned no query embedding"))?;

    let mut stmt = store.conn().prepare(
        "SELECT c.id, c.kb_file_id, c.heading_path, c.content, f.relative_path,
                e.embedding, e.dimensions
         FROM kb_chunk_embeddings e
         JOIN kb_chunks c ON c.id = e.chunk_id
         JOIN kb_files f ON f.id = c.kb_file_id
         WHERE c.domain_id = ?1 AND e.model_name = ?2 AND e.provider_fingerprint = ?3
         ORDER BY f.relative_path ASC, c.chunk_index ASC",
    )?;
    let rows = stmt.query_map(
        params![domain.id, client.model_name(), client.provider_fingerprint()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Vec<u8>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        },
    )?;

    let mut candidates = Vec::new();
    let mut meta: HashMap<String, (String, String)> = HashMap::new();
    for row in rows {
        let (chunk_id, kb_file_id, heading_path, content, relative_path, blob, dims) = row?;
        let Some(vector) = crate::vectors::unpack_f32(&blob, dims as usize) else {
            warn!(chunk_id = %chunk_id, "Stored embedding has a bad length, skipping");
            continue;
        };
        let snippet: String = content.chars().take(200).collect();
        meta.insert(chunk_id.clone(), (relative_path, snippet));
        candidates.push(crate::vectors::SearchCandidate {
            chunk_id,
            kb_file_id,
            heading_path,
            vector,
        });
    }

    Ok(crate::vectors::search_with_diversity(&query_vec, &candidates, opts)
        .into_iter()
        .map(|hit| {
            let (relative_path, snippet) = meta.remove(&hit.chunk_id).unwrap_or_default();
            DomainSearchHit {
                chunk_id: hit.chunk_id,
                relative_path,
                heading_path: hit.heading_path,
                snippet,
                score: hit.score,
            }
        })
        .collect())
}

fn finish_cancelled(
    store: &Store,
    mut progress: JobProgress<'_>,
    mut report: IndexReport,
) -> Result<IndexReport> {
    progress.last_error = Some("Cancelled".to_string());
    progress.upsert(store, JobState::Idle)?;
    report.cancelled = true;
    info!(domain_id = progress.domain_id, "Index run cancelled, partial progress kept");
    Ok(report)
}
