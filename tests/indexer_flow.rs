//! Embedding indexer integration: incremental chunk sync, batch limits,
//! fingerprint invalidation, cancellation, and per-batch failure tolerance.

mod helpers;

use domainscope::indexer::{self, MAX_BATCH_CHUNKS};
use domainscope::vectors::SearchOptions;
use helpers::{StubEmbeddingClient, TestWorkspace};
use rusqlite::params;
use std::sync::atomic::{AtomicBool, Ordering};

fn section(i: usize) -> String {
    format!(
        "## Topic {i}\nThis section number {i} carries enough body text to survive the minimum \
         chunk size threshold on its own without being merged forward.\n"
    )
}

fn chunk_count(ws: &TestWorkspace) -> i64 {
    ws.store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM kb_chunks WHERE domain_id = ?1",
            params![ws.domain.id],
            |r| r.get(0),
        )
        .unwrap()
}

fn embedding_count(ws: &TestWorkspace) -> i64 {
    ws.store.conn().query_row("SELECT COUNT(*) FROM kb_chunk_embeddings", [], |r| r.get(0)).unwrap()
}

#[test]
fn test_full_index_then_incremental() {
    let ws = TestWorkspace::new("indexing");
    let content: String = (0..4).map(section).collect();
    ws.write_kb("doc.md", &content);
    ws.sync();

    let client = StubEmbeddingClient::new("stub-model");
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert_eq!(report.chunks_inserted, 4);
    assert_eq!(report.chunks_embedded, 4);
    assert_eq!(chunk_count(&ws), 4);
    assert_eq!(embedding_count(&ws), 4);

    // Unchanged re-run embeds nothing
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert_eq!(report.chunks_inserted, 0);
    assert_eq!(report.chunks_updated, 0);
    assert_eq!(report.chunks_embedded, 0);

    // Edit one section: only that chunk re-embeds
    let edited: String = (0..4)
        .map(|i| {
            if i == 2 {
                "## Topic 2\nThis section was rewritten with different content entirely, \
                 still long enough to stand on its own as a chunk.\n"
                    .to_string()
            } else {
                section(i)
            }
        })
        .collect();
    ws.write_kb("doc.md", &edited);
    ws.sync();
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert_eq!(report.chunks_embedded, 1);
    assert_eq!(chunk_count(&ws), 4);
}

#[test]
fn test_batch_size_cap() {
    let ws = TestWorkspace::new("batching");
    let content: String = (0..60).map(section).collect();
    ws.write_kb("big.md", &content);
    ws.sync();

    let client = StubEmbeddingClient::new("stub-model");
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert_eq!(report.chunks_embedded, 60);

    let sizes = client.batch_sizes.lock().unwrap().clone();
    assert!(sizes.len() >= 2, "60 chunks must split into multiple batches: {sizes:?}");
    assert!(sizes.iter().all(|s| *s <= MAX_BATCH_CHUNKS));
    assert_eq!(sizes.iter().sum::<usize>(), 60);
}

#[test]
fn test_char_budget_caps_batch() {
    let ws = TestWorkspace::new("char-budget");
    // Plant oversized chunk rows directly (their backing file is absent, so
    // phase 1 leaves them untouched): no two 60k-char chunks fit in a 100k
    // batch, so each batch closes at one chunk.
    ws.store
        .conn()
        .execute(
            "INSERT INTO kb_files (id, domain_id, relative_path, content_hash, size_bytes,
                                   last_synced_at, tier)
             VALUES ('ghost-file', ?1, 'ghost.md', 'h', 0, 'now', 'general')",
            params![ws.domain.id],
        )
        .unwrap();
    let blob = "x".repeat(60_000);
    for i in 0..3 {
        ws.store
            .conn()
            .execute(
                "INSERT INTO kb_chunks (id, kb_file_id, domain_id, chunk_index, chunk_key,
                                        heading_path, content, content_hash, file_content_hash,
                                        char_count, token_estimate, start_line, end_line)
                 VALUES (?1, 'ghost-file', ?2, ?3, ?4, '## G', ?5, ?6, 'h', 60000, 15000, 1, 1)",
                params![
                    format!("chunk-{i}"),
                    ws.domain.id,
                    i,
                    format!("key-{i}"),
                    blob,
                    format!("hash-{i}"),
                ],
            )
            .unwrap();
    }

    let client = StubEmbeddingClient::new("stub-model");
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert_eq!(report.chunks_embedded, 3);
    let sizes = client.batch_sizes.lock().unwrap().clone();
    assert_eq!(sizes, vec![1, 1, 1], "char budget must close each batch at one chunk");
}

#[test]
fn test_fingerprint_change_invalidates() {
    let ws = TestWorkspace::new("fingerprint");
    ws.write_kb("doc.md", &section(0));
    ws.sync();

    let client = StubEmbeddingClient::new("stub-model");
    indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert_eq!(embedding_count(&ws), 1);

    // Same model name, new fingerprint: existing embedding is stale
    let mut newer = StubEmbeddingClient::new("stub-model");
    newer.fingerprint = "stub/stub-model-v2".to_string();
    let report = indexer::index_domain(&ws.store, &ws.domain, &newer, None).unwrap();
    assert_eq!(report.chunks_embedded, 1);

    let fp: String = ws
        .store
        .conn()
        .query_row("SELECT provider_fingerprint FROM kb_chunk_embeddings LIMIT 1", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(fp, "stub/stub-model-v2");
}

#[test]
fn test_cancellation_preserves_partial_progress() {
    let ws = TestWorkspace::new("cancel");
    ws.write_kb("doc.md", &(0..3).map(section).collect::<String>());
    ws.sync();

    let cancel = AtomicBool::new(true);
    let client = StubEmbeddingClient::new("stub-model");
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, Some(&cancel)).unwrap();
    assert!(report.cancelled);
    assert_eq!(client.call_count(), 0, "cancelled before any batch");

    let (status, last_error): (String, Option<String>) = ws
        .store
        .conn()
        .query_row(
            "SELECT status, last_error FROM embedding_jobs WHERE domain_id = ?1",
            params![ws.domain.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(status, "idle");
    assert_eq!(last_error.as_deref(), Some("Cancelled"));

    // Next run resumes and finishes the job
    cancel.store(false, Ordering::SeqCst);
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, Some(&cancel)).unwrap();
    assert!(!report.cancelled);
    assert_eq!(embedding_count(&ws), 3);
}

#[test]
fn test_batch_failure_swallowed_run_continues() {
    let ws = TestWorkspace::new("partial");
    let content: String = (0..60).map(section).collect();
    ws.write_kb("big.md", &content);
    ws.sync();

    let client = StubEmbeddingClient::new("stub-model");
    client.fail_call(0);
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();

    // First batch lost, later batches landed, job ends idle
    assert!(report.chunks_embedded > 0);
    assert!((report.chunks_embedded as i64) < 60);
    let status: String = ws
        .store
        .conn()
        .query_row(
            "SELECT status FROM embedding_jobs WHERE domain_id = ?1",
            params![ws.domain.id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(status, "idle");

    // The failed batch is retried on the next run
    let report = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();
    assert!(report.chunks_embedded > 0);
    assert_eq!(embedding_count(&ws), 60);
}

#[test]
fn test_storage_failure_during_embedding_marks_job_error() {
    let ws = TestWorkspace::new("store-fail");
    ws.write_kb("doc.md", &section(0));
    ws.sync();

    // Force the embedding-storage transaction itself to fail; this is a
    // storage failure, not an embedding-batch failure, so the run must
    // terminate with the job marked error rather than continuing.
    ws.store
        .conn()
        .execute_batch(
            "CREATE TRIGGER fail_embed_write BEFORE INSERT ON kb_chunk_embeddings
             BEGIN SELECT RAISE(ABORT, 'simulated disk failure'); END",
        )
        .unwrap();

    let client = StubEmbeddingClient::new("stub-model");
    let err = indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap_err();
    assert_eq!(err.code, domainscope::error::ErrorCode::Db);

    let (status, last_error): (String, Option<String>) = ws
        .store
        .conn()
        .query_row(
            "SELECT status, last_error FROM embedding_jobs WHERE domain_id = ?1",
            params![ws.domain.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(status, "error");
    assert!(last_error.unwrap().contains("simulated disk failure"));
}

#[test]
fn test_search_domain_ranks_matching_chunk_first() {
    let ws = TestWorkspace::new("searching");
    let section_a = "## Alpha\nreferral program economics and incentive design for partners.";
    let section_b = "## Beta\nincident response runbook and escalation ladder for outages.";
    ws.write_kb("a.md", section_a);
    ws.write_kb("b.md", section_b);
    ws.sync();

    let client = StubEmbeddingClient::new("stub-model");
    indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();

    // The stub embeds identical text identically, so querying with one
    // chunk's exact content must rank that chunk first with cosine ~1.
    let hits = indexer::search_domain(
        &ws.store,
        &ws.domain,
        &client,
        section_a,
        &SearchOptions { top_k: 2, min_score: 0.0 },
    )
    .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].relative_path, "a.md");
    assert!(hits[0].score >= 0.999, "exact text match scores ~1: {}", hits[0].score);
    assert!(hits[0].snippet.contains("referral program"));
}

#[test]
fn test_chunk_listing_in_document_order() {
    let ws = TestWorkspace::new("chunk-list");
    ws.write_kb("doc.md", &(0..3).map(section).collect::<String>());
    ws.sync();
    let client = StubEmbeddingClient::new("stub-model");
    indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();

    let files = domainscope::repo::list_kb_files(&ws.store, &ws.domain.id).unwrap();
    let chunks = indexer::list_chunks_for_file(&ws.store, &files[0].id).unwrap();
    assert_eq!(chunks.len(), 3);
    let indexes: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert!(chunks[0].heading_path.contains("Topic 0"));
}

#[test]
fn test_job_status_counters() {
    let ws = TestWorkspace::new("job-status");
    ws.write_kb("a.md", &section(0));
    ws.write_kb("b.md", &section(1));
    ws.sync();

    let client = StubEmbeddingClient::new("stub-model");
    indexer::index_domain(&ws.store, &ws.domain, &client, None).unwrap();

    let job = indexer::job_status(&ws.store, &ws.domain.id, "stub-model").unwrap().unwrap();
    assert_eq!(job.status, domainscope::types::JobState::Idle);
    assert_eq!(job.total_files, 2);
    assert_eq!(job.processed_files, 2);
    assert_eq!(job.total_chunks, 2);
    assert_eq!(job.embedded_chunks, 2);
    assert_eq!(job.provider_fingerprint, "stub/stub-model");

    assert!(indexer::job_status(&ws.store, &ws.domain.id, "other-model").unwrap().is_none());
}
