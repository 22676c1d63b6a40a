//! KB directory scanner and database sync.
//!
//! Walks a domain's `kb_path`, content-hashes every markdown file, and
//! reconciles the result against the `kb_files` table in one transaction.
//! Re-running against an unchanged tree is a no-op (`{0, 0, 0}`).

use crate::error::{CoreError, Result};
use crate::hash::sha256_hex;
use crate::staleness::classify_tier;
use crate::store::{new_id, now_iso, Store};
use crate::types::{Domain, TierSource};
use ignore::WalkBuilder;
use rayon::prelude::*;
use rusqlite::params;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory names never descended into during a KB walk.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".worktrees",
    "dist",
    "out",
    "build",
    ".next",
    ".cache",
    "coverage",
    "__pycache__",
];

// ---------------------------------------------------------------------------
// Filesystem walk
// ---------------------------------------------------------------------------

/// A markdown file discovered on disk, hashed and sized.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub size_bytes: i64,
}

/// Recursively collect every `.md` file under `kb_path`, skipping ignored
/// directories, and hash contents in parallel.
pub fn scan_kb_dir(kb_path: &Path) -> Result<Vec<ScannedFile>> {
    if !kb_path.is_dir() {
        return Err(CoreError::io(format!("kb_path is not a directory: {}", kb_path.display())));
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    let walker = WalkBuilder::new(kb_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return !IGNORED_DIRS.contains(&name.as_ref());
            }
            true
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.into_path();
        let is_md = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md"));
        if is_md {
            paths.push(path);
        }
    }

    let mut files: Vec<ScannedFile> = paths
        .par_iter()
        .filter_map(|abs_path| {
            let contents = fs::read(abs_path).ok()?;
            let relative_path = abs_path
                .strip_prefix(kb_path)
                .unwrap_or(abs_path)
                .to_string_lossy()
                .replace('\\', "/");
            Some(ScannedFile {
                relative_path,
                absolute_path: abs_path.clone(),
                content_hash: sha256_hex(&contents),
                size_bytes: contents.len() as i64,
            })
        })
        .collect();

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

struct ExistingRow {
    id: String,
    content_hash: String,
    tier_source: TierSource,
}

/// Reconcile scanned files against the `kb_files` table for one domain, in a
/// single transaction. Manual tier overrides are never re-classified; deletes
/// cascade to chunks and embeddings.
pub fn sync(store: &Store, domain_id: &str, scanned: &[ScannedFile]) -> Result<SyncReport> {
    store.with_tx(|tx| {
        let mut existing: HashMap<String, ExistingRow> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, relative_path, content_hash, tier_source
                 FROM kb_files WHERE domain_id = ?1",
            )?;
            let rows = stmt.query_map(params![domain_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in rows {
                let (id, relative_path, content_hash, tier_source) = row?;
                let tier_source = TierSource::parse(&tier_source).ok_or_else(|| {
                    CoreError::parse(format!("bad tier_source in kb_files: {tier_source}"))
                })?;
                existing.insert(relative_path, ExistingRow { id, content_hash, tier_source });
            }
        }

        let now = now_iso();
        let mut report = SyncReport::default();

        for file in scanned {
            match existing.remove(&file.relative_path) {
                None => {
                    let tier = classify_tier(&file.relative_path);
                    tx.execute(
                        "INSERT INTO kb_files
                           (id, domain_id, relative_path, content_hash, size_bytes,
                            last_synced_at, tier, tier_source)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'inferred')",
                        params![
                            new_id(),
                            domain_id,
                            file.relative_path,
                            file.content_hash,
                            file.size_bytes,
                            now,
                            tier.as_str(),
                        ],
                    )?;
                    report.added += 1;
                }
                Some(row) if row.content_hash != file.content_hash => {
                    if row.tier_source == TierSource::Inferred {
                        let tier = classify_tier(&file.relative_path);
                        tx.execute(
                            "UPDATE kb_files
                             SET content_hash = ?1, size_bytes = ?2, last_synced_at = ?3, tier = ?4
                             WHERE id = ?5",
                            params![
                                file.content_hash,
                                file.size_bytes,
                                now,
                                tier.as_str(),
                                row.id
                            ],
                        )?;
                    } else {
                        tx.execute(
                            "UPDATE kb_files
                             SET content_hash = ?1, size_bytes = ?2, last_synced_at = ?3
                             WHERE id = ?4",
                            params![file.content_hash, file.size_bytes, now, row.id],
                        )?;
                    }
                    report.updated += 1;
                }
                Some(_) => {}
            }
        }

        // Anything left in `existing` vanished on disk.
        for row in existing.values() {
            tx.execute("DELETE FROM kb_files WHERE id = ?1", params![row.id])?;
            report.deleted += 1;
        }

        debug!(
            domain_id,
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            "KB sync complete"
        );
        Ok(report)
    })
}

/// Walk a domain's KB directory and sync the result.
pub fn sync_domain(store: &Store, domain: &Domain) -> Result<SyncReport> {
    let scanned = scan_kb_dir(Path::new(&domain.kb_path))?;
    sync(store, &domain.id, &scanned)
}
