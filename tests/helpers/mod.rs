//! Shared test harness: an in-memory store plus a temp-dir KB, and a
//! deterministic stub embedding client.

#![allow(dead_code)]

use domainscope::providers::EmbeddingClient;
use domainscope::repo::{self, NewDomain};
use domainscope::scan;
use domainscope::store::Store;
use domainscope::types::Domain;
use std::fs::{self, File, FileTimes};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub struct TestWorkspace {
    pub store: Store,
    pub domain: Domain,
    pub kb_dir: TempDir,
}

impl TestWorkspace {
    pub fn new(name: &str) -> Self {
        let store = Store::open_in_memory().expect("in-memory store");
        let kb_dir = TempDir::new().expect("temp kb dir");
        let domain = repo::create_domain(
            &store,
            NewDomain {
                name: name.to_string(),
                description: format!("{name} test domain"),
                kb_path: kb_dir.path().to_string_lossy().to_string(),
                ..Default::default()
            },
        )
        .expect("create domain");
        Self { store, domain, kb_dir }
    }

    /// Register a second domain backed by its own temp dir (leaked so the
    /// files outlive the call).
    pub fn add_domain(&self, name: &str) -> Domain {
        let dir = TempDir::new().expect("temp kb dir");
        let path = dir.path().to_string_lossy().to_string();
        std::mem::forget(dir);
        repo::create_domain(
            &self.store,
            NewDomain {
                name: name.to_string(),
                description: String::new(),
                kb_path: path,
                ..Default::default()
            },
        )
        .expect("create domain")
    }

    pub fn write_kb(&self, relative: &str, content: &str) {
        let path = self.kb_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn remove_kb(&self, relative: &str) {
        fs::remove_file(self.kb_dir.path().join(relative)).unwrap();
    }

    /// Backdate a KB file's mtime so staleness tests can age it.
    pub fn age_kb_file(&self, relative: &str, days: u64) {
        age_file(&self.kb_dir.path().join(relative), days);
    }

    pub fn sync(&self) -> scan::SyncReport {
        scan::sync_domain(&self.store, &self.domain).expect("sync")
    }
}

pub fn age_file(path: &Path, days: u64) {
    let mtime = SystemTime::now() - Duration::from_secs(days * 86_400);
    let file = File::options().write(true).open(path).expect("open for utimes");
    file.set_times(FileTimes::new().set_modified(mtime)).expect("set mtime");
}

// ---------------------------------------------------------------------------
// Stub embedding client
// ---------------------------------------------------------------------------

/// Deterministic embedding stub: vectors derive from a hash of the text, so
/// identical text always embeds identically. Individual batch calls can be
/// made to fail.
pub struct StubEmbeddingClient {
    pub dims: usize,
    pub model: String,
    pub fingerprint: String,
    pub calls: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
    pub failing_calls: Mutex<Vec<usize>>,
}

impl StubEmbeddingClient {
    pub fn new(model: &str) -> Self {
        Self {
            dims: 8,
            model: model.to_string(),
            fingerprint: format!("stub/{model}"),
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            failing_calls: Mutex::new(Vec::new()),
        }
    }

    /// Make the Nth embed() call (0-based) return an error.
    pub fn fail_call(&self, call_index: usize) {
        self.failing_calls.lock().unwrap().push(call_index);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = domainscope::hash::sha256_hex(text.as_bytes());
        digest
            .as_bytes()
            .chunks(8)
            .take(self.dims)
            .map(|chunk| {
                let sum: u32 = chunk.iter().map(|b| *b as u32).sum();
                (sum % 1000) as f32 / 1000.0
            })
            .collect()
    }
}

impl EmbeddingClient for StubEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn embed(&self, texts: &[String]) -> domainscope::Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        if self.failing_calls.lock().unwrap().contains(&call) {
            return Err(domainscope::CoreError::llm("stub batch failure"));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
