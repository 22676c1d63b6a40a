//! Vector math and diversity-aware semantic search over stored embeddings.
//!
//! Embeddings are stored as packed little-endian f32 blobs. Search scores
//! are cosine similarity plus an anchor-heading boost, with MMR-style
//! penalties so one file or section cannot dominate the result set.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

/// Pack a vector as little-endian f32 bytes (`len × 4`).
pub fn pack_f32(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpack little-endian f32 bytes. `None` when the byte length does not match
/// `expected_len` floats.
pub fn unpack_f32(bytes: &[u8], expected_len: usize) -> Option<Vec<f32>> {
    if bytes.len() != expected_len * 4 {
        return None;
    }
    let mut out = Vec::with_capacity(expected_len);
    for window in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([window[0], window[1], window[2], window[3]]));
    }
    Some(out)
}

/// Cosine similarity of two same-length vectors. Zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

// ---------------------------------------------------------------------------
// Anchor-heading boost
// ---------------------------------------------------------------------------

const ANCHOR_BOOST: f32 = 0.1;

fn anchor_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(STATUS|OPEN\s*GAPS?|DEADLINE|PRIORITIES|NEXT\s*ACTIONS?|OVERDUE|CRITICAL)\b")
            .unwrap()
    })
}

/// `+0.1` for headings that carry operational anchors (status, gaps,
/// deadlines, …), `0` otherwise.
pub fn anchor_heading_boost(heading_path: &str) -> f32 {
    if anchor_heading_re().is_match(heading_path) {
        ANCHOR_BOOST
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Diversity search
// ---------------------------------------------------------------------------

/// A stored embedding joined with the chunk coordinates the penalties need.
#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub chunk_id: String,
    pub kb_file_id: String,
    pub heading_path: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { top_k: 8, min_score: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub kb_file_id: String,
    pub heading_path: String,
    pub score: f32,
}

const SAME_SECTION_PENALTY: f32 = 0.30;
const SAME_FILE_PENALTY: f32 = 0.10;

/// Greedy MMR-style selection: repeatedly take the best remaining candidate,
/// then penalize the rest for sharing its file/section. Ties break on input
/// order; empty input yields empty output.
pub fn search_with_diversity(
    query: &[f32],
    candidates: &[SearchCandidate],
    opts: &SearchOptions,
) -> Vec<SearchHit> {
    let mut remaining: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(query, &c.vector) + anchor_heading_boost(&c.heading_path)))
        .filter(|(_, score)| *score >= opts.min_score)
        .collect();

    let mut picked: Vec<SearchHit> = Vec::new();
    while picked.len() < opts.top_k && !remaining.is_empty() {
        let mut best = 0usize;
        for i in 1..remaining.len() {
            if remaining[i].1 > remaining[best].1 {
                best = i;
            }
        }
        // Order-preserving removal keeps tie-breaks anchored to input order
        // across iterations; candidate sets are small enough that the shift
        // cost does not matter.
        let (idx, score) = remaining.remove(best);
        let chosen = &candidates[idx];
        picked.push(SearchHit {
            chunk_id: chosen.chunk_id.clone(),
            kb_file_id: chosen.kb_file_id.clone(),
            heading_path: chosen.heading_path.clone(),
            score,
        });

        for (other_idx, other_score) in remaining.iter_mut() {
            let other = &candidates[*other_idx];
            if other.kb_file_id == chosen.kb_file_id {
                if other.heading_path == chosen.heading_path {
                    *other_score -= SAME_SECTION_PENALTY;
                } else {
                    *other_score -= SAME_FILE_PENALTY;
                }
            }
        }
    }
    picked
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
