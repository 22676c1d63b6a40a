//! Heading-aware markdown chunker with content-anchored stable identity.
//!
//! Files are split into hierarchically-addressed sections; each final chunk
//! gets a `chunk_key` that survives whitespace-only edits and section
//! reordering but changes on heading renames. Small sections are merged
//! forward, oversized sections are split with tail overlap.

use crate::hash::sha256_hex;

// ---------------------------------------------------------------------------
// Configuration and output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Sections with a trimmed body shorter than this are merged into the
    /// following section.
    pub min_chunk_chars: usize,
    /// Sections longer than this are split into sub-chunks.
    pub max_chunk_chars: usize,
    /// Tail overlap carried between consecutive sub-chunks of a split.
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { min_chunk_chars: 100, max_chunk_chars: 1500, overlap_chars: 200 }
    }
}

/// A chunk produced by the chunker, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub chunk_index: i64,
    pub chunk_key: String,
    pub heading_path: String,
    pub content: String,
    pub content_hash: String,
    pub char_count: i64,
    pub token_estimate: i64,
    pub start_line: i64,
    pub end_line: i64,
}

/// Heading path assigned to a frontmatter chunk.
pub const FRONTMATTER_PATH: &str = "[frontmatter]";

// ---------------------------------------------------------------------------
// Anchor normalization
// ---------------------------------------------------------------------------

/// Canonicalize a section body for stable-identity hashing: normalize line
/// endings, strip the heading line, collapse whitespace outside code fences,
/// preserve code-fence line structure verbatim.
pub fn anchor_normalize(content: &str, heading_line: Option<&str>) -> String {
    let mut text = content.replace("\r\n", "\n").replace('\r', "\n");

    if let Some(heading) = heading_line {
        if let Some(pos) = text.find(heading) {
            text.replace_range(pos..pos + heading.len(), "");
        }
    }

    let text = text.trim();
    let mut out = String::with_capacity(text.len());
    let mut words: Vec<&str> = Vec::new();
    let mut in_code = false;

    let flush_words = |out: &mut String, words: &mut Vec<&str>| {
        if words.is_empty() {
            return;
        }
        if !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(&words.join(" "));
        words.clear();
    };

    for line in text.split('\n') {
        if line.trim_start().starts_with("```") {
            flush_words(&mut out, &mut words);
            if !out.is_empty() && !out.ends_with('\n') {
                out.push(' ');
            }
            out.push_str(line);
            out.push('\n');
            in_code = !in_code;
            continue;
        }
        if in_code {
            out.push_str(line);
            out.push('\n');
        } else {
            words.extend(line.split_whitespace());
        }
    }
    flush_words(&mut out, &mut words);

    out.trim_end_matches('\n').to_string()
}

/// First `n` chars of a string (char-aware, never splits a code point).
fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Stable chunk identity: a function of the file id, the heading path, and
/// the anchor-normalized first 256 chars of the body.
pub fn compute_chunk_key(file_id: &str, heading_path: &str, anchor_body: &str) -> String {
    let anchor_input = format!("{heading_path}\n{}", take_chars(anchor_body, 256));
    let inner = sha256_hex(anchor_input.as_bytes());
    sha256_hex(format!("{file_id}{heading_path}{inner}").as_bytes())
}

// ---------------------------------------------------------------------------
// Section parsing
// ---------------------------------------------------------------------------

struct Section {
    heading_path: String,
    heading_line: Option<String>,
    lines: Vec<String>,
    /// 1-based line of the first line in `lines`.
    start_line: usize,
}

fn heading_level(line: &str) -> Option<(usize, &str)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    Some((hashes, rest.trim()))
}

fn parse_sections(lines: &[&str]) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();

    // Preamble before the first heading belongs to an unaddressed section.
    let mut current = Section {
        heading_path: String::new(),
        heading_line: None,
        lines: Vec::new(),
        start_line: 1,
    };

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        if let Some((level, text)) = heading_level(line) {
            if !current.lines.is_empty() {
                sections.push(current);
            }
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, text.to_string()));
            let heading_path = stack
                .iter()
                .map(|(l, t)| format!("{} {t}", "#".repeat(*l)))
                .collect::<Vec<_>>()
                .join(" > ");
            current = Section {
                heading_path,
                heading_line: Some((*line).to_string()),
                lines: vec![(*line).to_string()],
                start_line: line_no,
            };
        } else {
            current.lines.push((*line).to_string());
        }
    }
    if !current.lines.is_empty() {
        sections.push(current);
    }
    sections
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Split markdown content into chunks with stable keys. Total: never fails,
/// returns `[]` for empty or whitespace-only input.
pub fn chunk_markdown(file_id: &str, content: &str, config: &ChunkerConfig) -> Vec<ChunkData> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.trim().is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = normalized.split('\n').collect();

    let mut raw: Vec<(String, Option<String>, String, usize, usize)> = Vec::new();

    // Frontmatter: a leading `---` fence becomes its own chunk. An unclosed
    // fence swallows the whole file.
    let mut body_start = 0usize;
    if lines.first().map(|l| l.trim()) == Some("---") {
        let close = lines.iter().skip(1).position(|l| l.trim() == "---");
        let end = match close {
            Some(offset) => 1 + offset,
            None => lines.len() - 1,
        };
        let fm_content = lines[..=end].join("\n");
        raw.push((FRONTMATTER_PATH.to_string(), None, fm_content, 1, end + 1));
        body_start = end + 1;
    }

    // Heading sections with small-section forward merge.
    let sections = parse_sections(&lines[body_start..]);
    let line_offset = body_start;

    let mut carry_lines: Vec<String> = Vec::new();
    let mut carry_start: Option<usize> = None;
    let section_count = sections.len();
    for (i, section) in sections.into_iter().enumerate() {
        let own_body = section.lines.join("\n");
        let start_line = carry_start.unwrap_or(section.start_line + line_offset);

        let is_small = own_body.trim().len() < config.min_chunk_chars;
        if is_small && i + 1 < section_count {
            if carry_start.is_none() {
                carry_start = Some(section.start_line + line_offset);
            }
            carry_lines.extend(section.lines);
            continue;
        }

        let mut full_lines = std::mem::take(&mut carry_lines);
        carry_start = None;
        full_lines.extend(section.lines);
        let content = full_lines.join("\n");
        if content.trim().is_empty() {
            continue;
        }
        let end_line = start_line + full_lines.len() - 1;
        raw.push((section.heading_path, section.heading_line, content, start_line, end_line));
    }

    // Oversized sections split into sub-chunks with tail overlap; only the
    // first sub-chunk keeps the heading line for anchor purposes.
    let mut chunks: Vec<ChunkData> = Vec::new();
    for (heading_path, heading_line, content, start_line, end_line) in raw {
        if content.len() <= config.max_chunk_chars {
            push_chunk(
                &mut chunks,
                file_id,
                &heading_path,
                heading_line.as_deref(),
                &content,
                start_line,
                end_line,
            );
            continue;
        }

        let mut offset = 0usize;
        let mut first = true;
        while offset < content.len() {
            let mut end = (offset + config.max_chunk_chars).min(content.len());
            while end < content.len() && !content.is_char_boundary(end) {
                end -= 1;
            }
            let piece = &content[offset..end];
            let piece_start = start_line + content[..offset].matches('\n').count();
            let piece_end = start_line + content[..end].matches('\n').count();
            let anchor_heading = if first { heading_line.as_deref() } else { None };
            push_chunk(
                &mut chunks,
                file_id,
                &heading_path,
                anchor_heading,
                piece,
                piece_start,
                piece_end,
            );
            first = false;
            if end == content.len() {
                break;
            }
            let mut next = end.saturating_sub(config.overlap_chars).max(offset + 1);
            while !content.is_char_boundary(next) {
                next += 1;
            }
            offset = next;
        }
    }

    for (idx, chunk) in chunks.iter_mut().enumerate() {
        chunk.chunk_index = idx as i64;
    }
    chunks
}

fn push_chunk(
    chunks: &mut Vec<ChunkData>,
    file_id: &str,
    heading_path: &str,
    heading_line: Option<&str>,
    content: &str,
    start_line: usize,
    end_line: usize,
) {
    let anchor_body = anchor_normalize(content, heading_line);
    let chunk_key = compute_chunk_key(file_id, heading_path, &anchor_body);
    let char_count = content.chars().count() as i64;
    chunks.push(ChunkData {
        chunk_index: 0,
        chunk_key,
        heading_path: heading_path.to_string(),
        content: content.to_string(),
        content_hash: sha256_hex(content.trim().as_bytes()),
        char_count,
        token_estimate: (char_count + 3) / 4,
        start_line: start_line as i64,
        end_line: end_line as i64,
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> Vec<ChunkData> {
        chunk_markdown("file-1", content, &ChunkerConfig::default())
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(chunk("").is_empty());
        assert!(chunk("   \n\n  ").is_empty());
    }

    #[test]
    fn test_whitespace_reflow_keeps_key() {
        let a = chunk("## Status\nThe domain is active with ongoing projects.");
        let b = chunk("## Status\nThe  domain   is active with ongoing  projects.");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].chunk_key, b[0].chunk_key);
        // Content hash differs; only the anchor identity is whitespace-blind
        assert_ne!(a[0].content_hash, b[0].content_hash);
    }

    #[test]
    fn test_heading_rename_changes_key() {
        let long_body = "x".repeat(120);
        let a = chunk(&format!("## Status\n{long_body}"));
        let b = chunk(&format!("## State\n{long_body}"));
        assert_ne!(a[0].chunk_key, b[0].chunk_key);
    }

    #[test]
    fn test_inserting_section_above_keeps_later_keys() {
        let body1 = "alpha ".repeat(30);
        let body2 = "beta ".repeat(30);
        let original = format!("## One\n{body1}\n## Two\n{body2}");
        let inserted = format!("## Zero\n{}\n## One\n{body1}\n## Two\n{body2}", "intro ".repeat(30));

        let a = chunk(&original);
        let b = chunk(&inserted);
        let key_two_a = a.iter().find(|c| c.heading_path.ends_with("## Two")).unwrap();
        let key_two_b = b.iter().find(|c| c.heading_path.ends_with("## Two")).unwrap();
        assert_eq!(key_two_a.chunk_key, key_two_b.chunk_key);
        // Line numbers shift; identity does not
        assert_ne!(key_two_a.start_line, key_two_b.start_line);
    }

    #[test]
    fn test_frontmatter_chunk() {
        let chunks = chunk("---\ntitle: test\n---\n## Body\ncontent here padded to be long enough for a section body to stand on its own without merge.");
        assert_eq!(chunks[0].heading_path, FRONTMATTER_PATH);
        assert!(chunks[0].content.starts_with("---"));
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn test_unclosed_frontmatter_is_whole_file() {
        let chunks = chunk("---\ntitle: test\nnever closed");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading_path, FRONTMATTER_PATH);
    }

    #[test]
    fn test_heading_path_nesting() {
        let body = "text ".repeat(30);
        let chunks = chunk(&format!("## Status\n{body}\n### Open\n{body}\n## Next\n{body}"));
        let paths: Vec<&str> = chunks.iter().map(|c| c.heading_path.as_str()).collect();
        assert!(paths.contains(&"## Status"));
        assert!(paths.contains(&"## Status > ### Open"));
        assert!(paths.contains(&"## Next"));
    }

    #[test]
    fn test_small_section_merges_forward() {
        let big = "word ".repeat(60);
        let chunks = chunk(&format!("## Tiny\nshort\n## Big\n{big}"));
        assert_eq!(chunks.len(), 1);
        // Merged chunk keeps the later section's heading but the earlier start
        assert_eq!(chunks[0].heading_path, "## Big");
        assert_eq!(chunks[0].start_line, 1);
        assert!(chunks[0].content.contains("## Tiny"));
    }

    #[test]
    fn test_large_section_splits_with_overlap() {
        let config = ChunkerConfig::default();
        let body: String = (0..200).map(|i| format!("line {i} of filler text\n")).collect();
        let chunks = chunk(&format!("## Big\n{body}"));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= config.max_chunk_chars);
            assert_eq!(c.heading_path, "## Big");
        }
        // Tail overlap: the start of chunk N+1 repeats the tail of chunk N
        let tail: String =
            chunks[0].content.chars().rev().take(50).collect::<Vec<_>>().into_iter().rev().collect();
        assert!(chunks[1].content.starts_with(tail.chars().next().unwrap()));
        // Keys are distinct per sub-chunk
        assert_ne!(chunks[0].chunk_key, chunks[1].chunk_key);
    }

    #[test]
    fn test_code_fences_preserved_in_anchor() {
        let normalized = anchor_normalize(
            "## H\nsome   text\n```\nlet  x = 1;\nlet y = 2;\n```\nmore    text",
            Some("## H"),
        );
        assert!(normalized.contains("let  x = 1;\nlet y = 2;"));
        assert!(normalized.contains("some text"));
        assert!(normalized.contains("more text"));
    }

    #[test]
    fn test_token_estimate_is_ceil_quarter() {
        let chunks = chunk(&format!("## S\n{}", "abcd".repeat(30)));
        let c = &chunks[0];
        assert_eq!(c.token_estimate, (c.char_count + 3) / 4);
    }

    #[test]
    fn test_crlf_normalized() {
        let a = chunk("## Status\r\nThe domain is active with ongoing projects.");
        let b = chunk("## Status\nThe domain is active with ongoing projects.");
        assert_eq!(a[0].chunk_key, b[0].chunk_key);
    }
}
