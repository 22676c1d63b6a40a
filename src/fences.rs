//! Parsers for the structured fence blocks an LLM emits in its replies:
//! `kb-update`, `decision`, and `advisory-<type>`.
//!
//! Parsing is total: every input yields a well-formed set of proposals plus
//! rejection records; nothing escapes as an error. Input line endings are
//! normalized to `\n` before matching. The LLM is a trust boundary — file
//! paths are traversal-checked and tier write rules are enforced here, not
//! at apply time only.

use crate::hash::fnv1a64;
use crate::staleness::classify_tier;
use crate::types::Tier;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Create,
    Update,
    Delete,
}

impl UpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateAction::Create => "create",
            UpdateAction::Update => "update",
            UpdateAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(UpdateAction::Create),
            "update" => Some(UpdateAction::Update),
            "delete" => Some(UpdateAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Full,
    Append,
    Patch,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Full => "full",
            WriteMode::Append => "append",
            WriteMode::Patch => "patch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(WriteMode::Full),
            "append" => Some(WriteMode::Append),
            "patch" => Some(WriteMode::Patch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateBasis {
    Primary,
    Sibling,
    External,
    User,
}

impl UpdateBasis {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(UpdateBasis::Primary),
            "sibling" => Some(UpdateBasis::Sibling),
            "external" => Some(UpdateBasis::External),
            "user" => Some(UpdateBasis::User),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// KB-update proposals and rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct KbUpdateProposal {
    pub file: String,
    pub action: UpdateAction,
    pub tier: Tier,
    pub mode: WriteMode,
    pub basis: UpdateBasis,
    pub reasoning: String,
    pub content: String,
    pub confirm: Option<String>,
}

/// Machine-readable rejection codes for kb-update blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionCode {
    MissingFields,
    InvalidAction(String),
    PathTraversal,
    StructuralRequiresPatch,
    StatusNoPatch,
    DeleteNeedsConfirm,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::MissingFields => "MISSING_FIELDS",
            RejectionCode::InvalidAction(_) => "INVALID_ACTION",
            RejectionCode::PathTraversal => "PATH_TRAVERSAL",
            RejectionCode::StructuralRequiresPatch => "STRUCTURAL_REQUIRES_PATCH",
            RejectionCode::StatusNoPatch => "STATUS_NO_PATCH",
            RejectionCode::DeleteNeedsConfirm => "DELETE_NEEDS_CONFIRM",
        }
    }

    /// Human-readable reason shown to the user.
    pub fn reason(&self) -> String {
        match self {
            RejectionCode::MissingFields => {
                "Missing required fields (file, action, reasoning).".to_string()
            }
            RejectionCode::InvalidAction(value) => {
                format!("Invalid action: '{value}'. Expected create, update, or delete.")
            }
            RejectionCode::PathTraversal => "File path rejected: path traversal.".to_string(),
            RejectionCode::StructuralRequiresPatch => {
                "Structural tier files accept patch mode only.".to_string()
            }
            RejectionCode::StatusNoPatch => {
                "Status tier files are rewritten wholesale; patch mode is not allowed.".to_string()
            }
            RejectionCode::DeleteNeedsConfirm => {
                "Delete requires an explicit confirmation line.".to_string()
            }
        }
    }

    fn suggested_fix(&self, file: &str) -> Option<String> {
        match self {
            RejectionCode::StructuralRequiresPatch => Some("Change mode to patch.".to_string()),
            RejectionCode::StatusNoPatch => {
                Some("Change mode to full or append for status tier files.".to_string())
            }
            RejectionCode::DeleteNeedsConfirm => Some(format!("Add: confirm: DELETE {file}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedProposal {
    /// Deterministic FNV-1a id over the rejection coordinates.
    pub id: String,
    pub file: Option<String>,
    pub action: Option<String>,
    pub reasoning: Option<String>,
    pub rejection_code: String,
    pub rejection_reason: String,
    pub suggested_fix: Option<String>,
    pub tier: Option<Tier>,
    pub mode: Option<WriteMode>,
    pub raw_excerpt: String,
}

/// Result of scanning one response for kb-update blocks. Rejections are data,
/// not errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KbUpdateParse {
    pub proposals: Vec<KbUpdateProposal>,
    pub rejected_proposals: Vec<RejectedProposal>,
}

// ---------------------------------------------------------------------------
// Header and excerpt helpers
// ---------------------------------------------------------------------------

fn kb_update_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```kb-update\n(.*?)```").unwrap())
}

fn parse_header(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            if key.is_empty() || key.contains(' ') {
                continue;
            }
            map.entry(key).or_insert_with(|| value.trim().to_string());
        }
    }
    map
}

/// First 200 chars of a block with control characters (except `\t \n \r`)
/// replaced by spaces.
fn raw_excerpt(block: &str) -> String {
    block
        .chars()
        .take(200)
        .map(|c| {
            if c.is_control() && c != '\t' && c != '\n' && c != '\r' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

fn rejection_id(
    file: &str,
    action: &str,
    code: &RejectionCode,
    tier: Option<Tier>,
    mode: Option<WriteMode>,
) -> String {
    let input = format!(
        "{file}|{action}|{}|{}|{}",
        code.as_str(),
        tier.map(|t| t.as_str()).unwrap_or(""),
        mode.map(|m| m.as_str()).unwrap_or(""),
    );
    format!("{:016x}", fnv1a64(&input))
}

// ---------------------------------------------------------------------------
// Path traversal defense
// ---------------------------------------------------------------------------

/// Normalize a path using POSIX conventions and decide whether it could
/// escape the KB root or address an absolute location.
pub fn is_path_traversal(path: &str) -> bool {
    if path.contains('\0') {
        return true;
    }
    // Absolute on POSIX conventions
    if path.starts_with('/') {
        return true;
    }
    // Absolute on Windows conventions: drive letter or UNC/rooted backslash
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return true;
    }
    if path.starts_with('\\') {
        return true;
    }

    let forward = path.replace('\\', "/");
    let mut stack: Vec<&str> = Vec::new();
    let mut escaped = false;
    for part in forward.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    escaped = true;
                }
            }
            other => stack.push(other),
        }
    }
    let normalized = stack.join("/");
    escaped
        || normalized == ".."
        || normalized.starts_with("../")
        || normalized.contains("/../")
        || normalized.starts_with('/')
}

// ---------------------------------------------------------------------------
// KB-update parsing
// ---------------------------------------------------------------------------

/// Scan a response for ```kb-update``` blocks. Always returns a well-formed
/// split of accepted proposals and rejections; blocks with no `file:` line
/// are not even attempts and are ignored.
pub fn parse_kb_updates(text: &str) -> KbUpdateParse {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = KbUpdateParse::default();

    for captures in kb_update_re().captures_iter(&normalized) {
        let body = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let excerpt = raw_excerpt(body);

        let reject = |file: Option<&str>,
                          action: Option<&str>,
                          reasoning: Option<&str>,
                          code: RejectionCode,
                          tier: Option<Tier>,
                          mode: Option<WriteMode>,
                          out: &mut KbUpdateParse| {
            let file_str = file.unwrap_or("");
            let action_str = action.unwrap_or("");
            out.rejected_proposals.push(RejectedProposal {
                id: rejection_id(file_str, action_str, &code, tier, mode),
                file: file.map(|s| s.to_string()),
                action: action.map(|s| s.to_string()),
                reasoning: reasoning.map(|s| s.to_string()),
                rejection_code: code.as_str().to_string(),
                rejection_reason: code.reason(),
                suggested_fix: code.suggested_fix(file_str),
                tier,
                mode,
                raw_excerpt: excerpt.clone(),
            });
        };

        // Step 1: the `\n---\n` separator splits header from payload.
        let (header_text, content) = match body.split_once("\n---\n") {
            Some((header, content)) => (header, content),
            None => {
                let header = parse_header(body);
                if header.contains_key("file") {
                    let file = header.get("file").map(|s| s.as_str());
                    let action = header.get("action").map(|s| s.as_str());
                    reject(file, action, None, RejectionCode::MissingFields, None, None, &mut out);
                }
                continue;
            }
        };

        let header = parse_header(header_text);
        // Step 2: no file → not an attempt.
        let file = match header.get("file") {
            Some(f) if !f.is_empty() => f.clone(),
            _ => continue,
        };

        // Step 3: action and reasoning are mandatory.
        let action_raw = header.get("action").cloned();
        let reasoning = header.get("reasoning").cloned();
        let (action_raw, reasoning) = match (action_raw, reasoning) {
            (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() => (a, r),
            (a, r) => {
                reject(
                    Some(file.as_str()),
                    a.as_deref(),
                    r.as_deref(),
                    RejectionCode::MissingFields,
                    None,
                    None,
                    &mut out,
                );
                continue;
            }
        };

        // Step 4: action must be a known verb.
        let action = match UpdateAction::parse(&action_raw) {
            Some(a) => a,
            None => {
                reject(
                    Some(file.as_str()),
                    Some(action_raw.as_str()),
                    Some(reasoning.as_str()),
                    RejectionCode::InvalidAction(action_raw.clone()),
                    None,
                    None,
                    &mut out,
                );
                continue;
            }
        };

        // Step 5: traversal defense.
        if is_path_traversal(&file) {
            reject(
                Some(file.as_str()),
                Some(action.as_str()),
                Some(reasoning.as_str()),
                RejectionCode::PathTraversal,
                None,
                None,
                &mut out,
            );
            continue;
        }

        // Step 6: derive tier/mode/basis, falling back to defaults on
        // unknown values.
        let tier = header
            .get("tier")
            .and_then(|t| Tier::parse(t))
            .unwrap_or_else(|| classify_tier(&file));
        let mode =
            header.get("mode").and_then(|m| WriteMode::parse(m)).unwrap_or(WriteMode::Full);
        let basis =
            header.get("basis").and_then(|b| UpdateBasis::parse(b)).unwrap_or(UpdateBasis::Primary);

        // Step 7: tier write rules.
        if tier == Tier::Structural && mode != WriteMode::Patch {
            reject(
                Some(file.as_str()),
                Some(action.as_str()),
                Some(reasoning.as_str()),
                RejectionCode::StructuralRequiresPatch,
                Some(tier),
                Some(mode),
                &mut out,
            );
            continue;
        }
        if tier == Tier::Status && mode == WriteMode::Patch {
            reject(
                Some(file.as_str()),
                Some(action.as_str()),
                Some(reasoning.as_str()),
                RejectionCode::StatusNoPatch,
                Some(tier),
                Some(mode),
                &mut out,
            );
            continue;
        }

        // Step 8: deletes need an exact confirmation line.
        let confirm = header.get("confirm").cloned();
        if action == UpdateAction::Delete {
            let expected = format!("DELETE {file}");
            if confirm.as_deref() != Some(expected.as_str()) {
                reject(
                    Some(file.as_str()),
                    Some(action.as_str()),
                    Some(reasoning.as_str()),
                    RejectionCode::DeleteNeedsConfirm,
                    Some(tier),
                    Some(mode),
                    &mut out,
                );
                continue;
            }
        }

        out.proposals.push(KbUpdateProposal {
            file,
            action,
            tier,
            mode,
            basis,
            reasoning,
            content: content.trim_end().to_string(),
            confirm,
        });
    }

    out
}

// ---------------------------------------------------------------------------
// Decision blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DecisionBlock {
    pub decision_id: String,
    pub decision: String,
    pub confidence: Option<String>,
    pub horizon: Option<String>,
    pub reversibility_class: Option<String>,
    pub category: Option<String>,
    pub linked_files: Vec<String>,
}

fn decision_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```decision\n(.*?)```").unwrap())
}

fn validated_enum(value: Option<&String>, allowed: &[&str]) -> Option<String> {
    value.map(|v| v.to_lowercase()).filter(|v| allowed.contains(&v.as_str()))
}

/// Scan a response for ```decision``` blocks. Blocks missing `decision_id`
/// or `decision` are skipped silently; invalid enum values become `None`
/// rather than dropping the block.
pub fn parse_decision_blocks(text: &str) -> Vec<DecisionBlock> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = Vec::new();

    for captures in decision_re().captures_iter(&normalized) {
        let body = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let header = parse_header(body);

        let decision_id = match header.get("decision_id") {
            Some(id) if !id.is_empty() => id.clone(),
            _ => continue,
        };
        let decision = match header.get("decision") {
            Some(d) if !d.is_empty() => d.clone(),
            _ => continue,
        };

        let linked_files = header
            .get("linked_files")
            .map(|raw| {
                raw.split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        out.push(DecisionBlock {
            decision_id,
            decision,
            confidence: validated_enum(header.get("confidence"), &["high", "medium", "low"]),
            horizon: validated_enum(
                header.get("horizon"),
                &["immediate", "near_term", "strategic"],
            ),
            reversibility_class: validated_enum(
                header.get("reversibility_class"),
                &["reversible", "irreversible"],
            ),
            category: validated_enum(
                header.get("category"),
                &["strategic", "tactical", "operational"],
            ),
            linked_files,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Advisory blocks
// ---------------------------------------------------------------------------

/// What the producer asked to happen with the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryPersist {
    No,
    Yes,
    Archive,
}

impl AdvisoryPersist {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no" => Some(AdvisoryPersist::No),
            "yes" => Some(AdvisoryPersist::Yes),
            "archive" => Some(AdvisoryPersist::Archive),
            _ => None,
        }
    }
}

pub const ADVISORY_TYPES: &[&str] =
    &["brainstorm", "risk_assessment", "scenario", "strategic_review"];

#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryBlock {
    pub artifact_type: String,
    pub schema_version: i64,
    pub persist: AdvisoryPersist,
    pub title: String,
    pub fingerprint: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryRejection {
    pub artifact_type: String,
    pub reason: String,
    pub raw_excerpt: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdvisoryParse {
    pub blocks: Vec<AdvisoryBlock>,
    pub rejected: Vec<AdvisoryRejection>,
}

fn advisory_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```advisory-([a-z_]+)\n(.*?)```").unwrap())
}

/// Required payload array per advisory type.
fn payload_list_key(artifact_type: &str) -> &'static str {
    match artifact_type {
        "brainstorm" => "options",
        "risk_assessment" => "risks",
        "scenario" => "scenarios",
        _ => "sections",
    }
}

/// Scan a response for ```advisory-<type>``` JSON blocks.
pub fn parse_advisory_blocks(text: &str) -> AdvisoryParse {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = AdvisoryParse::default();

    for captures in advisory_re().captures_iter(&normalized) {
        let artifact_type = captures.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
        let body = captures.get(2).map(|m| m.as_str()).unwrap_or("");
        let excerpt = raw_excerpt(body);

        let reject = |reason: String, out: &mut AdvisoryParse| {
            out.rejected.push(AdvisoryRejection {
                artifact_type: artifact_type.clone(),
                reason,
                raw_excerpt: excerpt.clone(),
            });
        };

        if !ADVISORY_TYPES.contains(&artifact_type.as_str()) {
            reject(format!("Unknown advisory type: '{artifact_type}'."), &mut out);
            continue;
        }

        let json: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                reject(format!("Advisory body is not valid JSON: {e}."), &mut out);
                continue;
            }
        };

        if json.get("schemaVersion").and_then(|v| v.as_i64()) != Some(1) {
            reject("Advisory requires schemaVersion 1.".to_string(), &mut out);
            continue;
        }

        let persist = match json.get("persist") {
            None => AdvisoryPersist::No,
            Some(value) => match value.as_str().and_then(AdvisoryPersist::parse) {
                Some(p) => p,
                None => {
                    reject(
                        format!("Invalid persist value: {value}. Expected no, yes, or archive."),
                        &mut out,
                    );
                    continue;
                }
            },
        };

        let title = json.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let title_len = title.chars().count();
        if !(4..=120).contains(&title_len) {
            reject(format!("Advisory title must be 4-120 chars, got {title_len}."), &mut out);
            continue;
        }

        let payload = json.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        let list_key = payload_list_key(&artifact_type);
        let has_list = payload
            .get(list_key)
            .and_then(|v| v.as_array())
            .is_some_and(|items| !items.is_empty());
        if !has_list {
            reject(
                format!("Advisory payload requires a non-empty '{list_key}' array."),
                &mut out,
            );
            continue;
        }

        let fingerprint = json
            .get("fingerprint")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty());

        out.blocks.push(AdvisoryBlock {
            artifact_type,
            schema_version: 1,
            persist,
            title,
            fingerprint,
            payload,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Combined scan
// ---------------------------------------------------------------------------

/// All structured blocks found in one LLM response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LlmResponseBlocks {
    pub kb_updates: KbUpdateParse,
    pub decisions: Vec<DecisionBlock>,
    pub advisories: AdvisoryParse,
}

pub fn parse_llm_response(text: &str) -> LlmResponseBlocks {
    LlmResponseBlocks {
        kb_updates: parse_kb_updates(text),
        decisions: parse_decision_blocks(text),
        advisories: parse_advisory_blocks(text),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_traversal_cases() {
        assert!(is_path_traversal("../evil.md"));
        assert!(is_path_traversal("../../etc/passwd"));
        assert!(is_path_traversal("notes/../../etc/passwd"));
        assert!(is_path_traversal("/etc/passwd"));
        assert!(is_path_traversal("C:\\windows\\system32"));
        assert!(is_path_traversal("\\\\server\\share"));
        assert!(is_path_traversal("a\0b.md"));
        assert!(is_path_traversal(".."));
        assert!(!is_path_traversal("notes/weekly.md"));
        assert!(!is_path_traversal("a/b/../c.md"));
        assert!(!is_path_traversal("./kb_digest.md"));
    }

    #[test]
    fn test_kb_update_happy_path() {
        let text = "prose\n```kb-update\nfile: notes/weekly.md\naction: update\nreasoning: refresh\n---\nnew body\n```\nmore prose";
        let parsed = parse_kb_updates(text);
        assert_eq!(parsed.rejected_proposals.len(), 0);
        assert_eq!(parsed.proposals.len(), 1);
        let p = &parsed.proposals[0];
        assert_eq!(p.file, "notes/weekly.md");
        assert_eq!(p.action, UpdateAction::Update);
        assert_eq!(p.tier, Tier::General);
        assert_eq!(p.mode, WriteMode::Full);
        assert_eq!(p.content, "new body");
    }

    #[test]
    fn test_kb_update_traversal_rejected() {
        let text = "```kb-update\nfile: ../evil.md\naction: update\nreasoning: nope\n---\nhi\n```";
        let parsed = parse_kb_updates(text);
        assert!(parsed.proposals.is_empty());
        assert_eq!(parsed.rejected_proposals.len(), 1);
        let r = &parsed.rejected_proposals[0];
        assert_eq!(r.rejection_reason, "File path rejected: path traversal.");
        assert!(!r.raw_excerpt.is_empty());
    }

    #[test]
    fn test_structural_requires_patch() {
        let text = "```kb-update\nfile: claude.md\naction: update\ntier: structural\nmode: full\nreasoning: x\n---\nbody\n```";
        let parsed = parse_kb_updates(text);
        assert!(parsed.proposals.is_empty());
        let r = &parsed.rejected_proposals[0];
        assert_eq!(r.rejection_code, "STRUCTURAL_REQUIRES_PATCH");
        assert_eq!(r.suggested_fix.as_deref(), Some("Change mode to patch."));
    }

    #[test]
    fn test_status_rejects_patch() {
        let text = "```kb-update\nfile: kb_digest.md\naction: update\nmode: patch\nreasoning: x\n---\nbody\n```";
        let parsed = parse_kb_updates(text);
        assert_eq!(parsed.rejected_proposals[0].rejection_code, "STATUS_NO_PATCH");
    }

    #[test]
    fn test_delete_needs_exact_confirm() {
        let no_confirm =
            "```kb-update\nfile: old.md\naction: delete\nreasoning: obsolete\n---\n\n```";
        let parsed = parse_kb_updates(no_confirm);
        let r = &parsed.rejected_proposals[0];
        assert_eq!(r.rejection_code, "DELETE_NEEDS_CONFIRM");
        assert_eq!(r.suggested_fix.as_deref(), Some("Add: confirm: DELETE old.md"));

        let confirmed = "```kb-update\nfile: old.md\naction: delete\nconfirm: DELETE old.md\nreasoning: obsolete\n---\n\n```";
        let parsed = parse_kb_updates(confirmed);
        assert_eq!(parsed.proposals.len(), 1);
    }

    #[test]
    fn test_no_separator_handling() {
        // Header has a file: line but no separator → rejected attempt
        let with_file = "```kb-update\nfile: a.md\naction: update\nreasoning: x\nbody\n```";
        let parsed = parse_kb_updates(with_file);
        assert_eq!(parsed.rejected_proposals.len(), 1);
        assert_eq!(parsed.rejected_proposals[0].rejection_code, "MISSING_FIELDS");

        // No file at all → not even an attempt
        let without_file = "```kb-update\njust some text\n```";
        let parsed = parse_kb_updates(without_file);
        assert!(parsed.proposals.is_empty());
        assert!(parsed.rejected_proposals.is_empty());
    }

    #[test]
    fn test_invalid_action() {
        let text = "```kb-update\nfile: a.md\naction: destroy\nreasoning: x\n---\nbody\n```";
        let parsed = parse_kb_updates(text);
        let r = &parsed.rejected_proposals[0];
        assert_eq!(r.rejection_code, "INVALID_ACTION");
        assert!(r.rejection_reason.contains("destroy"));
    }

    #[test]
    fn test_rejection_id_is_deterministic() {
        let text = "```kb-update\nfile: ../x.md\naction: update\nreasoning: r\n---\nhi\n```";
        let a = parse_kb_updates(text);
        let b = parse_kb_updates(text);
        assert_eq!(a.rejected_proposals[0].id, b.rejected_proposals[0].id);
        assert_eq!(a.rejected_proposals[0].id.len(), 16);
    }

    #[test]
    fn test_decision_blocks() {
        let text = "```decision\ndecision_id: adopt-rust\ndecision: Adopt Rust for the core\nconfidence: high\nhorizon: bogus\nlinked_files: a.md, b.md, ,c.md\n```";
        let decisions = parse_decision_blocks(text);
        assert_eq!(decisions.len(), 1);
        let d = &decisions[0];
        assert_eq!(d.decision_id, "adopt-rust");
        assert_eq!(d.confidence.as_deref(), Some("high"));
        assert_eq!(d.horizon, None, "invalid enum collapses to None");
        assert_eq!(d.linked_files, vec!["a.md", "b.md", "c.md"]);
    }

    #[test]
    fn test_decision_missing_required_skipped() {
        let text = "```decision\ndecision: no id present\n```";
        assert!(parse_decision_blocks(text).is_empty());
    }

    #[test]
    fn test_advisory_block_valid_and_invalid() {
        let valid = r#"```advisory-brainstorm
{"schemaVersion": 1, "persist": "yes", "title": "Growth options", "payload": {"options": [{"title": "A"}]}}
```"#;
        let parsed = parse_advisory_blocks(valid);
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].persist, AdvisoryPersist::Yes);

        let bad_version = r#"```advisory-brainstorm
{"schemaVersion": 2, "title": "Growth options", "payload": {"options": [1]}}
```"#;
        let parsed = parse_advisory_blocks(bad_version);
        assert!(parsed.blocks.is_empty());
        assert!(parsed.rejected[0].reason.contains("schemaVersion"));

        let bad_json = "```advisory-scenario\nnot json\n```";
        let parsed = parse_advisory_blocks(bad_json);
        assert!(parsed.rejected[0].reason.contains("not valid JSON"));
    }

    #[test]
    fn test_parser_totality_on_garbage() {
        for garbage in [
            "",
            "```kb-update",
            "```kb-update\n```",
            "```kb-update\nfile:\n---\n```",
            "random ``` fences ``` everywhere",
            "```decision\n```",
            "```advisory-\n{}\n```",
        ] {
            let parsed = parse_llm_response(garbage);
            // Must never panic and always produce a well-formed result
            let _ = serde_json::to_string(&parsed).unwrap();
        }
    }

    #[test]
    fn test_crlf_input_normalized() {
        let text = "```kb-update\r\nfile: a.md\r\naction: update\r\nreasoning: x\r\n---\r\nbody\r\n```";
        let parsed = parse_kb_updates(text);
        assert_eq!(parsed.proposals.len(), 1);
        assert_eq!(parsed.proposals[0].content, "body");
    }
}
