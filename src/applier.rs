//! Applies accepted kb-update proposals to the filesystem.
//!
//! The applier owns the target files: concurrent applies to the same
//! `(domain, relative_path)` are serialized behind a keyed lock. Tier write
//! rules are re-checked here so a proposal can never bypass them by skipping
//! the parser.

use crate::error::{CoreError, Result};
use crate::fences::{is_path_traversal, KbUpdateProposal, UpdateAction, WriteMode};
use crate::types::{Domain, Tier};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub relative_path: String,
    pub action: UpdateAction,
    pub bytes_written: usize,
}

/// Serializes writes per `(domain_id, relative_path)`.
#[derive(Default)]
pub struct KbApplier {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KbApplier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: String) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key).or_default())
    }

    /// Apply one proposal inside the domain's KB directory.
    pub fn apply(&self, domain: &Domain, proposal: &KbUpdateProposal) -> Result<ApplyOutcome> {
        if is_path_traversal(&proposal.file) {
            return Err(CoreError::validation(format!(
                "refusing to apply traversal path: {}",
                proposal.file
            )));
        }
        if proposal.tier == Tier::Structural && proposal.mode != WriteMode::Patch {
            return Err(CoreError::validation(
                "structural tier files accept patch mode only",
            ));
        }
        if proposal.tier == Tier::Status && proposal.mode == WriteMode::Patch {
            return Err(CoreError::validation(
                "status tier files cannot be patched",
            ));
        }

        let key = format!("{}\u{0}{}", domain.id, proposal.file);
        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let target: PathBuf = PathBuf::from(&domain.kb_path).join(&proposal.file);
        let outcome = match proposal.action {
            UpdateAction::Delete => {
                fs::remove_file(&target)?;
                ApplyOutcome {
                    relative_path: proposal.file.clone(),
                    action: proposal.action,
                    bytes_written: 0,
                }
            }
            UpdateAction::Create => {
                if target.exists() {
                    return Err(CoreError::validation(format!(
                        "{} already exists; use action update",
                        proposal.file
                    )));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let written = write_with_mode(&target, proposal)?;
                ApplyOutcome {
                    relative_path: proposal.file.clone(),
                    action: proposal.action,
                    bytes_written: written,
                }
            }
            UpdateAction::Update => {
                if !target.exists() {
                    return Err(CoreError::not_found("kb file", &proposal.file));
                }
                let written = write_with_mode(&target, proposal)?;
                ApplyOutcome {
                    relative_path: proposal.file.clone(),
                    action: proposal.action,
                    bytes_written: written,
                }
            }
        };

        info!(
            domain = %domain.name,
            path = %proposal.file,
            action = proposal.action.as_str(),
            mode = proposal.mode.as_str(),
            "Applied KB update"
        );
        Ok(outcome)
    }
}

fn write_with_mode(target: &PathBuf, proposal: &KbUpdateProposal) -> Result<usize> {
    match proposal.mode {
        WriteMode::Full => {
            fs::write(target, &proposal.content)?;
            Ok(proposal.content.len())
        }
        WriteMode::Append => {
            let mut existing = fs::read_to_string(target).unwrap_or_default();
            if !existing.is_empty() && !existing.ends_with('\n') {
                existing.push('\n');
            }
            existing.push_str(&proposal.content);
            existing.push('\n');
            let len = existing.len();
            fs::write(target, existing)?;
            Ok(len)
        }
        WriteMode::Patch => {
            let existing = fs::read_to_string(target)?;
            let patched = apply_search_replace(&existing, &proposal.content)?;
            let len = patched.len();
            fs::write(target, patched)?;
            Ok(len)
        }
    }
}

/// Patch payload format: one or more search/replace hunks.
///
/// ```text
/// <<<<<<< SEARCH
/// exact existing text
/// =======
/// replacement text
/// >>>>>>> REPLACE
/// ```
///
/// Every hunk must match exactly once; a miss fails the whole patch.
fn apply_search_replace(existing: &str, patch: &str) -> Result<String> {
    const OPEN: &str = "<<<<<<< SEARCH\n";
    const MID: &str = "\n=======\n";
    const CLOSE: &str = "\n>>>>>>> REPLACE";

    let mut result = existing.to_string();
    let mut rest = patch;
    let mut hunks = 0usize;

    while let Some(open_at) = rest.find(OPEN) {
        let after_open = &rest[open_at + OPEN.len()..];
        let Some(mid_at) = after_open.find(MID) else {
            return Err(CoreError::parse("patch hunk missing ======= divider"));
        };
        let search = &after_open[..mid_at];
        let after_mid = &after_open[mid_at + MID.len()..];
        let Some(close_at) = after_mid.find(CLOSE) else {
            return Err(CoreError::parse("patch hunk missing REPLACE terminator"));
        };
        let replace = &after_mid[..close_at];

        match result.match_indices(search).count() {
            0 => {
                return Err(CoreError::validation(format!(
                    "patch target not found: {:?}",
                    search.chars().take(60).collect::<String>()
                )))
            }
            1 => {
                result = result.replacen(search, replace, 1);
            }
            n => {
                return Err(CoreError::validation(format!(
                    "patch target is ambiguous ({n} matches)"
                )))
            }
        }
        hunks += 1;
        rest = &after_mid[close_at + CLOSE.len()..];
    }

    if hunks == 0 {
        return Err(CoreError::parse("patch payload contains no hunks"));
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fences::UpdateBasis;

    fn domain(kb_path: &str) -> Domain {
        Domain {
            id: "d1".into(),
            name: "demo".into(),
            description: String::new(),
            kb_path: kb_path.into(),
            identity: None,
            escalation_triggers: None,
            allow_gmail: false,
            model_provider: None,
            model_name: None,
            force_tool_attempt: false,
            sort_order: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn proposal(file: &str, action: UpdateAction, tier: Tier, mode: WriteMode, content: &str) -> KbUpdateProposal {
        KbUpdateProposal {
            file: file.into(),
            action,
            tier,
            mode,
            basis: UpdateBasis::Primary,
            reasoning: "test".into(),
            content: content.into(),
            confirm: None,
        }
    }

    #[test]
    fn test_create_append_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let kb = dir.path().to_string_lossy().to_string();
        let applier = KbApplier::new();
        let d = domain(&kb);

        applier
            .apply(&d, &proposal("notes/a.md", UpdateAction::Create, Tier::General, WriteMode::Full, "hello"))
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("notes/a.md")).unwrap(), "hello");

        applier
            .apply(&d, &proposal("notes/a.md", UpdateAction::Update, Tier::General, WriteMode::Append, "more"))
            .unwrap();
        let content = fs::read_to_string(dir.path().join("notes/a.md")).unwrap();
        assert_eq!(content, "hello\nmore\n");

        let mut delete = proposal("notes/a.md", UpdateAction::Delete, Tier::General, WriteMode::Full, "");
        delete.confirm = Some("DELETE notes/a.md".into());
        applier.apply(&d, &delete).unwrap();
        assert!(!dir.path().join("notes/a.md").exists());
    }

    #[test]
    fn test_structural_full_refused() {
        let dir = tempfile::tempdir().unwrap();
        let applier = KbApplier::new();
        let d = domain(&dir.path().to_string_lossy());
        let err = applier
            .apply(&d, &proposal("claude.md", UpdateAction::Update, Tier::Structural, WriteMode::Full, "x"))
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Validation);
    }

    #[test]
    fn test_patch_applies_hunk() {
        let dir = tempfile::tempdir().unwrap();
        let applier = KbApplier::new();
        let d = domain(&dir.path().to_string_lossy());
        fs::write(dir.path().join("claude.md"), "alpha\nbeta\ngamma\n").unwrap();

        let patch = "<<<<<<< SEARCH\nbeta\n=======\nBETA\n>>>>>>> REPLACE";
        applier
            .apply(&d, &proposal("claude.md", UpdateAction::Update, Tier::Structural, WriteMode::Patch, patch))
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("claude.md")).unwrap(),
            "alpha\nBETA\ngamma\n"
        );
    }

    #[test]
    fn test_patch_miss_fails() {
        let dir = tempfile::tempdir().unwrap();
        let applier = KbApplier::new();
        let d = domain(&dir.path().to_string_lossy());
        fs::write(dir.path().join("claude.md"), "alpha\n").unwrap();

        let patch = "<<<<<<< SEARCH\nmissing\n=======\nX\n>>>>>>> REPLACE";
        let err = applier
            .apply(&d, &proposal("claude.md", UpdateAction::Update, Tier::Structural, WriteMode::Patch, patch))
            .unwrap_err();
        assert!(err.message.contains("not found"));
    }
}
