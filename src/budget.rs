//! Token-budget math and prompt profiles — pure functions, no I/O.

use crate::providers::ChatMessage;
use serde::Serialize;

/// Fixed chars-per-token estimate used everywhere a real tokenizer is not
/// worth the dependency: `ceil(chars / 4)`.
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

/// Message token estimate: content estimate plus a 4-token per-message
/// envelope.
pub fn estimate_chat_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(m.content.len()) + 4).sum()
}

pub fn clamp(value: usize, lo: usize, hi: usize) -> usize {
    value.max(lo).min(hi)
}

// ---------------------------------------------------------------------------
// Prompt profiles
// ---------------------------------------------------------------------------

/// How KB context is rendered into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KbStrategy {
    /// Full retrieved chunks.
    FullChunks,
    /// Digest-tier summaries only.
    Digest,
    /// A few status-tier files, hard-capped.
    StatusCapsule,
}

/// Per-section rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionMode {
    On,
    Off,
    Micro,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusCapsuleCaps {
    pub max_files: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptProfile {
    pub name: &'static str,
    pub context_limit: usize,
    pub output_reserve: usize,
    pub safety_factor: f64,
    pub min_system_budget: usize,
    pub max_system_budget: usize,
    pub kb_strategy: KbStrategy,
    pub identity_section: SectionMode,
    pub history_section: SectionMode,
    pub kb_section: SectionMode,
    pub status_capsule: Option<StatusCapsuleCaps>,
}

pub const CLOUD_FULL: PromptProfile = PromptProfile {
    name: "cloud_full",
    context_limit: 200_000,
    output_reserve: 8_192,
    safety_factor: 1.15,
    min_system_budget: 4_000,
    max_system_budget: 24_000,
    kb_strategy: KbStrategy::FullChunks,
    identity_section: SectionMode::On,
    history_section: SectionMode::On,
    kb_section: SectionMode::On,
    status_capsule: None,
};

pub const OLLAMA_BALANCED: PromptProfile = PromptProfile {
    name: "ollama_balanced",
    context_limit: 32_768,
    output_reserve: 2_048,
    safety_factor: 1.20,
    min_system_budget: 2_000,
    max_system_budget: 8_000,
    kb_strategy: KbStrategy::Digest,
    identity_section: SectionMode::On,
    history_section: SectionMode::On,
    kb_section: SectionMode::Micro,
    status_capsule: None,
};

pub const OLLAMA_FAST: PromptProfile = PromptProfile {
    name: "ollama_fast",
    context_limit: 8_192,
    output_reserve: 1_024,
    safety_factor: 1.25,
    min_system_budget: 1_200,
    max_system_budget: 2_800,
    kb_strategy: KbStrategy::StatusCapsule,
    identity_section: SectionMode::Micro,
    history_section: SectionMode::Off,
    kb_section: SectionMode::Micro,
    status_capsule: Some(StatusCapsuleCaps { max_files: 3, max_chars: 1_200 }),
};

pub fn profile_by_name(name: &str) -> Option<&'static PromptProfile> {
    match name {
        "cloud_full" => Some(&CLOUD_FULL),
        "ollama_balanced" => Some(&OLLAMA_BALANCED),
        "ollama_fast" => Some(&OLLAMA_FAST),
        _ => None,
    }
}

/// Pick a profile from the domain's provider/model config. Local models get
/// the fast profile when they look small, balanced otherwise; everything
/// else gets the cloud profile.
pub fn select_profile(provider: Option<&str>, model: Option<&str>) -> &'static PromptProfile {
    match provider {
        Some("ollama") => {
            let small = model
                .map(|m| {
                    let m = m.to_lowercase();
                    ["1b", "3b", "mini", "tiny", "fast"].iter().any(|tag| m.contains(tag))
                })
                .unwrap_or(false);
            if small {
                &OLLAMA_FAST
            } else {
                &OLLAMA_BALANCED
            }
        }
        _ => &CLOUD_FULL,
    }
}

/// Dynamic system budget:
/// `clamp(floor((ctx − history − output_reserve) / safety), min, max)`.
pub fn system_budget(profile: &PromptProfile, history_tokens: usize) -> usize {
    let available = profile
        .context_limit
        .saturating_sub(history_tokens)
        .saturating_sub(profile.output_reserve);
    let scaled = (available as f64 / profile.safety_factor).floor() as usize;
    clamp(scaled, profile.min_system_budget, profile.max_system_budget)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatRole;

    #[test]
    fn test_estimate_tokens_ceiling() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(400), 100);
    }

    #[test]
    fn test_estimate_chat_tokens_adds_envelope() {
        let messages = vec![
            ChatMessage { role: ChatRole::User, content: "12345678".into() },
            ChatMessage { role: ChatRole::Assistant, content: "".into() },
        ];
        // 8 chars -> 2 tokens + 4, empty -> 0 + 4
        assert_eq!(estimate_chat_tokens(&messages), 10);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(5, 1, 10), 5);
        assert_eq!(clamp(0, 1, 10), 1);
        assert_eq!(clamp(50, 1, 10), 10);
    }

    #[test]
    fn test_system_budget_clamps_both_ends() {
        // Huge history exhausts the context: floor to min
        assert_eq!(system_budget(&CLOUD_FULL, 1_000_000), CLOUD_FULL.min_system_budget);
        // Empty history: ceiling to max
        assert_eq!(system_budget(&CLOUD_FULL, 0), CLOUD_FULL.max_system_budget);
        // Middle of the range scales with the safety factor
        let history = 180_000;
        let expected = ((200_000f64 - 180_000.0 - 8_192.0) / 1.15).floor() as usize;
        assert_eq!(system_budget(&CLOUD_FULL, history), expected);
    }

    #[test]
    fn test_profile_selection() {
        assert_eq!(select_profile(None, None).name, "cloud_full");
        assert_eq!(select_profile(Some("anthropic"), Some("claude-sonnet-4-5")).name, "cloud_full");
        assert_eq!(select_profile(Some("ollama"), Some("llama3.1")).name, "ollama_balanced");
        assert_eq!(select_profile(Some("ollama"), Some("llama3.2:3b")).name, "ollama_fast");
    }
}
