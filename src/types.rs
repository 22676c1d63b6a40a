//! Core entity types shared across the knowledge engine.
//!
//! All enums are closed sum types with `as_str`/`parse` pairs; unknown values
//! coming off the wire are rejected at the boundary so the interior only ever
//! sees valid variants.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tiers and staleness
// ---------------------------------------------------------------------------

/// Path-derived KB file classification. Drives staleness thresholds, sort
/// priority, and write-mode rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Structural,
    Status,
    Intelligence,
    General,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Structural => "structural",
            Tier::Status => "status",
            Tier::Intelligence => "intelligence",
            Tier::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "structural" => Some(Tier::Structural),
            "status" => Some(Tier::Status),
            "intelligence" => Some(Tier::Intelligence),
            "general" => Some(Tier::General),
            _ => None,
        }
    }

    /// Sort priority; lower sorts earlier.
    pub fn priority(&self) -> u8 {
        match self {
            Tier::Structural => 0,
            Tier::Status => 1,
            Tier::Intelligence => 2,
            Tier::General => 3,
        }
    }
}

/// Whether a file's tier came from path inference or a manual override.
/// Manual overrides survive re-scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSource {
    Inferred,
    Manual,
}

impl TierSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierSource::Inferred => "inferred",
            TierSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inferred" => Some(TierSource::Inferred),
            "manual" => Some(TierSource::Manual),
            _ => None,
        }
    }
}

/// Staleness level for a KB file, derived from days-since-update and tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessLevel {
    Fresh,
    Stale,
    Critical,
}

impl StalenessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StalenessLevel::Fresh => "fresh",
            StalenessLevel::Stale => "stale",
            StalenessLevel::Critical => "critical",
        }
    }
}

/// Which timestamp the staleness computation was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessBasis {
    Mtime,
    Semantic,
}

/// Result of a staleness computation for one file.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Staleness {
    pub level: StalenessLevel,
    pub days_since_update: i64,
    pub basis: StalenessBasis,
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

/// A domain: a directory of markdown files plus the work attached to it.
/// Exclusively owns its KB files, sessions, deadlines, gap flags, artifacts,
/// tags, and relationships where it appears as source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Absolute directory holding the domain's KB markdown files.
    pub kb_path: String,
    pub identity: Option<String>,
    pub escalation_triggers: Option<String>,
    pub allow_gmail: bool,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub force_tool_attempt: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// KB files, chunks, embeddings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct KbFile {
    pub id: String,
    pub domain_id: String,
    pub relative_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub last_synced_at: String,
    pub tier: Tier,
    pub tier_source: TierSource,
}

/// A stored chunk row. `chunk_key` is the content-anchored stable identity.
#[derive(Debug, Clone, Serialize)]
pub struct KbChunk {
    pub id: String,
    pub kb_file_id: String,
    pub domain_id: String,
    pub chunk_index: i64,
    pub chunk_key: String,
    pub heading_path: String,
    pub content: String,
    pub content_hash: String,
    /// Snapshot of the containing file's hash at chunk time.
    pub file_content_hash: String,
    pub char_count: i64,
    pub token_estimate: i64,
    pub start_line: i64,
    pub end_line: i64,
}

/// Indexer run state, upserted per `(domain_id, model_name)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(JobState::Idle),
            "running" => Some(JobState::Running),
            "error" => Some(JobState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingJobStatus {
    pub domain_id: String,
    pub model_name: String,
    pub run_id: String,
    pub provider_fingerprint: String,
    pub status: JobState,
    pub total_files: i64,
    pub processed_files: i64,
    pub total_chunks: i64,
    pub embedded_chunks: i64,
    pub last_error: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Sibling,
    Reference,
    Parent,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Sibling => "sibling",
            RelationshipType::Reference => "reference",
            RelationshipType::Parent => "parent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sibling" => Some(RelationshipType::Sibling),
            "reference" => Some(RelationshipType::Reference),
            "parent" => Some(RelationshipType::Parent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    DependsOn,
    Informs,
    Parallel,
    MonitorOnly,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::DependsOn => "depends_on",
            DependencyType::Informs => "informs",
            DependencyType::Parallel => "parallel",
            DependencyType::MonitorOnly => "monitor_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(DependencyType::Blocks),
            "depends_on" => Some(DependencyType::DependsOn),
            "informs" => Some(DependencyType::Informs),
            "parallel" => Some(DependencyType::Parallel),
            "monitor_only" => Some(DependencyType::MonitorOnly),
            _ => None,
        }
    }

    /// Hard dependencies generate cross-domain alerts and the `blocked` status.
    pub fn is_hard(&self) -> bool {
        matches!(self, DependencyType::Blocks | DependencyType::DependsOn)
    }
}

/// Directed edge between two domains. Reciprocation is explicit, never
/// automatic.
#[derive(Debug, Clone, Serialize)]
pub struct DomainRelationship {
    pub id: String,
    pub domain_id: String,
    pub sibling_domain_id: String,
    pub relationship_type: RelationshipType,
    pub dependency_type: DependencyType,
    pub description: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Deadlines, gap flags, sessions, decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineStatus {
    Active,
    Snoozed,
    Completed,
    Cancelled,
}

impl DeadlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlineStatus::Active => "active",
            DeadlineStatus::Snoozed => "snoozed",
            DeadlineStatus::Completed => "completed",
            DeadlineStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DeadlineStatus::Active),
            "snoozed" => Some(DeadlineStatus::Snoozed),
            "completed" => Some(DeadlineStatus::Completed),
            "cancelled" => Some(DeadlineStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Deadline {
    pub id: String,
    pub domain_id: String,
    pub text: String,
    /// ISO date, e.g. `2026-03-14`.
    pub due_date: String,
    /// 1–7, lower = more urgent. Default 4.
    pub priority: i64,
    pub status: DeadlineStatus,
    /// Free text used for duplicate prevention.
    pub source_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapFlag {
    pub id: String,
    pub domain_id: String,
    pub category: String,
    pub description: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WrappedUp,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::WrappedUp => "wrapped_up",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "wrapped_up" => Some(SessionStatus::WrappedUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub domain_id: String,
    pub scope: String,
    pub status: SessionStatus,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

/// A recorded decision, keyed by the LLM-chosen `decision_key` within a
/// domain so re-emitting the same decision upserts instead of duplicating.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub id: String,
    pub domain_id: String,
    pub decision_key: String,
    pub decision: String,
    pub confidence: Option<String>,
    pub horizon: Option<String>,
    pub reversibility_class: Option<String>,
    pub category: Option<String>,
    pub linked_files: Vec<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Advisory artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorySource {
    Llm,
    User,
    Import,
}

impl AdvisorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvisorySource::Llm => "llm",
            AdvisorySource::User => "user",
            AdvisorySource::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(AdvisorySource::Llm),
            "user" => Some(AdvisorySource::User),
            "import" => Some(AdvisorySource::Import),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryStatus {
    Active,
    Archived,
    Dismissed,
}

impl AdvisoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvisoryStatus::Active => "active",
            AdvisoryStatus::Archived => "archived",
            AdvisoryStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AdvisoryStatus::Active),
            "archived" => Some(AdvisoryStatus::Archived),
            "dismissed" => Some(AdvisoryStatus::Dismissed),
            _ => None,
        }
    }
}

/// Persisted advisory artifact. The fingerprint is the producer-chosen
/// idempotency key: inserting a duplicate `(domain_id, fingerprint)` returns
/// the existing row.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryArtifact {
    pub id: String,
    pub domain_id: String,
    pub artifact_type: String,
    pub title: String,
    /// JSON payload, shape depends on `artifact_type`.
    pub content: serde_json::Value,
    pub fingerprint: Option<String>,
    pub source: AdvisorySource,
    pub status: AdvisoryStatus,
    pub schema_version: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Plugins and installed commands
// ---------------------------------------------------------------------------

/// Installed third-party plugin; `source_hash` detects upstream change.
#[derive(Debug, Clone, Serialize)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub source_url: Option<String>,
    pub source_hash: String,
    pub installed_at: String,
    pub updated_at: String,
}

/// A command installed into a domain, addressed by its canonical slug
/// (`plugin:command`). Display slugs collapse to the short form when unique
/// within the domain.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledCommand {
    pub id: String,
    pub domain_id: String,
    pub slug: String,
    pub source_hash: String,
    pub installed_at: String,
}

/// A command with its collision-resolved display slug.
#[derive(Debug, Clone, Serialize)]
pub struct CommandDisplay {
    pub command: InstalledCommand,
    pub display_slug: String,
}
