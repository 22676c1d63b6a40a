//! Brainstorm session engine: step state machine, pause/resume, and
//! auto-round management.
//!
//! One non-completed session per domain, enforced by a partial unique index
//! at the storage layer. Rounds snapshot their technique's name and category
//! at creation so later catalog edits cannot rewrite history.

use crate::error::{BrainstormErrorCode, CoreError, Result};
use crate::store::{new_id, now_iso, Store};
use rusqlite::{params, Transaction};
use serde::Serialize;

/// Soft cap on ideas per session.
pub const IDEA_CAP: usize = 500;
/// Ideas required before synthesis may start.
pub const MIN_IDEAS_FOR_SYNTHESIS: usize = 3;
/// Max ideas accepted in one `add_ideas` call.
pub const MAX_IDEAS_PER_CALL: usize = 50;

// ---------------------------------------------------------------------------
// Technique catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Technique {
    pub id: &'static str,
    pub name: &'static str,
    pub category: &'static str,
}

/// Built-in technique catalog. Ids are stable; rounds snapshot name and
/// category at creation.
pub const TECHNIQUES: &[Technique] = &[
    Technique { id: "creative-scamper", name: "SCAMPER", category: "creative" },
    Technique {
        id: "creative-reverse-brainstorm",
        name: "Reverse Brainstorm",
        category: "creative",
    },
    Technique { id: "creative-mind-mapping", name: "Mind Mapping", category: "creative" },
    Technique { id: "creative-random-word", name: "Random Word", category: "creative" },
    Technique { id: "analytical-swot", name: "SWOT Analysis", category: "analytical" },
    Technique { id: "analytical-five-whys", name: "Five Whys", category: "analytical" },
    Technique {
        id: "analytical-six-thinking-hats",
        name: "Six Thinking Hats",
        category: "analytical",
    },
    Technique { id: "analytical-premortem", name: "Premortem", category: "analytical" },
    Technique {
        id: "disruptive-first-principles",
        name: "First Principles",
        category: "disruptive",
    },
    Technique { id: "disruptive-what-if", name: "What If", category: "disruptive" },
    Technique {
        id: "disruptive-constraint-removal",
        name: "Constraint Removal",
        category: "disruptive",
    },
    Technique { id: "collaborative-brainwriting", name: "Brainwriting", category: "collaborative" },
    Technique {
        id: "collaborative-role-storming",
        name: "Role Storming",
        category: "collaborative",
    },
];

pub fn technique_by_id(id: &str) -> Option<&'static Technique> {
    TECHNIQUES.iter().find(|t| t.id == id)
}

// ---------------------------------------------------------------------------
// Steps and phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainstormStep {
    Setup,
    TechniqueSelection,
    Execution,
    Synthesis,
    Completed,
}

impl BrainstormStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrainstormStep::Setup => "setup",
            BrainstormStep::TechniqueSelection => "technique_selection",
            BrainstormStep::Execution => "execution",
            BrainstormStep::Synthesis => "synthesis",
            BrainstormStep::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "setup" => Some(BrainstormStep::Setup),
            "technique_selection" => Some(BrainstormStep::TechniqueSelection),
            "execution" => Some(BrainstormStep::Execution),
            "synthesis" => Some(BrainstormStep::Synthesis),
            "completed" => Some(BrainstormStep::Completed),
            _ => None,
        }
    }

    /// Phase is derived, never stored.
    pub fn phase(&self) -> BrainstormPhase {
        match self {
            BrainstormStep::Synthesis | BrainstormStep::Completed => BrainstormPhase::Convergent,
            _ => BrainstormPhase::Divergent,
        }
    }

    fn pausable(&self) -> bool {
        matches!(
            self,
            BrainstormStep::TechniqueSelection
                | BrainstormStep::Execution
                | BrainstormStep::Synthesis
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainstormPhase {
    Divergent,
    Convergent,
}

fn transition_allowed(from: BrainstormStep, to: BrainstormStep, idea_count: usize) -> Result<()> {
    use BrainstormStep::*;
    let legal = match (from, to) {
        (Setup, TechniqueSelection) => true,
        (TechniqueSelection, Execution) => true,
        (TechniqueSelection, Setup) => {
            if idea_count != 0 {
                return Err(CoreError::brainstorm(
                    BrainstormErrorCode::IllegalTransition,
                    "cannot return to setup once ideas exist",
                ));
            }
            true
        }
        (Execution, TechniqueSelection) => true,
        (Execution, Synthesis) => {
            if idea_count < MIN_IDEAS_FOR_SYNTHESIS {
                return Err(CoreError::brainstorm(
                    BrainstormErrorCode::InsufficientIdeas,
                    format!(
                        "synthesis requires at least {MIN_IDEAS_FOR_SYNTHESIS} ideas, have {idea_count}"
                    ),
                ));
            }
            true
        }
        (Synthesis, Completed) => true,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(CoreError::brainstorm(
            BrainstormErrorCode::IllegalTransition,
            format!("illegal transition {} -> {}", from.as_str(), to.as_str()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Session model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BrainstormRound {
    pub id: String,
    pub round_number: i64,
    pub technique_id: String,
    pub technique_name: String,
    pub technique_category: String,
    pub idea_count: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// An idea as captured during a round, carrying the round's technique
/// snapshot. This is the synthesizer's input record.
#[derive(Debug, Clone, Serialize)]
pub struct RawIdea {
    pub id: String,
    pub round_number: i64,
    pub technique_id: String,
    /// Technique category snapshot at capture time.
    pub category: String,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrainstormSession {
    pub id: String,
    pub domain_id: String,
    pub step: BrainstormStep,
    pub phase: BrainstormPhase,
    pub is_paused: bool,
    pub topic: String,
    pub goals: Option<String>,
    pub selected_techniques: Vec<String>,
    pub idea_count: i64,
    pub synthesis_preview: Option<serde_json::Value>,
    pub rounds: Vec<BrainstormRound>,
    pub raw_ideas: Vec<RawIdea>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddIdeasOutcome {
    pub session: BrainstormSession,
    pub round_number: i64,
    pub capped: bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn load_session_row(store: &Store, where_clause: &str, param: &str) -> Result<Option<BrainstormSession>> {
    let row = store
        .conn()
        .query_row(
            &format!(
                "SELECT id, domain_id, step, is_paused, topic, goals, selected_techniques,
                        idea_count, synthesis_preview, created_at, updated_at
                 FROM brainstorm_sessions WHERE {where_clause}"
            ),
            params![param],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            },
        )
        .ok();

    let Some((
        id,
        domain_id,
        step_raw,
        is_paused,
        topic,
        goals,
        techniques_raw,
        idea_count,
        preview_raw,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let step = BrainstormStep::parse(&step_raw)
        .ok_or_else(|| CoreError::parse(format!("bad brainstorm step: {step_raw}")))?;

    let mut rounds = Vec::new();
    {
        let mut stmt = store.conn().prepare(
            "SELECT id, round_number, technique_id, technique_name, technique_category,
                    idea_count, started_at, completed_at
             FROM brainstorm_rounds WHERE session_id = ?1 ORDER BY round_number ASC",
        )?;
        let mapped = stmt.query_map(params![id], |row| {
            Ok(BrainstormRound {
                id: row.get(0)?,
                round_number: row.get(1)?,
                technique_id: row.get(2)?,
                technique_name: row.get(3)?,
                technique_category: row.get(4)?,
                idea_count: row.get(5)?,
                started_at: row.get(6)?,
                completed_at: row.get(7)?,
            })
        })?;
        for round in mapped {
            rounds.push(round?);
        }
    }

    let mut raw_ideas = Vec::new();
    {
        let mut stmt = store.conn().prepare(
            "SELECT id, round_number, technique_id, technique_category, text, created_at
             FROM brainstorm_ideas WHERE session_id = ?1 ORDER BY rowid ASC",
        )?;
        let mapped = stmt.query_map(params![id], |row| {
            Ok(RawIdea {
                id: row.get(0)?,
                round_number: row.get(1)?,
                technique_id: row.get(2)?,
                category: row.get(3)?,
                text: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        for idea in mapped {
            raw_ideas.push(idea?);
        }
    }

    Ok(Some(BrainstormSession {
        phase: step.phase(),
        id,
        domain_id,
        step,
        is_paused: is_paused != 0,
        topic,
        goals,
        selected_techniques: serde_json::from_str(&techniques_raw).unwrap_or_default(),
        idea_count,
        synthesis_preview: preview_raw.and_then(|p| serde_json::from_str(&p).ok()),
        rounds,
        raw_ideas,
        created_at,
        updated_at,
    }))
}

pub fn get_session(store: &Store, session_id: &str) -> Result<BrainstormSession> {
    load_session_row(store, "id = ?1", session_id)?.ok_or_else(|| {
        CoreError::brainstorm(
            BrainstormErrorCode::NoSession,
            format!("brainstorm session not found: {session_id}"),
        )
    })
}

/// The domain's non-completed session, if any. Paused sessions hold the slot
/// and are returned too.
pub fn get_active(store: &Store, domain_id: &str) -> Result<Option<BrainstormSession>> {
    load_session_row(store, "domain_id = ?1 AND step != 'completed'", domain_id)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub fn create_session(
    store: &Store,
    domain_id: &str,
    topic: &str,
    goals: Option<&str>,
) -> Result<BrainstormSession> {
    if topic.trim().is_empty() {
        return Err(CoreError::validation("brainstorm topic must not be empty"));
    }
    let id = new_id();
    let now = now_iso();
    let inserted = store.conn().execute(
        "INSERT INTO brainstorm_sessions (id, domain_id, step, topic, goals, created_at, updated_at)
         VALUES (?1, ?2, 'setup', ?3, ?4, ?5, ?5)",
        params![id, domain_id, topic.trim(), goals, now],
    );
    if let Err(e) = inserted {
        let core: CoreError = e.into();
        if core.is_constraint() {
            return Err(CoreError::brainstorm(
                BrainstormErrorCode::DbConstraint,
                format!("domain {domain_id} already has an active brainstorm session"),
            ));
        }
        return Err(core);
    }
    get_session(store, &id)
}

fn touch(tx: &Transaction<'_>, session_id: &str) -> Result<()> {
    tx.execute(
        "UPDATE brainstorm_sessions SET updated_at = ?1 WHERE id = ?2",
        params![now_iso(), session_id],
    )?;
    Ok(())
}

pub fn update_selected_techniques(
    store: &Store,
    session_id: &str,
    technique_ids: &[String],
) -> Result<BrainstormSession> {
    for id in technique_ids {
        if technique_by_id(id).is_none() {
            return Err(CoreError::brainstorm(
                BrainstormErrorCode::UnknownTechniqueId,
                format!("unknown technique: {id}"),
            ));
        }
    }
    let session = get_session(store, session_id)?;
    if session.step == BrainstormStep::Completed {
        return Err(CoreError::brainstorm(
            BrainstormErrorCode::IllegalTransition,
            "session is completed",
        ));
    }
    store.conn().execute(
        "UPDATE brainstorm_sessions SET selected_techniques = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(technique_ids)?, now_iso(), session_id],
    )?;
    get_session(store, session_id)
}

/// Move the session to `to`, enforcing the step DAG. Entering synthesis
/// stores a fresh deterministic synthesis preview.
pub fn set_step(store: &Store, session_id: &str, to: BrainstormStep) -> Result<BrainstormSession> {
    let session = get_session(store, session_id)?;
    transition_allowed(session.step, to, session.idea_count as usize)?;

    let preview = if to == BrainstormStep::Synthesis {
        let technique_names: Vec<String> = session
            .rounds
            .iter()
            .map(|r| r.technique_name.clone())
            .collect();
        let payload = crate::synthesis::synthesize(
            &session.raw_ideas,
            &crate::synthesis::SynthesisOptions {
                topic: session.topic.clone(),
                techniques_used: technique_names,
                round_count: session.rounds.len(),
            },
        );
        Some(serde_json::to_string(&payload)?)
    } else {
        None
    };

    store.with_tx(|tx| {
        if let Some(preview) = &preview {
            tx.execute(
                "UPDATE brainstorm_sessions SET step = ?1, synthesis_preview = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![to.as_str(), preview, now_iso(), session_id],
            )?;
        } else {
            tx.execute(
                "UPDATE brainstorm_sessions SET step = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), now_iso(), session_id],
            )?;
        }
        // Leaving execution closes any open round.
        if to != BrainstormStep::Execution {
            close_open_round(tx, session_id)?;
        }
        Ok(())
    })?;
    get_session(store, session_id)
}

fn close_open_round(tx: &Transaction<'_>, session_id: &str) -> Result<()> {
    tx.execute(
        "UPDATE brainstorm_rounds SET completed_at = ?1
         WHERE session_id = ?2 AND completed_at IS NULL",
        params![now_iso(), session_id],
    )?;
    Ok(())
}

/// Pause the session. Idempotent; closes any open round. Only legal in
/// technique selection, execution, or synthesis.
pub fn pause(store: &Store, session_id: &str) -> Result<BrainstormSession> {
    let session = get_session(store, session_id)?;
    if session.is_paused {
        return Ok(session);
    }
    if !session.step.pausable() {
        return Err(CoreError::brainstorm(
            BrainstormErrorCode::IllegalTransition,
            format!("cannot pause in step {}", session.step.as_str()),
        ));
    }
    store.with_tx(|tx| {
        tx.execute(
            "UPDATE brainstorm_sessions SET is_paused = 1 WHERE id = ?1",
            params![session_id],
        )?;
        close_open_round(tx, session_id)?;
        touch(tx, session_id)
    })?;
    get_session(store, session_id)
}

/// Resume the session. Idempotent; does not reopen a round — the next
/// `add_ideas` opens one.
pub fn resume(store: &Store, session_id: &str) -> Result<BrainstormSession> {
    let session = get_session(store, session_id)?;
    if !session.is_paused {
        return Ok(session);
    }
    store.with_tx(|tx| {
        tx.execute(
            "UPDATE brainstorm_sessions SET is_paused = 0 WHERE id = ?1",
            params![session_id],
        )?;
        touch(tx, session_id)
    })?;
    get_session(store, session_id)
}

// ---------------------------------------------------------------------------
// Ideas
// ---------------------------------------------------------------------------

/// Append ideas to the session, resolving the target round. A given
/// `technique_id` that differs from the open round's closes it and opens a
/// new one; otherwise the open round is reused.
pub fn add_ideas(
    store: &Store,
    session_id: &str,
    ideas: &[String],
    technique_id: Option<&str>,
) -> Result<AddIdeasOutcome> {
    if ideas.is_empty() || ideas.len() > MAX_IDEAS_PER_CALL {
        return Err(CoreError::validation(format!(
            "add_ideas accepts 1..={MAX_IDEAS_PER_CALL} ideas, got {}",
            ideas.len()
        )));
    }
    let session = get_session(store, session_id)?;
    if session.step == BrainstormStep::Completed {
        return Err(CoreError::brainstorm(
            BrainstormErrorCode::IllegalTransition,
            "session is completed",
        ));
    }
    if session.idea_count as usize >= IDEA_CAP {
        return Err(CoreError::brainstorm(
            BrainstormErrorCode::CapReached,
            format!("idea cap of {IDEA_CAP} reached"),
        ));
    }

    let open_round = session.rounds.iter().rev().find(|r| r.completed_at.is_none());
    let last_round = session.rounds.last();

    // Resolve the target round, creating one when needed.
    enum Target {
        Existing(i64, String, String),
        New { technique: &'static Technique, round_number: i64 },
    }

    let target = match open_round {
        Some(round)
            if technique_id.is_none() || technique_id == Some(round.technique_id.as_str()) =>
        {
            Target::Existing(
                round.round_number,
                round.technique_id.clone(),
                round.technique_category.clone(),
            )
        }
        _ => {
            let resolved_id = technique_id
                .map(|t| t.to_string())
                .or_else(|| last_round.map(|r| r.technique_id.clone()))
                .or_else(|| session.selected_techniques.first().cloned())
                .ok_or_else(|| {
                    CoreError::brainstorm(
                        BrainstormErrorCode::UnknownTechniqueId,
                        "no technique given and none selected",
                    )
                })?;
            let technique = technique_by_id(&resolved_id).ok_or_else(|| {
                CoreError::brainstorm(
                    BrainstormErrorCode::UnknownTechniqueId,
                    format!("unknown technique: {resolved_id}"),
                )
            })?;
            let round_number =
                session.rounds.iter().map(|r| r.round_number).max().unwrap_or(0) + 1;
            Target::New { technique, round_number }
        }
    };

    let new_count = session.idea_count + ideas.len() as i64;
    let round_number = store.with_tx(|tx| {
        let now = now_iso();
        let (round_number, technique_id, technique_category) = match &target {
            Target::Existing(number, id, category) => (*number, id.clone(), category.clone()),
            Target::New { technique, round_number } => {
                close_open_round(tx, session_id)?;
                tx.execute(
                    "INSERT INTO brainstorm_rounds
                       (id, session_id, round_number, technique_id, technique_name,
                        technique_category, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        new_id(),
                        session_id,
                        round_number,
                        technique.id,
                        technique.name,
                        technique.category,
                        now,
                    ],
                )?;
                (*round_number, technique.id.to_string(), technique.category.to_string())
            }
        };

        for text in ideas {
            tx.execute(
                "INSERT INTO brainstorm_ideas
                   (id, session_id, round_number, technique_id, technique_category, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![new_id(), session_id, round_number, technique_id, technique_category, text, now],
            )?;
        }
        tx.execute(
            "UPDATE brainstorm_rounds SET idea_count = idea_count + ?1
             WHERE session_id = ?2 AND round_number = ?3",
            params![ideas.len() as i64, session_id, round_number],
        )?;
        tx.execute(
            "UPDATE brainstorm_sessions SET idea_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_count, now, session_id],
        )?;
        Ok(round_number)
    })?;

    Ok(AddIdeasOutcome {
        session: get_session(store, session_id)?,
        round_number,
        capped: new_count as usize >= IDEA_CAP,
    })
}
