//! Brainstorm engine integration: step DAG, auto-round management, caps,
//! pause/resume idempotence, and the unique-active invariant.

mod helpers;

use domainscope::brainstorm::{self, BrainstormPhase, BrainstormStep};
use domainscope::error::{BrainstormErrorCode, ErrorCode};
use helpers::TestWorkspace;

fn expect_code(err: domainscope::CoreError, code: BrainstormErrorCode) {
    assert_eq!(err.code, ErrorCode::Brainstorm(code), "unexpected error: {err}");
}

fn setup_execution(ws: &TestWorkspace, topic: &str) -> String {
    let session = brainstorm::create_session(&ws.store, &ws.domain.id, topic, None).unwrap();
    brainstorm::set_step(&ws.store, &session.id, BrainstormStep::TechniqueSelection).unwrap();
    brainstorm::update_selected_techniques(
        &ws.store,
        &session.id,
        &["creative-scamper".to_string()],
    )
    .unwrap();
    brainstorm::set_step(&ws.store, &session.id, BrainstormStep::Execution).unwrap();
    session.id
}

#[test]
fn test_auto_round_management() {
    let ws = TestWorkspace::new("rounds");
    let session_id = setup_execution(&ws, "growth");

    brainstorm::add_ideas(&ws.store, &session_id, &["a".into()], Some("creative-scamper"))
        .unwrap();
    let outcome = brainstorm::add_ideas(
        &ws.store,
        &session_id,
        &["b".into()],
        Some("creative-reverse-brainstorm"),
    )
    .unwrap();

    let session = outcome.session;
    assert_eq!(session.idea_count, 2);
    assert_eq!(session.rounds.len(), 2);
    assert!(session.rounds[0].completed_at.is_some(), "first round closed");
    assert!(session.rounds[1].completed_at.is_none(), "second round open");
    assert_eq!(session.rounds[1].round_number, 2);
    assert_eq!(session.rounds[1].technique_name, "Reverse Brainstorm");
    assert_eq!(outcome.round_number, 2);

    // Same technique reuses the open round
    let outcome =
        brainstorm::add_ideas(&ws.store, &session_id, &["c".into()], None).unwrap();
    assert_eq!(outcome.round_number, 2);
    assert_eq!(outcome.session.rounds.len(), 2);
}

#[test]
fn test_step_dag_enforced() {
    let ws = TestWorkspace::new("dag");
    let session = brainstorm::create_session(&ws.store, &ws.domain.id, "topic", None).unwrap();
    assert_eq!(session.step, BrainstormStep::Setup);
    assert_eq!(session.phase, BrainstormPhase::Divergent);

    // setup -> execution is illegal
    let err =
        brainstorm::set_step(&ws.store, &session.id, BrainstormStep::Execution).unwrap_err();
    expect_code(err, BrainstormErrorCode::IllegalTransition);

    let session_id = {
        brainstorm::set_step(&ws.store, &session.id, BrainstormStep::TechniqueSelection).unwrap();
        brainstorm::update_selected_techniques(
            &ws.store,
            &session.id,
            &["analytical-swot".to_string()],
        )
        .unwrap();
        // Back to setup is allowed while no ideas exist
        brainstorm::set_step(&ws.store, &session.id, BrainstormStep::Setup).unwrap();
        brainstorm::set_step(&ws.store, &session.id, BrainstormStep::TechniqueSelection).unwrap();
        brainstorm::set_step(&ws.store, &session.id, BrainstormStep::Execution).unwrap();
        session.id.clone()
    };

    // synthesis gate: 2 ideas rejected, 3 accepted
    brainstorm::add_ideas(&ws.store, &session_id, &["one".into(), "two".into()], None).unwrap();
    let err =
        brainstorm::set_step(&ws.store, &session_id, BrainstormStep::Synthesis).unwrap_err();
    expect_code(err, BrainstormErrorCode::InsufficientIdeas);

    // With ideas on the books, technique_selection -> setup is now illegal
    brainstorm::set_step(&ws.store, &session_id, BrainstormStep::TechniqueSelection).unwrap();
    let err = brainstorm::set_step(&ws.store, &session_id, BrainstormStep::Setup).unwrap_err();
    expect_code(err, BrainstormErrorCode::IllegalTransition);
    brainstorm::set_step(&ws.store, &session_id, BrainstormStep::Execution).unwrap();

    brainstorm::add_ideas(&ws.store, &session_id, &["three".into()], None).unwrap();
    let session =
        brainstorm::set_step(&ws.store, &session_id, BrainstormStep::Synthesis).unwrap();
    assert_eq!(session.phase, BrainstormPhase::Convergent);
    assert!(session.synthesis_preview.is_some(), "synthesis entry stores a preview");

    let session =
        brainstorm::set_step(&ws.store, &session_id, BrainstormStep::Completed).unwrap();
    assert_eq!(session.step, BrainstormStep::Completed);

    // Terminal: nothing moves out of completed
    let err =
        brainstorm::set_step(&ws.store, &session_id, BrainstormStep::Setup).unwrap_err();
    expect_code(err, BrainstormErrorCode::IllegalTransition);
    let err = brainstorm::add_ideas(&ws.store, &session_id, &["late".into()], None).unwrap_err();
    expect_code(err, BrainstormErrorCode::IllegalTransition);
}

#[test]
fn test_idea_cap_boundary() {
    let ws = TestWorkspace::new("cap");
    let session_id = setup_execution(&ws, "volume");

    // 499 ideas in bulk
    for _ in 0..9 {
        let batch: Vec<String> = (0..50).map(|i| format!("idea {i}")).collect();
        brainstorm::add_ideas(&ws.store, &session_id, &batch, None).unwrap();
    }
    let batch: Vec<String> = (0..49).map(|i| format!("tail {i}")).collect();
    let outcome = brainstorm::add_ideas(&ws.store, &session_id, &batch, None).unwrap();
    assert_eq!(outcome.session.idea_count, 499);
    assert!(!outcome.capped);

    // 499 -> 500 succeeds and reports the cap
    let outcome =
        brainstorm::add_ideas(&ws.store, &session_id, &["last one".into()], None).unwrap();
    assert_eq!(outcome.session.idea_count, 500);
    assert!(outcome.capped);

    // Beyond the cap
    let err =
        brainstorm::add_ideas(&ws.store, &session_id, &["overflow".into()], None).unwrap_err();
    expect_code(err, BrainstormErrorCode::CapReached);
}

#[test]
fn test_pause_resume_idempotent() {
    let ws = TestWorkspace::new("pausing");
    let session_id = setup_execution(&ws, "pausing");
    brainstorm::add_ideas(&ws.store, &session_id, &["seed".into()], None).unwrap();

    let paused = brainstorm::pause(&ws.store, &session_id).unwrap();
    assert!(paused.is_paused);
    assert!(paused.rounds.last().unwrap().completed_at.is_some(), "pause closes the open round");

    // Pause twice = pause once
    let again = brainstorm::pause(&ws.store, &session_id).unwrap();
    assert!(again.is_paused);
    assert_eq!(paused.rounds.len(), again.rounds.len());

    let resumed = brainstorm::resume(&ws.store, &session_id).unwrap();
    assert!(!resumed.is_paused);
    // Resume does not reopen a round
    assert!(resumed.rounds.iter().all(|r| r.completed_at.is_some()));
    let again = brainstorm::resume(&ws.store, &session_id).unwrap();
    assert!(!again.is_paused);

    // The next add_ideas opens a fresh round
    let outcome = brainstorm::add_ideas(&ws.store, &session_id, &["post".into()], None).unwrap();
    assert_eq!(outcome.round_number, 2);
}

#[test]
fn test_pause_illegal_in_setup() {
    let ws = TestWorkspace::new("pause-setup");
    let session = brainstorm::create_session(&ws.store, &ws.domain.id, "t", None).unwrap();
    let err = brainstorm::pause(&ws.store, &session.id).unwrap_err();
    expect_code(err, BrainstormErrorCode::IllegalTransition);
}

#[test]
fn test_unique_active_invariant() {
    let ws = TestWorkspace::new("unique");
    let first = brainstorm::create_session(&ws.store, &ws.domain.id, "first", None).unwrap();

    let err = brainstorm::create_session(&ws.store, &ws.domain.id, "second", None).unwrap_err();
    expect_code(err, BrainstormErrorCode::DbConstraint);

    // A paused session still holds the slot
    brainstorm::set_step(&ws.store, &first.id, BrainstormStep::TechniqueSelection).unwrap();
    brainstorm::pause(&ws.store, &first.id).unwrap();
    let active = brainstorm::get_active(&ws.store, &ws.domain.id).unwrap().unwrap();
    assert_eq!(active.id, first.id);
    let err = brainstorm::create_session(&ws.store, &ws.domain.id, "third", None).unwrap_err();
    expect_code(err, BrainstormErrorCode::DbConstraint);

    // Completing frees the slot
    brainstorm::resume(&ws.store, &first.id).unwrap();
    brainstorm::update_selected_techniques(
        &ws.store,
        &first.id,
        &["creative-scamper".to_string()],
    )
    .unwrap();
    brainstorm::set_step(&ws.store, &first.id, BrainstormStep::Execution).unwrap();
    brainstorm::add_ideas(
        &ws.store,
        &first.id,
        &["a".into(), "b".into(), "c".into()],
        None,
    )
    .unwrap();
    brainstorm::set_step(&ws.store, &first.id, BrainstormStep::Synthesis).unwrap();
    brainstorm::set_step(&ws.store, &first.id, BrainstormStep::Completed).unwrap();

    assert!(brainstorm::get_active(&ws.store, &ws.domain.id).unwrap().is_none());
    brainstorm::create_session(&ws.store, &ws.domain.id, "fresh", None).unwrap();
}

#[test]
fn test_unknown_technique_rejected() {
    let ws = TestWorkspace::new("unknown-tech");
    let session = brainstorm::create_session(&ws.store, &ws.domain.id, "t", None).unwrap();
    let err = brainstorm::update_selected_techniques(
        &ws.store,
        &session.id,
        &["made-up-technique".to_string()],
    )
    .unwrap_err();
    expect_code(err, BrainstormErrorCode::UnknownTechniqueId);

    // add_ideas with no resolvable technique fails the same way
    brainstorm::set_step(&ws.store, &session.id, BrainstormStep::TechniqueSelection).unwrap();
    brainstorm::set_step(&ws.store, &session.id, BrainstormStep::Execution).unwrap();
    let err = brainstorm::add_ideas(&ws.store, &session.id, &["x".into()], None).unwrap_err();
    expect_code(err, BrainstormErrorCode::UnknownTechniqueId);
}
