//! Portfolio health integration: severity, status derivation, alert
//! escalation, and snapshot-hash permutation invariance.

mod helpers;

use domainscope::health::{self, AlertSeverity, DomainStatus};
use domainscope::repo;
use domainscope::types::{DependencyType, RelationshipType};
use helpers::TestWorkspace;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[test]
fn test_critical_status_file_severity_and_escalation() {
    let ws = TestWorkspace::new("alpha");
    ws.write_kb("kb_digest.md", "## Status\nvery old status content");
    ws.sync();
    ws.age_kb_file("kb_digest.md", 30); // status tier: critical at >= 21d

    let beta = ws.add_domain("beta");
    repo::upsert_relationship(
        &ws.store,
        &ws.domain.id,
        &beta.id,
        RelationshipType::Sibling,
        DependencyType::Blocks,
        Some("alpha feeds beta"),
    )
    .unwrap();

    let portfolio = health::compute_portfolio_health(&ws.store, now_ms()).unwrap();
    let alpha = portfolio.domains.iter().find(|d| d.name == "alpha").unwrap();
    // status tier multiplier 4 x critical multiplier 3
    assert_eq!(alpha.severity, 12);
    assert!(alpha.has_structural_block());
    let worst = alpha.worst_file.as_ref().unwrap();
    assert_eq!(worst.path, "kb_digest.md");
    assert!(worst.days >= 30);

    // Hard incoming edge from a structurally-blocked source marks beta blocked
    let beta_health = portfolio.domains.iter().find(|d| d.name == "beta").unwrap();
    assert_eq!(beta_health.status, DomainStatus::Blocked);

    assert_eq!(portfolio.alerts.len(), 1);
    let alert = &portfolio.alerts[0];
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert!(alert.message.contains("alpha kb_digest.md"));
    assert!(alert.message.contains("d stale (status tier)"));
    assert!(alert.message.contains("Blocks beta: 'alpha feeds beta'"));
}

#[test]
fn test_blocks_escalates_warning_but_depends_on_does_not() {
    let ws = TestWorkspace::new("gamma");
    ws.write_kb("kb_digest.md", "## Status\nmildly old");
    ws.sync();
    ws.age_kb_file("kb_digest.md", 10); // status tier: stale, severity 4

    let delta = ws.add_domain("delta");
    repo::upsert_relationship(
        &ws.store,
        &ws.domain.id,
        &delta.id,
        RelationshipType::Sibling,
        DependencyType::Blocks,
        None,
    )
    .unwrap();

    let portfolio = health::compute_portfolio_health(&ws.store, now_ms()).unwrap();
    let gamma = portfolio.domains.iter().find(|d| d.name == "gamma").unwrap();
    assert_eq!(gamma.severity, 4);
    // severity 4 => base warning, escalated to critical by the blocks edge
    assert_eq!(portfolio.alerts[0].severity, AlertSeverity::Critical);
    // gamma has a hard outgoing dep and severity >= 3
    assert_eq!(gamma.status, DomainStatus::StaleRisk);

    // Swap the edge to depends_on: base severity only
    repo::upsert_relationship(
        &ws.store,
        &ws.domain.id,
        &delta.id,
        RelationshipType::Sibling,
        DependencyType::DependsOn,
        None,
    )
    .unwrap();
    let portfolio = health::compute_portfolio_health(&ws.store, now_ms()).unwrap();
    assert_eq!(portfolio.alerts[0].severity, AlertSeverity::Warning);
    assert!(portfolio.alerts[0].message.contains("Depended on by delta"));
}

#[test]
fn test_soft_edges_and_zero_severity_make_no_alerts() {
    let ws = TestWorkspace::new("epsilon");
    let zeta = ws.add_domain("zeta");
    repo::upsert_relationship(
        &ws.store,
        &ws.domain.id,
        &zeta.id,
        RelationshipType::Reference,
        DependencyType::Informs,
        None,
    )
    .unwrap();

    let portfolio = health::compute_portfolio_health(&ws.store, now_ms()).unwrap();
    assert!(portfolio.alerts.is_empty());
}

#[test]
fn test_quiet_status_for_empty_domain() {
    let ws = TestWorkspace::new("quiet-empty");
    let portfolio = health::compute_portfolio_health(&ws.store, now_ms()).unwrap();
    let domain = &portfolio.domains[0];
    assert_eq!(domain.file_count_total, 0);
    assert_eq!(domain.severity, 0);
    assert_eq!(domain.status, DomainStatus::Quiet);
}

#[test]
fn test_gap_flags_and_deadlines_feed_severity() {
    let ws = TestWorkspace::new("weights");
    repo::create_gap_flag(&ws.store, &ws.domain.id, "blocker", "missing access").unwrap();
    repo::create_gap_flag(&ws.store, &ws.domain.id, "question", "which vendor").unwrap();
    // Overdue P1 deadline contributes 4, P5 contributes 1
    repo::create_deadline(&ws.store, &ws.domain.id, "ship report", "2020-01-01", Some(1), None)
        .unwrap();
    repo::create_deadline(&ws.store, &ws.domain.id, "tidy backlog", "2020-01-01", Some(5), None)
        .unwrap();

    let portfolio = health::compute_portfolio_health(&ws.store, now_ms()).unwrap();
    let domain = &portfolio.domains[0];
    // 2 open gaps x 2 + deadline severity (4 + 1)
    assert_eq!(domain.severity, 4 + 5);
    assert_eq!(domain.open_gap_flags, 2);
    assert_eq!(domain.overdue_deadlines, 2);
    // Gap flags give the domain a last-touched signal
    assert!(domain.last_touched_at.is_some());
}

#[test]
fn test_snapshot_hash_invariant_under_input_reorder() {
    let ws = TestWorkspace::new("hash-a");
    let b = ws.add_domain("hash-b");
    let c = ws.add_domain("hash-c");
    repo::upsert_relationship(
        &ws.store, &ws.domain.id, &b.id,
        RelationshipType::Sibling, DependencyType::Blocks, None,
    ).unwrap();
    repo::upsert_relationship(
        &ws.store, &ws.domain.id, &c.id,
        RelationshipType::Sibling, DependencyType::DependsOn, None,
    ).unwrap();

    let now = now_ms();
    let first = health::compute_portfolio_health(&ws.store, now).unwrap();

    // Reorder the domain listing and recreate the edges in reverse order:
    // same logical state, different input order.
    repo::update_domain(
        &ws.store,
        &ws.domain.id,
        repo::DomainPatch { sort_order: Some(99), ..Default::default() },
    )
    .unwrap();
    repo::delete_relationship(&ws.store, &ws.domain.id, &b.id).unwrap();
    repo::delete_relationship(&ws.store, &ws.domain.id, &c.id).unwrap();
    repo::upsert_relationship(
        &ws.store, &ws.domain.id, &c.id,
        RelationshipType::Sibling, DependencyType::DependsOn, None,
    ).unwrap();
    repo::upsert_relationship(
        &ws.store, &ws.domain.id, &b.id,
        RelationshipType::Sibling, DependencyType::Blocks, None,
    ).unwrap();

    let second = health::compute_portfolio_health(&ws.store, now).unwrap();
    assert_eq!(first.snapshot_hash, second.snapshot_hash);
}

#[test]
fn test_snapshot_hash_changes_with_state() {
    let ws = TestWorkspace::new("hash-mut");
    let now = now_ms();
    let before = health::compute_portfolio_health(&ws.store, now).unwrap();

    repo::create_gap_flag(&ws.store, &ws.domain.id, "risk", "new risk surfaced").unwrap();
    let after = health::compute_portfolio_health(&ws.store, now).unwrap();
    assert_ne!(before.snapshot_hash, after.snapshot_hash);
}
