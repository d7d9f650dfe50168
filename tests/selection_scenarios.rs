mod common;

use chrono::{Duration, Utc};
use common::{InMemoryStore, Write, monitor_row, with_status};
use monitor_selector::selector::process::{Processor, ReviewIntervals};
use monitor_selector::selector::rules::RuleConfig;
use monitor_selector::selector::types::{PauseReason, ServerStatus, ViolationType};
use monitor_selector::selector::SelectorError;
use tokio_util::sync::CancellationToken;

const SERVER: i32 = 1;

fn processor() -> Processor {
    Processor::new(RuleConfig::default(), ReviewIntervals::default())
}

fn store() -> InMemoryStore {
    let store = InMemoryStore::new();
    store.add_server(SERVER, "192.0.2.1", Some(999));
    store
}

#[tokio::test]
async fn bootstrap_from_empty_promotes_base_testing() {
    let store = store();
    for id in 1..=6 {
        store.assign(SERVER, monitor_row(id));
    }

    let outcome = processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.applied, 5);
    assert_eq!(store.count_status(SERVER, "testing"), 5);
    assert_eq!(store.count_status(SERVER, "candidate"), 1);
    assert!(store
        .status_writes(SERVER)
        .iter()
        .all(|(_, status)| *status == ServerStatus::Testing));
}

#[tokio::test]
async fn excess_actives_are_trimmed_worst_first() {
    let store = store();
    for id in 1..=9 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    let mut demoted = store.status_writes(SERVER);
    demoted.sort_by_key(|(id, _)| *id);
    assert_eq!(demoted, vec![(8, ServerStatus::Testing), (9, ServerStatus::Testing)]);
    assert_eq!(store.count_status(SERVER, "active"), 7);
}

#[tokio::test]
async fn emergency_override_respects_global_status() {
    let store = store();
    let mut pending = monitor_row(1);
    pending.monitor_status = "pending".into();
    let mut paused = monitor_row(2);
    paused.monitor_status = "paused".into();
    store.assign(SERVER, pending);
    store.assign(SERVER, paused);
    store.assign(SERVER, monitor_row(3));

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.status_writes(SERVER), vec![(3, ServerStatus::Testing)]);
}

#[tokio::test]
async fn better_candidate_replaces_worst_tester() {
    let store = store();
    for id in 1..=7 {
        let mut row = with_status(monitor_row(id), "active");
        row.monitor_priority = 10.0 + id as f64;
        store.assign(SERVER, row);
    }
    for (id, priority) in [(8, 50.0), (9, 60.0), (10, 70.0), (11, 80.0), (12, 90.0)] {
        let mut row = with_status(monitor_row(id), "testing");
        row.monitor_priority = priority;
        store.assign(SERVER, row);
    }
    let mut candidate = monitor_row(13);
    candidate.monitor_priority = 25.0;
    store.assign(SERVER, candidate);

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        store.status_writes(SERVER),
        vec![(12, ServerStatus::Candidate), (13, ServerStatus::Testing)]
    );
    assert_eq!(store.count_status(SERVER, "active"), 7);
    assert_eq!(store.count_status(SERVER, "testing"), 5);
}

#[tokio::test]
async fn safety_floor_holds_an_unhealthy_committee() {
    let store = store();
    for id in 1..=5 {
        let mut row = with_status(monitor_row(id), "active");
        row.healthy = false;
        store.assign(SERVER, row);
    }
    for id in 6..=8 {
        let mut row = with_status(monitor_row(id), "testing");
        row.healthy = false;
        store.assign(SERVER, row);
    }

    let outcome = processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.applied, 0);
    assert!(store.status_writes(SERVER).is_empty());
}

#[tokio::test]
async fn account_limit_excess_is_flagged_and_drained() {
    let store = store();
    for (id, priority) in [(10, 10.0), (20, 20.0), (30, 30.0)] {
        let mut row = with_status(monitor_row(id), "active");
        row.account_id = Some(42);
        row.monitor_priority = priority;
        store.assign(SERVER, row);
    }

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.status_writes(SERVER), vec![(30, ServerStatus::Testing)]);
    let row = store.row(SERVER, 30);
    assert_eq!(row.constraint_violation_type.as_deref(), Some("limit"));
    assert!(row.constraint_violation_since.is_some());
    assert!(store.row(SERVER, 10).constraint_violation_type.is_none());
}

#[tokio::test]
async fn second_pass_on_settled_server_writes_no_status() {
    let store = store();
    for id in 1..=9 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }
    let processor = processor();
    let cancel = CancellationToken::new();

    processor.process_server(&store, SERVER, &cancel).await.unwrap();
    store.clear_writes();

    let outcome = processor.process_server(&store, SERVER, &cancel).await.unwrap();
    assert_eq!(outcome.planned, 0);
    assert!(store.status_writes(SERVER).is_empty());
}

#[tokio::test]
async fn same_subnet_assignment_is_paused() {
    let store = store();
    for id in 1..=6 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }
    let mut neighbour = with_status(monitor_row(7), "active");
    neighbour.ip = Some("192.0.2.77".into());
    store.assign(SERVER, neighbour);

    let outcome = processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.paused, 1);
    let row = store.row(SERVER, 7);
    assert_eq!(row.status, "paused");
    assert_eq!(row.pause_reason.as_deref(), Some("network_conflict"));
    assert_eq!(row.constraint_violation_type.as_deref(), Some("network_same_subnet"));
    assert!(store.writes().contains(&Write::PauseReason {
        server_id: SERVER,
        monitor_id: 7,
        reason: PauseReason::NetworkConflict,
    }));
}

#[tokio::test]
async fn paused_rows_only_get_their_check_refreshed() {
    let store = store();
    for id in 1..=7 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }
    let mut paused = with_status(monitor_row(8), "paused");
    paused.ip = Some("192.0.2.8".into());
    paused.pause_reason = Some("network_conflict".into());
    store.assign(SERVER, paused);

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.status_of(SERVER, 8), "paused");
    assert!(store.row(SERVER, 8).last_constraint_check.is_some());
    assert!(store.writes().iter().all(|w| !matches!(
        w,
        Write::Status { monitor_id: 8, .. } | Write::Violation { monitor_id: 8, .. }
    )));
}

#[tokio::test]
async fn violation_since_survives_and_clears() {
    let store = store();
    let since = Utc::now() - Duration::days(2);
    for id in 1..=7 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }
    // Same /20 as monitor 1 and still there: the recorded start is kept.
    let mut neighbour = with_status(monitor_row(8), "testing");
    neighbour.ip = Some("10.1.0.200".into());
    neighbour.constraint_violation_type = Some("network_diversity".into());
    neighbour.constraint_violation_since = Some(since);
    store.assign(SERVER, neighbour);
    // Recorded violation that no longer applies.
    let mut resolved = with_status(monitor_row(9), "testing");
    resolved.constraint_violation_type = Some("limit".into());
    resolved.constraint_violation_since = Some(since);
    store.assign(SERVER, resolved);

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    let kept = store.row(SERVER, 8);
    assert_eq!(kept.constraint_violation_type.as_deref(), Some("network_diversity"));
    assert_eq!(kept.constraint_violation_since, Some(since));
    assert!(store.row(SERVER, 9).constraint_violation_type.is_none());
    assert!(store.writes().contains(&Write::ClearViolation {
        server_id: SERVER,
        monitor_id: 9
    }));
    assert!(!store.writes().iter().any(|w| matches!(
        w,
        Write::Violation { monitor_id: 8, kind: ViolationType::NetworkDiversity, .. }
    )));
}

#[tokio::test]
async fn next_review_depends_on_changes() {
    let store = store();
    for id in 1..=7 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }
    let before = Utc::now();

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();
    let unchanged = store.next_review(SERVER).unwrap();
    assert!(unchanged >= before + Duration::minutes(20));
    assert!(unchanged < before + Duration::minutes(21));

    store.assign(SERVER, monitor_row(8));
    store.make_due(SERVER);
    let before = Utc::now();
    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();
    let changed = store.next_review(SERVER).unwrap();
    assert!(changed >= before + Duration::minutes(60));
    assert!(store.writes().iter().any(|w| matches!(
        w,
        Write::Review { changed: true, .. }
    )));
}

#[tokio::test]
async fn failed_change_is_counted_and_others_still_apply() {
    let store = store();
    for id in 1..=6 {
        store.assign(SERVER, monitor_row(id));
    }
    store.fail_status_updates_for(2);

    let outcome = processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.planned, 5);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.applied, 4);
    assert_eq!(store.status_of(SERVER, 2), "candidate");
}

#[tokio::test]
async fn cancelled_pass_commits_nothing() {
    let store = store();
    for id in 1..=6 {
        store.assign(SERVER, monitor_row(id));
    }
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = processor()
        .process_server(&store, SERVER, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SelectorError::Cancelled));
    assert!(store.writes().is_empty());
    assert_eq!(store.count_status(SERVER, "candidate"), 6);
}

#[tokio::test]
async fn unknown_server_is_an_error() {
    let store = store();
    let err = processor()
        .process_server(&store, 404, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SelectorError::Store(monitor_selector::db::StoreError::ServerNotFound(404))
    ));
}

#[tokio::test]
async fn demoted_limit_violator_leaves_no_limit_flag_on_candidate_row() {
    let store = store();
    for id in 1..=7 {
        store.assign(SERVER, with_status(monitor_row(id), "active"));
    }
    // Four testers of one account where three are allowed.
    for id in 21..=24 {
        let mut row = with_status(monitor_row(id), "testing");
        row.account_id = Some(42);
        store.assign(SERVER, row);
    }
    let mut flagged = store.row(SERVER, 24);
    flagged.constraint_violation_type = Some("limit".into());
    flagged.constraint_violation_since = Some(Utc::now() - Duration::days(1));
    store.assign(SERVER, flagged);

    processor()
        .process_server(&store, SERVER, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.status_of(SERVER, 24), "candidate");
    let row = store.row(SERVER, 24);
    assert!(row.constraint_violation_type.is_none());
    assert!(row.constraint_violation_since.is_none());
    assert!(!store.writes().iter().any(|w| matches!(
        w,
        Write::Violation { monitor_id: 24, kind: ViolationType::Limit, .. }
    )));
}
