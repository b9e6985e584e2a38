//! Integration tests for manual matching.

mod common;

use common::*;
use matching_service::engine::profile::GENERIC;
use matching_service::engine::summarize;
use matching_service::models::{MatchOrigin, Side};
use matching_service::MatchError;

async fn app_with_matched_pair() -> TestApp {
    let app = spawn_app();
    app.add_report(report(REPORT_ID, GENERIC)).await;
    app.add_transactions(vec![
        side_a(7, at(10, 0), "100.00"),
        side_b(10, at(10, 5), "100.00"),
        side_b(42, at(10, 6), "100.00"),
        side_a(8, at(16, 0), "12.00"),
    ])
    .await;
    app.service.run_auto_match(REPORT_ID).await.unwrap();
    app
}

#[tokio::test]
async fn already_matched_side_a_is_conflict() {
    let app = app_with_matched_pair().await;
    let existing = app.matches(REPORT_ID).await;
    assert_eq!(existing[0].side_a_id, 7);
    assert_eq!(existing[0].side_b_id, 10);

    let err = app
        .service
        .create_manual_match(REPORT_ID, 7, 42, "analyst@example.com")
        .await
        .unwrap_err();

    match err {
        MatchError::Conflict {
            report_id,
            side,
            transaction_id,
            existing_match_id,
        } => {
            assert_eq!(report_id, REPORT_ID);
            assert_eq!(side, Side::A);
            assert_eq!(transaction_id, 7);
            assert_eq!(existing_match_id, Some(existing[0].match_id));
        }
        other => panic!("expected Conflict, got {:?}", other),
    }
    assert_eq!(app.matches(REPORT_ID).await.len(), 1);
}

#[tokio::test]
async fn already_matched_side_b_is_conflict() {
    let app = app_with_matched_pair().await;

    let err = app
        .service
        .create_manual_match(REPORT_ID, 8, 10, "analyst@example.com")
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            MatchError::Conflict {
                side: Side::B,
                transaction_id: 10,
                ..
            }
        ),
        "got {:?}",
        err
    );
}

#[tokio::test]
async fn manual_match_bypasses_tolerance_and_window() {
    let app = app_with_matched_pair().await;

    // 12.00 vs 100.00, six hours apart.
    let created = app
        .service
        .create_manual_match(REPORT_ID, 8, 42, "analyst@example.com")
        .await
        .unwrap();

    assert_eq!(created.time_difference_secs, 5 * 3600 + 54 * 60);
    assert_eq!(created.financials.gross_expense, dec("12.00"));
    assert_eq!(created.financials.gross_income, dec("100.00"));
    assert_eq!(created.financials.gross_profit, dec("88.00"));
    assert_eq!(created.stats.total_matches, 2);

    let matches = app.matches(REPORT_ID).await;
    let manual = matches
        .iter()
        .find(|m| m.match_id == created.match_id)
        .unwrap();
    assert_eq!(manual.origin, MatchOrigin::Manual);
    assert_eq!(manual.created_by, "analyst@example.com");
    assert_eq!(manual.gross_profit, manual.gross_income - manual.gross_expense);

    let report = app.stored_report(REPORT_ID).await;
    assert_eq!(report.stats, summarize(&matches).unwrap());
}

#[tokio::test]
async fn missing_transaction_is_not_found() {
    let app = app_with_matched_pair().await;

    let err = app
        .service
        .create_manual_match(REPORT_ID, 8, 999, "analyst@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::NotFound(_)));

    // Transaction 42 exists, but not on side A's source.
    let err = app
        .service
        .create_manual_match(REPORT_ID, 42, 42, "analyst@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::NotFound(_)));
}

#[tokio::test]
async fn missing_report_is_not_found() {
    let app = spawn_app();
    let err = app
        .service
        .create_manual_match(99, 1, 2, "analyst@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::NotFound(_)));
}

#[tokio::test]
async fn blank_actor_is_rejected() {
    let app = app_with_matched_pair().await;
    let err = app
        .service
        .create_manual_match(REPORT_ID, 8, 42, "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::Validation(_)));
}

#[tokio::test]
async fn same_transaction_may_match_in_another_report() {
    let app = app_with_matched_pair().await;
    app.add_report(report(6, GENERIC)).await;

    let created = app
        .service
        .create_manual_match(6, 7, 10, "analyst@example.com")
        .await
        .unwrap();

    assert_eq!(created.stats.total_matches, 1);
    assert_eq!(app.matches(REPORT_ID).await.len(), 1);
}

#[tokio::test]
async fn auto_match_skips_manually_matched_transactions() {
    let app = spawn_app();
    app.add_report(report(REPORT_ID, GENERIC)).await;
    app.add_transactions(vec![
        side_a(1, at(10, 0), "100.00"),
        side_b(2, at(10, 1), "100.00"),
        side_b(3, at(10, 20), "100.00"),
    ])
    .await;

    app.service
        .create_manual_match(REPORT_ID, 1, 3, "analyst@example.com")
        .await
        .unwrap();
    let summary = app.service.run_auto_match(REPORT_ID).await.unwrap();

    assert_eq!(summary.new_matches, 0);
    assert_eq!(summary.total_matches, 1);
    assert_eq!(summary.unmatched_b, 1);
}
