//! Integration tests for unmatching, listing and recomputing reports.

mod common;

use common::*;
use matching_service::engine::profile::GENERIC;
use matching_service::engine::summarize;
use matching_service::models::{MatchSort, PageRequest, ReportStats};
use matching_service::services::{InMemoryStore, MatchStore, MatchingService};
use matching_service::MatchError;
use rust_decimal::Decimal;
use std::sync::atomic::Ordering;
use std::sync::Arc;

async fn app_with_three_matches() -> TestApp {
    let app = spawn_app();
    app.add_report(report(REPORT_ID, GENERIC)).await;
    app.add_transactions(vec![
        side_a(1, at(9, 0), "10.00"),
        side_b(2, at(9, 1), "10.01"),
        side_a(3, at(10, 0), "20.00"),
        side_b(4, at(10, 10), "19.99"),
        side_a(5, at(11, 0), "30.00"),
        side_b(6, at(11, 20), "30.00"),
    ])
    .await;
    let summary = app.service.run_auto_match(REPORT_ID).await.unwrap();
    assert_eq!(summary.new_matches, 3);
    app
}

#[tokio::test]
async fn deleting_missing_match_is_not_found() {
    let app = app_with_three_matches().await;

    let err = app.service.delete_match(99, REPORT_ID).await.unwrap_err();

    assert!(matches!(err, MatchError::NotFound(_)), "got {:?}", err);
    assert_eq!(app.matches(REPORT_ID).await.len(), 3);
}

#[tokio::test]
async fn deleting_from_another_report_is_not_found() {
    let app = app_with_three_matches().await;
    app.add_report(report(6, GENERIC)).await;
    let match_id = app.matches(REPORT_ID).await[0].match_id;

    let err = app.service.delete_match(match_id, 6).await.unwrap_err();

    assert!(matches!(err, MatchError::NotFound(_)));
    assert_eq!(app.matches(REPORT_ID).await.len(), 3);
}

#[tokio::test]
async fn delete_decrements_total_and_recomputes() {
    let app = app_with_three_matches().await;
    let before = app.stored_report(REPORT_ID).await.stats;
    assert_eq!(before.total_matches, 3);
    let victim = app.matches(REPORT_ID).await[1].clone();

    let stats = app
        .service
        .delete_match(victim.match_id, REPORT_ID)
        .await
        .unwrap();

    assert_eq!(stats.total_matches, before.total_matches - 1);
    let remaining = app.matches(REPORT_ID).await;
    assert!(remaining.iter().all(|m| m.match_id != victim.match_id));
    assert_eq!(stats, summarize(&remaining).unwrap());
    assert_eq!(app.stored_report(REPORT_ID).await.stats, stats);
}

#[tokio::test]
async fn failed_stats_write_keeps_the_match() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(inner.clone()));
    let service = MatchingService::new(flaky.clone(), builtin_profiles(), test_settings());
    inner.put_report(report(REPORT_ID, GENERIC)).await;
    inner.put_transaction(side_a(1, at(9, 0), "10.00")).await;
    inner.put_transaction(side_b(2, at(9, 1), "10.00")).await;
    service.run_auto_match(REPORT_ID).await.unwrap();
    let stored = inner.all_matches(REPORT_ID).await.unwrap();
    assert_eq!(stored.len(), 1);

    flaky.stale_version.store(true, Ordering::SeqCst);
    let err = service
        .delete_match(stored[0].match_id, REPORT_ID)
        .await
        .unwrap_err();

    assert!(matches!(err, MatchError::ReportBusy(REPORT_ID)), "got {:?}", err);
    let remaining = inner.all_matches(REPORT_ID).await.unwrap();
    assert_eq!(remaining, stored);
    let report = inner.get_report(REPORT_ID).await.unwrap().unwrap();
    assert_eq!(report.stats.total_matches, 1);
    assert_eq!(report.stats, summarize(&remaining).unwrap());
}

#[tokio::test]
async fn deleting_every_match_zeroes_stats() {
    let app = app_with_three_matches().await;

    for m in app.matches(REPORT_ID).await {
        app.service.delete_match(m.match_id, REPORT_ID).await.unwrap();
    }

    assert_eq!(app.stored_report(REPORT_ID).await.stats, ReportStats::default());
}

#[tokio::test]
async fn unmatched_transactions_can_be_matched_again() {
    let app = app_with_three_matches().await;
    let victim = app.matches(REPORT_ID).await[0].clone();
    app.service
        .delete_match(victim.match_id, REPORT_ID)
        .await
        .unwrap();

    let summary = app.service.run_auto_match(REPORT_ID).await.unwrap();

    assert_eq!(summary.new_matches, 1);
    let rematched = app
        .matches(REPORT_ID)
        .await
        .into_iter()
        .find(|m| m.side_a_id == victim.side_a_id)
        .unwrap();
    assert_eq!(rematched.side_b_id, victim.side_b_id);
    assert_ne!(rematched.match_id, victim.match_id);
}

#[tokio::test]
async fn list_matches_pages_and_sorts() {
    let app = app_with_three_matches().await;

    let first = app
        .service
        .list_matches(
            REPORT_ID,
            &PageRequest {
                page: 1,
                page_size: 2,
                sort: MatchSort::ProfitDesc,
            },
        )
        .await
        .unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.items[0].gross_profit, Decimal::new(1, 2));
    assert_eq!(first.items[1].gross_profit, Decimal::ZERO);

    let second = app
        .service
        .list_matches(
            REPORT_ID,
            &PageRequest {
                page: 2,
                page_size: 2,
                sort: MatchSort::ProfitDesc,
            },
        )
        .await
        .unwrap();
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].gross_profit, Decimal::new(-1, 2));

    let by_gap = app
        .service
        .list_matches(
            REPORT_ID,
            &PageRequest {
                sort: MatchSort::TimeDifferenceAsc,
                ..PageRequest::default()
            },
        )
        .await
        .unwrap();
    let gaps: Vec<i64> = by_gap.items.iter().map(|m| m.time_difference_secs).collect();
    assert_eq!(gaps, vec![60, 600, 1200]);
}

#[tokio::test]
async fn list_matches_rejects_bad_page() {
    let app = app_with_three_matches().await;
    let err = app
        .service
        .list_matches(
            REPORT_ID,
            &PageRequest {
                page: 0,
                ..PageRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::Validation(_)));
}

#[tokio::test]
async fn recompute_repairs_drifted_stats() {
    let app = app_with_three_matches().await;
    let mut drifted = app.stored_report(REPORT_ID).await;
    drifted.stats.total_matches = 42;
    drifted.stats.total_profit = Decimal::new(999, 0);
    app.add_report(drifted).await;

    let stats = app.service.recompute_report(REPORT_ID).await.unwrap();

    assert_eq!(stats.total_matches, 3);
    assert_eq!(stats, summarize(&app.matches(REPORT_ID).await).unwrap());
    assert_eq!(app.stored_report(REPORT_ID).await.stats, stats);
}
