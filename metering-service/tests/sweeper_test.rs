//! Period sweeper tests: rollover, idempotence, and the counter
//! consistency check.

mod common;

use common::TestApp;
use metering_service::services::{Reconciler, Sweeper};
use std::sync::Arc;
use std::time::Duration;

fn sweeper_for(app: &TestApp) -> Sweeper {
    let db = Arc::new(app.db.clone());
    Sweeper::new(db.clone(), Reconciler::new(db), Duration::from_secs(3600))
}

#[tokio::test]
async fn expired_period_rolls_over_once() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;
    app.settle_usage(account_id, "campaign-history", 900).await;
    app.expire_period(account_id).await;

    let sweeper = sweeper_for(&app);
    let summary = sweeper.run_once().await.unwrap();
    assert_eq!(summary.rolled_over, 1);

    let info = app.billing_info(account_id).await;
    assert_eq!(info["units_used_this_period"], 0);
    let period_end_after_first = info["period_end"].as_str().unwrap().to_string();

    // The new period ends in the future.
    let in_future: bool =
        sqlx::query_scalar("SELECT period_end > now() FROM subscriptions WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert!(in_future);

    // A second immediate pass is self-excluding.
    let summary = sweeper.run_once().await.unwrap();
    assert_eq!(summary.rolled_over, 0);
    let info = app.billing_info(account_id).await;
    assert_eq!(info["period_end"].as_str().unwrap(), period_end_after_first);

    // The audit trail outlives the rollover.
    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_events WHERE account_id = $1")
        .bind(account_id)
        .fetch_one(app.db.pool())
        .await
        .unwrap();
    assert_eq!(events, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn current_periods_are_untouched() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;
    app.settle_usage(account_id, "campaign-now", 100).await;

    let summary = sweeper_for(&app).run_once().await.unwrap();
    assert_eq!(summary.rolled_over, 0);

    let info = app.billing_info(account_id).await;
    assert_eq!(info["units_used_this_period"], 100);

    app.cleanup().await;
}

#[tokio::test]
async fn terminal_subscriptions_are_not_swept() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;
    app.settle_usage(account_id, "campaign-end", 50).await;
    app.expire_period(account_id).await;
    sqlx::query("UPDATE subscriptions SET status = 'canceled' WHERE account_id = $1")
        .bind(account_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let summary = sweeper_for(&app).run_once().await.unwrap();
    assert_eq!(summary.rolled_over, 0);

    let info = app.billing_info(account_id).await;
    assert_eq!(info["units_used_this_period"], 50);

    app.cleanup().await;
}

#[tokio::test]
async fn counter_drift_is_detected() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;
    app.settle_usage(account_id, "campaign-drift", 10).await;

    // Force the ledger counter away from the event-log sum.
    sqlx::query("UPDATE subscriptions SET units_used_this_period = 99 WHERE account_id = $1")
        .bind(account_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let drift = app.db.find_counter_drift().await.unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].account_id, account_id);
    assert_eq!(drift[0].stored_units, 99);
    assert_eq!(drift[0].derived_units, 10);

    let summary = sweeper_for(&app).run_once().await.unwrap();
    assert_eq!(summary.drift_rows, 1);

    app.cleanup().await;
}
