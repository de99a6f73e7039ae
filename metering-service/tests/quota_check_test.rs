//! Admission-control tests for the quota check endpoint.

mod common;

use common::TestApp;
use uuid::Uuid;

#[tokio::test]
async fn near_limit_admission_matches_remaining_budget() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    // Free plan: 1000 units. Consume 750.
    let account_id = app.provision_account().await;
    app.settle_usage(account_id, "campaign-a", 750).await;

    // 750 + 400 > 1000: denied with upgrade context.
    let (status, body) = app.check_limits(account_id, 400).await;
    assert_eq!(status, reqwest::StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["remaining"], 250);
    assert_eq!(body["tier"], "free");
    assert!(body["reason"].as_str().unwrap().contains("limit"));

    // 750 + 200 <= 1000: admitted.
    let (status, body) = app.check_limits(account_id, 200).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["remaining"], 250);

    app.cleanup().await;
}

#[tokio::test]
async fn exact_fit_is_admitted() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;
    app.settle_usage(account_id, "campaign-a", 750).await;

    let (status, body) = app.check_limits(account_id, 250).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["allowed"], true);

    app.cleanup().await;
}

#[tokio::test]
async fn unlimited_plan_always_admits() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET plan_id = (SELECT plan_id FROM plan_definitions WHERE tier = 'enterprise')
        WHERE account_id = $1
        "#,
    )
    .bind(account_id)
    .execute(app.db.pool())
    .await
    .unwrap();

    let (status, body) = app.check_limits(account_id, 1_000_000).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["remaining"], -1);

    let info = app.billing_info(account_id).await;
    assert_eq!(info["units_remaining"], -1);
    assert_eq!(info["monthly_unit_limit"], -1);

    app.cleanup().await;
}

#[tokio::test]
async fn nonpositive_request_is_rejected() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let account_id = app.provision_account().await;

    let (status, _) = app.check_limits(account_id, 0).await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    let (status, _) = app.check_limits(account_id, -5).await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_account_has_no_subscription() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let (status, _) = app.check_limits(Uuid::new_v4(), 10).await;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

    app.cleanup().await;
}

#[tokio::test]
async fn billing_info_requires_account_header() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let response = app
        .client
        .get(app.url("/v1/billing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    app.cleanup().await;
}
