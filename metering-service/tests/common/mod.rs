//! Test helper module for metering-service integration tests.
//!
//! Provides common setup utilities for PostgreSQL-based tests. Tests
//! run against an isolated schema per test so they can execute in
//! parallel. When `TEST_DATABASE_URL` is not set the harness returns
//! `None` and the test skips itself.

#![allow(dead_code)]

use metering_service::config::{
    DatabaseConfig, MeteringConfig, SweeperConfig, WebhookConfig, WorkerAuthConfig,
};
use metering_service::services::{init_metrics, Database};
use metering_service::startup::Application;
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use service_core::utils::signature::generate_signature_header;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

pub const TEST_WORKER_KEY: &str = "test-worker-key";
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get the database URL for testing from the environment.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Generate a unique schema name for test isolation.
fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_metering_{}_{}", std::process::id(), counter)
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub db: Database,
    pub client: reqwest::Client,
    schema_name: String,
}

impl TestApp {
    /// Spawn a new test application on a random port, or `None` when no
    /// test database is configured.
    pub async fn spawn() -> Option<Self> {
        let Some(base_url) = get_test_database_url() else {
            eprintln!("TEST_DATABASE_URL not set; skipping integration test");
            return None;
        };

        init_metrics();

        let schema_name = unique_schema_name();

        // Create schema for test isolation
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");

        pool.close().await;

        // Use ? or & depending on whether URL already has query parameters
        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let config = MeteringConfig {
            common: CoreConfig {
                host: "0.0.0.0".to_string(),
                port: 0, // Random port
            },
            service_name: "metering-service-test".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: Secret::new(db_url_with_schema.clone()),
                max_connections: 5,
                min_connections: 1,
            },
            webhook: WebhookConfig {
                signing_secret: Secret::new(TEST_WEBHOOK_SECRET.to_string()),
                tolerance_secs: 300,
            },
            worker: WorkerAuthConfig {
                api_key: Secret::new(TEST_WORKER_KEY.to_string()),
            },
            sweeper: SweeperConfig {
                // Keep the background sweeper quiet during tests; sweep
                // passes are driven explicitly where needed.
                interval_secs: 3600,
            },
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let db = Database::new(&db_url_with_schema, 5, 1)
            .await
            .expect("Failed to create test database handle");

        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        Some(TestApp {
            address,
            port,
            db,
            client,
            schema_name,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Provision a subscription for a fresh account via the internal
    /// endpoint and return the account id.
    pub async fn provision_account(&self) -> Uuid {
        let account_id = Uuid::new_v4();
        let response = self
            .client
            .post(self.url("/v1/internal/provision"))
            .header("x-worker-api-key", TEST_WORKER_KEY)
            .json(&serde_json::json!({ "account_id": account_id }))
            .send()
            .await
            .expect("Failed to call provision endpoint");
        assert!(
            response.status().is_success(),
            "Provisioning failed: {}",
            response.status()
        );
        account_id
    }

    /// Settle usage through the privileged endpoint.
    pub async fn settle_usage(&self, account_id: Uuid, campaign: &str, units: i64) {
        let response = self
            .client
            .post(self.url("/v1/usage"))
            .header("x-worker-api-key", TEST_WORKER_KEY)
            .json(&serde_json::json!({
                "account_id": account_id,
                "campaign_id": campaign,
                "unit_count": units,
                "source_action": "scrape"
            }))
            .send()
            .await
            .expect("Failed to call usage endpoint");
        assert!(
            response.status().is_success(),
            "Settlement failed: {}",
            response.status()
        );
    }

    /// Fetch billing info for an account as JSON.
    pub async fn billing_info(&self, account_id: Uuid) -> serde_json::Value {
        let response = self
            .client
            .get(self.url("/v1/billing"))
            .header("x-account-id", account_id.to_string())
            .send()
            .await
            .expect("Failed to call billing endpoint");
        assert!(
            response.status().is_success(),
            "Billing info failed: {}",
            response.status()
        );
        response.json().await.expect("Invalid billing info JSON")
    }

    /// Run a quota check and return (status, body).
    pub async fn check_limits(
        &self,
        account_id: Uuid,
        units_to_add: i64,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let response = self
            .client
            .post(self.url("/v1/billing/check-limits"))
            .header("x-account-id", account_id.to_string())
            .json(&serde_json::json!({ "units_to_add": units_to_add }))
            .send()
            .await
            .expect("Failed to call check-limits endpoint");
        let status = response.status();
        let body = response.json().await.expect("Invalid check-limits JSON");
        (status, body)
    }

    /// Post a processor event with a valid signature.
    pub async fn deliver_webhook(&self, event: &serde_json::Value) -> reqwest::StatusCode {
        let body = event.to_string();
        let header =
            generate_signature_header(TEST_WEBHOOK_SECRET, chrono::Utc::now().timestamp(), &body)
                .expect("Failed to sign webhook body");

        self.client
            .post(self.url("/v1/webhooks/processor"))
            .header("processor-signature", header)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to call webhook endpoint")
            .status()
    }

    /// Link a subscription to a processor-side reference, as happens
    /// when an account upgrades to a paid plan.
    pub async fn link_external_ref(&self, account_id: Uuid, external_ref: &str) {
        sqlx::query("UPDATE subscriptions SET external_ref = $2 WHERE account_id = $1")
            .bind(account_id)
            .bind(external_ref)
            .execute(self.db.pool())
            .await
            .expect("Failed to link external ref");
    }

    /// Push a subscription's billing period into the past.
    pub async fn expire_period(&self, account_id: Uuid) {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET period_start = now() - interval '2 months',
                period_end = now() - interval '1 hour'
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .execute(self.db.pool())
        .await
        .expect("Failed to expire period");
    }

    /// Cleanup test resources (schema).
    pub async fn cleanup(&self) {
        let Some(base_url) = get_test_database_url() else {
            return;
        };

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
