//! Database service for metering-service.
//!
//! The subscription ledger row is the synchronization point for every
//! write path: settlement increments are atomic update-by-delta
//! statements, processor events are claimed with row locks, and the
//! period sweep is guarded purely by its predicate.

use crate::models::{
    CounterDrift, EventOutcome, Invoice, InvoicePayload, InvoiceStatus, PendingEvent,
    PlanDefinition, PlanTier, ProcessorEvent, ProcessorEventType, QuotaDecision, SettleUsage,
    Subscription, SubscriptionPayload, SubscriptionStatus, UsageEvent,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{Months, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, account_id, plan_id, external_ref, status, \
     period_start, period_end, units_used_this_period, auto_renew, canceled_at, created_utc, updated_utc";

const PLAN_COLUMNS: &str = "plan_id, tier, name, monthly_unit_limit, monthly_price_minor, \
     overage_unit_price_minor, is_active, created_utc, updated_utc";

const USAGE_EVENT_COLUMNS: &str =
    "event_id, account_id, campaign_id, source_action, unit_count, related_job_id, note, created_utc";

const INVOICE_COLUMNS: &str = "invoice_id, account_id, subscription_id, external_ref, status, \
     period_start, period_end, total_minor, paid_at, created_utc, updated_utc";

const PENDING_EVENT_COLUMNS: &str =
    "seq, event_id, event_type, reference, payload, received_utc, applied_utc, note";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Plan Catalog
    // =========================================================================

    /// Get a plan by ID.
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Option<PlanDefinition>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, PlanDefinition>(&format!(
            "SELECT {} FROM plan_definitions WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();

        Ok(plan)
    }

    /// List the active plan catalog.
    #[instrument(skip(self))]
    pub async fn list_active_plans(&self) -> Result<Vec<PlanDefinition>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_plans"])
            .start_timer();

        let plans = sqlx::query_as::<_, PlanDefinition>(&format!(
            "SELECT {} FROM plan_definitions WHERE is_active = TRUE ORDER BY monthly_price_minor",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list plans: {}", e)))?;

        timer.observe_duration();

        Ok(plans)
    }

    // =========================================================================
    // Subscription Ledger
    // =========================================================================

    /// Provision a subscription for a newly created account.
    ///
    /// Inserts a free-tier subscription with a fresh billing period.
    /// Duplicate invocation is a no-op: the conflict on the unique
    /// `account_id` returns the existing row instead. The bool reports
    /// whether a row was created.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn provision_account(
        &self,
        account_id: Uuid,
    ) -> Result<(Subscription, bool), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["provision_account"])
            .start_timer();

        let now = Utc::now();
        let period_end = now + Months::new(1);

        let inserted = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (subscription_id, account_id, plan_id, status, period_start, period_end, units_used_this_period)
            SELECT $1, $2, plan_id, $5, $3, $4, 0
            FROM plan_definitions
            WHERE tier = $6 AND is_active = TRUE
            ON CONFLICT (account_id) DO NOTHING
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(now)
        .bind(period_end)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(PlanTier::Free.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to provision account: {}", e))
        })?;

        timer.observe_duration();

        if let Some(subscription) = inserted {
            info!(subscription_id = %subscription.subscription_id, "Subscription provisioned");
            return Ok((subscription, true));
        }

        // Conflict path: the account is already provisioned. An empty
        // result here with no existing row means the free plan itself is
        // missing, which is a deployment problem.
        let existing = self.get_subscription(account_id).await?.ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "No active free plan in the catalog; cannot provision account {}",
                account_id
            ))
        })?;

        Ok((existing, false))
    }

    /// Get the subscription for an account.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_subscription(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE account_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Get the subscription and its plan for an account.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_subscription_with_plan(
        &self,
        account_id: Uuid,
    ) -> Result<Option<(Subscription, PlanDefinition)>, AppError> {
        let Some(subscription) = self.get_subscription(account_id).await? else {
            return Ok(None);
        };

        let plan = self.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Subscription {} references missing plan {}",
                subscription.subscription_id,
                subscription.plan_id
            ))
        })?;

        Ok(Some((subscription, plan)))
    }

    // =========================================================================
    // Admission Controller
    // =========================================================================

    /// Pre-flight quota check: can this account consume `requested_units`
    /// more leads right now?
    ///
    /// Reads without locking. The result is advisory and stale the
    /// instant it is returned; `settle_usage` is the authoritative write.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn check_quota(
        &self,
        account_id: Uuid,
        requested_units: i64,
    ) -> Result<QuotaDecision, AppError> {
        if requested_units <= 0 {
            return Err(AppError::InvalidUsageAmount(anyhow::anyhow!(
                "Requested units must be positive, got {}",
                requested_units
            )));
        }

        let (subscription, plan) = self
            .get_subscription_with_plan(account_id)
            .await?
            .ok_or_else(|| {
                AppError::NoActiveSubscription(anyhow::anyhow!(
                    "Account {} has no subscription",
                    account_id
                ))
            })?;

        Ok(QuotaDecision::evaluate(&subscription, &plan, requested_units))
    }

    /// Settle actual usage after work completes.
    ///
    /// One transaction: increment the ledger counter by the actual unit
    /// count (atomic delta, safe under concurrent settlement) and append
    /// the immutable usage event. Never blocked by quota: the work
    /// already happened, so admission time is the only enforcement point.
    #[instrument(skip(self, input), fields(account_id = %input.account_id, units = input.unit_count))]
    pub async fn settle_usage(&self, input: &SettleUsage) -> Result<UsageEvent, AppError> {
        if input.unit_count <= 0 {
            return Err(AppError::InvalidUsageAmount(anyhow::anyhow!(
                "Unit count must be positive, got {}",
                input.unit_count
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_usage"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin settlement: {}", e))
        })?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET units_used_this_period = units_used_this_period + $2, updated_utc = now()
            WHERE account_id = $1
            "#,
        )
        .bind(input.account_id)
        .bind(input.unit_count)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to increment usage counter: {}", e))
        })?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls back the increment.
            return Err(AppError::NoActiveSubscription(anyhow::anyhow!(
                "Account {} has no subscription to settle against",
                input.account_id
            )));
        }

        let event = sqlx::query_as::<_, UsageEvent>(&format!(
            r#"
            INSERT INTO usage_events (event_id, account_id, campaign_id, source_action, unit_count, related_job_id, note)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            USAGE_EVENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.account_id)
        .bind(&input.campaign_id)
        .bind(input.source.as_str())
        .bind(input.unit_count)
        .bind(input.related_job_id)
        .bind(&input.note)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record usage event: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit settlement: {}", e))
        })?;

        timer.observe_duration();
        info!(event_id = %event.event_id, units = event.unit_count, "Usage settled");

        Ok(event)
    }

    // =========================================================================
    // Period Sweeper
    // =========================================================================

    /// Roll expired billing periods forward and zero their counters.
    ///
    /// Safe to run concurrently with itself and with settlement: a row
    /// already rolled over no longer matches the predicate, so
    /// re-application is self-excluding. Usage history is untouched.
    #[instrument(skip(self))]
    pub async fn sweep_due_periods(&self) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sweep_due_periods"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET units_used_this_period = 0,
                period_start = now(),
                period_end = now() + interval '1 month',
                updated_utc = now()
            WHERE period_end <= now()
              AND status NOT IN ($1, $2)
            "#,
        )
        .bind(SubscriptionStatus::Canceled.as_str())
        .bind(SubscriptionStatus::Unpaid.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to sweep billing periods: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    /// Find ledger counters that disagree with the sum of their usage
    /// events since the period start. Read-only consistency check.
    #[instrument(skip(self))]
    pub async fn find_counter_drift(&self) -> Result<Vec<CounterDrift>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_counter_drift"])
            .start_timer();

        let drift = sqlx::query_as::<_, CounterDrift>(
            r#"
            SELECT s.account_id,
                   s.units_used_this_period AS stored_units,
                   COALESCE(SUM(e.unit_count), 0)::BIGINT AS derived_units
            FROM subscriptions s
            LEFT JOIN usage_events e
              ON e.account_id = s.account_id AND e.created_utc >= s.period_start
            GROUP BY s.account_id, s.units_used_this_period
            HAVING s.units_used_this_period <> COALESCE(SUM(e.unit_count), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check counter drift: {}", e))
        })?;

        timer.observe_duration();

        Ok(drift)
    }

    // =========================================================================
    // Invoice Records
    // =========================================================================

    /// Get an invoice by its processor-side reference.
    #[instrument(skip(self))]
    pub async fn get_invoice_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_by_external_ref"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE external_ref = $1",
            INVOICE_COLUMNS
        ))
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    // =========================================================================
    // Event Reconciler
    // =========================================================================

    /// Durably store a processor event. Idempotent per event id: a
    /// re-delivered event conflicts and inserts nothing. Returns whether
    /// the event was newly stored.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn ingest_processor_event(&self, event: &ProcessorEvent) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ingest_processor_event"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO processor_events (event_id, event_type, reference, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.reference())
        .bind(&event.data.object)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to ingest processor event: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    /// List stored events that have not been applied yet, in ingestion
    /// order.
    #[instrument(skip(self))]
    pub async fn list_unapplied_events(&self, limit: i64) -> Result<Vec<PendingEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unapplied_events"])
            .start_timer();

        let events = sqlx::query_as::<_, PendingEvent>(&format!(
            r#"
            SELECT {}
            FROM processor_events
            WHERE applied_utc IS NULL
            ORDER BY seq
            LIMIT $1
            "#,
            PENDING_EVENT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list pending events: {}", e))
        })?;

        timer.observe_duration();

        Ok(events)
    }

    /// Apply one stored processor event to the ledger and invoice store.
    ///
    /// The event row is claimed with `FOR UPDATE SKIP LOCKED` so
    /// concurrent drains never double-apply, and application is deferred
    /// while an earlier unapplied event exists for the same external
    /// reference (single-writer-per-key ordering). All effects and the
    /// applied marker commit in one transaction.
    #[instrument(skip(self, event), fields(event_id = %event.event_id, event_type = %event.event_type))]
    pub async fn apply_processor_event(
        &self,
        event: &PendingEvent,
    ) -> Result<EventOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_processor_event"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin event application: {}", e))
        })?;

        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT seq FROM processor_events
            WHERE seq = $1 AND applied_utc IS NULL
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(event.seq)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to claim event: {}", e)))?;

        if claimed.is_none() {
            return Ok(EventOutcome::AlreadyApplied);
        }

        if let Some(reference) = &event.reference {
            let blocked: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM processor_events
                    WHERE reference = $1 AND seq < $2 AND applied_utc IS NULL
                )
                "#,
            )
            .bind(reference)
            .bind(event.seq)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to check event ordering: {}", e))
            })?;

            if blocked {
                // An earlier event for the same reference must land first.
                return Ok(EventOutcome::Deferred);
            }
        }

        let (outcome, note) = match event.kind() {
            ProcessorEventType::SubscriptionUpdated => {
                Self::apply_subscription_updated(&mut tx, event).await?
            }
            ProcessorEventType::SubscriptionDeleted => {
                Self::apply_subscription_deleted(&mut tx, event).await?
            }
            ProcessorEventType::InvoicePaid => Self::apply_invoice_paid(&mut tx, event).await?,
            ProcessorEventType::InvoicePaymentFailed => {
                Self::apply_invoice_payment_failed(&mut tx, event).await?
            }
            ProcessorEventType::Unknown => (
                EventOutcome::Ignored,
                Some(format!("unhandled event type {}", event.event_type)),
            ),
        };

        sqlx::query("UPDATE processor_events SET applied_utc = now(), note = $2 WHERE seq = $1")
            .bind(event.seq)
            .bind(&note)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to mark event applied: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit event application: {}", e))
        })?;

        timer.observe_duration();

        Ok(outcome)
    }

    async fn apply_subscription_updated(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PendingEvent,
    ) -> Result<(EventOutcome, Option<String>), AppError> {
        let payload: SubscriptionPayload = match serde_json::from_value(event.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                return Ok((
                    EventOutcome::Ignored,
                    Some(format!("malformed subscription payload: {}", e)),
                ))
            }
        };

        let (Some(period_start), Some(period_end)) =
            (payload.period_start_utc(), payload.period_end_utc())
        else {
            return Ok((
                EventOutcome::Ignored,
                Some("invalid period timestamps".to_string()),
            ));
        };

        if period_start >= period_end {
            return Ok((
                EventOutcome::Ignored,
                Some("period start not before period end".to_string()),
            ));
        }

        let status = if payload.is_active_equivalent() {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::PastDue
        };

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, period_start = $3, period_end = $4, updated_utc = now()
            WHERE external_ref = $1 AND status <> 'canceled'
            "#,
        )
        .bind(&payload.id)
        .bind(status.as_str())
        .bind(period_start)
        .bind(period_end)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update subscription: {}", e))
        })?;

        if result.rows_affected() > 0 {
            return Ok((EventOutcome::Applied, None));
        }

        if Self::subscription_ref_exists(tx, &payload.id).await? {
            // Cancellation is terminal; later updates are ignored.
            Ok((
                EventOutcome::Ignored,
                Some("subscription is canceled; update ignored".to_string()),
            ))
        } else {
            Ok((
                EventOutcome::NoLocalRecord,
                Some(format!("no subscription for reference {}", payload.id)),
            ))
        }
    }

    async fn apply_subscription_deleted(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PendingEvent,
    ) -> Result<(EventOutcome, Option<String>), AppError> {
        let Some(reference) = &event.reference else {
            return Ok((
                EventOutcome::Ignored,
                Some("deletion event without reference".to_string()),
            ));
        };

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = now(), auto_renew = FALSE, updated_utc = now()
            WHERE external_ref = $1 AND status <> 'canceled'
            "#,
        )
        .bind(reference)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel subscription: {}", e))
        })?;

        if result.rows_affected() > 0 {
            return Ok((EventOutcome::Applied, None));
        }

        if Self::subscription_ref_exists(tx, reference).await? {
            Ok((
                EventOutcome::Ignored,
                Some("subscription already canceled".to_string()),
            ))
        } else {
            Ok((
                EventOutcome::NoLocalRecord,
                Some(format!("no subscription for reference {}", reference)),
            ))
        }
    }

    async fn apply_invoice_paid(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PendingEvent,
    ) -> Result<(EventOutcome, Option<String>), AppError> {
        let payload: InvoicePayload = match serde_json::from_value(event.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                return Ok((
                    EventOutcome::Ignored,
                    Some(format!("malformed invoice payload: {}", e)),
                ))
            }
        };

        // Fast path: the invoice is already known.
        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, paid_at = COALESCE(paid_at, now()), updated_utc = now()
            WHERE external_ref = $1
            "#,
        )
        .bind(&payload.id)
        .bind(InvoiceStatus::Paid.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark invoice paid: {}", e))
        })?;

        if updated.rows_affected() > 0 {
            return Ok((EventOutcome::Applied, None));
        }

        let Some(subscription_ref) = &payload.subscription else {
            return Ok((
                EventOutcome::NoLocalRecord,
                Some("invoice carries no subscription reference".to_string()),
            ));
        };

        let Some((subscription_id, account_id)) =
            Self::resolve_subscription_ref(tx, subscription_ref).await?
        else {
            return Ok((
                EventOutcome::NoLocalRecord,
                Some(format!("no subscription for reference {}", subscription_ref)),
            ));
        };

        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, account_id, subscription_id, external_ref, status, period_start, period_end, total_minor, paid_at)
            VALUES ($1, $2, $3, $4, $8, $5, $6, $7, now())
            ON CONFLICT (external_ref) DO UPDATE
            SET status = EXCLUDED.status, paid_at = COALESCE(invoices.paid_at, now()), updated_utc = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(subscription_id)
        .bind(&payload.id)
        .bind(payload.period_start_utc())
        .bind(payload.period_end_utc())
        .bind(payload.amount_due)
        .bind(InvoiceStatus::Paid.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert paid invoice: {}", e))
        })?;

        Ok((EventOutcome::Applied, None))
    }

    async fn apply_invoice_payment_failed(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PendingEvent,
    ) -> Result<(EventOutcome, Option<String>), AppError> {
        let payload: InvoicePayload = match serde_json::from_value(event.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                return Ok((
                    EventOutcome::Ignored,
                    Some(format!("malformed invoice payload: {}", e)),
                ))
            }
        };

        let mut touched = false;

        if let Some(subscription_ref) = &payload.subscription {
            let result = sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = $2, updated_utc = now()
                WHERE external_ref = $1 AND status <> 'canceled'
                "#,
            )
            .bind(subscription_ref)
            .bind(SubscriptionStatus::PastDue.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to mark subscription past due: {}",
                    e
                ))
            })?;
            touched |= result.rows_affected() > 0;
        }

        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, updated_utc = now()
            WHERE external_ref = $1
            "#,
        )
        .bind(&payload.id)
        .bind(InvoiceStatus::Failed.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark invoice failed: {}", e))
        })?;
        touched |= updated.rows_affected() > 0;

        if updated.rows_affected() == 0 {
            if let Some(subscription_ref) = &payload.subscription {
                if let Some((subscription_id, account_id)) =
                    Self::resolve_subscription_ref(tx, subscription_ref).await?
                {
                    sqlx::query(
                        r#"
                        INSERT INTO invoices (invoice_id, account_id, subscription_id, external_ref, status, period_start, period_end, total_minor)
                        VALUES ($1, $2, $3, $4, $8, $5, $6, $7)
                        ON CONFLICT (external_ref) DO UPDATE
                        SET status = EXCLUDED.status, updated_utc = now()
                        "#,
                    )
                    .bind(Uuid::new_v4())
                    .bind(account_id)
                    .bind(subscription_id)
                    .bind(&payload.id)
                    .bind(payload.period_start_utc())
                    .bind(payload.period_end_utc())
                    .bind(payload.amount_due)
                    .bind(InvoiceStatus::Failed.as_str())
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Failed to insert failed invoice: {}",
                            e
                        ))
                    })?;
                    touched = true;
                }
            }
        }

        if touched {
            Ok((EventOutcome::Applied, None))
        } else {
            Ok((
                EventOutcome::NoLocalRecord,
                Some(format!(
                    "no subscription or invoice for reference {}",
                    payload.id
                )),
            ))
        }
    }

    async fn subscription_ref_exists(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        reference: &str,
    ) -> Result<bool, AppError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM subscriptions WHERE external_ref = $1)")
            .bind(reference)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to look up reference: {}", e))
            })
    }

    async fn resolve_subscription_ref(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        reference: &str,
    ) -> Result<Option<(Uuid, Uuid)>, AppError> {
        sqlx::query_as(
            "SELECT subscription_id, account_id FROM subscriptions WHERE external_ref = $1",
        )
        .bind(reference)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to resolve subscription: {}", e))
        })
    }
}
