//! Postgres persistence for recurring-service.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    BankTransaction, ExpectedMatch, ExpectedStatus, ExpectedTransaction, LedgerFilter,
    NewExpectedTransaction, NewRecurringTransaction, RecurringTransaction,
    RecurringTransactionRow, RecurringUpdate, SortOrder, TransactionType,
};
use crate::services::audit::{AuditLog, AuditRecord};
use crate::services::ledger::{Ledger, QueryOptions};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::replica::ReplicaLagProbe;
use crate::services::repository::{DataSource, Repository};

macro_rules! recurring_columns {
    () => {
        "id, bank_account_id, user_id, transaction_display_name, pending_display_name, \
         user_display_name, user_amount, transaction_type, status, interval_kind, params, \
         roll_direction, dtstart, missed, possible_name_change, created_utc, deleted_utc"
    };
}

macro_rules! expected_columns {
    () => {
        "id, recurring_transaction_id, bank_account_id, user_id, expected_date, expected_amount, \
         status, pending_date, pending_amount, settled_date, settled_amount, bank_transaction_id, \
         bank_transaction_external_id, display_name, pending_display_name, extra, deleted_utc"
    };
}

macro_rules! bank_transaction_columns {
    () => {
        "id, external_id, bank_account_id, amount, transaction_date, display_name, \
         pending_display_name, pending, status"
    };
}

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";

fn sql_state(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.to_string()),
        _ => None,
    }
}

/// Map a sqlx error, turning unique violations into `Conflict`.
fn map_db_error(context: &str, e: sqlx::Error) -> AppError {
    if sql_state(&e).as_deref() == Some(UNIQUE_VIOLATION) {
        return AppError::Conflict(anyhow::anyhow!("{}: {}", context, e));
    }
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Shared by the standalone audit append and the account-transition
/// transaction.
async fn insert_audit<'e, E>(executor: E, user_id: Uuid, record: &AuditRecord) -> Result<(), AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    let payload = serde_json::to_value(record)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode audit record: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO audit_log (id, user_id, action, subject_id, payload)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(record.action())
    .bind(record.subject_id())
    .bind(payload)
    .execute(executor)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to append audit record: {}", e)))?;

    Ok(())
}

fn is_insert_race(e: &sqlx::Error) -> bool {
    matches!(
        sql_state(e).as_deref(),
        Some(UNIQUE_VIOLATION) | Some(SERIALIZATION_FAILURE)
    )
}

/// Database connection pools: the primary, and a replica when configured.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    replica: Option<PgPool>,
}

impl Database {
    /// Create the connection pools.
    #[instrument(skip(database_url, replica_url), fields(service = "recurring-service"))]
    pub async fn new(
        database_url: &str,
        replica_url: Option<&str>,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            replica = replica_url.is_some(),
            "Connecting to PostgreSQL"
        );

        let pool = Self::connect(database_url, max_connections, min_connections).await?;
        let replica = match replica_url {
            Some(url) => Some(Self::connect(url, max_connections, min_connections).await?),
            None => None,
        };

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, replica })
    }

    async fn connect(url: &str, max: u32, min: u32) -> Result<PgPool, AppError> {
        PgPoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))
    }

    /// Wrap existing pools.
    pub fn from_pools(pool: PgPool, replica: Option<PgPool>) -> Self {
        Self { pool, replica }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pool serving a read. Falls back to the primary without a replica.
    fn reader(&self, source: DataSource) -> &PgPool {
        match source {
            DataSource::Primary => &self.pool,
            DataSource::Replica => self.replica.as_ref().unwrap_or(&self.pool),
        }
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

    fn into_recurring(rows: Vec<RecurringTransactionRow>) -> Vec<RecurringTransaction> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id;
                match RecurringTransaction::try_from(row) {
                    Ok(recurring) => Some(recurring),
                    Err(e) => {
                        warn!(recurring_transaction_id = %id, error = %e, "Skipping row with invalid schedule");
                        None
                    }
                }
            })
            .collect()
    }

    async fn insert_expected(
        &self,
        rows: &[NewExpectedTransaction],
    ) -> Result<Vec<ExpectedTransaction>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(rows.len());

        for row in rows {
            let expected = sqlx::query_as::<_, ExpectedTransaction>(concat!(
                r#"
                INSERT INTO expected_transactions
                    (id, recurring_transaction_id, bank_account_id, user_id, expected_date,
                     expected_amount, status, display_name, pending_display_name)
                VALUES ($1, $2, $3, $4, $5, $6, 'PREDICTED', $7, $8)
                ON CONFLICT (recurring_transaction_id, expected_date)
                DO UPDATE SET deleted_utc = NULL, updated_utc = NOW()
                RETURNING "#,
                expected_columns!()
            ))
            .bind(Uuid::new_v4())
            .bind(row.recurring_transaction_id)
            .bind(row.bank_account_id)
            .bind(row.user_id)
            .bind(row.expected_date)
            .bind(row.expected_amount)
            .bind(&row.display_name)
            .bind(&row.pending_display_name)
            .fetch_one(&mut *tx)
            .await?;
            saved.push(expected);
        }

        tx.commit().await?;
        Ok(saved)
    }
}

#[async_trait]
impl Repository for Database {
    #[instrument(skip(self, source), fields(recurring_transaction_id = %id, source = source.as_str()))]
    async fn get_recurring(
        &self,
        id: Uuid,
        source: DataSource,
    ) -> Result<Option<RecurringTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_recurring"])
            .start_timer();

        let row = sqlx::query_as::<_, RecurringTransactionRow>(concat!(
            "SELECT ",
            recurring_columns!(),
            " FROM recurring_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.reader(source))
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get recurring transaction: {}", e)))?;

        timer.observe_duration();

        row.map(RecurringTransaction::try_from).transpose()
    }

    #[instrument(skip(self, source), fields(bank_account_id = %bank_account_id, source = source.as_str()))]
    async fn matchable_recurring_by_account(
        &self,
        bank_account_id: Uuid,
        source: DataSource,
    ) -> Result<Vec<RecurringTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["matchable_recurring_by_account"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecurringTransactionRow>(concat!(
            "SELECT ",
            recurring_columns!(),
            r#"
            FROM recurring_transactions
            WHERE bank_account_id = $1
              AND deleted_utc IS NULL
              AND status <> 'INVALID_NAME'
            ORDER BY created_utc, id
            "#
        ))
        .bind(bank_account_id)
        .fetch_all(self.reader(source))
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list recurring transactions: {}", e)))?;

        timer.observe_duration();

        Ok(Self::into_recurring(rows))
    }

    #[instrument(
        skip(self, original, clone, moves),
        fields(
            old_recurring_transaction_id = %original.id,
            new_bank_account_id = %clone.bank_account_id,
            moves = moves.len()
        )
    )]
    async fn transition_recurring(
        &self,
        original: &RecurringTransaction,
        clone: &NewRecurringTransaction,
        moves: &[(Uuid, ExpectedMatch)],
    ) -> Result<RecurringTransaction, AppError> {
        clone.validate()?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_recurring"])
            .start_timer();

        // Dropping `tx` on an early return rolls everything back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_error("Failed to begin account transition", e))?;

        let row = sqlx::query_as::<_, RecurringTransactionRow>(concat!(
            r#"
            INSERT INTO recurring_transactions
                (id, bank_account_id, user_id, transaction_display_name, pending_display_name,
                 user_display_name, user_amount, transaction_type, status, interval_kind, params,
                 roll_direction, dtstart)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING "#,
            recurring_columns!()
        ))
        .bind(Uuid::new_v4())
        .bind(clone.bank_account_id)
        .bind(clone.user_id)
        .bind(&clone.transaction_display_name)
        .bind(&clone.pending_display_name)
        .bind(&clone.user_display_name)
        .bind(clone.user_amount)
        .bind(clone.transaction_type)
        .bind(clone.status)
        .bind(clone.schedule.kind().as_str())
        .bind(clone.schedule.params())
        .bind(clone.schedule.roll_direction().as_str())
        .bind(clone.schedule.anchor())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_error("Failed to create recurring transaction", e))?;
        let moved = RecurringTransaction::try_from(row)?;

        for (expected_id, matched) in moves {
            let result = sqlx::query(
                r#"
                UPDATE expected_transactions
                SET recurring_transaction_id = $2,
                    bank_account_id = $3,
                    status = $4,
                    pending_date = $5,
                    pending_amount = $6,
                    settled_date = $7,
                    settled_amount = $8,
                    bank_transaction_id = $9,
                    bank_transaction_external_id = $10,
                    pending_display_name = COALESCE($11, pending_display_name),
                    updated_utc = NOW()
                WHERE id = $1
                  AND recurring_transaction_id = $12
                  AND deleted_utc IS NULL
                  AND bank_transaction_id IS NULL
                  AND status = 'PREDICTED'
                "#,
            )
            .bind(expected_id)
            .bind(moved.id)
            .bind(moved.bank_account_id)
            .bind(matched.status)
            .bind(matched.pending_date)
            .bind(matched.pending_amount)
            .bind(matched.settled_date)
            .bind(matched.settled_amount)
            .bind(matched.bank_transaction_id)
            .bind(&matched.bank_transaction_external_id)
            .bind(&matched.pending_display_name)
            .bind(original.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_error("Failed to move expected transaction", e))?;

            if result.rows_affected() == 0 {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Expected transaction {} is no longer an open prediction of {}",
                    expected_id,
                    original.id
                )));
            }
        }

        let deleted = sqlx::query(
            r#"
            UPDATE recurring_transactions
            SET deleted_utc = NOW(), updated_utc = NOW()
            WHERE id = $1 AND deleted_utc IS NULL
            "#,
        )
        .bind(original.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_error("Failed to delete recurring transaction", e))?;

        if deleted.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Recurring transaction {} was already removed",
                original.id
            )));
        }

        insert_audit(
            &mut *tx,
            original.user_id,
            &AuditRecord::account_transition(original, &moved, moves.len()),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_error("Failed to commit account transition", e))?;

        timer.observe_duration();
        info!(new_recurring_transaction_id = %moved.id, "Recurring transaction moved");

        Ok(moved)
    }

    #[instrument(skip(self), fields(bank_account_id = %bank_account_id))]
    async fn valid_incomes_by_account(
        &self,
        bank_account_id: Uuid,
    ) -> Result<Vec<RecurringTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["valid_incomes_by_account"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecurringTransactionRow>(concat!(
            "SELECT ",
            recurring_columns!(),
            r#"
            FROM recurring_transactions
            WHERE bank_account_id = $1
              AND deleted_utc IS NULL
              AND status = 'VALID'
              AND transaction_type = 'INCOME'
            ORDER BY created_utc, id
            "#
        ))
        .bind(bank_account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list incomes: {}", e)))?;

        timer.observe_duration();

        Ok(Self::into_recurring(rows))
    }

    #[instrument(skip(self), fields(bank_account_id = %bank_account_id))]
    async fn count_incomes_including_deleted(
        &self,
        bank_account_id: Uuid,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_incomes_including_deleted"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM recurring_transactions
            WHERE bank_account_id = $1 AND transaction_type = 'INCOME'
            "#,
        )
        .bind(bank_account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count incomes: {}", e)))?;

        timer.observe_duration();

        Ok(count)
    }

    #[instrument(skip(self, update), fields(recurring_transaction_id = %id))]
    async fn update_recurring(&self, id: Uuid, update: &RecurringUpdate) -> Result<(), AppError> {
        if update.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_recurring"])
            .start_timer();

        let schedule = update.schedule.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE recurring_transactions
            SET interval_kind = COALESCE($2, interval_kind),
                params = COALESCE($3, params),
                roll_direction = COALESCE($4, roll_direction),
                dtstart = COALESCE($5, dtstart),
                missed = CASE WHEN $6 THEN $7 ELSE missed END,
                transaction_display_name = COALESCE($8, transaction_display_name),
                pending_display_name = COALESCE($9, pending_display_name),
                possible_name_change = CASE WHEN $10 THEN $11 ELSE possible_name_change END,
                updated_utc = NOW()
            WHERE id = $1 AND deleted_utc IS NULL
            "#,
        )
        .bind(id)
        .bind(schedule.map(|s| s.kind().as_str()))
        .bind(schedule.map(|s| s.params()))
        .bind(schedule.map(|s| s.roll_direction().as_str()))
        .bind(schedule.map(|s| s.anchor()))
        .bind(update.missed.is_some())
        .bind(update.missed.flatten())
        .bind(&update.transaction_display_name)
        .bind(&update.pending_display_name)
        .bind(update.possible_name_change.is_some())
        .bind(update.possible_name_change.clone().flatten())
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("Failed to update recurring transaction", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Recurring transaction {} not found",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(recurring_transaction_id = %id))]
    async fn mark_missed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_missed"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE recurring_transactions
            SET missed = $2, updated_utc = NOW()
            WHERE id = $1 AND missed IS NULL AND deleted_utc IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark missed: {}", e)))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(bank_account_id = %bank_account_id))]
    async fn main_paycheck_id(&self, bank_account_id: Uuid) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["main_paycheck_id"])
            .start_timer();

        let id: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT main_paycheck_recurring_transaction_id FROM bank_accounts WHERE id = $1",
        )
        .bind(bank_account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get main paycheck: {}", e)))?;

        timer.observe_duration();

        Ok(id.flatten())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn main_paychecks_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecurringTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["main_paychecks_for_user"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecurringTransactionRow>(concat!(
            "SELECT ",
            recurring_columns!(),
            r#"
            FROM recurring_transactions
            WHERE deleted_utc IS NULL
              AND id IN (
                SELECT main_paycheck_recurring_transaction_id
                FROM bank_accounts
                WHERE user_id = $1 AND main_paycheck_recurring_transaction_id IS NOT NULL
              )
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list main paychecks: {}", e)))?;

        timer.observe_duration();

        Ok(Self::into_recurring(rows))
    }

    #[instrument(skip(self), fields(bank_account_id = %bank_account_id))]
    async fn transition_sources(&self, bank_account_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_sources"])
            .start_timer();

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT from_bank_account_id
            FROM bank_account_transitions
            WHERE to_bank_account_id = $1
            ORDER BY created_utc DESC
            "#,
        )
        .bind(bank_account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list transitions: {}", e)))?;

        timer.observe_duration();

        Ok(ids)
    }

    #[instrument(skip(self), fields(recurring_transaction_id = %recurring_transaction_id))]
    async fn record_missed_alert(
        &self,
        recurring_transaction_id: Uuid,
        missed: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_missed_alert"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO missed_payment_alerts (recurring_transaction_id, missed)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(recurring_transaction_id)
        .bind(missed)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record alert: {}", e)))?;

        timer.observe_duration();

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, source), fields(recurring_transaction_id = %recurring_transaction_id, source = source.as_str()))]
    async fn expected_in_range(
        &self,
        recurring_transaction_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        source: DataSource,
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expected_in_range"])
            .start_timer();

        let rows = sqlx::query_as::<_, ExpectedTransaction>(concat!(
            "SELECT ",
            expected_columns!(),
            r#"
            FROM expected_transactions
            WHERE recurring_transaction_id = $1
              AND expected_date BETWEEN $2 AND $3
              AND deleted_utc IS NULL
            ORDER BY expected_date
            "#
        ))
        .bind(recurring_transaction_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.reader(source))
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list expected transactions: {}", e)))?;

        timer.observe_duration();

        Ok(rows)
    }

    #[instrument(skip(self), fields(recurring_transaction_id = %recurring_transaction_id))]
    async fn latest_expected(
        &self,
        recurring_transaction_id: Uuid,
        source: DataSource,
    ) -> Result<Option<ExpectedTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_expected"])
            .start_timer();

        let row = sqlx::query_as::<_, ExpectedTransaction>(concat!(
            "SELECT ",
            expected_columns!(),
            r#"
            FROM expected_transactions
            WHERE recurring_transaction_id = $1 AND deleted_utc IS NULL
            ORDER BY expected_date DESC
            LIMIT 1
            "#
        ))
        .bind(recurring_transaction_id)
        .fetch_optional(self.reader(source))
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get latest expected: {}", e)))?;

        timer.observe_duration();

        Ok(row)
    }

    #[instrument(skip(self), fields(recurring_transaction_id = %recurring_transaction_id))]
    async fn expected_on(
        &self,
        recurring_transaction_id: Uuid,
        expected_date: NaiveDate,
    ) -> Result<Option<ExpectedTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expected_on"])
            .start_timer();

        let row = sqlx::query_as::<_, ExpectedTransaction>(concat!(
            "SELECT ",
            expected_columns!(),
            r#"
            FROM expected_transactions
            WHERE recurring_transaction_id = $1 AND expected_date = $2 AND deleted_utc IS NULL
            "#
        ))
        .bind(recurring_transaction_id)
        .bind(expected_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get expected: {}", e)))?;

        timer.observe_duration();

        Ok(row)
    }

    #[instrument(skip(self), fields(recurring_transaction_id = %recurring_transaction_id))]
    async fn latest_matched_before(
        &self,
        recurring_transaction_id: Uuid,
        before: NaiveDate,
    ) -> Result<Option<ExpectedTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_matched_before"])
            .start_timer();

        let row = sqlx::query_as::<_, ExpectedTransaction>(concat!(
            "SELECT ",
            expected_columns!(),
            r#"
            FROM expected_transactions
            WHERE recurring_transaction_id = $1
              AND bank_transaction_id IS NOT NULL
              AND deleted_utc IS NULL
              AND COALESCE(settled_date, pending_date) < $2
            ORDER BY COALESCE(settled_date, pending_date) DESC
            LIMIT 1
            "#
        ))
        .bind(recurring_transaction_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get latest match: {}", e)))?;

        timer.observe_duration();

        Ok(row)
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn upsert_expected(
        &self,
        rows: &[NewExpectedTransaction],
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_expected"])
            .start_timer();

        let saved = match self.insert_expected(rows).await {
            Ok(saved) => saved,
            Err(e) if is_insert_race(&e) => {
                warn!(error = %e, "Expected transaction insert raced, retrying");
                self.insert_expected(rows)
                    .await
                    .map_err(|e| map_db_error("Failed to upsert expected transactions", e))?
            }
            Err(e) => return Err(map_db_error("Failed to upsert expected transactions", e)),
        };

        timer.observe_duration();

        Ok(saved)
    }

    #[instrument(skip(self, matched), fields(expected_transaction_id = %id, status = matched.status.as_str()))]
    async fn apply_expected_match(
        &self,
        id: Uuid,
        matched: &ExpectedMatch,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_expected_match"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE expected_transactions
            SET status = $2,
                pending_date = $3,
                pending_amount = $4,
                settled_date = $5,
                settled_amount = $6,
                bank_transaction_id = $7,
                bank_transaction_external_id = $8,
                pending_display_name = COALESCE($9, pending_display_name),
                updated_utc = NOW()
            WHERE id = $1
              AND deleted_utc IS NULL
              AND (
                bank_transaction_id IS NULL
                OR bank_transaction_id = $7
                OR (bank_transaction_external_id IS NOT NULL AND bank_transaction_external_id = $8)
              )
              AND (CASE status WHEN 'PREDICTED' THEN 0 WHEN 'PENDING' THEN 1 ELSE 2 END)
                < (CASE $2 WHEN 'PREDICTED' THEN 0 WHEN 'PENDING' THEN 1 ELSE 2 END)
            "#,
        )
        .bind(id)
        .bind(matched.status)
        .bind(matched.pending_date)
        .bind(matched.pending_amount)
        .bind(matched.settled_date)
        .bind(matched.settled_amount)
        .bind(matched.bank_transaction_id)
        .bind(&matched.bank_transaction_external_id)
        .bind(&matched.pending_display_name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("Failed to apply match", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Expected transaction {} is already resolved or linked elsewhere",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, note), fields(recurring_transaction_id = %recurring_transaction_id))]
    async fn detach_expected(
        &self,
        recurring_transaction_id: Uuid,
        after: NaiveDate,
        note: &str,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["detach_expected"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE expected_transactions
            SET deleted_utc = NOW(),
                status = $4,
                pending_date = NULL,
                pending_amount = NULL,
                bank_transaction_id = NULL,
                bank_transaction_external_id = NULL,
                extra = COALESCE(extra, '{}'::jsonb)
                    || jsonb_build_object('detached', $3::text, 'detached_utc', NOW()),
                updated_utc = NOW()
            WHERE recurring_transaction_id = $1
              AND expected_date > $2
              AND settled_date IS NULL
              AND deleted_utc IS NULL
            "#,
        )
        .bind(recurring_transaction_id)
        .bind(after)
        .bind(note)
        .bind(ExpectedStatus::Predicted)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to detach expected transactions: {}", e)))?;

        timer.observe_duration();
        info!(detached = result.rows_affected(), "Expected transactions detached");

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, kind), fields(kind = kind.as_str()))]
    async fn unresolved_expected(
        &self,
        kind: TransactionType,
        start: NaiveDate,
        end: NaiveDate,
        after_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unresolved_expected"])
            .start_timer();

        let rows = sqlx::query_as::<_, ExpectedTransaction>(concat!(
            "SELECT ",
            expected_columns!(),
            r#"
            FROM expected_transactions
            WHERE expected_date BETWEEN $2 AND $3
              AND pending_date IS NULL
              AND settled_date IS NULL
              AND deleted_utc IS NULL
              AND ($4::uuid IS NULL OR id > $4)
              AND EXISTS (
                SELECT 1 FROM recurring_transactions r
                WHERE r.id = recurring_transaction_id
                  AND r.transaction_type = $1
                  AND r.deleted_utc IS NULL
              )
            ORDER BY id
            LIMIT $5
            "#
        ))
        .bind(kind)
        .bind(start)
        .bind(end)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to page unresolved expected: {}", e)))?;

        timer.observe_duration();

        Ok(rows)
    }
}

#[async_trait]
impl Ledger for Database {
    #[instrument(skip(self, filter), fields(bank_account_id = %bank_account_id, source = options.source.as_str()))]
    async fn query(
        &self,
        bank_account_id: Uuid,
        filter: &LedgerFilter,
        options: QueryOptions,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ledger_query"])
            .start_timer();

        let sql = match options.sort {
            SortOrder::DateAscending => concat!(
                "SELECT ",
                bank_transaction_columns!(),
                r#"
                FROM bank_transactions
                WHERE bank_account_id = $1
                  AND transaction_date BETWEEN $2 AND $3
                  AND (cardinality($4::text[]) = 0
                       OR display_name = ANY($4)
                       OR pending_display_name = ANY($4))
                  AND ($5::numeric IS NULL OR amount >= $5)
                  AND ($6::numeric IS NULL OR amount <= $6)
                  AND (NOT $7 OR pending = FALSE)
                  AND NOT (status = ANY($8))
                ORDER BY transaction_date ASC, id
                "#
            ),
            SortOrder::DateDescending => concat!(
                "SELECT ",
                bank_transaction_columns!(),
                r#"
                FROM bank_transactions
                WHERE bank_account_id = $1
                  AND transaction_date BETWEEN $2 AND $3
                  AND (cardinality($4::text[]) = 0
                       OR display_name = ANY($4)
                       OR pending_display_name = ANY($4))
                  AND ($5::numeric IS NULL OR amount >= $5)
                  AND ($6::numeric IS NULL OR amount <= $6)
                  AND (NOT $7 OR pending = FALSE)
                  AND NOT (status = ANY($8))
                ORDER BY transaction_date DESC, id
                "#
            ),
        };

        let rows = sqlx::query_as::<_, BankTransaction>(sql)
            .bind(bank_account_id)
            .bind(filter.start)
            .bind(filter.end)
            .bind(&filter.display_names)
            .bind(filter.min_amount)
            .bind(filter.max_amount)
            .bind(filter.exclude_pending)
            .bind(&filter.exclude_statuses)
            .fetch_all(self.reader(options.source))
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to query ledger: {}", e)))?;

        timer.observe_duration();

        Ok(rows)
    }
}

#[async_trait]
impl AuditLog for Database {
    #[instrument(skip(self, record), fields(action = record.action()))]
    async fn append(&self, user_id: Uuid, record: &AuditRecord) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["audit_append"])
            .start_timer();

        insert_audit(&self.pool, user_id, record).await?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl ReplicaLagProbe for Database {
    #[instrument(skip(self))]
    async fn replica_lag(&self) -> Result<Option<Duration>, AppError> {
        let Some(replica) = &self.replica else {
            return Ok(None);
        };

        let timer = DB_QUERY_DURATION
            .with_label_values(&["replica_lag"])
            .start_timer();

        let seconds: Option<f64> = sqlx::query_scalar(
            "SELECT EXTRACT(EPOCH FROM (NOW() - pg_last_xact_replay_timestamp()))::float8",
        )
        .fetch_one(replica)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read replica lag: {}", e)))?;

        timer.observe_duration();

        Ok(Some(Duration::from_secs_f64(seconds.unwrap_or(0.0).max(0.0))))
    }
}
