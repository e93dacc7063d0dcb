//! Common test utilities for recurring-service integration tests.
//!
//! In-memory stand-ins for the database, ledger and collaborator services,
//! mirroring the SQL semantics closely enough for the matching flows.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use recurring_service::config::{MatchingConfig, SweepConfig};
use recurring_service::matching::{AccountTransitionMatcher, Matcher, MissedSweep};
use recurring_service::models::{
    BankTransaction, ExpectedMatch, ExpectedStatus, ExpectedTransaction, LedgerFilter,
    NewExpectedTransaction, NewRecurringTransaction, RecurringStatus, RecurringTransaction,
    RecurringUpdate, SortOrder, TransactionType,
};
use recurring_service::schedule::{IntervalKind, RollDirection, Schedule};
use recurring_service::services::{
    AuditLog, AuditRecord, DataSource, ExperimentGate, InferredSchedule, Ledger, Notification,
    Notifier, QueryOptions, ReplicaLagProbe, Repository, ScheduleInference,
};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,recurring_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at_noon(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap())
}

pub fn monthly(day: u32, anchor: NaiveDate) -> Schedule {
    Schedule::new(
        IntervalKind::Monthly,
        &[day.to_string()],
        RollDirection::Backward,
        anchor,
    )
    .unwrap()
}

pub fn weekly(weekday: &str, anchor: NaiveDate) -> Schedule {
    Schedule::new(IntervalKind::Weekly, &[weekday], RollDirection::Backward, anchor).unwrap()
}

pub fn recurring(
    bank_account_id: Uuid,
    user_id: Uuid,
    name: &str,
    amount: Decimal,
    schedule: Schedule,
    created_utc: DateTime<Utc>,
) -> RecurringTransaction {
    RecurringTransaction {
        id: Uuid::new_v4(),
        bank_account_id,
        user_id,
        transaction_display_name: name.to_string(),
        pending_display_name: None,
        user_display_name: None,
        user_amount: amount,
        transaction_type: if amount > Decimal::ZERO {
            TransactionType::Income
        } else {
            TransactionType::Expense
        },
        status: RecurringStatus::Valid,
        schedule,
        missed: None,
        possible_name_change: None,
        created_utc,
        deleted_utc: None,
    }
}

pub fn bank_txn(
    bank_account_id: Uuid,
    name: &str,
    amount: Decimal,
    transaction_date: NaiveDate,
) -> BankTransaction {
    BankTransaction {
        id: Uuid::new_v4(),
        external_id: Some(Uuid::new_v4().to_string()),
        bank_account_id,
        amount,
        transaction_date,
        display_name: name.to_string(),
        pending_display_name: None,
        pending: false,
        status: "POSTED".to_string(),
    }
}

fn to_expected(new: &NewExpectedTransaction) -> ExpectedTransaction {
    ExpectedTransaction {
        id: Uuid::new_v4(),
        recurring_transaction_id: new.recurring_transaction_id,
        bank_account_id: new.bank_account_id,
        user_id: new.user_id,
        expected_date: new.expected_date,
        expected_amount: new.expected_amount,
        status: ExpectedStatus::Predicted,
        pending_date: None,
        pending_amount: None,
        settled_date: None,
        settled_amount: None,
        bank_transaction_id: None,
        bank_transaction_external_id: None,
        display_name: new.display_name.clone(),
        pending_display_name: new.pending_display_name.clone(),
        extra: None,
        deleted_utc: None,
    }
}

#[derive(Default, Clone)]
pub struct StoreState {
    pub recurring: Vec<RecurringTransaction>,
    pub expected: Vec<ExpectedTransaction>,
    pub transactions: Vec<BankTransaction>,
    /// bank account -> main paycheck recurring transaction
    pub main_paychecks: HashMap<Uuid, Uuid>,
    /// (from account, to account)
    pub transitions: Vec<(Uuid, Uuid)>,
    pub alerts: HashSet<(Uuid, DateTime<Utc>)>,
    pub audit: Vec<(Uuid, AuditRecord)>,
    pub replica_lag: Option<std::time::Duration>,
    /// Audit writes fail while set.
    pub fail_audit: bool,
}

/// Database, ledger, audit log and replica probe in one.
#[derive(Default)]
pub struct FakeStore {
    pub state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_recurring(&self, recurring: RecurringTransaction) {
        self.state.lock().unwrap().recurring.push(recurring);
    }

    pub fn add_transaction(&self, txn: BankTransaction) {
        self.state.lock().unwrap().transactions.push(txn);
    }

    pub fn add_expected(&self, expected: ExpectedTransaction) {
        self.state.lock().unwrap().expected.push(expected);
    }

    /// Seed a prediction row, optionally already settled by `txn`.
    pub fn seed_expected(
        &self,
        recurring: &RecurringTransaction,
        expected_date: NaiveDate,
        settled_by: Option<&BankTransaction>,
    ) -> ExpectedTransaction {
        let mut row = to_expected(&NewExpectedTransaction::for_date(recurring, expected_date));
        if let Some(txn) = settled_by {
            ExpectedMatch::from_transaction(&row, txn).apply_to(&mut row);
        }
        self.add_expected(row.clone());
        row
    }

    pub fn set_main_paycheck(&self, bank_account_id: Uuid, recurring_transaction_id: Uuid) {
        self.state
            .lock()
            .unwrap()
            .main_paychecks
            .insert(bank_account_id, recurring_transaction_id);
    }

    pub fn add_transition(&self, from: Uuid, to: Uuid) {
        self.state.lock().unwrap().transitions.push((from, to));
    }

    pub fn fail_audit(&self, fail: bool) {
        self.state.lock().unwrap().fail_audit = fail;
    }

    pub fn set_replica_lag(&self, lag: Option<std::time::Duration>) {
        self.state.lock().unwrap().replica_lag = lag;
    }

    pub fn recurring_by_id(&self, id: Uuid) -> RecurringTransaction {
        self.state
            .lock()
            .unwrap()
            .recurring
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .unwrap()
    }

    pub fn live_recurring_on(&self, bank_account_id: Uuid) -> Vec<RecurringTransaction> {
        self.state
            .lock()
            .unwrap()
            .recurring
            .iter()
            .filter(|r| r.bank_account_id == bank_account_id && !r.is_deleted())
            .cloned()
            .collect()
    }

    /// Every expectation of a series, deleted ones included, oldest first.
    pub fn all_expected(&self, recurring_transaction_id: Uuid) -> Vec<ExpectedTransaction> {
        let mut rows: Vec<ExpectedTransaction> = self
            .state
            .lock()
            .unwrap()
            .expected
            .iter()
            .filter(|e| e.recurring_transaction_id == recurring_transaction_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.expected_date);
        rows
    }

    pub fn live_expected(&self, recurring_transaction_id: Uuid) -> Vec<ExpectedTransaction> {
        self.all_expected(recurring_transaction_id)
            .into_iter()
            .filter(|e| e.deleted_utc.is_none())
            .collect()
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.state
            .lock()
            .unwrap()
            .audit
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn name_taken(state: &StoreState, id: Option<Uuid>, account: Uuid, kind: TransactionType, name: &str) -> bool {
        state.recurring.iter().any(|r| {
            Some(r.id) != id
                && !r.is_deleted()
                && r.bank_account_id == account
                && r.transaction_type == kind
                && r.transaction_display_name == name
        })
    }
}

#[async_trait]
impl Repository for FakeStore {
    async fn get_recurring(
        &self,
        id: Uuid,
        _source: DataSource,
    ) -> Result<Option<RecurringTransaction>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state.recurring.iter().find(|r| r.id == id).cloned())
    }

    async fn matchable_recurring_by_account(
        &self,
        bank_account_id: Uuid,
        _source: DataSource,
    ) -> Result<Vec<RecurringTransaction>, AppError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<RecurringTransaction> = state
            .recurring
            .iter()
            .filter(|r| r.bank_account_id == bank_account_id && r.is_matchable())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_utc);
        Ok(rows)
    }

    async fn valid_incomes_by_account(
        &self,
        bank_account_id: Uuid,
    ) -> Result<Vec<RecurringTransaction>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .recurring
            .iter()
            .filter(|r| {
                r.bank_account_id == bank_account_id
                    && !r.is_deleted()
                    && r.is_income()
                    && r.status == RecurringStatus::Valid
            })
            .cloned()
            .collect())
    }

    async fn count_incomes_including_deleted(&self, bank_account_id: Uuid) -> Result<i64, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .recurring
            .iter()
            .filter(|r| r.bank_account_id == bank_account_id && r.is_income())
            .count() as i64)
    }

    async fn update_recurring(&self, id: Uuid, update: &RecurringUpdate) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let Some(current) = state
            .recurring
            .iter()
            .find(|r| r.id == id && !r.is_deleted())
            .cloned()
        else {
            return Err(AppError::NotFound(anyhow::anyhow!("recurring {} not found", id)));
        };
        if let Some(name) = &update.transaction_display_name {
            if Self::name_taken(&state, Some(id), current.bank_account_id, current.transaction_type, name) {
                return Err(AppError::Conflict(anyhow::anyhow!("display name taken")));
            }
        }
        if let Some(row) = state.recurring.iter_mut().find(|r| r.id == id) {
            update.apply_to(row);
        }
        Ok(())
    }

    async fn mark_missed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.state.lock().unwrap();
        match state
            .recurring
            .iter_mut()
            .find(|r| r.id == id && !r.is_deleted() && r.missed.is_none())
        {
            Some(row) => {
                row.missed = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition_recurring(
        &self,
        original: &RecurringTransaction,
        clone: &NewRecurringTransaction,
        moves: &[(Uuid, ExpectedMatch)],
    ) -> Result<RecurringTransaction, AppError> {
        clone.validate()?;
        let mut state = self.state.lock().unwrap();
        // Work on a copy and commit only on success, like a rolled-back transaction.
        let mut draft = state.clone();

        if Self::name_taken(
            &draft,
            None,
            clone.bank_account_id,
            clone.transaction_type,
            &clone.transaction_display_name,
        ) {
            return Err(AppError::Conflict(anyhow::anyhow!("display name taken")));
        }
        let moved = RecurringTransaction {
            id: Uuid::new_v4(),
            bank_account_id: clone.bank_account_id,
            user_id: clone.user_id,
            transaction_display_name: clone.transaction_display_name.clone(),
            pending_display_name: clone.pending_display_name.clone(),
            user_display_name: clone.user_display_name.clone(),
            user_amount: clone.user_amount,
            transaction_type: clone.transaction_type,
            status: clone.status,
            schedule: clone.schedule.clone(),
            missed: None,
            possible_name_change: None,
            created_utc: Utc::now(),
            deleted_utc: None,
        };
        draft.recurring.push(moved.clone());

        for (expected_id, matched) in moves {
            let row = draft.expected.iter_mut().find(|e| {
                e.id == *expected_id
                    && e.recurring_transaction_id == original.id
                    && e.deleted_utc.is_none()
                    && e.bank_transaction_id.is_none()
                    && e.status == ExpectedStatus::Predicted
            });
            let Some(row) = row else {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "expected {} is no longer an open prediction",
                    expected_id
                )));
            };
            row.recurring_transaction_id = moved.id;
            row.bank_account_id = moved.bank_account_id;
            let keep_pending_name = row.pending_display_name.clone();
            matched.apply_to(row);
            if row.pending_display_name.is_none() {
                row.pending_display_name = keep_pending_name;
            }
        }

        match draft
            .recurring
            .iter_mut()
            .find(|r| r.id == original.id && !r.is_deleted())
        {
            Some(row) => row.deleted_utc = Some(Utc::now()),
            None => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "recurring {} already removed",
                    original.id
                )))
            }
        }

        if draft.fail_audit {
            return Err(AppError::DatabaseError(anyhow::anyhow!("audit log unavailable")));
        }
        draft.audit.push((
            original.user_id,
            AuditRecord::account_transition(original, &moved, moves.len()),
        ));

        *state = draft;
        Ok(moved)
    }

    async fn main_paycheck_id(&self, bank_account_id: Uuid) -> Result<Option<Uuid>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .main_paychecks
            .get(&bank_account_id)
            .copied())
    }

    async fn main_paychecks_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecurringTransaction>, AppError> {
        let state = self.state.lock().unwrap();
        let ids: HashSet<Uuid> = state.main_paychecks.values().copied().collect();
        Ok(state
            .recurring
            .iter()
            .filter(|r| r.user_id == user_id && !r.is_deleted() && ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn transition_sources(&self, bank_account_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transitions
            .iter()
            .filter(|(_, to)| *to == bank_account_id)
            .map(|(from, _)| *from)
            .collect())
    }

    async fn record_missed_alert(
        &self,
        recurring_transaction_id: Uuid,
        missed: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .alerts
            .insert((recurring_transaction_id, missed)))
    }

    async fn expected_in_range(
        &self,
        recurring_transaction_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        _source: DataSource,
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        Ok(self
            .live_expected(recurring_transaction_id)
            .into_iter()
            .filter(|e| e.expected_date >= start && e.expected_date <= end)
            .collect())
    }

    async fn latest_expected(
        &self,
        recurring_transaction_id: Uuid,
        _source: DataSource,
    ) -> Result<Option<ExpectedTransaction>, AppError> {
        Ok(self.live_expected(recurring_transaction_id).into_iter().last())
    }

    async fn expected_on(
        &self,
        recurring_transaction_id: Uuid,
        expected_date: NaiveDate,
    ) -> Result<Option<ExpectedTransaction>, AppError> {
        Ok(self
            .live_expected(recurring_transaction_id)
            .into_iter()
            .find(|e| e.expected_date == expected_date))
    }

    async fn latest_matched_before(
        &self,
        recurring_transaction_id: Uuid,
        before: NaiveDate,
    ) -> Result<Option<ExpectedTransaction>, AppError> {
        Ok(self
            .live_expected(recurring_transaction_id)
            .into_iter()
            .filter(|e| e.is_linked() && e.observed_date().is_some_and(|d| d < before))
            .max_by_key(|e| e.observed_date()))
    }

    async fn upsert_expected(
        &self,
        rows: &[NewExpectedTransaction],
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut saved = Vec::new();
        for new in rows {
            let existing = state.expected.iter_mut().find(|e| {
                e.recurring_transaction_id == new.recurring_transaction_id
                    && e.expected_date == new.expected_date
            });
            match existing {
                Some(row) => {
                    row.deleted_utc = None;
                    saved.push(row.clone());
                }
                None => {
                    let row = to_expected(new);
                    state.expected.push(row.clone());
                    saved.push(row);
                }
            }
        }
        Ok(saved)
    }

    async fn apply_expected_match(&self, id: Uuid, matched: &ExpectedMatch) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let Some(current) = state
            .expected
            .iter()
            .find(|e| e.id == id && e.deleted_utc.is_none())
            .cloned()
        else {
            return Err(AppError::Conflict(anyhow::anyhow!("expected {} not found", id)));
        };

        let same_link = current.bank_transaction_id.is_none()
            || current.bank_transaction_id == Some(matched.bank_transaction_id)
            || (current.bank_transaction_external_id.is_some()
                && current.bank_transaction_external_id == matched.bank_transaction_external_id);
        if !same_link || !current.status.can_advance_to(matched.status) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "expected {} already resolved or linked elsewhere",
                id
            )));
        }

        let linked_elsewhere = state.expected.iter().any(|e| {
            e.id != id
                && e.deleted_utc.is_none()
                && e.recurring_transaction_id == current.recurring_transaction_id
                && e.bank_transaction_id == Some(matched.bank_transaction_id)
        });
        if linked_elsewhere {
            return Err(AppError::Conflict(anyhow::anyhow!("transaction already linked")));
        }

        if let Some(row) = state.expected.iter_mut().find(|e| e.id == id) {
            let keep_pending_name = row.pending_display_name.clone();
            matched.apply_to(row);
            if row.pending_display_name.is_none() {
                row.pending_display_name = keep_pending_name;
            }
        }
        Ok(())
    }

    async fn detach_expected(
        &self,
        recurring_transaction_id: Uuid,
        after: NaiveDate,
        note: &str,
    ) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut detached = 0;
        for row in state.expected.iter_mut().filter(|e| {
            e.recurring_transaction_id == recurring_transaction_id
                && e.expected_date > after
                && e.settled_date.is_none()
                && e.deleted_utc.is_none()
        }) {
            row.deleted_utc = Some(Utc::now());
            row.status = ExpectedStatus::Predicted;
            row.pending_date = None;
            row.pending_amount = None;
            row.bank_transaction_id = None;
            row.bank_transaction_external_id = None;
            row.extra = Some(serde_json::json!({ "detached": note }));
            detached += 1;
        }
        Ok(detached)
    }

    async fn unresolved_expected(
        &self,
        kind: TransactionType,
        start: NaiveDate,
        end: NaiveDate,
        after_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        let state = self.state.lock().unwrap();
        let live_of_kind: HashSet<Uuid> = state
            .recurring
            .iter()
            .filter(|r| r.transaction_type == kind && !r.is_deleted())
            .map(|r| r.id)
            .collect();
        let mut rows: Vec<ExpectedTransaction> = state
            .expected
            .iter()
            .filter(|e| {
                e.deleted_utc.is_none()
                    && e.pending_date.is_none()
                    && e.settled_date.is_none()
                    && e.expected_date >= start
                    && e.expected_date <= end
                    && live_of_kind.contains(&e.recurring_transaction_id)
                    && after_id.map_or(true, |after| e.id > after)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[async_trait]
impl Ledger for FakeStore {
    async fn query(
        &self,
        bank_account_id: Uuid,
        filter: &LedgerFilter,
        options: QueryOptions,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<BankTransaction> = state
            .transactions
            .iter()
            .filter(|t| t.bank_account_id == bank_account_id && filter.matches(t))
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.transaction_date, t.id));
        if options.sort == SortOrder::DateDescending {
            rows.reverse();
        }
        Ok(rows)
    }
}

#[async_trait]
impl AuditLog for FakeStore {
    async fn append(&self, user_id: Uuid, record: &AuditRecord) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_audit {
            return Err(AppError::DatabaseError(anyhow::anyhow!("audit log unavailable")));
        }
        state.audit.push((user_id, record.clone()));
        Ok(())
    }
}

#[async_trait]
impl ReplicaLagProbe for FakeStore {
    async fn replica_lag(&self) -> Result<Option<std::time::Duration>, AppError> {
        Ok(self.state.lock().unwrap().replica_lag)
    }
}

/// Inference that returns a canned answer and records what it was asked.
#[derive(Default)]
pub struct FakeInference {
    pub answer: Mutex<Option<InferredSchedule>>,
    pub calls: Mutex<Vec<Vec<NaiveDate>>>,
    pub unavailable: bool,
}

impl FakeInference {
    pub fn answering(schedule: Schedule, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Some(InferredSchedule {
                schedule,
                confidence,
            })),
            calls: Mutex::new(Vec::new()),
            unavailable: false,
        })
    }

    /// Every call fails as if the service were down.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            unavailable: true,
            ..Self::default()
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ScheduleInference for FakeInference {
    async fn infer(&self, dates: &[NaiveDate]) -> Result<Option<InferredSchedule>, AppError> {
        self.calls.lock().unwrap().push(dates.to_vec());
        if self.unavailable {
            return Err(AppError::BadGateway("schedule inference unreachable".to_string()));
        }
        Ok(self.answer.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.name() == name)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn matcher(
    store: &Arc<FakeStore>,
    inference: Arc<FakeInference>,
    config: MatchingConfig,
) -> Matcher {
    Matcher::new(store.clone(), store.clone(), inference, store.clone(), config)
}

pub fn sweep(store: &Arc<FakeStore>, notifier: &Arc<RecordingNotifier>) -> MissedSweep {
    MissedSweep::new(
        store.clone(),
        store.clone(),
        notifier.clone(),
        MatchingConfig::default(),
        SweepConfig::default(),
    )
}

pub fn transition(store: &Arc<FakeStore>, treatment_percent: u8) -> AccountTransitionMatcher {
    AccountTransitionMatcher::new(
        store.clone(),
        store.clone(),
        Arc::new(ExperimentGate::new("account-transition", treatment_percent, 6, 3600)),
        MatchingConfig::default(),
    )
}

pub fn days(n: i64) -> Duration {
    Duration::days(n)
}
