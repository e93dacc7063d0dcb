//! Reconciliation and drift-correction tests.

mod common;

use common::{
    at_noon, bank_txn, date, days, init_tracing, matcher, monthly, recurring, weekly, FakeInference,
    FakeStore,
};
use recurring_service::config::MatchingConfig;
use recurring_service::matching::DriftOutcome;
use recurring_service::models::{ExpectedStatus, RecurringTransaction};
use recurring_service::schedule::SettlementPolicy;
use recurring_service::services::{AuditRecord, DataSource};
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn paycheck(account: Uuid) -> RecurringTransaction {
    recurring(
        account,
        Uuid::new_v4(),
        "ACME PAYROLL",
        dec!(1000),
        weekly("friday", date(2020, 1, 3)),
        at_noon(date(2020, 1, 1)),
    )
}

fn today() -> chrono::DateTime<chrono::Utc> {
    at_noon(date(2020, 6, 17))
}

#[tokio::test]
async fn matches_transaction_inside_settlement_window() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = paycheck(account);
    store.add_recurring(series.clone());
    let txn = bank_txn(account, "ACME PAYROLL", dec!(1000), date(2020, 6, 12));
    store.add_transaction(txn.clone());

    let inference = Arc::new(FakeInference::default());
    let summary = matcher(&store, inference.clone(), MatchingConfig::default())
        .update_by_account(account, DataSource::Replica, today())
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.matched, 1);

    let rows = store.live_expected(series.id);
    let settled = rows.iter().find(|r| r.expected_date == date(2020, 6, 12)).unwrap();
    assert_eq!(settled.status, ExpectedStatus::Settled);
    assert_eq!(settled.settled_date, Some(date(2020, 6, 12)));
    assert_eq!(settled.bank_transaction_id, Some(txn.id));

    let next = rows.iter().find(|r| r.expected_date == date(2020, 6, 19)).unwrap();
    assert_eq!(next.status, ExpectedStatus::Predicted);

    // On-time match, nothing to re-infer.
    assert_eq!(inference.call_count(), 0);
}

#[tokio::test]
async fn ignores_transactions_outside_window_or_below_minimum() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = paycheck(account);
    store.add_recurring(series.clone());
    store.add_transaction(bank_txn(account, "ACME PAYROLL", dec!(1000), date(2020, 6, 16)));
    store.add_transaction(bank_txn(account, "ACME PAYROLL", dec!(5.00), date(2020, 6, 12)));
    store.add_transaction(bank_txn(account, "ACME PAYROLL", dec!(-1000), date(2020, 6, 11)));

    let summary = matcher(&store, Arc::new(FakeInference::default()), MatchingConfig::default())
        .update_by_account(account, DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(summary.matched, 0);
    assert!(store.live_expected(series.id).iter().all(|r| !r.is_linked()));
}

#[tokio::test]
async fn pending_match_settles_when_transaction_posts() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = paycheck(account);
    store.add_recurring(series.clone());

    let mut pending = bank_txn(account, "ACME PAYROLL", dec!(1000), date(2020, 6, 12));
    pending.pending = true;
    pending.status = "PENDING".to_string();
    store.add_transaction(pending.clone());

    let m = matcher(&store, Arc::new(FakeInference::default()), MatchingConfig::default());
    m.update_by_account(account, DataSource::Primary, today())
        .await
        .unwrap();

    let row = store
        .live_expected(series.id)
        .into_iter()
        .find(|r| r.expected_date == date(2020, 6, 12))
        .unwrap();
    assert_eq!(row.status, ExpectedStatus::Pending);
    assert_eq!(row.pending_date, Some(date(2020, 6, 12)));

    // The bank posts it under a new id but the same external id.
    let mut posted = bank_txn(account, "ACME PAYROLL", dec!(1000), date(2020, 6, 12));
    posted.external_id = pending.external_id.clone();
    {
        let mut state = store.state.lock().unwrap();
        state.transactions.retain(|t| t.id != pending.id);
        state.transactions.push(posted.clone());
    }

    let summary = m
        .update_by_account(account, DataSource::Primary, today() + days(1))
        .await
        .unwrap();
    assert_eq!(summary.matched, 1);

    let row = store
        .live_expected(series.id)
        .into_iter()
        .find(|r| r.expected_date == date(2020, 6, 12))
        .unwrap();
    assert_eq!(row.status, ExpectedStatus::Settled);
    assert_eq!(row.settled_date, Some(date(2020, 6, 12)));
    assert_eq!(row.pending_date, Some(date(2020, 6, 12)));
    assert_eq!(row.bank_transaction_id, Some(posted.id));
}

#[tokio::test]
async fn linked_transaction_is_never_reused() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = paycheck(account);
    store.add_recurring(series.clone());
    store.add_transaction(bank_txn(account, "ACME PAYROLL", dec!(1000), date(2020, 6, 12)));

    let m = matcher(&store, Arc::new(FakeInference::default()), MatchingConfig::default());
    m.update_by_account(account, DataSource::Primary, today())
        .await
        .unwrap();
    let again = m
        .update_by_account(account, DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(again.matched, 0);
    let linked: Vec<_> = store
        .live_expected(series.id)
        .into_iter()
        .filter(|r| r.is_linked())
        .collect();
    assert_eq!(linked.len(), 1);
}

#[tokio::test]
async fn recent_match_clears_missed() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let mut series = paycheck(account);
    series.missed = Some(today() - days(20));
    store.add_recurring(series.clone());
    store.add_transaction(bank_txn(account, "ACME PAYROLL", dec!(1000), date(2020, 6, 12)));

    let outcome = matcher(&store, Arc::new(FakeInference::default()), MatchingConfig::default())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert!(outcome.missed_cleared);
    assert!(store.recurring_by_id(series.id).missed.is_none());
}

#[tokio::test]
async fn posted_rename_is_propagated() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = paycheck(account);
    store.add_recurring(series.clone());

    let mut txn = bank_txn(account, "ACME CORP PAYROLL", dec!(1000), date(2020, 6, 12));
    txn.pending_display_name = Some("ACME PAYROLL".to_string());
    store.add_transaction(txn);

    matcher(&store, Arc::new(FakeInference::default()), MatchingConfig::default())
        .update_by_account(account, DataSource::Primary, today())
        .await
        .unwrap();

    let updated = store.recurring_by_id(series.id);
    assert_eq!(updated.transaction_display_name, "ACME CORP PAYROLL");
    assert_eq!(updated.possible_name_change.as_deref(), Some("ACME PAYROLL"));
    assert_eq!(updated.pending_display_name.as_deref(), Some("ACME PAYROLL"));
}

#[tokio::test]
async fn rename_collision_keeps_match_and_old_name() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = paycheck(account);
    store.add_recurring(series.clone());
    let mut other = paycheck(account);
    other.transaction_display_name = "ACME CORP PAYROLL".to_string();
    other.schedule = weekly("monday", date(2020, 1, 6));
    store.add_recurring(other);

    let mut txn = bank_txn(account, "ACME CORP PAYROLL", dec!(1000), date(2020, 6, 12));
    txn.pending_display_name = Some("ACME PAYROLL".to_string());
    store.add_transaction(txn);

    let outcome = matcher(&store, Arc::new(FakeInference::default()), MatchingConfig::default())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.matched, 1);
    assert_eq!(
        store.recurring_by_id(series.id).transaction_display_name,
        "ACME PAYROLL"
    );
}

fn drifting_fixture(store: &FakeStore, account: Uuid) -> RecurringTransaction {
    let mut series = recurring(
        account,
        Uuid::new_v4(),
        "GLOBEX SALARY",
        dec!(2500),
        monthly(1, date(2020, 1, 1)),
        at_noon(date(2020, 1, 1)),
    );
    series.missed = Some(at_noon(date(2020, 5, 20)));
    store.add_recurring(series.clone());
    store.seed_expected(&series, date(2020, 5, 1), None);
    store.seed_expected(&series, date(2020, 6, 1), None);
    // Paid a week after the predicted day, every month.
    store.add_transaction(bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 5, 8)));
    store.add_transaction(bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 6, 8)));
    series
}

fn drift_config() -> MatchingConfig {
    MatchingConfig {
        look_forward_days: 20,
        settlement: SettlementPolicy {
            early_banking_days: 2,
            grace_days: 8,
        },
        ..MatchingConfig::default()
    }
}

#[tokio::test]
async fn confident_drift_replaces_schedule_and_detaches_future_rows() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = drifting_fixture(&store, account);
    let inferred = monthly(8, date(2020, 6, 8));
    let inference = FakeInference::answering(inferred.clone(), 0.9);

    let outcome = matcher(&store, inference.clone(), drift_config())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.matched, 2);
    assert_eq!(outcome.drift, Some(DriftOutcome::Corrected { detached: 1 }));
    assert_eq!(
        inference.calls.lock().unwrap()[0],
        vec![date(2020, 5, 8), date(2020, 6, 8)]
    );

    let updated = store.recurring_by_id(series.id);
    assert_eq!(updated.schedule, inferred);
    assert!(updated.missed.is_none(), "missed clear rides along with the schedule write");

    let july = store
        .all_expected(series.id)
        .into_iter()
        .find(|r| r.expected_date == date(2020, 7, 1))
        .unwrap();
    assert!(july.deleted_utc.is_some());
    assert!(july.extra.is_some());

    let settled = store.live_expected(series.id);
    assert_eq!(settled.len(), 2);
    assert!(settled.iter().all(|r| r.status == ExpectedStatus::Settled));

    let audit = store.audit_records();
    assert_eq!(audit.len(), 1);
    assert!(matches!(
        &audit[0],
        AuditRecord::ScheduleChanged { recurring_transaction_id, detached: 1, .. }
            if *recurring_transaction_id == series.id
    ));
}

#[tokio::test]
async fn low_confidence_drift_keeps_schedule() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = drifting_fixture(&store, account);
    let inference = FakeInference::answering(monthly(8, date(2020, 6, 8)), 0.5);

    let outcome = matcher(&store, inference, drift_config())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.drift, Some(DriftOutcome::LowConfidence { confidence: 0.5 }));
    assert_eq!(store.recurring_by_id(series.id).schedule, series.schedule);
    assert!(store
        .live_expected(series.id)
        .iter()
        .any(|r| r.expected_date == date(2020, 7, 1)));
    assert!(store.audit_records().is_empty());
    // The missed flag is still cleared without a schedule change.
    assert!(store.recurring_by_id(series.id).missed.is_none());
}

#[tokio::test]
async fn unchanged_inference_is_a_no_op() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = drifting_fixture(&store, account);
    // Same interval, different anchor: identical schedule.
    let inference = FakeInference::answering(monthly(1, date(2020, 5, 1)), 0.95);

    let outcome = matcher(&store, inference, drift_config())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.drift, Some(DriftOutcome::Unchanged));
    assert_eq!(store.live_expected(series.id).len(), 3);
    assert!(store.audit_records().is_empty());
}

#[tokio::test]
async fn failed_inference_still_clears_missed() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let mut series = recurring(
        account,
        Uuid::new_v4(),
        "GLOBEX SALARY",
        dec!(2500),
        monthly(1, date(2020, 1, 1)),
        at_noon(date(2020, 1, 1)),
    );
    series.missed = Some(at_noon(date(2020, 5, 20)));
    store.add_recurring(series.clone());
    store.seed_expected(&series, date(2020, 5, 1), None);
    store.seed_expected(&series, date(2020, 6, 1), None);
    store.add_transaction(bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 5, 4)));
    store.add_transaction(bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 6, 3)));
    let inference = FakeInference::unavailable();

    let outcome = matcher(&store, inference.clone(), MatchingConfig::default())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.matched, 2);
    assert!(outcome.missed_cleared);
    assert_eq!(outcome.drift, Some(DriftOutcome::Failed));
    assert_eq!(inference.calls.lock().unwrap().len(), 1);

    let updated = store.recurring_by_id(series.id);
    assert!(updated.missed.is_none());
    assert_eq!(updated.schedule, series.schedule);
    assert_eq!(store.live_expected(series.id).len(), 2);
    assert!(store.audit_records().is_empty());
}

#[tokio::test]
async fn schedule_change_survives_audit_outage() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = drifting_fixture(&store, account);
    let inferred = monthly(8, date(2020, 6, 8));
    store.fail_audit(true);

    let outcome = matcher(&store, FakeInference::answering(inferred.clone(), 0.9), drift_config())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.drift, Some(DriftOutcome::Corrected { detached: 1 }));
    let updated = store.recurring_by_id(series.id);
    assert_eq!(updated.schedule, inferred);
    assert!(updated.missed.is_none());
    assert!(store.audit_records().is_empty());
}

#[tokio::test]
async fn consistently_late_settlements_shift_schedule_under_default_grace() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = recurring(
        account,
        Uuid::new_v4(),
        "GLOBEX SALARY",
        dec!(2500),
        monthly(1, date(2020, 1, 1)),
        at_noon(date(2020, 1, 1)),
    );
    store.add_recurring(series.clone());

    // May and June already settled a week late.
    let may = bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 5, 8));
    let june = bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 6, 8));
    store.add_transaction(may.clone());
    store.add_transaction(june.clone());
    store.seed_expected(&series, date(2020, 5, 1), Some(&may));
    store.seed_expected(&series, date(2020, 6, 1), Some(&june));

    // July was caught pending on time and posts a week late.
    let mut july_pending = bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 7, 2));
    july_pending.pending = true;
    july_pending.status = "PENDING".to_string();
    store.seed_expected(&series, date(2020, 7, 1), Some(&july_pending));
    let mut july = bank_txn(account, "GLOBEX SALARY", dec!(2500), date(2020, 7, 8));
    july.external_id = july_pending.external_id.clone();
    store.add_transaction(july.clone());

    let august = store.seed_expected(&series, date(2020, 7, 31), None);

    let inferred = monthly(8, date(2020, 7, 8));
    let inference = FakeInference::answering(inferred.clone(), 0.9);
    let outcome = matcher(&store, inference.clone(), MatchingConfig::default())
        .update_recurring(series.clone(), DataSource::Primary, at_noon(date(2020, 7, 17)))
        .await
        .unwrap();

    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.drift, Some(DriftOutcome::Corrected { detached: 1 }));
    assert_eq!(
        inference.calls.lock().unwrap()[0],
        vec![date(2020, 5, 8), date(2020, 6, 8), date(2020, 7, 8)]
    );
    assert_eq!(store.recurring_by_id(series.id).schedule, inferred);

    let detached = store
        .all_expected(series.id)
        .into_iter()
        .find(|r| r.id == august.id)
        .unwrap();
    assert!(detached.deleted_utc.is_some());
    assert!(detached.extra.is_some());

    let live = store.live_expected(series.id);
    assert_eq!(live.len(), 3);
    assert!(live
        .iter()
        .all(|r| r.status == ExpectedStatus::Settled && r.is_linked()));
    let settled_july = live
        .iter()
        .find(|r| r.expected_date == date(2020, 7, 1))
        .unwrap();
    assert_eq!(settled_july.bank_transaction_id, Some(july.id));
    assert_eq!(settled_july.settled_date, Some(date(2020, 7, 8)));

    assert!(matches!(
        store.audit_records().as_slice(),
        [AuditRecord::ScheduleChanged { detached: 1, .. }]
    ));
}

#[tokio::test]
async fn early_match_ahead_of_today_counts_toward_drift() {
    init_tracing();
    let store = FakeStore::new();
    let account = Uuid::new_v4();
    let series = recurring(
        account,
        Uuid::new_v4(),
        "INITECH PAYROLL",
        dec!(1800),
        monthly(19, date(2020, 1, 19)),
        at_noon(date(2020, 1, 1)),
    );
    store.add_recurring(series.clone());
    let may = bank_txn(account, "INITECH PAYROLL", dec!(1800), date(2020, 5, 18));
    store.add_transaction(may.clone());
    store.seed_expected(&series, date(2020, 5, 19), Some(&may));
    store.seed_expected(&series, date(2020, 6, 19), None);
    // Paid today, two banking days before it was due.
    store.add_transaction(bank_txn(account, "INITECH PAYROLL", dec!(1800), date(2020, 6, 17)));
    let inference = Arc::new(FakeInference::default());

    let outcome = matcher(&store, inference.clone(), MatchingConfig::default())
        .update_recurring(series.clone(), DataSource::Primary, today())
        .await
        .unwrap();

    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.drift, Some(DriftOutcome::NoSchedule));
    assert_eq!(
        *inference.calls.lock().unwrap(),
        vec![vec![date(2020, 5, 18), date(2020, 6, 17)]]
    );
}
