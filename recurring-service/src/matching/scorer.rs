//! Candidate ranking: name similarity and amount closeness, sharing one
//! score -> filter -> sort combinator.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::{BankTransaction, RecurringTransaction};

/// Generic banking tokens that say nothing about who paid.
const STOPLIST: &[&str] = &[
    "ach",
    "dep",
    "deposit",
    "payroll",
    "pmnt",
    "pmt",
    "ref",
    "credit",
    "for",
    "electronic",
    "ppd",
    "from",
    "direct",
    "co",
    "id",
];

/// Lowercased tokens split on punctuation and whitespace, stoplist removed.
pub fn tokenize(name: &str) -> Vec<String> {
    let mut tokens: Vec<String> = name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPLIST.contains(&t.as_str()))
        .collect();
    tokens.dedup();
    tokens
}

/// Share of overlapping tokens, measured against whichever side is shorter.
/// Zero means no meaningful overlap.
pub fn name_score(expected: &str, candidate: &str) -> f64 {
    let expected_tokens = tokenize(expected);
    let candidate_tokens = tokenize(candidate);
    if expected_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }

    let matched = expected_tokens
        .iter()
        .filter(|t| candidate_tokens.contains(t))
        .count() as f64;

    (matched / expected_tokens.len() as f64).max(matched / candidate_tokens.len() as f64)
}

/// Thresholds for amount matching.
#[derive(Debug, Clone, Copy)]
pub struct AmountPolicy {
    pub min_reference: Decimal,
    pub variance: Decimal,
}

/// `1 - |candidate - reference| / reference`, or `None` when the candidate
/// deviates by more than the allowed variance or the reference is too small.
pub fn amount_score(candidate: Decimal, reference: Decimal, policy: &AmountPolicy) -> Option<Decimal> {
    let reference = reference.abs();
    if reference.is_zero() || reference < policy.min_reference {
        return None;
    }
    let deviation = (candidate.abs() - reference).abs() / reference;
    if deviation > policy.variance {
        return None;
    }
    Some(Decimal::ONE - deviation)
}

fn date_distance(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

/// Score every candidate, drop the disqualified, then order by score
/// descending and distance from `expected_date` ascending. Equal entries keep
/// their input order.
pub fn rank<'a, T, S, D, F>(
    candidates: &'a [T],
    expected_date: NaiveDate,
    date_of: D,
    score: F,
) -> Vec<(&'a T, S)>
where
    S: PartialOrd + Copy,
    D: Fn(&T) -> NaiveDate,
    F: Fn(&T) -> Option<S>,
{
    let mut scored: Vec<(&T, S)> = candidates
        .iter()
        .filter_map(|c| score(c).map(|s| (c, s)))
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa).unwrap_or(Ordering::Equal).then_with(|| {
            date_distance(date_of(*a), expected_date)
                .cmp(&date_distance(date_of(*b), expected_date))
        })
    });
    scored
}

/// Best candidate by name similarity to `expected_name`.
pub fn best_by_name<'a>(
    expected_name: &str,
    candidates: &'a [BankTransaction],
    expected_date: NaiveDate,
) -> Option<&'a BankTransaction> {
    rank(
        candidates,
        expected_date,
        |t| t.transaction_date,
        |t| {
            let mut score = name_score(expected_name, &t.display_name);
            if let Some(pending) = &t.pending_display_name {
                score = score.max(name_score(expected_name, pending));
            }
            (score > 0.0).then_some(score)
        },
    )
    .into_iter()
    .next()
    .map(|(t, _)| t)
}

/// Best candidate by amount closeness to `reference`.
pub fn best_by_amount<'a>(
    reference: Decimal,
    candidates: &'a [BankTransaction],
    expected_date: NaiveDate,
    policy: &AmountPolicy,
) -> Option<&'a BankTransaction> {
    rank(
        candidates,
        expected_date,
        |t| t.transaction_date,
        |t| amount_score(t.amount, reference, policy),
    )
    .into_iter()
    .next()
    .map(|(t, _)| t)
}

/// Right sign for the series, and for income at least `min_income_amount`.
pub fn is_eligible(
    txn: &BankTransaction,
    recurring: &RecurringTransaction,
    min_income_amount: Decimal,
) -> bool {
    recurring.transaction_type.accepts(txn.amount)
        && (!recurring.is_income() || txn.amount >= min_income_amount)
}

/// Keep at most one candidate per date, the one closest to the series
/// amount. Wrong-sign amounts and income under `min_income_amount` are
/// dropped first. Output is ordered by date.
pub fn dedupe_candidates(
    candidates: Vec<BankTransaction>,
    recurring: &RecurringTransaction,
    min_income_amount: Decimal,
) -> Vec<BankTransaction> {
    let mut by_date: BTreeMap<NaiveDate, BankTransaction> = BTreeMap::new();

    for txn in candidates {
        if !is_eligible(&txn, recurring, min_income_amount) {
            continue;
        }

        let distance = (txn.amount - recurring.user_amount).abs();
        match by_date.get(&txn.transaction_date) {
            Some(kept) if (kept.amount - recurring.user_amount).abs() <= distance => {}
            _ => {
                by_date.insert(txn.transaction_date, txn);
            }
        }
    }

    by_date.into_values().collect()
}
