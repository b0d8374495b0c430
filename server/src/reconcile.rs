//! Merging progress and win reports into wallet records.

use punchcard_types::{
    accumulate, report::non_negative, validate_address, InvalidReport, ProgressReport,
    ValidatedReport, WalletRecord,
};
use serde::Serialize;
use thiserror::Error;

use crate::referral::ReferralJob;
use crate::store::{StorageError, Upserted, WalletStore};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid report: {0}")]
    Invalid(#[from] InvalidReport),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How reports may change a wallet's referrer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReferralPolicy {
    /// Let a report replace a referrer that is already set.
    pub allow_rereferral: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciled {
    pub record: WalletRecord,
    pub created: bool,
    /// Bonus to dispatch once the write has committed.
    pub referral: Option<ReferralJob>,
}

/// Apply a validated report to a record in place.
///
/// Counters accumulate. Strings are replaced only by non-empty values, and the
/// referrer only while unset (or always, when re-referral is allowed).
pub fn merge_report(record: &mut WalletRecord, report: &ValidatedReport, policy: ReferralPolicy) {
    record.tokens = accumulate(record.tokens, report.tokens);
    record.punches = accumulate(record.punches, report.punches);
    if !report.character_name.is_empty() {
        record.character_name.clone_from(&report.character_name);
    }
    if !report.referred_by.is_empty() && (policy.allow_rereferral || !record.has_referrer()) {
        record.referred_by.clone_from(&report.referred_by);
    }
}

/// Merge `report` into the record for `address`.
///
/// Nothing is written when the report is rejected. When the report names a
/// referrer, the returned [Reconciled::referral] carries the bonus job for the
/// wallet's effective referrer.
pub fn reconcile(
    store: &dyn WalletStore,
    address: &str,
    report: &ProgressReport,
    policy: ReferralPolicy,
) -> Result<Reconciled, ReconcileError> {
    let address = validate_address(address)?;
    let report = report.validate()?;

    let Upserted { record, created } = store.upsert(address, &mut |record, _| {
        merge_report(record, &report, policy);
    })?;

    let referral = (!report.referred_by.is_empty()).then(|| ReferralJob {
        referrer: record.referred_by.clone(),
        punches_delta: report.punches,
        referred: record.address.clone(),
    });

    Ok(Reconciled {
        record,
        created,
        referral,
    })
}

/// Add `win_delta` wins to `address`, creating the record if needed.
pub fn record_win(
    store: &dyn WalletStore,
    address: &str,
    win_delta: i64,
) -> Result<Upserted, ReconcileError> {
    let address = validate_address(address)?;
    let win_delta = non_negative("winDelta", Some(win_delta))?;
    Ok(store.upsert(address, &mut |record, _| {
        record.win_count = accumulate(record.win_count, win_delta);
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn report(tokens: i64, punches: i64, referred_by: &str, character_name: &str) -> ProgressReport {
        ProgressReport {
            tokens: Some(tokens),
            punches: Some(punches),
            referred_by: Some(referred_by.to_string()),
            character_name: Some(character_name.to_string()),
        }
    }

    #[test]
    fn first_report_creates_record() {
        let store = MemoryStore::new();
        let reconciled = reconcile(
            &store,
            "A",
            &report(100, 50, "B", "Hero"),
            ReferralPolicy::default(),
        )
        .unwrap();

        assert!(reconciled.created);
        let record = store.get("A").unwrap().unwrap();
        assert_eq!(record.tokens, 100);
        assert_eq!(record.punches, 50);
        assert_eq!(record.referred_by, "B");
        assert_eq!(record.character_name, "Hero");
        assert_eq!(record.bonus_punches, 0);
        assert_eq!(record.win_count, 0);
        assert_eq!(
            reconciled.referral,
            Some(ReferralJob {
                referrer: "B".to_string(),
                punches_delta: 50,
                referred: "A".to_string(),
            })
        );
    }

    #[test]
    fn later_reports_accumulate() {
        let store = MemoryStore::new();
        reconcile(&store, "A", &report(100, 50, "", "Hero"), ReferralPolicy::default()).unwrap();

        let update = ProgressReport {
            tokens: Some(20),
            ..Default::default()
        };
        let reconciled = reconcile(&store, "A", &update, ReferralPolicy::default()).unwrap();

        assert!(!reconciled.created);
        assert_eq!(reconciled.record.tokens, 120);
        assert_eq!(reconciled.record.punches, 50);
        assert_eq!(reconciled.record.character_name, "Hero");
        assert_eq!(reconciled.referral, None);
    }

    #[test]
    fn negative_delta_leaves_record_unchanged() {
        let store = MemoryStore::new();
        reconcile(&store, "A", &report(100, 50, "", ""), ReferralPolicy::default()).unwrap();
        let before = store.get("A").unwrap();

        let bad = ProgressReport {
            tokens: Some(-5),
            punches: Some(10),
            ..Default::default()
        };
        let err = reconcile(&store, "A", &bad, ReferralPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Invalid(InvalidReport::Negative { field: "tokens", .. })
        ));
        assert_eq!(store.get("A").unwrap(), before);
    }

    #[test]
    fn missing_address_is_rejected() {
        let store = MemoryStore::new();
        let err = reconcile(&store, " ", &report(1, 1, "", ""), ReferralPolicy::default())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid(InvalidReport::MissingAddress)));
        assert!(store.list_top(10).unwrap().is_empty());
    }

    #[test]
    fn empty_strings_do_not_clear_fields() {
        let store = MemoryStore::new();
        reconcile(&store, "A", &report(0, 0, "B", "Hero"), ReferralPolicy::default()).unwrap();
        let reconciled =
            reconcile(&store, "A", &report(1, 1, "", ""), ReferralPolicy::default()).unwrap();
        assert_eq!(reconciled.record.referred_by, "B");
        assert_eq!(reconciled.record.character_name, "Hero");
    }

    #[test]
    fn character_name_is_last_write_wins() {
        let store = MemoryStore::new();
        reconcile(&store, "A", &report(0, 0, "", "Hero"), ReferralPolicy::default()).unwrap();
        let reconciled =
            reconcile(&store, "A", &report(0, 0, "", "Villain"), ReferralPolicy::default())
                .unwrap();
        assert_eq!(reconciled.record.character_name, "Villain");
    }

    #[test]
    fn referrer_is_fixed_after_first_set() {
        let store = MemoryStore::new();
        reconcile(&store, "A", &report(0, 10, "B", ""), ReferralPolicy::default()).unwrap();
        let reconciled =
            reconcile(&store, "A", &report(0, 30, "C", ""), ReferralPolicy::default()).unwrap();

        assert_eq!(reconciled.record.referred_by, "B");
        let job = reconciled.referral.unwrap();
        assert_eq!(job.referrer, "B");
        assert_eq!(job.punches_delta, 30);
    }

    #[test]
    fn rereferral_policy_allows_replacement() {
        let store = MemoryStore::new();
        let policy = ReferralPolicy {
            allow_rereferral: true,
        };
        reconcile(&store, "A", &report(0, 10, "B", ""), policy).unwrap();
        let reconciled = reconcile(&store, "A", &report(0, 30, "C", ""), policy).unwrap();
        assert_eq!(reconciled.record.referred_by, "C");
        assert_eq!(reconciled.referral.unwrap().referrer, "C");
    }

    #[test]
    fn self_marker_can_be_replaced_by_real_referrer() {
        let store = MemoryStore::new();
        store
            .upsert("B", &mut |record, _| record.referred_by = "B".to_string())
            .unwrap();
        let reconciled =
            reconcile(&store, "B", &report(0, 10, "C", ""), ReferralPolicy::default()).unwrap();
        assert_eq!(reconciled.record.referred_by, "C");
    }

    #[test]
    fn reconcile_never_touches_bonus_punches() {
        let store = MemoryStore::new();
        store
            .upsert("A", &mut |record, _| record.bonus_punches = 9)
            .unwrap();
        let reconciled =
            reconcile(&store, "A", &report(5, 5, "B", "x"), ReferralPolicy::default()).unwrap();
        assert_eq!(reconciled.record.bonus_punches, 9);
    }

    #[test]
    fn record_win_accumulates_and_creates() {
        let store = MemoryStore::new();
        let first = record_win(&store, "A", 2).unwrap();
        assert!(first.created);
        assert_eq!(first.record.win_count, 2);
        assert_eq!(first.record.tokens, 0);

        let second = record_win(&store, "A", 3).unwrap();
        assert!(!second.created);
        assert_eq!(second.record.win_count, 5);
    }

    #[test]
    fn record_win_rejects_negative_delta() {
        let store = MemoryStore::new();
        record_win(&store, "A", 1).unwrap();
        let err = record_win(&store, "A", -1).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Invalid(InvalidReport::Negative { field: "winDelta", value: -1 })
        ));
        assert_eq!(store.get("A").unwrap().unwrap().win_count, 1);
    }

    proptest! {
        #[test]
        fn punches_sum_over_any_report_sequence(punches in prop::collection::vec(0i64..10_000, 1..40)) {
            let store = MemoryStore::new();
            for delta in &punches {
                let update = ProgressReport { punches: Some(*delta), ..Default::default() };
                reconcile(&store, "A", &update, ReferralPolicy::default()).unwrap();
            }
            let record = store.get("A").unwrap().unwrap();
            prop_assert_eq!(record.punches, punches.iter().sum::<i64>() as u64);
            prop_assert_eq!(record.tokens, 0);
        }
    }
}
