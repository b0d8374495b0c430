use punchcard_types::{InvalidReport, WalletRecord};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

mod api;
pub use api::Api;

mod config;
pub use config::TrackerConfig;
pub mod metrics;
use metrics::{HttpMetrics, HttpMetricsSnapshot, ReferralMetrics, ReferralMetricsSnapshot};
pub mod reader;
pub mod reconcile;
use reconcile::{reconcile, record_win, ReconcileError, Reconciled, ReferralPolicy};
pub mod referral;
use referral::ReferralQueue;
pub mod store;
pub use store::{MemoryStore, SqliteStore, StorageError, Upserted, WalletStore};
pub mod verifier;
pub use verifier::{
    sign_token, Credential, CredentialVerifier, Ed25519Verifier, VerificationError,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Invalid(#[from] InvalidReport),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ReconcileError> for TrackerError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Invalid(err) => Self::Invalid(err),
            ReconcileError::Storage(err) => Self::Storage(err),
        }
    }
}

/// Wallet progress service.
///
/// Owns the store, the credential verifier and the referral worker. Store
/// calls run on the blocking pool; referral bonuses are queued after the
/// triggering write commits and never fail the caller.
pub struct Tracker {
    pub config: TrackerConfig,
    store: Arc<dyn WalletStore>,
    verifier: Arc<dyn CredentialVerifier>,
    policy: ReferralPolicy,
    referrals: ReferralQueue,
    http_metrics: HttpMetrics,
    referral_metrics: Arc<ReferralMetrics>,
}

impl Tracker {
    /// Build a tracker and start its referral worker on the current runtime.
    pub fn new(
        store: Arc<dyn WalletStore>,
        verifier: Arc<dyn CredentialVerifier>,
        config: TrackerConfig,
    ) -> Self {
        let referral_metrics = Arc::new(ReferralMetrics::default());
        let referrals = ReferralQueue::start(
            store.clone(),
            config.referral_worker(),
            referral_metrics.clone(),
        );
        Self {
            policy: config.referral_policy(),
            config,
            store,
            verifier,
            referrals,
            http_metrics: HttpMetrics::default(),
            referral_metrics,
        }
    }

    /// Verify `token` and merge the progress it carries.
    ///
    /// The write and the referral dispatch run in a spawned task, so both
    /// complete even if the caller stops waiting.
    pub async fn submit_progress(&self, token: &str) -> Result<Upserted, TrackerError> {
        let credential = self.verifier.verify(token)?;
        let store = self.store.clone();
        let policy = self.policy;
        let referrals = self.referrals.dispatcher();
        tokio::spawn(async move {
            let Reconciled {
                record,
                created,
                referral,
            } = tokio::task::spawn_blocking(move || {
                reconcile(
                    store.as_ref(),
                    &credential.address,
                    &credential.report,
                    policy,
                )
            })
            .await??;

            info!(
                address = %record.address,
                created,
                tokens = record.tokens,
                punches = record.punches,
                "recorded progress"
            );
            if let Some(job) = referral {
                referrals.dispatch(job).await;
            }
            Ok::<_, TrackerError>(Upserted { record, created })
        })
        .await?
    }

    /// Credit `win_delta` finished games to `address`.
    pub async fn submit_finish(
        &self,
        address: &str,
        win_delta: i64,
    ) -> Result<Upserted, TrackerError> {
        let store = self.store.clone();
        let address = address.to_string();
        let upserted =
            tokio::task::spawn_blocking(move || record_win(store.as_ref(), &address, win_delta))
                .await??;
        info!(
            address = %upserted.record.address,
            created = upserted.created,
            wins = upserted.record.win_count,
            "recorded win"
        );
        Ok(upserted)
    }

    pub async fn details(&self, address: &str) -> Result<Option<WalletRecord>, TrackerError> {
        let store = self.store.clone();
        let address = address.to_string();
        Ok(
            tokio::task::spawn_blocking(move || reader::details_for(store.as_ref(), &address))
                .await??,
        )
    }

    pub async fn leaderboard(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<WalletRecord>, TrackerError> {
        let store = self.store.clone();
        let max = self.config.leaderboard_max();
        Ok(
            tokio::task::spawn_blocking(move || reader::top_by_wins(store.as_ref(), limit, max))
                .await??,
        )
    }

    /// Wait for every referral bonus queued so far to be applied.
    pub async fn flush_referrals(&self) {
        self.referrals.flush().await;
    }

    /// Drain the referral queue and stop the worker.
    pub async fn shutdown(&self) {
        self.referrals.shutdown().await;
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub fn referral_metrics_snapshot(&self) -> ReferralMetricsSnapshot {
        self.referral_metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use punchcard_types::{Claims, ProgressReport};
    use std::time::Duration;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9; 32])
    }

    fn tracker(store: Arc<dyn WalletStore>, config: TrackerConfig) -> Tracker {
        let verifier = Arc::new(Ed25519Verifier::new(signing_key().verifying_key()));
        Tracker::new(store, verifier, config)
    }

    fn token(address: &str, report: ProgressReport) -> String {
        sign_token(&signing_key(), &Claims::new(address, report)).unwrap()
    }

    /// Store whose upserts take `delay` to commit.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl WalletStore for SlowStore {
        fn get(&self, address: &str) -> Result<Option<WalletRecord>, StorageError> {
            self.inner.get(address)
        }

        fn upsert(
            &self,
            address: &str,
            mutate: store::Mutator<'_>,
        ) -> Result<Upserted, StorageError> {
            std::thread::sleep(self.delay);
            self.inner.upsert(address, mutate)
        }

        fn list_top(&self, limit: usize) -> Result<Vec<WalletRecord>, StorageError> {
            self.inner.list_top(limit)
        }
    }

    fn report(tokens: i64, punches: i64, referred_by: &str, character_name: &str) -> ProgressReport {
        ProgressReport {
            tokens: Some(tokens),
            punches: Some(punches),
            referred_by: Some(referred_by.to_string()),
            character_name: Some(character_name.to_string()),
        }
    }

    #[tokio::test]
    async fn first_report_credits_new_referrer() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone(), TrackerConfig::default());

        let upserted = tracker
            .submit_progress(&token("A", report(100, 50, "B", "Hero")))
            .await
            .unwrap();
        assert!(upserted.created);
        tracker.flush_referrals().await;

        let a = tracker.details("A").await.unwrap().unwrap();
        assert_eq!(
            (a.tokens, a.punches, a.referred_by.as_str(), a.character_name.as_str()),
            (100, 50, "B", "Hero")
        );
        let b = tracker.details("B").await.unwrap().unwrap();
        assert_eq!(b.bonus_punches, 5);
        assert_eq!(b.referred_by, "B");
        assert_eq!((b.tokens, b.punches, b.win_count), (0, 0, 0));
        assert_eq!(tracker.referral_metrics_snapshot().credited, 1);

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_submit_still_credits_referrer() {
        let store: Arc<dyn WalletStore> = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(100),
        });
        let tracker = tracker(store, TrackerConfig::default());

        let submit_token = token("A", report(0, 50, "B", ""));
        let submit = tracker.submit_progress(&submit_token);
        assert!(tokio::time::timeout(Duration::from_millis(10), submit)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        tracker.flush_referrals().await;

        assert_eq!(tracker.details("A").await.unwrap().unwrap().punches, 50);
        assert_eq!(tracker.details("B").await.unwrap().unwrap().bonus_punches, 5);
        let snapshot = tracker.referral_metrics_snapshot();
        assert_eq!((snapshot.credited, snapshot.dropped), (1, 0));
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn self_referral_earns_nothing() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let tracker = tracker(store, TrackerConfig::default());

        tracker
            .submit_progress(&token("A", report(0, 500, "A", "")))
            .await
            .unwrap();
        tracker.flush_referrals().await;

        let a = tracker.details("A").await.unwrap().unwrap();
        assert_eq!(a.punches, 500);
        assert_eq!(a.bonus_punches, 0);
        assert_eq!(tracker.referral_metrics_snapshot().self_referrals, 1);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_reports_accumulate() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let tracker = Arc::new(tracker(store, TrackerConfig::default()));

        let submissions = (0..32).map(|_| {
            let tracker = tracker.clone();
            async move {
                tracker
                    .submit_progress(&token("A", report(1, 3, "B", "")))
                    .await
            }
        });
        for result in futures::future::join_all(submissions).await {
            result.unwrap();
        }
        tracker.flush_referrals().await;

        let a = tracker.details("A").await.unwrap().unwrap();
        assert_eq!(a.tokens, 32);
        assert_eq!(a.punches, 96);
        // Each report of 3 punches earns floor(0.3) = 0.
        assert_eq!(tracker.details("B").await.unwrap().unwrap().bonus_punches, 0);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_token_writes_nothing() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let tracker = tracker(store, TrackerConfig::default());

        let forged = sign_token(
            &SigningKey::from_bytes(&[1; 32]),
            &Claims::new("A", report(1, 1, "", "")),
        )
        .unwrap();
        assert!(matches!(
            tracker.submit_progress(&forged).await,
            Err(TrackerError::Verification(VerificationError::BadSignature))
        ));
        assert_eq!(tracker.details("A").await.unwrap(), None);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_report_leaves_record_unchanged() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let tracker = tracker(store, TrackerConfig::default());
        tracker
            .submit_progress(&token("A", report(100, 0, "", "")))
            .await
            .unwrap();

        let err = tracker
            .submit_progress(&token("A", report(-5, 0, "", "")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Invalid(InvalidReport::Negative { field: "tokens", .. })
        ));
        assert_eq!(tracker.details("A").await.unwrap().unwrap().tokens, 100);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn finishes_feed_the_leaderboard() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let tracker = tracker(store, TrackerConfig::default());
        for (address, wins) in [("w5", 5), ("w3", 3), ("w9", 9), ("w1", 1)] {
            tracker.submit_finish(address, wins).await.unwrap();
        }

        let top = tracker.leaderboard(Some(3)).await.unwrap();
        let wins: Vec<u64> = top.iter().map(|record| record.win_count).collect();
        assert_eq!(wins, vec![9, 5, 3]);
        assert_eq!(tracker.leaderboard(None).await.unwrap().len(), 4);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn rereferral_follows_policy() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let config = TrackerConfig {
            allow_rereferral: true,
            ..Default::default()
        };
        let tracker = tracker(store, config);
        tracker
            .submit_progress(&token("A", report(0, 10, "B", "")))
            .await
            .unwrap();
        tracker
            .submit_progress(&token("A", report(0, 20, "C", "")))
            .await
            .unwrap();
        tracker.flush_referrals().await;

        assert_eq!(tracker.details("A").await.unwrap().unwrap().referred_by, "C");
        assert_eq!(tracker.details("B").await.unwrap().unwrap().bonus_punches, 1);
        assert_eq!(tracker.details("C").await.unwrap().unwrap().bonus_punches, 2);
        tracker.shutdown().await;
    }
}
