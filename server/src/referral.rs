//! Referral bonuses and the worker that applies them off the request path.

use punchcard_types::accumulate;
use rand::{Rng, RngCore};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::ReferralMetrics;
use crate::store::{StorageError, WalletStore};

/// Referrers earn one bonus punch per this many punches reported by the referred wallet.
pub const REFERRAL_BONUS_DIVISOR: u64 = 10;

/// Bonus earned for `punches_delta` newly reported punches (floor of 10%).
pub fn referral_bonus(punches_delta: u64) -> u64 {
    punches_delta / REFERRAL_BONUS_DIVISOR
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferralJob {
    pub referrer: String,
    pub punches_delta: u64,
    pub referred: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BonusOutcome {
    SelfReferral,
    NoReferrer,
    Credited { bonus: u64, created: bool },
}

/// Credit `referrer` with the bonus for `punches_delta` punches reported by `referred`.
///
/// Self-referrals are ignored before touching the store. A referrer seen for
/// the first time is created and marked with its own address as referrer.
pub fn apply_referral_bonus(
    store: &dyn WalletStore,
    referrer: &str,
    punches_delta: u64,
    referred: &str,
) -> Result<BonusOutcome, StorageError> {
    if referrer == referred {
        return Ok(BonusOutcome::SelfReferral);
    }
    if referrer.is_empty() {
        return Ok(BonusOutcome::NoReferrer);
    }

    let bonus = referral_bonus(punches_delta);
    let upserted = store.upsert(referrer, &mut |record, created| {
        record.bonus_punches = accumulate(record.bonus_punches, bonus);
        if created {
            record.referred_by = referrer.to_string();
        }
    })?;
    Ok(BonusOutcome::Credited {
        bonus,
        created: upserted.created,
    })
}

/// What to do when the referral queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralBackpressure {
    Block,
    Drop,
}

impl std::str::FromStr for ReferralBackpressure {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            _ => Err("valid values: block, drop"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReferralWorkerConfig {
    pub buffer: usize,
    pub backpressure: ReferralBackpressure,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

enum ReferralMessage {
    Job(ReferralJob),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable producer handle for the referral queue.
#[derive(Clone)]
pub struct ReferralDispatcher {
    sender: mpsc::Sender<ReferralMessage>,
    backpressure: ReferralBackpressure,
    metrics: Arc<ReferralMetrics>,
}

impl ReferralDispatcher {
    /// Enqueue a job. Never fails the caller: a job that cannot be queued is
    /// logged and counted as dropped. Queue depth is raised before the send
    /// and lowered again if the job does not make it into the channel.
    pub async fn dispatch(&self, job: ReferralJob) {
        self.metrics.inc_queue_depth();
        match self.sender.try_send(ReferralMessage::Job(job)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.metrics.inc_queue_backpressure();
                match self.backpressure {
                    ReferralBackpressure::Block => {
                        if self.sender.send(message).await.is_err() {
                            self.metrics.dec_queue_depth();
                            self.metrics.inc_dropped();
                            warn!("referral queue closed; dropping bonus");
                        }
                    }
                    ReferralBackpressure::Drop => {
                        self.metrics.dec_queue_depth();
                        self.metrics.inc_dropped();
                        if let ReferralMessage::Job(job) = message {
                            warn!(
                                referrer = %job.referrer,
                                referred = %job.referred,
                                punches = job.punches_delta,
                                "referral queue full; dropping bonus"
                            );
                        }
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.dec_queue_depth();
                self.metrics.inc_dropped();
                warn!("referral queue closed; dropping bonus");
            }
        }
    }
}

/// Producer side of the referral worker.
pub struct ReferralQueue {
    dispatcher: ReferralDispatcher,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReferralQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(
        store: Arc<dyn WalletStore>,
        config: ReferralWorkerConfig,
        metrics: Arc<ReferralMetrics>,
    ) -> Self {
        let (queue, receiver) = Self::channel(config.buffer, config.backpressure, metrics.clone());
        let handle = tokio::spawn(run_worker(store, receiver, config, metrics));
        if let Ok(mut worker) = queue.worker.lock() {
            *worker = Some(handle);
        }
        queue
    }

    fn channel(
        buffer: usize,
        backpressure: ReferralBackpressure,
        metrics: Arc<ReferralMetrics>,
    ) -> (Self, mpsc::Receiver<ReferralMessage>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let queue = Self {
            dispatcher: ReferralDispatcher {
                sender,
                backpressure,
                metrics,
            },
            worker: Mutex::new(None),
        };
        (queue, receiver)
    }

    pub fn dispatcher(&self) -> ReferralDispatcher {
        self.dispatcher.clone()
    }

    pub async fn dispatch(&self, job: ReferralJob) {
        self.dispatcher.dispatch(job).await;
    }

    /// Resolve once every job dispatched before this call has been processed.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.dispatcher.sender.send(ReferralMessage::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Drain queued jobs and stop the worker.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.dispatcher.sender.send(ReferralMessage::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(?err, "referral worker panicked");
            }
        }
    }
}

async fn run_worker(
    store: Arc<dyn WalletStore>,
    mut receiver: mpsc::Receiver<ReferralMessage>,
    config: ReferralWorkerConfig,
    metrics: Arc<ReferralMetrics>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            ReferralMessage::Job(job) => {
                metrics.dec_queue_depth();
                process_job(&store, job, &config, &metrics).await;
            }
            ReferralMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            ReferralMessage::Shutdown(ack) => {
                receiver.close();
                while let Some(message) = receiver.recv().await {
                    match message {
                        ReferralMessage::Job(job) => {
                            metrics.dec_queue_depth();
                            process_job(&store, job, &config, &metrics).await;
                        }
                        ReferralMessage::Flush(ack) | ReferralMessage::Shutdown(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                let _ = ack.send(());
                info!("referral worker stopped");
                return;
            }
        }
    }
}

async fn process_job(
    store: &Arc<dyn WalletStore>,
    job: ReferralJob,
    config: &ReferralWorkerConfig,
    metrics: &ReferralMetrics,
) {
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.retry_backoff;
    for attempt in 1..=max_attempts {
        let task_store = store.clone();
        let task_job = job.clone();
        let result = tokio::task::spawn_blocking(move || {
            apply_referral_bonus(
                task_store.as_ref(),
                &task_job.referrer,
                task_job.punches_delta,
                &task_job.referred,
            )
        })
        .await;

        match result {
            Ok(Ok(BonusOutcome::Credited { bonus, created })) => {
                metrics.record_credit(bonus);
                info!(
                    referrer = %job.referrer,
                    referred = %job.referred,
                    bonus,
                    created,
                    "credited referral bonus"
                );
                return;
            }
            Ok(Ok(BonusOutcome::SelfReferral)) => {
                metrics.inc_self_referral();
                debug!(address = %job.referred, "ignoring self-referral");
                return;
            }
            Ok(Ok(BonusOutcome::NoReferrer)) => return,
            Ok(Err(err)) if attempt < max_attempts => {
                metrics.inc_retried();
                let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
                warn!(
                    referrer = %job.referrer,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "referral bonus failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
                backoff = backoff.saturating_mul(2);
            }
            Ok(Err(err)) => {
                metrics.inc_failed();
                error!(
                    referrer = %job.referrer,
                    referred = %job.referred,
                    punches = job.punches_delta,
                    attempts = attempt,
                    "referral bonus failed: {err}"
                );
                return;
            }
            Err(err) => {
                metrics.inc_failed();
                error!(?err, referrer = %job.referrer, "referral bonus task failed");
                return;
            }
        }
    }
}

fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // Delay is in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}
