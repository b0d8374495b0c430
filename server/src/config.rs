use punchcard_types::MAX_LEADERBOARD_LIMIT;
use serde::Serialize;
use std::time::Duration;

use crate::reconcile::ReferralPolicy;
use crate::referral::{ReferralBackpressure, ReferralWorkerConfig};

const DEFAULT_REFERRAL_BUFFER: usize = 1_024;
const DEFAULT_REFERRAL_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_REFERRAL_RETRY_BACKOFF_MS: u64 = 50;
const DEFAULT_SUBMIT_RATE_LIMIT_PER_MINUTE: u64 = 120;
const DEFAULT_SUBMIT_RATE_LIMIT_BURST: u32 = 20;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, Serialize)]
pub struct TrackerConfig {
    pub referral_buffer: Option<usize>,
    pub referral_backpressure: Option<ReferralBackpressure>,
    pub referral_max_attempts: Option<u32>,
    pub referral_retry_backoff_ms: Option<u64>,
    pub allow_rereferral: bool,
    pub leaderboard_max: Option<usize>,
    pub submit_rate_limit_per_minute: Option<u64>,
    pub submit_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            referral_buffer: Some(DEFAULT_REFERRAL_BUFFER),
            referral_backpressure: Some(ReferralBackpressure::Block),
            referral_max_attempts: Some(DEFAULT_REFERRAL_MAX_ATTEMPTS),
            referral_retry_backoff_ms: Some(DEFAULT_REFERRAL_RETRY_BACKOFF_MS),
            allow_rereferral: false,
            leaderboard_max: Some(MAX_LEADERBOARD_LIMIT),
            submit_rate_limit_per_minute: Some(DEFAULT_SUBMIT_RATE_LIMIT_PER_MINUTE),
            submit_rate_limit_burst: Some(DEFAULT_SUBMIT_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
        }
    }
}

impl TrackerConfig {
    pub fn referral_policy(&self) -> ReferralPolicy {
        ReferralPolicy {
            allow_rereferral: self.allow_rereferral,
        }
    }

    pub fn referral_worker(&self) -> ReferralWorkerConfig {
        ReferralWorkerConfig {
            buffer: self.referral_buffer.unwrap_or(DEFAULT_REFERRAL_BUFFER).max(1),
            backpressure: self
                .referral_backpressure
                .unwrap_or(ReferralBackpressure::Block),
            max_attempts: self
                .referral_max_attempts
                .unwrap_or(DEFAULT_REFERRAL_MAX_ATTEMPTS)
                .max(1),
            retry_backoff: Duration::from_millis(
                self.referral_retry_backoff_ms
                    .unwrap_or(DEFAULT_REFERRAL_RETRY_BACKOFF_MS),
            ),
        }
    }

    /// Largest leaderboard page a caller may request.
    pub fn leaderboard_max(&self) -> usize {
        self.leaderboard_max
            .unwrap_or(MAX_LEADERBOARD_LIMIT)
            .clamp(1, MAX_LEADERBOARD_LIMIT)
    }
}
