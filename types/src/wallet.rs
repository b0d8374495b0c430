//! Persisted per-wallet progress.

use serde::{Deserialize, Serialize};

/// Largest value a counter may hold (counters are stored as signed 64-bit integers).
pub const MAX_COUNTER: u64 = i64::MAX as u64;

/// Add a non-negative delta to a counter, saturating at [MAX_COUNTER].
pub fn accumulate(current: u64, delta: u64) -> u64 {
    current.saturating_add(delta).min(MAX_COUNTER)
}

/// One record per wallet address.
///
/// Field names on the wire keep the casing clients already send
/// (`wallet_address`, `referredBy`, `characterName`, ...).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    #[serde(rename = "wallet_address")]
    pub address: String,
    pub tokens: u64,
    pub punches: u64,
    #[serde(rename = "bonusPunches")]
    pub bonus_punches: u64,
    #[serde(rename = "referredBy")]
    pub referred_by: String,
    #[serde(rename = "characterName")]
    pub character_name: String,
    #[serde(rename = "winCount")]
    pub win_count: u64,
}

impl WalletRecord {
    /// Zero-valued record for an address that has not been seen yet.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Whether a real referrer is recorded.
    ///
    /// The referral engine marks referrers it creates with their own address;
    /// that marker does not count as a referrer.
    pub fn has_referrer(&self) -> bool {
        !self.referred_by.is_empty() && self.referred_by != self.address
    }
}
