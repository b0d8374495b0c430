//! Credential token claims.
//!
//! A token carries the wallet identity plus the progress it reports. Older
//! clients put the counters at the top level of the claims instead of under
//! `data`; both shapes are accepted and `data` wins when present.

use serde::{Deserialize, Serialize};

use crate::ProgressReport;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub wallet_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ProgressReport>,
    /// Expiry as unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(flatten)]
    pub inline: ProgressReport,
}

impl Claims {
    pub fn new(wallet_address: impl Into<String>, report: ProgressReport) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            data: Some(report),
            exp: None,
            inline: ProgressReport::default(),
        }
    }

    pub fn with_expiry(mut self, exp: u64) -> Self {
        self.exp = Some(exp);
        self
    }

    /// The report carried by these claims.
    pub fn report(&self) -> ProgressReport {
        self.data.clone().unwrap_or_else(|| self.inline.clone())
    }
}
