//! HTTP request and response bodies.

use serde::{Deserialize, Serialize};

use crate::WalletRecord;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitProgressRequest {
    pub token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishRequest {
    pub wallet_address: String,
    #[serde(rename = "winDelta", default = "default_win_delta")]
    pub win_delta: i64,
}

fn default_win_delta() -> i64 {
    1
}

/// Response to a write (progress report or finish).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletUpdateResponse {
    pub message: String,
    pub created: bool,
    pub wallet: WalletRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsResponse {
    pub wallet: Option<WalletRecord>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardResponse {
    pub wallets: Vec<WalletRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
