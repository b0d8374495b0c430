pub mod api;
pub mod report;
pub use report::{validate_address, InvalidReport, ProgressReport, ValidatedReport};
pub mod token;
pub use token::Claims;
pub mod wallet;
pub use wallet::{accumulate, WalletRecord, MAX_COUNTER};

/// Longest wallet address or character name accepted from a client.
pub const MAX_FIELD_LENGTH: usize = 256;

/// Number of wallets returned by the leaderboard when no limit is given.
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Upper bound on a single leaderboard page.
pub const MAX_LEADERBOARD_LIMIT: usize = 100;
