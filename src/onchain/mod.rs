//! On-chain access for the lottery contract.
//!
//! - `abi`: event topic hashes and the upkeep call encodings
//! - `types`: typed `LotteryEvent`s decoded from raw logs
//! - `ledger`: the `Ledger` trait and its WebSocket implementation
//! - `signer`: local key signing for upkeep transactions

pub mod abi;
pub mod ledger;
pub mod signer;
pub mod types;

pub use ledger::{AlloyLedger, Ledger, LedgerError, LogSubscription};
pub use signer::{SignerError, TransactionSigner};
pub use types::{EventKind, LotteryEvent};
