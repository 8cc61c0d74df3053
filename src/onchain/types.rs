//! Typed lottery events decoded from raw contract logs.

use crate::onchain::abi;
use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use thiserror::Error;

/// The closed set of contract events the listener understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RoundStarted,
    UserJoined,
    WinnerDeclared,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::RoundStarted,
        EventKind::UserJoined,
        EventKind::WinnerDeclared,
    ];

    /// Canonical signature string, as hashed into topic0.
    pub fn signature(self) -> &'static str {
        match self {
            EventKind::RoundStarted => "RoundStarted()",
            EventKind::UserJoined => "UserJoined(address)",
            EventKind::WinnerDeclared => "WinnerDeclared(address)",
        }
    }

    pub fn topic(self) -> B256 {
        match self {
            EventKind::RoundStarted => abi::ROUND_STARTED_TOPIC,
            EventKind::UserJoined => abi::USER_JOINED_TOPIC,
            EventKind::WinnerDeclared => abi::WINNER_DECLARED_TOPIC,
        }
    }

    /// Route a topic0 to an event kind. Unknown topics return `None`.
    pub fn from_topic(topic: &B256) -> Option<Self> {
        match *topic {
            t if t == abi::ROUND_STARTED_TOPIC => Some(EventKind::RoundStarted),
            t if t == abi::USER_JOINED_TOPIC => Some(EventKind::UserJoined),
            t if t == abi::WINNER_DECLARED_TOPIC => Some(EventKind::WinnerDeclared),
            _ => None,
        }
    }

    pub fn all_topics() -> Vec<B256> {
        Self::ALL.iter().map(|k| k.topic()).collect()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::RoundStarted => write!(f, "RoundStarted"),
            EventKind::UserJoined => write!(f, "UserJoined"),
            EventKind::WinnerDeclared => write!(f, "WinnerDeclared"),
        }
    }
}

/// A decoded lottery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotteryEvent {
    RoundStarted,
    UserJoined { participant: Address },
    WinnerDeclared { winner: Address },
}

impl LotteryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LotteryEvent::RoundStarted => EventKind::RoundStarted,
            LotteryEvent::UserJoined { .. } => EventKind::UserJoined,
            LotteryEvent::WinnerDeclared { .. } => EventKind::WinnerDeclared,
        }
    }

    /// Decode a raw log. `Ok(None)` means the topic is not one of ours.
    pub fn from_log(log: &Log) -> Result<Option<Self>, DecodeError> {
        let topic0 = log.topic0().ok_or(DecodeError::MissingTopic0)?;
        let Some(kind) = EventKind::from_topic(topic0) else {
            return Ok(None);
        };

        let event = match kind {
            EventKind::RoundStarted => LotteryEvent::RoundStarted,
            EventKind::UserJoined => LotteryEvent::UserJoined {
                participant: indexed_address(log, kind)?,
            },
            EventKind::WinnerDeclared => LotteryEvent::WinnerDeclared {
                winner: indexed_address(log, kind)?,
            },
        };
        Ok(Some(event))
    }
}

impl std::fmt::Display for LotteryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LotteryEvent::RoundStarted => write!(f, "RoundStarted"),
            LotteryEvent::UserJoined { participant } => write!(f, "UserJoined({participant})"),
            LotteryEvent::WinnerDeclared { winner } => write!(f, "WinnerDeclared({winner})"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log has no topic0")]
    MissingTopic0,
    #[error("{0} log is missing its indexed address topic")]
    MissingIndexedAddress(EventKind),
}

/// The first indexed parameter sits in topics[1], left-padded to 32 bytes.
fn indexed_address(log: &Log, kind: EventKind) -> Result<Address, DecodeError> {
    log.topics()
        .get(1)
        .map(|t| Address::from_slice(&t.0[12..]))
        .ok_or(DecodeError::MissingIndexedAddress(kind))
}

/// Position of a log in the chain, used to order and de-duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPosition {
    pub block: u64,
    pub index: u64,
}

impl LogPosition {
    pub fn of(log: &Log) -> Option<Self> {
        Some(Self {
            block: log.block_number?,
            index: log.log_index.unwrap_or(0),
        })
    }
}
