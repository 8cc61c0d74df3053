//! Projection store for lottery history: rounds, participants, winners.
//!
//! Valkey (Redis-compatible) data model:
//!   round:{n}          → JSON Round
//!   rounds:last        → highest round number written
//!   participants:{n}   → LIST of JSON Participant (join order)
//!   winner:{n}         → JSON Winner
//!
//! The store guarantees uniqueness and referential integrity only; round
//! sequencing and the one-open-round rule are enforced by the reconciler.

pub mod memory;

pub use memory::MemoryStore;

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// One lottery cycle. `ended_at` is `None` while the round is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub number: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub address: Address,
    pub round: u64,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub address: Address,
    pub round: u64,
    pub declared_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable sink for the projection. Every write is durable on return.
#[async_trait]
pub trait ProjectionStore: Send {
    async fn last_round(&mut self) -> Result<Option<Round>, StoreError>;

    async fn round(&mut self, number: u64) -> Result<Option<Round>, StoreError>;

    /// Fails with `ConstraintViolation` if `number` already exists.
    async fn create_round(
        &mut self,
        started_at: DateTime<Utc>,
        number: u64,
    ) -> Result<Round, StoreError>;

    /// Set the end timestamp of an existing round.
    async fn close_round(&mut self, number: u64, ended_at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn create_participant(
        &mut self,
        address: Address,
        round: u64,
        joined_at: DateTime<Utc>,
    ) -> Result<Participant, StoreError>;

    async fn participants(&mut self, round: u64) -> Result<Vec<Participant>, StoreError>;

    /// Fails with `ConstraintViolation` if the round already has a winner.
    async fn create_winner(
        &mut self,
        address: Address,
        round: u64,
        declared_at: DateTime<Utc>,
    ) -> Result<Winner, StoreError>;

    async fn winner(&mut self, round: u64) -> Result<Option<Winner>, StoreError>;
}

/// `SET NX` the round record and move `rounds:last` in one step, so the
/// pointer never lags a written round.
const CREATE_ROUND_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('SET', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

/// Valkey-backed projection store.
///
/// All keys are namespaced under a configurable prefix so several
/// deployments (or contracts) can share one Valkey.
/// Default prefix: "lottery" → keys like "lottery:round:1".
#[derive(Clone)]
pub struct RedisProjectionStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisProjectionStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Test connectivity.
    pub async fn ping(&mut self) -> Result<(), StoreError> {
        let pong: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &mut self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let json: Option<String> = self.conn.get(key).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn require_round(&mut self, number: u64) -> Result<Round, StoreError> {
        self.round(number).await?.ok_or_else(|| {
            StoreError::ConstraintViolation(format!("round {number} does not exist"))
        })
    }
}

#[async_trait]
impl ProjectionStore for RedisProjectionStore {
    async fn last_round(&mut self) -> Result<Option<Round>, StoreError> {
        let last_key = self.key("rounds:last");
        let last: Option<u64> = self.conn.get(&last_key).await?;
        match last {
            Some(n) => {
                let round = self.round(n).await?;
                if round.is_none() {
                    warn!(round = n, "rounds:last points at a missing round");
                }
                Ok(round)
            }
            None => Ok(None),
        }
    }

    async fn round(&mut self, number: u64) -> Result<Option<Round>, StoreError> {
        let key = self.key(&format!("round:{}", number));
        self.get_json(&key).await
    }

    async fn create_round(
        &mut self,
        started_at: DateTime<Utc>,
        number: u64,
    ) -> Result<Round, StoreError> {
        let round = Round {
            number,
            started_at,
            ended_at: None,
        };
        let key = self.key(&format!("round:{}", number));
        let last_key = self.key("rounds:last");
        let json = serde_json::to_string(&round)?;
        let created: bool = redis::Script::new(CREATE_ROUND_SCRIPT)
            .key(&key)
            .key(&last_key)
            .arg(&json)
            .arg(number)
            .invoke_async(&mut self.conn)
            .await?;
        if !created {
            return Err(StoreError::ConstraintViolation(format!(
                "round {number} already exists"
            )));
        }

        debug!(round = number, started_at = %started_at, "stored round");
        Ok(round)
    }

    async fn close_round(
        &mut self,
        number: u64,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut round = self.require_round(number).await?;
        round.ended_at = Some(ended_at);
        let key = self.key(&format!("round:{}", number));
        let json = serde_json::to_string(&round)?;
        self.conn.set::<_, _, ()>(&key, &json).await?;
        debug!(round = number, ended_at = %ended_at, "closed round");
        Ok(())
    }

    async fn create_participant(
        &mut self,
        address: Address,
        round: u64,
        joined_at: DateTime<Utc>,
    ) -> Result<Participant, StoreError> {
        self.require_round(round).await?;
        let participant = Participant {
            address,
            round,
            joined_at,
        };
        let key = self.key(&format!("participants:{}", round));
        let json = serde_json::to_string(&participant)?;
        self.conn.rpush::<_, _, ()>(&key, &json).await?;
        debug!(round = round, address = %address, "stored participant");
        Ok(participant)
    }

    async fn participants(&mut self, round: u64) -> Result<Vec<Participant>, StoreError> {
        let key = self.key(&format!("participants:{}", round));
        let jsons: Vec<String> = self.conn.lrange(&key, 0, -1).await?;
        let mut participants = Vec::with_capacity(jsons.len());
        for j in jsons {
            participants.push(serde_json::from_str(&j)?);
        }
        Ok(participants)
    }

    async fn create_winner(
        &mut self,
        address: Address,
        round: u64,
        declared_at: DateTime<Utc>,
    ) -> Result<Winner, StoreError> {
        self.require_round(round).await?;
        let winner = Winner {
            address,
            round,
            declared_at,
        };
        let key = self.key(&format!("winner:{}", round));
        let json = serde_json::to_string(&winner)?;
        let created: bool = self.conn.set_nx(&key, &json).await?;
        if !created {
            return Err(StoreError::ConstraintViolation(format!(
                "round {round} already has a winner"
            )));
        }
        debug!(round = round, address = %address, "stored winner");
        Ok(winner)
    }

    async fn winner(&mut self, round: u64) -> Result<Option<Winner>, StoreError> {
        let key = self.key(&format!("winner:{}", round));
        self.get_json(&key).await
    }
}
