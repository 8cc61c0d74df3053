//! In-process projection store.
//!
//! Selected with `store.url = "memory://"` for dry runs against a node;
//! nothing survives a restart. Also the store used by the test suite.

use super::{Participant, ProjectionStore, Round, StoreError, Winner};
use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    rounds: BTreeMap<u64, Round>,
    participants: BTreeMap<u64, Vec<Participant>>,
    winners: BTreeMap<u64, Winner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rounds in sequence order.
    pub fn rounds(&self) -> Vec<Round> {
        self.rounds.values().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.values().map(Vec::len).sum()
    }

    pub fn winners(&self) -> Vec<Winner> {
        self.winners.values().cloned().collect()
    }

    fn require_round(&mut self, number: u64) -> Result<&mut Round, StoreError> {
        self.rounds.get_mut(&number).ok_or_else(|| {
            StoreError::ConstraintViolation(format!("round {number} does not exist"))
        })
    }
}

#[async_trait]
impl ProjectionStore for MemoryStore {
    async fn last_round(&mut self) -> Result<Option<Round>, StoreError> {
        Ok(self.rounds.values().next_back().cloned())
    }

    async fn round(&mut self, number: u64) -> Result<Option<Round>, StoreError> {
        Ok(self.rounds.get(&number).cloned())
    }

    async fn create_round(
        &mut self,
        started_at: DateTime<Utc>,
        number: u64,
    ) -> Result<Round, StoreError> {
        if self.rounds.contains_key(&number) {
            return Err(StoreError::ConstraintViolation(format!(
                "round {number} already exists"
            )));
        }
        let round = Round {
            number,
            started_at,
            ended_at: None,
        };
        self.rounds.insert(number, round.clone());
        Ok(round)
    }

    async fn close_round(
        &mut self,
        number: u64,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.require_round(number)?.ended_at = Some(ended_at);
        Ok(())
    }

    async fn create_participant(
        &mut self,
        address: Address,
        round: u64,
        joined_at: DateTime<Utc>,
    ) -> Result<Participant, StoreError> {
        self.require_round(round)?;
        let participant = Participant {
            address,
            round,
            joined_at,
        };
        self.participants
            .entry(round)
            .or_default()
            .push(participant.clone());
        Ok(participant)
    }

    async fn participants(&mut self, round: u64) -> Result<Vec<Participant>, StoreError> {
        Ok(self.participants.get(&round).cloned().unwrap_or_default())
    }

    async fn create_winner(
        &mut self,
        address: Address,
        round: u64,
        declared_at: DateTime<Utc>,
    ) -> Result<Winner, StoreError> {
        self.require_round(round)?;
        if self.winners.contains_key(&round) {
            return Err(StoreError::ConstraintViolation(format!(
                "round {round} already has a winner"
            )));
        }
        let winner = Winner {
            address,
            round,
            declared_at,
        };
        self.winners.insert(round, winner.clone());
        Ok(winner)
    }

    async fn winner(&mut self, round: u64) -> Result<Option<Winner>, StoreError> {
        Ok(self.winners.get(&round).cloned())
    }
}
