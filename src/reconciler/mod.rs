//! State reconciler: turns the contract's log stream into the projection.
//!
//! Two phases, entered once each and in order:
//! 1. `Backfilling` replays every historical `RoundStarted` log up to the
//!    chain head, rebuilding round boundaries from block timestamps.
//! 2. `Live` consumes the log subscription one log at a time and applies
//!    rounds, joins and winners.
//!
//! The subscription is opened before the head is read, so logs mined during
//! the backfill sit in the channel; round starts already replayed are
//! recognised by position and dropped. Any ledger or store failure ends
//! `run` with an error: the caller exits and a restart replays from the
//! persisted cursor.

use crate::onchain::abi;
use crate::onchain::ledger::{Ledger, LedgerError, LogSubscription};
use crate::onchain::types::{EventKind, LogPosition, LotteryEvent};
use crate::store::{ProjectionStore, Round, StoreError};
use crate::upkeep::UpkeepRequest;

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ReconcilerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("log subscription failed: {0}")]
    SubscriptionFailed(LedgerError),
    #[error("log subscription closed")]
    SubscriptionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Backfilling,
    Live,
}

/// In-memory mirror of the most recent round. Not a source of truth: it is
/// rebuilt from the store on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundCursor {
    pub number: u64,
    pub open: bool,
    pub winner_declared: bool,
}

impl RoundCursor {
    fn opened(number: u64) -> Self {
        Self {
            number,
            open: true,
            winner_declared: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub contract: Address,
    pub start_block: u64,
    pub log_chunk_size: u64,
}

pub struct StateReconciler<L, S> {
    ledger: Arc<L>,
    store: S,
    config: ReconcilerConfig,
    phase: Phase,
    cursor: Option<RoundCursor>,
    /// Position of the last `RoundStarted` log seen by the backfill.
    backfilled_to: Option<LogPosition>,
    /// Start position of every backfilled round, ascending.
    backfilled_rounds: Vec<(LogPosition, u64)>,
    upkeep_tx: Option<mpsc::UnboundedSender<UpkeepRequest>>,
}

impl<L: Ledger, S: ProjectionStore> StateReconciler<L, S> {
    pub fn new(ledger: Arc<L>, store: S, config: ReconcilerConfig) -> Self {
        Self {
            ledger,
            store,
            config,
            phase: Phase::Backfilling,
            cursor: None,
            backfilled_to: None,
            backfilled_rounds: Vec::new(),
            upkeep_tx: None,
        }
    }

    /// Forward join events to an upkeep trigger.
    pub fn with_upkeep(mut self, upkeep_tx: mpsc::UnboundedSender<UpkeepRequest>) -> Self {
        self.upkeep_tx = Some(upkeep_tx);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> Option<RoundCursor> {
        self.cursor
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Backfill, then consume live logs until the subscription dies.
    /// Only returns on error.
    pub async fn run(&mut self) -> Result<(), ReconcilerError> {
        self.restore_cursor().await?;

        let topics = EventKind::all_topics();
        let subscription = self.ledger.subscribe(self.config.contract, &topics).await?;
        let head = self.ledger.current_head().await?;
        info!(head = head, start_block = self.config.start_block, "starting backfill");

        self.backfill(head).await?;

        self.phase = Phase::Live;
        info!(
            round = self.cursor.map(|c| c.number).unwrap_or(0),
            "backfill complete, consuming live logs"
        );
        self.run_live(subscription).await
    }

    /// Seed the cursor from the latest persisted round.
    pub async fn restore_cursor(&mut self) -> Result<(), ReconcilerError> {
        self.cursor = match self.store.last_round().await? {
            Some(round) => {
                let winner_declared = self.store.winner(round.number).await?.is_some();
                info!(
                    round = round.number,
                    open = round.is_open(),
                    winner_declared = winner_declared,
                    "restored round cursor from store"
                );
                Some(RoundCursor {
                    number: round.number,
                    open: round.is_open(),
                    winner_declared,
                })
            }
            None => {
                info!("store is empty, starting from round 1");
                None
            }
        };
        Ok(())
    }

    /// Replay historical `RoundStarted` logs up to `head`, one
    /// `log_chunk_size` window at a time.
    ///
    /// Round N is the N-th `RoundStarted` log since `start_block`; numbers the
    /// store already holds are skipped, so re-running over an existing
    /// projection writes nothing twice. Returns the number of rounds created.
    pub async fn backfill(&mut self, head: u64) -> Result<usize, ReconcilerError> {
        self.phase = Phase::Backfilling;
        self.backfilled_rounds.clear();
        let persisted = self.cursor.map(|c| c.number).unwrap_or(0);
        let topics = [abi::ROUND_STARTED_TOPIC];
        let chunk = self.config.log_chunk_size.max(1);

        let mut seen = 0usize;
        let mut number = 0u64;
        let mut created = 0usize;
        let mut block_times: HashMap<u64, DateTime<Utc>> = HashMap::new();

        let mut start = self.config.start_block;
        while start <= head {
            let end = start.saturating_add(chunk - 1).min(head);
            let logs = self
                .ledger
                .historical_logs(self.config.contract, &topics, start, end)
                .await?;
            debug!(from = start, to = end, logs = logs.len(), "round log chunk");
            seen += logs.len();

            for log in &logs {
                if log.removed {
                    warn!(
                        block = log.block_number.unwrap_or(0),
                        tx = ?log.transaction_hash,
                        "skipping historical log removed by reorg"
                    );
                    continue;
                }
                number += 1;
                if let Some(pos) = LogPosition::of(log) {
                    self.backfilled_to = Some(pos);
                    self.backfilled_rounds.push((pos, number));
                }
                if number <= persisted {
                    continue;
                }
                let started_at = self.block_time(log, &mut block_times).await?;
                self.start_round(number, started_at).await?;
                created += 1;
            }

            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }

        if number < persisted {
            warn!(
                chain_rounds = number,
                stored_rounds = persisted,
                "store holds more rounds than the chain history, keeping stored cursor"
            );
        }
        info!(
            logs = seen,
            created = created,
            skipped = number.min(persisted),
            "backfilled rounds"
        );
        Ok(created)
    }

    /// Round whose backfilled start is the latest one at or before `pos`.
    fn backfilled_round_at(&self, pos: LogPosition) -> Option<u64> {
        let idx = self.backfilled_rounds.partition_point(|(start, _)| *start <= pos);
        idx.checked_sub(1).map(|i| self.backfilled_rounds[i].1)
    }

    /// Chain time of a historical log, fetching the block when the node
    /// did not attach it.
    async fn block_time(
        &self,
        log: &Log,
        cache: &mut HashMap<u64, DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, LedgerError> {
        if let Some(time) = log.block_timestamp.and_then(timestamp_to_utc) {
            return Ok(time);
        }
        let block = log
            .block_number
            .ok_or_else(|| LedgerError::Decode("historical log without block number".into()))?;
        if let Some(time) = cache.get(&block) {
            return Ok(*time);
        }
        let time = self.ledger.block_timestamp(block).await?;
        cache.insert(block, time);
        Ok(time)
    }

    /// Process the subscription strictly in delivery order.
    pub async fn run_live(
        &mut self,
        mut subscription: LogSubscription,
    ) -> Result<(), ReconcilerError> {
        self.phase = Phase::Live;
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;

                res = &mut subscription.errors, if errors_open => match res {
                    Ok(e) => {
                        error!(error = %e, "log subscription error");
                        return Err(ReconcilerError::SubscriptionFailed(e));
                    }
                    // Sender gone without reporting; the log channel decides.
                    Err(_) => errors_open = false,
                },

                log = subscription.logs.recv() => match log {
                    Some(log) => self.handle_log(log).await?,
                    None => {
                        error!("log subscription closed");
                        return Err(ReconcilerError::SubscriptionClosed);
                    }
                },
            }
        }
    }

    /// Decode and apply one live log. Only store failures are errors.
    pub async fn handle_log(&mut self, log: Log) -> Result<(), StoreError> {
        if log.removed {
            warn!(
                block = log.block_number.unwrap_or(0),
                tx = ?log.transaction_hash,
                "skipping log removed by reorg"
            );
            return Ok(());
        }

        let event = match LotteryEvent::from_log(&log) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(topic = ?log.topic0(), "unrecognised event topic");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, block = log.block_number.unwrap_or(0), "failed to decode log");
                return Ok(());
            }
        };

        let observed_at = log
            .block_timestamp
            .and_then(timestamp_to_utc)
            .unwrap_or_else(Utc::now);

        match (LogPosition::of(&log), self.backfilled_to) {
            (Some(pos), Some(done)) if pos <= done => {
                self.apply_buffered(event, pos, observed_at).await
            }
            (None, Some(_)) if event == LotteryEvent::RoundStarted => {
                warn!(
                    tx = ?log.transaction_hash,
                    "round start without block number, cannot check it against backfill"
                );
                self.apply(event, observed_at, None).await
            }
            _ => self.apply(event, observed_at, log.block_number).await,
        }
    }

    /// Apply a log mined while the backfill ran, positioned at or before the
    /// last backfilled round start. Joins and winners go to the round open at
    /// `pos`, which need not be the cursor's round.
    async fn apply_buffered(
        &mut self,
        event: LotteryEvent,
        pos: LogPosition,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let round = self.backfilled_round_at(pos);
        let current = self.cursor.map(|c| c.number);
        match event {
            LotteryEvent::RoundStarted => {
                debug!(block = pos.block, index = pos.index, "round start already backfilled");
                Ok(())
            }
            _ if round.is_some() && round == current => {
                self.apply(event, at, Some(pos.block)).await
            }
            LotteryEvent::UserJoined { participant } => {
                self.on_user_joined(participant, round, at, Some(pos.block)).await
            }
            LotteryEvent::WinnerDeclared { winner } => match round {
                Some(number) => self.declare_past_winner(winner, number, at).await,
                None => {
                    warn!(
                        winner = %winner,
                        block = pos.block,
                        "winner declared before the first backfilled round, ignoring"
                    );
                    Ok(())
                }
            },
        }
    }

    /// Winner for a round the cursor has already moved past.
    async fn declare_past_winner(
        &mut self,
        winner: Address,
        number: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.store.winner(number).await?.is_some() {
            warn!(round = number, winner = %winner, "round already has a winner, ignoring");
            return Ok(());
        }
        self.store.close_round(number, at).await?;
        self.store.create_winner(winner, number, at).await?;
        info!(round = number, winner = %winner, "WINNER DECLARED");
        Ok(())
    }

    /// Apply a decoded event observed at `at`.
    pub async fn apply(
        &mut self,
        event: LotteryEvent,
        at: DateTime<Utc>,
        block: Option<u64>,
    ) -> Result<(), StoreError> {
        match event {
            LotteryEvent::RoundStarted => {
                let number = self.cursor.map(|c| c.number + 1).unwrap_or(1);
                let round = self.start_round(number, at).await?;
                info!(round = round.number, started_at = %round.started_at, "ROUND STARTED");
            }
            LotteryEvent::UserJoined { participant } => {
                let open = self.cursor.filter(|c| c.open).map(|c| c.number);
                self.on_user_joined(participant, open, at, block).await?;
            }
            LotteryEvent::WinnerDeclared { winner } => {
                self.on_winner_declared(winner, at).await?;
            }
        }
        Ok(())
    }

    /// Close the open round (if any) at `at` and open round `number`.
    async fn start_round(&mut self, number: u64, at: DateTime<Utc>) -> Result<Round, StoreError> {
        if let Some(cursor) = self.cursor {
            if cursor.open {
                self.store.close_round(cursor.number, at).await?;
            }
        }
        let round = self.store.create_round(at, number).await?;
        self.cursor = Some(RoundCursor::opened(number));
        Ok(round)
    }

    /// Record a join in `round`, the round open when it was mined.
    async fn on_user_joined(
        &mut self,
        participant: Address,
        round: Option<u64>,
        at: DateTime<Utc>,
        block: Option<u64>,
    ) -> Result<(), StoreError> {
        match round {
            Some(number) => {
                self.store.create_participant(participant, number, at).await?;
                info!(round = number, participant = %participant, "USER JOINED");
            }
            None => {
                warn!(
                    participant = %participant,
                    block = block.unwrap_or(0),
                    "join observed with no open round, participant not recorded"
                );
            }
        }

        // The upkeep condition lives on-chain, so check it either way.
        if let Some(tx) = &self.upkeep_tx {
            let request = UpkeepRequest {
                participant,
                round,
                block,
            };
            if tx.send(request).is_err() {
                debug!("upkeep trigger stopped, request dropped");
            }
        }
        Ok(())
    }

    async fn on_winner_declared(
        &mut self,
        winner: Address,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(cursor) = self.cursor else {
            warn!(winner = %winner, "winner declared before any round, ignoring");
            return Ok(());
        };
        if cursor.winner_declared {
            warn!(round = cursor.number, winner = %winner, "round already has a winner, ignoring");
            return Ok(());
        }

        self.store.close_round(cursor.number, at).await?;
        self.store.create_winner(winner, cursor.number, at).await?;
        self.cursor = Some(RoundCursor {
            number: cursor.number,
            open: false,
            winner_declared: true,
        });
        info!(round = cursor.number, winner = %winner, "WINNER DECLARED");
        Ok(())
    }
}

fn timestamp_to_utc(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, 0)
}
