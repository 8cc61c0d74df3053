//! Test fixtures: log builders and a scripted in-memory ledger.

use crate::onchain::abi;
use crate::onchain::ledger::{Ledger, LedgerError, LogSubscription};
use alloy::primitives::{Address, Bytes, LogData, B256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

pub const CONTRACT: Address = Address::repeat_byte(0xc0);

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
}

fn log_with(topics: Vec<B256>, block: u64, index: u64, timestamp: u64) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address: CONTRACT,
            data: LogData::new_unchecked(topics, Bytes::new()),
        },
        block_number: Some(block),
        log_index: Some(index),
        block_timestamp: (timestamp > 0).then_some(timestamp),
        ..Default::default()
    }
}

/// `timestamp = 0` leaves `block_timestamp` unset.
pub fn round_log(block: u64, index: u64, timestamp: u64) -> Log {
    log_with(vec![abi::ROUND_STARTED_TOPIC], block, index, timestamp)
}

pub fn join_log(who: Address, block: u64, index: u64, timestamp: u64) -> Log {
    log_with(
        vec![abi::USER_JOINED_TOPIC, who.into_word()],
        block,
        index,
        timestamp,
    )
}

pub fn winner_log(who: Address, block: u64, index: u64, timestamp: u64) -> Log {
    log_with(
        vec![abi::WINNER_DECLARED_TOPIC, who.into_word()],
        block,
        index,
        timestamp,
    )
}

/// Scripted ledger. Configure the public fields before sharing it.
pub struct FakeLedger {
    pub head: u64,
    pub history: Vec<Log>,
    pub block_times: HashMap<u64, i64>,
    /// Ranges wider than this are rejected like a provider would.
    pub max_range: Option<u64>,
    /// Queries starting at or after this block fail as if the node dropped.
    pub unavailable_from: Option<u64>,
    pub check_result: Result<bool, LedgerError>,
    pub submit_result: Result<B256, LedgerError>,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub chain_id: u64,

    pub log_queries: Mutex<Vec<(u64, u64)>>,
    pub timestamp_queries: AtomicUsize,
    pub checks: AtomicUsize,
    pub submitted: Mutex<Vec<Bytes>>,
    pub subscription: Mutex<Option<LogSubscription>>,
}

/// Sending half of a fake subscription.
pub struct SubscriptionHandle {
    pub logs: mpsc::Sender<Log>,
    pub errors: oneshot::Sender<LedgerError>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self {
            head: 0,
            history: Vec::new(),
            block_times: HashMap::new(),
            max_range: None,
            unavailable_from: None,
            check_result: Ok(false),
            submit_result: Ok(B256::repeat_byte(0xab)),
            nonce: 3,
            gas_price: 1_000_000_000,
            gas_limit: 90_000,
            chain_id: 31337,
            log_queries: Mutex::new(Vec::new()),
            timestamp_queries: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        }
    }
}

impl FakeLedger {
    /// Arm the next `subscribe` call and return the sending half.
    pub fn arm_subscription(&self) -> SubscriptionHandle {
        let (logs, errors, sub) = LogSubscription::channel();
        *self.subscription.lock().unwrap() = Some(sub);
        SubscriptionHandle { logs, errors }
    }

    pub fn submitted(&self) -> Vec<Bytes> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn current_head(&self) -> Result<u64, LedgerError> {
        Ok(self.head)
    }

    async fn historical_logs(
        &self,
        contract: Address,
        topics: &[B256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, LedgerError> {
        self.log_queries.lock().unwrap().push((from_block, to_block));
        if self.unavailable_from.is_some_and(|b| from_block >= b) {
            return Err(LedgerError::Unavailable("connection reset".to_string()));
        }
        if let Some(max) = self.max_range {
            if to_block - from_block + 1 > max {
                return Err(LedgerError::QueryRejected(format!(
                    "range {from_block}..{to_block} too large"
                )));
            }
        }
        let mut logs: Vec<Log> = self
            .history
            .iter()
            .filter(|l| l.address() == contract)
            .filter(|l| l.topic0().is_some_and(|t| topics.contains(t)))
            .filter(|l| {
                let b = l.block_number.unwrap_or(0);
                b >= from_block && b <= to_block
            })
            .cloned()
            .collect();
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    async fn block_timestamp(&self, block: u64) -> Result<DateTime<Utc>, LedgerError> {
        self.timestamp_queries.fetch_add(1, Ordering::SeqCst);
        self.block_times
            .get(&block)
            .map(|secs| ts(*secs))
            .ok_or_else(|| LedgerError::Decode(format!("block {block} not found")))
    }

    async fn subscribe(
        &self,
        _contract: Address,
        _topics: &[B256],
    ) -> Result<LogSubscription, LedgerError> {
        self.subscription
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| LedgerError::Unavailable("no subscription armed".to_string()))
    }

    async fn call(&self, _contract: Address, calldata: Bytes) -> Result<Bytes, LedgerError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        assert_eq!(calldata, abi::encode_check_upkeep());
        let needed = self.check_result.clone()?;
        Ok((needed, Bytes::new()).abi_encode_params().into())
    }

    async fn pending_nonce(&self, _account: Address) -> Result<u64, LedgerError> {
        Ok(self.nonce)
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        Ok(self.gas_price)
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _to: Address,
        _data: Bytes,
    ) -> Result<u64, LedgerError> {
        Ok(self.gas_limit)
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        Ok(self.chain_id)
    }

    async fn submit(&self, raw_tx: Bytes) -> Result<B256, LedgerError> {
        self.submitted.lock().unwrap().push(raw_tx);
        self.submit_result.clone()
    }
}
