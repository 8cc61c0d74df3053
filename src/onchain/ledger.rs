//! Read/submit façade over the Ethereum node.
//!
//! `Ledger` is the seam the reconciler and the upkeep trigger depend on;
//! `AlloyLedger` implements it over a single WebSocket provider. Tests use
//! a scripted in-memory ledger instead.

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionInput, TransactionRequest};
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Buffered logs between the node subscription and the reconciler.
const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("log query rejected: {0}")]
    QueryRejected(String),
    #[error("call reverted: {0}")]
    CallReverted(String),
    #[error("transaction rejected: {0}")]
    SubmissionRejected(String),
    #[error("unexpected node response: {0}")]
    Decode(String),
}

/// Live log stream plus its error side-channel.
///
/// An error on `errors`, or `logs` closing, means the subscription is dead.
pub struct LogSubscription {
    pub logs: mpsc::Receiver<Log>,
    pub errors: oneshot::Receiver<LedgerError>,
}

impl LogSubscription {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (mpsc::Sender<Log>, oneshot::Sender<LedgerError>, Self) {
        let (log_tx, logs) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (err_tx, errors) = oneshot::channel();
        (log_tx, err_tx, Self { logs, errors })
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn current_head(&self) -> Result<u64, LedgerError>;

    /// Logs for `contract` whose topic0 is one of `topics`, in ascending
    /// (block, log index) order.
    async fn historical_logs(
        &self,
        contract: Address,
        topics: &[B256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, LedgerError>;

    async fn block_timestamp(&self, block: u64) -> Result<DateTime<Utc>, LedgerError>;

    async fn subscribe(
        &self,
        contract: Address,
        topics: &[B256],
    ) -> Result<LogSubscription, LedgerError>;

    /// Read-only `eth_call` against the latest block.
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, LedgerError>;

    async fn pending_nonce(&self, account: Address) -> Result<u64, LedgerError>;

    async fn gas_price(&self) -> Result<u128, LedgerError>;

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<u64, LedgerError>;

    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Broadcast a signed, 2718-encoded transaction.
    async fn submit(&self, raw_tx: Bytes) -> Result<B256, LedgerError>;
}

/// `Ledger` over an alloy WebSocket provider.
#[derive(Clone)]
pub struct AlloyLedger {
    provider: DynProvider,
}

impl AlloyLedger {
    pub async fn connect(ws_url: &str) -> Result<Self, LedgerError> {
        let ws = WsConnect::new(ws_url);
        let provider = ProviderBuilder::new()
            .connect_ws(ws)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        info!(url = %ws_url, "connected to node WebSocket");
        Ok(Self {
            provider: provider.erased(),
        })
    }
}

/// Map a JSON-RPC error: error responses get the call-specific class,
/// everything else is a transport failure.
fn classify(
    err: RpcError<TransportErrorKind>,
    on_response: fn(String) -> LedgerError,
) -> LedgerError {
    match err {
        RpcError::ErrorResp(payload) => on_response(payload.message.to_string()),
        RpcError::DeserError { err, .. } => LedgerError::Decode(err.to_string()),
        other => LedgerError::Unavailable(other.to_string()),
    }
}

fn unavailable(err: RpcError<TransportErrorKind>) -> LedgerError {
    classify(err, LedgerError::Unavailable)
}

/// Block header seconds as UTC; `Decode` past `i64::MAX`.
fn block_time(secs: u64) -> Result<DateTime<Utc>, LedgerError> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .ok_or_else(|| LedgerError::Decode(format!("block timestamp out of range: {secs}")))
}

#[async_trait]
impl Ledger for AlloyLedger {
    async fn current_head(&self) -> Result<u64, LedgerError> {
        self.provider.get_block_number().await.map_err(unavailable)
    }

    async fn historical_logs(
        &self,
        contract: Address,
        topics: &[B256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, LedgerError> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(topics.to_vec())
            .from_block(from_block)
            .to_block(to_block);
        let mut logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| classify(e, LedgerError::QueryRejected))?;
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        debug!(from = from_block, to = to_block, count = logs.len(), "fetched historical logs");
        Ok(logs)
    }

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, LedgerError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(unavailable)?
            .ok_or_else(|| LedgerError::Decode(format!("block {number} not found")))?;
        block_time(block.header.timestamp)
    }

    async fn subscribe(
        &self,
        contract: Address,
        topics: &[B256],
    ) -> Result<LogSubscription, LedgerError> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(topics.to_vec());
        let sub = self.provider.subscribe_logs(&filter).await.map_err(unavailable)?;
        let (log_tx, err_tx, subscription) = LogSubscription::channel();

        // Forward node notifications; the stream ending means the socket died.
        tokio::spawn(async move {
            let mut stream = sub.into_stream();
            while let Some(log) = stream.next().await {
                if log_tx.send(log).await.is_err() {
                    debug!("log subscription receiver dropped");
                    return;
                }
            }
            warn!("node log subscription stream ended");
            let _ = err_tx.send(LedgerError::Unavailable(
                "log subscription stream ended".to_string(),
            ));
        });

        info!(contract = %contract, topics = topics.len(), "subscribed to contract logs");
        Ok(subscription)
    }

    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, LedgerError> {
        let tx = TransactionRequest::default()
            .to(contract)
            .input(TransactionInput::new(calldata));
        self.provider
            .call(tx)
            .await
            .map_err(|e| classify(e, LedgerError::CallReverted))
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64, LedgerError> {
        self.provider
            .get_transaction_count(account)
            .pending()
            .await
            .map_err(unavailable)
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        self.provider.get_gas_price().await.map_err(unavailable)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<u64, LedgerError> {
        let tx = TransactionRequest::default()
            .from(from)
            .to(to)
            .input(TransactionInput::new(data));
        self.provider
            .estimate_gas(tx)
            .await
            .map_err(|e| classify(e, LedgerError::CallReverted))
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.provider.get_chain_id().await.map_err(unavailable)
    }

    async fn submit(&self, raw_tx: Bytes) -> Result<B256, LedgerError> {
        let pending = self
            .provider
            .send_raw_transaction(&raw_tx)
            .await
            .map_err(|e| classify(e, LedgerError::SubmissionRejected))?;
        Ok(*pending.tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_time_in_range() {
        let time = block_time(1_700_000_000).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_block_time_rejects_values_past_i64() {
        assert!(matches!(block_time(u64::MAX), Err(LedgerError::Decode(_))));
        assert!(matches!(
            block_time(i64::MAX as u64 + 1),
            Err(LedgerError::Decode(_))
        ));
    }
}
