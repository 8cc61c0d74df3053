//! Upkeep trigger: after each join, ask the contract whether upkeep is due
//! and, if so, send a signed `performUpkeep("")` transaction.
//!
//! The reconciler only pushes `UpkeepRequest`s onto a channel. The
//! dispatcher spawns one detached task per request; a task's failure is
//! logged and dropped, never retried, and never reaches the reconciler.
//! Concurrent tasks may submit duplicate transactions; the contract's own
//! `checkUpkeep` guard and nonce ordering decide which one lands.

use crate::onchain::abi;
use crate::onchain::ledger::{Ledger, LedgerError};
use crate::onchain::signer::{SignerError, TransactionSigner, UnsignedCall};

use alloy::primitives::{Address, B256, U256};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Emitted by the reconciler for every `UserJoined` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpkeepRequest {
    pub participant: Address,
    /// Round the participant was recorded in, if any was open.
    pub round: Option<u64>,
    pub block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpkeepOutcome {
    NotNeeded,
    Submitted(B256),
}

#[derive(Error, Debug)]
pub enum UpkeepError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("upkeep needed but no valid signing credential is configured")]
    NoSigner,
}

pub struct UpkeepTrigger<L> {
    ledger: Arc<L>,
    contract: Address,
    signer: Option<Arc<TransactionSigner>>,
    /// `None` = unbounded, as many evaluations as joins.
    limiter: Option<Arc<Semaphore>>,
}

impl<L> Clone for UpkeepTrigger<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            contract: self.contract,
            signer: self.signer.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<L: Ledger + 'static> UpkeepTrigger<L> {
    pub fn new(
        ledger: Arc<L>,
        contract: Address,
        signer: Option<TransactionSigner>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            ledger,
            contract,
            signer: signer.map(Arc::new),
            limiter: (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight))),
        }
    }

    /// Start the dispatcher in a background task. Returns immediately;
    /// the task ends when every request sender is dropped.
    pub fn start(self, mut requests: mpsc::UnboundedReceiver<UpkeepRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                self.spawn(request);
            }
            debug!("upkeep request channel closed");
        })
    }

    /// Evaluate one request in its own task.
    pub fn spawn(&self, request: UpkeepRequest) -> JoinHandle<()> {
        let trigger = self.clone();
        tokio::spawn(async move {
            let _permit = match &trigger.limiter {
                Some(limiter) => match limiter.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            match trigger.evaluate().await {
                Ok(UpkeepOutcome::NotNeeded) => {
                    debug!(participant = %request.participant, "upkeep not needed");
                }
                Ok(UpkeepOutcome::Submitted(hash)) => {
                    info!(
                        tx = %hash,
                        participant = %request.participant,
                        round = request.round.unwrap_or(0),
                        "performUpkeep submitted"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        participant = %request.participant,
                        block = request.block.unwrap_or(0),
                        "upkeep attempt failed, dropping"
                    );
                }
            }
        })
    }

    /// `checkUpkeep("")`. A revert counts as "not needed".
    pub async fn check(&self) -> Result<bool, LedgerError> {
        let output = match self.ledger.call(self.contract, abi::encode_check_upkeep()).await {
            Ok(output) => output,
            Err(LedgerError::CallReverted(reason)) => {
                debug!(reason = %reason, "checkUpkeep reverted, treating as not needed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        abi::decode_check_upkeep(&output).map_err(|e| LedgerError::Decode(e.to_string()))
    }

    /// Check, and when needed build, sign and submit `performUpkeep("")`.
    pub async fn evaluate(&self) -> Result<UpkeepOutcome, UpkeepError> {
        if !self.check().await? {
            return Ok(UpkeepOutcome::NotNeeded);
        }
        let signer = self.signer.as_ref().ok_or(UpkeepError::NoSigner)?;

        let from = signer.address();
        let input = abi::encode_perform_upkeep();
        let nonce = self.ledger.pending_nonce(from).await?;
        let gas_price = self.ledger.gas_price().await?;
        let gas_limit = self
            .ledger
            .estimate_gas(from, self.contract, input.clone())
            .await?;
        let chain_id = self.ledger.chain_id().await?;

        let call = UnsignedCall {
            to: self.contract,
            value: U256::ZERO,
            gas_limit,
            gas_price,
            nonce,
            input,
            chain_id,
        };
        debug!(nonce = nonce, gas_price = gas_price, gas_limit = gas_limit, "signing performUpkeep");
        let raw = signer.sign(&call)?;
        let hash = self.ledger.submit(raw).await?;
        Ok(UpkeepOutcome::Submitted(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLedger, CONTRACT};
    use alloy::consensus::{Transaction, TxEnvelope};
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::address;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn trigger(ledger: FakeLedger) -> (Arc<FakeLedger>, UpkeepTrigger<FakeLedger>) {
        let ledger = Arc::new(ledger);
        let signer = TransactionSigner::from_credential(DEV_KEY).unwrap();
        let trigger = UpkeepTrigger::new(ledger.clone(), CONTRACT, Some(signer), 0);
        (ledger, trigger)
    }

    fn request() -> UpkeepRequest {
        UpkeepRequest {
            participant: address!("00000000000000000000000000000000000000aa"),
            round: Some(1),
            block: Some(10),
        }
    }

    #[tokio::test]
    async fn test_not_needed_never_submits() {
        let (ledger, trigger) = trigger(FakeLedger::default());
        assert_eq!(trigger.evaluate().await.unwrap(), UpkeepOutcome::NotNeeded);
        assert_eq!(ledger.checks.load(Ordering::SeqCst), 1);
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_needed_submits_perform_upkeep_to_contract() {
        let (ledger, trigger) = trigger(FakeLedger {
            check_result: Ok(true),
            ..Default::default()
        });

        let outcome = trigger.evaluate().await.unwrap();
        assert_eq!(outcome, UpkeepOutcome::Submitted(B256::repeat_byte(0xab)));

        let submitted = ledger.submitted();
        assert_eq!(submitted.len(), 1);
        let tx = TxEnvelope::decode_2718(&mut submitted[0].as_ref()).unwrap();
        assert_eq!(tx.to(), Some(CONTRACT));
        assert_eq!(tx.input(), &abi::encode_perform_upkeep());
        assert_eq!(tx.value(), U256::ZERO);
        assert_eq!(tx.nonce(), 3);
        assert_eq!(tx.gas_limit(), 90_000);
        assert_eq!(tx.gas_price(), Some(1_000_000_000));
        assert_eq!(tx.chain_id(), Some(31337));
    }

    #[tokio::test]
    async fn test_revert_counts_as_not_needed() {
        let (ledger, trigger) = trigger(FakeLedger {
            check_result: Err(LedgerError::CallReverted("paused".into())),
            ..Default::default()
        });
        assert_eq!(trigger.evaluate().await.unwrap(), UpkeepOutcome::NotNeeded);
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_submission_is_reported() {
        let (_ledger, trigger) = trigger(FakeLedger {
            check_result: Ok(true),
            submit_result: Err(LedgerError::SubmissionRejected("nonce too low".into())),
            ..Default::default()
        });
        assert!(matches!(
            trigger.evaluate().await,
            Err(UpkeepError::Ledger(LedgerError::SubmissionRejected(_)))
        ));
    }

    #[tokio::test]
    async fn test_missing_signer() {
        let ledger = Arc::new(FakeLedger {
            check_result: Ok(true),
            ..Default::default()
        });
        let trigger = UpkeepTrigger::new(ledger.clone(), CONTRACT, None, 0);
        assert!(matches!(trigger.evaluate().await, Err(UpkeepError::NoSigner)));
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_is_isolated() {
        let (_ledger, trigger) = trigger(FakeLedger {
            check_result: Err(LedgerError::Unavailable("connection refused".into())),
            ..Default::default()
        });
        // The task logs and finishes instead of propagating or panicking.
        trigger.spawn(request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_spawns_per_request() {
        let (ledger, trigger) = trigger(FakeLedger {
            check_result: Ok(true),
            ..Default::default()
        });
        let trigger = UpkeepTrigger {
            limiter: Some(Arc::new(Semaphore::new(1))),
            ..trigger
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = trigger.start(rx);

        for _ in 0..3 {
            tx.send(request()).unwrap();
        }
        drop(tx);
        dispatcher.await.unwrap();

        // Tasks are detached; wait for them to land.
        for _ in 0..100 {
            if ledger.submitted().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ledger.checks.load(Ordering::SeqCst), 3);
        assert_eq!(ledger.submitted().len(), 3);
    }
}
