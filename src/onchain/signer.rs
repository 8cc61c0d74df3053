//! Local-key transaction signing for upkeep calls.
//!
//! Produces EIP-155 legacy envelopes, RLP/2718-encoded and ready for
//! `eth_sendRawTransaction`.

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SignerError {
    #[error("invalid signing credential: {0}")]
    InvalidCredential(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Unsigned call to a contract, with all just-in-time fields resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCall {
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub nonce: u64,
    pub input: Bytes,
    pub chain_id: u64,
}

pub struct TransactionSigner {
    signer: PrivateKeySigner,
}

impl TransactionSigner {
    /// Parse a hex private key, with or without `0x`.
    pub fn from_credential(credential: &str) -> Result<Self, SignerError> {
        let signer = PrivateKeySigner::from_str(credential.trim())
            .map_err(|e| SignerError::InvalidCredential(e.to_string()))?;
        Ok(Self { signer })
    }

    /// Sender address derived from the key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign and encode. Deterministic for identical inputs (RFC 6979).
    pub fn sign(&self, call: &UnsignedCall) -> Result<Bytes, SignerError> {
        let mut tx = TxLegacy {
            chain_id: Some(call.chain_id),
            nonce: call.nonce,
            gas_price: call.gas_price,
            gas_limit: call.gas_limit,
            to: TxKind::Call(call.to),
            value: call.value,
            input: call.input.clone(),
        };
        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let envelope = TxEnvelope::from(tx.into_signed(signature));
        Ok(envelope.encoded_2718().into())
    }
}

impl std::fmt::Debug for TransactionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
