//! Contract ABI definitions and topic hash computation.
//!
//! We only define what the listener touches: the three lottery events and
//! the two Automation-compatible upkeep functions.

use alloy::primitives::{b256, Bytes, B256};
use alloy::sol;
use alloy::sol_types::SolCall;

// ─── Event topic0 hashes (keccak256 of event signature) ──────────────────────
//
// Pre-computed at compile time and checked against `keccak256` in tests.
// Used both for the log subscription filter and for routing.

/// keccak256("RoundStarted()")
pub const ROUND_STARTED_TOPIC: B256 =
    b256!("ca85f39c3f1adb106efb66e028812359846364ba8d9007a1e25d51305b0f3500");

/// keccak256("UserJoined(address)")
pub const USER_JOINED_TOPIC: B256 =
    b256!("4028b92b6812cf0ad64ad14283561bd81eaf1d9e718a6eabcfd40016f83bd1e9");

/// keccak256("WinnerDeclared(address)")
pub const WINNER_DECLARED_TOPIC: B256 =
    b256!("2d66076f24af48812dc2fdd69ac3d62bc732d6766ce65fdf93a45675faba22bd");

sol! {
    function checkUpkeep(bytes checkData) external view returns (bool upkeepNeeded, bytes performData);
    function performUpkeep(bytes performData) external;
}

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Topic identifier for a canonical event signature ("Name(type1,type2)").
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// Calldata for `checkUpkeep("")`.
pub fn encode_check_upkeep() -> Bytes {
    checkUpkeepCall {
        checkData: Bytes::new(),
    }
    .abi_encode()
    .into()
}

/// Decode the `upkeepNeeded` flag from a `checkUpkeep` return blob.
pub fn decode_check_upkeep(output: &[u8]) -> Result<bool, alloy::sol_types::Error> {
    let ret = checkUpkeepCall::abi_decode_returns(output)?;
    Ok(ret.upkeepNeeded)
}

/// Calldata for `performUpkeep("")`.
pub fn encode_perform_upkeep() -> Bytes {
    performUpkeepCall {
        performData: Bytes::new(),
    }
    .abi_encode()
    .into()
}

/// Verify that our pre-computed topic hashes match the event signatures.
/// Call this at startup to catch any signature mismatches.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let checks = vec![
        ("RoundStarted()", ROUND_STARTED_TOPIC),
        ("UserJoined(address)", USER_JOINED_TOPIC),
        ("WinnerDeclared(address)", WINNER_DECLARED_TOPIC),
    ];

    checks
        .into_iter()
        .map(|(sig, expected)| {
            let computed = event_topic(sig);
            (sig.to_string(), computed == expected)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolValue;

    #[test]
    fn test_topic_hashes_match_signatures() {
        for (sig, ok) in verify_topic_hashes() {
            assert!(ok, "topic hash mismatch for {sig}");
        }
    }

    #[test]
    fn test_event_topic_is_stable_and_type_sensitive() {
        assert_eq!(event_topic("UserJoined(address)"), event_topic("UserJoined(address)"));
        assert_ne!(event_topic("UserJoined(address)"), event_topic("UserJoined(uint256)"));
        assert_ne!(event_topic("UserJoined(address)"), event_topic("WinnerDeclared(address)"));
        // Well-known ERC-20 Transfer topic
        assert_eq!(
            event_topic("Transfer(address,address,uint256)"),
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
    }

    #[test]
    fn test_upkeep_selectors() {
        assert_eq!(checkUpkeepCall::SELECTOR, [0x6e, 0x04, 0xff, 0x0d]);
        assert_eq!(performUpkeepCall::SELECTOR, [0x45, 0x85, 0xe3, 0x3b]);
    }

    #[test]
    fn test_perform_upkeep_empty_payload_encoding() {
        let data = encode_perform_upkeep();
        // selector + offset word + zero length word
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &[0x45, 0x85, 0xe3, 0x3b]);
        assert_eq!(data[4 + 31], 0x20);
        assert!(data[4 + 32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_check_upkeep() {
        let needed = (true, Bytes::from(vec![1u8, 2, 3])).abi_encode_params();
        assert!(decode_check_upkeep(&needed).unwrap());

        let not_needed = (false, Bytes::new()).abi_encode_params();
        assert!(!decode_check_upkeep(&not_needed).unwrap());

        assert!(decode_check_upkeep(&[0u8; 3]).is_err());
    }
}
