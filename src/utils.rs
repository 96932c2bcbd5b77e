// Utility helpers shared by the transport, lobby and ledger layers.

use ethers::types::{Address, U256};
use std::str::FromStr;
use std::time::Duration;

use crate::{
    constants::SETTLEMENT_BACKOFF_MAX_MS,
    error::{AppError, Result},
};

/// Parses a `0x` prefixed EVM wallet address; rejects the zero address.
pub fn parse_wallet(raw: &str) -> Result<Address> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("0x") || trimmed.len() != 42 {
        return Err(AppError::BadRequest(format!(
            "Invalid wallet address '{}'",
            trimmed
        )));
    }
    let address = Address::from_str(trimmed)
        .map_err(|e| AppError::BadRequest(format!("Invalid wallet address: {}", e)))?;
    if address == Address::zero() {
        return Err(AppError::BadRequest("Zero wallet address".to_string()));
    }
    Ok(address)
}

/// Lower-case hex rendering used on the wire and in logs.
pub fn wallet_hex(address: &Address) -> String {
    format!("{:#x}", address)
}

// Internal helper that supports `short_wallet` operations.
pub fn short_wallet(address: &Address) -> String {
    let full = wallet_hex(address);
    format!("{}…{}", &full[..6], &full[full.len() - 4..])
}

/// Converts an on-chain uint256 id into `u64`, failing instead of truncating.
pub fn u256_to_u64(value: U256) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        return Err(AppError::Internal(format!("uint256 {} exceeds u64", value)));
    }
    Ok(value.as_u64())
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let millis = (base.as_millis() as u64).saturating_mul(1_u64 << exponent);
    Duration::from_millis(millis.min(SETTLEMENT_BACKOFF_MAX_MS))
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random opaque identifier, e.g. `s_3f9a0c1b7e2d4a66`.
pub fn random_id(prefix: &str) -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}_{}", prefix, hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wallet_rejects_malformed_and_zero() {
        assert!(parse_wallet("0x1234").is_err());
        assert!(parse_wallet("85146539B8b2aE8B37C1DB66D36ab45EF3657FB8").is_err());
        assert!(parse_wallet("0x0000000000000000000000000000000000000000").is_err());
        let parsed = parse_wallet("0x85146539B8b2aE8B37C1DB66D36ab45EF3657FB8").unwrap();
        assert_eq!(
            wallet_hex(&parsed),
            "0x85146539b8b2ae8b37c1db66d36ab45ef3657fb8"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2_000));
        assert_eq!(
            backoff_delay(base, 30),
            Duration::from_millis(SETTLEMENT_BACKOFF_MAX_MS)
        );
    }

    #[test]
    fn u256_to_u64_refuses_overflow() {
        assert_eq!(u256_to_u64(U256::from(42)).unwrap(), 42);
        assert!(u256_to_u64(U256::MAX).is_err());
    }

    #[test]
    fn random_id_has_prefix_and_hex_body() {
        let id = random_id("s");
        assert!(id.starts_with("s_"));
        assert_eq!(id.len(), 2 + 16);
    }
}
