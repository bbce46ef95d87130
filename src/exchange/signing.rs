//! Request signing (spec §4.1): HMAC-SHA256 over a canonical query string,
//! with a `timestamp` nonce and `recvWindow`. Clock drift beyond
//! `recvWindow` fails closed with `ClockDrift`.
//!
//! The teacher's `signing.rs` builds an L1 (EIP-712-ish) signature for
//! Hyperliquid's order-msgpack wire format via `ethers-signers`. This venue
//! instead uses the common REST-exchange convention (query string + HMAC
//! secret key), so the shape changes but the role — "take an action,
//! produce a signature, stamp a nonce" — is identical.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// Builds `key1=val1&key2=val2...` in insertion order — callers are
/// responsible for a stable, documented field order since the signature
/// covers the literal string.
pub fn canonical_query_string(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn sign(secret_key: &str, canonical_query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|e| ExchangeError::Rejected(format!("invalid secret key: {e}")))?;
    mac.update(canonical_query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks that `server_time_ms` and our local clock disagree by no more than
/// `recv_window_ms` (spec §4.1).
pub fn check_clock_drift(
    local_time_ms: i64,
    server_time_ms: i64,
    recv_window_ms: i64,
) -> Result<(), ExchangeError> {
    let drift = (local_time_ms - server_time_ms).abs();
    if drift > recv_window_ms {
        return Err(ExchangeError::ClockDrift {
            drift_ms: drift,
            recv_window_ms,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_input() {
        let q = canonical_query_string(&[("symbol", "BTCUSDT".into()), ("timestamp", "123".into())]);
        let s1 = sign("secret", &q).unwrap();
        let s2 = sign("secret", &q).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn sign_changes_with_secret() {
        let q = canonical_query_string(&[("symbol", "BTCUSDT".into())]);
        let s1 = sign("secret-a", &q).unwrap();
        let s2 = sign("secret-b", &q).unwrap();
        assert_ne!(s1, s2);
    }

    #[test]
    fn clock_drift_within_window_ok() {
        assert!(check_clock_drift(1_000, 1_200, 500).is_ok());
    }

    #[test]
    fn clock_drift_beyond_window_fails() {
        assert!(check_clock_drift(1_000, 2_000, 500).is_err());
    }
}
