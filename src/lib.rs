//! # Keel
//!
//! The finality core of a DAG-based distributed ledger:
//! - **Main chain selection**: a deterministic best-parent walk picks one
//!   canonical backbone path through the DAG and numbers it with main-chain
//!   indices (MCIs)
//! - **Witnessed levels**: each unit carries a support score derived from
//!   witness authorship along its best-parent chain
//! - **Stability**: a pure oracle decides when the earliest unstable
//!   backbone position is provably final given the current tips
//! - **Conflict resolution**: double-spends collapse to exactly one winner
//!   once their region is final, identically on every node
//! - **Atomic advancement**: all derived writes for one MCI commit as a
//!   single durable transaction, then cascade to the next
//!
//! Keel owns only the derived decisions above the graph-store boundary.
//! Transport, contract execution, and wallet logic are external collaborators.

pub mod catchup;
pub mod chain;
pub mod config;
pub mod graph;
pub mod store;
pub mod unit;
pub mod witness;

pub use chain::advance::{Coordinator, Stabilized};
pub use chain::ChainError;
pub use config::ProtocolParams;

/// Protocol constants
pub mod constants {
    /// Number of witnesses in the protocol witness list
    pub const WITNESS_COUNT: usize = 12;
    /// Distinct witness authors required along a best-parent chain for the
    /// witnessed level to advance (strict majority of WITNESS_COUNT)
    pub const WITNESS_MAJORITY: usize = WITNESS_COUNT / 2 + 1;
    /// Maximum parent references per unit
    pub const MAX_PARENTS: usize = 16;
    /// Maximum authors per unit
    pub const MAX_AUTHORS: usize = 16;
    /// Maximum spent-resource references per unit
    pub const MAX_SPENDS: usize = 128;
    /// Maximum serialized size accepted by `deserialize` (16 MiB)
    pub const MAX_DECODE_BYTES: usize = 16 * 1024 * 1024;
    /// Maximum checkpoints in one catchup chain
    pub const MAX_CHECKPOINT_CHAIN: usize = 1024;
    /// Attempts allowed for one catchup session before its state is discarded
    pub const CATCHUP_MAX_ATTEMPTS: u32 = 8;
    /// Age in seconds after which pending catchup state is discarded
    pub const CATCHUP_MAX_AGE_SECS: u64 = 600;

    /// Compute the chain ID for mainnet.
    pub fn chain_id() -> crate::Hash {
        crate::hash_domain(b"keel.chain_id", b"keel-mainnet-v1")
    }
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Keel domains use ASCII). Panics at
/// runtime if it is not; that is a programming error, not input-dependent.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_DECODE_BYTES` to prevent OOM from
/// malicious oversized payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_DECODE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_deterministic() {
        let a = hash_domain(b"keel.test", b"hello");
        let b = hash_domain(b"keel.test", b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_domain_different_domains() {
        let a = hash_domain(b"keel.domain_a", b"data");
        let b = hash_domain(b"keel.domain_b", b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_concat_length_prefix_prevents_ambiguity() {
        let ab_c = hash_concat(&[b"ab", b"c"]);
        let a_bc = hash_concat(&[b"a", b"bc"]);
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let original: Vec<u8> = vec![1, 2, 3, 4, 5];
        let bytes = serialize(&original).unwrap();
        let restored: Vec<u8> = deserialize(&bytes).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn deserialize_rejects_oversized_input() {
        let oversized = vec![0u8; constants::MAX_DECODE_BYTES + 1];
        let result = deserialize::<Vec<u8>>(&oversized);
        assert!(result.is_err(), "oversized input should be rejected");
    }

    #[test]
    fn witness_majority_is_strict() {
        assert!(constants::WITNESS_MAJORITY * 2 > constants::WITNESS_COUNT);
    }
}
