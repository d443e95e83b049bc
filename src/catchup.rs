//! Checkpoint-chain validation for bootstrap catchup.
//!
//! A synchronizing node receives a compact chain of checkpoints instead of
//! replaying the full DAG. The chain is only trusted piecewise: the first
//! entry must already be known and stable locally; every later entry must
//! be locally known (and not yet finalized: a stable local unit appearing
//! as a *later* boundary means the peer's history overlaps ours
//! differently), hash-linked to its predecessor, or carried by a witness
//! proof. Anything else is rejected outright with zero state mutation,
//! never parked as "to be resolved later".
//!
//! Validation runs under the same coordination lock as stability
//! advancement so it never observes a half-advanced boundary.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ProtocolParams;
use crate::graph::UnitGraph;
use crate::unit::{Address, UnitId};
use crate::Hash;

/// A majority attestation accompanying a checkpoint the receiver cannot
/// link locally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WitnessProof {
    /// Witness addresses vouching for the checkpoint
    pub attestors: Vec<Address>,
}

/// One entry of a peer-supplied catchup chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub unit_id: UnitId,
    /// Commits to the predecessor checkpoint: H(prev_id ‖ unit_id)
    pub content_commitment: Hash,
    pub proof: Option<WitnessProof>,
}

impl Checkpoint {
    /// The commitment a well-formed chain carries at each link.
    pub fn link_commitment(prev: &UnitId, this: &UnitId) -> Hash {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&prev.0);
        data[32..].copy_from_slice(&this.0);
        crate::hash_domain(b"keel.checkpoint", &data)
    }
}

/// A validated chain: what the boundary is and which units must still be
/// fetched before the graph can advance to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchupPlan {
    /// The claimed boundary (last checkpoint)
    pub boundary: UnitId,
    /// Entries not yet known locally, in chain order
    pub to_fetch: Vec<UnitId>,
}

/// Catchup rejection taxonomy. All reject with zero state mutation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CatchupError {
    #[error("checkpoint chain is empty")]
    EmptyChain,
    #[error("checkpoint chain too long: {0}")]
    ChainTooLong(usize),
    #[error("first checkpoint {0:?} is not known locally")]
    UnknownFirst(UnitId),
    #[error("first checkpoint {0:?} is known but not stable")]
    FirstNotStable(UnitId),
    #[error("checkpoint {0:?} overlaps the already-finalized region")]
    OverlapsFinalized(UnitId),
    #[error("checkpoint {0:?} is neither known nor independently verifiable")]
    Unverifiable(UnitId),
    #[error("catchup retry budget exhausted")]
    AttemptBudgetExhausted,
    #[error("catchup session expired; pending state discarded")]
    SessionExpired,
}

/// Validate a peer-supplied checkpoint chain against the local graph.
///
/// Pure over the snapshot; the caller holds the coordination lock.
pub fn validate_chain(
    graph: &UnitGraph,
    params: &ProtocolParams,
    chain: &[Checkpoint],
) -> Result<CatchupPlan, CatchupError> {
    if chain.is_empty() {
        return Err(CatchupError::EmptyChain);
    }
    if chain.len() > crate::constants::MAX_CHECKPOINT_CHAIN {
        return Err(CatchupError::ChainTooLong(chain.len()));
    }

    let first = &chain[0];
    match graph.get(&first.unit_id) {
        None => return Err(CatchupError::UnknownFirst(first.unit_id)),
        Some(rec) if !rec.is_stable => {
            return Err(CatchupError::FirstNotStable(first.unit_id))
        }
        Some(_) => {}
    }

    let mut to_fetch = Vec::new();
    for window in chain.windows(2) {
        let (prev, cp) = (&window[0], &window[1]);
        match graph.get(&cp.unit_id) {
            Some(rec) => {
                // A later boundary that we already finalized means the
                // peer's chain overlaps our finalized region.
                if rec.is_stable {
                    tracing::warn!(
                        checkpoint = %cp.unit_id.to_hex(),
                        "rejecting catchup chain overlapping finalized region"
                    );
                    return Err(CatchupError::OverlapsFinalized(cp.unit_id));
                }
            }
            None => {
                let linked = cp.content_commitment
                    == Checkpoint::link_commitment(&prev.unit_id, &cp.unit_id);
                let attested = cp
                    .proof
                    .as_ref()
                    .map(|p| witness_proof_verifies(p, params))
                    .unwrap_or(false);
                if !linked && !attested {
                    tracing::warn!(
                        checkpoint = %cp.unit_id.to_hex(),
                        "rejecting unverifiable checkpoint"
                    );
                    return Err(CatchupError::Unverifiable(cp.unit_id));
                }
                to_fetch.push(cp.unit_id);
            }
        }
    }

    Ok(CatchupPlan {
        boundary: chain[chain.len() - 1].unit_id,
        to_fetch,
    })
}

fn witness_proof_verifies(proof: &WitnessProof, params: &ProtocolParams) -> bool {
    let witness_set = params.witness_set();
    let mut seen = std::collections::HashSet::new();
    let distinct = proof
        .attestors
        .iter()
        .filter(|a| witness_set.contains(a) && seen.insert(**a))
        .count();
    distinct >= params.majority()
}

/// Retry/age bookkeeping for one in-flight catchup.
///
/// Peer retrieval is the transport's job; this tracks how long and how
/// often one chain has been pending so stale state is actively discarded
/// instead of retried forever.
#[derive(Debug)]
pub struct CatchupSession {
    chain_digest: Hash,
    attempts: u32,
    started_at: Instant,
}

impl CatchupSession {
    pub fn new(chain: &[Checkpoint]) -> Self {
        CatchupSession {
            chain_digest: Self::digest(chain),
            attempts: 0,
            started_at: Instant::now(),
        }
    }

    /// Stable digest identifying a chain across retries.
    pub fn digest(chain: &[Checkpoint]) -> Hash {
        let parts: Vec<&[u8]> = chain.iter().map(|cp| cp.unit_id.0.as_slice()).collect();
        crate::hash_concat(&parts)
    }

    pub fn matches(&self, chain: &[Checkpoint]) -> bool {
        self.chain_digest == Self::digest(chain)
    }

    /// Count one attempt against the budget.
    pub fn note_attempt(&mut self, max_attempts: u32) -> Result<(), CatchupError> {
        self.attempts += 1;
        if self.attempts > max_attempts {
            return Err(CatchupError::AttemptBudgetExhausted);
        }
        Ok(())
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.started_at.elapsed() > max_age
    }
}
