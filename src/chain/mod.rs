//! # The finality pipeline
//!
//! Every accepted unit flows through the same deterministic pipeline:
//!
//! ```text
//! acceptance:
//!   1. Free-tip tracker updates (graph)
//!   2. Main-chain selector re-points and renumbers the unstable backbone
//!      suffix (main_chain)
//! advancement (under the single coordination lock):
//!   3. Stability oracle tests the earliest unstable backbone position
//!      against the free-tip set (stability)
//!   4. On a positive verdict: conflict resolution (conflicts) and
//!      commission winner selection (commission) run over the now-frozen
//!      region
//!   5. The coordinator commits every derived write for that MCI as one
//!      durable transaction, then cascades to the next (advance)
//! ```
//!
//! The pipeline must produce bit-identical decisions on every participant
//! without coordination. Everything below the coordinator is pure and
//! synchronous over a point-in-time snapshot; suspension happens only at
//! durable-commit boundaries.

pub mod advance;
pub mod commission;
pub mod conflicts;
pub mod main_chain;
pub mod stability;

use crate::store::StoreError;
use crate::unit::{UnitError, UnitId};

/// A defect in the derived state that may never be guessed past: the
/// affected pass aborts, marks nothing stable, and surfaces loudly.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyViolation {
    #[error("recomputation would alter already-stable unit {unit:?} (mci {mci:?})")]
    StableRenumber { unit: UnitId, mci: Option<u64> },
    #[error("aggregate computed over an empty set: {0}")]
    EmptyAggregate(&'static str),
    #[error("backbone has no unit at mci {0}")]
    BackboneGap(u64),
    #[error("durable invariant violated: {0}")]
    StoreInvariant(String),
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

/// Top-level error taxonomy of the pipeline.
///
/// `Store` is transient and retry-safe; `Consistency` indicates an
/// algorithmic defect and is logged loudly; `Rejected` is an input refused
/// at the boundary with zero state mutation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChainError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("consistency violation: {0}")]
    Consistency(#[from] ConsistencyViolation),
    #[error("unit rejected: {0}")]
    Rejected(#[from] UnitError),
}
