//! Units: the vertices of the ledger DAG.
//!
//! A `Unit` is the authored, content-addressed header: parents, authors,
//! witness declaration, spent-resource claims, payload commitment. The
//! derived per-node state (level, witnessed level, backbone position,
//! stability, sequence) lives in `UnitRecord` and is mutated only by the
//! selection/stability pipeline, never by any other collaborator.

use serde::{Deserialize, Serialize};

use crate::Hash;

/// Unique identifier of a unit (hash of its header fields).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub Hash);

impl UnitId {
    /// Hex form for logs and diagnostics.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// An author or witness address (fingerprint of a signing key).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub Hash);

/// Identifier of a spendable resource claimed by a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub Hash);

/// A unit header as authored and gossiped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Unit {
    /// Unique unit identifier (hash of the remaining header fields)
    pub id: UnitId,
    /// Parent unit IDs (1..MAX_PARENTS; empty only for genesis)
    pub parents: Vec<UnitId>,
    /// Author addresses, sorted ascending
    pub authors: Vec<Address>,
    /// Declared witness list; `None` inherits the protocol list.
    /// A declared list must equal the protocol list exactly.
    pub witnesses: Option<Vec<Address>>,
    /// Resources this unit spends
    pub spends: Vec<ResourceId>,
    /// Commitment to the unit's payload (messages, definitions)
    pub payload_commitment: Hash,
    /// Timestamp (unix millis, advisory only — not used for consensus)
    pub timestamp: u64,
}

impl Unit {
    /// Compute the unit ID from its header fields.
    pub fn compute_id(
        parents: &[UnitId],
        authors: &[Address],
        witnesses: Option<&[Address]>,
        spends: &[ResourceId],
        payload_commitment: &Hash,
    ) -> UnitId {
        let mut hasher = blake3::Hasher::new_derive_key("keel.unit.id");
        for p in parents {
            hasher.update(&p.0);
        }
        hasher.update(&[0xff]); // section separator
        for a in authors {
            hasher.update(&a.0);
        }
        hasher.update(&[0xff]);
        if let Some(ws) = witnesses {
            for w in ws {
                hasher.update(&w.0);
            }
        }
        hasher.update(&[0xff]);
        for s in spends {
            hasher.update(&s.0);
        }
        hasher.update(&[0xff]);
        hasher.update(payload_commitment);
        UnitId(*hasher.finalize().as_bytes())
    }

    /// Verify structural well-formedness, independent of graph context.
    ///
    /// `is_genesis`: the genesis unit is the only unit allowed to have no
    /// parents and no authors (it is synthetic).
    pub fn validate_structure(&self, is_genesis: bool) -> Result<(), UnitError> {
        if self.parents.is_empty() && !is_genesis {
            return Err(UnitError::NoParents);
        }
        if self.parents.len() > crate::constants::MAX_PARENTS {
            return Err(UnitError::TooManyParents);
        }
        if self.authors.is_empty() && !is_genesis {
            return Err(UnitError::NoAuthors);
        }
        if self.authors.len() > crate::constants::MAX_AUTHORS {
            return Err(UnitError::TooManyAuthors);
        }
        if self.spends.len() > crate::constants::MAX_SPENDS {
            return Err(UnitError::TooManySpends);
        }

        // Parents must be strictly ascending (canonical order, no duplicates)
        for pair in self.parents.windows(2) {
            if pair[0] >= pair[1] {
                return Err(UnitError::UnsortedParents);
            }
        }
        for pair in self.authors.windows(2) {
            if pair[0] >= pair[1] {
                return Err(UnitError::UnsortedAuthors);
            }
        }
        // A unit may not claim the same resource twice
        for pair in self.spends.windows(2) {
            if pair[0] >= pair[1] {
                return Err(UnitError::UnsortedSpends);
            }
        }

        if !is_genesis {
            let expected = Self::compute_id(
                &self.parents,
                &self.authors,
                self.witnesses.as_deref(),
                &self.spends,
                &self.payload_commitment,
            );
            if expected != self.id {
                return Err(UnitError::InvalidId);
            }
        }

        Ok(())
    }
}

/// Conflict classification of a unit.
///
/// `TempBad` is a provisional, advisory label while the unit's region is
/// still unstable; it must never appear on a stable record. `Good` and
/// `FinalBad` are terminal once the record is stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sequence {
    /// Not in conflict, or the resolved winner of its conflict set
    Good,
    /// Provisionally losing a still-unstable conflict (advisory only)
    TempBad,
    /// Permanently losing its conflict set
    FinalBad,
}

impl Sequence {
    /// The legal transition table. Illegal transitions are rejected, never
    /// silently permitted.
    pub fn can_transition(self, to: Sequence) -> bool {
        use Sequence::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Good, TempBad) | (TempBad, Good) => true,
            (Good, FinalBad) | (TempBad, FinalBad) => true,
            (FinalBad, _) => false,
            _ => false,
        }
    }
}

/// A unit plus the per-node state derived by the selection/stability
/// pipeline. This is what the graph store persists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit: Unit,
    /// Graph depth: 0 for genesis, 1 + max parent level otherwise
    pub level: u64,
    /// Witness-backed support score (non-decreasing along the backbone)
    pub witnessed_level: u64,
    /// The single deterministically chosen best parent (None for genesis)
    pub best_parent: Option<UnitId>,
    /// Position on the backbone, or the MCI of the earliest backbone unit
    /// that includes this unit; None until such a unit exists
    pub mci: Option<u64>,
    /// Highest MCI among backbone units in the strict ancestry
    pub limci: u64,
    /// True if this unit is itself a backbone member
    pub is_on_main_chain: bool,
    /// True while the unit has no known children
    pub is_free: bool,
    /// Terminal and monotone: once set, mci and sequence never change
    pub is_stable: bool,
    pub sequence: Sequence,
}

impl UnitRecord {
    /// Apply a sequence transition, enforcing the transition table and the
    /// stability freeze.
    pub fn set_sequence(&mut self, to: Sequence) -> Result<(), UnitError> {
        if self.is_stable && self.sequence != to {
            return Err(UnitError::StableMutation(self.unit.id));
        }
        if !self.sequence.can_transition(to) {
            return Err(UnitError::IllegalSequenceTransition {
                from: self.sequence,
                to,
            });
        }
        self.sequence = to;
        Ok(())
    }
}

/// Errors for unit validation and record transitions.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("unit has no parents (non-genesis)")]
    NoParents,
    #[error("unit has too many parents")]
    TooManyParents,
    #[error("unit has no authors (non-genesis)")]
    NoAuthors,
    #[error("unit has too many authors")]
    TooManyAuthors,
    #[error("unit has too many spends")]
    TooManySpends,
    #[error("parent references are not sorted ascending and unique")]
    UnsortedParents,
    #[error("author addresses are not sorted ascending and unique")]
    UnsortedAuthors,
    #[error("spend references are not sorted ascending and unique")]
    UnsortedSpends,
    #[error("unit ID does not match computed header hash")]
    InvalidId,
    #[error("parent unit not found: {0:?}")]
    MissingParent(UnitId),
    #[error("duplicate unit ID")]
    DuplicateUnit,
    #[error("declared witness list does not match the protocol list")]
    WitnessListMismatch,
    #[error("witnessed level {computed} retreats below best parent's {best_parent}")]
    WitnessedLevelRetreat { computed: u64, best_parent: u64 },
    #[error("illegal sequence transition {from:?} -> {to:?}")]
    IllegalSequenceTransition { from: Sequence, to: Sequence },
    #[error("attempted mutation of stable unit {0:?}")]
    StableMutation(UnitId),
}
