//! Commission winner selection.
//!
//! When a backbone position stabilizes, the units at the previous position
//! have their child commissions attributed: among the candidate children,
//! exactly one winner is chosen by hashing each candidate's identity with
//! the newly-fixed backbone unit and taking the minimum key. The comparator
//! is a true three-way total order, symmetric and reflexive even for
//! equal keys, so the outcome is independent of iteration order and of
//! the sort algorithm underneath. An empty candidate set simply attributes
//! nothing.

use std::cmp::Ordering;

use crate::unit::UnitId;
use crate::Hash;

/// Sort key for one commission candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommissionKey {
    pub key: Hash,
    pub candidate: UnitId,
}

impl CommissionKey {
    /// Key = H(candidate id ‖ anchor), where the anchor is the backbone
    /// unit whose stabilization fixed the candidate set.
    pub fn new(candidate: UnitId, anchor: UnitId) -> Self {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&candidate.0);
        data[32..].copy_from_slice(&anchor.0);
        CommissionKey {
            key: crate::hash_domain(b"keel.commission", &data),
            candidate,
        }
    }

    /// Three-way comparison: by key bytes, then candidate ID. Guarantees
    /// `compare(a, b) == compare(b, a).reverse()` and
    /// `compare(a, a) == Ordering::Equal` for all inputs, including pairs
    /// with identical keys.
    pub fn compare(a: &CommissionKey, b: &CommissionKey) -> Ordering {
        a.key
            .cmp(&b.key)
            .then_with(|| a.candidate.cmp(&b.candidate))
    }
}

impl Ord for CommissionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        CommissionKey::compare(self, other)
    }
}

impl PartialOrd for CommissionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Select the commission winner among `candidates`, anchored at the
/// stabilized backbone unit. `None` when there are no candidates: the
/// attribution is skipped, never an error.
pub fn pick_winner(candidates: &[UnitId], anchor: UnitId) -> Option<UnitId> {
    candidates
        .iter()
        .map(|c| CommissionKey::new(*c, anchor))
        .min()
        .map(|k| k.candidate)
}
