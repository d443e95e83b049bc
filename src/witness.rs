//! Witnessed-level calculation.
//!
//! A unit's witnessed level measures how much witness support its ancestry
//! carries: walking down the best-parent chain and accumulating distinct
//! witness authors, it is the level of the chain unit at which the count
//! first reaches the protocol majority. A chain that runs out before
//! reaching quorum leaves the unit with its best parent's value unchanged.
//!
//! The backbone invariant (witnessed level never retreats along an accepted
//! extension) is enforced at acceptance time in the graph, not tolerated
//! here.

use std::collections::{HashMap, HashSet};

use crate::unit::{Address, UnitId, UnitRecord};

/// Compute the witnessed level for a prospective unit whose chosen best
/// parent is `best_parent`.
///
/// `records` must contain the full best-parent chain of `best_parent` (true
/// for any accepted unit: parents are accepted before children). Units whose
/// records are missing terminate the walk; the best parent's own witnessed
/// level is then inherited.
pub fn witnessed_level(
    records: &HashMap<UnitId, UnitRecord>,
    best_parent: Option<UnitId>,
    witnesses: &HashSet<Address>,
    majority: usize,
) -> u64 {
    let Some(start) = best_parent else {
        return 0; // genesis
    };

    let mut collected: HashSet<Address> = HashSet::new();
    let mut cursor = Some(start);

    while let Some(id) = cursor {
        let Some(rec) = records.get(&id) else { break };
        for author in &rec.unit.authors {
            if witnesses.contains(author) {
                collected.insert(*author);
            }
        }
        if collected.len() >= majority {
            return rec.level;
        }
        cursor = rec.best_parent;
    }

    // Quorum never reached along the chain: inherit the best parent's value.
    records.get(&start).map(|r| r.witnessed_level).unwrap_or(0)
}
