//! Conflict sets and sequence resolution.
//!
//! Units spending the same resource form a conflict set. While the set's
//! region is unstable, later-arriving members carry the advisory `TempBad`
//! label; nothing may treat that label as authoritative. Once the first
//! member's position stabilizes, the set is resolved against the frozen
//! backbone: the member minimal under (MCI, unit ID) wins and every other
//! member is permanently `FinalBad`. Resolution runs inside the same locked
//! step as the stability commit that triggers it, never against state read
//! outside that step.

use std::collections::{HashMap, HashSet};

use crate::graph::UnitGraph;
use crate::unit::{ResourceId, UnitId};

/// Index of conflict sets keyed by spent resource.
#[derive(Debug, Default)]
pub struct ConflictRegistry {
    by_resource: HashMap<ResourceId, Vec<UnitId>>,
    resolved: HashSet<ResourceId>,
}

/// Outcome of resolving one conflict set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub resource: ResourceId,
    pub winner: UnitId,
    pub losers: Vec<UnitId>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a unit's spends. Returns the resources that now have more
    /// than one claimant; the caller tags the newcomer `TempBad`.
    pub fn register(&mut self, unit: UnitId, spends: &[ResourceId]) -> Vec<ResourceId> {
        let mut contested = Vec::new();
        for resource in spends {
            let members = self.by_resource.entry(*resource).or_default();
            if !members.contains(&unit) {
                members.push(unit);
                members.sort();
            }
            if members.len() > 1 {
                contested.push(*resource);
            }
        }
        contested
    }

    /// Every resource with at least one registered spender.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceId> {
        self.by_resource.keys()
    }

    pub fn members(&self, resource: &ResourceId) -> &[UnitId] {
        self.by_resource
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_resolved(&self, resource: &ResourceId) -> bool {
        self.resolved.contains(resource)
    }

    pub fn mark_resolved(&mut self, resource: ResourceId) {
        self.resolved.insert(resource);
    }

    /// Resolve one conflict set against the frozen backbone.
    ///
    /// Pure over the snapshot: the winner is the member minimal under
    /// (MCI, unit ID), units without an MCI ordering last. `eligible`
    /// excludes members already voided by another conflict set; ineligible
    /// members still appear among the losers. Re-running on the same frozen
    /// state reproduces the identical winner. `None` when the set has
    /// fewer than two members or no eligible member at all.
    pub fn resolve<F>(
        &self,
        graph: &UnitGraph,
        resource: &ResourceId,
        mut eligible: F,
    ) -> Option<Resolution>
    where
        F: FnMut(&UnitId) -> bool,
    {
        let members = self.members(resource);
        if members.len() < 2 {
            return None;
        }
        let winner = members
            .iter()
            .filter(|id| eligible(id))
            .min_by_key(|id| {
                let mci = graph.get(id).and_then(|r| r.mci).unwrap_or(u64::MAX);
                (mci, **id)
            })
            .copied()?;
        let losers = members.iter().copied().filter(|id| *id != winner).collect();
        Some(Resolution {
            resource: *resource,
            winner,
            losers,
        })
    }
}
