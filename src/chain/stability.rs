//! Stability oracle: decides whether the earliest unstable backbone
//! position is provably final given the current free-tip set.
//!
//! The oracle is pure and synchronous over a point-in-time snapshot; it
//! never mutates anything and returns the same verdict for the same
//! snapshot on every node. A deferred verdict (`NotYetProvable`) is normal
//! backpressure and silent; only malformed inputs are errors.

use super::ConsistencyViolation;
use crate::config::ProtocolParams;
use crate::graph::UnitGraph;
use crate::unit::{Address, UnitId};

/// Outcome of a stability test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The position is irreversibly final.
    Stable,
    /// Not provable from the current tips; try again after growth.
    NotYetProvable,
}

/// Test whether the backbone unit at `mci` is provably stable.
pub fn evaluate(
    graph: &UnitGraph,
    params: &ProtocolParams,
    mci: u64,
) -> Result<Verdict, ConsistencyViolation> {
    let tips: Vec<UnitId> = graph.tips().iter().copied().collect();
    evaluate_with_tips(graph, params, mci, &tips)
}

/// Same test against an explicit free-unit set (a point-in-time snapshot).
///
/// Gate 1: the free-unit set must be non-empty and its maximum `limci` must
/// have progressed past `mci`. An empty tip set is explicitly
/// `NotYetProvable`, never a comparison against an empty aggregate (that
/// degenerates to a vacuous verdict and permanently corrupts the decision).
///
/// Gate 2: the backbone below `mci` is already fixed, so the subject can
/// only ever leave the backbone if some future walk descends into an
/// *alternative branch*: a competing best-child of the unit at `mci - 1`.
/// The subject is provably stable once the quorum window of the best tip
/// (the shortest best-parent prefix authored by a majority of distinct
/// witnesses) carries a minimum witnessed level that (a) reaches the
/// subject's level and (b) strictly exceeds the highest level any
/// alternative branch has attained. Witnessed levels never retreat along
/// accepted extensions, so no alternative can out-compete the subject's
/// chain afterwards: every free unit's ancestry is then guaranteed to
/// include the subject however the DAG grows.
pub fn evaluate_with_tips(
    graph: &UnitGraph,
    params: &ProtocolParams,
    mci: u64,
    tips: &[UnitId],
) -> Result<Verdict, ConsistencyViolation> {
    if mci <= graph.last_stable_mci() {
        // Already decided; re-asking is an idempotent no-op for callers.
        return Ok(Verdict::Stable);
    }
    let Some(subject) = graph.backbone_unit(mci) else {
        return Ok(Verdict::NotYetProvable);
    };
    let subject_rec = graph
        .get(&subject)
        .ok_or(ConsistencyViolation::BackboneGap(mci))?;
    let subject_level = subject_rec.level;

    // Gate 1: tip progression. An empty free-unit set is not-yet-provable
    // by definition, decided before any aggregate is formed.
    if tips.is_empty() {
        return Ok(Verdict::NotYetProvable);
    }
    let max_limci = tips
        .iter()
        .filter_map(|id| graph.get(id))
        .map(|r| r.limci)
        .max()
        .ok_or(ConsistencyViolation::EmptyAggregate("free-unit limci"))?;
    if max_limci < mci {
        return Ok(Verdict::NotYetProvable);
    }

    // Gate 2: witnessed-level domination.
    let best_tip = tips
        .iter()
        .filter_map(|id| graph.get(id))
        .max_by(|a, b| super::main_chain::selection_cmp(a, b))
        .map(|r| r.unit.id)
        .ok_or(ConsistencyViolation::EmptyAggregate("free-unit set"))?;

    let witness_set = params.witness_set();
    let Some(min_mc_wl) = min_quorum_window_wl(graph, best_tip, &witness_set, params.majority())
    else {
        // The tip set does not carry a witness quorum yet.
        return Ok(Verdict::NotYetProvable);
    };
    if min_mc_wl < subject_level {
        return Ok(Verdict::NotYetProvable);
    }

    // Alternative branches: competing best-children of the last fixed
    // backbone unit, with their best-parent descendants.
    let prev = if mci == 0 {
        return Ok(Verdict::Stable); // genesis is final by definition
    } else {
        graph
            .backbone_unit(mci - 1)
            .ok_or(ConsistencyViolation::BackboneGap(mci - 1))?
    };
    if let Some(max_alt_level) = max_alt_branch_level(graph, prev, subject) {
        if min_mc_wl <= max_alt_level {
            return Ok(Verdict::NotYetProvable);
        }
    }

    Ok(Verdict::Stable)
}

/// Minimum witnessed level over the tip's quorum window: the shortest
/// best-parent prefix whose units are authored by a majority of distinct
/// witnesses. `None` if the chain runs out before a majority accumulates.
fn min_quorum_window_wl(
    graph: &UnitGraph,
    tip: UnitId,
    witnesses: &std::collections::HashSet<Address>,
    majority: usize,
) -> Option<u64> {
    let mut collected: std::collections::HashSet<Address> = std::collections::HashSet::new();
    let mut min_wl: Option<u64> = None;
    let mut cursor = Some(tip);
    while let Some(id) = cursor {
        let rec = graph.get(&id)?;
        min_wl = Some(match min_wl {
            Some(m) => m.min(rec.witnessed_level),
            None => rec.witnessed_level,
        });
        for author in &rec.unit.authors {
            if witnesses.contains(author) {
                collected.insert(*author);
            }
        }
        if collected.len() >= majority {
            return min_wl;
        }
        cursor = rec.best_parent;
    }
    None
}

/// Highest level reached by any alternative branch: units whose best-parent
/// chain passes through a best-child of `prev` other than `subject`.
/// `None` when no alternative branch exists.
fn max_alt_branch_level(graph: &UnitGraph, prev: UnitId, subject: UnitId) -> Option<u64> {
    let mut stack: Vec<UnitId> = graph
        .children(&prev)
        .iter()
        .copied()
        .filter(|c| {
            *c != subject
                && graph
                    .get(c)
                    .map(|r| r.best_parent == Some(prev))
                    .unwrap_or(false)
        })
        .collect();
    if stack.is_empty() {
        return None;
    }

    let mut max_level = 0u64;
    while let Some(id) = stack.pop() {
        if let Some(rec) = graph.get(&id) {
            max_level = max_level.max(rec.level);
            for child in graph.children(&id) {
                if let Some(crec) = graph.get(child) {
                    if crec.best_parent == Some(id) {
                        stack.push(*child);
                    }
                }
            }
        }
    }
    Some(max_level)
}
