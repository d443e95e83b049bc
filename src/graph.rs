//! In-memory index of the unit DAG.
//!
//! `UnitGraph` is the point-in-time snapshot the selection and stability
//! pipeline computes over: unit records, reverse (child) edges, the free-tip
//! set, and the backbone. It mirrors the durable graph store and is
//! refreshed only together with a durable commit, never ahead of it; a miss
//! here falls back to the store rather than being treated as absence.
//!
//! Acceptance runs here: structural validation, level assignment, best
//! parent choice, witnessed-level computation, and the non-retreat check.

use std::collections::{HashMap, HashSet};

use crate::chain::main_chain;
use crate::config::ProtocolParams;
use crate::unit::{Sequence, Unit, UnitError, UnitId, UnitRecord};
use crate::witness;

/// The in-memory DAG of unit records.
#[derive(Debug)]
pub struct UnitGraph {
    /// All known unit records indexed by ID
    records: HashMap<UnitId, UnitRecord>,
    /// Children of each unit (reverse edges)
    children: HashMap<UnitId, Vec<UnitId>>,
    /// Free-tip tracker: units with no known children
    tips: HashSet<UnitId>,
    /// Backbone units by MCI (index = mci)
    backbone: Vec<UnitId>,
    /// Highest MCI whose unit list is stable
    last_stable_mci: u64,
    genesis: UnitId,
}

impl UnitGraph {
    /// Create a graph containing only the genesis unit.
    pub fn new(genesis: Unit) -> Self {
        let gid = genesis.id;
        let record = UnitRecord {
            unit: genesis,
            level: 0,
            witnessed_level: 0,
            best_parent: None,
            mci: Some(0),
            limci: 0,
            is_on_main_chain: true,
            is_free: true,
            is_stable: true, // genesis is final by definition
            sequence: Sequence::Good,
        };
        let mut records = HashMap::new();
        records.insert(gid, record);
        let mut tips = HashSet::new();
        tips.insert(gid);
        UnitGraph {
            records,
            children: HashMap::new(),
            tips,
            backbone: vec![gid],
            last_stable_mci: 0,
            genesis: gid,
        }
    }

    /// The synthetic genesis unit.
    pub fn genesis_unit() -> Unit {
        Unit {
            id: UnitId(crate::hash_domain(b"keel.genesis", b"keel-mainnet")),
            parents: vec![],
            authors: vec![],
            witnesses: None,
            spends: vec![],
            payload_commitment: [0u8; 32],
            timestamp: 0,
        }
    }

    /// Rebuild a graph from persisted records (bootstrap after restart).
    ///
    /// Children, tips, and the stable backbone prefix are reconstructed from
    /// the records; provisional state for the unstable suffix (MCIs, limcis,
    /// backbone membership) is recomputed by the selector afterwards.
    pub fn restore(records: Vec<UnitRecord>) -> Result<Self, UnitError> {
        let mut genesis = None;
        for rec in &records {
            if rec.unit.parents.is_empty() {
                genesis = Some(rec.unit.id);
            }
        }
        let genesis = genesis.ok_or(UnitError::MissingParent(UnitId([0u8; 32])))?;

        let mut map: HashMap<UnitId, UnitRecord> = HashMap::with_capacity(records.len());
        let mut children: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        for rec in records {
            for p in &rec.unit.parents {
                children.entry(*p).or_default().push(rec.unit.id);
            }
            map.insert(rec.unit.id, rec);
        }
        for list in children.values_mut() {
            list.sort();
        }

        let mut tips = HashSet::new();
        for id in map.keys() {
            if !children.contains_key(id) {
                tips.insert(*id);
            }
        }
        for (id, rec) in map.iter_mut() {
            rec.is_free = tips.contains(id);
            // Provisional fields persisted mid-flight are stale; the
            // selector re-derives them for everything unstable.
            if !rec.is_stable {
                rec.is_on_main_chain = false;
                rec.mci = None;
                rec.limci = 0;
            }
        }

        // Stable backbone prefix, densely numbered from genesis=0
        let mut stable_mc: Vec<(u64, UnitId)> = map
            .values()
            .filter(|r| r.is_stable && r.is_on_main_chain)
            .filter_map(|r| r.mci.map(|m| (m, r.unit.id)))
            .collect();
        stable_mc.sort();
        let mut backbone = Vec::with_capacity(stable_mc.len());
        for (expected, (mci, id)) in stable_mc.iter().enumerate() {
            if *mci != expected as u64 {
                return Err(UnitError::StableMutation(*id));
            }
            backbone.push(*id);
        }
        if backbone.is_empty() {
            return Err(UnitError::StableMutation(genesis));
        }
        let last_stable_mci = (backbone.len() - 1) as u64;

        Ok(UnitGraph {
            records: map,
            children,
            tips,
            backbone,
            last_stable_mci,
            genesis,
        })
    }

    /// Validate and insert a new unit, deriving its record.
    ///
    /// On success the unit is a free tip and its parents are no longer free.
    /// The caller re-runs the main-chain selector afterwards; insertion
    /// itself never renumbers anything.
    pub fn insert(&mut self, unit: Unit, params: &ProtocolParams) -> Result<(), UnitError> {
        let record = self.prepare(unit, params)?;
        self.apply(record);
        Ok(())
    }

    /// Validate a unit and derive its record without mutating the graph.
    ///
    /// Split from `apply` so the coordinator can persist the record first
    /// and refresh this in-memory mirror strictly afterwards.
    pub fn prepare(&self, unit: Unit, params: &ProtocolParams) -> Result<UnitRecord, UnitError> {
        unit.validate_structure(false)?;

        if self.records.contains_key(&unit.id) {
            return Err(UnitError::DuplicateUnit);
        }
        for parent_id in &unit.parents {
            if !self.records.contains_key(parent_id) {
                return Err(UnitError::MissingParent(*parent_id));
            }
        }
        if let Some(declared) = &unit.witnesses {
            if !params.witness_list_matches(declared) {
                return Err(UnitError::WitnessListMismatch);
            }
        }

        let level = 1 + unit
            .parents
            .iter()
            .map(|p| self.records[p].level)
            .max()
            .unwrap_or(0);

        let best_parent = main_chain::pick_best_parent(&self.records, &unit.parents);
        let witness_set = params.witness_set();
        let witnessed_level =
            witness::witnessed_level(&self.records, best_parent, &witness_set, params.majority());

        // Witnessed level must never retreat along the best-parent chain.
        if let Some(bp) = best_parent {
            let bp_wl = self.records[&bp].witnessed_level;
            if witnessed_level < bp_wl {
                return Err(UnitError::WitnessedLevelRetreat {
                    computed: witnessed_level,
                    best_parent: bp_wl,
                });
            }
        }

        Ok(UnitRecord {
            unit,
            level,
            witnessed_level,
            best_parent,
            mci: None,
            limci: 0, // recomputed by the selector
            is_on_main_chain: false,
            is_free: true,
            is_stable: false,
            sequence: Sequence::Good,
        })
    }

    /// Apply a prepared record: the unit becomes a free tip, its parents
    /// stop being free. Infallible by construction: `prepare` has already
    /// validated everything against this snapshot.
    pub fn apply(&mut self, record: UnitRecord) {
        let id = record.unit.id;
        for parent_id in &record.unit.parents {
            let list = self.children.entry(*parent_id).or_default();
            list.push(id);
            list.sort();
            self.tips.remove(parent_id);
            if let Some(parent) = self.records.get_mut(parent_id) {
                parent.is_free = false;
            }
        }
        self.tips.insert(id);
        self.records.insert(id, record);
    }

    pub fn genesis(&self) -> UnitId {
        self.genesis
    }

    pub fn get(&self, id: &UnitId) -> Option<&UnitRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.records.contains_key(id)
    }

    pub fn children(&self, id: &UnitId) -> &[UnitId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Current free tips (units with no children).
    pub fn tips(&self) -> &HashSet<UnitId> {
        &self.tips
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_stable_mci(&self) -> u64 {
        self.last_stable_mci
    }

    /// The backbone unit at `mci`, if that position exists yet.
    pub fn backbone_unit(&self, mci: u64) -> Option<UnitId> {
        self.backbone.get(mci as usize).copied()
    }

    pub fn backbone_len(&self) -> u64 {
        self.backbone.len() as u64
    }

    /// All units assigned to `mci`, sorted by ID (the backbone member plus
    /// every unit it was the first to include).
    pub fn unit_list(&self, mci: u64) -> Vec<UnitId> {
        let mut list: Vec<UnitId> = self
            .records
            .values()
            .filter(|r| r.mci == Some(mci))
            .map(|r| r.unit.id)
            .collect();
        list.sort();
        list
    }

    /// Highest `limci` across the free-unit set; `None` when there are no
    /// free units. Callers must treat `None` explicitly; an empty aggregate
    /// is never folded into a default.
    pub fn max_free_limci(&self) -> Option<u64> {
        self.tips
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.limci)
            .max()
    }

    /// Internal mutable access for the selector and coordinator.
    pub(crate) fn record_mut(&mut self, id: &UnitId) -> Option<&mut UnitRecord> {
        self.records.get_mut(id)
    }

    pub(crate) fn records(&self) -> &HashMap<UnitId, UnitRecord> {
        &self.records
    }

    /// Replace the backbone suffix starting at `from_mci` with `ids`.
    pub(crate) fn splice_backbone(&mut self, from_mci: u64, ids: Vec<UnitId>) {
        self.backbone.truncate(from_mci as usize);
        self.backbone.extend(ids);
    }

    /// Overwrite a record wholesale (post-commit cache refresh). The caller
    /// has already validated every transition it encodes.
    pub(crate) fn replace_record(&mut self, record: UnitRecord) {
        self.records.insert(record.unit.id, record);
    }

    /// Advance the stable boundary. Monotone by construction: the
    /// coordinator stabilizes MCIs strictly in order.
    pub(crate) fn advance_stable_boundary(&mut self, mci: u64) {
        debug_assert!(mci >= self.last_stable_mci);
        self.last_stable_mci = mci;
    }

    /// All ancestors of a unit (transitive parents).
    pub fn ancestors(&self, id: &UnitId) -> HashSet<UnitId> {
        let mut result = HashSet::new();
        let mut stack = vec![*id];
        while let Some(uid) = stack.pop() {
            if let Some(rec) = self.records.get(&uid) {
                for parent in &rec.unit.parents {
                    if result.insert(*parent) {
                        stack.push(*parent);
                    }
                }
            }
        }
        result
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Address;

    fn addr(n: u8) -> Address {
        Address([n; 32])
    }

    fn test_params() -> ProtocolParams {
        ProtocolParams::new(vec![addr(101), addr(102), addr(103)], 2).unwrap()
    }

    fn make_unit(parents: Vec<UnitId>, author: Address) -> Unit {
        let mut parents = parents;
        parents.sort();
        let authors = vec![author];
        let id = Unit::compute_id(&parents, &authors, None, &[], &[0u8; 32]);
        Unit {
            id,
            parents,
            authors,
            witnesses: None,
            spends: vec![],
            payload_commitment: [0u8; 32],
            timestamp: 0,
        }
    }

    #[test]
    fn genesis_graph() {
        let graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();
        assert_eq!(graph.len(), 1);
        assert!(graph.get(&gid).unwrap().is_stable);
        assert!(graph.tips().contains(&gid));
        assert_eq!(graph.backbone_unit(0), Some(gid));
        assert_eq!(graph.last_stable_mci(), 0);
    }

    #[test]
    fn insert_updates_tips_and_children() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();

        let u1 = make_unit(vec![gid], addr(101));
        let u1_id = u1.id;
        graph.insert(u1, &params).unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.tips().contains(&u1_id));
        assert!(!graph.tips().contains(&gid));
        assert!(!graph.get(&gid).unwrap().is_free);
        assert_eq!(graph.children(&gid), &[u1_id]);
        assert_eq!(graph.get(&u1_id).unwrap().level, 1);
        assert_eq!(graph.get(&u1_id).unwrap().best_parent, Some(gid));
    }

    #[test]
    fn missing_parent_rejected() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let u = make_unit(vec![UnitId([99u8; 32])], addr(101));
        assert!(matches!(
            graph.insert(u, &params),
            Err(UnitError::MissingParent(_))
        ));
    }

    #[test]
    fn duplicate_unit_rejected() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();
        let u = make_unit(vec![gid], addr(101));
        graph.insert(u.clone(), &params).unwrap();
        assert_eq!(graph.insert(u, &params), Err(UnitError::DuplicateUnit));
    }

    #[test]
    fn declared_witness_list_must_match() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();

        let parents = vec![gid];
        let authors = vec![addr(101)];
        let witnesses = Some(vec![addr(1), addr(2), addr(3)]);
        let id = Unit::compute_id(
            &parents,
            &authors,
            witnesses.as_deref(),
            &[],
            &[0u8; 32],
        );
        let u = Unit {
            id,
            parents,
            authors,
            witnesses,
            spends: vec![],
            payload_commitment: [0u8; 32],
            timestamp: 0,
        };
        assert_eq!(graph.insert(u, &params), Err(UnitError::WitnessListMismatch));
    }

    #[test]
    fn witnessed_level_advances_with_quorum() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();

        let u1 = make_unit(vec![gid], addr(101));
        let u1_id = u1.id;
        graph.insert(u1, &params).unwrap();
        assert_eq!(graph.get(&u1_id).unwrap().witnessed_level, 0);

        let u2 = make_unit(vec![u1_id], addr(102));
        let u2_id = u2.id;
        graph.insert(u2, &params).unwrap();
        // u2's walk starts at its best parent u1:
        // only 101 is collected, so u2 inherits 0
        assert_eq!(graph.get(&u2_id).unwrap().witnessed_level, 0);

        let u3 = make_unit(vec![u2_id], addr(103));
        let u3_id = u3.id;
        graph.insert(u3, &params).unwrap();
        // chain from u2: authors 102 then 101, quorum of 2 reached at u1 (level 1)
        assert_eq!(graph.get(&u3_id).unwrap().witnessed_level, 1);
    }

    #[test]
    fn genesis_is_the_initial_free_tip() {
        let graph = UnitGraph::new(UnitGraph::genesis_unit());
        assert_eq!(graph.max_free_limci(), Some(0));
    }

    #[test]
    fn ancestors_transitive() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();

        let u1 = make_unit(vec![gid], addr(101));
        let u1_id = u1.id;
        graph.insert(u1, &params).unwrap();
        let u2 = make_unit(vec![u1_id], addr(102));
        let u2_id = u2.id;
        graph.insert(u2, &params).unwrap();

        let anc = graph.ancestors(&u2_id);
        assert!(anc.contains(&u1_id));
        assert!(anc.contains(&gid));
        assert!(!anc.contains(&u2_id));
    }

    #[test]
    fn restore_rebuilds_children_and_tips() {
        let params = test_params();
        let mut graph = UnitGraph::new(UnitGraph::genesis_unit());
        let gid = graph.genesis();
        let u1 = make_unit(vec![gid], addr(101));
        let u1_id = u1.id;
        graph.insert(u1, &params).unwrap();

        let records: Vec<UnitRecord> = graph.records().values().cloned().collect();
        let restored = UnitGraph::restore(records).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.tips().contains(&u1_id));
        assert!(!restored.tips().contains(&gid));
        assert_eq!(restored.backbone_unit(0), Some(gid));
        assert_eq!(restored.children(&gid), &[u1_id]);
    }
}
