//! Durable graph store.
//!
//! The pipeline consumes storage only through the `GraphStore` trait; the
//! sled-backed implementation is the default. `commit_batch` is atomic
//! (every write in the batch lands or none do) and it enforces the
//! durable invariants that must survive any caller bug: stable records are
//! frozen, a spent resource keeps its spender, and a commission winner is
//! attributed at most once.
//!
//! Layout: unit records live in the `units` tree keyed by unit ID; the
//! `state` tree holds everything else under key prefixes (`free/` index,
//! `spent/` winners, `comm/` attributions, `meta/` pointers) so one
//! two-tree transaction covers a whole cascade.

use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};

use crate::unit::{ResourceId, UnitId, UnitRecord};

const FREE_PREFIX: &[u8] = b"free/";
const SPENT_PREFIX: &[u8] = b"spent/";
const COMM_PREFIX: &[u8] = b"comm/";
const LAST_STABLE_KEY: &[u8] = b"meta/last_stable";

/// Errors from store operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O failure or lock contention; the step may be retried.
    #[error("store I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A batch tried to violate a durable invariant; nothing was applied.
    #[error("durable invariant violated: {0}")]
    InvariantViolated(String),
}

/// One write in an atomic batch.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Insert or update a unit record (refreshes the free index).
    UpsertUnit(UnitRecord),
    /// Advance the stable boundary pointer.
    SetLastStable { mci: u64, unit: UnitId },
    /// Record the resolved spender of a resource.
    MarkSpent { resource: ResourceId, winner: UnitId },
    /// Attribute a parent's commission; at most once per parent.
    SetCommissionWinner { parent: UnitId, winner: UnitId },
}

/// An ordered, all-or-nothing set of writes.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Read/write access to the persistent unit graph.
pub trait GraphStore {
    fn get_unit(&self, id: &UnitId) -> Result<Option<UnitRecord>, StoreError>;
    fn get_parents(&self, id: &UnitId) -> Result<Option<Vec<UnitId>>, StoreError>;
    fn get_free_units(&self) -> Result<Vec<UnitId>, StoreError>;
    /// Every persisted unit record (bootstrap/restore path).
    fn load_units(&self) -> Result<Vec<UnitRecord>, StoreError>;
    /// Apply a batch atomically: all writes or none.
    fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
    fn read_last_stable(&self) -> Result<Option<(UnitId, u64)>, StoreError>;
    fn get_commission_winner(&self, parent: &UnitId) -> Result<Option<UnitId>, StoreError>;
    fn get_spender(&self, resource: &ResourceId) -> Result<Option<UnitId>, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

/// Sled-backed store implementation.
pub struct SledGraphStore {
    #[allow(dead_code)]
    db: sled::Db,
    units: sled::Tree,
    state: sled::Tree,
}

impl SledGraphStore {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StoreError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let units = db
            .open_tree("units")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let state = db
            .open_tree("state")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(SledGraphStore { db, units, state })
    }

    fn read_id_value(&self, key: Vec<u8>) -> Result<Option<UnitId>, StoreError> {
        match self
            .state
            .get(key)
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let hash: crate::Hash = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("bad unit-id value".into()))?;
                Ok(Some(UnitId(hash)))
            }
            None => Ok(None),
        }
    }
}

fn prefixed(prefix: &[u8], hash: &crate::Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + hash.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(hash);
    key
}

type TxTree = sled::transaction::TransactionalTree;
type TxError = ConflictableTransactionError<StoreError>;

fn tx_abort(msg: String) -> TxError {
    ConflictableTransactionError::Abort(StoreError::InvariantViolated(msg))
}

fn tx_serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, TxError> {
    crate::serialize(val)
        .map_err(|e| ConflictableTransactionError::Abort(StoreError::Serialization(e.to_string())))
}

fn tx_deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, TxError> {
    crate::deserialize(bytes)
        .map_err(|e| ConflictableTransactionError::Abort(StoreError::Serialization(e.to_string())))
}

fn apply_upsert(units: &TxTree, state: &TxTree, record: &UnitRecord) -> Result<(), TxError> {
    let id = record.unit.id;
    if let Some(old_bytes) = units.get(id.0)? {
        let old: UnitRecord = tx_deserialize(&old_bytes)?;
        if old.is_stable
            && (old.mci != record.mci || old.sequence != record.sequence || !record.is_stable)
        {
            return Err(tx_abort(format!(
                "stable unit {} may not be rewritten",
                id.to_hex()
            )));
        }
    }
    let value = tx_serialize(record)?;
    units.insert(id.0.as_slice(), value)?;
    let free_key = prefixed(FREE_PREFIX, &id.0);
    if record.is_free {
        state.insert(free_key, vec![1u8])?;
    } else {
        state.remove(free_key)?;
    }
    Ok(())
}

/// Insert `winner` under `key` unless a *different* winner is already
/// recorded; the existing value always stands.
fn write_once_id(state: &TxTree, key: Vec<u8>, winner: &UnitId, what: &str) -> Result<(), TxError> {
    if let Some(existing) = state.get(&key)? {
        if existing.as_ref() != winner.0 {
            return Err(tx_abort(format!("{what} already recorded differently")));
        }
    }
    state.insert(key, winner.0.to_vec())?;
    Ok(())
}

impl GraphStore for SledGraphStore {
    fn get_unit(&self, id: &UnitId) -> Result<Option<UnitRecord>, StoreError> {
        match self
            .units
            .get(id.0)
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let record = crate::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn get_parents(&self, id: &UnitId) -> Result<Option<Vec<UnitId>>, StoreError> {
        Ok(self.get_unit(id)?.map(|r| r.unit.parents))
    }

    fn get_free_units(&self) -> Result<Vec<UnitId>, StoreError> {
        let mut out = Vec::new();
        for entry in self.state.scan_prefix(FREE_PREFIX) {
            let (key, _) = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            let hash: crate::Hash = key[FREE_PREFIX.len()..]
                .try_into()
                .map_err(|_| StoreError::Serialization("invalid free-index key".into()))?;
            out.push(UnitId(hash));
        }
        Ok(out)
    }

    fn load_units(&self) -> Result<Vec<UnitRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in self.units.iter() {
            let (_, value) = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            let record: UnitRecord = crate::deserialize(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let result = (&self.units, &self.state).transaction(|(units, state)| {
            for op in &batch.ops {
                match op {
                    WriteOp::UpsertUnit(record) => apply_upsert(units, state, record)?,
                    WriteOp::SetLastStable { mci, unit } => {
                        let mut value = Vec::with_capacity(40);
                        value.extend_from_slice(&mci.to_be_bytes());
                        value.extend_from_slice(&unit.0);
                        state.insert(LAST_STABLE_KEY, value)?;
                    }
                    WriteOp::MarkSpent { resource, winner } => {
                        let key = prefixed(SPENT_PREFIX, &resource.0);
                        write_once_id(state, key, winner, "resource spender")?;
                    }
                    WriteOp::SetCommissionWinner { parent, winner } => {
                        let key = prefixed(COMM_PREFIX, &parent.0);
                        write_once_id(state, key, winner, "commission winner")?;
                    }
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn read_last_stable(&self) -> Result<Option<(UnitId, u64)>, StoreError> {
        match self
            .state
            .get(LAST_STABLE_KEY)
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(bytes) => {
                if bytes.len() != 40 {
                    return Err(StoreError::Serialization("bad last_stable record".into()));
                }
                let mci = u64::from_be_bytes(
                    bytes[..8]
                        .try_into()
                        .map_err(|_| StoreError::Serialization("bad last_stable mci".into()))?,
                );
                let hash: crate::Hash = bytes[8..]
                    .try_into()
                    .map_err(|_| StoreError::Serialization("bad last_stable unit".into()))?;
                Ok(Some((UnitId(hash), mci)))
            }
            None => Ok(None),
        }
    }

    fn get_commission_winner(&self, parent: &UnitId) -> Result<Option<UnitId>, StoreError> {
        self.read_id_value(prefixed(COMM_PREFIX, &parent.0))
    }

    fn get_spender(&self, resource: &ResourceId) -> Result<Option<UnitId>, StoreError> {
        self.read_id_value(prefixed(SPENT_PREFIX, &resource.0))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}
