//! Configuration for the Keel finality core.
//!
//! Loads optional `keel.toml` from the data directory; defaults are used if
//! the file is absent or unparsable. The witness list and quorum threshold
//! are protocol policy, not algorithm; they are carried here as external
//! parameters rather than hard-coded.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::unit::Address;

/// Protocol policy parameters consumed by the selection/stability pipeline.
#[derive(Clone, Debug)]
pub struct ProtocolParams {
    /// The protocol witness list, sorted ascending
    witnesses: Vec<Address>,
    /// Distinct witness authors required for the witnessed level to advance
    majority: usize,
    /// Attempts allowed for one catchup session before discard
    pub catchup_max_attempts: u32,
    /// Age in seconds after which pending catchup state is discarded
    pub catchup_max_age_secs: u64,
}

impl ProtocolParams {
    /// Build parameters from an explicit witness list and quorum.
    ///
    /// The quorum must be a strict majority of the list: anything weaker
    /// lets two disjoint author sets both advance witnessed levels.
    pub fn new(mut witnesses: Vec<Address>, majority: usize) -> Result<Self, ConfigError> {
        witnesses.sort();
        witnesses.dedup();
        if witnesses.is_empty() {
            return Err(ConfigError::EmptyWitnessList);
        }
        if majority == 0 || majority > witnesses.len() || majority * 2 <= witnesses.len() {
            return Err(ConfigError::InvalidMajority {
                majority,
                witnesses: witnesses.len(),
            });
        }
        Ok(ProtocolParams {
            witnesses,
            majority,
            catchup_max_attempts: crate::constants::CATCHUP_MAX_ATTEMPTS,
            catchup_max_age_secs: crate::constants::CATCHUP_MAX_AGE_SECS,
        })
    }

    pub fn witnesses(&self) -> &[Address] {
        &self.witnesses
    }

    pub fn witness_set(&self) -> HashSet<Address> {
        self.witnesses.iter().copied().collect()
    }

    pub fn majority(&self) -> usize {
        self.majority
    }

    /// True if `declared` matches the protocol list exactly.
    pub fn witness_list_matches(&self, declared: &[Address]) -> bool {
        declared == self.witnesses.as_slice()
    }
}

/// On-disk configuration file shape.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub protocol: ProtocolSection,
    pub catchup: CatchupSection,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    /// Witness addresses as 64-char hex strings
    pub witnesses: Vec<String>,
    pub witness_majority: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        ProtocolSection {
            witnesses: vec![],
            witness_majority: crate::constants::WITNESS_MAJORITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CatchupSection {
    pub max_attempts: u32,
    pub max_age_secs: u64,
}

impl Default for CatchupSection {
    fn default() -> Self {
        CatchupSection {
            max_attempts: crate::constants::CATCHUP_MAX_ATTEMPTS,
            max_age_secs: crate::constants::CATCHUP_MAX_AGE_SECS,
        }
    }
}

impl KeelConfig {
    /// Load configuration from `keel.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("keel.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Resolve the file contents into validated protocol parameters.
    pub fn protocol_params(&self) -> Result<ProtocolParams, ConfigError> {
        let mut witnesses = Vec::with_capacity(self.protocol.witnesses.len());
        for w in &self.protocol.witnesses {
            let bytes = hex::decode(w).map_err(|_| ConfigError::BadWitnessAddress(w.clone()))?;
            let hash: crate::Hash = bytes
                .try_into()
                .map_err(|_| ConfigError::BadWitnessAddress(w.clone()))?;
            witnesses.push(Address(hash));
        }
        let mut params = ProtocolParams::new(witnesses, self.protocol.witness_majority)?;
        params.catchup_max_attempts = self.catchup.max_attempts;
        params.catchup_max_age_secs = self.catchup.max_age_secs;
        Ok(params)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("witness list is empty")]
    EmptyWitnessList,
    #[error("majority {majority} is not a strict majority of {witnesses} witnesses")]
    InvalidMajority { majority: usize, witnesses: usize },
    #[error("witness address is not 32-byte hex: {0}")]
    BadWitnessAddress(String),
}
