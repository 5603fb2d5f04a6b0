use std::fs;
use std::path::{Path, PathBuf};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub consensus: ConsensusParams,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.data_dir.join("history")
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/miner.toml"),
            mining: MiningConfig::default(),
            consensus: ConsensusParams::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiningConfig {
    pub enabled: bool,
    /// Worker threads iterating nonces.
    pub workers: usize,
    /// Unix millis before which mining stays idle; 0 starts immediately.
    pub start_time_ms: u64,
    /// Allow producing a genesis block on an empty chain.
    pub offline_generation: bool,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            start_time_ms: 0,
            offline_generation: false,
        }
    }
}

/// Protocol constants. Every node on a network must agree on these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Desired interval between blocks, in seconds.
    pub block_interval_secs: u64,
    /// Difficulty retarget window, in blocks.
    pub epoch_length: u32,
    /// Leading zero bits of the initial PoW target.
    pub initial_target_bits: u32,
    /// Serialized block payload budget, in bytes.
    pub max_block_size: usize,
    /// Bytes reserved out of `max_block_size` for the coinbase transaction.
    pub coinbase_reservation: usize,
    /// Mempool capacity, in transactions.
    pub mempool_capacity: usize,
    /// Committed state versions retained for rollback.
    pub keep_versions: usize,
    /// Minimum fee for non-coinbase transactions.
    pub min_fee: u64,
    /// Accepted clock skew for header timestamps, in milliseconds.
    pub max_time_skew_ms: u64,
    /// Emission at height 0; halves every `halving_interval` blocks.
    pub initial_emission: u64,
    pub halving_interval: u32,
    /// Blocks before a freshly minted coinbase box can be spent.
    pub coinbase_maturity: u32,
    /// Header ids carried in a sync message.
    pub sync_info_len: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            block_interval_secs: 30,
            epoch_length: 100,
            initial_target_bits: 20,
            max_block_size: 512 * 1024,
            coinbase_reservation: 4 * 1024,
            mempool_capacity: 8_192,
            keep_versions: 10,
            min_fee: 1,
            max_time_skew_ms: 90_000,
            initial_emission: 2_000_000_000,
            halving_interval: 200_000,
            coinbase_maturity: 10,
            sync_info_len: 10,
        }
    }
}

impl ConsensusParams {
    /// PoW target for the first blocks; higher is easier.
    pub fn initial_difficulty(&self) -> U256 {
        U256::MAX >> self.initial_target_bits
    }

    /// Coin supply created by the coinbase of a block at `height`.
    pub fn supply_at(&self, height: u32) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= 63 {
            return 0;
        }
        self.initial_emission >> halvings
    }

    pub fn payload_budget(&self) -> usize {
        self.max_block_size.saturating_sub(self.coinbase_reservation)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    /// Pinned genesis timestamp (unix millis); 0 means "now" when the node
    /// mines its own genesis.
    pub timestamp_ms: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "cinder-local".to_string(),
            timestamp_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supply_halves_on_schedule() {
        let mut params = ConsensusParams::default();
        params.initial_emission = 1_000;
        params.halving_interval = 10;
        assert_eq!(params.supply_at(0), 1_000);
        assert_eq!(params.supply_at(9), 1_000);
        assert_eq!(params.supply_at(10), 500);
        assert_eq!(params.supply_at(25), 250);
        assert_eq!(params.supply_at(10 * 70), 0);
    }

    #[test]
    fn config_roundtrip() {
        let config = NodeConfig::default();
        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: NodeConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.consensus.keep_versions, config.consensus.keep_versions);
        assert_eq!(decoded.genesis.chain_id, config.genesis.chain_id);
    }
}
