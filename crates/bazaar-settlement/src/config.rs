//! Settlement daemon configuration.
//!
//! Loaded from an optional TOML file layered with `BAZAAR__*` environment
//! variables, e.g. `BAZAAR__LEDGER__URL` or `BAZAAR__COMMISSION__RATE_BPS`.
//! The seed decryption secret is never part of this struct; see
//! [`seed_secret_from_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use bazaar_core::address::{Address, Network};
use bazaar_ledger::LedgerConfig;
use bazaar_wallet::{SeedSecret, WalletDeriver};

use crate::commission::CommissionPolicy;
use crate::error::SettlementError;
use crate::orchestrator::OrchestratorSettings;

pub const ENV_PREFIX: &str = "BAZAAR";
pub const SEED_KEY_VAR: &str = "BAZAAR_SEED_KEY";
pub const SEED_IV_VAR: &str = "BAZAAR_SEED_IV";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionConfig {
    pub rate_bps: u64,
    pub minimum: u64,
    pub treasury: Option<Address>,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self { rate_bps: 200, minimum: 100_000, treasury: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// AES-GCM encrypted master seed, hex.
    pub encrypted_seed_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Root for persistent data. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    pub network: Network,
    pub ledger: LedgerConfig,
    pub commission: CommissionConfig,
    /// Priority fee ceiling per transaction, minor units.
    pub max_priority_fee: Option<u64>,
    pub resume_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub seed: SeedConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            network: Network::Mainnet,
            ledger: LedgerConfig::default(),
            commission: CommissionConfig::default(),
            max_priority_fee: Some(1_000_000),
            resume_interval_secs: 60,
            shutdown_grace_secs: 30,
            seed: SeedConfig::default(),
        }
    }
}

impl SettlementConfig {
    /// Load `path` (if it exists) with environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, SettlementError> {
        Self::load_with(path, env_source())
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self, SettlementError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        builder
            .add_source(env)
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| SettlementError::Config(e.to_string()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bazaar")
                .join(self.network.data_dir_suffix())
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("settlement")
    }

    pub fn resume_interval(&self) -> Duration {
        Duration::from_secs(self.resume_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn commission_policy(&self) -> CommissionPolicy {
        CommissionPolicy {
            rate_bps: self.commission.rate_bps,
            minimum: self.commission.minimum,
            treasury: self.commission.treasury.clone(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            network: self.network,
            max_priority_fee: self.max_priority_fee,
            commission: self.commission_policy(),
        }
    }

    /// Decrypt the master seed with `secret` into a deriver for this network.
    pub fn wallet_deriver(&self, secret: &SeedSecret) -> Result<WalletDeriver, SettlementError> {
        let encrypted = hex::decode(self.seed.encrypted_seed_hex.trim())
            .map_err(|e| SettlementError::Config(format!("encrypted_seed_hex: {e}")))?;
        Ok(WalletDeriver::from_encrypted(&encrypted, secret, self.network)?)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Read the two seed-secret halves from `BAZAAR_SEED_KEY` / `BAZAAR_SEED_IV`.
pub fn seed_secret_from_env() -> Result<SeedSecret, SettlementError> {
    let read = |name: &str| {
        std::env::var(name).map_err(|_| SettlementError::Config(format!("{name} is not set")))
    };
    let key = read(SEED_KEY_VAR)?;
    let iv = read(SEED_IV_VAR)?;
    SeedSecret::from_hex(key.trim(), iv.trim()).map_err(|e| SettlementError::Config(e.to_string()))
}
