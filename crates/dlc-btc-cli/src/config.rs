//! CLI configuration, parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use bitcoin::Network;
use dlc_btc_attestor::AttestorConfig;
use dlc_btc_esplora::EsploraConfig;
use dlc_btc_vault::{AttestorGroupKey, FundingPaymentType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Top-level CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub bitcoin: BitcoinSection,

    /// Vault and wallet parameters
    pub vault: VaultSection,

    #[serde(default)]
    pub attestors: AttestorsSection,

    #[serde(default)]
    pub cli: CliSection,
}

/// Bitcoin network and block explorer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// Bitcoin network: "bitcoin", "testnet", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Esplora API root; defaults to mempool.space for the network
    pub esplora_url: Option<String>,

    /// mempool.space host for fee endpoints; defaults per network
    pub fee_api_url: Option<String>,

    /// Scale applied to every fee-rate signal
    #[serde(default = "default_fee_rate_multiplier")]
    pub fee_rate_multiplier: f64,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            esplora_url: None,
            fee_api_url: None,
            fee_rate_multiplier: default_fee_rate_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSection {
    /// Attestor group key: xpub/tpub, or a compressed / x-only key in hex
    pub attestor_group_key: String,

    /// "wpkh" or "tr"
    #[serde(default = "default_funding_type")]
    pub funding_type: String,

    #[serde(default)]
    pub account_index: u32,

    #[serde(default)]
    pub address_index: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestorsSection {
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default = "default_attestor_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliSection {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CliSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_fee_rate_multiplier() -> f64 {
    1.0
}

fn default_funding_type() -> String {
    "wpkh".to_string()
}

fn default_attestor_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `DLC_BTC_NETWORK`
    /// - `DLC_BTC_ESPLORA_URL`
    /// - `DLC_BTC_FEE_API_URL`
    /// - `DLC_BTC_FEE_RATE_MULTIPLIER`
    /// - `DLC_BTC_ATTESTOR_GROUP_KEY`
    /// - `DLC_BTC_ATTESTOR_URLS` (comma separated)
    /// - `DLC_BTC_LOG_LEVEL`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DLC_BTC_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("DLC_BTC_ESPLORA_URL") {
            self.bitcoin.esplora_url = Some(v);
        }
        if let Ok(v) = std::env::var("DLC_BTC_FEE_API_URL") {
            self.bitcoin.fee_api_url = Some(v);
        }
        if let Ok(v) = std::env::var("DLC_BTC_FEE_RATE_MULTIPLIER") {
            if let Ok(multiplier) = v.parse::<f64>() {
                self.bitcoin.fee_rate_multiplier = multiplier;
            }
        }
        if let Ok(v) = std::env::var("DLC_BTC_ATTESTOR_GROUP_KEY") {
            self.vault.attestor_group_key = v;
        }
        if let Ok(v) = std::env::var("DLC_BTC_ATTESTOR_URLS") {
            self.attestors.urls = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("DLC_BTC_LOG_LEVEL") {
            self.cli.log_level = v;
        }
    }

    /// Parse the bitcoin network string to a `bitcoin::Network`.
    pub fn network(&self) -> Network {
        match self.bitcoin.network.as_str() {
            "testnet" | "testnet3" => Network::Testnet,
            "signet" => Network::Signet,
            "regtest" => Network::Regtest,
            _ => Network::Bitcoin,
        }
    }

    pub fn attestor_group_key(&self) -> Result<AttestorGroupKey> {
        AttestorGroupKey::from_str(&self.vault.attestor_group_key)
            .context("vault.attestor_group_key is not a valid key")
    }

    pub fn funding_type(&self) -> Result<FundingPaymentType> {
        FundingPaymentType::from_str(&self.vault.funding_type)
            .context("vault.funding_type must be \"wpkh\" or \"tr\"")
    }

    /// Explorer endpoints, network defaults filled in.
    pub fn esplora_config(&self) -> EsploraConfig {
        let mut config = EsploraConfig::for_network(self.network());
        if let Some(ref url) = self.bitcoin.esplora_url {
            config.api_url = url.clone();
        }
        if let Some(ref url) = self.bitcoin.fee_api_url {
            config.fee_api_url = url.clone();
        }
        config
    }

    pub fn attestor_config(&self) -> AttestorConfig {
        AttestorConfig {
            urls: self.attestors.urls.clone(),
            request_timeout_secs: self.attestors.request_timeout_secs,
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            matches!(
                self.bitcoin.network.as_str(),
                "bitcoin" | "testnet" | "testnet3" | "signet" | "regtest"
            ),
            "bitcoin.network must be one of bitcoin, testnet, signet, regtest"
        );

        anyhow::ensure!(
            self.bitcoin.fee_rate_multiplier.is_finite() && self.bitcoin.fee_rate_multiplier > 0.0,
            "bitcoin.fee_rate_multiplier must be > 0"
        );

        self.attestor_group_key()?;
        self.funding_type()?;

        for url in &self.attestors.urls {
            anyhow::ensure!(
                url.starts_with("http://") || url.starts_with("https://"),
                "attestor url {} must be http(s)",
                url
            );
        }

        anyhow::ensure!(
            self.attestors.request_timeout_secs > 0,
            "attestors.request_timeout_secs must be > 0"
        );

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
