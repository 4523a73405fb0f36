//! DLC BTC Esplora Client
//!
//! Provides Bitcoin network access via an Esplora-compatible REST API
//! (mempool.space, blockstream.info, a local electrs) for:
//! - UTXO discovery (funding and deposit payments)
//! - Transaction lookup and confirmation status (vault transactions, proof of reserve)
//! - Transaction broadcasting
//! - Fee-rate signals (see [`fees`])
//!
//! The engine talks to the chain only through the [`BlockchainApi`] trait, so
//! tests and alternative backends can stand in for [`EsploraClient`].
//!
//! # Example
//!
//! ```ignore
//! use dlc_btc_esplora::{EsploraClient, EsploraConfig};
//! use bitcoin::Network;
//!
//! let client = EsploraClient::new(EsploraConfig::for_network(Network::Bitcoin), Network::Bitcoin)?;
//! let height = client.tip_height().await?;
//! println!("Current block height: {}", height);
//! ```

pub mod fees;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Address, Network, Transaction, Txid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fees::{BlockFeeRates, MempoolBlock, RecommendedFees};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from Esplora operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),
}

/// Endpoints for one deployment.
///
/// `api_url` is the Esplora root (e.g. `https://mempool.space/api`), while
/// `fee_api_url` is the mempool.space host serving `/api/v1/...` fee data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsploraConfig {
    pub api_url: String,
    pub fee_api_url: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl EsploraConfig {
    /// Public endpoints for a network. Regtest points at a local electrs.
    pub fn for_network(network: Network) -> Self {
        let (api_url, fee_api_url) = match network {
            Network::Bitcoin => ("https://mempool.space/api", "https://mempool.space"),
            Network::Testnet => (
                "https://mempool.space/testnet/api",
                "https://mempool.space/testnet",
            ),
            Network::Signet => (
                "https://mempool.space/signet/api",
                "https://mempool.space/signet",
            ),
            _ => ("http://127.0.0.1:3002", "http://127.0.0.1:3002"),
        };
        Self {
            api_url: api_url.to_string(),
            fee_api_url: fee_api_url.to_string(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Confirmation status of a transaction as reported by Esplora.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u32>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_time: Option<u64>,
}

/// An unspent output of an address, as returned by `GET /address/:address/utxo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUtxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
    pub status: TxStatus,
}

/// Read-mostly view of the Bitcoin chain used by the vault engine.
///
/// Only [`BlockchainApi::broadcast`] mutates anything.
#[async_trait]
pub trait BlockchainApi: Send + Sync {
    /// Network this API serves
    fn network(&self) -> Network;

    /// Unspent outputs currently paying to `address`
    async fn address_utxos(&self, address: &Address) -> Result<Vec<AddressUtxo>, Error>;

    /// Full transaction by id
    async fn transaction(&self, txid: &Txid) -> Result<Transaction, Error>;

    /// Confirmation status of a transaction
    async fn transaction_status(&self, txid: &Txid) -> Result<TxStatus, Error>;

    /// Current chain tip height
    async fn tip_height(&self) -> Result<u32, Error>;

    /// Broadcast a fully signed transaction, returning its txid
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error>;

    /// Per-block fee statistics for the last 24 hours, oldest first
    async fn block_fee_rates(&self) -> Result<Vec<BlockFeeRates>, Error>;

    /// Projected mempool blocks, next block first
    async fn mempool_blocks(&self) -> Result<Vec<MempoolBlock>, Error>;

    /// Recommended fee rates
    async fn recommended_fees(&self) -> Result<RecommendedFees, Error>;
}

/// Esplora REST client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: reqwest::Client,
    config: EsploraConfig,
    network: Network,
}

impl EsploraClient {
    /// Create a new client for the given endpoints.
    pub fn new(config: EsploraConfig, network: Network) -> Result<Self, Error> {
        if network == Network::Bitcoin && !config.api_url.starts_with("https://") {
            log::warn!("Esplora API on mainnet without TLS: {}", config.api_url);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            network,
        })
    }

    /// Endpoints this client was built with
    pub fn config(&self) -> &EsploraConfig {
        &self.config
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn fee_api(&self, path: &str) -> String {
        format!("{}{}", self.config.fee_api_url.trim_end_matches('/'), path)
    }

    async fn get_text(&self, url: String) -> Result<String, Error> {
        log::debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, Error> {
        let body = self.get_text(url.clone()).await?;
        serde_json::from_str(&body).map_err(|e| Error::Decode {
            url,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl BlockchainApi for EsploraClient {
    fn network(&self) -> Network {
        self.network
    }

    async fn address_utxos(&self, address: &Address) -> Result<Vec<AddressUtxo>, Error> {
        self.get_json(self.api(&format!("/address/{}/utxo", address)))
            .await
    }

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, Error> {
        let url = self.api(&format!("/tx/{}/hex", txid));
        let body = match self.get_text(url.clone()).await {
            Ok(body) => body,
            Err(Error::Status { status: 404, .. }) => return Err(Error::TxNotFound(*txid)),
            Err(e) => return Err(e),
        };
        decode_transaction_hex(&url, body.trim())
    }

    async fn transaction_status(&self, txid: &Txid) -> Result<TxStatus, Error> {
        match self
            .get_json(self.api(&format!("/tx/{}/status", txid)))
            .await
        {
            Err(Error::Status { status: 404, .. }) => Err(Error::TxNotFound(*txid)),
            other => other,
        }
    }

    async fn tip_height(&self) -> Result<u32, Error> {
        let url = self.api("/blocks/tip/height");
        let body = self.get_text(url.clone()).await?;
        body.trim().parse::<u32>().map_err(|e| Error::Decode {
            url,
            reason: e.to_string(),
        })
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
        let url = self.api("/tx");
        let response = self
            .client
            .post(&url)
            .body(bitcoin::consensus::encode::serialize_hex(tx))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::BroadcastFailed(format!("{}: {}", status, body)));
        }
        let txid = Txid::from_str(body.trim()).map_err(|e| Error::Decode {
            url,
            reason: e.to_string(),
        })?;
        log::info!("Broadcast transaction {}", txid);
        Ok(txid)
    }

    async fn block_fee_rates(&self) -> Result<Vec<BlockFeeRates>, Error> {
        self.get_json(self.fee_api(fees::BLOCK_FEE_RATES_PATH)).await
    }

    async fn mempool_blocks(&self) -> Result<Vec<MempoolBlock>, Error> {
        self.get_json(self.fee_api(fees::MEMPOOL_BLOCKS_PATH)).await
    }

    async fn recommended_fees(&self) -> Result<RecommendedFees, Error> {
        self.get_json(self.fee_api(fees::RECOMMENDED_FEES_PATH)).await
    }
}

fn decode_transaction_hex(url: &str, hex_str: &str) -> Result<Transaction, Error> {
    let bytes = hex::decode(hex_str).map_err(|e| Error::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    bitcoin::consensus::deserialize(&bytes).map_err(|e| Error::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
