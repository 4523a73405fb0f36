//! DLC BTC Attestor Client
//!
//! Forwards signed vault PSBTs to every attestor in the group. The attestors
//! add their half of the 2-of-2 signature and broadcast.
//!
//! Submission is quorum-of-one: it succeeds when at least one attestor
//! accepts the payload and fails only when all of them reject it.
//!
//! # Example
//!
//! ```ignore
//! use dlc_btc_attestor::{AttestorClient, AttestorConfig, FundingPsbtEvent};
//!
//! let client = AttestorClient::new(AttestorConfig::new(vec!["https://attestor-1.example".into()]))?;
//! let report = client
//!     .submit_funding_psbt(&FundingPsbtEvent::new(uuid, &psbt_bytes, mint_address, "evm-arbitrum", alice_pubkey))
//!     .await?;
//! println!("accepted by {} attestors", report.accepted.len());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CREATE_PSBT_EVENT_PATH: &str = "/app/create-psbt-event";
const WITHDRAW_PATH: &str = "/app/withdraw";

/// Errors from attestor submission
#[derive(Error, Debug)]
pub enum AttestorError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No attestor endpoints configured")]
    NoEndpoints,

    #[error("All {} attestors rejected the request: {}", .0.len(), format_rejections(.0))]
    AllRejected(Vec<EndpointRejection>),
}

fn format_rejections(rejections: &[EndpointRejection]) -> String {
    rejections
        .iter()
        .map(|r| format!("{} ({})", r.url, r.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Attestor group endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestorConfig {
    /// Attestor root URLs
    pub urls: Vec<String>,

    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AttestorConfig {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Body of `POST /app/create-psbt-event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingPsbtEvent {
    pub uuid: String,
    /// Hex-encoded signed funding or deposit PSBT
    pub funding_transaction_psbt: String,
    /// Address on the external ledger that receives the minted tokens
    pub mint_address: String,
    /// External ledger identifier, e.g. `evm-arbitrum`
    pub chain: String,
    /// User's taproot public key
    pub alice_pubkey: String,
}

impl FundingPsbtEvent {
    pub fn new(
        uuid: impl Into<String>,
        psbt: &[u8],
        mint_address: impl Into<String>,
        chain: impl Into<String>,
        alice_pubkey: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            funding_transaction_psbt: hex::encode(psbt),
            mint_address: mint_address.into(),
            chain: chain.into(),
            alice_pubkey: alice_pubkey.into(),
        }
    }
}

/// Body of `POST /app/withdraw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawPsbtEvent {
    pub uuid: String,
    /// Hex-encoded withdrawal PSBT carrying the user's signature
    pub wd_psbt: String,
}

impl WithdrawPsbtEvent {
    pub fn new(uuid: impl Into<String>, psbt: &[u8]) -> Self {
        Self {
            uuid: uuid.into(),
            wd_psbt: hex::encode(psbt),
        }
    }
}

/// An attestor that did not accept a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRejection {
    pub url: String,
    pub reason: String,
}

/// Per-endpoint outcome of a successful submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub accepted: Vec<String>,
    pub rejected: Vec<EndpointRejection>,
}

/// HTTP client for the attestor group
pub struct AttestorClient {
    client: reqwest::Client,
    config: AttestorConfig,
}

impl AttestorClient {
    pub fn new(config: AttestorConfig) -> Result<Self, AttestorError> {
        if config.urls.is_empty() {
            return Err(AttestorError::NoEndpoints);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AttestorConfig {
        &self.config
    }

    /// Send a funding or deposit PSBT to every attestor.
    pub async fn submit_funding_psbt(
        &self,
        event: &FundingPsbtEvent,
    ) -> Result<SubmissionReport, AttestorError> {
        self.broadcast(CREATE_PSBT_EVENT_PATH, event).await
    }

    /// Send a withdrawal PSBT to every attestor.
    pub async fn submit_withdraw_psbt(
        &self,
        event: &WithdrawPsbtEvent,
    ) -> Result<SubmissionReport, AttestorError> {
        self.broadcast(WITHDRAW_PATH, event).await
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(format!("status {}: {}", status.as_u16(), text.trim()))
    }

    /// Wait for every attestor, then classify.
    async fn broadcast<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<SubmissionReport, AttestorError> {
        let requests = self.config.urls.iter().map(|root| {
            let url = format!("{}{}", root.trim_end_matches('/'), path);
            async move {
                let outcome = self.post(&url, body).await;
                (url, outcome)
            }
        });
        let outcomes = futures::future::join_all(requests).await;

        let mut report = SubmissionReport::default();
        for (url, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    log::info!("Attestor {} accepted the request", url);
                    report.accepted.push(url);
                }
                Err(reason) => {
                    log::warn!("Attestor {} rejected the request: {}", url, reason);
                    report.rejected.push(EndpointRejection { url, reason });
                }
            }
        }

        if report.accepted.is_empty() {
            return Err(AttestorError::AllRejected(report.rejected));
        }
        Ok(report)
    }
}
