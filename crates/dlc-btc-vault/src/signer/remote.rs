//! Remote MPC signing backend.
//!
//! The PSBT is handed to a remote signing ceremony as hex. Once the service
//! reports it signed, the returned PSBT is checked against the one submitted
//! and finalized locally under the usual rules.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use super::{classify_inputs, finalize_inputs, SessionKeys, VaultSession};
use crate::error::VaultError;
use crate::types::{FundingPaymentType, TransactionType};

/// Polling limits for a remote ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSignerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_polls() -> u32 {
    90
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
        }
    }
}

/// State of a submitted signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSignStatus {
    /// Signed PSBT, hex encoded
    Signed(String),
    Pending,
    Failed(String),
}

#[async_trait]
pub trait RemoteSigningService: Send + Sync {
    /// Submit a hex PSBT, returning a request id.
    async fn submit(&self, psbt_hex: &str) -> Result<String, VaultError>;

    async fn poll(&self, request_id: &str) -> Result<RemoteSignStatus, VaultError>;
}

pub struct RemoteMpcSigner {
    service: Arc<dyn RemoteSigningService>,
    config: RemoteSignerConfig,
    network: Network,
    funding_type: FundingPaymentType,
    funding_public_key: PublicKey,
    taproot_public_key: PublicKey,
}

impl RemoteMpcSigner {
    pub fn new(
        service: Arc<dyn RemoteSigningService>,
        config: RemoteSignerConfig,
        network: Network,
        funding_type: FundingPaymentType,
        funding_public_key: PublicKey,
        taproot_public_key: PublicKey,
    ) -> Self {
        Self {
            service,
            config,
            network,
            funding_type,
            funding_public_key,
            taproot_public_key,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn session_keys(&self) -> SessionKeys {
        SessionKeys {
            funding_type: self.funding_type,
            funding_public_key: self.funding_public_key,
            multisig_public_key: self.taproot_public_key,
            funding_derivation_path: DerivationPath::master(),
            multisig_derivation_path: DerivationPath::master(),
            master_fingerprint: None,
        }
    }

    async fn await_signed(&self, request_id: &str) -> Result<String, VaultError> {
        for attempt in 0..self.config.max_polls {
            match self.service.poll(request_id).await? {
                RemoteSignStatus::Signed(hex) => return Ok(hex),
                RemoteSignStatus::Failed(reason) => {
                    return Err(VaultError::SignatureGenerationFailed(format!(
                        "remote signing request {} failed: {}",
                        request_id, reason
                    )))
                }
                RemoteSignStatus::Pending => {
                    log::debug!("Remote signing request {} pending (poll {})", request_id, attempt + 1);
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
            }
        }
        Err(VaultError::SignatureGenerationFailed(format!(
            "remote signing request {} not completed after {} polls",
            request_id, self.config.max_polls
        )))
    }

    pub async fn sign_psbt(
        &self,
        session: &VaultSession,
        psbt: Psbt,
        kind: TransactionType,
    ) -> Result<Psbt, VaultError> {
        let request_id = self
            .service
            .submit(&hex::encode(psbt.serialize()))
            .await?;
        log::info!("Submitted {:?} PSBT for remote signing as {}", kind, request_id);

        let signed_hex = self.await_signed(&request_id).await?;
        let bytes = hex::decode(signed_hex.trim())
            .map_err(|e| VaultError::RemoteSigner(format!("signed PSBT is not hex: {}", e)))?;
        let mut signed = Psbt::deserialize(&bytes)
            .map_err(|e| VaultError::RemoteSigner(format!("signed PSBT is malformed: {}", e)))?;

        if signed.unsigned_tx.compute_txid() != psbt.unsigned_tx.compute_txid() {
            return Err(VaultError::RemoteSigner(
                "remote signer returned a different transaction".into(),
            ));
        }

        let configs = classify_inputs(&signed, session);
        finalize_inputs(&mut signed, session, &configs, kind)?;
        Ok(signed)
    }
}
