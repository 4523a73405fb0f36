//! Watch-only backend for wallets whose keys are held elsewhere.
//!
//! The custodian hands over the already-derived funding and taproot public
//! keys. Payments can be built from them, but signing happens outside.

use bitcoin::bip32::DerivationPath;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;

use super::{SessionKeys, VaultSession};
use crate::error::VaultError;
use crate::types::{FundingPaymentType, TransactionType};

pub struct CustodialSigner {
    network: Network,
    funding_type: FundingPaymentType,
    funding_public_key: PublicKey,
    taproot_public_key: PublicKey,
}

impl CustodialSigner {
    pub fn new(
        network: Network,
        funding_type: FundingPaymentType,
        funding_public_key: PublicKey,
        taproot_public_key: PublicKey,
    ) -> Self {
        Self {
            network,
            funding_type,
            funding_public_key,
            taproot_public_key,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Keys without origin information; the custodian's paths are unknown.
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

    pub fn sign_psbt(
        &self,
        _session: &VaultSession,
        _psbt: Psbt,
        kind: TransactionType,
    ) -> Result<Psbt, VaultError> {
        Err(VaultError::SignatureGenerationFailed(format!(
            "custodial wallet cannot sign {:?} PSBTs locally",
            kind
        )))
    }
}
