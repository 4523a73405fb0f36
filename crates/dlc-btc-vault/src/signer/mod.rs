//! Signing backends.
//!
//! Every backend derives the same [`PaymentInformation`] for a vault and
//! follows the same rules for which inputs it signs and finalizes:
//!
//! | PSBT     | signs                       | finalizes       |
//! |----------|-----------------------------|-----------------|
//! | funding  | funding inputs              | funding inputs  |
//! | deposit  | funding and multisig inputs | funding inputs  |
//! | withdraw | multisig inputs             | nothing         |
//!
//! Multisig inputs are never finalized locally; the attestors add the second
//! signature.

pub mod custodial;
pub mod hardware_wallet;
pub mod private_key;
pub mod remote;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Network, Witness, XOnlyPublicKey};

use crate::error::VaultError;
use crate::keys::AttestorGroupKey;
use crate::payment::{funding_payment, multisig_payment_for_vault};
use crate::types::{FundingPaymentType, PaymentInformation, TransactionType, VaultUuid};

pub use custodial::CustodialSigner;
pub use hardware_wallet::{
    HardwareWalletSigner, HardwareWalletTransport, PartialSignature, RegisteredWalletPolicy,
    WalletPolicy,
};
pub use private_key::PrivateKeySigner;
pub use remote::{RemoteMpcSigner, RemoteSignStatus, RemoteSignerConfig, RemoteSigningService};

/// Public keys and origins a backend contributes to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub funding_type: FundingPaymentType,
    pub funding_public_key: PublicKey,
    pub multisig_public_key: PublicKey,
    pub funding_derivation_path: DerivationPath,
    pub multisig_derivation_path: DerivationPath,
    /// Known only to backends holding the root key
    pub master_fingerprint: Option<Fingerprint>,
}

/// Immutable signing context for one vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSession {
    pub uuid: VaultUuid,
    pub network: Network,
    pub attestor_group_key: AttestorGroupKey,
    pub keys: SessionKeys,
    pub payment: PaymentInformation,
    /// Set by hardware wallets once the multisig policy is registered
    pub wallet_policy: Option<RegisteredWalletPolicy>,
}

impl VaultSession {
    pub fn new(
        uuid: VaultUuid,
        network: Network,
        attestor_group_key: AttestorGroupKey,
        keys: SessionKeys,
    ) -> Result<Self, VaultError> {
        let user_key = keys.multisig_public_key.x_only_public_key().0;
        let multisig_payment = multisig_payment_for_vault(&uuid, &attestor_group_key, &user_key, network)?;
        let funding_payment = funding_payment(&keys.funding_public_key, keys.funding_type, network);

        Ok(Self {
            uuid,
            network,
            attestor_group_key,
            keys,
            payment: PaymentInformation {
                funding_payment,
                multisig_payment,
            },
            wallet_policy: None,
        })
    }

    /// The user's key inside the multisig leaf.
    pub fn user_multisig_key(&self) -> XOnlyPublicKey {
        self.keys.multisig_public_key.x_only_public_key().0
    }
}

/// How one PSBT input is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitcoinInputSigningConfig {
    pub input_index: usize,
    pub derivation_path: DerivationPath,
    pub is_multisig_input: bool,
}

/// Match every input against the session's funding and multisig scripts.
///
/// Inputs paying neither script, or without a witness UTXO, belong to
/// someone else and are left out.
pub fn classify_inputs(psbt: &Psbt, session: &VaultSession) -> Vec<BitcoinInputSigningConfig> {
    let funding_script = session.payment.funding_payment.script_pubkey();
    let multisig_script = session.payment.multisig_payment.script_pubkey();

    psbt.inputs
        .iter()
        .enumerate()
        .filter_map(|(input_index, input)| {
            let script = &input.witness_utxo.as_ref()?.script_pubkey;
            if *script == multisig_script {
                Some(BitcoinInputSigningConfig {
                    input_index,
                    derivation_path: session.keys.multisig_derivation_path.clone(),
                    is_multisig_input: true,
                })
            } else if *script == funding_script {
                Some(BitcoinInputSigningConfig {
                    input_index,
                    derivation_path: session.keys.funding_derivation_path.clone(),
                    is_multisig_input: false,
                })
            } else {
                log::debug!("Input {} is not ours, skipping", input_index);
                None
            }
        })
        .collect()
}

/// Whether an input is signed for a given PSBT kind.
pub(crate) fn should_sign(config: &BitcoinInputSigningConfig, kind: TransactionType) -> bool {
    match kind {
        TransactionType::Funding => !config.is_multisig_input,
        TransactionType::Deposit => true,
        TransactionType::Withdraw => config.is_multisig_input,
    }
}

/// Whether an input is finalized for a given PSBT kind.
pub(crate) fn should_finalize(config: &BitcoinInputSigningConfig, kind: TransactionType) -> bool {
    match kind {
        TransactionType::Funding | TransactionType::Deposit => !config.is_multisig_input,
        TransactionType::Withdraw => false,
    }
}

/// Attach BIP-32 / taproot key origins so external signers can find their keys.
pub(crate) fn add_key_origins(
    psbt: &mut Psbt,
    session: &VaultSession,
    configs: &[BitcoinInputSigningConfig],
) {
    let Some(fingerprint) = session.keys.master_fingerprint else {
        return;
    };
    let funding = &session.payment.funding_payment;
    let leaf_hash = session.payment.multisig_payment.leaf_hash();

    for config in configs {
        let input = &mut psbt.inputs[config.input_index];
        let origin = (fingerprint, config.derivation_path.clone());

        if config.is_multisig_input {
            input
                .tap_key_origins
                .insert(session.user_multisig_key(), (vec![leaf_hash], origin));
            continue;
        }

        match funding.payment_type {
            FundingPaymentType::Wpkh => {
                input.bip32_derivation.insert(funding.public_key, origin);
            }
            FundingPaymentType::Tr => {
                input
                    .tap_key_origins
                    .insert(funding.x_only_public_key(), (Vec::new(), origin));
                input.tap_internal_key = Some(funding.x_only_public_key());
            }
        }
    }
}

/// Turn collected signatures into final witnesses for single-key inputs.
///
/// Only the signature for the session's funding key is used; anything else
/// a signer left in the input is discarded.
pub(crate) fn finalize_inputs(
    psbt: &mut Psbt,
    session: &VaultSession,
    configs: &[BitcoinInputSigningConfig],
    kind: TransactionType,
) -> Result<(), VaultError> {
    let funding = &session.payment.funding_payment;
    let funding_key = bitcoin::PublicKey::new(funding.public_key);

    for config in configs.iter().filter(|c| should_finalize(c, kind)) {
        let input = &mut psbt.inputs[config.input_index];

        let witness = match funding.payment_type {
            FundingPaymentType::Wpkh => input
                .partial_sigs
                .get(&funding_key)
                .map(|sig| Witness::from_slice(&[sig.to_vec(), funding_key.to_bytes()])),
            FundingPaymentType::Tr => input.tap_key_sig.map(|sig| Witness::from_slice(&[sig.to_vec()])),
        };
        let Some(witness) = witness else {
            return Err(VaultError::SignatureGenerationFailed(format!(
                "input {} has no signature from the funding key",
                config.input_index
            )));
        };

        input.final_script_witness = Some(witness);
        input.partial_sigs.clear();
        input.sighash_type = None;
        input.bip32_derivation.clear();
        input.tap_key_sig = None;
        input.tap_script_sigs.clear();
        input.tap_scripts.clear();
        input.tap_key_origins.clear();
        input.tap_internal_key = None;
        input.tap_merkle_root = None;
    }
    Ok(())
}

/// What a backend can do without outside help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignerCapabilities {
    pub can_sign: bool,
    pub can_finalize: bool,
    pub requires_device: bool,
    pub remote: bool,
}

/// A signing backend.
pub enum VaultSigner {
    PrivateKey(PrivateKeySigner),
    HardwareWallet(HardwareWalletSigner),
    Custodial(CustodialSigner),
    RemoteMpc(RemoteMpcSigner),
}

impl VaultSigner {
    pub fn capabilities(&self) -> SignerCapabilities {
        match self {
            VaultSigner::PrivateKey(_) => SignerCapabilities {
                can_sign: true,
                can_finalize: true,
                requires_device: false,
                remote: false,
            },
            VaultSigner::HardwareWallet(_) => SignerCapabilities {
                can_sign: true,
                can_finalize: true,
                requires_device: true,
                remote: false,
            },
            VaultSigner::Custodial(_) => SignerCapabilities {
                can_sign: false,
                can_finalize: true,
                requires_device: false,
                remote: false,
            },
            VaultSigner::RemoteMpc(_) => SignerCapabilities {
                can_sign: true,
                can_finalize: true,
                requires_device: false,
                remote: true,
            },
        }
    }

    pub fn network(&self) -> Network {
        match self {
            VaultSigner::PrivateKey(s) => s.network(),
            VaultSigner::HardwareWallet(s) => s.network(),
            VaultSigner::Custodial(s) => s.network(),
            VaultSigner::RemoteMpc(s) => s.network(),
        }
    }

    /// Derive the vault's funding and multisig payments.
    pub async fn create_payment_information(
        &self,
        uuid: &VaultUuid,
        attestor_group_key: &AttestorGroupKey,
    ) -> Result<VaultSession, VaultError> {
        let session = match self {
            VaultSigner::PrivateKey(s) => {
                VaultSession::new(*uuid, s.network(), attestor_group_key.clone(), s.session_keys()?)?
            }
            VaultSigner::HardwareWallet(s) => s.create_session(uuid, attestor_group_key).await?,
            VaultSigner::Custodial(s) => {
                VaultSession::new(*uuid, s.network(), attestor_group_key.clone(), s.session_keys())?
            }
            VaultSigner::RemoteMpc(s) => {
                VaultSession::new(*uuid, s.network(), attestor_group_key.clone(), s.session_keys())?
            }
        };

        log::info!(
            "Vault {} multisig address {}",
            uuid,
            session.payment.multisig_payment.address
        );
        Ok(session)
    }

    /// Sign (and where allowed, finalize) a vault PSBT.
    pub async fn sign_psbt(
        &self,
        session: &VaultSession,
        psbt: Psbt,
        kind: TransactionType,
    ) -> Result<Psbt, VaultError> {
        match self {
            VaultSigner::PrivateKey(s) => s.sign_psbt(session, psbt, kind),
            VaultSigner::HardwareWallet(s) => s.sign_psbt(session, psbt, kind).await,
            VaultSigner::Custodial(s) => s.sign_psbt(session, psbt, kind),
            VaultSigner::RemoteMpc(s) => s.sign_psbt(session, psbt, kind).await,
        }
    }
}
