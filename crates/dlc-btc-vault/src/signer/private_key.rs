//! Local signer holding the root extended private key.

use std::str::FromStr;

use bip39::{Language, Mnemonic};
use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::psbt::Psbt;
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{ecdsa, taproot, Network, TxOut};
use secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use zeroize::Zeroizing;

use super::{
    add_key_origins, classify_inputs, finalize_inputs, should_sign, BitcoinInputSigningConfig,
    SessionKeys, VaultSession,
};
use crate::error::VaultError;
use crate::keys::{funding_derivation_path, multisig_derivation_path};
use crate::types::{FundingPaymentType, TransactionType};

/// Signs with keys derived from a BIP-32 root.
pub struct PrivateKeySigner {
    root: Xpriv,
    network: Network,
    funding_type: FundingPaymentType,
    account_index: u32,
    address_index: u32,
}

impl PrivateKeySigner {
    pub fn new(
        root: Xpriv,
        network: Network,
        funding_type: FundingPaymentType,
        account_index: u32,
        address_index: u32,
    ) -> Self {
        Self {
            root,
            network,
            funding_type,
            account_index,
            address_index,
        }
    }

    /// Build from a BIP-39 mnemonic and optional passphrase.
    pub fn from_mnemonic(
        words: &str,
        passphrase: &str,
        network: Network,
        funding_type: FundingPaymentType,
        account_index: u32,
        address_index: u32,
    ) -> Result<Self, VaultError> {
        let mnemonic = Mnemonic::parse_in(Language::English, words)
            .map_err(|e| VaultError::InvalidKey(format!("invalid mnemonic: {}", e)))?;
        let seed = Zeroizing::new(mnemonic.to_seed(passphrase));
        let root = Xpriv::new_master(network, &seed[..])?;
        Ok(Self::new(root, network, funding_type, account_index, address_index))
    }

    /// Build from a serialized xprv/tprv.
    pub fn from_xpriv_str(
        xpriv: &str,
        network: Network,
        funding_type: FundingPaymentType,
        account_index: u32,
        address_index: u32,
    ) -> Result<Self, VaultError> {
        let root = Xpriv::from_str(xpriv.trim())?;
        Ok(Self::new(root, network, funding_type, account_index, address_index))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let secp = Secp256k1::signing_only();
        self.root.fingerprint(&secp)
    }

    fn derive_secret(&self, path: &DerivationPath) -> Result<SecretKey, VaultError> {
        let secp = Secp256k1::new();
        Ok(self.root.derive_priv(&secp, path)?.private_key)
    }

    pub fn session_keys(&self) -> Result<SessionKeys, VaultError> {
        let secp = Secp256k1::new();
        let funding_derivation_path = funding_derivation_path(
            self.funding_type,
            self.network,
            self.account_index,
            self.address_index,
        )?;
        let multisig_derivation_path =
            multisig_derivation_path(self.network, self.account_index)?;

        Ok(SessionKeys {
            funding_type: self.funding_type,
            funding_public_key: self.derive_secret(&funding_derivation_path)?.public_key(&secp),
            multisig_public_key: self.derive_secret(&multisig_derivation_path)?.public_key(&secp),
            funding_derivation_path,
            multisig_derivation_path,
            master_fingerprint: Some(self.fingerprint()),
        })
    }

    /// Sign the inputs this kind of PSBT calls for, then finalize.
    pub fn sign_psbt(
        &self,
        session: &VaultSession,
        mut psbt: Psbt,
        kind: TransactionType,
    ) -> Result<Psbt, VaultError> {
        let configs = classify_inputs(&psbt, session);
        add_key_origins(&mut psbt, session, &configs);
        self.add_signatures(session, &configs, &mut psbt, kind)?;
        finalize_inputs(&mut psbt, session, &configs, kind)?;
        Ok(psbt)
    }

    /// Add this signer's signatures without finalizing.
    pub(crate) fn add_signatures(
        &self,
        session: &VaultSession,
        configs: &[BitcoinInputSigningConfig],
        psbt: &mut Psbt,
        kind: TransactionType,
    ) -> Result<(), VaultError> {
        let secp = Secp256k1::new();

        let prevouts: Vec<TxOut> = psbt
            .inputs
            .iter()
            .map(|input| {
                input
                    .witness_utxo
                    .clone()
                    .ok_or_else(|| VaultError::Psbt("missing witness UTXO".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tx = psbt.unsigned_tx.clone();
        let mut sighash_cache = SighashCache::new(&tx);
        let leaf_hash = session.payment.multisig_payment.leaf_hash();

        for config in configs.iter().filter(|c| should_sign(c, kind)) {
            let idx = config.input_index;
            let secret = self.derive_secret(&config.derivation_path)?;

            if config.is_multisig_input {
                let sighash = sighash_cache
                    .taproot_script_spend_signature_hash(
                        idx,
                        &Prevouts::All(&prevouts),
                        leaf_hash,
                        TapSighashType::Default,
                    )
                    .map_err(|e| VaultError::Sighash(e.to_string()))?;
                let msg = Message::from_digest(sighash.to_byte_array());
                let keypair = Keypair::from_secret_key(&secp, &secret);
                let signature = secp.sign_schnorr_no_aux_rand(&msg, &keypair);

                psbt.inputs[idx].tap_script_sigs.insert(
                    (keypair.x_only_public_key().0, leaf_hash),
                    taproot::Signature {
                        signature,
                        sighash_type: TapSighashType::Default,
                    },
                );
                continue;
            }

            match session.payment.funding_payment.payment_type {
                FundingPaymentType::Wpkh => {
                    let sighash = sighash_cache
                        .p2wpkh_signature_hash(
                            idx,
                            &prevouts[idx].script_pubkey,
                            prevouts[idx].value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| VaultError::Sighash(e.to_string()))?;
                    let msg = Message::from_digest(sighash.to_byte_array());
                    let signature = secp.sign_ecdsa(&msg, &secret);

                    psbt.inputs[idx].partial_sigs.insert(
                        bitcoin::PublicKey::new(secret.public_key(&secp)),
                        ecdsa::Signature {
                            signature,
                            sighash_type: EcdsaSighashType::All,
                        },
                    );
                }
                FundingPaymentType::Tr => {
                    let sighash = sighash_cache
                        .taproot_key_spend_signature_hash(
                            idx,
                            &Prevouts::All(&prevouts),
                            TapSighashType::Default,
                        )
                        .map_err(|e| VaultError::Sighash(e.to_string()))?;
                    let msg = Message::from_digest(sighash.to_byte_array());
                    // BIP-86: tweak with an empty script tree
                    let keypair = Keypair::from_secret_key(&secp, &secret)
                        .tap_tweak(&secp, None)
                        .to_inner();
                    let signature = secp.sign_schnorr_no_aux_rand(&msg, &keypair);

                    psbt.inputs[idx].tap_key_sig = Some(taproot::Signature {
                        signature,
                        sighash_type: TapSighashType::Default,
                    });
                }
            }
        }

        Ok(())
    }
}
