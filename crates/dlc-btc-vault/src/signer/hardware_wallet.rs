//! Hardware wallet backend using BIP-388 wallet policies.
//!
//! The device never sees raw scripts. It is given a policy template plus
//! key list; the multisig policy must be registered once (the device returns
//! an HMAC proving the user approved it) before the device will sign for it.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::taproot::TapLeafHash;
use bitcoin::{ecdsa, taproot, Network, XOnlyPublicKey};
use miniscript::descriptor::{DefiniteDescriptorKey, Descriptor, DescriptorPublicKey};
use serde::{Deserialize, Serialize};

use super::{
    add_key_origins, classify_inputs, finalize_inputs, should_sign, BitcoinInputSigningConfig,
    SessionKeys, VaultSession,
};
use crate::error::VaultError;
use crate::keys::{
    account_path, derive_unhardened_public_key, funding_derivation_path, funding_purpose,
    multisig_derivation_path, unspendable_key_for_vault, AttestorGroupKey,
};
use crate::types::{FundingPaymentType, TransactionType, VaultUuid};

const MULTISIG_TEMPLATE: &str = "tr(@0/**,and_v(v:pk(@1/**),pk(@2/**)))";

/// A BIP-388 wallet policy: descriptor template plus key information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletPolicy {
    pub name: String,
    pub descriptor_template: String,
    pub keys: Vec<String>,
}

impl WalletPolicy {
    /// Default single-key policy; needs no registration.
    pub fn single_key(funding_type: FundingPaymentType, key_info: String) -> Self {
        let template = match funding_type {
            FundingPaymentType::Wpkh => "wpkh(@0/**)",
            FundingPaymentType::Tr => "tr(@0/**)",
        };
        Self {
            name: String::new(),
            descriptor_template: template.to_string(),
            keys: vec![key_info],
        }
    }

    /// Vault multisig policy. `participants` are placed in script order.
    pub fn multisig(name: &str, unspendable: &Xpub, participants: [String; 2]) -> Self {
        let [first, second] = participants;
        Self {
            name: name.to_string(),
            descriptor_template: MULTISIG_TEMPLATE.to_string(),
            keys: vec![unspendable.to_string(), first, second],
        }
    }

    /// Concrete descriptor for receive index `index`.
    pub fn to_descriptor(&self, index: u32) -> Result<Descriptor<DefiniteDescriptorKey>, VaultError> {
        let mut expanded = self.descriptor_template.clone();
        // Replace higher placeholders first so @1 never matches inside @10
        for (i, key) in self.keys.iter().enumerate().rev() {
            expanded = expanded.replace(&format!("@{}/**", i), &format!("{}/0/*", key));
        }

        let descriptor = Descriptor::<DescriptorPublicKey>::from_str(&expanded)
            .map_err(|e| VaultError::WalletPolicyMismatch(format!("invalid descriptor: {}", e)))?;
        descriptor
            .at_derivation_index(index)
            .map_err(|e| VaultError::WalletPolicyMismatch(e.to_string()))
    }
}

/// Multisig policy registered on the device, plus the funding policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredWalletPolicy {
    pub funding_policy: WalletPolicy,
    pub multisig_policy: WalletPolicy,
    pub policy_id: [u8; 32],
    pub policy_hmac: [u8; 32],
}

/// A signature returned by the device for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialSignature {
    Ecdsa {
        pubkey: bitcoin::PublicKey,
        signature: ecdsa::Signature,
    },
    TaprootKey {
        signature: taproot::Signature,
    },
    TaprootScript {
        pubkey: XOnlyPublicKey,
        leaf_hash: TapLeafHash,
        signature: taproot::Signature,
    },
}

/// Session with a connected device.
#[async_trait]
pub trait HardwareWalletTransport: Send + Sync {
    async fn master_fingerprint(&self) -> Result<Fingerprint, VaultError>;

    async fn get_extended_pubkey(
        &self,
        path: &DerivationPath,
        display: bool,
    ) -> Result<Xpub, VaultError>;

    /// Register a policy, returning its id and HMAC.
    async fn register_wallet(&self, policy: &WalletPolicy) -> Result<([u8; 32], [u8; 32]), VaultError>;

    async fn get_wallet_address(
        &self,
        policy: &WalletPolicy,
        hmac: Option<&[u8; 32]>,
        change: bool,
        index: u32,
        display: bool,
    ) -> Result<String, VaultError>;

    /// Sign a base64 PSBT under a policy, returning signatures by input index.
    async fn sign_psbt(
        &self,
        psbt_base64: &str,
        policy: &WalletPolicy,
        hmac: Option<&[u8; 32]>,
    ) -> Result<Vec<(usize, PartialSignature)>, VaultError>;
}

/// Signs through a hardware wallet.
///
/// The multisig participation key is always taken at index 0 (see
/// [`multisig_derivation_path`]); `address_index` applies to the funding key.
pub struct HardwareWalletSigner {
    transport: Arc<dyn HardwareWalletTransport>,
    network: Network,
    funding_type: FundingPaymentType,
    account_index: u32,
    address_index: u32,
}

fn key_info(fingerprint: Fingerprint, path: &DerivationPath, xpub: &Xpub) -> String {
    let origin: Vec<String> = path.as_ref().iter().map(|c| c.to_string()).collect();
    format!("[{}/{}]{}", fingerprint, origin.join("/"), xpub)
}

impl HardwareWalletSigner {
    pub fn new(
        transport: Arc<dyn HardwareWalletTransport>,
        network: Network,
        funding_type: FundingPaymentType,
        account_index: u32,
        address_index: u32,
    ) -> Self {
        Self {
            transport,
            network,
            funding_type,
            account_index,
            address_index,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Read keys from the device and register the vault's multisig policy.
    pub async fn create_session(
        &self,
        uuid: &VaultUuid,
        attestor_group_key: &AttestorGroupKey,
    ) -> Result<VaultSession, VaultError> {
        let AttestorGroupKey::Extended(attestor_xpub) = attestor_group_key else {
            return Err(VaultError::Device(
                "wallet policies need an extended attestor group key".into(),
            ));
        };

        let fingerprint = self.transport.master_fingerprint().await?;

        let funding_account = account_path(funding_purpose(self.funding_type), self.network, self.account_index)?;
        let multisig_account = account_path(86, self.network, self.account_index)?;
        let funding_xpub = self.transport.get_extended_pubkey(&funding_account, false).await?;
        let multisig_xpub = self.transport.get_extended_pubkey(&multisig_account, false).await?;

        let keys = SessionKeys {
            funding_type: self.funding_type,
            funding_public_key: derive_unhardened_public_key(&funding_xpub, self.address_index)?,
            multisig_public_key: derive_unhardened_public_key(&multisig_xpub, 0)?,
            funding_derivation_path: funding_derivation_path(
                self.funding_type,
                self.network,
                self.account_index,
                self.address_index,
            )?,
            multisig_derivation_path: multisig_derivation_path(self.network, self.account_index)?,
            master_fingerprint: Some(fingerprint),
        };
        let mut session = VaultSession::new(*uuid, self.network, attestor_group_key.clone(), keys)?;

        let user_info = key_info(fingerprint, &multisig_account, &multisig_xpub);
        let attestor_info = attestor_xpub.to_string();
        let participants = if session.user_multisig_key() == session.payment.multisig_payment.keys[0] {
            [user_info, attestor_info]
        } else {
            [attestor_info, user_info]
        };
        let unspendable = unspendable_key_for_vault(uuid, self.network)?;
        let multisig_policy = WalletPolicy::multisig("DLC.Link Vault", &unspendable, participants);

        let expected_script = session.payment.multisig_payment.script_pubkey();
        if multisig_policy.to_descriptor(0)?.script_pubkey() != expected_script {
            return Err(VaultError::WalletPolicyMismatch(
                "policy descriptor does not produce the vault script".into(),
            ));
        }

        let (policy_id, policy_hmac) = self.transport.register_wallet(&multisig_policy).await?;
        let device_address = self
            .transport
            .get_wallet_address(&multisig_policy, Some(&policy_hmac), false, 0, false)
            .await?;
        if device_address != session.payment.multisig_payment.address.to_string() {
            return Err(VaultError::WalletPolicyMismatch(format!(
                "device derived {}, expected {}",
                device_address, session.payment.multisig_payment.address
            )));
        }
        log::info!("Registered vault policy {}", hex::encode(policy_id));

        session.wallet_policy = Some(RegisteredWalletPolicy {
            funding_policy: WalletPolicy::single_key(
                self.funding_type,
                key_info(fingerprint, &funding_account, &funding_xpub),
            ),
            multisig_policy,
            policy_id,
            policy_hmac,
        });
        Ok(session)
    }

    pub async fn sign_psbt(
        &self,
        session: &VaultSession,
        mut psbt: Psbt,
        kind: TransactionType,
    ) -> Result<Psbt, VaultError> {
        let registered = session
            .wallet_policy
            .as_ref()
            .ok_or_else(|| VaultError::Device("session has no registered wallet policy".into()))?;

        let configs = classify_inputs(&psbt, session);
        add_key_origins(&mut psbt, session, &configs);
        let to_sign: Vec<&BitcoinInputSigningConfig> =
            configs.iter().filter(|c| should_sign(c, kind)).collect();

        let mut signatures = Vec::new();
        if to_sign.iter().any(|c| !c.is_multisig_input) {
            let encoded = BASE64.encode(psbt.serialize());
            signatures.extend(
                self.transport
                    .sign_psbt(&encoded, &registered.funding_policy, None)
                    .await?,
            );
        }
        if to_sign.iter().any(|c| c.is_multisig_input) {
            let encoded = BASE64.encode(psbt.serialize());
            signatures.extend(
                self.transport
                    .sign_psbt(&encoded, &registered.multisig_policy, Some(&registered.policy_hmac))
                    .await?,
            );
        }

        for (idx, signature) in signatures {
            let Some(config) = to_sign.iter().find(|c| c.input_index == idx) else {
                log::warn!("Device returned a signature for input {} which was not requested", idx);
                continue;
            };
            let input = &mut psbt.inputs[config.input_index];
            match signature {
                PartialSignature::Ecdsa { pubkey, signature } => {
                    input.partial_sigs.insert(pubkey, signature);
                }
                PartialSignature::TaprootKey { signature } => {
                    input.tap_key_sig = Some(signature);
                }
                PartialSignature::TaprootScript {
                    pubkey,
                    leaf_hash,
                    signature,
                } => {
                    input.tap_script_sigs.insert((pubkey, leaf_hash), signature);
                }
            }
        }

        for config in &to_sign {
            let input = &psbt.inputs[config.input_index];
            let signed = if config.is_multisig_input {
                !input.tap_script_sigs.is_empty()
            } else {
                input.tap_key_sig.is_some() || !input.partial_sigs.is_empty()
            };
            if !signed {
                return Err(VaultError::SignatureGenerationFailed(format!(
                    "device did not sign input {}",
                    config.input_index
                )));
            }
        }

        finalize_inputs(&mut psbt, session, &configs, kind)?;
        Ok(psbt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_deposit_psbt, build_funding_psbt};
    use crate::signer::PrivateKeySigner;
    use crate::test_utils::{test_utxo, test_xpriv, vault_transaction, verify_input};
    use bitcoin::bip32::Xpriv;
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::key::TapTweak;
    use bitcoin::secp256k1::{Keypair, Message, Secp256k1};
    use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
    use bitcoin::{Address, Amount, ScriptBuf, TxOut, WPubkeyHash};
    use std::sync::Mutex;

    /// Software stand-in for a device, backed by an xpriv.
    struct MockDevice {
        root: Xpriv,
        network: Network,
        registered: Mutex<Vec<WalletPolicy>>,
    }

    impl MockDevice {
        fn new(root: Xpriv, network: Network) -> Self {
            Self {
                root,
                network,
                registered: Mutex::new(Vec::new()),
            }
        }

        fn hmac_for(&self, policy: &WalletPolicy) -> [u8; 32] {
            let encoded = serde_json::to_vec(policy).unwrap();
            sha256::Hash::hash(&encoded).to_byte_array()
        }
    }

    #[async_trait]
    impl HardwareWalletTransport for MockDevice {
        async fn master_fingerprint(&self) -> Result<Fingerprint, VaultError> {
            Ok(self.root.fingerprint(&Secp256k1::new()))
        }

        async fn get_extended_pubkey(&self, path: &DerivationPath, _display: bool) -> Result<Xpub, VaultError> {
            let secp = Secp256k1::new();
            Ok(Xpub::from_priv(&secp, &self.root.derive_priv(&secp, path)?))
        }

        async fn register_wallet(&self, policy: &WalletPolicy) -> Result<([u8; 32], [u8; 32]), VaultError> {
            self.registered.lock().unwrap().push(policy.clone());
            let id = sha256::Hash::hash(policy.descriptor_template.as_bytes()).to_byte_array();
            Ok((id, self.hmac_for(policy)))
        }

        async fn get_wallet_address(
            &self,
            policy: &WalletPolicy,
            hmac: Option<&[u8; 32]>,
            _change: bool,
            index: u32,
            _display: bool,
        ) -> Result<String, VaultError> {
            if hmac != Some(&self.hmac_for(policy)) {
                return Err(VaultError::Device("policy not registered".into()));
            }
            let script = policy.to_descriptor(index)?.script_pubkey();
            let address = Address::from_script(&script, self.network)
                .map_err(|e| VaultError::Device(e.to_string()))?;
            Ok(address.to_string())
        }

        async fn sign_psbt(
            &self,
            psbt_base64: &str,
            policy: &WalletPolicy,
            hmac: Option<&[u8; 32]>,
        ) -> Result<Vec<(usize, PartialSignature)>, VaultError> {
            let is_multisig = policy.descriptor_template == MULTISIG_TEMPLATE;
            if is_multisig && hmac != Some(&self.hmac_for(policy)) {
                return Err(VaultError::Device("policy not registered".into()));
            }

            let secp = Secp256k1::new();
            let bytes = BASE64.decode(psbt_base64).unwrap();
            let psbt = Psbt::deserialize(&bytes).unwrap();
            let prevouts: Vec<TxOut> = psbt.inputs.iter().map(|i| i.witness_utxo.clone().unwrap()).collect();
            let mut cache = SighashCache::new(&psbt.unsigned_tx);
            let mut out = Vec::new();

            for (idx, input) in psbt.inputs.iter().enumerate() {
                if !is_multisig {
                    for (pk, (_, path)) in &input.bip32_derivation {
                        let sk = self.root.derive_priv(&secp, path)?.private_key;
                        let sighash = cache
                            .p2wpkh_signature_hash(idx, &prevouts[idx].script_pubkey, prevouts[idx].value, EcdsaSighashType::All)
                            .unwrap();
                        let msg = Message::from_digest(sighash.to_byte_array());
                        out.push((
                            idx,
                            PartialSignature::Ecdsa {
                                pubkey: bitcoin::PublicKey::new(*pk),
                                signature: ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, &sk)),
                            },
                        ));
                    }
                }
                for (xonly, (leaves, (_, path))) in &input.tap_key_origins {
                    let sk = self.root.derive_priv(&secp, path)?.private_key;
                    let keypair = Keypair::from_secret_key(&secp, &sk);
                    match (leaves.first(), is_multisig) {
                        (None, false) => {
                            let sighash = cache
                                .taproot_key_spend_signature_hash(idx, &Prevouts::All(&prevouts), TapSighashType::Default)
                                .unwrap();
                            let tweaked = keypair.tap_tweak(&secp, None).to_inner();
                            let msg = Message::from_digest(sighash.to_byte_array());
                            out.push((
                                idx,
                                PartialSignature::TaprootKey {
                                    signature: taproot::Signature {
                                        signature: secp.sign_schnorr_no_aux_rand(&msg, &tweaked),
                                        sighash_type: TapSighashType::Default,
                                    },
                                },
                            ));
                        }
                        (Some(leaf_hash), true) => {
                            let sighash = cache
                                .taproot_script_spend_signature_hash(
                                    idx,
                                    &Prevouts::All(&prevouts),
                                    *leaf_hash,
                                    TapSighashType::Default,
                                )
                                .unwrap();
                            let msg = Message::from_digest(sighash.to_byte_array());
                            out.push((
                                idx,
                                PartialSignature::TaprootScript {
                                    pubkey: *xonly,
                                    leaf_hash: *leaf_hash,
                                    signature: taproot::Signature {
                                        signature: secp.sign_schnorr_no_aux_rand(&msg, &keypair),
                                        sighash_type: TapSighashType::Default,
                                    },
                                },
                            ));
                        }
                        _ => {}
                    }
                }
            }
            Ok(out)
        }
    }

    fn attestor_key() -> AttestorGroupKey {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(Network::Regtest, &[0xa7; 32]).unwrap();
        AttestorGroupKey::Extended(Xpub::from_priv(&secp, &xpriv))
    }

    fn fee_script() -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0xfe; 20]))
    }

    fn hw_signer(funding_type: FundingPaymentType) -> HardwareWalletSigner {
        HardwareWalletSigner::new(
            Arc::new(MockDevice::new(test_xpriv(), Network::Regtest)),
            Network::Regtest,
            funding_type,
            0,
            0,
        )
    }

    #[tokio::test]
    async fn test_session_matches_private_key_backend() {
        let uuid = VaultUuid([0x61; 32]);
        let hw_session = hw_signer(FundingPaymentType::Wpkh)
            .create_session(&uuid, &attestor_key())
            .await
            .unwrap();

        let local = PrivateKeySigner::new(test_xpriv(), Network::Regtest, FundingPaymentType::Wpkh, 0, 0);
        let local_session =
            VaultSession::new(uuid, Network::Regtest, attestor_key(), local.session_keys().unwrap()).unwrap();

        assert_eq!(hw_session.payment, local_session.payment);
        assert_eq!(hw_session.keys, local_session.keys);
        let registered = hw_session.wallet_policy.unwrap();
        assert_eq!(registered.multisig_policy.descriptor_template, MULTISIG_TEMPLATE);
        assert_eq!(registered.funding_policy.descriptor_template, "wpkh(@0/**)");
    }

    #[tokio::test]
    async fn test_address_index_moves_only_funding_key() {
        let uuid = VaultUuid([0x65; 32]);
        let hw = HardwareWalletSigner::new(
            Arc::new(MockDevice::new(test_xpriv(), Network::Regtest)),
            Network::Regtest,
            FundingPaymentType::Tr,
            0,
            3,
        );
        let hw_session = hw.create_session(&uuid, &attestor_key()).await.unwrap();

        let local = PrivateKeySigner::new(test_xpriv(), Network::Regtest, FundingPaymentType::Tr, 0, 3);
        let local_session =
            VaultSession::new(uuid, Network::Regtest, attestor_key(), local.session_keys().unwrap()).unwrap();
        assert_eq!(hw_session.payment.multisig_payment, local_session.payment.multisig_payment);
        assert_eq!(hw_session.payment.funding_payment, local_session.payment.funding_payment);
        assert_eq!(hw_session.keys, local_session.keys);

        // the multisig key is shared with index 0, the funding key is not
        let at_zero = PrivateKeySigner::new(test_xpriv(), Network::Regtest, FundingPaymentType::Tr, 0, 0)
            .session_keys()
            .unwrap();
        assert_eq!(hw_session.keys.multisig_public_key, at_zero.multisig_public_key);
        assert_ne!(hw_session.keys.funding_public_key, at_zero.funding_public_key);
    }

    #[tokio::test]
    async fn test_raw_attestor_key_rejected() {
        let raw = AttestorGroupKey::Raw(attestor_key().x_only_public_key().unwrap());
        let result = hw_signer(FundingPaymentType::Wpkh)
            .create_session(&VaultUuid([0x62; 32]), &raw)
            .await;
        assert!(matches!(result, Err(VaultError::Device(_))));
    }

    #[tokio::test]
    async fn test_hw_funding_signature_valid() {
        let signer = hw_signer(FundingPaymentType::Tr);
        let session = signer.create_session(&VaultUuid([0x63; 32]), &attestor_key()).await.unwrap();
        let funding_script = session.payment.funding_payment.script_pubkey();
        let psbt = build_funding_psbt(
            &session.payment,
            &[test_utxo(1, 0, 1_500_000, &funding_script)],
            Amount::from_sat(1_000_000),
            &fee_script(),
            100,
            2,
        )
        .unwrap();

        let signed = signer.sign_psbt(&session, psbt, TransactionType::Funding).await.unwrap();
        let spent = [signed.inputs[0].witness_utxo.clone().unwrap()];
        let tx = signed.extract_tx().unwrap();
        verify_input(&tx, 0, &spent).unwrap();
    }

    #[tokio::test]
    async fn test_hw_deposit_matches_private_key_signatures() {
        let uuid = VaultUuid([0x64; 32]);
        let signer = hw_signer(FundingPaymentType::Wpkh);
        let session = signer.create_session(&uuid, &attestor_key()).await.unwrap();
        let funding_script = session.payment.funding_payment.script_pubkey();
        let vault_tx = vault_transaction(&session.payment, 1_000_000);
        let build = || {
            build_deposit_psbt(
                &session.payment,
                &vault_tx,
                &[test_utxo(2, 0, 800_000, &funding_script)],
                Amount::from_sat(300_000),
                &fee_script(),
                100,
                2,
            )
            .unwrap()
        };

        let from_device = signer.sign_psbt(&session, build(), TransactionType::Deposit).await.unwrap();
        let local = PrivateKeySigner::new(test_xpriv(), Network::Regtest, FundingPaymentType::Wpkh, 0, 0);
        let from_local = local.sign_psbt(&session, build(), TransactionType::Deposit).unwrap();

        assert_eq!(from_device.inputs[0].tap_script_sigs, from_local.inputs[0].tap_script_sigs);
        assert_eq!(
            from_device.inputs[1].final_script_witness,
            from_local.inputs[1].final_script_witness
        );
        assert!(from_device.inputs[0].final_script_witness.is_none());
    }

    #[test]
    fn test_policy_descriptor_expansion() {
        let secp = Secp256k1::new();
        let xpub = Xpub::from_priv(&secp, &test_xpriv());
        let policy = WalletPolicy::single_key(FundingPaymentType::Wpkh, xpub.to_string());
        let descriptor = policy.to_descriptor(0).unwrap();
        let expected = derive_unhardened_public_key(&xpub, 0).unwrap();
        assert_eq!(
            descriptor.script_pubkey(),
            ScriptBuf::new_p2wpkh(&bitcoin::CompressedPublicKey(expected).wpubkey_hash())
        );
    }
}
