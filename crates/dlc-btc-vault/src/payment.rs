//! Vault payments: the 2-of-2 taproot multisig and the user's funding payment.

use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::taproot::TaprootBuilder;
use bitcoin::{Address, CompressedPublicKey, Network, ScriptBuf, XOnlyPublicKey};

use crate::error::VaultError;
use crate::keys::{derive_unhardened_public_key, unspendable_key_for_vault, AttestorGroupKey};
use crate::types::{FundingPayment, FundingPaymentType, MultisigPayment, VaultUuid};

/// Tapscript leaf `<k0> OP_CHECKSIGVERIFY <k1> OP_CHECKSIG` over byte-sorted keys.
pub fn multisig_leaf_script(key_a: &XOnlyPublicKey, key_b: &XOnlyPublicKey) -> (ScriptBuf, [XOnlyPublicKey; 2]) {
    let mut keys = [*key_a, *key_b];
    keys.sort_by_key(|k| k.serialize());

    let script = Builder::new()
        .push_x_only_key(&keys[0])
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_x_only_key(&keys[1])
        .push_opcode(OP_CHECKSIG)
        .into_script();

    (script, keys)
}

/// Build the vault's P2TR multisig payment.
///
/// The unspendable key is the internal key, so the output can only be spent
/// through the single script leaf, which requires both signatures.
pub fn taproot_multisig_payment(
    unspendable_key: &PublicKey,
    key_a: &XOnlyPublicKey,
    key_b: &XOnlyPublicKey,
    network: Network,
) -> Result<MultisigPayment, VaultError> {
    let secp = Secp256k1::verification_only();
    let internal_key = unspendable_key.x_only_public_key().0;
    let (leaf_script, keys) = multisig_leaf_script(key_a, key_b);

    let spend_info = TaprootBuilder::new()
        .add_leaf(0, leaf_script.clone())
        .map_err(|e| VaultError::Taproot(format!("taproot builder error: {}", e)))?
        .finalize(&secp, internal_key)
        .map_err(|_| VaultError::Taproot("taproot finalize failed".into()))?;

    let address = Address::p2tr_tweaked(spend_info.output_key(), network);

    Ok(MultisigPayment {
        internal_key,
        keys,
        leaf_script,
        spend_info,
        address,
    })
}

/// Multisig payment of a vault, rebuilt from public data only.
pub fn multisig_payment_for_vault(
    uuid: &VaultUuid,
    attestor_group_key: &AttestorGroupKey,
    user_key: &XOnlyPublicKey,
    network: Network,
) -> Result<MultisigPayment, VaultError> {
    let unspendable = derive_unhardened_public_key(&unspendable_key_for_vault(uuid, network)?, 0)?;
    let attestor_key = attestor_group_key.x_only_public_key()?;
    taproot_multisig_payment(&unspendable, &attestor_key, user_key, network)
}

/// Single-key funding payment.
pub fn funding_payment(
    public_key: &PublicKey,
    payment_type: FundingPaymentType,
    network: Network,
) -> FundingPayment {
    let address = match payment_type {
        FundingPaymentType::Wpkh => Address::p2wpkh(&CompressedPublicKey(*public_key), network),
        FundingPaymentType::Tr => {
            let secp = Secp256k1::verification_only();
            Address::p2tr(&secp, public_key.x_only_public_key().0, None, network)
        }
    };

    FundingPayment {
        payment_type,
        public_key: *public_key,
        address,
    }
}

/// Output script of the protocol fee recipient.
///
/// The recipient is either an address on `network` or a compressed public
/// key in hex, which is paid as P2WPKH.
pub fn fee_recipient_script(recipient: &str, network: Network) -> Result<ScriptBuf, VaultError> {
    let trimmed = recipient.trim();

    if let Ok(bytes) = hex::decode(trimmed.trim_start_matches("0x")) {
        if bytes.len() == 33 {
            let key = CompressedPublicKey::from_slice(&bytes)
                .map_err(|e| VaultError::InvalidFeeRecipient(e.to_string()))?;
            return Ok(ScriptBuf::new_p2wpkh(&key.wpubkey_hash()));
        }
    }

    let address = Address::<NetworkUnchecked>::from_str(trimmed)
        .map_err(|e| VaultError::InvalidFeeRecipient(format!("{}: {}", trimmed, e)))?
        .require_network(network)
        .map_err(|e| VaultError::InvalidFeeRecipient(e.to_string()))?;
    Ok(address.script_pubkey())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::taproot::LeafVersion;

    fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[31] = seed_byte;
        bytes[0] = 0x01;
        let sk = SecretKey::from_slice(&bytes).unwrap();
        let pk = sk.public_key(&secp);
        (sk, pk)
    }

    fn x_only(seed_byte: u8) -> XOnlyPublicKey {
        test_keypair(seed_byte).1.x_only_public_key().0
    }

    #[test]
    fn test_multisig_key_order_independent() {
        let (_, internal) = test_keypair(99);
        let a = x_only(1);
        let b = x_only(2);

        let ab = taproot_multisig_payment(&internal, &a, &b, Network::Testnet).unwrap();
        let ba = taproot_multisig_payment(&internal, &b, &a, Network::Testnet).unwrap();

        assert_eq!(ab.script_pubkey(), ba.script_pubkey());
        assert_eq!(ab.leaf_script, ba.leaf_script);
        assert!(ab.keys[0].serialize() < ab.keys[1].serialize());
    }

    #[test]
    fn test_leaf_script_layout() {
        let a = x_only(3);
        let b = x_only(4);
        let (script, keys) = multisig_leaf_script(&a, &b);
        let bytes = script.as_bytes();

        // 0x20 <32> OP_CHECKSIGVERIFY 0x20 <32> OP_CHECKSIG
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 0x20);
        assert_eq!(&bytes[1..33], &keys[0].serialize());
        assert_eq!(bytes[33], OP_CHECKSIGVERIFY.to_u8());
        assert_eq!(bytes[34], 0x20);
        assert_eq!(&bytes[35..67], &keys[1].serialize());
        assert_eq!(bytes[67], OP_CHECKSIG.to_u8());
    }

    #[test]
    fn test_multisig_single_leaf_tree() {
        let (_, internal) = test_keypair(99);
        let payment = taproot_multisig_payment(&internal, &x_only(1), &x_only(2), Network::Regtest).unwrap();

        assert!(payment.script_pubkey().is_p2tr());
        assert_eq!(payment.internal_key, internal.x_only_public_key().0);

        let control_block = payment.control_block().unwrap();
        assert_eq!(control_block.leaf_version, LeafVersion::TapScript);
        // Single leaf at depth 0: no merkle branch
        assert!(control_block.merkle_branch.is_empty());
        let secp = Secp256k1::verification_only();
        assert!(control_block.verify_taproot_commitment(
            &secp,
            payment.spend_info.output_key().to_inner(),
            &payment.leaf_script,
        ));
    }

    #[test]
    fn test_multisig_for_vault_deterministic() {
        let uuid = VaultUuid([0x33; 32]);
        let attestor = AttestorGroupKey::Raw(x_only(10));
        let user = x_only(11);

        let first = multisig_payment_for_vault(&uuid, &attestor, &user, Network::Testnet).unwrap();
        let second = multisig_payment_for_vault(&uuid, &attestor, &user, Network::Testnet).unwrap();
        assert_eq!(first, second);

        let other_vault = multisig_payment_for_vault(&VaultUuid([0x34; 32]), &attestor, &user, Network::Testnet).unwrap();
        assert_ne!(first.script_pubkey(), other_vault.script_pubkey());
    }

    #[test]
    fn test_funding_payment_types() {
        let (_, pk) = test_keypair(5);

        let wpkh = funding_payment(&pk, FundingPaymentType::Wpkh, Network::Testnet);
        assert!(wpkh.script_pubkey().is_p2wpkh());
        assert!(wpkh.address.to_string().starts_with("tb1q"));

        let tr = funding_payment(&pk, FundingPaymentType::Tr, Network::Testnet);
        assert!(tr.script_pubkey().is_p2tr());
        assert!(tr.address.to_string().starts_with("tb1p"));
    }

    #[test]
    fn test_fee_recipient_forms() {
        let (_, pk) = test_keypair(6);
        let from_key = fee_recipient_script(&pk.to_string(), Network::Testnet).unwrap();
        assert!(from_key.is_p2wpkh());

        let address = Address::p2wpkh(&CompressedPublicKey(pk), Network::Testnet);
        let from_address = fee_recipient_script(&address.to_string(), Network::Testnet).unwrap();
        assert_eq!(from_key, from_address);

        // Wrong network is rejected
        assert!(fee_recipient_script(&address.to_string(), Network::Bitcoin).is_err());
        assert!(fee_recipient_script("garbage", Network::Testnet).is_err());
    }
}
