//! Key derivation for vault scripts.
//!
//! The internal key of every vault output is an unspendable point: a BIP-32
//! extended key over the BIP-341 NUMS point whose chain code is the vault
//! uuid. Anyone holding the uuid can rebuild it; no one can sign with it.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChainCode, ChildNumber, DerivationPath, Fingerprint, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Network, NetworkKind, XOnlyPublicKey};

use crate::error::VaultError;
use crate::types::{FundingPaymentType, VaultUuid};

/// BIP-341 "nothing up my sleeve" point with no known discrete log.
pub const NUMS_POINT: &str = "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

/// Extended public key over the NUMS point, chained on the vault uuid.
pub fn unspendable_key_for_vault(uuid: &VaultUuid, network: Network) -> Result<Xpub, VaultError> {
    let public_key =
        PublicKey::from_str(NUMS_POINT).map_err(|e| VaultError::InvalidKey(e.to_string()))?;

    Ok(Xpub {
        network: NetworkKind::from(network),
        depth: 0,
        parent_fingerprint: Fingerprint::from([0u8; 4]),
        child_number: ChildNumber::Normal { index: 0 },
        public_key,
        chain_code: ChainCode::from(*uuid.as_bytes()),
    })
}

/// Child public key at the unhardened path `0/{address_index}`.
pub fn derive_unhardened_public_key(
    xpub: &Xpub,
    address_index: u32,
) -> Result<PublicKey, VaultError> {
    let secp = Secp256k1::verification_only();
    let path = [
        ChildNumber::from_normal_idx(0)?,
        ChildNumber::from_normal_idx(address_index)?,
    ];
    Ok(xpub.derive_pub(&secp, &path)?.public_key)
}

/// Unspendable x-only internal key for a vault.
pub fn vault_internal_key(uuid: &VaultUuid, network: Network) -> Result<XOnlyPublicKey, VaultError> {
    let xpub = unspendable_key_for_vault(uuid, network)?;
    Ok(derive_unhardened_public_key(&xpub, 0)?.x_only_public_key().0)
}

/// Parse a hex public key, compressed (33 bytes) or x-only (32 bytes).
pub fn parse_x_only_key(hex_str: &str) -> Result<XOnlyPublicKey, VaultError> {
    let bytes = hex::decode(hex_str.trim().trim_start_matches("0x"))
        .map_err(|e| VaultError::InvalidKey(format!("{}: {}", hex_str, e)))?;
    match bytes.len() {
        33 => PublicKey::from_slice(&bytes)
            .map(|pk| pk.x_only_public_key().0)
            .map_err(|e| VaultError::InvalidKey(e.to_string())),
        32 => XOnlyPublicKey::from_slice(&bytes).map_err(|e| VaultError::InvalidKey(e.to_string())),
        n => Err(VaultError::InvalidKey(format!(
            "expected 32 or 33 byte key, got {} bytes",
            n
        ))),
    }
}

/// Group key published by the attestor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestorGroupKey {
    /// Extended key; the signing key is its child at `0/0`
    Extended(Xpub),
    /// Raw key, already derived
    Raw(XOnlyPublicKey),
}

impl AttestorGroupKey {
    pub fn x_only_public_key(&self) -> Result<XOnlyPublicKey, VaultError> {
        match self {
            AttestorGroupKey::Extended(xpub) => {
                Ok(derive_unhardened_public_key(xpub, 0)?.x_only_public_key().0)
            }
            AttestorGroupKey::Raw(key) => Ok(*key),
        }
    }
}

impl FromStr for AttestorGroupKey {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(xpub) = Xpub::from_str(trimmed) {
            return Ok(AttestorGroupKey::Extended(xpub));
        }
        parse_x_only_key(trimmed).map(AttestorGroupKey::Raw)
    }
}

impl fmt::Display for AttestorGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttestorGroupKey::Extended(xpub) => write!(f, "{}", xpub),
            AttestorGroupKey::Raw(key) => write!(f, "{}", key),
        }
    }
}

/// BIP-44 coin type: 0 on mainnet, 1 on every test network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// Account-level path `m/{purpose}'/{coin}'/{account}'`.
pub fn account_path(purpose: u32, network: Network, account: u32) -> Result<DerivationPath, VaultError> {
    Ok(DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(purpose)?,
        ChildNumber::from_hardened_idx(coin_type(network))?,
        ChildNumber::from_hardened_idx(account)?,
    ]))
}

fn receive_path(
    purpose: u32,
    network: Network,
    account: u32,
    index: u32,
) -> Result<DerivationPath, VaultError> {
    Ok(account_path(purpose, network, account)?.extend([
        ChildNumber::from_normal_idx(0)?,
        ChildNumber::from_normal_idx(index)?,
    ]))
}

/// BIP-84 / BIP-86 purpose for a funding payment type.
pub fn funding_purpose(payment_type: FundingPaymentType) -> u32 {
    match payment_type {
        FundingPaymentType::Wpkh => 84,
        FundingPaymentType::Tr => 86,
    }
}

/// Funding key path: `m/84'/coin'/account'/0/index` or `m/86'/coin'/account'/0/index`.
pub fn funding_derivation_path(
    payment_type: FundingPaymentType,
    network: Network,
    account: u32,
    index: u32,
) -> Result<DerivationPath, VaultError> {
    receive_path(funding_purpose(payment_type), network, account, index)
}

/// Multisig participation key path: `m/86'/coin'/account'/0/0`.
///
/// Wallet policies evaluate every key at one index and the unspendable and
/// attestor keys sit at `0/0`, so the user's key is pinned there too for
/// every backend. Only the funding key follows the address index.
pub fn multisig_derivation_path(network: Network, account: u32) -> Result<DerivationPath, VaultError> {
    receive_path(86, network, account, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::bip32::Xpriv;

    fn test_uuid(byte: u8) -> VaultUuid {
        VaultUuid([byte; 32])
    }

    #[test]
    fn test_unspendable_key_fields() {
        let uuid = test_uuid(0x5a);
        let xpub = unspendable_key_for_vault(&uuid, Network::Testnet).unwrap();
        assert_eq!(xpub.depth, 0);
        assert_eq!(xpub.parent_fingerprint, Fingerprint::from([0u8; 4]));
        assert_eq!(xpub.chain_code, ChainCode::from([0x5a; 32]));
        assert_eq!(xpub.public_key.to_string(), NUMS_POINT);
        assert_eq!(xpub.network, NetworkKind::Test);
        assert!(xpub.to_string().starts_with("tpub"));

        let mainnet = unspendable_key_for_vault(&uuid, Network::Bitcoin).unwrap();
        assert!(mainnet.to_string().starts_with("xpub"));
    }

    #[test]
    fn test_internal_key_committed_to_uuid() {
        let a = vault_internal_key(&test_uuid(1), Network::Regtest).unwrap();
        let a_again = vault_internal_key(&test_uuid(1), Network::Regtest).unwrap();
        let b = vault_internal_key(&test_uuid(2), Network::Regtest).unwrap();
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[test]
    fn test_internal_key_independent_of_network_kind() {
        // Network kind only changes the xpub's serialization, not the point.
        let test = vault_internal_key(&test_uuid(9), Network::Testnet).unwrap();
        let main = vault_internal_key(&test_uuid(9), Network::Bitcoin).unwrap();
        assert_eq!(test, main);
    }

    #[test]
    fn test_derive_matches_bip32_path() {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(Network::Testnet, &[0x42; 32]).unwrap();
        let xpub = Xpub::from_priv(&secp, &xpriv);

        let derived = derive_unhardened_public_key(&xpub, 7).unwrap();
        let path = DerivationPath::from_str("m/0/7").unwrap();
        let expected = xpriv.derive_priv(&secp, &path).unwrap().private_key.public_key(&secp);
        assert_eq!(derived, expected);
    }

    #[test]
    fn test_parse_x_only_key_both_encodings() {
        let secp = Secp256k1::new();
        let sk = bitcoin::secp256k1::SecretKey::from_slice(&[0x11; 32]).unwrap();
        let compressed = sk.public_key(&secp).to_string();
        let x_only = &compressed[2..];
        assert_eq!(
            parse_x_only_key(&compressed).unwrap(),
            parse_x_only_key(x_only).unwrap()
        );
        assert!(parse_x_only_key("abcd").is_err());
        assert!(parse_x_only_key("not hex").is_err());
    }

    #[test]
    fn test_attestor_group_key_forms() {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(Network::Testnet, &[0x07; 32]).unwrap();
        let xpub = Xpub::from_priv(&secp, &xpriv);

        let extended = AttestorGroupKey::from_str(&xpub.to_string()).unwrap();
        assert!(matches!(extended, AttestorGroupKey::Extended(_)));

        let derived = derive_unhardened_public_key(&xpub, 0).unwrap();
        let raw = AttestorGroupKey::from_str(&derived.to_string()).unwrap();
        assert_eq!(
            extended.x_only_public_key().unwrap(),
            raw.x_only_public_key().unwrap()
        );
    }

    #[test]
    fn test_derivation_paths() {
        let path = |s: &str| DerivationPath::from_str(s).unwrap();

        let wpkh = funding_derivation_path(FundingPaymentType::Wpkh, Network::Bitcoin, 0, 3).unwrap();
        assert_eq!(wpkh, path("m/84'/0'/0'/0/3"));

        let tr = funding_derivation_path(FundingPaymentType::Tr, Network::Testnet, 2, 0).unwrap();
        assert_eq!(tr, path("m/86'/1'/2'/0/0"));

        let multisig = multisig_derivation_path(Network::Regtest, 0).unwrap();
        assert_eq!(multisig, path("m/86'/1'/0'/0/0"));
        let multisig = multisig_derivation_path(Network::Bitcoin, 4).unwrap();
        assert_eq!(multisig, path("m/86'/0'/4'/0/0"));
    }
}
