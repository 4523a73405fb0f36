//! Vault records and payment types shared across the engine.

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::PublicKey;
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TaprootSpendInfo};
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, TxOut, Txid, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VaultError;

/// 32-byte vault identifier, rendered as `0x`-prefixed hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VaultUuid(pub [u8; 32]);

impl VaultUuid {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for VaultUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for VaultUuid {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| VaultError::InvalidUuid(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| VaultError::InvalidUuid(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(VaultUuid(bytes))
    }
}

impl Serialize for VaultUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VaultUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VaultUuid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a vault on the external ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    Ready,
    Funded,
    Closing,
    Closed,
    Pending,
}

/// Snapshot of a vault as reported by the external ledger.
///
/// Snapshots are never mutated; a newer snapshot supersedes an older one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVault {
    pub uuid: VaultUuid,
    #[serde(default)]
    pub protocol_contract: String,
    pub creator: String,
    pub status: VaultStatus,
    pub value_locked: u64,
    pub value_minted: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub funding_tx_id: String,
    #[serde(default)]
    pub withdraw_tx_id: String,
    #[serde(default)]
    pub closing_tx_id: String,
    pub taproot_pub_key: String,
    pub btc_fee_recipient: String,
    pub btc_mint_fee_basis_points: u64,
    pub btc_redeem_fee_basis_points: u64,
}

impl RawVault {
    /// Transaction currently holding the vault's multisig output.
    ///
    /// The ledger moves this on every deposit and withdrawal, while
    /// `withdraw_tx_id` keeps pointing at the last withdrawal.
    pub fn funding_txid(&self) -> Result<Option<Txid>, VaultError> {
        parse_optional_txid(&self.funding_tx_id)
    }

    pub fn withdraw_txid(&self) -> Result<Option<Txid>, VaultError> {
        parse_optional_txid(&self.withdraw_tx_id)
    }

    pub fn value_locked(&self) -> Amount {
        Amount::from_sat(self.value_locked)
    }
}

fn parse_optional_txid(s: &str) -> Result<Option<Txid>, VaultError> {
    let trimmed = s.trim().trim_start_matches("0x");
    if trimmed.is_empty() || trimmed.bytes().all(|b| b == b'0') {
        return Ok(None);
    }
    Txid::from_str(trimmed)
        .map(Some)
        .map_err(|e| VaultError::Psbt(format!("invalid txid {}: {}", s, e)))
}

/// Script type of the user's funding payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundingPaymentType {
    /// Native segwit v0, single key
    Wpkh,
    /// BIP-86 taproot, key path only
    Tr,
}

impl FromStr for FundingPaymentType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wpkh" | "p2wpkh" => Ok(FundingPaymentType::Wpkh),
            "tr" | "p2tr" => Ok(FundingPaymentType::Tr),
            other => Err(VaultError::InvalidPaymentType(other.to_string())),
        }
    }
}

impl fmt::Display for FundingPaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FundingPaymentType::Wpkh => write!(f, "wpkh"),
            FundingPaymentType::Tr => write!(f, "tr"),
        }
    }
}

/// Which vault transaction a PSBT represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Funding,
    Deposit,
    Withdraw,
}

impl FromStr for TransactionType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "funding" => Ok(TransactionType::Funding),
            "deposit" => Ok(TransactionType::Deposit),
            "withdraw" | "withdrawal" => Ok(TransactionType::Withdraw),
            other => Err(VaultError::InvalidTransactionType(other.to_string())),
        }
    }
}

/// User single-key payment that funds the vault and receives change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingPayment {
    pub payment_type: FundingPaymentType,
    pub public_key: PublicKey,
    pub address: Address,
}

impl FundingPayment {
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.public_key.x_only_public_key().0
    }
}

/// 2-of-2 taproot script payment locking the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigPayment {
    /// Unspendable internal key committed to the vault uuid
    pub internal_key: XOnlyPublicKey,
    /// Participant keys in script order
    pub keys: [XOnlyPublicKey; 2],
    pub leaf_script: ScriptBuf,
    pub spend_info: TaprootSpendInfo,
    pub address: Address,
}

impl MultisigPayment {
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.leaf_script, LeafVersion::TapScript)
    }

    pub fn control_block(&self) -> Result<ControlBlock, VaultError> {
        self.spend_info
            .control_block(&(self.leaf_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| VaultError::Taproot("multisig leaf missing from tree".into()))
    }
}

/// Funding and multisig payments of one vault session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInformation {
    pub funding_payment: FundingPayment,
    pub multisig_payment: MultisigPayment,
}

/// A spendable output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}
