//! Proof of reserve.
//!
//! Each reported vault is checked against the chain using public data only:
//! the multisig script is rebuilt from the vault uuid, the attestor group key
//! and the user's taproot key, then matched against the funding transaction.

use bitcoin::Amount;
use dlc_btc_esplora::BlockchainApi;

use crate::error::VaultError;
use crate::keys::{parse_x_only_key, AttestorGroupKey};
use crate::payment::multisig_payment_for_vault;
use crate::types::RawVault;

/// Confirmations a funding transaction needs before it counts.
pub const MIN_CONFIRMATIONS: u32 = 6;

/// Outcome of checking one vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveCheck {
    Verified(Amount),
    NotFunded,
    Unconfirmed { confirmations: u32 },
    /// No output pays the rebuilt multisig script
    ScriptMismatch,
    ValueMismatch { expected: Amount, found: Amount },
}

impl ReserveCheck {
    /// Value this vault contributes to the reserve.
    pub fn verified_value(&self) -> Amount {
        match self {
            ReserveCheck::Verified(value) => *value,
            _ => Amount::ZERO,
        }
    }
}

/// Confirmations of a transaction mined at `block_height` with the chain at `tip`.
pub fn confirmations(tip: u32, block_height: u32) -> u32 {
    tip.saturating_sub(block_height.saturating_add(1))
}

/// Check one vault's funding output against the chain at height `tip`.
pub async fn verify_vault<A: BlockchainApi + ?Sized>(
    api: &A,
    vault: &RawVault,
    attestor_group_key: &AttestorGroupKey,
    tip: u32,
) -> Result<ReserveCheck, VaultError> {
    let Some(txid) = vault.funding_txid()? else {
        return Ok(ReserveCheck::NotFunded);
    };

    let status = api
        .transaction_status(&txid)
        .await
        .map_err(VaultError::network("fetching funding transaction status"))?;
    let confirmations = match status.block_height {
        Some(height) if status.confirmed => confirmations(tip, height),
        _ => 0,
    };
    if confirmations < MIN_CONFIRMATIONS {
        return Ok(ReserveCheck::Unconfirmed { confirmations });
    }

    let user_key = parse_x_only_key(&vault.taproot_pub_key)?;
    let multisig = multisig_payment_for_vault(&vault.uuid, attestor_group_key, &user_key, api.network())?;
    let multisig_script = multisig.script_pubkey();

    let tx = api
        .transaction(&txid)
        .await
        .map_err(VaultError::network("fetching funding transaction"))?;

    let Some(output) = tx.output.iter().find(|o| o.script_pubkey == multisig_script) else {
        return Ok(ReserveCheck::ScriptMismatch);
    };

    let expected = vault.value_locked();
    if output.value != expected {
        return Ok(ReserveCheck::ValueMismatch {
            expected,
            found: output.value,
        });
    }
    Ok(ReserveCheck::Verified(expected))
}

/// Total locked value across `vaults` that checks out on chain.
///
/// Vaults are checked concurrently. A vault that fails to verify, for any
/// reason, contributes nothing; only failing to read the chain tip is an error.
pub async fn total_verified_reserve<A: BlockchainApi + ?Sized>(
    api: &A,
    vaults: &[RawVault],
    attestor_group_key: &AttestorGroupKey,
) -> Result<Amount, VaultError> {
    let tip = api
        .tip_height()
        .await
        .map_err(VaultError::network("fetching chain tip"))?;

    let checks = vaults
        .iter()
        .map(|vault| async move { (vault, verify_vault(api, vault, attestor_group_key, tip).await) });
    let results = futures::future::join_all(checks).await;

    let mut total = Amount::ZERO;
    for (vault, result) in results {
        match result {
            Ok(check) => {
                log::debug!("Vault {}: {:?}", vault.uuid, check);
                total += check.verified_value();
            }
            Err(e) => log::warn!("Vault {} could not be verified: {}", vault.uuid, e),
        }
    }

    log::info!(
        "Proof of reserve: {} sat verified across {} vaults",
        total.to_sat(),
        vaults.len()
    );
    Ok(total)
}
