//! Chain-facing transaction handlers.
//!
//! These glue a [`VaultSession`], a vault snapshot and a [`BlockchainApi`]
//! together: fetch UTXOs and the current vault transaction, resolve a fee
//! rate, then hand everything to the pure builders.

use bitcoin::psbt::Psbt;
use bitcoin::{Amount, ScriptBuf, Transaction, Txid};
use dlc_btc_esplora::BlockchainApi;

use crate::builder::{build_deposit_psbt, build_funding_psbt, build_withdraw_psbt};
use crate::error::VaultError;
use crate::fees::fee_amount;
use crate::payment::fee_recipient_script;
use crate::signer::VaultSession;
use crate::types::{FundingPaymentType, RawVault, Utxo};
use crate::utxo::{get_spendable_outputs, resolve_fee_rate};

fn check_vault(session: &VaultSession, vault: &RawVault) -> Result<ScriptBuf, VaultError> {
    if session.uuid != vault.uuid {
        return Err(VaultError::InvalidUuid(format!(
            "session is for vault {}, snapshot is for {}",
            session.uuid, vault.uuid
        )));
    }
    fee_recipient_script(&vault.btc_fee_recipient, session.network)
}

async fn funding_utxos_covering<A: BlockchainApi + ?Sized>(
    api: &A,
    session: &VaultSession,
    required: Amount,
) -> Result<Vec<Utxo>, VaultError> {
    let utxos = get_spendable_outputs(api, &session.payment.funding_payment.address).await?;
    let balance: Amount = utxos.iter().map(|u| u.value).sum();
    if balance < required {
        return Err(VaultError::insufficient(balance, required));
    }
    Ok(utxos)
}

async fn current_vault_transaction<A: BlockchainApi + ?Sized>(
    api: &A,
    vault: &RawVault,
) -> Result<Transaction, VaultError> {
    let txid = vault.funding_txid()?.ok_or(VaultError::PaymentNotSet)?;
    api.transaction(&txid)
        .await
        .map_err(VaultError::network("fetching vault transaction"))
}

/// Attach full previous transactions to segwit v0 funding inputs.
///
/// Some signers refuse segwit v0 inputs without them. Failures are logged
/// and the input is left with only its witness UTXO.
async fn attach_previous_transactions<A: BlockchainApi + ?Sized>(
    api: &A,
    session: &VaultSession,
    psbt: &mut Psbt,
) {
    if session.payment.funding_payment.payment_type != FundingPaymentType::Wpkh {
        return;
    }
    let funding_script = session.payment.funding_payment.script_pubkey();

    for (txin, input) in psbt.unsigned_tx.input.iter().zip(psbt.inputs.iter_mut()) {
        let is_funding = input
            .witness_utxo
            .as_ref()
            .map_or(false, |o| o.script_pubkey == funding_script);
        if !is_funding {
            continue;
        }
        let txid = txin.previous_output.txid;
        match api.transaction(&txid).await {
            Ok(tx) => input.non_witness_utxo = Some(tx),
            Err(e) => log::warn!("Could not attach previous transaction {}: {}", txid, e),
        }
    }
}

/// Unsigned funding PSBT locking `amount` in a new vault.
pub async fn create_funding_transaction<A: BlockchainApi + ?Sized>(
    api: &A,
    session: &VaultSession,
    vault: &RawVault,
    amount: Amount,
    fee_rate_multiplier: Option<f64>,
) -> Result<Psbt, VaultError> {
    let fee_recipient = check_vault(session, vault)?;
    let protocol_fee = fee_amount(amount, vault.btc_mint_fee_basis_points)?;
    let utxos = funding_utxos_covering(api, session, amount + protocol_fee).await?;
    let fee_rate = resolve_fee_rate(api, fee_rate_multiplier).await?;

    let mut psbt = build_funding_psbt(
        &session.payment,
        &utxos,
        amount,
        &fee_recipient,
        vault.btc_mint_fee_basis_points,
        fee_rate,
    )?;
    attach_previous_transactions(api, session, &mut psbt).await;
    Ok(psbt)
}

/// Unsigned deposit PSBT adding `amount` to a funded vault.
pub async fn create_deposit_transaction<A: BlockchainApi + ?Sized>(
    api: &A,
    session: &VaultSession,
    vault: &RawVault,
    amount: Amount,
    fee_rate_multiplier: Option<f64>,
) -> Result<Psbt, VaultError> {
    let fee_recipient = check_vault(session, vault)?;
    let vault_tx = current_vault_transaction(api, vault).await?;
    let protocol_fee = fee_amount(amount, vault.btc_mint_fee_basis_points)?;
    let utxos = funding_utxos_covering(api, session, amount + protocol_fee).await?;
    let fee_rate = resolve_fee_rate(api, fee_rate_multiplier).await?;

    let mut psbt = build_deposit_psbt(
        &session.payment,
        &vault_tx,
        &utxos,
        amount,
        &fee_recipient,
        vault.btc_mint_fee_basis_points,
        fee_rate,
    )?;
    attach_previous_transactions(api, session, &mut psbt).await;
    Ok(psbt)
}

/// Unsigned withdrawal PSBT releasing `amount` from a vault.
pub async fn create_withdraw_transaction<A: BlockchainApi + ?Sized>(
    api: &A,
    session: &VaultSession,
    vault: &RawVault,
    amount: Amount,
    fee_rate_multiplier: Option<f64>,
) -> Result<Psbt, VaultError> {
    let fee_recipient = check_vault(session, vault)?;
    let vault_tx = current_vault_transaction(api, vault).await?;
    let fee_rate = resolve_fee_rate(api, fee_rate_multiplier).await?;

    build_withdraw_psbt(
        &session.payment,
        &vault_tx,
        amount,
        &fee_recipient,
        vault.btc_redeem_fee_basis_points,
        fee_rate,
    )
}

/// BIP-174 serialization of a PSBT.
pub fn psbt_bytes(psbt: &Psbt) -> Vec<u8> {
    psbt.serialize()
}

/// Extract the finalized transaction and broadcast it.
pub async fn broadcast_psbt<A: BlockchainApi + ?Sized>(api: &A, psbt: Psbt) -> Result<Txid, VaultError> {
    let tx = psbt
        .extract_tx()
        .map_err(|e| VaultError::Psbt(format!("cannot extract transaction: {}", e)))?;
    let txid = api
        .broadcast(&tx)
        .await
        .map_err(VaultError::network("broadcasting transaction"))?;
    log::info!("Broadcast transaction {}", txid);
    Ok(txid)
}
