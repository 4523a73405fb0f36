//! UTXO discovery and fee-rate resolution over a [`BlockchainApi`].

use bitcoin::{Address, Amount, Network};
use dlc_btc_esplora::BlockchainApi;

use crate::error::VaultError;
use crate::fees::{reconcile_fee_rates, REGTEST_FEE_RATE};
use crate::types::Utxo;

/// Spendable outputs paying `address`, annotated with its script.
pub async fn get_spendable_outputs<A: BlockchainApi + ?Sized>(
    api: &A,
    address: &Address,
) -> Result<Vec<Utxo>, VaultError> {
    let script_pubkey = address.script_pubkey();
    let utxos = api
        .address_utxos(address)
        .await
        .map_err(VaultError::network("fetching address utxos"))?;

    log::debug!("Found {} UTXOs for {}", utxos.len(), address);

    Ok(utxos
        .into_iter()
        .map(|u| Utxo {
            txid: u.txid,
            vout: u.vout,
            value: Amount::from_sat(u.value),
            script_pubkey: script_pubkey.clone(),
        })
        .collect())
}

/// Sum of spendable outputs paying `address`.
pub async fn get_balance<A: BlockchainApi + ?Sized>(
    api: &A,
    address: &Address,
) -> Result<Amount, VaultError> {
    let utxos = get_spendable_outputs(api, address).await?;
    Ok(utxos.iter().map(|u| u.value).sum())
}

/// Current fee rate in sat/vB.
///
/// Regtest always uses [`REGTEST_FEE_RATE`]. Elsewhere the three fee
/// signals are fetched concurrently; if any of them fails, so does this.
pub async fn resolve_fee_rate<A: BlockchainApi + ?Sized>(
    api: &A,
    multiplier: Option<f64>,
) -> Result<u64, VaultError> {
    if api.network() == Network::Regtest {
        return Ok(REGTEST_FEE_RATE);
    }

    let (block_fee_rates, mempool_blocks, recommended) = futures::join!(
        api.block_fee_rates(),
        api.mempool_blocks(),
        api.recommended_fees()
    );

    let block_fee_rates = block_fee_rates.map_err(VaultError::network("fetching block fee rates"))?;
    let mempool_blocks = mempool_blocks.map_err(VaultError::network("fetching mempool blocks"))?;
    let recommended = recommended.map_err(VaultError::network("fetching recommended fees"))?;

    let rate = reconcile_fee_rates(
        &block_fee_rates,
        &mempool_blocks,
        &recommended,
        multiplier.unwrap_or(1.0),
    )?;
    log::info!("Resolved fee rate: {} sat/vB", rate);
    Ok(rate)
}
