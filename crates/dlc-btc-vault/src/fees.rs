//! Protocol fees, miner fee estimation and fee-rate reconciliation.

use bitcoin::{Amount, ScriptBuf};
use dlc_btc_esplora::{BlockFeeRates, MempoolBlock, RecommendedFees};

use crate::error::VaultError;

/// Outputs below this value are never created.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Fixed fee rate on regtest, in sat/vB.
pub const REGTEST_FEE_RATE: u64 = 2;

/// Version, locktime, counts, segwit marker and flag.
const TX_OVERHEAD_WEIGHT: u64 = 42;
/// Outpoint, empty script_sig and sequence.
const INPUT_BASE_WEIGHT: u64 = 164;
/// Witness: count, DER signature with sighash byte, compressed key.
const WPKH_WITNESS_WEIGHT: u64 = 108;
/// Witness: count, 64-byte Schnorr signature.
const TR_KEY_WITNESS_WEIGHT: u64 = 66;
/// Witness: count, two Schnorr signatures, 68-byte leaf script, 33-byte control block.
const MULTISIG_WITNESS_WEIGHT: u64 = 234;

/// Basis points in 100%.
pub const MAX_FEE_BASIS_POINTS: u64 = 10_000;

/// Protocol fee for an amount: `floor(amount * bps / 10000)`.
///
/// A fee above 100% of the amount is rejected.
pub fn fee_amount(amount: Amount, basis_points: u64) -> Result<Amount, VaultError> {
    if basis_points > MAX_FEE_BASIS_POINTS {
        return Err(VaultError::InvalidFeeBasisPoints(basis_points));
    }
    let fee = u128::from(amount.to_sat()) * u128::from(basis_points) / u128::from(MAX_FEE_BASIS_POINTS);
    let fee = u64::try_from(fee).map_err(|_| VaultError::InvalidFeeBasisPoints(basis_points))?;
    Ok(Amount::from_sat(fee))
}

/// How an input will be spent, which fixes its witness size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendKind {
    Wpkh,
    TaprootKeyPath,
    MultisigScriptPath,
}

impl SpendKind {
    pub fn weight(self) -> u64 {
        INPUT_BASE_WEIGHT
            + match self {
                SpendKind::Wpkh => WPKH_WITNESS_WEIGHT,
                SpendKind::TaprootKeyPath => TR_KEY_WITNESS_WEIGHT,
                SpendKind::MultisigScriptPath => MULTISIG_WITNESS_WEIGHT,
            }
    }
}

/// Weight of an output: value, script length and script.
pub fn output_weight(script_pubkey: &ScriptBuf) -> u64 {
    (9 + script_pubkey.len() as u64) * 4
}

/// Miner fee for a transaction shape at `fee_rate` sat/vB.
pub fn estimate_fee<'a>(
    inputs: impl IntoIterator<Item = SpendKind>,
    outputs: impl IntoIterator<Item = &'a ScriptBuf>,
    fee_rate: u64,
) -> Amount {
    let weight = TX_OVERHEAD_WEIGHT
        + inputs.into_iter().map(SpendKind::weight).sum::<u64>()
        + outputs.into_iter().map(output_weight).sum::<u64>();
    Amount::from_sat(weight.div_ceil(4) * fee_rate)
}

/// Combine the three mempool.space signals into one rate.
///
/// Each signal is scaled by `multiplier`; the highest wins and is rounded up.
pub fn reconcile_fee_rates(
    block_fee_rates: &[BlockFeeRates],
    mempool_blocks: &[MempoolBlock],
    recommended: &RecommendedFees,
    multiplier: f64,
) -> Result<u64, VaultError> {
    let recent = &block_fee_rates[block_fee_rates.len().saturating_sub(2)..];
    if recent.is_empty() {
        return Err(VaultError::FeeRateUnavailable("no recent block fee rates".into()));
    }
    let last_blocks = recent.iter().map(|b| b.avg_fee_50).sum::<f64>() / recent.len() as f64;

    let next_block = mempool_blocks
        .first()
        .map(|b| b.median_fee)
        .ok_or_else(|| VaultError::FeeRateUnavailable("no projected mempool blocks".into()))?;

    let candidates = [last_blocks, next_block, recommended.fastest_fee];
    log::debug!(
        "Fee rate signals: last blocks {:.2}, mempool {:.2}, recommended {:.2} (x{})",
        candidates[0],
        candidates[1],
        candidates[2],
        multiplier
    );

    let rate = candidates
        .iter()
        .map(|r| r * multiplier)
        .fold(0.0_f64, f64::max)
        .ceil();

    if !rate.is_finite() || rate < 1.0 {
        return Err(VaultError::FeeRateUnavailable(format!("unusable fee rate {}", rate)));
    }
    Ok(rate as u64)
}
