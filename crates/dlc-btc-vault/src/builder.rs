//! Funding, deposit and withdrawal PSBT construction.
//!
//! Builders are pure: they take already-fetched UTXOs and a fee rate and
//! return an unsigned PSBT. Every input carries its `witness_utxo`, and
//! multisig inputs carry the tap leaf and control block a signer needs.

use bitcoin::psbt::Psbt;
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::{Transaction, TxIn, Version};
use bitcoin::{absolute, Amount, ScriptBuf, Sequence, TxOut};

use crate::error::VaultError;
use crate::fees::{estimate_fee, fee_amount, SpendKind, DUST_LIMIT};
use crate::types::{FundingPaymentType, PaymentInformation, Utxo};

/// Sequence of the first funding input.
pub const FUNDING_INPUT_SEQUENCE: Sequence = Sequence(0xfffffff0);

/// Inputs and outputs chosen for a transaction.
///
/// `sum(outputs) + fee == sum(inputs)` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub inputs: Vec<(Utxo, SpendKind)>,
    pub outputs: Vec<TxOut>,
    pub change: Option<Amount>,
    pub fee: Amount,
}

impl CoinSelection {
    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|(u, _)| u.value).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// Select inputs covering `outputs` plus the miner fee.
///
/// `fixed` inputs are always spent, in order. Candidates are added largest
/// first (ties broken by txid then vout) until the outputs and fee are
/// covered. A change output is added only when it would not be dust;
/// otherwise the excess goes to the miner. Outputs below the dust limit are
/// dropped before selection.
pub fn select_coins(
    fixed: Vec<(Utxo, SpendKind)>,
    candidates: &[Utxo],
    candidate_kind: SpendKind,
    outputs: Vec<TxOut>,
    change_script: &ScriptBuf,
    fee_rate: u64,
) -> Result<CoinSelection, VaultError> {
    let outputs: Vec<TxOut> = outputs
        .into_iter()
        .filter(|o| {
            let keep = o.value >= DUST_LIMIT;
            if !keep {
                log::debug!("Dropping dust output of {} sat", o.value.to_sat());
            }
            keep
        })
        .collect();
    let target: Amount = outputs.iter().map(|o| o.value).sum();

    let mut sorted: Vec<&Utxo> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });
    let mut remaining = sorted.into_iter();

    let mut selected = fixed;
    loop {
        let total_in: Amount = selected.iter().map(|(u, _)| u.value).sum();
        let kinds: Vec<SpendKind> = selected.iter().map(|(_, k)| *k).collect();
        let fee = estimate_fee(
            kinds.iter().copied(),
            outputs.iter().map(|o| &o.script_pubkey),
            fee_rate,
        );

        if total_in >= target + fee {
            let fee_with_change = estimate_fee(
                kinds.iter().copied(),
                outputs
                    .iter()
                    .map(|o| &o.script_pubkey)
                    .chain(std::iter::once(change_script)),
                fee_rate,
            );

            let mut outputs = outputs;
            let (fee, change) = match total_in.checked_sub(target + fee_with_change) {
                Some(change) if change >= DUST_LIMIT => {
                    outputs.push(TxOut {
                        value: change,
                        script_pubkey: change_script.clone(),
                    });
                    (fee_with_change, Some(change))
                }
                _ => (total_in - target, None),
            };

            log::debug!(
                "Selected {} inputs ({} sat), fee {} sat, change {:?}",
                selected.len(),
                total_in.to_sat(),
                fee.to_sat(),
                change.map(|c| c.to_sat())
            );

            return Ok(CoinSelection {
                inputs: selected,
                outputs,
                change,
                fee,
            });
        }

        match remaining.next() {
            Some(utxo) => selected.push((utxo.clone(), candidate_kind)),
            None => {
                return Err(VaultError::UtxoSelectionFailed {
                    available: total_in.to_sat(),
                    required: (target + fee).to_sat(),
                })
            }
        }
    }
}

/// First output of `vault_tx` paying the multisig script.
pub fn find_multisig_utxo(vault_tx: &Transaction, multisig_script: &ScriptBuf) -> Result<Utxo, VaultError> {
    let txid = vault_tx.compute_txid();
    vault_tx
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| &out.script_pubkey == multisig_script)
        .map(|(vout, out)| Utxo {
            txid,
            vout: vout as u32,
            value: out.value,
            script_pubkey: out.script_pubkey.clone(),
        })
        .ok_or(VaultError::AddressNotFound(txid))
}

fn funding_spend_kind(payment: &PaymentInformation) -> SpendKind {
    match payment.funding_payment.payment_type {
        FundingPaymentType::Wpkh => SpendKind::Wpkh,
        FundingPaymentType::Tr => SpendKind::TaprootKeyPath,
    }
}

fn ensure_not_dust(amount: Amount) -> Result<(), VaultError> {
    if amount < DUST_LIMIT {
        return Err(VaultError::AmountBelowDust(amount.to_sat()));
    }
    Ok(())
}

fn assemble_psbt(
    selection: CoinSelection,
    first_input_sequence: Sequence,
    payment: &PaymentInformation,
) -> Result<Psbt, VaultError> {
    let input: Vec<TxIn> = selection
        .inputs
        .iter()
        .enumerate()
        .map(|(i, (utxo, _))| TxIn {
            previous_output: utxo.outpoint(),
            sequence: if i == 0 {
                first_input_sequence
            } else {
                Sequence::ENABLE_RBF_NO_LOCKTIME
            },
            ..Default::default()
        })
        .collect();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input,
        output: selection.outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| VaultError::Psbt(e.to_string()))?;

    let multisig = &payment.multisig_payment;
    for (i, (utxo, kind)) in selection.inputs.iter().enumerate() {
        let psbt_input = &mut psbt.inputs[i];
        psbt_input.witness_utxo = Some(utxo.txout());

        match kind {
            SpendKind::MultisigScriptPath => {
                let control_block = multisig.control_block()?;
                psbt_input
                    .tap_scripts
                    .insert(control_block, (multisig.leaf_script.clone(), LeafVersion::TapScript));
                psbt_input.tap_internal_key = Some(multisig.internal_key);
                psbt_input.tap_merkle_root = multisig.spend_info.merkle_root();
            }
            SpendKind::TaprootKeyPath => {
                psbt_input.tap_internal_key = Some(payment.funding_payment.x_only_public_key());
            }
            SpendKind::Wpkh => {}
        }
    }

    Ok(psbt)
}

/// Lock `deposit` in a new vault.
///
/// Outputs: `[multisig: deposit, fee recipient: fee]`, change back to the
/// funding address.
pub fn build_funding_psbt(
    payment: &PaymentInformation,
    funding_utxos: &[Utxo],
    deposit: Amount,
    fee_recipient: &ScriptBuf,
    fee_basis_points: u64,
    fee_rate: u64,
) -> Result<Psbt, VaultError> {
    ensure_not_dust(deposit)?;

    let outputs = vec![
        TxOut {
            value: deposit,
            script_pubkey: payment.multisig_payment.script_pubkey(),
        },
        TxOut {
            value: fee_amount(deposit, fee_basis_points)?,
            script_pubkey: fee_recipient.clone(),
        },
    ];

    let selection = select_coins(
        Vec::new(),
        funding_utxos,
        funding_spend_kind(payment),
        outputs,
        &payment.funding_payment.script_pubkey(),
        fee_rate,
    )?;

    log::info!(
        "Built funding PSBT: lock {} sat, miner fee {} sat",
        deposit.to_sat(),
        selection.fee.to_sat()
    );
    assemble_psbt(selection, FUNDING_INPUT_SEQUENCE, payment)
}

/// Add `deposit` to an existing vault.
///
/// Spends the vault's multisig output first, then funding UTXOs. Outputs:
/// `[fee recipient: fee, multisig: locked + deposit]`, change to the
/// funding address.
pub fn build_deposit_psbt(
    payment: &PaymentInformation,
    vault_tx: &Transaction,
    funding_utxos: &[Utxo],
    deposit: Amount,
    fee_recipient: &ScriptBuf,
    fee_basis_points: u64,
    fee_rate: u64,
) -> Result<Psbt, VaultError> {
    ensure_not_dust(deposit)?;

    let multisig_script = payment.multisig_payment.script_pubkey();
    let multisig_utxo = find_multisig_utxo(vault_tx, &multisig_script)?;
    let locked = multisig_utxo.value;

    let outputs = vec![
        TxOut {
            value: fee_amount(deposit, fee_basis_points)?,
            script_pubkey: fee_recipient.clone(),
        },
        TxOut {
            value: locked + deposit,
            script_pubkey: multisig_script,
        },
    ];

    let selection = select_coins(
        vec![(multisig_utxo, SpendKind::MultisigScriptPath)],
        funding_utxos,
        funding_spend_kind(payment),
        outputs,
        &payment.funding_payment.script_pubkey(),
        fee_rate,
    )?;

    log::info!(
        "Built deposit PSBT: {} sat -> {} sat locked, miner fee {} sat",
        locked.to_sat(),
        (locked + deposit).to_sat(),
        selection.fee.to_sat()
    );
    assemble_psbt(selection, Sequence::ENABLE_RBF_NO_LOCKTIME, payment)
}

/// Release `withdraw` from a vault.
///
/// Spends only the multisig output. Outputs: `[fee recipient: fee]` plus the
/// remaining locked value back to the multisig when non-zero; the released
/// value is the change paying the funding address.
pub fn build_withdraw_psbt(
    payment: &PaymentInformation,
    vault_tx: &Transaction,
    withdraw: Amount,
    fee_recipient: &ScriptBuf,
    fee_basis_points: u64,
    fee_rate: u64,
) -> Result<Psbt, VaultError> {
    ensure_not_dust(withdraw)?;

    let multisig_script = payment.multisig_payment.script_pubkey();
    let multisig_utxo = find_multisig_utxo(vault_tx, &multisig_script)?;
    let locked = multisig_utxo.value;

    let remainder = locked
        .checked_sub(withdraw)
        .ok_or(VaultError::WithdrawExceedsLocked {
            requested: withdraw.to_sat(),
            locked: locked.to_sat(),
        })?;

    let mut outputs = vec![TxOut {
        value: fee_amount(withdraw, fee_basis_points)?,
        script_pubkey: fee_recipient.clone(),
    }];
    if remainder > Amount::ZERO {
        outputs.push(TxOut {
            value: remainder,
            script_pubkey: multisig_script,
        });
    }

    let selection = select_coins(
        vec![(multisig_utxo, SpendKind::MultisigScriptPath)],
        &[],
        SpendKind::MultisigScriptPath,
        outputs,
        &payment.funding_payment.script_pubkey(),
        fee_rate,
    )?;

    log::info!(
        "Built withdraw PSBT: release {} of {} sat, miner fee {} sat",
        withdraw.to_sat(),
        locked.to_sat(),
        selection.fee.to_sat()
    );
    assemble_psbt(selection, Sequence::ENABLE_RBF_NO_LOCKTIME, payment)
}
