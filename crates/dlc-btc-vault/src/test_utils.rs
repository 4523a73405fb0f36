//! Shared test utilities for dlc-btc-vault tests.
//!
//! Deterministic keys, vault payments, funding UTXOs and an in-memory
//! [`BlockchainApi`] used across the test modules.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use dlc_btc_esplora::{
    AddressUtxo, BlockFeeRates, BlockchainApi, Error as EsploraError, MempoolBlock,
    RecommendedFees, TxStatus,
};

use crate::keys::AttestorGroupKey;
use crate::payment::{funding_payment, multisig_payment_for_vault};
use crate::types::{FundingPaymentType, PaymentInformation, Utxo, VaultUuid};

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
pub fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk)
}

/// User wallet root key.
pub fn test_xpriv() -> Xpriv {
    Xpriv::new_master(Network::Regtest, &[0x11; 32]).unwrap()
}

/// Attestor group key as an extended public key.
pub fn test_attestor_key() -> AttestorGroupKey {
    let secp = Secp256k1::new();
    let xpriv = Xpriv::new_master(Network::Regtest, &[0x55; 32]).unwrap();
    AttestorGroupKey::Extended(Xpub::from_priv(&secp, &xpriv))
}

/// Payments for a fixed vault, user keys from [`test_keypair`].
pub fn test_payment_information(funding_type: FundingPaymentType) -> PaymentInformation {
    let (_, funding_pk) = test_keypair(1);
    let (_, multisig_pk) = test_keypair(2);
    let multisig_payment = multisig_payment_for_vault(
        &VaultUuid([0x42; 32]),
        &test_attestor_key(),
        &multisig_pk.x_only_public_key().0,
        Network::Regtest,
    )
    .unwrap();

    PaymentInformation {
        funding_payment: funding_payment(&funding_pk, funding_type, Network::Regtest),
        multisig_payment,
    }
}

pub fn test_utxo(txid_byte: u8, vout: u32, value: u64, script_pubkey: &ScriptBuf) -> Utxo {
    Utxo {
        txid: Txid::from_byte_array([txid_byte; 32]),
        vout,
        value: Amount::from_sat(value),
        script_pubkey: script_pubkey.clone(),
    }
}

/// A confirmed-looking vault transaction with one multisig output.
pub fn vault_transaction(payment: &PaymentInformation, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([0xee; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: payment.multisig_payment.script_pubkey(),
        }],
    }
}

/// Verify one input against libbitcoinconsensus.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    spent: &[TxOut],
) -> Result<(), bitcoinconsensus::Error> {
    let tx_bytes = bitcoin::consensus::encode::serialize(tx);
    let spent_utxos: Vec<bitcoinconsensus::Utxo> = spent
        .iter()
        .map(|o| bitcoinconsensus::Utxo {
            script_pubkey: o.script_pubkey.as_bytes().as_ptr(),
            script_pubkey_len: o.script_pubkey.len() as u32,
            value: o.value.to_sat() as i64,
        })
        .collect();

    let prevout = &spent[input_index];
    bitcoinconsensus::verify(
        prevout.script_pubkey.as_bytes(),
        prevout.value.to_sat(),
        &tx_bytes,
        Some(&spent_utxos),
        input_index,
    )
}

/// In-memory chain backing [`BlockchainApi`].
pub struct MockChain {
    pub network: Network,
    pub utxos: Mutex<HashMap<ScriptBuf, Vec<AddressUtxo>>>,
    pub transactions: Mutex<HashMap<Txid, Transaction>>,
    pub statuses: Mutex<HashMap<Txid, TxStatus>>,
    pub tip: Mutex<u32>,
    pub block_fee_rates: Vec<BlockFeeRates>,
    pub mempool_blocks: Vec<MempoolBlock>,
    pub recommended: RecommendedFees,
    /// Fee endpoints answer with a server error
    pub fail_fees: bool,
    pub broadcasts: Mutex<Vec<Transaction>>,
}

impl MockChain {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            utxos: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            tip: Mutex::new(800_000),
            block_fee_rates: vec![
                BlockFeeRates {
                    avg_height: 799_998,
                    timestamp: 0,
                    avg_fee_50: 4.0,
                },
                BlockFeeRates {
                    avg_height: 799_999,
                    timestamp: 0,
                    avg_fee_50: 6.0,
                },
            ],
            mempool_blocks: vec![MempoolBlock {
                block_size: 0,
                n_tx: 0,
                median_fee: 7.5,
            }],
            recommended: RecommendedFees {
                fastest_fee: 8.0,
                half_hour_fee: 6.0,
                hour_fee: 5.0,
                economy_fee: 2.0,
                minimum_fee: 1.0,
            },
            fail_fees: false,
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn add_utxo(&self, utxo: &Utxo) {
        self.utxos
            .lock()
            .unwrap()
            .entry(utxo.script_pubkey.clone())
            .or_default()
            .push(AddressUtxo {
                txid: utxo.txid,
                vout: utxo.vout,
                value: utxo.value.to_sat(),
                status: TxStatus {
                    confirmed: true,
                    block_height: Some(1),
                    block_hash: None,
                    block_time: None,
                },
            });
    }

    /// Store a transaction, confirmed at `height` when given.
    pub fn add_transaction(&self, tx: Transaction, height: Option<u32>) {
        let txid = tx.compute_txid();
        self.transactions.lock().unwrap().insert(txid, tx);
        self.statuses.lock().unwrap().insert(
            txid,
            TxStatus {
                confirmed: height.is_some(),
                block_height: height,
                block_hash: None,
                block_time: None,
            },
        );
    }

    pub fn set_tip(&self, height: u32) {
        *self.tip.lock().unwrap() = height;
    }

    fn fee_error(&self, path: &str) -> EsploraError {
        EsploraError::Status {
            url: format!("mock://{}", path),
            status: 503,
            body: "unavailable".into(),
        }
    }
}

#[async_trait]
impl BlockchainApi for MockChain {
    fn network(&self) -> Network {
        self.network
    }

    async fn address_utxos(&self, address: &Address) -> Result<Vec<AddressUtxo>, EsploraError> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(&address.script_pubkey())
            .cloned()
            .unwrap_or_default())
    }

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, EsploraError> {
        self.transactions
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or(EsploraError::TxNotFound(*txid))
    }

    async fn transaction_status(&self, txid: &Txid) -> Result<TxStatus, EsploraError> {
        self.statuses
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or(EsploraError::TxNotFound(*txid))
    }

    async fn tip_height(&self) -> Result<u32, EsploraError> {
        Ok(*self.tip.lock().unwrap())
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, EsploraError> {
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid())
    }

    async fn block_fee_rates(&self) -> Result<Vec<BlockFeeRates>, EsploraError> {
        if self.fail_fees {
            return Err(self.fee_error("fee-rates"));
        }
        Ok(self.block_fee_rates.clone())
    }

    async fn mempool_blocks(&self) -> Result<Vec<MempoolBlock>, EsploraError> {
        if self.fail_fees {
            return Err(self.fee_error("mempool-blocks"));
        }
        Ok(self.mempool_blocks.clone())
    }

    async fn recommended_fees(&self) -> Result<RecommendedFees, EsploraError> {
        if self.fail_fees {
            return Err(self.fee_error("recommended"));
        }
        Ok(self.recommended)
    }
}
