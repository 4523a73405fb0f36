use bitcoin::{Amount, Txid};
use thiserror::Error;

/// Errors from vault construction, building and signing
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Insufficient funds: have {available} sat, need {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("UTXO selection failed: inputs total {available} sat, outputs and fee need {required} sat")]
    UtxoSelectionFailed { available: u64, required: u64 },

    #[error("Withdrawal of {requested} sat exceeds locked value of {locked} sat")]
    WithdrawExceedsLocked { requested: u64, locked: u64 },

    #[error("Amount {0} sat is below the dust limit")]
    AmountBelowDust(u64),

    #[error("No output paying the multisig address in transaction {0}")]
    AddressNotFound(Txid),

    #[error("Vault has no funding transaction")]
    PaymentNotSet,

    #[error("Invalid payment type: {0}")]
    InvalidPaymentType(String),

    #[error("Invalid transaction type: {0}")]
    InvalidTransactionType(String),

    #[error("Signature generation failed: {0}")]
    SignatureGenerationFailed(String),

    #[error("Network error while {context}: {source}")]
    Network {
        context: &'static str,
        #[source]
        source: dlc_btc_esplora::Error,
    },

    #[error("Fee rate unavailable: {0}")]
    FeeRateUnavailable(String),

    #[error("Invalid vault uuid: {0}")]
    InvalidUuid(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Fee of {0} basis points exceeds 100%")]
    InvalidFeeBasisPoints(u64),

    #[error("Invalid fee recipient: {0}")]
    InvalidFeeRecipient(String),

    #[error("BIP-32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("Taproot construction failed: {0}")]
    Taproot(String),

    #[error("Wallet policy mismatch: {0}")]
    WalletPolicyMismatch(String),

    #[error("Hardware wallet error: {0}")]
    Device(String),

    #[error("Remote signer error: {0}")]
    RemoteSigner(String),

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("Sighash error: {0}")]
    Sighash(String),
}

impl VaultError {
    pub(crate) fn network(context: &'static str) -> impl FnOnce(dlc_btc_esplora::Error) -> Self {
        move |source| VaultError::Network { context, source }
    }

    pub(crate) fn insufficient(available: Amount, required: Amount) -> Self {
        VaultError::InsufficientFunds {
            available: available.to_sat(),
            required: required.to_sat(),
        }
    }
}
