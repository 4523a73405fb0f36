//! DLC BTC Vault Transaction Engine
//!
//! Builds and signs the Bitcoin side of a DLC BTC vault: a 2-of-2 taproot
//! output shared between the user and the attestor group.
//!
//! # Concepts
//!
//! - **Unspendable internal key**: the NUMS point with the vault uuid as
//!   chain code, so each vault commits to its own id
//! - **Multisig payment**: one tapscript leaf
//!   `<k0> OP_CHECKSIGVERIFY <k1> OP_CHECKSIG` over the sorted user and
//!   attestor keys
//! - **Funding payment**: the user's single-key P2WPKH or P2TR address
//!
//! # Flow
//!
//! ```text
//! RawVault -> VaultSigner::create_payment_information -> VaultSession
//!          -> handler::create_{funding,deposit,withdraw}_transaction -> Psbt
//!          -> VaultSigner::sign_psbt -> attestors / broadcast
//! ```

pub mod builder;
pub mod error;
pub mod events;
pub mod fees;
pub mod handler;
pub mod keys;
pub mod payment;
pub mod proof_of_reserve;
pub mod signer;
pub mod types;
pub mod utxo;

#[cfg(test)]
mod test_utils;

pub use error::VaultError;
pub use events::{classify_vault_event, VaultEvent, VaultEventKind};
pub use keys::AttestorGroupKey;
pub use proof_of_reserve::{total_verified_reserve, verify_vault, ReserveCheck};
pub use signer::{SignerCapabilities, VaultSession, VaultSigner};
pub use types::{
    FundingPaymentType, PaymentInformation, RawVault, TransactionType, Utxo, VaultStatus, VaultUuid,
};
