//! Vault lifecycle events derived from consecutive ledger snapshots.

use serde::{Deserialize, Serialize};

use crate::types::{RawVault, TransactionType, VaultStatus, VaultUuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultEventKind {
    SetupComplete,
    MintPending,
    MintComplete,
    WithdrawPending,
    WithdrawComplete,
    BurnComplete,
}

/// What changed between two snapshots of one vault.
///
/// `value` is in satoshis: the pending locked value for pending events and
/// the size of the change for completed ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEvent {
    pub kind: VaultEventKind,
    pub vault_id: VaultUuid,
    pub value: u64,
}

impl VaultEvent {
    /// PSBT the vault owner builds next, if any.
    ///
    /// A new vault is funded; burned tokens are redeemed with a withdrawal.
    /// Everything else waits on the attestors or the user.
    pub fn next_operation(&self) -> Option<TransactionType> {
        match self.kind {
            VaultEventKind::SetupComplete => Some(TransactionType::Funding),
            VaultEventKind::BurnComplete => Some(TransactionType::Withdraw),
            VaultEventKind::MintPending
            | VaultEventKind::MintComplete
            | VaultEventKind::WithdrawPending
            | VaultEventKind::WithdrawComplete => None,
        }
    }
}

fn event(kind: VaultEventKind, vault: &RawVault, value: u64) -> Option<VaultEvent> {
    Some(VaultEvent {
        kind,
        vault_id: vault.uuid,
        value,
    })
}

/// Classify the transition from `previous` to `current`.
///
/// `previous` is `None` the first time a vault is seen. Returns `None` when
/// nothing meaningful changed.
pub fn classify_vault_event(previous: Option<&RawVault>, current: &RawVault) -> Option<VaultEvent> {
    let Some(previous) = previous else {
        return match current.status {
            VaultStatus::Ready => event(VaultEventKind::SetupComplete, current, 0),
            VaultStatus::Pending => event(VaultEventKind::MintPending, current, current.value_locked),
            VaultStatus::Funded => event(VaultEventKind::MintComplete, current, current.value_minted),
            VaultStatus::Closing | VaultStatus::Closed => None,
        };
    };

    if current.status == VaultStatus::Pending && previous.status != VaultStatus::Pending {
        let new_withdrawal =
            !current.withdraw_tx_id.is_empty() && current.withdraw_tx_id != previous.withdraw_tx_id;
        let kind = if new_withdrawal {
            VaultEventKind::WithdrawPending
        } else {
            VaultEventKind::MintPending
        };
        return event(kind, current, current.value_locked);
    }

    if current.value_minted > previous.value_minted {
        return event(
            VaultEventKind::MintComplete,
            current,
            current.value_minted - previous.value_minted,
        );
    }
    if current.value_minted < previous.value_minted {
        return event(
            VaultEventKind::BurnComplete,
            current,
            previous.value_minted - current.value_minted,
        );
    }
    if current.value_locked < previous.value_locked {
        return event(
            VaultEventKind::WithdrawComplete,
            current,
            previous.value_locked - current.value_locked,
        );
    }
    None
}
