// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

/// The five user-facing write actions against the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind { Deposit, Withdraw, Borrow, Repay, Approve }

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Deposit,
        ActionKind::Withdraw,
        ActionKind::Borrow,
        ActionKind::Repay,
        ActionKind::Approve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Deposit => "deposit",
            ActionKind::Withdraw => "withdraw",
            ActionKind::Borrow => "borrow",
            ActionKind::Repay => "repay",
            ActionKind::Approve => "approve",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ActionKind::Deposit => "Deposit",
            ActionKind::Withdraw => "Withdraw",
            ActionKind::Borrow => "Borrow",
            ActionKind::Repay => "Repay",
            ActionKind::Approve => "Approve",
        }
    }

    /// Fractional digits of the amount carried by this action:
    /// native asset (deposit/withdraw) uses 18, borrow asset uses 6.
    pub fn decimals(&self) -> u32 {
        match self {
            ActionKind::Deposit | ActionKind::Withdraw => 18,
            ActionKind::Borrow | ActionKind::Repay | ActionKind::Approve => 6,
        }
    }
}

/// Lifecycle of one submitted write, tracked per action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus { Idle, Submitted, Confirming, Succeeded, Failed }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub status: OpStatus,
    pub tx_handle: Option<String>,
    pub error: Option<String>,
}

impl Default for PendingOperation {
    fn default() -> Self {
        Self { status: OpStatus::Idle, tx_handle: None, error: None }
    }
}

impl PendingOperation {
    /// Submitted or Confirming: the triggering control stays disabled.
    pub fn in_flight(&self) -> bool {
        matches!(self.status, OpStatus::Submitted | OpStatus::Confirming)
    }
}

/// Result of `getAccountData(user)`, in raw on-chain units.
/// Native collateral and USD fields carry 18 fractional digits, debt 6.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub collateral_native: u128,
    pub debt_borrowed: u128,
    pub collateral_usd: u128,
    pub debt_usd: u128,
    pub max_debt_usd: u128,
    pub health_factor: u128,
}

impl PositionSnapshot {
    /// USD still available to borrow (18 fractional digits), floored at zero.
    pub fn headroom_usd(&self) -> u128 {
        self.max_debt_usd.saturating_sub(self.debt_usd)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletState {
    pub address: String,
    pub native_balance: u128,
    pub borrow_asset_balance: u128,
    pub allowance_to_pool: u128,
}

/// Latest cached reads, replaced wholesale on every refresh.
/// `snapshot`/`wallet` are `None` while unloaded (user not connected).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountView {
    pub ts_ms: i64,
    pub snapshot: Option<PositionSnapshot>,
    pub wallet: Option<WalletState>,
}

impl AccountView {
    pub fn is_loaded(&self) -> bool {
        self.snapshot.is_some() && self.wallet.is_some()
    }
}

/// An accepted write on its way to the ledger gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCall {
    pub op_id: String,
    pub kind: ActionKind,
    /// Raw units, `kind.decimals()` fractional digits.
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPhase { Submitted, Confirming, Succeeded, Failed(String) }

impl TxPhase {
    pub fn label(&self) -> &'static str {
        match self {
            TxPhase::Submitted => "submitted",
            TxPhase::Confirming => "confirming",
            TxPhase::Succeeded => "succeeded",
            TxPhase::Failed(_) => "failed",
        }
    }
}

/// Progress report from a gateway for one write call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReport {
    pub op_id: String,
    pub kind: ActionKind,
    pub tx_handle: Option<String>,
    pub phase: TxPhase,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteKind { Success, Error }

/// Single-slot, time-boxed user feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NoteKind,
    pub message: String,
    pub created_at_ms: i64,
}

/// Input coming from the control surface (REPL / demo driver).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UiEvent {
    SetInput(ActionKind, String),
    Press(ActionKind),
}

/// Envelope for the JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Snapshot(AccountView),
    Action(UiEvent),
    Tx(TxReport),
    Notice(Notification),
    Note(String),
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
