// ===============================
// src/validator.rs
// ===============================
//
// Pre-submit checks: pure and synchronous, one rule set per action kind.
// Same inputs always yield the same verdict; nothing here talks to the
// gateway. The reason strings are exactly what the notification surface
// shows the user.

use thiserror::Error;

use crate::amount::{parse_positive, scale_borrow_to_usd};
use crate::domain::{AccountView, ActionKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("invalid amount")]
    InvalidAmount,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("exceeds deposited collateral")]
    ExceedsCollateral,
    #[error("exceeds available borrow limit")]
    ExceedsBorrowLimit,
    #[error("position not loaded")]
    NotLoaded,
}

/// Check a proposed action against the latest cached view.
/// Accept returns the parsed raw amount in `kind.decimals()` units.
pub fn check(
    kind: ActionKind,
    amount_text: &str,
    view: &AccountView,
) -> Result<u128, ValidateError> {
    let (snap, wallet) = match (&view.snapshot, &view.wallet) {
        (Some(s), Some(w)) => (s, w),
        _ => return Err(ValidateError::NotLoaded),
    };

    let amount =
        parse_positive(amount_text, kind.decimals()).ok_or(ValidateError::InvalidAmount)?;

    match kind {
        ActionKind::Deposit => {
            if amount > wallet.native_balance {
                return Err(ValidateError::InsufficientBalance);
            }
        }
        ActionKind::Withdraw => {
            // Conservative pre-check only: the ledger's true limit also
            // depends on the post-withdraw health factor, which we do not
            // replicate. The call may still revert.
            if amount > snap.collateral_native {
                return Err(ValidateError::ExceedsCollateral);
            }
        }
        ActionKind::Borrow => {
            // 6-digit request rescaled to 18-digit USD under the 1:1 peg.
            if scale_borrow_to_usd(amount) > snap.headroom_usd() {
                return Err(ValidateError::ExceedsBorrowLimit);
            }
        }
        ActionKind::Repay | ActionKind::Approve => {
            if amount > wallet.borrow_asset_balance {
                return Err(ValidateError::InsufficientBalance);
            }
        }
    }

    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::WAD;
    use crate::domain::{PositionSnapshot, WalletState};

    fn view(snap: PositionSnapshot, wallet: WalletState) -> AccountView {
        AccountView { ts_ms: 0, snapshot: Some(snap), wallet: Some(wallet) }
    }

    fn wallet(native: u128, stable: u128) -> WalletState {
        WalletState {
            address: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into(),
            native_balance: native,
            borrow_asset_balance: stable,
            allowance_to_pool: 0,
        }
    }

    #[test]
    fn deposit_bounded_by_wallet_balance() {
        // fresh account: zero position, 1.0 native in the wallet
        let v = view(PositionSnapshot::default(), wallet(WAD, 0));
        assert_eq!(check(ActionKind::Deposit, "1.0", &v), Ok(WAD));
        assert_eq!(
            check(ActionKind::Deposit, "1.000000000000000001", &v),
            Err(ValidateError::InsufficientBalance)
        );
    }

    #[test]
    fn rejects_unparseable_and_nonpositive_amounts() {
        let v = view(PositionSnapshot::default(), wallet(WAD, 1_000_000));
        for text in ["", "0", "-1", "abc", "1e3"] {
            assert_eq!(
                check(ActionKind::Deposit, text, &v),
                Err(ValidateError::InvalidAmount),
                "amount {:?}",
                text
            );
        }
    }

    #[test]
    fn withdraw_capped_at_deposited_collateral() {
        let snap = PositionSnapshot { collateral_native: 2 * WAD, ..Default::default() };
        let v = view(snap, wallet(0, 0));
        assert_eq!(check(ActionKind::Withdraw, "2", &v), Ok(2 * WAD));
        assert_eq!(
            check(ActionKind::Withdraw, "2.5", &v),
            Err(ValidateError::ExceedsCollateral)
        );
    }

    #[test]
    fn borrow_headroom_boundary() {
        // maxDebtUsd = 700, debtUsd = 0: 700 fits exactly, 700.01 does not
        let snap = PositionSnapshot { max_debt_usd: 700 * WAD, ..Default::default() };
        let v = view(snap, wallet(0, 0));
        assert_eq!(check(ActionKind::Borrow, "700", &v), Ok(700_000_000));
        assert_eq!(
            check(ActionKind::Borrow, "700.01", &v),
            Err(ValidateError::ExceedsBorrowLimit)
        );
    }

    #[test]
    fn borrow_headroom_accounts_for_existing_debt() {
        let snap = PositionSnapshot {
            max_debt_usd: 700 * WAD,
            debt_usd: 500 * WAD,
            ..Default::default()
        };
        let v = view(snap, wallet(0, 0));
        assert_eq!(check(ActionKind::Borrow, "200", &v), Ok(200_000_000));
        assert_eq!(
            check(ActionKind::Borrow, "200.000001", &v),
            Err(ValidateError::ExceedsBorrowLimit)
        );
    }

    #[test]
    fn repay_bounded_by_borrow_asset_balance() {
        let v = view(PositionSnapshot::default(), wallet(0, 200_000_000));
        assert_eq!(check(ActionKind::Repay, "200", &v), Ok(200_000_000));
        assert_eq!(
            check(ActionKind::Repay, "200.000001", &v),
            Err(ValidateError::InsufficientBalance)
        );
    }

    #[test]
    fn unloaded_view_rejects_everything() {
        let v = AccountView::default();
        assert_eq!(check(ActionKind::Deposit, "1", &v), Err(ValidateError::NotLoaded));
    }

    #[test]
    fn verdicts_are_deterministic() {
        let snap = PositionSnapshot { max_debt_usd: 700 * WAD, ..Default::default() };
        let v = view(snap, wallet(WAD, 0));
        for _ in 0..3 {
            assert_eq!(check(ActionKind::Borrow, "700", &v), Ok(700_000_000));
            assert_eq!(
                check(ActionKind::Borrow, "700.01", &v),
                Err(ValidateError::ExceedsBorrowLimit)
            );
        }
    }
}
