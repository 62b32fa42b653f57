// ===============================
// src/gateway.rs (mock ledger)
// ===============================
//
// In-memory stand-in for the on-chain pool + token pair. Carries the same
// accounting the contracts enforce (LTV headroom, post-withdraw health,
// allowance-gated repay) so settlement effects are observable end to end
// without a node. Writes run Submitted -> Confirming -> Succeeded/Failed
// after short delays; each call is spawned so different kinds overlap freely.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};

use crate::amount::{scale_borrow_to_usd, HF_SATURATED, WAD};
use crate::config::MockPoolCfg;
use crate::domain::{now_ms, ActionKind, PositionSnapshot, TxPhase, TxReport, WalletState, WriteCall};
use crate::gateway_rpc::RpcClient;
use crate::metrics::TX_REPORTS;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("bad response: {0}")]
    BadResponse(String),
}

/// Read side of the ledger, dispatched by gateway mode.
pub enum LedgerReader {
    Mock(Arc<MockLedger>),
    Rpc(RpcClient),
}

impl LedgerReader {
    pub async fn read_account(
        &self,
        user: &str,
    ) -> Result<(PositionSnapshot, WalletState), GatewayError> {
        match self {
            LedgerReader::Mock(ledger) => ledger.read_account(user),
            LedgerReader::Rpc(client) => client.read_account(user).await,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    // user wallet
    native_balance: u128,
    stable_balance: u128,
    allowance: u128,
    // pool-side accounting
    collateral: u128,
    debt: u128,
    pool_liquidity: u128,
}

pub struct MockLedger {
    price_native_usd: u128,
    ltv_bps: u32,
    read_outage: AtomicBool,
    state: Mutex<PoolState>,
}

impl MockLedger {
    pub fn new(cfg: &MockPoolCfg) -> Self {
        Self {
            price_native_usd: cfg.price_native_usd,
            ltv_bps: cfg.ltv_bps,
            read_outage: AtomicBool::new(false),
            state: Mutex::new(PoolState {
                native_balance: cfg.user_native_balance,
                stable_balance: cfg.user_borrow_balance,
                allowance: 0,
                collateral: 0,
                debt: 0,
                pool_liquidity: cfg.pool_liquidity,
            }),
        }
    }

    fn account_data(&self, st: &PoolState) -> PositionSnapshot {
        let collateral_usd = st.collateral.saturating_mul(self.price_native_usd) / WAD;
        let debt_usd = scale_borrow_to_usd(st.debt);
        let max_debt_usd = collateral_usd.saturating_mul(self.ltv_bps as u128) / 10_000;
        // this pool uses the LTV as its liquidation threshold
        let health_factor = if debt_usd == 0 {
            HF_SATURATED
        } else {
            max_debt_usd.saturating_mul(WAD) / debt_usd
        };
        PositionSnapshot {
            collateral_native: st.collateral,
            debt_borrowed: st.debt,
            collateral_usd,
            debt_usd,
            max_debt_usd,
            health_factor,
        }
    }

    /// Simulate an unreachable node: reads fail until cleared, writes
    /// still land.
    pub fn set_read_outage(&self, outage: bool) {
        self.read_outage.store(outage, Ordering::Relaxed);
    }

    pub fn read_account(
        &self,
        user: &str,
    ) -> Result<(PositionSnapshot, WalletState), GatewayError> {
        if self.read_outage.load(Ordering::Relaxed) {
            return Err(GatewayError::Rpc("node unreachable".into()));
        }
        let st = self.state.lock().unwrap();
        let snapshot = self.account_data(&st);
        let wallet = WalletState {
            address: user.to_string(),
            native_balance: st.native_balance,
            borrow_asset_balance: st.stable_balance,
            allowance_to_pool: st.allowance,
        };
        Ok((snapshot, wallet))
    }

    /// Apply one finalized write with the contract's revert rules.
    pub fn apply(&self, kind: ActionKind, amount: u128) -> Result<(), String> {
        let mut st = self.state.lock().unwrap();
        match kind {
            ActionKind::Deposit => {
                if amount > st.native_balance {
                    return Err("insufficient funds for transfer".into());
                }
                st.native_balance -= amount;
                st.collateral += amount;
            }
            ActionKind::Withdraw => {
                if amount > st.collateral {
                    return Err("withdraw exceeds collateral".into());
                }
                let remaining = st.collateral - amount;
                let remaining_max =
                    (remaining.saturating_mul(self.price_native_usd) / WAD)
                        .saturating_mul(self.ltv_bps as u128)
                        / 10_000;
                if scale_borrow_to_usd(st.debt) > remaining_max {
                    return Err("health factor too low".into());
                }
                st.collateral = remaining;
                st.native_balance += amount;
            }
            ActionKind::Borrow => {
                if amount > st.pool_liquidity {
                    return Err("insufficient pool liquidity".into());
                }
                let snap = self.account_data(&st);
                if scale_borrow_to_usd(st.debt + amount) > snap.max_debt_usd {
                    return Err("exceeds borrow limit".into());
                }
                st.pool_liquidity -= amount;
                st.debt += amount;
                st.stable_balance += amount;
            }
            ActionKind::Repay => {
                if amount > st.debt {
                    return Err("repay exceeds debt".into());
                }
                if amount > st.allowance {
                    return Err("transfer amount exceeds allowance".into());
                }
                if amount > st.stable_balance {
                    return Err("transfer amount exceeds balance".into());
                }
                st.allowance -= amount;
                st.stable_balance -= amount;
                st.debt -= amount;
                st.pool_liquidity += amount;
            }
            ActionKind::Approve => {
                st.allowance = amount;
            }
        }
        Ok(())
    }
}

async fn send_report(tx: &mpsc::Sender<TxReport>, mut report: TxReport) {
    report.ts_ms = now_ms();
    TX_REPORTS
        .with_label_values(&[report.kind.as_str(), report.phase.label()])
        .inc();
    let _ = tx.send(report).await;
}

pub async fn run_mock_ledger(
    mut rx: mpsc::Receiver<WriteCall>,
    report_tx: mpsc::Sender<TxReport>,
    ledger: Arc<MockLedger>,
    confirm_ms: u64,
) {
    while let Some(call) = rx.recv().await {
        let ledger = ledger.clone();
        let report_tx = report_tx.clone();

        tokio::spawn(async move {
            let handle = format!(
                "0x{:016x}{:016x}",
                rand::thread_rng().gen::<u64>(),
                rand::thread_rng().gen::<u64>()
            );

            send_report(
                &report_tx,
                TxReport {
                    op_id: call.op_id.clone(),
                    kind: call.kind,
                    tx_handle: Some(handle.clone()),
                    phase: TxPhase::Submitted,
                    ts_ms: 0,
                },
            )
            .await;

            sleep(Duration::from_millis(confirm_ms)).await;
            send_report(
                &report_tx,
                TxReport {
                    op_id: call.op_id.clone(),
                    kind: call.kind,
                    tx_handle: Some(handle.clone()),
                    phase: TxPhase::Confirming,
                    ts_ms: 0,
                },
            )
            .await;

            let jitter = rand::thread_rng().gen_range(0..=confirm_ms / 2 + 1);
            sleep(Duration::from_millis(confirm_ms + jitter)).await;

            let phase = match ledger.apply(call.kind, call.amount) {
                Ok(()) => TxPhase::Succeeded,
                Err(reason) => TxPhase::Failed(reason),
            };
            send_report(
                &report_tx,
                TxReport {
                    op_id: call.op_id,
                    kind: call.kind,
                    tx_handle: Some(handle),
                    phase,
                    ts_ms: 0,
                },
            )
            .await;
        });
    }
}
