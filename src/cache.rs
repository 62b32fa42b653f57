// ===============================
// src/cache.rs (Position Snapshot Cache)
// ===============================
//
// Storage and scheduling are separate: `SnapshotStore` is plain state that
// replaces the cached view wholesale (validators never observe a partial
// update), the async `run` task drives it from a fixed interval plus an
// on-demand refresh channel. A failed read keeps the previous view and is
// retried on the next tick, never surfaced to the user.

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::amount::{BORROW_DECIMALS, NATIVE_DECIMALS};
use crate::domain::{now_ms, AccountView, PositionSnapshot, WalletState};
use crate::gateway::LedgerReader;
use crate::metrics::{milli, POS_COLLATERAL, POS_DEBT, POS_HEADROOM, POS_HEALTH, REFRESHES};

#[derive(Debug, Default)]
pub struct SnapshotStore {
    view: AccountView,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached view atomically.
    pub fn apply(&mut self, snapshot: PositionSnapshot, wallet: WalletState, ts_ms: i64) {
        POS_COLLATERAL.set(milli(snapshot.collateral_native, NATIVE_DECIMALS));
        POS_DEBT.set(milli(snapshot.debt_borrowed, BORROW_DECIMALS));
        POS_HEADROOM.set(milli(snapshot.headroom_usd(), NATIVE_DECIMALS));
        POS_HEALTH.set(milli(snapshot.health_factor, NATIVE_DECIMALS));
        self.view = AccountView { ts_ms, snapshot: Some(snapshot), wallet: Some(wallet) };
    }

    /// Latest view; `AccountView::default()` until the first successful read.
    pub fn current(&self) -> AccountView {
        self.view.clone()
    }
}

pub async fn run(
    reader: LedgerReader,
    user: String,
    interval_ms: u64,
    view_tx: watch::Sender<AccountView>,
    mut refresh_rx: mpsc::Receiver<()>,
) {
    let mut store = SnapshotStore::new();
    let mut tick = interval(Duration::from_millis(interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            Some(_) = refresh_rx.recv() => {}
        }

        match reader.read_account(&user).await {
            Ok((snapshot, wallet)) => {
                REFRESHES.with_label_values(&["ok"]).inc();
                store.apply(snapshot, wallet, now_ms());
                let _ = view_tx.send(store.current());
            }
            Err(e) => {
                // silent: keep the previous snapshot, retry next tick
                REFRESHES.with_label_values(&["err"]).inc();
                debug!(?e, "snapshot refresh failed, keeping previous view");
            }
        }
    }
}
