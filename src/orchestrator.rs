// ===============================
// src/orchestrator.rs (Transaction Orchestrator)
// ===============================
//
// Drives every accepted action through Submitted -> Confirming ->
// Succeeded/Failed and applies settlement effects: snapshot refresh, input
// reset, notification. Validation always reads the latest cached view at
// the moment of submission, not at render time.
//
// Repay is the one two-phase action: when the allowance is short, the press
// issues an Approve for exactly the requested amount and stops. There is no
// automatic chaining into Repay: each write stays independently observable
// and retryable, so the user confirms a second time once the Approve lands.

use ahash::AHashMap as HashMap;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{info, warn};

use crate::amount::{format_units, parse_positive, BORROW_DECIMALS};
use crate::domain::{
    now_ms, AccountView, ActionKind, Event, NoteKind, Notification, OpStatus, PendingOperation,
    TxPhase, TxReport, UiEvent, WriteCall,
};
use crate::metrics::{VALIDATIONS, WRITES};
use crate::notify::NotificationSlot;
use crate::validator;

/// Controller state published for rendering/inspection.
#[derive(Debug, Clone, Default)]
pub struct DashState {
    pub ops: HashMap<ActionKind, PendingOperation>,
    pub inputs: HashMap<ActionKind, String>,
    pub notification: Option<Notification>,
    /// The repay control shows "approval needed" before the button is
    /// pressed again.
    pub approval_needed: bool,
}

impl DashState {
    pub fn op(&self, kind: ActionKind) -> PendingOperation {
        self.ops.get(&kind).cloned().unwrap_or_default()
    }
}

/// Effects of one settled transaction report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settlement {
    pub refresh: bool,
}

pub struct Controller {
    ops: HashMap<ActionKind, PendingOperation>,
    inputs: HashMap<ActionKind, String>,
    notify: NotificationSlot,
}

impl Controller {
    pub fn new(notify_ttl_ms: u64) -> Self {
        Self {
            ops: HashMap::new(),
            inputs: HashMap::new(),
            notify: NotificationSlot::new(notify_ttl_ms),
        }
    }

    pub fn op(&self, kind: ActionKind) -> PendingOperation {
        self.ops.get(&kind).cloned().unwrap_or_default()
    }

    pub fn input(&self, kind: ActionKind) -> &str {
        self.inputs.get(&kind).map(String::as_str).unwrap_or("")
    }

    pub fn notification(&self) -> Option<&Notification> {
        self.notify.current()
    }

    pub fn notify_ttl_ms(&self) -> i64 {
        self.notify.ttl_ms()
    }

    pub fn clear_notification(&mut self) {
        self.notify.clear();
    }

    pub fn on_input(&mut self, kind: ActionKind, text: String) {
        self.inputs.insert(kind, text);
    }

    /// True when the current repay input exceeds the cached allowance, i.e.
    /// the next repay press will issue an Approve instead.
    pub fn repay_needs_approval(&self, view: &AccountView) -> bool {
        let Some(wallet) = &view.wallet else { return false };
        match parse_positive(self.input(ActionKind::Repay), BORROW_DECIMALS) {
            Some(amount) => amount > wallet.allowance_to_pool,
            None => false,
        }
    }

    fn next_op_id(&self, kind: ActionKind) -> String {
        format!("{}-{}-{}", kind.as_str(), now_ms(), rand::thread_rng().gen::<u32>())
    }

    /// Handle a press of the `kind` control against the latest cached view.
    /// Returns the write to hand to the gateway, if the action was accepted.
    pub fn on_press(&mut self, kind: ActionKind, view: &AccountView, now: i64) -> Option<WriteCall> {
        // Approve is never pressed directly; it is issued from the repay path.
        if kind == ActionKind::Approve {
            return None;
        }
        // one active operation per kind; the repay control is also disabled
        // while its approve leg is in flight
        if self.op(kind).in_flight() {
            return None;
        }
        if kind == ActionKind::Repay && self.op(ActionKind::Approve).in_flight() {
            return None;
        }

        let text = self.input(kind).to_string();
        let amount = match validator::check(kind, &text, view) {
            Ok(amount) => {
                VALIDATIONS.with_label_values(&[kind.as_str(), "accept"]).inc();
                amount
            }
            Err(e) => {
                VALIDATIONS.with_label_values(&[kind.as_str(), "reject"]).inc();
                warn!(kind = kind.as_str(), reason = %e, "action rejected");
                self.notify.post(NoteKind::Error, e.to_string(), now);
                return None;
            }
        };

        // two-phase repay: short allowance means this press only approves
        let submit_kind = match (kind, &view.wallet) {
            (ActionKind::Repay, Some(w)) if amount > w.allowance_to_pool => ActionKind::Approve,
            _ => kind,
        };

        self.ops.insert(
            submit_kind,
            PendingOperation { status: OpStatus::Submitted, tx_handle: None, error: None },
        );
        WRITES.with_label_values(&[submit_kind.as_str()]).inc();
        info!(
            kind = submit_kind.as_str(),
            amount = %format_units(amount, submit_kind.decimals()),
            "write dispatched"
        );
        Some(WriteCall { op_id: self.next_op_id(submit_kind), kind: submit_kind, amount })
    }

    /// Apply one gateway report to the per-kind state machine.
    pub fn on_tx_report(&mut self, rep: &TxReport, now: i64) -> Settlement {
        let op = self.ops.entry(rep.kind).or_default();
        match &rep.phase {
            TxPhase::Submitted => {
                op.status = OpStatus::Submitted;
                op.tx_handle = rep.tx_handle.clone();
                Settlement::default()
            }
            TxPhase::Confirming => {
                op.status = OpStatus::Confirming;
                if op.tx_handle.is_none() {
                    op.tx_handle = rep.tx_handle.clone();
                }
                Settlement::default()
            }
            TxPhase::Succeeded => {
                op.status = OpStatus::Succeeded;
                // clear the originating input; the approve leg originates
                // from the repay field, so that is what it clears and the
                // second click re-enters the amount
                let origin = match rep.kind {
                    ActionKind::Approve => ActionKind::Repay,
                    k => k,
                };
                self.inputs.remove(&origin);
                self.notify.post(
                    NoteKind::Success,
                    format!("{} confirmed", rep.kind.title()),
                    now,
                );
                Settlement { refresh: true }
            }
            TxPhase::Failed(reason) => {
                op.status = OpStatus::Failed;
                // most specific description available, generic fallback
                let message = if reason.trim().is_empty() {
                    format!("{} failed", rep.kind.title())
                } else {
                    reason.clone()
                };
                op.error = Some(message.clone());
                self.notify.post(NoteKind::Error, message, now);
                Settlement::default()
            }
        }
    }

    pub fn state(&self, view: &AccountView) -> DashState {
        DashState {
            ops: self.ops.clone(),
            inputs: self.inputs.clone(),
            notification: self.notify.current().cloned(),
            approval_needed: self.repay_needs_approval(view),
        }
    }
}

async fn record(rec_tx: &Option<mpsc::Sender<Event>>, ev: Event) {
    if let Some(tx) = rec_tx {
        let _ = tx.try_send(ev);
    }
}

pub async fn run(
    mut ui_rx: mpsc::Receiver<UiEvent>,
    mut view_rx: watch::Receiver<AccountView>,
    write_tx: mpsc::Sender<WriteCall>,
    mut report_rx: mpsc::Receiver<TxReport>,
    refresh_tx: mpsc::Sender<()>,
    state_tx: watch::Sender<DashState>,
    rec_tx: Option<mpsc::Sender<Event>>,
    notify_ttl_ms: u64,
) {
    let mut ctl = Controller::new(notify_ttl_ms);
    let ttl = Duration::from_millis(ctl.notify_ttl_ms() as u64);

    // auto-clear timer for the visible notification, restarted on every post
    let mut note_deadline: Option<Instant> = None;
    let mut note_seen_ts: Option<i64> = None;

    loop {
        tokio::select! {
            maybe_ev = ui_rx.recv() => {
                let Some(ev) = maybe_ev else { break };
                record(&rec_tx, Event::Action(ev.clone())).await;
                match ev {
                    UiEvent::SetInput(kind, text) => ctl.on_input(kind, text),
                    UiEvent::Press(kind) => {
                        let view = view_rx.borrow().clone();
                        if let Some(call) = ctl.on_press(kind, &view, now_ms()) {
                            let _ = write_tx.send(call).await;
                        }
                    }
                }
            }
            maybe_rep = report_rx.recv() => {
                let Some(rep) = maybe_rep else { break };
                record(&rec_tx, Event::Tx(rep.clone())).await;
                let settlement = ctl.on_tx_report(&rep, now_ms());
                if settlement.refresh {
                    let _ = refresh_tx.try_send(());
                }
            }
            Ok(()) = view_rx.changed() => {
                // re-publish so approval_needed tracks the fresh allowance
            }
            _ = async {
                match note_deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                ctl.clear_notification();
                note_deadline = None;
                note_seen_ts = None;
            }
        }

        // restart the auto-clear timer when a new notification appeared
        let current_ts = ctl.notification().map(|n| n.created_at_ms);
        if current_ts != note_seen_ts {
            note_seen_ts = current_ts;
            note_deadline = current_ts.map(|_| Instant::now() + ttl);
            if let Some(n) = ctl.notification() {
                record(&rec_tx, Event::Notice(n.clone())).await;
            }
        }

        let _ = state_tx.send(ctl.state(&view_rx.borrow()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::WAD;
    use crate::domain::{PositionSnapshot, WalletState};

    fn view(snap: PositionSnapshot, wallet: WalletState) -> AccountView {
        AccountView { ts_ms: 1, snapshot: Some(snap), wallet: Some(wallet) }
    }

    fn wallet(native: u128, stable: u128, allowance: u128) -> WalletState {
        WalletState {
            address: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into(),
            native_balance: native,
            borrow_asset_balance: stable,
            allowance_to_pool: allowance,
        }
    }

    fn succeeded(kind: ActionKind) -> TxReport {
        TxReport {
            op_id: "t".into(),
            kind,
            tx_handle: Some("0xabc".into()),
            phase: TxPhase::Succeeded,
            ts_ms: 0,
        }
    }

    #[test]
    fn accepted_deposit_dispatches_and_disables_control() {
        let mut ctl = Controller::new(5_000);
        let v = view(PositionSnapshot::default(), wallet(WAD, 0, 0));
        ctl.on_input(ActionKind::Deposit, "1.0".into());

        let call = ctl.on_press(ActionKind::Deposit, &v, 10).unwrap();
        assert_eq!(call.kind, ActionKind::Deposit);
        assert_eq!(call.amount, WAD);
        assert!(ctl.op(ActionKind::Deposit).in_flight());

        // second press while in flight is swallowed
        assert!(ctl.on_press(ActionKind::Deposit, &v, 11).is_none());
    }

    #[test]
    fn rejection_stays_local_and_notifies() {
        let mut ctl = Controller::new(5_000);
        let snap = PositionSnapshot { collateral_native: WAD, ..Default::default() };
        let v = view(snap, wallet(0, 0, 0));

        // withdraw above deposited collateral: no gateway call at all
        ctl.on_input(ActionKind::Withdraw, "2".into());
        assert!(ctl.on_press(ActionKind::Withdraw, &v, 10).is_none());
        assert_eq!(ctl.op(ActionKind::Withdraw).status, OpStatus::Idle);
        let n = ctl.notification().unwrap();
        assert_eq!(n.kind, NoteKind::Error);
        assert_eq!(n.message, "exceeds deposited collateral");
    }

    #[test]
    fn different_kinds_overlap_freely() {
        let mut ctl = Controller::new(5_000);
        let snap = PositionSnapshot { max_debt_usd: 700 * WAD, ..Default::default() };
        let v = view(snap, wallet(WAD, 0, 0));

        ctl.on_input(ActionKind::Deposit, "0.5".into());
        ctl.on_input(ActionKind::Borrow, "100".into());
        assert!(ctl.on_press(ActionKind::Deposit, &v, 10).is_some());
        assert!(ctl.on_press(ActionKind::Borrow, &v, 11).is_some());
        assert!(ctl.op(ActionKind::Deposit).in_flight());
        assert!(ctl.op(ActionKind::Borrow).in_flight());
    }

    #[test]
    fn repay_with_short_allowance_issues_approve_only() {
        let mut ctl = Controller::new(5_000);
        let snap = PositionSnapshot {
            debt_borrowed: 500_000_000,
            debt_usd: 500 * WAD,
            max_debt_usd: 700 * WAD,
            ..Default::default()
        };
        let v = view(snap, wallet(0, 500_000_000, 0));

        ctl.on_input(ActionKind::Repay, "200".into());
        assert!(ctl.repay_needs_approval(&v));

        // first click: approve for exactly the requested amount
        let call = ctl.on_press(ActionKind::Repay, &v, 10).unwrap();
        assert_eq!(call.kind, ActionKind::Approve);
        assert_eq!(call.amount, 200_000_000);
        assert!(ctl.op(ActionKind::Approve).in_flight());
        assert_eq!(ctl.op(ActionKind::Repay).status, OpStatus::Idle);

        // repay control disabled while the approve leg is in flight
        assert!(ctl.on_press(ActionKind::Repay, &v, 11).is_none());

        // approve settles like any other action: success note, refresh
        // asked, and the repay field it originated from is cleared
        let s = ctl.on_tx_report(&succeeded(ActionKind::Approve), 12);
        assert!(s.refresh);
        assert_eq!(ctl.input(ActionKind::Repay), "");
        assert_eq!(ctl.notification().unwrap().message, "Approve confirmed");

        // allowance now covers the amount: re-enter it and click again
        let v2 = view(snap, wallet(0, 500_000_000, 200_000_000));
        ctl.on_input(ActionKind::Repay, "200".into());
        assert!(!ctl.repay_needs_approval(&v2));
        let call = ctl.on_press(ActionKind::Repay, &v2, 13).unwrap();
        assert_eq!(call.kind, ActionKind::Repay);
        assert_eq!(call.amount, 200_000_000);
    }

    #[test]
    fn repay_with_sufficient_allowance_goes_straight_through() {
        let mut ctl = Controller::new(5_000);
        let v = view(PositionSnapshot::default(), wallet(0, 500_000_000, 300_000_000));
        ctl.on_input(ActionKind::Repay, "200".into());
        assert!(!ctl.repay_needs_approval(&v));
        let call = ctl.on_press(ActionKind::Repay, &v, 10).unwrap();
        assert_eq!(call.kind, ActionKind::Repay);
    }

    #[test]
    fn success_clears_input_and_posts_notification() {
        let mut ctl = Controller::new(5_000);
        let v = view(PositionSnapshot::default(), wallet(WAD, 0, 0));
        ctl.on_input(ActionKind::Deposit, "1.0".into());
        ctl.on_press(ActionKind::Deposit, &v, 10).unwrap();

        let s = ctl.on_tx_report(&succeeded(ActionKind::Deposit), 20);
        assert!(s.refresh);
        assert_eq!(ctl.input(ActionKind::Deposit), "");
        assert_eq!(ctl.op(ActionKind::Deposit).status, OpStatus::Succeeded);
        let n = ctl.notification().unwrap();
        assert_eq!(n.kind, NoteKind::Success);
        assert_eq!(n.message, "Deposit confirmed");
    }

    #[test]
    fn failure_keeps_specific_reason_until_superseded() {
        let mut ctl = Controller::new(5_000);
        let v = view(PositionSnapshot::default(), wallet(WAD, 0, 0));
        ctl.on_input(ActionKind::Deposit, "1.0".into());
        ctl.on_press(ActionKind::Deposit, &v, 10).unwrap();

        let rep = TxReport {
            op_id: "t".into(),
            kind: ActionKind::Deposit,
            tx_handle: None,
            phase: TxPhase::Failed("user rejected signing".into()),
            ts_ms: 0,
        };
        let s = ctl.on_tx_report(&rep, 20);
        assert!(!s.refresh);
        let op = ctl.op(ActionKind::Deposit);
        assert_eq!(op.status, OpStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("user rejected signing"));
        assert_eq!(ctl.notification().unwrap().message, "user rejected signing");

        // stale failure stays inspectable until the kind is started again
        ctl.on_input(ActionKind::Deposit, "0.5".into());
        ctl.on_press(ActionKind::Deposit, &v, 30).unwrap();
        assert_eq!(ctl.op(ActionKind::Deposit).status, OpStatus::Submitted);
    }

    #[test]
    fn empty_failure_reason_falls_back_per_kind() {
        let mut ctl = Controller::new(5_000);
        let rep = TxReport {
            op_id: "t".into(),
            kind: ActionKind::Borrow,
            tx_handle: None,
            phase: TxPhase::Failed(String::new()),
            ts_ms: 0,
        };
        ctl.on_tx_report(&rep, 20);
        assert_eq!(ctl.notification().unwrap().message, "Borrow failed");
    }

    mod lifecycle {
        use super::*;
        use crate::cache;
        use crate::config::MockPoolCfg;
        use crate::gateway::{self, LedgerReader, MockLedger};
        use std::sync::Arc;
        use tokio::time::{timeout, Duration};

        struct Rig {
            ui_tx: mpsc::Sender<UiEvent>,
            state_rx: watch::Receiver<DashState>,
            view_rx: watch::Receiver<AccountView>,
        }

        fn spawn_rig() -> Rig {
            let cfg = MockPoolCfg {
                price_native_usd: 1_000 * WAD,
                ltv_bps: 7_000,
                user_native_balance: 10 * WAD,
                user_borrow_balance: 0,
                pool_liquidity: 100_000_000_000,
            };
            let ledger = Arc::new(MockLedger::new(&cfg));
            let user = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".to_string();

            let (ui_tx, ui_rx) = mpsc::channel(64);
            let (write_tx, write_rx) = mpsc::channel(64);
            let (report_tx, report_rx) = mpsc::channel(64);
            let (refresh_tx, refresh_rx) = mpsc::channel(8);
            let (view_tx, view_rx) = watch::channel(AccountView::default());
            let (state_tx, state_rx) = watch::channel(DashState::default());

            tokio::spawn(cache::run(
                LedgerReader::Mock(ledger.clone()),
                user,
                5_000,
                view_tx,
                refresh_rx,
            ));
            tokio::spawn(gateway::run_mock_ledger(write_rx, report_tx, ledger, 50));
            tokio::spawn(run(
                ui_rx,
                view_rx.clone(),
                write_tx,
                report_rx,
                refresh_tx,
                state_tx,
                None,
                5_000,
            ));

            Rig { ui_tx, state_rx, view_rx }
        }

        async fn wait_for(
            rx: &mut watch::Receiver<DashState>,
            mut pred: impl FnMut(&DashState) -> bool,
        ) -> DashState {
            timeout(Duration::from_secs(60), async {
                loop {
                    if pred(&rx.borrow()) {
                        return rx.borrow().clone();
                    }
                    rx.changed().await.unwrap();
                }
            })
            .await
            .expect("condition not reached")
        }

        async fn wait_view(
            rx: &mut watch::Receiver<AccountView>,
            mut pred: impl FnMut(&AccountView) -> bool,
        ) -> AccountView {
            timeout(Duration::from_secs(60), async {
                loop {
                    if pred(&rx.borrow()) {
                        return rx.borrow().clone();
                    }
                    rx.changed().await.unwrap();
                }
            })
            .await
            .expect("view condition not reached")
        }

        #[tokio::test(start_paused = true)]
        async fn deposit_settles_and_notification_auto_clears() {
            let mut rig = spawn_rig();
            wait_view(&mut rig.view_rx.clone(), |v| v.is_loaded()).await;

            rig.ui_tx
                .send(UiEvent::SetInput(ActionKind::Deposit, "1.0".into()))
                .await
                .unwrap();
            rig.ui_tx.send(UiEvent::Press(ActionKind::Deposit)).await.unwrap();

            let settled = wait_for(&mut rig.state_rx, |s| {
                s.op(ActionKind::Deposit).status == OpStatus::Succeeded
            })
            .await;
            assert_eq!(settled.inputs.get(&ActionKind::Deposit), None);
            let note = settled.notification.expect("success notification visible");
            assert_eq!(note.kind, NoteKind::Success);
            assert_eq!(note.message, "Deposit confirmed");

            // settlement refresh lands the new collateral in the view
            let v = wait_view(&mut rig.view_rx.clone(), |v| {
                v.snapshot.map(|s| s.collateral_native) == Some(WAD)
            })
            .await;
            assert_eq!(v.snapshot.unwrap().debt_borrowed, 0);

            // 5000 ms later the notification is gone
            let cleared =
                wait_for(&mut rig.state_rx, |s| s.notification.is_none()).await;
            assert_eq!(cleared.op(ActionKind::Deposit).status, OpStatus::Succeeded);
        }

        #[tokio::test(start_paused = true)]
        async fn borrow_then_two_phase_repay() {
            let mut rig = spawn_rig();
            wait_view(&mut rig.view_rx.clone(), |v| v.is_loaded()).await;

            // collateralize, then borrow 500
            rig.ui_tx
                .send(UiEvent::SetInput(ActionKind::Deposit, "1.0".into()))
                .await
                .unwrap();
            rig.ui_tx.send(UiEvent::Press(ActionKind::Deposit)).await.unwrap();
            wait_for(&mut rig.state_rx, |s| {
                s.op(ActionKind::Deposit).status == OpStatus::Succeeded
            })
            .await;

            rig.ui_tx
                .send(UiEvent::SetInput(ActionKind::Borrow, "500".into()))
                .await
                .unwrap();
            rig.ui_tx.send(UiEvent::Press(ActionKind::Borrow)).await.unwrap();
            wait_for(&mut rig.state_rx, |s| {
                s.op(ActionKind::Borrow).status == OpStatus::Succeeded
            })
            .await;
            wait_view(&mut rig.view_rx.clone(), |v| {
                v.snapshot.map(|s| s.debt_borrowed) == Some(500_000_000)
            })
            .await;

            // first repay press: approve leg only
            rig.ui_tx
                .send(UiEvent::SetInput(ActionKind::Repay, "200".into()))
                .await
                .unwrap();
            rig.ui_tx.send(UiEvent::Press(ActionKind::Repay)).await.unwrap();
            let after_approve = wait_for(&mut rig.state_rx, |s| {
                s.op(ActionKind::Approve).status == OpStatus::Succeeded
            })
            .await;
            assert_eq!(after_approve.op(ActionKind::Repay).status, OpStatus::Idle);
            // settled approve clears the repay field it originated from
            assert_eq!(after_approve.inputs.get(&ActionKind::Repay), None);

            // wait for the refreshed allowance to land in the view
            wait_view(&mut rig.view_rx.clone(), |v| {
                v.wallet.as_ref().map(|w| w.allowance_to_pool) == Some(200_000_000)
            })
            .await;

            // second confirmation: enter the amount again and press
            rig.ui_tx
                .send(UiEvent::SetInput(ActionKind::Repay, "200".into()))
                .await
                .unwrap();
            rig.ui_tx.send(UiEvent::Press(ActionKind::Repay)).await.unwrap();
            wait_for(&mut rig.state_rx, |s| {
                s.op(ActionKind::Repay).status == OpStatus::Succeeded
            })
            .await;
            let v = wait_view(&mut rig.view_rx.clone(), |v| {
                v.snapshot.map(|s| s.debt_borrowed) == Some(300_000_000)
            })
            .await;
            assert_eq!(v.wallet.unwrap().borrow_asset_balance, 300_000_000);
        }

        #[tokio::test(start_paused = true)]
        async fn local_rejection_never_reaches_the_gateway() {
            let mut rig = spawn_rig();
            wait_view(&mut rig.view_rx.clone(), |v| v.is_loaded()).await;

            // nothing deposited yet: withdraw must be rejected locally
            rig.ui_tx
                .send(UiEvent::SetInput(ActionKind::Withdraw, "1".into()))
                .await
                .unwrap();
            rig.ui_tx.send(UiEvent::Press(ActionKind::Withdraw)).await.unwrap();

            let s = wait_for(&mut rig.state_rx, |s| s.notification.is_some()).await;
            assert_eq!(
                s.notification.as_ref().unwrap().message,
                "exceeds deposited collateral"
            );
            assert_eq!(s.op(ActionKind::Withdraw).status, OpStatus::Idle);
        }
    }
}
