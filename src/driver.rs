// ===============================
// src/driver.rs (control surface)
// ===============================
//
// Stdin REPL that feeds the controller: `deposit 1.0`, `borrow 500`,
// `repay 200`, `withdraw 0.5`, `status`, `quit`. Each amount command sets
// the input field and presses the control in one step; a repay that needs
// an allowance first shows up as an Approve leg, and the user repeats the
// command once it confirms.
//
// `--demo` runs the scripted walkthrough instead: deposit 1.0, borrow 500,
// approve + repay 200, withdraw 0.25, then exits.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::amount::{format_health_factor, format_units, BORROW_DECIMALS, NATIVE_DECIMALS};
use crate::domain::{AccountView, ActionKind, Event, NoteKind, OpStatus, UiEvent};
use crate::orchestrator::DashState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Act(ActionKind, String),
    Status,
    Quit,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?.to_ascii_lowercase();
    match verb.as_str() {
        "status" => Some(Command::Status),
        "quit" | "exit" => Some(Command::Quit),
        "deposit" | "withdraw" | "borrow" | "repay" => {
            let amount = parts.next()?.to_string();
            let kind = match verb.as_str() {
                "deposit" => ActionKind::Deposit,
                "withdraw" => ActionKind::Withdraw,
                "borrow" => ActionKind::Borrow,
                _ => ActionKind::Repay,
            };
            Some(Command::Act(kind, amount))
        }
        _ => None,
    }
}

/// One-line position summary in display units.
pub fn render_position(view: &AccountView) -> String {
    let Some(snap) = &view.snapshot else {
        return "position not loaded".to_string();
    };
    let wallet_line = match &view.wallet {
        Some(w) => format!(
            " | wallet {} native / {} stable (allowance {})",
            format_units(w.native_balance, NATIVE_DECIMALS),
            format_units(w.borrow_asset_balance, BORROW_DECIMALS),
            format_units(w.allowance_to_pool, BORROW_DECIMALS),
        ),
        None => String::new(),
    };
    format!(
        "collateral {} (${}) | debt {} (${}) | max debt ${} | HF {}{}",
        format_units(snap.collateral_native, NATIVE_DECIMALS),
        format_units(snap.collateral_usd, NATIVE_DECIMALS),
        format_units(snap.debt_borrowed, BORROW_DECIMALS),
        format_units(snap.debt_usd, NATIVE_DECIMALS),
        format_units(snap.max_debt_usd, NATIVE_DECIMALS),
        format_health_factor(snap.health_factor),
        wallet_line,
    )
}

fn log_notification(state: &DashState) {
    if let Some(n) = &state.notification {
        match n.kind {
            NoteKind::Success => info!(message = %n.message, "notice"),
            NoteKind::Error => warn!(message = %n.message, "notice"),
        }
    }
}

pub async fn run_repl(
    ui_tx: mpsc::Sender<UiEvent>,
    mut state_rx: watch::Receiver<DashState>,
    view_rx: watch::Receiver<AccountView>,
) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    info!("repl: deposit/withdraw/borrow/repay <amount>, status, quit");

    // most recently seen notification timestamp, to log each one once
    let mut last_note_ts: Option<i64> = None;

    loop {
        tokio::select! {
            maybe_line = lines.next_line() => {
                let line = match maybe_line {
                    Ok(Some(l)) => l,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(?e, "repl: stdin read failed");
                        break;
                    }
                };
                match parse_command(&line) {
                    Some(Command::Act(kind, amount)) => {
                        let _ = ui_tx.send(UiEvent::SetInput(kind, amount)).await;
                        let _ = ui_tx.send(UiEvent::Press(kind)).await;
                    }
                    Some(Command::Status) => {
                        info!(position = %render_position(&view_rx.borrow()), "status");
                        let state = state_rx.borrow().clone();
                        if state.approval_needed {
                            info!("repay amount needs an approval first");
                        }
                        for kind in ActionKind::ALL {
                            let op = state.op(kind);
                            if op.status != OpStatus::Idle {
                                info!(
                                    kind = kind.as_str(),
                                    status = ?op.status,
                                    tx = op.tx_handle.as_deref().unwrap_or("-"),
                                    "operation"
                                );
                            }
                        }
                    }
                    Some(Command::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => warn!(%line, "repl: unrecognized command"),
                }
            }
            Ok(()) = state_rx.changed() => {
                let state = state_rx.borrow().clone();
                let ts = state.notification.as_ref().map(|n| n.created_at_ms);
                if ts.is_some() && ts != last_note_ts {
                    log_notification(&state);
                }
                last_note_ts = ts;
            }
        }
    }
    info!("repl: stopped");
}

async fn wait_settled(
    state_rx: &mut watch::Receiver<DashState>,
    kind: ActionKind,
) -> OpStatus {
    loop {
        let status = state_rx.borrow().op(kind).status;
        if matches!(status, OpStatus::Succeeded | OpStatus::Failed) {
            return status;
        }
        if state_rx.changed().await.is_err() {
            return status;
        }
    }
}

async fn demo_step(
    ui_tx: &mpsc::Sender<UiEvent>,
    state_rx: &mut watch::Receiver<DashState>,
    kind: ActionKind,
    amount: &str,
) -> OpStatus {
    info!(kind = kind.as_str(), %amount, "demo: step");
    let _ = ui_tx.send(UiEvent::SetInput(kind, amount.to_string())).await;
    let _ = ui_tx.send(UiEvent::Press(kind)).await;
    let status = wait_settled(state_rx, kind).await;
    info!(kind = kind.as_str(), ?status, "demo: settled");
    status
}

/// Repay 200 end to end: with a short allowance the first press only
/// approves; once the refreshed allowance is visible, the amount is entered
/// again (settled approves clear the repay field) and pressed a second
/// time. Returns false when either leg failed.
async fn repay_two_phase(
    ui_tx: &mpsc::Sender<UiEvent>,
    state_rx: &mut watch::Receiver<DashState>,
    view_rx: &watch::Receiver<AccountView>,
) -> bool {
    info!(kind = "repay", amount = "200", "demo: step");
    let _ = ui_tx.send(UiEvent::SetInput(ActionKind::Repay, "200".into())).await;
    let _ = ui_tx.send(UiEvent::Press(ActionKind::Repay)).await;

    let mut second_press_sent = false;
    loop {
        let s = state_rx.borrow().clone();
        match s.op(ActionKind::Repay).status {
            OpStatus::Succeeded => {
                info!(kind = "repay", "demo: settled");
                return true;
            }
            OpStatus::Failed => return false,
            _ => {}
        }
        if s.op(ActionKind::Approve).status == OpStatus::Failed {
            return false;
        }
        if !second_press_sent
            && s.op(ActionKind::Approve).status == OpStatus::Succeeded
            && s.op(ActionKind::Repay).status == OpStatus::Idle
        {
            let allowance_ok = view_rx
                .borrow()
                .wallet
                .as_ref()
                .map(|w| w.allowance_to_pool >= 200_000_000)
                .unwrap_or(false);
            if allowance_ok {
                info!("demo: approve settled, entering the amount again");
                let _ =
                    ui_tx.send(UiEvent::SetInput(ActionKind::Repay, "200".into())).await;
                let _ = ui_tx.send(UiEvent::Press(ActionKind::Repay)).await;
                second_press_sent = true;
            }
        }
        if state_rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Scripted lifecycle against the configured gateway. Exercises every
/// action kind, including the two-phase approve + repay. A failed leg
/// stops the script and reports the position as-is.
pub async fn run_demo(
    ui_tx: mpsc::Sender<UiEvent>,
    mut state_rx: watch::Receiver<DashState>,
    mut view_rx: watch::Receiver<AccountView>,
    rec_tx: Option<mpsc::Sender<Event>>,
) {
    if let Some(tx) = &rec_tx {
        let _ = tx.try_send(Event::Note("demo start".into()));
    }

    // wait for the first successful read
    while !view_rx.borrow().is_loaded() {
        if view_rx.changed().await.is_err() {
            warn!("demo: view channel closed before first load");
            return;
        }
    }
    info!(position = %render_position(&view_rx.borrow()), "demo: initial");

    let mut failed =
        demo_step(&ui_tx, &mut state_rx, ActionKind::Deposit, "1.0").await == OpStatus::Failed;
    if !failed {
        failed = demo_step(&ui_tx, &mut state_rx, ActionKind::Borrow, "500").await
            == OpStatus::Failed;
    }
    if !failed {
        failed = !repay_two_phase(&ui_tx, &mut state_rx, &view_rx).await;
    }
    if !failed {
        failed = demo_step(&ui_tx, &mut state_rx, ActionKind::Withdraw, "0.25").await
            == OpStatus::Failed;
    }

    if failed {
        warn!("demo: a step failed, reporting the position as-is");
    } else {
        // let the settlement refresh land before the final summary; bail
        // out if anything reaches Failed instead of waiting forever
        loop {
            let done = view_rx
                .borrow()
                .snapshot
                .map(|s| {
                    s.debt_borrowed == 300_000_000
                        && s.collateral_native == 750_000_000_000_000_000
                })
                .unwrap_or(false);
            if done {
                break;
            }
            let any_failed = {
                let s = state_rx.borrow();
                ActionKind::ALL.iter().any(|k| s.op(*k).status == OpStatus::Failed)
            };
            if any_failed {
                warn!("demo: a step failed, reporting the position as-is");
                break;
            }
            tokio::select! {
                r = view_rx.changed() => { if r.is_err() { break; } }
                r = state_rx.changed() => { if r.is_err() { break; } }
            }
        }
    }

    info!(position = %render_position(&view_rx.borrow()), "demo: final");
    if let Some(tx) = &rec_tx {
        let _ = tx.try_send(Event::Note("demo done".into()));
    }
}
