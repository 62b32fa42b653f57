// ===============================
// src/main.rs
// ===============================
/*
 # which gateway is active, and for which wallet
 curl -s localhost:9898/metrics | egrep '^config_(gateway_mode|user)'

 # live position gauges and controller activity
 curl -s localhost:9898/metrics | grep '^position_'
 curl -s localhost:9898/metrics | egrep '^(action_validations_total|writes_dispatched_total|tx_reports_total)'
*/
/*
=============================================================================
Project : lend_dash_rust - position controller for a collateralized
          lending pool (native collateral, stable borrow asset)
Version : 0.3.0

Summary : Polls the pool for account snapshots (mock ledger or EVM JSON-RPC
          dev node), validates deposit/withdraw/borrow/repay against the
          cached position, drives writes through an explicit two-phase
          approve + repay, tracks per-kind transaction lifecycles, exposes
          Prometheus metrics, and records JSONL events.
=============================================================================
*/
mod domain;
mod amount;
mod config;
mod metrics;
mod recorder;
mod notify;
mod validator;
mod cache;
mod orchestrator;
mod gateway;      // mock ledger (Submitted -> Confirming -> settled after delay)
mod gateway_rpc;  // real EVM JSON-RPC node (eth_call + eth_sendTransaction)
mod driver;

use std::sync::Arc;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::info;

use crate::domain::{AccountView, Event, TxReport, UiEvent, WriteCall};
use crate::gateway::{LedgerReader, MockLedger};
use crate::gateway_rpc::RpcClient;
use crate::orchestrator::DashState;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    // ---- Load config ----
    let (args, mock_cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        mode = %args.mode.as_str(),
        user = %args.user,
        pool = %args.addresses.pool,
        token = %args.addresses.borrow_asset_token,
        refresh_ms = args.refresh_interval_ms,
        notify_ttl_ms = args.notify_ttl_ms,
        demo = args.demo,
        "startup config"
    );
    metrics::CONFIG_GATEWAY_MODE
        .with_label_values(&[args.mode.as_str()])
        .set(1);
    metrics::CONFIG_USER.with_label_values(&[&args.user]).set(1);

    // ---- Buses ----
    let (ui_tx, ui_rx) = mpsc::channel::<UiEvent>(256);
    let (write_tx, write_rx) = mpsc::channel::<WriteCall>(256);
    let (report_tx, report_rx) = mpsc::channel::<TxReport>(1024);
    let (refresh_tx, refresh_rx) = mpsc::channel::<()>(8);
    let (view_tx, view_rx) = watch::channel(AccountView::default());
    let (state_tx, state_rx) = watch::channel(DashState::default());

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let rec_tx = match args.record_file.clone() {
        Some(path) => {
            tokio::spawn(recorder::run(rec_rx, path));
            Some(rec_tx)
        }
        None => None,
    };

    // ---- Ledger gateway ----
    let reader = match args.mode {
        config::GatewayMode::Mock => {
            let ledger = Arc::new(MockLedger::new(&mock_cfg));
            tokio::spawn(gateway::run_mock_ledger(
                write_rx,
                report_tx.clone(),
                ledger.clone(),
                args.mock_confirm_ms,
            ));
            LedgerReader::Mock(ledger)
        }
        config::GatewayMode::Rpc => {
            let client = RpcClient::new(
                args.rpc_http_url.clone(),
                args.addresses.pool.clone(),
                args.addresses.borrow_asset_token.clone(),
            );
            tokio::spawn(gateway_rpc::run_rpc(
                write_rx,
                report_tx.clone(),
                client.clone(),
                args.user.clone(),
                args.rpc_ws_url.clone(),
            ));
            LedgerReader::Rpc(client)
        }
    };
    drop(report_tx);

    // ---- Snapshot cache ----
    tokio::spawn(cache::run(
        reader,
        args.user.clone(),
        args.refresh_interval_ms,
        view_tx,
        refresh_rx,
    ));

    // ---- Orchestrator ----
    tokio::spawn(orchestrator::run(
        ui_rx,
        view_rx.clone(),
        write_tx,
        report_rx,
        refresh_tx,
        state_tx,
        rec_tx.clone(),
        args.notify_ttl_ms,
    ));

    // ---- Heartbeat + record snapshots ----
    tokio::spawn({
        let mut view_hb = view_rx.clone();
        let rec_hb = rec_tx.clone();
        async move {
            let mut refreshes: u64 = 0;
            loop {
                select! {
                    Ok(()) = view_hb.changed() => {
                        refreshes += 1;
                        if let Some(tx) = &rec_hb {
                            let _ = tx.try_send(Event::Snapshot(view_hb.borrow().clone()));
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        info!(refreshes, "heartbeat");
                        refreshes = 0;
                    }
                }
            }
        }
    });

    // ---- Control surface ----
    if args.demo {
        driver::run_demo(ui_tx, state_rx, view_rx, rec_tx).await;
        // leave the recorder time for a final flush
        tokio::time::sleep(Duration::from_millis(1_200)).await;
    } else {
        driver::run_repl(ui_tx, state_rx, view_rx).await;
    }
}
