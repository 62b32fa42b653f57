// ===============================
// src/gateway_rpc.rs (EVM JSON-RPC ledger gateway)
// ===============================
//
// Real ledger gateway against a dev node with unlocked accounts: reads via
// eth_call, writes via eth_sendTransaction, settlement via receipt polling
// driven by a newHeads WebSocket subscription (with an interval fallback
// when the subscription is down). No signing here: the node owns the keys,
// the same way the original local workflow drives the pool.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    sync::mpsc,
    time::{interval, sleep, Duration, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use crate::amount::HF_SATURATED;
use crate::domain::{now_ms, ActionKind, PositionSnapshot, TxPhase, TxReport, WalletState, WriteCall};
use crate::gateway::GatewayError;
use crate::metrics::TX_REPORTS;

// 4-byte selectors of the pool/token ABI surface.
const SEL_GET_ACCOUNT_DATA: &str = "5d78650e"; // getAccountData(address)
const SEL_BALANCE_OF: &str = "70a08231"; // balanceOf(address)
const SEL_ALLOWANCE: &str = "dd62ed3e"; // allowance(address,address)
const SEL_APPROVE: &str = "095ea7b3"; // approve(address,uint256)
const SEL_DEPOSIT_NATIVE: &str = "db6b5246"; // depositNative()
const SEL_WITHDRAW_NATIVE: &str = "84276d81"; // withdrawNative(uint256)
const SEL_BORROW_ASSET: &str = "76d7a589"; // borrowAsset(uint256)
const SEL_REPAY_ASSET: &str = "1177e16a"; // repayAsset(uint256)

fn abi_address(addr: &str) -> Result<String, GatewayError> {
    let hex_part = addr.trim().trim_start_matches("0x").to_ascii_lowercase();
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GatewayError::BadResponse(format!("bad address {addr}")));
    }
    Ok(format!("{:0>64}", hex_part))
}

fn abi_u128(v: u128) -> String {
    format!("{:064x}", v)
}

/// One 32-byte return word -> u128; `None` when the high bytes are set.
fn word_to_u128(word: &str) -> Option<u128> {
    if word.len() != 64 {
        return None;
    }
    let (high, low) = word.split_at(32);
    if high.chars().any(|c| c != '0') {
        return None;
    }
    u128::from_str_radix(low, 16).ok()
}

/// "0x..." quantity (unpadded) -> u128.
fn quantity_to_u128(q: &str) -> Result<u128, GatewayError> {
    u128::from_str_radix(q.trim_start_matches("0x"), 16)
        .map_err(|_| GatewayError::BadResponse(format!("bad quantity {q}")))
}

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    pool: String,
    token: String,
}

impl RpcClient {
    pub fn new(url: String, pool: String, token: String) -> Self {
        Self { http: reqwest::Client::new(), url, pool, token }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let rsp: Value = self.http.post(&self.url).json(&body).send().await?.json().await?;
        if let Some(err) = rsp.get("error") {
            let msg = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown rpc error")
                .to_string();
            return Err(GatewayError::Rpc(msg));
        }
        rsp.get("result")
            .cloned()
            .ok_or_else(|| GatewayError::BadResponse("missing result".into()))
    }

    async fn eth_call(&self, to: &str, data: String) -> Result<String, GatewayError> {
        let result = self
            .call("eth_call", json!([{ "to": to, "data": format!("0x{data}") }, "latest"]))
            .await?;
        result
            .as_str()
            .map(|s| s.trim_start_matches("0x").to_string())
            .ok_or_else(|| GatewayError::BadResponse("non-string eth_call result".into()))
    }

    pub async fn read_account(
        &self,
        user: &str,
    ) -> Result<(PositionSnapshot, WalletState), GatewayError> {
        let user_word = abi_address(user)?;

        // getAccountData(user) -> 6 uint256 words
        let raw = self
            .eth_call(&self.pool, format!("{SEL_GET_ACCOUNT_DATA}{user_word}"))
            .await?;
        if raw.len() < 6 * 64 {
            return Err(GatewayError::BadResponse("short getAccountData return".into()));
        }
        let mut words = (0..6).map(|i| &raw[i * 64..(i + 1) * 64]);
        let mut next = |name: &str| -> Result<u128, GatewayError> {
            let w = words.next().unwrap();
            word_to_u128(w).ok_or_else(|| GatewayError::BadResponse(format!("{name} overflow")))
        };
        let collateral_native = next("collateralNative")?;
        let debt_borrowed = next("debtBorrowed")?;
        let collateral_usd = next("collateralUsd")?;
        let debt_usd = next("debtUsd")?;
        let max_debt_usd = next("maxDebtUsd")?;
        // uint256 max means "no debt", keep the saturated marker
        let health_factor = word_to_u128(&raw[5 * 64..6 * 64]).unwrap_or(HF_SATURATED);

        let balance_raw = self
            .eth_call(&self.token, format!("{SEL_BALANCE_OF}{user_word}"))
            .await?;
        let borrow_asset_balance = word_to_u128(&balance_raw)
            .ok_or_else(|| GatewayError::BadResponse("balanceOf overflow".into()))?;

        let pool_word = abi_address(&self.pool)?;
        let allowance_raw = self
            .eth_call(&self.token, format!("{SEL_ALLOWANCE}{user_word}{pool_word}"))
            .await?;
        let allowance_to_pool = word_to_u128(&allowance_raw).unwrap_or(u128::MAX);

        let native_hex = self
            .call("eth_getBalance", json!([user, "latest"]))
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::BadResponse("non-string balance".into()))?;
        let native_balance = quantity_to_u128(&native_hex)?;

        Ok((
            PositionSnapshot {
                collateral_native,
                debt_borrowed,
                collateral_usd,
                debt_usd,
                max_debt_usd,
                health_factor,
            },
            WalletState {
                address: user.to_string(),
                native_balance,
                borrow_asset_balance,
                allowance_to_pool,
            },
        ))
    }

    /// Build target + calldata (+ optional native value) for one write.
    fn encode_write(&self, user: &str, call: &WriteCall) -> Result<Value, GatewayError> {
        let amount_word = abi_u128(call.amount);
        let (to, data, value) = match call.kind {
            ActionKind::Deposit => {
                (self.pool.clone(), SEL_DEPOSIT_NATIVE.to_string(), Some(call.amount))
            }
            ActionKind::Withdraw => {
                (self.pool.clone(), format!("{SEL_WITHDRAW_NATIVE}{amount_word}"), None)
            }
            ActionKind::Borrow => {
                (self.pool.clone(), format!("{SEL_BORROW_ASSET}{amount_word}"), None)
            }
            ActionKind::Repay => {
                (self.pool.clone(), format!("{SEL_REPAY_ASSET}{amount_word}"), None)
            }
            ActionKind::Approve => {
                let pool_word = abi_address(&self.pool)?;
                (self.token.clone(), format!("{SEL_APPROVE}{pool_word}{amount_word}"), None)
            }
        };
        let mut tx = json!({ "from": user, "to": to, "data": format!("0x{data}") });
        if let Some(v) = value {
            tx["value"] = json!(format!("0x{v:x}"));
        }
        Ok(tx)
    }

    async fn send_transaction(&self, tx: Value) -> Result<String, GatewayError> {
        let result = self.call("eth_sendTransaction", json!([tx])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::BadResponse("non-string tx hash".into()))
    }

    /// None while the tx is not yet mined; Some(status) once a receipt exists.
    async fn receipt_status(&self, hash: &str) -> Result<Option<bool>, GatewayError> {
        let result = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        let ok = result.get("status").and_then(|s| s.as_str()) == Some("0x1");
        Ok(Some(ok))
    }
}

async fn send_report(tx: &mpsc::Sender<TxReport>, mut report: TxReport) {
    report.ts_ms = now_ms();
    TX_REPORTS
        .with_label_values(&[report.kind.as_str(), report.phase.label()])
        .inc();
    let _ = tx.send(report).await;
}

/// newHeads subscription: one `()` per new block, reconnect with backoff.
async fn new_heads_loop(ws_url: String, head_tx: mpsc::Sender<()>) {
    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url, head notifications disabled");
                return;
            }
        };

        info!(%ws_url, "connecting newHeads subscription");
        match connect_async(url).await {
            Ok((mut ws, _rsp)) => {
                attempt = 0;
                let sub = json!({
                    "jsonrpc": "2.0", "id": 1,
                    "method": "eth_subscribe", "params": ["newHeads"]
                });
                if let Err(e) = ws.send(Message::Text(sub.to_string())).await {
                    error!(?e, "eth_subscribe send failed");
                } else {
                    while let Some(frame) = ws.next().await {
                        match frame {
                            Ok(m) if m.is_text() => {
                                let txt = m.into_text().unwrap_or_default();
                                if let Ok(v) = serde_json::from_str::<Value>(&txt) {
                                    if v.get("method").and_then(|m| m.as_str())
                                        == Some("eth_subscription")
                                    {
                                        let _ = head_tx.try_send(());
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(?e, "newHeads ws error");
                                break;
                            }
                        }
                    }
                    warn!("newHeads disconnected, reconnecting");
                }
            }
            Err(e) => {
                error!(?e, "connect newHeads failed");
            }
        }

        // exponential backoff, capped
        attempt = attempt.saturating_add(1);
        let factor = 1u64 << attempt.min(6);
        sleep(Duration::from_millis(500 * factor)).await;
    }
}

struct PendingTx {
    op_id: String,
    kind: ActionKind,
    hash: String,
    confirming_reported: bool,
}

pub async fn run_rpc(
    mut rx: mpsc::Receiver<WriteCall>,
    report_tx: mpsc::Sender<TxReport>,
    client: RpcClient,
    user: String,
    ws_url: String,
) {
    let (head_tx, mut head_rx) = mpsc::channel::<()>(16);
    tokio::spawn(new_heads_loop(ws_url, head_tx));

    // fallback cadence when the subscription is down
    let mut tick = interval(Duration::from_millis(2_000));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending: Vec<PendingTx> = Vec::new();

    loop {
        tokio::select! {
            maybe_call = rx.recv() => {
                let Some(call) = maybe_call else { break };
                let tx = match client.encode_write(&user, &call) {
                    Ok(tx) => tx,
                    Err(e) => {
                        send_report(&report_tx, TxReport {
                            op_id: call.op_id, kind: call.kind, tx_handle: None,
                            phase: TxPhase::Failed(e.to_string()), ts_ms: 0,
                        }).await;
                        continue;
                    }
                };
                match client.send_transaction(tx).await {
                    Ok(hash) => {
                        info!(kind = call.kind.as_str(), %hash, "write submitted");
                        send_report(&report_tx, TxReport {
                            op_id: call.op_id.clone(), kind: call.kind,
                            tx_handle: Some(hash.clone()),
                            phase: TxPhase::Submitted, ts_ms: 0,
                        }).await;
                        pending.push(PendingTx {
                            op_id: call.op_id, kind: call.kind, hash,
                            confirming_reported: false,
                        });
                    }
                    Err(e) => {
                        // wallet/node rejected the submission outright
                        error!(?e, kind = call.kind.as_str(), "write submission failed");
                        send_report(&report_tx, TxReport {
                            op_id: call.op_id, kind: call.kind, tx_handle: None,
                            phase: TxPhase::Failed(e.to_string()), ts_ms: 0,
                        }).await;
                    }
                }
            }
            _ = head_rx.recv() => {
                poll_pending(&client, &report_tx, &mut pending).await;
            }
            _ = tick.tick() => {
                if !pending.is_empty() {
                    poll_pending(&client, &report_tx, &mut pending).await;
                }
            }
        }
    }
}

async fn poll_pending(
    client: &RpcClient,
    report_tx: &mpsc::Sender<TxReport>,
    pending: &mut Vec<PendingTx>,
) {
    let mut settled: Vec<usize> = Vec::new();
    for (i, p) in pending.iter_mut().enumerate() {
        match client.receipt_status(&p.hash).await {
            Ok(None) => {}
            Ok(Some(ok)) => {
                if !p.confirming_reported {
                    send_report(report_tx, TxReport {
                        op_id: p.op_id.clone(), kind: p.kind,
                        tx_handle: Some(p.hash.clone()),
                        phase: TxPhase::Confirming, ts_ms: 0,
                    }).await;
                    p.confirming_reported = true;
                }
                let phase = if ok {
                    TxPhase::Succeeded
                } else {
                    TxPhase::Failed("transaction reverted".into())
                };
                send_report(report_tx, TxReport {
                    op_id: p.op_id.clone(), kind: p.kind,
                    tx_handle: Some(p.hash.clone()),
                    phase, ts_ms: 0,
                }).await;
                settled.push(i);
            }
            Err(e) => {
                // transient read problem: keep the tx pending, retry next head
                warn!(?e, hash = %p.hash, "receipt poll failed");
            }
        }
    }
    for i in settled.into_iter().rev() {
        pending.remove(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_encoding_shapes() {
        let word = abi_address("0x70997970C51812dc3A010C7d01b50e0d17dc79C8").unwrap();
        assert_eq!(word.len(), 64);
        assert!(word.starts_with("000000000000000000000000"));
        assert!(word.ends_with("70997970c51812dc3a010c7d01b50e0d17dc79c8"));

        assert!(abi_address("nonsense").is_err());
        assert_eq!(abi_u128(1), format!("{:064x}", 1u128));
    }

    #[test]
    fn return_word_decoding() {
        assert_eq!(word_to_u128(&format!("{:064x}", 700u128)), Some(700));
        // uint256 with high bytes set does not fit
        assert_eq!(word_to_u128(&"f".repeat(64)), None);
        assert_eq!(quantity_to_u128("0x2a").unwrap(), 42);
    }

    #[test]
    fn write_encoding_targets_pool_or_token() {
        let client = RpcClient::new(
            "http://127.0.0.1:8545".into(),
            "0x9fE46736679d2D9a65F0992F2272dE9f3c7fA6e0".into(),
            "0x5FbDB2315678afecb367f032d93F642f64180aa3".into(),
        );
        let user = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

        let dep = client
            .encode_write(user, &WriteCall { op_id: "d".into(), kind: ActionKind::Deposit, amount: 5 })
            .unwrap();
        assert_eq!(dep["to"], client.pool);
        assert_eq!(dep["data"], format!("0x{SEL_DEPOSIT_NATIVE}"));
        assert_eq!(dep["value"], "0x5");

        let app = client
            .encode_write(user, &WriteCall { op_id: "a".into(), kind: ActionKind::Approve, amount: 200_000_000 })
            .unwrap();
        assert_eq!(app["to"], client.token);
        let data = app["data"].as_str().unwrap();
        assert!(data.starts_with(&format!("0x{SEL_APPROVE}")));
        assert!(data.ends_with(&abi_u128(200_000_000)));
        assert!(app.get("value").is_none());
    }
}
