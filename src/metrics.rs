// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use crate::amount::{pow10, HF_SATURATED};

// Single custom registry (everything is registered here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Controller metrics --------
pub static REFRESHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshot_refreshes_total", "position snapshot refreshes"),
        &["outcome"],
    )
    .unwrap()
});

pub static VALIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("action_validations_total", "validator verdicts per action kind"),
        &["kind", "verdict"],
    )
    .unwrap()
});

pub static WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("writes_dispatched_total", "write calls handed to the gateway"),
        &["kind"],
    )
    .unwrap()
});

pub static TX_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tx_reports_total", "gateway transaction reports"),
        &["kind", "phase"],
    )
    .unwrap()
});

pub static NOTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("notifications_total", "notifications posted"),
        &["kind"],
    )
    .unwrap()
});

// -------- Position gauges (milli display units) --------
pub static POS_COLLATERAL: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("position_collateral_native_milli", "collateral in 1/1000 native units").unwrap()
});

pub static POS_DEBT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("position_debt_borrowed_milli", "debt in 1/1000 borrow-asset units").unwrap()
});

pub static POS_HEADROOM: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("position_headroom_usd_milli", "borrow headroom in 1/1000 USD").unwrap()
});

pub static POS_HEALTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("position_health_factor_milli", "health factor x1000 (saturated = max)").unwrap()
});

// ---- Config visibility ----
pub static CONFIG_GATEWAY_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_gateway_mode", "gateway mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_USER: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_user", "configured wallet (label: address)"),
        &["address"],
    )
    .unwrap()
});

/// Raw fixed-point value scaled down to 1/1000 units for gauge display.
pub fn milli(raw: u128, decimals: u32) -> i64 {
    if raw == HF_SATURATED {
        return i64::MAX;
    }
    let scaled = raw / pow10(decimals.saturating_sub(3));
    scaled.min(i64::MAX as u128) as i64
}

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(REFRESHES.clone())),
        REGISTRY.register(Box::new(VALIDATIONS.clone())),
        REGISTRY.register(Box::new(WRITES.clone())),
        REGISTRY.register(Box::new(TX_REPORTS.clone())),
        REGISTRY.register(Box::new(NOTES.clone())),
        REGISTRY.register(Box::new(POS_COLLATERAL.clone())),
        REGISTRY.register(Box::new(POS_DEBT.clone())),
        REGISTRY.register(Box::new(POS_HEADROOM.clone())),
        REGISTRY.register(Box::new(POS_HEALTH.clone())),
        REGISTRY.register(Box::new(CONFIG_GATEWAY_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_USER.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Consume the request headers, no full parse
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps the Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::WAD;

    #[test]
    fn milli_scaling() {
        assert_eq!(milli(WAD, 18), 1_000);
        assert_eq!(milli(WAD / 2, 18), 500);
        assert_eq!(milli(700_000_000, 6), 700_000);
        assert_eq!(milli(HF_SATURATED, 18), i64::MAX);
    }
}
