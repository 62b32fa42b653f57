// ===============================
// src/config.rs
// ===============================
use clap::Parser;
use dotenvy::dotenv;
use std::env;

use crate::amount::{parse_units, BORROW_DECIMALS, NATIVE_DECIMALS};

/// Which ledger gateway backs the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayMode {
    Mock,
    Rpc,
}

impl GatewayMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(GatewayMode::Mock),
            "rpc" | "node" | "evm" => Some(GatewayMode::Rpc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Mock => "mock",
            GatewayMode::Rpc => "rpc",
        }
    }
}

/// Deployed-address record, supplied externally, never computed here.
/// Defaults are the deterministic local dev-node deploy addresses.
#[derive(Clone, Debug)]
pub struct Addresses {
    pub pool: String,
    pub borrow_asset_token: String,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub mode: GatewayMode,
    pub user: String,
    pub addresses: Addresses,

    // rpc endpoints (ignored in mock mode)
    pub rpc_http_url: String,
    pub rpc_ws_url: String,

    // cadences
    pub refresh_interval_ms: u64,
    pub notify_ttl_ms: u64,
    pub mock_confirm_ms: u64,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    // run the scripted demo lifecycle instead of the REPL
    pub demo: bool,
}

/// Parameters of the in-memory mock pool (oracle price, LTV, seeded balances).
#[derive(Clone, Debug)]
pub struct MockPoolCfg {
    /// USD per native unit, 18 fractional digits.
    pub price_native_usd: u128,
    pub ltv_bps: u32,
    pub user_native_balance: u128,
    pub user_borrow_balance: u128,
    /// Borrow-asset liquidity seeded into the pool, 6 fractional digits.
    pub pool_liquidity: u128,
}

#[derive(Parser, Debug)]
#[command(name = "lend_dash_rust", about = "position controller for a collateralized lending pool")]
struct Cli {
    /// gateway mode: mock | rpc
    #[arg(long)]
    mode: Option<String>,
    /// user wallet address
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    metrics_port: Option<u16>,
    /// record events to this JSONL file
    #[arg(long)]
    record_file: Option<String>,
    /// run the scripted deposit/borrow/repay/withdraw lifecycle and exit
    #[arg(long, default_value_t = false)]
    demo: bool,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_amount(key: &str, decimals: u32, default: &str) -> u128 {
    let text = env::var(key).unwrap_or_else(|_| default.to_string());
    parse_units(&text, decimals).unwrap_or_else(|| parse_units(default, decimals).unwrap())
}

pub fn load() -> (Args, MockPoolCfg) {
    // read .env first so RECORD_FILE, addresses etc. are visible
    let _ = dotenv();
    let cli = Cli::parse();

    let mode = cli
        .mode
        .as_deref()
        .and_then(GatewayMode::parse_one)
        .or_else(|| env::var("GATEWAY_MODE").ok().as_deref().and_then(GatewayMode::parse_one))
        .unwrap_or(GatewayMode::Mock);

    // dev-node account #1, same account the original verify script tests with
    let user = cli
        .user
        .or_else(|| env::var("USER_ADDRESS").ok())
        .unwrap_or_else(|| "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".to_string());

    let addresses = Addresses {
        pool: env::var("POOL_ADDRESS")
            .unwrap_or_else(|_| "0x9fE46736679d2D9a65F0992F2272dE9f3c7fA6e0".to_string()),
        borrow_asset_token: env::var("TOKEN_ADDRESS")
            .unwrap_or_else(|_| "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string()),
    };

    let rpc_http_url =
        env::var("RPC_HTTP_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
    let rpc_ws_url = env::var("RPC_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8545".to_string());

    let args = Args {
        mode,
        user,
        addresses,
        rpc_http_url,
        rpc_ws_url,
        refresh_interval_ms: env_u64("REFRESH_INTERVAL_MS", 5_000),
        notify_ttl_ms: env_u64("NOTIFY_TTL_MS", 5_000),
        mock_confirm_ms: env_u64("MOCK_CONFIRM_MS", 120),
        record_file: cli.record_file.or_else(|| env::var("RECORD_FILE").ok()),
        metrics_port: cli
            .metrics_port
            .unwrap_or_else(|| env_u64("METRICS_PORT", 9898) as u16),
        demo: cli.demo,
    };

    // Mock pool defaults mirror the local demo deployment:
    // native priced at $111,000, stable at $1, LTV 70.00 %.
    let ltv_bps = env_u64("MOCK_LTV_BPS", 7_000) as u32;
    let mock = MockPoolCfg {
        price_native_usd: env_amount("MOCK_PRICE_USD", NATIVE_DECIMALS, "111000"),
        ltv_bps,
        user_native_balance: env_amount("MOCK_NATIVE_BALANCE", NATIVE_DECIMALS, "10"),
        user_borrow_balance: env_amount("MOCK_STABLE_BALANCE", BORROW_DECIMALS, "0"),
        pool_liquidity: env_amount("MOCK_POOL_LIQUIDITY", BORROW_DECIMALS, "100000"),
    };

    (args, mock)
}
