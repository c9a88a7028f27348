//! replay: operate the LLM replay engine from the command line.
//!
//! Usage:
//!   replay import records.ndjson
//!   replay export --pair BTC/USDT --timeframe 15m [--from 1700000000] [--to 1700086400] [--out out.ndjson]
//!   replay resolve --pair BTC/USDT --timeframe 15m --hash <sha256> --ts 1700000000 [--request-id ID]
//!   replay replay queries.ndjson [--out decisions.ndjson]
//!   replay audit --run <run_id> [--out report.json]
//!   replay verify --pair BTC/USDT --timeframe 15m
//!   replay verify --run <run_id>
//!
//! Backends and the nearest-match bound come from the environment (see
//! `ReplayConfig::from_env`). Only `resolve` and `replay` need
//! `REPLAY_MAX_NEAREST_DISTANCE_SECS`; `REPLAY_RUN_ID` names the run they
//! log into.

use anyhow::{bail, Result};

use replay_engine::{ReplayConfig, ReplayRuntime};

mod args;
mod commands;

use args::Args;

const USAGE: &str = "usage: replay <import|export|resolve|replay|audit|verify> [options]";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "replay_cli=info,replay_engine=info,replay_auditor=info,record_store=info",
            )
        })
    };
    let json_logging = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
    }

    let mut argv = std::env::args().skip(1);
    let command = match argv.next() {
        Some(c) => c,
        None => bail!(USAGE),
    };
    let args = Args::new(argv.collect());

    let config = ReplayConfig::from_env()?;
    let runtime = ReplayRuntime::open(config).await?;

    match command.as_str() {
        "import" => commands::import(&runtime, &args).await,
        "export" => commands::export(&runtime, &args).await,
        "resolve" => commands::resolve(&runtime, &args).await,
        "replay" => commands::replay(&runtime, &args).await,
        "audit" => commands::audit(&runtime, &args).await,
        "verify" => commands::verify(&runtime, &args).await,
        other => bail!("unknown command {}\n{}", other, USAGE),
    }
}
