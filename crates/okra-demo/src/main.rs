use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::PossibleValue;
use clap::{crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command};
use okra_runtime::{CancellationToken, CompiledModule, PoolConfig, WorkerPool};
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// A minimal guest implementing `add` over an 8-byte wire frame (two
/// little-endian u32 operands in, one little-endian u32 sum out), used when
/// `--wasm` is not given so this binary is runnable with zero setup.
const FIXTURE_WAT: &str = include_str!("fixture.wat");

fn build_cli() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .arg(
            Arg::new("wasm")
                .long("wasm")
                .value_name("PATH")
                .env("OKRA_WASM_PATH")
                .help("Guest WebAssembly module to load; defaults to the bundled add-service fixture"),
        )
        .arg(
            Arg::new("min-workers")
                .long("min-workers")
                .value_name("COUNT")
                .env("OKRA_MIN_WORKERS")
                .default_value("0")
                .help("Workers pre-warmed at pool construction"),
        )
        .arg(
            Arg::new("max-workers")
                .long("max-workers")
                .value_name("COUNT")
                .env("OKRA_MAX_WORKERS")
                .default_value("4")
                .help("Hard ceiling on simultaneously live workers"),
        )
        .arg(
            Arg::new("calls")
                .long("calls")
                .value_name("COUNT")
                .env("OKRA_CALLS")
                .default_value("8")
                .help("Number of concurrent invoke calls to issue against the pool"),
        )
        .arg(
            Arg::new("log-fmt")
                .long("log-fmt")
                .value_name("LOG_FMT")
                .env("OKRA_LOG_FMT")
                .default_value("text")
                .value_parser([PossibleValue::new("text"), PossibleValue::new("json")])
                .help("Log output format"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .env("OKRA_DEBUG")
                .action(ArgAction::SetTrue)
                .help("Increase log verbosity"),
        )
}

fn init_tracing(log_fmt: &str, debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter_layer = EnvFilter::new(level)
        .add_directive("cranelift_codegen=off".parse().unwrap())
        .add_directive("cranelift_wasm=off".parse().unwrap());

    if log_fmt == "json" {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer())
            .init();
    }
}

fn add_input(a: u32, b: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&a.to_le_bytes());
    buf.extend_from_slice(&b.to_le_bytes());
    buf
}

fn decode_sum(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .context("guest returned an output frame of unexpected length")?;
    Ok(u32::from_le_bytes(arr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let log_fmt = matches.get_one::<String>("log-fmt").unwrap();
    init_tracing(log_fmt, matches.get_flag("debug"));

    let min_workers: usize = matches
        .get_one::<String>("min-workers")
        .unwrap()
        .parse()
        .context("--min-workers must be a non-negative integer")?;
    let max_workers: usize = matches
        .get_one::<String>("max-workers")
        .unwrap()
        .parse()
        .context("--max-workers must be a non-negative integer")?;
    let calls: usize = matches
        .get_one::<String>("calls")
        .unwrap()
        .parse()
        .context("--calls must be a non-negative integer")?;

    let bytecode: Vec<u8> = match matches.get_one::<String>("wasm") {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("cannot read guest module at {path}"))?
        }
        None => {
            debug!("no --wasm given, running the bundled add-service fixture");
            FIXTURE_WAT.as_bytes().to_vec()
        }
    };

    let module = CompiledModule::compile(&bytecode).context("cannot compile guest module")?;
    let config = PoolConfig {
        min_workers,
        max_workers,
    };
    info!(min_workers, max_workers, "starting worker pool");
    let pool = Arc::new(WorkerPool::new(config, module).context("cannot start worker pool")?);
    info!(active = pool.active_workers(), "pool pre-warmed");

    let mut handles = Vec::with_capacity(calls);
    for i in 0..calls as u32 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let input = add_input(i, i);
            let output = pool.invoke(&cancel, b"add", &input).await?;
            decode_sum(&output)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await.context("invoke task panicked")? {
            Ok(sum) => info!(call = i, a = i, b = i, sum, "invoke completed"),
            Err(err) => info!(call = i, error = %err, "invoke failed"),
        }
    }

    info!(active = pool.active_workers(), "all calls complete");
    pool.shutdown().await.context("error shutting down pool")?;
    info!("pool shut down");

    Ok(())
}
