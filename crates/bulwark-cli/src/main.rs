//! `bulwark`: drive the resilience runtime against a simulated upstream.

mod simulated;

use anyhow::{Context, Result};
use bulwark_runtime::{ResilientClient, RuntimeConfig, Upstream};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use simulated::SimulatedSearch;

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Exercise retry, circuit breaker and stale-cache fallback", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply for missing fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send requests through the client and print each outcome
    Simulate(SimulateArgs),
    /// Print the effective configuration
    Config,
}

/// Flags that override values from the configuration file.
#[derive(Args)]
struct Overrides {
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    #[arg(long, global = true)]
    base_delay_ms: Option<u64>,

    #[arg(long, global = true)]
    failure_threshold: Option<u32>,

    #[arg(long, global = true)]
    cooldown_ms: Option<u64>,

    #[arg(long, global = true)]
    cache_capacity: Option<usize>,

    #[arg(long, global = true)]
    ttl_ms: Option<u64>,

    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
}

#[derive(Args)]
struct SimulateArgs {
    /// Total requests to send
    #[arg(short = 'n', long, default_value_t = 20)]
    requests: usize,

    /// Distinct keys the requests cycle through
    #[arg(long, default_value_t = 3)]
    keys: usize,

    /// Requests in flight at once
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Upstream calls that fail before the upstream recovers
    #[arg(long, default_value_t = 0)]
    fail_first: u64,

    /// After recovery, every N-th upstream call fails (0 disables)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Latency of each upstream call
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Pause between batches of requests
    #[arg(long, default_value_t = 0)]
    pause_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate(args) => simulate(config, args).await?,
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>, overrides: &Overrides) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            RuntimeConfig::from_json_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };

    if let Some(v) = overrides.max_attempts {
        config.retry.max_attempts = v;
    }
    if let Some(v) = overrides.base_delay_ms {
        config.retry.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = overrides.failure_threshold {
        config.circuit_breaker.failure_threshold = v;
    }
    if let Some(v) = overrides.cooldown_ms {
        config.circuit_breaker.cooldown = Duration::from_millis(v);
    }
    if let Some(v) = overrides.cache_capacity {
        config.cache.capacity = v;
    }
    if let Some(v) = overrides.ttl_ms {
        config.cache.default_ttl = Duration::from_millis(v);
    }
    if let Some(v) = overrides.timeout_ms {
        config.call_timeout = Duration::from_millis(v);
    }

    config.validate()?;
    Ok(config)
}

async fn simulate(config: RuntimeConfig, args: SimulateArgs) -> Result<()> {
    let client: ResilientClient<String> = ResilientClient::new(config)?;
    let search = Arc::new(SimulatedSearch::new(
        args.fail_first,
        args.fail_every,
        Duration::from_millis(args.latency_ms),
    ));
    let upstream: Arc<dyn Upstream<String>> = search.clone();

    tracing::info!(
        requests = args.requests,
        keys = args.keys,
        concurrency = args.concurrency,
        upstream = upstream.name(),
        "Starting simulation"
    );

    let keys = args.keys.max(1);
    let batch = args.concurrency.max(1);
    let mut sent = 0;

    while sent < args.requests {
        let mut tasks = JoinSet::new();
        for request in sent..(sent + batch).min(args.requests) {
            let client = client.clone();
            let upstream = upstream.clone();
            let key = format!("subject-{}", request % keys);
            tasks.spawn(async move {
                let outcome = client.invoke_upstream(&key, upstream).await;
                (request, key, outcome)
            });
        }
        sent += tasks.len();

        let mut lines = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (request, key, outcome) = joined?;
            let line = match outcome {
                Ok(invocation) => json!({
                    "request": request,
                    "key": key,
                    "ok": true,
                    "value": invocation.value,
                    "metadata": invocation.metadata,
                }),
                Err(err) => json!({
                    "request": request,
                    "key": key,
                    "ok": false,
                    "error_kind": err.kind(),
                    "message": err.user_message(),
                }),
            };
            lines.push((request, line));
        }
        lines.sort_by_key(|(request, _)| *request);
        for (_, line) in lines {
            println!("{line}");
        }

        if args.pause_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.pause_ms)).await;
        }
    }

    let snapshot = client.health().check();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "upstream_calls": search.calls(),
            "health": snapshot,
            "cache": client.cache().stats(),
        }))?
    );

    client.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overrides() -> Overrides {
        Overrides {
            max_attempts: None,
            base_delay_ms: None,
            failure_threshold: None,
            cooldown_ms: None,
            cache_capacity: None,
            ttl_ms: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(None, &no_overrides()).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_overrides_apply() {
        let overrides = Overrides {
            max_attempts: Some(5),
            cooldown_ms: Some(1500),
            ..no_overrides()
        };
        let config = load_config(None, &overrides).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let overrides = Overrides {
            failure_threshold: Some(0),
            ..no_overrides()
        };
        assert!(load_config(None, &overrides).is_err());
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "bulwark",
            "simulate",
            "-n",
            "5",
            "--fail-first",
            "2",
            "--max-attempts",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.overrides.max_attempts, Some(4));
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.requests, 5);
                assert_eq!(args.fail_first, 2);
            }
            Commands::Config => panic!("expected simulate"),
        }
    }
}
