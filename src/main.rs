use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use tollgate::config::TollgateConfig;
use tollgate::headers;
use tollgate::ratelimit::RateLimitManager;
use tollgate::request::{Principal, RequestInfo};

#[derive(Parser)]
#[command(
    name = "tollgate",
    about = "Tiered request rate limiting",
    version
)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file and print the resolved tiers
    CheckConfig {
        /// Path to the YAML configuration
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Run a burst of requests through an in-memory limiter
    Simulate {
        /// Path to the YAML configuration, built-in tiers if omitted
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Client IP address
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Request path
        #[arg(long, default_value = "/")]
        path: String,

        /// Tier claimed by the principal
        #[arg(long)]
        tier: Option<String>,

        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        requests: u32,

        /// Quota consumed by each request
        #[arg(long, default_value_t = 1)]
        cost: u64,

        /// Inspect quota without consuming it
        #[arg(long)]
        peek: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine readable
    let level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Tollgate v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::CheckConfig { file } => check_config(&file),
        Command::Simulate {
            config,
            ip,
            method,
            path,
            tier,
            user,
            requests,
            cost,
            peek,
        } => {
            let config = match config {
                Some(file) => load_config(&file)?,
                None => TollgateConfig::default(),
            };
            let request = build_request(method, path, ip, user, tier);
            simulate(&config, &request, requests, cost, peek)
        }
    }
}

fn load_config(file: &Path) -> anyhow::Result<TollgateConfig> {
    TollgateConfig::load(file)
        .with_context(|| format!("Failed to load configuration from {}", file.display()))
}

fn check_config(file: &Path) -> anyhow::Result<()> {
    let config = load_config(file)?;
    let tiers = config.tier_manager()?;
    let default_limit = config.default_limit()?;

    let mut report = Map::new();
    for name in tiers.tier_names() {
        let limits: Vec<String> = tiers
            .create_default_limits(name)
            .iter()
            .map(|limit| headers::format_policy(limit.attempts, limit.window_secs, None))
            .collect();
        report.insert(
            name.to_string(),
            json!({
                "unlimited": tiers.is_completely_unlimited(name),
                "limits": limits,
            }),
        );
    }

    let summary = json!({
        "baseline_tier": tiers.baseline(),
        "default_limit": headers::format_policy(default_limit.attempts, default_limit.window_secs, None),
        "failure_policy": config.failure_policy,
        "tiers": report,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    info!(tiers = tiers.tier_names().len(), "Configuration is valid");
    Ok(())
}

fn build_request(
    method: String,
    path: String,
    ip: String,
    user: Option<String>,
    tier: Option<String>,
) -> RequestInfo {
    let request = RequestInfo::new(method, path, ip);
    if user.is_none() && tier.is_none() {
        return request;
    }

    let mut record = Map::new();
    if let Some(user) = user {
        record.insert("id".to_string(), Value::String(user));
    }
    if let Some(tier) = tier {
        record.insert("tier".to_string(), Value::String(tier));
    }
    request.with_principal(Principal::Record(record))
}

fn simulate(
    config: &TollgateConfig,
    request: &RequestInfo,
    requests: u32,
    cost: u64,
    peek: bool,
) -> anyhow::Result<()> {
    let manager = RateLimitManager::with_memory_storage(config)?;
    info!(
        tier = %manager.resolve_tier(request),
        requests = requests,
        "Simulating requests"
    );

    for n in 1..=requests {
        let result = if peek {
            manager.check(request, &[])
        } else {
            manager.attempt(request, &[], cost)
        };
        debug!(request = n, allowed = result.is_allowed(), "Evaluated request");

        let (status, headers) = if result.is_allowed() {
            (200, manager.headers(&result))
        } else {
            let response = manager.exceeded_response(&result);
            (response.status, response.headers)
        };
        let headers: Map<String, Value> = headers
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect();

        let line = json!({
            "request": n,
            "status": status,
            "result": result,
            "headers": headers,
        });
        println!("{}", serde_json::to_string(&line)?);
    }

    Ok(())
}
