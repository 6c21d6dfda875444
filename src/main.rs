use clap::{Parser, Subcommand};
use serde_json::json;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shopgate::batcher::{handler_fn, Batcher, HandlerRegistry, JobContext};
use shopgate::config::ShopgateConfig;
use shopgate::ratelimit::{Admission, RateLimiter, RequestContext};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a burst of requests through the rate limiter and print each decision
    Simulate {
        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long, default_value = "/api/products")]
        path: String,

        /// Client address
        #[arg(long, default_value = "127.0.0.1")]
        ip: IpAddr,

        #[arg(long)]
        user_agent: Option<String>,

        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        role: Option<String>,

        /// Number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Pause between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Run the bucket sweeper and job batcher until interrupted
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let config = ShopgateConfig::load(args.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "Configuration loaded");

    match args.command {
        Command::Simulate {
            method,
            path,
            ip,
            user_agent,
            user,
            role,
            requests,
            interval_ms,
        } => {
            let limiter = RateLimiter::new(&config.rate_limiting)?;
            let mut ctx = RequestContext::new(method, path).with_peer(ip);
            if let Some(user_agent) = user_agent {
                ctx = ctx.with_header("user-agent", user_agent);
            }
            ctx.user_id = user;
            ctx.role = role;

            for n in 1..=requests {
                let admission = limiter.check(&ctx, None);
                let line = match admission {
                    Admission::Bypassed => json!({ "request": n, "bypassed": true }),
                    Admission::Limited(decision) => json!({
                        "request": n,
                        "decision": decision,
                        "headers": decision.headers().into_iter().collect::<std::collections::BTreeMap<_, _>>(),
                        "rejection": decision.rejection(),
                    }),
                };
                println!("{}", serde_json::to_string(&line)?);

                if interval_ms > 0 && n < requests {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
        Command::Run => run(config).await?,
    }

    Ok(())
}

async fn run(config: ShopgateConfig) -> anyhow::Result<()> {
    info!("Starting Shopgate");

    let limiter = Arc::new(RateLimiter::new(&config.rate_limiting)?);
    let sweeper = limiter.spawn_sweeper(config.rate_limiting.sweep_interval());

    let handlers = HandlerRegistry::new().generic(handler_fn(|job: JobContext| async move {
        info!(
            job_id = %job.id,
            job = %job.name,
            attempt = job.attempt,
            payload = %job.payload,
            "Processed job"
        );
        Ok::<(), anyhow::Error>(())
    }));
    let batcher = Batcher::start(&config.batcher, handlers)?;

    shutdown_signal().await;

    let report = batcher.shutdown().await;
    sweeper.abort();
    info!(
        in_flight = report.in_flight,
        abandoned_queued = report.abandoned_queued,
        "Shopgate stopped"
    );
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("shopgate=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
