//! broker-cli: publish, listen and probe against any configured backend.
//!
//! Configuration comes from `--config <file>` (TOML) or, without it, from
//! the `BROKER_*` environment variables. `--backend` and `--url` override
//! either source.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use broker_telemetry::{init_logging, TelemetryConfig};
use event_broker::{
    connect, handler, Backend, BrokerConfig, Context, EventBroker, EventBrokerExt, Payload,
};

/// Event broker operator CLI
#[derive(Parser, Debug)]
#[command(name = "broker-cli")]
#[command(about = "Publish, listen and probe against an event broker")]
struct Args {
    /// TOML configuration file (defaults to BROKER_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend override: memory, mqtt, amqp, redis or nats
    #[arg(short, long, global = true)]
    backend: Option<Backend>,

    /// Endpoint override; repeat for failover lists
    #[arg(short, long = "url", global = true)]
    urls: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one event with a JSON payload
    Publish {
        event: String,
        json: String,

        /// Give up after this many seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Print events matching any of the patterns until interrupted
    Listen {
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Exit after this many events
        #[arg(long)]
        count: Option<usize>,
    },
    /// Subscribe, publish, and report round-trip latency
    Probe {
        #[arg(long, default_value = "broker.probe")]
        event: String,

        /// Seconds to wait for the echo
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(err) = init_logging(&TelemetryConfig::for_service("broker-cli")) {
        eprintln!("Warning: logging not initialized: {err}");
    }

    let config = resolve_config(&args)?;
    let broker = connect(&config)
        .await
        .with_context(|| format!("connecting {} broker", config.backend()))?;
    info!(backend = %broker.backend(), "Broker ready");

    let outcome = match args.command {
        Command::Publish {
            event,
            json,
            timeout,
        } => publish(broker.as_ref(), &event, &json, Duration::from_secs(timeout)).await,
        Command::Listen { patterns, count } => listen(broker.as_ref(), &patterns, count).await,
        Command::Probe { event, timeout } => {
            probe(broker.as_ref(), &event, Duration::from_secs(timeout)).await
        }
    };

    let closed = broker.close().await;
    outcome?;
    closed.context("closing broker")?;
    Ok(())
}

fn resolve_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::from_env()?,
    };
    if let Some(backend) = args.backend {
        if backend != config.backend() {
            config = BrokerConfig::for_backend(backend);
        }
    }
    Ok(config.with_urls(args.urls.clone()))
}

async fn publish(broker: &dyn EventBroker, event: &str, json: &str, timeout: Duration) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("payload is not valid JSON")?;
    let ctx = Context::background().with_timeout(timeout);
    broker.publish(&ctx, event, &value).await?;
    println!("published {event}");
    Ok(())
}

async fn listen(broker: &dyn EventBroker, patterns: &[String], count: Option<usize>) -> Result<()> {
    let ctx = Context::background();
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Payload)>();

    let mut subscriptions = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let tx = tx.clone();
        let label = pattern.clone();
        let sub = broker
            .subscribe(
                &ctx,
                pattern,
                handler(move |payload| {
                    let _ = tx.send((label.clone(), payload));
                }),
            )
            .await
            .with_context(|| format!("subscribing to '{pattern}'"))?;
        subscriptions.push(sub);
    }
    drop(tx);
    info!(patterns = ?patterns, "Listening; Ctrl+C to stop");

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            received = rx.recv() => {
                let Some((pattern, payload)) = received else { break };
                match payload.decode::<serde_json::Value>() {
                    Ok(value) => println!("[{pattern}] {value}"),
                    Err(err) => warn!(pattern = %pattern, error = %err, "Undecodable payload"),
                }
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
        }
    }

    for sub in subscriptions {
        if let Err(err) = sub.unsubscribe().await {
            warn!(error = %err, "Unsubscribe failed");
        }
    }
    Ok(())
}

async fn probe(broker: &dyn EventBroker, event: &str, timeout: Duration) -> Result<()> {
    let ctx = Context::background().with_timeout(timeout);
    let nonce = probe_nonce();
    let (sink, mut rx) = mpsc::unbounded_channel::<String>();

    let sub = broker
        .subscribe(
            &ctx,
            event,
            handler(move |payload| {
                if let Ok(nonce) = payload.decode::<String>() {
                    let _ = sink.send(nonce);
                }
            }),
        )
        .await
        .context("probe subscribe")?;

    let started = Instant::now();
    broker.publish(&ctx, event, &nonce).await.context("probe publish")?;

    let echoed = tokio::time::timeout(timeout, async {
        while let Some(received) = rx.recv().await {
            if received == nonce {
                return true;
            }
        }
        false
    })
    .await;
    let latency = started.elapsed();
    sub.unsubscribe().await.context("probe unsubscribe")?;

    match echoed {
        Ok(true) => {
            println!("probe ok: {} round-trip in {latency:?}", broker.backend());
            let stats = broker.stats();
            println!(
                "published={} delivered={} failures={} subscriptions={}",
                stats.published, stats.delivered, stats.handler_failures, stats.subscriptions
            );
            Ok(())
        }
        Ok(false) => bail!("probe subscription ended before the echo arrived"),
        Err(_) => bail!("no echo on '{event}' within {timeout:?}"),
    }
}

fn probe_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{nanos:x}", std::process::id())
}
