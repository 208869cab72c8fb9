// lifeline-cli — Desktop CLI for the Lifeline core
//
// Configuration management, an in-process multi-node radio simulation and
// inspection of a node's persisted queues.

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use lifeline_core::delivery::DeliveryRecord;
use lifeline_core::hybrid::PersistedQueue;
use lifeline_core::store::{keys, load_json, PersistedLanes};
use lifeline_core::{GeoPoint, SledStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "lifeline")]
#[command(about = "Lifeline — messaging when the network is gone", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "info" or "lifeline_core=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several nodes over a simulated radio and report what each saw
    Simulate {
        #[arg(short, long, default_value = "3")]
        nodes: usize,
        /// Link nodes in a line instead of all in range
        #[arg(long)]
        chain: bool,
        /// Give every node internet access (cloud channel)
        #[arg(long)]
        online: bool,
        /// Address the message to node N instead of broadcasting
        #[arg(long)]
        to: Option<usize>,
        /// Send an SOS instead of a chat message
        #[arg(long)]
        sos: bool,
        #[arg(long, requires = "lng")]
        lat: Option<f64>,
        #[arg(long, requires = "lat")]
        lng: Option<f64>,
        /// Seconds to let the simulation run
        #[arg(short, long, default_value = "10")]
        duration: u64,
        /// Keep node state in sled stores under the data directory
        #[arg(long)]
        persist: bool,
        #[arg(short, long)]
        quiet: bool,
        #[arg(default_value = "Hello from the mesh")]
        message: String,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show the queues and delivery records a persisted node left behind
    Inspect {
        /// Node name (as used by `simulate --persist`)
        node: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    Get { key: String },
    Set { key: String, value: String },
    /// Restore defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_level.as_deref(), cli.log_dir.as_ref())?;

    match cli.command {
        Commands::Simulate {
            nodes,
            chain,
            online,
            to,
            sos,
            lat,
            lng,
            duration,
            persist,
            quiet,
            message,
        } => {
            let location = lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng));
            let options = simulate::SimulationOptions {
                nodes,
                chain,
                online,
                name_prefix: String::new(),
                message,
                to,
                sos,
                location,
                duration: Duration::from_secs(duration),
                persist_dir: None,
                verbose: !quiet,
            };
            cmd_simulate(options, persist).await
        }
        Commands::Config { action } => cmd_config(action),
        Commands::Inspect { node } => cmd_inspect(&node).await,
    }
}

fn init_logging(
    level: Option<&str>,
    log_dir: Option<&PathBuf>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log filter: {}", level))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "lifeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn cmd_simulate(mut options: simulate::SimulationOptions, persist: bool) -> Result<()> {
    let config = config::Config::load()?;
    options.name_prefix = config.node_name.clone();
    if persist {
        options.persist_dir = Some(config.storage_dir()?);
    }

    println!("{}", "Lifeline — Simulation".bold());
    println!();
    println!(
        "  Nodes:    {} ({})",
        options.nodes,
        if options.chain { "chain" } else { "all in range" }
    );
    println!(
        "  Cloud:    {}",
        if options.online {
            "online".green()
        } else {
            "offline".yellow()
        }
    );
    println!("  Duration: {}s", options.duration.as_secs());
    println!();

    let reports = simulate::run(&config.core, &options).await?;

    println!();
    println!("{}", "Results".bold());
    println!(
        "  {:<16} {:>8} {:>6} {:>6} {:>8} {:>8} {:>8} {:>8}",
        "node", "received", "peers", "sent", "relayed", "dupes", "pending", "failed"
    );
    for report in &reports {
        let received = if report.received > 0 {
            report.received.to_string().green()
        } else {
            report.received.to_string().dimmed()
        };
        println!(
            "  {:<16} {:>8} {:>6} {:>6} {:>8} {:>8} {:>8} {:>8}",
            report.name.bright_cyan(),
            received,
            report.peers,
            report.mesh.packets_sent,
            report.mesh.packets_relayed,
            report.mesh.duplicates_dropped,
            report.pending,
            report.failed
        );
    }

    let tracked = &reports[0].delivery;
    if tracked.total > 0 {
        println!();
        println!(
            "Delivery: {} tracked, {} delivered, {} pending, {} failed (avg {:.0} ms)",
            tracked.total,
            tracked.delivered,
            tracked.pending,
            tracked.failed,
            tracked.avg_delivery_time_ms
        );
    }

    if let Some(dir) = &options.persist_dir {
        println!();
        println!("State kept in {}", dir.display().to_string().bright_cyan());
    }

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
            println!();
            for (key, value) in config.list() {
                println!("  {:<42} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }
    }

    Ok(())
}

async fn cmd_inspect(node: &str) -> Result<()> {
    let config = config::Config::load()?;
    let path = config.storage_dir()?.join(node);
    if !path.exists() {
        anyhow::bail!(
            "No stored state for {} (run `lifeline simulate --persist` first)",
            node
        );
    }
    let store = SledStore::open(&path).context("Failed to open node store")?;

    let queue = load_json::<PersistedQueue>(&store, keys::MESSAGE_QUEUE)
        .await
        .context("Failed to read message queue")?
        .unwrap_or_default();
    let records = load_json::<Vec<DeliveryRecord>>(&store, keys::DELIVERY_TRACKING)
        .await
        .context("Failed to read delivery records")?
        .unwrap_or_default();
    let lanes = load_json::<PersistedLanes>(&store, keys::MESH_QUEUE)
        .await
        .context("Failed to read mesh queue")?
        .unwrap_or_default();

    println!("{} {}", "Node".bold(), node.bright_cyan());
    println!("  {}", path.display().to_string().dimmed());
    println!();

    println!(
        "{} ({} queued, {} failed)",
        "Outbound messages".bold(),
        queue.queue.len(),
        queue.failed.len()
    );
    for message in queue.queue.iter().chain(&queue.failed) {
        println!(
            "  {} [{}] {:?} {} → {} (attempts: {})",
            format_timestamp(message.timestamp).dimmed(),
            message.status,
            message.priority,
            message.id,
            message.recipient_id.as_deref().unwrap_or("everyone"),
            message.retry_count
        );
    }
    println!();

    println!("{} ({})", "Delivery records".bold(), records.len());
    for record in &records {
        let status = match record.failed_reason.as_deref() {
            Some(reason) => format!("{} ({})", record.status, reason).red().to_string(),
            None => record.status.to_string(),
        };
        println!(
            "  {} {} → {} {} (retries: {})",
            format_timestamp(record.sent_at).dimmed(),
            record.message_id,
            record.recipient_id,
            status,
            record.retry_count
        );
    }
    println!();

    println!(
        "{} critical {} / high {} / normal {} / relay {}",
        "Mesh lanes".bold(),
        lanes.critical.len(),
        lanes.high.len(),
        lanes.normal.len(),
        lanes.relay.len()
    );

    Ok(())
}

fn format_timestamp(timestamp_ms: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
