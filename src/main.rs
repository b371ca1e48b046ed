//! CLI Entry Point for sepd-sc
//!
//! Provides command-line interface for:
//! - Running the distribution server (`serve`)
//! - Running the snapshot poller (`poll`), optionally once with JSON output
//! - Querying a running server from the terminal (`query`)
//!
//! # Usage
//!
//! ```bash
//! sepd-sc serve
//! sepd-sc poll --once
//! sepd-sc query temperature 3
//! sepd-sc query voltage --all
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sepd_sc::channel_map::ChannelMap;
use sepd_sc::config::Settings;
use sepd_sc::export;
use sepd_sc::network::{DistributionClient, DistributionServer, Request, Verb};
use sepd_sc::{tracing_setup, Scheduler};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sepd-sc")]
#[command(about = "sEPD slow-controls poller and distribution server", long_about = None)]
struct Cli {
    /// Settings file (TOML); SEPD_* environment variables override it
    #[arg(long, global = true, default_value = "config/sepd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve point queries against long-lived crate links
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Poll every subsystem on the throttle interval
    Poll {
        /// Run a single cycle and print the snapshot as JSON
        #[arg(long)]
        once: bool,
    },

    /// Send one request to a running server
    Query {
        /// temperature | voltage | current | help | shutdown
        verb: String,

        /// Interface board number
        board: Option<usize>,

        /// Query every interface board in turn
        #[arg(long, conflicts_with = "board")]
        all: bool,

        /// Server address (overrides client.server)
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    tracing_setup::init_from_settings(&settings).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Serve { bind } => serve(settings, bind).await,
        Commands::Poll { once } => poll(settings, once).await,
        Commands::Query {
            verb,
            board,
            all,
            server,
        } => query(settings, &verb, board, all, server).await,
    }
}

async fn serve(mut settings: Settings, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        settings.server.bind = bind;
    }
    let server = DistributionServer::bind(&settings).await?;
    let signal = server.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            signal.trigger();
        }
    });
    server.run().await?;
    Ok(())
}

async fn poll(settings: Settings, once: bool) -> Result<()> {
    let map = match &settings.channel_map {
        Some(path) => ChannelMap::load(path)?,
        None => {
            warn!("No channel map configured, per-tile samples will be skipped");
            ChannelMap::empty()
        }
    };
    let scheduler = Scheduler::from_settings(&settings);

    if once {
        let snapshot = scheduler.get_snapshot().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let period = settings.cache.throttle().max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = scheduler.get_snapshot().await;
                let samples = export::samples(&snapshot, &map, &settings.export);
                let stats = scheduler.stats().await;
                info!(
                    samples = samples.len(),
                    subsystems = ?snapshot.populated(),
                    updated = stats.updated,
                    failed = stats.failed,
                    cycle = ?stats.last_cycle,
                    "Snapshot refreshed"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }
}

async fn query(
    settings: Settings,
    verb: &str,
    board: Option<usize>,
    all: bool,
    server: Option<String>,
) -> Result<()> {
    let addr = server.unwrap_or(settings.client.server.clone());
    let mut client = DistributionClient::connect(&addr, settings.client.timeout()).await?;

    let Some(verb) = Verb::parse(verb) else {
        let reply = client.send(&Request::Unknown(verb.to_string())).await?;
        println!("{reply}");
        return Ok(());
    };

    if all {
        let boards = settings.controllers.total_boards();
        for (board, reply) in client.query_all(verb, boards).await {
            println!("{board:>2}: {reply}");
        }
        return Ok(());
    }

    if verb.takes_board() && board.is_none() {
        return Err(anyhow!("Specify interface board number - no request sent"));
    }
    let reply = client.request(verb, board).await?;
    println!("{reply}");
    Ok(())
}
