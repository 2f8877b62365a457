use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::sync::Arc;
use stream_catalog::bridge::BridgeConfig;
use stream_catalog::catalog::HarvestConfig;
use stream_catalog::database_ops::igdb::{IgdbClient, IgdbClientConfig};
use stream_catalog::database_ops::twitch::{HelixClient, TwitchClientConfig};
use stream_catalog::database_ops::twitch_auth::{TokenCache, TwitchCredentials};
use stream_catalog::logging::init_tracing;
use stream_catalog::pipeline::{self, JobContext};
use stream_catalog::storage::TableStore;
use stream_catalog::util::cancel::CancelFlag;
use stream_catalog::util::env;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "stream-catalog",
    version,
    about = "Harvest the game catalog and roll live streams into streamer history"
)]
struct Cli {
    /// Log crate events at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Harvest every catalog game and refresh lookup tables
    Games,
    /// Page through live streams and fold them into streamer history
    Streamers {
        /// Stop after this many distinct live streams
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Add archived videos for streamers without video data
    Videos {
        /// Process at most this many streamers
        #[arg(long)]
        streamers: Option<usize>,
    },
    /// Record today's follower counts
    Followers {
        /// Process at most this many streamers
        #[arg(long)]
        streamers: Option<usize>,
    },
}

struct Clients {
    igdb: Arc<IgdbClient>,
    helix: HelixClient,
}

fn build_clients() -> Result<Clients> {
    let credentials = TwitchCredentials::from_env()?;
    let http = Client::builder()
        .build()
        .context("failed to construct OAuth HTTP client")?;
    let auth = TokenCache::new(http, credentials);
    Ok(Clients {
        igdb: Arc::new(IgdbClient::new(IgdbClientConfig::from_env(), auth.clone())?),
        helix: HelixClient::new(TwitchClientConfig::from_env(), auth)?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    env::preflight_check(
        "stream-catalog",
        &["TWITCH_CLIENT_ID", "TWITCH_CLIENT_SECRET"],
        &[
            "TWITCH_CLIENT_ID",
            "TWITCH_CLIENT_SECRET",
            "DATA_DIR",
            "CATALOG_OFFSET_CEILING",
            "CATALOG_CONCURRENCY",
        ],
    )?;

    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();
    let ctx = JobContext::new(TableStore::from_env(), BridgeConfig::from_env(), cancel.clone());
    let clients = build_clients()?;
    info!(data_dir = %ctx.store.root().display(), command = ?cli.command, "starting");

    match cli.command {
        Commands::Games => {
            let (report, outcome) = pipeline::harvest_games(
                &ctx,
                clients.igdb.clone(),
                Some(&clients.helix),
                HarvestConfig::from_env(),
            )
            .await?;
            if !report.complete {
                warn!(
                    failed = outcome.failed_ranges.len(),
                    unharvested = outcome.unharvested_ranges.len(),
                    cancelled = outcome.cancelled,
                    "catalog coverage incomplete; rerun to fill the gaps"
                );
            }
        }
        Commands::Streamers { limit } => {
            pipeline::compile_streamers(&ctx, &clients.helix, clients.igdb.as_ref(), limit).await?;
        }
        Commands::Videos { streamers } => {
            pipeline::add_videos(&ctx, &clients.helix, streamers).await?;
        }
        Commands::Followers { streamers } => {
            pipeline::add_followers(&ctx, &clients.helix, streamers, chrono::Utc::now()).await?;
        }
    }

    if cancel.is_cancelled() {
        warn!("run cancelled; partial results were saved");
    }
    Ok(())
}
