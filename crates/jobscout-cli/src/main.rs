use anyhow::Result;
use clap::{Parser, Subcommand};
use jobscout_sync::RunOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "Scrape, score and rank job listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new listings, score the unscored ones and rebuild the dashboard.
    Run {
        /// Score every listing again, replacing existing analyses.
        #[arg(long)]
        rescore: bool,
    },
    /// Rebuild the dashboard from the saved store without any network call.
    Render {
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=10))]
        threshold: Option<u8>,
    },
    /// Print store counts.
    Stats,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobscout_sync=debug,jobscout_adapters=debug,jobscout_scoring=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { rescore: false }) {
        Commands::Run { rescore } => {
            let summary = jobscout_sync::run_once_from_env(RunOptions { rescore }).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if let Some(reason) = &summary.scoring_halted {
                tracing::warn!(%reason, "scoring stopped early; unscored listings will be retried next run");
            }
        }
        Commands::Render { threshold } => {
            let (path, stats) = jobscout_sync::render_from_env(threshold).await?;
            println!(
                "dashboard written to {}: {} relevant of {} listings",
                path.display(),
                stats.relevant,
                stats.total
            );
        }
        Commands::Stats => {
            let (path, stats) = jobscout_sync::store_stats_from_env().await?;
            println!("store: {}", path.display());
            println!("listings:  {}", stats.total);
            println!("relevant:  {}", stats.relevant);
            println!("excellent: {}", stats.excellent);
            println!("unscored:  {}", stats.unscored);
        }
    }

    Ok(())
}
