use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sheetsync_sync::{CatalogDb, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sheetsync-cli")]
#[command(about = "Mirror a remote catalog spreadsheet into the catalog database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the remote artifact and reconcile every change until Ctrl-C.
    Run,
    /// Download once and reconcile if the artifact changed.
    Fetch,
    /// Reconcile the local artifact without downloading.
    Reconcile,
    /// Create the catalog tables and exit.
    Bootstrap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = SyncPipeline::connect(config).await?;
            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; stopping after the current tick");
                    cancel.cancel();
                }
            });
            pipeline.run().await?;
        }
        Commands::Fetch => {
            let pipeline = SyncPipeline::connect(config).await?;
            match pipeline.fetch_once().await? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => println!("artifact unchanged"),
            }
        }
        Commands::Reconcile => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.reconcile_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Bootstrap => {
            let db = CatalogDb::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            db.ensure_schema().await.context("creating catalog schema")?;
            println!("catalog schema ready at {}", config.database_url);
        }
    }

    Ok(())
}
