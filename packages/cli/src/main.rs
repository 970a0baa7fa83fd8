// ABOUTME: Boxyard command-line entry point
// ABOUTME: `serve` runs the API with workers and reconciler; `migrate` only applies database migrations

use boxyard_cli::config::AppConfig;
use clap::{Parser, Subcommand};
use std::process;

#[derive(Parser)]
#[command(name = "boxyard")]
#[command(about = "Boxyard - provision and supervise agent boxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server, deployment workers and health reconciler
    Serve {
        /// Listen port (overrides BOXYARD_API_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Disable the periodic health reconciliation loop
        #[arg(long)]
        no_reconcile: bool,
    },
    /// Create the database if needed and apply pending migrations
    Migrate,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    if let Err(e) = handle_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = AppConfig::from_env()?;

    match command {
        Commands::Serve { port, no_reconcile } => {
            if let Some(port) = port {
                config.port = port;
            }
            if no_reconcile {
                config.reconcile_enabled = false;
            }
            boxyard_cli::run_server(config).await
        }
        Commands::Migrate => boxyard_cli::run_migrations(&config).await,
    }
}
