use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vidforge::config::AppConfig;

#[derive(Parser)]
#[command(name = "vidforge")]
#[command(version, about = "Human-in-the-loop video generation pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the pipeline server
    Serve {
        /// HTTP listen port (overrides VIDFORGE_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path (overrides VIDFORGE_DB)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Bind on all interfaces and allow any origin
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let default_filter = if cli.verbose { "vidforge=debug,info" } else { "vidforge=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, db, dev } => {
            let mut config = AppConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if dev {
                config.dev_mode = true;
            }
            vidforge::server::start_server(config).await
        }
    }
}
