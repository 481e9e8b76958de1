//! tokenloom CLI — the main entry point.
//!
//! Commands:
//! - `render`  — Render a declared tree file against a budget
//! - `config`  — Print the default config, or validate the current one

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "tokenloom",
    about = "tokenloom — fit weighted prompt trees into a token budget",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a tree declared in a JSON or TOML file
    Render {
        /// Path to the tree declaration
        #[arg(short, long)]
        tree: PathBuf,

        /// Override the budget (defaults to `default_budget` from config)
        #[arg(short, long, env = "TOKENLOOM_BUDGET")]
        budget: Option<u64>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Use this config file instead of ~/.tokenloom/config.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show or validate configuration
    Config {
        /// Validate the active config instead of printing defaults
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Render {
            tree,
            budget,
            json,
            config,
        } => {
            commands::render::run(commands::render::RenderArgs {
                tree,
                budget,
                json,
                config,
            })
            .await?
        }
        Commands::Config { validate } => {
            if validate {
                commands::config_cmd::validate()?
            } else {
                commands::config_cmd::show()
            }
        }
    }

    Ok(())
}
