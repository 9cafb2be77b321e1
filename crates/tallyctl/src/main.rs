//! tallyctl: operate on a tally data directory from the command line.
//!
//! ```text
//! tallyctl collect --data-dir ./data --registry metrics.toml --ping metrics --pretty
//! tallyctl dump --data-dir ./data --scope user
//! tallyctl wipe --data-dir ./data
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tally_core::Lifetime;

mod commands;

#[derive(Parser)]
#[command(
    name = "tallyctl",
    about = "Collect pings and inspect tally metric state",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the pending payload for one ping and print it as JSON.
    ///
    /// Ping-lifetime values are cleared unless --peek is given.
    Collect {
        /// tally.toml with engine settings
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Data directory (overrides data_dir from the config file)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Metric registry TOML file
        #[arg(short, long)]
        registry: PathBuf,
        #[arg(short, long, default_value = "metrics")]
        ping: String,
        /// Read without clearing anything
        #[arg(long)]
        peek: bool,
        #[arg(long)]
        pretty: bool,
    },
    /// Print stored records, one JSON object per line.
    Dump {
        #[arg(short, long)]
        data_dir: PathBuf,
        /// Only this lifetime scope
        #[arg(short, long)]
        scope: Option<Scope>,
    },
    /// Delete stored records.
    Wipe {
        #[arg(short, long)]
        data_dir: PathBuf,
        /// Only this lifetime scope (default: all of them)
        #[arg(short, long)]
        scope: Option<Scope>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scope {
    Ping,
    Application,
    User,
}

impl From<Scope> for Lifetime {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Ping => Lifetime::Ping,
            Scope::Application => Lifetime::Application,
            Scope::User => Lifetime::User,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tally=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            config,
            data_dir,
            registry,
            ping,
            peek,
            pretty,
        } => {
            let config = commands::config::load(config.as_deref(), data_dir)?;
            commands::collect::collect(config, &registry, &ping, peek, pretty)
        }
        Commands::Dump { data_dir, scope } => {
            commands::store::dump(&data_dir, scope.map(Lifetime::from))
        }
        Commands::Wipe { data_dir, scope } => {
            commands::store::wipe(&data_dir, scope.map(Lifetime::from))
        }
        Commands::Config { config } => {
            let config = commands::config::load(config.as_deref(), None)?;
            commands::config::print(&config)
        }
    }
}
