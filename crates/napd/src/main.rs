//! napd — the napgrid daemon.
//!
//! Single binary that fronts a set of scale-to-zero functions:
//! - Function proxy (sync, async, wake)
//! - Async dispatcher
//! - Autoscaler (leader only)
//! - Leadership, topology, and activity synchronization
//!
//! # Usage
//!
//! ```text
//! napd serve --config napgrid.toml --port 8080 --data-dir /var/lib/napgrid
//! ```

mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use napgrid_core::NapConfig;

const DEFAULT_FILTER: &str = "info,napd=debug,napgrid=debug";

#[derive(Parser)]
#[command(name = "napd", about = "napgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the function proxy and run the control loops.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Path to napgrid.toml. Defaults apply when the file is missing.
    #[arg(long, env = "NAPGRID_CONFIG", default_value = "napgrid.toml")]
    config: PathBuf,

    /// Port to listen on.
    #[arg(long, env = "NAPGRID_PORT", default_value = "8080")]
    port: u16,

    /// Directory for the state database; overrides `[store] path`.
    #[arg(long, env = "NAPGRID_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Namespace of the fronted functions; overrides the config file.
    #[arg(long, env = "NAPGRID_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl ServeArgs {
    fn load_config(&self) -> anyhow::Result<NapConfig> {
        let mut config = NapConfig::load_or_default(Some(self.config.as_path()))?;
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.store.path = Some(data_dir.join("napgrid.redb"));
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            init_tracing(args.log_format);
            let config = args.load_config()?;
            serve::run(config, args.port).await
        }
    }
}
