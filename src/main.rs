use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tigerscope::config::resolve_config_path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tigerscope")]
#[command(about = "Telemetry ingestion into columnar object storage", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion gateway and the batch writer
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect batches already written to object storage
    Batches {
        #[command(subcommand)]
        action: BatchesAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a documented default config
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[derive(Subcommand)]
enum BatchesAction {
    List {
        /// Only keys under this prefix (default: every batch)
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Print the events of one batch as JSON lines
    Show { key: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so `batches show` output stays pipeable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tigerscope=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            tigerscope::cli::run::run(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                tigerscope::cli::config::init(stdout)?;
            }
        },
        Some(Commands::Batches { action }) => match action {
            BatchesAction::List { prefix } => {
                tigerscope::cli::batches::list(config_path.as_deref(), prefix.as_deref()).await?;
            }
            BatchesAction::Show { key } => {
                tigerscope::cli::batches::show(config_path.as_deref(), &key).await?;
            }
        },
    }

    Ok(())
}
