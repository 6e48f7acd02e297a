mod commands;
mod setup;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kubeforge")]
#[command(about = "Provision Kubernetes clusters on cloud providers", long_about = None)]
struct Cli {
    /// Config file (defaults to the usual search locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run task workers and the node observer until Ctrl-C
    Run {
        /// Exit once no task is queued or running
        #[arg(long)]
        drain: bool,
    },
    /// Inspect and enqueue tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List queued, running and failed tasks
    List,
    /// Show one task
    Show {
        /// Task id
        id: String,
    },
    /// Enqueue a task
    Enqueue {
        /// Task type (e.g. CreateKube)
        task_type: String,
        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("kubeforge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (config, config_path) = setup::load_config(cli.config.as_deref())?;
    match &config_path {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }

    let engine = setup::build_engine(&config).await?;

    match cli.command {
        Commands::Run { drain } => commands::run::handle(engine, &config, drain).await?,
        Commands::Tasks { command } => match command {
            TaskCommands::List => commands::tasks::list(&engine).await?,
            TaskCommands::Show { id } => commands::tasks::show(&engine, &id).await?,
            TaskCommands::Enqueue { task_type, payload } => {
                commands::tasks::enqueue(&engine, &task_type, &payload).await?
            }
        },
        Commands::Version => {}
    }

    Ok(())
}

/// Print an error line the way every command reports failures
pub(crate) fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}
