//! Trellis CLI - manage node workspaces and their archives.
//!
//! # Usage
//!
//! ```bash
//! # Create an empty workspace archive
//! trellis init demo.trellis --name "Demo"
//!
//! # Add nodes and connect them
//! trellis node add demo.trellis api --framework fastapi --kind backend
//! trellis node add demo.trellis web --framework react --kind frontend
//! trellis connect demo.trellis web api
//!
//! # Look inside without extracting
//! trellis inspect demo.trellis
//!
//! # Pick up edits made directly in the project directories
//! trellis sync demo.trellis
//!
//! # Recreate every project directory from the archive
//! trellis restore demo.trellis
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use trellis_cli::{commands, output, OutputFormat};
use trellis_core::{Framework, NodeKind, TrellisConfig};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis - Node graph workspaces with per-node projects", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (human, json, plain)
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatArg {
    Human,
    Json,
    Plain,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Plain => OutputFormat::Plain,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty workspace archive
    Init {
        /// Archive path; the configured extension is added when missing
        archive: PathBuf,

        /// Workspace name
        #[arg(short, long)]
        name: Option<String>,

        /// Overwrite an existing archive
        #[arg(short, long)]
        force: bool,
    },

    /// Node management
    #[command(subcommand)]
    Node(NodeCommands),

    /// Connect one node to another
    Connect {
        /// Archive path
        archive: PathBuf,
        /// Source node (name or id)
        from: String,
        /// Target node (name or id)
        to: String,
    },

    /// Remove a connection between two nodes
    Disconnect {
        /// Archive path
        archive: PathBuf,
        /// Source node (name or id)
        from: String,
        /// Target node (name or id)
        to: String,
    },

    /// Summarize an archive without extracting it
    Inspect {
        /// Archive path
        archive: PathBuf,
    },

    /// Read edits made in project directories back into the archive
    Sync {
        /// Archive path
        archive: PathBuf,
    },

    /// Recreate every node's project directory from an archive, overwriting
    /// what is on disk
    Restore {
        /// Archive path
        archive: PathBuf,
    },

    /// List supported frameworks
    Frameworks,

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Add a node
    Add {
        /// Archive path
        archive: PathBuf,

        /// Node name
        name: String,

        /// Framework tag (see `trellis frameworks`)
        #[arg(short, long)]
        framework: Framework,

        /// Node kind
        #[arg(short, long, default_value = "custom")]
        kind: NodeKind,

        /// Canvas x position
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        x: f64,

        /// Canvas y position
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        y: f64,
    },

    /// Remove a node (its project directory is kept)
    Remove {
        /// Archive path
        archive: PathBuf,
        /// Node name or id
        node: String,
    },

    /// List nodes
    List {
        /// Archive path
        archive: PathBuf,
    },

    /// Show node details
    Show {
        /// Archive path
        archive: PathBuf,
        /// Node name or id
        node: String,
    },

    /// Open a node's project directory in the file browser
    Open {
        /// Archive path
        archive: PathBuf,
        /// Node name or id
        node: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::error(format!("{:#}", e));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrellisConfig::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TrellisConfig::load_or_default()
            .await
            .context("Failed to load configuration")?,
    };

    init_logging(cli.verbose, &config.general.log_level);

    let format = OutputFormat::from(cli.format);

    match cli.command {
        Commands::Init {
            archive,
            name,
            force,
        } => {
            commands::init_workspace(&config, archive, name, force, format).await?;
        }

        Commands::Node(node_cmd) => match node_cmd {
            NodeCommands::Add {
                archive,
                name,
                framework,
                kind,
                x,
                y,
            } => {
                commands::node_add(&config, archive, name, framework, kind, x, y, format).await?;
            }
            NodeCommands::Remove { archive, node } => {
                commands::node_remove(&config, archive, node, format).await?;
            }
            NodeCommands::List { archive } => {
                commands::node_list(&config, archive, format).await?;
            }
            NodeCommands::Show { archive, node } => {
                commands::node_show(&config, archive, node, format).await?;
            }
            NodeCommands::Open { archive, node } => {
                commands::node_open(&config, archive, node).await?;
            }
        },

        Commands::Connect { archive, from, to } => {
            commands::connect(&config, archive, from, to, format).await?;
        }

        Commands::Disconnect { archive, from, to } => {
            commands::disconnect(&config, archive, from, to, format).await?;
        }

        Commands::Inspect { archive } => {
            commands::inspect(&config, archive, format).await?;
        }

        Commands::Sync { archive } => {
            commands::sync(&config, archive, format).await?;
        }

        Commands::Restore { archive } => {
            commands::restore(&config, archive, format).await?;
        }

        Commands::Frameworks => {
            commands::frameworks(format)?;
        }

        Commands::Config(ConfigCommands::Show) => {
            commands::config_show(&config, format)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("trellis=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("trellis={},warn", level)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
