use anyhow::Result;
use clap::{Parser, Subcommand};
use slipway::logging::{LogFormat, LoggingOptions};
use slipway_common::{ArtifactType, ImageStatus, Workflow};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "slipway")]
#[command(version, about = "Build-and-deploy worker: clone, test, build, persist and ship applications")]
pub struct Cli {
    /// Path to slipway.toml (otherwise SLIPWAY_CONFIG, ./slipway.toml, then the user config dir)
    #[arg(long, global = true, env = "SLIPWAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Process log format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_file_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build pipeline for one Assembly from a JSON job file
    Run {
        #[arg(long)]
        job: PathBuf,
    },
    /// Build a language pack image from a repository's Dockerfile
    BuildLp {
        #[arg(long)]
        image_id: i64,
        /// Git URL of the language pack repository
        #[arg(long)]
        source: String,
        /// Commit SHA or branch (default branch when omitted)
        #[arg(long, default_value = "")]
        revision: String,
    },
    /// Deploy a stored artifact for an Assembly
    Deploy {
        #[arg(long)]
        assembly_id: i64,
        /// Blob object name of the artifact (swift backend)
        #[arg(long)]
        location: Option<String>,
        /// Artifact name, `<app>-<timestamp>-<sha>`
        #[arg(long)]
        image_name: String,
        /// Port the application listens on (repeatable)
        #[arg(long = "port")]
        ports: Vec<u16>,
    },
    /// Delete an Assembly's stack, artifact, logs and records
    Destroy {
        #[arg(long)]
        assembly_id: i64,
    },
    /// Manage the metadata database
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum DbCommands {
    /// Create the database and its tables
    Init,
    /// Insert an Assembly in QUEUED state
    AddAssembly {
        #[arg(long)]
        name: String,
        #[arg(long)]
        plan_id: i64,
        /// Comma-separated stages, e.g. `unittest,build,deploy`
        #[arg(long, default_value = "unittest,build,deploy")]
        workflow: Workflow,
        #[arg(long, default_value = "default")]
        tenant: String,
    },
    /// Insert an Image row (language packs are usually added this way)
    AddImage {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "language_pack")]
        artifact_type: ArtifactType,
        #[arg(long, default_value = "QUEUED")]
        status: ImageStatus,
        #[arg(long)]
        external_ref: Option<String>,
        #[arg(long)]
        docker_image_name: Option<String>,
        #[arg(long, default_value = "default")]
        tenant: String,
    },
    /// Print an Assembly with its components and logs
    ShowAssembly { id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default slipway.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = slipway::logging::init_tracing(&LoggingOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        file_dir: cli.log_file_dir.clone(),
    })?;

    let succeeded = match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(cli.config.as_deref(), command.clone())?;
            true
        }
        command => {
            let config = slipway::config::Config::load(cli.config.as_deref())?;
            if let Some(source) = &config.source {
                tracing::debug!(path = %source.display(), "loaded configuration");
            }
            match command {
                Commands::Run { job } => cmd::cmd_run(&config, job).await?,
                Commands::BuildLp {
                    image_id,
                    source,
                    revision,
                } => cmd::cmd_build_lp(&config, *image_id, source, revision).await?,
                Commands::Deploy {
                    assembly_id,
                    location,
                    image_name,
                    ports,
                } => {
                    cmd::cmd_deploy(&config, *assembly_id, location.clone(), image_name, ports)
                        .await?
                }
                Commands::Destroy { assembly_id } => cmd::cmd_destroy(&config, *assembly_id).await?,
                Commands::Db { command } => {
                    cmd::cmd_db(&config, command.clone()).await?;
                    true
                }
                Commands::Config { .. } => true,
            }
        }
    };

    if !succeeded {
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}
