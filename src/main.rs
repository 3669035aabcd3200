use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "flora")]
#[command(
    version,
    about = "Checkpointed phase orchestrator for recursive work-tree pipelines"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the pipeline configuration
    #[arg(short, long, global = true, default_value = "flora.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute the pipeline
    Run {
        /// Dispatch every task to a tool that does nothing and print the task summary
        #[arg(long)]
        dry_run: bool,

        /// Continue after the last completed checkpoint
        #[arg(long)]
        resume: bool,

        /// Maximum concurrently running programs (overrides pipeline.max_parallel)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Write every dispatched task as JSON
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Show how a unit list is grouped and what each group would request
    Plan {
        /// Units as "id:size,id:size,..."
        #[arg(long)]
        units: String,

        /// Phase whose thresholds and job kinds apply
        #[arg(long, default_value = "bar")]
        phase: String,

        /// Estimate the recursion step with the oversize defaults
        #[arg(long)]
        oversize: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// List completed checkpoints
    Checkpoints,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    flora::logging::init_tracing(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Run {
            dry_run,
            resume,
            max_parallel,
            journal,
        } => {
            cmd::cmd_run(
                &cli.config,
                *dry_run,
                *resume,
                *max_parallel,
                journal.as_deref(),
            )
            .await?;
        }
        Commands::Plan {
            units,
            phase,
            oversize,
        } => cmd::cmd_plan(&cli.config, units, phase, *oversize)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
        Commands::Checkpoints => cmd::cmd_checkpoints(&cli.config)?,
    }

    Ok(())
}
