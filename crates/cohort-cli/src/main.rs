//! cohort CLI
//!
//! Command-line interface for running experiments locally and for querying
//! a running cohort daemon.

mod commands;

use clap::{Args, Parser, Subcommand};
use cohort_core::{JobMemory, RunConfig};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// cohort - runs replicated training jobs across local GPUs
#[derive(Parser, Debug)]
#[command(name = "cohort")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Run configuration and the flags that override it
#[derive(Args, Debug)]
struct RunArgs {
    /// Run configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override the number of replicates per condition
    #[arg(long)]
    replicates: Option<u32>,

    /// Only run these conditions
    #[arg(long, value_delimiter = ',')]
    conditions: Option<Vec<String>>,

    /// Override the per-job memory ("auto" or GiB)
    #[arg(long)]
    job_memory: Option<JobMemory>,

    /// Override the memory buffer multiplier
    #[arg(long)]
    buffer: Option<f64>,

    /// Restrict the run to these devices
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<u32>>,

    /// Override the first worker port
    #[arg(long)]
    base_port: Option<u16>,
}

impl RunArgs {
    fn load(&self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::from_file(&self.config)?;
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(replicates) = self.replicates {
            config.replicates = replicates;
        }
        if let Some(conditions) = &self.conditions {
            config.conditions.selected = Some(conditions.clone());
        }
        if let Some(memory) = self.job_memory {
            config.resources.job_memory = memory;
        }
        if let Some(buffer) = self.buffer {
            config.resources.buffer = buffer;
        }
        if let Some(devices) = &self.devices {
            config.resources.devices = Some(devices.clone());
        }
        if let Some(port) = self.base_port {
            config.launch.base_port = port;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every job of an experiment on this machine
    Run {
        #[command(flatten)]
        run: RunArgs,

        /// Wait for every job before printing the job sheet
        #[arg(long)]
        synchronous: bool,
    },

    /// Show the schedule a run would get, without starting jobs
    Plan {
        #[command(flatten)]
        run: RunArgs,

        /// Plan against N idle simulated GPUs instead of the real ones
        #[arg(long)]
        simulate: Option<u32>,

        /// Memory of each simulated GPU, in GiB
        #[arg(long, default_value_t = 16.0)]
        simulate_gib: f64,
    },

    /// Show local GPU memory
    Gpus,

    /// Show the status of the daemon's run
    Status,

    /// List the daemon's jobs
    Jobs {
        /// Job index (shows all if not provided)
        index: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if matches!(cli.command, Commands::Run { .. } | Commands::Plan { .. }) {
        Level::INFO
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Run { run, synchronous } => {
            let mut config = run.load()?;
            config.launch.synchronous |= synchronous;
            commands::run(config).await?;
        }
        Commands::Plan {
            run,
            simulate,
            simulate_gib,
        } => {
            commands::plan(run.load()?, simulate, simulate_gib).await?;
        }
        Commands::Gpus => {
            commands::gpus()?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
        Commands::Jobs { index } => {
            commands::jobs(&client, index).await?;
        }
    }

    Ok(())
}
