//! cohort daemon
//!
//! Launches one run from a configuration file and serves its status API
//! while the jobs execute.

use anyhow::Context;
use clap::Parser;
use cohort_api::{create_router, AppState};
use cohort_core::{DeviceDriver, JobMemory, LoggingConfig, NvmlDriver, RunConfig};
use cohort_runtime::{ProcessRuntime, ProcessRuntimeConfig};
use cohort_scheduler::Experiment;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// cohort daemon - runs replicated training jobs across local GPUs
#[derive(Parser, Debug)]
#[command(name = "cohortd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Run configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override the number of replicates per condition
    #[arg(long)]
    replicates: Option<u32>,

    /// Override the per-job memory ("auto" or GiB)
    #[arg(long)]
    job_memory: Option<JobMemory>,

    /// Restrict the run to these devices
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<u32>>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Keep serving the status API after the last job finishes
    #[arg(long)]
    keep_serving: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(replicates) = self.replicates {
            config.replicates = replicates;
        }
        if let Some(memory) = self.job_memory {
            config.resources.job_memory = memory;
        }
        if let Some(devices) = &self.devices {
            config.resources.devices = Some(devices.clone());
        }
        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        // The API is served while jobs run
        config.launch.synchronous = false;
        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);
    match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        _ => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.logging)?;

    info!("Starting cohort daemon v{}", env!("CARGO_PKG_VERSION"));

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;
    let output_dir = config.output_dir.clone();

    let driver: Arc<dyn DeviceDriver> = Arc::new(NvmlDriver::new()?);
    let runtime = Arc::new(ProcessRuntime::new(ProcessRuntimeConfig::from_worker(
        &config.worker,
        config.launch.verbose,
    )));

    let sheet = Experiment::run(config, driver.clone(), runtime).await?;
    let run_id = sheet.run_id();
    info!(run_id = %run_id, "Run launched");

    let router = create_router(AppState {
        run_id,
        output_dir,
        board: sheet.board(),
        driver,
    });

    let finished = async move {
        match sheet.wait().await {
            Ok(summary) if summary.failed > 0 => warn!(
                completed = summary.completed,
                failed = summary.failed,
                "Run finished with failed jobs"
            ),
            Ok(summary) => info!(completed = summary.completed, "Run finished"),
            Err(e) => error!(error = %e, "Run aborted"),
        }
    };

    info!("API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    if args.keep_serving {
        tokio::spawn(finished);
        axum::serve(listener, router).await?;
    } else {
        axum::serve(listener, router)
            .with_graceful_shutdown(finished)
            .await?;
    }

    Ok(())
}
