//! CLI commands implementation

use anyhow::Result;
use cohort_core::{
    detect_gpus, DeviceDriver, GpuInfo, JobView, NvmlDriver, RunConfig, StaticDriver,
};
use cohort_runtime::{ProcessRuntime, ProcessRuntimeConfig};
use cohort_scheduler::{Experiment, RunSummary};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub run_id: Uuid,
    pub output_dir: PathBuf,
    pub finished: bool,
    pub summary: RunSummary,
    pub gpus: GpuInfo,
}

/// Run an experiment and wait for its jobs
pub async fn run(config: RunConfig) -> Result<()> {
    let driver: Arc<dyn DeviceDriver> = Arc::new(NvmlDriver::new()?);
    let runtime = Arc::new(ProcessRuntime::new(ProcessRuntimeConfig::from_worker(
        &config.worker,
        config.launch.verbose,
    )));
    let synchronous = config.launch.synchronous;

    let sheet = Experiment::run(config, driver, runtime).await?;
    if !synchronous {
        println!("Run {} launched", sheet.run_id());
        print_jobs(&sheet.views().await);
        println!();
    }

    let board = sheet.board();
    let summary = sheet.wait().await?;
    if synchronous {
        print_jobs(&board.views().await);
        println!();
    }
    print_summary(&summary);

    if summary.failed > 0 {
        anyhow::bail!("{} of {} jobs failed", summary.failed, summary.total);
    }
    Ok(())
}

/// Print the schedule of a run without launching it
pub async fn plan(config: RunConfig, simulate: Option<u32>, simulate_gib: f64) -> Result<()> {
    let driver: Arc<dyn DeviceDriver> = match simulate {
        Some(count) => Arc::new(StaticDriver::uniform(count, (simulate_gib * GIB) as u64)),
        None => Arc::new(NvmlDriver::new()?),
    };
    let runtime = Arc::new(ProcessRuntime::new(ProcessRuntimeConfig::from_worker(
        &config.worker,
        config.launch.verbose,
    )));

    let plan = Experiment::new(config, driver, runtime).plan().await?;

    println!("Run {}", plan.run_id);
    println!(
        "Devices: {:?}, {:.2} GiB reserved per job",
        plan.devices,
        plan.budget as f64 / GIB
    );
    println!();
    let jobs: Vec<JobView> = plan.ready.into_iter().chain(plan.waitlist).collect();
    print_jobs(&jobs);
    Ok(())
}

/// Show local GPU information
pub fn gpus() -> Result<()> {
    let gpu_info = detect_gpus();

    println!("GPUs: {} total", gpu_info.total_count);
    if !gpu_info.devices.is_empty() {
        println!();
        for device in gpu_info.devices {
            println!(
                "[{}] {} - {:.1}/{:.1} GiB free",
                device.index,
                device.name,
                device.memory_free as f64 / GIB,
                device.memory_total as f64 / GIB
            );
        }
    }

    Ok(())
}

/// Show the daemon's run status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("cohort v{}", status.version);
        println!();
        println!("Run: {}", status.run_id);
        println!("Output: {}", status.output_dir.display());
        println!(
            "State: {}",
            if status.finished { "finished" } else { "running" }
        );
        print_summary(&status.summary);
        println!("GPUs: {} total", status.gpus.total_count);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

/// List the daemon's jobs, or show one
pub async fn jobs(client: &ApiClient, index: Option<u32>) -> Result<()> {
    let path = match index {
        Some(index) => format!("/api/v1/jobs/{}", index),
        None => "/api/v1/jobs".to_string(),
    };
    let response = client.client.get(client.url(&path)).send().await?;

    if !response.status().is_success() {
        let error = response.text().await?;
        eprintln!("Failed to get jobs: {}", error);
        return Ok(());
    }

    match index {
        Some(_) => {
            let job: JobView = response.json().await?;
            print_job_details(&job);
        }
        None => {
            let jobs: Vec<JobView> = response.json().await?;
            if jobs.is_empty() {
                println!("No jobs found");
            } else {
                print_jobs(&jobs);
            }
        }
    }

    Ok(())
}

fn device_label(job: &JobView) -> String {
    if job.device < 0 {
        "-".to_string()
    } else {
        job.device.to_string()
    }
}

fn port_label(job: &JobView) -> String {
    if job.port < 0 {
        "-".to_string()
    } else {
        job.port.to_string()
    }
}

/// Helper to print the job table
fn print_jobs(jobs: &[JobView]) {
    println!(
        "{:<6} {:<24} {:<10} {:<8} {:<8} {:<11}",
        "INDEX", "CONDITION", "REPLICATE", "DEVICE", "PORT", "STATUS"
    );
    println!("{}", "-".repeat(72));
    for job in jobs {
        println!(
            "{:<6} {:<24} {:<10} {:<8} {:<8} {:<11}",
            job.index,
            job.condition,
            job.replicate_id,
            device_label(job),
            port_label(job),
            job.status.to_string()
        );
    }
}

/// Helper to print job details
fn print_job_details(job: &JobView) {
    println!("Job {}: {} #{}", job.index, job.condition, job.replicate_id);
    println!("  Status: {}", job.status);
    println!("  Device: {}", device_label(job));
    println!("  Port: {}", port_label(job));
    println!("  Directory: {}", job.job_dir.display());
    if let Some(started) = job.started_at {
        println!("  Started: {}", started);
    }
    if let Some(finished) = job.finished_at {
        println!("  Finished: {}", finished);
    }
    if let Some(error) = &job.error {
        println!("  Error: {}", error);
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Jobs: {} total, {} running, {} waitlisted, {} completed, {} failed",
        summary.total, summary.running, summary.waitlisted, summary.completed, summary.failed
    );
}
