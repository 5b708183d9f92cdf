//! cohort-scheduler: GPU-aware scheduling and launch for cohort
//!
//! This crate turns a run configuration into running jobs:
//! - Per-job memory estimation through a probe job
//! - Device memory accounting and placement
//! - Job dispatch with completion-driven waitlist promotion
//! - Live job status for callers

pub mod estimator;
pub mod experiment;
pub mod launcher;
pub mod ledger;
pub mod placement;
pub mod scheduler;
pub mod sheet;

pub use estimator::MemoryEstimator;
pub use experiment::{Experiment, RunPlan};
pub use launcher::{LaunchOptions, Launcher};
pub use ledger::DeviceLedger;
pub use placement::{rotation_for, DeviceRotation};
pub use scheduler::{SchedulePlan, Scheduler};
pub use sheet::{JobSheet, RunSummary, StatusBoard};
