//! cohort-runtime: Worker execution layer
//!
//! This crate runs jobs to completion:
//! - Process-based runtime launching one OS process per job
//! - The `Runtime` trait the launcher and memory estimator drive

pub mod process;
pub mod traits;

pub use process::{ProcessRuntime, ProcessRuntimeConfig};
pub use traits::{JobReport, Runtime};
