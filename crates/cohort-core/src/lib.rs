//! cohort-core: Core types and traits for the cohort experiment runner
//!
//! This crate provides the fundamental types used throughout cohort:
//! - Tasks, jobs and their on-disk layout
//! - Run configuration and immutable run settings
//! - Error handling
//! - GPU device discovery and memory queries

pub mod config;
pub mod error;
pub mod gpu;
pub mod model;
pub mod task;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use model::*;
pub use task::*;
