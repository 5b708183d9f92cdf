//! cohort-api: REST status API for cohort
//!
//! This crate serves the live state of a launched run:
//! - Per-job status rows
//! - Run summary counts
//! - Device memory

pub mod rest;

pub use rest::{create_router, AppState, StatusResponse};
