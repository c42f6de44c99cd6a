//! Test harness for strata-gpu.
//!
//! Provides a headless GPU manager and readback helpers for tests that need a
//! real device.

pub mod harness;

pub use harness::{init_test_logging, HeadlessGpu};

use strata_gpu::GpuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Readback mismatch: {0}")]
    Mismatch(String),
}

pub type Result<T> = std::result::Result<T, TestError>;
