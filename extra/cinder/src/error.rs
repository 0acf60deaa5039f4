//! Runtime errors with stable negative codes.
//!
//! Every device operation surfaces failure as one of these; `code()` is
//! the stable integer contract with non-Rust callers and never changes
//! meaning between releases.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("generic device error: {0}")]
    Generic(String),

    #[error("out of device memory")]
    OutOfMemory,

    #[error("device API call failed: {call} ({result})")]
    Device { call: &'static str, result: i32 },

    #[error("no compute-capable device found")]
    NoDevice,

    #[error("entry point not found: {0}")]
    BadEntryName(String),

    #[error("invalid compiled module: {0}")]
    BadModule(String),

    #[error("buffer size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },
}

impl RuntimeError {
    /// The stable error code surfaced to callers; 0 is success by
    /// convention and never produced here.
    pub fn code(&self) -> i32 {
        match self {
            RuntimeError::Generic(_) => -1,
            RuntimeError::OutOfMemory => -2,
            RuntimeError::Device { .. } => -3,
            RuntimeError::NoDevice => -4,
            RuntimeError::BadEntryName(_) => -5,
            RuntimeError::BadModule(_) => -6,
            RuntimeError::SizeMismatch { .. } => -7,
        }
    }

    pub fn from_vk(call: &'static str, result: ash::vk::Result) -> RuntimeError {
        match result {
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => RuntimeError::OutOfMemory,
            other => RuntimeError::Device {
                call,
                result: other.as_raw(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Map a vk result into our error space, tagging the failing call.
pub trait VkResultExt<T> {
    fn vk(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, ash::vk::Result> {
    fn vk(self, call: &'static str) -> Result<T> {
        self.map_err(|r| RuntimeError::from_vk(call, r))
    }
}
