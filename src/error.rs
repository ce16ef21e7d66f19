//! Error types for GPU scene construction.
//!
//! Only construction and configuration paths return these. The per-frame
//! upload path logs and degrades instead of propagating.

use thiserror::Error;

/// Errors raised while configuring or building a [`crate::scene::GpuScene`].
#[derive(Error, Debug)]
pub enum GpuSceneError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No render device was available at initialization.
    #[error("no render device available, GPU scene stays uninitialized")]
    MissingDevice,

    /// A component registration cannot be laid out on the GPU.
    #[error("component `{name}` cannot be registered: {reason}")]
    InvalidComponent { name: String, reason: String },

    /// Two registrations claimed the same SoA slot.
    #[error("SoA slot {0} is registered twice")]
    DuplicateSlot(u32),

    /// A buffer would exceed what 32-bit upload descriptors can address.
    #[error("requested {requested} bytes, limit is {limit}")]
    CapacityExceeded { requested: u64, limit: u64 },

    /// The device refused to allocate a buffer.
    #[error("failed to create buffer `{label}` of {size} bytes")]
    BufferCreation { label: String, size: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
