//! Error type shared by every fallible bridge operation.
//!
//! Creation and compilation failures carry the native diagnostic verbatim.
//! A diagnostic is never empty: [`non_empty_diagnostic`] substitutes a
//! placeholder when the native layer reports nothing.

/// Error type for all bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no Metal GPU device found")]
    DeviceUnavailable,
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("shader compilation failed: {0}")]
    Compilation(String),
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),
    #[error("function '{0}' not found in library")]
    NotFound(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("out of bounds: requested {requested} bytes, buffer holds {available}")]
    OutOfBounds { requested: usize, available: usize },
    #[error("cannot {operation} a command buffer in state {state:?}")]
    InvalidState {
        state: crate::state::CommandBufferState,
        operation: &'static str,
    },
    #[error("failed to create command buffer")]
    CommandBuffer,
    #[error("failed to create compute encoder")]
    Encoder,
    #[error("GPU execution failed: {0}")]
    GpuExecution(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Placeholder used when the native layer fails without a message.
pub const UNKNOWN_DIAGNOSTIC: &str = "no diagnostic reported";

/// Trim a native diagnostic and guarantee it is non-empty.
pub fn non_empty_diagnostic(message: impl Into<String>) -> String {
    let message = message.into();
    let trimmed = message.trim();
    if trimmed.is_empty() {
        UNKNOWN_DIAGNOSTIC.to_string()
    } else {
        trimmed.to_string()
    }
}

impl BridgeError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        BridgeError::ShapeMismatch(message.into())
    }

    /// The diagnostic text callers are expected to surface verbatim.
    pub fn diagnostic(&self) -> String {
        match self {
            BridgeError::Compilation(d)
            | BridgeError::Pipeline(d)
            | BridgeError::GpuExecution(d)
            | BridgeError::Allocation(d) => d.clone(),
            other => other.to_string(),
        }
    }
}
