use crate::render::Rid;

/// Failures reported by a [`crate::render::RenderDevice`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),

    #[error("pipeline creation failed: {0}")]
    PipelineCreate(String),

    #[error("invalid texture format: {0}")]
    InvalidFormat(String),

    #[error("unknown or freed handle {0:?}")]
    UnknownHandle(Rid),

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("readback failed: {0}")]
    Readback(String),
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum TerrainError {
    #[error("config io error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("`{operation}` is not valid while the backend is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("missing binding for draw: {0}")]
    MissingBinding(&'static str),

    #[error("surface count mismatch: expected {expected}, got {actual}")]
    SurfaceCountMismatch { expected: usize, actual: usize },

    #[error("debug snapshot failed: {0}")]
    Snapshot(String),
}

impl TerrainError {
    pub fn invalid_config<T: ToString>(msg: T) -> Self {
        TerrainError::InvalidConfig(msg.to_string())
    }
}
