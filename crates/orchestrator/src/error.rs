use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Build failed for API {api_id}: {reason}")]
    Build { api_id: String, reason: String },

    #[error("No free port for API {api_id} (derived port {port})")]
    PortConflict { api_id: String, port: u16 },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact: {0}")]
    Artifact(String),
}

impl From<bollard::errors::Error> for OrchestratorError {
    fn from(err: bollard::errors::Error) -> Self {
        OrchestratorError::Runtime(err.to_string())
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Artifact(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
