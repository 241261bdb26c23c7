use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker {op} failed: {message}")]
    Docker { op: &'static str, message: String },
    #[error("failed to run {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid docker output for {op}: {source}")]
    Decode {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("no image available for {0}")]
    ImageUnavailable(String),
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("invalid memory limit '{0}'")]
    InvalidMemory(String),
    #[error("invalid docker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("metadata lookup failed: {0}")]
    Metadata(String),
}
