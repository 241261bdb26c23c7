use std::path::PathBuf;

use galaxy_vmap::VmapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid records for app '{app}': {source}")]
    Records {
        app: String,
        #[source]
        source: VmapError,
    },
    #[error("cannot merge config for '{theirs}' into '{ours}'")]
    NameMismatch { ours: String, theirs: String },
}
