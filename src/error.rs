use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Typed build failures.
///
/// Most functions in this crate return `anyhow::Result`; these variants are
/// wrapped inside the `anyhow::Error` so callers can `downcast_ref` when they
/// need to distinguish one failure class from another.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A compile step failed for one source file.
    #[error("{tag} {path}: {source}")]
    Command {
        tag: &'static str,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The first failing job of a scheduler run.
    #[error("{description}: {source}")]
    JobFailed {
        description: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache: no source files for {name}")]
    EmptySourceSet { name: String },

    #[error("unknown library: {name}")]
    UnknownLibrary { name: String },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("invalid job graph: {0}")]
    InvalidGraph(String),
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    /// Tag used for compile failures.
    pub const FAILED_TO_BUILD: &'static str = "failed to build";
}
