use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the detection engine and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// A call to the remote torrent client failed or timed out.
    #[error("transport error ({server}): {message}")]
    Transport { server: String, message: String },

    /// A filter value or persisted field could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The ban state file could not be read or written.
    #[error("persistence error ({}): {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    /// A rule or criterion is structurally invalid.
    #[error("configuration error in rule '{rule}': {message}")]
    Configuration { rule: String, message: String },
}

impl Error {
    pub fn transport(server: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.to_string(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn configuration(rule: impl Into<String>, message: impl ToString) -> Self {
        Self::Configuration {
            rule: rule.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
