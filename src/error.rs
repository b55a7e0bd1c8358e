//! Unified error types for ironcage

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ironcage operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Settings errors
    #[error("Failed to read settings file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse settings: {0}")]
    SettingsParse(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    // Lookup errors
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Jail '{0}' is not running")]
    NotRunning(String),

    #[error("Multiple jails match '{reference}': {candidates}")]
    Ambiguous {
        reference: String,
        candidates: String,
    },

    // Configuration errors
    #[error("Invalid property '{0}'")]
    InvalidProperty(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration for '{jail}' is corrupt: {message}")]
    CorruptConfiguration { jail: String, message: String },

    // Lifecycle errors
    #[error("Dependency '{dependency}' of '{jail}' failed to start: {source}")]
    DependencyFailure {
        jail: String,
        dependency: String,
        source: Box<Error>,
    },

    #[error("Failed to allocate {resource}: {message}")]
    ResourceAllocation { resource: String, message: String },

    #[error("Command '{command}' failed:\n{output}")]
    ExternalProcess { command: String, output: String },

    #[error("'{command}' timed out after {seconds} seconds")]
    Timeout { command: String, seconds: u64 },

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Jail '{jail}' is locked by another operation")]
    Busy { jail: String },

    #[error("Network configuration failed:\n{}", .0.join("\n"))]
    Network(Vec<String>),

    #[error("{phase}: {source}")]
    Phase { phase: String, source: Box<Error> },

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),
}

/// Coarse error classes callers match on instead of individual variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotRunning,
    InvalidConfiguration,
    CorruptConfiguration,
    DependencyFailure,
    ResourceAllocation,
    ExternalProcess,
    Timeout,
    Interrupted,
    Io,
}

impl Error {
    /// Wrap an error with the lifecycle phase it happened in
    pub fn in_phase(self, phase: &str) -> Self {
        match self {
            // Keep the innermost phase
            e @ Error::Phase { .. } => e,
            e => Error::Phase {
                phase: phase.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// Error class, looking through phase wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ConfigRead { .. } => ErrorKind::Io,
            Error::SettingsParse(_) | Error::Json(_) => ErrorKind::InvalidConfiguration,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotRunning(_) => ErrorKind::NotRunning,
            Error::Ambiguous { .. }
            | Error::InvalidProperty(_)
            | Error::InvalidValue { .. }
            | Error::InvalidConfiguration(_)
            | Error::InvalidVersion(_) => ErrorKind::InvalidConfiguration,
            Error::CorruptConfiguration { .. } => ErrorKind::CorruptConfiguration,
            Error::DependencyFailure { .. } => ErrorKind::DependencyFailure,
            Error::ResourceAllocation { .. } | Error::Network(_) | Error::Busy { .. } => {
                ErrorKind::ResourceAllocation
            }
            Error::ExternalProcess { .. } => ErrorKind::ExternalProcess,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Phase { source, .. } => source.kind(),
        }
    }

    /// Shorthand for an invalid property value
    pub fn invalid_value(key: &str, message: impl Into<String>) -> Self {
        Error::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a resource allocation failure
    pub fn allocation(resource: &str, message: impl Into<String>) -> Self {
        Error::ResourceAllocation {
            resource: resource.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for ironcage operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_keeps_kind() {
        let err = Error::ExternalProcess {
            command: "ifconfig epair create".into(),
            output: "ifconfig: SIOCIFCREATE2: File exists".into(),
        }
        .in_phase("network");

        assert_eq!(err.kind(), ErrorKind::ExternalProcess);
        let msg = err.to_string();
        assert!(msg.starts_with("network: "));
        assert!(msg.contains("SIOCIFCREATE2"));
    }

    #[test]
    fn test_innermost_phase_wins() {
        let err = Error::Interrupted.in_phase("devfs").in_phase("start");
        assert!(err.to_string().starts_with("devfs: "));
    }

    #[test]
    fn test_network_error_lists_failures() {
        let err = Error::Network(vec!["vnet0: no bridge".into(), "vnet1: busy".into()]);
        let msg = err.to_string();
        assert!(msg.contains("vnet0: no bridge"));
        assert!(msg.contains("vnet1: busy"));
        assert_eq!(err.kind(), ErrorKind::ResourceAllocation);
    }
}
