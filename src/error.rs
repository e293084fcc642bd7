//! Unified error types for netloom

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for netloom operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Project errors
    #[error("Failed to open project archive '{path}': {source}")]
    ArchiveRead {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    #[error("Archive operation failed: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Project '{0}' does not contain a topology file")]
    TopologyFileMissing(PathBuf),

    // Topology errors
    #[error("Failed to parse topology: {0}")]
    TopologyParse(String),

    #[error("Topology validation failed:\n{0}")]
    Validation(crate::check::CheckReport),

    // Entity lookup errors
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("{node}: interface {index} does not exist")]
    InterfaceNotFound { node: String, index: usize },

    // Lifecycle errors
    #[error("Node '{node}' is {found}, operation requires {expected}")]
    State {
        node: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid lifecycle transition for '{0}': {1}")]
    Lifecycle(String, String),

    // External command errors
    #[error("Command '{command}' failed: {message}")]
    Resource { command: String, message: String },

    // Privileged daemon errors
    #[error("Unable to connect to daemon: {0}")]
    DaemonUnreachable(io::Error),

    #[error("Daemon returns an error: {0}")]
    Daemon(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Method '{0}' not found")]
    MethodNotFound(String),

    #[error("Wrong number of arguments for {0}")]
    WrongArgCount(String),

    // Cooperative cancellation
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Build a resource error from a failed external command
    pub fn resource(command: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Resource {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for netloom operations
pub type Result<T> = std::result::Result<T, Error>;
