//! Error types for mserver

use thiserror::Error;

/// Main error type for mserver
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address error: {0}")]
    Address(String),

    #[error("ACL error: {0}")]
    Acl(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Pidfile error: {0}")]
    Pidfile(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mserver
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Address(_) => "ADDRESS_ERROR",
            Error::Acl(_) => "ACL_ERROR",
            Error::Listener(_) => "LISTENER_ERROR",
            Error::Daemon(_) => "DAEMON_ERROR",
            Error::Pidfile(_) => "PIDFILE_ERROR",
            Error::Signal(_) => "SIGNAL_ERROR",
            Error::Spawn(_) => "SPAWN_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
