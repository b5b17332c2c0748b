//! Error types for sealkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or invalid backend configuration. Fatal at construction:
    /// a backend is never returned half-built.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The redirect address could not be resolved into host/port form.
    #[error("invalid redirect address: {0}")]
    AddressResolution(String),

    /// A KV operation against the coordination service failed. Never
    /// retried internally; retry policy belongs to the caller.
    #[error("storage operation failed: {0}")]
    Storage(String),

    /// Service registration or health update was rejected or unreachable.
    #[error("service registration failed: {0}")]
    Registration(String),

    /// Best-effort deregistration during shutdown failed.
    #[error("service deregistration failed: {0}")]
    Deregistration(String),
}

impl Error {
    /// Registration-path errors are swallowed into logs by the
    /// synchronizer; everything else propagates.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Registration(_) | Error::Deregistration(_))
    }
}
