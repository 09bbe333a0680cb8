//! Abstraction over the durable store that is the system of record for telemetry.
use thiserror::Error;

use crate::record::{DetectionEvent, Reading};

/// Errors raised while talking to the durable store.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("TLS enabled but no TLS parameters specified")]
    MissingTlsParameters,

    #[error("TLS setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("Could not establish database connection: {0}")]
    Connect(String),

    #[error("Database statement failed: {0}")]
    Statement(String),
}

/// A store that hands out one fresh session per call.
///
/// Connections are never pooled or reused across calls.
pub trait DurableSink {
    type Session: SinkSession;

    /// Opens a connection and starts a transaction on it.
    fn open(&mut self) -> Result<Self::Session, SinkError>;
}

/// A single connection with an open transaction.
///
/// A failed insert only discards itself, inserts that succeeded before it can still be
/// committed. Dropping the session without calling `commit` discards all of its work.
pub trait SinkSession {
    fn insert_reading(&mut self, reading: &Reading) -> Result<(), SinkError>;

    fn insert_detection(&mut self, event: &DetectionEvent) -> Result<(), SinkError>;

    /// Commits the transaction and closes the connection.
    fn commit(self) -> Result<(), SinkError>;

    /// Rolls the transaction back and closes the connection.
    fn rollback(self) -> Result<(), SinkError>;
}
