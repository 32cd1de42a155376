use crate::types::MemberAddress;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Closed classification of low-level failures.
///
/// Whether a failed operation should trigger a reconnection is decided from
/// this kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionRefused,
    TimedOut,
    ResetByPeer,
    Other,
}

impl ErrorKind {
    pub fn from_io(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::ResetByPeer,
            _ => ErrorKind::Other,
        }
    }

    /// The failure means the active member can no longer be reached
    pub fn is_connection_loss(self) -> bool {
        !matches!(self, ErrorKind::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::ResetByPeer => "reset_by_peer",
            ErrorKind::Other => "other",
        }
    }
}

impl From<&io::Error> for ErrorKind {
    fn from(err: &io::Error) -> Self {
        ErrorKind::from_io(err.kind())
    }
}

/// Errors raised by the cluster connection layer
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("No database instances found in the cluster")]
    NoMembers,

    #[error("No leader candidate available")]
    NoLeaderCandidate,

    #[error("Connected to {member} but it is read-only (in recovery)")]
    ReadOnlyMember { member: MemberAddress },

    #[error("Failed to connect to {member}: {source}")]
    Connect {
        member: MemberAddress,
        kind: ErrorKind,
        #[source]
        source: BoxError,
    },

    #[error("Failed to connect to the leader after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClusterError>,
    },

    #[error("Query failed: {source}")]
    Query {
        kind: ErrorKind,
        #[source]
        source: BoxError,
    },

    #[error("Database pool not initialized")]
    NotConnected,

    #[error("Cluster manager is shutting down")]
    ShuttingDown,

    #[error("Cluster manager already initialized")]
    AlreadyInitialized,
}

impl ClusterError {
    pub fn config(message: impl Into<String>) -> Self {
        ClusterError::Config {
            message: message.into(),
        }
    }

    pub fn query<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        ClusterError::Query {
            kind,
            source: source.into(),
        }
    }

    pub fn connect<E>(member: MemberAddress, kind: ErrorKind, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        ClusterError::Connect {
            member,
            kind,
            source: source.into(),
        }
    }

    /// Classification used for the reconnect decision
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Connect { kind, .. } | ClusterError::Query { kind, .. } => *kind,
            ClusterError::RetriesExhausted { last, .. } => last.kind(),
            _ => ErrorKind::Other,
        }
    }

    pub fn is_connection_loss(&self) -> bool {
        self.kind().is_connection_loss()
    }
}

impl From<io::Error> for ClusterError {
    fn from(err: io::Error) -> Self {
        let kind = ErrorKind::from(&err);
        ClusterError::query(kind, err)
    }
}
