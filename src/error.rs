//! Error taxonomy
//!
//! Each error is owned by the narrowest scope that can contain it:
//! request, channel, connection, or process startup.

use std::io;
use std::path::PathBuf;

use russh_sftp::protocol::StatusCode;
use thiserror::Error;

/// Credential check failure. Never carries the expected secret.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password rejected for {user:?}")]
    Rejected { user: String },
}

/// Per-connection: the transport handshake did not produce a session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("ssh handshake failed: {0}")]
    Transport(String),

    #[error("peer disconnected before authenticating")]
    Unauthenticated,
}

/// Per-channel (or per-session) transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel accept failed: transport no longer waiting for a decision")]
    AcceptFailed,

    #[error("failed to close {what}")]
    Close { what: String },
}

/// Per-channel: the file-transfer subsystem could not be built or stopped
/// abnormally. A clean end-of-stream is not an error.
#[derive(Debug, Error)]
pub enum SubsystemError {
    #[error("invalid subsystem root {}: {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("sftp stream error: {0}")]
    Io(#[from] io::Error),

    #[error("sftp packet of {0} bytes exceeds the limit")]
    PacketTooLarge(u32),

    #[error("malformed sftp packet: {0}")]
    Decode(String),
}

/// Path confinement failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path escapes the served root")]
    Escape,

    #[error("path is not valid")]
    Invalid,

    #[error("failed to resolve path: {0}")]
    Resolve(String),
}

/// Per-request: a single file-transfer operation failed. Answered with a
/// status packet, never fatal to the channel.
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("no such file or directory")]
    NoSuchFile,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid handle")]
    InvalidHandle,

    #[error("{0}")]
    Failure(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl SftpError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SftpError::NoSuchFile => StatusCode::NoSuchFile,
            SftpError::PermissionDenied(_) => StatusCode::PermissionDenied,
            SftpError::InvalidHandle | SftpError::Failure(_) => StatusCode::Failure,
            SftpError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
        }
    }
}

impl From<PathError> for SftpError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::Escape => SftpError::PermissionDenied(e.to_string()),
            PathError::Invalid => SftpError::Failure(e.to_string()),
            PathError::Resolve(_) => SftpError::NoSuchFile,
        }
    }
}

/// Startup-fatal conditions.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to load host key {}: {reason}", path.display())]
    HostKey { path: PathBuf, reason: String },

    #[error("failed to generate an ephemeral host key")]
    KeyGeneration,

    #[error("served root {} is not a directory", .0.display())]
    RootNotDirectory(PathBuf),

    #[error("failed to prepare served root {}: {source}", path.display())]
    Root { path: PathBuf, source: io::Error },
}

/// The listener itself became unusable.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listener is no longer usable: {0}")]
    Listener(io::Error),
}
