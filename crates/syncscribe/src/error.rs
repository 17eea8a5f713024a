// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types observable at the public API.

use std::fmt;
use std::io;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by broker and connection operations.
#[derive(Debug)]
pub enum Error {
    /// No live socket when a request was issued.
    NotConnected,

    /// A synchronous waiter did not receive its reply within the deadline.
    Timeout,

    /// A bounded table (events, clients, channels, subscribers) is full.
    NoCapacity,

    /// Declared variable type disagrees with the requested one.
    TypeMismatch {
        /// Type bits declared at definition time.
        declared: u32,
        /// Type bits carried by the rejected operation.
        requested: u32,
    },

    /// Protocol major version differs; fatal for the connection.
    VersionMismatch {
        /// Major version announced by the peer.
        major: u32,
    },

    /// Packet envelope verification failed; fatal for the connection.
    Crypt,

    /// Malformed packet or record at the codec boundary.
    Protocol(String),

    /// Underlying socket error.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Timeout => write!(f, "request timed out"),
            Self::NoCapacity => write!(f, "no table capacity"),
            Self::TypeMismatch {
                declared,
                requested,
            } => write!(
                f,
                "type mismatch: declared 0x{:04x}, requested 0x{:04x}",
                declared, requested
            ),
            Self::VersionMismatch { major } => {
                write!(f, "protocol version mismatch: peer major {}", major)
            }
            Self::Crypt => write!(f, "packet envelope verification failed"),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
