// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types shared by the device manager and the HFP engine.

use thiserror::Error;

/// Classified failure reported by the control bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    NotReady,
    InProgress,
    AlreadyExists,
    /// Stop requested while nothing was running.
    NotRunning,
    DoesNotExist,
    AuthenticationRejected,
    AuthenticationCanceled,
    AuthenticationTimeout,
    AuthenticationFailed,
    NotAvailable,
    NotSupported,
    Failed,
    Other,
}

/// Library error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bus call failed ({kind:?}): {message}")]
    Bus { kind: BusErrorKind, message: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no hands-free connection for {0}")]
    NotConnected(String),

    #[error("AT command {command:?} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn bus(kind: BusErrorKind, message: impl Into<String>) -> Self {
        Error::Bus {
            kind,
            message: message.into(),
        }
    }

    /// Bus error kind, if this is a bus failure.
    pub fn bus_kind(&self) -> Option<BusErrorKind> {
        match self {
            Error::Bus { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Failures that a caller may retry (timeouts, busy or in-progress states).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Bus { kind, .. } => {
                matches!(kind, BusErrorKind::InProgress | BusErrorKind::NotReady)
            }
            Error::Command { reason, .. } => reason == "BUSY",
            _ => false,
        }
    }

    /// Failures that must not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.bus_kind(),
            Some(
                BusErrorKind::NotAvailable
                    | BusErrorKind::NotSupported
                    | BusErrorKind::AuthenticationRejected
                    | BusErrorKind::AuthenticationCanceled
                    | BusErrorKind::AuthenticationTimeout
            )
        )
    }
}
