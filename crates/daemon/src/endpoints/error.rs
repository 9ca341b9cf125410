// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use hvd_common::types::ListenerKind;
use strum::Display;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleState {
    Unstarted,
    Running,
    Stopped,
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Invalid {kind} address {address:?}: {reason}")]
    InvalidAddress {
        kind: ListenerKind,
        address: String,
        reason: String,
    },

    #[error("Invalid endpoint configuration: {0}")]
    Config(String),

    #[error("Cannot {op} endpoints in {state} state")]
    InvalidState {
        op: &'static str,
        state: LifecycleState,
    },

    #[error("Unix socket {} is already in use by a running process", .0.display())]
    SocketInUse(PathBuf),

    #[error("Parent directory of unix socket {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("Cannot listen on {kind} socket {address}: {source}")]
    Bind {
        kind: ListenerKind,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot set up TLS for {kind}: {reason}")]
    Tls { kind: ListenerKind, reason: String },

    #[error("Socket activation failed: {0}")]
    Activation(String),

    #[error("{kind} reconfiguration did not complete: {reason}")]
    Interrupted { kind: ListenerKind, reason: String },

    #[error("{kind} endpoint is disabled: {bind}; restoring {previous} failed: {rollback}")]
    Unavailable {
        kind: ListenerKind,
        previous: String,
        bind: Box<EndpointError>,
        rollback: Box<EndpointError>,
    },
}

impl EndpointError {
    pub(crate) fn bind(kind: ListenerKind, address: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            kind,
            address: address.into(),
            source,
        }
    }

    /// Errors worth retrying: the address may free up within the retry window.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bind { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::AddrInUse
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let in_use = EndpointError::bind(
            ListenerKind::Metrics,
            "127.0.0.1:9100",
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(in_use.is_transient());

        let denied = EndpointError::bind(
            ListenerKind::Metrics,
            "127.0.0.1:91",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(!denied.is_transient());
        assert!(!EndpointError::Config("bad".into()).is_transient());
        assert!(!EndpointError::SocketInUse("/run/hvd/unix.socket".into()).is_transient());
    }
}
