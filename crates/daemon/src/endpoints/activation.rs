// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Socket activation: adopt listeners opened for us by the service manager.
//!
//! The handoff carries no names, so the descriptor ordinal decides the kind.

use std::env;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use hvd_common::types::{ListenerKind, Transport};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use super::error::EndpointError;
use super::listener::{BoundListener, Provenance, Socket};
use crate::tls::CertBundle;

pub const LISTEN_FDS_START: RawFd = 3;

/// Kind expected at each descriptor ordinal.
pub const ACTIVATION_ORDER: [ListenerKind; 2] =
    [ListenerKind::LocalAdmin, ListenerKind::NetworkAdmin];

const LISTEN_PID: &str = "LISTEN_PID";
const LISTEN_FDS: &str = "LISTEN_FDS";
const LISTEN_FDNAMES: &str = "LISTEN_FDNAMES";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActivationHint {
    pub pid: u32,
    pub fds: usize,
}

impl ActivationHint {
    /// Read the handoff from the environment and clear it, whatever it says.
    /// Returns `None` when there is no handoff or it was meant for another
    /// process.
    ///
    /// Modifies the process environment, so call it before any other thread
    /// is started, in particular before the async runtime.
    ///
    /// # Errors
    /// Fails if the handoff is ours but the descriptor count is garbage
    pub fn take_from_env() -> Result<Option<Self>, EndpointError> {
        let pid = env::var(LISTEN_PID).ok();
        let fds = env::var(LISTEN_FDS).ok();
        env::remove_var(LISTEN_PID);
        env::remove_var(LISTEN_FDS);
        env::remove_var(LISTEN_FDNAMES);

        let (Some(pid), Some(fds)) = (pid, fds) else {
            return Ok(None);
        };
        let own = std::process::id();
        let pid = match pid.trim().parse::<u32>() {
            Ok(pid) if pid == own => pid,
            _ => {
                debug!("Ignoring socket activation for process {pid}, we are {own}");
                return Ok(None);
            }
        };
        let fds = fds
            .trim()
            .parse()
            .map_err(|e| EndpointError::Activation(format!("Invalid {LISTEN_FDS} {fds:?}: {e}")))?;
        Ok(Some(Self { pid, fds }))
    }
}

fn adopt_fd(fd: RawFd) -> Result<OwnedFd, EndpointError> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(|e| {
        EndpointError::Activation(format!("Inherited descriptor {fd} is not open: {e}"))
    })?;
    let mut flags = FdFlag::from_bits_retain(flags);
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map_err(|e| EndpointError::Activation(format!("Cannot set close-on-exec on {fd}: {e}")))?;
    // SAFETY: the descriptor is open and was handed to this process by the
    // service manager; nothing else in the process owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn socket_from_fd(kind: ListenerKind, fd: OwnedFd) -> std::io::Result<Socket> {
    match kind.transport() {
        Transport::Unix => {
            let listener = std::os::unix::net::UnixListener::from(fd);
            listener.local_addr()?;
            listener.set_nonblocking(true)?;
            Ok(Socket::Unix {
                listener: UnixListener::from_std(listener)?,
                file: None,
            })
        }
        Transport::Tls => {
            let listener = std::net::TcpListener::from(fd);
            listener.local_addr()?;
            listener.set_nonblocking(true)?;
            Ok(Socket::Tcp(TcpListener::from_std(listener)?))
        }
        Transport::Vsock => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "vsock listeners can't be inherited",
        )),
    }
}

/// Reconstruct listeners from `fds` descriptors starting at `first_fd`.
///
/// Every declared descriptor must be open. Descriptors past the agreed
/// ordinal table are closed.
///
/// # Errors
/// Fails if a declared descriptor is missing or is not the expected socket
pub fn resolve_inherited(
    fds: usize,
    first_fd: RawFd,
    cert: &CertBundle,
) -> Result<Vec<BoundListener>, EndpointError> {
    let mut listeners = Vec::with_capacity(fds.min(ACTIVATION_ORDER.len()));
    for ordinal in 0..fds {
        let fd = RawFd::try_from(ordinal)
            .ok()
            .and_then(|n| first_fd.checked_add(n))
            .ok_or_else(|| EndpointError::Activation(format!("Too many descriptors: {fds}")))?;
        let owned = adopt_fd(fd)?;
        let Some(&kind) = ACTIVATION_ORDER.get(ordinal) else {
            warn!("Closing unexpected inherited descriptor {fd}");
            continue;
        };
        let socket = socket_from_fd(kind, owned).map_err(|e| {
            EndpointError::Activation(format!("Descriptor {fd} is not a {kind} listener: {e}"))
        })?;
        let listener = BoundListener::new(kind, socket, cert, Provenance::Inherited)?;
        info!(%kind, "Inherited listener on descriptor {fd}");
        listeners.push(listener);
    }
    Ok(listeners)
}
