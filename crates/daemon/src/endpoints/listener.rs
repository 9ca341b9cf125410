// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Listener factory: binds one listening socket for a kind without serving it.

use std::fmt;
use std::fs::{self, Permissions};
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use hvd_common::address::parse_vsock_addr;
use hvd_common::types::{ListenerKind, Transport};
use serde::Serialize;
use strum::Display;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
use tracing::{debug, warn};

use super::error::EndpointError;
use crate::tls::CertBundle;

const UNIX_SOCKET_MODE: u32 = 0o660;

/// Where a live listener came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Provenance {
    Bound,
    Inherited,
}

/// Removes a socket file we created once the listener is gone.
#[derive(Debug)]
pub(crate) struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            debug!("Can't remove unix socket {}: {e}", self.0.display());
        }
    }
}

// Field order matters: the listener is closed before its file is unlinked.
pub(crate) enum Socket {
    Unix {
        listener: UnixListener,
        file: Option<SocketFile>,
    },
    Tcp(TcpListener),
    Vsock(VsockListener),
}

pub(crate) enum Accepted {
    Unix(UnixStream),
    Tcp(TcpStream, SocketAddr),
    Vsock(VsockStream, VsockAddr),
}

/// An owned, bound listening socket. Fresh and inherited sockets look the
/// same from here on; dropping it closes the socket.
pub struct BoundListener {
    kind: ListenerKind,
    socket: Socket,
    tls: Option<TlsAcceptor>,
    provenance: Provenance,
}

impl fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundListener")
            .field("kind", &self.kind)
            .field("address", &self.address().ok())
            .field("tls", &self.tls.is_some())
            .field("provenance", &self.provenance)
            .finish()
    }
}

impl BoundListener {
    pub(crate) fn new(
        kind: ListenerKind,
        socket: Socket,
        cert: &CertBundle,
        provenance: Provenance,
    ) -> Result<Self, EndpointError> {
        let tls = match kind.transport() {
            Transport::Tls => {
                let config = cert
                    .server_config(kind.descriptor().client_auth)
                    .map_err(|e| EndpointError::Tls {
                        kind,
                        reason: format!("{e:#}"),
                    })?;
                Some(TlsAcceptor::from(config))
            }
            Transport::Unix | Transport::Vsock => None,
        };
        Ok(Self {
            kind,
            socket,
            tls,
            provenance,
        })
    }

    #[must_use]
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    #[must_use]
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub(crate) fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    /// Address as reported by the OS, in canonical form.
    ///
    /// # Errors
    /// Fails if socket address can't be queried
    pub fn address(&self) -> io::Result<String> {
        match &self.socket {
            Socket::Unix { file: Some(file), .. } => Ok(file.0.display().to_string()),
            Socket::Unix { listener, .. } => Ok(listener
                .local_addr()?
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            Socket::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            Socket::Vsock(listener) => {
                let addr = listener.local_addr()?;
                Ok(format!("{}:{}", addr.cid(), addr.port()))
            }
        }
    }

    pub(crate) async fn accept(&mut self) -> io::Result<Accepted> {
        match &mut self.socket {
            Socket::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted::Unix(stream))
            }
            Socket::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                Ok(Accepted::Tcp(stream, remote))
            }
            Socket::Vsock(listener) => {
                let (stream, remote) = listener.accept().await?;
                Ok(Accepted::Vsock(stream, remote))
            }
        }
    }
}

fn remove_stale_socket(kind: ListenerKind, path: &Path) -> Result<(), EndpointError> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(EndpointError::SocketInUse(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            warn!("Removing stale unix socket {}", path.display());
            fs::remove_file(path)
                .map_err(|e| EndpointError::bind(kind, path.display().to_string(), e))
        }
        Err(e) => Err(EndpointError::bind(kind, path.display().to_string(), e)),
    }
}

fn bind_unix(kind: ListenerKind, path: &Path) -> Result<Socket, EndpointError> {
    let missing_parent = path
        .parent()
        .is_some_and(|p| !p.as_os_str().is_empty() && !p.is_dir());
    if missing_parent {
        return Err(EndpointError::MissingDirectory(path.to_path_buf()));
    }
    remove_stale_socket(kind, path)?;

    let bind_err = |e| EndpointError::bind(kind, path.display().to_string(), e);
    let listener = UnixListener::bind(path).map_err(bind_err)?;
    let file = SocketFile(path.to_path_buf());
    fs::set_permissions(path, Permissions::from_mode(UNIX_SOCKET_MODE)).map_err(bind_err)?;
    Ok(Socket::Unix {
        listener,
        file: Some(file),
    })
}

async fn bind_tcp(kind: ListenerKind, address: &str) -> Result<Socket, EndpointError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| EndpointError::bind(kind, address, e))?;
    Ok(Socket::Tcp(listener))
}

fn bind_vsock(kind: ListenerKind, address: &str) -> Result<Socket, EndpointError> {
    let vs = parse_vsock_addr(address, 0).map_err(|e| EndpointError::InvalidAddress {
        kind,
        address: address.to_owned(),
        reason: format!("{e:#}"),
    })?;
    let listener = VsockListener::bind(vs).map_err(|e| EndpointError::bind(kind, address, e))?;
    Ok(Socket::Vsock(listener))
}

/// Bind a fresh listener for `kind` at `address` (a path for unix kinds).
///
/// Nothing is accepted until the listener is handed to the serve loop.
///
/// # Errors
/// Fails on malformed address, occupied socket, missing directory, TLS
/// misconfiguration or OS bind failure
pub async fn create_listener(
    kind: ListenerKind,
    address: &str,
    cert: &CertBundle,
) -> Result<BoundListener, EndpointError> {
    let address = kind
        .canonical_address(address)
        .map_err(|e| EndpointError::InvalidAddress {
            kind,
            address: address.to_owned(),
            reason: format!("{e:#}"),
        })?;
    if address.is_empty() {
        return Err(EndpointError::Config(format!("{kind} requires an address")));
    }
    let socket = match kind.transport() {
        Transport::Unix => bind_unix(kind, Path::new(&address))?,
        Transport::Tls => bind_tcp(kind, &address).await?,
        Transport::Vsock => bind_vsock(kind, &address)?,
    };
    BoundListener::new(kind, socket, cert, Provenance::Bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::bundle;

    #[tokio::test]
    async fn test_unix_listener_lifecycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("unix.socket");
        let cert = bundle();

        let listener = create_listener(ListenerKind::LocalAdmin, path.to_str().unwrap(), &cert).await?;
        assert_eq!(listener.address()?, path.display().to_string());
        assert_eq!(listener.provenance(), Provenance::Bound);
        assert!(listener.tls().is_none());

        let mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, UNIX_SOCKET_MODE);

        let err = create_listener(ListenerKind::LocalAdmin, path.to_str().unwrap(), &cert)
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::SocketInUse(_)), "{err}");

        drop(listener);
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("unix.socket");
        // A socket file nobody listens on, as left behind by a crash
        drop(std::os::unix::net::UnixListener::bind(&path)?);
        assert!(path.exists());

        let listener =
            create_listener(ListenerKind::LocalAdmin, path.to_str().unwrap(), &bundle()).await?;
        UnixStream::connect(&path).await?;
        drop(listener);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("guest-agent").join("sock");
        let err = create_listener(ListenerKind::GuestAgent, path.to_str().unwrap(), &bundle())
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::MissingDirectory(_)), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn test_tls_listener() -> anyhow::Result<()> {
        let cert = bundle();
        let listener = create_listener(ListenerKind::Metrics, "127.0.0.1:0", &cert).await?;
        assert!(listener.tls().is_some());
        assert!(listener.address()?.starts_with("127.0.0.1:"));

        let err = create_listener(ListenerKind::Metrics, "127.0.0.1:metrics", &cert)
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::InvalidAddress { .. }), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn test_required_client_auth_needs_ca() -> anyhow::Result<()> {
        let cert = CertBundle::from_pem(
            crate::tls::tests::SERVER_CERT,
            crate::tls::tests::SERVER_KEY,
            None,
        )?;
        let err = create_listener(ListenerKind::NetworkAdmin, "127.0.0.1:0", &cert)
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Tls { .. }), "{err}");
        Ok(())
    }
}
