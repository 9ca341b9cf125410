// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Accept loops: one task per live listener, one task per connection.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use axum::Router;
use hvd_common::types::ListenerKind;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, warn};

use super::listener::{Accepted, BoundListener};
use crate::utils::x509::SecurityInfo;

/// In-flight connections get this long to finish once their listener closes.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Attached to every request as an extension.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub kind: ListenerKind,
    pub remote: String,
    pub remote_ip: Option<IpAddr>,
    /// Set when the TLS peer presented a certificate.
    pub peer: Option<SecurityInfo>,
}

/// Handle on a running accept loop.
#[derive(Debug)]
pub(crate) struct ServeLoop {
    shutdown: watch::Sender<bool>,
    released: Option<oneshot::Receiver<()>>,
    task: JoinHandle<()>,
}

impl ServeLoop {
    pub(crate) fn spawn(listener: BoundListener, router: Router) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let (released, released_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, router, rx, released));
        Self {
            shutdown,
            released: Some(released_rx),
            task,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub(crate) fn signal(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop accepting and wait until the listening socket is closed.
    /// Connections already accepted keep draining. Calling it again is a
    /// no-op.
    pub(crate) async fn release(&mut self) {
        self.signal();
        if let Some(released) = self.released.take() {
            // Err means the loop is gone, and the socket with it
            let _ = released.await;
        }
    }

    /// Wait for the loop to exit, in-flight connections included.
    pub(crate) async fn drained(mut self) {
        self.release().await;
        if let Err(e) = self.task.await {
            error!("Accept loop panicked: {e}");
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

async fn accept_loop(
    mut listener: BoundListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
    released: oneshot::Sender<()>,
) {
    let kind = listener.kind();
    let tls = listener.tls().cloned();
    let (drain, drain_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(%kind, "Listener closed");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => {
                    connections.spawn(serve_connection(
                        kind,
                        accepted,
                        tls.clone(),
                        router.clone(),
                        drain_rx.clone(),
                    ));
                }
                Err(e) if is_connection_error(&e) => continue,
                Err(e) => {
                    error!(%kind, "Accept loop failed, endpoint stops serving: {e}");
                    break;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(%kind, "Connection task failed: {e}");
                }
            }
        }
    }

    drop(listener);
    let _ = released.send(());
    drain.send_replace(true);
    let drained = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drained).await.is_err() {
        warn!(%kind, "Aborting {} connections after drain timeout", connections.len());
        connections.shutdown().await;
    }
}

async fn serve_connection(
    kind: ListenerKind,
    accepted: Accepted,
    tls: Option<TlsAcceptor>,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    match accepted {
        Accepted::Unix(stream) => {
            let info = ConnectionInfo {
                kind,
                remote: "unix".to_owned(),
                remote_ip: None,
                peer: None,
            };
            drive(stream, info, router, shutdown).await;
        }
        Accepted::Vsock(stream, remote) => {
            let info = ConnectionInfo {
                kind,
                remote: format!("{}:{}", remote.cid(), remote.port()),
                remote_ip: None,
                peer: None,
            };
            drive(stream, info, router, shutdown).await;
        }
        Accepted::Tcp(stream, remote) => {
            let mut info = ConnectionInfo {
                kind,
                remote: remote.to_string(),
                remote_ip: Some(remote.ip()),
                peer: None,
            };
            let Some(acceptor) = tls else {
                drive(stream, info, router, shutdown).await;
                return;
            };
            let handshake = tokio::select! {
                result = acceptor.accept(stream) => result,
                _ = shutdown.changed() => return,
            };
            let stream = match handshake {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%kind, %remote, "TLS handshake failed: {e}");
                    return;
                }
            };
            info.peer = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| match SecurityInfo::try_from(cert.as_ref()) {
                    Ok(peer) => Some(peer),
                    Err(e) => {
                        warn!(%kind, %remote, "Can't parse peer certificate: {e}");
                        None
                    }
                });
            drive(stream, info, router, shutdown).await;
        }
    }
}

async fn drive<S>(
    io: S,
    info: ConnectionInfo,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let kind = info.kind;
    let service = router.map_request(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(info.clone());
        req
    });
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder
        .serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(service));
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%kind, "Connection closed with error: {e}");
                }
                break;
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
