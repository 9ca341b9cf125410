// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Endpoint registry: owns every live listener, keyed by kind.

pub mod activation;
pub mod error;
pub mod listener;
pub mod retry;
pub mod serve;
mod update;

use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use hvd_common::types::{EndpointInfo, ListenerKind, Transport};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info};

pub use self::activation::{ActivationHint, LISTEN_FDS_START};
pub use self::error::{EndpointError, LifecycleState};
pub use self::listener::{create_listener, BoundListener, Provenance};
pub use self::serve::ConnectionInfo;
use self::serve::ServeLoop;
use crate::tls::CertBundle;

const UNIX_SOCKET_NAME: &str = "unix.socket";

/// What to start on `up`: request handlers per kind and the addresses of
/// network kinds. Unix kinds are placed under `dir`.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub dir: PathBuf,
    pub unix_socket: Option<PathBuf>,
    pub cert: Arc<CertBundle>,
    pub servers: HashMap<ListenerKind, Router>,
    pub addresses: HashMap<ListenerKind, String>,
    /// Socket activation handoff, see [`ActivationHint::take_from_env`].
    pub activation: Option<ActivationHint>,
    pub listen_fds_start: RawFd,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, cert: Arc<CertBundle>) -> Self {
        Self {
            dir: dir.into(),
            unix_socket: None,
            cert,
            servers: HashMap::new(),
            addresses: HashMap::new(),
            activation: None,
            listen_fds_start: LISTEN_FDS_START,
        }
    }

    #[must_use]
    pub fn with_server(mut self, kind: ListenerKind, router: Router) -> Self {
        self.servers.insert(kind, router);
        self
    }

    #[must_use]
    pub fn with_address(mut self, kind: ListenerKind, address: impl Into<String>) -> Self {
        self.addresses.insert(kind, address.into());
        self
    }

    #[must_use]
    pub fn unix_socket(&self) -> PathBuf {
        self.unix_socket
            .clone()
            .unwrap_or_else(|| self.dir.join(UNIX_SOCKET_NAME))
    }

    #[must_use]
    pub fn guest_agent_socket(&self) -> PathBuf {
        self.dir.join("guest-agent").join("sock")
    }

    /// Kinds to bind fresh, with canonical addresses.
    fn plan(&self) -> Result<Vec<(ListenerKind, String)>, EndpointError> {
        if !self.servers.contains_key(&ListenerKind::LocalAdmin) {
            return Err(EndpointError::Config(format!(
                "{} has no request handler",
                ListenerKind::LocalAdmin
            )));
        }
        let mut plan = vec![(
            ListenerKind::LocalAdmin,
            self.unix_socket().display().to_string(),
        )];
        if self.servers.contains_key(&ListenerKind::GuestAgent) {
            plan.push((
                ListenerKind::GuestAgent,
                self.guest_agent_socket().display().to_string(),
            ));
        }

        let configured: BTreeMap<_, _> = self.addresses.iter().collect();
        let mut seen: HashMap<(Transport, String), ListenerKind> = HashMap::new();
        for (&kind, address) in configured {
            if !kind.is_network_capable() {
                return Err(EndpointError::Config(format!(
                    "{kind} address is not configurable"
                )));
            }
            let canonical = canonicalize(kind, address)?;
            if canonical.is_empty() {
                continue;
            }
            if !self.servers.contains_key(&kind) {
                return Err(EndpointError::Config(format!("{kind} has no request handler")));
            }
            // Each ephemeral request gets its own port
            if canonical.ends_with(":0") {
                plan.push((kind, canonical));
                continue;
            }
            if let Some(other) = seen.insert((kind.transport(), canonical.clone()), kind) {
                return Err(EndpointError::Config(format!(
                    "{other} and {kind} both listen on {canonical}"
                )));
            }
            plan.push((kind, canonical));
        }
        Ok(plan)
    }
}

pub(crate) fn canonicalize(kind: ListenerKind, address: &str) -> Result<String, EndpointError> {
    kind.canonical_address(address)
        .map_err(|e| EndpointError::InvalidAddress {
            kind,
            address: address.to_owned(),
            reason: format!("{e:#}"),
        })
}

#[derive(Debug)]
struct Entry {
    address: String,
    provenance: Provenance,
    listener: Option<BoundListener>,
    serving: Option<ServeLoop>,
}

impl Entry {
    fn is_serving(&self) -> bool {
        self.serving.as_ref().is_some_and(ServeLoop::is_running)
    }

    /// Close the listening socket. The returned loop is still draining.
    async fn release(&mut self) -> Option<ServeLoop> {
        self.listener.take();
        let mut serving = self.serving.take()?;
        serving.release().await;
        Some(serving)
    }
}

/// What is left of an entry after its listener was closed.
#[derive(Debug)]
struct Released {
    address: String,
    draining: Option<ServeLoop>,
}

#[derive(Debug)]
struct Registry {
    entries: BTreeMap<ListenerKind, Entry>,
    servers: HashMap<ListenerKind, Router>,
    cert: Arc<CertBundle>,
    /// Loops of replaced listeners, finishing their connections.
    retired: Vec<ServeLoop>,
}

impl Registry {
    /// Record a bound listener under its kind. Nothing is accepted yet.
    ///
    /// `requested` is kept as the address unless it is empty or asks for an
    /// ephemeral port, then the OS-reported address is used.
    fn install(&mut self, listener: BoundListener, requested: &str) {
        let kind = listener.kind();
        let address = match listener.address() {
            Ok(actual) if requested.is_empty() || requested.ends_with(":0") => actual,
            _ => requested.to_owned(),
        };
        info!(%kind, %address, provenance = %listener.provenance(), "Listening");
        let entry = Entry {
            address,
            provenance: listener.provenance(),
            listener: Some(listener),
            serving: None,
        };
        self.entries.insert(kind, entry);
    }

    fn serve(&mut self, kind: ListenerKind) -> Result<(), EndpointError> {
        let router = self
            .servers
            .get(&kind)
            .cloned()
            .ok_or_else(|| EndpointError::Config(format!("{kind} has no request handler")))?;
        if let Some(entry) = self.entries.get_mut(&kind) {
            if let Some(listener) = entry.listener.take() {
                entry.serving = Some(ServeLoop::spawn(listener, router));
            }
        }
        Ok(())
    }

    fn is_current(&self, kind: ListenerKind, address: &str) -> bool {
        match self.entries.get(&kind) {
            Some(entry) => entry.address == address && entry.is_serving(),
            None => address.is_empty(),
        }
    }

    /// Close and forget the listener of `kind`. Its address is free to bind
    /// again once this returns.
    async fn close(&mut self, kind: ListenerKind) -> Option<Released> {
        let mut entry = self.entries.remove(&kind)?;
        let draining = entry.release().await;
        debug!(%kind, address = %entry.address, "Closed");
        Some(Released {
            address: entry.address,
            draining,
        })
    }

    fn retire(&mut self, serving: ServeLoop) {
        self.retired.retain(ServeLoop::is_running);
        self.retired.push(serving);
    }

    /// Close every listener, returning the loops still draining.
    async fn close_all(&mut self) -> Vec<ServeLoop> {
        for entry in self.entries.values_mut() {
            entry.listener.take();
            if let Some(serving) = &entry.serving {
                serving.signal();
            }
        }
        let mut draining = std::mem::take(&mut self.retired);
        while let Some((kind, mut entry)) = self.entries.pop_first() {
            draining.extend(entry.release().await);
            debug!(%kind, "Closed");
        }
        draining
    }
}

#[derive(Debug)]
enum Lifecycle {
    Unstarted,
    Running(Registry),
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> LifecycleState {
        match self {
            Self::Unstarted => LifecycleState::Unstarted,
            Self::Running(_) => LifecycleState::Running,
            Self::Stopped => LifecycleState::Stopped,
        }
    }
}

/// The set of network endpoints served by the daemon.
///
/// Lifecycle is `Unstarted -> Running -> Stopped`; a stopped instance can't
/// be started again.
#[derive(Debug)]
pub struct Endpoints {
    state: Arc<RwLock<Lifecycle>>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::unstarted()
    }
}

impl Endpoints {
    #[must_use]
    pub fn unstarted() -> Self {
        Self {
            state: Arc::new(RwLock::new(Lifecycle::Unstarted)),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.state.read().await.state()
    }

    /// Bind or inherit every configured listener and start serving them.
    ///
    /// Either all of them come up or none: on failure everything opened so
    /// far is closed and the first error is returned.
    ///
    /// # Errors
    /// Fails on invalid configuration, activation or bind errors, or if the
    /// endpoints were already started
    pub async fn up(&self, config: EndpointConfig) -> Result<(), EndpointError> {
        let mut state = self.state.write().await;
        if !matches!(*state, Lifecycle::Unstarted) {
            return Err(EndpointError::InvalidState {
                op: "start",
                state: state.state(),
            });
        }

        let mut opened: BTreeMap<ListenerKind, (BoundListener, String)> = BTreeMap::new();
        if let Some(hint) = config.activation {
            info!("Socket activation with {} descriptors", hint.fds);
            let inherited =
                activation::resolve_inherited(hint.fds, config.listen_fds_start, &config.cert)?;
            for listener in inherited {
                if !config.servers.contains_key(&listener.kind()) {
                    return Err(EndpointError::Config(format!(
                        "Inherited {} listener has no request handler",
                        listener.kind()
                    )));
                }
                opened.insert(listener.kind(), (listener, String::new()));
            }
        }

        for (kind, address) in config.plan()? {
            if opened.contains_key(&kind) {
                debug!(%kind, "Using inherited listener instead of {address}");
                continue;
            }
            let listener = create_listener(kind, &address, &config.cert).await?;
            opened.insert(kind, (listener, address));
        }

        let mut registry = Registry {
            entries: BTreeMap::new(),
            servers: config.servers,
            cert: config.cert,
            retired: Vec::new(),
        };
        let kinds: Vec<_> = opened.keys().copied().collect();
        for (listener, address) in opened.into_values() {
            registry.install(listener, &address);
        }
        for kind in kinds {
            registry.serve(kind)?;
        }
        *state = Lifecycle::Running(registry);
        info!("Endpoints are up");
        Ok(())
    }

    /// Close every listener and wait for all accept loops to exit.
    ///
    /// Listeners are closed under the lock; in-flight connections drain
    /// after it is released.
    ///
    /// # Errors
    /// Fails unless endpoints are running
    pub async fn down(&self) -> Result<(), EndpointError> {
        let mut state = self.state.write().await;
        let Lifecycle::Running(registry) = &mut *state else {
            return Err(EndpointError::InvalidState {
                op: "stop",
                state: state.state(),
            });
        };
        let draining = registry.close_all().await;
        *state = Lifecycle::Stopped;
        drop(state);

        let mut loops = JoinSet::new();
        for serving in draining {
            loops.spawn(serving.drained());
        }
        while loops.join_next().await.is_some() {}
        info!("Endpoints are down");
        Ok(())
    }

    /// Current address of `kind`, empty when it has no live listener.
    pub async fn address(&self, kind: ListenerKind) -> String {
        match &*self.state.read().await {
            Lifecycle::Running(registry) => registry
                .entries
                .get(&kind)
                .map(|entry| entry.address.clone())
                .unwrap_or_default(),
            Lifecycle::Unstarted | Lifecycle::Stopped => String::new(),
        }
    }

    pub async fn addresses(&self) -> Vec<EndpointInfo> {
        match &*self.state.read().await {
            Lifecycle::Running(registry) => registry
                .entries
                .iter()
                .map(|(&kind, entry)| EndpointInfo {
                    kind,
                    address: entry.address.clone(),
                    inherited: entry.provenance == Provenance::Inherited,
                })
                .collect(),
            Lifecycle::Unstarted | Lifecycle::Stopped => Vec::new(),
        }
    }

    pub async fn provenance(&self, kind: ListenerKind) -> Option<Provenance> {
        match &*self.state.read().await {
            Lifecycle::Running(registry) => registry.entries.get(&kind).map(|e| e.provenance),
            Lifecycle::Unstarted | Lifecycle::Stopped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::bundle;

    fn config(dir: &std::path::Path) -> EndpointConfig {
        EndpointConfig::new(dir, Arc::new(bundle()))
            .with_server(ListenerKind::LocalAdmin, Router::new())
            .with_server(ListenerKind::Metrics, Router::new())
            .with_server(ListenerKind::Cluster, Router::new())
    }

    #[test]
    fn test_plan_defaults() -> anyhow::Result<()> {
        let cfg = config("/run/hvd".as_ref()).with_address(ListenerKind::Metrics, " 127.0.0.1 ");
        assert_eq!(
            cfg.plan()?,
            [
                (ListenerKind::LocalAdmin, "/run/hvd/unix.socket".to_owned()),
                (ListenerKind::Metrics, "127.0.0.1:9100".to_owned()),
            ]
        );
        assert_eq!(cfg.guest_agent_socket(), PathBuf::from("/run/hvd/guest-agent/sock"));
        Ok(())
    }

    #[test]
    fn test_plan_rejects_bad_configs() {
        let dir = std::path::Path::new("/run/hvd");

        let no_local = EndpointConfig::new(dir, Arc::new(bundle()));
        assert!(matches!(no_local.plan(), Err(EndpointError::Config(_))));

        let no_handler = config(dir).with_address(ListenerKind::StorageObjects, "127.0.0.1");
        assert!(matches!(no_handler.plan(), Err(EndpointError::Config(_))));

        let unix_kind = config(dir).with_address(ListenerKind::GuestAgent, "/tmp/sock");
        assert!(matches!(unix_kind.plan(), Err(EndpointError::Config(_))));

        let garbage = config(dir).with_address(ListenerKind::Metrics, "127.0.0.1:port");
        assert!(matches!(
            garbage.plan(),
            Err(EndpointError::InvalidAddress { .. })
        ));

        let clash = config(dir)
            .with_address(ListenerKind::Metrics, "10.0.0.1:8443")
            .with_address(ListenerKind::Cluster, "10.0.0.1");
        assert!(matches!(clash.plan(), Err(EndpointError::Config(_))));
    }

    #[test]
    fn test_plan_allows_shared_ephemeral_port() -> anyhow::Result<()> {
        let cfg = config("/run/hvd".as_ref())
            .with_address(ListenerKind::Metrics, "127.0.0.1:0")
            .with_address(ListenerKind::Cluster, "127.0.0.1:0");
        assert_eq!(
            cfg.plan()?,
            [
                (ListenerKind::LocalAdmin, "/run/hvd/unix.socket".to_owned()),
                (ListenerKind::Metrics, "127.0.0.1:0".to_owned()),
                (ListenerKind::Cluster, "127.0.0.1:0".to_owned()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_plan_skips_disabled() -> anyhow::Result<()> {
        let cfg = config("/run/hvd".as_ref()).with_address(ListenerKind::Metrics, "");
        assert_eq!(cfg.plan()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unstarted_reads_empty() {
        let endpoints = Endpoints::unstarted();
        assert_eq!(endpoints.state().await, LifecycleState::Unstarted);
        assert_eq!(endpoints.address(ListenerKind::LocalAdmin).await, "");
        assert!(endpoints.addresses().await.is_empty());
        assert_eq!(endpoints.provenance(ListenerKind::LocalAdmin).await, None);
    }
}
