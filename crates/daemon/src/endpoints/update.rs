// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use hvd_common::types::ListenerKind;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::retry::bind_with_retry;
use super::{canonicalize, EndpointError, Endpoints, Lifecycle, Registry};

impl Endpoints {
    /// Move the listener of a network kind to `address`; empty disables it.
    ///
    /// Holds the registry write lock for the whole change. If the new
    /// address can't be bound, the previous one is restored and the bind
    /// error is still returned. The endpoint stays down only if the restore
    /// fails as well, reported as [`EndpointError::Unavailable`].
    ///
    /// The change runs in its own task: dropping the returned future stops
    /// waiting for it, not the change itself. Connections accepted on the
    /// old address are left to finish in the background.
    ///
    /// # Errors
    /// Fails on invalid kind or address, bind failure, or if endpoints are
    /// not running
    pub async fn update_address(
        &self,
        kind: ListenerKind,
        address: &str,
    ) -> Result<(), EndpointError> {
        if !kind.is_network_capable() {
            return Err(EndpointError::Config(format!(
                "{kind} address can't be changed at runtime"
            )));
        }
        let address = canonicalize(kind, address)?;

        {
            let state = self.state.read().await;
            let Lifecycle::Running(registry) = &*state else {
                return Err(EndpointError::InvalidState {
                    op: "reconfigure",
                    state: state.state(),
                });
            };
            if registry.is_current(kind, &address) {
                debug!(%kind, %address, "Address unchanged");
                return Ok(());
            }
        }

        let task = tokio::spawn(apply_address(self.state.clone(), kind, address));
        match task.await {
            Ok(result) => result,
            Err(e) => match e.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(e) => Err(EndpointError::Interrupted {
                    kind,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

async fn apply_address(
    state: Arc<RwLock<Lifecycle>>,
    kind: ListenerKind,
    address: String,
) -> Result<(), EndpointError> {
    let mut state = state.write().await;
    let Lifecycle::Running(registry) = &mut *state else {
        return Err(EndpointError::InvalidState {
            op: "reconfigure",
            state: state.state(),
        });
    };
    // Another writer may have got here first
    if registry.is_current(kind, &address) {
        return Ok(());
    }
    if !address.is_empty() && !registry.servers.contains_key(&kind) {
        return Err(EndpointError::Config(format!("{kind} has no request handler")));
    }

    let mut previous = String::new();
    if let Some(released) = registry.close(kind).await {
        previous = released.address;
        if let Some(serving) = released.draining {
            registry.retire(serving);
        }
    }
    if address.is_empty() {
        info!(%kind, %previous, "Endpoint disabled");
        return Ok(());
    }
    rebind(registry, kind, &address, previous).await
}

async fn rebind(
    registry: &mut Registry,
    kind: ListenerKind,
    address: &str,
    previous: String,
) -> Result<(), EndpointError> {
    let cert = registry.cert.clone();
    let err = match bind_with_retry(kind, address, &cert).await {
        Ok(listener) => {
            registry.install(listener, address);
            registry.serve(kind)?;
            info!(%kind, %address, %previous, "Endpoint moved");
            return Ok(());
        }
        Err(err) => err,
    };
    if previous.is_empty() {
        warn!(%kind, %address, "Can't enable endpoint: {err}");
        return Err(err);
    }

    warn!(%kind, %address, "Can't move endpoint, restoring {previous}: {err}");
    match bind_with_retry(kind, &previous, &cert).await {
        Ok(listener) => {
            registry.install(listener, &previous);
            registry.serve(kind)?;
            Err(err)
        }
        Err(rollback) => {
            error!(%kind, %address, %previous, "Endpoint is down, restoring previous address failed: {rollback}");
            Err(EndpointError::Unavailable {
                kind,
                previous,
                bind: Box::new(err),
                rollback: Box::new(rollback),
            })
        }
    }
}
