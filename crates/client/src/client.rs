// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::bail;
use hyper::Method;
use tracing::debug;

use hvd_common::address::EndpointAddress;
use hvd_common::types::{AddressUpdate, EndpointInfo, ListenerKind};

use crate::endpoint::{EndpointConfig, Reply, TlsConfig};

/// Client for the daemon's administrative API.
#[derive(Debug)]
pub struct AdminClient {
    endpoint: EndpointConfig,
}

fn check(reply: Reply) -> anyhow::Result<Reply> {
    if reply.status.is_success() {
        Ok(reply)
    } else {
        bail!("Request failed with {}: {}", reply.status, reply.text())
    }
}

impl AdminClient {
    #[must_use]
    pub fn new(address: EndpointAddress, tls: Option<TlsConfig>) -> Self {
        Self {
            endpoint: EndpointConfig {
                transport: address,
                tls,
            },
        }
    }

    #[must_use]
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointConfig::unix(path),
        }
    }

    /// List live endpoints and their addresses
    /// # Errors
    /// Fails if daemon is unreachable or answers with error
    pub async fn list_endpoints(&self) -> anyhow::Result<Vec<EndpointInfo>> {
        let reply = check(self.endpoint.get("/1.0/endpoints").await?)?;
        reply.json()
    }

    /// Move endpoint of `kind` to `address`, empty address disables it
    /// # Errors
    /// Fails if daemon is unreachable or rejects the change
    pub async fn set_address(&self, kind: ListenerKind, address: &str) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&AddressUpdate {
            address: address.to_owned(),
        })?;
        let path = format!("/1.0/endpoints/{kind}");
        debug!("PUT {path} {address}");
        check(self.endpoint.request(Method::PUT, &path, Some(body)).await?)?;
        Ok(())
    }
}
