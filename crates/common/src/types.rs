// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use crate::address::{canonical_network_address, canonical_vsock_address};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Network-facing roles served by the daemon. The set is closed.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ListenerKind {
    LocalAdmin,
    NetworkAdmin,
    GuestAgent,
    Metrics,
    StorageObjects,
    Cluster,
    VmConsole,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    Unix,
    Tls,
    Vsock,
}

/// How a TLS listener treats client certificates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ClientAuth {
    None,
    Optional,
    Required,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KindDescriptor {
    pub transport: Transport,
    pub default_port: Option<u16>,
    pub client_auth: ClientAuth,
}

pub const HTTPS_DEFAULT_PORT: u16 = 8443;
pub const METRICS_DEFAULT_PORT: u16 = 9100;
pub const STORAGE_OBJECTS_DEFAULT_PORT: u16 = 9000;
pub const VSOCK_DEFAULT_PORT: u16 = 8443;

impl ListenerKind {
    #[must_use]
    pub const fn descriptor(self) -> KindDescriptor {
        let (transport, default_port, client_auth) = match self {
            Self::LocalAdmin | Self::GuestAgent => (Transport::Unix, None, ClientAuth::None),
            Self::NetworkAdmin | Self::Cluster => (
                Transport::Tls,
                Some(HTTPS_DEFAULT_PORT),
                ClientAuth::Required,
            ),
            Self::Metrics => (
                Transport::Tls,
                Some(METRICS_DEFAULT_PORT),
                ClientAuth::Optional,
            ),
            Self::StorageObjects => (
                Transport::Tls,
                Some(STORAGE_OBJECTS_DEFAULT_PORT),
                ClientAuth::None,
            ),
            Self::VmConsole => (Transport::Vsock, Some(VSOCK_DEFAULT_PORT), ClientAuth::None),
        };
        KindDescriptor {
            transport,
            default_port,
            client_auth,
        }
    }

    #[must_use]
    pub const fn transport(self) -> Transport {
        self.descriptor().transport
    }

    /// Kinds whose address can be changed at runtime.
    #[must_use]
    pub const fn is_network_capable(self) -> bool {
        !matches!(self.transport(), Transport::Unix)
    }

    /// Canonical listen address for this kind. An empty address stays empty.
    ///
    /// # Errors
    /// Return `Err` if address is malformed for the kind's transport
    pub fn canonical_address(self, address: &str) -> anyhow::Result<String> {
        let address = address.trim();
        if address.is_empty() {
            return Ok(String::new());
        }
        let default_port = self.descriptor().default_port.unwrap_or_default();
        match self.transport() {
            Transport::Unix => Ok(address.to_owned()),
            Transport::Tls => canonical_network_address(address, default_port),
            Transport::Vsock => canonical_vsock_address(address, u32::from(default_port)),
        }
    }
}

/// One live endpoint, as reported by the local admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub kind: ListenerKind,
    pub address: String,
    pub inherited: bool,
}

/// Body of an address change request. Empty address disables the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUpdate {
    pub address: String,
}
