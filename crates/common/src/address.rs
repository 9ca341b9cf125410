// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use anyhow::{bail, Context};
pub use tokio_vsock::VMADDR_CID_ANY;
use tokio_vsock::{VsockAddr, VMADDR_CID_HOST, VMADDR_CID_LOCAL};

#[derive(Clone, Debug, PartialEq)]
pub enum EndpointAddress {
    Tcp { addr: String, port: u16 },
    Unix(String),     // "/path/to/sock"  (same host only)
    Vsock(VsockAddr), // cid+port
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { addr, port } if addr.contains(':') => write!(f, "[{addr}]:{port}"),
            Self::Tcp { addr, port } => write!(f, "{addr}:{port}"),
            Self::Unix(path) => write!(f, "unix:{path}"),
            Self::Vsock(vs) => write!(f, "vsock:{}:{}", vs.cid(), vs.port()),
        }
    }
}

/// Accepts `unix:/path`, a bare absolute path, `vsock:CID:PORT` or `host:port`.
impl FromStr for EndpointAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(path.to_owned()));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(s.to_owned()));
        }
        if let Some(vs) = s.strip_prefix("vsock:") {
            if !vs.contains(':') {
                bail!("Address {s} should be in vsock:CID:PORT format")
            }
            return parse_vsock_addr(vs, 0).map(Self::Vsock);
        }
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Self::Tcp {
                addr: sa.ip().to_string(),
                port: sa.port(),
            });
        }
        let Some((addr, port)) = s.rsplit_once(':') else {
            bail!("Address {s} should be in HOST:PORT format")
        };
        let port = port
            .parse()
            .with_context(|| format!("While parsing port part of {s}"))?;
        Ok(Self::Tcp {
            addr: addr.to_owned(),
            port,
        })
    }
}

/// Normalize a listen address so it always carries an explicit port.
///
/// Bare IPs and host names get `default_port`, `:port` means all interfaces,
/// IPv6 addresses are bracketed. Host names are not resolved.
///
/// # Errors
/// Return `Err` if the port is not a number or the host part is malformed
pub fn canonical_network_address(address: &str, default_port: u16) -> anyhow::Result<String> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port).to_string());
    }
    if let Some(inner) = address.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
        let ip: Ipv6Addr = inner
            .parse()
            .with_context(|| format!("Invalid IPv6 address in {address}"))?;
        return Ok(SocketAddr::new(ip.into(), default_port).to_string());
    }
    if let Ok(sa) = address.parse::<SocketAddr>() {
        return Ok(sa.to_string());
    }
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in address {address}"))?;
            if host.is_empty() {
                return Ok(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port).to_string());
            }
            check_hostname(host)?;
            Ok(format!("{host}:{port}"))
        }
        None => {
            check_hostname(address)?;
            Ok(format!("{address}:{default_port}"))
        }
    }
}

fn check_hostname(host: &str) -> anyhow::Result<()> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        bail!("Invalid host name {host}")
    }
    Ok(())
}

/// Parse `CID:PORT` or bare `CID`; the latter gets `default_port`.
///
/// # Errors
/// Return `Err` if vsock address is invalid
pub fn parse_vsock_addr(addr: &str, default_port: u32) -> anyhow::Result<VsockAddr> {
    let (cid, port) = match addr.split_once(':') {
        Some((cid, port)) => (
            cid,
            port.parse()
                .with_context(|| format!("While parsing port part of {addr}"))?,
        ),
        None => (addr, default_port),
    };
    let cid = match cid {
        "any" => VMADDR_CID_ANY,
        "local" => VMADDR_CID_LOCAL,
        "host" => VMADDR_CID_HOST,
        cid => cid
            .parse()
            .with_context(|| format!("Address {addr} should be in CID:PORT format"))?,
    };
    Ok(VsockAddr::new(cid, port))
}

/// Numeric `cid:port` form of a vsock listen address.
///
/// # Errors
/// Return `Err` if vsock address is invalid
pub fn canonical_vsock_address(addr: &str, default_port: u32) -> anyhow::Result<String> {
    let vs = parse_vsock_addr(addr, default_port)?;
    Ok(format!("{}:{}", vs.cid(), vs.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_network_address() -> anyhow::Result<()> {
        let cases = [
            ("127.0.0.1", "127.0.0.1:9100"),
            ("127.0.0.1:9999", "127.0.0.1:9999"),
            ("::1", "[::1]:9100"),
            ("[::1]", "[::1]:9100"),
            ("[::1]:9101", "[::1]:9101"),
            ("[0:0::1]:9101", "[::1]:9101"),
            (":9102", "[::]:9102"),
            ("localhost", "localhost:9100"),
            ("node1.example.com:443", "node1.example.com:443"),
        ];
        for (input, expected) in cases {
            assert_eq!(canonical_network_address(input, 9100)?, expected, "{input}");
        }
        Ok(())
    }

    #[test]
    fn test_canonical_network_address_rejects_garbage() {
        for bad in ["127.0.0.1:port", "host:99999", "::1:8443:x", "bad host", "[zz]"] {
            assert!(canonical_network_address(bad, 8443).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_vsock_addresses() -> anyhow::Result<()> {
        let vs = parse_vsock_addr("host:1024", 8443)?;
        assert_eq!((vs.cid(), vs.port()), (VMADDR_CID_HOST, 1024));

        assert_eq!(canonical_vsock_address("3", 8443)?, "3:8443");
        assert_eq!(
            canonical_vsock_address("any", 8443)?,
            format!("{VMADDR_CID_ANY}:8443")
        );
        assert_eq!(parse_vsock_addr("any:5", 0)?.cid(), u32::MAX);
        assert!(parse_vsock_addr("guest:1", 8443).is_err());
        Ok(())
    }

    #[test]
    fn test_endpoint_address_from_str() -> anyhow::Result<()> {
        assert_eq!(
            "unix:/run/hvd/unix.socket".parse::<EndpointAddress>()?,
            EndpointAddress::Unix("/run/hvd/unix.socket".into())
        );
        assert_eq!(
            "/tmp/sock".parse::<EndpointAddress>()?,
            EndpointAddress::Unix("/tmp/sock".into())
        );
        assert_eq!(
            "[::1]:8443".parse::<EndpointAddress>()?,
            EndpointAddress::Tcp {
                addr: "::1".into(),
                port: 8443
            }
        );
        let local = "localhost:9100".parse::<EndpointAddress>()?;
        assert_eq!(local.to_string(), "localhost:9100");
        let vsock = "vsock:3:8443".parse::<EndpointAddress>()?;
        assert_eq!(vsock, EndpointAddress::Vsock(VsockAddr::new(3, 8443)));
        assert_eq!(vsock.to_string(), "vsock:3:8443");
        assert!("vsock:3".parse::<EndpointAddress>().is_err());
        Ok(())
    }
}
