// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::convert::TryFrom;
use std::net::IpAddr;
use x509_parser::prelude::*;

/// Identity claims taken from a verified peer certificate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityInfo {
    dns_names: Vec<String>,
    ip_addrs: Vec<IpAddr>,
}

impl SecurityInfo {
    #[must_use]
    pub fn check_address(&self, ia: &IpAddr) -> bool {
        self.ip_addrs.iter().any(|a| a == ia)
    }

    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.dns_names.first().map(String::as_str)
    }
}

impl TryFrom<&[u8]> for SecurityInfo {
    type Error = X509Error;
    fn try_from(cert: &[u8]) -> Result<Self, Self::Error> {
        let mut this = Self::default();
        let (_, x509) = parse_x509_certificate(cert)?;
        for ext in x509.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(s) => this.dns_names.push((*s).to_string()),
                        GeneralName::IPAddress(b) => {
                            if let Ok(v4) = <[u8; 4]>::try_from(*b) {
                                this.ip_addrs.push(IpAddr::from(v4));
                            } else if let Ok(v6) = <[u8; 16]>::try_from(*b) {
                                this.ip_addrs.push(IpAddr::from(v6));
                            }
                        }
                        _ => (),
                    }
                }
            }
        }
        Ok(this)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_CERT: &[u8] = include_bytes!("../../tests/fixtures/client.crt");

    #[test]
    fn test_security_info_from_certificate() -> anyhow::Result<()> {
        let der = rustls_pemfile::certs(&mut &*CLIENT_CERT)
            .next()
            .expect("fixture has a certificate")?;
        let info = SecurityInfo::try_from(der.as_ref())?;
        assert_eq!(info.hostname(), Some("node2.cluster"));
        assert!(info.check_address(&"127.0.0.1".parse()?));
        assert!(!info.check_address(&"10.0.0.1".parse()?));
        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SecurityInfo::try_from(&b"not a certificate"[..]).is_err());
    }
}
