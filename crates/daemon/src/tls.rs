// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use hvd_common::types::ClientAuth;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

/// Server key pair shared by every TLS listener, plus an optional CA used to
/// verify client certificates.
pub struct CertBundle {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca: Vec<CertificateDer<'static>>,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("certs", &self.certs.len())
            .field("ca", &self.ca.len())
            .finish_non_exhaustive()
    }
}

impl Clone for CertBundle {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
            ca: self.ca.clone(),
        }
    }
}

fn parse_certs(pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &*pem).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("No certificates found in PEM data")
    }
    Ok(certs)
}

impl CertBundle {
    /// # Errors
    /// Fails if PEM data have no certificate or private key
    pub fn from_pem(cert: &[u8], key: &[u8], ca: Option<&[u8]>) -> anyhow::Result<Self> {
        let certs = parse_certs(cert).context("Parsing server certificate")?;
        let key = rustls_pemfile::private_key(&mut &*key)
            .context("Parsing private key")?
            .ok_or_else(|| anyhow!("No private key found in PEM data"))?;
        let ca = match ca {
            Some(ca) => parse_certs(ca).context("Parsing CA certificate")?,
            None => Vec::new(),
        };
        Ok(Self { certs, key, ca })
    }

    /// # Errors
    /// Fails if files can't be read or contain no usable PEM data
    pub fn from_files(cert: &Path, key: &Path, ca: Option<&Path>) -> anyhow::Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).with_context(|| format!("Reading {}", path.display()))
        };
        let ca = ca.map(read).transpose()?;
        Self::from_pem(&read(cert)?, &read(key)?, ca.as_deref())
            .with_context(|| format!("Loading key pair {}", cert.display()))
    }

    #[must_use]
    pub fn has_ca(&self) -> bool {
        !self.ca.is_empty()
    }

    /// Build rustls server config enforcing `auth` policy.
    ///
    /// `Optional` without CA degrades to anonymous TLS, `Required` without CA
    /// is an error.
    ///
    /// # Errors
    /// Fails if policy can't be satisfied or rustls rejects the key pair
    pub fn server_config(&self, auth: ClientAuth) -> anyhow::Result<Arc<ServerConfig>> {
        let provider = Arc::new(ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        let builder = match auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Optional if !self.has_ca() => builder.with_no_client_auth(),
            ClientAuth::Required if !self.has_ca() => {
                bail!("Client authentication {auth} needs a CA certificate")
            }
            ClientAuth::Optional | ClientAuth::Required => {
                let mut roots = RootCertStore::empty();
                for ca in &self.ca {
                    roots.add(ca.clone())?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                let verifier = if auth == ClientAuth::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                builder.with_client_cert_verifier(verifier.build()?)
            }
        };
        let mut config = builder.with_single_cert(self.certs.clone(), self.key.clone_key())?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}
