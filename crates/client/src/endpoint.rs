// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_vsock::VsockStream;
use tracing::{debug, info};

use hvd_common::address::EndpointAddress;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_cert_file_path: PathBuf,

    // Client identity, presented only when both are set
    pub cert_file_path: Option<PathBuf>,
    pub key_file_path: Option<PathBuf>,

    // Name checked against server certificate, falls back to the TCP host
    pub tls_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub transport: EndpointAddress,
    pub tls: Option<TlsConfig>,
}

/// Status and raw body of a finished request.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Reply {
    /// # Errors
    /// Return `Err` if body is not valid JSON for `T`
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body).context("Decoding JSON reply")
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

fn read_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Parsing certificates from {}", path.display()))
}

fn read_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())?
        .ok_or_else(|| anyhow!("No private key in {}", path.display()))
}

impl TlsConfig {
    /// # Errors
    /// Fails if certificates can't be read or rejected by rustls
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(&self.ca_cert_file_path)? {
            roots.add(cert)?;
        }
        let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let config = match (&self.cert_file_path, &self.key_file_path) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(read_certs(cert)?, read_key(key)?)?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(config)
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            transport: EndpointAddress::Unix(path.into()),
            tls: None,
        }
    }

    fn host(&self) -> String {
        match &self.transport {
            EndpointAddress::Tcp { .. } => self.transport.to_string(),
            _ => "localhost".to_owned(),
        }
    }

    async fn connect_stream(&self) -> anyhow::Result<Box<dyn Io>> {
        let stream: Box<dyn Io> = match &self.transport {
            EndpointAddress::Tcp { addr, port } => {
                let tcp = TcpStream::connect((addr.as_str(), *port))
                    .await
                    .with_context(|| format!("Connecting TCP {}", self.transport))?;
                match &self.tls {
                    Some(tls) => {
                        let name = tls.tls_name.clone().unwrap_or_else(|| addr.clone());
                        info!("Using TLS name: {name}");
                        let server_name = ServerName::try_from(name)?;
                        let connector = TlsConnector::from(Arc::new(tls.client_config()?));
                        Box::new(
                            connector
                                .connect(server_name, tcp)
                                .await
                                .with_context(|| format!("TLS handshake with {}", self.transport))?,
                        )
                    }
                    None => Box::new(tcp),
                }
            }
            EndpointAddress::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .await
                    .with_context(|| format!("Connecting unix socket {path}"))?,
            ),
            EndpointAddress::Vsock(vs) => Box::new(
                VsockStream::connect(*vs)
                    .await
                    .with_context(|| format!("Connecting {}", self.transport))?,
            ),
        };
        Ok(stream)
    }

    /// Send one HTTP/1.1 request over a fresh connection.
    ///
    /// # Errors
    /// Fails if connection can't be established or the exchange breaks
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<Reply> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, self.connect_stream())
            .await
            .with_context(|| format!("Timed out connecting {}", self.transport))??;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection closed with error: {e}");
            }
        });

        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, self.host());
        if body.is_some() {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        let request = request.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok(Reply { status, body })
    }

    /// # Errors
    /// Fails if connection can't be established or the exchange breaks
    pub async fn get(&self, path: &str) -> anyhow::Result<Reply> {
        self.request(Method::GET, path, None).await
    }
}
