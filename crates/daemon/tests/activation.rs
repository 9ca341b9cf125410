// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hvd::api::{self, Hello};
use hvd::endpoints::{
    ActivationHint, EndpointConfig, EndpointError, Endpoints, LifecycleState, Provenance,
};
use hvd::tls::CertBundle;
use hvd::types::ListenerKind;
use hvd_client::endpoint::{EndpointConfig as ClientConfig, TlsConfig};
use nix::unistd::dup2;
use serial_test::serial;

// High enough not to clash with descriptors the test harness opens
const BASE_FD: RawFd = 700;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn config(dir: &Path, endpoints: &Arc<Endpoints>) -> anyhow::Result<EndpointConfig> {
    let cert = CertBundle::from_files(
        &fixture("server.crt"),
        &fixture("server.key"),
        Some(&fixture("ca.crt")),
    )?;
    let mut config = EndpointConfig::new(dir, Arc::new(cert));
    config.servers = api::default_servers(endpoints);
    config.activation = ActivationHint::take_from_env()?;
    config.listen_fds_start = BASE_FD;
    Ok(config)
}

fn hand_off(pid: u32, fds: usize) {
    env::set_var("LISTEN_PID", pid.to_string());
    env::set_var("LISTEN_FDS", fds.to_string());
}

fn assert_cleared() {
    assert!(env::var("LISTEN_PID").is_err());
    assert!(env::var("LISTEN_FDS").is_err());
}

#[tokio::test]
#[serial]
async fn test_inherited_listeners_are_reused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("unix.socket");

    let unix = std::os::unix::net::UnixListener::bind(&socket)?;
    let tcp = std::net::TcpListener::bind("127.0.0.1:0")?;
    let network = tcp.local_addr()?.to_string();
    dup2(unix.as_raw_fd(), BASE_FD)?;
    dup2(tcp.as_raw_fd(), BASE_FD + 1)?;
    drop(unix);
    drop(tcp);

    hand_off(std::process::id(), 2);
    let endpoints = Arc::new(Endpoints::unstarted());
    endpoints.up(config(dir.path(), &endpoints)?).await?;
    assert_cleared();

    for kind in [ListenerKind::LocalAdmin, ListenerKind::NetworkAdmin] {
        assert_eq!(endpoints.provenance(kind).await, Some(Provenance::Inherited));
    }
    assert_eq!(
        endpoints.address(ListenerKind::LocalAdmin).await,
        socket.display().to_string()
    );
    assert_eq!(endpoints.address(ListenerKind::NetworkAdmin).await, network);
    assert!(endpoints.addresses().await.iter().all(|e| e.inherited));

    let local: Hello = ClientConfig::unix(socket.display().to_string())
        .get("/")
        .await?
        .json()?;
    assert_eq!(local.kind, ListenerKind::LocalAdmin);

    let remote = ClientConfig {
        transport: network.parse()?,
        tls: Some(TlsConfig {
            ca_cert_file_path: fixture("ca.crt"),
            cert_file_path: Some(fixture("client.crt")),
            key_file_path: Some(fixture("client.key")),
            tls_name: Some("localhost".to_owned()),
        }),
    };
    let hello: Hello = remote.get("/").await?.json()?;
    assert_eq!(hello.kind, ListenerKind::NetworkAdmin);

    endpoints.down().await?;
    // Created by the supervisor, left for it to clean up
    assert!(socket.exists());

    // Handoff was consumed, a fresh instance binds its own sockets
    let again = Arc::new(Endpoints::unstarted());
    again.up(config(dir.path(), &again)?).await?;
    assert_eq!(
        again.provenance(ListenerKind::LocalAdmin).await,
        Some(Provenance::Bound)
    );
    assert_eq!(again.provenance(ListenerKind::NetworkAdmin).await, None);
    again.down().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_foreign_handoff_is_ignored() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    hand_off(std::process::id() + 1, 1);

    let endpoints = Arc::new(Endpoints::unstarted());
    endpoints.up(config(dir.path(), &endpoints)?).await?;
    assert_cleared();
    assert_eq!(
        endpoints.provenance(ListenerKind::LocalAdmin).await,
        Some(Provenance::Bound)
    );
    endpoints.down().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_missing_descriptor_is_fatal() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let unix = std::os::unix::net::UnixListener::bind(dir.path().join("supervisor.socket"))?;
    dup2(unix.as_raw_fd(), BASE_FD)?;
    drop(unix);
    // Declares two, only one is open
    hand_off(std::process::id(), 2);

    let endpoints = Arc::new(Endpoints::unstarted());
    let err = endpoints
        .up(config(dir.path(), &endpoints)?)
        .await
        .unwrap_err();
    assert!(matches!(err, EndpointError::Activation(_)), "{err}");
    assert_cleared();
    assert_eq!(endpoints.state().await, LifecycleState::Unstarted);
    assert!(!dir.path().join("unix.socket").exists());
    Ok(())
}
