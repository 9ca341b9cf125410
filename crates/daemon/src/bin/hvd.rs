// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hvd::api;
use hvd::endpoints::{ActivationHint, EndpointConfig, Endpoints};
use hvd::tls::CertBundle;
use hvd::types::ListenerKind;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

#[derive(Debug, Parser)] // requires `derive` feature
#[command(name = "hvd")]
#[command(about = "Hypervisor daemon", long_about = None)]
struct Cli {
    /// State directory, unix sockets are created here
    #[arg(long, env = "HVD_DIR", default_value = "/var/lib/hvd")]
    dir: PathBuf,

    /// Local admin socket, defaults to <dir>/unix.socket
    #[arg(long, env = "HVD_SOCKET")]
    socket: Option<PathBuf>,

    #[arg(long, env = "HVD_CERT")]
    cert: PathBuf,

    #[arg(long, env = "HVD_KEY")]
    key: PathBuf,

    /// CA used to verify client certificates
    #[arg(long, env = "HVD_CA_CERT")]
    ca: Option<PathBuf>,

    #[arg(long)]
    network_address: Option<String>,

    #[arg(long)]
    cluster_address: Option<String>,

    #[arg(long)]
    metrics_address: Option<String>,

    #[arg(long)]
    storage_address: Option<String>,

    /// VM console socket (cid:port)
    #[arg(long)]
    vsock_address: Option<String>,

    /// Serve the guest agent socket under <dir>/guest-agent
    #[arg(long)]
    guest_agent: bool,
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {},
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Environment is only touched while the process is single-threaded
    let activation = ActivationHint::take_from_env().context("Reading socket activation")?;
    let cli = Cli::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli, activation))
}

async fn run(cli: Cli, activation: Option<ActivationHint>) -> anyhow::Result<()> {
    hvd::trace_init()?;
    debug!("CLI is {:#?}", cli);

    let cert = CertBundle::from_files(&cli.cert, &cli.key, cli.ca.as_deref())?;
    let endpoints = Arc::new(Endpoints::unstarted());

    let mut config = EndpointConfig::new(&cli.dir, Arc::new(cert));
    config.unix_socket = cli.socket;
    config.activation = activation;
    config.servers = api::default_servers(&endpoints);
    if cli.guest_agent {
        let socket = config.guest_agent_socket();
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Creating {}", parent.display()))?;
        }
        config = config.with_server(ListenerKind::GuestAgent, api::kind_router());
    }
    let addresses = [
        (ListenerKind::NetworkAdmin, cli.network_address),
        (ListenerKind::Cluster, cli.cluster_address),
        (ListenerKind::Metrics, cli.metrics_address),
        (ListenerKind::StorageObjects, cli.storage_address),
        (ListenerKind::VmConsole, cli.vsock_address),
    ];
    for (kind, address) in addresses {
        if let Some(address) = address {
            config = config.with_address(kind, address);
        }
    }

    endpoints.up(config).await.context("Starting endpoints")?;
    for endpoint in endpoints.addresses().await {
        info!(kind = %endpoint.kind, address = %endpoint.address, "Serving");
    }

    shutdown_signal().await?;
    info!("Shutting down");
    endpoints.down().await?;
    Ok(())
}
