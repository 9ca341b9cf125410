// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use hvd::endpoint::TlsConfig;
use hvd::types::ListenerKind;
use hvd_client::client::AdminClient;
use hvd_common::address::EndpointAddress;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)] // requires `derive` feature
#[command(name = "hvd-cli")]
#[command(about = "Control a running hvd", long_about = None)]
struct Cli {
    /// Daemon address: unix socket path or host:port for the network admin API
    #[arg(long, env = "HVD_SOCKET", default_value = "/var/lib/hvd/unix.socket")]
    socket: String,

    #[arg(long, env = "HVD_CA_CERT")]
    cacert: Option<PathBuf>,

    #[arg(long, env = "HVD_CERT")]
    cert: Option<PathBuf>,

    #[arg(long, env = "HVD_KEY")]
    key: Option<PathBuf>,

    /// Name checked against server certificate
    #[arg(long)]
    name: Option<String>,

    /// Print JSON instead of a table
    #[arg(long, default_value_t = false)]
    as_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List live endpoints
    Endpoints,
    /// Move an endpoint to a new address, empty address disables it
    SetAddress { kind: ListenerKind, address: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hvd::trace_init()?;

    let cli = Cli::parse();
    info!("CLI is {:#?}", cli);

    let address: EndpointAddress = cli.socket.parse()?;
    let tls = cli.cacert.map(|ca| TlsConfig {
        ca_cert_file_path: ca,
        cert_file_path: cli.cert,
        key_file_path: cli.key,
        tls_name: cli.name,
    });
    let admin = AdminClient::new(address, tls);

    match cli.command {
        Commands::Endpoints => {
            let endpoints = admin.list_endpoints().await?;
            if cli.as_json {
                println!("{}", serde_json::to_string(&endpoints)?);
            } else {
                for endpoint in endpoints {
                    let inherited = if endpoint.inherited { " (inherited)" } else { "" };
                    println!("{:<16} {}{inherited}", endpoint.kind, endpoint.address);
                }
            }
        }
        Commands::SetAddress { kind, address } => {
            admin.set_address(kind, &address).await?;
        }
    }
    Ok(())
}
