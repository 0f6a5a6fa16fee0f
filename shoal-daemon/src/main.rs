// Shoal daemon: share-directory sync node (listener, outbound connector,
// scanner).

mod config;
mod store;

use std::sync::Arc;

use anyhow::Context;
use shoal_core::{HostPort, LocalNode};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::store::DiskStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("shoal-daemon {} — peer-to-peer share-directory sync node", VERSION);
    println!();
    println!("USAGE:");
    println!("    shoal-daemon [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Watches a share directory and replicates files and directory");
    println!("    structure with connected peers over line-delimited JSON on TCP.");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/shoal/config.toml");
    println!("      /etc/shoal/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      host = \"198.51.100.7\"");
    println!("      port = 8111");
    println!("      share_dir = \"/srv/shoal\"");
    println!("      block_size = 8192");
    println!("      max_incoming_connections = 10");
    println!("      peers = [\"peer-a.local:8111\", \"peer-b.local:8111\"]");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    SHOAL_HOST, SHOAL_PORT, SHOAL_SHARE_DIR, SHOAL_BLOCK_SIZE,");
    println!("    SHOAL_MAX_INCOMING_CONNECTIONS, SHOAL_PEERS (comma separated),");
    println!("    SHOAL_SCAN_INTERVAL_SECS");
    println!();
    println!("    RUST_LOG controls log verbosity (default: info).");
}

fn main() -> anyhow::Result<()> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("shoal-daemon {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("shoal-daemon: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let advertised = HostPort::new(cfg.host.clone(), cfg.port);
    let store = Arc::new(
        DiskStore::new(&cfg.share_dir)
            .with_context(|| format!("opening share directory {}", cfg.share_dir.display()))?,
    );
    let node = LocalNode::new(
        store.clone(),
        advertised.clone(),
        cfg.block_size,
        cfg.max_incoming_connections,
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(("0.0.0.0", cfg.port))
            .await
            .with_context(|| format!("binding port {}", cfg.port))?;
        info!(%advertised, share = %cfg.share_dir.display(), "listening");

        let accept_node = node.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if let Err(err) = accept_node.clone().accept(stream).await {
                            warn!(%err, "failed to start inbound session");
                        }
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        break;
                    }
                }
            }
        });

        let connect_node = node.clone();
        let peers = cfg.peers.clone();
        tokio::spawn(async move {
            for peer in peers {
                let remote: HostPort = match peer.parse() {
                    Ok(remote) => remote,
                    Err(err) => {
                        warn!(peer = %peer, %err, "bad peer address in config");
                        continue;
                    }
                };
                match TcpStream::connect((remote.host.as_str(), remote.port)).await {
                    Ok(stream) => {
                        match connect_node.clone().connect(stream, remote.clone()).await {
                            Ok(_) => info!(peer = %remote, "connected"),
                            Err(err) => warn!(peer = %remote, %err, "handshake send failed"),
                        }
                    }
                    Err(err) => warn!(peer = %remote, %err, "connect failed"),
                }
            }
        });

        let scan_node = node.clone();
        let scan_store = store.clone();
        let interval = std::time::Duration::from_secs(cfg.scan_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let store = scan_store.clone();
                let events = match tokio::task::spawn_blocking(move || store.scan()).await {
                    Ok(Ok(events)) => events,
                    Ok(Err(err)) => {
                        warn!(%err, "share scan failed");
                        continue;
                    }
                    Err(err) => {
                        warn!(%err, "share scan panicked");
                        continue;
                    }
                };
                for event in &events {
                    scan_node.process_file_system_event(event).await;
                }
            }
        });

        shutdown_signal().await
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown the runtime and its
/// tasks exit; open sessions drop with it.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
