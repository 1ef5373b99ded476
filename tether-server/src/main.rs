// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tether Server Binary
//!
//! Wires the configured transport to the connection manager and runs until
//! interrupted.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use tether_server::{
    ConnectionManager, ConnectionRegistry, DataProxy, InMemoryStore, ManagerConfig, NoUpdates,
    ProxyKind, RelayProxy, RelayProxyConfig, ServerConfig, TcpProxy, TcpProxyConfig,
    UnavailableAutomation,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether_server=info".parse()?),
        )
        .init();

    // Load configuration
    let config = ServerConfig::from_env();
    info!("Starting Tether Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Transport: {:?}", config.proxy);

    let registry = Arc::new(ConnectionRegistry::new());
    let (event_tx, event_rx) = mpsc::channel(256);

    let proxy: Arc<dyn DataProxy> = match config.proxy {
        ProxyKind::Tcp => Arc::new(TcpProxy::new(
            TcpProxyConfig {
                port: config.tcp_port,
                password: config.password.clone(),
            },
            registry.clone(),
            event_tx,
        )),
        ProxyKind::Relay => Arc::new(RelayProxy::new(
            RelayProxyConfig {
                url: config.relay_url.clone(),
                account_token: config.account_token.clone(),
                password: config.password.clone(),
                handshake_timeout: config.handshake_timeout,
            },
            registry.clone(),
            event_tx,
        )),
    };

    let manager = ConnectionManager::new(
        proxy.clone(),
        registry,
        Arc::new(InMemoryStore::new()),
        Arc::new(UnavailableAutomation),
        Arc::new(NoUpdates),
        ManagerConfig::from_server(&config),
    );

    proxy.start().await?;
    let event_loop = tokio::spawn(manager.run(event_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    proxy.stop().await;
    let _ = event_loop.await;
    Ok(())
}
