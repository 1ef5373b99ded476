// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Server Configuration
//!
//! Environment-driven configuration for the server binary.

use std::time::Duration;

/// Which transport the server runs. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Direct TCP listener with app-level password authentication.
    Tcp,
    /// Persistent outbound link through the cloud relay.
    Relay,
}

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Active transport (`TETHER_PROXY`: `tcp` or `relay`).
    pub proxy: ProxyKind,
    /// TCP listen port (`TETHER_PORT`).
    pub tcp_port: u16,
    /// Shared passphrase for the encryption envelope and the direct-TCP
    /// handshake (`TETHER_PASSWORD`). Unset disables payload encryption.
    pub password: Option<String>,
    /// Relay endpoint URL (`TETHER_RELAY_URL`).
    pub relay_url: String,
    /// Relay account token (`TETHER_ACCOUNT_TOKEN`).
    pub account_token: String,
    /// Human-readable server name sent in the handshake response
    /// (`TETHER_SERVER_NAME`).
    pub server_name: String,
    /// How long a client may stay connected without completing the
    /// authentication handshake.
    pub handshake_timeout: Duration,
    /// Keepalive ping broadcast interval (persistent transports only).
    pub keepalive_interval: Duration,
    /// How long after a keepalive ping a connection may stay silent.
    pub ping_timeout: Duration,
    /// Idle timeout for in-flight chunked file uploads.
    pub download_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            proxy: ProxyKind::Tcp,
            tcp_port: 1359,
            password: None,
            relay_url: "wss://connect.tether.app/link".to_string(),
            account_token: String::new(),
            server_name: "Tether Server".to_string(),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(300),
            ping_timeout: Duration::from_secs(60),
            download_idle_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();

        let proxy = match std::env::var("TETHER_PROXY").as_deref() {
            Ok("relay") => ProxyKind::Relay,
            _ => ProxyKind::Tcp,
        };

        ServerConfig {
            proxy,
            tcp_port: env_parse("TETHER_PORT", defaults.tcp_port),
            password: std::env::var("TETHER_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            relay_url: env_or("TETHER_RELAY_URL", &defaults.relay_url),
            account_token: env_or("TETHER_ACCOUNT_TOKEN", ""),
            server_name: env_or("TETHER_SERVER_NAME", &defaults.server_name),
            handshake_timeout: Duration::from_secs(env_parse(
                "TETHER_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout.as_secs(),
            )),
            keepalive_interval: Duration::from_secs(env_parse(
                "TETHER_KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval.as_secs(),
            )),
            ping_timeout: Duration::from_secs(env_parse(
                "TETHER_PING_TIMEOUT_SECS",
                defaults.ping_timeout.as_secs(),
            )),
            download_idle_timeout: Duration::from_secs(env_parse(
                "TETHER_DOWNLOAD_IDLE_TIMEOUT_SECS",
                defaults.download_idle_timeout.as_secs(),
            )),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
