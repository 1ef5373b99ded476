// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport Layer
//!
//! The [`DataProxy`] contract and its two implementations: a direct TCP
//! listener requiring an app-level password handshake, and a relay client
//! proxying many logical clients through one persistent cloud WebSocket.
//!
//! Transport-specific framing (length-prefixed for TCP, client-ID
//! multiplexed for the relay) stays entirely inside each implementation;
//! the manager only sees [`ProxyEvent`]s and decrypted frame payloads.

mod relay;
mod tcp;

pub use relay::{RelayProxy, RelayProxyConfig};
pub use tcp::{TcpProxy, TcpProxyConfig};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::connection::{ClientConnection, ClientId};

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not running")]
    NotRunning,
    #[error("no such client: {0}")]
    UnknownClient(ClientId),
    #[error("client {0} is disconnected")]
    ClientGone(ClientId),
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("push notifications unsupported on this transport")]
    PushUnsupported,
}

/// One outbound wire frame plus the caller's per-frame encryption decision.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub data: Vec<u8>,
    pub encrypt: bool,
}

/// Destination of a send: one client, or every connection held at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Broadcast,
    Client(ClientId),
}

/// Semantic state the transport reports when it stops.
///
/// For the relay this is the classification of the close code received on
/// the persistent link; the direct TCP transport only ever reports
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Orderly stop requested by the server.
    Stopped,
    /// Generic network failure; the only state eligible for automatic
    /// reconnection.
    ErrNetwork,
    /// The relay rejected the registration request.
    ErrBadRequest,
    /// The server speaks a protocol version the relay no longer accepts.
    ErrOutdatedProtocol,
    /// The relay could not validate the account.
    ErrAccountValidation,
    /// The account token is stale and must be refreshed.
    ErrTokenExpired,
    /// The account exists but is not active.
    ErrAccountInactive,
    /// Another server instance registered with the same account.
    ErrConnectedElsewhere,
    /// Unrecognized close code; treated as an external failure and never
    /// retried automatically.
    ErrExternal,
}

/// Relay close codes carried on the persistent link. Part of the wire
/// contract with the relay service.
pub mod close_code {
    pub const BAD_REQUEST: u16 = 4000;
    pub const OUTDATED_PROTOCOL: u16 = 4001;
    pub const ACCOUNT_VALIDATION: u16 = 4002;
    pub const TOKEN_EXPIRED: u16 = 4003;
    pub const ACCOUNT_INACTIVE: u16 = 4004;
    pub const CONNECTED_ELSEWHERE: u16 = 4005;
}

impl ServerState {
    /// Classifies a WebSocket close code into a semantic server state.
    ///
    /// Standard WebSocket codes (and a missing close frame) mean the link
    /// died for network reasons; the relay's reserved 4xxx codes carry
    /// specific failures; anything else is an external error.
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            None => ServerState::ErrNetwork,
            Some(close_code::BAD_REQUEST) => ServerState::ErrBadRequest,
            Some(close_code::OUTDATED_PROTOCOL) => ServerState::ErrOutdatedProtocol,
            Some(close_code::ACCOUNT_VALIDATION) => ServerState::ErrAccountValidation,
            Some(close_code::TOKEN_EXPIRED) => ServerState::ErrTokenExpired,
            Some(close_code::ACCOUNT_INACTIVE) => ServerState::ErrAccountInactive,
            Some(close_code::CONNECTED_ELSEWHERE) => ServerState::ErrConnectedElsewhere,
            Some(code) if code < 4000 => ServerState::ErrNetwork,
            Some(_) => ServerState::ErrExternal,
        }
    }

    /// Whether the reconnect policy may schedule another attempt.
    pub fn allows_reconnect(self) -> bool {
        self == ServerState::ErrNetwork
    }
}

/// Events a transport reports to the connection manager.
#[derive(Debug)]
pub enum ProxyEvent {
    /// The transport is up and accepting/relaying connections.
    Started,
    /// The transport went down, with the reason.
    Stopped(ServerState),
    /// A network-level connection was accepted.
    ClientConnected(Arc<ClientConnection>),
    /// A connection left the live set.
    ClientDisconnected(ClientId),
    /// One complete inbound frame, already decrypted. `encrypted` records
    /// whether it arrived under the shared password; the authentication
    /// handshake only accepts a transmission check that did.
    Frame {
        client: ClientId,
        data: Vec<u8>,
        encrypted: bool,
    },
}

/// Polymorphic transport contract.
///
/// Exactly one transport is active at a time for the whole process. The
/// manager owns the transport; the transport reports back through its
/// event channel only.
#[async_trait]
pub trait DataProxy: Send + Sync {
    /// Whether clients must complete the app-level password handshake.
    /// False for the relay, which authenticates at the transport level.
    fn requires_authentication(&self) -> bool;

    /// Whether the server must actively keep connections alive. True for
    /// direct TCP; the relay manages its own liveness.
    fn requires_persistence(&self) -> bool;

    /// Starts the transport. Starting while already active is a no-op.
    async fn start(&self) -> Result<(), TransportError>;

    /// Stops the transport, tearing down all connections and timers.
    /// Stopping while not started is a no-op.
    async fn stop(&self);

    /// Sends a frame to one client or to every connection held at send
    /// time. Frames to a single client are delivered in send order.
    async fn send(&self, target: SendTarget, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Removes the client from the live set and closes its channel.
    async fn disconnect(&self, client: ClientId);

    /// Best-effort out-of-band notification for offline delivery. Only the
    /// relay transport implements this meaningfully.
    async fn send_push_notification(
        &self,
        _payload: Vec<u8>,
        _version: i32,
    ) -> Result<(), TransportError> {
        Err(TransportError::PushUnsupported)
    }
}
