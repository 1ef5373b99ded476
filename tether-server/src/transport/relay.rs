// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Transport
//!
//! Maintains one persistent outbound WebSocket to the cloud relay and
//! multiplexes every logical client over it. The relay assigns client
//! identifiers and announces them with open/close envelopes; proxied
//! payloads carry a leading marker byte saying whether the body is
//! encrypted.
//!
//! Envelope layout (big-endian):
//!   relay → server  `[i32 type][i32 client?][marker][payload]`
//!   server → relay  `[i32 type][i32 client?][marker][payload]`
//!
//! The link reconnects with exponential backoff, but only after a plain
//! network failure. Any close code the relay sends deliberately (account
//! problems, protocol mismatch, another server online) is terminal.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{decrypt, encrypt, CodecError, Packer, Unpacker, COMM_VERSION};

use crate::connection::{ClientId, ConnectionRegistry};
use crate::transport::{
    DataProxy, OutboundFrame, ProxyEvent, SendTarget, ServerState, TransportError,
};

// Envelope types on the relay link.
const RELAY_CONNECTION_OK: i32 = 0;
const RELAY_CLIENT_OPEN: i32 = 1;
const RELAY_CLIENT_CLOSE: i32 = 2;
const RELAY_PROXY: i32 = 3;
const RELAY_PROXY_BROADCAST: i32 = 4;
const RELAY_DISCONNECT_CLIENT: i32 = 5;
const RELAY_PUSH: i32 = 6;

// Marker byte ahead of every proxied payload. Anything else means the
// sender predates the marker and the whole body is the payload.
const WIRE_ENCRYPTED: u8 = 0xF0;
const WIRE_PLAINTEXT: u8 = 0xF1;
// Sender cannot encrypt at all; body is plaintext.
const WIRE_UNSUPPORTED: u8 = 0xF2;

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_MAX_SHIFT: u32 = 6;

#[derive(Debug, Clone)]
pub struct RelayProxyConfig {
    /// Relay endpoint, e.g. `wss://connect.tether.app/link`.
    pub url: String,
    /// Account token presented at connect time.
    pub account_token: String,
    /// Shared passphrase. `None` disables payload encryption entirely.
    pub password: Option<String>,
    /// How long to wait for the relay's connection acknowledgment.
    pub handshake_timeout: Duration,
}

struct RelayShared {
    registry: Arc<ConnectionRegistry>,
    events: mpsc::Sender<ProxyEvent>,
    password: Option<String>,
    ws_tx: StdMutex<Option<mpsc::Sender<Message>>>,
}

/// Relay implementation of [`DataProxy`].
pub struct RelayProxy {
    config: RelayProxyConfig,
    shared: Arc<RelayShared>,
    state: Mutex<Option<CancellationToken>>,
}

impl RelayProxy {
    pub fn new(
        config: RelayProxyConfig,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::Sender<ProxyEvent>,
    ) -> Self {
        let password = config.password.clone();
        RelayProxy {
            config,
            shared: Arc::new(RelayShared {
                registry,
                events,
                password,
                ws_tx: StdMutex::new(None),
            }),
            state: Mutex::new(None),
        }
    }

    fn ws_sender(&self) -> Result<mpsc::Sender<Message>, TransportError> {
        self.shared
            .ws_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotRunning)
    }
}

#[async_trait::async_trait]
impl DataProxy for RelayProxy {
    fn requires_authentication(&self) -> bool {
        // The relay validated the account before ever opening a client
        // channel to us.
        false
    }

    fn requires_persistence(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *state = Some(cancel.clone());
        drop(state);

        tokio::spawn(run_loop(self.config.clone(), self.shared.clone(), cancel));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.state.lock().await.take() {
            cancel.cancel();
        }
    }

    async fn send(&self, target: SendTarget, frame: OutboundFrame) -> Result<(), TransportError> {
        let ws_tx = self.ws_sender()?;
        let (marker, payload) = encode_client_payload(&frame, self.shared.password.as_deref())
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;

        let mut packer = Packer::with_capacity(payload.len() + 9);
        match target {
            SendTarget::Client(id) => {
                if self.shared.registry.get(id).is_none() {
                    return Err(TransportError::UnknownClient(id));
                }
                packer.pack_int(RELAY_PROXY);
                packer.pack_int(id as i32);
            }
            SendTarget::Broadcast => packer.pack_int(RELAY_PROXY_BROADCAST),
        }
        packer.pack_bytes(&[marker]);
        packer.pack_bytes(&payload);

        ws_tx
            .send(Message::Binary(packer.into_bytes()))
            .await
            .map_err(|_| TransportError::NotRunning)
    }

    async fn disconnect(&self, client: ClientId) {
        if let Ok(ws_tx) = self.ws_sender() {
            let mut packer = Packer::with_capacity(8);
            packer.pack_int(RELAY_DISCONNECT_CLIENT);
            packer.pack_int(client as i32);
            let _ = ws_tx.send(Message::Binary(packer.into_bytes())).await;
        }
        if let Some(conn) = self.shared.registry.remove(client) {
            if conn.mark_disconnected() {
                let _ = self
                    .shared
                    .events
                    .send(ProxyEvent::ClientDisconnected(client))
                    .await;
            }
        }
    }

    async fn send_push_notification(
        &self,
        payload: Vec<u8>,
        version: i32,
    ) -> Result<(), TransportError> {
        let ws_tx = self.ws_sender()?;
        let frame = OutboundFrame {
            data: payload,
            encrypt: true,
        };
        let (marker, payload) = encode_client_payload(&frame, self.shared.password.as_deref())
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;

        let mut packer = Packer::with_capacity(payload.len() + 9);
        packer.pack_int(RELAY_PUSH);
        packer.pack_int(version);
        packer.pack_bytes(&[marker]);
        packer.pack_bytes(&payload);
        ws_tx
            .send(Message::Binary(packer.into_bytes()))
            .await
            .map_err(|_| TransportError::NotRunning)
    }
}

/// Connects, serves, reconnects. Exits when the transport is stopped or a
/// terminal state is reached.
async fn run_loop(config: RelayProxyConfig, shared: Arc<RelayShared>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;
    loop {
        let (handshook, state) = connect_once(&config, &shared, &cancel).await;
        ever_connected |= handshook;

        shared.ws_tx.lock().unwrap().take();
        for conn in shared.registry.drain() {
            if conn.mark_disconnected() {
                let _ = shared
                    .events
                    .send(ProxyEvent::ClientDisconnected(conn.id))
                    .await;
            }
        }
        let _ = shared.events.send(ProxyEvent::Stopped(state)).await;

        // A link that never came up has nothing to restore; a deliberate
        // close from the relay is terminal.
        if cancel.is_cancelled() || !state.allows_reconnect() || !ever_connected {
            break;
        }
        if handshook {
            attempt = 0;
        }

        let delay = backoff_base(attempt) + jitter();
        attempt += 1;
        info!("[relay] reconnecting in {delay:?} (attempt {attempt})");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection lifetime. Returns whether the handshake completed and
/// the state describing why the link ended.
async fn connect_once(
    config: &RelayProxyConfig,
    shared: &Arc<RelayShared>,
    cancel: &CancellationToken,
) -> (bool, ServerState) {
    let url = format!(
        "{}?token={}&communications={}",
        config.url, config.account_token, COMM_VERSION
    );
    let stream = tokio::select! {
        _ = cancel.cancelled() => return (false, ServerState::Stopped),
        connected = connect_async(url.as_str()) => match connected {
            Ok((stream, _response)) => stream,
            Err(err) => {
                debug!("[relay] connect failed: {err}");
                return (false, ServerState::ErrNetwork);
            }
        },
    };
    let (mut sink, mut stream) = stream.split();

    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = ws_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The relay must acknowledge us before any client traffic counts.
    let handshake = tokio::time::timeout(config.handshake_timeout, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let mut unpacker = Unpacker::new(&data);
                    return match unpacker.unpack_int() {
                        Ok(RELAY_CONNECTION_OK) => Ok(()),
                        _ => Err(ServerState::ErrBadRequest),
                    };
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(ServerState::from_close_code(
                        frame.map(|f| u16::from(f.code)),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(ServerState::ErrNetwork),
            }
        }
    })
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(state)) => {
            writer.abort();
            return (false, state);
        }
        Err(_elapsed) => {
            warn!("[relay] handshake timed out");
            writer.abort();
            return (false, ServerState::ErrNetwork);
        }
    }

    info!("[relay] connected to {}", config.url);
    shared.ws_tx.lock().unwrap().replace(ws_tx.clone());
    let _ = shared.events.send(ProxyEvent::Started).await;

    let state = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break ServerState::Stopped,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Binary(data))) => {
                if let Err(err) = handle_relay_message(shared, &data).await {
                    debug!("[relay] discarding malformed envelope: {err}");
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code));
                info!("[relay] link closed with code {code:?}");
                break ServerState::from_close_code(code);
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!("[relay] link error: {err}");
                break ServerState::ErrNetwork;
            }
            None => break ServerState::ErrNetwork,
        }
    };

    writer.abort();
    (true, state)
}

async fn handle_relay_message(
    shared: &Arc<RelayShared>,
    data: &[u8],
) -> Result<(), CodecError> {
    let mut unpacker = Unpacker::new(data);
    match unpacker.unpack_int()? {
        RELAY_CLIENT_OPEN => {
            let id = unpacker.unpack_int()? as ClientId;
            let (conn, stale) = shared.registry.adopt(id);
            if let Some(stale) = stale {
                // Relay reused the id before announcing a close.
                if stale.mark_disconnected() {
                    let _ = shared
                        .events
                        .send(ProxyEvent::ClientDisconnected(id))
                        .await;
                }
            }
            debug!("[relay {id}] client channel opened");
            let _ = shared.events.send(ProxyEvent::ClientConnected(conn)).await;
        }
        RELAY_CLIENT_CLOSE => {
            let id = unpacker.unpack_int()? as ClientId;
            if let Some(conn) = shared.registry.remove(id) {
                if conn.mark_disconnected() {
                    debug!("[relay {id}] client channel closed");
                    let _ = shared
                        .events
                        .send(ProxyEvent::ClientDisconnected(id))
                        .await;
                }
            }
        }
        RELAY_PROXY => {
            let id = unpacker.unpack_int()? as ClientId;
            match decode_client_payload(&mut unpacker, shared.password.as_deref()) {
                Some((data, encrypted)) => {
                    let _ = shared
                        .events
                        .send(ProxyEvent::Frame {
                            client: id,
                            data,
                            encrypted,
                        })
                        .await;
                }
                None => debug!("[relay {id}] dropping undecryptable payload"),
            }
        }
        RELAY_CONNECTION_OK => {}
        other => debug!("[relay] ignoring envelope type {other}"),
    }
    Ok(())
}

/// Decodes the marker-prefixed body of a proxied payload into the plaintext
/// and whether it arrived encrypted. `None` means the payload was encrypted
/// and could not be opened.
fn decode_client_payload(
    unpacker: &mut Unpacker<'_>,
    password: Option<&str>,
) -> Option<(Vec<u8>, bool)> {
    let body = unpacker.unpack_rest();
    let (marker, rest) = body.split_first()?;
    match *marker {
        WIRE_ENCRYPTED => {
            let password = password?;
            decrypt(password, rest).ok().map(|data| (data, true))
        }
        WIRE_PLAINTEXT | WIRE_UNSUPPORTED => Some((rest.to_vec(), false)),
        // No marker we know; the sender framed the payload bare.
        _ => Some((body.to_vec(), false)),
    }
}

fn encode_client_payload(
    frame: &OutboundFrame,
    password: Option<&str>,
) -> Result<(u8, Vec<u8>), tether_core::CryptoError> {
    match (frame.encrypt, password) {
        (true, Some(password)) => Ok((WIRE_ENCRYPTED, encrypt(password, &frame.data)?)),
        _ => Ok((WIRE_PLAINTEXT, frame.data.clone())),
    }
}

/// Deterministic component of the reconnect delay. Doubles per attempt and
/// caps at `base << 6`.
fn backoff_base(attempt: u32) -> Duration {
    BACKOFF_BASE * (1 << attempt.min(BACKOFF_MAX_SHIFT))
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..1000))
}
