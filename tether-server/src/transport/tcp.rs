// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Direct TCP Transport
//!
//! Listens on a local port and frames each connection's byte stream as
//! `[i32 length][u8 encrypted][payload]`, all integers big-endian. Payload
//! encryption and decryption happen here, at the wire boundary; the
//! manager above only ever sees plaintext frames.
//!
//! Each accepted connection gets a reader task (this function's own loop)
//! and a writer task fed by a bounded channel, so concurrent sends to one
//! client are serialized and never interleave on the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{decrypt, encrypt, MAX_PAYLOAD_ALLOCATION};

use crate::connection::{ClientId, ConnectionRegistry};
use crate::transport::{
    DataProxy, OutboundFrame, ProxyEvent, SendTarget, ServerState, TransportError,
};

/// Outbound frames queued per connection before backpressure applies.
const WRITER_QUEUE_DEPTH: usize = 64;

/// How long teardown waits for the writer to flush queued frames before
/// giving up on a stalled peer.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TcpProxyConfig {
    /// Listen port. Port 0 binds an ephemeral port, readable afterwards
    /// through [`TcpProxy::local_addr`].
    pub port: u16,
    /// Shared passphrase. `None` disables payload encryption entirely.
    pub password: Option<String>,
}

struct ListenerState {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

struct TcpShared {
    registry: Arc<ConnectionRegistry>,
    events: mpsc::Sender<ProxyEvent>,
    password: Option<String>,
    writers: StdMutex<HashMap<ClientId, mpsc::Sender<OutboundFrame>>>,
}

/// Direct TCP implementation of [`DataProxy`].
pub struct TcpProxy {
    config: TcpProxyConfig,
    shared: Arc<TcpShared>,
    state: Mutex<Option<ListenerState>>,
}

impl TcpProxy {
    pub fn new(
        config: TcpProxyConfig,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::Sender<ProxyEvent>,
    ) -> Self {
        let password = config.password.clone();
        TcpProxy {
            config,
            shared: Arc::new(TcpShared {
                registry,
                events,
                password,
                writers: StdMutex::new(HashMap::new()),
            }),
            state: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|s| s.local_addr)
    }
}

#[async_trait::async_trait]
impl DataProxy for TcpProxy {
    fn requires_authentication(&self) -> bool {
        true
    }

    fn requires_persistence(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        info!("[tcp] listening on {local_addr}");

        let cancel = CancellationToken::new();
        *state = Some(ListenerState {
            cancel: cancel.clone(),
            local_addr,
        });
        drop(state);

        let shared = self.shared.clone();
        let _ = shared.events.send(ProxyEvent::Started).await;
        tokio::spawn(accept_loop(listener, shared, cancel));
        Ok(())
    }

    async fn stop(&self) {
        let Some(state) = self.state.lock().await.take() else {
            return;
        };
        state.cancel.cancel();

        for conn in self.shared.registry.drain() {
            if conn.mark_disconnected() {
                let _ = self
                    .shared
                    .events
                    .send(ProxyEvent::ClientDisconnected(conn.id))
                    .await;
            }
        }
        self.shared.writers.lock().unwrap().clear();

        let _ = self
            .shared
            .events
            .send(ProxyEvent::Stopped(ServerState::Stopped))
            .await;
        info!("[tcp] stopped");
    }

    async fn send(&self, target: SendTarget, frame: OutboundFrame) -> Result<(), TransportError> {
        match target {
            SendTarget::Client(id) => {
                let writer = self
                    .shared
                    .writers
                    .lock()
                    .unwrap()
                    .get(&id)
                    .cloned()
                    .ok_or(TransportError::UnknownClient(id))?;
                writer
                    .send(frame)
                    .await
                    .map_err(|_| TransportError::ClientGone(id))
            }
            SendTarget::Broadcast => {
                let writers: Vec<_> = self
                    .shared
                    .writers
                    .lock()
                    .unwrap()
                    .values()
                    .cloned()
                    .collect();
                for writer in writers {
                    // A client tearing down mid-broadcast is not an error
                    // for the others.
                    let _ = writer.send(frame.clone()).await;
                }
                Ok(())
            }
        }
    }

    async fn disconnect(&self, client: ClientId) {
        // Dropping the sender closes the writer channel; the writer task
        // drains frames enqueued before this call (rejection replies,
        // NHT_CLOSE) before it shuts the socket down.
        self.shared.writers.lock().unwrap().remove(&client);
        if let Some(conn) = self.shared.registry.get(client) {
            if conn.mark_disconnected() {
                let _ = self
                    .shared
                    .events
                    .send(ProxyEvent::ClientDisconnected(client))
                    .await;
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<TcpShared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("[tcp] accepted connection from {peer}");
                    tokio::spawn(handle_connection(stream, shared.clone()));
                }
                Err(err) => {
                    warn!("[tcp] accept failed: {err}");
                }
            },
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<TcpShared>) {
    let conn = shared.registry.register();
    let client = conn.id;
    let shutdown = conn.shutdown_token();

    let (mut reader, mut writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<OutboundFrame>(WRITER_QUEUE_DEPTH);
    shared.writers.lock().unwrap().insert(client, frame_tx);

    if shared
        .events
        .send(ProxyEvent::ClientConnected(conn.clone()))
        .await
        .is_err()
    {
        // Manager is gone; nothing to serve this connection for.
        shared.writers.lock().unwrap().remove(&client);
        shared.registry.remove(client);
        return;
    }

    let password = shared.password.clone();
    // The writer runs until its channel closes, not until the shutdown
    // token fires: a disconnect drops the sender, and draining what is
    // already queued guarantees frames sent just before the disconnect
    // (rejection replies, NHT_CLOSE) reach the socket.
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if write_frame(&mut writer, frame, password.as_deref())
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // Read loop. Any framing violation tears the connection down; a frame
    // that fails decryption is dropped and the connection survives.
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = read_frame(&mut reader, shared.password.as_deref()) => result,
        };
        match result {
            Ok(Some((data, encrypted))) => {
                if shared
                    .events
                    .send(ProxyEvent::Frame {
                        client,
                        data,
                        encrypted,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                debug!("[tcp {client}] dropping undecryptable frame");
            }
            Err(err) => {
                debug!("[tcp {client}] read ended: {err}");
                break;
            }
        }
    }

    shared.writers.lock().unwrap().remove(&client);
    shared.registry.remove(client);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        warn!("[tcp {client}] writer did not drain in time");
        writer_task.abort();
    }
    if conn.mark_disconnected() {
        let _ = shared
            .events
            .send(ProxyEvent::ClientDisconnected(client))
            .await;
    }
}

#[derive(Debug, thiserror::Error)]
enum FrameReadError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} out of range")]
    BadLength(i32),
}

/// Reads one `[i32 length][u8 encrypted][payload]` frame, returning the
/// plaintext and whether it arrived encrypted. Returns `Ok(None)` when the
/// frame arrived intact but failed decryption.
async fn read_frame(
    reader: &mut (impl AsyncReadExt + Unpin),
    password: Option<&str>,
) -> Result<Option<(Vec<u8>, bool)>, FrameReadError> {
    let length = reader.read_i32().await?;
    let encrypted = reader.read_u8().await? != 0;
    if length < 0 || length as usize > MAX_PAYLOAD_ALLOCATION {
        return Err(FrameReadError::BadLength(length));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    if !encrypted {
        return Ok(Some((payload, false)));
    }
    let Some(password) = password else {
        // Encrypted frame on a passwordless server cannot be opened.
        return Ok(None);
    };
    match decrypt(password, &payload) {
        Ok(plaintext) => Ok(Some((plaintext, true))),
        Err(err) => {
            warn!("[tcp] inbound frame failed decryption: {err}");
            Ok(None)
        }
    }
}

async fn write_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    frame: OutboundFrame,
    password: Option<&str>,
) -> std::io::Result<()> {
    let (payload, encrypted) = match (frame.encrypt, password) {
        (true, Some(password)) => match encrypt(password, &frame.data) {
            Ok(ciphertext) => (ciphertext, true),
            Err(err) => {
                warn!("[tcp] outbound encryption failed, dropping frame: {err}");
                return Ok(());
            }
        },
        _ => (frame.data, false),
    };

    writer.write_i32(payload.len() as i32).await?;
    writer.write_u8(encrypted as u8).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}
