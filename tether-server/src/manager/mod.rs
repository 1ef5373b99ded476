// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Manager
//!
//! The protocol brain. Consumes transport events, drives the handshake and
//! keepalive state machines, dispatches every inbound frame to its handler,
//! and assembles every outbound frame.
//!
//! The manager decides per frame whether it travels encrypted: everything
//! is, except the pre-authentication negotiation frames (INFORMATION and
//! failed AUTHENTICATION replies) which the other side must be able to read
//! without the shared password.

mod mass_retrieval;

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::protocol::*;
use tether_core::{random_bytes, CodecError, CryptoError, Packer, Unpacker};

use crate::automation::Automation;
use crate::config::ServerConfig;
use crate::connection::{
    ClientConnection, ClientId, ClientRegistration, ConnectionRegistry, TimerKind,
};
use crate::filetransfer::{DownloadContext, DownloadError, PacketOutcome, PendingDownloads};
use crate::store::{Message, MessageStore, Modifier, StoreError};
use crate::transport::{
    DataProxy, OutboundFrame, ProxyEvent, SendTarget, ServerState, TransportError,
};
use crate::updates::UpdateProvider;

/// Manager error types.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("download: {0}")]
    Download(#[from] DownloadError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Expirations delivered back into the manager's event loop.
#[derive(Debug)]
enum TimerEvent {
    HandshakeExpired(ClientId),
    PingExpired(ClientId),
    DownloadIdle { client: ClientId, request_id: i16 },
}

/// Tuning knobs for the manager, derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub server_name: String,
    pub server_version: String,
    pub password: Option<String>,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub ping_timeout: Duration,
    pub download_idle_timeout: Duration,
    /// Messages per mass retrieval page.
    pub retrieval_batch_size: i32,
    /// Plaintext bytes per attachment chunk, before compression.
    pub attachment_chunk_size: usize,
}

impl ManagerConfig {
    pub fn from_server(config: &ServerConfig) -> Self {
        ManagerConfig {
            server_name: config.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            password: config.password.clone(),
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            ping_timeout: config.ping_timeout,
            download_idle_timeout: config.download_idle_timeout,
            retrieval_batch_size: 20,
            attachment_chunk_size: 1024 * 1024,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_server(&ServerConfig::default())
    }
}

/// Orchestrates one transport, the session registry, and the collaborators
/// behind every protocol operation.
pub struct ConnectionManager {
    proxy: Arc<dyn DataProxy>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    automation: Arc<dyn Automation>,
    updates: Arc<dyn UpdateProvider>,
    downloads: PendingDownloads,
    /// Clients with a mass-retrieval sweep currently running. One sweep
    /// per client at a time; repeats are ignored until it finishes.
    retrievals_in_flight: StdMutex<HashSet<ClientId>>,
    config: ManagerConfig,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: StdMutex<Option<mpsc::UnboundedReceiver<TimerEvent>>>,
}

impl ConnectionManager {
    pub fn new(
        proxy: Arc<dyn DataProxy>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        automation: Arc<dyn Automation>,
        updates: Arc<dyn UpdateProvider>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Arc::new(ConnectionManager {
            proxy,
            registry,
            store,
            automation,
            updates,
            downloads: PendingDownloads::new(),
            retrievals_in_flight: StdMutex::new(HashSet::new()),
            config,
            timer_tx,
            timer_rx: StdMutex::new(Some(timer_rx)),
        })
    }

    /// Event loop. Runs until the transport's event channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ProxyEvent>) {
        let Some(mut timer_rx) = self.timer_rx.lock().unwrap().take() else {
            warn!("manager event loop started twice");
            return;
        };
        let keepalive_enabled = self.proxy.requires_persistence();
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive_interval,
            self.config.keepalive_interval,
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.clone().handle_proxy_event(event).await,
                    None => break,
                },
                Some(timer) = timer_rx.recv() => self.handle_timer_event(timer).await,
                _ = keepalive.tick(), if keepalive_enabled => self.broadcast_keepalive().await,
            }
        }
        info!("manager event loop ended");
    }

    /// Pushes fresh messages to every client and fires a push notification
    /// for whoever is offline. Entry point for host-side message watchers.
    pub async fn notify_message_update(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let mut packer = frame(NHT_MESSAGE_UPDATE);
        packer.pack_array(messages);
        let data = packer.into_bytes();
        if let Err(err) = self.broadcast_secure(data.clone()).await {
            warn!("message update broadcast failed: {err}");
        }
        match self.proxy.send_push_notification(data, COMM_VERSION).await {
            Ok(()) | Err(TransportError::PushUnsupported) => {}
            Err(err) => warn!("push notification failed: {err}"),
        }
    }

    /// Pushes modifier changes (tapbacks, edits) to every client. Modifiers
    /// are not pushed offline; clients pick them up on their next retrieval.
    pub async fn notify_modifier_update(&self, modifiers: &[Modifier]) {
        if modifiers.is_empty() {
            return;
        }
        let mut packer = frame(NHT_MODIFIER_UPDATE);
        packer.pack_array(modifiers);
        if let Err(err) = self.broadcast_secure(packer.into_bytes()).await {
            warn!("modifier update broadcast failed: {err}");
        }
    }

    async fn handle_proxy_event(self: Arc<Self>, event: ProxyEvent) {
        match event {
            ProxyEvent::Started => info!("transport started"),
            ProxyEvent::Stopped(state) => {
                if state == ServerState::Stopped {
                    info!("transport stopped");
                } else {
                    warn!("transport stopped: {state:?}");
                }
            }
            ProxyEvent::ClientConnected(conn) => {
                debug!("[client {}] connected", conn.id);
                if let Err(err) = self.greet_client(&conn).await {
                    warn!("[client {}] greeting failed: {err}", conn.id);
                }
            }
            ProxyEvent::ClientDisconnected(client) => {
                debug!("[client {client}] disconnected");
                self.downloads.abort_for_client(client);
            }
            ProxyEvent::Frame {
                client,
                data,
                encrypted,
            } => {
                let Some(conn) = self.registry.get(client) else {
                    debug!("[client {client}] frame for unknown connection");
                    return;
                };
                // Any inbound traffic counts as liveness.
                conn.cancel_timer(TimerKind::Ping);
                self.handle_frame(conn, data, encrypted).await;
            }
        }
    }

    /// Sends the INFORMATION frame and arms the handshake timer. Cleartext:
    /// the client uses it to learn whether it must authenticate at all.
    async fn greet_client(&self, conn: &Arc<ClientConnection>) -> Result<(), ManagerError> {
        let auth_required = self.auth_required();
        let mut packer = frame(NHT_INFORMATION);
        packer.pack_int(COMM_VERSION);
        packer.pack_int(COMM_SUB_VERSION);
        packer.pack_bool(auth_required);
        if auth_required {
            let check = random_bytes(TRANSMISSION_CHECK_LEN)?;
            conn.issue_transmission_check(check.clone());
            packer.pack_payload(&check);
        }
        self.send_clear(conn.id, packer.into_bytes()).await?;

        self.start_conn_timer(
            conn,
            TimerKind::Handshake,
            self.config.handshake_timeout,
            TimerEvent::HandshakeExpired(conn.id),
        );
        Ok(())
    }

    async fn handle_timer_event(&self, event: TimerEvent) {
        match event {
            TimerEvent::HandshakeExpired(client) => {
                let Some(conn) = self.registry.get(client) else {
                    return;
                };
                if !conn.is_registered() {
                    info!("[client {client}] handshake timed out");
                    self.proxy.disconnect(client).await;
                }
            }
            TimerEvent::PingExpired(client) => {
                info!("[client {client}] silent after keepalive ping");
                self.proxy.disconnect(client).await;
            }
            TimerEvent::DownloadIdle { client, request_id } => {
                if self.downloads.timeout(client, request_id) {
                    let _ = self
                        .reply_send_result(
                            client,
                            request_id,
                            send_result::REQUEST_TIMEOUT,
                            None,
                        )
                        .await;
                }
            }
        }
    }

    async fn broadcast_keepalive(&self) {
        let packer = frame(NHT_PING);
        if let Err(err) = self.broadcast_clear(packer.into_bytes()).await {
            warn!("keepalive broadcast failed: {err}");
            return;
        }
        for conn in self.registry.snapshot() {
            self.start_conn_timer(
                &conn,
                TimerKind::Ping,
                self.config.ping_timeout,
                TimerEvent::PingExpired(conn.id),
            );
        }
    }

    async fn handle_frame(
        self: Arc<Self>,
        conn: Arc<ClientConnection>,
        data: Vec<u8>,
        encrypted: bool,
    ) {
        let mut unpacker = Unpacker::new(&data);
        let message_type = match unpacker.unpack_int() {
            Ok(message_type) => message_type,
            Err(err) => {
                debug!("[client {}] unframeable data: {err}", conn.id);
                return;
            }
        };

        // Everything beyond the negotiation surface requires a completed
        // handshake. Early frames are dropped without a reply so an
        // unauthenticated peer learns nothing.
        if is_sensitive(message_type) && !conn.is_registered() {
            debug!(
                "[client {}] ignoring type {message_type} before registration",
                conn.id
            );
            return;
        }

        let result = match message_type {
            NHT_CLOSE => {
                self.proxy.disconnect(conn.id).await;
                Ok(())
            }
            NHT_PING => self
                .send_clear(conn.id, frame(NHT_PONG).into_bytes())
                .await
                .map_err(ManagerError::from),
            NHT_PONG => Ok(()),
            NHT_AUTHENTICATION => {
                self.handle_authentication(&conn, &mut unpacker, encrypted)
                    .await
            }
            NHT_TIME_RETRIEVAL => self.handle_time_retrieval(&conn, &mut unpacker).await,
            NHT_ID_RETRIEVAL => self.handle_id_retrieval(&conn, &mut unpacker).await,
            NHT_MASS_RETRIEVAL => self.clone().handle_mass_retrieval(&conn, &mut unpacker),
            NHT_CONVERSATION_UPDATE => self.handle_conversation_update(&conn, &mut unpacker).await,
            NHT_ATTACHMENT_REQ => {
                self.clone()
                    .handle_attachment_request(&conn, &mut unpacker)
                    .await
            }
            NHT_SEND_TEXT_EXISTING => self.handle_send_text(&conn, &mut unpacker, false).await,
            NHT_SEND_TEXT_NEW => self.handle_send_text(&conn, &mut unpacker, true).await,
            NHT_SEND_FILE_EXISTING => {
                self.clone()
                    .handle_send_file(&conn, &mut unpacker, false)
                    .await
            }
            NHT_SEND_FILE_NEW => {
                self.clone()
                    .handle_send_file(&conn, &mut unpacker, true)
                    .await
            }
            NHT_CREATE_CHAT => self.handle_create_chat(&conn, &mut unpacker).await,
            NHT_SOFTWARE_UPDATE_LISTING => self.send_update_listing(conn.id).await,
            NHT_SOFTWARE_UPDATE_INSTALL => self.handle_update_install(&conn, &mut unpacker).await,
            NHT_FACETIME_CREATE_LINK => self.handle_facetime_link(&conn).await,
            NHT_FACETIME_OUTGOING_INITIATE => self.handle_facetime_call(&conn, &mut unpacker).await,
            other => {
                debug!("[client {}] unhandled message type {other}", conn.id);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(
                "[client {}] handler for type {message_type} failed: {err}",
                conn.id
            );
        }
    }

    /// AUTHENTICATION: `[check payload?][installation id][name][platform]`.
    /// The check payload is present exactly when the INFORMATION frame
    /// demanded one.
    async fn handle_authentication(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
        encrypted: bool,
    ) -> Result<(), ManagerError> {
        let parsed: Result<(Option<Vec<u8>>, ClientRegistration), CodecError> = (|| {
            let check = if self.auth_required() {
                Some(unpacker.unpack_payload()?)
            } else {
                None
            };
            let registration = ClientRegistration {
                installation_id: unpacker.unpack_string()?,
                client_name: unpacker.unpack_string()?,
                platform_id: unpacker.unpack_string()?,
            };
            Ok((check, registration))
        })();
        let (presented_check, registration) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("[client {}] malformed authentication: {err}", conn.id);
                self.reply_auth_failure(conn.id, auth_result::BAD_REQUEST)
                    .await?;
                self.proxy.disconnect(conn.id).await;
                return Ok(());
            }
        };

        if let Some(presented) = presented_check {
            // The check only proves password knowledge if the frame itself
            // arrived encrypted; echoing the cleartext bytes back proves
            // nothing. It is also single-use, so a replayed or forged
            // payload fails here, as does a second authentication attempt.
            let valid = encrypted
                && conn
                    .consume_transmission_check()
                    .is_some_and(|expected| expected == presented);
            if !valid {
                info!("[client {}] failed transmission check", conn.id);
                self.reply_auth_failure(conn.id, auth_result::UNAUTHORIZED)
                    .await?;
                self.proxy.disconnect(conn.id).await;
                return Ok(());
            }
        }

        // One session per installation: a re-login from the same app
        // instance evicts the older session.
        if let Some(stale) = self
            .registry
            .find_registered(&registration.installation_id, conn.id)
        {
            info!(
                "[client {}] evicting stale session {} for installation {}",
                conn.id, stale.id, registration.installation_id
            );
            let _ = self.send_clear(stale.id, frame(NHT_CLOSE).into_bytes()).await;
            self.proxy.disconnect(stale.id).await;
        }

        info!(
            "[client {}] registered as {} ({})",
            conn.id, registration.client_name, registration.platform_id
        );
        conn.set_registration(registration);
        conn.cancel_timer(TimerKind::Handshake);

        let mut packer = frame(NHT_AUTHENTICATION);
        packer.pack_int(auth_result::OK);
        packer.pack_string(&self.config.server_name);
        packer.pack_string(&self.config.server_version);
        packer.pack_bool(self.automation.is_available());
        self.send_secure(conn.id, packer.into_bytes()).await?;

        // Freshly registered clients immediately learn where history ends
        // and whether a server update is pending.
        let mut packer = frame(NHT_ID_UPDATE);
        packer.pack_long(self.store.latest_message_id()?);
        self.send_secure(conn.id, packer.into_bytes()).await?;
        self.send_update_listing(conn.id).await
    }

    /// TIME_RETRIEVAL: `[i64 start][i64 end]`, both unix milliseconds.
    async fn handle_time_retrieval(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let start = unpacker.unpack_long()?;
        let end = unpacker.unpack_long()?;
        let messages = self.store.messages_in_range(start, end)?;
        self.send_message_update(conn.id, &messages).await
    }

    /// ID_RETRIEVAL: `[i64 last seen message id]`.
    async fn handle_id_retrieval(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let id = unpacker.unpack_long()?;
        let messages = self.store.messages_since_id(id)?;
        self.send_message_update(conn.id, &messages).await
    }

    /// MASS_RETRIEVAL: `[i16 request id]`. The sweep runs as its own task;
    /// the event loop stays responsive for other clients.
    fn handle_mass_retrieval(
        self: Arc<Self>,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let request_id = unpacker.unpack_short()?;
        if !self.retrievals_in_flight.lock().unwrap().insert(conn.id) {
            debug!("[client {}] mass retrieval already running", conn.id);
            return Ok(());
        }
        let manager = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Err(err) = mass_retrieval::run(manager.clone(), conn.clone(), request_id).await
            {
                warn!("[client {}] mass retrieval failed: {err}", conn.id);
            }
            manager
                .retrievals_in_flight
                .lock()
                .unwrap()
                .remove(&conn.id);
        });
        Ok(())
    }

    /// CONVERSATION_UPDATE: `[array of conversation guids]`.
    async fn handle_conversation_update(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let guids: Vec<String> = unpacker.unpack_array()?;
        let conversations = self.store.conversations(&guids)?;
        let mut packer = frame(NHT_CONVERSATION_UPDATE);
        packer.pack_array(&conversations);
        self.send_secure(conn.id, packer.into_bytes()).await?;
        Ok(())
    }

    /// ATTACHMENT_REQ: `[i16 request id][string attachment guid]`.
    async fn handle_attachment_request(
        self: Arc<Self>,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let request_id = unpacker.unpack_short()?;
        let guid = unpacker.unpack_string()?;

        let file = match self.store.attachment_file(&guid) {
            Ok(file) => file,
            Err(StoreError::NotFound(_)) => {
                return self
                    .reply_attachment_fail(conn.id, request_id, attachment_fail::NOT_FOUND)
                    .await;
            }
            Err(err) => {
                warn!("[client {}] attachment {guid} lookup failed: {err}", conn.id);
                return self
                    .reply_attachment_fail(conn.id, request_id, attachment_fail::IO)
                    .await;
            }
        };

        let mut packer = frame(NHT_ATTACHMENT_REQ_CONFIRM);
        packer.pack_short(request_id);
        self.send_secure(conn.id, packer.into_bytes()).await?;

        let manager = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Err(err) = manager
                .stream_attachment(&conn, request_id, &guid, &file.path)
                .await
            {
                warn!("[client {}] attachment stream failed: {err}", conn.id);
                let _ = manager
                    .reply_attachment_fail(conn.id, request_id, attachment_fail::IO)
                    .await;
            }
        });
        Ok(())
    }

    /// Streams one attachment as compressed chunks:
    /// `[i16 rid][string guid][i32 index][bool last][i64 total?][payload]`,
    /// with the total length only on the first chunk.
    async fn stream_attachment(
        &self,
        conn: &Arc<ClientConnection>,
        request_id: i16,
        guid: &str,
        path: &std::path::Path,
    ) -> Result<(), ManagerError> {
        let mut file = tokio::fs::File::open(path).await?;
        let total_len = file.metadata().await?.len() as i64;

        let mut index: i32 = 0;
        let mut buf = vec![0u8; self.config.attachment_chunk_size];
        loop {
            let read = read_up_to(&mut file, &mut buf).await?;
            let is_last = read < buf.len();
            if !conn.is_connected() {
                // Receiver went away mid-stream; nobody to notify.
                return Ok(());
            }
            let compressed = deflate(&buf[..read])?;

            let mut packer = frame(NHT_ATTACHMENT_REQ);
            packer.pack_short(request_id);
            packer.pack_string(guid);
            packer.pack_int(index);
            packer.pack_bool(is_last);
            if index == 0 {
                packer.pack_long(total_len);
            }
            packer.pack_payload(&compressed);
            self.send_secure(conn.id, packer.into_bytes()).await?;

            if is_last {
                return Ok(());
            }
            index += 1;
        }
    }

    /// SEND_TEXT_*: `[i16 rid][target][string text]` where the target is a
    /// chat guid for existing chats, or `[array members][string service]`
    /// for new ones.
    async fn handle_send_text(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
        new_chat: bool,
    ) -> Result<(), ManagerError> {
        let request_id = unpacker.unpack_short()?;
        let automation = self.automation.clone();
        let result = if new_chat {
            let members: Vec<String> = unpacker.unpack_array()?;
            let service = unpacker.unpack_string()?;
            let text = unpacker.unpack_string()?;
            tokio::task::spawn_blocking(move || {
                automation.send_text_new(&members, &service, &text)
            })
            .await?
        } else {
            let chat_guid = unpacker.unpack_string()?;
            let text = unpacker.unpack_string()?;
            tokio::task::spawn_blocking(move || automation.send_text_existing(&chat_guid, &text))
                .await?
        };

        match result {
            Ok(()) => {
                self.reply_send_result(conn.id, request_id, send_result::OK, None)
                    .await
            }
            Err(err) => {
                self.reply_send_result(
                    conn.id,
                    request_id,
                    err.send_result_code(),
                    Some(&err.to_string()),
                )
                .await
            }
        }
    }

    /// SEND_FILE_*: `[i16 rid][i32 index][bool last][metadata?][payload]`.
    /// Metadata rides only on packet 0: `[string chat guid]` for existing
    /// chats or `[array members][string service]` for new ones, then the
    /// file name.
    async fn handle_send_file(
        self: Arc<Self>,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
        new_chat: bool,
    ) -> Result<(), ManagerError> {
        let request_id = unpacker.unpack_short()?;
        let index = unpacker.unpack_int()?;
        let is_last = unpacker.unpack_bool()?;

        let metadata = if index == 0 {
            let context = if new_chat {
                DownloadContext::NewChat {
                    members: unpacker.unpack_array()?,
                    service: unpacker.unpack_string()?,
                }
            } else {
                DownloadContext::ExistingChat {
                    chat_guid: unpacker.unpack_string()?,
                }
            };
            Some((context, unpacker.unpack_string()?))
        } else {
            None
        };
        // The whole frame must parse before any upload state exists, so a
        // truncated packet cannot leave a staging directory behind.
        let data = unpacker.unpack_payload()?;

        if let Some((context, file_name)) = metadata {
            if let Err(err) = self
                .downloads
                .start_request(conn.id, request_id, &file_name, context)
            {
                return self
                    .reply_send_result(
                        conn.id,
                        request_id,
                        send_result::BAD_REQUEST,
                        Some(&err.to_string()),
                    )
                    .await;
            }
        }

        match self
            .downloads
            .append(conn.id, request_id, index, is_last, &data)
        {
            Ok(PacketOutcome::Accepted(idle)) => {
                self.arm_download_idle(conn.id, request_id, idle);
                Ok(())
            }
            Ok(PacketOutcome::Ignored) => Ok(()),
            Ok(PacketOutcome::Complete(done)) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.finish_file_send(done).await;
                });
                Ok(())
            }
            Err(err) => {
                self.reply_send_result(
                    conn.id,
                    request_id,
                    send_result::BAD_REQUEST,
                    Some(&err.to_string()),
                )
                .await
            }
        }
    }

    /// Hands a reassembled upload to automation and reports the outcome.
    async fn finish_file_send(&self, done: crate::filetransfer::CompletedDownload) {
        let client = done.client;
        let request_id = done.request_id;
        let automation = self.automation.clone();
        let path = done.path.clone();
        let context = done.context.clone();

        let result = tokio::task::spawn_blocking(move || match &context {
            DownloadContext::ExistingChat { chat_guid } => {
                automation.send_file_existing(chat_guid, &path)
            }
            DownloadContext::NewChat { members, service } => {
                automation.send_file_new(members, service, &path)
            }
        })
        .await;

        let reply = match result {
            Ok(Ok(())) => {
                self.reply_send_result(client, request_id, send_result::OK, None)
                    .await
            }
            Ok(Err(err)) => {
                self.reply_send_result(
                    client,
                    request_id,
                    err.send_result_code(),
                    Some(&err.to_string()),
                )
                .await
            }
            Err(err) => {
                self.reply_send_result(
                    client,
                    request_id,
                    send_result::INTERNAL,
                    Some(&err.to_string()),
                )
                .await
            }
        };
        if let Err(err) = reply {
            warn!("[client {client}] send result reply failed: {err}");
        }
        done.cleanup();
    }

    /// CREATE_CHAT: `[i16 rid][array members][string service]`. The reply
    /// detail carries the new chat guid on success.
    async fn handle_create_chat(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let request_id = unpacker.unpack_short()?;
        let members: Vec<String> = unpacker.unpack_array()?;
        let service = unpacker.unpack_string()?;

        let automation = self.automation.clone();
        let result =
            tokio::task::spawn_blocking(move || automation.create_chat(&members, &service))
                .await?;

        let mut packer = frame(NHT_CREATE_CHAT);
        packer.pack_short(request_id);
        match result {
            Ok(guid) => {
                packer.pack_int(send_result::OK);
                packer.pack_optional_string(Some(&guid));
            }
            Err(err) => {
                packer.pack_int(err.send_result_code());
                packer.pack_optional_string(Some(&err.to_string()));
            }
        }
        self.send_secure(conn.id, packer.into_bytes()).await?;
        Ok(())
    }

    /// SOFTWARE_UPDATE_LISTING reply:
    /// `[bool available][i32 id][string version][string notes][bool remote]`.
    async fn send_update_listing(&self, client: ClientId) -> Result<(), ManagerError> {
        let mut packer = frame(NHT_SOFTWARE_UPDATE_LISTING);
        match self.updates.pending() {
            Some(update) => {
                packer.pack_bool(true);
                packer.pack_int(update.id);
                packer.pack_string(&update.version);
                packer.pack_string(&update.notes);
                packer.pack_bool(update.remote_installable);
            }
            None => packer.pack_bool(false),
        }
        self.send_secure(client, packer.into_bytes()).await?;
        Ok(())
    }

    /// SOFTWARE_UPDATE_INSTALL: `[i32 update id]`.
    async fn handle_update_install(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let id = unpacker.unpack_int()?;
        let result = self.updates.install(id);

        let mut packer = frame(NHT_SOFTWARE_UPDATE_INSTALL);
        match result {
            Ok(()) => {
                packer.pack_bool(true);
                packer.pack_optional_string(None);
            }
            Err(err) => {
                packer.pack_bool(false);
                packer.pack_optional_string(Some(&err.to_string()));
            }
        }
        self.send_secure(conn.id, packer.into_bytes()).await?;
        Ok(())
    }

    /// FACETIME_CREATE_LINK reply: `[bool ok][optional string link/detail]`.
    async fn handle_facetime_link(&self, conn: &Arc<ClientConnection>) -> Result<(), ManagerError> {
        let automation = self.automation.clone();
        let result = tokio::task::spawn_blocking(move || automation.create_facetime_link()).await?;

        let mut packer = frame(NHT_FACETIME_CREATE_LINK);
        match result {
            Ok(link) => {
                packer.pack_bool(true);
                packer.pack_optional_string(Some(&link));
            }
            Err(err) => {
                packer.pack_bool(false);
                packer.pack_optional_string(Some(&err.to_string()));
            }
        }
        self.send_secure(conn.id, packer.into_bytes()).await?;
        Ok(())
    }

    /// FACETIME_OUTGOING_INITIATE: `[array addresses]`.
    async fn handle_facetime_call(
        &self,
        conn: &Arc<ClientConnection>,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<(), ManagerError> {
        let addresses: Vec<String> = unpacker.unpack_array()?;
        let automation = self.automation.clone();
        let result =
            tokio::task::spawn_blocking(move || automation.initiate_facetime_call(&addresses))
                .await?;

        let mut packer = frame(NHT_FACETIME_OUTGOING_INITIATE);
        match result {
            Ok(()) => {
                packer.pack_bool(true);
                packer.pack_optional_string(None);
            }
            Err(err) => {
                packer.pack_bool(false);
                packer.pack_optional_string(Some(&err.to_string()));
            }
        }
        self.send_secure(conn.id, packer.into_bytes()).await?;
        Ok(())
    }

    fn auth_required(&self) -> bool {
        self.proxy.requires_authentication() && self.config.password.is_some()
    }

    async fn send_message_update(
        &self,
        client: ClientId,
        messages: &[Message],
    ) -> Result<(), ManagerError> {
        let mut packer = frame(NHT_MESSAGE_UPDATE);
        packer.pack_array(messages);
        self.send_secure(client, packer.into_bytes()).await?;
        Ok(())
    }

    async fn reply_auth_failure(&self, client: ClientId, code: i32) -> Result<(), ManagerError> {
        let mut packer = frame(NHT_AUTHENTICATION);
        packer.pack_int(code);
        self.send_clear(client, packer.into_bytes()).await?;
        Ok(())
    }

    async fn reply_send_result(
        &self,
        client: ClientId,
        request_id: i16,
        code: i32,
        detail: Option<&str>,
    ) -> Result<(), ManagerError> {
        let mut packer = frame(NHT_SEND_RESULT);
        packer.pack_short(request_id);
        packer.pack_int(code);
        packer.pack_optional_string(detail);
        self.send_secure(client, packer.into_bytes()).await?;
        Ok(())
    }

    async fn reply_attachment_fail(
        &self,
        client: ClientId,
        request_id: i16,
        code: i32,
    ) -> Result<(), ManagerError> {
        let mut packer = frame(NHT_ATTACHMENT_REQ_FAIL);
        packer.pack_short(request_id);
        packer.pack_int(code);
        self.send_secure(client, packer.into_bytes()).await?;
        Ok(())
    }

    /// Content frame: encrypted whenever a password is configured.
    async fn send_secure(&self, client: ClientId, data: Vec<u8>) -> Result<(), TransportError> {
        self.proxy
            .send(
                SendTarget::Client(client),
                OutboundFrame {
                    data,
                    encrypt: self.config.password.is_some(),
                },
            )
            .await
    }

    /// Negotiation frame: always readable without the password.
    async fn send_clear(&self, client: ClientId, data: Vec<u8>) -> Result<(), TransportError> {
        self.proxy
            .send(
                SendTarget::Client(client),
                OutboundFrame {
                    data,
                    encrypt: false,
                },
            )
            .await
    }

    async fn broadcast_secure(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.proxy
            .send(
                SendTarget::Broadcast,
                OutboundFrame {
                    data,
                    encrypt: self.config.password.is_some(),
                },
            )
            .await
    }

    async fn broadcast_clear(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.proxy
            .send(
                SendTarget::Broadcast,
                OutboundFrame {
                    data,
                    encrypt: false,
                },
            )
            .await
    }

    fn start_conn_timer(
        &self,
        conn: &Arc<ClientConnection>,
        kind: TimerKind,
        duration: Duration,
        event: TimerEvent,
    ) {
        let token = CancellationToken::new();
        conn.set_timer(kind, token.clone());
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    let _ = tx.send(event);
                }
            }
        });
    }

    fn arm_download_idle(&self, client: ClientId, request_id: i16, token: CancellationToken) {
        let tx = self.timer_tx.clone();
        let timeout = self.config.download_idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(TimerEvent::DownloadIdle { client, request_id });
                }
            }
        });
    }
}

/// Starts a frame with its message type.
fn frame(message_type: i32) -> Packer {
    let mut packer = Packer::new();
    packer.pack_int(message_type);
    packer
}

/// Compresses one chunk as a standalone zlib stream.
fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Fills `buf` as far as the file allows; a short count means end of file.
async fn read_up_to(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::UnavailableAutomation;
    use crate::store::{AttachmentFile, InMemoryStore};
    use crate::updates::NoUpdates;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport double that records every frame the manager sends.
    struct RecordingProxy {
        registry: Arc<ConnectionRegistry>,
        sent: Mutex<Vec<(SendTarget, OutboundFrame)>>,
        disconnected: Mutex<Vec<ClientId>>,
        requires_auth: bool,
    }

    impl RecordingProxy {
        fn new(registry: Arc<ConnectionRegistry>, requires_auth: bool) -> Arc<Self> {
            Arc::new(RecordingProxy {
                registry,
                sent: Mutex::new(Vec::new()),
                disconnected: Mutex::new(Vec::new()),
                requires_auth,
            })
        }

        fn sent_frames(&self, client: ClientId) -> Vec<Vec<u8>> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(target, _)| *target == SendTarget::Client(client))
                .map(|(_, frame)| frame.data.clone())
                .collect()
        }

        fn frame_types(&self, client: ClientId) -> Vec<i32> {
            self.sent_frames(client)
                .iter()
                .map(|data| Unpacker::new(data).unpack_int().unwrap())
                .collect()
        }

        fn disconnects(&self) -> Vec<ClientId> {
            self.disconnected.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataProxy for RecordingProxy {
        fn requires_authentication(&self) -> bool {
            self.requires_auth
        }

        fn requires_persistence(&self) -> bool {
            true
        }

        async fn start(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn send(
            &self,
            target: SendTarget,
            frame: OutboundFrame,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((target, frame));
            Ok(())
        }

        async fn disconnect(&self, client: ClientId) {
            self.disconnected.lock().unwrap().push(client);
            if let Some(conn) = self.registry.remove(client) {
                conn.mark_disconnected();
            }
        }
    }

    struct Fixture {
        manager: Arc<ConnectionManager>,
        proxy: Arc<RecordingProxy>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<InMemoryStore>,
    }

    fn fixture(password: Option<&str>) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let proxy = RecordingProxy::new(registry.clone(), true);
        let store = Arc::new(InMemoryStore::new());
        let config = ManagerConfig {
            password: password.map(str::to_string),
            ..ManagerConfig::default()
        };
        let manager = ConnectionManager::new(
            proxy.clone(),
            registry.clone(),
            store.clone(),
            Arc::new(UnavailableAutomation),
            Arc::new(NoUpdates),
            config,
        );
        Fixture {
            manager,
            proxy,
            registry,
            store,
        }
    }

    async fn connect(fixture: &Fixture) -> Arc<ClientConnection> {
        let conn = fixture.registry.register();
        fixture
            .manager
            .clone()
            .handle_proxy_event(ProxyEvent::ClientConnected(conn.clone()))
            .await;
        conn
    }

    async fn authenticate(fixture: &Fixture, conn: &Arc<ClientConnection>, installation: &str) {
        let mut packer = frame(NHT_AUTHENTICATION);
        if let Some(check) = information_check(fixture, conn) {
            packer.pack_payload(&check);
        }
        packer.pack_string(installation);
        packer.pack_string("Phone");
        packer.pack_string("android");
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;
    }

    /// Pulls the transmission check back out of the INFORMATION frame the
    /// manager sent to this client.
    fn information_check(fixture: &Fixture, conn: &Arc<ClientConnection>) -> Option<Vec<u8>> {
        let frames = fixture.proxy.sent_frames(conn.id);
        let info = frames.first()?;
        let mut unpacker = Unpacker::new(info);
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_INFORMATION);
        unpacker.unpack_int().unwrap();
        unpacker.unpack_int().unwrap();
        if unpacker.unpack_bool().unwrap() {
            Some(unpacker.unpack_payload().unwrap())
        } else {
            None
        }
    }

    #[tokio::test]
    async fn test_information_frame_on_connect() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;

        let frames = fixture.proxy.sent_frames(conn.id);
        assert_eq!(frames.len(), 1);
        let mut unpacker = Unpacker::new(&frames[0]);
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_INFORMATION);
        assert_eq!(unpacker.unpack_int().unwrap(), COMM_VERSION);
        assert_eq!(unpacker.unpack_int().unwrap(), COMM_SUB_VERSION);
        assert!(unpacker.unpack_bool().unwrap());
        assert_eq!(
            unpacker.unpack_payload().unwrap().len(),
            TRANSMISSION_CHECK_LEN
        );
    }

    #[tokio::test]
    async fn test_information_omits_check_without_password() {
        let fixture = fixture(None);
        let conn = connect(&fixture).await;
        assert_eq!(information_check(&fixture, &conn), None);
    }

    #[tokio::test]
    async fn test_authentication_success_flow() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        assert!(conn.is_registered());
        // Welcome sequence: auth OK, latest id, update listing.
        let types = fixture.proxy.frame_types(conn.id);
        assert_eq!(
            types,
            [
                NHT_INFORMATION,
                NHT_AUTHENTICATION,
                NHT_ID_UPDATE,
                NHT_SOFTWARE_UPDATE_LISTING
            ]
        );

        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(&frames[1]);
        unpacker.unpack_int().unwrap();
        assert_eq!(unpacker.unpack_int().unwrap(), auth_result::OK);
        assert_eq!(unpacker.unpack_string().unwrap(), "Tether Server");
    }

    #[tokio::test]
    async fn test_wrong_transmission_check_disconnects() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;

        let mut packer = frame(NHT_AUTHENTICATION);
        packer.pack_payload(&[0u8; TRANSMISSION_CHECK_LEN]);
        packer.pack_string("install-1");
        packer.pack_string("Phone");
        packer.pack_string("android");
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        assert!(!conn.is_registered());
        assert_eq!(fixture.proxy.disconnects(), [conn.id]);
        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_AUTHENTICATION);
        assert_eq!(unpacker.unpack_int().unwrap(), auth_result::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cleartext_transmission_check_rejected() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;

        // Correct check bytes, but the frame did not arrive encrypted, so
        // the sender has not proven it knows the password.
        let check = information_check(&fixture, &conn).unwrap();
        let mut packer = frame(NHT_AUTHENTICATION);
        packer.pack_payload(&check);
        packer.pack_string("install-1");
        packer.pack_string("Phone");
        packer.pack_string("android");
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), false)
            .await;

        assert!(!conn.is_registered());
        assert_eq!(fixture.proxy.disconnects(), [conn.id]);
    }

    #[tokio::test]
    async fn test_malformed_authentication_is_bad_request() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;

        // Truncated: check payload only, no registration strings.
        let check = information_check(&fixture, &conn).unwrap();
        let mut packer = frame(NHT_AUTHENTICATION);
        packer.pack_payload(&check);
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_AUTHENTICATION);
        assert_eq!(unpacker.unpack_int().unwrap(), auth_result::BAD_REQUEST);
        assert_eq!(fixture.proxy.disconnects(), [conn.id]);
    }

    #[tokio::test]
    async fn test_duplicate_installation_evicts_old_session() {
        let fixture = fixture(Some("pw"));
        let first = connect(&fixture).await;
        authenticate(&fixture, &first, "shared-install").await;
        let second = connect(&fixture).await;
        authenticate(&fixture, &second, "shared-install").await;

        assert!(second.is_registered());
        assert_eq!(fixture.proxy.disconnects(), [first.id]);
        // The evicted session got a close frame first.
        let types = fixture.proxy.frame_types(first.id);
        assert_eq!(*types.last().unwrap(), NHT_CLOSE);
    }

    #[tokio::test]
    async fn test_sensitive_frame_before_registration_ignored() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;

        let mut packer = frame(NHT_TIME_RETRIEVAL);
        packer.pack_long(0);
        packer.pack_long(i64::MAX);
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        // Only the INFORMATION frame; no reply, no disconnect.
        assert_eq!(fixture.proxy.frame_types(conn.id), [NHT_INFORMATION]);
        assert!(fixture.proxy.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;

        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), frame(NHT_PING).into_bytes(), false)
            .await;

        let types = fixture.proxy.frame_types(conn.id);
        assert_eq!(*types.last().unwrap(), NHT_PONG);
        // Pong travels cleartext so unauthenticated peers can keep alive.
        let (_, sent) = fixture.proxy.sent.lock().unwrap().last().unwrap().clone();
        assert!(!sent.encrypt);
    }

    #[tokio::test]
    async fn test_time_retrieval_returns_ranged_messages() {
        let fixture = fixture(Some("pw"));
        fixture.store.push_message(Message {
            guid: "early".into(),
            chat_guid: "chat-1".into(),
            sender: None,
            text: Some("old".into()),
            date: 100,
            attachments: Vec::new(),
            modifiers: Vec::new(),
        });
        fixture.store.push_message(Message {
            guid: "late".into(),
            chat_guid: "chat-1".into(),
            sender: None,
            text: Some("new".into()),
            date: 900,
            attachments: Vec::new(),
            modifiers: Vec::new(),
        });

        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        let mut packer = frame(NHT_TIME_RETRIEVAL);
        packer.pack_long(500);
        packer.pack_long(1000);
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_MESSAGE_UPDATE);
        let messages: Vec<Message> = unpacker.unpack_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].guid, "late");
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_ignored() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;
        let count_before = fixture.proxy.sent_frames(conn.id).len();

        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), frame(9999).into_bytes(), true)
            .await;

        assert_eq!(fixture.proxy.sent_frames(conn.id).len(), count_before);
        assert!(fixture.proxy.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_send_text_reports_unsupported_automation() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        let mut packer = frame(NHT_SEND_TEXT_EXISTING);
        packer.pack_short(41);
        packer.pack_string("chat-1");
        packer.pack_string("hello");
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_SEND_RESULT);
        assert_eq!(unpacker.unpack_short().unwrap(), 41);
        assert_eq!(unpacker.unpack_int().unwrap(), send_result::UNSUPPORTED);
    }

    #[tokio::test]
    async fn test_mass_retrieval_pages_and_finishes() {
        let fixture = fixture(Some("pw"));
        for i in 0..45 {
            fixture.store.push_message(Message {
                guid: format!("m{i}"),
                chat_guid: "chat-1".into(),
                sender: None,
                text: Some(format!("message {i}")),
                date: i,
                attachments: Vec::new(),
                modifiers: Vec::new(),
            });
        }
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        mass_retrieval::run(fixture.manager.clone(), conn.clone(), 3)
            .await
            .unwrap();

        let frames = fixture.proxy.sent_frames(conn.id);
        // Index frame first.
        let index_frame = frames
            .iter()
            .find(|data| Unpacker::new(data).unpack_int().unwrap() == NHT_MASS_RETRIEVAL)
            .unwrap();
        let mut unpacker = Unpacker::new(index_frame);
        unpacker.unpack_int().unwrap();
        assert_eq!(unpacker.unpack_short().unwrap(), 3);
        let _conversations: Vec<crate::store::ConversationSummary> =
            unpacker.unpack_array().unwrap();
        assert_eq!(unpacker.unpack_int().unwrap(), 45);

        // 45 messages in batches of 20 means three data pages.
        let mut paged = 0usize;
        for data in &frames {
            let mut unpacker = Unpacker::new(data);
            if unpacker.unpack_int().unwrap() != NHT_MASS_RETRIEVAL_DATA {
                continue;
            }
            assert_eq!(unpacker.unpack_short().unwrap(), 3);
            unpacker.unpack_int().unwrap();
            let messages: Vec<Message> = unpacker.unpack_array().unwrap();
            paged += messages.len();
        }
        assert_eq!(paged, 45);

        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_MASS_RETRIEVAL_FINISH);
        assert_eq!(unpacker.unpack_short().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_attachment_request_for_missing_guid_fails() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        let mut packer = frame(NHT_ATTACHMENT_REQ);
        packer.pack_short(7);
        packer.pack_string("no-such-attachment");
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_ATTACHMENT_REQ_FAIL);
        assert_eq!(unpacker.unpack_short().unwrap(), 7);
        assert_eq!(unpacker.unpack_int().unwrap(), attachment_fail::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_truncated_upload_packet_leaves_no_pending_state() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        let mut packer = frame(NHT_SEND_FILE_EXISTING);
        packer.pack_short(14);
        packer.pack_int(0);
        packer.pack_bool(false);
        packer.pack_string("chat-1");
        packer.pack_string("upload.bin");
        // Metadata is valid but the payload field is missing entirely.
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        // The malformed packet must not open an upload slot, or its
        // staging directory would sit on disk with no idle timer armed.
        assert!(fixture.manager.downloads.is_empty());
    }

    #[tokio::test]
    async fn test_mass_retrieval_ignored_while_one_is_running() {
        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        fixture
            .manager
            .retrievals_in_flight
            .lock()
            .unwrap()
            .insert(conn.id);

        let mut packer = frame(NHT_MASS_RETRIEVAL);
        packer.pack_short(21);
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = fixture.proxy.sent_frames(conn.id);
        assert!(!frames.iter().any(|data| {
            Unpacker::new(data)
                .unpack_int()
                .is_ok_and(|t| t == NHT_MASS_RETRIEVAL)
        }));

        // Once the running sweep is gone a new request goes through and
        // clears its own guard entry when it finishes.
        fixture
            .manager
            .retrievals_in_flight
            .lock()
            .unwrap()
            .remove(&conn.id);
        let mut packer = frame(NHT_MASS_RETRIEVAL);
        packer.pack_short(22);
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let started = fixture.proxy.sent_frames(conn.id).iter().any(|data| {
                    Unpacker::new(data)
                        .unpack_int()
                        .is_ok_and(|t| t == NHT_MASS_RETRIEVAL)
                });
                if started
                    && !fixture
                        .manager
                        .retrievals_in_flight
                        .lock()
                        .unwrap()
                        .contains(&conn.id)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second sweep never ran");
    }

    #[tokio::test]
    async fn test_attachment_request_streams_file_chunks() {
        use std::io::{Read as _, Write as _};

        let fixture = fixture(Some("pw"));
        let conn = connect(&fixture).await;
        authenticate(&fixture, &conn, "install-1").await;

        let content: Vec<u8> = (0..4096u32).flat_map(|i| i.to_be_bytes()).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&content).unwrap();
        fixture.store.insert_attachment_file(
            "att-1",
            AttachmentFile {
                path: file.path().to_path_buf(),
                name: "photo.png".into(),
                mime_type: Some("image/png".into()),
            },
        );

        let mut packer = frame(NHT_ATTACHMENT_REQ);
        packer.pack_short(9);
        packer.pack_string("att-1");
        fixture
            .manager
            .clone()
            .handle_frame(conn.clone(), packer.into_bytes(), true)
            .await;

        let frames = fixture.proxy.sent_frames(conn.id);
        let mut unpacker = Unpacker::new(frames.last().unwrap());
        assert_eq!(unpacker.unpack_int().unwrap(), NHT_ATTACHMENT_REQ_CONFIRM);
        assert_eq!(unpacker.unpack_short().unwrap(), 9);

        // The chunk stream runs on its own task; poll for the first chunk.
        let chunk = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = fixture.proxy.sent_frames(conn.id).into_iter().find(|data| {
                    Unpacker::new(data)
                        .unpack_int()
                        .is_ok_and(|t| t == NHT_ATTACHMENT_REQ)
                });
                if let Some(frame) = found {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no attachment chunk within 5s");

        let mut unpacker = Unpacker::new(&chunk);
        unpacker.unpack_int().unwrap();
        assert_eq!(unpacker.unpack_short().unwrap(), 9);
        assert_eq!(unpacker.unpack_string().unwrap(), "att-1");
        assert_eq!(unpacker.unpack_int().unwrap(), 0);
        // 16 KiB fits in one chunk, so it is also the last one.
        assert!(unpacker.unpack_bool().unwrap());
        assert_eq!(unpacker.unpack_long().unwrap(), content.len() as i64);

        let compressed = unpacker.unpack_payload().unwrap();
        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, content);
    }
}
