// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client Connections
//!
//! Per-connection session state and the registry of live connections.
//!
//! A [`ClientConnection`] is created by a transport the instant a
//! network-level connection is accepted and removed from the registry on
//! disconnect, error, protocol violation, or duplicate-installation
//! eviction. Exactly one exists per live network connection.
//!
//! Session fields are read by the write path and written by the read path
//! concurrently, so they sit behind atomics and short-lived mutexes. The
//! registry lock is held only for lookups, inserts, and removals, never
//! across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;

/// Transport-scoped connection identifier. Unique per transport instance,
/// not guaranteed unique across transports.
pub type ClientId = u32;

/// Registration fields captured by a successful authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub installation_id: String,
    pub client_name: String,
    pub platform_id: String,
}

/// Named, cancelable timers scoped to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Disconnects the client if authentication does not complete in time.
    Handshake,
    /// Disconnects the client if it stays silent after a keepalive ping.
    Ping,
}

/// One logical remote session.
pub struct ClientConnection {
    /// Transport-scoped identifier.
    pub id: ClientId,
    registration: Mutex<Option<ClientRegistration>>,
    transmission_check: Mutex<Option<Vec<u8>>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    timers: Mutex<HashMap<TimerKind, CancellationToken>>,
}

impl ClientConnection {
    /// Creates a connection in the live, unauthenticated state.
    pub fn new(id: ClientId) -> Self {
        ClientConnection {
            id,
            registration: Mutex::new(None),
            transmission_check: Mutex::new(None),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true while the underlying channel is alive. Must be checked
    /// before any send to avoid writing to a dead transport.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flips the liveness flag to false; returns true only for the call
    /// that performed the flip. Cancels all timers and the shutdown token
    /// so the connection's read loop unwinds.
    pub fn mark_disconnected(&self) -> bool {
        let flipped = self.connected.swap(false, Ordering::AcqRel);
        if flipped {
            self.cancel_all_timers();
            self.shutdown.cancel();
        }
        flipped
    }

    /// Token canceled exactly once, at disconnect.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the registration, if the handshake has completed.
    pub fn registration(&self) -> Option<ClientRegistration> {
        self.registration.lock().unwrap().clone()
    }

    /// Returns true once the authentication handshake has completed.
    pub fn is_registered(&self) -> bool {
        self.registration.lock().unwrap().is_some()
    }

    /// Promotes the connection to the authenticated state.
    pub fn set_registration(&self, registration: ClientRegistration) {
        *self.registration.lock().unwrap() = Some(registration);
    }

    /// Stores the transmission check issued at connect time.
    pub fn issue_transmission_check(&self, check: Vec<u8>) {
        *self.transmission_check.lock().unwrap() = Some(check);
    }

    /// Takes the issued transmission check. Consumable at most once: a
    /// second call returns `None`.
    pub fn consume_transmission_check(&self) -> Option<Vec<u8>> {
        self.transmission_check.lock().unwrap().take()
    }

    /// Installs a timer token under `kind`, canceling any previous one.
    pub fn set_timer(&self, kind: TimerKind, token: CancellationToken) {
        if let Some(previous) = self.timers.lock().unwrap().insert(kind, token) {
            previous.cancel();
        }
    }

    /// Cancels and removes the timer under `kind`, if any.
    pub fn cancel_timer(&self, kind: TimerKind) {
        if let Some(token) = self.timers.lock().unwrap().remove(&kind) {
            token.cancel();
        }
    }

    fn cancel_all_timers(&self) {
        for (_, token) in self.timers.lock().unwrap().drain() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// The set of live connections owned by the active transport.
///
/// Guarded by a reader/writer lock since the accept loop, the write path,
/// and timer callbacks all touch it concurrently.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
    next_id: AtomicU32,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Creates and inserts a connection with a freshly allocated id.
    /// Used by transports that assign their own identifiers (direct TCP).
    pub fn register(&self) -> Arc<ClientConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(ClientConnection::new(id));
        self.connections.write().unwrap().insert(id, conn.clone());
        conn
    }

    /// Inserts a connection under an externally assigned id (relay-assigned
    /// client identifiers). Replaces and returns any stale entry.
    pub fn adopt(&self, id: ClientId) -> (Arc<ClientConnection>, Option<Arc<ClientConnection>>) {
        let conn = Arc::new(ClientConnection::new(id));
        let previous = self.connections.write().unwrap().insert(id, conn.clone());
        (conn, previous)
    }

    /// Looks up a live connection by id.
    pub fn get(&self, id: ClientId) -> Option<Arc<ClientConnection>> {
        self.connections.read().unwrap().get(&id).cloned()
    }

    /// Removes a connection from the live set.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientConnection>> {
        self.connections.write().unwrap().remove(&id)
    }

    /// Snapshot of the live set at call time (broadcast semantics).
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().unwrap().values().cloned().collect()
    }

    /// Finds another registered connection with the given installation id.
    /// Used for at-most-one-session-per-installation eviction.
    pub fn find_registered(
        &self,
        installation_id: &str,
        excluding: ClientId,
    ) -> Option<Arc<ClientConnection>> {
        self.connections
            .read()
            .unwrap()
            .values()
            .find(|conn| {
                conn.id != excluding
                    && conn
                        .registration()
                        .is_some_and(|reg| reg.installation_id == installation_id)
            })
            .cloned()
    }

    /// Removes every connection, returning them for teardown.
    pub fn drain(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .write()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
