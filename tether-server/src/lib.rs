// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tether Server
//!
//! Message-relay server: accepts client connections over a direct TCP
//! listener or a persistent cloud relay link, authenticates sessions,
//! and serves the message history and outbound send operations of the
//! host it runs on.
//!
//! The [`manager::ConnectionManager`] orchestrates everything; transports
//! implement [`transport::DataProxy`]; host capabilities plug in through
//! the [`store::MessageStore`], [`automation::Automation`], and
//! [`updates::UpdateProvider`] traits.

pub mod automation;
pub mod config;
pub mod connection;
pub mod filetransfer;
pub mod manager;
pub mod store;
pub mod transport;
pub mod updates;

pub use automation::{Automation, AutomationError, UnavailableAutomation};
pub use config::{ProxyKind, ServerConfig};
pub use connection::{ClientConnection, ClientId, ClientRegistration, ConnectionRegistry};
pub use manager::{ConnectionManager, ManagerConfig, ManagerError};
pub use store::{InMemoryStore, Message, MessageStore, StoreError};
pub use transport::{
    DataProxy, OutboundFrame, ProxyEvent, RelayProxy, RelayProxyConfig, SendTarget, ServerState,
    TcpProxy, TcpProxyConfig, TransportError,
};
pub use updates::{NoUpdates, PendingUpdate, UpdateProvider};
