// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared test doubles and helpers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tether_core::Unpacker;
use tether_server::{ClientId, DataProxy, OutboundFrame, SendTarget, TransportError};

/// Transport double that records everything the manager sends.
pub struct MockProxy {
    sent: Mutex<Vec<(SendTarget, OutboundFrame)>>,
    disconnected: Mutex<Vec<ClientId>>,
}

impl MockProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(MockProxy {
            sent: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        })
    }

    pub fn frames_for(&self, client: ClientId) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| *target == SendTarget::Client(client))
            .map(|(_, frame)| frame.data.clone())
            .collect()
    }

    pub fn disconnects(&self) -> Vec<ClientId> {
        self.disconnected.lock().unwrap().clone()
    }

    /// Polls until the manager has sent a frame of the given type to the
    /// client, and returns its body.
    pub async fn wait_for_frame(&self, client: ClientId, message_type: i32) -> Vec<u8> {
        let deadline = Duration::from_secs(5);
        let found = tokio::time::timeout(deadline, async {
            loop {
                let frame = self.frames_for(client).into_iter().find(|data| {
                    Unpacker::new(data)
                        .unpack_int()
                        .is_ok_and(|t| t == message_type)
                });
                if let Some(frame) = frame {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("no frame of type {message_type} within {deadline:?}"))
    }
}

#[async_trait]
impl DataProxy for MockProxy {
    fn requires_authentication(&self) -> bool {
        true
    }

    fn requires_persistence(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn send(&self, target: SendTarget, frame: OutboundFrame) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((target, frame));
        Ok(())
    }

    async fn disconnect(&self, client: ClientId) {
        self.disconnected.lock().unwrap().push(client);
    }
}
