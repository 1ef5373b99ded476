// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mass Retrieval
//!
//! Full-history sweep for a freshly linked client. Runs as its own task:
//! an index frame sizing the transfer, message pages in fixed batches,
//! attachment files in compressed chunks, and a finish frame.
//!
//! A client that disconnects mid-sweep just stops receiving; the task
//! notices before the next send and exits without an error.

use std::sync::Arc;

use tracing::debug;

use tether_core::protocol::{
    NHT_MASS_RETRIEVAL, NHT_MASS_RETRIEVAL_DATA, NHT_MASS_RETRIEVAL_FILE,
    NHT_MASS_RETRIEVAL_FINISH,
};

use crate::connection::ClientConnection;
use crate::store::{Message, Modifier, StoreError};

use super::{deflate, frame, read_up_to, ConnectionManager, ManagerError};

pub(super) async fn run(
    manager: Arc<ConnectionManager>,
    conn: Arc<ClientConnection>,
    request_id: i16,
) -> Result<(), ManagerError> {
    let (conversations, total) = manager.store.mass_retrieval_index()?;
    debug!(
        "[client {}] mass retrieval {request_id}: {} conversations, {total} messages",
        conn.id,
        conversations.len()
    );

    let mut packer = frame(NHT_MASS_RETRIEVAL);
    packer.pack_short(request_id);
    packer.pack_array(&conversations);
    packer.pack_int(total);
    manager.send_secure(conn.id, packer.into_bytes()).await?;

    let batch = manager.config.retrieval_batch_size;
    let mut offset: i32 = 0;
    let mut response_index: i32 = 1;
    let mut pending_modifiers: Vec<Modifier> = Vec::new();
    let mut attachments: Vec<String> = Vec::new();

    while offset < total {
        if !conn.is_connected() {
            return Ok(());
        }
        let page = manager.store.mass_retrieval_page(offset, batch)?;
        if page.messages.is_empty() && page.loose_modifiers.is_empty() {
            break;
        }

        let mut messages = page.messages;
        fold_modifiers(&mut messages, &mut pending_modifiers, page.loose_modifiers);

        for message in &messages {
            for attachment in &message.attachments {
                attachments.push(attachment.guid.clone());
            }
        }

        let mut packer = frame(NHT_MASS_RETRIEVAL_DATA);
        packer.pack_short(request_id);
        packer.pack_int(response_index);
        packer.pack_array(&messages);
        manager.send_secure(conn.id, packer.into_bytes()).await?;

        offset += batch;
        response_index += 1;
    }

    if !pending_modifiers.is_empty() {
        // Their target messages never paged in; nothing to attach them to.
        debug!(
            "[client {}] mass retrieval {request_id}: dropping {} orphaned modifiers",
            conn.id,
            pending_modifiers.len()
        );
    }

    for guid in attachments {
        if !conn.is_connected() {
            return Ok(());
        }
        match manager.store.attachment_file(&guid) {
            Ok(file) => {
                stream_file(&manager, &conn, request_id, &guid, &file.path).await?;
            }
            Err(StoreError::NotFound(_)) => {
                debug!(
                    "[client {}] mass retrieval {request_id}: attachment {guid} has no file",
                    conn.id
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    let mut packer = frame(NHT_MASS_RETRIEVAL_FINISH);
    packer.pack_short(request_id);
    manager.send_secure(conn.id, packer.into_bytes()).await?;
    debug!("[client {}] mass retrieval {request_id} finished", conn.id);
    Ok(())
}

/// Attaches buffered modifiers to any message in this page that they
/// target, then buffers the page's own loose modifiers for later pages.
fn fold_modifiers(
    messages: &mut [Message],
    pending: &mut Vec<Modifier>,
    incoming: Vec<Modifier>,
) {
    pending.retain(|modifier| {
        match messages
            .iter_mut()
            .find(|message| message.guid == modifier.message_guid())
        {
            Some(message) => {
                message.modifiers.push(modifier.clone());
                false
            }
            None => true,
        }
    });
    pending.extend(incoming);
}

/// Streams one attachment file as
/// `[i16 rid][string guid][i32 index][bool last][payload]` chunks.
async fn stream_file(
    manager: &Arc<ConnectionManager>,
    conn: &Arc<ClientConnection>,
    request_id: i16,
    guid: &str,
    path: &std::path::Path,
) -> Result<(), ManagerError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut index: i32 = 0;
    let mut buf = vec![0u8; manager.config.attachment_chunk_size];
    loop {
        let read = read_up_to(&mut file, &mut buf).await?;
        let is_last = read < buf.len();
        if !conn.is_connected() {
            return Ok(());
        }
        let compressed = deflate(&buf[..read])?;

        let mut packer = frame(NHT_MASS_RETRIEVAL_FILE);
        packer.pack_short(request_id);
        packer.pack_string(guid);
        packer.pack_int(index);
        packer.pack_bool(is_last);
        packer.pack_payload(&compressed);
        manager.send_secure(conn.id, packer.into_bytes()).await?;

        if is_last {
            return Ok(());
        }
        index += 1;
    }
}
