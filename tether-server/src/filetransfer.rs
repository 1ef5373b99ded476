// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! File Transfer Reassembly
//!
//! Inbound file sends arrive as ordered, zlib-compressed packets, each
//! tagged with a client-chosen request id, a packet index, and a last-packet
//! flag. This module tracks every in-flight upload, inflates packets as
//! they arrive, and appends the plaintext to a staging file under a
//! per-upload temp directory.
//!
//! Packets must arrive strictly in order. Any violation (gap, duplicate
//! index, data past the end of the compression stream, a last flag that
//! disagrees with the stream) aborts the upload and discards its staging
//! directory; the client is expected to restart the send.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use flate2::{Decompress, FlushDecompress, Status};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ClientId;

const INFLATE_CHUNK: usize = 32 * 1024;

/// Download error types.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request id {0} is already in flight")]
    DuplicateRequest(i16),
    #[error("packet out of order: expected index {expected}, got {got}")]
    OutOfOrder { expected: i32, got: i32 },
    #[error("data received past the end of the compression stream")]
    WriteAfterComplete,
    #[error("last-packet flag disagrees with the compression stream")]
    StreamMismatch,
    #[error("inflate failed: {0}")]
    Decompress(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the finished file should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadContext {
    ExistingChat {
        chat_guid: String,
    },
    NewChat {
        members: Vec<String>,
        service: String,
    },
}

/// One in-flight chunked upload.
struct FileDownloadRequest {
    dir: PathBuf,
    path: PathBuf,
    file: File,
    file_name: String,
    context: DownloadContext,
    stream: Decompress,
    stream_ended: bool,
    packets_written: i32,
    idle: CancellationToken,
}

impl FileDownloadRequest {
    fn new(file_name: &str, context: DownloadContext) -> Result<Self, DownloadError> {
        let dir = std::env::temp_dir().join(format!("tether-upload-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        Ok(FileDownloadRequest {
            dir,
            path,
            file,
            file_name: file_name.to_string(),
            context,
            stream: Decompress::new(true),
            stream_ended: false,
            packets_written: 0,
            idle: CancellationToken::new(),
        })
    }

    /// Inflates one packet and appends the plaintext to the staging file.
    fn write_packet(&mut self, input: &[u8]) -> Result<(), DownloadError> {
        if self.stream_ended && !input.is_empty() {
            return Err(DownloadError::WriteAfterComplete);
        }

        let mut consumed = 0usize;
        let mut buf = vec![0u8; INFLATE_CHUNK];
        while consumed < input.len() {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self
                .stream
                .decompress(&input[consumed..], &mut buf, FlushDecompress::None)
                .map_err(|err| DownloadError::Decompress(err.to_string()))?;
            let read = (self.stream.total_in() - before_in) as usize;
            let wrote = (self.stream.total_out() - before_out) as usize;
            consumed += read;
            self.file.write_all(&buf[..wrote])?;

            match status {
                Status::StreamEnd => {
                    self.stream_ended = true;
                    if consumed < input.len() {
                        return Err(DownloadError::WriteAfterComplete);
                    }
                }
                Status::Ok | Status::BufError => {
                    // No forward progress with input left means the stream
                    // is stuck.
                    if read == 0 && wrote == 0 {
                        return Err(DownloadError::Decompress(
                            "inflate made no progress".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn discard(self) {
        self.idle.cancel();
        drop(self.file);
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            warn!("failed to remove staging dir {}: {err}", self.dir.display());
        }
    }
}

/// Outcome of feeding one packet into [`PendingDownloads::append`].
#[derive(Debug)]
pub enum PacketOutcome {
    /// Packet accepted; the token cancels when the next packet arrives or
    /// the upload ends, and arms the idle timeout until then.
    Accepted(CancellationToken),
    /// No upload with that request id is in flight. Not an error: the
    /// upload may have been timed out or aborted already.
    Ignored,
    /// The final packet landed and the file is fully reassembled.
    Complete(CompletedDownload),
}

/// A fully reassembled upload, ready to hand to automation.
#[derive(Debug)]
pub struct CompletedDownload {
    pub client: ClientId,
    pub request_id: i16,
    pub path: PathBuf,
    pub file_name: String,
    pub context: DownloadContext,
    dir: PathBuf,
}

impl CompletedDownload {
    /// Removes the staging directory and the file inside it.
    pub fn cleanup(self) {
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            warn!("failed to remove staging dir {}: {err}", self.dir.display());
        }
    }
}

/// All in-flight uploads, keyed by connection and request id.
///
/// The lock is never held across file I/O: entries are taken out of the
/// map, worked on, and reinserted.
#[derive(Default)]
pub struct PendingDownloads {
    map: Mutex<HashMap<(ClientId, i16), FileDownloadRequest>>,
}

impl PendingDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new upload slot. A duplicate request id aborts the previous
    /// upload and rejects the new one; the client state is clearly broken.
    pub fn start_request(
        &self,
        client: ClientId,
        request_id: i16,
        file_name: &str,
        context: DownloadContext,
    ) -> Result<(), DownloadError> {
        let request = FileDownloadRequest::new(file_name, context)?;
        let previous = self
            .map
            .lock()
            .unwrap()
            .insert((client, request_id), request);
        if let Some(previous) = previous {
            previous.discard();
            if let Some(request) = self.map.lock().unwrap().remove(&(client, request_id)) {
                request.discard();
            }
            return Err(DownloadError::DuplicateRequest(request_id));
        }
        Ok(())
    }

    /// Feeds one packet into an upload. On any error the upload is aborted
    /// and its staging directory removed.
    pub fn append(
        &self,
        client: ClientId,
        request_id: i16,
        index: i32,
        is_last: bool,
        data: &[u8],
    ) -> Result<PacketOutcome, DownloadError> {
        let key = (client, request_id);
        let Some(mut request) = self.map.lock().unwrap().remove(&key) else {
            return Ok(PacketOutcome::Ignored);
        };
        request.idle.cancel();

        if index != request.packets_written {
            let expected = request.packets_written;
            request.discard();
            return Err(DownloadError::OutOfOrder {
                expected,
                got: index,
            });
        }

        if let Err(err) = request.write_packet(data) {
            request.discard();
            return Err(err);
        }
        request.packets_written += 1;

        if is_last != request.stream_ended {
            request.discard();
            return Err(DownloadError::StreamMismatch);
        }

        if is_last {
            if let Err(err) = request.file.flush() {
                request.discard();
                return Err(err.into());
            }
            debug!(
                "upload {request_id} from client {client} complete ({} packets)",
                request.packets_written
            );
            return Ok(PacketOutcome::Complete(CompletedDownload {
                client,
                request_id,
                path: request.path,
                file_name: request.file_name,
                context: request.context,
                dir: request.dir,
            }));
        }

        let idle = CancellationToken::new();
        request.idle = idle.clone();
        self.map.lock().unwrap().insert(key, request);
        Ok(PacketOutcome::Accepted(idle))
    }

    /// Aborts an upload that went idle. Returns true if it was in flight.
    pub fn timeout(&self, client: ClientId, request_id: i16) -> bool {
        match self.map.lock().unwrap().remove(&(client, request_id)) {
            Some(request) => {
                debug!("upload {request_id} from client {client} timed out");
                request.discard();
                true
            }
            None => false,
        }
    }

    /// Aborts every upload belonging to a disconnecting client.
    pub fn abort_for_client(&self, client: ClientId) {
        let removed: Vec<FileDownloadRequest> = {
            let mut map = self.map.lock().unwrap();
            let keys: Vec<_> = map
                .keys()
                .filter(|(owner, _)| *owner == client)
                .copied()
                .collect();
            keys.into_iter().filter_map(|key| map.remove(&key)).collect()
        };
        for request in removed {
            request.discard();
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
