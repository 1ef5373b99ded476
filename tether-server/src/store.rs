// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Store
//!
//! Read access to the host's message history: conversations, messages,
//! attachments, and the modifiers (tapbacks, edits) applied to them.
//!
//! The record types here double as wire types; their `Packable` and
//! `Unpackable` impls define the exact field order clients parse. Changing
//! the order is a protocol break.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use tether_core::{CodecError, Packable, Packer, Unpackable, Unpacker};

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record with guid {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store backend: {0}")]
    Backend(String),
}

/// A conversation, summarized for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub guid: String,
    /// Messaging service the conversation lives on, e.g. `iMessage`.
    pub service: String,
    pub name: Option<String>,
    pub members: Vec<String>,
}

impl Packable for ConversationSummary {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_string(&self.guid);
        packer.pack_string(&self.service);
        packer.pack_optional_string(self.name.as_deref());
        packer.pack_array(&self.members);
    }
}

impl Unpackable for ConversationSummary {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(ConversationSummary {
            guid: unpacker.unpack_string()?,
            service: unpacker.unpack_string()?,
            name: unpacker.unpack_optional_string()?,
            members: unpacker.unpack_array()?,
        })
    }
}

/// Attachment metadata carried inside a message record. The attachment
/// content itself travels separately, in compressed chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub guid: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: i64,
}

impl Packable for Attachment {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_string(&self.guid);
        packer.pack_string(&self.name);
        packer.pack_optional_string(self.mime_type.as_deref());
        packer.pack_long(self.size);
    }
}

impl Unpackable for Attachment {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Attachment {
            guid: unpacker.unpack_string()?,
            name: unpacker.unpack_string()?,
            mime_type: unpacker.unpack_optional_string()?,
            size: unpacker.unpack_long()?,
        })
    }
}

// Wire tags for the modifier variants.
const MODIFIER_TAPBACK: i32 = 0;
const MODIFIER_EDIT: i32 = 1;

/// A change applied to an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    /// A reaction attached to a message.
    Tapback {
        message_guid: String,
        sender: Option<String>,
        code: i32,
    },
    /// A post-hoc edit of a message's text.
    Edit {
        message_guid: String,
        new_text: String,
    },
}

impl Modifier {
    /// Guid of the message this modifier applies to.
    pub fn message_guid(&self) -> &str {
        match self {
            Modifier::Tapback { message_guid, .. } => message_guid,
            Modifier::Edit { message_guid, .. } => message_guid,
        }
    }
}

impl Packable for Modifier {
    fn pack(&self, packer: &mut Packer) {
        match self {
            Modifier::Tapback {
                message_guid,
                sender,
                code,
            } => {
                packer.pack_int(MODIFIER_TAPBACK);
                packer.pack_string(message_guid);
                packer.pack_optional_string(sender.as_deref());
                packer.pack_int(*code);
            }
            Modifier::Edit {
                message_guid,
                new_text,
            } => {
                packer.pack_int(MODIFIER_EDIT);
                packer.pack_string(message_guid);
                packer.pack_string(new_text);
            }
        }
    }
}

impl Unpackable for Modifier {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        match unpacker.unpack_int()? {
            MODIFIER_TAPBACK => Ok(Modifier::Tapback {
                message_guid: unpacker.unpack_string()?,
                sender: unpacker.unpack_optional_string()?,
                code: unpacker.unpack_int()?,
            }),
            MODIFIER_EDIT => Ok(Modifier::Edit {
                message_guid: unpacker.unpack_string()?,
                new_text: unpacker.unpack_string()?,
            }),
            _ => Err(CodecError::Encoding),
        }
    }
}

/// One message as surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub guid: String,
    pub chat_guid: String,
    /// `None` for messages sent from this server's own account.
    pub sender: Option<String>,
    pub text: Option<String>,
    /// Unix milliseconds.
    pub date: i64,
    pub attachments: Vec<Attachment>,
    pub modifiers: Vec<Modifier>,
}

impl Packable for Message {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_string(&self.guid);
        packer.pack_string(&self.chat_guid);
        packer.pack_optional_string(self.sender.as_deref());
        packer.pack_optional_string(self.text.as_deref());
        packer.pack_long(self.date);
        packer.pack_array(&self.attachments);
        packer.pack_array(&self.modifiers);
    }
}

impl Unpackable for Message {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Message {
            guid: unpacker.unpack_string()?,
            chat_guid: unpacker.unpack_string()?,
            sender: unpacker.unpack_optional_string()?,
            text: unpacker.unpack_optional_string()?,
            date: unpacker.unpack_long()?,
            attachments: unpacker.unpack_array()?,
            modifiers: unpacker.unpack_array()?,
        })
    }
}

/// An attachment resolved to a readable file on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    pub path: PathBuf,
    pub name: String,
    pub mime_type: Option<String>,
}

/// One page of a mass retrieval sweep.
///
/// `loose_modifiers` are modifiers whose target message falls outside this
/// page; the retrieval task buffers them in case the target shows up later.
#[derive(Debug, Clone, Default)]
pub struct MassRetrievalPage {
    pub messages: Vec<Message>,
    pub loose_modifiers: Vec<Modifier>,
}

/// Read access to the host message database.
pub trait MessageStore: Send + Sync {
    /// Highest message rowid currently in the store.
    fn latest_message_id(&self) -> Result<i64, StoreError>;

    /// Messages dated within `[start, end]`, ascending by date.
    fn messages_in_range(&self, start: i64, end: i64) -> Result<Vec<Message>, StoreError>;

    /// Messages with rowid greater than `id`, ascending.
    fn messages_since_id(&self, id: i64) -> Result<Vec<Message>, StoreError>;

    /// Summaries for the requested conversation guids. Unknown guids are
    /// omitted from the result, not an error.
    fn conversations(&self, guids: &[String]) -> Result<Vec<ConversationSummary>, StoreError>;

    /// All conversations plus the total message count, for sizing a mass
    /// retrieval up front.
    fn mass_retrieval_index(&self) -> Result<(Vec<ConversationSummary>, i32), StoreError>;

    /// One page of messages for mass retrieval, oldest first.
    fn mass_retrieval_page(&self, offset: i32, limit: i32)
        -> Result<MassRetrievalPage, StoreError>;

    /// Resolves an attachment guid to its file on disk.
    fn attachment_file(&self, guid: &str) -> Result<AttachmentFile, StoreError>;
}

/// Store backed by in-process memory. Stands in where no host database is
/// wired up, and carries the scripted fixtures in tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    /// Messages in insertion order; the rowid of a message is its index + 1.
    messages: Vec<Message>,
    conversations: Vec<ConversationSummary>,
    attachment_files: HashMap<String, AttachmentFile>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_message(&self, message: Message) {
        self.inner.lock().unwrap().messages.push(message);
    }

    pub fn push_conversation(&self, conversation: ConversationSummary) {
        self.inner.lock().unwrap().conversations.push(conversation);
    }

    pub fn insert_attachment_file(&self, guid: impl Into<String>, file: AttachmentFile) {
        self.inner
            .lock()
            .unwrap()
            .attachment_files
            .insert(guid.into(), file);
    }
}

impl MessageStore for InMemoryStore {
    fn latest_message_id(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().messages.len() as i64)
    }

    fn messages_in_range(&self, start: i64, end: i64) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.date >= start && m.date <= end)
            .cloned()
            .collect())
    }

    fn messages_since_id(&self, id: i64) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let skip = id.max(0) as usize;
        Ok(inner.messages.iter().skip(skip).cloned().collect())
    }

    fn conversations(&self, guids: &[String]) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(guids
            .iter()
            .filter_map(|guid| inner.conversations.iter().find(|c| &c.guid == guid))
            .cloned()
            .collect())
    }

    fn mass_retrieval_index(&self) -> Result<(Vec<ConversationSummary>, i32), StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.conversations.clone(), inner.messages.len() as i32))
    }

    fn mass_retrieval_page(
        &self,
        offset: i32,
        limit: i32,
    ) -> Result<MassRetrievalPage, StoreError> {
        let inner = self.inner.lock().unwrap();
        let messages: Vec<Message> = inner
            .messages
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(MassRetrievalPage {
            messages,
            loose_modifiers: Vec::new(),
        })
    }

    fn attachment_file(&self, guid: &str) -> Result<AttachmentFile, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .attachment_files
            .get(guid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(guid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(guid: &str, date: i64) -> Message {
        Message {
            guid: guid.into(),
            chat_guid: "chat-1".into(),
            sender: Some("friend@example.com".into()),
            text: Some("hey".into()),
            date,
            attachments: Vec::new(),
            modifiers: Vec::new(),
        }
    }

    #[test]
    fn test_message_wire_roundtrip() {
        let original = Message {
            guid: "msg-1".into(),
            chat_guid: "chat-1".into(),
            sender: None,
            text: Some("photo incoming".into()),
            date: 1_700_000_000_000,
            attachments: vec![Attachment {
                guid: "att-1".into(),
                name: "photo.jpg".into(),
                mime_type: Some("image/jpeg".into()),
                size: 48_213,
            }],
            modifiers: vec![
                Modifier::Tapback {
                    message_guid: "msg-1".into(),
                    sender: Some("friend@example.com".into()),
                    code: 2,
                },
                Modifier::Edit {
                    message_guid: "msg-1".into(),
                    new_text: "photo incoming!".into(),
                },
            ],
        };

        let mut packer = Packer::new();
        original.pack(&mut packer);
        let bytes = packer.into_bytes();

        let mut unpacker = Unpacker::new(&bytes);
        let decoded = Message::unpack(&mut unpacker).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(unpacker.remaining(), 0);
    }

    #[test]
    fn test_unknown_modifier_tag_is_an_encoding_error() {
        let mut packer = Packer::new();
        packer.pack_int(99);
        packer.pack_string("msg-1");
        let bytes = packer.into_bytes();

        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(
            Modifier::unpack(&mut unpacker),
            Err(CodecError::Encoding)
        );
    }

    #[test]
    fn test_in_memory_range_and_since_queries() {
        let store = InMemoryStore::new();
        store.push_message(message("a", 100));
        store.push_message(message("b", 200));
        store.push_message(message("c", 300));

        assert_eq!(store.latest_message_id().unwrap(), 3);

        let ranged = store.messages_in_range(150, 300).unwrap();
        assert_eq!(
            ranged.iter().map(|m| m.guid.as_str()).collect::<Vec<_>>(),
            ["b", "c"]
        );

        let since = store.messages_since_id(2).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].guid, "c");
    }

    #[test]
    fn test_conversation_lookup_omits_unknown_guids() {
        let store = InMemoryStore::new();
        store.push_conversation(ConversationSummary {
            guid: "chat-1".into(),
            service: "iMessage".into(),
            name: None,
            members: vec!["friend@example.com".into()],
        });

        let found = store
            .conversations(&["chat-1".into(), "chat-404".into()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].guid, "chat-1");
    }

    #[test]
    fn test_mass_retrieval_paging() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.push_message(message(&format!("m{i}"), i * 100));
        }

        let (_, total) = store.mass_retrieval_index().unwrap();
        assert_eq!(total, 5);

        let page = store.mass_retrieval_page(2, 2).unwrap();
        assert_eq!(
            page.messages
                .iter()
                .map(|m| m.guid.as_str())
                .collect::<Vec<_>>(),
            ["m2", "m3"]
        );
    }

    #[test]
    fn test_missing_attachment_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.attachment_file("nope"),
            Err(StoreError::NotFound(_))
        ));
    }
}
