// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Messaging Automation
//!
//! Outbound actions driven through the host's messaging application:
//! sending texts and files, creating chats, and FaceTime calls. The
//! manager holds this behind a trait so hosts without scripting support
//! (and tests) can plug in a stub.

use thiserror::Error;

use tether_core::protocol::send_result;

/// Automation error types.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation access not granted")]
    Unauthorized,
    #[error("no conversation with guid {0}")]
    NoSuchConversation(String),
    #[error("automation script failed: {0}")]
    Script(String),
    #[error("operation not supported on this host")]
    Unsupported,
}

impl AutomationError {
    /// The result code reported back to the requesting client.
    pub fn send_result_code(&self) -> i32 {
        match self {
            AutomationError::Unauthorized => send_result::UNAUTHORIZED,
            AutomationError::NoSuchConversation(_) => send_result::NO_CONVERSATION,
            AutomationError::Script(_) => send_result::SCRIPT_ERROR,
            AutomationError::Unsupported => send_result::UNSUPPORTED,
        }
    }
}

/// Outbound messaging actions. All methods are synchronous; callers run
/// them off the event loop when latency matters.
pub trait Automation: Send + Sync {
    /// Whether outbound actions can currently run at all. Reported to
    /// clients in the handshake response.
    fn is_available(&self) -> bool;

    /// Sends a text message to an existing conversation.
    fn send_text_existing(&self, chat_guid: &str, text: &str) -> Result<(), AutomationError>;

    /// Sends a text message to a set of recipients, creating the
    /// conversation if needed.
    fn send_text_new(
        &self,
        members: &[String],
        service: &str,
        text: &str,
    ) -> Result<(), AutomationError>;

    /// Sends a file to an existing conversation.
    fn send_file_existing(
        &self,
        chat_guid: &str,
        path: &std::path::Path,
    ) -> Result<(), AutomationError>;

    /// Sends a file to a set of recipients, creating the conversation if
    /// needed.
    fn send_file_new(
        &self,
        members: &[String],
        service: &str,
        path: &std::path::Path,
    ) -> Result<(), AutomationError>;

    /// Creates a conversation and returns its guid.
    fn create_chat(&self, members: &[String], service: &str) -> Result<String, AutomationError>;

    /// Creates a FaceTime link and returns its URL.
    fn create_facetime_link(&self) -> Result<String, AutomationError>;

    /// Starts an outgoing FaceTime call to the given addresses.
    fn initiate_facetime_call(&self, addresses: &[String]) -> Result<(), AutomationError>;
}

/// Automation stub for hosts with no scripting bridge. Every action fails
/// with [`AutomationError::Unsupported`].
#[derive(Debug, Default)]
pub struct UnavailableAutomation;

impl Automation for UnavailableAutomation {
    fn is_available(&self) -> bool {
        false
    }

    fn send_text_existing(&self, _chat_guid: &str, _text: &str) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported)
    }

    fn send_text_new(
        &self,
        _members: &[String],
        _service: &str,
        _text: &str,
    ) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported)
    }

    fn send_file_existing(
        &self,
        _chat_guid: &str,
        _path: &std::path::Path,
    ) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported)
    }

    fn send_file_new(
        &self,
        _members: &[String],
        _service: &str,
        _path: &std::path::Path,
    ) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported)
    }

    fn create_chat(&self, _members: &[String], _service: &str) -> Result<String, AutomationError> {
        Err(AutomationError::Unsupported)
    }

    fn create_facetime_link(&self) -> Result<String, AutomationError> {
        Err(AutomationError::Unsupported)
    }

    fn initiate_facetime_call(&self, _addresses: &[String]) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported)
    }
}
