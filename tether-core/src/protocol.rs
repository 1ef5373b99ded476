// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol Constants
//!
//! The numeric frame-type table and result codes shared between server and
//! clients. Every frame starts with an `i32` message type drawn from this
//! table; the grouping into standard (usable before authentication) and
//! sensitive (require a completed handshake) categories is part of the wire
//! contract and must be preserved byte-for-byte across versions.

/// Protocol major version, sent on every handshake and push envelope.
pub const COMM_VERSION: i32 = 5;
/// Protocol sub-version for backward-compatible additions.
pub const COMM_SUB_VERSION: i32 = 2;

/// Length of the random transmission check issued at connect time.
pub const TRANSMISSION_CHECK_LEN: usize = 32;

// Standard frame types (usable before authentication).
pub const NHT_CLOSE: i32 = 0;
pub const NHT_PING: i32 = 1;
pub const NHT_PONG: i32 = 2;
pub const NHT_INFORMATION: i32 = 100;
pub const NHT_AUTHENTICATION: i32 = 101;

// Message retrieval.
pub const NHT_MESSAGE_UPDATE: i32 = 200;
pub const NHT_TIME_RETRIEVAL: i32 = 201;
pub const NHT_ID_RETRIEVAL: i32 = 202;
pub const NHT_MASS_RETRIEVAL: i32 = 203;
pub const NHT_MASS_RETRIEVAL_DATA: i32 = 204;
pub const NHT_MASS_RETRIEVAL_FILE: i32 = 205;
pub const NHT_MASS_RETRIEVAL_FINISH: i32 = 206;
pub const NHT_CONVERSATION_UPDATE: i32 = 207;
pub const NHT_MODIFIER_UPDATE: i32 = 208;
pub const NHT_ATTACHMENT_REQ: i32 = 209;
pub const NHT_ATTACHMENT_REQ_CONFIRM: i32 = 210;
pub const NHT_ATTACHMENT_REQ_FAIL: i32 = 211;
pub const NHT_ID_UPDATE: i32 = 212;

// Outgoing messages.
pub const NHT_SEND_RESULT: i32 = 300;
pub const NHT_SEND_TEXT_EXISTING: i32 = 301;
pub const NHT_SEND_TEXT_NEW: i32 = 302;
pub const NHT_SEND_FILE_EXISTING: i32 = 303;
pub const NHT_SEND_FILE_NEW: i32 = 304;
pub const NHT_CREATE_CHAT: i32 = 305;

// Software updates.
pub const NHT_SOFTWARE_UPDATE_LISTING: i32 = 400;
pub const NHT_SOFTWARE_UPDATE_INSTALL: i32 = 401;

// Call signaling.
pub const NHT_FACETIME_CREATE_LINK: i32 = 500;
pub const NHT_FACETIME_OUTGOING_INITIATE: i32 = 501;

/// Returns true when a frame type requires a completed authentication
/// handshake before it may be dispatched.
///
/// Unknown frame types are sensitive by default: a newer client's frames
/// are ignored rather than dispatched pre-authentication.
pub fn is_sensitive(message_type: i32) -> bool {
    !matches!(
        message_type,
        NHT_CLOSE | NHT_PING | NHT_PONG | NHT_INFORMATION | NHT_AUTHENTICATION
    )
}

/// Authentication result codes carried by the `NHT_AUTHENTICATION` response.
pub mod auth_result {
    pub const OK: i32 = 0;
    pub const UNAUTHORIZED: i32 = 1;
    pub const BAD_REQUEST: i32 = 2;
}

/// Result codes carried by `NHT_SEND_RESULT` frames.
pub mod send_result {
    pub const OK: i32 = 0;
    pub const SCRIPT_ERROR: i32 = 1;
    pub const BAD_REQUEST: i32 = 2;
    pub const UNAUTHORIZED: i32 = 3;
    pub const NO_CONVERSATION: i32 = 4;
    pub const REQUEST_TIMEOUT: i32 = 5;
    pub const INTERNAL: i32 = 6;
    pub const UNSUPPORTED: i32 = 7;
}

/// Failure codes carried by `NHT_ATTACHMENT_REQ_FAIL` frames.
pub mod attachment_fail {
    pub const NOT_FOUND: i32 = 0;
    pub const NOT_SAVED: i32 = 1;
    pub const IO: i32 = 2;
}
