// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tether Core Library
//!
//! Protocol layer shared by the Tether server and tooling: the length-framed
//! big-endian binary codec, the password-derived AEAD encryption envelope,
//! and the numeric frame-type table of the wire contract.
//! All cryptographic operations use the audited `ring` crate.

pub mod codec;
pub mod crypto;
pub mod protocol;

pub use codec::{CodecError, Packable, Packer, Unpackable, Unpacker, MAX_PAYLOAD_ALLOCATION};
pub use crypto::{decrypt, encrypt, random_bytes, CryptoError};
pub use protocol::{is_sensitive, COMM_SUB_VERSION, COMM_VERSION, TRANSMISSION_CHECK_LEN};
