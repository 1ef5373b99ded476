// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Binary Codec
//!
//! Sequential, cursor-based packing and unpacking of wire primitives over a
//! growable byte buffer. All multi-byte integers are big-endian. Byte
//! payloads and strings are length-prefixed with an `i32`; optional values
//! are a presence `bool` followed by the value; arrays are an `i32` count
//! followed by the elements.
//!
//! Encoding is append-only and never fails. Decoding fails with a typed
//! error when the buffer is exhausted, when a string payload is not valid
//! UTF-8, or when a declared payload length exceeds
//! [`MAX_PAYLOAD_ALLOCATION`] (protection against a corrupted or malicious
//! length field forcing a huge allocation).

use thiserror::Error;

/// Upper bound for any single declared payload length (50 MiB).
pub const MAX_PAYLOAD_ALLOCATION: usize = 50 * 1024 * 1024;

/// Codec error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer underrun: needed {needed} bytes, {remaining} remaining")]
    Range { needed: usize, remaining: usize },
    #[error("payload is not valid UTF-8 text")]
    Encoding,
    #[error("declared payload length {declared} exceeds limit {limit}")]
    Allocation { declared: i64, limit: usize },
}

/// A value that can be appended to a [`Packer`].
pub trait Packable {
    fn pack(&self, packer: &mut Packer);
}

/// A value that can be read back from an [`Unpacker`].
pub trait Unpackable: Sized {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError>;
}

impl Packable for String {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_string(self);
    }
}

impl Unpackable for String {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        unpacker.unpack_string()
    }
}

/// Append-only encoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    /// Creates an empty packer.
    pub fn new() -> Self {
        Packer { buf: Vec::new() }
    }

    /// Creates a packer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Packer {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Consumes the packer and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns the bytes encoded so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the number of bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends a boolean as a single byte (1 or 0).
    pub fn pack_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Appends a signed 16-bit integer, big-endian.
    pub fn pack_short(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a signed 32-bit integer, big-endian.
    pub fn pack_int(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a signed 64-bit integer, big-endian.
    pub fn pack_long(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a byte payload as `[i32 length][bytes]`.
    pub fn pack_payload(&mut self, payload: &[u8]) {
        self.pack_int(payload.len() as i32);
        self.buf.extend_from_slice(payload);
    }

    /// Appends a UTF-8 string as a byte payload.
    pub fn pack_string(&mut self, value: &str) {
        self.pack_payload(value.as_bytes());
    }

    /// Appends an optional value as `[bool present][value if present]`.
    pub fn pack_option<T: ?Sized>(&mut self, value: Option<&T>, pack: impl FnOnce(&mut Self, &T)) {
        match value {
            Some(inner) => {
                self.pack_bool(true);
                pack(self, inner);
            }
            None => self.pack_bool(false),
        }
    }

    /// Appends an optional string.
    pub fn pack_optional_string(&mut self, value: Option<&str>) {
        self.pack_option(value, |p, v| p.pack_string(v));
    }

    /// Appends an optional signed 64-bit integer.
    pub fn pack_optional_long(&mut self, value: Option<i64>) {
        self.pack_option(value.as_ref(), |p, v| p.pack_long(*v));
    }

    /// Appends raw bytes with no length prefix. The caller's framing must
    /// make the boundary recoverable (trailing field, outer length, etc).
    pub fn pack_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends an array as `[i32 count][elements...]`.
    pub fn pack_array<T: Packable>(&mut self, items: &[T]) {
        self.pack_int(items.len() as i32);
        for item in items {
            item.pack(self);
        }
    }
}

/// Cursor-based decoder over a borrowed byte buffer.
#[derive(Debug)]
pub struct Unpacker<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Unpacker<'a> {
    /// Creates an unpacker positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Unpacker { data, cursor: 0 }
    }

    /// Returns the number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Returns the current cursor position.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Rewinds the cursor by `width` bytes, clamping at the start.
    ///
    /// Used to reinterpret a tag byte as part of the next field when an
    /// optional encoding hint did not match any known value.
    pub fn backtrack(&mut self, width: usize) {
        self.cursor = self.cursor.saturating_sub(width);
    }

    /// Consumes and returns every byte left after the cursor.
    pub fn unpack_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.cursor..];
        self.cursor = self.data.len();
        rest
    }

    /// Takes `count` raw bytes, advancing the cursor.
    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < count {
            return Err(CodecError::Range {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.cursor..self.cursor + count];
        self.cursor += count;
        Ok(slice)
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn unpack_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.take(1)?[0] != 0)
    }

    /// Reads a signed 16-bit big-endian integer.
    pub fn unpack_short(&mut self) -> Result<i16, CodecError> {
        let bytes = self.take(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a signed 32-bit big-endian integer.
    pub fn unpack_int(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a signed 64-bit big-endian integer.
    pub fn unpack_long(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    /// Validates a declared payload or array length against the remaining
    /// input and the allocation ceiling.
    fn checked_length(&self, declared: i32) -> Result<usize, CodecError> {
        if declared < 0 || declared as usize > MAX_PAYLOAD_ALLOCATION {
            return Err(CodecError::Allocation {
                declared: i64::from(declared),
                limit: MAX_PAYLOAD_ALLOCATION,
            });
        }
        Ok(declared as usize)
    }

    /// Reads a `[i32 length][bytes]` payload.
    pub fn unpack_payload(&mut self) -> Result<Vec<u8>, CodecError> {
        let declared = self.unpack_int()?;
        let length = self.checked_length(declared)?;
        Ok(self.take(length)?.to_vec())
    }

    /// Reads a byte payload and decodes it as UTF-8.
    pub fn unpack_string(&mut self) -> Result<String, CodecError> {
        let payload = self.unpack_payload()?;
        String::from_utf8(payload).map_err(|_| CodecError::Encoding)
    }

    /// Reads an optional value as `[bool present][value if present]`.
    pub fn unpack_option<T>(
        &mut self,
        unpack: impl FnOnce(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Option<T>, CodecError> {
        if self.unpack_bool()? {
            Ok(Some(unpack(self)?))
        } else {
            Ok(None)
        }
    }

    /// Reads an optional string.
    pub fn unpack_optional_string(&mut self) -> Result<Option<String>, CodecError> {
        self.unpack_option(|u| u.unpack_string())
    }

    /// Reads an optional signed 64-bit integer.
    pub fn unpack_optional_long(&mut self) -> Result<Option<i64>, CodecError> {
        self.unpack_option(|u| u.unpack_long())
    }

    /// Reads an array of `Unpackable` elements.
    ///
    /// The declared count is bounded by the remaining input, so a corrupted
    /// count fails with a range error on the first missing element instead
    /// of reserving unbounded memory up front.
    pub fn unpack_array<T: Unpackable>(&mut self) -> Result<Vec<T>, CodecError> {
        let declared = self.unpack_int()?;
        let count = self.checked_length(declared)?;
        // Each element is at least one byte; cap the pre-allocation.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(T::unpack(self)?);
        }
        Ok(items)
    }
}
