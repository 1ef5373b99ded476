// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Codec Integration Tests
//!
//! Round-trip and robustness properties for the wire codec: every decode of
//! an encode returns the original value, and decoding any truncated buffer
//! fails with a range error instead of panicking or reading out of bounds.

use proptest::prelude::*;
use tether_core::codec::{CodecError, Packable, Packer, Unpackable, Unpacker};

#[derive(Debug, Clone, PartialEq)]
struct Record {
    guid: String,
    date: i64,
    text: Option<String>,
}

impl Packable for Record {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_string(&self.guid);
        packer.pack_long(self.date);
        packer.pack_optional_string(self.text.as_deref());
    }
}

impl Unpackable for Record {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Record {
            guid: unpacker.unpack_string()?,
            date: unpacker.unpack_long()?,
            text: unpacker.unpack_optional_string()?,
        })
    }
}

#[test]
fn test_record_array_roundtrip() {
    let records = vec![
        Record {
            guid: "msg-1".into(),
            date: 1_700_000_000_000,
            text: Some("hello".into()),
        },
        Record {
            guid: "msg-2".into(),
            date: 1_700_000_000_001,
            text: None,
        },
    ];

    let mut packer = Packer::new();
    packer.pack_array(&records);
    let bytes = packer.into_bytes();

    let mut unpacker = Unpacker::new(&bytes);
    assert_eq!(unpacker.unpack_array::<Record>().unwrap(), records);
}

#[test]
fn test_empty_buffer_fails_cleanly() {
    let mut unpacker = Unpacker::new(&[]);
    assert!(matches!(
        unpacker.unpack_bool(),
        Err(CodecError::Range { .. })
    ));
    assert!(matches!(
        unpacker.unpack_long(),
        Err(CodecError::Range { .. })
    ));
}

#[test]
fn test_every_truncation_prefix_fails_with_range_error() {
    let mut packer = Packer::new();
    packer.pack_int(7);
    packer.pack_string("truncate me");
    packer.pack_long(99);
    let bytes = packer.into_bytes();

    // Decoding any strict prefix must fail with Range, never panic.
    for cut in 0..bytes.len() {
        let mut unpacker = Unpacker::new(&bytes[..cut]);
        let result = (|| -> Result<(), CodecError> {
            unpacker.unpack_int()?;
            unpacker.unpack_string()?;
            unpacker.unpack_long()?;
            Ok(())
        })();
        assert!(
            matches!(result, Err(CodecError::Range { .. })),
            "prefix of {cut} bytes should underrun"
        );
    }
}

proptest! {
    #[test]
    fn prop_scalar_roundtrip(b in any::<bool>(), s in any::<i16>(), i in any::<i32>(), l in any::<i64>()) {
        let mut packer = Packer::new();
        packer.pack_bool(b);
        packer.pack_short(s);
        packer.pack_int(i);
        packer.pack_long(l);
        let bytes = packer.into_bytes();

        let mut unpacker = Unpacker::new(&bytes);
        prop_assert_eq!(unpacker.unpack_bool().unwrap(), b);
        prop_assert_eq!(unpacker.unpack_short().unwrap(), s);
        prop_assert_eq!(unpacker.unpack_int().unwrap(), i);
        prop_assert_eq!(unpacker.unpack_long().unwrap(), l);
    }

    #[test]
    fn prop_payload_and_string_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..512), text in ".{0,64}") {
        let mut packer = Packer::new();
        packer.pack_payload(&payload);
        packer.pack_string(&text);
        let bytes = packer.into_bytes();

        let mut unpacker = Unpacker::new(&bytes);
        prop_assert_eq!(unpacker.unpack_payload().unwrap(), payload);
        prop_assert_eq!(unpacker.unpack_string().unwrap(), text);
    }

    #[test]
    fn prop_arbitrary_input_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
        let mut unpacker = Unpacker::new(&data);
        // Whatever the bytes are, decoding returns a Result, never panics.
        let _ = unpacker.unpack_payload();
        let _ = unpacker.unpack_string();
        let _ = unpacker.unpack_optional_long();
    }
}
