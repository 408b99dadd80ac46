//! Typed, extensible bottle headers.
//!
//! A header is an ordered list of fields. Each field is written as
//!
//! ```text
//! type_class: u8 | id: varint | length: varint | payload[length]
//! ```
//!
//! and the list ends with a single `0x00` type class byte. Because every field
//! carries its own length, a reader can step over type classes it has never
//! heard of; those fields are kept as raw bytes so re-encoding a decoded header
//! reproduces the original bytes exactly.
//!
//! A field's meaning is `(bottle kind, type class, id)`; this module knows
//! nothing about kinds and only deals with the encoding.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{BottleError, Result};
use crate::varint::{self, decode_exact, read_varint, unzigzag, zigzag};

/// Terminal marker: no more fields.
pub const TAG_END:     u8 = 0x00;
pub const TAG_STRING:  u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BOOLEAN: u8 = 0x03;

/// Largest single field payload accepted on decode.
pub const MAX_FIELD_LEN: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// UTF-8 text. An id may repeat; values keep stream order.
    String { id: u64, value: String },
    /// One varint. Signed fields store the zig-zag form.
    Integer { id: u64, value: u64 },
    /// Presence means true.
    Boolean { id: u64 },
    /// A type class this build does not understand, kept verbatim.
    Unknown { tag: u8, id: u64, payload: Vec<u8> },
}

impl Field {
    pub fn id(&self) -> u64 {
        match self {
            Field::String { id, .. }
            | Field::Integer { id, .. }
            | Field::Boolean { id }
            | Field::Unknown { id, .. } => *id,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Field::String { .. }       => TAG_STRING,
            Field::Integer { .. }      => TAG_INTEGER,
            Field::Boolean { .. }      => TAG_BOOLEAN,
            Field::Unknown { tag, .. } => *tag,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Field::String { value, .. }    => value.as_bytes().to_vec(),
            Field::Integer { value, .. }   => varint::encode(*value),
            Field::Boolean { .. }          => Vec::new(),
            Field::Unknown { payload, .. } => payload.clone(),
        }
    }
}

/// Immutable field list. Build one with [`Header::builder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<Field>,
}

impl Header {
    pub fn builder() -> HeaderBuilder {
        HeaderBuilder::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First string stored under `id`.
    pub fn string(&self, id: u64) -> Option<&str> {
        self.strings(id).next()
    }

    /// Every string stored under `id`, in stream order.
    pub fn strings(&self, id: u64) -> impl Iterator<Item = &str> + '_ {
        self.fields.iter().filter_map(move |f| match f {
            Field::String { id: fid, value } if *fid == id => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn integer(&self, id: u64) -> Option<u64> {
        self.fields.iter().find_map(|f| match f {
            Field::Integer { id: fid, value } if *fid == id => Some(*value),
            _ => None,
        })
    }

    /// Integer field written with [`HeaderBuilder::signed`].
    pub fn signed(&self, id: u64) -> Option<i64> {
        self.integer(id).map(unzigzag)
    }

    pub fn boolean(&self, id: u64) -> bool {
        self.fields.iter().any(|f| matches!(f, Field::Boolean { id: fid } if *fid == id))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            let payload = field.payload();
            out.push(field.tag());
            out.extend_from_slice(&varint::encode(field.id()));
            out.extend_from_slice(&varint::encode(payload.len() as u64));
            out.extend_from_slice(&payload);
        }
        out.push(TAG_END);
        out
    }

    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.encode())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let header = Self::read(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(BottleError::MalformedHeader("trailing bytes after end marker".into()));
        }
        Ok(header)
    }

    /// Read fields up to and including the end marker.
    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut fields = Vec::new();
        loop {
            let tag = reader.read_u8().map_err(|e| truncated("type class", e))?;
            if tag == TAG_END {
                return Ok(Self { fields });
            }
            let id = read_varint(reader).map_err(|e| malformed("field id", e))?;
            let len = read_varint(reader).map_err(|e| malformed("field length", e))?;
            if len > MAX_FIELD_LEN {
                return Err(BottleError::MalformedHeader(format!("field length {len} is implausible")));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).map_err(|e| truncated("field payload", e))?;
            fields.push(decode_field(tag, id, payload)?);
        }
    }
}

fn decode_field(tag: u8, id: u64, payload: Vec<u8>) -> Result<Field> {
    match tag {
        TAG_STRING => String::from_utf8(payload)
            .map(|value| Field::String { id, value })
            .map_err(|_| BottleError::MalformedHeader(format!("string field {id} is not UTF-8"))),
        TAG_INTEGER => {
            let value = decode_exact(&payload).map_err(|e| malformed("integer payload", e))?;
            // Only the shortest form re-encodes byte-for-byte.
            if varint::encoded_len(value) != payload.len() {
                return Err(BottleError::MalformedHeader(format!("integer field {id} is not minimal")));
            }
            Ok(Field::Integer { id, value })
        }
        TAG_BOOLEAN if payload.is_empty() => Ok(Field::Boolean { id }),
        TAG_BOOLEAN => Err(BottleError::MalformedHeader(format!("boolean field {id} carries a payload"))),
        _ => Ok(Field::Unknown { tag, id, payload }),
    }
}

fn truncated(what: &str, err: std::io::Error) -> BottleError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => BottleError::MalformedHeader(format!("truncated {what}")),
        _ => err.into(),
    }
}

fn malformed(what: &str, err: BottleError) -> BottleError {
    match err {
        BottleError::MalformedVarInt(why) => BottleError::MalformedHeader(format!("{what}: {why}")),
        other => other,
    }
}

/// Accumulates fields in insertion order.
#[derive(Debug, Default)]
pub struct HeaderBuilder {
    fields: Vec<Field>,
}

impl HeaderBuilder {
    pub fn string(mut self, id: u64, value: impl Into<String>) -> Self {
        self.fields.push(Field::String { id, value: value.into() });
        self
    }

    pub fn maybe_string(self, id: u64, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.string(id, v),
            None    => self,
        }
    }

    pub fn integer(mut self, id: u64, value: u64) -> Self {
        self.fields.push(Field::Integer { id, value });
        self
    }

    pub fn signed(self, id: u64, value: i64) -> Self {
        self.integer(id, zigzag(value))
    }

    /// Adds the flag only when `value` is true; absence is false.
    pub fn boolean(mut self, id: u64, value: bool) -> Self {
        if value {
            self.fields.push(Field::Boolean { id });
        }
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn build(self) -> Header {
        Header { fields: self.fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_header_is_one_byte() {
        let h = Header::default();
        assert_eq!(h.encode(), vec![TAG_END]);
        assert_eq!(Header::decode(&[TAG_END]).unwrap(), h);
    }

    #[test]
    fn write_streams_the_encoded_bytes() {
        let h = Header::builder().string(1, "a").integer(2, 300).boolean(0, true).build();
        let mut streamed = Vec::new();
        h.write(&mut streamed).unwrap();
        assert_eq!(streamed, h.encode());
        assert_eq!(Header::decode(&streamed).unwrap(), h);
    }

    #[test]
    fn typed_accessors() {
        let h = Header::builder()
            .string(0, "hello.txt")
            .integer(0, 8)
            .signed(2, -5)
            .boolean(0, true)
            .boolean(1, false)
            .build();
        let back = Header::decode(&h.encode()).unwrap();
        assert_eq!(back, h);
        assert_eq!(back.string(0), Some("hello.txt"));
        assert_eq!(back.integer(0), Some(8));
        assert_eq!(back.signed(2), Some(-5));
        assert!(back.boolean(0));
        assert!(!back.boolean(1));
        assert_eq!(back.string(9), None);
    }

    #[test]
    fn repeated_strings_keep_order() {
        let h = Header::builder()
            .string(0, "alice")
            .integer(0, 1)
            .string(0, "bob")
            .string(1, "other")
            .string(0, "carol")
            .build();
        let back = Header::decode(&h.encode()).unwrap();
        assert_eq!(back.strings(0).collect::<Vec<_>>(), ["alice", "bob", "carol"]);
    }

    #[test]
    fn lookup_ignores_field_order() {
        let a = Header::builder().integer(0, 1).string(1, "x").build();
        let b = Header::builder().string(1, "x").integer(0, 1).build();
        let (a, b) = (Header::decode(&a.encode()).unwrap(), Header::decode(&b.encode()).unwrap());
        assert_eq!(a.integer(0), b.integer(0));
        assert_eq!(a.string(1), b.string(1));
    }

    #[test]
    fn unknown_type_class_is_skipped_and_preserved() {
        let mut bytes = Header::builder().string(0, "name").build().encode();
        bytes.pop();
        // type class 0x42, id 7, three opaque bytes
        bytes.extend_from_slice(&[0x42, 0x07, 0x03, 0xde, 0xad, 0x01]);
        bytes.extend_from_slice(&Header::builder().integer(3, 99).build().encode());

        let h = Header::decode(&bytes).unwrap();
        assert_eq!(h.string(0), Some("name"));
        assert_eq!(h.integer(3), Some(99));
        assert_eq!(h.fields()[1], Field::Unknown { tag: 0x42, id: 7, payload: vec![0xde, 0xad, 0x01] });
        assert_eq!(h.encode(), bytes);
    }

    #[test]
    fn truncation_is_malformed() {
        let bytes = Header::builder().string(0, "truncate me").build().encode();
        for cut in 1..bytes.len() {
            let err = Header::decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, BottleError::MalformedHeader(_)), "cut {cut}: {err:?}");
        }
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let bad_utf8 = [TAG_STRING, 0x00, 0x02, 0xff, 0xfe, TAG_END];
        assert!(matches!(Header::decode(&bad_utf8), Err(BottleError::MalformedHeader(_))));

        let padded_int = [TAG_INTEGER, 0x00, 0x02, 0x81, 0x00, TAG_END];
        assert!(matches!(Header::decode(&padded_int), Err(BottleError::MalformedHeader(_))));

        let loud_bool = [TAG_BOOLEAN, 0x00, 0x01, 0x01, TAG_END];
        assert!(matches!(Header::decode(&loud_bool), Err(BottleError::MalformedHeader(_))));
    }

    fn arb_field() -> impl Strategy<Value = Field> {
        prop_oneof![
            (0u64..16, ".{0,24}").prop_map(|(id, value)| Field::String { id, value }),
            (0u64..16, any::<u64>()).prop_map(|(id, value)| Field::Integer { id, value }),
            (0u64..16).prop_map(|id| Field::Boolean { id }),
            (4u8..=255, 0u64..16, proptest::collection::vec(any::<u8>(), 0..16))
                .prop_map(|(tag, id, payload)| Field::Unknown { tag, id, payload }),
        ]
    }

    proptest! {
        #[test]
        fn roundtrip(fields in proptest::collection::vec(arb_field(), 0..12)) {
            let h = fields.into_iter().fold(Header::builder(), HeaderBuilder::field).build();
            let bytes = h.encode();
            let back = Header::decode(&bytes).unwrap();
            prop_assert_eq!(&back, &h);
            prop_assert_eq!(back.encode(), bytes);
        }
    }
}
