//! Small BER helpers shared by the control codecs.
//!
//! The heavy lifting is done by `lber`, the encoding crate `ldap3` itself is
//! built on; these wrappers adapt it to the engine's error type and cover the
//! handful of primitive payloads the sync and paging controls need.

use lber::{
	common::TagClass,
	parse::parse_tag,
	structure::{StructureTag, PL},
	structures::{ASNTag, Boolean, Integer, OctetString, Sequence, Tag},
	universal::Types,
};

use crate::error::Error;

/// Parse a single BER element from `bytes`. Trailing bytes are ignored;
/// the controls handled here are always a single element.
pub(crate) fn parse(bytes: &[u8]) -> Result<StructureTag, Error> {
	let (_rest, tag) =
		parse_tag(bytes).map_err(|_| Error::Decode("truncated BER element".to_owned()))?;
	Ok(tag)
}

/// Encode a finished tag into a byte buffer.
pub(crate) fn encode(tag: Tag) -> Result<Vec<u8>, Error> {
	let mut buf = bytes::BytesMut::new();
	lber::write::encode_into(&mut buf, tag.into_structure())
		.map_err(|_| Error::Invalid("BER encoding failed".to_owned()))?;
	Ok(buf.to_vec())
}

/// A universal SEQUENCE of the given elements.
pub(crate) fn sequence(inner: Vec<Tag>) -> Tag {
	Tag::Sequence(Sequence { inner, ..Default::default() })
}

/// A universal OCTET STRING.
pub(crate) fn octet_string(inner: Vec<u8>) -> Tag {
	Tag::OctetString(OctetString { inner, ..Default::default() })
}

/// A universal INTEGER.
pub(crate) fn integer(inner: i64) -> Tag {
	Tag::Integer(Integer { inner, ..Default::default() })
}

/// A universal ENUMERATED.
pub(crate) fn enumerated(inner: i64) -> Tag {
	Tag::Integer(Integer { id: Types::Enumerated as u64, inner, ..Default::default() })
}

/// A universal BOOLEAN.
pub(crate) fn boolean(inner: bool) -> Tag {
	Tag::Boolean(Boolean { inner, ..Default::default() })
}

/// The primitive payload of a tag, or a decode error naming `what`.
pub(crate) fn primitive(tag: StructureTag, what: &str) -> Result<Vec<u8>, Error> {
	match tag.payload {
		PL::P(bytes) => Ok(bytes),
		PL::C(_) => Err(Error::Decode(format!("expected primitive {what}"))),
	}
}

/// The constructed children of a tag, or a decode error naming `what`.
pub(crate) fn constructed(tag: StructureTag, what: &str) -> Result<Vec<StructureTag>, Error> {
	match tag.payload {
		PL::C(children) => Ok(children),
		PL::P(_) => Err(Error::Decode(format!("expected constructed {what}"))),
	}
}

/// True when the tag is the universal type `ty`.
pub(crate) fn is_universal(tag: &StructureTag, ty: Types) -> bool {
	tag.class == TagClass::Universal && tag.id == ty as u64
}

/// Decode an unsigned big-endian integer payload (INTEGER or ENUMERATED).
pub(crate) fn uint(bytes: &[u8]) -> Result<u64, Error> {
	if bytes.is_empty() || bytes.len() > 8 {
		return Err(Error::Decode("bad integer length".to_owned()));
	}
	Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Decode a BOOLEAN payload. BER encodes false as 0x00 and true as any
/// non-zero octet.
pub(crate) fn bool_value(bytes: &[u8]) -> Result<bool, Error> {
	match bytes {
		[b] => Ok(*b != 0),
		_ => Err(Error::Decode("bad boolean length".to_owned())),
	}
}
