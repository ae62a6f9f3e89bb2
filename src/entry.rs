//! Decoding of directory entries and classification of attribute values.
use std::collections::BTreeMap;

use ldap3::SearchEntry;
use uuid::Uuid;

use crate::{
	channel::RawCtrl,
	sync::{self, SyncStateKind},
};

/// Well-known attributes whose values are binary blobs rather than directory
/// strings. Anything not listed here, and not carrying the `;binary` transfer
/// option, is treated as text.
const BINARY_ATTRS: &[&str] = &[
	"jpegPhoto",
	"photo",
	"personalSignature",
	"userCertificate",
	"cACertificate",
	"authorityRevocationList",
	"certificateRevocationList",
	"deltaRevocationList",
	"crossCertificatePair",
	"x500UniqueIdentifier",
	"audio",
	"javaSerializedObject",
	"thumbnailPhoto",
	"thumbnailLogo",
	"supportedAlgorithms",
	"protocolInformation",
	"objectGUID",
	"objectSid",
];

/// Whether values of the named attribute should be surfaced as bytes.
#[must_use]
pub fn is_binary_attr(name: &str) -> bool {
	BINARY_ATTRS.iter().any(|known| name.eq_ignore_ascii_case(known))
		|| name.to_ascii_lowercase().contains(";binary")
}

/// A single attribute value, classified by [`is_binary_attr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
	/// A directory string.
	Text(String),
	/// An opaque byte sequence.
	Binary(Vec<u8>),
}

/// A decoded directory entry. Read-only once produced; owned by whichever
/// event consumer receives it.
#[derive(Debug, Clone, Default)]
pub struct Entry {
	/// The distinguished name of the object.
	pub dn: String,
	/// Attribute values, keyed by attribute name. Value order within an
	/// attribute is preserved from the wire.
	pub attrs: BTreeMap<String, Vec<AttrValue>>,
	/// The entryUUID delivered by an attached sync-state control, if any.
	/// A side channel of the replication protocol, not a directory attribute.
	pub sync_uuid: Option<Uuid>,
	/// The change kind delivered by an attached sync-state control, if any.
	pub sync_state: Option<SyncStateKind>,
}

impl Entry {
	/// Decode a raw search entry, classifying each attribute and extracting
	/// the sync-state side channel from the entry's controls when present.
	/// A malformed sync-state control leaves the synthetic fields unset; the
	/// attribute data is still returned.
	#[must_use]
	pub fn decode(raw: SearchEntry, ctrls: &[RawCtrl]) -> Self {
		let mut attrs: BTreeMap<String, Vec<AttrValue>> = BTreeMap::new();
		for (name, values) in raw.attrs {
			let decoded: Vec<AttrValue> = if is_binary_attr(&name) {
				values.into_iter().map(|v| AttrValue::Binary(v.into_bytes())).collect()
			} else {
				values.into_iter().map(AttrValue::Text).collect()
			};
			attrs.entry(name).or_default().extend(decoded);
		}
		// Values the transport could not interpret as UTF-8 arrive here and
		// stay binary no matter how the attribute is classified.
		for (name, values) in raw.bin_attrs {
			attrs
				.entry(name)
				.or_default()
				.extend(values.into_iter().map(AttrValue::Binary));
		}

		let mut entry = Entry { dn: raw.dn, attrs, sync_uuid: None, sync_state: None };
		if let Some(state) = sync::extract_sync_state(ctrls) {
			entry.sync_uuid = Some(state.uuid);
			entry.sync_state = Some(state.state);
		}
		entry
	}

	/// Get the first value of an attribute. Will return `None` if the
	/// attribute is absent or its first value is binary.
	#[must_use]
	pub fn attr_first(&self, attr: &str) -> Option<&str> {
		match self.attrs.get(attr)?.first()? {
			AttrValue::Text(s) => Some(s),
			AttrValue::Binary(_) => None,
		}
	}

	/// Get the first value of an attribute, in binary form
	#[must_use]
	pub fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		match self.attrs.get(attr)?.first()? {
			AttrValue::Text(s) => Some(s.as_bytes()),
			AttrValue::Binary(b) => Some(b),
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use ldap3::SearchEntry;

	use super::{is_binary_attr, AttrValue, Entry};

	#[test]
	fn classification() {
		assert!(is_binary_attr("jpegPhoto"));
		assert!(is_binary_attr("objectGUID"));
		assert!(is_binary_attr("objectguid"), "classification is case-insensitive");
		assert!(is_binary_attr("userCertificate;binary"));
		assert!(is_binary_attr("someVendorThing;BINARY"));
		assert!(!is_binary_attr("cn"));
		assert!(!is_binary_attr("mail"));
	}

	#[test]
	fn decode_classifies_and_preserves_value_order() {
		let raw = SearchEntry {
			dn: "uid=foo,ou=people,dc=example,dc=com".to_owned(),
			attrs: HashMap::from([
				("cn".to_owned(), vec!["Foo Bar".to_owned(), "F. Bar".to_owned()]),
				("objectGUID".to_owned(), vec!["abcd".to_owned()]),
			]),
			bin_attrs: HashMap::from([("jpegPhoto".to_owned(), vec![vec![0xff, 0xd8]])]),
		};
		let entry = Entry::decode(raw, &[]);

		assert_eq!(entry.attr_first("cn"), Some("Foo Bar"), "first value wins");
		assert_eq!(
			entry.attrs["cn"],
			vec![
				AttrValue::Text("Foo Bar".to_owned()),
				AttrValue::Text("F. Bar".to_owned())
			]
		);
		assert_eq!(
			entry.attrs["objectGUID"],
			vec![AttrValue::Binary(b"abcd".to_vec())],
			"denylisted attributes are binary even when valid UTF-8"
		);
		assert_eq!(entry.bin_attr_first("jpegPhoto"), Some(&[0xff, 0xd8][..]));
		assert_eq!(entry.attr_first("jpegPhoto"), None);
		assert_eq!(entry.attr_first("missing"), None);
		assert!(entry.sync_uuid.is_none());
	}
}
