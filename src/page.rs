//! Simple paged results (RFC 2696): control construction and cookie handling.
use ldap3::controls::RawControl;
use lber::universal::Types;

use crate::{ber, channel::RawCtrl, error::Error};

/// The OID of the simple paged results control.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// An opaque continuation token for a paged search.
///
/// The token is single-use: attaching it to the next search consumes it by
/// value, so a stale copy cannot be replayed. `None` in a
/// [`Event::SearchResult`](crate::Event::SearchResult) means the server has
/// no further pages.
#[derive(Debug, PartialEq, Eq)]
pub struct PageCookie(Vec<u8>);

impl PageCookie {
	/// Wrap a server-issued cookie. Empty cookies mean "done" and are
	/// represented as `None` instead.
	#[must_use]
	pub(crate) fn wrap(raw: Vec<u8>) -> Option<Self> {
		if raw.is_empty() {
			None
		} else {
			Some(PageCookie(raw))
		}
	}

	/// Consume the token, yielding the raw cookie for the next request.
	#[must_use]
	pub fn into_raw(self) -> Vec<u8> {
		self.0
	}
}

/// Build the request control for one page of `size` entries, resuming from
/// `cookie` when given. The cookie is consumed even when control
/// construction fails.
pub(crate) fn page_control(
	size: i32,
	cookie: Option<PageCookie>,
) -> Result<RawControl, Error> {
	if size <= 0 {
		return Err(Error::Invalid(format!("page size must be positive, got {size}")));
	}
	let raw_cookie = cookie.map(PageCookie::into_raw).unwrap_or_default();
	let val = ber::encode(ber::sequence(vec![
		ber::integer(i64::from(size)),
		ber::octet_string(raw_cookie),
	]))?;
	Ok(RawControl { ctype: PAGED_RESULTS_OID.to_owned(), crit: false, val: Some(val) })
}

/// Extract the continuation cookie from a search result's response controls.
/// Returns `Ok(None)` when no paging control is attached or the server's
/// cookie is empty, and a decode error when the control is malformed.
pub(crate) fn extract_cookie(ctrls: &[RawCtrl]) -> Result<Option<PageCookie>, Error> {
	let Some(ctrl) = ctrls.iter().find(|c| c.oid == PAGED_RESULTS_OID) else {
		return Ok(None);
	};
	let Some(val) = &ctrl.val else {
		return Ok(None);
	};
	let (_size, cookie) = parse_page_value(val)?;
	Ok(PageCookie::wrap(cookie))
}

/// Decode the `realSearchControlValue` sequence: an estimated size and the
/// continuation cookie.
pub(crate) fn parse_page_value(val: &[u8]) -> Result<(u64, Vec<u8>), Error> {
	let mut children = ber::constructed(ber::parse(val)?, "paged results value")?.into_iter();
	let size_tag =
		children.next().ok_or_else(|| Error::Decode("missing page size".to_owned()))?;
	if !ber::is_universal(&size_tag, Types::Integer) {
		return Err(Error::Decode("page size is not an integer".to_owned()));
	}
	let size = ber::uint(&ber::primitive(size_tag, "page size")?)?;
	let cookie_tag =
		children.next().ok_or_else(|| Error::Decode("missing page cookie".to_owned()))?;
	let cookie = ber::primitive(cookie_tag, "page cookie")?;
	Ok((size, cookie))
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{extract_cookie, page_control, parse_page_value, PageCookie, PAGED_RESULTS_OID};
	use crate::channel::RawCtrl;

	/// Build a response control like a server would.
	fn response_ctrl(size: i32, cookie: &[u8]) -> RawCtrl {
		let ctrl = page_control(size, PageCookie::wrap(cookie.to_vec())).unwrap();
		RawCtrl { oid: ctrl.ctype, val: ctrl.val }
	}

	#[test]
	fn control_value_roundtrip() {
		let ctrl = page_control(25, Some(PageCookie(b"state".to_vec()))).unwrap();
		assert_eq!(ctrl.ctype, PAGED_RESULTS_OID);
		let (size, cookie) = parse_page_value(&ctrl.val.unwrap()).unwrap();
		assert_eq!(size, 25);
		assert_eq!(cookie, b"state");
	}

	#[test]
	fn zero_page_size_is_invalid() {
		assert!(page_control(0, None).is_err());
		assert!(page_control(-5, None).is_err());
	}

	#[test]
	fn empty_cookie_means_no_more_pages() {
		assert_eq!(PageCookie::wrap(Vec::new()), None);
		assert_eq!(extract_cookie(&[response_ctrl(10, b"")]).unwrap(), None);
	}

	#[test]
	fn absent_control_means_no_more_pages() {
		assert_eq!(extract_cookie(&[]).unwrap(), None);
		let other = RawCtrl { oid: "1.2.3.4".to_owned(), val: Some(vec![5]) };
		assert_eq!(extract_cookie(&[other]).unwrap(), None);
	}

	#[test]
	fn server_cookie_is_wrapped_and_consumed_once() {
		let cookie = extract_cookie(&[response_ctrl(10, b"more")]).unwrap().unwrap();
		// `into_raw` takes the token by value; a second consume of the same
		// token does not compile, which is the point of the type.
		assert_eq!(cookie.into_raw(), b"more".to_vec());
	}

	#[test]
	fn malformed_control_is_a_decode_error() {
		let bad = RawCtrl { oid: PAGED_RESULTS_OID.to_owned(), val: Some(vec![0x30, 0x01]) };
		assert!(extract_cookie(&[bad]).is_err());
	}
}
