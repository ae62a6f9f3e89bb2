//! The message channel between the transport tasks and the dispatcher.
//!
//! Every issued operation pushes an [`MessageBody::Issued`] marker onto the
//! same queue its responses will arrive on, so the dispatcher always learns
//! about a request before anything that resolves it. The transport side
//! reduces `ldap3` responses to these bodies; everything downstream of the
//! queue is transport-agnostic, which is also what makes the dispatcher and
//! sync engine testable with synthetic traffic.

use ldap3::SearchEntry;

use crate::error::Error;

/// Identifier of an outstanding request, unique while the request lives.
pub type RequestId = i32;

/// Number of in-flight messages the raw queue will buffer.
pub(crate) const QUEUE_DEPTH: usize = 1024;

/// A response control reduced to its wire identity: the OID and the raw
/// BER-encoded value. Decoding happens in the paging and sync codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCtrl {
	/// The control's OID.
	pub oid: String,
	/// The control's raw value, when one was attached.
	pub val: Option<Vec<u8>>,
}

impl From<ldap3::controls::Control> for RawCtrl {
	fn from(ctrl: ldap3::controls::Control) -> Self {
		RawCtrl { oid: ctrl.1.ctype, val: ctrl.1.val }
	}
}

/// What kind of completion a pending request expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingKind {
	/// Single-shot result: bind, add, modify, delete, rename.
	Single,
	/// A (possibly paged) search delivering entries plus a terminal result.
	Search,
	/// A refresh-and-persist sync session, with its initial cookie.
	Sync {
		/// Cookie the session resumes from, if any.
		cookie: Option<Vec<u8>>,
	},
}

/// One message on the raw queue.
#[derive(Debug)]
pub(crate) struct RawMessage {
	/// The request this message belongs to. Zero for connection-level
	/// messages, which are never valid request ids.
	pub(crate) id: RequestId,
	/// The payload.
	pub(crate) body: MessageBody,
}

/// Payload of a [`RawMessage`].
#[derive(Debug)]
pub(crate) enum MessageBody {
	/// A request was issued; create its pending entry.
	Issued(PendingKind),
	/// The caller abandoned the request; drop its pending entry.
	Abandoned,
	/// One page of search results with its terminal result code and the
	/// response controls of the search result message.
	SearchDone {
		/// The raw entries of this page, references already discarded.
		entries: Vec<SearchEntry>,
		/// Response controls from the terminal message.
		ctrls: Vec<RawCtrl>,
		/// The terminal result code.
		code: u32,
	},
	/// A single-shot operation resolved with a protocol result code.
	OpResult {
		/// The result code; non-zero codes are data, not failures.
		code: u32,
	},
	/// A single-shot operation failed inside the transport.
	OpFailed(Error),
	/// A search entry belonging to a sync session, with its entry controls.
	SyncEntry {
		/// The raw entry.
		entry: SearchEntry,
		/// Controls attached to the entry message.
		ctrls: Vec<RawCtrl>,
	},
	/// An intermediate response belonging to a sync session.
	SyncIntermediate {
		/// The response name, when the transport surfaced one.
		oid: Option<String>,
		/// The raw response value.
		val: Option<Vec<u8>>,
	},
	/// A sync stream terminated with a search result.
	SyncDone {
		/// The terminal result code.
		code: u32,
		/// Response controls from the terminal message.
		ctrls: Vec<RawCtrl>,
	},
	/// The transport is gone. Terminal for the whole connection.
	Disconnected,
}

impl RawMessage {
	/// A connection-level disconnect notification.
	pub(crate) fn disconnect() -> Self {
		RawMessage { id: 0, body: MessageBody::Disconnected }
	}
}
