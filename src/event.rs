//! The engine's outbound event vocabulary.

use uuid::Uuid;

use crate::{
	channel::RequestId,
	entry::Entry,
	error::Error,
	page::PageCookie,
	sync::RefreshPhase,
};

/// Everything the engine can tell its caller, delivered in order through a
/// single channel. Connection-level notifications and per-request
/// completions share the same stream so a caller never has to merge them.
#[derive(Debug)]
pub enum Event {
	/// The connection is open and the dispatcher is running.
	Connected,
	/// The connection is gone. Emitted exactly once; any requests pending
	/// at that moment complete with [`SERVER_DOWN_CODE`] immediately after.
	///
	/// [`SERVER_DOWN_CODE`]: crate::error::SERVER_DOWN_CODE
	Disconnected,
	/// Terminal completion of a search request: one page of decoded entries
	/// and the continuation cookie, when more pages exist.
	SearchResult {
		/// The completed request.
		id: RequestId,
		/// The decoded entries of this page.
		entries: Vec<Entry>,
		/// Token for the next page; `None` means the search is exhausted.
		cookie: Option<PageCookie>,
		/// The protocol result code.
		code: u32,
	},
	/// Terminal completion of a single-shot request (bind, add, modify,
	/// delete, rename). Non-zero codes are directory verdicts, not errors.
	Result {
		/// The completed request.
		id: RequestId,
		/// The protocol result code.
		code: u32,
	},
	/// Something went wrong that did not terminate the connection: a
	/// malformed control, a sync protocol violation, an unclassifiable
	/// response. Processing continues.
	Anomaly {
		/// The request the anomaly belongs to, when attributable.
		id: Option<RequestId>,
		/// What happened.
		error: Error,
	},
	/// A replicated entry from the sync session, with its UUID and change
	/// kind attached as synthetic fields.
	SyncEntry {
		/// The decoded entry.
		entry: Entry,
		/// The refresh phase after processing this entry.
		phase: RefreshPhase,
	},
	/// The server issued an updated sync cookie. Callers should persist the
	/// latest cookie verbatim to resume after a restart.
	NewCookie(Vec<u8>),
	/// A refresh phase marker arrived.
	SyncRefresh {
		/// The phase entered by the marker.
		phase: RefreshPhase,
		/// The cookie carried by the marker, if any.
		cookie: Option<Vec<u8>>,
		/// Whether the refresh stage is complete.
		done: bool,
	},
	/// The server summarized part of the refresh as a set of entry UUIDs.
	SyncIdSet {
		/// The UUIDs in the set.
		uuids: Vec<Uuid>,
		/// The cookie carried by the message, if any.
		cookie: Option<Vec<u8>>,
		/// The sub-phase the set belongs to.
		phase: RefreshPhase,
	},
	/// The sync stream terminated with a search result. Unexpected in
	/// refresh-and-persist mode and preceded by an [`Event::Anomaly`].
	SyncFinal {
		/// The terminal result code.
		code: u32,
		/// The cookie from the sync done control, if any.
		cookie: Option<Vec<u8>>,
		/// The refreshDeletes flag from the sync done control.
		refresh_deletes: bool,
	},
}
