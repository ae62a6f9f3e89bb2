//! RFC 4533 content synchronization: control codecs and the refresh state
//! machine for a refresh-and-persist session.
//!
//! The server first replays the matching directory content (the refresh
//! stage), announcing phase changes through intermediate messages, then
//! streams live changes indefinitely (the persist stage). All of that
//! arrives as search entries with an attached sync-state control plus
//! intermediate messages whose BER payload is decoded here.

use ldap3::{controls::RawControl, SearchEntry};
use lber::{common::TagClass, universal::Types};
use tracing::warn;

use crate::{
	ber,
	channel::{RawCtrl, RequestId},
	entry::Entry,
	error::Error,
	event::Event,
};

/// OID of the sync request control attached to the initiating search.
pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
/// OID of the sync state control attached to every returned entry.
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
/// OID of the sync done control attached to a terminating search result.
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";
/// OID of the sync info intermediate response.
pub const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

/// The `refreshAndPersist` mode value of the sync request control.
const MODE_REFRESH_AND_PERSIST: i64 = 3;

/// The stage of the refresh portion of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
	/// No refresh activity observed yet (or a new cycle is about to begin).
	None,
	/// The server is replaying present entries.
	Presents,
	/// The server is replaying deleted entries.
	Deletes,
	/// The server sent the present entries as a compact UUID set.
	PresentsIdSet,
	/// The server sent the deleted entries as a compact UUID set.
	DeletesIdSet,
	/// The refresh finished; subsequent messages belong to the persist stage.
	Done,
}

/// The change kind carried by a sync state control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStateKind {
	/// The entry exists and is part of the refresh snapshot.
	Present,
	/// The entry was added.
	Add,
	/// The entry was modified.
	Modify,
	/// The entry was deleted.
	Delete,
}

impl SyncStateKind {
	/// Map the wire enumeration of the sync state control.
	fn from_wire(value: u64) -> Result<Self, Error> {
		match value {
			0 => Ok(SyncStateKind::Present),
			1 => Ok(SyncStateKind::Add),
			2 => Ok(SyncStateKind::Modify),
			3 => Ok(SyncStateKind::Delete),
			other => Err(Error::Decode(format!("unknown sync state {other}"))),
		}
	}
}

/// A decoded sync state control: the change kind, the entry's UUID and an
/// optional updated cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
	/// The change kind.
	pub state: SyncStateKind,
	/// The stable identifier correlating this notification with an entry.
	pub uuid: uuid::Uuid,
	/// Updated sync cookie, when the server chose to attach one.
	pub cookie: Option<Vec<u8>>,
}

/// A decoded sync info intermediate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfo {
	/// A bare cookie update.
	NewCookie(Vec<u8>),
	/// The delete phase marker, optionally ending the refresh.
	RefreshDelete {
		/// Updated sync cookie.
		cookie: Option<Vec<u8>>,
		/// Whether the refresh stage is complete.
		refresh_done: bool,
	},
	/// The present phase marker, optionally ending the refresh.
	RefreshPresent {
		/// Updated sync cookie.
		cookie: Option<Vec<u8>>,
		/// Whether the refresh stage is complete.
		refresh_done: bool,
	},
	/// A compact set of entry UUIDs, replacing per-entry messages.
	IdSet {
		/// Updated sync cookie.
		cookie: Option<Vec<u8>>,
		/// Whether the set describes deleted (true) or present entries.
		refresh_deletes: bool,
		/// The entry UUIDs in the set.
		uuids: Vec<uuid::Uuid>,
	},
}

/// Build the sync request control initiating a refresh-and-persist session,
/// resuming from `cookie` when one is given.
pub(crate) fn sync_request_control(
	cookie: Option<&[u8]>,
	reload_hint: bool,
) -> Result<RawControl, Error> {
	let mut inner = vec![ber::enumerated(MODE_REFRESH_AND_PERSIST)];
	if let Some(cookie) = cookie {
		inner.push(ber::octet_string(cookie.to_vec()));
	}
	if reload_hint {
		// DEFAULT FALSE, so only encoded when set.
		inner.push(ber::boolean(true));
	}
	let val = ber::encode(ber::sequence(inner))?;
	Ok(RawControl { ctype: SYNC_REQUEST_OID.to_owned(), crit: true, val: Some(val) })
}

/// Decode a 16-octet syncUUID.
fn parse_uuid(bytes: &[u8]) -> Result<uuid::Uuid, Error> {
	uuid::Uuid::from_slice(bytes)
		.map_err(|_| Error::Decode(format!("entryUUID of {} octets", bytes.len())))
}

/// Decode the value of a sync state control.
pub(crate) fn parse_sync_state(val: &[u8]) -> Result<SyncState, Error> {
	let mut children =
		ber::constructed(ber::parse(val)?, "sync state value")?.into_iter();
	let state_tag =
		children.next().ok_or_else(|| Error::Decode("missing sync state".to_owned()))?;
	if !ber::is_universal(&state_tag, Types::Enumerated) {
		return Err(Error::Decode("sync state is not an enumeration".to_owned()));
	}
	let state = SyncStateKind::from_wire(ber::uint(&ber::primitive(state_tag, "sync state")?)?)?;
	let uuid_tag =
		children.next().ok_or_else(|| Error::Decode("missing entryUUID".to_owned()))?;
	let uuid = parse_uuid(&ber::primitive(uuid_tag, "entryUUID")?)?;
	let cookie = match children.next() {
		Some(tag) => Some(ber::primitive(tag, "sync cookie")?),
		None => None,
	};
	Ok(SyncState { state, uuid, cookie })
}

/// Find and decode the sync state control among an entry's controls.
/// Lenient: a malformed control is logged and dropped, since the generic
/// search path attaches this purely as a convenience.
pub(crate) fn extract_sync_state(ctrls: &[RawCtrl]) -> Option<SyncState> {
	let val = ctrls.iter().find(|c| c.oid == SYNC_STATE_OID)?.val.as_ref()?;
	match parse_sync_state(val) {
		Ok(state) => Some(state),
		Err(err) => {
			warn!("Discarding malformed sync state control: {err}");
			None
		}
	}
}

/// Walk an optional-cookie / optional-boolean prefix shared by the refresh
/// and id-set bodies. Returns the cookie, the boolean (or `default`), and
/// any remaining elements.
fn parse_cookie_bool_prefix(
	children: Vec<lber::structure::StructureTag>,
	default: bool,
) -> Result<(Option<Vec<u8>>, bool, Vec<lber::structure::StructureTag>), Error> {
	let mut cookie = None;
	let mut flag = default;
	let mut rest = Vec::new();
	let mut iter = children.into_iter().peekable();
	if iter.peek().is_some_and(|t| ber::is_universal(t, Types::OctetString)) {
		// The iterator is only advanced when the peeked tag matched.
		if let Some(tag) = iter.next() {
			cookie = Some(ber::primitive(tag, "sync cookie")?);
		}
	}
	if iter.peek().is_some_and(|t| ber::is_universal(t, Types::Boolean)) {
		if let Some(tag) = iter.next() {
			flag = ber::bool_value(&ber::primitive(tag, "sync flag")?)?;
		}
	}
	rest.extend(iter);
	Ok((cookie, flag, rest))
}

/// Decode the value of a sync info intermediate message.
pub(crate) fn parse_sync_info(val: &[u8]) -> Result<SyncInfo, Error> {
	let tag = ber::parse(val)?;
	if tag.class != TagClass::Context {
		return Err(Error::Decode("sync info value is not context-tagged".to_owned()));
	}
	match tag.id {
		0 => Ok(SyncInfo::NewCookie(ber::primitive(tag, "new cookie")?)),
		1 | 2 => {
			let present = tag.id == 2;
			let children = ber::constructed(tag, "refresh marker")?;
			let (cookie, refresh_done, rest) = parse_cookie_bool_prefix(children, true)?;
			if !rest.is_empty() {
				return Err(Error::Decode("trailing data in refresh marker".to_owned()));
			}
			if present {
				Ok(SyncInfo::RefreshPresent { cookie, refresh_done })
			} else {
				Ok(SyncInfo::RefreshDelete { cookie, refresh_done })
			}
		}
		3 => {
			let children = ber::constructed(tag, "sync id set")?;
			let (cookie, refresh_deletes, mut rest) =
				parse_cookie_bool_prefix(children, false)?;
			if rest.len() != 1 {
				return Err(Error::Decode("missing syncUUIDs set".to_owned()));
			}
			let set_tag = rest.remove(0);
			if !ber::is_universal(&set_tag, Types::Set) {
				return Err(Error::Decode("syncUUIDs is not a set".to_owned()));
			}
			let uuids = ber::constructed(set_tag, "syncUUIDs")?
				.into_iter()
				.map(|t| parse_uuid(&ber::primitive(t, "syncUUID")?))
				.collect::<Result<Vec<_>, _>>()?;
			Ok(SyncInfo::IdSet { cookie, refresh_deletes, uuids })
		}
		other => Err(Error::Decode(format!("unknown sync info choice {other}"))),
	}
}

/// Decode the value of a sync done control.
pub(crate) fn parse_sync_done(val: &[u8]) -> Result<(Option<Vec<u8>>, bool), Error> {
	let children = ber::constructed(ber::parse(val)?, "sync done value")?;
	let (cookie, refresh_deletes, rest) = parse_cookie_bool_prefix(children, false)?;
	if !rest.is_empty() {
		return Err(Error::Decode("trailing data in sync done value".to_owned()));
	}
	Ok((cookie, refresh_deletes))
}

/// The live state of a refresh-and-persist session. Owned and driven by the
/// dispatcher; every routed message updates the cookie and phase in place
/// and yields the events to deliver, in protocol order.
#[derive(Debug)]
pub(crate) struct SyncEngine {
	/// The request id of the initiating search.
	id: RequestId,
	/// The most recent cookie, updated by every message that carries one.
	/// Unlike a page cookie this accumulates and is reused, not consumed.
	cookie: Option<Vec<u8>>,
	/// Current refresh phase.
	phase: RefreshPhase,
	/// Whether a refresh cycle is in progress. Id-set messages are only
	/// meaningful while this is set.
	refresh_active: bool,
}

impl SyncEngine {
	/// Start session state for the search registered under `id`.
	pub(crate) fn new(id: RequestId, cookie: Option<Vec<u8>>) -> Self {
		SyncEngine { id, cookie, phase: RefreshPhase::None, refresh_active: false }
	}

	/// The request id this session is bound to.
	pub(crate) fn id(&self) -> RequestId {
		self.id
	}

	/// Current refresh phase.
	#[cfg(test)]
	pub(crate) fn phase(&self) -> RefreshPhase {
		self.phase
	}

	/// Store a fresh cookie and yield the corresponding event.
	fn take_cookie(&mut self, cookie: Vec<u8>, events: &mut Vec<Event>) {
		self.cookie = Some(cookie.clone());
		events.push(Event::NewCookie(cookie));
	}

	/// Process a search entry belonging to this session. The sync state
	/// control is mandatory here; an entry without a decodable one aborts
	/// processing of that single message.
	pub(crate) fn on_entry(
		&mut self,
		raw: SearchEntry,
		ctrls: &[RawCtrl],
	) -> Result<Vec<Event>, Error> {
		let val = ctrls
			.iter()
			.find(|c| c.oid == SYNC_STATE_OID)
			.and_then(|c| c.val.as_ref())
			.ok_or_else(|| {
				Error::Protocol("sync entry without sync state control".to_owned())
			})?;
		let state = parse_sync_state(val)?;

		// Present and delete notifications advance the refresh phase; adds
		// and modifies can occur in either stage and leave it alone.
		match state.state {
			SyncStateKind::Present if self.phase != RefreshPhase::Done => {
				self.phase = RefreshPhase::Presents;
				self.refresh_active = true;
			}
			SyncStateKind::Delete if self.phase != RefreshPhase::Done => {
				self.phase = RefreshPhase::Deletes;
				self.refresh_active = true;
			}
			_ => {}
		}

		let mut entry = Entry::decode(raw, &[]);
		entry.sync_uuid = Some(state.uuid);
		entry.sync_state = Some(state.state);

		let mut events = vec![Event::SyncEntry { entry, phase: self.phase }];
		if let Some(cookie) = state.cookie {
			self.take_cookie(cookie, &mut events);
		}
		Ok(events)
	}

	/// Process an intermediate response belonging to this session.
	pub(crate) fn on_intermediate(
		&mut self,
		oid: Option<&str>,
		val: Option<&[u8]>,
	) -> Result<Vec<Event>, Error> {
		if let Some(oid) = oid {
			if oid != SYNC_INFO_OID {
				return Err(Error::Protocol(format!("unexpected intermediate {oid}")));
			}
		}
		let val = val.ok_or_else(|| {
			Error::Decode("sync info without a response value".to_owned())
		})?;
		let mut events = Vec::new();
		match parse_sync_info(val)? {
			SyncInfo::NewCookie(cookie) => self.take_cookie(cookie, &mut events),
			SyncInfo::RefreshPresent { cookie, refresh_done } => {
				if !matches!(self.phase, RefreshPhase::None | RefreshPhase::Done) {
					return Err(Error::Protocol(format!(
						"refreshPresent in phase {:?}",
						self.phase
					)));
				}
				self.enter_refresh(RefreshPhase::Presents, cookie, refresh_done, &mut events);
			}
			SyncInfo::RefreshDelete { cookie, refresh_done } => {
				if !matches!(
					self.phase,
					RefreshPhase::None | RefreshPhase::Done | RefreshPhase::Presents
				) {
					return Err(Error::Protocol(format!(
						"refreshDelete in phase {:?}",
						self.phase
					)));
				}
				self.enter_refresh(RefreshPhase::Deletes, cookie, refresh_done, &mut events);
			}
			SyncInfo::IdSet { cookie, refresh_deletes, uuids } => {
				if !self.refresh_active {
					return Err(Error::Protocol(
						"id set outside a refresh cycle".to_owned(),
					));
				}
				self.phase = if refresh_deletes {
					RefreshPhase::DeletesIdSet
				} else {
					RefreshPhase::PresentsIdSet
				};
				let msg_cookie = cookie.clone();
				if let Some(cookie) = cookie {
					self.take_cookie(cookie, &mut events);
				}
				events.push(Event::SyncIdSet { uuids, cookie: msg_cookie, phase: self.phase });
			}
		}
		Ok(events)
	}

	/// Apply a refresh phase marker and emit the refresh event.
	fn enter_refresh(
		&mut self,
		phase: RefreshPhase,
		cookie: Option<Vec<u8>>,
		refresh_done: bool,
		events: &mut Vec<Event>,
	) {
		self.refresh_active = !refresh_done;
		self.phase = if refresh_done { RefreshPhase::Done } else { phase };
		let msg_cookie = cookie.clone();
		if let Some(cookie) = cookie {
			self.take_cookie(cookie, events);
		}
		events.push(Event::SyncRefresh {
			phase: self.phase,
			cookie: msg_cookie,
			done: refresh_done,
		});
	}

	/// Process a terminal search result. A refresh-and-persist stream is not
	/// supposed to terminate, so this is reported as an anomaly alongside
	/// whatever the sync done control carried.
	pub(crate) fn on_done(&mut self, code: u32, ctrls: &[RawCtrl]) -> Vec<Event> {
		let mut events = vec![Event::Anomaly {
			id: Some(self.id),
			error: Error::Protocol(
				"search result terminated a refresh-and-persist session".to_owned(),
			),
		}];
		let mut refresh_deletes = false;
		let mut done_cookie = None;
		if let Some(val) =
			ctrls.iter().find(|c| c.oid == SYNC_DONE_OID).and_then(|c| c.val.as_ref())
		{
			match parse_sync_done(val) {
				Ok((cookie, deletes)) => {
					refresh_deletes = deletes;
					done_cookie.clone_from(&cookie);
					if let Some(cookie) = cookie {
						self.take_cookie(cookie, &mut events);
					}
				}
				Err(err) => events.push(Event::Anomaly { id: Some(self.id), error: err }),
			}
		}
		self.phase = RefreshPhase::Done;
		self.refresh_active = false;
		events.push(Event::SyncFinal { code, cookie: done_cookie, refresh_deletes });
		events
	}
}
