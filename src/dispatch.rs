//! Routing of drained responses to their pending requests.
//!
//! The dispatcher is the single consumer of the raw queue and the single
//! producer of caller-visible events, so all per-request bookkeeping and the
//! sync session state live here without locking. It drains whatever the
//! transport has buffered, classifies each message, and delivers it to
//! exactly one destination: the pending request it resolves, the sync
//! engine, or the anomaly stream.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
	channel::{MessageBody, PendingKind, RawCtrl, RawMessage, RequestId},
	entry::Entry,
	error::{Error, LOCAL_ERROR_CODE, SERVER_DOWN_CODE},
	event::Event,
	page,
	sync::SyncEngine,
};

/// The demultiplexing loop between the raw queue and the event stream.
pub(crate) struct Dispatcher {
	/// Raw messages from the transport tasks.
	raw: mpsc::Receiver<RawMessage>,
	/// Outbound events.
	events: mpsc::Sender<Event>,
	/// Requests that have been issued but not yet resolved.
	pending: HashMap<RequestId, PendingKind>,
	/// The live sync session, at most one per connection.
	sync: Option<SyncEngine>,
}

impl std::fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dispatcher").field("pending", &self.pending.len()).finish()
	}
}

impl Dispatcher {
	/// Create a dispatcher over the given queue ends.
	pub(crate) fn new(raw: mpsc::Receiver<RawMessage>, events: mpsc::Sender<Event>) -> Self {
		Dispatcher { raw, events, pending: HashMap::new(), sync: None }
	}

	/// Run until the connection disconnects or the queue closes.
	pub(crate) async fn run(mut self) {
		self.emit(Event::Connected).await;
		loop {
			match self.raw.recv().await {
				Some(msg) => {
					if !self.handle(msg).await {
						break;
					}
				}
				None => {
					// Every sender hung up without an explicit disconnect.
					self.disconnect().await;
					break;
				}
			}
		}
	}

	/// Deliver an event; a full or dropped receiver is the caller's problem
	/// and is only logged.
	async fn emit(&self, event: Event) {
		if let Err(err) = self.events.send(event).await {
			warn!("Dropping event, receiver gone: {err}");
		}
	}

	/// Deliver a batch of sync engine events.
	async fn emit_all(&self, events: Vec<Event>) {
		for event in events {
			self.emit(event).await;
		}
	}

	/// Process one raw message. Returns false when the connection is done.
	async fn handle(&mut self, msg: RawMessage) -> bool {
		let id = msg.id;
		match msg.body {
			MessageBody::Issued(kind) => {
				if let PendingKind::Sync { ref cookie } = kind {
					if self.sync.is_some() {
						self.emit(Event::Anomaly {
							id: Some(id),
							error: Error::Invalid(
								"sync session already active".to_owned(),
							),
						})
						.await;
						return true;
					}
					self.sync = Some(SyncEngine::new(id, cookie.clone()));
				}
				self.pending.insert(id, kind);
			}
			MessageBody::Abandoned => {
				self.pending.remove(&id);
				if self.sync.as_ref().is_some_and(|s| s.id() == id) {
					self.sync = None;
				}
			}
			MessageBody::SearchDone { entries, ctrls, code } => {
				self.on_search_done(id, entries, &ctrls, code).await;
			}
			MessageBody::OpResult { code } => match self.pending.remove(&id) {
				Some(PendingKind::Single) => self.emit(Event::Result { id, code }).await,
				Some(other) => {
					self.pending.insert(id, other);
					self.emit(Event::Anomaly {
						id: Some(id),
						error: Error::Decode(
							"single-shot result for a search request".to_owned(),
						),
					})
					.await;
				}
				None => debug!(id, "late result dropped"),
			},
			MessageBody::OpFailed(error) => {
				if self.pending.remove(&id).is_some() {
					self.emit(Event::Anomaly { id: Some(id), error }).await;
					self.emit(Event::Result { id, code: LOCAL_ERROR_CODE }).await;
				} else {
					debug!(id, "late failure dropped: {error}");
				}
			}
			MessageBody::SyncEntry { entry, ctrls } => {
				match self.sync_engine(id) {
					Some(engine) => {
						let outcome = engine.on_entry(entry, &ctrls);
						self.finish_sync_step(id, outcome).await;
					}
					None => debug!(id, "stray sync entry dropped"),
				}
			}
			MessageBody::SyncIntermediate { oid, val } => {
				match self.sync_engine(id) {
					Some(engine) => {
						let outcome = engine.on_intermediate(oid.as_deref(), val.as_deref());
						self.finish_sync_step(id, outcome).await;
					}
					None => debug!(id, "stray intermediate dropped"),
				}
			}
			MessageBody::SyncDone { code, ctrls } => {
				if let Some(engine) = self.sync_engine(id) {
					let events = engine.on_done(code, &ctrls);
					self.pending.remove(&id);
					self.sync = None;
					self.emit_all(events).await;
				} else {
					debug!(id, "stray sync result dropped");
				}
			}
			MessageBody::Disconnected => {
				self.disconnect().await;
				return false;
			}
		}
		true
	}

	/// The sync engine, if `id` names the live, still-pending session.
	fn sync_engine(&mut self, id: RequestId) -> Option<&mut SyncEngine> {
		if !self.pending.contains_key(&id) {
			return None;
		}
		self.sync.as_mut().filter(|engine| engine.id() == id)
	}

	/// Emit the outcome of one sync engine step. Errors are isolated to the
	/// message that produced them; the session keeps running.
	async fn finish_sync_step(&mut self, id: RequestId, outcome: Result<Vec<Event>, Error>) {
		match outcome {
			Ok(events) => self.emit_all(events).await,
			Err(error) => self.emit(Event::Anomaly { id: Some(id), error }).await,
		}
	}

	/// Resolve a terminal search response: decode the page, extract the
	/// continuation cookie, deliver, and retire the request.
	async fn on_search_done(
		&mut self,
		id: RequestId,
		entries: Vec<ldap3::SearchEntry>,
		ctrls: &[RawCtrl],
		code: u32,
	) {
		match self.pending.remove(&id) {
			Some(PendingKind::Search) => {
				let cookie = match page::extract_cookie(ctrls) {
					Ok(cookie) => cookie,
					Err(error) => {
						self.emit(Event::Anomaly { id: Some(id), error }).await;
						None
					}
				};
				let entries =
					entries.into_iter().map(|e| Entry::decode(e, ctrls)).collect();
				self.emit(Event::SearchResult { id, entries, cookie, code }).await;
			}
			Some(other) => {
				self.pending.insert(id, other);
				self.emit(Event::Anomaly {
					id: Some(id),
					error: Error::Decode("search result for a non-search request".to_owned()),
				})
				.await;
			}
			None => debug!(id, "late search result dropped"),
		}
	}

	/// Tear down: one disconnect notification, then a server-down completion
	/// for every request that was still outstanding.
	async fn disconnect(&mut self) {
		self.emit(Event::Disconnected).await;
		self.sync = None;
		for (id, _) in self.pending.drain() {
			if let Err(err) =
				self.events.send(Event::Result { id, code: SERVER_DOWN_CODE }).await
			{
				warn!("Dropping server-down completion, receiver gone: {err}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use ldap3::SearchEntry;
	use lber::{common::TagClass, structures::{OctetString, Tag}};
	use tokio::sync::mpsc;

	use super::Dispatcher;
	use crate::{
		ber,
		channel::{MessageBody, PendingKind, RawCtrl, RawMessage},
		error::{Error, LOCAL_ERROR_CODE, SERVER_DOWN_CODE},
		event::Event,
		page::{self, PageCookie},
		sync::SYNC_INFO_OID,
	};

	/// Spin up a dispatcher wired to fresh queues.
	fn start() -> (mpsc::Sender<RawMessage>, mpsc::Receiver<Event>) {
		let (raw_tx, raw_rx) = mpsc::channel(64);
		let (event_tx, event_rx) = mpsc::channel(64);
		tokio::spawn(Dispatcher::new(raw_rx, event_tx).run());
		(raw_tx, event_rx)
	}

	fn entry(dn: &str) -> SearchEntry {
		SearchEntry {
			dn: dn.to_owned(),
			attrs: HashMap::from([("cn".to_owned(), vec!["x".to_owned()])]),
			bin_attrs: HashMap::new(),
		}
	}

	/// A server-side paged results response control.
	fn page_ctrl(cookie: &[u8]) -> RawCtrl {
		let ctrl = page::page_control(2, PageCookie::wrap(cookie.to_vec())).unwrap();
		RawCtrl { oid: ctrl.ctype, val: ctrl.val }
	}

	#[tokio::test]
	async fn paged_search_delivers_entries_and_cookie() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		raw.send(RawMessage { id: 1, body: MessageBody::Issued(PendingKind::Search) })
			.await
			.unwrap();
		raw.send(RawMessage {
			id: 1,
			body: MessageBody::SearchDone {
				entries: vec![entry("cn=a"), entry("cn=b")],
				ctrls: vec![page_ctrl(b"next")],
				code: 0,
			},
		})
		.await
		.unwrap();

		let Some(Event::SearchResult { id, entries, cookie, code }) = events.recv().await
		else {
			panic!("expected a search result");
		};
		assert_eq!(id, 1);
		assert_eq!(entries.len(), 2);
		assert_eq!(code, 0);
		let cookie = cookie.expect("a continuation cookie");

		// Resume with the consumed cookie; the final page carries an empty
		// server cookie, which surfaces as "no more pages".
		assert_eq!(cookie.into_raw(), b"next".to_vec());
		raw.send(RawMessage { id: 2, body: MessageBody::Issued(PendingKind::Search) })
			.await
			.unwrap();
		raw.send(RawMessage {
			id: 2,
			body: MessageBody::SearchDone {
				entries: vec![entry("cn=c")],
				ctrls: vec![page_ctrl(b"")],
				code: 0,
			},
		})
		.await
		.unwrap();
		let Some(Event::SearchResult { id, cookie, .. }) = events.recv().await else {
			panic!("expected the final page");
		};
		assert_eq!(id, 2);
		assert!(cookie.is_none());
	}

	#[tokio::test]
	async fn disconnect_fails_every_pending_request_once() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		for id in [10, 11, 12] {
			raw.send(RawMessage { id, body: MessageBody::Issued(PendingKind::Single) })
				.await
				.unwrap();
		}
		raw.send(RawMessage::disconnect()).await.unwrap();

		assert!(matches!(events.recv().await, Some(Event::Disconnected)));
		let mut failed = Vec::new();
		for _ in 0..3 {
			let Some(Event::Result { id, code }) = events.recv().await else {
				panic!("expected a server-down completion");
			};
			assert_eq!(code, SERVER_DOWN_CODE);
			failed.push(id);
		}
		failed.sort_unstable();
		assert_eq!(failed, vec![10, 11, 12]);
		// The dispatcher has shut down; nothing further may fire.
		assert!(events.recv().await.is_none());
	}

	#[tokio::test]
	async fn responses_after_abandon_are_stray() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		raw.send(RawMessage { id: 5, body: MessageBody::Issued(PendingKind::Single) })
			.await
			.unwrap();
		raw.send(RawMessage { id: 5, body: MessageBody::Abandoned }).await.unwrap();
		raw.send(RawMessage { id: 5, body: MessageBody::OpResult { code: 0 } })
			.await
			.unwrap();

		// A later request still resolves, proving the stray was dropped
		// without killing the drain loop.
		raw.send(RawMessage { id: 6, body: MessageBody::Issued(PendingKind::Single) })
			.await
			.unwrap();
		raw.send(RawMessage { id: 6, body: MessageBody::OpResult { code: 32 } })
			.await
			.unwrap();
		assert!(
			matches!(events.recv().await, Some(Event::Result { id: 6, code: 32 })),
			"the abandoned request's completion must not surface"
		);
	}

	#[tokio::test]
	async fn sync_messages_are_routed_to_the_engine() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		raw.send(RawMessage {
			id: 9,
			body: MessageBody::Issued(PendingKind::Sync { cookie: None }),
		})
		.await
		.unwrap();
		let val = ber::encode(Tag::OctetString(OctetString {
			id: 0,
			class: TagClass::Context,
			inner: b"rid=1,csn=2".to_vec(),
		}))
		.unwrap();
		raw.send(RawMessage {
			id: 9,
			body: MessageBody::SyncIntermediate {
				oid: Some(SYNC_INFO_OID.to_owned()),
				val: Some(val),
			},
		})
		.await
		.unwrap();

		assert!(
			matches!(events.recv().await, Some(Event::NewCookie(c)) if c == b"rid=1,csn=2".to_vec())
		);
	}

	#[tokio::test]
	async fn second_sync_session_is_refused() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		raw.send(RawMessage {
			id: 1,
			body: MessageBody::Issued(PendingKind::Sync { cookie: None }),
		})
		.await
		.unwrap();
		raw.send(RawMessage {
			id: 2,
			body: MessageBody::Issued(PendingKind::Sync { cookie: None }),
		})
		.await
		.unwrap();
		assert!(matches!(events.recv().await, Some(Event::Anomaly { id: Some(2), .. })));

		// Traffic for the refused session is stray; the first session still
		// owns the engine.
		let stray = ber::encode(Tag::OctetString(OctetString {
			id: 0,
			class: TagClass::Context,
			inner: b"hijack".to_vec(),
		}))
		.unwrap();
		raw.send(RawMessage {
			id: 2,
			body: MessageBody::SyncIntermediate {
				oid: Some(SYNC_INFO_OID.to_owned()),
				val: Some(stray),
			},
		})
		.await
		.unwrap();
		let val = ber::encode(Tag::OctetString(OctetString {
			id: 0,
			class: TagClass::Context,
			inner: b"keep".to_vec(),
		}))
		.unwrap();
		raw.send(RawMessage {
			id: 1,
			body: MessageBody::SyncIntermediate {
				oid: Some(SYNC_INFO_OID.to_owned()),
				val: Some(val),
			},
		})
		.await
		.unwrap();
		assert!(
			matches!(events.recv().await, Some(Event::NewCookie(c)) if c == b"keep".to_vec()),
			"the refused session's cookie must not surface"
		);
	}

	#[tokio::test]
	async fn failed_operation_completes_with_local_error() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		raw.send(RawMessage { id: 4, body: MessageBody::Issued(PendingKind::Single) })
			.await
			.unwrap();
		raw.send(RawMessage {
			id: 4,
			body: MessageBody::OpFailed(Error::Invalid("timed out".to_owned())),
		})
		.await
		.unwrap();
		assert!(matches!(events.recv().await, Some(Event::Anomaly { id: Some(4), .. })));
		assert!(
			matches!(
				events.recv().await,
				Some(Event::Result { id: 4, code: LOCAL_ERROR_CODE })
			),
			"a per-request failure is not a connection death"
		);

		// A lost connection still reports server-down, not local-error.
		raw.send(RawMessage { id: 5, body: MessageBody::Issued(PendingKind::Single) })
			.await
			.unwrap();
		raw.send(RawMessage::disconnect()).await.unwrap();
		assert!(matches!(events.recv().await, Some(Event::Disconnected)));
		assert!(matches!(
			events.recv().await,
			Some(Event::Result { id: 5, code: SERVER_DOWN_CODE })
		));
	}

	#[tokio::test]
	async fn corrupt_sync_message_surfaces_as_anomaly_only() {
		let (raw, mut events) = start();
		assert!(matches!(events.recv().await, Some(Event::Connected)));

		raw.send(RawMessage {
			id: 3,
			body: MessageBody::Issued(PendingKind::Sync { cookie: None }),
		})
		.await
		.unwrap();
		raw.send(RawMessage {
			id: 3,
			body: MessageBody::SyncIntermediate { oid: None, val: Some(vec![0x30]) },
		})
		.await
		.unwrap();
		assert!(matches!(events.recv().await, Some(Event::Anomaly { id: Some(3), .. })));

		// The session is still alive and keeps decoding.
		let val = ber::encode(Tag::OctetString(OctetString {
			id: 0,
			class: TagClass::Context,
			inner: b"after".to_vec(),
		}))
		.unwrap();
		raw.send(RawMessage {
			id: 3,
			body: MessageBody::SyncIntermediate {
				oid: Some(SYNC_INFO_OID.to_owned()),
				val: Some(val),
			},
		})
		.await
		.unwrap();
		assert!(matches!(events.recv().await, Some(Event::NewCookie(c)) if c == b"after".to_vec()));
	}
}
