//! The connection: lifecycle, request issuance and the transport tasks.
//!
//! [`Connection::connect`] opens one LDAP connection, spawns the `ldap3`
//! driver and the dispatcher, and hands back the event receiver. Every verb
//! pushes an issuance marker onto the raw queue first and then runs the
//! protocol exchange in a spawned task, so responses can only ever arrive at
//! the dispatcher after it knows about the request.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicI32, Ordering},
		Arc,
	},
	time::Duration,
};

use ldap3::{
	controls::RawControl, Ldap, LdapConnAsync, Mod, Scope, SearchEntry, SearchResult,
};
use lber::{
	common::TagClass,
	structure::{StructureTag, PL},
};
use tokio::{
	sync::{mpsc, Mutex},
	task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
	channel::{MessageBody, PendingKind, RawCtrl, RawMessage, RequestId, QUEUE_DEPTH},
	config::Config,
	dispatch::Dispatcher,
	error::Error,
	event::Event,
	page::{self, PageCookie},
	sync,
};

/// Parameters of a search request.
#[derive(Debug)]
pub struct SearchRequest {
	/// The DN to search below.
	pub base: String,
	/// The search scope.
	pub scope: Scope,
	/// The search filter.
	pub filter: String,
	/// Attributes to return; empty means all user attributes.
	pub attrs: Vec<String>,
	/// Page size when paging with simple paged results.
	pub page_size: Option<i32>,
	/// Continuation token from the previous page. Requires `page_size`.
	pub cookie: Option<PageCookie>,
}

impl SearchRequest {
	/// An unpaged search request.
	#[must_use]
	pub fn new(base: impl Into<String>, scope: Scope, filter: impl Into<String>) -> Self {
		SearchRequest {
			base: base.into(),
			scope,
			filter: filter.into(),
			attrs: Vec::new(),
			page_size: None,
			cookie: None,
		}
	}

	/// Request one page of at most `size` entries, resuming from `cookie`.
	/// The cookie is consumed; it cannot be attached to a second request.
	#[must_use]
	pub fn page(mut self, size: i32, cookie: Option<PageCookie>) -> Self {
		self.page_size = Some(size);
		self.cookie = cookie;
		self
	}
}

/// Parameters of a refresh-and-persist sync session.
#[derive(Debug, Clone)]
pub struct SyncRequest {
	/// The DN to synchronize below.
	pub base: String,
	/// The search scope.
	pub scope: Scope,
	/// The search filter.
	pub filter: String,
	/// Attributes to return; empty means all user attributes.
	pub attrs: Vec<String>,
	/// Cookie from a previous session to resume from.
	pub cookie: Option<Vec<u8>>,
	/// Ask the server for a full reload instead of incremental catch-up.
	pub reload_hint: bool,
}

impl SyncRequest {
	/// A session starting from scratch, without a saved cookie.
	#[must_use]
	pub fn new(base: impl Into<String>, scope: Scope, filter: impl Into<String>) -> Self {
		SyncRequest {
			base: base.into(),
			scope,
			filter: filter.into(),
			attrs: Vec::new(),
			cookie: None,
			reload_hint: false,
		}
	}

	/// Resume from a persisted cookie.
	#[must_use]
	pub fn resume_from(mut self, cookie: Vec<u8>) -> Self {
		self.cookie = Some(cookie);
		self
	}
}

/// One open connection to a directory server.
///
/// All verbs are non-blocking: they return the request id immediately and the
/// outcome arrives on the event receiver returned by [`Connection::connect`].
pub struct Connection {
	/// The operation handle; cheap to clone into transport tasks.
	ldap: Ldap,
	/// Sender half of the raw queue into the dispatcher.
	raw: mpsc::Sender<RawMessage>,
	/// Per-operation timeout from the configuration.
	timeout: Duration,
	/// Source of request ids, unique per connection.
	next_id: AtomicI32,
	/// Transport tasks still running, for abandon and teardown.
	tasks: Arc<Mutex<HashMap<RequestId, JoinHandle<()>>>>,
	/// The most recently started sync session, if any. At most one session
	/// may be live at a time.
	sync_id: Mutex<Option<RequestId>>,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("next_id", &self.next_id.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl Connection {
	/// Open a connection according to `config` and start the dispatcher.
	/// StartTLS and certificate handling follow the TLS section of the
	/// configuration. The receiver carries every event of the connection,
	/// starting with [`Event::Connected`].
	pub async fn connect(config: &Config) -> Result<(Self, mpsc::Receiver<Event>), Error> {
		let settings = config.connection.to_settings().await?;
		let (conn, ldap) =
			LdapConnAsync::from_url_with_settings(settings, &config.url).await?;

		let (raw_tx, raw_rx) = mpsc::channel(QUEUE_DEPTH);
		let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
		tokio::spawn(Dispatcher::new(raw_rx, event_tx).run());

		// The driver owns the socket; when it returns, the connection is gone
		// and the dispatcher gets told exactly once.
		let driver_tx = raw_tx.clone();
		tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
			if driver_tx.send(RawMessage::disconnect()).await.is_err() {
				debug!("dispatcher already shut down");
			}
		});

		Ok((
			Connection {
				ldap,
				raw: raw_tx,
				timeout: config.connection.operation_timeout,
				next_id: AtomicI32::new(1),
				tasks: Arc::new(Mutex::new(HashMap::new())),
				sync_id: Mutex::new(None),
			},
			event_rx,
		))
	}

	/// Allocate a request id and announce it to the dispatcher.
	async fn issue(&self, kind: PendingKind) -> Result<RequestId, Error> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.raw
			.send(RawMessage { id, body: MessageBody::Issued(kind) })
			.await
			.map_err(|_| Error::ServerDown)?;
		Ok(id)
	}

	/// Track a transport task so abandon and close can cancel it. Finished
	/// tasks are pruned on the way in.
	async fn track(&self, id: RequestId, handle: JoinHandle<()>) {
		let mut tasks = self.tasks.lock().await;
		tasks.retain(|_, h| !h.is_finished());
		tasks.insert(id, handle);
	}

	/// Run a single-shot exchange in the background and feed its outcome to
	/// the dispatcher.
	async fn spawn_single<F>(&self, id: RequestId, op: F)
	where
		F: std::future::Future<Output = Result<ldap3::LdapResult, ldap3::LdapError>>
			+ Send
			+ 'static,
	{
		let raw = self.raw.clone();
		let handle = tokio::spawn(async move {
			let body = match op.await {
				Ok(res) => MessageBody::OpResult { code: res.rc },
				Err(err) => MessageBody::OpFailed(err.into()),
			};
			if raw.send(RawMessage { id, body }).await.is_err() {
				debug!(id, "dropping outcome, dispatcher gone");
			}
		});
		self.track(id, handle).await;
	}

	/// Authenticate with a DN and password. Empty strings perform an anonymous
	/// bind.
	pub async fn simple_bind(&self, bind_dn: &str, password: &str) -> Result<RequestId, Error> {
		let id = self.issue(PendingKind::Single).await?;
		let mut ldap = self.ldap.clone();
		let timeout = self.timeout;
		let bind_dn = bind_dn.to_owned();
		let password = password.to_owned();
		self.spawn_single(id, async move {
			ldap.with_timeout(timeout).simple_bind(&bind_dn, &password).await
		})
		.await;
		Ok(id)
	}

	/// Authenticate with SASL EXTERNAL, deriving the identity from the lower
	/// layer (the client TLS certificate, or the peer credentials of an ldapi
	/// socket).
	pub async fn sasl_external_bind(&self) -> Result<RequestId, Error> {
		let id = self.issue(PendingKind::Single).await?;
		let mut ldap = self.ldap.clone();
		let timeout = self.timeout;
		self.spawn_single(id, async move { ldap.with_timeout(timeout).sasl_external_bind().await })
			.await;
		Ok(id)
	}

	/// Issue a search, optionally as one page of a paged result set. The
	/// outcome arrives as a single [`Event::SearchResult`].
	pub async fn search(&self, mut request: SearchRequest) -> Result<RequestId, Error> {
		let page_ctrl = match request.page_size {
			Some(size) => Some(page::page_control(size, request.cookie.take())?),
			None => {
				if request.cookie.is_some() {
					return Err(Error::Invalid(
						"page cookie without a page size".to_owned(),
					));
				}
				None
			}
		};
		let id = self.issue(PendingKind::Search).await?;
		let ldap = self.ldap.clone();
		let timeout = self.timeout;
		let raw = self.raw.clone();
		let handle = tokio::spawn(async move {
			let body = match run_search(ldap, timeout, request, page_ctrl).await {
				Ok((entries, ctrls, code)) => MessageBody::SearchDone { entries, ctrls, code },
				Err(err) => MessageBody::OpFailed(err),
			};
			if raw.send(RawMessage { id, body }).await.is_err() {
				debug!(id, "dropping search outcome, dispatcher gone");
			}
		});
		self.track(id, handle).await;
		Ok(id)
	}

	/// Add an entry with the given attributes.
	pub async fn add(
		&self,
		dn: &str,
		attrs: Vec<(String, std::collections::HashSet<String>)>,
	) -> Result<RequestId, Error> {
		let id = self.issue(PendingKind::Single).await?;
		let mut ldap = self.ldap.clone();
		let timeout = self.timeout;
		let dn = dn.to_owned();
		self.spawn_single(id, async move { ldap.with_timeout(timeout).add(&dn, attrs).await })
			.await;
		Ok(id)
	}

	/// Apply a list of modifications to an entry.
	pub async fn modify(&self, dn: &str, mods: Vec<Mod<String>>) -> Result<RequestId, Error> {
		let id = self.issue(PendingKind::Single).await?;
		let mut ldap = self.ldap.clone();
		let timeout = self.timeout;
		let dn = dn.to_owned();
		self.spawn_single(id, async move { ldap.with_timeout(timeout).modify(&dn, mods).await })
			.await;
		Ok(id)
	}

	/// Delete an entry.
	pub async fn delete(&self, dn: &str) -> Result<RequestId, Error> {
		let id = self.issue(PendingKind::Single).await?;
		let mut ldap = self.ldap.clone();
		let timeout = self.timeout;
		let dn = dn.to_owned();
		self.spawn_single(id, async move { ldap.with_timeout(timeout).delete(&dn).await })
			.await;
		Ok(id)
	}

	/// Rename an entry, optionally moving it below a new superior.
	pub async fn rename(
		&self,
		dn: &str,
		new_rdn: &str,
		delete_old_rdn: bool,
		new_superior: Option<&str>,
	) -> Result<RequestId, Error> {
		let id = self.issue(PendingKind::Single).await?;
		let mut ldap = self.ldap.clone();
		let timeout = self.timeout;
		let dn = dn.to_owned();
		let new_rdn = new_rdn.to_owned();
		let new_superior = new_superior.map(ToOwned::to_owned);
		self.spawn_single(id, async move {
			ldap.with_timeout(timeout)
				.modifydn(&dn, &new_rdn, delete_old_rdn, new_superior.as_deref())
				.await
		})
		.await;
		Ok(id)
	}

	/// Start a refresh-and-persist sync session. Entries, cookies, phase
	/// markers and id sets stream in as events until the session is abandoned
	/// or the connection goes away. At most one session per connection;
	/// starting a second while the first still runs is an invalid argument.
	pub async fn start_sync(&self, request: SyncRequest) -> Result<RequestId, Error> {
		let ctrl = sync::sync_request_control(request.cookie.as_deref(), request.reload_hint)?;
		let mut active = self.sync_id.lock().await;
		if let Some(prev) = *active {
			if self.tasks.lock().await.get(&prev).is_some_and(|h| !h.is_finished()) {
				return Err(Error::Invalid("sync session already active".to_owned()));
			}
		}
		let id = self.issue(PendingKind::Sync { cookie: request.cookie.clone() }).await?;
		*active = Some(id);
		let ldap = self.ldap.clone();
		let raw = self.raw.clone();
		let handle = tokio::spawn(async move {
			if let Err(err) = run_sync(ldap, ctrl, request, id, &raw).await {
				if raw
					.send(RawMessage { id, body: MessageBody::OpFailed(err) })
					.await
					.is_err()
				{
					debug!(id, "dropping sync failure, dispatcher gone");
				}
			}
		});
		self.track(id, handle).await;
		Ok(id)
	}

	/// Abandon an outstanding request. Its transport task is cancelled and
	/// responses still in flight are silently discarded; no completion event
	/// will be delivered for it.
	pub async fn abandon(&self, id: RequestId) -> Result<(), Error> {
		{
			let mut active = self.sync_id.lock().await;
			if *active == Some(id) {
				*active = None;
			}
		}
		if let Some(handle) = self.tasks.lock().await.remove(&id) {
			handle.abort();
		}
		self.raw
			.send(RawMessage { id, body: MessageBody::Abandoned })
			.await
			.map_err(|_| Error::ServerDown)
	}

	/// Close the connection: cancel all transport tasks, unbind, and let the
	/// dispatcher fail whatever was still pending. Idempotent; closing a dead
	/// connection only logs.
	pub async fn close(&self) {
		*self.sync_id.lock().await = None;
		for (_, handle) in self.tasks.lock().await.drain() {
			handle.abort();
		}
		let mut ldap = self.ldap.clone();
		if let Err(err) = ldap.unbind().await {
			warn!("Unbind on close failed: {err}");
		}
		if self.raw.send(RawMessage::disconnect()).await.is_err() {
			debug!("dispatcher already shut down");
		}
	}
}

/// Execute one search exchange and reduce the response.
async fn run_search(
	mut ldap: Ldap,
	timeout: Duration,
	request: SearchRequest,
	page_ctrl: Option<RawControl>,
) -> Result<(Vec<SearchEntry>, Vec<RawCtrl>, u32), Error> {
	if let Some(ctrl) = page_ctrl {
		ldap.with_controls(ctrl);
	}
	let SearchResult(entries, res) = ldap
		.with_timeout(timeout)
		.search(&request.base, request.scope, &request.filter, request.attrs.clone())
		.await?;
	let entries = entries
		.into_iter()
		.filter(|re| !re.is_ref() && !re.is_intermediate())
		.map(SearchEntry::construct)
		.collect();
	let ctrls = res.ctrls.into_iter().map(RawCtrl::from).collect();
	Ok((entries, ctrls, res.rc))
}

/// Drive one sync session: forward every streamed message to the dispatcher
/// until the stream ends or the dispatcher goes away. No per-message timeout;
/// the persist stage legitimately idles for as long as the directory is
/// quiet.
async fn run_sync(
	mut ldap: Ldap,
	ctrl: RawControl,
	request: SyncRequest,
	id: RequestId,
	raw: &mpsc::Sender<RawMessage>,
) -> Result<(), Error> {
	ldap.with_controls(ctrl);
	let mut stream = ldap
		.streaming_search(&request.base, request.scope, &request.filter, request.attrs.clone())
		.await?;
	while let Some(re) = stream.next().await? {
		let body = if re.is_intermediate() {
			let (oid, val) = parse_intermediate(re.0);
			MessageBody::SyncIntermediate { oid, val }
		} else if re.is_ref() {
			continue;
		} else {
			// Copy the entry controls out first; `construct` consumes the
			// whole response entry.
			let ctrls = re.1.iter().cloned().map(RawCtrl::from).collect();
			let entry = SearchEntry::construct(re);
			MessageBody::SyncEntry { entry, ctrls }
		};
		if raw.send(RawMessage { id, body }).await.is_err() {
			return Ok(());
		}
	}
	let res = stream.finish().await;
	let ctrls = res.ctrls.into_iter().map(RawCtrl::from).collect();
	if raw
		.send(RawMessage { id, body: MessageBody::SyncDone { code: res.rc, ctrls } })
		.await
		.is_err()
	{
		debug!(id, "dropping sync termination, dispatcher gone");
	}
	Ok(())
}

/// Pull the response name and value out of an intermediate response message:
/// a sequence of context-tagged `responseName [0]` and `responseValue [1]`,
/// both optional.
fn parse_intermediate(tag: StructureTag) -> (Option<String>, Option<Vec<u8>>) {
	let mut oid = None;
	let mut val = None;
	if let PL::C(children) = tag.payload {
		for child in children {
			if child.class != TagClass::Context {
				continue;
			}
			match (child.id, child.payload) {
				(0, PL::P(bytes)) => oid = String::from_utf8(bytes).ok(),
				(1, PL::P(bytes)) => val = Some(bytes),
				_ => {}
			}
		}
	}
	(oid, val)
}
