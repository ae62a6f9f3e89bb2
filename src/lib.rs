//! An asynchronous LDAP client engine for a single directory connection.
//!
//! The engine wraps one connection and exposes the usual directory verbs
//! (bind, search, add, modify, delete, rename) plus two replication-oriented
//! protocol extensions: simple paged results ([RFC 2696]) with type-enforced
//! single-use continuation cookies, and content synchronization ([RFC 4533])
//! in refresh-and-persist mode, including the refresh phase state machine and
//! BER decoding of the sync controls and intermediate messages.
//!
//! Every verb returns a request id immediately; outcomes, replicated entries,
//! cookies and connection-state changes are all delivered in order as
//! [`Event`] values on a single channel. When the connection dies, callers
//! get exactly one [`Event::Disconnected`], and every request that was still
//! outstanding completes with [`SERVER_DOWN_CODE`].
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate
//! which is used here for the wire protocol is an excellent resource. The
//! content synchronization operation itself is best described by
//! [RFC 4533] directly.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//! [RFC 2696]: https://www.rfc-editor.org/rfc/rfc2696.html
//! [RFC 4533]: https://www.rfc-editor.org/rfc/rfc4533.html
//!
//! # Getting started
//! A minimal refresh-and-persist consumer might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_engine::{Config, Connection, ConnectionConfig, Event, Scope, SyncRequest};
//! use url::Url;
//!
//! // Configuration can also be deserialized with serde. It's hand-constructed
//! // here for demonstration purposes.
//! let config = Config {
//!     url: Url::parse("ldap://localhost")?,
//!     connection: ConnectionConfig::default(),
//! };
//!
//! let (conn, mut events) = Connection::connect(&config).await?;
//! conn.simple_bind("cn=admin,dc=example,dc=com", "verysecret").await?;
//! conn.start_sync(SyncRequest::new(
//!     "dc=example,dc=com",
//!     Scope::Subtree,
//!     "(objectClass=inetOrgPerson)",
//! ))
//! .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::SyncEntry { entry, .. } => println!("changed: {}", entry.dn),
//!         Event::NewCookie(cookie) => {
//!             // Persist the latest cookie to resume after a restart.
//!             let _ = cookie;
//!         }
//!         Event::Disconnected => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * SASL binds are limited to the EXTERNAL mechanism; challenge-response
//!   mechanisms would need a credential callback the engine does not have.
//! * One content synchronization session per connection. Run plain searches
//!   next to it freely, or open a second connection for a second session.
//! * Abandoning a request cancels it locally and discards late responses;
//!   whether the server stops working on it is the server's business.

mod ber;
mod channel;
pub mod config;
pub mod conn;
mod dispatch;
pub mod entry;
pub mod error;
pub mod event;
pub mod page;
pub mod sync;

pub use ldap3::{self, Mod, Scope, SearchEntry};

pub use crate::{
	channel::{RawCtrl, RequestId},
	config::{Config, ConnectionConfig, TlsConfig},
	conn::{Connection, SearchRequest, SyncRequest},
	entry::{AttrValue, Entry},
	error::{Error, LOCAL_ERROR_CODE, SERVER_DOWN_CODE},
	event::Event,
	page::PageCookie,
	sync::{RefreshPhase, SyncStateKind},
};
