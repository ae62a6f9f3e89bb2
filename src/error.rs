//! Error codes

/// Numeric result code reported for requests that were cut short by a lost
/// connection. This is the OpenLDAP API code for `LDAP_SERVER_DOWN`, kept as
/// the engine-level sentinel so callers can tell transport death apart from
/// directory-issued result codes.
pub const SERVER_DOWN_CODE: u32 = 81;

/// Numeric result code reported for a single request that failed inside the
/// client (for example a per-operation timeout) while the connection itself
/// stayed up. This is the OpenLDAP API code for `LDAP_LOCAL_ERROR`; the
/// failure details precede it as an [`Event::Anomaly`].
///
/// [`Event::Anomaly`]: crate::Event::Anomaly
pub const LOCAL_ERROR_CODE: u32 = 82;

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The connection to the directory server is gone. Fatal to the
	/// connection; recovery requires a caller-driven reopen.
	#[error("Server down")]
	ServerDown,
	/// An argument was malformed, or a protocol control could not be built.
	#[error("Invalid: {0}")]
	Invalid(String),
	/// A BER-encoded control or intermediate message failed to decode. The
	/// failure is isolated to the one message that carried it.
	#[error("Malformed message: {0}")]
	Decode(String),
	/// The server violated the content synchronization protocol, for
	/// example by sending a refresh marker from an impossible phase.
	#[error("Sync protocol violation: {0}")]
	Protocol(String),
	/// An I/O error occurred while reading configuration material.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// An underlying protocol error or similar occurred, or the LDAP library
	/// was used incorrectly.
	#[error(transparent)]
	Ldap(#[from] ldap3::LdapError),
}
