use std::{collections::HashSet, error::Error, time::Duration};

use ldap_engine::{
	Config, Connection, ConnectionConfig, Entry, Event, PageCookie, RequestId,
};
use tokio::{sync::mpsc, time::timeout};
use url::Url;

pub const BASE: &str = "dc=example,dc=org";

pub fn ou_dn(ou: &str) -> String {
	format!("ou={ou},{BASE}")
}

pub fn user_dn(cn: &str, ou: &str) -> String {
	format!("cn={cn},ou={ou},{BASE}")
}

pub fn test_config() -> Config {
	Config {
		url: Url::parse("ldap://localhost:1389").unwrap(),
		connection: ConnectionConfig::default(),
	}
}

/// Receive the next event, failing the test instead of hanging forever.
pub async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
	timeout(Duration::from_secs(10), events.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("event stream ended")
}

/// Skip unrelated events until the completion of request `id` arrives.
pub async fn await_code(events: &mut mpsc::Receiver<Event>, id: RequestId) -> u32 {
	loop {
		if let Event::Result { id: got, code } = next_event(events).await {
			if got == id {
				return code;
			}
		}
	}
}

/// Skip unrelated events until the search result for `id` arrives.
pub async fn await_search(
	events: &mut mpsc::Receiver<Event>,
	id: RequestId,
) -> (Vec<Entry>, Option<PageCookie>, u32) {
	loop {
		if let Event::SearchResult { id: got, entries, cookie, code } = next_event(events).await
		{
			if got == id {
				return (entries, cookie, code);
			}
		}
	}
}

/// Open a connection as the admin user and consume the bind result.
pub async fn connect_and_bind(
) -> Result<(Connection, mpsc::Receiver<Event>), Box<dyn Error>> {
	let (conn, mut events) = Connection::connect(&test_config()).await?;
	assert!(matches!(next_event(&mut events).await, Event::Connected));
	let id = conn.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	assert_eq!(await_code(&mut events, id).await, 0, "admin bind must succeed");
	Ok((conn, events))
}

pub async fn add_organizational_unit(
	conn: &Connection,
	events: &mut mpsc::Receiver<Event>,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	let id = conn
		.add(
			&ou_dn(ou),
			vec![("objectClass".to_owned(), HashSet::from(["organizationalUnit".to_owned()]))],
		)
		.await?;
	assert_eq!(await_code(events, id).await, 0);
	Ok(())
}

pub async fn add_user(
	conn: &Connection,
	events: &mut mpsc::Receiver<Event>,
	cn: &str,
	sn: &str,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	let id = conn
		.add(
			&user_dn(cn, ou),
			vec![
				("objectClass".to_owned(), HashSet::from(["inetOrgPerson".to_owned()])),
				("sn".to_owned(), HashSet::from([sn.to_owned()])),
			],
		)
		.await?;
	assert_eq!(await_code(events, id).await, 0);
	Ok(())
}

/// Delete an entry, tolerating its absence (leftovers from earlier runs).
pub async fn delete_if_present(
	conn: &Connection,
	events: &mut mpsc::Receiver<Event>,
	dn: &str,
) -> Result<(), Box<dyn Error>> {
	const NO_SUCH_OBJECT: u32 = 32;
	let id = conn.delete(dn).await?;
	let code = await_code(events, id).await;
	assert!(code == 0 || code == NO_SUCH_OBJECT, "unexpected delete result {code}");
	Ok(())
}
