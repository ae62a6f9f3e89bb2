//! Config for the LDAP client engine.
use std::{path::PathBuf, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Engine configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// The URL to connect to the server with. Supports ldap, ldaps, and ldapi
	/// schemes
	pub url: Url,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// LDAP operation timeout, applied per issued request by the transport.
	pub operation_timeout: Duration,

	/// TLS config
	pub tls: TlsConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		ConnectionConfig {
			timeout: 5,
			operation_timeout: Duration::from_secs(60),
			tls: TlsConfig::default(),
		}
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = rustls::RootCertStore::empty();
			let pem = tokio::fs::read(path).await?;
			let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
			if certs.is_empty() {
				return Err(Error::Invalid("Could not read root certificate".to_owned()));
			}
			for der in certs {
				roots
					.add(&rustls::Certificate(der))
					.map_err(|_| Error::Invalid("Could not read root certificate".to_owned()))?;
			}

			let builder = rustls::ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(roots);

			let config = match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
				(Some(key_path), Some(cert_path)) => {
					let certs = rustls_pemfile::certs(
						&mut tokio::fs::read(cert_path).await?.as_slice(),
					)?
					.into_iter()
					.map(rustls::Certificate)
					.collect();
					let key = rustls_pemfile::pkcs8_private_keys(
						&mut tokio::fs::read(key_path).await?.as_slice(),
					)?
					.into_iter()
					.next()
					.ok_or_else(|| {
						Error::Invalid("Could not read client key".to_owned())
					})?;
					builder
						.with_client_auth_cert(certs, rustls::PrivateKey(key))
						.map_err(|_| {
							Error::Invalid("Could not read client certificates".to_owned())
						})?
				}
				(None, None) => builder.with_no_client_auth(),
				_ => {
					return Err(Error::Invalid(
						"Both a client certificate and key file in PKCS8 format must be specified"
							.to_owned(),
					))
				}
			};
			settings = settings.set_config(Arc::new(config));
		}
		Ok(settings)
	}
}
