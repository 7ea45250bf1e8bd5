//! File-based identity provider for development and testing.
//!
//! Loads a fixed certificate, key, and CA bundle from PEM files. No rotation:
//! the files are read once and the credential is refused outright once it is
//! past `not_after`. Production configuration validation rejects this
//! provider.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::warn;

use super::tls::{extract_spiffe_id, extract_validity};
use super::{Error, IdentityProvider, RotationCallback, SpiffeId, Svid, TrustBundle};

pub struct StaticIdentityProvider {
	id: SpiffeId,
	svid: Arc<Svid>,
	bundle: Arc<TrustBundle>,
	// Held for interface parity; a static credential never rotates.
	callbacks: Mutex<Vec<RotationCallback>>,
	paths: [PathBuf; 3],
}

impl std::fmt::Debug for StaticIdentityProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StaticIdentityProvider")
			.field("id", &self.id)
			.field("paths", &self.paths)
			.finish_non_exhaustive()
	}
}

impl StaticIdentityProvider {
	/// Load certificate, key, and CA bundle from PEM files.
	///
	/// The credential's SPIFFE identifier is taken from the leaf
	/// certificate's SAN; `expected_id`, when given, must match it.
	pub fn load(
		cert_path: impl AsRef<Path>,
		key_path: impl AsRef<Path>,
		bundle_path: impl AsRef<Path>,
		expected_id: Option<&SpiffeId>,
	) -> Result<Arc<Self>, Error> {
		warn!(
			"using static file-based identity; credentials will not rotate. \
			 Not suitable for production"
		);
		let cert_pem = std::fs::read(cert_path.as_ref())?;
		let key_pem = std::fs::read(key_path.as_ref())?;
		let bundle_pem = std::fs::read(bundle_path.as_ref())?;

		let chain = parse_certs(&cert_pem)?;
		if chain.is_empty() {
			return Err(Error::CertificateParse("no certificate in file".into()));
		}
		let key = parse_key(&key_pem)?;
		let roots = parse_certs(&bundle_pem)?;

		let id = extract_spiffe_id(&chain[0]).ok_or_else(|| {
			Error::CertificateParse("leaf certificate has no SPIFFE SAN URI".into())
		})?;
		if let Some(expected) = expected_id
			&& *expected != id
		{
			return Err(Error::InvalidSpiffeId(format!(
				"certificate identity {id} does not match configured {expected}"
			)));
		}
		let (not_before, not_after) = extract_validity(&chain[0])?;

		let bundle = TrustBundle {
			trust_domain: id.trust_domain().to_string(),
			roots,
		};
		let svid = Svid {
			id: id.clone(),
			chain,
			key,
			not_before,
			not_after,
		};

		Ok(Arc::new(StaticIdentityProvider {
			id,
			svid: Arc::new(svid),
			bundle: Arc::new(bundle),
			callbacks: Mutex::new(Vec::new()),
			paths: [
				cert_path.as_ref().to_path_buf(),
				key_path.as_ref().to_path_buf(),
				bundle_path.as_ref().to_path_buf(),
			],
		}))
	}
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentityProvider {
	fn spiffe_id(&self) -> &SpiffeId {
		&self.id
	}

	async fn svid(&self) -> Result<Arc<Svid>, Error> {
		// A static credential cannot be renewed; refuse it outright.
		if self.svid.is_expired() {
			return Err(Error::Expired);
		}
		Ok(self.svid.clone())
	}

	async fn trust_bundle(&self, trust_domain: &str) -> Result<Arc<TrustBundle>, Error> {
		if trust_domain != self.id.trust_domain() {
			return Err(Error::UnknownTrustDomain(trust_domain.to_string()));
		}
		Ok(self.bundle.clone())
	}

	fn on_rotation(&self, callback: RotationCallback) {
		self.callbacks.lock().push(callback);
	}

	async fn health_check(&self) -> bool {
		self.paths.iter().all(|p| p.exists()) && !self.svid.is_expired()
	}
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let items: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	items
		.map_err(|e| Error::CertificateParse(e.to_string()))?
		.into_iter()
		.map(|item| match item {
			Item::X509Certificate(der) => Ok(der),
			_ => Err(Error::CertificateParse("expected certificate".into())),
		})
		.collect()
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let parsed = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| Error::CertificateParse(e.to_string()))?
		.ok_or_else(|| Error::CertificateParse("no key".into()))?;
	match parsed {
		Item::Pkcs8Key(k) => Ok(PrivateKeyDer::Pkcs8(k)),
		Item::Sec1Key(k) => Ok(PrivateKeyDer::Sec1(k)),
		Item::Pkcs1Key(k) => Ok(PrivateKeyDer::Pkcs1(k)),
		_ => Err(Error::CertificateParse("no key".into())),
	}
}
