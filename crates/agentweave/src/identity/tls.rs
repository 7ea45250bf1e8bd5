//! TLS material derived from workload identity.
//!
//! Peers are authenticated by the SPIFFE URI in their certificate SAN, not by
//! DNS name: client-side verification chains the peer certificate to the
//! bundle of the *expected peer's* trust domain and then requires the SAN URI
//! to equal the expected identifier byte-exact. Server-side verification is
//! standard WebPKI client-cert validation wrapped with a trust-domain check.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rustls::client::Resumption;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
	CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
	ServerConfig, SignatureScheme, SupportedProtocolVersion,
};

use super::{Error, SpiffeId, Svid, TrustBundle};
use crate::config::TlsVersion;

static PROVIDER: Lazy<Arc<CryptoProvider>> =
	Lazy::new(|| Arc::new(rustls::crypto::ring::default_provider()));

pub fn provider() -> Arc<CryptoProvider> {
	PROVIDER.clone()
}

/// Protocol versions admitted for a configured minimum. TLS 1.3 is always
/// included; 1.2 only when explicitly allowed.
static TLS_V1_2_AND_V1_3: &[&SupportedProtocolVersion] =
	&[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS_V1_3_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

pub fn protocol_versions(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
	match min {
		TlsVersion::V1_2 => TLS_V1_2_AND_V1_3,
		TlsVersion::V1_3 => TLS_V1_3_ONLY,
	}
}

/// Extract the SPIFFE identifier from a certificate's SAN URI list.
pub fn extract_spiffe_id(cert: &CertificateDer<'_>) -> Option<SpiffeId> {
	let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
	parsed
		.subject_alternative_name()
		.ok()
		.flatten()
		.and_then(|ext| {
			ext.value
				.general_names
				.iter()
				.filter_map(|n| match n {
					x509_parser::extensions::GeneralName::URI(uri) => Some(*uri),
					_ => None,
				})
				.find(|uri| uri.starts_with("spiffe://"))
		})
		.and_then(|san| SpiffeId::from_str(san).ok())
}

/// Certificate validity window as `SystemTime`s.
pub fn extract_validity(cert: &CertificateDer<'_>) -> Result<(SystemTime, SystemTime), Error> {
	let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
		.map_err(|e| Error::CertificateParse(e.to_string()))?;
	let to_time = |t: i64| UNIX_EPOCH + Duration::from_secs(t.try_into().unwrap_or_default());
	Ok((
		to_time(parsed.validity.not_before.timestamp()),
		to_time(parsed.validity.not_after.timestamp()),
	))
}

/// Client-side verifier: chain validation against the expected peer's trust
/// bundle plus byte-exact SAN identity match. The `ServerName` from the
/// handshake is deliberately ignored.
#[derive(Debug)]
pub struct PeerIdentityVerifier {
	roots: Arc<RootCertStore>,
	expected: SpiffeId,
	supported: WebPkiSupportedAlgorithms,
}

impl PeerIdentityVerifier {
	pub fn new(roots: Arc<RootCertStore>, expected: SpiffeId) -> Self {
		PeerIdentityVerifier {
			roots,
			expected,
			supported: provider().signature_verification_algorithms,
		}
	}
}

impl ServerCertVerifier for PeerIdentityVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		let cert = ParsedCertificate::try_from(end_entity)?;
		rustls::client::verify_server_cert_signed_by_trust_anchor(
			&cert,
			&self.roots,
			intermediates,
			now,
			self.supported.all,
		)?;
		match extract_spiffe_id(end_entity) {
			Some(actual) if actual == self.expected => Ok(ServerCertVerified::assertion()),
			actual => {
				tracing::warn!(
					expected = %self.expected,
					actual = actual.as_ref().map(|a| a.to_string()).unwrap_or_default(),
					"peer identity mismatch"
				);
				Err(rustls::Error::InvalidCertificate(
					CertificateError::ApplicationVerificationFailure,
				))
			},
		}
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.supported.supported_schemes()
	}
}

/// Server-side verifier: WebPKI client-certificate validation wrapped with a
/// trust-domain restriction on the presented SPIFFE identity.
#[derive(Debug)]
pub struct TrustDomainClientVerifier {
	inner: Arc<dyn ClientCertVerifier>,
	trust_domain: String,
}

impl TrustDomainClientVerifier {
	pub fn new(inner: Arc<dyn ClientCertVerifier>, trust_domain: String) -> Arc<Self> {
		Arc::new(TrustDomainClientVerifier {
			inner,
			trust_domain,
		})
	}
}

impl ClientCertVerifier for TrustDomainClientVerifier {
	fn offer_client_auth(&self) -> bool {
		true
	}

	fn client_auth_mandatory(&self) -> bool {
		true
	}

	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		self.inner.root_hint_subjects()
	}

	fn verify_client_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		now: UnixTime,
	) -> Result<ClientCertVerified, rustls::Error> {
		self
			.inner
			.verify_client_cert(end_entity, intermediates, now)?;
		let Some(id) = extract_spiffe_id(end_entity) else {
			return Err(rustls::Error::InvalidCertificate(
				CertificateError::ApplicationVerificationFailure,
			));
		};
		if id.trust_domain() != self.trust_domain {
			tracing::warn!(
				presented = %id,
				trust_domain = %self.trust_domain,
				"client certificate from untrusted domain"
			);
			return Err(rustls::Error::InvalidCertificate(
				CertificateError::ApplicationVerificationFailure,
			));
		}
		Ok(ClientCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Build an mTLS client config presenting `svid` and verifying the peer as
/// `expected_peer` against `bundle`.
pub fn client_config(
	svid: &Svid,
	bundle: &TrustBundle,
	expected_peer: SpiffeId,
	min_version: TlsVersion,
) -> Result<ClientConfig, Error> {
	let roots = bundle.root_store()?;
	let verifier = PeerIdentityVerifier::new(roots, expected_peer);
	let mut cc = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(protocol_versions(min_version))?
		.dangerous() // custom verifier requires the opt-in; verification itself is mandatory
		.with_custom_certificate_verifier(Arc::new(verifier))
		.with_client_auth_cert(svid.chain.clone(), svid.key.clone_key())?;
	cc.resumption = Resumption::disabled();
	Ok(cc)
}

/// Build an mTLS server config presenting `svid` and requiring client
/// certificates chained to `bundle` within our own trust domain.
pub fn server_config(
	svid: &Svid,
	bundle: &TrustBundle,
	min_version: TlsVersion,
) -> Result<ServerConfig, Error> {
	let roots = bundle.root_store()?;
	let raw = rustls::server::WebPkiClientVerifier::builder_with_provider(roots, provider())
		.build()?;
	let verifier = TrustDomainClientVerifier::new(raw, svid.id.trust_domain().to_string());
	let mut sc = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(protocol_versions(min_version))?
		.with_client_cert_verifier(verifier)
		.with_single_cert(svid.chain.clone(), svid.key.clone_key())?;
	sc.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(sc)
}
