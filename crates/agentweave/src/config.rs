//! Agent configuration: YAML loading, environment overrides, and the
//! production-mode validation that keeps insecure settings from ever
//! starting an agent.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("configuration file {0} not found")]
	NotFound(String),
	#[error("invalid configuration: {0}")]
	Parse(String),
	#[error("configuration validation failed: {field}: {message}")]
	Invalid { field: String, message: String },
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
	ConfigError::Invalid {
		field: field.to_string(),
		message: message.into(),
	}
}

static AGENT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap());
static CAPABILITY_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());
static TRUST_DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
		.unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
	Development,
	Staging,
	#[default]
	Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IdentityProviderKind {
	#[default]
	#[serde(rename = "workload-api")]
	WorkloadApi,
	#[serde(rename = "static")]
	Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthorizationProviderKind {
	#[default]
	#[serde(rename = "external-policy")]
	ExternalPolicy,
	/// Development only; rejected by production validation.
	#[serde(rename = "allow-all")]
	AllowAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultAction {
	#[default]
	Deny,
	/// Development only; rejected by production validation.
	LogOnly,
}

/// Peer verification mode. There is intentionally no `none` variant: a
/// config saying `peer_verification: none` fails to parse in any
/// environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PeerVerification {
	#[default]
	Strict,
	LogOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	#[default]
	A2a,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize, Default)]
pub enum TlsVersion {
	#[serde(rename = "1.2")]
	V1_2,
	#[default]
	#[serde(rename = "1.3")]
	V1_3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default = "default_modes")]
	pub input_modes: Vec<String>,
	#[serde(default = "default_modes")]
	pub output_modes: Vec<String>,
}

fn default_modes() -> Vec<String> {
	vec!["application/json".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
	pub name: String,
	pub trust_domain: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub environment: Environment,
	#[serde(default)]
	pub capabilities: Vec<CapabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StaticIdentityFiles {
	pub cert: String,
	pub key: String,
	pub bundle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySection {
	#[serde(default)]
	pub provider: IdentityProviderKind,
	#[serde(default = "default_identity_socket")]
	pub socket: String,
	#[serde(default)]
	pub allowed_trust_domains: Vec<String>,
	/// Only consulted when `provider = static`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub static_files: Option<StaticIdentityFiles>,
}

fn default_identity_socket() -> String {
	"unix:///run/spire/sockets/agent.sock".to_string()
}

impl Default for IdentitySection {
	fn default() -> Self {
		IdentitySection {
			provider: IdentityProviderKind::default(),
			socket: default_identity_socket(),
			allowed_trust_domains: Vec::new(),
			static_files: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditSection {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_audit_destination")]
	pub destination: String,
}

fn default_true() -> bool {
	true
}

fn default_audit_destination() -> String {
	"stdout".to_string()
}

impl Default for AuditSection {
	fn default() -> Self {
		AuditSection {
			enabled: true,
			destination: default_audit_destination(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationSection {
	#[serde(default)]
	pub provider: AuthorizationProviderKind,
	#[serde(default = "default_policy_endpoint")]
	pub endpoint: String,
	#[serde(default = "default_policy_path")]
	pub policy_path: String,
	#[serde(default)]
	pub default_action: DefaultAction,
	#[serde(default)]
	pub audit: AuditSection,
}

fn default_policy_endpoint() -> String {
	"http://localhost:8181".to_string()
}

fn default_policy_path() -> String {
	"agentweave/authz/allow".to_string()
}

impl Default for AuthorizationSection {
	fn default() -> Self {
		AuthorizationSection {
			provider: AuthorizationProviderKind::default(),
			endpoint: default_policy_endpoint(),
			policy_path: default_policy_path(),
			default_action: DefaultAction::default(),
			audit: AuditSection::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionPoolSection {
	#[serde(default = "default_max_connections")]
	pub max_connections: usize,
	#[serde(default = "default_idle_timeout")]
	pub idle_timeout_seconds: u64,
}

fn default_max_connections() -> usize {
	100
}

fn default_idle_timeout() -> u64 {
	60
}

impl Default for ConnectionPoolSection {
	fn default() -> Self {
		ConnectionPoolSection {
			max_connections: default_max_connections(),
			idle_timeout_seconds: default_idle_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSection {
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,
	#[serde(default = "default_recovery_timeout")]
	pub recovery_timeout_seconds: u64,
}

fn default_failure_threshold() -> u32 {
	5
}

fn default_recovery_timeout() -> u64 {
	30
}

impl Default for CircuitBreakerSection {
	fn default() -> Self {
		CircuitBreakerSection {
			failure_threshold: default_failure_threshold(),
			recovery_timeout_seconds: default_recovery_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_backoff_base")]
	pub backoff_base_seconds: f64,
	#[serde(default = "default_backoff_max")]
	pub backoff_max_seconds: f64,
}

fn default_max_attempts() -> u32 {
	3
}

fn default_backoff_base() -> f64 {
	1.0
}

fn default_backoff_max() -> f64 {
	30.0
}

impl Default for RetrySection {
	fn default() -> Self {
		RetrySection {
			max_attempts: default_max_attempts(),
			backoff_base_seconds: default_backoff_base(),
			backoff_max_seconds: default_backoff_max(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TransportSection {
	#[serde(default)]
	pub tls_min_version: TlsVersion,
	#[serde(default)]
	pub peer_verification: PeerVerification,
	#[serde(default)]
	pub connection_pool: ConnectionPoolSection,
	#[serde(default)]
	pub circuit_breaker: CircuitBreakerSection,
	#[serde(default)]
	pub retry: RetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default)]
	pub protocol: Protocol,
}

fn default_host() -> String {
	"0.0.0.0".to_string()
}

fn default_port() -> u16 {
	8443
}

impl Default for ServerSection {
	fn default() -> Self {
		ServerSection {
			host: default_host(),
			port: default_port(),
			protocol: Protocol::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_metrics_port")]
	pub port: u16,
}

fn default_metrics_port() -> u16 {
	9090
}

impl Default for MetricsSection {
	fn default() -> Self {
		MetricsSection {
			enabled: true,
			port: default_metrics_port(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TracingSection {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_exporter")]
	pub exporter: String,
	#[serde(default = "default_tracing_endpoint")]
	pub endpoint: String,
}

fn default_exporter() -> String {
	"otlp".to_string()
}

fn default_tracing_endpoint() -> String {
	"http://localhost:4317".to_string()
}

impl Default for TracingSection {
	fn default() -> Self {
		TracingSection {
			enabled: false,
			exporter: default_exporter(),
			endpoint: default_tracing_endpoint(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
	#[serde(default = "default_log_level")]
	pub level: String,
	#[serde(default = "default_log_format")]
	pub format: String,
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_log_format() -> String {
	"json".to_string()
}

impl Default for LoggingSection {
	fn default() -> Self {
		LoggingSection {
			level: default_log_level(),
			format: default_log_format(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ObservabilitySection {
	#[serde(default)]
	pub metrics: MetricsSection,
	#[serde(default)]
	pub tracing: TracingSection,
	#[serde(default)]
	pub logging: LoggingSection,
}

/// The complete agent configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
	pub agent: AgentSection,
	#[serde(default)]
	pub identity: IdentitySection,
	#[serde(default)]
	pub authorization: AuthorizationSection,
	#[serde(default)]
	pub transport: TransportSection,
	#[serde(default)]
	pub server: ServerSection,
	#[serde(default)]
	pub observability: ObservabilitySection,
}

impl AgentConfig {
	/// Load from a YAML file, apply `AGENTWEAVE_` environment overrides,
	/// and validate.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let mut config = Self::from_file(path)?;
		config.apply_env_overrides(std::env::vars());
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		if !path.exists() {
			return Err(ConfigError::NotFound(path.display().to_string()));
		}
		let raw = std::fs::read_to_string(path)?;
		serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
	}

	pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
		serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
	}

	pub fn is_production(&self) -> bool {
		self.agent.environment == Environment::Production
	}

	/// Overlay environment variables of the form
	/// `AGENTWEAVE_<SECTION>_<FIELD>` onto the parsed configuration.
	/// Unknown keys are ignored; unparseable values are rejected later by
	/// `validate` where they matter.
	pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
		const PREFIX: &str = "AGENTWEAVE_";
		for (key, value) in vars {
			let Some(rest) = key.strip_prefix(PREFIX) else {
				continue;
			};
			let Some((section, field)) = rest.split_once('_') else {
				continue;
			};
			let field = field.to_ascii_lowercase();
			match section.to_ascii_lowercase().as_str() {
				"agent" => match field.as_str() {
					"name" => self.agent.name = value,
					"trust_domain" => self.agent.trust_domain = value,
					"description" => self.agent.description = value,
					"environment" => {
						if let Ok(env) = serde_yaml::from_str(&value) {
							self.agent.environment = env;
						}
					},
					_ => {},
				},
				"identity" => match field.as_str() {
					"provider" => {
						if let Ok(p) = serde_yaml::from_str(&value) {
							self.identity.provider = p;
						}
					},
					"socket" => self.identity.socket = value,
					_ => {},
				},
				"authorization" => match field.as_str() {
					"provider" => {
						if let Ok(p) = serde_yaml::from_str(&value) {
							self.authorization.provider = p;
						}
					},
					"endpoint" => self.authorization.endpoint = value,
					"policy_path" => self.authorization.policy_path = value,
					"default_action" => {
						if let Ok(a) = serde_yaml::from_str(&value) {
							self.authorization.default_action = a;
						}
					},
					_ => {},
				},
				"transport" => match field.as_str() {
					"tls_min_version" => {
						if let Ok(v) = serde_yaml::from_str(&format!("\"{value}\"")) {
							self.transport.tls_min_version = v;
						}
					},
					"peer_verification" => {
						if let Ok(v) = serde_yaml::from_str(&value) {
							self.transport.peer_verification = v;
						}
					},
					_ => {},
				},
				"server" => match field.as_str() {
					"host" => self.server.host = value,
					"port" => {
						if let Ok(p) = value.parse() {
							self.server.port = p;
						}
					},
					_ => {},
				},
				"observability" => {
					if field == "logging_level" {
						self.observability.logging.level = value;
					}
				},
				_ => {},
			}
		}
	}

	/// Enforce the security rules. In production: default-deny only, no
	/// allow-all provider, strict peer verification, static identity
	/// rejected, audit enabled.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if !AGENT_NAME_RE.is_match(&self.agent.name) {
			return Err(invalid(
				"agent.name",
				format!(
					"'{}' must match ^[a-z][a-z0-9-]*$",
					self.agent.name
				),
			));
		}
		if !TRUST_DOMAIN_RE.is_match(&self.agent.trust_domain) {
			return Err(invalid(
				"agent.trust_domain",
				format!("'{}' is not a valid DNS name", self.agent.trust_domain),
			));
		}
		for cap in &self.agent.capabilities {
			if !CAPABILITY_NAME_RE.is_match(&cap.name) {
				return Err(invalid(
					"agent.capabilities",
					format!("capability '{}' must match ^[a-z][a-z0-9_]*$", cap.name),
				));
			}
		}
		if !(self.identity.socket.starts_with("unix://")
			|| self.identity.socket.starts_with("tcp://"))
		{
			return Err(invalid(
				"identity.socket",
				"must start with unix:// or tcp://",
			));
		}
		if self.identity.provider == IdentityProviderKind::Static
			&& self.identity.static_files.is_none()
		{
			return Err(invalid(
				"identity.static_files",
				"required when identity.provider is 'static'",
			));
		}
		if !(self.authorization.endpoint.starts_with("http://")
			|| self.authorization.endpoint.starts_with("https://"))
		{
			return Err(invalid(
				"authorization.endpoint",
				"must be an HTTP(S) URL",
			));
		}
		if self.server.port == 0 {
			return Err(invalid("server.port", "must be in [1, 65535]"));
		}

		if self.is_production() {
			if self.authorization.default_action != DefaultAction::Deny {
				return Err(invalid(
					"authorization.default_action",
					"must be 'deny' in production",
				));
			}
			if self.authorization.provider == AuthorizationProviderKind::AllowAll {
				return Err(invalid(
					"authorization.provider",
					"cannot be 'allow-all' in production",
				));
			}
			if self.transport.peer_verification != PeerVerification::Strict {
				return Err(invalid(
					"transport.peer_verification",
					"must be 'strict' in production",
				));
			}
			if !self.authorization.audit.enabled {
				return Err(invalid(
					"authorization.audit.enabled",
					"must be true in production",
				));
			}
			if self.identity.provider == IdentityProviderKind::Static {
				return Err(invalid(
					"identity.provider",
					"static credentials are not allowed in production",
				));
			}
		}
		Ok(())
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.transport.connection_pool.idle_timeout_seconds)
	}

	pub fn recovery_timeout(&self) -> Duration {
		Duration::from_secs(self.transport.circuit_breaker.recovery_timeout_seconds)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = r#"
agent:
  name: search-agent
  trust_domain: agentweave.io
"#;

	fn base() -> AgentConfig {
		AgentConfig::from_yaml(MINIMAL).unwrap()
	}

	#[test]
	fn minimal_config_is_valid_production() {
		let config = base();
		assert!(config.is_production());
		config.validate().unwrap();
	}

	#[test]
	fn rejects_bad_agent_name() {
		let mut config = base();
		config.agent.name = "Search Agent".into();
		assert_matches::assert_matches!(
			config.validate(),
			Err(ConfigError::Invalid { field, .. }) if field == "agent.name"
		);
	}

	#[test]
	fn rejects_bad_trust_domain() {
		let mut config = base();
		config.agent.trust_domain = "not a domain!".into();
		assert!(config.validate().is_err());
	}

	#[test]
	fn production_rejects_log_only_default_action() {
		let mut config = base();
		config.authorization.default_action = DefaultAction::LogOnly;
		assert_matches::assert_matches!(
			config.validate(),
			Err(ConfigError::Invalid { field, .. }) if field == "authorization.default_action"
		);
		// The same setting passes in development.
		config.agent.environment = Environment::Development;
		config.validate().unwrap();
	}

	#[test]
	fn production_rejects_allow_all() {
		let mut config = base();
		config.authorization.provider = AuthorizationProviderKind::AllowAll;
		assert!(config.validate().is_err());
	}

	#[test]
	fn production_rejects_lax_peer_verification() {
		let mut config = base();
		config.transport.peer_verification = PeerVerification::LogOnly;
		assert!(config.validate().is_err());
	}

	#[test]
	fn production_requires_audit() {
		let mut config = base();
		config.authorization.audit.enabled = false;
		assert!(config.validate().is_err());
	}

	#[test]
	fn peer_verification_none_never_parses() {
		let raw = format!("{MINIMAL}transport:\n  peer_verification: none\n");
		assert!(AgentConfig::from_yaml(&raw).is_err());
	}

	#[test]
	fn env_overrides_apply() {
		let mut config = base();
		let vars = vec![
			("AGENTWEAVE_AGENT_NAME".to_string(), "other-agent".to_string()),
			("AGENTWEAVE_SERVER_PORT".to_string(), "9443".to_string()),
			(
				"AGENTWEAVE_AUTHORIZATION_ENDPOINT".to_string(),
				"https://opa.internal:8181".to_string(),
			),
			("UNRELATED".to_string(), "x".to_string()),
		];
		config.apply_env_overrides(vars.into_iter());
		assert_eq!(config.agent.name, "other-agent");
		assert_eq!(config.server.port, 9443);
		assert_eq!(config.authorization.endpoint, "https://opa.internal:8181");
	}

	#[test]
	fn capability_names_validated() {
		let mut config = base();
		config.agent.capabilities.push(CapabilityConfig {
			name: "BadName".into(),
			description: String::new(),
			input_modes: default_modes(),
			output_modes: default_modes(),
		});
		assert!(config.validate().is_err());
	}

	#[test]
	fn static_provider_requires_files_and_is_rejected_in_production() {
		let mut config = base();
		config.identity.provider = IdentityProviderKind::Static;
		assert!(config.validate().is_err());
		config.identity.static_files = Some(StaticIdentityFiles {
			cert: "/tmp/cert.pem".into(),
			key: "/tmp/key.pem".into(),
			bundle: "/tmp/ca.pem".into(),
		});
		// Still rejected: production forbids static credentials.
		assert!(config.validate().is_err());
		config.agent.environment = Environment::Development;
		config.validate().unwrap();
	}
}
