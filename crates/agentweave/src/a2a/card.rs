//! The agent card: the self-description document an agent publishes at
//! `/.well-known/agent.json`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::AgentConfig;
use crate::identity::SpiffeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default = "default_modes")]
	pub input_modes: Vec<String>,
	#[serde(default = "default_modes")]
	pub output_modes: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

fn default_modes() -> Vec<String> {
	vec!["application/json".to_string()]
}

impl Capability {
	pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
		Capability {
			name: name.into(),
			description: description.into(),
			input_modes: default_modes(),
			output_modes: default_modes(),
			parameters: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthScheme {
	#[serde(rename = "type")]
	pub scheme_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

impl AuthScheme {
	pub fn spiffe(workload_id: &SpiffeId) -> Self {
		let mut metadata = Map::new();
		metadata.insert(
			"workload_id".to_string(),
			Value::String(workload_id.to_string()),
		);
		AuthScheme {
			scheme_type: "spiffe".to_string(),
			description: Some("SPIFFE workload identity over mutual TLS".to_string()),
			metadata,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Authentication {
	#[serde(default)]
	pub schemes: Vec<AuthScheme>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CardExtensions {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub workload_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub trust_domain: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub protocol: Option<String>,
}

/// Immutable after construction, except that capability registration can
/// append (which happens before the card is first served).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
	pub name: String,
	#[serde(default)]
	pub description: String,
	pub url: String,
	#[serde(default = "default_version")]
	pub version: String,
	#[serde(default)]
	pub capabilities: Vec<Capability>,
	#[serde(default)]
	pub authentication: Authentication,
	#[serde(default)]
	pub extensions: CardExtensions,
}

fn default_version() -> String {
	"1.0.0".to_string()
}

impl AgentCard {
	pub fn from_config(config: &AgentConfig, workload_id: &SpiffeId, url: impl Into<String>) -> Self {
		let capabilities = config
			.agent
			.capabilities
			.iter()
			.map(|c| Capability {
				name: c.name.clone(),
				description: c.description.clone(),
				input_modes: c.input_modes.clone(),
				output_modes: c.output_modes.clone(),
				parameters: None,
			})
			.collect();
		AgentCard {
			name: config.agent.name.clone(),
			description: config.agent.description.clone(),
			url: url.into(),
			version: default_version(),
			capabilities,
			authentication: Authentication {
				schemes: vec![AuthScheme::spiffe(workload_id)],
			},
			extensions: CardExtensions {
				workload_id: Some(workload_id.to_string()),
				trust_domain: Some(workload_id.trust_domain().to_string()),
				protocol: Some("a2a".to_string()),
			},
		}
	}

	pub fn has_capability(&self, name: &str) -> bool {
		self.capabilities.iter().any(|c| c.name == name)
	}

	pub fn capability(&self, name: &str) -> Option<&Capability> {
		self.capabilities.iter().find(|c| c.name == name)
	}

	/// Append a capability unless one with the same name already exists.
	pub fn add_capability(&mut self, capability: Capability) {
		if !self.has_capability(&capability.name) {
			self.capabilities.push(capability);
		}
	}

	pub fn workload_id(&self) -> Option<&str> {
		self.extensions.workload_id.as_deref()
	}
}
