use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use url::Url;

use agentweave::a2a::{A2aClient, AgentCard};
use agentweave::authz::{AuthzEnforcer, PolicyEnforcer, PolicyEnforcerConfig};
use agentweave::config::{AgentConfig, IdentityProviderKind};
use agentweave::identity::{SpiffeId, StaticIdentityProvider};
use agentweave::telemetry;
use agentweave::transport::{ChannelConfig, SecureChannel};
use agentweave::Agent;

#[derive(Parser)]
#[command(name = "agentweave", version, about = "Secure agent runtime and tooling")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Validate a configuration file.
	Validate { file: String },
	/// Run an agent from a configuration file.
	Serve {
		file: String,
		#[arg(long)]
		host: Option<String>,
		#[arg(long)]
		port: Option<u16>,
	},
	/// Check a peer agent is reachable and serving its card.
	Ping {
		/// Workload identifier of the peer.
		workload_id: String,
		#[arg(long)]
		url: Url,
		/// Configuration supplying this side's identity.
		#[arg(long)]
		config: String,
	},
	/// Agent card operations.
	Card {
		#[command(subcommand)]
		command: CardCommand,
	},
	/// Authorization tooling.
	Authz {
		#[command(subcommand)]
		command: AuthzCommand,
	},
	/// Query an agent's health endpoint.
	Health { url: Url },
}

#[derive(Subcommand)]
enum CardCommand {
	/// Render the agent card a configuration would publish.
	Generate { file: String },
}

#[derive(Subcommand)]
enum AuthzCommand {
	/// Ask the policy engine for a decision.
	Check {
		#[arg(long)]
		caller: String,
		#[arg(long)]
		callee: String,
		#[arg(long)]
		action: String,
		#[arg(long)]
		config: Option<String>,
		#[arg(long)]
		endpoint: Option<String>,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	match cli.command {
		Command::Validate { file } => validate(&file),
		Command::Serve { file, host, port } => serve(&file, host, port).await,
		Command::Ping {
			workload_id,
			url,
			config,
		} => ping(&workload_id, url, &config).await,
		Command::Card {
			command: CardCommand::Generate { file },
		} => card_generate(&file),
		Command::Authz {
			command:
				AuthzCommand::Check {
					caller,
					callee,
					action,
					config,
					endpoint,
				},
		} => authz_check(&caller, &callee, &action, config.as_deref(), endpoint).await,
		Command::Health { url } => health(url).await,
	}
}

fn validate(file: &str) -> anyhow::Result<()> {
	let config = AgentConfig::load(file).with_context(|| format!("loading {file}"))?;
	println!(
		"Configuration valid: agent '{}' in trust domain '{}'",
		config.agent.name, config.agent.trust_domain
	);
	Ok(())
}

async fn serve(file: &str, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
	let mut config = AgentConfig::load(file).with_context(|| format!("loading {file}"))?;
	if let Some(host) = host {
		config.server.host = host;
	}
	if let Some(port) = port {
		config.server.port = port;
	}
	config.validate()?;
	telemetry::init_logging(&config.observability.logging);

	if config.identity.provider == IdentityProviderKind::WorkloadApi {
		bail!(
			"the workload-api identity provider needs a Workload API binding; \
			 embed the agent with AgentBuilder::with_workload_api, or use the \
			 static provider for local development"
		);
	}
	let agent = Agent::builder(config).build().await?;
	tracing::info!(identity = %agent.workload_id(), "serving agent");
	agent.run().await?;
	Ok(())
}

async fn ping(workload_id: &str, url: Url, config: &str) -> anyhow::Result<()> {
	let config = AgentConfig::load(config)?;
	let peer = SpiffeId::from_str(workload_id)?;
	let files = config
		.identity
		.static_files
		.as_ref()
		.context("ping requires identity.static_files for this side's credential")?;
	let identity = StaticIdentityProvider::load(&files.cert, &files.key, &files.bundle, None)?;
	let channel = SecureChannel::new(
		identity,
		peer.clone(),
		url,
		ChannelConfig {
			timeout: Duration::from_secs(5),
			..Default::default()
		},
		None,
		None,
	)?;
	let card = A2aClient::discover(&channel).await?;
	println!(
		"{} is alive: '{}' ({} capabilities)",
		peer,
		card.name,
		card.capabilities.len()
	);
	Ok(())
}

fn card_generate(file: &str) -> anyhow::Result<()> {
	let config = AgentConfig::load(file)?;
	let workload_id = SpiffeId::new(
		config.agent.trust_domain.clone(),
		format!("/agent/{}", config.agent.name),
	)?;
	let url = format!("https://{}:{}", config.server.host, config.server.port);
	let card = AgentCard::from_config(&config, &workload_id, url);
	println!("{}", serde_json::to_string_pretty(&card)?);
	Ok(())
}

async fn authz_check(
	caller: &str,
	callee: &str,
	action: &str,
	config: Option<&str>,
	endpoint: Option<String>,
) -> anyhow::Result<()> {
	let mut enforcer_config = PolicyEnforcerConfig::default();
	if let Some(path) = config {
		let config = AgentConfig::load(path)?;
		enforcer_config.endpoint = config.authorization.endpoint;
		enforcer_config.policy_path = config.authorization.policy_path;
		enforcer_config.default_action = config.authorization.default_action;
	}
	if let Some(endpoint) = endpoint {
		enforcer_config.endpoint = endpoint;
	}
	let enforcer = PolicyEnforcer::new(enforcer_config, None, None)?;
	let decision = enforcer.check(caller, callee, action, None).await;
	println!(
		"{}: {} (policy: {})",
		decision.decision_str(),
		decision.reason,
		decision.policy_id.as_deref().unwrap_or("-")
	);
	if !decision.allowed {
		std::process::exit(1);
	}
	Ok(())
}

async fn health(url: Url) -> anyhow::Result<()> {
	let connector = hyper_rustls::HttpsConnectorBuilder::new()
		.with_native_roots()?
		.https_or_http()
		.enable_http1()
		.build();
	let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(connector);
	let target = url.join("/health")?;
	let request = http::Request::builder()
		.method(http::Method::GET)
		.uri(target.as_str())
		.body(Full::new(Bytes::new()))?;
	let response = tokio::time::timeout(Duration::from_secs(5), client.request(request))
		.await
		.context("health request timed out")??;
	let status = response.status();
	let body = response.into_body().collect().await?.to_bytes();
	println!("{status}: {}", String::from_utf8_lossy(&body));
	if !status.is_success() {
		std::process::exit(1);
	}
	Ok(())
}
