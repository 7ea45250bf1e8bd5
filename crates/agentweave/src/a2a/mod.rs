//! Agent-to-agent protocol: task lifecycle, agent card, JSON-RPC client and
//! server, SSE streaming.

pub mod card;
pub mod client;
pub mod server;
pub mod task;

pub use card::{AgentCard, AuthScheme, Capability};
pub use client::A2aClient;
pub use server::{A2aServer, PeerIdentity};
pub use task::{Task, TaskManager, TaskState};

use crate::transport;

/// JSON-RPC error codes. `-32000` is reserved for semantic failures
/// (authorization denial, missing handler, unknown task).
pub mod rpc_codes {
	pub const PARSE_ERROR: i64 = -32700;
	pub const INVALID_REQUEST: i64 = -32600;
	pub const METHOD_NOT_FOUND: i64 = -32601;
	pub const INVALID_PARAMS: i64 = -32602;
	pub const SEMANTIC_ERROR: i64 = -32000;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("invalid JSON-RPC request: {0}")]
	InvalidRpc(String),
	#[error("method not found: {0}")]
	MethodNotFound(String),
	#[error("invalid params: {0}")]
	InvalidParams(String),
	#[error("unknown capability: {0}")]
	UnknownCapability(String),
	#[error("agent discovery failed: {0}")]
	Discovery(String),
	#[error("remote rpc error {code}: {message}")]
	Rpc { code: i64, message: String },
	#[error("invalid response: {0}")]
	InvalidResponse(String),
	#[error(transparent)]
	Transport(#[from] transport::Error),
}
