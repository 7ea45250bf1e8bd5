//! AgentWeave: an SDK for building networked agents with cryptographic
//! workload identity, policy-driven authorization, and mutually-authenticated
//! transport.
//!
//! Every agent built with this crate is both a server (exposing named
//! capabilities over the A2A protocol) and a client (calling capabilities on
//! peer agents). The secure path is the only path: there is no way to
//! construct a channel without peer verification, no way to serve a request
//! without a client certificate, and no way to skip the authorization gate.

pub mod a2a;
pub mod agent;
pub mod audit;
pub mod authz;
pub mod config;
pub mod context;
pub mod errors;
pub mod identity;
pub mod telemetry;
pub mod transport;

pub use agent::{Agent, AgentBuilder, CapabilityMetadata};
pub use audit::{AuditEvent, AuditEventType, AuditTrail};
pub use authz::AuthzDecision;
pub use config::AgentConfig;
pub use context::RequestContext;
pub use errors::{Error, ErrorClass};
pub use identity::SpiffeId;
