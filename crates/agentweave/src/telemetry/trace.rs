//! Span helpers. Spans carry the identifiers that matter for correlating a
//! call across agents; exporters are wired by the embedding application.

use tracing::Span;

pub fn inbound_request_span(method: &str, path: &str, peer: Option<&str>) -> Span {
	tracing::info_span!(
		"inbound_request",
		%method,
		%path,
		peer = peer.unwrap_or("unverified"),
	)
}

pub fn capability_span(capability: &str, task_id: &str, caller: &str) -> Span {
	tracing::info_span!("capability", %capability, %task_id, %caller)
}

pub fn outbound_call_span(target: &str, task_type: &str) -> Span {
	tracing::info_span!("outbound_call", %target, %task_type)
}
