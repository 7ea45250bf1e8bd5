use crate::a2a::task::TaskError;
use crate::{a2a, authz, config, identity, transport};

/// Umbrella error for the public API surface.
///
/// Components carry their own error enums; this type exists so callers of
/// [`crate::Agent`] get one thing to match on, and so every failure can be
/// classified into the coarse classes of [`ErrorClass`] without losing the
/// underlying detail (which goes to the audit trail, not the caller).
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Identity(#[from] identity::Error),
	#[error(transparent)]
	Authz(#[from] authz::Error),
	#[error(transparent)]
	Transport(#[from] transport::Error),
	#[error(transparent)]
	Protocol(#[from] a2a::Error),
	#[error(transparent)]
	Task(#[from] TaskError),
	#[error(transparent)]
	Config(#[from] config::ConfigError),
	#[error("access denied: {reason}")]
	AccessDenied { reason: String },
	#[error("invalid parameters: {0}")]
	InvalidParams(String),
	#[error("internal error: {0}")]
	Internal(String),
}

/// Coarse failure classes surfaced to callers of the public API.
///
/// The unredacted cause is recorded in the audit trail; callers only get to
/// distinguish these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	Denied,
	Timeout,
	NotFound,
	InvalidInput,
	Internal,
}

impl Error {
	pub fn class(&self) -> ErrorClass {
		match self {
			Error::AccessDenied { .. } => ErrorClass::Denied,
			Error::InvalidParams(_) => ErrorClass::InvalidInput,
			Error::Transport(transport::Error::RequestTimeout(_)) => ErrorClass::Timeout,
			Error::Task(TaskError::NotFound(_)) => ErrorClass::NotFound,
			Error::Task(TaskError::Timeout) => ErrorClass::Timeout,
			Error::Protocol(a2a::Error::UnknownCapability(_)) => ErrorClass::NotFound,
			Error::Protocol(a2a::Error::InvalidParams(_)) => ErrorClass::InvalidInput,
			Error::Config(_) => ErrorClass::InvalidInput,
			_ => ErrorClass::Internal,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn classes() {
		let e = Error::AccessDenied {
			reason: "cross-domain".into(),
		};
		assert_eq!(e.class(), ErrorClass::Denied);
		let e = Error::Transport(transport::Error::RequestTimeout(Duration::from_secs(5)));
		assert_eq!(e.class(), ErrorClass::Timeout);
		let e = Error::Task(TaskError::NotFound("t-1".into()));
		assert_eq!(e.class(), ErrorClass::NotFound);
		let e = Error::Internal("boom".into());
		assert_eq!(e.class(), ErrorClass::Internal);
	}
}
