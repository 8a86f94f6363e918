use bus_binding::BindError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
	#[error("parse error at {line}:{column}: {message}")]
	Parse { line: u64, column: u64, message: String },

	#[error("a prior response for the same subject is still being bound")]
	BinderLocked,

	#[error("schema violation: {0}")]
	SchemaViolation(String),

	#[error("no service registered for subject '{0}'")]
	UnknownSubject(String),

	#[error("a provider for subject '{0}' already exists")]
	DuplicateProvider(String),

	#[error("a service for subject '{0}' already exists")]
	DuplicateService(String),

	#[error("listener has already been added to subject '{0}'")]
	DuplicateListener(String),

	#[error("subject pattern for listener is invalid: {0}")]
	InvalidPattern(String),

	#[error("only point-to-point messages may carry a reply callback")]
	InvalidCallback,

	#[error("only point-to-point messages can be sent synchronously")]
	NotPointToPoint,

	#[error("synchronous send timed out")]
	ExecutionTimeout,

	#[error("service error {code}: {description}")]
	Service { code: i32, description: String },
}

impl From<BindError> for BusError {
	fn from(err: BindError) -> Self {
		match err {
			BindError::Parse { line, column, message } => BusError::Parse { line, column, message },
			BindError::Locked => BusError::BinderLocked,
			BindError::Schema(message) => BusError::SchemaViolation(message),
			BindError::Rule(message) => BusError::Service { code: 500, description: message },
		}
	}
}
