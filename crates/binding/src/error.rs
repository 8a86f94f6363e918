use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
	#[error("parse error at {line}:{column}: {message}")]
	Parse { line: u64, column: u64, message: String },

	#[error("binder is already bound to an active parse")]
	Locked,

	#[error("schema violation: {0}")]
	Schema(String),

	#[error("rule callback failed: {0}")]
	Rule(String),
}

impl BindError {
	pub(crate) fn schema(message: impl Into<String>) -> Self {
		BindError::Schema(message.into())
	}
}
