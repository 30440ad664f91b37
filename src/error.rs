use std::io;

use thiserror::Error;

/// Longest slice of an offending payload kept in a [`DecodeError`].
const EXCERPT_LEN: usize = 120;

/// A shadow document that could not be read as JSON of the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error: {reason} (payload: {excerpt:?})")]
pub struct DecodeError {
	pub reason: String,
	pub excerpt: String,
}

impl DecodeError {
	pub fn new(reason: impl Into<String>, payload: &[u8]) -> Self {
		DecodeError {
			reason: reason.into(),
			excerpt: excerpt(payload),
		}
	}
}

/// Printable prefix of a payload for log lines.
pub(crate) fn excerpt(payload: &[u8]) -> String {
	String::from_utf8_lossy(payload).chars().take(EXCERPT_LEN).collect()
}

/// A field value that parsed but lies outside the range the light accepts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
	#[error("{field} value {value} is out of range [{min}, {max}]")]
	OutOfRangeValue {
		field: &'static str,
		value: i64,
		min: i64,
		max: i64,
	},
}

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("transport operation timed out")]
	Timeout,
	#[error("transport is disconnected")]
	Disconnected,
	#[error("request rejected: {0}")]
	Rejected(String),
	#[error("malformed transport message: {0}")]
	Codec(String),
	#[error("transport io: {0}")]
	Io(#[from] io::Error),
}

impl TransportError {
	/// Whether the error means the link is gone and must be re-established.
	pub fn is_disconnect(&self) -> bool {
		matches!(self, TransportError::Disconnected | TransportError::Io(_))
	}
}

#[derive(Debug, Error)]
pub enum OutputError {
	#[error("output io: {0}")]
	Io(#[from] io::Error),
	#[error("output driver timed out")]
	Timeout,
	#[error("output driver rejected command {command} with code {code}")]
	Rejected { command: u32, code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
	#[error("missing required setting {0}")]
	Missing(&'static str),
	#[error("invalid value {value:?} for {key}")]
	Invalid { key: &'static str, value: String },
}

/// Errors allowed to stop the agent. Everything else is logged and absorbed
/// by the reconciliation loop.
#[derive(Debug, Error)]
pub enum AgentError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("initial connection failed: {0}")]
	InitialConnect(TransportError),
	#[error("output driver setup failed: {0}")]
	Output(#[from] OutputError),
}
