//! Error types for the worker runtime.

use std::path::PathBuf;
use std::sync::Arc;

use sfu_protocol::RemoteErrorKind;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the media worker.
#[derive(Debug, Error)]
pub enum Error {
	/// Worker binary was not found.
	#[error("Worker binary not found at {0}. Set SFU_WORKER_BIN or build the worker.")]
	WorkerBinaryNotFound(PathBuf),

	/// Failed to spawn the worker process.
	#[error("Failed to spawn worker process: {0}")]
	SpawnFailed(String),

	/// Worker exited with the reserved "wrong settings" status before running.
	#[error("Worker rejected its settings (exit code 42)")]
	SettingsRejected,

	/// Worker process exited or was killed without being asked to.
	#[error("Worker process died [pid:{pid}, code:{code:?}, signal:{signal:?}]")]
	ProcessDied {
		pid: u32,
		code: Option<i32>,
		signal: Option<i32>,
	},

	/// Worker process could not be waited on or reported an error.
	#[error("Worker process error [pid:{pid}]: {message}")]
	ProcessError { pid: u32, message: String },

	/// Transport-level error (pipe communication).
	#[error("Transport error: {0}")]
	TransportError(String),

	/// Malformed frame or payload.
	#[error("Protocol error: {0}")]
	ProtocolError(String),

	/// Encoded request exceeds the frame bound; nothing was written.
	#[error("Channel request too big: {size} bytes (max {max})")]
	RequestTooLarge { size: usize, max: usize },

	/// Channel was closed before or while the request was pending.
	#[error("Channel closed")]
	ChannelClosed,

	/// Worker answered with `accepted: false`.
	///
	/// The message is the worker-supplied reason string.
	#[error("{reason}")]
	Remote {
		kind: RemoteErrorKind,
		reason: String,
	},

	/// Operation on an entity in the wrong state (e.g. already closed).
	#[error("Invalid state: {0}")]
	InvalidState(String),

	/// Referenced entity does not exist.
	#[error("{kind} not found: {id}")]
	NotFound { kind: &'static str, id: String },

	/// Invalid argument provided to a method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Shared pipe transport pair creation failed.
	#[error("Pipe transport pair creation failed: {0}")]
	PipeTransportPair(Arc<Error>),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns true if the worker rejected a request with its type-mismatch class.
	pub fn is_type_error(&self) -> bool {
		match self {
			Error::Remote { kind, .. } => *kind == RemoteErrorKind::TypeError,
			Error::PipeTransportPair(inner) => inner.is_type_error(),
			_ => false,
		}
	}

	/// Returns true if the request failed because the channel closed.
	pub fn is_channel_closed(&self) -> bool {
		match self {
			Error::ChannelClosed => true,
			Error::PipeTransportPair(inner) => inner.is_channel_closed(),
			_ => false,
		}
	}

	/// Returns true for process-level failures (spawn, death, rejected settings).
	pub fn is_process_failure(&self) -> bool {
		matches!(
			self,
			Error::SpawnFailed(_)
				| Error::SettingsRejected
				| Error::ProcessDied { .. }
				| Error::ProcessError { .. }
		)
	}

	/// Builds the error for a rejected response.
	pub fn remote(error_tag: Option<&str>, reason: Option<&str>) -> Self {
		Error::Remote {
			kind: error_tag.map_or(RemoteErrorKind::Error, RemoteErrorKind::from_tag),
			reason: reason.unwrap_or("request failed").to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_remote_error_message_is_reason() {
		let error = Error::remote(Some("TypeError"), Some("wrong kind"));
		assert_eq!(error.to_string(), "wrong kind");
		assert!(error.is_type_error());
	}

	#[test]
	fn test_unknown_remote_class_is_generic() {
		let error = Error::remote(Some("Whatever"), Some("nope"));
		assert!(!error.is_type_error());
		match error {
			Error::Remote { kind, .. } => assert_eq!(kind, RemoteErrorKind::Error),
			other => panic!("Expected Remote, got {:?}", other),
		}
	}

	#[test]
	fn test_pipe_pair_error_delegates() {
		let error = Error::PipeTransportPair(Arc::new(Error::ChannelClosed));
		assert!(error.is_channel_closed());
	}

	#[test]
	fn test_process_failure_classification() {
		assert!(Error::SettingsRejected.is_process_failure());
		assert!(
			Error::ProcessDied {
				pid: 1,
				code: Some(1),
				signal: None
			}
			.is_process_failure()
		);
		assert!(!Error::ChannelClosed.is_process_failure());
	}
}
