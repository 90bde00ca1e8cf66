//! Worker log settings, shared by the spawn arguments and `worker.updateSettings`.

use serde::{Deserialize, Serialize};

/// Minimum severity of log lines the worker emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
	Debug,
	Warn,
	#[default]
	Error,
	None,
}

impl WorkerLogLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Debug => "debug",
			Self::Warn => "warn",
			Self::Error => "error",
			Self::None => "none",
		}
	}
}

/// Worker subsystem whose debug lines are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogTag {
	Info,
	Ice,
	Dtls,
	Rtp,
	Srtp,
	Rtcp,
	Rtx,
	Bwe,
	Score,
	Simulcast,
	Svc,
	Sctp,
	Message,
}

impl WorkerLogTag {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Info => "info",
			Self::Ice => "ice",
			Self::Dtls => "dtls",
			Self::Rtp => "rtp",
			Self::Srtp => "srtp",
			Self::Rtcp => "rtcp",
			Self::Rtx => "rtx",
			Self::Bwe => "bwe",
			Self::Score => "score",
			Self::Simulcast => "simulcast",
			Self::Svc => "svc",
			Self::Sctp => "sctp",
			Self::Message => "message",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_wire_names_match_as_str() {
		for level in [
			WorkerLogLevel::Debug,
			WorkerLogLevel::Warn,
			WorkerLogLevel::Error,
			WorkerLogLevel::None,
		] {
			assert_eq!(serde_json::to_value(level).unwrap(), level.as_str());
		}
		assert_eq!(serde_json::to_value(WorkerLogTag::Simulcast).unwrap(), "simulcast");
		assert_eq!(WorkerLogTag::Simulcast.as_str(), "simulcast");
	}

	#[test]
	fn test_default_level_is_error() {
		assert_eq!(WorkerLogLevel::default(), WorkerLogLevel::Error);
	}
}
