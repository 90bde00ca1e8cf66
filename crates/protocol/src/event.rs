//! Notification events emitted by the worker.

use serde::{Deserialize, Serialize};

/// Event name carried by a worker notification.
///
/// Unknown names deserialize to [`Event::Unknown`] so newer workers do not
/// break older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
	/// Worker finished starting up (target = worker pid).
	Running,

	/// Transport trace event.
	Trace,
	/// WebRTC transport ICE state changed.
	IceStateChange,
	/// ICE selected tuple changed.
	IceSelectedTupleChange,
	/// WebRTC transport DTLS state changed.
	DtlsStateChange,
	/// SCTP association state changed.
	SctpStateChange,
	/// Plain/pipe transport tuple learned.
	Tuple,
	/// Plain transport RTCP tuple learned.
	RtcpTuple,

	/// Producer/consumer score update.
	Score,
	/// Producer video orientation change.
	VideoOrientationChange,

	/// Source producer of a consumer was closed.
	ProducerClose,
	/// Source producer of a consumer was paused.
	ProducerPause,
	/// Source producer of a consumer was resumed.
	ProducerResume,
	/// Consumer spatial/temporal layers changed.
	LayersChange,

	/// Source data producer of a data consumer was closed.
	DataProducerClose,
	/// Source data producer was paused.
	DataProducerPause,
	/// Source data producer was resumed.
	DataProducerResume,
	/// Buffered amount dropped below the configured threshold.
	BufferedAmountLow,
	/// SCTP send buffer is full.
	SctpSendBufferFull,

	/// Audio level observer volumes.
	Volumes,
	/// Audio level observer silence.
	Silence,
	/// Active speaker observer dominant speaker.
	DominantSpeaker,

	/// Forward-compatible catch-all.
	#[serde(other)]
	Unknown,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_event_names() {
		let event: Event = serde_json::from_str(r#""producerclose""#).unwrap();
		assert_eq!(event, Event::ProducerClose);
		let event: Event = serde_json::from_str(r#""dominantspeaker""#).unwrap();
		assert_eq!(event, Event::DominantSpeaker);
	}

	#[test]
	fn test_unknown_event_is_tolerated() {
		let event: Event = serde_json::from_str(r#""somethingnew""#).unwrap();
		assert_eq!(event, Event::Unknown);
	}
}
