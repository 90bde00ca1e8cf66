//! Request methods understood by the worker.
//!
//! Methods are scoped by the kind of handler that receives them. Requests
//! addressed to the worker itself carry an empty handler id; every other
//! request carries the id of the entity that handles it.

use serde::{Deserialize, Serialize};

macro_rules! methods {
	($($(#[$meta:meta])* $variant:ident => $name:literal,)+) => {
		/// Request method sent to the worker.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
		pub enum Method {
			$(
				$(#[$meta])*
				#[serde(rename = $name)]
				$variant,
			)+
		}

		impl Method {
			/// Wire name of the method (e.g. `"worker.createRouter"`).
			pub fn as_str(&self) -> &'static str {
				match self {
					$(Self::$variant => $name,)+
				}
			}
		}
	};
}

methods! {
	WorkerDump => "worker.dump",
	WorkerGetResourceUsage => "worker.getResourceUsage",
	WorkerUpdateSettings => "worker.updateSettings",
	WorkerCreateWebRtcServer => "worker.createWebRtcServer",
	WorkerCloseWebRtcServer => "worker.closeWebRtcServer",
	WorkerCreateRouter => "worker.createRouter",
	WorkerCloseRouter => "worker.closeRouter",

	WebRtcServerDump => "webRtcServer.dump",

	RouterDump => "router.dump",
	RouterCreateWebRtcTransport => "router.createWebRtcTransport",
	RouterCreateWebRtcTransportWithServer => "router.createWebRtcTransportWithServer",
	RouterCreatePlainTransport => "router.createPlainTransport",
	RouterCreatePipeTransport => "router.createPipeTransport",
	RouterCreateDirectTransport => "router.createDirectTransport",
	RouterCloseTransport => "router.closeTransport",
	RouterCreateActiveSpeakerObserver => "router.createActiveSpeakerObserver",
	RouterCreateAudioLevelObserver => "router.createAudioLevelObserver",
	RouterCloseRtpObserver => "router.closeRtpObserver",

	TransportDump => "transport.dump",
	TransportGetStats => "transport.getStats",
	TransportConnect => "transport.connect",
	TransportSetMaxIncomingBitrate => "transport.setMaxIncomingBitrate",
	TransportSetMaxOutgoingBitrate => "transport.setMaxOutgoingBitrate",
	TransportSetMinOutgoingBitrate => "transport.setMinOutgoingBitrate",
	TransportEnableTraceEvent => "transport.enableTraceEvent",
	TransportProduce => "transport.produce",
	TransportConsume => "transport.consume",
	TransportProduceData => "transport.produceData",
	TransportConsumeData => "transport.consumeData",
	TransportCloseProducer => "transport.closeProducer",
	TransportCloseConsumer => "transport.closeConsumer",
	TransportCloseDataProducer => "transport.closeDataProducer",
	TransportCloseDataConsumer => "transport.closeDataConsumer",
	TransportSendRtcp => "transport.sendRtcp",

	ProducerDump => "producer.dump",
	ProducerGetStats => "producer.getStats",
	ProducerPause => "producer.pause",
	ProducerResume => "producer.resume",
	ProducerEnableTraceEvent => "producer.enableTraceEvent",

	ConsumerDump => "consumer.dump",
	ConsumerGetStats => "consumer.getStats",
	ConsumerPause => "consumer.pause",
	ConsumerResume => "consumer.resume",
	ConsumerSetPreferredLayers => "consumer.setPreferredLayers",
	ConsumerSetPriority => "consumer.setPriority",
	ConsumerRequestKeyFrame => "consumer.requestKeyFrame",
	ConsumerEnableTraceEvent => "consumer.enableTraceEvent",

	DataProducerDump => "dataProducer.dump",
	DataProducerGetStats => "dataProducer.getStats",
	DataProducerPause => "dataProducer.pause",
	DataProducerResume => "dataProducer.resume",

	DataConsumerDump => "dataConsumer.dump",
	DataConsumerGetStats => "dataConsumer.getStats",
	DataConsumerPause => "dataConsumer.pause",
	DataConsumerResume => "dataConsumer.resume",
	DataConsumerGetBufferedAmount => "dataConsumer.getBufferedAmount",
	DataConsumerSetBufferedAmountLowThreshold => "dataConsumer.setBufferedAmountLowThreshold",
	DataConsumerSend => "dataConsumer.send",
	DataConsumerSetSubchannels => "dataConsumer.setSubchannels",
	DataConsumerAddSubchannel => "dataConsumer.addSubchannel",
	DataConsumerRemoveSubchannel => "dataConsumer.removeSubchannel",

	RtpObserverPause => "rtpObserver.pause",
	RtpObserverResume => "rtpObserver.resume",
	RtpObserverAddProducer => "rtpObserver.addProducer",
	RtpObserverRemoveProducer => "rtpObserver.removeProducer",
}

impl std::fmt::Display for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_method_wire_name_matches_serde() {
		for method in [
			Method::WorkerCreateRouter,
			Method::RouterCloseTransport,
			Method::TransportConsume,
			Method::DataConsumerSetBufferedAmountLowThreshold,
			Method::TransportSetMinOutgoingBitrate,
			Method::DataConsumerRemoveSubchannel,
		] {
			let json = serde_json::to_value(method).unwrap();
			assert_eq!(json, serde_json::Value::String(method.as_str().to_string()));
		}
	}

	#[test]
	fn test_method_parses_from_wire_name() {
		let method: Method = serde_json::from_str(r#""router.createPipeTransport""#).unwrap();
		assert_eq!(method, Method::RouterCreatePipeTransport);
		assert_eq!(method.to_string(), "router.createPipeTransport");
	}
}
