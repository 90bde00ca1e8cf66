//! Value types shared across entities.
//!
//! RTP parameters and capabilities are passed through to the worker as opaque
//! JSON; only the fields this crate acts on are typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque application data attached to an entity.
pub type AppData = serde_json::Map<String, Value>;

/// Kind of media carried by a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
	Audio,
	Video,
}

/// Network protocol of a listen address or tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	#[default]
	Udp,
	Tcp,
}

/// Address a transport or WebRTC server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenInfo {
	pub protocol: Protocol,
	pub ip: String,
	/// Address advertised to remote peers instead of `ip`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub announced_address: Option<String>,
	/// Fixed port; the worker picks one from its range if unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub send_buffer_size: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub recv_buffer_size: Option<u32>,
}

impl ListenInfo {
	/// UDP on `ip` with a worker-assigned port.
	pub fn udp(ip: impl Into<String>) -> Self {
		Self {
			protocol: Protocol::Udp,
			ip: ip.into(),
			announced_address: None,
			port: None,
			send_buffer_size: None,
			recv_buffer_size: None,
		}
	}

	/// TCP on `ip` with a worker-assigned port.
	pub fn tcp(ip: impl Into<String>) -> Self {
		Self {
			protocol: Protocol::Tcp,
			..Self::udp(ip)
		}
	}
}

/// Local/remote address pair of a plain or pipe transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportTuple {
	#[serde(alias = "localAddress")]
	pub local_ip: String,
	pub local_port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_ip: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_port: Option<u16>,
	pub protocol: Protocol,
}

/// ICE state of a WebRTC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
	New,
	Connected,
	Completed,
	Disconnected,
	Closed,
}

/// DTLS state of a WebRTC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
	New,
	Connecting,
	Connected,
	Failed,
	Closed,
}

/// SCTP association state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SctpState {
	New,
	Connecting,
	Connected,
	Failed,
	Closed,
}

/// How a producer encodes its streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
	#[default]
	Simple,
	Simulcast,
	Svc,
	Pipe,
}

/// How a consumer selects streams from its producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
	#[default]
	Simple,
	Simulcast,
	Svc,
	Pipe,
}

impl From<ProducerType> for ConsumerType {
	fn from(producer_type: ProducerType) -> Self {
		match producer_type {
			ProducerType::Simple => Self::Simple,
			ProducerType::Simulcast => Self::Simulcast,
			ProducerType::Svc => Self::Svc,
			ProducerType::Pipe => Self::Pipe,
		}
	}
}

/// Delivery mode of a data producer or consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProducerType {
	#[default]
	Sctp,
	Direct,
}

/// Spatial/temporal layer selection of a simulcast or SVC consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
	pub spatial_layer: u8,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temporal_layer: Option<u8>,
}

/// Score of one producer stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProducerScore {
	pub encoding_idx: u32,
	pub ssrc: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rid: Option<String>,
	pub score: u8,
}

/// Score of a consumer and of its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumerScore {
	pub score: u8,
	pub producer_score: u8,
	pub producer_scores: Vec<u8>,
}

impl Default for ConsumerScore {
	fn default() -> Self {
		Self {
			score: 10,
			producer_score: 10,
			producer_scores: Vec::new(),
		}
	}
}

/// SCTP stream parameters of a data producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpStreamParameters {
	pub stream_id: u16,
	#[serde(default = "default_true")]
	pub ordered: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_packet_life_time: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_retransmits: Option<u16>,
}

impl SctpStreamParameters {
	/// Ordered, reliable delivery on `stream_id`.
	pub fn ordered(stream_id: u16) -> Self {
		Self {
			stream_id,
			ordered: true,
			max_packet_life_time: None,
			max_retransmits: None,
		}
	}
}

/// Number of outgoing and maximum incoming SCTP streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct NumSctpStreams {
	pub os: u16,
	pub mis: u16,
}

impl Default for NumSctpStreams {
	fn default() -> Self {
		Self { os: 1024, mis: 1024 }
	}
}

/// Trace event types a transport can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportTraceEventType {
	Probation,
	Bwe,
}

/// Trace event types a producer or consumer can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpTraceEventType {
	Rtp,
	Keyframe,
	Nack,
	Pli,
	Fir,
	Sr,
}

/// Trace event data as reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEventData {
	#[serde(rename = "type")]
	pub event_type: String,
	#[serde(default)]
	pub timestamp: u64,
	#[serde(default)]
	pub direction: String,
	#[serde(default)]
	pub info: Value,
}

fn default_true() -> bool {
	true
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_listen_info_serialization() {
		let info = ListenInfo {
			announced_address: Some("1.2.3.4".to_string()),
			..ListenInfo::udp("0.0.0.0")
		};
		assert_eq!(
			serde_json::to_value(&info).unwrap(),
			json!({"protocol": "udp", "ip": "0.0.0.0", "announcedAddress": "1.2.3.4"})
		);
	}

	#[test]
	fn test_tuple_accepts_local_address_alias() {
		let tuple: TransportTuple =
			serde_json::from_value(json!({"localAddress": "127.0.0.1", "localPort": 40000}))
				.unwrap();
		assert_eq!(tuple.local_ip, "127.0.0.1");
		assert_eq!(tuple.local_port, 40000);
		assert_eq!(tuple.protocol, Protocol::Udp);
	}

	#[test]
	fn test_num_sctp_streams_wire_names() {
		assert_eq!(
			serde_json::to_value(NumSctpStreams::default()).unwrap(),
			json!({"OS": 1024, "MIS": 1024})
		);
	}

	#[test]
	fn test_sctp_stream_parameters_default_ordered() {
		let params: SctpStreamParameters = serde_json::from_value(json!({"streamId": 3})).unwrap();
		assert_eq!(params, SctpStreamParameters::ordered(3));
	}

	#[test]
	fn test_consumer_type_from_producer_type() {
		assert_eq!(ConsumerType::from(ProducerType::Simulcast), ConsumerType::Simulcast);
		assert_eq!(ConsumerType::from(ProducerType::Simple), ConsumerType::Simple);
	}
}
