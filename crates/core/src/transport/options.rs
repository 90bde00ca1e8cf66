//! Creation options for each transport kind.

use serde_json::{Value, json};

use crate::data_structures::{AppData, ListenInfo, NumSctpStreams};
use crate::webrtc_server::WebRtcServer;

/// Where a WebRTC transport listens.
#[derive(Debug, Clone)]
pub enum WebRtcTransportListen {
	/// Dedicated sockets for this transport.
	Individual { listen_infos: Vec<ListenInfo> },
	/// Shared sockets of a [`WebRtcServer`].
	Server { webrtc_server: WebRtcServer },
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
	pub listen: WebRtcTransportListen,
	pub enable_udp: bool,
	pub enable_tcp: bool,
	pub prefer_udp: bool,
	pub prefer_tcp: bool,
	/// ICE consent timeout in seconds; 0 disables it.
	pub ice_consent_timeout: u8,
	pub initial_available_outgoing_bitrate: u32,
	pub enable_sctp: bool,
	pub num_sctp_streams: NumSctpStreams,
	pub max_sctp_message_size: u32,
	pub sctp_send_buffer_size: u32,
	pub app_data: AppData,
}

impl WebRtcTransportOptions {
	pub fn new(listen_infos: Vec<ListenInfo>) -> Self {
		Self::with_listen(WebRtcTransportListen::Individual { listen_infos })
	}

	pub fn new_with_server(webrtc_server: WebRtcServer) -> Self {
		Self::with_listen(WebRtcTransportListen::Server { webrtc_server })
	}

	fn with_listen(listen: WebRtcTransportListen) -> Self {
		Self {
			listen,
			enable_udp: true,
			enable_tcp: true,
			prefer_udp: false,
			prefer_tcp: false,
			ice_consent_timeout: 30,
			initial_available_outgoing_bitrate: 600_000,
			enable_sctp: false,
			num_sctp_streams: NumSctpStreams::default(),
			max_sctp_message_size: 262_144,
			sctp_send_buffer_size: 262_144,
			app_data: AppData::new(),
		}
	}

	pub(crate) fn request_data(&self, transport_id: &str) -> Value {
		let mut data = json!({
			"transportId": transport_id,
			"enableUdp": self.enable_udp,
			"enableTcp": self.enable_tcp,
			"preferUdp": self.prefer_udp,
			"preferTcp": self.prefer_tcp,
			"iceConsentTimeout": self.ice_consent_timeout,
			"initialAvailableOutgoingBitrate": self.initial_available_outgoing_bitrate,
			"enableSctp": self.enable_sctp,
			"numSctpStreams": self.num_sctp_streams,
			"maxSctpMessageSize": self.max_sctp_message_size,
			"sctpSendBufferSize": self.sctp_send_buffer_size,
			"isDataChannel": true,
		});
		match &self.listen {
			WebRtcTransportListen::Individual { listen_infos } => {
				data["listenInfos"] = json!(listen_infos);
			}
			WebRtcTransportListen::Server { webrtc_server } => {
				data["webRtcServerId"] = json!(webrtc_server.id());
			}
		}
		data
	}
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
	pub listen_info: ListenInfo,
	/// Separate RTCP socket; only used when `rtcp_mux` is false.
	pub rtcp_listen_info: Option<ListenInfo>,
	pub rtcp_mux: bool,
	/// Learn the remote address from the first packet received.
	pub comedia: bool,
	pub enable_sctp: bool,
	pub num_sctp_streams: NumSctpStreams,
	pub max_sctp_message_size: u32,
	pub sctp_send_buffer_size: u32,
	pub enable_srtp: bool,
	pub srtp_crypto_suite: String,
	pub app_data: AppData,
}

impl PlainTransportOptions {
	pub fn new(listen_info: ListenInfo) -> Self {
		Self {
			listen_info,
			rtcp_listen_info: None,
			rtcp_mux: true,
			comedia: false,
			enable_sctp: false,
			num_sctp_streams: NumSctpStreams::default(),
			max_sctp_message_size: 262_144,
			sctp_send_buffer_size: 262_144,
			enable_srtp: false,
			srtp_crypto_suite: "AES_CM_128_HMAC_SHA1_80".to_string(),
			app_data: AppData::new(),
		}
	}

	pub(crate) fn request_data(&self, transport_id: &str) -> Value {
		json!({
			"transportId": transport_id,
			"listenInfo": self.listen_info,
			"rtcpListenInfo": self.rtcp_listen_info,
			"rtcpMux": self.rtcp_mux,
			"comedia": self.comedia,
			"enableSctp": self.enable_sctp,
			"numSctpStreams": self.num_sctp_streams,
			"maxSctpMessageSize": self.max_sctp_message_size,
			"sctpSendBufferSize": self.sctp_send_buffer_size,
			"isDataChannel": false,
			"enableSrtp": self.enable_srtp,
			"srtpCryptoSuite": self.srtp_crypto_suite,
		})
	}
}

#[derive(Debug, Clone)]
pub struct PipeTransportOptions {
	pub listen_info: ListenInfo,
	pub enable_sctp: bool,
	pub num_sctp_streams: NumSctpStreams,
	pub max_sctp_message_size: u32,
	pub sctp_send_buffer_size: u32,
	pub enable_rtx: bool,
	pub enable_srtp: bool,
	pub app_data: AppData,
}

impl PipeTransportOptions {
	pub fn new(listen_info: ListenInfo) -> Self {
		Self {
			listen_info,
			enable_sctp: false,
			num_sctp_streams: NumSctpStreams::default(),
			max_sctp_message_size: 268_435_456,
			sctp_send_buffer_size: 268_435_456,
			enable_rtx: false,
			enable_srtp: false,
			app_data: AppData::new(),
		}
	}

	pub(crate) fn request_data(&self, transport_id: &str) -> Value {
		json!({
			"transportId": transport_id,
			"listenInfo": self.listen_info,
			"enableSctp": self.enable_sctp,
			"numSctpStreams": self.num_sctp_streams,
			"maxSctpMessageSize": self.max_sctp_message_size,
			"sctpSendBufferSize": self.sctp_send_buffer_size,
			"isDataChannel": false,
			"enableRtx": self.enable_rtx,
			"enableSrtp": self.enable_srtp,
		})
	}
}

#[derive(Debug, Clone)]
pub struct DirectTransportOptions {
	pub max_message_size: u32,
	pub app_data: AppData,
}

impl Default for DirectTransportOptions {
	fn default() -> Self {
		Self {
			max_message_size: 262_144,
			app_data: AppData::new(),
		}
	}
}

impl DirectTransportOptions {
	pub(crate) fn request_data(&self, transport_id: &str) -> Value {
		json!({
			"transportId": transport_id,
			"direct": true,
			"maxMessageSize": self.max_message_size,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_webrtc_individual_request_data() {
		let options = WebRtcTransportOptions::new(vec![ListenInfo::udp("127.0.0.1")]);
		let data = options.request_data("t1");
		assert_eq!(data["transportId"], "t1");
		assert_eq!(data["listenInfos"][0]["ip"], "127.0.0.1");
		assert_eq!(data["listenInfos"][0]["protocol"], "udp");
		assert_eq!(data["numSctpStreams"], json!({ "OS": 1024, "MIS": 1024 }));
		assert!(data.get("webRtcServerId").is_none());
	}

	#[test]
	fn test_pipe_defaults() {
		let options = PipeTransportOptions::new(ListenInfo::udp("127.0.0.1"));
		let data = options.request_data("p1");
		assert_eq!(data["enableSctp"], false);
		assert_eq!(data["maxSctpMessageSize"], 268_435_456);
		assert_eq!(data["listenInfo"]["ip"], "127.0.0.1");
	}

	#[test]
	fn test_plain_rtcp_listen_info_null_when_unset() {
		let data = PlainTransportOptions::new(ListenInfo::udp("0.0.0.0")).request_data("x");
		assert!(data["rtcpListenInfo"].is_null());
		assert_eq!(data["rtcpMux"], true);
	}
}
