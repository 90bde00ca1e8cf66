//! [`Transport`]: a worker-side network endpoint carrying producers and consumers.
//!
//! All four variants (WebRTC, plain, pipe, direct) share one handle type; the
//! variant only changes the creation request, which state fields are present,
//! and how produced/consumed entities are typed.

mod media;
mod options;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sfu_protocol::{Event, Method, Notification};
use sfu_runtime::{Channel, Error, PendingSubscription, Result};

pub use options::{
	DirectTransportOptions, PipeTransportOptions, PlainTransportOptions, WebRtcTransportListen,
	WebRtcTransportOptions,
};

use crate::consumer::Consumer;
use crate::data_consumer::DataConsumer;
use crate::data_producer::DataProducer;
use crate::data_structures::{
	AppData, DtlsState, IceState, SctpState, TransportTraceEventType, TraceEventData, TransportTuple,
};
use crate::entity::{EntityCore, notification_data, response_data};
use crate::events::{EventHandlers, Subscription};
use crate::producer::Producer;
use crate::router::WeakRouter;
use crate::webrtc_server::WeakWebRtcServer;

/// Transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
	WebRtc,
	Plain,
	Pipe,
	Direct,
}

impl TransportKind {
	pub(crate) fn as_str(&self) -> &'static str {
		match self {
			Self::WebRtc => "WebRtcTransport",
			Self::Plain => "PlainTransport",
			Self::Pipe => "PipeTransport",
			Self::Direct => "DirectTransport",
		}
	}
}

/// Network state reported by the worker at creation and through notifications.
///
/// Fields that do not apply to the transport's kind stay `None`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportState {
	pub ice_role: Option<String>,
	pub ice_parameters: Option<Value>,
	pub ice_candidates: Vec<Value>,
	pub ice_state: Option<IceState>,
	pub ice_selected_tuple: Option<TransportTuple>,
	pub dtls_parameters: Option<Value>,
	pub dtls_state: Option<DtlsState>,
	pub tuple: Option<TransportTuple>,
	pub rtcp_tuple: Option<TransportTuple>,
	pub sctp_parameters: Option<Value>,
	pub sctp_state: Option<SctpState>,
	pub srtp_parameters: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
	RouterClose,
	/// The WebRTC server this transport listened through closed.
	ListenServerClose,
	Trace(TraceEventData),
	IceStateChange(IceState),
	IceSelectedTupleChange(TransportTuple),
	DtlsStateChange(DtlsState),
	SctpStateChange(SctpState),
	Tuple(TransportTuple),
	RtcpTuple(TransportTuple),
}

#[derive(Debug, Clone)]
pub enum TransportObserverEvent {
	Close,
	NewProducer(Producer),
	NewConsumer(Consumer),
	NewDataProducer(DataProducer),
	NewDataConsumer(DataConsumer),
	Trace(TraceEventData),
}

#[derive(Default)]
struct TransportChildren {
	producers: HashMap<String, Producer>,
	consumers: HashMap<String, Consumer>,
	data_producers: HashMap<String, DataProducer>,
	data_consumers: HashMap<String, DataConsumer>,
	/// SCTP stream ids held by open data consumers.
	sctp_stream_ids: BTreeSet<u16>,
}

pub(crate) struct TransportArgs {
	pub(crate) id: String,
	pub(crate) kind: TransportKind,
	pub(crate) state: TransportState,
	/// Outgoing SCTP stream count; `None` when SCTP is disabled.
	pub(crate) sctp_streams: Option<u16>,
	pub(crate) app_data: AppData,
	pub(crate) channel: Channel,
	pub(crate) router: WeakRouter,
	pub(crate) webrtc_server: Option<WeakWebRtcServer>,
}

pub(crate) struct TransportInner {
	core: EntityCore,
	kind: TransportKind,
	sctp_streams: Option<u16>,
	channel: Channel,
	router: WeakRouter,
	webrtc_server: Mutex<Option<WeakWebRtcServer>>,
	state: Mutex<TransportState>,
	children: Mutex<TransportChildren>,
	handlers: EventHandlers<TransportEvent>,
	observer: EventHandlers<TransportObserverEvent>,
}

/// Network endpoint owned by a router.
#[derive(Clone)]
pub struct Transport {
	inner: Arc<TransportInner>,
}

#[derive(Clone)]
pub(crate) struct WeakTransport(Weak<TransportInner>);

impl WeakTransport {
	pub(crate) fn upgrade(&self) -> Option<Transport> {
		self.0.upgrade().map(|inner| Transport { inner })
	}
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct(self.inner.kind.as_str())
			.field("id", &self.id())
			.field("closed", &self.closed())
			.finish()
	}
}

impl PartialEq for Transport {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Transport {
	pub(crate) fn new(args: TransportArgs) -> Self {
		Self {
			inner: Arc::new(TransportInner {
				core: EntityCore::new(args.kind.as_str(), args.id, args.app_data),
				kind: args.kind,
				sctp_streams: args.sctp_streams,
				channel: args.channel,
				router: args.router,
				webrtc_server: Mutex::new(args.webrtc_server),
				state: Mutex::new(args.state),
				children: Mutex::new(TransportChildren::default()),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakTransport {
		WeakTransport(Arc::downgrade(&self.inner))
	}

	/// Starts handling notifications, replaying those that arrived since creation.
	pub(crate) fn listen(&self, notifications: PendingSubscription) {
		let weak = self.downgrade();
		self.inner.core.attach_notifications(notifications, move |notification| {
			if let Some(transport) = weak.upgrade() {
				transport.handle_notification(notification);
			}
		});
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	pub fn kind(&self) -> TransportKind {
		self.inner.kind
	}

	pub fn closed(&self) -> bool {
		self.inner.core.closed()
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	/// Snapshot of the network state.
	pub fn state(&self) -> TransportState {
		self.inner.state.lock().clone()
	}

	/// Local (and, once known, remote) address of a plain or pipe transport.
	pub fn tuple(&self) -> Option<TransportTuple> {
		self.inner.state.lock().tuple.clone()
	}

	pub fn ice_state(&self) -> Option<IceState> {
		self.inner.state.lock().ice_state
	}

	pub fn dtls_state(&self) -> Option<DtlsState> {
		self.inner.state.lock().dtls_state
	}

	pub fn sctp_state(&self) -> Option<SctpState> {
		self.inner.state.lock().sctp_state
	}

	pub fn producers(&self) -> Vec<Producer> {
		self.inner.children.lock().producers.values().cloned().collect()
	}

	pub fn consumers(&self) -> Vec<Consumer> {
		self.inner.children.lock().consumers.values().cloned().collect()
	}

	pub fn data_producers(&self) -> Vec<DataProducer> {
		self.inner.children.lock().data_producers.values().cloned().collect()
	}

	pub fn data_consumers(&self) -> Vec<DataConsumer> {
		self.inner.children.lock().data_consumers.values().cloned().collect()
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&TransportEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<TransportObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::TransportDump, self.id(), None).await
	}

	pub async fn get_stats(&self) -> Result<Value> {
		tracing::debug!("get_stats()");
		self.inner.channel.request(Method::TransportGetStats, self.id(), None).await
	}

	/// Provides the remote parameters of the transport.
	///
	/// `params` is kind-specific (DTLS parameters for WebRTC, `ip`/`port` and
	/// optional SRTP parameters for plain and pipe). Whatever the worker reports
	/// back (tuples, SRTP parameters) is merged into [`Transport::state`].
	pub async fn connect(&self, params: Value) -> Result<()> {
		tracing::debug!("connect()");
		self.inner.core.ensure_open()?;
		let data = self
			.inner
			.channel
			.request(Method::TransportConnect, self.id(), Some(params))
			.await?;

		#[derive(Default, Deserialize)]
		#[serde(default, rename_all = "camelCase")]
		struct ConnectData {
			tuple: Option<TransportTuple>,
			rtcp_tuple: Option<TransportTuple>,
			srtp_parameters: Option<Value>,
		}
		let ConnectData {
			tuple,
			rtcp_tuple,
			srtp_parameters,
		} = response_data(data)?;

		let mut state = self.inner.state.lock();
		if tuple.is_some() {
			state.tuple = tuple;
		}
		if rtcp_tuple.is_some() {
			state.rtcp_tuple = rtcp_tuple;
		}
		if srtp_parameters.is_some() {
			state.srtp_parameters = srtp_parameters;
		}
		Ok(())
	}

	pub async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<()> {
		tracing::debug!("set_max_incoming_bitrate() [bitrate:{}]", bitrate);
		self.inner
			.channel
			.request(
				Method::TransportSetMaxIncomingBitrate,
				self.id(),
				Some(json!({ "bitrate": bitrate })),
			)
			.await?;
		Ok(())
	}

	pub async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
		tracing::debug!("set_max_outgoing_bitrate() [bitrate:{}]", bitrate);
		self.inner
			.channel
			.request(
				Method::TransportSetMaxOutgoingBitrate,
				self.id(),
				Some(json!({ "bitrate": bitrate })),
			)
			.await?;
		Ok(())
	}

	pub async fn set_min_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
		tracing::debug!("set_min_outgoing_bitrate() [bitrate:{}]", bitrate);
		self.inner
			.channel
			.request(
				Method::TransportSetMinOutgoingBitrate,
				self.id(),
				Some(json!({ "bitrate": bitrate })),
			)
			.await?;
		Ok(())
	}

	/// Sends an RTCP packet through a direct transport without awaiting the worker.
	pub fn send_rtcp(&self, packet: &[u8]) -> Result<()> {
		self.inner.core.ensure_open()?;
		if self.inner.kind != TransportKind::Direct {
			return Err(Error::InvalidState(format!(
				"send_rtcp() is not supported on a {}",
				self.inner.kind.as_str()
			)));
		}
		if packet.is_empty() {
			return Err(Error::InvalidArgument("empty RTCP packet".to_string()));
		}

		self.inner
			.channel
			.request_detached(Method::TransportSendRtcp, self.id(), Some(json!({ "packet": packet })));
		Ok(())
	}

	pub async fn enable_trace_event(&self, types: Vec<TransportTraceEventType>) -> Result<()> {
		tracing::debug!("enable_trace_event()");
		self.inner
			.channel
			.request(Method::TransportEnableTraceEvent, self.id(), Some(json!({ "types": types })))
			.await?;
		Ok(())
	}

	/// Closes the transport and, without further requests, everything it carries.
	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let router = self.inner.router.upgrade();
		if let Some(router) = &router {
			router.transport_detached(self.id());
		}

		self.teardown();

		if let Some(router) = router.filter(|router| !router.closed()) {
			self.inner.channel.request_detached(
				Method::RouterCloseTransport,
				router.id(),
				Some(json!({ "transportId": self.id() })),
			);
		}

		self.inner.observer.emit(&TransportObserverEvent::Close);
	}

	/// Local teardown after the owning router closed.
	pub(crate) fn router_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "router_closed()");

		self.teardown();

		self.inner.handlers.emit(&TransportEvent::RouterClose);
		self.inner.observer.emit(&TransportObserverEvent::Close);
	}

	/// Local teardown after the WebRTC server this transport used closed.
	pub(crate) fn listen_server_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "listen_server_closed()");

		if let Some(router) = self.inner.router.upgrade() {
			router.transport_detached(self.id());
		}

		self.teardown();

		self.inner.handlers.emit(&TransportEvent::ListenServerClose);
		self.inner.observer.emit(&TransportObserverEvent::Close);
	}

	fn teardown(&self) {
		let server = self.inner.webrtc_server.lock().take();
		if let Some(server) = server.and_then(|server| server.upgrade()) {
			server.transport_unhandled(self.id());
		}

		let children = std::mem::take(&mut *self.inner.children.lock());
		for consumer in children.consumers.into_values() {
			consumer.transport_closed();
		}
		for data_consumer in children.data_consumers.into_values() {
			data_consumer.transport_closed();
		}
		for producer in children.producers.into_values() {
			producer.transport_closed();
		}
		for data_producer in children.data_producers.into_values() {
			data_producer.transport_closed();
		}
	}

	pub(crate) fn producer_detached(&self, producer_id: &str) {
		self.inner.children.lock().producers.remove(producer_id);
	}

	pub(crate) fn consumer_detached(&self, consumer_id: &str) {
		self.inner.children.lock().consumers.remove(consumer_id);
	}

	pub(crate) fn data_producer_detached(&self, data_producer_id: &str) {
		self.inner.children.lock().data_producers.remove(data_producer_id);
	}

	pub(crate) fn data_consumer_detached(&self, data_consumer: &DataConsumer) {
		let mut children = self.inner.children.lock();
		children.data_consumers.remove(data_consumer.id());
		if let Some(params) = data_consumer.sctp_stream_parameters() {
			children.sctp_stream_ids.remove(&params.stream_id);
		}
	}

	fn handle_notification(&self, notification: &Notification) {
		match notification.event {
			Event::IceStateChange => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct Data {
					ice_state: IceState,
				}
				if let Some(Data { ice_state }) = notification_data(notification) {
					self.inner.state.lock().ice_state = Some(ice_state);
					self.inner.handlers.emit(&TransportEvent::IceStateChange(ice_state));
				}
			}
			Event::IceSelectedTupleChange => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct Data {
					ice_selected_tuple: TransportTuple,
				}
				if let Some(Data { ice_selected_tuple }) = notification_data(notification) {
					self.inner.state.lock().ice_selected_tuple = Some(ice_selected_tuple.clone());
					self.inner
						.handlers
						.emit(&TransportEvent::IceSelectedTupleChange(ice_selected_tuple));
				}
			}
			Event::DtlsStateChange => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct Data {
					dtls_state: DtlsState,
				}
				if let Some(Data { dtls_state }) = notification_data(notification) {
					self.inner.state.lock().dtls_state = Some(dtls_state);
					self.inner.handlers.emit(&TransportEvent::DtlsStateChange(dtls_state));
				}
			}
			Event::SctpStateChange => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct Data {
					sctp_state: SctpState,
				}
				if let Some(Data { sctp_state }) = notification_data(notification) {
					self.inner.state.lock().sctp_state = Some(sctp_state);
					self.inner.handlers.emit(&TransportEvent::SctpStateChange(sctp_state));
				}
			}
			Event::Tuple => {
				#[derive(Deserialize)]
				struct Data {
					tuple: TransportTuple,
				}
				if let Some(Data { tuple }) = notification_data(notification) {
					self.inner.state.lock().tuple = Some(tuple.clone());
					self.inner.handlers.emit(&TransportEvent::Tuple(tuple));
				}
			}
			Event::RtcpTuple => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct Data {
					rtcp_tuple: TransportTuple,
				}
				if let Some(Data { rtcp_tuple }) = notification_data(notification) {
					self.inner.state.lock().rtcp_tuple = Some(rtcp_tuple.clone());
					self.inner.handlers.emit(&TransportEvent::RtcpTuple(rtcp_tuple));
				}
			}
			Event::Trace => {
				if let Some(trace) = notification_data::<TraceEventData>(notification) {
					self.inner.handlers.emit(&TransportEvent::Trace(trace.clone()));
					self.inner.observer.emit(&TransportObserverEvent::Trace(trace));
				}
			}
			other => {
				tracing::error!("ignoring unknown event {:?} [transport_id:{}]", other, self.id());
			}
		}
	}
}
