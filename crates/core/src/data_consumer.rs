//! [`DataConsumer`]: data forwarded from a data producer to an endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sfu_protocol::{Event, Method, Notification};
use sfu_runtime::{Channel, PendingSubscription, Result};

use crate::data_structures::{AppData, DataProducerType, SctpStreamParameters};
use crate::entity::{EntityCore, notification_data, response_data};
use crate::events::{EventHandlers, Subscription};
use crate::router::WeakRouter;
use crate::transport::WeakTransport;

/// Options for [`Transport::consume_data`](crate::Transport::consume_data).
#[derive(Debug, Clone)]
pub struct DataConsumerOptions {
	pub data_producer_id: String,
	/// Overrides the data producer's ordering; SCTP transports only.
	pub ordered: Option<bool>,
	pub max_packet_life_time: Option<u16>,
	pub max_retransmits: Option<u16>,
	pub paused: bool,
	/// Subchannels to receive; messages sent with a subchannel reach only
	/// subscribed consumers.
	pub subchannels: Option<Vec<u16>>,
	pub app_data: AppData,
}

impl DataConsumerOptions {
	pub fn new(data_producer_id: impl Into<String>) -> Self {
		Self {
			data_producer_id: data_producer_id.into(),
			ordered: None,
			max_packet_life_time: None,
			max_retransmits: None,
			paused: false,
			subchannels: None,
			app_data: AppData::new(),
		}
	}
}

/// Message sent to a data consumer's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
	Text(String),
	Binary(Vec<u8>),
}

impl DataMessage {
	/// WebRTC string payload protocol id.
	pub const PPID_STRING: u32 = 51;
	/// WebRTC binary payload protocol id.
	pub const PPID_BINARY: u32 = 53;
	/// WebRTC empty string payload protocol id.
	pub const PPID_STRING_EMPTY: u32 = 56;
	/// WebRTC empty binary payload protocol id.
	pub const PPID_BINARY_EMPTY: u32 = 57;

	/// Payload protocol id implied by the message type.
	pub fn ppid(&self) -> u32 {
		match self {
			Self::Text(text) if text.is_empty() => Self::PPID_STRING_EMPTY,
			Self::Text(_) => Self::PPID_STRING,
			Self::Binary(bytes) if bytes.is_empty() => Self::PPID_BINARY_EMPTY,
			Self::Binary(_) => Self::PPID_BINARY,
		}
	}

	/// Wire form; SCTP cannot carry empty messages, so those become one
	/// placeholder byte flagged by the empty ppid.
	fn to_value(&self) -> Value {
		match self {
			Self::Text(text) if text.is_empty() => json!(" "),
			Self::Text(text) => json!(text),
			Self::Binary(bytes) if bytes.is_empty() => json!([0u8]),
			Self::Binary(bytes) => json!(bytes),
		}
	}
}

impl From<&str> for DataMessage {
	fn from(text: &str) -> Self {
		Self::Text(text.to_string())
	}
}

impl From<String> for DataMessage {
	fn from(text: String) -> Self {
		Self::Text(text)
	}
}

impl From<&[u8]> for DataMessage {
	fn from(bytes: &[u8]) -> Self {
		Self::Binary(bytes.to_vec())
	}
}

impl From<Vec<u8>> for DataMessage {
	fn from(bytes: Vec<u8>) -> Self {
		Self::Binary(bytes)
	}
}

#[derive(Debug, Clone)]
pub enum DataConsumerEvent {
	TransportClose,
	DataProducerClose,
	DataProducerPause,
	DataProducerResume,
	BufferedAmountLow { buffered_amount: u32 },
	SctpSendBufferFull,
}

#[derive(Debug, Clone)]
pub enum DataConsumerObserverEvent {
	Close,
	Pause,
	Resume,
}

pub(crate) struct DataConsumerArgs {
	pub(crate) id: String,
	pub(crate) data_producer_id: String,
	pub(crate) data_consumer_type: DataProducerType,
	pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
	pub(crate) label: String,
	pub(crate) protocol: String,
	pub(crate) paused: bool,
	pub(crate) data_producer_paused: bool,
	pub(crate) subchannels: Vec<u16>,
	pub(crate) app_data: AppData,
	pub(crate) channel: Channel,
	pub(crate) transport: WeakTransport,
	pub(crate) router: WeakRouter,
}

pub(crate) struct DataConsumerInner {
	core: EntityCore,
	data_producer_id: String,
	data_consumer_type: DataProducerType,
	sctp_stream_parameters: Option<SctpStreamParameters>,
	label: String,
	protocol: String,
	channel: Channel,
	transport: WeakTransport,
	router: WeakRouter,
	paused: AtomicBool,
	data_producer_paused: AtomicBool,
	subchannels: Mutex<Vec<u16>>,
	handlers: EventHandlers<DataConsumerEvent>,
	observer: EventHandlers<DataConsumerObserverEvent>,
}

/// Endpoint receiving one data producer's messages through a transport.
#[derive(Clone)]
pub struct DataConsumer {
	inner: Arc<DataConsumerInner>,
}

#[derive(Clone)]
pub(crate) struct WeakDataConsumer(Weak<DataConsumerInner>);

impl WeakDataConsumer {
	pub(crate) fn upgrade(&self) -> Option<DataConsumer> {
		self.0.upgrade().map(|inner| DataConsumer { inner })
	}
}

impl std::fmt::Debug for DataConsumer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DataConsumer")
			.field("id", &self.id())
			.field("data_producer_id", &self.inner.data_producer_id)
			.field("closed", &self.closed())
			.finish()
	}
}

impl DataConsumer {
	pub(crate) fn new(args: DataConsumerArgs) -> Self {
		Self {
			inner: Arc::new(DataConsumerInner {
				core: EntityCore::new("DataConsumer", args.id, args.app_data),
				data_producer_id: args.data_producer_id,
				data_consumer_type: args.data_consumer_type,
				sctp_stream_parameters: args.sctp_stream_parameters,
				label: args.label,
				protocol: args.protocol,
				channel: args.channel,
				transport: args.transport,
				router: args.router,
				paused: AtomicBool::new(args.paused),
				data_producer_paused: AtomicBool::new(args.data_producer_paused),
				subchannels: Mutex::new(args.subchannels),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakDataConsumer {
		WeakDataConsumer(Arc::downgrade(&self.inner))
	}

	/// Starts handling notifications, replaying those that arrived since creation.
	pub(crate) fn listen(&self, notifications: PendingSubscription) {
		let weak = self.downgrade();
		self.inner.core.attach_notifications(notifications, move |notification| {
			if let Some(data_consumer) = weak.upgrade() {
				data_consumer.handle_notification(notification);
			}
		});
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	pub fn data_producer_id(&self) -> &str {
		&self.inner.data_producer_id
	}

	pub fn data_consumer_type(&self) -> DataProducerType {
		self.inner.data_consumer_type
	}

	pub fn sctp_stream_parameters(&self) -> Option<&SctpStreamParameters> {
		self.inner.sctp_stream_parameters.as_ref()
	}

	pub fn label(&self) -> &str {
		&self.inner.label
	}

	pub fn protocol(&self) -> &str {
		&self.inner.protocol
	}

	pub fn closed(&self) -> bool {
		self.inner.core.closed()
	}

	pub fn paused(&self) -> bool {
		self.inner.paused.load(Ordering::Acquire)
	}

	pub fn data_producer_paused(&self) -> bool {
		self.inner.data_producer_paused.load(Ordering::Acquire)
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&DataConsumerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<DataConsumerObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::DataConsumerDump, self.id(), None).await
	}

	pub async fn get_stats(&self) -> Result<Value> {
		tracing::debug!("get_stats()");
		self.inner
			.channel
			.request(Method::DataConsumerGetStats, self.id(), None)
			.await
	}

	pub async fn pause(&self) -> Result<()> {
		tracing::debug!("pause()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::DataConsumerPause, self.id(), None).await?;

		let was_paused = self.inner.paused.swap(true, Ordering::AcqRel);
		if !was_paused && !self.data_producer_paused() {
			self.inner.observer.emit(&DataConsumerObserverEvent::Pause);
		}
		Ok(())
	}

	pub async fn resume(&self) -> Result<()> {
		tracing::debug!("resume()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::DataConsumerResume, self.id(), None).await?;

		let was_paused = self.inner.paused.swap(false, Ordering::AcqRel);
		if was_paused && !self.data_producer_paused() {
			self.inner.observer.emit(&DataConsumerObserverEvent::Resume);
		}
		Ok(())
	}

	/// Bytes queued in the SCTP send buffer.
	pub async fn get_buffered_amount(&self) -> Result<u32> {
		tracing::debug!("get_buffered_amount()");
		#[derive(Deserialize)]
		#[serde(rename_all = "camelCase")]
		struct BufferedAmountData {
			buffered_amount: u32,
		}

		let data = self
			.inner
			.channel
			.request(Method::DataConsumerGetBufferedAmount, self.id(), None)
			.await?;
		let BufferedAmountData { buffered_amount } = response_data(data)?;
		Ok(buffered_amount)
	}

	pub async fn set_buffered_amount_low_threshold(&self, threshold: u32) -> Result<()> {
		tracing::debug!("set_buffered_amount_low_threshold() [threshold:{}]", threshold);
		self.inner
			.channel
			.request(
				Method::DataConsumerSetBufferedAmountLowThreshold,
				self.id(),
				Some(json!({ "threshold": threshold })),
			)
			.await?;
		Ok(())
	}

	/// Sends `message` to the endpoint; `ppid` defaults to the one implied by
	/// the message type.
	pub async fn send(&self, message: impl Into<DataMessage>, ppid: Option<u32>) -> Result<()> {
		let message = message.into();
		let ppid = ppid.unwrap_or_else(|| message.ppid());
		tracing::debug!("send() [ppid:{}]", ppid);
		self.inner.core.ensure_open()?;

		self.inner
			.channel
			.request(
				Method::DataConsumerSend,
				self.id(),
				Some(json!({ "ppid": ppid, "message": message.to_value() })),
			)
			.await?;
		Ok(())
	}

	/// Subchannels this data consumer currently receives, sorted.
	pub fn subchannels(&self) -> Vec<u16> {
		self.inner.subchannels.lock().clone()
	}

	/// Replaces the subscribed subchannels.
	pub async fn set_subchannels(&self, subchannels: Vec<u16>) -> Result<()> {
		tracing::debug!("set_subchannels()");
		self.subchannels_request(
			Method::DataConsumerSetSubchannels,
			json!({ "subchannels": subchannels }),
		)
		.await
	}

	pub async fn add_subchannel(&self, subchannel: u16) -> Result<()> {
		tracing::debug!("add_subchannel() [subchannel:{}]", subchannel);
		self.subchannels_request(
			Method::DataConsumerAddSubchannel,
			json!({ "subchannel": subchannel }),
		)
		.await
	}

	pub async fn remove_subchannel(&self, subchannel: u16) -> Result<()> {
		tracing::debug!("remove_subchannel() [subchannel:{}]", subchannel);
		self.subchannels_request(
			Method::DataConsumerRemoveSubchannel,
			json!({ "subchannel": subchannel }),
		)
		.await
	}

	/// The worker answers every subchannel change with the resulting set.
	async fn subchannels_request(&self, method: Method, data: Value) -> Result<()> {
		self.inner.core.ensure_open()?;
		let data = self.inner.channel.request(method, self.id(), Some(data)).await?;

		#[derive(Default, Deserialize)]
		#[serde(default)]
		struct SubchannelsData {
			subchannels: Vec<u16>,
		}
		let SubchannelsData { mut subchannels } = response_data(data)?;
		subchannels.sort_unstable();
		subchannels.dedup();
		*self.inner.subchannels.lock() = subchannels;
		Ok(())
	}

	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let transport = self.inner.transport.upgrade();
		if let Some(transport) = &transport {
			transport.data_consumer_detached(self);
		}
		self.detach_from_router();

		if let Some(transport) = transport.filter(|transport| !transport.closed()) {
			self.inner.channel.request_detached(
				Method::TransportCloseDataConsumer,
				transport.id(),
				Some(json!({ "dataConsumerId": self.id() })),
			);
		}

		self.inner.observer.emit(&DataConsumerObserverEvent::Close);
	}

	pub(crate) fn transport_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "transport_closed()");

		self.detach_from_router();

		self.inner.handlers.emit(&DataConsumerEvent::TransportClose);
		self.inner.observer.emit(&DataConsumerObserverEvent::Close);
	}

	/// Local teardown after the source data producer closed.
	pub(crate) fn data_producer_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "data_producer_closed()");

		if let Some(transport) = self.inner.transport.upgrade() {
			transport.data_consumer_detached(self);
		}
		self.detach_from_router();

		self.inner.handlers.emit(&DataConsumerEvent::DataProducerClose);
		self.inner.observer.emit(&DataConsumerObserverEvent::Close);
	}

	fn detach_from_router(&self) {
		if let Some(router) = self.inner.router.upgrade() {
			router.data_consumer_detached(&self.inner.data_producer_id, self.id());
		}
	}

	fn handle_notification(&self, notification: &Notification) {
		match notification.event {
			Event::DataProducerClose => self.data_producer_closed(),
			Event::DataProducerPause => {
				if self.inner.data_producer_paused.swap(true, Ordering::AcqRel) {
					return;
				}
				self.inner.handlers.emit(&DataConsumerEvent::DataProducerPause);
				if !self.paused() {
					self.inner.observer.emit(&DataConsumerObserverEvent::Pause);
				}
			}
			Event::DataProducerResume => {
				if !self.inner.data_producer_paused.swap(false, Ordering::AcqRel) {
					return;
				}
				self.inner.handlers.emit(&DataConsumerEvent::DataProducerResume);
				if !self.paused() {
					self.inner.observer.emit(&DataConsumerObserverEvent::Resume);
				}
			}
			Event::BufferedAmountLow => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct BufferedAmountLowData {
					buffered_amount: u32,
				}
				if let Some(BufferedAmountLowData { buffered_amount }) = notification_data(notification) {
					self.inner
						.handlers
						.emit(&DataConsumerEvent::BufferedAmountLow { buffered_amount });
				}
			}
			Event::SctpSendBufferFull => {
				self.inner.handlers.emit(&DataConsumerEvent::SctpSendBufferFull);
			}
			other => {
				tracing::error!("ignoring unknown event {:?} [data_consumer_id:{}]", other, self.id());
			}
		}
	}
}
