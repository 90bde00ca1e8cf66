//! [`Consumer`]: media forwarded from a producer to an endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sfu_protocol::{Event, Method, Notification};
use sfu_runtime::{Channel, PendingSubscription, Result};

use crate::data_structures::{
	AppData, ConsumerLayers, ConsumerScore, ConsumerType, MediaKind, RtpTraceEventType, TraceEventData,
};
use crate::entity::{EntityCore, notification_data, response_data};
use crate::events::{EventHandlers, Subscription};
use crate::router::WeakRouter;
use crate::transport::WeakTransport;

/// Options for [`Transport::consume`](crate::Transport::consume).
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
	pub producer_id: String,
	/// RTP capabilities of the consuming endpoint (passed to the worker as-is).
	pub rtp_capabilities: Value,
	/// Start paused; the endpoint resumes once it is ready to receive.
	pub paused: bool,
	pub mid: Option<String>,
	pub preferred_layers: Option<ConsumerLayers>,
	pub ignore_dtx: bool,
	pub enable_rtx: Option<bool>,
	/// Consume all streams of the producer, as a pipe consumer does.
	pub pipe: bool,
	pub app_data: AppData,
}

impl ConsumerOptions {
	pub fn new(producer_id: impl Into<String>, rtp_capabilities: Value) -> Self {
		Self {
			producer_id: producer_id.into(),
			rtp_capabilities,
			paused: false,
			mid: None,
			preferred_layers: None,
			ignore_dtx: false,
			enable_rtx: None,
			pipe: false,
			app_data: AppData::new(),
		}
	}
}

/// Public consumer events.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
	TransportClose,
	ProducerClose,
	ProducerPause,
	ProducerResume,
	Score(ConsumerScore),
	LayersChange(Option<ConsumerLayers>),
	Trace(TraceEventData),
}

/// Observer consumer events.
#[derive(Debug, Clone)]
pub enum ConsumerObserverEvent {
	Close,
	Pause,
	Resume,
	Score(ConsumerScore),
	LayersChange(Option<ConsumerLayers>),
	Trace(TraceEventData),
}

pub(crate) struct ConsumerArgs {
	pub(crate) id: String,
	pub(crate) producer_id: String,
	pub(crate) kind: MediaKind,
	pub(crate) consumer_type: ConsumerType,
	pub(crate) rtp_parameters: Value,
	pub(crate) paused: bool,
	pub(crate) producer_paused: bool,
	pub(crate) score: ConsumerScore,
	pub(crate) preferred_layers: Option<ConsumerLayers>,
	pub(crate) app_data: AppData,
	pub(crate) channel: Channel,
	pub(crate) transport: WeakTransport,
	pub(crate) router: WeakRouter,
}

struct ConsumerState {
	priority: u8,
	score: ConsumerScore,
	preferred_layers: Option<ConsumerLayers>,
	current_layers: Option<ConsumerLayers>,
}

pub(crate) struct ConsumerInner {
	core: EntityCore,
	producer_id: String,
	kind: MediaKind,
	consumer_type: ConsumerType,
	rtp_parameters: Value,
	channel: Channel,
	transport: WeakTransport,
	router: WeakRouter,
	paused: AtomicBool,
	producer_paused: AtomicBool,
	state: Mutex<ConsumerState>,
	handlers: EventHandlers<ConsumerEvent>,
	observer: EventHandlers<ConsumerObserverEvent>,
}

/// Endpoint receiving one producer's media through a transport.
#[derive(Clone)]
pub struct Consumer {
	inner: Arc<ConsumerInner>,
}

#[derive(Clone)]
pub(crate) struct WeakConsumer(Weak<ConsumerInner>);

impl WeakConsumer {
	pub(crate) fn upgrade(&self) -> Option<Consumer> {
		self.0.upgrade().map(|inner| Consumer { inner })
	}
}

impl std::fmt::Debug for Consumer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Consumer")
			.field("id", &self.id())
			.field("producer_id", &self.inner.producer_id)
			.field("closed", &self.closed())
			.field("paused", &self.paused())
			.field("producer_paused", &self.producer_paused())
			.finish()
	}
}

impl Consumer {
	pub(crate) fn new(args: ConsumerArgs) -> Self {
		let ConsumerArgs {
			id,
			producer_id,
			kind,
			consumer_type,
			rtp_parameters,
			paused,
			producer_paused,
			score,
			preferred_layers,
			app_data,
			channel,
			transport,
			router,
		} = args;

		Self {
			inner: Arc::new(ConsumerInner {
				core: EntityCore::new("Consumer", id, app_data),
				producer_id,
				kind,
				consumer_type,
				rtp_parameters,
				channel,
				transport,
				router,
				paused: AtomicBool::new(paused),
				producer_paused: AtomicBool::new(producer_paused),
				state: Mutex::new(ConsumerState {
					priority: 1,
					score,
					preferred_layers,
					current_layers: None,
				}),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakConsumer {
		WeakConsumer(Arc::downgrade(&self.inner))
	}

	/// Starts handling notifications, replaying those that arrived since creation.
	pub(crate) fn listen(&self, notifications: PendingSubscription) {
		let weak = self.downgrade();
		self.inner.core.attach_notifications(notifications, move |notification| {
			if let Some(consumer) = weak.upgrade() {
				consumer.handle_notification(notification);
			}
		});
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	/// Id of the producer this consumer forwards.
	pub fn producer_id(&self) -> &str {
		&self.inner.producer_id
	}

	pub fn kind(&self) -> MediaKind {
		self.inner.kind
	}

	pub fn consumer_type(&self) -> ConsumerType {
		self.inner.consumer_type
	}

	pub fn rtp_parameters(&self) -> &Value {
		&self.inner.rtp_parameters
	}

	pub fn closed(&self) -> bool {
		self.inner.core.closed()
	}

	pub fn paused(&self) -> bool {
		self.inner.paused.load(Ordering::Acquire)
	}

	pub fn producer_paused(&self) -> bool {
		self.inner.producer_paused.load(Ordering::Acquire)
	}

	pub fn priority(&self) -> u8 {
		self.inner.state.lock().priority
	}

	pub fn score(&self) -> ConsumerScore {
		self.inner.state.lock().score.clone()
	}

	pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
		self.inner.state.lock().preferred_layers
	}

	pub fn current_layers(&self) -> Option<ConsumerLayers> {
		self.inner.state.lock().current_layers
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&ConsumerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<ConsumerObserverEvent> {
		&self.inner.observer
	}

	/// Registers a public event handler for the consumer's lifetime.
	pub(crate) fn on_detached<F>(&self, handler: F)
	where
		F: Fn(&ConsumerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on_detached(handler);
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::ConsumerDump, self.id(), None).await
	}

	pub async fn get_stats(&self) -> Result<Value> {
		tracing::debug!("get_stats()");
		self.inner.channel.request(Method::ConsumerGetStats, self.id(), None).await
	}

	pub async fn pause(&self) -> Result<()> {
		tracing::debug!("pause()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::ConsumerPause, self.id(), None).await?;

		let was_paused = self.inner.paused.swap(true, Ordering::AcqRel);
		if !was_paused && !self.producer_paused() {
			self.inner.observer.emit(&ConsumerObserverEvent::Pause);
		}
		Ok(())
	}

	pub async fn resume(&self) -> Result<()> {
		tracing::debug!("resume()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::ConsumerResume, self.id(), None).await?;

		let was_paused = self.inner.paused.swap(false, Ordering::AcqRel);
		if was_paused && !self.producer_paused() {
			self.inner.observer.emit(&ConsumerObserverEvent::Resume);
		}
		Ok(())
	}

	pub async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<()> {
		tracing::debug!("set_preferred_layers()");
		let data = self
			.inner
			.channel
			.request(Method::ConsumerSetPreferredLayers, self.id(), Some(json!(layers)))
			.await?;

		let preferred: Option<ConsumerLayers> = serde_json::from_value(data)?;
		self.inner.state.lock().preferred_layers = preferred;
		Ok(())
	}

	pub async fn set_priority(&self, priority: u8) -> Result<()> {
		tracing::debug!("set_priority()");
		#[derive(Deserialize)]
		struct PriorityData {
			priority: u8,
		}

		let data = self
			.inner
			.channel
			.request(Method::ConsumerSetPriority, self.id(), Some(json!({ "priority": priority })))
			.await?;
		let PriorityData { priority } = response_data(data)?;
		self.inner.state.lock().priority = priority;
		Ok(())
	}

	/// Resets the priority to the default of 1.
	pub async fn unset_priority(&self) -> Result<()> {
		tracing::debug!("unset_priority()");
		self.set_priority(1).await
	}

	pub async fn request_key_frame(&self) -> Result<()> {
		tracing::debug!("request_key_frame()");
		self.inner
			.channel
			.request(Method::ConsumerRequestKeyFrame, self.id(), None)
			.await?;
		Ok(())
	}

	pub async fn enable_trace_event(&self, types: Vec<RtpTraceEventType>) -> Result<()> {
		tracing::debug!("enable_trace_event()");
		self.inner
			.channel
			.request(Method::ConsumerEnableTraceEvent, self.id(), Some(json!({ "types": types })))
			.await?;
		Ok(())
	}

	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let transport = self.inner.transport.upgrade();
		if let Some(transport) = &transport {
			transport.consumer_detached(self.id());
		}
		self.detach_from_router();

		if let Some(transport) = transport.filter(|transport| !transport.closed()) {
			self.inner.channel.request_detached(
				Method::TransportCloseConsumer,
				transport.id(),
				Some(json!({ "consumerId": self.id() })),
			);
		}

		self.inner.observer.emit(&ConsumerObserverEvent::Close);
	}

	pub(crate) fn transport_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "transport_closed()");

		self.detach_from_router();

		self.inner.handlers.emit(&ConsumerEvent::TransportClose);
		self.inner.observer.emit(&ConsumerObserverEvent::Close);
	}

	/// Local teardown after the source producer closed.
	pub(crate) fn producer_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "producer_closed()");

		if let Some(transport) = self.inner.transport.upgrade() {
			transport.consumer_detached(self.id());
		}
		self.detach_from_router();

		self.inner.handlers.emit(&ConsumerEvent::ProducerClose);
		self.inner.observer.emit(&ConsumerObserverEvent::Close);
	}

	fn detach_from_router(&self) {
		if let Some(router) = self.inner.router.upgrade() {
			router.consumer_detached(&self.inner.producer_id, self.id());
		}
	}

	fn handle_notification(&self, notification: &Notification) {
		match notification.event {
			Event::ProducerClose => self.producer_closed(),
			Event::ProducerPause => {
				if self.inner.producer_paused.swap(true, Ordering::AcqRel) {
					return;
				}
				self.inner.handlers.emit(&ConsumerEvent::ProducerPause);
				if !self.paused() {
					self.inner.observer.emit(&ConsumerObserverEvent::Pause);
				}
			}
			Event::ProducerResume => {
				if !self.inner.producer_paused.swap(false, Ordering::AcqRel) {
					return;
				}
				self.inner.handlers.emit(&ConsumerEvent::ProducerResume);
				if !self.paused() {
					self.inner.observer.emit(&ConsumerObserverEvent::Resume);
				}
			}
			Event::Score => {
				if let Some(score) = notification_data::<ConsumerScore>(notification) {
					self.inner.state.lock().score = score.clone();
					self.inner.handlers.emit(&ConsumerEvent::Score(score.clone()));
					self.inner.observer.emit(&ConsumerObserverEvent::Score(score));
				}
			}
			Event::LayersChange => {
				#[derive(Deserialize)]
				struct LayersData {
					#[serde(default)]
					layers: Option<ConsumerLayers>,
				}
				if let Some(LayersData { layers }) = notification_data(notification) {
					self.inner.state.lock().current_layers = layers;
					self.inner.handlers.emit(&ConsumerEvent::LayersChange(layers));
					self.inner.observer.emit(&ConsumerObserverEvent::LayersChange(layers));
				}
			}
			Event::Trace => {
				if let Some(trace) = notification_data::<TraceEventData>(notification) {
					self.inner.handlers.emit(&ConsumerEvent::Trace(trace.clone()));
					self.inner.observer.emit(&ConsumerObserverEvent::Trace(trace));
				}
			}
			other => {
				tracing::error!("ignoring unknown event {:?} [consumer_id:{}]", other, self.id());
			}
		}
	}
}
