//! [`Producer`]: a media source injected into a router through a transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sfu_protocol::{Event, Method, Notification};
use sfu_runtime::{Channel, PendingSubscription, Result};

use crate::data_structures::{AppData, MediaKind, ProducerScore, ProducerType, RtpTraceEventType, TraceEventData};
use crate::entity::{EntityCore, notification_data};
use crate::events::{EventHandlers, Subscription};
use crate::router::WeakRouter;
use crate::transport::WeakTransport;

/// Options for [`Transport::produce`](crate::Transport::produce).
#[derive(Debug, Clone)]
pub struct ProducerOptions {
	/// Producer id; generated if unset. Pipe transports reuse the source producer's id.
	pub id: Option<String>,
	pub kind: MediaKind,
	/// RTP parameters describing what the endpoint sends (passed to the worker as-is).
	pub rtp_parameters: Value,
	/// Worker-side mapping of incoming to outgoing RTP streams (passed as-is).
	pub rtp_mapping: Option<Value>,
	pub paused: bool,
	/// Minimum milliseconds between key frame requests forwarded to the endpoint.
	pub key_frame_request_delay: u32,
	pub app_data: AppData,
}

impl ProducerOptions {
	pub fn new(kind: MediaKind, rtp_parameters: Value) -> Self {
		Self {
			id: None,
			kind,
			rtp_parameters,
			rtp_mapping: None,
			paused: false,
			key_frame_request_delay: 0,
			app_data: AppData::new(),
		}
	}
}

/// Video orientation reported by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoOrientation {
	pub camera: bool,
	pub flip: bool,
	pub rotation: u16,
}

/// Public producer events.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
	/// The owning transport closed.
	TransportClose,
	Score(Vec<ProducerScore>),
	VideoOrientationChange(VideoOrientation),
	Trace(TraceEventData),
}

/// Observer producer events.
#[derive(Debug, Clone)]
pub enum ProducerObserverEvent {
	Close,
	Pause,
	Resume,
	Score(Vec<ProducerScore>),
	VideoOrientationChange(VideoOrientation),
	Trace(TraceEventData),
}

pub(crate) struct ProducerArgs {
	pub(crate) id: String,
	pub(crate) kind: MediaKind,
	pub(crate) producer_type: ProducerType,
	pub(crate) rtp_parameters: Value,
	pub(crate) paused: bool,
	pub(crate) app_data: AppData,
	pub(crate) channel: Channel,
	pub(crate) transport: WeakTransport,
	pub(crate) router: WeakRouter,
}

pub(crate) struct ProducerInner {
	core: EntityCore,
	kind: MediaKind,
	producer_type: ProducerType,
	rtp_parameters: Value,
	channel: Channel,
	transport: WeakTransport,
	router: WeakRouter,
	paused: AtomicBool,
	score: Mutex<Vec<ProducerScore>>,
	handlers: EventHandlers<ProducerEvent>,
	observer: EventHandlers<ProducerObserverEvent>,
}

/// A media source in a router.
///
/// Cheap to clone; clones refer to the same producer.
#[derive(Clone)]
pub struct Producer {
	inner: Arc<ProducerInner>,
}

#[derive(Clone)]
pub(crate) struct WeakProducer(Weak<ProducerInner>);

impl WeakProducer {
	pub(crate) fn upgrade(&self) -> Option<Producer> {
		self.0.upgrade().map(|inner| Producer { inner })
	}
}

impl std::fmt::Debug for Producer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Producer")
			.field("id", &self.id())
			.field("kind", &self.inner.kind)
			.field("closed", &self.closed())
			.field("paused", &self.paused())
			.finish()
	}
}

impl Producer {
	/// Creates the producer and starts routing its notifications.
	pub(crate) fn new(args: ProducerArgs) -> Self {
		let ProducerArgs {
			id,
			kind,
			producer_type,
			rtp_parameters,
			paused,
			app_data,
			channel,
			transport,
			router,
		} = args;

		Self {
			inner: Arc::new(ProducerInner {
				core: EntityCore::new("Producer", id, app_data),
				kind,
				producer_type,
				rtp_parameters,
				channel,
				transport,
				router,
				paused: AtomicBool::new(paused),
				score: Mutex::new(Vec::new()),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakProducer {
		WeakProducer(Arc::downgrade(&self.inner))
	}

	/// Starts handling notifications, replaying those that arrived since creation.
	pub(crate) fn listen(&self, notifications: PendingSubscription) {
		let weak = self.downgrade();
		self.inner.core.attach_notifications(notifications, move |notification| {
			if let Some(producer) = weak.upgrade() {
				producer.handle_notification(notification);
			}
		});
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	pub fn kind(&self) -> MediaKind {
		self.inner.kind
	}

	pub fn producer_type(&self) -> ProducerType {
		self.inner.producer_type
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

	/// Latest per-stream scores.
	pub fn score(&self) -> Vec<ProducerScore> {
		self.inner.score.lock().clone()
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	/// Registers a handler for public events.
	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&ProducerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<ProducerObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::ProducerDump, self.id(), None).await
	}

	pub async fn get_stats(&self) -> Result<Value> {
		tracing::debug!("get_stats()");
		self.inner.channel.request(Method::ProducerGetStats, self.id(), None).await
	}

	pub async fn pause(&self) -> Result<()> {
		tracing::debug!("pause()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::ProducerPause, self.id(), None).await?;

		let was_paused = self.inner.paused.swap(true, Ordering::AcqRel);
		if !was_paused {
			self.inner.observer.emit(&ProducerObserverEvent::Pause);
		}
		Ok(())
	}

	pub async fn resume(&self) -> Result<()> {
		tracing::debug!("resume()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::ProducerResume, self.id(), None).await?;

		let was_paused = self.inner.paused.swap(false, Ordering::AcqRel);
		if was_paused {
			self.inner.observer.emit(&ProducerObserverEvent::Resume);
		}
		Ok(())
	}

	pub async fn enable_trace_event(&self, types: Vec<RtpTraceEventType>) -> Result<()> {
		tracing::debug!("enable_trace_event()");
		self.inner
			.channel
			.request(Method::ProducerEnableTraceEvent, self.id(), Some(json!({ "types": types })))
			.await?;
		Ok(())
	}

	/// Closes the producer and every consumer of it in the router.
	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let transport = self.inner.transport.upgrade();
		if let Some(transport) = &transport {
			transport.producer_detached(self.id());
		}
		self.notify_router();

		if let Some(transport) = transport.filter(|transport| !transport.closed()) {
			self.inner.channel.request_detached(
				Method::TransportCloseProducer,
				transport.id(),
				Some(json!({ "producerId": self.id() })),
			);
		}

		self.inner.observer.emit(&ProducerObserverEvent::Close);
	}

	/// Local teardown after the owning transport closed.
	pub(crate) fn transport_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "transport_closed()");

		self.notify_router();

		self.inner.handlers.emit(&ProducerEvent::TransportClose);
		self.inner.observer.emit(&ProducerObserverEvent::Close);
	}

	fn notify_router(&self) {
		if let Some(router) = self.inner.router.upgrade() {
			router.producer_closed(self);
		}
	}

	fn handle_notification(&self, notification: &Notification) {
		match notification.event {
			Event::Score => {
				#[derive(Deserialize)]
				struct ScoreData {
					scores: Vec<ProducerScore>,
				}
				if let Some(ScoreData { scores }) = notification_data(notification) {
					*self.inner.score.lock() = scores.clone();
					self.inner.handlers.emit(&ProducerEvent::Score(scores.clone()));
					self.inner.observer.emit(&ProducerObserverEvent::Score(scores));
				}
			}
			Event::VideoOrientationChange => {
				if let Some(orientation) = notification_data::<VideoOrientation>(notification) {
					self.inner
						.handlers
						.emit(&ProducerEvent::VideoOrientationChange(orientation));
					self.inner
						.observer
						.emit(&ProducerObserverEvent::VideoOrientationChange(orientation));
				}
			}
			Event::Trace => {
				if let Some(trace) = notification_data::<TraceEventData>(notification) {
					self.inner.handlers.emit(&ProducerEvent::Trace(trace.clone()));
					self.inner.observer.emit(&ProducerObserverEvent::Trace(trace));
				}
			}
			other => {
				tracing::error!("ignoring unknown event {:?} [producer_id:{}]", other, self.id());
			}
		}
	}
}
