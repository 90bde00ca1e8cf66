//! [`RtpObserver`]: audio level and active speaker analysis over a set of producers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::Deserialize;
use serde_json::json;
use sfu_protocol::{Event, Method, Notification};
use sfu_runtime::{Channel, Error, PendingSubscription, Result};

use crate::data_structures::AppData;
use crate::entity::{EntityCore, notification_data};
use crate::events::{EventHandlers, Subscription};
use crate::producer::Producer;
use crate::router::WeakRouter;

/// Variant of an RTP observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpObserverKind {
	AudioLevel,
	ActiveSpeaker,
}

/// Options for [`Router::create_audio_level_observer`](crate::Router::create_audio_level_observer).
#[derive(Debug, Clone)]
pub struct AudioLevelObserverOptions {
	/// Maximum number of entries in a `volumes` event.
	pub max_entries: u16,
	/// Minimum average volume (dBvo, -127..0) reported.
	pub threshold: i8,
	/// Reporting interval in milliseconds.
	pub interval: u16,
	pub app_data: AppData,
}

impl Default for AudioLevelObserverOptions {
	fn default() -> Self {
		Self {
			max_entries: 1,
			threshold: -80,
			interval: 1000,
			app_data: AppData::new(),
		}
	}
}

/// Options for [`Router::create_active_speaker_observer`](crate::Router::create_active_speaker_observer).
#[derive(Debug, Clone)]
pub struct ActiveSpeakerObserverOptions {
	pub interval: u16,
	pub app_data: AppData,
}

impl Default for ActiveSpeakerObserverOptions {
	fn default() -> Self {
		Self {
			interval: 300,
			app_data: AppData::new(),
		}
	}
}

/// Volume of one producer in a `volumes` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelVolume {
	pub producer_id: String,
	pub volume: i8,
}

#[derive(Debug, Clone)]
pub enum RtpObserverEvent {
	RouterClose,
	/// Loudest producers, highest volume first.
	Volumes(Vec<AudioLevelVolume>),
	Silence,
	DominantSpeaker { producer_id: String },
}

#[derive(Debug, Clone)]
pub enum RtpObserverObserverEvent {
	Close,
	Pause,
	Resume,
	AddProducer { producer_id: String },
	RemoveProducer { producer_id: String },
}

pub(crate) struct RtpObserverInner {
	core: EntityCore,
	kind: RtpObserverKind,
	channel: Channel,
	router: WeakRouter,
	paused: AtomicBool,
	handlers: EventHandlers<RtpObserverEvent>,
	observer: EventHandlers<RtpObserverObserverEvent>,
}

/// Analysis unit attached to a router.
#[derive(Clone)]
pub struct RtpObserver {
	inner: Arc<RtpObserverInner>,
}

#[derive(Clone)]
pub(crate) struct WeakRtpObserver(Weak<RtpObserverInner>);

impl WeakRtpObserver {
	pub(crate) fn upgrade(&self) -> Option<RtpObserver> {
		self.0.upgrade().map(|inner| RtpObserver { inner })
	}
}

impl std::fmt::Debug for RtpObserver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RtpObserver")
			.field("id", &self.id())
			.field("kind", &self.inner.kind)
			.field("closed", &self.closed())
			.finish()
	}
}

impl RtpObserver {
	pub(crate) fn new(
		id: String,
		kind: RtpObserverKind,
		app_data: AppData,
		channel: Channel,
		router: WeakRouter,
	) -> Self {
		Self {
			inner: Arc::new(RtpObserverInner {
				core: EntityCore::new("RtpObserver", id, app_data),
				kind,
				channel,
				router,
				paused: AtomicBool::new(false),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakRtpObserver {
		WeakRtpObserver(Arc::downgrade(&self.inner))
	}

	/// Starts handling notifications, replaying those that arrived since creation.
	pub(crate) fn listen(&self, notifications: PendingSubscription) {
		let weak = self.downgrade();
		self.inner.core.attach_notifications(notifications, move |notification| {
			if let Some(rtp_observer) = weak.upgrade() {
				rtp_observer.handle_notification(notification);
			}
		});
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	pub fn kind(&self) -> RtpObserverKind {
		self.inner.kind
	}

	pub fn closed(&self) -> bool {
		self.inner.core.closed()
	}

	pub fn paused(&self) -> bool {
		self.inner.paused.load(Ordering::Acquire)
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&RtpObserverEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<RtpObserverObserverEvent> {
		&self.inner.observer
	}

	pub async fn pause(&self) -> Result<()> {
		tracing::debug!("pause()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::RtpObserverPause, self.id(), None).await?;

		if !self.inner.paused.swap(true, Ordering::AcqRel) {
			self.inner.observer.emit(&RtpObserverObserverEvent::Pause);
		}
		Ok(())
	}

	pub async fn resume(&self) -> Result<()> {
		tracing::debug!("resume()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::RtpObserverResume, self.id(), None).await?;

		if self.inner.paused.swap(false, Ordering::AcqRel) {
			self.inner.observer.emit(&RtpObserverObserverEvent::Resume);
		}
		Ok(())
	}

	/// Starts observing a producer of the same router.
	pub async fn add_producer(&self, producer_id: &str) -> Result<()> {
		tracing::debug!("add_producer() [producer_id:{}]", producer_id);
		let producer = self.router_producer(producer_id)?;
		self.inner
			.channel
			.request(
				Method::RtpObserverAddProducer,
				self.id(),
				Some(json!({ "producerId": producer.id() })),
			)
			.await?;

		self.inner.observer.emit(&RtpObserverObserverEvent::AddProducer {
			producer_id: producer.id().to_string(),
		});
		Ok(())
	}

	pub async fn remove_producer(&self, producer_id: &str) -> Result<()> {
		tracing::debug!("remove_producer() [producer_id:{}]", producer_id);
		let producer = self.router_producer(producer_id)?;
		self.inner
			.channel
			.request(
				Method::RtpObserverRemoveProducer,
				self.id(),
				Some(json!({ "producerId": producer.id() })),
			)
			.await?;

		self.inner.observer.emit(&RtpObserverObserverEvent::RemoveProducer {
			producer_id: producer.id().to_string(),
		});
		Ok(())
	}

	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let router = self.inner.router.upgrade();
		if let Some(router) = &router {
			router.rtp_observer_detached(self.id());
		}

		if let Some(router) = router.filter(|router| !router.closed()) {
			self.inner.channel.request_detached(
				Method::RouterCloseRtpObserver,
				router.id(),
				Some(json!({ "rtpObserverId": self.id() })),
			);
		}

		self.inner.observer.emit(&RtpObserverObserverEvent::Close);
	}

	pub(crate) fn router_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "router_closed()");

		self.inner.handlers.emit(&RtpObserverEvent::RouterClose);
		self.inner.observer.emit(&RtpObserverObserverEvent::Close);
	}

	fn router_producer(&self, producer_id: &str) -> Result<Producer> {
		self.inner
			.router
			.upgrade()
			.and_then(|router| router.get_producer(producer_id))
			.ok_or_else(|| Error::NotFound {
				kind: "Producer",
				id: producer_id.to_string(),
			})
	}

	fn handle_notification(&self, notification: &Notification) {
		match notification.event {
			Event::Volumes => {
				#[derive(Deserialize)]
				struct VolumesData {
					volumes: Vec<AudioLevelVolume>,
				}
				if let Some(VolumesData { volumes }) = notification_data(notification) {
					// Volumes for producers closed in the meantime are dropped.
					let volumes: Vec<_> = match self.inner.router.upgrade() {
						Some(router) => volumes
							.into_iter()
							.filter(|volume| router.get_producer(&volume.producer_id).is_some())
							.collect(),
						None => volumes,
					};
					if !volumes.is_empty() {
						self.inner.handlers.emit(&RtpObserverEvent::Volumes(volumes));
					}
				}
			}
			Event::Silence => self.inner.handlers.emit(&RtpObserverEvent::Silence),
			Event::DominantSpeaker => {
				#[derive(Deserialize)]
				#[serde(rename_all = "camelCase")]
				struct DominantSpeakerData {
					producer_id: String,
				}
				if let Some(DominantSpeakerData { producer_id }) = notification_data(notification) {
					self.inner
						.handlers
						.emit(&RtpObserverEvent::DominantSpeaker { producer_id });
				}
			}
			other => {
				tracing::error!("ignoring unknown event {:?} [rtp_observer_id:{}]", other, self.id());
			}
		}
	}
}

