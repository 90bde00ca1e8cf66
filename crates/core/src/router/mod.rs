//! [`Router`]: a routing domain inside the worker.
//!
//! A router owns its transports and RTP observers. Producers and data
//! producers are owned by their transports; the router only indexes them by id
//! (weakly) so consumers on any of its transports can find them, and so closing
//! a producer can reach every consumer of it.

mod pipe;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Value, json};
use sfu_protocol::Method;
use sfu_runtime::{Channel, Error, Result};

pub use pipe::{PipeToRouterOptions, PipeToRouterResult, PipeTransportPair};

use crate::consumer::{Consumer, WeakConsumer};
use crate::data_consumer::{DataConsumer, WeakDataConsumer};
use crate::data_producer::{DataProducer, WeakDataProducer};
use crate::data_structures::AppData;
use crate::entity::{EntityCore, generate_id, response_data};
use crate::events::{EventHandlers, Subscription};
use crate::producer::{Producer, WeakProducer};
use crate::rtp_observer::{
	ActiveSpeakerObserverOptions, AudioLevelObserverOptions, RtpObserver, RtpObserverKind,
};
use crate::transport::{
	DirectTransportOptions, PipeTransportOptions, PlainTransportOptions, Transport, TransportArgs,
	TransportKind, TransportState, WebRtcTransportListen, WebRtcTransportOptions,
};
use crate::worker::WeakWorker;

/// Options for [`Worker::create_router`](crate::Worker::create_router).
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
	/// Media codecs the router supports (passed to the worker as-is).
	pub media_codecs: Vec<Value>,
	pub app_data: AppData,
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
	WorkerClose,
}

#[derive(Debug, Clone)]
pub enum RouterObserverEvent {
	Close,
	NewTransport(Transport),
	NewRtpObserver(RtpObserver),
}

#[derive(Default)]
struct RouterTables {
	transports: HashMap<String, Transport>,
	rtp_observers: HashMap<String, RtpObserver>,
	producers: HashMap<String, WeakProducer>,
	data_producers: HashMap<String, WeakDataProducer>,
	/// Consumers keyed by the producer they forward.
	consumers: HashMap<String, HashMap<String, WeakConsumer>>,
	/// Data consumers keyed by the data producer they forward.
	data_consumers: HashMap<String, HashMap<String, WeakDataConsumer>>,
}

pub(crate) struct RouterInner {
	core: EntityCore,
	media_codecs: Vec<Value>,
	channel: Channel,
	worker: WeakWorker,
	tables: Mutex<RouterTables>,
	pipe_pairs: Mutex<HashMap<String, pipe::SharedPair>>,
	handlers: EventHandlers<RouterEvent>,
	observer: EventHandlers<RouterObserverEvent>,
}

/// Routing domain owned by a worker.
#[derive(Clone)]
pub struct Router {
	inner: Arc<RouterInner>,
}

#[derive(Clone)]
pub(crate) struct WeakRouter(Weak<RouterInner>);

impl WeakRouter {
	pub(crate) fn upgrade(&self) -> Option<Router> {
		self.0.upgrade().map(|inner| Router { inner })
	}
}

impl std::fmt::Debug for Router {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Router")
			.field("id", &self.id())
			.field("closed", &self.closed())
			.finish()
	}
}

impl Router {
	pub(crate) fn new(
		id: String,
		media_codecs: Vec<Value>,
		app_data: AppData,
		channel: Channel,
		worker: WeakWorker,
	) -> Self {
		Self {
			inner: Arc::new(RouterInner {
				core: EntityCore::new("Router", id, app_data),
				media_codecs,
				channel,
				worker,
				tables: Mutex::new(RouterTables::default()),
				pipe_pairs: Mutex::new(HashMap::new()),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakRouter {
		WeakRouter(Arc::downgrade(&self.inner))
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	pub fn closed(&self) -> bool {
		self.inner.core.closed()
	}

	pub fn media_codecs(&self) -> &[Value] {
		&self.inner.media_codecs
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	pub fn transports(&self) -> Vec<Transport> {
		self.inner.tables.lock().transports.values().cloned().collect()
	}

	pub fn rtp_observers(&self) -> Vec<RtpObserver> {
		self.inner.tables.lock().rtp_observers.values().cloned().collect()
	}

	/// Number of router pairs with a cached (or in-progress) pipe transport pair.
	pub fn pipe_pair_count(&self) -> usize {
		self.inner.pipe_pairs.lock().len()
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&RouterEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<RouterObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::RouterDump, self.id(), None).await
	}

	/// Open producer of this router with the given id.
	pub fn get_producer(&self, producer_id: &str) -> Option<Producer> {
		self.inner
			.tables
			.lock()
			.producers
			.get(producer_id)
			.and_then(WeakProducer::upgrade)
			.filter(|producer| !producer.closed())
	}

	/// Open data producer of this router with the given id.
	pub fn get_data_producer(&self, data_producer_id: &str) -> Option<DataProducer> {
		self.inner
			.tables
			.lock()
			.data_producers
			.get(data_producer_id)
			.and_then(WeakDataProducer::upgrade)
			.filter(|data_producer| !data_producer.closed())
	}

	pub async fn create_webrtc_transport(&self, options: WebRtcTransportOptions) -> Result<Transport> {
		tracing::debug!("create_webrtc_transport()");
		self.inner.core.ensure_open()?;

		let (method, webrtc_server) = match &options.listen {
			WebRtcTransportListen::Individual { listen_infos } => {
				if listen_infos.is_empty() {
					return Err(Error::InvalidArgument("empty listen_infos".to_string()));
				}
				(Method::RouterCreateWebRtcTransport, None)
			}
			WebRtcTransportListen::Server { webrtc_server } => {
				if webrtc_server.closed() {
					return Err(Error::InvalidState("WebRtcServer closed".to_string()));
				}
				(Method::RouterCreateWebRtcTransportWithServer, Some(webrtc_server.clone()))
			}
		};

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		let data = self
			.inner
			.channel
			.request(method, self.id(), Some(options.request_data(&id)))
			.await?;

		let transport = Transport::new(TransportArgs {
			id,
			kind: TransportKind::WebRtc,
			state: response_data(data)?,
			sctp_streams: options.enable_sctp.then_some(options.num_sctp_streams.os),
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			router: self.downgrade(),
			webrtc_server: webrtc_server.as_ref().map(|server| server.downgrade()),
		});
		self.attach_transport(&transport)?;

		if let Some(server) = webrtc_server {
			if !server.handle_transport(&transport) {
				return Err(Error::InvalidState("WebRtcServer closed".to_string()));
			}
		}

		self.inner
			.observer
			.emit(&RouterObserverEvent::NewTransport(transport.clone()));
		transport.listen(notifications);
		Ok(transport)
	}

	pub async fn create_plain_transport(&self, options: PlainTransportOptions) -> Result<Transport> {
		tracing::debug!("create_plain_transport()");
		self.inner.core.ensure_open()?;

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		let data = self
			.inner
			.channel
			.request(Method::RouterCreatePlainTransport, self.id(), Some(options.request_data(&id)))
			.await?;

		let transport = Transport::new(TransportArgs {
			id,
			kind: TransportKind::Plain,
			state: response_data(data)?,
			sctp_streams: options.enable_sctp.then_some(options.num_sctp_streams.os),
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			router: self.downgrade(),
			webrtc_server: None,
		});
		self.attach_transport(&transport)?;

		self.inner
			.observer
			.emit(&RouterObserverEvent::NewTransport(transport.clone()));
		transport.listen(notifications);
		Ok(transport)
	}

	pub async fn create_pipe_transport(&self, options: PipeTransportOptions) -> Result<Transport> {
		tracing::debug!("create_pipe_transport()");
		self.inner.core.ensure_open()?;

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		let data = self
			.inner
			.channel
			.request(Method::RouterCreatePipeTransport, self.id(), Some(options.request_data(&id)))
			.await?;

		let transport = Transport::new(TransportArgs {
			id,
			kind: TransportKind::Pipe,
			state: response_data(data)?,
			sctp_streams: options.enable_sctp.then_some(options.num_sctp_streams.os),
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			router: self.downgrade(),
			webrtc_server: None,
		});
		self.attach_transport(&transport)?;

		self.inner
			.observer
			.emit(&RouterObserverEvent::NewTransport(transport.clone()));
		transport.listen(notifications);
		Ok(transport)
	}

	pub async fn create_direct_transport(&self, options: DirectTransportOptions) -> Result<Transport> {
		tracing::debug!("create_direct_transport()");
		self.inner.core.ensure_open()?;

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		let data = self
			.inner
			.channel
			.request(Method::RouterCreateDirectTransport, self.id(), Some(options.request_data(&id)))
			.await?;

		let transport = Transport::new(TransportArgs {
			id,
			kind: TransportKind::Direct,
			state: response_data::<TransportState>(data)?,
			sctp_streams: None,
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			router: self.downgrade(),
			webrtc_server: None,
		});
		self.attach_transport(&transport)?;

		self.inner
			.observer
			.emit(&RouterObserverEvent::NewTransport(transport.clone()));
		transport.listen(notifications);
		Ok(transport)
	}

	pub async fn create_audio_level_observer(&self, options: AudioLevelObserverOptions) -> Result<RtpObserver> {
		tracing::debug!("create_audio_level_observer()");
		self.inner.core.ensure_open()?;

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		self.inner
			.channel
			.request(
				Method::RouterCreateAudioLevelObserver,
				self.id(),
				Some(json!({
					"rtpObserverId": id,
					"maxEntries": options.max_entries,
					"threshold": options.threshold,
					"interval": options.interval,
				})),
			)
			.await?;

		let rtp_observer = RtpObserver::new(
			id,
			RtpObserverKind::AudioLevel,
			options.app_data,
			self.inner.channel.clone(),
			self.downgrade(),
		);
		self.attach_rtp_observer(&rtp_observer)?;
		rtp_observer.listen(notifications);
		Ok(rtp_observer)
	}

	pub async fn create_active_speaker_observer(
		&self,
		options: ActiveSpeakerObserverOptions,
	) -> Result<RtpObserver> {
		tracing::debug!("create_active_speaker_observer()");
		self.inner.core.ensure_open()?;

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		self.inner
			.channel
			.request(
				Method::RouterCreateActiveSpeakerObserver,
				self.id(),
				Some(json!({
					"rtpObserverId": id,
					"interval": options.interval,
				})),
			)
			.await?;

		let rtp_observer = RtpObserver::new(
			id,
			RtpObserverKind::ActiveSpeaker,
			options.app_data,
			self.inner.channel.clone(),
			self.downgrade(),
		);
		self.attach_rtp_observer(&rtp_observer)?;
		rtp_observer.listen(notifications);
		Ok(rtp_observer)
	}

	/// Closes the router and everything in it.
	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let worker = self.inner.worker.upgrade();
		if let Some(worker) = &worker {
			worker.router_detached(self.id());
		}

		self.teardown();

		if worker.is_some_and(|worker| !worker.closed()) {
			self.inner.channel.request_detached(
				Method::WorkerCloseRouter,
				"",
				Some(json!({ "routerId": self.id() })),
			);
		}

		self.inner.observer.emit(&RouterObserverEvent::Close);
	}

	/// Local teardown after the owning worker closed.
	pub(crate) fn worker_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "worker_closed()");

		self.teardown();

		self.inner.handlers.emit(&RouterEvent::WorkerClose);
		self.inner.observer.emit(&RouterObserverEvent::Close);
	}

	fn teardown(&self) {
		let tables = std::mem::take(&mut *self.inner.tables.lock());
		self.inner.pipe_pairs.lock().clear();

		for transport in tables.transports.into_values() {
			transport.router_closed();
		}
		for rtp_observer in tables.rtp_observers.into_values() {
			rtp_observer.router_closed();
		}
	}

	fn attach_transport(&self, transport: &Transport) -> Result<()> {
		let mut tables = self.inner.tables.lock();
		if self.closed() {
			drop(tables);
			transport.router_closed();
			return Err(Error::InvalidState("Router closed".to_string()));
		}
		tables.transports.insert(transport.id().to_string(), transport.clone());
		Ok(())
	}

	fn attach_rtp_observer(&self, rtp_observer: &RtpObserver) -> Result<()> {
		{
			let mut tables = self.inner.tables.lock();
			if self.closed() {
				drop(tables);
				rtp_observer.router_closed();
				return Err(Error::InvalidState("Router closed".to_string()));
			}
			tables
				.rtp_observers
				.insert(rtp_observer.id().to_string(), rtp_observer.clone());
		}
		self.inner
			.observer
			.emit(&RouterObserverEvent::NewRtpObserver(rtp_observer.clone()));
		Ok(())
	}

	pub(crate) fn transport_detached(&self, transport_id: &str) {
		self.inner.tables.lock().transports.remove(transport_id);
	}

	pub(crate) fn rtp_observer_detached(&self, rtp_observer_id: &str) {
		self.inner.tables.lock().rtp_observers.remove(rtp_observer_id);
	}

	/// Indexes a new producer. Returns false if the router closed meanwhile.
	pub(crate) fn register_producer(&self, producer: &Producer) -> bool {
		let mut tables = self.inner.tables.lock();
		if self.closed() {
			return false;
		}
		tables
			.producers
			.insert(producer.id().to_string(), producer.downgrade());
		true
	}

	/// Indexes a new consumer. Returns false if its producer is gone.
	pub(crate) fn register_consumer(&self, consumer: &Consumer) -> bool {
		let mut tables = self.inner.tables.lock();
		if self.closed() || !tables.producers.contains_key(consumer.producer_id()) {
			return false;
		}
		tables
			.consumers
			.entry(consumer.producer_id().to_string())
			.or_default()
			.insert(consumer.id().to_string(), consumer.downgrade());
		true
	}

	pub(crate) fn register_data_producer(&self, data_producer: &DataProducer) -> bool {
		let mut tables = self.inner.tables.lock();
		if self.closed() {
			return false;
		}
		tables
			.data_producers
			.insert(data_producer.id().to_string(), data_producer.downgrade());
		true
	}

	pub(crate) fn register_data_consumer(&self, data_consumer: &DataConsumer) -> bool {
		let mut tables = self.inner.tables.lock();
		if self.closed() || !tables.data_producers.contains_key(data_consumer.data_producer_id()) {
			return false;
		}
		tables
			.data_consumers
			.entry(data_consumer.data_producer_id().to_string())
			.or_default()
			.insert(data_consumer.id().to_string(), data_consumer.downgrade());
		true
	}

	/// Drops a closed producer from the index and closes every consumer of it.
	pub(crate) fn producer_closed(&self, producer: &Producer) {
		let consumers = {
			let mut tables = self.inner.tables.lock();
			tables.producers.remove(producer.id());
			tables.consumers.remove(producer.id()).unwrap_or_default()
		};
		for consumer in consumers.values().filter_map(WeakConsumer::upgrade) {
			consumer.producer_closed();
		}
	}

	pub(crate) fn data_producer_closed(&self, data_producer: &DataProducer) {
		let data_consumers = {
			let mut tables = self.inner.tables.lock();
			tables.data_producers.remove(data_producer.id());
			tables.data_consumers.remove(data_producer.id()).unwrap_or_default()
		};
		for data_consumer in data_consumers.values().filter_map(WeakDataConsumer::upgrade) {
			data_consumer.data_producer_closed();
		}
	}

	pub(crate) fn consumer_detached(&self, producer_id: &str, consumer_id: &str) {
		let mut tables = self.inner.tables.lock();
		if let Some(consumers) = tables.consumers.get_mut(producer_id) {
			consumers.remove(consumer_id);
			if consumers.is_empty() {
				tables.consumers.remove(producer_id);
			}
		}
	}

	pub(crate) fn data_consumer_detached(&self, data_producer_id: &str, data_consumer_id: &str) {
		let mut tables = self.inner.tables.lock();
		if let Some(data_consumers) = tables.data_consumers.get_mut(data_producer_id) {
			data_consumers.remove(data_consumer_id);
			if data_consumers.is_empty() {
				tables.data_consumers.remove(data_producer_id);
			}
		}
	}
}
