//! [`WebRtcServer`]: shared listening sockets for many WebRTC transports.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Value, json};
use sfu_protocol::Method;
use sfu_runtime::{Channel, Result};

use crate::data_structures::{AppData, ListenInfo};
use crate::entity::EntityCore;
use crate::events::{EventHandlers, Subscription};
use crate::transport::Transport;
use crate::worker::WeakWorker;

/// Options for [`Worker::create_webrtc_server`](crate::Worker::create_webrtc_server).
#[derive(Debug, Clone)]
pub struct WebRtcServerOptions {
	/// Must not be empty.
	pub listen_infos: Vec<ListenInfo>,
	pub app_data: AppData,
}

impl WebRtcServerOptions {
	pub fn new(listen_infos: Vec<ListenInfo>) -> Self {
		Self {
			listen_infos,
			app_data: AppData::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub enum WebRtcServerEvent {
	WorkerClose,
}

#[derive(Debug, Clone)]
pub enum WebRtcServerObserverEvent {
	Close,
	WebRtcTransportHandled(Transport),
	WebRtcTransportUnhandled(Transport),
}

pub(crate) struct WebRtcServerInner {
	core: EntityCore,
	channel: Channel,
	worker: WeakWorker,
	transports: Mutex<HashMap<String, Transport>>,
	handlers: EventHandlers<WebRtcServerEvent>,
	observer: EventHandlers<WebRtcServerObserverEvent>,
}

/// Listening sockets owned by a worker and shared by WebRTC transports.
#[derive(Clone)]
pub struct WebRtcServer {
	inner: Arc<WebRtcServerInner>,
}

#[derive(Clone)]
pub(crate) struct WeakWebRtcServer(Weak<WebRtcServerInner>);

impl WeakWebRtcServer {
	pub(crate) fn upgrade(&self) -> Option<WebRtcServer> {
		self.0.upgrade().map(|inner| WebRtcServer { inner })
	}
}

impl std::fmt::Debug for WebRtcServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WebRtcServer")
			.field("id", &self.id())
			.field("closed", &self.closed())
			.finish()
	}
}

impl WebRtcServer {
	pub(crate) fn new(id: String, app_data: AppData, channel: Channel, worker: WeakWorker) -> Self {
		Self {
			inner: Arc::new(WebRtcServerInner {
				core: EntityCore::new("WebRtcServer", id, app_data),
				channel,
				worker,
				transports: Mutex::new(HashMap::new()),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakWebRtcServer {
		WeakWebRtcServer(Arc::downgrade(&self.inner))
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
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

	/// WebRTC transports currently listening through this server.
	pub fn webrtc_transports(&self) -> Vec<Transport> {
		self.inner.transports.lock().values().cloned().collect()
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&WebRtcServerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<WebRtcServerObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::WebRtcServerDump, self.id(), None).await
	}

	/// Closes the server; every transport using it is closed as well.
	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let worker = self.inner.worker.upgrade();
		if let Some(worker) = &worker {
			worker.webrtc_server_detached(self.id());
		}

		let transports = std::mem::take(&mut *self.inner.transports.lock());
		for transport in transports.into_values() {
			transport.listen_server_closed();
		}

		if worker.is_some_and(|worker| !worker.closed()) {
			self.inner.channel.request_detached(
				Method::WorkerCloseWebRtcServer,
				"",
				Some(json!({ "webRtcServerId": self.id() })),
			);
		}

		self.inner.observer.emit(&WebRtcServerObserverEvent::Close);
	}

	/// Local teardown after the owning worker closed.
	///
	/// Transports are left to their routers, which the worker closes too.
	pub(crate) fn worker_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "worker_closed()");

		self.inner.transports.lock().clear();

		self.inner.handlers.emit(&WebRtcServerEvent::WorkerClose);
		self.inner.observer.emit(&WebRtcServerObserverEvent::Close);
	}

	/// Starts tracking a transport created on this server. Returns false if the
	/// server closed meanwhile, in which case the transport is closed too.
	pub(crate) fn handle_transport(&self, transport: &Transport) -> bool {
		{
			let mut transports = self.inner.transports.lock();
			if self.closed() {
				drop(transports);
				transport.listen_server_closed();
				return false;
			}
			transports.insert(transport.id().to_string(), transport.clone());
		}
		self.inner
			.observer
			.emit(&WebRtcServerObserverEvent::WebRtcTransportHandled(transport.clone()));
		true
	}

	pub(crate) fn transport_unhandled(&self, transport_id: &str) {
		let removed = self.inner.transports.lock().remove(transport_id);
		if let Some(transport) = removed {
			self.inner
				.observer
				.emit(&WebRtcServerObserverEvent::WebRtcTransportUnhandled(transport));
		}
	}
}
