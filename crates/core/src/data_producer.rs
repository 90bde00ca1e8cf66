//! [`DataProducer`]: a data channel source injected into a router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{Value, json};
use sfu_protocol::Method;
use sfu_runtime::{Channel, Result};

use crate::data_structures::{AppData, DataProducerType, SctpStreamParameters};
use crate::entity::EntityCore;
use crate::events::{EventHandlers, Subscription};
use crate::router::WeakRouter;
use crate::transport::WeakTransport;

/// Options for [`Transport::produce_data`](crate::Transport::produce_data).
#[derive(Debug, Clone, Default)]
pub struct DataProducerOptions {
	/// Data producer id; generated if unset.
	pub id: Option<String>,
	/// Required on SCTP-capable transports, ignored on direct transports.
	pub sctp_stream_parameters: Option<SctpStreamParameters>,
	pub label: String,
	pub protocol: String,
	pub paused: bool,
	pub app_data: AppData,
}

#[derive(Debug, Clone)]
pub enum DataProducerEvent {
	TransportClose,
}

#[derive(Debug, Clone)]
pub enum DataProducerObserverEvent {
	Close,
	Pause,
	Resume,
}

pub(crate) struct DataProducerArgs {
	pub(crate) id: String,
	pub(crate) data_producer_type: DataProducerType,
	pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
	pub(crate) label: String,
	pub(crate) protocol: String,
	pub(crate) paused: bool,
	pub(crate) app_data: AppData,
	pub(crate) channel: Channel,
	pub(crate) transport: WeakTransport,
	pub(crate) router: WeakRouter,
}

pub(crate) struct DataProducerInner {
	core: EntityCore,
	data_producer_type: DataProducerType,
	sctp_stream_parameters: Option<SctpStreamParameters>,
	label: String,
	protocol: String,
	channel: Channel,
	transport: WeakTransport,
	router: WeakRouter,
	paused: AtomicBool,
	handlers: EventHandlers<DataProducerEvent>,
	observer: EventHandlers<DataProducerObserverEvent>,
}

/// A data source in a router.
#[derive(Clone)]
pub struct DataProducer {
	inner: Arc<DataProducerInner>,
}

#[derive(Clone)]
pub(crate) struct WeakDataProducer(Weak<DataProducerInner>);

impl WeakDataProducer {
	pub(crate) fn upgrade(&self) -> Option<DataProducer> {
		self.0.upgrade().map(|inner| DataProducer { inner })
	}
}

impl std::fmt::Debug for DataProducer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DataProducer")
			.field("id", &self.id())
			.field("label", &self.inner.label)
			.field("closed", &self.closed())
			.finish()
	}
}

impl DataProducer {
	pub(crate) fn new(args: DataProducerArgs) -> Self {
		Self {
			inner: Arc::new(DataProducerInner {
				core: EntityCore::new("DataProducer", args.id, args.app_data),
				data_producer_type: args.data_producer_type,
				sctp_stream_parameters: args.sctp_stream_parameters,
				label: args.label,
				protocol: args.protocol,
				channel: args.channel,
				transport: args.transport,
				router: args.router,
				paused: AtomicBool::new(args.paused),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> WeakDataProducer {
		WeakDataProducer(Arc::downgrade(&self.inner))
	}

	pub fn id(&self) -> &str {
		self.inner.core.id()
	}

	pub fn data_producer_type(&self) -> DataProducerType {
		self.inner.data_producer_type
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

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&DataProducerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<DataProducerObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::DataProducerDump, self.id(), None).await
	}

	pub async fn get_stats(&self) -> Result<Value> {
		tracing::debug!("get_stats()");
		self.inner
			.channel
			.request(Method::DataProducerGetStats, self.id(), None)
			.await
	}

	pub async fn pause(&self) -> Result<()> {
		tracing::debug!("pause()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::DataProducerPause, self.id(), None).await?;

		if !self.inner.paused.swap(true, Ordering::AcqRel) {
			self.inner.observer.emit(&DataProducerObserverEvent::Pause);
		}
		Ok(())
	}

	pub async fn resume(&self) -> Result<()> {
		tracing::debug!("resume()");
		self.inner.core.ensure_open()?;
		self.inner.channel.request(Method::DataProducerResume, self.id(), None).await?;

		if self.inner.paused.swap(false, Ordering::AcqRel) {
			self.inner.observer.emit(&DataProducerObserverEvent::Resume);
		}
		Ok(())
	}

	/// Closes the data producer and every data consumer of it in the router.
	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "close()");

		let transport = self.inner.transport.upgrade();
		if let Some(transport) = &transport {
			transport.data_producer_detached(self.id());
		}
		self.notify_router();

		if let Some(transport) = transport.filter(|transport| !transport.closed()) {
			self.inner.channel.request_detached(
				Method::TransportCloseDataProducer,
				transport.id(),
				Some(json!({ "dataProducerId": self.id() })),
			);
		}

		self.inner.observer.emit(&DataProducerObserverEvent::Close);
	}

	pub(crate) fn transport_closed(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(id = self.id(), "transport_closed()");

		self.notify_router();

		self.inner.handlers.emit(&DataProducerEvent::TransportClose);
		self.inner.observer.emit(&DataProducerObserverEvent::Close);
	}

	fn notify_router(&self) {
		if let Some(router) = self.inner.router.upgrade() {
			router.data_producer_closed(self);
		}
	}
}
