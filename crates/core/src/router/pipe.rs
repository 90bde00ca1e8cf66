//! Piping producers and data producers between routers of the same host.
//!
//! Each ordered pair of routers shares at most one pair of connected pipe
//! transports. The pair is created on first use; the in-progress creation is
//! cached in both routers as a [`Shared`] future so concurrent callers await
//! the same creation instead of racing to build a second pair.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join};
use serde_json::{Value, json};
use sfu_runtime::{Error, Result};

use super::{Router, WeakRouter};
use crate::consumer::{Consumer, ConsumerEvent, ConsumerObserverEvent, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerObserverEvent, DataConsumerOptions};
use crate::data_producer::{DataProducer, DataProducerObserverEvent, DataProducerOptions};
use crate::data_structures::{ListenInfo, NumSctpStreams};
use crate::producer::{Producer, ProducerObserverEvent, ProducerOptions};
use crate::transport::{PipeTransportOptions, Transport, TransportObserverEvent};

pub(crate) type SharedPair = Shared<BoxFuture<'static, std::result::Result<PipeTransportPair, Arc<Error>>>>;

/// Options for [`Router::pipe_to_router`].
///
/// Exactly one of `producer_id` and `data_producer_id` must be set.
#[derive(Debug, Clone)]
pub struct PipeToRouterOptions {
	pub producer_id: Option<String>,
	pub data_producer_id: Option<String>,
	/// Destination router.
	pub router: Router,
	pub listen_info: ListenInfo,
	pub enable_sctp: bool,
	pub num_sctp_streams: NumSctpStreams,
	pub enable_rtx: bool,
	pub enable_srtp: bool,
}

impl PipeToRouterOptions {
	/// Pipes the producer `producer_id` into `router`.
	pub fn producer(producer_id: impl Into<String>, router: Router) -> Self {
		Self {
			producer_id: Some(producer_id.into()),
			..Self::new(router)
		}
	}

	/// Pipes the data producer `data_producer_id` into `router`.
	pub fn data_producer(data_producer_id: impl Into<String>, router: Router) -> Self {
		Self {
			data_producer_id: Some(data_producer_id.into()),
			..Self::new(router)
		}
	}

	fn new(router: Router) -> Self {
		Self {
			producer_id: None,
			data_producer_id: None,
			router,
			listen_info: ListenInfo::udp("127.0.0.1"),
			enable_sctp: true,
			num_sctp_streams: NumSctpStreams::default(),
			enable_rtx: false,
			enable_srtp: false,
		}
	}

	fn pipe_transport_options(&self) -> PipeTransportOptions {
		PipeTransportOptions {
			enable_sctp: self.enable_sctp,
			num_sctp_streams: self.num_sctp_streams,
			enable_rtx: self.enable_rtx,
			enable_srtp: self.enable_srtp,
			..PipeTransportOptions::new(self.listen_info.clone())
		}
	}
}

/// Entities created by [`Router::pipe_to_router`].
#[derive(Debug, Clone)]
pub struct PipeToRouterResult {
	/// Consumer of the source producer on the local pipe transport.
	pub pipe_consumer: Option<Consumer>,
	/// Producer with the source producer's id on the remote pipe transport.
	pub pipe_producer: Option<Producer>,
	pub pipe_data_consumer: Option<DataConsumer>,
	pub pipe_data_producer: Option<DataProducer>,
	/// The pipe transports the entities were created on.
	pub pipe_transport_pair: PipeTransportPair,
}

/// Two connected pipe transports, one in each router.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeTransportPair {
	ends: [(String, Transport); 2],
}

impl PipeTransportPair {
	/// The pipe transport living in the router `router_id`.
	pub fn for_router(&self, router_id: &str) -> Option<&Transport> {
		self.ends
			.iter()
			.find(|(id, _)| id == router_id)
			.map(|(_, transport)| transport)
	}
}

fn pair_key(from: &str, to: &str) -> String {
	format!("{}_{}", from, to)
}

impl Router {
	/// Makes a producer or data producer of this router available in `options.router`.
	///
	/// The first call for a router pair creates and connects a pipe transport
	/// in each router; later and concurrent calls reuse it.
	pub async fn pipe_to_router(&self, options: PipeToRouterOptions) -> Result<PipeToRouterResult> {
		tracing::debug!("pipe_to_router()");
		self.inner.core.ensure_open()?;

		enum Source {
			Producer(Producer),
			DataProducer(DataProducer),
		}

		let source = match (&options.producer_id, &options.data_producer_id) {
			(Some(_), Some(_)) => {
				return Err(Error::InvalidArgument(
					"just producer_id or data_producer_id can be given".to_string(),
				));
			}
			(None, None) => {
				return Err(Error::InvalidArgument(
					"missing producer_id or data_producer_id".to_string(),
				));
			}
			(Some(producer_id), None) => {
				Source::Producer(self.get_producer(producer_id).ok_or_else(|| Error::NotFound {
					kind: "Producer",
					id: producer_id.clone(),
				})?)
			}
			(None, Some(data_producer_id)) => Source::DataProducer(
				self.get_data_producer(data_producer_id)
					.ok_or_else(|| Error::NotFound {
						kind: "DataProducer",
						id: data_producer_id.clone(),
					})?,
			),
		};

		if options.router.id() == self.id() {
			return Err(Error::InvalidArgument("cannot use this Router as destination".to_string()));
		}
		if options.router.closed() {
			return Err(Error::InvalidState("destination Router closed".to_string()));
		}

		let pair = self.pipe_transport_pair(&options).await?;
		let (Some(local), Some(remote)) = (pair.for_router(self.id()), pair.for_router(options.router.id()))
		else {
			return Err(Error::InvalidState("pipe transport pair does not match routers".to_string()));
		};

		let mut result = PipeToRouterResult {
			pipe_consumer: None,
			pipe_producer: None,
			pipe_data_consumer: None,
			pipe_data_producer: None,
			pipe_transport_pair: pair.clone(),
		};

		match source {
			Source::Producer(producer) => {
				let (pipe_consumer, pipe_producer) = pipe_producer(&producer, local, remote).await?;
				result.pipe_consumer = Some(pipe_consumer);
				result.pipe_producer = Some(pipe_producer);
			}
			Source::DataProducer(data_producer) => {
				let (pipe_data_consumer, pipe_data_producer) =
					pipe_data_producer(&data_producer, local, remote).await?;
				result.pipe_data_consumer = Some(pipe_data_consumer);
				result.pipe_data_producer = Some(pipe_data_producer);
			}
		}

		Ok(result)
	}

	/// Returns the cached pair for `options.router`, creating it if needed.
	async fn pipe_transport_pair(&self, options: &PipeToRouterOptions) -> Result<PipeTransportPair> {
		let target = &options.router;
		let key = pair_key(self.id(), target.id());

		let shared = {
			// Both maps are locked in router id order.
			let (mut own, mut other) = if self.id() < target.id() {
				let own = self.inner.pipe_pairs.lock();
				let other = target.inner.pipe_pairs.lock();
				(own, other)
			} else {
				let other = target.inner.pipe_pairs.lock();
				let own = self.inner.pipe_pairs.lock();
				(own, other)
			};

			match own.get(&key) {
				Some(existing) => existing.clone(),
				None => {
					let slot = PairSlot {
						source: self.downgrade(),
						source_id: self.id().to_string(),
						target: target.downgrade(),
						target_id: target.id().to_string(),
					};
					let shared = create_pair(slot, options.pipe_transport_options())
						.boxed()
						.shared();
					own.insert(key, shared.clone());
					other.insert(pair_key(target.id(), self.id()), shared.clone());
					shared
				}
			}
		};

		shared.await.map_err(Error::PipeTransportPair)
	}
}

/// Cache entries of one router pair, held by the creation future and the close hooks.
#[derive(Clone)]
struct PairSlot {
	source: WeakRouter,
	source_id: String,
	target: WeakRouter,
	target_id: String,
}

impl PairSlot {
	/// Removes the pair from both routers' caches.
	fn evict(&self) {
		if let Some(source) = self.source.upgrade() {
			source
				.inner
				.pipe_pairs
				.lock()
				.remove(&pair_key(&self.source_id, &self.target_id));
		}
		if let Some(target) = self.target.upgrade() {
			target
				.inner
				.pipe_pairs
				.lock()
				.remove(&pair_key(&self.target_id, &self.source_id));
		}
	}
}

async fn create_pair(
	slot: PairSlot,
	transport_options: PipeTransportOptions,
) -> std::result::Result<PipeTransportPair, Arc<Error>> {
	match connect_pair(&slot, transport_options).await {
		Ok(pair) => Ok(pair),
		Err(e) => {
			tracing::warn!("pipe transport pair creation failed: {}", e);
			slot.evict();
			Err(Arc::new(e))
		}
	}
}

async fn connect_pair(slot: &PairSlot, transport_options: PipeTransportOptions) -> Result<PipeTransportPair> {
	let (Some(source_router), Some(target_router)) = (slot.source.upgrade(), slot.target.upgrade()) else {
		return Err(Error::InvalidState("Router closed".to_string()));
	};

	let (local, remote) = join(
		source_router.create_pipe_transport(transport_options.clone()),
		target_router.create_pipe_transport(transport_options),
	)
	.await;
	let (local, remote) = match (local, remote) {
		(Ok(local), Ok(remote)) => (local, remote),
		(Ok(transport), Err(e)) | (Err(e), Ok(transport)) => {
			transport.close();
			return Err(e);
		}
		(Err(e), Err(_)) => return Err(e),
	};

	let (local_connect, remote_connect) = join(
		local.connect(connect_params(&remote)),
		remote.connect(connect_params(&local)),
	)
	.await;
	if let Err(e) = local_connect.and(remote_connect) {
		local.close();
		remote.close();
		return Err(e);
	}

	// Closing either end closes the other and forgets the pair.
	for (this, other) in [(&local, &remote), (&remote, &local)] {
		let other = other.downgrade();
		let slot = slot.clone();
		this.observer().on_detached(move |event| {
			if let TransportObserverEvent::Close = event {
				if let Some(other) = other.upgrade() {
					other.close();
				}
				slot.evict();
			}
		});
	}

	Ok(PipeTransportPair {
		ends: [
			(source_router.id().to_string(), local),
			(target_router.id().to_string(), remote),
		],
	})
}

/// Connect parameters pointing a pipe transport at `peer`.
fn connect_params(peer: &Transport) -> Value {
	let state = peer.state();
	let tuple = state.tuple.unwrap_or_default();
	json!({
		"ip": tuple.local_ip,
		"port": tuple.local_port,
		"srtpParameters": state.srtp_parameters,
	})
}

async fn pipe_producer(producer: &Producer, local: &Transport, remote: &Transport) -> Result<(Consumer, Producer)> {
	let pipe_consumer = local
		.consume(ConsumerOptions {
			pipe: true,
			..ConsumerOptions::new(producer.id(), Value::Null)
		})
		.await?;

	let produced = remote
		.produce(ProducerOptions {
			id: Some(producer.id().to_string()),
			paused: pipe_consumer.producer_paused(),
			app_data: producer.app_data(),
			..ProducerOptions::new(pipe_consumer.kind(), pipe_consumer.rtp_parameters().clone())
		})
		.await;
	let pipe_producer = match produced {
		Ok(pipe_producer) => pipe_producer,
		Err(e) => {
			pipe_consumer.close();
			return Err(e);
		}
	};

	if producer.closed() {
		pipe_consumer.close();
		pipe_producer.close();
		return Err(Error::InvalidState("original Producer closed".to_string()));
	}

	let weak_producer = pipe_producer.downgrade();
	pipe_consumer.observer().on_detached(move |event| {
		if let ConsumerObserverEvent::Close = event {
			if let Some(pipe_producer) = weak_producer.upgrade() {
				pipe_producer.close();
			}
		}
	});

	let weak_producer = pipe_producer.downgrade();
	pipe_consumer.on_detached(move |event| {
		let pause = match event {
			ConsumerEvent::ProducerPause => true,
			ConsumerEvent::ProducerResume => false,
			_ => return,
		};
		let Some(pipe_producer) = weak_producer.upgrade() else {
			return;
		};
		tokio::spawn(async move {
			let result = if pause {
				pipe_producer.pause().await
			} else {
				pipe_producer.resume().await
			};
			if let Err(e) = result {
				tracing::debug!(id = pipe_producer.id(), "mirroring pause state failed: {}", e);
			}
		});
	});

	let weak_consumer = pipe_consumer.downgrade();
	pipe_producer.observer().on_detached(move |event| {
		if let ProducerObserverEvent::Close = event {
			if let Some(pipe_consumer) = weak_consumer.upgrade() {
				pipe_consumer.close();
			}
		}
	});

	Ok((pipe_consumer, pipe_producer))
}

async fn pipe_data_producer(
	data_producer: &DataProducer,
	local: &Transport,
	remote: &Transport,
) -> Result<(DataConsumer, DataProducer)> {
	let pipe_data_consumer = local
		.consume_data(DataConsumerOptions::new(data_producer.id()))
		.await?;

	let produced = remote
		.produce_data(DataProducerOptions {
			id: Some(data_producer.id().to_string()),
			sctp_stream_parameters: pipe_data_consumer.sctp_stream_parameters().cloned(),
			label: pipe_data_consumer.label().to_string(),
			protocol: pipe_data_consumer.protocol().to_string(),
			paused: pipe_data_consumer.data_producer_paused(),
			app_data: data_producer.app_data(),
		})
		.await;
	let pipe_data_producer = match produced {
		Ok(pipe_data_producer) => pipe_data_producer,
		Err(e) => {
			pipe_data_consumer.close();
			return Err(e);
		}
	};

	if data_producer.closed() {
		pipe_data_consumer.close();
		pipe_data_producer.close();
		return Err(Error::InvalidState("original DataProducer closed".to_string()));
	}

	let weak_producer = pipe_data_producer.downgrade();
	pipe_data_consumer.observer().on_detached(move |event| {
		if let DataConsumerObserverEvent::Close = event {
			if let Some(pipe_data_producer) = weak_producer.upgrade() {
				pipe_data_producer.close();
			}
		}
	});

	let weak_consumer = pipe_data_consumer.downgrade();
	pipe_data_producer.observer().on_detached(move |event| {
		if let DataProducerObserverEvent::Close = event {
			if let Some(pipe_data_consumer) = weak_consumer.upgrade() {
				pipe_data_consumer.close();
			}
		}
	});

	Ok((pipe_data_consumer, pipe_data_producer))
}
