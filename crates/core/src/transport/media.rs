//! Producing and consuming on a transport.

use serde::Deserialize;
use serde_json::json;
use sfu_protocol::Method;
use sfu_runtime::{Error, Result};

use super::{Transport, TransportKind, TransportObserverEvent};
use crate::consumer::{Consumer, ConsumerArgs, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerArgs, DataConsumerOptions};
use crate::data_producer::{DataProducer, DataProducerArgs, DataProducerOptions};
use crate::data_structures::{
	ConsumerLayers, ConsumerScore, ConsumerType, DataProducerType, ProducerType, SctpStreamParameters,
};
use crate::entity::{generate_id, response_data};
use crate::producer::{Producer, ProducerArgs, ProducerOptions};
use crate::router::Router;

impl Transport {
	fn live_router(&self) -> Result<Router> {
		self.inner
			.router
			.upgrade()
			.filter(|router| !router.closed())
			.ok_or_else(|| Error::InvalidState("Router closed".to_string()))
	}

	/// Injects media into the router.
	pub async fn produce(&self, options: ProducerOptions) -> Result<Producer> {
		tracing::debug!("produce()");
		self.inner.core.ensure_open()?;
		let router = self.live_router()?;

		let id = options.id.unwrap_or_else(generate_id);
		if router.get_producer(&id).is_some() {
			return Err(Error::InvalidArgument(format!("a Producer with same id {:?} already exists", id)));
		}

		let notifications = self.inner.channel.buffer_notifications(&id);
		let data = self
			.inner
			.channel
			.request(
				Method::TransportProduce,
				self.id(),
				Some(json!({
					"producerId": id,
					"kind": options.kind,
					"rtpParameters": options.rtp_parameters,
					"rtpMapping": options.rtp_mapping,
					"keyFrameRequestDelay": options.key_frame_request_delay,
					"paused": options.paused,
				})),
			)
			.await?;

		#[derive(Default, Deserialize)]
		#[serde(default)]
		struct ProduceData {
			#[serde(rename = "type")]
			producer_type: ProducerType,
		}
		let ProduceData { producer_type } = response_data(data)?;
		let producer_type = if self.inner.kind == TransportKind::Pipe {
			ProducerType::Pipe
		} else {
			producer_type
		};

		let producer = Producer::new(ProducerArgs {
			id,
			kind: options.kind,
			producer_type,
			rtp_parameters: options.rtp_parameters,
			paused: options.paused,
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			transport: self.downgrade(),
			router: router.downgrade(),
		});

		{
			let mut children = self.inner.children.lock();
			if self.closed() {
				drop(children);
				producer.transport_closed();
				return Err(Error::InvalidState("Transport closed".to_string()));
			}
			children.producers.insert(producer.id().to_string(), producer.clone());
		}
		if !router.register_producer(&producer) {
			producer.close();
			return Err(Error::InvalidState("Router closed".to_string()));
		}

		self.inner
			.observer
			.emit(&TransportObserverEvent::NewProducer(producer.clone()));
		producer.listen(notifications);
		Ok(producer)
	}

	/// Forwards a producer of the same router to this transport's endpoint.
	pub async fn consume(&self, options: ConsumerOptions) -> Result<Consumer> {
		tracing::debug!("consume()");
		self.inner.core.ensure_open()?;
		let router = self.live_router()?;

		let producer = router
			.get_producer(&options.producer_id)
			.ok_or_else(|| Error::NotFound {
				kind: "Producer",
				id: options.producer_id.clone(),
			})?;

		let consumer_type = if self.inner.kind == TransportKind::Pipe || options.pipe {
			ConsumerType::Pipe
		} else {
			ConsumerType::from(producer.producer_type())
		};

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		let rtp_parameters = producer.rtp_parameters().clone();
		let mut request = json!({
			"consumerId": id,
			"producerId": producer.id(),
			"kind": producer.kind(),
			"rtpParameters": rtp_parameters,
			"rtpCapabilities": options.rtp_capabilities,
			"type": consumer_type,
			"paused": options.paused,
			"preferredLayers": options.preferred_layers,
			"ignoreDtx": options.ignore_dtx,
		});
		if let Some(mid) = &options.mid {
			request["mid"] = json!(mid);
		}
		if let Some(enable_rtx) = options.enable_rtx {
			request["enableRtx"] = json!(enable_rtx);
		}

		let data = self
			.inner
			.channel
			.request(Method::TransportConsume, self.id(), Some(request))
			.await?;

		#[derive(Default, Deserialize)]
		#[serde(default, rename_all = "camelCase")]
		struct ConsumeData {
			paused: bool,
			producer_paused: bool,
			score: Option<ConsumerScore>,
			preferred_layers: Option<ConsumerLayers>,
		}
		let response: ConsumeData = response_data(data)?;

		let consumer = Consumer::new(ConsumerArgs {
			id,
			producer_id: producer.id().to_string(),
			kind: producer.kind(),
			consumer_type,
			rtp_parameters,
			paused: response.paused,
			producer_paused: response.producer_paused,
			score: response.score.unwrap_or_default(),
			preferred_layers: response.preferred_layers.or(options.preferred_layers),
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			transport: self.downgrade(),
			router: router.downgrade(),
		});

		{
			let mut children = self.inner.children.lock();
			if self.closed() {
				drop(children);
				consumer.transport_closed();
				return Err(Error::InvalidState("Transport closed".to_string()));
			}
			children.consumers.insert(consumer.id().to_string(), consumer.clone());
		}
		if !router.register_consumer(&consumer) {
			consumer.producer_closed();
			return Err(Error::InvalidState("Producer closed".to_string()));
		}

		self.inner
			.observer
			.emit(&TransportObserverEvent::NewConsumer(consumer.clone()));
		consumer.listen(notifications);
		Ok(consumer)
	}

	/// Injects data messages into the router.
	pub async fn produce_data(&self, options: DataProducerOptions) -> Result<DataProducer> {
		tracing::debug!("produce_data()");
		self.inner.core.ensure_open()?;
		let router = self.live_router()?;

		let id = options.id.unwrap_or_else(generate_id);
		if router.get_data_producer(&id).is_some() {
			return Err(Error::InvalidArgument(format!(
				"a DataProducer with same id {:?} already exists",
				id
			)));
		}

		let (data_producer_type, sctp_stream_parameters) = if self.inner.kind == TransportKind::Direct {
			if options.sctp_stream_parameters.is_some() {
				tracing::warn!("produce_data() | sctp_stream_parameters are ignored on a direct transport");
			}
			(DataProducerType::Direct, None)
		} else {
			let params = options.sctp_stream_parameters.ok_or_else(|| {
				Error::InvalidArgument("missing sctp_stream_parameters".to_string())
			})?;
			(DataProducerType::Sctp, Some(params))
		};

		self.inner
			.channel
			.request(
				Method::TransportProduceData,
				self.id(),
				Some(json!({
					"dataProducerId": id,
					"type": data_producer_type,
					"sctpStreamParameters": sctp_stream_parameters,
					"label": options.label,
					"protocol": options.protocol,
					"paused": options.paused,
				})),
			)
			.await?;

		let data_producer = DataProducer::new(DataProducerArgs {
			id,
			data_producer_type,
			sctp_stream_parameters,
			label: options.label,
			protocol: options.protocol,
			paused: options.paused,
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			transport: self.downgrade(),
			router: router.downgrade(),
		});

		{
			let mut children = self.inner.children.lock();
			if self.closed() {
				drop(children);
				data_producer.transport_closed();
				return Err(Error::InvalidState("Transport closed".to_string()));
			}
			children
				.data_producers
				.insert(data_producer.id().to_string(), data_producer.clone());
		}
		if !router.register_data_producer(&data_producer) {
			data_producer.close();
			return Err(Error::InvalidState("Router closed".to_string()));
		}

		self.inner
			.observer
			.emit(&TransportObserverEvent::NewDataProducer(data_producer.clone()));
		Ok(data_producer)
	}

	/// Forwards a data producer of the same router to this transport's endpoint.
	pub async fn consume_data(&self, options: DataConsumerOptions) -> Result<DataConsumer> {
		tracing::debug!("consume_data()");
		self.inner.core.ensure_open()?;
		let router = self.live_router()?;

		let data_producer = router
			.get_data_producer(&options.data_producer_id)
			.ok_or_else(|| Error::NotFound {
				kind: "DataProducer",
				id: options.data_producer_id.clone(),
			})?;

		let (data_consumer_type, sctp_stream_parameters) = if self.inner.kind == TransportKind::Direct {
			(DataProducerType::Direct, None)
		} else {
			let stream_id = self.allocate_sctp_stream_id()?;
			let mut params = data_producer
				.sctp_stream_parameters()
				.cloned()
				.unwrap_or_else(|| SctpStreamParameters::ordered(stream_id));
			params.stream_id = stream_id;
			if let Some(ordered) = options.ordered {
				params.ordered = ordered;
			}
			if options.max_packet_life_time.is_some() {
				params.max_packet_life_time = options.max_packet_life_time;
			}
			if options.max_retransmits.is_some() {
				params.max_retransmits = options.max_retransmits;
			}
			(DataProducerType::Sctp, Some(params))
		};

		let id = generate_id();
		let notifications = self.inner.channel.buffer_notifications(&id);
		let result = self
			.inner
			.channel
			.request(
				Method::TransportConsumeData,
				self.id(),
				Some(json!({
					"dataConsumerId": id,
					"dataProducerId": data_producer.id(),
					"type": data_consumer_type,
					"sctpStreamParameters": sctp_stream_parameters,
					"label": data_producer.label(),
					"protocol": data_producer.protocol(),
					"paused": options.paused,
					"subchannels": options.subchannels,
				})),
			)
			.await;
		let data = match result {
			Ok(data) => data,
			Err(e) => {
				if let Some(params) = &sctp_stream_parameters {
					self.inner.children.lock().sctp_stream_ids.remove(&params.stream_id);
				}
				return Err(e);
			}
		};

		#[derive(Default, Deserialize)]
		#[serde(default, rename_all = "camelCase")]
		struct ConsumeDataData {
			paused: bool,
			data_producer_paused: bool,
			subchannels: Option<Vec<u16>>,
		}
		let response: ConsumeDataData = response_data(data)?;
		let mut subchannels = response
			.subchannels
			.or(options.subchannels)
			.unwrap_or_default();
		subchannels.sort_unstable();
		subchannels.dedup();

		let data_consumer = DataConsumer::new(DataConsumerArgs {
			id,
			data_producer_id: data_producer.id().to_string(),
			data_consumer_type,
			sctp_stream_parameters,
			label: data_producer.label().to_string(),
			protocol: data_producer.protocol().to_string(),
			paused: response.paused,
			data_producer_paused: response.data_producer_paused,
			subchannels,
			app_data: options.app_data,
			channel: self.inner.channel.clone(),
			transport: self.downgrade(),
			router: router.downgrade(),
		});

		{
			let mut children = self.inner.children.lock();
			if self.closed() {
				drop(children);
				data_consumer.transport_closed();
				return Err(Error::InvalidState("Transport closed".to_string()));
			}
			children
				.data_consumers
				.insert(data_consumer.id().to_string(), data_consumer.clone());
		}
		if !router.register_data_consumer(&data_consumer) {
			data_consumer.data_producer_closed();
			return Err(Error::InvalidState("DataProducer closed".to_string()));
		}

		self.inner
			.observer
			.emit(&TransportObserverEvent::NewDataConsumer(data_consumer.clone()));
		data_consumer.listen(notifications);
		Ok(data_consumer)
	}

	/// Reserves the lowest SCTP stream id not held by another data consumer.
	fn allocate_sctp_stream_id(&self) -> Result<u16> {
		let max = self
			.inner
			.sctp_streams
			.ok_or_else(|| Error::InvalidState("SCTP not enabled on this transport".to_string()))?;

		let mut children = self.inner.children.lock();
		let stream_id = (0..max)
			.find(|id| !children.sctp_stream_ids.contains(id))
			.ok_or_else(|| Error::InvalidState("no sctp stream id available".to_string()))?;
		children.sctp_stream_ids.insert(stream_id);
		Ok(stream_id)
	}
}
