//! Sharing of pipe transport pairs between routers.

mod common;

use common::{FakeWorker, eventually, rtp_parameters};
use sfu::{
	DataProducerOptions, Error, ListenInfo, MediaKind, PipeToRouterOptions, ProducerOptions,
	Router, RouterOptions, SctpStreamParameters, Transport, TransportKind, WebRtcTransportOptions,
	Worker,
};
use sfu_protocol::Method;

struct Setup {
	worker: Worker,
	fake: FakeWorker,
	router_a: Router,
	router_b: Router,
	transport: Transport,
}

async fn setup() -> Setup {
	let (worker, fake) = FakeWorker::start().await;
	let router_a = worker.create_router(RouterOptions::default()).await.unwrap();
	let router_b = worker.create_router(RouterOptions::default()).await.unwrap();
	let transport = router_a
		.create_webrtc_transport(WebRtcTransportOptions {
			enable_sctp: true,
			..WebRtcTransportOptions::new(vec![ListenInfo::udp("127.0.0.1")])
		})
		.await
		.unwrap();
	Setup {
		worker,
		fake,
		router_a,
		router_b,
		transport,
	}
}

fn pipe_transports(router: &Router) -> Vec<Transport> {
	router
		.transports()
		.into_iter()
		.filter(|transport| transport.kind() == TransportKind::Pipe)
		.collect()
}

#[tokio::test]
async fn test_pipe_producer_makes_it_available_in_target() {
	let Setup {
		fake,
		router_a,
		router_b,
		transport,
		worker: _worker,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Video, rtp_parameters()))
		.await
		.unwrap();

	let result = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await
		.unwrap();

	let pipe_producer = result.pipe_producer.unwrap();
	let pipe_consumer = result.pipe_consumer.unwrap();
	assert_eq!(pipe_producer.id(), producer.id());
	assert_eq!(pipe_consumer.producer_id(), producer.id());
	assert_eq!(router_b.get_producer(producer.id()).unwrap().id(), pipe_producer.id());

	let pair = result.pipe_transport_pair;
	let local = pair.for_router(router_a.id()).unwrap();
	let remote = pair.for_router(router_b.id()).unwrap();
	assert_eq!(local.kind(), TransportKind::Pipe);
	assert_ne!(local, remote);

	// Each end is connected to the other's tuple.
	let connects = fake.requests(Method::TransportConnect);
	assert_eq!(connects.len(), 2);
	let local_connect = connects
		.iter()
		.find(|request| request.handler_id == local.id())
		.unwrap();
	assert_eq!(
		local_connect.data.as_ref().unwrap()["port"],
		remote.tuple().unwrap().local_port
	);
}

#[tokio::test]
async fn test_concurrent_pipes_share_one_pair() {
	let Setup {
		worker: _worker,
		fake,
		router_a,
		router_b,
		transport,
	} = setup().await;
	let producer_1 = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();
	let producer_2 = transport
		.produce(ProducerOptions::new(MediaKind::Video, rtp_parameters()))
		.await
		.unwrap();

	let (first, second) = tokio::join!(
		router_a.pipe_to_router(PipeToRouterOptions::producer(producer_1.id(), router_b.clone())),
		router_a.pipe_to_router(PipeToRouterOptions::producer(producer_2.id(), router_b.clone())),
	);
	let (first, second) = (first.unwrap(), second.unwrap());

	assert_eq!(first.pipe_transport_pair, second.pipe_transport_pair);
	assert_eq!(fake.count(Method::RouterCreatePipeTransport), 2);
	assert_eq!(pipe_transports(&router_a).len(), 1);
	assert_eq!(pipe_transports(&router_b).len(), 1);
	assert_eq!(router_a.pipe_pair_count(), 1);
	assert_eq!(router_b.pipe_pair_count(), 1);

	// Piping back the other way reuses the same pair.
	let back_transport = router_b
		.create_webrtc_transport(WebRtcTransportOptions::new(vec![ListenInfo::udp("127.0.0.1")]))
		.await
		.unwrap();
	let producer_3 = back_transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();
	let back = router_b
		.pipe_to_router(PipeToRouterOptions::producer(producer_3.id(), router_a.clone()))
		.await
		.unwrap();
	assert_eq!(back.pipe_transport_pair, first.pipe_transport_pair);
	assert_eq!(fake.count(Method::RouterCreatePipeTransport), 2);
}

#[tokio::test]
async fn test_failed_pair_is_evicted_and_retried() {
	let Setup {
		fake,
		router_a,
		router_b,
		transport,
		worker: _worker,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();

	fake.reject(Method::TransportConnect);
	let result = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await;

	match result {
		Err(Error::PipeTransportPair(cause)) => {
			assert!(matches!(*cause, Error::Remote { .. }), "unexpected cause {:?}", cause)
		}
		other => panic!("Expected PipeTransportPair error, got {:?}", other),
	}
	assert_eq!(router_a.pipe_pair_count(), 0);
	assert_eq!(router_b.pipe_pair_count(), 0);
	assert!(pipe_transports(&router_a).is_empty());
	assert!(pipe_transports(&router_b).is_empty());

	fake.accept(Method::TransportConnect);
	let retried = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await
		.unwrap();

	assert!(retried.pipe_producer.is_some());
	assert_eq!(fake.count(Method::RouterCreatePipeTransport), 4);
	assert_eq!(router_a.pipe_pair_count(), 1);
}

#[tokio::test]
async fn test_closing_one_end_closes_the_pair() {
	let Setup {
		router_a,
		router_b,
		transport,
		worker: _worker,
		fake: _fake,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();
	let result = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await
		.unwrap();
	let pair = result.pipe_transport_pair;
	let pipe_producer = result.pipe_producer.unwrap();

	pair.for_router(router_a.id()).unwrap().close();

	assert!(pair.for_router(router_b.id()).unwrap().closed());
	assert!(pipe_producer.closed());
	assert_eq!(router_a.pipe_pair_count(), 0);
	assert_eq!(router_b.pipe_pair_count(), 0);
	assert!(!producer.closed());
}

#[tokio::test]
async fn test_source_producer_close_propagates_to_pipe_producer() {
	let Setup {
		router_a,
		router_b,
		transport,
		worker: _worker,
		fake: _fake,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();
	let result = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await
		.unwrap();
	let pipe_consumer = result.pipe_consumer.unwrap();
	let pipe_producer = result.pipe_producer.unwrap();

	producer.close();

	assert!(pipe_consumer.closed());
	assert!(pipe_producer.closed());
	assert!(router_b.get_producer(producer.id()).is_none());
	// The pair itself stays up for later pipes.
	assert_eq!(router_a.pipe_pair_count(), 1);
}

#[tokio::test]
async fn test_pipe_producer_mirrors_pause() {
	let Setup {
		fake,
		router_a,
		router_b,
		transport,
		worker: _worker,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();
	let result = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await
		.unwrap();
	let pipe_consumer = result.pipe_consumer.unwrap();
	let pipe_producer = result.pipe_producer.unwrap();

	fake.notify(pipe_consumer.id(), "producerpause", serde_json::Value::Null);
	eventually(|| pipe_producer.paused()).await;

	fake.notify(pipe_consumer.id(), "producerresume", serde_json::Value::Null);
	eventually(|| !pipe_producer.paused()).await;
}

#[tokio::test]
async fn test_pipe_data_producer() {
	let Setup {
		router_a,
		router_b,
		transport,
		worker: _worker,
		fake: _fake,
	} = setup().await;
	let data_producer = transport
		.produce_data(DataProducerOptions {
			sctp_stream_parameters: Some(SctpStreamParameters::ordered(1)),
			label: "events".to_string(),
			..Default::default()
		})
		.await
		.unwrap();

	let result = router_a
		.pipe_to_router(PipeToRouterOptions::data_producer(data_producer.id(), router_b.clone()))
		.await
		.unwrap();

	let pipe_data_producer = result.pipe_data_producer.unwrap();
	assert!(result.pipe_producer.is_none());
	assert_eq!(pipe_data_producer.id(), data_producer.id());
	assert_eq!(pipe_data_producer.label(), "events");
	assert!(router_b.get_data_producer(data_producer.id()).is_some());

	data_producer.close();
	assert!(result.pipe_data_consumer.unwrap().closed());
	assert!(pipe_data_producer.closed());
}

#[tokio::test]
async fn test_pipe_to_router_argument_errors() {
	let Setup {
		router_a,
		router_b,
		transport,
		worker: _worker,
		fake: _fake,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();

	let both = PipeToRouterOptions {
		data_producer_id: Some("x".to_string()),
		..PipeToRouterOptions::producer(producer.id(), router_b.clone())
	};
	assert!(matches!(
		router_a.pipe_to_router(both).await,
		Err(Error::InvalidArgument(_))
	));

	let neither = PipeToRouterOptions {
		producer_id: None,
		..PipeToRouterOptions::producer(producer.id(), router_b.clone())
	};
	assert!(matches!(
		router_a.pipe_to_router(neither).await,
		Err(Error::InvalidArgument(_))
	));

	let unknown = PipeToRouterOptions::producer("missing", router_b.clone());
	assert!(matches!(
		router_a.pipe_to_router(unknown).await,
		Err(Error::NotFound { .. })
	));

	let same = PipeToRouterOptions::producer(producer.id(), router_a.clone());
	assert!(matches!(
		router_a.pipe_to_router(same).await,
		Err(Error::InvalidArgument(_))
	));

	router_b.close();
	let closed = PipeToRouterOptions::producer(producer.id(), router_b.clone());
	assert!(matches!(
		router_a.pipe_to_router(closed).await,
		Err(Error::InvalidState(_))
	));
	assert_eq!(router_a.pipe_pair_count(), 0);
}

#[tokio::test]
async fn test_router_close_forgets_pairs() {
	let Setup {
		router_a,
		router_b,
		transport,
		worker: _worker,
		fake: _fake,
	} = setup().await;
	let producer = transport
		.produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
		.await
		.unwrap();
	let result = router_a
		.pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
		.await
		.unwrap();

	router_b.close();

	assert!(result.pipe_transport_pair.for_router(router_a.id()).unwrap().closed());
	assert_eq!(router_a.pipe_pair_count(), 0);
	assert!(!router_a.closed());
}
