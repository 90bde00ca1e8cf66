//! sfu: control-plane client for a native media worker
//!
//! This crate spawns the media worker process and mirrors its state as an
//! in-process entity graph. Every entity is a cheap, cloneable handle; closing
//! a parent closes everything it owns.
//!
//! # Examples
//!
//! ## Piping a producer between routers
//!
//! ```ignore
//! use sfu::{
//!     ListenInfo, MediaKind, PipeToRouterOptions, ProducerOptions, RouterOptions,
//!     WebRtcTransportOptions, Worker, WorkerSettings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let worker = Worker::new(WorkerSettings::default()).await?;
//!     let router_a = worker.create_router(RouterOptions::default()).await?;
//!     let router_b = worker.create_router(RouterOptions::default()).await?;
//!
//!     let transport = router_a
//!         .create_webrtc_transport(WebRtcTransportOptions::new(vec![ListenInfo::udp("127.0.0.1")]))
//!         .await?;
//!     let producer = transport
//!         .produce(ProducerOptions::new(MediaKind::Audio, rtp_parameters()))
//!         .await?;
//!
//!     // The producer's id is now also known to router_b.
//!     router_a
//!         .pipe_to_router(PipeToRouterOptions::producer(producer.id(), router_b.clone()))
//!         .await?;
//!
//!     worker.close();
//!     Ok(())
//! }
//! ```
//!
//! # Entity graph
//!
//! ```text
//! Worker
//! ├── WebRtcServer
//! └── Router
//!     ├── RtpObserver
//!     └── Transport (WebRTC, plain, pipe, direct)
//!         ├── Producer       ◄─┐ by id, through the router
//!         ├── Consumer       ──┘
//!         ├── DataProducer   ◄─┐
//!         └── DataConsumer   ──┘
//! ```
//!
//! Each entity exposes two event lists: `on(...)` for its public events
//! (`RouterClose`, `Score`, ...) and `observer().on(...)` for bookkeeping
//! events (`Close`, `NewTransport`, ...).

pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod data_structures;
mod entity;
pub mod events;
pub mod producer;
pub mod router;
pub mod rtp_observer;
pub mod transport;
pub mod webrtc_server;
pub mod worker;

pub use consumer::{Consumer, ConsumerEvent, ConsumerObserverEvent, ConsumerOptions};
pub use data_consumer::{
	DataConsumer, DataConsumerEvent, DataConsumerObserverEvent, DataConsumerOptions, DataMessage,
};
pub use data_producer::{
	DataProducer, DataProducerEvent, DataProducerObserverEvent, DataProducerOptions,
};
pub use data_structures::{
	AppData, ConsumerLayers, ConsumerScore, ConsumerType, DataProducerType, DtlsState, IceState,
	ListenInfo, MediaKind, NumSctpStreams, ProducerScore, ProducerType, Protocol, RtpTraceEventType,
	SctpState, SctpStreamParameters, TraceEventData, TransportTraceEventType, TransportTuple,
};
pub use events::{EventHandlers, HandlerId, Subscription};
pub use producer::{Producer, ProducerEvent, ProducerObserverEvent, ProducerOptions, VideoOrientation};
pub use router::{
	PipeToRouterOptions, PipeToRouterResult, PipeTransportPair, Router, RouterEvent,
	RouterObserverEvent, RouterOptions,
};
pub use rtp_observer::{
	ActiveSpeakerObserverOptions, AudioLevelObserverOptions, AudioLevelVolume, RtpObserver,
	RtpObserverEvent, RtpObserverKind, RtpObserverObserverEvent,
};
pub use sfu_protocol::{WorkerLogLevel, WorkerLogTag};
pub use sfu_runtime::{Error, ProcessExit, Result, TransportParts};
pub use transport::{
	DirectTransportOptions, PipeTransportOptions, PlainTransportOptions, Transport, TransportEvent,
	TransportKind, TransportObserverEvent, TransportState, WebRtcTransportListen, WebRtcTransportOptions,
};
pub use webrtc_server::{
	WebRtcServer, WebRtcServerEvent, WebRtcServerObserverEvent, WebRtcServerOptions,
};
pub use worker::{
	Worker, WorkerEvent, WorkerObserverEvent, WorkerResourceUsage, WorkerSettings,
	WorkerUpdateSettings,
};
