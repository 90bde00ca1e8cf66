//! Media worker runtime - process supervision, framed channel, and correlation
//!
//! This crate provides the low-level infrastructure for talking to the native
//! media worker:
//!
//! - **Binary location**: Finding the worker executable and its launch command
//! - **Process**: Spawning the worker with its channel on fds 3 and 4
//! - **Transport**: Length-prefixed frames over a pair of byte streams
//! - **Channel**: Request/response correlation and notification routing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   sfu-rs    │  Entities (Worker, Router, Transport, etc.)
//! └──────┬──────┘
//!        │ requests + notification subscriptions
//! ┌──────▼──────┐
//! │ sfu-runtime │  This crate
//! │  ┌────────┐ │
//! │  │Channel │ │  Correlation, notification dispatch
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  Framed pipes
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │Process │ │  Spawn, stdio relay, exit watch
//! │  └────────┘ │
//! └─────────────┘
//! ```

pub mod binary;
pub mod channel;
pub mod error;
pub mod process;
pub mod transport;

pub use binary::{WorkerCommand, worker_binary, worker_command};
pub use channel::{
	Channel, NotificationCallback, PendingSubscription, RequestIdGenerator, SubscriptionHandle,
	WORKER_LOG_TARGET,
};
pub use error::{Error, Result};
pub use process::{
	ProcessExit, ProcessHandle, ProcessSettings, SETTINGS_REJECTED_EXIT_CODE, SpawnedWorker,
	WorkerProcess,
};
pub use transport::{
	FrameDecoder, PipeTransport, PipeTransportReceiver, PipeTransportSender, Transport,
	TransportParts, TransportReceiver, encode_frame,
};
