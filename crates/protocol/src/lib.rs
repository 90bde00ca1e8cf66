//! Wire types for the media worker control channel.
//!
//! This crate contains the serde-serializable types exchanged with the worker
//! process over its length-prefixed control channel. These types represent
//! the "protocol layer": the shapes of data as they appear on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization and classification
//! - **1:1 with protocol**: Method and event names match what the worker expects
//! - **Stable**: Changes only when the wire protocol changes
//!
//! Framing, correlation and entity lifecycle live in `sfu-runtime` and `sfu-rs`.

pub mod event;
pub mod frame;
pub mod message;
pub mod method;
pub mod settings;

pub use event::Event;
pub use frame::{FRAME_HEADER_LEN, PAYLOAD_MAX_LEN, PayloadTag};
pub use message::{Message, Notification, RemoteErrorKind, Request, Response};
pub use method::Method;
pub use settings::{WorkerLogLevel, WorkerLogTag};
