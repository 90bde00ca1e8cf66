//! Request/response correlation and notification routing over a worker transport.
//!
//! # Message Flow
//!
//! 1. Caller invokes [`Channel::request`] with a method, handler id and body
//! 2. The channel assigns a nonzero id and registers a one-shot completion
//! 3. The encoded request is handed to the writer task; write errors come back
//!    to the caller
//! 4. The message loop decodes each incoming payload: responses complete their
//!    pending entry, notifications go to the dispatcher task, log lines go to
//!    `tracing`
//! 5. The dispatcher delivers the notification to the subscribers of its
//!    target
//!
//! Entities are created under ids chosen before the create request is sent.
//! [`Channel::buffer_notifications`] subscribes such an id up front and queues
//! whatever arrives until the entity attaches its handler, so a notification
//! that follows the create response is never lost.
//!
//! Closing the channel, or the worker's output stream ending, rejects every
//! pending request with [`Error::ChannelClosed`].

mod subscriptions;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use sfu_protocol::{Message, Method, Notification, PayloadTag, Request, Response};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

pub use subscriptions::{NotificationCallback, PendingSubscription, SubscriptionHandle};
use subscriptions::Subscriptions;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, check_payload_len};

/// `tracing` target for log lines relayed from the worker.
pub const WORKER_LOG_TARGET: &str = "sfu::worker";

/// Generates request ids: a wrapping `u32` counter that never yields 0.
#[derive(Debug)]
pub struct RequestIdGenerator {
	last: AtomicU32,
}

impl Default for RequestIdGenerator {
	fn default() -> Self {
		Self::starting_after(0)
	}
}

impl RequestIdGenerator {
	/// Creates a generator whose first id follows `last`.
	pub fn starting_after(last: u32) -> Self {
		Self {
			last: AtomicU32::new(last),
		}
	}

	pub fn next_id(&self) -> u32 {
		let step = |id: u32| match id.wrapping_add(1) {
			0 => 1,
			next => next,
		};
		let previous = self
			.last
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(step(id)))
			.unwrap_or_else(|id| id);
		step(previous)
	}
}

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

/// Removes the pending entry if the request future is dropped before completion.
struct CancelGuard {
	id: u32,
	pending: PendingMap,
	completed: bool,
}

impl CancelGuard {
	fn new(id: u32, pending: PendingMap) -> Self {
		Self {
			id,
			pending,
			completed: false,
		}
	}

	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		if self.pending.lock().remove(&self.id).is_some() {
			tracing::debug!(id = self.id, "CancelGuard: removed abandoned request");
		}
	}
}

/// Future awaiting the response of one request.
struct ResponseFuture {
	rx: oneshot::Receiver<Result<Value>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Encoded request on its way to the writer task.
struct OutboundFrame {
	payload: Vec<u8>,
	written: oneshot::Sender<Result<()>>,
}

/// Transport halves waiting for [`Channel::start`].
struct Unstarted {
	parts: TransportParts,
	outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

struct ChannelInner {
	pid: u32,
	ids: RequestIdGenerator,
	pending: PendingMap,
	outbound_tx: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
	unstarted: Mutex<Option<Unstarted>>,
	subscriptions: Arc<Subscriptions>,
	closed: AtomicBool,
	runtime: Handle,
}

/// Control channel to one worker process.
///
/// Cheap to clone; all clones share the same pending table and subscriptions.
#[derive(Clone)]
pub struct Channel {
	inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Channel")
			.field("pid", &self.inner.pid)
			.field("closed", &self.is_closed())
			.field("pending", &self.pending_count())
			.finish()
	}
}

impl Channel {
	/// Creates a channel over `parts` for the worker with the given pid.
	///
	/// Nothing is read or written until [`Channel::start`]; subscribe to early
	/// notifications (such as the worker's `running`) before starting. Must be
	/// called from within a tokio runtime.
	pub fn new(parts: TransportParts, pid: u32) -> Result<Self> {
		let runtime = Handle::try_current()
			.map_err(|e| Error::InvalidState(format!("Channel requires a tokio runtime: {}", e)))?;
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		Ok(Self {
			inner: Arc::new(ChannelInner {
				pid,
				ids: RequestIdGenerator::default(),
				pending: Arc::new(Mutex::new(HashMap::new())),
				outbound_tx: Mutex::new(Some(outbound_tx)),
				unstarted: Mutex::new(Some(Unstarted { parts, outbound_rx })),
				subscriptions: Arc::new(Subscriptions::default()),
				closed: AtomicBool::new(false),
				runtime,
			}),
		})
	}

	/// Spawns the reader, writer, message loop and notification dispatcher tasks.
	pub fn start(&self) -> Result<()> {
		let Unstarted {
			parts,
			mut outbound_rx,
		} = self
			.inner
			.unstarted
			.lock()
			.take()
			.ok_or_else(|| Error::InvalidState("Channel already started".to_string()))?;

		let TransportParts {
			mut sender,
			receiver,
			mut message_rx,
		} = parts;

		let pid = self.inner.pid;
		let runtime = &self.inner.runtime;

		runtime.spawn(async move {
			if let Err(e) = receiver.run().await {
				tracing::error!(pid, "Channel read error: {}", e);
			}
		});

		runtime.spawn(async move {
			while let Some(frame) = outbound_rx.recv().await {
				let result = write_frame(sender.as_mut(), frame.payload).await;
				if let Err(e) = &result {
					tracing::error!(pid, "Channel write error: {}", e);
				}
				let _ = frame.written.send(result);
			}
			tracing::debug!(pid, "Channel writer finished");
		});

		let (notification_tx, mut notification_rx) = mpsc::unbounded_channel::<Notification>();
		let subscriptions = Arc::clone(&self.inner.subscriptions);
		runtime.spawn(async move {
			while let Some(notification) = notification_rx.recv().await {
				if !subscriptions.dispatch(&notification) {
					tracing::debug!(
						"Notification for unknown target (ignored): target_id={}, event={:?}",
						notification.target_id,
						notification.event
					);
				}
			}
		});

		let weak = Arc::downgrade(&self.inner);
		runtime.spawn(async move {
			while let Some(payload) = message_rx.recv().await {
				handle_payload(&weak, pid, &payload, &notification_tx);
			}
			tracing::debug!(pid, "Channel message loop finished");
			if let Some(inner) = weak.upgrade() {
				Channel { inner }.close();
			}
		});

		Ok(())
	}

	/// Pid of the worker on the other end.
	pub fn pid(&self) -> u32 {
		self.inner.pid
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::Acquire)
	}

	/// Number of requests awaiting a response.
	pub fn pending_count(&self) -> usize {
		self.inner.pending.lock().len()
	}

	/// Number of targets with at least one notification subscriber.
	pub fn subscribed_targets(&self) -> usize {
		self.inner.subscriptions.len()
	}

	/// Sends a request and awaits its response.
	///
	/// Resolves with the response `data` (or `null`), [`Error::Remote`] if the
	/// worker rejected it, [`Error::RequestTooLarge`] if it does not fit in a
	/// frame, or [`Error::ChannelClosed`] if the channel closes first.
	pub async fn request(
		&self,
		method: Method,
		handler_id: impl Into<String>,
		data: Option<Value>,
	) -> Result<Value> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}

		let id = self.inner.ids.next_id();
		let request = Request {
			id,
			method,
			handler_id: handler_id.into(),
			data,
		};

		tracing::debug!(
			"request() [method:{}, id:{}, handler_id:{}]",
			request.method,
			id,
			request.handler_id
		);

		let payload = serde_json::to_vec(&request)?;
		check_payload_len(payload.len())?;

		let (tx, rx) = oneshot::channel();
		{
			let mut pending = self.inner.pending.lock();
			if self.is_closed() {
				return Err(Error::ChannelClosed);
			}
			pending.insert(id, tx);
		}
		let guard = CancelGuard::new(id, Arc::clone(&self.inner.pending));

		let (written_tx, written_rx) = oneshot::channel();
		let queued = self.inner.outbound_tx.lock().as_ref().is_some_and(|outbound| {
			outbound
				.send(OutboundFrame {
					payload,
					written: written_tx,
				})
				.is_ok()
		});
		if !queued {
			return Err(Error::ChannelClosed);
		}

		written_rx.await.map_err(|_| Error::ChannelClosed)??;

		ResponseFuture { rx, guard }.await
	}

	/// Sends a request without awaiting it; failures are logged.
	pub fn request_detached(&self, method: Method, handler_id: impl Into<String>, data: Option<Value>) {
		let channel = self.clone();
		let handler_id = handler_id.into();
		self.inner.runtime.spawn(async move {
			if let Err(e) = channel.request(method, handler_id.as_str(), data).await {
				tracing::debug!("{} request failed [handler_id:{}]: {}", method, handler_id, e);
			}
		});
	}

	/// Subscribes `callback` to notifications targeted at `target_id`.
	pub fn subscribe_to_notifications<F>(&self, target_id: impl Into<String>, callback: F) -> SubscriptionHandle
	where
		F: Fn(&Notification) + Send + Sync + 'static,
	{
		self.inner
			.subscriptions
			.subscribe(target_id.into(), Arc::new(callback))
	}

	/// Subscribes `target_id` now and queues its notifications until
	/// [`PendingSubscription::attach`].
	pub fn buffer_notifications(&self, target_id: impl Into<String>) -> PendingSubscription {
		PendingSubscription::new(&self.inner.subscriptions, target_id.into())
	}

	/// Closes the channel, rejecting every pending request. Idempotent.
	///
	/// The request stream to the worker is shut once the writer drains, which
	/// the worker treats as a request to exit.
	pub fn close(&self) {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		tracing::debug!(pid = self.inner.pid, "close()");

		self.inner.outbound_tx.lock().take();

		let drained: Vec<_> = self.inner.pending.lock().drain().collect();
		for (_, tx) in drained {
			let _ = tx.send(Err(Error::ChannelClosed));
		}
	}

	fn handle_response(&self, response: Response) {
		let Some(tx) = self.inner.pending.lock().remove(&response.id) else {
			tracing::warn!(
				"received response does not match any sent request [id:{}]",
				response.id
			);
			return;
		};

		let result = if response.accepted {
			Ok(response.data.unwrap_or(Value::Null))
		} else if let Some(error) = response.error.as_deref() {
			tracing::warn!(
				"request failed [id:{}]: {}",
				response.id,
				response.reason.as_deref().unwrap_or_default()
			);
			Err(Error::remote(Some(error), response.reason.as_deref()))
		} else {
			tracing::error!(
				"received response is not accepted nor rejected [id:{}]",
				response.id
			);
			Err(Error::ProtocolError(format!(
				"response {} is neither accepted nor rejected",
				response.id
			)))
		};

		let _ = tx.send(result);
	}
}

async fn write_frame(sender: &mut dyn Transport, payload: Vec<u8>) -> Result<()> {
	sender.send(payload).await
}

fn handle_payload(
	channel: &Weak<ChannelInner>,
	pid: u32,
	payload: &[u8],
	notifications: &mpsc::UnboundedSender<Notification>,
) {
	let tag = PayloadTag::of(payload);
	match tag {
		PayloadTag::Json => match Message::from_slice(payload) {
			Ok(Message::Response(response)) => {
				if let Some(inner) = channel.upgrade() {
					Channel { inner }.handle_response(response);
				}
			}
			Ok(Message::Notification(notification)) => {
				let _ = notifications.send(notification);
			}
			Ok(Message::Unknown(value)) => {
				tracing::error!("received message is not a response nor a notification: {}", value);
			}
			Err(e) => {
				tracing::error!(
					"received invalid message from the worker process: {} [payload:{}]",
					e,
					String::from_utf8_lossy(payload)
				);
			}
		},
		PayloadTag::DebugLog | PayloadTag::WarnLog | PayloadTag::ErrorLog | PayloadTag::Dump => {
			log_worker_line(pid, tag, &String::from_utf8_lossy(&payload[1..]));
		}
		PayloadTag::Unexpected => {
			tracing::error!(
				target: WORKER_LOG_TARGET,
				pid,
				"unexpected data: {}",
				String::from_utf8_lossy(payload)
			);
		}
	}
}

fn log_worker_line(pid: u32, tag: PayloadTag, line: &str) {
	match tag {
		PayloadTag::DebugLog => tracing::debug!(target: WORKER_LOG_TARGET, pid, "{}", line),
		PayloadTag::WarnLog => tracing::warn!(target: WORKER_LOG_TARGET, pid, "{}", line),
		PayloadTag::ErrorLog => tracing::error!(target: WORKER_LOG_TARGET, pid, "{}", line),
		// Dumps are meant for a human at the console.
		PayloadTag::Dump => println!("{}", line),
		PayloadTag::Json | PayloadTag::Unexpected => {}
	}
}
