//! Generic event handler infrastructure.
//!
//! Every entity owns two [`EventHandlers`] lists: its public events and its
//! observer events. Handlers are stored in an [`IndexMap`] for O(1) removal and
//! stable insertion order, and are unregistered by dropping the returned
//! [`Subscription`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Unique identifier for event handlers.
pub type HandlerId = u64;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a new globally-unique handler ID.
pub fn next_handler_id() -> HandlerId {
	NEXT_HANDLER_ID.fetch_add(1, Ordering::SeqCst)
}

/// Handler function invoked with a reference to the emitted event.
pub type HandlerFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handler storage.
pub type HandlerMap<E> = Arc<Mutex<IndexMap<HandlerId, HandlerFn<E>>>>;

/// List of handlers for one event enum.
pub struct EventHandlers<E> {
	handlers: HandlerMap<E>,
}

impl<E> Default for EventHandlers<E> {
	fn default() -> Self {
		Self {
			handlers: Arc::new(Mutex::new(IndexMap::new())),
		}
	}
}

impl<E: 'static> std::fmt::Debug for EventHandlers<E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventHandlers")
			.field("len", &self.len())
			.finish()
	}
}

impl<E: 'static> EventHandlers<E> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `handler`; it stays registered until the subscription is dropped.
	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&E) + Send + Sync + 'static,
	{
		let id = next_handler_id();
		self.handlers.lock().insert(id, Arc::new(handler));
		Subscription::from_handler_map(id, &self.handlers)
	}

	/// Registers `handler` for the lifetime of this list.
	pub(crate) fn on_detached<F>(&self, handler: F)
	where
		F: Fn(&E) + Send + Sync + 'static,
	{
		self.handlers.lock().insert(next_handler_id(), Arc::new(handler));
	}

	/// Invokes every handler with `event`.
	///
	/// Handlers run without the lock held, so they may register or drop
	/// subscriptions. A panicking handler is logged and does not stop the others.
	pub(crate) fn emit(&self, event: &E) {
		let handlers: Vec<HandlerFn<E>> = self.handlers.lock().values().cloned().collect();
		for handler in handlers {
			if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
				tracing::error!("event handler panicked");
			}
		}
	}

	pub fn len(&self) -> usize {
		self.handlers.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// RAII handle that unregisters an event handler on drop.
///
/// Holds a weak reference to the handler map, so dropping after the owning
/// entity is gone is a no-op.
pub struct Subscription {
	id: HandlerId,
	dropper: Option<Arc<dyn Fn(HandlerId) + Send + Sync>>,
}

impl Subscription {
	/// Creates a subscription with a custom dropper function.
	pub fn new(id: HandlerId, dropper: Arc<dyn Fn(HandlerId) + Send + Sync>) -> Self {
		Self {
			id,
			dropper: Some(dropper),
		}
	}

	/// Creates a subscription from a handler map using a weak reference.
	pub fn from_handler_map<E: 'static>(id: HandlerId, handlers: &HandlerMap<E>) -> Self {
		let weak: Weak<Mutex<IndexMap<HandlerId, HandlerFn<E>>>> = Arc::downgrade(handlers);
		let dropper = Arc::new(move |id: HandlerId| {
			if let Some(map) = weak.upgrade() {
				map.lock().shift_remove(&id);
			}
		});
		Self::new(id, dropper)
	}

	/// Returns this subscription's handler ID.
	pub fn id(&self) -> HandlerId {
		self.id
	}

	/// Explicitly unsubscribes. Equivalent to dropping.
	pub fn unsubscribe(mut self) {
		if let Some(dropper) = self.dropper.take() {
			(dropper)(self.id);
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(dropper) = self.dropper.take() {
			(dropper)(self.id);
		}
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("id", &self.id)
			.field("active", &self.dropper.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[derive(Debug, PartialEq)]
	enum TestEvent {
		Ping(u32),
	}

	#[test]
	fn test_handler_id_increments() {
		let id1 = next_handler_id();
		let id2 = next_handler_id();
		assert!(id2 > id1);
	}

	#[test]
	fn test_emit_reaches_handlers_in_order() {
		let handlers = EventHandlers::<TestEvent>::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		let first = Arc::clone(&seen);
		let _a = handlers.on(move |TestEvent::Ping(n)| first.lock().push(("a", *n)));
		let second = Arc::clone(&seen);
		let _b = handlers.on(move |TestEvent::Ping(n)| second.lock().push(("b", *n)));

		handlers.emit(&TestEvent::Ping(7));
		assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
	}

	#[test]
	fn test_subscription_drop_unregisters() {
		let handlers = EventHandlers::<TestEvent>::new();
		let count = Arc::new(AtomicUsize::new(0));

		let counter = Arc::clone(&count);
		let subscription = handlers.on(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		handlers.emit(&TestEvent::Ping(1));
		drop(subscription);
		handlers.emit(&TestEvent::Ping(2));

		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert!(handlers.is_empty());
	}

	#[test]
	fn test_subscription_unsubscribe() {
		let handlers = EventHandlers::<TestEvent>::new();
		let subscription = handlers.on(|_| {});
		assert_eq!(handlers.len(), 1);
		subscription.unsubscribe();
		assert_eq!(handlers.len(), 0);
	}

	#[test]
	fn test_subscription_outlives_handlers() {
		let handlers = EventHandlers::<TestEvent>::new();
		let subscription = handlers.on(|_| {});
		drop(handlers);
		// Weak reference: dropping now is a no-op.
		drop(subscription);
	}

	#[test]
	fn test_handler_may_subscribe_during_emit() {
		let handlers = Arc::new(EventHandlers::<TestEvent>::new());
		let nested = Arc::new(Mutex::new(Vec::new()));

		let inner_handlers = Arc::clone(&handlers);
		let inner_nested = Arc::clone(&nested);
		handlers.on_detached(move |_| {
			inner_nested.lock().push(inner_handlers.on(|_| {}));
		});

		handlers.emit(&TestEvent::Ping(1));
		assert_eq!(handlers.len(), 2);
	}

	#[test]
	fn test_panicking_handler_does_not_stop_others() {
		let handlers = EventHandlers::<TestEvent>::new();
		let count = Arc::new(AtomicUsize::new(0));

		let _panics = handlers.on(|_| panic!("boom"));
		let counter = Arc::clone(&count);
		let _counts = handlers.on(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});

		handlers.emit(&TestEvent::Ping(1));
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_debug_reports_handler_count() {
		let handlers = EventHandlers::<TestEvent>::new();
		let _a = handlers.on(|_| {});
		assert_eq!(format!("{:?}", handlers), "EventHandlers { len: 1 }");
	}
}
