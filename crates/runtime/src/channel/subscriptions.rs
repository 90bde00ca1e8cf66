//! Per-target notification subscriptions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use sfu_protocol::Notification;

/// Callback invoked for every notification addressed to a subscribed target.
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Registry mapping target ids to their notification callbacks.
///
/// A target may have several subscribers: piped producers share the id of
/// their source producer.
#[derive(Default)]
pub(crate) struct Subscriptions {
	next_key: AtomicU64,
	targets: DashMap<String, Vec<(u64, NotificationCallback)>>,
}

impl Subscriptions {
	pub(crate) fn subscribe(
		self: &Arc<Self>,
		target_id: String,
		callback: NotificationCallback,
	) -> SubscriptionHandle {
		let key = self.next_key.fetch_add(1, Ordering::Relaxed);
		self.targets
			.entry(target_id.clone())
			.or_default()
			.push((key, callback));

		SubscriptionHandle {
			target_id,
			key,
			subscriptions: Arc::downgrade(self),
		}
	}

	/// Delivers `notification` to every subscriber of its target.
	///
	/// Returns false if nobody is subscribed.
	pub(crate) fn dispatch(&self, notification: &Notification) -> bool {
		// Callbacks may subscribe or unsubscribe, so the shard lock is released first.
		let callbacks: Vec<NotificationCallback> = match self.targets.get(&notification.target_id) {
			Some(entry) => entry.iter().map(|(_, callback)| Arc::clone(callback)).collect(),
			None => return false,
		};

		for callback in callbacks {
			callback(notification);
		}
		true
	}

	pub(crate) fn len(&self) -> usize {
		self.targets.len()
	}

	fn unsubscribe(&self, target_id: &str, key: u64) {
		if let Some(mut entry) = self.targets.get_mut(target_id) {
			entry.retain(|(k, _)| *k != key);
		}
		self.targets.remove_if(target_id, |_, callbacks| callbacks.is_empty());
	}
}

/// Keeps a notification subscription alive; dropping it unsubscribes.
pub struct SubscriptionHandle {
	target_id: String,
	key: u64,
	subscriptions: Weak<Subscriptions>,
}

impl SubscriptionHandle {
	/// Id of the target this subscription listens to.
	pub fn target_id(&self) -> &str {
		&self.target_id
	}
}

impl std::fmt::Debug for SubscriptionHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionHandle")
			.field("target_id", &self.target_id)
			.field("key", &self.key)
			.finish()
	}
}

impl Drop for SubscriptionHandle {
	fn drop(&mut self) {
		if let Some(subscriptions) = self.subscriptions.upgrade() {
			subscriptions.unsubscribe(&self.target_id, self.key);
		}
	}
}

/// Subscription registered before its handler exists.
///
/// Notifications for the target are queued until [`PendingSubscription::attach`]
/// replays them, in arrival order, to the handler. Dropping it unattached
/// unsubscribes and discards the queue.
pub struct PendingSubscription {
	handle: SubscriptionHandle,
	relay: Arc<Relay>,
}

impl PendingSubscription {
	pub(crate) fn new(subscriptions: &Arc<Subscriptions>, target_id: String) -> Self {
		let relay = Arc::new(Relay::default());
		let sink = Arc::clone(&relay);
		let callback: NotificationCallback =
			Arc::new(move |notification: &Notification| sink.deliver(notification));
		let handle = subscriptions.subscribe(target_id, callback);
		Self { handle, relay }
	}

	/// Id of the target this subscription listens to.
	pub fn target_id(&self) -> &str {
		self.handle.target_id()
	}

	/// Number of notifications queued so far.
	pub fn queued(&self) -> usize {
		match &*self.relay.state.lock() {
			RelayState::Queueing(queue) | RelayState::Draining(queue) => queue.len(),
			RelayState::Attached(_) => 0,
		}
	}

	/// Hands queued and future notifications to `callback`.
	pub fn attach<F>(self, callback: F) -> SubscriptionHandle
	where
		F: Fn(&Notification) + Send + Sync + 'static,
	{
		let callback: NotificationCallback = Arc::new(callback);
		{
			let mut state = self.relay.state.lock();
			let queue = match &mut *state {
				RelayState::Queueing(queue) => std::mem::take(queue),
				_ => Vec::new(),
			};
			*state = RelayState::Draining(queue);
		}

		// The callback runs without the lock held; anything dispatched meanwhile
		// is queued behind the batch being replayed.
		loop {
			let batch = {
				let mut state = self.relay.state.lock();
				let RelayState::Draining(queue) = &mut *state else {
					break;
				};
				if queue.is_empty() {
					*state = RelayState::Attached(Arc::clone(&callback));
					break;
				}
				std::mem::take(queue)
			};
			for notification in &batch {
				callback(notification);
			}
		}

		self.handle
	}
}

impl std::fmt::Debug for PendingSubscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PendingSubscription")
			.field("target_id", &self.target_id())
			.field("queued", &self.queued())
			.finish()
	}
}

enum RelayState {
	Queueing(Vec<Notification>),
	Draining(Vec<Notification>),
	Attached(NotificationCallback),
}

struct Relay {
	state: Mutex<RelayState>,
}

impl Default for Relay {
	fn default() -> Self {
		Self {
			state: Mutex::new(RelayState::Queueing(Vec::new())),
		}
	}
}

impl Relay {
	fn deliver(&self, notification: &Notification) {
		let callback = {
			let mut state = self.state.lock();
			match &mut *state {
				RelayState::Queueing(queue) | RelayState::Draining(queue) => {
					queue.push(notification.clone());
					return;
				}
				RelayState::Attached(callback) => Arc::clone(callback),
			}
		};
		callback(notification);
	}
}
