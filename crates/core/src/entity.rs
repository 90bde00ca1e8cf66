//! State shared by every entity node.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sfu_protocol::Notification;
use sfu_runtime::{Error, PendingSubscription, Result, SubscriptionHandle};

use crate::data_structures::AppData;

/// Generates a new entity id (UUID v4).
pub(crate) fn generate_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

/// Deserializes the body of a notification, logging and returning `None` if it is malformed.
pub(crate) fn notification_data<T: DeserializeOwned>(notification: &Notification) -> Option<T> {
	let data = notification.data.clone().unwrap_or(Value::Null);
	match serde_json::from_value(data) {
		Ok(value) => Some(value),
		Err(e) => {
			tracing::warn!(
				"ignoring malformed {:?} notification [target_id:{}]: {}",
				notification.event,
				notification.target_id,
				e
			);
			None
		}
	}
}

/// Deserializes a response body, treating `null` as an empty object.
pub(crate) fn response_data<T: DeserializeOwned>(data: Value) -> Result<T> {
	let data = if data.is_null() {
		Value::Object(Default::default())
	} else {
		data
	};
	Ok(serde_json::from_value(data)?)
}

/// Id, closed flag, app data and notification subscription of one entity.
pub(crate) struct EntityCore {
	kind: &'static str,
	id: String,
	closed: AtomicBool,
	app_data: Mutex<AppData>,
	notifications: Mutex<Option<SubscriptionHandle>>,
}

impl EntityCore {
	pub(crate) fn new(kind: &'static str, id: String, app_data: AppData) -> Self {
		Self {
			kind,
			id,
			closed: AtomicBool::new(false),
			app_data: Mutex::new(app_data),
			notifications: Mutex::new(None),
		}
	}

	pub(crate) fn id(&self) -> &str {
		&self.id
	}

	pub(crate) fn closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Marks the entity closed and drops its notification subscription.
	///
	/// Returns false if it was already closed; exactly one caller gets true.
	pub(crate) fn mark_closed(&self) -> bool {
		if self.closed.swap(true, Ordering::AcqRel) {
			return false;
		}
		self.notifications.lock().take();
		true
	}

	/// Fails with `InvalidState` once closed.
	pub(crate) fn ensure_open(&self) -> Result<()> {
		if self.closed() {
			return Err(Error::InvalidState(format!("{} closed", self.kind)));
		}
		Ok(())
	}

	pub(crate) fn app_data(&self) -> AppData {
		self.app_data.lock().clone()
	}

	pub(crate) fn set_app_data(&self, app_data: AppData) {
		*self.app_data.lock() = app_data;
	}

	/// Hands the entity's queued and future notifications to `callback`.
	///
	/// Queued notifications are replayed before this returns. If one of them
	/// closed the entity, the subscription is dropped instead of kept.
	pub(crate) fn attach_notifications<F>(&self, pending: PendingSubscription, callback: F)
	where
		F: Fn(&Notification) + Send + Sync + 'static,
	{
		let handle = pending.attach(callback);
		let mut notifications = self.notifications.lock();
		if !self.closed() {
			*notifications = Some(handle);
		}
	}
}

impl std::fmt::Debug for EntityCore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct(self.kind)
			.field("id", &self.id)
			.field("closed", &self.closed())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_mark_closed_once() {
		let core = EntityCore::new("Router", generate_id(), AppData::new());
		assert!(core.ensure_open().is_ok());
		assert!(core.mark_closed());
		assert!(!core.mark_closed());
		assert!(core.closed());
		assert!(matches!(core.ensure_open(), Err(Error::InvalidState(msg)) if msg == "Router closed"));
	}

	#[test]
	fn test_response_data_null_is_empty_object() {
		#[derive(serde::Deserialize)]
		struct Body {
			#[serde(default)]
			paused: bool,
		}
		let body: Body = response_data(Value::Null).unwrap();
		assert!(!body.paused);
	}

	#[test]
	fn test_ids_are_unique_uuids() {
		let a = generate_id();
		let b = generate_id();
		assert_ne!(a, b);
		assert!(uuid::Uuid::parse_str(&a).is_ok());
	}
}
