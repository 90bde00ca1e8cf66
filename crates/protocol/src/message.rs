//! Request, response and notification envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;
use crate::method::Method;

/// Request sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
	/// Correlation id, never zero.
	pub id: u32,
	/// Method to invoke.
	pub method: Method,
	/// Id of the entity handling the request (empty for worker-level requests).
	#[serde(default)]
	pub handler_id: String,
	/// Method-specific body.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// Response to a previously issued request.
///
/// Either `accepted: true` with optional `data`, or `error` + `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	/// Id of the request this answers.
	pub id: u32,
	/// Whether the worker accepted the request.
	#[serde(default)]
	pub accepted: bool,
	/// Result body for accepted requests.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	/// Error class for rejected requests (e.g. `"TypeError"`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Human-readable rejection reason.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

impl Response {
	/// Builds an accepted response.
	pub fn accepted(id: u32, data: Option<Value>) -> Self {
		Self {
			id,
			accepted: true,
			data,
			error: None,
			reason: None,
		}
	}

	/// Builds a rejected response.
	pub fn rejected(id: u32, error: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			id,
			accepted: false,
			data: None,
			error: Some(error.into()),
			reason: Some(reason.into()),
		}
	}
}

/// Unsolicited message targeted at an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
	/// Id of the entity the notification is for.
	pub target_id: String,
	/// Event name.
	pub event: Event,
	/// Event-specific body.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// Classification of the worker's error tag on rejected responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
	/// The worker rejected an argument's type or shape.
	TypeError,
	/// Any other failure.
	Error,
}

impl RemoteErrorKind {
	/// Parses the worker's error tag; unknown tags map to [`RemoteErrorKind::Error`].
	pub fn from_tag(tag: &str) -> Self {
		match tag {
			"TypeError" => Self::TypeError,
			_ => Self::Error,
		}
	}
}

/// Discriminated union of incoming JSON messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// Has a nonzero numeric `id`.
	Response(Response),
	/// Has `targetId` and `event`, no id.
	Notification(Notification),
	/// Neither (forward-compatible catch-all).
	Unknown(Value),
}

impl Message {
	/// Parses and classifies a JSON payload.
	///
	/// An `id` of zero is the "no id" sentinel and never makes a response.
	pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
		let value: Value = serde_json::from_slice(payload)?;
		Self::from_value(value)
	}

	/// Classifies an already-parsed JSON value.
	pub fn from_value(value: Value) -> serde_json::Result<Self> {
		let has_id = value
			.get("id")
			.and_then(Value::as_u64)
			.is_some_and(|id| id != 0);

		if has_id {
			return serde_json::from_value(value).map(Message::Response);
		}

		if value.get("targetId").is_some() && value.get("event").is_some() {
			return serde_json::from_value(value).map(Message::Notification);
		}

		Ok(Message::Unknown(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_request_serialization() {
		let request = Request {
			id: 7,
			method: Method::WorkerCreateRouter,
			handler_id: String::new(),
			data: Some(json!({"routerId": "r1"})),
		};
		let value = serde_json::to_value(&request).unwrap();
		assert_eq!(
			value,
			json!({
				"id": 7,
				"method": "worker.createRouter",
				"handlerId": "",
				"data": {"routerId": "r1"}
			})
		);
	}

	#[test]
	fn test_request_without_data_omits_field() {
		let request = Request {
			id: 1,
			method: Method::WorkerDump,
			handler_id: String::new(),
			data: None,
		};
		let value = serde_json::to_value(&request).unwrap();
		assert!(value.get("data").is_none());
	}

	#[test]
	fn test_accepted_response_classification() {
		let message = Message::from_slice(br#"{"id":42,"accepted":true,"data":{"a":1}}"#).unwrap();
		match message {
			Message::Response(response) => {
				assert_eq!(response.id, 42);
				assert!(response.accepted);
				assert_eq!(response.data, Some(json!({"a": 1})));
			}
			other => panic!("Expected Response, got {:?}", other),
		}
	}

	#[test]
	fn test_rejected_response_classification() {
		let message =
			Message::from_slice(br#"{"id":3,"error":"TypeError","reason":"bad kind"}"#).unwrap();
		match message {
			Message::Response(response) => {
				assert!(!response.accepted);
				assert_eq!(response.error.as_deref(), Some("TypeError"));
				assert_eq!(response.reason.as_deref(), Some("bad kind"));
			}
			other => panic!("Expected Response, got {:?}", other),
		}
	}

	#[test]
	fn test_notification_classification() {
		let message =
			Message::from_slice(br#"{"targetId":"abc","event":"score","data":{"score":10}}"#)
				.unwrap();
		match message {
			Message::Notification(notification) => {
				assert_eq!(notification.target_id, "abc");
				assert_eq!(notification.event, Event::Score);
			}
			other => panic!("Expected Notification, got {:?}", other),
		}
	}

	#[test]
	fn test_zero_id_is_not_a_response() {
		let message =
			Message::from_slice(br#"{"id":0,"targetId":"abc","event":"running"}"#).unwrap();
		assert!(matches!(message, Message::Notification(_)));
	}

	#[test]
	fn test_unknown_message() {
		let message = Message::from_slice(br#"{"hello":"world"}"#).unwrap();
		assert!(matches!(message, Message::Unknown(_)));
	}

	#[test]
	fn test_malformed_json_is_an_error() {
		assert!(Message::from_slice(b"{not json").is_err());
	}

	#[test]
	fn test_remote_error_kind() {
		assert_eq!(RemoteErrorKind::from_tag("TypeError"), RemoteErrorKind::TypeError);
		assert_eq!(RemoteErrorKind::from_tag("Error"), RemoteErrorKind::Error);
		assert_eq!(RemoteErrorKind::from_tag("RangeError"), RemoteErrorKind::Error);
	}
}
