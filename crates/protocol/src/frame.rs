//! Frame-level constants and payload tag classification.
//!
//! Every frame on the channel is `u32_le(payload_len) || payload`. The first
//! payload byte decides how the payload is interpreted.

/// Size of the little-endian length prefix preceding every payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload either side accepts.
pub const PAYLOAD_MAX_LEN: usize = 4_194_304;

/// Classification of a payload by its leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTag {
	/// `{`: a JSON control message (response or notification).
	Json,
	/// `D`: debug log line.
	DebugLog,
	/// `W`: warning log line.
	WarnLog,
	/// `E`: error log line.
	ErrorLog,
	/// `X`: raw console dump.
	Dump,
	/// Anything else, including an empty payload.
	Unexpected,
}

impl PayloadTag {
	/// Classifies a payload by its first byte.
	pub fn of(payload: &[u8]) -> Self {
		match payload.first() {
			Some(b'{') => Self::Json,
			Some(b'D') => Self::DebugLog,
			Some(b'W') => Self::WarnLog,
			Some(b'E') => Self::ErrorLog,
			Some(b'X') => Self::Dump,
			_ => Self::Unexpected,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_payload_tags() {
		assert_eq!(PayloadTag::of(br#"{"id":1}"#), PayloadTag::Json);
		assert_eq!(PayloadTag::of(b"Dhello"), PayloadTag::DebugLog);
		assert_eq!(PayloadTag::of(b"Whello"), PayloadTag::WarnLog);
		assert_eq!(PayloadTag::of(b"Ehello"), PayloadTag::ErrorLog);
		assert_eq!(PayloadTag::of(b"Xdump"), PayloadTag::Dump);
		assert_eq!(PayloadTag::of(b"\x00\x01"), PayloadTag::Unexpected);
		assert_eq!(PayloadTag::of(b""), PayloadTag::Unexpected);
	}
}
