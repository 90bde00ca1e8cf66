//! Length-prefixed frame encoding and incremental decoding.
//!
//! Wire format: `u32_le(payload_len) || payload`, repeated. Payloads larger
//! than [`PAYLOAD_MAX_LEN`] are refused on encode. On decode, a buffer that
//! grows past the bound without yielding a complete frame is discarded so a
//! corrupted stream cannot wedge the channel.

use sfu_protocol::{FRAME_HEADER_LEN, PAYLOAD_MAX_LEN};

use crate::error::{Error, Result};

/// Fails with [`Error::RequestTooLarge`] if `len` exceeds the payload bound.
pub fn check_payload_len(len: usize) -> Result<()> {
	if len > PAYLOAD_MAX_LEN {
		return Err(Error::RequestTooLarge {
			size: len,
			max: PAYLOAD_MAX_LEN,
		});
	}
	Ok(())
}

/// Encodes one frame: 4-byte little-endian length prefix followed by the payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
	check_payload_len(payload.len())?;

	let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
	frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
	frame.extend_from_slice(payload);
	Ok(frame)
}

/// Incremental frame decoder.
///
/// Feed it arbitrary chunks of the byte stream; it yields complete payloads in
/// arrival order regardless of how the stream was split.
#[derive(Debug)]
pub struct FrameDecoder {
	buffer: Vec<u8>,
	max_payload: usize,
	overflows: usize,
}

impl Default for FrameDecoder {
	fn default() -> Self {
		Self::new()
	}
}

impl FrameDecoder {
	pub fn new() -> Self {
		Self::with_max_payload(PAYLOAD_MAX_LEN)
	}

	/// Creates a decoder with a custom payload bound.
	pub fn with_max_payload(max_payload: usize) -> Self {
		Self {
			buffer: Vec::new(),
			max_payload,
			overflows: 0,
		}
	}

	/// Appends `chunk` and returns every complete payload now available.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
		self.buffer.extend_from_slice(chunk);

		let mut frames = Vec::new();
		let mut start = 0;

		loop {
			let available = self.buffer.len() - start;
			if available < FRAME_HEADER_LEN {
				break;
			}

			let mut header = [0u8; FRAME_HEADER_LEN];
			header.copy_from_slice(&self.buffer[start..start + FRAME_HEADER_LEN]);
			let payload_len = u32::from_le_bytes(header) as usize;

			if available < FRAME_HEADER_LEN + payload_len {
				break;
			}

			let payload_start = start + FRAME_HEADER_LEN;
			frames.push(self.buffer[payload_start..payload_start + payload_len].to_vec());
			start = payload_start + payload_len;
		}

		if start > 0 {
			self.buffer.drain(..start);
		}

		if self.buffer.len() > FRAME_HEADER_LEN + self.max_payload {
			tracing::error!(
				buffered = self.buffer.len(),
				"receiving buffer is full, discarding all data in it"
			);
			self.buffer.clear();
			self.overflows += 1;
		}

		frames
	}

	/// Number of bytes held waiting for the rest of a frame.
	pub fn buffered_len(&self) -> usize {
		self.buffer.len()
	}

	/// Number of times the buffer overflowed and was discarded.
	pub fn overflows(&self) -> usize {
		self.overflows
	}
}
