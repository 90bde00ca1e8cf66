//! Framed byte-stream transport to the worker process.
//!
//! The worker reads requests from one stream and writes responses,
//! notifications and log lines to another. [`PipeTransport`] wraps that pair:
//! the sender half writes whole frames, the receiver half runs a read loop that
//! decodes frames and forwards raw payloads over an unbounded channel.
//!
//! Payload interpretation (JSON, log lines, dumps) is the channel's job; this
//! layer only guarantees framing.

mod codec;

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub use codec::{FrameDecoder, check_payload_len, encode_frame};

use crate::error::{Error, Result};

/// Size of each read from the worker's output stream.
const READ_CHUNK_LEN: usize = 64 * 1024;

/// Sending half of a transport.
pub trait Transport: Send {
	/// Writes one payload as a complete frame.
	///
	/// Fails before writing anything if the payload exceeds the frame bound,
	/// and with an I/O error if the stream rejects the write.
	fn send(&mut self, payload: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiving half of a transport.
pub trait TransportReceiver: Send {
	/// Runs the read loop until EOF, a read error, or the payload consumer going away.
	fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Type-erased transport halves plus the payload stream, as consumed by the channel.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Transport over a pair of byte streams (process pipes or in-memory duplexes).
pub struct PipeTransport<W, R> {
	writer: W,
	reader: R,
	message_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl<W, R> PipeTransport<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Creates a transport writing frames to `writer` and reading frames from `reader`.
	///
	/// Returns the transport and the receiver of decoded payloads.
	pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		(
			Self {
				writer,
				reader,
				message_tx,
			},
			message_rx,
		)
	}

	/// Splits into independent sender and receiver halves.
	pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
		(
			PipeTransportSender {
				writer: self.writer,
			},
			PipeTransportReceiver {
				reader: self.reader,
				message_tx: self.message_tx,
			},
		)
	}

	/// Splits into boxed halves ready for the channel.
	pub fn into_transport_parts(
		self,
		message_rx: mpsc::UnboundedReceiver<Vec<u8>>,
	) -> TransportParts {
		let (sender, receiver) = self.into_parts();
		TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			message_rx,
		}
	}
}

/// Writing half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
	writer: W,
}

impl<W> PipeTransportSender<W>
where
	W: AsyncWrite + Unpin + Send,
{
	/// Writes one payload as a frame and flushes.
	pub async fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
		let frame = encode_frame(payload)?;

		self.writer
			.write_all(&frame)
			.await
			.map_err(|e| Error::TransportError(format!("Failed to write frame: {}", e)))?;
		self.writer
			.flush()
			.await
			.map_err(|e| Error::TransportError(format!("Failed to flush frame: {}", e)))?;

		Ok(())
	}
}

impl<W> Transport for PipeTransportSender<W>
where
	W: AsyncWrite + Unpin + Send,
{
	fn send(&mut self, payload: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move { self.send_payload(&payload).await })
	}
}

/// Reading half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
	reader: R,
	message_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl<R> TransportReceiver for PipeTransportReceiver<R>
where
	R: AsyncRead + Unpin + Send + 'static,
{
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move { read_frames(&mut self.reader, &self.message_tx).await })
	}
}

async fn read_frames<R>(reader: &mut R, message_tx: &mpsc::UnboundedSender<Vec<u8>>) -> Result<()>
where
	R: AsyncRead + Unpin,
{
	let mut decoder = FrameDecoder::new();
	let mut chunk = vec![0u8; READ_CHUNK_LEN];

	loop {
		let read = reader
			.read(&mut chunk)
			.await
			.map_err(|e| Error::TransportError(format!("Failed to read frame: {}", e)))?;

		if read == 0 {
			if decoder.buffered_len() > 0 {
				return Err(Error::TransportError(format!(
					"Failed to read frame: stream ended with {} buffered bytes",
					decoder.buffered_len()
				)));
			}
			tracing::debug!("Transport stream ended");
			return Ok(());
		}

		for payload in decoder.push(&chunk[..read]) {
			if message_tx.send(payload).is_err() {
				tracing::debug!("Payload receiver dropped, stopping read loop");
				return Ok(());
			}
		}
	}
}

#[cfg(test)]
mod tests;
