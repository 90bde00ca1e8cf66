use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sfu_protocol::PAYLOAD_MAX_LEN;

use super::*;

fn frame(payload: &[u8]) -> Vec<u8> {
	encode_frame(payload).unwrap()
}

#[test]
fn test_length_prefix_encoding() {
	let encoded = frame(b"hello");
	assert_eq!(&encoded[0..4], &5u32.to_le_bytes());
	assert_eq!(&encoded[4..], b"hello");
}

#[test]
fn test_empty_payload_frame() {
	let encoded = frame(b"");
	assert_eq!(encoded, vec![0, 0, 0, 0]);

	let mut decoder = FrameDecoder::new();
	assert_eq!(decoder.push(&encoded), vec![Vec::<u8>::new()]);
}

#[test]
fn test_oversized_payload_rejected_before_encoding() {
	let payload = vec![b'x'; PAYLOAD_MAX_LEN + 1];
	let err = encode_frame(&payload).unwrap_err();
	assert!(matches!(
		err,
		Error::RequestTooLarge { size, max } if size == PAYLOAD_MAX_LEN + 1 && max == PAYLOAD_MAX_LEN
	));
}

#[test]
fn test_max_payload_is_accepted() {
	assert!(check_payload_len(PAYLOAD_MAX_LEN).is_ok());
}

#[test]
fn test_decoder_multiple_frames_in_one_chunk() {
	let mut stream = Vec::new();
	stream.extend(frame(b"{\"id\":1}"));
	stream.extend(frame(b"Dlog line"));
	stream.extend(frame(b"{\"id\":2}"));

	let mut decoder = FrameDecoder::new();
	let frames = decoder.push(&stream);
	assert_eq!(
		frames,
		vec![
			b"{\"id\":1}".to_vec(),
			b"Dlog line".to_vec(),
			b"{\"id\":2}".to_vec()
		]
	);
	assert_eq!(decoder.buffered_len(), 0);
}

#[test]
fn test_decoder_fragmentation_transparency() {
	let payloads: Vec<Vec<u8>> = vec![
		b"{\"targetId\":\"a\",\"event\":\"score\"}".to_vec(),
		b"Wsomething odd".to_vec(),
		vec![b'x'; 300],
		b"".to_vec(),
		b"{\"id\":99,\"accepted\":true}".to_vec(),
	];
	let mut stream = Vec::new();
	for payload in &payloads {
		stream.extend(frame(payload));
	}

	let mut contiguous = FrameDecoder::new();
	let expected = contiguous.push(&stream);
	assert_eq!(expected, payloads);

	for split in [1usize, 2, 3, 4, 5, 7, 13, 64, 333] {
		let mut decoder = FrameDecoder::new();
		let mut decoded = Vec::new();
		for chunk in stream.chunks(split) {
			decoded.extend(decoder.push(chunk));
		}
		assert_eq!(decoded, expected, "split size {}", split);
		assert_eq!(decoder.buffered_len(), 0);
	}

	// Irregular split points, including one inside every length prefix.
	let mut decoder = FrameDecoder::new();
	let mut decoded = Vec::new();
	let cuts = [1usize, 6, 10, 41, 42, 43, 200, 380, stream.len()];
	let mut last = 0;
	for cut in cuts {
		decoded.extend(decoder.push(&stream[last..cut]));
		last = cut;
	}
	assert_eq!(decoded, expected);
}

#[test]
fn test_decoder_overflow_discards_and_recovers() {
	let mut decoder = FrameDecoder::with_max_payload(16);

	// Declares a 1000-byte payload, so the buffer grows past the bound.
	let mut garbage = 1000u32.to_le_bytes().to_vec();
	garbage.extend(vec![0u8; 20]);
	assert!(decoder.push(&garbage).is_empty());
	assert_eq!(decoder.overflows(), 1);
	assert_eq!(decoder.buffered_len(), 0);

	// Scanning resumes from empty.
	let frames = decoder.push(&frame(b"{\"id\":1}"));
	assert_eq!(frames, vec![b"{\"id\":1}".to_vec()]);
}

#[tokio::test]
async fn test_send_message() {
	let (mut worker_in, transport_out) = tokio::io::duplex(1024);
	let (transport_in, _worker_out) = tokio::io::duplex(1024);

	let (transport, _rx) = PipeTransport::new(transport_out, transport_in);
	let (mut sender, _receiver) = transport.into_parts();

	let payload = br#"{"id":1,"method":"worker.dump","handlerId":""}"#.to_vec();
	sender.send(payload.clone()).await.unwrap();

	let mut len_buf = [0u8; 4];
	worker_in.read_exact(&mut len_buf).await.unwrap();
	let length = u32::from_le_bytes(len_buf) as usize;

	let mut msg_buf = vec![0u8; length];
	worker_in.read_exact(&mut msg_buf).await.unwrap();
	assert_eq!(msg_buf, payload);
}

#[tokio::test]
async fn test_oversized_send_writes_nothing() {
	let (mut worker_in, transport_out) = tokio::io::duplex(64);
	let (transport_in, _worker_out) = tokio::io::duplex(64);

	let (transport, _rx) = PipeTransport::new(transport_out, transport_in);
	let (mut sender, _receiver) = transport.into_parts();

	let result = sender.send(vec![b'{'; PAYLOAD_MAX_LEN + 1]).await;
	assert!(matches!(result, Err(Error::RequestTooLarge { .. })));

	drop(sender);
	let mut written = Vec::new();
	worker_in.read_to_end(&mut written).await.unwrap();
	assert!(written.is_empty());
}

#[tokio::test]
async fn test_multiple_messages_in_sequence() {
	let (_worker_in, transport_out) = tokio::io::duplex(4096);
	let (transport_in, mut worker_out) = tokio::io::duplex(4096);

	let (transport, mut rx) = PipeTransport::new(transport_out, transport_in);
	let (_sender, receiver) = transport.into_parts();
	let read_task = tokio::spawn(Box::new(receiver).run());

	let payloads = vec![
		br#"{"id":1,"accepted":true}"#.to_vec(),
		br#"{"id":2,"accepted":true}"#.to_vec(),
		br#"{"targetId":"x","event":"score"}"#.to_vec(),
	];

	for payload in &payloads {
		worker_out.write_all(&frame(payload)).await.unwrap();
	}
	worker_out.flush().await.unwrap();

	for expected in &payloads {
		let received = rx.recv().await.unwrap();
		assert_eq!(&received, expected);
	}

	drop(worker_out);
	assert!(read_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_large_message() {
	let (_worker_in, transport_out) = tokio::io::duplex(1024 * 1024);
	let (transport_in, mut worker_out) = tokio::io::duplex(1024 * 1024);

	let (transport, mut rx) = PipeTransport::new(transport_out, transport_in);
	let (_sender, receiver) = transport.into_parts();
	let read_task = tokio::spawn(Box::new(receiver).run());

	// Larger than one read chunk.
	let large = serde_json::to_vec(&serde_json::json!({
		"id": 1,
		"accepted": true,
		"data": "x".repeat(200_000)
	}))
	.unwrap();

	worker_out.write_all(&frame(&large)).await.unwrap();
	worker_out.flush().await.unwrap();

	let received = rx.recv().await.unwrap();
	assert_eq!(received, large);

	drop(worker_out);
	drop(rx);
	let _ = read_task.await;
}

#[tokio::test]
async fn test_truncated_frame_at_eof() {
	let (_worker_in, transport_out) = tokio::io::duplex(1024);
	let (transport_in, mut worker_out) = tokio::io::duplex(1024);

	let (transport, _rx) = PipeTransport::new(transport_out, transport_in);
	let (_sender, receiver) = transport.into_parts();

	worker_out.write_all(&[0x01, 0x02]).await.unwrap();
	worker_out.flush().await.unwrap();
	drop(worker_out);

	let result = Box::new(receiver).run().await;
	assert!(result.is_err());
	assert!(
		result
			.unwrap_err()
			.to_string()
			.contains("stream ended with 2 buffered bytes")
	);
}

#[tokio::test]
async fn test_clean_eof_is_ok() {
	let (_worker_in, transport_out) = tokio::io::duplex(1024);
	let (transport_in, worker_out) = tokio::io::duplex(1024);

	let (transport, message_rx) = PipeTransport::new(transport_out, transport_in);
	let parts = transport.into_transport_parts(message_rx);

	drop(worker_out);

	let result = parts.receiver.run().await;
	assert!(result.is_ok());
}

#[tokio::test]
async fn test_graceful_shutdown_when_consumer_drops() {
	let (_worker_in, transport_out) = tokio::io::duplex(1024);
	let (transport_in, mut worker_out) = tokio::io::duplex(1024);

	let (transport, mut rx) = PipeTransport::new(transport_out, transport_in);
	let (_sender, receiver) = transport.into_parts();
	let read_task = tokio::spawn(Box::new(receiver).run());

	worker_out
		.write_all(&frame(br#"{"id":1,"accepted":true}"#))
		.await
		.unwrap();
	worker_out.flush().await.unwrap();
	assert!(rx.recv().await.is_some());

	drop(rx);
	worker_out
		.write_all(&frame(br#"{"id":2,"accepted":true}"#))
		.await
		.unwrap();
	worker_out.flush().await.unwrap();

	let result = read_task.await.unwrap();
	assert!(result.is_ok());
}
