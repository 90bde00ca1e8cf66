//! Scripted in-memory worker speaking the JSON control protocol.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use sfu::{AppData, ProcessExit, TransportParts, Worker};
use sfu_protocol::{Method, Request, Response};
use sfu_runtime::{PipeTransport, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::sync::{mpsc, oneshot};

pub const PID: u32 = 31337;

/// Installs a `tracing` subscriber honouring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Worker side of an in-memory control channel.
///
/// Accepts every request (unless told to reject its method) and answers with
/// the minimal body the client expects for it.
pub struct FakeWorker {
	out_tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
	requests: Arc<Mutex<Vec<Request>>>,
	rejected: Arc<Mutex<HashSet<Method>>>,
	follow_ups: Arc<Mutex<HashMap<Method, FollowUp>>>,
	exit_tx: Mutex<Option<oneshot::Sender<ProcessExit>>>,
	exit_rx: Mutex<Option<oneshot::Receiver<ProcessExit>>>,
	parts: Mutex<Option<TransportParts>>,
}

impl FakeWorker {
	pub fn new() -> Self {
		init_tracing();

		let (worker_input, channel_output) = duplex(256 * 1024);
		let (channel_input, mut worker_output) = duplex(256 * 1024);
		let (transport, message_rx) = PipeTransport::new(channel_output, channel_input);

		let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();
		let requests = Arc::new(Mutex::new(Vec::new()));
		let rejected = Arc::new(Mutex::new(HashSet::new()));
		let follow_ups = Arc::new(Mutex::new(HashMap::<Method, FollowUp>::new()));
		let (exit_tx, exit_rx) = oneshot::channel();

		tokio::spawn(async move {
			// Each batch goes out in a single write.
			while let Some(batch) = out_rx.recv().await {
				let mut bytes = Vec::new();
				for payload in &batch {
					if let Ok(frame) = encode_frame(payload) {
						bytes.extend(frame);
					}
				}
				if worker_output.write_all(&bytes).await.is_err() {
					break;
				}
			}
		});

		tokio::spawn({
			let out_tx = out_tx.clone();
			let requests = Arc::clone(&requests);
			let rejected = Arc::clone(&rejected);
			let follow_ups = Arc::clone(&follow_ups);
			let mut input = worker_input;
			let ports = AtomicU16::new(40000);
			let mut subchannels = HashMap::new();
			async move {
				loop {
					let mut header = [0u8; 4];
					if input.read_exact(&mut header).await.is_err() {
						break;
					}
					let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
					if input.read_exact(&mut payload).await.is_err() {
						break;
					}
					let request: Request = serde_json::from_slice(&payload).unwrap();

					let mut batch = Vec::new();
					if rejected.lock().contains(&request.method) {
						let response =
							Response::rejected(request.id, "Error", format!("{} rejected", request.method));
						batch.push(serde_json::to_vec(&response).unwrap());
					} else {
						let body = response_body(&request, &ports, &mut subchannels);
						let response = Response::accepted(request.id, body);
						batch.push(serde_json::to_vec(&response).unwrap());
						if let Some(follow_up) = follow_ups.lock().get(&request.method) {
							batch.push(follow_up.payload(&request));
						}
					}
					requests.lock().push(request);
					let _ = out_tx.send(batch);
				}
			}
		});

		Self {
			out_tx,
			requests,
			rejected,
			follow_ups,
			exit_tx: Mutex::new(Some(exit_tx)),
			exit_rx: Mutex::new(Some(exit_rx)),
			parts: Mutex::new(Some(transport.into_transport_parts(message_rx))),
		}
	}

	/// Sends the startup notification and attaches a [`Worker`].
	pub async fn start() -> (Worker, Self) {
		let fake = Self::new();
		fake.send_running();
		let worker = fake.attach().await.unwrap();
		(worker, fake)
	}

	pub async fn attach(&self) -> sfu::Result<Worker> {
		let parts = self.parts.lock().take().unwrap();
		let exit = self.exit_rx.lock().take().unwrap();
		Worker::with_channel(parts, PID, exit, AppData::new()).await
	}

	pub fn send_running(&self) {
		self.notify(&PID.to_string(), "running", Value::Null);
	}

	pub fn notify(&self, target_id: &str, event: &str, data: Value) {
		let mut notification = json!({ "targetId": target_id, "event": event });
		if !data.is_null() {
			notification["data"] = data;
		}
		let _ = self.out_tx.send(vec![serde_json::to_vec(&notification).unwrap()]);
	}

	/// After accepting `method`, sends `event` to the entity whose id the
	/// request carried in `id_field`, in the same write as the response.
	pub fn follow_up(&self, method: Method, id_field: &'static str, event: &'static str, data: Value) {
		self.follow_ups.lock().insert(
			method,
			FollowUp {
				id_field,
				event,
				data,
			},
		);
	}

	/// Reports the process as exited.
	pub fn exit(&self, status: ProcessExit) {
		if let Some(tx) = self.exit_tx.lock().take() {
			let _ = tx.send(status);
		}
	}

	/// Rejects every later request with this method.
	pub fn reject(&self, method: Method) {
		self.rejected.lock().insert(method);
	}

	pub fn accept(&self, method: Method) {
		self.rejected.lock().remove(&method);
	}

	pub fn requests(&self, method: Method) -> Vec<Request> {
		self.requests
			.lock()
			.iter()
			.filter(|request| request.method == method)
			.cloned()
			.collect()
	}

	pub fn count(&self, method: Method) -> usize {
		self.requests(method).len()
	}

	/// Waits until at least `n` requests with `method` have been answered.
	pub async fn wait_for(&self, method: Method, n: usize) {
		eventually(|| self.count(method) >= n).await;
	}
}

struct FollowUp {
	id_field: &'static str,
	event: &'static str,
	data: Value,
}

impl FollowUp {
	fn payload(&self, request: &Request) -> Vec<u8> {
		let target_id = request
			.data
			.as_ref()
			.and_then(|data| data[self.id_field].as_str())
			.unwrap_or_default();
		let mut notification = json!({ "targetId": target_id, "event": self.event });
		if !self.data.is_null() {
			notification["data"] = self.data.clone();
		}
		serde_json::to_vec(&notification).unwrap()
	}
}

fn response_body(
	request: &Request,
	ports: &AtomicU16,
	subchannels: &mut HashMap<String, BTreeSet<u16>>,
) -> Option<Value> {
	let data = request.data.clone().unwrap_or(Value::Null);
	let tuple = || {
		json!({
			"localIp": "127.0.0.1",
			"localPort": ports.fetch_add(1, Ordering::SeqCst),
			"protocol": "udp",
		})
	};

	let body = match request.method {
		Method::RouterCreatePipeTransport | Method::RouterCreatePlainTransport => {
			json!({ "tuple": tuple() })
		}
		Method::RouterCreateWebRtcTransport | Method::RouterCreateWebRtcTransportWithServer => json!({
			"iceRole": "controlled",
			"iceParameters": { "usernameFragment": "ufrag", "password": "pwd" },
			"iceCandidates": [],
			"iceState": "new",
			"dtlsParameters": { "role": "auto", "fingerprints": [] },
			"dtlsState": "new",
		}),
		Method::TransportProduce => json!({ "type": "simple" }),
		Method::TransportConsume => json!({
			"paused": data["paused"].as_bool().unwrap_or(false),
			"producerPaused": false,
			"score": { "score": 10, "producerScore": 10, "producerScores": [] },
		}),
		Method::TransportConsumeData => {
			let initial: BTreeSet<u16> =
				serde_json::from_value(data["subchannels"].clone()).unwrap_or_default();
			let id = data["dataConsumerId"].as_str().unwrap_or_default().to_string();
			subchannels.insert(id, initial.clone());
			json!({
				"paused": data["paused"].as_bool().unwrap_or(false),
				"dataProducerPaused": false,
				"subchannels": initial,
			})
		}
		Method::DataConsumerSetSubchannels
		| Method::DataConsumerAddSubchannel
		| Method::DataConsumerRemoveSubchannel => {
			let current = subchannels.entry(request.handler_id.clone()).or_default();
			let subchannel = data["subchannel"].as_u64().map(|n| n as u16);
			match (request.method, subchannel) {
				(Method::DataConsumerAddSubchannel, Some(n)) => {
					current.insert(n);
				}
				(Method::DataConsumerRemoveSubchannel, Some(n)) => {
					current.remove(&n);
				}
				_ => {
					*current = serde_json::from_value(data["subchannels"].clone()).unwrap_or_default();
				}
			}
			json!({ "subchannels": current })
		}
		Method::ConsumerSetPriority => json!({ "priority": data["priority"] }),
		Method::DataConsumerGetBufferedAmount => json!({ "bufferedAmount": 0 }),
		Method::WorkerGetResourceUsage => json!({ "ru_utime": 5, "ru_stime": 3 }),
		Method::WorkerDump => json!({ "pid": PID }),
		_ => return None,
	};
	Some(body)
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while !condition() {
		assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// Counts events matching a predicate.
#[derive(Clone, Default)]
pub struct Counter(Arc<std::sync::atomic::AtomicUsize>);

impl Counter {
	pub fn hit(&self) {
		self.0.fetch_add(1, Ordering::SeqCst);
	}

	pub fn get(&self) -> usize {
		self.0.load(Ordering::SeqCst)
	}
}

pub fn rtp_parameters() -> Value {
	json!({
		"mid": "0",
		"codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
		"encodings": [{ "ssrc": 11111111 }],
	})
}
