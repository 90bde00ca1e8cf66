//! [`Worker`]: the supervised media worker process and root of the entity graph.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sfu_protocol::{Event, Method, WorkerLogLevel, WorkerLogTag};
use sfu_runtime::{
	Channel, Error, ProcessExit, ProcessHandle, ProcessSettings, Result, SpawnedWorker, TransportParts,
	WorkerProcess,
};
use tokio::sync::oneshot;

use crate::data_structures::AppData;
use crate::entity::{EntityCore, generate_id, response_data};
use crate::events::{EventHandlers, Subscription};
use crate::router::{Router, RouterOptions};
use crate::webrtc_server::{WebRtcServer, WebRtcServerOptions};

/// Settings used to launch a worker.
///
/// Deserializable from JSON (camelCase keys) so it can live in a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerSettings {
	pub log_level: WorkerLogLevel,
	pub log_tags: Vec<WorkerLogTag>,
	pub rtc_min_port: Option<u16>,
	pub rtc_max_port: Option<u16>,
	/// PEM certificate for DTLS; used only together with `dtls_private_key_file`.
	pub dtls_certificate_file: Option<PathBuf>,
	pub dtls_private_key_file: Option<PathBuf>,
	pub libwebrtc_field_trials: Option<String>,
	pub disable_liburing: bool,
	/// Worker executable; falls back to `SFU_WORKER_BIN` and the build tree.
	pub worker_bin: Option<PathBuf>,
	pub app_data: AppData,
}

impl WorkerSettings {
	fn process_settings(&self) -> ProcessSettings {
		ProcessSettings {
			worker_bin: self.worker_bin.clone(),
			log_level: Some(self.log_level),
			log_tags: self.log_tags.clone(),
			rtc_min_port: self.rtc_min_port,
			rtc_max_port: self.rtc_max_port,
			dtls_certificate_file: self.dtls_certificate_file.clone(),
			dtls_private_key_file: self.dtls_private_key_file.clone(),
			libwebrtc_field_trials: self.libwebrtc_field_trials.clone(),
			disable_liburing: self.disable_liburing,
		}
	}
}

/// Settings that can be changed on a running worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerUpdateSettings {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub log_level: Option<WorkerLogLevel>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub log_tags: Option<Vec<WorkerLogTag>>,
}

/// `getrusage(2)` figures of the worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerResourceUsage {
	/// User CPU time (ms).
	pub ru_utime: u64,
	/// System CPU time (ms).
	pub ru_stime: u64,
	pub ru_maxrss: u64,
	pub ru_ixrss: u64,
	pub ru_idrss: u64,
	pub ru_isrss: u64,
	pub ru_minflt: u64,
	pub ru_majflt: u64,
	pub ru_nswap: u64,
	pub ru_inblock: u64,
	pub ru_oublock: u64,
	pub ru_msgsnd: u64,
	pub ru_msgrcv: u64,
	pub ru_nsignals: u64,
	pub ru_nvcsw: u64,
	pub ru_nivcsw: u64,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
	/// The process ended without being closed.
	Died(Arc<Error>),
	/// The process has exited, whether closed or died.
	SubprocessClose,
}

#[derive(Debug, Clone)]
pub enum WorkerObserverEvent {
	Close,
	NewRouter(Router),
	NewWebRtcServer(WebRtcServer),
}

pub(crate) struct WorkerInner {
	core: EntityCore,
	pid: u32,
	channel: Channel,
	process: Option<ProcessHandle>,
	died: AtomicBool,
	subprocess_closed: AtomicBool,
	routers: Mutex<HashMap<String, Router>>,
	webrtc_servers: Mutex<HashMap<String, WebRtcServer>>,
	handlers: EventHandlers<WorkerEvent>,
	observer: EventHandlers<WorkerObserverEvent>,
}

impl Drop for WorkerInner {
	fn drop(&mut self) {
		if !self.core.closed() {
			if let Some(process) = &self.process {
				process.kill();
			}
			self.channel.close();
		}
	}
}

/// A running media worker.
///
/// Dropping the last handle kills the process as if [`Worker::close`] had been
/// called, without emitting events.
#[derive(Clone)]
pub struct Worker {
	inner: Arc<WorkerInner>,
}

#[derive(Clone)]
pub(crate) struct WeakWorker(Weak<WorkerInner>);

impl WeakWorker {
	pub(crate) fn upgrade(&self) -> Option<Worker> {
		self.0.upgrade().map(|inner| Worker { inner })
	}
}

impl std::fmt::Debug for Worker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Worker")
			.field("pid", &self.inner.pid)
			.field("closed", &self.closed())
			.field("died", &self.died())
			.finish()
	}
}

impl Worker {
	/// Spawns a worker process and waits until it reports it is running.
	///
	/// Fails with [`Error::SettingsRejected`] if the worker exits with status 42
	/// during startup, or with the process error for any other early exit.
	pub async fn new(settings: WorkerSettings) -> Result<Self> {
		tracing::debug!("new()");
		let SpawnedWorker {
			pid,
			parts,
			exit,
			handle,
		} = WorkerProcess::spawn(&settings.process_settings())?;

		Self::start(parts, pid, exit, Some(handle), settings.app_data).await
	}

	/// Attaches to a worker whose control channel is already available.
	///
	/// `exit` must resolve when the worker goes away; dropping its sender is
	/// treated as the process vanishing.
	pub async fn with_channel(
		parts: TransportParts,
		pid: u32,
		exit: oneshot::Receiver<ProcessExit>,
		app_data: AppData,
	) -> Result<Self> {
		Self::start(parts, pid, exit, None, app_data).await
	}

	async fn start(
		parts: TransportParts,
		pid: u32,
		mut exit: oneshot::Receiver<ProcessExit>,
		process: Option<ProcessHandle>,
		app_data: AppData,
	) -> Result<Self> {
		let channel = match Channel::new(parts, pid) {
			Ok(channel) => channel,
			Err(e) => {
				if let Some(process) = &process {
					process.kill();
				}
				return Err(e);
			}
		};

		let worker = Self {
			inner: Arc::new(WorkerInner {
				core: EntityCore::new("Worker", pid.to_string(), app_data),
				pid,
				channel: channel.clone(),
				process,
				died: AtomicBool::new(false),
				subprocess_closed: AtomicBool::new(false),
				routers: Mutex::new(HashMap::new()),
				webrtc_servers: Mutex::new(HashMap::new()),
				handlers: EventHandlers::new(),
				observer: EventHandlers::new(),
			}),
		};

		let (running_tx, running_rx) = oneshot::channel();
		let running_tx = Mutex::new(Some(running_tx));
		let notifications = channel.buffer_notifications(pid.to_string());
		worker.inner.core.attach_notifications(notifications, move |notification| {
			match notification.event {
				Event::Running => {
					if let Some(tx) = running_tx.lock().take() {
						let _ = tx.send(());
					}
				}
				other => {
					tracing::error!("ignoring unknown event {:?} [worker_pid:{}]", other, pid);
				}
			}
		});

		channel.start()?;

		tokio::select! {
			biased;

			running = running_rx => {
				if running.is_err() {
					worker.close();
					return Err(Error::ChannelClosed);
				}
				tracing::debug!(pid, "worker process running");
			}
			status = &mut exit => {
				let status = status.unwrap_or_else(|_| ProcessExit::WaitFailed("exit watcher dropped".to_string()));
				tracing::error!(pid, "worker process failed to start: {:?}", status);
				worker.inner.core.mark_closed();
				worker.inner.channel.close();
				return Err(status.startup_error(pid));
			}
		}

		let weak = worker.downgrade();
		tokio::spawn(async move {
			let status = exit
				.await
				.unwrap_or_else(|_| ProcessExit::WaitFailed("exit watcher dropped".to_string()));
			let Some(worker) = weak.upgrade() else {
				return;
			};

			if !worker.closed() {
				tracing::error!(pid, "worker process died unexpectedly: {:?}", status);
				worker.died_with(Arc::new(status.died_error(pid)));
			} else {
				tracing::debug!(pid, "worker process exited: {:?}", status);
			}

			worker.inner.subprocess_closed.store(true, Ordering::Release);
			worker.inner.handlers.emit(&WorkerEvent::SubprocessClose);
		});

		Ok(worker)
	}

	pub(crate) fn downgrade(&self) -> WeakWorker {
		WeakWorker(Arc::downgrade(&self.inner))
	}

	pub fn pid(&self) -> u32 {
		self.inner.pid
	}

	pub fn closed(&self) -> bool {
		self.inner.core.closed()
	}

	/// True if the process ended without [`Worker::close`].
	pub fn died(&self) -> bool {
		self.inner.died.load(Ordering::Acquire)
	}

	/// True once the process has exited.
	pub fn subprocess_closed(&self) -> bool {
		self.inner.subprocess_closed.load(Ordering::Acquire)
	}

	pub fn app_data(&self) -> AppData {
		self.inner.core.app_data()
	}

	pub fn set_app_data(&self, app_data: AppData) {
		self.inner.core.set_app_data(app_data);
	}

	pub fn routers(&self) -> Vec<Router> {
		self.inner.routers.lock().values().cloned().collect()
	}

	pub fn webrtc_servers(&self) -> Vec<WebRtcServer> {
		self.inner.webrtc_servers.lock().values().cloned().collect()
	}

	pub fn on<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&WorkerEvent) + Send + Sync + 'static,
	{
		self.inner.handlers.on(handler)
	}

	pub fn observer(&self) -> &EventHandlers<WorkerObserverEvent> {
		&self.inner.observer
	}

	pub async fn dump(&self) -> Result<Value> {
		tracing::debug!("dump()");
		self.inner.channel.request(Method::WorkerDump, "", None).await
	}

	pub async fn get_resource_usage(&self) -> Result<WorkerResourceUsage> {
		tracing::debug!("get_resource_usage()");
		let data = self
			.inner
			.channel
			.request(Method::WorkerGetResourceUsage, "", None)
			.await?;
		response_data(data)
	}

	pub async fn update_settings(&self, settings: WorkerUpdateSettings) -> Result<()> {
		tracing::debug!("update_settings()");
		self.inner
			.channel
			.request(Method::WorkerUpdateSettings, "", Some(json!(settings)))
			.await?;
		Ok(())
	}

	pub async fn create_router(&self, options: RouterOptions) -> Result<Router> {
		tracing::debug!("create_router()");
		self.inner.core.ensure_open()?;

		let id = generate_id();
		self.inner
			.channel
			.request(
				Method::WorkerCreateRouter,
				"",
				Some(json!({
					"routerId": id,
					"mediaCodecs": options.media_codecs,
				})),
			)
			.await?;

		let router = Router::new(
			id,
			options.media_codecs,
			options.app_data,
			self.inner.channel.clone(),
			self.downgrade(),
		);
		{
			let mut routers = self.inner.routers.lock();
			if self.closed() {
				drop(routers);
				router.worker_closed();
				return Err(Error::InvalidState("Worker closed".to_string()));
			}
			routers.insert(router.id().to_string(), router.clone());
		}

		self.inner
			.observer
			.emit(&WorkerObserverEvent::NewRouter(router.clone()));
		Ok(router)
	}

	pub async fn create_webrtc_server(&self, options: WebRtcServerOptions) -> Result<WebRtcServer> {
		tracing::debug!("create_webrtc_server()");
		self.inner.core.ensure_open()?;
		if options.listen_infos.is_empty() {
			return Err(Error::InvalidArgument("empty listen_infos".to_string()));
		}

		let id = generate_id();
		self.inner
			.channel
			.request(
				Method::WorkerCreateWebRtcServer,
				"",
				Some(json!({
					"webRtcServerId": id,
					"listenInfos": options.listen_infos,
				})),
			)
			.await?;

		let webrtc_server = WebRtcServer::new(
			id,
			options.app_data,
			self.inner.channel.clone(),
			self.downgrade(),
		);
		{
			let mut webrtc_servers = self.inner.webrtc_servers.lock();
			if self.closed() {
				drop(webrtc_servers);
				webrtc_server.worker_closed();
				return Err(Error::InvalidState("Worker closed".to_string()));
			}
			webrtc_servers.insert(webrtc_server.id().to_string(), webrtc_server.clone());
		}

		self.inner
			.observer
			.emit(&WorkerObserverEvent::NewWebRtcServer(webrtc_server.clone()));
		Ok(webrtc_server)
	}

	/// Terminates the worker process and closes every entity.
	pub fn close(&self) {
		if !self.inner.core.mark_closed() {
			return;
		}
		tracing::debug!(pid = self.inner.pid, "close()");

		if let Some(process) = &self.inner.process {
			process.kill();
		}
		self.inner.channel.close();

		self.close_children();

		self.inner.observer.emit(&WorkerObserverEvent::Close);
	}

	fn died_with(&self, error: Arc<Error>) {
		if !self.inner.core.mark_closed() {
			return;
		}

		self.inner.died.store(true, Ordering::Release);
		self.inner.channel.close();

		self.close_children();

		self.inner.handlers.emit(&WorkerEvent::Died(error));
		self.inner.observer.emit(&WorkerObserverEvent::Close);
	}

	fn close_children(&self) {
		let routers = std::mem::take(&mut *self.inner.routers.lock());
		for router in routers.into_values() {
			router.worker_closed();
		}

		let webrtc_servers = std::mem::take(&mut *self.inner.webrtc_servers.lock());
		for webrtc_server in webrtc_servers.into_values() {
			webrtc_server.worker_closed();
		}
	}

	pub(crate) fn router_detached(&self, router_id: &str) {
		self.inner.routers.lock().remove(router_id);
	}

	pub(crate) fn webrtc_server_detached(&self, webrtc_server_id: &str) {
		self.inner.webrtc_servers.lock().remove(webrtc_server_id);
	}
}
