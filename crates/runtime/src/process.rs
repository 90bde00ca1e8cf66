//! Worker process supervision
//!
//! Spawns the media worker with its control channel on file descriptors 3 and
//! 4, relays its stdout/stderr into `tracing`, and reports how it exited.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sfu_protocol::{WorkerLogLevel, WorkerLogTag};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;

use crate::binary::{worker_binary, worker_command};
use crate::channel::WORKER_LOG_TARGET;
use crate::error::{Error, Result};
use crate::transport::TransportParts;

/// Exit status reserved by the worker for "invalid settings".
pub const SETTINGS_REJECTED_EXIT_CODE: i32 = 42;

/// Environment variable carrying the library version into the worker.
pub const VERSION_ENV: &str = "SFU_VERSION";

/// Settings that become worker command-line arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSettings {
	/// Explicit worker executable; see [`crate::binary::worker_binary`].
	pub worker_bin: Option<PathBuf>,
	pub log_level: Option<WorkerLogLevel>,
	pub log_tags: Vec<WorkerLogTag>,
	pub rtc_min_port: Option<u16>,
	pub rtc_max_port: Option<u16>,
	pub dtls_certificate_file: Option<PathBuf>,
	pub dtls_private_key_file: Option<PathBuf>,
	pub libwebrtc_field_trials: Option<String>,
	pub disable_liburing: bool,
}

impl ProcessSettings {
	/// Worker command-line arguments for these settings.
	pub fn args(&self) -> Vec<String> {
		let mut args = Vec::new();

		if let Some(level) = self.log_level {
			args.push(format!("--logLevel={}", level.as_str()));
		}
		for tag in &self.log_tags {
			args.push(format!("--logTag={}", tag.as_str()));
		}
		if let Some(port) = self.rtc_min_port {
			args.push(format!("--rtcMinPort={}", port));
		}
		if let Some(port) = self.rtc_max_port {
			args.push(format!("--rtcMaxPort={}", port));
		}
		if let (Some(cert), Some(key)) = (&self.dtls_certificate_file, &self.dtls_private_key_file) {
			args.push(format!("--dtlsCertificateFile={}", cert.display()));
			args.push(format!("--dtlsPrivateKeyFile={}", key.display()));
		}
		if let Some(trials) = &self.libwebrtc_field_trials {
			args.push(format!("--libwebrtcFieldTrials={}", trials));
		}
		if self.disable_liburing {
			args.push("--disableLiburing=true".to_string());
		}

		args
	}
}

/// How the worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
	/// Exited on its own with a status code.
	Exited { code: i32 },
	/// Terminated by a signal.
	Signaled { signal: i32 },
	/// The exit status could not be collected.
	WaitFailed(String),
}

impl ProcessExit {
	pub fn code(&self) -> Option<i32> {
		match self {
			Self::Exited { code } => Some(*code),
			_ => None,
		}
	}

	pub fn signal(&self) -> Option<i32> {
		match self {
			Self::Signaled { signal } => Some(*signal),
			_ => None,
		}
	}

	/// Error for a worker that ended before reporting it was running.
	pub fn startup_error(&self, pid: u32) -> Error {
		match self {
			Self::Exited { code } if *code == SETTINGS_REJECTED_EXIT_CODE => Error::SettingsRejected,
			Self::WaitFailed(message) => Error::ProcessError {
				pid,
				message: message.clone(),
			},
			_ => Error::ProcessDied {
				pid,
				code: self.code(),
				signal: self.signal(),
			},
		}
	}

	/// Error for a running worker that ended without being closed.
	pub fn died_error(&self, pid: u32) -> Error {
		match self {
			Self::WaitFailed(message) => Error::ProcessError {
				pid,
				message: message.clone(),
			},
			_ => Error::ProcessDied {
				pid,
				code: self.code(),
				signal: self.signal(),
			},
		}
	}

	fn from_status(status: std::process::ExitStatus) -> Self {
		if let Some(code) = status.code() {
			return Self::Exited { code };
		}
		#[cfg(unix)]
		{
			use std::os::unix::process::ExitStatusExt;
			if let Some(signal) = status.signal() {
				return Self::Signaled { signal };
			}
		}
		Self::WaitFailed(format!("unrecognized exit status: {}", status))
	}
}

/// Handle used to terminate the worker process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
	pid: u32,
	exited: Arc<AtomicBool>,
	killed: Arc<AtomicBool>,
}

impl ProcessHandle {
	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// Returns true once the exit status has been collected.
	pub fn has_exited(&self) -> bool {
		self.exited.load(Ordering::Acquire)
	}

	/// Sends SIGTERM to the worker. Does nothing after the first call or once
	/// the process has exited.
	pub fn kill(&self) {
		if self.has_exited() || self.killed.swap(true, Ordering::AcqRel) {
			return;
		}
		tracing::debug!(pid = self.pid, "kill()");
		#[cfg(unix)]
		{
			let Ok(pid) = libc::pid_t::try_from(self.pid) else {
				return;
			};
			// SAFETY: plain syscall on a pid we spawned and have not yet reaped.
			if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
				tracing::debug!(
					pid = self.pid,
					"kill() failed: {}",
					std::io::Error::last_os_error()
				);
			}
		}
	}
}

/// A freshly spawned worker.
pub struct SpawnedWorker {
	pub pid: u32,
	/// Control channel transport over fds 3 and 4.
	pub parts: TransportParts,
	/// Resolves once the process exits.
	pub exit: oneshot::Receiver<ProcessExit>,
	pub handle: ProcessHandle,
}

/// Spawns worker processes.
pub struct WorkerProcess;

impl WorkerProcess {
	/// Spawns the worker described by `settings`.
	///
	/// Must be called from within a tokio runtime.
	///
	/// # Errors
	///
	/// Returns `Error::WorkerBinaryNotFound` if the executable cannot be located
	/// and `Error::SpawnFailed` if the process cannot be started.
	#[cfg(unix)]
	pub fn spawn(settings: &ProcessSettings) -> Result<SpawnedWorker> {
		use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
		use std::os::unix::net::UnixStream as StdUnixStream;
		use std::process::Stdio;

		use tokio::net::UnixStream;
		use tokio::process::Command;

		use crate::transport::PipeTransport;

		let binary = worker_binary(settings.worker_bin.as_deref())?;
		let command = worker_command(binary);

		let (producer, producer_child) = StdUnixStream::pair()
			.map_err(|e| Error::SpawnFailed(format!("Failed to create socket pair: {}", e)))?;
		let (consumer, consumer_child) = StdUnixStream::pair()
			.map_err(|e| Error::SpawnFailed(format!("Failed to create socket pair: {}", e)))?;

		// Move the child ends above fd 4 so the dup2 calls below cannot clobber them.
		let lift = |fd: &StdUnixStream| -> Result<OwnedFd> {
			// SAFETY: fcntl on a descriptor we own; the result is a new descriptor we take ownership of.
			let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 10) };
			if raw < 0 {
				return Err(Error::SpawnFailed(format!(
					"Failed to duplicate channel fd: {}",
					std::io::Error::last_os_error()
				)));
			}
			// SAFETY: `raw` is a fresh descriptor owned by nobody else.
			Ok(unsafe { OwnedFd::from_raw_fd(raw) })
		};
		let worker_input = lift(&producer_child)?;
		let worker_output = lift(&consumer_child)?;
		drop(producer_child);
		drop(consumer_child);

		let mut cmd = Command::new(&command.program);
		cmd.args(&command.args)
			.args(settings.args())
			.env(VERSION_ENV, env!("CARGO_PKG_VERSION"))
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(false);

		let input_fd = worker_input.as_raw_fd();
		let output_fd = worker_output.as_raw_fd();
		// SAFETY: only async-signal-safe calls between fork and exec.
		unsafe {
			cmd.pre_exec(move || {
				if libc::dup2(input_fd, 3) < 0 || libc::dup2(output_fd, 4) < 0 {
					return Err(std::io::Error::last_os_error());
				}
				Ok(())
			});
		}

		tracing::debug!(
			program = %command.program.display(),
			args = ?cmd.as_std().get_args().collect::<Vec<_>>(),
			"spawning worker process"
		);

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::SpawnFailed(format!("Failed to spawn process: {}", e)))?;
		drop(worker_input);
		drop(worker_output);

		let pid = child
			.id()
			.ok_or_else(|| Error::SpawnFailed("Process exited before reporting a pid".to_string()))?;

		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(relay_lines(stdout, pid, false));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(relay_lines(stderr, pid, true));
		}

		let to_tokio = |stream: StdUnixStream| -> Result<UnixStream> {
			stream.set_nonblocking(true)?;
			Ok(UnixStream::from_std(stream)?)
		};
		let (transport, message_rx) = PipeTransport::new(to_tokio(producer)?, to_tokio(consumer)?);

		let exited = Arc::new(AtomicBool::new(false));
		let handle = ProcessHandle {
			pid,
			exited: Arc::clone(&exited),
			killed: Arc::new(AtomicBool::new(false)),
		};

		let (exit_tx, exit_rx) = oneshot::channel();
		tokio::spawn(async move {
			let exit = match child.wait().await {
				Ok(status) => ProcessExit::from_status(status),
				Err(e) => ProcessExit::WaitFailed(e.to_string()),
			};
			exited.store(true, Ordering::Release);
			tracing::debug!(pid, ?exit, "worker process exited");
			let _ = exit_tx.send(exit);
		});

		Ok(SpawnedWorker {
			pid,
			parts: transport.into_transport_parts(message_rx),
			exit: exit_rx,
			handle,
		})
	}

	#[cfg(not(unix))]
	pub fn spawn(_settings: &ProcessSettings) -> Result<SpawnedWorker> {
		Err(Error::SpawnFailed(
			"Worker channel over fds 3 and 4 requires a Unix platform".to_string(),
		))
	}
}

async fn relay_lines<R>(stream: R, pid: u32, is_stderr: bool)
where
	R: AsyncRead + Unpin,
{
	let mut lines = BufReader::new(stream).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) if is_stderr => {
				tracing::error!(target: WORKER_LOG_TARGET, pid, "(stderr) {}", line)
			}
			Ok(Some(line)) => tracing::debug!(target: WORKER_LOG_TARGET, pid, "(stdout) {}", line),
			Ok(None) => break,
			Err(e) => {
				tracing::debug!(pid, "stdio relay stopped: {}", e);
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_settings_have_no_args() {
		assert!(ProcessSettings::default().args().is_empty());
	}

	#[test]
	fn test_settings_to_args() {
		let settings = ProcessSettings {
			log_level: Some(WorkerLogLevel::Debug),
			log_tags: vec![WorkerLogTag::Ice, WorkerLogTag::Dtls],
			rtc_min_port: Some(40000),
			rtc_max_port: Some(49999),
			dtls_certificate_file: Some(PathBuf::from("/tmp/cert.pem")),
			dtls_private_key_file: Some(PathBuf::from("/tmp/key.pem")),
			libwebrtc_field_trials: Some("WebRTC-Bwe-AlrLimitedBackoff/Enabled/".to_string()),
			disable_liburing: true,
			..Default::default()
		};

		assert_eq!(
			settings.args(),
			vec![
				"--logLevel=debug",
				"--logTag=ice",
				"--logTag=dtls",
				"--rtcMinPort=40000",
				"--rtcMaxPort=49999",
				"--dtlsCertificateFile=/tmp/cert.pem",
				"--dtlsPrivateKeyFile=/tmp/key.pem",
				"--libwebrtcFieldTrials=WebRTC-Bwe-AlrLimitedBackoff/Enabled/",
				"--disableLiburing=true",
			]
		);
	}

	#[test]
	fn test_dtls_files_need_both() {
		let settings = ProcessSettings {
			dtls_certificate_file: Some(PathBuf::from("/tmp/cert.pem")),
			..Default::default()
		};
		assert!(settings.args().is_empty());
	}

	#[test]
	fn test_exit_classification() {
		assert!(matches!(
			ProcessExit::Exited { code: 42 }.startup_error(7),
			Error::SettingsRejected
		));
		assert!(matches!(
			ProcessExit::Exited { code: 1 }.startup_error(7),
			Error::ProcessDied {
				pid: 7,
				code: Some(1),
				signal: None
			}
		));
		// 42 only means "wrong settings" during startup.
		assert!(matches!(
			ProcessExit::Exited { code: 42 }.died_error(7),
			Error::ProcessDied { code: Some(42), .. }
		));
		assert!(matches!(
			ProcessExit::Signaled { signal: 9 }.died_error(7),
			Error::ProcessDied {
				code: None,
				signal: Some(9),
				..
			}
		));
		assert!(matches!(
			ProcessExit::WaitFailed("boom".into()).died_error(7),
			Error::ProcessError { pid: 7, .. }
		));
	}

	#[test]
	fn test_missing_binary_fails_spawn() {
		let settings = ProcessSettings {
			worker_bin: Some(PathBuf::from("/nonexistent/sfu-worker")),
			..Default::default()
		};
		let result = WorkerProcess::spawn(&settings);
		assert!(matches!(result, Err(Error::WorkerBinaryNotFound(_))));
	}

	#[cfg(unix)]
	mod unix {
		use std::io::Write;
		use std::os::unix::fs::PermissionsExt;

		use super::*;

		fn script(body: &str) -> tempfile::TempPath {
			let mut file = tempfile::NamedTempFile::new().unwrap();
			writeln!(file, "#!/bin/sh\n{}", body).unwrap();
			let path = file.into_temp_path();
			std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
			path
		}

		fn settings_for(path: &std::path::Path) -> ProcessSettings {
			ProcessSettings {
				worker_bin: Some(path.to_path_buf()),
				..Default::default()
			}
		}

		#[tokio::test]
		async fn test_exit_code_is_reported() {
			let path = script("exit 42");
			let spawned = WorkerProcess::spawn(&settings_for(&path)).unwrap();
			assert!(spawned.pid > 0);

			let exit = spawned.exit.await.unwrap();
			assert_eq!(exit, ProcessExit::Exited { code: 42 });
			assert!(spawned.handle.has_exited());
		}

		#[tokio::test]
		async fn test_kill_reports_signal() {
			let path = script("exec sleep 30");
			let spawned = WorkerProcess::spawn(&settings_for(&path)).unwrap();

			spawned.handle.kill();
			spawned.handle.kill();

			let exit = spawned.exit.await.unwrap();
			assert_eq!(exit.signal(), Some(libc::SIGTERM));
		}

		#[tokio::test]
		async fn test_channel_fds_are_wired() {
			// Consume one empty frame from fd 3, answer with `{}` on fd 4.
			let path = script(
				"head -c 4 <&3 >/dev/null\n\
				 printf '\\002\\000\\000\\000{}' >&4",
			);
			let spawned = WorkerProcess::spawn(&settings_for(&path)).unwrap();
			let crate::transport::TransportParts {
				mut sender,
				receiver,
				mut message_rx,
			} = spawned.parts;

			sender.send(Vec::new()).await.unwrap();
			tokio::spawn(receiver.run());

			assert_eq!(message_rx.recv().await, Some(b"{}".to_vec()));
			assert_eq!(
				spawned.exit.await.unwrap(),
				ProcessExit::Exited { code: 0 }
			);
		}
	}
}
