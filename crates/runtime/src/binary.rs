//! Worker binary location
//!
//! Resolves the media worker executable and the command used to launch it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable holding an explicit worker binary path.
pub const WORKER_BIN_ENV: &str = "SFU_WORKER_BIN";
/// Environment variable selecting the build flavour (`Debug` or `Release`).
pub const BUILDTYPE_ENV: &str = "SFU_BUILDTYPE";
/// Set to `true` to run the worker under valgrind.
pub const USE_VALGRIND_ENV: &str = "SFU_USE_VALGRIND";
/// Valgrind executable (defaults to `valgrind` on `PATH`).
pub const VALGRIND_BIN_ENV: &str = "SFU_VALGRIND_BIN";
/// Whitespace-separated valgrind options.
pub const VALGRIND_OPTIONS_ENV: &str = "SFU_VALGRIND_OPTIONS";

/// File name of the worker executable inside a build directory.
pub const WORKER_BIN_NAME: &str = if cfg!(windows) {
	"sfu-worker.exe"
} else {
	"sfu-worker"
};

/// Program and leading arguments that start the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
	pub program: PathBuf,
	/// Arguments placed before the worker's own settings arguments.
	pub args: Vec<String>,
}

/// Locates the worker executable.
///
/// Search order:
/// 1. `explicit` (from the worker settings)
/// 2. `SFU_WORKER_BIN` environment variable
/// 3. `worker/out/Debug/sfu-worker` if `SFU_BUILDTYPE=Debug`
/// 4. `worker/out/Release/sfu-worker`
///
/// Build directories are relative to the workspace root.
///
/// # Errors
///
/// Returns `Error::WorkerBinaryNotFound` if the resolved path does not exist.
pub fn worker_binary(explicit: Option<&Path>) -> Result<PathBuf> {
	let path = resolve_worker_binary(explicit, |key| std::env::var(key).ok());
	let exists = path.is_file();
	debug!(target = "sfu", path = %path.display(), exists, "worker binary candidate");
	if exists {
		Ok(path)
	} else {
		Err(Error::WorkerBinaryNotFound(path))
	}
}

/// Builds the launch command for `binary`, wrapping it in valgrind when requested.
pub fn worker_command(binary: PathBuf) -> WorkerCommand {
	command_with_env(binary, |key| std::env::var(key).ok())
}

fn resolve_worker_binary<F>(explicit: Option<&Path>, env: F) -> PathBuf
where
	F: Fn(&str) -> Option<String>,
{
	if let Some(path) = explicit {
		return path.to_path_buf();
	}

	if let Some(path) = env(WORKER_BIN_ENV).filter(|value| !value.is_empty()) {
		return PathBuf::from(path);
	}

	let build_type = match env(BUILDTYPE_ENV).as_deref() {
		Some("Debug") => "Debug",
		_ => "Release",
	};

	workspace_root()
		.join("worker")
		.join("out")
		.join(build_type)
		.join(WORKER_BIN_NAME)
}

fn command_with_env<F>(binary: PathBuf, env: F) -> WorkerCommand
where
	F: Fn(&str) -> Option<String>,
{
	if env(USE_VALGRIND_ENV).as_deref() != Some("true") {
		return WorkerCommand {
			program: binary,
			args: Vec::new(),
		};
	}

	let program = env(VALGRIND_BIN_ENV)
		.filter(|value| !value.is_empty())
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from("valgrind"));

	let mut args: Vec<String> = env(VALGRIND_OPTIONS_ENV)
		.map(|options| options.split_whitespace().map(str::to_string).collect())
		.unwrap_or_default();
	args.push(binary.to_string_lossy().into_owned());

	WorkerCommand { program, args }
}

fn workspace_root() -> PathBuf {
	// crates/runtime -> workspace root
	Path::new(env!("CARGO_MANIFEST_DIR"))
		.ancestors()
		.nth(2)
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn test_explicit_path_wins() {
		let env = env_of(&[(WORKER_BIN_ENV, "/from/env")]);
		let path = resolve_worker_binary(Some(Path::new("/explicit/worker")), env);
		assert_eq!(path, PathBuf::from("/explicit/worker"));
	}

	#[test]
	fn test_env_path_beats_build_type() {
		let env = env_of(&[(WORKER_BIN_ENV, "/from/env"), (BUILDTYPE_ENV, "Debug")]);
		assert_eq!(resolve_worker_binary(None, env), PathBuf::from("/from/env"));
	}

	#[test]
	fn test_build_type_selects_directory() {
		let debug = resolve_worker_binary(None, env_of(&[(BUILDTYPE_ENV, "Debug")]));
		assert!(debug.ends_with(Path::new("worker/out/Debug").join(WORKER_BIN_NAME)));

		let release = resolve_worker_binary(None, env_of(&[]));
		assert!(release.ends_with(Path::new("worker/out/Release").join(WORKER_BIN_NAME)));

		let other = resolve_worker_binary(None, env_of(&[(BUILDTYPE_ENV, "RelWithDebInfo")]));
		assert!(other.ends_with(Path::new("worker/out/Release").join(WORKER_BIN_NAME)));
	}

	#[test]
	fn test_missing_binary_is_reported() {
		let err = worker_binary(Some(Path::new("/definitely/not/here/sfu-worker"))).unwrap_err();
		assert!(matches!(err, Error::WorkerBinaryNotFound(path) if path.ends_with("sfu-worker")));
	}

	#[test]
	fn test_plain_command() {
		let command = command_with_env(PathBuf::from("/bin/worker"), env_of(&[]));
		assert_eq!(command.program, PathBuf::from("/bin/worker"));
		assert!(command.args.is_empty());
	}

	#[test]
	fn test_valgrind_command() {
		let env = env_of(&[
			(USE_VALGRIND_ENV, "true"),
			(VALGRIND_BIN_ENV, "/usr/bin/valgrind"),
			(VALGRIND_OPTIONS_ENV, "--leak-check=full  --track-fds=yes"),
		]);
		let command = command_with_env(PathBuf::from("/bin/worker"), env);
		assert_eq!(command.program, PathBuf::from("/usr/bin/valgrind"));
		assert_eq!(
			command.args,
			vec!["--leak-check=full", "--track-fds=yes", "/bin/worker"]
		);
	}

	#[test]
	fn test_valgrind_defaults_to_path_lookup() {
		let env = env_of(&[(USE_VALGRIND_ENV, "true")]);
		let command = command_with_env(PathBuf::from("/bin/worker"), env);
		assert_eq!(command.program, PathBuf::from("valgrind"));
		assert_eq!(command.args, vec!["/bin/worker"]);
	}
}
