use std::io;
use std::path::PathBuf;

/// Errors raised by the supervisor, the watchdog and the auto-start catalog.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("{0}: already exists")]
	AlreadyExists(String),

	#[error("{0}: not found")]
	NotFound(String),

	#[error("{name}: not running (status {status})")]
	NotRunning { name: String, status: crate::types::ProcessStatus },

	#[error("{name}: cannot start from status {status}")]
	NotPrepared { name: String, status: crate::types::ProcessStatus },

	#[error("{0}: still running")]
	StillRunning(String),

	#[error("{name}: pipe allocation failed: {source}")]
	PipeAllocation {
		name: String,
		#[source]
		source: io::Error,
	},

	#[error("{name}: executable not found: {cmd}")]
	ExecutableNotFound { name: String, cmd: String },

	#[error("{name}: permission denied: {cmd}")]
	PermissionDenied { name: String, cmd: String },

	#[error("{name}: working directory not found: {}", dir.display())]
	WorkDirNotFound { name: String, dir: PathBuf },

	#[error("{name}: spawn failed: {source}")]
	Spawn {
		name: String,
		#[source]
		source: io::Error,
	},

	#[error("{name}: signal {signal} failed: {source}")]
	Signal {
		name: String,
		signal: &'static str,
		#[source]
		source: nix::Error,
	},

	#[error("{0}: not watching")]
	NotWatching(String),

	#[error("{0}: watch is stopping")]
	WatchStopping(String),

	#[error("autostart entry {0} not found")]
	EntryNotFound(u64),

	#[error("store error: {0}")]
	Store(String),

	#[error("config error: {0}")]
	Config(String),

	#[error("io error: {0}")]
	Io(#[from] io::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
