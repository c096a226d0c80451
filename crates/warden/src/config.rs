use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::output::{LogSink, TracingSink};
use crate::paths::RuntimePaths;

/// On-disk runtime configuration (`config.toml`).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
	#[serde(default)]
	pub supervisor: SupervisorSettings,
	#[serde(default)]
	pub autostart: AutostartSettings,
	#[serde(default)]
	pub plugin: PluginSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
	pub log_dir: Option<PathBuf>,
	#[serde(default = "default_max_log_size")]
	pub max_log_size: u64,
	#[serde(default = "default_max_log_files")]
	pub max_log_files: usize,
	#[serde(default = "default_death_buffer")]
	pub death_buffer: usize,
	#[serde(default = "default_stop_grace")]
	pub stop_grace_secs: u64,
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self {
			log_dir: None,
			max_log_size: default_max_log_size(),
			max_log_files: default_max_log_files(),
			death_buffer: default_death_buffer(),
			stop_grace_secs: default_stop_grace(),
		}
	}
}

fn default_max_log_size() -> u64 {
	10 * 1024 * 1024
}
fn default_max_log_files() -> usize {
	5
}
fn default_death_buffer() -> usize {
	64
}
fn default_stop_grace() -> u64 {
	3
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AutostartSettings {
	pub store: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginSettings {
	#[serde(default = "default_handshake_timeout")]
	pub handshake_timeout_secs: u64,
}

impl Default for PluginSettings {
	fn default() -> Self {
		Self {
			handshake_timeout_secs: default_handshake_timeout(),
		}
	}
}

fn default_handshake_timeout() -> u64 {
	60
}

impl RuntimeConfig {
	pub fn from_toml(content: &str) -> Result<Self> {
		toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
	}

	/// Read `path`; a missing file yields the defaults.
	pub fn load(path: &Path) -> Result<Self> {
		match std::fs::read_to_string(path) {
			Ok(content) => Self::from_toml(&content),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
			Err(e) => Err(Error::Config(format!("failed to read {}: {}", path.display(), e))),
		}
	}

	pub fn log_dir(&self, paths: &RuntimePaths) -> PathBuf {
		self.supervisor.log_dir.clone().unwrap_or_else(|| paths.log_dir())
	}

	pub fn store_path(&self, paths: &RuntimePaths) -> PathBuf {
		self.autostart.store.clone().unwrap_or_else(|| paths.autostart_store())
	}
}

/// Knobs the supervisor runs with.
#[derive(Clone)]
pub struct SupervisorConfig {
	pub log_sink: Arc<dyn LogSink>,
	/// SIGKILL follows a SIGTERM that has not taken effect after this long; zero disables.
	pub stop_grace: Duration,
	/// How long the reaper lets output pumps flush after the child exits.
	pub output_drain: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			log_sink: Arc::new(TracingSink),
			stop_grace: Duration::from_secs(default_stop_grace()),
			output_drain: Duration::from_millis(200),
		}
	}
}

impl SupervisorConfig {
	pub fn from_settings(settings: &SupervisorSettings, log_sink: Arc<dyn LogSink>) -> Self {
		Self {
			log_sink,
			stop_grace: Duration::from_secs(settings.stop_grace_secs),
			..Self::default()
		}
	}
}
