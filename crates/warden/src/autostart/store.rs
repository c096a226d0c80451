use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ProcessParams;

/// One persisted auto-start row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoStartEntry {
	pub id: u64,
	/// Higher starts first.
	#[serde(default)]
	pub priority: i32,
	#[serde(default, with = "whole_secs")]
	pub start_delay: Duration,
	#[serde(default, with = "whole_secs")]
	pub stop_delay: Duration,
	#[serde(default = "default_true")]
	pub enable: bool,
	#[serde(default)]
	pub parallel: bool,
	/// Seconds since the Unix epoch.
	#[serde(default)]
	pub created_at: u64,
	pub params: ProcessParams,
}

fn default_true() -> bool {
	true
}

impl AutoStartEntry {
	/// A fresh, enabled, sequential entry with no delays. The id is assigned
	/// when the entry is added to the catalog.
	pub fn new(params: ProcessParams) -> Self {
		Self {
			id: 0,
			priority: 0,
			start_delay: Duration::ZERO,
			stop_delay: Duration::ZERO,
			enable: true,
			parallel: false,
			created_at: now_secs(),
			params,
		}
	}

	pub fn priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	pub fn start_delay(mut self, delay: Duration) -> Self {
		self.start_delay = delay;
		self
	}

	pub fn stop_delay(mut self, delay: Duration) -> Self {
		self.stop_delay = delay;
		self
	}

	pub fn parallel(mut self, parallel: bool) -> Self {
		self.parallel = parallel;
		self
	}

	pub fn enable(mut self, enable: bool) -> Self {
		self.enable = enable;
		self
	}

	pub fn apply(&mut self, patch: &AutoStartPatch) {
		if let Some(priority) = patch.priority {
			self.priority = priority;
		}
		if let Some(delay) = patch.start_delay {
			self.start_delay = delay;
		}
		if let Some(delay) = patch.stop_delay {
			self.stop_delay = delay;
		}
		if let Some(enable) = patch.enable {
			self.enable = enable;
		}
		if let Some(parallel) = patch.parallel {
			self.parallel = parallel;
		}
		if let Some(params) = &patch.params {
			self.params = params.clone();
		}
	}
}

/// Fields to change on an existing entry; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoStartPatch {
	pub priority: Option<i32>,
	pub start_delay: Option<Duration>,
	pub stop_delay: Option<Duration>,
	pub enable: Option<bool>,
	pub parallel: Option<bool>,
	pub params: Option<ProcessParams>,
}

impl AutoStartPatch {
	pub fn enable(enable: bool) -> Self {
		Self {
			enable: Some(enable),
			..Self::default()
		}
	}
}

/// Persistence for the auto-start catalog.
pub trait AutoStartStore: Send + Sync {
	fn find_all(&self) -> Result<Vec<AutoStartEntry>>;
	fn insert(&self, entry: &AutoStartEntry) -> Result<()>;
	fn update(&self, id: u64, patch: &AutoStartPatch) -> Result<()>;
	fn delete(&self, id: u64) -> Result<()>;
}

/// Keeps entries in memory only. Preserves sub-second delays.
#[derive(Default)]
pub struct MemoryStore {
	entries: Mutex<Vec<AutoStartEntry>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_entries(entries: Vec<AutoStartEntry>) -> Self {
		Self {
			entries: Mutex::new(entries),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AutoStartEntry>> {
		match self.entries.lock() {
			Ok(entries) => entries,
			Err(poisoned) => poisoned.into_inner(),
		}
	}
}

impl AutoStartStore for MemoryStore {
	fn find_all(&self) -> Result<Vec<AutoStartEntry>> {
		Ok(self.lock().clone())
	}

	fn insert(&self, entry: &AutoStartEntry) -> Result<()> {
		insert_into(&mut self.lock(), entry)
	}

	fn update(&self, id: u64, patch: &AutoStartPatch) -> Result<()> {
		update_in(&mut self.lock(), id, patch)
	}

	fn delete(&self, id: u64) -> Result<()> {
		delete_from(&mut self.lock(), id)
	}
}

/// The whole catalog as one JSON document, rewritten atomically on change.
pub struct JsonFileStore {
	path: PathBuf,
	lock: Mutex<()>,
}

impl JsonFileStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn read(&self) -> Result<Vec<AutoStartEntry>> {
		let content = match std::fs::read_to_string(&self.path) {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(Error::Store(format!("read {}: {}", self.path.display(), e))),
		};
		if content.trim().is_empty() {
			return Ok(Vec::new());
		}
		serde_json::from_str(&content)
			.map_err(|e| Error::Store(format!("parse {}: {}", self.path.display(), e)))
	}

	fn write(&self, entries: &[AutoStartEntry]) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let json = serde_json::to_string_pretty(entries).map_err(|e| Error::Store(e.to_string()))?;
		let tmp = self.path.with_extension("json.tmp");
		std::fs::write(&tmp, json)?;
		std::fs::rename(&tmp, &self.path)?;
		Ok(())
	}

	fn modify(&self, f: impl FnOnce(&mut Vec<AutoStartEntry>) -> Result<()>) -> Result<()> {
		let _guard = match self.lock.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		};
		let mut entries = self.read()?;
		f(&mut entries)?;
		self.write(&entries)
	}
}

impl AutoStartStore for JsonFileStore {
	fn find_all(&self) -> Result<Vec<AutoStartEntry>> {
		self.read()
	}

	fn insert(&self, entry: &AutoStartEntry) -> Result<()> {
		self.modify(|entries| insert_into(entries, entry))
	}

	fn update(&self, id: u64, patch: &AutoStartPatch) -> Result<()> {
		self.modify(|entries| update_in(entries, id, patch))
	}

	fn delete(&self, id: u64) -> Result<()> {
		self.modify(|entries| delete_from(entries, id))
	}
}

fn insert_into(entries: &mut Vec<AutoStartEntry>, entry: &AutoStartEntry) -> Result<()> {
	if entries.iter().any(|e| e.id == entry.id) {
		return Err(Error::Store(format!("entry {} already stored", entry.id)));
	}
	entries.push(entry.clone());
	Ok(())
}

fn update_in(entries: &mut [AutoStartEntry], id: u64, patch: &AutoStartPatch) -> Result<()> {
	let entry = entries
		.iter_mut()
		.find(|e| e.id == id)
		.ok_or(Error::EntryNotFound(id))?;
	entry.apply(patch);
	Ok(())
}

fn delete_from(entries: &mut Vec<AutoStartEntry>, id: u64) -> Result<()> {
	let before = entries.len();
	entries.retain(|e| e.id != id);
	if entries.len() == before {
		return Err(Error::EntryNotFound(id));
	}
	Ok(())
}

pub(crate) fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Delays live in the store as whole seconds (i32).
mod whole_secs {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		let secs = i32::try_from(delay.as_secs()).unwrap_or(i32::MAX);
		serializer.serialize_i32(secs)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let secs = i32::deserialize(deserializer)?;
		Ok(Duration::from_secs(secs.max(0) as u64))
	}
}
