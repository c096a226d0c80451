use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::logs;

const RING_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
	Stdout,
	Stderr,
	Data,
}

impl fmt::Display for Stream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Stream::Stdout => "stdout",
			Stream::Stderr => "stderr",
			Stream::Data => "data",
		})
	}
}

/// Where `HookLog` children and handshake chatter end up.
pub trait LogSink: Send + Sync {
	fn write_line(&self, process: &str, stream: Stream, line: &str);
}

/// Forwards every line as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
	fn write_line(&self, process: &str, stream: Stream, line: &str) {
		match stream {
			Stream::Stderr => tracing::warn!(target: "warden::child", process, %stream, "{}", line),
			_ => tracing::info!(target: "warden::child", process, %stream, "{}", line),
		}
	}
}

/// Ring buffer + size-rotated log file + live subscription for one process.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	log_writer: Arc<Mutex<LogWriter>>,
	sender: broadcast::Sender<String>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	bytes_written: u64,
	max_size: u64,
}

impl OutputCapture {
	pub fn new(log_dir: &Path, process: &str, max_log_size: u64) -> Self {
		let path = logs::current_log_path(log_dir, process);
		if let Some(parent) = path.parent() {
			if let Err(e) = fs::create_dir_all(parent) {
				tracing::warn!("{}: cannot create log dir {}: {}", process, parent.display(), e);
			}
		}

		let file = open_append(&path);
		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		let (sender, _) = broadcast::channel(256);

		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
			log_writer: Arc::new(Mutex::new(LogWriter {
				file,
				path,
				bytes_written,
				max_size: max_log_size,
			})),
			sender,
		}
	}

	pub fn write(&self, data: &[u8]) {
		if let Ok(mut ring) = self.ring.lock() {
			for &byte in data {
				if ring.len() >= RING_BUFFER_SIZE {
					ring.pop_front();
				}
				ring.push_back(byte);
			}
		}

		if let Ok(mut writer) = self.log_writer.lock() {
			writer.write(data);
		}
	}

	pub fn write_line(&self, stream: Stream, line: &str) {
		let entry = match stream {
			Stream::Stdout => format!("{}\n", line),
			other => format!("[{}] {}\n", other, line),
		};
		self.write(entry.as_bytes());
		let _ = self.sender.send(line.to_string());
	}

	pub fn snapshot(&self) -> Vec<u8> {
		self.ring
			.lock()
			.map(|ring| ring.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<String> {
		self.sender.subscribe()
	}

	pub fn log_path(&self) -> Option<PathBuf> {
		self.log_writer.lock().ok().map(|w| w.path.clone())
	}
}

impl LogWriter {
	fn write(&mut self, data: &[u8]) {
		let Some(file) = self.file.as_mut() else {
			return;
		};
		if file.write_all(data).is_err() {
			return;
		}
		self.bytes_written += data.len() as u64;
		if self.max_size > 0 && self.bytes_written >= self.max_size {
			self.rotate();
		}
	}

	fn rotate(&mut self) {
		drop(self.file.take());

		if let Some(dir) = self.path.parent() {
			let rotated = logs::rotated_log_path(dir);
			if let Err(e) = fs::rename(&self.path, &rotated) {
				tracing::warn!("log rotation of {} failed: {}", self.path.display(), e);
			}
		}

		self.file = open_append(&self.path);
		self.bytes_written = 0;
	}
}

fn open_append(path: &Path) -> Option<File> {
	OpenOptions::new().create(true).append(true).open(path).ok()
}

/// A [`LogSink`] keeping one [`OutputCapture`] per process name.
pub struct CaptureSink {
	log_dir: PathBuf,
	max_log_size: u64,
	captures: Mutex<HashMap<String, OutputCapture>>,
}

impl CaptureSink {
	pub fn new(log_dir: impl Into<PathBuf>, max_log_size: u64) -> Self {
		Self {
			log_dir: log_dir.into(),
			max_log_size,
			captures: Mutex::new(HashMap::new()),
		}
	}

	pub fn capture(&self, process: &str) -> OutputCapture {
		let mut captures = match self.captures.lock() {
			Ok(c) => c,
			Err(poisoned) => poisoned.into_inner(),
		};
		captures
			.entry(process.to_string())
			.or_insert_with(|| OutputCapture::new(&self.log_dir, process, self.max_log_size))
			.clone()
	}

	pub fn log_dir(&self) -> &Path {
		&self.log_dir
	}
}

impl LogSink for CaptureSink {
	fn write_line(&self, process: &str, stream: Stream, line: &str) {
		self.capture(process).write_line(stream, line);
	}
}
