//! Log file layout for captured child output.
//!
//! Each process writes to `<log_dir>/<process>/current.log`. When a file
//! reaches its size limit it is renamed to `<unix-secs>.log` next to it and a
//! fresh `current.log` is opened.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CURRENT_LOG: &str = "current.log";

pub fn process_log_dir(log_dir: &Path, process: &str) -> PathBuf {
	log_dir.join(sanitize(process))
}

pub fn current_log_path(log_dir: &Path, process: &str) -> PathBuf {
	process_log_dir(log_dir, process).join(CURRENT_LOG)
}

/// Name for a rotated file; bumps the suffix when two rotations land in the same second.
pub fn rotated_log_path(dir: &Path) -> PathBuf {
	let secs = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0);
	let candidate = dir.join(format!("{}.log", secs));
	if !candidate.exists() {
		return candidate;
	}
	(1..)
		.map(|n| dir.join(format!("{}.{}.log", secs, n)))
		.find(|p| !p.exists())
		.unwrap_or(candidate)
}

/// Keep at most `max_files` rotated logs per process directory, newest first.
pub fn expire_logs(log_dir: &Path, max_files: usize) {
	let Ok(entries) = std::fs::read_dir(log_dir) else {
		return;
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.is_dir() {
			expire_process_logs(&path, max_files);
		}
	}
}

fn expire_process_logs(dir: &Path, max_files: usize) {
	let Ok(entries) = std::fs::read_dir(dir) else {
		return;
	};
	let mut rotated: Vec<(PathBuf, Option<SystemTime>)> = entries
		.flatten()
		.map(|e| e.path())
		.filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
		.filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(CURRENT_LOG))
		.map(|p| {
			let modified = p.metadata().and_then(|m| m.modified()).ok();
			(p, modified)
		})
		.collect();

	if rotated.len() <= max_files {
		return;
	}
	rotated.sort_by(|a, b| b.1.cmp(&a.1));
	for (path, _) in rotated.into_iter().skip(max_files) {
		if let Err(e) = std::fs::remove_file(&path) {
			tracing::debug!("failed to expire {}: {}", path.display(), e);
		}
	}
}

fn sanitize(process: &str) -> String {
	process
		.chars()
		.map(|c| if c == '/' || c == '\0' { '_' } else { c })
		.collect()
}
