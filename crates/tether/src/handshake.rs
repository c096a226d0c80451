//! The plugin's stdout handshake.
//!
//! A plugin announces itself with `<Key>: <Value>` lines and finishes with
//! `DONE:`. Keys are case-insensitive, the last value of a repeated key
//! wins, and everything is validated once `DONE` arrives:
//!
//! ```text
//! CoreVersion: 1.0.0
//! Version: 1.0.0
//! Address: tcp4://127.0.0.1:40123
//! RPCProtocol: 1
//! DONE:
//! ```

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use warden::Process;

use crate::address::PluginAddress;
use crate::error::{Error, Result, VersionKind};
use crate::protocol::{Protocol, Protocols};
use crate::version::SemanticVersion;

/// Version of the host side of the handshake and core RPCs.
pub const CORE_VERSION: &str = "1.0.0-rc1";

pub const KEY_CORE_VERSION: &str = "CoreVersion";
pub const KEY_VERSION: &str = "Version";
pub const KEY_ADDRESS: &str = "Address";
pub const KEY_RPC_PROTOCOL: &str = "RPCProtocol";
pub const KEY_DONE: &str = "DONE";

pub fn core_version() -> SemanticVersion {
	SemanticVersion {
		major: 1,
		minor: 0,
		patch: 0,
		pre: vec!["rc1".to_string()],
		build: Vec::new(),
	}
}

/// What a plugin announced, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginReport {
	pub core_version: SemanticVersion,
	pub version: SemanticVersion,
	pub address: PluginAddress,
	pub protocol: Protocol,
}

#[derive(Debug, PartialEq)]
pub enum Step {
	/// Record accepted, keep reading.
	Continue,
	/// Not a record; plain plugin output.
	Output(String),
	Done(PluginReport),
}

/// Accumulates handshake records line by line.
#[derive(Debug)]
pub struct HandshakeParser {
	core_version: SemanticVersion,
	requested_version: SemanticVersion,
	allowed: Protocols,
	plugin_core_version: Option<String>,
	version: Option<String>,
	address: Option<String>,
	protocol: Option<String>,
}

impl HandshakeParser {
	pub fn new(requested_version: SemanticVersion, allowed: Protocols) -> Self {
		Self {
			core_version: core_version(),
			requested_version,
			allowed,
			plugin_core_version: None,
			version: None,
			address: None,
			protocol: None,
		}
	}

	pub fn feed(&mut self, line: &str) -> Result<Step> {
		let line = line.trim();
		if line.is_empty() {
			return Ok(Step::Continue);
		}
		let Some((key, value)) = line.split_once(':') else {
			return Ok(Step::Output(line.to_string()));
		};
		let (key, value) = (key.trim(), value.trim());
		if key.is_empty() {
			return Err(Error::HandshakeMalformed(format!("empty key in {:?}", line)));
		}

		let slot = if key.eq_ignore_ascii_case(KEY_CORE_VERSION) {
			&mut self.plugin_core_version
		} else if key.eq_ignore_ascii_case(KEY_VERSION) {
			&mut self.version
		} else if key.eq_ignore_ascii_case(KEY_ADDRESS) {
			&mut self.address
		} else if key.eq_ignore_ascii_case(KEY_RPC_PROTOCOL) {
			&mut self.protocol
		} else if key.eq_ignore_ascii_case(KEY_DONE) {
			return self.finish().map(Step::Done);
		} else {
			tracing::warn!("ignoring unknown handshake key {:?}", key);
			return Ok(Step::Continue);
		};
		*slot = Some(value.to_string());
		Ok(Step::Continue)
	}

	fn finish(&self) -> Result<PluginReport> {
		let required = |value: &Option<String>, key: &str| {
			value
				.clone()
				.ok_or_else(|| Error::HandshakeMalformed(format!("{} missing before {}", key, KEY_DONE)))
		};

		let core: SemanticVersion = required(&self.plugin_core_version, KEY_CORE_VERSION)?.parse()?;
		if !self.core_version.compatible(&core) {
			return Err(Error::VersionIncompatible {
				kind: VersionKind::Core,
				offered: core,
				expected: self.core_version.clone(),
			});
		}

		let version: SemanticVersion = required(&self.version, KEY_VERSION)?.parse()?;
		if !self.requested_version.compatible(&version) {
			return Err(Error::VersionIncompatible {
				kind: VersionKind::Plugin,
				offered: version,
				expected: self.requested_version.clone(),
			});
		}

		let address: PluginAddress = required(&self.address, KEY_ADDRESS)?.parse()?;

		let raw = required(&self.protocol, KEY_RPC_PROTOCOL)?;
		let protocol = raw
			.parse::<u32>()
			.map(Protocol)
			.map_err(|_| Error::HandshakeMalformed(format!("{} is not a protocol tag: {:?}", KEY_RPC_PROTOCOL, raw)))?;
		if !self.allowed.contains(protocol) {
			return Err(Error::ProtocolUnsupported {
				protocol,
				allowed: self.allowed.clone(),
			});
		}

		Ok(PluginReport {
			core_version: core,
			version,
			address,
			protocol,
		})
	}
}

/// Render the handshake a plugin prints for `report`.
pub fn announce(report: &PluginReport) -> String {
	format!(
		"{}: {}\n{}: {}\n{}: {}\n{}: {}\n{}:\n",
		KEY_CORE_VERSION,
		report.core_version,
		KEY_VERSION,
		report.version,
		KEY_ADDRESS,
		report.address,
		KEY_RPC_PROTOCOL,
		report.protocol.0,
		KEY_DONE
	)
}

/// Feed `lines` (the child's stdout, subscribed before it started) to
/// `parser` until `DONE`, the child exits, or `timeout` elapses.
pub async fn read_handshake(
	process: &Process,
	mut lines: broadcast::Receiver<String>,
	mut parser: HandshakeParser,
	timeout: Duration,
) -> Result<PluginReport> {
	let deadline = tokio::time::sleep(timeout);
	tokio::pin!(deadline);
	let exited = process.exited();
	tokio::pin!(exited);

	loop {
		tokio::select! {
			biased;
			line = lines.recv() => match line {
				Ok(line) => match parser.feed(&line)? {
					Step::Continue => {}
					Step::Output(text) => tracing::debug!("{}: {}", process.name(), text),
					Step::Done(report) => return Ok(report),
				},
				Err(RecvError::Lagged(n)) => {
					tracing::warn!("{}: handshake reader lagged, {} lines lost", process.name(), n);
				}
				Err(RecvError::Closed) => return Err(Error::HandshakeChildExited),
			},
			_ = &mut exited => return Err(Error::HandshakeChildExited),
			_ = &mut deadline => return Err(Error::HandshakeTimeout),
		}
	}
}
