use std::fmt;

use crate::protocol::{Protocol, Protocols};
use crate::version::SemanticVersion;

/// Which version line of the handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKind {
	Core,
	Plugin,
}

impl fmt::Display for VersionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			VersionKind::Core => "core API",
			VersionKind::Plugin => "plugin API",
		})
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("malformed handshake: {0}")]
	HandshakeMalformed(String),

	#[error("timed out waiting for plugin handshake")]
	HandshakeTimeout,

	#[error("plugin exited before the handshake completed")]
	HandshakeChildExited,

	#[error("incompatible {kind} version: plugin offers {offered}, expected {expected}")]
	VersionIncompatible {
		kind: VersionKind,
		offered: SemanticVersion,
		expected: SemanticVersion,
	},

	#[error("invalid version {0:?}")]
	VersionMalformed(String),

	#[error("unsupported plugin protocol {protocol}, supported: {allowed}")]
	ProtocolUnsupported { protocol: Protocol, allowed: Protocols },

	#[error("unsupported address format: {0}")]
	AddressMalformed(String),

	#[error("rpc failed: {0}")]
	RpcFailed(String),

	#[error("operation cancelled")]
	Cancelled,

	#[error(transparent)]
	Process(#[from] warden::Error),

	#[error("{}", join(.0))]
	Composite(Vec<Error>),

	#[error("internal error: {0}")]
	Internal(String),
}

fn join(errors: &[Error]) -> String {
	errors
		.iter()
		.map(ToString::to_string)
		.collect::<Vec<_>>()
		.join("; ")
}

impl Error {
	/// Collapse a list of failures: none is `Ok`, one is itself, more are `Composite`.
	pub fn from_many(mut errors: Vec<Error>) -> Result<()> {
		match errors.len() {
			0 => Ok(()),
			1 => Err(errors.remove(0)),
			_ => Err(Error::Composite(errors)),
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::RpcFailed(e.to_string())
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
