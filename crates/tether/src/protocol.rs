use std::fmt;
use std::str::FromStr;

/// Handshake tag naming the RPC protocol a plugin speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Protocol(pub u32);

impl Protocol {
	/// No RPC channel at all.
	pub const NONE: Self = Self(0);
	/// Line-delimited JSON-RPC 2.0.
	pub const JSON_RPC: Self = Self(1);

	pub fn name(self) -> Option<&'static str> {
		match self {
			Self::NONE => Some("None"),
			Self::JSON_RPC => Some("JsonRpc"),
			_ => None,
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.name() {
			Some(name) => f.write_str(name),
			None => write!(f, "Protocol({})", self.0),
		}
	}
}

impl FromStr for Protocol {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if let Ok(tag) = s.parse::<u32>() {
			return Ok(Self(tag));
		}
		match s.to_ascii_lowercase().as_str() {
			"none" => Ok(Self::NONE),
			"jsonrpc" | "json-rpc" => Ok(Self::JSON_RPC),
			_ => Err(format!("unknown protocol: {}", s)),
		}
	}
}

/// An ordered allow-list; displays as the comma-separated names handed to
/// plugins through `ENV_ALLOW_PLUGIN_RPC_PROTOCOL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocols(pub Vec<Protocol>);

impl Protocols {
	pub fn contains(&self, protocol: Protocol) -> bool {
		self.0.contains(&protocol)
	}
}

impl Default for Protocols {
	fn default() -> Self {
		Self(vec![Protocol::JSON_RPC])
	}
}

impl fmt::Display for Protocols {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let names: Vec<String> = self.0.iter().map(ToString::to_string).collect();
		f.write_str(&names.join(","))
	}
}

impl FromStr for Protocols {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.split(',')
			.filter(|part| !part.trim().is_empty())
			.map(str::parse)
			.collect::<Result<Vec<_>, _>>()
			.map(Self)
	}
}

/// Free loopback address the host suggests the plugin listen on.
pub const ENV_PLUGIN_LISTENER_ADDRESS: &str = "ENV_PLUGIN_LISTENER_ADDRESS";
/// Comma-separated protocol names the host accepts.
pub const ENV_ALLOW_PLUGIN_RPC_PROTOCOL: &str = "ENV_ALLOW_PLUGIN_RPC_PROTOCOL";
/// Plugin API version the host asks for.
pub const ENV_REQUEST_VERSION: &str = "ENV_REQUEST_VERSION";
