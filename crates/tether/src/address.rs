//! Scheme addresses: `tcp://host:port`, `tcp4://…`, `tcp6://…`, `unix:///path`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpFamily {
	Any,
	V4,
	V6,
}

impl TcpFamily {
	fn scheme(self) -> &'static str {
		match self {
			TcpFamily::Any => "tcp",
			TcpFamily::V4 => "tcp4",
			TcpFamily::V6 => "tcp6",
		}
	}

	pub fn admits(self, addr: &SocketAddr) -> bool {
		match self {
			TcpFamily::Any => true,
			TcpFamily::V4 => addr.is_ipv4(),
			TcpFamily::V6 => addr.is_ipv6(),
		}
	}
}

/// Where a plugin listens for its RPC channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PluginAddress {
	Tcp { family: TcpFamily, host: String, port: u16 },
	Unix(PathBuf),
}

impl PluginAddress {
	pub fn tcp(addr: SocketAddr) -> Self {
		let family = if addr.is_ipv4() { TcpFamily::V4 } else { TcpFamily::V6 };
		PluginAddress::Tcp {
			family,
			host: addr.ip().to_string(),
			port: addr.port(),
		}
	}

	/// Host part, used as the default TLS server name.
	pub fn host(&self) -> Option<&str> {
		match self {
			PluginAddress::Tcp { host, .. } => Some(host),
			PluginAddress::Unix(_) => None,
		}
	}
}

/// Bind an ephemeral loopback port, release it, and return its address.
pub fn random_listener_address() -> std::io::Result<PluginAddress> {
	let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
	let addr = listener.local_addr()?;
	drop(listener);
	Ok(PluginAddress::tcp(addr))
}

impl fmt::Display for PluginAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PluginAddress::Tcp { family, host, port } if host.contains(':') => {
				write!(f, "{}://[{}]:{}", family.scheme(), host, port)
			}
			PluginAddress::Tcp { family, host, port } => write!(f, "{}://{}:{}", family.scheme(), host, port),
			PluginAddress::Unix(path) => write!(f, "unix://{}", path.display()),
		}
	}
}

impl FromStr for PluginAddress {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let bad = || Error::AddressMalformed(s.to_string());
		let (scheme, endpoint) = s.trim().split_once("://").ok_or_else(bad)?;

		let family = match scheme.to_ascii_lowercase().as_str() {
			"tcp" => TcpFamily::Any,
			"tcp4" => TcpFamily::V4,
			"tcp6" => TcpFamily::V6,
			"unix" => {
				if !endpoint.starts_with('/') {
					return Err(bad());
				}
				return Ok(PluginAddress::Unix(PathBuf::from(endpoint)));
			}
			_ => return Err(bad()),
		};

		let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
			let (host, port) = rest.split_once("]:").ok_or_else(bad)?;
			if host.parse::<std::net::Ipv6Addr>().is_err() {
				return Err(bad());
			}
			(host, port)
		} else {
			let (host, port) = endpoint.rsplit_once(':').ok_or_else(bad)?;
			if host.contains(':') {
				return Err(bad());
			}
			(host, port)
		};
		if host.is_empty() {
			return Err(bad());
		}
		let port: u16 = port.parse().map_err(|_| bad())?;

		match (family, host.parse::<IpAddr>()) {
			(TcpFamily::V4, Ok(IpAddr::V6(_))) | (TcpFamily::V6, Ok(IpAddr::V4(_))) => return Err(bad()),
			_ => {}
		}

		Ok(PluginAddress::Tcp {
			family,
			host: host.to_string(),
			port,
		})
	}
}
