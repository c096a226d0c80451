//! The secondary channel to a running plugin.
//!
//! A [`Dialer`] turns the address from the handshake into a [`Channel`];
//! [`Dialers`] maps protocol tags to dialers so new protocols plug in
//! without touching the host. [`CoreClient`] speaks the lifecycle methods
//! every plugin serves.

pub mod jsonrpc;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::address::PluginAddress;
use crate::error::{Error, Result};
use crate::protocol::{Protocol, Protocols};

pub use jsonrpc::{JsonRpcChannel, JsonRpcDialer};
pub use transport::{TlsConfig, Transport};

pub const METHOD_INITIALIZE: &str = "Plugin.Initialize";
pub const METHOD_DEPLOY: &str = "Plugin.Deploy";
pub const METHOD_UNINITIALIZE: &str = "Plugin.UnInitialize";
pub const METHOD_PING: &str = "Plugin.Ping";

/// A request/response channel to one plugin.
#[async_trait]
pub trait Channel: Send + Sync {
	async fn call(&self, method: &str, params: Value) -> Result<Value>;
	async fn close(&self);
	fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Dialer: Send + Sync {
	async fn dial(&self, address: &PluginAddress, tls: Option<&TlsConfig>) -> Result<Arc<dyn Channel>>;
}

/// Protocol tag → dialer.
#[derive(Clone)]
pub struct Dialers {
	dialers: HashMap<Protocol, Arc<dyn Dialer>>,
}

impl Dialers {
	pub fn empty() -> Self {
		Self {
			dialers: HashMap::new(),
		}
	}

	pub fn register(&mut self, protocol: Protocol, dialer: Arc<dyn Dialer>) -> &mut Self {
		self.dialers.insert(protocol, dialer);
		self
	}

	pub fn protocols(&self) -> Protocols {
		let mut tags: Vec<Protocol> = self.dialers.keys().copied().collect();
		tags.sort();
		Protocols(tags)
	}

	pub async fn dial(
		&self,
		protocol: Protocol,
		address: &PluginAddress,
		tls: Option<&TlsConfig>,
	) -> Result<Arc<dyn Channel>> {
		let dialer = self.dialers.get(&protocol).ok_or_else(|| Error::ProtocolUnsupported {
			protocol,
			allowed: self.protocols(),
		})?;
		tracing::debug!("dialing {} over {}", address, protocol);
		dialer.dial(address, tls).await
	}
}

impl Default for Dialers {
	fn default() -> Self {
		let mut dialers = Self::empty();
		dialers.register(Protocol::JSON_RPC, Arc::new(JsonRpcDialer));
		dialers
	}
}

#[derive(Debug, Deserialize)]
struct CoreReply {
	#[serde(default)]
	error: String,
}

/// Lifecycle methods common to every plugin.
#[derive(Clone)]
pub struct CoreClient {
	channel: Arc<dyn Channel>,
}

impl CoreClient {
	pub fn new(channel: Arc<dyn Channel>) -> Self {
		Self { channel }
	}

	pub fn channel(&self) -> &Arc<dyn Channel> {
		&self.channel
	}

	pub async fn initialize(&self) -> Result<()> {
		self.core_call(METHOD_INITIALIZE, json!({})).await
	}

	/// Ask the plugin to bring up capability `name`.
	pub async fn deploy(&self, name: &str) -> Result<()> {
		self.core_call(METHOD_DEPLOY, json!({ "name": name })).await
	}

	pub async fn uninitialize(&self) -> Result<()> {
		self.core_call(METHOD_UNINITIALIZE, json!({})).await
	}

	pub async fn ping(&self, service: &str) -> Result<()> {
		self.core_call(METHOD_PING, json!({ "service": service })).await
	}

	async fn core_call(&self, method: &str, params: Value) -> Result<()> {
		let value = self.channel.call(method, params).await?;
		let reply: CoreReply = serde_json::from_value(value)
			.map_err(|e| Error::RpcFailed(format!("{}: bad reply: {}", method, e)))?;
		if reply.error.is_empty() {
			Ok(())
		} else {
			Err(Error::RpcFailed(format!("{}: {}", method, reply.error)))
		}
	}

	pub async fn close(&self) {
		self.channel.close().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn unknown_protocol_has_no_dialer() {
		let dialers = Dialers::default();
		let addr: PluginAddress = "tcp://127.0.0.1:1".parse().unwrap();
		match dialers.dial(Protocol::NONE, &addr, None).await {
			Err(Error::ProtocolUnsupported { protocol, allowed }) => {
				assert_eq!(protocol, Protocol::NONE);
				assert_eq!(allowed, Protocols(vec![Protocol::JSON_RPC]));
			}
			other => panic!("expected ProtocolUnsupported, got {:?}", other.err()),
		}
	}
}
