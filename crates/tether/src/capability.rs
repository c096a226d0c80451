//! Typed clients for what a plugin deploys.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::rpc::Channel;

pub const COMMAND: &str = "command";

pub const METHOD_COMMAND: &str = "Command.Command";
pub const METHOD_GET_HELP: &str = "Command.GetHelp";
pub const METHOD_LIST_COMMAND: &str = "Command.ListCommand";

/// A deployed capability.
#[derive(Clone)]
pub enum Capability {
	Command(CommandClient),
	/// No typed client is registered; the caller speaks the raw channel.
	Custom { name: String, channel: Arc<dyn Channel> },
}

impl Capability {
	pub fn name(&self) -> &str {
		match self {
			Capability::Command(_) => COMMAND,
			Capability::Custom { name, .. } => name,
		}
	}
}

impl fmt::Debug for Capability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Capability::Command(_) => f.write_str("Capability::Command"),
			Capability::Custom { name, .. } => write!(f, "Capability::Custom({})", name),
		}
	}
}

pub type CapabilityFactory = Arc<dyn Fn(Arc<dyn Channel>) -> Capability + Send + Sync>;

/// Capability name → client factory.
#[derive(Clone)]
pub struct Capabilities {
	factories: HashMap<String, CapabilityFactory>,
}

impl Capabilities {
	pub fn empty() -> Self {
		Self {
			factories: HashMap::new(),
		}
	}

	pub fn register(&mut self, name: impl Into<String>, factory: CapabilityFactory) -> &mut Self {
		self.factories.insert(name.into(), factory);
		self
	}

	pub fn build(&self, name: &str, channel: Arc<dyn Channel>) -> Capability {
		match self.factories.get(name) {
			Some(factory) => factory(channel),
			None => Capability::Custom {
				name: name.to_string(),
				channel,
			},
		}
	}
}

impl Default for Capabilities {
	fn default() -> Self {
		let mut capabilities = Self::empty();
		capabilities.register(COMMAND, Arc::new(|channel: Arc<dyn Channel>| Capability::Command(CommandClient::new(channel))));
		capabilities
	}
}

/// Client for the `command` capability.
#[derive(Clone)]
pub struct CommandClient {
	channel: Arc<dyn Channel>,
	timeout: Option<Duration>,
}

impl CommandClient {
	pub fn new(channel: Arc<dyn Channel>) -> Self {
		Self { channel, timeout: None }
	}

	/// Bound every call; an expired call fails with `RpcFailed`.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub async fn command(&self, name: &str, params: &[String]) -> Result<String> {
		self.call(METHOD_COMMAND, json!({ "name": name, "params": params })).await
	}

	pub async fn get_help(&self, name: &str) -> Result<String> {
		self.call(METHOD_GET_HELP, json!({ "name": name })).await
	}

	pub async fn list_command(&self) -> Result<Vec<String>> {
		self.call(METHOD_LIST_COMMAND, json!({})).await
	}

	async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
		let value = match self.timeout {
			Some(limit) => tokio::time::timeout(limit, self.channel.call(method, params))
				.await
				.map_err(|_| Error::RpcFailed(format!("{}: timed out after {:?}", method, limit)))??,
			None => self.channel.call(method, params).await?,
		};
		serde_json::from_value(value).map_err(|e| Error::RpcFailed(format!("{}: bad reply: {}", method, e)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::Mutex;

	/// Records calls and answers from a canned table.
	#[derive(Default)]
	struct Scripted {
		calls: Mutex<Vec<(String, Value)>>,
		delay: Option<Duration>,
	}

	#[async_trait]
	impl Channel for Scripted {
		async fn call(&self, method: &str, params: Value) -> Result<Value> {
			self.calls.lock().unwrap().push((method.to_string(), params));
			if let Some(delay) = self.delay {
				tokio::time::sleep(delay).await;
			}
			Ok(match method {
				METHOD_COMMAND => json!("World"),
				METHOD_GET_HELP => json!("says hello"),
				METHOD_LIST_COMMAND => json!(["Hello"]),
				_ => Value::Null,
			})
		}

		async fn close(&self) {}

		fn is_closed(&self) -> bool {
			false
		}
	}

	#[tokio::test]
	async fn command_client_speaks_the_wire_names() {
		let channel = Arc::new(Scripted::default());
		let client = CommandClient::new(channel.clone());

		assert_eq!(client.command("Hello", &["a".into(), "b".into()]).await.unwrap(), "World");
		assert_eq!(client.get_help("Hello").await.unwrap(), "says hello");
		assert_eq!(client.list_command().await.unwrap(), vec!["Hello".to_string()]);

		let calls = channel.calls.lock().unwrap();
		assert_eq!(calls[0], (METHOD_COMMAND.to_string(), json!({ "name": "Hello", "params": ["a", "b"] })));
		assert_eq!(calls[1], (METHOD_GET_HELP.to_string(), json!({ "name": "Hello" })));
		assert_eq!(calls[2].0, METHOD_LIST_COMMAND);
	}

	#[tokio::test]
	async fn slow_calls_time_out() {
		let channel = Arc::new(Scripted {
			delay: Some(Duration::from_secs(5)),
			..Default::default()
		});
		let client = CommandClient::new(channel).with_timeout(Duration::from_millis(50));
		assert!(matches!(client.list_command().await, Err(Error::RpcFailed(msg)) if msg.contains("timed out")));
	}

	#[test]
	fn unknown_capabilities_are_custom() {
		let channel: Arc<dyn Channel> = Arc::new(Scripted::default());
		let capabilities = Capabilities::default();
		assert!(matches!(capabilities.build(COMMAND, channel.clone()), Capability::Command(_)));
		let custom = capabilities.build("metrics", channel);
		assert_eq!(custom.name(), "metrics");
		assert!(matches!(custom, Capability::Custom { .. }));
	}
}
