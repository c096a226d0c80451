//! The plugin side: bind, announce the handshake on stdout, serve JSON-RPC.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tether::plugin::{serve, Plugin};
//! use tether::SemanticVersion;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Plugin for Hello {
//!     fn version(&self) -> SemanticVersion {
//!         SemanticVersion::new(1, 0, 0)
//!     }
//!     async fn command(&self, _name: &str, _params: &[String]) -> Result<String, String> {
//!         Ok("World".into())
//!     }
//!     async fn get_help(&self, _name: &str) -> Result<String, String> {
//!         Ok("says hello".into())
//!     }
//!     async fn list_command(&self) -> Result<Vec<String>, String> {
//!         Ok(vec!["Hello".into()])
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> tether::Result<()> {
//! serve(Hello).await
//! # }
//! ```

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;

use crate::address::PluginAddress;
use crate::capability::{COMMAND, METHOD_COMMAND, METHOD_GET_HELP, METHOD_LIST_COMMAND};
use crate::error::{Error, Result};
use crate::handshake::{announce, core_version, PluginReport};
use crate::protocol::{Protocol, Protocols, ENV_ALLOW_PLUGIN_RPC_PROTOCOL, ENV_PLUGIN_LISTENER_ADDRESS};
use crate::rpc::jsonrpc::{Request, Response, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::rpc::{Transport, METHOD_DEPLOY, METHOD_INITIALIZE, METHOD_PING, METHOD_UNINITIALIZE};
use crate::version::SemanticVersion;

/// What a plugin binary implements. Errors are plain messages; they cross
/// the wire as text.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
	/// Plugin API version announced in the handshake.
	fn version(&self) -> SemanticVersion;

	async fn initialize(&self) -> Result<(), String> {
		Ok(())
	}

	async fn deploy(&self, name: &str) -> Result<(), String> {
		if name == COMMAND {
			Ok(())
		} else {
			Err(format!("unknown capability: {}", name))
		}
	}

	async fn uninitialize(&self) -> Result<(), String> {
		Ok(())
	}

	async fn ping(&self, _service: &str) -> Result<(), String> {
		Ok(())
	}

	async fn command(&self, name: &str, params: &[String]) -> Result<String, String>;

	async fn get_help(&self, name: &str) -> Result<String, String>;

	async fn list_command(&self) -> Result<Vec<String>, String>;
}

enum Listener {
	Tcp(TcpListener),
	Unix(UnixListener),
}

/// A bound listener that has not announced itself yet.
pub struct Server {
	listener: Listener,
	address: PluginAddress,
}

impl Server {
	/// Bind `address`; a TCP port of 0 picks a free one.
	pub async fn bind(address: &PluginAddress) -> Result<Self> {
		match address {
			PluginAddress::Tcp { host, port, .. } => {
				let listener = TcpListener::bind((host.as_str(), *port))
					.await
					.map_err(|e| Error::Internal(format!("bind {}: {}", address, e)))?;
				let local = listener.local_addr()?;
				Ok(Self {
					listener: Listener::Tcp(listener),
					address: PluginAddress::tcp(local),
				})
			}
			PluginAddress::Unix(path) => {
				let _ = std::fs::remove_file(path);
				let listener =
					UnixListener::bind(path).map_err(|e| Error::Internal(format!("bind {}: {}", address, e)))?;
				Ok(Self {
					listener: Listener::Unix(listener),
					address: address.clone(),
				})
			}
		}
	}

	pub fn address(&self) -> &PluginAddress {
		&self.address
	}

	/// The handshake this server prints for `version`.
	pub fn report(&self, version: SemanticVersion) -> PluginReport {
		PluginReport {
			core_version: core_version(),
			version,
			address: self.address.clone(),
			protocol: Protocol::JSON_RPC,
		}
	}

	/// Accept connections until the listener fails.
	pub async fn run<P: Plugin>(self, plugin: Arc<P>) -> Result<()> {
		tracing::info!("listening on {}", self.address);
		loop {
			let stream: Box<dyn Transport> = match &self.listener {
				Listener::Tcp(listener) => match listener.accept().await {
					Ok((stream, _)) => Box::new(stream),
					Err(e) => {
						tracing::error!("accept error: {}", e);
						continue;
					}
				},
				Listener::Unix(listener) => match listener.accept().await {
					Ok((stream, _)) => Box::new(stream),
					Err(e) => {
						tracing::error!("accept error: {}", e);
						continue;
					}
				},
			};
			let plugin = Arc::clone(&plugin);
			tokio::spawn(async move {
				handle_connection(stream, plugin).await;
			});
		}
	}
}

/// Bind the address the host suggested (or any loopback port), print the
/// handshake and serve until the process is killed.
pub async fn serve<P: Plugin>(plugin: P) -> Result<()> {
	if let Ok(allowed) = std::env::var(ENV_ALLOW_PLUGIN_RPC_PROTOCOL) {
		if let Ok(allowed) = allowed.parse::<Protocols>() {
			if !allowed.contains(Protocol::JSON_RPC) {
				return Err(Error::ProtocolUnsupported {
					protocol: Protocol::JSON_RPC,
					allowed,
				});
			}
		}
	}

	let suggested = std::env::var(ENV_PLUGIN_LISTENER_ADDRESS)
		.ok()
		.and_then(|value| value.parse::<PluginAddress>().ok());
	let server = match suggested {
		Some(address) => match Server::bind(&address).await {
			Ok(server) => server,
			Err(e) => {
				tracing::warn!("suggested address unusable ({}), picking another", e);
				Server::bind(&loopback()).await?
			}
		},
		None => Server::bind(&loopback()).await?,
	};

	let handshake = announce(&server.report(plugin.version()));
	{
		let mut stdout = std::io::stdout().lock();
		stdout.write_all(handshake.as_bytes())?;
		stdout.flush()?;
	}

	server.run(Arc::new(plugin)).await
}

fn loopback() -> PluginAddress {
	PluginAddress::Tcp {
		family: crate::address::TcpFamily::V4,
		host: "127.0.0.1".to_string(),
		port: 0,
	}
}

async fn handle_connection<P: Plugin>(stream: Box<dyn Transport>, plugin: Arc<P>) {
	let (reader, mut writer) = tokio::io::split(stream);
	let (tx, mut rx) = mpsc::channel::<Response>(64);

	let write_task = tokio::spawn(async move {
		while let Some(response) = rx.recv().await {
			let mut data = match serde_json::to_vec(&response) {
				Ok(d) => d,
				Err(e) => {
					tracing::error!("failed to serialize response: {}", e);
					continue;
				}
			};
			data.push(b'\n');
			if writer.write_all(&data).await.is_err() {
				break;
			}
		}
	});

	let mut lines = BufReader::new(reader).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		if line.trim().is_empty() {
			continue;
		}
		let request: Request = match serde_json::from_str(&line) {
			Ok(r) => r,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				let _ = tx.send(Response::err(None, PARSE_ERROR, e.to_string())).await;
				continue;
			}
		};

		let plugin = Arc::clone(&plugin);
		let tx = tx.clone();
		tokio::spawn(async move {
			let id = request.id;
			let response = dispatch(plugin.as_ref(), request).await;
			if id.is_some() {
				let _ = tx.send(response).await;
			}
		});
	}
	drop(tx);
	let _ = write_task.await;
}

#[derive(Deserialize)]
struct NameParams {
	name: String,
}

#[derive(Deserialize)]
struct ServiceParams {
	#[serde(default)]
	service: String,
}

#[derive(Deserialize)]
struct CommandParams {
	name: String,
	#[serde(default)]
	params: Vec<String>,
}

fn params<T: DeserializeOwned>(value: Value) -> std::result::Result<T, String> {
	serde_json::from_value(value).map_err(|e| e.to_string())
}

async fn dispatch<P: Plugin>(plugin: &P, request: Request) -> Response {
	let id = request.id;
	if request.jsonrpc != crate::rpc::jsonrpc::VERSION {
		return Response::err(id, INVALID_REQUEST, format!("unsupported jsonrpc version {:?}", request.jsonrpc));
	}

	let core = |result: std::result::Result<(), String>| {
		Response::ok(id, json!({ "error": result.err().unwrap_or_default() }))
	};
	let value = |result: std::result::Result<Value, String>| match result {
		Ok(v) => Response::ok(id, v),
		Err(msg) => Response::err(id, crate::rpc::jsonrpc::INTERNAL_ERROR, msg),
	};

	match request.method.as_str() {
		METHOD_INITIALIZE => core(plugin.initialize().await),
		METHOD_UNINITIALIZE => core(plugin.uninitialize().await),
		METHOD_DEPLOY => match params::<NameParams>(request.params) {
			Ok(p) => core(plugin.deploy(&p.name).await),
			Err(e) => Response::err(id, INVALID_PARAMS, e),
		},
		METHOD_PING => match params::<ServiceParams>(request.params) {
			Ok(p) => core(plugin.ping(&p.service).await),
			Err(e) => Response::err(id, INVALID_PARAMS, e),
		},
		METHOD_COMMAND => match params::<CommandParams>(request.params) {
			Ok(p) => value(plugin.command(&p.name, &p.params).await.map(Value::String)),
			Err(e) => Response::err(id, INVALID_PARAMS, e),
		},
		METHOD_GET_HELP => match params::<NameParams>(request.params) {
			Ok(p) => value(plugin.get_help(&p.name).await.map(Value::String)),
			Err(e) => Response::err(id, INVALID_PARAMS, e),
		},
		METHOD_LIST_COMMAND => value(plugin.list_command().await.map(|names| json!(names))),
		other => Response::err(id, METHOD_NOT_FOUND, format!("method not found: {}", other)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::CommandClient;
	use crate::rpc::{CoreClient, Dialers};

	struct Upper;

	#[async_trait]
	impl Plugin for Upper {
		fn version(&self) -> SemanticVersion {
			SemanticVersion::new(1, 0, 0)
		}

		async fn initialize(&self) -> Result<(), String> {
			Err("not today".into())
		}

		async fn command(&self, name: &str, params: &[String]) -> Result<String, String> {
			match name {
				"upper" => Ok(params.join(" ").to_uppercase()),
				"slow" => {
					tokio::time::sleep(std::time::Duration::from_millis(200)).await;
					Ok("slow".into())
				}
				_ => Err(format!("no such command: {}", name)),
			}
		}

		async fn get_help(&self, name: &str) -> Result<String, String> {
			Ok(format!("help for {}", name))
		}

		async fn list_command(&self) -> Result<Vec<String>, String> {
			Ok(vec!["slow".into(), "upper".into()])
		}
	}

	async fn spawn_server() -> PluginAddress {
		let server = Server::bind(&loopback()).await.unwrap();
		let address = server.address().clone();
		tokio::spawn(server.run(Arc::new(Upper)));
		address
	}

	#[tokio::test]
	async fn serves_core_and_command_methods() {
		let address = spawn_server().await;
		let channel = Dialers::default().dial(Protocol::JSON_RPC, &address, None).await.unwrap();

		let core = CoreClient::new(Arc::clone(&channel));
		let err = core.initialize().await.unwrap_err();
		assert!(err.to_string().contains("not today"), "{}", err);
		core.deploy(COMMAND).await.unwrap();
		assert!(core.deploy("metrics").await.is_err());
		core.ping("anything").await.unwrap();

		let commands = CommandClient::new(channel);
		assert_eq!(commands.command("upper", &["a".into(), "b".into()]).await.unwrap(), "A B");
		assert_eq!(commands.get_help("upper").await.unwrap(), "help for upper");
		assert_eq!(commands.list_command().await.unwrap(), vec!["slow", "upper"]);
		let err = commands.command("nope", &[]).await.unwrap_err();
		assert!(matches!(err, Error::RpcFailed(msg) if msg.contains("no such command")));
	}

	#[tokio::test]
	async fn slow_requests_do_not_block_fast_ones() {
		let address = spawn_server().await;
		let channel = Dialers::default().dial(Protocol::JSON_RPC, &address, None).await.unwrap();
		let commands = CommandClient::new(channel);

		let slow = {
			let commands = commands.clone();
			tokio::spawn(async move { commands.command("slow", &[]).await })
		};
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		let started = std::time::Instant::now();
		assert_eq!(commands.command("upper", &["x".into()]).await.unwrap(), "X");
		assert!(started.elapsed() < std::time::Duration::from_millis(150));
		assert_eq!(slow.await.unwrap().unwrap(), "slow");
	}

	#[tokio::test]
	async fn unknown_methods_are_reported() {
		let address = spawn_server().await;
		let channel = Dialers::default().dial(Protocol::JSON_RPC, &address, None).await.unwrap();
		let err = channel.call("Plugin.Reboot", Value::Null).await.unwrap_err();
		assert!(err.to_string().contains(&METHOD_NOT_FOUND.to_string()), "{}", err);
	}
}
