//! JSON-RPC 2.0, one message per line, multiplexed over a single stream.
//!
//! A writer task drains an outgoing queue; a reader task routes each
//! response to the caller waiting on its id. When the stream ends every
//! pending call fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::transport::{self, TlsConfig, Transport};
use super::{Channel, Dialer};
use crate::address::PluginAddress;
use crate::error::{Error, Result};

pub const VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub jsonrpc: String,
	pub id: Option<u64>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub jsonrpc: String,
	pub id: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcError>,
}

impl Response {
	pub fn ok(id: Option<u64>, result: Value) -> Self {
		Self {
			jsonrpc: VERSION.to_string(),
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn err(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
		Self {
			jsonrpc: VERSION.to_string(),
			id,
			result: None,
			error: Some(RpcError {
				code,
				message: message.into(),
			}),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
	pub code: i64,
	pub message: String,
}

type Reply = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Pending {
	closed: bool,
	waiting: HashMap<u64, Reply>,
}

type SharedPending = Arc<Mutex<Pending>>;

fn lock(pending: &SharedPending) -> std::sync::MutexGuard<'_, Pending> {
	match pending.lock() {
		Ok(guard) => guard,
		Err(poisoned) => poisoned.into_inner(),
	}
}

/// Forgets a call whose future was dropped before the reply came.
struct PendingGuard {
	pending: SharedPending,
	id: u64,
}

impl Drop for PendingGuard {
	fn drop(&mut self) {
		lock(&self.pending).waiting.remove(&self.id);
	}
}

pub struct JsonRpcChannel {
	next_id: AtomicU64,
	outgoing: mpsc::Sender<Vec<u8>>,
	pending: SharedPending,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JsonRpcChannel {
	pub fn new(stream: Box<dyn Transport>) -> Self {
		let (reader, writer) = tokio::io::split(stream);
		let (outgoing, rx) = mpsc::channel(64);
		let pending: SharedPending = Arc::default();

		let writer_task = tokio::spawn(writer_loop(writer, rx, Arc::clone(&pending)));
		let reader_task = tokio::spawn(reader_loop(reader, Arc::clone(&pending)));

		Self {
			next_id: AtomicU64::new(1),
			outgoing,
			pending,
			tasks: Mutex::new(vec![writer_task, reader_task]),
		}
	}
}

#[async_trait]
impl Channel for JsonRpcChannel {
	async fn call(&self, method: &str, params: Value) -> Result<Value> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		{
			let mut pending = lock(&self.pending);
			if pending.closed {
				return Err(Error::RpcFailed("connection closed".into()));
			}
			pending.waiting.insert(id, tx);
		}
		let _guard = PendingGuard {
			pending: Arc::clone(&self.pending),
			id,
		};

		let request = Request {
			jsonrpc: VERSION.to_string(),
			id: Some(id),
			method: method.to_string(),
			params,
		};
		let mut data = serde_json::to_vec(&request).map_err(|e| Error::RpcFailed(e.to_string()))?;
		data.push(b'\n');
		self.outgoing
			.send(data)
			.await
			.map_err(|_| Error::RpcFailed("connection closed".into()))?;

		match rx.await {
			Ok(reply) => reply,
			Err(_) => Err(Error::RpcFailed("connection closed".into())),
		}
	}

	async fn close(&self) {
		fail_pending(&self.pending, "connection closed");
		let tasks = match self.tasks.lock() {
			Ok(mut tasks) => std::mem::take(&mut *tasks),
			Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
		};
		for task in tasks {
			task.abort();
		}
	}

	fn is_closed(&self) -> bool {
		lock(&self.pending).closed
	}
}

impl Drop for JsonRpcChannel {
	fn drop(&mut self) {
		if let Ok(tasks) = self.tasks.get_mut() {
			for task in tasks.drain(..) {
				task.abort();
			}
		}
	}
}

async fn writer_loop(
	mut writer: tokio::io::WriteHalf<Box<dyn Transport>>,
	mut rx: mpsc::Receiver<Vec<u8>>,
	pending: SharedPending,
) {
	while let Some(data) = rx.recv().await {
		if let Err(e) = writer.write_all(&data).await {
			tracing::debug!("rpc write failed: {}", e);
			break;
		}
		if writer.flush().await.is_err() {
			break;
		}
	}
	let _ = writer.shutdown().await;
	fail_pending(&pending, "connection closed");
}

async fn reader_loop(reader: tokio::io::ReadHalf<Box<dyn Transport>>, pending: SharedPending) {
	let mut lines = BufReader::new(reader).lines();
	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) => break,
			Err(e) => {
				tracing::debug!("rpc read failed: {}", e);
				break;
			}
		};
		if line.trim().is_empty() {
			continue;
		}
		let response: Response = match serde_json::from_str(&line) {
			Ok(response) => response,
			Err(e) => {
				tracing::warn!("invalid rpc response: {}", e);
				continue;
			}
		};
		let Some(id) = response.id else {
			tracing::warn!("rpc response without id dropped");
			continue;
		};
		let Some(reply) = lock(&pending).waiting.remove(&id) else {
			tracing::debug!("no caller waiting for rpc response {}", id);
			continue;
		};
		let outcome = match response.error {
			Some(err) => Err(Error::RpcFailed(format!("{} ({})", err.message, err.code))),
			None => Ok(response.result.unwrap_or(Value::Null)),
		};
		let _ = reply.send(outcome);
	}
	fail_pending(&pending, "connection closed by plugin");
}

fn fail_pending(pending: &SharedPending, reason: &str) {
	let waiting = {
		let mut pending = lock(pending);
		pending.closed = true;
		std::mem::take(&mut pending.waiting)
	};
	for (_, reply) in waiting {
		let _ = reply.send(Err(Error::RpcFailed(reason.to_string())));
	}
}

/// Dialer for [`crate::Protocol::JSON_RPC`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcDialer;

#[async_trait]
impl Dialer for JsonRpcDialer {
	async fn dial(&self, address: &PluginAddress, tls: Option<&TlsConfig>) -> Result<Arc<dyn Channel>> {
		let stream = transport::connect(address, tls).await?;
		Ok(Arc::new(JsonRpcChannel::new(stream)))
	}
}
