//! Starting, talking to and stopping plugin processes.
//!
//! [`PluginHost::start`] runs a plugin under the supervisor, reads its
//! handshake, dials the announced address and calls `Initialize`. Any
//! failure along the way stops the child and waits for its reaper, so a
//! failed start never leaves a registry entry behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use warden::{PluginSettings, Process, ProcessOption, ProcessParams, Supervisor};

use crate::address::random_listener_address;
use crate::capability::{Capabilities, Capability, CapabilityFactory, CommandClient, COMMAND};
use crate::error::{Error, Result};
use crate::handshake::{read_handshake, HandshakeParser, PluginReport};
use crate::protocol::{
	Protocol, Protocols, ENV_ALLOW_PLUGIN_RPC_PROTOCOL, ENV_PLUGIN_LISTENER_ADDRESS, ENV_REQUEST_VERSION,
};
use crate::rpc::{Channel, CoreClient, Dialer, Dialers, TlsConfig};
use crate::version::SemanticVersion;

const UNINITIALIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch one plugin.
#[derive(Clone)]
pub struct PluginConfig {
	pub name: String,
	pub cmd: String,
	pub args: Vec<String>,
	pub work_dir: PathBuf,
	/// Applied over the host environment and the bridge variables.
	pub env: HashMap<String, String>,
	pub version: SemanticVersion,
	pub protocols: Protocols,
	/// Whole-phase handshake bound; the host default when unset.
	pub start_timeout: Option<Duration>,
	pub tls: Option<TlsConfig>,
	pub dialers: Dialers,
	pub capabilities: Capabilities,
}

impl PluginConfig {
	pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			cmd: cmd.into(),
			args: Vec::new(),
			work_dir: PathBuf::from("."),
			env: HashMap::new(),
			version: SemanticVersion::new(1, 0, 0),
			protocols: Protocols::default(),
			start_timeout: None,
			tls: None,
			dialers: Dialers::default(),
			capabilities: Capabilities::default(),
		}
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.work_dir = dir.into();
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.insert(key.into(), value.into());
		self
	}

	pub fn version(mut self, version: SemanticVersion) -> Self {
		self.version = version;
		self
	}

	pub fn protocols(mut self, protocols: Protocols) -> Self {
		self.protocols = protocols;
		self
	}

	pub fn start_timeout(mut self, timeout: Duration) -> Self {
		self.start_timeout = Some(timeout);
		self
	}

	pub fn tls(mut self, tls: TlsConfig) -> Self {
		self.tls = Some(tls);
		self
	}

	pub fn dialer(mut self, protocol: Protocol, dialer: Arc<dyn Dialer>) -> Self {
		self.dialers.register(protocol, dialer);
		self
	}

	pub fn capability(mut self, name: impl Into<String>, factory: CapabilityFactory) -> Self {
		self.capabilities.register(name, factory);
		self
	}

	fn process_params(&self, listener: &str) -> ProcessParams {
		let mut params = ProcessParams::new(&self.name, &self.cmd)
			.args(self.args.clone())
			.work_dir(self.work_dir.clone())
			.env(ENV_PLUGIN_LISTENER_ADDRESS, listener)
			.env(ENV_ALLOW_PLUGIN_RPC_PROTOCOL, self.protocols.to_string())
			.env(ENV_REQUEST_VERSION, self.version.to_string())
			.option(ProcessOption::HOOK_LOG);
		for (key, value) in &self.env {
			params = params.env(key.clone(), value.clone());
		}
		params
	}
}

/// Launches plugins on a shared supervisor.
pub struct PluginHost {
	supervisor: Arc<Supervisor>,
	handshake_timeout: Duration,
}

impl PluginHost {
	pub fn new(supervisor: Arc<Supervisor>) -> Self {
		Self::with_settings(supervisor, &PluginSettings::default())
	}

	pub fn with_settings(supervisor: Arc<Supervisor>, settings: &PluginSettings) -> Self {
		Self {
			supervisor,
			handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
		}
	}

	pub fn supervisor(&self) -> &Arc<Supervisor> {
		&self.supervisor
	}

	pub async fn start(&self, config: PluginConfig, cancel: &CancellationToken) -> Result<Session> {
		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let listener = random_listener_address()
			.map_err(|e| Error::Internal(format!("{}: no free listener port: {}", config.name, e)))?;
		let process = self.supervisor.prepare(config.process_params(&listener.to_string())).await?;
		// Subscribe before the child can write anything.
		let lines = process.subscribe_stdout();
		if let Err(e) = self.supervisor.start(process.name()).await {
			process.reaped().wait().await;
			return Err(e.into());
		}

		let parser = HandshakeParser::new(config.version.clone(), config.protocols.clone());
		let timeout = config.start_timeout.unwrap_or(self.handshake_timeout);
		let report = tokio::select! {
			report = read_handshake(&process, lines, parser, timeout) => report,
			_ = cancel.cancelled() => Err(Error::Cancelled),
		};
		let report = match report {
			Ok(report) => report,
			Err(e) => {
				tracing::warn!("{}: handshake failed: {}", process.name(), e);
				// Only a plugin that never answered is killed outright.
				let kill = matches!(e, Error::HandshakeTimeout | Error::Cancelled);
				self.teardown(&process, kill).await;
				return Err(e);
			}
		};
		tracing::info!(
			"{}: plugin {} at {} over {}",
			process.name(),
			report.version,
			report.address,
			report.protocol
		);

		let channel = tokio::select! {
			channel = config.dialers.dial(report.protocol, &report.address, config.tls.as_ref()) => channel,
			_ = cancel.cancelled() => Err(Error::Cancelled),
		};
		let channel = match channel {
			Ok(channel) => channel,
			Err(e) => {
				self.teardown(&process, matches!(e, Error::Cancelled)).await;
				return Err(e);
			}
		};

		let core = CoreClient::new(channel);
		let initialized = tokio::select! {
			result = core.initialize() => result,
			_ = cancel.cancelled() => Err(Error::Cancelled),
		};
		if let Err(e) = initialized {
			tracing::warn!("{}: initialize failed: {}", process.name(), e);
			core.close().await;
			self.teardown(&process, matches!(e, Error::Cancelled)).await;
			return Err(e);
		}

		Ok(Session {
			supervisor: Arc::clone(&self.supervisor),
			process,
			report,
			core,
			capabilities: config.capabilities,
			deployed: Mutex::new(HashMap::new()),
		})
	}

	/// Stop (or kill) the child and wait until the supervisor has let go of it.
	async fn teardown(&self, process: &Arc<Process>, kill: bool) {
		let reaped = process.reaped();
		let result = if kill {
			self.supervisor.kill_instance(process).await
		} else {
			self.supervisor.stop_instance(process).await
		};
		if let Err(e) = result {
			tracing::debug!("{}: teardown: {}", process.name(), e);
		}
		reaped.wait().await;
	}
}

/// A running, initialized plugin.
pub struct Session {
	supervisor: Arc<Supervisor>,
	process: Arc<Process>,
	report: PluginReport,
	core: CoreClient,
	capabilities: Capabilities,
	deployed: Mutex<HashMap<String, Capability>>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("name", &self.process.name())
			.field("report", &self.report)
			.finish_non_exhaustive()
	}
}

impl Session {
	pub fn name(&self) -> &str {
		self.process.name()
	}

	pub fn process(&self) -> &Arc<Process> {
		&self.process
	}

	pub fn report(&self) -> &PluginReport {
		&self.report
	}

	pub fn protocol(&self) -> Protocol {
		self.report.protocol
	}

	pub fn channel(&self) -> &Arc<dyn Channel> {
		self.core.channel()
	}

	pub async fn ping(&self, service: &str) -> Result<()> {
		self.core.ping(service).await
	}

	/// Deploy capability `name`, reusing the client from an earlier deploy.
	pub async fn deploy(&self, name: &str) -> Result<Capability> {
		let mut deployed = self.deployed.lock().await;
		if let Some(capability) = deployed.get(name) {
			return Ok(capability.clone());
		}
		self.core.deploy(name).await?;
		let capability = self.capabilities.build(name, Arc::clone(self.core.channel()));
		deployed.insert(name.to_string(), capability.clone());
		Ok(capability)
	}

	pub async fn command_client(&self) -> Result<CommandClient> {
		match self.deploy(COMMAND).await? {
			Capability::Command(client) => Ok(client),
			other => Err(Error::Internal(format!("{} is not a command client: {:?}", COMMAND, other))),
		}
	}

	/// `UnInitialize`, close the channel, stop the child and wait for its
	/// reaper. Every step runs; failures come back together.
	pub async fn stop(self) -> Result<()> {
		let name = self.process.name().to_string();
		let mut errors = Vec::new();

		match tokio::time::timeout(UNINITIALIZE_TIMEOUT, self.core.uninitialize()).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				tracing::warn!("{}: uninitialize failed: {}", name, e);
				errors.push(e);
			}
			Err(_) => {
				tracing::warn!("{}: uninitialize timed out", name);
				errors.push(Error::RpcFailed(format!("uninitialize timed out after {:?}", UNINITIALIZE_TIMEOUT)));
			}
		}
		self.core.close().await;

		let reaped = self.process.reaped();
		match self.supervisor.stop_instance(&self.process).await {
			Ok(()) | Err(warden::Error::NotRunning { .. }) => {}
			Err(e) => errors.push(e.into()),
		}
		reaped.wait().await;
		tracing::info!("{}: plugin stopped", name);

		Error::from_many(errors)
	}
}
