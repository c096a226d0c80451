use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::output::{LogSink, Stream};
use crate::process::{self, Process, Reaped};
use crate::types::{ExitInfo, ProcessOption, ProcessParams, ProcessStatus};
use crate::watchdog::{Death, DeathStream, WatchOutcome, Watchdog};

/// Registry of named children plus the loop that restarts them.
pub struct Supervisor {
	processes: RwLock<HashMap<String, Arc<Process>>>,
	watchdog: Arc<Watchdog>,
	config: SupervisorConfig,
	shutting_down: AtomicBool,
	cancel: CancellationToken,
}

impl Supervisor {
	/// Must be called inside a tokio runtime: the auto-restart loop is
	/// spawned here and lives until the supervisor is dropped.
	pub fn new(config: SupervisorConfig, watchdog: Arc<Watchdog>) -> Arc<Self> {
		let deaths = watchdog.deaths();
		let supervisor = Arc::new(Self {
			processes: RwLock::new(HashMap::new()),
			watchdog,
			config,
			shutting_down: AtomicBool::new(false),
			cancel: CancellationToken::new(),
		});
		tokio::spawn(restart_loop(
			Arc::downgrade(&supervisor),
			deaths,
			supervisor.cancel.clone(),
		));
		supervisor
	}

	pub fn watchdog(&self) -> &Arc<Watchdog> {
		&self.watchdog
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	pub async fn prepare(self: &Arc<Self>, params: ProcessParams) -> Result<Arc<Process>> {
		self.prepare_life(params, 0).await
	}

	async fn prepare_life(self: &Arc<Self>, params: ProcessParams, restarts: u32) -> Result<Arc<Process>> {
		let mut processes = self.processes.write().await;
		if processes.contains_key(&params.name) {
			return Err(Error::AlreadyExists(params.name));
		}

		let (recipe, ends) = process::allocate(&params)?;
		let (process, child_rx) = Process::prepared(params, restarts, recipe, ends)?;
		let process = Arc::new(process);

		tokio::spawn(reap(
			Arc::downgrade(self),
			Arc::clone(&process),
			child_rx,
			self.config.output_drain,
		));
		processes.insert(process.name().to_string(), Arc::clone(&process));
		tracing::debug!("{}: prepared ({})", process.name(), process.params().cmd);
		Ok(process)
	}

	pub async fn start(&self, name: &str) -> Result<()> {
		let process = self.get(name).await?;
		self.start_process(&process).await
	}

	async fn start_process(&self, process: &Arc<Process>) -> Result<()> {
		let name = process.name();
		let _transition = process.transition.lock().await;

		let status = process.status();
		if status != ProcessStatus::Prepared {
			return Err(Error::NotPrepared {
				name: name.to_string(),
				status,
			});
		}
		let Some(recipe) = process.take_recipe() else {
			return Err(Error::NotPrepared {
				name: name.to_string(),
				status,
			});
		};

		let child = match process::spawn(name, recipe) {
			Ok(child) => child,
			Err(e) => {
				tracing::error!("{}: failed to start: {}", name, e);
				process.set_status(ProcessStatus::Failed);
				process.abandon();
				return Err(e);
			}
		};

		self.start_pumps(process);
		let pid = match process.mark_running(child) {
			Ok(pid) => pid,
			Err(mut child) => {
				let _ = child.start_kill();
				process.set_status(ProcessStatus::Failed);
				return Err(Error::Internal(format!("{}: reaper is gone", name)));
			}
		};
		tracing::info!("{}: started (pid {})", name, pid);

		if process.option().contains(ProcessOption::AUTO_RESTART) {
			self.watchdog.start_watch(process);
		}
		Ok(())
	}

	fn start_pumps(&self, process: &Process) {
		let (stdout, stderr) = process.take_output_ends();
		let sink = process
			.option()
			.contains(ProcessOption::HOOK_LOG)
			.then(|| Arc::clone(&self.config.log_sink));

		if let Some(reader) = stdout {
			process.add_pump(tokio::spawn(pump_lines(
				process.name().to_string(),
				Stream::Stdout,
				reader,
				process.stdout_sender(),
				sink.clone(),
			)));
		}
		if let Some(reader) = stderr {
			process.add_pump(tokio::spawn(pump_lines(
				process.name().to_string(),
				Stream::Stderr,
				reader,
				process.stderr_sender(),
				sink,
			)));
		}
	}

	/// SIGTERM to the process group. The reaper finishes the job; a group
	/// still alive after the stop grace gets SIGKILL.
	pub async fn stop(&self, name: &str) -> Result<()> {
		let process = self.get(name).await?;
		self.stop_process(&process, Signal::SIGTERM).await
	}

	/// SIGKILL to the process group.
	pub async fn kill(&self, name: &str) -> Result<()> {
		let process = self.get(name).await?;
		self.stop_process(&process, Signal::SIGKILL).await
	}

	/// [`Supervisor::stop`] for a descriptor the caller already holds. A
	/// later life registered under the same name is never touched.
	pub async fn stop_instance(&self, process: &Arc<Process>) -> Result<()> {
		self.stop_process(process, Signal::SIGTERM).await
	}

	pub async fn kill_instance(&self, process: &Arc<Process>) -> Result<()> {
		self.stop_process(process, Signal::SIGKILL).await
	}

	async fn stop_process(&self, process: &Arc<Process>, signal: Signal) -> Result<()> {
		let _transition = process.transition.lock().await;
		match process.status() {
			ProcessStatus::Running => {}
			ProcessStatus::Exiting if signal == Signal::SIGKILL => {
				return signal_group(process, signal);
			}
			ProcessStatus::Exiting => return Ok(()),
			status => {
				return Err(Error::NotRunning {
					name: process.name().to_string(),
					status,
				})
			}
		}

		// Requested exits are not deaths.
		let _ = self.watchdog.stop_watch(process);

		if process.last_exit().is_none() {
			signal_group(process, signal)?;
		}
		process.set_status(ProcessStatus::Exiting);
		tracing::info!("{}: {} sent", process.name(), signal.as_str());

		if signal == Signal::SIGTERM && !self.config.stop_grace.is_zero() {
			let grace = self.config.stop_grace;
			let process = Arc::clone(process);
			tokio::spawn(async move {
				if tokio::time::timeout(grace, process.exited()).await.is_err() {
					tracing::warn!("{}: still alive after {:?}, sending SIGKILL", process.name(), grace);
					let _ = signal_group(&process, Signal::SIGKILL);
				}
			});
		}
		Ok(())
	}

	/// Stop, wait for the reaper, then bring up a fresh life with the same
	/// parameters. A prepared descriptor is simply started.
	pub async fn restart(self: &Arc<Self>, name: &str) -> Result<Arc<Process>> {
		let process = self.get(name).await?;
		match process.status() {
			ProcessStatus::Prepared => {
				self.start_process(&process).await?;
				return Ok(process);
			}
			ProcessStatus::Running => match self.stop_process(&process, Signal::SIGTERM).await {
				Ok(()) | Err(Error::NotRunning { .. }) => {}
				Err(e) => return Err(e),
			},
			ProcessStatus::Exiting | ProcessStatus::Exited | ProcessStatus::Failed => {}
		}

		process.reaped().await;
		self.respawn(&process).await
	}

	async fn respawn(self: &Arc<Self>, dead: &Process) -> Result<Arc<Process>> {
		let fresh = self.prepare_life(dead.params().clone(), dead.restarts() + 1).await?;
		self.start_process(&fresh).await?;
		tracing::info!("{}: restarted ({} restarts)", fresh.name(), fresh.restarts());
		Ok(fresh)
	}

	/// Stop the child if it runs, wait for the reaper, then remove its
	/// working directory. Also the only way a never-started descriptor is
	/// collected besides [`Supervisor::remove`].
	pub async fn clean(&self, name: &str) -> Result<()> {
		let process = self.get(name).await?;
		match process.status() {
			ProcessStatus::Prepared => self.abandon(&process).await,
			ProcessStatus::Running => match self.stop_process(&process, Signal::SIGTERM).await {
				Ok(()) | Err(Error::NotRunning { .. }) => {}
				Err(e) => return Err(e),
			},
			_ => {}
		}
		process.reaped().await;
		remove_work_dir(process.name(), &process.params().work_dir)
	}

	async fn abandon(&self, process: &Process) {
		let _transition = process.transition.lock().await;
		if process.status() == ProcessStatus::Prepared {
			process.abandon();
		}
	}

	pub async fn watch(&self, name: &str) -> Result<WatchOutcome> {
		let process = self.get(name).await?;
		let status = process.status();
		if status != ProcessStatus::Running {
			return Err(Error::NotRunning {
				name: name.to_string(),
				status,
			});
		}
		Ok(self.watchdog.start_watch(&process))
	}

	/// Resolves once the reaper released the descriptor.
	pub async fn wait(&self, name: &str) -> Result<Reaped> {
		Ok(self.get(name).await?.reaped())
	}

	pub async fn is_alive(&self, name: &str) -> bool {
		let Some(process) = self.find_by_name(name).await else {
			return false;
		};
		match process.pid() {
			Some(pid) if process.last_exit().is_none() => kill(Pid::from_raw(pid as i32), None).is_ok(),
			_ => false,
		}
	}

	pub async fn find_by_name(&self, name: &str) -> Option<Arc<Process>> {
		self.processes.read().await.get(name).cloned()
	}

	pub async fn list_all(&self) -> Vec<Arc<Process>> {
		let mut all: Vec<_> = self.processes.read().await.values().cloned().collect();
		all.sort_by(|a, b| a.name().cmp(b.name()));
		all
	}

	/// Drop a descriptor that is not running from the registry.
	pub async fn remove(&self, name: &str) -> Result<()> {
		let process = self.get(name).await?;
		{
			let _transition = process.transition.lock().await;
			if process.status().is_running() {
				return Err(Error::StillRunning(name.to_string()));
			}
			process.abandon();
		}
		self.unregister(&process).await;
		Ok(())
	}

	/// Stop restarting deaths, stop everything and wait for the reapers.
	pub async fn shutdown(&self) {
		self.shutting_down.store(true, Ordering::SeqCst);
		let processes = self.list_all().await;
		tracing::info!("shutting down {} processes", processes.len());

		for process in &processes {
			match process.status() {
				ProcessStatus::Prepared => self.abandon(process).await,
				ProcessStatus::Running => {
					if let Err(e) = self.stop_process(process, Signal::SIGTERM).await {
						tracing::warn!("{}: stop failed during shutdown: {}", process.name(), e);
					}
				}
				_ => {}
			}
		}
		for process in processes {
			process.reaped().await;
		}
	}

	async fn get(&self, name: &str) -> Result<Arc<Process>> {
		self.find_by_name(name)
			.await
			.ok_or_else(|| Error::NotFound(name.to_string()))
	}

	async fn unregister(&self, process: &Arc<Process>) {
		let mut processes = self.processes.write().await;
		if processes
			.get(process.name())
			.is_some_and(|current| Arc::ptr_eq(current, process))
		{
			processes.remove(process.name());
		}
	}

	async fn on_death(self: Arc<Self>, death: Death) {
		let Death { process, exit } = death;
		if !process.option().contains(ProcessOption::AUTO_RESTART) {
			tracing::info!("{}: died ({}), not restarting", process.name(), exit);
			return;
		}
		if self.is_shutting_down() {
			tracing::debug!("{}: died during shutdown", process.name());
			return;
		}

		process.reaped().await;
		if let Err(e) = self.respawn(&process).await {
			tracing::error!("{}: restart failed: {}", process.name(), e);
		}
	}
}

impl Drop for Supervisor {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

async fn restart_loop(supervisor: Weak<Supervisor>, mut deaths: DeathStream, cancel: CancellationToken) {
	loop {
		let death = tokio::select! {
			_ = cancel.cancelled() => return,
			death = deaths.recv() => match death {
				Some(death) => death,
				None => return,
			},
		};
		let Some(supervisor) = supervisor.upgrade() else {
			return;
		};
		tokio::spawn(supervisor.on_death(death));
	}
}

/// Owns the child from start to exit, then releases every stream and the
/// registry entry. Runs for abandoned descriptors too.
async fn reap(
	supervisor: Weak<Supervisor>,
	process: Arc<Process>,
	child_rx: oneshot::Receiver<Child>,
	drain: std::time::Duration,
) {
	let name = process.name().to_string();
	let exit = match child_rx.await {
		Ok(mut child) => match tokio::spawn(async move { child.wait().await }).await {
			Ok(Ok(status)) => ExitInfo::from(status),
			Ok(Err(e)) => {
				tracing::error!("{}: wait failed: {}", name, e);
				process.set_status(ProcessStatus::Failed);
				ExitInfo::never_started()
			}
			Err(join) => {
				let err = Error::Internal(format!("reaper wait task failed: {}", join));
				tracing::error!("{}: {}", name, err);
				process.set_status(ProcessStatus::Failed);
				ExitInfo::never_started()
			}
		},
		Err(_) => {
			tracing::debug!("{}: released without starting", name);
			ExitInfo::never_started()
		}
	};

	process.record_exit(exit);
	process.release_streams(drain).await;

	let supervisor = supervisor.upgrade();
	let transition = process.transition.lock().await;
	if let Some(supervisor) = &supervisor {
		supervisor.unregister(&process).await;
	}
	// Under the lock, so a racing stop sees the final status.
	process.finish();
	drop(transition);
	tracing::info!("{}: exited ({})", name, exit);
}

async fn pump_lines(
	name: String,
	stream: Stream,
	reader: pipe::Receiver,
	lines_tx: broadcast::Sender<String>,
	sink: Option<Arc<dyn LogSink>>,
) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				let line = String::from_utf8_lossy(&buf);
				let line = line.trim_end_matches(['\n', '\r']);
				if let Some(sink) = &sink {
					sink.write_line(&name, stream, line);
				}
				let _ = lines_tx.send(line.to_string());
			}
			Err(e) => {
				tracing::debug!("{}: {} pipe read failed: {}", name, stream, e);
				break;
			}
		}
	}
}

fn signal_group(process: &Process, signal: Signal) -> Result<()> {
	let Some(pid) = process.pid() else {
		return Err(Error::NotRunning {
			name: process.name().to_string(),
			status: process.status(),
		});
	};
	match killpg(Pid::from_raw(pid as i32), signal) {
		Ok(()) | Err(Errno::ESRCH) => Ok(()),
		Err(source) => Err(Error::Signal {
			name: process.name().to_string(),
			signal: signal.as_str(),
			source,
		}),
	}
}

fn remove_work_dir(name: &str, dir: &Path) -> Result<()> {
	let refuse = dir.as_os_str().is_empty()
		|| dir
			.components()
			.all(|c| matches!(c, Component::RootDir | Component::CurDir | Component::ParentDir));
	if refuse {
		return Err(Error::Internal(format!(
			"{}: refusing to remove working directory {}",
			name,
			dir.display()
		)));
	}
	match std::fs::remove_dir_all(dir) {
		Ok(()) => {
			tracing::info!("{}: removed {}", name, dir.display());
			Ok(())
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}
