//! The process primitive: four-pipe children and the descriptor that tracks them.
//!
//! [`allocate`] builds the pipes and the spawn recipe without starting
//! anything; [`spawn`] consumes the recipe. The child sees the pipes as
//! fds 0 (stdin), 1 (stdout), 2 (stderr) and 3 (auxiliary data).

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, PipeReader, PipeWriter};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::types::{ExitInfo, ProcessInfo, ProcessOption, ProcessParams, ProcessStatus};

/// File descriptor number the auxiliary data pipe lands on in the child.
pub const DATA_FD: RawFd = 3;

const LINE_CHANNEL_CAPACITY: usize = 1024;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Child-side pipe ends plus everything `spawn` needs.
pub struct SpawnRecipe {
	cmd: String,
	args: Vec<String>,
	work_dir: PathBuf,
	env: HashMap<OsString, OsString>,
	stdin: PipeReader,
	stdout: PipeWriter,
	stderr: PipeWriter,
	data: PipeWriter,
}

/// Host-side pipe ends, still blocking until registered with the runtime.
pub struct HostEnds {
	pub stdin: PipeWriter,
	pub stdout: PipeReader,
	pub stderr: PipeReader,
	pub data: PipeReader,
}

/// Host environment with `overlay` applied on top.
pub fn merged_env(overlay: &HashMap<String, String>) -> HashMap<OsString, OsString> {
	let mut env: HashMap<OsString, OsString> = std::env::vars_os().collect();
	for (key, value) in overlay {
		env.insert(OsString::from(key), OsString::from(value));
	}
	env
}

pub fn allocate(params: &ProcessParams) -> Result<(SpawnRecipe, HostEnds)> {
	let pipe_err = |source: io::Error| Error::PipeAllocation {
		name: params.name.clone(),
		source,
	};

	let (child_stdin, host_stdin) = io::pipe().map_err(pipe_err)?;
	let (host_stdout, child_stdout) = io::pipe().map_err(pipe_err)?;
	let (host_stderr, child_stderr) = io::pipe().map_err(pipe_err)?;
	let (host_data, child_data) = io::pipe().map_err(pipe_err)?;

	let recipe = SpawnRecipe {
		cmd: params.cmd.clone(),
		args: params.args.clone(),
		work_dir: params.work_dir.clone(),
		env: merged_env(&params.env),
		stdin: child_stdin,
		stdout: child_stdout,
		stderr: child_stderr,
		data: child_data,
	};
	let ends = HostEnds {
		stdin: host_stdin,
		stdout: host_stdout,
		stderr: host_stderr,
		data: host_data,
	};
	Ok((recipe, ends))
}

/// Start the child in its own process group. The child-side pipe ends are
/// closed in the parent once this returns, whatever the outcome.
pub fn spawn(name: &str, recipe: SpawnRecipe) -> Result<Child> {
	if !recipe.work_dir.is_dir() {
		return Err(Error::WorkDirNotFound {
			name: name.to_string(),
			dir: recipe.work_dir,
		});
	}

	let SpawnRecipe {
		cmd: program,
		args,
		work_dir,
		env,
		stdin,
		stdout,
		stderr,
		data,
	} = recipe;

	let data_fd = data.as_raw_fd();
	let mut cmd = Command::new(&program);
	cmd.args(&args)
		.current_dir(&work_dir)
		.env_clear()
		.envs(&env)
		.stdin(stdin)
		.stdout(stdout)
		.stderr(stderr)
		.process_group(0);

	// SAFETY: the closure only calls async-signal-safe fcntl/dup2 between fork and exec.
	unsafe {
		cmd.pre_exec(move || attach_data_fd(data_fd));
	}

	let spawned = cmd.spawn();
	drop(cmd);
	drop(data);

	spawned.map_err(|source| match source.kind() {
		io::ErrorKind::NotFound => Error::ExecutableNotFound {
			name: name.to_string(),
			cmd: program,
		},
		io::ErrorKind::PermissionDenied => Error::PermissionDenied {
			name: name.to_string(),
			cmd: program,
		},
		_ => Error::Spawn {
			name: name.to_string(),
			source,
		},
	})
}

fn attach_data_fd(fd: RawFd) -> io::Result<()> {
	use nix::fcntl::{fcntl, FcntlArg, FdFlag};
	if fd == DATA_FD {
		fcntl(DATA_FD, FcntlArg::F_SETFD(FdFlag::empty()))?;
	} else {
		nix::unistd::dup2(fd, DATA_FD)?;
	}
	Ok(())
}

fn to_receiver(reader: PipeReader) -> io::Result<pipe::Receiver> {
	pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
}

fn to_sender(writer: PipeWriter) -> io::Result<pipe::Sender> {
	pipe::Sender::from_owned_fd(OwnedFd::from(writer))
}

/// Signals fired by the reaper once the descriptor is fully released.
#[derive(Clone)]
pub struct Reaped {
	rx: watch::Receiver<bool>,
}

impl Reaped {
	pub fn is_done(&self) -> bool {
		*self.rx.borrow()
	}

	pub async fn wait(mut self) {
		let _ = self.rx.wait_for(|done| *done).await;
	}
}

impl std::future::IntoFuture for Reaped {
	type Output = ();
	type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

	fn into_future(self) -> Self::IntoFuture {
		Box::pin(self.wait())
	}
}

struct Inner {
	status: ProcessStatus,
	pid: Option<u32>,
	started_at: Option<Instant>,
	recipe: Option<SpawnRecipe>,
	stdin: Option<pipe::Sender>,
	stdout: Option<pipe::Receiver>,
	stderr: Option<pipe::Receiver>,
	data: Option<pipe::Receiver>,
	child_tx: Option<oneshot::Sender<Child>>,
	pumps: Vec<JoinHandle<()>>,
}

/// One managed child: parameters, live handles, and its lifecycle signals.
pub struct Process {
	params: ProcessParams,
	generation: u64,
	restarts: u32,
	inner: Mutex<Inner>,
	pub(crate) transition: tokio::sync::Mutex<()>,
	status_tx: watch::Sender<ProcessStatus>,
	exit_tx: watch::Sender<Option<ExitInfo>>,
	reaped_tx: watch::Sender<bool>,
	stdout_tx: broadcast::Sender<String>,
	stderr_tx: broadcast::Sender<String>,
}

impl Process {
	/// Build a descriptor in `Prepared`; the returned sender hands the
	/// spawned child to whoever reaps it.
	pub(crate) fn prepared(
		params: ProcessParams,
		restarts: u32,
		recipe: SpawnRecipe,
		ends: HostEnds,
	) -> Result<(Self, oneshot::Receiver<Child>)> {
		let pipe_err = |source: io::Error| Error::PipeAllocation {
			name: params.name.clone(),
			source,
		};
		let stdin = to_sender(ends.stdin).map_err(pipe_err)?;
		let stdout = to_receiver(ends.stdout).map_err(pipe_err)?;
		let stderr = to_receiver(ends.stderr).map_err(pipe_err)?;
		let data = to_receiver(ends.data).map_err(pipe_err)?;

		let (child_tx, child_rx) = oneshot::channel();
		let (status_tx, _) = watch::channel(ProcessStatus::Prepared);
		let (exit_tx, _) = watch::channel(None);
		let (reaped_tx, _) = watch::channel(false);
		let (stdout_tx, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
		let (stderr_tx, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);

		let process = Self {
			params,
			generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
			restarts,
			inner: Mutex::new(Inner {
				status: ProcessStatus::Prepared,
				pid: None,
				started_at: None,
				recipe: Some(recipe),
				stdin: Some(stdin),
				stdout: Some(stdout),
				stderr: Some(stderr),
				data: Some(data),
				child_tx: Some(child_tx),
				pumps: Vec::new(),
			}),
			transition: tokio::sync::Mutex::new(()),
			status_tx,
			exit_tx,
			reaped_tx,
			stdout_tx,
			stderr_tx,
		};
		Ok((process, child_rx))
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		match self.inner.lock() {
			Ok(inner) => inner,
			Err(poisoned) => poisoned.into_inner(),
		}
	}

	pub fn name(&self) -> &str {
		&self.params.name
	}

	pub fn params(&self) -> &ProcessParams {
		&self.params
	}

	pub fn option(&self) -> ProcessOption {
		self.params.option
	}

	/// Distinguishes successive lives that share a name.
	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn restarts(&self) -> u32 {
		self.restarts
	}

	pub fn status(&self) -> ProcessStatus {
		self.lock().status
	}

	pub fn pid(&self) -> Option<u32> {
		self.lock().pid
	}

	pub fn started_at(&self) -> Option<Instant> {
		self.lock().started_at
	}

	pub fn uptime(&self) -> Option<Duration> {
		let inner = self.lock();
		match inner.status {
			ProcessStatus::Running | ProcessStatus::Exiting => inner.started_at.map(|t| t.elapsed()),
			_ => None,
		}
	}

	pub fn last_exit(&self) -> Option<ExitInfo> {
		*self.exit_tx.borrow()
	}

	pub fn info(&self) -> ProcessInfo {
		let (status, pid) = {
			let inner = self.lock();
			(inner.status, inner.pid)
		};
		ProcessInfo {
			name: self.params.name.clone(),
			status,
			pid,
			option: self.params.option,
			restarts: self.restarts,
			uptime_secs: self.uptime().map(|d| d.as_secs()),
			last_exit: self.last_exit(),
		}
	}

	pub fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
		self.status_tx.subscribe()
	}

	/// Lines the child writes to stdout, from the moment of subscription.
	pub fn subscribe_stdout(&self) -> broadcast::Receiver<String> {
		self.stdout_tx.subscribe()
	}

	pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
		self.stderr_tx.subscribe()
	}

	/// Writable end of the child's stdin. Taken once.
	pub fn take_stdin(&self) -> Option<pipe::Sender> {
		self.lock().stdin.take()
	}

	/// Readable end of the auxiliary data pipe (fd 3 in the child). Taken once.
	pub fn take_data(&self) -> Option<pipe::Receiver> {
		self.lock().data.take()
	}

	/// Resolves with the exit status once the OS wait completes.
	pub async fn exited(&self) -> ExitInfo {
		let mut rx = self.exit_tx.subscribe();
		let exit = match rx.wait_for(Option::is_some).await {
			Ok(exit) => *exit,
			Err(_) => None,
		};
		exit.unwrap_or_else(ExitInfo::never_started)
	}

	pub fn reaped(&self) -> Reaped {
		Reaped {
			rx: self.reaped_tx.subscribe(),
		}
	}

	pub(crate) fn set_status(&self, status: ProcessStatus) {
		self.lock().status = status;
		self.status_tx.send_replace(status);
	}

	pub(crate) fn take_recipe(&self) -> Option<SpawnRecipe> {
		self.lock().recipe.take()
	}

	pub(crate) fn take_output_ends(&self) -> (Option<pipe::Receiver>, Option<pipe::Receiver>) {
		let mut inner = self.lock();
		(inner.stdout.take(), inner.stderr.take())
	}

	pub(crate) fn stdout_sender(&self) -> broadcast::Sender<String> {
		self.stdout_tx.clone()
	}

	pub(crate) fn stderr_sender(&self) -> broadcast::Sender<String> {
		self.stderr_tx.clone()
	}

	pub(crate) fn add_pump(&self, pump: JoinHandle<()>) {
		self.lock().pumps.push(pump);
	}

	/// Hand the child to the reaper and mark the descriptor running.
	pub(crate) fn mark_running(&self, child: Child) -> std::result::Result<u32, Child> {
		let pid = child.id().unwrap_or(0);
		let mut inner = self.lock();
		let Some(child_tx) = inner.child_tx.take() else {
			return Err(child);
		};
		child_tx.send(child)?;
		inner.pid = Some(pid);
		inner.started_at = Some(Instant::now());
		inner.status = ProcessStatus::Running;
		drop(inner);
		self.status_tx.send_replace(ProcessStatus::Running);
		Ok(pid)
	}

	/// Drop the recipe and the reaper's child channel so a never-started
	/// descriptor gets released and can no longer be started.
	pub(crate) fn abandon(&self) {
		let mut inner = self.lock();
		inner.recipe.take();
		inner.child_tx.take();
	}

	pub(crate) fn record_exit(&self, exit: ExitInfo) {
		self.exit_tx.send_replace(Some(exit));
	}

	/// Close every stream endpoint still held, giving output pumps `drain`
	/// to flush what the child wrote before it died.
	pub(crate) async fn release_streams(&self, drain: Duration) {
		let pumps = {
			let mut inner = self.lock();
			inner.recipe.take();
			inner.stdin.take();
			inner.stdout.take();
			inner.stderr.take();
			inner.data.take();
			inner.child_tx.take();
			std::mem::take(&mut inner.pumps)
		};
		for mut pump in pumps {
			if tokio::time::timeout(drain, &mut pump).await.is_err() {
				pump.abort();
			}
		}
	}

	pub(crate) fn finish(&self) {
		let status = {
			let mut inner = self.lock();
			if inner.status != ProcessStatus::Failed {
				inner.status = ProcessStatus::Exited;
			}
			inner.status
		};
		self.status_tx.send_replace(status);
		self.reaped_tx.send_replace(true);
	}
}

impl std::fmt::Debug for Process {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Process")
			.field("name", &self.params.name)
			.field("generation", &self.generation)
			.field("status", &self.status())
			.field("pid", &self.pid())
			.finish()
	}
}
