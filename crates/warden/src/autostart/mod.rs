//! Boot-time replay of a persisted process catalog.
//!
//! Entries are ordered by descending priority. [`AutoStart::start_all`]
//! brings up every enabled parallel entry at once, then walks the enabled
//! sequential entries in order, sleeping each entry's start delay first.
//! [`AutoStart::stop_all`] runs the same plan backwards.

mod store;

pub use store::{AutoStartEntry, AutoStartPatch, AutoStartStore, JsonFileStore, MemoryStore};

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

/// What a replay did.
#[derive(Debug, Default)]
pub struct Replay {
	/// Names started, in the order they came up.
	pub started: Vec<String>,
	pub failed: Vec<(String, Error)>,
	pub cancelled: bool,
}

pub struct AutoStart {
	supervisor: Arc<Supervisor>,
	store: Arc<dyn AutoStartStore>,
	catalog: RwLock<Vec<AutoStartEntry>>,
}

impl AutoStart {
	/// Loads the whole catalog from `store`.
	pub fn new(supervisor: Arc<Supervisor>, store: Arc<dyn AutoStartStore>) -> Result<Self> {
		let mut entries = store.find_all()?;
		sort_catalog(&mut entries);
		tracing::debug!("autostart catalog loaded ({} entries)", entries.len());
		Ok(Self {
			supervisor,
			store,
			catalog: RwLock::new(entries),
		})
	}

	pub async fn list(&self) -> Vec<AutoStartEntry> {
		self.catalog.read().await.clone()
	}

	/// Persist a new entry and return its id.
	pub async fn add(&self, mut entry: AutoStartEntry) -> Result<u64> {
		let mut catalog = self.catalog.write().await;
		entry.id = catalog.iter().map(|e| e.id).max().unwrap_or(0) + 1;
		if entry.created_at == 0 {
			entry.created_at = store::now_secs();
		}
		self.store.insert(&entry)?;
		let id = entry.id;
		tracing::info!("autostart: added {} as entry {}", entry.params.name, id);
		catalog.push(entry);
		sort_catalog(&mut catalog);
		Ok(id)
	}

	pub async fn remove(&self, id: u64) -> Result<()> {
		let mut catalog = self.catalog.write().await;
		let index = catalog
			.iter()
			.position(|e| e.id == id)
			.ok_or(Error::EntryNotFound(id))?;
		self.store.delete(id)?;
		let entry = catalog.remove(index);
		tracing::info!("autostart: removed entry {} ({})", id, entry.params.name);
		Ok(())
	}

	pub async fn enable(&self, id: u64) -> Result<()> {
		self.set_enabled(id, true).await
	}

	pub async fn disable(&self, id: u64) -> Result<()> {
		self.set_enabled(id, false).await
	}

	async fn set_enabled(&self, id: u64, enable: bool) -> Result<()> {
		let mut catalog = self.catalog.write().await;
		let entry = catalog
			.iter_mut()
			.find(|e| e.id == id)
			.ok_or(Error::EntryNotFound(id))?;
		self.store.update(id, &AutoStartPatch::enable(enable))?;
		entry.enable = enable;
		Ok(())
	}

	pub async fn enable_all(&self) -> Result<()> {
		self.set_all_enabled(true).await
	}

	pub async fn disable_all(&self) -> Result<()> {
		self.set_all_enabled(false).await
	}

	async fn set_all_enabled(&self, enable: bool) -> Result<()> {
		let mut catalog = self.catalog.write().await;
		let patch = AutoStartPatch::enable(enable);
		for entry in catalog.iter_mut() {
			self.store.update(entry.id, &patch)?;
			entry.enable = enable;
		}
		Ok(())
	}

	/// Replay the catalog. Failures are logged and the walk continues;
	/// cancelling `cancel` stops the walk before the next entry.
	pub async fn start_all(&self, cancel: &CancellationToken) -> Replay {
		let (parallel, sequential) = self.plan().await;
		let mut replay = Replay::default();
		if cancel.is_cancelled() {
			replay.cancelled = true;
			return replay;
		}

		let mut set = JoinSet::new();
		for entry in parallel {
			let supervisor = Arc::clone(&self.supervisor);
			set.spawn(async move {
				let name = entry.params.name.clone();
				(name, launch(&supervisor, entry).await)
			});
		}
		while let Some(joined) = set.join_next().await {
			match joined {
				Ok((name, outcome)) => record(&mut replay, name, outcome),
				Err(e) => tracing::error!("autostart: launch task failed: {}", e),
			}
		}

		for entry in sequential {
			if !entry.start_delay.is_zero() {
				tokio::select! {
					_ = cancel.cancelled() => {
						replay.cancelled = true;
						break;
					}
					_ = tokio::time::sleep(entry.start_delay) => {}
				}
			}
			if cancel.is_cancelled() {
				replay.cancelled = true;
				break;
			}
			let name = entry.params.name.clone();
			let outcome = launch(&self.supervisor, entry).await;
			record(&mut replay, name, outcome);
		}

		if replay.cancelled {
			tracing::warn!("autostart: replay cancelled after {} entries", replay.started.len());
		} else {
			tracing::info!(
				"autostart: {} started, {} failed",
				replay.started.len(),
				replay.failed.len()
			);
		}
		replay
	}

	/// Stop what [`AutoStart::start_all`] brought up: sequential entries in
	/// reverse order after their stop delay, then the parallel ones together.
	pub async fn stop_all(&self) {
		let (parallel, mut sequential) = self.plan().await;
		sequential.reverse();

		for entry in sequential {
			if !entry.stop_delay.is_zero() {
				tokio::time::sleep(entry.stop_delay).await;
			}
			halt(&self.supervisor, &entry.params.name).await;
		}

		let mut set = JoinSet::new();
		for entry in parallel {
			let supervisor = Arc::clone(&self.supervisor);
			set.spawn(async move { halt(&supervisor, &entry.params.name).await });
		}
		while set.join_next().await.is_some() {}
	}

	async fn plan(&self) -> (Vec<AutoStartEntry>, Vec<AutoStartEntry>) {
		self.catalog
			.read()
			.await
			.iter()
			.filter(|e| e.enable)
			.cloned()
			.partition(|e| e.parallel)
	}
}

fn sort_catalog(entries: &mut [AutoStartEntry]) {
	entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

async fn launch(supervisor: &Arc<Supervisor>, entry: AutoStartEntry) -> Result<()> {
	let name = entry.params.name.clone();
	supervisor.prepare(entry.params).await?;
	supervisor.start(&name).await
}

fn record(replay: &mut Replay, name: String, outcome: Result<()>) {
	match outcome {
		Ok(()) => replay.started.push(name),
		Err(e) => {
			tracing::error!("autostart: {} failed: {}", name, e);
			replay.failed.push((name, e));
		}
	}
}

async fn halt(supervisor: &Supervisor, name: &str) {
	let Ok(reaped) = supervisor.wait(name).await else {
		return;
	};
	match supervisor.stop(name).await {
		Ok(()) => reaped.await,
		Err(Error::NotRunning { status, .. }) if status.is_terminal() => reaped.await,
		Err(Error::NotRunning { .. }) => {}
		Err(e) => tracing::warn!("autostart: stopping {} failed: {}", name, e),
	}
}
