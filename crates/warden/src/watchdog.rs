use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot};

use crate::error::{Error, Result};
use crate::process::Process;
use crate::types::ExitInfo;

/// A child that exited while a dog was watching it.
#[derive(Debug, Clone)]
pub struct Death {
	pub process: Arc<Process>,
	pub exit: ExitInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
	Installed,
	AlreadyWatching,
}

struct Dog {
	generation: u64,
	stopping: Arc<AtomicBool>,
	stop_tx: oneshot::Sender<()>,
}

type Dogs = Arc<Mutex<HashMap<String, Dog>>>;

/// Observes watched children and publishes each unrequested death once.
pub struct Watchdog {
	dogs: Dogs,
	deaths: broadcast::Sender<Death>,
	dropped: Arc<AtomicU64>,
}

impl Watchdog {
	/// `buffer` bounds each subscriber's backlog; a subscriber that falls
	/// further behind loses the oldest deaths and they are counted as dropped.
	pub fn new(buffer: usize) -> Arc<Self> {
		let (deaths, _) = broadcast::channel(buffer.max(1));
		Arc::new(Self {
			dogs: Arc::new(Mutex::new(HashMap::new())),
			deaths,
			dropped: Arc::new(AtomicU64::new(0)),
		})
	}

	pub fn start_watch(&self, process: &Arc<Process>) -> WatchOutcome {
		let name = process.name().to_string();
		let generation = process.generation();
		let mut dogs = lock(&self.dogs);

		if let Some(existing) = dogs.get(&name) {
			if existing.generation == generation {
				tracing::warn!("{}: a watcher for this process already exists", name);
				return WatchOutcome::AlreadyWatching;
			}
			if let Some(stale) = dogs.remove(&name) {
				tracing::debug!("{}: replacing watcher of a previous life", name);
				stale.stopping.store(true, Ordering::SeqCst);
				let _ = stale.stop_tx.send(());
			}
		}

		let stopping = Arc::new(AtomicBool::new(false));
		let (stop_tx, stop_rx) = oneshot::channel();
		dogs.insert(
			name.clone(),
			Dog {
				generation,
				stopping: Arc::clone(&stopping),
				stop_tx,
			},
		);
		drop(dogs);

		tracing::info!("{}: watching (pid {:?})", name, process.pid());
		tokio::spawn(watch(
			Arc::clone(process),
			stopping,
			stop_rx,
			Arc::clone(&self.dogs),
			self.deaths.clone(),
			Arc::clone(&self.dropped),
		));
		WatchOutcome::Installed
	}

	/// Stop watching `process`. Once this returns `Ok`, no death will be
	/// published for the current life.
	pub fn stop_watch(&self, process: &Process) -> Result<()> {
		let name = process.name();
		let mut dogs = lock(&self.dogs);
		let current = dogs
			.get(name)
			.filter(|dog| dog.generation == process.generation())
			.ok_or_else(|| Error::NotWatching(name.to_string()))?;

		if current
			.stopping
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return Err(Error::WatchStopping(name.to_string()));
		}

		if let Some(dog) = dogs.remove(name) {
			tracing::info!("{}: stopping watcher", name);
			let _ = dog.stop_tx.send(());
		}
		Ok(())
	}

	pub fn is_watching(&self, name: &str) -> bool {
		lock(&self.dogs).contains_key(name)
	}

	pub fn deaths(&self) -> DeathStream {
		DeathStream {
			rx: self.deaths.subscribe(),
			dropped: Arc::clone(&self.dropped),
		}
	}

	/// Deaths lost to slow or absent subscribers.
	pub fn dropped_deaths(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

async fn watch(
	process: Arc<Process>,
	stopping: Arc<AtomicBool>,
	stop_rx: oneshot::Receiver<()>,
	dogs: Dogs,
	deaths: broadcast::Sender<Death>,
	dropped: Arc<AtomicU64>,
) {
	tokio::select! {
		exit = process.exited() => {
			if stopping
				.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
				.is_err()
			{
				return;
			}
			remove_dog(&dogs, process.name(), process.generation());
			tracing::info!("{}: is dead ({}), advising supervisor", process.name(), exit);
			if deaths.send(Death { process, exit }).is_err() {
				dropped.fetch_add(1, Ordering::Relaxed);
				tracing::warn!("death event dropped: no subscribers");
			}
		}
		_ = stop_rx => {
			remove_dog(&dogs, process.name(), process.generation());
		}
	}
}

fn remove_dog(dogs: &Dogs, name: &str, generation: u64) {
	let mut dogs = lock(dogs);
	if dogs.get(name).is_some_and(|dog| dog.generation == generation) {
		dogs.remove(name);
	}
}

fn lock(dogs: &Dogs) -> std::sync::MutexGuard<'_, HashMap<String, Dog>> {
	match dogs.lock() {
		Ok(guard) => guard,
		Err(poisoned) => poisoned.into_inner(),
	}
}

/// One subscriber's view of the death stream.
pub struct DeathStream {
	rx: broadcast::Receiver<Death>,
	dropped: Arc<AtomicU64>,
}

impl DeathStream {
	/// Next death, or `None` once the watchdog is gone.
	pub async fn recv(&mut self) -> Option<Death> {
		loop {
			match self.rx.recv().await {
				Ok(death) => return Some(death),
				Err(broadcast::error::RecvError::Lagged(n)) => {
					self.dropped.fetch_add(n, Ordering::Relaxed);
					tracing::warn!("death stream lagged, {} events dropped", n);
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}
