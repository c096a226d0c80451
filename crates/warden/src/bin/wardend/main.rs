use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use warden::{AutoStart, CaptureSink, JsonFileStore, RuntimeConfig, RuntimePaths, Supervisor, SupervisorConfig, Watchdog};

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	if let Err(e) = run().await {
		tracing::error!("{}", e);
		std::process::exit(1);
	}
}

async fn run() -> warden::Result<()> {
	let paths = RuntimePaths::new("warden");
	let config_path = std::env::var_os("WARDEN_CONFIG")
		.map(PathBuf::from)
		.unwrap_or_else(|| paths.config_path());
	let config = RuntimeConfig::load(&config_path)?;

	let log_dir = config.log_dir(&paths);
	std::fs::create_dir_all(&log_dir)?;
	warden::logs::expire_logs(&log_dir, config.supervisor.max_log_files);
	{
		let log_dir = log_dir.clone();
		let max_files = config.supervisor.max_log_files;
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
				warden::logs::expire_logs(&log_dir, max_files);
			}
		});
	}

	let sink = Arc::new(CaptureSink::new(&log_dir, config.supervisor.max_log_size));
	let watchdog = Watchdog::new(config.supervisor.death_buffer);
	let supervisor = Supervisor::new(SupervisorConfig::from_settings(&config.supervisor, sink), watchdog);

	let store = Arc::new(JsonFileStore::new(config.store_path(&paths)));
	let autostart = AutoStart::new(Arc::clone(&supervisor), store)?;

	tracing::info!("wardend started (pid {})", std::process::id());

	let cancel = CancellationToken::new();
	let replay = {
		let cancel = cancel.clone();
		async move {
			autostart.start_all(&cancel).await;
			autostart
		}
	};
	tokio::pin!(replay);

	let autostart = tokio::select! {
		autostart = &mut replay => autostart,
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted during replay");
			cancel.cancel();
			replay.await
		}
	};

	if !cancel.is_cancelled() {
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::warn!("cannot listen for ctrl-c: {}", e);
		}
	}

	tracing::info!("shutting down");
	autostart.stop_all().await;
	supervisor.shutdown().await;
	Ok(())
}
