use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use warden::{
	AutoStart, AutoStartEntry, AutoStartStore, Error, JsonFileStore, LogSink, MemoryStore, ProcessOption,
	ProcessParams, ProcessStatus, Stream, Supervisor, SupervisorConfig, WatchOutcome, Watchdog,
};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> std::path::PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("warden-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn test_supervisor() -> Arc<Supervisor> {
	let config = SupervisorConfig {
		stop_grace: Duration::from_millis(500),
		..SupervisorConfig::default()
	};
	Supervisor::new(config, Watchdog::new(16))
}

fn sleeper(name: &str) -> ProcessParams {
	ProcessParams::new(name, "sleep").args(["30"]).work_dir("/tmp")
}

fn shell(name: &str, script: &str) -> ProcessParams {
	ProcessParams::new(name, "/bin/sh").args(["-c", script]).work_dir("/tmp")
}

fn sigkill(pid: u32) {
	kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
}

async fn eventually<F, Fut>(what: &str, check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	eventually_within(what, Duration::from_secs(5), check).await
}

async fn eventually_within<F, Fut>(what: &str, limit: Duration, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = Instant::now() + limit;
	loop {
		if check().await {
			return;
		}
		if Instant::now() >= deadline {
			panic!("timed out after {:?} waiting for {}", limit, what);
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

#[derive(Default)]
struct CollectingSink {
	lines: Mutex<Vec<(String, Stream, String)>>,
}

impl LogSink for CollectingSink {
	fn write_line(&self, process: &str, stream: Stream, line: &str) {
		self.lines
			.lock()
			.unwrap()
			.push((process.to_string(), stream, line.to_string()));
	}
}

// --- Prepare / Start ---

#[tokio::test]
async fn concurrent_prepare_has_one_winner() {
	let sup = test_supervisor();
	let mut handles = Vec::new();
	for _ in 0..16 {
		let sup = Arc::clone(&sup);
		handles.push(tokio::spawn(async move { sup.prepare(sleeper("dup")).await }));
	}

	let mut ok = 0;
	let mut exists = 0;
	for handle in handles {
		match handle.await.unwrap() {
			Ok(_) => ok += 1,
			Err(Error::AlreadyExists(name)) => {
				assert_eq!(name, "dup");
				exists += 1;
			}
			Err(e) => panic!("unexpected error: {}", e),
		}
	}
	assert_eq!(ok, 1);
	assert_eq!(exists, 15);
	sup.remove("dup").await.unwrap();
}

#[tokio::test]
async fn start_unknown_is_not_found() {
	let sup = test_supervisor();
	assert!(matches!(sup.start("ghost").await, Err(Error::NotFound(_))));
	assert!(matches!(sup.stop("ghost").await, Err(Error::NotFound(_))));
	assert!(!sup.is_alive("ghost").await);
}

#[tokio::test]
async fn start_twice_is_rejected() {
	let sup = test_supervisor();
	sup.prepare(sleeper("twice")).await.unwrap();
	sup.start("twice").await.unwrap();
	assert!(matches!(
		sup.start("twice").await,
		Err(Error::NotPrepared { status: ProcessStatus::Running, .. })
	));
	sup.stop("twice").await.unwrap();
	sup.wait("twice").await.unwrap().await;
}

#[tokio::test]
async fn failed_spawn_marks_descriptor_failed() {
	let sup = test_supervisor();
	let process = sup
		.prepare(ProcessParams::new("missing", "/definitely/not/a/binary").work_dir("/tmp"))
		.await
		.unwrap();
	assert!(matches!(sup.start("missing").await, Err(Error::ExecutableNotFound { .. })));
	process.reaped().await;
	assert_eq!(process.status(), ProcessStatus::Failed);
	assert!(sup.find_by_name("missing").await.is_none());
}

#[tokio::test]
async fn self_exit_is_reaped_and_unregistered() {
	let sup = test_supervisor();
	let process = sup.prepare(shell("quick", "exit 3")).await.unwrap();
	sup.start("quick").await.unwrap();
	process.reaped().await;

	assert_eq!(process.status(), ProcessStatus::Exited);
	assert_eq!(process.last_exit().unwrap().code, Some(3));
	assert!(sup.find_by_name("quick").await.is_none());
	assert!(process.take_stdin().is_none());
	assert!(process.take_data().is_none());
}

// --- Streams ---

#[tokio::test]
async fn stdout_and_stderr_lines_are_broadcast() {
	let sup = test_supervisor();
	let process = sup
		.prepare(shell("talker", "echo out-line; echo err-line >&2"))
		.await
		.unwrap();
	let mut stdout = process.subscribe_stdout();
	let mut stderr = process.subscribe_stderr();
	sup.start("talker").await.unwrap();

	assert_eq!(stdout.recv().await.unwrap(), "out-line");
	assert_eq!(stderr.recv().await.unwrap(), "err-line");
	process.reaped().await;
}

#[tokio::test]
async fn hook_log_mirrors_lines_into_sink() {
	let sink = Arc::new(CollectingSink::default());
	let config = SupervisorConfig {
		log_sink: sink.clone(),
		..SupervisorConfig::default()
	};
	let sup = Supervisor::new(config, Watchdog::new(4));

	let hooked = sup
		.prepare(shell("hooked", "echo one; echo two >&2").option(ProcessOption::HOOK_LOG))
		.await
		.unwrap();
	let quiet = sup.prepare(shell("quiet", "echo hidden")).await.unwrap();
	sup.start("hooked").await.unwrap();
	sup.start("quiet").await.unwrap();
	hooked.reaped().await;
	quiet.reaped().await;

	let lines = sink.lines.lock().unwrap().clone();
	assert!(lines.contains(&("hooked".to_string(), Stream::Stdout, "one".to_string())));
	assert!(lines.contains(&("hooked".to_string(), Stream::Stderr, "two".to_string())));
	assert!(lines.iter().all(|(name, _, _)| name != "quiet"));
}

#[tokio::test]
async fn stdin_and_data_pipes_reach_the_child() {
	let sup = test_supervisor();
	let process = sup
		.prepare(shell("piped", "read line; echo \"got $line\" >&3"))
		.await
		.unwrap();
	let mut stdin = process.take_stdin().unwrap();
	let mut data = process.take_data().unwrap();
	assert!(process.take_stdin().is_none());
	sup.start("piped").await.unwrap();

	stdin.write_all(b"ping\n").await.unwrap();
	drop(stdin);
	let mut out = String::new();
	data.read_to_string(&mut out).await.unwrap();
	assert_eq!(out, "got ping\n");
	process.reaped().await;
}

#[tokio::test]
async fn env_overlay_reaches_the_child() {
	let sup = test_supervisor();
	let process = sup
		.prepare(shell("env", "echo $WARDEN_GREETING").env("WARDEN_GREETING", "hi there"))
		.await
		.unwrap();
	let mut stdout = process.subscribe_stdout();
	sup.start("env").await.unwrap();
	assert_eq!(stdout.recv().await.unwrap(), "hi there");
	process.reaped().await;
}

// --- Stop / Kill ---

#[tokio::test]
async fn double_stop_ends_in_the_same_state() {
	let sup = test_supervisor();
	let mut deaths = sup.watchdog().deaths();
	let process = sup
		.prepare(sleeper("twostop").option(ProcessOption::AUTO_RESTART))
		.await
		.unwrap();
	sup.start("twostop").await.unwrap();

	sup.stop("twostop").await.unwrap();
	match sup.stop("twostop").await {
		Ok(()) | Err(Error::NotRunning { .. }) | Err(Error::NotFound(_)) => {}
		Err(e) => panic!("second stop failed: {}", e),
	}
	process.reaped().await;
	assert_eq!(process.status(), ProcessStatus::Exited);
	assert_eq!(process.last_exit().unwrap().signal, Some(Signal::SIGTERM as i32));

	// A requested stop is not a death, so nothing comes back.
	assert!(tokio::time::timeout(Duration::from_millis(300), deaths.recv()).await.is_err());
	assert!(sup.find_by_name("twostop").await.is_none());
}

#[tokio::test]
async fn stop_escalates_to_sigkill_after_grace() {
	let sup = test_supervisor();
	let process = sup
		.prepare(shell("stubborn", "trap '' TERM; echo ready; while true; do sleep 0.1; done"))
		.await
		.unwrap();
	let mut stdout = process.subscribe_stdout();
	sup.start("stubborn").await.unwrap();
	assert_eq!(stdout.recv().await.unwrap(), "ready");

	sup.stop("stubborn").await.unwrap();
	assert_eq!(process.status(), ProcessStatus::Exiting);
	tokio::time::timeout(Duration::from_secs(5), process.reaped())
		.await
		.expect("grace kill did not happen");
	assert_eq!(process.last_exit().unwrap().signal, Some(Signal::SIGKILL as i32));
}

#[tokio::test]
async fn kill_sends_sigkill() {
	let sup = test_supervisor();
	let process = sup.prepare(sleeper("victim")).await.unwrap();
	sup.start("victim").await.unwrap();
	assert!(sup.is_alive("victim").await);

	sup.kill("victim").await.unwrap();
	sup.wait("victim").await.unwrap().await;
	assert_eq!(process.last_exit().unwrap().signal, Some(Signal::SIGKILL as i32));
	assert!(!sup.is_alive("victim").await);
}

#[tokio::test]
async fn stop_instance_leaves_a_newer_life_alone() {
	let sup = test_supervisor();
	let first = sup.prepare(sleeper("reused")).await.unwrap();
	sup.start("reused").await.unwrap();
	sigkill(first.pid().unwrap());
	first.reaped().await;
	assert!(sup.find_by_name("reused").await.is_none());

	let second = sup.prepare(sleeper("reused")).await.unwrap();
	sup.start("reused").await.unwrap();

	assert!(matches!(
		sup.stop_instance(&first).await,
		Err(Error::NotRunning { status: ProcessStatus::Exited, .. })
	));
	assert!(matches!(sup.kill_instance(&first).await, Err(Error::NotRunning { .. })));
	assert_eq!(second.status(), ProcessStatus::Running);
	assert!(sup.is_alive("reused").await);

	sup.stop_instance(&second).await.unwrap();
	second.reaped().await;
	assert!(sup.find_by_name("reused").await.is_none());
}

#[tokio::test]
async fn stop_racing_a_self_exit_still_ends_exited() {
	let sup = test_supervisor();
	for round in 0..50 {
		let process = sup.prepare(shell("racer", "exit 0")).await.unwrap();
		sup.start("racer").await.unwrap();

		let stopper = {
			let sup = Arc::clone(&sup);
			let process = Arc::clone(&process);
			tokio::spawn(async move { sup.stop_instance(&process).await })
		};
		process.reaped().await;
		match stopper.await.unwrap() {
			Ok(()) | Err(Error::NotRunning { .. }) => {}
			Err(e) => panic!("round {}: stop failed: {}", round, e),
		}
		assert_eq!(process.status(), ProcessStatus::Exited, "round {}", round);
		assert!(sup.find_by_name("racer").await.is_none());
	}
}

#[tokio::test]
async fn stop_prepared_is_not_running() {
	let sup = test_supervisor();
	sup.prepare(sleeper("idle")).await.unwrap();
	assert!(matches!(
		sup.stop("idle").await,
		Err(Error::NotRunning { status: ProcessStatus::Prepared, .. })
	));
	sup.remove("idle").await.unwrap();
	assert!(sup.find_by_name("idle").await.is_none());
}

#[tokio::test]
async fn remove_running_is_refused() {
	let sup = test_supervisor();
	sup.prepare(sleeper("busy")).await.unwrap();
	sup.start("busy").await.unwrap();
	assert!(matches!(sup.remove("busy").await, Err(Error::StillRunning(_))));
	sup.kill("busy").await.unwrap();
	sup.wait("busy").await.unwrap().await;
}

// --- Watchdog / auto-restart ---

#[tokio::test]
async fn death_without_auto_restart_is_reported_once() {
	let sup = test_supervisor();
	let mut deaths = sup.watchdog().deaths();
	let process = sup.prepare(sleeper("mortal")).await.unwrap();
	sup.start("mortal").await.unwrap();

	assert_eq!(sup.watch("mortal").await.unwrap(), WatchOutcome::Installed);
	assert_eq!(sup.watch("mortal").await.unwrap(), WatchOutcome::AlreadyWatching);

	sigkill(process.pid().unwrap());
	let death = tokio::time::timeout(Duration::from_secs(5), deaths.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(death.process.name(), "mortal");
	assert_eq!(death.exit.signal, Some(Signal::SIGKILL as i32));

	process.reaped().await;
	assert!(tokio::time::timeout(Duration::from_millis(300), deaths.recv()).await.is_err());
	assert!(sup.find_by_name("mortal").await.is_none());
	assert_eq!(process.restarts(), 0);
	assert!(!sup.watchdog().is_watching("mortal"));
}

#[tokio::test]
async fn every_external_kill_is_restarted() {
	const KILLS: u32 = 3;
	let sup = test_supervisor();
	let mut deaths = sup.watchdog().deaths();
	sup.prepare(sleeper("phoenix").option(ProcessOption::AUTO_RESTART))
		.await
		.unwrap();
	sup.start("phoenix").await.unwrap();

	for round in 0..KILLS {
		let current = sup.find_by_name("phoenix").await.unwrap();
		assert_eq!(current.restarts(), round);
		sigkill(current.pid().unwrap());

		let death = tokio::time::timeout(Duration::from_secs(5), deaths.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(death.process.generation(), current.generation());

		let dead = current.generation();
		// The restart loop has no backoff, so a new life shows up promptly.
		eventually_within("respawn", Duration::from_secs(1), || {
			let sup = Arc::clone(&sup);
			async move {
				match sup.find_by_name("phoenix").await {
					Some(p) => p.generation() != dead && p.status() == ProcessStatus::Running,
					None => false,
				}
			}
		})
		.await;
	}

	let last = sup.find_by_name("phoenix").await.unwrap();
	assert_eq!(last.restarts(), KILLS);
	assert_eq!(sup.watchdog().dropped_deaths(), 0);

	sup.shutdown().await;
	assert!(sup.find_by_name("phoenix").await.is_none());
}

#[tokio::test]
async fn shutdown_suppresses_restarts() {
	let sup = test_supervisor();
	sup.prepare(sleeper("a").option(ProcessOption::AUTO_RESTART)).await.unwrap();
	sup.prepare(sleeper("b").option(ProcessOption::AUTO_RESTART)).await.unwrap();
	sup.prepare(sleeper("c")).await.unwrap();
	sup.start("a").await.unwrap();
	sup.start("b").await.unwrap();

	sup.shutdown().await;
	assert!(sup.is_shutting_down());
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert!(sup.list_all().await.is_empty());
}

// --- Restart / Clean ---

#[tokio::test]
async fn restart_brings_up_a_new_life() {
	let sup = test_supervisor();
	let first = sup.prepare(sleeper("cycle")).await.unwrap();
	sup.start("cycle").await.unwrap();
	let old_pid = first.pid().unwrap();

	let second = sup.restart("cycle").await.unwrap();
	assert!(first.reaped().is_done());
	assert_eq!(second.restarts(), 1);
	assert_eq!(second.status(), ProcessStatus::Running);
	assert_ne!(second.pid().unwrap(), old_pid);
	assert!(Arc::ptr_eq(&sup.find_by_name("cycle").await.unwrap(), &second));

	sup.stop("cycle").await.unwrap();
	second.reaped().await;
}

#[tokio::test]
async fn restart_of_prepared_just_starts() {
	let sup = test_supervisor();
	let process = sup.prepare(sleeper("fresh")).await.unwrap();
	let same = sup.restart("fresh").await.unwrap();
	assert!(Arc::ptr_eq(&process, &same));
	assert_eq!(same.restarts(), 0);
	sup.kill("fresh").await.unwrap();
	same.reaped().await;
}

#[tokio::test]
async fn clean_removes_the_work_dir() {
	let sup = test_supervisor();
	let dir = temp_dir("clean");
	std::fs::write(dir.join("state.txt"), "x").unwrap();

	sup.prepare(sleeper("cleaned").work_dir(&dir)).await.unwrap();
	sup.start("cleaned").await.unwrap();
	sup.clean("cleaned").await.unwrap();

	assert!(!dir.exists());
	assert!(sup.find_by_name("cleaned").await.is_none());
}

#[tokio::test]
async fn clean_collects_a_never_started_descriptor() {
	let sup = test_supervisor();
	let dir = temp_dir("clean-prepared");
	let process = sup.prepare(sleeper("unborn").work_dir(&dir)).await.unwrap();

	sup.clean("unborn").await.unwrap();
	assert!(process.reaped().is_done());
	assert!(!dir.exists());
	assert!(sup.find_by_name("unborn").await.is_none());
	assert!(matches!(sup.start("unborn").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn list_all_is_sorted_by_name() {
	let sup = test_supervisor();
	for name in ["zeta", "alpha", "mid"] {
		sup.prepare(sleeper(name)).await.unwrap();
	}
	let names: Vec<_> = sup
		.list_all()
		.await
		.iter()
		.map(|p| p.name().to_string())
		.collect();
	assert_eq!(names, ["alpha", "mid", "zeta"]);
	sup.shutdown().await;
}

// --- Auto-start ---

fn appender(name: &str, file: &std::path::Path) -> ProcessParams {
	shell(name, &format!("echo {} >> {}", name, file.display()))
}

#[tokio::test]
async fn autostart_replays_by_priority() {
	let sup = test_supervisor();
	let dir = temp_dir("autostart-order");
	let order = dir.join("order.txt");

	let entries = vec![
		AutoStartEntry { id: 1, ..AutoStartEntry::new(appender("low", &order)).priority(1) },
		AutoStartEntry {
			id: 2,
			..AutoStartEntry::new(appender("high", &order))
				.priority(10)
				.start_delay(Duration::from_millis(50))
		},
		AutoStartEntry {
			id: 3,
			..AutoStartEntry::new(appender("mid", &order))
				.priority(5)
				.start_delay(Duration::from_millis(50))
		},
		AutoStartEntry { id: 4, ..AutoStartEntry::new(sleeper("side")).priority(0).parallel(true) },
		AutoStartEntry { id: 5, ..AutoStartEntry::new(appender("off", &order)).priority(7).enable(false) },
	];
	let store = Arc::new(MemoryStore::with_entries(entries));
	let autostart = AutoStart::new(Arc::clone(&sup), store).unwrap();

	let listed: Vec<_> = autostart.list().await.iter().map(|e| e.id).collect();
	assert_eq!(listed, [2, 5, 3, 1, 4]);

	let replay = autostart.start_all(&CancellationToken::new()).await;
	assert!(!replay.cancelled);
	assert!(replay.failed.is_empty());
	assert_eq!(replay.started, ["side", "high", "mid", "low"]);

	eventually("appenders to finish", || {
		let order = order.clone();
		async move {
			std::fs::read_to_string(&order)
				.map(|s| s.lines().count() == 3)
				.unwrap_or(false)
		}
	})
	.await;
	let written = std::fs::read_to_string(&order).unwrap();
	assert_eq!(written.lines().collect::<Vec<_>>(), ["high", "mid", "low"]);
	assert!(sup.is_alive("side").await);

	autostart.stop_all().await;
	assert!(sup.find_by_name("side").await.is_none());
}

#[tokio::test]
async fn autostart_delayed_sequential_follows_the_parallel_group() {
	let sup = test_supervisor();
	let autostart = AutoStart::new(Arc::clone(&sup), Arc::new(MemoryStore::new())).unwrap();
	autostart
		.add(AutoStartEntry::new(sleeper("b")).priority(20).parallel(true))
		.await
		.unwrap();
	autostart
		.add(AutoStartEntry::new(sleeper("a")).priority(10).start_delay(Duration::from_millis(100)))
		.await
		.unwrap();

	let replay = autostart.start_all(&CancellationToken::new()).await;
	assert_eq!(replay.started, ["b", "a"]);

	let b = sup.find_by_name("b").await.unwrap().started_at().unwrap();
	let a = sup.find_by_name("a").await.unwrap().started_at().unwrap();
	let gap = a.saturating_duration_since(b);
	assert!(gap >= Duration::from_millis(100), "a started {:?} after b", gap);

	autostart.stop_all().await;
	assert!(sup.list_all().await.is_empty());
}

#[tokio::test]
async fn autostart_failures_do_not_stop_the_walk() {
	let sup = test_supervisor();
	let store = Arc::new(MemoryStore::new());
	let autostart = AutoStart::new(Arc::clone(&sup), store).unwrap();
	autostart
		.add(AutoStartEntry::new(ProcessParams::new("broken", "/definitely/not/a/binary").work_dir("/tmp")).priority(2))
		.await
		.unwrap();
	autostart.add(AutoStartEntry::new(sleeper("fine")).priority(1)).await.unwrap();

	let replay = autostart.start_all(&CancellationToken::new()).await;
	assert_eq!(replay.started, ["fine"]);
	assert_eq!(replay.failed.len(), 1);
	assert_eq!(replay.failed[0].0, "broken");

	autostart.stop_all().await;
	assert!(sup.list_all().await.is_empty());
}

#[tokio::test]
async fn autostart_cancel_stops_the_walk() {
	let sup = test_supervisor();
	let autostart = AutoStart::new(Arc::clone(&sup), Arc::new(MemoryStore::new())).unwrap();
	autostart.add(AutoStartEntry::new(sleeper("first")).priority(2)).await.unwrap();
	autostart
		.add(AutoStartEntry::new(sleeper("later")).priority(1).start_delay(Duration::from_secs(30)))
		.await
		.unwrap();

	let cancel = CancellationToken::new();
	let trigger = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(200)).await;
		trigger.cancel();
	});

	let replay = tokio::time::timeout(Duration::from_secs(5), autostart.start_all(&cancel))
		.await
		.unwrap();
	assert!(replay.cancelled);
	assert_eq!(replay.started, ["first"]);
	assert!(sup.find_by_name("later").await.is_none());
	sup.shutdown().await;
}

#[tokio::test]
async fn autostart_catalog_persists_to_json() {
	let sup = test_supervisor();
	let path = temp_dir("autostart-json").join("autostart.json");
	let store = Arc::new(JsonFileStore::new(&path));
	let autostart = AutoStart::new(Arc::clone(&sup), store).unwrap();

	let a = autostart.add(AutoStartEntry::new(sleeper("a")).priority(3)).await.unwrap();
	let b = autostart.add(AutoStartEntry::new(sleeper("b")).parallel(true)).await.unwrap();
	assert_ne!(a, b);
	autostart.disable(a).await.unwrap();
	autostart.remove(b).await.unwrap();
	assert!(matches!(autostart.enable(b).await, Err(Error::EntryNotFound(_))));

	let reopened = JsonFileStore::new(&path).find_all().unwrap();
	assert_eq!(reopened.len(), 1);
	assert_eq!(reopened[0].id, a);
	assert!(!reopened[0].enable);
	assert!(reopened[0].created_at > 0);

	autostart.enable_all().await.unwrap();
	assert!(JsonFileStore::new(&path).find_all().unwrap()[0].enable);
	autostart.disable_all().await.unwrap();
	assert!(autostart.list().await.iter().all(|e| !e.enable));

	let replay = autostart.start_all(&CancellationToken::new()).await;
	assert!(replay.started.is_empty());
}
