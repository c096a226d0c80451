//! # warden
//!
//! Process supervisor toolkit: four-pipe children, a watchdog that reports
//! deaths once, auto-restart, and boot-time auto-start from a persisted
//! catalog.
//!
//! Pairs with `tether`, which speaks the plugin handshake and RPC on top.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use warden::{ProcessOption, ProcessParams, Supervisor, SupervisorConfig, Watchdog};
//!
//! # #[tokio::main]
//! # async fn main() -> warden::Result<()> {
//! let sup = Supervisor::new(SupervisorConfig::default(), Watchdog::new(64));
//!
//! sup.prepare(
//!     ProcessParams::new("web", "/bin/sh")
//!         .args(["-c", "echo hello; sleep 30"])
//!         .work_dir("/tmp")
//!         .option(ProcessOption::AUTO_RESTART | ProcessOption::HOOK_LOG),
//! )
//! .await?;
//! sup.start("web").await?;
//!
//! sup.stop("web").await?;
//! sup.wait("web").await?.await;
//! # Ok(())
//! # }
//! ```

pub mod autostart;
pub mod config;
pub mod error;
pub mod logs;
pub mod output;
pub mod paths;
pub mod process;
pub mod supervisor;
pub mod types;
pub mod watchdog;

pub use autostart::{AutoStart, AutoStartEntry, AutoStartPatch, AutoStartStore, JsonFileStore, MemoryStore, Replay};
pub use config::{AutostartSettings, PluginSettings, RuntimeConfig, SupervisorConfig, SupervisorSettings};
pub use error::{Error, Result};
pub use output::{CaptureSink, LogSink, OutputCapture, Stream, TracingSink};
pub use paths::RuntimePaths;
pub use process::{Process, Reaped};
pub use supervisor::Supervisor;
pub use types::*;
pub use watchdog::{Death, DeathStream, WatchOutcome, Watchdog};
