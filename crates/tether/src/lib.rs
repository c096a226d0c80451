//! # tether
//!
//! Plugin host runtime on top of `warden`: launch a plugin under the
//! supervisor, read its stdout handshake, dial the address it announces and
//! talk to it over line-delimited JSON-RPC.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{PluginConfig, PluginHost};
//! use tokio_util::sync::CancellationToken;
//! use warden::{Supervisor, SupervisorConfig, Watchdog};
//!
//! # #[tokio::main]
//! # async fn main() -> tether::Result<()> {
//! let supervisor = Supervisor::new(SupervisorConfig::default(), Watchdog::new(64));
//! let host = PluginHost::new(Arc::clone(&supervisor));
//!
//! let session = host
//!     .start(PluginConfig::new("echo", "/usr/local/bin/echo-plugin"), &CancellationToken::new())
//!     .await?;
//! let commands = session.command_client().await?;
//! println!("{}", commands.command("Hello", &[]).await?);
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Plugin binaries use [`plugin::serve`] to do their half of the handshake.

pub mod address;
pub mod capability;
pub mod error;
pub mod handshake;
pub mod host;
pub mod plugin;
pub mod protocol;
pub mod rpc;
pub mod version;

pub use address::{PluginAddress, TcpFamily};
pub use capability::{Capabilities, Capability, CommandClient};
pub use error::{Error, Result, VersionKind};
pub use handshake::{HandshakeParser, PluginReport, Step, CORE_VERSION};
pub use host::{PluginConfig, PluginHost, Session};
pub use protocol::{Protocol, Protocols};
pub use rpc::{Channel, CoreClient, Dialer, Dialers, TlsConfig};
pub use version::SemanticVersion;
