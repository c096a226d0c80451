//! Minimal plugin used by the host's end-to-end tests.
//!
//! Serves the `command` capability with `Hello` (answers `World`) and
//! `Echo` (joins its parameters). `ECHO_PLUGIN_VERSION` overrides the
//! announced plugin version.

use async_trait::async_trait;
use tether::plugin::{serve, Plugin};
use tether::SemanticVersion;

struct Echo {
	version: SemanticVersion,
}

#[async_trait]
impl Plugin for Echo {
	fn version(&self) -> SemanticVersion {
		self.version.clone()
	}

	async fn command(&self, name: &str, params: &[String]) -> Result<String, String> {
		match name {
			"Hello" => Ok("World".to_string()),
			"Echo" => Ok(params.join(" ")),
			_ => Err(format!("unknown command: {}", name)),
		}
	}

	async fn get_help(&self, name: &str) -> Result<String, String> {
		match name {
			"Hello" => Ok("Hello: replies World".to_string()),
			"Echo" => Ok("Echo <words>...: replies with its arguments".to_string()),
			_ => Err(format!("unknown command: {}", name)),
		}
	}

	async fn list_command(&self) -> Result<Vec<String>, String> {
		Ok(vec!["Hello".to_string(), "Echo".to_string()])
	}
}

#[tokio::main]
async fn main() {
	// stdout carries the handshake; logs go to stderr.
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();

	let version = match std::env::var("ECHO_PLUGIN_VERSION") {
		Ok(text) => match text.parse() {
			Ok(version) => version,
			Err(e) => {
				tracing::error!("{}", e);
				std::process::exit(2);
			}
		},
		Err(_) => SemanticVersion::new(1, 0, 0),
	};

	if let Err(e) = serve(Echo { version }).await {
		tracing::error!("echo-plugin: {}", e);
		std::process::exit(1);
	}
}
