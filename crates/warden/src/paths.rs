use std::path::PathBuf;

/// XDG-style locations for one application's runtime state.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
	pub app_name: String,
}

impl RuntimePaths {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			app_name: app_name.into(),
		}
	}

	/// `$XDG_STATE_HOME/<app>`, else `~/.local/state/<app>`.
	pub fn state_dir(&self) -> PathBuf {
		self.xdg_dir("XDG_STATE_HOME", &[".local", "state"], PathBuf::from("/tmp").join(&self.app_name))
	}

	/// `$XDG_CONFIG_HOME/<app>`, else `~/.config/<app>`.
	pub fn config_dir(&self) -> PathBuf {
		self.xdg_dir(
			"XDG_CONFIG_HOME",
			&[".config"],
			PathBuf::from("/tmp").join(&self.app_name).join("config"),
		)
	}

	pub fn config_path(&self) -> PathBuf {
		self.config_dir().join("config.toml")
	}

	pub fn log_dir(&self) -> PathBuf {
		self.state_dir().join("logs")
	}

	pub fn autostart_store(&self) -> PathBuf {
		self.state_dir().join("autostart.json")
	}

	fn xdg_dir(&self, var: &str, under_home: &[&str], fallback: PathBuf) -> PathBuf {
		if let Some(base) = std::env::var_os(var).filter(|v| !v.is_empty()) {
			return PathBuf::from(base).join(&self.app_name);
		}
		match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
			Some(home) => under_home
				.iter()
				.fold(PathBuf::from(home), |dir, part| dir.join(part))
				.join(&self.app_name),
			None => fallback,
		}
	}
}
