use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::str::FromStr;

/// Option bitmask carried by every process descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessOption(u32);

impl ProcessOption {
	pub const NONE: Self = Self(0);
	/// Respawn the child when it exits without the supervisor asking it to.
	pub const AUTO_RESTART: Self = Self(1 << 1);
	/// Mirror stdout and stderr lines into the supervisor's log sink.
	pub const HOOK_LOG: Self = Self(1 << 2);

	const NAMED: [(Self, &'static str); 2] =
		[(Self::AUTO_RESTART, "AutoRestart"), (Self::HOOK_LOG, "HookLog")];

	pub fn contains(self, other: Self) -> bool {
		other.0 != 0 && self.0 & other.0 == other.0
	}

	pub fn is_none(self) -> bool {
		self.0 == 0
	}

	pub fn without(self, other: Self) -> Self {
		Self(self.0 & !other.0)
	}

	pub fn names(self) -> Vec<&'static str> {
		Self::NAMED
			.iter()
			.filter(|(flag, _)| self.contains(*flag))
			.map(|(_, name)| *name)
			.collect()
	}
}

impl BitOr for ProcessOption {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl BitOrAssign for ProcessOption {
	fn bitor_assign(&mut self, rhs: Self) {
		self.0 |= rhs.0;
	}
}

impl fmt::Display for ProcessOption {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_none() {
			return write!(f, "None");
		}
		write!(f, "{}", self.names().join(","))
	}
}

impl FromStr for ProcessOption {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut option = Self::NONE;
		for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
			if part.eq_ignore_ascii_case("none") {
				return Ok(Self::NONE);
			}
			let flag = Self::NAMED
				.iter()
				.find(|(_, name)| name.eq_ignore_ascii_case(part))
				.map(|(flag, _)| *flag)
				.ok_or_else(|| format!("not a valid process option: {:?}", part))?;
			option |= flag;
		}
		Ok(option)
	}
}

impl Serialize for ProcessOption {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.names().serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for ProcessOption {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Repr {
			List(Vec<String>),
			Text(String),
		}

		let text = match Repr::deserialize(deserializer)? {
			Repr::List(names) => names.join(","),
			Repr::Text(text) => text,
		};
		text.parse().map_err(serde::de::Error::custom)
	}
}

/// Everything needed to (re)create a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessParams {
	pub name: String,
	pub cmd: String,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default = "default_work_dir")]
	pub work_dir: PathBuf,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default)]
	pub option: ProcessOption,
}

fn default_work_dir() -> PathBuf {
	PathBuf::from(".")
}

impl ProcessParams {
	pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			cmd: cmd.into(),
			args: Vec::new(),
			work_dir: default_work_dir(),
			env: HashMap::new(),
			option: ProcessOption::NONE,
		}
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.work_dir = dir.into();
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.insert(key.into(), value.into());
		self
	}

	pub fn option(mut self, option: ProcessOption) -> Self {
		self.option = option;
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessStatus {
	Prepared,
	Running,
	Exiting,
	Exited,
	Failed,
}

impl ProcessStatus {
	pub fn is_running(self) -> bool {
		matches!(self, ProcessStatus::Running)
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, ProcessStatus::Exited | ProcessStatus::Failed)
	}
}

impl fmt::Display for ProcessStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ProcessStatus::Prepared => "Prepared",
			ProcessStatus::Running => "Running",
			ProcessStatus::Exiting => "Exiting",
			ProcessStatus::Exited => "Exited",
			ProcessStatus::Failed => "Failed",
		};
		f.write_str(s)
	}
}

/// How a child left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl ExitInfo {
	pub fn success(&self) -> bool {
		self.code == Some(0)
	}

	/// Exit recorded for a descriptor that was released without ever running.
	pub fn never_started() -> Self {
		Self { code: None, signal: None }
	}
}

impl From<std::process::ExitStatus> for ExitInfo {
	fn from(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;
		Self {
			code: status.code(),
			signal: status.signal(),
		}
	}
}

impl fmt::Display for ExitInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match (self.code, self.signal) {
			(Some(code), _) => write!(f, "exit {}", code),
			(None, Some(signal)) => write!(f, "signal {}", signal),
			(None, None) => write!(f, "not started"),
		}
	}
}

/// Point-in-time view of a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
	pub name: String,
	pub status: ProcessStatus,
	pub pid: Option<u32>,
	pub option: ProcessOption,
	pub restarts: u32,
	pub uptime_secs: Option<u64>,
	pub last_exit: Option<ExitInfo>,
}
