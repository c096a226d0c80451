use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// `MAJOR.MINOR.PATCH[-PRE][+BUILD]`.
///
/// Ordering follows semver precedence; build metadata only breaks ties so
/// that `Ord` stays consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
	pub pre: Vec<String>,
	pub build: Vec<String>,
}

impl SemanticVersion {
	pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
		Self {
			major,
			minor,
			patch,
			pre: Vec::new(),
			build: Vec::new(),
		}
	}

	/// `candidate` can talk to something built against `self`: same major,
	/// and it needs no more than `self`'s minor.
	pub fn compatible(&self, candidate: &SemanticVersion) -> bool {
		self.major == candidate.major && candidate.minor <= self.minor
	}

	/// Semver precedence, ignoring build metadata.
	pub fn precedence(&self, other: &Self) -> Ordering {
		self.major
			.cmp(&other.major)
			.then(self.minor.cmp(&other.minor))
			.then(self.patch.cmp(&other.patch))
			.then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
				(true, true) => Ordering::Equal,
				(true, false) => Ordering::Greater,
				(false, true) => Ordering::Less,
				(false, false) => compare_identifiers(&self.pre, &other.pre),
			})
	}
}

fn compare_identifiers(a: &[String], b: &[String]) -> Ordering {
	for (x, y) in a.iter().zip(b) {
		let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
			(Ok(x), Ok(y)) => x.cmp(&y),
			(Ok(_), Err(_)) => Ordering::Less,
			(Err(_), Ok(_)) => Ordering::Greater,
			(Err(_), Err(_)) => x.cmp(y),
		};
		if ord != Ordering::Equal {
			return ord;
		}
	}
	a.len().cmp(&b.len())
}

impl Ord for SemanticVersion {
	fn cmp(&self, other: &Self) -> Ordering {
		self.precedence(other)
			.then_with(|| compare_identifiers(&self.build, &other.build))
	}
}

impl PartialOrd for SemanticVersion {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for SemanticVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
		if !self.pre.is_empty() {
			write!(f, "-{}", self.pre.join("."))?;
		}
		if !self.build.is_empty() {
			write!(f, "+{}", self.build.join("."))?;
		}
		Ok(())
	}
}

impl FromStr for SemanticVersion {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let bad = || Error::VersionMalformed(s.to_string());
		let s_trim = s.trim();

		let (rest, build) = match s_trim.split_once('+') {
			Some((rest, build)) => (rest, identifiers(build).ok_or_else(bad)?),
			None => (s_trim, Vec::new()),
		};
		let (core, pre) = match rest.split_once('-') {
			Some((core, pre)) => (core, identifiers(pre).ok_or_else(bad)?),
			None => (rest, Vec::new()),
		};

		let mut numbers = core.split('.');
		let mut next = || -> Result<u32, Error> {
			let part = numbers.next().ok_or_else(bad)?;
			if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
				return Err(bad());
			}
			part.parse().map_err(|_| bad())
		};
		let major = next()?;
		let minor = next()?;
		let patch = next()?;
		if numbers.next().is_some() {
			return Err(bad());
		}

		Ok(Self {
			major,
			minor,
			patch,
			pre,
			build,
		})
	}
}

fn identifiers(s: &str) -> Option<Vec<String>> {
	s.split('.')
		.map(|id| {
			let valid = !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
			valid.then(|| id.to_string())
		})
		.collect()
}

impl Serialize for SemanticVersion {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for SemanticVersion {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}
