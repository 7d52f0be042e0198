//! Retrieval mode selection. `Mix` resolves to a concrete mode from what
//! the knowledge base actually recalled for the query: no entity seeds means
//! the graph has nothing to add, seeds without connecting edges make local
//! traversal the best effort, and a connected seed set justifies the full
//! hybrid merge.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
	Naive,
	Local,
	Global,
	Hybrid,
	Mix,
}
impl RetrievalMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Naive => "naive",
			Self::Local => "local",
			Self::Global => "global",
			Self::Hybrid => "hybrid",
			Self::Mix => "mix",
		}
	}
}
impl fmt::Display for RetrievalMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for RetrievalMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"naive" => Ok(Self::Naive),
			"local" => Ok(Self::Local),
			"global" => Ok(Self::Global),
			"hybrid" => Ok(Self::Hybrid),
			"mix" => Ok(Self::Mix),
			other => Err(format!(
				"unknown retrieval mode '{other}', expected one of naive, local, global, hybrid, mix"
			)),
		}
	}
}

/// Resolves `Mix` to a concrete mode. Any other mode passes through.
pub fn resolve_mix(requested: RetrievalMode, seed_count: usize, seed_edge_count: usize) -> RetrievalMode {
	if requested != RetrievalMode::Mix {
		return requested;
	}

	if seed_count == 0 {
		RetrievalMode::Naive
	} else if seed_edge_count == 0 {
		RetrievalMode::Local
	} else {
		RetrievalMode::Hybrid
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_all_modes() {
		for (text, mode) in [
			("naive", RetrievalMode::Naive),
			("LOCAL", RetrievalMode::Local),
			("global", RetrievalMode::Global),
			("hybrid", RetrievalMode::Hybrid),
			(" mix ", RetrievalMode::Mix),
		] {
			assert_eq!(text.parse::<RetrievalMode>().expect("mode"), mode);
		}

		assert!("fuzzy".parse::<RetrievalMode>().is_err());
	}

	#[test]
	fn mix_falls_back_to_naive_without_seeds() {
		assert_eq!(resolve_mix(RetrievalMode::Mix, 0, 0), RetrievalMode::Naive);
	}

	#[test]
	fn mix_uses_local_for_disconnected_seeds() {
		assert_eq!(resolve_mix(RetrievalMode::Mix, 3, 0), RetrievalMode::Local);
	}

	#[test]
	fn mix_uses_hybrid_for_connected_seeds() {
		assert_eq!(resolve_mix(RetrievalMode::Mix, 3, 2), RetrievalMode::Hybrid);
	}

	#[test]
	fn concrete_modes_pass_through() {
		assert_eq!(resolve_mix(RetrievalMode::Global, 0, 0), RetrievalMode::Global);
	}
}
