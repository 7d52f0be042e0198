//! Name normalization and fuzzy similarity for entity resolution. Two
//! mentions merge when their token-sort ratio reaches the configured
//! threshold; exact normalized matches short-circuit the fuzzy pass.

use uuid::Uuid;

pub fn normalize_entity_name(input: &str) -> String {
	input.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Similarity in [0, 1] between whitespace-token-sorted renditions of the
/// two names. Insensitive to word order and casing.
pub fn token_sort_ratio(left: &str, right: &str) -> f32 {
	let left = sorted_tokens(left);
	let right = sorted_tokens(right);

	ratio(&left, &right)
}

/// Plain normalized-Levenshtein similarity in [0, 1].
pub fn ratio(left: &str, right: &str) -> f32 {
	if left.is_empty() && right.is_empty() {
		return 1.0;
	}

	let left_chars: Vec<char> = left.chars().collect();
	let right_chars: Vec<char> = right.chars().collect();
	let max_len = left_chars.len().max(right_chars.len());

	if max_len == 0 {
		return 1.0;
	}

	let distance = levenshtein(&left_chars, &right_chars);

	1.0 - distance as f32 / max_len as f32
}

/// Combined similarity used for resolution: the token-sort ratio, floored
/// at [`INITIALS_SIMILARITY`] when the two names are initials-compatible
/// renditions of each other ("Jane Doe" / "J. Doe").
pub fn name_similarity(left: &str, right: &str) -> f32 {
	let base = token_sort_ratio(left, right);

	if initials_compatible(left, right) { base.max(INITIALS_SIMILARITY) } else { base }
}

/// Above the default merge threshold, below an exact match.
pub const INITIALS_SIMILARITY: f32 = 0.95;

/// True when both names have the same token count and every aligned token
/// pair is either equal or an initial of its counterpart, with at least one
/// multi-character token matching exactly.
pub fn initials_compatible(left: &str, right: &str) -> bool {
	let left_tokens = stripped_tokens(left);
	let right_tokens = stripped_tokens(right);

	if left_tokens.len() != right_tokens.len() || left_tokens.is_empty() {
		return false;
	}

	let mut full_token_match = false;

	for (lhs, rhs) in left_tokens.iter().zip(right_tokens.iter()) {
		if lhs == rhs {
			if lhs.chars().count() > 1 {
				full_token_match = true;
			}

			continue;
		}

		let initial_pair = match (lhs.chars().count(), rhs.chars().count()) {
			(1, _) => rhs.starts_with(lhs.as_str()),
			(_, 1) => lhs.starts_with(rhs.as_str()),
			_ => false,
		};

		if !initial_pair {
			return false;
		}
	}

	full_token_match
}

fn stripped_tokens(input: &str) -> Vec<String> {
	normalize_entity_name(input)
		.split_whitespace()
		.map(|token| token.trim_end_matches('.').to_string())
		.filter(|token| !token.is_empty())
		.collect()
}

fn sorted_tokens(input: &str) -> String {
	let mut tokens: Vec<&str> = input.split_whitespace().collect();

	tokens.sort_unstable();

	tokens.join(" ")
}

fn levenshtein(left: &[char], right: &[char]) -> usize {
	if left.is_empty() {
		return right.len();
	}
	if right.is_empty() {
		return left.len();
	}

	let mut previous: Vec<usize> = (0..=right.len()).collect();
	let mut current = vec![0_usize; right.len() + 1];

	for (i, lhs) in left.iter().enumerate() {
		current[0] = i + 1;

		for (j, rhs) in right.iter().enumerate() {
			let substitution = previous[j] + usize::from(!lhs.eq_ignore_ascii_case(rhs));

			current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
		}

		std::mem::swap(&mut previous, &mut current);
	}

	previous[right.len()]
}

/// A same-type entity already present in the namespace, as loaded for the
/// fuzzy pass.
#[derive(Clone, Debug)]
pub struct ExistingEntity {
	pub entity_id: Uuid,
	pub canonical: String,
	pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolveDecision {
	Create,
	Merge { entity_id: Uuid, similarity: f32 },
}

/// Resolution decision for one candidate mention against the same-type
/// entities of its namespace. Exact normalized-name matches always merge;
/// otherwise the best candidate at or above the threshold wins.
pub fn decide_resolution(
	candidate_name: &str,
	existing: &[ExistingEntity],
	threshold: f32,
) -> ResolveDecision {
	let normalized = normalize_entity_name(candidate_name);

	for entity in existing {
		if normalize_entity_name(&entity.canonical) == normalized {
			return ResolveDecision::Merge { entity_id: entity.entity_id, similarity: 1.0 };
		}
	}

	let mut best: Option<(Uuid, f32)> = None;

	for entity in existing {
		let similarity = name_similarity(&normalized, &normalize_entity_name(&entity.canonical));

		if similarity >= threshold
			&& best.map(|(_, score)| similarity > score).unwrap_or(true)
		{
			best = Some((entity.entity_id, similarity));
		}
	}

	match best {
		Some((entity_id, similarity)) => ResolveDecision::Merge { entity_id, similarity },
		None => ResolveDecision::Create,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn existing(name: &str) -> ExistingEntity {
		ExistingEntity { entity_id: Uuid::new_v4(), canonical: name.to_string(), confidence: 0.8 }
	}

	#[test]
	fn normalization_collapses_whitespace_and_case() {
		assert_eq!(normalize_entity_name("  Jane   DOE "), "jane doe");
	}

	#[test]
	fn identical_names_have_unit_ratio() {
		assert_eq!(token_sort_ratio("jane doe", "jane doe"), 1.0);
	}

	#[test]
	fn token_order_does_not_matter() {
		assert_eq!(token_sort_ratio("doe jane", "jane doe"), 1.0);
	}

	#[test]
	fn ratio_degrades_with_distance() {
		let close = token_sort_ratio("jane doe", "jane dow");
		let far = token_sort_ratio("jane doe", "acme corporation");

		assert!(close > far);
		assert!(close > 0.8);
		assert!(far < 0.5);
	}

	#[test]
	fn exact_match_merges_regardless_of_threshold() {
		let entity = existing("Jane Doe");
		let id = entity.entity_id;
		let decision = decide_resolution("jane doe", &[entity], 1.0);

		assert_eq!(decision, ResolveDecision::Merge { entity_id: id, similarity: 1.0 });
	}

	#[test]
	fn below_threshold_creates() {
		let decision = decide_resolution("Acme Corp", &[existing("Jane Doe")], 0.9);

		assert_eq!(decision, ResolveDecision::Create);
	}

	#[test]
	fn best_candidate_above_threshold_wins() {
		let near = existing("Jane Dow");
		let nearer = existing("Jane Doe");
		let nearer_id = nearer.entity_id;
		let decision = decide_resolution("Jane Does", &[near, nearer], 0.7);

		match decision {
			ResolveDecision::Merge { entity_id, .. } => assert_eq!(entity_id, nearer_id),
			other => panic!("Expected merge, got {other:?}"),
		}
	}

	#[test]
	fn initials_rendition_clears_default_threshold() {
		let similarity = name_similarity(
			&normalize_entity_name("Jane Doe"),
			&normalize_entity_name("J. Doe"),
		);

		assert!(similarity >= 0.9, "similarity {similarity}");

		let decision = decide_resolution("J. Doe", &[existing("Jane Doe")], 0.9);

		assert!(matches!(decision, ResolveDecision::Merge { .. }));
	}

	#[test]
	fn initials_require_a_full_token_anchor() {
		assert!(!initials_compatible("j. d.", "jane doe"));
		assert!(!initials_compatible("j. doe", "jane dawson"));
		assert!(initials_compatible("j. doe", "jane doe"));
	}

	#[test]
	fn merge_eagerness_is_monotonic_in_threshold() {
		// A pair that merges at a high threshold must also merge at any
		// lower threshold.
		let pairs = [("Jane Doe", "J. Doe"), ("Jane Doe", "Jane Do"), ("PostgreSQL", "Postgres")];

		for (left, right) in pairs {
			let similarity = name_similarity(
				&normalize_entity_name(left),
				&normalize_entity_name(right),
			);
			let entity = existing(right);

			for threshold in [0.95_f32, 0.8, 0.6, 0.4, 0.2] {
				let decision = decide_resolution(left, std::slice::from_ref(&entity), threshold);
				let merged = matches!(decision, ResolveDecision::Merge { .. });

				assert_eq!(
					merged,
					similarity >= threshold,
					"{left:?} vs {right:?} at threshold {threshold}"
				);
			}
		}
	}
}
