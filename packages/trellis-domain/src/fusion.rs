//! Score fusion for hybrid retrieval. Dense and keyword scores are min-max
//! normalized within their own result lists, combined by a weighted linear
//! sum, and ordered with a recency tie-break on the owning document.

use std::{
	cmp::Ordering,
	collections::{HashMap, HashSet},
};

use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ScoredChunk {
	pub chunk_id: Uuid,
	pub document_id: Uuid,
	pub score: f32,
}

#[derive(Clone, Debug)]
pub struct FusedChunk {
	pub chunk_id: Uuid,
	pub document_id: Uuid,
	pub dense_score: f32,
	pub keyword_score: f32,
	pub fused_score: f32,
}

pub fn cmp_score_desc(a: f32, b: f32) -> Ordering {
	match (a.is_nan(), b.is_nan()) {
		(true, true) => Ordering::Equal,
		(true, false) => Ordering::Greater,
		(false, true) => Ordering::Less,
		(false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
	}
}

/// Min-max normalization into [0, 1]. A constant list maps to all-ones so a
/// single-source result set is not zeroed out.
pub fn min_max_normalized(scores: &[f32]) -> Vec<f32> {
	let mut min = f32::INFINITY;
	let mut max = f32::NEG_INFINITY;

	for score in scores {
		min = min.min(*score);
		max = max.max(*score);
	}

	if scores.is_empty() {
		return Vec::new();
	}
	if max - min <= f32::EPSILON {
		return vec![1.0; scores.len()];
	}

	scores.iter().map(|score| (score - min) / (max - min)).collect()
}

/// Weighted linear fusion of a dense and a keyword result list, deduplicated
/// by chunk. A chunk absent from one list contributes zero from that side.
pub fn fuse_dense_keyword(
	dense: &[ScoredChunk],
	keyword: &[ScoredChunk],
	dense_weight: f32,
	keyword_weight: f32,
) -> Vec<FusedChunk> {
	let dense_normalized = min_max_normalized(&dense.iter().map(|c| c.score).collect::<Vec<_>>());
	let keyword_normalized =
		min_max_normalized(&keyword.iter().map(|c| c.score).collect::<Vec<_>>());
	let mut by_chunk: HashMap<Uuid, FusedChunk> = HashMap::new();

	for (candidate, normalized) in dense.iter().zip(dense_normalized) {
		by_chunk
			.entry(candidate.chunk_id)
			.and_modify(|existing| existing.dense_score = existing.dense_score.max(normalized))
			.or_insert(FusedChunk {
				chunk_id: candidate.chunk_id,
				document_id: candidate.document_id,
				dense_score: normalized,
				keyword_score: 0.0,
				fused_score: 0.0,
			});
	}

	for (candidate, normalized) in keyword.iter().zip(keyword_normalized) {
		by_chunk
			.entry(candidate.chunk_id)
			.and_modify(|existing| existing.keyword_score = existing.keyword_score.max(normalized))
			.or_insert(FusedChunk {
				chunk_id: candidate.chunk_id,
				document_id: candidate.document_id,
				dense_score: 0.0,
				keyword_score: normalized,
				fused_score: 0.0,
			});
	}

	let mut fused: Vec<FusedChunk> = by_chunk.into_values().collect();

	for candidate in &mut fused {
		candidate.fused_score =
			dense_weight * candidate.dense_score + keyword_weight * candidate.keyword_score;
	}

	fused
}

/// Orders fused candidates by score descending. Equal scores prefer the
/// chunk whose document was updated more recently; chunk id breaks the
/// remaining ties deterministically.
pub fn sort_by_fused_score(
	candidates: &mut [FusedChunk],
	document_updated_at: &HashMap<Uuid, OffsetDateTime>,
) {
	candidates.sort_by(|left, right| {
		cmp_score_desc(left.fused_score, right.fused_score)
			.then_with(|| {
				let lhs = document_updated_at.get(&left.document_id);
				let rhs = document_updated_at.get(&right.document_id);

				rhs.cmp(&lhs)
			})
			.then_with(|| left.chunk_id.cmp(&right.chunk_id))
	});
}

#[derive(Clone, Debug)]
pub struct WeightedList {
	pub weight: f32,
	pub items: Vec<(Uuid, f32)>,
}

/// Merges several weighted, independently scored id lists into one ranking,
/// deduplicating ids by summing their weighted normalized contributions.
/// The union of the input lists is preserved: every id present in any input
/// appears in the output.
pub fn merge_weighted_ids(lists: &[WeightedList]) -> Vec<(Uuid, f32)> {
	let mut combined: HashMap<Uuid, f32> = HashMap::new();

	for list in lists {
		let normalized =
			min_max_normalized(&list.items.iter().map(|(_, score)| *score).collect::<Vec<_>>());
		let mut seen = HashSet::new();

		for ((id, _), score) in list.items.iter().zip(normalized) {
			if !seen.insert(*id) {
				continue;
			}

			*combined.entry(*id).or_insert(0.0) += list.weight * score;
		}
	}

	let mut merged: Vec<(Uuid, f32)> = combined.into_iter().collect();

	merged.sort_by(|left, right| {
		cmp_score_desc(left.1, right.1).then_with(|| left.0.cmp(&right.0))
	});

	merged
}
