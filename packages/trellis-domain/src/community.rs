//! Community detection for global retrieval. Weighted label propagation,
//! made deterministic: nodes sweep in ascending id order, label ties resolve
//! to the smallest label, and iteration is capped.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct GraphEdge {
	pub src: Uuid,
	pub tgt: Uuid,
	pub weight: f32,
}

#[derive(Clone, Debug)]
pub struct Community {
	pub label: Uuid,
	pub members: Vec<Uuid>,
}

pub fn detect_communities(
	nodes: &[Uuid],
	edges: &[GraphEdge],
	max_iterations: u32,
) -> Vec<Community> {
	let mut ordered: Vec<Uuid> = nodes.to_vec();

	ordered.sort_unstable();
	ordered.dedup();

	let mut labels: BTreeMap<Uuid, Uuid> =
		ordered.iter().map(|node| (*node, *node)).collect();
	let mut adjacency: HashMap<Uuid, Vec<(Uuid, f32)>> = HashMap::new();

	for edge in edges {
		if !labels.contains_key(&edge.src) || !labels.contains_key(&edge.tgt) {
			continue;
		}

		adjacency.entry(edge.src).or_default().push((edge.tgt, edge.weight));
		adjacency.entry(edge.tgt).or_default().push((edge.src, edge.weight));
	}

	for _ in 0..max_iterations {
		let mut changed = false;

		for node in &ordered {
			let Some(neighbors) = adjacency.get(node) else { continue };

			if neighbors.is_empty() {
				continue;
			}

			let mut label_weights: BTreeMap<Uuid, f32> = BTreeMap::new();

			for (neighbor, weight) in neighbors {
				let label = labels[neighbor];

				*label_weights.entry(label).or_insert(0.0) += weight.max(0.0);
			}

			let current = labels[node];
			let mut best_label = current;
			let mut best_weight = f32::NEG_INFINITY;

			// BTreeMap iteration is label-ascending, so equal weights keep
			// the smallest label; the current label only survives a tie when
			// it is that smallest label.
			for (label, weight) in &label_weights {
				if *weight > best_weight {
					best_weight = *weight;
					best_label = *label;
				}
			}

			if best_label != current {
				labels.insert(*node, best_label);

				changed = true;
			}
		}

		if !changed {
			break;
		}
	}

	let mut grouped: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();

	for (node, label) in labels {
		grouped.entry(label).or_default().push(node);
	}

	let mut communities: Vec<Community> = grouped
		.into_iter()
		.map(|(label, mut members)| {
			members.sort_unstable();

			Community { label, members }
		})
		.collect();

	communities.sort_by(|left, right| {
		right.members.len().cmp(&left.members.len()).then_with(|| left.label.cmp(&right.label))
	});

	communities
}

/// Ranks communities by the mean query similarity of their scored members.
/// Members without a score contribute zero. Returns indices into the input
/// ordered by relevance descending.
pub fn rank_communities(
	communities: &[Community],
	entity_scores: &HashMap<Uuid, f32>,
) -> Vec<(usize, f32)> {
	let mut ranked: Vec<(usize, f32)> = communities
		.iter()
		.enumerate()
		.map(|(index, community)| {
			let total: f32 = community
				.members
				.iter()
				.map(|member| entity_scores.get(member).copied().unwrap_or(0.0))
				.sum();
			let mean = if community.members.is_empty() {
				0.0
			} else {
				total / community.members.len() as f32
			};

			(index, mean)
		})
		.collect();

	ranked.sort_by(|left, right| {
		crate::fusion::cmp_score_desc(left.1, right.1).then_with(|| left.0.cmp(&right.0))
	});

	ranked
}

#[cfg(test)]
mod tests {
	use super::*;

	fn edge(src: Uuid, tgt: Uuid, weight: f32) -> GraphEdge {
		GraphEdge { src, tgt, weight }
	}

	fn sorted_ids(count: usize) -> Vec<Uuid> {
		let mut ids: Vec<Uuid> = (0..count).map(|_| Uuid::new_v4()).collect();

		ids.sort_unstable();

		ids
	}

	#[test]
	fn two_cliques_form_two_communities() {
		let ids = sorted_ids(6);
		let edges = vec![
			edge(ids[0], ids[1], 1.0),
			edge(ids[1], ids[2], 1.0),
			edge(ids[0], ids[2], 1.0),
			edge(ids[3], ids[4], 1.0),
			edge(ids[4], ids[5], 1.0),
			edge(ids[3], ids[5], 1.0),
		];
		let communities = detect_communities(&ids, &edges, 16);
		let sizes: Vec<usize> = communities.iter().map(|c| c.members.len()).collect();

		assert_eq!(sizes, vec![3, 3]);

		let first: Vec<Uuid> = ids[..3].to_vec();
		let second: Vec<Uuid> = ids[3..].to_vec();

		assert!(communities.iter().any(|c| c.members == first));
		assert!(communities.iter().any(|c| c.members == second));
	}

	#[test]
	fn isolated_nodes_stay_singleton() {
		let ids = sorted_ids(3);
		let edges = vec![edge(ids[0], ids[1], 1.0)];
		let communities = detect_communities(&ids, &edges, 16);

		assert!(communities.iter().any(|c| c.members == vec![ids[2]]));
	}

	#[test]
	fn detection_is_deterministic() {
		let ids = sorted_ids(8);
		let edges = vec![
			edge(ids[0], ids[1], 1.0),
			edge(ids[1], ids[2], 0.5),
			edge(ids[2], ids[3], 1.0),
			edge(ids[4], ids[5], 1.0),
			edge(ids[5], ids[6], 1.0),
			edge(ids[6], ids[7], 0.25),
		];
		let first = detect_communities(&ids, &edges, 16);
		let second = detect_communities(&ids, &edges, 16);
		let first_members: Vec<Vec<Uuid>> = first.iter().map(|c| c.members.clone()).collect();
		let second_members: Vec<Vec<Uuid>> = second.iter().map(|c| c.members.clone()).collect();

		assert_eq!(first_members, second_members);
	}

	#[test]
	fn ranking_uses_mean_member_score() {
		let ids = sorted_ids(4);
		let communities = vec![
			Community { label: ids[0], members: vec![ids[0], ids[1]] },
			Community { label: ids[2], members: vec![ids[2], ids[3]] },
		];
		let scores = HashMap::from([(ids[0], 0.2), (ids[1], 0.2), (ids[2], 0.9), (ids[3], 0.5)]);
		let ranked = rank_communities(&communities, &scores);

		assert_eq!(ranked[0].0, 1);
		assert!((ranked[0].1 - 0.7).abs() < 1e-6);
	}
}
