//! Retrieval orchestration. A query narrows its universe through the
//! metadata filter, fans out dense, keyword, and graph legs concurrently
//! under a total timeout budget, fuses the scores, and optionally reranks
//! the shortlist. Legs that miss the deadline are dropped and the response
//! is flagged degraded instead of blocking.

use std::{
	collections::{HashMap, HashSet},
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use uuid::Uuid;

use trellis_domain::{
	community::{self, GraphEdge},
	filter::MetadataFilter,
	fusion::{self, FusedChunk, ScoredChunk, WeightedList},
	mode::{RetrievalMode, resolve_mix},
};
use trellis_storage::{
	chunks, documents, entities,
	models::{GraphEntityRow, GraphRelationshipRow},
	qdrant::ScoredId,
	relationships,
};

use crate::{Error, Result, TrellisService};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
	pub namespace: String,
	pub text: String,
	pub mode: RetrievalMode,
	pub top_k: Option<u32>,
	#[serde(default)]
	pub metadata_filters: Option<Value>,
	#[serde(default)]
	pub rerank: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoredChunkResult {
	pub chunk_id: Uuid,
	pub document_id: Uuid,
	pub chunk_index: i32,
	pub text: String,
	pub dense_score: f32,
	pub keyword_score: f32,
	pub fused_score: f32,
	pub rerank_score: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityResult {
	pub entity_id: Uuid,
	pub canonical: String,
	pub entity_type: String,
	pub description: String,
	pub score: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipResult {
	pub relationship_id: Uuid,
	pub src_entity_id: Uuid,
	pub tgt_entity_id: Uuid,
	pub relationship_type: String,
	pub weight: f32,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LatencyBreakdown {
	pub filter_ms: u64,
	pub embed_ms: u64,
	pub dense_ms: u64,
	pub keyword_ms: u64,
	pub graph_ms: u64,
	pub fusion_ms: u64,
	pub rerank_ms: u64,
	pub total_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
	pub chunks: Vec<ScoredChunkResult>,
	pub entities: Vec<EntityResult>,
	pub relationships: Vec<RelationshipResult>,
	pub mode_used: RetrievalMode,
	pub degraded: bool,
	pub rerank_warning: bool,
	pub latency: LatencyBreakdown,
}

#[derive(Debug, Default)]
struct GraphLeg {
	chunk_scores: Vec<ScoredChunk>,
	entities: Vec<EntityResult>,
	relationships: Vec<RelationshipResult>,
}

impl TrellisService {
	pub async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
		if req.text.trim().is_empty() {
			return Err(Error::InvalidRequest {
				message: "query text must not be empty.".to_string(),
			});
		}

		let started = Instant::now();
		let budget = Duration::from_millis(self.cfg.retrieval.timeout_ms);
		let mut latency = LatencyBreakdown::default();
		let mut degraded = false;

		// Set narrowing happens before any similarity computation runs.
		let filter_started = Instant::now();
		let narrowing = self.narrow_by_metadata(&req).await?;

		latency.filter_ms = filter_started.elapsed().as_millis() as u64;

		if let Some(scope) = &narrowing
			&& scope.documents.is_empty()
		{
			latency.total_ms = started.elapsed().as_millis() as u64;

			return Ok(QueryResponse {
				chunks: Vec::new(),
				entities: Vec::new(),
				relationships: Vec::new(),
				mode_used: resolve_mix(req.mode, 0, 0),
				degraded,
				rerank_warning: false,
				latency,
			});
		}

		let allowed_docs = narrowing.as_ref().map(|scope| scope.documents.as_slice());
		let allowed_entities = narrowing.as_ref().map(|scope| scope.entities.as_slice());

		let embed_started = Instant::now();
		let query_vector = match timeout(
			remaining(budget, started),
			self.providers.embedding.embed(&self.cfg.providers.embedding, &[req.text.clone()]),
		)
		.await
		{
			Ok(Ok(vectors)) => {
				let vector = vectors.into_iter().next();

				match vector {
					Some(vector)
						if vector.len() == self.cfg.storage.qdrant.vector_dim as usize =>
						Some(vector),
					_ => {
						degraded = true;

						None
					},
				}
			},
			Ok(Err(err)) => {
				tracing::warn!(error = %err, "Query embedding failed. Falling back to keyword-only.");
				degraded = true;

				None
			},
			Err(_) => {
				degraded = true;

				None
			},
		};

		latency.embed_ms = embed_started.elapsed().as_millis() as u64;

		let candidate_k = self.cfg.retrieval.candidate_k;
		let wants_graph = !matches!(req.mode, RetrievalMode::Naive);
		let dense_started = Instant::now();
		let (dense_leg, keyword_leg, seed_leg) = tokio::join!(
			async {
				let Some(vector) = query_vector.clone() else {
					return Vec::new();
				};

				match timeout(
					remaining(budget, started),
					self.qdrant.search_chunks_dense(
						&req.namespace,
						vector,
						candidate_k,
						allowed_docs,
					),
				)
				.await
				{
					Ok(Ok(hits)) => hits,
					Ok(Err(err)) => {
						tracing::warn!(error = %err, "Dense chunk search failed.");

						Vec::new()
					},
					Err(_) => Vec::new(),
				}
			},
			async {
				match timeout(
					remaining(budget, started),
					self.qdrant.search_chunks_bm25(
						&req.namespace,
						&req.text,
						candidate_k,
						allowed_docs,
					),
				)
				.await
				{
					Ok(Ok(hits)) => hits,
					Ok(Err(err)) => {
						tracing::warn!(error = %err, "Keyword chunk search failed.");

						Vec::new()
					},
					Err(_) => Vec::new(),
				}
			},
			async {
				if !wants_graph {
					return Vec::new();
				}

				let Some(vector) = query_vector.clone() else {
					return Vec::new();
				};

				match timeout(
					remaining(budget, started),
					self.qdrant.search_entities(
						&req.namespace,
						vector,
						self.cfg.retrieval.entity_seed_k,
						allowed_entities,
					),
				)
				.await
				{
					Ok(Ok(hits)) => hits,
					Ok(Err(err)) => {
						tracing::warn!(error = %err, "Entity seed search failed.");

						Vec::new()
					},
					Err(_) => Vec::new(),
				}
			},
		);

		latency.dense_ms = dense_started.elapsed().as_millis() as u64;
		latency.keyword_ms = latency.dense_ms;

		if wants_graph && query_vector.is_some() && seed_leg.is_empty() && dense_leg.is_empty() {
			// Nothing recalled at all; not an error, an empty graph.
			tracing::debug!(namespace = %req.namespace, "Query recalled no candidates.");
		}

		let graph_started = Instant::now();
		let seed_ids: Vec<Uuid> = seed_leg.iter().map(|seed| seed.id).collect();
		let seed_edges = if req.mode == RetrievalMode::Mix && !seed_ids.is_empty() {
			let mut conn = self.db.pool.acquire().await?;

			relationships::edges_among(&mut conn, &seed_ids).await?.len()
		} else {
			0
		};
		let mode_used = resolve_mix(req.mode, seed_leg.len(), seed_edges);
		let graph_leg = match mode_used {
			RetrievalMode::Naive => GraphLeg::default(),
			RetrievalMode::Local => self.local_leg(&seed_leg, allowed_docs).await?,
			RetrievalMode::Global =>
				self.global_leg(&req.namespace, &seed_leg, narrowing.as_ref()).await?,
			RetrievalMode::Hybrid => {
				let (local, global) = tokio::join!(
					self.local_leg(&seed_leg, allowed_docs),
					self.global_leg(&req.namespace, &seed_leg, narrowing.as_ref()),
				);

				merge_hybrid_legs(
					local?,
					global?,
					self.cfg.retrieval.local_weight,
					self.cfg.retrieval.global_weight,
				)
			},
			RetrievalMode::Mix => GraphLeg::default(),
		};

		latency.graph_ms = graph_started.elapsed().as_millis() as u64;

		if started.elapsed() >= budget {
			degraded = true;
		}

		// Fusion: the mode's dense-side signal plus the keyword leg, by
		// weighted linear combination over normalized scores.
		let fusion_started = Instant::now();
		let dense_side = match mode_used {
			RetrievalMode::Naive => to_scored_chunks(&dense_leg),
			_ => {
				let mut side = graph_leg.chunk_scores.clone();

				if side.is_empty() {
					// Graph modes still cover the union of dense recall so
					// hybrid never loses what naive would have found.
					side = to_scored_chunks(&dense_leg);
				} else {
					extend_with_dense(&mut side, &dense_leg);
				}

				side
			},
		};
		let keyword_side = to_scored_chunks(&keyword_leg);
		let mut fused = fusion::fuse_dense_keyword(
			&dense_side,
			&keyword_side,
			self.cfg.retrieval.dense_weight,
			self.cfg.retrieval.keyword_weight,
		);
		let updated_at = {
			let doc_ids: Vec<Uuid> =
				fused.iter().map(|chunk| chunk.document_id).collect::<HashSet<_>>()
					.into_iter()
					.collect();
			let mut conn = self.db.pool.acquire().await?;

			documents::updated_at_by_ids(&mut conn, &doc_ids).await?.into_iter().collect()
		};

		fusion::sort_by_fused_score(&mut fused, &updated_at);
		fused.truncate(candidate_k as usize);

		latency.fusion_ms = fusion_started.elapsed().as_millis() as u64;

		let top_k = req.top_k.unwrap_or(self.cfg.retrieval.top_k).max(1) as usize;
		let rerank_enabled = req.rerank.unwrap_or(self.cfg.rerank.enabled_by_default);
		let shortlist_len = if rerank_enabled {
			(self.cfg.rerank.top_n as usize).max(top_k)
		} else {
			top_k
		};

		fused.truncate(shortlist_len);

		let chunk_rows = self.load_chunk_rows(&fused).await?;
		let rerank_started = Instant::now();
		let (ordered, rerank_scores, rerank_warning) = if rerank_enabled && !fused.is_empty() {
			let docs: Vec<String> = fused
				.iter()
				.map(|chunk| {
					chunk_rows
						.get(&chunk.chunk_id)
						.map(|row| row.text.clone())
						.unwrap_or_default()
				})
				.collect();

			match timeout(
				remaining(budget, started),
				self.providers.rerank.rerank(&self.cfg.providers.rerank, &req.text, &docs),
			)
			.await
			{
				Ok(Ok(scores)) if scores.len() == fused.len() => {
					let (ordered, scores) = apply_rerank(fused, scores);

					(ordered, Some(scores), false)
				},
				Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
					tracing::warn!("Reranker unavailable. Returning fused order.");

					(fused, None, true)
				},
			}
		} else {
			(fused, None, false)
		};

		latency.rerank_ms = rerank_started.elapsed().as_millis() as u64;

		let chunks = ordered
			.into_iter()
			.enumerate()
			.take(top_k)
			.map(|(rank, chunk)| {
				let row = chunk_rows.get(&chunk.chunk_id);

				ScoredChunkResult {
					chunk_id: chunk.chunk_id,
					document_id: chunk.document_id,
					chunk_index: row.map(|row| row.chunk_index).unwrap_or(0),
					text: row.map(|row| row.text.clone()).unwrap_or_default(),
					dense_score: chunk.dense_score,
					keyword_score: chunk.keyword_score,
					fused_score: chunk.fused_score,
					rerank_score: rerank_scores
						.as_ref()
						.and_then(|scores| scores.get(rank).copied()),
				}
			})
			.collect::<Vec<_>>();
		let mut entities = graph_leg.entities;
		let mut relationships = graph_leg.relationships;

		entities.truncate(self.cfg.retrieval.entity_seed_k as usize);
		relationships.truncate((top_k * 2).max(1));

		latency.total_ms = started.elapsed().as_millis() as u64;

		Ok(QueryResponse {
			chunks,
			entities,
			relationships,
			mode_used,
			degraded,
			rerank_warning,
			latency,
		})
	}

	async fn narrow_by_metadata(&self, req: &QueryRequest) -> Result<Option<NarrowedScope>> {
		let Some(raw) = req.metadata_filters.as_ref() else {
			return Ok(None);
		};
		let filter = MetadataFilter::parse(raw)
			.map_err(|err| Error::InvalidRequest { message: err.to_string() })?;
		let mut conn = self.db.pool.acquire().await?;
		let candidates = documents::list_for_filtering(&mut conn, &req.namespace).await?;
		let documents: Vec<Uuid> = candidates
			.iter()
			.filter(|candidate| match candidate.metadata.as_object() {
				Some(map) => filter.matches(map),
				None => false,
			})
			.map(|candidate| candidate.document_id)
			.collect();
		let entities = entities::ids_with_sources_in(&mut conn, &req.namespace, &documents).await?;

		Ok(Some(NarrowedScope { documents, entities }))
	}

	async fn local_leg(
		&self,
		seeds: &[ScoredId],
		allowed_docs: Option<&[Uuid]>,
	) -> Result<GraphLeg> {
		if seeds.is_empty() {
			return Ok(GraphLeg::default());
		}

		let seed_ids: Vec<Uuid> = seeds.iter().map(|seed| seed.id).collect();
		let seed_scores: HashMap<Uuid, f32> =
			seeds.iter().map(|seed| (seed.id, seed.score)).collect();
		let mut conn = self.db.pool.acquire().await?;
		let (edges, _reached) = relationships::neighborhood(&mut conn, &seed_ids, 1).await?;
		let mut entity_scores: HashMap<Uuid, f32> = seed_scores.clone();

		// Neighbors inherit a discounted score through their strongest
		// incident seed edge.
		for edge in &edges {
			for (endpoint, other) in [
				(edge.src_entity_id, edge.tgt_entity_id),
				(edge.tgt_entity_id, edge.src_entity_id),
			] {
				if let Some(seed_score) = seed_scores.get(&other) {
					let inherited = seed_score * edge.weight;
					let entry = entity_scores.entry(endpoint).or_insert(0.0);

					*entry = entry.max(inherited);
				}
			}
		}

		let entity_ids: Vec<Uuid> = entity_scores.keys().copied().collect();
		let rows = entities::fetch_by_ids(&mut conn, &entity_ids).await?;
		let sources = entities::sources_for_entities(&mut conn, &entity_ids).await?;
		let mut doc_scores: HashMap<Uuid, f32> = HashMap::new();

		for (entity_id, document_id) in sources {
			if let Some(allowed) = allowed_docs
				&& !allowed.contains(&document_id)
			{
				continue;
			}

			let score = entity_scores.get(&entity_id).copied().unwrap_or(0.0);
			let entry = doc_scores.entry(document_id).or_insert(0.0);

			*entry = entry.max(score);
		}

		let doc_ids: Vec<Uuid> = doc_scores.keys().copied().collect();
		let chunk_rows = chunks::list_by_documents(&mut conn, &doc_ids).await?;
		let chunk_scores = chunk_rows
			.iter()
			.map(|chunk| ScoredChunk {
				chunk_id: chunk.chunk_id,
				document_id: chunk.document_id,
				score: doc_scores.get(&chunk.document_id).copied().unwrap_or(0.0),
			})
			.collect();

		Ok(GraphLeg {
			chunk_scores,
			entities: entity_results(&rows, &entity_scores),
			relationships: relationship_results(&edges),
		})
	}

	async fn global_leg(
		&self,
		namespace: &str,
		seeds: &[ScoredId],
		narrowing: Option<&NarrowedScope>,
	) -> Result<GraphLeg> {
		let mut conn = self.db.pool.acquire().await?;
		let entity_rows = match narrowing {
			Some(scope) => entities::fetch_by_ids(&mut conn, &scope.entities).await?,
			None => entities::list_by_namespace(&mut conn, namespace).await?,
		};

		if entity_rows.is_empty() {
			return Ok(GraphLeg::default());
		}

		let node_ids: Vec<Uuid> = entity_rows.iter().map(|row| row.entity_id).collect();
		let edge_rows = match narrowing {
			Some(_) => relationships::edges_among(&mut conn, &node_ids).await?,
			None => relationships::list_by_namespace(&mut conn, namespace).await?,
		};
		let graph_edges: Vec<GraphEdge> = edge_rows
			.iter()
			.map(|edge| GraphEdge {
				src: edge.src_entity_id,
				tgt: edge.tgt_entity_id,
				weight: edge.weight,
			})
			.collect();
		let communities = community::detect_communities(
			&node_ids,
			&graph_edges,
			self.cfg.retrieval.community.max_iterations,
		);
		let min_size = self.cfg.retrieval.community.min_size as usize;
		let communities: Vec<_> = communities
			.into_iter()
			.filter(|community| community.members.len() >= min_size.max(1))
			.collect();
		let seed_scores: HashMap<Uuid, f32> =
			seeds.iter().map(|seed| (seed.id, seed.score)).collect();
		let ranked = community::rank_communities(&communities, &seed_scores);
		let top = self.cfg.retrieval.community.top_communities as usize;
		let mut entity_scores: HashMap<Uuid, f32> = HashMap::new();
		let mut member_set: HashSet<Uuid> = HashSet::new();

		for (index, score) in ranked.iter().take(top.max(1)) {
			for member in &communities[*index].members {
				member_set.insert(*member);
				entity_scores.insert(*member, *score);
			}
		}

		let relationships: Vec<RelationshipResult> = {
			let mut within: Vec<&GraphRelationshipRow> = edge_rows
				.iter()
				.filter(|edge| {
					member_set.contains(&edge.src_entity_id)
						&& member_set.contains(&edge.tgt_entity_id)
				})
				.collect();

			within.sort_by(|left, right| {
				fusion::cmp_score_desc(left.weight, right.weight)
					.then_with(|| left.relationship_id.cmp(&right.relationship_id))
			});

			within
				.into_iter()
				.map(|edge| RelationshipResult {
					relationship_id: edge.relationship_id,
					src_entity_id: edge.src_entity_id,
					tgt_entity_id: edge.tgt_entity_id,
					relationship_type: edge.relationship_type.clone(),
					weight: edge.weight,
				})
				.collect()
		};

		let member_ids: Vec<Uuid> = member_set.iter().copied().collect();
		let sources = entities::sources_for_entities(&mut conn, &member_ids).await?;
		let mut doc_scores: HashMap<Uuid, f32> = HashMap::new();

		for (entity_id, document_id) in sources {
			if let Some(scope) = narrowing
				&& !scope.documents.contains(&document_id)
			{
				continue;
			}

			let score = entity_scores.get(&entity_id).copied().unwrap_or(0.0);
			let entry = doc_scores.entry(document_id).or_insert(0.0);

			*entry = entry.max(score);
		}

		let doc_ids: Vec<Uuid> = doc_scores.keys().copied().collect();
		let chunk_rows = chunks::list_by_documents(&mut conn, &doc_ids).await?;
		let chunk_scores = chunk_rows
			.iter()
			.map(|chunk| ScoredChunk {
				chunk_id: chunk.chunk_id,
				document_id: chunk.document_id,
				score: doc_scores.get(&chunk.document_id).copied().unwrap_or(0.0),
			})
			.collect();
		let member_rows: Vec<GraphEntityRow> =
			entity_rows.into_iter().filter(|row| member_set.contains(&row.entity_id)).collect();

		Ok(GraphLeg {
			chunk_scores,
			entities: entity_results(&member_rows, &entity_scores),
			relationships,
		})
	}

	async fn load_chunk_rows(
		&self,
		fused: &[FusedChunk],
	) -> Result<HashMap<Uuid, trellis_storage::models::DocumentChunkRow>> {
		let ids: Vec<Uuid> = fused.iter().map(|chunk| chunk.chunk_id).collect();
		let mut conn = self.db.pool.acquire().await?;
		let rows = chunks::fetch_by_ids(&mut conn, &ids).await?;

		Ok(rows.into_iter().map(|row| (row.chunk_id, row)).collect())
	}
}

#[derive(Debug)]
struct NarrowedScope {
	documents: Vec<Uuid>,
	entities: Vec<Uuid>,
}

fn remaining(budget: Duration, started: Instant) -> Duration {
	budget.saturating_sub(started.elapsed())
}

fn to_scored_chunks(hits: &[ScoredId]) -> Vec<ScoredChunk> {
	hits.iter()
		.filter_map(|hit| {
			let document_id = hit.document_id?;

			Some(ScoredChunk { chunk_id: hit.id, document_id, score: hit.score })
		})
		.collect()
}

/// Ensures graph-mode candidate sets still cover plain dense recall.
fn extend_with_dense(side: &mut Vec<ScoredChunk>, dense: &[ScoredId]) {
	let seen: HashSet<Uuid> = side.iter().map(|chunk| chunk.chunk_id).collect();

	for hit in to_scored_chunks(dense) {
		if !seen.contains(&hit.chunk_id) {
			side.push(hit);
		}
	}
}

fn merge_hybrid_legs(
	local: GraphLeg,
	global: GraphLeg,
	local_weight: f32,
	global_weight: f32,
) -> GraphLeg {
	let merged_scores = fusion::merge_weighted_ids(&[
		WeightedList {
			weight: local_weight,
			items: local.chunk_scores.iter().map(|chunk| (chunk.chunk_id, chunk.score)).collect(),
		},
		WeightedList {
			weight: global_weight,
			items: global.chunk_scores.iter().map(|chunk| (chunk.chunk_id, chunk.score)).collect(),
		},
	]);
	let documents: HashMap<Uuid, Uuid> = local
		.chunk_scores
		.iter()
		.chain(global.chunk_scores.iter())
		.map(|chunk| (chunk.chunk_id, chunk.document_id))
		.collect();
	let chunk_scores = merged_scores
		.into_iter()
		.filter_map(|(chunk_id, score)| {
			documents.get(&chunk_id).map(|document_id| ScoredChunk {
				chunk_id,
				document_id: *document_id,
				score,
			})
		})
		.collect();

	let mut entities = local.entities;
	let mut seen_entities: HashSet<Uuid> =
		entities.iter().map(|entity| entity.entity_id).collect();

	for entity in global.entities {
		if seen_entities.insert(entity.entity_id) {
			entities.push(entity);
		}
	}

	entities.sort_by(|left, right| {
		fusion::cmp_score_desc(left.score, right.score)
			.then_with(|| left.entity_id.cmp(&right.entity_id))
	});

	let mut relationships = local.relationships;
	let mut seen_relationships: HashSet<Uuid> =
		relationships.iter().map(|rel| rel.relationship_id).collect();

	for relationship in global.relationships {
		if seen_relationships.insert(relationship.relationship_id) {
			relationships.push(relationship);
		}
	}

	GraphLeg { chunk_scores, entities, relationships }
}

fn entity_results(rows: &[GraphEntityRow], scores: &HashMap<Uuid, f32>) -> Vec<EntityResult> {
	let mut out: Vec<EntityResult> = rows
		.iter()
		.map(|row| EntityResult {
			entity_id: row.entity_id,
			canonical: row.canonical.clone(),
			entity_type: row.entity_type.clone(),
			description: row.description.clone(),
			score: scores.get(&row.entity_id).copied().unwrap_or(0.0),
		})
		.collect();

	out.sort_by(|left, right| {
		fusion::cmp_score_desc(left.score, right.score)
			.then_with(|| left.entity_id.cmp(&right.entity_id))
	});

	out
}

fn relationship_results(rows: &[GraphRelationshipRow]) -> Vec<RelationshipResult> {
	let mut out: Vec<RelationshipResult> = rows
		.iter()
		.map(|edge| RelationshipResult {
			relationship_id: edge.relationship_id,
			src_entity_id: edge.src_entity_id,
			tgt_entity_id: edge.tgt_entity_id,
			relationship_type: edge.relationship_type.clone(),
			weight: edge.weight,
		})
		.collect();

	out.sort_by(|left, right| {
		fusion::cmp_score_desc(left.weight, right.weight)
			.then_with(|| left.relationship_id.cmp(&right.relationship_id))
	});

	out
}

/// Stable descending sort by rerank score: candidates the cross-encoder
/// scores equally keep their fused order, so the fused top-1 only loses its
/// place to a strictly better candidate.
fn apply_rerank(fused: Vec<FusedChunk>, scores: Vec<f32>) -> (Vec<FusedChunk>, Vec<f32>) {
	let mut indexed: Vec<(FusedChunk, f32)> = fused.into_iter().zip(scores).collect();

	indexed.sort_by(|left, right| fusion::cmp_score_desc(left.1, right.1));

	let scores = indexed.iter().map(|(_, score)| *score).collect();
	let ordered = indexed.into_iter().map(|(chunk, _)| chunk).collect();

	(ordered, scores)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fused(chunk_id: Uuid, fused_score: f32) -> FusedChunk {
		FusedChunk {
			chunk_id,
			document_id: Uuid::new_v4(),
			dense_score: fused_score,
			keyword_score: 0.0,
			fused_score,
		}
	}

	#[test]
	fn rerank_keeps_fused_top_on_score_ties() {
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();
		let third = Uuid::new_v4();
		let candidates = vec![fused(first, 0.9), fused(second, 0.8), fused(third, 0.7)];
		let (ordered, _) = apply_rerank(candidates, vec![0.5, 0.5, 0.5]);

		assert_eq!(ordered[0].chunk_id, first);
		assert_eq!(ordered[1].chunk_id, second);
		assert_eq!(ordered[2].chunk_id, third);
	}

	#[test]
	fn rerank_demotes_top_only_for_strictly_better_scores() {
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();
		let candidates = vec![fused(first, 0.9), fused(second, 0.8)];
		let (ordered, scores) = apply_rerank(candidates, vec![0.4, 0.9]);

		assert_eq!(ordered[0].chunk_id, second);
		assert_eq!(scores, vec![0.9, 0.4]);
	}

	#[test]
	fn graph_side_retains_dense_recall() {
		let doc = Uuid::new_v4();
		let graph_chunk = Uuid::new_v4();
		let dense_chunk = Uuid::new_v4();
		let mut side =
			vec![ScoredChunk { chunk_id: graph_chunk, document_id: doc, score: 0.8 }];
		let dense = vec![
			ScoredId { id: graph_chunk, document_id: Some(doc), score: 0.9 },
			ScoredId { id: dense_chunk, document_id: Some(doc), score: 0.7 },
		];

		extend_with_dense(&mut side, &dense);

		let ids: HashSet<Uuid> = side.iter().map(|chunk| chunk.chunk_id).collect();

		assert_eq!(side.len(), 2);
		assert!(ids.contains(&dense_chunk));
	}

	#[test]
	fn hybrid_merge_covers_both_legs() {
		let doc = Uuid::new_v4();
		let local_chunk = Uuid::new_v4();
		let global_chunk = Uuid::new_v4();
		let local = GraphLeg {
			chunk_scores: vec![ScoredChunk {
				chunk_id: local_chunk,
				document_id: doc,
				score: 0.9,
			}],
			entities: Vec::new(),
			relationships: Vec::new(),
		};
		let global = GraphLeg {
			chunk_scores: vec![ScoredChunk {
				chunk_id: global_chunk,
				document_id: doc,
				score: 0.6,
			}],
			entities: Vec::new(),
			relationships: Vec::new(),
		};
		let merged = merge_hybrid_legs(local, global, 0.6, 0.4);
		let ids: HashSet<Uuid> =
			merged.chunk_scores.iter().map(|chunk| chunk.chunk_id).collect();

		assert!(ids.contains(&local_chunk));
		assert!(ids.contains(&global_chunk));
	}
}
