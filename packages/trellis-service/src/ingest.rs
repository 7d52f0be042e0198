//! Extraction pipeline: normalized content blocks in, chunks and graph
//! writes out. Blocks are extracted in configurable batches with bounded
//! concurrency; a failing block is recorded and its siblings continue. The
//! document ends `indexed` when at least one block succeeded, `failed`
//! otherwise.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trellis_chunking::ChunkingConfig;
use trellis_domain::schema::EntityTypeRegistry;
use trellis_providers::{extractor, extractor::ExtractionResult, retry};
use trellis_storage::{chunks, documents, entities, qdrant::ChunkPoint, schemas};

use crate::{
	Error, Result, TrellisService, embedding_version,
	resolve::{self, CandidateEntity},
	relate::{self, CandidateRelationship},
	validate_vector_dim,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
	Text,
	Table,
	Equation,
	Image,
}
impl FromStr for BlockKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"text" => Ok(Self::Text),
			"table" => Ok(Self::Table),
			"equation" => Ok(Self::Equation),
			"image" => Ok(Self::Image),
			other => Err(format!("unknown content block kind '{other}'")),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentBlock {
	pub kind: BlockKind,
	/// Text rendition of the block. For images this is the caption, when
	/// one was produced by the parsing collaborator.
	pub payload: String,
	pub sequence_position: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestRequest {
	pub document_id: Uuid,
	pub namespace: String,
	pub content_type: String,
	#[serde(default)]
	pub metadata: Map<String, Value>,
	pub blocks: Vec<ContentBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockFailure {
	pub block_index: usize,
	pub error: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IngestReport {
	pub document_id: Uuid,
	pub entities_added: u32,
	pub relationships_added: u32,
	pub chunks_created: u32,
	pub blocks_succeeded: u32,
	pub failed_blocks: Vec<BlockFailure>,
}

#[derive(Debug, Default)]
pub(crate) struct BlockOutcome {
	entities_added: u32,
	relationships_added: u32,
	entity_embeds: Vec<(Uuid, String, String)>,
	relationship_embeds: Vec<(Uuid, String, String)>,
}

impl TrellisService {
	/// Synchronous ingestion path, also the body of extraction jobs.
	pub async fn ingest_document(&self, req: IngestRequest) -> Result<IngestReport> {
		self.ingest_document_inner(req, None).await
	}

	/// Non-blocking ingestion: persists the request as an extraction job and
	/// returns its id immediately.
	pub async fn enqueue_ingest(&self, req: IngestRequest) -> Result<Uuid> {
		validate_request(&req)?;

		let payload = serde_json::to_value(&req).map_err(|err| Error::InvalidRequest {
			message: format!("ingest request is not serializable: {err}"),
		})?;

		self.jobs.create(&req.namespace, crate::JobKind::Extraction, payload).await
	}

	pub(crate) async fn ingest_document_inner(
		&self,
		req: IngestRequest,
		cancel: Option<&CancellationToken>,
	) -> Result<IngestReport> {
		validate_request(&req)?;

		let mut conn = self.db.pool.acquire().await?;
		let validated_metadata = {
			match schemas::active_schema(&mut conn, &req.namespace).await? {
				Some(row) => {
					let schema = schemas::decode_schema(&row)?;

					schema.validate_metadata(&req.metadata).map_err(|err| {
						Error::InvalidRequest { message: err.to_string() }
					})?
				},
				None => req.metadata.clone(),
			}
		};
		let registry = match schemas::active_registry(&mut conn, &req.namespace).await? {
			Some(row) => schemas::decode_registry(&row)?,
			None =>
				return Err(Error::InvalidRequest {
					message: format!(
						"no active entity-type registry for namespace '{}'",
						req.namespace
					),
				}),
		};

		documents::insert_document(
			&mut conn,
			req.document_id,
			&req.namespace,
			&req.content_type,
			&Value::Object(validated_metadata),
		)
		.await?;
		documents::set_status(&mut conn, req.document_id, documents::STATUS_PROCESSING).await?;

		drop(conn);

		let mut report = IngestReport { document_id: req.document_id, ..Default::default() };

		match self.index_chunks(&req).await {
			Ok(count) => report.chunks_created = count,
			Err(err) => {
				let mut conn = self.db.pool.acquire().await?;

				documents::set_status(&mut conn, req.document_id, documents::STATUS_FAILED)
					.await?;

				return Err(err);
			},
		}

		let mut ordered: Vec<(usize, &ContentBlock)> = req
			.blocks
			.iter()
			.enumerate()
			.filter(|(_, block)| !block.payload.trim().is_empty())
			.collect();

		ordered.sort_by_key(|(_, block)| block.sequence_position);

		let mut succeeded = 0_usize;
		let mut touched_entities = 0_u32;
		let batch_size = self.cfg.extraction.batch_size as usize;
		let semaphore =
			Arc::new(Semaphore::new(self.cfg.extraction.max_concurrent_blocks as usize));

		for batch in ordered.chunks(batch_size.max(1)) {
			if cancel.map(CancellationToken::is_cancelled).unwrap_or(false) {
				tracing::info!(document_id = %req.document_id, "Ingest cancelled between batches.");

				break;
			}

			let extractions = self.extract_batch(batch, &registry, &semaphore).await;

			for ((block_index, _), extraction) in batch.iter().zip(extractions) {
				match extraction {
					Ok(extraction) => {
						match self
							.persist_block(&req.namespace, req.document_id, &registry, extraction)
							.await
						{
							Ok(outcome) => {
								succeeded += 1;
								report.entities_added += outcome.entities_added;
								report.relationships_added += outcome.relationships_added;
								touched_entities += outcome.entities_added;

								self.index_block_embeddings(&req.namespace, &outcome).await;
							},
							Err(err) => {
								tracing::warn!(
									document_id = %req.document_id,
									block_index,
									error = %err,
									"Block graph write failed.",
								);
								report.failed_blocks.push(BlockFailure {
									block_index: *block_index,
									error: err.to_string(),
								});
							},
						}
					},
					Err(err) => {
						tracing::warn!(
							document_id = %req.document_id,
							block_index,
							error = %err,
							"Block extraction failed.",
						);
						report.failed_blocks.push(BlockFailure {
							block_index: *block_index,
							error: err.to_string(),
						});
					},
				}
			}
		}

		report.blocks_succeeded = succeeded as u32;

		let status = if succeeded > 0 { documents::STATUS_INDEXED } else { documents::STATUS_FAILED };
		let mut conn = self.db.pool.acquire().await?;

		documents::set_status(&mut conn, req.document_id, status).await?;
		documents::set_counts(
			&mut conn,
			req.document_id,
			report.chunks_created as i32,
			touched_entities as i32,
		)
		.await?;

		Ok(report)
	}

	async fn extract_batch(
		&self,
		batch: &[(usize, &ContentBlock)],
		registry: &EntityTypeRegistry,
		semaphore: &Arc<Semaphore>,
	) -> Vec<Result<ExtractionResult>> {
		let type_names = registry.type_names();
		let tasks = batch.iter().map(|(_, block)| {
			let semaphore = semaphore.clone();
			let messages = extractor::build_messages(&type_names, &block.payload);

			async move {
				let _permit = semaphore.acquire().await.map_err(|_| Error::Provider {
					message: "extraction concurrency limiter closed".to_string(),
				})?;
				let extraction = &self.cfg.extraction;
				let result = retry::with_retries(
					extraction.max_retries,
					extraction.retry_base_ms,
					extraction.retry_max_ms,
					|| self.providers.extractor.extract(&self.cfg.providers.llm_extractor, &messages),
				)
				.await?;

				Ok(result)
			}
		});

		futures::future::join_all(tasks).await
	}

	pub(crate) async fn persist_block(
		&self,
		namespace: &str,
		document_id: Uuid,
		registry: &EntityTypeRegistry,
		extraction: ExtractionResult,
	) -> Result<BlockOutcome> {
		let version = embedding_version(&self.cfg);
		let threshold = self.cfg.extraction.fuzzy_merge_threshold;
		let min_confidence = self.cfg.extraction.min_confidence;
		let mut outcome = BlockOutcome::default();
		let mut resolved: Vec<(String, Uuid, String)> = Vec::new();
		let mut tx = self.db.pool.begin().await?;

		for candidate in &extraction.entities {
			if candidate.confidence < min_confidence {
				continue;
			}
			if !registry.contains(&candidate.entity_type) {
				tracing::warn!(
					entity = %candidate.entity_name,
					entity_type = %candidate.entity_type,
					"Dropping entity of unregistered type.",
				);

				continue;
			}

			let entity = CandidateEntity {
				name: candidate.entity_name.clone(),
				entity_type: candidate.entity_type.clone(),
				description: candidate.description.clone(),
				confidence: candidate.confidence,
			};
			let resolution = resolve::resolve_entity_tx(
				&mut tx,
				namespace,
				document_id,
				&entity,
				threshold,
				&version,
			)
			.await?;

			if resolution.created {
				outcome.entities_added += 1;
			}
			if resolution.reembed {
				outcome.entity_embeds.push((
					resolution.entity_id,
					candidate.entity_type.clone(),
					format!("{}: {}", candidate.entity_name, candidate.description),
				));
			}

			resolved.push((
				trellis_domain::similarity::normalize_entity_name(&candidate.entity_name),
				resolution.entity_id,
				candidate.entity_name.clone(),
			));
		}

		for candidate in &extraction.relationships {
			if candidate.confidence < min_confidence {
				continue;
			}

			let src = lookup_resolved(&resolved, &candidate.source_entity_name);
			let tgt = lookup_resolved(&resolved, &candidate.target_entity_name);
			let (Some((src_id, src_name)), Some((tgt_id, tgt_name))) = (src, tgt) else {
				tracing::warn!(
					source = %candidate.source_entity_name,
					target = %candidate.target_entity_name,
					"Skipping relationship with unresolved endpoint.",
				);

				continue;
			};

			if src_id == tgt_id {
				continue;
			}

			let relationship = CandidateRelationship {
				src_entity_id: src_id,
				tgt_entity_id: tgt_id,
				relationship_type: candidate.relationship_type.clone(),
				description: candidate.description.clone(),
				confidence: candidate.confidence,
			};
			let built = relate::build_relationship_tx(
				&mut tx,
				namespace,
				document_id,
				&relationship,
				&version,
			)
			.await?;

			if built.created {
				outcome.relationships_added += 1;
				outcome.relationship_embeds.push((
					built.relationship_id,
					candidate.relationship_type.clone(),
					format!(
						"{} {} {}: {}",
						src_name, candidate.relationship_type, tgt_name, candidate.description
					),
				));
			}
		}

		tx.commit().await?;

		Ok(outcome)
	}

	/// Indexes the embeddings a block produced. The graph is already
	/// committed; the vector index is rebuildable, so indexing trouble is
	/// logged rather than failing the block.
	pub(crate) async fn index_block_embeddings(&self, namespace: &str, outcome: &BlockOutcome) {
		for (entity_id, entity_type, text) in &outcome.entity_embeds {
			if let Err(err) = self.embed_and_upsert_entity(namespace, *entity_id, entity_type, text).await
			{
				tracing::warn!(entity_id = %entity_id, error = %err, "Entity embedding index failed.");
			}
		}

		for (relationship_id, relationship_type, text) in &outcome.relationship_embeds {
			if let Err(err) = self
				.embed_and_upsert_relationship(namespace, *relationship_id, relationship_type, text)
				.await
			{
				tracing::warn!(
					relationship_id = %relationship_id,
					error = %err,
					"Relationship embedding index failed.",
				);
			}
		}
	}

	async fn embed_and_upsert_entity(
		&self,
		namespace: &str,
		entity_id: Uuid,
		entity_type: &str,
		text: &str,
	) -> Result<()> {
		let vector = self.embed_one(text).await?;

		self.qdrant.upsert_entity_point(namespace, entity_id, entity_type, vector).await?;

		let mut conn = self.db.pool.acquire().await?;

		entities::set_embedding_version(&mut conn, entity_id, &embedding_version(&self.cfg)).await?;

		Ok(())
	}

	async fn embed_and_upsert_relationship(
		&self,
		namespace: &str,
		relationship_id: Uuid,
		relationship_type: &str,
		text: &str,
	) -> Result<()> {
		let vector = self.embed_one(text).await?;

		self.qdrant
			.upsert_relationship_point(namespace, relationship_id, relationship_type, vector)
			.await?;

		let mut conn = self.db.pool.acquire().await?;

		trellis_storage::relationships::set_embedding_version(
			&mut conn,
			relationship_id,
			&embedding_version(&self.cfg),
		)
		.await?;

		Ok(())
	}

	pub(crate) async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
		let extraction = &self.cfg.extraction;
		let texts = vec![text.to_string()];
		let vectors = retry::with_retries(
			extraction.max_retries,
			extraction.retry_base_ms,
			extraction.retry_max_ms,
			|| self.providers.embedding.embed(&self.cfg.providers.embedding, &texts),
		)
		.await?;
		let vector = vectors.into_iter().next().ok_or_else(|| Error::Provider {
			message: "Embedding provider returned no vectors.".to_string(),
		})?;

		validate_vector_dim(&vector, self.cfg.storage.qdrant.vector_dim)?;

		Ok(vector)
	}

	async fn index_chunks(&self, req: &IngestRequest) -> Result<u32> {
		let mut ordered: Vec<&ContentBlock> = req
			.blocks
			.iter()
			.filter(|block| !block.payload.trim().is_empty())
			.collect();

		ordered.sort_by_key(|block| block.sequence_position);

		let text = ordered.iter().map(|block| block.payload.as_str()).collect::<Vec<_>>().join("\n\n");

		if text.trim().is_empty() {
			return Err(Error::InvalidRequest {
				message: "content blocks contain no extractable text".to_string(),
			});
		}

		let chunking = ChunkingConfig {
			max_tokens: self.cfg.chunking.max_tokens,
			overlap_tokens: self.cfg.chunking.overlap_tokens,
		};
		let split = trellis_chunking::split_text(&text, &chunking, &self.tokenizer);

		if split.is_empty() {
			return Err(Error::InvalidRequest {
				message: "chunking produced no chunks".to_string(),
			});
		}

		let chunk_texts: Vec<String> = split.iter().map(|chunk| chunk.text.clone()).collect();
		let extraction = &self.cfg.extraction;
		let vectors = retry::with_retries(
			extraction.max_retries,
			extraction.retry_base_ms,
			extraction.retry_max_ms,
			|| self.providers.embedding.embed(&self.cfg.providers.embedding, &chunk_texts),
		)
		.await?;

		if vectors.len() != split.len() {
			return Err(Error::Provider {
				message: format!(
					"Embedding provider returned {} vectors for {} chunks.",
					vectors.len(),
					split.len()
				),
			});
		}

		for vector in &vectors {
			validate_vector_dim(vector, self.cfg.storage.qdrant.vector_dim)?;
		}

		let version = embedding_version(&self.cfg);
		let mut records = Vec::with_capacity(split.len());
		let mut tx = self.db.pool.begin().await?;

		chunks::delete_by_document(&mut tx, req.document_id).await?;

		for chunk in &split {
			let chunk_id = chunk_id_for(req.document_id, chunk.chunk_index);

			chunks::insert_chunk(
				&mut tx,
				chunk_id,
				req.document_id,
				chunk.chunk_index,
				chunk.token_count as i32,
				&chunk.text,
				&version,
			)
			.await?;
			records.push(ChunkPoint {
				chunk_id,
				chunk_index: chunk.chunk_index,
				text: chunk.text.clone(),
			});
		}

		tx.commit().await?;

		let now = time::OffsetDateTime::now_utc();

		self.qdrant.delete_chunk_points_by_document(req.document_id).await?;
		self.qdrant
			.upsert_chunk_points(&req.namespace, req.document_id, now, &records, &vectors)
			.await?;

		Ok(records.len() as u32)
	}
}

fn lookup_resolved<'a>(
	resolved: &'a [(String, Uuid, String)],
	name: &str,
) -> Option<(Uuid, &'a str)> {
	let norm = trellis_domain::similarity::normalize_entity_name(name);

	resolved
		.iter()
		.find(|(resolved_norm, _, _)| *resolved_norm == norm)
		.map(|(_, entity_id, canonical)| (*entity_id, canonical.as_str()))
}

fn chunk_id_for(document_id: Uuid, chunk_index: i32) -> Uuid {
	let name = format!("{document_id}:{chunk_index}");

	Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn validate_request(req: &IngestRequest) -> Result<()> {
	if req.namespace.trim().is_empty() {
		return Err(Error::InvalidRequest { message: "namespace must not be empty.".to_string() });
	}
	if req.blocks.is_empty() {
		return Err(Error::InvalidRequest {
			message: "at least one content block is required.".to_string(),
		});
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chunk_ids_are_stable_per_document_and_index() {
		let document_id = Uuid::new_v4();

		assert_eq!(chunk_id_for(document_id, 0), chunk_id_for(document_id, 0));
		assert_ne!(chunk_id_for(document_id, 0), chunk_id_for(document_id, 1));
	}

	#[test]
	fn block_kinds_parse_case_insensitively() {
		assert_eq!("TEXT".parse::<BlockKind>().expect("kind"), BlockKind::Text);
		assert_eq!("table".parse::<BlockKind>().expect("kind"), BlockKind::Table);
		assert!("video".parse::<BlockKind>().is_err());
	}

	#[test]
	fn requests_require_namespace_and_blocks() {
		let empty_namespace = IngestRequest {
			document_id: Uuid::new_v4(),
			namespace: "  ".to_string(),
			content_type: "text/plain".to_string(),
			metadata: Map::new(),
			blocks: vec![ContentBlock {
				kind: BlockKind::Text,
				payload: "hello".to_string(),
				sequence_position: 0,
			}],
		};

		assert!(validate_request(&empty_namespace).is_err());

		let no_blocks = IngestRequest {
			document_id: Uuid::new_v4(),
			namespace: "ns".to_string(),
			content_type: "text/plain".to_string(),
			metadata: Map::new(),
			blocks: Vec::new(),
		};

		assert!(validate_request(&no_blocks).is_err());
	}
}
