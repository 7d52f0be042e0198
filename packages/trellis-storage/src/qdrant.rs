//! Qdrant vector index over three collections: chunk, entity, and
//! relationship embedding spaces. Chunks carry a named dense vector plus a
//! server-side BM25 sparse vector for keyword recall; Postgres remains the
//! source of truth and the index is rebuildable from it.

use std::collections::HashMap;

use qdrant_client::{
	Qdrant,
	client::Payload,
	qdrant::{
		Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Document, Filter,
		Modifier, PointStruct, Query, QueryPointsBuilder, ScoredPoint, SparseVectorParamsBuilder,
		SparseVectorsConfigBuilder, UpsertPointsBuilder, Value, Vector, VectorParamsBuilder,
		VectorsConfigBuilder, point_id::PointIdOptions,
	},
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::Result;

pub const DENSE_VECTOR_NAME: &str = "dense";
pub const BM25_VECTOR_NAME: &str = "bm25";
pub const BM25_MODEL: &str = "qdrant/bm25";

pub struct QdrantStore {
	pub client: Qdrant,
	pub collection_prefix: String,
	pub vector_dim: u32,
}

#[derive(Clone, Debug)]
pub struct ChunkPoint {
	pub chunk_id: Uuid,
	pub chunk_index: i32,
	pub text: String,
}

#[derive(Clone, Debug)]
pub struct ScoredId {
	pub id: Uuid,
	pub document_id: Option<Uuid>,
	pub score: f32,
}

impl QdrantStore {
	pub fn new(cfg: &trellis_config::Qdrant) -> Result<Self> {
		let client = Qdrant::from_url(&cfg.url).build()?;

		Ok(Self {
			client,
			collection_prefix: cfg.collection_prefix.clone(),
			vector_dim: cfg.vector_dim,
		})
	}

	pub fn chunks_collection(&self) -> String {
		format!("{}_chunks", self.collection_prefix)
	}

	pub fn entities_collection(&self) -> String {
		format!("{}_entities", self.collection_prefix)
	}

	pub fn relationships_collection(&self) -> String {
		format!("{}_relationships", self.collection_prefix)
	}

	pub async fn ensure_collections(&self) -> Result<()> {
		self.ensure_collection(&self.chunks_collection(), true).await?;
		self.ensure_collection(&self.entities_collection(), false).await?;
		self.ensure_collection(&self.relationships_collection(), false).await?;

		Ok(())
	}

	async fn ensure_collection(&self, collection: &str, with_bm25: bool) -> Result<()> {
		if self.client.collection_exists(collection).await? {
			return Ok(());
		}

		let mut vectors_config = VectorsConfigBuilder::default();

		vectors_config.add_named_vector_params(
			DENSE_VECTOR_NAME,
			VectorParamsBuilder::new(self.vector_dim.into(), Distance::Cosine),
		);

		let mut builder =
			CreateCollectionBuilder::new(collection.to_string()).vectors_config(vectors_config);

		if with_bm25 {
			let mut sparse_vectors_config = SparseVectorsConfigBuilder::default();

			sparse_vectors_config.add_named_vector_params(
				BM25_VECTOR_NAME,
				SparseVectorParamsBuilder::default().modifier(Modifier::Idf as i32),
			);

			builder = builder.sparse_vectors_config(sparse_vectors_config);
		}

		self.client.create_collection(builder).await?;

		Ok(())
	}

	pub async fn upsert_chunk_points(
		&self,
		namespace: &str,
		document_id: Uuid,
		updated_at: OffsetDateTime,
		records: &[ChunkPoint],
		vectors: &[Vec<f32>],
	) -> Result<()> {
		let mut points = Vec::with_capacity(records.len());

		for (record, vec) in records.iter().zip(vectors.iter()) {
			let mut payload = Payload::new();

			payload.insert("namespace", namespace.to_string());
			payload.insert("document_id", document_id.to_string());
			payload.insert("chunk_id", record.chunk_id.to_string());
			payload.insert("chunk_index", record.chunk_index as i64);
			payload.insert("updated_at", format_timestamp(updated_at));

			let mut vector_map = HashMap::new();

			vector_map.insert(DENSE_VECTOR_NAME.to_string(), Vector::from(vec.to_vec()));
			vector_map.insert(
				BM25_VECTOR_NAME.to_string(),
				Vector::from(Document::new(record.text.clone(), BM25_MODEL)),
			);
			points.push(PointStruct::new(record.chunk_id.to_string(), vector_map, payload));
		}

		if points.is_empty() {
			return Ok(());
		}

		let upsert = UpsertPointsBuilder::new(self.chunks_collection(), points).wait(true);

		self.client.upsert_points(upsert).await?;

		Ok(())
	}

	pub async fn upsert_entity_point(
		&self,
		namespace: &str,
		entity_id: Uuid,
		entity_type: &str,
		vector: Vec<f32>,
	) -> Result<()> {
		let mut payload = Payload::new();

		payload.insert("namespace", namespace.to_string());
		payload.insert("entity_id", entity_id.to_string());
		payload.insert("entity_type", entity_type.to_string());

		let mut vector_map = HashMap::new();

		vector_map.insert(DENSE_VECTOR_NAME.to_string(), Vector::from(vector));

		let point = PointStruct::new(entity_id.to_string(), vector_map, payload);
		let upsert = UpsertPointsBuilder::new(self.entities_collection(), vec![point]).wait(true);

		self.client.upsert_points(upsert).await?;

		Ok(())
	}

	pub async fn upsert_relationship_point(
		&self,
		namespace: &str,
		relationship_id: Uuid,
		relationship_type: &str,
		vector: Vec<f32>,
	) -> Result<()> {
		let mut payload = Payload::new();

		payload.insert("namespace", namespace.to_string());
		payload.insert("relationship_id", relationship_id.to_string());
		payload.insert("relationship_type", relationship_type.to_string());

		let mut vector_map = HashMap::new();

		vector_map.insert(DENSE_VECTOR_NAME.to_string(), Vector::from(vector));

		let point = PointStruct::new(relationship_id.to_string(), vector_map, payload);
		let upsert =
			UpsertPointsBuilder::new(self.relationships_collection(), vec![point]).wait(true);

		self.client.upsert_points(upsert).await?;

		Ok(())
	}

	pub async fn delete_chunk_points_by_document(&self, document_id: Uuid) -> Result<()> {
		let filter = Filter::must([Condition::matches("document_id", document_id.to_string())]);
		let delete = DeletePointsBuilder::new(self.chunks_collection()).points(filter).wait(true);

		match self.client.delete_points(delete).await {
			Ok(_) => Ok(()),
			Err(err) if is_not_found_error(&err) => {
				tracing::info!(document_id = %document_id, "Qdrant chunk points missing during delete.");

				Ok(())
			},
			Err(err) => Err(err.into()),
		}
	}

	pub async fn delete_points_by_ids(&self, collection: String, ids: &[Uuid]) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}

		let points: Vec<qdrant_client::qdrant::PointId> =
			ids.iter().map(|id| id.to_string().into()).collect();
		let delete = DeletePointsBuilder::new(collection).points(points).wait(true);

		match self.client.delete_points(delete).await {
			Ok(_) => Ok(()),
			Err(err) if is_not_found_error(&err) => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	/// Dense k-NN over chunk embeddings, optionally restricted to the
	/// documents that survived metadata filtering.
	pub async fn search_chunks_dense(
		&self,
		namespace: &str,
		vector: Vec<f32>,
		limit: u32,
		allowed_documents: Option<&[Uuid]>,
	) -> Result<Vec<ScoredId>> {
		let search = QueryPointsBuilder::new(self.chunks_collection())
			.query(Query::new_nearest(vector))
			.using(DENSE_VECTOR_NAME)
			.filter(chunk_filter(namespace, allowed_documents))
			.limit(limit as u64)
			.with_payload(true);
		let response = self.client.query(search).await?;

		Ok(scored_chunk_ids(response.result))
	}

	/// Sparse BM25 keyword search over chunk text.
	pub async fn search_chunks_bm25(
		&self,
		namespace: &str,
		text: &str,
		limit: u32,
		allowed_documents: Option<&[Uuid]>,
	) -> Result<Vec<ScoredId>> {
		let search = QueryPointsBuilder::new(self.chunks_collection())
			.query(Query::new_nearest(Document::new(text.to_string(), BM25_MODEL)))
			.using(BM25_VECTOR_NAME)
			.filter(chunk_filter(namespace, allowed_documents))
			.limit(limit as u64)
			.with_payload(true);
		let response = self.client.query(search).await?;

		Ok(scored_chunk_ids(response.result))
	}

	pub async fn search_entities(
		&self,
		namespace: &str,
		vector: Vec<f32>,
		limit: u32,
		allowed_entities: Option<&[Uuid]>,
	) -> Result<Vec<ScoredId>> {
		let mut conditions = vec![Condition::matches("namespace", namespace.to_string())];

		if let Some(allowed) = allowed_entities {
			conditions.push(Condition::matches(
				"entity_id",
				allowed.iter().map(Uuid::to_string).collect::<Vec<_>>(),
			));
		}

		let search = QueryPointsBuilder::new(self.entities_collection())
			.query(Query::new_nearest(vector))
			.using(DENSE_VECTOR_NAME)
			.filter(Filter::must(conditions))
			.limit(limit as u64)
			.with_payload(true);
		let response = self.client.query(search).await?;
		let out = response
			.result
			.into_iter()
			.filter_map(|point| {
				let id = point_uuid(&point, "entity_id")?;

				Some(ScoredId { id, document_id: None, score: point.score })
			})
			.collect();

		Ok(out)
	}
}

fn chunk_filter(namespace: &str, allowed_documents: Option<&[Uuid]>) -> Filter {
	let mut conditions = vec![Condition::matches("namespace", namespace.to_string())];

	if let Some(allowed) = allowed_documents {
		conditions.push(Condition::matches(
			"document_id",
			allowed.iter().map(Uuid::to_string).collect::<Vec<_>>(),
		));
	}

	Filter::must(conditions)
}

fn scored_chunk_ids(points: Vec<ScoredPoint>) -> Vec<ScoredId> {
	points
		.into_iter()
		.filter_map(|point| {
			let id = point_uuid(&point, "chunk_id")?;
			let document_id = payload_uuid(&point.payload, "document_id");

			Some(ScoredId { id, document_id, score: point.score })
		})
		.collect()
}

fn point_uuid(point: &ScoredPoint, payload_key: &str) -> Option<Uuid> {
	point
		.id
		.as_ref()
		.and_then(|point_id| match &point_id.point_id_options {
			Some(PointIdOptions::Uuid(id)) => Uuid::parse_str(id).ok(),
			_ => None,
		})
		.or_else(|| payload_uuid(&point.payload, payload_key))
}

pub fn payload_uuid(payload: &HashMap<String, Value>, key: &str) -> Option<Uuid> {
	payload_string(payload, key).and_then(|text| Uuid::parse_str(&text).ok())
}

pub fn payload_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
	use qdrant_client::qdrant::value::Kind;

	let value = payload.get(key)?;

	match &value.kind {
		Some(Kind::StringValue(text)) => Some(text.to_string()),
		_ => None,
	}
}

fn format_timestamp(ts: OffsetDateTime) -> String {
	ts.format(&Rfc3339).unwrap_or_default()
}

fn is_not_found_error(err: &qdrant_client::QdrantError) -> bool {
	let message = err.to_string().to_lowercase();
	let point_not_found =
		(message.contains("not found") || message.contains("404")) && message.contains("point");
	let no_point_found = message.contains("no point") && message.contains("found");

	point_not_found || no_point_found
}
