use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
	pub document_id: Uuid,
	pub namespace: String,
	pub content_type: String,
	pub status: String,
	pub metadata: Value,
	pub chunk_count: i32,
	pub entity_count: i32,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentChunkRow {
	pub chunk_id: Uuid,
	pub document_id: Uuid,
	pub chunk_index: i32,
	pub token_count: i32,
	pub text: String,
	pub embedding_version: String,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GraphEntityRow {
	pub entity_id: Uuid,
	pub namespace: String,
	pub canonical: String,
	pub canonical_norm: String,
	pub entity_type: String,
	pub description: String,
	pub confidence: f32,
	pub embedding_version: String,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GraphRelationshipRow {
	pub relationship_id: Uuid,
	pub namespace: String,
	pub src_entity_id: Uuid,
	pub tgt_entity_id: Uuid,
	pub relationship_type: String,
	pub description: String,
	pub weight: f32,
	pub confidence_mass: f32,
	pub embedding_version: String,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MetadataSchemaRow {
	pub schema_id: Uuid,
	pub namespace: String,
	pub major: i32,
	pub minor: i32,
	pub patch: i32,
	pub fields: Value,
	pub status: String,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntityTypeRegistryRow {
	pub registry_id: Uuid,
	pub namespace: String,
	pub major: i32,
	pub minor: i32,
	pub patch: i32,
	pub entity_types: Value,
	pub status: String,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
	pub job_id: Uuid,
	pub namespace: String,
	pub kind: String,
	pub status: String,
	pub total: i32,
	pub processed: i32,
	pub failed: i32,
	pub failed_items: Value,
	pub payload: Value,
	pub cancel_requested: bool,
	pub attempts: i32,
	pub last_error: Option<String>,
	pub available_at: OffsetDateTime,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
	pub finished_at: Option<OffsetDateTime>,
}
