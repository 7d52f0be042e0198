use serde_json::Value;
use sqlx::PgConnection;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result, models::DocumentRow};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_INDEXED: &str = "indexed";
pub const STATUS_FAILED: &str = "failed";

const DOCUMENT_COLUMNS: &str = "\
	document_id,
	namespace,
	content_type,
	status,
	metadata,
	chunk_count,
	entity_count,
	created_at,
	updated_at";

pub async fn insert_document(
	executor: &mut PgConnection,
	document_id: Uuid,
	namespace: &str,
	content_type: &str,
	metadata: &Value,
) -> Result<DocumentRow> {
	if namespace.trim().is_empty() {
		return Err(Error::InvalidArgument("document namespace must not be empty".to_string()));
	}

	let row = sqlx::query_as::<_, DocumentRow>(&format!(
		"\
INSERT INTO documents (
	document_id,
	namespace,
	content_type,
	status,
	metadata,
	created_at,
	updated_at
)
VALUES ($1, $2, $3, '{STATUS_PENDING}', $4, now(), now())
ON CONFLICT (document_id) DO UPDATE
SET
	content_type = EXCLUDED.content_type,
	metadata = EXCLUDED.metadata,
	status = '{STATUS_PENDING}',
	updated_at = now()
RETURNING {DOCUMENT_COLUMNS}",
	))
	.bind(document_id)
	.bind(namespace)
	.bind(content_type)
	.bind(metadata)
	.fetch_one(executor)
	.await?;

	Ok(row)
}

pub async fn get_document(
	executor: &mut PgConnection,
	document_id: Uuid,
) -> Result<Option<DocumentRow>> {
	let row = sqlx::query_as::<_, DocumentRow>(&format!(
		"\
SELECT {DOCUMENT_COLUMNS}
FROM documents
WHERE document_id = $1",
	))
	.bind(document_id)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn set_status(
	executor: &mut PgConnection,
	document_id: Uuid,
	status: &str,
) -> Result<()> {
	let result = sqlx::query(
		"\
UPDATE documents
SET status = $2, updated_at = now()
WHERE document_id = $1",
	)
	.bind(document_id)
	.bind(status)
	.execute(executor)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!("document not found; document_id={document_id}")));
	}

	Ok(())
}

pub async fn set_counts(
	executor: &mut PgConnection,
	document_id: Uuid,
	chunk_count: i32,
	entity_count: i32,
) -> Result<()> {
	sqlx::query(
		"\
UPDATE documents
SET chunk_count = $2, entity_count = $3, updated_at = now()
WHERE document_id = $1",
	)
	.bind(document_id)
	.bind(chunk_count)
	.bind(entity_count)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn update_metadata(
	executor: &mut PgConnection,
	document_id: Uuid,
	metadata: &Value,
) -> Result<()> {
	let result = sqlx::query(
		"\
UPDATE documents
SET metadata = $2, updated_at = now()
WHERE document_id = $1",
	)
	.bind(document_id)
	.bind(metadata)
	.execute(executor)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!("document not found; document_id={document_id}")));
	}

	Ok(())
}

/// All documents of a namespace with their metadata and recency, the
/// working set for metadata-filter narrowing.
pub async fn list_for_filtering(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Vec<FilterCandidate>> {
	let rows = sqlx::query_as::<_, FilterCandidate>(
		"\
SELECT document_id, metadata, updated_at
FROM documents
WHERE namespace = $1",
	)
	.bind(namespace)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn list_by_namespace(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Vec<DocumentRow>> {
	let rows = sqlx::query_as::<_, DocumentRow>(&format!(
		"\
SELECT {DOCUMENT_COLUMNS}
FROM documents
WHERE namespace = $1
ORDER BY created_at ASC",
	))
	.bind(namespace)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn updated_at_by_ids(
	executor: &mut PgConnection,
	document_ids: &[Uuid],
) -> Result<Vec<(Uuid, OffsetDateTime)>> {
	if document_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
		"\
SELECT document_id, updated_at
FROM documents
WHERE document_id = ANY($1)",
	)
	.bind(document_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn delete_document_row(
	executor: &mut PgConnection,
	document_id: Uuid,
) -> Result<bool> {
	let result = sqlx::query("DELETE FROM documents WHERE document_id = $1")
		.bind(document_id)
		.execute(executor)
		.await?;

	Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FilterCandidate {
	pub document_id: Uuid,
	pub metadata: Value,
	pub updated_at: OffsetDateTime,
}
