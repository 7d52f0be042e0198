use sqlx::PgConnection;
use uuid::Uuid;

use crate::{Result, models::DocumentChunkRow};

const CHUNK_COLUMNS: &str = "\
	chunk_id,
	document_id,
	chunk_index,
	token_count,
	text,
	embedding_version,
	created_at";

#[allow(clippy::too_many_arguments)]
pub async fn insert_chunk(
	executor: &mut PgConnection,
	chunk_id: Uuid,
	document_id: Uuid,
	chunk_index: i32,
	token_count: i32,
	text: &str,
	embedding_version: &str,
) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO document_chunks (
	chunk_id,
	document_id,
	chunk_index,
	token_count,
	text,
	embedding_version,
	created_at
)
VALUES ($1, $2, $3, $4, $5, $6, now())
ON CONFLICT (document_id, chunk_index) DO UPDATE
SET
	token_count = EXCLUDED.token_count,
	text = EXCLUDED.text,
	embedding_version = EXCLUDED.embedding_version",
	)
	.bind(chunk_id)
	.bind(document_id)
	.bind(chunk_index)
	.bind(token_count)
	.bind(text)
	.bind(embedding_version)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn delete_by_document(executor: &mut PgConnection, document_id: Uuid) -> Result<u64> {
	let result = sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
		.bind(document_id)
		.execute(executor)
		.await?;

	Ok(result.rows_affected())
}

pub async fn list_ids_by_document(
	executor: &mut PgConnection,
	document_id: Uuid,
) -> Result<Vec<Uuid>> {
	let rows: Vec<(Uuid,)> =
		sqlx::query_as("SELECT chunk_id FROM document_chunks WHERE document_id = $1")
			.bind(document_id)
			.fetch_all(executor)
			.await?;

	Ok(rows.into_iter().map(|(chunk_id,)| chunk_id).collect())
}

pub async fn fetch_by_ids(
	executor: &mut PgConnection,
	chunk_ids: &[Uuid],
) -> Result<Vec<DocumentChunkRow>> {
	if chunk_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, DocumentChunkRow>(&format!(
		"\
SELECT {CHUNK_COLUMNS}
FROM document_chunks
WHERE chunk_id = ANY($1)",
	))
	.bind(chunk_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn list_by_documents(
	executor: &mut PgConnection,
	document_ids: &[Uuid],
) -> Result<Vec<DocumentChunkRow>> {
	if document_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, DocumentChunkRow>(&format!(
		"\
SELECT {CHUNK_COLUMNS}
FROM document_chunks
WHERE document_id = ANY($1)
ORDER BY document_id, chunk_index",
	))
	.bind(document_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}
