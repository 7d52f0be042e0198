use sqlx::PgConnection;
use uuid::Uuid;

use trellis_domain::similarity::normalize_entity_name;

use crate::{Error, Result, models::GraphEntityRow};

const ENTITY_COLUMNS: &str = "\
	entity_id,
	namespace,
	canonical,
	canonical_norm,
	entity_type,
	description,
	confidence,
	embedding_version,
	created_at,
	updated_at";

/// Serializes resolution for one canonical-name key. Must run inside the
/// write transaction; the lock releases on commit or rollback.
pub async fn lock_resolution_key(
	executor: &mut PgConnection,
	namespace: &str,
	canonical_norm: &str,
) -> Result<()> {
	let key = format!("{namespace}:{canonical_norm}");

	sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
		.bind(key)
		.execute(executor)
		.await?;

	Ok(())
}

pub async fn find_by_norm(
	executor: &mut PgConnection,
	namespace: &str,
	canonical_norm: &str,
) -> Result<Option<GraphEntityRow>> {
	let row = sqlx::query_as::<_, GraphEntityRow>(&format!(
		"\
SELECT {ENTITY_COLUMNS}
FROM graph_entities
WHERE namespace = $1 AND canonical_norm = $2",
	))
	.bind(namespace)
	.bind(canonical_norm)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn list_by_type(
	executor: &mut PgConnection,
	namespace: &str,
	entity_type: &str,
) -> Result<Vec<GraphEntityRow>> {
	let rows = sqlx::query_as::<_, GraphEntityRow>(&format!(
		"\
SELECT {ENTITY_COLUMNS}
FROM graph_entities
WHERE namespace = $1 AND entity_type = $2",
	))
	.bind(namespace)
	.bind(entity_type)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_entity(
	executor: &mut PgConnection,
	namespace: &str,
	canonical: &str,
	entity_type: &str,
	description: &str,
	confidence: f32,
	embedding_version: &str,
) -> Result<Uuid> {
	let canonical = canonical.trim();

	if canonical.is_empty() {
		return Err(Error::InvalidArgument("entity canonical name must not be empty".to_string()));
	}

	let canonical_norm = normalize_entity_name(canonical);
	let row: (Uuid,) = sqlx::query_as(
		"\
INSERT INTO graph_entities (
	entity_id,
	namespace,
	canonical,
	canonical_norm,
	entity_type,
	description,
	confidence,
	embedding_version,
	created_at,
	updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now())
ON CONFLICT (namespace, canonical_norm)
DO UPDATE
SET
	description = CASE
		WHEN EXCLUDED.confidence > graph_entities.confidence THEN EXCLUDED.description
		ELSE graph_entities.description
	END,
	confidence = GREATEST(graph_entities.confidence, EXCLUDED.confidence),
	updated_at = now()
RETURNING entity_id",
	)
	.bind(Uuid::new_v4())
	.bind(namespace)
	.bind(canonical)
	.bind(&canonical_norm)
	.bind(entity_type)
	.bind(description)
	.bind(confidence)
	.bind(embedding_version)
	.fetch_one(executor)
	.await?;

	Ok(row.0)
}

/// Applies merge semantics to an existing entity: the higher-confidence
/// description wins and confidence is kept at its maximum. Returns true when
/// the new mention's confidence strictly exceeded the stored one, which is
/// the re-embed signal.
pub async fn merge_mention(
	executor: &mut PgConnection,
	entity_id: Uuid,
	description: &str,
	confidence: f32,
) -> Result<bool> {
	let previous: Option<(f32,)> =
		sqlx::query_as("SELECT confidence FROM graph_entities WHERE entity_id = $1 FOR UPDATE")
			.bind(entity_id)
			.fetch_optional(&mut *executor)
			.await?;
	let Some((previous,)) = previous else {
		return Err(Error::NotFound(format!("entity not found; entity_id={entity_id}")));
	};
	let exceeds = confidence > previous;

	sqlx::query(
		"\
UPDATE graph_entities
SET
	description = CASE WHEN $3 > confidence THEN $2 ELSE description END,
	confidence = GREATEST(confidence, $3),
	updated_at = now()
WHERE entity_id = $1",
	)
	.bind(entity_id)
	.bind(description)
	.bind(confidence)
	.execute(executor)
	.await?;

	Ok(exceeds)
}

pub async fn add_source(
	executor: &mut PgConnection,
	entity_id: Uuid,
	document_id: Uuid,
) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO graph_entity_sources (entity_id, document_id, created_at)
VALUES ($1, $2, now())
ON CONFLICT (entity_id, document_id) DO NOTHING",
	)
	.bind(entity_id)
	.bind(document_id)
	.execute(executor)
	.await
	.map_err(Error::from_write_unit)?;

	Ok(())
}

pub async fn list_sources(executor: &mut PgConnection, entity_id: Uuid) -> Result<Vec<Uuid>> {
	let rows: Vec<(Uuid,)> = sqlx::query_as(
		"\
SELECT document_id
FROM graph_entity_sources
WHERE entity_id = $1
ORDER BY created_at ASC, document_id ASC",
	)
	.bind(entity_id)
	.fetch_all(executor)
	.await?;

	Ok(rows.into_iter().map(|(document_id,)| document_id).collect())
}

pub async fn sources_for_entities(
	executor: &mut PgConnection,
	entity_ids: &[Uuid],
) -> Result<Vec<(Uuid, Uuid)>> {
	if entity_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
		"\
SELECT entity_id, document_id
FROM graph_entity_sources
WHERE entity_id = ANY($1)",
	)
	.bind(entity_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn fetch_by_ids(
	executor: &mut PgConnection,
	entity_ids: &[Uuid],
) -> Result<Vec<GraphEntityRow>> {
	if entity_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, GraphEntityRow>(&format!(
		"\
SELECT {ENTITY_COLUMNS}
FROM graph_entities
WHERE entity_id = ANY($1)",
	))
	.bind(entity_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn list_by_namespace(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Vec<GraphEntityRow>> {
	let rows = sqlx::query_as::<_, GraphEntityRow>(&format!(
		"\
SELECT {ENTITY_COLUMNS}
FROM graph_entities
WHERE namespace = $1",
	))
	.bind(namespace)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Entities whose id set intersects documents allowed by a metadata filter.
pub async fn ids_with_sources_in(
	executor: &mut PgConnection,
	namespace: &str,
	document_ids: &[Uuid],
) -> Result<Vec<Uuid>> {
	if document_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows: Vec<(Uuid,)> = sqlx::query_as(
		"\
SELECT DISTINCT e.entity_id
FROM graph_entities e
JOIN graph_entity_sources s ON s.entity_id = e.entity_id
WHERE e.namespace = $1 AND s.document_id = ANY($2)",
	)
	.bind(namespace)
	.bind(document_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows.into_iter().map(|(entity_id,)| entity_id).collect())
}

/// Removes a document from every entity's source set and deletes entities
/// left with no sources. Returns the ids of the removed entities.
pub async fn remove_document_and_orphans(
	executor: &mut PgConnection,
	document_id: Uuid,
) -> Result<Vec<Uuid>> {
	sqlx::query("DELETE FROM graph_entity_sources WHERE document_id = $1")
		.bind(document_id)
		.execute(&mut *executor)
		.await?;

	let removed: Vec<(Uuid,)> = sqlx::query_as(
		"\
DELETE FROM graph_entities e
WHERE NOT EXISTS (
	SELECT 1 FROM graph_entity_sources s WHERE s.entity_id = e.entity_id
)
RETURNING e.entity_id",
	)
	.fetch_all(executor)
	.await?;

	Ok(removed.into_iter().map(|(entity_id,)| entity_id).collect())
}

pub async fn set_embedding_version(
	executor: &mut PgConnection,
	entity_id: Uuid,
	embedding_version: &str,
) -> Result<()> {
	sqlx::query(
		"\
UPDATE graph_entities
SET embedding_version = $2, updated_at = now()
WHERE entity_id = $1",
	)
	.bind(entity_id)
	.bind(embedding_version)
	.execute(executor)
	.await?;

	Ok(())
}
