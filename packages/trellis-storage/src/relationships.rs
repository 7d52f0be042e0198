use std::collections::HashSet;

use sqlx::PgConnection;
use uuid::Uuid;

use crate::{Error, Result, models::GraphRelationshipRow};

const RELATIONSHIP_COLUMNS: &str = "\
	relationship_id,
	namespace,
	src_entity_id,
	tgt_entity_id,
	relationship_type,
	description,
	weight,
	confidence_mass,
	embedding_version,
	created_at,
	updated_at";

/// Creates or strengthens a typed edge. On conflict the stored weight moves
/// toward the new evidence via a confidence-weighted running average, and
/// the accumulated confidence mass grows, all in one atomic statement.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_edge(
	executor: &mut PgConnection,
	namespace: &str,
	src_entity_id: Uuid,
	tgt_entity_id: Uuid,
	relationship_type: &str,
	description: &str,
	weight: f32,
	confidence: f32,
	embedding_version: &str,
) -> Result<Uuid> {
	if confidence <= 0.0 {
		return Err(Error::InvalidArgument(
			"relationship confidence must be greater than zero".to_string(),
		));
	}

	let row: (Uuid,) = sqlx::query_as(
		"\
INSERT INTO graph_relationships (
	relationship_id,
	namespace,
	src_entity_id,
	tgt_entity_id,
	relationship_type,
	description,
	weight,
	confidence_mass,
	embedding_version,
	created_at,
	updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), now())
ON CONFLICT (namespace, src_entity_id, tgt_entity_id, relationship_type)
DO UPDATE
SET
	weight = (graph_relationships.weight * graph_relationships.confidence_mass
		+ EXCLUDED.weight * EXCLUDED.confidence_mass)
		/ (graph_relationships.confidence_mass + EXCLUDED.confidence_mass),
	confidence_mass = graph_relationships.confidence_mass + EXCLUDED.confidence_mass,
	description = CASE
		WHEN graph_relationships.description = '' THEN EXCLUDED.description
		ELSE graph_relationships.description
	END,
	updated_at = now()
RETURNING relationship_id",
	)
	.bind(Uuid::new_v4())
	.bind(namespace)
	.bind(src_entity_id)
	.bind(tgt_entity_id)
	.bind(relationship_type)
	.bind(description)
	.bind(weight)
	.bind(confidence)
	.bind(embedding_version)
	.fetch_one(executor)
	.await
	.map_err(Error::from_write_unit)?;

	Ok(row.0)
}

pub async fn add_source(
	executor: &mut PgConnection,
	relationship_id: Uuid,
	document_id: Uuid,
) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO graph_relationship_sources (relationship_id, document_id, created_at)
VALUES ($1, $2, now())
ON CONFLICT (relationship_id, document_id) DO NOTHING",
	)
	.bind(relationship_id)
	.bind(document_id)
	.execute(executor)
	.await
	.map_err(Error::from_write_unit)?;

	Ok(())
}

pub async fn fetch_by_ids(
	executor: &mut PgConnection,
	relationship_ids: &[Uuid],
) -> Result<Vec<GraphRelationshipRow>> {
	if relationship_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, GraphRelationshipRow>(&format!(
		"\
SELECT {RELATIONSHIP_COLUMNS}
FROM graph_relationships
WHERE relationship_id = ANY($1)",
	))
	.bind(relationship_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Edges with both endpoints inside the given entity set.
pub async fn edges_among(
	executor: &mut PgConnection,
	entity_ids: &[Uuid],
) -> Result<Vec<GraphRelationshipRow>> {
	if entity_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, GraphRelationshipRow>(&format!(
		"\
SELECT {RELATIONSHIP_COLUMNS}
FROM graph_relationships
WHERE src_entity_id = ANY($1) AND tgt_entity_id = ANY($1)",
	))
	.bind(entity_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Edges touching any entity in the set, one hop outward.
pub async fn edges_touching(
	executor: &mut PgConnection,
	entity_ids: &[Uuid],
) -> Result<Vec<GraphRelationshipRow>> {
	if entity_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, GraphRelationshipRow>(&format!(
		"\
SELECT {RELATIONSHIP_COLUMNS}
FROM graph_relationships
WHERE src_entity_id = ANY($1) OR tgt_entity_id = ANY($1)",
	))
	.bind(entity_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// K-hop neighborhood of a seed set: iterative frontier expansion, returning
/// every edge reached and the union of visited entity ids.
pub async fn neighborhood(
	executor: &mut PgConnection,
	seed_ids: &[Uuid],
	hops: u32,
) -> Result<(Vec<GraphRelationshipRow>, Vec<Uuid>)> {
	let mut visited: HashSet<Uuid> = seed_ids.iter().copied().collect();
	let mut frontier: Vec<Uuid> = seed_ids.to_vec();
	let mut edges: Vec<GraphRelationshipRow> = Vec::new();
	let mut seen_edges: HashSet<Uuid> = HashSet::new();

	for _ in 0..hops {
		if frontier.is_empty() {
			break;
		}

		let reached = edges_touching(executor, &frontier).await?;
		let mut next_frontier = Vec::new();

		for edge in reached {
			if !seen_edges.insert(edge.relationship_id) {
				continue;
			}

			for endpoint in [edge.src_entity_id, edge.tgt_entity_id] {
				if visited.insert(endpoint) {
					next_frontier.push(endpoint);
				}
			}

			edges.push(edge);
		}

		frontier = next_frontier;
	}

	let mut entity_ids: Vec<Uuid> = visited.into_iter().collect();

	entity_ids.sort_unstable();

	Ok((edges, entity_ids))
}

pub async fn list_by_namespace(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Vec<GraphRelationshipRow>> {
	let rows = sqlx::query_as::<_, GraphRelationshipRow>(&format!(
		"\
SELECT {RELATIONSHIP_COLUMNS}
FROM graph_relationships
WHERE namespace = $1",
	))
	.bind(namespace)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Removes a document from every relationship's source set and deletes
/// relationships left with no sources. Relationship rows whose endpoints
/// were deleted are already gone via FK cascade. Returns removed ids.
pub async fn remove_document_and_orphans(
	executor: &mut PgConnection,
	document_id: Uuid,
) -> Result<Vec<Uuid>> {
	sqlx::query("DELETE FROM graph_relationship_sources WHERE document_id = $1")
		.bind(document_id)
		.execute(&mut *executor)
		.await?;

	let removed: Vec<(Uuid,)> = sqlx::query_as(
		"\
DELETE FROM graph_relationships r
WHERE NOT EXISTS (
	SELECT 1 FROM graph_relationship_sources s WHERE s.relationship_id = r.relationship_id
)
RETURNING r.relationship_id",
	)
	.fetch_all(executor)
	.await?;

	Ok(removed.into_iter().map(|(relationship_id,)| relationship_id).collect())
}

pub async fn set_embedding_version(
	executor: &mut PgConnection,
	relationship_id: Uuid,
	embedding_version: &str,
) -> Result<()> {
	sqlx::query(
		"\
UPDATE graph_relationships
SET embedding_version = $2, updated_at = now()
WHERE relationship_id = $1",
	)
	.bind(relationship_id)
	.bind(embedding_version)
	.execute(executor)
	.await?;

	Ok(())
}
