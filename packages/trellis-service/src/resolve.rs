//! Entity resolution. Exact normalized-name lookup first, then a fuzzy pass
//! against same-type entities; merges union provenance, keep the
//! higher-confidence description, and re-embed only when the new mention's
//! confidence strictly exceeds the stored one. Resolution for one
//! canonical-name key is serialized with a transaction-scoped advisory lock
//! so concurrent batches cannot double-create a name.

use sqlx::{PgConnection, Postgres, Transaction};
use uuid::Uuid;

use trellis_domain::similarity::{
	ExistingEntity, ResolveDecision, decide_resolution, normalize_entity_name,
};
use trellis_storage::entities;

use crate::Result;

#[derive(Clone, Debug)]
pub struct CandidateEntity {
	pub name: String,
	pub entity_type: String,
	pub description: String,
	pub confidence: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolvedEntity {
	pub entity_id: Uuid,
	pub created: bool,
	/// True when the stored embedding should be refreshed: a new entity, or
	/// a merge whose mention confidence strictly exceeded the stored one.
	pub reembed: bool,
}

pub(crate) async fn resolve_entity_tx(
	tx: &mut Transaction<'_, Postgres>,
	namespace: &str,
	document_id: Uuid,
	candidate: &CandidateEntity,
	fuzzy_threshold: f32,
	embedding_version: &str,
) -> Result<ResolvedEntity> {
	let conn: &mut PgConnection = &mut *tx;
	let canonical_norm = normalize_entity_name(&candidate.name);

	entities::lock_resolution_key(conn, namespace, &canonical_norm).await?;

	let resolved = match entities::find_by_norm(conn, namespace, &canonical_norm).await? {
		Some(existing) => {
			let reembed =
				entities::merge_mention(
					conn,
					existing.entity_id,
					&candidate.description,
					candidate.confidence,
				)
				.await?;

			ResolvedEntity { entity_id: existing.entity_id, created: false, reembed }
		},
		None => resolve_fuzzy(conn, namespace, candidate, fuzzy_threshold, embedding_version).await?,
	};

	entities::add_source(&mut *tx, resolved.entity_id, document_id).await?;

	Ok(resolved)
}

async fn resolve_fuzzy(
	conn: &mut PgConnection,
	namespace: &str,
	candidate: &CandidateEntity,
	fuzzy_threshold: f32,
	embedding_version: &str,
) -> Result<ResolvedEntity> {
	let same_type = entities::list_by_type(conn, namespace, &candidate.entity_type).await?;
	let existing: Vec<ExistingEntity> = same_type
		.iter()
		.map(|row| ExistingEntity {
			entity_id: row.entity_id,
			canonical: row.canonical.clone(),
			confidence: row.confidence,
		})
		.collect();

	match decide_resolution(&candidate.name, &existing, fuzzy_threshold) {
		ResolveDecision::Merge { entity_id, similarity } => {
			let reembed =
				entities::merge_mention(conn, entity_id, &candidate.description, candidate.confidence)
					.await?;

			tracing::debug!(
				entity_id = %entity_id,
				candidate = %candidate.name,
				similarity,
				"Merged entity mention.",
			);

			Ok(ResolvedEntity { entity_id, created: false, reembed })
		},
		ResolveDecision::Create => {
			let entity_id = entities::insert_entity(
				conn,
				namespace,
				&candidate.name,
				&candidate.entity_type,
				&candidate.description,
				candidate.confidence,
				embedding_version,
			)
			.await?;

			Ok(ResolvedEntity { entity_id, created: true, reembed: true })
		},
	}
}
