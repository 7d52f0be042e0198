//! Relationship construction over resolved endpoints. An existing edge of
//! the same type between the same endpoints is strengthened (running
//! confidence-weighted average) instead of duplicated; provenance is
//! unioned. Cross-document linking falls out of canonical endpoint
//! resolution.

use sqlx::{PgConnection, Postgres, Transaction};
use uuid::Uuid;

use trellis_storage::relationships;

use crate::Result;

#[derive(Clone, Debug)]
pub struct CandidateRelationship {
	pub src_entity_id: Uuid,
	pub tgt_entity_id: Uuid,
	pub relationship_type: String,
	pub description: String,
	pub confidence: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct BuiltRelationship {
	pub relationship_id: Uuid,
	pub created: bool,
}

pub(crate) async fn build_relationship_tx(
	tx: &mut Transaction<'_, Postgres>,
	namespace: &str,
	document_id: Uuid,
	candidate: &CandidateRelationship,
	embedding_version: &str,
) -> Result<BuiltRelationship> {
	let conn: &mut PgConnection = &mut *tx;
	let (relationship_id, created) = upsert_with_insert_flag(
		conn,
		namespace,
		candidate,
		embedding_version,
	)
	.await?;

	relationships::add_source(&mut *tx, relationship_id, document_id).await?;

	Ok(BuiltRelationship { relationship_id, created })
}

async fn upsert_with_insert_flag(
	conn: &mut PgConnection,
	namespace: &str,
	candidate: &CandidateRelationship,
	embedding_version: &str,
) -> Result<(Uuid, bool)> {
	// The edge weight starts at the extraction confidence; repeated evidence
	// for the same edge moves it by the running average in upsert_edge.
	let existing = relationships::edges_among(
		conn,
		&[candidate.src_entity_id, candidate.tgt_entity_id],
	)
	.await?
	.into_iter()
	.any(|edge| {
		edge.src_entity_id == candidate.src_entity_id
			&& edge.tgt_entity_id == candidate.tgt_entity_id
			&& edge.relationship_type == candidate.relationship_type
	});
	let relationship_id = relationships::upsert_edge(
		conn,
		namespace,
		candidate.src_entity_id,
		candidate.tgt_entity_id,
		&candidate.relationship_type,
		&candidate.description,
		candidate.confidence,
		candidate.confidence,
		embedding_version,
	)
	.await?;

	Ok((relationship_id, !existing))
}
