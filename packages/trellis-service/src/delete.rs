//! Document deletion cascade. Chunks go with the document row; entities and
//! relationships lose this document from their provenance and are removed
//! only when no other document still references them. Idempotent: deleting
//! an unknown id is a success no-op.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trellis_storage::{chunks, documents, entities, relationships};

use crate::{Result, TrellisService};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteReport {
	pub document_id: Uuid,
	pub deleted: bool,
	pub chunks_removed: u32,
	pub entities_removed: u32,
	pub relationships_removed: u32,
}

impl TrellisService {
	pub async fn delete_document(&self, document_id: Uuid) -> Result<DeleteReport> {
		let mut tx = self.db.pool.begin().await?;

		if documents::get_document(&mut tx, document_id).await?.is_none() {
			tx.commit().await?;

			return Ok(DeleteReport {
				document_id,
				deleted: false,
				chunks_removed: 0,
				entities_removed: 0,
				relationships_removed: 0,
			});
		}

		let chunk_ids = chunks::list_ids_by_document(&mut tx, document_id).await?;
		// Relationship provenance first: edges orphaned by this document
		// disappear before entity cleanup cascades the rest.
		let removed_relationships =
			relationships::remove_document_and_orphans(&mut tx, document_id).await?;
		let removed_entities = entities::remove_document_and_orphans(&mut tx, document_id).await?;

		documents::delete_document_row(&mut tx, document_id).await?;

		tx.commit().await?;

		self.qdrant.delete_chunk_points_by_document(document_id).await?;
		self.qdrant
			.delete_points_by_ids(self.qdrant.entities_collection(), &removed_entities)
			.await?;
		self.qdrant
			.delete_points_by_ids(self.qdrant.relationships_collection(), &removed_relationships)
			.await?;

		tracing::info!(
			document_id = %document_id,
			chunks = chunk_ids.len(),
			entities = removed_entities.len(),
			relationships = removed_relationships.len(),
			"Deleted document and orphaned graph rows.",
		);

		Ok(DeleteReport {
			document_id,
			deleted: true,
			chunks_removed: chunk_ids.len() as u32,
			entities_removed: removed_entities.len() as u32,
			relationships_removed: removed_relationships.len() as u32,
		})
	}
}
