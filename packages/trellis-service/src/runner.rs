//! Job execution. The worker claims a job row and hands the snapshot here;
//! runners process items in bounded batches, re-checking the cancellation
//! flag between batches so in-flight work finishes before a job turns
//! `cancelled`. No item is dropped silently: each one either succeeds or
//! lands in the job's failure list.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use trellis_domain::filter::MetadataFilter;
use trellis_domain::schema::{EntityTypeRegistry, MetadataSchema};
use trellis_providers::{extractor, retry};
use trellis_storage::{chunks, documents, models::DocumentRow, schemas};

use crate::{
	Error, IngestRequest, JobFailure, JobKind, JobSnapshot, JobStatus, Result, TrellisService,
	jobs::terminal_status,
	schema_admin::{ReextractionPayload, ReindexPayload},
};

impl TrellisService {
	/// Runs a claimed job to a terminal status. The returned status has
	/// already been written through the job store.
	pub async fn run_job(&self, job: JobSnapshot, cancel: CancellationToken) -> Result<JobStatus> {
		if job.cancel_requested || self.was_cancelled(&job, &cancel).await {
			self.jobs.finish(job.job_id, JobStatus::Cancelled).await?;

			return Ok(JobStatus::Cancelled);
		}

		let result = match job.kind {
			JobKind::Extraction => self.run_extraction(&job, &cancel).await,
			JobKind::Reindex => self.run_reindex(&job, &cancel).await,
			JobKind::Reextraction => self.run_reextraction(&job, &cancel).await,
		};

		let status = match result {
			Ok(status) => status,
			Err(err) => {
				tracing::error!(job_id = %job.job_id, error = %err, "Job failed outright.");
				self.jobs
					.record_progress(
						job.job_id,
						0,
						vec![JobFailure { item: job.job_id.to_string(), error: err.to_string() }],
					)
					.await?;

				JobStatus::Failed
			},
		};

		self.jobs.finish(job.job_id, status).await?;

		Ok(status)
	}

	async fn was_cancelled(&self, job: &JobSnapshot, cancel: &CancellationToken) -> bool {
		if cancel.is_cancelled() {
			return true;
		}

		self.jobs.cancel_requested(job.job_id).await.unwrap_or(false)
	}

	async fn run_extraction(
		&self,
		job: &JobSnapshot,
		cancel: &CancellationToken,
	) -> Result<JobStatus> {
		let req: IngestRequest =
			serde_json::from_value(job.payload.clone()).map_err(|err| Error::InvalidRequest {
				message: format!("extraction job payload is malformed: {err}"),
			})?;

		self.jobs.set_total(job.job_id, req.blocks.len() as u32).await?;

		let report = self.ingest_document_inner(req, Some(cancel)).await?;
		let failures: Vec<JobFailure> = report
			.failed_blocks
			.iter()
			.map(|failure| JobFailure {
				item: format!("block {}", failure.block_index),
				error: failure.error.clone(),
			})
			.collect();

		self.jobs.record_progress(job.job_id, report.blocks_succeeded, failures).await?;

		let cancelled = self.was_cancelled(job, cancel).await;

		Ok(terminal_status(report.blocks_succeeded, report.failed_blocks.len() as u32, cancelled))
	}

	async fn run_reindex(&self, job: &JobSnapshot, cancel: &CancellationToken) -> Result<JobStatus> {
		let payload: ReindexPayload =
			serde_json::from_value(job.payload.clone()).map_err(|err| Error::InvalidRequest {
				message: format!("reindex job payload is malformed: {err}"),
			})?;
		let filter = parse_filter(payload.filters.as_ref())?;
		let mut conn = self.db.pool.acquire().await?;
		let schema = match schemas::active_schema(&mut conn, &job.namespace).await? {
			Some(row) => schemas::decode_schema(&row)?,
			None => MetadataSchema::default(),
		};
		let targets: Vec<DocumentRow> = documents::list_by_namespace(&mut conn, &job.namespace)
			.await?
			.into_iter()
			.filter(|doc| matches_filter(filter.as_ref(), &doc.metadata))
			.collect();

		drop(conn);

		self.jobs.set_total(job.job_id, targets.len() as u32).await?;

		let batch_size = self.cfg.jobs.batch_size as usize;
		let mut processed = 0_u32;
		let mut failed = 0_u32;
		let mut cancelled = false;

		for batch in targets.chunks(batch_size.max(1)) {
			if self.was_cancelled(job, cancel).await {
				cancelled = true;

				break;
			}

			let mut batch_processed = 0_u32;
			let mut failures = Vec::new();

			for doc in batch {
				match self.reindex_document(&schema, doc).await {
					Ok(()) => batch_processed += 1,
					Err(err) => failures.push(JobFailure {
						item: doc.document_id.to_string(),
						error: err.to_string(),
					}),
				}
			}

			processed += batch_processed;
			failed += failures.len() as u32;

			self.jobs.record_progress(job.job_id, batch_processed, failures).await?;
		}

		Ok(terminal_status(processed, failed, cancelled))
	}

	async fn reindex_document(&self, schema: &MetadataSchema, doc: &DocumentRow) -> Result<()> {
		let Value::Object(metadata) = &doc.metadata else {
			return Err(Error::InvalidRequest {
				message: "document metadata is not an object.".to_string(),
			});
		};
		let mut updated = metadata.clone();

		for (field, default) in schema.missing_defaults(metadata) {
			updated.insert(field.to_string(), default.clone());
		}

		let validated = schema
			.validate_metadata(&updated)
			.map_err(|err| Error::InvalidRequest { message: err.to_string() })?;
		let mut conn = self.db.pool.acquire().await?;

		documents::update_metadata(&mut conn, doc.document_id, &Value::Object(validated)).await?;

		Ok(())
	}

	async fn run_reextraction(
		&self,
		job: &JobSnapshot,
		cancel: &CancellationToken,
	) -> Result<JobStatus> {
		let payload: ReextractionPayload =
			serde_json::from_value(job.payload.clone()).map_err(|err| Error::InvalidRequest {
				message: format!("re-extraction job payload is malformed: {err}"),
			})?;
		let filter = parse_filter(payload.filters.as_ref())?;
		let mut conn = self.db.pool.acquire().await?;
		let registry = match schemas::active_registry(&mut conn, &job.namespace).await? {
			Some(row) => schemas::decode_registry(&row)?,
			None =>
				return Err(Error::InvalidRequest {
					message: format!(
						"no active entity-type registry for namespace '{}'",
						job.namespace
					),
				}),
		};
		// Extraction is constrained to the newly added types so existing
		// nodes and edges are never rewritten, only supplemented.
		let narrowed = EntityTypeRegistry {
			entity_types: registry
				.entity_types
				.iter()
				.filter(|def| {
					payload.new_types.iter().any(|name| name.eq_ignore_ascii_case(&def.name))
				})
				.cloned()
				.collect(),
		};
		let targets: Vec<DocumentRow> = documents::list_by_namespace(&mut conn, &job.namespace)
			.await?
			.into_iter()
			.filter(|doc| doc.status == documents::STATUS_INDEXED)
			.filter(|doc| matches_filter(filter.as_ref(), &doc.metadata))
			.collect();

		drop(conn);

		self.jobs.set_total(job.job_id, targets.len() as u32).await?;

		let batch_size = self.cfg.jobs.batch_size as usize;
		let mut processed = 0_u32;
		let mut failed = 0_u32;
		let mut cancelled = false;

		for batch in targets.chunks(batch_size.max(1)) {
			if self.was_cancelled(job, cancel).await {
				cancelled = true;

				break;
			}

			let mut batch_processed = 0_u32;
			let mut failures = Vec::new();

			for doc in batch {
				match self.reextract_document(&job.namespace, &narrowed, doc).await {
					Ok(()) => batch_processed += 1,
					Err(err) => failures.push(JobFailure {
						item: doc.document_id.to_string(),
						error: err.to_string(),
					}),
				}
			}

			processed += batch_processed;
			failed += failures.len() as u32;

			self.jobs.record_progress(job.job_id, batch_processed, failures).await?;
		}

		Ok(terminal_status(processed, failed, cancelled))
	}

	async fn reextract_document(
		&self,
		namespace: &str,
		registry: &EntityTypeRegistry,
		doc: &DocumentRow,
	) -> Result<()> {
		let mut conn = self.db.pool.acquire().await?;
		let chunk_rows = chunks::list_by_documents(&mut conn, &[doc.document_id]).await?;

		drop(conn);

		let type_names = registry.type_names();
		let extraction_cfg = &self.cfg.extraction;

		for chunk in chunk_rows {
			let messages = extractor::build_messages(&type_names, &chunk.text);
			let extraction = retry::with_retries(
				extraction_cfg.max_retries,
				extraction_cfg.retry_base_ms,
				extraction_cfg.retry_max_ms,
				|| self.providers.extractor.extract(&self.cfg.providers.llm_extractor, &messages),
			)
			.await?;
			let outcome =
				self.persist_block(namespace, doc.document_id, registry, extraction).await?;

			self.index_block_embeddings(namespace, &outcome).await;
		}

		Ok(())
	}
}

fn parse_filter(filters: Option<&Value>) -> Result<Option<MetadataFilter>> {
	filters
		.map(|raw| {
			MetadataFilter::parse(raw)
				.map_err(|err| Error::InvalidRequest { message: err.to_string() })
		})
		.transpose()
}

fn matches_filter(filter: Option<&MetadataFilter>, metadata: &Value) -> bool {
	let Some(filter) = filter else { return true };

	match metadata.as_object() {
		Some(map) => filter.matches(map),
		None => false,
	}
}
