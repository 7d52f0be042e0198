//! Job lifecycle behind an explicit store interface. `PgJobStore` is the
//! production backend and doubles as the queue the worker claims from;
//! `MemoryJobStore` is an in-process backend conforming to the same
//! contract.

use std::{
	collections::HashMap,
	str::FromStr,
	sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{BoxFuture, Error, Result};
use trellis_storage::jobs as pg_jobs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
	Extraction,
	Reindex,
	Reextraction,
}
impl JobKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Extraction => pg_jobs::KIND_EXTRACTION,
			Self::Reindex => pg_jobs::KIND_REINDEX,
			Self::Reextraction => pg_jobs::KIND_REEXTRACTION,
		}
	}
}
impl FromStr for JobKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			pg_jobs::KIND_EXTRACTION => Ok(Self::Extraction),
			pg_jobs::KIND_REINDEX => Ok(Self::Reindex),
			pg_jobs::KIND_REEXTRACTION => Ok(Self::Reextraction),
			other => Err(format!("unknown job kind '{other}'")),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Queued,
	InProgress,
	Completed,
	PartialFailure,
	Failed,
	Cancelled,
}
impl JobStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Queued => pg_jobs::STATUS_QUEUED,
			Self::InProgress => pg_jobs::STATUS_IN_PROGRESS,
			Self::Completed => pg_jobs::STATUS_COMPLETED,
			Self::PartialFailure => pg_jobs::STATUS_PARTIAL_FAILURE,
			Self::Failed => pg_jobs::STATUS_FAILED,
			Self::Cancelled => pg_jobs::STATUS_CANCELLED,
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::PartialFailure | Self::Failed | Self::Cancelled)
	}
}
impl FromStr for JobStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			pg_jobs::STATUS_QUEUED => Ok(Self::Queued),
			pg_jobs::STATUS_IN_PROGRESS => Ok(Self::InProgress),
			pg_jobs::STATUS_COMPLETED => Ok(Self::Completed),
			pg_jobs::STATUS_PARTIAL_FAILURE => Ok(Self::PartialFailure),
			pg_jobs::STATUS_FAILED => Ok(Self::Failed),
			pg_jobs::STATUS_CANCELLED => Ok(Self::Cancelled),
			other => Err(format!("unknown job status '{other}'")),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobFailure {
	pub item: String,
	pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
	pub job_id: Uuid,
	pub namespace: String,
	pub kind: JobKind,
	pub status: JobStatus,
	pub total: u32,
	pub processed: u32,
	pub failed: u32,
	pub failed_items: Vec<JobFailure>,
	pub payload: Value,
	pub cancel_requested: bool,
}

/// Terminal status from final counters: a job only fails outright when zero
/// items succeeded; a cancelled job stays cancelled.
pub fn terminal_status(processed: u32, failed: u32, cancelled: bool) -> JobStatus {
	if cancelled {
		JobStatus::Cancelled
	} else if failed == 0 {
		JobStatus::Completed
	} else if processed > 0 {
		JobStatus::PartialFailure
	} else {
		JobStatus::Failed
	}
}

pub trait JobStore
where
	Self: Send + Sync,
{
	fn create(&self, namespace: &str, kind: JobKind, payload: Value) -> BoxFuture<'_, Result<Uuid>>;

	fn get(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<JobSnapshot>>>;

	fn set_total(&self, job_id: Uuid, total: u32) -> BoxFuture<'_, Result<()>>;

	fn record_progress(
		&self,
		job_id: Uuid,
		processed_delta: u32,
		failures: Vec<JobFailure>,
	) -> BoxFuture<'_, Result<()>>;

	fn finish(&self, job_id: Uuid, status: JobStatus) -> BoxFuture<'_, Result<()>>;

	/// Returns false when the job is unknown or already terminal.
	fn request_cancel(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool>>;

	fn cancel_requested(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool>>;
}

pub struct PgJobStore {
	pool: PgPool,
}
impl PgJobStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}
impl JobStore for PgJobStore {
	fn create(&self, namespace: &str, kind: JobKind, payload: Value) -> BoxFuture<'_, Result<Uuid>> {
		let namespace = namespace.to_string();

		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;
			let job_id =
				pg_jobs::create_job(&mut conn, &namespace, kind.as_str(), &payload).await?;

			Ok(job_id)
		})
	}

	fn get(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<JobSnapshot>>> {
		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;
			let Some(row) = pg_jobs::get_job(&mut conn, job_id).await? else {
				return Ok(None);
			};

			Ok(Some(snapshot_from_row(row)?))
		})
	}

	fn set_total(&self, job_id: Uuid, total: u32) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;

			pg_jobs::set_total(&mut conn, job_id, total as i32).await?;

			Ok(())
		})
	}

	fn record_progress(
		&self,
		job_id: Uuid,
		processed_delta: u32,
		failures: Vec<JobFailure>,
	) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;
			let failed_delta = failures.len() as i32;
			let items: Vec<Value> = failures
				.into_iter()
				.map(|failure| serde_json::to_value(failure).unwrap_or(Value::Null))
				.collect();

			pg_jobs::record_progress(
				&mut conn,
				job_id,
				processed_delta as i32,
				failed_delta,
				&items,
			)
			.await?;

			Ok(())
		})
	}

	fn finish(&self, job_id: Uuid, status: JobStatus) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;

			pg_jobs::finish_job(&mut conn, job_id, status.as_str(), None).await?;

			Ok(())
		})
	}

	fn request_cancel(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool>> {
		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;

			Ok(pg_jobs::request_cancel(&mut conn, job_id).await?)
		})
	}

	fn cancel_requested(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool>> {
		Box::pin(async move {
			let mut conn = self.pool.acquire().await?;

			Ok(pg_jobs::cancel_requested(&mut conn, job_id).await?)
		})
	}
}

fn snapshot_from_row(row: trellis_storage::models::JobRow) -> Result<JobSnapshot> {
	let kind = row.kind.parse().map_err(|message| Error::Storage { message })?;
	let status = row.status.parse().map_err(|message| Error::Storage { message })?;
	let failed_items = serde_json::from_value(row.failed_items).unwrap_or_default();

	Ok(JobSnapshot {
		job_id: row.job_id,
		namespace: row.namespace,
		kind,
		status,
		total: row.total.max(0) as u32,
		processed: row.processed.max(0) as u32,
		failed: row.failed.max(0) as u32,
		failed_items,
		payload: row.payload,
		cancel_requested: row.cancel_requested,
	})
}

#[derive(Default)]
pub struct MemoryJobStore {
	jobs: Mutex<HashMap<Uuid, JobSnapshot>>,
}
impl MemoryJobStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn with_job<T>(
		&self,
		job_id: Uuid,
		f: impl FnOnce(&mut JobSnapshot) -> T,
	) -> Result<T> {
		let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
		let job = jobs.get_mut(&job_id).ok_or_else(|| Error::NotFound {
			message: format!("job not found; job_id={job_id}"),
		})?;

		Ok(f(job))
	}
}
impl JobStore for MemoryJobStore {
	fn create(&self, namespace: &str, kind: JobKind, payload: Value) -> BoxFuture<'_, Result<Uuid>> {
		let job_id = Uuid::new_v4();
		let snapshot = JobSnapshot {
			job_id,
			namespace: namespace.to_string(),
			kind,
			status: JobStatus::Queued,
			total: 0,
			processed: 0,
			failed: 0,
			failed_items: Vec::new(),
			payload,
			cancel_requested: false,
		};

		Box::pin(async move {
			self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(job_id, snapshot);

			Ok(job_id)
		})
	}

	fn get(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<JobSnapshot>>> {
		Box::pin(async move {
			Ok(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get(&job_id).cloned())
		})
	}

	fn set_total(&self, job_id: Uuid, total: u32) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.with_job(job_id, |job| {
				job.total = total;
				job.status = JobStatus::InProgress;
			})
		})
	}

	fn record_progress(
		&self,
		job_id: Uuid,
		processed_delta: u32,
		failures: Vec<JobFailure>,
	) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.with_job(job_id, |job| {
				job.processed += processed_delta;
				job.failed += failures.len() as u32;
				job.failed_items.extend(failures);
			})
		})
	}

	fn finish(&self, job_id: Uuid, status: JobStatus) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.with_job(job_id, |job| {
				job.status = status;
			})
		})
	}

	fn request_cancel(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool>> {
		Box::pin(async move {
			let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
			let Some(job) = jobs.get_mut(&job_id) else {
				return Ok(false);
			};

			if job.status.is_terminal() {
				return Ok(false);
			}

			job.cancel_requested = true;

			Ok(true)
		})
	}

	fn cancel_requested(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool>> {
		Box::pin(async move {
			Ok(self
				.jobs
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.get(&job_id)
				.map(|job| job.cancel_requested)
				.unwrap_or(false))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn terminal_status_matches_failure_isolation_rules() {
		assert_eq!(terminal_status(10, 0, false), JobStatus::Completed);
		assert_eq!(terminal_status(48, 2, false), JobStatus::PartialFailure);
		assert_eq!(terminal_status(0, 5, false), JobStatus::Failed);
		assert_eq!(terminal_status(0, 0, false), JobStatus::Completed);
		assert_eq!(terminal_status(3, 1, true), JobStatus::Cancelled);
	}

	#[tokio::test]
	async fn memory_store_tracks_the_full_lifecycle() {
		let store = MemoryJobStore::new();
		let job_id = store
			.create("ns", JobKind::Reindex, serde_json::json!({"filters": null}))
			.await
			.expect("create job");

		store.set_total(job_id, 50).await.expect("set total");
		store.record_progress(job_id, 24, Vec::new()).await.expect("progress");
		store
			.record_progress(
				job_id,
				24,
				vec![
					JobFailure { item: "doc-1".to_string(), error: "bad metadata".to_string() },
					JobFailure { item: "doc-2".to_string(), error: "bad metadata".to_string() },
				],
			)
			.await
			.expect("progress with failures");

		let snapshot = store.get(job_id).await.expect("get").expect("job exists");

		assert_eq!(snapshot.total, 50);
		assert_eq!(snapshot.processed, 48);
		assert_eq!(snapshot.failed, 2);
		assert_eq!(snapshot.failed_items.len(), 2);

		let status =
			terminal_status(snapshot.processed, snapshot.failed, snapshot.cancel_requested);

		store.finish(job_id, status).await.expect("finish");

		let snapshot = store.get(job_id).await.expect("get").expect("job exists");

		assert_eq!(snapshot.status, JobStatus::PartialFailure);
	}

	#[tokio::test]
	async fn cancel_is_rejected_on_terminal_jobs() {
		let store = MemoryJobStore::new();
		let job_id = store
			.create("ns", JobKind::Extraction, Value::Null)
			.await
			.expect("create job");

		assert!(store.request_cancel(job_id).await.expect("cancel"));
		assert!(store.cancel_requested(job_id).await.expect("flag"));

		store.finish(job_id, JobStatus::Cancelled).await.expect("finish");

		assert!(!store.request_cancel(job_id).await.expect("cancel terminal"));
	}

	#[tokio::test]
	async fn unknown_jobs_are_not_cancellable() {
		let store = MemoryJobStore::new();

		assert!(!store.request_cancel(Uuid::new_v4()).await.expect("cancel unknown"));
		assert!(!store.cancel_requested(Uuid::new_v4()).await.expect("flag unknown"));
	}
}
