use serde_json::Value;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sqlx::PgConnection;

use crate::{Error, Result, models::JobRow};

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_PARTIAL_FAILURE: &str = "partial_failure";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";

pub const KIND_EXTRACTION: &str = "extraction";
pub const KIND_REINDEX: &str = "reindex";
pub const KIND_REEXTRACTION: &str = "reextraction";

const JOB_COLUMNS: &str = "\
	job_id,
	namespace,
	kind,
	status,
	total,
	processed,
	failed,
	failed_items,
	payload,
	cancel_requested,
	attempts,
	last_error,
	available_at,
	created_at,
	updated_at,
	finished_at";

pub async fn create_job(
	executor: &mut PgConnection,
	namespace: &str,
	kind: &str,
	payload: &Value,
) -> Result<Uuid> {
	let row: (Uuid,) = sqlx::query_as(&format!(
		"\
INSERT INTO jobs (job_id, namespace, kind, status, payload, created_at, updated_at, available_at)
VALUES ($1, $2, $3, '{STATUS_QUEUED}', $4, now(), now(), now())
RETURNING job_id",
	))
	.bind(Uuid::new_v4())
	.bind(namespace)
	.bind(kind)
	.bind(payload)
	.fetch_one(executor)
	.await?;

	Ok(row.0)
}

pub async fn get_job(executor: &mut PgConnection, job_id: Uuid) -> Result<Option<JobRow>> {
	let row = sqlx::query_as::<_, JobRow>(&format!(
		"\
SELECT {JOB_COLUMNS}
FROM jobs
WHERE job_id = $1",
	))
	.bind(job_id)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

/// Claims the next runnable job with a lease, so a crashed worker's claim
/// expires rather than wedging the queue.
pub async fn claim_next_job(
	executor: &mut PgConnection,
	now: OffsetDateTime,
	lease_seconds: i64,
) -> Result<Option<JobRow>> {
	let row = sqlx::query_as::<_, JobRow>(&format!(
		"\
SELECT {JOB_COLUMNS}
FROM jobs
WHERE status IN ('{STATUS_QUEUED}', '{STATUS_IN_PROGRESS}') AND available_at <= $1
ORDER BY available_at ASC
LIMIT 1
FOR UPDATE SKIP LOCKED",
	))
	.bind(now)
	.fetch_optional(&mut *executor)
	.await?;

	let Some(mut job) = row else {
		return Ok(None);
	};
	let lease_until = now + Duration::seconds(lease_seconds);

	sqlx::query(&format!(
		"\
UPDATE jobs
SET status = '{STATUS_IN_PROGRESS}',
	attempts = attempts + 1,
	available_at = $2,
	updated_at = $1
WHERE job_id = $3",
	))
	.bind(now)
	.bind(lease_until)
	.bind(job.job_id)
	.execute(executor)
	.await?;

	job.status = STATUS_IN_PROGRESS.to_string();
	job.attempts += 1;
	job.available_at = lease_until;
	job.updated_at = now;

	Ok(Some(job))
}

pub async fn set_total(executor: &mut PgConnection, job_id: Uuid, total: i32) -> Result<()> {
	sqlx::query("UPDATE jobs SET total = $2, updated_at = now() WHERE job_id = $1")
		.bind(job_id)
		.bind(total)
		.execute(executor)
		.await?;

	Ok(())
}

pub async fn record_progress(
	executor: &mut PgConnection,
	job_id: Uuid,
	processed_delta: i32,
	failed_delta: i32,
	failed_items: &[Value],
) -> Result<()> {
	sqlx::query(
		"\
UPDATE jobs
SET processed = processed + $2,
	failed = failed + $3,
	failed_items = failed_items || $4::jsonb,
	updated_at = now()
WHERE job_id = $1",
	)
	.bind(job_id)
	.bind(processed_delta)
	.bind(failed_delta)
	.bind(Value::Array(failed_items.to_vec()))
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn finish_job(
	executor: &mut PgConnection,
	job_id: Uuid,
	status: &str,
	last_error: Option<&str>,
) -> Result<()> {
	let result = sqlx::query(
		"\
UPDATE jobs
SET status = $2, last_error = $3, finished_at = now(), updated_at = now()
WHERE job_id = $1",
	)
	.bind(job_id)
	.bind(status)
	.bind(last_error)
	.execute(executor)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!("job not found; job_id={job_id}")));
	}

	Ok(())
}

/// Releases a failed claim with backoff so the job is retried later.
pub async fn release_for_retry(
	executor: &mut PgConnection,
	job_id: Uuid,
	now: OffsetDateTime,
	backoff: Duration,
	error: &str,
) -> Result<()> {
	sqlx::query(&format!(
		"\
UPDATE jobs
SET status = '{STATUS_QUEUED}',
	last_error = $3,
	available_at = $2,
	updated_at = now()
WHERE job_id = $1",
	))
	.bind(job_id)
	.bind(now + backoff)
	.bind(error)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn request_cancel(executor: &mut PgConnection, job_id: Uuid) -> Result<bool> {
	let result = sqlx::query(&format!(
		"\
UPDATE jobs
SET cancel_requested = TRUE, updated_at = now()
WHERE job_id = $1
	AND status IN ('{STATUS_QUEUED}', '{STATUS_IN_PROGRESS}')",
	))
	.bind(job_id)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() > 0)
}

pub async fn cancel_requested(executor: &mut PgConnection, job_id: Uuid) -> Result<bool> {
	let row: Option<(bool,)> =
		sqlx::query_as("SELECT cancel_requested FROM jobs WHERE job_id = $1")
			.bind(job_id)
			.fetch_optional(executor)
			.await?;

	Ok(row.map(|(flag,)| flag).unwrap_or(false))
}
