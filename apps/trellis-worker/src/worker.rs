//! Job claim loop. One queued job is claimed per tick with a lease taken
//! under `FOR UPDATE SKIP LOCKED`, so concurrent workers never double-claim
//! and a crashed worker's claim expires on its own. Failed runs are
//! released back to the queue with exponential backoff.

use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime};
use tokio::time as tokio_time;
use tokio_util::sync::CancellationToken;

use trellis_service::TrellisService;
use trellis_storage::jobs;

use crate::Result;

const BASE_BACKOFF_MS: i64 = 500;
const MAX_BACKOFF_MS: i64 = 30_000;

pub struct WorkerState {
	pub service: TrellisService,
}

pub async fn run_worker(state: WorkerState) -> Result<()> {
	let poll_interval = StdDuration::from_millis(state.service.cfg.jobs.poll_interval_ms);

	loop {
		match process_once(&state).await {
			Ok(true) => {
				// A job ran; look for the next one immediately.
				continue;
			},
			Ok(false) => {},
			Err(err) => {
				tracing::error!(error = %err, "Job processing failed.");
			},
		}

		tokio_time::sleep(poll_interval).await;
	}
}

async fn process_once(state: &WorkerState) -> Result<bool> {
	let now = OffsetDateTime::now_utc();
	let lease_seconds = state.service.cfg.jobs.claim_lease_seconds;
	let claimed = {
		let mut tx = state.service.db.pool.begin().await?;
		let claimed = jobs::claim_next_job(&mut tx, now, lease_seconds).await?;

		tx.commit().await?;

		claimed
	};
	let Some(row) = claimed else {
		return Ok(false);
	};
	let job = state.service.get_job_status(row.job_id).await?;
	let cancel = CancellationToken::new();

	tracing::info!(job_id = %row.job_id, kind = %row.kind, attempts = row.attempts, "Running job.");

	match state.service.run_job(job, cancel).await {
		Ok(status) => {
			tracing::info!(job_id = %row.job_id, status = status.as_str(), "Job finished.");
		},
		Err(err) => {
			let backoff = backoff_for_attempt(row.attempts);
			let mut conn = state.service.db.pool.acquire().await?;

			jobs::release_for_retry(
				&mut conn,
				row.job_id,
				OffsetDateTime::now_utc(),
				backoff,
				&err.to_string(),
			)
			.await?;
			tracing::error!(
				job_id = %row.job_id,
				error = %err,
				backoff_ms = backoff.whole_milliseconds() as i64,
				"Job run errored. Released for retry.",
			);
		},
	}

	Ok(true)
}

fn backoff_for_attempt(attempt: i32) -> Duration {
	let attempts = attempt.max(1) as u32;
	let exp = attempts.saturating_sub(1).min(6);
	let base = BASE_BACKOFF_MS.saturating_mul(1 << exp);
	let capped = base.min(MAX_BACKOFF_MS);

	Duration::milliseconds(capped)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_until_the_cap() {
		assert_eq!(backoff_for_attempt(1), Duration::milliseconds(500));
		assert_eq!(backoff_for_attempt(2), Duration::milliseconds(1_000));
		assert_eq!(backoff_for_attempt(4), Duration::milliseconds(4_000));
		assert_eq!(backoff_for_attempt(32), Duration::milliseconds(30_000));
	}
}
