//! Bounded exponential backoff for extraction-path collaborator calls.
//! Query-path callers degrade instead of retrying.

use std::{future::Future, time::Duration};

pub fn backoff_for_attempt(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
	let attempts = attempt.max(1);
	let exp = attempts.saturating_sub(1).min(6);
	let backoff = base_ms.saturating_mul(1_u64 << exp).min(max_ms);

	Duration::from_millis(backoff)
}

/// Runs `call` up to `max_retries + 1` times, sleeping the backoff between
/// failures. Returns the last error when every attempt fails.
pub async fn with_retries<T, F, Fut>(
	max_retries: u32,
	base_ms: u64,
	max_ms: u64,
	mut call: F,
) -> crate::Result<T>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = crate::Result<T>>,
{
	let mut attempt = 0_u32;

	loop {
		match call().await {
			Ok(value) => return Ok(value),
			Err(err) => {
				attempt += 1;

				if attempt > max_retries {
					return Err(err);
				}

				let backoff = backoff_for_attempt(attempt, base_ms, max_ms);

				tracing::warn!(
					attempt,
					backoff_ms = backoff.as_millis() as u64,
					error = %err,
					"Provider call failed. Retrying.",
				);
				tokio::time::sleep(backoff).await;
			},
		}
	}
}
