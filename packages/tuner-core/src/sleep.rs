//! Interruptible sleep (§4.D, §8 property 8).
//!
//! A long wait is implemented by writing a `sleep.<name>` state key with a
//! TTL equal to the sleep duration and polling every 200 ms until the key is
//! gone — either because it expired naturally or because another peer
//! deleted it to force an early wake-up (the webserver's `scan-now`, S3).
//! Sleeps under the poll interval are just a plain sleep; polling a state key
//! for 150 ms would be slower than the wait it replaces.

use std::time::Duration;

use crate::error::TunerResult;
use crate::state_client::StateClient;
use crate::utils::now_millis;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Sleeps for `duration`, naming the underlying state key `sleep.<name>`.
/// Returns early if that key is deleted out from under it.
pub async fn interruptible_sleep<C: StateClient + ?Sized>(
    client: &C,
    name: &str,
    duration: Duration,
) -> TunerResult<()> {
    if duration < POLL_INTERVAL {
        tokio::time::sleep(duration).await;
        return Ok(());
    }

    let key = format!("sleep.{name}");
    let deadline = now_millis() + duration.as_millis() as u64;
    client
        .set_with_ttl(&key, Some(deadline.to_string()), Some(duration.as_millis() as i64))
        .await?;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !client.exists(&key).await.unwrap_or(false) {
            return Ok(());
        }
        if now_millis() >= deadline {
            return Ok(());
        }
    }
}
