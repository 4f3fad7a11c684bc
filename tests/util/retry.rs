use crate::util::{fast_retries, TEST_WAIT};
use std::{fmt, future::Future, time::Instant};

/// Polls the async function until it returns `Ok(_)`.
///
/// Attempts are paced by the suite's [`fast_retries`] initial backoff,
/// matching the cadence the managers under test retry at, and give up
/// with a panic once [`TEST_WAIT`] has elapsed.
pub async fn until_ok<F, O, T>(f: F) -> T
where
    F: Fn() -> O,
    O: Future<Output = anyhow::Result<T>>,
    T: fmt::Debug,
{
    let poll = fast_retries().initial_backoff;
    let deadline = Instant::now() + TEST_WAIT;
    loop {
        match f().await {
            Ok(out) => return out,
            Err(err) => {
                assert!(Instant::now() < deadline, "{err}");
                tokio::time::sleep(poll).await;
            }
        }
    }
}
