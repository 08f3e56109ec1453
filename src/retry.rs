use std::future::Future;
use std::time::Duration;

/// Bounded retry with a fixed delay between attempts.
///
/// Runs `attempt` up to `max_attempts` times and returns the first `Some` it
/// produces. The first try runs immediately; the delay sits between attempts,
/// never after the last one. The port-discovery poll is expressed through
/// this; the health wait is deadline-bounded instead, since its probes take
/// time of their own.
pub async fn retry_fixed<T, F, Fut>(
    max_attempts: u32,
    interval: Duration,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for n in 1..=max_attempts {
        if let Some(value) = attempt(n).await {
            return Some(value);
        }
        if n < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    None
}
