//! Utility functions for pdkv

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Longest key accepted by the routing API
pub const MAX_KEY_LEN: usize = 1024;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let last = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(last)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {}",
            unit
        ))),
    }
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Validate a routing key. The empty key is legal: it sorts before every
/// other key and only falls in regions whose start is unbounded.
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(crate::Error::Validation(format!(
            "key too long (max {} bytes)",
            MAX_KEY_LEN
        )));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(crate::Error::Validation(
            "key contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Exponential backoff, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How a bounded retry loop ended
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Done(T),
    GaveUp {
        attempts: usize,
        last_error: crate::Error,
    },
    Cancelled,
}

/// Retry with exponential backoff, at most `max_attempts` times.
///
/// Non-retryable errors end the loop immediately. Cancellation is observed
/// both between attempts and while sleeping.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_attempts: usize,
    mut backoff: Backoff,
    cancel: &CancellationToken,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }
        attempt += 1;
        match f().await {
            Ok(result) => return RetryOutcome::Done(result),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                return RetryOutcome::GaveUp {
                    attempts: attempt,
                    last_error: e,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("").is_ok());
        assert!(validate_key("user/42").is_ok());
        assert!(validate_key("bad\nkey").is_err());
        assert!(validate_key(&"x".repeat(2000)).is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(crate::Error::Timeout("remove replica".into()))
                }
            },
            4,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            &cancel,
        )
        .await;

        assert!(matches!(outcome, RetryOutcome::GaveUp { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let cancel = CancellationToken::new();
        let outcome: RetryOutcome<()> = retry_with_backoff(
            || async { Err(crate::Error::RegionNotFound(9)) },
            10,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(1)),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::GaveUp { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let outcome = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(crate::Error::Consensus("no quorum".into()))
                    } else {
                        Ok(42u64)
                    }
                }
            },
            5,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Done(42)));
    }

    #[tokio::test]
    async fn test_retry_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: RetryOutcome<()> = retry_with_backoff(
            || async { Ok(()) },
            3,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(1)),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }
}
