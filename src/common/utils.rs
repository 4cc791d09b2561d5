//! Utility functions for fansum

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a correlation token for one aggregation call.
///
/// The random part keeps tokens distinct across coordinator processes
/// sharing the same fanout exchange.
pub fn generate_correlation_token() -> String {
    format!("sum-{}-{}", timestamp_now_millis(), Uuid::new_v4().simple())
}

/// Generate a consumer tag
pub fn generate_consumer_tag() -> String {
    format!("ctag-{}", Uuid::new_v4().simple())
}

/// Generate a server-side queue name
pub fn generate_queue_name() -> String {
    format!("amq.gen-{}", Uuid::new_v4().simple())
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Interpret a JSON value as an integer the way the write endpoint accepts it.
///
/// Integral numbers (`5`, `5.0`) and numeric strings (`"5"`) are accepted;
/// fractions, out-of-range numbers, booleans, nulls and other strings are not.
pub fn parse_integer_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                Some(f as i64)
            } else {
                None
            }
        }
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
