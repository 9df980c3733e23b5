//! Provider rate-limit reporting.
//!
//! [`UsageSnapshot::from_headers`] validates the `anthropic-ratelimit-*`
//! headers of a response and [`UsageStore`] keeps the latest valid snapshot
//! for any number of readers. A snapshot is applied whole or not at all.

use crate::error::UsageRejected;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

pub const INPUT_TOKENS_LIMIT: &str = "anthropic-ratelimit-input-tokens-limit";
pub const INPUT_TOKENS_REMAINING: &str = "anthropic-ratelimit-input-tokens-remaining";
pub const OUTPUT_TOKENS_LIMIT: &str = "anthropic-ratelimit-output-tokens-limit";
pub const OUTPUT_TOKENS_REMAINING: &str = "anthropic-ratelimit-output-tokens-remaining";
pub const TOKENS_LIMIT: &str = "anthropic-ratelimit-tokens-limit";
pub const TOKENS_REMAINING: &str = "anthropic-ratelimit-tokens-remaining";
pub const REQUESTS_LIMIT: &str = "anthropic-ratelimit-requests-limit";
pub const REQUESTS_REMAINING: &str = "anthropic-ratelimit-requests-remaining";
pub const TOKENS_RESET: &str = "anthropic-ratelimit-tokens-reset";

/// Every header the snapshot is built from.
pub const RATE_LIMIT_HEADERS: [&str; 9] = [
    TOKENS_RESET,
    TOKENS_LIMIT,
    TOKENS_REMAINING,
    REQUESTS_LIMIT,
    REQUESTS_REMAINING,
    INPUT_TOKENS_LIMIT,
    INPUT_TOKENS_REMAINING,
    OUTPUT_TOKENS_LIMIT,
    OUTPUT_TOKENS_REMAINING,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub input_tokens_limit: u64,
    pub input_tokens_remaining: u64,
    pub output_tokens_limit: u64,
    pub output_tokens_remaining: u64,
    pub total_tokens_limit: u64,
    pub total_tokens_remaining: u64,
    pub requests_limit: u64,
    pub requests_remaining: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<String>,
}

impl UsageSnapshot {
    /// Builds a snapshot, rejecting it if any count is missing or invalid.
    ///
    /// Limits must be non-zero; remaining counts may be zero. Counts must be
    /// plain non-negative integers: `"1000.0"`, `"1e3"` and `"-1"` are all
    /// rejected.
    pub fn from_headers(headers: &HashMap<String, String>) -> Result<Self, UsageRejected> {
        Ok(Self {
            input_tokens_limit: limit(headers, INPUT_TOKENS_LIMIT)?,
            input_tokens_remaining: remaining(headers, INPUT_TOKENS_REMAINING)?,
            output_tokens_limit: limit(headers, OUTPUT_TOKENS_LIMIT)?,
            output_tokens_remaining: remaining(headers, OUTPUT_TOKENS_REMAINING)?,
            total_tokens_limit: limit(headers, TOKENS_LIMIT)?,
            total_tokens_remaining: remaining(headers, TOKENS_REMAINING)?,
            requests_limit: limit(headers, REQUESTS_LIMIT)?,
            requests_remaining: remaining(headers, REQUESTS_REMAINING)?,
            reset_date: headers.get(TOKENS_RESET).cloned(),
        })
    }
}

fn remaining(headers: &HashMap<String, String>, header: &'static str) -> Result<u64, UsageRejected> {
    let raw = headers.get(header).ok_or_else(|| UsageRejected {
        header,
        reason: "missing".to_string(),
    })?;

    raw.trim().parse::<u64>().map_err(|_| UsageRejected {
        header,
        reason: format!("not a count: {raw:?}"),
    })
}

fn limit(headers: &HashMap<String, String>, header: &'static str) -> Result<u64, UsageRejected> {
    match remaining(headers, header)? {
        0 => Err(UsageRejected {
            header,
            reason: "limit must be non-zero".to_string(),
        }),
        n => Ok(n),
    }
}

/// Latest accepted usage snapshot, shared process-wide.
///
/// Single writer, any number of readers; each write replaces the whole value.
#[derive(Debug)]
pub struct UsageStore {
    current: watch::Sender<Option<UsageSnapshot>>,
}

impl Default for UsageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageStore {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    /// The process-wide store, created on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<UsageStore>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    pub fn current(&self) -> Option<UsageSnapshot> {
        self.current.borrow().clone()
    }

    /// Observe every accepted snapshot.
    #[cfg(test)]
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<UsageSnapshot>> {
        self.current.subscribe()
    }

    /// Validates `headers` and, if they pass, replaces the stored snapshot.
    ///
    /// Rejections are logged and returned; the stored snapshot is untouched.
    pub fn publish(&self, headers: &HashMap<String, String>) -> Result<UsageSnapshot, UsageRejected> {
        match UsageSnapshot::from_headers(headers) {
            Ok(snapshot) => {
                tracing::info!(
                    total_remaining = snapshot.total_tokens_remaining,
                    requests_remaining = snapshot.requests_remaining,
                    reset = ?snapshot.reset_date,
                    "updated token usage"
                );
                self.current.send_replace(Some(snapshot.clone()));
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding invalid usage headers");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn valid() -> HashMap<String, String> {
        headers(&[
            (INPUT_TOKENS_LIMIT, "40000"),
            (INPUT_TOKENS_REMAINING, "39000"),
            (OUTPUT_TOKENS_LIMIT, "8000"),
            (OUTPUT_TOKENS_REMAINING, "0"),
            (TOKENS_LIMIT, "48000"),
            (TOKENS_REMAINING, "39000"),
            (REQUESTS_LIMIT, "50"),
            (REQUESTS_REMAINING, "49"),
            (TOKENS_RESET, "2026-10-16T12:00:00Z"),
        ])
    }

    #[test]
    fn accepts_complete_headers() {
        let snapshot = UsageSnapshot::from_headers(&valid()).unwrap();
        assert_eq!(snapshot.total_tokens_limit, 48000);
        assert_eq!(snapshot.output_tokens_remaining, 0);
        assert_eq!(snapshot.reset_date.as_deref(), Some("2026-10-16T12:00:00Z"));
    }

    #[test]
    fn reset_is_optional() {
        let mut h = valid();
        h.remove(TOKENS_RESET);
        assert!(UsageSnapshot::from_headers(&h).unwrap().reset_date.is_none());
    }

    #[test]
    fn zero_limit_is_rejected() {
        let mut h = valid();
        h.insert(REQUESTS_LIMIT.to_string(), "0".to_string());
        let err = UsageSnapshot::from_headers(&h).unwrap_err();
        assert_eq!(err.header, REQUESTS_LIMIT);
    }

    #[test]
    fn missing_or_garbage_counts_are_rejected() {
        let mut h = valid();
        h.remove(INPUT_TOKENS_LIMIT);
        assert!(UsageSnapshot::from_headers(&h).is_err());

        let mut h = valid();
        h.insert(TOKENS_REMAINING.to_string(), "abc".to_string());
        let err = UsageSnapshot::from_headers(&h).unwrap_err();
        assert_eq!(err.header, TOKENS_REMAINING);
    }

    #[test]
    fn only_plain_integers_are_counts() {
        for raw in ["1000.0", "1e3", "-1"] {
            let mut h = valid();
            h.insert(TOKENS_REMAINING.to_string(), raw.to_string());
            let err = UsageSnapshot::from_headers(&h).unwrap_err();
            assert_eq!(err.header, TOKENS_REMAINING);
        }
    }

    #[test]
    fn rejected_publish_keeps_previous_snapshot() {
        let store = UsageStore::new();
        let first = store.publish(&valid()).unwrap();

        let mut bad = valid();
        bad.insert(TOKENS_LIMIT.to_string(), "1000".to_string());
        bad.insert(TOKENS_REMAINING.to_string(), "abc".to_string());
        bad.insert(REQUESTS_LIMIT.to_string(), "50".to_string());
        bad.insert(REQUESTS_REMAINING.to_string(), "10".to_string());
        assert!(store.publish(&bad).is_err());

        assert_eq!(store.current(), Some(first));
    }

    #[test]
    fn rejected_publish_on_empty_store_stays_empty() {
        let store = UsageStore::new();
        assert!(store.publish(&HashMap::new()).is_err());
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn subscribers_see_replacements() {
        let store = UsageStore::new();
        let mut rx = store.subscribe();

        let mut h = valid();
        h.insert(REQUESTS_REMAINING.to_string(), "7".to_string());
        store.publish(&h).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().requests_remaining, 7);
    }

    #[test]
    fn global_store_is_shared() {
        assert!(Arc::ptr_eq(&UsageStore::global(), &UsageStore::global()));
    }
}
