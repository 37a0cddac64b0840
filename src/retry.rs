// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Metadata
//!
//! All retry state travels with the message in its headers. This module reads that
//! loosely typed header table into a [`RetryMetadata`] record, writes it back, and
//! computes the redelivery delay for a given retry count.

use chrono::{SecondsFormat, Utc};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};

/// Number of failed attempts so far
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// ISO-8601 instant of the first failure, preserved across retries
pub const AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP: &str = "x-first-failure-timestamp";
/// Message of the most recent failure
pub const AMQP_HEADERS_LAST_ERROR: &str = "x-last-error";
/// Redelivery delay in milliseconds, read by the delayed-message exchange
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

pub const BASE_RETRY_DELAY_MS: u64 = 1_000;
/// 16 hours
pub const MAX_RETRY_DELAY_MS: u64 = 57_600_000;

/// Delay before redelivering a message that already failed `retry_count` times.
///
/// The first retry is immediate, then the delay doubles from one second up to
/// [`MAX_RETRY_DELAY_MS`].
pub fn retry_delay_ms(retry_count: u32) -> u64 {
    if retry_count == 0 {
        return 0;
    }

    match 2u64.checked_pow(retry_count - 1) {
        Some(factor) => BASE_RETRY_DELAY_MS
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_MS),
        None => MAX_RETRY_DELAY_MS,
    }
}

/// Typed view of the retry headers of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryMetadata {
    pub retry_count: u32,
    pub first_failure_timestamp: String,
    pub last_error: Option<String>,
}

impl RetryMetadata {
    /// Reads the retry headers, defaulting the count to 0 and the first failure to now.
    pub fn from_headers(headers: &FieldTable) -> Self {
        let inner = headers.inner();

        let retry_count = inner
            .get(AMQP_HEADERS_RETRY_COUNT)
            .and_then(as_count)
            .unwrap_or_default();

        let first_failure_timestamp = inner
            .get(AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP)
            .and_then(as_text)
            .filter(|ts| !ts.is_empty())
            .unwrap_or_else(now_iso8601);

        let last_error = inner.get(AMQP_HEADERS_LAST_ERROR).and_then(as_text);

        RetryMetadata {
            retry_count,
            first_failure_timestamp,
            last_error,
        }
    }

    /// Metadata for the next attempt: count incremented, error refreshed.
    pub fn next_attempt(&self, error: &str) -> Self {
        RetryMetadata {
            retry_count: self.retry_count.saturating_add(1),
            first_failure_timestamp: self.first_failure_timestamp.clone(),
            last_error: Some(error.to_owned()),
        }
    }

    /// Same count, error refreshed.
    pub fn with_error(&self, error: &str) -> Self {
        RetryMetadata {
            last_error: Some(error.to_owned()),
            ..self.clone()
        }
    }

    /// Writes the retry headers over `headers`, keeping every other entry.
    pub fn merge_into(&self, headers: &FieldTable) -> FieldTable {
        let mut merged = headers.clone();

        merged.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(self.retry_count)),
        );
        merged.insert(
            ShortString::from(AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP),
            AMQPValue::LongString(LongString::from(self.first_failure_timestamp.clone())),
        );
        if let Some(error) = &self.last_error {
            merged.insert(
                ShortString::from(AMQP_HEADERS_LAST_ERROR),
                AMQPValue::LongString(LongString::from(error.clone())),
            );
        }

        merged
    }
}

pub(crate) fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::Float(v) => *v as i64,
        AMQPValue::Double(v) => *v as i64,
        AMQPValue::ShortString(_) | AMQPValue::LongString(_) => {
            as_text(value)?.trim().parse().ok()?
        }
        _ => return None,
    };

    Some(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: Vec<(&str, AMQPValue)>) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in entries {
            table.insert(ShortString::from(key), value);
        }
        table
    }

    #[test]
    fn test_retry_delay_schedule() {
        assert_eq!(retry_delay_ms(0), 0);
        assert_eq!(retry_delay_ms(1), 1_000);
        assert_eq!(retry_delay_ms(2), 2_000);
        assert_eq!(retry_delay_ms(3), 4_000);
        assert_eq!(retry_delay_ms(4), 8_000);
        assert_eq!(retry_delay_ms(5), 16_000);
        assert_eq!(retry_delay_ms(10), 512_000);
        assert_eq!(retry_delay_ms(14), 8_192_000);
        assert_eq!(retry_delay_ms(15), 16_384_000);
        assert_eq!(retry_delay_ms(16), 32_768_000);
        assert_eq!(retry_delay_ms(17), MAX_RETRY_DELAY_MS);
        assert_eq!(retry_delay_ms(20), MAX_RETRY_DELAY_MS);
        assert_eq!(retry_delay_ms(u32::MAX), MAX_RETRY_DELAY_MS);
    }

    #[test]
    fn test_retry_delay_is_monotonic_and_capped() {
        let mut previous = 0;
        for count in 0..200 {
            let delay = retry_delay_ms(count);
            assert!(delay >= previous);
            assert!(delay <= MAX_RETRY_DELAY_MS);
            previous = delay;
        }
    }

    #[test]
    fn test_from_headers_defaults_when_absent() {
        let meta = RetryMetadata::from_headers(&FieldTable::default());

        assert_eq!(meta.retry_count, 0);
        assert!(meta.last_error.is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(&meta.first_failure_timestamp).is_ok());
    }

    #[test]
    fn test_from_headers_accepts_any_integer_width() {
        for value in [
            AMQPValue::ShortShortUInt(3),
            AMQPValue::ShortInt(3),
            AMQPValue::LongInt(3),
            AMQPValue::LongUInt(3),
            AMQPValue::LongLongInt(3),
            AMQPValue::LongString(LongString::from("3")),
        ] {
            let meta = RetryMetadata::from_headers(&headers(vec![(AMQP_HEADERS_RETRY_COUNT, value)]));
            assert_eq!(meta.retry_count, 3);
        }
    }

    #[test]
    fn test_from_headers_treats_garbage_counts_as_zero() {
        for value in [
            AMQPValue::LongLongInt(-4),
            AMQPValue::LongString(LongString::from("three")),
            AMQPValue::Boolean(true),
        ] {
            let meta = RetryMetadata::from_headers(&headers(vec![(AMQP_HEADERS_RETRY_COUNT, value)]));
            assert_eq!(meta.retry_count, 0);
        }
    }

    #[test]
    fn test_next_attempt_preserves_first_failure() {
        let ts = "2024-03-01T10:00:00.000Z";
        let meta = RetryMetadata::from_headers(&headers(vec![
            (AMQP_HEADERS_RETRY_COUNT, AMQPValue::LongLongInt(2)),
            (
                AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP,
                AMQPValue::LongString(LongString::from(ts)),
            ),
        ]));

        let next = meta.next_attempt("db timeout").next_attempt("db timeout again");

        assert_eq!(next.retry_count, 4);
        assert_eq!(next.first_failure_timestamp, ts);
        assert_eq!(next.last_error.as_deref(), Some("db timeout again"));
    }

    #[test]
    fn test_merge_into_keeps_foreign_headers() {
        let original = headers(vec![
            ("x-tenant", AMQPValue::LongString(LongString::from("acme"))),
            (AMQP_HEADERS_RETRY_COUNT, AMQPValue::LongLongInt(1)),
        ]);
        let meta = RetryMetadata::from_headers(&original).next_attempt("boom");

        let merged = meta.merge_into(&original);

        assert_eq!(
            merged.inner().get("x-tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
        assert_eq!(
            merged.inner().get(AMQP_HEADERS_RETRY_COUNT),
            Some(&AMQPValue::LongLongInt(2))
        );
        assert_eq!(
            merged.inner().get(AMQP_HEADERS_LAST_ERROR),
            Some(&AMQPValue::LongString(LongString::from("boom")))
        );
    }
}
