use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::operation::Operation;
use super::payload::{ImagePayload, ResponseData};

/// Opaque token linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues correlation ids for one channel.
///
/// Ids combine the issue time in milliseconds, a random suffix and a per-generator sequence
/// number, so two ids from the same generator never collide.
#[derive(Debug, Default)]
pub struct CorrelationIdGenerator {
    sequence: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CorrelationId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::thread_rng().gen();
        CorrelationId(format!(
            "{}-{:08x}-{}",
            Utc::now().timestamp_millis(),
            suffix,
            seq
        ))
    }
}

/// A request frame sent into an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: CorrelationId,
    pub operation: Operation,
    pub payload: ImagePayload,
    pub issued_at: DateTime<Utc>,
}

impl Request {
    pub fn new(id: CorrelationId, operation: Operation, payload: ImagePayload) -> Self {
        Self {
            id,
            operation,
            payload,
            issued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseOutcome {
    Success(ResponseData),
    Failure(String),
}

/// A response frame sent back out of an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    pub outcome: ResponseOutcome,
    /// Time spent inside the collaborator
    pub took_ms: u64,
}

impl Response {
    pub fn success(id: CorrelationId, data: ResponseData, took_ms: u64) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Success(data),
            took_ms,
        }
    }

    pub fn failure(id: CorrelationId, message: impl Into<String>, took_ms: u64) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Failure(message.into()),
            took_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique() {
        let generator = CorrelationIdGenerator::new();
        let ids: HashSet<_> = (0..1000).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
