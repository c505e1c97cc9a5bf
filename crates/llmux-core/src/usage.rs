use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Token usage extracted from a provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDetail {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

impl UsageDetail {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub auth_id: String,
    pub auth_label: String,
    pub success: bool,
    pub detail: UsageDetail,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Sink that logs usage through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::debug!(
            provider = %record.provider,
            model = %record.model,
            auth = %record.auth_id,
            success = record.success,
            input = record.detail.input_tokens,
            output = record.detail.output_tokens,
            total = record.detail.total_tokens,
            "usage"
        );
    }
}

/// In-memory sink for tests and the management surface.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().expect("usage sink lock").clone()
    }
}

impl UsageSink for MemoryUsageSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().expect("usage sink lock").push(record);
    }
}

/// Per-request usage accumulator.
///
/// Publishes at most once: the first `publish` with real usage wins, and
/// `publish_failure` emits a synthetic failed record only when nothing has
/// been published yet, so downstream accounting is never silent.
pub struct UsageReporter {
    provider: String,
    model: String,
    auth_id: String,
    auth_label: String,
    sink: Arc<dyn UsageSink>,
    published: AtomicBool,
}

impl UsageReporter {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        auth: &crate::auth::Auth,
        sink: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            auth_id: auth.id.clone(),
            auth_label: auth.label.clone(),
            sink,
            published: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, detail: UsageDetail) {
        if detail.is_empty() {
            return;
        }
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.record(self.record(true, detail));
    }

    pub fn publish_failure(&self) {
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.record(self.record(false, UsageDetail::default()));
    }

    /// Publishes an empty success record if nothing was published; used by
    /// endpoints whose responses legitimately carry no usage.
    pub fn ensure_published(&self) {
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.record(self.record(true, UsageDetail::default()));
    }

    pub fn has_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    fn record(&self, success: bool, detail: UsageDetail) -> UsageRecord {
        UsageRecord {
            provider: self.provider.clone(),
            model: self.model.clone(),
            auth_id: self.auth_id.clone(),
            auth_label: self.auth_label.clone(),
            success,
            detail,
            at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;

    fn reporter(sink: Arc<MemoryUsageSink>) -> UsageReporter {
        let auth = Auth::new("auth-1", "codex");
        UsageReporter::new("codex", "gpt-5", &auth, sink)
    }

    #[test]
    fn publishes_first_nonempty_usage_once() {
        let sink = Arc::new(MemoryUsageSink::new());
        let rep = reporter(Arc::clone(&sink));
        rep.publish(UsageDetail::default());
        assert!(!rep.has_published());

        rep.publish(UsageDetail {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            ..Default::default()
        });
        rep.publish(UsageDetail {
            input_tokens: 9,
            ..Default::default()
        });
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].detail.input_tokens, 1);
        assert!(records[0].success);
    }

    #[test]
    fn failure_is_synthesized_only_without_prior_publish() {
        let sink = Arc::new(MemoryUsageSink::new());
        let rep = reporter(Arc::clone(&sink));
        rep.publish_failure();
        rep.publish_failure();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);

        let sink = Arc::new(MemoryUsageSink::new());
        let rep = reporter(Arc::clone(&sink));
        rep.publish(UsageDetail {
            input_tokens: 1,
            ..Default::default()
        });
        rep.publish_failure();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
    }
}
