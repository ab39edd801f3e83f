//! Usage accounting for token consumption and call latency
//!
//! A [`UsageLedger`] observes every completed model call. Cumulative
//! counters use atomic increments so independent sessions can record
//! concurrently without losing updates; the per-call log is append-only.
//! The ledger is mutated only through [`UsageLedger::record`]; everything
//! else is read-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Result;

/// Token usage for a single model call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// One entry in the append-only call log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub usage: Usage,
    pub latency_ms: u64,
    pub ok: bool,
}

impl CallRecord {
    pub fn new(model: impl Into<String>, usage: Usage, latency: Duration, ok: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            model: model.into(),
            usage,
            latency_ms: latency.as_millis() as u64,
            ok,
        }
    }
}

/// Read-only view of the cumulative totals
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub calls: u64,
}

/// Cumulative usage counters plus the per-call log.
///
/// Shared between sessions behind an `Arc`; `record` is the single
/// mutation entry point.
#[derive(Debug, Default)]
pub struct UsageLedger {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    calls: AtomicU64,
    log: Mutex<Vec<CallRecord>>,
}

/// Serialized form produced by [`UsageLedger::export_json`]
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageExport {
    pub totals: UsageSnapshot,
    pub records: Vec<CallRecord>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call. Invoked by the executor exactly once per
    /// call that reached the provider.
    pub fn record(&self, record: CallRecord) {
        self.prompt_tokens
            .fetch_add(record.usage.prompt_tokens, Ordering::SeqCst);
        self.completion_tokens
            .fetch_add(record.usage.completion_tokens, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.push(record);
    }

    /// Read-only snapshot of the cumulative totals
    pub fn snapshot(&self) -> UsageSnapshot {
        let prompt_tokens = self.prompt_tokens.load(Ordering::SeqCst);
        let completion_tokens = self.completion_tokens.load(Ordering::SeqCst);
        UsageSnapshot {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            calls: self.calls.load(Ordering::SeqCst),
        }
    }

    /// Export totals and the full call log as JSON
    pub fn export_json(&self) -> Result<String> {
        let records = {
            let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.clone()
        };
        let export = UsageExport {
            totals: self.snapshot(),
            records,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }
}
