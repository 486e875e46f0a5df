use std::time::Duration;

use serde::Serialize;

/// Counts and durations of one retrieval, returned with its result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchMetrics {
    pub requests: u64,
    pub pages: u64,
    pub batches: u64,
    pub failed_batches: u64,
    pub fragments: u64,
    pub extracted: u64,
    pub fetch_ms: u64,
    pub extract_ms: u64,
}

impl FetchMetrics {
    pub fn merge(&mut self, other: &FetchMetrics) {
        self.requests += other.requests;
        self.pages += other.pages;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.fragments += other.fragments;
        self.extracted += other.extracted;
        self.fetch_ms += other.fetch_ms;
        self.extract_ms += other.extract_ms;
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
