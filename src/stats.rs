//! Hit/miss and byte counters for one proxy session

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    uploaded_bytes: AtomicI64,
    downloaded_bytes: AtomicI64,
    hits: AtomicI64,
    misses: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uploaded_bytes: i64,
    pub downloaded_bytes: i64,
    pub hits: i64,
    pub misses: i64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_upload_bytes(&self, bytes: i64) {
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download_bytes(&self, bytes: i64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
