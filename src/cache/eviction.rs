//! Eviction protocol: two cooperating background tasks.
//!
//! The *scanner* runs a full index scan on `max_scan_interval_seconds`,
//! sums sizes, re-truths the running size counter, sorts ascending by
//! `timestamp`, and hands the sorted slice to the *evictor*. The evictor
//! wakes every 15 seconds and, while the running size exceeds the limit,
//! deletes entries from the head of the handed-off slice until the running
//! size drops under the limit or its own per-pass time budget runs out.
//!
//! Scanning the full index is I/O-heavy; doing it once per interval and
//! draining against a snapshot avoids repeated scans and holding the index
//! locked during deletion. Staleness of the snapshot is tolerable because
//! entries evicted after being re-touched since the scan are the oldest
//! ones anyway, and `timestamp` is refreshed on read.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::sleep;

use super::ContentStore;
use crate::logging::format_bytes_iec;

const EVICTOR_WAKE_INTERVAL: Duration = Duration::from_secs(15);

/// Runs the scanner loop until `running` is observed false. Intended to be
/// spawned as its own task by the supervisor.
pub async fn run_scanner(
    store: Arc<ContentStore>,
    snapshot: Arc<Mutex<Vec<String>>>,
    scan_interval: Duration,
    scan_time_budget: Duration,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let entries = store.scan(scan_time_budget);
        let total: u64 = entries.iter().map(|e| e.size).sum();
        store.running_size_store(total);

        let mut sorted = entries;
        sorted.sort_by_key(|e| e.timestamp);
        let hashes: Vec<String> = sorted.into_iter().map(|e| e.hash).collect();

        tracing::debug!(
            size = %format_bytes_iec(total),
            limit = %format_bytes_iec(store.limit_bytes()),
            entries = hashes.len(),
            "cache scan complete"
        );

        *snapshot.lock() = hashes;

        sleep(scan_interval).await;
    }
}

/// Runs the evictor loop until `running` is observed false.
pub async fn run_evictor(
    store: Arc<ContentStore>,
    snapshot: Arc<Mutex<Vec<String>>>,
    per_pass_budget: Duration,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        sleep(EVICTOR_WAKE_INTERVAL).await;

        if store.running_size() <= store.limit_bytes() {
            continue;
        }

        let deadline = tokio::time::Instant::now() + per_pass_budget;
        loop {
            if store.running_size() < store.limit_bytes() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            let next = {
                let mut guard = snapshot.lock();
                if guard.is_empty() { None } else { Some(guard.remove(0)) }
            };

            let Some(hash) = next else {
                break;
            };

            store.delete(&hash).await;
        }

        tracing::info!(
            size = %format_bytes_iec(store.running_size()),
            limit = %format_bytes_iec(store.limit_bytes()),
            "eviction pass complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layout::Fingerprint;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn evictor_drains_oldest_first_until_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path().to_path_buf(), 30, 3600).unwrap());

        let mut hashes = Vec::new();
        for i in 0..10u8 {
            let fp = Fingerprint::parse(
                "data",
                "0123456789abcdef0123456789abcdef",
                &format!("{i}.jpg"),
            )
            .unwrap();
            store.set(&fp, 1_700_000_000 + i as i64, b"12345").await;
            hashes.push(fp.hash());
        }
        store.running_size_store(50);

        let snapshot = Arc::new(Mutex::new(hashes));
        let running = Arc::new(AtomicBool::new(true));

        // Drive one evictor pass directly rather than spawning + sleeping.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while store.running_size() >= store.limit_bytes() && tokio::time::Instant::now() < deadline {
            let next = {
                let mut guard = snapshot.lock();
                if guard.is_empty() { None } else { Some(guard.remove(0)) }
            };
            let Some(hash) = next else { break };
            store.delete(&hash).await;
        }

        assert!(store.running_size() < store.limit_bytes());
        let _ = running;
    }
}
