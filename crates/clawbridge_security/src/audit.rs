//! Append-only JSON-lines audit log.

use crate::store::write_atomically;
use chrono::{DateTime, Duration, Timelike, Utc};
use clawbridge_core::{AuditQuery, AuditRecord, AuditResult, AuditStats, Clock, gateway_metrics};
use clawbridge_error::StorageError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, instrument, warn};

const TOP_ENTITIES: usize = 10;
const TOP_DENIED: usize = 10;
const TOP_IDENTITIES: usize = 5;

/// Audit log backed by one `audit.jsonl` file.
///
/// Recording never fails the request being audited: write errors are logged
/// and counted in [`write_failures`](Self::write_failures). While recording is
/// disabled, records are counted in [`skipped_records`](Self::skipped_records)
/// and logged at debug level instead of written.
///
/// Every access to the file, appends and rewrites alike, holds the `file` lock
/// for its whole read-modify-write.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    enabled: AtomicBool,
    file: Mutex<()>,
    failures: AtomicU64,
    skipped: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Log writing to `path`, created on the first record.
    pub fn new(path: impl Into<PathBuf>, enabled: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            enabled: AtomicBool::new(enabled),
            file: Mutex::new(()),
            failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            clock,
        }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether records are being written.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn recording on or off at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Audit logging toggled");
    }

    /// Writes that failed since startup.
    pub fn write_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Records dropped because recording was disabled.
    pub fn skipped_records(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Current time on the gateway clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Append one record on the calling thread.
    pub fn record(&self, record: &AuditRecord) {
        gateway_metrics().decision(*record.result());
        if !self.is_enabled() {
            gateway_metrics().audit_skipped();
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                entity_id = %record.entity_id(),
                result = %record.result(),
                skipped,
                "Audit disabled; record not written"
            );
            return;
        }
        if let Err(e) = self.append(record) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            gateway_metrics().audit_write_failed();
            error!(error = %e, entity_id = %record.entity_id(), "Failed to write audit record");
        }
    }

    /// Append one record from async code, with the file I/O on the blocking pool.
    ///
    /// Completes once the record is on disk (or its failure counted), so a
    /// query issued afterwards sees it.
    pub async fn write(self: &Arc<Self>, record: AuditRecord) {
        let log = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || log.record(&record)).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            gateway_metrics().audit_write_failed();
            error!(error = %e, "Audit writer task failed");
        }
    }

    fn append(&self, record: &AuditRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record).map_err(|e| {
            StorageError::new(clawbridge_error::StorageErrorKind::Serialization(e.to_string()))
        })?;
        line.push(b'\n');
        let _guard = self.file.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Every readable record in file order. Malformed lines are skipped.
    fn read_all(&self) -> Result<Vec<AuditRecord>, StorageError> {
        let _guard = self.file.lock();
        self.read_locked()
    }

    /// [`read_all`](Self::read_all) for callers already holding the file lock.
    fn read_locked(&self) -> Result<Vec<AuditRecord>, StorageError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => records.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "Skipped malformed audit lines");
        }
        Ok(records)
    }

    /// Matching records, newest first, capped at the query limit.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the log exists but cannot be read.
    #[instrument(skip(self))]
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, StorageError> {
        let records = self.read_all()?;
        let limit = query.effective_limit();
        Ok(records
            .into_iter()
            .rev()
            .filter(|record| query.matches(record))
            .take(limit)
            .collect())
    }

    /// Drop records older than `cutoff`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the log cannot be rewritten; the old file is kept.
    #[instrument(skip(self))]
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let _guard = self.file.lock();
        let records = self.read_locked()?;
        let before = records.len();
        let kept: Vec<&AuditRecord> = records.iter().filter(|r| *r.timestamp() >= cutoff).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        let mut bytes = Vec::new();
        for record in kept {
            if let Ok(line) = serde_json::to_vec(record) {
                bytes.extend_from_slice(&line);
                bytes.push(b'\n');
            }
        }
        write_atomically(&self.path, &bytes)?;
        info!(removed, "Pruned audit log");
        Ok(removed)
    }

    /// Drop records older than `days` days.
    ///
    /// # Errors
    ///
    /// See [`prune`](Self::prune).
    pub fn prune_retention(&self, days: u32) -> Result<usize, StorageError> {
        self.prune(self.clock.now() - Duration::days(i64::from(days)))
    }

    /// Delete every record.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be truncated.
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.file.lock();
        write_atomically(&self.path, &[])?;
        info!("Audit log cleared");
        Ok(())
    }

    /// Aggregate counts over the retained records.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the log exists but cannot be read.
    #[instrument(skip(self))]
    pub fn stats(&self) -> Result<AuditStats, StorageError> {
        let records = self.read_all()?;
        let now = self.clock.now();
        let day_ago = now - Duration::hours(24);
        let week_ago = now - Duration::days(7);
        let current_hour = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        let mut stats = AuditStats {
            total: records.len(),
            write_failures: self.write_failures(),
            ..AuditStats::default()
        };
        let mut entities: HashMap<&str, usize> = HashMap::new();
        let mut denied: HashMap<&str, usize> = HashMap::new();
        let mut identities: HashMap<&str, usize> = HashMap::new();
        let mut latency_total = 0u64;
        let mut forwarded_24h = 0usize;

        for record in &records {
            let result = *record.result();
            let at = *record.timestamp();
            *stats.by_result.entry(result).or_default() += 1;
            *entities.entry(record.entity_id()).or_default() += 1;
            *identities.entry(record.source_identity()).or_default() += 1;
            if result.is_refusal() {
                *denied.entry(record.entity_id()).or_default() += 1;
            }
            latency_total += *record.latency_ms();

            if at >= week_ago {
                stats.last_7d += 1;
            }
            if at >= day_ago {
                stats.last_24h += 1;
                *stats.by_result_24h.entry(result).or_default() += 1;
                if result.is_forwarded() {
                    forwarded_24h += 1;
                }
                let hours_back = (current_hour - at.min(current_hour)).num_hours();
                let bucket = if at >= current_hour { 0 } else { hours_back as usize + 1 };
                if let Some(slot) = stats.hourly.get_mut(bucket) {
                    *slot += 1;
                }
            }
        }

        if !records.is_empty() {
            stats.average_latency_ms = latency_total as f64 / records.len() as f64;
        }
        let decided_24h = stats.last_24h
            - stats.by_result_24h.get(&AuditResult::Pending).copied().unwrap_or(0);
        if decided_24h > 0 {
            let rate = forwarded_24h as f64 / decided_24h as f64 * 100.0;
            stats.success_rate_24h = Some((rate * 10.0).round() / 10.0);
        }
        stats.top_entities = top(entities, TOP_ENTITIES);
        stats.top_denied = top(denied, TOP_DENIED);
        stats.top_identities = top(identities, TOP_IDENTITIES);
        debug!(total = stats.total, last_24h = stats.last_24h, "Audit stats computed");
        Ok(stats)
    }
}

fn top(counts: HashMap<&str, usize>, n: usize) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(key, count)| (key.to_string(), count))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(n);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawbridge_core::ManualClock;

    fn log(dir: &tempfile::TempDir) -> (Arc<ManualClock>, AuditLog) {
        let start = "2026-03-02T12:30:00Z".parse().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        (clock.clone(), AuditLog::new(dir.path().join("audit.jsonl"), true, clock))
    }

    fn rec(at: DateTime<Utc>, entity: &str, result: AuditResult) -> AuditRecord {
        AuditRecord::new(at, entity, result, "10.0.0.1").with_latency_ms(10)
    }

    #[test]
    fn test_query_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        for i in 0..5 {
            log.record(&rec(clock.now() + Duration::seconds(i), &format!("light.l{}", i), AuditResult::Success));
        }
        let found = log.query(&AuditQuery::default().with_limit(2)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].entity_id(), "light.l4");
        assert_eq!(found[1].entity_id(), "light.l3");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        log.record(&rec(clock.now(), "light.a", AuditResult::Success));
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{not json\n").unwrap();
        log.record(&rec(clock.now(), "light.b", AuditResult::Denied));
        assert_eq!(log.query(&AuditQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        log.set_enabled(false);
        log.record(&rec(clock.now(), "light.a", AuditResult::Success));
        log.record(&rec(clock.now(), "light.b", AuditResult::Denied));
        assert!(!log.path().exists());
        assert_eq!(log.skipped_records(), 2);
        assert_eq!(log.write_failures(), 0);
    }

    #[test]
    fn test_unwritable_log_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        fs::create_dir(log.path()).unwrap();
        log.record(&rec(clock.now(), "light.a", AuditResult::Success));
        assert_eq!(log.write_failures(), 1);
    }

    #[tokio::test]
    async fn test_async_write_is_visible_once_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        let log = Arc::new(log);
        log.write(rec(clock.now(), "light.a", AuditResult::Success)).await;
        let found = log.query(&AuditQuery::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id(), "light.a");
    }

    #[test]
    fn test_prune_never_loses_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        let log = Arc::new(log);
        let now = clock.now();
        let old = now - Duration::days(40);
        const ROUNDS: usize = 200;

        let writer = {
            let log = log.clone();
            std::thread::spawn(move || {
                for i in 0..ROUNDS {
                    log.record(&rec(old, "light.old", AuditResult::Success));
                    log.record(&rec(now, &format!("light.n{}", i), AuditResult::Success));
                }
            })
        };
        let pruner = {
            let log = log.clone();
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    log.prune_retention(30).unwrap();
                }
            })
        };
        writer.join().unwrap();
        pruner.join().unwrap();
        log.prune_retention(30).unwrap();

        let left = log.query(&AuditQuery::default().with_limit(usize::MAX)).unwrap();
        assert_eq!(left.len(), ROUNDS);
        assert!(left.iter().all(|r| *r.timestamp() == now));
    }

    #[test]
    fn test_prune_drops_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        log.record(&rec(clock.now() - Duration::days(40), "light.old", AuditResult::Success));
        log.record(&rec(clock.now(), "light.new", AuditResult::Success));
        assert_eq!(log.prune_retention(30).unwrap(), 1);
        let left = log.query(&AuditQuery::default()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].entity_id(), "light.new");
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, log) = log(&dir);
        let now = clock.now();
        log.record(&rec(now, "lock.front", AuditResult::Denied));
        log.record(&rec(now, "lock.front", AuditResult::Denied));
        log.record(&rec(now, "light.a", AuditResult::Success));
        log.record(&rec(now - Duration::hours(2), "light.a", AuditResult::Clamped));
        log.record(&rec(now - Duration::days(3), "light.b", AuditResult::Error));

        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.last_24h, 4);
        assert_eq!(stats.last_7d, 5);
        assert_eq!(stats.hourly[0], 3);
        assert_eq!(stats.hourly[2], 1);
        assert_eq!(stats.top_denied, vec![("lock.front".to_string(), 2)]);
        assert_eq!(stats.top_entities[0].1, 2);
        assert_eq!(stats.success_rate_24h, Some(50.0));
        assert_eq!(stats.average_latency_ms, 10.0);
    }
}
