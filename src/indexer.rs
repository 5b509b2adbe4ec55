//! Indexing orchestration.
//!
//! Coordinates one full pass: scan → normalize → write → citation rebuild →
//! commit. Exactly one transaction spans the write and citation stages; the
//! citation builder is invoked with its own transaction management turned
//! off because the store rejects nesting. The last-scan watermark lives in
//! a sibling JSON file and only advances after a successful commit, so a
//! failed run never loses data or skips files on the next attempt.
//!
//! Triggering: a one-shot `run`, a recurring cron-style schedule, and a
//! filesystem watcher with a reset-on-event debounce window. Runs never
//! overlap — a trigger that fires while a run is in flight is rejected.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use notify::{recommended_watcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::citations;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Document, Source};
use crate::normalize;
use crate::scanner;
use crate::store::DocumentStore;

/// Singleton state describing the last completed scan. Persisted outside
/// the document store so a corrupted index cannot take it down too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingState {
    pub last_scan_time: String,
}

/// Statistics for one completed indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub scanned: usize,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub citations: usize,
    pub elapsed_ms: u128,
}

pub struct Indexer {
    config: Config,
    store: Arc<DocumentStore>,
    state_path: PathBuf,
    run_lock: tokio::sync::Mutex<()>,
    #[cfg(test)]
    fail_before_commit: std::sync::atomic::AtomicBool,
}

impl Indexer {
    pub fn new(config: Config, store: Arc<DocumentStore>) -> Self {
        let state_path = config.db.state_path();
        Self {
            config,
            store,
            state_path,
            run_lock: tokio::sync::Mutex::new(()),
            #[cfg(test)]
            fail_before_commit: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Execute one full indexing pass. Errors with [`Error::RunInFlight`]
    /// if another run holds the lock.
    pub async fn run(&self, force: bool) -> Result<RunStats> {
        let _guard = self.run_lock.try_lock().map_err(|_| Error::RunInFlight)?;
        let started = std::time::Instant::now();

        let last_scan = load_state(&self.state_path)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s.last_scan_time).ok())
            .map(|t| t.with_timezone(&Utc));

        debug!(force, "scanning archive roots");
        let known_ids: HashSet<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let outcome = scanner::scan(
            &self.config.archive.research_root,
            &self.config.archive.url_content_root,
            last_scan,
            force,
            &known_ids,
        )?;
        let scanned = outcome.documents.len();

        debug!(count = scanned, "normalizing documents");
        let normalized = normalize::process_batch(outcome.documents).await;

        self.store.begin().await?;
        match self.write_phase(&normalized, &outcome.deleted_ids).await {
            Ok((added, updated, citation_count)) => {
                self.store.commit().await?;
                save_state(
                    &self.state_path,
                    &IndexingState {
                        last_scan_time: outcome.scan_time.to_rfc3339(),
                    },
                )?;

                let stats = RunStats {
                    scanned,
                    added,
                    updated,
                    deleted: outcome.deleted_ids.len() as u64,
                    citations: citation_count,
                    elapsed_ms: started.elapsed().as_millis(),
                };
                info!(
                    scanned = stats.scanned,
                    added = stats.added,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    citations = stats.citations,
                    elapsed_ms = stats.elapsed_ms,
                    "indexing run complete"
                );
                Ok(stats)
            }
            Err(e) => {
                if let Err(rb) = self.store.rollback().await {
                    warn!(error = %rb, "rollback after failed run also failed");
                }
                Err(e)
            }
        }
    }

    /// Writing and citation building, inside the ambient transaction.
    async fn write_phase(
        &self,
        normalized: &[Document],
        deleted_ids: &[String],
    ) -> Result<(u64, u64, usize)> {
        let mut added = 0u64;
        let mut updated = 0u64;

        for doc in normalized {
            let outcome = self.store.upsert(doc).await?;
            if outcome.added {
                added += 1;
            } else {
                updated += 1;
            }
        }

        for id in deleted_ids {
            self.store.delete(id).await?;
        }

        // Citation graph is regenerated from the current document set, not
        // incrementally patched. The read below goes through the ambient
        // transaction and sees this run's writes.
        debug!("rebuilding citation graph");
        let all_docs = self.store.list().await?;
        let research: Vec<Document> = all_docs
            .iter()
            .filter(|d| d.source == Source::Research)
            .cloned()
            .collect();
        let pages: Vec<Document> = all_docs
            .iter()
            .filter(|d| d.source == Source::UrlContent)
            .cloned()
            .collect();

        let built = citations::build(&research, &pages, &all_docs);
        let rebuilt_ids: Vec<String> = all_docs.iter().map(|d| d.id.clone()).collect();

        #[cfg(test)]
        if self
            .fail_before_commit
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::Store("injected failure before commit".to_string()));
        }

        let citation_count =
            citations::persist(&self.store, &rebuilt_ids, &built, false).await?;

        Ok((added, updated, citation_count))
    }

    /// Watch both archive roots and run after each quiet period. A burst
    /// of events coalesces into one run: the timer resets on every event
    /// and fires only once nothing has changed for the debounce window.
    /// Returns when the shutdown signal fires; the watcher is dropped on
    /// return, so no callbacks outlive this call.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event.paths);
            }
        })?;

        for root in [
            &self.config.archive.research_root,
            &self.config.archive.url_content_root,
        ] {
            if root.is_dir() {
                watcher.watch(root, RecursiveMode::Recursive)?;
                info!(root = %root.display(), "watching");
            } else {
                warn!(root = %root.display(), "archive root missing, not watching");
            }
        }

        let debounce = Duration::from_secs(self.config.indexer.debounce_secs);
        let mut pending = false;

        loop {
            if !pending {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => match event {
                        Some(_) => pending = true,
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => {
                        // Timer resets by looping with pending still set.
                        if event.is_none() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(debounce) => {
                        pending = false;
                        self.run_from_trigger("watch").await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Run on a recurring cron-style schedule until shutdown.
    pub async fn run_scheduled(
        &self,
        schedule: &CronSchedule,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let now = Utc::now();
            let next = schedule.next_fire(now);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.to_rfc3339(), "next scheduled indexing run");

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {
                    self.run_from_trigger("schedule").await;
                }
            }
        }
        Ok(())
    }

    // Trigger-driven runs report failures to the log and keep going; they
    // are never retried within the same trigger.
    async fn run_from_trigger(&self, trigger: &str) {
        match self.run(false).await {
            Ok(stats) => {
                debug!(trigger, scanned = stats.scanned, "triggered run finished");
            }
            Err(Error::RunInFlight) => {
                warn!(trigger, "indexing run already in flight, trigger dropped");
            }
            Err(e) => {
                warn!(trigger, error = %e, "triggered indexing run failed");
            }
        }
    }

    #[cfg(test)]
    fn inject_failure_before_commit(&self) {
        self.fail_before_commit
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

// ============ Cron-style scheduling ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronField {
    Any,
    Step(u32),
    Exact(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(n) => value % n == 0,
            CronField::Exact(v) => value == *v,
        }
    }
}

/// Restricted five-field cron expression: minute and hour accept `*`,
/// `*/n`, or a fixed value; day, month, and weekday must be `*`.
/// Malformed expressions are rejected at setup time, never at fire time.
#[derive(Debug, Clone, Copy)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Scheduling(format!(
                "expected 5 cron fields, got {} in '{}'",
                fields.len(),
                expr
            )));
        }
        for field in &fields[2..] {
            if *field != "*" {
                return Err(Error::Scheduling(format!(
                    "unsupported cron field '{}': day, month, and weekday must be '*'",
                    field
                )));
            }
        }
        Ok(Self {
            minute: parse_cron_field(fields[0], 59)?,
            hour: parse_cron_field(fields[1], 23)?,
        })
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute()) && self.hour.matches(t.hour())
    }

    /// First matching minute strictly after `after`. A (minute, hour)
    /// schedule always fires within 24 hours.
    pub fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let ts = after.timestamp();
        let mut t = DateTime::<Utc>::from_timestamp(ts - ts.rem_euclid(60) + 60, 0)
            .unwrap_or(after);
        for _ in 0..=24 * 60 {
            if self.matches(t) {
                return t;
            }
            t = t + ChronoDuration::minutes(1);
        }
        t
    }
}

fn parse_cron_field(field: &str, max: u32) -> Result<CronField> {
    if field == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| Error::Scheduling(format!("invalid cron step '{}'", field)))?;
        if n == 0 || n > max {
            return Err(Error::Scheduling(format!("cron step out of range: '{}'", field)));
        }
        return Ok(CronField::Step(n));
    }
    let value: u32 = field
        .parse()
        .map_err(|_| Error::Scheduling(format!("invalid cron field '{}'", field)))?;
    if value > max {
        return Err(Error::Scheduling(format!(
            "cron value {} out of range (max {})",
            value, max
        )));
    }
    Ok(CronField::Exact(value))
}

// ============ Watermark persistence ============

pub fn load_state(path: &Path) -> Result<Option<IndexingState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    match serde_json::from_str(&raw) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            // A mangled state file costs one full rescan, nothing more.
            warn!(path = %path.display(), error = %e, "unreadable indexing state, treating as first run");
            Ok(None)
        }
    }
}

pub fn save_state(path: &Path, state: &IndexingState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}
