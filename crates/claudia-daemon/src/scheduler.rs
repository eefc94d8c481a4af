//! Scheduler
//!
//! Cron-style and interval jobs on the daemon's tokio runtime. Cron jobs
//! compute the next local fire time and sleep until it; interval jobs tick
//! on a fixed period. Every job logs and swallows its own errors so one
//! failing job never takes down another, and each run appends a metric.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, TimeZone, Weekday};
use claudia_core::VaultSync;
use tracing::{error, info};

use crate::services::Services;

/// Job identifiers accepted by `trigger`.
pub const JOB_IDS: &[&str] = &[
    "daily_decay",
    "pattern_detection",
    "full_consolidation",
    "daily_backup",
    "weekly_backup",
    "vault_sync",
    "verify",
];

pub struct Scheduler {
    services: Arc<Services>,
    vault_dir: PathBuf,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(services: Arc<Services>, vault_dir: PathBuf) -> Self {
        Self {
            services,
            vault_dir,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn every job task. Tasks are cooperative: they check the running
    /// flag at phase boundaries and stop quietly on shutdown.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.spawn_cron("daily_decay", 2, 0, None);
        self.spawn_cron("daily_backup", 2, 30, None);
        self.spawn_cron("weekly_backup", 2, 45, Some(Weekday::Sun));
        self.spawn_cron("full_consolidation", 3, 0, None);
        if self.services.config.vault_sync_enabled {
            self.spawn_cron("vault_sync", 3, 15, None);
        }

        let pattern_hours = self.services.config.pattern_detection_interval_hours.max(1);
        self.spawn_interval("pattern_detection", Duration::from_secs(pattern_hours * 3600));
        let verify_seconds = self.services.config.verify_interval_seconds.max(10);
        self.spawn_interval("verify", Duration::from_secs(verify_seconds));

        info!("scheduler started ({} jobs)", JOB_IDS.len());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    /// Run a job immediately, off the request path.
    pub fn trigger(self: &Arc<Self>, job_id: &str) -> bool {
        if !JOB_IDS.contains(&job_id) {
            return false;
        }
        let scheduler = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || scheduler.run_job(&job_id));
        true
    }

    fn spawn_cron(self: &Arc<Self>, job_id: &'static str, hour: u32, minute: u32, weekday: Option<Weekday>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = seconds_until(hour, minute, weekday);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                if !scheduler.is_running() {
                    break;
                }
                let inner = Arc::clone(&scheduler);
                let _ = tokio::task::spawn_blocking(move || inner.run_job(job_id)).await;
            }
        });
    }

    fn spawn_interval(self: &Arc<Self>, job_id: &'static str, period: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                if !scheduler.is_running() {
                    break;
                }
                let inner = Arc::clone(&scheduler);
                let _ = tokio::task::spawn_blocking(move || inner.run_job(job_id)).await;
            }
        });
    }

    fn run_job(&self, job_id: &str) {
        let started = std::time::Instant::now();
        let outcome: Result<(), String> = match job_id {
            "daily_decay" => self
                .services
                .consolidator
                .run_decay()
                .map(|counts| {
                    info!(
                        memories = counts.memories,
                        entities = counts.entities,
                        "daily decay complete"
                    )
                })
                .map_err(|e| e.to_string()),
            "pattern_detection" => self
                .services
                .consolidator
                .detect_patterns()
                .map(|patterns| info!("pattern detection found {} patterns", patterns.len()))
                .map_err(|e| e.to_string()),
            "full_consolidation" => {
                let report = self.services.consolidator.run_full_consolidation();
                info!(
                    merged = report.merged,
                    patterns = report.patterns_detected,
                    "scheduled full consolidation complete"
                );
                Ok(())
            }
            "daily_backup" => self
                .services
                .store
                .backup("daily")
                .map(|path| info!("daily backup created: {}", path.display()))
                .map_err(|e| e.to_string()),
            "weekly_backup" => self
                .services
                .store
                .backup("weekly")
                .map(|path| info!("weekly backup created: {}", path.display()))
                .map_err(|e| e.to_string()),
            "vault_sync" => {
                let vault = VaultSync::new(self.services.store.clone(), self.vault_dir.clone());
                vault
                    .run_sync()
                    .map(|report| {
                        info!(
                            written = report.written,
                            edited = report.edited_preserved,
                            "vault sync complete"
                        )
                    })
                    .map_err(|e| e.to_string())
            }
            "verify" => self
                .services
                .verifier
                .run_verification()
                .map(|stats| {
                    if stats.verified + stats.flagged + stats.contradicts > 0 {
                        info!(
                            verified = stats.verified,
                            flagged = stats.flagged,
                            "verification tick complete"
                        );
                    }
                })
                .map_err(|e| e.to_string()),
            other => {
                error!("unknown job id: {}", other);
                return;
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as f64;
        let _ = self
            .services
            .store
            .record_metric(&format!("job.{}.duration_ms", job_id), elapsed_ms);

        if let Err(e) = outcome {
            error!("job {} failed: {}", job_id, e);
        }
    }
}

/// Seconds until the next local occurrence of hour:minute (optionally on a
/// specific weekday).
fn seconds_until(hour: u32, minute: u32, weekday: Option<Weekday>) -> u64 {
    let now = Local::now();
    let mut candidate = Local
        .with_ymd_and_hms(now.year(), now.month(), now.day(), hour, minute, 0)
        .single()
        .unwrap_or(now);

    while candidate <= now || weekday.map(|w| candidate.weekday() != w).unwrap_or(false) {
        candidate += chrono::Duration::days(1);
    }

    (candidate - now).num_seconds().max(1) as u64
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn seconds_until_is_always_in_the_future() {
        let wait = seconds_until(2, 0, None);
        assert!(wait >= 1);
        assert!(wait <= 24 * 3600);

        let weekly = seconds_until(2, 45, Some(Weekday::Sun));
        assert!(weekly >= 1);
        assert!(weekly <= 8 * 24 * 3600);
    }

    #[tokio::test]
    async fn trigger_accepts_known_jobs_only() {
        let (services, dir) = test_services();
        let scheduler = Arc::new(Scheduler::new(services, dir.path().join("vault")));

        assert!(scheduler.trigger("daily_decay"));
        assert!(scheduler.trigger("verify"));
        assert!(!scheduler.trigger("no_such_job"));

        // Let spawned blocking jobs finish against the temp store
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn start_and_stop_toggle_running() {
        let (services, dir) = test_services();
        let scheduler = Arc::new(Scheduler::new(services, dir.path().join("vault")));
        assert!(!scheduler.is_running());

        scheduler.start();
        assert!(scheduler.is_running());

        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn manual_backup_job_writes_a_file() {
        let (services, dir) = test_services();
        let scheduler = Arc::new(Scheduler::new(services, dir.path().join("vault")));

        scheduler.run_job("daily_backup");

        let backups = dir.path().join("backups");
        let count = std::fs::read_dir(&backups)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(count, 1);
    }
}
