//! Read-only progress reporting
//!
//! The reporter polls the store for the remaining unit count on a fixed
//! interval and extrapolates a time-remaining estimate. It never writes and
//! its errors are logged, never returned.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::WorkStatusStore;

/// Progress at one point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub remaining: u64,
    pub completed: u64,
    pub elapsed: Duration,
    /// Units completed per second since the reporter started
    pub rate_per_sec: f64,
    /// `None` when nothing has completed yet
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn compute(initial_remaining: u64, remaining: u64, elapsed: Duration) -> Self {
        let completed = initial_remaining.saturating_sub(remaining);
        let secs = elapsed.as_secs_f64();
        let rate_per_sec = if secs > 0.0 {
            completed as f64 / secs
        } else {
            0.0
        };
        let eta = (rate_per_sec > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate_per_sec));
        Self {
            remaining,
            completed,
            elapsed,
            rate_per_sec,
            eta,
        }
    }

    pub fn eta_display(&self) -> String {
        match self.eta {
            Some(eta) => format_hms(eta),
            None => "infinite".to_string(),
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total left: {}, total completed: {}, rate: {:.2}/s, time left: {}, time so far: {}",
            self.remaining,
            self.completed,
            self.rate_per_sec,
            self.eta_display(),
            format_hms(self.elapsed)
        )
    }
}

/// Format as `H:MM:SS.s`
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;
    format!("{}:{:02}:{:04.1}", hours as u64, minutes as u64, seconds)
}

/// Counters kept by a finished reporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub reports: u32,
    pub errors: u32,
}

pub struct ProgressReporter {
    store: Arc<dyn WorkStatusStore>,
    scenario_ids: Vec<String>,
    interval: Duration,
    quiet: bool,
}

impl ProgressReporter {
    pub fn new(
        store: Arc<dyn WorkStatusStore>,
        scenario_ids: Vec<String>,
        interval: Duration,
        quiet: bool,
    ) -> Self {
        Self {
            store,
            scenario_ids,
            interval,
            quiet,
        }
    }

    async fn remaining(&self) -> Result<u64> {
        let mut total = 0;
        for scenario_id in &self.scenario_ids {
            total += self.store.count_remaining(scenario_id).await?;
        }
        Ok(total)
    }

    fn progress_bar(&self, len: u64) -> Option<ProgressBar> {
        if self.quiet {
            return None;
        }
        let bar = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Units: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) | ETA {msg}")
            .map(|style| style.progress_chars("=>-"));
        match style {
            Ok(style) => bar.set_style(style),
            Err(e) => warn!("Invalid progress bar template: {}", e),
        }
        Some(bar)
    }

    /// Report until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> ReporterStats {
        let start = Instant::now();
        let mut stats = ReporterStats::default();
        let mut initial: Option<u64> = None;
        let mut bar: Option<ProgressBar> = None;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let remaining = match self.remaining().await {
                Ok(remaining) => remaining,
                Err(e) => {
                    stats.errors += 1;
                    warn!("Progress reporter could not read the work status store: {:#}", e);
                    continue;
                }
            };

            // The first successful read is the baseline
            let Some(baseline) = initial else {
                initial = Some(remaining);
                bar = self.progress_bar(remaining);
                continue;
            };

            let snapshot = ProgressSnapshot::compute(baseline, remaining, start.elapsed());
            stats.reports += 1;
            match &bar {
                Some(bar) => {
                    bar.set_position(snapshot.completed);
                    bar.set_message(snapshot.eta_display());
                    bar.suspend(|| info!("{}", snapshot));
                }
                None => info!("{}", snapshot),
            }
        }

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RetryPolicy, ScheduledUnit, StatusDb, StatusUpdate, UnitKey, WorkStatus};
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_rate_and_eta() {
        let snapshot = ProgressSnapshot::compute(100, 40, Duration::from_secs(60));
        assert_eq!(snapshot.completed, 60);
        assert!((snapshot.rate_per_sec - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_zero_rate_is_infinite_eta() {
        let snapshot = ProgressSnapshot::compute(100, 100, Duration::from_secs(60));
        assert_eq!(snapshot.eta, None);
        assert_eq!(snapshot.eta_display(), "infinite");
        let at_start = ProgressSnapshot::compute(100, 90, Duration::ZERO);
        assert_eq!(at_start.eta, None);
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_millis(3_725_500)), "1:02:05.5");
        assert_eq!(format_hms(Duration::from_secs(59)), "0:00:59.0");
    }

    #[tokio::test]
    async fn test_reporter_counts_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StatusDb::new(
            dir.path().join("work_status.sqlite"),
            RetryPolicy::default(),
        ));
        store.create_schema_if_absent().await.unwrap();
        let units: Vec<ScheduledUnit> = (0..4)
            .map(|i| ScheduledUnit {
                key: UnitKey::new("s1", format!("w_{i}")),
                watershed_area: 1.0,
            })
            .collect();
        store.insert_scheduled(&units).await.unwrap();

        let token = CancellationToken::new();
        let reporter =
            ProgressReporter::new(store.clone(), vec!["s1".to_string()], Duration::from_millis(10), true);
        let handle = tokio::spawn(reporter.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .update_status_batch(&[StatusUpdate {
                status: WorkStatus::Complete,
                key: UnitKey::new("s1", "w_0"),
            }])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(stats.reports >= 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_reporter_survives_store_errors() {
        let dir = TempDir::new().unwrap();
        // never created, read-only opens fail
        let store = Arc::new(StatusDb::new(dir.path().join("missing.sqlite"), RetryPolicy::default()));
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new(store, vec!["s1".to_string()], Duration::from_millis(5), true);
        let handle = tokio::spawn(reporter.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        token.cancel();
        let stats = handle.await.unwrap();
        assert!(stats.errors >= 1);
        assert_eq!(stats.reports, 0);
    }
}
