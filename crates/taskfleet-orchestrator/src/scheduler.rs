use crate::service::FleetService;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use taskfleet_core::{FleetError, FleetResult};
use tracing::{info, warn};

/// Default daily-summary schedule: 09:00 UTC, 7-field cron.
const DAILY_SUMMARY_CRON: &str = "0 0 9 * * * *";

/// Background driver for the health cadence and the daily summary.
///
/// Hosts that bring their own timer skip this and call
/// [`FleetService::run_health_cycle`] directly; the cycle itself is
/// re-entrant either way.
pub struct HeartbeatScheduler {
    interval: std::time::Duration,
    summary_cron: String,
}

impl HeartbeatScheduler {
    /// Create a scheduler using the service's configured cadence.
    pub fn new(interval_minutes: i64) -> Self {
        Self {
            interval: std::time::Duration::from_secs(interval_minutes.max(1) as u64 * 60),
            summary_cron: DAILY_SUMMARY_CRON.to_string(),
        }
    }

    /// Override the summary schedule with a 7-field cron expression.
    pub fn with_summary_cron(mut self, cron_expr: impl Into<String>) -> Self {
        self.summary_cron = cron_expr.into();
        self
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    pub fn parse_cron(cron_expr: &str) -> FleetResult<Schedule> {
        Schedule::from_str(cron_expr)
            .map_err(|e| FleetError::Config(format!("invalid cron expression '{cron_expr}': {e}")))
    }

    /// Next fire time for a cron expression, after now.
    pub fn next_fire_time(cron_expr: &str) -> FleetResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(cron_expr)?;
        schedule.upcoming(Utc).next().ok_or_else(|| {
            FleetError::Config(format!(
                "cron expression '{cron_expr}' has no upcoming fire times"
            ))
        })
    }

    /// Start the background loop: one health cycle per interval tick, plus
    /// the daily fleet summary when its cron entry comes due.
    pub fn start(self, service: Arc<FleetService>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_summary = match Self::next_fire_time(&self.summary_cron) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(error = %e, "invalid summary cron, daily summary disabled");
                    None
                }
            };

            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so a freshly
            // started scheduler waits one full interval.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let report = service.run_health_cycle().await;
                info!(
                    events = report.events.len(),
                    failures = report.partial_failures.len(),
                    "scheduled health cycle done"
                );

                if let Some(due) = next_summary {
                    if Utc::now() >= due {
                        match service.fleet_summary().await {
                            Ok(summary) => {
                                info!(
                                    agents = summary.agents.total,
                                    tasks = summary.tasks.total,
                                    success_rate = summary.tasks.success_rate,
                                    "daily fleet summary"
                                );
                            }
                            Err(e) => warn!(error = %e, "daily summary failed"),
                        }
                        next_summary = Self::next_fire_time(&self.summary_cron).ok();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_cron() {
        assert!(HeartbeatScheduler::parse_cron(DAILY_SUMMARY_CRON).is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        assert!(HeartbeatScheduler::parse_cron("not a cron expression").is_err());
    }

    #[test]
    fn test_next_fire_time_is_future() {
        let next = HeartbeatScheduler::next_fire_time("0 * * * * * *").unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn test_interval_floor() {
        let scheduler = HeartbeatScheduler::new(0);
        assert_eq!(scheduler.interval, std::time::Duration::from_secs(60));
    }
}
