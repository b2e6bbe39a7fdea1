use crate::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};

/// How the delegation engine picks among ranked candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Highest adjusted score wins; ties broken by earliest heartbeat.
    /// Reproducible, the default.
    #[default]
    Deterministic,
    /// Score-weighted random draw among eligible candidates.
    Probabilistic,
}

/// Weight vector combining the four performance sub-scores into the overall
/// agent score. Must sum to 1.0; validated once at load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub success: f64,
    pub speed: f64,
    pub reliability: f64,
    pub confidence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: 0.4,
            speed: 0.2,
            reliability: 0.25,
            confidence: 0.15,
        }
    }
}

impl ScoreWeights {
    const EPSILON: f64 = 1e-6;

    /// Sum of all four weights.
    pub fn sum(&self) -> f64 {
        self.success + self.speed + self.reliability + self.confidence
    }

    fn validate(&self) -> FleetResult<()> {
        if (self.sum() - 1.0).abs() > Self::EPSILON {
            return Err(FleetError::Config(format!(
                "score weights must sum to 1.0, got {}",
                self.sum()
            )));
        }
        for (name, w) in [
            ("success", self.success),
            ("speed", self.speed),
            ("reliability", self.reliability),
            ("confidence", self.confidence),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(FleetError::Config(format!(
                    "weight '{name}' must be within [0, 1], got {w}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the whole orchestration core.
///
/// Constructed once at process start (from TOML or in code), validated with
/// [`FleetConfig::validate`], then passed by `Arc` into every component
/// constructor. There is no global lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// How often the health cycle runs, in minutes.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_minutes: i64,
    /// Minutes without a task update before the task counts as stalled.
    #[serde(default = "default_task_stalled_after")]
    pub task_stalled_after_minutes: i64,
    /// Minutes of runtime before a task is flagged as long-running.
    #[serde(default = "default_task_long_running_after")]
    pub task_long_running_after_minutes: i64,
    /// Minutes without a heartbeat before an agent counts as silent.
    #[serde(default = "default_agent_silent_after")]
    pub agent_silent_after_minutes: i64,
    /// Error-rate threshold (0.0–1.0) over the last ten outcomes.
    #[serde(default = "default_agent_high_error_rate")]
    pub agent_high_error_rate: f64,
    /// Default task timeout applied when a task spec gives none.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_minutes: i64,
    /// Reassignment budget per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delegation passes a task may sit unassignable before escalation.
    #[serde(default = "default_max_delegation_passes")]
    pub max_delegation_passes: u32,
    /// Minutes members have to vote on a proposal.
    #[serde(default = "default_vote_deadline")]
    pub vote_deadline_minutes: i64,
    /// Cross-team crosstalk/handoff budget per team pair, per hour.
    #[serde(default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: u32,
    /// Reference completion time for the speed sub-score.
    #[serde(default = "default_benchmark_task_minutes")]
    pub benchmark_task_minutes: f64,
    /// Sample count per window for trend detection.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    /// Hard deadline for a single health scan, in seconds.
    #[serde(default = "default_health_cycle_deadline")]
    pub health_cycle_deadline_seconds: u64,
    /// Candidate selection strategy for delegation.
    #[serde(default)]
    pub selection: SelectionStrategy,
    /// Sub-score weight vector; must sum to 1.0.
    #[serde(default)]
    pub weights: ScoreWeights,
}

fn default_heartbeat_interval() -> i64 {
    5
}
fn default_task_stalled_after() -> i64 {
    30
}
fn default_task_long_running_after() -> i64 {
    120
}
fn default_agent_silent_after() -> i64 {
    15
}
fn default_agent_high_error_rate() -> f64 {
    0.3
}
fn default_task_timeout() -> i64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_delegation_passes() -> u32 {
    5
}
fn default_vote_deadline() -> i64 {
    30
}
fn default_rate_limit_per_hour() -> u32 {
    10
}
fn default_benchmark_task_minutes() -> f64 {
    30.0
}
fn default_trend_window() -> usize {
    7
}
fn default_health_cycle_deadline() -> u64 {
    60
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_minutes: default_heartbeat_interval(),
            task_stalled_after_minutes: default_task_stalled_after(),
            task_long_running_after_minutes: default_task_long_running_after(),
            agent_silent_after_minutes: default_agent_silent_after(),
            agent_high_error_rate: default_agent_high_error_rate(),
            task_timeout_minutes: default_task_timeout(),
            max_retries: default_max_retries(),
            max_delegation_passes: default_max_delegation_passes(),
            vote_deadline_minutes: default_vote_deadline(),
            rate_limit_per_hour: default_rate_limit_per_hour(),
            benchmark_task_minutes: default_benchmark_task_minutes(),
            trend_window: default_trend_window(),
            health_cycle_deadline_seconds: default_health_cycle_deadline(),
            selection: SelectionStrategy::default(),
            weights: ScoreWeights::default(),
        }
    }
}

impl FleetConfig {
    /// Parse a configuration from a TOML string and validate it.
    pub fn from_toml_str(raw: &str) -> FleetResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| FleetError::Config(format!("invalid config TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all ranges and the weight vector. Fatal at load time.
    pub fn validate(&self) -> FleetResult<()> {
        self.weights.validate()?;
        Self::check_range(
            "heartbeat_interval_minutes",
            self.heartbeat_interval_minutes,
            1,
            60,
        )?;
        Self::check_range(
            "task_stalled_after_minutes",
            self.task_stalled_after_minutes,
            5,
            1440,
        )?;
        Self::check_range(
            "task_long_running_after_minutes",
            self.task_long_running_after_minutes,
            10,
            4320,
        )?;
        Self::check_range(
            "agent_silent_after_minutes",
            self.agent_silent_after_minutes,
            1,
            1440,
        )?;
        if !(0.0..=1.0).contains(&self.agent_high_error_rate) {
            return Err(FleetError::Config(format!(
                "agent_high_error_rate must be within [0, 1], got {}",
                self.agent_high_error_rate
            )));
        }
        if self.task_timeout_minutes < 1 {
            return Err(FleetError::Config(
                "task_timeout_minutes must be at least 1".to_string(),
            ));
        }
        if self.benchmark_task_minutes <= 0.0 {
            return Err(FleetError::Config(
                "benchmark_task_minutes must be positive".to_string(),
            ));
        }
        if self.trend_window == 0 {
            return Err(FleetError::Config(
                "trend_window must be at least 1".to_string(),
            ));
        }
        if self.vote_deadline_minutes < 1 {
            return Err(FleetError::Config(
                "vote_deadline_minutes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn check_range(name: &str, value: i64, min: i64, max: i64) -> FleetResult<()> {
        if !(min..=max).contains(&value) {
            return Err(FleetError::Config(format!(
                "{name} must be within [{min}, {max}], got {value}"
            )));
        }
        Ok(())
    }
}
