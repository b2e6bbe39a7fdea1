use taskfleet_core::{AgentMetrics, AgentScore, ScoreWeights, Trend};

/// Computes 0–100 performance scores from an agent's rolling metrics.
///
/// Scoring is a pure function of the metric snapshot: identical snapshots
/// always produce identical scores. The weight vector is validated at
/// configuration load, never here.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    weights: ScoreWeights,
    benchmark_minutes: f64,
    trend_window: usize,
}

impl ScoringEngine {
    pub fn new(weights: ScoreWeights, benchmark_minutes: f64, trend_window: usize) -> Self {
        Self {
            weights,
            benchmark_minutes,
            trend_window,
        }
    }

    /// Compute all sub-scores and the weighted overall score.
    pub fn compute(&self, metrics: &AgentMetrics) -> AgentScore {
        let success = self.success_score(metrics);
        let speed = self.speed_score(metrics);
        let reliability = self.reliability_score(metrics);
        let confidence = clamp(metrics.confidence);

        let overall = clamp(
            self.weights.success * success
                + self.weights.speed * speed
                + self.weights.reliability * reliability
                + self.weights.confidence * confidence,
        );

        AgentScore {
            success,
            speed,
            reliability,
            confidence,
            overall,
            trend: self.trend(&metrics.score_history),
        }
    }

    /// Completed over total outcomes. An agent with no history scores 0,
    /// not 100: untested is not the same as perfect.
    fn success_score(&self, metrics: &AgentMetrics) -> f64 {
        let total = metrics.tasks_completed + metrics.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        clamp(metrics.tasks_completed as f64 / total as f64 * 100.0)
    }

    /// Benchmark time over average time, capped at 100. No completions
    /// means no speed evidence, so 0.
    fn speed_score(&self, metrics: &AgentMetrics) -> f64 {
        match metrics.avg_completion_minutes() {
            Some(avg) if avg > 0.0 => clamp(self.benchmark_minutes / avg * 100.0),
            Some(_) => 100.0,
            None => 0.0,
        }
    }

    /// 100 minus the share of reassignments and overrides. With no
    /// outcomes yet there is nothing held against the agent.
    fn reliability_score(&self, metrics: &AgentMetrics) -> f64 {
        let total = metrics.tasks_completed + metrics.tasks_failed;
        if total == 0 {
            return 100.0;
        }
        let penalised = metrics.tasks_reassigned + metrics.overrides;
        clamp(100.0 - penalised as f64 / total as f64 * 100.0)
    }

    /// Compare the mean of the most recent window against the preceding
    /// window of equal size: above +2 improving, below -2 declining.
    pub fn trend(&self, history: &[f64]) -> Trend {
        let window = self.trend_window;
        if window == 0 || history.len() < window * 2 {
            return Trend::Stable;
        }
        let recent = &history[history.len() - window..];
        let previous = &history[history.len() - window * 2..history.len() - window];
        let recent_mean: f64 = recent.iter().sum::<f64>() / window as f64;
        let previous_mean: f64 = previous.iter().sum::<f64>() / window as f64;
        let delta = recent_mean - previous_mean;
        if delta > 2.0 {
            Trend::Improving
        } else if delta < -2.0 {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}
