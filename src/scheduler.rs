// src/scheduler.rs

//! Timing for periodic reconciliation passes
//!
//! `watch` runs a pass whenever the interval has elapsed since the previous
//! one finished, or immediately when a pass is requested out of band. A pass
//! that could not reach the server keeps its slot; the next attempt simply
//! waits for the following interval.

use crate::pipeline::PassOutcome;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Scheduler state, exposed for status output
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub last_pass: Option<DateTime<Utc>>,
    pub next_pass: Option<DateTime<Utc>>,
    pub last_outcome: Option<PassOutcome>,
    pub passes: u64,
}

pub struct PassScheduler {
    interval: Duration,
    state: SchedulerState,
}

impl PassScheduler {
    /// First pass is due immediately
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: SchedulerState::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_run(&self) -> bool {
        match self.state.next_pass {
            Some(next) => Utc::now() >= next,
            None => true,
        }
    }

    /// Make the next pass due now
    pub fn request_now(&mut self) {
        self.state.next_pass = Some(Utc::now());
    }

    pub fn record_pass(&mut self, outcome: PassOutcome) {
        let now = Utc::now();
        self.state.last_pass = Some(now);
        self.state.next_pass =
            Some(now + chrono::Duration::from_std(self.interval).unwrap_or_default());
        self.state.last_outcome = Some(outcome);
        self.state.passes += 1;
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn time_until_next(&self) -> Duration {
        self.state
            .next_pass
            .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO)
    }

    pub fn status_line(&self) -> String {
        match self.state.next_pass {
            None => "Pass due now".to_string(),
            Some(next) => format_remaining(next - Utc::now()),
        }
    }
}

fn format_remaining(remaining: chrono::Duration) -> String {
    let total_secs = remaining.num_seconds();
    if total_secs <= 0 {
        return "Pass due now".to_string();
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("Next pass in {}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("Next pass in {}m {}s", minutes, seconds)
    } else {
        format!("Next pass in {}s", seconds)
    }
}
