//! Restart Budget
//!
//! Bounds automatic listener restarts: at most [`MAX_RESTARTS`] restarts
//! within a sliding [`RESTART_WINDOW`], measured from the previous restart.

use std::time::Duration;

use tokio::time::Instant;

/// Window after which the restart counter starts over
pub const RESTART_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Restarts allowed inside one window
pub const MAX_RESTARTS: u32 = 5;

/// What to do after a listener failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Restart the listener; `attempt` counts restarts in the current window
    Restart { attempt: u32 },
    /// Give up; the failure is fatal
    Exhausted { restarts: u32 },
}

/// Restart counter owned by a single server run loop
#[derive(Debug, Clone)]
pub struct RestartBudget {
    window: Duration,
    max_restarts: u32,
    restarts: u32,
    last_restart: Option<Instant>,
}

impl RestartBudget {
    pub fn new(window: Duration, max_restarts: u32) -> Self {
        Self {
            window,
            max_restarts,
            restarts: 0,
            last_restart: None,
        }
    }

    /// Account for a listener failure observed at `now`.
    pub fn record_failure(&mut self, now: Instant) -> BudgetDecision {
        let window_expired = self
            .last_restart
            .map_or(true, |last| now.saturating_duration_since(last) > self.window);
        if window_expired {
            self.restarts = 0;
        }

        self.restarts += 1;
        self.last_restart = Some(now);

        if self.restarts > self.max_restarts {
            BudgetDecision::Exhausted {
                restarts: self.restarts,
            }
        } else {
            BudgetDecision::Restart {
                attempt: self.restarts,
            }
        }
    }

    /// Failures counted in the current window
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self::new(RESTART_WINDOW, MAX_RESTARTS)
    }
}
