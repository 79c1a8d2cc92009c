//! Per-type batch window state machine.
//!
//! Each request type owns a [`BatchWindow`] that decides when its backlog is
//! cut into a batch. The window is pure: it is fed a [`Trigger`] and a
//! [`Backlog`] snapshot and answers with a [`Step`]. The engine applies the
//! step (claiming, spawning the executor, arming or disarming the single
//! timer for the type) and calls [`BatchWindow::evaluate`] again after every
//! cut until the window settles.
//!
//! ```text
//!            enqueue                     deadline (len >= min)
//!   Idle ───────────────▶ Pending ─────────────────────────────▶ cut
//!    ▲                      │ deadline (len < min)                │
//!    │                      ▼                                     │
//!    │                    Grace ──── deadline ───────────────────▶│
//!    │                                                            │
//!    └──────────── backlog empty ◀────────────────────────────────┘
//!                  (otherwise re-arm Pending for the remainder)
//!
//!   any state: backlog >= max_batch_size ─▶ cut immediately
//! ```

use std::time::Duration;

use tokio::time::Instant;

use super::config::BatchConfig;

/// Queued requests of one type at the moment of evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    pub len: usize,
    pub oldest: Option<Instant>,
}

/// What prompted an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// New requests arrived, or a cut left a remainder behind
    Arrival,
    /// The armed timer reached its deadline
    TimerFired,
    /// Caller forced every queued request out
    Flush,
}

/// Window state for one request type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Nothing queued, no timer armed
    Idle,
    /// Collecting requests until `deadline`
    Pending { deadline: Instant },
    /// Window elapsed with fewer than `min_batch_size`; last wait before a forced cut
    Grace { deadline: Instant },
}

impl WindowState {
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            WindowState::Idle => None,
            WindowState::Pending { deadline } | WindowState::Grace { deadline } => Some(*deadline),
        }
    }
}

/// Action the driver must take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Claim up to this many requests and execute them as one batch, then re-evaluate
    Cut(usize),
    /// Replace the type's timer with one firing at this instant
    Arm(Instant),
    /// Leave the current timer as it is
    Hold,
    /// Backlog is empty; disarm any timer
    Idle,
}

/// Batch window for one request type
#[derive(Debug, Clone)]
pub struct BatchWindow {
    config: BatchConfig,
    grace: Duration,
    state: WindowState,
}

impl BatchWindow {
    /// `grace` is clamped to the window length so that no request waits more
    /// than twice `max_wait` before being cut.
    pub fn new(config: BatchConfig, grace: Duration) -> Self {
        Self { config, grace: grace.min(config.max_wait), state: WindowState::Idle }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Decide the next step for this type.
    pub fn evaluate(&mut self, trigger: Trigger, backlog: Backlog, now: Instant) -> Step {
        let oldest = match backlog.oldest {
            Some(oldest) if backlog.len > 0 => oldest,
            _ => {
                self.state = WindowState::Idle;
                return Step::Idle;
            }
        };

        if trigger == Trigger::Flush {
            self.state = WindowState::Idle;
            return Step::Cut(backlog.len.min(self.config.max_batch_size));
        }

        if backlog.len >= self.config.max_batch_size {
            self.state = WindowState::Idle;
            return Step::Cut(self.config.max_batch_size);
        }

        match (self.state, trigger) {
            (WindowState::Idle, _) => {
                let deadline = oldest + self.config.max_wait;
                if deadline <= now {
                    // Remainder that already outlived its window
                    self.window_elapsed(backlog, oldest, now)
                } else {
                    self.state = WindowState::Pending { deadline };
                    Step::Arm(deadline)
                }
            }
            (WindowState::Pending { deadline }, Trigger::TimerFired) if deadline <= now => {
                self.window_elapsed(backlog, oldest, now)
            }
            (WindowState::Grace { deadline }, Trigger::TimerFired) if deadline <= now => {
                self.state = WindowState::Idle;
                Step::Cut(backlog.len)
            }
            _ => Step::Hold,
        }
    }

    fn window_elapsed(&mut self, backlog: Backlog, oldest: Instant, now: Instant) -> Step {
        if backlog.len >= self.config.min_batch_size {
            self.state = WindowState::Idle;
            return Step::Cut(backlog.len);
        }

        let hard_limit = oldest + self.config.max_wait * 2;
        let deadline = (now + self.grace).min(hard_limit);
        if deadline <= now {
            self.state = WindowState::Idle;
            Step::Cut(backlog.len)
        } else {
            self.state = WindowState::Grace { deadline };
            Step::Arm(deadline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> BatchWindow {
        BatchWindow::new(BatchConfig::new(5, 3, Duration::from_millis(3000)), Duration::from_millis(1000))
    }

    fn backlog(len: usize, oldest: Instant) -> Backlog {
        Backlog { len, oldest: Some(oldest) }
    }

    #[test]
    fn test_first_arrival_arms_window() {
        let mut w = window();
        let t0 = Instant::now();

        let step = w.evaluate(Trigger::Arrival, backlog(1, t0), t0);
        assert_eq!(step, Step::Arm(t0 + Duration::from_millis(3000)));
        assert!(matches!(w.state(), WindowState::Pending { .. }));

        // Later arrivals keep the same timer
        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(w.evaluate(Trigger::Arrival, backlog(2, t0), t1), Step::Hold);
        assert_eq!(w.state().deadline(), Some(t0 + Duration::from_millis(3000)));
    }

    #[test]
    fn test_full_backlog_cuts_immediately() {
        let mut w = window();
        let t0 = Instant::now();
        w.evaluate(Trigger::Arrival, backlog(4, t0), t0);

        assert_eq!(w.evaluate(Trigger::Arrival, backlog(5, t0), t0), Step::Cut(5));
        assert_eq!(w.state(), WindowState::Idle);
    }

    #[test]
    fn test_window_elapsed_with_enough_requests() {
        let mut w = window();
        let t0 = Instant::now();
        w.evaluate(Trigger::Arrival, backlog(1, t0), t0);

        let fire = t0 + Duration::from_millis(3000);
        assert_eq!(w.evaluate(Trigger::TimerFired, backlog(3, t0), fire), Step::Cut(3));
    }

    #[test]
    fn test_undersized_batch_gets_one_grace_period() {
        let mut w = window();
        let t0 = Instant::now();
        w.evaluate(Trigger::Arrival, backlog(1, t0), t0);

        let fire = t0 + Duration::from_millis(3000);
        let grace_deadline = fire + Duration::from_millis(1000);
        assert_eq!(w.evaluate(Trigger::TimerFired, backlog(1, t0), fire), Step::Arm(grace_deadline));
        assert_eq!(w.state(), WindowState::Grace { deadline: grace_deadline });

        // Arrival during grace that stays below max does not reset anything
        assert_eq!(w.evaluate(Trigger::Arrival, backlog(2, t0), fire), Step::Hold);

        assert_eq!(w.evaluate(Trigger::TimerFired, backlog(2, t0), grace_deadline), Step::Cut(2));
        assert_eq!(w.state(), WindowState::Idle);
    }

    #[test]
    fn test_early_timer_is_ignored() {
        let mut w = window();
        let t0 = Instant::now();
        w.evaluate(Trigger::Arrival, backlog(1, t0), t0);

        let early = t0 + Duration::from_millis(100);
        assert_eq!(w.evaluate(Trigger::TimerFired, backlog(1, t0), early), Step::Hold);
    }

    #[test]
    fn test_remainder_rearms_from_oldest() {
        let mut w = window();
        let t0 = Instant::now();
        let now = t0 + Duration::from_millis(1000);

        // Remainder left behind after a cut, still inside its window
        assert_eq!(
            w.evaluate(Trigger::Arrival, backlog(2, t0), now),
            Step::Arm(t0 + Duration::from_millis(3000))
        );
    }

    #[test]
    fn test_stale_remainder_never_exceeds_twice_window() {
        let mut w = window();
        let t0 = Instant::now();
        let now = t0 + Duration::from_millis(5500);

        // Oldest already waited past its window; grace is capped at 2x max_wait
        assert_eq!(
            w.evaluate(Trigger::Arrival, backlog(1, t0), now),
            Step::Arm(t0 + Duration::from_millis(6000))
        );

        let now = t0 + Duration::from_millis(6500);
        let mut w = window();
        assert_eq!(w.evaluate(Trigger::Arrival, backlog(1, t0), now), Step::Cut(1));
    }

    #[test]
    fn test_flush_cuts_in_max_sized_chunks() {
        let mut w = window();
        let t0 = Instant::now();
        assert_eq!(w.evaluate(Trigger::Flush, backlog(7, t0), t0), Step::Cut(5));
        assert_eq!(w.evaluate(Trigger::Flush, backlog(2, t0), t0), Step::Cut(2));
        assert_eq!(w.evaluate(Trigger::Flush, Backlog::default(), t0), Step::Idle);
    }

    #[test]
    fn test_empty_backlog_goes_idle() {
        let mut w = window();
        let t0 = Instant::now();
        w.evaluate(Trigger::Arrival, backlog(1, t0), t0);
        assert_eq!(w.evaluate(Trigger::TimerFired, Backlog::default(), t0), Step::Idle);
        assert_eq!(w.state(), WindowState::Idle);
    }

    #[test]
    fn test_grace_clamped_to_window() {
        let w = BatchWindow::new(
            BatchConfig::new(5, 3, Duration::from_millis(200)),
            Duration::from_secs(10),
        );
        assert_eq!(w.grace, Duration::from_millis(200));
    }
}
