//! Elapsed-time accounting that excludes paused intervals.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionClock {
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    stopped_at: Option<Instant>,
    paused_accumulated: Duration,
}

impl SessionClock {
    pub fn start(&mut self, now: Instant) {
        *self = Self {
            started_at: Some(now),
            ..Self::default()
        };
    }

    pub fn pause(&mut self, now: Instant) {
        if self.started_at.is_some() && self.paused_at.is_none() && self.stopped_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_accumulated += now.saturating_duration_since(paused_at);
        }
    }

    /// Stop the clock for good; `elapsed` no longer moves.
    pub fn freeze(&mut self, now: Instant) {
        if self.started_at.is_none() || self.stopped_at.is_some() {
            return;
        }
        self.resume(now);
        self.stopped_at = Some(now);
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn paused_accumulated(&self) -> Duration {
        self.paused_accumulated
    }

    /// now − started − paused, frozen while paused and after `freeze`.
    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.stopped_at.or(self.paused_at).unwrap_or(now);
        end.saturating_duration_since(started_at)
            .saturating_sub(self.paused_accumulated)
    }
}
