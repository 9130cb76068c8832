//! Live amplitude model for the recording visualizer.
//!
//! Two structurally different inputs feed it: time-domain buffers from the
//! local graph (continuous) and decibel events from an external capture
//! process (intermittent, may stall). Both are reduced to a 0..1 level and
//! blended into per-bar heights that are smoothed every tick.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use super::audio_source::SourceTag;

pub const DB_FLOOR: f32 = -70.0;
pub const DB_CEILING: f32 = -5.0;
pub const SILENCE_THRESHOLD: f32 = 0.15;
pub const EXTERNAL_TIMEOUT: Duration = Duration::from_millis(300);
pub const DECAY_RATE: f32 = 0.2;
pub const DECAY_FLOOR: f32 = 0.01;
pub const DEFAULT_GAIN: f32 = 4.0;
pub const DEFAULT_SMOOTHING: f32 = 0.2;

/// One normalized reading, consumed immediately by the tracker.
#[derive(Debug, Clone, Copy)]
pub struct AmplitudeSample {
    pub value: f32,
    pub source: SourceTag,
    pub at: Instant,
}

impl AmplitudeSample {
    pub fn from_buffer(source: SourceTag, buffer: &[f32], gain: f32, at: Instant) -> Self {
        Self {
            value: rms_level(buffer, gain),
            source,
            at,
        }
    }

    pub fn from_decibels(source: SourceTag, decibels: f32, at: Instant) -> Self {
        Self {
            value: decibels_to_level(decibels),
            source,
            at,
        }
    }
}

/// Smoothed output of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AmplitudeFrame {
    pub bars: Vec<f32>,
    pub mic: f32,
    pub system: f32,
}

impl AmplitudeFrame {
    /// Tallest bar, handy for single-value meters.
    pub fn peak(&self) -> f32 {
        self.bars.iter().copied().fold(0.0, f32::max)
    }
}

/// Root-mean-square of a buffer, scaled by `gain` and clamped to [0, 1].
pub fn rms_level(buffer: &[f32], gain: f32) -> f32 {
    if buffer.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = buffer.iter().map(|s| s * s).sum();
    let rms = (sum_sq / buffer.len() as f32).sqrt();
    (rms * gain).clamp(0.0, 1.0)
}

/// Linear map from [-70 dB, -5 dB] to [0, 1]; quiet levels snap to 0.
pub fn decibels_to_level(decibels: f32) -> f32 {
    if !decibels.is_finite() {
        return 0.0;
    }
    let level = ((decibels - DB_FLOOR) / (DB_CEILING - DB_FLOOR)).clamp(0.0, 1.0);
    if level < SILENCE_THRESHOLD {
        0.0
    } else {
        level
    }
}

/// Last level reported by an external process plus its decay state.
#[derive(Debug, Clone, Default)]
struct ExternalLevel {
    level: f32,
    last_event: Option<Instant>,
}

impl ExternalLevel {
    fn record(&mut self, level: f32, at: Instant) {
        self.level = level;
        self.last_event = Some(at);
    }

    fn decay(&mut self, now: Instant) {
        let stale = match self.last_event {
            Some(at) => now.saturating_duration_since(at) > EXTERNAL_TIMEOUT,
            None => true,
        };
        if !stale {
            return;
        }
        self.level *= 1.0 - DECAY_RATE;
        if self.level < DECAY_FLOOR {
            self.level = 0.0;
        }
    }
}

pub struct AmplitudeTracker {
    bars: Vec<f32>,
    smoothing: f32,
    dual_track: bool,
    mic: f32,
    system: ExternalLevel,
}

impl AmplitudeTracker {
    /// `smoothing` is clamped into the 0.15..=0.3 range.
    pub fn new(bar_count: usize, smoothing: f32, dual_track: bool) -> Self {
        Self {
            bars: vec![0.0; bar_count.max(1)],
            smoothing: smoothing.clamp(0.15, 0.3),
            dual_track,
            mic: 0.0,
            system: ExternalLevel::default(),
        }
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn observe(&mut self, sample: AmplitudeSample) {
        let value = sample.value.clamp(0.0, 1.0);
        match sample.source {
            SourceTag::Mic => self.mic = value,
            SourceTag::System => self.system.record(value, sample.at),
        }
    }

    /// Current external system level (after any decay applied so far).
    pub fn system_level(&self) -> f32 {
        self.system.level
    }

    /// Advance one visual tick.
    pub fn tick(&mut self, now: Instant) -> AmplitudeFrame {
        if self.dual_track {
            self.system.decay(now);
        }

        let count = self.bars.len();
        for i in 0..count {
            let target = self.target(i, count);
            let current = self.bars[i];
            self.bars[i] = current + (target - current) * self.smoothing;
        }

        AmplitudeFrame {
            bars: self.bars.clone(),
            mic: self.mic,
            system: self.system.level,
        }
    }

    fn target(&self, index: usize, count: usize) -> f32 {
        if !self.dual_track {
            return self.mic;
        }
        let p = index as f32 / count as f32;
        (self.mic * (1.0 - 0.5 * p) + self.system.level * (0.5 + 0.5 * p)).clamp(0.0, 1.0)
    }
}
