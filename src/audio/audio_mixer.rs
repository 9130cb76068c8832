//! Audio mixing for the local capture graph.
//!
//! `AudioMixer` is pure (no state, no side effects). `FrameAligner` keeps
//! one FIFO per input so that chunks arriving at different cadences are summed
//! sample-for-sample.

use std::collections::VecDeque;

pub struct AudioMixer;

impl AudioMixer {
    /// Sum equally long inputs into one mono buffer, clamped to [-1.0, 1.0].
    /// Shorter inputs are zero-padded.
    pub fn mix(sources: &[&[f32]]) -> Vec<f32> {
        let max_len = sources.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut mixed = vec![0.0f32; max_len];

        for source in sources {
            for (i, &sample) in source.iter().enumerate() {
                mixed[i] += sample;
            }
        }

        for sample in &mut mixed {
            *sample = sample.clamp(-1.0, 1.0);
        }

        mixed
    }

    /// Resample audio from one sample rate to another using linear interpolation.
    /// Suitable for speech audio where perfect quality isn't critical.
    pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
        if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
            return samples.to_vec();
        }

        let ratio = from_rate as f64 / to_rate as f64;
        let new_len = (samples.len() as f64 / ratio).ceil() as usize;
        let mut resampled = Vec::with_capacity(new_len);

        for i in 0..new_len {
            let src_pos = i as f64 * ratio;
            let src_idx = src_pos as usize;
            let frac = src_pos - src_idx as f64;

            let sample = if src_idx + 1 < samples.len() {
                samples[src_idx] as f64 * (1.0 - frac) + samples[src_idx + 1] as f64 * frac
            } else if src_idx < samples.len() {
                samples[src_idx] as f64
            } else {
                0.0
            };

            resampled.push(sample as f32);
        }

        resampled
    }

    /// Average interleaved frames down to one channel.
    pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
        if channels <= 1 {
            return interleaved.to_vec();
        }
        let channels = channels as usize;
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }
}

/// Aligns chunks from several live inputs before summing them.
pub struct FrameAligner {
    queues: Vec<VecDeque<f32>>,
    live: Vec<bool>,
    stall_limit: usize,
}

impl FrameAligner {
    /// `stall_limit` is how many samples one input may run ahead of a silent
    /// input before the silent one is treated as zeros.
    pub fn new(inputs: usize, stall_limit: usize) -> Self {
        Self {
            queues: vec![VecDeque::new(); inputs],
            live: vec![true; inputs],
            stall_limit,
        }
    }

    pub fn push(&mut self, input: usize, samples: &[f32]) {
        if let Some(queue) = self.queues.get_mut(input) {
            queue.extend(samples.iter().copied());
        }
    }

    /// Mark an input as finished; it no longer holds back the others.
    pub fn close(&mut self, input: usize) {
        if let Some(live) = self.live.get_mut(input) {
            *live = false;
        }
    }

    pub fn all_closed(&self) -> bool {
        self.live.iter().all(|l| !l)
    }

    /// Pop the mixed samples that are ready, if any.
    pub fn drain_ready(&mut self) -> Option<Vec<f32>> {
        let longest = self.queues.iter().map(|q| q.len()).max().unwrap_or(0);
        if longest == 0 {
            return None;
        }

        let waiting_on_live = self
            .queues
            .iter()
            .zip(&self.live)
            .filter(|(_, live)| **live)
            .map(|(q, _)| q.len())
            .min();

        let take = match waiting_on_live {
            Some(0) if longest < self.stall_limit => return None,
            Some(0) => longest,
            Some(shortest) => shortest,
            None => longest,
        };

        Some(self.take(take))
    }

    /// Pop everything left, zero-padding the shorter inputs.
    pub fn drain_all(&mut self) -> Option<Vec<f32>> {
        let longest = self.queues.iter().map(|q| q.len()).max().unwrap_or(0);
        if longest == 0 {
            return None;
        }
        Some(self.take(longest))
    }

    fn take(&mut self, count: usize) -> Vec<f32> {
        let parts: Vec<Vec<f32>> = self
            .queues
            .iter_mut()
            .map(|q| {
                let n = count.min(q.len());
                q.drain(..n).collect()
            })
            .collect();
        let refs: Vec<&[f32]> = parts.iter().map(|p| p.as_slice()).collect();
        let mut mixed = AudioMixer::mix(&refs);
        mixed.resize(count, 0.0);
        mixed
    }
}
