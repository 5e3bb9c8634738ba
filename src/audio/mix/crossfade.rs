//! Linear crossfade between two mixer sources.

use crate::common::SourceId;

/// Progress of one crossfade, counted in sample frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossfade {
    pub from: SourceId,
    pub to: SourceId,
    total: usize,
    elapsed: usize,
}

impl Crossfade {
    pub fn new(from: SourceId, to: SourceId, total_frames: usize) -> Self {
        Self {
            from,
            to,
            total: total_frames.max(1),
            elapsed: 0,
        }
    }

    /// `0.0` is `from` alone, `1.0` is `to` alone.
    pub fn progress(&self) -> f32 {
        self.elapsed as f32 / self.total as f32
    }

    pub fn is_done(&self) -> bool {
        self.elapsed >= self.total
    }

    /// Gains of (`from`, `to`) at progress `t`.
    pub fn gains(t: f32) -> (f32, f32) {
        let t = t.clamp(0.0, 1.0);
        (1.0 - t, t)
    }

    /// Blends `from` and `to` into `out` and advances by one frame.
    ///
    /// Gains are held for `resolution` sample frames at a time, so a coarse
    /// resolution trades smoothness for fewer gain updates.
    pub fn blend(&mut self, out: &mut [f32], from: &[f32], to: &[f32], channels: usize, resolution: usize) {
        let resolution = resolution.max(1);
        let frames = out.len() / channels;
        let mut gains = (1.0, 0.0);
        for i in 0..frames {
            if i % resolution == 0 {
                let pos = (self.elapsed + i).min(self.total);
                gains = Self::gains(pos as f32 / self.total as f32);
            }
            for ch in 0..channels {
                let idx = i * channels + ch;
                let a = from.get(idx).copied().unwrap_or(0.0);
                let b = to.get(idx).copied().unwrap_or(0.0);
                out[idx] = a * gains.0 + b * gains.1;
            }
        }
        self.elapsed = (self.elapsed + frames).min(self.total);
    }

    /// Jumps to the end.
    pub fn finish(&mut self) {
        self.elapsed = self.total;
    }
}
