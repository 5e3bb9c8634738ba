use std::f64::consts::PI;

/// Second-order section coefficients, normalised by a0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
  pub b0: f64,
  pub b1: f64,
  pub b2: f64,
  pub a1: f64,
  pub a2: f64,
}

/// Per-channel filter memory (Direct Form I).
#[derive(Debug, Clone, Copy, Default)]
pub struct BiquadState {
  pub x1: f64,
  pub x2: f64,
  pub y1: f64,
  pub y2: f64,
}

impl BiquadCoeffs {
  /// Pass-through section.
  pub const IDENTITY: Self = Self {
    b0: 1.0,
    b1: 0.0,
    b2: 0.0,
    a1: 0.0,
    a2: 0.0,
  };

  fn normalize(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
    let inv_a0 = 1.0 / a0;
    Self {
      b0: b0 * inv_a0,
      b1: b1 * inv_a0,
      b2: b2 * inv_a0,
      a1: a1 * inv_a0,
      a2: a2 * inv_a0,
    }
  }

  /// Shelf alpha for slope `s` (RBJ cookbook).
  fn shelf_alpha(sin_w0: f64, amp: f64, slope: f64) -> f64 {
    sin_w0 / 2.0 * ((amp + 1.0 / amp) * (1.0 / slope - 1.0) + 2.0).max(0.0).sqrt()
  }

  /// Low shelf boosting or cutting everything below `freq` by `gain_db`.
  pub fn low_shelf(freq: f64, gain_db: f64, slope: f64, sample_rate: f64) -> Self {
    if gain_db == 0.0 {
      return Self::IDENTITY;
    }
    let amp = 10f64.powf(gain_db / 40.0);
    let w0 = 2.0 * PI * freq / sample_rate;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = Self::shelf_alpha(sin_w0, amp, slope);
    let two_sqrt_a_alpha = 2.0 * amp.sqrt() * alpha;

    Self::normalize(
      amp * ((amp + 1.0) - (amp - 1.0) * cos_w0 + two_sqrt_a_alpha),
      2.0 * amp * ((amp - 1.0) - (amp + 1.0) * cos_w0),
      amp * ((amp + 1.0) - (amp - 1.0) * cos_w0 - two_sqrt_a_alpha),
      (amp + 1.0) + (amp - 1.0) * cos_w0 + two_sqrt_a_alpha,
      -2.0 * ((amp - 1.0) + (amp + 1.0) * cos_w0),
      (amp + 1.0) + (amp - 1.0) * cos_w0 - two_sqrt_a_alpha,
    )
  }

  /// High shelf boosting or cutting everything above `freq` by `gain_db`.
  pub fn high_shelf(freq: f64, gain_db: f64, slope: f64, sample_rate: f64) -> Self {
    if gain_db == 0.0 {
      return Self::IDENTITY;
    }
    let amp = 10f64.powf(gain_db / 40.0);
    let w0 = 2.0 * PI * freq / sample_rate;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = Self::shelf_alpha(sin_w0, amp, slope);
    let two_sqrt_a_alpha = 2.0 * amp.sqrt() * alpha;

    Self::normalize(
      amp * ((amp + 1.0) + (amp - 1.0) * cos_w0 + two_sqrt_a_alpha),
      -2.0 * amp * ((amp - 1.0) + (amp + 1.0) * cos_w0),
      amp * ((amp + 1.0) + (amp - 1.0) * cos_w0 - two_sqrt_a_alpha),
      (amp + 1.0) - (amp - 1.0) * cos_w0 + two_sqrt_a_alpha,
      2.0 * ((amp - 1.0) - (amp + 1.0) * cos_w0),
      (amp + 1.0) - (amp - 1.0) * cos_w0 - two_sqrt_a_alpha,
    )
  }

  /// Peaking bell centred on `freq`.
  pub fn peaking(freq: f64, gain_db: f64, q: f64, sample_rate: f64) -> Self {
    if gain_db == 0.0 {
      return Self::IDENTITY;
    }
    let amp = 10f64.powf(gain_db / 40.0);
    let w0 = 2.0 * PI * freq / sample_rate;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = sin_w0 / (2.0 * q.max(0.01));

    Self::normalize(
      1.0 + alpha * amp,
      -2.0 * cos_w0,
      1.0 - alpha * amp,
      1.0 + alpha / amp,
      -2.0 * cos_w0,
      1.0 - alpha / amp,
    )
  }

  /// Magnitude response at `freq`, used by tests and diagnostics.
  pub fn magnitude_at(&self, freq: f64, sample_rate: f64) -> f64 {
    let w = 2.0 * PI * freq / sample_rate;
    let (s1, c1) = w.sin_cos();
    let (s2, c2) = (2.0 * w).sin_cos();
    let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
    let num_im = -(self.b1 * s1 + self.b2 * s2);
    let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
    let den_im = -(self.a1 * s1 + self.a2 * s2);
    ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
  }
}

impl BiquadState {
  pub fn process(&mut self, input: f64, coeffs: &BiquadCoeffs) -> f64 {
    let output = coeffs.b0 * input + coeffs.b1 * self.x1 + coeffs.b2 * self.x2
      - coeffs.a1 * self.y1
      - coeffs.a2 * self.y2;

    if !output.is_finite() {
      self.reset();
      return 0.0;
    }

    self.x2 = self.x1;
    self.x1 = input;
    self.y2 = self.y1;
    self.y1 = output;
    output
  }

  /// Advances the history as if the section were a pass-through, so a
  /// bypassed band can be re-enabled without a transient.
  pub fn track(&mut self, input: f64) {
    self.x2 = self.x1;
    self.x1 = input;
    self.y2 = self.y1;
    self.y1 = input;
  }

  pub fn reset(&mut self) {
    *self = Self::default();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const RATE: f64 = 48_000.0;

  fn db(mag: f64) -> f64 {
    20.0 * mag.log10()
  }

  #[test]
  fn shelves_reach_their_gain_far_from_the_corner() {
    let low = BiquadCoeffs::low_shelf(250.0, 6.0, 1.0, RATE);
    assert!((db(low.magnitude_at(20.0, RATE)) - 6.0).abs() < 0.3);
    assert!(db(low.magnitude_at(10_000.0, RATE)).abs() < 0.3);

    let high = BiquadCoeffs::high_shelf(4_000.0, -6.0, 1.0, RATE);
    assert!((db(high.magnitude_at(20_000.0, RATE)) + 6.0).abs() < 0.5);
    assert!(db(high.magnitude_at(100.0, RATE)).abs() < 0.3);
  }

  #[test]
  fn peaking_hits_gain_at_centre() {
    let bell = BiquadCoeffs::peaking(1_000.0, 4.0, 0.7, RATE);
    assert!((db(bell.magnitude_at(1_000.0, RATE)) - 4.0).abs() < 0.05);
  }

  #[test]
  fn zero_gain_is_identity() {
    assert_eq!(BiquadCoeffs::peaking(1_000.0, 0.0, 0.7, RATE), BiquadCoeffs::IDENTITY);
    let mut state = BiquadState::default();
    assert_eq!(state.process(0.25, &BiquadCoeffs::IDENTITY), 0.25);
  }

  #[test]
  fn state_resets_after_non_finite_output() {
    let mut state = BiquadState { x1: 1.0, ..Default::default() };
    let broken = BiquadCoeffs { b1: f64::INFINITY, ..BiquadCoeffs::IDENTITY };
    assert_eq!(state.process(0.5, &broken), 0.0);
    assert_eq!(state.x1, 0.0);
  }
}
