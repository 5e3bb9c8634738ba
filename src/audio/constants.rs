//! Central constants for the audio path.
//!
//! Tunable behaviour lives in `configs`; what is here is fixed by the PCM
//! format or by the maths of the individual stages.

// ── Sample / PCM ─────────────────────────────────────────────────────────────

/// Rate Discord expects on the voice socket (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

/// Stereo output.
pub const TARGET_CHANNELS: usize = 2;

/// Samples per 20 ms stereo frame at 48 kHz (960 frames × 2 channels).
pub const FRAME_SIZE_SAMPLES: usize = 960 * 2;

// ── i16 PCM scaling ──────────────────────────────────────────────────────────

pub const INT16_MAX_F: f32 = 32_767.0;
pub const INT16_MIN_F: f32 = -32_768.0;

/// Divisor mapping i16 samples onto `[-1.0, 1.0)`.
pub const PCM_SCALE: f32 = 32_768.0;

// ── Loudness ─────────────────────────────────────────────────────────────────

/// Offset of the K-weighted loudness scale from plain RMS dBFS (BS.1770).
pub const LUFS_OFFSET_DB: f32 = -0.691;

/// Floor used when taking logarithms of silent blocks.
pub const MIN_DB: f32 = -120.0;

/// Range a guild may move its normalization target within (LUFS).
pub const MIN_TARGET_LUFS: f32 = -30.0;
pub const MAX_TARGET_LUFS: f32 = -16.0;

// ── Soft limiter ─────────────────────────────────────────────────────────────

/// Level (relative to full scale) above which the soft limiter starts bending.
pub const LIMITER_THRESHOLD: f32 = 0.95;

/// Curvature of the limiter knee; higher values clamp harder.
pub const LIMITER_SOFTNESS: f32 = 0.4;

// ── Equalizer ────────────────────────────────────────────────────────────────

/// Gain range accepted for every equalizer band (dB).
pub const EQ_MIN_DB: f32 = -12.0;
pub const EQ_MAX_DB: f32 = 12.0;

/// Shelf slope used for the bass and treble bands.
pub const SHELF_SLOPE: f64 = 1.0;

// ── Compressor ───────────────────────────────────────────────────────────────

/// Longest lookahead any quality profile asks for (ms); sizes the delay line once.
pub const MAX_LOOKAHEAD_MS: f32 = 10.0;

/// Converts decibels to a linear gain factor.
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Converts a linear gain factor to decibels, floored at [`MIN_DB`].
#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    if gain <= 0.0 {
        return MIN_DB;
    }
    (20.0 * gain.log10()).max(MIN_DB)
}
