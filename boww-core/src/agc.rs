//! Single-pass automatic gain control for the VAD detection path.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming i16 buffer.
//! 2. RMS below the noise gate → glide gain toward unity (coefficient 0.05)
//!    so floor noise is never amplified into phantom speech.
//! 3. Otherwise smooth gain toward `target_rms / (rms + 1)`, clamped to
//!    [0.1, max_gain], with asymmetric time constants: attack α = 0.2 when
//!    pulling the gain down (loud input), release α = 0.01 when pushing it
//!    up (quiet input).
//! 4. Apply the gain to every sample, saturating to the i16 range.
//!
//! The target of 20000 sits around −4 dBFS, which gives the VAD most of its
//! dynamic range without clipping. The fast attack keeps brief transients
//! (door slams, taps) from overshooting into the detector.

/// RMS level below which the input is treated as floor noise.
const NOISE_GATE_RMS: f32 = 100.0;
/// Gain smoothing coefficient while gated.
const GATE_ALPHA: f32 = 0.05;
/// Smoothing coefficient when the needed gain is below the current gain.
const ATTACK_ALPHA: f32 = 0.2;
/// Smoothing coefficient when the needed gain is above the current gain.
const RELEASE_ALPHA: f32 = 0.01;
/// Lower clamp for the needed gain.
const MIN_GAIN: f32 = 0.1;

/// Stateful automatic gain control over int16 PCM.
#[derive(Debug, Clone)]
pub struct Agc {
    target_rms: f32,
    max_gain: f32,
    gain: f32,
}

impl Agc {
    pub fn new(target_rms: f32, max_gain: f32) -> Self {
        Self {
            target_rms,
            max_gain,
            gain: 1.0,
        }
    }

    /// Compute the root-mean-square of an i16 sample slice.
    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples.iter().map(|&s| s as f64 * s as f64).sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }

    /// Normalize `buffer` in place toward the target RMS.
    pub fn process(&mut self, buffer: &mut [i16]) {
        if buffer.is_empty() {
            return;
        }

        let rms = Self::rms(buffer);

        if rms < NOISE_GATE_RMS {
            self.gain = (1.0 - GATE_ALPHA) * self.gain + GATE_ALPHA * 1.0;
        } else {
            let needed = (self.target_rms / (rms + 1.0)).clamp(MIN_GAIN, self.max_gain);
            let alpha = if needed < self.gain {
                ATTACK_ALPHA
            } else {
                RELEASE_ALPHA
            };
            self.gain = (1.0 - alpha) * self.gain + alpha * needed;
        }

        for sample in buffer.iter_mut() {
            let scaled = (*sample as f32 * self.gain).clamp(-32768.0, 32767.0);
            *sample = scaled as i16;
        }
    }

    /// Current smoothed gain (diagnostic).
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for Agc {
    fn default() -> Self {
        Self::new(20_000.0, 30.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_stays_gated_at_unity() {
        let mut agc = Agc::default();
        let mut buf = vec![0i16; 512];
        agc.process(&mut buf);
        assert!((agc.gain() - 1.0).abs() < 1e-6);
        assert!(buf.iter().all(|&s| s == 0));
    }

    #[test]
    fn gate_glides_back_toward_unity() {
        let mut agc = Agc::default();
        // Push the gain up with a quiet-but-voiced buffer first.
        let mut quiet = vec![500i16; 512];
        for _ in 0..200 {
            quiet.fill(500);
            agc.process(&mut quiet);
        }
        let boosted = agc.gain();
        assert!(boosted > 1.5, "gain={boosted}");

        // Then feed floor noise: gain must decay toward 1.0.
        let mut floor = vec![10i16; 512];
        for _ in 0..400 {
            floor.fill(10);
            agc.process(&mut floor);
        }
        assert!(agc.gain() < 1.1, "gain={}", agc.gain());
    }

    #[test]
    fn attack_is_faster_than_release() {
        // Loud input: needed gain < 1, one pass moves ~20 % of the way.
        let mut loud_agc = Agc::default();
        let mut loud = vec![30_000i16; 512];
        loud_agc.process(&mut loud);
        assert!(loud_agc.gain() < 0.95, "gain={}", loud_agc.gain());

        // Quiet input: needed gain ≫ 1, one pass moves only ~1 % of the way.
        let mut quiet_agc = Agc::default();
        let mut quiet = vec![500i16; 512];
        quiet_agc.process(&mut quiet);
        let g = quiet_agc.gain();
        assert!(g > 1.0 && g < 1.5, "gain={g}");
    }

    #[test]
    fn needed_gain_clamps_to_max() {
        let mut agc = Agc::new(20_000.0, 30.0);
        // RMS ≈ 200 → needed ≈ 99.5, clamped to 30. Drive release to steady state.
        let mut buf = vec![200i16; 512];
        for _ in 0..2_000 {
            buf.fill(200);
            agc.process(&mut buf);
        }
        assert!(agc.gain() <= 30.0 + 1e-3, "gain={}", agc.gain());
        assert!(agc.gain() > 25.0, "gain={}", agc.gain());
    }

    #[test]
    fn output_saturates_to_i16_range() {
        let mut agc = Agc::default();
        // Raise the gain well above 1, then hit it with a full-scale buffer.
        let mut quiet = vec![600i16; 512];
        for _ in 0..500 {
            quiet.fill(600);
            agc.process(&mut quiet);
        }
        assert!(agc.gain() > 2.0);

        let mut loud = vec![0i16; 512];
        for (i, s) in loud.iter_mut().enumerate() {
            *s = if i % 2 == 0 { 30_000 } else { -30_000 };
        }
        agc.process(&mut loud);
        assert!(loud.iter().all(|&s| (-32_768..=32_767).contains(&(s as i32))));
        // The first pass still carries most of the boosted gain, so clipping
        // must have engaged rather than wrapped.
        assert!(loud.iter().any(|&s| s == 32_767 || s == -32_768));
    }

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<i16> = (0..256).map(|i| if i % 2 == 0 { 1000 } else { -1000 }).collect();
        let rms = Agc::rms(&samples);
        assert!((rms - 1000.0).abs() < 1e-2, "rms={rms}");
    }
}
