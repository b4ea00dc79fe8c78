//! Fourier-domain resampling of sensor batches
//!
//! Downsampling keeps the low-frequency content of the batch instead of
//! dropping samples: the spectrum is cut to the target length and brought
//! back with an inverse FFT. Output matches `scipy.signal.resample` on real
//! input.

use rustfft::{num_complex::Complex, FftPlanner};

/// Resamples `samples` to exactly `target` points.
/// Batches already at or below `target` are returned unchanged.
pub fn resample(samples: &[f64], target: usize) -> Vec<f64> {
    let len = samples.len();
    if target == 0 {
        return Vec::new();
    }
    if len <= target {
        return samples.to_vec();
    }

    let mut planner = FftPlanner::<f64>::new();

    let mut spectrum: Vec<Complex<f64>> = samples.iter().map(|&s| Complex::new(s, 0.0)).collect();
    planner.plan_fft_forward(len).process(&mut spectrum);

    let mut cut = vec![Complex::new(0.0, 0.0); target];
    let half = target / 2;
    if target % 2 == 0 {
        cut[..half].copy_from_slice(&spectrum[..half]);
        for k in 1..half {
            cut[target - k] = spectrum[k].conj();
        }
        // bin de Nyquist : les deux moitiés repliées sur une composante réelle
        cut[half] = Complex::new(2.0 * spectrum[half].re, 0.0);
    } else {
        cut[..=half].copy_from_slice(&spectrum[..=half]);
        for k in 1..=half {
            cut[target - k] = spectrum[k].conj();
        }
    }

    planner.plan_fft_inverse(target).process(&mut cut);

    let scale = 1.0 / len as f64;
    cut.iter().map(|c| c.re * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn short_batches_pass_through() {
        let samples = vec![1.0, 2.0, 3.0];
        assert_eq!(resample(&samples, 30), samples);
        assert_eq!(resample(&samples, 3), samples);
    }

    #[test]
    fn constant_stays_constant() {
        let samples = vec![4.2; 100];
        let out = resample(&samples, 30);
        assert!(close(&out, &[4.2; 30]));
    }

    #[test]
    fn low_frequency_cosine_is_preserved() {
        let samples: Vec<f64> = (0..60).map(|n| (2.0 * PI * n as f64 / 60.0).cos()).collect();
        let expected: Vec<f64> = (0..30).map(|m| (2.0 * PI * m as f64 / 30.0).cos()).collect();
        assert!(close(&resample(&samples, 30), &expected));
    }

    #[test]
    fn odd_target_length() {
        let samples: Vec<f64> = (0..50).map(|n| 1.0 + (2.0 * PI * n as f64 / 50.0).sin()).collect();
        let expected: Vec<f64> = (0..25).map(|m| 1.0 + (2.0 * PI * m as f64 / 25.0).sin()).collect();
        assert!(close(&resample(&samples, 25), &expected));
    }

    #[test]
    fn mean_is_kept() {
        let samples: Vec<f64> = (0..97).map(|n| ((n * 37) % 11) as f64).collect();
        let mean_in = samples.iter().sum::<f64>() / samples.len() as f64;
        let out = resample(&samples, 30);
        let mean_out = out.iter().sum::<f64>() / out.len() as f64;
        assert_eq!(out.len(), 30);
        assert!((mean_in - mean_out).abs() < 1e-9);
    }
}
