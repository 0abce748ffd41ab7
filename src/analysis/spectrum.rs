//! Frequency-domain features for the classifier.
//!
//! One clip maps to the magnitudes of the positive-frequency half of its
//! complex DFT: `sample_rate / 2` non-negative bins, phase discarded. The
//! transform length equals the sampling rate (one-second clips), which is not
//! a power of two, so planning is delegated to rustfft.

use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};

/// Reusable DFT plan for fixed-length waveforms.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    len: usize,
}

impl SpectrumAnalyzer {
    /// Plan a transform for waveforms of `len` samples.
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(len);
        Self { fft, len }
    }

    /// Number of output bins (`len / 2`).
    pub fn feature_len(&self) -> usize {
        self.len / 2
    }

    /// Magnitudes of the first `len / 2` DFT bins of `waveform`.
    pub fn magnitudes(&self, waveform: &[f32]) -> Result<Vec<f32>, String> {
        if waveform.len() != self.len {
            return Err(format!(
                "Waveform length {} does not match transform length {}",
                waveform.len(),
                self.len
            ));
        }
        let mut buffer: Vec<Complex<f32>> = waveform
            .iter()
            .map(|&sample| Complex::new(sample, 0.0))
            .collect();
        self.fft.process(&mut buffer);
        Ok(buffer[..self.feature_len()]
            .iter()
            .map(|bin| (bin.re * bin.re + bin.im * bin.im).sqrt())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn constant_signal_concentrates_in_bin_zero() {
        let analyzer = SpectrumAnalyzer::new(16);
        let spectrum = analyzer.magnitudes(&[1.0; 16]).unwrap();
        assert_eq!(spectrum.len(), 8);
        assert!((spectrum[0] - 16.0).abs() < 1e-4);
        for &bin in &spectrum[1..] {
            assert!(bin.abs() < 1e-4);
        }
    }

    #[test]
    fn cosine_peaks_at_its_frequency_bin() {
        let len = 64usize;
        let analyzer = SpectrumAnalyzer::new(len);
        let wave: Vec<f32> = (0..len)
            .map(|n| (2.0 * PI * 5.0 * n as f32 / len as f32).cos())
            .collect();
        let spectrum = analyzer.magnitudes(&wave).unwrap();
        assert!((spectrum[5] - len as f32 / 2.0).abs() < 1e-3);
        for (bin, &mag) in spectrum.iter().enumerate() {
            if bin != 5 {
                assert!(mag < 1e-2, "bin {bin} has magnitude {mag}");
            }
        }
    }

    #[test]
    fn transform_is_deterministic() {
        let len = 100usize;
        let analyzer = SpectrumAnalyzer::new(len);
        let wave: Vec<f32> = (0..len).map(|n| (n as f32 * 0.37).sin()).collect();
        let first = analyzer.magnitudes(&wave).unwrap();
        let second = analyzer.magnitudes(&wave).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let analyzer = SpectrumAnalyzer::new(32);
        assert!(analyzer.magnitudes(&[0.0; 31]).is_err());
    }

    #[test]
    fn non_power_of_two_lengths_are_supported() {
        let analyzer = SpectrumAnalyzer::new(16_000);
        let spectrum = analyzer.magnitudes(&vec![0.5; 16_000]).unwrap();
        assert_eq!(spectrum.len(), 8_000);
    }
}
