//! Noise augmentation for training and evaluation batches.
//!
//! Each waveform is mixed with one noise chunk drawn uniformly from the
//! pooled bank. The chunk is scaled so its peak matches the waveform's peak,
//! then attenuated by the configured factor. No clipping or renormalization
//! follows the mix; the summed amplitude may exceed the original dynamic
//! range, which is accepted rather than silently corrected.

use rand::Rng;
use rand::rngs::StdRng;

use crate::dataset::noise::NoiseBank;

/// Peak absolute amplitude of a waveform.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, &v| peak.max(v.abs()))
}

/// Mix `chunk` into `waveform`, matching the chunk's peak to the waveform's
/// peak before applying `scale`.
pub fn inject_noise(waveform: &[f32], chunk: &[f32], scale: f32) -> Vec<f32> {
    debug_assert_eq!(waveform.len(), chunk.len());
    let wave_peak = peak_amplitude(waveform);
    let chunk_peak = peak_amplitude(chunk);
    if chunk_peak == 0.0 {
        return waveform.to_vec();
    }
    let prop = wave_peak / chunk_peak;
    waveform
        .iter()
        .zip(chunk.iter())
        .map(|(&sample, &noise)| sample + noise * prop * scale)
        .collect()
}

/// Mix a randomly drawn chunk into every waveform of a batch.
///
/// Chunks are drawn independently with replacement; waveform order is
/// preserved so index correspondence with labels is untouched.
pub fn inject_batch(
    waveforms: &[Vec<f32>],
    bank: &NoiseBank,
    scale: f32,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    waveforms
        .iter()
        .map(|waveform| {
            let chunk = bank.chunk(rng.random_range(0..bank.len()));
            inject_noise(waveform, chunk, scale)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn peak_handles_negative_extremes() {
        assert_eq!(peak_amplitude(&[0.1, -0.9, 0.5]), 0.9);
        assert_eq!(peak_amplitude(&[]), 0.0);
    }

    #[test]
    fn noise_term_peak_equals_scale_times_waveform_peak() {
        let waveform = vec![0.0, 0.8, -0.4, 0.2];
        let chunk = vec![0.1, -0.2, 0.05, 0.2];
        let scale = 0.5;
        let mixed = inject_noise(&waveform, &chunk, scale);

        let noise_term: Vec<f32> = mixed
            .iter()
            .zip(waveform.iter())
            .map(|(&m, &w)| m - w)
            .collect();
        let expected_peak = scale * peak_amplitude(&waveform);
        assert!((peak_amplitude(&noise_term) - expected_peak).abs() < 1e-6);
    }

    #[test]
    fn mixed_peak_is_bounded() {
        let waveform = vec![0.3, -0.9, 0.6];
        let chunk = vec![-0.5, 0.25, 0.1];
        let scale = 0.5;
        let mixed = inject_noise(&waveform, &chunk, scale);
        let bound = (1.0 + scale) * peak_amplitude(&waveform) + 1e-6;
        assert!(peak_amplitude(&mixed) <= bound);
    }

    #[test]
    fn silent_chunk_passes_waveform_through() {
        let waveform = vec![0.2, -0.1];
        let mixed = inject_noise(&waveform, &[0.0, 0.0], 0.5);
        assert_eq!(mixed, waveform);
    }

    #[test]
    fn batch_injection_preserves_order_and_length() {
        let bank = NoiseBank::from_chunks(vec![vec![0.5, -0.5], vec![0.1, 0.1]], 2);
        let waveforms = vec![vec![1.0, 0.0], vec![0.0, -1.0]];
        let mut rng = StdRng::seed_from_u64(7);
        let mixed = inject_batch(&waveforms, &bank, 0.5, &mut rng);
        assert_eq!(mixed.len(), 2);
        assert_eq!(mixed[0].len(), 2);
        // Index 0 still reflects the first waveform's content.
        assert!(mixed[0][0] >= 0.5);
    }
}
