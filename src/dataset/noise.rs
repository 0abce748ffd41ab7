//! Pooled one-second noise chunks for augmentation.
//!
//! Noise recordings are expected to have been resampled to the target rate by
//! an external step; this module only verifies the declared rate. Sources
//! that still disagree are skipped with a warning, but an empty pool is a
//! fatal configuration error.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::analysis::audio_decode;

use super::samples::collect_clip_files;

/// Flat pool of fixed-length noise chunks across all noise source files.
pub struct NoiseBank {
    chunks: Vec<Vec<f32>>,
    chunk_len: usize,
}

impl NoiseBank {
    /// Load every noise file under `noise_root` and pool its one-second chunks.
    pub fn load(noise_root: &Path, sample_rate: usize) -> Result<Self, String> {
        let mut files = Vec::new();
        collect_clip_files(noise_root, &mut files)
            .map_err(|err| format!("Scan noise root {}: {err}", noise_root.display()))?;
        files.sort();
        if files.is_empty() {
            return Err(format!(
                "No noise files found under {}",
                noise_root.display()
            ));
        }
        Self::from_files(&files, sample_rate)
    }

    /// Pool chunks from an explicit list of noise files.
    pub fn from_files(paths: &[PathBuf], sample_rate: usize) -> Result<Self, String> {
        let mut chunks = Vec::new();
        let mut skipped = 0usize;
        for path in paths {
            let decoded = match audio_decode::decode_mono(path) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!("Skipping noise file: {err}");
                    skipped += 1;
                    continue;
                }
            };
            if decoded.sample_rate as usize != sample_rate {
                warn!(
                    "Skipping noise file {}: declared {} Hz, expected {} Hz",
                    path.display(),
                    decoded.sample_rate,
                    sample_rate
                );
                skipped += 1;
                continue;
            }
            chunks.extend(chunk_waveform(&decoded.samples, sample_rate));
        }
        if chunks.is_empty() {
            return Err(format!(
                "No usable noise chunks ({} of {} files skipped)",
                skipped,
                paths.len()
            ));
        }
        info!(
            "Noise pool ready: {} chunks from {} files ({} skipped)",
            chunks.len(),
            paths.len() - skipped,
            skipped
        );
        Ok(Self {
            chunks,
            chunk_len: sample_rate,
        })
    }

    /// Build a bank directly from prepared chunks.
    pub fn from_chunks(chunks: Vec<Vec<f32>>, chunk_len: usize) -> Self {
        Self { chunks, chunk_len }
    }

    /// Number of pooled chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when the pool holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Length of each chunk in samples.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Borrow chunk `idx`.
    pub fn chunk(&self, idx: usize) -> &[f32] {
        &self.chunks[idx]
    }
}

/// Cut a waveform into non-overlapping chunks of `chunk_len` samples,
/// discarding the tail remainder.
pub fn chunk_waveform(samples: &[f32], chunk_len: usize) -> Vec<Vec<f32>> {
    let slices = samples.len() / chunk_len;
    (0..slices)
        .map(|idx| samples[idx * chunk_len..(idx + 1) * chunk_len].to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_noise_wav(dir: &Path, name: &str, rate: u32, frames: usize) -> PathBuf {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let path = dir.join(name);
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for frame in 0..frames {
            writer.write_sample((frame % 200) as i16 * 30).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn chunk_count_is_floor_of_length_over_rate() {
        let samples: Vec<f32> = (0..25).map(|v| v as f32).collect();
        let chunks = chunk_waveform(&samples, 10);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn chunks_reconstruct_a_prefix_of_the_source() {
        let samples: Vec<f32> = (0..23).map(|v| v as f32 * 0.5).collect();
        let chunk_len = 7;
        let chunks = chunk_waveform(&samples, chunk_len);
        let slices = samples.len() / chunk_len;
        assert_eq!(chunks.len(), slices);
        let rebuilt: Vec<f32> = chunks.into_iter().flatten().collect();
        assert_eq!(rebuilt, samples[..slices * chunk_len].to_vec());
    }

    #[test]
    fn six_second_file_yields_six_chunks_and_no_discard() {
        let rate = 1_000usize;
        let samples: Vec<f32> = (0..rate * 6).map(|v| (v as f32 * 0.01).sin()).collect();
        let chunks = chunk_waveform(&samples, rate);
        assert_eq!(chunks.len(), 6);
        let rebuilt_len: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        assert_eq!(rebuilt_len, samples.len());
    }

    #[test]
    fn mismatched_rate_files_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let good = write_noise_wav(dir.path(), "good.wav", 8_000, 16_000);
        let bad = write_noise_wav(dir.path(), "bad.wav", 44_100, 44_100);
        let bank = NoiseBank::from_files(&[good, bad], 8_000).unwrap();
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.chunk_len(), 8_000);
    }

    #[test]
    fn all_files_unusable_is_fatal() {
        let dir = tempdir().unwrap();
        let bad = write_noise_wav(dir.path(), "bad.wav", 44_100, 44_100);
        assert!(NoiseBank::from_files(&[bad], 8_000).is_err());
    }

    #[test]
    fn empty_noise_root_is_fatal() {
        let dir = tempdir().unwrap();
        assert!(NoiseBank::load(dir.path(), 8_000).is_err());
    }
}
