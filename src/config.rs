//! Pipeline configuration.
//!
//! All tunables live in one explicit struct passed into each component's
//! constructor; nothing reads process-wide globals. A JSON config file can
//! override the defaults, and CLI flags override the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Fixed batch size used for validation and inference streams.
pub const EVAL_BATCH_SIZE: usize = 32;

/// Complete configuration for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dataset root containing `audio/` (one folder per speaker) and `noise/`.
    pub data_root: PathBuf,
    /// Path of the best-model checkpoint file, overwritten on improvement.
    pub checkpoint_path: PathBuf,
    /// Target sampling rate; every clip is exactly one second at this rate.
    pub sample_rate: usize,
    /// Training batch size.
    pub batch_size: usize,
    /// Noise amplitude factor applied after amplitude matching.
    pub noise_scale: f32,
    /// Seed for the dataset shuffle/split and stream ordering.
    pub seed: u64,
    /// Fraction of clips held out for validation.
    pub valid_fraction: f64,
    /// Upper bound on training epochs.
    pub max_epochs: usize,
    /// Epochs without validation-accuracy improvement before stopping.
    pub patience: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Preprocessing worker count; 0 selects the available parallelism.
    pub workers: usize,
    /// Number of validation clips shown in the post-training demo.
    pub demo_clips: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            checkpoint_path: PathBuf::from("model.json"),
            sample_rate: 16_000,
            batch_size: 128,
            noise_scale: 0.5,
            seed: 43,
            valid_fraction: 0.1,
            max_epochs: 100,
            patience: 10,
            learning_rate: 1e-3,
            workers: 0,
            demo_clips: 10,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file, with defaults for absent fields.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|err| format!("Read config {}: {err}", path.display()))?;
        serde_json::from_str(&text)
            .map_err(|err| format!("Parse config {}: {err}", path.display()))
    }

    /// Root folder holding one subdirectory per speaker.
    pub fn audio_root(&self) -> PathBuf {
        self.data_root.join("audio")
    }

    /// Root folder holding background noise recordings.
    pub fn noise_root(&self) -> PathBuf {
        self.data_root.join("noise")
    }

    /// Shuffle-buffer size for the training stream.
    pub fn train_shuffle_buffer(&self) -> usize {
        self.batch_size.max(1) * 8
    }

    /// Shuffle-buffer size for validation and inference streams.
    pub fn eval_shuffle_buffer(&self) -> usize {
        EVAL_BATCH_SIZE * 8
    }

    /// Effective preprocessing worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Spectral feature length produced from one clip.
    pub fn feature_len(&self) -> usize {
        self.sample_rate / 2
    }

    /// Sanity-check values that would otherwise fail deep inside the run.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.valid_fraction) {
            return Err(format!(
                "valid_fraction must be in [0, 1), got {}",
                self.valid_fraction
            ));
        }
        if self.noise_scale < 0.0 {
            return Err(format!("noise_scale must be >= 0, got {}", self.noise_scale));
        }
        if self.max_epochs == 0 {
            return Err("max_epochs must be positive".to_string());
        }
        Ok(())
    }
}
