//! End-to-end assembly of one training run.
//!
//! Wires dataset discovery, the noise pool, the two prefetching streams, the
//! classifier and the training controller together, then reports final
//! metrics and a small qualitative prediction demo.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::analysis::{audio_decode, augment, spectrum::SpectrumAnalyzer};
use crate::config::{EVAL_BATCH_SIZE, PipelineConfig};
use crate::dataset::noise::NoiseBank;
use crate::dataset::samples::{LabeledClip, collect_speaker_dataset};
use crate::dataset::split::shuffle_and_split;
use crate::dataset::stream::{BatchStream, StreamSettings};
use crate::ml::metrics::precision_recall_by_class;
use crate::ml::resnet::{ResNetConfig, ResNetModel};
use crate::trainer::{TrainingController, TrainingReport};

/// Run the full pipeline to completion and return the training report.
pub fn run_training(config: &PipelineConfig) -> Result<TrainingReport, String> {
    config.validate()?;

    let dataset = collect_speaker_dataset(&config.audio_root())?;
    info!(
        "Discovered {} speakers: {}",
        dataset.classes.len(),
        dataset.classes.join(", ")
    );
    info!("Collected {} clips", dataset.clips.len());

    let noise = Arc::new(NoiseBank::load(&config.noise_root(), config.sample_rate)?);

    let classes = dataset.classes.clone();
    let split = shuffle_and_split(dataset.clips, config.valid_fraction, config.seed);
    info!(
        "Split: {} training clips, {} validation clips",
        split.train.len(),
        split.valid.len()
    );
    if split.valid.is_empty() {
        return Err("Validation split is empty; raise valid_fraction".to_string());
    }

    let demo_clips: Vec<LabeledClip> = split
        .valid
        .iter()
        .take(config.demo_clips)
        .cloned()
        .collect();

    let workers = config.worker_count();
    let train_stream = BatchStream::new(
        split.train,
        Some(noise.clone()),
        StreamSettings {
            name: "train".to_string(),
            sample_rate: config.sample_rate,
            batch_size: config.batch_size,
            shuffle_buffer: config.train_shuffle_buffer(),
            seed: config.seed,
            noise_scale: config.noise_scale,
            workers,
        },
    );
    let valid_stream = BatchStream::new(
        split.valid,
        Some(noise.clone()),
        StreamSettings {
            name: "valid".to_string(),
            sample_rate: config.sample_rate,
            batch_size: EVAL_BATCH_SIZE,
            shuffle_buffer: config.eval_shuffle_buffer(),
            seed: config.seed,
            noise_scale: config.noise_scale,
            workers,
        },
    );

    let model_config = ResNetConfig {
        input_len: config.feature_len(),
        ..ResNetConfig::default()
    };
    let model = ResNetModel::new(&model_config, classes.clone(), config.seed)?;
    let mut controller = TrainingController::new(config, model);
    let report = controller.run(&train_stream, &valid_stream)?;

    info!(
        "Training {:?} after {} epochs; best validation accuracy {:.4} at epoch {}",
        report.state, report.epochs_run, report.best_accuracy, report.best_epoch
    );
    info!(
        "Final validation: loss {:.4}, accuracy {:.4}",
        report.final_loss, report.final_accuracy
    );

    report_per_class(&controller, &valid_stream, &classes, report.epochs_run)?;
    prediction_demo(controller.model(), &demo_clips, &noise, config)?;

    Ok(report)
}

fn report_per_class(
    controller: &TrainingController<'_>,
    valid_stream: &BatchStream,
    classes: &[String],
    epochs_run: usize,
) -> Result<(), String> {
    let (_, cm) = controller.evaluate_with_confusion(valid_stream, epochs_run + 2)?;
    for (idx, stats) in precision_recall_by_class(&cm).iter().enumerate() {
        info!(
            "  {}: precision {:.3}, recall {:.3}, support {}",
            classes[idx], stats.precision, stats.recall, stats.support
        );
    }
    Ok(())
}

/// Predict a handful of noise-augmented validation clips and log the outcome.
pub fn prediction_demo(
    model: &ResNetModel,
    clips: &[LabeledClip],
    noise: &NoiseBank,
    config: &PipelineConfig,
) -> Result<(), String> {
    if clips.is_empty() {
        return Ok(());
    }
    let analyzer = SpectrumAnalyzer::new(config.sample_rate);
    let mut rng = StdRng::seed_from_u64(config.seed ^ 0xD3_A0_17);
    let mut correct = 0usize;
    for clip in clips {
        let waveform = audio_decode::decode_clip(&clip.path, config.sample_rate)?;
        let chunk = noise.chunk(rng.random_range(0..noise.len()));
        let mixed = augment::inject_noise(&waveform, chunk, config.noise_scale);
        let features = analyzer.magnitudes(&mixed)?;
        let probs = model.predict_proba(&features)?;
        let predicted = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let actual = &model.classes[clip.label];
        let guess = &model.classes[predicted];
        if predicted == clip.label {
            correct += 1;
            info!("Demo: {actual} correctly recognized (p={:.3})", probs[predicted]);
        } else {
            warn!(
                "Demo: {actual} misclassified as {guess} (p={:.3})",
                probs[predicted]
            );
        }
    }
    info!("Demo: {correct}/{} clips recognized", clips.len());
    Ok(())
}
