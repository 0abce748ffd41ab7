//! Epoch loop, early stopping and checkpointing.
//!
//! The controller owns the model and optimizer state for the duration of a
//! run. Each epoch is one full pass over the training stream followed by one
//! evaluation pass over the validation stream; the decision to checkpoint or
//! stop is an explicit return value of the accuracy tracker rather than a
//! callback side effect.

use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::config::PipelineConfig;
use crate::dataset::stream::BatchStream;
use crate::ml::metrics::ConfusionMatrix;
use crate::ml::resnet::{
    AdamState, BatchStats, ResNetModel, TrainOptions, evaluate_batch, train_batch,
};

/// Terminal state of a training run; both are normal termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The configured maximum epoch count was reached.
    Completed,
    /// Validation accuracy stalled for the configured patience.
    EarlyStopped,
}

/// Decision after observing one epoch's validation accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// Strict improvement on the best accuracy seen so far.
    Improved,
    /// No improvement, patience not yet exhausted.
    Wait,
    /// Patience exhausted; halt and restore the best parameters.
    Stop,
}

/// Tracks the best validation accuracy and the epochs since it was set.
pub struct EarlyStopping {
    patience: usize,
    best_accuracy: f64,
    best_epoch: usize,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience: patience.max(1),
            best_accuracy: f64::NEG_INFINITY,
            best_epoch: 0,
            stale: 0,
        }
    }

    /// Feed one epoch's validation accuracy and get the controller's move.
    pub fn observe(&mut self, epoch: usize, accuracy: f64) -> StopDecision {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            self.best_epoch = epoch;
            self.stale = 0;
            return StopDecision::Improved;
        }
        self.stale += 1;
        if self.stale >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Wait
        }
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub state: RunState,
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_accuracy: f64,
    pub final_loss: f64,
    pub final_accuracy: f64,
}

/// Drives epochs over the two streams and owns the model state.
pub struct TrainingController<'a> {
    config: &'a PipelineConfig,
    model: ResNetModel,
    adam: AdamState,
    options: TrainOptions,
}

impl<'a> TrainingController<'a> {
    pub fn new(config: &'a PipelineConfig, model: ResNetModel) -> Self {
        let adam = AdamState::new(&model);
        let options = TrainOptions {
            learning_rate: config.learning_rate,
            ..TrainOptions::default()
        };
        Self {
            config,
            model,
            adam,
            options,
        }
    }

    /// The current model parameters.
    pub fn model(&self) -> &ResNetModel {
        &self.model
    }

    /// Run to a terminal state and report final validation metrics.
    pub fn run(
        &mut self,
        train_stream: &BatchStream,
        valid_stream: &BatchStream,
    ) -> Result<TrainingReport, String> {
        let mut stopper = EarlyStopping::new(self.config.patience);
        let mut state = RunState::Completed;
        let mut epochs_run = 0usize;

        for epoch in 1..=self.config.max_epochs {
            epochs_run = epoch;
            let train_stats = self.training_pass(train_stream, epoch)?;
            let valid_stats = self.validation_pass(valid_stream, epoch)?;
            info!(
                "Epoch {epoch}: train loss {:.4} acc {:.4} | valid loss {:.4} acc {:.4}",
                train_stats.mean_loss(),
                train_stats.accuracy(),
                valid_stats.mean_loss(),
                valid_stats.accuracy()
            );

            match stopper.observe(epoch, valid_stats.accuracy()) {
                StopDecision::Improved => {
                    save_checkpoint(&self.config.checkpoint_path, &self.model)?;
                    info!(
                        "Validation accuracy improved to {:.4}; checkpoint written to {}",
                        stopper.best_accuracy(),
                        self.config.checkpoint_path.display()
                    );
                }
                StopDecision::Wait => {}
                StopDecision::Stop => {
                    info!(
                        "No improvement for {} epochs; stopping at epoch {epoch} and \
                         restoring parameters from epoch {}",
                        self.config.patience,
                        stopper.best_epoch()
                    );
                    self.model = load_checkpoint(&self.config.checkpoint_path)?;
                    state = RunState::EarlyStopped;
                    break;
                }
            }
        }

        // Final evaluation pass over the validation stream.
        let (final_stats, _) = self.evaluate_with_confusion(valid_stream, epochs_run + 1)?;
        Ok(TrainingReport {
            state,
            epochs_run,
            best_epoch: stopper.best_epoch(),
            best_accuracy: stopper.best_accuracy(),
            final_loss: final_stats.mean_loss(),
            final_accuracy: final_stats.accuracy(),
        })
    }

    fn training_pass(
        &mut self,
        stream: &BatchStream,
        epoch: usize,
    ) -> Result<BatchStats, String> {
        let mut pass = stream.epoch(epoch);
        let mut stats = BatchStats::default();
        while let Some(batch) = pass.next_batch() {
            let batch = batch?;
            stats.merge(train_batch(
                &mut self.model,
                &mut self.adam,
                &self.options,
                &batch.features,
                &batch.labels,
            )?);
        }
        if stats.count == 0 {
            return Err("Training stream produced no batches".to_string());
        }
        Ok(stats)
    }

    fn validation_pass(&self, stream: &BatchStream, epoch: usize) -> Result<BatchStats, String> {
        let mut pass = stream.epoch(epoch);
        let mut stats = BatchStats::default();
        while let Some(batch) = pass.next_batch() {
            let batch = batch?;
            stats.merge(evaluate_batch(&self.model, &batch.features, &batch.labels)?);
        }
        if stats.count == 0 {
            return Err("Validation stream produced no batches".to_string());
        }
        Ok(stats)
    }

    /// Evaluation pass that also fills a confusion matrix for reporting.
    pub fn evaluate_with_confusion(
        &self,
        stream: &BatchStream,
        epoch: usize,
    ) -> Result<(BatchStats, ConfusionMatrix), String> {
        let mut pass = stream.epoch(epoch);
        let mut stats = BatchStats::default();
        let mut cm = ConfusionMatrix::new(self.model.classes.len());
        while let Some(batch) = pass.next_batch() {
            let batch = batch?;
            stats.merge(evaluate_batch(&self.model, &batch.features, &batch.labels)?);
            for (features, &truth) in batch.features.iter().zip(batch.labels.iter()) {
                let predicted = self.model.predict_class_index(features)?;
                cm.add(truth, predicted);
            }
        }
        Ok((stats, cm))
    }
}

/// Persist the model as JSON, atomically replacing any prior checkpoint.
pub fn save_checkpoint(path: &Path, model: &ResNetModel) -> Result<(), String> {
    let json = serde_json::to_string(model)
        .map_err(|err| format!("Serialize checkpoint: {err}"))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| format!("Create checkpoint temp file in {}: {err}", dir.display()))?;
    tmp.as_file_mut()
        .write_all(json.as_bytes())
        .map_err(|err| format!("Write checkpoint: {err}"))?;
    tmp.persist(path)
        .map_err(|err| format!("Replace checkpoint {}: {err}", path.display()))?;
    Ok(())
}

/// Load and validate a checkpoint written by `save_checkpoint`.
pub fn load_checkpoint(path: &Path) -> Result<ResNetModel, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("Read checkpoint {}: {err}", path.display()))?;
    let model: ResNetModel = serde_json::from_str(&text)
        .map_err(|err| format!("Parse checkpoint {}: {err}", path.display()))?;
    model
        .validate()
        .map_err(|err| format!("Invalid checkpoint {}: {err}", path.display()))?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::resnet::ResNetConfig;
    use tempfile::tempdir;

    #[test]
    fn early_stopping_halts_after_patience_without_improvement() {
        // Accuracy peaks at epoch 12 and never improves again; with patience
        // 10 the run must stop at epoch 22.
        let mut stopper = EarlyStopping::new(10);
        let mut stopped_at = None;
        for epoch in 1..=100 {
            let accuracy = if epoch <= 12 {
                0.5 + epoch as f64 * 0.01
            } else {
                0.3
            };
            match stopper.observe(epoch, accuracy) {
                StopDecision::Stop => {
                    stopped_at = Some(epoch);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(stopped_at, Some(22));
        assert_eq!(stopper.best_epoch(), 12);
        assert!((stopper.best_accuracy() - 0.62).abs() < 1e-9);
    }

    #[test]
    fn equal_accuracy_does_not_count_as_improvement() {
        let mut stopper = EarlyStopping::new(2);
        assert_eq!(stopper.observe(1, 0.7), StopDecision::Improved);
        assert_eq!(stopper.observe(2, 0.7), StopDecision::Wait);
        assert_eq!(stopper.observe(3, 0.7), StopDecision::Stop);
    }

    #[test]
    fn first_observation_always_improves() {
        let mut stopper = EarlyStopping::new(3);
        assert_eq!(stopper.observe(1, 0.0), StopDecision::Improved);
    }

    fn tiny_model() -> ResNetModel {
        let config = ResNetConfig {
            input_len: 24,
            block_filters: vec![2],
            block_convs: vec![2],
            dense_units: vec![4],
        };
        ResNetModel::new(
            &config,
            vec!["alice".to_string(), "bob".to_string()],
            3,
        )
        .unwrap()
    }

    #[test]
    fn checkpoint_round_trips_and_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = tiny_model();
        save_checkpoint(&path, &model).unwrap();
        let restored = load_checkpoint(&path).unwrap();
        assert_eq!(restored.classes, model.classes);
        assert_eq!(restored.output.weights, model.output.weights);
    }

    #[test]
    fn checkpoint_overwrites_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let first = tiny_model();
        save_checkpoint(&path, &first).unwrap();
        let mut second = tiny_model();
        second.output.bias[0] = 42.0;
        save_checkpoint(&path, &second).unwrap();
        let restored = load_checkpoint(&path).unwrap();
        assert_eq!(restored.output.bias[0], 42.0);
    }

    #[test]
    fn corrupt_checkpoint_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, "{\"not\": \"a model\"}").unwrap();
        assert!(load_checkpoint(&path).is_err());
    }
}
