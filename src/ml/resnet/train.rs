//! Gradient computation and the Adam parameter update.
//!
//! Gradients are accumulated per batch into buffers mirroring the model's
//! parameter enumeration, averaged, then applied by Adam with bias-corrected
//! moment estimates. The optimizer state lives outside the model so a
//! checkpoint holds only learnable parameters.

use super::model::{
    AVG_POOL_WIDTH, Conv1d, Dense, ForwardTrace, ResNetModel, argmax,
};

/// Optimizer hyperparameters.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Aggregated loss/accuracy over one or more batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub loss_sum: f64,
    pub correct: usize,
    pub count: usize,
}

impl BatchStats {
    pub fn merge(&mut self, other: BatchStats) {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.count += other.count;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.loss_sum / self.count as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

/// Adam moment buffers aligned with the model's parameter enumeration.
pub struct AdamState {
    step: u64,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl AdamState {
    pub fn new(model: &ResNetModel) -> Self {
        let shapes = model.param_shapes();
        Self {
            step: 0,
            m: shapes.iter().map(|&n| vec![0.0; n]).collect(),
            v: shapes.iter().map(|&n| vec![0.0; n]).collect(),
        }
    }

    fn apply(
        &mut self,
        model: &mut ResNetModel,
        grads: &mut [Vec<f32>],
        options: &TrainOptions,
    ) -> Result<(), String> {
        let params = model.param_buffers_mut();
        if params.len() != grads.len() || params.len() != self.m.len() {
            return Err("Optimizer state does not match model topology".to_string());
        }
        self.step += 1;
        let t = self.step as f32;
        let bias1 = 1.0 - options.beta1.powf(t);
        let bias2 = 1.0 - options.beta2.powf(t);
        let step_size = options.learning_rate * bias2.sqrt() / bias1;
        for (((param, grad), m), v) in params
            .into_iter()
            .zip(grads.iter())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            if param.len() != grad.len() {
                return Err("Gradient buffer does not match parameter buffer".to_string());
            }
            for i in 0..param.len() {
                let g = grad[i];
                m[i] = options.beta1 * m[i] + (1.0 - options.beta1) * g;
                v[i] = options.beta2 * v[i] + (1.0 - options.beta2) * g * g;
                param[i] -= step_size * m[i] / (v[i].sqrt() + options.epsilon);
            }
        }
        Ok(())
    }
}

/// One optimizer step on a batch; returns the batch's pre-update stats.
pub fn train_batch(
    model: &mut ResNetModel,
    adam: &mut AdamState,
    options: &TrainOptions,
    features: &[Vec<f32>],
    labels: &[usize],
) -> Result<BatchStats, String> {
    if features.len() != labels.len() {
        return Err("Mismatched feature/label lengths".to_string());
    }
    if features.is_empty() {
        return Err("Empty batch".to_string());
    }
    let n_classes = model.classes.len();
    let mut grads: Vec<Vec<f32>> = model
        .param_shapes()
        .iter()
        .map(|&n| vec![0.0; n])
        .collect();
    let mut stats = BatchStats::default();

    for (x, &y) in features.iter().zip(labels.iter()) {
        if y >= n_classes {
            return Err(format!("Label {y} out of range for {n_classes} classes"));
        }
        let trace = model.forward_trace(x)?;
        stats.loss_sum += cross_entropy(&trace.probs, y);
        if argmax(&trace.probs) == y {
            stats.correct += 1;
        }
        stats.count += 1;
        backward(model, &trace, y, &mut grads);
    }

    let scale = 1.0 / features.len() as f32;
    for buffer in &mut grads {
        for g in buffer.iter_mut() {
            *g *= scale;
        }
    }
    adam.apply(model, &mut grads, options)?;
    Ok(stats)
}

/// Forward-only pass over a batch in evaluation mode.
pub fn evaluate_batch(
    model: &ResNetModel,
    features: &[Vec<f32>],
    labels: &[usize],
) -> Result<BatchStats, String> {
    if features.len() != labels.len() {
        return Err("Mismatched feature/label lengths".to_string());
    }
    let mut stats = BatchStats::default();
    for (x, &y) in features.iter().zip(labels.iter()) {
        let probs = model.predict_proba(x)?;
        stats.loss_sum += cross_entropy(&probs, y);
        if argmax(&probs) == y {
            stats.correct += 1;
        }
        stats.count += 1;
    }
    Ok(stats)
}

fn cross_entropy(probs: &[f32], label: usize) -> f64 {
    -(probs[label].max(1e-12) as f64).ln()
}

/// Accumulate one sample's gradients into `grads` (model enumeration order).
fn backward(model: &ResNetModel, trace: &ForwardTrace, label: usize, grads: &mut [Vec<f32>]) {
    // Walk the enumeration to find each layer's gradient slot.
    let mut cursor = 0usize;
    let mut block_slots = Vec::with_capacity(model.blocks.len());
    for block in &model.blocks {
        let shortcut_slot = cursor;
        cursor += 2;
        let conv_slot = cursor;
        cursor += 2 * block.convs.len();
        block_slots.push((shortcut_slot, conv_slot));
    }
    let mut dense_slots = Vec::with_capacity(model.hidden.len());
    for _ in &model.hidden {
        dense_slots.push(cursor);
        cursor += 2;
    }
    let output_slot = cursor;

    // Softmax + cross-entropy gradient on the logits.
    let mut d_logits = trace.probs.clone();
    d_logits[label] -= 1.0;

    // Output layer.
    let out_in: &[f32] = trace
        .dense_hidden
        .last()
        .map(|v| v.as_slice())
        .unwrap_or(&trace.avg);
    let mut d_prev = dense_backward(&model.output, out_in, &d_logits, grads, output_slot);

    // Hidden dense layers, in reverse.
    for idx in (0..model.hidden.len()).rev() {
        relu_mask(&mut d_prev, &trace.dense_hidden[idx]);
        let input: &[f32] = if idx == 0 {
            &trace.avg
        } else {
            &trace.dense_hidden[idx - 1]
        };
        d_prev = dense_backward(&model.hidden[idx], input, &d_prev, grads, dense_slots[idx]);
    }

    // Average pooling: spread each output gradient uniformly over its window.
    let channels = model.blocks[model.blocks.len() - 1].shortcut.out_channels;
    let conv_len = trace.conv_out_len;
    let mut d_pooled = vec![0.0f32; channels * conv_len];
    let inv = 1.0 / AVG_POOL_WIDTH as f32;
    for c in 0..channels {
        for j in 0..trace.avg_len {
            let g = d_prev[c * trace.avg_len + j] * inv;
            let base = c * conv_len + j * AVG_POOL_WIDTH;
            for t in 0..AVG_POOL_WIDTH {
                d_pooled[base + t] += g;
            }
        }
    }

    // Residual blocks, in reverse.
    for bi in (0..model.blocks.len()).rev() {
        let block = &model.blocks[bi];
        let tr = &trace.blocks[bi];
        let (shortcut_slot, conv_slot) = block_slots[bi];
        let len_in = tr.len_in;

        // Max pooling routes each gradient to the recorded winner.
        let out_ch = block.shortcut.out_channels;
        let mut d_act = vec![0.0f32; out_ch * len_in];
        for (slot, &src) in tr.pool_argmax.iter().enumerate() {
            d_act[src] += d_pooled[slot];
        }
        relu_mask(&mut d_act, &tr.activated);

        // The post-add gradient feeds both the shortcut and the main path.
        let mut d_input = vec![0.0f32; block.shortcut.in_channels * len_in];
        conv_backward(
            &block.shortcut,
            &tr.input,
            len_in,
            &d_act,
            grads,
            shortcut_slot,
            Some(&mut d_input),
        );

        let conv_num = block.convs.len();
        let main_in: &[f32] = tr.hidden.last().map(|v| v.as_slice()).unwrap_or(&tr.input);
        let last = conv_num - 1;
        let mut d_h = vec![0.0f32; block.convs[last].in_channels * len_in];
        conv_backward(
            &block.convs[last],
            main_in,
            len_in,
            &d_act,
            grads,
            conv_slot + 2 * last,
            Some(&mut d_h),
        );
        for j in (0..last).rev() {
            relu_mask(&mut d_h, &tr.hidden[j]);
            let input: &[f32] = if j == 0 { &tr.input } else { &tr.hidden[j - 1] };
            let mut d_next = vec![0.0f32; block.convs[j].in_channels * len_in];
            conv_backward(
                &block.convs[j],
                input,
                len_in,
                &d_h,
                grads,
                conv_slot + 2 * j,
                Some(&mut d_next),
            );
            d_h = d_next;
        }
        for (dv, &m) in d_input.iter_mut().zip(d_h.iter()) {
            *dv += m;
        }
        d_pooled = d_input;
    }
}

fn relu_mask(grad: &mut [f32], activation: &[f32]) {
    for (g, &a) in grad.iter_mut().zip(activation.iter()) {
        if a <= 0.0 {
            *g = 0.0;
        }
    }
}

/// Accumulate dense-layer gradients; returns the gradient wrt the input.
fn dense_backward(
    layer: &Dense,
    input: &[f32],
    d_out: &[f32],
    grads: &mut [Vec<f32>],
    slot: usize,
) -> Vec<f32> {
    let mut d_input = vec![0.0f32; layer.in_dim];
    for o in 0..layer.out_dim {
        let g = d_out[o];
        grads[slot + 1][o] += g;
        let base = o * layer.in_dim;
        for i in 0..layer.in_dim {
            grads[slot][base + i] += g * input[i];
            d_input[i] += g * layer.weights[base + i];
        }
    }
    d_input
}

/// Accumulate conv-layer gradients; optionally propagates to the input.
fn conv_backward(
    conv: &Conv1d,
    input: &[f32],
    len: usize,
    d_out: &[f32],
    grads: &mut [Vec<f32>],
    slot: usize,
    mut d_input: Option<&mut Vec<f32>>,
) {
    let pad = (conv.kernel - 1) / 2;
    for o in 0..conv.out_channels {
        let out_base = o * len;
        for t in 0..len {
            let g = d_out[out_base + t];
            if g == 0.0 {
                continue;
            }
            grads[slot + 1][o] += g;
            for i in 0..conv.in_channels {
                let in_base = i * len;
                let w_base = (o * conv.in_channels + i) * conv.kernel;
                for k in 0..conv.kernel {
                    let src = t + k;
                    if src < pad {
                        continue;
                    }
                    let src = src - pad;
                    if src >= len {
                        continue;
                    }
                    grads[slot][w_base + k] += g * input[in_base + src];
                    if let Some(d_in) = d_input.as_deref_mut() {
                        d_in[in_base + src] += g * conv.weights[w_base + k];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::resnet::ResNetConfig;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tiny_config() -> ResNetConfig {
        ResNetConfig {
            input_len: 24,
            block_filters: vec![2, 3],
            block_convs: vec![2, 3],
            dense_units: vec![6],
        }
    }

    fn tiny_model(seed: u64) -> ResNetModel {
        ResNetModel::new(
            &tiny_config(),
            vec!["alice".to_string(), "bob".to_string()],
            seed,
        )
        .unwrap()
    }

    /// Two visibly different feature patterns, one per class.
    fn toy_batch(samples_per_class: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(5);
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for idx in 0..samples_per_class * 2 {
            let label = idx % 2;
            let row: Vec<f32> = (0..24)
                .map(|t| {
                    let base = if label == 0 {
                        (t as f32 * 0.3).sin()
                    } else {
                        2.0 - t as f32 * 0.1
                    };
                    base + rng.random::<f32>() * 0.05
                })
                .collect();
            features.push(row);
            labels.push(label);
        }
        (features, labels)
    }

    fn batch_loss(model: &ResNetModel, features: &[Vec<f32>], labels: &[usize]) -> f64 {
        evaluate_batch(model, features, labels).unwrap().mean_loss()
    }

    #[test]
    fn plain_gradient_step_decreases_loss() {
        let mut model = tiny_model(3);
        let (features, labels) = toy_batch(4);
        let before = batch_loss(&model, &features, &labels);

        // Accumulate gradients manually and take one small descent step.
        let mut grads: Vec<Vec<f32>> = model
            .param_shapes()
            .iter()
            .map(|&n| vec![0.0; n])
            .collect();
        for (x, &y) in features.iter().zip(labels.iter()) {
            let trace = model.forward_trace(x).unwrap();
            backward(&model, &trace, y, &mut grads);
        }
        let eta = 1e-3 / features.len() as f32;
        for (param, grad) in model.param_buffers_mut().into_iter().zip(grads.iter()) {
            for i in 0..param.len() {
                param[i] -= eta * grad[i];
            }
        }

        let after = batch_loss(&model, &features, &labels);
        assert!(
            after < before,
            "loss did not decrease: before={before} after={after}"
        );
    }

    #[test]
    fn adam_fits_a_separable_toy_problem() {
        let mut model = tiny_model(7);
        let mut adam = AdamState::new(&model);
        let options = TrainOptions::default();
        let (features, labels) = toy_batch(8);

        let before = batch_loss(&model, &features, &labels);
        let mut last = BatchStats::default();
        for _ in 0..40 {
            last = train_batch(&mut model, &mut adam, &options, &features, &labels).unwrap();
        }
        let after = batch_loss(&model, &features, &labels);
        assert!(
            after < before * 0.5,
            "training barely moved: before={before} after={after}"
        );
        assert!(last.accuracy() > 0.5);
    }

    #[test]
    fn train_batch_rejects_misaligned_inputs() {
        let mut model = tiny_model(1);
        let mut adam = AdamState::new(&model);
        let options = TrainOptions::default();
        let (features, _) = toy_batch(1);
        assert!(train_batch(&mut model, &mut adam, &options, &features, &[0]).is_err());
        assert!(
            train_batch(&mut model, &mut adam, &options, &[], &[]).is_err()
        );
    }

    #[test]
    fn out_of_range_label_is_rejected() {
        let mut model = tiny_model(1);
        let mut adam = AdamState::new(&model);
        let options = TrainOptions::default();
        let (features, _) = toy_batch(1);
        let bad_labels = vec![9; features.len()];
        assert!(train_batch(&mut model, &mut adam, &options, &features, &bad_labels).is_err());
    }

    #[test]
    fn evaluation_does_not_change_parameters() {
        let model = tiny_model(2);
        let reference = serde_json::to_string(&model).unwrap();
        let (features, labels) = toy_batch(2);
        evaluate_batch(&model, &features, &labels).unwrap();
        assert_eq!(serde_json::to_string(&model).unwrap(), reference);
    }

    #[test]
    fn stats_merge_and_ratios() {
        let mut stats = BatchStats {
            loss_sum: 2.0,
            correct: 3,
            count: 4,
        };
        stats.merge(BatchStats {
            loss_sum: 1.0,
            correct: 1,
            count: 4,
        });
        assert!((stats.mean_loss() - 0.375).abs() < 1e-9);
        assert!((stats.accuracy() - 0.5).abs() < 1e-9);
    }
}
