//! Model definition: parametrized residual blocks over magnitude spectra.
//!
//! Activations and weights use flat channel-major buffers: element `t` of
//! channel `c` lives at `c * len + t`, and conv weights at
//! `(out * in_channels + in) * kernel + k`. Convolutions are same-padded so
//! every block preserves temporal length until its final max-pool halves it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Average-pooling window (and stride) applied after the block stack.
pub(crate) const AVG_POOL_WIDTH: usize = 3;

/// Topology parameters for the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Spectral feature length fed to the first block.
    pub input_len: usize,
    /// Filter width of each residual block.
    pub block_filters: Vec<usize>,
    /// Convolutions per block (shortcut excluded).
    pub block_convs: Vec<usize>,
    /// Hidden fully-connected widths between flatten and the class layer.
    pub dense_units: Vec<usize>,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            input_len: 8_000,
            block_filters: vec![16, 32, 64, 128, 128],
            block_convs: vec![2, 2, 3, 3, 3],
            dense_units: vec![256, 128],
        }
    }
}

impl ResNetConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.block_filters.is_empty() {
            return Err("At least one residual block is required".to_string());
        }
        if self.block_filters.len() != self.block_convs.len() {
            return Err(format!(
                "block_filters ({}) and block_convs ({}) lengths differ",
                self.block_filters.len(),
                self.block_convs.len()
            ));
        }
        if self.block_filters.iter().any(|&f| f == 0) {
            return Err("Block filter widths must be positive".to_string());
        }
        if self.block_convs.iter().any(|&c| c == 0) {
            return Err("Each block needs at least one convolution".to_string());
        }
        if self.dense_units.iter().any(|&u| u == 0) {
            return Err("Dense widths must be positive".to_string());
        }
        let mut len = self.input_len;
        for _ in &self.block_filters {
            len /= 2;
        }
        if len < AVG_POOL_WIDTH {
            return Err(format!(
                "input_len {} leaves only {} samples after {} blocks; need at least {}",
                self.input_len,
                len,
                self.block_filters.len(),
                AVG_POOL_WIDTH
            ));
        }
        Ok(())
    }

    /// Flattened feature length entering the dense layers.
    pub fn flattened_len(&self) -> usize {
        let mut len = self.input_len;
        for _ in &self.block_filters {
            len /= 2;
        }
        let avg_len = (len - AVG_POOL_WIDTH) / AVG_POOL_WIDTH + 1;
        avg_len * self.block_filters[self.block_filters.len() - 1]
    }
}

/// A same-padded 1D convolution with flat weight storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv1d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Conv1d {
    fn init(in_channels: usize, out_channels: usize, kernel: usize, rng: &mut StdRng) -> Self {
        let mut weights = vec![0.0f32; out_channels * in_channels * kernel];
        for w in &mut weights {
            *w = (rng.random::<f32>() - 0.5) * 0.1;
        }
        Self {
            in_channels,
            out_channels,
            kernel,
            weights,
            bias: vec![0.0; out_channels],
        }
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.kernel == 0 || self.kernel % 2 == 0 {
            return Err(format!("{name}: kernel width must be odd, got {}", self.kernel));
        }
        if self.weights.len() != self.out_channels * self.in_channels * self.kernel {
            return Err(format!("{name}: weights length mismatch"));
        }
        if self.bias.len() != self.out_channels {
            return Err(format!("{name}: bias length mismatch"));
        }
        Ok(())
    }

    /// Same-padded forward pass over a `in_channels * len` input buffer.
    pub fn forward(&self, input: &[f32], len: usize) -> Vec<f32> {
        let pad = (self.kernel - 1) / 2;
        let mut out = vec![0.0f32; self.out_channels * len];
        for o in 0..self.out_channels {
            let out_base = o * len;
            for t in 0..len {
                let mut sum = self.bias[o];
                for i in 0..self.in_channels {
                    let in_base = i * len;
                    let w_base = (o * self.in_channels + i) * self.kernel;
                    for k in 0..self.kernel {
                        let src = t + k;
                        if src < pad {
                            continue;
                        }
                        let src = src - pad;
                        if src >= len {
                            continue;
                        }
                        sum += self.weights[w_base + k] * input[in_base + src];
                    }
                }
                out[out_base + t] = sum;
            }
        }
        out
    }
}

/// A fully-connected layer with flat weight storage (`out * in_dim + in`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub in_dim: usize,
    pub out_dim: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Dense {
    fn init(in_dim: usize, out_dim: usize, rng: &mut StdRng) -> Self {
        let mut weights = vec![0.0f32; out_dim * in_dim];
        for w in &mut weights {
            *w = (rng.random::<f32>() - 0.5) * 0.1;
        }
        Self {
            in_dim,
            out_dim,
            weights,
            bias: vec![0.0; out_dim],
        }
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.weights.len() != self.out_dim * self.in_dim {
            return Err(format!("{name}: weights length mismatch"));
        }
        if self.bias.len() != self.out_dim {
            return Err(format!("{name}: bias length mismatch"));
        }
        Ok(())
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.out_dim];
        for o in 0..self.out_dim {
            let mut sum = self.bias[o];
            let base = o * self.in_dim;
            for i in 0..self.in_dim {
                sum += self.weights[base + i] * input[i];
            }
            out[o] = sum;
        }
        out
    }
}

/// One residual block: a width-1 shortcut conv in parallel with a stack of
/// width-3 convolutions, summed and ReLU-activated before max-pooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualBlock {
    pub shortcut: Conv1d,
    pub convs: Vec<Conv1d>,
}

impl ResidualBlock {
    fn out_channels(&self) -> usize {
        self.shortcut.out_channels
    }
}

/// The full classifier with its class-name mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResNetModel {
    pub model_version: i64,
    pub input_len: usize,
    pub classes: Vec<String>,
    pub blocks: Vec<ResidualBlock>,
    pub hidden: Vec<Dense>,
    pub output: Dense,
}

impl ResNetModel {
    /// Build a freshly initialized model from a topology and class list.
    pub fn new(config: &ResNetConfig, classes: Vec<String>, seed: u64) -> Result<Self, String> {
        config.validate()?;
        if classes.len() < 2 {
            return Err(format!("Need at least 2 classes, got {}", classes.len()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut blocks = Vec::with_capacity(config.block_filters.len());
        let mut in_channels = 1usize;
        for (&filters, &conv_num) in config.block_filters.iter().zip(&config.block_convs) {
            let shortcut = Conv1d::init(in_channels, filters, 1, &mut rng);
            let mut convs = Vec::with_capacity(conv_num);
            for idx in 0..conv_num {
                let conv_in = if idx == 0 { in_channels } else { filters };
                convs.push(Conv1d::init(conv_in, filters, 3, &mut rng));
            }
            blocks.push(ResidualBlock { shortcut, convs });
            in_channels = filters;
        }

        let mut hidden = Vec::with_capacity(config.dense_units.len());
        let mut in_dim = config.flattened_len();
        for &units in &config.dense_units {
            hidden.push(Dense::init(in_dim, units, &mut rng));
            in_dim = units;
        }
        let output = Dense::init(in_dim, classes.len(), &mut rng);

        let model = Self {
            model_version: 1,
            input_len: config.input_len,
            classes,
            blocks,
            hidden,
            output,
        };
        model.validate()?;
        Ok(model)
    }

    /// Check every buffer shape and the channel chaining between layers.
    ///
    /// Run after deserializing a checkpoint so a corrupt file fails loudly
    /// instead of producing garbage predictions.
    pub fn validate(&self) -> Result<(), String> {
        if self.classes.len() < 2 {
            return Err(format!("Need at least 2 classes, got {}", self.classes.len()));
        }
        if self.blocks.is_empty() {
            return Err("Model has no residual blocks".to_string());
        }
        let mut in_channels = 1usize;
        let mut len = self.input_len;
        for (idx, block) in self.blocks.iter().enumerate() {
            let name = format!("block {idx}");
            block.shortcut.validate(&format!("{name} shortcut"))?;
            if block.shortcut.in_channels != in_channels {
                return Err(format!(
                    "{name}: shortcut expects {} input channels, chain provides {}",
                    block.shortcut.in_channels, in_channels
                ));
            }
            if block.convs.is_empty() {
                return Err(format!("{name}: no convolutions"));
            }
            let filters = block.out_channels();
            for (conv_idx, conv) in block.convs.iter().enumerate() {
                conv.validate(&format!("{name} conv {conv_idx}"))?;
                let expected_in = if conv_idx == 0 { in_channels } else { filters };
                if conv.in_channels != expected_in || conv.out_channels != filters {
                    return Err(format!(
                        "{name} conv {conv_idx}: channel mismatch ({}->{}, expected {}->{})",
                        conv.in_channels, conv.out_channels, expected_in, filters
                    ));
                }
            }
            in_channels = filters;
            len /= 2;
        }
        if len < AVG_POOL_WIDTH {
            return Err(format!(
                "input_len {} leaves {} samples after the block stack; need at least {}",
                self.input_len, len, AVG_POOL_WIDTH
            ));
        }
        let avg_len = (len - AVG_POOL_WIDTH) / AVG_POOL_WIDTH + 1;
        let mut in_dim = avg_len * in_channels;
        for (idx, dense) in self.hidden.iter().enumerate() {
            dense.validate(&format!("dense {idx}"))?;
            if dense.in_dim != in_dim {
                return Err(format!(
                    "dense {idx}: expects {} inputs, chain provides {}",
                    dense.in_dim, in_dim
                ));
            }
            in_dim = dense.out_dim;
        }
        self.output.validate("output")?;
        if self.output.in_dim != in_dim {
            return Err(format!(
                "output: expects {} inputs, chain provides {}",
                self.output.in_dim, in_dim
            ));
        }
        if self.output.out_dim != self.classes.len() {
            return Err(format!(
                "output: {} units for {} classes",
                self.output.out_dim,
                self.classes.len()
            ));
        }
        Ok(())
    }

    /// Class probabilities for one spectral feature vector.
    pub fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, String> {
        Ok(self.forward_trace(features)?.probs)
    }

    /// Index of the most probable class.
    pub fn predict_class_index(&self, features: &[f32]) -> Result<usize, String> {
        let probs = self.predict_proba(features)?;
        Ok(argmax(&probs))
    }

    /// Full forward pass retaining every activation needed for backprop.
    pub(crate) fn forward_trace(&self, features: &[f32]) -> Result<ForwardTrace, String> {
        if features.len() != self.input_len {
            return Err(format!(
                "Feature length {} does not match model input length {}",
                features.len(),
                self.input_len
            ));
        }

        let mut input = features.to_vec();
        let mut len = self.input_len;
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let shortcut = block.shortcut.forward(&input, len);
            let conv_num = block.convs.len();
            let mut hidden: Vec<Vec<f32>> = Vec::with_capacity(conv_num.saturating_sub(1));
            for conv in &block.convs[..conv_num - 1] {
                let prev: &[f32] = hidden.last().map(|v| v.as_slice()).unwrap_or(&input);
                let mut out = conv.forward(prev, len);
                relu_inplace(&mut out);
                hidden.push(out);
            }
            let main_in: &[f32] = hidden.last().map(|v| v.as_slice()).unwrap_or(&input);
            let main = block.convs[conv_num - 1].forward(main_in, len);
            let activated: Vec<f32> = shortcut
                .iter()
                .zip(main.iter())
                .map(|(&s, &m)| (s + m).max(0.0))
                .collect();
            let (pooled, pool_argmax, pooled_len) =
                max_pool_halve(&activated, block.out_channels(), len);
            blocks.push(BlockTrace {
                input,
                len_in: len,
                hidden,
                activated,
                pool_argmax,
            });
            input = pooled;
            len = pooled_len;
        }

        let channels = self.blocks[self.blocks.len() - 1].out_channels();
        let avg_len = (len - AVG_POOL_WIDTH) / AVG_POOL_WIDTH + 1;
        let mut avg = vec![0.0f32; channels * avg_len];
        for c in 0..channels {
            for j in 0..avg_len {
                let base = c * len + j * AVG_POOL_WIDTH;
                let mut sum = 0.0f32;
                for t in 0..AVG_POOL_WIDTH {
                    sum += input[base + t];
                }
                avg[c * avg_len + j] = sum / AVG_POOL_WIDTH as f32;
            }
        }

        let mut dense_hidden = Vec::with_capacity(self.hidden.len());
        for dense in &self.hidden {
            let prev: &[f32] = dense_hidden.last().map(|v: &Vec<f32>| v.as_slice()).unwrap_or(&avg);
            let mut out = dense.forward(prev);
            relu_inplace(&mut out);
            dense_hidden.push(out);
        }
        let out_in: &[f32] = dense_hidden
            .last()
            .map(|v| v.as_slice())
            .unwrap_or(&avg);
        let logits = self.output.forward(out_in);
        let probs = softmax(&logits);

        Ok(ForwardTrace {
            blocks,
            conv_out_len: len,
            avg,
            avg_len,
            dense_hidden,
            probs,
        })
    }

    /// Every trainable buffer in a fixed enumeration order.
    pub(crate) fn param_buffers_mut(&mut self) -> Vec<&mut Vec<f32>> {
        let mut buffers = Vec::new();
        for block in &mut self.blocks {
            buffers.push(&mut block.shortcut.weights);
            buffers.push(&mut block.shortcut.bias);
            for conv in &mut block.convs {
                buffers.push(&mut conv.weights);
                buffers.push(&mut conv.bias);
            }
        }
        for dense in &mut self.hidden {
            buffers.push(&mut dense.weights);
            buffers.push(&mut dense.bias);
        }
        buffers.push(&mut self.output.weights);
        buffers.push(&mut self.output.bias);
        buffers
    }

    /// Shapes of the trainable buffers, in enumeration order.
    pub(crate) fn param_shapes(&self) -> Vec<usize> {
        let mut shapes = Vec::new();
        for block in &self.blocks {
            shapes.push(block.shortcut.weights.len());
            shapes.push(block.shortcut.bias.len());
            for conv in &block.convs {
                shapes.push(conv.weights.len());
                shapes.push(conv.bias.len());
            }
        }
        for dense in &self.hidden {
            shapes.push(dense.weights.len());
            shapes.push(dense.bias.len());
        }
        shapes.push(self.output.weights.len());
        shapes.push(self.output.bias.len());
        shapes
    }
}

/// Per-block activations retained for the backward pass.
pub(crate) struct BlockTrace {
    /// Block input, `in_channels * len_in`.
    pub(crate) input: Vec<f32>,
    pub(crate) len_in: usize,
    /// Post-ReLU outputs of every convolution except the last.
    pub(crate) hidden: Vec<Vec<f32>>,
    /// `relu(shortcut + main)`, before pooling.
    pub(crate) activated: Vec<f32>,
    /// Absolute argmax index into `activated` for each pooled element.
    pub(crate) pool_argmax: Vec<usize>,
}

/// Activations of one full forward pass.
pub(crate) struct ForwardTrace {
    pub(crate) blocks: Vec<BlockTrace>,
    /// Temporal length of the final block's pooled output.
    pub(crate) conv_out_len: usize,
    /// Average-pooled features, flattened channel-major.
    pub(crate) avg: Vec<f32>,
    pub(crate) avg_len: usize,
    /// Post-ReLU hidden dense activations.
    pub(crate) dense_hidden: Vec<Vec<f32>>,
    pub(crate) probs: Vec<f32>,
}

fn relu_inplace(values: &mut [f32]) {
    for v in values {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Window-2 stride-2 max pooling with recorded argmax indices.
fn max_pool_halve(input: &[f32], channels: usize, len: usize) -> (Vec<f32>, Vec<usize>, usize) {
    let out_len = len / 2;
    let mut pooled = vec![0.0f32; channels * out_len];
    let mut argmax = vec![0usize; channels * out_len];
    for c in 0..channels {
        let in_base = c * len;
        let out_base = c * out_len;
        for j in 0..out_len {
            let a_idx = in_base + 2 * j;
            let b_idx = a_idx + 1;
            if input[b_idx] > input[a_idx] {
                pooled[out_base + j] = input[b_idx];
                argmax[out_base + j] = b_idx;
            } else {
                pooled[out_base + j] = input[a_idx];
                argmax[out_base + j] = a_idx;
            }
        }
    }
    (pooled, argmax, out_len)
}

/// Numerically stable softmax; uniform output for a degenerate input.
pub fn softmax(raw: &[f32]) -> Vec<f32> {
    if raw.is_empty() {
        return Vec::new();
    }
    let max = raw
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, |a, b| a.max(b));
    let mut out = vec![0.0f32; raw.len()];
    let mut sum = 0.0f32;
    for (i, &v) in raw.iter().enumerate() {
        let e = (v - max).exp();
        out[i] = e;
        sum += e;
    }
    if sum == 0.0 {
        let uniform = 1.0 / (raw.len() as f32);
        for v in &mut out {
            *v = uniform;
        }
        return out;
    }
    for v in &mut out {
        *v /= sum;
    }
    out
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ResNetConfig {
        ResNetConfig {
            input_len: 48,
            block_filters: vec![2, 3],
            block_convs: vec![2, 3],
            dense_units: vec![8, 4],
        }
    }

    fn tiny_model() -> ResNetModel {
        ResNetModel::new(
            &tiny_config(),
            vec!["alice".to_string(), "bob".to_string()],
            7,
        )
        .unwrap()
    }

    fn tiny_input(len: usize) -> Vec<f32> {
        (0..len).map(|n| ((n as f32 * 0.7).sin()).abs()).collect()
    }

    #[test]
    fn flattened_len_follows_pooling_arithmetic() {
        // 48 -> 24 -> 12 after two blocks; avg pool 3/3 -> 4; channels 3.
        assert_eq!(tiny_config().flattened_len(), 12);
    }

    #[test]
    fn default_topology_matches_expected_shape() {
        let config = ResNetConfig::default();
        config.validate().unwrap();
        // 8000 halves five times to 250; (250-3)/3+1 = 83 frames of 128 filters.
        assert_eq!(config.flattened_len(), 83 * 128);
    }

    #[test]
    fn output_is_a_probability_distribution() {
        let model = tiny_model();
        let probs = model.predict_proba(&tiny_input(48)).unwrap();
        assert_eq!(probs.len(), 2);
        assert!(probs.iter().all(|&p| p >= 0.0));
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn forward_is_deterministic() {
        let model = tiny_model();
        let input = tiny_input(48);
        assert_eq!(
            model.predict_proba(&input).unwrap(),
            model.predict_proba(&input).unwrap()
        );
    }

    #[test]
    fn wrong_input_length_is_rejected() {
        let model = tiny_model();
        assert!(model.predict_proba(&tiny_input(47)).is_err());
    }

    #[test]
    fn json_round_trip_preserves_predictions() {
        let model = tiny_model();
        let input = tiny_input(48);
        let json = serde_json::to_string(&model).unwrap();
        let restored: ResNetModel = serde_json::from_str(&json).unwrap();
        restored.validate().unwrap();
        assert_eq!(
            model.predict_proba(&input).unwrap(),
            restored.predict_proba(&input).unwrap()
        );
    }

    #[test]
    fn validate_rejects_truncated_weights() {
        let mut model = tiny_model();
        model.blocks[0].convs[0].weights.pop();
        assert!(model.validate().is_err());
    }

    #[test]
    fn validate_rejects_class_count_mismatch() {
        let mut model = tiny_model();
        model.classes.push("carol".to_string());
        assert!(model.validate().is_err());
    }

    #[test]
    fn max_pool_records_winning_indices() {
        // Two channels of length 4.
        let input = vec![1.0, 5.0, 2.0, 2.0, 9.0, 0.0, 3.0, 4.0];
        let (pooled, argmax, out_len) = max_pool_halve(&input, 2, 4);
        assert_eq!(out_len, 2);
        assert_eq!(pooled, vec![5.0, 2.0, 9.0, 4.0]);
        assert_eq!(argmax, vec![1, 2, 4, 7]);
    }

    #[test]
    fn softmax_handles_large_logits() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
        let sum: f32 = softmax(&[-50.0, 0.0, 80.0]).iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn same_seed_reproduces_initialization() {
        let config = tiny_config();
        let classes = vec!["a".to_string(), "b".to_string()];
        let first = ResNetModel::new(&config, classes.clone(), 11).unwrap();
        let second = ResNetModel::new(&config, classes, 11).unwrap();
        assert_eq!(first.blocks[0].convs[0].weights, second.blocks[0].convs[0].weights);
        assert_eq!(first.output.weights, second.output.weights);
    }
}
