//! Prefetching batch streams.
//!
//! Preprocessing (decode, noise injection, spectral transform) runs on a pool
//! of worker threads that pull batch plans from a shared list and push
//! finished feature batches into a bounded queue, keeping the training step
//! fed without unbounded memory growth. Batches carry sequence numbers so the
//! consumer observes the deterministic buffered-shuffle order even though
//! workers complete out of order. Within a batch, feature index `i` always
//! corresponds to label index `i`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::analysis::{audio_decode, augment, spectrum::SpectrumAnalyzer};

use super::noise::NoiseBank;
use super::samples::LabeledClip;

/// One preprocessed batch of spectral features with aligned labels.
pub struct FeatureBatch {
    /// Position of this batch in the epoch's iteration order.
    pub seq: usize,
    /// Spectral features, one row per clip.
    pub features: Vec<Vec<f32>>,
    /// Labels aligned with `features` by index.
    pub labels: Vec<usize>,
}

/// Settings shared by every epoch of one stream.
#[derive(Clone)]
pub struct StreamSettings {
    /// Stream name used in logs.
    pub name: String,
    /// Target sampling rate; also the clip length in samples.
    pub sample_rate: usize,
    /// Clips per batch; the final batch of an epoch may be smaller.
    pub batch_size: usize,
    /// Bounded reshuffle window applied to iteration order each epoch.
    pub shuffle_buffer: usize,
    /// Seed for the iteration-order shuffle (fixed across epochs).
    pub seed: u64,
    /// Noise amplitude factor.
    pub noise_scale: f32,
    /// Number of preprocessing workers.
    pub workers: usize,
}

/// A lazily evaluated stream of preprocessed batches over a clip collection.
pub struct BatchStream {
    clips: Arc<Vec<LabeledClip>>,
    noise: Option<Arc<NoiseBank>>,
    settings: StreamSettings,
}

impl BatchStream {
    /// Create a stream; pass `None` for `noise` to produce clean features.
    pub fn new(
        clips: Vec<LabeledClip>,
        noise: Option<Arc<NoiseBank>>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            clips: Arc::new(clips),
            noise,
            settings,
        }
    }

    /// Number of clips in the stream.
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    /// True when the stream holds no clips.
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    /// Number of batches per epoch, counting a trailing partial batch.
    pub fn batches_per_epoch(&self) -> usize {
        self.clips.len().div_ceil(self.settings.batch_size.max(1))
    }

    /// Start one pass over the stream, spawning the preprocessing workers.
    ///
    /// Iteration order is fixed by the stream seed; noise pairing is fresh
    /// per epoch (derived from the epoch number) so every pass sees new
    /// augmentation.
    pub fn epoch(&self, epoch: usize) -> EpochStream {
        let order = buffered_shuffle(&self.clips, self.settings.shuffle_buffer, self.settings.seed);
        let batch_size = self.settings.batch_size.max(1);
        let plans: VecDeque<BatchPlan> = order
            .chunks(batch_size)
            .enumerate()
            .map(|(seq, clips)| BatchPlan {
                seq,
                clips: clips.to_vec(),
            })
            .collect();
        let total_batches = plans.len();

        let workers = self.settings.workers.max(1).min(total_batches.max(1));
        let queue = Arc::new(BatchQueue::new(workers * 2));
        let shutdown = Arc::new(AtomicBool::new(false));
        let work = Arc::new(Mutex::new(plans));

        tracing::debug!(
            "{} stream epoch {}: {} batches, {} workers",
            self.settings.name,
            epoch,
            total_batches,
            workers
        );
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            queue.producer_started();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            let work = work.clone();
            let noise = self.noise.clone();
            let settings = self.settings.clone();
            handles.push(std::thread::spawn(move || {
                run_worker(&work, &queue, &shutdown, noise.as_deref(), &settings, epoch);
                queue.producer_done();
            }));
        }

        EpochStream {
            queue,
            shutdown,
            handles,
            pending: BTreeMap::new(),
            next_seq: 0,
            failed: false,
        }
    }
}

struct BatchPlan {
    seq: usize,
    clips: Vec<LabeledClip>,
}

fn run_worker(
    work: &Mutex<VecDeque<BatchPlan>>,
    queue: &BatchQueue,
    shutdown: &AtomicBool,
    noise: Option<&NoiseBank>,
    settings: &StreamSettings,
    epoch: usize,
) {
    let analyzer = SpectrumAnalyzer::new(settings.sample_rate);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let plan = {
            let mut guard = work.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.pop_front()
        };
        let Some(plan) = plan else {
            return;
        };
        let item = preprocess_batch(&plan, noise, settings, epoch, &analyzer);
        let failed = item.is_err();
        if !queue.push(item, shutdown) {
            return;
        }
        if failed {
            // A decode failure poisons the epoch; stop pulling work.
            shutdown.store(true, Ordering::Relaxed);
            return;
        }
    }
}

fn preprocess_batch(
    plan: &BatchPlan,
    noise: Option<&NoiseBank>,
    settings: &StreamSettings,
    epoch: usize,
    analyzer: &SpectrumAnalyzer,
) -> Result<FeatureBatch, String> {
    let mut waveforms = Vec::with_capacity(plan.clips.len());
    let mut labels = Vec::with_capacity(plan.clips.len());
    for clip in &plan.clips {
        let samples = audio_decode::decode_clip(&clip.path, settings.sample_rate)?;
        waveforms.push(samples);
        labels.push(clip.label);
    }

    let mixed = if let Some(bank) = noise {
        let mut rng = StdRng::seed_from_u64(noise_seed(settings.seed, epoch, plan.seq));
        augment::inject_batch(&waveforms, bank, settings.noise_scale, &mut rng)
    } else {
        waveforms
    };

    let mut features = Vec::with_capacity(mixed.len());
    for waveform in &mixed {
        features.push(analyzer.magnitudes(waveform)?);
    }
    Ok(FeatureBatch {
        seq: plan.seq,
        features,
        labels,
    })
}

/// Per-epoch, per-batch noise seed: reproducible for a run, fresh each pass.
fn noise_seed(seed: u64, epoch: usize, seq: usize) -> u64 {
    seed ^ (epoch as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (seq as u64 + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

/// Reshuffle iteration order within a bounded buffer, deterministically.
///
/// Membership is untouched; only order changes. A buffer at least as large as
/// the input degenerates to a full shuffle.
pub fn buffered_shuffle(clips: &[LabeledClip], buffer_size: usize, seed: u64) -> Vec<LabeledClip> {
    let mut rng = StdRng::seed_from_u64(seed);
    let buffer_size = buffer_size.max(1);
    let mut buffer: Vec<LabeledClip> = Vec::with_capacity(buffer_size.min(clips.len()));
    let mut out = Vec::with_capacity(clips.len());
    for clip in clips.iter().cloned() {
        if buffer.len() < buffer_size {
            buffer.push(clip);
            continue;
        }
        let idx = rng.random_range(0..buffer.len());
        out.push(std::mem::replace(&mut buffer[idx], clip));
    }
    while !buffer.is_empty() {
        let idx = rng.random_range(0..buffer.len());
        out.push(buffer.swap_remove(idx));
    }
    out
}

/// Bounded queue of finished batches with producer-completion tracking.
struct BatchQueue {
    queue: Mutex<VecDeque<Result<FeatureBatch, String>>>,
    ready: Condvar,
    max_size: usize,
    producers: AtomicUsize,
}

impl BatchQueue {
    fn new(max_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            max_size: max_size.max(1),
            producers: AtomicUsize::new(0),
        }
    }

    fn producer_started(&self) {
        self.producers.fetch_add(1, Ordering::SeqCst);
    }

    fn producer_done(&self) {
        self.producers.fetch_sub(1, Ordering::SeqCst);
        self.ready.notify_all();
    }

    /// Push a finished batch, blocking while at capacity.
    ///
    /// Returns false if shutdown interrupts the wait.
    fn push(&self, item: Result<FeatureBatch, String>, shutdown: &AtomicBool) -> bool {
        let mut guard = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while guard.len() >= self.max_size {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let (next_guard, _) = self
                .ready
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = next_guard;
        }
        guard.push_back(item);
        self.ready.notify_all();
        true
    }

    /// Pop the next finished batch; `None` once all producers have exited and
    /// the queue is drained.
    fn pop(&self) -> Option<Result<FeatureBatch, String>> {
        let mut guard = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(item) = guard.pop_front() {
                self.ready.notify_all();
                return Some(item);
            }
            if self.producers.load(Ordering::SeqCst) == 0 {
                return None;
            }
            let (next_guard, _) = self
                .ready
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = next_guard;
        }
    }
}

/// One in-flight pass over a stream.
pub struct EpochStream {
    queue: Arc<BatchQueue>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    pending: BTreeMap<usize, FeatureBatch>,
    next_seq: usize,
    failed: bool,
}

impl EpochStream {
    /// Next batch in deterministic order, or `None` when the pass completes.
    ///
    /// The first preprocessing error ends the pass; later calls return `None`.
    pub fn next_batch(&mut self) -> Option<Result<FeatureBatch, String>> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                return Some(Ok(batch));
            }
            match self.queue.pop() {
                Some(Ok(batch)) => {
                    self.pending.insert(batch.seq, batch);
                }
                Some(Err(err)) => {
                    self.failed = true;
                    self.shutdown.store(true, Ordering::Relaxed);
                    return Some(Err(err));
                }
                None => {
                    // Producers are done; drain any remaining ordered batches.
                    if let Some(batch) = self.pending.remove(&self.next_seq) {
                        self.next_seq += 1;
                        return Some(Ok(batch));
                    }
                    return None;
                }
            }
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Unblock producers stuck on a full queue.
        while self.queue.pop().is_some() {}
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for EpochStream {
    fn drop(&mut self) {
        self.stop();
    }
}
