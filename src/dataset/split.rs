//! Seeded shuffle and fixed train/validation partition.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::samples::LabeledClip;

/// Immutable train/validation partition of the labeled clip collection.
pub struct Split {
    pub train: Vec<LabeledClip>,
    pub valid: Vec<LabeledClip>,
}

/// Shuffle all clips with one seed-derived permutation, then split off the
/// last `floor(valid_fraction * total)` entries as the validation set.
///
/// Paths and labels travel together through the permutation, so index
/// correspondence is preserved by construction.
pub fn shuffle_and_split(mut clips: Vec<LabeledClip>, valid_fraction: f64, seed: u64) -> Split {
    let mut rng = StdRng::seed_from_u64(seed);
    clips.shuffle(&mut rng);
    let num_valid = (valid_fraction * clips.len() as f64).floor() as usize;
    let split_at = clips.len() - num_valid;
    let valid = clips.split_off(split_at);
    Split {
        train: clips,
        valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn synthetic_clips(per_class: usize, classes: usize) -> Vec<LabeledClip> {
        let mut clips = Vec::new();
        for label in 0..classes {
            for idx in 0..per_class {
                clips.push(LabeledClip {
                    path: PathBuf::from(format!("speaker{label}/clip{idx}.wav")),
                    label,
                });
            }
        }
        clips
    }

    #[test]
    fn split_sizes_follow_floor_of_fraction() {
        // 5 classes x 1500 clips, fraction 0.1 -> 6750 train / 750 valid.
        let clips = synthetic_clips(1500, 5);
        let split = shuffle_and_split(clips, 0.1, 43);
        assert_eq!(split.train.len(), 6750);
        assert_eq!(split.valid.len(), 750);
    }

    #[test]
    fn train_plus_valid_covers_every_clip_once() {
        let clips = synthetic_clips(7, 3);
        let total = clips.len();
        let split = shuffle_and_split(clips, 0.25, 1);
        assert_eq!(split.train.len() + split.valid.len(), total);
        let paths: HashSet<_> = split
            .train
            .iter()
            .chain(split.valid.iter())
            .map(|clip| clip.path.clone())
            .collect();
        assert_eq!(paths.len(), total);
    }

    #[test]
    fn permutation_keeps_path_label_correspondence() {
        let clips = synthetic_clips(20, 4);
        let split = shuffle_and_split(clips, 0.2, 99);
        for clip in split.train.iter().chain(split.valid.iter()) {
            let dir = clip.path.parent().unwrap().to_str().unwrap();
            assert_eq!(dir, format!("speaker{}", clip.label));
        }
    }

    #[test]
    fn same_seed_reproduces_the_same_split() {
        let first = shuffle_and_split(synthetic_clips(10, 2), 0.3, 5);
        let second = shuffle_and_split(synthetic_clips(10, 2), 0.3, 5);
        assert_eq!(first.train, second.train);
        assert_eq!(first.valid, second.valid);
    }

    #[test]
    fn zero_fraction_keeps_everything_in_train() {
        let split = shuffle_and_split(synthetic_clips(4, 2), 0.0, 5);
        assert_eq!(split.valid.len(), 0);
        assert_eq!(split.train.len(), 8);
    }
}
