//! Speaker class discovery and labeled clip enumeration.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// A clip path paired with its speaker label.
///
/// The label is an index into the ordered class-name list returned by
/// discovery; that mapping is fixed once per run and shared by training and
/// inference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabeledClip {
    /// Absolute path to the audio file.
    pub path: PathBuf,
    /// Index of the speaker in the discovered class ordering.
    pub label: usize,
}

/// Discovered dataset: ordered class names plus every labeled clip.
pub struct SpeakerDataset {
    /// Class names in sorted directory order; index == label.
    pub classes: Vec<String>,
    /// All clips across all classes, in discovery order.
    pub clips: Vec<LabeledClip>,
}

/// Enumerate one class per subdirectory of `audio_root`, sorted by name, and
/// collect every clip file within each as a `LabeledClip` of that label.
///
/// Empty class directories still occupy a label slot so the class ordering
/// matches the on-disk layout, but they are reported.
pub fn collect_speaker_dataset(audio_root: &Path) -> Result<SpeakerDataset, String> {
    let mut class_dirs = Vec::new();
    let entries = fs::read_dir(audio_root)
        .map_err(|err| format!("Read audio root {}: {err}", audio_root.display()))?;
    for entry in entries {
        let entry = entry.map_err(|err| format!("Read audio root entry: {err}"))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().trim().to_string();
        if name.is_empty() {
            continue;
        }
        class_dirs.push((name, path));
    }
    class_dirs.sort_by(|a, b| a.0.cmp(&b.0));

    if class_dirs.is_empty() {
        return Err(format!(
            "No speaker directories found under {}",
            audio_root.display()
        ));
    }

    let mut classes = Vec::with_capacity(class_dirs.len());
    let mut clips = Vec::new();
    for (label, (name, dir)) in class_dirs.into_iter().enumerate() {
        let mut files = Vec::new();
        collect_clip_files(&dir, &mut files)?;
        files.sort();
        if files.is_empty() {
            warn!("Speaker directory {} contains no clips", dir.display());
        }
        for path in files {
            clips.push(LabeledClip { path, label });
        }
        classes.push(name);
    }

    if clips.is_empty() {
        return Err(format!(
            "No clips found under {}",
            audio_root.display()
        ));
    }
    Ok(SpeakerDataset { classes, clips })
}

/// Recursively collect audio files under `root`.
pub fn collect_clip_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries =
        fs::read_dir(root).map_err(|err| format!("Read dir {}: {err}", root.display()))?;
    for entry in entries {
        let entry = entry.map_err(|err| format!("Read dir entry: {err}"))?;
        let path = entry.path();
        if path.is_dir() {
            collect_clip_files(&path, out)?;
        } else if is_clip_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_clip_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}
