//! Decoding of on-disk audio into mono `f32` waveforms.
//!
//! Speech clips must decode to exactly one second at the configured rate;
//! anything else is a hard error so that waveform and label sequences never
//! drift apart. Noise sources only need a matching declared rate; length is
//! handled downstream by chunking.

use std::fs::File;
use std::path::Path;

use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error, formats::FormatOptions,
    io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};

/// Raw decoded audio, downmixed to a single channel.
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode a file into mono `f32` samples plus the declared sample rate.
///
/// Multi-channel input is downmixed by averaging across channels.
pub fn decode_mono(path: &Path) -> Result<DecodedAudio, String> {
    let (samples, sample_rate, channels) = decode_with_symphonia(path)?;
    let channels = channels.max(1) as usize;
    let mono = if channels == 1 {
        samples
    } else {
        downmix(&samples, channels)
    };
    Ok(DecodedAudio {
        samples: mono,
        sample_rate: sample_rate.max(1),
    })
}

/// Decode a speech clip, enforcing the one-second invariant.
///
/// The declared rate must equal `sample_rate`; clips longer than one second
/// contribute their leading second, shorter clips are rejected.
pub fn decode_clip(path: &Path, sample_rate: usize) -> Result<Vec<f32>, String> {
    let decoded = decode_mono(path)?;
    if decoded.sample_rate as usize != sample_rate {
        return Err(format!(
            "Clip {} declares {} Hz, expected {} Hz",
            path.display(),
            decoded.sample_rate,
            sample_rate
        ));
    }
    let mut samples = decoded.samples;
    if samples.len() < sample_rate {
        return Err(format!(
            "Clip {} has {} samples, expected at least {}",
            path.display(),
            samples.len(),
            sample_rate
        ));
    }
    samples.truncate(sample_rate);
    Ok(samples)
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    let frames = interleaved.len() / channels;
    let mut mono = Vec::with_capacity(frames);
    for frame in 0..frames {
        let base = frame * channels;
        let mut sum = 0.0f32;
        for channel in 0..channels {
            sum += interleaved[base + channel];
        }
        mono.push(sum / channels as f32);
    }
    mono
}

fn decode_with_symphonia(path: &Path) -> Result<(Vec<f32>, u32, u16), String> {
    let file = File::open(path).map_err(|err| format!("Open {}: {err}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| format!("Symphonia probe failed for {}: {err}", path.display()))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| format!("No default track for {}", path.display()))?;
    let codec_params = &track.codec_params;
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| format!("Missing sample rate for {}", path.display()))?;
    let channels = codec_params
        .channels
        .ok_or_else(|| format!("Missing channel count for {}", path.display()))?
        .count() as u16;

    let mut decoder = symphonia::default::get_codecs()
        .make(codec_params, &DecoderOptions::default())
        .map_err(|err| format!("Symphonia decoder failed for {}: {err}", path.display()))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(_)) => break,
            Err(err) => {
                return Err(format!(
                    "Symphonia packet read failed for {}: {err}",
                    path.display()
                ));
            }
        };
        let audio_buf = match decoder.decode(&packet) {
            Ok(audio_buf) => audio_buf,
            Err(Error::DecodeError(_)) => continue,
            Err(err) => {
                return Err(format!(
                    "Symphonia decode failed for {}: {err}",
                    path.display()
                ));
            }
        };
        let spec = *audio_buf.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(audio_buf);
        samples.extend_from_slice(sample_buf.samples());
    }

    if samples.is_empty() {
        return Err(format!(
            "Symphonia decoded 0 samples for {}",
            path.display()
        ));
    }

    Ok((samples, sample_rate, channels))
}
