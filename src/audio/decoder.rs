// Full-file decoding to mono f32 at the analysis sample rate.
//
// symphonia handles probing and codec work; the decoded stream is mixed down
// to mono (channel average) and resampled to `TARGET_SAMPLE_RATE` with
// rubato when the file's native rate differs. Input is file-backed: the
// upload handler writes the request body to a temp file before calling in.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::conv::FromSample;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Result of decoding an entire audio file to mono f32 samples.
/// This is the input to every analysis stage downstream.
#[derive(Debug, Clone)]
pub struct MonoAudio {
    /// Mono audio samples in range [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate of the samples (the analysis target rate after decode)
    pub sample_rate: u32,
}

impl MonoAudio {
    /// Duration derived from sample count and rate.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode an entire audio file to mono f32 at `target_rate`.
///
/// Reads the full file, decodes all packets, converts each buffer to f32,
/// mixes down to mono, then resamples once at the end if the native rate
/// differs from the target.
pub fn decode_to_mono(path: &Path, target_rate: u32) -> Result<MonoAudio, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open audio file: {}", e))?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension() {
        hint.with_extension(&ext.to_string_lossy());
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| format!("Failed to probe audio format: {}", e))?;

    let mut format_reader = probed.format;

    let track = format_reader
        .default_track()
        .ok_or_else(|| "No audio tracks found".to_string())?;

    let track_id = track.id;
    let native_rate = track.codec_params.sample_rate.unwrap_or(44100);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| format!("Failed to create decoder: {}", e))?;

    let mut all_samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break; // End of file
            }
            Err(e) => return Err(format!("Error reading packet: {}", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(msg)) => {
                // Skip corrupted packets, continue decoding
                tracing::debug!("Skipping corrupted packet: {}", msg);
                continue;
            }
            Err(e) => return Err(format!("Decode error: {}", e)),
        };

        let mono_chunk = convert_to_mono_f32(&decoded);
        all_samples.extend_from_slice(&mono_chunk);
    }

    if all_samples.is_empty() {
        return Err("Decoded stream contained no audio samples".to_string());
    }

    let samples = if native_rate != target_rate {
        resample_mono(all_samples, native_rate, target_rate)?
    } else {
        all_samples
    };

    Ok(MonoAudio {
        samples,
        sample_rate: target_rate,
    })
}

/// Convert decoded audio buffer to mono f32 samples.
/// If stereo/multichannel, averages all channels to produce mono output.
fn convert_to_mono_f32(decoded: &AudioBufferRef) -> Vec<f32> {
    match decoded {
        AudioBufferRef::F32(buf) => mix_to_mono_f32(buf),
        AudioBufferRef::U8(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::U16(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::U24(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::U32(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::S8(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::S16(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::S24(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::S32(buf) => mix_to_mono_generic(buf),
        AudioBufferRef::F64(buf) => mix_to_mono_generic(buf),
    }
}

/// Mix f32 buffer channels down to mono
fn mix_to_mono_f32(buf: &symphonia::core::audio::AudioBuffer<f32>) -> Vec<f32> {
    let channels = buf.spec().channels.count();
    let frames = buf.frames();

    if channels == 0 || frames == 0 {
        return Vec::new();
    }

    if channels == 1 {
        // Already mono — just copy
        buf.chan(0).to_vec()
    } else {
        // Average all channels to produce mono
        let mut mono = vec![0.0f32; frames];
        let scale = 1.0 / channels as f32;
        for ch in 0..channels {
            let channel_data = buf.chan(ch);
            for (i, &sample) in channel_data.iter().enumerate() {
                mono[i] += sample * scale;
            }
        }
        mono
    }
}

/// Generic mixer: convert any sample format to f32 mono
fn mix_to_mono_generic<S>(buf: &symphonia::core::audio::AudioBuffer<S>) -> Vec<f32>
where
    S: symphonia::core::sample::Sample,
    f32: FromSample<S>,
{
    let channels = buf.spec().channels.count();
    let frames = buf.frames();

    if channels == 0 || frames == 0 {
        return Vec::new();
    }

    if channels == 1 {
        buf.chan(0).iter().map(|&s| f32::from_sample(s)).collect()
    } else {
        let mut mono = vec![0.0f32; frames];
        let scale = 1.0 / channels as f32;
        for ch in 0..channels {
            let channel_data = buf.chan(ch);
            for (i, &sample) in channel_data.iter().enumerate() {
                mono[i] += f32::from_sample(sample) * scale;
            }
        }
        mono
    }
}

/// High-quality single-pass resampling with rubato's SincFixedIn.
/// Chunk size equals the input length, so the whole signal goes through in
/// one `process` call.
fn resample_mono(samples: Vec<f32>, source_rate: u32, target_rate: u32) -> Result<Vec<f32>, String> {
    if samples.is_empty() {
        return Ok(samples);
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let resample_ratio = target_rate as f64 / source_rate as f64;
    let num_frames = samples.len();

    let mut resampler = SincFixedIn::<f32>::new(resample_ratio, 4.0, params, num_frames, 1)
        .map_err(|e| format!("Failed to create resampler: {}", e))?;

    let input_channels = vec![samples];
    let mut output_channels = resampler
        .process(&input_channels, None)
        .map_err(|e| format!("Resampling failed: {}", e))?;

    tracing::debug!(
        "Resampled {} frames ({} Hz) -> {} frames ({} Hz)",
        num_frames,
        source_rate,
        output_channels[0].len(),
        target_rate
    );

    Ok(output_channels.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_duration_from_sample_count() {
        let audio = MonoAudio {
            samples: vec![0.0; 22_050 * 3],
            sample_rate: 22_050,
        };
        assert!((audio.duration_secs() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_zero_rate() {
        let audio = MonoAudio {
            samples: vec![0.0; 100],
            sample_rate: 0,
        };
        assert_eq!(audio.duration_secs(), 0.0);
    }

    #[test]
    fn test_resample_preserves_duration() {
        // One second of a 440 Hz tone at 44.1 kHz resampled to 22.05 kHz
        let source_rate = 44_100u32;
        let samples: Vec<f32> = (0..source_rate as usize)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / source_rate as f32).sin())
            .collect();

        let out = resample_mono(samples, source_rate, 22_050).expect("resampling should succeed");

        // Output length should be within a filter-length margin of one second
        let expected = 22_050usize;
        let diff = out.len().abs_diff(expected);
        assert!(
            diff < 600,
            "Expected ~{} samples after resampling, got {}",
            expected,
            out.len()
        );
    }

    #[test]
    fn test_decode_roundtrip_wav() {
        // Write a 2-second 22.05 kHz mono WAV and decode it back
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let tmp = tempfile::Builder::new()
            .suffix(".wav")
            .tempfile()
            .expect("temp file");
        {
            let mut writer = hound::WavWriter::create(tmp.path(), spec).expect("wav writer");
            for i in 0..(22_050 * 2) {
                let t = i as f32 / 22_050.0;
                let v = (2.0 * PI * 220.0 * t).sin();
                writer
                    .write_sample((v * i16::MAX as f32 * 0.5) as i16)
                    .expect("write sample");
            }
            writer.finalize().expect("finalize");
        }

        let audio = decode_to_mono(tmp.path(), 22_050).expect("decode should succeed");
        assert_eq!(audio.sample_rate, 22_050);
        assert!(
            (audio.duration_secs() - 2.0).abs() < 1e-2,
            "Expected ~2s, got {:.3}s",
            audio.duration_secs()
        );
    }
}
