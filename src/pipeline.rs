// The per-request analysis pipeline.
//
// One sequential pass: size check, tag scrape, temp-file decode, rhythm
// analysis, downbeat tracking, HPSS + rendering, event synthesis. The
// upload temp file lives in a `NamedTempFile` binding for the duration of
// this function, so it is removed on every path out — success, decode
// failure or analysis failure alike. The downbeat stage owns its own WAV
// temp file with the same discipline.

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::audio::decoder::{decode_to_mono, MonoAudio};
use crate::audio::downbeat::DownbeatTracker;
use crate::audio::hpss;
use crate::audio::rhythm::{self, RhythmFeatures};
use crate::config::{MAX_UPLOAD_BYTES, TARGET_SAMPLE_RATE};
use crate::error::AnalysisError;
use crate::metadata::{self, TrackTags};
use crate::render::{render_overview, OverviewInputs};

/// One synthesized record per tracked beat. The field set and constants are
/// external contract; consumers key on the exact shape. `downbeat_aligned`
/// marks beats that coincide with a tracked downbeat within
/// `DOWNBEAT_TOLERANCE_SECS`; the label stays the fixed "measure" string
/// regardless.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventRecord {
    pub timeshow_id: u32,
    pub event_id: String,
    pub event_label: String,
    pub time_stamp: f64,
    pub event_color: String,
    #[serde(rename = "Value")]
    pub value: u32,
    pub downbeat_aligned: bool,
}

/// Everything the response assembler needs from one analysis run.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub tempo: f64,
    pub beat_times: Vec<f64>,
    pub onset_times: Vec<f64>,
    pub rms: Vec<f32>,
    pub duration: f64,
    pub downbeats: Vec<f64>,
    pub image_base64: Option<String>,
    pub events: Vec<EventRecord>,
    pub tags: TrackTags,
}

/// Run the full pipeline over an uploaded file's bytes.
pub fn analyze_upload(
    bytes: &[u8],
    tracker: &DownbeatTracker,
) -> Result<AnalysisOutcome, AnalysisError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(AnalysisError::TooLarge);
    }
    if bytes.is_empty() {
        return Err(AnalysisError::BadUpload("Empty upload".to_string()));
    }

    // Tags first: works on the raw bytes and never fails the request
    let tags = metadata::extract_tags(bytes);

    // The decoder needs file-backed input; the temp file is dropped (and
    // removed) when this function returns, whatever the path out.
    let upload_file = spool_to_temp(bytes)?;
    let audio = decode_to_mono(upload_file.path(), TARGET_SAMPLE_RATE)
        .map_err(AnalysisError::Decode)?;
    let duration = audio.duration_secs();

    let features = rhythm::analyze(&audio).map_err(AnalysisError::Analysis)?;

    let downbeats = tracker.track(&audio);
    tracing::debug!(
        "Analysis: {:.1} BPM, {} beats, {} onsets, {} downbeats over {:.2}s",
        features.tempo_bpm,
        features.beat_times.len(),
        features.onset_times.len(),
        downbeats.len(),
        duration
    );

    let image_base64 = render_image(&audio, &features, &downbeats, duration)?;
    let events = synthesize_events(&features.beat_times, &downbeats);

    Ok(AnalysisOutcome {
        tempo: features.tempo_bpm,
        beat_times: features.beat_times,
        onset_times: features.onset_times,
        rms: features.rms,
        duration,
        downbeats,
        image_base64: Some(image_base64),
        events,
        tags,
    })
}

/// Write the upload to a temp file whose lifetime bounds the decode.
fn spool_to_temp(bytes: &[u8]) -> Result<NamedTempFile, AnalysisError> {
    let mut file = tempfile::Builder::new().prefix("beatscope-").tempfile()?;
    std::io::Write::write_all(&mut file, bytes)?;
    Ok(file)
}

fn render_image(
    audio: &MonoAudio,
    features: &RhythmFeatures,
    downbeats: &[f64],
    duration: f64,
) -> Result<String, AnalysisError> {
    let (harmonic, percussive) = hpss::separate(&audio.samples);

    render_overview(&OverviewInputs {
        onset_env: &features.onset_env,
        plp: &features.plp,
        beat_times: &features.beat_times,
        plp_beat_times: &features.plp_beat_times,
        downbeats,
        harmonic: &harmonic,
        percussive: &percussive,
        sample_rate: audio.sample_rate,
        duration,
    })
    .map_err(AnalysisError::Render)
}

/// One fixed-shape event per beat, 1-indexed.
pub fn synthesize_events(beat_times: &[f64], downbeats: &[f64]) -> Vec<EventRecord> {
    beat_times
        .iter()
        .enumerate()
        .map(|(idx, &t)| EventRecord {
            timeshow_id: 160,
            event_id: format!("M{}", idx + 1),
            event_label: "measure".to_string(),
            time_stamp: round3(t),
            event_color: "#F3F6EC".to_string(),
            value: 1,
            downbeat_aligned: downbeats
                .iter()
                .any(|&db| (t - db).abs() < crate::config::DOWNBEAT_TOLERANCE_SECS),
        })
        .collect()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;
    use std::io::Cursor;

    /// In-memory WAV of a click track: clicks on the beat grid over a tone
    /// bed so that both the beat tracker and HPSS have something to chew on.
    fn click_track_wav(bpm: f64, seconds: f64) -> Vec<u8> {
        let sr = 22_050u32;
        let total = (sr as f64 * seconds) as usize;
        let mut samples = vec![0.0f32; total];

        for (i, s) in samples.iter_mut().enumerate() {
            *s = (2.0 * PI * 220.0 * i as f32 / sr as f32).sin() * 0.1;
        }

        let samples_per_beat = (60.0 / bpm) * sr as f64;
        let click_len = (sr as f64 * 0.005) as usize;
        let mut position = 0.0f64;
        while (position as usize) < total {
            let start = position as usize;
            for j in 0..click_len {
                if start + j < total {
                    let t = j as f32 / sr as f32;
                    samples[start + j] += (2.0 * PI * 1000.0 * t).sin() * (-t * 500.0).exp() * 0.8;
                }
            }
            position += samples_per_beat;
        }

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sr,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut bytes = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut bytes, spec).unwrap();
            for &s in &samples {
                writer
                    .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32 * 0.9) as i16)
                    .unwrap();
            }
            writer.finalize().unwrap();
        }
        bytes.into_inner()
    }

    #[test]
    fn test_full_pipeline_on_click_track() {
        let wav = click_track_wav(120.0, 8.0);
        let outcome = analyze_upload(&wav, &DownbeatTracker::Unavailable)
            .expect("pipeline should succeed");

        // Duration round-trip within tolerance
        assert!(
            (outcome.duration - 8.0).abs() < 1e-2,
            "Expected ~8s, got {:.3}s",
            outcome.duration
        );

        // Unavailable tracker degrades to empty downbeats, not an error
        assert!(outcome.downbeats.is_empty());

        // One event per beat, timestamps rounded to 3 decimals
        assert_eq!(outcome.events.len(), outcome.beat_times.len());
        for (event, &beat) in outcome.events.iter().zip(outcome.beat_times.iter()) {
            assert_eq!(event.time_stamp, round3(beat));
            assert_eq!(event.event_label, "measure");
            assert_eq!(event.timeshow_id, 160);
            assert_eq!(event.value, 1);
        }

        // Image present and PNG-shaped
        let image = outcome.image_base64.expect("image should be rendered");
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let png = STANDARD.decode(image).expect("valid base64");
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);

        // Tagless WAV yields all-null metadata
        assert!(outcome.tags.title.is_none());
        assert!(outcome.tags.artist.is_none());
        assert!(outcome.tags.genre.is_none());

        assert!(!outcome.rms.is_empty());
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let bytes = vec![0u8; MAX_UPLOAD_BYTES + 1];
        match analyze_upload(&bytes, &DownbeatTracker::Unavailable) {
            Err(AnalysisError::TooLarge) => {}
            other => panic!("Expected TooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_upload_rejected() {
        match analyze_upload(&[], &DownbeatTracker::Unavailable) {
            Err(AnalysisError::BadUpload(_)) => {}
            other => panic!("Expected BadUpload, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_undecodable_upload_is_decode_error() {
        let bytes = vec![0x42u8; 4096];
        match analyze_upload(&bytes, &DownbeatTracker::Unavailable) {
            Err(AnalysisError::Decode(_)) => {}
            other => panic!("Expected Decode, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_temp_file_removed_on_drop() {
        let file = spool_to_temp(b"some bytes").expect("spool should succeed");
        let path = file.path().to_path_buf();
        assert!(path.exists(), "Temp file should exist while held");
        drop(file);
        assert!(!path.exists(), "Temp file should be removed on drop");
    }

    #[test]
    fn test_synthesize_events_rounding() {
        let events = synthesize_events(&[0.123456, 1.9999], &[]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "M1");
        assert_eq!(events[0].time_stamp, 0.123);
        assert_eq!(events[1].event_id, "M2");
        assert_eq!(events[1].time_stamp, 2.0);
        assert_eq!(events[1].event_color, "#F3F6EC");
        assert!(!events[0].downbeat_aligned);
    }

    #[test]
    fn test_synthesize_events_downbeat_alignment() {
        // Beats at 1.0 and 1.5; downbeat at 1.02 is within the 50 ms window
        // of the first beat only
        let events = synthesize_events(&[1.0, 1.5], &[1.02]);
        assert!(events[0].downbeat_aligned);
        assert!(!events[1].downbeat_aligned);

        // Exactly at the tolerance boundary does not count
        let events = synthesize_events(&[1.0], &[1.05]);
        assert!(!events[0].downbeat_aligned);
    }

    #[test]
    fn test_synthesize_events_empty() {
        assert!(synthesize_events(&[], &[]).is_empty());
    }
}
