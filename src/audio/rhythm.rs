// Rhythm feature extraction: onset strength, tempo + beats, onsets, RMS and
// the predominant local pulse.
//
// Tempo and discrete event detection go through aubio's trackers (Tempo for
// beats, Onset for onsets), fed hop-sized frames the same way the decoder
// produces them. The continuous curves (onset strength, PLP, RMS) are
// computed here with rustfft. Everything is a pure function of
// (samples, rate, hop); there is no cross-call state.

use bliss_audio_aubio_rs::{Onset, OnsetMode, Tempo};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

use super::decoder::MonoAudio;
use crate::config::{HOP_LENGTH, N_FFT, RMS_FRAME_LENGTH};

/// Buffer size for aubio's onset/tempo trackers. 1024 samples balances time
/// and frequency resolution at the analysis rate.
const AUBIO_BUF_SIZE: usize = 1024;

/// Window length, in onset-envelope frames, of the Fourier tempogram behind
/// the PLP curve. ~9 seconds of context at 22.05 kHz / hop 512.
const PLP_WIN_FRAMES: usize = 384;

/// Tempo band considered when picking the predominant pulse frequency.
const PLP_MIN_BPM: f32 = 30.0;
const PLP_MAX_BPM: f32 = 300.0;

/// All rhythm features derived from one decoded signal.
#[derive(Debug, Clone)]
pub struct RhythmFeatures {
    /// Global tempo estimate in BPM (0.0 when the tracker found nothing)
    pub tempo_bpm: f64,
    /// Beat-tracker beat timestamps, seconds
    pub beat_times: Vec<f64>,
    /// Onset-detector timestamps, seconds; independent of the beat tracker
    /// and generally denser
    pub onset_times: Vec<f64>,
    /// Onset strength envelope, one value per hop
    pub onset_env: Vec<f32>,
    /// RMS energy, one value per hop
    pub rms: Vec<f32>,
    /// Predominant-local-pulse curve, one value per hop
    pub plp: Vec<f32>,
    /// Timestamps of strict local maxima of the PLP curve, seconds
    pub plp_beat_times: Vec<f64>,
}

/// Run the full rhythm analysis over decoded audio.
pub fn analyze(audio: &MonoAudio) -> Result<RhythmFeatures, String> {
    if audio.samples.is_empty() {
        return Err("No audio samples to analyze".to_string());
    }

    let sr = audio.sample_rate;
    let samples = &audio.samples;

    let onset_env = onset_strength(samples);
    let (tempo_bpm, beat_times) = track_beats(samples, sr)?;
    let onset_times = detect_onsets(samples, sr)?;
    let rms = rms_envelope(samples);
    let plp = predominant_local_pulse(&onset_env, sr);
    let plp_beat_times = local_maxima(&plp)
        .into_iter()
        .map(|frame| frame_to_time(frame, sr))
        .collect();

    Ok(RhythmFeatures {
        tempo_bpm,
        beat_times,
        onset_times,
        onset_env,
        rms,
        plp,
        plp_beat_times,
    })
}

/// Convert a hop-indexed frame number to seconds.
fn frame_to_time(frame: usize, sr: u32) -> f64 {
    frame as f64 * HOP_LENGTH as f64 / sr as f64
}

/// Onset strength envelope: half-wave rectified spectral flux of the
/// log-compressed magnitude spectrogram, averaged over bins. One value per
/// hop; the first frame is zero by construction.
pub fn onset_strength(samples: &[f32]) -> Vec<f32> {
    let spec = log_magnitude_stft(samples, N_FFT, HOP_LENGTH);
    if spec.is_empty() {
        return Vec::new();
    }

    let n_bins = spec[0].len();
    let mut env = Vec::with_capacity(spec.len());
    env.push(0.0);
    for t in 1..spec.len() {
        let mut flux = 0.0f32;
        for bin in 0..n_bins {
            let diff = spec[t][bin] - spec[t - 1][bin];
            if diff > 0.0 {
                flux += diff;
            }
        }
        env.push(flux / n_bins as f32);
    }
    env
}

/// Log-compressed magnitude spectrogram (frames x bins), Hann window,
/// centered by reflect-padding half a window on both sides.
fn log_magnitude_stft(samples: &[f32], n_fft: usize, hop: usize) -> Vec<Vec<f32>> {
    if samples.is_empty() {
        return Vec::new();
    }

    let padded = reflect_pad(samples, n_fft / 2);
    let n_frames = samples.len() / hop + 1;

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_fft);

    let window: Vec<f32> = (0..n_fft)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (n_fft - 1) as f32).cos())
        .collect();

    let n_bins = n_fft / 2 + 1;
    let mut frames = Vec::with_capacity(n_frames);

    for t in 0..n_frames {
        let start = t * hop;
        if start + n_fft > padded.len() {
            break;
        }

        let mut buffer: Vec<Complex<f32>> = padded[start..start + n_fft]
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * window[i], 0.0))
            .collect();

        fft.process(&mut buffer);

        let row: Vec<f32> = buffer[..n_bins].iter().map(|c| (1.0 + c.norm()).ln()).collect();
        frames.push(row);
    }

    frames
}

/// Reflect-pad a signal by `pad` samples on both sides.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    for i in (1..=pad).rev() {
        out.push(samples[i.min(n - 1)]);
    }
    out.extend_from_slice(samples);
    for i in 1..=pad {
        let idx = n.saturating_sub(1).saturating_sub(i.min(n - 1));
        out.push(samples[idx]);
    }
    out
}

/// Beat tracking with aubio's Tempo tracker. Returns the global BPM estimate
/// and the timestamp of every detected beat.
fn track_beats(samples: &[f32], sr: u32) -> Result<(f64, Vec<f64>), String> {
    let mut tempo = Tempo::new(OnsetMode::SpecFlux, AUBIO_BUF_SIZE, HOP_LENGTH, sr)
        .map_err(|e| format!("Failed to create tempo tracker: {:?}", e))?;

    let mut beat_times = Vec::new();
    let total_hops = samples.len() / HOP_LENGTH;

    for i in 0..total_hops {
        let start = i * HOP_LENGTH;
        let end = start + HOP_LENGTH;
        if end > samples.len() {
            break;
        }

        let frame = &samples[start..end];
        let detected = tempo
            .do_result(frame)
            .map_err(|e| format!("Tempo tracking error at frame {}: {:?}", i, e))?;

        if detected > 0.0 {
            beat_times.push(tempo.get_last_s() as f64);
        }
    }

    let bpm = tempo.get_bpm() as f64;
    let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { 0.0 };

    Ok((bpm, beat_times))
}

/// Independent onset detection with aubio's Onset detector (HFC mode).
fn detect_onsets(samples: &[f32], sr: u32) -> Result<Vec<f64>, String> {
    let mut onset = Onset::new(OnsetMode::Hfc, AUBIO_BUF_SIZE, HOP_LENGTH, sr)
        .map_err(|e| format!("Failed to create onset detector: {:?}", e))?;

    let mut onset_times = Vec::new();
    let total_hops = samples.len() / HOP_LENGTH;

    for i in 0..total_hops {
        let start = i * HOP_LENGTH;
        let end = start + HOP_LENGTH;
        if end > samples.len() {
            break;
        }

        let frame = &samples[start..end];
        let detected = onset
            .do_result(frame)
            .map_err(|e| format!("Onset detection error at frame {}: {:?}", i, e))?;

        if detected > 0.0 {
            onset_times.push(onset.get_last_s() as f64);
        }
    }

    Ok(onset_times)
}

/// RMS energy per hop over centered `RMS_FRAME_LENGTH`-sample frames.
/// Frames extending past the signal edges are zero-padded implicitly by
/// clipping the window to the valid range.
pub fn rms_envelope(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let half = RMS_FRAME_LENGTH / 2;
    let n_frames = samples.len() / HOP_LENGTH + 1;
    let mut rms = Vec::with_capacity(n_frames);

    for t in 0..n_frames {
        let center = t * HOP_LENGTH;
        let start = center.saturating_sub(half);
        let end = (center + half).min(samples.len());
        if start >= end {
            rms.push(0.0);
            continue;
        }
        let sum_sq: f32 = samples[start..end].iter().map(|&s| s * s).sum();
        rms.push((sum_sq / RMS_FRAME_LENGTH as f32).sqrt());
    }

    rms
}

/// Predominant local pulse: a Fourier tempogram over the onset envelope
/// (unit hop, `PLP_WIN_FRAMES` window), with only the strongest tempo bin of
/// each frame kept, inverted back with overlap-add, half-wave rectified and
/// peak-normalized. Local maxima of this curve are beat candidates implied
/// by the dominant periodicity rather than by the beat tracker.
pub fn predominant_local_pulse(onset_env: &[f32], sr: u32) -> Vec<f32> {
    let n = onset_env.len();
    if n == 0 {
        return Vec::new();
    }

    let win = PLP_WIN_FRAMES;
    let half = win / 2;
    let env_rate = sr as f32 / HOP_LENGTH as f32; // onset-envelope frames per second

    // Tempo band expressed in tempogram bins
    let bin_of = |bpm: f32| (bpm / 60.0) * win as f32 / env_rate;
    let min_bin = (bin_of(PLP_MIN_BPM).ceil() as usize).max(1);
    let max_bin = (bin_of(PLP_MAX_BPM).floor() as usize).min(win / 2);
    if min_bin > max_bin {
        return vec![0.0; n];
    }

    let padded = reflect_pad(onset_env, half);

    let window: Vec<f32> = (0..win)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (win - 1) as f32).cos())
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(win);

    let mut pulse = vec![0.0f32; n];

    for t in 0..n {
        if t + win > padded.len() {
            break;
        }

        let mut buffer: Vec<Complex<f32>> = padded[t..t + win]
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * window[i], 0.0))
            .collect();

        fft.process(&mut buffer);

        // Strongest periodicity within the tempo band
        let mut peak_bin = min_bin;
        let mut peak_mag = 0.0f32;
        for (k, c) in buffer.iter().enumerate().take(max_bin + 1).skip(min_bin) {
            let mag = c.norm();
            if mag > peak_mag {
                peak_mag = mag;
                peak_bin = k;
            }
        }
        if peak_mag <= 0.0 {
            continue;
        }

        // Overlap-add the single kept component back into the time axis
        let x = buffer[peak_bin];
        for (i, &w) in window.iter().enumerate() {
            let out_idx = t + i;
            if out_idx < half || out_idx - half >= n {
                continue;
            }
            let phase = 2.0 * PI * peak_bin as f32 * i as f32 / win as f32;
            pulse[out_idx - half] += (x.re * phase.cos() - x.im * phase.sin()) * w;
        }
    }

    // Peak-normalize and half-wave rectify
    let max_abs = pulse.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
    if max_abs > 0.0 {
        for v in pulse.iter_mut() {
            *v = (*v / max_abs).max(0.0);
        }
    }

    pulse
}

/// Indices of local maxima: strictly above the previous value, at least the
/// next. Endpoints never qualify.
pub fn local_maxima(curve: &[f32]) -> Vec<usize> {
    let mut peaks = Vec::new();
    for i in 1..curve.len().saturating_sub(1) {
        if curve[i] > curve[i - 1] && curve[i] >= curve[i + 1] {
            peaks.push(i);
        }
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Click track at a known BPM: 5 ms decaying 1 kHz clicks on the beat grid.
    fn generate_click_track(bpm: f64, sample_rate: u32, duration_seconds: f64) -> MonoAudio {
        let total_samples = (sample_rate as f64 * duration_seconds) as usize;
        let mut samples = vec![0.0f32; total_samples];

        let samples_per_beat = (60.0 / bpm) * sample_rate as f64;
        let click_duration = (sample_rate as f64 * 0.005) as usize;

        let mut position = 0.0f64;
        while (position as usize) < total_samples {
            let start = position as usize;
            for j in 0..click_duration {
                let idx = start + j;
                if idx < total_samples {
                    let t = j as f32 / sample_rate as f32;
                    samples[idx] = (2.0 * PI * 1000.0 * t).sin() * (-t * 500.0).exp();
                }
            }
            position += samples_per_beat;
        }

        MonoAudio {
            samples,
            sample_rate,
        }
    }

    #[test]
    fn test_analyze_click_track_tempo() {
        let audio = generate_click_track(120.0, 22_050, 30.0);
        let features = analyze(&audio).expect("analysis should succeed");

        assert!(
            (features.tempo_bpm - 120.0).abs() < 3.0
                || (features.tempo_bpm - 60.0).abs() < 3.0
                || (features.tempo_bpm - 240.0).abs() < 3.0,
            "Expected tempo near 120 (or an octave), got {:.1}",
            features.tempo_bpm
        );
        assert!(!features.beat_times.is_empty(), "Should detect beats");
    }

    #[test]
    fn test_analyze_empty_audio() {
        let audio = MonoAudio {
            samples: Vec::new(),
            sample_rate: 22_050,
        };
        assert!(analyze(&audio).is_err());
    }

    #[test]
    fn test_beat_times_within_duration() {
        let audio = generate_click_track(128.0, 22_050, 15.0);
        let features = analyze(&audio).expect("analysis should succeed");

        for &t in &features.beat_times {
            assert!(t >= 0.0 && t <= audio.duration_secs() + 0.1, "beat at {:.3}s outside clip", t);
        }
        for &t in &features.onset_times {
            assert!(t >= 0.0 && t <= audio.duration_secs() + 0.1, "onset at {:.3}s outside clip", t);
        }
    }

    #[test]
    fn test_onset_strength_detects_clicks() {
        let audio = generate_click_track(120.0, 22_050, 10.0);
        let env = onset_strength(&audio.samples);

        assert!(!env.is_empty());
        assert_eq!(env[0], 0.0, "First frame has no predecessor to flux against");
        let max = env.iter().cloned().fold(0.0f32, f32::max);
        assert!(max > 0.0, "Clicks should produce positive flux");
    }

    #[test]
    fn test_onset_strength_flat_on_silence() {
        let env = onset_strength(&vec![0.0f32; 22_050 * 5]);
        assert!(env.iter().all(|&v| v == 0.0), "Silence has no onsets");
    }

    #[test]
    fn test_rms_envelope_levels() {
        // Constant 0.5 amplitude square-ish signal: RMS near 0.5 away from edges
        let samples = vec![0.5f32; 22_050 * 2];
        let rms = rms_envelope(&samples);

        assert!(!rms.is_empty());
        let mid = rms[rms.len() / 2];
        assert!((mid - 0.5).abs() < 0.05, "Expected mid-signal RMS ~0.5, got {}", mid);
    }

    #[test]
    fn test_rms_envelope_length() {
        let samples = vec![0.1f32; 22_050];
        let rms = rms_envelope(&samples);
        assert_eq!(rms.len(), 22_050 / HOP_LENGTH + 1);
    }

    #[test]
    fn test_plp_peaks_follow_click_period() {
        let audio = generate_click_track(120.0, 22_050, 20.0);
        let env = onset_strength(&audio.samples);
        let plp = predominant_local_pulse(&env, audio.sample_rate);

        assert_eq!(plp.len(), env.len());
        assert!(plp.iter().all(|&v| (0.0..=1.0).contains(&v)), "PLP is rectified and normalized");

        let peaks = local_maxima(&plp);
        assert!(peaks.len() > 10, "A 20s click track should carry many pulse peaks");

        // Median spacing between adjacent peaks should sit near the 0.5s
        // beat period of a 120 BPM track
        let mut gaps: Vec<f64> = peaks
            .windows(2)
            .map(|w| (w[1] - w[0]) as f64 * HOP_LENGTH as f64 / 22_050.0)
            .collect();
        gaps.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = gaps[gaps.len() / 2];
        assert!(
            (median - 0.5).abs() < 0.1,
            "Expected ~0.5s median peak spacing, got {:.3}s",
            median
        );
    }

    #[test]
    fn test_local_maxima_strictness() {
        let curve = [0.0, 1.0, 0.5, 0.5, 2.0, 2.0, 1.0, 0.0];
        let peaks = local_maxima(&curve);
        // index 1 (1.0 > 0.0, 1.0 >= 0.5) and index 4 (2.0 > 0.5, 2.0 >= 2.0)
        assert_eq!(peaks, vec![1, 4]);
    }

    #[test]
    fn test_local_maxima_empty_and_short() {
        assert!(local_maxima(&[]).is_empty());
        assert!(local_maxima(&[1.0]).is_empty());
        assert!(local_maxima(&[1.0, 2.0]).is_empty());
    }
}
