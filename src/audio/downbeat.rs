// Optional downbeat tracking behind a capability gate.
//
// The neural model is an ONNX export loaded once at startup; when the model
// file is missing or fails to load the tracker is `Unavailable` and every
// call returns an empty sequence. Callers never see an error from this
// subsystem: any failure inside the tracking pipeline is logged and degrades
// to no downbeats.
//
// Model contract: input "spectrogram" is a [1, frames, N_MELS] log-mel
// tensor at `DOWNBEAT_FPS` frames per second; output is [frames, 2] with a
// beat activation and a downbeat activation per frame. The model's input
// path is file-backed and expects stereo content, so the mono analysis
// signal is re-rendered as a 16-bit stereo WAV temp file first and the
// features are computed from that file.

use ndarray::Array3;
use ort::session::Session;
use ort::value::Tensor;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;
use std::path::Path;
use std::sync::Mutex;

use super::decoder::MonoAudio;
use crate::config::DOWNBEAT_FPS;

/// Mel bands in the model's input spectrogram.
const N_MELS: usize = 81;

/// FFT window for the model features.
const FEATURE_N_FFT: usize = 2048;

/// Beats per bar assumed by the bar tracker.
const BEATS_PER_BAR: usize = 4;

/// Tempo band searched when estimating the beat period, in BPM.
const MIN_BPM: f32 = 55.0;
const MAX_BPM: f32 = 215.0;

/// Transition tightness of the beat-selection dynamic program. Larger values
/// bind beat intervals closer to the estimated period.
const TIGHTNESS: f32 = 100.0;

/// The downbeat capability, selected once at process start.
pub enum DownbeatTracker {
    Available { session: Mutex<Session> },
    Unavailable,
}

impl DownbeatTracker {
    /// Try to load the ONNX model. Any failure yields the Unavailable
    /// variant — the service runs without downbeats rather than refusing to
    /// start.
    pub fn load(model_path: &Path) -> Self {
        if !model_path.exists() {
            tracing::warn!(
                "Downbeat model not found at {:?}, downbeat tracking disabled",
                model_path
            );
            return DownbeatTracker::Unavailable;
        }

        let session = Session::builder()
            .and_then(|b| {
                b.with_intra_threads(1)
                    .map_err(|e| ort::Error::new_with_code(e.code(), e.message()))
            })
            .and_then(|mut b| b.commit_from_file(model_path));

        match session {
            Ok(session) => {
                tracing::info!("Downbeat model loaded from {:?}", model_path);
                DownbeatTracker::Available {
                    session: Mutex::new(session),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to load downbeat model: {}, downbeat tracking disabled", e);
                DownbeatTracker::Unavailable
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, DownbeatTracker::Available { .. })
    }

    /// Track downbeats in the decoded signal. Returns timestamps of bar-start
    /// beats in seconds, all within the signal's duration. Empty on the
    /// Unavailable variant and on any internal failure.
    pub fn track(&self, audio: &MonoAudio) -> Vec<f64> {
        let session = match self {
            DownbeatTracker::Available { session } => session,
            DownbeatTracker::Unavailable => return Vec::new(),
        };

        match track_inner(session, audio) {
            Ok(downbeats) => {
                if downbeats.is_empty() {
                    tracing::warn!("Downbeat tracker found no downbeats within the clip");
                }
                downbeats
            }
            Err(e) => {
                tracing::warn!("Downbeat tracking failed: {}", e);
                Vec::new()
            }
        }
    }
}

fn track_inner(session: &Mutex<Session>, audio: &MonoAudio) -> Result<Vec<f64>, String> {
    let duration = audio.duration_secs();

    // The model input path is file-backed: render the stereo WAV first and
    // compute features from it. The temp file is removed on drop, on every
    // path out of this function.
    let wav = tempfile::Builder::new()
        .suffix(".wav")
        .tempfile()
        .map_err(|e| format!("Failed to create WAV temp file: {}", e))?;

    write_stereo_wav(wav.path(), audio)?;

    let (samples, sample_rate) = read_wav_mono(wav.path())?;
    let features = log_mel_spectrogram(&samples, sample_rate);
    if features.is_empty() {
        return Err("Signal too short for downbeat features".to_string());
    }

    let activations = run_model(session, &features)?;
    let downbeat_frames = decode_downbeats(&activations);

    let downbeats: Vec<f64> = downbeat_frames
        .into_iter()
        .map(|frame| frame as f64 / DOWNBEAT_FPS as f64)
        .filter(|&t| t <= duration)
        .collect();

    Ok(downbeats)
}

/// Duplicate the mono channel into a 16-bit stereo PCM WAV.
fn write_stereo_wav(path: &Path, audio: &MonoAudio) -> Result<(), String> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| format!("Failed to create WAV: {}", e))?;

    for &sample in &audio.samples {
        let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(v).map_err(|e| format!("WAV write failed: {}", e))?;
        writer.write_sample(v).map_err(|e| format!("WAV write failed: {}", e))?;
    }

    writer.finalize().map_err(|e| format!("WAV finalize failed: {}", e))
}

/// Read a WAV back as mono f32 (channel average).
fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| format!("WAV open failed: {}", e))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = 1.0 / i16::MAX as f32;
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| format!("WAV read failed: {}", e))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| format!("WAV read failed: {}", e))?,
    };

    if channels <= 1 {
        return Ok((interleaved, spec.sample_rate));
    }

    let frames = interleaved.len() / channels;
    let scale = 1.0 / channels as f32;
    let mut mono = Vec::with_capacity(frames);
    for f in 0..frames {
        let sum: f32 = interleaved[f * channels..(f + 1) * channels].iter().sum();
        mono.push(sum * scale);
    }
    Ok((mono, spec.sample_rate))
}

/// Log-compressed mel spectrogram at `DOWNBEAT_FPS` frames per second.
fn log_mel_spectrogram(samples: &[f32], sample_rate: u32) -> Vec<Vec<f32>> {
    let hop = sample_rate as f64 / DOWNBEAT_FPS as f64;
    if samples.len() < FEATURE_N_FFT {
        return Vec::new();
    }

    let n_frames = ((samples.len() - FEATURE_N_FFT) as f64 / hop) as usize + 1;
    let filterbank = mel_filterbank(sample_rate);

    let window: Vec<f32> = (0..FEATURE_N_FFT)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (FEATURE_N_FFT - 1) as f32).cos())
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(FEATURE_N_FFT);

    let n_bins = FEATURE_N_FFT / 2 + 1;
    let mut frames = Vec::with_capacity(n_frames);

    for t in 0..n_frames {
        let start = (t as f64 * hop).round() as usize;
        if start + FEATURE_N_FFT > samples.len() {
            break;
        }

        let mut buffer: Vec<Complex<f32>> = samples[start..start + FEATURE_N_FFT]
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * window[i], 0.0))
            .collect();

        fft.process(&mut buffer);

        let mags: Vec<f32> = buffer[..n_bins].iter().map(|c| c.norm()).collect();

        let mel: Vec<f32> = filterbank
            .iter()
            .map(|filter| {
                let energy: f32 = filter.iter().map(|&(bin, w)| mags[bin] * w).sum();
                (1.0 + energy).ln()
            })
            .collect();

        frames.push(mel);
    }

    frames
}

/// Triangular mel filterbank as sparse (bin, weight) lists, 30 Hz up to the
/// Nyquist frequency.
fn mel_filterbank(sample_rate: u32) -> Vec<Vec<(usize, f32)>> {
    let f_min = 30.0f32;
    let f_max = sample_rate as f32 / 2.0;
    let n_bins = FEATURE_N_FFT / 2 + 1;

    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10.0f32.powf(mel / 2595.0) - 1.0);

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);

    // N_MELS filters need N_MELS + 2 edge frequencies
    let edges: Vec<f32> = (0..N_MELS + 2)
        .map(|i| {
            let mel = mel_min + (mel_max - mel_min) * i as f32 / (N_MELS + 1) as f32;
            mel_to_hz(mel)
        })
        .collect();

    let bin_freq = |bin: usize| bin as f32 * sample_rate as f32 / FEATURE_N_FFT as f32;

    (0..N_MELS)
        .map(|m| {
            let (lo, center, hi) = (edges[m], edges[m + 1], edges[m + 2]);
            let mut filter = Vec::new();
            for bin in 0..n_bins {
                let f = bin_freq(bin);
                let w = if f > lo && f < center {
                    (f - lo) / (center - lo)
                } else if f >= center && f < hi {
                    (hi - f) / (hi - center)
                } else {
                    0.0
                };
                if w > 0.0 {
                    filter.push((bin, w));
                }
            }
            filter
        })
        .collect()
}

/// Per-frame (beat, downbeat) activations from the model.
fn run_model(session: &Mutex<Session>, features: &[Vec<f32>]) -> Result<Vec<(f32, f32)>, String> {
    let n_frames = features.len();

    let mut flat = Vec::with_capacity(n_frames * N_MELS);
    for frame in features {
        flat.extend_from_slice(frame);
    }

    let input = Array3::from_shape_vec((1, n_frames, N_MELS), flat)
        .map_err(|e| format!("Input shape error: {}", e))?;

    let input_tensor =
        Tensor::from_array(input).map_err(|e| format!("Tensor creation error: {}", e))?;

    let mut session = session.lock().map_err(|_| "Model session poisoned".to_string())?;
    let outputs = session
        .run(ort::inputs!["spectrogram" => input_tensor])
        .map_err(|e| format!("Model inference error: {}", e))?;

    let (_, value) = outputs
        .iter()
        .next()
        .ok_or_else(|| "Model produced no output".to_string())?;

    let (_shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| format!("Output extraction error: {}", e))?;

    if data.len() != n_frames * 2 {
        return Err(format!(
            "Unexpected activation shape: {} values for {} frames",
            data.len(),
            n_frames
        ));
    }

    Ok(data.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

/// Dynamic-programming bar tracking over the activations: select a beat
/// sequence consistent with the dominant period, then pick the bar phase
/// whose beats carry the most downbeat activation. Only bar-start beats are
/// returned.
fn decode_downbeats(activations: &[(f32, f32)]) -> Vec<usize> {
    let beat_act: Vec<f32> = activations.iter().map(|&(b, d)| b + d).collect();
    let downbeat_act: Vec<f32> = activations.iter().map(|&(_, d)| d).collect();

    let max_act = beat_act.iter().cloned().fold(0.0f32, f32::max);
    if max_act < 1e-3 {
        return Vec::new();
    }

    let period = match estimate_period(&beat_act) {
        Some(p) => p,
        None => return Vec::new(),
    };

    let beats = select_beats(&beat_act, period);
    if beats.is_empty() {
        return Vec::new();
    }

    let offset = choose_downbeat_offset(&beats, &downbeat_act);
    beats
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % BEATS_PER_BAR == offset)
        .map(|(_, frame)| frame)
        .collect()
}

/// Dominant beat period, in activation frames, by autocorrelation over the
/// tempo band.
fn estimate_period(act: &[f32]) -> Option<usize> {
    let fps = DOWNBEAT_FPS as f32;
    let min_lag = ((60.0 / MAX_BPM) * fps).round() as usize;
    let max_lag = ((60.0 / MIN_BPM) * fps).round() as usize;
    if act.len() <= max_lag {
        return None;
    }

    let mut best_lag = None;
    let mut best_corr = 0.0f32;
    for lag in min_lag..=max_lag {
        let mut corr = 0.0f32;
        for t in lag..act.len() {
            corr += act[t] * act[t - lag];
        }
        if corr > best_corr {
            best_corr = corr;
            best_lag = Some(lag);
        }
    }
    best_lag
}

/// Beat selection: each frame's score is its activation plus the best
/// predecessor score within half to double the period, penalized by the
/// log-squared deviation from the period. Backtracks from the best-scoring
/// tail frame.
fn select_beats(act: &[f32], period: usize) -> Vec<usize> {
    let n = act.len();
    if n == 0 || period == 0 {
        return Vec::new();
    }

    let lo_lim = (period as f32 * 0.5).round() as usize;
    let hi_lim = (period as f32 * 2.0).round() as usize;

    let mut score = vec![0.0f32; n];
    let mut backlink: Vec<Option<usize>> = vec![None; n];

    for t in 0..n {
        score[t] = act[t];
        if t < lo_lim {
            continue;
        }
        let lo = t.saturating_sub(hi_lim);
        let hi = t - lo_lim;
        let mut best = f32::NEG_INFINITY;
        let mut best_prev = None;
        for prev in lo..=hi {
            let interval = (t - prev) as f32 / period as f32;
            let candidate = score[prev] - TIGHTNESS * interval.ln().powi(2);
            if candidate > best {
                best = candidate;
                best_prev = Some(prev);
            }
        }
        if let Some(prev) = best_prev {
            if best > 0.0 {
                score[t] += best;
                backlink[t] = Some(prev);
            }
        }
    }

    // Start backtracking from the strongest frame in the final period
    let tail_start = n.saturating_sub(period.max(1));
    let mut cursor = (tail_start..n)
        .max_by(|&a, &b| score[a].partial_cmp(&score[b]).unwrap())
        .unwrap_or(n - 1);

    let mut beats = vec![cursor];
    while let Some(prev) = backlink[cursor] {
        beats.push(prev);
        cursor = prev;
    }
    beats.reverse();
    beats
}

/// Bar phase whose beats accumulate the most downbeat activation.
fn choose_downbeat_offset(beats: &[usize], downbeat_act: &[f32]) -> usize {
    let mut best_offset = 0;
    let mut best_sum = f32::NEG_INFINITY;
    for offset in 0..BEATS_PER_BAR {
        let sum: f32 = beats
            .iter()
            .enumerate()
            .filter(|(i, _)| i % BEATS_PER_BAR == offset)
            .map(|(_, &frame)| downbeat_act.get(frame).copied().unwrap_or(0.0))
            .sum();
        if sum > best_sum {
            best_sum = sum;
            best_offset = offset;
        }
    }
    best_offset
}
