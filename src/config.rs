// Process-wide analysis settings. Everything here is a fixed constant by
// design: the service exposes a single endpoint and the DSP parameters are
// part of its external contract, not tunables.

use std::path::PathBuf;

/// Upload ceiling in bytes. Anything larger is rejected with 413 before any
/// decoding work starts.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Every uploaded file is resampled to this rate before analysis. 22.05 kHz
/// halves memory and FFT cost versus CD rate while keeping the full rhythm
/// band intact.
pub const TARGET_SAMPLE_RATE: u32 = 22_050;

/// Stride between analysis frames, in samples. All hop-indexed features
/// (onset strength, RMS, PLP) share this resolution.
pub const HOP_LENGTH: usize = 512;

/// FFT window for the onset strength envelope and HPSS spectrograms.
pub const N_FFT: usize = 2048;

/// Frame length for the RMS envelope (hop stays at `HOP_LENGTH`).
pub const RMS_FRAME_LENGTH: usize = 2048;

/// A beat counts as downbeat-aligned when a tracked downbeat lies within
/// this window of it.
pub const DOWNBEAT_TOLERANCE_SECS: f64 = 0.05;

/// Frame rate of the downbeat model's activation output.
pub const DOWNBEAT_FPS: usize = 100;

/// Rendered figure: minimum width, growth per second of audio, and the hard
/// pixel cap that bounds image size for long clips.
pub const FIG_MIN_WIDTH_PX: u32 = 1000;
pub const FIG_PX_PER_SECOND: f64 = 100.0;
pub const FIG_MAX_WIDTH_PX: u32 = 15_000;
pub const FIG_HEIGHT_PX: u32 = 800;

/// Where to look for the downbeat ONNX model. Read once at startup; a missing
/// or unloadable model just disables the downbeat stage.
pub fn downbeat_model_path() -> PathBuf {
    std::env::var("BEATSCOPE_DOWNBEAT_MODEL")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models/downbeat.onnx"))
}

/// Listen port, overridable via environment.
pub fn listen_port() -> u16 {
    std::env::var("BEATSCOPE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8096)
}

/// Width of the rendered figure for a clip of the given duration.
pub fn figure_width_px(duration_secs: f64) -> u32 {
    let grown = FIG_MIN_WIDTH_PX as f64 + duration_secs * FIG_PX_PER_SECOND;
    (grown as u32).clamp(FIG_MIN_WIDTH_PX, FIG_MAX_WIDTH_PX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_figure_width_short_clip() {
        // A 3-second clip stays above the minimum width
        assert_eq!(figure_width_px(3.0), 1300);
    }

    #[test]
    fn test_figure_width_capped() {
        // A very long clip hits the pixel cap
        assert_eq!(figure_width_px(3600.0), FIG_MAX_WIDTH_PX);
    }

    #[test]
    fn test_figure_width_zero_duration() {
        assert_eq!(figure_width_px(0.0), FIG_MIN_WIDTH_PX);
    }
}
