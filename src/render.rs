// Three-panel analysis overview rendered to an in-memory PNG.
//
// Panels share the time axis, clipped to [0, duration]:
//   1. onset strength with beat (dashed) and downbeat (solid) markers
//   2. PLP curve with its peak candidates and downbeats
//   3. harmonic vs percussive components with downbeat markers
//
// The figure width grows with clip duration up to a hard pixel cap so long
// uploads cannot produce unbounded images. Everything is drawn into an owned
// RGB buffer, PNG-encoded and base64-encoded; all buffers die with this call.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use plotters::prelude::*;
use plotters::series::DashedLineSeries;

use crate::config::{figure_width_px, FIG_HEIGHT_PX, HOP_LENGTH};

/// Everything the overview needs, borrowed from the pipeline's intermediate
/// results.
pub struct OverviewInputs<'a> {
    pub onset_env: &'a [f32],
    pub plp: &'a [f32],
    pub beat_times: &'a [f64],
    pub plp_beat_times: &'a [f64],
    pub downbeats: &'a [f64],
    pub harmonic: &'a [f32],
    pub percussive: &'a [f32],
    pub sample_rate: u32,
    pub duration: f64,
}

/// Render the overview and return it as a base64 PNG string.
pub fn render_overview(inputs: &OverviewInputs) -> Result<String, String> {
    if inputs.duration <= 0.0 {
        return Err("Cannot render a zero-length clip".to_string());
    }

    let width = figure_width_px(inputs.duration);
    let height = FIG_HEIGHT_PX;

    let mut rgb = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut rgb, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| format!("Figure fill failed: {}", e))?;

        let panels = root.split_evenly((3, 1));

        draw_envelope_panel(
            &panels[0],
            "Onset strength + beats",
            inputs.onset_env,
            inputs.sample_rate,
            inputs.duration,
            inputs.beat_times,
            "Beats",
            inputs.downbeats,
        )?;

        draw_envelope_panel(
            &panels[1],
            "Predominant local pulse",
            inputs.plp,
            inputs.sample_rate,
            inputs.duration,
            inputs.plp_beat_times,
            "PLP beats",
            inputs.downbeats,
        )?;

        draw_components_panel(
            &panels[2],
            inputs.harmonic,
            inputs.percussive,
            inputs.duration,
            inputs.downbeats,
        )?;

        root.present().map_err(|e| format!("Figure present failed: {}", e))?;
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| format!("PNG encoding failed: {}", e))?;
    drop(rgb);

    Ok(BASE64.encode(&png))
}

type Panel<'a> = DrawingArea<BitMapBackend<'a>, plotters::coord::Shift>;

/// A hop-indexed curve with dashed candidate markers and solid downbeat
/// markers layered on top.
#[allow(clippy::too_many_arguments)]
fn draw_envelope_panel(
    panel: &Panel,
    title: &str,
    curve: &[f32],
    sample_rate: u32,
    duration: f64,
    marker_times: &[f64],
    marker_label: &str,
    downbeats: &[f64],
) -> Result<(), String> {
    let y_max = curve.iter().cloned().fold(0.0f32, f32::max).max(1e-6) as f64;

    let mut chart = ChartBuilder::on(panel)
        .caption(title, ("sans-serif", 18))
        .margin(5)
        .x_label_area_size(22)
        .y_label_area_size(42)
        .build_cartesian_2d(0.0..duration, 0.0..y_max * 1.05)
        .map_err(|e| format!("Chart construction failed: {}", e))?;

    chart
        .configure_mesh()
        .disable_mesh()
        .draw()
        .map_err(|e| format!("Axis drawing failed: {}", e))?;

    let hop_secs = HOP_LENGTH as f64 / sample_rate as f64;
    chart
        .draw_series(LineSeries::new(
            curve
                .iter()
                .enumerate()
                .map(|(i, &v)| (i as f64 * hop_secs, v as f64)),
            &BLUE,
        ))
        .map_err(|e| format!("Curve drawing failed: {}", e))?
        .label(title)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLUE));

    if !marker_times.is_empty() {
        for &t in marker_times {
            chart
                .draw_series(DashedLineSeries::new(
                    [(t, 0.0), (t, y_max)],
                    4,
                    4,
                    RED.mix(0.7).stroke_width(1),
                ))
                .map_err(|e| format!("Marker drawing failed: {}", e))?;
        }
        // One invisible series to carry the legend entry for the markers
        chart
            .draw_series(std::iter::once(PathElement::new(
                Vec::<(f64, f64)>::new(),
                RED.mix(0.7),
            )))
            .map_err(|e| format!("Legend series failed: {}", e))?
            .label(marker_label)
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], RED));
    }

    if !downbeats.is_empty() {
        for &t in downbeats {
            chart
                .draw_series(LineSeries::new(
                    [(t, 0.0), (t, y_max)],
                    GREEN.mix(0.8).stroke_width(2),
                ))
                .map_err(|e| format!("Downbeat drawing failed: {}", e))?;
        }
        chart
            .draw_series(std::iter::once(PathElement::new(
                Vec::<(f64, f64)>::new(),
                GREEN,
            )))
            .map_err(|e| format!("Legend series failed: {}", e))?
            .label("Downbeats")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], GREEN));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .draw()
        .map_err(|e| format!("Legend drawing failed: {}", e))?;

    Ok(())
}

/// Harmonic and percussive traces overlapped, downbeats as vertical lines.
fn draw_components_panel(
    panel: &Panel,
    harmonic: &[f32],
    percussive: &[f32],
    duration: f64,
    downbeats: &[f64],
) -> Result<(), String> {
    let amp = harmonic
        .iter()
        .chain(percussive.iter())
        .fold(0.0f32, |m, &v| m.max(v.abs()))
        .max(0.3) as f64;

    let mut chart = ChartBuilder::on(panel)
        .caption("Harmonic vs percussive", ("sans-serif", 18))
        .margin(5)
        .x_label_area_size(22)
        .y_label_area_size(42)
        .build_cartesian_2d(0.0..duration, -amp..amp)
        .map_err(|e| format!("Chart construction failed: {}", e))?;

    chart
        .configure_mesh()
        .disable_mesh()
        .draw()
        .map_err(|e| format!("Axis drawing failed: {}", e))?;

    for (signal, color, label) in [
        (harmonic, BLUE.mix(0.6), "Harmonic"),
        (percussive, RED.mix(0.6), "Percussive"),
    ] {
        chart
            .draw_series(LineSeries::new(
                decimate(signal, duration),
                color.stroke_width(1),
            ))
            .map_err(|e| format!("Component drawing failed: {}", e))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
    }

    if !downbeats.is_empty() {
        for &t in downbeats {
            chart
                .draw_series(LineSeries::new(
                    [(t, -0.3), (t, 0.3)],
                    GREEN.mix(0.8).stroke_width(2),
                ))
                .map_err(|e| format!("Downbeat drawing failed: {}", e))?;
        }
        chart
            .draw_series(std::iter::once(PathElement::new(
                Vec::<(f64, f64)>::new(),
                GREEN,
            )))
            .map_err(|e| format!("Legend series failed: {}", e))?
            .label("Downbeats")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], GREEN));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .draw()
        .map_err(|e| format!("Legend drawing failed: {}", e))?;

    Ok(())
}

/// Reduce a full-rate signal to a plottable point set, keeping the
/// largest-magnitude sample per bucket so transients stay visible.
fn decimate(signal: &[f32], duration: f64) -> Vec<(f64, f64)> {
    const MAX_POINTS: usize = 30_000;
    if signal.is_empty() {
        return Vec::new();
    }

    let bucket = (signal.len() / MAX_POINTS).max(1);
    signal
        .chunks(bucket)
        .enumerate()
        .map(|(i, chunk)| {
            let peak = chunk
                .iter()
                .cloned()
                .max_by(|a, b| a.abs().partial_cmp(&b.abs()).unwrap())
                .unwrap_or(0.0);
            let t = (i * bucket) as f64 / signal.len() as f64 * duration;
            (t, peak as f64)
        })
        .collect()
}
