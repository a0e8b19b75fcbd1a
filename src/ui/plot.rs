use eframe::egui::Ui;
use egui_plot::{Line, Plot, PlotBounds, PlotPoints};

use crate::color::{flux_color, model_color};
use crate::data::model::Arm;
use crate::state::ViewerState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split a spectrum into runs of non-zero flux; zero flux marks missing
/// pixels and is drawn as a gap.
pub fn flux_segments(wavelength: &[f64], flux: &[f64]) -> Vec<Vec<[f64; 2]>> {
    let mut segments = Vec::new();
    let mut current: Vec<[f64; 2]> = Vec::new();
    for (&x, &y) in wavelength.iter().zip(flux) {
        if y == 0.0 || !y.is_finite() {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        } else {
            current.push([x, y]);
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Score at percentile `p` (0–100) with linear interpolation between the
/// closest ranks.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Y-limits from a pair of flux percentiles.
pub fn percentile_bounds(flux: &[f64], (lo, hi): (f64, f64)) -> Option<(f64, f64)> {
    let low = percentile(flux, lo)?;
    let high = percentile(flux, hi)?;
    (high > low).then_some((low, high))
}

// ---------------------------------------------------------------------------
// Spectrum panels (central panel)
// ---------------------------------------------------------------------------

/// Render the b, r and z arms as three stacked plots.
pub fn spectrum_panels(ui: &mut Ui, state: &ViewerState) {
    let Some(spectrum) = state.current() else {
        ui.centered_and_justified(|ui: &mut Ui| {
            ui.heading("No spectra to show");
        });
        return;
    };
    let model = state.current_model();

    if let Some(title) = &state.title {
        ui.vertical_centered(|ui: &mut Ui| ui.heading(title));
    }

    let spacing = ui.spacing().item_spacing.y;
    let height = ((ui.available_height() - 2.0 * spacing) / 3.0).max(80.0);

    for arm in Arm::ALL {
        let Some(data) = spectrum.arm(arm) else {
            continue;
        };
        let x_min = data.wavelength.first().copied().unwrap_or(0.0);
        let x_max = data.wavelength.last().copied().unwrap_or(1.0);
        let y_limits = state
            .percentiles
            .and_then(|p| percentile_bounds(&data.flux, p));

        let mut plot = Plot::new(format!("arm_{arm}"))
            .height(height)
            .y_axis_label("Flux")
            .allow_boxed_zoom(true)
            .allow_drag(true)
            .allow_scroll(true)
            .allow_zoom(true);
        if arm == Arm::Z {
            plot = plot.x_axis_label("Wavelength");
        }

        plot.show(ui, |plot_ui| {
            for segment in flux_segments(&data.wavelength, &data.flux) {
                let line = Line::new(PlotPoints::from(segment))
                    .name(format!("{arm} flux"))
                    .color(flux_color(arm))
                    .width(1.2);
                plot_ui.line(line);
            }

            if let Some(arm_model) = model.and_then(|m| m.arm(arm)) {
                let points: PlotPoints = arm_model
                    .wavelength
                    .iter()
                    .zip(&arm_model.model)
                    .map(|(&x, &y)| [x, y])
                    .collect();
                plot_ui.line(
                    Line::new(points)
                        .name(format!("{arm} model"))
                        .color(model_color(arm))
                        .width(1.5),
                );
            }

            if let Some((y_min, y_max)) = y_limits {
                plot_ui.set_plot_bounds(PlotBounds::from_min_max([x_min, y_min], [x_max, y_max]));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_flux_splits_segments() {
        let wave = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let flux = [1.0, 2.0, 0.0, 0.0, 5.0, 6.0];
        let segments = flux_segments(&wave, &flux);
        assert_eq!(segments, vec![vec![[1.0, 1.0], [2.0, 2.0]], vec![[5.0, 5.0], [6.0, 6.0]]]);
        assert!(flux_segments(&wave, &[0.0; 6]).is_empty());
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 50.0), Some(3.0));
        assert_eq!(percentile(&values, 100.0), Some(5.0));
        assert_eq!(percentile(&values, 25.0), Some(2.0));
        assert_eq!(percentile(&[1.0, 2.0], 50.0), Some(1.5));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn flat_flux_has_no_bounds() {
        assert_eq!(percentile_bounds(&[2.0; 10], (1.0, 99.0)), None);
        assert_eq!(
            percentile_bounds(&[0.0, 10.0], (10.0, 90.0)),
            Some((1.0, 9.0))
        );
    }
}
