use eframe::egui;

use crate::state::ViewerState;
use crate::ui::{panels, plot};

// ---------------------------------------------------------------------------
// eframe App implementation
// ---------------------------------------------------------------------------

pub struct SpectrumViewerApp {
    pub state: ViewerState,
}

impl SpectrumViewerApp {
    pub fn new(state: ViewerState) -> Self {
        Self { state }
    }
}

impl eframe::App for SpectrumViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // ---- Top panel: menu bar ----
        egui::TopBottomPanel::top("top_bar").show(ctx, |ui| {
            panels::top_bar(ui, &mut self.state);
        });

        // ---- Left side panel: fibermap row ----
        if self.state.current().is_some_and(|s| s.fibermap.is_some()) {
            egui::SidePanel::left("fibermap_panel")
                .default_width(240.0)
                .resizable(true)
                .show(ctx, |ui| {
                    panels::fibermap_panel(ui, &self.state);
                });
        }

        // ---- Central panel: b / r / z plots ----
        egui::CentralPanel::default().show(ctx, |ui| {
            plot::spectrum_panels(ui, &self.state);
        });
    }
}

/// Open a window showing `state` and block until it is closed.
pub fn run_viewer(state: ViewerState) -> eframe::Result {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_min_inner_size([600.0, 400.0]),
        ..Default::default()
    };

    eframe::run_native(
        "DESI spectrum viewer",
        options,
        Box::new(|_cc| Ok(Box::new(SpectrumViewerApp::new(state)))),
    )
}
