use eframe::egui::{self, Color32, RichText, Ui};

use crate::data::export;
use crate::state::ViewerState;

// ---------------------------------------------------------------------------
// Top bar
// ---------------------------------------------------------------------------

/// Render the top menu / toolbar.
pub fn top_bar(ui: &mut Ui, state: &mut ViewerState) {
    egui::menu::bar(ui, |ui: &mut Ui| {
        ui.menu_button("File", |ui: &mut Ui| {
            let enabled = state.current().is_some();
            if ui
                .add_enabled(enabled, egui::Button::new("Export CSV…"))
                .clicked()
            {
                export_csv_dialog(state);
                ui.close_menu();
            }
        });

        ui.separator();

        let n = state.spectra.len();
        if n > 1 {
            if ui.small_button("◀").clicked() {
                state.previous();
            }
            ui.label(format!("observation {} of {n}", state.selected + 1));
            if ui.small_button("▶").clicked() {
                state.next();
            }
            ui.separator();
        }

        if !state.models.is_empty() {
            ui.checkbox(&mut state.show_model, "Model");
        }

        if let Some(targetid) = state
            .current()
            .and_then(|s| s.fibermap.as_ref())
            .and_then(|f| f.get("TARGETID"))
        {
            ui.separator();
            ui.label(format!("TARGETID {targetid}"));
        }

        if let Some(msg) = &state.status_message {
            ui.label(RichText::new(msg).color(Color32::RED));
        }
    });
}

// ---------------------------------------------------------------------------
// Side panel
// ---------------------------------------------------------------------------

/// Fibermap columns of the current observation.
pub fn fibermap_panel(ui: &mut Ui, state: &ViewerState) {
    let Some(fibermap) = state.current().and_then(|s| s.fibermap.as_ref()) else {
        return;
    };
    ui.heading("Fibermap");
    ui.separator();
    egui::ScrollArea::vertical().show(ui, |ui: &mut Ui| {
        egui::Grid::new("fibermap_grid")
            .num_columns(2)
            .striped(true)
            .show(ui, |ui: &mut Ui| {
                for (name, value) in fibermap {
                    ui.label(RichText::new(name).strong());
                    ui.label(value.to_string());
                    ui.end_row();
                }
            });
    });
}

// ---------------------------------------------------------------------------
// File dialog
// ---------------------------------------------------------------------------

pub fn export_csv_dialog(state: &mut ViewerState) {
    let Some(spectrum) = state.current() else {
        return;
    };
    let file = rfd::FileDialog::new()
        .set_title("Export spectrum")
        .set_file_name("spectrum.csv")
        .add_filter("CSV", &["csv"])
        .save_file();

    if let Some(path) = file {
        match export::save_csv(&path, spectrum, state.current_model()) {
            Ok(()) => {
                log::info!("Exported spectrum to {}", path.display());
                state.status_message = None;
            }
            Err(e) => {
                log::error!("Failed to export spectrum: {e}");
                state.status_message = Some(format!("Error: {e}"));
            }
        }
    }
}
