use crate::data::model::{ModelRecord, SpectrumRecord};

// ---------------------------------------------------------------------------
// Viewer state
// ---------------------------------------------------------------------------

/// The full viewer state, independent of rendering.
#[derive(Debug, Clone, Default)]
pub struct ViewerState {
    /// Observations returned by a query.
    pub spectra: Vec<SpectrumRecord>,

    /// Models, index-aligned with `spectra` when present.
    pub models: Vec<ModelRecord>,

    /// Index of the observation on screen.
    pub selected: usize,

    /// Plot title, shown over the first panel.
    pub title: Option<String>,

    /// Lower/upper flux percentiles used as y-limits.
    pub percentiles: Option<(f64, f64)>,

    /// Whether the model overlay is drawn.
    pub show_model: bool,

    /// Status / error message shown in the UI.
    pub status_message: Option<String>,
}

impl ViewerState {
    pub fn new(spectra: Vec<SpectrumRecord>, models: Vec<ModelRecord>) -> Self {
        let show_model = !models.is_empty();
        Self {
            spectra,
            models,
            show_model,
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_percentiles(mut self, percentiles: Option<(f64, f64)>) -> Self {
        self.percentiles = percentiles;
        self
    }

    pub fn current(&self) -> Option<&SpectrumRecord> {
        self.spectra.get(self.selected)
    }

    /// Model of the current observation, if the overlay is on.
    pub fn current_model(&self) -> Option<&ModelRecord> {
        if !self.show_model {
            return None;
        }
        self.models.get(self.selected)
    }

    pub fn select(&mut self, index: usize) {
        if index < self.spectra.len() {
            self.selected = index;
        }
    }

    pub fn next(&mut self) {
        self.select(self.selected + 1);
    }

    pub fn previous(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
        }
    }
}
