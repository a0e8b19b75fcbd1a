use eframe::egui::Color32;
use palette::{Hsl, IntoColor, Srgb};

use crate::data::model::Arm;

// ---------------------------------------------------------------------------
// Arm colours
// ---------------------------------------------------------------------------

fn hsl(hue: f32, saturation: f32, lightness: f32) -> Color32 {
    let rgb: Srgb = Hsl::new(hue, saturation, lightness).into_color();
    Color32::from_rgb(
        (rgb.red.clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgb.green.clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgb.blue.clamp(0.0, 1.0) * 255.0).round() as u8,
    )
}

/// Flux colour of an arm: blue, green, red.
pub fn flux_color(arm: Arm) -> Color32 {
    match arm {
        Arm::B => hsl(240.0, 1.0, 0.5),
        Arm::R => hsl(120.0, 1.0, 0.25),
        Arm::Z => hsl(0.0, 1.0, 0.5),
    }
}

/// Model overlay colour of an arm: light blue, light green, orange.
pub fn model_color(arm: Arm) -> Color32 {
    let c = match arm {
        Arm::B => hsl(195.0, 0.53, 0.79),
        Arm::R => hsl(120.0, 0.73, 0.75),
        Arm::Z => hsl(39.0, 1.0, 0.5),
    };
    c.gamma_multiply(0.7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flux_colors_follow_arm_order() {
        let b = flux_color(Arm::B);
        let r = flux_color(Arm::R);
        let z = flux_color(Arm::Z);
        assert!(b.b() > b.r() && b.b() > b.g());
        assert!(r.g() > r.r() && r.g() > r.b());
        assert!(z.r() > z.g() && z.r() > z.b());
    }

    #[test]
    fn model_colors_are_translucent_and_distinct() {
        let colors: Vec<Color32> = Arm::ALL.iter().map(|&a| model_color(a)).collect();
        assert!(colors.iter().all(|c| c.a() < 255));
        assert_ne!(colors[0], colors[1]);
        assert_ne!(colors[1], colors[2]);
    }
}
