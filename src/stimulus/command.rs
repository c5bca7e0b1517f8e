// THEORY:
// A `StimulusCommand` is the complete description of what the renderer should
// draw until told otherwise: one enumerated kind with its parameters, plus a
// foreground and a background color in linear RGBA.
//
// The serialized form is flat, `stim_select` naming the kind, so a command
// reads the same in a TOML protocol file, on a control queue and as a row of
// the stimulus log:
//
// ```json
// {"stim_select":"OMR","omr_angle_deg":90.0,"omr_speed_mm_per_sec":10.0,
//  "omr_spatial_period_mm":20.0,"foreground_color":[1,1,1,1],
//  "background_color":[0,0,0,1]}
// ```

use crate::error::{Result, VrError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Linear RGBA color, each channel in [0, 1].
pub type Rgba = [f32; 4];

pub const BLACK: Rgba = [0.0, 0.0, 0.0, 1.0];
pub const WHITE: Rgba = [1.0, 1.0, 1.0, 1.0];

/// How the looming disk grows during its expansion window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoomingGrowth {
    /// `r = speed * t`
    #[default]
    Linear,
    /// `r = r0 * exp(rate * t)`, with the rate derived from speed and `r0`.
    Exponential,
}

/// What the disk does between the end of its expansion and the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoomingCycle {
    #[default]
    ResetToZero,
    HoldMax,
}

/// Stimulus kind and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stim_select", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StimulusKind {
    Dark,
    Bright,
    Phototaxis {
        /// +1 paints the half-plane ahead of the animal in the foreground color.
        phototaxis_polarity: i8,
    },
    Omr {
        omr_angle_deg: f32,
        omr_speed_mm_per_sec: f32,
        omr_spatial_period_mm: f32,
    },
    Okr {
        okr_spatial_frequency_deg: f32,
        okr_speed_deg_per_sec: f32,
    },
    Looming {
        looming_center_mm: [f32; 2],
        looming_period_sec: f32,
        looming_expansion_time_sec: f32,
        looming_expansion_speed_mm_per_sec: f32,
        #[serde(default)]
        looming_growth: LoomingGrowth,
        /// Center is relative to the animal (heading frame) instead of the arena.
        #[serde(default)]
        looming_relative_to_animal: bool,
    },
    PreyCapture {
        prey_capture_speed_deg_per_sec: f32,
        prey_capture_arc_start_deg: f32,
        prey_capture_arc_stop_deg: f32,
        prey_capture_arc_radius_mm: f32,
        prey_capture_dot_radius_mm: f32,
    },
}

impl StimulusKind {
    pub fn name(&self) -> &'static str {
        match self {
            StimulusKind::Dark => "DARK",
            StimulusKind::Bright => "BRIGHT",
            StimulusKind::Phototaxis { .. } => "PHOTOTAXIS",
            StimulusKind::Omr { .. } => "OMR",
            StimulusKind::Okr { .. } => "OKR",
            StimulusKind::Looming { .. } => "LOOMING",
            StimulusKind::PreyCapture { .. } => "PREY_CAPTURE",
        }
    }

    /// Default parameters for the kind called `name`.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name.to_ascii_uppercase().as_str() {
            "DARK" => StimulusKind::Dark,
            "BRIGHT" => StimulusKind::Bright,
            "PHOTOTAXIS" => StimulusKind::Phototaxis { phototaxis_polarity: 1 },
            "OMR" => StimulusKind::Omr {
                omr_angle_deg: 0.0,
                omr_speed_mm_per_sec: 10.0,
                omr_spatial_period_mm: 10.0,
            },
            "OKR" => StimulusKind::Okr {
                okr_spatial_frequency_deg: 45.0,
                okr_speed_deg_per_sec: 60.0,
            },
            "LOOMING" => StimulusKind::Looming {
                looming_center_mm: [0.0, 0.0],
                looming_period_sec: 10.0,
                looming_expansion_time_sec: 2.0,
                looming_expansion_speed_mm_per_sec: 10.0,
                looming_growth: LoomingGrowth::Linear,
                looming_relative_to_animal: false,
            },
            "PREY_CAPTURE" => StimulusKind::PreyCapture {
                prey_capture_speed_deg_per_sec: 60.0,
                prey_capture_arc_start_deg: -45.0,
                prey_capture_arc_stop_deg: 45.0,
                prey_capture_arc_radius_mm: 2.0,
                prey_capture_dot_radius_mm: 0.1,
            },
            other => return Err(VrError::UnknownStimulus(other.to_string())),
        })
    }
}

/// A kind plus the two colors it is drawn with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusCommand {
    #[serde(flatten)]
    pub kind: StimulusKind,
    #[serde(default = "default_foreground")]
    pub foreground_color: Rgba,
    #[serde(default = "default_background")]
    pub background_color: Rgba,
}

fn default_foreground() -> Rgba {
    WHITE
}

fn default_background() -> Rgba {
    BLACK
}

impl Default for StimulusCommand {
    fn default() -> Self {
        Self::dark()
    }
}

impl fmt::Display for StimulusCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())
    }
}

impl StimulusCommand {
    pub fn new(kind: StimulusKind, foreground_color: Rgba, background_color: Rgba) -> Self {
        Self {
            kind,
            foreground_color,
            background_color,
        }
    }

    pub fn dark() -> Self {
        Self::new(StimulusKind::Dark, BLACK, BLACK)
    }

    pub fn bright() -> Self {
        Self::new(StimulusKind::Bright, WHITE, BLACK)
    }

    pub fn phototaxis(polarity: i8) -> Self {
        Self::new(
            StimulusKind::Phototaxis {
                phototaxis_polarity: polarity,
            },
            WHITE,
            BLACK,
        )
    }

    pub fn omr(period_mm: f32, angle_deg: f32, speed_mm_per_sec: f32) -> Self {
        Self::new(
            StimulusKind::Omr {
                omr_angle_deg: angle_deg,
                omr_speed_mm_per_sec: speed_mm_per_sec,
                omr_spatial_period_mm: period_mm,
            },
            WHITE,
            BLACK,
        )
    }

    pub fn okr(spatial_frequency_deg: f32, speed_deg_per_sec: f32) -> Self {
        Self::new(
            StimulusKind::Okr {
                okr_spatial_frequency_deg: spatial_frequency_deg,
                okr_speed_deg_per_sec: speed_deg_per_sec,
            },
            WHITE,
            BLACK,
        )
    }

    pub fn looming(center_mm: [f32; 2], expansion_speed_mm_per_sec: f32, expansion_time_sec: f32, period_sec: f32) -> Self {
        Self::new(
            StimulusKind::Looming {
                looming_center_mm: center_mm,
                looming_period_sec: period_sec,
                looming_expansion_time_sec: expansion_time_sec,
                looming_expansion_speed_mm_per_sec: expansion_speed_mm_per_sec,
                looming_growth: LoomingGrowth::Linear,
                looming_relative_to_animal: false,
            },
            BLACK,
            WHITE,
        )
    }

    pub fn with_colors(mut self, foreground_color: Rgba, background_color: Rgba) -> Self {
        self.foreground_color = foreground_color;
        self.background_color = background_color;
        self
    }

    /// Range checks applied when a command enters the system.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(VrError::config(format!("{}: {msg}", self.kind.name())));
        for (which, color) in [("foreground", &self.foreground_color), ("background", &self.background_color)] {
            if color.iter().any(|c| !c.is_finite() || !(0.0..=1.0).contains(c)) {
                return bad(format!("{which} color channels must lie in [0, 1]"));
            }
        }
        match &self.kind {
            StimulusKind::Dark | StimulusKind::Bright => Ok(()),
            StimulusKind::Phototaxis { phototaxis_polarity } => {
                if *phototaxis_polarity == 1 || *phototaxis_polarity == -1 {
                    Ok(())
                } else {
                    bad(format!("phototaxis_polarity must be -1 or +1, got {phototaxis_polarity}"))
                }
            }
            StimulusKind::Omr {
                omr_spatial_period_mm,
                omr_speed_mm_per_sec,
                omr_angle_deg,
            } => {
                if !(*omr_spatial_period_mm > 0.0) {
                    bad("omr_spatial_period_mm must be positive".into())
                } else if !omr_speed_mm_per_sec.is_finite() || !omr_angle_deg.is_finite() {
                    bad("omr speed and angle must be finite".into())
                } else {
                    Ok(())
                }
            }
            StimulusKind::Okr {
                okr_spatial_frequency_deg,
                okr_speed_deg_per_sec,
            } => {
                if !(*okr_spatial_frequency_deg > 0.0 && *okr_spatial_frequency_deg <= 360.0) {
                    bad("okr_spatial_frequency_deg must lie in (0, 360]".into())
                } else if !okr_speed_deg_per_sec.is_finite() {
                    bad("okr_speed_deg_per_sec must be finite".into())
                } else {
                    Ok(())
                }
            }
            StimulusKind::Looming {
                looming_period_sec,
                looming_expansion_time_sec,
                looming_expansion_speed_mm_per_sec,
                ..
            } => {
                if !(*looming_period_sec > 0.0) {
                    bad("looming_period_sec must be positive".into())
                } else if !(*looming_expansion_time_sec >= 0.0 && looming_expansion_time_sec <= looming_period_sec) {
                    bad("looming_expansion_time_sec must lie in [0, looming_period_sec]".into())
                } else if !(*looming_expansion_speed_mm_per_sec >= 0.0) {
                    bad("looming_expansion_speed_mm_per_sec must be non-negative".into())
                } else {
                    Ok(())
                }
            }
            StimulusKind::PreyCapture {
                prey_capture_arc_start_deg,
                prey_capture_arc_stop_deg,
                prey_capture_arc_radius_mm,
                prey_capture_dot_radius_mm,
                ..
            } => {
                if prey_capture_arc_start_deg >= prey_capture_arc_stop_deg {
                    bad("prey_capture_arc_start_deg must be below prey_capture_arc_stop_deg".into())
                } else if !(*prey_capture_arc_radius_mm > 0.0 && *prey_capture_dot_radius_mm > 0.0) {
                    bad("prey capture radii must be positive".into())
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_flat_with_stim_select() {
        let cmd = StimulusCommand::omr(20.0, 90.0, 10.0);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["stim_select"], "OMR");
        assert_eq!(json["omr_spatial_period_mm"], 20.0);
        assert_eq!(json["foreground_color"][0], 1.0);
        let back: StimulusCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn parses_from_toml_with_default_colors() {
        let cmd: StimulusCommand = toml::from_str(
            r#"
            stim_select = "PHOTOTAXIS"
            phototaxis_polarity = -1
            "#,
        )
        .unwrap();
        assert_eq!(cmd.kind, StimulusKind::Phototaxis { phototaxis_polarity: -1 });
        assert_eq!(cmd.foreground_color, WHITE);
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn unknown_kinds_are_configuration_errors() {
        let err = StimulusKind::from_name("SPIRAL").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(serde_json::from_str::<StimulusCommand>(r#"{"stim_select":"SPIRAL"}"#).is_err());
        assert_eq!(StimulusKind::from_name("prey_capture").unwrap().name(), "PREY_CAPTURE");
    }

    #[test]
    fn validation_catches_bad_parameters() {
        assert!(StimulusCommand::phototaxis(0).validate().is_err());
        assert!(StimulusCommand::omr(0.0, 0.0, 1.0).validate().is_err());
        assert!(StimulusCommand::looming([0.0, 0.0], 100.0, 12.0, 10.0).validate().is_err());
        let bad_color = StimulusCommand::bright().with_colors([2.0, 0.0, 0.0, 1.0], BLACK);
        assert!(bad_color.validate().is_err());
    }
}
