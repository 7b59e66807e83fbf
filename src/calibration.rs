//! Pixel to millimeter conversion and the calibration step that produces
//! the coefficients.
//!
//! The top camera sees the part's length and width as the two sides of one
//! bounding box; which side is which depends on how the part lies on the
//! belt relative to the camera, so the choice is made once at calibration
//! time ([AxisMapping]) and reused for every scan.

use std::path::Path;

use anyhow::{Context, Result};
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::{measure::BoundingRegion, Axis, Dimensions, Error};

/// Name of the profile file inside the state directory.
pub const PROFILE_FILE: &str = "calibration.toml";

/// Which side of the top-view box is the part's length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize, Display, FromStr)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum AxisMapping {
    /// The box width is the length, the box height is the width.
    #[default]
    WidthIsLength,
    /// The box height is the length, the box width is the width.
    HeightIsLength,
}

impl AxisMapping {
    /// Pixel extents of (length, width) for a top-view box.
    pub fn top_extents(self, region: &BoundingRegion) -> (usize, usize) {
        match self {
            AxisMapping::WidthIsLength => (region.width, region.height),
            AxisMapping::HeightIsLength => (region.height, region.width),
        }
    }
}

/// Persisted millimeters-per-pixel coefficients. A coefficient of 0 means
/// that axis is not calibrated.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct CalibrationProfile {
    /// Length axis, top camera.
    #[serde(default)]
    pub mm_per_px_axis1: f64,
    /// Width axis, top camera.
    #[serde(default)]
    pub mm_per_px_axis2: f64,
    /// Height axis, side camera.
    #[serde(default)]
    pub mm_per_px_side: f64,
    /// How the top-view box maps to length and width.
    #[serde(default)]
    pub mapping: AxisMapping,
}

impl CalibrationProfile {
    /// Coefficient for `axis`.
    pub fn coefficient(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.mm_per_px_axis1,
            Axis::Y => self.mm_per_px_axis2,
            Axis::Z => self.mm_per_px_side,
        }
    }

    /// Whether every axis has a usable coefficient.
    pub fn is_complete(&self) -> bool {
        Axis::ALL.iter().all(|&axis| self.coefficient(axis) > 0.0)
    }

    /// Load a profile; a missing file yields the uncalibrated default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no calibration profile, starting uncalibrated");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the profile, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?).with_context(|| format!("writing {}", path.display()))
    }
}

/// Relative difference of `a` and `b`, 0 when both are 0.
pub fn rel_err(a: f64, b: f64) -> f64 {
    if a == 0.0 && b == 0.0 {
        return 0.0;
    }
    (a - b).abs() / a.abs().max(b.abs() + 1e-9)
}

/// Pick the mapping under which the top-view box agrees best with the
/// `nominal` part: under the right mapping both sides imply the same scale.
/// Ties go to [AxisMapping::WidthIsLength].
pub fn choose_axis_mapping(top: &BoundingRegion, nominal: &Dimensions) -> AxisMapping {
    if !top.is_found() {
        return AxisMapping::default();
    }
    let (px_w, px_h) = (top.width as f64, top.height as f64);
    let width_is_length = rel_err(nominal.length / px_w, nominal.width / px_h);
    let height_is_length = rel_err(nominal.length / px_h, nominal.width / px_w);

    if height_is_length < width_is_length {
        AxisMapping::HeightIsLength
    } else {
        AxisMapping::WidthIsLength
    }
}

/// Compute a profile from one reference part whose true dimensions are
/// `confirmed`.
///
/// # Errors
///
/// Returns [Error::Calibration] if any confirmed dimension or pixel extent
/// is not positive.
pub fn calibrate(
    top: &BoundingRegion,
    side: &BoundingRegion,
    mapping: AxisMapping,
    confirmed: &Dimensions,
) -> crate::Result<CalibrationProfile> {
    for axis in Axis::ALL {
        let value = confirmed.along(axis);
        if value.is_nan() || value <= 0.0 {
            return Err(Error::Calibration(format!("confirmed {axis} must be positive, got {value}")));
        }
    }

    let (px_length, px_width) = mapping.top_extents(top);
    if px_length == 0 || px_width == 0 {
        return Err(Error::Calibration("top view has no object".to_string()));
    }
    if side.height == 0 {
        return Err(Error::Calibration("side view has no object".to_string()));
    }

    Ok(CalibrationProfile {
        mm_per_px_axis1: confirmed.length / px_length as f64,
        mm_per_px_axis2: confirmed.width / px_width as f64,
        mm_per_px_side: confirmed.height / side.height as f64,
        mapping,
    })
}

fn scale(axis: Axis, pixels: usize, coefficient: f64, view: &'static str) -> f64 {
    if pixels == 0 {
        let err = Error::MeasurementNotFound { view };
        tracing::warn!(error = %err, %axis, "dimension set to 0");
        return 0.0;
    }
    if coefficient.is_nan() || coefficient <= 0.0 {
        let err = Error::Uncalibrated { axis };
        tracing::warn!(error = %err, "dimension set to 0");
        return 0.0;
    }
    pixels as f64 * coefficient
}

/// Convert top and side boxes to millimeters. A missing box or a zero
/// coefficient yields 0 on the affected axes, with a warning that says
/// which of the two it was.
pub fn px_to_mm(
    top: Option<&BoundingRegion>,
    side: Option<&BoundingRegion>,
    mapping: AxisMapping,
    profile: &CalibrationProfile,
) -> Dimensions {
    let (px_length, px_width) = top.map_or((0, 0), |region| mapping.top_extents(region));
    let px_height = side.map_or(0, |region| region.height);

    Dimensions {
        length: scale(Axis::X, px_length, profile.mm_per_px_axis1, "top"),
        width: scale(Axis::Y, px_width, profile.mm_per_px_axis2, "top"),
        height: scale(Axis::Z, px_height, profile.mm_per_px_side, "side"),
    }
}

/// Horizontal millimeters per pixel for a camera `distance_mm` from the
/// scene with a horizontal field of view of `fov_deg`. Returns 0 for an
/// empty image.
pub fn mm_per_pixel_from_fov(image_width_px: usize, distance_mm: f64, fov_deg: f64) -> f64 {
    if image_width_px == 0 {
        return 0.0;
    }
    let scene_width_mm = 2.0 * distance_mm * (fov_deg.to_radians() / 2.0).tan();
    scene_width_mm / image_width_px as f64
}
