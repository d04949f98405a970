//! Unit conventions and boundary conversions.
//!
//! All internal computation uses mm and radians. Users command and read
//! orientations in um and arcsec; mount units are integer controller
//! microsteps.

use std::f64::consts::PI;

pub const MM_PER_MICRON: f64 = 1.0 / 1000.0;
pub const MM_PER_INCH: f64 = 25.4;
pub const RAD_PER_DEG: f64 = PI / 180.0;
pub const ARCSEC_PER_DEG: f64 = 60.0 * 60.0;
pub const RAD_PER_ARCSEC: f64 = RAD_PER_DEG / ARCSEC_PER_DEG;

/// Scale from user units (um, arcsec) to internal units (mm, rad),
/// one entry per orientation axis.
const ORIENT_SCALE: [f64; 6] = [
    MM_PER_MICRON,  // piston
    RAD_PER_ARCSEC, // x tilt
    RAD_PER_ARCSEC, // y tilt
    MM_PER_MICRON,  // x translation
    MM_PER_MICRON,  // y translation
    RAD_PER_ARCSEC, // z rotation
];

/// Convert up to 6 user orientation values (um, arcsec) to mm and rad,
/// preserving length.
pub fn orient_to_mm_rad(user: &[f64]) -> Vec<f64> {
    user.iter()
        .zip(ORIENT_SCALE.iter())
        .map(|(v, s)| v * s)
        .collect()
}

/// Convert a full orientation from mm and rad to um and arcsec.
pub fn orient_to_um_arcsec(orient: &[f64; 6]) -> [f64; 6] {
    let mut out = [0.0; 6];
    for (o, (v, s)) in out.iter_mut().zip(orient.iter().zip(ORIENT_SCALE.iter())) {
        *o = v / s;
    }
    out
}
