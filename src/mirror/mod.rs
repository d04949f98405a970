//! Mirror geometry: the reversible mapping between a six-axis orientation
//! and per-link linear lengths.
//!
//! The units for orientation are mm and radians (not user-friendly units,
//! but best for computation). The forward direction (orientation to mount)
//! is direct; the inverse is a weighted nonlinear least-squares fit that
//! also honors the zero-stretch constraint of any fixed-length links.

pub mod fit;
pub mod link;
pub mod presets;

pub use fit::FitError;
pub use link::{Adjust, Link, LinkKind};

use std::f64::consts::PI;

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use fit::{powell, FIT_TOL, MAX_FIT_ITER};

/// Perturbation per axis used to derive the fit weights: a unit change of
/// any axis should contribute comparably to the objective.
const WEIGHT_PERTURB: [f64; 6] = [1e-4, 5e-8, 5e-8, 1e-4, 1e-4, 5e-7];

/// Initial per-axis search direction magnitudes for the fits (mm / rad).
const FIT_STEP: [f64; 6] = [1.0, 1e-4, 1e-4, 1.0, 1.0, 1e-4];

/// The 6-axis rigid-body pose of the mirror: piston, two tilts, two
/// translations and one rotation, in mm and radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    pub piston: f64,
    pub tilt_x: f64,
    pub tilt_y: f64,
    pub trans_x: f64,
    pub trans_y: f64,
    pub rot_z: f64,
}

impl Orientation {
    pub const ZERO: Orientation = Orientation {
        piston: 0.0,
        tilt_x: 0.0,
        tilt_y: 0.0,
        trans_x: 0.0,
        trans_y: 0.0,
        rot_z: 0.0,
    };

    pub fn from_array(a: [f64; 6]) -> Self {
        Orientation {
            piston: a[0],
            tilt_x: a[1],
            tilt_y: a[2],
            trans_x: a[3],
            trans_y: a[4],
            rot_z: a[5],
        }
    }

    /// Build from up to 6 leading axis values; trailing axes are zero.
    pub fn from_partial(values: &[f64]) -> Self {
        let mut a = [0.0; 6];
        a[..values.len()].copy_from_slice(values);
        Self::from_array(a)
    }

    pub fn as_array(&self) -> [f64; 6] {
        [
            self.piston,
            self.tilt_x,
            self.tilt_y,
            self.trans_x,
            self.trans_y,
            self.rot_z,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Error)]
pub enum MirrorError {
    #[error("orientation must have 0, 1, 3, 5 or 6 values; got {0}")]
    BadOrientationLen(usize),
    #[error("need {expected} mount values; got {got}")]
    BadMountLen { expected: usize, got: usize },
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// Errors in the construction of a mirror geometry.
#[derive(Debug, Clone, Error)]
pub enum GeometryError {
    #[error("need exactly 6 actuators plus fixed-length links; got {0}")]
    BadLinkCount(usize),
    #[error("a mirror may have 0, 1 or 3 fixed links; got {0}")]
    BadFixedCount(usize),
    #[error("encoder list must have one slot per actuator")]
    BadEncoderCount,
    #[error("actuators and encoders must be adjustable links")]
    NotAdjustable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MirrorKind {
    /// Actuators and fixed links connect directly to the mirror.
    Direct,
    /// The mirror rides a central linear bearing that is tipped about a
    /// ball joint to translate the mirror; link-list entries 3 and 4 tip
    /// the bearing instead of pushing the mirror face.
    TipTrans { ctr_mir_z: f64, ctr_base_z: f64 },
}

/// One encoder slot: the sensing link plus the error bounds (in steps)
/// that drive move iteration. An empty slot means the actuator is used as
/// its own encoder.
#[derive(Debug, Clone)]
pub struct EncoderSlot {
    pub link: Option<Link>,
    pub min_corr: f64,
    pub max_corr: f64,
}

#[derive(Debug, Clone)]
pub struct MirrorModel {
    name: String,
    kind: MirrorKind,
    actuators: Vec<Link>,
    fixed: Vec<Link>,
    encoders: Vec<Link>,
    has_encoders: bool,
    min_corr: Vec<f64>,
    max_corr: Vec<f64>,
    /// Orientation axes constrained by the fixed links.
    fixed_axes: Vec<usize>,
    act_weights: Vec<f64>,
    enc_weights: Vec<f64>,
    fixed_weights: Vec<f64>,
}

impl MirrorModel {
    pub fn new(
        name: impl Into<String>,
        kind: MirrorKind,
        actuators: Vec<Link>,
        fixed: Vec<Link>,
        encoders: Option<Vec<EncoderSlot>>,
    ) -> Result<Self, GeometryError> {
        let n_links = actuators.len() + fixed.len();
        if n_links != 6 {
            return Err(GeometryError::BadLinkCount(n_links));
        }
        let fixed_axes: Vec<usize> = match fixed.len() {
            0 => vec![],
            // one antirotation link: z rotation is constrained
            1 => vec![5],
            // x,y translation and z rotation are constrained
            3 => vec![3, 4, 5],
            n => return Err(GeometryError::BadFixedCount(n)),
        };
        if !actuators.iter().all(Link::is_adjustable) {
            return Err(GeometryError::NotAdjustable);
        }

        let (enc_links, min_corr, max_corr, has_encoders) = match encoders {
            None => {
                // No encoders: the actuators sense themselves and the
                // correction bounds never fire.
                let n = actuators.len();
                (actuators.clone(), vec![f64::INFINITY; n], vec![f64::INFINITY; n], false)
            }
            Some(slots) => {
                if slots.len() != actuators.len() {
                    return Err(GeometryError::BadEncoderCount);
                }
                let mut links = Vec::with_capacity(slots.len());
                let mut min_corr = Vec::with_capacity(slots.len());
                let mut max_corr = Vec::with_capacity(slots.len());
                for (slot, act) in slots.into_iter().zip(actuators.iter()) {
                    match slot.link {
                        Some(link) => {
                            if !link.is_adjustable() {
                                return Err(GeometryError::NotAdjustable);
                            }
                            links.push(link);
                            min_corr.push(slot.min_corr);
                            max_corr.push(slot.max_corr);
                        }
                        None => {
                            links.push(act.clone());
                            min_corr.push(0.0);
                            max_corr.push(0.0);
                        }
                    }
                }
                (links, min_corr, max_corr, true)
            }
        };

        let act_weights = phys_mult(kind, &join(&actuators, &fixed));
        let enc_weights = phys_mult(kind, &join(&enc_links, &fixed));
        let fixed_weights = if fixed.is_empty() {
            vec![]
        } else {
            phys_mult(kind, &fixed.iter().collect::<Vec<_>>())
        };

        Ok(MirrorModel {
            name: name.into(),
            kind,
            actuators,
            fixed,
            encoders: enc_links,
            has_encoders,
            min_corr,
            max_corr,
            fixed_axes,
            act_weights,
            enc_weights,
            fixed_weights,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MirrorKind {
        self.kind
    }

    pub fn actuators(&self) -> &[Link] {
        &self.actuators
    }

    pub fn encoders(&self) -> &[Link] {
        &self.encoders
    }

    pub fn fixed_links(&self) -> &[Link] {
        &self.fixed
    }

    pub fn has_encoders(&self) -> bool {
        self.has_encoders
    }

    /// Minimum encoder error worth correcting, in steps, one per actuator.
    pub fn min_corr(&self) -> &[f64] {
        &self.min_corr
    }

    /// Maximum correctable encoder error, in steps, one per actuator.
    pub fn max_corr(&self) -> &[f64] {
        &self.max_corr
    }

    /// Number of freely adjustable orientation axes. rotZ is never counted
    /// even when it is technically unconstrained, so the maximum is 5.
    pub fn num_adj_orient(&self) -> usize {
        (6 - self.fixed_axes.len()).min(5)
    }

    /// Index of the first actuator whose commanded mount value lies outside
    /// its allowed range, if any. Conversions are total; this is the range
    /// gate for callers about to command a move.
    pub fn first_mount_out_of_range(&self, mounts: &[f64]) -> Option<usize> {
        self.actuators
            .iter()
            .zip(mounts.iter())
            .position(|(link, mount)| !adj(link).mount_in_range(*mount))
    }

    /// Compute actuator mount lengths from a user orientation of 0, 1, 3,
    /// 5 or 6 axes (missing axes zero). With `adjust` the constrained axes
    /// are solved so that no fixed link stretches; the returned orientation
    /// is the one the mirror will actually take.
    pub fn actuator_mount_from_orient(
        &self,
        user_orient: &[f64],
        adjust: bool,
    ) -> Result<(Vec<f64>, Orientation), MirrorError> {
        self.mount_from_orient(user_orient, &self.actuators, adjust)
    }

    /// Compute encoder-basis mount lengths from a user orientation.
    pub fn encoder_mount_from_orient(
        &self,
        user_orient: &[f64],
        adjust: bool,
    ) -> Result<(Vec<f64>, Orientation), MirrorError> {
        self.mount_from_orient(user_orient, &self.encoders, adjust)
    }

    /// Compute mirror orientation from actuator mount lengths.
    pub fn orient_from_actuator_mount(
        &self,
        mount: &[f64],
        init_orient: &Orientation,
    ) -> Result<Orientation, MirrorError> {
        if mount.len() != self.actuators.len() {
            return Err(MirrorError::BadMountLen {
                expected: self.actuators.len(),
                got: mount.len(),
            });
        }
        self.orient_from_mount(mount, &self.actuators, &self.act_weights, init_orient)
    }

    /// Compute mirror orientation from encoder mount lengths.
    pub fn orient_from_encoder_mount(
        &self,
        mount: &[f64],
        init_orient: &Orientation,
    ) -> Result<Orientation, MirrorError> {
        if mount.len() != self.encoders.len() {
            return Err(MirrorError::BadMountLen {
                expected: self.encoders.len(),
                got: mount.len(),
            });
        }
        self.orient_from_mount(mount, &self.encoders, &self.enc_weights, init_orient)
    }

    /// Physical lengths of the given links at an orientation. Fixed links
    /// may report an unobtainable nonzero length; the fits rely on that.
    pub fn phys_from_orient(&self, orient: &Orientation, links: &[&Link]) -> Vec<f64> {
        phys_from_orient(self.kind, orient, links)
    }

    /// Solve the constrained axes of a partially specified orientation so
    /// that every fixed link keeps zero physical length. Axes that cannot
    /// be controlled come back at their constrained values (nearly 0 for a
    /// typical mirror).
    pub fn full_orient(&self, orient: [f64; 6]) -> Result<Orientation, FitError> {
        if self.fixed_axes.is_empty() {
            return Ok(Orientation::from_array(orient));
        }
        let links: Vec<&Link> = self.fixed.iter().collect();
        let objective = |params: &[f64]| {
            let mut full = orient;
            for (slot, &axis) in self.fixed_axes.iter().enumerate() {
                full[axis] = params[slot];
            }
            let phys = phys_from_orient(self.kind, &Orientation::from_array(full), &links);
            phys.iter()
                .zip(self.fixed_weights.iter())
                .map(|(p, w)| w * p * p)
                .sum()
        };
        let start = vec![0.0; self.fixed_axes.len()];
        let steps: Vec<f64> = self.fixed_axes.iter().map(|&a| FIT_STEP[a]).collect();
        let min = powell(objective, &start, &steps, FIT_TOL, MAX_FIT_ITER)?;
        let mut full = orient;
        for (slot, &axis) in self.fixed_axes.iter().enumerate() {
            full[axis] = min.x[slot];
        }
        Ok(Orientation::from_array(full))
    }

    fn mount_from_orient(
        &self,
        user_orient: &[f64],
        links: &[Link],
        adjust: bool,
    ) -> Result<(Vec<f64>, Orientation), MirrorError> {
        if !matches!(user_orient.len(), 0 | 1 | 3 | 5 | 6) {
            return Err(MirrorError::BadOrientationLen(user_orient.len()));
        }
        let mut arr = [0.0; 6];
        arr[..user_orient.len()].copy_from_slice(user_orient);
        let orient = if adjust {
            self.full_orient(arr)?
        } else {
            Orientation::from_array(arr)
        };
        let refs: Vec<&Link> = links.iter().collect();
        let phys = phys_from_orient(self.kind, &orient, &refs);
        let mounts = links
            .iter()
            .zip(phys.iter())
            .map(|(link, p)| adj(link).mount_from_phys(*p))
            .collect();
        Ok((mounts, orient))
    }

    fn orient_from_mount(
        &self,
        mount: &[f64],
        links: &[Link],
        weights: &[f64],
        init_orient: &Orientation,
    ) -> Result<Orientation, MirrorError> {
        let phys: Vec<f64> = links
            .iter()
            .zip(mount.iter())
            .map(|(link, m)| adj(link).phys_from_mount(*m))
            .collect();
        self.orient_from_phys(&phys, links, weights, init_orient)
    }

    /// Fit the 6-axis orientation whose forward map matches the given
    /// physical lengths, with the fixed links forced toward zero stretch.
    fn orient_from_phys(
        &self,
        phys: &[f64],
        links: &[Link],
        weights: &[f64],
        init_orient: &Orientation,
    ) -> Result<Orientation, MirrorError> {
        let full_links: Vec<&Link> = links.iter().chain(self.fixed.iter()).collect();
        let given: Vec<f64> = phys
            .iter()
            .copied()
            .chain(std::iter::repeat(0.0).take(self.fixed.len()))
            .collect();
        let init_full = self.full_orient(init_orient.as_array())?;

        let objective = |params: &[f64]| {
            let mut arr = [0.0; 6];
            arr.copy_from_slice(params);
            let trial = phys_from_orient(self.kind, &Orientation::from_array(arr), &full_links);
            trial
                .iter()
                .zip(given.iter())
                .zip(weights.iter())
                .map(|((t, g), w)| w * (t - g) * (t - g))
                .sum()
        };
        let min = powell(
            objective,
            &init_full.as_array(),
            &FIT_STEP,
            FIT_TOL,
            MAX_FIT_ITER,
        )?;
        let mut arr = [0.0; 6];
        arr.copy_from_slice(&min.x);
        Ok(Orientation::from_array(arr))
    }
}

/// Mount conversions require adjustability, guaranteed at construction.
fn adj(link: &Link) -> &Adjust {
    match link.adjust() {
        Some(a) => a,
        None => unreachable!("adjustable by construction"),
    }
}

fn join<'a>(a: &'a [Link], b: &'a [Link]) -> Vec<&'a Link> {
    a.iter().chain(b.iter()).collect()
}

/// Rotation matrix and offset vector that carry cartesian points on the
/// mirror from their zero-orientation location to the given orientation:
/// `R = Ry(tiltY) * Rx(tiltX) * Rz(rotZ)`, `T = (transX, transY, piston)`.
fn rot_trans_mats(orient: &Orientation) -> (Matrix3<f64>, Vector3<f64>) {
    let (sin_x, cos_x) = orient.tilt_x.sin_cos();
    let (sin_y, cos_y) = orient.tilt_y.sin_cos();
    let (sin_z, cos_z) = orient.rot_z.sin_cos();

    let rot_x = Matrix3::new(
        1.0, 0.0, 0.0, //
        0.0, cos_x, -sin_x, //
        0.0, sin_x, cos_x,
    );
    let rot_y = Matrix3::new(
        cos_y, 0.0, sin_y, //
        0.0, 1.0, 0.0, //
        -sin_y, 0.0, cos_y,
    );
    let rot_z = Matrix3::new(
        cos_z, -sin_z, 0.0, //
        sin_z, cos_z, 0.0, //
        0.0, 0.0, 1.0,
    );

    let rot = rot_y * rot_x * rot_z;
    let offset = Vector3::new(orient.trans_x, orient.trans_y, orient.piston);
    (rot, offset)
}

/// Matrix of a rotation by `pol_ang` about the horizontal line in the x-y
/// plane at azimuth `eq_ang`; the plane of rotation contains that line and
/// the z axis.
fn rot_eq_pol_mat(eq_ang: f64, pol_ang: f64) -> Matrix3<f64> {
    let (sin_eq, cos_eq) = eq_ang.sin_cos();
    let (sin_pol, cos_pol) = pol_ang.sin_cos();
    Matrix3::new(
        sin_eq * sin_eq + cos_eq * cos_eq * cos_pol,
        -sin_eq * cos_eq * (1.0 - cos_pol),
        cos_eq * sin_pol,
        //
        -sin_eq * cos_eq * (1.0 - cos_pol),
        cos_eq * cos_eq + sin_eq * sin_eq * cos_pol,
        sin_eq * sin_pol,
        //
        -cos_eq * sin_pol,
        -sin_eq * sin_pol,
        cos_pol,
    )
}

fn phys_from_orient(kind: MirrorKind, orient: &Orientation, links: &[&Link]) -> Vec<f64> {
    let (rot, offset) = rot_trans_mats(orient);
    match kind {
        MirrorKind::Direct => links
            .iter()
            .map(|link| link.phys_from_mir_pos(&(rot * link.mir_pos + offset)))
            .collect(),
        MirrorKind::TipTrans {
            ctr_mir_z,
            ctr_base_z,
        } => {
            let base_gimb = Vector3::new(0.0, 0.0, ctr_base_z);
            // Moved position of the mirror gimbal, relative to the base gimbal.
            let des_mir_gimb = rot * Vector3::new(0.0, 0.0, ctr_mir_z) + offset - base_gimb;
            let mut eq_ang = des_mir_gimb.y.atan2(des_mir_gimb.x);
            if eq_ang < 0.0 {
                // atan2 spans -pi..pi; spherical convention wants 0..2pi
                eq_ang += 2.0 * PI;
            }
            let pol_ang = (des_mir_gimb.z / des_mir_gimb.norm()).clamp(-1.0, 1.0).acos();
            let eq_pol = rot_eq_pol_mat(eq_ang, pol_ang);

            links
                .iter()
                .enumerate()
                .map(|(ind, link)| {
                    let des_mir_pos = if ind == 3 || ind == 4 {
                        // Transverse actuators rotate about the base gimbal.
                        eq_pol * (link.mir_pos - base_gimb) + base_gimb
                    } else {
                        rot * link.mir_pos + offset
                    };
                    link.phys_from_mir_pos(&des_mir_pos)
                })
                .collect()
        }
    }
}

fn phys_mult(kind: MirrorKind, links: &[&Link]) -> Vec<f64> {
    let mut max_err_sq = vec![0.0; links.len()];
    for axis in 0..6 {
        let mut arr = [0.0; 6];
        arr[axis] = WEIGHT_PERTURB[axis];
        let phys = phys_from_orient(kind, &Orientation::from_array(arr), links);
        for (acc, p) in max_err_sq.iter_mut().zip(phys.iter()) {
            *acc += p * p;
        }
    }
    max_err_sq.iter().map(|m| 1.0 / m).collect()
}
