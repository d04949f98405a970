//! Concrete mirror geometries for the supported telescopes.
//!
//! Coordinate conventions: X = right, Y = up, Z = from the sky toward the
//! telescope, as seen standing behind the primary looking at the secondary.
//! All distances are in mm.

use nalgebra::{Matrix3, Vector3};

use super::{EncoderSlot, Link, MirrorKind, MirrorModel};
use crate::units::{MM_PER_INCH, RAD_PER_DEG};

/// Look up a mirror preset by its configuration name.
pub fn by_name(name: &str) -> Option<MirrorModel> {
    match name {
        "sec35m" => Some(sec35m()),
        "tert35m" => Some(tert35m()),
        "sec25m" => Some(sec25m()),
        "prim25m" => Some(prim25m()),
        "tert35m-old" => Some(tert35m_old()),
        _ => None,
    }
}

/// Names of all available presets.
pub const PRESET_NAMES: [&str; 5] = ["sec35m", "tert35m", "sec25m", "prim25m", "tert35m-old"];

/// Whether this preset's controller carries piezo fine-move actuators.
pub fn has_piezos(name: &str) -> bool {
    name == "sec25m"
}

fn vec3(x: f64, y: f64, z: f64) -> Vector3<f64> {
    Vector3::new(x, y, z)
}

fn built(model: Result<MirrorModel, super::GeometryError>) -> MirrorModel {
    match model {
        Ok(m) => m,
        // Preset tables are compile-time constants; a failure here is a
        // programming error, not a runtime condition.
        Err(e) => unreachable!("invalid mirror preset: {e}"),
    }
}

/// 3.5m secondary: three axial adjustable-base actuators (A-C), two
/// transverse (D-E), offset encoders, one anti-rotation fixed link.
///
/// Positions measured during the 2012 shutdown: actuator radius 9.08 in,
/// encoder radius 10.25 in; transverse encoders sit between the actuator
/// and the glass.
pub fn sec35m() -> MirrorModel {
    let act_rad = 9.08 * MM_PER_INCH;
    let enc_rad = 10.25 * MM_PER_INCH;

    let z_mir_ax = -152.806;
    let z_base_ax = -256.438;
    let z_mir_trans = -167.361;
    let z_base_trans = -192.710;
    let xy_mir_trans = 29.186;
    let xy_base_trans = 284.010;
    let z_enc_offset_trans = 0.90 * MM_PER_INCH;

    let min_mount = [-7_250_000.0, -7_250_000.0, -7_250_000.0, -95_000.0, -95_000.0];
    let max_mount = [7_250_000.0, 7_250_000.0, 7_250_000.0, 95_000.0, 95_000.0];
    let scale = [1259.843, 1259.843, 1259.843, 31.496, 31.496];

    let mut actuators = Vec::with_capacity(5);
    let mut encoders = Vec::with_capacity(5);

    let ang_deg = [-90.0 + 180.0, 30.0 + 180.0, 150.0 + 180.0];
    for (i, ang) in ang_deg.iter().enumerate() {
        let (sin_a, cos_a) = (ang * RAD_PER_DEG).sin_cos();
        let mir_act = vec3(cos_a * act_rad, sin_a * act_rad, z_mir_ax);
        let base_act = vec3(mir_act.x, mir_act.y, z_base_ax);
        let mir_enc = vec3(cos_a * enc_rad, sin_a * enc_rad, z_mir_ax);
        let base_enc = vec3(mir_enc.x, mir_enc.y, z_base_ax);
        actuators.push(Link::adj_base(
            base_act, mir_act, min_mount[i], max_mount[i], scale[i], 0.0,
        ));
        encoders.push(Link::adj_length(
            base_enc, mir_enc, min_mount[i], max_mount[i], scale[i], 0.0,
        ));
    }

    let mut mult = 1.0;
    for i in 3..5 {
        let mir_act = vec3(xy_mir_trans * mult, xy_mir_trans, z_mir_trans);
        let base_act = vec3(xy_base_trans * mult, xy_base_trans, z_base_trans);
        let mir_enc = vec3(mir_act.x, mir_act.y, z_mir_trans + z_enc_offset_trans);
        let base_enc = vec3(base_act.x, base_act.y, z_base_trans + z_enc_offset_trans);
        actuators.push(Link::adj_base(
            base_act, mir_act, min_mount[i], max_mount[i], scale[i], 0.0,
        ));
        encoders.push(Link::adj_length(
            base_enc, mir_enc, min_mount[i], max_mount[i], scale[i], 0.0,
        ));
        mult = -1.0;
    }

    // Anti-rotation link on the edge of the mirror opposite actuator A.
    let link_length = 12.36 * MM_PER_INCH;
    let mir_radius = 1000.0;
    let fixed = vec![Link::fixed(
        vec3(link_length, -mir_radius, z_mir_ax),
        vec3(0.0, -mir_radius, z_mir_ax),
    )];

    let max_corr = [1e6, 1e6, 1e6, 5000.0, 5000.0];
    let slots = encoders
        .into_iter()
        .zip(max_corr)
        .map(|(link, max_corr)| EncoderSlot {
            link: Some(link),
            min_corr: 50.0,
            max_corr,
        })
        .collect();

    built(MirrorModel::new(
        "3.5m Secondary",
        MirrorKind::Direct,
        actuators,
        fixed,
        Some(slots),
    ))
}

/// 3.5m tertiary: a flat mirror at 45 degrees with three axial actuators
/// and three short fixed links constraining both translations and rotation.
///
/// Actuator placements are defined in the plane of the mirror, then the
/// whole assembly is rotated -45 degrees about x so that z points toward
/// the instrument port.
pub fn tert35m() -> MirrorModel {
    let act_rad = 8.96 * MM_PER_INCH;
    let enc_rad = 10.69 * MM_PER_INCH;
    let z_mir = -0.875 * MM_PER_INCH;
    let z_base = -3.375 * MM_PER_INCH;

    let rot_ang = -45.0 * RAD_PER_DEG;
    let (sin_r, cos_r) = rot_ang.sin_cos();
    let to_port = Matrix3::new(
        1.0, 0.0, 0.0, //
        0.0, cos_r, -sin_r, //
        0.0, sin_r, cos_r,
    );

    let ang_deg = [-90.0, 30.0, 150.0];
    let mut actuators = Vec::with_capacity(3);
    let mut slots = Vec::with_capacity(3);
    for ang in ang_deg {
        let (sin_a, cos_a) = (ang * RAD_PER_DEG).sin_cos();
        let mir_act = to_port * vec3(cos_a * act_rad, sin_a * act_rad, z_mir);
        let base_act = to_port * vec3(cos_a * act_rad, sin_a * act_rad, z_base);
        let mir_enc = to_port * vec3(cos_a * enc_rad, sin_a * enc_rad, z_mir);
        let base_enc = to_port * vec3(cos_a * enc_rad, sin_a * enc_rad, z_base);
        actuators.push(Link::adj_length(
            base_act,
            mir_act,
            -7_250_000.0,
            7_250_000.0,
            1259.843,
            0.0,
        ));
        slots.push(EncoderSlot {
            link: Some(Link::adj_length(
                base_enc,
                mir_enc,
                -7_250_000.0,
                7_250_000.0,
                1259.843,
                0.0,
            )),
            min_corr: 50.0,
            max_corr: 1e6,
        });
    }

    // Fixed link ends from the support drawings (in-plane coordinates):
    // two transverse rods extending toward actuator A, one anti-rotation
    // rod along +x. The second rod's base hangs off actuator B's position.
    let mir_b = vec3(
        (30.0 * RAD_PER_DEG).cos() * act_rad,
        (30.0 * RAD_PER_DEG).sin() * act_rad,
        z_mir,
    );
    let mir_fix = [vec3(-203.2, 0.0, 0.0), vec3(203.2, 0.0, 0.0), vec3(0.0, 0.0, 0.0)];
    let base_fix = [
        vec3(-203.2, -281.47, 0.0),
        vec3(mir_b.x, -281.47, mir_b.z),
        vec3(281.47, 0.0, 0.0),
    ];

    let fixed = mir_fix
        .iter()
        .zip(base_fix.iter())
        .map(|(mir, base)| Link::fixed(to_port * base, to_port * mir))
        .collect();

    built(MirrorModel::new(
        "3.5m Tertiary",
        MirrorKind::Direct,
        actuators,
        fixed,
        Some(slots),
    ))
}

/// 2.5m (SDSS) secondary: the mirror rides a central linear bearing tipped
/// by two transverse actuators; three axial actuators set piston and tilt,
/// and piezos on A-C make the final fine move.
pub fn sec25m() -> MirrorModel {
    let z_enc_offset_trans = 0.90 * MM_PER_INCH;

    let min_mount = [-7_250_000.0, -7_250_000.0, -7_250_000.0, -18_000.0, -18_000.0];
    let max_mount = [7_250_000.0, 7_250_000.0, 7_250_000.0, 18_000.0, 18_000.0];
    let offset = [0.0, 0.0, 0.0, 1700.0, -1700.0];
    let scale = [1259.84, 1259.84, 1259.84, 31.496, 31.496];

    let mir_x = [293.81, -233.08, -60.73, 19.80, -19.80];
    let mir_y = [99.51, 204.69, -304.20, -19.80, -19.80];
    let mir_z = [-193.00, -193.00, -193.00, -263.80, -263.80];
    let base_x = [293.81, -233.08, -60.73, 56.57, -56.57];
    let base_y = [99.51, 204.69, -304.20, -56.57, -56.57];
    let base_z = [-280.00, -280.00, -280.00, -263.80, -263.80];

    let mut actuators = Vec::with_capacity(5);
    let mut slots = Vec::with_capacity(5);
    for i in 0..5 {
        let mir_act = vec3(mir_x[i], mir_y[i], mir_z[i]);
        let base_act = vec3(base_x[i], base_y[i], base_z[i]);
        actuators.push(Link::adj_base(
            base_act,
            mir_act,
            min_mount[i],
            max_mount[i],
            scale[i],
            offset[i],
        ));

        let enc = if i < 3 {
            // Axial encoders lead the actuators by about 2 inches along the
            // same radius.
            let radius = mir_act.xy().norm();
            let theta = mir_act.y.atan2(mir_act.x) + 2.0 * MM_PER_INCH / radius;
            let (sin_t, cos_t) = theta.sin_cos();
            Link::adj_length(
                vec3(radius * cos_t, radius * sin_t, base_act.z),
                vec3(radius * cos_t, radius * sin_t, mir_act.z),
                min_mount[i],
                max_mount[i],
                scale[i],
                offset[i],
            )
        } else {
            Link::adj_length(
                vec3(base_act.x, base_act.y, base_act.z + z_enc_offset_trans),
                vec3(mir_act.x, mir_act.y, mir_act.z + z_enc_offset_trans),
                min_mount[i],
                max_mount[i],
                scale[i],
                offset[i],
            )
        };
        slots.push(EncoderSlot {
            link: Some(enc),
            min_corr: 50.0,
            max_corr: 1e6,
        });
    }

    // Anti-rotation arm; z adopted from the axial actuator mirror plane.
    let fixed = vec![Link::fixed(
        vec3(13.125 * MM_PER_INCH, -17.296 * MM_PER_INCH, -193.0),
        vec3(0.0, -17.296 * MM_PER_INCH, -193.0),
    )];

    built(MirrorModel::new(
        "SDSS Secondary",
        MirrorKind::TipTrans {
            ctr_mir_z: -135.70,
            ctr_base_z: -178.40,
        },
        actuators,
        fixed,
        Some(slots),
    ))
}

/// 2.5m (SDSS) primary: six adjustable-length actuators, no encoders and
/// no fixed links. Without encoders a move never iterates.
pub fn prim25m() -> MirrorModel {
    let min_mount = [-120_000.0, -120_000.0, -120_000.0, -90_000.0, -50_000.0, -50_000.0];
    let max_mount = [120_000.0, 120_000.0, 120_000.0, 90_000.0, 50_000.0, 50_000.0];
    let offset = [11_300.0, -650.0, 5500.0, -1650.0, -6900.0, -6900.0];
    let scale = [15.696, 15.696, 15.696, 15.696, 33.22, 32.53];

    let mir_x = [0.0, -749.03, 749.03, 0.0, 0.0, 0.0];
    let mir_y = [864.90, -432.45, -432.45, -1305.0, -1277.0, 1277.0];
    let mir_z = [251.0, 251.0, 251.0, 238.0, 262.0, 262.0];
    let base_x = [0.0, -749.03, 749.03, 0.0, -698.0, -698.0];
    let base_y = [864.90, -432.45, -432.45, -9e9, -1277.0, 1277.0];
    let base_z = [9e9, 9e9, 9e9, 238.0, 262.0, 262.0];

    let actuators = (0..6)
        .map(|i| {
            Link::adj_length(
                vec3(base_x[i], base_y[i], base_z[i]),
                vec3(mir_x[i], mir_y[i], mir_z[i]),
                min_mount[i],
                max_mount[i],
                scale[i],
                offset[i],
            )
        })
        .collect();

    built(MirrorModel::new(
        "SDSS Primary",
        MirrorKind::Direct,
        actuators,
        vec![],
        None,
    ))
}

/// Legacy 3.5m tertiary model with old-style "infinite" ghost links D-F,
/// kept only to reproduce the old solver's behavior during coefficient
/// migrations. Not a production geometry.
pub fn tert35m_old() -> MirrorModel {
    let mir_x = [0.0, 257.673, -257.673, 0.0, 0.0, 298.0];
    let mir_y = [-226.105, 89.479, 89.479, 0.0, 0.0, 0.0];
    let mir_z = [194.674, -120.910, -120.910, 0.0, 0.0, 0.0];
    let base_x = [0.0, 257.673, -257.673, 1e9, -1e9, 298.0];
    let base_y = [-271.006, 44.578, 44.578, 7.07e8, 7.07e8, 7.07e8];
    let base_z = [149.773, -165.811, -165.811, -7.07e8, -7.07e8, -7.07e8];

    let mut actuators = Vec::with_capacity(6);
    let mut slots = Vec::with_capacity(6);
    for i in 0..6 {
        let base = vec3(base_x[i], base_y[i], base_z[i]);
        let mir = vec3(mir_x[i], mir_y[i], mir_z[i]);
        let (min_mount, max_mount) = if i < 3 {
            (-7_250_000.0, 7_250_000.0)
        } else {
            (f64::NEG_INFINITY, f64::INFINITY)
        };
        actuators.push(Link::adj_length(base, mir, min_mount, max_mount, 1259.843, 0.0));
        slots.push(EncoderSlot {
            link: Some(Link::adj_length(base, mir, min_mount, max_mount, 1259.843, 0.0)),
            min_corr: 50.0,
            max_corr: 1e6,
        });
    }

    built(MirrorModel::new(
        "3.5m Tertiary (legacy infinite links)",
        MirrorKind::Direct,
        actuators,
        vec![],
        Some(slots),
    ))
}
