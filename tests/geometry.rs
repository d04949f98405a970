//! Round-trip and constraint invariants of the mirror geometry, across
//! the production presets.

use mirror_ctrl::mirror::{presets, Link, MirrorModel, Orientation};
use mirror_ctrl::units::RAD_PER_ARCSEC;

const ARCSEC: f64 = RAD_PER_ARCSEC;
/// 0.1 um piston/translation agreement.
const DIST_TOL_MM: f64 = 1e-4;
/// 0.01 arcsec tilt agreement.
const ANG_TOL_RAD: f64 = 0.01 * RAD_PER_ARCSEC;

/// Orientation -> mount -> orientation -> mount, checking both round
/// trips: adjustable axes to 0.1 um / 0.01 arcsec, mounts to
/// `mount_tol` steps.
fn check_round_trip(mirror: &MirrorModel, user: &[f64], mount_tol: f64) {
    let (mount, adj) = mirror
        .actuator_mount_from_orient(user, true)
        .expect("forward mapping");
    let fitted = mirror
        .orient_from_actuator_mount(&mount, &adj)
        .expect("inverse mapping");

    let adj_arr = adj.as_array();
    let fit_arr = fitted.as_array();
    for axis in 0..mirror.num_adj_orient() {
        let tol = if matches!(axis, 1 | 2 | 5) {
            ANG_TOL_RAD
        } else {
            DIST_TOL_MM
        };
        let err = (adj_arr[axis] - fit_arr[axis]).abs();
        assert!(
            err < tol,
            "{}: axis {axis} round-trip error {err:e} exceeds {tol:e} for {user:?}",
            mirror.name()
        );
    }

    let (mount2, _) = mirror
        .actuator_mount_from_orient(&fit_arr, true)
        .expect("second forward mapping");
    for (i, (a, b)) in mount.iter().zip(mount2.iter()).enumerate() {
        let err = (a - b).abs();
        assert!(
            err < mount_tol,
            "{}: actuator {i} mount round-trip error {err} exceeds {mount_tol} for {user:?}",
            mirror.name()
        );
    }
}

/// Small orientations within the common operating envelope (50 um, 3
/// arcsec) for a mirror with `n_adj` adjustable axes.
fn small_orients(n_adj: usize) -> Vec<Vec<f64>> {
    let mut cases = vec![
        vec![0.03],
        vec![0.0, 3.0 * ARCSEC, 0.0],
        vec![0.0, 0.0, -2.0 * ARCSEC],
        vec![-0.02, 1.5 * ARCSEC, 2.5 * ARCSEC],
    ];
    if n_adj >= 5 {
        cases.push(vec![0.01, 1.0 * ARCSEC, -1.0 * ARCSEC, 0.05, -0.05]);
    }
    cases
}

/// Larger per-mirror envelopes, up to 25 mm and 2 degrees.
fn large_orients(n_adj: usize) -> Vec<Vec<f64>> {
    let two_deg = 7200.0 * ARCSEC;
    let mut cases = vec![
        vec![5.0],
        vec![25.0],
        vec![0.0, two_deg / 4.0, 0.0],
        vec![0.0, 0.0, two_deg],
        vec![2.0, two_deg / 8.0, -two_deg / 8.0],
    ];
    if n_adj >= 5 {
        cases.push(vec![1.0, 0.0, 0.0, 5.0, -5.0]);
    }
    cases
}

#[test]
fn round_trip_sec35m() {
    let mirror = presets::sec35m();
    for user in small_orients(5).into_iter().chain(large_orients(5)) {
        check_round_trip(&mirror, &user, 0.05);
    }
}

#[test]
fn round_trip_sec25m() {
    let mirror = presets::sec25m();
    for user in small_orients(5).into_iter().chain(large_orients(5)) {
        check_round_trip(&mirror, &user, 0.05);
    }
}

#[test]
fn round_trip_tert35m() {
    let mirror = presets::tert35m();
    for user in small_orients(3).into_iter().chain(large_orients(3)) {
        check_round_trip(&mirror, &user, 0.05);
    }
}

#[test]
fn round_trip_prim25m() {
    // The primary's transverse supports are modeled with near-infinite
    // rods; cancellation in the length computation limits the attainable
    // mount precision, so the bound is looser here.
    let mirror = presets::prim25m();
    for user in small_orients(5).into_iter().chain(large_orients(5)) {
        check_round_trip(&mirror, &user, 0.5);
    }
}

#[test]
fn round_trip_from_zero_guess() {
    // A cold fit with no initial guess must still land on the commanded
    // orientation for moderate moves.
    let mirror = presets::sec35m();
    let (mount, adj) = mirror
        .actuator_mount_from_orient(&[0.5, 10.0 * ARCSEC, -5.0 * ARCSEC], true)
        .unwrap();
    let fitted = mirror
        .orient_from_actuator_mount(&mount, &Orientation::ZERO)
        .unwrap();
    let adj_arr = adj.as_array();
    let fit_arr = fitted.as_array();
    for axis in 0..mirror.num_adj_orient() {
        let tol = if matches!(axis, 1 | 2) { ANG_TOL_RAD } else { DIST_TOL_MM };
        assert!((adj_arr[axis] - fit_arr[axis]).abs() < tol);
    }
}

#[test]
fn encoder_round_trip_sec35m() {
    // Encoders sit at a different radius than the actuators; the encoder
    // basis must round-trip on its own.
    let mirror = presets::sec35m();
    let user = [0.02, 2.0 * ARCSEC, -1.0 * ARCSEC];
    let (enc_mount, adj) = mirror.encoder_mount_from_orient(&user, true).unwrap();
    let fitted = mirror.orient_from_encoder_mount(&enc_mount, &adj).unwrap();
    let adj_arr = adj.as_array();
    let fit_arr = fitted.as_array();
    for axis in 0..mirror.num_adj_orient() {
        let tol = if matches!(axis, 1 | 2) { ANG_TOL_RAD } else { DIST_TOL_MM };
        assert!((adj_arr[axis] - fit_arr[axis]).abs() < tol);
    }
}

#[test]
fn adjusted_and_unadjusted_mounts_agree_on_well_conditioned_mirrors() {
    // The fixed-link adjustment must stay below 0.5 um per actuator on
    // geometries whose fixed link is not near-collinear with an actuator.
    for mirror in [presets::sec35m(), presets::sec25m()] {
        for user in small_orients(5) {
            let (adjusted, _) = mirror.actuator_mount_from_orient(&user, true).unwrap();
            let (unadjusted, _) = mirror.actuator_mount_from_orient(&user, false).unwrap();
            for ((a, b), link) in adjusted
                .iter()
                .zip(unadjusted.iter())
                .zip(mirror.actuators().iter())
            {
                let scale = link.adjust().expect("actuators are adjustable").scale;
                let tol_steps = 0.5 * scale;
                assert!(
                    (a - b).abs() <= tol_steps,
                    "{}: adjustment {} steps exceeds {tol_steps} for {user:?}",
                    mirror.name(),
                    (a - b).abs()
                );
            }
        }
    }
}

#[test]
fn fixed_links_do_not_stretch_at_adjusted_orientation() {
    for mirror in [presets::sec35m(), presets::sec25m(), presets::tert35m()] {
        let n_adj = mirror.num_adj_orient();
        for user in small_orients(n_adj) {
            let (_, adj) = mirror.actuator_mount_from_orient(&user, true).unwrap();
            let fixed: Vec<&Link> = mirror.fixed_links().iter().collect();
            let phys = mirror.phys_from_orient(&adj, &fixed);
            for (i, p) in phys.iter().enumerate() {
                assert!(
                    p.abs() < 1e-4,
                    "{}: fixed link {i} stretches {p:e} mm at {user:?}",
                    mirror.name()
                );
            }
        }
    }
}

#[test]
fn legacy_tert_preset_constructs() {
    let mirror = presets::tert35m_old();
    assert_eq!(mirror.actuators().len(), 6);
    assert!(mirror.fixed_links().is_empty());
    // The ghost links make it behave like an unconstrained 6-actuator
    // mirror; a modest piston still round-trips on the real axes.
    let (mount, adj) = mirror.actuator_mount_from_orient(&[0.1], true).unwrap();
    let fitted = mirror.orient_from_actuator_mount(&mount, &adj).unwrap();
    assert!((fitted.piston - adj.piston).abs() < 1e-3);
}
