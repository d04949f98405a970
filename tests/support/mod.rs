//! Shared helpers for the integration tests.

pub mod fake_galil;

use mirror_ctrl::galil::StatusMsg;
use mirror_ctrl::mirror::{EncoderSlot, Link, MirrorModel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

/// Rebuild a mirror with its actuator pivots independently offset by
/// uniform random amounts up to `scale_mm`, so that the model disagrees
/// with the "true" geometry.
pub fn perturbed(model: &MirrorModel, seed: u64, scale_mm: f64) -> MirrorModel {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut offset = |scale: f64| rng.gen_range(-scale..scale);
    let actuators: Vec<Link> = model
        .actuators()
        .iter()
        .map(|act| {
            let base = act.base_pos
                + nalgebra_offset(offset(scale_mm), offset(scale_mm), offset(scale_mm));
            let mir = act.mir_pos
                + nalgebra_offset(offset(scale_mm), offset(scale_mm), offset(scale_mm));
            act.with_pivots(base, mir)
        })
        .collect();
    rebuild(model, actuators)
}

fn nalgebra_offset(x: f64, y: f64, z: f64) -> nalgebra::Vector3<f64> {
    nalgebra::Vector3::new(x, y, z)
}

fn rebuild(model: &MirrorModel, actuators: Vec<Link>) -> MirrorModel {
    let slots = if model.has_encoders() {
        Some(
            model
                .encoders()
                .iter()
                .zip(model.min_corr().iter().zip(model.max_corr().iter()))
                .map(|(enc, (min, max))| EncoderSlot {
                    link: Some(enc.clone()),
                    min_corr: *min,
                    max_corr: *max,
                })
                .collect(),
        )
    } else {
        None
    };
    MirrorModel::new(
        model.name(),
        model.kind(),
        actuators,
        model.fixed_links().to_vec(),
        slots,
    )
    .expect("perturbed geometry stays valid")
}

/// Drain every telemetry message currently buffered on the receiver.
pub fn drain(rx: &mut broadcast::Receiver<StatusMsg>) -> Vec<StatusMsg> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Last published value for `keyword=...`, if any.
pub fn last_value(msgs: &[StatusMsg], keyword: &str) -> Option<String> {
    let prefix = format!("{keyword}=");
    msgs.iter()
        .rev()
        .find_map(|m| m.text.strip_prefix(&prefix).map(str::to_string))
}

pub fn parse_floats(s: &str) -> Vec<f64> {
    s.split(',')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect()
}

/// Extract the per-axis targets of every `XQ #MOVE` received by the fake,
/// from the recorded statement stream.
pub fn move_targets(received: &[String], n_act: usize) -> Vec<Vec<f64>> {
    let mut targets = Vec::new();
    for (i, stmt) in received.iter().enumerate() {
        if stmt.replace(' ', "") != "XQ#MOVE" {
            continue;
        }
        let start = i.saturating_sub(n_act);
        let values: Vec<f64> = received[start..i]
            .iter()
            .filter_map(|s| {
                let (_, v) = s.split_once('=')?;
                v.trim().parse::<f64>().ok()
            })
            .collect();
        targets.push(values);
    }
    targets
}
