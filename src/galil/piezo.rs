//! Mirror-variant hooks for the device session.
//!
//! The generic move path knows nothing about piezos; the piezo-equipped
//! secondary installs `PiezoHooks`, which intercepts its extra reply keys
//! and appends a fine-move device command after the coarse move converges.

use super::command::AXIS_NAMES;
use super::status::{num_str, GalilStatus, StatusMsg};

pub trait GalilHooks: Send {
    /// Try to consume a reply key before generic handling. Returns the
    /// telemetry lines to publish, or `None` if the key is not handled.
    fn act_on_key(
        &mut self,
        key: &str,
        values: &[f64],
        status: &mut GalilStatus,
    ) -> Option<Vec<StatusMsg>>;

    /// Device command to run once the coarse move has converged, if any.
    fn post_move_cmd(&self, status: &GalilStatus) -> Option<String>;

    /// Reply keys expected from the post-move command; missing ones are
    /// reported as warnings.
    fn post_move_expected_keys(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Default hooks: no variant-specific behavior.
pub struct NoHooks;

impl GalilHooks for NoHooks {
    fn act_on_key(&mut self, _: &str, _: &[f64], _: &mut GalilStatus) -> Option<Vec<StatusMsg>> {
        None
    }

    fn post_move_cmd(&self, _: &GalilStatus) -> Option<String> {
        None
    }
}

/// Hooks for the 2.5m secondary: three piezo actuators on axes A-C make a
/// small fast correction after the coarse actuator move. LCSTOP must be 1
/// in the controller so it does not also correct on its own.
#[derive(Default)]
pub struct PiezoHooks;

impl GalilHooks for PiezoHooks {
    fn act_on_key(
        &mut self,
        key: &str,
        values: &[f64],
        status: &mut GalilStatus,
    ) -> Option<Vec<StatusMsg>> {
        let first = values.first().copied().unwrap_or(f64::NAN);
        match key {
            // From XQ#SHOWPAR: "min, max piezo position (microsteps)" comes
            // through the pairwise key path.
            "min" => Some(vec![StatusMsg::info(format!("piezoMinPos={}", num_str(first)))]),
            "max piezo position (microsteps)" => {
                Some(vec![StatusMsg::info(format!("piezoMaxPos={}", num_str(first)))])
            }
            "number of steps of piezo position" => {
                Some(vec![StatusMsg::info(format!("piezoNSteps={}", num_str(first)))])
            }
            "resolution (microsteps/piezo ctrl bit)" => Some(vec![StatusMsg::info(format!(
                "piezoResolution={}",
                num_str(first)
            ))]),
            "piezo corrections (microsteps)" => {
                for (slot, v) in status.piezo_corr.iter_mut().zip(values.iter()) {
                    *slot = *v;
                }
                Some(vec![StatusMsg::info(status.format_key("piezoCorr"))])
            }
            "piezo status word" => {
                status.piezo_status = first;
                Some(vec![StatusMsg::info(status.format_key("piezoStatus"))])
            }
            _ => None,
        }
    }

    fn post_move_cmd(&self, status: &GalilStatus) -> Option<String> {
        // Signed residual of the three axial actuators only.
        let mut parts: Vec<String> = Vec::with_capacity(4);
        for i in 0..3 {
            let err = status.model_mount[i] - status.act_mount[i];
            parts.push(format!("LDESPOS{}={:.0}", AXIS_NAMES[i], err));
        }
        parts.push("XQ #LMOVE".to_string());
        Some(parts.join("; "))
    }

    fn post_move_expected_keys(&self) -> &'static [&'static str] {
        &[
            "commanded position",
            "actual position",
            "status word",
            "piezo status word",
            "piezo corrections (microsteps)",
        ]
    }
}
