//! Typed cache of the latest known controller and mirror state, with the
//! keyword formatting used on the telemetry channel.

use std::fmt;
use std::time::Instant;

use crate::units::orient_to_um_arcsec;

/// Severity of a telemetry line, mapped to the user protocol's message
/// codes by the command actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgLevel {
    Info,
    Warn,
    /// Progress notes, e.g. "Homing Actuators: A, B, C".
    Notice,
}

/// One keyword-value (or free-text) line on the telemetry channel.
#[derive(Debug, Clone)]
pub struct StatusMsg {
    pub level: MsgLevel,
    pub text: String,
}

impl StatusMsg {
    pub fn info(text: impl Into<String>) -> Self {
        StatusMsg {
            level: MsgLevel::Info,
            text: text.into(),
        }
    }

    pub fn warn(text: impl Into<String>) -> Self {
        StatusMsg {
            level: MsgLevel::Warn,
            text: text.into(),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        StatusMsg {
            level: MsgLevel::Notice,
            text: text.into(),
        }
    }
}

/// Condensed device phase reported in the `state` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Moving,
    Done,
    Homing,
    Failed,
    NotHomed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Moving => "Moving",
            Phase::Done => "Done",
            Phase::Homing => "Homing",
            Phase::Failed => "Failed",
            Phase::NotHomed => "NotHomed",
        };
        f.write_str(name)
    }
}

/// Monotonic elapsed-seconds timer; reads NaN until started.
#[derive(Debug, Clone, Copy, Default)]
pub struct GalilTimer {
    started: Option<Instant>,
}

impl GalilTimer {
    pub fn reset(&mut self) {
        self.started = None;
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn elapsed(&self) -> f64 {
        match self.started {
            Some(t) => t.elapsed().as_secs_f64(),
            None => f64::NAN,
        }
    }
}

pub fn float_cast(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else {
        format!("{v:.2}")
    }
}

pub fn mount_cast(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| float_cast(*v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Orientations are published in user units (um and arcsec).
pub fn orient_cast(orient: &[f64; 6]) -> String {
    orient_to_um_arcsec(orient)
        .iter()
        .map(|v| float_cast(*v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn int_or_nan(v: f64) -> String {
    if v.is_finite() {
        format!("{}", v as i64)
    } else {
        "nan".to_string()
    }
}

pub fn status_cast(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| int_or_nan(*v))
        .collect::<Vec<_>>()
        .join(",")
}

fn flag_cast(values: &[Option<bool>]) -> String {
    values
        .iter()
        .map(|v| match v {
            None => "?".to_string(),
            Some(true) => "1".to_string(),
            Some(false) => "0".to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Format a number for informational parameter output, dropping a
/// trailing ".0" on integral values.
pub fn num_str(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Status cache for one Galil device session. Numeric fields start as NaN
/// (or 0 for accumulated offsets); flag arrays start unknown. Mutated only
/// by the session's reply parser and move controller.
#[derive(Debug, Clone)]
pub struct GalilStatus {
    pub n_act: usize,
    pub max_duration: f64,
    pub duration: GalilTimer,
    /// Actuator mount back-computed from the measured orientation.
    pub act_mount: Vec<f64>,
    /// Expected encoder reading at the desired orientation.
    pub des_enc_mount: Vec<f64>,
    /// Raw encoder mount as last read.
    pub enc_mount: Vec<f64>,
    /// Mount naively computed from the desired orientation.
    pub model_mount: Vec<f64>,
    /// Mount actually commanded, including the learned offset.
    pub cmd_mount: Vec<f64>,
    /// Residual of the most recent move iteration.
    pub mount_err: Vec<f64>,
    /// Sticky learned offset applied to future moves.
    pub net_mount_offset: Vec<f64>,
    /// Orientation back-computed from the latest encoder reading.
    pub orient: [f64; 6],
    /// Orientation back-computed from the last commanded mount.
    pub mount_orient: [f64; 6],
    /// Requested orientation after constraint resolution.
    pub des_orient: [f64; 6],
    pub des_orient_age: GalilTimer,
    pub iter: usize,
    pub max_iter: usize,
    /// Opaque per-actuator status words.
    pub status: Vec<f64>,
    pub moving: bool,
    pub homing: Vec<Option<bool>>,
    pub axis_homed: Vec<Option<bool>>,
    /// Piezo fields, meaningful only on the piezo-equipped secondary.
    pub piezo_corr: [f64; 3],
    pub piezo_status: f64,
}

impl GalilStatus {
    pub fn new(n_act: usize, max_iter: usize) -> Self {
        GalilStatus {
            n_act,
            max_duration: 0.0,
            duration: GalilTimer::default(),
            act_mount: vec![f64::NAN; n_act],
            des_enc_mount: vec![f64::NAN; n_act],
            enc_mount: vec![f64::NAN; n_act],
            model_mount: vec![f64::NAN; n_act],
            cmd_mount: vec![f64::NAN; n_act],
            mount_err: vec![0.0; n_act],
            net_mount_offset: vec![0.0; n_act],
            orient: [f64::NAN; 6],
            mount_orient: [f64::NAN; 6],
            des_orient: [f64::NAN; 6],
            des_orient_age: GalilTimer::default(),
            iter: 0,
            max_iter,
            status: vec![f64::NAN; n_act],
            moving: false,
            homing: vec![None; n_act],
            axis_homed: vec![None; n_act],
            piezo_corr: [f64::NAN; 3],
            piezo_status: f64::NAN,
        }
    }

    /// Reset per-command motion bookkeeping; learned offsets and the last
    /// known orientation survive.
    pub fn clear_motion(&mut self) {
        self.iter = 0;
        self.homing = vec![Some(false); self.n_act];
        self.moving = false;
        self.max_duration = 0.0;
        self.duration.reset();
    }

    pub fn all_homed(&self) -> bool {
        self.axis_homed.iter().all(|h| *h == Some(true))
    }

    fn phase(&self, failed: bool) -> Phase {
        if self.homing.iter().any(|h| *h == Some(true)) {
            Phase::Homing
        } else if self.moving {
            Phase::Moving
        } else if self.axis_homed.iter().any(|h| *h == Some(false)) {
            Phase::NotHomed
        } else if failed {
            Phase::Failed
        } else {
            Phase::Done
        }
    }

    /// The condensed `state` keyword:
    /// `state=<phase>,<iter>,<maxIter>,<remaining>,<maxDuration>`.
    pub fn state_keyword(&self, failed: bool) -> String {
        let mut remaining = 0.0;
        if self.max_duration > 0.0 {
            let elapsed = self.duration.elapsed();
            if elapsed.is_finite() {
                remaining = self.max_duration - elapsed;
            }
        }
        format!(
            "state={},{},{},{},{}",
            self.phase(failed),
            self.iter,
            self.max_iter,
            float_cast(remaining),
            float_cast(self.max_duration),
        )
    }

    /// Format one cached keyword as `keyword=value`.
    pub fn format_key(&self, key: &str) -> String {
        let value = match key {
            "maxDuration" => float_cast(self.max_duration),
            "duration" => float_cast(self.duration.elapsed()),
            "actMount" => mount_cast(&self.act_mount),
            "desEncMount" => mount_cast(&self.des_enc_mount),
            "encMount" => mount_cast(&self.enc_mount),
            "modelMount" => mount_cast(&self.model_mount),
            "cmdMount" => mount_cast(&self.cmd_mount),
            "mountErr" => mount_cast(&self.mount_err),
            "netMountOffset" => mount_cast(&self.net_mount_offset),
            "orient" => orient_cast(&self.orient),
            "desOrient" => orient_cast(&self.des_orient),
            "mountOrient" => orient_cast(&self.mount_orient),
            "desOrientAge" => float_cast(self.des_orient_age.elapsed()),
            "iter" => self.iter.to_string(),
            "maxIter" => self.max_iter.to_string(),
            "status" => status_cast(&self.status),
            "homing" => flag_cast(&self.homing),
            "axisHomed" => flag_cast(&self.axis_homed),
            "piezoCorr" => mount_cast(&self.piezo_corr),
            "piezoStatus" => int_or_nan(self.piezo_status),
            other => {
                debug_assert!(false, "unknown status keyword {other}");
                String::new()
            }
        };
        format!("{key}={value}")
    }

    /// Format several cached keywords joined with `"; "`.
    pub fn format_keys(&self, keys: &[&str]) -> String {
        keys.iter()
            .map(|k| self.format_key(k))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_cast() {
        assert_eq!(float_cast(f64::NAN), "NaN");
        assert_eq!(float_cast(1.5), "1.50");
        assert_eq!(float_cast(-0.001), "-0.00");
    }

    #[test]
    fn test_int_or_nan() {
        assert_eq!(int_or_nan(8196.0), "8196");
        assert_eq!(int_or_nan(f64::NAN), "nan");
    }

    #[test]
    fn test_num_str() {
        assert_eq!(num_str(50.0), "50");
        assert_eq!(num_str(2.1), "2.1");
        assert_eq!(num_str(-6732.0), "-6732");
    }

    #[test]
    fn test_initial_keywords() {
        let status = GalilStatus::new(3, 5);
        assert_eq!(status.format_key("actMount"), "actMount=NaN,NaN,NaN");
        assert_eq!(status.format_key("netMountOffset"), "netMountOffset=0.00,0.00,0.00");
        assert_eq!(status.format_key("axisHomed"), "axisHomed=?,?,?");
        assert_eq!(status.format_key("iter"), "iter=0");
    }

    #[test]
    fn test_orient_cast_publishes_user_units() {
        let mut status = GalilStatus::new(3, 5);
        // 1 mm piston, 1 arcsec x tilt
        status.des_orient = [1.0, 4.84813681109536e-6, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(
            status.format_key("desOrient"),
            "desOrient=1000.00,1.00,0.00,0.00,0.00,0.00"
        );
    }

    #[test]
    fn test_state_keyword() {
        let mut status = GalilStatus::new(3, 5);
        status.axis_homed = vec![Some(true); 3];
        assert_eq!(status.state_keyword(false), "state=Done,0,5,0.00,0.00");
        status.moving = true;
        status.iter = 2;
        assert_eq!(status.state_keyword(false), "state=Moving,2,5,0.00,0.00");
        status.moving = false;
        status.axis_homed[1] = Some(false);
        assert!(status.state_keyword(false).starts_with("state=NotHomed"));
        status.axis_homed[1] = Some(true);
        assert!(status.state_keyword(true).starts_with("state=Failed"));
        status.homing[0] = Some(true);
        assert!(status.state_keyword(false).starts_with("state=Homing"));
    }

    #[test]
    fn test_phase_with_unknown_flags() {
        let status = GalilStatus::new(3, 5);
        // Unknown homed state does not report NotHomed.
        assert_eq!(status.state_keyword(false), "state=Done,0,5,0.00,0.00");
    }
}
