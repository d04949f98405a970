//! User verbs and device command formatting.

/// Letters of the controller's axes, in actuator order.
pub const AXIS_NAMES: [char; 6] = ['A', 'B', 'C', 'D', 'E', 'F'];

/// Sentinel written for axes that must not change.
pub const MAX_INT: &str = "MAXINT";

/// Index of an axis letter A-F, if valid.
pub fn axis_index(name: char) -> Option<usize> {
    AXIS_NAMES
        .iter()
        .position(|c| *c == name.to_ascii_uppercase())
}

/// One user-level request to the mirror controller. Orientations are in
/// internal units (mm and radians), already converted at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum UserVerb {
    /// Drive the mirror to an orientation of 1-5 user axes.
    Move(Vec<f64>),
    /// Offset the measured orientation by a delta of 1-5 user axes.
    Offset(Vec<f64>),
    /// Home the given actuators; empty means all.
    Home(Vec<usize>),
    /// Halt all controller threads, then refresh status.
    Stop,
    /// Reset the controller to its power-on state.
    Reset,
    Status,
    ShowParams,
    /// Raw statement passed through to the controller.
    Raw(String),
}

impl UserVerb {
    pub fn name(&self) -> &'static str {
        match self {
            UserVerb::Move(_) => "move",
            UserVerb::Offset(_) => "offset",
            UserVerb::Home(_) => "home",
            UserVerb::Stop => "stop",
            UserVerb::Reset => "reset",
            UserVerb::Status => "status",
            UserVerb::ShowParams => "showparams",
            UserVerb::Raw(_) => "galil",
        }
    }

    /// Whether this verb force-kills whatever the session is doing.
    pub fn preempts(&self) -> bool {
        matches!(self, UserVerb::Stop | UserVerb::Reset)
    }
}

/// Format an axis-assignment command: `A=…; B=…; …; XQ #WORD`. Values are
/// rounded to integer steps; `None` (and missing trailing axes) become the
/// `MAXINT` do-not-change sentinel.
pub fn format_axis_command(values: &[Option<f64>], n_axes: usize, cmd: &str) -> String {
    debug_assert!(values.len() <= n_axes && n_axes <= AXIS_NAMES.len());
    let mut parts: Vec<String> = Vec::with_capacity(n_axes + 1);
    for (i, name) in AXIS_NAMES.iter().enumerate().take(n_axes) {
        match values.get(i).copied().flatten() {
            Some(v) => parts.push(format!("{}={:.0}", name, v)),
            None => parts.push(format!("{}={}", name, MAX_INT)),
        }
    }
    parts.push(cmd.to_string());
    parts.join("; ")
}

/// Normalize a raw passthrough statement so that exactly one `OK` comes
/// back: surrounding quotes are dropped, and unless the last statement is
/// an `XQ#…` program or an explicit `MG "OK"`, one is appended.
pub fn force_ok(raw: &str) -> String {
    let mut cmd = raw.trim();
    if cmd.len() >= 2 {
        let first = cmd.chars().next();
        let last = cmd.chars().last();
        if matches!(first, Some('"') | Some('\'')) && first == last {
            cmd = &cmd[1..cmd.len() - 1];
        }
    }
    let cmd = cmd.strip_suffix(';').unwrap_or(cmd);
    let last_stmt: String = cmd
        .rsplit(';')
        .next()
        .unwrap_or("")
        .replace(' ', "");
    if last_stmt.starts_with("XQ#") || last_stmt == "MG\"OK\"" {
        cmd.to_string()
    } else {
        format!("{cmd}; MG \"OK\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_index() {
        assert_eq!(axis_index('A'), Some(0));
        assert_eq!(axis_index('f'), Some(5));
        assert_eq!(axis_index('G'), None);
    }

    #[test]
    fn test_format_move_command() {
        let cmd = format_axis_command(
            &[Some(126_000.4), Some(-3.6), Some(0.0)],
            5,
            "XQ #MOVE",
        );
        assert_eq!(cmd, "A=126000; B=-4; C=0; D=MAXINT; E=MAXINT; XQ #MOVE");
    }

    #[test]
    fn test_format_home_command() {
        let cmd = format_axis_command(&[Some(1.0), None, Some(1.0)], 3, "XQ #HOME");
        assert_eq!(cmd, "A=1; B=MAXINT; C=1; XQ #HOME");
    }

    #[test]
    fn test_force_ok_appends() {
        assert_eq!(force_ok("MG TIME"), "MG TIME; MG \"OK\"");
        assert_eq!(force_ok("A=100;"), "A=100; MG \"OK\"");
    }

    #[test]
    fn test_force_ok_leaves_programs_alone() {
        assert_eq!(force_ok("XQ#STATUS"), "XQ#STATUS");
        assert_eq!(force_ok("A=100; XQ #MOVE"), "A=100; XQ #MOVE");
        assert_eq!(force_ok("MG \"OK\""), "MG \"OK\"");
        assert_eq!(force_ok("\"XQ#STOP\""), "XQ#STOP");
    }
}
