//! The Galil device session: a protocol state machine that translates user
//! intents into sequences of line-level device commands, parses the
//! heterogeneous replies into the status model, enforces timeouts and
//! publishes telemetry.
//!
//! The session is one task driving a `select!` loop over socket lines, the
//! user-command channel and timer deadlines. At most one user command and
//! one device command are in flight at a time; a newly arrived `stop` or
//! `reset` force-kills the active command.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mirror::{FitError, MirrorError, MirrorModel, Orientation};

use super::command::{format_axis_command, force_ok, UserVerb, AXIS_NAMES};
use super::line::LineConn;
use super::piezo::GalilHooks;
use super::reply::{self, Reply, NOT_AVAILABLE};
use super::status::{GalilStatus, StatusMsg};

/// Initial timeout for every device command.
const DEV_CMD_TIMEOUT: Duration = Duration::from_secs(2);
/// RS elicits no OK; its device command is completed by this timer.
const RESET_DONE_DELAY: Duration = Duration::from_millis(500);
/// Deadline grace added to the user command on each move iteration.
const ITER_GRACE: Duration = Duration::from_secs(5);
/// Scale applied to the measured residual on each iteration; correcting by
/// only 90% avoids overshoot hunting.
const CORRECTION_STRENGTH: f64 = 0.9;

/// Terminal disposition of a user command, per the error taxonomy: device
/// and validation problems are failures, supersession is cancellation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CmdError {
    /// Rejected without touching the device.
    #[error("invalid command: {0}")]
    Validation(String),
    /// The controller replied `?`, timed out, or the connection dropped.
    #[error("device error: {0}")]
    Device(String),
    /// Move iteration diverged or the orientation fit did not converge.
    #[error("convergence error: {0}")]
    Convergence(String),
    /// Preempted by a later user command; terminal but not a failure.
    #[error("superseded: {0}")]
    Superseded(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CmdResult = Result<(), CmdError>;

fn fit_error(e: MirrorError) -> CmdError {
    match e {
        MirrorError::Fit(FitError::TooManyIterations(n)) => {
            CmdError::Convergence(format!("orientation fit exceeded {n} iterations"))
        }
        other => CmdError::Validation(other.to_string()),
    }
}

/// One queued request to the session.
#[derive(Debug)]
pub enum SessionRequest {
    Run(UserCommand),
    /// Cancel the active user command (arbitrator supersede path); the
    /// in-flight device command is killed with an `ST`.
    CancelActive { reason: String },
}

#[derive(Debug)]
pub struct UserCommand {
    pub verb: UserVerb,
    pub done: oneshot::Sender<CmdResult>,
}

/// Cloneable handle used to submit user commands to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Enqueue a user command; the returned channel yields its terminal state.
    pub async fn start(&self, verb: UserVerb) -> Result<oneshot::Receiver<CmdResult>, CmdError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Run(UserCommand { verb, done }))
            .await
            .map_err(|_| CmdError::Device("not connected".to_string()))?;
        Ok(rx)
    }

    /// Run a user command to completion.
    pub async fn run_command(&self, verb: UserVerb) -> CmdResult {
        let rx = self.start(verb).await?;
        rx.await
            .unwrap_or_else(|_| Err(CmdError::Device("not connected".to_string())))
    }

    /// Cancel whatever user command is active, without running a new one.
    pub async fn cancel_active(&self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(SessionRequest::CancelActive {
                reason: reason.into(),
            })
            .await;
    }

    /// Whether the session task has terminated (e.g. connection loss).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevKind {
    Move,
    Home,
    /// Status refresh chained after a home sequence.
    HomeStatus,
    Status,
    Params,
    Stop,
    Reset,
    Raw,
    /// Post-move piezo fine move on the piezo-equipped variant.
    Piezo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevState {
    Running,
    /// A `?` reply arrived; the command fully fails at the next OK.
    Failing,
}

struct DevCmd {
    cmd_str: String,
    kind: DevKind,
    state: DevState,
    fail_text: String,
    generation: u64,
    deadline: Instant,
    parsed_keys: Vec<String>,
}

struct ActiveUser {
    verb_name: &'static str,
    done: oneshot::Sender<CmdResult>,
    deadline: Option<Instant>,
}

enum Event {
    Line(String),
    Eof,
    Request(Option<SessionRequest>),
    DevDeadline,
    UserDeadline,
}

pub struct DeviceSession {
    conn: LineConn,
    mirror: Arc<MirrorModel>,
    status: GalilStatus,
    telemetry: broadcast::Sender<StatusMsg>,
    rx: mpsc::Receiver<SessionRequest>,
    hooks: Box<dyn GalilHooks>,
    dev: Option<DevCmd>,
    user: Option<ActiveUser>,
    generation: u64,
    n_act: usize,
}

impl DeviceSession {
    pub fn new(
        stream: TcpStream,
        mirror: Arc<MirrorModel>,
        max_iter: usize,
        hooks: Box<dyn GalilHooks>,
        telemetry: broadcast::Sender<StatusMsg>,
    ) -> (SessionHandle, Self) {
        let (tx, rx) = mpsc::channel(32);
        let n_act = mirror.actuators().len();
        // Without encoders there is no feedback to iterate on.
        let max_iter = if mirror.has_encoders() { max_iter } else { 1 };
        let session = DeviceSession {
            conn: LineConn::new(stream),
            status: GalilStatus::new(n_act, max_iter),
            mirror,
            telemetry,
            rx,
            hooks,
            dev: None,
            user: None,
            generation: 0,
            n_act,
        };
        (SessionHandle { tx }, session)
    }

    /// Create a session on its own task and return the submission handle.
    pub fn spawn(
        stream: TcpStream,
        mirror: Arc<MirrorModel>,
        max_iter: usize,
        hooks: Box<dyn GalilHooks>,
        telemetry: broadcast::Sender<StatusMsg>,
    ) -> SessionHandle {
        let (handle, session) = Self::new(stream, mirror, max_iter, hooks, telemetry);
        tokio::spawn(session.run());
        handle
    }

    pub async fn run(mut self) {
        loop {
            let dev_deadline = self.dev.as_ref().map(|d| d.deadline);
            let user_deadline = self.user.as_ref().and_then(|u| u.deadline);
            let event = tokio::select! {
                line = self.conn.read_line() => match line {
                    Ok(Some(l)) => Event::Line(l),
                    Ok(None) | Err(_) => Event::Eof,
                },
                req = self.rx.recv() => Event::Request(req),
                () = deadline_sleep(dev_deadline) => Event::DevDeadline,
                () = deadline_sleep(user_deadline) => Event::UserDeadline,
            };
            match event {
                Event::Line(raw) => self.handle_line(&raw).await,
                Event::Eof => {
                    self.handle_disconnect();
                    break;
                }
                Event::Request(Some(req)) => self.handle_request(req).await,
                Event::Request(None) => break,
                Event::DevDeadline => self.on_dev_deadline().await,
                Event::UserDeadline => self.on_user_deadline(),
            }
        }
    }

    fn publish(&self, msg: StatusMsg) {
        let _ = self.telemetry.send(msg);
    }

    fn publish_keys(&self, keys: &[&str]) {
        self.publish(StatusMsg::info(self.status.format_keys(keys)));
    }

    fn send_state(&self, failed: bool) {
        self.publish(StatusMsg::info(self.status.state_keyword(failed)));
    }

    fn finish_user(&mut self, result: CmdResult) {
        if let Some(user) = self.user.take() {
            self.status.clear_motion();
            let failed = matches!(
                result,
                Err(CmdError::Validation(_))
                    | Err(CmdError::Device(_))
                    | Err(CmdError::Convergence(_))
                    | Err(CmdError::Internal(_))
            );
            self.send_state(failed);
            let _ = user.done.send(result);
        }
    }

    fn handle_disconnect(&mut self) {
        warn!("connection to the Galil closed");
        self.dev = None;
        self.finish_user(Err(CmdError::Device("not connected".to_string())));
    }

    async fn handle_request(&mut self, req: SessionRequest) {
        match req {
            SessionRequest::Run(cmd) => self.handle_user(cmd).await,
            SessionRequest::CancelActive { reason } => self.cancel_active(reason).await,
        }
    }

    async fn handle_user(&mut self, cmd: UserCommand) {
        if self.user.is_some() {
            let active_name = self.user.as_ref().map_or("?", |u| u.verb_name);
            if cmd.verb.preempts() {
                let reason = format!("superseded by {}", cmd.verb.name());
                info!("force-killing {active_name} ({reason})");
                self.dev = None;
                self.finish_user(Err(CmdError::Superseded(reason)));
            } else {
                let busy = format!("device is busy executing {active_name}");
                let _ = cmd.done.send(Err(CmdError::Validation(busy)));
                return;
            }
        }
        self.run_user(cmd).await;
    }

    /// Kill the in-flight device command (freeing the controller with an
    /// ST) and cancel the active user command.
    async fn cancel_active(&mut self, reason: String) {
        if self.dev.take().is_some() {
            let _ = self.conn.write_line("ST").await;
        }
        self.finish_user(Err(CmdError::Superseded(reason)));
    }

    async fn run_user(&mut self, cmd: UserCommand) {
        let verb = cmd.verb;
        self.user = Some(ActiveUser {
            verb_name: verb.name(),
            done: cmd.done,
            deadline: None,
        });
        let result = match verb {
            UserVerb::Move(orient) => self.start_move(&orient).await,
            UserVerb::Offset(delta) => self.start_offset(&delta).await,
            UserVerb::Home(axes) => self.start_home(&axes).await,
            UserVerb::Stop => self.start_dev("ST;XQ#STOP".to_string(), DevKind::Stop).await,
            UserVerb::Reset => self.start_dev("RS".to_string(), DevKind::Reset).await,
            UserVerb::Status => self.start_dev("XQ#STATUS".to_string(), DevKind::Status).await,
            UserVerb::ShowParams => {
                self.start_dev("XQ#SHOWPAR".to_string(), DevKind::Params).await
            }
            UserVerb::Raw(stmt) => self.start_dev(force_ok(&stmt), DevKind::Raw).await,
        };
        if let Err(e) = result {
            self.finish_user(Err(e));
        }
    }

    async fn start_dev(&mut self, cmd_str: String, kind: DevKind) -> Result<(), CmdError> {
        debug_assert!(self.dev.is_none(), "device command collision");
        self.generation += 1;
        info!(cmd = %cmd_str, "writing to Galil");
        self.conn
            .write_line(&cmd_str)
            .await
            .map_err(|e| CmdError::Device(format!("write failed: {e}")))?;
        let timeout = if kind == DevKind::Reset {
            RESET_DONE_DELAY
        } else {
            DEV_CMD_TIMEOUT
        };
        self.dev = Some(DevCmd {
            cmd_str,
            kind,
            state: DevState::Running,
            fail_text: String::new(),
            generation: self.generation,
            deadline: Instant::now() + timeout,
            parsed_keys: Vec::new(),
        });
        Ok(())
    }

    async fn on_dev_deadline(&mut self) {
        let Some(dev) = self.dev.take() else {
            return;
        };
        if dev.kind == DevKind::Reset {
            // RS produces no OK; the timer is its completion.
            self.dev_done(dev, Ok(())).await;
            return;
        }
        let text = format!("device command {:?} timed out", dev.cmd_str);
        warn!("{text}");
        self.finish_user(Err(CmdError::Device(text)));
    }

    fn on_user_deadline(&mut self) {
        self.dev = None;
        let name = self.user.as_ref().map_or("?", |u| u.verb_name);
        let text = format!("user command {name} timed out");
        warn!("{text}");
        self.finish_user(Err(CmdError::Device(text)));
    }

    async fn handle_line(&mut self, raw: &str) {
        let line = reply::clean(raw);
        debug!(line = %line, "read from Galil");
        let generation = match self.dev.as_ref() {
            Some(dev) => dev.generation,
            None => {
                if !line.is_empty() {
                    debug!("ignoring unsolicited output: {line}");
                }
                return;
            }
        };
        if generation != self.generation {
            debug!("ignoring reply for a cancelled device command: {line}");
            return;
        }

        match reply::parse(&line) {
            Reply::Blank | Reply::Echo => {}
            Reply::Error(text) if text.starts_with("?GOPOS") => {
                // On-full-step error during home: report, don't fail.
                self.publish(StatusMsg::warn(format!(
                    "Text={}",
                    quote(&format!("On Full Step Error: {text}"))
                )));
            }
            Reply::Error(text) => {
                // Fail only after the OK, so the OK is not attributed to a
                // later command.
                let cmd_str = match self.dev.as_mut() {
                    Some(dev) => {
                        dev.state = DevState::Failing;
                        dev.fail_text = text.clone();
                        dev.cmd_str.clone()
                    }
                    None => String::new(),
                };
                self.publish(StatusMsg::warn(format!(
                    "Text={}",
                    quote(&format!("Device Command {cmd_str} Failing: {text}"))
                )));
            }
            Reply::Ok => {
                let Some(dev) = self.dev.take() else {
                    return;
                };
                let result = match dev.state {
                    DevState::Running => Ok(()),
                    DevState::Failing => Err(CmdError::Device(dev.fail_text.clone())),
                };
                self.dev_done(dev, result).await;
            }
            Reply::Single { key, values } => {
                if let Some(dev) = self.dev.as_mut() {
                    dev.parsed_keys.push(key.clone());
                }
                self.act_on_key(&key, &values, &line);
            }
            Reply::Pairs(pairs) => {
                for (key, value) in pairs {
                    if let Some(dev) = self.dev.as_mut() {
                        dev.parsed_keys.push(key.clone());
                    }
                    self.act_on_key(&key, &[value], &line);
                }
            }
            Reply::KeyMismatch => {
                self.publish(StatusMsg::warn(format!(
                    "UnparsedReply={}; Text={}",
                    quote(&line),
                    quote("number of keys does not match number of values")
                )));
            }
            Reply::Text(text) => {
                self.publish(StatusMsg::info(format!("UnparsedReply={}", quote(&text))));
            }
        }
    }

    /// Process one parsed reply key and its values.
    fn act_on_key(&mut self, key: &str, values: &[f64], line: &str) {
        if let Some(msgs) = self.hooks.act_on_key(key, values, &mut self.status) {
            for msg in msgs {
                self.publish(msg);
            }
            return;
        }

        if is_param_key(key) {
            self.send_galil_param(key, values);
        } else if key.contains("software version") {
            let v = values.first().copied().unwrap_or(f64::NAN);
            self.publish(StatusMsg::info(format!(
                "GalilSoftwareVersion={}",
                super::status::num_str(v)
            )));
        } else if is_dev_spec_version(key) {
            let v = values.first().copied().unwrap_or(f64::NAN);
            self.publish(StatusMsg::info(format!(
                "deviceSoftwareVersion={}",
                super::status::num_str(v)
            )));
        } else if is_time_estimate(key) {
            let max = values.iter().copied().fold(0.0_f64, f64::max);
            self.status.max_duration = max;
            self.status.duration.start();
            self.send_state(false);
            // The estimate defines the new deadlines, with headroom.
            if let Some(dev) = self.dev.as_mut() {
                dev.deadline = Instant::now() + Duration::from_secs_f64(max + 4.0);
            }
            if let Some(user) = self.user.as_mut() {
                user.deadline = Some(Instant::now() + Duration::from_secs_f64(max + 6.0));
            }
        } else if key == "commanded position" || key == "target position" {
            // Informational; modelMount must not be touched or subsequent
            // error computations would be biased.
        } else if key == "actual position" || key == "final position" {
            self.handle_position_reply(values);
        } else if key == "axis homed" {
            for (slot, v) in self.status.axis_homed.iter_mut().zip(values.iter()) {
                *slot = Some(*v != 0.0);
            }
            self.publish_keys(&["axisHomed"]);
        } else if key == "status word" {
            for (slot, v) in self.status.status.iter_mut().zip(values.iter()) {
                *slot = *v;
            }
            self.publish_keys(&["status"]);
        } else {
            let data = values
                .iter()
                .map(|v| super::status::num_str(*v))
                .collect::<Vec<_>>()
                .join(", ");
            self.publish(StatusMsg::info(format!(
                "unknownReplyKey={}, {}, {}",
                quote(key),
                quote(&data),
                quote(line)
            )));
        }
    }

    /// Measured encoder positions: store them and back-solve the mirror
    /// orientation, using the desired orientation as the initial guess.
    fn handle_position_reply(&mut self, values: &[f64]) {
        for (slot, v) in self.status.enc_mount.iter_mut().zip(values.iter()) {
            *slot = if *v == NOT_AVAILABLE { f64::NAN } else { *v };
        }
        self.publish_keys(&["encMount"]);

        if self.status.enc_mount.iter().all(|v| v.is_finite()) {
            let init = if self.status.des_orient.iter().all(|v| v.is_finite()) {
                Orientation::from_array(self.status.des_orient)
            } else {
                Orientation::ZERO
            };
            let enc_mount = self.status.enc_mount.clone();
            match self.mirror.orient_from_encoder_mount(&enc_mount, &init) {
                Ok(orient) => {
                    self.status.orient = orient.as_array();
                    match self.mirror.actuator_mount_from_orient(&orient.as_array(), true) {
                        Ok((act_mount, _)) => self.status.act_mount = act_mount,
                        Err(e) => {
                            self.status.act_mount = vec![f64::NAN; self.n_act];
                            self.publish(StatusMsg::warn(format!(
                                "Text={}",
                                quote(&format!("actuator mount fit failed: {e}"))
                            )));
                        }
                    }
                }
                Err(e) => {
                    self.status.orient = [f64::NAN; 6];
                    self.status.act_mount = vec![f64::NAN; self.n_act];
                    self.publish(StatusMsg::warn(format!(
                        "Text={}",
                        quote(&format!("orientation fit failed: {e}"))
                    )));
                }
            }
        } else {
            // Encoder positions contain not-available sentinels; no
            // further computation is possible.
            self.status.orient = [f64::NAN; 6];
            self.status.act_mount = vec![f64::NAN; self.n_act];
        }
        self.publish_keys(&["orient", "actMount", "cmdMount"]);
    }

    fn send_galil_param(&self, key: &str, values: &[f64]) {
        let mut param = key.split_whitespace().next().unwrap_or_default();
        if param == "-RNGx/2" {
            return;
        }
        let rewritten;
        if param == "RNGx/2" {
            rewritten = "HalfRNGx".to_string();
            param = &rewritten;
        }
        let param = param.strip_suffix('x').unwrap_or(param);
        let data = values
            .iter()
            .map(|v| super::status::num_str(*v))
            .collect::<Vec<_>>()
            .join(", ");
        self.publish(StatusMsg::info(format!("Galil{param}={data}")));
    }

    async fn dev_done(&mut self, dev: DevCmd, result: Result<(), CmdError>) {
        debug!(cmd = %dev.cmd_str, ?result, "device command finished");
        if let Err(e) = result {
            self.finish_user(Err(e));
            return;
        }
        match dev.kind {
            DevKind::Move => self.move_iter(dev).await,
            DevKind::Home => {
                // Home leaves the controller with fresh knowledge of its
                // axes; refresh status under the same user command.
                if let Err(e) = self
                    .start_dev("XQ#STATUS".to_string(), DevKind::HomeStatus)
                    .await
                {
                    self.finish_user(Err(e));
                }
            }
            DevKind::Status | DevKind::HomeStatus => {
                self.status_summary(&dev);
                self.finish_user(Ok(()));
            }
            DevKind::Piezo => {
                for key in self.hooks.post_move_expected_keys() {
                    if !dev.parsed_keys.iter().any(|k| k == key) {
                        self.publish(StatusMsg::warn(format!(
                            "Text={}",
                            quote(&format!("{key} not received from piezo move"))
                        )));
                    }
                }
                self.finish_user(Ok(()));
            }
            DevKind::Stop | DevKind::Reset | DevKind::Params | DevKind::Raw => {
                self.finish_user(Ok(()));
            }
        }
    }

    fn status_summary(&mut self, dev: &DevCmd) {
        let expectations = [
            ("commanded position", "Desired actuator positions not received"),
            ("actual position", "Actual actuator positions not received"),
            ("status word", "Status word not received"),
            ("axis homed", "Homed axis info not received"),
        ];
        for (key, text) in expectations {
            if !dev.parsed_keys.iter().any(|k| k == key) {
                self.publish(StatusMsg::warn(format!("Text={}", quote(text))));
            }
        }
        self.publish_keys(&["maxIter", "desOrient", "desOrientAge", "desEncMount", "homing"]);
        self.send_state(false);
    }

    async fn start_move(&mut self, user_orient: &[f64]) -> Result<(), CmdError> {
        if user_orient.is_empty() || user_orient.len() > 5 {
            return Err(CmdError::Validation(format!(
                "must specify 1 to 5 orientation values; got {}",
                user_orient.len()
            )));
        }
        let mut target = [0.0; 5];
        target[..user_orient.len()].copy_from_slice(user_orient);

        let (model_mount, adj_orient) = self
            .mirror
            .actuator_mount_from_orient(&target, true)
            .map_err(fit_error)?;
        let (des_enc_mount, _) = self
            .mirror
            .encoder_mount_from_orient(&adj_orient.as_array(), false)
            .map_err(fit_error)?;

        if !self.status.all_homed() {
            return Err(CmdError::Validation(
                "cannot move until all actuators are homed".to_string(),
            ));
        }
        if let Some(i) = self.mirror.first_mount_out_of_range(
            &model_mount
                .iter()
                .zip(self.status.net_mount_offset.iter())
                .map(|(m, o)| m + o)
                .collect::<Vec<_>>(),
        ) {
            return Err(CmdError::Validation(format!(
                "commanded orientation violates mount limits on axis {}",
                AXIS_NAMES[i]
            )));
        }

        // The learned offset from the previous converged move seeds this
        // one; for small corrections this avoids unwanted motion.
        self.publish_keys(&["netMountOffset"]);
        let cmd_mount: Vec<f64> = model_mount
            .iter()
            .zip(self.status.net_mount_offset.iter())
            .map(|(m, o)| m + o)
            .collect();

        if cmd_mount == self.status.cmd_mount {
            // Identical to the previous commanded position, bit for bit:
            // report without touching the motors.
            self.status.des_orient = adj_orient.as_array();
            self.status.des_orient_age.start();
            self.publish(StatusMsg::info(format!(
                "Text={}",
                quote("orientation unchanged; not moving")
            )));
            self.publish_keys(&["desOrient", "cmdMount", "desOrientAge", "modelMount", "maxIter"]);
            self.finish_user(Ok(()));
            return Ok(());
        }

        let cmd_str = format_axis_command(
            &cmd_mount.iter().map(|m| Some(*m)).collect::<Vec<_>>(),
            self.n_act,
            "XQ #MOVE",
        );
        self.start_dev(cmd_str, DevKind::Move).await?;

        self.status.moving = true;
        self.status.model_mount = model_mount;
        self.status.cmd_mount = cmd_mount;
        self.status.des_orient = adj_orient.as_array();
        self.status.des_enc_mount = des_enc_mount;
        self.status.iter = 1;
        self.status.des_orient_age.start();
        self.status.max_duration = 0.0;
        self.status.duration.start();
        self.send_state(false);
        self.publish_keys(&[
            "desOrient",
            "cmdMount",
            "desOrientAge",
            "desEncMount",
            "modelMount",
            "maxIter",
        ]);
        Ok(())
    }

    async fn start_offset(&mut self, delta: &[f64]) -> Result<(), CmdError> {
        if delta.is_empty() || delta.len() > 5 {
            return Err(CmdError::Validation(format!(
                "must specify 1 to 5 orientation values; got {}",
                delta.len()
            )));
        }
        let current = &self.status.orient[..5];
        if !current.iter().all(|v| v.is_finite()) {
            return Err(CmdError::Validation(
                "current orientation unknown".to_string(),
            ));
        }
        let mut target = [0.0; 5];
        target.copy_from_slice(current);
        for (t, d) in target.iter_mut().zip(delta.iter()) {
            *t += d;
        }
        self.start_move(&target).await
    }

    async fn start_home(&mut self, axes: &[usize]) -> Result<(), CmdError> {
        let mut homing = vec![false; self.n_act];
        if axes.is_empty() {
            homing.fill(true);
        } else {
            for &axis in axes {
                if axis >= self.n_act {
                    return Err(CmdError::Validation(format!(
                        "invalid axis {} for a {}-actuator mirror",
                        AXIS_NAMES.get(axis).copied().unwrap_or('?'),
                        self.n_act
                    )));
                }
                homing[axis] = true;
            }
        }

        let values: Vec<Option<f64>> = homing
            .iter()
            .map(|h| if *h { Some(1.0) } else { None })
            .collect();
        let cmd_str = format_axis_command(&values, self.n_act, "XQ #HOME");
        self.start_dev(cmd_str, DevKind::Home).await?;

        let named: Vec<String> = homing
            .iter()
            .enumerate()
            .filter(|(_, h)| **h)
            .map(|(i, _)| AXIS_NAMES[i].to_string())
            .collect();
        self.publish(StatusMsg::notice(format!(
            "Text={}",
            quote(&format!("Homing Actuators: {}", named.join(", ")))
        )));
        self.status.homing = homing.into_iter().map(Some).collect();
        self.publish_keys(&["homing"]);
        self.status.max_duration = 0.0;
        self.status.duration.start();
        self.send_state(false);
        Ok(())
    }

    /// A move device command finished: decide whether another iteration is
    /// needed and either command it or complete the move.
    async fn move_iter(&mut self, dev: DevCmd) {
        let has = |key: &str| dev.parsed_keys.iter().any(|k| k == key);
        if !has("max sec for move") {
            self.publish(StatusMsg::warn(format!(
                "Text={}",
                quote("Move time estimates were not received from move")
            )));
        }
        if !has("target position") {
            self.publish(StatusMsg::warn(format!(
                "Text={}",
                quote("Target actuator positions not received from move")
            )));
        }
        if !has("final position") {
            // Final positions are required to compute the next iteration.
            self.finish_user(Err(CmdError::Device(
                "final actuator positions not received from move".to_string(),
            )));
            return;
        }
        if !self.status.act_mount.iter().all(|v| v.is_finite()) {
            self.finish_user(Err(CmdError::Device(
                "measured actuator positions unavailable".to_string(),
            )));
            return;
        }

        let act_err: Vec<f64> = self
            .status
            .model_mount
            .iter()
            .zip(self.status.act_mount.iter())
            .map(|(model, act)| model - act)
            .collect();
        self.status.mount_err = act_err.clone();
        self.publish_keys(&["mountErr"]);

        let too_large = act_err
            .iter()
            .zip(self.mirror.max_corr().iter())
            .any(|(e, max)| e.abs() > *max);
        if too_large {
            self.finish_user(Err(CmdError::Convergence(
                "error too large to correct".to_string(),
            )));
            return;
        }

        let worth_correcting = act_err
            .iter()
            .zip(self.mirror.min_corr().iter())
            .any(|(e, min)| e.abs() > *min);
        if worth_correcting && self.status.iter < self.status.max_iter {
            for (cmd, err) in self.status.cmd_mount.iter_mut().zip(act_err.iter()) {
                *cmd += CORRECTION_STRENGTH * err;
            }
            self.status.net_mount_offset = self
                .status
                .cmd_mount
                .iter()
                .zip(self.status.model_mount.iter())
                .map(|(cmd, model)| cmd - model)
                .collect();
            let cmd_mount = self.status.cmd_mount.clone();
            match self
                .mirror
                .orient_from_actuator_mount(&cmd_mount, &Orientation::ZERO)
            {
                Ok(orient) => self.status.mount_orient = orient.as_array(),
                Err(e) => {
                    self.finish_user(Err(fit_error(e)));
                    return;
                }
            }
            self.status.iter += 1;
            self.status.duration.reset();
            if let Some(user) = self.user.as_mut() {
                user.deadline = Some(Instant::now() + ITER_GRACE);
            }
            self.publish_keys(&["modelMount", "cmdMount", "mountOrient", "netMountOffset"]);

            let cmd_str = format_axis_command(
                &cmd_mount.iter().map(|m| Some(*m)).collect::<Vec<_>>(),
                self.n_act,
                "XQ #MOVE",
            );
            self.status.max_duration = 0.0;
            self.status.duration.start();
            self.send_state(false);
            if let Err(e) = self.start_dev(cmd_str, DevKind::Move).await {
                self.finish_user(Err(e));
            }
            return;
        }

        // Converged (or iterations exhausted): a piezo-equipped variant
        // makes one final fine move before the command completes.
        if let Some(cmd_str) = self.hooks.post_move_cmd(&self.status) {
            if let Err(e) = self.start_dev(cmd_str, DevKind::Piezo).await {
                self.finish_user(Err(e));
            }
            return;
        }
        self.status.moving = false;
        self.finish_user(Ok(()));
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending::<()>().await,
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}

fn is_param_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => true,
        Some('-') => chars.next().is_some_and(|c| c.is_ascii_uppercase()),
        _ => false,
    }
}

fn is_dev_spec_version(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.starts_with("version of ") && lower.contains(" additions")
}

fn is_time_estimate(key: &str) -> bool {
    let mut words = key.split_whitespace();
    let first = words.next().unwrap_or_default();
    let second = words.next().unwrap_or_default();
    matches!(
        (first, second),
        ("sec", "to") | ("max", "sec") | ("time", "for")
    )
}
