//! The user-facing command actor: a line-oriented TCP server plus the
//! single-user-command-at-a-time arbitrator in front of the device session.
//!
//! Arbitration rules: commands run serially in arrival order; a new move
//! supersedes a queued or active move; `stop` and `reset` jump the queue
//! and force-kill whatever is running; `init` re-dials the controller if
//! the session has died.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::galil::{
    CmdError, CmdResult, DeviceSession, GalilHooks, MsgLevel, NoHooks, PiezoHooks, SessionHandle,
    StatusMsg, UserVerb,
};
use crate::mirror::MirrorModel;
use crate::units::orient_to_mm_rad;

/// A user command at the actor surface: a session verb, or `init` which
/// the arbitrator handles itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ActorCommand {
    Verb(UserVerb),
    Init,
}

/// Everything needed to re-dial the controller on `init`.
pub struct GalilTarget {
    pub host: String,
    pub port: u16,
    pub mirror: Arc<MirrorModel>,
    pub max_iter: usize,
    pub piezo: bool,
    pub telemetry: broadcast::Sender<StatusMsg>,
}

enum ActorMsg {
    Submit {
        cmd: ActorCommand,
        reply: oneshot::Sender<CmdResult>,
    },
    Done {
        id: u64,
    },
}

struct Pending {
    verb: UserVerb,
    reply: oneshot::Sender<CmdResult>,
}

#[derive(Clone)]
pub struct ActorHandle {
    tx: mpsc::Sender<ActorMsg>,
}

impl ActorHandle {
    /// Enqueue a command; the returned channel yields its terminal state.
    pub async fn submit(
        &self,
        cmd: ActorCommand,
    ) -> Result<oneshot::Receiver<CmdResult>, CmdError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::Submit { cmd, reply })
            .await
            .map_err(|_| CmdError::Internal("command actor terminated".to_string()))?;
        Ok(rx)
    }

    /// Run a command to completion.
    pub async fn run(&self, cmd: ActorCommand) -> CmdResult {
        let rx = self.submit(cmd).await?;
        rx.await
            .unwrap_or_else(|_| Err(CmdError::Internal("command actor terminated".to_string())))
    }
}

pub struct MirrorCtrl {
    session: SessionHandle,
    target: Option<GalilTarget>,
    rx: mpsc::Receiver<ActorMsg>,
    tx: mpsc::Sender<ActorMsg>,
    queue: VecDeque<Pending>,
    active: Option<(u64, bool)>,
    next_id: u64,
}

impl MirrorCtrl {
    /// Start the arbitrator on its own task. `target` enables reconnection
    /// on `init`; without it a dead session stays dead.
    pub fn spawn(session: SessionHandle, target: Option<GalilTarget>) -> ActorHandle {
        let (tx, rx) = mpsc::channel(32);
        let actor = MirrorCtrl {
            session,
            target,
            rx,
            tx: tx.clone(),
            queue: VecDeque::new(),
            active: None,
            next_id: 0,
        };
        tokio::spawn(actor.run());
        ActorHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ActorMsg::Submit { cmd, reply } => self.handle_submit(cmd, reply).await,
                ActorMsg::Done { id } => {
                    if self.active.map_or(false, |(active_id, _)| active_id == id) {
                        self.active = None;
                        if let Some(next) = self.queue.pop_front() {
                            self.start(next.verb, next.reply).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_submit(&mut self, cmd: ActorCommand, reply: oneshot::Sender<CmdResult>) {
        let verb = match cmd {
            ActorCommand::Init => {
                if self.session.is_closed() {
                    match self.reconnect().await {
                        // A fresh connection starts with a status sweep.
                        Ok(()) => UserVerb::Status,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            return;
                        }
                    }
                } else {
                    UserVerb::Stop
                }
            }
            ActorCommand::Verb(verb) => verb,
        };

        if verb.preempts() {
            let reason = format!("superseded by {}", verb.name());
            self.cancel_queue(&reason);
            self.start(verb, reply).await;
            return;
        }

        let is_move = matches!(verb, UserVerb::Move(_) | UserVerb::Offset(_));
        if is_move {
            self.cancel_queued_moves("superseded by a new move");
            if let Some((_, true)) = self.active {
                self.session
                    .cancel_active("superseded by a new move")
                    .await;
                self.start(verb, reply).await;
                return;
            }
        }

        if self.active.is_none() {
            self.start(verb, reply).await;
        } else {
            self.queue.push_back(Pending { verb, reply });
        }
    }

    /// Hand a command to the session. The submission itself happens here,
    /// on the arbitrator task, so that commands reach the session in
    /// arbitration order; only completion forwarding is spawned.
    async fn start(&mut self, verb: UserVerb, reply: oneshot::Sender<CmdResult>) {
        let id = self.next_id;
        self.next_id += 1;
        let is_move = matches!(verb, UserVerb::Move(_) | UserVerb::Offset(_));
        self.active = Some((id, is_move));

        match self.session.start(verb).await {
            Ok(rx) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = rx
                        .await
                        .unwrap_or_else(|_| Err(CmdError::Device("not connected".to_string())));
                    let _ = reply.send(result);
                    let _ = tx.send(ActorMsg::Done { id }).await;
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(ActorMsg::Done { id }).await;
                });
            }
        }
    }

    fn cancel_queue(&mut self, reason: &str) {
        for pending in self.queue.drain(..) {
            let _ = pending
                .reply
                .send(Err(CmdError::Superseded(reason.to_string())));
        }
    }

    fn cancel_queued_moves(&mut self, reason: &str) {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for pending in self.queue.drain(..) {
            if matches!(pending.verb, UserVerb::Move(_) | UserVerb::Offset(_)) {
                let _ = pending
                    .reply
                    .send(Err(CmdError::Superseded(reason.to_string())));
            } else {
                kept.push_back(pending);
            }
        }
        self.queue = kept;
    }

    async fn reconnect(&mut self) -> Result<(), CmdError> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| CmdError::Device("not connected".to_string()))?;
        info!(host = %target.host, port = target.port, "re-dialing the Galil");
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| CmdError::Device(format!("could not connect: {e}")))?;
        let hooks: Box<dyn GalilHooks> = if target.piezo {
            Box::new(PiezoHooks)
        } else {
            Box::new(NoHooks)
        };
        self.session = DeviceSession::spawn(
            stream,
            target.mirror.clone(),
            target.max_iter,
            hooks,
            target.telemetry.clone(),
        );
        Ok(())
    }
}

/// Parse one user command line into an actor command, converting move and
/// offset arguments from um and arcsec to internal units.
pub fn parse_command(line: &str) -> Result<ActorCommand, CmdError> {
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
    let args = parts.next().unwrap_or_default().trim();
    let cmd = match verb.as_str() {
        "move" => ActorCommand::Verb(UserVerb::Move(parse_orient_args(args)?)),
        "offset" => ActorCommand::Verb(UserVerb::Offset(parse_orient_args(args)?)),
        "home" => ActorCommand::Verb(UserVerb::Home(parse_axis_args(args)?)),
        "stop" => ActorCommand::Verb(UserVerb::Stop),
        "reset" => ActorCommand::Verb(UserVerb::Reset),
        "status" => ActorCommand::Verb(UserVerb::Status),
        "showparams" => ActorCommand::Verb(UserVerb::ShowParams),
        "galil" => {
            if args.is_empty() {
                return Err(CmdError::Validation("no galil command specified".to_string()));
            }
            ActorCommand::Verb(UserVerb::Raw(args.to_string()))
        }
        "init" => ActorCommand::Init,
        other => {
            return Err(CmdError::Validation(format!("unknown command {other:?}")));
        }
    };
    Ok(cmd)
}

fn parse_orient_args(args: &str) -> Result<Vec<f64>, CmdError> {
    if args.is_empty() {
        return Err(CmdError::Validation("no orientation specified".to_string()));
    }
    let values: Result<Vec<f64>, _> = args.split(',').map(|s| s.trim().parse::<f64>()).collect();
    let values = values.map_err(|_| {
        CmdError::Validation(format!(
            "could not parse {args:?} as a comma-separated list of numbers"
        ))
    })?;
    if values.is_empty() || values.len() > 5 {
        return Err(CmdError::Validation(format!(
            "must specify 1 to 5 orientation values; got {}",
            values.len()
        )));
    }
    Ok(orient_to_mm_rad(&values))
}

fn parse_axis_args(args: &str) -> Result<Vec<usize>, CmdError> {
    let mut axes = Vec::new();
    for part in args.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut chars = part.chars();
        let letter = chars.next().unwrap_or_default();
        if chars.next().is_some() {
            return Err(CmdError::Validation(format!(
                "could not parse {args:?} as a comma-separated list of axis letters"
            )));
        }
        let index = crate::galil::command::axis_index(letter).ok_or_else(|| {
            CmdError::Validation(format!("invalid axis {letter:?}; expected A-F"))
        })?;
        axes.push(index);
    }
    Ok(axes)
}

/// Accept user connections and serve each on its own task.
pub async fn serve(
    listener: TcpListener,
    actor: ActorHandle,
    telemetry: broadcast::Sender<StatusMsg>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "user connected");
        tokio::spawn(serve_client(stream, actor.clone(), telemetry.subscribe()));
    }
}

async fn serve_client(
    stream: TcpStream,
    actor: ActorHandle,
    mut telemetry: broadcast::Receiver<StatusMsg>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(32);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(cmd) => {
                        let actor = actor.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            let result = actor.run(cmd).await;
                            let _ = out_tx.send(final_line(&result)).await;
                        });
                    }
                    Err(e) => {
                        if out_tx.send(final_line(&Err(e))).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(out) = out_rx.recv() => {
                if write_user_line(&mut write, &out).await.is_err() {
                    break;
                }
            }
            msg = telemetry.recv() => {
                match msg {
                    Ok(msg) => {
                        let prefix = match msg.level {
                            MsgLevel::Info => "i",
                            MsgLevel::Warn => "w",
                            MsgLevel::Notice => ">",
                        };
                        let text = format!("{prefix} {}", msg.text);
                        if write_user_line(&mut write, &text).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("telemetry consumer lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn final_line(result: &CmdResult) -> String {
    match result {
        Ok(()) => ": OK".to_string(),
        Err(CmdError::Superseded(reason)) => format!("f Cancelled: {reason}"),
        Err(e) => format!("f Failed: {e}"),
    }
}

async fn write_user_line(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> std::io::Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await
}
