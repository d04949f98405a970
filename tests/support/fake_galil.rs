//! A scripted Galil emulator for session tests.
//!
//! Speaks the controller's line protocol over TCP: echoes received
//! statements, runs one XQ program at a time (rejecting a second with
//! `?`), and emulates MOVE / HOME / STATUS / SHOWPAR / STOP / LMOVE with
//! the real controller's reply scripts. `ST` and `RS` interrupt whatever
//! is running. Measured encoder positions come from a "true" mirror model
//! that may deliberately differ from the controller's.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use mirror_ctrl::mirror::{MirrorModel, Orientation};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const NOT_AVAILABLE: f64 = 999_999_999.0;
const STATUS_WORD: f64 = 8196.0 * 6.0;
const STEP_DELAY: Duration = Duration::from_millis(50);

pub struct FakeGalil {
    pub addr: std::net::SocketAddr,
    received: Arc<StdMutex<Vec<String>>>,
}

struct State {
    truth: MirrorModel,
    n_act: usize,
    is_homed: Vec<bool>,
    cmd_pos: Vec<f64>,
    meas_pos: Vec<f64>,
    user_nums: Vec<Option<f64>>,
    piezo_nums: [Option<f64>; 3],
}

impl FakeGalil {
    /// Bind, accept a single connection and serve it until it closes.
    pub async fn spawn(truth: MirrorModel, wake_up_homed: bool) -> FakeGalil {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let n_act = truth.actuators().len();
        let state = Arc::new(Mutex::new(State {
            n_act,
            is_homed: vec![wake_up_homed; n_act],
            cmd_pos: vec![0.0; n_act],
            meas_pos: vec![0.0; n_act],
            user_nums: vec![None; n_act],
            piezo_nums: [None; 3],
            truth,
        }));

        let task_received = received.clone();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read, write) = stream.into_split();
            serve(read, write, state, task_received).await;
        });

        FakeGalil { addr, received }
    }

    /// Every statement received so far, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve(
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    state: Arc<Mutex<State>>,
    received: Arc<StdMutex<Vec<String>>>,
) {
    let writer = Arc::new(Mutex::new(write));
    let mut reader = LineReader {
        read,
        buf: Vec::new(),
    };
    let mut script: Option<JoinHandle<()>> = None;

    while let Some(line) = reader.next_line().await {
        for stmt in line.split(';') {
            let stmt = stmt.trim().to_string();
            if stmt.is_empty() {
                continue;
            }
            received.lock().unwrap().push(stmt.clone());

            if let Some(text) = stmt.strip_prefix("MG") {
                send(&writer, text.trim().trim_matches('"')).await;
                continue;
            }
            send(&writer, &stmt).await; // command echo

            if stmt.eq_ignore_ascii_case("ST") || stmt.eq_ignore_ascii_case("RS") {
                if let Some(handle) = script.take() {
                    handle.abort();
                }
                if stmt.eq_ignore_ascii_case("RS") {
                    let mut s = state.lock().await;
                    let n = s.n_act;
                    s.is_homed = vec![false; n];
                    s.cmd_pos = vec![0.0; n];
                    s.meas_pos = vec![0.0; n];
                    s.user_nums = vec![None; n];
                    send(&writer, "Mirror controller version  0000000002.1000 started").await;
                }
                continue;
            }

            if let Some((axis, value)) = parse_assignment(&stmt) {
                let mut s = state.lock().await;
                match axis {
                    Assign::Axis(i) if i < s.n_act => s.user_nums[i] = value,
                    Assign::Piezo(i) if i < 3 => s.piezo_nums[i] = value,
                    _ => {}
                }
                continue;
            }

            if let Some(verb) = parse_xq(&stmt) {
                if script.as_ref().is_some_and(|h| !h.is_finished()) {
                    // Busy running another program.
                    send(&writer, "?").await;
                    continue;
                }
                let state = state.clone();
                let writer = writer.clone();
                script = Some(tokio::spawn(async move {
                    run_program(&verb, state, writer).await;
                }));
                continue;
            }

            send(&writer, "?").await;
        }
    }
}

async fn run_program(verb: &str, state: Arc<Mutex<State>>, writer: Arc<Mutex<OwnedWriteHalf>>) {
    match verb {
        "MOVE" => move_script(state, writer).await,
        "HOME" => home_script(state, writer).await,
        "STATUS" | "STOP" => {
            show_status(&state, &writer).await;
            done(&state, &writer).await;
        }
        "SHOWPAR" => {
            show_params(&state, &writer).await;
            done(&state, &writer).await;
        }
        "LMOVE" => {
            show_status(&state, &writer).await;
            send(&writer, "3 piezo status word").await;
            let piezo: Vec<f64> = {
                let s = state.lock().await;
                s.piezo_nums.iter().map(|v| v.unwrap_or(0.0)).collect()
            };
            let line = format!("{} piezo corrections (microsteps)", fmt_time_arr(&piezo));
            send(&writer, &line).await;
            done(&state, &writer).await;
        }
        _ => {
            send(&writer, "?").await;
            done(&state, &writer).await;
        }
    }
}

async fn move_script(state: Arc<Mutex<State>>, writer: Arc<Mutex<OwnedWriteHalf>>) {
    {
        let mut s = state.lock().await;
        let new_cmd: Vec<f64> = s
            .user_nums
            .iter()
            .zip(s.cmd_pos.iter())
            .map(|(user, cmd)| user.unwrap_or(*cmd))
            .collect();
        let unhomed_move = new_cmd
            .iter()
            .zip(s.cmd_pos.iter())
            .zip(s.is_homed.iter())
            .any(|((new, old), homed)| new != old && !homed);
        if unhomed_move {
            let flags: Vec<String> = s
                .is_homed
                .iter()
                .map(|h| if *h { "0" } else { "1" }.to_string())
                .collect();
            drop(s);
            send(
                &writer,
                &format!(
                    "?HMERR: some axes to be moved have not been homed: {}",
                    flags.join(",")
                ),
            )
            .await;
            done(&state, &writer).await;
            return;
        }

        // Measured encoder reading through the true geometry.
        let true_orient = s
            .truth
            .orient_from_actuator_mount(&new_cmd, &Orientation::ZERO)
            .expect("true geometry fit");
        let (true_enc, _) = s
            .truth
            .encoder_mount_from_orient(&true_orient.as_array(), true)
            .expect("true geometry forward");
        s.meas_pos = if s.truth.has_encoders() {
            true_enc
        } else {
            new_cmd.clone()
        };
        s.cmd_pos = new_cmd;

        let times = vec![0.1; s.n_act];
        let cmd_line = format!("{} target position", fmt_int_arr(&s.cmd_pos));
        let time_line = format!("{} max sec for move", fmt_time_arr(&times));
        drop(s);
        send(&writer, &time_line).await;
        send(&writer, &cmd_line).await;
    }
    sleep(STEP_DELAY).await;
    {
        let s = state.lock().await;
        let line = format!("{} final position", fmt_int_arr(&s.meas_pos));
        drop(s);
        send(&writer, &line).await;
    }
    done(&state, &writer).await;
}

async fn home_script(state: Arc<Mutex<State>>, writer: Arc<Mutex<OwnedWriteHalf>>) {
    let times = {
        let mut s = state.lock().await;
        let homing: Vec<bool> = s.user_nums.iter().map(Option::is_some).collect();
        for (homed, requested) in s.is_homed.iter_mut().zip(homing.iter()) {
            *homed = *homed && !requested;
        }
        vec![0.1; s.n_act]
    };
    send(
        &writer,
        &format!("{} max sec to find reverse limit switch", fmt_time_arr(&times)),
    )
    .await;
    sleep(STEP_DELAY).await;
    send(
        &writer,
        &format!("{} max sec to move away from home switch", fmt_time_arr(&times)),
    )
    .await;
    sleep(STEP_DELAY).await;
    send(&writer, "Finding next full step").await;
    send(&writer, "041,  006.6 microsteps, sec to find full step").await;
    {
        let mut s = state.lock().await;
        let homing: Vec<bool> = s.user_nums.iter().map(Option::is_some).collect();
        for (homed, requested) in s.is_homed.iter_mut().zip(homing.iter()) {
            *homed = *homed || *requested;
        }
        let pos_err: Vec<f64> = s
            .user_nums
            .iter()
            .map(|u| if u.is_some() { 0.0 } else { NOT_AVAILABLE })
            .collect();
        let line = format!("{} position error", fmt_int_arr(&pos_err));
        drop(s);
        send(&writer, &line).await;
    }
    show_status(&state, &writer).await;
    show_params(&state, &writer).await;
    done(&state, &writer).await;
}

async fn show_status(state: &Arc<Mutex<State>>, writer: &Arc<Mutex<OwnedWriteHalf>>) {
    let lines = {
        let s = state.lock().await;
        let masked = |values: &[f64]| -> Vec<f64> {
            values
                .iter()
                .zip(s.is_homed.iter())
                .map(|(v, homed)| if *homed { *v } else { NOT_AVAILABLE })
                .collect()
        };
        let homed_flags: Vec<String> = s
            .is_homed
            .iter()
            .map(|h| if *h { " 1" } else { " 0" }.to_string())
            .collect();
        vec![
            format!("{} axis homed", homed_flags.join(", ")),
            format!("{} commanded position", fmt_int_arr(&masked(&s.cmd_pos))),
            format!("{} actual position", fmt_int_arr(&masked(&s.meas_pos))),
            format!("{} status word", fmt_int_arr(&vec![STATUS_WORD; s.n_act])),
        ]
    };
    for line in lines {
        send(writer, &line).await;
    }
}

async fn show_params(state: &Arc<Mutex<State>>, writer: &Arc<Mutex<OwnedWriteHalf>>) {
    let n_act = state.lock().await.n_act;
    let range = vec![3_842_048.0; n_act];
    let speed = vec![50_000.0; n_act];
    let lines = vec![
        format!("02.10, {n_act} software version, NAXES number of axes"),
        "1, 0, 01 DOAUX aux status? MOFF motors off when idle? NCORR # corrections".to_string(),
        "00.10, 00.00, 30.00 WTIME, ENCTIME, LSTIME".to_string(),
        format!(
            "{} -RNGx/2 reverse limits",
            fmt_int_arr(&range.iter().map(|r| -r / 2.0).collect::<Vec<_>>())
        ),
        format!(
            "{} RNGx/2 forward limits",
            fmt_int_arr(&range.iter().map(|r| r / 2.0).collect::<Vec<_>>())
        ),
        format!("{} SPDx speed", fmt_int_arr(&speed)),
    ];
    for line in lines {
        send(writer, &line).await;
    }
}

/// Reset the per-command axis values and report OK.
async fn done(state: &Arc<Mutex<State>>, writer: &Arc<Mutex<OwnedWriteHalf>>) {
    {
        let mut s = state.lock().await;
        s.user_nums.fill(None);
        s.piezo_nums.fill(None);
    }
    send(writer, "OK").await;
}

enum Assign {
    Axis(usize),
    Piezo(usize),
}

fn parse_assignment(stmt: &str) -> Option<(Assign, Option<f64>)> {
    let (lhs, rhs) = stmt.split_once('=')?;
    let lhs = lhs.trim();
    let rhs = rhs.trim();
    let assign = if let Some(axis) = lhs.strip_prefix("LDESPOS") {
        let letter = axis.chars().next()?;
        Assign::Piezo((letter as usize).checked_sub('A' as usize)?)
    } else {
        let letter = lhs.chars().next()?;
        if lhs.len() != 1 || !letter.is_ascii_uppercase() {
            return None;
        }
        Assign::Axis((letter as usize).checked_sub('A' as usize)?)
    };
    if rhs == "MAXINT" {
        return Some((assign, None));
    }
    rhs.parse::<f64>().ok().map(|v| (assign, Some(v)))
}

fn parse_xq(stmt: &str) -> Option<String> {
    let compact = stmt.replace(' ', "");
    let verb = compact.strip_prefix("XQ#")?;
    if verb.is_empty() || !verb.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    Some(verb.to_string())
}

fn fmt_int_arr(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:09}", v.round() as i64))
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_time_arr(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:4.1}"))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn send(writer: &Arc<Mutex<OwnedWriteHalf>>, line: &str) {
    let mut w = writer.lock().await;
    let _ = w.write_all(line.as_bytes()).await;
    let _ = w.write_all(b"\r\n").await;
}

struct LineReader {
    read: OwnedReadHalf,
    buf: Vec<u8>,
}

impl LineReader {
    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(end) = self.buf.iter().position(|b| *b == b'\r' || *b == b'\n') {
                let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.drain(..=end);
                if line.trim().is_empty() {
                    continue;
                }
                return Some(line);
            }
            let mut chunk = [0_u8; 1024];
            match self.read.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }
}
