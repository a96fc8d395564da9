//! Process Supervisor - runs the renderer and streams its output
//!
//! Each launch gets a child process in its own process group, one reader
//! task per output stream and one task that waits for the exit. Events are
//! delivered through an unbounded channel in arrival order; `Exited` is
//! always the last one, after both streams are drained.

use super::retry::deadline_after;
use crate::error::{LaunchError, ProcessExitError};
use crate::semantic::LineAssembler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to keep reading after the child exits
///
/// Render workers that inherited the pipes can keep them open past the
/// parent's exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// How the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The exit as an error, `None` for a clean exit
    pub fn error(&self) -> Option<ProcessExitError> {
        match (self.code, self.signal) {
            (Some(0), _) => None,
            (Some(code), _) => Some(ProcessExitError::NonZero(code)),
            (None, Some(signal)) => Some(ProcessExitError::Signaled(signal)),
            (None, None) => Some(ProcessExitError::Unknown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line(OutputLine),
    Exited(ExitInfo),
}

/// Everything needed to start one renderer process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub job_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Frames this launch is expected to render
    pub frames: Vec<i64>,
}

#[derive(Debug)]
enum Control {
    Terminate { grace: Duration },
}

/// Sends control requests to a running process
#[derive(Debug, Clone)]
pub struct ProcessControl {
    tx: mpsc::UnboundedSender<Control>,
}

impl ProcessControl {
    /// SIGTERM the process group, SIGKILL it after `grace`
    pub fn terminate(&self, grace: Duration) {
        if self.tx.send(Control::Terminate { grace }).is_err() {
            log::debug!("Terminate requested for a process that already exited");
        }
    }
}

/// A launched process: its event stream plus a control handle
pub struct ProcessHandle {
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    control: ProcessControl,
}

impl ProcessHandle {
    /// Build a handle from raw channels
    ///
    /// Used by launchers that do not spawn a real process. Terminate
    /// requests arrive on the returned receiver.
    pub fn from_channel(
        events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Duration>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Control::Terminate { grace }) = rx.recv().await {
                if grace_tx.send(grace).is_err() {
                    break;
                }
            }
        });
        (
            Self {
                events,
                control: ProcessControl { tx },
            },
            grace_rx,
        )
    }

    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    pub fn terminate(&self, grace: Duration) {
        self.control.terminate(grace);
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ProcessEvent>, ProcessControl) {
        (self.events, self.control)
    }
}

/// Starts renderer processes
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError>;
}

/// Launcher backed by real OS processes
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        if spec.program.trim().is_empty() {
            return Err(LaunchError::InvalidArguments("empty program".to_string()));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        // New process group so the whole render tree can be signalled
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LaunchError::NotFound(spec.program.clone())
            } else {
                LaunchError::Spawn {
                    program: spec.program.clone(),
                    source,
                }
            }
        })?;

        log::info!(
            "Launched {} for {} (pid {:?}, frames {:?})",
            spec.program,
            spec.job_id,
            child.id(),
            spec.frames
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let readers = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(read_lines(out, Stream::Stdout, event_tx.clone()))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(read_lines(err, Stream::Stderr, event_tx.clone()))),
        ];

        let job_id = spec.job_id.clone();
        // Group id of the render tree; `Child::id` is gone after the wait
        let group = child.id();
        tokio::spawn(async move {
            let started = Instant::now();
            let (code, signal, reap_by) = supervise(&mut child, control_rx, &job_id).await;

            let mut readers: Vec<JoinHandle<()>> = readers.into_iter().flatten().collect();
            if let Some(group) = group {
                reap_group(group, &mut readers, reap_by, &job_id).await;
            }
            let drained_by = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            for reader in readers {
                // Already awaited while reaping
                if reader.is_finished() {
                    continue;
                }
                let abort = reader.abort_handle();
                if tokio::time::timeout_at(drained_by, reader).await.is_err() {
                    log::warn!("{}: output still open after exit, abandoning reader", job_id);
                    abort.abort();
                }
            }

            let info = ExitInfo {
                code,
                signal,
                elapsed: started.elapsed(),
            };
            log::debug!("{} exited: {:?}", job_id, info);
            let _ = event_tx.send(ProcessEvent::Exited(info));
        });

        Ok(ProcessHandle {
            events: event_rx,
            control: ProcessControl { tx: control_tx },
        })
    }
}

/// Wait for the child, honoring terminate requests
///
/// After a terminate request also returns the end of the grace period, which
/// bounds how long the rest of the process group may live.
async fn supervise(
    child: &mut Child,
    mut control: mpsc::UnboundedReceiver<Control>,
    job_id: &str,
) -> (Option<i32>, Option<i32>, Option<tokio::time::Instant>) {
    let mut control_open = true;
    let (status, reap_by) = loop {
        tokio::select! {
            status = child.wait() => break (status, None),
            request = control.recv(), if control_open => match request {
                Some(Control::Terminate { grace }) => {
                    let deadline = deadline_after(grace);
                    break (terminate(child, deadline, job_id).await, Some(deadline));
                }
                None => control_open = false,
            },
        }
    };

    match status {
        Ok(status) => (status.code(), exit_signal(&status), reap_by),
        Err(e) => {
            log::error!("{}: failed to wait for renderer: {}", job_id, e);
            (None, None, reap_by)
        }
    }
}

async fn terminate(
    child: &mut Child,
    deadline: tokio::time::Instant,
    job_id: &str,
) -> std::io::Result<std::process::ExitStatus> {
    log::info!(
        "{}: terminating renderer (grace {:?})",
        job_id,
        deadline.saturating_duration_since(tokio::time::Instant::now())
    );
    signal_tree(child, Signal::Term);

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!("{}: renderer ignored SIGTERM, killing", job_id);
            signal_tree(child, Signal::Kill);
            child.wait().await
        }
    }
}

/// Kill render workers that outlived the renderer
///
/// Workers share the renderer's output pipes, so the readers reaching EOF
/// means the tree is gone. After a terminate request the group gets what is
/// left of the grace period; after a plain exit any survivors are asked to
/// stop and get `DRAIN_TIMEOUT`. SIGKILL follows either way.
#[cfg(unix)]
async fn reap_group(
    group: u32,
    readers: &mut [JoinHandle<()>],
    deadline: Option<tokio::time::Instant>,
    job_id: &str,
) {
    let deadline = match deadline {
        Some(deadline) => deadline,
        None if group_alive(group) => {
            log::warn!("{}: renderer exited but left workers behind, stopping them", job_id);
            signal_group(group, Signal::Term);
            tokio::time::Instant::now() + DRAIN_TIMEOUT
        }
        None => return,
    };

    let closed = tokio::time::timeout_at(deadline, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    if closed.is_err() {
        log::warn!("{}: render workers still running, killing", job_id);
    }
    signal_group(group, Signal::Kill);
}

#[cfg(not(unix))]
async fn reap_group(
    _group: u32,
    _readers: &mut [JoinHandle<()>],
    _deadline: Option<tokio::time::Instant>,
    _job_id: &str,
) {
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_number(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    }
}

/// Signal every process in the group, false if none was reached
#[cfg(unix)]
fn signal_group(group: u32, signal: Signal) -> bool {
    let sig = signal_number(signal);
    // Safety: killpg only reads its arguments. The group id is the
    // renderer's pid because it was spawned with process_group(0), and it
    // stays reserved while any member of the group is alive.
    let ret = unsafe { libc::killpg(group as libc::pid_t, sig) };
    if ret != 0 {
        log::debug!(
            "killpg({}, {}) failed: {}",
            group,
            sig,
            std::io::Error::last_os_error()
        );
    }
    ret == 0
}

#[cfg(unix)]
fn group_alive(group: u32) -> bool {
    // Safety: signal 0 only checks that the group exists
    unsafe { libc::killpg(group as libc::pid_t, 0) == 0 }
}

#[cfg(unix)]
fn signal_tree(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    if !signal_group(pid, signal) && matches!(signal, Signal::Kill) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_tree(child: &mut Child, _signal: Signal) {
    if let Err(e) = child.start_kill() {
        log::debug!("start_kill failed: {}", e);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Read a stream line by line until EOF
async fn read_lines<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut assembler = LineAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for text in assembler.push(&buf[..n]) {
                    let _ = tx.send(ProcessEvent::Line(OutputLine { stream, text }));
                }
            }
            Err(e) => {
                log::warn!("{:?} read error: {}", stream, e);
                break;
            }
        }
    }
    if let Some(text) = assembler.finish() {
        let _ = tx.send(ProcessEvent::Line(OutputLine { stream, text }));
    }
}
