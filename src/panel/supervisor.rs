//! Process supervisor — owns the single supervised child process.
//!
//! State machine: `Idle -> Starting -> Running -> Terminating -> Idle`.
//!
//! Each started process gets a generation number. Its waiter task owns the
//! `Child`, drains stdout/stderr into the log buffer and, on exit, returns the
//! slot to `Idle` only if the slot still belongs to that generation. `stop`
//! signals the whole process group, falls back to killing the direct child
//! through the waiter task, and waits on the exit event with a bounded grace
//! interval before escalating to SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use regex::RegexSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::logbuf::LogBroadcast;
use super::models::{LogKind, ProcessState};
use crate::errors::SupervisorError;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(1500);

/// Bound on how long the waiter keeps draining pipes after the child exits.
/// Grandchildren that inherited the pipes can otherwise hold them open forever.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A child that stops reading stdin must not wedge its input pipe forever.
const INPUT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often `stop` rechecks a slot that is still spawning.
const STARTING_POLL: Duration = Duration::from_millis(10);

/// Stderr lines from dependency tooling that are chatter, not errors.
pub const DEFAULT_NOISE_PATTERNS: &[&str] = &["npm WARN", "npm notice", "Cloning into"];

/// Classifies stderr lines that should be logged at `input` severity.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    patterns: RegexSet,
}

impl NoiseFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
        })
    }

    pub fn is_noise(&self, line: &str) -> bool {
        self.patterns.is_match(line)
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        let escaped: Vec<String> = DEFAULT_NOISE_PATTERNS
            .iter()
            .map(|p| regex::escape(p))
            .collect();
        Self {
            patterns: RegexSet::new(escaped).unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Build a platform-shell command rooted at `cwd`, in its own process group,
/// with all three stdio handles piped.
pub fn shell_command(command: &str, cwd: &Path) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.process_group(0);
        cmd
    };
    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };
    cmd.current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    cmd
}

/// Read a child stream line by line into the log buffer until EOF.
pub async fn pump_lines<R>(reader: R, stream: OutputStream, logs: Arc<LogBroadcast>, noise: NoiseFilter)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let kind = match stream {
                    OutputStream::Stdout => LogKind::Info,
                    OutputStream::Stderr if noise.is_noise(line) => LogKind::Input,
                    OutputStream::Stderr => LogKind::Error,
                };
                logs.append(kind, line);
            }
            Err(e) => {
                tracing::debug!("stream read ended: {}", e);
                break;
            }
        }
    }
}

/// How a termination request was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The whole process group was signalled.
    Group,
    /// Group signalling failed; the direct child was killed instead.
    DirectChild,
    /// Nothing left to signal.
    AlreadyGone,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if pgid <= 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // SAFETY: killpg has no memory-safety preconditions; pgid is a positive group id.
    if unsafe { libc::killpg(pgid, signal) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Two-tier termination: group signal first, direct child as fallback.
/// "No such process" at either tier counts as success.
fn terminate_tree(pid: Option<u32>, force: bool, direct: &mpsc::Sender<()>) -> Termination {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        match signal_group(pid, signal) {
            Ok(()) => return Termination::Group,
            Err(e) => tracing::debug!(pid, "group signal failed, falling back to child: {}", e),
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, force);

    match direct.try_send(()) {
        Ok(()) => Termination::DirectChild,
        // Full: a kill request is already queued.
        Err(mpsc::error::TrySendError::Full(())) => Termination::DirectChild,
        Err(mpsc::error::TrySendError::Closed(())) => Termination::AlreadyGone,
    }
}

type ExitWatch = watch::Receiver<Option<Option<i32>>>;

struct LiveProcess {
    generation: u64,
    pid: Option<u32>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    kill_tx: mpsc::Sender<()>,
    exited: ExitWatch,
}

enum Slot {
    Idle,
    Starting,
    Running(LiveProcess),
    Terminating {
        generation: u64,
        pid: Option<u32>,
        exited: ExitWatch,
    },
}

impl Slot {
    fn generation(&self) -> Option<u64> {
        match self {
            Slot::Running(live) => Some(live.generation),
            Slot::Terminating { generation, .. } => Some(*generation),
            Slot::Idle | Slot::Starting => None,
        }
    }
}

pub struct ProcessSupervisor {
    workspace: PathBuf,
    logs: Arc<LogBroadcast>,
    noise: NoiseFilter,
    stop_grace: Duration,
    slot: Arc<Mutex<Slot>>,
    next_generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(workspace: impl Into<PathBuf>, logs: Arc<LogBroadcast>) -> Self {
        Self {
            workspace: workspace.into(),
            logs,
            noise: NoiseFilter::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn with_noise_filter(mut self, noise: NoiseFilter) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn noise_filter(&self) -> &NoiseFilter {
        &self.noise
    }

    pub async fn status(&self) -> ProcessState {
        match &*self.slot.lock().await {
            Slot::Idle => ProcessState::Idle,
            Slot::Starting => ProcessState::Starting,
            Slot::Running(live) => ProcessState::Running {
                pid: live.pid.unwrap_or_default(),
            },
            Slot::Terminating { pid, .. } => ProcessState::Terminating {
                pid: pid.unwrap_or_default(),
            },
        }
    }

    /// Spawn `command` in the workspace. Fails unless the slot is `Idle`;
    /// the caller is responsible for stopping any previous process.
    pub async fn start(&self, command: &str) -> Result<u32, SupervisorError> {
        {
            let mut slot = self.slot.lock().await;
            if !matches!(*slot, Slot::Idle) {
                return Err(SupervisorError::AlreadyRunning);
            }
            *slot = Slot::Starting;
        }

        let mut child = match shell_command(command, &self.workspace).spawn() {
            Ok(child) => child,
            Err(source) => {
                *self.slot.lock().await = Slot::Idle;
                return Err(SupervisorError::SpawnFailed {
                    command: command.to_string(),
                    source,
                });
            }
        };
        self.logs.success(format!("Starting process: {}", command));

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stdin = Arc::new(Mutex::new(child.stdin.take()));
        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(pump_lines(
                out,
                OutputStream::Stdout,
                Arc::clone(&self.logs),
                self.noise.clone(),
            ))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(pump_lines(
                err,
                OutputStream::Stderr,
                Arc::clone(&self.logs),
                self.noise.clone(),
            ))
        });

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        // Publish Running before the waiter exists so a fast exit cannot be
        // observed against a stale Starting slot.
        let mut slot = self.slot.lock().await;
        *slot = Slot::Running(LiveProcess {
            generation,
            pid,
            stdin,
            kill_tx,
            exited: exit_rx,
        });

        let logs = Arc::clone(&self.logs);
        let slot_handle = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!("direct kill failed: {}", e);
                        }
                    }
                }
            };
            drain_readers([stdout, stderr]).await;

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    logs.error(format!("Failed to wait for process: {}", e));
                    None
                }
            };
            match code {
                Some(code) => logs.warn(format!("Process exited with code {}", code)),
                None => logs.warn("Process exited with code none (terminated by signal)"),
            };

            {
                let mut slot = slot_handle.lock().await;
                if slot.generation() == Some(generation) {
                    *slot = Slot::Idle;
                }
            }
            exit_tx.send_replace(Some(code));
        });
        drop(slot);

        tracing::info!(?pid, generation, "supervised process started");
        Ok(pid.unwrap_or_default())
    }

    /// Forward one line to the child's stdin and echo it to the log.
    pub async fn write_input(&self, line: &str) -> Result<(), SupervisorError> {
        let stdin = match &*self.slot.lock().await {
            Slot::Running(live) => Arc::clone(&live.stdin),
            _ => return Err(SupervisorError::NotRunning),
        };

        {
            let mut stdin = stdin.lock().await;
            let pipe = stdin.as_mut().ok_or(SupervisorError::NotRunning)?;
            let mut payload = line.as_bytes().to_vec();
            payload.push(b'\n');
            let write = async {
                pipe.write_all(&payload).await?;
                pipe.flush().await
            };
            match tokio::time::timeout(INPUT_WRITE_TIMEOUT, write).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    *stdin = None;
                    return Err(SupervisorError::NotRunning);
                }
                Err(_) => return Err(SupervisorError::NotRunning),
            }
        }
        self.logs.input(format!("$ {}", line));
        Ok(())
    }

    /// Terminate the supervised process tree, if any. Never fails.
    ///
    /// When another `stop` is already in progress this waits for that
    /// process to exit (bounded by both escalation phases) instead of
    /// returning early, so callers can rely on the workspace being released.
    pub async fn stop(&self) -> Termination {
        let starting_deadline = tokio::time::Instant::now() + self.stop_grace;
        let (generation, pid, kill_tx, mut exited) = loop {
            let mut slot = self.slot.lock().await;
            let current = std::mem::replace(&mut *slot, Slot::Idle);
            match current {
                Slot::Running(live) => {
                    *slot = Slot::Terminating {
                        generation: live.generation,
                        pid: live.pid,
                        exited: live.exited.clone(),
                    };
                    // Dropping stdin closes the pipe along with the signal.
                    break (live.generation, live.pid, live.kill_tx, live.exited);
                }
                Slot::Terminating {
                    generation,
                    pid,
                    exited,
                } => {
                    let mut pending = exited.clone();
                    *slot = Slot::Terminating {
                        generation,
                        pid,
                        exited,
                    };
                    drop(slot);
                    let _ = tokio::time::timeout(self.stop_grace * 2, pending.wait_for(Option::is_some)).await;
                    return Termination::AlreadyGone;
                }
                Slot::Starting if tokio::time::Instant::now() < starting_deadline => {
                    *slot = Slot::Starting;
                    drop(slot);
                    tokio::time::sleep(STARTING_POLL).await;
                }
                other => {
                    *slot = other;
                    return Termination::AlreadyGone;
                }
            }
        };

        self.logs.warn("Stopping previous process...");
        let outcome = terminate_tree(pid, false, &kill_tx);

        let exited_in_time = tokio::time::timeout(self.stop_grace, exited.wait_for(Option::is_some))
            .await
            .is_ok();
        if !exited_in_time {
            tracing::warn!(?pid, "process ignored SIGTERM, forcing kill");
            terminate_tree(pid, true, &kill_tx);
            let _ = tokio::time::timeout(self.stop_grace, exited.wait_for(Option::is_some)).await;
        }

        let mut slot = self.slot.lock().await;
        if slot.generation() == Some(generation) {
            *slot = Slot::Idle;
        }
        outcome
    }
}

async fn drain_readers(readers: [Option<JoinHandle<()>>; 2]) {
    let drain = async {
        for reader in readers.into_iter().flatten() {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!("output pipes still open after exit; continuing");
    }
}
