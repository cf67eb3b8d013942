use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};

use crate::error::CommandError;
use crate::events::EventQueue;
use crate::results::log_path;
use crate::types::{ProgramName, RunId, RunKey, RunStatus};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub archives_dir: PathBuf,
    pub data_dir: PathBuf,
    pub interpreter: Option<String>, // None executes the entry point itself
    pub entry_point: String,
    pub timeout: Duration,
    pub poll_samples: u32,
    pub reap_timeout: Duration,
    pub memory_limit_kb: Option<u64>,
    pub cpu_time_limit_secs: Option<u64>,
}

impl SupervisorConfig {
    /// Liveness sampling period: the timeout budget split into `poll_samples` slices.
    pub fn poll_interval(&self) -> Duration {
        let interval = self.timeout / self.poll_samples.max(1);
        interval.max(Duration::from_millis(1))
    }
}

/// Snapshot of the supervisor flags. Published through a watch channel so readers never
/// see a half-applied transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub last_run_was_killed: bool,
    pub current: Option<RunKey>,
}

/// Exclusive handle on the active child. Only the watchdog holds the `Child`; this side
/// can ask it to terminate, never signal or reap the process directly.
struct ProcessHandle {
    pid: Option<u32>,
    run: RunKey,
    stop: oneshot::Sender<()>,
}

struct Inner {
    config: SupervisorConfig,
    status: watch::Sender<SupervisorStatus>,
    active: Mutex<Option<ProcessHandle>>,
    events: EventQueue,
}

/// Runs at most one program at a time, each under a watchdog that enforces the timeout.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Stopped,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, events: EventQueue) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            inner: Arc::new(Inner {
                config,
                status,
                active: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventQueue {
        &self.inner.events
    }

    pub fn status(&self) -> SupervisorStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.borrow().running
    }

    pub fn last_run_was_killed(&self) -> bool {
        self.inner.status.borrow().last_run_was_killed
    }

    /// Program of the active run, if any.
    pub fn active_program(&self) -> Option<ProgramName> {
        self.inner
            .status
            .borrow()
            .current
            .as_ref()
            .map(|run| run.program.clone())
    }

    /// Pid of the active child, if any.
    pub async fn active_pid(&self) -> Option<u32> {
        if !self.is_running() {
            return None;
        }
        self.inner.active.lock().await.as_ref().and_then(|h| h.pid)
    }

    /// Starts `program` with `run_id` as its only argument and hands it to a watchdog.
    /// Returns once the process is launched, not when it finishes.
    pub async fn execute(
        &self,
        program: &ProgramName,
        run_id: &RunId,
    ) -> Result<(), CommandError> {
        let mut active = self.inner.active.lock().await;
        if self.is_running() {
            tracing::warn!(
                "refusing to execute {}:{}, a program is already running",
                program,
                run_id
            );
            return Err(CommandError::AlreadyRunning);
        }

        let run = RunKey::new(program.clone(), run_id.clone());
        let child = match self.spawn(&run) {
            Ok(child) => child,
            Err(e) => {
                counter!("executions_total", "outcome" => "launch_failed").increment(1);
                tracing::error!("failed to launch {}: {}", run, e);
                return Err(e);
            }
        };
        let pid = child.id();
        tracing::info!(
            "executing {} as pid {:?} with timeout {:?}",
            run,
            pid,
            self.inner.config.timeout
        );

        let (stop, stop_rx) = oneshot::channel();
        self.inner.status.send_modify(|status| {
            status.running = true;
            status.last_run_was_killed = false;
            status.current = Some(run.clone());
        });
        gauge!("program_running").set(1.0);

        *active = Some(ProcessHandle {
            pid,
            run: run.clone(),
            stop,
        });
        tokio::spawn(watchdog(self.inner.clone(), child, run, stop_rx));

        Ok(())
    }

    fn spawn(&self, run: &RunKey) -> Result<Child, CommandError> {
        let config = &self.inner.config;
        let launch_failed = |e: std::io::Error| CommandError::ProcessLaunchFailed(e.to_string());

        let program_dir = config.archives_dir.join(run.program.as_str());
        let entry = program_dir.join(&config.entry_point);
        if !entry.is_file() {
            return Err(CommandError::ProcessLaunchFailed(format!(
                "entry point {} not found",
                entry.display()
            )));
        }

        fs::create_dir_all(&config.data_dir).map_err(launch_failed)?;
        let log_file = log_path(&config.data_dir, &run.program, &run.run_id);
        let log = File::create(&log_file).map_err(launch_failed)?;

        self.launch(run, &program_dir, &entry, log).map_err(|e| {
            if let Err(rm) = fs::remove_file(&log_file) {
                tracing::warn!("failed to remove log {}: {}", log_file.display(), rm);
            }
            launch_failed(e)
        })
    }

    fn launch(
        &self,
        run: &RunKey,
        program_dir: &Path,
        entry: &Path,
        log: File,
    ) -> std::io::Result<Child> {
        let config = &self.inner.config;
        let log_err = log.try_clone()?;

        let mut cmd = match &config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&config.entry_point);
                cmd
            }
            None => Command::new(fs::canonicalize(entry)?),
        };

        cmd.arg(run.run_id.as_str())
            .current_dir(program_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(true);

        let limits = (config.memory_limit_kb, config.cpu_time_limit_secs);
        if limits != (None, None) {
            // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
            unsafe {
                cmd.pre_exec(move || apply_limits(limits.0, limits.1));
            }
        }

        cmd.spawn()
    }

    /// Terminates the active run and waits until the watchdog has reaped it.
    pub async fn stop(&self) -> Result<(), CommandError> {
        let mut active = self.inner.active.lock().await;
        if !self.is_running() {
            tracing::info!("stop requested but no program is running");
            return Err(CommandError::NotRunning);
        }
        let Some(handle) = active.take() else {
            return Err(CommandError::NotRunning);
        };

        tracing::info!("stopping {} (pid {:?})", handle.run, handle.pid);
        let _ = handle.stop.send(());
        self.wait_idle().await;

        // holding `active` keeps a new run from starting, so the flag belongs to this run
        if !self.last_run_was_killed() {
            tracing::info!("{} exited on its own before it could be stopped", handle.run);
            return Err(CommandError::NotRunning);
        }
        Ok(())
    }

    /// Resolves once no program is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|status| !status.running).await;
    }
}

fn apply_limits(
    memory_limit_kb: Option<u64>,
    cpu_time_limit_secs: Option<u64>,
) -> std::io::Result<()> {
    let set = |resource, value: u64| {
        let limit = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: plain syscall on a stack value.
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    };

    if let Some(kb) = memory_limit_kb {
        set(libc::RLIMIT_AS, kb.saturating_mul(1024))?;
    }
    if let Some(secs) = cpu_time_limit_secs {
        set(libc::RLIMIT_CPU, secs)?;
    }
    Ok(())
}

/// Sends `signal` to the child's whole process group. Signalling a group that is already
/// gone is not an error.
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("failed to signal process group {}: {}", pid, err);
        }
    }
}

/// SIGTERM, then SIGKILL if the child is not reaped within `reap_timeout`.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    reap_timeout: Duration,
) -> Option<ExitStatus> {
    signal_group(pid, libc::SIGTERM);
    if let Ok(Ok(status)) = time::timeout(reap_timeout, child.wait()).await {
        return Some(status);
    }

    tracing::warn!("pid {:?} survived SIGTERM, escalating to SIGKILL", pid);
    signal_group(pid, libc::SIGKILL);
    let _ = child.start_kill();
    match time::timeout(reap_timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::error!("failed to reap pid {:?}: {}", pid, e);
            None
        }
        Err(_) => {
            tracing::error!("pid {:?} not reaped after SIGKILL", pid);
            None
        }
    }
}

/// Owns the child for its whole life. Samples liveness every poll interval, kills it once
/// the timeout is spent or a stop is requested, and is the only place `running` goes back
/// to false.
async fn watchdog(
    inner: Arc<Inner>,
    mut child: Child,
    run: RunKey,
    mut stop_rx: oneshot::Receiver<()>,
) {
    // child.id() is gone once the leader is reaped; the group id outlives it
    let pid = child.id();
    let started = Instant::now();
    let deadline = started + inner.config.timeout;
    let mut ticker = time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ending = loop {
        tokio::select! {
            status = child.wait() => break Ending::Exited(status),
            _ = &mut stop_rx => break Ending::Stopped,
            _ = ticker.tick() => {
                if Instant::now() >= deadline {
                    break Ending::TimedOut;
                }
            }
        }
    };

    let (exit_status, killed) = match ending {
        Ending::Exited(Ok(status)) => (Some(status), false),
        Ending::Exited(Err(e)) => {
            tracing::error!("failed to wait for {}: {}", run, e);
            (terminate(&mut child, pid, inner.config.reap_timeout).await, true)
        }
        Ending::TimedOut => {
            tracing::warn!(
                "{} exceeded its timeout of {:?}, terminating",
                run,
                inner.config.timeout
            );
            (terminate(&mut child, pid, inner.config.reap_timeout).await, true)
        }
        Ending::Stopped => {
            tracing::warn!("{} stopped on request, terminating", run);
            (terminate(&mut child, pid, inner.config.reap_timeout).await, true)
        }
    };
    // descendants left in the group die with the run, however it ended
    signal_group(pid, libc::SIGKILL);

    let wall_time = started.elapsed();
    let exit_code = exit_status.and_then(|s| s.code());
    tracing::info!(
        "{} finished after {:?} (exit code {:?}, killed: {})",
        run,
        wall_time,
        exit_code,
        killed
    );
    let outcome = if killed { "killed" } else { "exited" };
    counter!("executions_total", "outcome" => outcome).increment(1);
    histogram!("execution_wall_time_ms").record(wall_time.as_millis() as f64);

    let finished = RunStatus {
        program: run.program.clone(),
        run_id: run.run_id.clone(),
        exit_code,
        killed,
        wall_time_ms: wall_time.as_millis() as u64,
    };
    if let Err(e) = inner.events.push(finished) {
        tracing::error!("failed to record completion of {}: {}", run, e);
    }

    inner.status.send_modify(|status| {
        status.running = false;
        status.last_run_was_killed = killed;
        status.current = None;
    });
    gauge!("program_running").set(0.0);
}
