//! Process Supervisor
//!
//! Keeps exactly one child process alive for a launch spec. A process that
//! exits, crashes or fails to spawn is started again after a fixed minimum
//! delay, forever; restarts are only reported through logs and events.
//!
//! ```text
//!   start() ─▶ spawn ─▶ Started ─▶ wait ─┬─ exit(0) ──▶ Exited ──┐
//!                ▲                       ├─ exit(!0) ─▶ Crashed ─┤
//!                │                       ├─ kill_current ▶ Crashed
//!                └──── restart_delay ◀───┴───────────────────────┘
//!
//!   stop() ─▶ SIGTERM ─▶ wait(stop_grace) ─▶ SIGKILL ─▶ Stopped
//! ```
//!
//! Each spawned process gets a new `generation` number so consumers can tell
//! events (and kill requests) for one incarnation from the next.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 256;

/// Restart and shutdown timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Minimum sleep between a process ending and the next spawn
    pub restart_delay: Duration,
    /// How long a stopping process gets after SIGTERM before SIGKILL
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Set the restart delay
    #[must_use]
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Set the stop grace period
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Short timings for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            restart_delay: Duration::from_millis(50),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// How to launch the supervised process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Spec running `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Which pipe an output line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Lifecycle events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A process was spawned
    Started {
        /// Incarnation number, starting at 1
        generation: u64,
        /// OS process id
        pid: u32,
    },
    /// A line of process output
    Output {
        /// Incarnation number
        generation: u64,
        /// Source pipe
        stream: OutputStream,
        /// Line without terminator
        line: String,
    },
    /// The process exited on its own with success
    Exited {
        /// Incarnation number
        generation: u64,
    },
    /// The process failed to spawn, exited with failure, or was killed
    Crashed {
        /// Incarnation number
        generation: u64,
        /// Human readable cause
        reason: String,
    },
    /// Supervision ended after `stop()`
    Stopped,
}

/// Supervises one child process
pub struct Supervisor {
    name: String,
    spec: ProcessSpec,
    config: SupervisorConfig,
    events: broadcast::Sender<SupervisorEvent>,
    stop_tx: watch::Sender<bool>,
    kill_tx: mpsc::UnboundedSender<(u64, String)>,
    kill_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, String)>>>,
    pid: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("program", &self.spec.program)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Prepare a supervisor; nothing runs until [`Supervisor::start`]
    pub fn new(name: impl Into<String>, spec: ProcessSpec, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop_tx, _) = watch::channel(false);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            spec,
            config,
            events,
            stop_tx,
            kill_tx,
            kill_rx: Mutex::new(Some(kill_rx)),
            pid: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to lifecycle events; subscribe before `start` to see the first spawn
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Begin supervising; a second call is a no-op
    pub fn start(&self) {
        let Some(kill_rx) = self.kill_rx.lock().take() else {
            return;
        };
        let monitor = Monitor {
            name: self.name.clone(),
            spec: self.spec.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            stop_rx: self.stop_tx.subscribe(),
            kill_rx,
            pid: Arc::clone(&self.pid),
        };
        *self.task.lock() = Some(tokio::spawn(monitor.run()));
    }

    /// Pid of the running process, if any
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Kill incarnation `generation` if it is still the running one
    ///
    /// The loop treats this as a crash and restarts the process.
    pub fn kill_current(&self, generation: u64, reason: impl Into<String>) {
        let _ = self.kill_tx.send((generation, reason.into()));
    }

    /// Stop supervising and wait for the process to exit
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(process = %self.name, error = %e, "Supervisor task failed");
            }
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Killed(String),
    StopRequested,
}

struct Monitor {
    name: String,
    spec: ProcessSpec,
    config: SupervisorConfig,
    events: broadcast::Sender<SupervisorEvent>,
    stop_rx: watch::Receiver<bool>,
    kill_rx: mpsc::UnboundedReceiver<(u64, String)>,
    pid: Arc<AtomicU32>,
}

impl Monitor {
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn run(mut self) {
        let mut generation = 0u64;

        while !self.stop_requested() {
            generation += 1;

            match spawn_child(&self.spec) {
                Err(e) => {
                    tracing::warn!(
                        process = %self.name,
                        program = %self.spec.program.display(),
                        error = %e,
                        "Failed to spawn process"
                    );
                    self.emit(SupervisorEvent::Crashed {
                        generation,
                        reason: format!("spawn failed: {e}"),
                    });
                }
                Ok(child) => {
                    if self.supervise(child, generation).await {
                        break;
                    }
                }
            }

            tracing::debug!(
                process = %self.name,
                delay_ms = self.config.restart_delay.as_millis() as u64,
                "Restarting after delay"
            );
            tokio::select! {
                () = tokio::time::sleep(self.config.restart_delay) => {}
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.emit(SupervisorEvent::Stopped);
        tracing::info!(process = %self.name, "Supervision stopped");
    }

    /// Watch one incarnation; returns true when supervision should end
    async fn supervise(&mut self, mut child: Child, generation: u64) -> bool {
        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        tracing::info!(process = %self.name, pid, generation, "Process started");
        self.emit(SupervisorEvent::Started { generation, pid });

        if let Some(stdout) = child.stdout.take() {
            self.pipe_output(stdout, OutputStream::Stdout, generation);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pipe_output(stderr, OutputStream::Stderr, generation);
        }

        let outcome = loop {
            tokio::select! {
                status = child.wait() => break Outcome::Exited(status),
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break Outcome::StopRequested;
                    }
                }
                Some((target, reason)) = self.kill_rx.recv() => {
                    if target == generation {
                        break Outcome::Killed(reason);
                    }
                }
            }
        };

        let stop = match outcome {
            Outcome::Exited(Ok(status)) if status.success() => {
                tracing::info!(process = %self.name, generation, "Process exited");
                self.emit(SupervisorEvent::Exited { generation });
                false
            }
            Outcome::Exited(Ok(status)) => {
                tracing::warn!(process = %self.name, generation, %status, "Process crashed");
                self.emit(SupervisorEvent::Crashed {
                    generation,
                    reason: status.to_string(),
                });
                false
            }
            Outcome::Exited(Err(e)) => {
                tracing::warn!(process = %self.name, generation, error = %e, "Lost track of process");
                self.emit(SupervisorEvent::Crashed {
                    generation,
                    reason: e.to_string(),
                });
                false
            }
            Outcome::Killed(reason) => {
                tracing::warn!(process = %self.name, generation, %reason, "Killing process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(process = %self.name, error = %e, "Kill failed");
                }
                self.emit(SupervisorEvent::Crashed { generation, reason });
                false
            }
            Outcome::StopRequested => {
                terminate(&self.name, &mut child, self.config.stop_grace).await;
                true
            }
        };

        self.pid.store(0, Ordering::SeqCst);
        stop
    }

    fn pipe_output<R>(&self, reader: R, stream: OutputStream, generation: u64)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match stream {
                    OutputStream::Stdout => tracing::debug!(process = %name, "{line}"),
                    OutputStream::Stderr => tracing::warn!(process = %name, "{line}"),
                }
                let _ = events.send(SupervisorEvent::Output {
                    generation,
                    stream,
                    line,
                });
            }
        });
    }
}

fn spawn_child(spec: &ProcessSpec) -> std::io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.spawn()
}

/// SIGTERM, then SIGKILL once `grace` has passed
async fn terminate(name: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            tracing::debug!(process = %name, error = %e, "SIGTERM failed");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(process = %name, %status, "Process stopped");
        }
        Ok(Err(e)) => {
            tracing::warn!(process = %name, error = %e, "Wait failed during stop");
        }
        Err(_) => {
            tracing::warn!(process = %name, "Grace period expired, killing process");
            if let Err(e) = child.kill().await {
                tracing::warn!(process = %name, error = %e, "Kill failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_matching(
        rx: &mut broadcast::Receiver<SupervisorEvent>,
        pred: impl Fn(&SupervisorEvent) -> bool,
    ) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for supervisor event")
    }

    #[tokio::test]
    async fn test_restarts_after_exit() {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("echo hello");
        let sup = Supervisor::new("exiter", spec, SupervisorConfig::for_testing());
        let mut events = sup.subscribe();
        sup.start();

        let line = next_matching(&mut events, |e| matches!(e, SupervisorEvent::Output { .. })).await;
        assert!(matches!(line, SupervisorEvent::Output { ref line, .. } if line == "hello"));

        // The second incarnation proves the restart happened
        next_matching(&mut events, |e| {
            matches!(e, SupervisorEvent::Started { generation: 2, .. })
        })
        .await;

        sup.stop().await;
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn test_crash_reported_with_status() {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("exit 3");
        let sup = Supervisor::new("crasher", spec, SupervisorConfig::for_testing());
        let mut events = sup.subscribe();
        sup.start();

        let crashed =
            next_matching(&mut events, |e| matches!(e, SupervisorEvent::Crashed { .. })).await;
        assert!(matches!(crashed, SupervisorEvent::Crashed { generation: 1, .. }));
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_terminates_long_running_process() {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("sleep 30");
        let sup = Supervisor::new("sleeper", spec, SupervisorConfig::for_testing());
        let mut events = sup.subscribe();
        sup.start();

        next_matching(&mut events, |e| matches!(e, SupervisorEvent::Started { .. })).await;
        assert!(sup.pid().is_some());

        tokio::time::timeout(Duration::from_secs(5), sup.stop())
            .await
            .expect("stop should finish within the grace period");
        next_matching(&mut events, |e| matches!(e, SupervisorEvent::Stopped)).await;
    }

    #[tokio::test]
    async fn test_kill_current_counts_as_crash() {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("sleep 30");
        let sup = Supervisor::new("killed", spec, SupervisorConfig::for_testing());
        let mut events = sup.subscribe();
        sup.start();

        next_matching(&mut events, |e| matches!(e, SupervisorEvent::Started { generation: 1, .. })).await;
        // A stale generation is ignored
        sup.kill_current(7, "stale");
        sup.kill_current(1, "registration deadline");

        let crashed =
            next_matching(&mut events, |e| matches!(e, SupervisorEvent::Crashed { .. })).await;
        assert_eq!(
            crashed,
            SupervisorEvent::Crashed {
                generation: 1,
                reason: "registration deadline".to_string()
            }
        );
        next_matching(&mut events, |e| matches!(e, SupervisorEvent::Started { generation: 2, .. })).await;
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_retried() {
        let spec = ProcessSpec::new("/nonexistent/keyhub-module");
        let sup = Supervisor::new("missing", spec, SupervisorConfig::for_testing());
        let mut events = sup.subscribe();
        sup.start();

        next_matching(&mut events, |e| matches!(e, SupervisorEvent::Crashed { generation: 2, .. })).await;
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let spec = ProcessSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo $KEYHUB_TEST_VALUE; sleep 30")
            .env("KEYHUB_TEST_VALUE", "from-env");
        let sup = Supervisor::new("env", spec, SupervisorConfig::for_testing());
        let mut events = sup.subscribe();
        sup.start();

        let line = next_matching(&mut events, |e| matches!(e, SupervisorEvent::Output { .. })).await;
        assert!(matches!(line, SupervisorEvent::Output { ref line, .. } if line == "from-env"));
        sup.stop().await;
    }
}
