use std::{
    env,
    path::PathBuf,
    sync::Arc,
};

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::Endpoint,
    error::SupervisorError,
    inherit::Inheritor,
    pidfile::PidFile,
    server::{Server, ServerSet, StopKind},
    signal::{SignalEvent, SignalQueue},
};

/// Lifecycle state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum State {
    /// Listeners are open and accepting.
    Running,
    /// Listeners are closed; registrations idle awaiting a re-listen.
    Ready,
    /// Terminal; every server has been asked to stop.
    Stopped,
}

/// Whether the controller loop keeps pulling signals or returns.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

/// Keeps registered servers listening on stable addresses across the whole
/// process lifecycle, including zero-downtime binary upgrades.
///
/// One supervisor per process: it owns the signal surface. Register servers,
/// then call [`serve`](Supervisor::serve); from there the process is driven
/// entirely by signals (TERM, QUIT, USR1, USR2, HUP).
pub struct Supervisor {
    procname: PathBuf,
    workdir: PathBuf,
    pidfile_override: Option<PathBuf>,
    pid: libc::pid_t,
    child: Option<libc::pid_t>,
    state: State,
    inheritor: Inheritor,
    servers: ServerSet,
}

impl Supervisor {
    /// Creates a supervisor with defaults: procname is the current
    /// executable, the working directory is the current one, and the PID
    /// file is `<workdir>/<procname>.pid`. If this process was started as
    /// an upgrade successor, the inherited listener table is decoded here.
    pub fn new() -> Result<Self, SupervisorError> {
        let procname = env::current_exe()?;
        let workdir = env::current_dir()?;
        let inheritor = Inheritor::from_env()?;

        Ok(Self {
            procname,
            workdir,
            pidfile_override: None,
            pid: unsafe { libc::getpid() },
            child: None,
            state: State::Stopped,
            inheritor,
            servers: ServerSet::new(),
        })
    }

    /// Overrides the executable spawned on upgrade.
    pub fn with_procname(mut self, procname: impl Into<PathBuf>) -> Self {
        self.procname = procname.into();
        self
    }

    /// Overrides the working directory used for the successor process and
    /// for the default PID file location.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Overrides the PID file path.
    pub fn with_pidfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.pidfile_override = Some(path.into());
        self
    }

    /// Registers a server against an endpoint. A server may be registered
    /// against multiple endpoints; each registration is independent. All
    /// registration happens before [`serve`](Supervisor::serve), which
    /// borrows the supervisor for its entire runtime.
    pub fn register(&mut self, server: Arc<dyn Server>, endpoint: Endpoint) {
        debug!(%endpoint, "registering server");
        self.servers.register(server, endpoint);
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The supervisor's own process id.
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Writes the PID file, starts every registered server, and blocks
    /// handling signals until a terminating signal arrives.
    ///
    /// Failures before the first pass completes (initial bind, PID write)
    /// are returned; everything after that is logged and the supervisor
    /// keeps its invariants, waiting for an operator signal.
    pub fn serve(&mut self) -> Result<(), SupervisorError> {
        info!(pid = self.pid, "supervisor serving");
        self.pidfile_handle().write(self.pid)?;

        self.servers.start_all(&mut self.inheritor)?;
        self.state = State::Running;

        let mut queue = SignalQueue::bind().map_err(SupervisorError::Signals)?;
        info!("waiting for signals");

        loop {
            let event = queue.next();
            info!(?event, "got signal");
            if self.handle_event(event) == Flow::Exit {
                return Ok(());
            }
        }
    }

    /// Applies one control event. All side effects complete before the next
    /// event is pulled.
    pub(crate) fn handle_event(&mut self, event: SignalEvent) -> Flow {
        match event {
            SignalEvent::Terminate => {
                match self.servers.stop_all(StopKind::Immediate) {
                    Ok(()) => self.state = State::Stopped,
                    Err(err) => error!("stop failed: {err}"),
                }
                Flow::Exit
            }

            SignalEvent::Quit => {
                match self.servers.stop_all(StopKind::Graceful) {
                    Ok(()) => self.state = State::Stopped,
                    Err(err) => error!("graceful stop failed: {err}"),
                }
                Flow::Exit
            }

            SignalEvent::ToggleListen => {
                match self.state {
                    State::Running => {
                        self.servers.close_listeners();
                        self.inheritor.reset();
                        self.state = State::Ready;
                        info!("listeners closed; supervisor idling");
                    }
                    State::Ready => {
                        // No accept loop may outlive its listener generation.
                        self.servers.wait_accept_loops();
                        match self.servers.start_all(&mut self.inheritor) {
                            Ok(()) => {
                                self.state = State::Running;
                                info!("listeners reopened");
                            }
                            Err(err) => error!("failed to reopen listeners: {err}"),
                        }
                    }
                    State::Stopped => {}
                }
                Flow::Continue
            }

            SignalEvent::Upgrade => {
                if let Err(err) = self.upgrade() {
                    error!("upgrade binary failed: {err}");
                }
                Flow::Continue
            }

            SignalEvent::UpgradeAndQuit => {
                if let Err(err) = self.upgrade() {
                    // Keep serving; the old binary is all there is.
                    error!("upgrade binary failed: {err}");
                    return Flow::Continue;
                }
                match self.servers.stop_all(StopKind::Graceful) {
                    Ok(()) => {
                        self.state = State::Stopped;
                        Flow::Exit
                    }
                    Err(err) => {
                        error!("graceful stop failed: {err}");
                        Flow::Continue
                    }
                }
            }

            SignalEvent::ChildExit => {
                self.reap_child();
                Flow::Continue
            }
        }
    }

    /// Spawns the successor, handing the PID file path over by renaming the
    /// record aside first. The rename back happens only if the child exits
    /// (see [`reap_child`]) or the spawn itself fails.
    fn upgrade(&mut self) -> Result<(), SupervisorError> {
        let pidfile = self.pidfile_handle();
        if let Err(err) = pidfile.stash() {
            warn!("failed to move pid file aside: {err}");
        }

        match self
            .inheritor
            .start_successor(&self.procname, &self.workdir)
        {
            Ok(child) => {
                self.child = Some(child);
                Ok(())
            }
            Err(err) => {
                // No child will ever exit to trigger recovery.
                if let Err(restore_err) = pidfile.restore() {
                    warn!("failed to recover pid file: {restore_err}");
                }
                Err(err)
            }
        }
    }

    /// Reaps the spawned successor and recovers the PID file. SIGCHLD for
    /// anything other than the recorded successor is ignored, as are state
    /// changes that are not exits.
    fn reap_child(&mut self) {
        let Some(child) = self.child else {
            debug!("ignoring SIGCHLD with no successor in flight");
            return;
        };

        match waitpid(Pid::from_raw(child), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                debug!(child, "successor still alive; ignoring SIGCHLD");
                return;
            }
            Ok(status @ WaitStatus::Exited(..))
            | Ok(status @ WaitStatus::Signaled(..)) => {
                info!(child, ?status, "successor exited");
            }
            Ok(other) => {
                debug!(child, ?other, "ignoring successor state change");
                return;
            }
            Err(err) => {
                // Reap failed; still attempt the PID file recovery.
                error!(child, "failed to reap successor: {err}");
            }
        }

        self.child = None;
        if let Err(err) = self.pidfile_handle().restore() {
            error!("failed to recover pid file: {err}");
        }
    }

    fn pidfile_handle(&self) -> PidFile {
        match &self.pidfile_override {
            Some(path) => PidFile::new(path),
            None => {
                let basename = self
                    .procname
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "evergreen".into());
                PidFile::new(self.workdir.join(format!("{basename}.pid")))
            }
        }
    }
}
