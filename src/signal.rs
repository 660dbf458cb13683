use std::io;

use signal_hook::{
    consts::signal::{SIGCHLD, SIGHUP, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2},
    iterator::Signals,
};

/// The controller's command vocabulary, decoded from the process signal
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalEvent {
    /// SIGTERM: stop immediately.
    Terminate,
    /// SIGQUIT: stop after draining in-flight connections.
    Quit,
    /// SIGUSR1: close listeners while staying alive, or reopen them.
    ToggleListen,
    /// SIGUSR2: spawn an upgraded successor and keep serving.
    Upgrade,
    /// SIGHUP: spawn an upgraded successor, then gracefully stop.
    UpgradeAndQuit,
    /// SIGCHLD: a child process changed state.
    ChildExit,
}

impl SignalEvent {
    fn from_raw(signal: i32) -> Option<Self> {
        match signal {
            SIGTERM => Some(SignalEvent::Terminate),
            SIGQUIT => Some(SignalEvent::Quit),
            SIGUSR1 => Some(SignalEvent::ToggleListen),
            SIGUSR2 => Some(SignalEvent::Upgrade),
            SIGHUP => Some(SignalEvent::UpgradeAndQuit),
            SIGCHLD => Some(SignalEvent::ChildExit),
            _ => None,
        }
    }
}

/// Blocking queue of control signals.
///
/// Registration is process-wide; signals arriving while the controller is
/// busy are buffered (and coalesced by the kernel) and drained in order.
pub(crate) struct SignalQueue {
    signals: Signals,
}

impl SignalQueue {
    /// Registers handlers for the whole control surface.
    pub(crate) fn bind() -> io::Result<Self> {
        let signals =
            Signals::new([SIGTERM, SIGQUIT, SIGUSR1, SIGUSR2, SIGHUP, SIGCHLD])?;
        Ok(Self { signals })
    }

    /// Blocks until the next control signal arrives.
    pub(crate) fn next(&mut self) -> SignalEvent {
        loop {
            for raw in self.signals.wait() {
                if let Some(event) = SignalEvent::from_raw(raw) {
                    return event;
                }
            }
        }
    }
}
