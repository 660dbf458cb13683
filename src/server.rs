use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info};

use crate::{
    endpoint::{Endpoint, Listener},
    error::SupervisorError,
    inherit::Inheritor,
};

/// The entire contract between the supervisor and supervised code.
///
/// Implementations accept on the provided listener until it closes or
/// [`stop`](Server::stop) is called. `stop` force-closes immediately;
/// [`graceful_stop`](Server::graceful_stop) drains in-flight work first.
/// One server value may be registered against several endpoints; its
/// methods must tolerate concurrent accept loops.
pub trait Server: Send + Sync {
    /// Runs the accept loop on `listener` until shutdown.
    fn serve(&self, listener: Listener) -> io::Result<()>;

    /// Stops serving immediately, severing in-flight connections.
    fn stop(&self) -> io::Result<()>;

    /// Stops accepting and drains in-flight connections before returning.
    fn graceful_stop(&self) -> io::Result<()>;
}

/// How a stop fan-out should treat in-flight connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    Immediate,
    Graceful,
}

/// One registered `(server, endpoint)` pair and its current listener.
///
/// The listener slot is empty before the first `serve` pass and between
/// episodes; it is repopulated on every re-listen.
struct Registration {
    server: Arc<dyn Server>,
    endpoint: Endpoint,
    listener: Option<Listener>,
}

/// Drives all registered servers through their lifecycles in lockstep.
pub(crate) struct ServerSet {
    registrations: Vec<Registration>,
    /// Signalled before listeners close so accept loops can tell an
    /// intentional teardown from a genuine accept failure. Replaced on
    /// every new episode.
    done: Arc<AtomicBool>,
    accept_loops: Vec<JoinHandle<()>>,
}

impl ServerSet {
    pub(crate) fn new() -> Self {
        Self {
            registrations: Vec::new(),
            done: Arc::new(AtomicBool::new(false)),
            accept_loops: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, server: Arc<dyn Server>, endpoint: Endpoint) {
        self.registrations.push(Registration {
            server,
            endpoint,
            listener: None,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.len()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Binds every registration through the inheritor and launches one
    /// accept loop per registration. A bind failure aborts the pass with
    /// earlier listeners already installed; the caller decides whether to
    /// tear down.
    pub(crate) fn start_all(
        &mut self,
        inheritor: &mut Inheritor,
    ) -> Result<(), SupervisorError> {
        self.done = Arc::new(AtomicBool::new(false));

        for registration in &mut self.registrations {
            let listener = inheritor.listen(&registration.endpoint)?;
            let accept_handle =
                listener
                    .try_clone()
                    .map_err(|source| SupervisorError::Bind {
                        endpoint: registration.endpoint.to_string(),
                        source,
                    })?;
            info!(
                endpoint = %registration.endpoint,
                addr = %listener.local_addr_string(),
                "listening"
            );
            registration.listener = Some(listener);

            let server = Arc::clone(&registration.server);
            let endpoint = registration.endpoint.clone();
            let done = Arc::clone(&self.done);
            self.accept_loops.push(thread::spawn(move || {
                if let Err(err) = server.serve(accept_handle) {
                    if done.load(Ordering::SeqCst) {
                        debug!(%endpoint, "accept loop ended by intentional teardown");
                    } else {
                        error!(%endpoint, "serve failed: {err}");
                    }
                }
            }));
        }

        Ok(())
    }

    /// Signals the done predicate, then stops every server in registration
    /// order. The first failure short-circuits the fan-out.
    pub(crate) fn stop_all(&mut self, kind: StopKind) -> Result<(), SupervisorError> {
        self.done.store(true, Ordering::SeqCst);

        for registration in &self.registrations {
            let result = match kind {
                StopKind::Immediate => registration.server.stop(),
                StopKind::Graceful => registration.server.graceful_stop(),
            };
            result.map_err(|source| SupervisorError::Stop {
                endpoint: registration.endpoint.to_string(),
                source,
            })?;
        }

        Ok(())
    }

    /// Closes the listeners of the current episode without touching the
    /// servers; their accept loops observe the closure and unwind. The done
    /// predicate is signalled before the first close.
    pub(crate) fn close_listeners(&mut self) {
        self.done.store(true, Ordering::SeqCst);

        for registration in &mut self.registrations {
            if let Some(listener) = registration.listener.take() {
                if let Err(err) = listener.shutdown() {
                    error!(
                        endpoint = %registration.endpoint,
                        "failed to close listener: {err}"
                    );
                }
            }
        }
    }

    /// Blocks until every accept loop of the current episode has returned.
    pub(crate) fn wait_accept_loops(&mut self) {
        for handle in self.accept_loops.drain(..) {
            if handle.join().is_err() {
                error!("accept loop thread panicked");
            }
        }
    }
}
