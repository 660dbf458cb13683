use std::{
    env, io,
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
    process::Command,
};

use nix::{
    fcntl::{FcntlArg, FdFlag, fcntl},
    unistd::{close, dup2},
};
use tracing::{debug, info};

use crate::{
    endpoint::{Endpoint, Listener},
    error::SupervisorError,
};

/// Environment variable carrying the number of inherited descriptors.
pub const LISTEN_FDS_ENV: &str = "EVERGREEN_LISTEN_FDS";

/// Environment variable carrying the ordered endpoint identities, one
/// rendered endpoint per descriptor, separated by `;`.
pub const LISTEN_NAMES_ENV: &str = "EVERGREEN_LISTEN_NAMES";

/// Inherited descriptors occupy this fd onward, in envelope order.
const INHERITED_FD_START: RawFd = 3;

/// One descriptor handed down by the parent process, adoptable at most once.
#[derive(Debug)]
struct InheritedEntry {
    endpoint: Endpoint,
    fd: RawFd,
    consumed: bool,
}

/// A dup of a listener this process currently serves on, kept so the
/// descriptor can be re-passed to a successor.
#[derive(Debug)]
struct TrackedListener {
    endpoint: Endpoint,
    handle: Listener,
}

/// Obtains listening sockets, either fresh or inherited across exec, and
/// hands the open set to a successor process on upgrade.
///
/// The inheritor caches a duplicate of every listener it has produced. When
/// the supervisor closes listeners behind its back (the listen toggle), the
/// cache must be discarded with [`reset`](Inheritor::reset) or the next
/// upgrade would pass dead descriptors.
#[derive(Debug)]
pub struct Inheritor {
    inherited: Vec<InheritedEntry>,
    tracked: Vec<TrackedListener>,
}

impl Inheritor {
    /// Builds the inheritance table from the envelope left by a parent
    /// process, if any. The envelope variables are scrubbed so they do not
    /// leak into unrelated children.
    pub fn from_env() -> Result<Self, SupervisorError> {
        let count_raw = env::var(LISTEN_FDS_ENV).ok();
        let names_raw = env::var(LISTEN_NAMES_ENV).ok();
        if count_raw.is_some() || names_raw.is_some() {
            unsafe {
                env::remove_var(LISTEN_FDS_ENV);
                env::remove_var(LISTEN_NAMES_ENV);
            }
        }

        let endpoints = match (count_raw, names_raw) {
            (Some(count), Some(names)) => parse_envelope(&count, &names)?,
            (None, None) => Vec::new(),
            _ => {
                return Err(SupervisorError::Inherit(format!(
                    "{LISTEN_FDS_ENV} and {LISTEN_NAMES_ENV} must be set together"
                )));
            }
        };

        let mut inherited = Vec::with_capacity(endpoints.len());
        for (index, endpoint) in endpoints.into_iter().enumerate() {
            let fd = INHERITED_FD_START + index as RawFd;
            if fcntl(fd, FcntlArg::F_GETFD).is_err() {
                return Err(SupervisorError::Inherit(format!(
                    "descriptor {fd} for '{endpoint}' is not open"
                )));
            }
            // Keep the descriptor from leaking further until it is
            // deliberately re-passed by start_successor.
            let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
            inherited.push(InheritedEntry {
                endpoint,
                fd,
                consumed: false,
            });
        }

        if !inherited.is_empty() {
            info!(count = inherited.len(), "inherited listeners from parent");
        }

        Ok(Self {
            inherited,
            tracked: Vec::new(),
        })
    }

    #[cfg(test)]
    fn with_inherited(entries: Vec<(Endpoint, RawFd)>) -> Self {
        Self {
            inherited: entries
                .into_iter()
                .map(|(endpoint, fd)| InheritedEntry {
                    endpoint,
                    fd,
                    consumed: false,
                })
                .collect(),
            tracked: Vec::new(),
        }
    }

    /// Returns a listener for the endpoint, preferring a matching inherited
    /// descriptor over a fresh bind. Either way the descriptor is tracked
    /// for the next upgrade.
    pub fn listen(&mut self, endpoint: &Endpoint) -> Result<Listener, SupervisorError> {
        let listener = match self.take_inherited(endpoint) {
            Some(fd) => {
                debug!(%endpoint, fd, "adopting inherited listener");
                unsafe { Listener::from_inherited_fd(endpoint, fd) }
            }
            None => {
                debug!(%endpoint, "binding fresh listener");
                Listener::bind(endpoint).map_err(|source| SupervisorError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                })?
            }
        };

        let handle = listener
            .try_clone()
            .map_err(|source| SupervisorError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        self.tracked.push(TrackedListener {
            endpoint: endpoint.clone(),
            handle,
        });

        Ok(listener)
    }

    /// Takes the first unconsumed inherited descriptor whose endpoint
    /// matches, in the order the parent declared them.
    fn take_inherited(&mut self, endpoint: &Endpoint) -> Option<RawFd> {
        let entry = self
            .inherited
            .iter_mut()
            .find(|entry| !entry.consumed && entry.endpoint == *endpoint)?;
        entry.consumed = true;
        Some(entry.fd)
    }

    /// Number of listeners currently tracked for hand-off.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Fork-and-execs a new instance of `procname` in `workdir`, re-passing
    /// every tracked listener. Descriptors are remapped to 3..3+n in the
    /// child, and the envelope names them positionally. Returns the child's
    /// pid; the caller is responsible for reaping it.
    pub fn start_successor(
        &mut self,
        procname: &Path,
        workdir: &Path,
    ) -> Result<libc::pid_t, SupervisorError> {
        let names = self
            .tracked
            .iter()
            .map(|tracked| tracked.endpoint.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let fds: Vec<RawFd> = self
            .tracked
            .iter()
            .map(|tracked| tracked.handle.as_raw_fd())
            .collect();

        let mut command = Command::new(procname);
        command
            .args(env::args_os().skip(1))
            .current_dir(workdir)
            .env(LISTEN_FDS_ENV, fds.len().to_string())
            .env(LISTEN_NAMES_ENV, names);

        let remap = fds.clone();
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(move || remap_fds(&remap));
        }

        let child = command.spawn().map_err(SupervisorError::Upgrade)?;
        info!(
            child = child.id(),
            listeners = fds.len(),
            procname = %procname.display(),
            "successor process started"
        );
        Ok(child.id() as libc::pid_t)
    }

    /// Discards all tracked listeners. Must be called after the supervisor
    /// closes listeners outside the inheritor's knowledge, otherwise the
    /// next upgrade would pass already-closed descriptors.
    pub fn reset(&mut self) {
        debug!(discarded = self.tracked.len(), "resetting inheritance table");
        self.tracked.clear();
    }
}

/// Moves the listener descriptors to the conventional 3..3+n window.
///
/// Runs between fork and exec, so only async-signal-safe calls are allowed.
/// Every source is first duplicated above the window so a dup2 into the
/// window can never clobber a source that has not been copied yet.
fn remap_fds(fds: &[RawFd]) -> io::Result<()> {
    let floor = INHERITED_FD_START + fds.len() as RawFd;

    let mut staged = Vec::with_capacity(fds.len());
    for &fd in fds {
        let tmp = fcntl(fd, FcntlArg::F_DUPFD(floor)).map_err(io::Error::from)?;
        staged.push(tmp);
    }

    for (index, &tmp) in staged.iter().enumerate() {
        let target = INHERITED_FD_START + index as RawFd;
        // dup2 leaves close-on-exec clear on the target, which is exactly
        // what the successor needs.
        dup2(tmp, target).map_err(io::Error::from)?;
        let _ = close(tmp);
    }

    Ok(())
}

/// Decodes the envelope variable pair into the ordered endpoint list.
fn parse_envelope(count: &str, names: &str) -> Result<Vec<Endpoint>, SupervisorError> {
    let count: usize = count.trim().parse().map_err(|_| {
        SupervisorError::Inherit(format!("{LISTEN_FDS_ENV} is not a number: '{count}'"))
    })?;

    let endpoints = if names.is_empty() {
        Vec::new()
    } else {
        names
            .split(';')
            .map(str::parse)
            .collect::<Result<Vec<Endpoint>, _>>()?
    };

    if endpoints.len() != count {
        return Err(SupervisorError::Inherit(format!(
            "{LISTEN_FDS_ENV} says {count} descriptors but {LISTEN_NAMES_ENV} names {}",
            endpoints.len()
        )));
    }

    Ok(endpoints)
}
