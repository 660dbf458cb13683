use std::{
    fs::{self, OpenOptions},
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use crate::error::PidFileError;

/// The supervisor's identity record on disk.
///
/// Holds the decimal pid of the live supervisor. During an upgrade the file
/// is renamed aside to `<pidfile>.old` so the successor can claim the
/// canonical path; the parent renames it back only if the successor dies.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates a handle for the given path. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The canonical PID file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shadow path used while an upgrade handshake is in flight.
    pub fn old_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".old");
        PathBuf::from(os)
    }

    /// Writes `pid` in decimal ASCII, creating the file with mode 0644.
    pub fn write(&self, pid: libc::pid_t) -> Result<(), PidFileError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(PidFileError::WriteError)?;
        file.write_all(pid.to_string().as_bytes())
            .map_err(PidFileError::WriteError)
    }

    /// Reads the recorded pid back.
    pub fn read(&self) -> Result<libc::pid_t, PidFileError> {
        let contents = fs::read_to_string(&self.path).map_err(PidFileError::ReadError)?;
        contents
            .trim()
            .parse::<libc::pid_t>()
            .map_err(|_| PidFileError::ParseError)
    }

    /// Moves the record aside to `<pidfile>.old`, reserving the canonical
    /// path for a successor.
    pub fn stash(&self) -> Result<(), PidFileError> {
        fs::rename(&self.path, self.old_path()).map_err(PidFileError::RenameError)
    }

    /// Moves `<pidfile>.old` back to the canonical path after a failed
    /// upgrade.
    pub fn restore(&self) -> Result<(), PidFileError> {
        fs::rename(self.old_path(), &self.path).map_err(PidFileError::RenameError)
    }
}
