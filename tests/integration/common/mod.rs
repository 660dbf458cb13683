#![allow(dead_code)]

use std::{
    fs,
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};

/// Give the daemon a moment between "listener answers" and "signal handlers
/// registered"; signals delivered in that window would be dropped.
pub const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// A spawned `evergreend` process plus the paths the test will inspect.
pub struct Daemon {
    pub child: Child,
    pub pidfile: PathBuf,
    pub port: u16,
    pub stderr_log: PathBuf,
}

impl Daemon {
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.pid()), signal).expect("failed to signal daemon");
    }

    /// Polls for process exit, returning `None` on timeout.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn stderr_contents(&self) -> String {
        fs::read_to_string(&self.stderr_log).unwrap_or_default()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Best-effort cleanup for processes the test did not spawn directly
/// (upgrade successors are children of the daemon, not of the test).
pub struct KillOnDrop(pub i32);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = kill(Pid::from_raw(self.0), Signal::SIGKILL);
    }
}

/// Reserves an ephemeral port. The listener is dropped before returning, so
/// the daemon can bind the same port immediately afterwards.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to reserve a port")
        .local_addr()
        .expect("failed to read reserved addr")
        .port()
}

/// Writes an `evergreend` config and spawns the daemon on `port`, waiting
/// until it accepts connections. `extra` is appended verbatim to the config.
pub fn spawn_daemon(dir: &Path, port: u16, extra: &str) -> Daemon {
    let pidfile = dir.join("evergreend.pid");
    let config_path = dir.join("evergreen.yaml");
    fs::write(
        &config_path,
        format!(
            "listeners:\n  - \"tcp:127.0.0.1:{port}\"\npidfile: {pidfile}\n{extra}",
            pidfile = pidfile.display(),
        ),
    )
    .expect("failed to write config");

    let stderr_log = dir.join("evergreend.log");
    let stderr = fs::File::create(&stderr_log).expect("failed to create log file");

    let child = Command::new(assert_cmd::cargo::cargo_bin!("evergreend"))
        .arg("--config")
        .arg(&config_path)
        .arg("--log-level")
        .arg("debug")
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(stderr)
        .spawn()
        .expect("failed to spawn evergreend");

    let daemon = Daemon {
        child,
        pidfile,
        port,
        stderr_log,
    };
    drop(wait_for_connect(&daemon.addr(), Duration::from_secs(10)));
    thread::sleep(STARTUP_GRACE);
    daemon
}

/// Connects to `addr`, retrying until the deadline.
pub fn wait_for_connect(addr: &str, timeout: Duration) -> TcpStream {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => panic!("timed out connecting to {addr}: {err}"),
        }
    }
}

/// Waits until connections to `addr` are refused.
pub fn wait_for_refused(addr: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(addr).is_err() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("{addr} still accepts connections");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits until the PID file parses and satisfies `pred`, returning the pid.
pub fn wait_for_pid(pidfile: &Path, timeout: Duration, pred: impl Fn(i32) -> bool) -> i32 {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(contents) = fs::read_to_string(pidfile) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if pred(pid) {
                    return pid;
                }
            }
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting on pid file {pidfile:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Whether a process with `pid` still exists.
pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Waits until the process with `pid` is gone.
pub fn wait_process_gone(pid: i32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            panic!("process {pid} still alive");
        }
        thread::sleep(Duration::from_millis(50));
    }
}
