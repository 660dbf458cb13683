//! `evergreend`: a line-echo daemon kept alive by the continuous-serving
//! supervisor. Exists to demonstrate (and integration-test) the full signal
//! surface: graceful stop, listen toggling, and zero-downtime upgrades.

use std::{
    error::Error,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    os::unix::{io::AsRawFd, net::UnixStream},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use clap::Parser;
use serde::Deserialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use evergreen::{Endpoint, Listener, Server, Supervisor};

/// Command-line interface for evergreend.
#[derive(Parser)]
#[command(name = "evergreend", version, author)]
#[command(about = "Echo daemon with zero-downtime binary upgrades", long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults to `evergreen.yaml`).
    #[arg(short, long, default_value = "evergreen.yaml")]
    config: String,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
struct Config {
    /// Endpoints to serve on, rendered as `network:address`.
    listeners: Vec<String>,
    /// Optional executable spawned on upgrade; defaults to this binary.
    procname: Option<PathBuf>,
    /// Optional working directory; defaults to the current one.
    workdir: Option<PathBuf>,
    /// Optional PID file path; defaults to `<workdir>/<procname>.pid`.
    pidfile: Option<PathBuf>,
}

impl Config {
    fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    fn endpoints(&self) -> Result<Vec<Endpoint>, Box<dyn Error>> {
        self.listeners
            .iter()
            .map(|raw| raw.parse::<Endpoint>().map_err(Into::into))
            .collect()
    }
}

/// An accepted connection, kept so a hard stop can sever it.
enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    fn sever(&self) {
        match self {
            Conn::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Conn::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn raw_fd(&self) -> i32 {
        match self {
            Conn::Tcp(stream) => stream.as_raw_fd(),
            Conn::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

/// Echoes every byte back to the peer until EOF.
///
/// `stop` severs all in-flight connections immediately; `graceful_stop`
/// waits for them to finish on their own.
struct EchoServer {
    shutdown: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    conns: Arc<Mutex<Vec<Conn>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EchoServer {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            conns: Arc::new(Mutex::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn spawn_worker<S>(&self, stream: S, conn: Conn)
    where
        S: Read + Write + Send + 'static,
    {
        let fd = conn.raw_fd();
        self.conns.lock().unwrap().push(conn);

        let conns = Arc::clone(&self.conns);
        let handle = thread::spawn(move || {
            echo(stream);
            conns.lock().unwrap().retain(|c| c.raw_fd() != fd);
        });
        self.workers.lock().unwrap().push(handle);
    }

    fn accept_loop(&self, listener: &Listener) -> io::Result<()> {
        loop {
            match listener {
                Listener::Tcp(lis) => match lis.accept() {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let conn = Conn::Tcp(stream.try_clone()?);
                        self.spawn_worker(stream, conn);
                    }
                    Err(err) => return self.accept_result(err),
                },
                Listener::Unix(lis) => match lis.accept() {
                    Ok((stream, _)) => {
                        debug!("accepted unix connection");
                        let conn = Conn::Unix(stream.try_clone()?);
                        self.spawn_worker(stream, conn);
                    }
                    Err(err) => return self.accept_result(err),
                },
            }
        }
    }

    fn accept_result(&self, err: io::Error) -> io::Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn close_own_listeners(&self) {
        for listener in self.listeners.lock().unwrap().drain(..) {
            let _ = listener.shutdown();
        }
    }
}

impl Server for EchoServer {
    fn serve(&self, listener: Listener) -> io::Result<()> {
        let handle = listener.try_clone()?;
        let handle_fd = handle.as_raw_fd();
        self.listeners.lock().unwrap().push(handle);

        let result = self.accept_loop(&listener);

        // The registered handle must not outlive this episode, or the
        // address would stay bound after the supervisor closes its side.
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| l.as_raw_fd() != handle_fd);
        result
    }

    fn stop(&self) -> io::Result<()> {
        info!("echo server stopping immediately");
        self.shutdown.store(true, Ordering::SeqCst);
        self.close_own_listeners();
        for conn in self.conns.lock().unwrap().drain(..) {
            conn.sever();
        }
        Ok(())
    }

    fn graceful_stop(&self) -> io::Result<()> {
        info!("echo server draining connections");
        self.shutdown.store(true, Ordering::SeqCst);
        self.close_own_listeners();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }
}

fn echo<S: Read + Write>(mut stream: S) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = &args.log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    init_logging(&args);

    let config = Config::load(&args.config)?;
    let endpoints = config.endpoints()?;
    if endpoints.is_empty() {
        warn!("no listeners configured; exiting");
        return Ok(());
    }

    let mut supervisor = Supervisor::new()?;
    if let Some(procname) = &config.procname {
        supervisor = supervisor.with_procname(procname);
    }
    if let Some(workdir) = &config.workdir {
        supervisor = supervisor.with_workdir(workdir);
    }
    if let Some(pidfile) = &config.pidfile {
        supervisor = supervisor.with_pidfile(pidfile);
    }

    let echo = Arc::new(EchoServer::new());
    for endpoint in endpoints {
        supervisor.register(Arc::clone(&echo) as Arc<dyn Server>, endpoint);
    }

    supervisor.serve()?;
    info!(state = %supervisor.state(), "evergreend exited");
    Ok(())
}
