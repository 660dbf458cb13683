use std::{
    fs,
    io::{Read, Write},
    thread,
    time::Duration,
};

use nix::sys::signal::Signal;
use predicates::prelude::*;
use tempfile::tempdir;

use crate::common::{
    KillOnDrop, free_port, process_alive, spawn_daemon, wait_for_connect, wait_for_pid,
    wait_process_gone,
};

#[test]
fn usr2_spawns_successor_and_child_exit_recovers_pidfile() {
    let temp = tempdir().expect("tempdir");
    let mut daemon = spawn_daemon(temp.path(), free_port(), "");
    let parent = daemon.pid();
    assert_eq!(
        wait_for_pid(&daemon.pidfile, Duration::from_secs(5), |pid| pid == parent),
        parent
    );

    daemon.signal(Signal::SIGUSR2);

    // The successor claims the canonical pid file path with its own pid.
    let successor = wait_for_pid(&daemon.pidfile, Duration::from_secs(10), |pid| {
        pid != parent
    });
    let _successor_guard = KillOnDrop(successor);
    assert!(process_alive(parent), "parent must keep serving after USR2");
    assert!(process_alive(successor));

    // The parent's identity survives in the shadow copy.
    let old_path = temp.path().join("evergreend.pid.old");
    let stashed: i32 = fs::read_to_string(&old_path)
        .expect("stashed pid file")
        .trim()
        .parse()
        .expect("stashed pid");
    assert_eq!(stashed, parent);

    // Service continues throughout.
    let mut conn = wait_for_connect(&daemon.addr(), Duration::from_secs(5));
    conn.write_all(b"mid-upgrade\n").expect("write");
    let mut buf = [0u8; 12];
    conn.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"mid-upgrade\n");
    drop(conn);

    // When the successor dies, the parent reaps it and takes its identity
    // back.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(successor), Signal::SIGTERM)
        .expect("terminate successor");
    wait_for_pid(&daemon.pidfile, Duration::from_secs(10), |pid| pid == parent);
    assert!(!old_path.exists(), "shadow copy should be gone after recovery");
    assert!(process_alive(parent));

    daemon.signal(Signal::SIGTERM);
    let status = daemon.wait_exit(Duration::from_secs(10)).expect("exit");
    assert!(status.success());
}

#[test]
fn hup_hands_over_listeners_and_quits() {
    let temp = tempdir().expect("tempdir");
    let mut daemon = spawn_daemon(temp.path(), free_port(), "");
    let parent = daemon.pid();
    let addr = daemon.addr();

    daemon.signal(Signal::SIGHUP);

    let status = daemon
        .wait_exit(Duration::from_secs(10))
        .expect("parent should exit after handing over");
    assert!(status.success());

    // The successor owns the pid file and the listening socket now.
    let successor = wait_for_pid(&daemon.pidfile, Duration::from_secs(10), |pid| {
        pid != parent
    });
    let _successor_guard = KillOnDrop(successor);
    assert!(process_alive(successor));

    let mut conn = wait_for_connect(&addr, Duration::from_secs(5));
    conn.write_all(b"new binary\n").expect("write");
    let mut buf = [0u8; 11];
    conn.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"new binary\n");
    drop(conn);

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(successor), Signal::SIGTERM)
        .expect("terminate successor");
    wait_process_gone(successor, Duration::from_secs(10));
}

#[test]
fn failed_upgrade_keeps_parent_serving() {
    let temp = tempdir().expect("tempdir");
    let mut daemon = spawn_daemon(
        temp.path(),
        free_port(),
        "procname: /nonexistent/evergreend-upgraded\n",
    );
    let parent = daemon.pid();

    daemon.signal(Signal::SIGHUP);
    thread::sleep(Duration::from_millis(500));

    // The graceful stop was skipped; the old binary is all there is.
    assert!(
        daemon.wait_exit(Duration::from_millis(1)).is_none(),
        "parent must survive a failed upgrade"
    );
    let mut conn = wait_for_connect(&daemon.addr(), Duration::from_secs(5));
    conn.write_all(b"still old\n").expect("write");
    let mut buf = [0u8; 10];
    conn.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"still old\n");
    drop(conn);

    // The identity record points back at the surviving parent.
    assert_eq!(
        wait_for_pid(&daemon.pidfile, Duration::from_secs(5), |pid| pid == parent),
        parent
    );

    let log = daemon.stderr_contents();
    assert!(
        predicate::str::contains("upgrade binary failed").eval(&log),
        "missing upgrade failure in log:\n{log}"
    );

    daemon.signal(Signal::SIGTERM);
    let status = daemon.wait_exit(Duration::from_secs(10)).expect("exit");
    assert!(status.success());
}
