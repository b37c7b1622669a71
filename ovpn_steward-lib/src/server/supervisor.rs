//! Supervision of the spawned daemon: output capture, the status poll
//! loop, and teardown.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::coalescer::Coalescer;
use crate::event::{Bus, Kind};
use crate::firewall::Firewall;
use crate::registry::{Handshake, OutputBuffer, Phase, RuntimeRegistry};
use crate::status;

/// Interrupt poll cadence of the status worker.
const STATUS_TICK: Duration = Duration::from_millis(100);
/// The status file is consulted every this many ticks.
const STATUS_READ_TICKS: u32 = 10;

/// Everything a supervisor worker needs, snapshotted at start time.
#[derive(Clone)]
pub(crate) struct Worker {
    pub id: String,
    pub openvpn_bin: PathBuf,
    pub conf_path: PathBuf,
    pub status_path: PathBuf,
    pub network: String,
    pub local_networks: Vec<String>,
    pub registry: Arc<RuntimeRegistry>,
    pub firewall: Arc<Firewall>,
    pub bus: Bus,
    pub coalescer: Coalescer,
    pub handshake: Handshake,
    pub interrupt: Arc<AtomicBool>,
    pub output: OutputBuffer,
}

pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    match unsafe { libc::kill(pid as libc::pid_t, signal) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

pub(crate) fn spawn(worker: Worker) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("server-{}", worker.id))
        .spawn(move || run(worker))?;
    Ok(())
}

/// Removes the registry entry and interrupts the status worker on every
/// exit path of the supervisor, panics included.
struct Teardown {
    id: String,
    registry: Arc<RuntimeRegistry>,
    interrupt: Arc<AtomicBool>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

fn run(worker: Worker) {
    tracing::debug!(server_id = %worker.id, "starting daemon process");
    let _teardown = Teardown {
        id: worker.id.clone(),
        registry: worker.registry.clone(),
        interrupt: worker.interrupt.clone(),
    };

    {
        let status_worker = worker.clone();
        thread::spawn(move || status_loop(status_worker));
    }

    match spawn_daemon(&worker) {
        Ok(child) => supervise(&worker, child),
        Err(e) => {
            // the caller unblocks through the status worker's exit path,
            // after the registry entry is gone and nat rules are cleared
            tracing::error!(server_id = %worker.id, error = %e, "failed to start daemon process");
            worker
                .output
                .append_line(&format!("failed to start daemon process: {e}"));
            worker
                .coalescer
                .notify(Kind::ServerOutputUpdated, Some(&worker.id));
        }
    }
}

fn spawn_daemon(worker: &Worker) -> std::io::Result<Child> {
    Command::new(&worker.openvpn_bin)
        .arg(&worker.conf_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn supervise(worker: &Worker, mut child: Child) {
    worker.registry.set_pid(&worker.id, child.id());
    worker.registry.set_phase(&worker.id, Phase::Running);
    worker.handshake.fire();

    let stderr_reader = child.stderr.take().map(|stderr| {
        let stderr_worker = worker.clone();
        thread::spawn(move || stream_output(&stderr_worker, stderr))
    });
    if let Some(stdout) = child.stdout.take() {
        stream_output(worker, stdout);
    }
    if let Some(handle) = stderr_reader {
        let _ = handle.join();
    }

    match child.wait() {
        Ok(exit) => {
            tracing::debug!(server_id = %worker.id, code = ?exit.code(), "daemon process has ended")
        }
        Err(e) => tracing::warn!(server_id = %worker.id, error = %e, "failed reaping daemon process"),
    }
}

/// Append daemon output line by line; the reader blocks on the pipe, and
/// the iterator ending is the end-of-stream signal from the dying daemon.
fn stream_output<R: Read>(worker: &Worker, source: R) {
    for line in BufReader::new(source).lines() {
        match line {
            Ok(line) => {
                worker.output.append_line(&line);
                worker
                    .coalescer
                    .notify(Kind::ServerOutputUpdated, Some(&worker.id));
            }
            Err(e) => {
                tracing::warn!(server_id = %worker.id, error = %e, "failed reading daemon output");
                break;
            }
        }
    }
}

fn status_loop(worker: Worker) {
    let mut tick = 0u32;
    let mut client_count = 0usize;
    while !worker.interrupt.load(Ordering::SeqCst) {
        tick += 1;
        if tick == STATUS_READ_TICKS {
            tick = 0;
            let count = match status::read(&worker.status_path) {
                Ok(clients) => clients.len(),
                Err(e) => {
                    tracing::warn!(server_id = %worker.id, error = %e, "failed reading status file");
                    client_count
                }
            };
            if count != client_count {
                client_count = count;
                worker.bus.emit(Kind::UsersUpdated, None);
                worker.bus.emit(Kind::ServersUpdated, None);
            }
        }
        thread::sleep(STATUS_TICK);
    }

    if let Err(e) = worker
        .firewall
        .clear_rules(&worker.network, &worker.local_networks)
    {
        tracing::error!(server_id = %worker.id, error = %e, "failed clearing nat rules");
    }
    worker.handshake.fire();
}
