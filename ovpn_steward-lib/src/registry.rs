//! Runtime state shared between lifecycle callers and supervisor workers.
//!
//! All mutation funnels through [`RuntimeRegistry`]; nothing else holds maps
//! keyed by server id. The runtime entry proper (phase, pid, start time,
//! handshake, interrupt) is inserted at start and removed as a unit at
//! teardown. Output buffers and coalescer state live in side maps so the
//! last run's output stays readable after the daemon is gone.

use crossbeam_channel::{Receiver, Sender, bounded};

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::coalescer::Coalescer;
use crate::event::Bus;

/// Bound applied to every wait on a worker handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Re-armable synchronization point between a caller and the worker: the
/// worker fires it once the daemon is up (or provably not coming up), and
/// again once teardown has cleared the nat rules.
#[derive(Clone, Debug)]
pub struct Handshake {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl Handshake {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(1);
        Handshake { sender, receiver }
    }

    /// Never blocks; a pending, unconsumed signal is equivalent.
    pub fn fire(&self) {
        let _ = self.sender.try_send(());
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.receiver.recv_timeout(timeout).is_ok()
    }

    pub fn clear(&self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    pub fn append_line(&self, line: &str) {
        let mut buffer = lock(&self.0);
        buffer.push_str(line);
        buffer.push('\n');
    }

    pub fn read(&self) -> String {
        lock(&self.0).clone()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeState {
    pub phase: Phase,
    pub pid: Option<u32>,
    /// Epoch seconds; set to now - 1 so uptime reads ≥ 1 immediately.
    pub start_time: u64,
    pub handshake: Handshake,
    pub interrupt: Arc<AtomicBool>,
    pub output: OutputBuffer,
}

#[derive(Default)]
pub struct RuntimeRegistry {
    states: Mutex<HashMap<String, RuntimeState>>,
    outputs: Mutex<HashMap<String, OutputBuffer>>,
    coalescers: Mutex<HashMap<String, Coalescer>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, state: RuntimeState) {
        lock(&self.states).insert(id.to_string(), state);
    }

    pub fn remove(&self, id: &str) -> Option<RuntimeState> {
        lock(&self.states).remove(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.states).contains_key(id)
    }

    pub fn phase(&self, id: &str) -> Phase {
        lock(&self.states)
            .get(id)
            .map_or(Phase::Stopped, |state| state.phase)
    }

    pub fn set_phase(&self, id: &str, phase: Phase) {
        if let Some(state) = lock(&self.states).get_mut(id) {
            state.phase = phase;
        }
    }

    pub fn set_pid(&self, id: &str, pid: u32) {
        if let Some(state) = lock(&self.states).get_mut(id) {
            state.pid = Some(pid);
        }
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        lock(&self.states).get(id).and_then(|state| state.pid)
    }

    pub fn start_time(&self, id: &str) -> Option<u64> {
        lock(&self.states).get(id).map(|state| state.start_time)
    }

    pub fn handshake(&self, id: &str) -> Option<Handshake> {
        lock(&self.states).get(id).map(|state| state.handshake.clone())
    }

    /// The buffer outlives the runtime entry; reading a server that never
    /// ran yields an empty buffer.
    pub fn output(&self, id: &str) -> OutputBuffer {
        lock(&self.outputs)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    pub fn reset_output(&self, id: &str) {
        self.output(id).clear();
    }

    pub fn coalescer(&self, id: &str, bus: &Bus) -> Coalescer {
        lock(&self.coalescers)
            .entry(id.to_string())
            .or_insert_with(|| Coalescer::new(bus.clone()))
            .clone()
    }

    /// Serializes start/stop/force-stop on one server id.
    pub fn op_lock(&self, id: &str) -> Arc<Mutex<()>> {
        lock(&self.locks)
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
