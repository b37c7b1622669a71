//! Rate limiting for change notifications.
//!
//! Bursty activity (daemon output, repeated status flips) must not flood the
//! bus. Each call either emits immediately (leading edge, at most once per
//! second) or schedules a deferred check that emits only if no newer call
//! superseded it (trailing edge, 200 ms after activity ceases).

use uuid::Uuid;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::event::{Bus, Kind};

/// Minimum spacing between emissions while activity is continuous.
const EMIT_FLOOR: Duration = Duration::from_secs(1);
/// Delay after the last call before the trailing emission fires.
const TRAILING_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct Coalescer {
    bus: Bus,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    last_emit: Option<Instant>,
    current: Option<Uuid>,
}

impl Coalescer {
    pub fn new(bus: Bus) -> Self {
        Coalescer {
            bus,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn notify(&self, kind: Kind, resource_id: Option<&str>) {
        let deferred = {
            let mut state = lock(&self.state);
            let now = Instant::now();
            if state
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= EMIT_FLOOR)
            {
                state.last_emit = Some(now);
                state.current = None;
                None
            } else {
                let token = Uuid::new_v4();
                state.current = Some(token);
                Some(token)
            }
        };

        let Some(token) = deferred else {
            self.bus.emit(kind, resource_id);
            return;
        };

        let coalescer = self.clone();
        let resource_id = resource_id.map(str::to_string);
        thread::spawn(move || {
            thread::sleep(TRAILING_DELAY);
            let superseded = {
                let mut state = lock(&coalescer.state);
                if state.current == Some(token) {
                    state.last_emit = Some(Instant::now());
                    state.current = None;
                    false
                } else {
                    true
                }
            };
            if !superseded {
                coalescer.bus.emit(kind, resource_id.as_deref());
            }
        });
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crossbeam_channel::Receiver;

    fn drain_until_quiet(receiver: &Receiver<Event>, quiet: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.recv_timeout(quiet) {
            events.push(event);
        }
        events
    }

    #[test]
    fn first_call_emits_immediately() {
        let (bus, receiver) = Bus::channel();
        let coalescer = Coalescer::new(bus);

        coalescer.notify(Kind::ServerOutputUpdated, Some("srv"));
        let event = receiver
            .recv_timeout(Duration::from_millis(50))
            .expect("leading edge emission");
        assert_eq!(event.kind, Kind::ServerOutputUpdated);
        assert_eq!(event.resource_id.as_deref(), Some("srv"));
    }

    #[test]
    fn rapid_calls_collapse_to_trailing_emission() {
        let (bus, receiver) = Bus::channel();
        let coalescer = Coalescer::new(bus);

        coalescer.notify(Kind::ServerOutputUpdated, None);
        // both fall inside the one second floor; only the last token survives
        coalescer.notify(Kind::ServerOutputUpdated, None);
        thread::sleep(Duration::from_millis(50));
        coalescer.notify(Kind::ServerOutputUpdated, None);

        let events = drain_until_quiet(&receiver, Duration::from_millis(600));
        assert_eq!(events.len(), 2, "one leading plus one trailing emission");
    }

    #[test]
    fn burst_emissions_are_bounded() {
        let (bus, receiver) = Bus::channel();
        let coalescer = Coalescer::new(bus);

        // ~1.3 s of continuous activity
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(1300) {
            coalescer.notify(Kind::ServerOutputUpdated, None);
            thread::sleep(Duration::from_millis(10));
        }

        let events = drain_until_quiet(&receiver, Duration::from_millis(600));
        assert!(!events.is_empty(), "a burst must emit at least once");
        assert!(
            events.len() <= 3,
            "burst of 1.3s must emit at most ceil(T)+1 times, got {}",
            events.len()
        );
    }
}
