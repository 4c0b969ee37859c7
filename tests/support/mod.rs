use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use procmon::{Pid, ProcessDelegate, ProcessMessage};

/// Process-wide serialization for tests that fork, attach, or reap. The
/// monitor's wait loop targets a process group, so concurrently traced
/// children sharing the harness group could steal each other's statuses.
#[allow(unused)]
pub fn serial_guard() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();

    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

#[derive(Default)]
struct State {
    events: Vec<ProcessMessage>,
    threads: HashSet<i32>,
    initial_stops: HashSet<i32>,
}

/// A [`ProcessDelegate`] that records everything the monitor tells it.
#[derive(Default)]
pub struct Recorder {
    state: Mutex<State>,
    cond: Condvar,
}

#[allow(unused)]
impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProcessMessage> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.state.lock().unwrap().threads.len()
    }

    pub fn initial_stop_seen(&self, tid: Pid) -> bool {
        self.state.lock().unwrap().initial_stops.contains(&tid.as_raw())
    }

    /// Blocks until at least `count` recorded events satisfy `pred`.
    pub fn wait_for_count<F>(&self, pred: F, count: usize, timeout: Duration) -> bool
    where
        F: Fn(&ProcessMessage) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            if state.events.iter().filter(|message| pred(message)).count() >= count {
                return true;
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };

            let (next, timed_out) = self.cond.wait_timeout(state, remaining).unwrap();
            state = next;

            if timed_out.timed_out() {
                return state.events.iter().filter(|message| pred(message)).count() >= count;
            }
        }
    }

    /// Blocks until some recorded event satisfies `pred`, returning it.
    pub fn wait_for_message<F>(&self, pred: F, timeout: Duration) -> Option<ProcessMessage>
    where
        F: Fn(&ProcessMessage) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(message) = state.events.iter().find(|message| pred(message)) {
                return Some(*message);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (next, timed_out) = self.cond.wait_timeout(state, remaining).unwrap();
            state = next;

            if timed_out.timed_out() {
                return state.events.iter().find(|message| pred(message)).copied();
            }
        }
    }
}

impl ProcessDelegate for Recorder {
    fn send_message(&self, message: ProcessMessage) {
        eprintln!("message: {message:?}");

        self.state.lock().unwrap().events.push(message);
        self.cond.notify_all();
    }

    fn create_thread(&self, tid: Pid) {
        eprintln!("create thread: {tid}");

        self.state.lock().unwrap().threads.insert(tid.as_raw());
        self.cond.notify_all();
    }

    fn add_thread_for_initial_stop_if_needed(&self, tid: Pid) {
        self.state.lock().unwrap().initial_stops.insert(tid.as_raw());
        self.cond.notify_all();
    }

    fn thread_exists(&self, tid: Pid) -> bool {
        self.state.lock().unwrap().threads.contains(&tid.as_raw())
    }
}
