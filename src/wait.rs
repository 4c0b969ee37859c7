//! The wait thread.
//!
//! `waitpid(2)` has no non-blocking variant that preserves event order, so a
//! dedicated thread blocks on the inferior's process group and hands every
//! state change to a callback. The callback returns true to request that
//! monitoring stop. Shutdown interrupts the blocking wait with a directed
//! `SIGUSR1`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::Result;

/// Invoked for every state change the kernel reports, as
/// `(pid, exited, signal, status)`. Returning true stops monitoring.
pub(crate) type MonitorCallback = dyn FnMut(Pid, bool, i32, i32) -> bool + Send;

pub(crate) struct ChildMonitor {
    thread: Option<JoinHandle<()>>,
    shared: Arc<MonitorShared>,
}

struct MonitorShared {
    stop: AtomicBool,
    pthread: Mutex<Option<Pthread>>,
}

extern "C" fn wake_handler(_: libc::c_int) {}

/// No `SA_RESTART`: the handler exists so a directed signal surfaces as
/// EINTR out of `waitpid`.
fn install_wake_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(wake_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe { sigaction(Signal::SIGUSR1, &action) }.map(drop)
}

impl ChildMonitor {
    /// Spawns the wait thread over the process group `pgid`.
    pub(crate) fn start(pgid: Pid, callback: Box<MonitorCallback>) -> Result<Self> {
        let shared = Arc::new(MonitorShared {
            stop: AtomicBool::new(false),
            pthread: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("procmon-wait".into())
            .spawn(move || serve(pgid, &thread_shared, callback))?;

        Ok(Self {
            thread: Some(thread),
            shared,
        })
    }

    /// Interrupts the wait thread and joins it. Idempotent in effect: a
    /// thread that already stopped joins immediately.
    pub(crate) fn stop(mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            while !thread.is_finished() {
                let registered = self
                    .shared
                    .pthread
                    .lock()
                    .map(|slot| *slot)
                    .unwrap_or(None);

                if let Some(pthread) = registered {
                    let _ = pthread_kill(pthread, Signal::SIGUSR1);
                }

                thread::sleep(Duration::from_millis(1));
            }

            let _ = thread.join();
        }
    }
}

fn serve(pgid: Pid, shared: &MonitorShared, mut callback: Box<MonitorCallback>) {
    if let Err(errno) = install_wake_handler() {
        warn!(target: "process", "could not install wait-thread wake handler: {errno}");
    }

    if let Ok(mut slot) = shared.pthread.lock() {
        *slot = Some(pthread_self());
    }

    let target = Pid::from_raw(-pgid.as_raw());

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        match waitpid(target, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                debug!(target: "process", "no children left in group {pgid}");
                break;
            }
            Err(errno) => {
                warn!(target: "process", "waitpid({target}) failed: {errno}");
                break;
            }
            Ok(status) => {
                if dispatch(status, &mut callback) {
                    debug!(target: "process", "callback requested monitor stop");
                    break;
                }
            }
        }
    }
}

fn dispatch(status: WaitStatus, callback: &mut Box<MonitorCallback>) -> bool {
    match status {
        WaitStatus::Exited(pid, code) => callback(pid, true, 0, code),
        WaitStatus::Signaled(pid, signal, _core_dumped) => {
            callback(pid, true, signal as i32, signal as i32)
        }
        WaitStatus::Stopped(pid, signal) => callback(pid, false, signal as i32, 0),
        WaitStatus::PtraceEvent(pid, signal, _event) => callback(pid, false, signal as i32, 0),
        WaitStatus::PtraceSyscall(pid) => callback(pid, false, libc::SIGTRAP, 0),
        WaitStatus::StillAlive | WaitStatus::Continued(_) => false,
    }
}
