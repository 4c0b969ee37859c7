//! The monitor proper: one owner thread for every ptrace request, one wait
//! thread for every child state change.
//!
//! Linux refuses ptrace requests from any task other than the one that
//! attached to (or forked) the tracee. The owner thread launches or attaches
//! during bootstrap and then serves [`Op`] values submitted through the
//! funnel, so the kernel only ever sees requests from that thread. The wait
//! thread (see [`crate::wait`]) blocks in `waitpid` on the inferior's
//! process group, classifies each wake-up into a [`ProcessMessage`], and
//! forwards it to the upstream process object. The two never synchronize
//! with each other beyond the funnel; callers needing post-event state must
//! order things upstream.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::personality::{self, Persona};
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, warn};

use crate::cmd::{ExecImage, ExecVectors, LaunchOptions};
use crate::error::{Error, Result};
use crate::message::{ProcessMessage, SI_KERNEL, SI_TKILL, SI_USER, TRAP_BRKPT, TRAP_HWBKPT, TRAP_TRACE};
use crate::op::{Op, Outcome};
use crate::pty::PseudoTerminal;
use crate::regs::RegisterValue;
use crate::wait::ChildMonitor;
use crate::{message::CrashReason, ptrace};

#[cfg(target_arch = "aarch64")]
use crate::aarch64::DebugRegisterKind;

/// The seam to the upstream process object.
///
/// [`send_message`](ProcessDelegate::send_message) is the one-way event
/// sink; the remaining callbacks let the upstream own its thread list while
/// the monitor drives when entries appear.
pub trait ProcessDelegate: Send + Sync {
    /// Deliver a lifecycle event. Called from the monitor's own threads, in
    /// kernel delivery order.
    fn send_message(&self, message: ProcessMessage);

    /// A task joined the traced set (initial task, attach, or clone);
    /// create its upstream handle.
    fn create_thread(&self, tid: Pid);

    /// The task's first SIGSTOP has been observed.
    fn add_thread_for_initial_stop_if_needed(&self, tid: Pid);

    /// Whether an upstream handle exists for the task.
    fn thread_exists(&self, tid: Pid) -> bool;
}

// Recognized child exit codes; the parent turns them into launch errors.
const EXIT_PTRACE_FAILED: i32 = 1;
const EXIT_DUP_STDIN_FAILED: i32 = 2;
const EXIT_DUP_STDOUT_FAILED: i32 = 3;
const EXIT_DUP_STDERR_FAILED: i32 = 4;
const EXIT_CHDIR_FAILED: i32 = 5;
const EXIT_EXEC_FAILED: i32 = 6;
const EXIT_SETGID_FAILED: i32 = 7;

fn launch_failure_reason(code: i32) -> &'static str {
    match code {
        EXIT_PTRACE_FAILED => "Child ptrace failed.",
        EXIT_DUP_STDIN_FAILED => "Child open stdin failed.",
        EXIT_DUP_STDOUT_FAILED => "Child open stdout failed.",
        EXIT_DUP_STDERR_FAILED => "Child open stderr failed.",
        EXIT_CHDIR_FAILED => "Child failed to set working directory.",
        EXIT_EXEC_FAILED => "Child exec failed.",
        EXIT_SETGID_FAILED => "Child setgid failed.",
        _ => "Child returned unknown exit status.",
    }
}

pub(crate) struct Envelope {
    op: Op,
    reply: mpsc::Sender<Result<Outcome>>,
}

/// The serialized rendezvous between caller threads and the owner thread.
///
/// The gate guarantees at most one operation in flight; holding it across
/// submit-and-wait gives per-caller program order and a total order across
/// callers. A disconnected endpoint after teardown surfaces as
/// [`Error::Disconnected`], never as a hang.
pub(crate) struct Funnel {
    gate: Mutex<mpsc::Sender<Envelope>>,
}

impl Funnel {
    fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            gate: Mutex::new(tx),
        }
    }

    pub(crate) fn submit(&self, op: Op) -> Result<Outcome> {
        let tx = self.gate.lock().map_err(|_| Error::Disconnected)?;

        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(Envelope { op, reply: reply_tx })
            .map_err(|_| Error::Disconnected)?;

        reply_rx.recv().map_err(|_| Error::Disconnected)?
    }
}

fn serve(pid: Pid, ops: &mpsc::Receiver<Envelope>) {
    while let Ok(Envelope { op, reply }) = ops.recv() {
        let exit = op.is_exit();
        let result = op.execute(pid);
        let _ = reply.send(result);

        if exit {
            break;
        }
    }
}

struct Inner {
    delegate: Arc<dyn ProcessDelegate>,
    funnel: Funnel,

    /// Tids whose first SIGSTOP has been observed. A freshly cloned thread
    /// raises two events in arbitrary order, the clone trap on its parent
    /// and its own SIGSTOP; the clone handler consults this set to decide
    /// whether it still has to wait for the latter.
    initial_stops: Arc<Mutex<HashSet<libc::pid_t>>>,

    /// The thread-group leader. Set once during bootstrap.
    pid: Pid,
}

/// Handle on a traced inferior.
///
/// Constructed by [`Monitor::launch`] or [`Monitor::attach`]. All operations
/// serialize through the funnel; events flow to the [`ProcessDelegate`]
/// concurrently. Dropping the monitor stops both threads and closes the
/// terminal; it does not kill or detach the inferior.
pub struct Monitor {
    inner: Arc<Inner>,
    op_thread: Option<JoinHandle<()>>,
    wait_thread: Option<ChildMonitor>,
    terminal_fd: Option<RawFd>,
}

enum Bootstrap {
    Launch(LaunchOptions),
    Attach(Pid),
}

impl Monitor {
    /// Forks and execs `options.program` under trace, with its stdio on a
    /// fresh pseudo-terminal unless redirected.
    pub fn launch(delegate: Arc<dyn ProcessDelegate>, options: LaunchOptions) -> Result<Self> {
        Self::start(delegate, Bootstrap::Launch(options))
    }

    /// Attaches to every task of the thread group led by `pid`.
    pub fn attach(delegate: Arc<dyn ProcessDelegate>, pid: Pid) -> Result<Self> {
        Self::start(delegate, Bootstrap::Attach(pid))
    }

    fn start(delegate: Arc<dyn ProcessDelegate>, bootstrap: Bootstrap) -> Result<Self> {
        let initial_stops = Arc::new(Mutex::new(HashSet::new()));

        let (op_tx, op_rx) = mpsc::channel();
        let (boot_tx, boot_rx) = mpsc::channel();

        let thread_delegate = Arc::clone(&delegate);
        let thread_stops = Arc::clone(&initial_stops);

        let op_thread = thread::Builder::new()
            .name("procmon-operation".into())
            .spawn(move || {
                let outcome = match bootstrap {
                    Bootstrap::Launch(options) => {
                        bootstrap_launch(&options, &*thread_delegate, &thread_stops)
                    }
                    Bootstrap::Attach(pid) => {
                        bootstrap_attach(pid, &*thread_delegate, &thread_stops)
                            .map(|pid| (pid, None))
                    }
                };

                match outcome {
                    Ok((pid, terminal_fd)) => {
                        if boot_tx.send(Ok((pid, terminal_fd))).is_ok() {
                            serve(pid, &op_rx);
                        }
                    }
                    Err(err) => {
                        let _ = boot_tx.send(Err(err));
                    }
                }
            })?;

        let (pid, terminal_fd) = match boot_rx.recv() {
            Ok(Ok(published)) => published,
            Ok(Err(err)) => {
                let _ = op_thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = op_thread.join();
                return Err(Error::Internal("owner thread died during bootstrap".into()));
            }
        };

        let inner = Arc::new(Inner {
            delegate,
            funnel: Funnel::new(op_tx),
            initial_stops,
            pid,
        });

        let pgid = unistd::getpgid(Some(pid)).unwrap_or(pid);
        let callback_inner = Arc::clone(&inner);
        let callback = Box::new(move |pid, exited, signal, status| {
            callback_inner.monitor_callback(pid, exited, signal, status)
        });

        let wait_thread = match ChildMonitor::start(pgid, callback) {
            Ok(wait_thread) => wait_thread,
            Err(err) => {
                let _ = inner.funnel.submit(Op::Exit);
                let _ = op_thread.join();
                if let Some(fd) = terminal_fd {
                    let _ = unistd::close(fd);
                }
                return Err(err);
            }
        };

        Ok(Self {
            inner,
            op_thread: Some(op_thread),
            wait_thread: Some(wait_thread),
            terminal_fd,
        })
    }

    /// The inferior's thread-group leader.
    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// Master side of the inferior's pseudo-terminal, in non-blocking mode.
    /// `None` for attached inferiors.
    pub fn terminal_fd(&self) -> Option<RawFd> {
        self.terminal_fd
    }

    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        match self.inner.funnel.submit(Op::ReadMemory {
            addr,
            len: buf.len(),
        })? {
            Outcome::Data(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            _ => internal_error!("mismatched reply for ReadMemory"),
        }
    }

    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        match self.inner.funnel.submit(Op::WriteMemory {
            addr,
            data: data.to_vec(),
        })? {
            Outcome::Transferred(written) => Ok(written),
            _ => internal_error!("mismatched reply for WriteMemory"),
        }
    }

    /// Reads a scalar register at a byte offset into the kernel's
    /// per-thread register layout. `name` is only used in diagnostics.
    pub fn read_register_value(
        &self,
        tid: Pid,
        offset: u64,
        name: &'static str,
    ) -> Result<RegisterValue> {
        match self.inner.funnel.submit(Op::ReadRegister { tid, offset, name })? {
            Outcome::Register(value) => Ok(value),
            _ => internal_error!("mismatched reply for ReadRegister"),
        }
    }

    pub fn write_register_value(
        &self,
        tid: Pid,
        offset: u64,
        name: &'static str,
        value: RegisterValue,
    ) -> Result<()> {
        self.inner.submit_done(Op::WriteRegister {
            tid,
            offset,
            name,
            value,
        })
    }

    pub fn read_gpr(&self, tid: Pid, buf: &mut [u8]) -> Result<()> {
        self.inner.read_into(Op::ReadGpr { tid, len: buf.len() }, buf)
    }

    pub fn write_gpr(&self, tid: Pid, buf: &[u8]) -> Result<()> {
        self.inner.submit_done(Op::WriteGpr {
            tid,
            data: buf.to_vec(),
        })
    }

    pub fn read_fpr(&self, tid: Pid, buf: &mut [u8]) -> Result<()> {
        self.inner.read_into(Op::ReadFpr { tid, len: buf.len() }, buf)
    }

    pub fn write_fpr(&self, tid: Pid, buf: &[u8]) -> Result<()> {
        self.inner.submit_done(Op::WriteFpr {
            tid,
            data: buf.to_vec(),
        })
    }

    pub fn read_register_set(&self, tid: Pid, buf: &mut [u8], set: u32) -> Result<()> {
        self.inner.read_into(
            Op::ReadRegisterSet {
                tid,
                len: buf.len(),
                set,
            },
            buf,
        )
    }

    pub fn write_register_set(&self, tid: Pid, buf: &[u8], set: u32) -> Result<()> {
        self.inner.submit_done(Op::WriteRegisterSet {
            tid,
            data: buf.to_vec(),
            set,
        })
    }

    pub fn read_thread_pointer(&self, tid: Pid) -> Result<u64> {
        match self.inner.funnel.submit(Op::ReadThreadPointer { tid })? {
            Outcome::ThreadPointer(addr) => Ok(addr),
            _ => internal_error!("mismatched reply for ReadThreadPointer"),
        }
    }

    /// Hardware watchpoint and breakpoint slot counts.
    #[cfg(target_arch = "aarch64")]
    pub fn read_hardware_debug_info(&self, tid: Pid) -> Result<(u32, u32)> {
        match self.inner.funnel.submit(Op::ReadHardwareDebugInfo { tid })? {
            Outcome::HardwareDebugInfo {
                watchpoints,
                breakpoints,
            } => Ok((watchpoints, breakpoints)),
            _ => internal_error!("mismatched reply for ReadHardwareDebugInfo"),
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn write_hardware_debug_regs(
        &self,
        tid: Pid,
        addrs: &[u64],
        ctrls: &[u32],
        kind: DebugRegisterKind,
    ) -> Result<()> {
        self.inner.submit_done(Op::WriteHardwareDebugRegs {
            tid,
            addrs: addrs.to_vec(),
            ctrls: ctrls.to_vec(),
            kind,
        })
    }

    /// Resumes a stopped task, delivering `signal` if given.
    pub fn resume(&self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        self.inner.resume(tid, signal)
    }

    /// Steps a stopped task over one instruction, delivering `signal` if
    /// given.
    pub fn single_step(&self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        self.inner.submit_done(Op::SingleStep { tid, signal })
    }

    pub fn get_signal_info(&self, tid: Pid) -> Result<libc::siginfo_t> {
        self.inner.get_signal_info(tid)
    }

    pub fn get_event_message(&self, tid: Pid) -> Result<u64> {
        self.inner.get_event_message(tid)
    }

    /// Detaches one task. Detaching a whole group is the caller's sequence.
    pub fn detach(&self, tid: Pid) -> Result<()> {
        self.inner.submit_done(Op::Detach { tid })
    }

    /// SIGKILLs the thread-group leader.
    pub fn kill(&self) -> Result<()> {
        signal::kill(self.inner.pid, Signal::SIGKILL)?;
        Ok(())
    }

    /// Quiesces a single task with a directed SIGSTOP, draining and
    /// forwarding events for other tasks until the target's stop (or its
    /// final Limbo/Exit) arrives. Returns false if the thread vanished
    /// first or the drain failed.
    pub fn stop_thread(&self, tid: Pid) -> bool {
        self.inner.stop_thread(tid)
    }

    fn stop_monitor(&mut self) {
        if let Some(wait_thread) = self.wait_thread.take() {
            wait_thread.stop();
        }

        if let Some(op_thread) = self.op_thread.take() {
            let _ = self.inner.funnel.submit(Op::Exit);
            let _ = op_thread.join();
        }

        if let Some(fd) = self.terminal_fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

impl Inner {
    fn submit_done(&self, op: Op) -> Result<()> {
        match self.funnel.submit(op)? {
            Outcome::Done => Ok(()),
            _ => internal_error!("mismatched reply for funneled operation"),
        }
    }

    fn read_into(&self, op: Op, buf: &mut [u8]) -> Result<()> {
        match self.funnel.submit(op)? {
            Outcome::Data(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(())
            }
            _ => internal_error!("mismatched reply for funneled read"),
        }
    }

    fn resume(&self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        debug!(target: "process", "resuming tid = {tid} with signal {signal:?}");
        self.submit_done(Op::Resume { tid, signal })
    }

    fn get_signal_info(&self, tid: Pid) -> Result<libc::siginfo_t> {
        match self.funnel.submit(Op::GetSignalInfo { tid })? {
            Outcome::Siginfo(info) => Ok(info),
            _ => internal_error!("mismatched reply for GetSignalInfo"),
        }
    }

    fn get_event_message(&self, tid: Pid) -> Result<u64> {
        match self.funnel.submit(Op::GetEventMessage { tid })? {
            Outcome::EventMessage(message) => Ok(message),
            _ => internal_error!("mismatched reply for GetEventMessage"),
        }
    }

    fn note_initial_stop(&self, tid: Pid) {
        if let Ok(mut set) = self.initial_stops.lock() {
            set.insert(tid.as_raw());
        }
        self.delegate.add_thread_for_initial_stop_if_needed(tid);
    }

    fn initial_stop_seen(&self, tid: Pid) -> bool {
        self.initial_stops
            .lock()
            .map(|set| set.contains(&tid.as_raw()))
            .unwrap_or(false)
    }

    /// The wait-thread callback. Returns true to stop monitoring.
    fn monitor_callback(&self, pid: Pid, exited: bool, _signal: i32, status: i32) -> bool {
        if exited {
            debug!(target: "process", "got exit, tid = {pid}, status = {status}");
            self.delegate.send_message(ProcessMessage::Exit { pid, status });
            return pid == self.pid;
        }

        let info = match self.get_signal_info(pid) {
            Ok(info) => info,
            Err(err) if err.errno() == Some(Errno::EINVAL) => {
                // The tracee is in group-stop; deliver SIGSTOP to release
                // it. No user-visible event.
                debug!(target: "process", "resuming {pid} from group-stop");
                if self.resume(pid, Some(Signal::SIGSTOP)).is_err() {
                    error!(target: "process", "SIGSTOP delivery failed while in group-stop");
                }
                return false;
            }
            Err(err) => {
                // Most likely the task is gone entirely. Stop if it was
                // the leader, and say so upstream.
                warn!(target: "process", "GetSignalInfo failed for tid = {pid}: {err}");
                let stop = pid == self.pid;
                if stop {
                    self.delegate.send_message(ProcessMessage::Exit { pid, status });
                }
                return stop;
            }
        };

        let message = if info.si_signo == libc::SIGTRAP {
            self.monitor_sigtrap(&info, pid)
        } else {
            Some(self.monitor_signal(&info, pid))
        };

        if let Some(message) = message {
            self.delegate.send_message(message);
        }

        false
    }

    fn monitor_sigtrap(&self, info: &libc::siginfo_t, pid: Pid) -> Option<ProcessMessage> {
        debug_assert_eq!(info.si_signo, libc::SIGTRAP);

        match decode_trap_code(info.si_code) {
            Some(TrapEvent::Clone) => {
                let tid = match self.get_event_message(pid) {
                    Ok(message) => Pid::from_raw(message as libc::pid_t),
                    Err(_) => Pid::from_raw(-1),
                };

                debug!(target: "process", "thread creation event, parent = {pid}, tid = {tid}");

                // The child's own SIGSTOP may or may not have arrived yet;
                // the thread is not ready until it has.
                if tid.as_raw() > 0 && !self.initial_stop_seen(tid) {
                    self.wait_for_initial_tid_stop(tid);
                }

                Some(ProcessMessage::NewThread { pid, tid })
            }
            Some(TrapEvent::Exec) => {
                debug!(target: "process", "exec event, pid = {pid}");
                Some(ProcessMessage::Exec { pid })
            }
            Some(TrapEvent::Exit) => {
                // The task is about to exit; it stays parked until
                // explicitly resumed, detached, or destroyed.
                let data = self.get_event_message(pid).unwrap_or(u64::MAX);
                debug!(target: "process", "limbo event, data = {data:#x}, pid = {pid}");
                Some(ProcessMessage::Limbo {
                    pid,
                    exit_code: (data >> 8) as i32,
                })
            }
            Some(TrapEvent::Trace) => Some(ProcessMessage::Trace { pid }),
            Some(TrapEvent::Break) => Some(ProcessMessage::Break { pid }),
            Some(TrapEvent::Watch) => Some(ProcessMessage::Watch {
                pid,
                fault_addr: unsafe { info.si_addr() } as u64,
            }),
            Some(TrapEvent::SyscallStop) => {
                // Not part of the event vocabulary; absorb and keep going.
                let _ = self.resume(pid, None);
                None
            }
            None => panic!(
                "unexpected SIGTRAP code {:#x} for tid = {pid}",
                info.si_code
            ),
        }
    }

    fn monitor_signal(&self, info: &libc::siginfo_t, pid: Pid) -> ProcessMessage {
        let message = classify_signal(info, pid, unistd::getpid());

        if let ProcessMessage::Crash {
            reason,
            signo,
            fault_addr,
            ..
        } = &message
        {
            debug!(
                target: "process",
                "tid = {pid} crashed with signal {signo}: {}",
                reason.render(*fault_addr)
            );
        }

        message
    }

    /// Blocks until the freshly cloned `tid` reports its user-origin
    /// SIGSTOP (or exits first). Returns false only on a wait failure.
    fn wait_for_initial_tid_stop(&self, tid: Pid) -> bool {
        debug!(target: "process", "waiting for initial stop of tid = {tid}");

        loop {
            let status = match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!(target: "process", "waitpid({tid}) failed: {errno}");
                    return false;
                }
                Ok(status) => status,
            };

            match status {
                WaitStatus::Exited(pid, code) => {
                    // The thread died before its first stop; no more
                    // information is coming.
                    self.delegate
                        .send_message(ProcessMessage::Exit { pid, status: code });
                    return true;
                }
                WaitStatus::Stopped(_, stop_signal) => {
                    if self.get_signal_info(tid).is_err() {
                        return false;
                    }

                    debug_assert_eq!(stop_signal, Signal::SIGSTOP);
                    self.note_initial_stop(tid);
                    return true;
                }
                other => {
                    warn!(target: "process", "unexpected initial-stop status {other:?}");
                    return false;
                }
            }
        }
    }

    fn stop_thread(&self, tid: Pid) -> bool {
        let ret = tgkill(self.pid, tid, libc::SIGSTOP);
        debug!(target: "process", "stopping thread, tid = {tid}, ret = {ret}");

        // The thread may have exited while we were trying to stop it; its
        // terminal event arrives through the wait loop later.
        if ret < 0 {
            return false;
        }

        let pgid = unistd::getpgid(Some(self.pid)).unwrap_or(self.pid);
        let target = Pid::from_raw(-pgid.as_raw());

        loop {
            let status = match waitpid(target, Some(WaitPidFlag::__WALL)) {
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!(target: "process", "waitpid({target}) failed: {errno}");
                    return false;
                }
                Ok(status) => status,
            };

            let wpid = match status.pid() {
                Some(wpid) => wpid,
                None => continue,
            };

            match status {
                WaitStatus::Exited(_, code) => {
                    self.delegate
                        .send_message(ProcessMessage::Exit { pid: wpid, status: code });
                    if wpid == tid {
                        return true;
                    }
                    continue;
                }
                WaitStatus::Signaled(_, fatal, _) => {
                    self.delegate.send_message(ProcessMessage::Exit {
                        pid: wpid,
                        status: fatal as i32,
                    });
                    if wpid == tid {
                        return true;
                    }
                    continue;
                }
                _ => {}
            }

            let info = match self.get_signal_info(wpid) {
                Ok(info) => info,
                Err(err) if err.errno() == Some(Errno::EINVAL) => {
                    // A group-stop raced the directed stop; release it and
                    // keep draining.
                    debug!(target: "process", "resuming {wpid} from group-stop");
                    if self.resume(wpid, Some(Signal::SIGSTOP)).is_err() {
                        error!(target: "process", "SIGSTOP delivery failed while in group-stop");
                    }
                    continue;
                }
                Err(err) => {
                    warn!(target: "process", "GetSignalInfo failed for tid = {wpid}: {err}");
                    return false;
                }
            };

            let message = if info.si_signo == libc::SIGTRAP {
                self.monitor_sigtrap(&info, wpid)
            } else {
                Some(self.monitor_signal(&info, wpid))
            };

            let Some(message) = message else {
                // Syscall-stop, already absorbed.
                continue;
            };

            if !self.delegate.thread_exists(wpid) {
                // A new thread's SIGSTOP can arrive before the clone trap
                // that introduces it; there is no handle for it yet.
                debug_assert!(matches!(message, ProcessMessage::Signal { .. }));
                self.delegate.send_message(message);
                continue;
            }

            match message {
                // Final stops: resuming such a thread makes it disappear.
                // If it is the one we wanted quiesced, that is the last
                // event we will see for it.
                ProcessMessage::Limbo { .. } | ProcessMessage::Exit { .. } => {
                    self.delegate.send_message(message);
                    if wpid == tid {
                        return true;
                    }
                }
                ProcessMessage::Signal { signo, .. } => {
                    if signo == libc::SIGSTOP {
                        // Externally stopped; the thread is quiet, record
                        // the stop and keep draining.
                        self.note_initial_stop(wpid);
                    } else {
                        self.delegate.send_message(message);
                        // Not the stop we are after; resume so the pending
                        // SIGSTOP can be delivered.
                        if wpid == tid {
                            let _ = self.resume(wpid, None);
                        }
                    }
                }
                ProcessMessage::SignalDelivered { signo, .. } => {
                    if wpid == tid && signo == libc::SIGSTOP {
                        // Our directed stop arrived; done.
                        return true;
                    }
                    self.delegate.send_message(message);
                    if wpid == tid {
                        let _ = self.resume(wpid, None);
                    }
                }
                other => {
                    self.delegate.send_message(other);
                    if wpid == tid {
                        let _ = self.resume(wpid, None);
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TrapEvent {
    Clone,
    Exec,
    Exit,
    Trace,
    Break,
    Watch,
    SyscallStop,
}

/// Decodes a SIGTRAP `si_code`. `None` means a code this protocol does not
/// produce, which indicates corruption.
fn decode_trap_code(code: i32) -> Option<TrapEvent> {
    const TRAP_EVENT_CLONE: i32 = libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8);
    const TRAP_EVENT_EXEC: i32 = libc::SIGTRAP | (libc::PTRACE_EVENT_EXEC << 8);
    const TRAP_EVENT_EXIT: i32 = libc::SIGTRAP | (libc::PTRACE_EVENT_EXIT << 8);
    const SYSCALL_TRAP: i32 = libc::SIGTRAP | 0x80;

    match code {
        TRAP_EVENT_CLONE => Some(TrapEvent::Clone),
        TRAP_EVENT_EXEC => Some(TrapEvent::Exec),
        TRAP_EVENT_EXIT => Some(TrapEvent::Exit),
        0 | TRAP_TRACE => Some(TrapEvent::Trace),
        SI_KERNEL | TRAP_BRKPT => Some(TrapEvent::Break),
        TRAP_HWBKPT => Some(TrapEvent::Watch),
        libc::SIGTRAP | SYSCALL_TRAP => Some(TrapEvent::SyscallStop),
        _ => None,
    }
}

/// Classifies a non-SIGTRAP stop.
///
/// Process behaviour is undefined after it ignores a SIGSEGV, SIGILL,
/// SIGFPE, or SIGBUS that was generated by `kill(2)` or `tgkill(2)`, so
/// user-origin signals never classify as crashes. A user-origin signal this
/// process sent itself is the acknowledgment of a directed stop.
fn classify_signal(info: &libc::siginfo_t, pid: Pid, own_pid: Pid) -> ProcessMessage {
    let signo = info.si_signo;

    if info.si_code == SI_TKILL || info.si_code == SI_USER {
        let sender = Pid::from_raw(unsafe { info.si_pid() });

        return if sender == own_pid {
            ProcessMessage::SignalDelivered { pid, signo }
        } else {
            ProcessMessage::Signal { pid, signo }
        };
    }

    match signo {
        libc::SIGSEGV | libc::SIGILL | libc::SIGFPE | libc::SIGBUS => ProcessMessage::Crash {
            pid,
            reason: CrashReason::from_siginfo(info),
            signo,
            fault_addr: unsafe { info.si_addr() } as u64,
        },
        _ => ProcessMessage::Signal { pid, signo },
    }
}

fn tgkill(pid: Pid, tid: Pid, signo: i32) -> libc::c_long {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, pid.as_raw(), tid.as_raw(), signo) };

    if ret < 0 && Errno::last() == Errno::ENOSYS {
        // Kernel without tgkill: fall back to the per-task kill.
        return unsafe { libc::syscall(libc::SYS_tkill, tid.as_raw(), signo) };
    }

    ret
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl::fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd, FcntlArg::F_SETFL(flags)).map(drop)
}

fn bootstrap_launch(
    options: &LaunchOptions,
    delegate: &dyn ProcessDelegate,
    initial_stops: &Mutex<HashSet<libc::pid_t>>,
) -> Result<(Pid, Option<RawFd>)> {
    let image = ExecImage::prepare(options).map_err(|_| Error::Launch {
        reason: "Launch arguments contain interior NUL bytes.".into(),
    })?;

    let mut pty = PseudoTerminal::open().map_err(|errno| Error::Launch {
        reason: format!("Could not allocate a pseudo terminal: {errno}."),
    })?;

    // The exec pointer tables heap-allocate; build them before forking.
    let vectors = image.vectors();

    let child = match unsafe { unistd::fork() } {
        Err(_) => {
            return Err(Error::Launch {
                reason: "Process fork failed.".into(),
            })
        }
        Ok(ForkResult::Child) => child_exec(&image, &pty, &vectors),
        Ok(ForkResult::Parent { child }) => child,
    };

    pty.close_slave();

    // Wait for the child to trap on its call to execve.
    let status = loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
            Ok(status) => break status,
        }
    };

    match status {
        WaitStatus::Exited(_, code) => {
            return Err(Error::Launch {
                reason: launch_failure_reason(code).into(),
            })
        }
        WaitStatus::Stopped(_, _) => {}
        other => {
            return Err(Error::Launch {
                reason: format!("Could not sync with inferior process: {other:?}."),
            })
        }
    }

    ptrace::set_default_options(child).map_err(Error::Os)?;

    // Publish the master end non-blocking, so upstream terminal reads never
    // stall the debugger.
    let master = pty.release_master();
    if let Err(errno) = set_nonblocking(master) {
        let _ = unistd::close(master);
        return Err(errno.into());
    }

    debug!(target: "process", "launched inferior, pid = {child}");

    delegate.create_thread(child);
    note_initial_stop(initial_stops, delegate, child);
    delegate.send_message(ProcessMessage::Trace { pid: child });

    Ok((child, Some(master)))
}

/// Child side of the launch fork. Nothing here may allocate or take locks;
/// each failure exits with a distinct code the parent can decode.
fn child_exec(image: &ExecImage, pty: &PseudoTerminal, vectors: &ExecVectors<'_>) -> ! {
    if ptrace::traceme().is_err() {
        unsafe { libc::_exit(EXIT_PTRACE_FAILED) }
    }

    // Wire the pty slave to stdio, then drop both pty descriptors.
    let slave = pty.slave_fd();
    if slave >= 0 {
        if unistd::dup2(slave, libc::STDIN_FILENO).is_err() {
            unsafe { libc::_exit(EXIT_DUP_STDIN_FAILED) }
        }
        if unistd::dup2(slave, libc::STDOUT_FILENO).is_err() {
            unsafe { libc::_exit(EXIT_DUP_STDOUT_FAILED) }
        }
        if unistd::dup2(slave, libc::STDERR_FILENO).is_err() {
            unsafe { libc::_exit(EXIT_DUP_STDERR_FAILED) }
        }
        let _ = unistd::close(slave);
    }

    let master = pty.master_fd();
    if master >= 0 {
        let _ = unistd::close(master);
    }

    // Do not inherit setgid powers.
    if unistd::setgid(unistd::getgid()).is_err() {
        unsafe { libc::_exit(EXIT_SETGID_FAILED) }
    }

    // Our own process group, so the wait loop can target it.
    let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));

    if let Some(path) = &image.stdin {
        if !redirect(path, libc::STDIN_FILENO, OFlag::O_RDONLY) {
            unsafe { libc::_exit(EXIT_DUP_STDIN_FAILED) }
        }
    }
    if let Some(path) = &image.stdout {
        if !redirect(path, libc::STDOUT_FILENO, OFlag::O_WRONLY | OFlag::O_CREAT) {
            unsafe { libc::_exit(EXIT_DUP_STDOUT_FAILED) }
        }
    }
    if let Some(path) = &image.stderr {
        if !redirect(path, libc::STDERR_FILENO, OFlag::O_WRONLY | OFlag::O_CREAT) {
            unsafe { libc::_exit(EXIT_DUP_STDERR_FAILED) }
        }
    }

    if let Some(dir) = &image.working_dir {
        if unistd::chdir(dir.as_c_str()).is_err() {
            unsafe { libc::_exit(EXIT_CHDIR_FAILED) }
        }
    }

    if image.disable_aslr {
        // Failure only costs randomization; keep going.
        if let Ok(persona) = personality::get() {
            let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
        }
    }

    unsafe {
        libc::execve(image.program.as_ptr(), vectors.argv_ptr(), vectors.envp_ptr());
        libc::_exit(EXIT_EXEC_FAILED)
    }
}

fn redirect(path: &std::ffi::CString, fd: RawFd, flags: OFlag) -> bool {
    let target = match fcntl::open(path.as_c_str(), flags, Mode::from_bits_truncate(0o666)) {
        Ok(target) => target,
        Err(_) => return false,
    };

    if unistd::dup2(target, fd).is_err() {
        return false;
    }

    unistd::close(target).is_ok()
}

fn note_initial_stop(
    initial_stops: &Mutex<HashSet<libc::pid_t>>,
    delegate: &dyn ProcessDelegate,
    tid: Pid,
) {
    if let Ok(mut set) = initial_stops.lock() {
        set.insert(tid.as_raw());
    }
    delegate.add_thread_for_initial_stop_if_needed(tid);
}

/// Every task currently listed under `/proc/<pid>/task`.
fn process_tids(pid: Pid) -> std::io::Result<Vec<Pid>> {
    let mut tids = Vec::new();

    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        {
            tids.push(Pid::from_raw(tid));
        }
    }

    Ok(tids)
}

fn bootstrap_attach(
    pid: Pid,
    delegate: &dyn ProcessDelegate,
    initial_stops: &Mutex<HashSet<libc::pid_t>>,
) -> Result<Pid> {
    if pid.as_raw() <= 1 {
        return Err(Error::AttachRefused { pid });
    }

    // Tasks cloned while we attach must be captured too: re-enumerate until
    // no new tids appear. Bookkeeping is strictly tid-based.
    let mut tids: HashMap<Pid, bool> = HashMap::new();

    loop {
        let found = process_tids(pid).map_err(|_| Error::Attach {
            pid,
            source: Errno::ESRCH,
        })?;

        let mut discovered = false;
        for tid in found {
            tids.entry(tid).or_insert_with(|| {
                discovered = true;
                false
            });
        }

        if !discovered {
            break;
        }

        let pending: Vec<Pid> = tids
            .iter()
            .filter(|(_, attached)| !**attached)
            .map(|(tid, _)| *tid)
            .collect();

        for tid in pending {
            if attach_task(tid, delegate, initial_stops)? {
                tids.insert(tid, true);
            } else {
                // The task died mid-attach; no event for it.
                tids.remove(&tid);
            }
        }
    }

    if !tids.values().any(|attached| *attached) {
        return Err(Error::Attach {
            pid,
            source: Errno::ESRCH,
        });
    }

    debug!(target: "process", "attached to pid = {pid} ({} tasks)", tids.len());
    delegate.send_message(ProcessMessage::Trace { pid });

    Ok(pid)
}

/// Attaches one task and waits for its SIGSTOP. `Ok(false)` means the task
/// vanished with ESRCH, which is not a failure of the enclosing attach.
fn attach_task(
    tid: Pid,
    delegate: &dyn ProcessDelegate,
    initial_stops: &Mutex<HashSet<libc::pid_t>>,
) -> Result<bool> {
    match ptrace::attach(tid) {
        Err(Errno::ESRCH) => return Ok(false),
        Err(source) => return Err(Error::Attach { pid: tid, source }),
        Ok(()) => {}
    }

    // __WALL, or waiting on a non-leader thread fails with ECHILD.
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            Err(Errno::ESRCH | Errno::ECHILD) => return Ok(false),
            Err(source) => return Err(Error::Attach { pid: tid, source }),
            Ok(_) => break,
        }
    }

    ptrace::set_default_options(tid).map_err(|source| Error::Attach { pid: tid, source })?;

    debug!(target: "process", "attached task, tid = {tid}");
    delegate.create_thread(tid);
    note_initial_stop(initial_stops, delegate, tid);

    Ok(true)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::fake_siginfo;

    #[test]
    fn trap_codes_decode_to_single_events() {
        let clone_code = libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8);
        let exec_code = libc::SIGTRAP | (libc::PTRACE_EVENT_EXEC << 8);
        let exit_code = libc::SIGTRAP | (libc::PTRACE_EVENT_EXIT << 8);

        assert_eq!(decode_trap_code(clone_code), Some(TrapEvent::Clone));
        assert_eq!(decode_trap_code(exec_code), Some(TrapEvent::Exec));
        assert_eq!(decode_trap_code(exit_code), Some(TrapEvent::Exit));
        assert_eq!(decode_trap_code(0), Some(TrapEvent::Trace));
        assert_eq!(decode_trap_code(TRAP_TRACE), Some(TrapEvent::Trace));
        assert_eq!(decode_trap_code(SI_KERNEL), Some(TrapEvent::Break));
        assert_eq!(decode_trap_code(TRAP_BRKPT), Some(TrapEvent::Break));
        assert_eq!(decode_trap_code(TRAP_HWBKPT), Some(TrapEvent::Watch));
        assert_eq!(decode_trap_code(libc::SIGTRAP), Some(TrapEvent::SyscallStop));
        assert_eq!(
            decode_trap_code(libc::SIGTRAP | 0x80),
            Some(TrapEvent::SyscallStop)
        );

        assert_eq!(decode_trap_code(0x7777), None);
    }

    #[test]
    fn self_sent_signals_classify_as_delivered() {
        let own = unistd::getpid();
        let pid = Pid::from_raw(4242);

        let info = fake_siginfo(libc::SIGSTOP, SI_TKILL, own.as_raw(), 0);
        assert_eq!(
            classify_signal(&info, pid, own),
            ProcessMessage::SignalDelivered {
                pid,
                signo: libc::SIGSTOP
            }
        );

        let info = fake_siginfo(libc::SIGSTOP, SI_USER, own.as_raw() + 1, 0);
        assert_eq!(
            classify_signal(&info, pid, own),
            ProcessMessage::Signal {
                pid,
                signo: libc::SIGSTOP
            }
        );
    }

    #[test]
    fn user_origin_faults_are_not_crashes() {
        let own = unistd::getpid();
        let pid = Pid::from_raw(4242);

        let info = fake_siginfo(libc::SIGSEGV, SI_USER, own.as_raw() + 1, 0);
        assert_eq!(
            classify_signal(&info, pid, own),
            ProcessMessage::Signal {
                pid,
                signo: libc::SIGSEGV
            }
        );
    }

    #[test]
    fn kernel_faults_classify_as_crashes() {
        let own = unistd::getpid();
        let pid = Pid::from_raw(4242);

        // SEGV_MAPERR at a null address: the canonical wild dereference.
        let info = fake_siginfo(libc::SIGSEGV, 1, 0, 0);
        assert_eq!(
            classify_signal(&info, pid, own),
            ProcessMessage::Crash {
                pid,
                reason: CrashReason::InvalidAddress,
                signo: libc::SIGSEGV,
                fault_addr: 0
            }
        );

        let info = fake_siginfo(libc::SIGBUS, 1, 0, 0xdead_0000);
        assert_eq!(
            classify_signal(&info, pid, own),
            ProcessMessage::Crash {
                pid,
                reason: CrashReason::IllegalAlignment,
                signo: libc::SIGBUS,
                fault_addr: 0xdead_0000
            }
        );
    }

    #[test]
    fn other_signals_pass_through() {
        let own = unistd::getpid();
        let pid = Pid::from_raw(4242);

        let info = fake_siginfo(libc::SIGTERM, SI_KERNEL, 0, 0);
        assert_eq!(
            classify_signal(&info, pid, own),
            ProcessMessage::Signal {
                pid,
                signo: libc::SIGTERM
            }
        );
    }

    #[test]
    fn launch_exit_codes_have_reasons() {
        assert_eq!(launch_failure_reason(1), "Child ptrace failed.");
        assert_eq!(launch_failure_reason(5), "Child failed to set working directory.");
        assert_eq!(launch_failure_reason(7), "Child setgid failed.");
        assert_eq!(launch_failure_reason(42), "Child returned unknown exit status.");
    }
}
