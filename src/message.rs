//! The event vocabulary crossing the monitor's output boundary, and the
//! structured decode of fault signals.

use std::fmt;

use nix::unistd::Pid;

// Signal-origin codes from `include/uapi/asm-generic/siginfo.h`.
pub(crate) const SI_USER: i32 = 0;
pub(crate) const SI_KERNEL: i32 = 0x80;
pub(crate) const SI_TKILL: i32 = -6;

// SIGTRAP decode codes, same header.
pub(crate) const TRAP_BRKPT: i32 = 1;
pub(crate) const TRAP_TRACE: i32 = 2;
pub(crate) const TRAP_HWBKPT: i32 = 4;

// Fault decode codes, same header.
const SEGV_MAPERR: i32 = 1;
const SEGV_ACCERR: i32 = 2;

const ILL_ILLOPC: i32 = 1;
const ILL_ILLOPN: i32 = 2;
const ILL_ILLADR: i32 = 3;
const ILL_ILLTRP: i32 = 4;
const ILL_PRVOPC: i32 = 5;
const ILL_PRVREG: i32 = 6;
const ILL_COPROC: i32 = 7;
const ILL_BADSTK: i32 = 8;

const BUS_ADRALN: i32 = 1;
const BUS_ADRERR: i32 = 2;
const BUS_OBJERR: i32 = 3;

const FPE_INTDIV: i32 = 1;
const FPE_INTOVF: i32 = 2;
const FPE_FLTDIV: i32 = 3;
const FPE_FLTOVF: i32 = 4;
const FPE_FLTUND: i32 = 5;
const FPE_FLTRES: i32 = 6;
const FPE_FLTINV: i32 = 7;
const FPE_FLTSUB: i32 = 8;

/// A lifecycle event observed on the inferior, delivered one per wait
/// wake-up to the upstream process object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessMessage {
    /// A task exited or was killed by a signal; `status` is the exit code
    /// or the fatal signal number.
    Exit { pid: Pid, status: i32 },

    /// A task hit its exit trap and is parked, unreaped, until explicitly
    /// resumed, detached, or destroyed.
    Limbo { pid: Pid, exit_code: i32 },

    /// Single-step completion, or the initial post-launch/attach stop.
    Trace { pid: Pid },

    /// Software breakpoint.
    Break { pid: Pid },

    /// Hardware watchpoint, with the faulting address.
    Watch { pid: Pid, fault_addr: u64 },

    /// A fault signal with non-user origin.
    Crash {
        pid: Pid,
        reason: CrashReason,
        signo: i32,
        fault_addr: u64,
    },

    /// A clone produced `tid` inside `pid`'s thread group.
    NewThread { pid: Pid, tid: Pid },

    /// The task returned from a successful `execve(2)`.
    Exec { pid: Pid },

    /// Signal delivery observed, sender external to this process.
    Signal { pid: Pid, signo: i32 },

    /// Acknowledgment of a signal this process sent to the tracee itself.
    SignalDelivered { pid: Pid, signo: i32 },
}

impl ProcessMessage {
    /// The task this event concerns.
    pub fn pid(&self) -> Pid {
        match *self {
            ProcessMessage::Exit { pid, .. }
            | ProcessMessage::Limbo { pid, .. }
            | ProcessMessage::Trace { pid }
            | ProcessMessage::Break { pid }
            | ProcessMessage::Watch { pid, .. }
            | ProcessMessage::Crash { pid, .. }
            | ProcessMessage::NewThread { pid, .. }
            | ProcessMessage::Exec { pid }
            | ProcessMessage::Signal { pid, .. }
            | ProcessMessage::SignalDelivered { pid, .. } => pid,
        }
    }
}

/// Why a fault signal was raised, decoded from its `si_code`.
///
/// Behaviour is undefined after a process ignores a SIGSEGV, SIGILL, SIGFPE,
/// or SIGBUS that was not raised by `kill(2)` or `tgkill(2)`, so those are
/// the signals that earn a structured reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrashReason {
    // SIGSEGV
    InvalidAddress,
    PrivilegedAddress,

    // SIGILL
    IllegalOpcode,
    IllegalOperand,
    IllegalAddressingMode,
    IllegalTrap,
    PrivilegedOpcode,
    PrivilegedRegister,
    CoprocessorError,
    InternalStackError,

    // SIGBUS
    IllegalAlignment,
    IllegalAddress,
    HardwareError,

    // SIGFPE
    IntegerDivideByZero,
    IntegerOverflow,
    FloatDivideByZero,
    FloatOverflow,
    FloatUnderflow,
    FloatInexactResult,
    FloatInvalidOperation,
    FloatSubscriptRange,

    /// The kernel handed us a code this decode does not know.
    Unknown { signo: i32, code: i32 },
}

impl CrashReason {
    pub fn from_siginfo(info: &libc::siginfo_t) -> Self {
        let signo = info.si_signo;
        let code = info.si_code;

        match (signo, code) {
            (libc::SIGSEGV, SEGV_MAPERR) => CrashReason::InvalidAddress,
            (libc::SIGSEGV, SEGV_ACCERR) => CrashReason::PrivilegedAddress,

            (libc::SIGILL, ILL_ILLOPC) => CrashReason::IllegalOpcode,
            (libc::SIGILL, ILL_ILLOPN) => CrashReason::IllegalOperand,
            (libc::SIGILL, ILL_ILLADR) => CrashReason::IllegalAddressingMode,
            (libc::SIGILL, ILL_ILLTRP) => CrashReason::IllegalTrap,
            (libc::SIGILL, ILL_PRVOPC) => CrashReason::PrivilegedOpcode,
            (libc::SIGILL, ILL_PRVREG) => CrashReason::PrivilegedRegister,
            (libc::SIGILL, ILL_COPROC) => CrashReason::CoprocessorError,
            (libc::SIGILL, ILL_BADSTK) => CrashReason::InternalStackError,

            (libc::SIGBUS, BUS_ADRALN) => CrashReason::IllegalAlignment,
            (libc::SIGBUS, BUS_ADRERR) => CrashReason::IllegalAddress,
            (libc::SIGBUS, BUS_OBJERR) => CrashReason::HardwareError,

            (libc::SIGFPE, FPE_INTDIV) => CrashReason::IntegerDivideByZero,
            (libc::SIGFPE, FPE_INTOVF) => CrashReason::IntegerOverflow,
            (libc::SIGFPE, FPE_FLTDIV) => CrashReason::FloatDivideByZero,
            (libc::SIGFPE, FPE_FLTOVF) => CrashReason::FloatOverflow,
            (libc::SIGFPE, FPE_FLTUND) => CrashReason::FloatUnderflow,
            (libc::SIGFPE, FPE_FLTRES) => CrashReason::FloatInexactResult,
            (libc::SIGFPE, FPE_FLTINV) => CrashReason::FloatInvalidOperation,
            (libc::SIGFPE, FPE_FLTSUB) => CrashReason::FloatSubscriptRange,

            _ => CrashReason::Unknown { signo, code },
        }
    }

    /// Human rendering of the reason, with the fault address for the
    /// access faults where one is meaningful.
    pub fn render(&self, fault_addr: u64) -> String {
        match self {
            CrashReason::InvalidAddress
            | CrashReason::PrivilegedAddress
            | CrashReason::IllegalAlignment
            | CrashReason::IllegalAddress
            | CrashReason::HardwareError => {
                format!("{self} (fault address: {fault_addr:#x})")
            }
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CrashReason::InvalidAddress => "invalid address",
            CrashReason::PrivilegedAddress => "address access protected",
            CrashReason::IllegalOpcode => "illegal instruction",
            CrashReason::IllegalOperand => "illegal instruction operand",
            CrashReason::IllegalAddressingMode => "illegal addressing mode",
            CrashReason::IllegalTrap => "illegal trap",
            CrashReason::PrivilegedOpcode => "privileged instruction",
            CrashReason::PrivilegedRegister => "privileged register",
            CrashReason::CoprocessorError => "coprocessor error",
            CrashReason::InternalStackError => "internal stack error",
            CrashReason::IllegalAlignment => "illegal alignment",
            CrashReason::IllegalAddress => "illegal address",
            CrashReason::HardwareError => "hardware error",
            CrashReason::IntegerDivideByZero => "integer divide by zero",
            CrashReason::IntegerOverflow => "integer overflow",
            CrashReason::FloatDivideByZero => "floating point divide by zero",
            CrashReason::FloatOverflow => "floating point overflow",
            CrashReason::FloatUnderflow => "floating point underflow",
            CrashReason::FloatInexactResult => "inexact floating point result",
            CrashReason::FloatInvalidOperation => "invalid floating point operation",
            CrashReason::FloatSubscriptRange => "invalid floating point subscript range",
            CrashReason::Unknown { signo, code } => {
                return write!(f, "unknown crash reason (signo = {signo}, code = {code})")
            }
        };

        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::fake_siginfo;

    #[test]
    fn segv_codes_decode() {
        let info = fake_siginfo(libc::SIGSEGV, SEGV_MAPERR, 0, 0);
        assert_eq!(CrashReason::from_siginfo(&info), CrashReason::InvalidAddress);

        let info = fake_siginfo(libc::SIGSEGV, SEGV_ACCERR, 0, 0);
        assert_eq!(
            CrashReason::from_siginfo(&info),
            CrashReason::PrivilegedAddress
        );
    }

    #[test]
    fn fpe_codes_decode() {
        let info = fake_siginfo(libc::SIGFPE, FPE_INTDIV, 0, 0);
        assert_eq!(
            CrashReason::from_siginfo(&info),
            CrashReason::IntegerDivideByZero
        );
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let info = fake_siginfo(libc::SIGSEGV, 99, 0, 0);
        assert_eq!(
            CrashReason::from_siginfo(&info),
            CrashReason::Unknown {
                signo: libc::SIGSEGV,
                code: 99
            }
        );
    }

    #[test]
    fn reasons_render_as_text() {
        assert_eq!(CrashReason::InvalidAddress.to_string(), "invalid address");
        assert_eq!(
            CrashReason::Unknown { signo: 4, code: 9 }.to_string(),
            "unknown crash reason (signo = 4, code = 9)"
        );
    }

    #[test]
    fn access_faults_render_with_their_address() {
        assert_eq!(
            CrashReason::InvalidAddress.render(0x40),
            "invalid address (fault address: 0x40)"
        );
        assert_eq!(
            CrashReason::IllegalAlignment.render(0xdead_0001),
            "illegal alignment (fault address: 0xdead0001)"
        );

        // No address on the instruction-level faults.
        assert_eq!(
            CrashReason::IntegerDivideByZero.render(0x40),
            "integer divide by zero"
        );
        assert_eq!(CrashReason::IllegalOpcode.render(0x40), "illegal instruction");
    }
}
