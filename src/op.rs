//! The operations served by the owner thread.
//!
//! Only the task that originally attached to (or forked) a tracee may issue
//! ptrace requests against it, so every privileged call is packaged as a
//! value here and shipped to the owner thread for execution. Each variant
//! carries its inputs by value; results travel back over the submitter's
//! reply channel.

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::regs::{self, RegisterValue};
use crate::{memory, ptrace};

#[cfg(target_arch = "aarch64")]
use crate::aarch64::DebugRegisterKind;

pub(crate) enum Op {
    ReadMemory {
        addr: u64,
        len: usize,
    },
    WriteMemory {
        addr: u64,
        data: Vec<u8>,
    },
    ReadRegister {
        tid: Pid,
        offset: u64,
        name: &'static str,
    },
    WriteRegister {
        tid: Pid,
        offset: u64,
        name: &'static str,
        value: RegisterValue,
    },
    ReadGpr {
        tid: Pid,
        len: usize,
    },
    WriteGpr {
        tid: Pid,
        data: Vec<u8>,
    },
    ReadFpr {
        tid: Pid,
        len: usize,
    },
    WriteFpr {
        tid: Pid,
        data: Vec<u8>,
    },
    ReadRegisterSet {
        tid: Pid,
        len: usize,
        set: u32,
    },
    WriteRegisterSet {
        tid: Pid,
        data: Vec<u8>,
        set: u32,
    },
    ReadThreadPointer {
        tid: Pid,
    },
    #[cfg(target_arch = "aarch64")]
    ReadHardwareDebugInfo {
        tid: Pid,
    },
    #[cfg(target_arch = "aarch64")]
    WriteHardwareDebugRegs {
        tid: Pid,
        addrs: Vec<u64>,
        ctrls: Vec<u32>,
        kind: DebugRegisterKind,
    },
    Resume {
        tid: Pid,
        signal: Option<Signal>,
    },
    SingleStep {
        tid: Pid,
        signal: Option<Signal>,
    },
    GetSignalInfo {
        tid: Pid,
    },
    GetEventMessage {
        tid: Pid,
    },
    Detach {
        tid: Pid,
    },

    /// Sentinel telling the owner thread to leave its serve loop.
    Exit,
}

pub(crate) enum Outcome {
    Transferred(usize),
    Data(Vec<u8>),
    Register(RegisterValue),
    ThreadPointer(u64),
    Siginfo(libc::siginfo_t),
    EventMessage(u64),
    #[cfg(target_arch = "aarch64")]
    HardwareDebugInfo {
        watchpoints: u32,
        breakpoints: u32,
    },
    Done,
}

impl Op {
    /// Runs the operation against the inferior. Must only be called on the
    /// owner thread; `pid` is the thread-group leader, used to address
    /// memory transfers.
    pub(crate) fn execute(self, pid: Pid) -> Result<Outcome> {
        match self {
            Op::ReadMemory { addr, len } => {
                let mut buf = vec![0u8; len];
                memory::read(pid, addr, &mut buf)?;
                Ok(Outcome::Data(buf))
            }
            Op::WriteMemory { addr, data } => {
                let written = memory::write(pid, addr, &data)?;
                Ok(Outcome::Transferred(written))
            }
            Op::ReadRegister { tid, offset, name } => {
                let value = regs::read_register(tid, offset, name)?;
                Ok(Outcome::Register(value))
            }
            Op::WriteRegister {
                tid,
                offset,
                name,
                value,
            } => {
                regs::write_register(tid, offset, name, value)?;
                Ok(Outcome::Done)
            }
            Op::ReadGpr { tid, len } => {
                let mut buf = vec![0u8; len];
                regs::read_gpr(tid, &mut buf)?;
                Ok(Outcome::Data(buf))
            }
            Op::WriteGpr { tid, data } => {
                regs::write_gpr(tid, &data)?;
                Ok(Outcome::Done)
            }
            Op::ReadFpr { tid, len } => {
                let mut buf = vec![0u8; len];
                regs::read_fpr(tid, &mut buf)?;
                Ok(Outcome::Data(buf))
            }
            Op::WriteFpr { tid, data } => {
                regs::write_fpr(tid, &data)?;
                Ok(Outcome::Done)
            }
            Op::ReadRegisterSet { tid, len, set } => {
                let mut buf = vec![0u8; len];
                regs::read_register_set(tid, &mut buf, set)?;
                Ok(Outcome::Data(buf))
            }
            Op::WriteRegisterSet { tid, data, set } => {
                regs::write_register_set(tid, &data, set)?;
                Ok(Outcome::Done)
            }
            Op::ReadThreadPointer { tid } => {
                let addr = regs::read_thread_pointer(tid)?;
                Ok(Outcome::ThreadPointer(addr))
            }
            #[cfg(target_arch = "aarch64")]
            Op::ReadHardwareDebugInfo { tid } => {
                let (watchpoints, breakpoints) = regs::read_hardware_debug_info(tid)?;
                Ok(Outcome::HardwareDebugInfo {
                    watchpoints,
                    breakpoints,
                })
            }
            #[cfg(target_arch = "aarch64")]
            Op::WriteHardwareDebugRegs {
                tid,
                addrs,
                ctrls,
                kind,
            } => {
                regs::write_hardware_debug_regs(tid, &addrs, &ctrls, kind)?;
                Ok(Outcome::Done)
            }
            Op::Resume { tid, signal } => {
                ptrace::cont(tid, signal).map_err(|source| Error::Ptrace {
                    request: "PTRACE_CONT",
                    tid,
                    source,
                })?;
                Ok(Outcome::Done)
            }
            Op::SingleStep { tid, signal } => {
                ptrace::step(tid, signal).map_err(|source| Error::Ptrace {
                    request: "PTRACE_SINGLESTEP",
                    tid,
                    source,
                })?;
                Ok(Outcome::Done)
            }
            Op::GetSignalInfo { tid } => {
                let info = ptrace::getsiginfo(tid).map_err(|source| Error::Ptrace {
                    request: "PTRACE_GETSIGINFO",
                    tid,
                    source,
                })?;
                Ok(Outcome::Siginfo(info))
            }
            Op::GetEventMessage { tid } => {
                let message = ptrace::getevent(tid).map_err(|source| Error::Ptrace {
                    request: "PTRACE_GETEVENTMSG",
                    tid,
                    source,
                })?;
                Ok(Outcome::EventMessage(message as u64))
            }
            Op::Detach { tid } => {
                ptrace::detach(tid).map_err(|source| Error::Ptrace {
                    request: "PTRACE_DETACH",
                    tid,
                    source,
                })?;
                Ok(Outcome::Done)
            }
            Op::Exit => Ok(Outcome::Done),
        }
    }

    pub(crate) fn is_exit(&self) -> bool {
        matches!(self, Op::Exit)
    }
}
