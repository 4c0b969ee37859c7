use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not launch inferior: {reason}")]
    Launch { reason: String },

    #[error("could not attach to tracee = {pid}")]
    Attach { pid: Pid, source: Errno },

    #[error("attaching to pid {pid} is not allowed")]
    AttachRefused { pid: Pid },

    #[error("ptrace {request} failed for tid = {tid}")]
    Ptrace {
        request: &'static str,
        tid: Pid,
        source: Errno,
    },

    #[error("memory read at {addr:#x} failed after {completed} bytes")]
    MemoryRead {
        addr: u64,
        completed: usize,
        source: Errno,
    },

    #[error("memory write at {addr:#x} failed after {completed} bytes")]
    MemoryWrite {
        addr: u64,
        completed: usize,
        source: Errno,
    },

    #[error("register offset {offset:#x} is out of range")]
    RegisterOffset { offset: u64 },

    #[error("monitor is shut down")]
    Disconnected,

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("system call failed")]
    Os(#[from] Errno),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The captured kernel errno, if this error carries one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Attach { source, .. }
            | Error::Ptrace { source, .. }
            | Error::MemoryRead { source, .. }
            | Error::MemoryWrite { source, .. }
            | Error::Os(source) => Some(*source),
            _ => None,
        }
    }

    /// True when the failure means the target task no longer exists.
    pub fn tracee_died(&self) -> bool {
        self.errno() == Some(Errno::ESRCH)
    }
}

/// Returns an [`Error::Internal`] from the enclosing function. Reserved for
/// protocol states the kernel should never hand us.
macro_rules! internal_error {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}
