//! A serialized monitor for Linux inferior processes, built on `ptrace(2)`.
//!
//! The kernel only honors ptrace requests from the task that originally
//! attached to (or forked) a tracee, and `wait(2)` statuses must be consumed
//! and interpreted in order. This crate hides both constraints behind a
//! [`Monitor`]: a dedicated owner thread issues every privileged request
//! (callers rendezvous with it through a serialized funnel), while a second
//! thread blocks in the wait loop and translates trap codes, `si_code`
//! values, and group-stop conditions into the typed [`ProcessMessage`]
//! vocabulary delivered to a [`ProcessDelegate`].
//!
//! The monitor moves memory word-by-word, reads and writes registers by
//! `user`-area offset or register-set id, resumes and single-steps
//! individual tasks, and handles launch (fork/exec onto a pseudo-terminal,
//! with stdio redirection and optional ASLR disabling) and attach (every
//! task of the target thread group). It deliberately knows nothing about
//! symbols, breakpoints, or module addresses.

// Addresses are carried as u64 while ptrace takes host-width pointer
// arguments; rather than truncate on narrow hosts, refuse them.
#[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
compile_error!("procmon supports 64-bit Linux hosts only");

#[macro_use]
pub mod error;

pub mod message;
pub mod monitor;

mod cmd;
mod memory;
mod op;
mod ptrace;
mod pty;
mod regs;
mod wait;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(test)]
mod test_support;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use message::{CrashReason, ProcessMessage};

#[doc(inline)]
pub use monitor::{Monitor, ProcessDelegate};

#[doc(inline)]
pub use cmd::LaunchOptions;

#[doc(inline)]
pub use regs::RegisterValue;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;
