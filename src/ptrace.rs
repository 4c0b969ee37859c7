//! Thin, logged wrappers over the `ptrace(2)` requests the monitor issues.
//!
//! ptrace is unique in that −1 may be a valid result (for the `PEEK` family),
//! so the raw call path clears the errno slot before entering the kernel and
//! consults it afterwards. Requests `nix` wraps go through `nix`; the rest
//! (the `PEEK`/`POKE` family, regset transfers, `ARCH_PRCTL`) drop to
//! `libc::ptrace` directly.
//!
//! Everything here returns the raw kernel result and an errno snapshot; the
//! callers add context. Nothing in this module panics.

use libc::{c_long, c_void};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, trace};

pub use nix::sys::ptrace::Options;

/// Trace options installed on every tracee:
/// - `TRACEEXIT`, so exiting threads park in limbo until disposed of;
/// - `TRACECLONE`, so new threads are observed;
/// - `TRACEEXEC`, which replaces the legacy post-exec `SIGTRAP` with a
///   typed event.
pub(crate) const DEFAULT_OPTIONS: Options = Options::PTRACE_O_TRACEEXIT
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC);

fn errno_name(errno: Errno) -> &'static str {
    match errno {
        Errno::ESRCH => "ESRCH",
        Errno::EINVAL => "EINVAL",
        Errno::EBUSY => "EBUSY",
        Errno::EPERM => "EPERM",
        _ => "<other>",
    }
}

/// Renders at most `budget` bytes as `[ab][cd]..` for diagnostics.
pub(crate) fn fmt_bytes(bytes: &[u8], budget: usize) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for byte in bytes.iter().take(budget) {
        let _ = write!(out, "[{byte:x}]");
    }
    out
}

fn log_result(request: &'static str, tid: Pid, result: &nix::Result<c_long>) {
    match result {
        Ok(value) => {
            debug!(target: "ptrace", "{request}(tid = {tid}) = {value:#x}");
        }
        Err(errno) => {
            debug!(
                target: "ptrace",
                "{request}(tid = {tid}) failed; errno={} ({})",
                *errno as i32,
                errno_name(*errno)
            );
        }
    }
}

/// Issues a raw request. Clears errno first: for the `PEEK` family a result
/// of −1 with errno still clear is a successful read of the value −1.
fn raw(
    request: libc::c_uint,
    name: &'static str,
    tid: Pid,
    addr: *mut c_void,
    data: *mut c_void,
) -> nix::Result<c_long> {
    let res = unsafe {
        Errno::clear();
        libc::ptrace(request, tid.as_raw(), addr, data)
    };

    let out = match Errno::result(res) {
        Ok(value) => Ok(value),
        Err(Errno::UnknownErrno) => Ok(res),
        Err(errno) => Err(errno),
    };

    log_result(name, tid, &out);
    out
}

pub(crate) fn peek_data(tid: Pid, addr: u64) -> nix::Result<c_long> {
    raw(
        libc::PTRACE_PEEKDATA,
        "PTRACE_PEEKDATA",
        tid,
        addr as *mut c_void,
        std::ptr::null_mut(),
    )
}

pub(crate) fn poke_data(tid: Pid, addr: u64, word: c_long) -> nix::Result<()> {
    trace!(
        target: "ptrace",
        "PTRACE_POKEDATA {}",
        fmt_bytes(&word.to_ne_bytes(), std::mem::size_of::<c_long>())
    );

    raw(
        libc::PTRACE_POKEDATA,
        "PTRACE_POKEDATA",
        tid,
        addr as *mut c_void,
        word as *mut c_void,
    )
    .map(drop)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn peek_user(tid: Pid, offset: u64) -> nix::Result<c_long> {
    // The offset is not used as a pointer by the kernel; no validation
    // is required here.
    raw(
        libc::PTRACE_PEEKUSER,
        "PTRACE_PEEKUSER",
        tid,
        offset as *mut c_void,
        std::ptr::null_mut(),
    )
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn poke_user(tid: Pid, offset: u64, word: c_long) -> nix::Result<()> {
    trace!(
        target: "ptrace",
        "PTRACE_POKEUSER {}",
        fmt_bytes(&word.to_ne_bytes(), std::mem::size_of::<c_long>())
    );

    raw(
        libc::PTRACE_POKEUSER,
        "PTRACE_POKEUSER",
        tid,
        offset as *mut c_void,
        word as *mut c_void,
    )
    .map(drop)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn get_regs(tid: Pid, buf: &mut [u8]) -> nix::Result<()> {
    if buf.len() < crate::x86::GPR_SIZE {
        return Err(Errno::EINVAL);
    }

    raw(
        libc::PTRACE_GETREGS,
        "PTRACE_GETREGS",
        tid,
        std::ptr::null_mut(),
        buf.as_mut_ptr() as *mut c_void,
    )
    .map(drop)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn set_regs(tid: Pid, buf: &[u8]) -> nix::Result<()> {
    if buf.len() < crate::x86::GPR_SIZE {
        return Err(Errno::EINVAL);
    }

    trace!(target: "ptrace", "PTRACE_SETREGS {}", fmt_bytes(buf, buf.len()));

    raw(
        libc::PTRACE_SETREGS,
        "PTRACE_SETREGS",
        tid,
        std::ptr::null_mut(),
        buf.as_ptr() as *mut c_void,
    )
    .map(drop)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn get_fpregs(tid: Pid, buf: &mut [u8]) -> nix::Result<()> {
    if buf.len() < crate::x86::FPR_SIZE {
        return Err(Errno::EINVAL);
    }

    raw(
        libc::PTRACE_GETFPREGS,
        "PTRACE_GETFPREGS",
        tid,
        std::ptr::null_mut(),
        buf.as_mut_ptr() as *mut c_void,
    )
    .map(drop)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn set_fpregs(tid: Pid, buf: &[u8]) -> nix::Result<()> {
    if buf.len() < crate::x86::FPR_SIZE {
        return Err(Errno::EINVAL);
    }

    trace!(target: "ptrace", "PTRACE_SETFPREGS {}", fmt_bytes(buf, buf.len()));

    raw(
        libc::PTRACE_SETFPREGS,
        "PTRACE_SETFPREGS",
        tid,
        std::ptr::null_mut(),
        buf.as_ptr() as *mut c_void,
    )
    .map(drop)
}

/// Register-set read. The kernel expects the set id by value in the addr
/// argument and an iovec in the data argument.
pub(crate) fn get_regset(tid: Pid, set: u32, buf: &mut [u8]) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };

    raw(
        libc::PTRACE_GETREGSET,
        "PTRACE_GETREGSET",
        tid,
        set as usize as *mut c_void,
        &mut iov as *mut libc::iovec as *mut c_void,
    )
    .map(drop)
}

/// Register-set write; argument convention as for [`get_regset`].
pub(crate) fn set_regset(tid: Pid, set: u32, buf: &[u8]) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut c_void,
        iov_len: buf.len(),
    };

    trace!(target: "ptrace", "PTRACE_SETREGSET {}", fmt_bytes(buf, buf.len()));

    raw(
        libc::PTRACE_SETREGSET,
        "PTRACE_SETREGSET",
        tid,
        set as usize as *mut c_void,
        &mut iov as *mut libc::iovec as *mut c_void,
    )
    .map(drop)
}

/// Reads the FS segment base, which holds the thread pointer on x86_64.
#[cfg(target_arch = "x86_64")]
pub(crate) fn arch_prctl_get_fs(tid: Pid) -> nix::Result<u64> {
    let mut addr: u64 = 0;

    raw(
        crate::x86::PTRACE_ARCH_PRCTL,
        "PTRACE_ARCH_PRCTL",
        tid,
        &mut addr as *mut u64 as *mut c_void,
        crate::x86::ARCH_GET_FS as *mut c_void,
    )?;

    Ok(addr)
}

pub(crate) fn traceme() -> nix::Result<()> {
    ptrace::traceme()
}

pub(crate) fn attach(tid: Pid) -> nix::Result<()> {
    let res = ptrace::attach(tid);
    log_result("PTRACE_ATTACH", tid, &res.map(|()| 0));
    res
}

pub(crate) fn detach(tid: Pid) -> nix::Result<()> {
    let res = ptrace::detach(tid, None);
    log_result("PTRACE_DETACH", tid, &res.map(|()| 0));
    res
}

pub(crate) fn cont(tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    let res = ptrace::cont(tid, signal);
    log_result("PTRACE_CONT", tid, &res.map(|()| 0));
    res
}

pub(crate) fn step(tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    let res = ptrace::step(tid, signal);
    log_result("PTRACE_SINGLESTEP", tid, &res.map(|()| 0));
    res
}

pub(crate) fn set_default_options(tid: Pid) -> nix::Result<()> {
    let res = ptrace::setoptions(tid, DEFAULT_OPTIONS);
    log_result("PTRACE_SETOPTIONS", tid, &res.map(|()| 0));
    res
}

pub(crate) fn getsiginfo(tid: Pid) -> nix::Result<libc::siginfo_t> {
    let res = ptrace::getsiginfo(tid);
    log_result("PTRACE_GETSIGINFO", tid, &res.as_ref().map(|_| 0).map_err(|e| *e));
    res
}

pub(crate) fn getevent(tid: Pid) -> nix::Result<c_long> {
    let res = ptrace::getevent(tid);
    log_result("PTRACE_GETEVENTMSG", tid, &res);
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_render_within_budget() {
        let bytes = [0xde, 0xad, 0xbe, 0xef];

        assert_eq!(fmt_bytes(&bytes, 4), "[de][ad][be][ef]");
        assert_eq!(fmt_bytes(&bytes, 2), "[de][ad]");
        assert_eq!(fmt_bytes(&[], 8), "");
    }

    #[test]
    fn errno_mnemonics() {
        assert_eq!(errno_name(Errno::ESRCH), "ESRCH");
        assert_eq!(errno_name(Errno::EINVAL), "EINVAL");
        assert_eq!(errno_name(Errno::EBUSY), "EBUSY");
        assert_eq!(errno_name(Errno::EPERM), "EPERM");
        assert_eq!(errno_name(Errno::EIO), "<other>");
    }
}
