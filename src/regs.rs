//! Register access for stopped tasks.
//!
//! Two disciplines coexist because the kernel offers two interfaces. On
//! x86_64 the legacy requests work: scalar access is `PEEKUSER`/`POKEUSER`
//! at a byte offset into the `user` area, and bulk access is
//! `GETREGS`/`GETFPREGS` and friends. On aarch64 the legacy requests do not
//! exist, so a scalar "read at offset" is served by fetching the whole
//! general-purpose or fpsimd set through `GETREGSET` and slicing out the
//! requested bytes; writes read, overlay, and write back. The boundary
//! between the two sets is the byte size of the general-purpose struct.
//!
//! Register layouts themselves are the caller's business: offsets, set ids,
//! and bulk buffers are opaque here.

use nix::unistd::Pid;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ptrace;

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

/// A scalar register value: 8 bytes in the general-purpose file, 16 bytes
/// in the vector file on architectures that slice it that wide.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterValue {
    U64(u64),
    U128(u128),
}

impl RegisterValue {
    pub fn as_u64(&self) -> u64 {
        match *self {
            RegisterValue::U64(v) => v,
            RegisterValue::U128(v) => v as u64,
        }
    }
}

impl From<u64> for RegisterValue {
    fn from(v: u64) -> Self {
        RegisterValue::U64(v)
    }
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn read_register(tid: Pid, offset: u64, name: &'static str) -> Result<RegisterValue> {
    let word = ptrace::peek_user(tid, offset).map_err(|source| Error::Ptrace {
        request: "PTRACE_PEEKUSER",
        tid,
        source,
    })?;

    debug!(target: "registers", "read {name}(tid = {tid}) = {word:#x}");

    Ok(RegisterValue::U64(word as u64))
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn write_register(
    tid: Pid,
    offset: u64,
    name: &'static str,
    value: RegisterValue,
) -> Result<()> {
    let word = value.as_u64();

    debug!(target: "registers", "write {name}(tid = {tid}) = {word:#x}");

    ptrace::poke_user(tid, offset, word as libc::c_long).map_err(|source| Error::Ptrace {
        request: "PTRACE_POKEUSER",
        tid,
        source,
    })
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn read_register(tid: Pid, offset: u64, name: &'static str) -> Result<RegisterValue> {
    let (set, buf_size, slice_offset, width) = locate_offset(offset)?;

    let mut buf = vec![0u8; buf_size];
    ptrace::get_regset(tid, set, &mut buf).map_err(|source| Error::Ptrace {
        request: "PTRACE_GETREGSET",
        tid,
        source,
    })?;

    let bytes = &buf[slice_offset..slice_offset + width];
    let value = if width == 16 {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        RegisterValue::U128(u128::from_ne_bytes(raw))
    } else {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        RegisterValue::U64(u64::from_ne_bytes(raw))
    };

    debug!(target: "registers", "read {name}(tid = {tid}) = {value:x?}");

    Ok(value)
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn write_register(
    tid: Pid,
    offset: u64,
    name: &'static str,
    value: RegisterValue,
) -> Result<()> {
    let (set, buf_size, slice_offset, width) = locate_offset(offset)?;

    debug!(target: "registers", "write {name}(tid = {tid}) = {value:x?}");

    // Read-overlay-write: the kernel only transfers whole sets.
    let mut buf = vec![0u8; buf_size];
    ptrace::get_regset(tid, set, &mut buf).map_err(|source| Error::Ptrace {
        request: "PTRACE_GETREGSET",
        tid,
        source,
    })?;

    match (width, value) {
        (16, RegisterValue::U128(v)) => {
            buf[slice_offset..slice_offset + 16].copy_from_slice(&v.to_ne_bytes());
        }
        (16, RegisterValue::U64(v)) => {
            buf[slice_offset..slice_offset + 16]
                .copy_from_slice(&u128::from(v).to_ne_bytes());
        }
        (_, value) => {
            buf[slice_offset..slice_offset + 8].copy_from_slice(&value.as_u64().to_ne_bytes());
        }
    }

    ptrace::set_regset(tid, set, &buf).map_err(|source| Error::Ptrace {
        request: "PTRACE_SETREGSET",
        tid,
        source,
    })
}

/// Maps a `user`-style byte offset to (set id, set size, offset within the
/// set, value width). Offsets below the general-purpose boundary address
/// the GPR set at 8-byte width; the remainder addresses the fpsimd set at
/// 16-byte width.
#[cfg(target_arch = "aarch64")]
fn locate_offset(offset: u64) -> Result<(u32, usize, usize, usize)> {
    let offset = offset as usize;

    if offset + 8 <= aarch64::GPR_SIZE {
        return Ok((aarch64::NT_PRSTATUS, aarch64::GPR_SIZE, offset, 8));
    }

    let fp_offset = offset - aarch64::GPR_SIZE;
    if fp_offset + 16 <= aarch64::FPR_SIZE {
        return Ok((aarch64::NT_FPREGSET, aarch64::FPR_SIZE, fp_offset, 16));
    }

    Err(Error::RegisterOffset {
        offset: offset as u64,
    })
}

pub(crate) fn read_gpr(tid: Pid, buf: &mut [u8]) -> Result<()> {
    #[cfg(target_arch = "x86_64")]
    let res = ptrace::get_regs(tid, buf);

    #[cfg(target_arch = "aarch64")]
    let res = ptrace::get_regset(tid, aarch64::NT_PRSTATUS, buf);

    res.map_err(|source| Error::Ptrace {
        request: "read GPR",
        tid,
        source,
    })
}

pub(crate) fn write_gpr(tid: Pid, buf: &[u8]) -> Result<()> {
    #[cfg(target_arch = "x86_64")]
    let res = ptrace::set_regs(tid, buf);

    #[cfg(target_arch = "aarch64")]
    let res = ptrace::set_regset(tid, aarch64::NT_PRSTATUS, buf);

    res.map_err(|source| Error::Ptrace {
        request: "write GPR",
        tid,
        source,
    })
}

pub(crate) fn read_fpr(tid: Pid, buf: &mut [u8]) -> Result<()> {
    #[cfg(target_arch = "x86_64")]
    let res = ptrace::get_fpregs(tid, buf);

    #[cfg(target_arch = "aarch64")]
    let res = ptrace::get_regset(tid, aarch64::NT_FPREGSET, buf);

    res.map_err(|source| Error::Ptrace {
        request: "read FPR",
        tid,
        source,
    })
}

pub(crate) fn write_fpr(tid: Pid, buf: &[u8]) -> Result<()> {
    #[cfg(target_arch = "x86_64")]
    let res = ptrace::set_fpregs(tid, buf);

    #[cfg(target_arch = "aarch64")]
    let res = ptrace::set_regset(tid, aarch64::NT_FPREGSET, buf);

    res.map_err(|source| Error::Ptrace {
        request: "write FPR",
        tid,
        source,
    })
}

pub(crate) fn read_register_set(tid: Pid, buf: &mut [u8], set: u32) -> Result<()> {
    ptrace::get_regset(tid, set, buf).map_err(|source| Error::Ptrace {
        request: "PTRACE_GETREGSET",
        tid,
        source,
    })
}

pub(crate) fn write_register_set(tid: Pid, buf: &[u8], set: u32) -> Result<()> {
    ptrace::set_regset(tid, set, buf).map_err(|source| Error::Ptrace {
        request: "PTRACE_SETREGSET",
        tid,
        source,
    })
}

/// Reads the thread pointer. The mechanism is architecture-specific: the FS
/// segment base on x86_64, the dedicated TLS register set on aarch64.
pub(crate) fn read_thread_pointer(tid: Pid) -> Result<u64> {
    debug!(target: "registers", "read thread pointer (tid = {tid})");

    #[cfg(target_arch = "x86_64")]
    {
        ptrace::arch_prctl_get_fs(tid).map_err(|source| Error::Ptrace {
            request: "PTRACE_ARCH_PRCTL",
            tid,
            source,
        })
    }

    #[cfg(target_arch = "aarch64")]
    {
        let mut buf = [0u8; 8];
        ptrace::get_regset(tid, aarch64::NT_ARM_TLS, &mut buf).map_err(|source| {
            Error::Ptrace {
                request: "PTRACE_GETREGSET",
                tid,
                source,
            }
        })?;

        Ok(u64::from_ne_bytes(buf))
    }
}

/// Hardware watchpoint and breakpoint slot counts, from the debug-register
/// info words.
#[cfg(target_arch = "aarch64")]
pub(crate) fn read_hardware_debug_info(tid: Pid) -> Result<(u32, u32)> {
    let mut state = aarch64::user_hwdebug_state::new();

    let buf = unsafe {
        std::slice::from_raw_parts_mut(
            &mut state as *mut aarch64::user_hwdebug_state as *mut u8,
            std::mem::size_of::<aarch64::user_hwdebug_state>(),
        )
    };

    ptrace::get_regset(tid, aarch64::DebugRegisterKind::Watch as u32, buf).map_err(|source| {
        Error::Ptrace {
            request: "PTRACE_GETREGSET",
            tid,
            source,
        }
    })?;
    let watchpoints = state.slot_count();

    ptrace::get_regset(tid, aarch64::DebugRegisterKind::Break as u32, buf).map_err(|source| {
        Error::Ptrace {
            request: "PTRACE_GETREGSET",
            tid,
            source,
        }
    })?;
    let breakpoints = state.slot_count();

    Ok((watchpoints, breakpoints))
}

/// Installs hardware debug address/control pairs of the given kind.
#[cfg(target_arch = "aarch64")]
pub(crate) fn write_hardware_debug_regs(
    tid: Pid,
    addrs: &[u64],
    ctrls: &[u32],
    kind: aarch64::DebugRegisterKind,
) -> Result<()> {
    let count = addrs.len().min(ctrls.len()).min(16);
    let mut state = aarch64::user_hwdebug_state::new();

    for i in 0..count {
        state.dbg_regs[i].addr = addrs[i];
        state.dbg_regs[i].ctrl = ctrls[i];
    }

    let buf = unsafe {
        std::slice::from_raw_parts(
            &state as *const aarch64::user_hwdebug_state as *const u8,
            std::mem::size_of::<aarch64::user_hwdebug_state>(),
        )
    };

    ptrace::set_regset(tid, kind as u32, buf).map_err(|source| Error::Ptrace {
        request: "PTRACE_SETREGSET",
        tid,
        source,
    })
}

#[cfg(all(test, target_arch = "aarch64"))]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn offsets_split_at_the_gpr_boundary() {
        let (set, _, off, width) = locate_offset(0).unwrap();
        assert_eq!(set, aarch64::NT_PRSTATUS);
        assert_eq!((off, width), (0, 8));

        let last_gpr = (aarch64::GPR_SIZE - 8) as u64;
        let (set, _, off, width) = locate_offset(last_gpr).unwrap();
        assert_eq!(set, aarch64::NT_PRSTATUS);
        assert_eq!((off, width), (aarch64::GPR_SIZE - 8, 8));

        let first_fpr = aarch64::GPR_SIZE as u64;
        let (set, _, off, width) = locate_offset(first_fpr).unwrap();
        assert_eq!(set, aarch64::NT_FPREGSET);
        assert_eq!((off, width), (0, 16));
    }

    #[test]
    fn offsets_past_both_sets_fail() {
        let too_far = (aarch64::GPR_SIZE + aarch64::FPR_SIZE) as u64;

        assert!(matches!(
            locate_offset(too_far),
            Err(crate::error::Error::RegisterOffset { .. })
        ));
    }
}
