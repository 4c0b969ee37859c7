//! Helpers shared by in-crate unit tests.

/// Builds a `siginfo_t` with the given decode fields.
///
/// The union following the three header ints starts at byte 16 on 64-bit
/// glibc targets; its first word holds `si_pid` (low 4 bytes) for
/// user-origin signals and `si_addr` for faults. Exactly one of
/// `sender_pid`/`addr` is meaningful per decode, so both share the slot.
pub(crate) fn fake_siginfo(signo: i32, code: i32, sender_pid: i32, addr: u64) -> libc::siginfo_t {
    #[repr(C)]
    struct RawSiginfo {
        si_signo: i32,
        si_errno: i32,
        si_code: i32,
        _pad: i32,
        fields: [u64; 14],
    }

    let mut raw = RawSiginfo {
        si_signo: signo,
        si_errno: 0,
        si_code: code,
        _pad: 0,
        fields: [0; 14],
    };

    raw.fields[0] = if sender_pid != 0 {
        sender_pid as u32 as u64
    } else {
        addr
    };

    unsafe { std::mem::transmute(raw) }
}
