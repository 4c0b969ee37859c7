//! Word-granular transfers of inferior memory.
//!
//! ptrace moves one host word per request; the word size is the host pointer
//! width, not the inferior's. Reads loop over `PEEKDATA`. Writes poke full
//! words directly, and a trailing partial word is read, overlaid, and written
//! back through the same helpers so the bytes outside the requested range
//! survive and every kernel call stays on the owner thread.

use libc::c_long;
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::ptrace::{self, fmt_bytes};

const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Transfers at or under this budget are echoed in the short-form log.
const SHORT_LOG_BYTES: usize = 32;

/// One word of tracee address space, addressable for peek and poke.
///
/// The live implementation is ptrace against a stopped task; tests substitute
/// an in-memory fake.
pub(crate) trait WordDevice {
    fn peek(&mut self, addr: u64) -> nix::Result<c_long>;
    fn poke(&mut self, addr: u64, word: c_long) -> nix::Result<()>;
}

/// Live tracee device. Only ever constructed on the owner thread.
pub(crate) struct Inferior(pub(crate) Pid);

impl WordDevice for Inferior {
    fn peek(&mut self, addr: u64) -> nix::Result<c_long> {
        ptrace::peek_data(self.0, addr)
    }

    fn poke(&mut self, addr: u64, word: c_long) -> nix::Result<()> {
        ptrace::poke_data(self.0, addr, word)
    }
}

pub(crate) fn read(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize> {
    debug!(target: "memory", "read(pid = {pid}, addr = {addr:#x}, len = {})", buf.len());
    read_from(&mut Inferior(pid), addr, buf)
}

pub(crate) fn write(pid: Pid, addr: u64, data: &[u8]) -> Result<usize> {
    debug!(target: "memory", "write(pid = {pid}, addr = {addr:#x}, len = {})", data.len());
    write_to(&mut Inferior(pid), addr, data)
}

fn read_from<D: WordDevice>(dev: &mut D, addr: u64, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;

    while done < buf.len() {
        let word = match dev.peek(addr + done as u64) {
            Ok(word) => word,
            Err(errno) => {
                return Err(Error::MemoryRead {
                    addr,
                    completed: done,
                    source: errno,
                })
            }
        };

        let chunk = (buf.len() - done).min(WORD_SIZE);
        buf[done..done + chunk].copy_from_slice(&word.to_ne_bytes()[..chunk]);
        done += chunk;
    }

    log_transfer("read", addr, buf);

    Ok(done)
}

fn write_to<D: WordDevice>(dev: &mut D, addr: u64, data: &[u8]) -> Result<usize> {
    let mut done = 0;

    while done < data.len() {
        let cur = addr + done as u64;
        let remainder = (data.len() - done).min(WORD_SIZE);

        if remainder == WORD_SIZE {
            let mut word = [0u8; WORD_SIZE];
            word.copy_from_slice(&data[done..done + WORD_SIZE]);

            if let Err(errno) = dev.poke(cur, c_long::from_ne_bytes(word)) {
                return Err(Error::MemoryWrite {
                    addr,
                    completed: done,
                    source: errno,
                });
            }
        } else {
            // Trailing partial word: fetch the target word, overlay the
            // requested bytes, and write the whole word back. Recursing
            // through the same read/write paths keeps the transfer on
            // whichever task drives this device.
            let mut word = [0u8; WORD_SIZE];

            read_from(dev, cur, &mut word).map_err(|err| Error::MemoryWrite {
                addr,
                completed: done,
                source: err.errno().unwrap_or(nix::errno::Errno::EIO),
            })?;

            word[..remainder].copy_from_slice(&data[done..]);

            write_to(dev, cur, &word).map_err(|err| Error::MemoryWrite {
                addr,
                completed: done,
                source: err.errno().unwrap_or(nix::errno::Errno::EIO),
            })?;
        }

        done += remainder;
    }

    log_transfer("write", addr, data);

    Ok(done)
}

fn log_transfer(kind: &str, addr: u64, bytes: &[u8]) {
    if bytes.len() <= SHORT_LOG_BYTES {
        debug!(
            target: "memory",
            "{kind} [{addr:#x}] {}",
            fmt_bytes(bytes, SHORT_LOG_BYTES)
        );
    }
    trace!(target: "memory", "{kind} [{addr:#x}] {}", fmt_bytes(bytes, bytes.len()));
}
