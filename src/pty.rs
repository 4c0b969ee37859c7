//! Pseudo-terminal plumbing for launched inferiors.
//!
//! Both ends are opened before the fork. The child only ever `dup2`s and
//! closes descriptors, which keeps the post-fork path free of allocation;
//! the parent closes its slave copy and hands the master off to the monitor
//! in non-blocking mode.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use nix::fcntl::{self, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::stat::Mode;
use nix::unistd;

pub(crate) struct PseudoTerminal {
    master: Option<PtyMaster>,
    slave: Option<RawFd>,
}

impl PseudoTerminal {
    pub(crate) fn open() -> nix::Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
        grantpt(&master)?;
        unlockpt(&master)?;

        let path = ptsname_r(&master)?;
        let slave = fcntl::open(path.as_str(), OFlag::O_RDWR, Mode::empty())?;

        Ok(Self {
            master: Some(master),
            slave: Some(slave),
        })
    }

    pub(crate) fn master_fd(&self) -> RawFd {
        self.master.as_ref().map(|m| m.as_raw_fd()).unwrap_or(-1)
    }

    pub(crate) fn slave_fd(&self) -> RawFd {
        self.slave.unwrap_or(-1)
    }

    pub(crate) fn close_slave(&mut self) {
        if let Some(fd) = self.slave.take() {
            let _ = unistd::close(fd);
        }
    }

    /// Hands the master descriptor off to the caller, which owns it from
    /// here on. Returns -1 if it was already released.
    pub(crate) fn release_master(mut self) -> RawFd {
        self.close_slave();
        self.master
            .take()
            .map(IntoRawFd::into_raw_fd)
            .unwrap_or(-1)
    }
}

impl Drop for PseudoTerminal {
    fn drop(&mut self) {
        self.close_slave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_a_connected_pair() {
        let mut pty = PseudoTerminal::open().unwrap();

        assert!(pty.master_fd() >= 0);
        assert!(pty.slave_fd() >= 0);

        // The pair is live: bytes written to the slave surface on the master.
        unistd::write(pty.slave_fd(), b"ok\n").unwrap();

        let mut buf = [0u8; 8];
        let n = unistd::read(pty.master_fd(), &mut buf).unwrap();
        assert!(n > 0);

        pty.close_slave();
        assert_eq!(pty.slave_fd(), -1);
    }

    #[test]
    fn release_transfers_master_ownership() {
        let pty = PseudoTerminal::open().unwrap();
        let fd = pty.release_master();

        assert!(fd >= 0);
        unistd::close(fd).unwrap();
    }
}
