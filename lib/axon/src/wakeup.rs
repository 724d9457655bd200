//! Cross-thread wake primitive exposing a single pollable descriptor.
//!
//! `signal` is edge-collapsed: a flag gates the descriptor write so any
//! number of signals between two acknowledgements costs one syscall and one
//! poll wakeup. Backed by an eventfd on Linux and a non-blocking pipe pair
//! elsewhere.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Wakeup {
    read_fd: RawFd,
    write_fd: RawFd,
    signaled: AtomicBool,
}

impl Wakeup {
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<Wakeup> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Wakeup {
            read_fd: fd,
            write_fd: fd,
            signaled: AtomicBool::new(false),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> io::Result<Wakeup> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        for &fd in fds.iter() {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        Ok(Wakeup {
            read_fd: fds[0],
            write_fd: fds[1],
            signaled: AtomicBool::new(false),
        })
    }

    /// The descriptor a dispatcher polls for readability.
    #[inline]
    pub fn poll_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wake any poller. Idempotent until the next `acknowledge`.
    pub fn signal(&self) {
        if self.signaled.swap(true, Ordering::AcqRel) {
            return;
        }

        let value: u64 = 1;
        loop {
            let rc = unsafe {
                libc::write(
                    self.write_fd,
                    &value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };

            if rc >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return;
            }
        }
    }

    /// Drain the descriptor and re-arm the signal gate.
    pub fn acknowledge(&self) {
        let mut buf = [0u8; 16];
        loop {
            let rc = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };

            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break;
            }

            // An eventfd hands back its whole counter in one read.
            if rc == 0 || self.read_fd == self.write_fd {
                break;
            }
        }

        self.signaled.store(false, Ordering::Release);
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, 0) > 0 }
    }

    #[test]
    fn test_signal_makes_fd_readable() {
        let wakeup = Wakeup::new().unwrap();
        assert!(!readable(wakeup.poll_fd()));

        wakeup.signal();
        assert!(readable(wakeup.poll_fd()));
    }

    #[test]
    fn test_repeated_signals_collapse() {
        let wakeup = Wakeup::new().unwrap();

        wakeup.signal();
        wakeup.signal();
        wakeup.signal();

        wakeup.acknowledge();
        assert!(!readable(wakeup.poll_fd()));
    }

    #[test]
    fn test_signal_after_acknowledge_rearms() {
        let wakeup = Wakeup::new().unwrap();

        wakeup.signal();
        wakeup.acknowledge();
        wakeup.signal();

        assert!(readable(wakeup.poll_fd()));
    }

    #[test]
    fn test_cross_thread_signal() {
        use std::sync::Arc;

        let wakeup = Arc::new(Wakeup::new().unwrap());
        let remote = wakeup.clone();

        let handle = std::thread::spawn(move || remote.signal());
        handle.join().unwrap();

        assert!(readable(wakeup.poll_fd()));
    }
}
