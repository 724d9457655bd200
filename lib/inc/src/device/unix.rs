//! Unix stream transport with SCM_RIGHTS descriptor passing.
//!
//! One descriptor may accompany each message; it rides the ancillary data
//! of the sendmsg carrying the message's first byte, which is how
//! shared-memory pool descriptors reach the peer.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use mio::net::{UnixListener, UnixStream};

use axon::dispatcher::EventDispatcher;
use axon::logging::{self, Logger};
use axon::object::{self, Object, ObjectRef};
use axon::source::{EventSource, Readiness};
use axon::variant::Variant;

use crate::error::{IncError, IncResult};

use super::{signals, Device, DeviceRef, Monitor, Role, DEVICE_META};

fn sendmsg_with_fd(sock: RawFd, bytes: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        let mut cmsg_space = [0u8; 64];
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if let Some(fd) = fd {
            msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) as usize;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as usize;
            std::ptr::copy_nonoverlapping(
                &fd as *const RawFd as *const u8,
                libc::CMSG_DATA(cmsg),
                std::mem::size_of::<RawFd>(),
            );
        }

        let rc = libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL);
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

fn recvmsg_with_fds(sock: RawFd, buf: &mut [u8], fds: &mut VecDeque<RawFd>) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut cmsg_space = [0u8; 256];
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space.len();

        let rc = libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC);
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len - libc::CMSG_LEN(0) as usize;
                let count = payload / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push_back(data.add(i).read_unaligned());
                }
            }
            cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
        }

        Ok(rc as usize)
    }
}

enum UnixState {
    Connecting { stream: UnixStream, path: PathBuf },
    Connected { stream: UnixStream, path: PathBuf },
    Listening { listener: UnixListener, path: PathBuf },
    Closed,
}

struct UnixInner {
    role: Role,
    state: Mutex<UnixState>,
    monitor: Mutex<Monitor>,
    out_fds: Mutex<VecDeque<RawFd>>,
    in_fds: Mutex<VecDeque<RawFd>>,
    log: Logger,
}

pub struct UnixDevice {
    object: ObjectRef,
    inner: Arc<UnixInner>,
}

impl UnixDevice {
    fn build(role: Role, state: UnixState, log: Option<&Logger>) -> Arc<UnixDevice> {
        let object = Object::new(&DEVICE_META, "unix-device", log);
        let log = logging::child(log, logging::o!("device" => "unix"));

        Arc::new(UnixDevice {
            object,
            inner: Arc::new(UnixInner {
                role,
                state: Mutex::new(state),
                monitor: Mutex::new(Monitor::new()),
                out_fds: Mutex::new(VecDeque::new()),
                in_fds: Mutex::new(VecDeque::new()),
                log,
            }),
        })
    }

    pub fn connect_to<'a, L: Into<Option<&'a Logger>>>(
        path: &str,
        log: L,
    ) -> IncResult<Arc<UnixDevice>> {
        let stream = UnixStream::connect(path).map_err(|_| IncError::ConnectionFailed)?;

        Ok(UnixDevice::build(
            Role::Client,
            UnixState::Connecting {
                stream,
                path: PathBuf::from(path),
            },
            log.into(),
        ))
    }

    pub fn listen_on<'a, L: Into<Option<&'a Logger>>>(
        path: &str,
        log: L,
    ) -> IncResult<Arc<UnixDevice>> {
        // A previous instance may have left its socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|_| IncError::ConnectionFailed)?;

        Ok(UnixDevice::build(
            Role::Server,
            UnixState::Listening {
                listener,
                path: PathBuf::from(path),
            },
            log.into(),
        ))
    }

    fn accepted(stream: UnixStream, path: PathBuf, log: &Logger) -> Arc<UnixDevice> {
        UnixDevice::build(
            Role::Client,
            UnixState::Connected { stream, path },
            Some(log),
        )
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match &*self.inner.state.lock().expect("unix state poisoned") {
            UnixState::Connecting { stream, .. } => Some(stream.as_raw_fd()),
            UnixState::Connected { stream, .. } => Some(stream.as_raw_fd()),
            UnixState::Listening { listener, .. } => Some(listener.as_raw_fd()),
            UnixState::Closed => None,
        }
    }
}

impl Device for UnixDevice {
    fn object(&self) -> &ObjectRef {
        &self.object
    }

    fn role(&self) -> Role {
        self.inner.role
    }

    fn is_open(&self) -> bool {
        !matches!(
            &*self.inner.state.lock().expect("unix state poisoned"),
            UnixState::Closed
        )
    }

    fn is_writable(&self) -> bool {
        matches!(
            &*self.inner.state.lock().expect("unix state poisoned"),
            UnixState::Connected { .. }
        )
    }

    fn close(&self) {
        let mut state = self.inner.state.lock().expect("unix state poisoned");
        let previous = std::mem::replace(&mut *state, UnixState::Closed);
        drop(state);

        match previous {
            UnixState::Listening { path, .. } => {
                let _ = std::fs::remove_file(&path);
            }
            UnixState::Closed => return,
            _ => {}
        }

        logging::debug!(self.inner.log, "closed unix device");

        let mut monitor = self.inner.monitor.lock().expect("unix monitor poisoned");
        monitor.read = false;
        monitor.write = false;
        monitor.apply();
    }

    fn read(&self, max_len: usize) -> IncResult<Vec<u8>> {
        let state = self.inner.state.lock().expect("unix state poisoned");
        let fd = match &*state {
            UnixState::Connected { stream, .. } => stream.as_raw_fd(),
            UnixState::Closed => return Err(IncError::NotConnected),
            _ => return Ok(Vec::new()),
        };

        let mut buf = vec![0u8; max_len.min(64 * 1024)];
        let mut fds = self.inner.in_fds.lock().expect("unix fd queue poisoned");

        match recvmsg_with_fds(fd, &mut buf, &mut fds) {
            Ok(0) => Err(IncError::Disconnected),
            Ok(count) => {
                buf.truncate(count);
                Ok(buf)
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(Vec::new()),
            Err(_) => Err(IncError::Disconnected),
        }
    }

    fn write(&self, bytes: &[u8]) -> IncResult<usize> {
        let state = self.inner.state.lock().expect("unix state poisoned");
        let fd = match &*state {
            UnixState::Connected { stream, .. } => stream.as_raw_fd(),
            _ => return Err(IncError::NotConnected),
        };

        let mut out_fds = self.inner.out_fds.lock().expect("unix fd queue poisoned");
        let passed = out_fds.front().copied();

        match sendmsg_with_fd(fd, bytes, passed) {
            Ok(0) => Ok(0),
            Ok(count) => {
                if passed.is_some() {
                    out_fds.pop_front();
                }
                Ok(count)
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(_) => Err(IncError::WriteFailed),
        }
    }

    fn peer_address(&self) -> String {
        match &*self.inner.state.lock().expect("unix state poisoned") {
            UnixState::Connecting { path, .. }
            | UnixState::Connected { path, .. }
            | UnixState::Listening { path, .. } => path.display().to_string(),
            UnixState::Closed => String::new(),
        }
    }

    fn is_local(&self) -> bool {
        true
    }

    fn start_event_monitoring(&self, dispatcher: &Rc<dyn EventDispatcher>) -> bool {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return false,
        };

        let mut monitor = self.inner.monitor.lock().expect("unix monitor poisoned");
        if monitor.source.is_some() {
            return true;
        }

        let source = dispatcher.attach_source(Box::new(UnixSource {
            object: self.object.clone(),
            inner: self.inner.clone(),
            pending: Readiness::default(),
        }));

        let connecting = matches!(
            &*self.inner.state.lock().expect("unix state poisoned"),
            UnixState::Connecting { .. }
        );
        let interest = if connecting {
            mio::Interest::READABLE | mio::Interest::WRITABLE
        } else {
            match monitor.interest() {
                Some(interest) => interest,
                None => mio::Interest::READABLE,
            }
        };

        if dispatcher.register_fd(source, fd, interest).is_err() {
            dispatcher.detach_source(source);
            return false;
        }

        monitor.source = Some(source);
        monitor.fd = Some(fd);
        monitor.registered = true;
        true
    }

    fn config_event_ability(&self, read: bool, write: bool) {
        let mut monitor = self.inner.monitor.lock().expect("unix monitor poisoned");
        monitor.read = read;
        monitor.write = write;
        monitor.apply();
    }

    fn supports_fd_passing(&self) -> bool {
        true
    }

    fn set_out_fd(&self, fd: RawFd) {
        self.inner
            .out_fds
            .lock()
            .expect("unix fd queue poisoned")
            .push_back(fd);
    }

    fn take_pending_fd(&self) -> Option<RawFd> {
        self.inner
            .in_fds
            .lock()
            .expect("unix fd queue poisoned")
            .pop_front()
    }
}

struct UnixSource {
    object: ObjectRef,
    inner: Arc<UnixInner>,
    pending: Readiness,
}

impl EventSource for UnixSource {
    fn name(&self) -> &'static str {
        "unix-device"
    }

    fn prepare(&mut self, _timeout: &mut Option<std::time::Duration>) -> bool {
        false
    }

    fn check(&mut self, ready: Readiness) -> bool {
        self.pending = ready;
        ready.any()
    }

    fn dispatch(&mut self) -> bool {
        let ready = std::mem::take(&mut self.pending);

        enum Action {
            Accepted(Vec<(UnixStream, PathBuf)>),
            ConnectFinished(bool),
            Traffic { readable: bool, writable: bool, closed: bool },
            Gone,
        }

        let action = {
            let mut state = self.inner.state.lock().expect("unix state poisoned");
            match &*state {
                UnixState::Listening { listener, path } => {
                    let mut accepted = Vec::new();
                    loop {
                        match listener.accept() {
                            Ok((stream, _)) => accepted.push((stream, path.clone())),
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                            Err(err) => {
                                logging::error!(self.inner.log, "accept failed"; "error" => %err);
                                break;
                            }
                        }
                    }
                    Action::Accepted(accepted)
                }
                UnixState::Connecting { stream, path } => {
                    if !(ready.writable || ready.error || ready.closed) {
                        return true;
                    }

                    let failed = match stream.take_error() {
                        Ok(None) => stream.peer_addr().is_err(),
                        _ => true,
                    };
                    let path = path.clone();

                    if failed {
                        *state = UnixState::Closed;
                        Action::ConnectFinished(false)
                    } else {
                        let previous = std::mem::replace(&mut *state, UnixState::Closed);
                        if let UnixState::Connecting { stream, .. } = previous {
                            *state = UnixState::Connected { stream, path };
                        }
                        Action::ConnectFinished(true)
                    }
                }
                UnixState::Connected { .. } => Action::Traffic {
                    readable: ready.readable,
                    writable: ready.writable,
                    closed: ready.closed || ready.error,
                },
                UnixState::Closed => Action::Gone,
            }
        };

        match action {
            Action::Accepted(accepted) => {
                for (stream, path) in accepted {
                    logging::debug!(self.inner.log, "accepted connection"; "path" => %path.display());
                    let device: DeviceRef = UnixDevice::accepted(stream, path, &self.inner.log);
                    object::emit(
                        &self.object,
                        &signals::NEW_CONNECTION,
                        &[Variant::new(device)],
                    );
                }
                true
            }
            Action::ConnectFinished(true) => {
                self.inner
                    .monitor
                    .lock()
                    .expect("unix monitor poisoned")
                    .apply();
                object::emit(&self.object, &signals::CONNECTED, &[]);
                true
            }
            Action::ConnectFinished(false) => {
                object::emit(
                    &self.object,
                    &signals::ERROR_OCCURRED,
                    &[Variant::from(IncError::ConnectionFailed.code())],
                );
                false
            }
            Action::Traffic {
                readable,
                writable,
                closed,
            } => {
                if readable || closed {
                    object::emit(&self.object, &signals::READY_READ, &[]);
                }
                if writable {
                    object::emit(&self.object, &signals::BYTES_WRITTEN, &[Variant::from(0u64)]);
                }
                if closed {
                    *self.inner.state.lock().expect("unix state poisoned") = UnixState::Closed;
                    object::emit(&self.object, &signals::DISCONNECTED, &[]);
                    return false;
                }
                true
            }
            Action::Gone => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> String {
        format!("/tmp/inc-unix-test-{}-{}.sock", tag, std::process::id())
    }

    #[test]
    fn test_listen_creates_and_close_removes_socket_file() {
        let path = temp_path("lifecycle");
        let server = UnixDevice::listen_on(&path, None).unwrap();

        assert!(std::path::Path::new(&path).exists());
        assert!(server.supports_fd_passing());
        assert!(server.is_local());

        server.close();
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_connect_to_missing_path_fails() {
        assert_eq!(
            UnixDevice::connect_to("/tmp/inc-no-such-socket.sock", None).err(),
            Some(IncError::ConnectionFailed)
        );
    }

    #[test]
    fn test_fd_passing_over_socketpair() {
        // Raw socketpair exercise of the sendmsg/recvmsg plumbing.
        let mut pair = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                pair.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);

        let passed = unsafe { libc::memfd_create(b"passed\0".as_ptr() as *const _, 0) };
        assert!(passed >= 0);

        let sent = sendmsg_with_fd(pair[0], b"with-fd", Some(passed)).unwrap();
        assert_eq!(sent, 7);

        let mut buf = [0u8; 32];
        let mut fds = VecDeque::new();
        let received = recvmsg_with_fds(pair[1], &mut buf, &mut fds).unwrap();

        assert_eq!(&buf[..received], b"with-fd");
        assert_eq!(fds.len(), 1);

        let received_fd = fds.pop_front().unwrap();
        assert!(received_fd >= 0);
        assert_ne!(received_fd, passed);

        unsafe {
            libc::close(passed);
            libc::close(received_fd);
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }
}
