//! TCP transport: non-blocking connect, bind+listen+accept, keepalive.

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};

use axon::dispatcher::EventDispatcher;
use axon::logging::{self, Logger};
use axon::object::{self, Object, ObjectRef};
use axon::source::{EventSource, Readiness};
use axon::variant::Variant;

use crate::error::{IncError, IncResult};

use super::{signals, Device, DeviceRef, Monitor, Role, DEVICE_META};

enum TcpState {
    Connecting { stream: TcpStream, peer: SocketAddr },
    Connected { stream: TcpStream, peer: SocketAddr },
    Listening { listener: TcpListener, addr: SocketAddr },
    Closed,
}

struct TcpInner {
    role: Role,
    state: Mutex<TcpState>,
    monitor: Mutex<Monitor>,
    log: Logger,
}

pub struct TcpDevice {
    object: ObjectRef,
    inner: Arc<TcpInner>,
}

fn resolve(host: &str, port: u16) -> IncResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| IncError::ConnectionFailed)?
        .next()
        .ok_or(IncError::ConnectionFailed)
}

fn enable_keepalive(fd: RawFd) {
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

impl TcpDevice {
    fn build(role: Role, state: TcpState, log: Option<&Logger>) -> Arc<TcpDevice> {
        let object = Object::new(&DEVICE_META, "tcp-device", log);
        let log = logging::child(log, logging::o!("device" => "tcp"));

        Arc::new(TcpDevice {
            object,
            inner: Arc::new(TcpInner {
                role,
                state: Mutex::new(state),
                monitor: Mutex::new(Monitor::new()),
                log,
            }),
        })
    }

    /// Begin a non-blocking connect; `connected` fires once established.
    pub fn connect_to<'a, L: Into<Option<&'a Logger>>>(
        host: &str,
        port: u16,
        log: L,
    ) -> IncResult<Arc<TcpDevice>> {
        let peer = resolve(host, port)?;
        let stream = TcpStream::connect(peer).map_err(|_| IncError::ConnectionFailed)?;

        Ok(TcpDevice::build(
            Role::Client,
            TcpState::Connecting { stream, peer },
            log.into(),
        ))
    }

    /// Bind and listen; accepted peers arrive through `new_connection`.
    pub fn listen_on<'a, L: Into<Option<&'a Logger>>>(
        host: &str,
        port: u16,
        log: L,
    ) -> IncResult<Arc<TcpDevice>> {
        let addr = resolve(host, port)?;
        let listener = TcpListener::bind(addr).map_err(|_| IncError::ConnectionFailed)?;

        Ok(TcpDevice::build(
            Role::Server,
            TcpState::Listening { listener, addr },
            log.into(),
        ))
    }

    fn accepted(stream: TcpStream, peer: SocketAddr, log: &Logger) -> Arc<TcpDevice> {
        enable_keepalive(stream.as_raw_fd());
        TcpDevice::build(
            Role::Client,
            TcpState::Connected { stream, peer },
            Some(log),
        )
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match &*self.inner.state.lock().expect("tcp state poisoned") {
            TcpState::Connecting { stream, .. } => Some(stream.as_raw_fd()),
            TcpState::Connected { stream, .. } => Some(stream.as_raw_fd()),
            TcpState::Listening { listener, .. } => Some(listener.as_raw_fd()),
            TcpState::Closed => None,
        }
    }
}

impl Device for TcpDevice {
    fn object(&self) -> &ObjectRef {
        &self.object
    }

    fn role(&self) -> Role {
        self.inner.role
    }

    fn is_open(&self) -> bool {
        !matches!(
            &*self.inner.state.lock().expect("tcp state poisoned"),
            TcpState::Closed
        )
    }

    fn is_writable(&self) -> bool {
        matches!(
            &*self.inner.state.lock().expect("tcp state poisoned"),
            TcpState::Connected { .. }
        )
    }

    fn close(&self) {
        let mut state = self.inner.state.lock().expect("tcp state poisoned");
        if let TcpState::Closed = *state {
            return;
        }

        logging::debug!(self.inner.log, "closing tcp device");
        *state = TcpState::Closed;
        drop(state);

        let mut monitor = self.inner.monitor.lock().expect("tcp monitor poisoned");
        monitor.read = false;
        monitor.write = false;
        monitor.apply();
    }

    fn read(&self, max_len: usize) -> IncResult<Vec<u8>> {
        let mut state = self.inner.state.lock().expect("tcp state poisoned");
        let stream = match &mut *state {
            TcpState::Connected { stream, .. } => stream,
            TcpState::Closed => return Err(IncError::NotConnected),
            _ => return Ok(Vec::new()),
        };

        let mut buf = vec![0u8; max_len.min(64 * 1024)];
        match stream.read(&mut buf) {
            Ok(0) => Err(IncError::Disconnected),
            Ok(count) => {
                buf.truncate(count);
                Ok(buf)
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(Vec::new()),
            Err(_) => Err(IncError::Disconnected),
        }
    }

    fn write(&self, bytes: &[u8]) -> IncResult<usize> {
        let mut state = self.inner.state.lock().expect("tcp state poisoned");
        let stream = match &mut *state {
            TcpState::Connected { stream, .. } => stream,
            _ => return Err(IncError::NotConnected),
        };

        match stream.write(bytes) {
            Ok(count) => Ok(count),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(_) => Err(IncError::WriteFailed),
        }
    }

    fn peer_address(&self) -> String {
        match &*self.inner.state.lock().expect("tcp state poisoned") {
            TcpState::Connecting { peer, .. } | TcpState::Connected { peer, .. } => {
                peer.to_string()
            }
            TcpState::Listening { addr, .. } => addr.to_string(),
            TcpState::Closed => String::new(),
        }
    }

    fn is_local(&self) -> bool {
        match &*self.inner.state.lock().expect("tcp state poisoned") {
            TcpState::Connecting { peer, .. } | TcpState::Connected { peer, .. } => {
                peer.ip().is_loopback()
            }
            TcpState::Listening { addr, .. } => addr.ip().is_loopback(),
            TcpState::Closed => false,
        }
    }

    fn start_event_monitoring(&self, dispatcher: &Rc<dyn EventDispatcher>) -> bool {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return false,
        };

        let mut monitor = self.inner.monitor.lock().expect("tcp monitor poisoned");
        if monitor.source.is_some() {
            return true;
        }

        let source = dispatcher.attach_source(Box::new(TcpSource {
            object: self.object.clone(),
            inner: self.inner.clone(),
            pending: Readiness::default(),
        }));

        // A connecting socket needs writability to observe completion; a
        // listener only needs readability.
        let connecting = matches!(
            &*self.inner.state.lock().expect("tcp state poisoned"),
            TcpState::Connecting { .. }
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
        let mut monitor = self.inner.monitor.lock().expect("tcp monitor poisoned");
        monitor.read = read;
        monitor.write = write;
        monitor.apply();
    }
}

struct TcpSource {
    object: ObjectRef,
    inner: Arc<TcpInner>,
    pending: Readiness,
}

impl EventSource for TcpSource {
    fn name(&self) -> &'static str {
        "tcp-device"
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
            Accepted(Vec<(TcpStream, SocketAddr)>),
            ConnectFinished(bool),
            Traffic { readable: bool, writable: bool, closed: bool },
            Gone,
        }

        let action = {
            let mut state = self.inner.state.lock().expect("tcp state poisoned");
            match &*state {
                TcpState::Listening { listener, .. } => {
                    let mut accepted = Vec::new();
                    loop {
                        match listener.accept() {
                            Ok(pair) => accepted.push(pair),
                            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {
                                continue
                            }
                            Err(err) => {
                                logging::error!(self.inner.log, "accept failed"; "error" => %err);
                                break;
                            }
                        }
                    }
                    Action::Accepted(accepted)
                }
                TcpState::Connecting { stream, peer } => {
                    if !(ready.writable || ready.error || ready.closed) {
                        return true;
                    }

                    let failed = match stream.take_error() {
                        Ok(None) => stream.peer_addr().is_err(),
                        _ => true,
                    };
                    let fd = stream.as_raw_fd();
                    let peer = *peer;

                    if failed {
                        *state = TcpState::Closed;
                        Action::ConnectFinished(false)
                    } else {
                        enable_keepalive(fd);
                        let previous = std::mem::replace(&mut *state, TcpState::Closed);
                        if let TcpState::Connecting { stream, .. } = previous {
                            *state = TcpState::Connected { stream, peer };
                        }
                        Action::ConnectFinished(true)
                    }
                }
                TcpState::Connected { .. } => Action::Traffic {
                    readable: ready.readable,
                    writable: ready.writable,
                    closed: ready.closed || ready.error,
                },
                TcpState::Closed => Action::Gone,
            }
        };

        match action {
            Action::Accepted(accepted) => {
                for (stream, peer) in accepted {
                    logging::debug!(self.inner.log, "accepted connection"; "peer" => %peer);
                    let device = TcpDevice::accepted(stream, peer, &self.inner.log);
                    let device: DeviceRef = device;
                    object::emit(
                        &self.object,
                        &signals::NEW_CONNECTION,
                        &[Variant::new(device)],
                    );
                }
                true
            }
            Action::ConnectFinished(true) => {
                logging::debug!(self.inner.log, "tcp connect completed");
                // Drop the forced writability now the connect finished.
                self.inner
                    .monitor
                    .lock()
                    .expect("tcp monitor poisoned")
                    .apply();
                object::emit(&self.object, &signals::CONNECTED, &[]);
                true
            }
            Action::ConnectFinished(false) => {
                logging::warn!(self.inner.log, "tcp connect failed");
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
                    let mut state = self.inner.state.lock().expect("tcp state poisoned");
                    *state = TcpState::Closed;
                    drop(state);
                    object::emit(&self.object, &signals::DISCONNECTED, &[]);
                    return false;
                }
                true
            }
            Action::Gone => false,
        }
    }
}
