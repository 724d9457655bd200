//! UDP transport.
//!
//! Datagrams carry no connection, so the server-role device multiplexes one
//! socket across per-peer virtual client devices. Both directions enforce
//! one complete framed message per datagram: writers accumulate bytes and
//! flush only whole frames, readers queue whole datagrams.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use mio::net::UdpSocket;

use axon::dispatcher::EventDispatcher;
use axon::logging::{self, Logger};
use axon::object::{self, Object, ObjectRef};
use axon::source::{EventSource, Readiness};
use axon::variant::Variant;

use crate::buffer::Buffer;
use crate::error::{IncError, IncResult};
use crate::message::{HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE};

use super::{signals, Device, DeviceRef, Monitor, Role, DEVICE_META};

const DATAGRAM_MAX: usize = 64 * 1024;

/// Inspect an accumulation buffer for one complete frame; `Ok(Some(len))`
/// is the total frame length ready to flush.
fn complete_frame(buf: &Buffer) -> IncResult<Option<usize>> {
    let data = buf.as_slice();
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    if LittleEndian::read_u32(&data[0..4]) != MAGIC {
        return Err(IncError::ProtocolError);
    }

    let length = LittleEndian::read_u32(&data[20..24]);
    if length > MAX_MESSAGE_SIZE {
        return Err(IncError::MessageTooLarge);
    }

    let total = HEADER_SIZE + length as usize;
    if data.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

enum UdpState {
    /// Client role: socket connected to one peer.
    Connected { socket: UdpSocket, peer: SocketAddr },
    /// Server role: bound socket shared by all virtual clients.
    Bound { socket: UdpSocket, addr: SocketAddr },
    Closed,
}

struct UdpInner {
    role: Role,
    state: Mutex<UdpState>,
    monitor: Mutex<Monitor>,
    // Client-role framing buffers.
    out: Mutex<Buffer>,
    incoming: Mutex<Buffer>,
    // Server-role multiplexing.
    clients: Mutex<HashMap<SocketAddr, Arc<UdpClientDevice>>>,
    pending: Mutex<Option<Arc<UdpClientDevice>>>,
    write_waiters: Mutex<Vec<(Weak<UdpClientInner>, ObjectRef)>>,
    log: Logger,
}

impl UdpInner {
    fn send_to(&self, payload: &[u8], peer: SocketAddr) -> IncResult<usize> {
        let state = self.state.lock().expect("udp state poisoned");
        let socket = match &*state {
            UdpState::Bound { socket, .. } => socket,
            UdpState::Connected { socket, .. } => socket,
            UdpState::Closed => return Err(IncError::NotConnected),
        };

        match socket.send_to(payload, peer) {
            Ok(count) => Ok(count),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(_) => Err(IncError::WriteFailed),
        }
    }

    /// Ask for a writable wakeup to resume a blocked virtual client.
    fn enlist_writer(&self, waiter: &Arc<UdpClientInner>, object: &ObjectRef) {
        self.write_waiters
            .lock()
            .expect("udp waiters poisoned")
            .push((Arc::downgrade(waiter), object.clone()));

        let mut monitor = self.monitor.lock().expect("udp monitor poisoned");
        monitor.write = true;
        monitor.apply();
    }
}

pub struct UdpDevice {
    object: ObjectRef,
    inner: Arc<UdpInner>,
}

impl UdpDevice {
    fn build(role: Role, state: UdpState, log: Option<&Logger>) -> Arc<UdpDevice> {
        let object = Object::new(&DEVICE_META, "udp-device", log);
        let log = logging::child(log, logging::o!("device" => "udp"));

        Arc::new(UdpDevice {
            object,
            inner: Arc::new(UdpInner {
                role,
                state: Mutex::new(state),
                monitor: Mutex::new(Monitor::new()),
                out: Mutex::new(Buffer::new()),
                incoming: Mutex::new(Buffer::new()),
                clients: Mutex::new(HashMap::new()),
                pending: Mutex::new(None),
                write_waiters: Mutex::new(Vec::new()),
                log,
            }),
        })
    }

    pub fn connect_to<'a, L: Into<Option<&'a Logger>>>(
        host: &str,
        port: u16,
        log: L,
    ) -> IncResult<Arc<UdpDevice>> {
        let peer: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| IncError::InvalidArgs)?;

        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };

        let socket = UdpSocket::bind(local).map_err(|_| IncError::ConnectionFailed)?;
        socket.connect(peer).map_err(|_| IncError::ConnectionFailed)?;

        Ok(UdpDevice::build(
            Role::Client,
            UdpState::Connected { socket, peer },
            log.into(),
        ))
    }

    pub fn bind_on<'a, L: Into<Option<&'a Logger>>>(
        host: &str,
        port: u16,
        log: L,
    ) -> IncResult<Arc<UdpDevice>> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| IncError::InvalidArgs)?;
        let socket = UdpSocket::bind(addr).map_err(|_| IncError::ConnectionFailed)?;

        Ok(UdpDevice::build(
            Role::Server,
            UdpState::Bound { socket, addr },
            log.into(),
        ))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match &*self.inner.state.lock().expect("udp state poisoned") {
            UdpState::Connected { socket, .. } | UdpState::Bound { socket, .. } => {
                Some(socket.as_raw_fd())
            }
            UdpState::Closed => None,
        }
    }

    /// Flush complete frames accumulated by a client-role device.
    fn flush_frames(&self) -> IncResult<()> {
        let peer = match &*self.inner.state.lock().expect("udp state poisoned") {
            UdpState::Connected { peer, .. } => *peer,
            _ => return Err(IncError::NotConnected),
        };

        let mut out = self.inner.out.lock().expect("udp out buffer poisoned");
        while let Some(total) = complete_frame(&out)? {
            let sent = self.inner.send_to(&out.as_slice()[..total], peer)?;
            if sent == 0 {
                break;
            }
            out.consume(total);
        }
        Ok(())
    }
}

impl Device for UdpDevice {
    fn object(&self) -> &ObjectRef {
        &self.object
    }

    fn role(&self) -> Role {
        self.inner.role
    }

    fn is_open(&self) -> bool {
        !matches!(
            &*self.inner.state.lock().expect("udp state poisoned"),
            UdpState::Closed
        )
    }

    fn is_writable(&self) -> bool {
        matches!(
            &*self.inner.state.lock().expect("udp state poisoned"),
            UdpState::Connected { .. }
        )
    }

    fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("udp state poisoned");
            if let UdpState::Closed = *state {
                return;
            }
            *state = UdpState::Closed;
        }

        for (_, client) in self
            .inner
            .clients
            .lock()
            .expect("udp clients poisoned")
            .drain()
        {
            client.inner.open.store(false, Ordering::Release);
        }
        self.inner.pending.lock().expect("udp pending poisoned").take();

        let mut monitor = self.inner.monitor.lock().expect("udp monitor poisoned");
        monitor.read = false;
        monitor.write = false;
        monitor.apply();
    }

    fn read(&self, max_len: usize) -> IncResult<Vec<u8>> {
        let mut incoming = self.inner.incoming.lock().expect("udp in buffer poisoned");
        let take = incoming.len().min(max_len);
        let bytes = incoming.as_slice()[..take].to_vec();
        incoming.consume(take);
        Ok(bytes)
    }

    fn write(&self, bytes: &[u8]) -> IncResult<usize> {
        if !self.is_writable() {
            return Err(IncError::NotConnected);
        }

        self.inner
            .out
            .lock()
            .expect("udp out buffer poisoned")
            .extend(bytes);
        self.flush_frames()?;
        Ok(bytes.len())
    }

    fn bytes_available(&self) -> usize {
        self.inner.incoming.lock().expect("udp in buffer poisoned").len()
    }

    fn peer_address(&self) -> String {
        match &*self.inner.state.lock().expect("udp state poisoned") {
            UdpState::Connected { peer, .. } => peer.to_string(),
            UdpState::Bound { addr, .. } => addr.to_string(),
            UdpState::Closed => String::new(),
        }
    }

    fn is_local(&self) -> bool {
        match &*self.inner.state.lock().expect("udp state poisoned") {
            UdpState::Connected { peer, .. } => peer.ip().is_loopback(),
            UdpState::Bound { addr, .. } => addr.ip().is_loopback(),
            UdpState::Closed => false,
        }
    }

    fn start_event_monitoring(&self, dispatcher: &Rc<dyn EventDispatcher>) -> bool {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return false,
        };

        {
            let mut monitor = self.inner.monitor.lock().expect("udp monitor poisoned");
            if monitor.source.is_some() {
                return true;
            }

            let source = dispatcher.attach_source(Box::new(UdpSource {
                object: self.object.clone(),
                inner: self.inner.clone(),
                pending: Readiness::default(),
            }));

            let interest = match monitor.interest() {
                Some(interest) => interest,
                None => mio::Interest::READABLE,
            };
            if dispatcher.register_fd(source, fd, interest).is_err() {
                dispatcher.detach_source(source);
                return false;
            }

            monitor.source = Some(source);
            monitor.fd = Some(fd);
            monitor.registered = true;
        }

        // A server-role device announces one provisional client before any
        // datagram, so a caller can wire a connection ahead of traffic.
        // Never more than one such device exists at a time.
        if self.inner.role == Role::Server {
            let client = {
                let clients = self.inner.clients.lock().expect("udp clients poisoned");
                let mut pending = self.inner.pending.lock().expect("udp pending poisoned");
                if clients.is_empty() && pending.is_none() {
                    let client = UdpClientDevice::new(&self.inner, None);
                    *pending = Some(client.clone());
                    Some(client)
                } else {
                    None
                }
            };

            if let Some(client) = client {
                let client: DeviceRef = client;
                object::emit(
                    &self.object,
                    &signals::NEW_CONNECTION,
                    &[Variant::new(client)],
                );
            }
        }

        true
    }

    fn config_event_ability(&self, read: bool, write: bool) {
        let mut monitor = self.inner.monitor.lock().expect("udp monitor poisoned");
        monitor.read = read;
        monitor.write = write;
        monitor.apply();
    }
}

struct UdpClientInner {
    server: Arc<UdpInner>,
    peer: Mutex<Option<SocketAddr>>,
    incoming: Mutex<Buffer>,
    out: Mutex<Buffer>,
    open: AtomicBool,
    log: Logger,
}

/// Server-side virtual device for one UDP peer.
pub struct UdpClientDevice {
    object: ObjectRef,
    inner: Arc<UdpClientInner>,
}

impl UdpClientDevice {
    fn new(server: &Arc<UdpInner>, peer: Option<SocketAddr>) -> Arc<UdpClientDevice> {
        let object = Object::new(&DEVICE_META, "udp-client-device", Some(&server.log));
        let log = logging::child(
            Some(&server.log),
            logging::o!("device" => "udp-client"),
        );

        Arc::new(UdpClientDevice {
            object,
            inner: Arc::new(UdpClientInner {
                server: server.clone(),
                peer: Mutex::new(peer),
                incoming: Mutex::new(Buffer::new()),
                out: Mutex::new(Buffer::new()),
                open: AtomicBool::new(true),
                log,
            }),
        })
    }

    /// Fix the peer identity when the first datagram arrives.
    fn assign_peer(&self, peer: SocketAddr) {
        *self.inner.peer.lock().expect("udp client peer poisoned") = Some(peer);
        logging::debug!(self.inner.log, "virtual client bound to peer"; "peer" => %peer);
    }

    fn push_incoming(&self, datagram: &[u8]) {
        self.inner
            .incoming
            .lock()
            .expect("udp client buffer poisoned")
            .extend(datagram);
    }

    /// Flush complete frames through the shared server socket. Returns
    /// whether everything queued went out.
    fn flush(&self) -> IncResult<bool> {
        flush_client(&self.inner, &self.object)
    }
}

/// Flush a virtual client's accumulated frames; a full socket enlists the
/// client for a writable wakeup.
fn flush_client(inner: &Arc<UdpClientInner>, object: &ObjectRef) -> IncResult<bool> {
    let peer = match *inner.peer.lock().expect("udp client peer poisoned") {
        Some(peer) => peer,
        None => return Ok(false),
    };

    let mut out = inner.out.lock().expect("udp client buffer poisoned");
    while let Some(total) = complete_frame(&out)? {
        let sent = inner.server.send_to(&out.as_slice()[..total], peer)?;
        if sent == 0 {
            inner.server.enlist_writer(inner, object);
            return Ok(false);
        }
        out.consume(total);
    }
    Ok(true)
}

impl Device for UdpClientDevice {
    fn object(&self) -> &ObjectRef {
        &self.object
    }

    fn role(&self) -> Role {
        Role::Client
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn is_writable(&self) -> bool {
        self.is_open()
            && self
                .inner
                .peer
                .lock()
                .expect("udp client peer poisoned")
                .is_some()
    }

    fn close(&self) {
        self.inner.open.store(false, Ordering::Release);

        if let Some(peer) = *self.inner.peer.lock().expect("udp client peer poisoned") {
            self.inner
                .server
                .clients
                .lock()
                .expect("udp clients poisoned")
                .remove(&peer);
        }
    }

    fn read(&self, max_len: usize) -> IncResult<Vec<u8>> {
        if !self.is_open() {
            return Err(IncError::NotConnected);
        }

        let mut incoming = self.inner.incoming.lock().expect("udp client buffer poisoned");
        let take = incoming.len().min(max_len);
        let bytes = incoming.as_slice()[..take].to_vec();
        incoming.consume(take);
        Ok(bytes)
    }

    fn write(&self, bytes: &[u8]) -> IncResult<usize> {
        if !self.is_writable() {
            return Err(IncError::NotConnected);
        }

        self.inner
            .out
            .lock()
            .expect("udp client buffer poisoned")
            .extend(bytes);
        self.flush()?;
        Ok(bytes.len())
    }

    fn bytes_available(&self) -> usize {
        self.inner
            .incoming
            .lock()
            .expect("udp client buffer poisoned")
            .len()
    }

    fn peer_address(&self) -> String {
        match *self.inner.peer.lock().expect("udp client peer poisoned") {
            Some(peer) => peer.to_string(),
            None => "pending".to_string(),
        }
    }

    fn is_local(&self) -> bool {
        match *self.inner.peer.lock().expect("udp client peer poisoned") {
            Some(peer) => peer.ip().is_loopback(),
            None => false,
        }
    }

    fn start_event_monitoring(&self, _dispatcher: &Rc<dyn EventDispatcher>) -> bool {
        // Driven by the owning server device's socket source.
        true
    }

    fn config_event_ability(&self, _read: bool, _write: bool) {}
}

struct UdpSource {
    object: ObjectRef,
    inner: Arc<UdpInner>,
    pending: Readiness,
}

impl EventSource for UdpSource {
    fn name(&self) -> &'static str {
        "udp-device"
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

        if !matches!(
            &*self.inner.state.lock().expect("udp state poisoned"),
            UdpState::Connected { .. } | UdpState::Bound { .. }
        ) {
            return false;
        }

        match self.inner.role {
            Role::Client => self.dispatch_client(ready),
            Role::Server => self.dispatch_server(ready),
        }
    }
}

impl UdpSource {
    fn dispatch_client(&self, ready: Readiness) -> bool {
        if ready.readable {
            let mut chunk = [0u8; DATAGRAM_MAX];
            let mut received = false;

            loop {
                let state = self.inner.state.lock().expect("udp state poisoned");
                let socket = match &*state {
                    UdpState::Connected { socket, .. } => socket,
                    _ => return false,
                };

                match socket.recv(&mut chunk) {
                    Ok(count) => {
                        drop(state);
                        self.inner
                            .incoming
                            .lock()
                            .expect("udp in buffer poisoned")
                            .extend(&chunk[..count]);
                        received = true;
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }

            if received {
                object::emit(&self.object, &signals::READY_READ, &[]);
            }
        }

        if ready.writable {
            object::emit(&self.object, &signals::BYTES_WRITTEN, &[Variant::from(0u64)]);
        }

        true
    }

    fn dispatch_server(&self, ready: Readiness) -> bool {
        if ready.readable {
            let mut chunk = [0u8; DATAGRAM_MAX];
            let mut announce: Vec<DeviceRef> = Vec::new();
            let mut wake_read: Vec<ObjectRef> = Vec::new();

            loop {
                let recv = {
                    let state = self.inner.state.lock().expect("udp state poisoned");
                    let socket = match &*state {
                        UdpState::Bound { socket, .. } => socket,
                        _ => return false,
                    };
                    match socket.recv_from(&mut chunk) {
                        Ok(pair) => Some(pair),
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => None,
                        Err(_) => None,
                    }
                };

                let (count, peer) = match recv {
                    Some(pair) => pair,
                    None => break,
                };

                let existing = self
                    .inner
                    .clients
                    .lock()
                    .expect("udp clients poisoned")
                    .get(&peer)
                    .cloned();

                let client = match existing {
                    Some(client) => client,
                    None => {
                        let taken = self
                            .inner
                            .pending
                            .lock()
                            .expect("udp pending poisoned")
                            .take();

                        match taken {
                            Some(pending) => {
                                // The provisional device gets its identity
                                // from the first unknown peer.
                                pending.assign_peer(peer);
                                self.inner
                                    .clients
                                    .lock()
                                    .expect("udp clients poisoned")
                                    .insert(peer, pending.clone());
                                pending
                            }
                            None => {
                                let client = UdpClientDevice::new(&self.inner, Some(peer));
                                self.inner
                                    .clients
                                    .lock()
                                    .expect("udp clients poisoned")
                                    .insert(peer, client.clone());
                                announce.push(client.clone());
                                client
                            }
                        }
                    }
                };

                client.push_incoming(&chunk[..count]);
                if !wake_read.iter().any(|object| Arc::ptr_eq(object, client.object())) {
                    wake_read.push(client.object().clone());
                }
            }

            for device in announce {
                let handle: DeviceRef = device;
                object::emit(
                    &self.object,
                    &signals::NEW_CONNECTION,
                    &[Variant::new(handle)],
                );
            }
            for object_ref in wake_read {
                object::emit(&object_ref, &signals::READY_READ, &[]);
            }
        }

        if ready.writable {
            // Resume virtual clients that hit a full socket.
            let waiters = std::mem::replace(
                &mut *self.inner.write_waiters.lock().expect("udp waiters poisoned"),
                Vec::new(),
            );

            let mut still_blocked = false;
            for (weak, object_ref) in waiters {
                if let Some(inner) = weak.upgrade() {
                    match flush_client(&inner, &object_ref) {
                        Ok(true) => {
                            object::emit(
                                &object_ref,
                                &signals::BYTES_WRITTEN,
                                &[Variant::from(0u64)],
                            );
                        }
                        _ => still_blocked = true,
                    }
                }
            }

            if !still_blocked {
                let mut monitor = self.inner.monitor.lock().expect("udp monitor poisoned");
                monitor.write = false;
                monitor.apply();
            }
        }

        true
    }
}
