//! Transport devices: the common contract and its TCP, Unix-stream and UDP
//! implementations.
//!
//! A device owns a non-blocking socket and an [`Object`](axon::object::Object)
//! carrying its signals. Event monitoring is explicit and must be started
//! only after the caller has wired its slots, so an early readable event can
//! never fire into the void.

pub mod tcp;
pub mod udp;
pub mod unix;

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use axon::dispatcher::EventDispatcher;
use axon::meta::{MetaObject, OBJECT_META};
use axon::object::{ObjectRef, Signal, USER_SIGNAL_BASE};

use crate::error::IncResult;

pub use self::tcp::TcpDevice;
pub use self::udp::{UdpClientDevice, UdpDevice};
pub use self::unix::UnixDevice;

pub static DEVICE_META: MetaObject = MetaObject::new("Device", Some(&OBJECT_META));

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// Connects to a remote endpoint.
    Client,
    /// Accepts connections, synthesising client-role devices.
    Server,
}

/// Signals every device's object can emit.
pub mod signals {
    use super::*;

    pub const READY_READ: Signal = Signal::new(USER_SIGNAL_BASE, "ready_read", 0);
    /// `(bytes: u64)` — transport accepted writes; 0 means "writable again".
    pub const BYTES_WRITTEN: Signal = Signal::new(USER_SIGNAL_BASE + 1, "bytes_written", 1);
    pub const CONNECTED: Signal = Signal::new(USER_SIGNAL_BASE + 2, "connected", 0);
    pub const DISCONNECTED: Signal = Signal::new(USER_SIGNAL_BASE + 3, "disconnected", 0);
    /// `(code: i32)`
    pub const ERROR_OCCURRED: Signal = Signal::new(USER_SIGNAL_BASE + 4, "error_occurred", 1);
    /// `(device: DeviceRef)` — server role only.
    pub const NEW_CONNECTION: Signal = Signal::new(USER_SIGNAL_BASE + 5, "new_connection", 1);
    /// `(action: Variant)` — application actions marshalled onto the
    /// device's thread (broadcast fan-out).
    pub const CUSTOM_ACTION: Signal = Signal::new(USER_SIGNAL_BASE + 6, "custom_action", 1);
}

/// Shared handle to a transport device.
pub type DeviceRef = Arc<dyn Device>;

pub trait Device: Send + Sync {
    /// The object carrying this device's signals.
    fn object(&self) -> &ObjectRef;

    fn role(&self) -> Role;

    fn is_open(&self) -> bool;

    /// Network devices deliver bytes in sequence, never by random access.
    fn is_sequential(&self) -> bool {
        true
    }

    /// Open and past any connect phase: writes may make progress.
    fn is_writable(&self) -> bool;

    fn close(&self);

    /// Non-blocking read of up to `max_len` bytes. Empty result means
    /// would-block; peer EOF and transport failures surface as errors.
    fn read(&self, max_len: usize) -> IncResult<Vec<u8>>;

    /// Non-blocking write. `Ok(0)` means would-block.
    fn write(&self, bytes: &[u8]) -> IncResult<usize>;

    fn bytes_available(&self) -> usize {
        0
    }

    /// Peer identity for logging: "ip:port" or a socket path.
    fn peer_address(&self) -> String;

    /// Whether the peer shares this machine (shared-memory eligibility).
    fn is_local(&self) -> bool;

    /// Attach the device's event source to `dispatcher`. Call only after
    /// wiring signal handlers. Idempotent.
    fn start_event_monitoring(&self, dispatcher: &Rc<dyn EventDispatcher>) -> bool;

    /// Enable or disable read/write readiness monitoring without
    /// recreating the event source. Must run on the monitoring thread.
    fn config_event_ability(&self, read: bool, write: bool);

    /// Whether the transport can carry an ancillary descriptor per message.
    fn supports_fd_passing(&self) -> bool {
        false
    }

    /// Queue a descriptor to accompany the next successful write.
    fn set_out_fd(&self, _fd: RawFd) {}

    /// Take a descriptor received out-of-band, if any arrived.
    fn take_pending_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Monitoring bookkeeping shared by the transport implementations.
pub(crate) struct Monitor {
    pub source: Option<axon::source::SourceId>,
    pub fd: Option<RawFd>,
    pub read: bool,
    pub write: bool,
    pub registered: bool,
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor {
            source: None,
            fd: None,
            read: true,
            write: true,
            registered: false,
        }
    }

    pub fn interest(&self) -> Option<mio::Interest> {
        match (self.read, self.write) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Apply the current flags through the calling thread's dispatcher.
    pub fn apply(&mut self) {
        let (source, fd) = match (self.source, self.fd) {
            (Some(source), Some(fd)) => (source, fd),
            _ => return,
        };

        let dispatcher = match axon::dispatcher::current() {
            Some(dispatcher) => dispatcher,
            None => return,
        };

        match self.interest() {
            Some(interest) => {
                if self.registered {
                    let _ = dispatcher.update_fd(source, fd, interest);
                } else {
                    self.registered = dispatcher.register_fd(source, fd, interest).is_ok();
                }
            }
            None => {
                if self.registered {
                    let _ = dispatcher.deregister_fd(source, fd);
                    self.registered = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_interest_mapping() {
        let mut monitor = Monitor::new();
        assert_eq!(
            monitor.interest(),
            Some(mio::Interest::READABLE | mio::Interest::WRITABLE)
        );

        monitor.write = false;
        assert_eq!(monitor.interest(), Some(mio::Interest::READABLE));

        monitor.read = false;
        assert_eq!(monitor.interest(), None);
    }
}
