//! Client endpoint: one INC session with connect/reconnect management,
//! method calls, subscriptions, heartbeats and bulk-data channels.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use axon::dispatcher;
use axon::event::Event;
use axon::logging::{self, Logger};
use axon::meta::{MetaObject, OBJECT_META};
use axon::object::{self, ConnectionType, Object, ObjectRef, Signal, SlotTag, USER_SIGNAL_BASE};
use axon::timer::{TimerId, TimerType};
use axon::variant::Variant;

use crate::config::ContextConfig;
use crate::device::signals as device_signals;
use crate::engine::Engine;
use crate::error::{IncError, IncResult, OK};
use crate::handshake::{Handshake, Role as HandshakeRole, State as HandshakeState};
use crate::memory::{MemBlock, MemPool, MEMTYPE_MEMFD};
use crate::message::{Message, MessageType};
use crate::operation::{Operation, OperationRef};
use crate::protocol::{signals as protocol_signals, BinaryPayload, Protocol};
use crate::tags::{TagReader, TagWriter};

pub static CONTEXT_META: MetaObject = MetaObject::new("Context", Some(&OBJECT_META));

pub mod signals {
    use super::*;

    /// `(previous: i32, current: i32)` — see [`ContextState::code`].
    pub const STATE_CHANGED: Signal = Signal::new(USER_SIGNAL_BASE, "state_changed", 2);
    /// `(name: String, version: u16, data: Vec<u8>)`
    pub const EVENT_RECEIVED: Signal = Signal::new(USER_SIGNAL_BASE + 1, "event_received", 3);
    pub const DISCONNECTED: Signal = Signal::new(USER_SIGNAL_BASE + 2, "disconnected", 0);
    /// `(code: i32)`
    pub const ERROR_OCCURRED: Signal = Signal::new(USER_SIGNAL_BASE + 3, "error_occurred", 1);
}

const TAG_ON_MESSAGE: SlotTag = SlotTag(0x7101);
const TAG_ON_PROTOCOL_ERROR: SlotTag = SlotTag(0x7102);
const TAG_ON_DEVICE_ERROR: SlotTag = SlotTag(0x7103);
const TAG_ON_DEVICE_GONE: SlotTag = SlotTag(0x7104);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
}

impl ContextState {
    #[inline]
    pub fn code(self) -> i32 {
        match self {
            ContextState::Unconnected => 0,
            ContextState::Connecting => 1,
            ContextState::Ready => 2,
            ContextState::Failed => 3,
        }
    }
}

struct CtxInner {
    state: ContextState,
    protocol: Option<Arc<Protocol>>,
    handshake: Option<Handshake>,
    server_url: String,
    server_name: String,
    server_protocol_version: u32,
    reconnect_timer: TimerId,
    reconnect_attempts: u32,
    housekeeping_timer: TimerId,
    connecting_since: Option<Instant>,
}

pub struct ContextShared {
    object: ObjectRef,
    engine: Engine,
    config: Mutex<ContextConfig>,
    inner: Mutex<CtxInner>,
    log: Logger,
}

/// The client-side counterpart to `Server`. All methods are called on the
/// thread that owns the context (its object's affinity).
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(name: &str, log: L) -> Context {
        let log = logging::child(log, logging::o!("context" => name.to_string()));
        let object = Object::new(&CONTEXT_META, name, Some(&log));

        let shared = Arc::new(ContextShared {
            object: object.clone(),
            engine: Engine::new(Some(&log)),
            config: Mutex::new(ContextConfig::default()),
            inner: Mutex::new(CtxInner {
                state: ContextState::Unconnected,
                protocol: None,
                handshake: None,
                server_url: String::new(),
                server_name: String::new(),
                server_protocol_version: 0,
                reconnect_timer: 0,
                reconnect_attempts: 0,
                housekeeping_timer: 0,
                connecting_since: None,
            }),
            log,
        });

        // Timer events (reconnect, housekeeping) arrive on the object.
        let weak = Arc::downgrade(&shared);
        object.set_handler(Arc::new(move |_, event| match event {
            Event::Timer { id, .. } => {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer(*id)
                } else {
                    false
                }
            }
            _ => false,
        }));

        Context { shared }
    }

    #[inline]
    pub fn object(&self) -> &ObjectRef {
        &self.shared.object
    }

    pub fn state(&self) -> ContextState {
        self.shared.inner.lock().expect("context poisoned").state
    }

    pub fn server_name(&self) -> String {
        self.shared
            .inner
            .lock()
            .expect("context poisoned")
            .server_name
            .clone()
    }

    pub fn server_protocol_version(&self) -> u32 {
        self.shared
            .inner
            .lock()
            .expect("context poisoned")
            .server_protocol_version
    }

    pub fn config(&self) -> ContextConfig {
        self.shared.config.lock().expect("context poisoned").clone()
    }

    /// Replace the configuration. Takes effect on the next connect.
    pub fn set_config(&self, config: ContextConfig) {
        *self.shared.config.lock().expect("context poisoned") = config;
    }

    /// Open a session. An empty URL uses the configured default server.
    pub fn connect(&self, url: &str) -> i32 {
        // A manual connect restarts the bounded reconnect budget.
        self.shared
            .inner
            .lock()
            .expect("context poisoned")
            .reconnect_attempts = 0;

        match self.shared.clone().connect_impl(url) {
            Ok(()) => OK,
            Err(error) => error.code(),
        }
    }

    /// Tear the session down, failing every in-flight operation.
    pub fn disconnect(&self) {
        self.shared.disconnect_impl(true);
    }

    /// Invoke a remote method; the operation completes with the reply.
    pub fn call_method(
        &self,
        method: &str,
        version: u16,
        args: &[u8],
        timeout: Option<Duration>,
    ) -> OperationRef {
        let protocol = match self.shared.ready_protocol() {
            Some(protocol) => protocol,
            None => return Operation::failed(IncError::NotConnected, Some(&self.shared.log)),
        };

        let mut msg = Message::new(MessageType::MethodCall, protocol.next_sequence());
        let mut tags = TagWriter::new();
        tags.put_u16(version).put_string(method).put_bytes(args);
        msg.set_payload(tags.finish());

        let op = protocol.send_message(msg);
        op.set_timeout(timeout.unwrap_or_else(|| self.shared.default_timeout()));
        op
    }

    /// Subscribe to events matching `pattern` (exact or `prefix.*`).
    pub fn subscribe(&self, pattern: &str) -> OperationRef {
        self.shared.pattern_request(MessageType::Subscribe, pattern)
    }

    pub fn unsubscribe(&self, pattern: &str) -> OperationRef {
        self.shared.pattern_request(MessageType::Unsubscribe, pattern)
    }

    /// Application-level heartbeat.
    pub fn pingpong(&self) -> OperationRef {
        let protocol = match self.shared.ready_protocol() {
            Some(protocol) => protocol,
            None => return Operation::failed(IncError::NotConnected, Some(&self.shared.log)),
        };

        let msg = Message::new(MessageType::Ping, protocol.next_sequence());
        let op = protocol.send_message(msg);
        op.set_timeout(self.shared.default_timeout());
        op
    }

    /// Ask the server for a bulk-data channel. The operation's result
    /// payload starts with the allocated channel id (`u32` tag).
    pub fn request_channel(&self, mode: u32) -> OperationRef {
        let protocol = match self.shared.ready_protocol() {
            Some(protocol) => protocol,
            None => return Operation::failed(IncError::NotConnected, Some(&self.shared.log)),
        };

        let config = self.config();
        let device = protocol.device().clone();

        let mut types = config.shared_memory_types();
        if !device.supports_fd_passing() {
            // memfd segments can only travel as descriptors.
            types &= !MEMTYPE_MEMFD;
        }
        let want_shm = types != 0 && device.is_local();

        let mut msg = Message::new(MessageType::StreamOpen, protocol.next_sequence());
        let mut tags = TagWriter::new();
        tags.put_u32(mode).put_bool(want_shm);
        if want_shm {
            let pool_name = format!("{}-{}", self.shared.object.name(), std::process::id());
            tags.put_u16(types).put_bytes(pool_name.as_bytes());
        }
        msg.set_payload(tags.finish());

        let op = protocol.send_message(msg);
        op.set_timeout(Duration::from_secs(5));
        op
    }

    /// Release a channel obtained with [`Context::request_channel`].
    pub fn release_channel(&self, channel_id: u32) -> OperationRef {
        let protocol = match self.shared.ready_protocol() {
            Some(protocol) => protocol,
            None => return Operation::failed(IncError::NotConnected, Some(&self.shared.log)),
        };

        let msg = Message::with_channel(
            MessageType::StreamClose,
            channel_id,
            protocol.next_sequence(),
        );
        let op = protocol.send_message(msg);
        op.set_timeout(Duration::from_secs(5));
        op
    }

    /// Send bulk data on a negotiated channel.
    pub fn send_binary_data(&self, channel_id: u32, payload: BinaryPayload) -> OperationRef {
        let protocol = match self.shared.ready_protocol() {
            Some(protocol) => protocol,
            None => return Operation::failed(IncError::NotConnected, Some(&self.shared.log)),
        };

        protocol.send_binary_data(channel_id, payload)
    }

    /// Allocate a pool-backed buffer for zero-copy sends, if shared memory
    /// was negotiated.
    pub fn acquire_buffer(&self, size: usize) -> Option<MemBlock> {
        let protocol = self.shared.ready_protocol()?;
        protocol.acquire_buffer(size)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shared.disconnect_impl(false);
    }
}

impl ContextShared {
    fn default_timeout(&self) -> Duration {
        Duration::from_millis(
            self.config
                .lock()
                .expect("context poisoned")
                .operation_timeout_ms,
        )
    }

    fn ready_protocol(&self) -> Option<Arc<Protocol>> {
        let inner = self.inner.lock().expect("context poisoned");
        if inner.state != ContextState::Ready {
            logging::warn!(self.log, "not connected"; "state" => ?inner.state);
            return None;
        }
        inner.protocol.clone()
    }

    fn pattern_request(&self, message_type: MessageType, pattern: &str) -> OperationRef {
        let protocol = match self.ready_protocol() {
            Some(protocol) => protocol,
            None => return Operation::failed(IncError::NotConnected, Some(&self.log)),
        };

        let mut msg = Message::new(message_type, protocol.next_sequence());
        let mut tags = TagWriter::new();
        tags.put_string(pattern);
        msg.set_payload(tags.finish());

        let op = protocol.send_message(msg);
        op.set_timeout(self.default_timeout());
        op
    }

    fn set_state(&self, new_state: ContextState) {
        let previous = {
            let mut inner = self.inner.lock().expect("context poisoned");
            let previous = inner.state;
            if previous == new_state {
                return;
            }
            inner.state = new_state;
            previous
        };

        logging::debug!(self.log, "state changed";
                        "from" => previous.code(),
                        "to" => new_state.code());
        object::emit(
            &self.object,
            &signals::STATE_CHANGED,
            &[
                Variant::from(previous.code()),
                Variant::from(new_state.code()),
            ],
        );
    }

    fn connect_impl(self: Arc<Self>, url: &str) -> IncResult<()> {
        {
            let inner = self.inner.lock().expect("context poisoned");
            if matches!(inner.state, ContextState::Ready | ContextState::Connecting) {
                logging::warn!(self.log, "already connected or connecting");
                return Err(IncError::AlreadyConnected);
            }
        }

        let config = self.config.lock().expect("context poisoned").clone();
        let url = if url.is_empty() {
            config.default_server.clone()
        } else {
            url.to_string()
        };
        if url.is_empty() {
            logging::error!(self.log, "no server url and no configured default");
            return Err(IncError::InvalidArgs);
        }

        {
            let mut inner = self.inner.lock().expect("context poisoned");
            inner.server_url = url.clone();
            inner.connecting_since = Some(Instant::now());
        }
        self.set_state(ContextState::Connecting);

        let device = match self.engine.create_client_transport(&url) {
            Ok(device) => device,
            Err(error) => {
                logging::error!(self.log, "transport creation failed"; "url" => &url);
                self.set_state(ContextState::Failed);
                self.maybe_schedule_reconnect();
                return Err(error);
            }
        };

        let protocol = Protocol::new(device.clone(), Some(&self.log));

        // Wire slots before any event can fire.
        let weak = Arc::downgrade(&self);
        object::connect(
            protocol.object(),
            &protocol_signals::MESSAGE_RECEIVED,
            &self.object,
            TAG_ON_MESSAGE,
            1,
            ConnectionType::DIRECT,
            message_slot(weak.clone()),
        );
        object::connect(
            protocol.object(),
            &protocol_signals::ERROR_OCCURRED,
            &self.object,
            TAG_ON_PROTOCOL_ERROR,
            1,
            ConnectionType::DIRECT,
            error_slot(weak.clone()),
        );
        object::connect(
            device.object(),
            &device_signals::ERROR_OCCURRED,
            &self.object,
            TAG_ON_DEVICE_ERROR,
            1,
            ConnectionType::DIRECT,
            error_slot(weak.clone()),
        );
        object::connect(
            device.object(),
            &device_signals::DISCONNECTED,
            &self.object,
            TAG_ON_DEVICE_GONE,
            0,
            ConnectionType::DIRECT,
            disconnected_slot(weak),
        );

        // Only now is it safe to let events flow.
        if !device.start_event_monitoring(&dispatcher::ensure_current()) {
            logging::error!(self.log, "failed to start event monitoring");
            protocol.close();
            self.set_state(ContextState::Failed);
            self.maybe_schedule_reconnect();
            return Err(IncError::ConnectionFailed);
        }

        let mut handshake = Handshake::new(HandshakeRole::Client, Some(&self.log));
        handshake.set_context_config(&self.object.name(), &config);
        let hello = handshake.start().ok_or(IncError::Internal)?;

        let mut msg = Message::new(MessageType::Handshake, 0);
        msg.set_payload(hello);
        protocol.send_message(msg);

        {
            let mut inner = self.inner.lock().expect("context poisoned");
            inner.protocol = Some(protocol);
            inner.handshake = Some(handshake);

            if inner.housekeeping_timer == 0 {
                inner.housekeeping_timer = object::start_timer(
                    &self.object,
                    HOUSEKEEPING_INTERVAL,
                    TimerType::Coarse,
                    Variant::empty(),
                );
            }
        }

        logging::info!(self.log, "handshake sent"; "url" => &url);
        Ok(())
    }

    fn disconnect_impl(&self, emit_signal: bool) {
        let (protocol, reconnect_timer, housekeeping_timer) = {
            let mut inner = self.inner.lock().expect("context poisoned");
            if inner.state == ContextState::Unconnected && inner.protocol.is_none() {
                return;
            }

            let reconnect_timer = std::mem::replace(&mut inner.reconnect_timer, 0);
            let housekeeping_timer = std::mem::replace(&mut inner.housekeeping_timer, 0);
            inner.handshake = None;
            inner.connecting_since = None;
            (inner.protocol.take(), reconnect_timer, housekeeping_timer)
        };

        if reconnect_timer != 0 {
            object::kill_timer(&self.object, reconnect_timer);
        }
        if housekeeping_timer != 0 {
            object::kill_timer(&self.object, housekeeping_timer);
        }

        if let Some(protocol) = protocol {
            object::disconnect(protocol.object(), None, Some(&self.object), None);
            object::disconnect(protocol.device().object(), None, Some(&self.object), None);
            protocol.close();
        }

        self.set_state(ContextState::Unconnected);
        if emit_signal {
            object::emit(&self.object, &signals::DISCONNECTED, &[]);
        }
    }

    /// Arm the reconnect timer if configuration and the attempt budget
    /// allow it.
    fn maybe_schedule_reconnect(&self) {
        let config = self.config.lock().expect("context poisoned").clone();
        if !config.auto_reconnect {
            return;
        }

        let mut inner = self.inner.lock().expect("context poisoned");
        if inner.server_url.is_empty() || inner.reconnect_timer != 0 {
            return;
        }

        if config.max_reconnect_attempts > 0
            && inner.reconnect_attempts >= config.max_reconnect_attempts
        {
            logging::warn!(self.log, "reconnect attempts exhausted";
                           "attempts" => inner.reconnect_attempts);
            return;
        }

        drop(inner);

        let timer = object::start_timer(
            &self.object,
            Duration::from_millis(config.reconnect_interval_ms),
            TimerType::Coarse,
            Variant::empty(),
        );
        self.inner.lock().expect("context poisoned").reconnect_timer = timer;
    }

    fn on_timer(self: Arc<Self>, id: TimerId) -> bool {
        let (is_reconnect, is_housekeeping) = {
            let inner = self.inner.lock().expect("context poisoned");
            (id == inner.reconnect_timer, id == inner.housekeeping_timer)
        };

        if is_reconnect {
            object::kill_timer(&self.object, id);
            let url = {
                let mut inner = self.inner.lock().expect("context poisoned");
                inner.reconnect_timer = 0;
                inner.reconnect_attempts += 1;
                inner.server_url.clone()
            };

            logging::info!(self.log, "attempting reconnection"; "url" => &url);
            // A failed attempt schedules the next one itself, within the
            // configured budget.
            let _ = self.clone().connect_impl(&url);
            return true;
        }

        if is_housekeeping {
            let now = Instant::now();
            let timeout = Duration::from_millis(
                self.config.lock().expect("context poisoned").connect_timeout_ms,
            );
            let (protocol, connect_deadline_passed) = {
                let inner = self.inner.lock().expect("context poisoned");
                let stuck = inner.state == ContextState::Connecting
                    && inner
                        .connecting_since
                        .map(|since| now.saturating_duration_since(since) > timeout)
                        .unwrap_or(false);
                (inner.protocol.clone(), stuck)
            };

            if connect_deadline_passed {
                logging::warn!(self.log, "connect attempt timed out");
                self.on_transport_error(IncError::Timeout.code());
                return true;
            }

            if let Some(protocol) = protocol {
                protocol.expire_operations(now);
            }
            return true;
        }

        false
    }

    fn on_protocol_message(&self, msg: &Message) {
        match msg.message_type {
            MessageType::HandshakeAck => self.handle_handshake_ack(msg),
            MessageType::Event => self.handle_event(msg),
            MessageType::Ping => {
                if let Some(protocol) = self.inner.lock().expect("context poisoned").protocol.clone()
                {
                    let pong = Message::new(MessageType::Pong, msg.sequence);
                    protocol.send_message(pong);
                }
            }
            MessageType::StreamOpenAck => self.handle_stream_open_ack(msg),
            MessageType::StreamCloseAck => {}
            other => {
                logging::warn!(self.log, "unexpected message type"; "type" => other.code());
            }
        }
    }

    fn handle_handshake_ack(&self, msg: &Message) {
        let outcome = {
            let mut inner = self.inner.lock().expect("context poisoned");
            let handshake = match inner.handshake.as_mut() {
                Some(handshake) => handshake,
                None => {
                    logging::warn!(self.log, "handshake ack but no handshake in progress");
                    return;
                }
            };

            if handshake.state() == HandshakeState::Completed {
                logging::warn!(self.log, "handshake already completed");
                return;
            }

            handshake.process(&msg.payload);
            let state = handshake.state();

            if state == HandshakeState::Completed {
                let server_name = handshake.remote_data().node_name.clone();
                let server_protocol_version = handshake.remote_data().protocol_version;
                inner.server_name = server_name;
                inner.server_protocol_version = server_protocol_version;
                inner.reconnect_attempts = 0;
                inner.connecting_since = None;
            }
            state
        };

        match outcome {
            HandshakeState::Completed => {
                self.set_state(ContextState::Ready);
                logging::info!(self.log, "session ready";
                               "server" => self.inner.lock().expect("context poisoned").server_name.clone());
            }
            _ => {
                logging::error!(self.log, "handshake failed");
                self.disconnect_impl(true);
                self.set_state(ContextState::Failed);
                self.maybe_schedule_reconnect();
            }
        }
    }

    fn handle_event(&self, msg: &Message) {
        let mut tags = TagReader::new(&msg.payload);

        let version = match tags.get_u16() {
            Ok(version) => version,
            Err(_) => {
                logging::error!(self.log, "malformed event payload");
                return;
            }
        };
        let name = match tags.get_string() {
            Ok(name) => name,
            Err(_) => {
                logging::error!(self.log, "malformed event name");
                return;
            }
        };
        let data = tags.get_bytes().unwrap_or_default();

        object::emit(
            &self.object,
            &signals::EVENT_RECEIVED,
            &[Variant::from(name), Variant::new(version), Variant::new(data)],
        );
    }

    /// The server's channel grant; applies any negotiated shared memory
    /// before the caller's operation completes.
    fn handle_stream_open_ack(&self, msg: &Message) {
        let mut tags = TagReader::new(&msg.payload);

        let channel_id = match tags.get_u32() {
            Ok(channel_id) => channel_id,
            Err(_) => {
                logging::error!(self.log, "malformed stream-open ack");
                return;
            }
        };
        let negotiated = tags.get_bool().unwrap_or(false);
        if !negotiated {
            logging::info!(self.log, "channel granted"; "channel" => channel_id);
            return;
        }

        let mem_type = tags.get_u16().unwrap_or(0);
        let pool_name = tags.get_bytes().unwrap_or_default();
        let pool_size = tags.get_i32().unwrap_or(0);

        if mem_type == 0 || pool_size <= 0 {
            logging::info!(self.log, "channel granted without shared memory";
                           "channel" => channel_id);
            return;
        }

        let protocol = match self.inner.lock().expect("context poisoned").protocol.clone() {
            Some(protocol) => protocol,
            None => return,
        };

        let fd = protocol.device().take_pending_fd();
        let name = String::from_utf8_lossy(&pool_name).to_string();

        match MemPool::attach(mem_type, &name, fd, pool_size as usize, Some(&self.log)) {
            Ok(pool) => {
                protocol.set_memory_pool(pool);
                logging::info!(self.log, "channel granted with shared memory";
                               "channel" => channel_id,
                               "mem_type" => mem_type,
                               "pool_size" => pool_size);
            }
            Err(error) => {
                logging::warn!(self.log, "failed to attach negotiated pool, staying inline";
                               "error" => %error);
            }
        }
    }

    fn on_transport_error(&self, code: i32) {
        logging::warn!(self.log, "transport error"; "code" => code);

        let had_session = {
            let inner = self.inner.lock().expect("context poisoned");
            inner.protocol.is_some()
        };
        if !had_session {
            return;
        }

        object::emit(&self.object, &signals::ERROR_OCCURRED, &[Variant::from(code)]);
        self.disconnect_impl(true);
        self.set_state(ContextState::Failed);
        self.maybe_schedule_reconnect();
    }
}

fn message_slot(weak: Weak<ContextShared>) -> object::SlotFn {
    Arc::new(move |_, args| {
        if let Some(shared) = weak.upgrade() {
            if let Some(msg) = args.get(0).and_then(|arg| arg.value::<Message>()) {
                shared.on_protocol_message(msg);
            }
        }
    })
}

fn error_slot(weak: Weak<ContextShared>) -> object::SlotFn {
    Arc::new(move |_, args| {
        if let Some(shared) = weak.upgrade() {
            let code = args
                .get(0)
                .and_then(|arg| arg.get::<i32>())
                .unwrap_or_else(|| IncError::Disconnected.code());
            shared.on_transport_error(code);
        }
    })
}

fn disconnected_slot(weak: Weak<ContextShared>) -> object::SlotFn {
    Arc::new(move |_, _| {
        if let Some(shared) = weak.upgrade() {
            shared.on_transport_error(IncError::Disconnected.code());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let context = Context::new("test-context", None);
        assert_eq!(context.state(), ContextState::Unconnected);
        assert!(context.server_name().is_empty());
    }

    #[test]
    fn test_connect_requires_url_or_default() {
        let context = Context::new("test-context", None);
        assert_eq!(context.connect(""), IncError::InvalidArgs.code());
        assert_eq!(context.state(), ContextState::Unconnected);
    }

    #[test]
    fn test_calls_refused_while_unconnected() {
        let context = Context::new("test-context", None);

        let op = context.call_method("echo", 1, &[1, 2], None);
        assert_eq!(op.error_code(), IncError::NotConnected.code());

        let op = context.subscribe("system.*");
        assert_eq!(op.error_code(), IncError::NotConnected.code());

        let op = context.request_channel(crate::connection::MODE_WRITE);
        assert_eq!(op.error_code(), IncError::NotConnected.code());

        assert!(context.acquire_buffer(1024).is_none());
    }

    #[test]
    fn test_connect_to_missing_unix_socket_fails_immediately() {
        let context = Context::new("test-context", None);
        let mut config = ContextConfig::default();
        config.auto_reconnect = false;
        context.set_config(config);

        let code = context.connect("unix:///tmp/inc-context-no-such.sock");
        assert_eq!(code, IncError::ConnectionFailed.code());
        assert_eq!(context.state(), ContextState::Failed);
    }

    #[test]
    fn test_double_connect_rejected() {
        let context = Context::new("test-context", None);
        let mut config = ContextConfig::default();
        config.auto_reconnect = false;
        context.set_config(config);

        // A blackholed address keeps the connect in flight until the poll
        // loop observes a verdict, which this test never lets happen.
        let first = context.connect("tcp://10.255.255.1:19099");
        assert_eq!(first, OK);
        assert_eq!(context.state(), ContextState::Connecting);

        let second = context.connect("tcp://10.255.255.1:19099");
        assert_eq!(second, IncError::AlreadyConnected.code());

        context.disconnect();
        assert_eq!(context.state(), ContextState::Unconnected);
    }
}
