//! Listening endpoint: accepts transports, owns a connection per client,
//! routes method calls, subscriptions, channel lifecycle and broadcasts.
//!
//! All connection state is touched only from the thread running the listen
//! device's event monitoring (a dedicated I/O thread when configured);
//! broadcasts from other threads are marshalled there through the listen
//! device's custom-action channel.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use axon::dispatcher;
use axon::event::Event;
use axon::logging::{self, Logger};
use axon::meta::{MetaObject, OBJECT_META};
use axon::object::{self, ConnectionType, Object, ObjectRef, Signal, SlotTag, USER_SIGNAL_BASE};
use axon::thread::Thread;
use axon::timer::TimerType;
use axon::variant::Variant;

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionRef, MODE_READ, MODE_WRITE};
use crate::device::{signals as device_signals, DeviceRef};
use crate::engine::Engine;
use crate::error::{IncError, OK};
use crate::handshake::{Handshake, Role as HandshakeRole, State as HandshakeState};
use crate::memory::{MemBlock, MemPool, MEMTYPE_MEMFD, MEMTYPE_POSIX};
use crate::message::{Message, MessageType};
use crate::operation::OperationRef;
use crate::protocol::{signals as protocol_signals, BinaryChunk, BinaryPayload};
use crate::tags::{TagReader, TagWriter};

pub static SERVER_META: MetaObject = MetaObject::new("Server", Some(&OBJECT_META));

pub mod signals {
    use super::*;

    /// `(connection_id: u64)`
    pub const CLIENT_CONNECTED: Signal = Signal::new(USER_SIGNAL_BASE, "client_connected", 1);
    /// `(connection_id: u64)`
    pub const CLIENT_DISCONNECTED: Signal =
        Signal::new(USER_SIGNAL_BASE + 1, "client_disconnected", 1);
    /// `(connection_id: u64, channel_id: u32, mode: u32)`
    pub const STREAM_OPENED: Signal = Signal::new(USER_SIGNAL_BASE + 2, "stream_opened", 3);
    /// `(connection_id: u64, channel_id: u32)`
    pub const STREAM_CLOSED: Signal = Signal::new(USER_SIGNAL_BASE + 3, "stream_closed", 2);
    /// Emitted once when the server has been idle past
    /// `exit_idle_time_ms`; the application decides whether to close.
    pub const IDLE_TIMEOUT: Signal = Signal::new(USER_SIGNAL_BASE + 4, "idle_timeout", 0);
}

const TAG_ON_NEW_CONNECTION: SlotTag = SlotTag(0x7201);
const TAG_ON_LISTEN_ERROR: SlotTag = SlotTag(0x7202);
const TAG_ON_LISTEN_GONE: SlotTag = SlotTag(0x7203);
const TAG_ON_CUSTOM_ACTION: SlotTag = SlotTag(0x7204);
const TAG_ON_CONN_MESSAGE: SlotTag = SlotTag(0x7205);
const TAG_ON_CONN_ERROR: SlotTag = SlotTag(0x7206);
const TAG_ON_CONN_GONE: SlotTag = SlotTag(0x7207);
const TAG_ON_CONN_BINARY: SlotTag = SlotTag(0x7208);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Application hook: handle a method call and eventually reply through
/// [`Server::send_method_reply`].
pub type MethodHandler = Box<dyn Fn(&ConnectionRef, u32, &str, u16, &[u8]) + Send + Sync>;
/// Application hook: whether a subscription is allowed.
pub type SubscribeHandler = Box<dyn Fn(&ConnectionRef, &str) -> bool + Send + Sync>;
/// Application hook: bulk data arrived on a channel.
pub type BinaryHandler = Box<dyn Fn(&ConnectionRef, u32, u32, i64, &BinaryChunk) + Send + Sync>;

struct Hooks {
    on_method: MethodHandler,
    on_subscribe: SubscribeHandler,
    on_binary: BinaryHandler,
}

impl Hooks {
    fn defaults(log: Logger) -> Hooks {
        Hooks {
            on_method: Box::new(move |conn, sequence, method, _, _| {
                logging::warn!(log, "unhandled method call"; "method" => method.to_string());
                conn.send_reply(sequence, IncError::InvalidArgs.code(), &[]);
            }),
            on_subscribe: Box::new(|_, _| true),
            on_binary: Box::new(|_, _, _, _, _| {}),
        }
    }
}

struct SrvInner {
    listening: bool,
    listen_device: Option<DeviceRef>,
    io_thread: Option<Thread>,
    connections: IndexMap<u64, ConnectionRef>,
    next_connection_id: u64,
    next_channel_id: u32,
    global_pool: Option<MemPool>,
    idle_since: Option<Instant>,
    idle_reported: bool,
}

pub struct ServerShared {
    object: ObjectRef,
    engine: Engine,
    config: Mutex<ServerConfig>,
    hooks: Mutex<Hooks>,
    inner: Mutex<SrvInner>,
    log: Logger,
}

/// The INC server endpoint.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(name: &str, log: L) -> Server {
        let log = logging::child(log, logging::o!("server" => name.to_string()));
        let object = Object::new(&SERVER_META, name, Some(&log));

        Server {
            shared: Arc::new(ServerShared {
                object,
                engine: Engine::new(Some(&log)),
                config: Mutex::new(ServerConfig::default()),
                hooks: Mutex::new(Hooks::defaults(log.clone())),
                inner: Mutex::new(SrvInner {
                    listening: false,
                    listen_device: None,
                    io_thread: None,
                    connections: IndexMap::new(),
                    next_connection_id: 0,
                    next_channel_id: 0,
                    global_pool: None,
                    idle_since: None,
                    idle_reported: false,
                }),
                log,
            }),
        }
    }

    #[inline]
    pub fn object(&self) -> &ObjectRef {
        &self.shared.object
    }

    pub fn config(&self) -> ServerConfig {
        self.shared.config.lock().expect("server poisoned").clone()
    }

    pub fn set_config(&self, config: ServerConfig) {
        *self.shared.config.lock().expect("server poisoned") = config;
    }

    pub fn set_method_handler(&self, handler: MethodHandler) {
        self.shared.hooks.lock().expect("server poisoned").on_method = handler;
    }

    pub fn set_subscribe_handler(&self, handler: SubscribeHandler) {
        self.shared.hooks.lock().expect("server poisoned").on_subscribe = handler;
    }

    pub fn set_binary_handler(&self, handler: BinaryHandler) {
        self.shared.hooks.lock().expect("server poisoned").on_binary = handler;
    }

    pub fn is_listening(&self) -> bool {
        self.shared.inner.lock().expect("server poisoned").listening
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .expect("server poisoned")
            .connections
            .len()
    }

    pub fn connection(&self, id: u64) -> Option<ConnectionRef> {
        self.shared
            .inner
            .lock()
            .expect("server poisoned")
            .connections
            .get(&id)
            .cloned()
    }

    /// Start listening. An empty URL falls back to the configured listen
    /// address (or the system instance path).
    pub fn listen_on(&self, url: &str) -> i32 {
        match self.shared.clone().listen_impl(url) {
            Ok(()) => OK,
            Err(error) => error.code(),
        }
    }

    /// Stop listening and drop every connection.
    pub fn close(&self) {
        self.shared.close_impl();
    }

    /// Fan an event out to every connection whose subscriptions match.
    /// Safe to call from any thread; delivery happens on the I/O thread.
    pub fn broadcast_event(&self, event_name: &str, version: u16, data: &[u8]) {
        let device = self
            .shared
            .inner
            .lock()
            .expect("server poisoned")
            .listen_device
            .clone();

        let device = match device {
            Some(device) => device,
            None => {
                logging::warn!(self.shared.log, "broadcast without listening device");
                return;
            }
        };

        // Marshal onto the listen device's thread, then re-emit as the
        // custom-action signal the server is wired to.
        object::invoke_method(
            device.object(),
            ConnectionType::QUEUED,
            vec![
                Variant::from(event_name),
                Variant::new(version),
                Variant::new(data.to_vec()),
            ],
            Arc::new(|receiver, args| {
                object::emit(receiver, &device_signals::CUSTOM_ACTION, args);
            }),
        );
    }

    /// Reply to a method call routed through the method handler.
    pub fn send_method_reply(
        &self,
        conn: &ConnectionRef,
        sequence: u32,
        error_code: i32,
        result: &[u8],
    ) {
        conn.send_reply(sequence, error_code, result);
    }

    /// Push bulk data to a client over a channel the client opened for
    /// reading.
    pub fn send_binary_data(
        &self,
        conn: &ConnectionRef,
        channel_id: u32,
        payload: BinaryPayload,
    ) -> Option<OperationRef> {
        match conn.channel_mode(channel_id) {
            Some(mode) if mode & MODE_READ != 0 => Some(conn.send_binary_data(channel_id, payload)),
            _ => {
                logging::warn!(self.shared.log, "binary push on non-readable channel";
                               "channel" => channel_id);
                None
            }
        }
    }

    /// Allocate from the server's global pool, when shared memory is on.
    pub fn acquire_buffer(&self, size: usize) -> Option<MemBlock> {
        let pool = self
            .shared
            .inner
            .lock()
            .expect("server poisoned")
            .global_pool
            .clone()?;
        pool.alloc(size)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.close_impl();
    }
}

impl ServerShared {
    fn listen_impl(self: Arc<Self>, url: &str) -> Result<(), IncError> {
        {
            let inner = self.inner.lock().expect("server poisoned");
            if inner.listening {
                logging::warn!(self.log, "already listening");
                return Err(IncError::InvalidState);
            }
        }

        let config = self.config.lock().expect("server poisoned").clone();
        let url = if url.is_empty() {
            match config.effective_listen_address() {
                Some(url) => url,
                None => {
                    logging::error!(self.log, "no listen url specified or configured");
                    return Err(IncError::InvalidArgs);
                }
            }
        } else {
            url.to_string()
        };

        let device = self
            .engine
            .create_server_transport(&url)
            .map_err(|_| IncError::ConnectionFailed)?;

        // Wire the device signals first; monitoring starts strictly after.
        let weak = Arc::downgrade(&self);
        object::connect(
            device.object(),
            &device_signals::NEW_CONNECTION,
            &self.object,
            TAG_ON_NEW_CONNECTION,
            1,
            ConnectionType::DIRECT,
            new_connection_slot(weak.clone()),
        );
        object::connect(
            device.object(),
            &device_signals::ERROR_OCCURRED,
            &self.object,
            TAG_ON_LISTEN_ERROR,
            1,
            ConnectionType::DIRECT,
            listen_trouble_slot(weak.clone()),
        );
        object::connect(
            device.object(),
            &device_signals::DISCONNECTED,
            &self.object,
            TAG_ON_LISTEN_GONE,
            0,
            ConnectionType::DIRECT,
            listen_trouble_slot(weak.clone()),
        );
        object::connect(
            device.object(),
            &device_signals::CUSTOM_ACTION,
            &self.object,
            TAG_ON_CUSTOM_ACTION,
            3,
            ConnectionType::DIRECT,
            custom_action_slot(weak.clone()),
        );

        // Housekeeping timer fires on the listen device's object, so it
        // lives on whichever thread runs the monitoring.
        {
            let weak = weak.clone();
            device.object().set_handler(Arc::new(move |_, event| {
                if let Event::Timer { .. } = event {
                    if let Some(shared) = weak.upgrade() {
                        shared.housekeeping();
                    }
                    return true;
                }
                false
            }));
        }

        if !config.disable_shared_memory {
            let pool_type = if config.disable_memfd {
                MEMTYPE_POSIX
            } else {
                MEMTYPE_MEMFD
            };
            let pool_name = format!("{}-{}", config.shared_memory_name, std::process::id());

            match MemPool::create(
                &self.object.name(),
                &pool_name,
                pool_type,
                config.shared_memory_size,
                Some(&self.log),
            ) {
                Ok(pool) => {
                    logging::info!(self.log, "created global memory pool";
                                   "type" => pool_type,
                                   "size" => config.shared_memory_size);
                    self.inner.lock().expect("server poisoned").global_pool = Some(pool);
                }
                Err(error) => {
                    logging::warn!(self.log, "global pool creation failed, shm disabled";
                                   "error" => %error);
                }
            }
        }

        {
            let mut inner = self.inner.lock().expect("server poisoned");
            inner.listen_device = Some(device.clone());
            inner.listening = true;
            inner.idle_since = Some(Instant::now());
            inner.idle_reported = false;
        }

        if config.enable_io_thread {
            let thread = Thread::spawn("inc-server-io", Some(&self.log)).map_err(|_| {
                self.inner.lock().expect("server poisoned").listening = false;
                IncError::Internal
            })?;

            object::move_to_thread(device.object(), thread.data());

            // Start monitoring (and the housekeeping timer) on the I/O
            // thread once the move has landed there.
            let moved_device = device.clone();
            object::invoke_method(
                device.object(),
                ConnectionType::QUEUED,
                Vec::new(),
                Arc::new(move |receiver, _| {
                    moved_device.start_event_monitoring(&dispatcher::ensure_current());
                    object::start_timer(
                        receiver,
                        HOUSEKEEPING_INTERVAL,
                        TimerType::Coarse,
                        Variant::empty(),
                    );
                }),
            );

            self.inner.lock().expect("server poisoned").io_thread = Some(thread);
        } else {
            if !device.start_event_monitoring(&dispatcher::ensure_current()) {
                logging::error!(self.log, "failed to start event monitoring");
                self.inner.lock().expect("server poisoned").listening = false;
                return Err(IncError::ConnectionFailed);
            }
            object::start_timer(
                device.object(),
                HOUSEKEEPING_INTERVAL,
                TimerType::Coarse,
                Variant::empty(),
            );
        }

        logging::info!(self.log, "listening"; "url" => &url);
        Ok(())
    }

    fn close_impl(&self) {
        let (device, io_thread, connections) = {
            let mut inner = self.inner.lock().expect("server poisoned");
            if !inner.listening && inner.listen_device.is_none() {
                return;
            }

            inner.listening = false;
            let connections: Vec<ConnectionRef> =
                inner.connections.drain(..).map(|(_, conn)| conn).collect();
            (inner.listen_device.take(), inner.io_thread.take(), connections)
        };

        // Stop the I/O thread before touching its objects.
        if let Some(mut thread) = io_thread {
            logging::debug!(self.log, "stopping io thread");
            thread.exit();
            thread.wait();
        }

        for conn in connections {
            conn.clear_channels();
            conn.close();
            object::finalize_delete(conn.protocol().object());
            object::finalize_delete(conn.device().object());
        }

        if let Some(device) = device {
            object::disconnect(device.object(), None, Some(&self.object), None);
            device.close();
            object::finalize_delete(device.object());
        }

        logging::info!(self.log, "server closed");
    }

    /// Accept path; runs on the monitoring thread.
    fn handle_new_connection(self: Arc<Self>, device: DeviceRef) {
        let config = self.config.lock().expect("server poisoned").clone();

        let connection_id = {
            let mut inner = self.inner.lock().expect("server poisoned");

            if config.max_connections > 0
                && inner.connections.len() >= config.max_connections as usize
            {
                logging::warn!(self.log, "max connections reached, refusing client";
                               "limit" => config.max_connections);
                device.close();
                return;
            }

            if config.max_connections_per_client > 0 {
                let device_peer_address = device.peer_address();
                let host = host_of(&device_peer_address);
                let from_host = inner
                    .connections
                    .values()
                    .filter(|conn| host_of(&conn.peer_address()) == host)
                    .count();
                if from_host >= config.max_connections_per_client as usize {
                    logging::warn!(self.log, "per-client connection limit reached";
                                   "host" => host,
                                   "limit" => config.max_connections_per_client);
                    device.close();
                    return;
                }
            }

            inner.next_connection_id += 1;
            inner.next_connection_id
        };

        let conn = Connection::new(device.clone(), connection_id, Some(&self.log));

        let mut handshake = Handshake::new(HandshakeRole::Server, Some(&self.log));
        handshake.set_server_config(&self.object.name(), &config);
        conn.set_handshake(handshake);

        // Wire everything before events can flow.
        let weak = Arc::downgrade(&self);
        object::connect(
            conn.protocol().object(),
            &protocol_signals::MESSAGE_RECEIVED,
            &self.object,
            TAG_ON_CONN_MESSAGE,
            1,
            ConnectionType::DIRECT,
            conn_message_slot(weak.clone(), connection_id),
        );
        object::connect(
            conn.protocol().object(),
            &protocol_signals::ERROR_OCCURRED,
            &self.object,
            TAG_ON_CONN_ERROR,
            1,
            ConnectionType::DIRECT,
            conn_trouble_slot(weak.clone(), connection_id),
        );
        object::connect(
            conn.protocol().object(),
            &protocol_signals::BINARY_DATA_RECEIVED,
            &self.object,
            TAG_ON_CONN_BINARY,
            3,
            ConnectionType::DIRECT,
            conn_binary_slot(weak.clone(), connection_id),
        );
        object::connect(
            device.object(),
            &device_signals::ERROR_OCCURRED,
            &self.object,
            TAG_ON_CONN_ERROR,
            1,
            ConnectionType::DIRECT,
            conn_trouble_slot(weak.clone(), connection_id),
        );
        object::connect(
            device.object(),
            &device_signals::DISCONNECTED,
            &self.object,
            TAG_ON_CONN_GONE,
            0,
            ConnectionType::DIRECT,
            conn_trouble_slot(weak, connection_id),
        );

        // Accepted transports are established; watch reads only.
        device.config_event_ability(true, false);

        if !device.start_event_monitoring(&dispatcher::ensure_current()) {
            logging::error!(self.log, "failed to monitor accepted device");
            conn.close();
            return;
        }

        {
            let mut inner = self.inner.lock().expect("server poisoned");
            inner.connections.insert(connection_id, conn);
            inner.idle_since = None;
            inner.idle_reported = false;
        }

        logging::info!(self.log, "client connected";
                       "connection" => connection_id,
                       "peer" => device.peer_address());
        object::emit(
            &self.object,
            &signals::CLIENT_CONNECTED,
            &[Variant::from(connection_id)],
        );
    }

    fn close_connection(&self, connection_id: u64) {
        let conn = {
            let mut inner = self.inner.lock().expect("server poisoned");
            let conn = inner.connections.shift_remove(&connection_id);
            if inner.connections.is_empty() {
                inner.idle_since = Some(Instant::now());
            }
            conn
        };

        if let Some(conn) = conn {
            logging::info!(self.log, "client disconnected"; "connection" => connection_id);
            conn.close();
            object::finalize_delete(conn.protocol().object());
            object::finalize_delete(conn.device().object());
            object::emit(
                &self.object,
                &signals::CLIENT_DISCONNECTED,
                &[Variant::from(connection_id)],
            );
        }
    }

    fn connection(&self, connection_id: u64) -> Option<ConnectionRef> {
        self.inner
            .lock()
            .expect("server poisoned")
            .connections
            .get(&connection_id)
            .cloned()
    }

    /// Per-connection message dispatch; runs on the monitoring thread.
    fn dispatch(&self, connection_id: u64, msg: &Message) {
        let conn = match self.connection(connection_id) {
            Some(conn) => conn,
            None => return,
        };

        // Reply-parity guard: a server only consumes request-typed codes;
        // replies to its own pings were already settled by the protocol.
        if msg.message_type.is_reply() {
            return;
        }

        if msg.is_expired(Instant::now()) {
            logging::warn!(conn.log(), "dropping expired message";
                           "type" => msg.message_type.code(),
                           "sequence" => msg.sequence);
            return;
        }

        match msg.message_type {
            MessageType::Handshake => self.handle_handshake(&conn, msg),
            MessageType::MethodCall => self.handle_method_call(&conn, msg),
            MessageType::Subscribe => self.handle_subscribe(&conn, msg),
            MessageType::Unsubscribe => self.handle_unsubscribe(&conn, msg),
            MessageType::Ping => {
                let pong = Message::with_channel(MessageType::Pong, msg.channel, msg.sequence);
                conn.send_message(pong);
            }
            MessageType::StreamOpen => self.handle_stream_open(&conn, msg),
            MessageType::StreamClose => self.handle_stream_close(&conn, msg),
            other => {
                logging::warn!(conn.log(), "unhandled message type"; "type" => other.code());
            }
        }
    }

    fn handle_handshake(&self, conn: &ConnectionRef, msg: &Message) {
        let (state, response) = conn.process_handshake(&msg.payload);

        match state {
            HandshakeState::Completed => {
                let mut ack = Message::new(MessageType::HandshakeAck, msg.sequence);
                ack.set_payload(response.unwrap_or_default());
                conn.send_message(ack);

                logging::info!(conn.log(), "handshake completed";
                               "peer" => conn.peer_name(),
                               "peer_version" => conn.peer_protocol_version());
            }
            _ => {
                logging::error!(conn.log(), "handshake failed, dropping client");
                conn.clear_handshake();
                self.close_connection(conn.id());
            }
        }
    }

    fn handle_method_call(&self, conn: &ConnectionRef, msg: &Message) {
        let mut tags = TagReader::new(&msg.payload);

        let parsed = (|| {
            let version = tags.get_u16().ok()?;
            let method = tags.get_string().ok()?;
            let args = tags.get_bytes().ok()?;
            if !tags.at_end() {
                return None;
            }
            Some((version, method, args))
        })();

        let (version, method, args) = match parsed {
            Some(parsed) => parsed,
            None => {
                logging::error!(conn.log(), "malformed method call";
                                "sequence" => msg.sequence);
                conn.send_reply(msg.sequence, IncError::InvalidMessage.code(), &[]);
                return;
            }
        };

        let hooks = self.hooks.lock().expect("server poisoned");
        (hooks.on_method)(conn, msg.sequence, &method, version, &args);
    }

    fn handle_subscribe(&self, conn: &ConnectionRef, msg: &Message) {
        let mut tags = TagReader::new(&msg.payload);
        let pattern = match tags.get_string() {
            Ok(pattern) if tags.at_end() => pattern,
            _ => {
                logging::error!(conn.log(), "malformed subscribe");
                self.send_subscription_ack(conn, msg, true, IncError::InvalidMessage.code());
                return;
            }
        };

        let allowed = {
            let hooks = self.hooks.lock().expect("server poisoned");
            (hooks.on_subscribe)(conn, &pattern)
        };

        if allowed {
            conn.add_subscription(&pattern);
            self.send_subscription_ack(conn, msg, true, OK);
        } else {
            self.send_subscription_ack(conn, msg, true, IncError::AccessDenied.code());
        }
    }

    fn handle_unsubscribe(&self, conn: &ConnectionRef, msg: &Message) {
        let mut tags = TagReader::new(&msg.payload);
        let pattern = match tags.get_string() {
            Ok(pattern) if tags.at_end() => pattern,
            _ => {
                logging::error!(conn.log(), "malformed unsubscribe");
                return;
            }
        };

        conn.remove_subscription(&pattern);
        self.send_subscription_ack(conn, msg, false, OK);
    }

    fn send_subscription_ack(
        &self,
        conn: &ConnectionRef,
        msg: &Message,
        subscribe: bool,
        code: i32,
    ) {
        let ack_type = if subscribe {
            MessageType::SubscribeAck
        } else {
            MessageType::UnsubscribeAck
        };

        let mut ack = Message::with_channel(ack_type, msg.channel, msg.sequence);
        let mut tags = TagWriter::new();
        tags.put_i32(code);
        ack.set_payload(tags.finish());
        conn.send_message(ack);
    }

    /// Channel allocation with optional shared-memory negotiation.
    fn handle_stream_open(&self, conn: &ConnectionRef, msg: &Message) {
        let config = self.config.lock().expect("server poisoned").clone();
        let mut tags = TagReader::new(&msg.payload);

        let (mode, want_shm) = match (tags.get_u32(), tags.get_bool()) {
            (Ok(mode), Ok(want_shm)) => (mode, want_shm),
            _ => {
                logging::error!(conn.log(), "malformed stream open");
                return;
            }
        };

        let mut negotiated_type: u16 = 0;
        let mut pool: Option<MemPool> = None;

        if want_shm {
            let (client_types, client_pool_name) = match (tags.get_u16(), tags.get_bytes()) {
                (Ok(types), Ok(name)) if tags.at_end() => (types, name),
                _ => {
                    logging::error!(conn.log(), "malformed stream open shm info");
                    return;
                }
            };

            let intersection = client_types & config.shared_memory_types();
            if intersection != 0 && conn.is_local() {
                // Highest-priority type is the lowest set bit (memfd wins
                // over POSIX).
                negotiated_type = 1u16 << intersection.trailing_zeros();
                let name = String::from_utf8_lossy(&client_pool_name).to_string();

                match MemPool::create(
                    &conn.peer_name(),
                    &name,
                    negotiated_type,
                    config.shared_memory_size,
                    Some(conn.log()),
                ) {
                    Ok(created) => pool = Some(created),
                    Err(error) => {
                        logging::warn!(conn.log(), "per-connection pool creation failed";
                                       "error" => %error);
                        negotiated_type = 0;
                    }
                }
            } else {
                negotiated_type = 0;
            }

            logging::info!(conn.log(), "negotiated shared memory";
                           "client_types" => client_types,
                           "server_types" => config.shared_memory_types(),
                           "selected" => negotiated_type);
        }

        let channel_id = {
            let mut inner = self.inner.lock().expect("server poisoned");
            inner.next_channel_id += 1;
            inner.next_channel_id
        };
        conn.add_channel(channel_id, mode);

        let mut reply = Message::with_channel(MessageType::StreamOpenAck, msg.channel, msg.sequence);
        let mut tags = TagWriter::new();
        tags.put_u32(channel_id).put_bool(want_shm);
        if want_shm {
            let (pool_name, pool_size) = match &pool {
                Some(pool) => (pool.name().to_string(), pool.size() as i32),
                None => (String::new(), 0),
            };
            tags.put_u16(negotiated_type)
                .put_bytes(pool_name.as_bytes())
                .put_i32(pool_size);
        }
        reply.set_payload(tags.finish());

        if let Some(pool) = &pool {
            if conn.device().supports_fd_passing() {
                reply.ext_fd = Some(pool.fd());
            }
            conn.enable_mempool(pool.clone());
        }

        logging::info!(conn.log(), "allocated channel";
                       "channel" => channel_id,
                       "mode" => mode,
                       "sequence" => msg.sequence);
        conn.send_message(reply);

        object::emit(
            &self.object,
            &signals::STREAM_OPENED,
            &[
                Variant::from(conn.id()),
                Variant::from(channel_id),
                Variant::from(mode),
            ],
        );
    }

    fn handle_stream_close(&self, conn: &ConnectionRef, msg: &Message) {
        let channel_id = msg.channel;
        conn.remove_channel(channel_id);

        let reply = Message::with_channel(MessageType::StreamCloseAck, channel_id, msg.sequence);
        conn.send_message(reply);

        object::emit(
            &self.object,
            &signals::STREAM_CLOSED,
            &[Variant::from(conn.id()), Variant::from(channel_id)],
        );
    }

    /// Bulk data arrived for a connection; validate the channel and hand it
    /// to the application, acknowledging the consumed length.
    fn handle_binary_data(&self, connection_id: u64, channel_id: u32, sequence: u32, chunk: &BinaryChunk) {
        let conn = match self.connection(connection_id) {
            Some(conn) => conn,
            None => return,
        };

        match conn.channel_mode(channel_id) {
            Some(mode) if mode & MODE_WRITE != 0 => {}
            _ => {
                logging::warn!(conn.log(), "binary data on unknown or read-only channel";
                               "channel" => channel_id);
                self.send_binary_ack(&conn, channel_id, sequence, -IncError::Channel.code());
                return;
            }
        }

        {
            let hooks = self.hooks.lock().expect("server poisoned");
            (hooks.on_binary)(&conn, channel_id, sequence, 0, chunk);
        }

        self.send_binary_ack(&conn, channel_id, sequence, chunk.len() as i32);
    }

    fn send_binary_ack(&self, conn: &ConnectionRef, channel_id: u32, sequence: u32, written: i32) {
        let mut ack = Message::with_channel(MessageType::BinaryDataAck, channel_id, sequence);
        let mut tags = TagWriter::new();
        tags.put_i32(written);
        ack.set_payload(tags.finish());
        conn.send_message(ack);
    }

    /// Broadcast fan-out on the I/O thread.
    fn handle_custom_action(&self, args: &[Variant]) {
        let name = match args.get(0).and_then(|arg| arg.get::<String>()) {
            Some(name) => name,
            None => return,
        };
        let version = args.get(1).and_then(|arg| arg.get::<u16>()).unwrap_or(0);
        let data = args
            .get(2)
            .and_then(|arg| arg.get::<Vec<u8>>())
            .unwrap_or_default();

        let connections: Vec<ConnectionRef> = self
            .inner
            .lock()
            .expect("server poisoned")
            .connections
            .values()
            .cloned()
            .collect();

        for conn in connections {
            if conn.is_subscribed(&name) {
                conn.send_event(&name, version, &data);
            }
        }
    }

    fn on_listen_trouble(&self) {
        let listening = self.inner.lock().expect("server poisoned").listening;
        if !listening {
            return;
        }

        // A dying listener leaves nothing to accept on; shut down fully.
        logging::error!(self.log, "listen device failed, closing server");
        self.close_impl();
    }

    /// Periodic sweep: idle clients out, stale operations failed.
    fn housekeeping(&self) {
        let config = self.config.lock().expect("server poisoned").clone();
        let now = Instant::now();

        let connections: Vec<ConnectionRef> = self
            .inner
            .lock()
            .expect("server poisoned")
            .connections
            .values()
            .cloned()
            .collect();

        let timeout = Duration::from_millis(config.client_timeout_ms);
        for conn in connections {
            conn.protocol().expire_operations(now);

            if config.client_timeout_ms == 0 {
                continue;
            }

            let idle = conn.idle_time(now);
            if idle > timeout {
                logging::warn!(conn.log(), "client idle past timeout, dropping";
                               "idle_ms" => idle.as_millis() as u64);
                self.close_connection(conn.id());
            } else if idle > timeout / 2 && conn.handshake_completed() {
                // Probe a quiet client before giving up on it.
                conn.pingpong();
            }
        }

        // Surface prolonged idleness once; shutdown stays an application
        // decision.
        if config.exit_idle_time_ms >= 0 {
            let report = {
                let mut inner = self.inner.lock().expect("server poisoned");
                let limit = Duration::from_millis(config.exit_idle_time_ms as u64);
                let idle = inner
                    .idle_since
                    .map(|since| now.saturating_duration_since(since) >= limit)
                    .unwrap_or(false);

                if idle && !inner.idle_reported {
                    inner.idle_reported = true;
                    true
                } else {
                    false
                }
            };

            if report {
                logging::info!(self.log, "server idle past configured limit");
                object::emit(&self.object, &signals::IDLE_TIMEOUT, &[]);
            }
        }
    }
}

fn host_of(address: &str) -> &str {
    match address.rfind(':') {
        Some(at) => &address[..at],
        None => address,
    }
}

fn new_connection_slot(weak: Weak<ServerShared>) -> object::SlotFn {
    Arc::new(move |_, args| {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        if let Some(device) = args.get(0).and_then(|arg| arg.get::<DeviceRef>()) {
            shared.handle_new_connection(device);
        }
    })
}

fn listen_trouble_slot(weak: Weak<ServerShared>) -> object::SlotFn {
    Arc::new(move |_, _| {
        if let Some(shared) = weak.upgrade() {
            shared.on_listen_trouble();
        }
    })
}

fn custom_action_slot(weak: Weak<ServerShared>) -> object::SlotFn {
    Arc::new(move |_, args| {
        if let Some(shared) = weak.upgrade() {
            shared.handle_custom_action(args);
        }
    })
}

fn conn_message_slot(weak: Weak<ServerShared>, connection_id: u64) -> object::SlotFn {
    Arc::new(move |_, args| {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        if let Some(msg) = args.get(0).and_then(|arg| arg.value::<Message>()) {
            shared.dispatch(connection_id, msg);
        }
    })
}

fn conn_trouble_slot(weak: Weak<ServerShared>, connection_id: u64) -> object::SlotFn {
    Arc::new(move |_, _| {
        if let Some(shared) = weak.upgrade() {
            shared.close_connection(connection_id);
        }
    })
}

fn conn_binary_slot(weak: Weak<ServerShared>, connection_id: u64) -> object::SlotFn {
    Arc::new(move |_, args| {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        let channel = args.get(0).and_then(|arg| arg.get::<u32>()).unwrap_or(0);
        let sequence = args.get(1).and_then(|arg| arg.get::<u32>()).unwrap_or(0);
        if let Some(chunk) = args.get(2).and_then(|arg| arg.value::<BinaryChunk>()) {
            shared.handle_binary_data(connection_id, channel, sequence, chunk);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("127.0.0.1:9000"), "127.0.0.1");
        assert_eq!(host_of("/tmp/socket.sock"), "/tmp/socket.sock");
    }

    #[test]
    fn test_listen_requires_url_or_config() {
        let server = Server::new("test-server", None);
        assert_eq!(server.listen_on(""), IncError::InvalidArgs.code());
        assert!(!server.is_listening());
    }

    #[test]
    fn test_listen_and_close() {
        let server = Server::new("test-server", None);
        let mut config = ServerConfig::default();
        config.disable_shared_memory = true;
        server.set_config(config);

        assert_eq!(server.listen_on("tcp://127.0.0.1:0"), OK);
        assert!(server.is_listening());
        assert_eq!(server.listen_on("tcp://127.0.0.1:0"), IncError::InvalidState.code());

        server.close();
        assert!(!server.is_listening());
    }

    #[test]
    fn test_bad_listen_url() {
        let server = Server::new("test-server", None);
        assert_eq!(
            server.listen_on("tcp://127.0.0.1:nope"),
            IncError::ConnectionFailed.code()
        );
    }

    // ----- end-to-end sessions -----
    //
    // The server runs its I/O on a kernel thread; the client lives on the
    // test thread, which pumps its own dispatcher while waiting.

    use crate::config::ContextConfig;
    use crate::context::{signals as context_signals, Context, ContextState};
    use axon::event_loop::{EventLoop, ProcessFlags};
    use axon::meta::OBJECT_META;
    use axon::object::Object;

    fn pump_until<F: FnMut() -> bool>(mut done: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            EventLoop::process_events(ProcessFlags::ALL_EVENTS);
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn echo_server(url: &str, shared_memory: bool) -> Server {
        let server = Server::new("echo-server", None);

        let mut config = ServerConfig::default();
        config.disable_shared_memory = !shared_memory;
        config.shared_memory_size = 8 * 1024 * 1024;
        config.enable_io_thread = true;
        server.set_config(config);

        server.set_method_handler(Box::new(|conn, sequence, method, _version, args| {
            match method {
                "echo" => conn.send_reply(sequence, OK, args),
                _ => conn.send_reply(sequence, IncError::InvalidArgs.code(), &[]),
            }
        }));

        assert_eq!(server.listen_on(url), OK);
        server
    }

    fn quiet_client(server_url: &str) -> Context {
        let context = Context::new("test-client", None);
        let mut config = ContextConfig::default();
        config.auto_reconnect = false;
        config.default_server = server_url.to_string();
        context.set_config(config);
        context
    }

    #[test]
    fn test_echo_rpc_over_tcp() {
        let server = echo_server("tcp://127.0.0.1:19001", false);
        let context = quiet_client("");

        assert_eq!(context.connect("tcp://127.0.0.1:19001"), OK);
        assert!(
            pump_until(|| context.state() == ContextState::Ready, Duration::from_secs(5)),
            "handshake did not complete"
        );

        let op = context.call_method(
            "echo",
            1,
            &[0xDE, 0xAD, 0xBE, 0xEF],
            Some(Duration::from_millis(1000)),
        );
        assert!(
            pump_until(|| op.state().is_terminal(), Duration::from_secs(5)),
            "echo reply missing"
        );

        assert_eq!(op.error_code(), 0);
        assert_eq!(op.result(), vec![0xDE, 0xAD, 0xBE, 0xEF]);

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_echo_rpc_over_unix() {
        let path = format!("/tmp/inc-echo-{}.sock", std::process::id());
        let url = format!("unix://{}", path);

        let server = echo_server(&url, false);
        let context = quiet_client(&url);

        assert_eq!(context.connect(""), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        let op = context.call_method("echo", 1, b"local", None);
        assert!(pump_until(|| op.state().is_terminal(), Duration::from_secs(5)));
        assert_eq!(op.result(), b"local".to_vec());

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_echo_rpc_over_udp() {
        let server = echo_server("udp://127.0.0.1:19003", false);
        let context = quiet_client("");

        assert_eq!(context.connect("udp://127.0.0.1:19003"), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        let op = context.call_method("echo", 1, &[0x55; 48], None);
        assert!(pump_until(|| op.state().is_terminal(), Duration::from_secs(5)));
        assert_eq!(op.error_code(), 0);
        assert_eq!(op.result(), vec![0x55; 48]);

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_subscribe_and_broadcast_routing() {
        let server = echo_server("tcp://127.0.0.1:19004", false);
        let context = quiet_client("");

        assert_eq!(context.connect("tcp://127.0.0.1:19004"), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        let events = Arc::new(Mutex::new(Vec::new()));
        let observer = Object::new(&OBJECT_META, "observer", None);
        let events_in = events.clone();
        object::connect(
            context.object(),
            &context_signals::EVENT_RECEIVED,
            &observer,
            SlotTag::ANONYMOUS,
            3,
            ConnectionType::DIRECT,
            Arc::new(move |_, args| {
                events_in.lock().unwrap().push((
                    args[0].get::<String>().unwrap(),
                    args[1].get::<u16>().unwrap(),
                    args[2].get::<Vec<u8>>().unwrap(),
                ));
            }),
        )
        .unwrap();

        let op = context.subscribe("system.*");
        assert!(pump_until(|| op.state().is_terminal(), Duration::from_secs(5)));
        assert_eq!(op.error_code(), 0);

        server.broadcast_event("system.shutdown", 1, &[0x01]);
        server.broadcast_event("app.tick", 1, &[]);

        assert!(pump_until(
            || !events.lock().unwrap().is_empty(),
            Duration::from_secs(5)
        ));
        // Give the unmatched event time to (not) arrive.
        std::thread::sleep(Duration::from_millis(100));
        EventLoop::process_events(ProcessFlags::ALL_EVENTS);

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec![("system.shutdown".to_string(), 1u16, vec![0x01])]);

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_reconnect_attempts_are_bounded() {
        // Nothing listens on this port.
        let context = Context::new("reconnect-client", None);
        let mut config = ContextConfig::default();
        config.auto_reconnect = true;
        config.reconnect_interval_ms = 50;
        config.max_reconnect_attempts = 3;
        config.default_server = "tcp://127.0.0.1:19005".to_string();
        context.set_config(config);

        // Count transitions into Connecting: the manual attempt plus the
        // three scheduled retries.
        let connecting = Arc::new(Mutex::new(0u32));
        let observer = Object::new(&OBJECT_META, "observer", None);
        let connecting_in = connecting.clone();
        object::connect(
            context.object(),
            &context_signals::STATE_CHANGED,
            &observer,
            SlotTag::ANONYMOUS,
            2,
            ConnectionType::DIRECT,
            Arc::new(move |_, args| {
                if args[1].get::<i32>() == Some(ContextState::Connecting.code()) {
                    *connecting_in.lock().unwrap() += 1;
                }
            }),
        )
        .unwrap();

        context.connect("");

        // Let the whole retry schedule play out, then a little longer to
        // catch any excess attempt.
        pump_until(|| false, Duration::from_millis(600));

        assert_eq!(*connecting.lock().unwrap(), 4, "one manual + three retries");
        assert_eq!(context.state(), ContextState::Failed);

        // A server appears; a manual connect succeeds.
        let server = echo_server("tcp://127.0.0.1:19005", false);
        assert_eq!(context.connect(""), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_zero_copy_channel_over_unix() {
        let path = format!("/tmp/inc-shm-{}.sock", std::process::id());
        let url = format!("unix://{}", path);

        let server = echo_server(&url, true);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_in = received.clone();
        server.set_binary_handler(Box::new(move |_, channel, _seq, _pos, chunk| {
            received_in
                .lock()
                .unwrap()
                .push((channel, chunk.is_mapped(), chunk.as_slice().to_vec()));
        }));

        let context = quiet_client(&url);
        assert_eq!(context.connect(""), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        let op = context.request_channel(MODE_WRITE);
        assert!(pump_until(|| op.state().is_terminal(), Duration::from_secs(5)));
        assert_eq!(op.error_code(), 0);

        let op_result = op.result();
        let mut tags = TagReader::new(&op_result);
        let channel_id = tags.get_u32().unwrap();
        assert!(channel_id > 0);

        // One mebibyte from the negotiated pool travels as a reference.
        let payload: Vec<u8> = (0..=255u8).cycle().take(1024 * 1024).collect();
        let block = context
            .acquire_buffer(payload.len())
            .expect("shared memory pool was negotiated");
        assert!(block.fill_from(&payload));

        let send = context.send_binary_data(channel_id, BinaryPayload::Block(block));
        assert!(pump_until(|| send.state().is_terminal(), Duration::from_secs(5)));

        assert!(pump_until(
            || !received.lock().unwrap().is_empty(),
            Duration::from_secs(5)
        ));

        let seen = received.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let (channel, mapped, bytes) = &seen[0];
        assert_eq!(*channel, channel_id);
        assert!(*mapped, "payload must arrive as a mapped view");
        assert_eq!(bytes.len(), payload.len());
        assert_eq!(bytes, &payload);

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_channel_ids_never_repeat() {
        let server = echo_server("tcp://127.0.0.1:19006", false);
        let context = quiet_client("");

        assert_eq!(context.connect("tcp://127.0.0.1:19006"), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let op = context.request_channel(MODE_WRITE);
            assert!(pump_until(|| op.state().is_terminal(), Duration::from_secs(5)));

            let op_result = op.result();
            let mut tags = TagReader::new(&op_result);
            let channel_id = tags.get_u32().unwrap();
            assert!(seen.insert(channel_id), "channel id {} repeated", channel_id);

            let release = context.release_channel(channel_id);
            assert!(pump_until(
                || release.state().is_terminal(),
                Duration::from_secs(5)
            ));
        }

        context.disconnect();
        server.close();
    }

    #[test]
    fn test_disconnect_fails_inflight_operations() {
        let server = echo_server("tcp://127.0.0.1:19007", false);
        let context = quiet_client("");

        assert_eq!(context.connect("tcp://127.0.0.1:19007"), OK);
        assert!(pump_until(
            || context.state() == ContextState::Ready,
            Duration::from_secs(5)
        ));

        // Stall the server side so the reply cannot arrive in time.
        server.set_method_handler(Box::new(|_, _, _, _, _| {}));

        let op = context.call_method("black-hole", 1, &[], Some(Duration::from_secs(30)));
        assert!(!op.state().is_terminal());

        context.disconnect();
        assert_eq!(op.error_code(), IncError::NotConnected.code());

        server.close();
    }
}
