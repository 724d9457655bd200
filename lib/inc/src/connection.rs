//! Server-side per-client state: protocol, handshake progress, channel
//! table, subscriptions and the negotiated memory pool.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use axon::logging::{self, Logger};
use axon::meta::{MetaObject, OBJECT_META};
use axon::object::{Object, ObjectRef};

use crate::device::DeviceRef;
use crate::error::IncError;
use crate::handshake::{Handshake, State as HandshakeState};
use crate::memory::MemPool;
use crate::message::{Message, MessageType};
use crate::operation::OperationRef;
use crate::protocol::{BinaryPayload, Protocol};
use crate::tags::TagWriter;

pub static CONNECTION_META: MetaObject = MetaObject::new("Connection", Some(&OBJECT_META));

/// Channel access modes, combined as a bitset.
pub const MODE_READ: u32 = 0x1;
pub const MODE_WRITE: u32 = 0x2;

/// Exact name, or `prefix.*` matching `prefix.<anything>`.
pub fn matches_pattern(event_name: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_name.starts_with(prefix)
            && event_name.len() > prefix.len()
            && event_name.as_bytes()[prefix.len()] == b'.';
    }

    event_name == pattern
}

struct ConnInner {
    peer_name: String,
    peer_protocol_version: u32,
    handshake: Option<Handshake>,
    subscriptions: Vec<String>,
    channels: HashMap<u32, u32>,
    mempool: Option<MemPool>,
}

pub struct Connection {
    object: ObjectRef,
    protocol: Arc<Protocol>,
    id: u64,
    inner: Mutex<ConnInner>,
    log: Logger,
}

pub type ConnectionRef = Arc<Connection>;

impl Connection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        device: DeviceRef,
        id: u64,
        log: L,
    ) -> ConnectionRef {
        let log = logging::child(log, logging::o!("connection" => id));
        let object = Object::new(&CONNECTION_META, "connection", Some(&log));
        let protocol = Protocol::new(device, Some(&log));

        Arc::new(Connection {
            object,
            protocol,
            id,
            inner: Mutex::new(ConnInner {
                peer_name: String::new(),
                peer_protocol_version: 0,
                handshake: None,
                subscriptions: Vec::new(),
                channels: HashMap::new(),
                mempool: None,
            }),
            log,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    #[inline]
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        self.protocol.device()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn peer_address(&self) -> String {
        self.device().peer_address()
    }

    pub fn is_local(&self) -> bool {
        self.device().is_local()
    }

    pub fn is_connected(&self) -> bool {
        self.device().is_open()
    }

    pub fn peer_name(&self) -> String {
        self.inner.lock().expect("connection poisoned").peer_name.clone()
    }

    pub fn peer_protocol_version(&self) -> u32 {
        self.inner
            .lock()
            .expect("connection poisoned")
            .peer_protocol_version
    }

    // ----- handshake -----

    pub fn set_handshake(&self, handshake: Handshake) {
        self.inner.lock().expect("connection poisoned").handshake = Some(handshake);
    }

    pub fn clear_handshake(&self) {
        self.inner.lock().expect("connection poisoned").handshake = None;
    }

    pub fn handshake_completed(&self) -> bool {
        self.inner
            .lock()
            .expect("connection poisoned")
            .handshake
            .as_ref()
            .map(|handshake| handshake.state() == HandshakeState::Completed)
            .unwrap_or(false)
    }

    /// Feed the client's handshake payload. On completion, captures the
    /// peer identity and returns the response payload to send back.
    pub fn process_handshake(&self, bytes: &[u8]) -> (HandshakeState, Option<Vec<u8>>) {
        let mut inner = self.inner.lock().expect("connection poisoned");

        let handshake = match inner.handshake.as_mut() {
            Some(handshake) => handshake,
            None => {
                logging::warn!(self.log, "handshake payload but no handler installed");
                return (HandshakeState::Failed, None);
            }
        };

        let response = handshake.process(bytes);
        let state = handshake.state();

        if state == HandshakeState::Completed {
            let peer_name = handshake.remote_data().node_name.clone();
            let peer_protocol_version = handshake.remote_data().protocol_version;
            inner.peer_name = peer_name;
            inner.peer_protocol_version = peer_protocol_version;
        }

        (state, response)
    }

    // ----- subscriptions -----

    pub fn is_subscribed(&self, event_name: &str) -> bool {
        self.inner
            .lock()
            .expect("connection poisoned")
            .subscriptions
            .iter()
            .any(|pattern| matches_pattern(event_name, pattern))
    }

    pub fn add_subscription(&self, pattern: &str) {
        let mut inner = self.inner.lock().expect("connection poisoned");
        if inner.subscriptions.iter().any(|existing| existing == pattern) {
            return;
        }

        logging::info!(self.log, "subscribed"; "pattern" => pattern);
        inner.subscriptions.push(pattern.to_string());
    }

    pub fn remove_subscription(&self, pattern: &str) {
        let mut inner = self.inner.lock().expect("connection poisoned");
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|existing| existing != pattern);

        if inner.subscriptions.len() != before {
            logging::info!(self.log, "unsubscribed"; "pattern" => pattern);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .lock()
            .expect("connection poisoned")
            .subscriptions
            .len()
    }

    // ----- channels -----

    pub fn add_channel(&self, channel_id: u32, mode: u32) {
        logging::info!(self.log, "channel allocated"; "channel" => channel_id, "mode" => mode);
        self.inner
            .lock()
            .expect("connection poisoned")
            .channels
            .insert(channel_id, mode);
    }

    pub fn remove_channel(&self, channel_id: u32) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("connection poisoned")
            .channels
            .remove(&channel_id)
            .is_some();

        if removed {
            logging::info!(self.log, "channel released"; "channel" => channel_id);
        }
        removed
    }

    pub fn channel_mode(&self, channel_id: u32) -> Option<u32> {
        self.inner
            .lock()
            .expect("connection poisoned")
            .channels
            .get(&channel_id)
            .copied()
    }

    pub fn clear_channels(&self) {
        self.inner.lock().expect("connection poisoned").channels.clear();
    }

    // ----- shared memory -----

    /// Record the negotiated pool and accept imports from it. The client
    /// side of the segment is the allocating side; this end reads.
    pub fn enable_mempool(&self, pool: MemPool) {
        self.protocol.attach_import_pool(pool.clone());
        self.inner.lock().expect("connection poisoned").mempool = Some(pool);
    }

    pub fn mempool(&self) -> Option<MemPool> {
        self.inner.lock().expect("connection poisoned").mempool.clone()
    }

    // ----- traffic -----

    pub fn send_message(&self, msg: Message) -> OperationRef {
        self.protocol.send_message(msg)
    }

    pub fn send_reply(&self, sequence: u32, error_code: i32, result: &[u8]) {
        let mut msg = Message::new(MessageType::MethodReply, sequence);
        let mut tags = TagWriter::new();
        tags.put_i32(error_code).put_bytes(result);
        msg.set_payload(tags.finish());
        self.protocol.send_message(msg);
    }

    pub fn send_event(&self, event_name: &str, version: u16, data: &[u8]) {
        let mut msg = Message::new(MessageType::Event, self.protocol.next_sequence());
        let mut tags = TagWriter::new();
        tags.put_u16(version).put_string(event_name).put_bytes(data);
        msg.set_payload(tags.finish());
        self.protocol.send_message(msg);
    }

    /// Push bulk data to the client on a readable channel.
    pub fn send_binary_data(&self, channel_id: u32, payload: BinaryPayload) -> OperationRef {
        self.protocol.send_binary_data(channel_id, payload)
    }

    /// Application-level heartbeat towards this client.
    pub fn pingpong(&self) -> OperationRef {
        let msg = Message::new(MessageType::Ping, self.protocol.next_sequence());
        let op = self.protocol.send_message(msg);
        op.set_timeout(Duration::from_secs(5));
        op
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        self.protocol.idle_time(now)
    }

    pub fn close(&self) {
        logging::debug!(self.log, "closing connection");
        self.protocol.fail_all_operations(IncError::NotConnected);
        self.protocol.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceRef, TcpDevice};

    fn test_connection(id: u64) -> ConnectionRef {
        // An unmonitored listener stands in as the transport; these tests
        // never push traffic.
        let device: DeviceRef = TcpDevice::listen_on("127.0.0.1", 0, None).unwrap();
        Connection::new(device, id, None)
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("system.shutdown", "system.shutdown"));
        assert!(matches_pattern("system.shutdown", "system.*"));
        assert!(matches_pattern("system.power.off", "system.*"));
        assert!(!matches_pattern("app.tick", "system.*"));
        assert!(!matches_pattern("system", "system.*"));
        assert!(!matches_pattern("systemic.event", "system.*"));
        assert!(!matches_pattern("system.shutdown", "system.shutdown.extra"));
    }

    #[test]
    fn test_subscriptions_deduplicate() {
        let conn = test_connection(1);

        conn.add_subscription("system.*");
        conn.add_subscription("system.*");
        conn.add_subscription("app.tick");
        assert_eq!(conn.subscription_count(), 2);

        assert!(conn.is_subscribed("system.shutdown"));
        assert!(conn.is_subscribed("app.tick"));
        assert!(!conn.is_subscribed("app.other"));

        conn.remove_subscription("system.*");
        assert_eq!(conn.subscription_count(), 1);
        assert!(!conn.is_subscribed("system.shutdown"));
    }

    #[test]
    fn test_channel_table() {
        let conn = test_connection(2);

        conn.add_channel(7, MODE_WRITE);
        conn.add_channel(8, MODE_READ | MODE_WRITE);

        assert_eq!(conn.channel_mode(7), Some(MODE_WRITE));
        assert_eq!(conn.channel_mode(8), Some(MODE_READ | MODE_WRITE));
        assert_eq!(conn.channel_mode(9), None);

        assert!(conn.remove_channel(7));
        assert!(!conn.remove_channel(7));
        assert_eq!(conn.channel_mode(7), None);

        conn.clear_channels();
        assert_eq!(conn.channel_mode(8), None);
    }

    #[test]
    fn test_peer_identity_defaults() {
        let conn = test_connection(3);
        assert_eq!(conn.id(), 3);
        assert!(conn.peer_name().is_empty());
        assert_eq!(conn.peer_protocol_version(), 0);
        assert!(!conn.handshake_completed());
    }

    #[test]
    fn test_handshake_requires_handler() {
        let conn = test_connection(4);
        let (state, response) = conn.process_handshake(&[1, 2, 3]);
        assert_eq!(state, HandshakeState::Failed);
        assert!(response.is_none());
    }
}
