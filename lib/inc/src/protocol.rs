//! Per-connection codec: sequence allocation, queued sends with
//! partial-write resume, receive reassembly, operation completion and the
//! zero-copy binary path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use axon::logging::{self, Logger};
use axon::meta::{MetaObject, OBJECT_META};
use axon::object::{self, ConnectionType, Object, ObjectRef, Signal, SlotTag, USER_SIGNAL_BASE};
use axon::variant::Variant;

use crate::buffer::Buffer;
use crate::device::{signals as device_signals, DeviceRef};
use crate::error::{IncError, OK};
use crate::memory::{MemBlock, MemExport, MemImport, MemPool, ShmRef};
use crate::message::{Header, Message, MessageType, FLAG_SHM_DATA, HEADER_SIZE};
use crate::operation::{Operation, OperationRef};
use crate::tags::{TagReader, TagWriter};

pub static PROTOCOL_META: MetaObject = MetaObject::new("Protocol", Some(&OBJECT_META));

/// Send queue cap; sends beyond it fail with `QueueFull`.
pub const MAX_SEND_QUEUE: usize = 100;

pub mod signals {
    use super::*;

    /// `(message: Message)` — every complete non-binary message.
    pub const MESSAGE_RECEIVED: Signal = Signal::new(USER_SIGNAL_BASE, "message_received", 1);
    /// `(code: i32)`
    pub const ERROR_OCCURRED: Signal = Signal::new(USER_SIGNAL_BASE + 1, "error_occurred", 1);
    /// `(channel: u32, sequence: u32, chunk: BinaryChunk)`
    pub const BINARY_DATA_RECEIVED: Signal =
        Signal::new(USER_SIGNAL_BASE + 2, "binary_data_received", 3);
}

const TAG_ON_READY_READ: SlotTag = SlotTag(0x7001);
const TAG_ON_CONNECTED: SlotTag = SlotTag(0x7002);
const TAG_ON_READY_WRITE: SlotTag = SlotTag(0x7003);

/// Outgoing binary payload: either plain bytes or a pool-backed block
/// eligible for shared-memory export.
pub enum BinaryPayload {
    Inline(Vec<u8>),
    Block(MemBlock),
}

/// Incoming binary payload: inline copy or zero-copy mapped view.
#[derive(Clone)]
pub enum BinaryChunk {
    Inline(Vec<u8>),
    Mapped(MemBlock),
}

impl BinaryChunk {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BinaryChunk::Inline(bytes) => bytes,
            BinaryChunk::Mapped(block) => block.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, BinaryChunk::Mapped(_))
    }
}

struct ProtoState {
    sequence: u32,
    send_queue: VecDeque<Message>,
    partial: Vec<u8>,
    partial_offset: usize,
    recv: Buffer,
    operations: HashMap<u32, OperationRef>,
    mem_export: Option<Arc<MemExport>>,
    mem_import: Option<Arc<MemImport>>,
    last_ingress: Instant,
    closed: bool,
}

pub struct ProtocolInner {
    device: DeviceRef,
    object: ObjectRef,
    state: Mutex<ProtoState>,
    log: Logger,
}

/// The protocol facade; owns the device lifetime-wise.
pub struct Protocol {
    object: ObjectRef,
    inner: Arc<ProtocolInner>,
}

/// Message types whose sends are tracked by an operation awaiting the
/// matching reply.
fn is_tracked_request(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::MethodCall
            | MessageType::Subscribe
            | MessageType::Unsubscribe
            | MessageType::Ping
            | MessageType::StreamOpen
            | MessageType::StreamClose
            | MessageType::BinaryData
    )
}

impl Protocol {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(device: DeviceRef, log: L) -> Arc<Protocol> {
        let log = logging::child(log, logging::o!("component" => "protocol"));
        let object = Object::new(&PROTOCOL_META, "protocol", Some(&log));

        let inner = Arc::new(ProtocolInner {
            device: device.clone(),
            object: object.clone(),
            state: Mutex::new(ProtoState {
                sequence: 1,
                send_queue: VecDeque::new(),
                partial: Vec::new(),
                partial_offset: 0,
                recv: Buffer::new(),
                operations: HashMap::new(),
                mem_export: None,
                mem_import: None,
                last_ingress: Instant::now(),
                closed: false,
            }),
            log,
        });

        let weak = Arc::downgrade(&inner);
        object::connect(
            device.object(),
            &device_signals::READY_READ,
            &object,
            TAG_ON_READY_READ,
            0,
            ConnectionType::DIRECT,
            ready_read_slot(weak.clone()),
        );

        object::connect(
            device.object(),
            &device_signals::CONNECTED,
            &object,
            TAG_ON_CONNECTED,
            0,
            ConnectionType::DIRECT,
            connected_slot(weak.clone()),
        );

        object::connect(
            device.object(),
            &device_signals::BYTES_WRITTEN,
            &object,
            TAG_ON_READY_WRITE,
            1,
            ConnectionType::DIRECT.unique(),
            ready_write_slot(weak),
        );

        Arc::new(Protocol { object, inner })
    }

    #[inline]
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.inner.device
    }

    /// Next monotonic sequence number, starting at 1.
    pub fn next_sequence(&self) -> u32 {
        let mut state = self.inner.state.lock().expect("protocol state poisoned");
        let sequence = state.sequence;
        state.sequence += 1;
        sequence
    }

    /// Queue a message. Request-typed messages return a pending operation
    /// completed by the matching reply; replies and events complete their
    /// handle as soon as they are queued.
    pub fn send_message(&self, msg: Message) -> OperationRef {
        self.inner.send_message(msg)
    }

    /// Send bulk data on `channel`, exporting pool-backed payloads through
    /// shared memory when negotiated.
    pub fn send_binary_data(&self, channel: u32, payload: BinaryPayload) -> OperationRef {
        let sequence = self.next_sequence();
        let mut msg = Message::with_channel(MessageType::BinaryData, channel, sequence);

        let export = self
            .inner
            .state
            .lock()
            .expect("protocol state poisoned")
            .mem_export
            .clone();

        let mut exported = false;
        if let (Some(export), BinaryPayload::Block(block)) = (&export, &payload) {
            if let Some(shm_ref) = export.put(block) {
                let mut tags = TagWriter::new();
                shm_ref.write(&mut tags);
                msg.set_payload(tags.finish());
                msg.set_flags(FLAG_SHM_DATA);
                exported = true;

                logging::debug!(self.inner.log, "sending binary data via shm";
                                "channel" => channel,
                                "sequence" => sequence,
                                "block_id" => shm_ref.block_id,
                                "size" => shm_ref.size);
            }
        }

        if !exported {
            let bytes = match &payload {
                BinaryPayload::Inline(bytes) => bytes.as_slice(),
                BinaryPayload::Block(block) => block.as_slice(),
            };

            let mut tags = TagWriter::new();
            tags.put_bytes(bytes);
            msg.set_payload(tags.finish());

            logging::debug!(self.inner.log, "sending binary data inline";
                            "channel" => channel,
                            "sequence" => sequence,
                            "size" => bytes.len());
        }

        self.inner.send_message(msg)
    }

    /// Configure the local pool for exports, and accept same-segment
    /// imports.
    pub fn set_memory_pool(&self, pool: MemPool) {
        let mut state = self.inner.state.lock().expect("protocol state poisoned");

        let import = Arc::new(MemImport::new());
        import.attach_pool(pool.clone());

        state.mem_export = Some(Arc::new(MemExport::new(pool)));
        state.mem_import = Some(import);

        logging::info!(self.inner.log, "shared memory pool configured");
    }

    /// Accept imports from a peer-created segment.
    pub fn attach_import_pool(&self, pool: MemPool) {
        let mut state = self.inner.state.lock().expect("protocol state poisoned");
        match &state.mem_import {
            Some(import) => import.attach_pool(pool),
            None => {
                let import = Arc::new(MemImport::new());
                import.attach_pool(pool);
                state.mem_import = Some(import);
            }
        }
    }

    /// Allocate from the export pool, if one is configured.
    pub fn acquire_buffer(&self, size: usize) -> Option<MemBlock> {
        let export = self
            .inner
            .state
            .lock()
            .expect("protocol state poisoned")
            .mem_export
            .clone()?;
        export.pool().alloc(size)
    }

    /// Fail every in-flight operation, e.g. on disconnect.
    pub fn fail_all_operations(&self, error: IncError) {
        self.inner.fail_all_operations(error);
    }

    /// Time out operations whose deadline has passed.
    pub fn expire_operations(&self, now: Instant) {
        let expired: Vec<OperationRef> = {
            let mut state = self.inner.state.lock().expect("protocol state poisoned");
            let ids: Vec<u32> = state
                .operations
                .iter()
                .filter(|(_, op)| op.is_expired(now))
                .map(|(&id, _)| id)
                .collect();
            ids.iter()
                .filter_map(|id| state.operations.remove(id))
                .collect()
        };

        for op in expired {
            logging::warn!(self.inner.log, "operation timed out"; "sequence" => op.sequence());
            op.set_result(IncError::Timeout.code(), Vec::new());
        }
    }

    /// Seconds since the last byte arrived.
    pub fn idle_time(&self, now: Instant) -> Duration {
        let state = self.inner.state.lock().expect("protocol state poisoned");
        now.saturating_duration_since(state.last_ingress)
    }

    /// Flush queued data opportunistically.
    pub fn flush(&self) {
        self.inner.on_ready_write();
    }

    /// Tear down: fail operations, unhook from the device, close it.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("protocol state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.send_queue.clear();
            state.partial.clear();
            state.recv.clear();
        }

        self.fail_all_operations(IncError::NotConnected);
        object::disconnect(self.inner.device.object(), None, Some(&self.object), None);
        self.inner.device.close();
    }
}

fn ready_read_slot(weak: Weak<ProtocolInner>) -> axon::object::SlotFn {
    Arc::new(move |_, _| {
        if let Some(inner) = weak.upgrade() {
            inner.on_ready_read();
        }
    })
}

fn connected_slot(weak: Weak<ProtocolInner>) -> axon::object::SlotFn {
    Arc::new(move |_, _| {
        if let Some(inner) = weak.upgrade() {
            inner.on_device_connected();
        }
    })
}

fn ready_write_slot(weak: Weak<ProtocolInner>) -> axon::object::SlotFn {
    Arc::new(move |_, _| {
        if let Some(inner) = weak.upgrade() {
            inner.on_ready_write();
        }
    })
}

impl ProtocolInner {
    fn send_message(&self, msg: Message) -> OperationRef {
        let tracked = is_tracked_request(msg.message_type);
        let op = Operation::new(msg.sequence, Some(&self.log));

        let refused = {
            let mut state = self.state.lock().expect("protocol state poisoned");
            if state.closed {
                Some(IncError::NotConnected)
            } else if state.send_queue.len() >= MAX_SEND_QUEUE {
                Some(IncError::QueueFull)
            } else {
                if tracked {
                    state.operations.insert(msg.sequence, op.clone());
                }
                state.send_queue.push_back(msg);
                None
            }
        };

        if let Some(error) = refused {
            logging::warn!(self.log, "send refused"; "error" => %error);
            op.set_result(error.code(), Vec::new());
            return op;
        }

        op.set_running();
        self.on_ready_write();

        // Fire-and-forget sends complete once queued.
        if !tracked {
            op.set_result(OK, Vec::new());
        }

        op
    }

    fn on_device_connected(&self) {
        logging::debug!(self.log, "transport connected, flushing queue");
        self.device.config_event_ability(true, true);
        self.on_ready_write();
    }

    /// Send path state machine: resume partial writes first, then drain the
    /// queue message by message, stashing the unwritten tail on
    /// would-block. Write monitoring is dropped once the queue is empty.
    fn on_ready_write(&self) {
        if !self.device.is_writable() {
            return;
        }

        let mut failed = false;
        {
            let mut state = self.state.lock().expect("protocol state poisoned");
            if state.closed {
                return;
            }

            loop {
                if !state.partial.is_empty() {
                    let offset = state.partial_offset;
                    let written = match self.device.write(&state.partial[offset..]) {
                        Ok(count) => count,
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    };

                    state.partial_offset += written;
                    if state.partial_offset < state.partial.len() {
                        self.device.config_event_ability(true, true);
                        break;
                    }

                    state.partial.clear();
                    state.partial_offset = 0;
                    state.send_queue.pop_front();
                    continue;
                }

                let msg = match state.send_queue.front() {
                    Some(msg) => msg,
                    None => {
                        self.device.config_event_ability(true, false);
                        break;
                    }
                };

                let header = msg.header_bytes();
                let payload = msg.payload.clone();

                if let Some(fd) = msg.ext_fd {
                    if self.device.supports_fd_passing() {
                        self.device.set_out_fd(fd);
                    }
                }

                let written = match self.device.write(&header) {
                    Ok(count) => count,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                };

                if written < header.len() {
                    let mut rest = header[written..].to_vec();
                    rest.extend_from_slice(&payload);
                    state.partial = rest;
                    state.partial_offset = 0;
                    self.device.config_event_ability(true, true);
                    break;
                }

                if !payload.is_empty() {
                    let written = match self.device.write(&payload) {
                        Ok(count) => count,
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    };

                    if written < payload.len() {
                        state.partial = payload[written..].to_vec();
                        state.partial_offset = 0;
                        self.device.config_event_ability(true, true);
                        break;
                    }
                }

                state.send_queue.pop_front();
            }

            if failed {
                state.partial.clear();
                state.partial_offset = 0;
            }
        }

        if failed {
            logging::error!(self.log, "transport write failed");
            object::emit(
                &self.object,
                &signals::ERROR_OCCURRED,
                &[Variant::from(IncError::WriteFailed.code())],
            );
        }
    }

    /// Receive path: drain the device into the assembly buffer, then peel
    /// off every complete message. Framing violations clear the buffer and
    /// surface as protocol errors.
    fn on_ready_read(&self) {
        let mut error: Option<IncError> = None;
        let mut messages: Vec<Message> = Vec::new();

        {
            let mut state = self.state.lock().expect("protocol state poisoned");
            if state.closed {
                return;
            }

            loop {
                match self.device.read(64 * 1024) {
                    Ok(chunk) => {
                        if chunk.is_empty() {
                            break;
                        }
                        state.recv.extend(&chunk);
                        state.last_ingress = Instant::now();
                    }
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
            }

            while error.is_none() && state.recv.len() >= HEADER_SIZE {
                let header = match Header::parse(&state.recv.as_slice()[..HEADER_SIZE]) {
                    Ok(header) => header,
                    Err(err) => {
                        logging::error!(self.log, "malformed message header"; "error" => %err);
                        state.recv.clear();
                        error = Some(err);
                        break;
                    }
                };

                let total = HEADER_SIZE + header.length as usize;
                if state.recv.len() < total {
                    break;
                }

                let payload = state.recv.as_slice()[HEADER_SIZE..total].to_vec();
                state.recv.consume(total);
                messages.push(Message::from_parts(header, payload));
            }
        }

        for msg in messages {
            self.route_message(msg);
        }

        if let Some(error) = error {
            object::emit(
                &self.object,
                &signals::ERROR_OCCURRED,
                &[Variant::from(error.code())],
            );
        }
    }

    fn route_message(&self, msg: Message) {
        let sequence = msg.sequence;

        let mut completion: Option<(OperationRef, i32, Vec<u8>)> = None;
        if msg.message_type.is_reply() && sequence > 0 {
            let op = self
                .state
                .lock()
                .expect("protocol state poisoned")
                .operations
                .remove(&sequence);

            if let Some(op) = op {
                let (error_code, result) = reply_outcome(&msg);
                completion = Some((op, error_code, result));
            }
        }

        // Channel acks carry negotiation state the endpoint must apply
        // before the caller observes completion, so they are delivered
        // first; plain acks complete their operation and stop here.
        let forward = match (&completion, msg.message_type) {
            (Some(_), MessageType::StreamOpenAck) | (Some(_), MessageType::StreamCloseAck) => true,
            (Some(_), _) => false,
            (None, _) => true,
        };

        if forward {
            if msg.message_type == MessageType::BinaryData {
                self.process_binary_data(msg);
            } else {
                object::emit(
                    &self.object,
                    &signals::MESSAGE_RECEIVED,
                    &[Variant::new(msg)],
                );
            }
        }

        if let Some((op, error_code, result)) = completion {
            op.set_result(error_code, result);
        }
    }

    fn process_binary_data(&self, msg: Message) {
        let channel = msg.channel;
        let sequence = msg.sequence;

        let chunk = if msg.flags & FLAG_SHM_DATA != 0 {
            let import = self
                .state
                .lock()
                .expect("protocol state poisoned")
                .mem_import
                .clone();

            let import = match import {
                Some(import) => import,
                None => {
                    logging::error!(self.log, "shm reference received but import not configured");
                    return;
                }
            };

            let mut tags = TagReader::new(&msg.payload);
            let shm_ref = match ShmRef::read(&mut tags) {
                Ok(shm_ref) => shm_ref,
                Err(_) => {
                    logging::error!(self.log, "invalid shm reference payload");
                    return;
                }
            };

            match import.get(&shm_ref) {
                Some(block) => {
                    logging::debug!(self.log, "received binary data via shm";
                                    "channel" => channel,
                                    "block_id" => shm_ref.block_id,
                                    "size" => shm_ref.size);
                    BinaryChunk::Mapped(block)
                }
                None => {
                    logging::error!(self.log, "failed to import memory block";
                                    "block_id" => shm_ref.block_id,
                                    "shm_id" => shm_ref.shm_id);
                    return;
                }
            }
        } else {
            let mut tags = TagReader::new(&msg.payload);
            match tags.get_bytes() {
                Ok(bytes) => {
                    logging::debug!(self.log, "received binary data inline";
                                    "channel" => channel,
                                    "size" => bytes.len());
                    BinaryChunk::Inline(bytes)
                }
                Err(_) => {
                    logging::error!(self.log, "failed to read binary payload");
                    return;
                }
            }
        };

        object::emit(
            &self.object,
            &signals::BINARY_DATA_RECEIVED,
            &[
                Variant::from(channel),
                Variant::from(sequence),
                Variant::new(chunk),
            ],
        );
    }

    fn fail_all_operations(&self, error: IncError) {
        let pending: Vec<OperationRef> = {
            let mut state = self.state.lock().expect("protocol state poisoned");
            state.operations.drain().map(|(_, op)| op).collect()
        };

        for op in pending {
            op.set_result(error.code(), Vec::new());
        }
    }
}

fn reply_outcome(msg: &Message) -> (i32, Vec<u8>) {
    match msg.message_type {
        MessageType::MethodReply => {
            let mut tags = TagReader::new(&msg.payload);
            let error_code = tags.get_i32().unwrap_or(OK);
            let result = tags.get_bytes().unwrap_or_default();
            (error_code, result)
        }
        MessageType::SubscribeAck | MessageType::UnsubscribeAck => {
            let mut tags = TagReader::new(&msg.payload);
            (tags.get_i32().unwrap_or(OK), Vec::new())
        }
        MessageType::Pong => (OK, Vec::new()),
        // Channel acks hand their whole payload to the caller to parse.
        _ => (OK, msg.payload.clone()),
    }
}
