//! Base object: identity, parent/child ownership, thread affinity, the
//! signal/slot graph and property reflection.
//!
//! Objects are handled through `Arc`s. The signal graph on each object is
//! guarded by a per-object mutex; paths touching two objects take both
//! mutexes in ascending address order. Emission snapshots the outgoing list
//! so connects made during an emit are skipped for that cycle, and
//! disconnects only mark records orphaned while the list is in use.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use hashbrown::HashMap;

use crate::dispatcher;
use crate::event::{Event, MetaCall, NORMAL_PRIORITY};
use crate::logging::{self, Logger};
use crate::meta::MetaObject;
use crate::thread::{Semaphore, ThreadData};
use crate::timer::{self, TimerId, TimerSpec, TimerType};
use crate::variant::Variant;

pub type ObjectRef = Arc<Object>;

/// Slot invocation: receives the receiver object and the signal arguments.
pub type SlotFn = Arc<dyn Fn(&ObjectRef, &[Variant]) + Send + Sync>;

/// Handler for events addressed to the object (timers, quit, child
/// bookkeeping). Returns whether the event was consumed.
pub type EventHandler = Arc<dyn Fn(&ObjectRef, &Event) -> bool + Send + Sync>;

/// A signal identity: per-class index, display name and argument count.
#[derive(Debug, Copy, Clone)]
pub struct Signal {
    pub index: u16,
    pub name: &'static str,
    pub arity: u8,
}

impl Signal {
    #[inline]
    pub const fn new(index: u16, name: &'static str, arity: u8) -> Signal {
        Signal { index, name, arity }
    }
}

/// Emitted as the last act of object destruction.
pub const DESTROYED: Signal = Signal::new(0, "destroyed", 0);
/// Emitted by `set_property` with `(name, value)`.
pub const PROPERTY_CHANGED: Signal = Signal::new(1, "property_changed", 2);

/// First signal index available to components; lower values are reserved
/// for the built-ins above.
pub const USER_SIGNAL_BASE: u16 = 8;

/// Stable identity for a slot binding site, enabling disconnect-by-slot and
/// unique connections. Closures are not comparable, so the identity is
/// explicit; `ANONYMOUS` slots can only be disconnected via their handle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlotTag(pub u32);

impl SlotTag {
    pub const ANONYMOUS: SlotTag = SlotTag(0);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryKind {
    /// Direct when sender and receiver share a thread at emit time,
    /// queued otherwise.
    Auto,
    /// Run synchronously on the emitting thread.
    Direct,
    /// Posted to the receiver's thread with cloned arguments.
    Queued,
    /// Queued, with the emitter blocking until the slot has run.
    BlockingQueued,
}

/// Delivery kind plus the unique flag.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionType {
    pub kind: DeliveryKind,
    pub unique: bool,
}

impl ConnectionType {
    pub const AUTO: ConnectionType = ConnectionType {
        kind: DeliveryKind::Auto,
        unique: false,
    };
    pub const DIRECT: ConnectionType = ConnectionType {
        kind: DeliveryKind::Direct,
        unique: false,
    };
    pub const QUEUED: ConnectionType = ConnectionType {
        kind: DeliveryKind::Queued,
        unique: false,
    };
    pub const BLOCKING_QUEUED: ConnectionType = ConnectionType {
        kind: DeliveryKind::BlockingQueued,
        unique: false,
    };

    #[inline]
    pub const fn unique(self) -> ConnectionType {
        ConnectionType {
            kind: self.kind,
            unique: true,
        }
    }
}

/// A live sender→receiver connection. Reference-counted; the orphan flag
/// marks it for reclamation once the containing list is quiescent.
pub struct ConnectionRecord {
    pub(crate) sender: Weak<Object>,
    pub(crate) signal: u16,
    pub(crate) receiver: Weak<Object>,
    pub(crate) slot: SlotFn,
    pub(crate) tag: SlotTag,
    pub(crate) kind: DeliveryKind,
    pub(crate) orphaned: AtomicBool,
}

impl ConnectionRecord {
    #[inline]
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }
}

/// Handle returned by `connect`, usable to sever exactly this connection.
pub struct Connection {
    record: Arc<ConnectionRecord>,
}

impl Connection {
    pub fn disconnect(&self) {
        self.record.orphaned.store(true, Ordering::Release);

        if let Some(sender) = self.record.sender.upgrade() {
            let mut graph = sender.graph.lock().expect("signal graph poisoned");
            if let Some(list) = graph.outgoing.get_mut(&self.record.signal) {
                list.dirty = true;
                list.compact_if_idle();
            }
        }
    }
}

struct ConnectionList {
    records: Vec<Arc<ConnectionRecord>>,
    in_use: u32,
    dirty: bool,
}

impl ConnectionList {
    fn new() -> ConnectionList {
        ConnectionList {
            records: Vec::new(),
            in_use: 0,
            dirty: false,
        }
    }

    fn compact_if_idle(&mut self) {
        if self.in_use == 0 && self.dirty {
            self.records.retain(|record| !record.is_orphaned());
            self.dirty = false;
        }
    }
}

struct SignalGraph {
    outgoing: HashMap<u16, ConnectionList>,
    senders: Vec<Weak<ConnectionRecord>>,
}

impl SignalGraph {
    fn new() -> SignalGraph {
        SignalGraph {
            outgoing: HashMap::new(),
            senders: Vec::new(),
        }
    }
}

struct TimerBinding {
    id: TimerId,
    spec: TimerSpec,
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Base entity of the kernel.
pub struct Object {
    id: u64,
    meta: &'static MetaObject,
    name: Mutex<String>,
    thread: Mutex<Arc<ThreadData>>,
    parent: Mutex<Option<Weak<Object>>>,
    children: Mutex<Vec<ObjectRef>>,
    graph: Mutex<SignalGraph>,
    timers: Mutex<Vec<TimerBinding>>,
    properties: Mutex<HashMap<String, Variant>>,
    handler: Mutex<Option<EventHandler>>,
    destroyed: AtomicBool,
    log: Logger,
}

impl Object {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        meta: &'static MetaObject,
        name: &str,
        log: L,
    ) -> ObjectRef {
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        let log = logging::child(
            log,
            logging::o!("object" => name.to_string(), "object_id" => id),
        );

        Arc::new(Object {
            id,
            meta,
            name: Mutex::new(name.to_string()),
            thread: Mutex::new(ThreadData::current()),
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            graph: Mutex::new(SignalGraph::new()),
            timers: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            log,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn meta(&self) -> &'static MetaObject {
        self.meta
    }

    /// Walk the metaobject chain: "is this object a `class_name`?"
    #[inline]
    pub fn inherits(&self, class_name: &str) -> bool {
        self.meta.inherits(class_name)
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("object name poisoned").clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().expect("object name poisoned") = name.to_string();
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// The thread owning this object's state.
    pub fn thread(&self) -> Arc<ThreadData> {
        self.thread.lock().expect("object thread poisoned").clone()
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn parent(&self) -> Option<ObjectRef> {
        self.parent
            .lock()
            .expect("object parent poisoned")
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    pub fn children(&self) -> Vec<ObjectRef> {
        self.children.lock().expect("object children poisoned").clone()
    }

    pub fn set_handler(&self, handler: EventHandler) {
        *self.handler.lock().expect("object handler poisoned") = Some(handler);
    }

    pub fn property(&self, name: &str) -> Option<Variant> {
        self.properties
            .lock()
            .expect("object properties poisoned")
            .get(name)
            .cloned()
    }
}

/// Lock one or two signal graphs in ascending address order, returning the
/// guards in (first, second) argument order.
fn lock_pair<'a>(
    a: &'a Object,
    b: &'a Object,
) -> (MutexGuard<'a, SignalGraph>, Option<MutexGuard<'a, SignalGraph>>) {
    let pa = a as *const Object as usize;
    let pb = b as *const Object as usize;

    if pa == pb {
        (a.graph.lock().expect("signal graph poisoned"), None)
    } else if pa < pb {
        let ga = a.graph.lock().expect("signal graph poisoned");
        let gb = b.graph.lock().expect("signal graph poisoned");
        (ga, Some(gb))
    } else {
        let gb = b.graph.lock().expect("signal graph poisoned");
        let ga = a.graph.lock().expect("signal graph poisoned");
        (ga, Some(gb))
    }
}

/// Register a connection. Fails (returning `None`, with a logged warning)
/// when either end is destroyed, the slot accepts more arguments than the
/// signal emits, or `unique` is requested and an equivalent record exists.
pub fn connect(
    sender: &ObjectRef,
    signal: &Signal,
    receiver: &ObjectRef,
    tag: SlotTag,
    arity: u8,
    ctype: ConnectionType,
    slot: SlotFn,
) -> Option<Connection> {
    if sender.is_destroyed() || receiver.is_destroyed() {
        logging::warn!(sender.log, "connect on destroyed object"; "signal" => signal.name);
        return None;
    }

    if arity > signal.arity {
        logging::warn!(sender.log, "slot arity exceeds signal arity";
                       "signal" => signal.name,
                       "signal_arity" => signal.arity,
                       "slot_arity" => arity);
        return None;
    }

    let record = {
        let (mut sender_graph, receiver_graph) = lock_pair(sender, receiver);

        if ctype.unique && tag != SlotTag::ANONYMOUS {
            if let Some(list) = sender_graph.outgoing.get(&signal.index) {
                let duplicate = list.records.iter().any(|record| {
                    !record.is_orphaned()
                        && record.tag == tag
                        && record.receiver.ptr_eq(&Arc::downgrade(receiver))
                });
                if duplicate {
                    return None;
                }
            }
        }

        let record = Arc::new(ConnectionRecord {
            sender: Arc::downgrade(sender),
            signal: signal.index,
            receiver: Arc::downgrade(receiver),
            slot,
            tag,
            kind: ctype.kind,
            orphaned: AtomicBool::new(false),
        });

        sender_graph
            .outgoing
            .entry(signal.index)
            .or_insert_with(ConnectionList::new)
            .records
            .push(record.clone());

        match receiver_graph {
            Some(mut graph) => graph.senders.push(Arc::downgrade(&record)),
            None => sender_graph.senders.push(Arc::downgrade(&record)),
        }

        record
    };

    Some(Connection { record })
}

/// Remove matching connections; any of signal/receiver/tag may be wildcard.
/// Returns whether at least one record was removed.
pub fn disconnect(
    sender: &ObjectRef,
    signal: Option<&Signal>,
    receiver: Option<&ObjectRef>,
    tag: Option<SlotTag>,
) -> bool {
    let wanted_receiver = receiver.map(Arc::downgrade);
    let mut removed = false;

    let mut graph = sender.graph.lock().expect("signal graph poisoned");
    for (&index, list) in graph.outgoing.iter_mut() {
        if let Some(signal) = signal {
            if index != signal.index {
                continue;
            }
        }

        for record in list.records.iter() {
            if record.is_orphaned() {
                continue;
            }

            if let Some(wanted) = &wanted_receiver {
                if !record.receiver.ptr_eq(wanted) {
                    continue;
                }
            }

            if let Some(tag) = tag {
                if record.tag != tag {
                    continue;
                }
            }

            record.orphaned.store(true, Ordering::Release);
            list.dirty = true;
            removed = true;
        }

        list.compact_if_idle();
    }

    removed
}

/// Deliver `signal` to every live connection in insertion order.
///
/// Connections appended during this emission are skipped for this cycle;
/// records disconnected mid-emission are skipped by their orphan flag.
pub fn emit(sender: &ObjectRef, signal: &Signal, args: &[Variant]) {
    let snapshot = {
        let mut graph = sender.graph.lock().expect("signal graph poisoned");
        match graph.outgoing.get_mut(&signal.index) {
            Some(list) => {
                list.in_use += 1;
                list.records.clone()
            }
            None => return,
        }
    };

    for record in &snapshot {
        deliver(record, args);
    }

    let mut graph = sender.graph.lock().expect("signal graph poisoned");
    if let Some(list) = graph.outgoing.get_mut(&signal.index) {
        list.in_use -= 1;
        list.compact_if_idle();
    }
}

fn deliver(record: &Arc<ConnectionRecord>, args: &[Variant]) {
    if record.is_orphaned() {
        return;
    }

    let receiver = match record.receiver.upgrade() {
        Some(receiver) => receiver,
        None => return,
    };
    if receiver.is_destroyed() {
        return;
    }

    let receiver_thread = receiver.thread();
    let same_thread = receiver_thread.is_current();

    let kind = match record.kind {
        DeliveryKind::Auto => {
            if same_thread {
                DeliveryKind::Direct
            } else {
                DeliveryKind::Queued
            }
        }
        kind => kind,
    };

    match kind {
        DeliveryKind::Direct => {
            (record.slot)(&receiver, args);
        }
        DeliveryKind::Queued => {
            receiver_thread.post_event(
                &receiver,
                Event::MetaCall(MetaCall {
                    record: record.clone(),
                    args: args.to_vec(),
                    done: None,
                }),
                NORMAL_PRIORITY,
            );
        }
        DeliveryKind::BlockingQueued => {
            if same_thread {
                logging::warn!(receiver.log,
                               "blocking-queued delivery on the receiver's own thread refused");
                return;
            }

            let done = Arc::new(Semaphore::new());
            receiver_thread.post_event(
                &receiver,
                Event::MetaCall(MetaCall {
                    record: record.clone(),
                    args: args.to_vec(),
                    done: Some(done.clone()),
                }),
                NORMAL_PRIORITY,
            );
            done.acquire();
        }
        DeliveryKind::Auto => unreachable!("auto resolved above"),
    }
}

/// One-shot delivery to `receiver` without a standing connection.
pub fn invoke_method(receiver: &ObjectRef, ctype: ConnectionType, args: Vec<Variant>, slot: SlotFn) {
    let record = Arc::new(ConnectionRecord {
        sender: Arc::downgrade(receiver),
        signal: u16::max_value(),
        receiver: Arc::downgrade(receiver),
        slot,
        tag: SlotTag::ANONYMOUS,
        kind: ctype.kind,
        orphaned: AtomicBool::new(false),
    });

    deliver(&record, &args);
}

/// Deliver an event arriving from the posted queue (or a timer fire) on the
/// receiver's own thread.
pub(crate) fn deliver_posted(receiver: &ObjectRef, event: Event) {
    match event {
        Event::MetaCall(call) => {
            if !call.record.is_orphaned() && !receiver.is_destroyed() {
                (call.record.slot)(receiver, &call.args);
            }
            // The blocked emitter is released even when delivery was
            // suppressed, or it would hang forever.
            if let Some(done) = call.done {
                done.release();
            }
        }
        Event::DeferredDelete { .. } => {
            finalize_delete(receiver);
        }
        Event::ThreadChange => {
            // Re-arm this object's timers on the dispatcher of the thread
            // it now lives on.
            let dispatcher = dispatcher::ensure_current();
            let timers = receiver.timers.lock().expect("object timers poisoned");
            for binding in timers.iter() {
                dispatcher.register_timer_id(
                    binding.id,
                    binding.spec.interval,
                    binding.spec.kind,
                    receiver,
                    binding.spec.info.clone(),
                );
            }
        }
        other => {
            let handler = receiver
                .handler
                .lock()
                .expect("object handler poisoned")
                .clone();
            if let Some(handler) = handler {
                handler(receiver, &other);
            }
        }
    }
}

/// Make `child` a child of `parent`. Both must live on the same thread;
/// affinity moves require an unparented object.
pub fn set_parent(child: &ObjectRef, parent: Option<&ObjectRef>) -> bool {
    // Detach from the previous parent first.
    if let Some(old) = child.parent() {
        let mut children = old.children.lock().expect("object children poisoned");
        children.retain(|existing| !Arc::ptr_eq(existing, child));
        drop(children);
        deliver_posted(&old, Event::ChildRemoved(child.clone()));
    }

    match parent {
        Some(parent) => {
            if !Arc::ptr_eq(&parent.thread(), &child.thread()) {
                logging::warn!(child.log, "parent and child affinity differ; not reparenting");
                *child.parent.lock().expect("object parent poisoned") = None;
                return false;
            }

            *child.parent.lock().expect("object parent poisoned") = Some(Arc::downgrade(parent));
            parent
                .children
                .lock()
                .expect("object children poisoned")
                .push(child.clone());
            deliver_posted(parent, Event::ChildAdded(child.clone()));
            true
        }
        None => {
            *child.parent.lock().expect("object parent poisoned") = None;
            true
        }
    }
}

/// Start a timer owned by `object` on its affinity thread's dispatcher.
pub fn start_timer(
    object: &ObjectRef,
    interval: Duration,
    kind: TimerType,
    info: Variant,
) -> TimerId {
    debug_assert!(object.thread().is_current(), "timer started off-thread");

    let dispatcher = dispatcher::ensure_current();
    let id = dispatcher.register_timer(interval, kind, object, info.clone());

    object
        .timers
        .lock()
        .expect("object timers poisoned")
        .push(TimerBinding {
            id,
            spec: TimerSpec {
                interval,
                kind,
                info,
            },
        });

    id
}

pub fn kill_timer(object: &ObjectRef, id: TimerId) {
    let mut timers = object.timers.lock().expect("object timers poisoned");
    let before = timers.len();
    timers.retain(|binding| binding.id != id);

    if before != timers.len() {
        drop(timers);
        dispatcher::ensure_current().unregister_timer(id);
        timer::release_timer_id(id);
    }
}

/// Relocate `object` (and its subtree) to `target`'s thread: pending posted
/// events move queues, timers re-register on the target dispatcher, and all
/// subsequent queued deliveries schedule there.
pub fn move_to_thread(object: &ObjectRef, target: &Arc<ThreadData>) -> bool {
    if object.parent().is_some() {
        logging::warn!(object.log, "cannot move a parented object between threads");
        return false;
    }

    let from = object.thread();
    if !from.is_current() {
        logging::warn!(object.log, "move_to_thread called off the owning thread");
        return false;
    }

    move_subtree(object, &from, target);
    true
}

fn move_subtree(object: &ObjectRef, from: &Arc<ThreadData>, target: &Arc<ThreadData>) {
    // Pull timers off the old dispatcher while still on its thread; the
    // ThreadChange event re-arms them from the stored bindings.
    if let Some(dispatcher) = dispatcher::current() {
        dispatcher.unregister_object_timers(object);
    }

    *object.thread.lock().expect("object thread poisoned") = target.clone();
    from.transfer_posted(object, target);
    target.post_event(object, Event::ThreadChange, NORMAL_PRIORITY);

    for child in object.children() {
        move_subtree(&child, from, target);
    }
}

/// Post a deferred delete honouring the current loop level. The recorded
/// level includes the scope depth so a delete scheduled from inside a slot
/// outlives the dispatch that scheduled it.
pub fn delete_later(object: &ObjectRef) {
    let thread = object.thread();
    let event = Event::DeferredDelete {
        loop_level: thread.loop_level() + thread.scope_level(),
        scope_level: thread.scope_level(),
    };
    thread.post_event(object, event, NORMAL_PRIORITY);
}

/// Tear the object down: children first, then the `destroyed` signal, then
/// unlinking from every sender and receiver, timers and posted events.
pub fn finalize_delete(object: &ObjectRef) {
    if object.destroyed.swap(true, Ordering::AcqRel) {
        return;
    }

    logging::trace!(object.log, "destroying object");

    let children = {
        let mut children = object.children.lock().expect("object children poisoned");
        std::mem::replace(&mut *children, Vec::new())
    };
    for child in children {
        finalize_delete(&child);
    }

    emit(object, &DESTROYED, &[]);

    // Unlink: orphan outgoing records and records pointing at us. Senders'
    // lists are compacted lazily on their next emit.
    let incoming = {
        let mut graph = object.graph.lock().expect("signal graph poisoned");
        for (_, list) in graph.outgoing.iter_mut() {
            for record in list.records.iter() {
                record.orphaned.store(true, Ordering::Release);
            }
            list.records.clear();
            list.dirty = false;
        }

        std::mem::replace(&mut graph.senders, Vec::new())
    };
    for weak in incoming {
        if let Some(record) = weak.upgrade() {
            record.orphaned.store(true, Ordering::Release);
        }
    }

    // Timers and posted events only exist on the affinity thread.
    let thread = object.thread();
    if thread.is_current() {
        if let Some(dispatcher) = dispatcher::current() {
            let removed = dispatcher.unregister_object_timers(object);
            for (id, _) in removed {
                timer::release_timer_id(id);
            }
        }
        object.timers.lock().expect("object timers poisoned").clear();
    }
    thread.remove_posted_for(object);

    if let Some(parent) = object.parent() {
        let mut children = parent.children.lock().expect("object children poisoned");
        children.retain(|existing| !Arc::ptr_eq(existing, object));
    }
}

/// Store a property and notify observers through `PROPERTY_CHANGED`.
pub fn set_property(object: &ObjectRef, name: &str, value: Variant) {
    object
        .properties
        .lock()
        .expect("object properties poisoned")
        .insert(name.to_string(), value.clone());

    emit(object, &PROPERTY_CHANGED, &[Variant::from(name), value]);
}

/// Observe changes to one named property. The slot receives `(name, value)`.
pub fn observe_property(
    object: &ObjectRef,
    name: &str,
    receiver: &ObjectRef,
    tag: SlotTag,
    slot: SlotFn,
) -> Option<Connection> {
    let wanted = name.to_string();
    let filter: SlotFn = Arc::new(move |receiver, args| {
        let changed = args
            .get(0)
            .and_then(|arg| arg.value::<String>())
            .map(|name| *name == wanted)
            .unwrap_or(false);
        if changed {
            slot(receiver, args);
        }
    });

    connect(
        object,
        &PROPERTY_CHANGED,
        receiver,
        tag,
        PROPERTY_CHANGED.arity,
        ConnectionType::AUTO,
        filter,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::OBJECT_META;
    use std::sync::atomic::AtomicUsize;

    const TEST_SIGNAL: Signal = Signal::new(USER_SIGNAL_BASE, "fired", 1);

    fn object(name: &str) -> ObjectRef {
        Object::new(&OBJECT_META, name, None)
    }

    fn counting_slot(hits: &Arc<AtomicUsize>) -> SlotFn {
        let hits = hits.clone();
        Arc::new(move |_receiver, _args| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_direct_emit_delivers_in_connection_order() {
        let sender = object("sender");
        let receiver = object("receiver");
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 1..=3u32 {
            let order = order.clone();
            connect(
                &sender,
                &TEST_SIGNAL,
                &receiver,
                SlotTag(tag),
                1,
                ConnectionType::DIRECT,
                Arc::new(move |_, _| order.lock().unwrap().push(tag)),
            )
            .unwrap();
        }

        emit(&sender, &TEST_SIGNAL, &[Variant::from(1u32)]);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_slot_receives_arguments() {
        let sender = object("sender");
        let receiver = object("receiver");
        let seen = Arc::new(Mutex::new(None));

        let seen_in = seen.clone();
        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag::ANONYMOUS,
            1,
            ConnectionType::DIRECT,
            Arc::new(move |_, args| {
                *seen_in.lock().unwrap() = args[0].get::<u32>();
            }),
        )
        .unwrap();

        emit(&sender, &TEST_SIGNAL, &[Variant::from(99u32)]);
        assert_eq!(*seen.lock().unwrap(), Some(99));
    }

    #[test]
    fn test_connect_rejects_excess_arity() {
        let sender = object("sender");
        let receiver = object("receiver");

        let conn = connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag::ANONYMOUS,
            2,
            ConnectionType::DIRECT,
            Arc::new(|_, _| {}),
        );
        assert!(conn.is_none());
    }

    #[test]
    fn test_unique_rejects_duplicate() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(7),
            1,
            ConnectionType::DIRECT.unique(),
            counting_slot(&hits),
        )
        .is_some());

        assert!(connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(7),
            1,
            ConnectionType::DIRECT.unique(),
            counting_slot(&hits),
        )
        .is_none());

        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_by_tag() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(1),
            1,
            ConnectionType::DIRECT,
            counting_slot(&hits),
        )
        .unwrap();
        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(2),
            1,
            ConnectionType::DIRECT,
            counting_slot(&hits),
        )
        .unwrap();

        assert!(disconnect(&sender, Some(&TEST_SIGNAL), Some(&receiver), Some(SlotTag(1))));
        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_wildcard_removes_all() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        for tag in 1..=3u32 {
            connect(
                &sender,
                &TEST_SIGNAL,
                &receiver,
                SlotTag(tag),
                1,
                ConnectionType::DIRECT,
                counting_slot(&hits),
            )
            .unwrap();
        }

        assert!(disconnect(&sender, None, None, None));
        assert!(!disconnect(&sender, None, None, None));

        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_during_emit_skips_remaining_delivery() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        // First slot disconnects the second mid-emission.
        let sender_in = sender.clone();
        let receiver_in = receiver.clone();
        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(1),
            1,
            ConnectionType::DIRECT,
            Arc::new(move |_, _| {
                disconnect(&sender_in, Some(&TEST_SIGNAL), Some(&receiver_in), Some(SlotTag(2)));
            }),
        )
        .unwrap();
        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(2),
            1,
            ConnectionType::DIRECT,
            counting_slot(&hits),
        )
        .unwrap();

        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_during_emit_skips_current_cycle() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        let sender_in = sender.clone();
        let receiver_in = receiver.clone();
        let hits_in = hits.clone();
        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag(1),
            1,
            ConnectionType::DIRECT,
            Arc::new(move |_, _| {
                let hits = hits_in.clone();
                connect(
                    &sender_in,
                    &TEST_SIGNAL,
                    &receiver_in,
                    SlotTag::ANONYMOUS,
                    1,
                    ConnectionType::DIRECT,
                    Arc::new(move |_, _| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        )
        .unwrap();

        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "new slot must not run this cycle");

        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "visible from the next cycle");
    }

    #[test]
    fn test_connection_handle_disconnect() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        let conn = connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag::ANONYMOUS,
            1,
            ConnectionType::DIRECT,
            counting_slot(&hits),
        )
        .unwrap();

        conn.disconnect();
        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroyed_receiver_not_invoked() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag::ANONYMOUS,
            1,
            ConnectionType::DIRECT,
            counting_slot(&hits),
        )
        .unwrap();

        finalize_delete(&receiver);
        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroy_emits_destroyed_and_tears_down_children() {
        let parent = object("parent");
        let child = object("child");
        let observer = object("observer");
        let destroyed = Arc::new(AtomicUsize::new(0));

        set_parent(&child, Some(&parent));

        connect(
            &child,
            &DESTROYED,
            &observer,
            SlotTag::ANONYMOUS,
            0,
            ConnectionType::DIRECT,
            counting_slot(&destroyed),
        )
        .unwrap();

        finalize_delete(&parent);

        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(child.is_destroyed());
        assert!(parent.is_destroyed());
    }

    #[test]
    fn test_set_parent_links_both_sides() {
        let parent = object("parent");
        let child = object("child");

        assert!(set_parent(&child, Some(&parent)));
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
        assert_eq!(parent.children().len(), 1);

        assert!(set_parent(&child, None));
        assert!(child.parent().is_none());
        assert_eq!(parent.children().len(), 0);
    }

    #[test]
    fn test_property_roundtrip_and_observer() {
        let holder = object("holder");
        let observer = object("observer");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in = seen.clone();
        observe_property(
            &holder,
            "volume",
            &observer,
            SlotTag::ANONYMOUS,
            Arc::new(move |_, args| {
                seen_in.lock().unwrap().push(args[1].get::<u32>().unwrap());
            }),
        )
        .unwrap();

        set_property(&holder, "volume", Variant::from(5u32));
        set_property(&holder, "balance", Variant::from(1u32));
        set_property(&holder, "volume", Variant::from(7u32));

        assert_eq!(holder.property("volume").unwrap().get::<u32>(), Some(7));
        assert_eq!(*seen.lock().unwrap(), vec![5, 7]);
    }

    #[test]
    fn test_invoke_method_direct() {
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        invoke_method(
            &receiver,
            ConnectionType::DIRECT,
            vec![Variant::from(1u32)],
            counting_slot(&hits),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_queued_same_thread_refused() {
        let sender = object("sender");
        let receiver = object("receiver");
        let hits = Arc::new(AtomicUsize::new(0));

        connect(
            &sender,
            &TEST_SIGNAL,
            &receiver,
            SlotTag::ANONYMOUS,
            1,
            ConnectionType::BLOCKING_QUEUED,
            counting_slot(&hits),
        )
        .unwrap();

        // Would deadlock if delivered; the kernel refuses instead.
        emit(&sender, &TEST_SIGNAL, &[Variant::from(0u32)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
