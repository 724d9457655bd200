//! Per-thread kernel state and the kernel thread abstraction.
//!
//! Any thread touching the kernel has an associated `ThreadData`: the posted
//! event queue, loop/scope depth, quit and interruption flags, and the
//! cross-thread wakeup. The main (or any adopted) thread gets its data
//! lazily; threads spawned through [`Thread`] get theirs up front so they
//! can be targeted by `move_to_thread` before they start looping.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::event::{Event, EventType, PostedEvent};
use crate::event_loop::EventLoop;
use crate::logging::{self, Logger};
use crate::object::{self, ObjectRef};
use crate::wakeup::Wakeup;

/// Counting semaphore used by blocking-queued slot invocations.
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn release(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        *count += 1;
        self.cv.notify_one();
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        while *count == 0 {
            count = self.cv.wait(count).expect("semaphore poisoned");
        }
        *count -= 1;
    }
}

struct PostedQueue {
    // `None` marks an entry currently being delivered (or already taken) so
    // reentrant drains never redeliver it.
    events: Vec<Option<PostedEvent>>,
    serial: u64,
    recursion: u32,
}

impl PostedQueue {
    fn new() -> PostedQueue {
        PostedQueue {
            events: Vec::new(),
            serial: 0,
            recursion: 0,
        }
    }
}

/// Per-thread record shared across threads through an `Arc`.
pub struct ThreadData {
    name: String,
    wakeup: Arc<Wakeup>,
    posted: Mutex<PostedQueue>,
    quit_now: AtomicBool,
    interruption_requested: AtomicBool,
    can_wait: AtomicBool,
    loop_level: AtomicU32,
    scope_level: AtomicU32,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadData>>> = RefCell::new(None);
}

impl ThreadData {
    pub fn new(name: &str) -> io::Result<ThreadData> {
        Ok(ThreadData {
            name: name.to_string(),
            wakeup: Arc::new(Wakeup::new()?),
            posted: Mutex::new(PostedQueue::new()),
            quit_now: AtomicBool::new(false),
            interruption_requested: AtomicBool::new(false),
            can_wait: AtomicBool::new(true),
            loop_level: AtomicU32::new(0),
            scope_level: AtomicU32::new(0),
        })
    }

    /// The calling thread's data, created lazily for adopted threads.
    pub fn current() -> Arc<ThreadData> {
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            match &*slot {
                Some(data) => data.clone(),
                None => {
                    let name = std::thread::current()
                        .name()
                        .unwrap_or("adopted")
                        .to_string();
                    let data = Arc::new(
                        ThreadData::new(&name).expect("thread data construction failed"),
                    );
                    *slot = Some(data.clone());
                    data
                }
            }
        })
    }

    /// Install pre-built data for the calling thread. Used by [`Thread`].
    pub fn adopt(data: Arc<ThreadData>) {
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            if slot.is_some() {
                panic!("thread already has kernel data installed");
            }
            *slot = Some(data);
        });
    }

    /// Whether this is the calling thread's data.
    #[inline]
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| match &*current.borrow() {
            Some(data) => std::ptr::eq(Arc::as_ptr(data), self as *const ThreadData),
            None => false,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    #[inline]
    pub fn loop_level(&self) -> u32 {
        self.loop_level.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn scope_level(&self) -> u32 {
        self.scope_level.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_loop(&self) {
        self.loop_level.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_loop(&self) {
        self.loop_level.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_scope(&self) {
        self.scope_level.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_scope(&self) {
        self.scope_level.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn quit_requested(&self) -> bool {
        self.quit_now.load(Ordering::Acquire)
    }

    pub fn request_quit(&self) {
        self.quit_now.store(true, Ordering::Release);
        self.wakeup.signal();
    }

    pub(crate) fn clear_quit(&self) {
        self.quit_now.store(false, Ordering::Release);
    }

    #[inline]
    pub fn interruption_requested(&self) -> bool {
        self.interruption_requested.load(Ordering::Acquire)
    }

    pub fn request_interruption(&self) {
        self.interruption_requested.store(true, Ordering::Release);
        self.wakeup.signal();
    }

    #[inline]
    pub fn can_wait(&self) -> bool {
        self.can_wait.load(Ordering::Acquire)
    }

    pub fn set_can_wait(&self, can_wait: bool) {
        self.can_wait.store(can_wait, Ordering::Release);
    }

    /// Queue an event for `receiver`, waking this thread's dispatcher.
    /// Within one priority bucket, delivery is FIFO; higher priorities are
    /// delivered first.
    pub fn post_event(&self, receiver: &ObjectRef, event: Event, priority: i32) {
        {
            let mut queue = self.posted.lock().expect("posted queue poisoned");

            let at = queue
                .events
                .iter()
                .position(|slot| match slot {
                    Some(posted) => posted.priority < priority,
                    None => false,
                })
                .unwrap_or(queue.events.len());

            queue.serial += 1;
            let serial = queue.serial;
            queue.events.insert(
                at,
                Some(PostedEvent {
                    receiver: Arc::downgrade(receiver),
                    event,
                    priority,
                    serial,
                }),
            );
        }

        self.wakeup.signal();
    }

    /// Serial advanced on every post; the posted-event source uses it to
    /// detect new work without holding the queue lock for long.
    pub fn posted_serial(&self) -> u64 {
        self.posted.lock().expect("posted queue poisoned").serial
    }

    /// Whether any queued event could be delivered right now.
    pub fn has_deliverable_posted(&self) -> bool {
        let queue = self.posted.lock().expect("posted queue poisoned");
        let loop_level = self.loop_level();

        queue.events.iter().any(|slot| match slot {
            Some(posted) => deliverable(posted, loop_level, None),
            None => false,
        })
    }

    /// Drain the posted queue, delivering matching events in order.
    ///
    /// Must be called on this data's own thread. The queue lock is held only
    /// across list manipulation and released around each delivery; reentrant
    /// drains skip entries the outer drain has taken out.
    pub fn send_posted_events(
        &self,
        receiver: Option<&ObjectRef>,
        event_type: Option<EventType>,
    ) -> bool {
        debug_assert!(self.is_current(), "posted events drained off-thread");

        let mut delivered = false;
        let mut queue = self.posted.lock().expect("posted queue poisoned");
        queue.recursion += 1;

        // Only entries queued before this drain started are considered;
        // events posted mid-drain carry a later serial and wait for the
        // next round. Taken entries stay behind as `None` markers until the
        // outermost drain compacts, so indices only ever shift forward.
        let snapshot_serial = queue.serial;
        let mut i = 0;

        while i < queue.events.len() {
            let loop_level = self.loop_level();

            let taken = match &queue.events[i] {
                Some(posted) => {
                    let matches_receiver = match receiver {
                        Some(object) => posted.receiver.ptr_eq(&Arc::downgrade(object)),
                        None => true,
                    };

                    posted.serial <= snapshot_serial
                        && matches_receiver
                        && deliverable(posted, loop_level, event_type)
                }
                None => false,
            };

            if !taken {
                i += 1;
                continue;
            }

            let posted = queue.events[i].take().expect("checked above");
            drop(queue);

            match posted.receiver.upgrade() {
                Some(target) => {
                    self.enter_scope();
                    object::deliver_posted(&target, posted.event);
                    self.leave_scope();
                    delivered = true;
                }
                None => release_blocked_sender(posted.event),
            }

            queue = self.posted.lock().expect("posted queue poisoned");
            i += 1;
        }

        queue.recursion -= 1;
        if queue.recursion == 0 {
            queue.events.retain(|slot| slot.is_some());
        }

        delivered
    }

    /// Drop queued events addressed to a dying object.
    pub fn remove_posted_for(&self, receiver: &ObjectRef) {
        let target = Arc::downgrade(receiver);
        let mut dropped = Vec::new();

        {
            let mut queue = self.posted.lock().expect("posted queue poisoned");
            for slot in queue.events.iter_mut() {
                let matches = match slot {
                    Some(posted) => posted.receiver.ptr_eq(&target),
                    None => false,
                };
                if matches {
                    dropped.push(slot.take().expect("checked above"));
                }
            }
        }

        for posted in dropped {
            release_blocked_sender(posted.event);
        }
    }

    /// Move queued events addressed to `receiver` onto `target`'s queue,
    /// preserving their order. Part of the thread-move protocol.
    pub fn transfer_posted(&self, receiver: &ObjectRef, target: &ThreadData) {
        let wanted = Arc::downgrade(receiver);
        let mut moved = Vec::new();

        {
            let mut queue = self.posted.lock().expect("posted queue poisoned");
            for slot in queue.events.iter_mut() {
                let matches = match slot {
                    Some(posted) => posted.receiver.ptr_eq(&wanted),
                    None => false,
                };
                if matches {
                    moved.push(slot.take().expect("checked above"));
                }
            }
        }

        if moved.is_empty() {
            return;
        }

        {
            // Restamp into the target queue's serial space.
            let mut queue = target.posted.lock().expect("posted queue poisoned");
            for mut posted in moved {
                queue.serial += 1;
                posted.serial = queue.serial;
                queue.events.push(Some(posted));
            }
        }

        target.wakeup.signal();
    }
}

/// A discarded meta-call may have an emitter parked on its semaphore; the
/// emitter is released even though the slot never ran.
fn release_blocked_sender(event: Event) {
    if let Event::MetaCall(call) = event {
        if let Some(done) = call.done {
            done.release();
        }
    }
}

#[inline]
fn deliverable(posted: &PostedEvent, loop_level: u32, event_type: Option<EventType>) -> bool {
    match event_type {
        Some(wanted) => posted.event.type_code() == wanted,
        None => match posted.event {
            // Deferred deletes only run once the loop that scheduled them
            // has unwound to a lower level; ones scheduled outside any loop
            // wait for the first loop entry.
            Event::DeferredDelete {
                loop_level: recorded,
                ..
            } => recorded > loop_level || (recorded == 0 && loop_level > 0),
            _ => true,
        },
    }
}

/// An OS thread running a cooperative event loop.
pub struct Thread {
    data: Arc<ThreadData>,
    handle: Option<JoinHandle<i32>>,
    log: Logger,
}

impl Thread {
    /// Spawn a thread that installs a dispatcher and runs an event loop
    /// until [`Thread::exit`] is called.
    pub fn spawn<'a, L: Into<Option<&'a Logger>>>(name: &str, log: L) -> io::Result<Thread> {
        let log = logging::child(log, logging::o!("thread" => name.to_string()));
        let data = Arc::new(ThreadData::new(name)?);
        let thread_data = data.clone();
        let thread_log = log.clone();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                ThreadData::adopt(thread_data.clone());
                crate::dispatcher::ensure_current();

                logging::debug!(thread_log, "thread loop starting");
                let code = EventLoop::new().exec();
                logging::debug!(thread_log, "thread loop finished"; "code" => code);

                code
            })?;

        Ok(Thread {
            data,
            handle: Some(handle),
            log,
        })
    }

    #[inline]
    pub fn data(&self) -> &Arc<ThreadData> {
        &self.data
    }

    /// Ask the thread's event loop to exit.
    pub fn exit(&self) {
        logging::trace!(self.log, "requesting thread exit");
        self.data.request_quit();
    }

    /// Block until the thread finishes, returning its loop's exit code.
    pub fn wait(&mut self) -> i32 {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(-1),
            None => 0,
        }
    }

    pub fn request_interruption(&self) {
        self.data.request_interruption();
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.exit();
            self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_release_before_acquire() {
        let sem = Semaphore::new();
        sem.release();
        sem.acquire();
    }

    #[test]
    fn test_semaphore_cross_thread() {
        let sem = Arc::new(Semaphore::new());
        let remote = sem.clone();

        let handle = std::thread::spawn(move || {
            remote.release();
        });

        sem.acquire();
        handle.join().unwrap();
    }

    #[test]
    fn test_current_is_stable() {
        let first = ThreadData::current();
        let second = ThreadData::current();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_current());
    }

    #[test]
    fn test_other_thread_data_is_not_current() {
        let data = ThreadData::current();
        let handle = std::thread::spawn(move || data.is_current());
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_thread_spawn_exit_wait() {
        let mut thread = Thread::spawn("kernel-test", None).unwrap();
        thread.exit();
        assert_eq!(thread.wait(), 0);
    }

    #[test]
    fn test_queued_signal_crosses_threads_in_order() {
        use crate::meta::OBJECT_META;
        use crate::object::{self, ConnectionType, Object, Signal, SlotTag, USER_SIGNAL_BASE};
        use crate::variant::Variant;

        const SIG: Signal = Signal::new(USER_SIGNAL_BASE, "value_changed", 1);

        let mut worker = Thread::spawn("queued-worker", None).unwrap();

        let sender = Object::new(&OBJECT_META, "a", None);
        let receiver = Object::new(&OBJECT_META, "b", None);
        assert!(object::move_to_thread(&receiver, worker.data()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Semaphore::new());

        let seen_in = seen.clone();
        let done_in = done.clone();
        object::connect(
            &sender,
            &SIG,
            &receiver,
            SlotTag::ANONYMOUS,
            1,
            ConnectionType::AUTO,
            Arc::new(move |receiver, args| {
                let on_affinity_thread = receiver.thread().is_current();
                seen_in
                    .lock()
                    .unwrap()
                    .push((on_affinity_thread, args[0].get::<i32>().unwrap()));
                done_in.release();
            }),
        )
        .unwrap();

        object::emit(&sender, &SIG, &[Variant::from(42i32)]);
        object::emit(&sender, &SIG, &[Variant::from(43i32)]);

        done.acquire();
        done.acquire();

        assert_eq!(*seen.lock().unwrap(), vec![(true, 42), (true, 43)]);

        worker.exit();
        worker.wait();
    }

    #[test]
    fn test_blocking_queued_runs_slot_before_emit_returns() {
        use crate::meta::OBJECT_META;
        use crate::object::{self, ConnectionType, Object, Signal, SlotTag, USER_SIGNAL_BASE};
        use crate::variant::Variant;
        use std::sync::atomic::{AtomicBool, Ordering};

        const SIG: Signal = Signal::new(USER_SIGNAL_BASE + 1, "blocking_ping", 0);

        let mut worker = Thread::spawn("blocking-worker", None).unwrap();

        let sender = Object::new(&OBJECT_META, "a", None);
        let receiver = Object::new(&OBJECT_META, "b", None);
        assert!(object::move_to_thread(&receiver, worker.data()));

        let ran = Arc::new(AtomicBool::new(false));
        let ran_in = ran.clone();
        object::connect(
            &sender,
            &SIG,
            &receiver,
            SlotTag::ANONYMOUS,
            0,
            ConnectionType::BLOCKING_QUEUED,
            Arc::new(move |_, _| {
                ran_in.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();

        object::emit(&sender, &SIG, &[]);
        assert!(ran.load(Ordering::SeqCst), "emit returned before the slot ran");

        worker.exit();
        worker.wait();
    }

    #[test]
    fn test_posted_priority_buckets_are_fifo() {
        use crate::event::{Event, HIGH_PRIORITY, NORMAL_PRIORITY};
        use crate::meta::OBJECT_META;
        use crate::object::Object;
        use crate::variant::Variant;

        let data = ThreadData::current();
        let object = Object::new(&OBJECT_META, "bucket-receiver", None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_in = order.clone();
        object.set_handler(Arc::new(move |_, event| {
            if let Event::Timer { id, .. } = event {
                order_in.lock().unwrap().push(*id);
            }
            true
        }));

        // Timer events double as payload carriers here; ids encode the
        // posting order.
        data.post_event(
            &object,
            Event::Timer { id: 1, info: Variant::empty() },
            NORMAL_PRIORITY,
        );
        data.post_event(
            &object,
            Event::Timer { id: 2, info: Variant::empty() },
            NORMAL_PRIORITY,
        );
        data.post_event(
            &object,
            Event::Timer { id: 3, info: Variant::empty() },
            HIGH_PRIORITY,
        );
        data.post_event(
            &object,
            Event::Timer { id: 4, info: Variant::empty() },
            HIGH_PRIORITY,
        );

        data.send_posted_events(None, None);

        // Higher priority first, FIFO within each bucket.
        assert_eq!(*order.lock().unwrap(), vec![3, 4, 1, 2]);
    }

    #[test]
    fn test_events_posted_mid_drain_wait_for_next_round() {
        use crate::event::{Event, NORMAL_PRIORITY};
        use crate::meta::OBJECT_META;
        use crate::object::Object;
        use crate::variant::Variant;

        let data = ThreadData::current();
        let object = Object::new(&OBJECT_META, "redrain-receiver", None);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let hits_in = hits.clone();
        let data_in = data.clone();
        let object_weak = Arc::downgrade(&object);
        object.set_handler(Arc::new(move |_, event| {
            if let Event::Timer { .. } = event {
                let first = hits_in.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0;
                if first {
                    // Posted from inside the drain: must not run this round.
                    if let Some(receiver) = object_weak.upgrade() {
                        data_in.post_event(
                            &receiver,
                            Event::Timer { id: 9, info: Variant::empty() },
                            NORMAL_PRIORITY,
                        );
                    }
                }
            }
            true
        }));

        data.post_event(
            &object,
            Event::Timer { id: 1, info: Variant::empty() },
            NORMAL_PRIORITY,
        );

        data.send_posted_events(None, None);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

        data.send_posted_events(None, None);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_move_to_thread_relocates_pending_posted_events() {
        use crate::event::Event;
        use crate::meta::OBJECT_META;
        use crate::object::{self, Object};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut worker = Thread::spawn("move-worker", None).unwrap();

        let object = Object::new(&OBJECT_META, "mover", None);
        let handled = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Semaphore::new());

        let handled_in = handled.clone();
        let done_in = done.clone();
        object.set_handler(Arc::new(move |receiver, event| {
            if let Event::Quit = event {
                assert!(receiver.thread().is_current());
                handled_in.fetch_add(1, Ordering::SeqCst);
                done_in.release();
            }
            true
        }));

        // Queue an event while the object still lives here, then move it;
        // the pending event must follow the object to the worker's queue.
        ThreadData::current().post_event(&object, Event::Quit, crate::event::NORMAL_PRIORITY);
        assert!(object::move_to_thread(&object, worker.data()));

        done.acquire();
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        worker.exit();
        worker.wait();
    }
}
