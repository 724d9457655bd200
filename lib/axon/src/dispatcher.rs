//! The event dispatcher: polls descriptors, fires timers, drains posted
//! events.
//!
//! The dispatcher is thread-owned and reentrant: every mutating entry point
//! takes `&self` and guards its state with cells so a slot running inside
//! `dispatch` may attach sources, adjust descriptor interest or start
//! timers without tripping a borrow. Only `wake_up`/`interrupt` may be
//! reached from other threads, and both route through the thread's
//! [`Wakeup`](crate::wakeup::Wakeup).

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::event::Event;
use crate::event_loop::ProcessFlags;
use crate::logging::{self, Logger};
use crate::object::{self, ObjectRef};
use crate::source::{EventSource, Readiness, SourceId, PRIORITY_HIGH};
use crate::thread::ThreadData;
use crate::timer::{self, TimerId, TimerList, TimerSpec, TimerType};
use crate::variant::Variant;

const WAKEUP_TOKEN: Token = Token(0);
const FD_TOKEN_BASE: usize = 1;

/// Contract every dispatcher implementation honours. The portable
/// implementation is [`SelectorDispatcher`]; an external-main-loop adaptor
/// would implement the same surface.
pub trait EventDispatcher {
    /// One iteration: prepare sources, poll, check, dispatch.
    /// Returns whether anything was dispatched.
    fn process_events(&self, flags: ProcessFlags) -> bool;

    /// Wake a blocking poll without interrupting the iteration.
    fn wake_up(&self);

    /// Make the current/next `process_events` return immediately.
    fn interrupt(&self);

    fn register_timer(
        &self,
        interval: Duration,
        kind: TimerType,
        object: &ObjectRef,
        info: Variant,
    ) -> TimerId;
    fn unregister_timer(&self, id: TimerId) -> bool;
    fn unregister_object_timers(&self, object: &ObjectRef) -> Vec<(TimerId, TimerSpec)>;
    fn register_timer_id(
        &self,
        id: TimerId,
        interval: Duration,
        kind: TimerType,
        object: &ObjectRef,
        info: Variant,
    );
    fn timer_remaining(&self, id: TimerId) -> Option<Duration>;

    fn attach_source(&self, source: Box<dyn EventSource>) -> SourceId;
    fn detach_source(&self, id: SourceId) -> bool;

    fn register_fd(&self, source: SourceId, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn update_fd(&self, source: SourceId, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn deregister_fd(&self, source: SourceId, fd: RawFd) -> io::Result<()>;
}

struct SourceEntry {
    id: SourceId,
    priority: i32,
    source: RefCell<Option<Box<dyn EventSource>>>,
    ready: Cell<bool>,
    pending: Cell<bool>,
    detached: Cell<bool>,
}

#[derive(Copy, Clone)]
struct FdRecord {
    source: SourceId,
    fd: RawFd,
    interest: Interest,
}

/// Portable selector-based dispatcher over `mio::Poll`.
pub struct SelectorDispatcher {
    data: Arc<ThreadData>,
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    sources: RefCell<Vec<Rc<SourceEntry>>>,
    next_source: Cell<usize>,
    fds: RefCell<Vec<Option<FdRecord>>>,
    timers: Rc<RefCell<TimerList>>,
    interrupted: Cell<bool>,
    log: Logger,
}

impl SelectorDispatcher {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        data: Arc<ThreadData>,
        log: L,
    ) -> io::Result<SelectorDispatcher> {
        let log = logging::child(log, logging::o!("thread" => data.name().to_string()));
        let poll = Poll::new()?;

        poll.registry().register(
            &mut SourceFd(&data.wakeup().poll_fd()),
            WAKEUP_TOKEN,
            Interest::READABLE,
        )?;

        let dispatcher = SelectorDispatcher {
            data: data.clone(),
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(256)),
            sources: RefCell::new(Vec::new()),
            next_source: Cell::new(1),
            fds: RefCell::new(Vec::new()),
            timers: Rc::new(RefCell::new(TimerList::new())),
            interrupted: Cell::new(false),
            log,
        };

        dispatcher.attach_source(Box::new(PostedEventSource { data }));
        dispatcher.attach_source(Box::new(TimerEventSource {
            timers: dispatcher.timers.clone(),
        }));

        Ok(dispatcher)
    }

    /// Run `f` on the taken-out source. Returns `None` while the source is
    /// already taken (reentrant dispatch) or gone.
    fn with_source<R>(
        &self,
        entry: &SourceEntry,
        f: impl FnOnce(&mut Box<dyn EventSource>) -> R,
    ) -> Option<R> {
        let taken = entry.source.borrow_mut().take();
        let mut source = taken?;

        let result = f(&mut source);

        // A source that detached itself during the call is dropped here
        // instead of being put back.
        if !entry.detached.get() {
            *entry.source.borrow_mut() = Some(source);
        }

        Some(result)
    }

    fn find_fd(&self, source: SourceId, fd: RawFd) -> Option<usize> {
        self.fds.borrow().iter().position(|slot| match slot {
            Some(record) => record.source == source && record.fd == fd,
            None => false,
        })
    }
}

impl EventDispatcher for SelectorDispatcher {
    fn process_events(&self, flags: ProcessFlags) -> bool {
        if self.interrupted.replace(false) {
            return false;
        }

        let snapshot: Vec<Rc<SourceEntry>> = self.sources.borrow().clone();

        // Prepare: ascending priority; the first ready source raises the
        // ceiling, lower-priority sources only contribute timeouts.
        let mut timeout: Option<Duration> = None;
        let mut ceiling = i32::MAX;
        let mut any_ready = false;

        for entry in &snapshot {
            if entry.detached.get() {
                continue;
            }

            let mut requested: Option<Duration> = None;

            if entry.priority > ceiling {
                entry.ready.set(false);
                self.with_source(entry, |source| source.prepare(&mut requested));
            } else {
                let ready = self
                    .with_source(entry, |source| source.prepare(&mut requested))
                    .unwrap_or(false);
                entry.ready.set(ready);

                if ready {
                    any_ready = true;
                    ceiling = entry.priority;
                }
            }

            if let Some(requested) = requested {
                timeout = Some(match timeout {
                    Some(current) => current.min(requested),
                    None => requested,
                });
            }
        }

        // Poll. Zero timeout when something is already ready or the caller
        // asked not to wait.
        let wait = flags.contains(ProcessFlags::WAIT_FOR_MORE) && self.data.can_wait() && !any_ready;
        let poll_timeout = if wait { timeout } else { Some(Duration::from_millis(0)) };

        let mut readiness: HashMap<SourceId, Readiness> = HashMap::new();

        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();

            match poll.poll(&mut events, poll_timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    logging::error!(self.log, "selector poll failed"; "error" => %err);
                    return false;
                }
            }

            let fds = self.fds.borrow();
            for event in events.iter() {
                let token = event.token();

                if token == WAKEUP_TOKEN {
                    self.data.wakeup().acknowledge();
                    continue;
                }

                let record = fds
                    .get(token.0 - FD_TOKEN_BASE)
                    .and_then(|slot| slot.as_ref());
                if let Some(record) = record {
                    let entry = readiness.entry(record.source).or_default();
                    entry.merge(Readiness {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        closed: event.is_read_closed() || event.is_write_closed(),
                        error: event.is_error(),
                    });
                }
            }
        }

        // Check.
        for entry in &snapshot {
            if entry.detached.get() {
                continue;
            }

            if any_ready && entry.priority > ceiling {
                entry.pending.set(false);
                continue;
            }

            let ready = readiness.get(&entry.id).copied().unwrap_or_default();
            let pending = entry.ready.get()
                || self
                    .with_source(entry, |source| source.check(ready))
                    .unwrap_or(false);
            entry.pending.set(pending);
        }

        // Dispatch.
        let mut processed = false;

        for entry in &snapshot {
            if entry.detached.get() || !entry.pending.get() {
                continue;
            }

            entry.pending.set(false);
            entry.ready.set(false);

            let keep = self
                .with_source(entry, |source| source.dispatch())
                .unwrap_or(true);
            processed = true;

            if !keep {
                self.detach_source(entry.id);
            }
        }

        processed
    }

    fn wake_up(&self) {
        self.data.wakeup().signal();
    }

    fn interrupt(&self) {
        self.interrupted.set(true);
        self.data.wakeup().signal();
    }

    fn register_timer(
        &self,
        interval: Duration,
        kind: TimerType,
        object: &ObjectRef,
        info: Variant,
    ) -> TimerId {
        let id = timer::allocate_timer_id();
        self.register_timer_id(id, interval, kind, object, info);
        id
    }

    fn register_timer_id(
        &self,
        id: TimerId,
        interval: Duration,
        kind: TimerType,
        object: &ObjectRef,
        info: Variant,
    ) {
        self.timers.borrow_mut().register(
            id,
            interval,
            kind,
            Arc::downgrade(object),
            info,
            Instant::now(),
        );
    }

    fn unregister_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().unregister(id)
    }

    fn unregister_object_timers(&self, object: &ObjectRef) -> Vec<(TimerId, TimerSpec)> {
        self.timers
            .borrow_mut()
            .unregister_object(&Arc::downgrade(object))
    }

    fn timer_remaining(&self, id: TimerId) -> Option<Duration> {
        self.timers.borrow().remaining(id, Instant::now())
    }

    fn attach_source(&self, source: Box<dyn EventSource>) -> SourceId {
        let id = SourceId(self.next_source.get());
        self.next_source.set(id.0 + 1);

        let entry = Rc::new(SourceEntry {
            id,
            priority: source.priority(),
            source: RefCell::new(Some(source)),
            ready: Cell::new(false),
            pending: Cell::new(false),
            detached: Cell::new(false),
        });

        let mut sources = self.sources.borrow_mut();
        let at = sources
            .iter()
            .position(|existing| existing.priority > entry.priority)
            .unwrap_or(sources.len());
        sources.insert(at, entry);

        id
    }

    fn detach_source(&self, id: SourceId) -> bool {
        let entry = {
            let mut sources = self.sources.borrow_mut();
            match sources.iter().position(|entry| entry.id == id) {
                Some(at) => Some(sources.remove(at)),
                None => None,
            }
        };

        let entry = match entry {
            Some(entry) => entry,
            None => return false,
        };

        entry.detached.set(true);
        entry.source.borrow_mut().take();

        // Drop any descriptors the source left registered.
        let stale: Vec<RawFd> = self
            .fds
            .borrow()
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(|record| record.source == id)
            .map(|record| record.fd)
            .collect();
        for fd in stale {
            let _ = self.deregister_fd(id, fd);
        }

        true
    }

    fn register_fd(&self, source: SourceId, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut fds = self.fds.borrow_mut();
        let at = fds.iter().position(|slot| slot.is_none()).unwrap_or_else(|| {
            fds.push(None);
            fds.len() - 1
        });

        self.poll.borrow().registry().register(
            &mut SourceFd(&fd),
            Token(FD_TOKEN_BASE + at),
            interest,
        )?;

        fds[at] = Some(FdRecord { source, fd, interest });
        Ok(())
    }

    fn update_fd(&self, source: SourceId, fd: RawFd, interest: Interest) -> io::Result<()> {
        let at = match self.find_fd(source, fd) {
            Some(at) => at,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        };

        self.poll.borrow().registry().reregister(
            &mut SourceFd(&fd),
            Token(FD_TOKEN_BASE + at),
            interest,
        )?;

        if let Some(record) = self.fds.borrow_mut()[at].as_mut() {
            record.interest = interest;
        }
        Ok(())
    }

    fn deregister_fd(&self, source: SourceId, fd: RawFd) -> io::Result<()> {
        let at = match self.find_fd(source, fd) {
            Some(at) => at,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        };

        self.fds.borrow_mut()[at] = None;
        self.poll.borrow().registry().deregister(&mut SourceFd(&fd))
    }
}

/// Built-in source draining the thread's posted-event queue.
struct PostedEventSource {
    data: Arc<ThreadData>,
}

impl EventSource for PostedEventSource {
    fn name(&self) -> &'static str {
        "posted-events"
    }

    fn priority(&self) -> i32 {
        PRIORITY_HIGH
    }

    fn prepare(&mut self, _timeout: &mut Option<Duration>) -> bool {
        self.data.has_deliverable_posted()
    }

    fn check(&mut self, _ready: Readiness) -> bool {
        self.data.has_deliverable_posted()
    }

    fn dispatch(&mut self) -> bool {
        self.data.send_posted_events(None, None);
        true
    }
}

/// Built-in source firing expired timers.
struct TimerEventSource {
    timers: Rc<RefCell<TimerList>>,
}

impl EventSource for TimerEventSource {
    fn name(&self) -> &'static str {
        "timers"
    }

    fn prepare(&mut self, timeout: &mut Option<Duration>) -> bool {
        let now = Instant::now();
        match self.timers.borrow().time_to_next(now) {
            Some(next) if next.as_nanos() == 0 => true,
            Some(next) => {
                *timeout = Some(match *timeout {
                    Some(current) => current.min(next),
                    None => next,
                });
                false
            }
            None => false,
        }
    }

    fn check(&mut self, _ready: Readiness) -> bool {
        self.timers.borrow().has_expired(Instant::now())
    }

    fn dispatch(&mut self) -> bool {
        // Expired timers are re-armed before any handler runs, so a handler
        // killing its own timer removes the fresh registration.
        let fired = self.timers.borrow_mut().take_expired(Instant::now());

        for expired in fired {
            if let Some(object) = expired.object.upgrade() {
                object::deliver_posted(
                    &object,
                    Event::Timer {
                        id: expired.id,
                        info: expired.info,
                    },
                );
            }
        }

        true
    }
}

thread_local! {
    static DISPATCHER: RefCell<Option<Rc<dyn EventDispatcher>>> = RefCell::new(None);
}

/// The calling thread's dispatcher, creating the selector implementation on
/// first use.
pub fn ensure_current() -> Rc<dyn EventDispatcher> {
    DISPATCHER.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(dispatcher) => dispatcher.clone(),
            None => {
                let data = ThreadData::current();
                let dispatcher: Rc<dyn EventDispatcher> = Rc::new(
                    SelectorDispatcher::new(data, None)
                        .expect("selector dispatcher construction failed"),
                );
                *slot = Some(dispatcher.clone());
                dispatcher
            }
        }
    })
}

/// The calling thread's dispatcher, if one is installed.
pub fn current() -> Option<Rc<dyn EventDispatcher>> {
    DISPATCHER.with(|slot| slot.borrow().clone())
}

/// Install a custom dispatcher (e.g. an external-main-loop adaptor) for the
/// calling thread. Must happen before the first `ensure_current`.
pub fn install(dispatcher: Rc<dyn EventDispatcher>) {
    DISPATCHER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            panic!("thread already has a dispatcher installed");
        }
        *slot = Some(dispatcher);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        hits: Arc<AtomicUsize>,
        remaining: usize,
    }

    impl EventSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn prepare(&mut self, _timeout: &mut Option<Duration>) -> bool {
            self.remaining > 0
        }

        fn check(&mut self, _ready: Readiness) -> bool {
            self.remaining > 0
        }

        fn dispatch(&mut self) -> bool {
            self.remaining -= 1;
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.remaining > 0
        }
    }

    fn test_dispatcher() -> SelectorDispatcher {
        let data = Arc::new(ThreadData::new("dispatch-test").unwrap());
        SelectorDispatcher::new(data, None).unwrap()
    }

    #[test]
    fn test_source_dispatch_and_self_detach() {
        let dispatcher = test_dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.attach_source(Box::new(CountingSource {
            hits: hits.clone(),
            remaining: 2,
        }));

        assert!(dispatcher.process_events(ProcessFlags::ALL_EVENTS));
        assert!(dispatcher.process_events(ProcessFlags::ALL_EVENTS));
        // Source returned false from its second dispatch; it is gone now.
        dispatcher.process_events(ProcessFlags::ALL_EVENTS);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_detach_source() {
        let dispatcher = test_dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));

        let id = dispatcher.attach_source(Box::new(CountingSource {
            hits: hits.clone(),
            remaining: 10,
        }));

        assert!(dispatcher.detach_source(id));
        assert!(!dispatcher.detach_source(id));

        dispatcher.process_events(ProcessFlags::ALL_EVENTS);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interrupt_short_circuits() {
        let dispatcher = test_dispatcher();
        dispatcher.interrupt();
        assert!(!dispatcher.process_events(ProcessFlags::WAIT_FOR_MORE));
    }

    #[test]
    fn test_wakeup_fd_breaks_poll() {
        let dispatcher = test_dispatcher();

        // Signalled before polling: the iteration must come back without
        // blocking even though WAIT_FOR_MORE was requested.
        dispatcher.data.wakeup().signal();
        dispatcher.process_events(ProcessFlags::WAIT_FOR_MORE);
    }

    struct PipeSource {
        fd: std::os::unix::io::RawFd,
        seen: Arc<AtomicUsize>,
        pending: Readiness,
    }

    impl EventSource for PipeSource {
        fn name(&self) -> &'static str {
            "pipe"
        }

        fn prepare(&mut self, _timeout: &mut Option<Duration>) -> bool {
            false
        }

        fn check(&mut self, ready: Readiness) -> bool {
            self.pending = ready;
            ready.readable
        }

        fn dispatch(&mut self) -> bool {
            if self.pending.readable {
                let mut buf = [0u8; 16];
                unsafe {
                    libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                }
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
            self.pending = Readiness::default();
            true
        }
    }

    #[test]
    fn test_fd_readiness_reaches_source() {
        let dispatcher = test_dispatcher();

        let mut fds = [0 as std::os::unix::io::RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let source = dispatcher.attach_source(Box::new(PipeSource {
            fd: fds[0],
            seen: seen.clone(),
            pending: Readiness::default(),
        }));
        dispatcher
            .register_fd(source, fds[0], Interest::READABLE)
            .unwrap();

        // Nothing readable yet.
        dispatcher.process_events(ProcessFlags::ALL_EVENTS);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        unsafe {
            libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1);
        }

        // The write makes the read end readable; the source must see it
        // even when the iteration was allowed to block.
        dispatcher.process_events(ProcessFlags::WAIT_FOR_MORE);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        dispatcher.deregister_fd(source, fds[0]).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timer_registration_through_trait() {
        use crate::meta::OBJECT_META;
        use crate::object::Object;

        let dispatcher = test_dispatcher();
        let object = Object::new(&OBJECT_META, "timer-owner", None);

        let id = dispatcher.register_timer(
            Duration::from_millis(50),
            TimerType::Coarse,
            &object,
            Variant::empty(),
        );

        let remaining = dispatcher.timer_remaining(id).unwrap();
        assert!(remaining <= Duration::from_millis(50));

        assert!(dispatcher.unregister_timer(id));
        assert!(!dispatcher.unregister_timer(id));
        assert_eq!(dispatcher.timer_remaining(id), None);

        timer::release_timer_id(id);
    }
}
