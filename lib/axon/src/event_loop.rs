//! One reentrant run of the current thread's dispatcher.

use std::cell::Cell;
use std::ops::BitOr;

use crate::dispatcher;
use crate::thread::ThreadData;

/// Flags controlling one dispatcher iteration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProcessFlags(u32);

impl ProcessFlags {
    pub const ALL_EVENTS: ProcessFlags = ProcessFlags(0);
    pub const WAIT_FOR_MORE: ProcessFlags = ProcessFlags(1);
    pub const EVENT_LOOP_EXEC: ProcessFlags = ProcessFlags(2);

    #[inline]
    pub fn contains(self, other: ProcessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProcessFlags {
    type Output = ProcessFlags;

    #[inline]
    fn bitor(self, rhs: ProcessFlags) -> ProcessFlags {
        ProcessFlags(self.0 | rhs.0)
    }
}

/// A cooperative event loop. `exec` runs the current thread's dispatcher
/// until `exit` is called (or the thread is asked to quit). Nested `exec`
/// calls are legal; each tracks its own exit flag.
pub struct EventLoop {
    exit: Cell<bool>,
    code: Cell<i32>,
}

impl EventLoop {
    pub fn new() -> EventLoop {
        EventLoop {
            exit: Cell::new(false),
            code: Cell::new(0),
        }
    }

    /// Run until exit. Returns the code passed to [`EventLoop::exit`].
    pub fn exec(&self) -> i32 {
        let data = ThreadData::current();
        let dispatcher = dispatcher::ensure_current();

        data.enter_loop();

        while !self.exit.get() && !data.quit_requested() {
            dispatcher.process_events(ProcessFlags::WAIT_FOR_MORE | ProcessFlags::EVENT_LOOP_EXEC);
        }

        data.leave_loop();

        // The outermost loop consumes the thread-wide quit request.
        if data.loop_level() == 0 {
            data.clear_quit();
        }

        self.code.get()
    }

    /// Ask the loop to stop after the current iteration.
    pub fn exit(&self, code: i32) {
        self.code.set(code);
        self.exit.set(true);

        if let Some(dispatcher) = dispatcher::current() {
            dispatcher.interrupt();
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        !self.exit.get()
    }

    /// Process pending events once without blocking.
    pub fn process_events(flags: ProcessFlags) -> bool {
        dispatcher::ensure_current().process_events(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::meta::OBJECT_META;
    use crate::object::{self, Object};
    use crate::timer::TimerType;
    use crate::variant::Variant;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_flags() {
        let flags = ProcessFlags::WAIT_FOR_MORE | ProcessFlags::EVENT_LOOP_EXEC;
        assert!(flags.contains(ProcessFlags::WAIT_FOR_MORE));
        assert!(flags.contains(ProcessFlags::EVENT_LOOP_EXEC));
        assert!(ProcessFlags::ALL_EVENTS.contains(ProcessFlags::ALL_EVENTS));
        assert!(!ProcessFlags::ALL_EVENTS.contains(ProcessFlags::WAIT_FOR_MORE));
    }

    #[test]
    fn test_timer_drives_loop_and_fires_repeatedly() {
        let ticker = Object::new(&OBJECT_META, "ticker", None);
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in = fired.clone();
        ticker.set_handler(Arc::new(move |receiver, event| {
            if let Event::Timer { .. } = event {
                if fired_in.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    receiver.thread().request_quit();
                }
                return true;
            }
            false
        }));

        object::start_timer(
            &ticker,
            Duration::from_millis(5),
            TimerType::Precise,
            Variant::empty(),
        );

        let started = Instant::now();
        EventLoop::new().exec();

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_delete_later_runs_on_loop_entry() {
        let doomed = Object::new(&OBJECT_META, "doomed", None);
        object::delete_later(&doomed);
        assert!(!doomed.is_destroyed(), "no loop has run yet");

        // A short timer on a second object shuts the loop down.
        let quitter = Object::new(&OBJECT_META, "quitter", None);
        quitter.set_handler(Arc::new(|receiver, event| {
            if let Event::Timer { .. } = event {
                receiver.thread().request_quit();
            }
            true
        }));
        object::start_timer(
            &quitter,
            Duration::from_millis(5),
            TimerType::Coarse,
            Variant::empty(),
        );

        EventLoop::new().exec();
        assert!(doomed.is_destroyed());
    }

    #[test]
    fn test_exit_code_propagates() {
        let event_loop = EventLoop::new();
        event_loop.exit(17);
        // Exit was requested before exec; the loop unwinds immediately.
        assert_eq!(event_loop.exec(), 17);
    }
}
