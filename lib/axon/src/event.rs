//! Event variants and posted-event records.
//!
//! Events own their arguments through ref-counted handles (`Variant`,
//! connection records) so they stay valid across thread hops.

use std::sync::{Arc, Weak};

use crate::object::{ConnectionRecord, Object, ObjectRef};
use crate::thread::Semaphore;
use crate::timer::TimerId;
use crate::variant::Variant;

/// Short type codes used for filtering without matching the full payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventType {
    None = 0,
    Timer = 1,
    Quit = 2,
    MetaCall = 3,
    ThreadChange = 4,
    ChildAdded = 5,
    ChildRemoved = 6,
    DeferredDelete = 7,
}

/// A queued slot invocation crossing (or re-entering) a thread.
pub struct MetaCall {
    /// Strong reference keeps the record alive until delivery; the orphan
    /// flag is re-checked on the receiving side.
    pub record: Arc<ConnectionRecord>,
    pub args: Vec<Variant>,
    /// Release handle for a blocking-queued caller.
    pub done: Option<Arc<Semaphore>>,
}

pub enum Event {
    Quit,
    Timer { id: TimerId, info: Variant },
    MetaCall(MetaCall),
    ThreadChange,
    ChildAdded(ObjectRef),
    ChildRemoved(ObjectRef),
    DeferredDelete { loop_level: u32, scope_level: u32 },
}

impl Event {
    #[inline]
    pub fn type_code(&self) -> EventType {
        match self {
            Event::Quit => EventType::Quit,
            Event::Timer { .. } => EventType::Timer,
            Event::MetaCall(_) => EventType::MetaCall,
            Event::ThreadChange => EventType::ThreadChange,
            Event::ChildAdded(_) => EventType::ChildAdded,
            Event::ChildRemoved(_) => EventType::ChildRemoved,
            Event::DeferredDelete { .. } => EventType::DeferredDelete,
        }
    }
}

/// Default posting priority.
pub const NORMAL_PRIORITY: i32 = 0;
/// Delivered ahead of normal-priority events for the same receiver.
pub const HIGH_PRIORITY: i32 = 1;

/// An event parked in a thread's posted queue. The serial stamp marks the
/// posting order so a drain only delivers events queued before it started.
pub struct PostedEvent {
    pub receiver: Weak<Object>,
    pub event: Event,
    pub priority: i32,
    pub serial: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(Event::Quit.type_code(), EventType::Quit);
        assert_eq!(Event::ThreadChange.type_code(), EventType::ThreadChange);
        assert_eq!(
            Event::DeferredDelete {
                loop_level: 1,
                scope_level: 0
            }
            .type_code(),
            EventType::DeferredDelete
        );
    }
}
