//! Pollable event sources driven by the dispatcher's
//! prepare / check / dispatch cycle.

use std::time::Duration;

/// Dispatch order: numerically lower priorities run first.
pub const PRIORITY_HIGH: i32 = -100;
pub const PRIORITY_DEFAULT: i32 = 0;
pub const PRIORITY_IDLE: i32 = 200;

/// Aggregated readiness of a source's registered descriptors for one
/// dispatcher iteration.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

impl Readiness {
    #[inline]
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.closed || self.error
    }

    #[inline]
    pub fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.closed |= other.closed;
        self.error |= other.error;
    }
}

/// Stable handle of an attached source.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SourceId(pub usize);

/// A named, priority-ordered pollable unit.
///
/// One dispatcher iteration calls `prepare` on every source (collecting the
/// poll timeout), polls, then calls `check` with the readiness of the
/// source's descriptors, and finally `dispatch` on every pending source.
/// Returning `false` from `dispatch` detaches the source.
pub trait EventSource {
    fn name(&self) -> &'static str;

    #[inline]
    fn priority(&self) -> i32 {
        PRIORITY_DEFAULT
    }

    /// Report whether the source is ready without polling, optionally
    /// lowering the poll timeout. `None` means "no timeout requested".
    fn prepare(&mut self, timeout: &mut Option<Duration>) -> bool;

    /// Decide readiness after polling.
    fn check(&mut self, ready: Readiness) -> bool;

    /// Run the source's work. Returns `false` to detach.
    fn dispatch(&mut self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_merge() {
        let mut r = Readiness::default();
        assert!(!r.any());

        r.merge(Readiness {
            readable: true,
            ..Readiness::default()
        });
        r.merge(Readiness {
            writable: true,
            ..Readiness::default()
        });

        assert!(r.readable && r.writable && !r.closed);
        assert!(r.any());
    }
}
