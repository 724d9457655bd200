//! `axon` is the reactive object/event kernel of the iShell runtime.
//!
//! Every higher layer is built from the same three primitives: objects with
//! typed signal/slot connections, cooperative per-thread event loops driven
//! by a selector-based dispatcher, and posted events for crossing threads.

pub mod logging;
pub mod variant;
pub mod meta;
pub mod freelist;
pub mod wakeup;
pub mod event;
pub mod source;
pub mod timer;
pub mod thread;
pub mod dispatcher;
pub mod event_loop;
pub mod object;

pub mod prelude {
    pub use crate::dispatcher::{EventDispatcher, SelectorDispatcher};
    pub use crate::event::Event;
    pub use crate::event_loop::{EventLoop, ProcessFlags};
    pub use crate::object::{connect, disconnect, emit, ConnectionType, Object, ObjectRef, Signal, SlotTag};
    pub use crate::thread::{Thread, ThreadData};
    pub use crate::timer::{TimerId, TimerType};
    pub use crate::variant::Variant;
}
