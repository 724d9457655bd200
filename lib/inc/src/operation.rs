//! Shared handle for an in-flight request.
//!
//! The protocol and the caller hold the same reference-counted operation;
//! whichever side completes it first wins, later transitions are ignored.
//! Callers await by connecting to the completion signal, polling the state,
//! or blocking on [`Operation::wait`].

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use axon::logging::Logger;
use axon::meta::{MetaObject, OBJECT_META};
use axon::object::{self, Object, ObjectRef, Signal, USER_SIGNAL_BASE};
use axon::variant::Variant;

use crate::error::IncError;

pub static OPERATION_META: MetaObject = MetaObject::new("Operation", Some(&OBJECT_META));

/// Emitted once with `(error_code: i32, result: Vec<u8>)`.
pub const COMPLETED: Signal = Signal::new(USER_SIGNAL_BASE, "completed", 2);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OpState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Completed | OpState::Failed | OpState::Cancelled)
    }
}

struct OpData {
    state: OpState,
    error_code: i32,
    result: Vec<u8>,
    deadline: Option<Instant>,
}

pub struct Operation {
    object: ObjectRef,
    sequence: u32,
    data: Mutex<OpData>,
    cv: Condvar,
}

pub type OperationRef = Arc<Operation>;

impl Operation {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(sequence: u32, log: L) -> OperationRef {
        Arc::new(Operation {
            object: Object::new(&OPERATION_META, "operation", log),
            sequence,
            data: Mutex::new(OpData {
                state: OpState::Pending,
                error_code: 0,
                result: Vec::new(),
                deadline: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Convenience for call sites that must hand back an operation that
    /// already failed (e.g. "not connected").
    pub fn failed<'a, L: Into<Option<&'a Logger>>>(error: IncError, log: L) -> OperationRef {
        let op = Operation::new(0, log);
        op.set_result(error.code(), Vec::new());
        op
    }

    /// The object carrying the completion signal.
    #[inline]
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn state(&self) -> OpState {
        self.data.lock().expect("operation poisoned").state
    }

    pub fn error_code(&self) -> i32 {
        self.data.lock().expect("operation poisoned").error_code
    }

    pub fn result(&self) -> Vec<u8> {
        self.data.lock().expect("operation poisoned").result.clone()
    }

    pub fn set_running(&self) {
        let mut data = self.data.lock().expect("operation poisoned");
        if data.state == OpState::Pending {
            data.state = OpState::Running;
        }
    }

    /// Arm the deadline, measured from now.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut data = self.data.lock().expect("operation poisoned");
        if !data.state.is_terminal() {
            data.deadline = Some(Instant::now() + timeout);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.data.lock().expect("operation poisoned").deadline
    }

    /// Complete with a reply. Zero error means success. No-op once
    /// terminal.
    pub fn set_result(&self, error_code: i32, result: Vec<u8>) {
        {
            let mut data = self.data.lock().expect("operation poisoned");
            if data.state.is_terminal() {
                return;
            }

            data.state = if error_code == 0 {
                OpState::Completed
            } else {
                OpState::Failed
            };
            data.error_code = error_code;
            data.result = result.clone();
        }

        self.cv.notify_all();
        object::emit(
            &self.object,
            &COMPLETED,
            &[Variant::from(error_code), Variant::new(result)],
        );
    }

    /// Cooperative cancellation with an explicit error code.
    pub fn cancel_with(&self, error: IncError) {
        {
            let mut data = self.data.lock().expect("operation poisoned");
            if data.state.is_terminal() {
                return;
            }

            data.state = OpState::Cancelled;
            data.error_code = error.code();
            data.result.clear();
        }

        self.cv.notify_all();
        object::emit(
            &self.object,
            &COMPLETED,
            &[Variant::from(error.code()), Variant::new(Vec::<u8>::new())],
        );
    }

    pub fn cancel(&self) {
        self.cancel_with(IncError::NotConnected);
    }

    /// Whether the deadline has elapsed without completion.
    pub fn is_expired(&self, now: Instant) -> bool {
        let data = self.data.lock().expect("operation poisoned");
        match data.deadline {
            Some(deadline) => !data.state.is_terminal() && deadline <= now,
            None => false,
        }
    }

    /// Block until terminal or `timeout` elapses. Returns the final state
    /// (still non-terminal on wait timeout).
    pub fn wait(&self, timeout: Option<Duration>) -> OpState {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut data = self.data.lock().expect("operation poisoned");

        while !data.state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (next, result) = self
                        .cv
                        .wait_timeout(data, deadline - now)
                        .expect("operation poisoned");
                    data = next;
                    if result.timed_out() && !data.state.is_terminal() {
                        break;
                    }
                }
                None => {
                    data = self.cv.wait(data).expect("operation poisoned");
                }
            }
        }

        data.state
    }
}
