//! Handler sets: the event interface a dispatcher routes decoded protocol
//! actions into.
//!
//! A handler set is a [`Handler`] implementation; its vtable is the event
//! table and the instance itself is the per-use closure state. Sets are
//! shared into dispatcher frames by reference counting ([`Handlers`]), so
//! one set can serve several frames of a delegation chain.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

/// Scalar payload delivered with value events.
///
/// The descriptor layer that would give these field-typed meaning is an
/// external collaborator; here they are just the wire-decoded shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Bytes(Bytes),
}

/// Steering decision returned by handler callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep streaming into the current handler set.
    Continue,
    /// Skip the submessage that is about to start.
    SkipSubmessage,
    /// Stop dispatching entirely.
    Break,
}

/// Steering decision for start-submessage, which may additionally hand the
/// event substream to a different handler set.
///
/// `Delegate` carries the child handlers, so a delegation without handlers
/// is unrepresentable; the dispatcher still rejects a delegation to an
/// *empty* `Handlers` value in debug builds.
#[derive(Debug, Clone)]
pub enum StartFlow {
    Continue,
    SkipSubmessage,
    Break,
    Delegate(Handlers),
}

/// The six-event interface of a handler set. Every method has a no-op
/// default so sparse sets only write what they care about.
pub trait Handler {
    /// A top-level message begins (or a delegated subtree begins, from the
    /// delegate's point of view).
    fn start_message(&mut self) {}

    /// The matching end of [`start_message`](Self::start_message).
    fn end_message(&mut self) {}

    /// A submessage-typed field begins. Return
    /// [`StartFlow::Delegate`] to hand its events to another set.
    fn start_submessage(&mut self, field: u32) -> StartFlow {
        let _ = field;
        StartFlow::Continue
    }

    /// A submessage ended. Fired on the *parent* set even when the
    /// submessage itself was delegated.
    fn end_submessage(&mut self) -> Flow {
        Flow::Continue
    }

    /// A scalar field value.
    fn value(&mut self, field: u32, value: Value) -> Flow {
        let _ = (field, value);
        Flow::Continue
    }

    /// A field the descriptor layer could not resolve.
    fn unknown(&mut self, field_number: u32, value: Value) -> Flow {
        let _ = (field_number, value);
        Flow::Continue
    }
}

/// A shareable reference to a handler set, or the distinguished empty value.
///
/// Empty handlers swallow every event and answer [`Flow::Continue`]; they
/// exist so a dispatcher frame is always populated.
#[derive(Clone, Default)]
pub struct Handlers(Option<Rc<RefCell<dyn Handler>>>);

impl Handlers {
    /// Wraps a handler set for sharing into dispatcher frames.
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self(Some(Rc::new(RefCell::new(handler))))
    }

    /// Wraps an already-shared handler set.
    pub fn from_shared(handler: Rc<RefCell<dyn Handler>>) -> Self {
        Self(Some(handler))
    }

    /// The empty value.
    pub const fn empty() -> Self {
        Self(None)
    }

    /// True for the empty value.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    // Event forwarding. Each borrow lasts exactly one callback, so a set
    // that appears in several frames of the same dispatcher never observes
    // an overlapping borrow.

    pub(crate) fn start_message(&self) {
        if let Some(h) = &self.0 {
            h.borrow_mut().start_message();
        }
    }

    pub(crate) fn end_message(&self) {
        if let Some(h) = &self.0 {
            h.borrow_mut().end_message();
        }
    }

    pub(crate) fn start_submessage(&self, field: u32) -> StartFlow {
        match &self.0 {
            Some(h) => h.borrow_mut().start_submessage(field),
            None => StartFlow::Continue,
        }
    }

    pub(crate) fn end_submessage(&self) -> Flow {
        match &self.0 {
            Some(h) => h.borrow_mut().end_submessage(),
            None => Flow::Continue,
        }
    }

    pub(crate) fn value(&self, field: u32, value: Value) -> Flow {
        match &self.0 {
            Some(h) => h.borrow_mut().value(field, value),
            None => Flow::Continue,
        }
    }

    pub(crate) fn unknown(&self, field_number: u32, value: Value) -> Flow {
        match &self.0 {
            Some(h) => h.borrow_mut().unknown(field_number, value),
            None => Flow::Continue,
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_some() {
            f.write_str("Handlers(set)")
        } else {
            f.write_str("Handlers(empty)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_handlers_swallow_events() {
        let h = Handlers::empty();
        assert!(h.is_empty());
        h.start_message();
        assert!(matches!(h.start_submessage(1), StartFlow::Continue));
        assert_eq!(h.value(1, Value::Bool(true)), Flow::Continue);
        assert_eq!(h.end_submessage(), Flow::Continue);
        h.end_message();
    }

    #[test]
    fn test_default_methods_continue() {
        struct Sparse;
        impl Handler for Sparse {}

        let h = Handlers::new(Sparse);
        assert!(!h.is_empty());
        assert!(matches!(h.start_submessage(7), StartFlow::Continue));
        assert_eq!(h.unknown(9, Value::UInt64(3)), Flow::Continue);
    }

    #[test]
    fn test_shared_set_sees_state() {
        #[derive(Default)]
        struct Counter {
            values: u32,
        }
        impl Handler for Counter {
            fn value(&mut self, _field: u32, _value: Value) -> Flow {
                self.values += 1;
                Flow::Continue
            }
        }

        let set: Rc<RefCell<Counter>> = Rc::new(RefCell::new(Counter::default()));
        let h = Handlers::from_shared(set.clone());
        h.value(1, Value::Int32(1));
        h.value(2, Value::Int32(2));
        assert_eq!(set.borrow().values, 2);
    }
}
