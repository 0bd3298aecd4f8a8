//! pbcore — Streaming and refcounting primitives for a minimalist
//! protobuf runtime.
//!
//! Two subsystems make up the crate:
//!
//! - **Streaming core**: [`ByteSource`] / [`ByteSink`] channels that keep
//!   transports out of the decoder (with zero-copy string handoff where the
//!   source can alias its buffer), and a bounded-stack [`Dispatcher`] that
//!   routes decoded events into [`Handler`] sets — including handing whole
//!   submessage subtrees to delegate sets and handing control back when
//!   they end.
//! - **Refcounted graph**: lifetime management for definition objects that
//!   may form arbitrary cycles. While mutable, linked objects share one
//!   conservative group refcount; [`freeze`] partitions the reachable graph
//!   into exact strongly-connected components, after which retain/release
//!   are lock-free and collection is precise.
//!
//! # Example
//!
//! ```
//! use pbcore::{Dispatcher, Flow, Handler, Handlers, StartFlow, Value};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! /// Sums top-level integers; nested entries go to a delegate that only
//! /// counts them.
//! #[derive(Default)]
//! struct Sum(i64);
//!
//! impl Handler for Sum {
//!     fn start_submessage(&mut self, _field: u32) -> StartFlow {
//!         StartFlow::Delegate(Handlers::new(Count::default()))
//!     }
//!     fn value(&mut self, _field: u32, value: Value) -> Flow {
//!         if let Value::Int64(v) = value {
//!             self.0 += v;
//!         }
//!         Flow::Continue
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Count(u32);
//!
//! impl Handler for Count {
//!     fn value(&mut self, _field: u32, _value: Value) -> Flow {
//!         self.0 += 1;
//!         Flow::Continue
//!     }
//! }
//!
//! let sum = Rc::new(RefCell::new(Sum::default()));
//! let mut dispatcher: Dispatcher = Dispatcher::new(Handlers::from_shared(sum.clone()));
//!
//! dispatcher.start_message();
//! assert_eq!(dispatcher.value(1, Value::Int64(40)), Flow::Continue);
//! // The delegation is invisible to the decoder: it sees Continue.
//! assert_eq!(dispatcher.start_submessage(2).unwrap(), Flow::Continue);
//! assert_eq!(dispatcher.value(3, Value::Int64(99)), Flow::Continue);
//! assert_eq!(dispatcher.end_submessage(), Flow::Continue);
//! assert_eq!(dispatcher.value(1, Value::Int64(2)), Flow::Continue);
//! dispatcher.end_message();
//!
//! // The delegate consumed the nested value; only 40 + 2 were summed.
//! assert_eq!(sum.borrow().0, 42);
//! ```
//!
//! # Features
//!
//! - `audit` — attribute every ref to its owner and capture site, and
//!   assert on double-refs and foreign releases. Diagnostic only.

mod audit;
mod bytestream;
mod config;
mod dispatcher;
mod error;
mod freeze;
mod handlers;
mod invariants;
mod metrics;
mod refcounted;

pub use bytestream::{ByteSink, ByteSource};
pub use config::{DEFAULT_FREEZE_DEPTH, MAX_NESTING, READ_CHUNK};
pub use dispatcher::Dispatcher;
pub use error::Error;
pub use freeze::{freeze, FreezeStats};
pub use handlers::{Flow, Handler, Handlers, StartFlow, Value};
pub use metrics::DispatchMetrics;
pub use refcounted::{Handle, Managed, Owner, Ptr, RefCounted, VTable, Visit, UNTRACKED};
