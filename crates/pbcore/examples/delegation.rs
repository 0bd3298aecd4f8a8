//! Demonstrates handler delegation: a parent set hands each address-book
//! entry submessage to a dedicated entry set, and control hands back when
//! the entry ends.
//!
//! Run with: cargo run --example delegation

use pbcore::{Dispatcher, Flow, Handler, Handlers, StartFlow, Value};
use std::cell::RefCell;
use std::rc::Rc;

const FIELD_ENTRY: u32 = 1;
const FIELD_NAME: u32 = 2;
const FIELD_ID: u32 = 3;

/// Collects one entry's fields.
#[derive(Default)]
struct Entry {
    name: String,
    id: u64,
    out: Rc<RefCell<Vec<String>>>,
}

impl Handler for Entry {
    fn value(&mut self, field: u32, value: Value) -> Flow {
        match (field, value) {
            (FIELD_NAME, Value::Bytes(b)) => {
                self.name = String::from_utf8_lossy(&b).into_owned();
            }
            (FIELD_ID, Value::UInt64(v)) => self.id = v,
            _ => {}
        }
        Flow::Continue
    }

    fn end_message(&mut self) {
        self.out
            .borrow_mut()
            .push(format!("entry: {} (#{})", self.name, self.id));
    }
}

/// Top-level set: delegates every entry submessage.
struct Book {
    out: Rc<RefCell<Vec<String>>>,
}

impl Handler for Book {
    fn start_submessage(&mut self, field: u32) -> StartFlow {
        if field == FIELD_ENTRY {
            StartFlow::Delegate(Handlers::new(Entry {
                out: self.out.clone(),
                ..Entry::default()
            }))
        } else {
            StartFlow::SkipSubmessage
        }
    }
}

fn main() {
    let out: Rc<RefCell<Vec<String>>> = Rc::default();
    let mut dispatcher: Dispatcher = Dispatcher::new(Handlers::new(Book { out: out.clone() }));

    // Hand-rolled event stream; in production the wire decoder produces it.
    let entries: &[(&str, u64)] = &[("ada", 1), ("grace", 2), ("edsger", 3)];

    dispatcher.start_message();
    for (name, id) in entries {
        dispatcher.start_submessage(FIELD_ENTRY).expect("within nesting bound");
        dispatcher.value(FIELD_NAME, Value::Bytes(bytes::Bytes::copy_from_slice(name.as_bytes())));
        dispatcher.value(FIELD_ID, Value::UInt64(*id));
        dispatcher.end_submessage();
    }
    dispatcher.end_message();

    for line in out.borrow().iter() {
        println!("{line}");
    }
    let m = dispatcher.metrics();
    println!("{} events, {} delegations", m.events, m.delegations);
}
