//! Property-based tests for the graph and dispatcher invariants.
//!
//! Coverage:
//! - mutable group counters always equal the sum of member ref counts
//! - balanced ref sequences free every object exactly once, with and
//!   without an intervening freeze
//! - the dispatcher returns to its base frame on well-formed streams,
//!   delegated or not
//! - `get_full_str` reproduces the stream byte-for-byte

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use pbcore::{
    freeze, ByteSource, Dispatcher, Error, Flow, Handle, Handler, Handlers, Managed, Owner, Ptr,
    StartFlow, Value, Visit, UNTRACKED,
};

// =============================================================================
// Graph model helpers
// =============================================================================

struct Node {
    links: RefCell<Vec<Handle>>,
    drops: Arc<AtomicUsize>,
}

impl Visit for Node {
    fn visit(&self, emit: &mut dyn FnMut(Handle)) {
        for &h in self.links.borrow().iter() {
            emit(h);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn node(drops: &Arc<AtomicUsize>, owner: Owner) -> Ptr<Node> {
    Managed::new(
        Node { links: RefCell::new(Vec::new()), drops: Arc::clone(drops) },
        owner,
    )
}

fn add_link(target: Ptr<Node>, from: Ptr<Node>) {
    unsafe {
        from.value().links.borrow_mut().push(target.handle());
        target.handle().link(from.handle());
    }
}

/// Toy union-find mirroring the conservative grouping.
struct Groups {
    parent: Vec<usize>,
}

impl Groups {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        self.parent[ra] = rb;
    }

    fn members(&mut self, of: usize) -> Vec<usize> {
        let root = self.find(of);
        (0..self.parent.len())
            .filter(|&i| self.find(i) == root)
            .collect()
    }
}

// =============================================================================
// Mutable group counters equal the sum of member ref counts
// =============================================================================

const N: usize = 8;

#[derive(Debug, Clone)]
enum GraphOp {
    /// Link `from -> target`.
    Link { target: usize, from: usize },
    /// One extra untracked ref on a node.
    Retain(usize),
    /// Drop one previously added extra ref.
    ReleaseExtra(usize),
}

fn graph_op() -> impl Strategy<Value = GraphOp> {
    prop_oneof![
        (0..N, 0..N).prop_map(|(target, from)| GraphOp::Link { target, from }),
        (0..N).prop_map(GraphOp::Retain),
        (0..N).prop_map(GraphOp::ReleaseExtra),
    ]
}

proptest! {
    /// After any mutable op sequence, every group counter equals the sum of
    /// the members' individual counts, and teardown frees all nodes once.
    #[test]
    fn prop_group_counter_matches_ref_sum(ops in prop::collection::vec(graph_op(), 1..60)) {
        let drops = Arc::new(AtomicUsize::new(0));
        let nodes: Vec<Ptr<Node>> = (0..N).map(|_| node(&drops, UNTRACKED)).collect();
        let mut groups = Groups::new(N);
        let mut extras = [0u32; N];

        for op in ops {
            match op {
                GraphOp::Link { target, from } => {
                    if target != from {
                        add_link(nodes[target], nodes[from]);
                        groups.union(target, from);
                    }
                }
                GraphOp::Retain(i) => {
                    unsafe { nodes[i].handle().retain(UNTRACKED) };
                    extras[i] += 1;
                }
                GraphOp::ReleaseExtra(i) => {
                    if extras[i] > 0 {
                        unsafe { nodes[i].handle().release(UNTRACKED) };
                        extras[i] -= 1;
                    }
                }
            }

            for i in 0..N {
                let expected: u32 = groups.members(i).iter().map(|&m| 1 + extras[m]).sum();
                let actual = unsafe { nodes[i].handle().group_count() };
                prop_assert_eq!(actual, expected, "group counter diverged on node {}", i);
                let individual = unsafe { nodes[i].handle().individual_count() };
                prop_assert_eq!(individual, 1 + extras[i]);
            }
        }

        // Balance everything; every node must be freed exactly once.
        for i in 0..N {
            for _ in 0..extras[i] {
                unsafe { nodes[i].handle().release(UNTRACKED) };
            }
        }
        for n in &nodes {
            unsafe { n.handle().release(UNTRACKED) };
        }
        prop_assert_eq!(drops.load(Ordering::SeqCst), N);
    }
}

// =============================================================================
// Freeze round trip: freed set equals allocated set
// =============================================================================

proptest! {
    /// For any edge set and any root choice, freezing and then dropping all
    /// external refs frees every node exactly once.
    #[test]
    fn prop_freeze_round_trip(
        edges in prop::collection::vec((0usize..10, 0usize..10), 0..30),
        roots in prop::collection::vec(0usize..10, 0..10),
    ) {
        let drops = Arc::new(AtomicUsize::new(0));
        let owners: Vec<Owner> = (0..10).map(|i| Owner::token(0x7000 + i)).collect();
        let nodes: Vec<Ptr<Node>> = owners.iter().map(|&o| node(&drops, o)).collect();

        for &(target, from) in &edges {
            if target != from {
                add_link(nodes[target], nodes[from]);
            }
        }

        let root_handles: Vec<Handle> = roots.iter().map(|&i| nodes[i].handle()).collect();
        let stats = unsafe { freeze(&root_handles, 64) }.unwrap();

        // Everything reachable from the roots along the surviving edges is
        // frozen; count it in the model.
        let mut reachable = vec![false; 10];
        let mut stack: Vec<usize> = roots.clone();
        while let Some(i) = stack.pop() {
            if reachable[i] {
                continue;
            }
            reachable[i] = true;
            for &(target, from) in &edges {
                if from == i && target != from && !reachable[target] {
                    stack.push(target);
                }
            }
        }
        let expect_frozen = reachable.iter().filter(|&&r| r).count();
        prop_assert_eq!(stats.objects, expect_frozen);
        for i in 0..10 {
            prop_assert_eq!(unsafe { nodes[i].handle().is_frozen() }, reachable[i]);
        }

        for i in 0..10 {
            unsafe { nodes[i].handle().release(owners[i]) };
        }
        prop_assert_eq!(drops.load(Ordering::SeqCst), 10);
    }
}

// =============================================================================
// Dispatcher returns to the base frame on well-formed streams
// =============================================================================

#[derive(Debug, Clone)]
enum Script {
    Value(u32),
    Sub(Vec<Script>),
}

fn script() -> impl Strategy<Value = Vec<Script>> {
    let leaf = (0u32..100).prop_map(Script::Value);
    let tree = leaf.prop_recursive(4, 48, 6, |inner| {
        prop::collection::vec(inner, 0..6).prop_map(Script::Sub)
    });
    prop::collection::vec(tree, 0..6)
}

fn run<const N: usize>(d: &mut Dispatcher<N>, items: &[Script]) {
    for item in items {
        match item {
            Script::Value(f) => {
                d.value(*f, Value::UInt32(*f));
            }
            Script::Sub(children) => {
                if d.start_submessage(0).unwrap() == Flow::Continue {
                    run(d, children);
                    d.end_submessage();
                }
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    started: std::cell::Cell<u64>,
    ended: std::cell::Cell<u64>,
}

/// Delegates every submessage to a fresh set sharing the same counters.
struct Delegating {
    counters: Rc<Counters>,
}

impl Handler for Delegating {
    fn start_message(&mut self) {
        self.counters.started.set(self.counters.started.get() + 1);
    }

    fn end_message(&mut self) {
        self.counters.ended.set(self.counters.ended.get() + 1);
    }

    fn start_submessage(&mut self, _field: u32) -> StartFlow {
        StartFlow::Delegate(Handlers::new(Delegating { counters: self.counters.clone() }))
    }
}

proptest! {
    /// Every delegated set sees one balanced start/end message pair, and
    /// the dispatcher ends back on its base frame at depth 1.
    #[test]
    fn prop_delegation_balances(items in script()) {
        let counters = Rc::new(Counters::default());
        let set = Handlers::new(Delegating { counters: counters.clone() });
        let mut d: Dispatcher<16> = Dispatcher::new(set);

        d.start_message();
        run(&mut d, &items);
        d.end_message();

        prop_assert_eq!(counters.started.get(), counters.ended.get());
        prop_assert_eq!(d.frame_count(), 1);
        prop_assert_eq!(d.depth(), 1);
        prop_assert_eq!(d.metrics().delegations + 1, counters.started.get());
    }

    /// Same property without delegation: depth nesting alone.
    #[test]
    fn prop_plain_nesting_balances(items in script()) {
        let mut d: Dispatcher<16> = Dispatcher::new(Handlers::empty());
        d.start_message();
        run(&mut d, &items);
        d.end_message();
        prop_assert_eq!(d.frame_count(), 1);
        prop_assert_eq!(d.depth(), 1);
    }
}

// =============================================================================
// get_full_str reproduces the stream byte-for-byte
// =============================================================================

struct ChunkedSource {
    data: Bytes,
    pos: usize,
    alias_max: usize,
    read_cap: usize,
    status: Option<Error>,
}

impl ByteSource for ChunkedSource {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        let n = dst
            .len()
            .min(self.read_cap)
            .min(self.data.len() - self.pos);
        dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn get_str(&mut self, max: usize) -> Result<Bytes, Error> {
        let window = self.alias_max.saturating_sub(self.pos);
        let end = self.pos + window.min(max).min(self.data.len() - self.pos);
        let aliased = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(aliased)
    }

    fn eof(&self) -> bool {
        self.pos == self.data.len()
    }

    fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }
}

proptest! {
    #[test]
    fn prop_get_full_str_round_trips(
        data in prop::collection::vec(any::<u8>(), 0..16_384),
        alias_max in 0usize..20_000,
        read_cap in 1usize..4_096,
    ) {
        let backing = Bytes::from(data.clone());
        let mut src = ChunkedSource {
            data: backing,
            pos: 0,
            alias_max,
            read_cap,
            status: None,
        };
        let out = src.get_full_str().unwrap();
        prop_assert_eq!(out.as_ref(), data.as_slice());
        prop_assert!(src.eof());
    }
}
