//! Group-based refcounting for definition objects that may form cycles.
//!
//! Every managed object embeds a [`RefCounted`] header: a pointer to a
//! *group* counter shared with every object it might be cyclic with, an
//! intrusive circular list threading the group's members, a vtable, an
//! individual (external-ref) count and a frozen flag.
//!
//! # Synchronization protocol
//!
//! Two regimes, split by the one-way frozen flag:
//!
//! **Mutable objects** — every structural operation (retain, release, link,
//! merge, freeze) runs under one process-wide graph lock. A group merge
//! repoints an unbounded number of headers, so per-object locks cannot be
//! ordered soundly; group identity itself changes under merges. Under the
//! lock all header accesses use `Relaxed` ordering — the lock is the
//! synchronization.
//!
//! **Frozen objects** — topology is immutable; the only mutable word is the
//! shared group counter. Retain is a `Relaxed` increment; release is a
//! `Release` decrement paired with an `Acquire` fence before teardown, the
//! same protocol `Arc` uses: the fence orders every preceding use of the
//! group's objects before their destruction.
//!
//! The frozen flag itself is published with `Release` by freeze and read
//! with `Acquire`, so a thread that observes `frozen == true` also observes
//! the rewritten group pointer and member list.
//!
//! Concurrent mutation of *unfrozen* objects is the caller's exclusion
//! problem (single-writer); the graph lock makes the library's own
//! bookkeeping atomic, not the caller's read-modify-write sequences.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_utils::CachePadded;

use crate::audit;
use crate::invariants::{
    debug_assert_group_balanced, debug_assert_live_count, debug_assert_mutable_referrer,
};

/// Serializes every mutation of unfrozen graph structure.
static GRAPH_LOCK: Mutex<()> = Mutex::new(());

/// Takes the graph lock, surviving poisoning: the protected state is a set
/// of atomics that are individually valid even if a caller panicked.
pub(crate) fn graph_lock() -> MutexGuard<'static, ()> {
    GRAPH_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared refcount cell for one group: the sum of all external refs into
/// the group. Padded because it is the one word hammered from many threads
/// once the group is frozen.
pub(crate) type GroupCell = CachePadded<AtomicU32>;

pub(crate) fn new_group_cell(count: u32) -> NonNull<GroupCell> {
    let cell = Box::new(CachePadded::new(AtomicU32::new(count)));
    // SAFETY: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(cell)) }
}

/// # Safety
///
/// `cell` must have come from [`new_group_cell`] and have no remaining
/// members pointing at it.
pub(crate) unsafe fn release_group_cell(cell: NonNull<GroupCell>) {
    drop(Box::from_raw(cell.as_ptr()));
}

/// Dispatch table every managed type supplies once.
pub struct VTable {
    /// Enumerates every outgoing link the object currently holds, once per
    /// held link. Must be callable repeatedly and must not mutate the
    /// graph.
    pub visit: unsafe fn(NonNull<RefCounted>, &mut dyn FnMut(Handle)),
    /// Releases the object's own storage. Called exactly once, after the
    /// object became unreachable. Must not re-enter graph operations.
    pub free: unsafe fn(NonNull<RefCounted>),
}

/// Bookkeeping embedded at the head of every managed allocation.
///
/// All fields are atomics so a frozen object is shareable across threads;
/// see the module docs for which orderings apply in which regime.
pub struct RefCounted {
    /// The group's shared counter.
    pub(crate) group: AtomicPtr<GroupCell>,
    /// Next member of the same group. The links always form a closed cycle;
    /// a single-member group points at itself.
    pub(crate) next: AtomicPtr<RefCounted>,
    /// How this object enumerates its links and frees itself.
    pub(crate) vtable: &'static VTable,
    /// External refs held on this object specifically. Meaningful only
    /// while mutable; frozen collection works purely on the group counter.
    pub(crate) individual: AtomicU32,
    /// One-way mutable → frozen transition.
    pub(crate) frozen: AtomicBool,
}

/// Opaque identity of an external ref holder.
///
/// Real owners are usually derived from the address of the holding value
/// ([`Owner::of`]); [`UNTRACKED`] is distinguishable from all of them and
/// suppresses audit attribution for that ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(usize);

impl Owner {
    /// Owner identity derived from the address of `holder`.
    pub fn of<T>(holder: &T) -> Self {
        Self(holder as *const T as usize)
    }

    /// Owner identity from an arbitrary caller-chosen token.
    pub const fn token(id: usize) -> Self {
        assert!(id != usize::MAX, "token collides with UNTRACKED");
        Self(id)
    }
}

/// Sentinel owner for refs that no audit record should attribute.
pub const UNTRACKED: Owner = Owner(usize::MAX);

/// Untyped reference to a managed object.
///
/// `Copy` and non-owning: holding a `Handle` does not keep the object
/// alive, the refcounts do. Every operation that goes through the header
/// is `unsafe` with the same precondition — the handle must refer to an
/// object that is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) NonNull<RefCounted>);

// SAFETY: a Handle is a non-owning pointer; whether a use is sound is
// governed by the per-operation liveness contracts, not by which thread
// holds the value. Frozen objects are the cross-thread case and their
// headers are all atomics.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    /// Adds an external ref held by `owner`.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object.
    #[track_caller]
    pub unsafe fn retain(self, owner: Owner) {
        let hdr = self.0.as_ref();
        if hdr.frozen.load(Ordering::Acquire) {
            // Frozen path: lock-free, like Arc::clone.
            let cell = &*hdr.group.load(Ordering::Acquire);
            let prev = cell.fetch_add(1, Ordering::Relaxed);
            debug_assert_live_count!(prev);
            audit::on_retain(self, owner);
        } else {
            let _g = graph_lock();
            hdr.individual.fetch_add(1, Ordering::Relaxed);
            (*hdr.group.load(Ordering::Relaxed)).fetch_add(1, Ordering::Relaxed);
            audit::on_retain(self, owner);
            debug_assert_group_balanced!(self);
        }
    }

    /// Drops an external ref held by `owner`. If this was the last ref into
    /// the object's group, the whole group is freed.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object and `owner` must hold a ref on it.
    #[track_caller]
    pub unsafe fn release(self, owner: Owner) {
        let hdr = self.0.as_ref();
        if hdr.frozen.load(Ordering::Acquire) {
            audit::on_release(self, owner);
            let cell = &*hdr.group.load(Ordering::Acquire);
            if cell.fetch_sub(1, Ordering::Release) == 1 {
                // Pairs with the Release decrements of every other thread
                // that dropped a ref into this group.
                fence(Ordering::Acquire);
                teardown_group(self);
            }
        } else {
            let _g = graph_lock();
            audit::on_release(self, owner);
            let prev = hdr.individual.fetch_sub(1, Ordering::Relaxed);
            debug_assert_live_count!(prev);
            let cell = &*hdr.group.load(Ordering::Relaxed);
            let prev_group = cell.fetch_sub(1, Ordering::Relaxed);
            debug_assert_live_count!(prev_group);
            if prev_group == 1 {
                teardown_group(self);
            } else {
                debug_assert_group_balanced!(self);
            }
        }
    }

    /// Moves a ref between owners without changing any count. `from` may be
    /// [`UNTRACKED`]; `to` may not.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object and `from` must hold a ref on it.
    #[track_caller]
    pub unsafe fn transfer(self, from: Owner, to: Owner) {
        debug_assert!(to != UNTRACKED, "transfer target must be a real owner");
        audit::on_transfer(self, from, to);
    }

    /// Records that object `from` now holds a link to `self`.
    ///
    /// While both ends are mutable, the two groups merge — conservatively
    /// and permanently until freeze, because precise cycle tracking during
    /// mutation would mean recomputing components on every edge change. A
    /// link to an already-frozen target instead counts as one external ref
    /// on the target's group.
    ///
    /// The caller must also make `from`'s
    /// [`Visit::visit`] enumerate the new link.
    ///
    /// # Safety
    ///
    /// Both handles must refer to live objects and `from` must be mutable.
    #[track_caller]
    pub unsafe fn link(self, from: Handle) {
        debug_assert_mutable_referrer!(from.0.as_ref().frozen.load(Ordering::Acquire));
        let hdr = self.0.as_ref();
        if hdr.frozen.load(Ordering::Acquire) {
            let cell = &*hdr.group.load(Ordering::Acquire);
            let prev = cell.fetch_add(1, Ordering::Relaxed);
            debug_assert_live_count!(prev);
            audit::on_link(self, from);
            return;
        }
        let _g = graph_lock();
        audit::on_link(self, from);
        merge_groups(self, from);
        debug_assert_group_balanced!(self);
    }

    /// Records that object `from` no longer links to `self`.
    ///
    /// On a mutable target this is structurally a no-op: groups only merge,
    /// never split, until freeze, so no storage is reclaimed before then.
    /// On a frozen target the link was counted as an external ref and is
    /// decremented precisely, possibly freeing the target's group.
    ///
    /// The caller must also stop enumerating the link from `from`'s
    /// [`Visit::visit`].
    ///
    /// # Safety
    ///
    /// Both handles must refer to live objects, `from` must be mutable, and
    /// the link must have been recorded with [`link`](Self::link).
    #[track_caller]
    pub unsafe fn unlink(self, from: Handle) {
        debug_assert_mutable_referrer!(from.0.as_ref().frozen.load(Ordering::Acquire));
        let hdr = self.0.as_ref();
        if hdr.frozen.load(Ordering::Acquire) {
            audit::on_unlink(self, from);
            let cell = &*hdr.group.load(Ordering::Acquire);
            let prev = cell.fetch_sub(1, Ordering::Release);
            debug_assert_live_count!(prev);
            if prev == 1 {
                fence(Ordering::Acquire);
                teardown_group(self);
            }
        } else {
            let _g = graph_lock();
            audit::on_unlink(self, from);
        }
    }

    /// Audit-only: asserts that `owner` holds a recorded ref on this
    /// object. A no-op without the `audit` feature.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object.
    pub unsafe fn check_ref(self, owner: Owner) {
        audit::check(self, owner);
    }

    /// True once the object has been frozen.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object.
    #[inline]
    pub unsafe fn is_frozen(self) -> bool {
        self.0.as_ref().frozen.load(Ordering::Acquire)
    }

    /// Current value of the group's shared counter.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object.
    pub unsafe fn group_count(self) -> u32 {
        let hdr = self.0.as_ref();
        (*hdr.group.load(Ordering::Acquire)).load(Ordering::Acquire)
    }

    /// External refs held on this object specifically (meaningful only
    /// while mutable).
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object.
    pub unsafe fn individual_count(self) -> u32 {
        self.0.as_ref().individual.load(Ordering::Relaxed)
    }

    /// Number of objects in this object's group.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live object, and no concurrent mutable-graph
    /// operation may be in flight.
    pub unsafe fn group_len(self) -> usize {
        let _g = graph_lock();
        let first = self.0.as_ptr().cast_const();
        let mut len = 0;
        let mut cursor = first;
        loop {
            len += 1;
            cursor = (*cursor).next.load(Ordering::Acquire);
            if std::ptr::eq(cursor, first) {
                break;
            }
        }
        len
    }

    /// True if both objects currently share a group.
    ///
    /// # Safety
    ///
    /// Both handles must refer to live objects.
    pub unsafe fn same_group(self, other: Handle) -> bool {
        let a = self.0.as_ref().group.load(Ordering::Acquire);
        let b = other.0.as_ref().group.load(Ordering::Acquire);
        a == b
    }
}

/// Implemented by payloads that hold links to other managed objects.
pub trait Visit {
    /// Report every currently-held outgoing link, once per held link.
    ///
    /// Must agree exactly with the [`link`](Handle::link)/
    /// [`unlink`](Handle::unlink) calls the payload's owner has made: the
    /// collector trusts this enumeration for both freeze partitioning and
    /// teardown.
    fn visit(&self, emit: &mut dyn FnMut(Handle));
}

/// Heap cell pairing the refcount header with the caller's payload.
///
/// The header sits first (`repr(C)`) so a header pointer and a cell pointer
/// coincide; that is what lets the intrusive group list thread through
/// arbitrary payload types.
#[repr(C)]
pub struct Managed<T: Visit> {
    base: RefCounted,
    value: T,
}

impl<T: Visit> Managed<T> {
    const VTABLE: VTable = VTable {
        visit: Self::visit_raw,
        free: Self::free_raw,
    };

    /// Allocates `value` as a fresh single-member group whose counter is 1,
    /// the sole ref being held by `owner`.
    #[track_caller]
    pub fn new(value: T, owner: Owner) -> Ptr<T> {
        let group = new_group_cell(1);
        let cell = Box::new(Managed {
            base: RefCounted {
                group: AtomicPtr::new(group.as_ptr()),
                next: AtomicPtr::new(std::ptr::null_mut()),
                vtable: &Self::VTABLE,
                individual: AtomicU32::new(1),
                frozen: AtomicBool::new(false),
            },
            value,
        });
        let raw = NonNull::from(Box::leak(cell));
        let base = raw.cast::<RefCounted>();
        // A fresh group's member list is the object alone.
        // SAFETY: `raw` was just allocated and is uniquely ours.
        unsafe {
            base.as_ref().next.store(base.as_ptr(), Ordering::Relaxed);
        }
        audit::on_new(Handle(base), owner);
        Ptr { raw }
    }

    unsafe fn visit_raw(obj: NonNull<RefCounted>, emit: &mut dyn FnMut(Handle)) {
        // SAFETY: `obj` is the base of a live Managed<T>; repr(C) puts the
        // header first so the pointers coincide.
        let cell = &*obj.as_ptr().cast::<Managed<T>>();
        cell.value.visit(emit);
    }

    unsafe fn free_raw(obj: NonNull<RefCounted>) {
        // SAFETY: called exactly once, after the object became unreachable.
        drop(Box::from_raw(obj.as_ptr().cast::<Managed<T>>()));
    }
}

/// Typed handle to a managed object. Like [`Handle`], `Copy` and
/// non-owning.
pub struct Ptr<T: Visit> {
    raw: NonNull<Managed<T>>,
}

impl<T: Visit> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Visit> Copy for Ptr<T> {}

impl<T: Visit> Ptr<T> {
    /// The untyped handle for graph operations.
    #[inline]
    pub fn handle(self) -> Handle {
        Handle(self.raw.cast::<RefCounted>())
    }

    /// Borrows the payload.
    ///
    /// # Safety
    ///
    /// The object must still be live, and the borrow must end before the
    /// last ref into its group is released.
    #[inline]
    pub unsafe fn value<'a>(self) -> &'a T {
        &(*self.raw.as_ptr()).value
    }
}

/// Debug-only check that a mutable group's counter equals the sum of its
/// members' individual counts. Call with the graph lock held and a live
/// handle.
pub(crate) fn group_is_balanced(handle: Handle) -> bool {
    // SAFETY: contract above; debug-only call sites inside mutable-path
    // operations satisfy both conditions.
    unsafe {
        let first = handle.0.as_ptr().cast_const();
        if (*first).frozen.load(Ordering::Relaxed) {
            return true;
        }
        let counter = (*(*first).group.load(Ordering::Relaxed)).load(Ordering::Relaxed);
        let mut sum: u64 = 0;
        let mut cursor = first;
        loop {
            sum += u64::from((*cursor).individual.load(Ordering::Relaxed));
            cursor = (*cursor).next.load(Ordering::Relaxed);
            if std::ptr::eq(cursor, first) {
                break;
            }
        }
        u64::from(counter) == sum
    }
}

/// Merges `target`'s group into `from`'s: every member of the target group
/// is repointed at the surviving counter, the counters are summed, and the
/// two circular lists are spliced by exchanging successors.
///
/// # Safety
///
/// Both handles live and mutable; graph lock held.
unsafe fn merge_groups(target: Handle, from: Handle) {
    let t = target.0.as_ref();
    let f = from.0.as_ref();
    let t_cell = t.group.load(Ordering::Relaxed);
    let f_cell = f.group.load(Ordering::Relaxed);
    if t_cell == f_cell {
        return;
    }

    let mut cursor = target.0.as_ptr().cast_const();
    loop {
        (*cursor).group.store(f_cell, Ordering::Relaxed);
        cursor = (*cursor).next.load(Ordering::Relaxed);
        if std::ptr::eq(cursor, target.0.as_ptr()) {
            break;
        }
    }

    let moved = (*t_cell).load(Ordering::Relaxed);
    (*f_cell).fetch_add(moved, Ordering::Relaxed);

    // Exchanging the successors of one node from each cycle concatenates
    // the cycles.
    let t_next = t.next.load(Ordering::Relaxed);
    let f_next = f.next.load(Ordering::Relaxed);
    t.next.store(f_next, Ordering::Relaxed);
    f.next.store(t_next, Ordering::Relaxed);

    tracing::trace!(moved_refs = moved, "merged mutable groups");

    // SAFETY: no member points at the old cell anymore.
    release_group_cell(NonNull::new_unchecked(t_cell));
}

/// Frees every member of `start`'s group: first every link leaving the
/// group is dropped (cascading through an explicit worklist so a deep chain
/// of dying groups cannot overflow the thread stack), then each member is
/// freed and the counter released.
///
/// Cross-group targets are always frozen — two *mutable* objects with a
/// link between them share a group by construction, and the frozen
/// condensation is acyclic — so the cascade can never revisit a group that
/// is already being torn down.
///
/// # Safety
///
/// `start`'s group counter must have just reached zero, with the graph lock
/// held if the group is mutable.
pub(crate) unsafe fn teardown_group(start: Handle) {
    let mut worklist = vec![start];
    while let Some(group) = worklist.pop() {
        let first = group.0.as_ptr().cast_const();
        let cell = (*first).group.load(Ordering::Acquire);

        let mut members: Vec<Handle> = Vec::new();
        let mut cursor = first;
        loop {
            members.push(Handle(NonNull::new_unchecked(cursor.cast_mut())));
            cursor = (*cursor).next.load(Ordering::Acquire);
            if std::ptr::eq(cursor, first) {
                break;
            }
        }

        for member in &members {
            let visit = member.0.as_ref().vtable.visit;
            visit(member.0, &mut |link_target: Handle| {
                // SAFETY: `visit` enumerates live link targets; closures do
                // not inherit the surrounding unsafe context.
                unsafe {
                    let t_hdr = link_target.0.as_ref();
                    let t_cell = t_hdr.group.load(Ordering::Acquire);
                    if std::ptr::eq(t_cell, cell) {
                        // Internal link; dies with the group.
                        return;
                    }
                    debug_assert!(
                        t_hdr.frozen.load(Ordering::Relaxed),
                        "cross-group link target must be frozen"
                    );
                    if (*t_cell).fetch_sub(1, Ordering::Release) == 1 {
                        fence(Ordering::Acquire);
                        worklist.push(link_target);
                    }
                }
            });
        }

        audit::on_free_group(&members);
        tracing::debug!(members = members.len(), "tearing down group");

        for member in &members {
            // Frozen collection works purely on the group counter, so the
            // stale individual counts only mean something for mutable
            // groups.
            debug_assert!(
                member.0.as_ref().frozen.load(Ordering::Relaxed)
                    || member.0.as_ref().individual.load(Ordering::Relaxed) == 0,
                "freeing a mutable object that still has external refs"
            );
            (member.0.as_ref().vtable.free)(member.0);
        }
        // SAFETY: every member pointing at the cell was just freed.
        release_group_cell(NonNull::new_unchecked(cell));
    }
}
