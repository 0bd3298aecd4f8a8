//! The mutable → frozen transition.
//!
//! Mutable grouping is a conservative over-approximation: any two objects
//! that ever linked share a group. Freeze is where the graph pays once,
//! O(V+E), for precision: an iterative Tarjan walk partitions everything
//! reachable from the roots into strongly-connected components, each SCC
//! becomes its own group, and from then on collection is exact and
//! lock-free.
//!
//! The walk happens in side tables; the graph itself is not touched until
//! every fallible step has succeeded, so a failed freeze leaves the graph
//! observationally unchanged.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::error::Error;
use crate::invariants::debug_assert_mutable_root;
use crate::refcounted::{
    graph_lock, new_group_cell, release_group_cell, teardown_group, GroupCell, Handle,
};

/// Objects reachable past this count abort the freeze.
const MAX_OBJECTS: u32 = 1 << 31;

/// Summary of a successful freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeStats {
    /// Objects frozen by this call.
    pub objects: usize,
    /// Groups (strongly-connected components) they were partitioned into.
    pub groups: usize,
    /// Deepest traversal depth reached.
    pub max_depth: u32,
}

struct NodeState {
    index: u32,
    lowlink: u32,
    on_stack: bool,
}

#[derive(Clone, Copy)]
struct DfsFrame {
    node: Handle,
    child: usize,
}

/// Freezes every object reachable via links from `roots`.
///
/// Each strongly-connected component of the reachable subgraph becomes one
/// frozen group whose counter is the sum of its members' external refs plus
/// one per link entering it from outside the component. Objects left behind
/// in the roots' old groups stay mutable; their counters are adjusted so
/// the mutable group-sum invariant still holds, and a leftover group whose
/// adjusted counter is zero is torn down on the spot.
///
/// Fails with [`Error::MaxDepth`] if the traversal nests deeper than
/// `max_depth` ([`DEFAULT_FREEZE_DEPTH`](crate::DEFAULT_FREEZE_DEPTH)
/// is a reasonable bound), and with [`Error::TooManyObjects`] past 2³¹
/// reachable objects. On any failure the graph is unchanged.
///
/// # Safety
///
/// Every root must refer to a live, mutable object, and no concurrent
/// mutable-graph operation may be in flight.
pub unsafe fn freeze(roots: &[Handle], max_depth: u32) -> Result<FreezeStats, Error> {
    let _g = graph_lock();

    // ---------------------------------------------------------------------
    // Phase 1: Tarjan over the mutable subgraph (read-only).
    // ---------------------------------------------------------------------

    let mut states: HashMap<Handle, NodeState> = HashMap::new();
    states
        .try_reserve(roots.len())
        .map_err(|_| Error::OutOfMemory)?;
    let mut adjacency: HashMap<Handle, Vec<Handle>> = HashMap::new();
    let mut tarjan: Vec<Handle> = Vec::new();
    let mut sccs: Vec<Vec<Handle>> = Vec::new();
    let mut scc_of: HashMap<Handle, usize> = HashMap::new();
    let mut dfs: Vec<DfsFrame> = Vec::new();
    let mut next_index: u32 = 0;
    let mut deepest: u32 = 0;

    for &root in roots {
        debug_assert_mutable_root!(root.0.as_ref().frozen.load(Ordering::Relaxed));
        if root.0.as_ref().frozen.load(Ordering::Relaxed) || states.contains_key(&root) {
            continue;
        }
        if max_depth == 0 {
            return Err(Error::MaxDepth { max: max_depth });
        }
        discover(root, &mut next_index, &mut states, &mut adjacency, &mut tarjan)?;
        dfs.push(DfsFrame { node: root, child: 0 });

        loop {
            deepest = deepest.max(dfs.len() as u32);
            let Some(frame) = dfs.last_mut() else { break };
            let node = frame.node;
            let child = frame.child;

            if let Some(&succ) = adjacency[&node].get(child) {
                frame.child += 1;
                match states.get(&succ) {
                    None => {
                        if dfs.len() as u32 >= max_depth {
                            return Err(Error::MaxDepth { max: max_depth });
                        }
                        discover(succ, &mut next_index, &mut states, &mut adjacency, &mut tarjan)?;
                        dfs.push(DfsFrame { node: succ, child: 0 });
                    }
                    Some(s) if s.on_stack => {
                        let succ_index = s.index;
                        if let Some(n) = states.get_mut(&node) {
                            n.lowlink = n.lowlink.min(succ_index);
                        }
                    }
                    Some(_) => {}
                }
            } else {
                dfs.pop();
                let (node_index, node_lowlink) = {
                    let s = &states[&node];
                    (s.index, s.lowlink)
                };
                if let Some(parent) = dfs.last() {
                    let parent_node = parent.node;
                    if let Some(p) = states.get_mut(&parent_node) {
                        p.lowlink = p.lowlink.min(node_lowlink);
                    }
                }
                if node_lowlink == node_index {
                    let scc_id = sccs.len();
                    let mut scc = Vec::new();
                    while let Some(member) = tarjan.pop() {
                        if let Some(s) = states.get_mut(&member) {
                            s.on_stack = false;
                        }
                        scc_of.insert(member, scc_id);
                        scc.push(member);
                        if member == node {
                            break;
                        }
                    }
                    sccs.push(scc);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Phase 2: count edges into each component (still read-only).
    // ---------------------------------------------------------------------

    // Links between components of this freeze act as external refs on the
    // target component; the condensation is a DAG, so teardown decrements
    // each exactly once.
    let mut incoming: Vec<u32> = vec![0; sccs.len()];
    for (node, succs) in &adjacency {
        let from_scc = scc_of[node];
        for succ in succs {
            let to_scc = scc_of[succ];
            if to_scc != from_scc {
                incoming[to_scc] += 1;
            }
        }
    }

    // Capture the old groups before any pointer is rewritten: members left
    // unreachable by this freeze stay mutable, and links they hold into the
    // frozen set also become external refs.
    let mut old_groups: HashMap<*mut GroupCell, Vec<Handle>> = HashMap::new();
    for node in states.keys() {
        let cell = node.0.as_ref().group.load(Ordering::Relaxed);
        if old_groups.contains_key(&cell) {
            continue;
        }
        let mut members = Vec::new();
        let first = node.0.as_ptr().cast_const();
        let mut cursor = first;
        loop {
            members.push(Handle(NonNull::new_unchecked(cursor.cast_mut())));
            cursor = (*cursor).next.load(Ordering::Relaxed);
            if std::ptr::eq(cursor, first) {
                break;
            }
        }
        old_groups.insert(cell, members);
    }

    for members in old_groups.values() {
        for member in members {
            if states.contains_key(member) {
                continue;
            }
            let visit = member.0.as_ref().vtable.visit;
            visit(member.0, &mut |target: Handle| {
                if let Some(&scc) = scc_of.get(&target) {
                    incoming[scc] += 1;
                }
            });
        }
    }

    // ---------------------------------------------------------------------
    // Phase 3: commit (infallible).
    // ---------------------------------------------------------------------

    let mut cells: Vec<NonNull<GroupCell>> = Vec::new();
    cells
        .try_reserve(sccs.len())
        .map_err(|_| Error::OutOfMemory)?;
    for (scc_id, scc) in sccs.iter().enumerate() {
        let ref1_sum: u32 = scc
            .iter()
            // SAFETY: members are live; closures do not inherit the
            // surrounding unsafe context.
            .map(|m| unsafe { m.0.as_ref().individual.load(Ordering::Relaxed) })
            .sum();
        cells.push(new_group_cell(ref1_sum + incoming[scc_id]));
    }

    for (scc_id, scc) in sccs.iter().enumerate() {
        let cell = cells[scc_id];
        for (k, member) in scc.iter().enumerate() {
            let hdr = member.0.as_ref();
            hdr.group.store(cell.as_ptr(), Ordering::Relaxed);
            let successor = scc[(k + 1) % scc.len()];
            hdr.next.store(successor.0.as_ptr(), Ordering::Relaxed);
        }
        for member in scc {
            member.0.as_ref().frozen.store(true, Ordering::Release);
        }
    }

    for (&old_cell, members) in &old_groups {
        let residual: Vec<Handle> = members
            .iter()
            .filter(|m| !states.contains_key(*m))
            .copied()
            .collect();
        if residual.is_empty() {
            // SAFETY: every former member now points at its SCC cell.
            release_group_cell(NonNull::new_unchecked(old_cell));
            continue;
        }
        let frozen_sum: u32 = members
            .iter()
            .filter(|m| states.contains_key(*m))
            // SAFETY: members are live.
            .map(|m| unsafe { m.0.as_ref().individual.load(Ordering::Relaxed) })
            .sum();
        for (k, member) in residual.iter().enumerate() {
            let successor = residual[(k + 1) % residual.len()];
            member.0.as_ref().next.store(successor.0.as_ptr(), Ordering::Relaxed);
        }
        let remaining = (*old_cell).fetch_sub(frozen_sum, Ordering::Relaxed) - frozen_sum;
        if remaining == 0 {
            // Nothing external holds the leftovers: the freeze just proved
            // they were garbage kept alive by conservative grouping.
            teardown_group(residual[0]);
        }
    }

    let stats = FreezeStats {
        objects: states.len(),
        groups: sccs.len(),
        max_depth: deepest,
    };
    tracing::debug!(
        objects = stats.objects,
        groups = stats.groups,
        max_depth = stats.max_depth,
        "froze graph"
    );
    Ok(stats)
}

/// Assigns a Tarjan index to `node` and snapshots its outgoing links into
/// the adjacency table. Targets that are already frozen are not traversed;
/// their refs were counted when the links were made.
fn discover(
    node: Handle,
    next_index: &mut u32,
    states: &mut HashMap<Handle, NodeState>,
    adjacency: &mut HashMap<Handle, Vec<Handle>>,
    tarjan: &mut Vec<Handle>,
) -> Result<(), Error> {
    if *next_index >= MAX_OBJECTS {
        return Err(Error::TooManyObjects);
    }
    let index = *next_index;
    *next_index += 1;
    states.insert(
        node,
        NodeState { index, lowlink: index, on_stack: true },
    );
    tarjan.push(node);

    let mut succs = Vec::new();
    // SAFETY: `node` is live — the caller's traversal reached it through
    // live links.
    let visit = unsafe { node.0.as_ref().vtable.visit };
    let mut collect = |target: Handle| {
        // SAFETY: `visit` reports live targets; closures do not inherit
        // the surrounding unsafe context.
        let frozen = unsafe { target.0.as_ref().frozen.load(Ordering::Relaxed) };
        if !frozen {
            succs.push(target);
        }
    };
    // SAFETY: as above.
    unsafe { visit(node.0, &mut collect) };
    adjacency.insert(node, succs);
    Ok(())
}
