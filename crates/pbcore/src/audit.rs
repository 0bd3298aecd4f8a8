//! Tracked-ref audit layer (cargo feature `audit`).
//!
//! When enabled, every ref is attributed to its [`Owner`] together with the
//! call site that took it, and every link is recorded as an edge. Double
//! refs by the same owner, releases by non-owners and unlinks of absent
//! edges are asserted. Purely diagnostic: disabling the feature changes no
//! observable behavior, only removes the attribution.
//!
//! Refs taken with [`UNTRACKED`](crate::UNTRACKED) are counted like any
//! other ref by the graph itself but are never attributed here.

#[cfg(feature = "audit")]
mod imp {
    use std::collections::HashMap;
    use std::panic::Location;
    use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

    use crate::refcounted::{Handle, Owner, UNTRACKED};

    #[derive(Default)]
    struct ObjRecord {
        /// Owner → the call site that took the ref.
        refs: HashMap<Owner, &'static Location<'static>>,
        /// Outgoing edge multiset, keyed by referrer then target.
        links: HashMap<(Handle, Handle), usize>,
    }

    static TABLES: OnceLock<Mutex<HashMap<Handle, ObjRecord>>> = OnceLock::new();

    fn tables() -> MutexGuard<'static, HashMap<Handle, ObjRecord>> {
        TABLES
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[track_caller]
    pub(crate) fn on_new(obj: Handle, owner: Owner) {
        let mut t = tables();
        let record = t.entry(obj).or_default();
        if owner != UNTRACKED {
            record.refs.insert(owner, Location::caller());
        }
    }

    #[track_caller]
    pub(crate) fn on_retain(obj: Handle, owner: Owner) {
        if owner == UNTRACKED {
            return;
        }
        let mut t = tables();
        let record = t.entry(obj).or_default();
        let previous = record.refs.insert(owner, Location::caller());
        assert!(
            previous.is_none(),
            "owner {owner:?} already holds a ref on {obj:?} (taken at {})",
            previous.map_or("?", |l| l.file())
        );
    }

    pub(crate) fn on_release(obj: Handle, owner: Owner) {
        if owner == UNTRACKED {
            return;
        }
        let mut t = tables();
        let record = t.entry(obj).or_default();
        assert!(
            record.refs.remove(&owner).is_some(),
            "owner {owner:?} released {obj:?} without holding a ref"
        );
    }

    #[track_caller]
    pub(crate) fn on_transfer(obj: Handle, from: Owner, to: Owner) {
        let mut t = tables();
        let record = t.entry(obj).or_default();
        if from != UNTRACKED {
            assert!(
                record.refs.remove(&from).is_some(),
                "owner {from:?} donated a ref on {obj:?} it does not hold"
            );
        }
        let previous = record.refs.insert(to, Location::caller());
        assert!(
            previous.is_none(),
            "owner {to:?} already holds a ref on {obj:?}"
        );
    }

    pub(crate) fn on_link(target: Handle, from: Handle) {
        let mut t = tables();
        let record = t.entry(target).or_default();
        *record.links.entry((from, target)).or_insert(0) += 1;
    }

    pub(crate) fn on_unlink(target: Handle, from: Handle) {
        let mut t = tables();
        let record = t.entry(target).or_default();
        let count = record
            .links
            .get_mut(&(from, target))
            .unwrap_or_else(|| panic!("unlink of an absent edge {from:?} -> {target:?}"));
        *count -= 1;
        if *count == 0 {
            record.links.remove(&(from, target));
        }
    }

    pub(crate) fn on_free_group(members: &[Handle]) {
        let mut t = tables();
        for member in members {
            t.remove(member);
        }
    }

    pub(crate) fn check(obj: Handle, owner: Owner) {
        if owner == UNTRACKED {
            return;
        }
        let mut t = tables();
        let record = t.entry(obj).or_default();
        assert!(
            record.refs.contains_key(&owner),
            "owner {owner:?} holds no recorded ref on {obj:?}"
        );
    }
}

#[cfg(not(feature = "audit"))]
mod imp {
    use crate::refcounted::{Handle, Owner};

    #[inline(always)]
    pub(crate) fn on_new(_obj: Handle, _owner: Owner) {}

    #[inline(always)]
    pub(crate) fn on_retain(_obj: Handle, _owner: Owner) {}

    #[inline(always)]
    pub(crate) fn on_release(_obj: Handle, _owner: Owner) {}

    #[inline(always)]
    pub(crate) fn on_transfer(_obj: Handle, _from: Owner, _to: Owner) {}

    #[inline(always)]
    pub(crate) fn on_link(_target: Handle, _from: Handle) {}

    #[inline(always)]
    pub(crate) fn on_unlink(_target: Handle, _from: Handle) {}

    #[inline(always)]
    pub(crate) fn on_free_group(_members: &[Handle]) {}

    #[inline(always)]
    pub(crate) fn check(_obj: Handle, _owner: Owner) {}
}

pub(crate) use imp::{
    check, on_free_group, on_link, on_new, on_release, on_retain, on_transfer, on_unlink,
};
