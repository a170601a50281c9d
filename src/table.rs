use crate::node::Bin;
use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

/// Fixed-length array of atomic bin slots.
///
/// A table is never resized in place. Growth allocates a fresh table of twice
/// the length and links it through the map's `next_table` field; the old one
/// is retired through the reclamation domain once every bin forwards.
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<Bin<K, V>>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(len: usize) -> Self {
        let mut bins = Vec::with_capacity(len);
        bins.resize_with(len, Atomic::null);
        Self {
            bins: bins.into_boxed_slice(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    /// Index of the bin for `hash`. The length is a power of two, so the
    /// mask keeps exactly the low bits.
    pub(crate) fn bini(&self, hash: u64) -> usize {
        let mask = self.bins.len() as u64 - 1;
        (hash & mask) as usize
    }

    pub(crate) fn bin<'g>(&'g self, i: usize, guard: &'g Guard) -> Shared<'g, Bin<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    /// Installs `new` only if bin `i` still holds `current`. Used for the
    /// uncontended empty-bin insert and for forwarding empty bins during a
    /// transfer; every other bin write goes through `store_bin` under the
    /// chain lock.
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g>(
        &'g self,
        i: usize,
        current: Shared<'_, Bin<K, V>>,
        new: Owned<Bin<K, V>>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, Bin<K, V>>, CompareExchangeError<'g, Bin<K, V>, Owned<Bin<K, V>>>> {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    pub(crate) fn store_bin<P: crossbeam_epoch::Pointer<Bin<K, V>>>(&self, i: usize, new: P) {
        self.bins[i].store(new, Ordering::Release)
    }

    /// Detaches and returns bin `i`, leaving it empty. Test scaffolding for
    /// tearing down hand-built tables that mix chains and markers.
    #[cfg(test)]
    pub(crate) fn take_bin<'g>(&'g self, i: usize, guard: &'g Guard) -> Shared<'g, Bin<K, V>> {
        self.bins[i].swap(Shared::null(), Ordering::AcqRel, guard)
    }

    /// Tears down every chain, freeing nodes and values immediately.
    ///
    /// Only callable with exclusive access (map teardown), when no concurrent
    /// reader can exist and deferral through the reclamation domain is
    /// unnecessary.
    pub(crate) fn drop_bins(&mut self) {
        // safety: we have &mut self, so no other thread holds a guard into
        // this table.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for bin in &self.bins[..] {
            let bin = bin.swap(Shared::null(), Ordering::Relaxed, guard);
            if bin.is_null() {
                continue;
            }

            // safety: the swap above made the bin unreachable, and no other
            // thread can be reading it.
            match *unsafe { bin.into_owned() }.into_box() {
                Bin::Forwarding(_) => {
                    // the map never tears down mid-resize, so a live table
                    // must not contain forwarding markers
                    debug_assert!(false, "forwarding marker outside an active resize");
                }
                Bin::Node(node) => {
                    // walk the chain, freeing each node and its value
                    let mut node = Some(node);
                    while let Some(n) = node {
                        let value = n.value.swap(Shared::null(), Ordering::Relaxed, guard);
                        // safety: unreachable as above, and values are never
                        // shared across chains.
                        drop(unsafe { value.into_owned() });

                        let next = n.next.swap(Shared::null(), Ordering::Relaxed, guard);
                        node = if next.is_null() {
                            None
                        } else {
                            // safety: unreachable as above.
                            match *unsafe { next.into_owned() }.into_box() {
                                Bin::Node(next) => Some(next),
                                Bin::Forwarding(_) => {
                                    unreachable!("forwarding marker linked into a chain")
                                }
                            }
                        };
                    }
                }
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // A table reaches Drop in one of two states: a current table whose
        // chains were already torn down by `drop_bins`, or a retired table in
        // which every bin forwards. Either way only marker allocations (if
        // any) remain to be freed; the chains they once held now hang off the
        // successor table.
        //
        // safety: a retired table is handed to the reclamation domain only
        // after it became unreachable from the map, and the domain delays the
        // actual drop past every pin that could still observe it.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for bin in &self.bins[..] {
            let bin = bin.swap(Shared::null(), Ordering::Relaxed, guard);
            if bin.is_null() {
                continue;
            }
            // safety: unreachable per the argument above.
            let bin = unsafe { bin.into_owned() };
            debug_assert!(
                matches!(*bin, Bin::Forwarding(_)),
                "dropped table with a live chain"
            );
            drop(bin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bini_masks_low_bits() {
        let table = Table::<usize, usize>::new(16);
        assert_eq!(table.bini(0), 0);
        assert_eq!(table.bini(15), 15);
        assert_eq!(table.bini(16), 0);
        assert_eq!(table.bini(0xdead_beef), 0xdead_beef & 15);
    }

    #[test]
    fn cas_bin_only_from_expected() {
        use crate::node::Node;
        use parking_lot::Mutex;

        let guard = &crossbeam_epoch::pin();
        let mut table = Table::<usize, usize>::new(1);

        let entry = |k: usize| {
            Owned::new(Bin::Node(Node {
                hash: k as u64,
                key: k,
                value: Atomic::new(k),
                next: Atomic::null(),
                lock: Mutex::new(()),
            }))
        };

        assert!(table.cas_bin(0, Shared::null(), entry(1), guard).is_ok());
        // the slot is no longer empty, so a second empty-slot cas must fail
        let failed = table.cas_bin(0, Shared::null(), entry(2), guard);
        let err = failed.unwrap_err();
        Bin::drop_unpublished(err.new);

        table.drop_bins();
    }
}
