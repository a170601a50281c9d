use crate::table::Table;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::sync::atomic::Ordering;

/// One slot of a table.
///
/// An occupied slot holds the head of a node chain; once the slot's contents
/// have been transferred to a successor table it holds a forwarding marker
/// instead, permanently. An empty slot is a null `Shared`, so the two heap
/// shapes share a single tag check on the hot paths.
pub(crate) enum Bin<K, V> {
    /// Head of a chain of key/value nodes.
    Node(Node<K, V>),
    /// One-way tombstone: this slot's chain now lives in the successor table.
    ///
    /// The pointer stays valid for as long as the reader's pin: a forwarding
    /// marker is only installed while its target is reachable through the
    /// map's `next_table` (during the transfer) or `table` (after it), and
    /// the target is only retired at the end of a *later* resize, behind the
    /// same reclamation domain that protects this marker.
    Forwarding(*const Table<K, V>),
}

unsafe impl<K, V> Send for Bin<K, V>
where
    K: Send,
    V: Send,
    Node<K, V>: Send,
    Table<K, V>: Send,
{
}

unsafe impl<K, V> Sync for Bin<K, V>
where
    K: Sync,
    V: Sync,
    Node<K, V>: Sync,
    Table<K, V>: Sync,
{
}

impl<K, V> Bin<K, V> {
    /// Narrows to the node view.
    ///
    /// Callers use this once control flow has already excluded the
    /// forwarding case; it is a logic-only narrowing, not a safety boundary.
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let Bin::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    /// Frees a bin entry (and the value it carries) that was allocated for
    /// insertion but never published into a table.
    pub(crate) fn drop_unpublished(entry: Owned<Self>) {
        match *entry.into_box() {
            Bin::Node(node) => {
                // safety: the entry was never shared with another thread, so
                // nobody can hold a reference to it or to its value, and we
                // may free both without going through the reclamation domain.
                let guard = unsafe { crossbeam_epoch::unprotected() };
                let value = node.value.swap(Shared::null(), Ordering::Relaxed, guard);
                drop(unsafe { value.into_owned() });
            }
            Bin::Forwarding(_) => unreachable!("only chain nodes are staged for insertion"),
        }
    }

    /// Finds the node for `key` starting at this bin, crossing forwarding
    /// markers into successor tables as needed.
    pub(crate) fn find<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, Bin<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        match *self {
            Bin::Node(_) => {
                let mut bin = self;
                loop {
                    let n = bin
                        .as_node()
                        .expect("chain next pointers only link to nodes");

                    if n.hash == hash && n.key.borrow() == key {
                        return Shared::from(bin as *const _);
                    }
                    let next = n.next.load(Ordering::SeqCst, guard);
                    if next.is_null() {
                        return Shared::null();
                    }
                    // safety: a chain node is retired only after it has been
                    // detached from every next pointer, and the detaching
                    // swap happened no earlier than our pin. The reclamation
                    // domain defers the free past every pin active at that
                    // time, so the node outlives our guard.
                    bin = unsafe { next.deref() };
                }
            }
            Bin::Forwarding(next_table) => {
                // safety: we reached this marker through a table protected by
                // `guard`, so the successor it points at has not been retired
                // either (see the field's doc comment for the full argument).
                let mut table = unsafe { &*next_table };

                loop {
                    if table.len() == 0 {
                        return Shared::null();
                    }
                    let bini = table.bini(hash);
                    let bin = table.bin(bini, guard);
                    if bin.is_null() {
                        return Shared::null();
                    }
                    // safety: the table is protected by the guard, and so is
                    // every bin published in it.
                    let bin = unsafe { bin.deref() };

                    match *bin {
                        Bin::Node(_) => break bin.find(hash, key, guard),
                        Bin::Forwarding(next_table) => {
                            // safety: same argument, one generation deeper.
                            table = unsafe { &*next_table };
                            continue;
                        }
                    }
                }
            }
        }
    }
}

/// Key/value entry.
///
/// `hash` and `key` never change after construction; `value` and `next` are
/// the only mutable parts and are swapped atomically. The mutex is only
/// meaningful on a chain's head node, where it serializes every structural
/// mutation of the whole chain.
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<Bin<K, V>>,
    pub(crate) lock: Mutex<()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(hash: u64, key: usize, value: usize) -> Node<usize, usize> {
        Node {
            hash,
            key,
            value: Atomic::new(value),
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }

    fn drop_entry(entry: Bin<usize, usize>) {
        // chains do not drop their own values; park the entry in a throwaway
        // table and reuse its teardown path
        let mut table = Table::<usize, usize>::new(1);
        table.store_bin(0, Owned::new(entry));
        table.drop_bins();
    }

    #[test]
    fn find_chain_no_match() {
        let guard = &crossbeam_epoch::pin();
        let tail = Bin::Node(new_node(4, 5, 6));
        let head = new_node(1, 2, 3);
        head.next.store(Owned::new(tail), Ordering::SeqCst);
        let head = Bin::Node(head);
        assert!(head.find(1, &0, guard).is_null());
        drop_entry(head);
    }

    #[test]
    fn find_chain_head_match() {
        let guard = &crossbeam_epoch::pin();
        let entry = Bin::Node(new_node(1, 2, 3));
        assert_eq!(
            unsafe { entry.find(1, &2, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            2
        );
        drop_entry(entry);
    }

    #[test]
    fn find_chain_tail_match() {
        let guard = &crossbeam_epoch::pin();
        let tail = Bin::Node(new_node(4, 5, 6));
        let head = new_node(1, 2, 3);
        head.next.store(Owned::new(tail), Ordering::SeqCst);
        let head = Bin::Node(head);
        assert_eq!(
            unsafe { head.find(4, &5, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            5
        );
        drop_entry(head);
    }

    #[test]
    fn find_through_forwarding_empty_bin() {
        let guard = &crossbeam_epoch::pin();
        let table = &Table::<usize, usize>::new(1);
        let entry = Bin::<usize, usize>::Forwarding(table as *const _);
        assert!(entry.find(1, &2, guard).is_null());
    }

    #[test]
    fn find_through_forwarding_wrong_bin() {
        let guard = &crossbeam_epoch::pin();
        let table = &mut Table::<usize, usize>::new(2);
        table.store_bin(1, Owned::new(Bin::Node(new_node(1, 2, 3))));
        let entry = Bin::<usize, usize>::Forwarding(table as *const _);
        assert!(entry.find(0, &1, guard).is_null());
        table.drop_bins();
    }

    #[test]
    fn find_through_forwarding_match() {
        let guard = &crossbeam_epoch::pin();
        let table = &mut Table::<usize, usize>::new(1);
        table.store_bin(0, Owned::new(Bin::Node(new_node(1, 2, 3))));
        let entry = Bin::<usize, usize>::Forwarding(table as *const _);
        assert_eq!(
            unsafe { entry.find(1, &2, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            2
        );
        table.drop_bins();
    }

    #[test]
    fn find_through_chained_forwarding() {
        let guard = &crossbeam_epoch::pin();
        let mut newest = Table::<usize, usize>::new(1);
        newest.store_bin(0, Owned::new(Bin::Node(new_node(1, 2, 3))));
        let mid = Table::<usize, usize>::new(1);
        mid.store_bin(0, Owned::new(Bin::Forwarding(&newest as *const _)));
        let entry = Bin::<usize, usize>::Forwarding(&mid as *const _);
        assert_eq!(
            unsafe { entry.find(1, &2, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            2
        );
        // a fully-forwarded table frees its markers on drop
        drop(mid);
        newest.drop_bins();
    }
}
