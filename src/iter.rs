//! Iteration over a map that may be resizing underneath the iterator.
//!
//! The traverser walks the table it started from ("base" table) bin by bin.
//! When it meets a forwarding marker it descends into the successor table,
//! remembering where it was on an explicit stack of `(table, index, length)`
//! frames: a split bin's contents live at `index` and `index + old_len` in
//! the successor, so the sibling half is visited before popping back out.
//! Every key live for the whole traversal is yielded at least once, and no
//! key is yielded twice.

use crate::node::{Bin, Node};
use crate::table::Table;
use crossbeam_epoch::{Guard, Shared};
use std::sync::atomic::Ordering;

/// A saved position in an outer table, pushed when a forwarding marker is
/// followed into a successor table.
struct TableStack<'g, K, V> {
    length: usize,
    index: usize,
    table: &'g Table<K, V>,
    next: Option<Box<TableStack<'g, K, V>>>,
}

pub(crate) struct Traverser<'g, K, V> {
    /// Table currently being scanned; swapped for the successor when a
    /// forwarding marker is met.
    table: Option<&'g Table<K, V>>,
    /// Frames to return to after finishing a forwarded bin.
    stack: Option<Box<TableStack<'g, K, V>>>,
    /// Popped frames kept for reuse, so descending repeatedly does not
    /// reallocate.
    spare: Option<Box<TableStack<'g, K, V>>>,
    /// Node most recently yielded; its `next` continues the current chain.
    prev: Option<&'g Node<K, V>>,
    /// Next bin to scan in the current table.
    index: usize,
    /// Current bin index in the base table.
    base_index: usize,
    /// Bound (exclusive) on `base_index`.
    base_limit: usize,
    base_size: usize,
    guard: &'g Guard,
}

impl<'g, K, V> Traverser<'g, K, V> {
    pub(crate) fn new(table: Shared<'g, Table<K, V>>, guard: &'g Guard) -> Self {
        let (table, len) = if table.is_null() {
            (None, 0)
        } else {
            // safety: the table was loaded under `guard`; it is retired only
            // through the reclamation domain, which defers past our pin.
            let t = unsafe { table.deref() };
            (Some(t), t.len())
        };

        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            index: 0,
            base_index: 0,
            base_limit: len,
            base_size: len,
            guard,
        }
    }

    fn push_state(&mut self, table: &'g Table<K, V>, index: usize, length: usize) {
        let mut frame = match self.spare.take() {
            Some(mut f) => {
                self.spare = f.next.take();
                f
            }
            None => Box::new(TableStack {
                length: 0,
                index: 0,
                table,
                next: None,
            }),
        };
        frame.table = table;
        frame.index = index;
        frame.length = length;
        frame.next = self.stack.take();
        self.stack = Some(frame);
    }

    /// Advances past a finished bin of a forwarded table: first to the
    /// sibling half (`index + old_len`), then back out to the saved outer
    /// position once both halves are done.
    fn recover_state(&mut self, mut n: usize) {
        loop {
            let (length, index, table) = match self.stack {
                Some(ref frame) => (frame.length, frame.index, frame.table),
                None => break,
            };

            self.index += length;
            if self.index < n {
                // the sibling half is still pending
                return;
            }

            // both halves visited; restore the outer position
            n = length;
            self.index = index;
            self.table = Some(table);

            let mut popped = self.stack.take().expect("frame observed above");
            self.stack = popped.next.take();
            popped.next = self.spare.take();
            self.spare = Some(popped);
        }

        self.index += self.base_size;
        if self.index >= n {
            self.base_index += 1;
            self.index = self.base_index;
        }
    }
}

impl<'g, K, V> Iterator for Traverser<'g, K, V> {
    type Item = &'g Node<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let guard = self.guard;

        let mut e: Option<&'g Bin<K, V>> = None;
        if let Some(prev) = self.prev {
            let next = prev.next.load(Ordering::SeqCst, guard);
            if !next.is_null() {
                // safety: chain nodes are retired only once detached, and the
                // detaching swap happened no earlier than our pin; the domain
                // defers the free past every pin active at that time.
                e = Some(unsafe { next.deref() });
            }
        }

        loop {
            match e {
                Some(Bin::Node(node)) => {
                    self.prev = Some(node);
                    return Some(node);
                }
                Some(Bin::Forwarding(_)) => {
                    unreachable!("forwarding marker linked into a chain")
                }
                None => {}
            }

            let t = match self.table {
                Some(t) if self.base_index < self.base_limit && self.index < t.len() => t,
                _ => {
                    self.prev = None;
                    return None;
                }
            };
            let i = self.index;
            let n = t.len();

            let bin = t.bin(i, guard);
            if !bin.is_null() {
                // safety: the bin was published in a table protected by our
                // pin; even if a transfer swaps it out concurrently, the swap
                // retires it through the domain, which defers past our pin.
                let bin = unsafe { bin.deref() };
                if let Bin::Forwarding(next_table) = *bin {
                    // descend; the same index is revisited in the successor
                    // safety: see `Bin::Forwarding`'s validity argument.
                    self.table = Some(unsafe { &*next_table });
                    self.push_state(t, i, n);
                    e = None;
                    continue;
                }
                e = Some(bin);
            } else {
                e = None;
            }

            if self.stack.is_some() {
                self.recover_state(n);
            } else {
                self.index = i + self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            }
        }
    }
}

/// An iterator over a map's entries.
///
/// Returned by [`HashMap::iter`](crate::HashMap::iter).
pub struct Iter<'g, K, V> {
    pub(crate) traverser: Traverser<'g, K, V>,
    pub(crate) guard: &'g Guard,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.traverser.next()?;
        let value = node.value.load(Ordering::SeqCst, self.guard);
        // safety: a node's value is retired only after being swapped out of
        // the node, which cannot have happened before our pin; the domain
        // keeps it alive for at least the guard's lifetime.
        let value = unsafe { value.deref() };
        Some((&node.key, value))
    }
}

/// An iterator over a map's keys.
///
/// Returned by [`HashMap::keys`](crate::HashMap::keys).
pub struct Keys<'g, K, V> {
    pub(crate) traverser: Traverser<'g, K, V>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.traverser.next()?;
        Some(&node.key)
    }
}

/// An iterator over a map's values.
///
/// Returned by [`HashMap::values`](crate::HashMap::values).
pub struct Values<'g, K, V> {
    pub(crate) traverser: Traverser<'g, K, V>,
    pub(crate) guard: &'g Guard,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.traverser.next()?;
        let value = node.value.load(Ordering::SeqCst, self.guard);
        // safety: as for `Iter`.
        let value = unsafe { value.deref() };
        Some(value)
    }
}
