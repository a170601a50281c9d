use crate::error::CapacityError;
use crate::iter::{Iter, Keys, Traverser, Values};
use crate::node::{Bin, Node};
use crate::resize::{resize_stamp, SizeCtl, MAX_RESIZERS, RESIZE_STAMP_SHIFT};
use crate::table::Table;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{
    atomic::{AtomicIsize, AtomicUsize, Ordering},
    Once,
};

/// The largest possible table capacity. Kept at `1 << 30` to match the
/// reference semantics this design is modeled on.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The default initial table capacity. Must be a power of two and at most
/// `MAXIMUM_CAPACITY`.
const DEFAULT_CAPACITY: usize = 16;

/// The load factor. Fixed at 0.75. Only construction-time sizing divides by
/// the floating point value; running thresholds are computed as `n - (n >> 2)`.
const LOAD_FACTOR: f64 = 0.75;

/// Minimum number of bins a helper claims per transfer step. Ranges are
/// subdivided so several threads can transfer in parallel, but never below
/// this bound, to keep helpers from contending on the transfer index.
const MIN_TRANSFER_STRIDE: isize = 16;

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

/// A concurrent hash map with lock-free reads and per-bin write locking.
///
/// Readers never block: `get` pins the reclamation domain, walks the bin it
/// hashes to, and follows forwarding markers across an in-flight resize.
/// Writers lock only the single chain they mutate. Resizes are cooperative:
/// any operation that runs into a forwarding marker helps move a range of
/// bins before retrying.
///
/// All entry references handed out are tied to a [`Guard`]; memory is
/// reclaimed through the epoch domain once no pin can still observe it.
///
/// # Examples
///
/// ```
/// use petek::HashMap;
///
/// let map = HashMap::new();
/// let guard = petek::pin();
///
/// map.insert(42, "hello", &guard);
/// map.insert(100, "world", &guard);
///
/// assert_eq!(map.get(&42, &guard), Some(&"hello"));
/// assert_eq!(map.remove(&100, &guard), Some(&"world"));
/// assert_eq!(map.get(&100, &guard), None);
/// ```
pub struct HashMap<K, V, S = RandomState> {
    /// The current table. Lazily allocated on first insert; length is always
    /// a power of two.
    table: Atomic<Table<K, V>>,

    /// The successor table; non-null only while a resize is running.
    next_table: Atomic<Table<K, V>>,

    /// The next bin index (plus one) still unclaimed by a transfer helper.
    transfer_index: AtomicIsize,

    /// Approximate number of live entries.
    count: AtomicUsize,

    /// The resize-control word; see [`crate::resize`] for the encoding.
    size_ctl: AtomicIsize,

    build_hasher: S,
}

impl<K, V> Default for HashMap<K, V, RandomState>
where
    K: Sync + Send + Clone + Hash + Eq,
    V: Sync + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> HashMap<K, V, RandomState>
where
    K: Sync + Send + Clone + Hash + Eq,
    V: Sync + Send,
{
    /// Creates a new, empty map with the default initial table capacity (16).
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    /// Creates a new, empty map sized to hold `n` elements without resizing.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `n` is zero; a zero capacity does not
    /// describe a usable table.
    pub fn with_capacity(n: usize) -> Result<Self, CapacityError> {
        Self::with_capacity_and_hasher(n, RandomState::new())
    }
}

impl<K, V, S: BuildHasher> HashMap<K, V, S> {
    /// Creates an empty map which uses `build_hasher` to hash keys, with the
    /// default initial capacity.
    ///
    /// Warning: a hasher is normally randomly seeded to resist collision
    /// attacks; supplying a deterministic one exposes that vector.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            count: AtomicUsize::new(0),
            size_ctl: AtomicIsize::new(0),
            build_hasher,
        }
    }

    /// Creates an empty map sized for `n` elements, hashing with
    /// `build_hasher`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `n` is zero.
    pub fn with_capacity_and_hasher(n: usize, build_hasher: S) -> Result<Self, CapacityError> {
        if n == 0 {
            return Err(CapacityError);
        }

        let map = Self::with_hasher(build_hasher);
        // table length such that n elements stay under the 0.75 threshold
        let size = (1.0 + (n as f64) / LOAD_FACTOR) as usize;
        let cap = std::cmp::min(MAXIMUM_CAPACITY, size.next_power_of_two());
        map.size_ctl.store(cap as isize, Ordering::Relaxed);
        Ok(map)
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Eq,
    V: Sync + Send,
    S: BuildHasher,
{
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Returns `true` if the map contains a value for `key`.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(key, guard).is_some()
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = self.table.load(Ordering::SeqCst, guard);
        if table.is_null() {
            return None;
        }

        // safety: the table was loaded under `guard`. A table is retired
        // only through the reclamation domain, which defers the free past
        // every pin active at retirement time — ours included.
        let table = unsafe { table.deref() };
        if table.len() == 0 {
            return None;
        }

        let h = self.hash(key);
        let bini = table.bini(h);
        let bin = table.bin(bini, guard);
        if bin.is_null() {
            return None;
        }

        // safety: the bin was published in a table protected by our pin. If
        // a concurrent transfer swaps it for a forwarding marker, the old
        // head is retired through the domain, which cannot free it until our
        // pin ends.
        let node = unsafe { bin.deref() }.find(h, key, guard);
        if node.is_null() {
            return None;
        }
        // safety: `find` only returns chain nodes, which are retired only
        // after detachment; detachment cannot precede our pin.
        let node = unsafe { node.deref() };
        Some(node.as_node().expect("find always returns a chain node"))
    }

    /// Returns a reference to the value mapped to `key`, or `None`.
    ///
    /// The reference is valid for the lifetime of `guard`; obtain one with
    /// [`pin`](crate::pin).
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let node = self.get_node(key, guard)?;

        let v = node.value.load(Ordering::SeqCst, guard);
        debug_assert!(!v.is_null(), "live chain node with a null value");
        // safety: the value is retired only after being swapped out of its
        // node, which cannot have happened before our pin; the domain keeps
        // it alive for at least the guard's lifetime.
        unsafe { v.as_ref() }
    }

    /// Returns the key-value pair for `key`, or `None`.
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let node = self.get_node(key, guard)?;

        let v = node.value.load(Ordering::SeqCst, guard);
        // safety: as in `get`.
        unsafe { v.as_ref() }.map(|v| (&node.key, v))
    }

    fn init_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: as in `get_node`.
            if !table.is_null() && unsafe { table.deref() }.len() != 0 {
                break table;
            }

            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // lost the initialization race; wait for the winner
                std::thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // we won the race and get to allocate
                let mut table = self.table.load(Ordering::SeqCst, guard);

                // safety: as in `get_node`.
                if table.is_null() || unsafe { table.deref() }.len() == 0 {
                    let n = if sc > 0 {
                        sc as usize
                    } else {
                        DEFAULT_CAPACITY
                    };
                    let new_table = Owned::new(Table::new(n));
                    table = new_table.into_shared(guard);
                    self.table.store(table, Ordering::SeqCst);
                    // next threshold: 3/4 n
                    let sc = n as isize - (n >> 2) as isize;
                    self.size_ctl.store(sc, Ordering::SeqCst);
                } else {
                    self.size_ctl.store(sc, Ordering::SeqCst);
                }
                break table;
            }
        }
    }

    /// Maps `key` to `value`, returning the previous value if the key was
    /// already present.
    ///
    /// The returned reference is valid for the lifetime of `guard`.
    #[inline]
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.put(key, value, false, guard)
    }

    /// Maps `key` to `value` only if the key is absent.
    ///
    /// Returns the existing value if there was one; in that case the map is
    /// unchanged and the supplied `value` is discarded.
    #[inline]
    pub fn insert_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.put(key, value, true, guard)
    }

    fn put<'g>(
        &'g self,
        key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let hash = self.hash(&key);

        let mut table = self.table.load(Ordering::SeqCst, guard);

        // the entry is staged up front so the empty-bin fast path is a
        // single CAS; if the operation ends up not publishing it, it is
        // freed through `drop_unpublished`
        let mut staged = Some(Owned::new(Bin::Node(Node {
            key,
            value: Atomic::new(value),
            hash,
            next: Atomic::null(),
            lock: Mutex::new(()),
        })));

        loop {
            // safety: see argument below for the !is_null case
            if table.is_null() || unsafe { table.deref() }.len() == 0 {
                table = self.init_table(guard);
                continue;
            }

            // safety: table is a valid pointer:
            //
            //  1. if it was read from `self.table`, we read it under `guard`
            //     and tables are only retired through the domain;
            //  2. if it was produced by `init_table`, either it was read the
            //     same way, or we allocated it ourselves and nothing can
            //     retire it before it becomes replaceable;
            //  3. if it came from `help_transfer`, it is the authoritative
            //     re-read of `self.next_table`/`self.table`, protected as in
            //     case 1.
            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let mut bin = t.bin(bini, guard);
            if bin.is_null() {
                // empty bin: one CAS publishes the entry, no lock taken
                match t.cas_bin(
                    bini,
                    Shared::null(),
                    staged.take().expect("staged entry is present until published"),
                    guard,
                ) {
                    Ok(_) => {
                        self.add_count(1, Some(0), guard);
                        guard.flush();
                        return None;
                    }
                    Err(changed) => {
                        debug_assert!(!changed.current.is_null());
                        staged = Some(changed.new);
                        bin = changed.current;
                    }
                }
            }

            // slow path: the bin is occupied
            //
            // safety: the bin was published in a table protected by our pin;
            // a concurrent swap retires the old head through the domain,
            // which defers past our pin.
            let key = &staged
                .as_ref()
                .expect("staged entry is present until published")
                .as_node()
                .expect("staged entries are chain nodes")
                .key;
            match *unsafe { bin.deref() } {
                Bin::Forwarding(next_table) => {
                    table = self.help_transfer(table, next_table, guard);
                }
                Bin::Node(ref head) if no_replacement && head.hash == hash && &head.key == key => {
                    // the key is already mapped and must not be replaced
                    let v = head.value.load(Ordering::SeqCst, guard);
                    let staged = staged.take().expect("staged entry is present until published");
                    Bin::drop_unpublished(staged);
                    // safety: as in `get`.
                    return Some(unsafe { v.deref() });
                }
                Bin::Node(ref head) => {
                    // structural chain mutation requires the head's lock
                    let head_lock = head.lock.lock();

                    // re-validate that this is still the head; a transfer or
                    // a head removal may have won the race
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    // the chain is ours now; readers may still be walking it

                    let mut bin_count = 1;
                    let mut p = bin;

                    let old_val = loop {
                        // safety: chain nodes are retired only after
                        // detachment under this same lock, so everything
                        // reachable from the validated head is live.
                        let n = unsafe { p.deref() }
                            .as_node()
                            .expect("chain next pointers only link to nodes");
                        if n.hash == hash && &n.key == key {
                            let current_value = n.value.load(Ordering::SeqCst, guard);

                            // safety: as in `get`.
                            let current_value = unsafe { current_value.deref() };

                            if no_replacement {
                                // key present: leave the map unchanged
                                let staged = staged
                                    .take()
                                    .expect("staged entry is present until published");
                                Bin::drop_unpublished(staged);
                            } else {
                                let staged = staged
                                    .take()
                                    .expect("staged entry is present until published");
                                let node = match *staged.into_box() {
                                    Bin::Node(node) => node,
                                    Bin::Forwarding(_) => {
                                        unreachable!("staged entries are chain nodes")
                                    }
                                };
                                // safety: the staged value was never shared.
                                let value = unsafe { node.value.into_owned() };
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);

                                // safety: now_garbage is the value we just
                                // swapped out, so (1) it is no longer
                                // reachable through any atomic field; (2) any
                                // thread still holding a reference read it
                                // before the swap, while pinned at an epoch
                                // no later than ours; (3) the domain will not
                                // free it until every such pin has ended.
                                unsafe { guard.defer_destroy(now_garbage) };
                            }
                            break Some(current_value);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            // end of chain: the key is absent, append
                            n.next.store(
                                staged.take().expect("staged entry is present until published"),
                                Ordering::SeqCst,
                            );
                            break None;
                        }
                        p = next;

                        bin_count += 1;
                    };
                    // release before the count update below; add_count may
                    // start a resize that locks this same chain
                    drop(head_lock);

                    if old_val.is_none() {
                        self.add_count(1, Some(bin_count), guard);
                    }
                    guard.flush();
                    return old_val;
                }
            }
        }
    }

    fn put_all<I: Iterator<Item = (K, V)>>(&self, iter: I, guard: &Guard) {
        for (key, value) in iter {
            self.put(key, value, false, guard);
        }
    }

    /// Joins an in-flight transfer if helper slots remain, and returns the
    /// table the caller should retry against.
    ///
    /// The container's `table`/`next_table` are re-read on every iteration
    /// rather than trusting `next_table` as read from the forwarding marker:
    /// under a cascaded second resize the marker's target may already be a
    /// *previous* generation, and only the container fields are
    /// authoritative.
    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        next_table: *const Table<K, V>,
        guard: &'g Guard,
    ) -> Shared<'g, Table<K, V>> {
        if table.is_null() || next_table.is_null() {
            return table;
        }

        let next_table = Shared::from(next_table);

        // safety: as in `get_node`; the marker's target is additionally
        // protected per the argument on `Bin::Forwarding`.
        let rs = resize_stamp(unsafe { table.deref() }.len()) << RESIZE_STAMP_SHIFT;

        while next_table == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || sc == rs + MAX_RESIZERS
                || sc == rs + 1
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                // the episode ended, or no helper slots / bin ranges remain
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    fn add_count(&self, n: isize, resize_hint: Option<usize>, guard: &Guard) {
        use std::cmp;
        let mut count = match n.cmp(&0) {
            cmp::Ordering::Greater => {
                let n = n as usize;
                self.count.fetch_add(n, Ordering::SeqCst) + n
            }
            cmp::Ordering::Less => {
                let n = n.unsigned_abs();
                self.count.fetch_sub(n, Ordering::SeqCst) - n
            }
            cmp::Ordering::Equal => self.count.load(Ordering::SeqCst),
        };

        // `None` means the caller does not want a resize considered (e.g.
        // removals only shrink the count)
        if resize_hint.is_none() {
            return;
        }

        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if (count as isize) < sc {
                // not at the next threshold yet
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                // the table will be initialized by some inserting thread
                break;
            }

            // safety: as in `get_node`.
            let n = unsafe { table.deref() }.len();
            if n >= MAXIMUM_CAPACITY {
                break;
            }

            let rs = resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                // a resize is running: join it if it is still the same
                // episode and helper slots remain
                if sc == rs + MAX_RESIZERS || sc == rs + 1 {
                    break;
                }
                let nt = self.next_table.load(Ordering::SeqCst, guard);
                if nt.is_null() {
                    break;
                }
                if self.transfer_index.load(Ordering::SeqCst) <= 0 {
                    break;
                }

                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.transfer(table, nt, guard);
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // we initiate: the +2 seeds the helper count at one (the
                // low half of the word holds 1 + active helpers)
                self.transfer(table, Shared::null(), guard);
            }

            // a further resize may already be warranted
            count = self.count.load(Ordering::SeqCst);
        }
    }

    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        mut next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) {
        // safety: as in `get_node`; additionally, a table under transfer is
        // reachable through `self.table` for the whole episode.
        let n = unsafe { table.deref() }.len();
        let ncpu = num_cpus();

        let stride = if ncpu > 1 { (n >> 3) / ncpu } else { n };
        let stride = std::cmp::max(stride as isize, MIN_TRANSFER_STRIDE);

        if next_table.is_null() {
            // we are initiating the resize
            let new_table = Owned::new(Table::new(n << 1));
            let now_garbage = self.next_table.swap(new_table, Ordering::SeqCst, guard);
            debug_assert!(
                now_garbage.is_null(),
                "two resize episodes active at once"
            );
            self.transfer_index.store(n as isize, Ordering::SeqCst);
            next_table = self.next_table.load(Ordering::Relaxed, guard);
        }

        // safety: as for `table` above.
        let next_n = unsafe { next_table.deref() }.len();

        let mut advance = true;
        let mut finishing = false;
        let mut i = 0;
        let mut bound = 0;
        loop {
            // claim a descending range of bins to transfer
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }

                let next_bound = if next_index > stride {
                    next_index - stride
                } else {
                    0
                };
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index;
                    advance = false;
                    break;
                }
            }

            if i < 0 || i as usize >= n || i as usize + n >= next_n {
                // no ranges left for us
                if finishing {
                    // only the last departing helper takes this branch
                    self.next_table.store(Shared::null(), Ordering::SeqCst);
                    let now_garbage = self.table.swap(next_table, Ordering::SeqCst, guard);
                    // safety: the old table is now unreachable going forward:
                    // (1) it is no longer reachable through `self.table` or
                    // `self.next_table`, and forwarding markers pointing *to*
                    // it exist only in still older tables, which new threads
                    // can no longer reach either (every search starts at
                    // `self.table`); (2) any thread still holding it read it
                    // before this swap, while pinned at an epoch no later
                    // than ours; (3) the domain will not free it until every
                    // such pin has ended.
                    unsafe { guard.defer_destroy(now_garbage) };
                    // new threshold: 3/4 of the doubled capacity
                    self.size_ctl
                        .store(((n as isize) << 1) - ((n as isize) >> 1), Ordering::SeqCst);
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                debug_assert!(
                    matches!(SizeCtl::decode(sc), SizeCtl::Resizing { .. }),
                    "transfer running without a resize episode"
                );
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if (sc - 2) != resize_stamp(n) << RESIZE_STAMP_SHIFT {
                        // other helpers are still transferring
                        return;
                    }

                    // we are the last helper: re-scan the table before
                    // committing the swap
                    finishing = true;
                    advance = true;
                    i = n as isize;
                }

                continue;
            }
            let i = i as usize;

            // safety: as in `get_node`; both tables stay reachable through
            // the container for the whole episode.
            let table = unsafe { table.deref() };
            let next_table = unsafe { next_table.deref() };

            let bin = table.bin(i, guard);
            if bin.is_null() {
                // an empty bin forwards directly
                advance = table
                    .cas_bin(
                        i,
                        Shared::null(),
                        Owned::new(Bin::Forwarding(next_table as *const _)),
                        guard,
                    )
                    .is_ok();
                continue;
            }

            // safety: the bin was published in a table protected by our pin;
            // a concurrent swap retires the old head through the domain.
            match *unsafe { bin.deref() } {
                Bin::Forwarding(_) => {
                    // already transferred by another helper
                    advance = true;
                }
                Bin::Node(ref head) => {
                    // splitting the chain is a structural mutation: lock it
                    let head_lock = head.lock.lock();

                    // re-validate that this is still the head
                    let current_head = table.bin(i, guard);
                    if current_head.as_raw() != bin.as_raw() {
                        continue;
                    }

                    // Split the chain by the new high-order bit. The longest
                    // suffix whose bit is constant (the "run") is linked into
                    // the new chain as-is; only nodes before the last bit
                    // flip are copied. Values are shared, never copied.
                    let mut run_bit = head.hash & n as u64;
                    let mut last_run = bin;
                    let mut p = bin;
                    loop {
                        // safety: chain nodes are retired only after their
                        // bin forwards (below), and we hold that bin's lock;
                        // everything reachable from the validated head is
                        // live.
                        let node = unsafe { p.deref() }
                            .as_node()
                            .expect("chain next pointers only link to nodes");
                        let next = node.next.load(Ordering::SeqCst, guard);

                        let b = node.hash & n as u64;
                        if b != run_bit {
                            run_bit = b;
                            last_run = p;
                        }

                        if next.is_null() {
                            break;
                        }
                        p = next;
                    }

                    let mut low_bin = Shared::null();
                    let mut high_bin = Shared::null();
                    if run_bit == 0 {
                        // the run ends up in the low half
                        low_bin = last_run;
                    } else {
                        // the run ends up in the high half
                        high_bin = last_run;
                    }

                    p = bin;
                    while p != last_run {
                        // safety: as for the run scan above.
                        let node = unsafe { p.deref() }
                            .as_node()
                            .expect("chain next pointers only link to nodes");

                        let link = if node.hash & n as u64 == 0 {
                            &mut low_bin
                        } else {
                            &mut high_bin
                        };

                        *link = Owned::new(Bin::Node(Node {
                            hash: node.hash,
                            key: node.key.clone(),
                            lock: Mutex::new(()),
                            value: node.value.clone(),
                            next: Atomic::from(*link),
                        }))
                        .into_shared(guard);

                        p = node.next.load(Ordering::SeqCst, guard);
                    }

                    next_table.store_bin(i, low_bin);
                    next_table.store_bin(i + n, high_bin);
                    table.store_bin(
                        i,
                        Owned::new(Bin::Forwarding(next_table as *const _)),
                    );

                    // every node before last_run was copied, so the originals
                    // are garbage; the run itself was reused, not copied
                    p = bin;
                    while p != last_run {
                        // safety: (1) the forwarding store above made these
                        // nodes unreachable — the only path to them was
                        // table[i]; (2) any thread still holding one read it
                        // before that store, while pinned at an epoch no
                        // later than ours; (3) the domain will not free them
                        // until every such pin has ended. Note the node's
                        // value is NOT freed here: the copied node shares it.
                        let next = unsafe { p.deref() }
                            .as_node()
                            .expect("chain next pointers only link to nodes")
                            .next
                            .load(Ordering::SeqCst, guard);
                        unsafe { guard.defer_destroy(p) };
                        p = next;
                    }

                    advance = true;

                    drop(head_lock);
                }
            }
        }
    }

    /// Removes `key` from the map, returning the value it mapped to, if any.
    ///
    /// The returned reference is valid for the lifetime of `guard`.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.hash(key);

        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                break;
            }

            // safety: as in `put`.
            let t = unsafe { table.deref() };
            if t.len() == 0 {
                break;
            }
            let i = t.bini(h);
            let bin = t.bin(i, guard);
            if bin.is_null() {
                break;
            }

            // safety: as in `put`.
            match *unsafe { bin.deref() } {
                Bin::Forwarding(next_table) => {
                    table = self.help_transfer(table, next_table, guard);
                }
                Bin::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    let mut old_val: Option<Shared<'g, V>> = None;

                    // re-validate that this is still the head
                    if t.bin(i, guard) != bin {
                        continue;
                    }

                    let mut e = bin;
                    let mut pred: Shared<'_, Bin<K, V>> = Shared::null();
                    loop {
                        // safety: chain nodes are retired only after
                        // detachment under this same lock, so everything
                        // reachable from the validated head is live.
                        let n = unsafe { e.deref() }
                            .as_node()
                            .expect("chain next pointers only link to nodes");
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == h && n.key.borrow() == key {
                            let ev = n.value.load(Ordering::SeqCst, guard);
                            old_val = Some(ev);

                            // splice the node out
                            if !pred.is_null() {
                                // safety: pred is a live chain node as above.
                                unsafe { pred.deref() }
                                    .as_node()
                                    .expect("chain next pointers only link to nodes")
                                    .next
                                    .store(next, Ordering::SeqCst);
                            } else {
                                t.store_bin(i, next);
                            }

                            // safety: the splice above made the node
                            // unreachable; (2) and (3) as in `put`.
                            unsafe { guard.defer_destroy(e) };
                            break;
                        }
                        pred = e;
                        if next.is_null() {
                            break;
                        } else {
                            e = next;
                        }
                    }
                    drop(head_lock);

                    if let Some(val) = old_val {
                        self.add_count(-1, None, guard);
                        // safety: the node holding this value was just made
                        // unreachable, and the value is reachable only
                        // through it; (2) and (3) as in `put`.
                        unsafe { guard.defer_destroy(val) };

                        // safety: as in `get`.
                        return unsafe { val.as_ref() };
                    }
                    break;
                }
            }
        }
        None
    }

    /// An iterator over the map's entries in arbitrary order, yielding
    /// `(&'g K, &'g V)`.
    ///
    /// Entries inserted or removed while the iterator lives may or may not
    /// be observed; every entry present for the iterator's whole lifetime is
    /// yielded exactly once.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, K, V> {
        let table = self.table.load(Ordering::SeqCst, guard);
        let traverser = Traverser::new(table, guard);
        Iter { traverser, guard }
    }

    /// An iterator over the map's keys in arbitrary order.
    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, K, V> {
        let table = self.table.load(Ordering::SeqCst, guard);
        let traverser = Traverser::new(table, guard);
        Keys { traverser }
    }

    /// An iterator over the map's values in arbitrary order.
    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        let table = self.table.load(Ordering::SeqCst, guard);
        let traverser = Traverser::new(table, guard);
        Values { traverser, guard }
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is approximate while writers are active: it is maintained
    /// with relaxed per-operation updates, not a snapshot.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Sync + Send + Clone + Eq + Hash,
    V: Sync + Send + PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let guard = epoch::pin();
        self.iter(&guard)
            .all(|(key, value)| other.get(key, &guard).map_or(false, |v| *value == *v))
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Sync + Send + Clone + Eq + Hash,
    V: Sync + Send + Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Debug for HashMap<K, V, S>
where
    K: Sync + Send + Clone + Debug + Eq + Hash,
    V: Sync + Send + Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = epoch::pin();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: we hold &mut self, and every reference handed out was tied
        // to a borrow of self, so no outstanding reference into the map can
        // exist. With exclusive ownership nothing needs deferral: chains are
        // walked and freed immediately.
        let guard = unsafe { epoch::unprotected() };

        assert!(
            self.next_table.load(Ordering::SeqCst, guard).is_null(),
            "map torn down mid-resize"
        );
        let table = self.table.swap(Shared::null(), Ordering::SeqCst, guard);
        if table.is_null() {
            // the table was never allocated
            return;
        }

        // safety: same argument, and the swap above makes us the sole owner.
        let mut table = unsafe { table.into_owned() }.into_box();
        table.drop_bins();
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Eq,
    V: Sync + Send,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let guard = epoch::pin();
        (*self).put_all(iter.into_iter(), &guard);
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for &HashMap<K, V, S>
where
    K: Sync + Send + Copy + Hash + Eq,
    V: Sync + Send + Copy,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<K, V> FromIterator<(K, V)> for HashMap<K, V, RandomState>
where
    K: Sync + Send + Clone + Hash + Eq,
    V: Sync + Send,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut iter = iter.into_iter();

        if let Some((key, value)) = iter.next() {
            // safety: we own the map; nothing accesses it concurrently yet.
            let guard = unsafe { epoch::unprotected() };

            let (lower, _) = iter.size_hint();
            let map = Self::with_capacity(lower.saturating_add(1))
                .expect("capacity of at least one");

            map.put(key, value, false, guard);
            map.put_all(iter, guard);
            map
        } else {
            Self::new()
        }
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Eq,
    V: Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let cloned = Self::with_hasher(self.build_hasher.clone());
        {
            let guard = epoch::pin();
            for (k, v) in self.iter(&guard) {
                cloned.insert(k.clone(), v.clone(), &guard);
            }
        }
        cloned
    }
}

/// Returns the number of physical CPUs (cached after the first call).
#[inline]
fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get_physical(), Ordering::Relaxed));

    NCPU.load(Ordering::Relaxed)
}

/// There is no way to write a regular `#[test]` that is expected *not* to
/// compile, but `compile_fail` doctests can express exactly that, so the
/// reference-lifetime contracts live here:
///
/// # No references outlive the map.
///
/// ```compile_fail
/// let guard = petek::pin();
/// let map = petek::HashMap::default();
/// let r = map.insert((), (), &guard);
/// drop(map);
/// drop(r);
/// ```
/// ```compile_fail
/// let guard = petek::pin();
/// let map = petek::HashMap::default();
/// let r = map.get(&(), &guard);
/// drop(map);
/// drop(r);
/// ```
/// ```compile_fail
/// let guard = petek::pin();
/// let map = petek::HashMap::default();
/// let r = map.remove(&(), &guard);
/// drop(map);
/// drop(r);
/// ```
/// ```compile_fail
/// let guard = petek::pin();
/// let map = petek::HashMap::default();
/// let r = map.iter(&guard).next();
/// drop(map);
/// drop(r);
/// ```
///
/// # No references outlive the guard.
///
/// ```compile_fail
/// let guard = petek::pin();
/// let map = petek::HashMap::default();
/// let r = map.insert((), (), &guard);
/// drop(guard);
/// drop(r);
/// ```
/// ```compile_fail
/// let guard = petek::pin();
/// let map = petek::HashMap::default();
/// let r = map.get(&(), &guard);
/// drop(guard);
/// drop(r);
/// ```
#[allow(dead_code)]
struct BorrowContracts;
