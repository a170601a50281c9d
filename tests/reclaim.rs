//! Tests that values and entries actually come back: every allocation the
//! map takes ownership of must be dropped exactly once by the time the map
//! is gone and the epoch domain has flushed.

use petek::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A value that counts its drops into a shared counter.
struct Tracked {
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    fn new(drops: &Arc<AtomicUsize>) -> Self {
        Tracked {
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pumps the epoch domain until `drops` reaches `expected` or the attempt
/// budget runs out. Deferred destructors only run as the global epoch
/// advances, which takes a few pin/unpin cycles.
fn drain_until(drops: &Arc<AtomicUsize>, expected: usize) {
    for _ in 0..1000 {
        if drops.load(Ordering::SeqCst) == expected {
            return;
        }
        petek::pin().flush();
        std::thread::sleep(std::time::Duration::from_micros(100));
    }
}

#[test]
fn test_drop_frees_every_value() {
    let drops = Arc::new(AtomicUsize::new(0));

    let map = HashMap::new();
    {
        let guard = petek::pin();
        // enough entries to force growth, so values survive table transfers
        for i in 0..1000usize {
            map.insert(i, Tracked::new(&drops), &guard);
        }
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(map);
    drain_until(&drops, 1000);
    assert_eq!(drops.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_drop_without_growth_frees_every_value() {
    let drops = Arc::new(AtomicUsize::new(0));

    let map = HashMap::with_capacity(16).unwrap();
    {
        let guard = petek::pin();
        for i in 0..10usize {
            map.insert(i, Tracked::new(&drops), &guard);
        }
    }

    drop(map);
    drain_until(&drops, 10);
    assert_eq!(drops.load(Ordering::SeqCst), 10);
}

#[test]
fn test_replacement_frees_old_value() {
    let drops = Arc::new(AtomicUsize::new(0));

    let map = HashMap::new();
    {
        let guard = petek::pin();
        map.insert(1usize, Tracked::new(&drops), &guard);
        map.insert(1usize, Tracked::new(&drops), &guard);
    }

    // the displaced value is retired once no pin can still observe it
    drain_until(&drops, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    drop(map);
    drain_until(&drops, 2);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn test_remove_frees_value() {
    let drops = Arc::new(AtomicUsize::new(0));

    let map = HashMap::new();
    {
        let guard = petek::pin();
        map.insert(1usize, Tracked::new(&drops), &guard);
        assert!(map.remove(&1, &guard).is_some());
    }

    drain_until(&drops, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    drop(map);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rejected_insert_frees_discarded_value() {
    let drops = Arc::new(AtomicUsize::new(0));

    let map = HashMap::new();
    let guard = petek::pin();
    map.insert(1usize, Tracked::new(&drops), &guard);

    // the key is present, so the new value is discarded; it was never
    // published and is freed immediately, without a domain round trip
    assert!(map.insert_if_absent(1usize, Tracked::new(&drops), &guard).is_some());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_churn_reclaims_everything() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut created = 0usize;

    let map = HashMap::new();
    {
        let guard = petek::pin();
        for round in 0..10usize {
            for i in 0..200usize {
                map.insert(i, Tracked::new(&drops), &guard);
                created += 1;
            }
            if round % 2 == 0 {
                for i in (0..200usize).step_by(3) {
                    map.remove(&i, &guard);
                }
            }
        }
    }

    drop(map);
    drain_until(&drops, created);
    assert_eq!(drops.load(Ordering::SeqCst), created);
}
