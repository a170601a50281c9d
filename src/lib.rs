//! A concurrent hash map for read-heavy workloads.
//!
//! Reads are lock-free: a lookup pins the epoch-based reclamation domain,
//! hashes to a bin, and walks that bin's chain without ever blocking on a
//! writer. Writes lock only the single chain they touch, and an empty bin is
//! claimed with one compare-and-swap, no lock at all.
//!
//! When the map outgrows its table, the resize is cooperative: the table
//! doubles, and every thread that stumbles over an already-moved bin helps
//! migrate a range of the remaining bins before retrying its own operation.
//! Readers are never stalled by this; a moved bin holds a forwarding marker
//! that routes the lookup into the new table.
//!
//! Removed entries and replaced values are not freed in place. They are
//! retired to the epoch domain and reclaimed once every thread that could
//! still hold a reference has unpinned. This is why every access takes a
//! [`Guard`]: the guard is the pin, and references handed out live exactly
//! as long as it does.
//!
//! # Example
//!
//! ```rust
//! use petek::HashMap;
//! use std::sync::Arc;
//!
//! let map = Arc::new(HashMap::new());
//!
//! let writer = Arc::clone(&map);
//! std::thread::spawn(move || {
//!     let guard = petek::pin();
//!     writer.insert("ticks", 1, &guard);
//! })
//! .join()
//! .unwrap();
//!
//! let guard = petek::pin();
//! assert_eq!(map.get(&"ticks", &guard), Some(&1));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod error;
mod iter;
mod map;
mod node;
mod resize;
mod table;

pub use error::CapacityError;
pub use iter::{Iter, Keys, Values};
pub use map::HashMap;

pub use crossbeam_epoch::{pin, Guard};
