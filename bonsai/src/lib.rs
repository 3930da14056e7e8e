//! # Bonsai - paged link collections
//!
//! Bonsai stores large collections of record links inside disk-paged B+Trees
//! ("bonsai trees") that share bonsai files, and exposes them to a document
//! layer through two collection types.
//!
//! ## Key Features
//!
//! - **Bonsai trees**: fixed-size buckets carved out of 64 KiB pages, a system
//!   bucket per file with a free list, median splits and a root pointer that
//!   never moves
//! - **Tree handle cache**: reference counted, LRU evicted tree handles guarded
//!   by striped locks
//! - **Rid bags**: multisets of record links kept as pending deltas and applied
//!   to a tree when the enclosing atomic operation commits
//! - **Posting sets**: index posting lists that live in memory while small and
//!   in a bonsai tree once they grow
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bonsai::cache::TreeHandleCache;
//! use bonsai::config::BonsaiConfig;
//! use bonsai::ridbag::RidBag;
//! use bonsai::store::{AtomicOperation, SerializationContext, WriteCache};
//!
//! let config = BonsaiConfig::builder().thresholds(40, 20).build()?;
//! let cache = TreeHandleCache::new(WriteCache::new(&config)?);
//!
//! let mut bag = RidBag::new(cache.clone(), resolver);
//! bag.set_owner_cluster(7);
//! bag.add(&friend)?;
//!
//! let operation = AtomicOperation::new();
//! let header = bag.serialize(&SerializationContext::new(operation.clone()))?;
//! operation.commit(&cache)?;
//! ```
//!
//! ## Module Organization
//!
//! - [`cache`] - Tree handle cache and borrowed tree handles
//! - [`common`] - Record identities, locks, event bus and shared helpers
//! - [`config`] - Configuration and its builder
//! - [`errors`] - Error types and result definitions
//! - [`index`] - Embedded or tree backed posting sets and their codec
//! - [`ridbag`] - Rid bags, their iterators and change events
//! - [`store`] - Page stores, page files, write cache and atomic operations
//! - [`tree`] - Buckets and the bonsai tree

use std::thread::available_parallelism;

pub mod cache;
pub mod common;
pub mod config;
pub mod errors;
pub mod index;
pub mod ridbag;
pub mod store;
pub mod tree;

/// Returns the number of available CPU cores.
///
/// This function attempts to detect the number of available processors on the system.
/// If detection fails, it defaults to 1.
///
/// # Examples
///
/// ```rust
/// use bonsai::get_cpu_count;
///
/// assert!(get_cpu_count() > 0);
/// ```
pub fn get_cpu_count() -> usize {
    available_parallelism()
        .map(|p| p.get())
        .unwrap_or_else(|err| {
            log::warn!("Failed to detect available parallelism: {}. Defaulting to single thread.", err);
            1
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        colog::init();
    }

    #[test]
    fn test_get_cpu_count_positive() {
        let count = get_cpu_count();
        assert!(count > 0);
    }
}
