//! An in-memory IP routing store with compact lookup front-ends.
//!
//! The authoritative database is a PATRICIA trie ([`RadixLookup`]), holding
//! IPv4 and IPv6 prefixes with a (gateway, output port) pair interned behind
//! a small nexthop id. Longest-prefix-match lookups run in at most O(W)
//! time, where W is the width of the search key, and route updates are
//! cheap.
//!
//! Two derived engines trade memory for raw lookup speed, both IPv4-only:
//!
//! - [`DirectLookup`] expands the routing table into a 2^24-slot direct
//!   table with on-demand 256-slot secondary blocks, resolving any address
//!   in one, worst case two, dependent loads.
//! - [`DxrLookup`] compresses each /20-sized window of the address space
//!   into a run of (start, nexthop) ranges and binary-searches them. The
//!   lookup structure typically stays under 4 bytes per prefix for full
//!   BGP views, small enough to live in the CPU cache hierarchy.
//!
//! Both front-ends keep a trie underneath as the source of truth and
//! rebuild only the windows a route change touched, batched behind a short
//! delay. The rebuild walks the affected part of the trie and re-emits the
//! range runs, deduplicating identical runs across windows and compacting
//! the shared pool as holes open up.
//!
//! The store is a plain value: one writer mutates it, any number of
//! readers may share the published lookup tables. No locks are taken on
//! the query paths and they never allocate.

pub mod types;

mod direct;
mod dxr;
mod nexthop;
mod pending;
mod projector;
pub mod radix;
mod rib;

pub use crate::direct::DirectLookup;
pub use crate::dxr::{DxrLookup, DxrStats};
pub use crate::rib::{RadixLookup, RouteTable};
pub use crate::types::af::{AddressFamily, IPv4, IPv6};
pub use crate::types::errors::FibStoreError;
pub use crate::types::route::{NexthopId, Route};
