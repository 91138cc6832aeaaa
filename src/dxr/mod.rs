//! The DXR lookup engine: binary search for the output port in a very
//! compact sorted array, aiming for high CPU cache hit ratios.
//!
//! The IPv4 space is cut into 2^20 chunks of 4096 addresses. Each chunk
//! either resolves directly from its 32-bit direct-table descriptor or
//! points at a run of (start, nexthop) fragments in a shared range pool,
//! stored in a half-size "short" layout whenever the chunk's geometry and
//! nexthops permit. Identical runs are shared between chunks by a
//! content-addressed allocator that also compacts the pool after updates.

mod chunk;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use inetnum::addr::Prefix;
use log::{debug, trace};

use crate::pending::{PendingSet, UPDATE_DELAY};
use crate::projector::{project_chunk, Fragment, RangeHeap};
use crate::rib::{prefix_parts, Rib, RouteTable};
use crate::types::af::{AddressFamily, IPv4};
use crate::types::errors::FibStoreError;
use crate::types::route::{NexthopId, Route};

use chunk::{ChunkDesc, ChunkStore, NIL};

/// D20R is the default sweetspot configuration.
const DXR_DIRECT_BITS: u8 = 20;
const DIRECT_TBL_SIZE: usize = 1 << DXR_DIRECT_BITS;
const DXR_RANGE_MASK: u32 = u32::MAX >> DXR_DIRECT_BITS;
const DXR_RANGE_SHIFT: u8 = 32 - DXR_DIRECT_BITS;

const DESC_BASE_BITS: u32 = 19;
const BASE_MAX: u32 = (1 << DESC_BASE_BITS) - 1;
const FRAG_BITS: u32 = 31 - DESC_BASE_BITS;
const LONG_FORMAT_BIT: u32 = 1 << FRAG_BITS;
const FRAG_MAX: u32 = LONG_FORMAT_BIT - 1;

//------------ DirectEntry ---------------------------------------------------

/// One bit-packed direct-table descriptor: `fragments` in the low 12
/// bits, the long-format flag above them, `base` in the high 19 bits.
/// `fragments == FRAG_MAX` marks a direct hit whose nexthop is stored in
/// `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirectEntry(u32);

impl DirectEntry {
    fn encode(base: u32, fragments: u32, long_format: bool) -> Self {
        debug_assert!(base <= BASE_MAX);
        debug_assert!(fragments <= FRAG_MAX);
        DirectEntry(
            fragments
                | (u32::from(long_format) << FRAG_BITS)
                | (base << (FRAG_BITS + 1)),
        )
    }

    fn direct_hit(nexthop: u16) -> Self {
        Self::encode(nexthop as u32, FRAG_MAX, false)
    }

    fn fragments(self) -> u32 {
        self.0 & FRAG_MAX
    }

    fn is_direct(self) -> bool {
        self.fragments() == FRAG_MAX
    }

    fn long_format(self) -> bool {
        self.0 & LONG_FORMAT_BIT != 0
    }

    fn base(self) -> u32 {
        self.0 >> (32 - DESC_BASE_BITS)
    }

    fn with_base(self, base: u32) -> Self {
        Self::encode(base, self.fragments(), self.long_format())
    }
}

//------------ Range pool entry coding ---------------------------------------

fn long_entry(start: u32, nexthop: u16) -> u32 {
    debug_assert!(start <= DXR_RANGE_MASK);
    (start << 16) | nexthop as u32
}

fn long_start(word: u32) -> u32 {
    word >> 16
}

fn long_nexthop(word: u32) -> u16 {
    word as u16
}

/// Two short entries pack into one pool word; `start` keeps only its
/// byte-granular top bits.
fn short_entry(start: u32, nexthop: u16) -> u32 {
    debug_assert_eq!(start & 0xff, 0);
    debug_assert!(nexthop <= 0xff);
    (((start & DXR_RANGE_MASK) >> 8) << 8) | nexthop as u32
}

//------------ ChunkRef ------------------------------------------------------

/// Per-chunk membership in a descriptor's sharing list.
#[derive(Debug, Clone, Copy)]
struct ChunkRef {
    desc: u32,
    next: u32,
}

impl ChunkRef {
    const NONE: ChunkRef = ChunkRef {
        desc: NIL,
        next: NIL,
    };
}

//------------ DxrStats ------------------------------------------------------

/// A snapshot of the engine's table accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DxrStats {
    /// Physically stored chunks per format.
    pub chunks_short: usize,
    pub chunks_long: usize,
    /// Fragments in physically stored chunks (short fragments counted
    /// individually, not per pool word).
    pub fragments_short: usize,
    pub fragments_long: usize,
    /// Chunks and fragments folded away by sharing.
    pub aggr_chunks_short: usize,
    pub aggr_chunks_long: usize,
    pub aggr_fragments_short: usize,
    pub aggr_fragments_long: usize,
    /// Pool words in use (the bump cursor).
    pub range_free: u32,
}

//------------ DxrLookup -----------------------------------------------------

/// IPv4 routing lookup through binary search in compact range tables.
///
/// Queries take one direct-table load; a chunk that is not a direct hit
/// adds a branch-lean binary search over its fragment run. Route updates
/// go to the PATRICIA trie underneath and mark the touched chunks; the
/// next [`apply_pending`](RouteTable::apply_pending) re-projects each
/// dirty chunk, shares identical runs and compacts the pool.
pub struct DxrLookup {
    rib: Rib<IPv4>,
    direct_tbl: Vec<DirectEntry>,
    range_tbl: Vec<u32>,
    range_free: u32,
    chunks: ChunkStore,
    cptbl: Vec<ChunkRef>,
    heap: RangeHeap,
    frags: Vec<Fragment>,
    stats: DxrStats,
    pending: PendingSet,
    last_update: Duration,
}

impl Default for DxrLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl DxrLookup {
    pub fn new() -> Self {
        DxrLookup {
            rib: Rib::new(),
            direct_tbl: vec![DirectEntry::direct_hit(0); DIRECT_TBL_SIZE],
            range_tbl: vec![0; BASE_MAX as usize + 1],
            range_free: 0,
            chunks: ChunkStore::new(),
            cptbl: vec![ChunkRef::NONE; DIRECT_TBL_SIZE],
            heap: RangeHeap::new(),
            frags: Vec::new(),
            stats: DxrStats::default(),
            pending: PendingSet::new(DIRECT_TBL_SIZE as u32),
            last_update: Duration::ZERO,
        }
    }

    /// Mark the engine live and run any apply deferred from boot-time
    /// configuration.
    pub fn initialize(&mut self) -> Result<(), FibStoreError> {
        self.pending.set_initialized();
        if !self.pending.is_empty() {
            self.apply_pending()
        } else {
            Ok(())
        }
    }

    /// The number of route mutations waiting for an apply pass.
    pub fn updates_pending(&self) -> usize {
        self.pending.updates()
    }

    /// How long the host should let updates accumulate before applying.
    pub fn update_delay(&self) -> Duration {
        UPDATE_DELAY
    }

    pub fn stats(&self) -> DxrStats {
        DxrStats {
            range_free: self.range_free,
            ..self.stats
        }
    }

    //--- query path --------------------------------------------------------

    /// Resolve an address to its nexthop id: one direct-table load, then
    /// for non-direct chunks an unrolled binary search for the largest
    /// fragment start at or below the masked key.
    #[inline]
    pub fn lookup_nexthop(&self, dst: u32) -> u16 {
        let de = self.direct_tbl[(dst >> DXR_RANGE_SHIFT) as usize];
        if de.is_direct() {
            return de.base() as u16;
        }
        let base = de.base() as usize;
        let mut masked = dst & DXR_RANGE_MASK;

        let mut lower = 0u32;
        let mut upper;
        let mut middle;
        if de.long_format() {
            upper = de.fragments();
            middle = upper / 2;
            for _ in 0..12 {
                if masked < long_start(self.range_tbl[base + middle as usize])
                {
                    upper = middle;
                    middle = (middle + lower) / 2;
                } else if masked
                    < long_start(
                        self.range_tbl[base + middle as usize + 1],
                    )
                {
                    lower = middle;
                    break;
                } else {
                    lower = middle + 1;
                    middle = (upper + middle + 1) / 2;
                }
                if upper == lower {
                    break;
                }
            }
            long_nexthop(self.range_tbl[base + lower as usize])
        } else {
            masked >>= 8;
            middle = de.fragments();
            upper = middle * 2 + 1;
            for _ in 0..8 {
                if masked < self.short_start(base, middle) {
                    upper = middle;
                    middle = (middle + lower) / 2;
                } else if masked < self.short_start(base, middle + 1) {
                    lower = middle;
                    break;
                } else {
                    lower = middle + 1;
                    middle = (upper + middle + 1) / 2;
                }
                if upper == lower {
                    break;
                }
            }
            self.short_half(base, lower) as u16 & 0xff
        }
    }

    #[inline]
    fn short_half(&self, base: usize, i: u32) -> u32 {
        let word = self.range_tbl[base + (i / 2) as usize];
        if i & 1 == 0 {
            word & 0xffff
        } else {
            word >> 16
        }
    }

    #[inline]
    fn short_start(&self, base: usize, i: u32) -> u32 {
        self.short_half(base, i) >> 8
    }

    //--- update machinery --------------------------------------------------

    fn schedule_update(&mut self, key: u32, plen: u8) {
        // Default route changes never touch the lookup structures.
        if plen == 0 {
            return;
        }
        let end = key | !u32::mask_from_len(plen);
        self.pending
            .mark(key >> DXR_RANGE_SHIFT, end >> DXR_RANGE_SHIFT);
    }

    /// Re-project one chunk from the trie, preferring the short format.
    fn update_chunk(&mut self, chunk: u32) -> Result<(), FibStoreError> {
        if !self.direct_tbl[chunk as usize].is_direct() {
            self.chunk_unref(chunk);
        }

        let first = chunk << DXR_RANGE_SHIFT;
        let last = first | DXR_RANGE_MASK;
        let short_ok = project_chunk(
            &self.rib.trie,
            first,
            last,
            DXR_DIRECT_BITS,
            true,
            &mut self.heap,
            &mut self.frags,
        )
        .is_ok();

        let res = if short_ok {
            self.install_short(chunk)
        } else {
            if project_chunk(
                &self.rib.trie,
                first,
                last,
                DXR_DIRECT_BITS,
                false,
                &mut self.heap,
                &mut self.frags,
            )
            .is_err()
            {
                unreachable!("the long format does not overflow");
            }
            self.install_long(chunk)
        };
        if res.is_err() {
            // The old allocation reference is gone; fall back to the
            // default so the chunk never points at recycled pool words.
            self.direct_tbl[chunk as usize] = DirectEntry::direct_hit(0);
        }
        res
    }

    fn install_short(&mut self, chunk: u32) -> Result<(), FibStoreError> {
        if self.frags.len() == 1 {
            self.direct_tbl[chunk as usize] =
                DirectEntry::direct_hit(self.frags[0].nexthop);
            return Ok(());
        }

        // The counter tracks fragments - 1, like the stored field. An
        // even value means an odd number of 16-bit entries: duplicate the
        // last one so the pool stays 32-bit aligned.
        let mut raw = (self.frags.len() - 1) as u32;
        if raw & 1 == 0 {
            let dup = *self.frags.last().expect("at least two fragments");
            self.frags.push(dup);
            raw += 1;
        }
        let words = (raw >> 1) + 1;
        if self.range_free + words > self.range_tbl.len() as u32 {
            return Err(FibStoreError::OutOfCapacity);
        }

        let base = self.range_free;
        for (i, f) in self.frags.iter().enumerate() {
            let half = short_entry(f.start & DXR_RANGE_MASK, f.nexthop);
            let word =
                &mut self.range_tbl[(base + (i as u32 >> 1)) as usize];
            if i & 1 == 0 {
                *word = half;
            } else {
                *word |= half << 16;
            }
        }

        self.direct_tbl[chunk as usize] =
            DirectEntry::encode(base, raw >> 1, false);
        self.stats.chunks_short += 1;
        self.stats.fragments_short += raw as usize + 1;
        self.range_free += words;
        self.chunk_ref(chunk);
        Ok(())
    }

    fn install_long(&mut self, chunk: u32) -> Result<(), FibStoreError> {
        if self.frags.len() == 1 {
            self.direct_tbl[chunk as usize] =
                DirectEntry::direct_hit(self.frags[0].nexthop);
            return Ok(());
        }

        let raw = (self.frags.len() - 1) as u32;
        if raw >= FRAG_MAX {
            // FRAG_MAX is the direct-hit sentinel; a fuller chunk cannot
            // be described.
            return Err(FibStoreError::OutOfCapacity);
        }
        let words = raw + 1;
        if self.range_free + words > self.range_tbl.len() as u32 {
            return Err(FibStoreError::OutOfCapacity);
        }

        let base = self.range_free;
        for (i, f) in self.frags.iter().enumerate() {
            self.range_tbl[base as usize + i] =
                long_entry(f.start & DXR_RANGE_MASK, f.nexthop);
        }

        self.direct_tbl[chunk as usize] =
            DirectEntry::encode(base, raw, true);
        self.stats.chunks_long += 1;
        self.stats.fragments_long += raw as usize + 1;
        self.range_free += words;
        self.chunk_ref(chunk);
        Ok(())
    }

    //--- the chunk-sharing allocator ---------------------------------------

    /// Hash over the packed fragment words, mixing in the stored count.
    fn chunk_hash(&self, fdesc: DirectEntry) -> u32 {
        let base = fdesc.base() as usize;
        let mut hash = fdesc.fragments();
        for &w in
            &self.range_tbl[base..=base + fdesc.fragments() as usize]
        {
            hash = (hash << 1)
                .wrapping_add(hash >> 1)
                .wrapping_add(w);
        }
        hash.wrapping_add(hash >> 16)
    }

    /// Account the freshly written chunk with the allocator: fold it onto
    /// an identical allocation when one exists, otherwise finalize it in
    /// a recycled or new descriptor.
    fn chunk_ref(&mut self, chunk: u32) {
        let fdesc = self.direct_tbl[chunk as usize];
        let hash = self.chunk_hash(fdesc);
        let base = fdesc.base();
        let size = fdesc.fragments() + 1;

        // Find an already existing chunk descriptor.
        let mut i = self.chunks.bucket_head(hash);
        while i != NIL {
            let d = *self.chunks.desc(i);
            if d.hash == hash
                && d.cur_size == size
                && self.range_tbl
                    [d.base as usize..(d.base + size) as usize]
                    == self.range_tbl
                        [base as usize..(base + size) as usize]
            {
                self.chunks.desc_mut(i).refcount += 1;
                self.direct_tbl[chunk as usize] = fdesc.with_base(d.base);
                if fdesc.long_format() {
                    self.stats.aggr_chunks_long += 1;
                    self.stats.aggr_fragments_long += size as usize;
                    self.stats.chunks_long -= 1;
                    self.stats.fragments_long -= size as usize;
                } else {
                    self.stats.aggr_chunks_short += 1;
                    self.stats.aggr_fragments_short += (size as usize) << 1;
                    self.stats.chunks_short -= 1;
                    self.stats.fragments_short -= (size as usize) << 1;
                }
                self.range_free -= size;
                // Link the chunk into the sharing list.
                self.cptbl[chunk as usize] = ChunkRef {
                    desc: i,
                    next: self.chunks.desc(i).chunk_first,
                };
                self.chunks.desc_mut(i).chunk_first = chunk;
                trace!("chunk {:#x} shares descriptor {}", chunk, i);
                return;
            }
            i = self.chunks.link_next(i);
        }

        // No matching chunk found. Recycle the best-fitting unused
        // descriptor or allocate a fresh one at the bump cursor.
        let mut best = NIL;
        let mut u = self.chunks.unused_head;
        while u != NIL {
            let d = self.chunks.desc(u);
            if d.max_size >= size
                && (best == NIL
                    || d.max_size < self.chunks.desc(best).max_size)
            {
                best = u;
                if self.chunks.desc(best).max_size == size {
                    break;
                }
            }
            u = self.chunks.link_next(u);
        }

        let cdp = if best != NIL {
            // Copy from the bump area into the recycled allocation.
            let dbase = self.chunks.desc(best).base;
            self.range_tbl.copy_within(
                base as usize..(base + size) as usize,
                dbase as usize,
            );
            self.direct_tbl[chunk as usize] = fdesc.with_base(dbase);
            self.range_free -= size;
            let max = self.chunks.desc(best).max_size;
            if max > size {
                // Split off the trailing remainder as a new hole.
                let rem = self
                    .chunks
                    .alloc(ChunkDesc::unused(dbase + size, max - size));
                self.chunks.all_insert_before(best, rem);
                self.chunks.unused_insert_after(best, rem);
                self.chunks.desc_mut(best).max_size = size;
            }
            self.chunks.unused_remove(best);
            best
        } else {
            let d = self.chunks.alloc(ChunkDesc::unused(base, size));
            self.chunks.all_insert_head(d);
            d
        };

        let dm = self.chunks.desc_mut(cdp);
        dm.hash = hash;
        dm.refcount = 1;
        dm.cur_size = size;
        dm.chunk_first = chunk;
        self.cptbl[chunk as usize] = ChunkRef {
            desc: cdp,
            next: NIL,
        };
        self.chunks.bucket_insert(cdp);
    }

    /// Drop a chunk's reference to its allocation. The last reference
    /// moves the descriptor onto the unused list and coalesces it with
    /// adjacent holes.
    fn chunk_unref(&mut self, chunk: u32) {
        let fdesc = self.direct_tbl[chunk as usize];
        let mut cdp = self.cptbl[chunk as usize].desc;
        debug_assert_ne!(cdp, NIL, "unref of an unaccounted chunk");
        let size = fdesc.fragments() + 1;

        self.chunks.desc_mut(cdp).refcount -= 1;
        if self.chunks.desc(cdp).refcount > 0 {
            if fdesc.long_format() {
                self.stats.aggr_fragments_long -= size as usize;
                self.stats.aggr_chunks_long -= 1;
            } else {
                self.stats.aggr_fragments_short -= (size as usize) << 1;
                self.stats.aggr_chunks_short -= 1;
            }
            // Unlink the chunk from the sharing list.
            if self.chunks.desc(cdp).chunk_first == chunk {
                self.chunks.desc_mut(cdp).chunk_first =
                    self.cptbl[chunk as usize].next;
            } else {
                let mut i = self.chunks.desc(cdp).chunk_first;
                while self.cptbl[i as usize].next != chunk {
                    i = self.cptbl[i as usize].next;
                }
                self.cptbl[i as usize].next =
                    self.cptbl[chunk as usize].next;
            }
            self.cptbl[chunk as usize] = ChunkRef::NONE;
            return;
        }

        self.chunks.bucket_remove(cdp);
        self.chunks.desc_mut(cdp).chunk_first = NIL;
        self.chunks.desc_mut(cdp).cur_size = 0;
        self.cptbl[chunk as usize] = ChunkRef::NONE;

        // Keep unused chunks sorted with ascending base indices.
        self.chunks.unused_insert_sorted(cdp);

        // Merge with the lower-base neighbour when both are holes and
        // contiguous in the pool.
        let lower = self.chunks.all_next(cdp);
        if lower != NIL && self.chunks.link_next(lower) == cdp {
            self.chunks.unused_remove(cdp);
            self.chunks.all_remove(cdp);
            let grown = self.chunks.desc(cdp).max_size;
            self.chunks.free(cdp);
            self.chunks.desc_mut(lower).max_size += grown;
            cdp = lower;
        }
        // And with the higher-base neighbour.
        let upper = self.chunks.link_next(cdp);
        if upper != NIL && self.chunks.all_next(upper) == cdp {
            self.chunks.unused_remove(upper);
            self.chunks.all_remove(upper);
            let grown = self.chunks.desc(upper).max_size;
            self.chunks.free(upper);
            self.chunks.desc_mut(cdp).max_size += grown;
        }

        if fdesc.long_format() {
            self.stats.chunks_long -= 1;
            self.stats.fragments_long -= size as usize;
        } else {
            self.stats.chunks_short -= 1;
            self.stats.fragments_short -= (size as usize) << 1;
        }
    }

    /// Compact the range pool: slide live allocations down over every
    /// hole, patch descriptor bases and the direct-table entries of all
    /// referencing chunks, and drop the hole descriptors. Afterwards no
    /// unused descriptor remains.
    fn prune_empty_chunks(&mut self) {
        loop {
            let u = self.chunks.unused_head;
            if u == NIL {
                break;
            }
            let ubase = self.chunks.desc(u).base;
            let usize_ = self.chunks.desc(u).max_size;
            let from = ubase + usize_;
            let to = ubase;

            let next_unused = self.chunks.link_next(u);
            let (len, walk_start) = if next_unused != NIL {
                // Another hole above: move the live span between them
                // and let the upper hole absorb this one.
                let len = self.chunks.desc(next_unused).base - from;
                self.chunks.desc_mut(next_unused).max_size += usize_;
                (len, next_unused)
            } else {
                let head = self.chunks.all_head;
                if head != u {
                    // Topmost hole is this one, live data above it.
                    let len = self.range_free - from;
                    self.range_free -= usize_;
                    (len, head)
                } else {
                    // The hole is the top of the pool: plain reclaim.
                    self.range_free -= usize_;
                    self.chunks.all_remove(u);
                    self.chunks.unused_remove(u);
                    self.chunks.free(u);
                    break;
                }
            };

            self.range_tbl.copy_within(
                from as usize..(from + len) as usize,
                to as usize,
            );

            // Walk the allocation list down to the hole, rebasing every
            // descriptor and the chunks referencing it.
            let mut c = walk_start;
            loop {
                self.chunks.desc_mut(c).base -= usize_;
                let mut ch = self.chunks.desc(c).chunk_first;
                while ch != NIL {
                    let de = self.direct_tbl[ch as usize];
                    if !de.is_direct() {
                        self.direct_tbl[ch as usize] =
                            de.with_base(de.base() - usize_);
                    }
                    ch = self.cptbl[ch as usize].next;
                }
                c = self.chunks.all_next(c);
                if c == u {
                    break;
                }
            }

            self.chunks.all_remove(u);
            self.chunks.unused_remove(u);
            self.chunks.free(u);
        }
        debug_assert_eq!(self.chunks.unused_head, NIL);
    }
}

impl RouteTable for DxrLookup {
    fn add_route(&mut self, route: &Route) -> Result<(), FibStoreError> {
        if !route.prefix.is_v4() || !route.gw.is_ipv4() {
            return Err(FibStoreError::Malformed(1));
        }
        let (key, plen) = prefix_parts::<IPv4>(&route.prefix);
        let gw = IPv4::from_ipaddr(route.gw);
        self.rib.add(key, plen, gw, route.port)?;
        self.schedule_update(key, plen);
        Ok(())
    }

    fn remove_route(&mut self, prefix: &Prefix) -> Result<(), FibStoreError> {
        if !prefix.is_v4() {
            return Err(FibStoreError::NotFound);
        }
        let (key, plen) = prefix_parts::<IPv4>(prefix);
        self.rib.remove(key, plen)?;
        self.schedule_update(key, plen);
        Ok(())
    }

    fn lookup(&self, addr: IpAddr) -> (i32, IpAddr) {
        match addr {
            IpAddr::V4(a) => {
                let nh = NexthopId(self.lookup_nexthop(u32::from(a)));
                (
                    self.rib.nexthops.port(nh),
                    self.rib.nexthops.gw(nh).into_ipaddr(),
                )
            }
            IpAddr::V6(_) => {
                (-1, IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED))
            }
        }
    }

    fn flush(&mut self) {
        // A projector pass over 2^20 chunks would only rediscover that
        // everything is default; reset the derived state wholesale.
        self.rib.flush();
        self.direct_tbl.fill(DirectEntry::direct_hit(0));
        self.range_free = 0;
        self.chunks.clear();
        self.cptbl.fill(ChunkRef::NONE);
        self.stats = DxrStats::default();
        self.pending.clear();
    }

    fn dump_routes(&self) -> String {
        let mut out = String::new();
        self.rib.dump_into(&mut out);
        out
    }

    fn apply_pending(&mut self) -> Result<(), FibStoreError> {
        if !self.pending.initialized() {
            // Deferred until initialize() runs.
            return Ok(());
        }
        let t_start = Instant::now();
        let chunks: Vec<u32> = self.pending.take().iter().collect();
        for (i, &chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.update_chunk(chunk) {
                self.pending.put_back(chunks[i..].iter().copied());
                return Err(e);
            }
        }
        self.prune_empty_chunks();
        self.last_update = t_start.elapsed();
        debug!(
            "applied {} chunk updates in {:?}",
            chunks.len(),
            self.last_update
        );
        Ok(())
    }

    fn status(&self) -> String {
        let direct_size =
            std::mem::size_of::<DirectEntry>() * DIRECT_TBL_SIZE;
        let range_size =
            std::mem::size_of::<u32>() * self.range_free as usize;
        let mut max_chunk = 0;
        let mut c = self.chunks.all_head;
        while c != NIL {
            max_chunk = max_chunk.max(self.chunks.desc(c).cur_size);
            c = self.chunks.all_next(c);
        }
        let direct_hits =
            self.direct_tbl.iter().filter(|e| e.is_direct()).count();

        let mut out = format!(
            "DxrLookup (D{}R): {} prefixes, {} unique nexthops\n",
            DXR_DIRECT_BITS,
            self.rib.trie.len(),
            self.rib.nexthops.len()
        );
        out.push_str(&format!(
            "Lookup tables: {} bytes direct, {} bytes range",
            direct_size, range_size
        ));
        if self.rib.trie.len() > 0 {
            let ratio10 =
                10 * (direct_size + range_size) / self.rib.trie.len();
            out.push_str(&format!(
                " ({}.{} bytes/prefix)\n",
                ratio10 / 10,
                ratio10 % 10
            ));
        } else {
            out.push('\n');
        }
        out.push_str(&format!(
            "Direct table resolves {}.{}% of IPv4 address space\n",
            100 * direct_hits / DIRECT_TBL_SIZE,
            (1000 * direct_hits / DIRECT_TBL_SIZE) % 10
        ));
        out.push_str(&format!(
            "Longest range chunk contains {} fragments\n",
            max_chunk
        ));
        out.push_str(&format!(
            "Physical chunks: {} short, {} long\n",
            self.stats.chunks_short, self.stats.chunks_long
        ));
        out.push_str(&format!(
            "Physical fragments: {} short, {} long\n",
            self.stats.fragments_short, self.stats.fragments_long
        ));
        out.push_str(&format!(
            "Aggregated chunks: {} short, {} long\n",
            self.stats.aggr_chunks_short + self.stats.chunks_short,
            self.stats.aggr_chunks_long + self.stats.chunks_long
        ));
        out.push_str(&format!(
            "Aggregated fragments: {} short, {} long\n",
            self.stats.aggr_fragments_short + self.stats.fragments_short,
            self.stats.aggr_fragments_long + self.stats.fragments_long
        ));
        out.push_str(&format!(
            "Last update duration: {}.{} ms\n",
            self.last_update.as_millis(),
            (self.last_update.as_micros() % 1000) / 100
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_route_spec;
    use std::str::FromStr;

    fn route(spec: &str) -> Route {
        parse_route_spec(spec, 1).unwrap()
    }

    fn engine(specs: &[&str]) -> DxrLookup {
        let mut t = DxrLookup::new();
        t.configure(specs).unwrap();
        t.initialize().unwrap();
        t
    }

    fn nh_of(t: &DxrLookup, addr: &str) -> u16 {
        t.lookup_nexthop(u32::from(
            std::net::Ipv4Addr::from_str(addr).unwrap(),
        ))
    }

    /// Accounting identities: every non-direct chunk holds one
    /// descriptor reference, and the bump cursor equals the live words.
    fn check_accounting(t: &DxrLookup) {
        let nondirect = t
            .direct_tbl
            .iter()
            .filter(|e| !e.is_direct())
            .count();
        let mut refs = 0;
        let mut live_words = 0;
        let mut c = t.chunks.all_head;
        while c != NIL {
            let d = t.chunks.desc(c);
            refs += d.refcount as usize;
            live_words += d.max_size;
            c = t.chunks.all_next(c);
        }
        assert_eq!(refs, nondirect);
        assert_eq!(live_words, t.range_free);
    }

    #[test]
    fn test_basic_lookup() {
        let t = engine(&["10.0.0.0/8 1", "10.1.0.0/16 2"]);
        assert_eq!(t.lookup("10.0.0.1".parse().unwrap()).0, 1);
        assert_eq!(t.lookup("10.1.2.3".parse().unwrap()).0, 2);
        assert_eq!(t.lookup("11.0.0.1".parse().unwrap()).0, -1);
        check_accounting(&t);
    }

    #[test]
    fn test_covering_chunk_is_direct_hit() {
        // A /20-aligned route covers its chunk entirely: direct hit, no
        // pool use.
        let t = engine(&["192.168.0.0/20 7"]);
        let de = t.direct_tbl[0xc0a80];
        assert!(de.is_direct());
        assert_ne!(de.base(), 0);
        assert_eq!(t.stats().range_free, 0);
        assert_eq!(nh_of(&t, "192.168.0.1"), de.base() as u16);
        assert_eq!(t.lookup("192.168.15.255".parse().unwrap()).0, 7);
    }

    #[test]
    fn test_partial_chunk_uses_short_format() {
        // A /24 splits its chunk: route then default remainder.
        let t = engine(&["192.168.0.0/24 7"]);
        let de = t.direct_tbl[0xc0a80];
        assert!(!de.is_direct());
        assert!(!de.long_format());
        let s = t.stats();
        assert_eq!(s.chunks_short, 1);
        assert_eq!(s.chunks_long, 0);
        assert_eq!(t.lookup("192.168.0.99".parse().unwrap()).0, 7);
        assert_eq!(t.lookup("192.168.1.0".parse().unwrap()).0, -1);
        check_accounting(&t);
    }

    #[test]
    fn test_sub_byte_routes_use_long_format() {
        let t = engine(&["10.0.0.64/26 1"]);
        let de = t.direct_tbl[0x0a000];
        assert!(!de.is_direct());
        assert!(de.long_format());
        assert_eq!(nh_of(&t, "10.0.0.63"), 0);
        assert_eq!(t.lookup("10.0.0.64".parse().unwrap()).0, 1);
        assert_eq!(t.lookup("10.0.0.127".parse().unwrap()).0, 1);
        assert_eq!(nh_of(&t, "10.0.0.128"), 0);
        check_accounting(&t);
    }

    #[test]
    fn test_lookup_matches_trie_everywhere() {
        let mut t = engine(&[
            "0.0.0.0/0 99",
            "10.0.0.0/8 1",
            "10.0.0.0/20 2",
            "10.0.4.0/22 3",
            "10.0.5.64/26 4",
            "10.0.255.255/32 5",
            "172.16.0.0/12 6",
            "192.168.0.0/24 7",
            "192.168.0.128/25 8",
        ]);
        t.apply_pending().unwrap();
        // Probe boundaries of every route plus neighbours.
        let mut probes: Vec<u32> = Vec::new();
        t.rib.trie.walk(&mut |e| {
            let end = e.end();
            probes.extend([
                e.key,
                e.key.wrapping_sub(1),
                e.key + 1,
                end,
                end.wrapping_sub(1),
                end.wrapping_add(1),
            ]);
            crate::radix::WalkDirective::Continue
        });
        for addr in probes {
            let want = t
                .rib
                .trie
                .match_addr(addr)
                .map(|e| e.nexthop.0)
                .unwrap_or(0);
            assert_eq!(
                t.lookup_nexthop(addr),
                want,
                "addr {:#010x}",
                addr
            );
        }
        check_accounting(&t);
    }

    #[test]
    fn test_identical_chunks_share_descriptor() {
        // Two non-adjacent chunks with the same relative fragment
        // pattern {(0, a), (0x40, b), (0x80, a)} end up refcounting one
        // descriptor.
        let t = engine(&[
            "10.0.0.0/20 1",
            "10.0.0.64/26 2",
            "11.0.0.0/20 1",
            "11.0.0.64/26 2",
        ]);
        let da = t.direct_tbl[0x0a000];
        let db = t.direct_tbl[0x0b000];
        assert!(!da.is_direct() && !db.is_direct());
        assert_eq!(da.base(), db.base());
        let desc = t.cptbl[0x0a000].desc;
        assert_eq!(desc, t.cptbl[0x0b000].desc);
        assert_eq!(t.chunks.desc(desc).refcount, 2);
        let s = t.stats();
        assert_eq!(s.chunks_long, 1);
        assert_eq!(s.aggr_chunks_long, 1);
        check_accounting(&t);

        // Both resolve identically.
        assert_eq!(t.lookup("10.0.0.100".parse().unwrap()).0, 2);
        assert_eq!(t.lookup("11.0.0.100".parse().unwrap()).0, 2);
        assert_eq!(t.lookup("10.0.0.200".parse().unwrap()).0, 1);
    }

    #[test]
    fn test_mass_insert_remove_drains_pool() {
        // 1024 host routes with distinct nexthops over 10.0.0.0/22, then
        // remove them all: the pool must drain completely.
        let mut t = engine(&[]);
        let mut specs = Vec::new();
        for i in 0..1024u32 {
            let addr = 0x0a00_0000 + i;
            specs.push(format!(
                "{}/32 10.9.{}.{} {}",
                std::net::Ipv4Addr::from(addr),
                i >> 8,
                i & 0xff,
                i + 1
            ));
        }
        for s in &specs {
            t.add_route(&route(s)).unwrap();
        }
        t.apply_pending().unwrap();
        assert_eq!(nh_of(&t, "10.0.2.0"), 513);
        let s = t.stats();
        assert!(s.chunks_long > 0);
        check_accounting(&t);

        for s in &specs {
            let pfx = s.split_whitespace().next().unwrap();
            t.remove_route(&Prefix::from_str(pfx).unwrap()).unwrap();
        }
        t.apply_pending().unwrap();
        let s = t.stats();
        assert_eq!(s.range_free, 0);
        assert_eq!(s.chunks_short, 0);
        assert_eq!(s.chunks_long, 0);
        assert_eq!(s.fragments_short, 0);
        assert_eq!(s.fragments_long, 0);
        assert_eq!(nh_of(&t, "10.0.2.0"), 0);
        check_accounting(&t);
    }

    #[test]
    fn test_pool_compaction_rebases_chunks() {
        // Three distinct long chunks, then free the middle one: the
        // prune pass must slide the upper chunk down and keep lookups
        // exact.
        let mut t = engine(&[
            "10.0.0.64/26 1",
            "11.0.0.64/26 2",
            "12.0.0.64/26 3",
        ]);
        check_accounting(&t);
        let before = t.range_free;

        t.remove_route(&Prefix::from_str("11.0.0.64/26").unwrap())
            .unwrap();
        t.apply_pending().unwrap();
        assert!(t.range_free < before);
        check_accounting(&t);
        assert_eq!(t.lookup("10.0.0.65".parse().unwrap()).0, 1);
        assert_eq!(t.lookup("11.0.0.65".parse().unwrap()).0, -1);
        assert_eq!(t.lookup("12.0.0.65".parse().unwrap()).0, 3);
    }

    #[test]
    fn test_add_remove_idempotent() {
        let mut t = engine(&["10.0.0.0/8 1", "192.168.0.0/24 7"]);
        let direct_before = t.direct_tbl.clone();
        let range_before =
            t.range_tbl[..t.range_free as usize].to_vec();

        t.add_route(&route("10.64.0.0/10 9")).unwrap();
        t.apply_pending().unwrap();
        t.remove_route(&Prefix::from_str("10.64.0.0/10").unwrap())
            .unwrap();
        t.apply_pending().unwrap();

        assert_eq!(t.direct_tbl, direct_before);
        assert_eq!(
            &t.range_tbl[..t.range_free as usize],
            &range_before[..]
        );
        check_accounting(&t);
    }

    #[test]
    fn test_default_route_change_marks_nothing() {
        let mut t = engine(&["10.0.0.0/8 1"]);
        t.add_route(&route("0.0.0.0/0 1.2.3.4 3")).unwrap();
        assert_eq!(t.updates_pending(), 0);
        assert_eq!(
            t.lookup("11.0.0.1".parse().unwrap()),
            (3, "1.2.3.4".parse().unwrap())
        );
        // The direct table still records a default hit for 11/8 space.
        assert_eq!(nh_of(&t, "11.0.0.1"), 0);
    }

    #[test]
    fn test_flush_resets_everything() {
        let mut t = engine(&[
            "10.0.0.0/8 1",
            "10.0.0.64/26 2",
            "192.168.0.0/24 7",
        ]);
        assert!(t.stats().range_free > 0);
        t.flush();
        let s = t.stats();
        assert_eq!(s.range_free, 0);
        assert_eq!(s.chunks_short + s.chunks_long, 0);
        assert_eq!(t.lookup("10.0.0.65".parse().unwrap()).0, -1);
        assert_eq!(nh_of(&t, "10.0.0.65"), 0);

        // Reinsertion after flush behaves like a fresh engine.
        t.control("add 10.0.0.0/8 1\nadd 10.0.0.64/26 2\n").unwrap();
        assert_eq!(t.lookup("10.0.0.65".parse().unwrap()).0, 2);
        check_accounting(&t);
    }

    #[test]
    fn test_deferred_boot_apply() {
        let mut t = DxrLookup::new();
        t.configure(&["10.0.0.0/8 1"]).unwrap();
        assert_eq!(t.lookup("10.0.0.1".parse().unwrap()).0, -1);
        t.initialize().unwrap();
        assert_eq!(t.lookup("10.0.0.1".parse().unwrap()).0, 1);
    }
}
