use std::net::IpAddr;
use std::time::{Duration, Instant};

use inetnum::addr::Prefix;
use log::debug;

use crate::pending::{PendingSet, UPDATE_DELAY};
use crate::projector::{project_chunk, Fragment, RangeHeap};
use crate::rib::{prefix_parts, Rib, RouteTable};
use crate::types::af::{AddressFamily, IPv4};
use crate::types::errors::FibStoreError;
use crate::types::route::{NexthopId, Route};

/// Chunk geometry: updates regenerate one /16-sized window at a time,
/// covering 256 primary slots.
const DIR_CHUNK_PREFLEN: u8 = 16;
const DIR_CHUNKS: u32 = 1 << DIR_CHUNK_PREFLEN;
const DIR_CHUNK_SHIFT: u8 = 32 - DIR_CHUNK_PREFLEN;
const DIR_CHUNK_MASK: u32 = (1 << DIR_CHUNK_SHIFT) - 1;

const SECONDARY_BITS: u8 = 8;
const SECONDARY_MASK: u64 = 0xff;
const PRIMARY_SIZE: usize = 1 << 24;
const SECONDARY_BLOCKS: u32 = 1 << 15;
const SECONDARY_SIZE: usize = (SECONDARY_BLOCKS as usize) << SECONDARY_BITS;

//------------ DirectLookup --------------------------------------------------

/// IPv4 routing lookup in one, worst case two, dependent memory loads.
///
/// The primary table has one 16-bit slot per /24. A slot either resolves
/// the whole /24 directly (top bit set, low 15 bits the nexthop id after
/// decoding with `^ 0xffff`) or indexes one of 2^15 secondary blocks of
/// 256 entries, one per address in the /24. Secondary blocks are managed
/// through an intrusive free list threaded through each block's first
/// slot.
///
/// A PATRICIA trie underneath stays authoritative; route changes mark the
/// /16-sized chunks they touch and the next `apply_pending` re-projects
/// each dirty chunk into table entries.
pub struct DirectLookup {
    rib: Rib<IPv4>,
    primary: Vec<u16>,
    secondary: Vec<u16>,
    secondary_used: u32,
    secondary_free_head: u16,
    heap: RangeHeap,
    frags: Vec<Fragment>,
    pending: PendingSet,
    last_update: Duration,
}

impl Default for DirectLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectLookup {
    pub fn new() -> Self {
        // Every /24 starts as a direct hit on the default nexthop:
        // 0xffff decodes to id 0.
        let primary = vec![0xffffu16; PRIMARY_SIZE];
        let mut secondary = vec![0u16; SECONDARY_SIZE];
        // Link all secondary blocks into the free list.
        for i in 0..SECONDARY_BLOCKS {
            secondary[(i as usize) << SECONDARY_BITS] = (i + 1) as u16;
        }
        DirectLookup {
            rib: Rib::new(),
            primary,
            secondary,
            secondary_used: 0,
            secondary_free_head: 0,
            heap: RangeHeap::new(),
            frags: Vec::new(),
            pending: PendingSet::new(DIR_CHUNKS),
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

    /// The number of route mutations waiting for an apply pass. The host
    /// arms its rebuild timer off this.
    pub fn updates_pending(&self) -> usize {
        self.pending.updates()
    }

    /// How long the host should let updates accumulate before applying.
    pub fn update_delay(&self) -> Duration {
        UPDATE_DELAY
    }

    pub fn secondary_used(&self) -> u32 {
        self.secondary_used
    }

    /// The table-side nexthop resolution: one primary load, plus one
    /// secondary load for /24s carrying more than one nexthop.
    #[inline]
    pub fn lookup_nexthop(&self, dst: u32) -> u16 {
        let pri = self.primary[(dst >> SECONDARY_BITS) as usize];
        if pri & 0x8000 != 0 {
            return pri ^ 0xffff;
        }
        self.secondary
            [((pri as usize) << SECONDARY_BITS) + (dst & 0xff) as usize]
    }

    fn schedule_update(&mut self, key: u32, plen: u8) {
        // Default route changes never touch the lookup tables.
        if plen == 0 {
            return;
        }
        let end = key | !u32::mask_from_len(plen);
        self.pending
            .mark(key >> DIR_CHUNK_SHIFT, end >> DIR_CHUNK_SHIFT);
    }

    /// Regenerate the table entries of one /16 chunk from the trie.
    fn update_chunk(&mut self, chunk: u32) -> Result<(), FibStoreError> {
        let first = chunk << DIR_CHUNK_SHIFT;
        let last = first | DIR_CHUNK_MASK;

        if project_chunk(
            &self.rib.trie,
            first,
            last,
            DIR_CHUNK_PREFLEN,
            false,
            &mut self.heap,
            &mut self.frags,
        )
        .is_err()
        {
            unreachable!("the wide format does not overflow");
        }

        // Release the secondary blocks held by the chunk's old entries.
        let slot0 = (chunk as usize) << SECONDARY_BITS;
        for i in slot0..slot0 + (1 << SECONDARY_BITS) {
            let pri = self.primary[i];
            if pri & 0x8000 == 0 {
                self.secondary[(pri as usize) << SECONDARY_BITS] =
                    self.secondary_free_head;
                self.secondary_free_head = pri;
                self.secondary_used -= 1;
            }
        }

        // Transform the range runs into table entries. The cursor is
        // widened so the run ending on 255.255.255.255 cannot wrap.
        for i in 0..self.frags.len() {
            let nh = self.frags[i].nexthop;
            let mut a = self.frags[i].start as u64;
            let run_end = match self.frags.get(i + 1) {
                Some(next) => next.start as u64 - 1,
                None => last as u64,
            };
            while a <= run_end {
                let slot = (a >> SECONDARY_BITS) as usize;
                if a & SECONDARY_MASK == 0 && (a | SECONDARY_MASK) <= run_end
                {
                    // The run covers the whole /24: direct hit.
                    self.primary[slot] = nh ^ 0xffff;
                    a += 1 << SECONDARY_BITS;
                } else {
                    if a & SECONDARY_MASK == 0 {
                        // First touch of a split /24: take a block off
                        // the free list.
                        if self.secondary_used == SECONDARY_BLOCKS {
                            self.abandon_chunk(chunk, a);
                            return Err(FibStoreError::OutOfCapacity);
                        }
                        let blk = self.secondary_free_head;
                        self.secondary_free_head = self.secondary
                            [(blk as usize) << SECONDARY_BITS];
                        self.secondary_used += 1;
                        self.primary[slot] = blk;
                    }
                    let blk = self.primary[slot] as usize;
                    self.secondary[(blk << SECONDARY_BITS)
                        + (a & SECONDARY_MASK) as usize] = nh;
                    a += 1;
                }
            }
        }
        Ok(())
    }

    /// Back out of a half-installed chunk after the secondary pool ran
    /// dry at address `fail_addr`: release the blocks this pass already
    /// allocated and leave the whole chunk resolving to the default, so
    /// no primary slot points at a free-listed block.
    fn abandon_chunk(&mut self, chunk: u32, fail_addr: u64) {
        let slot0 = (chunk as usize) << SECONDARY_BITS;
        let fail_slot = (fail_addr >> SECONDARY_BITS) as usize;
        for i in slot0..fail_slot {
            let pri = self.primary[i];
            if pri & 0x8000 == 0 {
                self.secondary[(pri as usize) << SECONDARY_BITS] =
                    self.secondary_free_head;
                self.secondary_free_head = pri;
                self.secondary_used -= 1;
            }
        }
        self.primary[slot0..slot0 + (1 << SECONDARY_BITS)].fill(0xffff);
    }
}

impl RouteTable for DirectLookup {
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
        self.rib.flush();
        self.primary.fill(0xffff);
        for i in 0..SECONDARY_BLOCKS {
            self.secondary[(i as usize) << SECONDARY_BITS] = (i + 1) as u16;
        }
        self.secondary_used = 0;
        self.secondary_free_head = 0;
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
                // Leave the failed chunk and everything after it dirty;
                // the trie stays authoritative.
                self.pending.put_back(chunks[i..].iter().copied());
                return Err(e);
            }
        }
        self.last_update = t_start.elapsed();
        debug!(
            "applied {} chunk updates in {:?}",
            chunks.len(),
            self.last_update
        );
        Ok(())
    }

    fn status(&self) -> String {
        let direct_size = std::mem::size_of::<u16>() * PRIMARY_SIZE;
        let secondary_size = (std::mem::size_of::<u16>()
            << SECONDARY_BITS)
            * self.secondary_used as usize;
        let direct_hits = self
            .primary
            .iter()
            .filter(|&&p| p & 0x8000 != 0)
            .count();

        let mut out = format!(
            "DirectLookup (DIR-{}-{}): {} prefixes, {} unique nexthops\n",
            24,
            SECONDARY_BITS,
            self.rib.trie.len(),
            self.rib.nexthops.len()
        );
        out.push_str(&format!(
            "Lookup tables: {} bytes direct, {} bytes secondary",
            direct_size, secondary_size
        ));
        if self.rib.trie.len() > 0 {
            let ratio10 =
                10 * (direct_size + secondary_size) / self.rib.trie.len();
            out.push_str(&format!(
                " ({}.{} bytes/prefix)\n",
                ratio10 / 10,
                ratio10 % 10
            ));
        } else {
            out.push('\n');
        }
        let ratio10 = 1000 * self.secondary_used as usize
            / SECONDARY_BLOCKS as usize;
        out.push_str(&format!(
            "Secondary table utilization: {}.{}% ({} / {})\n",
            ratio10 / 10,
            ratio10 % 10,
            self.secondary_used,
            SECONDARY_BLOCKS
        ));
        out.push_str(&format!(
            "Direct table resolves {}.{}% of IPv4 address space\n",
            direct_hits / (PRIMARY_SIZE / 100),
            (direct_hits / (PRIMARY_SIZE / 1000)) % 10
        ));
        out.push_str(&format!(
            "Last update duration: {}.{} ms\n",
            self.last_update.as_millis(),
            (self.last_update.as_micros() % 1000) / 100
        ));
        out
    }
}
