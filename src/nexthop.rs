use log::trace;

use crate::types::af::AddressFamily;
use crate::types::errors::FibStoreError;
use crate::types::route::NexthopId;

/// Upper bound on interned (gateway, port) pairs per address family,
/// including the reserved default slot.
pub(crate) const VPORTS_MAX: usize = 8192;

const NONE: u16 = u16::MAX;

//------------ NexthopPool ---------------------------------------------------

/// Interns (gateway, output port) pairs into small integer ids.
///
/// Slot 0 is reserved for the default route and never reference counted
/// through [`acquire`](NexthopPool::acquire)/[`release`](NexthopPool::release);
/// it is written directly when a 0/0 route comes or goes. All other slots
/// carry a refcount and sit on one of two intrusive, index-based lists: the
/// allocated list that `acquire` scans for an existing match, and the free
/// list of recycled ids.
#[derive(Debug)]
pub(crate) struct NexthopPool<AF: AddressFamily> {
    tbl: Vec<Nexthop<AF>>,
    /// First never-used slot; the table only grows until `VPORTS_MAX`.
    tbl_size: usize,
    /// Head of the allocated list.
    head: u16,
    /// Head of the recycled-id list.
    empty_head: u16,
    /// Live entry count, excluding slot 0.
    nexthops: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Nexthop<AF> {
    pub gw: AF,
    pub port: i32,
    refcount: u32,
    ll_next: u16,
    ll_prev: u16,
}

impl<AF: AddressFamily> NexthopPool<AF> {
    pub(crate) fn new() -> Self {
        let mut tbl = Vec::with_capacity(16);
        // Slot 0 is the default route: no gateway, discard port. Its
        // refcount must stay zero.
        tbl.push(Nexthop {
            gw: AF::zero(),
            port: -1,
            refcount: 0,
            ll_next: NONE,
            ll_prev: NONE,
        });
        NexthopPool {
            tbl,
            tbl_size: 1,
            head: NONE,
            empty_head: NONE,
            nexthops: 0,
        }
    }

    /// The number of live interned pairs, the default slot not included.
    pub(crate) fn len(&self) -> usize {
        self.nexthops
    }

    pub(crate) fn gw(&self, id: NexthopId) -> AF {
        self.tbl[id.index()].gw
    }

    pub(crate) fn port(&self, id: NexthopId) -> i32 {
        self.tbl[id.index()].port
    }

    pub(crate) fn set_default(&mut self, gw: AF, port: i32) {
        self.tbl[0].gw = gw;
        self.tbl[0].port = port;
    }

    pub(crate) fn clear_default(&mut self) {
        self.tbl[0].gw = AF::zero();
        self.tbl[0].port = -1;
    }

    /// Intern a (gateway, port) pair. An existing entry gets its refcount
    /// bumped; otherwise an id is recycled from the free list or the table
    /// is extended. Fails with `OutOfCapacity` when all `VPORTS_MAX` slots
    /// are live.
    pub(crate) fn acquire(
        &mut self,
        gw: AF,
        port: i32,
    ) -> Result<NexthopId, FibStoreError> {
        // Search for an existing entry.
        let mut nh_i = self.head;
        while nh_i != NONE {
            let e = &self.tbl[nh_i as usize];
            if e.gw == gw && e.port == port {
                break;
            }
            nh_i = e.ll_next;
        }

        if nh_i != NONE {
            self.tbl[nh_i as usize].refcount += 1;
            return Ok(NexthopId(nh_i));
        }

        // Create a new entry, preferring a recycled id.
        let nh_i = if self.empty_head != NONE {
            let i = self.empty_head;
            self.empty_head = self.tbl[i as usize].ll_next;
            i
        } else if self.tbl_size < VPORTS_MAX {
            let i = self.tbl_size as u16;
            self.tbl_size += 1;
            if self.tbl.len() <= i as usize {
                self.tbl.push(Nexthop {
                    gw: AF::zero(),
                    port: -1,
                    refcount: 0,
                    ll_next: NONE,
                    ll_prev: NONE,
                });
            }
            i
        } else {
            return Err(FibStoreError::OutOfCapacity);
        };
        self.nexthops += 1;

        let e = &mut self.tbl[nh_i as usize];
        e.refcount = 1;
        e.gw = gw;
        e.port = port;

        // Link at the head of the allocated list.
        e.ll_prev = NONE;
        e.ll_next = self.head;
        if self.head != NONE {
            self.tbl[self.head as usize].ll_prev = nh_i;
        }
        self.head = nh_i;

        trace!("nexthop {} allocated for port {}", nh_i, port);
        Ok(NexthopId(nh_i))
    }

    /// Drop one reference; returns the remaining refcount. On zero the
    /// entry leaves the allocated list and its id goes onto the free list.
    pub(crate) fn release(&mut self, id: NexthopId) -> u32 {
        let nh_i = id.0;
        debug_assert_ne!(nh_i, 0, "the default slot is never refcounted");

        self.tbl[nh_i as usize].refcount -= 1;
        let refc = self.tbl[nh_i as usize].refcount;
        if refc > 0 {
            return refc;
        }

        self.tbl[nh_i as usize].port = -1;

        // Prune the entry from the allocated list.
        let prev = self.tbl[nh_i as usize].ll_prev;
        let next = self.tbl[nh_i as usize].ll_next;
        if prev != NONE {
            self.tbl[prev as usize].ll_next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.tbl[next as usize].ll_prev = prev;
        }

        // Recycle the id.
        self.tbl[nh_i as usize].ll_next = self.empty_head;
        self.empty_head = nh_i;
        self.nexthops -= 1;

        trace!("nexthop {} recycled", nh_i);
        0
    }

    /// True when nothing beyond the default slot is allocated. Used by
    /// flush paths to assert the table drained completely.
    pub(crate) fn is_drained(&self) -> bool {
        self.head == NONE
    }
}
