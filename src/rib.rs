use std::fmt::Write;
use std::net::IpAddr;
use std::str::FromStr;

use inetnum::addr::Prefix;
use log::{debug, info};

use crate::nexthop::NexthopPool;
use crate::radix::{RadixTrie, WalkDirective};
use crate::types::af::{AddressFamily, IPv4, IPv6};
use crate::types::errors::FibStoreError;
use crate::types::route::{NexthopId, Route};
use crate::types::{parse_prefix, parse_route_spec};

//------------ Rib -----------------------------------------------------------

/// The per-family authoritative table: a trie plus the nexthop pool its
/// routes reference.
///
/// The default route (prefix length 0) is special-cased the way the
/// original radix tables do it: it occupies a normal trie leaf carrying
/// nexthop id 0, but its (gateway, port) pair lives in the pool's reserved
/// slot 0 instead of being interned, so derived lookup tables need no
/// rebuilding when only the default changes.
pub(crate) struct Rib<AF: AddressFamily> {
    pub(crate) trie: RadixTrie<AF>,
    pub(crate) nexthops: NexthopPool<AF>,
}

impl<AF: AddressFamily> Rib<AF> {
    pub(crate) fn new() -> Self {
        Rib {
            trie: RadixTrie::new(),
            nexthops: NexthopPool::new(),
        }
    }

    /// Insert a route; returns the nexthop id now serving the prefix.
    pub(crate) fn add(
        &mut self,
        key: AF,
        plen: u8,
        gw: AF,
        port: i32,
    ) -> Result<NexthopId, FibStoreError> {
        if plen == 0 {
            self.trie.add(AF::zero(), 0, NexthopId::DEFAULT)?;
            self.nexthops.set_default(gw, port);
            return Ok(NexthopId::DEFAULT);
        }
        let nh = self.nexthops.acquire(gw, port)?;
        if let Err(e) = self.trie.add(key, plen, nh) {
            self.nexthops.release(nh);
            return Err(e);
        }
        Ok(nh)
    }

    pub(crate) fn remove(
        &mut self,
        key: AF,
        plen: u8,
    ) -> Result<NexthopId, FibStoreError> {
        let nh = self.trie.remove(key, plen)?;
        if plen == 0 {
            self.nexthops.clear_default();
        } else {
            self.nexthops.release(nh);
        }
        Ok(nh)
    }

    /// Longest-match an address to (port, gateway). No route and no
    /// default gives the discard port -1.
    pub(crate) fn lookup(&self, addr: AF) -> (i32, AF) {
        match self.trie.match_addr(addr) {
            Some(e) => {
                (self.nexthops.port(e.nexthop), self.nexthops.gw(e.nexthop))
            }
            None => (-1, AF::zero()),
        }
    }

    pub(crate) fn dump_into(&self, out: &mut String) {
        self.trie.walk(&mut |e| {
            let _ = writeln!(
                out,
                "{}/{}\t{}\t{}",
                e.key.into_ipaddr(),
                e.plen,
                self.nexthops.gw(e.nexthop).into_ipaddr(),
                self.nexthops.port(e.nexthop)
            );
            WalkDirective::Continue
        });
    }

    /// Drop every route and release every nexthop reference.
    pub(crate) fn flush(&mut self) {
        let mut held = Vec::new();
        self.trie.walk(&mut |e| {
            held.push((e.plen, e.nexthop));
            WalkDirective::Continue
        });
        for (plen, nh) in held {
            if plen == 0 {
                self.nexthops.clear_default();
            } else {
                self.nexthops.release(nh);
            }
        }
        self.trie.clear();
        debug_assert!(self.nexthops.is_drained());
    }
}

//------------ RouteTable (trait) --------------------------------------------

/// The route-table surface every engine exposes, with the textual
/// handlers provided on top of the per-engine primitives.
pub trait RouteTable {
    /// Insert a route; fails with `AlreadyExists` for a duplicate prefix.
    fn add_route(&mut self, route: &Route) -> Result<(), FibStoreError>;

    /// Remove the route for a prefix.
    fn remove_route(&mut self, prefix: &Prefix) -> Result<(), FibStoreError>;

    /// Longest-prefix-match an address to (output port, gateway). Port -1
    /// means discard; an all-zero gateway means none.
    fn lookup(&self, addr: IpAddr) -> (i32, IpAddr);

    /// Clear the whole table in one step.
    fn flush(&mut self);

    /// Tab-separated `prefix/len\tgw\tport` lines.
    fn dump_routes(&self) -> String;

    /// A human-readable report on the current database state.
    fn status(&self) -> String;

    /// Rebuild whatever derived lookup state is dirty. Tables without
    /// derived state have nothing to do.
    fn apply_pending(&mut self) -> Result<(), FibStoreError> {
        Ok(())
    }

    /// Insert a route whether or not one exists for the prefix.
    fn set_route(&mut self, route: &Route) -> Result<(), FibStoreError> {
        match self.remove_route(&route.prefix) {
            Ok(()) | Err(FibStoreError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.add_route(route)
    }

    /// Parse and insert a list of `ADDR/MASK [GW] OUT` specifications.
    /// Every specification is attempted; the first error is returned and
    /// the caller is expected to discard the table.
    fn configure<S: AsRef<str>>(
        &mut self,
        specs: &[S],
    ) -> Result<(), FibStoreError> {
        let mut first_err = None;
        for (i, spec) in specs.iter().enumerate() {
            let res = parse_route_spec(spec.as_ref(), i + 1)
                .and_then(|r| self.add_route(&r));
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Apply a batch of `add SPEC` / `set SPEC` / `remove PREFIX` lines
    /// as one atomic operation: all table mutations first, one rebuild of
    /// derived state at the end.
    fn control(&mut self, text: &str) -> Result<(), FibStoreError> {
        let mut first_err = None;
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let arg = i + 1;
            let res = match line.split_once(char::is_whitespace) {
                Some(("add", rest)) => parse_route_spec(rest, arg)
                    .and_then(|r| self.add_route(&r)),
                Some(("set", rest)) => parse_route_spec(rest, arg)
                    .and_then(|r| self.set_route(&r)),
                Some(("remove", rest)) => parse_prefix(rest.trim())
                    .ok_or(FibStoreError::Malformed(arg))
                    .and_then(|p| self.remove_route(&p)),
                _ => Err(FibStoreError::Malformed(arg)),
            };
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        let applied = self.apply_pending();
        match first_err {
            None => applied,
            Some(e) => Err(e),
        }
    }

    /// The textual `lookup` handler: `"PORT GW"` when a gateway is set,
    /// `"PORT"` otherwise.
    fn lookup_handler(&self, s: &str) -> Result<String, FibStoreError> {
        let addr = IpAddr::from_str(s.trim())
            .map_err(|_| FibStoreError::Malformed(1))?;
        let (port, gw) = self.lookup(addr);
        if gw_is_set(gw) {
            Ok(format!("{} {}", port, gw))
        } else {
            Ok(format!("{}", port))
        }
    }
}

fn gw_is_set(gw: IpAddr) -> bool {
    match gw {
        IpAddr::V4(a) => !a.is_unspecified(),
        IpAddr::V6(a) => !a.is_unspecified(),
    }
}

/// Split a prefix into its family's key and length, truncating any host
/// bits.
pub(crate) fn prefix_parts<AF: AddressFamily>(prefix: &Prefix) -> (AF, u8) {
    let len = prefix.len();
    (AF::from_ipaddr(prefix.addr()).truncate_to_len(len), len)
}

//------------ RadixLookup ---------------------------------------------------

/// IP routing lookup straight off the PATRICIA tries, one per address
/// family.
///
/// Optimized for fast database updates; longest-prefix lookups run in at
/// most O(W) time, where W is the width of the search key. Also the
/// backend database underneath the accelerated lookup engines.
pub struct RadixLookup {
    v4: Rib<IPv4>,
    v6: Rib<IPv6>,
}

impl Default for RadixLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl RadixLookup {
    pub fn new() -> Self {
        RadixLookup {
            v4: Rib::new(),
            v6: Rib::new(),
        }
    }

    /// The number of stored prefixes across both families.
    pub fn prefix_count(&self) -> usize {
        self.v4.trie.len() + self.v6.trie.len()
    }

    /// The number of unique (gateway, port) pairs across both families.
    pub fn nexthop_count(&self) -> usize {
        self.v4.nexthops.len() + self.v6.nexthops.len()
    }
}

impl RouteTable for RadixLookup {
    fn add_route(&mut self, route: &Route) -> Result<(), FibStoreError> {
        if route.gw.is_ipv4() != route.prefix.is_v4() {
            return Err(FibStoreError::Malformed(1));
        }
        if route.prefix.is_v4() {
            let (key, plen) = prefix_parts::<IPv4>(&route.prefix);
            let gw = IPv4::from_ipaddr(route.gw);
            self.v4.add(key, plen, gw, route.port)?;
        } else {
            let (key, plen) = prefix_parts::<IPv6>(&route.prefix);
            let gw = IPv6::from_ipaddr(route.gw);
            self.v6.add(key, plen, gw, route.port)?;
        }
        debug!("added route {}", route);
        Ok(())
    }

    fn remove_route(&mut self, prefix: &Prefix) -> Result<(), FibStoreError> {
        if prefix.is_v4() {
            let (key, plen) = prefix_parts::<IPv4>(prefix);
            self.v4.remove(key, plen)?;
        } else {
            let (key, plen) = prefix_parts::<IPv6>(prefix);
            self.v6.remove(key, plen)?;
        }
        Ok(())
    }

    fn lookup(&self, addr: IpAddr) -> (i32, IpAddr) {
        match addr {
            IpAddr::V4(a) => {
                let (port, gw) = self.v4.lookup(u32::from(a));
                (port, gw.into_ipaddr())
            }
            IpAddr::V6(a) => {
                let (port, gw) = self.v6.lookup(u128::from(a));
                (port, gw.into_ipaddr())
            }
        }
    }

    fn flush(&mut self) {
        self.v4.flush();
        self.v6.flush();
        info!("routing table flushed");
    }

    fn dump_routes(&self) -> String {
        let mut out = String::new();
        self.v4.dump_into(&mut out);
        self.v6.dump_into(&mut out);
        out
    }

    fn status(&self) -> String {
        format!(
            "RadixLookup: {} prefixes, {} unique nexthops\n",
            self.prefix_count(),
            self.nexthop_count()
        )
    }
}
