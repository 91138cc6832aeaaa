use log::trace;

use crate::types::af::AddressFamily;
use crate::types::errors::FibStoreError;
use crate::types::route::NexthopId;

use super::node::{
    mask_list_insert, Internal, Leaf, MaskRef, Node, NodeIdx, RouteEntry,
    WalkDirective,
};

//------------ RadixTrie -----------------------------------------------------

/// A PATRICIA trie over fixed-width keys, the authoritative route store.
///
/// Every prefix is stored under its canonical network address. Prefixes
/// sharing an address share one leaf, chained in descending prefix-length
/// order, so a walk yields routes in ascending key order and, within one
/// key, most-specific first.
///
/// Longest-match descends by bit tests to a leaf, checks the leaf's chain,
/// and on a miss climbs back towards the root consulting the per-node
/// netmask lists. The list placement invariant: the entry for a prefix of
/// length L sits on the highest node, on the path of the prefix's leaf,
/// whose strict ancestors all test bits below L. Every node an address
/// descends through on its way into the prefix's range carries or is below
/// that node, so the climb cannot miss a covering route.
pub struct RadixTrie<AF: AddressFamily> {
    nodes: Vec<Node<AF>>,
    free: Vec<NodeIdx>,
    root: Option<NodeIdx>,
    route_count: usize,
}

impl<AF: AddressFamily> Default for RadixTrie<AF> {
    fn default() -> Self {
        Self::new()
    }
}

impl<AF: AddressFamily> RadixTrie<AF> {
    pub fn new() -> Self {
        RadixTrie {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            route_count: 0,
        }
    }

    /// The number of stored prefixes.
    pub fn len(&self) -> usize {
        self.route_count
    }

    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }

    /// Drop every route. Nexthop bookkeeping is the caller's business.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.route_count = 0;
    }

    //--- arena plumbing ----------------------------------------------------

    fn alloc(&mut self, node: Node<AF>) -> NodeIdx {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx.index()] = node;
            idx
        } else {
            let idx = NodeIdx(self.nodes.len() as u32);
            self.nodes.push(node);
            idx
        }
    }

    fn dealloc(&mut self, idx: NodeIdx) {
        self.nodes[idx.index()] = Node::Free;
        self.free.push(idx);
    }

    /// Room for `n` more nodes without the arena index overflowing.
    fn ensure_capacity(&self, n: usize) -> Result<(), FibStoreError> {
        if self.nodes.len() - self.free.len() + n > u32::MAX as usize {
            return Err(FibStoreError::OutOfMemory);
        }
        Ok(())
    }

    fn leaf(&self, idx: NodeIdx) -> &Leaf<AF> {
        match &self.nodes[idx.index()] {
            Node::Leaf(l) => l,
            _ => unreachable!("expected leaf"),
        }
    }

    fn leaf_mut(&mut self, idx: NodeIdx) -> &mut Leaf<AF> {
        match &mut self.nodes[idx.index()] {
            Node::Leaf(l) => l,
            _ => unreachable!("expected leaf"),
        }
    }

    fn internal(&self, idx: NodeIdx) -> &Internal {
        match &self.nodes[idx.index()] {
            Node::Internal(n) => n,
            _ => unreachable!("expected internal node"),
        }
    }

    fn internal_mut(&mut self, idx: NodeIdx) -> &mut Internal {
        match &mut self.nodes[idx.index()] {
            Node::Internal(n) => n,
            _ => unreachable!("expected internal node"),
        }
    }

    fn parent_of(&self, idx: NodeIdx) -> Option<NodeIdx> {
        match &self.nodes[idx.index()] {
            Node::Internal(n) => n.parent,
            Node::Leaf(l) => l.parent,
            Node::Free => unreachable!("free node reached"),
        }
    }

    fn set_parent(&mut self, idx: NodeIdx, parent: Option<NodeIdx>) {
        match &mut self.nodes[idx.index()] {
            Node::Internal(n) => n.parent = parent,
            Node::Leaf(l) => l.parent = parent,
            Node::Free => unreachable!("free node reached"),
        }
    }

    fn masks_mut(&mut self, idx: NodeIdx) -> &mut Vec<MaskRef> {
        match &mut self.nodes[idx.index()] {
            Node::Internal(n) => &mut n.masks,
            Node::Leaf(l) => &mut l.masks,
            Node::Free => unreachable!("free node reached"),
        }
    }

    /// Redirect the parent-to-child edge that points at `old` to `new`,
    /// or the root when `parent` is `None`.
    fn replace_child(
        &mut self,
        parent: Option<NodeIdx>,
        old: NodeIdx,
        new: NodeIdx,
    ) {
        match parent {
            None => self.root = Some(new),
            Some(p) => {
                let n = self.internal_mut(p);
                if n.left == old {
                    n.left = new;
                } else {
                    debug_assert_eq!(n.right, old);
                    n.right = new;
                }
            }
        }
    }

    /// Descend by bit tests to the leaf the key selects.
    fn descend(&self, key: AF) -> Option<NodeIdx> {
        let mut cur = self.root?;
        loop {
            match &self.nodes[cur.index()] {
                Node::Internal(n) => {
                    cur = if key.is_bit_set(n.bit) {
                        n.right
                    } else {
                        n.left
                    };
                }
                Node::Leaf(_) => return Some(cur),
                Node::Free => unreachable!("free node reached"),
            }
        }
    }

    //--- netmask list maintenance ------------------------------------------

    /// The node where a prefix of length `plen`, whose leaf is `leaf`,
    /// carries its netmask entry: the highest ancestor-or-self all of
    /// whose strict ancestors test bits below `plen`.
    fn mask_home(&self, leaf: NodeIdx, plen: u8) -> NodeIdx {
        let mut x = leaf;
        while let Some(p) = self.parent_of(x) {
            if self.internal(p).bit >= plen {
                x = p;
            } else {
                break;
            }
        }
        x
    }

    fn attach_mask(&mut self, leaf: NodeIdx, plen: u8) {
        let home = self.mask_home(leaf, plen);
        mask_list_insert(self.masks_mut(home), MaskRef { plen, leaf });
    }

    fn detach_mask(&mut self, leaf: NodeIdx, plen: u8) {
        let home = self.mask_home(leaf, plen);
        let list = self.masks_mut(home);
        let pos = list
            .iter()
            .position(|m| m.plen == plen && m.leaf == leaf)
            .expect("netmask list out of sync with routes");
        list.remove(pos);
    }

    //--- route insertion ---------------------------------------------------

    /// Insert a prefix. The key must be the canonical network address
    /// (bits past `plen` zero). Fails with `AlreadyExists` when the exact
    /// (key, plen) pair is present.
    pub fn add(
        &mut self,
        key: AF,
        plen: u8,
        nexthop: NexthopId,
    ) -> Result<(), FibStoreError> {
        debug_assert_eq!(key.truncate_to_len(plen), key);

        if self.root.is_none() {
            self.ensure_capacity(1)?;
            let leaf = self.alloc(Node::Leaf(Leaf {
                key,
                plen,
                nexthop,
                dups: Vec::new(),
                parent: None,
                masks: Vec::new(),
            }));
            self.root = Some(leaf);
            self.attach_mask(leaf, plen);
            self.route_count += 1;
            return Ok(());
        }

        let t = self.descend(key).expect("tree is not empty");
        if self.leaf(t).key == key {
            return self.add_to_chain(t, plen, nexthop);
        }

        self.ensure_capacity(2)?;
        let d = key.first_diff_bit(self.leaf(t).key);
        debug_assert!(d < AF::BITS);

        // Find the edge to split: walk down again and stop where the next
        // node already tests a bit at or past the first difference.
        let mut parent = None;
        let mut cur = self.root.expect("tree is not empty");
        while let Node::Internal(n) = &self.nodes[cur.index()] {
            if n.bit >= d {
                break;
            }
            parent = Some(cur);
            cur = if key.is_bit_set(n.bit) { n.right } else { n.left };
        }

        let leaf = self.alloc(Node::Leaf(Leaf {
            key,
            plen,
            nexthop,
            dups: Vec::new(),
            parent: None,
            masks: Vec::new(),
        }));
        let (left, right) = if key.is_bit_set(d) {
            (cur, leaf)
        } else {
            (leaf, cur)
        };
        let branch = self.alloc(Node::Internal(Internal {
            bit: d,
            parent,
            left,
            right,
            masks: Vec::new(),
        }));
        self.replace_child(parent, cur, branch);
        self.set_parent(cur, Some(branch));
        self.set_parent(leaf, Some(branch));

        // Netmask entries that were at home on the displaced subtree root
        // because every node above it tested below their length now belong
        // on the new branch when it tests at or past that length.
        let list = self.masks_mut(cur);
        let mut moved = Vec::new();
        list.retain(|m| {
            if m.plen <= d {
                moved.push(*m);
                false
            } else {
                true
            }
        });
        for m in moved {
            mask_list_insert(self.masks_mut(branch), m);
        }

        self.attach_mask(leaf, plen);
        self.route_count += 1;
        trace!("added {}/{} at bit {}", key, plen, d);
        Ok(())
    }

    /// Insert a prefix whose key is already present: extend the leaf's
    /// duplicate chain, keeping it in descending prefix-length order.
    fn add_to_chain(
        &mut self,
        t: NodeIdx,
        plen: u8,
        nexthop: NexthopId,
    ) -> Result<(), FibStoreError> {
        let l = self.leaf_mut(t);
        if l.plen == plen || l.dups.iter().any(|d| d.0 == plen) {
            return Err(FibStoreError::AlreadyExists);
        }
        if plen > l.plen {
            // The new prefix is the most specific: it takes over the leaf
            // fields and the old head moves onto the chain.
            let old = (l.plen, l.nexthop);
            l.plen = plen;
            l.nexthop = nexthop;
            l.dups.insert(0, old);
        } else {
            let pos = l
                .dups
                .iter()
                .position(|d| d.0 < plen)
                .unwrap_or(l.dups.len());
            l.dups.insert(pos, (plen, nexthop));
        }
        self.attach_mask(t, plen);
        self.route_count += 1;
        Ok(())
    }

    //--- route removal -----------------------------------------------------

    /// Remove the exact (key, plen) prefix, returning its nexthop.
    pub fn remove(
        &mut self,
        key: AF,
        plen: u8,
    ) -> Result<NexthopId, FibStoreError> {
        let t = match self.descend(key) {
            Some(t) if self.leaf(t).key == key => t,
            _ => return Err(FibStoreError::NotFound),
        };
        {
            let l = self.leaf(t);
            if l.plen != plen && !l.dups.iter().any(|d| d.0 == plen) {
                return Err(FibStoreError::NotFound);
            }
        }

        // Take the netmask entry out while the structure still matches the
        // shape it was attached under.
        self.detach_mask(t, plen);

        let l = self.leaf_mut(t);
        if l.plen != plen {
            let pos = l
                .dups
                .iter()
                .position(|d| d.0 == plen)
                .expect("chain entry vanished");
            let (_, nexthop) = l.dups.remove(pos);
            self.route_count -= 1;
            return Ok(nexthop);
        }

        let nexthop = l.nexthop;
        if let Some((plen2, nexthop2)) = l.dups.first().copied() {
            // Promote the next chain entry; the leaf stays in place.
            l.dups.remove(0);
            l.plen = plen2;
            l.nexthop = nexthop2;
            self.route_count -= 1;
            return Ok(nexthop);
        }

        // Last prefix under this key: unlink the leaf and collapse its
        // branch node.
        match self.leaf(t).parent {
            None => {
                self.root = None;
                self.dealloc(t);
            }
            Some(p) => {
                let (sibling, grandparent) = {
                    let n = self.internal(p);
                    (if n.left == t { n.right } else { n.left }, n.parent)
                };
                let moved = std::mem::take(self.masks_mut(p));
                for m in moved {
                    mask_list_insert(self.masks_mut(sibling), m);
                }
                self.replace_child(grandparent, p, sibling);
                self.set_parent(sibling, grandparent);
                self.dealloc(p);
                self.dealloc(t);
            }
        }
        self.route_count -= 1;
        trace!("removed {}/{}", key, plen);
        Ok(nexthop)
    }

    //--- lookups -----------------------------------------------------------

    /// Exact-match: the nexthop stored for (key, plen), if any.
    pub fn get(&self, key: AF, plen: u8) -> Option<NexthopId> {
        let t = self.descend(key)?;
        let l = self.leaf(t);
        if l.key != key {
            return None;
        }
        if l.plen == plen {
            return Some(l.nexthop);
        }
        l.dups.iter().find(|d| d.0 == plen).map(|d| d.1)
    }

    /// Longest-prefix-match for an address: the route with the longest
    /// mask whose network covers `addr`, or `None`.
    pub fn match_addr(&self, addr: AF) -> Option<RouteEntry<AF>> {
        let t = self.descend(addr)?;

        // The landed leaf's own chain, most specific first.
        let l = self.leaf(t);
        if addr.truncate_to_len(l.plen) == l.key.truncate_to_len(l.plen) {
            return Some(RouteEntry {
                key: l.key,
                plen: l.plen,
                nexthop: l.nexthop,
            });
        }
        for &(plen, nexthop) in &l.dups {
            if addr.truncate_to_len(plen) == l.key.truncate_to_len(plen) {
                return Some(RouteEntry {
                    key: l.key,
                    plen,
                    nexthop,
                });
            }
        }

        // Climb. Deeper nodes hold longer masks, and each list descends,
        // so the first hit is the longest covering prefix.
        let mut x = self.parent_of(t);
        while let Some(n) = x {
            for m in &self.internal(n).masks {
                let lf = self.leaf(m.leaf);
                if addr.truncate_to_len(m.plen) == lf.key {
                    let nexthop = if lf.plen == m.plen {
                        lf.nexthop
                    } else {
                        lf.dups
                            .iter()
                            .find(|d| d.0 == m.plen)
                            .expect("netmask list out of sync with chain")
                            .1
                    };
                    return Some(RouteEntry {
                        key: lf.key,
                        plen: m.plen,
                        nexthop,
                    });
                }
            }
            x = self.internal(n).parent;
        }
        None
    }

    //--- traversal ---------------------------------------------------------

    /// In-order traversal over all routes: ascending key, descending
    /// prefix length within one key.
    pub fn walk<F>(&self, f: &mut F) -> WalkDirective
    where
        F: FnMut(&RouteEntry<AF>) -> WalkDirective,
    {
        match self.root {
            None => WalkDirective::Continue,
            Some(r) => self.walk_node(r, f),
        }
    }

    /// Traversal restricted to the subtree selected by `key`/`plen`. The
    /// subtree over-approximates the prefix range: skipped bit positions
    /// mean keys outside the range can appear, so callers guard on the key
    /// range themselves. No key inside the range is ever missed.
    pub fn walk_from<F>(&self, key: AF, plen: u8, f: &mut F) -> WalkDirective
    where
        F: FnMut(&RouteEntry<AF>) -> WalkDirective,
    {
        let Some(mut cur) = self.root else {
            return WalkDirective::Continue;
        };
        while let Node::Internal(n) = &self.nodes[cur.index()] {
            if n.bit >= plen {
                break;
            }
            cur = if key.is_bit_set(n.bit) { n.right } else { n.left };
        }
        self.walk_node(cur, f)
    }

    fn walk_node<F>(&self, idx: NodeIdx, f: &mut F) -> WalkDirective
    where
        F: FnMut(&RouteEntry<AF>) -> WalkDirective,
    {
        match &self.nodes[idx.index()] {
            Node::Internal(n) => {
                let d = self.walk_node(n.left, f);
                if d != WalkDirective::Continue {
                    return d;
                }
                self.walk_node(n.right, f)
            }
            Node::Leaf(l) => {
                let d = f(&RouteEntry {
                    key: l.key,
                    plen: l.plen,
                    nexthop: l.nexthop,
                });
                if d != WalkDirective::Continue {
                    return d;
                }
                for &(plen, nexthop) in &l.dups {
                    let d = f(&RouteEntry {
                        key: l.key,
                        plen,
                        nexthop,
                    });
                    if d != WalkDirective::Continue {
                        return d;
                    }
                }
                WalkDirective::Continue
            }
            Node::Free => unreachable!("free node reached"),
        }
    }
}
