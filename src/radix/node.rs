use crate::types::af::AddressFamily;
use crate::types::route::NexthopId;

//------------ NodeIdx -------------------------------------------------------

/// Index of a node in the trie arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeIdx(pub(crate) u32);

impl NodeIdx {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

//------------ Node ----------------------------------------------------------

/// One arena slot. `Free` slots sit on the arena's free list and are never
/// reachable from the tree.
#[derive(Debug)]
pub(crate) enum Node<AF: AddressFamily> {
    Free,
    Internal(Internal),
    Leaf(Leaf<AF>),
}

/// A branch point: tests one bit of the search key. Bits strictly increase
/// on every path away from the root.
#[derive(Debug)]
pub(crate) struct Internal {
    pub bit: u8,
    pub parent: Option<NodeIdx>,
    pub left: NodeIdx,
    pub right: NodeIdx,
    /// Netmask refinements spanning this subtree, descending prefix
    /// length. See [`RadixTrie`](super::RadixTrie) for the placement
    /// invariant.
    pub masks: Vec<MaskRef>,
}

/// A key position. All prefixes whose canonical network address equals
/// `key` live here: the longest as the leaf fields themselves, any
/// shorter ones on the `dups` chain in descending prefix-length order.
#[derive(Debug)]
pub(crate) struct Leaf<AF: AddressFamily> {
    pub key: AF,
    pub plen: u8,
    pub nexthop: NexthopId,
    /// Duplicate-key chain: (prefix length, nexthop), descending, all
    /// strictly shorter than `plen`.
    pub dups: Vec<(u8, NexthopId)>,
    pub parent: Option<NodeIdx>,
    pub masks: Vec<MaskRef>,
}

/// A netmask annotation: prefix (leaf's key, `plen`) covers every key in
/// the subtree of the node carrying this entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MaskRef {
    pub plen: u8,
    pub leaf: NodeIdx,
}

/// Insert into a mask list, keeping it sorted by descending prefix
/// length.
pub(crate) fn mask_list_insert(list: &mut Vec<MaskRef>, m: MaskRef) {
    let pos = list
        .iter()
        .position(|e| e.plen < m.plen)
        .unwrap_or(list.len());
    list.insert(pos, m);
}

//------------ RouteEntry ----------------------------------------------------

/// One prefix as yielded by lookups and walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry<AF: AddressFamily> {
    pub key: AF,
    pub plen: u8,
    pub nexthop: NexthopId,
}

impl<AF: AddressFamily> RouteEntry<AF> {
    /// The last address covered by this prefix.
    pub fn end(&self) -> AF {
        self.key | !AF::mask_from_len(self.plen)
    }
}

//------------ WalkDirective -------------------------------------------------

/// What a walk callback wants to happen next. `Stop` ends the walk
/// normally; `Abort` ends it and is reported back to the walk's caller,
/// which the range projector uses to escalate out of the short fragment
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkDirective {
    Continue,
    Stop,
    Abort,
}
