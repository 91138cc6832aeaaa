use crate::radix::{RadixTrie, WalkDirective};

/// Frames on the preference-length stack: one per possible prefix length
/// plus the synthetic bottom.
const HEAP_FRAMES: usize = 33;

//------------ RangeHeap -----------------------------------------------------

/// The preference-length stack driving a chunk projection.
///
/// Frames are ordered by ascending prefix length from the bottom up, so
/// the top is always the most specific route covering the projection
/// cursor. The bottom frame is seeded from the trie's longest match for an
/// address; when the stack runs dry mid-walk it is re-seeded for the first
/// uncovered address.
#[derive(Debug)]
pub(crate) struct RangeHeap {
    frames: [HeapFrame; HEAP_FRAMES],
    index: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HeapFrame {
    pub start: u32,
    pub end: u32,
    pub preflen: u8,
    pub nexthop: u16,
}

impl RangeHeap {
    pub(crate) fn new() -> Self {
        RangeHeap {
            frames: [HeapFrame::default(); HEAP_FRAMES],
            index: 0,
        }
    }

    /// Reset to a single bottom frame: the longest match for `dst`, or
    /// the synthetic default covering the whole key space.
    fn init(&mut self, trie: &RadixTrie<u32>, dst: u32) {
        self.index = 0;
        self.frames[0] = match trie.match_addr(dst) {
            Some(e) => HeapFrame {
                start: e.key,
                end: e.end(),
                preflen: e.plen,
                nexthop: e.nexthop.0,
            },
            None => HeapFrame {
                start: 0,
                end: u32::MAX,
                preflen: 0,
                nexthop: 0,
            },
        };
    }

    fn top(&self) -> HeapFrame {
        self.frames[self.index]
    }

    fn pop(&mut self) {
        debug_assert!(self.index > 0);
        self.index -= 1;
    }

    /// Insertion-sort a frame into the stack by prefix length.
    fn inject(&mut self, start: u32, end: u32, preflen: u8, nexthop: u16) {
        let mut i = self.index as isize;
        while i >= 0 {
            let f = self.frames[i as usize];
            if preflen > f.preflen {
                break;
            } else if preflen < f.preflen {
                self.frames[i as usize + 1] = f;
                i -= 1;
            } else {
                // Re-encountering the route the stack was seeded with; it
                // must be the only frame and carry identical values.
                assert!(
                    self.index == 0
                        && preflen == self.frames[0].preflen
                        && start == self.frames[0].start
                        && end == self.frames[0].end
                        && nexthop == self.frames[0].nexthop,
                    "duplicate preference length on the projection stack"
                );
                return;
            }
        }
        self.frames[(i + 1) as usize] = HeapFrame {
            start,
            end,
            preflen,
            nexthop,
        };
        self.index += 1;
    }
}

//------------ Chunk projection ----------------------------------------------

/// One emitted range: `nexthop` serves addresses from `start` (absolute)
/// up to the next fragment's start, or the chunk's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub start: u32,
    pub nexthop: u16,
}

/// The chunk cannot be expressed in the short fragment format.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Overflow;

/// Project the longest-prefix-match function over one chunk of the
/// address space into a minimal ordered fragment list.
///
/// Walks the trie subtree covering `[chunk_first, chunk_last]` in key
/// order, maintaining the preference-length stack, and appends fragments
/// to `frags` with strictly increasing starts and distinct adjacent
/// nexthops. The first fragment always starts at `chunk_first`.
///
/// With `short` set, the projection refuses (with [`Overflow`]) any route
/// that breaks the short format: a start not aligned to 256, an end
/// before `start | 0xff`, or a nexthop above 255. The caller retries in
/// the wide format, which never overflows.
pub(crate) fn project_chunk(
    trie: &RadixTrie<u32>,
    chunk_first: u32,
    chunk_last: u32,
    direct_plen: u8,
    short: bool,
    heap: &mut RangeHeap,
    frags: &mut Vec<Fragment>,
) -> Result<(), Overflow> {
    frags.clear();
    heap.init(trie, chunk_first);
    if short && heap.top().nexthop > 0xff {
        return Err(Overflow);
    }
    frags.push(Fragment {
        start: chunk_first,
        nexthop: heap.top().nexthop,
    });

    let dir = trie.walk_from(chunk_first, direct_plen, &mut |e| {
        let start = e.key;
        if start > chunk_last {
            // Beyond chunk boundaries, we are done.
            return WalkDirective::Stop;
        }
        if start < chunk_first {
            return WalkDirective::Continue;
        }
        let end = e.end();
        let nh = e.nexthop.0;

        if short && (start & 0xff != 0 || end < (start | 0xff) || nh > 0xff)
        {
            return WalkDirective::Abort;
        }

        let top = heap.top();
        if start == top.start {
            assert!(
                e.plen <= top.preflen,
                "route walk yielded a more specific route after its anchor"
            );
            heap.inject(start, end, e.plen, nh);
        } else if start < top.start {
            // This must never happen.
            panic!(
                "route walk went backwards: {:#010x} < {:#010x}",
                start, top.start
            );
        } else {
            // The walk moved past the top frame: unwind every frame that
            // ends before this route starts, emitting a fragment whenever
            // an uncovering reveals a different nexthop.
            while start > heap.top().end {
                let oend = heap.top().end;
                if heap.index > 0 {
                    heap.pop();
                } else {
                    heap.init(trie, oend + 1);
                }
                let t = heap.top();
                let last_nh =
                    frags.last().expect("fragment list is seeded").nexthop;
                if t.end > oend && t.nexthop != last_nh {
                    if short && t.nexthop > 0xff {
                        return WalkDirective::Abort;
                    }
                    frags.push(Fragment {
                        start: oend + 1,
                        nexthop: t.nexthop,
                    });
                }
            }
            let last = *frags.last().expect("fragment list is seeded");
            if start > last.start && nh != last.nexthop {
                frags.push(Fragment { start, nexthop: nh });
            } else {
                // The new route rewrites the pending fragment; retract it
                // if that makes it redundant against its predecessor.
                if frags.len() > 1 && frags[frags.len() - 2].nexthop == nh {
                    frags.pop();
                }
                frags.last_mut().expect("fragment list is seeded").nexthop =
                    nh;
            }
            heap.inject(start, end, e.plen, nh);
        }
        WalkDirective::Continue
    });
    if dir == WalkDirective::Abort {
        return Err(Overflow);
    }

    // Flush stack frames still reaching past the direct bits, capped at
    // the upper chunk boundary.
    loop {
        let t = heap.top();
        if t.preflen <= direct_plen {
            break;
        }
        let oend = t.end;
        if oend >= chunk_last {
            // Crossed the upper chunk boundary.
            break;
        }
        if heap.index > 0 {
            heap.pop();
        } else {
            heap.init(trie, oend + 1);
        }
        let t = heap.top();
        let last_nh = frags.last().expect("fragment list is seeded").nexthop;
        if t.end > oend && t.nexthop != last_nh {
            if short && t.nexthop > 0xff {
                return Err(Overflow);
            }
            frags.push(Fragment {
                start: oend + 1,
                nexthop: t.nexthop,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::route::NexthopId;

    fn trie_with(routes: &[(u32, u8, u16)]) -> RadixTrie<u32> {
        let mut t = RadixTrie::new();
        for (k, l, n) in routes {
            t.add(*k, *l, NexthopId(*n)).unwrap();
        }
        t
    }

    fn project(
        trie: &RadixTrie<u32>,
        chunk: u32,
        shift: u8,
        short: bool,
    ) -> Result<Vec<Fragment>, Overflow> {
        let first = chunk << shift;
        let last = first | ((1u32 << shift) - 1);
        let mut heap = RangeHeap::new();
        let mut frags = Vec::new();
        project_chunk(
            trie,
            first,
            last,
            32 - shift,
            short,
            &mut heap,
            &mut frags,
        )?;
        Ok(frags)
    }

    /// Every address in the chunk resolves to the same nexthop through
    /// the fragments as through the trie itself.
    fn check_against_trie(
        trie: &RadixTrie<u32>,
        chunk: u32,
        shift: u8,
        frags: &[Fragment],
    ) {
        let first = chunk << shift;
        let last = first | ((1u32 << shift) - 1);
        assert_eq!(frags[0].start, first);
        for w in frags.windows(2) {
            assert!(w[0].start < w[1].start, "fragment starts not ordered");
            assert_ne!(
                w[0].nexthop, w[1].nexthop,
                "adjacent fragments share a nexthop"
            );
        }
        // Probe fragment boundaries and their neighbours.
        let mut probes = vec![first, last];
        for f in frags {
            probes.push(f.start);
            probes.push(f.start.saturating_sub(1).max(first));
            probes.push((f.start + 1).min(last));
        }
        for addr in probes {
            let want = trie.match_addr(addr).map(|e| e.nexthop.0).unwrap_or(0);
            let got = frags
                .iter()
                .rev()
                .find(|f| f.start <= addr)
                .map(|f| f.nexthop)
                .unwrap();
            assert_eq!(got, want, "addr {:#010x}", addr);
        }
    }

    #[test]
    fn test_empty_chunk_is_default() {
        let trie = trie_with(&[]);
        let frags = project(&trie, 0xc0a80, 12, true).unwrap();
        assert_eq!(
            frags,
            vec![Fragment {
                start: 0xc0a8_0000,
                nexthop: 0
            }]
        );
    }

    #[test]
    fn test_single_covering_route() {
        // A /16 covers the whole /20 chunk: one fragment.
        let trie = trie_with(&[(0xc0a8_0000, 16, 7)]);
        let frags = project(&trie, 0xc0a80, 12, true).unwrap();
        assert_eq!(
            frags,
            vec![Fragment {
                start: 0xc0a8_0000,
                nexthop: 7
            }]
        );
    }

    #[test]
    fn test_nested_routes_split_chunk() {
        let trie = trie_with(&[
            (0x0a00_0000, 8, 1),
            (0x0a00_0400, 22, 2),
            (0x0a00_0800, 21, 3),
        ]);
        let frags = project(&trie, 0x0a000, 12, true).unwrap();
        assert_eq!(
            frags,
            vec![
                Fragment { start: 0x0a00_0000, nexthop: 1 },
                Fragment { start: 0x0a00_0400, nexthop: 2 },
                Fragment { start: 0x0a00_0800, nexthop: 3 },
            ]
        );
        check_against_trie(&trie, 0x0a000, 12, &frags);
    }

    #[test]
    fn test_hole_between_specifics() {
        // Two /24s inside an uncovered chunk: default pops back in
        // between them and after the second one.
        let trie = trie_with(&[
            (0x0a00_0100, 24, 1),
            (0x0a00_0300, 24, 2),
        ]);
        let frags = project(&trie, 0x0a000, 12, true).unwrap();
        assert_eq!(
            frags,
            vec![
                Fragment { start: 0x0a00_0000, nexthop: 0 },
                Fragment { start: 0x0a00_0100, nexthop: 1 },
                Fragment { start: 0x0a00_0200, nexthop: 0 },
                Fragment { start: 0x0a00_0300, nexthop: 2 },
                Fragment { start: 0x0a00_0400, nexthop: 0 },
            ]
        );
        check_against_trie(&trie, 0x0a000, 12, &frags);
    }

    #[test]
    fn test_adjacent_same_nexthop_coalesce() {
        // Neighbouring /24s with one nexthop collapse into one fragment.
        let trie = trie_with(&[
            (0x0a00_0000, 24, 1),
            (0x0a00_0100, 24, 1),
            (0x0a00_0200, 24, 1),
        ]);
        let frags = project(&trie, 0x0a000, 12, true).unwrap();
        assert_eq!(
            frags,
            vec![
                Fragment { start: 0x0a00_0000, nexthop: 1 },
                Fragment { start: 0x0a00_0300, nexthop: 0 },
            ]
        );
    }

    #[test]
    fn test_short_overflow_conditions() {
        // A /25 start is not 256-aligned in its second half.
        let trie = trie_with(&[(0x0a00_0080, 25, 1)]);
        assert_eq!(project(&trie, 0x0a000, 12, true), Err(Overflow));
        let frags = project(&trie, 0x0a000, 12, false).unwrap();
        check_against_trie(&trie, 0x0a000, 12, &frags);

        // A nexthop above 255 cannot ride the short format.
        let trie = trie_with(&[(0x0a00_0000, 24, 256)]);
        assert_eq!(project(&trie, 0x0a000, 12, true), Err(Overflow));
        let frags = project(&trie, 0x0a000, 12, false).unwrap();
        assert_eq!(frags.len(), 2);
        check_against_trie(&trie, 0x0a000, 12, &frags);

        // A covering route with a big nexthop overflows via the seed.
        let trie = trie_with(&[(0x0a00_0000, 8, 300)]);
        assert_eq!(project(&trie, 0x0a000, 12, true), Err(Overflow));
    }

    #[test]
    fn test_host_routes_wide() {
        let trie = trie_with(&[
            (0x0a00_0000, 16, 1),
            (0x0a00_0a01, 32, 2),
            (0x0a00_0a02, 32, 3),
        ]);
        let frags = project(&trie, 0x0a000, 12, false).unwrap();
        assert_eq!(
            frags,
            vec![
                Fragment { start: 0x0a00_0000, nexthop: 1 },
                Fragment { start: 0x0a00_0a01, nexthop: 2 },
                Fragment { start: 0x0a00_0a02, nexthop: 3 },
                Fragment { start: 0x0a00_0a03, nexthop: 1 },
            ]
        );
        check_against_trie(&trie, 0x0a000, 12, &frags);
    }

    #[test]
    fn test_last_chunk_boundary() {
        // Routes touching 255.255.255.255 must not wrap the projection.
        let trie = trie_with(&[
            (0xffff_f000, 20, 1),
            (0xffff_ff00, 24, 2),
        ]);
        let frags = project(&trie, 0xfffff, 12, true).unwrap();
        assert_eq!(
            frags,
            vec![
                Fragment { start: 0xffff_f000, nexthop: 1 },
                Fragment { start: 0xffff_ff00, nexthop: 2 },
            ]
        );
        check_against_trie(&trie, 0xfffff, 12, &frags);
    }

    #[test]
    fn test_dir_sized_chunk() {
        // The 16-bit chunk geometry of the DIR-24-8 table.
        let trie = trie_with(&[
            (0x0a01_0000, 16, 1),
            (0x0a01_8000, 17, 2),
            (0x0a01_c123, 32, 3),
        ]);
        let mut heap = RangeHeap::new();
        let mut frags = Vec::new();
        project_chunk(
            &trie,
            0x0a01_0000,
            0x0a01_ffff,
            16,
            false,
            &mut heap,
            &mut frags,
        )
        .unwrap();
        assert_eq!(
            frags,
            vec![
                Fragment { start: 0x0a01_0000, nexthop: 1 },
                Fragment { start: 0x0a01_8000, nexthop: 2 },
                Fragment { start: 0x0a01_c123, nexthop: 3 },
                Fragment { start: 0x0a01_c124, nexthop: 2 },
            ]
        );
    }
}
