use crate::{LayerFsError, LayerFsResult};

use super::{Extent, ExtentKind, ExtentOwner, ExtentRecord};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stable index of an extent node inside its list's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentId(usize);

/// An ordered, coalescing list of extents owned by one allocator.
///
/// The list is either a free-space list or a block map. Nodes live in an arena and are chained
/// through `next` indices, so splicing stays O(1) and a released node can never be reached again
/// through a stale link.
///
/// After every mutation:
/// - extents are sorted by `start` and never overlap,
/// - no two consecutive extents are adjacent (they would have been merged),
/// - every extent covers at least one block and ends at or before the device's block count.
#[derive(Debug, Clone)]
pub struct ExtentList {
    /// Kind of every extent in the list
    kind: ExtentKind,

    /// Allocator the nodes are charged to
    owner: ExtentOwner,

    /// Total block count of the device
    limit: u64,

    /// First node of the chain
    head: Option<ExtentId>,

    /// Node arena
    nodes: Vec<Option<Node>>,

    /// Released arena slots
    vacant: Vec<usize>,

    /// Number of live nodes
    len: usize,

    /// Number of blocks covered by all nodes
    total: u64,
}

#[derive(Debug, Clone)]
struct Node {
    extent: Extent,
    next: Option<ExtentId>,
}

/// Iterator over the extents of a list in ascending order.
pub struct Iter<'a> {
    list: &'a ExtentList,
    cursor: Option<ExtentId>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExtentList {
    /// Creates an empty free-space list.
    pub fn space(owner: ExtentOwner, limit: u64) -> Self {
        Self::new(ExtentKind::Space, owner, limit)
    }

    /// Creates an empty block map.
    pub fn emap(owner: ExtentOwner, limit: u64) -> Self {
        Self::new(ExtentKind::Emap, owner, limit)
    }

    fn new(kind: ExtentKind, owner: ExtentOwner, limit: u64) -> Self {
        Self {
            kind,
            owner,
            limit,
            head: None,
            nodes: Vec::new(),
            vacant: Vec::new(),
            len: 0,
            total: 0,
        }
    }

    /// Rebuilds a list from persisted records.
    ///
    /// Records may come in any order; they are inserted one by one so the result is sorted and
    /// fully coalesced.
    pub fn from_records(
        kind: ExtentKind,
        owner: ExtentOwner,
        limit: u64,
        records: impl IntoIterator<Item = ExtentRecord>,
    ) -> LayerFsResult<Self> {
        let mut list = Self::new(kind, owner, limit);
        for record in records {
            if record.kind != kind {
                return Err(LayerFsError::InvalidImage(format!(
                    "{:?} record in a {:?} list of {owner}",
                    record.kind, kind
                )));
            }
            list.insert(record.start, record.block, record.count)?;
        }
        Ok(list)
    }

    /// Kind of the extents in this list.
    pub fn kind(&self) -> ExtentKind {
        self.kind
    }

    /// Allocator the nodes are charged to.
    pub fn owner(&self) -> ExtentOwner {
        self.owner
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list has no extents.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of blocks covered by the whole list.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Iterates the extents in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Returns the persisted form of every extent, in order.
    pub fn records(&self) -> Vec<ExtentRecord> {
        self.iter().map(|extent| extent.to_record()).collect()
    }

    /// Returns the extent covering `block`, if any.
    pub fn find(&self, block: u64) -> Option<Extent> {
        self.iter()
            .take_while(|extent| extent.get_start() <= block)
            .find(|extent| extent.contains(block))
            .copied()
    }

    /// Translates a logical block through this list.
    pub fn lookup(&self, block: u64) -> Option<u64> {
        self.find(block).and_then(|extent| extent.translate(block))
    }

    /// Returns the first extent that ends after `block`.
    pub fn first_ending_after(&self, block: u64) -> Option<Extent> {
        self.iter().find(|extent| extent.end() > block).copied()
    }

    /// Returns the start of the first extent covering at least `count` blocks.
    pub fn first_fit(&self, count: u64) -> Option<u64> {
        self.iter()
            .find(|extent| extent.get_count() >= count)
            .map(|extent| extent.get_start())
    }

    /// Adds a range to the list.
    ///
    /// A range that touches an existing extent extends it in place, and the extended extent is
    /// then coalesced with its neighbour. Otherwise a new node is spliced in at its sorted
    /// position. `block` must be `0` for space lists and non-zero for block maps.
    ///
    /// ## Errors
    ///
    /// Returns `Corruption` if the range is empty, runs past the end of the device or overlaps
    /// an existing extent.
    pub fn insert(&mut self, start: u64, block: u64, count: u64) -> LayerFsResult<()> {
        self.check_insert(start, block, count)?;

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let (extent, next) = self.link(id)?;

            if extent.precedes(start, block) {
                if let Some(next_id) = next {
                    let following = self.extent(next_id)?;
                    if start + count > following.get_start() {
                        return Err(self.overlap(start, count, &following));
                    }
                }

                self.extent_mut(id)?.grow(count);
                self.total += count;
                self.merge(id, next, None)?;
                return self.finish();
            }

            let incoming = self.make(start, block, count);
            if incoming.precedes(extent.get_start(), extent.get_block()) {
                self.extent_mut(id)?.shift_start_back(count);
                self.total += count;
                self.merge(id, None, prev)?;
                return self.finish();
            }

            if start + count <= extent.get_start() {
                break;
            }
            if start < extent.end() {
                return Err(self.overlap(start, count, &extent));
            }

            prev = Some(id);
            cursor = next;
        }

        let extent = self.make(start, block, count);
        let id = self.alloc(Node {
            extent,
            next: cursor,
        });
        self.set_next(prev, Some(id))?;
        self.total += count;

        tracing::trace!(owner = %self.owner, start, block, count, "new extent");
        self.finish()
    }

    /// Removes at most `count` blocks starting at `start`.
    ///
    /// Only the extent covering `start` is touched, so fewer than `count` blocks are removed
    /// when that extent ends first. Returns the number of blocks removed; `0` when no extent
    /// covers `start`.
    pub fn remove(&mut self, start: u64, count: u64) -> LayerFsResult<u64> {
        if count == 0 {
            return Ok(0);
        }

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let (extent, next) = self.link(id)?;
            if start < extent.get_start() {
                break;
            }

            if start < extent.end() {
                let freed = count.min(extent.end() - start);
                self.update(id, prev, start, freed)?;
                self.finish()?;
                return Ok(freed);
            }

            prev = Some(id);
            cursor = next;
        }

        Ok(0)
    }

    /// Removes every extent and returns them in order.
    pub fn take_all(&mut self) -> Vec<Extent> {
        let extents = self.iter().copied().collect();
        self.head = None;
        self.nodes.clear();
        self.vacant.clear();
        self.len = 0;
        self.total = 0;
        extents
    }

    /// Checks ordering, non-overlap, coalescing, bounds and the cached totals.
    pub fn validate(&self) -> LayerFsResult<()> {
        let mut previous: Option<Extent> = None;
        let mut len = 0;
        let mut total = 0u64;

        for extent in self.iter() {
            if extent.get_kind() != self.kind {
                return Err(LayerFsError::corruption(format!(
                    "{:?} extent {extent} in {:?} list of {}",
                    extent.get_kind(),
                    self.kind,
                    self.owner
                )));
            }
            self.check_insert(extent.get_start(), extent.get_block(), extent.get_count())?;

            if let Some(previous) = previous {
                if previous.end() > extent.get_start() {
                    return Err(LayerFsError::corruption(format!(
                        "extents {previous} and {extent} of {} overlap or are out of order",
                        self.owner
                    )));
                }
                if previous.precedes(extent.get_start(), extent.get_block()) {
                    return Err(LayerFsError::corruption(format!(
                        "extents {previous} and {extent} of {} were left unmerged",
                        self.owner
                    )));
                }
            }

            len += 1;
            total += extent.get_count();
            previous = Some(*extent);
            if len > self.nodes.len() {
                return Err(LayerFsError::corruption(format!(
                    "extent chain of {} loops",
                    self.owner
                )));
            }
        }

        if len != self.len || total != self.total {
            return Err(LayerFsError::corruption(format!(
                "extent list of {} counts {} nodes / {} blocks, chain holds {len} / {total}",
                self.owner, self.len, self.total
            )));
        }

        Ok(())
    }

    /// Coalesces `id` with `next` and `prev` when they are adjacent.
    ///
    /// The two checks are independent, so one call can fold both neighbours into a single
    /// extent. `id` is released if it gets absorbed into `prev`.
    pub(crate) fn merge(
        &mut self,
        id: ExtentId,
        next: Option<ExtentId>,
        prev: Option<ExtentId>,
    ) -> LayerFsResult<()> {
        if let Some(next_id) = next {
            let extent = self.extent(id)?;
            let following = self.extent(next_id)?;
            if extent.precedes(following.get_start(), following.get_block()) {
                self.extent_mut(id)?.grow(following.get_count());
                self.release(next_id, Some(id))?;
            }
        }

        if let Some(prev_id) = prev {
            let preceding = self.extent(prev_id)?;
            let extent = self.extent(id)?;
            if preceding.precedes(extent.get_start(), extent.get_block()) {
                self.extent_mut(prev_id)?.grow(extent.get_count());
                self.release(id, Some(prev_id))?;
            }
        }

        Ok(())
    }

    /// Unlinks `id` from the chain and hands its slot back to the arena.
    ///
    /// `prev` must be the node linking to `id`, or `None` when `id` is the head. Covered block
    /// totals are the caller's business.
    pub(crate) fn release(
        &mut self,
        id: ExtentId,
        prev: Option<ExtentId>,
    ) -> LayerFsResult<Extent> {
        let (extent, next) = self.link(id)?;
        let linked = match prev {
            None => self.head == Some(id),
            Some(prev_id) => self.link(prev_id)?.1 == Some(id),
        };
        if !linked {
            return Err(LayerFsError::corruption(format!(
                "releasing extent {extent} of {} through a wrong predecessor",
                self.owner
            )));
        }
        self.set_next(prev, next)?;

        self.nodes[id.0] = None;
        self.vacant.push(id.0);
        self.len -= 1;

        tracing::trace!(owner = %self.owner, %extent, "released extent");
        Ok(extent)
    }

    /// Takes `freed` blocks starting at `start` off the extent `id`.
    fn update(
        &mut self,
        id: ExtentId,
        prev: Option<ExtentId>,
        start: u64,
        freed: u64,
    ) -> LayerFsResult<()> {
        let extent = self.extent(id)?;
        if freed == 0 || start < extent.get_start() || start + freed > extent.end() {
            return Err(LayerFsError::corruption(format!(
                "removing [{start}, +{freed}) outside extent {extent} of {}",
                self.owner
            )));
        }

        let emptied = if start == extent.get_start() {
            let extent = self.extent_mut(id)?;
            extent.advance_start(freed);
            extent.get_count() == 0
        } else if start + freed == extent.end() {
            let extent = self.extent_mut(id)?;
            extent.shrink(freed);
            extent.get_count() == 0
        } else {
            let suffix_start = start + freed;
            let suffix_block = match self.kind {
                ExtentKind::Space => 0,
                ExtentKind::Emap => extent.get_block() + (suffix_start - extent.get_start()),
            };
            let suffix = self.make(suffix_start, suffix_block, extent.end() - suffix_start);
            let next = self.link(id)?.1;
            let suffix_id = self.alloc(Node {
                extent: suffix,
                next,
            });

            let node = self.node_mut(id)?;
            node.extent.set_count(start - extent.get_start());
            node.next = Some(suffix_id);
            false
        };

        self.total -= freed;
        if emptied {
            self.release(id, prev)?;
        }

        Ok(())
    }

    fn check_insert(&self, start: u64, block: u64, count: u64) -> LayerFsResult<()> {
        if count == 0 {
            return Err(LayerFsError::corruption(format!(
                "empty extent at {start} in {}",
                self.owner
            )));
        }

        let base = match self.kind {
            ExtentKind::Space if block != 0 => {
                return Err(LayerFsError::corruption(format!(
                    "space extent at {start} of {} carries block {block}",
                    self.owner
                )))
            }
            ExtentKind::Emap if block == 0 => {
                return Err(LayerFsError::corruption(format!(
                    "emap extent at {start} of {} maps to block 0",
                    self.owner
                )))
            }
            ExtentKind::Space => start,
            ExtentKind::Emap => {
                start.checked_add(count).ok_or_else(|| {
                    LayerFsError::corruption(format!(
                        "emap extent at {start} of {} wraps the logical space",
                        self.owner
                    ))
                })?;
                block
            }
        };

        match base.checked_add(count) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(LayerFsError::corruption(format!(
                "extent [{base}, +{count}) of {} runs past the device end {}",
                self.owner, self.limit
            ))),
        }
    }

    fn overlap(&self, start: u64, count: u64, extent: &Extent) -> LayerFsError {
        LayerFsError::corruption(format!(
            "range [{start}, +{count}) overlaps extent {extent} of {}",
            self.owner
        ))
    }

    #[inline]
    fn finish(&self) -> LayerFsResult<()> {
        #[cfg(debug_assertions)]
        self.validate()?;
        Ok(())
    }

    fn make(&self, start: u64, block: u64, count: u64) -> Extent {
        match self.kind {
            ExtentKind::Space => Extent::space(start, count),
            ExtentKind::Emap => Extent::emap(start, block, count),
        }
    }

    fn alloc(&mut self, node: Node) -> ExtentId {
        self.len += 1;
        match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                ExtentId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                ExtentId(self.nodes.len() - 1)
            }
        }
    }

    fn set_next(&mut self, prev: Option<ExtentId>, next: Option<ExtentId>) -> LayerFsResult<()> {
        match prev {
            None => self.head = next,
            Some(prev_id) => self.node_mut(prev_id)?.next = next,
        }
        Ok(())
    }

    fn node(&self, id: ExtentId) -> LayerFsResult<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| self.dangling(id))
    }

    fn node_mut(&mut self, id: ExtentId) -> LayerFsResult<&mut Node> {
        let owner = self.owner;
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| LayerFsError::corruption(format!("dangling extent {id:?} in {owner}")))
    }

    fn link(&self, id: ExtentId) -> LayerFsResult<(Extent, Option<ExtentId>)> {
        self.node(id).map(|node| (node.extent, node.next))
    }

    fn extent(&self, id: ExtentId) -> LayerFsResult<Extent> {
        self.node(id).map(|node| node.extent)
    }

    fn extent_mut(&mut self, id: ExtentId) -> LayerFsResult<&mut Extent> {
        self.node_mut(id).map(|node| &mut node.extent)
    }

    fn dangling(&self, id: ExtentId) -> LayerFsError {
        LayerFsError::corruption(format!("dangling extent {id:?} in {}", self.owner))
    }

    #[cfg(test)]
    fn ids(&self) -> Vec<ExtentId> {
        let mut ids = Vec::new();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.nodes[id.0].as_ref().and_then(|node| node.next);
        }
        ids
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Extent;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.nodes.get(self.cursor?.0)?.as_ref()?;
        self.cursor = node.next;
        Some(&node.extent)
    }
}

impl<'a> IntoIterator for &'a ExtentList {
    type Item = &'a Extent;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq for ExtentList {
    /// Lists are equal when they hold the same extents, regardless of node identity.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.iter().eq(other.iter())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 10_000;

    fn space() -> ExtentList {
        ExtentList::space(ExtentOwner::Global, LIMIT)
    }

    fn emap() -> ExtentList {
        ExtentList::emap(ExtentOwner::Layer(crate::LayerHandle::BASE), LIMIT)
    }

    fn triples(list: &ExtentList) -> Vec<(u64, u64, u64)> {
        list.iter()
            .map(|e| (e.get_start(), e.get_block(), e.get_count()))
            .collect()
    }

    #[test]
    fn test_extent_list_insert_into_empty() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        assert_eq!(triples(&list), vec![(100, 0, 10)]);
        assert_eq!(list.total(), 10);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_extent_list_insert_merges_forward() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(110, 0, 5).unwrap();
        assert_eq!(triples(&list), vec![(100, 0, 15)]);
    }

    #[test]
    fn test_extent_list_insert_merges_backward() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(90, 0, 10).unwrap();
        assert_eq!(triples(&list), vec![(90, 0, 20)]);
    }

    #[test]
    fn test_extent_list_insert_fills_gap_and_merges_both_ways() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(120, 0, 10).unwrap();
        assert_eq!(list.len(), 2);

        list.insert(110, 0, 10).unwrap();
        assert_eq!(triples(&list), vec![(100, 0, 30)]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.total(), 30);
    }

    #[test]
    fn test_extent_list_insert_backward_fill_merges_with_predecessor() {
        let mut list = space();
        list.insert(10, 0, 5).unwrap();
        list.insert(20, 0, 5).unwrap();

        // Directly precedes {20,0,5} and directly follows {10,0,5}; the forward test fires
        // first and the trailing merge collapses everything.
        list.insert(15, 0, 5).unwrap();
        assert_eq!(triples(&list), vec![(10, 0, 15)]);
    }

    #[test]
    fn test_extent_list_insert_keeps_order() {
        let mut list = space();
        for start in [500, 100, 300, 700, 200] {
            list.insert(start, 0, 10).unwrap();
        }
        assert_eq!(
            triples(&list),
            vec![
                (100, 0, 10),
                (200, 0, 10),
                (300, 0, 10),
                (500, 0, 10),
                (700, 0, 10)
            ]
        );
    }

    #[test]
    fn test_extent_list_insert_rejects_overlap() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        assert!(matches!(
            list.insert(105, 0, 10),
            Err(LayerFsError::Corruption(_))
        ));
        assert!(matches!(
            list.insert(95, 0, 10),
            Err(LayerFsError::Corruption(_))
        ));
        assert_eq!(triples(&list), vec![(100, 0, 10)]);
    }

    #[test]
    fn test_extent_list_insert_rejects_forward_merge_into_next() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(120, 0, 10).unwrap();
        assert!(matches!(
            list.insert(110, 0, 15),
            Err(LayerFsError::Corruption(_))
        ));
        assert_eq!(triples(&list), vec![(100, 0, 10), (120, 0, 10)]);
    }

    #[test]
    fn test_extent_list_insert_rejects_out_of_bounds() {
        let mut list = space();
        assert!(matches!(
            list.insert(LIMIT - 5, 0, 10),
            Err(LayerFsError::Corruption(_))
        ));
        list.insert(LIMIT - 10, 0, 10).unwrap();

        let mut map = emap();
        assert!(matches!(
            map.insert(0, LIMIT - 2, 4),
            Err(LayerFsError::Corruption(_))
        ));
        // Logical blocks are not bounded by the device size.
        map.insert(LIMIT * 4, 10, 4).unwrap();
    }

    #[test]
    fn test_extent_list_insert_rejects_wrong_block_kind() {
        assert!(matches!(
            space().insert(10, 5, 1),
            Err(LayerFsError::Corruption(_))
        ));
        assert!(matches!(
            emap().insert(10, 0, 1),
            Err(LayerFsError::Corruption(_))
        ));
        assert!(matches!(
            space().insert(10, 0, 0),
            Err(LayerFsError::Corruption(_))
        ));
    }

    #[test]
    fn test_extent_list_emap_needs_physical_adjacency_to_merge() {
        let mut map = emap();
        map.insert(0, 100, 4).unwrap();
        map.insert(4, 104, 4).unwrap();
        assert_eq!(triples(&map), vec![(0, 100, 8)]);

        // Logically adjacent, physically elsewhere.
        map.insert(8, 300, 2).unwrap();
        assert_eq!(triples(&map), vec![(0, 100, 8), (8, 300, 2)]);

        // Physically adjacent to the first run but logically behind it.
        map.insert(20, 108, 2).unwrap();
        assert_eq!(triples(&map), vec![(0, 100, 8), (8, 300, 2), (20, 108, 2)]);

        // Directly before the third run logically, but not physically.
        map.insert(18, 298, 2).unwrap();
        assert_eq!(
            triples(&map),
            vec![(0, 100, 8), (8, 300, 2), (18, 298, 2), (20, 108, 2)]
        );
    }

    #[test]
    fn test_extent_list_emap_backward_merge_moves_block() {
        let mut map = emap();
        map.insert(10, 200, 5).unwrap();
        map.insert(5, 195, 5).unwrap();
        assert_eq!(triples(&map), vec![(5, 195, 10)]);
        assert_eq!(map.lookup(7), Some(197));
    }

    #[test]
    fn test_extent_list_remove_interior_splits() {
        let mut list = space();
        list.insert(100, 0, 15).unwrap();
        let freed = list.remove(105, 3).unwrap();
        assert_eq!(freed, 3);
        assert_eq!(triples(&list), vec![(100, 0, 5), (108, 0, 7)]);
        assert_eq!(list.total(), 12);
    }

    #[test]
    fn test_extent_list_remove_interior_split_offsets_block() {
        let mut map = emap();
        map.insert(100, 1000, 15).unwrap();
        assert_eq!(map.remove(105, 3).unwrap(), 3);
        assert_eq!(triples(&map), vec![(100, 1000, 5), (108, 1008, 7)]);
        assert_eq!(map.lookup(108), Some(1008));
        assert_eq!(map.lookup(114), Some(1014));
        assert_eq!(map.lookup(106), None);
    }

    #[test]
    fn test_extent_list_remove_leading_edge() {
        let mut map = emap();
        map.insert(100, 1000, 10).unwrap();
        assert_eq!(map.remove(100, 4).unwrap(), 4);
        assert_eq!(triples(&map), vec![(104, 1004, 6)]);
    }

    #[test]
    fn test_extent_list_remove_trailing_edge() {
        let mut map = emap();
        map.insert(100, 1000, 10).unwrap();
        assert_eq!(map.remove(106, 4).unwrap(), 4);
        assert_eq!(triples(&map), vec![(100, 1000, 6)]);
    }

    #[test]
    fn test_extent_list_remove_is_clamped_to_one_extent() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(120, 0, 10).unwrap();
        assert_eq!(list.remove(105, 50).unwrap(), 5);
        assert_eq!(triples(&list), vec![(100, 0, 5), (120, 0, 10)]);
    }

    #[test]
    fn test_extent_list_remove_whole_extent_releases_node() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(200, 0, 10).unwrap();
        list.insert(300, 0, 10).unwrap();

        assert_eq!(list.remove(200, 10).unwrap(), 10);
        assert_eq!(triples(&list), vec![(100, 0, 10), (300, 0, 10)]);
        assert_eq!(list.len(), 2);

        assert_eq!(list.remove(100, 10).unwrap(), 10);
        assert_eq!(triples(&list), vec![(300, 0, 10)]);

        assert_eq!(list.remove(300, 10).unwrap(), 10);
        assert!(list.is_empty());
        assert_eq!(list.total(), 0);
    }

    #[test]
    fn test_extent_list_remove_without_overlap() {
        let mut list = space();
        list.insert(100, 0, 15).unwrap();
        assert_eq!(list.remove(50, 5).unwrap(), 0);
        assert_eq!(list.remove(115, 5).unwrap(), 0);
        assert_eq!(list.remove(100, 0).unwrap(), 0);
        assert_eq!(triples(&list), vec![(100, 0, 15)]);
    }

    #[test]
    fn test_extent_list_remove_in_gap_returns_zero() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(200, 0, 10).unwrap();
        assert_eq!(list.remove(150, 10).unwrap(), 0);
        assert_eq!(list.total(), 20);
    }

    #[test]
    fn test_extent_list_round_trip_restores_contents() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(300, 0, 10).unwrap();
        let before = list.clone();

        for (start, count) in [(200, 5), (110, 5), (95, 5), (310, 3)] {
            list.insert(start, 0, count).unwrap();
            assert_eq!(list.remove(start, count).unwrap(), count);
            assert_eq!(list, before);
        }

        let mut map = emap();
        map.insert(0, 100, 8).unwrap();
        let before = map.clone();
        map.insert(8, 108, 4).unwrap();
        assert_eq!(map.remove(8, 4).unwrap(), 4);
        assert_eq!(map, before);
    }

    #[test]
    fn test_extent_list_merge_is_idempotent() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(200, 0, 10).unwrap();

        let ids = list.ids();
        let before = list.clone();
        list.merge(ids[0], Some(ids[1]), None).unwrap();
        list.merge(ids[0], Some(ids[1]), None).unwrap();
        assert_eq!(list, before);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_extent_list_release_checks_predecessor() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(200, 0, 10).unwrap();
        let ids = list.ids();

        assert!(matches!(
            list.release(ids[1], None),
            Err(LayerFsError::Corruption(_))
        ));
        list.release(ids[1], Some(ids[0])).unwrap();
        assert_eq!(list.iter().count(), 1);
    }

    #[test]
    fn test_extent_list_arena_reuses_released_slots() {
        let mut list = space();
        list.insert(100, 0, 10).unwrap();
        list.insert(200, 0, 10).unwrap();
        list.remove(200, 10).unwrap();
        list.insert(300, 0, 10).unwrap();
        assert_eq!(list.nodes.len(), 2);
        assert_eq!(triples(&list), vec![(100, 0, 10), (300, 0, 10)]);
    }

    #[test]
    fn test_extent_list_first_fit() {
        let mut list = space();
        list.insert(10, 0, 2).unwrap();
        list.insert(20, 0, 8).unwrap();
        list.insert(40, 0, 4).unwrap();
        assert_eq!(list.first_fit(1), Some(10));
        assert_eq!(list.first_fit(4), Some(20));
        assert_eq!(list.first_fit(8), Some(20));
        assert_eq!(list.first_fit(9), None);
    }

    #[test]
    fn test_extent_list_random_workload_keeps_invariants() {
        // Deterministic xorshift so failures replay.
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut list = space();
        let mut shadow = vec![false; 2048];
        for _ in 0..4000 {
            let start = next() % 2000;
            let count = 1 + next() % 40;
            if next() % 2 == 0 {
                let range = start as usize..(start + count) as usize;
                if shadow[range.clone()].iter().all(|free| !free) {
                    list.insert(start, 0, count).unwrap();
                    shadow[range].iter_mut().for_each(|free| *free = true);
                }
            } else {
                let before: u64 = list.total();
                let freed = list.remove(start, count).unwrap();
                assert_eq!(list.total(), before - freed);
                for block in start..start + freed {
                    assert!(shadow[block as usize]);
                    shadow[block as usize] = false;
                }
            }

            list.validate().unwrap();
            let covered = shadow.iter().filter(|free| **free).count() as u64;
            assert_eq!(list.total(), covered);
        }
    }

    #[test]
    fn test_extent_list_from_records_coalesces() {
        let records = vec![
            Extent::space(20, 5).to_record(),
            Extent::space(10, 10).to_record(),
            Extent::space(40, 1).to_record(),
        ];
        let list =
            ExtentList::from_records(ExtentKind::Space, ExtentOwner::Global, LIMIT, records)
                .unwrap();
        assert_eq!(triples(&list), vec![(10, 0, 15), (40, 0, 1)]);

        let wrong = vec![Extent::emap(1, 2, 3).to_record()];
        assert!(matches!(
            ExtentList::from_records(ExtentKind::Space, ExtentOwner::Global, LIMIT, wrong),
            Err(LayerFsError::InvalidImage(_))
        ));
    }
}
