use std::{iter::FusedIterator, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
  block::{
    BlockTags, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, Tag, WSIZE, Words, footer_addr,
    header_addr, next_addr,
  },
  config::HeapConfig,
  error::{HeapError, ReleaseFault},
  free_list::FreeList,
  region::{Grow, HeapRegion, Reserved, Sbrk},
};

/// Payload offset of the prologue block.
pub(crate) const PROLOGUE: usize = 2 * WSIZE;

/// Payload offset of the first user block.
pub(crate) const FIRST_BLOCK: usize = PROLOGUE + DSIZE;

/// Pad word, prologue header and footer, epilogue header.
pub const SENTINEL_OVERHEAD: usize = 4 * WSIZE;

/// Block size needed to serve a request of `size` payload bytes.
pub fn adjusted_size(
  size: usize,
) -> Option<usize> {
  let padded = size.checked_add(OVERHEAD + DSIZE - 1)? & !(DSIZE - 1);
  let asize = padded.max(MIN_BLOCK_SIZE);
  (asize <= MAX_BLOCK_SIZE).then_some(asize)
}

/// A boundary-tag heap over one growable region.
///
/// ```text
///  base
///   ▼
///   ┌─────┬──────────┬──────────┬─────────────────────────────┬──────────┐
///   │ pad │ hdr(8:a) │ ftr(8:a) │ zero or more user blocks    │ hdr(0:a) │
///   └─────┴──────────┴──────────┴─────────────────────────────┴──────────┘
///         │      prologue       │                             │ epilogue │
/// ```
///
/// Allocated and free blocks alternate freely, but no two free blocks are
/// ever adjacent: every release merges with free neighbors on the spot.
pub struct Allocator<G = Sbrk> {
  region: HeapRegion<G>,
  free: FreeList,
  config: HeapConfig,
}

impl Allocator<Reserved> {
  /// A heap inside a private mapping of `capacity` bytes.
  pub fn reserved(
    capacity: usize,
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    Self::init(Reserved::new(capacity)?, config)
  }
}

impl<G: Grow> Allocator<G> {
  /// Lays down the sentinels and seeds the heap with one free block of
  /// `config.initial_chunk` bytes.
  pub fn init(
    grower: G,
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    let mut region = HeapRegion::new(grower);
    let start = region.extend(SENTINEL_OVERHEAD)?;

    region.set_word(start, 0);
    region.write_block(start + PROLOGUE, Tag::PROLOGUE);
    region.write_epilogue(start + FIRST_BLOCK);

    let mut heap = Self {
      region,
      free: FreeList::new(config.policy),
      config,
    };

    if config.initial_chunk > 0 {
      heap.extend_heap(config.initial_chunk)?;
    }

    debug!(
      "heap initialised at {:?} with {} bytes ({:?})",
      heap.region.base(),
      heap.region.len(),
      config.policy
    );

    Ok(heap)
  }

  /// Hands out a double-word aligned payload of at least `size` bytes.
  ///
  /// A zero `size` is refused with [`HeapError::ZeroSize`].
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let bp = self.allocate_block(size)?;
    Ok(self.region.ptr_at(bp))
  }

  fn allocate_block(
    &mut self,
    size: usize,
  ) -> Result<usize, HeapError> {
    if size == 0 {
      return Err(HeapError::ZeroSize);
    }

    let asize = adjusted_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;

    let bp = match self.free.find_fit(&self.region, asize) {
      Some(bp) => bp,
      None => {
        self
          .extend_heap(asize.max(self.config.chunk_size))
          .map_err(|_| HeapError::OutOfMemory { requested: size })?;
        self
          .free
          .find_fit(&self.region, asize)
          .ok_or(HeapError::OutOfMemory { requested: size })?
      }
    };

    self.place(bp, asize);
    Ok(bp)
  }

  /// Returns the block behind `ptr` to the heap. A null `ptr` is ignored.
  ///
  /// Pointers that do not name a live block of this heap are rejected before
  /// anything is written.
  pub fn release(
    &mut self,
    ptr: *mut u8,
  ) -> Result<(), HeapError> {
    if ptr.is_null() {
      return Ok(());
    }

    let bp = self.live_block(ptr)?;
    self.free_block(bp);
    Ok(())
  }

  /// Resizes the block behind `ptr` to hold `size` bytes, moving it if it
  /// cannot grow in place.
  ///
  /// A null `ptr` allocates; a zero `size` releases and returns `None`. On
  /// error the original block is untouched and `ptr` stays valid.
  pub fn reallocate(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, HeapError> {
    if ptr.is_null() {
      return self.allocate(size).map(Some);
    }
    if size == 0 {
      self.release(ptr)?;
      return Ok(None);
    }

    let bp = self.live_block(ptr)?;
    let asize = adjusted_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;
    let csize = self.region.header(bp).size();

    if asize <= csize {
      self.shrink(bp, asize);
      return Ok(Some(self.region.ptr_at(bp)));
    }

    let next = next_addr(bp, csize);
    let mut next_tag = self.region.header(next);

    if next_tag == Tag::EPILOGUE && self.extend_heap(asize - csize).is_ok() {
      next_tag = self.region.header(next);
    }

    if !next_tag.is_allocated() && csize + next_tag.size() >= asize {
      trace!("growing {bp:#x} in place into {next:#x} ({next_tag})");
      self.free.remove(&mut self.region, next);
      self
        .region
        .write_block(bp, Tag::pack(csize + next_tag.size(), true));
      self.shrink(bp, asize);
      return Ok(Some(self.region.ptr_at(bp)));
    }

    let dst = self.allocate_block(size)?;
    self.region.copy(bp, dst, (csize - OVERHEAD).min(size));
    self.free_block(bp);

    trace!("moved {bp:#x} to {dst:#x}");
    Ok(Some(self.region.ptr_at(dst)))
  }

  /// Payload bytes usable through `ptr`.
  ///
  /// `ptr` is checked the way [`Allocator::release`] checks it, so a freed
  /// block is reported as [`HeapError::DoubleRelease`].
  pub fn usable_size(
    &self,
    ptr: *const u8,
  ) -> Result<usize, HeapError> {
    let bp = self.live_block(ptr)?;
    Ok(self.region.header(bp).size() - OVERHEAD)
  }

  /// Grows the region by `bytes` and turns the new space into a free block,
  /// merged with a free block in front of it.
  fn extend_heap(
    &mut self,
    bytes: usize,
  ) -> Result<usize, HeapError> {
    let size = crate::checked_align!(bytes.max(MIN_BLOCK_SIZE))
      .ok_or(HeapError::OutOfMemory { requested: bytes })?;
    let bp = self.region.extend(size)?;

    // the old epilogue header becomes the new block's header
    self.region.write_block(bp, Tag::pack(size, false));
    self.region.write_epilogue(next_addr(bp, size));

    debug!("heap extended by {size} bytes, new block at {bp:#x}");
    Ok(self.coalesce(bp))
  }

  /// Carves an allocated block of `asize` bytes out of the free block at `bp`.
  fn place(
    &mut self,
    bp: usize,
    asize: usize,
  ) {
    let csize = self.region.header(bp).size();

    if csize - asize >= MIN_BLOCK_SIZE {
      let rest = next_addr(bp, asize);
      self.region.write_block(bp, Tag::pack(asize, true));
      self.region.write_block(rest, Tag::pack(csize - asize, false));
      self.free.replace(&mut self.region, bp, rest);
      trace!("placed {asize} at {bp:#x}, split off {} at {rest:#x}", csize - asize);
    } else {
      self.free.remove(&mut self.region, bp);
      self.region.write_block(bp, Tag::pack(csize, true));
      trace!("placed {asize} at {bp:#x} using all {csize}");
    }
  }

  /// Cuts the allocated block at `bp` down to `asize` when the tail is large
  /// enough to stand as a block of its own.
  fn shrink(
    &mut self,
    bp: usize,
    asize: usize,
  ) {
    let csize = self.region.header(bp).size();

    if csize - asize >= MIN_BLOCK_SIZE {
      let rest = next_addr(bp, asize);
      self.region.write_block(bp, Tag::pack(asize, true));
      self.region.write_block(rest, Tag::pack(csize - asize, false));
      self.coalesce(rest);
    }
  }

  fn free_block(
    &mut self,
    bp: usize,
  ) {
    let tag = self.region.header(bp).with_allocated(false);
    self.region.write_block(bp, tag);
    self.coalesce(bp);
  }

  /// Merges the free, unlisted block at `bp` with its free neighbors and
  /// lists the result. Returns the payload offset of the merged block.
  fn coalesce(
    &mut self,
    bp: usize,
  ) -> usize {
    let prev_alloc = self.region.prev_tag(bp).is_allocated();
    let next = self.region.next_block(bp);
    let next_tag = self.region.header(next);
    let size = self.region.header(bp).size();

    let merged = match (prev_alloc, next_tag.is_allocated()) {
      (true, true) => {
        self.free.insert(&mut self.region, bp);
        return bp;
      }
      (true, false) => {
        self
          .region
          .write_block(bp, Tag::pack(size + next_tag.size(), false));
        self.free.replace(&mut self.region, next, bp);
        bp
      }
      (false, true) => {
        // the predecessor keeps its place in the list
        let prev = self.region.prev_block(bp);
        let prev_size = self.region.header(prev).size();
        self.region.write_block(prev, Tag::pack(prev_size + size, false));
        prev
      }
      (false, false) => {
        let prev = self.region.prev_block(bp);
        let prev_size = self.region.header(prev).size();
        self.free.remove(&mut self.region, next);
        self
          .region
          .write_block(prev, Tag::pack(prev_size + size + next_tag.size(), false));
        prev
      }
    };

    trace!(
      "coalesced {bp:#x} into {merged:#x} ({})",
      self.region.header(merged)
    );
    merged
  }

  /// Offset of the allocated block whose payload starts at `ptr`.
  fn live_block(
    &self,
    ptr: *const u8,
  ) -> Result<usize, HeapError> {
    let addr = ptr as usize;
    let reject = |fault| {
      warn!("{addr:#x} is not a live block: {fault}");
      HeapError::InvalidRelease { addr, fault }
    };

    let bp = self
      .region
      .offset_of(ptr)
      .filter(|bp| *bp >= FIRST_BLOCK)
      .ok_or_else(|| reject(ReleaseFault::OutsideHeap))?;

    if bp % DSIZE != 0 {
      return Err(reject(ReleaseFault::Misaligned));
    }

    let header = self.region.header(bp);
    let size = header.size();
    if size < MIN_BLOCK_SIZE || next_addr(bp, size) > self.region.len() {
      return Err(reject(ReleaseFault::BadHeader { header }));
    }

    let footer = self.region.tag_at(footer_addr(bp, size));
    if footer != header {
      return Err(reject(ReleaseFault::TagMismatch { header, footer }));
    }

    if !header.is_allocated() {
      warn!("{addr:#x} is already free ({header})");
      return Err(HeapError::DoubleRelease { addr, tag: header });
    }

    if self.config.verify_releases && !self.walk().any(|(block, _)| block == bp) {
      return Err(reject(ReleaseFault::NotABlockStart));
    }

    Ok(bp)
  }

  /// `(payload offset, tag)` of every block between the sentinels.
  fn walk(
    &self,
  ) -> Walk<'_, G> {
    Walk {
      region: &self.region,
      bp: FIRST_BLOCK,
    }
  }

  /// Every block between the sentinels, in address order.
  pub fn blocks(
    &self,
  ) -> impl Iterator<Item = BlockInfo> + '_ {
    self.walk().map(|(bp, tag)| BlockInfo {
      payload: self.region.ptr_at(bp),
      size: tag.size(),
      allocated: tag.is_allocated(),
    })
  }

  /// Free block payloads in the order the free list holds them.
  pub fn free_blocks(
    &self,
  ) -> impl Iterator<Item = NonNull<u8>> + '_ {
    self.free.iter(&self.region).map(|bp| self.region.ptr_at(bp))
  }

  pub fn stats(
    &self,
  ) -> HeapStats {
    let mut stats = HeapStats {
      region_bytes: self.region.len(),
      ..HeapStats::default()
    };

    for (_, tag) in self.walk() {
      let size = tag.size();
      if tag.is_allocated() {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += size;
        stats.largest_free = stats.largest_free.max(size);
      }
    }

    stats
  }
}

impl<G> Allocator<G> {
  pub fn base(
    &self,
  ) -> *const u8 {
    self.region.base()
  }

  /// Current end of the region.
  pub fn brk(
    &self,
  ) -> *const u8 {
    self.region.brk()
  }

  pub fn config(
    &self,
  ) -> &HeapConfig {
    &self.config
  }

  pub(crate) fn region(
    &self,
  ) -> &HeapRegion<G> {
    &self.region
  }

  pub(crate) fn free_list(
    &self,
  ) -> &FreeList {
    &self.free
  }

  #[cfg(test)]
  pub(crate) fn region_mut(
    &mut self,
  ) -> &mut HeapRegion<G> {
    &mut self.region
  }
}

struct Walk<'a, G> {
  region: &'a HeapRegion<G>,
  bp: usize,
}

impl<G> Iterator for Walk<'_, G> {
  type Item = (usize, Tag);

  fn next(
    &mut self,
  ) -> Option<(usize, Tag)> {
    if self.bp >= self.region.len() {
      return None;
    }

    let tag = self.region.tag_at(header_addr(self.bp));
    if tag.size() == 0 {
      return None;
    }

    let bp = self.bp;
    self.bp = next_addr(bp, tag.size());
    Some((bp, tag))
  }
}

impl<G> FusedIterator for Walk<'_, G> {}

/// One block as seen by [`Allocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub payload: NonNull<u8>,
  /// Whole block, tags included.
  pub size: usize,
  pub allocated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub region_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{checker::Validator, config::FitPolicy};

  fn heap() -> Allocator<Reserved> {
    Allocator::reserved(1 << 20, HeapConfig::default()).unwrap()
  }

  fn assert_valid<G: Grow>(
    heap: &Allocator<G>,
  ) {
    let violations = Validator::new(heap).check(false);
    assert!(violations.is_empty(), "{violations:#?}");
  }

  fn size_of(
    heap: &Allocator<Reserved>,
    ptr: NonNull<u8>,
  ) -> usize {
    let bp = heap.region.offset_of(ptr.as_ptr()).unwrap();
    heap.region.header(bp).size()
  }

  #[test]
  fn test_adjusted_size() {
    assert_eq!(adjusted_size(1), Some(16));
    assert_eq!(adjusted_size(8), Some(16));
    assert_eq!(adjusted_size(9), Some(24));
    assert_eq!(adjusted_size(16), Some(24));
    assert_eq!(adjusted_size(24), Some(32));
    assert_eq!(adjusted_size(4096), Some(4104));
    assert_eq!(adjusted_size(usize::MAX), None);
    assert_eq!(adjusted_size(MAX_BLOCK_SIZE), None);
  }

  #[test]
  fn test_init_seeds_one_free_block() {
    let heap = heap();

    assert_eq!(heap.region.len(), SENTINEL_OVERHEAD + 4096);
    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].size, 4096);
    assert!(!blocks[0].allocated);
    assert_eq!(heap.free.len(), 1);
    assert_valid(&heap);
  }

  #[test]
  fn test_config_is_kept() {
    let config = HeapConfig::default()
      .with_chunk_size(8192)
      .with_policy(FitPolicy::BestFit);
    let heap = Allocator::reserved(1 << 20, config).unwrap();
    assert_eq!(heap.config(), &config);
  }

  #[test]
  fn test_init_without_seed() {
    let heap = Allocator::reserved(1 << 16, HeapConfig::default().with_initial_chunk(0)).unwrap();

    assert_eq!(heap.region.len(), SENTINEL_OVERHEAD);
    assert_eq!(heap.blocks().count(), 0);
    assert!(heap.free.is_empty());
    assert_valid(&heap);
  }

  #[test]
  fn test_init_fails_when_seed_does_not_fit() {
    let result = Allocator::reserved(1024, HeapConfig::default());
    assert!(matches!(result, Err(HeapError::OutOfMemory { .. })));
  }

  #[test]
  fn test_allocate_splits_seed_block() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();

    assert_eq!(a.as_ptr() as usize % DSIZE, 0);
    assert_eq!(heap.region.offset_of(a.as_ptr()), Some(FIRST_BLOCK));
    assert_eq!(size_of(&heap, a), 32);

    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, 4096 - 32);
    assert_valid(&heap);
  }

  #[test]
  fn test_allocate_zero_is_refused() {
    let mut heap = heap();
    let before = heap.stats();

    assert_eq!(heap.allocate(0), Err(HeapError::ZeroSize));
    assert_eq!(heap.stats(), before);
  }

  #[test]
  fn test_small_remainder_is_not_split() {
    let mut heap = Allocator::reserved(1 << 16, HeapConfig::default().with_initial_chunk(40)).unwrap();

    // 40 - 32 leaves 8 bytes, too small for a block
    let a = heap.allocate(24).unwrap();
    assert_eq!(size_of(&heap, a), 40);
    assert!(heap.free.is_empty());
    assert_valid(&heap);
  }

  #[test]
  fn test_first_fit_reuses_released_block() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let b = heap.allocate(40).unwrap();
    heap.release(a.as_ptr()).unwrap();

    let c = heap.allocate(16).unwrap();
    assert_eq!(c, a);
    assert!(c < b);
    assert_valid(&heap);
  }

  #[test]
  fn test_best_fit_prefers_smaller_hole() {
    let config = HeapConfig::default().with_policy(FitPolicy::BestFit);
    let mut heap = Allocator::reserved(1 << 20, config).unwrap();

    let big = heap.allocate(200).unwrap();
    let _guard = heap.allocate(8).unwrap();
    let small = heap.allocate(24).unwrap();
    let _guard2 = heap.allocate(8).unwrap();
    heap.release(big.as_ptr()).unwrap();
    heap.release(small.as_ptr()).unwrap();

    assert_eq!(heap.allocate(24).unwrap(), small);
    assert_valid(&heap);
  }

  #[test]
  fn test_release_null_is_noop() {
    let mut heap = heap();
    let _a = heap.allocate(100).unwrap();
    let before = heap.stats();

    assert_eq!(heap.release(std::ptr::null_mut()), Ok(()));
    assert_eq!(heap.stats(), before);
    assert_valid(&heap);
  }

  #[test]
  fn test_coalesce_all_four_cases() {
    let mut heap = heap();
    let blocks: Vec<_> = (0..6).map(|_| heap.allocate(24).unwrap()).collect();
    let rest = heap.stats().free_bytes;

    // neither neighbor free
    heap.release(blocks[1].as_ptr()).unwrap();
    assert_eq!(heap.stats().free_blocks, 2);

    // predecessor free
    heap.release(blocks[2].as_ptr()).unwrap();
    assert_eq!(heap.stats().free_blocks, 2);
    assert_eq!(size_of(&heap, blocks[1]), 64);

    // neither neighbor free again
    heap.release(blocks[4].as_ptr()).unwrap();
    assert_eq!(heap.stats().free_blocks, 3);
    assert_eq!(size_of(&heap, blocks[4]), 32);

    // both free: 3 joins 1..=2 in front and 4 behind
    heap.release(blocks[3].as_ptr()).unwrap();
    assert_eq!(heap.stats().free_blocks, 2);
    assert_eq!(size_of(&heap, blocks[1]), 128);

    // both free: 5 joins the run in front and the tail behind
    heap.release(blocks[5].as_ptr()).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(size_of(&heap, blocks[1]), 5 * 32 + rest);
    assert_valid(&heap);

    // successor free: 0 absorbs everything behind it
    heap.release(blocks[0].as_ptr()).unwrap();
    assert_eq!(size_of(&heap, blocks[0]), 4096);
    assert_eq!(heap.stats().largest_free, 4096);
    assert_valid(&heap);
  }

  #[test]
  fn test_large_request_grows_region() {
    let mut heap = heap();
    let before = heap.region.len();

    let p = heap.allocate(10_000).unwrap();
    assert!(heap.region.len() - before >= adjusted_size(10_000).unwrap());
    assert!(size_of(&heap, p) >= 10_000 + OVERHEAD);
    assert_valid(&heap);
  }

  #[test]
  fn test_growth_merges_with_free_tail() {
    let mut heap = heap();
    let _a = heap.allocate(1000).unwrap();

    // the free tail is too small; new space is merged with it, not placed after it
    let tail = heap.free.head().unwrap();
    let p = heap.allocate(5000).unwrap();
    assert_eq!(heap.region.offset_of(p.as_ptr()), Some(tail));
    assert_valid(&heap);
  }

  #[test]
  fn test_exhaustion_leaves_heap_untouched() {
    let mut heap = Allocator::reserved(8192, HeapConfig::default()).unwrap();
    let a = heap.allocate(2000).unwrap();
    let before = heap.stats();

    assert_eq!(
      heap.allocate(100_000),
      Err(HeapError::OutOfMemory { requested: 100_000 })
    );
    assert_eq!(heap.stats(), before);
    assert_eq!(heap.usable_size(a.as_ptr()), Ok(2000));
    assert_valid(&heap);
  }

  #[test]
  fn test_huge_chunk_size_fails_without_touching_heap() {
    let config = HeapConfig::default().with_chunk_size(usize::MAX);
    let mut heap = Allocator::reserved(1 << 20, config).unwrap();
    let a = heap.allocate(24).unwrap();
    let before = heap.stats();

    assert_eq!(
      heap.allocate(8000),
      Err(HeapError::OutOfMemory { requested: 8000 })
    );
    assert_eq!(heap.stats(), before);
    assert_eq!(heap.usable_size(a.as_ptr()), Ok(24));
    assert_valid(&heap);

    // requests that fit the existing space still succeed
    assert!(heap.allocate(100).is_ok());
    assert_valid(&heap);
  }

  #[test]
  fn test_huge_initial_chunk_fails_init() {
    for initial_chunk in [usize::MAX, usize::MAX - 2, MAX_BLOCK_SIZE + 1] {
      let config = HeapConfig::default().with_initial_chunk(initial_chunk);
      assert!(matches!(
        Allocator::reserved(1 << 20, config),
        Err(HeapError::OutOfMemory { .. })
      ));
    }
  }

  #[test]
  fn test_free_blocks_follow_address_order() {
    let mut heap = heap();
    let ptrs: Vec<_> = (0..8).map(|_| heap.allocate(40).unwrap()).collect();
    for i in [5, 1, 3] {
      heap.release(ptrs[i].as_ptr()).unwrap();
    }

    let listed: Vec<_> = heap.free_blocks().collect();
    let walked: Vec<_> = heap
      .blocks()
      .filter(|block| !block.allocated)
      .map(|block| block.payload)
      .collect();

    assert_eq!(listed.len(), 4);
    assert_eq!(listed, walked);
    assert_eq!(listed[..3], [ptrs[1], ptrs[3], ptrs[5]]);
  }

  #[test]
  fn test_double_release_is_reported() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let _b = heap.allocate(24).unwrap();

    heap.release(a.as_ptr()).unwrap();
    assert!(matches!(
      heap.release(a.as_ptr()),
      Err(HeapError::DoubleRelease { .. })
    ));
    assert_valid(&heap);
  }

  #[test]
  fn test_foreign_pointers_are_rejected() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let mut outside = 0u64;

    let err = heap.release((&raw mut outside).cast()).unwrap_err();
    assert!(matches!(
      err,
      HeapError::InvalidRelease {
        fault: ReleaseFault::OutsideHeap,
        ..
      }
    ));

    let err = heap.release(a.as_ptr().wrapping_add(4)).unwrap_err();
    assert!(matches!(
      err,
      HeapError::InvalidRelease {
        fault: ReleaseFault::Misaligned,
        ..
      }
    ));

    // the prologue is not a user block
    let err = heap.release(heap.region.ptr_at(PROLOGUE).as_ptr()).unwrap_err();
    assert!(matches!(
      err,
      HeapError::InvalidRelease {
        fault: ReleaseFault::OutsideHeap,
        ..
      }
    ));

    assert_eq!(heap.usable_size(a.as_ptr()), Ok(64));
    assert_valid(&heap);
  }

  #[test]
  fn test_interior_pointer_with_forged_tags() {
    let config = HeapConfig::default().with_verify_releases(true);
    let mut heap = Allocator::reserved(1 << 20, config).unwrap();
    let a = heap.allocate(64).unwrap();

    // a payload that looks like a 16-byte allocated block at a + 8
    let forged = Tag::pack(16, true).raw();
    unsafe {
      a.as_ptr().add(4).cast::<u32>().write(forged);
      a.as_ptr().add(16).cast::<u32>().write(forged);
    }

    let err = heap.release(a.as_ptr().wrapping_add(8)).unwrap_err();
    assert!(matches!(
      err,
      HeapError::InvalidRelease {
        fault: ReleaseFault::NotABlockStart,
        ..
      }
    ));
    assert_valid(&heap);
  }

  #[test]
  fn test_reallocate_null_and_zero() {
    let mut heap = heap();

    let p = heap.reallocate(std::ptr::null_mut(), 32).unwrap().unwrap();
    assert_eq!(heap.usable_size(p.as_ptr()), Ok(32));

    assert_eq!(heap.reallocate(p.as_ptr(), 0), Ok(None));
    assert_eq!(heap.stats().allocated_blocks, 0);
    assert_valid(&heap);
  }

  #[test]
  fn test_reallocate_shrinks_in_place() {
    let mut heap = heap();
    let p = heap.allocate(200).unwrap();
    let _guard = heap.allocate(8).unwrap();

    let q = heap.reallocate(p.as_ptr(), 40).unwrap().unwrap();
    assert_eq!(q, p);
    assert_eq!(size_of(&heap, q), 48);
    assert_eq!(heap.stats().free_blocks, 2);
    assert_valid(&heap);
  }

  #[test]
  fn test_reallocate_grows_into_free_successor() {
    let mut heap = heap();
    let p = heap.allocate(32).unwrap();
    let next = heap.allocate(64).unwrap();
    let _guard = heap.allocate(8).unwrap();
    unsafe { p.as_ptr().write_bytes(0x5A, 32) };
    heap.release(next.as_ptr()).unwrap();

    let q = heap.reallocate(p.as_ptr(), 80).unwrap().unwrap();
    assert_eq!(q, p);
    assert!(heap.usable_size(q.as_ptr()).unwrap() >= 80);
    let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 32) };
    assert!(bytes.iter().all(|b| *b == 0x5A));
    assert_valid(&heap);
  }

  #[test]
  fn test_reallocate_grows_at_end_of_heap() {
    let mut heap = Allocator::reserved(1 << 20, HeapConfig::default().with_initial_chunk(64)).unwrap();
    let p = heap.allocate(56).unwrap();
    assert!(heap.free.is_empty());

    let q = heap.reallocate(p.as_ptr(), 500).unwrap().unwrap();
    assert_eq!(q, p);
    assert!(heap.usable_size(q.as_ptr()).unwrap() >= 500);
    assert_valid(&heap);
  }

  #[test]
  fn test_reallocate_moves_and_copies() {
    let mut heap = heap();
    let p = heap.allocate(24).unwrap();
    let _wall = heap.allocate(24).unwrap();
    for i in 0..24 {
      unsafe { p.as_ptr().add(i).write(i as u8) };
    }

    let q = heap.reallocate(p.as_ptr(), 300).unwrap().unwrap();
    assert_ne!(q, p);
    for i in 0..24 {
      assert_eq!(unsafe { q.as_ptr().add(i).read() }, i as u8);
    }
    assert!(matches!(
      heap.usable_size(p.as_ptr()),
      Err(HeapError::DoubleRelease { .. })
    ));
    assert_valid(&heap);
  }

  #[test]
  fn test_failed_reallocate_keeps_original() {
    let mut heap = Allocator::reserved(8192, HeapConfig::default()).unwrap();
    let p = heap.allocate(100).unwrap();
    let _wall = heap.allocate(100).unwrap();
    unsafe { p.as_ptr().write_bytes(0xC3, 100) };
    let before = heap.stats();

    assert!(matches!(
      heap.reallocate(p.as_ptr(), 1 << 20),
      Err(HeapError::OutOfMemory { .. })
    ));
    assert_eq!(heap.stats(), before);
    assert_eq!(heap.usable_size(p.as_ptr()), Ok(104));
    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 100) };
    assert!(bytes.iter().all(|b| *b == 0xC3));
    assert_valid(&heap);
  }

  #[test]
  fn test_payloads_are_writable_and_disjoint() {
    let mut heap = heap();
    let sizes = [1, 7, 8, 9, 31, 64, 100, 513, 4000];
    let ptrs: Vec<_> = sizes.iter().map(|s| heap.allocate(*s).unwrap()).collect();

    for (i, (p, size)) in ptrs.iter().zip(sizes).enumerate() {
      unsafe { p.as_ptr().write_bytes(i as u8, size) };
    }
    for (i, (p, size)) in ptrs.iter().zip(sizes).enumerate() {
      let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
      assert!(bytes.iter().all(|b| *b == i as u8));
    }
    assert_valid(&heap);
  }
}
