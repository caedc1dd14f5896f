//! Explicit free list.
//!
//! Free blocks are chained through two link words stored in their own
//! payload, so the list needs no memory of its own:
//!
//! ```text
//!   ┌────────┬────────┬────────┬──────────────┬────────┐
//!   │ header │  pred  │  succ  │   (unused)   │ footer │
//!   └────────┴────────┴────────┴──────────────┴────────┘
//!            ▲ bp     ▲ bp + 4
//! ```
//!
//! Links are payload offsets from the region base, `0` meaning none. The
//! list is kept sorted by address, which makes a front-to-back scan return
//! the lowest-addressed fit.

use std::iter::FusedIterator;

use crate::{
  block::{BlockTags, WSIZE, Words},
  config::FitPolicy,
};

const NIL: u32 = 0;

fn read_link<M: Words + ?Sized>(
  mem: &M,
  offset: usize,
) -> Option<usize> {
  match mem.word(offset) {
    NIL => None,
    link => Some(link as usize),
  }
}

fn write_link<M: Words + ?Sized>(
  mem: &mut M,
  offset: usize,
  link: Option<usize>,
) {
  mem.set_word(offset, link.map_or(NIL, |bp| bp as u32));
}

/// Predecessor link of the free block at `bp`.
pub fn pred<M: Words + ?Sized>(
  mem: &M,
  bp: usize,
) -> Option<usize> {
  read_link(mem, bp)
}

/// Successor link of the free block at `bp`.
pub fn succ<M: Words + ?Sized>(
  mem: &M,
  bp: usize,
) -> Option<usize> {
  read_link(mem, bp + WSIZE)
}

#[derive(Debug, Clone)]
pub struct FreeList {
  head: Option<usize>,
  len: usize,
  policy: FitPolicy,
}

impl FreeList {
  pub fn new(
    policy: FitPolicy,
  ) -> Self {
    Self {
      head: None,
      len: 0,
      policy,
    }
  }

  pub fn head(
    &self,
  ) -> Option<usize> {
    self.head
  }

  pub fn len(
    &self,
  ) -> usize {
    self.len
  }

  pub fn is_empty(
    &self,
  ) -> bool {
    self.len == 0
  }

  /// Links the free block at `bp` in at its address-ordered position.
  pub fn insert<M: Words + ?Sized>(
    &mut self,
    mem: &mut M,
    bp: usize,
  ) {
    let mut prev = None;
    let mut next = self.head;

    while let Some(cur) = next {
      if cur > bp {
        break;
      }
      debug_assert_ne!(cur, bp, "block {bp:#x} is already listed");
      prev = Some(cur);
      next = succ(mem, cur);
    }

    self.link_between(mem, prev, bp, next);
    self.len += 1;
  }

  /// Unlinks the free block at `bp`.
  pub fn remove<M: Words + ?Sized>(
    &mut self,
    mem: &mut M,
    bp: usize,
  ) {
    let prev = pred(mem, bp);
    let next = succ(mem, bp);

    match prev {
      Some(prev) => write_link(mem, prev + WSIZE, next),
      None => self.head = next,
    }
    if let Some(next) = next {
      write_link(mem, next, prev);
    }

    self.len -= 1;
  }

  /// Puts the free block at `new` in the place of the listed block `old`.
  ///
  /// No other listed block may lie between the two, which holds when `new`
  /// is the tail split off `old` or `old` is absorbed into its predecessor.
  pub fn replace<M: Words + ?Sized>(
    &mut self,
    mem: &mut M,
    old: usize,
    new: usize,
  ) {
    let prev = pred(mem, old);
    let next = succ(mem, old);
    self.link_between(mem, prev, new, next);
  }

  fn link_between<M: Words + ?Sized>(
    &mut self,
    mem: &mut M,
    prev: Option<usize>,
    bp: usize,
    next: Option<usize>,
  ) {
    write_link(mem, bp, prev);
    write_link(mem, bp + WSIZE, next);

    match prev {
      Some(prev) => write_link(mem, prev + WSIZE, Some(bp)),
      None => self.head = Some(bp),
    }
    if let Some(next) = next {
      write_link(mem, next, Some(bp));
    }
  }

  /// A listed block of at least `asize` bytes, chosen by the list's policy.
  pub fn find_fit<M: Words + ?Sized>(
    &self,
    mem: &M,
    asize: usize,
  ) -> Option<usize> {
    match self.policy {
      FitPolicy::FirstFit => self.iter(mem).find(|bp| mem.header(*bp).size() >= asize),
      FitPolicy::BestFit => {
        let mut best: Option<(usize, usize)> = None;

        for bp in self.iter(mem) {
          let size = mem.header(bp).size();
          if size == asize {
            return Some(bp);
          }
          if size > asize && best.is_none_or(|(_, best_size)| size < best_size) {
            best = Some((bp, size));
          }
        }

        best.map(|(bp, _)| bp)
      }
    }
  }

  /// Listed blocks in ascending address order.
  pub fn iter<'a, M: Words + ?Sized>(
    &self,
    mem: &'a M,
  ) -> FreeBlocks<'a, M> {
    FreeBlocks {
      mem,
      next: self.head,
      remaining: self.len,
    }
  }
}

pub struct FreeBlocks<'a, M: ?Sized> {
  mem: &'a M,
  next: Option<usize>,
  remaining: usize,
}

impl<M: Words + ?Sized> Iterator for FreeBlocks<'_, M> {
  type Item = usize;

  fn next(
    &mut self,
  ) -> Option<usize> {
    if self.remaining == 0 {
      return None;
    }
    let bp = self.next?;
    self.remaining -= 1;
    self.next = succ(self.mem, bp);
    Some(bp)
  }
}

impl<M: Words + ?Sized> FusedIterator for FreeBlocks<'_, M> {}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::{Tag, tests::Scratch};

  /// Lays out free blocks of the given `(bp, size)` with allocated filler
  /// after each one.
  fn scratch_with(
    blocks: &[(usize, usize)],
  ) -> Scratch {
    let mut mem = Scratch::new(1024);
    for &(bp, size) in blocks {
      mem.write_block(bp, Tag::pack(size, false));
    }
    mem
  }

  fn listed(
    list: &FreeList,
    mem: &Scratch,
  ) -> Vec<usize> {
    list.iter(mem).collect()
  }

  #[test]
  fn test_insert_keeps_address_order() {
    let blocks = [(16, 32), (80, 16), (160, 64), (320, 24), (400, 16)];
    let mut mem = scratch_with(&blocks);
    let mut list = FreeList::new(FitPolicy::FirstFit);

    for bp in [160, 16, 400, 80, 320] {
      list.insert(&mut mem, bp);
    }

    assert_eq!(list.len(), 5);
    assert_eq!(list.head(), Some(16));
    assert_eq!(listed(&list, &mem), vec![16, 80, 160, 320, 400]);
    assert_eq!(pred(&mem, 16), None);
    assert_eq!(succ(&mem, 400), None);
    assert_eq!(pred(&mem, 320), Some(160));
    assert_eq!(succ(&mem, 80), Some(160));
  }

  #[test]
  fn test_remove_head_middle_tail() {
    let blocks = [(16, 32), (80, 16), (160, 64)];
    let mut mem = scratch_with(&blocks);
    let mut list = FreeList::new(FitPolicy::FirstFit);
    for (bp, _) in blocks {
      list.insert(&mut mem, bp);
    }

    list.remove(&mut mem, 80);
    assert_eq!(listed(&list, &mem), vec![16, 160]);
    assert_eq!(pred(&mem, 160), Some(16));

    list.remove(&mut mem, 16);
    assert_eq!(list.head(), Some(160));
    assert_eq!(pred(&mem, 160), None);

    list.remove(&mut mem, 160);
    assert!(list.is_empty());
    assert_eq!(list.head(), None);
    assert_eq!(listed(&list, &mem), Vec::<usize>::new());
  }

  #[test]
  fn test_replace_takes_over_position() {
    let blocks = [(16, 32), (80, 64), (240, 16)];
    let mut mem = scratch_with(&blocks);
    let mut list = FreeList::new(FitPolicy::FirstFit);
    for (bp, _) in blocks {
      list.insert(&mut mem, bp);
    }

    // the tail of the block at 80 is split off
    mem.write_block(80, Tag::pack(24, true));
    mem.write_block(104, Tag::pack(40, false));
    list.replace(&mut mem, 80, 104);

    assert_eq!(list.len(), 3);
    assert_eq!(listed(&list, &mem), vec![16, 104, 240]);
    assert_eq!(succ(&mem, 16), Some(104));
    assert_eq!(pred(&mem, 240), Some(104));
  }

  #[test]
  fn test_first_fit_takes_lowest_address() {
    let blocks = [(16, 32), (80, 128), (240, 48), (320, 48)];
    let mut mem = scratch_with(&blocks);
    let mut list = FreeList::new(FitPolicy::FirstFit);
    for (bp, _) in blocks {
      list.insert(&mut mem, bp);
    }

    assert_eq!(list.find_fit(&mem, 16), Some(16));
    assert_eq!(list.find_fit(&mem, 40), Some(80));
    assert_eq!(list.find_fit(&mem, 128), Some(80));
    assert_eq!(list.find_fit(&mem, 136), None);
  }

  #[test]
  fn test_best_fit_takes_smallest_then_lowest() {
    let blocks = [(16, 32), (80, 128), (240, 48), (320, 48)];
    let mut mem = scratch_with(&blocks);
    let mut list = FreeList::new(FitPolicy::BestFit);
    for (bp, _) in blocks {
      list.insert(&mut mem, bp);
    }

    assert_eq!(list.find_fit(&mem, 40), Some(240));
    assert_eq!(list.find_fit(&mem, 48), Some(240));
    assert_eq!(list.find_fit(&mem, 24), Some(16));
    assert_eq!(list.find_fit(&mem, 56), Some(80));
    assert_eq!(list.find_fit(&mem, 256), None);
  }

  #[test]
  fn test_empty_list_has_no_fit() {
    let mem = Scratch::new(64);
    let list = FreeList::new(FitPolicy::FirstFit);
    assert_eq!(list.find_fit(&mem, 16), None);
    assert_eq!(list.iter(&mem).next(), None);
  }
}
