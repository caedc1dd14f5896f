//! Read-only heap consistency checks.
//!
//! Meant for tests and debugging sessions after arbitrary sequences of heap
//! operations, never for the allocation path itself. Every offset is bounds
//! checked before it is read, so a corrupted heap yields violations instead of
//! a panic.

use log::trace;

use crate::{
  block::{BlockTags, DSIZE, MIN_BLOCK_SIZE, Tag, WSIZE, Words, footer_addr, next_addr},
  error::{HeapError, Violation},
  free_list,
  heap::{Allocator, FIRST_BLOCK, PROLOGUE, SENTINEL_OVERHEAD},
};

pub struct Validator<'a, G> {
  heap: &'a Allocator<G>,
}

impl<'a, G> Validator<'a, G> {
  pub fn new(
    heap: &'a Allocator<G>,
  ) -> Self {
    Self { heap }
  }

  /// Every broken invariant, in the order found. With `verbose`, each block
  /// is also logged at trace level.
  pub fn check(
    &self,
    verbose: bool,
  ) -> Vec<Violation> {
    let mut violations = Vec::new();
    let extent = self.heap.region().extent();

    if extent < SENTINEL_OVERHEAD {
      violations.push(Violation::OutOfBounds {
        offset: 0,
        size: SENTINEL_OVERHEAD,
        extent,
      });
      return violations;
    }

    self.check_prologue(verbose, &mut violations);
    let free = self.check_blocks(verbose, &mut violations);
    self.check_free_list(&free, &mut violations);

    violations
  }

  fn check_prologue(
    &self,
    verbose: bool,
    violations: &mut Vec<Violation>,
  ) {
    let region = self.heap.region();
    let header = region.header(PROLOGUE);
    let footer = region.tag_at(footer_addr(PROLOGUE, DSIZE));

    if verbose {
      trace!("heap ({:?}):", region.base());
      trace!("{PROLOGUE:#x}: prologue [{header}] [{footer}]");
    }

    if header != Tag::PROLOGUE || footer != Tag::PROLOGUE {
      violations.push(Violation::BadPrologue {
        expected: Tag::PROLOGUE,
        header,
        footer,
      });
    }
  }

  /// Walks the blocks in address order and returns the free ones.
  fn check_blocks(
    &self,
    verbose: bool,
    violations: &mut Vec<Violation>,
  ) -> Vec<usize> {
    let region = self.heap.region();
    let extent = region.extent();
    let expected = extent - SENTINEL_OVERHEAD;

    let mut free = Vec::new();
    let mut walked = 0;
    let mut prev_free = None;
    let mut bp = FIRST_BLOCK;

    loop {
      if bp > extent {
        violations.push(Violation::OutOfBounds {
          offset: bp,
          size: 0,
          extent,
        });
        break;
      }

      let header = region.header(bp);
      let size = header.size();

      if size == 0 {
        if verbose {
          trace!("{bp:#x}: epilogue [{header}]");
        }
        if header != Tag::EPILOGUE {
          violations.push(Violation::BadEpilogue {
            offset: bp,
            expected: Tag::EPILOGUE,
            found: header,
          });
        }
        break;
      }

      if bp % DSIZE != 0 {
        violations.push(Violation::Misaligned { offset: bp });
      }
      if size < MIN_BLOCK_SIZE {
        violations.push(Violation::UndersizedBlock { offset: bp, size });
      }

      let next = next_addr(bp, size);
      if next > extent {
        violations.push(Violation::OutOfBounds {
          offset: bp,
          size,
          extent,
        });
        break;
      }

      let footer = region.tag_at(footer_addr(bp, size));
      if verbose {
        trace!("{bp:#x}: header [{header}] footer [{footer}]");
      }
      if footer != header {
        violations.push(Violation::TagMismatch {
          offset: bp,
          header,
          footer,
        });
      }

      if header.is_allocated() {
        prev_free = None;
      } else {
        if let Some(first) = prev_free {
          violations.push(Violation::AdjacentFree { first, second: bp });
        }
        prev_free = Some(bp);
        free.push(bp);
      }

      walked += size;
      bp = next;
    }

    if walked != expected {
      violations.push(Violation::SizeAccounting { walked, expected });
    }

    free
  }

  /// Follows the free list and matches it against the free blocks found by
  /// the walk.
  fn check_free_list(
    &self,
    walked_free: &[usize],
    violations: &mut Vec<Violation>,
  ) {
    let region = self.heap.region();
    let list = self.heap.free_list();
    let extent = region.extent();

    let mut listed = Vec::new();
    let mut prev: Option<usize> = None;
    let mut next = list.head();

    while let Some(bp) = next {
      if bp < FIRST_BLOCK || bp % DSIZE != 0 || bp + 2 * WSIZE > extent {
        violations.push(Violation::OutOfBounds {
          offset: bp,
          size: 0,
          extent,
        });
        break;
      }

      // ascending order also guarantees the loop ends
      if let Some(prev) = prev.filter(|prev| bp <= *prev) {
        violations.push(Violation::IndexOutOfOrder { prev, offset: bp });
        break;
      }

      let tag = region.header(bp);
      if tag.is_allocated() || walked_free.binary_search(&bp).is_err() {
        violations.push(Violation::IndexedNotFree { offset: bp, tag });
      }

      let pred = free_list::pred(region, bp);
      if pred != prev {
        violations.push(Violation::BrokenLink {
          offset: bp,
          expected: prev.unwrap_or(0),
          found: pred.unwrap_or(0),
        });
      }

      listed.push(bp);
      prev = Some(bp);
      next = free_list::succ(region, bp);
    }

    for &bp in walked_free {
      if listed.binary_search(&bp).is_err() {
        violations.push(Violation::FreeNotIndexed { offset: bp });
      }
    }

    if list.len() != walked_free.len() {
      violations.push(Violation::IndexCount {
        listed: list.len(),
        walked: walked_free.len(),
      });
    }
  }
}

impl<G> Allocator<G> {
  /// Runs the [`Validator`] over this heap.
  pub fn check(
    &self,
    verbose: bool,
  ) -> Vec<Violation> {
    Validator::new(self).check(verbose)
  }

  /// `Ok` when no invariant is broken, every violation otherwise.
  pub fn validate(
    &self,
  ) -> Result<(), HeapError> {
    let violations = self.check(false);
    if violations.is_empty() {
      Ok(())
    } else {
      Err(HeapError::Corruption(violations))
    }
  }
}
