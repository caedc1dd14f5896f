use thiserror::Error;

use crate::block::Tag;

/// Failures surfaced by the public heap operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
  /// The growth primitive could not extend the region. Nothing in the heap
  /// was changed.
  #[error("out of memory: cannot satisfy a request for {requested} bytes")]
  OutOfMemory { requested: usize },
  /// `allocate(0)` never hands out a block.
  #[error("zero-sized allocation request")]
  ZeroSize,
  /// The pointer does not name a block of this heap.
  #[error("invalid release of {addr:#x}: {fault}")]
  InvalidRelease { addr: usize, fault: ReleaseFault },
  /// The pointer names a block that is already free.
  #[error("double release of {addr:#x} (block tag {tag})")]
  DoubleRelease { addr: usize, tag: Tag },
  /// Reported by the checker only.
  #[error(
    "heap corruption: {} violation(s), first: {}",
    .0.len(),
    .0.first().map(ToString::to_string).unwrap_or_default()
  )]
  Corruption(Vec<Violation>),
}

/// Why a pointer handed to `release`/`reallocate` was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseFault {
  #[error("address outside the heap")]
  OutsideHeap,
  #[error("address is not double-word aligned")]
  Misaligned,
  #[error("header {header} does not describe a block")]
  BadHeader { header: Tag },
  #[error("header {header} does not match footer {footer}")]
  TagMismatch { header: Tag, footer: Tag },
  #[error("address is not the start of a block")]
  NotABlockStart,
}

/// A broken heap invariant found by the checker. Offsets are relative to the
/// region base.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
  #[error("bad prologue: expected {expected}, found header {header} footer {footer}")]
  BadPrologue {
    expected: Tag,
    header: Tag,
    footer: Tag,
  },
  #[error("bad epilogue at {offset:#x}: expected {expected}, found {found}")]
  BadEpilogue {
    offset: usize,
    expected: Tag,
    found: Tag,
  },
  #[error("payload {offset:#x} is not double-word aligned")]
  Misaligned { offset: usize },
  #[error("block {offset:#x}: header {header} does not match footer {footer}")]
  TagMismatch {
    offset: usize,
    header: Tag,
    footer: Tag,
  },
  #[error("block {offset:#x}: size {size} is below the minimum block size")]
  UndersizedBlock { offset: usize, size: usize },
  #[error("block {offset:#x}: size {size} runs past the end of the region ({extent:#x})")]
  OutOfBounds {
    offset: usize,
    size: usize,
    extent: usize,
  },
  #[error("blocks {first:#x} and {second:#x} are adjacent and both free")]
  AdjacentFree { first: usize, second: usize },
  #[error("block sizes sum to {walked}, expected {expected}")]
  SizeAccounting { walked: usize, expected: usize },
  #[error("free block {offset:#x} is not in the free list")]
  FreeNotIndexed { offset: usize },
  #[error("free list entry {offset:#x} is not a free block (tag {tag})")]
  IndexedNotFree { offset: usize, tag: Tag },
  #[error("free list entry {offset:#x} follows {prev:#x}, list must ascend by address")]
  IndexOutOfOrder { prev: usize, offset: usize },
  #[error("free list link at {offset:#x}: expected {expected:#x}, found {found:#x}")]
  BrokenLink {
    offset: usize,
    expected: usize,
    found: usize,
  },
  #[error("free list holds {listed} entries, heap walk found {walked} free blocks")]
  IndexCount { listed: usize, walked: usize },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_release_errors_carry_address_and_tags() {
    let err = HeapError::InvalidRelease {
      addr: 0x1010,
      fault: ReleaseFault::TagMismatch {
        header: Tag::pack(32, true),
        footer: Tag::pack(48, false),
      },
    };
    assert_eq!(
      err.to_string(),
      "invalid release of 0x1010: header 32:a does not match footer 48:f"
    );

    let err = HeapError::DoubleRelease {
      addr: 0x20,
      tag: Tag::pack(16, false),
    };
    assert_eq!(err.to_string(), "double release of 0x20 (block tag 16:f)");
  }

  #[test]
  fn test_corruption_reports_first_violation() {
    let err = HeapError::Corruption(vec![
      Violation::Misaligned { offset: 0x14 },
      Violation::SizeAccounting {
        walked: 8,
        expected: 16,
      },
    ]);
    assert_eq!(
      err.to_string(),
      "heap corruption: 2 violation(s), first: payload 0x14 is not double-word aligned"
    );
  }
}
