//! Boundary tags.
//!
//! Every block carries the same 32-bit tag twice, once in the word before its
//! payload and once in the last word of the block:
//!
//! ```text
//!    31                     3  2  1  0
//!   -----------------------------------
//!  | s  s  s  s  ... s  s  s  0  0  a/f |
//!   -----------------------------------
//!
//!           bp - 4     bp                         bp + size - 8
//!   ... ─┬─────────┬────────────────────────────┬─────────┬─ ...
//!        │ header  │ payload                    │ footer  │
//!   ... ─┴─────────┴────────────────────────────┴─────────┴─ ...
//! ```
//!
//! Blocks are addressed by the byte offset of their payload (`bp`) from the
//! region base. All arithmetic here is over offsets; the memory behind them is
//! reached through [`Words`].

use std::fmt;

/// Word size in bytes. Tags and free-list links are one word each.
pub const WSIZE: usize = 4;

/// Double word size in bytes, the payload alignment.
pub const DSIZE: usize = 8;

/// Header plus footer.
pub const OVERHEAD: usize = 2 * WSIZE;

/// Header, footer and room for the two free-list links.
pub const MIN_BLOCK_SIZE: usize = OVERHEAD + 2 * WSIZE;

/// Largest size a tag can describe.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !0x7;

const SIZE_MASK: u32 = !0x7;
const ALLOC_BIT: u32 = 0x1;

/// A packed `size | allocated` word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u32);

impl Tag {
  /// The epilogue tag: zero size, allocated.
  pub const EPILOGUE: Tag = Tag::pack(0, true);

  /// The prologue tag: one double word, allocated.
  pub const PROLOGUE: Tag = Tag::pack(DSIZE, true);

  /// Packs a size and an allocated bit into a tag. Low bits of `size` below
  /// the double word are dropped.
  pub const fn pack(
    size: usize,
    allocated: bool,
  ) -> Self {
    Self((size as u32 & SIZE_MASK) | allocated as u32)
  }

  pub const fn from_raw(
    raw: u32,
  ) -> Self {
    Self(raw)
  }

  pub const fn raw(
    self,
  ) -> u32 {
    self.0
  }

  pub const fn size(
    self,
  ) -> usize {
    (self.0 & SIZE_MASK) as usize
  }

  pub const fn is_allocated(
    self,
  ) -> bool {
    self.0 & ALLOC_BIT != 0
  }

  /// Same size, allocated bit set to `allocated`.
  pub const fn with_allocated(
    self,
    allocated: bool,
  ) -> Self {
    Self::pack(self.size(), allocated)
  }
}

impl fmt::Debug for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "Tag({self})")
  }
}

impl fmt::Display for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let flag = if self.is_allocated() { 'a' } else { 'f' };
    write!(f, "{}:{}", self.size(), flag)?;
    if self.0 & 0x6 != 0 {
      write!(f, " (raw {:#010x})", self.0)?;
    }
    Ok(())
  }
}

/// Offset of the header of the block at `bp`.
pub const fn header_addr(
  bp: usize,
) -> usize {
  bp - WSIZE
}

/// Offset of the footer of a block at `bp` spanning `size` bytes.
pub const fn footer_addr(
  bp: usize,
  size: usize,
) -> usize {
  bp + size - DSIZE
}

/// Payload offset of the block following a block at `bp` of `size` bytes.
pub const fn next_addr(
  bp: usize,
  size: usize,
) -> usize {
  bp + size
}

/// Offset of the footer of the block preceding `bp`.
pub const fn prev_footer_addr(
  bp: usize,
) -> usize {
  bp - DSIZE
}

/// Word-granular access to the memory that blocks live in.
///
/// Offsets passed in must be word aligned and lie below [`Words::extent`];
/// implementations are free to panic otherwise.
pub trait Words {
  fn word(
    &self,
    offset: usize,
  ) -> u32;

  fn set_word(
    &mut self,
    offset: usize,
    value: u32,
  );

  /// Number of addressable bytes.
  fn extent(
    &self,
  ) -> usize;
}

/// Boundary-tag reads and writes, derived from [`Words`].
pub trait BlockTags: Words {
  fn tag_at(
    &self,
    offset: usize,
  ) -> Tag {
    Tag::from_raw(self.word(offset))
  }

  fn header(
    &self,
    bp: usize,
  ) -> Tag {
    self.tag_at(header_addr(bp))
  }

  /// Footer located through the size in the header.
  fn footer(
    &self,
    bp: usize,
  ) -> Tag {
    self.tag_at(footer_addr(bp, self.header(bp).size()))
  }

  /// Writes `tag` as both header and footer of the block at `bp`.
  fn write_block(
    &mut self,
    bp: usize,
    tag: Tag,
  ) {
    self.set_word(header_addr(bp), tag.raw());
    self.set_word(footer_addr(bp, tag.size()), tag.raw());
  }

  /// Writes an epilogue header in front of `bp`.
  fn write_epilogue(
    &mut self,
    bp: usize,
  ) {
    self.set_word(header_addr(bp), Tag::EPILOGUE.raw());
  }

  fn next_block(
    &self,
    bp: usize,
  ) -> usize {
    next_addr(bp, self.header(bp).size())
  }

  /// Tag of the preceding block, read from its footer.
  fn prev_tag(
    &self,
    bp: usize,
  ) -> Tag {
    self.tag_at(prev_footer_addr(bp))
  }

  fn prev_block(
    &self,
    bp: usize,
  ) -> usize {
    bp - self.prev_tag(bp).size()
  }
}

impl<T: Words + ?Sized> BlockTags for T {}
