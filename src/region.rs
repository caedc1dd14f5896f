//! The contiguous byte extent the heap lives in, and the primitives that grow
//! it.
//!
//! ```text
//!   base                                               brk
//!    ▼                                                  ▼
//!    ┌──────────────────────────────────────────────────┐ ─ ─ ─ ─ ─ ┐
//!    │                 grown so far                     │   extend(n)
//!    └──────────────────────────────────────────────────┘ ─ ─ ─ ─ ─ ┘
//! ```
//!
//! The region only ever grows at `brk`. Everything above it is reached by
//! offset from `base` through bounds-checked accessors; this module and the
//! growth primitives are the only places that touch raw memory.

use std::ptr::{self, NonNull};

use libc::{c_void, intptr_t, sbrk};
use log::{debug, warn};

use crate::{
  block::{MAX_BLOCK_SIZE, WSIZE, Words},
  error::HeapError,
};

/// Size of the mapping [`Reserved::default_capacity`] asks for.
pub const DEFAULT_RESERVATION: usize = 20 * (1 << 20);

/// A monotonic growth primitive.
pub trait Grow {
  /// Appends `increment` bytes at the current break and returns the old
  /// break, that is, the first of the new bytes. Returns `None` when no more
  /// memory can be had.
  fn grow(
    &mut self,
    increment: usize,
  ) -> Option<NonNull<u8>>;
}

/// The process data segment, grown with `sbrk(2)`.
///
/// Anything else in the process that moves the break (the system allocator
/// among them) makes the next growth non-contiguous, which the region reports
/// as out of memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sbrk;

impl Grow for Sbrk {
  fn grow(
    &mut self,
    increment: usize,
  ) -> Option<NonNull<u8>> {
    let increment = intptr_t::try_from(increment).ok()?;
    let address = unsafe { sbrk(increment) };

    if address == usize::MAX as *mut c_void {
      return None;
    }

    NonNull::new(address.cast())
  }
}

/// A fixed-capacity anonymous mapping with a private break inside it.
///
/// The whole capacity is reserved up front and handed out front to back, so
/// growth is always contiguous and never interferes with the rest of the
/// process.
#[derive(Debug)]
pub struct Reserved {
  start: NonNull<u8>,
  capacity: usize,
  used: usize,
}

// SAFETY: the mapping is owned exclusively by this value.
unsafe impl Send for Reserved {}

impl Reserved {
  pub fn new(
    capacity: usize,
  ) -> Result<Self, HeapError> {
    let failed = HeapError::OutOfMemory { requested: capacity };

    if capacity == 0 {
      return Err(failed);
    }

    let address = unsafe {
      libc::mmap(
        ptr::null_mut(),
        capacity,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      warn!("reserving {capacity} bytes failed");
      return Err(failed);
    }

    let start = NonNull::new(address.cast()).ok_or(failed)?;
    debug!("reserved {capacity} bytes at {start:?}");

    Ok(Self {
      start,
      capacity,
      used: 0,
    })
  }

  pub fn default_capacity() -> Result<Self, HeapError> {
    Self::new(DEFAULT_RESERVATION)
  }

  /// Bytes handed out so far.
  pub fn used(
    &self,
  ) -> usize {
    self.used
  }
}

impl Grow for Reserved {
  fn grow(
    &mut self,
    increment: usize,
  ) -> Option<NonNull<u8>> {
    if increment > self.capacity - self.used {
      return None;
    }

    // SAFETY: `used <= capacity`, so the result stays inside the mapping.
    let address = unsafe { self.start.add(self.used) };
    self.used += increment;
    Some(address)
  }
}

impl Drop for Reserved {
  fn drop(
    &mut self,
  ) {
    unsafe { libc::munmap(self.start.as_ptr().cast(), self.capacity) };
  }
}

/// The byte extent `[base, brk)` obtained from a [`Grow`] primitive.
///
/// `base` is double-word aligned. Offsets must fit in a tag or link word, so
/// the extent is capped just below 4 GiB.
pub struct HeapRegion<G> {
  grower: G,
  base: NonNull<u8>,
  len: usize,
}

// SAFETY: the region only hands out offsets and pointers into memory it owns;
// moving it to another thread moves that ownership along.
unsafe impl<G: Send> Send for HeapRegion<G> {}

impl<G: Grow> HeapRegion<G> {
  pub fn new(
    grower: G,
  ) -> Self {
    Self {
      grower,
      base: NonNull::dangling(),
      len: 0,
    }
  }

  /// Grows the region by `bytes` rounded up to a double word and returns the
  /// offset of the first new byte.
  pub fn extend(
    &mut self,
    bytes: usize,
  ) -> Result<usize, HeapError> {
    let oom = HeapError::OutOfMemory { requested: bytes };

    let increment = crate::checked_align!(bytes).ok_or(oom.clone())?;

    if increment == 0 {
      return Ok(self.len);
    }

    if increment > MAX_BLOCK_SIZE - self.len {
      warn!("region cannot grow by {increment} bytes past {:#x}", self.len);
      return Err(oom);
    }

    let Some(start) = self.grower.grow(increment) else {
      warn!("growth primitive refused {increment} bytes");
      return Err(oom);
    };

    if self.len == 0 {
      let addr = start.as_ptr() as usize;
      let pad = crate::align!(addr) - addr;

      if pad != 0 {
        let expected = start.as_ptr().wrapping_add(increment);
        match self.grower.grow(pad) {
          Some(tail) if tail.as_ptr() == expected => {}
          _ => {
            warn!("could not pad region at {start:?} to double-word alignment");
            return Err(oom);
          }
        }
      }

      // SAFETY: the primitive granted `[start, start + increment + pad)`.
      self.base = unsafe { start.add(pad) };
    } else if start.as_ptr() != self.brk().cast_mut() {
      warn!(
        "growth primitive returned {start:?}, expected the break at {:?}",
        self.brk()
      );
      return Err(oom);
    }

    let offset = self.len;
    self.len += increment;

    debug!(
      "region grew by {increment} bytes to {:#x} (base {:?})",
      self.len, self.base
    );

    Ok(offset)
  }

  pub fn grower(
    &self,
  ) -> &G {
    &self.grower
  }
}

impl<G> HeapRegion<G> {
  pub fn base(
    &self,
  ) -> *const u8 {
    self.base.as_ptr()
  }

  /// One past the last byte of the region.
  pub fn brk(
    &self,
  ) -> *const u8 {
    self.base.as_ptr().wrapping_add(self.len)
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

  /// Pointer to the byte at `offset`. `offset == len` yields the break.
  pub fn ptr_at(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    assert!(offset <= self.len, "offset {offset:#x} past the break {:#x}", self.len);
    // SAFETY: checked to lie within, or one past, the granted extent.
    unsafe { self.base.add(offset) }
  }

  /// Offset of `address` if it points into the region.
  pub fn offset_of(
    &self,
    address: *const u8,
  ) -> Option<usize> {
    (address as usize)
      .checked_sub(self.base.as_ptr() as usize)
      .filter(|offset| *offset < self.len)
  }

  /// Copies `count` bytes from offset `src` to offset `dst`. The ranges may
  /// overlap.
  pub fn copy(
    &mut self,
    src: usize,
    dst: usize,
    count: usize,
  ) {
    self.check_range(src, count);
    self.check_range(dst, count);
    unsafe {
      ptr::copy(
        self.base.as_ptr().add(src),
        self.base.as_ptr().add(dst),
        count,
      )
    };
  }

  fn check_range(
    &self,
    offset: usize,
    count: usize,
  ) {
    assert!(
      offset.checked_add(count).is_some_and(|end| end <= self.len),
      "range {offset:#x}+{count} outside region of {:#x} bytes",
      self.len
    );
  }

  fn check_word(
    &self,
    offset: usize,
  ) {
    assert_eq!(offset % WSIZE, 0, "unaligned word offset {offset:#x}");
    self.check_range(offset, WSIZE);
  }
}

impl<G> Words for HeapRegion<G> {
  fn word(
    &self,
    offset: usize,
  ) -> u32 {
    self.check_word(offset);
    // SAFETY: in bounds and 4-aligned, since `base` is 8-aligned.
    unsafe { self.base.as_ptr().add(offset).cast::<u32>().read() }
  }

  fn set_word(
    &mut self,
    offset: usize,
    value: u32,
  ) {
    self.check_word(offset);
    // SAFETY: as in `word`.
    unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(value) };
  }

  fn extent(
    &self,
  ) -> usize {
    self.len
  }
}
