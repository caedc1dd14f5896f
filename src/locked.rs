use std::{
  alloc::{GlobalAlloc, Layout},
  ptr,
};

use log::warn;
use parking_lot::{Mutex, MutexGuard, const_mutex};

use crate::{
  block::DSIZE,
  config::HeapConfig,
  error::HeapError,
  heap::Allocator,
  region::{Grow, Sbrk},
};

/// An [`Allocator`] behind one lock, usable as a `#[global_allocator]`.
///
/// Every call holds the lock for its whole duration; coalescing may touch
/// blocks anywhere in the heap, so there is nothing finer to lock. Until
/// [`LockedAllocator::init`] runs, every allocation fails.
///
/// When installed as the global allocator, no logger that allocates may be
/// active: the heap logs while holding its lock.
///
/// ```rust,ignore
/// use tagalloc::{HeapConfig, LockedAllocator, Sbrk};
///
/// #[global_allocator]
/// static HEAP: LockedAllocator = LockedAllocator::new();
///
/// fn main() {
///     HEAP.init(Sbrk, HeapConfig::default()).unwrap();
/// }
/// ```
pub struct LockedAllocator<G = Sbrk> {
  heap: Mutex<Option<Allocator<G>>>,
}

impl<G> LockedAllocator<G> {
  pub const fn new() -> Self {
    Self {
      heap: const_mutex(None),
    }
  }

  /// Exclusive access to the heap, `None` before initialisation.
  pub fn lock(
    &self,
  ) -> MutexGuard<'_, Option<Allocator<G>>> {
    self.heap.lock()
  }
}

impl<G> Default for LockedAllocator<G> {
  fn default() -> Self {
    Self::new()
  }
}

impl<G: Grow> LockedAllocator<G> {
  /// Creates the heap.
  ///
  /// Once a heap exists, further calls keep it and return `Ok`; the `grower`
  /// passed to them is dropped unused.
  pub fn init(
    &self,
    grower: G,
    config: HeapConfig,
  ) -> Result<(), HeapError> {
    let mut heap = self.heap.lock();
    if heap.is_none() {
      *heap = Some(Allocator::init(grower, config)?);
    }
    Ok(())
  }
}

unsafe impl<G: Grow + Send> GlobalAlloc for LockedAllocator<G> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > DSIZE {
      return ptr::null_mut();
    }

    match self.heap.lock().as_mut() {
      Some(heap) => heap
        .allocate(layout.size())
        .map_or(ptr::null_mut(), |p| p.as_ptr()),
      None => ptr::null_mut(),
    }
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    _layout: Layout,
  ) {
    if let Some(heap) = self.heap.lock().as_mut() {
      if let Err(err) = heap.release(ptr) {
        warn!("dealloc: {err}");
      }
    }
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() > DSIZE {
      return ptr::null_mut();
    }

    match self.heap.lock().as_mut() {
      Some(heap) => match heap.reallocate(ptr, new_size) {
        Ok(Some(p)) => p.as_ptr(),
        Ok(None) | Err(_) => ptr::null_mut(),
      },
      None => ptr::null_mut(),
    }
  }
}
