/// Rounds `value` up to the next multiple of the double word (8 bytes).
///
/// Every block size and every payload address handed out by the heap is a
/// multiple of this value.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// assert_eq!(align!(1), 8);
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(16), 16);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::block::DSIZE)
  };
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of two.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(5, 4), 8);
/// assert_eq!(align_to!(4097, 4096), 8192);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $alignment:expr) => {
    ($value + $alignment - 1) & !($alignment - 1)
  };
}

/// Like [`align!`], but `None` instead of wrapping when the rounded value
/// does not fit in a `usize`.
///
/// # Examples
///
/// ```rust
/// use tagalloc::checked_align;
///
/// assert_eq!(checked_align!(13usize), Some(16));
/// assert_eq!(checked_align!(usize::MAX - 2), None);
/// ```
#[macro_export]
macro_rules! checked_align {
  ($value:expr) => {
    usize::checked_add($value, $crate::block::DSIZE - 1)
      .map(|padded| padded & !($crate::block::DSIZE - 1))
  };
}
