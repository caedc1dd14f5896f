/// Default growth increment, also the size of the seed block.
pub const CHUNK_SIZE: usize = 1 << 12;

/// How the free list picks a block for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitPolicy {
  /// Lowest-addressed free block that is large enough.
  #[default]
  FirstFit,
  /// Smallest free block that is large enough, lowest address on ties.
  ///
  /// Trades a longer search for less splitting of large blocks, so block
  /// reuse order differs from [`FitPolicy::FirstFit`].
  BestFit,
}

/// Tunables for an [`Allocator`](crate::Allocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Bytes requested from the region when the heap is created.
  pub initial_chunk: usize,
  /// Minimum bytes requested from the region when no free block fits.
  pub chunk_size: usize,
  pub policy: FitPolicy,
  /// Walk the heap on every release to confirm the pointer starts a block.
  /// Catches stale interior pointers that tag checks alone cannot, at O(n)
  /// per release.
  pub verify_releases: bool,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      initial_chunk: CHUNK_SIZE,
      chunk_size: CHUNK_SIZE,
      policy: FitPolicy::FirstFit,
      verify_releases: false,
    }
  }
}

impl HeapConfig {
  pub fn with_initial_chunk(
    mut self,
    bytes: usize,
  ) -> Self {
    self.initial_chunk = bytes;
    self
  }

  pub fn with_chunk_size(
    mut self,
    bytes: usize,
  ) -> Self {
    self.chunk_size = bytes;
    self
  }

  pub fn with_policy(
    mut self,
    policy: FitPolicy,
  ) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_verify_releases(
    mut self,
    verify: bool,
  ) -> Self {
    self.verify_releases = verify;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = HeapConfig::default();
    assert_eq!(config.initial_chunk, 4096);
    assert_eq!(config.chunk_size, 4096);
    assert_eq!(config.policy, FitPolicy::FirstFit);
    assert!(!config.verify_releases);
  }

  #[test]
  fn test_builders() {
    let config = HeapConfig::default()
      .with_initial_chunk(0)
      .with_chunk_size(64)
      .with_policy(FitPolicy::BestFit)
      .with_verify_releases(true);

    assert_eq!(
      config,
      HeapConfig {
        initial_chunk: 0,
        chunk_size: 64,
        policy: FitPolicy::BestFit,
        verify_releases: true,
      }
    );
  }
}
