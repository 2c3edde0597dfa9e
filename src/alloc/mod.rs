use crate::error::Result;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

mod proximity;
mod search;

/// A thread-safe memory pool for allocating executable code slices.
#[derive(Clone)]
pub struct CodeAllocator(Arc<Mutex<proximity::ProximityAllocator>>);

impl CodeAllocator {
  /// Creates a new proximity memory allocator.
  pub fn new(max_distance: usize) -> Self {
    CodeAllocator(Arc::new(Mutex::new(proximity::ProximityAllocator {
      max_distance,
      pools: Vec::new(),
    })))
  }

  /// Allocates a read-, write- & executable slice.
  ///
  /// With a `distance`, the slice's runtime address lies within
  /// `origin ± distance`; without one, any location is acceptable. The
  /// returned slice is 4-byte aligned so it can hold literal pools.
  pub fn allocate(
    &self,
    origin: *const (),
    size: usize,
    distance: Option<usize>,
  ) -> Result<CodeSlice> {
    let mut allocator = self.0.lock().unwrap();

    // Over-allocate so the code can start word-aligned
    allocator
      .allocate(origin, size + 4, distance)
      .map(|data| {
        let offset = (4 - (data.as_ptr() as usize % 4)) % 4;
        CodeSlice {
          allocator: self.0.clone(),
          data,
          offset,
          size,
        }
      })
  }
}

/// A handle for an allocated, aligned slice of executable memory.
pub struct CodeSlice {
  allocator: Arc<Mutex<proximity::ProximityAllocator>>,
  data: proximity::Allocation,
  offset: usize,
  size: usize,
}

impl CodeSlice {
  /// Returns the runtime address of the slice's first byte.
  pub fn pc(&self) -> usize {
    self.as_ptr() as usize
  }

  /// Returns a pointer to the aligned code.
  pub fn as_ptr(&self) -> *const u8 {
    self.data[self.offset..].as_ptr()
  }

  /// Returns the size of the usable code area.
  pub fn len(&self) -> usize {
    self.size
  }
}

impl Drop for CodeSlice {
  fn drop(&mut self) {
    // Release the associated memory map (if unique)
    self.allocator.lock().unwrap().release(&self.data);
  }
}

impl Deref for CodeSlice {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.data[self.offset..self.offset + self.size]
  }
}

impl DerefMut for CodeSlice {
  fn deref_mut(&mut self) -> &mut [u8] {
    &mut self.data[self.offset..self.offset + self.size]
  }
}
