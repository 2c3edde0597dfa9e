//! The shared context-switch thunks are hand-written code provided by
//! the embedding runtime; this crate only embeds their addresses.

use crate::alloc::CodeAllocator;
use crate::error::Result;

/// Entry addresses of the four shared thunks.
///
/// Each thunk is Thumb code (addresses carry the mode bit), reads the
/// hook-entry argument the trampolines leave on the stack, dispatches
/// the user callback and continues at the next hop.
#[derive(Debug, Clone, Copy)]
pub struct ThunkTable {
  pub enter: usize,
  pub leave: usize,
  pub insn_leave: usize,
  pub dbi: usize,
}

/// Builds the shared thunks once per backend.
pub trait Thunker {
  /// Materializes the four thunks, typically into slices taken from
  /// `allocator`, and returns their entry addresses.
  fn build(&self, allocator: &CodeAllocator) -> Result<ThunkTable>;
}
