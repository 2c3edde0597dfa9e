//! Committing assembled code into executable memory.

use crate::alloc::{CodeAllocator, CodeSlice};
use crate::error::{Error, Result};
use lazy_static::lazy_static;

lazy_static! {
  /// Shared allocator used when the caller does not bring its own.
  pub static ref POOL: CodeAllocator = {
    // Seek memory blocks within the A32 near-jump range by default
    CodeAllocator::new(crate::arch::arm::NEAR_JUMP_RANGE)
  };
}

/// Commits assembled bytes into a fresh executable slice.
///
/// With a non-zero `range` the slice's runtime PC is guaranteed to lie
/// within `base ± range`; otherwise any location is acceptable.
pub fn code_patch(
  allocator: &CodeAllocator,
  code: &[u8],
  base: usize,
  range: usize,
) -> Result<CodeSlice> {
  let distance = if range == 0 { None } else { Some(range) };
  let mut slice = allocator.allocate(base as *const (), code.len(), distance)?;

  if range != 0 {
    let displacement = (slice.pc() as isize - base as isize).abs() as usize;
    if displacement > range {
      return Err(Error::OutOfMemory);
    }
  }

  slice.copy_from_slice(code);
  flush_icache(slice.as_ptr(), slice.len());
  Ok(slice)
}

/// Returns true if a patch target lies in executable memory.
///
/// The activator refuses to write a redirect anywhere else: patching
/// non-code would corrupt data, and the transient
/// read-write-execute window below only makes sense over a code page.
pub fn is_patchable_code(target: usize) -> Result<bool> {
  Ok(
    region::query(target as *const u8)?
      .protection()
      .contains(region::Protection::EXECUTE),
  )
}

/// Writes the final redirect bytes over the target's prologue.
///
/// The target page is briefly made writable; instruction caches are
/// invalidated before the permissions are restored.
///
/// # Safety
///
/// `target` must address `code.len()` bytes of mapped code.
pub unsafe fn memory_patch_code(target: usize, code: &[u8]) -> Result<()> {
  let _handle = region::protect_with_handle(
    target as *const u8,
    code.len(),
    region::Protection::READ_WRITE_EXECUTE,
  )?;

  std::ptr::copy_nonoverlapping(code.as_ptr(), target as *mut u8, code.len());
  flush_icache(target as *const u8, code.len());
  Ok(())
}

cfg_if::cfg_if! {
  if #[cfg(all(target_os = "linux", target_arch = "arm"))] {
    /// Invalidates the instruction cache for freshly written code.
    pub fn flush_icache(address: *const u8, size: usize) {
      // __ARM_NR_cacheflush
      const CACHEFLUSH: libc::c_long = 0x0f0002;
      unsafe {
        libc::syscall(CACHEFLUSH, address as usize, address as usize + size, 0usize);
      }
    }
  } else {
    /// Hosts with coherent instruction fetch need no explicit flush.
    pub fn flush_icache(_address: *const u8, _size: usize) {}
  }
}
