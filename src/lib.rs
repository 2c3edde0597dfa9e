//! An inline function-hooking library for 32-bit ARM written in Rust.
//!
//! ## Intro
//!
//! This library provides in-process hooking for the A32 ("ARM") and T32
//! ("Thumb") instruction sets by decoding and patching functions during
//! runtime, using assembly opcodes allocated within executable memory.
//! The target function's prolog is replaced with a redirect, and a
//! family of small interlocking stubs bridges between the patch site,
//! the shared context-switch thunks and the original code.
//!
//! Beyond the basic functionality this library handles several
//! different edge cases:
//!
//! - Relocation of PC-relative operands (literal loads, `adr`, `b`,
//!   `bl`/`blx`, `cbz`/`cbnz`).
//! - Near-jump redirects for prologues too short for a PC-load.
//! - Literal-pool alignment at unaligned Thumb patch sites.
//! - Single-instruction interception with resumable control flow.
//!
//! ## Procedure
//!
//! To hook a function the registry drives a fixed pipeline:
//!
//! ```text
//! prepare_trampoline        plan the redirect, save the prologue
//! build_invoke_trampoline   relocate the prologue, jump back after it
//! build_enter_trampoline    park the entry, jump to the enter thunk
//! build_leave_trampoline    same shape, leave thunk
//! activate_trampoline       write the redirect over the target
//! ```
//!
//! Every step short-circuits on failure, and the patch write is the
//! final step, so a failed install leaves the target untouched.
//!
//! ## Instruction sets
//!
//! The low bit of the target address selects Thumb, as hardware does;
//! trampoline pointers produced for Thumb code carry the low bit as
//! well.

// Re-exports
pub use crate::alloc::{CodeAllocator, CodeSlice};
pub use crate::backend::InterceptorBackend;
pub use crate::entry::{HookEntry, HookKind, OriginPrologue, MAX_REDIRECT_SIZE};
pub use crate::error::{Error, Result};
pub use crate::thunk::{ThunkTable, Thunker};

// Modules
mod alloc;
pub mod arch;
mod backend;
mod entry;
mod error;
pub mod memory;
mod thunk;

#[cfg(test)]
mod tests {
  use super::*;

  struct FixedThunker;

  impl Thunker for FixedThunker {
    fn build(&self, _allocator: &CodeAllocator) -> Result<ThunkTable> {
      Ok(ThunkTable {
        enter: 0x7100_0001,
        leave: 0x7200_0001,
        insn_leave: 0x7300_0001,
        dbi: 0x7400_0001,
      })
    }
  }

  #[test]
  fn full_pipeline_on_the_global_pool() {
    let mut backend = InterceptorBackend::with_global_pool(&FixedThunker).unwrap();

    // An A32 target: push {r4-r7, lr}; sub sp, sp, #8; body
    let origin = full_pipeline_on_the_global_pool as *const () as usize;
    let mut target = memory::code_patch(
      &memory::POOL,
      &[0u8; 32],
      origin,
      0,
    )
    .unwrap();
    let words = [0xE92D_40F0u32, 0xE24D_D008, 0xE1A0_0000, 0xE1A0_0000];
    for (index, word) in words.iter().enumerate() {
      target[index * 4..index * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }

    let mut entry = Box::new(HookEntry::new(target.pc(), HookKind::FunctionEnterLeave));
    unsafe {
      backend.prepare_trampoline(&mut entry).unwrap();
      assert_eq!(entry.redirect_code_size(), 8);

      backend.build_invoke_trampoline(&mut entry).unwrap();
      backend.build_enter_trampoline(&mut entry).unwrap();
      backend.build_leave_trampoline(&mut entry).unwrap();
      backend.activate_trampoline(&mut entry).unwrap();
    }

    // The patch site now loads the enter trampoline into the PC
    assert_eq!(&target[..4], &0xE51F_F004u32.to_le_bytes());
    assert_eq!(
      &target[4..8],
      &(entry.on_enter_trampoline as u32).to_le_bytes()
    );
    assert_eq!(entry.on_enter_trampoline & 1, 1);

    backend.free_trampoline(&mut entry);
    assert_eq!(entry.on_enter_trampoline, 0);
  }
}
