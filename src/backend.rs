//! The trampoline builder.
//!
//! For every hook the backend runs a fixed pipeline: `prepare` plans
//! the redirect and saves the displaced prologue, the `build_*` steps
//! assemble the interlocking stubs, and `activate` writes the redirect
//! over the target — the linearization point after which the hook is
//! live. Any stub whose address another stub embeds must be built
//! first; for `OneInstruction` hooks that means `build_insn_leave`
//! precedes `build_invoke`.

use log::{debug, warn};

use crate::alloc::{CodeAllocator, CodeSlice};
use crate::arch::{arm, thumb, Isa, Reg};
use crate::entry::{HookEntry, HookKind};
use crate::error::{Error, Result};
use crate::memory;
use crate::thunk::{ThunkTable, Thunker};

/// Safety margin subtracted from the near-jump reach when requesting a
/// slice close to the target.
const NEAR_JUMP_MARGIN: usize = 0x10;

/// Owns the per-instruction-set workspaces and drives the builder
/// pipeline. Not safe for concurrent installation; the registry
/// serializes hook installs.
pub struct InterceptorBackend {
  allocator: CodeAllocator,
  thunks: ThunkTable,
  arm_writer: arm::ArmWriter,
  arm_relocator: arm::ArmRelocator,
  thumb_writer: thumb::ThumbWriter,
  thumb_relocator: thumb::ThumbRelocator,
}

impl InterceptorBackend {
  /// Constructs the backend and pre-builds the shared thunks.
  pub fn new(allocator: CodeAllocator, thunker: &dyn Thunker) -> Result<Self> {
    let thunks = thunker.build(&allocator).map_err(|error| {
      warn!("building the shared thunks failed: {}", error);
      error
    })?;

    Ok(InterceptorBackend {
      allocator,
      thunks,
      arm_writer: arm::ArmWriter::new(),
      arm_relocator: arm::ArmRelocator::new(),
      thumb_writer: thumb::ThumbWriter::new(),
      thumb_relocator: thumb::ThumbRelocator::new(),
    })
  }

  /// Constructs the backend on the process-wide allocator pool.
  pub fn with_global_pool(thunker: &dyn Thunker) -> Result<Self> {
    Self::new(memory::POOL.clone(), thunker)
  }

  /// Plans the redirect for the entry's target: picks the redirect
  /// size, validates that the prologue relocates, and saves the bytes
  /// that will be overwritten.
  ///
  /// # Safety
  ///
  /// The entry's target must address readable code of the claimed
  /// instruction set.
  pub unsafe fn prepare_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let isa = Isa::of(entry.target);
    let target = Isa::strip(entry.target);

    let (tiny, full, supported) = match isa {
      Isa::A32 => (
        arm::TINY_REDIRECT_SIZE,
        arm::FULL_REDIRECT_SIZE,
        arm::try_relocate(target, arm::FULL_REDIRECT_SIZE),
      ),
      Isa::T32 => (
        thumb::TINY_REDIRECT_SIZE,
        thumb::FULL_REDIRECT_SIZE,
        thumb::try_relocate(target, thumb::FULL_REDIRECT_SIZE),
      ),
    };

    let mut size = if entry.try_near_jump {
      tiny
    } else {
      match supported {
        Some(limit) if limit > tiny && limit < full => {
          // Not enough relocatable bytes for FULL; fall back to the
          // near jump
          entry.try_near_jump = true;
          tiny
        },
        Some(limit) if limit < tiny => {
          warn!("prologue at {:#x} relocates only {} bytes", target, limit);
          return Err(Error::UnsupportedInstruction);
        },
        _ => full,
      }
    };

    // A trailing literal needs word alignment at unaligned Thumb sites;
    // the activator absorbs the padding with a leading nop
    if isa == Isa::T32 && size == full && target % 4 != 0 {
      size += 2;
    }

    entry.origin_prologue.size = size;
    entry.origin_prologue.address = target;
    std::ptr::copy_nonoverlapping(
      target as *const u8,
      entry.origin_prologue.bytes.as_mut_ptr(),
      size,
    );
    entry.redirect_code_size = size;

    debug!(
      "prepared {:?} hook at {:#x}: redirect_code_size={}",
      isa, target, size
    );
    Ok(())
  }

  /// Builds the invoke trampoline: the relocated prologue followed by
  /// an absolute branch back to the first undisplaced instruction.
  ///
  /// # Safety
  ///
  /// The entry's target must address readable code; for
  /// `OneInstruction` hooks the insn-leave trampoline must exist.
  pub unsafe fn build_invoke_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let size = entry.redirect_code_size;
    if size == 0 {
      return Err(Error::NotInitialized);
    }
    if entry.kind == HookKind::OneInstruction && entry.on_insn_leave_trampoline == 0 {
      return Err(Error::NotInitialized);
    }
    let isa = Isa::of(entry.target);
    let target = Isa::strip(entry.target);

    let (code, input_size, next_insn_offset) = match isa {
      Isa::T32 => {
        let writer = &mut self.thumb_writer;
        let relocator = &mut self.thumb_relocator;
        writer.reset(0);
        relocator.reset(target);

        let mut next_insn_offset = None;
        if entry.kind == HookKind::OneInstruction {
          relocator.read_one();
          relocator.write_one(writer)?;
          writer.put_ldr_reg_address(Reg::Pc, entry.on_insn_leave_trampoline);
          next_insn_offset = Some(writer.size());
        }
        while relocator.input_size() < size {
          relocator.read_one();
          relocator.write_one(writer)?;
        }

        debug!(
          "invoke relocation: input {} bytes / {} instructions",
          relocator.input_size(),
          relocator.input_insn_count()
        );

        // Resume past everything the relocator consumed
        let resume = target + relocator.input_size();
        writer.put_ldr_reg_address(Reg::Pc, resume | 1);
        (writer.finish().to_vec(), relocator.input_size(), next_insn_offset)
      },
      Isa::A32 => {
        let writer = &mut self.arm_writer;
        let relocator = &mut self.arm_relocator;
        writer.reset(0);
        relocator.reset(target);

        let mut next_insn_offset = None;
        if entry.kind == HookKind::OneInstruction {
          relocator.read_one();
          relocator.write_one(writer)?;
          writer.put_ldr_reg_address(Reg::Pc, entry.on_insn_leave_trampoline);
          next_insn_offset = Some(writer.size());
        }
        while relocator.input_size() < size {
          relocator.read_one();
          relocator.write_one(writer)?;
        }

        debug!(
          "invoke relocation: input {} bytes / {} instructions",
          relocator.input_size(),
          relocator.input_insn_count()
        );

        let resume = target + relocator.input_size();
        writer.put_ldr_reg_address(Reg::Pc, resume);
        (writer.finish().to_vec(), relocator.input_size(), next_insn_offset)
      },
    };

    let slice = memory::code_patch(&self.allocator, &code, 0, 0)?;
    entry.on_invoke_trampoline = isa.tag(slice.pc());
    if let Some(offset) = next_insn_offset {
      entry.next_insn_addr = isa.tag(slice.pc() + offset);
    }

    debug!(
      "invoke trampoline at {:#x} ({} bytes), resuming at {:#x}",
      slice.pc(),
      slice.len(),
      target + input_size
    );
    entry.hold(slice);
    Ok(())
  }

  /// Builds the enter trampoline and, for near-jump redirects of
  /// patched hooks, the transfer bridge that makes the enter trampoline
  /// reachable from the patch site.
  ///
  /// # Safety
  ///
  /// The entry must stay boxed and unmoved while the hook is installed;
  /// the stub embeds its address.
  pub unsafe fn build_enter_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let entry_address = entry as *const HookEntry as usize;
    let thunk = self.thunks.enter;
    let slice = self.build_bridge_stub(entry_address, thunk)?;
    entry.on_enter_trampoline = slice.pc() | 1;

    debug!(
      "enter trampoline at {:#x} ({} bytes), hook entry {:#x}, thunk {:#x}",
      slice.pc(),
      slice.len(),
      entry_address,
      thunk
    );
    entry.hold(slice);

    if entry.kind != HookKind::FunctionViaGOT && self.is_tiny(entry) {
      self.build_enter_transfer_trampoline(entry)?;
    }
    Ok(())
  }

  /// Builds the bridge a near-jump patch site branches to: a single
  /// indirect jump to the real destination, placed within near-jump
  /// range of the target. FULL redirects of `FunctionReplace` hooks
  /// route through it as well, without the reachability constraint.
  ///
  /// # Safety
  ///
  /// See [`build_enter_trampoline`](Self::build_enter_trampoline).
  pub unsafe fn build_enter_transfer_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let isa = Isa::of(entry.target);
    let target = Isa::strip(entry.target);
    let destination = match entry.kind {
      HookKind::FunctionReplace => entry.replace_call,
      HookKind::DynamicBinaryInstrumentation => entry.on_dbi_trampoline,
      _ => entry.on_enter_trampoline,
    };

    let (code, near_range) = match isa {
      Isa::T32 => {
        let writer = &mut self.thumb_writer;
        writer.reset(0);
        writer.put_ldr_reg_address(Reg::Pc, destination);
        (
          writer.finish().to_vec(),
          thumb::ThumbWriter::near_jump_range_size() - NEAR_JUMP_MARGIN,
        )
      },
      Isa::A32 => {
        let writer = &mut self.arm_writer;
        writer.reset(0);
        writer.put_ldr_reg_address(Reg::Pc, destination);
        (
          writer.finish().to_vec(),
          arm::ArmWriter::near_jump_range_size() - NEAR_JUMP_MARGIN,
        )
      },
    };

    let slice = if self.is_tiny(entry) {
      memory::code_patch(&self.allocator, &code, target, near_range)?
    } else {
      memory::code_patch(&self.allocator, &code, 0, 0)?
    };
    entry.on_enter_transfer_trampoline = isa.tag(slice.pc());

    debug!(
      "enter-transfer trampoline at {:#x} ({} bytes), jumping to {:#x}",
      slice.pc(),
      slice.len(),
      destination
    );
    entry.hold(slice);
    Ok(())
  }

  /// Builds the leave trampoline.
  ///
  /// # Safety
  ///
  /// See [`build_enter_trampoline`](Self::build_enter_trampoline).
  pub unsafe fn build_leave_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let entry_address = entry as *const HookEntry as usize;
    let thunk = self.thunks.leave;
    let slice = self.build_bridge_stub(entry_address, thunk)?;
    entry.on_leave_trampoline = slice.pc() | 1;

    debug!(
      "leave trampoline at {:#x} ({} bytes), thunk {:#x}",
      slice.pc(),
      slice.len(),
      thunk
    );
    entry.hold(slice);
    Ok(())
  }

  /// Builds the insn-leave trampoline used by `OneInstruction` hooks.
  ///
  /// # Safety
  ///
  /// See [`build_enter_trampoline`](Self::build_enter_trampoline).
  pub unsafe fn build_insn_leave_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let entry_address = entry as *const HookEntry as usize;
    let thunk = self.thunks.insn_leave;
    let slice = self.build_bridge_stub(entry_address, thunk)?;
    entry.on_insn_leave_trampoline = slice.pc() | 1;
    entry.hold(slice);
    Ok(())
  }

  /// Builds the trampoline routing through the dynamic-binary-
  /// instrumentation thunk, plus the transfer bridge for near-jump
  /// redirects.
  ///
  /// # Safety
  ///
  /// See [`build_enter_trampoline`](Self::build_enter_trampoline).
  pub unsafe fn build_dbi_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let entry_address = entry as *const HookEntry as usize;
    let thunk = self.thunks.dbi;
    let slice = self.build_bridge_stub(entry_address, thunk)?;
    entry.on_dbi_trampoline = slice.pc() | 1;
    entry.hold(slice);

    if self.is_tiny(entry) {
      self.build_enter_transfer_trampoline(entry)?;
    }
    Ok(())
  }

  /// Writes the redirect over the target prologue, making the hook
  /// live. Every earlier failure leaves the target untouched.
  ///
  /// # Safety
  ///
  /// The target must be mapped code and no other thread may execute
  /// its prologue during the patch write.
  pub unsafe fn activate_trampoline(&mut self, entry: &mut HookEntry) -> Result<()> {
    let size = entry.redirect_code_size;
    if size == 0 {
      return Err(Error::NotInitialized);
    }
    if entry.kind == HookKind::FunctionViaGOT {
      // The registry redirects the indirection slot itself
      return Ok(());
    }

    let isa = Isa::of(entry.target);
    let target = Isa::strip(entry.target);
    if !memory::is_patchable_code(target)? {
      return Err(Error::NotExecutable);
    }

    let redirect_dest = if self.is_tiny(entry) || entry.kind == HookKind::FunctionReplace {
      entry.on_enter_transfer_trampoline
    } else if entry.kind == HookKind::DynamicBinaryInstrumentation {
      entry.on_dbi_trampoline
    } else {
      entry.on_enter_trampoline
    };
    if redirect_dest == 0 {
      return Err(Error::NotInitialized);
    }

    let code = match isa {
      Isa::T32 => {
        let writer = &mut self.thumb_writer;
        writer.reset(target);

        if size == thumb::TINY_REDIRECT_SIZE {
          let displacement = Isa::strip(redirect_dest) as isize - target as isize;
          if displacement.abs() >= (thumb::NEAR_JUMP_RANGE - NEAR_JUMP_MARGIN) as isize {
            return Err(Error::RangeExceeded);
          }
          writer.put_b_imm32(displacement);
        } else {
          if target % 4 != 0 {
            writer.put_nop();
          }
          writer.put_ldr_reg_address(Reg::Pc, redirect_dest);
        }
        writer.finish().to_vec()
      },
      Isa::A32 => {
        let writer = &mut self.arm_writer;
        writer.reset(target);

        if size == arm::TINY_REDIRECT_SIZE {
          let displacement = redirect_dest as isize - target as isize;
          if displacement.abs() >= (arm::NEAR_JUMP_RANGE - NEAR_JUMP_MARGIN) as isize {
            return Err(Error::RangeExceeded);
          }
          writer.put_b_imm(displacement);
        } else {
          writer.put_ldr_reg_address(Reg::Pc, redirect_dest);
        }
        writer.finish().to_vec()
      },
    };

    debug_assert_eq!(code.len(), size);
    memory::memory_patch_code(target, &code)?;
    debug!("activated hook at {:#x}", entry.target);
    Ok(())
  }

  /// Releases every trampoline associated with the entry. Partial
  /// state from a failed build is accepted.
  pub fn free_trampoline(&mut self, entry: &mut HookEntry) {
    entry.free();
  }

  /// Assembles the common trampoline shape: park the hook entry's
  /// address on the stack for the thunk, then tail-jump to it.
  fn build_bridge_stub(&mut self, entry_address: usize, thunk: usize) -> Result<CodeSlice> {
    let writer = &mut self.thumb_writer;
    writer.reset(0);

    // Reserve three words: saved r1, the entry argument, and the
    // next-hop slot the thunk fills in
    writer.put_sub_reg_imm(Reg::Sp, 0xC);
    writer.put_str_reg_reg_offset(Reg::R1, Reg::Sp, 0);
    writer.put_ldr_b_reg_address(Reg::R1, entry_address);
    writer.put_str_reg_reg_offset(Reg::R1, Reg::Sp, 4);
    writer.put_ldr_reg_reg_offset(Reg::R1, Reg::Sp, 0);
    writer.put_add_reg_imm(Reg::Sp, 4);
    writer.put_ldr_reg_address(Reg::Pc, thunk);

    let code = writer.finish().to_vec();
    memory::code_patch(&self.allocator, &code, 0, 0)
  }

  fn is_tiny(&self, entry: &HookEntry) -> bool {
    match Isa::of(entry.target) {
      Isa::A32 => entry.redirect_code_size == arm::TINY_REDIRECT_SIZE,
      Isa::T32 => entry.redirect_code_size == thumb::TINY_REDIRECT_SIZE,
    }
  }
}
