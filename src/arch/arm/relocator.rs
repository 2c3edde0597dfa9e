use std::collections::VecDeque;
use std::ptr;

use crate::arch::Reg;
use crate::error::{Error, Result};

use super::{ArmInstr, ArmInsnKind, ArmReader, ArmWriter};

/// Mapping from one input instruction to its relocated output range.
#[derive(Debug, Clone)]
pub struct RelocatedInsn {
  /// Address of the input instruction.
  pub source_pc: usize,
  pub source_len: usize,
  /// Offset of the first output byte, relative to the writer's start.
  pub output_offset: usize,
  pub output_len: usize,
}

/// Re-emits A32 instructions at a new address, rewriting PC-relative
/// operands so they keep referring to the same absolute targets.
pub struct ArmRelocator {
  reader: ArmReader,
  pending: VecDeque<ArmInstr>,
  insns: Vec<RelocatedInsn>,
}

impl ArmRelocator {
  pub fn new() -> Self {
    ArmRelocator {
      reader: ArmReader::new(),
      pending: VecDeque::new(),
      insns: Vec::new(),
    }
  }

  /// Re-targets the relocator at a new input address.
  pub fn reset(&mut self, address: usize) {
    self.reader.reset(address);
    self.pending.clear();
    self.insns.clear();
  }

  /// Bytes of input consumed so far.
  pub fn input_size(&self) -> usize {
    self.reader.size()
  }

  /// Input instructions decoded so far.
  pub fn input_insn_count(&self) -> usize {
    self.reader.insn_count()
  }

  /// The per-instruction input→output mapping, in input order.
  pub fn insns(&self) -> &[RelocatedInsn] {
    &self.insns
  }

  /// Decodes the next input instruction.
  ///
  /// # Safety
  ///
  /// The input cursor must point at readable memory.
  pub unsafe fn read_one(&mut self) -> &ArmInstr {
    let instr = self.reader.read_one();
    self.pending.push_back(instr);
    self.pending.back().unwrap()
  }

  /// Relocates the oldest instruction not yet written.
  ///
  /// # Safety
  ///
  /// Relocating a literal load into the PC dereferences the input's
  /// literal slot.
  pub unsafe fn write_one(&mut self, writer: &mut ArmWriter) -> Result<()> {
    let instr = self.pending.pop_front().ok_or(Error::NotInitialized)?;
    let output_offset = writer.size();

    match instr.kind {
      ArmInsnKind::Other { pc_relative: false } => writer.put_instruction(instr.raw),
      ArmInsnKind::Other { pc_relative: true } => return Err(Error::UnsupportedInstruction),
      ArmInsnKind::LdrLiteral { rt, literal } => {
        if rt == Reg::Pc.code() {
          // Tail jump through a code literal; the slot is immutable, so
          // resolve it now and branch to the loaded address directly
          let value = ptr::read_unaligned(literal as *const u32);
          writer.put_ldr_reg_address(Reg::Pc, value as usize);
        } else {
          let rt = Reg::from_code(rt);
          writer.put_ldr_reg_address(rt, literal);
          writer.put_ldr_reg_reg_offset(rt, rt, 0);
        }
      },
      ArmInsnKind::Adr { rd, value } => {
        writer.put_ldr_reg_address(Reg::from_code(rd), value);
      },
      ArmInsnKind::Branch { cond, link, dest } => {
        if link {
          // The return address is the instruction after the original bl
          writer.put_ldr_cond_reg_address(cond, Reg::Lr, instr.pc + 4);
        }
        writer.put_ldr_cond_reg_address(cond, Reg::Pc, dest);
      },
    }

    self.insns.push(RelocatedInsn {
      source_pc: instr.pc,
      source_len: instr.len(),
      output_offset,
      output_len: writer.size() - output_offset,
    });
    Ok(())
  }

  /// Relocates every instruction read so far.
  pub unsafe fn write_all(&mut self, writer: &mut ArmWriter) -> Result<()> {
    while !self.pending.is_empty() {
      self.write_one(writer)?;
    }
    Ok(())
  }
}

/// Returns true if the instruction is within the relocatable subset.
fn is_relocatable(instr: &ArmInstr) -> bool {
  !matches!(instr.kind, ArmInsnKind::Other { pc_relative: true })
}

/// Dry-runs the decoder over at least `required` bytes of input.
///
/// Returns `None` when the whole span relocates, otherwise the largest
/// relocatable whole-instruction byte count (zero if even the first
/// instruction is unsupported).
///
/// # Safety
///
/// `address` must point at readable memory covering `required` bytes.
pub unsafe fn try_relocate(address: usize, required: usize) -> Option<usize> {
  let mut reader = ArmReader::new();
  reader.reset(address);

  while reader.size() < required {
    let instr = reader.read_one();
    if !is_relocatable(&instr) {
      return Some(reader.size() - instr.len());
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  unsafe fn relocate(words: &[u32], count: usize, new_pc: usize) -> (Vec<u8>, Vec<RelocatedInsn>) {
    let mut relocator = ArmRelocator::new();
    let mut writer = ArmWriter::new();
    relocator.reset(words.as_ptr() as usize);
    writer.reset(new_pc);

    for _ in 0..count {
      relocator.read_one();
      relocator.write_one(&mut writer).expect("relocating instruction");
    }
    (writer.finish().to_vec(), relocator.insns().to_vec())
  }

  #[test]
  fn position_independent_instructions_copy_verbatim() {
    let words = [0xE92D_40F0u32, 0xE24D_D008]; // push {r4-r7, lr}; sub sp, sp, #8
    let (code, insns) = unsafe { relocate(&words, 2, 0x1000) };

    assert_eq!(&code[..4], &0xE92D_40F0u32.to_le_bytes());
    assert_eq!(&code[4..8], &0xE24D_D008u32.to_le_bytes());
    assert_eq!(insns[1].output_offset, 4);
    assert_eq!(insns[1].output_len, 4);
  }

  #[test]
  fn literal_load_keeps_the_loaded_value() {
    // ldr r0, [pc, #4]; the literal lives at base + 12
    let words = [0xE59F_0004u32, 0xE1A0_0000, 0, 0xDEAD_BEEF];
    let base = words.as_ptr() as usize;
    let (code, _) = unsafe { relocate(&words, 1, 0x1000) };

    // ldr r0, =literal_address; ldr r0, [r0]
    assert_eq!(&code[..4], &0xE59F_0000u32.to_le_bytes());
    assert_eq!(&code[4..8], &0xE590_0000u32.to_le_bytes());
    assert_eq!(&code[8..12], &((base + 12) as u32).to_le_bytes());
  }

  #[test]
  fn branches_become_absolute() {
    let words = [0xEA00_0010u32]; // b +72
    let base = words.as_ptr() as usize;
    let (code, _) = unsafe { relocate(&words, 1, 0x1000) };

    assert_eq!(&code[..4], &0xE51F_F004u32.to_le_bytes());
    assert_eq!(&code[4..], &((base + 8 + 0x40) as u32).to_le_bytes());
  }

  #[test]
  fn conditional_branches_keep_their_condition() {
    let words = [0x1A00_0000u32]; // bne +8
    let base = words.as_ptr() as usize;
    let (code, _) = unsafe { relocate(&words, 1, 0x1000) };

    // ldrne pc, [pc, #-4]
    assert_eq!(&code[..4], &0x151F_F004u32.to_le_bytes());
    assert_eq!(&code[4..], &((base + 8) as u32).to_le_bytes());
  }

  #[test]
  fn link_branches_materialize_the_return_address() {
    let words = [0xEB00_0000u32]; // bl +8
    let base = words.as_ptr() as usize;
    let (code, _) = unsafe { relocate(&words, 1, 0x1000) };

    // ldr lr, =return; ldr pc, =destination; pool
    assert_eq!(&code[..4], &0xE59F_E000u32.to_le_bytes());
    assert_eq!(&code[4..8], &0xE59F_F000u32.to_le_bytes());
    assert_eq!(&code[8..12], &((base + 4) as u32).to_le_bytes());
    assert_eq!(&code[12..16], &((base + 8) as u32).to_le_bytes());
  }

  #[test]
  fn try_relocate_reports_the_supported_span() {
    let words = [0xE92D_40F0u32, 0xE24D_D008, 0xE08F_0001]; // ...; add r0, pc, r1
    let base = words.as_ptr() as usize;

    unsafe {
      assert_eq!(try_relocate(base, 8), None);
      assert_eq!(try_relocate(base, 12), Some(8));
      assert_eq!(try_relocate(base, 12), Some(8));
      assert_eq!(try_relocate(base + 8, 4), Some(0));
    }
  }
}
