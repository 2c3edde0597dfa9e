use std::collections::VecDeque;
use std::ptr;

use crate::arch::arm::RelocatedInsn;
use crate::arch::Reg;
use crate::error::{Error, Result};

use super::{ThumbInstr, ThumbInsnKind, ThumbReader, ThumbWriter};

/// Re-emits T32 instructions at a new address, rewriting PC-relative
/// operands so they keep referring to the same absolute targets.
pub struct ThumbRelocator {
  reader: ThumbReader,
  pending: VecDeque<ThumbInstr>,
  insns: Vec<RelocatedInsn>,
}

impl ThumbRelocator {
  pub fn new() -> Self {
    ThumbRelocator {
      reader: ThumbReader::new(),
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
  pub unsafe fn read_one(&mut self) -> &ThumbInstr {
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
  pub unsafe fn write_one(&mut self, writer: &mut ThumbWriter) -> Result<()> {
    let instr = self.pending.pop_front().ok_or(Error::NotInitialized)?;
    let output_offset = writer.size();

    match instr.kind {
      ThumbInsnKind::Other { pc_relative: true } => return Err(Error::UnsupportedInstruction),
      ThumbInsnKind::Other { pc_relative: false } => {
        if instr.len() == 2 {
          writer.put_instruction(instr.hw1);
        } else {
          writer.put_instruction32(instr.hw1, instr.hw2);
        }
      },
      ThumbInsnKind::LdrLiteral { rt, literal } => {
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
      ThumbInsnKind::Adr { rd, value } => {
        writer.put_ldr_reg_address(Reg::from_code(rd), value);
      },
      ThumbInsnKind::Branch { cond: None, dest } => {
        writer.put_ldr_reg_address(Reg::Pc, dest | 1);
      },
      ThumbInsnKind::Branch {
        cond: Some(cond),
        dest,
      } => {
        // Inverted condition skips the absolute branch
        writer.put_instruction(0xD001 | (cond as u16 ^ 1) << 8);
        writer.put_ldr_reg_address(Reg::Pc, dest | 1);
      },
      ThumbInsnKind::BranchLink { dest, exchange } => {
        // The return address is the instruction after the original bl
        writer.put_ldr_reg_address(Reg::Lr, (instr.pc + instr.len()) | 1);
        let dest = if exchange { dest } else { dest | 1 };
        writer.put_ldr_reg_address(Reg::Pc, dest);
      },
      ThumbInsnKind::CompareBranch { nonzero, rn, dest } => {
        // cbz and cbnz only branch forward; invert and skip instead
        let inverted = if nonzero { 0xB100 } else { 0xB900 };
        writer.put_instruction(inverted | 0x0008 | rn as u16);
        writer.put_ldr_reg_address(Reg::Pc, dest | 1);
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
  pub unsafe fn write_all(&mut self, writer: &mut ThumbWriter) -> Result<()> {
    while !self.pending.is_empty() {
      self.write_one(writer)?;
    }
    Ok(())
  }
}

/// Returns true if the instruction is within the relocatable subset.
fn is_relocatable(instr: &ThumbInstr) -> bool {
  !matches!(instr.kind, ThumbInsnKind::Other { pc_relative: true })
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
  let mut reader = ThumbReader::new();
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

  #[repr(align(4))]
  struct Aligned<T>(T);

  fn halfwords(code: &[u8]) -> Vec<u16> {
    code
      .chunks(2)
      .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
      .collect()
  }

  unsafe fn relocate(address: usize, count: usize, new_pc: usize) -> Vec<u8> {
    let mut relocator = ThumbRelocator::new();
    let mut writer = ThumbWriter::new();
    relocator.reset(address);
    writer.reset(new_pc);

    for _ in 0..count {
      relocator.read_one();
      relocator.write_one(&mut writer).expect("relocating instruction");
    }
    writer.finish().to_vec()
  }

  #[test]
  fn position_independent_instructions_copy_verbatim() {
    // push {r4, lr}; sub sp, #8; mov.w r8, #1
    let code = Aligned([0xB510u16, 0xB082, 0xF04F, 0x0801]);
    let out = unsafe { relocate(code.0.as_ptr() as usize, 3, 0x1000) };

    assert_eq!(halfwords(&out), &[0xB510, 0xB082, 0xF04F, 0x0801]);
  }

  #[test]
  fn narrow_literal_load_keeps_the_loaded_value() {
    // ldr r0, [pc, #0]; the literal lives at base + 4
    let code = Aligned([0x4800u16, 0xBF00, 0x5678, 0x1234]);
    let base = code.0.as_ptr() as usize;
    let out = unsafe { relocate(base, 1, 0x1000) };

    // ldr.w r0, =literal_address; ldr r0, [r0]; pad; pool
    assert_eq!(&halfwords(&out)[..4], &[0xF8DF, 0x0004, 0x6800, 0xBF00]);
    assert_eq!(&out[8..12], &((base + 4) as u32).to_le_bytes());
  }

  #[test]
  fn unconditional_branch_becomes_absolute() {
    let code = Aligned([0xE002u16, 0xBF00]); // b .+8
    let base = code.0.as_ptr() as usize;
    let out = unsafe { relocate(base, 1, 0x1000) };

    assert_eq!(&halfwords(&out)[..2], &[0xF8DF, 0xF000]);
    assert_eq!(&out[4..8], &((base + 8 + 1) as u32).to_le_bytes());
  }

  #[test]
  fn conditional_branch_inverts_over_the_absolute_form() {
    let code = Aligned([0xD002u16, 0xBF00]); // beq .+8
    let base = code.0.as_ptr() as usize;
    let out = unsafe { relocate(base, 1, 0x1000) };

    // bne .+6 skips the wide load; pad, then the pool
    assert_eq!(&halfwords(&out)[..4], &[0xD101, 0xF8DF, 0xF004, 0xBF00]);
    assert_eq!(&out[8..12], &((base + 8 + 1) as u32).to_le_bytes());
  }

  #[test]
  fn compare_branch_inverts_over_the_absolute_form() {
    let code = Aligned([0xB903u16, 0xBF00]); // cbnz r3, .+4
    let base = code.0.as_ptr() as usize;
    let out = unsafe { relocate(base, 1, 0x1000) };

    // cbz r3, .+6 skips the wide load
    assert_eq!(&halfwords(&out)[..4], &[0xB10B, 0xF8DF, 0xF004, 0xBF00]);
    assert_eq!(&out[8..12], &((base + 4 + 1) as u32).to_le_bytes());
  }

  #[test]
  fn link_branch_materializes_the_return_address() {
    let code = Aligned([0xF7FFu16, 0xFFFE, 0xBF00]); // bl .
    let base = code.0.as_ptr() as usize;
    let out = unsafe { relocate(base, 1, 0x1000) };

    // ldr.w lr, =return|1; ldr.w pc, =dest|1; pool
    assert_eq!(&halfwords(&out)[..4], &[0xF8DF, 0xE004, 0xF8DF, 0xF004]);
    assert_eq!(&out[8..12], &((base + 4 + 1) as u32).to_le_bytes());
    assert_eq!(&out[12..16], &((base + 1) as u32).to_le_bytes());
  }

  #[test]
  fn unsupported_instruction_fails_the_write() {
    let code = Aligned([0x4678u16, 0xBF00]); // mov r0, pc
    let mut relocator = ThumbRelocator::new();
    let mut writer = ThumbWriter::new();
    relocator.reset(code.0.as_ptr() as usize);
    writer.reset(0x1000);

    unsafe {
      relocator.read_one();
      assert!(matches!(
        relocator.write_one(&mut writer),
        Err(Error::UnsupportedInstruction)
      ));
    }
  }

  #[test]
  fn try_relocate_reports_the_supported_span() {
    // push {r4, lr}; sub sp, #8; mov r0, pc
    let code = Aligned([0xB510u16, 0xB082, 0x4678, 0xBF00]);
    let base = code.0.as_ptr() as usize;

    unsafe {
      assert_eq!(try_relocate(base, 4), None);
      assert_eq!(try_relocate(base, 8), Some(4));
      assert_eq!(try_relocate(base, 8), Some(4));
      assert_eq!(try_relocate(base + 4, 2), Some(0));
    }
  }
}
