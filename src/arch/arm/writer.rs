use crate::arch::Reg;

use super::NEAR_JUMP_RANGE;

/// A32 condition code for "always".
const COND_AL: u32 = 0xE;

/// A pending literal-pool entry and the load referring to it.
struct Literal {
  value: u32,
  load_offset: usize,
}

/// Emits A32 instructions into a buffer, tracking the emit PC.
///
/// Literal loads go through a forward-growing pool that is appended
/// after the last emitted instruction when the writer is finished; the
/// load displacements are backpatched at that point.
pub struct ArmWriter {
  buffer: Vec<u8>,
  start_pc: usize,
  literals: Vec<Literal>,
}

impl ArmWriter {
  pub fn new() -> Self {
    ArmWriter {
      buffer: Vec::new(),
      start_pc: 0,
      literals: Vec::new(),
    }
  }

  /// Clears the buffer and re-targets the emit PC.
  pub fn reset(&mut self, start_pc: usize) {
    self.buffer.clear();
    self.literals.clear();
    self.start_pc = start_pc;
  }

  /// The runtime address of the next emitted instruction.
  pub fn pc(&self) -> usize {
    self.start_pc + self.buffer.len()
  }

  /// The runtime address of the first emitted instruction.
  pub fn start_pc(&self) -> usize {
    self.start_pc
  }

  /// Bytes emitted so far, including a flushed pool.
  pub fn size(&self) -> usize {
    self.buffer.len()
  }

  /// The reach of the shortest unconditional branch encoding.
  pub fn near_jump_range_size() -> usize {
    NEAR_JUMP_RANGE
  }

  /// Emits a raw instruction word.
  pub fn put_instruction(&mut self, raw: u32) {
    self.buffer.extend_from_slice(&raw.to_le_bytes());
  }

  /// Emits `b <offset>`, with `offset` relative to this instruction.
  pub fn put_b_imm(&mut self, offset: isize) {
    debug_assert!(offset.abs() < NEAR_JUMP_RANGE as isize);
    let imm24 = ((offset - 8) >> 2) as u32 & 0x00FF_FFFF;
    self.put_instruction(0xEA00_0000 | imm24);
  }

  /// Emits `ldr reg, =address` through the literal pool.
  pub fn put_ldr_reg_address(&mut self, reg: Reg, address: usize) {
    self.put_ldr_cond_reg_address(COND_AL, reg, address);
  }

  /// Emits a conditional `ldr<cc> reg, =address` through the pool.
  pub fn put_ldr_cond_reg_address(&mut self, cond: u32, reg: Reg, address: usize) {
    self.literals.push(Literal {
      value: address as u32,
      load_offset: self.buffer.len(),
    });
    // Displacement and U bit are backpatched when the pool is flushed
    self.put_instruction(cond << 28 | 0x051F_0000 | reg.code() << 12);
  }

  /// Emits `ldr rt, [rn, #offset]`.
  pub fn put_ldr_reg_reg_offset(&mut self, rt: Reg, rn: Reg, offset: u32) {
    debug_assert!(offset < 0x1000);
    self.put_instruction(0xE590_0000 | rn.code() << 16 | rt.code() << 12 | offset);
  }

  /// Appends the literal pool and backpatches every pending load, then
  /// returns the finished code bytes.
  pub fn finish(&mut self) -> &[u8] {
    for literal in self.literals.drain(..) {
      let pool_offset = self.buffer.len();
      self.buffer.extend_from_slice(&literal.value.to_le_bytes());

      // ldr displacement is relative to the load's PC plus eight
      let displacement = pool_offset as isize - (literal.load_offset as isize + 8);
      let (up, imm) = if displacement >= 0 {
        (1u32, displacement as u32)
      } else {
        (0u32, -displacement as u32)
      };
      assert!(imm < 0x1000, "literal pool out of ldr range");

      let patched = u32::from_le_bytes([
        self.buffer[literal.load_offset],
        self.buffer[literal.load_offset + 1],
        self.buffer[literal.load_offset + 2],
        self.buffer[literal.load_offset + 3],
      ]) | up << 23
        | imm;
      self.buffer[literal.load_offset..literal.load_offset + 4]
        .copy_from_slice(&patched.to_le_bytes());
    }

    &self.buffer
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_pc_load_uses_adjacent_literal() {
    let mut writer = ArmWriter::new();
    writer.reset(0x10000);
    writer.put_ldr_reg_address(Reg::Pc, 0x2000_0000);

    // ldr pc, [pc, #-4] with the literal as the following word
    let code = writer.finish();
    assert_eq!(&code[..4], &0xE51F_F004u32.to_le_bytes());
    assert_eq!(&code[4..], &0x2000_0000u32.to_le_bytes());
  }

  #[test]
  fn pool_flushes_after_the_last_instruction() {
    let mut writer = ArmWriter::new();
    writer.reset(0);
    writer.put_ldr_reg_address(Reg::R0, 0x1234_5678);
    writer.put_instruction(0xE1A0_0000); // mov r0, r0

    let code = writer.finish();
    // Load at 0, pool at 8: displacement is zero
    assert_eq!(&code[..4], &0xE59F_0000u32.to_le_bytes());
    assert_eq!(&code[8..12], &0x1234_5678u32.to_le_bytes());
  }

  #[test]
  fn branch_offsets_account_for_the_pipeline() {
    let mut writer = ArmWriter::new();
    writer.reset(0x8000);
    writer.put_b_imm(0x10);

    assert_eq!(writer.finish(), &0xEA00_0002u32.to_le_bytes());
  }
}
