//! Instruction-set specific code.
//!
//! Each backend module exposes the same three workspaces:
//!
//! - A `Reader`, decoding instructions at an address into records that
//!   carry any PC-relative operand.
//! - A `Writer`, emitting instructions into a buffer while tracking the
//!   emit PC and an explicit literal pool.
//! - A `Relocator`, re-emitting instructions read from a `Reader`
//!   through a `Writer` so their PC-relative operands keep referring to
//!   the same absolute addresses.

pub mod arm;
pub mod thumb;

/// The two instruction sets of 32-bit ARM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
  A32,
  T32,
}

impl Isa {
  /// Determines the instruction set from a code address.
  ///
  /// The low bit of a function pointer selects Thumb; it is not part of
  /// the instruction address itself.
  pub fn of(address: usize) -> Isa {
    if address & 1 != 0 {
      Isa::T32
    } else {
      Isa::A32
    }
  }

  /// Strips the mode bit, yielding the instruction address.
  pub fn strip(address: usize) -> usize {
    address & !1
  }

  /// Re-applies the mode bit for pointers handed to callers.
  pub fn tag(self, address: usize) -> usize {
    match self {
      Isa::A32 => address,
      Isa::T32 => address | 1,
    }
  }
}

/// General-purpose register numbers shared by both instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
  R0 = 0,
  R1 = 1,
  R2 = 2,
  R3 = 3,
  R4 = 4,
  R5 = 5,
  R6 = 6,
  R7 = 7,
  R8 = 8,
  R9 = 9,
  R10 = 10,
  R11 = 11,
  R12 = 12,
  Sp = 13,
  Lr = 14,
  Pc = 15,
}

impl Reg {
  /// Returns the register's encoding number.
  pub fn code(self) -> u32 {
    self as u32
  }

  /// Looks a register up by its encoding number.
  pub fn from_code(code: u32) -> Reg {
    match code {
      0 => Reg::R0,
      1 => Reg::R1,
      2 => Reg::R2,
      3 => Reg::R3,
      4 => Reg::R4,
      5 => Reg::R5,
      6 => Reg::R6,
      7 => Reg::R7,
      8 => Reg::R8,
      9 => Reg::R9,
      10 => Reg::R10,
      11 => Reg::R11,
      12 => Reg::R12,
      13 => Reg::Sp,
      14 => Reg::Lr,
      15 => Reg::Pc,
      _ => unreachable!("register encoding out of range"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mode_bit_discipline() {
    assert_eq!(Isa::of(0x10001), Isa::T32);
    assert_eq!(Isa::of(0x10000), Isa::A32);
    assert_eq!(Isa::strip(0x10001), 0x10000);
    assert_eq!(Isa::T32.tag(0x10000), 0x10001);
    assert_eq!(Isa::A32.tag(0x10000), 0x10000);
  }
}
