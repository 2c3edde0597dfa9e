//! The A32 ("ARM") instruction-set backend.

pub use self::reader::{ArmInstr, ArmInsnKind, ArmReader};
pub use self::relocator::{try_relocate, ArmRelocator, RelocatedInsn};
pub use self::writer::ArmWriter;

mod reader;
mod relocator;
mod writer;

/// The reach of an unconditional A32 `b` instruction (±32 MiB).
pub const NEAR_JUMP_RANGE: usize = 0x0200_0000;

/// Bytes overwritten by a single-branch redirect.
pub const TINY_REDIRECT_SIZE: usize = 4;

/// Bytes overwritten by a PC-load redirect plus its literal.
pub const FULL_REDIRECT_SIZE: usize = 8;
