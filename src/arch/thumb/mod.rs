//! The T32 ("Thumb") instruction-set backend.

pub use self::reader::{ThumbInstr, ThumbInsnKind, ThumbReader};
pub use self::relocator::{try_relocate, ThumbRelocator};
pub use self::writer::ThumbWriter;

mod reader;
mod relocator;
mod writer;

/// The reach of a T32 `b.w` instruction (±16 MiB).
pub const NEAR_JUMP_RANGE: usize = 0x0100_0000;

/// Bytes overwritten by a single-branch redirect.
pub const TINY_REDIRECT_SIZE: usize = 4;

/// Bytes overwritten by a PC-load redirect plus its literal.
pub const FULL_REDIRECT_SIZE: usize = 8;
