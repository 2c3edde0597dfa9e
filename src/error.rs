//! Error types and utilities.

use std::error::Error as StdError;
use std::fmt;

/// The result of a hook operation.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A representation of all possible errors.
#[derive(Debug)]
pub enum Error {
  /// The address is not executable memory.
  NotExecutable,
  /// The hook entry has not been prepared.
  NotInitialized,
  /// The system is out of executable memory.
  OutOfMemory,
  /// The address contains an instruction that cannot be relocated.
  UnsupportedInstruction,
  /// A branch displacement exceeds the reach of its encoding.
  RangeExceeded,
  /// A memory operation failed.
  RegionFailure(region::Error),
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    if let Error::RegionFailure(error) = self {
      Some(error)
    } else {
      None
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::NotExecutable => write!(f, "Address is not executable"),
      Error::NotInitialized => write!(f, "Hook entry is not prepared"),
      Error::OutOfMemory => write!(f, "Cannot allocate executable memory"),
      Error::UnsupportedInstruction => write!(f, "Address contains an unsupported instruction"),
      Error::RangeExceeded => write!(f, "Branch displacement is out of range"),
      Error::RegionFailure(ref error) => write!(f, "{}", error),
    }
  }
}

impl From<region::Error> for Error {
  fn from(error: region::Error) -> Self {
    Error::RegionFailure(error)
  }
}
