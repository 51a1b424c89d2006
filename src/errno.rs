//! POSIX-style error codes used by soft-failing library routines.

use thiserror::Error;

/// Error numbers returned by kernel library routines.
///
/// The discriminants follow the conventional POSIX values so that error
/// output stays recognizable next to the systems this kernel probes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
	#[error("operation not permitted")]
	Perm = 1,
	#[error("no such entry")]
	NoEnt = 2,
	#[error("I/O error")]
	Io = 5,
	#[error("try again")]
	Again = 11,
	#[error("out of memory")]
	NoMem = 12,
	#[error("bad address")]
	Fault = 14,
	#[error("device or resource busy")]
	Busy = 16,
	#[error("entry already exists")]
	Exist = 17,
	#[error("no such device")]
	NoDev = 19,
	#[error("invalid argument")]
	Inval = 22,
	#[error("value out of range")]
	Range = 34,
	#[error("function not implemented")]
	NoSys = 38,
}

impl Errno {
	/// The conventional negative errno representation.
	pub fn as_neg(self) -> i32 {
		-(self as i32)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn errno_values_follow_posix() {
		assert_eq!(Errno::NoEnt as i32, 2);
		assert_eq!(Errno::NoMem as i32, 12);
		assert_eq!(Errno::Exist as i32, 17);
		assert_eq!(Errno::Inval as i32, 22);
		assert_eq!(Errno::NoEnt.as_neg(), -2);
	}
}
