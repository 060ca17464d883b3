//! Error taxonomy for the key-value filesystem engine.
//!
//! Every fallible operation returns [`Result<T>`], a thin alias over
//! [`std::result::Result`] with [`Error`] as the failure type. The taxonomy is
//! POSIX-errno-shaped rather than a literal `errno` wrapper, since the engine
//! does not run inside a kernel and some of its failure modes (corrupt
//! records, for instance) have no direct `errno` equivalent.

use std::fmt;
use std::io;

/// The kind of failure that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	/// A path or argument was malformed.
	InvalidArgument,
	/// A path component exceeded the configured name length limit.
	NameTooLong,
	/// A required path component or open-file entry does not exist.
	NotFound,
	/// A create-exclusive operation found an existing entry.
	AlreadyExists,
	/// An operation referenced an unknown or closed file descriptor.
	BadDescriptor,
	/// A directory-only operation was attempted on a non-directory.
	NotADirectory,
	/// A file-only operation was attempted on a directory.
	IsADirectory,
	/// Symlink resolution exceeded the configured link depth.
	TooManyLinks,
	/// The open-file table or the underlying store has no room left.
	NoSpace,
	/// The underlying store reported a non-recoverable error.
	Io,
	/// A stored record failed size validation while being decoded.
	Corrupt,
	/// `rmdir` was attempted on a directory with children.
	NotEmpty,
	/// `rename` would cross into a different backing store.
	CrossDevice,
	/// The operation is not permitted (reserved; not enforced by this engine).
	Permission,
	/// The filesystem is mounted read-only (reserved; not enforced by this engine).
	ReadOnlyFs,
}

impl Kind {
	/// Returns the conventional short name for this kind, as used in messages.
	fn as_str(self) -> &'static str {
		match self {
			Kind::InvalidArgument => "invalid argument",
			Kind::NameTooLong => "name too long",
			Kind::NotFound => "no such file or directory",
			Kind::AlreadyExists => "file exists",
			Kind::BadDescriptor => "bad file descriptor",
			Kind::NotADirectory => "not a directory",
			Kind::IsADirectory => "is a directory",
			Kind::TooManyLinks => "too many levels of symbolic links",
			Kind::NoSpace => "no space left",
			Kind::Io => "I/O error",
			Kind::Corrupt => "corrupt record",
			Kind::NotEmpty => "directory not empty",
			Kind::CrossDevice => "cross-device link",
			Kind::Permission => "operation not permitted",
			Kind::ReadOnlyFs => "read-only filesystem",
		}
	}
}

/// An engine failure: a [`Kind`] plus an optional human-readable detail.
#[derive(Debug)]
pub struct Error {
	kind: Kind,
	detail: Option<String>,
}

impl Error {
	/// Creates an error of the given kind with no extra detail.
	pub fn new(kind: Kind) -> Self {
		Self { kind, detail: None }
	}

	/// Creates an error of the given kind, attaching a detail message.
	pub fn with_detail<M: Into<String>>(kind: Kind, detail: M) -> Self {
		Self {
			kind,
			detail: Some(detail.into()),
		}
	}

	/// Returns the kind of this error.
	pub fn kind(&self) -> Kind {
		self.kind
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.detail {
			Some(detail) => write!(f, "{}: {}", self.kind.as_str(), detail),
			None => write!(f, "{}", self.kind.as_str()),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Error::with_detail(Kind::Io, e.to_string())
	}
}

impl From<sled::Error> for Error {
	fn from(e: sled::Error) -> Self {
		match e {
			sled::Error::CollectionNotFound(_) => Error::new(Kind::NotFound),
			sled::Error::Unsupported(msg) => Error::with_detail(Kind::InvalidArgument, msg),
			other => Error::with_detail(Kind::Io, other.to_string()),
		}
	}
}

/// The result type returned by every fallible engine operation.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn display_without_detail() {
		let e = Error::new(Kind::NotFound);
		assert_eq!(e.to_string(), "no such file or directory");
	}

	#[test]
	fn display_with_detail() {
		let e = Error::with_detail(Kind::Corrupt, "inode record was 10 bytes, expected 64");
		assert_eq!(
			e.to_string(),
			"corrupt record: inode record was 10 bytes, expected 64"
		);
	}

	#[test]
	fn io_conversion_maps_to_io_kind() {
		let io_err = io::Error::new(io::ErrorKind::Other, "disk fell off");
		let e: Error = io_err.into();
		assert_eq!(e.kind(), Kind::Io);
	}
}
