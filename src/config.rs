//! Tunable parameters for the engine.
//!
//! Most fields are fixed at the values the on-disk record layout was
//! designed around; changing [`Config::block_size`] after a filesystem has
//! been created will make its existing records unreadable, since block
//! payloads and inline tails are fixed-size arrays sized by this value.

use std::path::PathBuf;

/// The default block size in bytes: the size of the inline tail and of every
/// chained data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// The default maximum number of simultaneously open file descriptors.
pub const DEFAULT_MAX_OPEN_FILES: usize = 512;
/// The default maximum length, in bytes, of a single path component.
pub const DEFAULT_NAME_MAX: usize = 255;
/// The default maximum depth of symbolic link resolution before LOOP is
/// reported.
pub const DEFAULT_LINK_MAX: usize = 32;
/// The default number of block keys held by a single free-list page.
pub const DEFAULT_FREE_LIST_PAGE_SIZE: usize = 512;

/// Runtime and build-time configuration for a [`crate::engine::Engine`].
#[derive(Debug, Clone)]
pub struct Config {
	/// Directory backing the `sled` database. Created on first mount if
	/// missing.
	pub mount_path: PathBuf,
	/// Size, in bytes, of the inline tail and of every chained block.
	pub block_size: usize,
	/// Maximum number of descriptors the open-file table will hand out at
	/// once.
	pub max_open_files: usize,
	/// Maximum length of a single path component.
	pub name_max: usize,
	/// Maximum number of symbolic links followed while resolving one path.
	pub link_max: usize,
	/// Number of block-key slots per free-list page.
	pub free_list_page_size: usize,
}

impl Config {
	/// Returns the reference configuration mounted at `mount_path`.
	pub fn new<P: Into<PathBuf>>(mount_path: P) -> Self {
		Self {
			mount_path: mount_path.into(),
			..Self::default()
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			mount_path: PathBuf::from("kvfs.db"),
			block_size: DEFAULT_BLOCK_SIZE,
			max_open_files: DEFAULT_MAX_OPEN_FILES,
			name_max: DEFAULT_NAME_MAX,
			link_max: DEFAULT_LINK_MAX,
			free_list_page_size: DEFAULT_FREE_LIST_PAGE_SIZE,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn default_matches_reference_values() {
		let cfg = Config::default();
		assert_eq!(cfg.block_size, 4096);
		assert_eq!(cfg.max_open_files, 512);
		assert_eq!(cfg.name_max, 255);
		assert_eq!(cfg.link_max, 32);
		assert_eq!(cfg.free_list_page_size, 512);
	}

	#[test]
	fn new_overrides_only_mount_path() {
		let cfg = Config::new("/tmp/somewhere");
		assert_eq!(cfg.mount_path, std::path::Path::new("/tmp/somewhere"));
		assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
	}
}
