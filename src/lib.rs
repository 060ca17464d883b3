//! A POSIX-shaped filesystem whose entire state — superblock, inodes,
//! directory entries, and file data — lives in an ordered key-value store.
//!
//! [`FileSystem::open`] mounts a store at a path and returns a [`FileSystem`]
//! handle; every operation on it is serialized behind one internal mutex, so
//! a `FileSystem` is safely shared across threads via `Arc` without any
//! further synchronization by the caller.

mod alloc;
mod cache;
pub mod codec;
pub mod config;
mod engine;
mod error;
mod path;
pub mod store;

pub use codec::{Stat, S_IFDIR, S_IFLNK, S_IFREG};
pub use config::Config;
pub use engine::{DirEntry, DirStream, Engine, OpenFlags, Whence};
pub use error::{Error, Kind, Result};
pub use store::{KvStore, MemStore, SledStore};

/// The top-level handle applications mount and operate against.
///
/// A thin wrapper around [`Engine`] that owns the store and opens it from a
/// [`Config`]; `Engine` itself stays store-agnostic so tests can drive it
/// directly against a [`MemStore`].
pub struct FileSystem {
	engine: Engine,
}

impl FileSystem {
	/// Opens (or initializes) the filesystem backed by a `sled` database at
	/// `cfg.mount_path`.
	pub fn open(cfg: Config) -> Result<Self> {
		let store = SledStore::open(&cfg.mount_path)?;
		let engine = Engine::mount(Box::new(store), cfg)?;
		Ok(Self { engine })
	}

	/// Mounts directly on top of an already-constructed store; used by tests
	/// and by callers embedding a non-default [`KvStore`].
	pub fn mount(store: Box<dyn KvStore>, cfg: Config) -> Result<Self> {
		Ok(Self { engine: Engine::mount(store, cfg)? })
	}

	pub fn unmount(&self) -> Result<()> {
		self.engine.unmount()
	}
}

impl std::ops::Deref for FileSystem {
	type Target = Engine;

	fn deref(&self) -> &Engine {
		&self.engine
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn open_mounts_a_fresh_sled_database() {
		let dir = tempfile::tempdir().unwrap();
		let fs = FileSystem::open(Config::new(dir.path())).unwrap();
		assert!(fs.stat("/", "/").unwrap().is_dir());
		fs.unmount().unwrap();
	}

	#[test]
	fn mount_over_mem_store_round_trips_a_file() {
		let fs = FileSystem::mount(Box::new(MemStore::new()), Config::default()).unwrap();
		let fd = fs.open("/", "/a.txt", OpenFlags::read_write().create(), 0o644).unwrap();
		fs.write(fd, b"hi").unwrap();
		fs.lseek(fd, 0, Whence::Start).unwrap();
		let mut buf = [0u8; 2];
		fs.read(fd, &mut buf).unwrap();
		assert_eq!(&buf, b"hi");
		fs.close(fd).unwrap();
	}
}
