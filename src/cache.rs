//! In-memory caches layered over the store: an inode-metadata cache with a
//! write-back discipline, and the open-file table.
//!
//! Grounded on `examples/original_source/fs/inodes/inode_cache.h`
//! (`inode_access_mode`, the `insert`/`get`/`write_back`/`batch_commit`/
//! `evict` method set) and `fs/inodes/open_files_cache.h` (`OpenFilesCache`'s
//! list-plus-hashmap LRU shape, `kvfsFileHandle`). Both use plain
//! `std::collections` there, so this follows suit rather than reaching for a
//! dedicated LRU crate.

use crate::codec::{InodeKey, InodeValue};
use crate::config::Config;
use crate::error::{Error, Kind, Result};
use crate::store::{Batch, KvStore};
use std::collections::{HashMap, VecDeque};

/// The access an inode-cache lookup is performed under.
///
/// READ is dominated by both WRITE and DELETE; WRITE and DELETE are
/// incomparable, but if a key is already marked DELETE a further WRITE
/// request does not downgrade it back — the caller is writing to a file
/// that is concurrently being unlinked, and the delete must win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessMode {
	Read,
	Write,
	Delete,
}

struct Entry {
	value: InodeValue,
	mode: AccessMode,
}

/// A bounded cache of inode metadata, backed by write-back on eviction.
pub struct InodeCache {
	capacity: usize,
	entries: HashMap<InodeKey, Entry>,
	lru: VecDeque<InodeKey>,
}

impl InodeCache {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: HashMap::new(),
			lru: VecDeque::new(),
		}
	}

	fn touch_mru(&mut self, key: InodeKey) {
		self.lru.retain(|k| *k != key);
		self.lru.push_back(key);
	}

	/// Loads `key` under `mode`, consulting the cache first and the store on
	/// a miss. Returns `Ok(None)` if the store has no such record.
	pub fn get(
		&mut self,
		store: &dyn KvStore,
		cfg: &Config,
		key: InodeKey,
		mode: AccessMode,
	) -> Result<Option<InodeValue>> {
		if let Some(entry) = self.entries.get_mut(&key) {
			entry.mode = promote(entry.mode, mode);
			let value = entry.value.clone();
			self.touch_mru(key);
			return Ok(Some(value));
		}

		let Some(bytes) = store.get(&key.encode())? else {
			return Ok(None);
		};
		let value = InodeValue::decode(&bytes, cfg)?;
		self.insert_raw(store, cfg, key, value.clone(), mode)?;
		Ok(Some(value))
	}

	/// Places a freshly created or updated record in the cache, evicting the
	/// least-recently-used entry (with write-back) if at capacity.
	pub fn insert(
		&mut self,
		store: &dyn KvStore,
		cfg: &Config,
		key: InodeKey,
		value: InodeValue,
	) -> Result<()> {
		self.insert_raw(store, cfg, key, value, AccessMode::Write)
	}

	fn insert_raw(
		&mut self,
		store: &dyn KvStore,
		cfg: &Config,
		key: InodeKey,
		value: InodeValue,
		mode: AccessMode,
	) -> Result<()> {
		if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
			if let Some(evict_key) = self.lru.pop_front() {
				self.write_back_key(store, cfg, evict_key)?;
			}
		}
		self.entries.insert(key, Entry { value, mode });
		self.touch_mru(key);
		Ok(())
	}

	/// Marks `key` for deletion on write-back; DELETE always wins over an
	/// existing WRITE mark.
	pub fn mark_delete(&mut self, key: InodeKey) {
		if let Some(entry) = self.entries.get_mut(&key) {
			entry.mode = AccessMode::Delete;
		}
	}

	fn write_back_key(&mut self, store: &dyn KvStore, cfg: &Config, key: InodeKey) -> Result<()> {
		if let Some(entry) = self.entries.remove(&key) {
			match entry.mode {
				AccessMode::Delete => store.delete(&key.encode())?,
				AccessMode::Write | AccessMode::Read => {
					store.put(&key.encode(), &entry.value.encode(cfg)?)?
				}
			}
		}
		Ok(())
	}

	/// Flushes one entry through to the store without evicting it from the
	/// cache (used by `fsync`) — unless it is marked for deletion, in which
	/// case there is nothing left worth caching and it is dropped from both
	/// `entries` and `lru`, matching `write_back_key`.
	pub fn flush(&mut self, store: &dyn KvStore, cfg: &Config, key: InodeKey) -> Result<()> {
		let Some(entry) = self.entries.get_mut(&key) else {
			return Ok(());
		};
		match entry.mode {
			AccessMode::Delete => {
				store.delete(&key.encode())?;
				self.entries.remove(&key);
				self.lru.retain(|k| *k != key);
			}
			AccessMode::Write | AccessMode::Read => {
				store.put(&key.encode(), &entry.value.encode(cfg)?)?;
				entry.mode = AccessMode::Read;
			}
		}
		Ok(())
	}

	/// Atomically commits a rename: deletes `old_key` and writes `new_key`
	/// with `new_value` in a single store batch, then updates the cache.
	pub fn batch_commit(
		&mut self,
		store: &dyn KvStore,
		cfg: &Config,
		old_key: InodeKey,
		new_key: InodeKey,
		new_value: InodeValue,
	) -> Result<()> {
		let mut batch = Batch::new();
		batch.delete(old_key.encode());
		batch.put(new_key.encode(), new_value.encode(cfg)?);
		store.apply_batch(batch)?;

		self.entries.remove(&old_key);
		self.lru.retain(|k| *k != old_key);
		self.entries.insert(
			new_key,
			Entry {
				value: new_value,
				mode: AccessMode::Read,
			},
		);
		self.touch_mru(new_key);
		Ok(())
	}

	/// Drops `key` from the cache without writing it back (used once a
	/// delete has already been committed to the store).
	pub fn evict(&mut self, key: InodeKey) {
		self.entries.remove(&key);
		self.lru.retain(|k| *k != key);
	}

	/// Writes back every dirty entry; called on unmount.
	pub fn flush_all(&mut self, store: &dyn KvStore, cfg: &Config) -> Result<()> {
		let keys: Vec<_> = self.lru.iter().copied().collect();
		for key in keys {
			self.write_back_key(store, cfg, key)?;
		}
		Ok(())
	}
}

fn promote(current: AccessMode, requested: AccessMode) -> AccessMode {
	if current == AccessMode::Delete {
		return AccessMode::Delete;
	}
	std::cmp::max(current, requested)
}

/// One open file's live state.
#[derive(Debug, Clone)]
pub struct FileHandle {
	pub key: InodeKey,
	pub metadata: InodeValue,
	pub flags: crate::engine::OpenFlags,
	pub offset: u64,
}

/// Descriptor-indexed table of open files, capped at
/// [`Config::max_open_files`].
pub struct OpenFileTable {
	max_open: usize,
	next_fd: i32,
	handles: HashMap<i32, FileHandle>,
}

impl OpenFileTable {
	pub fn new(max_open: usize) -> Self {
		Self {
			max_open,
			next_fd: 0,
			handles: HashMap::new(),
		}
	}

	pub fn insert(&mut self, handle: FileHandle) -> Result<i32> {
		if self.handles.len() >= self.max_open {
			return Err(Error::new(Kind::NoSpace));
		}
		let fd = self.next_fd;
		self.next_fd += 1;
		self.handles.insert(fd, handle);
		Ok(fd)
	}

	pub fn get(&self, fd: i32) -> Result<&FileHandle> {
		self.handles.get(&fd).ok_or_else(|| Error::new(Kind::BadDescriptor))
	}

	pub fn get_mut(&mut self, fd: i32) -> Result<&mut FileHandle> {
		self.handles.get_mut(&fd).ok_or_else(|| Error::new(Kind::BadDescriptor))
	}

	pub fn remove(&mut self, fd: i32) -> Result<FileHandle> {
		self.handles.remove(&fd).ok_or_else(|| Error::new(Kind::BadDescriptor))
	}

	pub fn len(&self) -> usize {
		self.handles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handles.is_empty()
	}

	/// True if some open descriptor's handle still references `key`; used by
	/// `unlink`/`rmdir` to defer final reclamation to the last `close`.
	pub fn any_open(&self, key: InodeKey) -> bool {
		self.handles.values().any(|h| h.key == key)
	}
}
