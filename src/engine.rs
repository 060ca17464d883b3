//! The file-system operation surface: open, read/write, rename, directory
//! listing, symlinks, and the mount lifecycle.
//!
//! Grounded end to end on `examples/original_source/fs/kvfs/kvfs.cpp`'s
//! `FSInit`, `Open`, `Read`, `Write`, and `Close`. `OpenDir`/`ReadDir`/
//! `CloseDir`/`Link`/`SymLink`/`ReadLink` are non-functional stubs in that
//! source (each returns immediately without touching the store), so their
//! behavior here is built directly from the design's algorithm descriptions
//! instead of transliterated from a working reference.

use crate::alloc::Allocator;
use crate::cache::{AccessMode, FileHandle, InodeCache, OpenFileTable};
use crate::codec::{BlockKey, BlockValue, InodeKey, InodeValue, Stat, Superblock, S_IFDIR, S_IFLNK, S_IFREG};
use crate::config::Config;
use crate::error::{Error, Kind, Result};
use crate::path;
use crate::store::KvStore;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// `open` option flags, mirroring the POSIX subset the design calls out.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
	pub read: bool,
	pub write: bool,
	pub create: bool,
	pub exclusive: bool,
	pub truncate: bool,
	pub append: bool,
	pub sync: bool,
}

impl OpenFlags {
	pub fn read_only() -> Self {
		Self { read: true, ..Default::default() }
	}

	pub fn write_only() -> Self {
		Self { write: true, ..Default::default() }
	}

	pub fn read_write() -> Self {
		Self { read: true, write: true, ..Default::default() }
	}

	pub fn create(mut self) -> Self {
		self.create = true;
		self
	}

	pub fn exclusive(mut self) -> Self {
		self.exclusive = true;
		self
	}

	pub fn truncate(mut self) -> Self {
		self.truncate = true;
		self
	}

	pub fn append(mut self) -> Self {
		self.append = true;
		self
	}

	pub fn sync(mut self) -> Self {
		self.sync = true;
		self
	}
}

/// One entry returned by [`Engine::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub name: String,
	pub ino: u64,
	pub is_dir: bool,
}

/// A directory stream opened by [`Engine::opendir`].
pub struct DirStream {
	entries: Vec<DirEntry>,
	position: usize,
}

fn now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Mutable engine state guarded by a single process-wide mutex: every public
/// [`Engine`] method takes the lock for its whole duration, matching the
/// reference's single `mutex_` guarding all mutating (and, there, all)
/// operations.
struct State {
	superblock: Superblock,
	inode_cache: InodeCache,
	open_files: OpenFileTable,
	/// Inodes whose `unlink`/`rmdir` was deferred because a descriptor was
	/// still open on them; reclaimed by `close` once the last one goes away.
	pending_delete: std::collections::HashSet<InodeKey>,
}

/// The key-value-backed filesystem engine.
pub struct Engine {
	store: Box<dyn KvStore>,
	cfg: Config,
	state: Mutex<State>,
}

impl Engine {
	/// Mounts the filesystem backed by `store`, initializing a fresh
	/// superblock and root directory on first mount.
	///
	/// Grounded on `FSInit`.
	pub fn mount(store: Box<dyn KvStore>, cfg: Config) -> Result<Self> {
		let mut superblock = match store.get(Superblock::KEY)? {
			Some(bytes) => {
				let mut sb = Superblock::decode(&bytes)?;
				sb.mount_count += 1;
				sb.last_mount_time = now();
				log::debug!("remounting existing filesystem, mount #{}", sb.mount_count);
				sb
			}
			None => {
				let t = now();
				log::debug!("initializing fresh filesystem");
				Superblock {
					next_free_inode: 1,
					total_inode_count: 1,
					next_free_block_number: 0,
					total_block_count: 0,
					freed_blocks_count: 0,
					freed_inodes_count: 0,
					mount_count: 1,
					creation_time: t,
					last_mount_time: t,
				}
			}
		};
		store.put(Superblock::KEY, &superblock.encode())?;

		let root_key = InodeKey::root();
		if store.get(&root_key.encode())?.is_none() {
			let root = InodeValue {
				name: "/".to_string(),
				stat: Stat {
					ino: 0,
					mode: S_IFDIR | 0o755,
					nlink: 2,
					atime: superblock.creation_time,
					mtime: superblock.creation_time,
					ctime: superblock.creation_time,
					..Default::default()
				},
				parent_key: root_key,
				head_block: BlockKey::NONE,
				last_block_key: BlockKey::NONE,
				inline_tail: Vec::new(),
				real_key: root_key,
			};
			store.put(&root_key.encode(), &root.encode(&cfg)?)?;
		}
		superblock = Superblock::decode(&store.get(Superblock::KEY)?.unwrap())?;
		let max_open_files = cfg.max_open_files;

		Ok(Self {
			store,
			cfg,
			state: Mutex::new(State {
				superblock,
				inode_cache: InodeCache::new(256),
				open_files: OpenFileTable::new(max_open_files),
				pending_delete: std::collections::HashSet::new(),
			}),
		})
	}

	/// Flushes all dirty cache entries and the superblock, then syncs the
	/// store. Grounded on the unmount half of the reference's mount
	/// lifecycle (no explicit `Unmount` function exists in the source; this
	/// mirrors what `Close`'s `merge` + `sync` pair does per-file, applied
	/// to the whole cache).
	pub fn unmount(&self) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.inode_cache.flush_all(self.store.as_ref(), &self.cfg)?;
		self.store.put(Superblock::KEY, &state.superblock.encode())?;
		self.store.sync()?;
		Ok(())
	}

	/// Grounded on `Open`. Resolves `path`; with `O_CREAT` mints a new inode
	/// when the leaf is absent (failing `AlreadyExists` under `O_EXCL` if it
	/// is present); otherwise the leaf must already exist. The descriptor is
	/// only allocated after the metadata has been successfully read or
	/// created (Open Question 2: the reference allocates the descriptor
	/// before that read can fail).
	pub fn open(&self, cwd: &str, path_str: &str, flags: OpenFlags, mode: u32) -> Result<i32> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;

		let (key, value) = match resolved.leaf_value {
			Some(existing) => {
				if flags.create && flags.exclusive {
					return Err(Error::new(Kind::AlreadyExists));
				}
				if existing.stat.is_dir() && flags.write {
					return Err(Error::new(Kind::IsADirectory));
				}
				let mut value = existing;
				if flags.truncate {
					self.release_chain(&mut state, &value)?;
					value.head_block = BlockKey::NONE;
					value.last_block_key = BlockKey::NONE;
					value.inline_tail.clear();
					value.stat.size = 0;
					value.stat.blocks = 0;
					state.inode_cache.insert(self.store.as_ref(), &self.cfg, resolved.leaf, value.clone())?;
				}
				(resolved.leaf, value)
			}
			None => {
				if !flags.create {
					return Err(Error::new(Kind::NotFound));
				}
				let t = now();
				let ino = Allocator::new(self.store.as_ref(), &self.cfg).new_inode(&mut state.superblock)?;
				let value = InodeValue {
					name: resolved.leaf_name.clone(),
					stat: Stat {
						ino,
						mode: S_IFREG | (mode & 0o777),
						nlink: 1,
						atime: t,
						mtime: t,
						ctime: t,
						..Default::default()
					},
					parent_key: resolved.parent,
					head_block: BlockKey::NONE,
					last_block_key: BlockKey::NONE,
					inline_tail: Vec::new(),
					real_key: resolved.leaf,
				};
				state.inode_cache.insert(self.store.as_ref(), &self.cfg, resolved.leaf, value.clone())?;
				(resolved.leaf, value)
			}
		};

		let fd = state.open_files.insert(FileHandle {
			key,
			metadata: value,
			flags,
			offset: 0,
		}).inspect_err(|_| {
			log::warn!("open file table exhausted at {} descriptors", state.open_files.len());
		})?;

		if flags.sync {
			state.inode_cache.flush(self.store.as_ref(), &self.cfg, key)?;
			self.store.sync()?;
		}
		Ok(fd)
	}

	/// Grounded on `Read`: copies the inline tail first, then walks the
	/// block chain.
	pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
		let mut state = self.state.lock().unwrap();
		let offset = state.open_files.get(fd)?.offset;
		let n = self.pread_locked(&mut state, fd, buf, offset)?;
		state.open_files.get_mut(fd)?.offset += n as u64;
		Ok(n)
	}

	pub fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<usize> {
		let mut state = self.state.lock().unwrap();
		self.pread_locked(&mut state, fd, buf, offset)
	}

	fn pread_locked(&self, state: &mut State, fd: i32, buf: &mut [u8], offset: u64) -> Result<usize> {
		let md = state.open_files.get(fd)?.metadata.clone();
		let offset = offset as usize;
		if offset >= md.stat.size as usize {
			return Ok(0);
		}

		let mut produced = 0usize;
		let mut cursor = offset;
		let tail_len = md.inline_tail.len();

		if cursor < tail_len {
			let n = (tail_len - cursor).min(buf.len());
			buf[..n].copy_from_slice(&md.inline_tail[cursor..cursor + n]);
			produced += n;
			cursor += n;
		}

		if produced == buf.len() {
			return Ok(produced);
		}

		// Only continue into the chain once the tail is known to be full;
		// otherwise the tail IS the whole file and we are at EOF.
		if tail_len < self.cfg.block_size {
			return Ok(produced);
		}

		let mut remaining_before_chain = cursor.saturating_sub(tail_len);
		let mut next = md.head_block;
		while !next.is_none() && produced < buf.len() {
			let Some(bytes) = self.store.get(&next.encode())? else {
				break;
			};
			let block = BlockValue::decode(&bytes, &self.cfg)?;
			let block_size = block.size as usize;
			if remaining_before_chain >= block_size {
				remaining_before_chain -= block_size;
				next = block.next;
				continue;
			}
			let start = remaining_before_chain;
			let n = (block_size - start).min(buf.len() - produced);
			buf[produced..produced + n].copy_from_slice(&block.data[start..start + n]);
			produced += n;
			remaining_before_chain = 0;
			next = block.next;
		}

		Ok(produced)
	}

	/// Grounded on `Write`, with the inline-tail-then-chain structure of the
	/// two reference branches collapsed into one algorithm, using strict
	/// `<` uniformly where the reference's two branches disagreed (Open
	/// Question 1).
	pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
		let mut state = self.state.lock().unwrap();
		let (append, offset) = {
			let handle = state.open_files.get(fd)?;
			(handle.flags.append, if handle.flags.append { handle.metadata.stat.size } else { handle.offset })
		};
		let n = self.pwrite_locked(&mut state, fd, buf, offset)?;
		let handle = state.open_files.get_mut(fd)?;
		if !append {
			handle.offset = offset + n as u64;
		} else {
			handle.offset = handle.metadata.stat.size;
		}
		Ok(n)
	}

	pub fn pwrite(&self, fd: i32, buf: &[u8], offset: u64) -> Result<usize> {
		let mut state = self.state.lock().unwrap();
		self.pwrite_locked(&mut state, fd, buf, offset)
	}

	fn pwrite_locked(&self, state: &mut State, fd: i32, buf: &[u8], offset: u64) -> Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let mut md = state.open_files.get(fd)?.metadata.clone();
		let offset = offset as usize;
		let current_size = md.stat.size as usize;

		// A write past the current end of file zero-fills the gap (holes are
		// materialized, not represented sparsely).
		if offset > current_size {
			let padding = vec![0u8; offset - current_size];
			self.append_locked(state, &mut md, &padding)?;
		} else if offset < current_size {
			self.overwrite_locked(&mut md, buf, offset)?;
			let overlap = (current_size - offset).min(buf.len());
			if overlap == buf.len() {
				self.commit_metadata(state, fd, md)?;
				return Ok(buf.len());
			}
			self.append_locked(state, &mut md, &buf[overlap..])?;
			self.commit_metadata(state, fd, md)?;
			return Ok(buf.len());
		}

		self.append_locked(state, &mut md, buf)?;
		self.commit_metadata(state, fd, md)?;
		Ok(buf.len())
	}

	fn commit_metadata(&self, state: &mut State, fd: i32, md: InodeValue) -> Result<()> {
		let key = state.open_files.get(fd)?.key;
		state.open_files.get_mut(fd)?.metadata = md.clone();
		// Write-back on close/fsync, per the design's deferred-commit policy;
		// here we still keep the cache's copy current so concurrent
		// descriptors on the same inode observe the write immediately.
		state.inode_cache.insert(self.store.as_ref(), &self.cfg, key, md)?;
		Ok(())
	}

	/// Overwrites `buf` into already-allocated storage starting at byte
	/// `offset < size`, without allocating new blocks or changing `size`.
	/// Only the overlap with existing content is written; the caller appends
	/// anything beyond the current end of file.
	fn overwrite_locked(&self, md: &mut InodeValue, buf: &[u8], offset: usize) -> Result<()> {
		let size = md.stat.size as usize;
		let overlap = (size - offset).min(buf.len());
		let mut written = 0usize;
		let mut cursor = offset;
		let tail_len = md.inline_tail.len();

		if cursor < tail_len && written < overlap {
			let n = (tail_len - cursor).min(overlap - written);
			md.inline_tail[cursor..cursor + n].copy_from_slice(&buf[written..written + n]);
			written += n;
			cursor += n;
		}
		if written == overlap {
			md.stat.mtime = now();
			return Ok(());
		}

		let mut remaining_before = cursor - tail_len;
		let mut next = md.head_block;
		while !next.is_none() && written < overlap {
			let bytes = self.store.get(&next.encode())?.ok_or_else(|| {
				Error::with_detail(Kind::Corrupt, "missing block in chain during overwrite")
			})?;
			let mut block = BlockValue::decode(&bytes, &self.cfg)?;
			let block_size = block.size as usize;
			if remaining_before >= block_size {
				remaining_before -= block_size;
				next = block.next;
				continue;
			}
			let start = remaining_before;
			let n = (block_size - start).min(overlap - written);
			block.data[start..start + n].copy_from_slice(&buf[written..written + n]);
			self.store.put(&next.encode(), &block.encode(&self.cfg))?;
			written += n;
			remaining_before = 0;
			next = block.next;
		}
		md.stat.mtime = now();
		Ok(())
	}

	/// Appends `buf` to the end of the file described by `md`, filling the
	/// inline tail before allocating any chained block. `state` must already
	/// be locked by the caller: this only needs it for the allocator's
	/// superblock, never for the open-file table.
	fn append_locked(&self, state: &mut State, md: &mut InodeValue, buf: &[u8]) -> Result<()> {
		if buf.is_empty() {
			return Ok(());
		}
		let block_size = self.cfg.block_size;
		let mut pos = 0usize;

		if md.inline_tail.len() < block_size {
			let room = block_size - md.inline_tail.len();
			let n = room.min(buf.len());
			md.inline_tail.extend_from_slice(&buf[pos..pos + n]);
			pos += n;
			if pos == buf.len() {
				self.finish_append(md, buf.len(), 0)?;
				return Ok(());
			}
		}

		// Inline tail is now full (or already was); continue into the chain.
		let allocator = Allocator::new(self.store.as_ref(), &self.cfg);
		let owner = md.stat.ino;

		let mut tail_key = md.last_block_key;
		let mut tail_block = if tail_key.is_none() {
			None
		} else {
			let bytes = self.store.get(&tail_key.encode())?.ok_or_else(|| {
				Error::with_detail(Kind::Corrupt, "missing last block referenced by metadata")
			})?;
			Some(BlockValue::decode(&bytes, &self.cfg)?)
		};

		// Top up the current last block if it has spare room.
		if let Some(block) = tail_block.as_mut() {
			let room = block_size - block.size as usize;
			if room > 0 {
				let n = room.min(buf.len() - pos);
				block.data[block.size as usize..block.size as usize + n]
					.copy_from_slice(&buf[pos..pos + n]);
				block.size += n as u32;
				self.store.put(&tail_key.encode(), &block.encode(&self.cfg))?;
				pos += n;
			}
		}

		let mut new_blocks = 0u64;
		while pos < buf.len() {
			let n = (buf.len() - pos).min(block_size);
			let new_key = allocator.acquire_block(&mut state.superblock, owner)?;
			let mut new_block = BlockValue::empty(&self.cfg);
			new_block.data[..n].copy_from_slice(&buf[pos..pos + n]);
			new_block.size = n as u32;
			self.store.put(&new_key.encode(), &new_block.encode(&self.cfg))?;

			if let Some(prev_key) = (!tail_key.is_none()).then_some(tail_key) {
				let mut prev_bytes = self.store.get(&prev_key.encode())?.unwrap();
				let mut prev = BlockValue::decode(&prev_bytes, &self.cfg)?;
				prev.next = new_key;
				prev_bytes = prev.encode(&self.cfg);
				self.store.put(&prev_key.encode(), &prev_bytes)?;
			} else if md.head_block.is_none() {
				md.head_block = new_key;
			}

			tail_key = new_key;
			tail_block = Some(new_block);
			new_blocks += 1;
			pos += n;
		}
		let _ = tail_block;

		md.last_block_key = tail_key;
		self.finish_append(md, buf.len(), new_blocks)
	}

	fn finish_append(&self, md: &mut InodeValue, written: usize, new_blocks: u64) -> Result<()> {
		md.stat.size += written as u64;
		md.stat.blocks += new_blocks;
		md.stat.mtime = now();
		Ok(())
	}

	/// Grounded on `Close`: write back the metadata and sync, then complete
	/// any `unlink`/`rmdir` that was deferred while this was the last open
	/// descriptor on the inode.
	pub fn close(&self, fd: i32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let handle = state.open_files.remove(fd)?;
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, handle.key)?;
		self.store.sync()?;

		if state.pending_delete.contains(&handle.key) && !state.open_files.any_open(handle.key) {
			state.pending_delete.remove(&handle.key);
			let metadata = handle.metadata.clone();
			self.release_chain(&mut state, &metadata)?;
			state.inode_cache.mark_delete(handle.key);
			state.inode_cache.flush(self.store.as_ref(), &self.cfg, handle.key)?;
			Allocator::new(self.store.as_ref(), &self.cfg).free_inode(&mut state.superblock)?;
			log::debug!("completed deferred reclamation of inode {} on last close", metadata.stat.ino);
		}
		Ok(())
	}

	pub fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> Result<u64> {
		let mut state = self.state.lock().unwrap();
		let handle = state.open_files.get_mut(fd)?;
		let base = match whence {
			Whence::Start => 0,
			Whence::Current => handle.offset as i64,
			Whence::End => handle.metadata.stat.size as i64,
		};
		let new_offset = base + offset;
		if new_offset < 0 {
			return Err(Error::new(Kind::InvalidArgument));
		}
		handle.offset = new_offset as u64;
		Ok(handle.offset)
	}

	/// Releases every block in `value`'s chain to the free-list.
	fn release_chain(&self, state: &mut State, value: &InodeValue) -> Result<()> {
		let allocator = Allocator::new(self.store.as_ref(), &self.cfg);
		let mut next = value.head_block;
		while !next.is_none() {
			let bytes = self.store.get(&next.encode())?;
			let Some(bytes) = bytes else { break };
			let block = BlockValue::decode(&bytes, &self.cfg)?;
			self.store.delete(&next.encode())?;
			allocator.release_block(&mut state.superblock, next)?;
			next = block.next;
		}
		Ok(())
	}

	/// Releases `value`'s block chain, removes its record, and frees its
	/// inode number — or, if some open descriptor still references `key`,
	/// defers all of that to the matching `close` (SPEC_FULL.md §8.1
	/// invariant #1: an open descriptor's key must stay an extant store
	/// record until the descriptor itself is closed).
	fn release_or_defer(&self, state: &mut State, key: InodeKey, value: &InodeValue) -> Result<()> {
		if state.open_files.any_open(key) {
			state.pending_delete.insert(key);
			log::debug!("deferring reclamation of inode {} until last close", value.stat.ino);
			return Ok(());
		}
		self.release_chain(state, value)?;
		state.inode_cache.mark_delete(key);
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, key)?;
		Allocator::new(self.store.as_ref(), &self.cfg).free_inode(&mut state.superblock)?;
		Ok(())
	}

	/// `unlink`: releases the block chain, deletes the record, frees the
	/// inode number (or defers that to the last `close`, if a descriptor is
	/// still open on this inode).
	pub fn unlink(&self, cwd: &str, path_str: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		let Some(value) = resolved.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		if value.stat.is_dir() {
			return Err(Error::new(Kind::IsADirectory));
		}
		log::debug!("unlinking inode {} ({} blocks)", value.stat.ino, value.stat.blocks);
		self.release_or_defer(&mut state, resolved.leaf, &value)
	}

	/// `rmdir`: fails `NotEmpty` if any child exists under the prefix scan.
	pub fn rmdir(&self, cwd: &str, path_str: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		let Some(value) = resolved.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		if !value.stat.is_dir() {
			return Err(Error::new(Kind::NotADirectory));
		}
		let prefix = value.stat.ino.to_le_bytes();
		let has_children = self
			.store
			.iter_from(&prefix)?
			.into_iter()
			.any(|(key, _)| key.len() == InodeKey::ENCODED_LEN);
		if has_children {
			return Err(Error::new(Kind::NotEmpty));
		}
		self.release_or_defer(&mut state, resolved.leaf, &value)
	}

	pub fn mkdir(&self, cwd: &str, path_str: &str, mode: u32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		if resolved.leaf_value.is_some() {
			return Err(Error::new(Kind::AlreadyExists));
		}
		let t = now();
		let ino = Allocator::new(self.store.as_ref(), &self.cfg).new_inode(&mut state.superblock)?;
		let value = InodeValue {
			name: resolved.leaf_name,
			stat: Stat {
				ino,
				mode: S_IFDIR | (mode & 0o777),
				nlink: 2,
				atime: t,
				mtime: t,
				ctime: t,
				..Default::default()
			},
			parent_key: resolved.parent,
			head_block: BlockKey::NONE,
			last_block_key: BlockKey::NONE,
			inline_tail: Vec::new(),
			real_key: resolved.leaf,
		};
		state.inode_cache.insert(self.store.as_ref(), &self.cfg, resolved.leaf, value.clone())?;
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, resolved.leaf)?;
		Ok(())
	}

	/// Grounded on the design's rename algorithm: an atomic
	/// delete-old/put-new batch via [`InodeCache::batch_commit`].
	pub fn rename(&self, cwd: &str, old_path: &str, new_path: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let old = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, old_path)?;
		let Some(mut old_value) = old.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		let new = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, new_path)?;
		if new.leaf_value.is_some() {
			return Err(Error::new(Kind::AlreadyExists));
		}

		old_value.name = new.leaf_name;
		old_value.parent_key = new.parent;
		state
			.inode_cache
			.batch_commit(self.store.as_ref(), &self.cfg, old.leaf, new.leaf, old_value)?;
		Ok(())
	}

	/// `symlink`: stores the target path as the inline tail of a
	/// symlink-typed inode.
	pub fn symlink(&self, cwd: &str, target: &str, link_path: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, link_path)?;
		if resolved.leaf_value.is_some() {
			return Err(Error::new(Kind::AlreadyExists));
		}
		if target.len() > self.cfg.block_size {
			return Err(Error::new(Kind::InvalidArgument));
		}
		let t = now();
		let ino = Allocator::new(self.store.as_ref(), &self.cfg).new_inode(&mut state.superblock)?;
		let value = InodeValue {
			name: resolved.leaf_name,
			stat: Stat {
				ino,
				mode: S_IFLNK | 0o777,
				nlink: 1,
				size: target.len() as u64,
				atime: t,
				mtime: t,
				ctime: t,
				..Default::default()
			},
			parent_key: resolved.parent,
			head_block: BlockKey::NONE,
			last_block_key: BlockKey::NONE,
			inline_tail: target.as_bytes().to_vec(),
			real_key: resolved.leaf,
		};
		state.inode_cache.insert(self.store.as_ref(), &self.cfg, resolved.leaf, value.clone())?;
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, resolved.leaf)?;
		Ok(())
	}

	/// `readlink`: returns the symlink's stored target without following it.
	pub fn readlink(&self, cwd: &str, path_str: &str) -> Result<String> {
		let mut state = self.state.lock().unwrap();
		let full = if path_str.starts_with('/') {
			path_str.to_string()
		} else {
			format!("{cwd}/{path_str}")
		};
		// Resolve everything but the final component so the symlink itself is
		// returned rather than followed.
		let (parent_path, leaf_name) = match full.rsplit_once('/') {
			Some((p, n)) => (if p.is_empty() { "/".to_string() } else { p.to_string() }, n.to_string()),
			None => ("/".to_string(), full.clone()),
		};
		let parent = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, &parent_path)?;
		let Some(parent_value) = parent.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		let key = InodeKey::new(parent_value.stat.ino, &leaf_name);
		let Some(value) = state.inode_cache.get(self.store.as_ref(), &self.cfg, key, AccessMode::Read)? else {
			return Err(Error::new(Kind::NotFound));
		};
		if !value.stat.is_symlink() {
			return Err(Error::new(Kind::InvalidArgument));
		}
		String::from_utf8(value.inline_tail)
			.map_err(|_| Error::with_detail(Kind::Corrupt, "symlink target is not utf-8"))
	}

	pub fn stat(&self, cwd: &str, path_str: &str) -> Result<Stat> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		resolved.leaf_value.map(|v| v.stat).ok_or_else(|| Error::new(Kind::NotFound))
	}

	pub fn fstat(&self, fd: i32) -> Result<Stat> {
		let state = self.state.lock().unwrap();
		Ok(state.open_files.get(fd)?.metadata.stat)
	}

	pub fn chmod(&self, cwd: &str, path_str: &str, mode: u32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		let Some(mut value) = resolved.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		value.stat.mode = (value.stat.mode & !0o777) | (mode & 0o777);
		value.stat.ctime = now();
		state.inode_cache.insert(self.store.as_ref(), &self.cfg, resolved.leaf, value)?;
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, resolved.leaf)?;
		Ok(())
	}

	/// Only `len == 0` is supported, matching the design's stated
	/// restriction: the whole chain is released and the file becomes empty.
	pub fn truncate(&self, cwd: &str, path_str: &str, len: u64) -> Result<()> {
		if len != 0 {
			return Err(Error::new(Kind::InvalidArgument));
		}
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		let Some(mut value) = resolved.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		self.release_chain(&mut state, &value)?;
		value.head_block = BlockKey::NONE;
		value.last_block_key = BlockKey::NONE;
		value.inline_tail.clear();
		value.stat.size = 0;
		value.stat.blocks = 0;
		value.stat.mtime = now();
		state.inode_cache.insert(self.store.as_ref(), &self.cfg, resolved.leaf, value)?;
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, resolved.leaf)?;
		Ok(())
	}

	pub fn fsync(&self, fd: i32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let key = state.open_files.get(fd)?.key;
		state.inode_cache.flush(self.store.as_ref(), &self.cfg, key)?;
		self.store.sync()
	}

	/// Opens a directory stream by scanning every record whose key's parent
	/// component matches the resolved directory's inode number.
	pub fn opendir(&self, cwd: &str, path_str: &str) -> Result<DirStream> {
		let mut state = self.state.lock().unwrap();
		let resolved = path::resolve(self.store.as_ref(), &self.cfg, &mut state.inode_cache, cwd, path_str)?;
		let Some(dir_value) = resolved.leaf_value else {
			return Err(Error::new(Kind::NotFound));
		};
		if !dir_value.stat.is_dir() {
			return Err(Error::new(Kind::NotADirectory));
		}

		let prefix = dir_value.stat.ino.to_le_bytes();
		let mut entries = vec![
			DirEntry { name: ".".to_string(), ino: dir_value.stat.ino, is_dir: true },
			DirEntry { name: "..".to_string(), ino: dir_value.parent_key.parent_inode, is_dir: true },
		];
		for (key_bytes, value_bytes) in self.store.iter_from(&prefix)? {
			if key_bytes.len() != InodeKey::ENCODED_LEN {
				continue;
			}
			let value = InodeValue::decode(&value_bytes, &self.cfg)?;
			entries.push(DirEntry {
				name: value.name,
				ino: value.stat.ino,
				is_dir: value.stat.is_dir(),
			});
		}

		Ok(DirStream { entries, position: 0 })
	}

	pub fn readdir(&self, stream: &mut DirStream) -> Option<DirEntry> {
		let entry = stream.entries.get(stream.position).cloned();
		if entry.is_some() {
			stream.position += 1;
		}
		entry
	}

	pub fn closedir(&self, _stream: DirStream) {}
}

/// `lseek` origin.
#[derive(Debug, Clone, Copy)]
pub enum Whence {
	Start,
	Current,
	End,
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::store::MemStore;

	fn engine() -> Engine {
		Engine::mount(Box::new(MemStore::new()), Config::default()).unwrap()
	}

	#[test]
	fn mount_creates_root() {
		let eng = engine();
		let st = eng.stat("/", "/").unwrap();
		assert!(st.is_dir());
	}

	#[test]
	fn create_write_read_round_trip() {
		let eng = engine();
		let fd = eng.open("/", "/file.txt", OpenFlags::read_write().create(), 0o644).unwrap();
		let n = eng.write(fd, b"hello world").unwrap();
		assert_eq!(n, 11);
		eng.lseek(fd, 0, Whence::Start).unwrap();
		let mut buf = [0u8; 11];
		let read = eng.read(fd, &mut buf).unwrap();
		assert_eq!(read, 11);
		assert_eq!(&buf, b"hello world");
		eng.close(fd).unwrap();
	}

	#[test]
	fn open_without_create_on_missing_path_fails_not_found() {
		let eng = engine();
		let err = eng.open("/", "/nope.txt", OpenFlags::read_only(), 0).unwrap_err();
		assert_eq!(err.kind(), Kind::NotFound);
	}

	#[test]
	fn create_exclusive_on_existing_fails_already_exists() {
		let eng = engine();
		let fd = eng.open("/", "/f", OpenFlags::write_only().create(), 0o644).unwrap();
		eng.close(fd).unwrap();
		let err = eng
			.open("/", "/f", OpenFlags::write_only().create().exclusive(), 0o644)
			.unwrap_err();
		assert_eq!(err.kind(), Kind::AlreadyExists);
	}

	#[test]
	fn inline_tail_boundary_4096() {
		let eng = engine();
		let fd = eng.open("/", "/f", OpenFlags::read_write().create(), 0o644).unwrap();
		eng.write(fd, &vec![b'a'; 4095]).unwrap();
		assert_eq!(eng.fstat(fd).unwrap().size, 4095);
		assert_eq!(eng.fstat(fd).unwrap().blocks, 0);
		eng.write(fd, b"b").unwrap();
		assert_eq!(eng.fstat(fd).unwrap().size, 4096);
		assert_eq!(eng.fstat(fd).unwrap().blocks, 0);
		eng.write(fd, b"c").unwrap();
		assert_eq!(eng.fstat(fd).unwrap().size, 4097);
		assert_eq!(eng.fstat(fd).unwrap().blocks, 1);
		eng.close(fd).unwrap();
	}

	#[test]
	fn spill_across_multiple_blocks() {
		let eng = engine();
		let fd = eng.open("/", "/big", OpenFlags::read_write().create(), 0o644).unwrap();
		let data: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
		eng.write(fd, &data).unwrap();
		let st = eng.fstat(fd).unwrap();
		assert_eq!(st.size, 20000);
		assert_eq!(st.blocks, 4);

		eng.lseek(fd, 0, Whence::Start).unwrap();
		let mut out = vec![0u8; 20000];
		let mut read_total = 0;
		while read_total < out.len() {
			let n = eng.read(fd, &mut out[read_total..]).unwrap();
			if n == 0 {
				break;
			}
			read_total += n;
		}
		assert_eq!(read_total, 20000);
		assert_eq!(out, data);
		eng.close(fd).unwrap();
	}

	#[test]
	fn unlink_then_create_reuses_freed_blocks_lifo() {
		let eng = engine();
		let fd1 = eng.open("/", "/h", OpenFlags::read_write().create(), 0o644).unwrap();
		eng.write(fd1, &vec![b'x'; 20000]).unwrap();
		eng.close(fd1).unwrap();
		eng.unlink("/", "/h").unwrap();

		let fd2 = eng.open("/", "/i", OpenFlags::read_write().create(), 0o644).unwrap();
		eng.write(fd2, &vec![b'y'; 20000]).unwrap();
		let st = eng.fstat(fd2).unwrap();
		assert_eq!(st.blocks, 4);
		eng.close(fd2).unwrap();
	}

	#[test]
	fn unlink_while_open_defers_reclamation_until_close() {
		let eng = engine();
		let fd = eng.open("/", "/h", OpenFlags::read_write().create(), 0o644).unwrap();
		eng.write(fd, b"still readable").unwrap();

		eng.unlink("/", "/h").unwrap();

		// The open descriptor must keep working: its inode key still names an
		// extant store record.
		eng.lseek(fd, 0, Whence::Start).unwrap();
		let mut buf = [0u8; 14];
		eng.read(fd, &mut buf).unwrap();
		assert_eq!(&buf, b"still readable");
		assert!(eng.fstat(fd).is_ok());

		eng.close(fd).unwrap();

		// A fresh descriptor on the same inode key is gone now.
		let err = eng.open("/", "/h", OpenFlags::read_only(), 0).unwrap_err();
		assert_eq!(err.kind(), Kind::NotFound);
	}

	#[test]
	fn mkdir_rmdir_round_trip() {
		let eng = engine();
		eng.mkdir("/", "/d", 0o755).unwrap();
		assert!(eng.stat("/", "/d").unwrap().is_dir());
		eng.rmdir("/", "/d").unwrap();
		let err = eng.stat("/", "/d").unwrap_err();
		assert_eq!(err.kind(), Kind::NotFound);
	}

	#[test]
	fn rmdir_on_nonempty_directory_fails() {
		let eng = engine();
		eng.mkdir("/", "/d", 0o755).unwrap();
		let fd = eng.open("/", "/d/f", OpenFlags::write_only().create(), 0o644).unwrap();
		eng.close(fd).unwrap();
		let err = eng.rmdir("/", "/d").unwrap_err();
		assert_eq!(err.kind(), Kind::NotEmpty);
	}

	#[test]
	fn rename_makes_old_name_disappear_and_new_name_appear() {
		let eng = engine();
		let fd = eng.open("/", "/a", OpenFlags::write_only().create(), 0o644).unwrap();
		eng.close(fd).unwrap();
		eng.rename("/", "/a", "/b").unwrap();
		assert_eq!(eng.stat("/", "/a").unwrap_err().kind(), Kind::NotFound);
		assert!(eng.stat("/", "/b").is_ok());
	}

	#[test]
	fn symlink_readlink_and_resolution() {
		let eng = engine();
		let fd = eng.open("/", "/target", OpenFlags::write_only().create(), 0o644).unwrap();
		eng.write(fd, b"hi").unwrap();
		eng.close(fd).unwrap();
		eng.symlink("/", "/target", "/link").unwrap();
		assert_eq!(eng.readlink("/", "/link").unwrap(), "/target");

		let fd2 = eng.open("/", "/link", OpenFlags::read_only(), 0).unwrap();
		let mut buf = [0u8; 2];
		eng.read(fd2, &mut buf).unwrap();
		assert_eq!(&buf, b"hi");
		eng.close(fd2).unwrap();
	}

	#[test]
	fn name_too_long_is_rejected() {
		let eng = engine();
		let name = "a".repeat(300);
		let path = format!("/{name}");
		let err = eng.open("/", &path, OpenFlags::write_only().create(), 0o644).unwrap_err();
		assert_eq!(err.kind(), Kind::NameTooLong);
	}

	#[test]
	fn open_file_table_exhaustion_reports_no_space() {
		let cfg = Config { max_open_files: 2, ..Config::default() };
		let eng = Engine::mount(Box::new(MemStore::new()), cfg).unwrap();
		let mut fds = Vec::new();
		for i in 0..2 {
			let fd = eng
				.open("/", &format!("/f{i}"), OpenFlags::write_only().create(), 0o644)
				.unwrap();
			fds.push(fd);
		}
		let err = eng.open("/", "/f2", OpenFlags::write_only().create(), 0o644).unwrap_err();
		assert_eq!(err.kind(), Kind::NoSpace);
	}

	#[test]
	fn overwrite_inside_existing_data_does_not_change_size() {
		let eng = engine();
		let fd = eng.open("/", "/f", OpenFlags::read_write().create(), 0o644).unwrap();
		eng.write(fd, b"hello world").unwrap();
		eng.pwrite(fd, b"WORLD", 6).unwrap();
		let mut buf = [0u8; 11];
		eng.pread(fd, &mut buf, 0).unwrap();
		assert_eq!(&buf, b"hello WORLD");
		assert_eq!(eng.fstat(fd).unwrap().size, 11);
		eng.close(fd).unwrap();
	}

	#[test]
	fn mount_persistence_across_remount() {
		use crate::store::SledStore;
		let dir = tempfile::tempdir().unwrap();

		{
			let eng = Engine::mount(Box::new(SledStore::open(dir.path()).unwrap()), Config::default()).unwrap();
			let fd = eng.open("/", "/persisted", OpenFlags::write_only().create(), 0o644).unwrap();
			eng.write(fd, b"persisted").unwrap();
			eng.close(fd).unwrap();
			eng.unmount().unwrap();
		}

		let eng2 = Engine::mount(Box::new(SledStore::open(dir.path()).unwrap()), Config::default()).unwrap();
		let fd2 = eng2.open("/", "/persisted", OpenFlags::read_only(), 0).unwrap();
		let mut buf = [0u8; 9];
		eng2.read(fd2, &mut buf).unwrap();
		assert_eq!(&buf, b"persisted");
	}

	#[test]
	fn lists_a_thousand_entry_directory() {
		let eng = engine();
		eng.mkdir("/", "/big", 0o755).unwrap();
		for i in 0..1000 {
			let fd = eng
				.open("/", &format!("/big/f{i}"), OpenFlags::write_only().create(), 0o644)
				.unwrap();
			eng.close(fd).unwrap();
		}

		let mut stream = eng.opendir("/", "/big").unwrap();
		let mut names = std::collections::HashSet::new();
		while let Some(entry) = eng.readdir(&mut stream) {
			names.insert(entry.name);
		}
		eng.closedir(stream);

		assert_eq!(names.len(), 1002); // 1000 files plus "." and ".."
		for i in 0..1000 {
			assert!(names.contains(&format!("f{i}")));
		}
	}
}
