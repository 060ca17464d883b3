//! Inode and block number allocation, backed by the superblock counters and
//! a persistent, paged, LIFO free-list.
//!
//! Grounded on `examples/original_source/fs/kvfs/kvfs.cpp`'s `FreeInode`,
//! `FreeUpBlock`, and `GetFreeBlock` functions.

use crate::codec::{BlockKey, FreeListKey, FreeListValue, Superblock};
use crate::config::Config;
use crate::error::Result;
use crate::store::KvStore;

/// Mints and reclaims inode numbers and block numbers against a superblock.
///
/// Every method takes `&mut Superblock` and persists it itself, so a crash
/// between the counter update and the store write never leaves the two out
/// of sync for longer than one KV write.
pub struct Allocator<'a> {
	store: &'a dyn KvStore,
	cfg: &'a Config,
}

impl<'a> Allocator<'a> {
	pub fn new(store: &'a dyn KvStore, cfg: &'a Config) -> Self {
		Self { store, cfg }
	}

	fn save(&self, sb: &Superblock) -> Result<()> {
		self.store.put(Superblock::KEY, &sb.encode())
	}

	/// Mints a new inode number. The reference `FreeInode` never reuses
	/// released inode numbers, only bumping the counter; this implementation
	/// keeps that behavior since no inode free-list is exercised anywhere in
	/// the reference's `Write`/`Open` paths.
	pub fn new_inode(&self, sb: &mut Superblock) -> Result<u64> {
		let inode = sb.next_free_inode;
		sb.next_free_inode += 1;
		sb.total_inode_count += 1;
		self.save(sb)?;
		Ok(inode)
	}

	pub fn free_inode(&self, sb: &mut Superblock) -> Result<()> {
		sb.total_inode_count = sb.total_inode_count.saturating_sub(1);
		sb.freed_inodes_count += 1;
		self.save(sb)
	}

	/// Acquires a block key for `owner_inode`, preferring the most recently
	/// freed block over extending the counter.
	pub fn acquire_block(&self, sb: &mut Superblock, owner_inode: u64) -> Result<BlockKey> {
		if sb.freed_blocks_count == 0 {
			let key = BlockKey {
				owner_inode,
				block_number: sb.next_free_block_number,
			};
			sb.next_free_block_number += 1;
			sb.total_block_count += 1;
			self.save(sb)?;
			return Ok(key);
		}

		let page_size = self.cfg.free_list_page_size as u64;
		let page_index = (sb.freed_blocks_count - 1) / page_size;
		let page_key = FreeListKey { page_index }.encode();
		let bytes = self
			.store
			.get(&page_key)?
			.ok_or_else(|| crate::error::Error::with_detail(
				crate::error::Kind::Corrupt,
				"missing free-list page referenced by superblock",
			))?;
		let mut page = FreeListValue::decode(&bytes, self.cfg)?;
		let mut reused = page
			.entries
			.pop()
			.ok_or_else(|| crate::error::Error::with_detail(
				crate::error::Kind::Corrupt,
				"free-list page unexpectedly empty",
			))?;
		reused.owner_inode = owner_inode;

		if page.entries.is_empty() {
			self.store.delete(&page_key)?;
		} else {
			self.store.put(&page_key, &page.encode(self.cfg))?;
		}
		sb.freed_blocks_count -= 1;
		self.save(sb)?;
		Ok(reused)
	}

	/// Releases `key` back to the free-list, appending to the last
	/// partially-filled page and rolling over to a new page at capacity.
	pub fn release_block(&self, sb: &mut Superblock, key: BlockKey) -> Result<()> {
		let page_size = self.cfg.free_list_page_size as u64;
		let page_index = sb.freed_blocks_count / page_size;
		let page_key = FreeListKey { page_index }.encode();

		let mut page = match self.store.get(&page_key)? {
			Some(bytes) => FreeListValue::decode(&bytes, self.cfg)?,
			None => FreeListValue { entries: Vec::new() },
		};
		page.entries.push(key);
		self.store.put(&page_key, &page.encode(self.cfg))?;

		sb.freed_blocks_count += 1;
		self.save(sb)
	}
}
