//! Fixed-layout encode/decode for every record the engine stores.
//!
//! Records never stay in one process's memory the way the teacher's on-disk
//! structures do between a single tool invocation's read and write — they
//! round-trip through a key-value store that may run on a different machine
//! architecture than wrote them. So unlike `mkfs`'s `Superblock`, which is
//! reinterpreted directly as a byte slice, every record here is encoded
//! field-by-field with explicit little-endian byte order and decoded with an
//! explicit length check, returning [`Kind::Corrupt`](crate::error::Kind::Corrupt)
//! on mismatch rather than trusting the byte count.

use crate::config::Config;
use crate::error::{Error, Kind, Result};

/// File type bits recognized in [`Stat::mode`], matching the POSIX `S_IFMT`
/// family.
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

/// Computes the 32-bit FNV-1a hash of a path component.
///
/// FNV-1a is used (rather than, say, a cryptographic hash) because the hash
/// only needs to distribute directory entries across the key space; it is
/// table-free and single-pass, so it costs nothing to recompute on every
/// lookup.
pub fn hash_name(name: &str) -> u32 {
	const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
	const FNV_PRIME: u32 = 0x0100_0193;
	let mut hash = FNV_OFFSET_BASIS;
	for byte in name.as_bytes() {
		hash ^= *byte as u32;
		hash = hash.wrapping_mul(FNV_PRIME);
	}
	hash
}

fn check_len(bytes: &[u8], expected: usize, what: &'static str) -> Result<()> {
	if bytes.len() != expected {
		return Err(Error::with_detail(
			Kind::Corrupt,
			format!(
				"{what}: expected {expected} bytes, got {}",
				bytes.len()
			),
		));
	}
	Ok(())
}

/// The process-wide allocator and mount-lifecycle counters.
///
/// Grounded on `kvfsSuperBlock` (original_source `fs/kvfs/super.h`): the same
/// counters, renamed to their Rust-side meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Superblock {
	pub next_free_inode: u64,
	pub total_inode_count: u64,
	pub next_free_block_number: u64,
	pub total_block_count: u64,
	pub freed_blocks_count: u64,
	pub freed_inodes_count: u64,
	pub mount_count: u64,
	pub creation_time: u64,
	pub last_mount_time: u64,
}

impl Superblock {
	pub const ENCODED_LEN: usize = 9 * 8;
	/// The fixed store key the superblock lives under.
	pub const KEY: &'static [u8] = b"superblock";

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
		buf.extend_from_slice(&self.next_free_inode.to_le_bytes());
		buf.extend_from_slice(&self.total_inode_count.to_le_bytes());
		buf.extend_from_slice(&self.next_free_block_number.to_le_bytes());
		buf.extend_from_slice(&self.total_block_count.to_le_bytes());
		buf.extend_from_slice(&self.freed_blocks_count.to_le_bytes());
		buf.extend_from_slice(&self.freed_inodes_count.to_le_bytes());
		buf.extend_from_slice(&self.mount_count.to_le_bytes());
		buf.extend_from_slice(&self.creation_time.to_le_bytes());
		buf.extend_from_slice(&self.last_mount_time.to_le_bytes());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		check_len(bytes, Self::ENCODED_LEN, "superblock")?;
		let mut fields = bytes.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap()));
		Ok(Self {
			next_free_inode: fields.next().unwrap(),
			total_inode_count: fields.next().unwrap(),
			next_free_block_number: fields.next().unwrap(),
			total_block_count: fields.next().unwrap(),
			freed_blocks_count: fields.next().unwrap(),
			freed_inodes_count: fields.next().unwrap(),
			mount_count: fields.next().unwrap(),
			creation_time: fields.next().unwrap(),
			last_mount_time: fields.next().unwrap(),
		})
	}
}

/// Identifies a directory entry: `(parent_inode, hash(name))`.
///
/// Grounded on `kvfsInodeKey` (original_source
/// `fs/kvfs_store/kvfs_store_entry.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeKey {
	pub parent_inode: u64,
	pub hash: u32,
}

impl InodeKey {
	/// Encoded length: 12 bytes, byte-distinct from [`BlockKey::ENCODED_LEN`]
	/// (invariant 6 of the data model: key formats must be distinguishable by
	/// length alone).
	pub const ENCODED_LEN: usize = 8 + 4;

	pub fn root() -> Self {
		Self {
			parent_inode: 0,
			hash: hash_name("/"),
		}
	}

	pub fn new(parent_inode: u64, name: &str) -> Self {
		Self {
			parent_inode,
			hash: hash_name(name),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
		buf.extend_from_slice(&self.parent_inode.to_le_bytes());
		buf.extend_from_slice(&self.hash.to_le_bytes());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		check_len(bytes, Self::ENCODED_LEN, "inode key")?;
		Ok(Self {
			parent_inode: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
			hash: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
		})
	}
}

/// Identifies a data block: `(owner_inode, block_number)`, tagged so its
/// encoding never collides in length with [`InodeKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockKey {
	pub owner_inode: u64,
	pub block_number: u64,
}

impl BlockKey {
	const TAG: &'static [u8; 2] = b"bk";
	pub const ENCODED_LEN: usize = 8 + 8 + 2;

	/// The sentinel "no next block" key: terminates a chain.
	pub const NONE: BlockKey = BlockKey {
		owner_inode: 0,
		block_number: 0,
	};

	pub fn is_none(&self) -> bool {
		self.block_number == 0
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
		buf.extend_from_slice(&self.owner_inode.to_le_bytes());
		buf.extend_from_slice(&self.block_number.to_le_bytes());
		buf.extend_from_slice(Self::TAG);
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		check_len(bytes, Self::ENCODED_LEN, "block key")?;
		if &bytes[16..18] != Self::TAG {
			return Err(Error::with_detail(Kind::Corrupt, "block key tag mismatch"));
		}
		Ok(Self {
			owner_inode: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
			block_number: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
		})
	}
}

/// POSIX-shaped file attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
	pub ino: u64,
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub size: u64,
	pub blocks: u64,
	pub nlink: u32,
	pub atime: u64,
	pub mtime: u64,
	pub ctime: u64,
}

impl Stat {
	pub const ENCODED_LEN: usize = 8 + 4 + 4 + 4 + 8 + 8 + 4 + 8 + 8 + 8;

	pub fn is_dir(&self) -> bool {
		self.mode & S_IFMT == S_IFDIR
	}

	pub fn is_symlink(&self) -> bool {
		self.mode & S_IFMT == S_IFLNK
	}

	pub fn is_regular(&self) -> bool {
		self.mode & S_IFMT == S_IFREG
	}

	fn encode_into(&self, buf: &mut Vec<u8>) {
		buf.extend_from_slice(&self.ino.to_le_bytes());
		buf.extend_from_slice(&self.mode.to_le_bytes());
		buf.extend_from_slice(&self.uid.to_le_bytes());
		buf.extend_from_slice(&self.gid.to_le_bytes());
		buf.extend_from_slice(&self.size.to_le_bytes());
		buf.extend_from_slice(&self.blocks.to_le_bytes());
		buf.extend_from_slice(&self.nlink.to_le_bytes());
		buf.extend_from_slice(&self.atime.to_le_bytes());
		buf.extend_from_slice(&self.mtime.to_le_bytes());
		buf.extend_from_slice(&self.ctime.to_le_bytes());
	}

	fn decode_from(bytes: &[u8]) -> Self {
		Self {
			ino: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
			mode: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
			uid: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
			gid: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
			size: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
			blocks: u64::from_le_bytes(bytes[28..36].try_into().unwrap()),
			nlink: u32::from_le_bytes(bytes[36..40].try_into().unwrap()),
			atime: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
			mtime: u64::from_le_bytes(bytes[48..56].try_into().unwrap()),
			ctime: u64::from_le_bytes(bytes[56..64].try_into().unwrap()),
		}
	}
}

/// A directory entry's metadata record: name, stat, parent back-reference,
/// block chain head/tail, and the inline tail bytes.
///
/// Grounded on `kvfsInodeValue` (original_source
/// `fs/kvfs_store/kvfs_store_entry.h`), with `inline_blck`/`last_block_key_`/
/// `parent_key_` fields (used throughout `kvfs.cpp`'s `Write`/`Read` but not
/// present in the retained header) reconstructed from their usage there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeValue {
	pub name: String,
	pub stat: Stat,
	pub parent_key: InodeKey,
	pub head_block: BlockKey,
	pub last_block_key: BlockKey,
	pub inline_tail: Vec<u8>,
	/// Points at the inode actually holding the data, for hardlinks. Equal to
	/// this record's own key for ordinary files.
	pub real_key: InodeKey,
}

impl InodeValue {
	fn encoded_len(cfg: &Config) -> usize {
		1 + cfg.name_max + Stat::ENCODED_LEN + InodeKey::ENCODED_LEN * 2
			+ BlockKey::ENCODED_LEN * 2 + 4 + cfg.block_size
	}

	pub fn encode(&self, cfg: &Config) -> Result<Vec<u8>> {
		if self.name.len() > cfg.name_max {
			return Err(Error::new(Kind::NameTooLong));
		}
		if self.inline_tail.len() > cfg.block_size {
			return Err(Error::with_detail(
				Kind::InvalidArgument,
				"inline tail exceeds block size",
			));
		}
		let mut buf = Vec::with_capacity(Self::encoded_len(cfg));
		buf.push(self.name.len() as u8);
		buf.extend_from_slice(self.name.as_bytes());
		buf.resize(1 + cfg.name_max, 0);

		self.stat.encode_into(&mut buf);
		buf.extend_from_slice(&self.parent_key.encode());
		buf.extend_from_slice(&self.head_block.encode());
		buf.extend_from_slice(&self.last_block_key.encode());
		buf.extend_from_slice(&(self.inline_tail.len() as u32).to_le_bytes());
		let tail_start = buf.len();
		buf.extend_from_slice(&self.inline_tail);
		buf.resize(tail_start + cfg.block_size, 0);
		buf.extend_from_slice(&self.real_key.encode());
		Ok(buf)
	}

	pub fn decode(bytes: &[u8], cfg: &Config) -> Result<Self> {
		check_len(bytes, Self::encoded_len(cfg), "inode value")?;
		let mut off = 0usize;
		let name_len = bytes[off] as usize;
		off += 1;
		if name_len > cfg.name_max {
			return Err(Error::with_detail(Kind::Corrupt, "inode name length overflow"));
		}
		let name = String::from_utf8(bytes[off..off + name_len].to_vec())
			.map_err(|_| Error::with_detail(Kind::Corrupt, "inode name is not valid utf-8"))?;
		off += cfg.name_max;

		let stat = Stat::decode_from(&bytes[off..off + Stat::ENCODED_LEN]);
		off += Stat::ENCODED_LEN;

		let parent_key = InodeKey::decode(&bytes[off..off + InodeKey::ENCODED_LEN])?;
		off += InodeKey::ENCODED_LEN;
		let head_block = BlockKey::decode(&bytes[off..off + BlockKey::ENCODED_LEN])?;
		off += BlockKey::ENCODED_LEN;
		let last_block_key = BlockKey::decode(&bytes[off..off + BlockKey::ENCODED_LEN])?;
		off += BlockKey::ENCODED_LEN;

		let inline_len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
		off += 4;
		if inline_len > cfg.block_size {
			return Err(Error::with_detail(Kind::Corrupt, "inline tail length overflow"));
		}
		let inline_tail = bytes[off..off + inline_len].to_vec();
		off += cfg.block_size;

		let real_key = InodeKey::decode(&bytes[off..off + InodeKey::ENCODED_LEN])?;

		Ok(Self {
			name,
			stat,
			parent_key,
			head_block,
			last_block_key,
			inline_tail,
			real_key,
		})
	}
}

/// A single chained data block: up to `block_size` bytes of payload plus a
/// pointer to the next block in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockValue {
	pub next: BlockKey,
	pub size: u32,
	pub data: Vec<u8>,
}

impl BlockValue {
	fn encoded_len(cfg: &Config) -> usize {
		BlockKey::ENCODED_LEN + 4 + cfg.block_size
	}

	pub fn empty(cfg: &Config) -> Self {
		Self {
			next: BlockKey::NONE,
			size: 0,
			data: vec![0; cfg.block_size],
		}
	}

	pub fn encode(&self, cfg: &Config) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::encoded_len(cfg));
		buf.extend_from_slice(&self.next.encode());
		buf.extend_from_slice(&self.size.to_le_bytes());
		buf.extend_from_slice(&self.data);
		buf.resize(BlockKey::ENCODED_LEN + 4 + cfg.block_size, 0);
		buf
	}

	pub fn decode(bytes: &[u8], cfg: &Config) -> Result<Self> {
		check_len(bytes, Self::encoded_len(cfg), "block value")?;
		let next = BlockKey::decode(&bytes[0..BlockKey::ENCODED_LEN])?;
		let mut off = BlockKey::ENCODED_LEN;
		let size = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
		off += 4;
		if size as usize > cfg.block_size {
			return Err(Error::with_detail(Kind::Corrupt, "block payload length overflow"));
		}
		let data = bytes[off..off + cfg.block_size].to_vec();
		Ok(Self { next, size, data })
	}
}

/// Identifies one page of the block free-list: `("fb", page_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreeListKey {
	pub page_index: u64,
}

impl FreeListKey {
	const TAG: &'static [u8; 2] = b"fb";
	pub const ENCODED_LEN: usize = 2 + 8;

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
		buf.extend_from_slice(Self::TAG);
		buf.extend_from_slice(&self.page_index.to_le_bytes());
		buf
	}
}

/// One page of reclaimed block keys, consumed LIFO by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeListValue {
	pub entries: Vec<BlockKey>,
}

impl FreeListValue {
	fn encoded_len(cfg: &Config) -> usize {
		4 + cfg.free_list_page_size * BlockKey::ENCODED_LEN
	}

	pub fn encode(&self, cfg: &Config) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::encoded_len(cfg));
		buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
		for entry in &self.entries {
			buf.extend_from_slice(&entry.encode());
		}
		buf.resize(Self::encoded_len(cfg), 0);
		buf
	}

	pub fn decode(bytes: &[u8], cfg: &Config) -> Result<Self> {
		check_len(bytes, Self::encoded_len(cfg), "free-list page")?;
		let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
		if count > cfg.free_list_page_size {
			return Err(Error::with_detail(Kind::Corrupt, "free-list page count overflow"));
		}
		let mut entries = Vec::with_capacity(count);
		let mut off = 4;
		for _ in 0..count {
			entries.push(BlockKey::decode(&bytes[off..off + BlockKey::ENCODED_LEN])?);
			off += BlockKey::ENCODED_LEN;
		}
		Ok(Self { entries })
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn hash_is_stable() {
		assert_eq!(hash_name("/"), hash_name("/"));
		assert_ne!(hash_name("a"), hash_name("b"));
	}

	#[test]
	fn inode_key_and_block_key_differ_in_length() {
		assert_ne!(InodeKey::ENCODED_LEN, BlockKey::ENCODED_LEN);
	}

	#[test]
	fn inode_key_round_trips() {
		let key = InodeKey::new(7, "hello.txt");
		let bytes = key.encode();
		assert_eq!(InodeKey::decode(&bytes).unwrap(), key);
	}

	#[test]
	fn block_key_round_trips() {
		let key = BlockKey {
			owner_inode: 3,
			block_number: 9,
		};
		let bytes = key.encode();
		assert_eq!(BlockKey::decode(&bytes).unwrap(), key);
	}

	#[test]
	fn block_key_rejects_bad_tag() {
		let mut bytes = BlockKey { owner_inode: 1, block_number: 1 }.encode();
		bytes[16] = b'x';
		assert!(BlockKey::decode(&bytes).is_err());
	}

	#[test]
	fn superblock_round_trips() {
		let sb = Superblock {
			next_free_inode: 4,
			total_inode_count: 4,
			next_free_block_number: 10,
			total_block_count: 10,
			freed_blocks_count: 2,
			freed_inodes_count: 0,
			mount_count: 3,
			creation_time: 100,
			last_mount_time: 200,
		};
		let bytes = sb.encode();
		assert_eq!(Superblock::decode(&bytes).unwrap(), sb);
	}

	#[test]
	fn superblock_rejects_truncated_bytes() {
		assert!(Superblock::decode(&[0u8; 10]).is_err());
	}

	#[test]
	fn inode_value_round_trips() {
		let cfg = Config::default();
		let value = InodeValue {
			name: "file.txt".to_string(),
			stat: Stat {
				ino: 5,
				mode: S_IFREG | 0o644,
				size: 12,
				..Default::default()
			},
			parent_key: InodeKey::root(),
			head_block: BlockKey::NONE,
			last_block_key: BlockKey::NONE,
			inline_tail: b"hello world!".to_vec(),
			real_key: InodeKey::new(0, "file.txt"),
		};
		let bytes = value.encode(&cfg).unwrap();
		let decoded = InodeValue::decode(&bytes, &cfg).unwrap();
		assert_eq!(decoded, value);
	}

	#[test]
	fn inode_value_rejects_name_too_long() {
		let cfg = Config::default();
		let value = InodeValue {
			name: "a".repeat(cfg.name_max + 1),
			stat: Stat::default(),
			parent_key: InodeKey::root(),
			head_block: BlockKey::NONE,
			last_block_key: BlockKey::NONE,
			inline_tail: Vec::new(),
			real_key: InodeKey::root(),
		};
		assert_eq!(
			value.encode(&cfg).unwrap_err().kind(),
			Kind::NameTooLong
		);
	}

	#[test]
	fn block_value_round_trips() {
		let cfg = Config::default();
		let mut block = BlockValue::empty(&cfg);
		block.data[0..5].copy_from_slice(b"hello");
		block.size = 5;
		block.next = BlockKey {
			owner_inode: 1,
			block_number: 2,
		};
		let bytes = block.encode(&cfg);
		let decoded = BlockValue::decode(&bytes, &cfg).unwrap();
		assert_eq!(decoded, block);
	}

	#[test]
	fn free_list_page_round_trips() {
		let cfg = Config::default();
		let page = FreeListValue {
			entries: vec![
				BlockKey { owner_inode: 1, block_number: 1 },
				BlockKey { owner_inode: 1, block_number: 2 },
			],
		};
		let bytes = page.encode(&cfg);
		let decoded = FreeListValue::decode(&bytes, &cfg).unwrap();
		assert_eq!(decoded, page);
	}

	#[test]
	fn free_list_key_carries_tag_prefix() {
		let key = FreeListKey { page_index: 3 };
		let bytes = key.encode();
		assert_eq!(&bytes[0..2], b"fb");
	}
}
