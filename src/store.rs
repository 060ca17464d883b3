//! The key-value storage contract the engine is built against.
//!
//! Grounded on `utils/src/disk.rs`'s pattern of wrapping one external
//! resource (there, a raw block device) behind a narrow purpose-built
//! interface: the rest of the crate never touches `sled` directly, only
//! [`KvStore`], so a different ordered store (the original's own RocksDB and
//! LevelDB backends among them) could stand in without touching anything
//! above this module.

use crate::error::Result;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

/// An accumulating set of writes applied atomically by [`KvStore::apply_batch`].
#[derive(Debug, Default)]
pub struct Batch {
	puts: Vec<(Vec<u8>, Vec<u8>)>,
	deletes: Vec<Vec<u8>>,
}

impl Batch {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
		self.puts.push((key.into(), value.into()));
	}

	pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
		self.deletes.push(key.into());
	}
}

/// The ordered key-value contract the filesystem engine is built on.
///
/// Any implementation must provide: point `get`/`put`/`delete`, a half-open
/// range delete, replace-or-insert `merge`, forward ordered iteration from a
/// prefix, durability via `sync`, advisory `compact`, a full `destroy` (test
/// use), and an atomically-applied `Batch`.
pub trait KvStore: Send {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
	fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
	fn delete(&self, key: &[u8]) -> Result<()>;
	fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()>;
	/// Replace the value at `key` if present, otherwise insert it.
	fn merge(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.put(key, value)
	}
	fn contains_key(&self, key: &[u8]) -> Result<bool> {
		Ok(self.get(key)?.is_some())
	}
	/// Forward ordered iteration over every key with the given prefix.
	fn iter_from(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
	fn sync(&self) -> Result<()>;
	fn compact(&self) -> Result<()> {
		self.sync()
	}
	fn destroy(&self) -> Result<()>;
	fn apply_batch(&self, batch: Batch) -> Result<()>;
}

/// A [`KvStore`] backed by a `sled` database.
pub struct SledStore {
	db: sled::Db,
}

impl SledStore {
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		let db = sled::open(path)?;
		Ok(Self { db })
	}
}

impl KvStore for SledStore {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.db.get(key)?.map(|v| v.to_vec()))
	}

	fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.db.insert(key, value)?;
		Ok(())
	}

	fn delete(&self, key: &[u8]) -> Result<()> {
		self.db.remove(key)?;
		Ok(())
	}

	fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
		let keys: Vec<_> = self
			.db
			.range::<&[u8], _>((Bound::Included(start), Bound::Excluded(end)))
			.keys()
			.collect::<std::result::Result<_, _>>()?;
		for key in keys {
			self.db.remove(key)?;
		}
		Ok(())
	}

	fn iter_from(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let mut out = Vec::new();
		for entry in self.db.scan_prefix(prefix) {
			let (k, v) = entry?;
			out.push((k.to_vec(), v.to_vec()));
		}
		Ok(out)
	}

	fn sync(&self) -> Result<()> {
		self.db.flush()?;
		Ok(())
	}

	fn destroy(&self) -> Result<()> {
		for key in self.db.iter().keys() {
			self.db.remove(key?)?;
		}
		Ok(())
	}

	fn apply_batch(&self, batch: Batch) -> Result<()> {
		let mut sled_batch = sled::Batch::default();
		for (k, v) in batch.puts {
			sled_batch.insert(k, v);
		}
		for k in batch.deletes {
			sled_batch.remove(k);
		}
		self.db.apply_batch(sled_batch)?;
		Ok(())
	}
}

/// An in-memory [`KvStore`] for fast unit tests that do not need durability.
#[derive(Default)]
pub struct MemStore {
	inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl KvStore for MemStore {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.inner.lock().unwrap().get(key).cloned())
	}

	fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.inner.lock().unwrap().insert(key.to_vec(), value.to_vec());
		Ok(())
	}

	fn delete(&self, key: &[u8]) -> Result<()> {
		self.inner.lock().unwrap().remove(key);
		Ok(())
	}

	fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
		let mut map = self.inner.lock().unwrap();
		let keys: Vec<_> = map
			.range(start.to_vec()..end.to_vec())
			.map(|(k, _)| k.clone())
			.collect();
		for key in keys {
			map.remove(&key);
		}
		Ok(())
	}

	fn iter_from(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let map = self.inner.lock().unwrap();
		Ok(map
			.range(prefix.to_vec()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect())
	}

	fn sync(&self) -> Result<()> {
		Ok(())
	}

	fn destroy(&self) -> Result<()> {
		self.inner.lock().unwrap().clear();
		Ok(())
	}

	fn apply_batch(&self, batch: Batch) -> Result<()> {
		let mut map = self.inner.lock().unwrap();
		for (k, v) in batch.puts {
			map.insert(k, v);
		}
		for k in batch.deletes {
			map.remove(&k);
		}
		Ok(())
	}
}
