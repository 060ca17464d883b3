//! Lexical path normalization and symlink-aware resolution.
//!
//! Grounded on `examples/original_source/fs/kvfs/kvfs.cpp`'s `ResolvePath`
//! and `GetSymLinkRealPath` functions. `ResolvePath` there inlines the work
//! `Lookup`/`ParentLookup` nominally exist to do (`ParentLookup`'s body is
//! entirely commented out in the source), so this module does the same:
//! there is no separate lookup helper, just the one resolver.

use crate::cache::{AccessMode, InodeCache};
use crate::codec::{InodeKey, InodeValue};
use crate::config::Config;
use crate::error::{Error, Kind, Result};
use crate::store::KvStore;

/// The result of resolving a path: the looked-up leaf (if it exists) and the
/// key of its parent directory.
pub struct Resolved {
	pub parent: InodeKey,
	pub leaf: InodeKey,
	pub leaf_name: String,
	/// Present if the leaf component actually exists in the store.
	pub leaf_value: Option<InodeValue>,
}

/// Splits `path` into lexically normalized components, dropping `.` entries
/// and resolving `..` against the accumulated output. Does not touch the
/// store: purely textual.
fn normalize_components(path: &str) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();
	for component in path.split('/') {
		match component {
			"" | "." => continue,
			".." => {
				out.pop();
			}
			other => out.push(other.to_string()),
		}
	}
	out
}

/// Resolves `path` (absolute, or relative to `cwd`) to a parent/leaf key
/// pair, following symlinks along the way.
///
/// The leaf component is permitted to not exist (callers implementing
/// `O_CREAT` rely on this); every component *before* the leaf must exist and
/// must not itself be unresolvable.
pub fn resolve(
	store: &dyn KvStore,
	cfg: &Config,
	cache: &mut InodeCache,
	cwd: &str,
	path: &str,
) -> Result<Resolved> {
	let full = if path.starts_with('/') {
		path.to_string()
	} else {
		format!("{cwd}/{path}")
	};
	resolve_components(store, cfg, cache, normalize_components(&full), 0)
}

/// Walks `components` from the root, substituting in a symlink's target and
/// recursing whenever one is encountered. `depth` carries the accumulated
/// link-follow count across that recursion, so a chain of symlinks remains
/// bounded by `link_max` overall rather than resetting per substitution.
fn resolve_components(
	store: &dyn KvStore,
	cfg: &Config,
	cache: &mut InodeCache,
	components: Vec<String>,
	depth: usize,
) -> Result<Resolved> {
	if components.is_empty() {
		let root = InodeKey::root();
		let value = cache.get(store, cfg, root, AccessMode::Read)?;
		return Ok(Resolved {
			parent: root,
			leaf: root,
			leaf_name: "/".to_string(),
			leaf_value: value,
		});
	}

	let mut current_inode: u64 = 0;
	let mut depth = depth;

	for (idx, name) in components.iter().enumerate() {
		if name.len() > cfg.name_max {
			return Err(Error::new(Kind::NameTooLong));
		}
		let key = InodeKey::new(current_inode, name);
		let is_last = idx == components.len() - 1;

		let Some(value) = cache.get(store, cfg, key, AccessMode::Read)? else {
			if is_last {
				return Ok(Resolved {
					parent: InodeKey { parent_inode: current_inode, hash: key.hash },
					leaf: key,
					leaf_name: name.clone(),
					leaf_value: None,
				});
			}
			return Err(Error::new(Kind::NotFound));
		};

		if value.stat.is_symlink() {
			depth += 1;
			if depth > cfg.link_max {
				return Err(Error::new(Kind::TooManyLinks));
			}
			let target = String::from_utf8(value.inline_tail.clone())
				.map_err(|_| Error::with_detail(Kind::Corrupt, "symlink target is not utf-8"))?;
			let target_path = if target.starts_with('/') {
				target
			} else {
				format!("{}/{target}", parent_path_of(store, cfg, cache, key)?)
			};
			let mut rest = components[idx + 1..].to_vec();
			let mut new_components = normalize_components(&target_path);
			new_components.append(&mut rest);
			return resolve_components(store, cfg, cache, new_components, depth);
		}

		if is_last {
			return Ok(Resolved {
				parent: InodeKey { parent_inode: current_inode, hash: key.hash },
				leaf: key,
				leaf_name: name.clone(),
				leaf_value: Some(value),
			});
		}

		if !value.stat.is_dir() {
			return Err(Error::new(Kind::NotADirectory));
		}
		current_inode = value.stat.ino;
	}

	unreachable!("loop always returns before exhausting components")
}

/// Reconstructs the absolute path of `key`'s *parent* by walking the
/// `parent_key` back-reference chain to the root.
///
/// Grounded on `GetSymLinkRealPath`, which walks `parent_key_` from a
/// symlink's location back toward the root, pushing each directory entry's
/// name onto the front of the accumulated path.
fn parent_path_of(
	store: &dyn KvStore,
	cfg: &Config,
	cache: &mut InodeCache,
	key: InodeKey,
) -> Result<String> {
	let mut names: Vec<String> = Vec::new();
	let mut current = key;
	loop {
		let Some(value) = cache.get(store, cfg, current, AccessMode::Read)? else {
			break;
		};
		if current.parent_inode == 0 && value.parent_key == current {
			break;
		}
		let parent = value.parent_key;
		let Some(parent_value) = cache.get(store, cfg, parent, AccessMode::Read)? else {
			break;
		};
		names.push(parent_value.name.clone());
		if parent == InodeKey::root() {
			break;
		}
		current = parent;
	}
	names.reverse();
	Ok(format!("/{}", names.join("/")))
}
