//! End-to-end exercises against a real `sled` database on disk, covering the
//! boundary and negative scenarios from the design's testable-properties
//! section. Unit tests colocated with the source cover the internals
//! (codec round-trips, allocator LIFO reuse, cache eviction); this crate
//! only drives the public `FileSystem` surface the way an application would.

use kvfs::{Config, FileSystem, Kind, OpenFlags, Whence};

fn mount() -> (tempfile::TempDir, FileSystem) {
	let _ = env_logger::try_init();
	let dir = tempfile::tempdir().unwrap();
	let fs = FileSystem::open(Config::new(dir.path())).unwrap();
	(dir, fs)
}

#[test]
fn inline_tail_boundary_at_4096() {
	let (_dir, fs) = mount();
	let fd = fs.open("/", "/f", OpenFlags::read_write().create(), 0o644).unwrap();

	fs.write(fd, &vec![b'a'; 4095]).unwrap();
	fs.close(fd).unwrap();

	let fd = fs.open("/", "/f", OpenFlags::read_write(), 0).unwrap();
	fs.lseek(fd, 0, Whence::End).unwrap();
	fs.write(fd, b"b").unwrap();
	let st = fs.fstat(fd).unwrap();
	assert_eq!(st.size, 4096);
	assert_eq!(st.blocks, 0);

	fs.write(fd, b"c").unwrap();
	let st = fs.fstat(fd).unwrap();
	assert_eq!(st.blocks, 1);
	fs.close(fd).unwrap();
}

#[test]
fn spill_across_many_blocks_round_trips_byte_exact() {
	let (_dir, fs) = mount();
	let fd = fs.open("/", "/g", OpenFlags::read_write().create(), 0o644).unwrap();

	let payload: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
	fs.write(fd, &payload).unwrap();
	let st = fs.fstat(fd).unwrap();
	assert_eq!(st.size, 20000);
	assert_eq!(st.blocks, 4);

	fs.lseek(fd, 0, Whence::Start).unwrap();
	let mut buf = vec![0u8; 20000];
	let n = fs.read(fd, &mut buf).unwrap();
	assert_eq!(n, 20000);
	assert_eq!(buf, payload);
	fs.close(fd).unwrap();
}

#[test]
fn freed_blocks_are_reused_in_lifo_order() {
	let (_dir, fs) = mount();

	let fd = fs.open("/", "/h", OpenFlags::read_write().create(), 0o644).unwrap();
	fs.write(fd, &vec![b'h'; 5 * 4096 + 1]).unwrap();
	assert_eq!(fs.fstat(fd).unwrap().blocks, 5);
	fs.close(fd).unwrap();
	fs.unlink("/", "/h").unwrap();

	let fd = fs.open("/", "/i", OpenFlags::read_write().create(), 0o644).unwrap();
	fs.write(fd, &vec![b'i'; 5 * 4096 + 1]).unwrap();
	assert_eq!(fs.fstat(fd).unwrap().blocks, 5);
	fs.close(fd).unwrap();
}

#[test]
fn directory_listing_of_a_thousand_entries_has_no_duplicates_or_omissions() {
	let (_dir, fs) = mount();

	for i in 0..1000 {
		fs.mkdir("/", &format!("/dir{i}"), 0o755).unwrap();
	}

	let mut stream = fs.opendir("/", "/").unwrap();
	let mut names = std::collections::HashSet::new();
	while let Some(entry) = fs.readdir(&mut stream) {
		names.insert(entry.name);
	}

	assert!(names.contains("."));
	assert!(names.contains(".."));
	for i in 0..1000 {
		assert!(names.contains(&format!("dir{i}")), "missing dir{i}");
	}
	assert_eq!(names.len(), 1002);
}

#[test]
fn mount_persistence_across_remount_preserves_tree_and_contents() {
	let dir = tempfile::tempdir().unwrap();

	{
		let fs = FileSystem::open(Config::new(dir.path())).unwrap();
		fs.mkdir("/", "/keep", 0o755).unwrap();
		let fd = fs.open("/", "/keep/note", OpenFlags::read_write().create(), 0o644).unwrap();
		fs.write(fd, b"persisted").unwrap();
		fs.close(fd).unwrap();
		fs.unmount().unwrap();
	}

	let fs = FileSystem::open(Config::new(dir.path())).unwrap();
	assert!(fs.stat("/", "/keep").unwrap().is_dir());
	let fd = fs.open("/", "/keep/note", OpenFlags::read_only(), 0).unwrap();
	let mut buf = [0u8; 9];
	fs.read(fd, &mut buf).unwrap();
	assert_eq!(&buf, b"persisted");
	fs.close(fd).unwrap();
}

#[test]
fn rename_makes_old_name_disappear_and_new_name_appear_atomically() {
	let (_dir, fs) = mount();
	let fd = fs.open("/", "/a", OpenFlags::read_write().create(), 0o644).unwrap();
	fs.write(fd, b"payload").unwrap();
	fs.close(fd).unwrap();

	fs.rename("/", "/a", "/b").unwrap();

	assert_eq!(fs.stat("/", "/a").unwrap_err().kind(), Kind::NotFound);
	assert!(fs.stat("/", "/b").unwrap().is_regular());

	fs.rename("/", "/b", "/a").unwrap();
	assert!(fs.stat("/", "/a").unwrap().is_regular());
	assert_eq!(fs.stat("/", "/b").unwrap_err().kind(), Kind::NotFound);
}

#[test]
fn open_missing_parent_directory_is_not_found() {
	let (_dir, fs) = mount();
	let err = fs.open("/", "/x/y", OpenFlags::read_only(), 0).unwrap_err();
	assert_eq!(err.kind(), Kind::NotFound);
}

#[test]
fn create_exclusive_on_existing_name_is_already_exists() {
	let (_dir, fs) = mount();
	let fd = fs.open("/", "/dup", OpenFlags::write_only().create(), 0o644).unwrap();
	fs.close(fd).unwrap();

	let err = fs
		.open("/", "/dup", OpenFlags::write_only().create().exclusive(), 0o644)
		.unwrap_err();
	assert_eq!(err.kind(), Kind::AlreadyExists);
}

#[test]
fn rmdir_on_a_nonempty_directory_is_not_empty() {
	let (_dir, fs) = mount();
	fs.mkdir("/", "/d", 0o755).unwrap();
	fs.mkdir("/", "/d/child", 0o755).unwrap();

	let err = fs.rmdir("/", "/d").unwrap_err();
	assert_eq!(err.kind(), Kind::NotEmpty);
}

#[test]
fn opening_past_the_open_file_table_capacity_is_no_space() {
	let mut cfg = Config::new(tempfile::tempdir().unwrap().into_path());
	cfg.max_open_files = 4;
	let _ = env_logger::try_init();
	let fs = FileSystem::open(cfg).unwrap();

	let mut fds = Vec::new();
	for i in 0..4 {
		fds.push(fs.open("/", &format!("/f{i}"), OpenFlags::write_only().create(), 0o644).unwrap());
	}
	let err = fs.open("/", "/one-too-many", OpenFlags::write_only().create(), 0o644).unwrap_err();
	assert_eq!(err.kind(), Kind::NoSpace);

	for fd in fds {
		fs.close(fd).unwrap();
	}
}

#[test]
fn a_name_longer_than_name_max_is_rejected() {
	let (_dir, fs) = mount();
	let long_name = format!("/{}", "x".repeat(256));
	let err = fs.open("/", &long_name, OpenFlags::write_only().create(), 0o644).unwrap_err();
	assert_eq!(err.kind(), Kind::NameTooLong);
}

#[test]
fn unlink_then_rmdir_round_trip_restores_parent_state() {
	let (_dir, fs) = mount();
	let before = fs.stat("/", "/").unwrap();

	fs.mkdir("/", "/d", 0o755).unwrap();
	fs.rmdir("/", "/d").unwrap();

	let after = fs.stat("/", "/").unwrap();
	assert_eq!(before.size, after.size);
	assert_eq!(fs.stat("/", "/d").unwrap_err().kind(), Kind::NotFound);
}
