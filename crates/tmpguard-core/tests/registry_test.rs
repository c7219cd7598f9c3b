//! End-to-end registry behavior through the public API.
//!
//! Tests share the process-wide registry and some run a full cleanup pass,
//! so every test holds `TEST_LOCK`.

use std::path::PathBuf;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use tmpguard_core::{
    Registry, cleanup_temp_dir, cleanup_temporary_file, close_temp, create_temp_dir, open_temp,
    register_temp_file, register_temp_subdir, register_temporary_file, run_cleanup_now,
    unregister_temporary_file,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tmpguard-it-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn directory_tree_is_removed_by_explicit_cleanup() {
    let _g = TEST_LOCK.lock();
    let parent = scratch_dir("tree");
    let dir = create_temp_dir("test", Some(&parent), true).unwrap();
    let root = dir.path().to_path_buf();

    register_temp_file(&dir, "a.tmp").unwrap();
    std::fs::write(root.join("a.tmp"), b"payload").unwrap();
    register_temp_subdir(&dir, "sub").unwrap();
    std::fs::create_dir(root.join("sub")).unwrap();

    cleanup_temp_dir(dir).unwrap();
    assert!(!root.join("a.tmp").exists());
    assert!(!root.join("sub").exists());
    assert!(!root.exists());
    std::fs::remove_dir(&parent).unwrap();
}

#[test]
fn cleanup_pass_skips_unregistered_files() {
    let _g = TEST_LOCK.lock();
    let base = scratch_dir("flat");
    let f1 = base.join("f1");
    let f2 = base.join("f2");
    for f in [&f1, &f2] {
        register_temporary_file(f).unwrap();
        std::fs::write(f, b"x").unwrap();
    }
    assert!(unregister_temporary_file(&f1));

    run_cleanup_now();
    assert!(f1.exists());
    assert!(!f2.exists());

    // F2 is still registered; explicit cleanup tolerates it being gone.
    cleanup_temporary_file(&f2, true).unwrap();
    std::fs::remove_dir_all(&base).unwrap();
}

#[test]
fn closing_one_of_two_descriptors_leaves_one_record() {
    let _g = TEST_LOCK.lock();
    let base = scratch_dir("fds");
    let registry = Registry::global();
    let before = registry.stats();

    let a = open_temp(base.join("a"), libc::O_CREAT | libc::O_RDWR, 0o600, false).unwrap();
    let b = open_temp(base.join("b"), libc::O_CREAT | libc::O_RDWR, 0o600, false).unwrap();
    assert_eq!(registry.stats().descriptors, before.descriptors + 2);

    close_temp(a).unwrap();
    let after = registry.stats();
    assert_eq!(after.descriptors, before.descriptors + 1);
    assert_eq!(after.open_descriptors, before.open_descriptors + 1);
    assert_eq!(after.os_closes, before.os_closes + 1);

    close_temp(b).unwrap();
    std::fs::remove_dir_all(&base).unwrap();
}

#[test]
fn repeated_file_cleanup_is_idempotent() {
    let _g = TEST_LOCK.lock();
    let base = scratch_dir("idem");
    let f = base.join("twice");
    register_temporary_file(&f).unwrap();
    std::fs::write(&f, b"x").unwrap();
    cleanup_temporary_file(&f, true).unwrap();
    cleanup_temporary_file(&f, true).unwrap();
    assert!(!f.exists());
    std::fs::remove_dir_all(&base).unwrap();
}

#[test]
fn close_racing_cleanup_closes_each_descriptor_once() {
    let _g = TEST_LOCK.lock();
    let base = scratch_dir("race");
    let registry = Registry::global();
    const N: usize = 64;

    for round in 0..8 {
        let fds: Vec<_> = (0..N)
            .map(|i| {
                open_temp(
                    base.join(format!("{round}-{i}")),
                    libc::O_CREAT | libc::O_RDWR,
                    0o600,
                    false,
                )
                .unwrap()
            })
            .collect();
        let before = registry.stats().os_closes;
        let barrier = Arc::new(Barrier::new(2));

        let closer = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for fd in fds {
                    close_temp(fd).unwrap();
                }
            })
        };
        barrier.wait();
        run_cleanup_now();
        closer.join().unwrap();

        assert_eq!(registry.stats().os_closes - before, N as u64);
    }
    std::fs::remove_dir_all(&base).unwrap();
}

#[test]
fn slot_reuse_never_shares_an_index() {
    let _g = TEST_LOCK.lock();
    let parent = scratch_dir("slots");
    let mut live = Vec::new();
    for _ in 0..6 {
        live.push(create_temp_dir("s", Some(&parent), false).unwrap());
    }
    // Free every other directory, then allocate into the holes.
    let mut kept = Vec::new();
    for (i, dir) in live.into_iter().enumerate() {
        if i % 2 == 0 {
            cleanup_temp_dir(dir).unwrap();
        } else {
            kept.push(dir);
        }
    }
    for _ in 0..5 {
        kept.push(create_temp_dir("s", Some(&parent), false).unwrap());
    }
    let mut slots: Vec<usize> = kept.iter().map(|d| d.slot()).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), kept.len());

    for dir in kept {
        cleanup_temp_dir(dir).unwrap();
    }
    std::fs::remove_dir(&parent).unwrap();
}
