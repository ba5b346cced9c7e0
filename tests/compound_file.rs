//! # On-Disk Lifecycle Tests
//!
//! Exercises the full stack against a real host file: create, populate,
//! commit, reopen, update through the dirty page protocol, and verify that
//! eviction pressure never changes what a reader observes.

use std::sync::Arc;

use packfs::storage::{FileIo, MmapFile, PageCache, PageIndex, PAGE_SIZE};
use tempfile::tempdir;

fn file_byte(file: &dyn FileIo, id: PageIndex) -> u8 {
    let mut b = [0u8; 1];
    file.read_page(id, 0, &mut b).unwrap();
    b[0]
}

mod fresh_file_tests {
    use super::*;

    #[test]
    fn ten_new_pages_reach_the_host_file_on_trim() {
        let dir = tempdir().unwrap();
        let file = Arc::new(MmapFile::create(dir.path().join("pack.bin")).unwrap());
        let cache = PageCache::new(file);

        for i in 0..10u8 {
            let mut page = cache.new_page().unwrap();
            assert_eq!(page.id(), i as PageIndex);
            page.write(0, &[i + 1]);
        }
        cache.trim(0).unwrap();

        let file = cache.file();
        for i in 0..10u8 {
            assert_eq!(file_byte(&**file, i as PageIndex), i + 1);
        }
    }

    #[test]
    fn committed_pages_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.bin");

        {
            let file = Arc::new(MmapFile::create(&path).unwrap());
            let mut cache = PageCache::new(file);
            for i in 0..10u8 {
                let mut page = cache.new_page().unwrap();
                page.fill(i + 1);
            }
            cache.commit().unwrap();
        }

        let file = Arc::new(MmapFile::open(&path).unwrap());
        let cache = PageCache::open(file).unwrap();
        assert_eq!(cache.page_count(), 10);
        for i in 0..10u32 {
            let page = cache.load_page(i).unwrap();
            assert_eq!(page.read_byte(0), i as u8 + 1);
            assert_eq!(page.read_byte(PAGE_SIZE - 1), i as u8 + 1);
        }
    }
}

mod dirty_protocol_tests {
    use super::*;

    fn populated(path: &std::path::Path) -> PageCache {
        let file = Arc::new(MmapFile::create(path).unwrap());
        let mut cache = PageCache::new(file);
        for i in 0..10u8 {
            let mut page = cache.new_page().unwrap();
            page.write(0, &[i + 1]);
        }
        cache.commit().unwrap();
        cache
    }

    #[test]
    fn evicted_dirty_pages_divert_above_the_committed_area() {
        let dir = tempdir().unwrap();
        let mut cache = populated(&dir.path().join("pack.bin"));

        for i in 0..10u32 {
            let mut page = cache.make_page_writable(cache.load_page(i).unwrap());
            page.write(0, &[i as u8 + 10]);
        }
        cache.trim(0).unwrap();

        assert!(cache.page_count() >= 20);
        // committed originals are untouched until commit
        for i in 0..10u8 {
            assert_eq!(file_byte(&**cache.file(), i as PageIndex), i + 1);
        }
        // while readers already observe the transaction's contents
        for i in 0..10u32 {
            assert_eq!(cache.load_page(i).unwrap().read_byte(0), i as u8 + 10);
        }

        let handler = cache.build_commit_handler();
        let diverted = handler.diverted_page_ids();
        assert_eq!(diverted.len(), 10);
        assert!(diverted.iter().all(|&id| id >= 10));
        handler.commit().unwrap();
    }

    #[test]
    fn second_dirty_round_writes_into_existing_diversions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.bin");
        let cache = {
            let seeded = populated(&path);
            PageCache::new(seeded.into_file())
        };

        for round in [10u8, 20u8] {
            for i in 0..10u32 {
                let mut page = cache.make_page_writable(cache.load_page(i).unwrap());
                page.write(0, &[i as u8 + round]);
            }
            cache.trim(0).unwrap();
        }

        assert_eq!(cache.page_count(), 20, "round two reused the diversions");
        for i in 0..10u32 {
            assert_eq!(cache.load_page(i).unwrap().read_byte(0), i as u8 + 20);
        }
    }

    #[test]
    fn committed_updates_survive_reopen_without_log_residue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.bin");

        {
            let mut cache = populated(&path);
            for i in 0..10u32 {
                let mut page = cache.make_page_writable(cache.load_page(i).unwrap());
                page.write(0, &[i as u8 + 10]);
            }
            cache.commit().unwrap();
            assert!(cache.read_logs().unwrap().is_empty());
        }

        let file = Arc::new(MmapFile::open(&path).unwrap());
        let cache = PageCache::open(file).unwrap();
        assert_eq!(cache.page_count(), 10);
        for i in 0..10u32 {
            assert_eq!(cache.load_page(i).unwrap().read_byte(0), i as u8 + 10);
        }
    }

    #[test]
    fn trim_pressure_does_not_change_committed_results() {
        let dir = tempdir().unwrap();
        let mut images = Vec::new();

        for trims in [0usize, 2] {
            let path = dir.path().join(format!("pack{}.bin", trims));
            let mut cache = populated(&path);

            for i in 0..10u32 {
                let mut page = cache.make_page_writable(cache.load_page(i).unwrap());
                page.write(3, &[i as u8 ^ 0x5f]);
                for _ in 0..trims {
                    cache.trim(0).unwrap();
                }
            }
            cache.commit().unwrap();

            let file = cache.file();
            let mut image = Vec::new();
            for i in 0..10u32 {
                let mut page = [0u8; PAGE_SIZE];
                file.read_page(i, 0, &mut page).unwrap();
                image.extend_from_slice(&page);
            }
            images.push(image);
        }

        assert_eq!(images[0], images[1]);
    }
}

mod reader_writer_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn commit_access_waits_for_readers_of_the_file() {
        let dir = tempdir().unwrap();
        let file = Arc::new(MmapFile::create(dir.path().join("pack.bin")).unwrap());
        let committed = Arc::new(AtomicBool::new(false));

        let read_token = file.lock_protocol().read_access();

        let t = thread::spawn({
            let file = Arc::clone(&file);
            let committed = Arc::clone(&committed);
            move || {
                let write = file.lock_protocol().write_access();
                let _commit = file.lock_protocol().commit_access(write);
                committed.store(true, Ordering::SeqCst);
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!committed.load(Ordering::SeqCst));

        drop(read_token);
        t.join().unwrap();
        assert!(committed.load(Ordering::SeqCst));
    }
}
