//! Crash inputs the workers left under `sync/<worker>/crashes/`.

use ahash::RandomState;
use sha1::{Digest, Sha1};
use std::{
    collections::HashSet,
    fs::{create_dir_all, read, read_dir, OpenOptions},
    io::{self, ErrorKind, Write},
    path::Path,
};

pub const CRASH_DIR: &str = "crashes";
/// Written by the engine next to the crash inputs.
pub const CRASH_README: &str = "README.txt";

/// Distinct crashing inputs, identified by content.
pub type CrashSet = HashSet<Vec<u8>, RandomState>;

/// Collect every crash input of every worker below `out_dir`.
pub fn harvest(out_dir: &Path) -> CrashSet {
    let mut crashes = CrashSet::default();
    let workers = match read_dir(out_dir) {
        Ok(workers) => workers,
        Err(e) => {
            log::debug!("failed to scan {}: {}", out_dir.display(), e);
            return crashes;
        }
    };

    for worker in workers.filter_map(|e| e.ok()) {
        let crash_dir = worker.path().join(CRASH_DIR);
        let entries = match read_dir(&crash_dir) {
            Ok(entries) => entries,
            Err(_) => continue, // worker found nothing yet
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name() == CRASH_README {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match read(&path) {
                Ok(content) => {
                    crashes.insert(content);
                }
                Err(e) => log::debug!("skip crash {}: {}", path.display(), e),
            }
        }
    }
    crashes
}

/// Content-derived file name, the hex SHA-1 of the input.
pub fn crash_name(content: &[u8]) -> String {
    hex::encode(Sha1::digest(content))
}

/// Write each crash into `dir` once. Returns how many files were new.
pub fn export(crashes: &CrashSet, dir: &Path) -> io::Result<usize> {
    create_dir_all(dir)?;
    let mut written = 0;
    for content in crashes {
        let path = dir.join(crash_name(content));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                f.write_all(content)?;
                written += 1;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => (),
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;

    fn add_crash(sync: &Path, worker: &str, name: &str, content: &[u8]) {
        let dir = sync.join(worker).join(CRASH_DIR);
        create_dir_all(&dir).unwrap();
        write(dir.join(name), content).unwrap();
    }

    #[test]
    fn identical_inputs_from_two_workers_are_one_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let sync = tmp.path();
        add_crash(sync, "fuzzer-master", "id:000000,sig:11", b"AAAA");
        add_crash(sync, "fuzzer-1", "id:000000,sig:11", b"AAAA");
        add_crash(sync, "fuzzer-1", "id:000001,sig:06", b"BBBB");
        add_crash(sync, "fuzzer-1", CRASH_README, b"Command line used to find this crash");
        // no crashes dir at all
        create_dir_all(sync.join("fuzzer-2")).unwrap();

        let crashes = harvest(sync);
        assert_eq!(crashes.len(), 2);
        assert!(crashes.contains(&b"AAAA".to_vec()));
        assert!(crashes.contains(&b"BBBB".to_vec()));
        assert_eq!(harvest(sync), crashes);
    }

    #[test]
    fn missing_sync_dir_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(harvest(&tmp.path().join("sync")).is_empty());
    }

    #[test]
    fn export_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("crashes");
        let mut crashes = CrashSet::default();
        crashes.insert(b"abc".to_vec());
        crashes.insert(Vec::new());

        assert_eq!(export(&crashes, &out).unwrap(), 2);
        assert_eq!(export(&crashes, &out).unwrap(), 0);

        let name = crash_name(b"abc");
        assert_eq!(name, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(read(out.join(name)).unwrap(), b"abc");
        assert_eq!(read_dir(&out).unwrap().count(), 2);
    }
}
