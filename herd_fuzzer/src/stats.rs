//! Per-worker status files written by the engine into `sync/<worker>/`.

use ahash::RandomState;
use serde_derive::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs::{read, read_dir},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const STATS_FILE: &str = "fuzzer_stats";

pub type FieldMap = HashMap<String, String, RandomState>;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path}: {count} malformed line(s)")]
    Malformed { path: PathBuf, count: usize },
}

/// Parsed `key : value` records of one status file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WorkerStats {
    fields: FieldMap,
}

impl WorkerStats {
    /// Parse complete lines only, a trailing line without newline may still be
    /// under construction. Returns the fields and the count of lines without `:`.
    pub fn parse(content: &str) -> (Self, usize) {
        let mut fields = FieldMap::default();
        let mut malformed = 0;
        let complete = match content.rfind('\n') {
            Some(end) => &content[..end],
            None => "",
        };
        for line in complete.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((k, v)) => {
                    fields.insert(k.trim().to_string(), v.trim().to_string());
                }
                None => malformed += 1,
            }
        }
        (Self { fields }, malformed)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.as_str())
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Pid the worker reported for itself.
    pub fn pid(&self) -> Option<u32> {
        self.get("fuzzer_pid").and_then(|v| v.parse().ok())
    }

    pub fn unique_crashes(&self) -> u64 {
        self.number("unique_crashes").unwrap_or(0)
    }

    pub fn execs_done(&self) -> u64 {
        self.number("execs_done").unwrap_or(0)
    }

    pub fn paths_total(&self) -> u64 {
        self.number("paths_total").unwrap_or(0)
    }
}

/// Read and parse one status file. A malformed file still yields its good keys.
///
/// Values may echo non UTF-8 target paths, those bytes are replaced rather than
/// failing the whole file.
pub fn read_stats(path: &Path) -> (Option<WorkerStats>, Option<StatsError>) {
    let content = match read(path) {
        Ok(c) => c,
        Err(source) => {
            let err = StatsError::Read {
                path: path.to_path_buf(),
                source,
            };
            return (None, Some(err));
        }
    };
    let (stats, malformed) = WorkerStats::parse(&String::from_utf8_lossy(&content));
    let err = if malformed != 0 {
        Some(StatsError::Malformed {
            path: path.to_path_buf(),
            count: malformed,
        })
    } else {
        None
    };
    (Some(stats), err)
}

/// Snapshot of every worker status found in a sync directory.
#[derive(Debug, Default, Serialize)]
pub struct CampaignStats {
    pub workers: BTreeMap<String, WorkerStats>,
    /// Workers whose status file could not be read or parsed cleanly.
    #[serde(skip)]
    pub inconsistent: BTreeMap<String, StatsError>,
}

impl CampaignStats {
    /// Scan `out_dir/*/fuzzer_stats`; a bad file only affects its own worker.
    pub fn collect(out_dir: &Path) -> Self {
        let mut stats = CampaignStats::default();
        let entries = match read_dir(out_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::debug!("failed to scan {}: {}", out_dir.display(), e);
                }
                return stats;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let stats_file = entry.path().join(STATS_FILE);
            if !stats_file.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let (worker, err) = read_stats(&stats_file);
            if let Some(worker) = worker {
                stats.workers.insert(name.clone(), worker);
            }
            if let Some(err) = err {
                log::debug!("inconsistent status of {}: {}", name, err);
                stats.inconsistent.insert(name, err);
            }
        }
        stats
    }

    pub fn found_crash(&self) -> bool {
        self.workers.values().any(|w| w.unique_crashes() > 0)
    }

    pub fn unique_crashes(&self) -> u64 {
        self.workers.values().map(|w| w.unique_crashes()).sum()
    }

    pub fn execs_done(&self) -> u64 {
        self.workers.values().map(|w| w.execs_done()).sum()
    }

    pub fn paths_total(&self) -> u64 {
        self.workers.values().map(|w| w.paths_total()).sum()
    }

    /// Pids the workers reported, by worker name.
    pub fn reported_pids(&self) -> BTreeMap<&str, u32> {
        self.workers
            .iter()
            .filter_map(|(n, w)| w.pid().map(|p| (n.as_str(), p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write};

    const MASTER: &str = "start_time        : 1600000000\n\
                          fuzzer_pid        : 4242\n\
                          execs_done        : 1000\n\
                          paths_total       : 17\n\
                          unique_crashes    : 2\n\
                          command_line      : afl-fuzz -i in -o out -- /t/echo\n";

    #[test]
    fn parse_keeps_unknown_keys() {
        let (stats, malformed) = WorkerStats::parse(MASTER);
        assert_eq!(malformed, 0);
        assert_eq!(stats.pid(), Some(4242));
        assert_eq!(stats.unique_crashes(), 2);
        assert_eq!(stats.execs_done(), 1000);
        assert_eq!(stats.paths_total(), 17);
        assert_eq!(stats.get("start_time"), Some("1600000000"));
        // only the first ':' separates key and value
        assert_eq!(
            stats.get("command_line"),
            Some("afl-fuzz -i in -o out -- /t/echo")
        );
    }

    #[test]
    fn partial_write_is_ignored() {
        let (stats, malformed) = WorkerStats::parse("fuzzer_pid : 7\nunique_cra");
        assert_eq!(malformed, 0);
        assert_eq!(stats.pid(), Some(7));
        assert_eq!(stats.fields().len(), 1);

        let (stats, _) = WorkerStats::parse("fuzzer_pid : 7");
        assert_eq!(stats, WorkerStats::default());
    }

    #[test]
    fn malformed_lines_keep_good_keys() {
        let (stats, malformed) = WorkerStats::parse("garbage\nunique_crashes : x\nfuzzer_pid : 9\n");
        assert_eq!(malformed, 1);
        assert_eq!(stats.pid(), Some(9));
        assert_eq!(stats.unique_crashes(), 0);
    }

    #[test]
    fn collect_isolates_bad_workers() {
        let dir = tempfile::tempdir().unwrap();
        let sync = dir.path();
        for (name, content) in &[
            ("fuzzer-master", MASTER),
            ("fuzzer-1", "fuzzer_pid : 11\nnonsense\n"),
            ("fuzzer-2", "fuzzer_pid : 12\nunique_crashes : 0\n"),
        ] {
            create_dir_all(sync.join(name)).unwrap();
            write(sync.join(name).join(STATS_FILE), content).unwrap();
        }
        // not started yet, no status file
        create_dir_all(sync.join("fuzzer-3")).unwrap();
        // a directory in place of the status file
        create_dir_all(sync.join("fuzzer-4").join(STATS_FILE)).unwrap();

        let stats = CampaignStats::collect(sync);
        assert_eq!(
            stats.workers.keys().collect::<Vec<_>>(),
            vec!["fuzzer-1", "fuzzer-2", "fuzzer-master"]
        );
        assert_eq!(stats.inconsistent.keys().collect::<Vec<_>>(), vec!["fuzzer-1"]);
        assert!(stats.found_crash());
        assert_eq!(stats.unique_crashes(), 2);
        assert_eq!(stats.reported_pids().get("fuzzer-2"), Some(&12));
    }

    #[test]
    fn non_utf8_values_keep_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join("fuzzer-master");
        create_dir_all(&worker).unwrap();
        let mut content = b"fuzzer_pid : 42\nunique_crashes : 3\ncommand_line : afl-fuzz -- /t/".to_vec();
        content.extend_from_slice(&[0xff, 0xfe]);
        content.extend_from_slice(b"\nexecs_done : 10\n");
        write(worker.join(STATS_FILE), &content).unwrap();

        let stats = CampaignStats::collect(dir.path());
        assert!(stats.inconsistent.is_empty());
        let master = &stats.workers["fuzzer-master"];
        assert_eq!(master.pid(), Some(42));
        assert_eq!(master.unique_crashes(), 3);
        assert_eq!(master.execs_done(), 10);
        assert!(master.get("command_line").unwrap().starts_with("afl-fuzz -- /t/"));
        assert!(stats.found_crash());
    }

    #[test]
    fn missing_sync_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stats = CampaignStats::collect(&dir.path().join("sync"));
        assert!(stats.workers.is_empty());
        assert!(!stats.found_crash());
    }

    #[test]
    fn serializes_as_plain_maps() {
        let dir = tempfile::tempdir().unwrap();
        create_dir_all(dir.path().join("fuzzer-master")).unwrap();
        write(
            dir.path().join("fuzzer-master").join(STATS_FILE),
            "unique_crashes : 1\n",
        )
        .unwrap();
        let stats = CampaignStats::collect(dir.path());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"workers": {"fuzzer-master": {"unique_crashes": "1"}}})
        );
    }
}
