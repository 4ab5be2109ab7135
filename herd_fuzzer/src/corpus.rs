//! Seed corpus preparation and resume detection.

use std::{
    fs::{create_dir_all, read, read_dir, write},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Seed files are `seed-0`, `seed-1`, ...
pub const SEED_PREFIX: &str = "seed-";

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("at least one seed is required to start a new campaign")]
    NoSeeds,
    #[error("failed to write seed {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read seed dir {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },
}

/// State of the input directory once the initializer ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusState {
    /// A previous run left entries behind, workers read them directly.
    Resumed,
    /// Fresh campaign, this many seed files were written.
    Seeded(usize),
}

/// A non-empty input directory means an earlier run exists.
pub fn is_resuming(in_dir: &Path) -> bool {
    match read_dir(in_dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// Populate `in_dir` with `seeds`, unless it already holds a previous run's entries.
///
/// Failure to create the directory is only logged, writing the seeds reports the real problem.
pub fn initialize(
    job_id: &str,
    in_dir: &Path,
    seeds: &[Vec<u8>],
) -> Result<CorpusState, CorpusError> {
    if is_resuming(in_dir) {
        job_info!(job_id, "resuming old fuzzing run");
        return Ok(CorpusState::Resumed);
    }
    if seeds.is_empty() {
        return Err(CorpusError::NoSeeds);
    }

    if let Err(e) = create_dir_all(in_dir) {
        job_warn!(job_id, "unable to create input dir {}: {}", in_dir.display(), e);
    }
    job_debug!(job_id, "writing {} seed(s) to {}", seeds.len(), in_dir.display());
    for (i, seed) in seeds.iter().enumerate() {
        let path = in_dir.join(format!("{}{}", SEED_PREFIX, i));
        write(&path, seed).map_err(|source| CorpusError::Write { path, source })?;
    }
    Ok(CorpusState::Seeded(seeds.len()))
}

/// Read every regular file of `dir` as one seed, in file name order.
pub fn load_seed_dir(dir: &Path) -> Result<Vec<Vec<u8>>, CorpusError> {
    let dir_iter = read_dir(dir).map_err(|source| CorpusError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = dir_iter
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect::<Vec<_>>();
    paths.sort();

    let mut seeds = Vec::with_capacity(paths.len());
    for p in paths {
        match read(&p) {
            Ok(content) => seeds.push(content),
            Err(e) => log::warn!("skip unreadable seed {}: {}", p.display(), e),
        }
    }
    Ok(seeds)
}
