//! Dictionary of mutation hints extracted from the target by an external tool.
//!
//! The extraction runs as its own process with an address-space ceiling, so a
//! pathological binary can not take the orchestrator down with it.

use herd_io::thread::read_background;
use herd_proc::{describe, kill_within, limit_memory, wait_timeout, ProcError};
use std::{
    fs::remove_file,
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;

/// Trailing stderr bytes of the builder kept for the warning.
const STDERR_TAIL: usize = 4096;
/// Time between SIGTERM and SIGKILL of a builder that ran out of time.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// `<job_dir>/<target_id>.dict`
pub fn dict_path(job_dir: &Path, target_id: &str) -> PathBuf {
    job_dir.join(format!("{}.dict", target_id))
}

#[derive(Debug, Error)]
pub enum DictError {
    #[error(transparent)]
    Spawn(#[from] ProcError),
    #[error("dictionary builder {status}: {stderr}")]
    BuildFailed { status: String, stderr: String },
    #[error("dictionary builder succeeded but wrote no {0}")]
    Missing(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DictBuilder {
    script: PathBuf,
    mem_limit: Option<u64>,
    timeout: Duration,
}

impl DictBuilder {
    pub fn new(script: PathBuf, mem_limit: Option<u64>, timeout: Duration) -> Self {
        Self {
            script,
            mem_limit,
            timeout,
        }
    }

    /// Run `<script> <target> <dict>`; only the exit status decides success.
    ///
    /// A builder still running after the timeout is killed and counts as failed.
    pub fn build(&self, target: &Path, dict: &Path) -> Result<(), DictError> {
        let mut cmd = Command::new(&self.script);
        cmd.arg(target)
            .arg(dict)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(megabytes) = self.mem_limit {
            limit_memory(&mut cmd, megabytes);
        }

        let mut child = herd_proc::spawn(&mut cmd)?;
        let stderr = child
            .stderr
            .take()
            .map(|e| read_background(e, STDERR_TAIL));
        let outcome = match wait_timeout(&mut child, self.timeout)? {
            Some(status) if status.success() => None,
            Some(status) => Some(describe(&status)),
            None => {
                kill_within(&mut child, KILL_GRACE)?;
                Some(format!("timed out after {:?}", self.timeout))
            }
        };
        let stderr = stderr
            .map(|h| h.wait_finish(Duration::from_secs(1)))
            .unwrap_or_default();

        if let Some(status) = outcome {
            if let Err(e) = remove_file(dict) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::debug!("failed to remove partial dictionary {}: {}", dict.display(), e);
                }
            }
            return Err(DictError::BuildFailed {
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        if !dict.is_file() {
            return Err(DictError::Missing(dict.to_path_buf()));
        }
        Ok(())
    }
}

/// Pick the campaign's dictionary: an existing file wins, a resumed run never builds one.
pub fn resolve(
    job_id: &str,
    dict: &Path,
    resuming: bool,
    builder: Option<&DictBuilder>,
    target: &Path,
) -> Option<PathBuf> {
    if dict.is_file() {
        job_debug!(job_id, "using existing dictionary {}", dict.display());
        return Some(dict.to_path_buf());
    }
    if resuming {
        return None;
    }
    let builder = builder?;

    job_debug!(
        job_id,
        "creating a dictionary of string references within {}",
        target.display()
    );
    match builder.build(target, dict) {
        Ok(()) => {
            job_info!(job_id, "dictionary created: {}", dict.display());
            Some(dict.to_path_buf())
        }
        Err(e) => {
            job_warn!(job_id, "unable to create dictionary: {}", e);
            None
        }
    }
}
