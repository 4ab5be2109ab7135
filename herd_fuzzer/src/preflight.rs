//! One-shot run of the target through the workers' execution harness.
//!
//! A target that faults on a trivial input would keep every worker busy with
//! the same crash, so it is rejected before any worker starts.

use herd_io::thread::read_background;
use herd_proc::{describe, fault_signal, ProcError};
use std::{
    ffi::OsString,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Input fed to the target on stdin.
pub const PREFLIGHT_INPUT: &[u8] = b"fuzz";

const STDERR_TAIL: usize = 2048;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("failed to prepare preflight input: {0}")]
    Input(io::Error),
    #[error(transparent)]
    Spawn(#[from] ProcError),
    #[error("failed to wait preflight harness: {0}")]
    Wait(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The harness exited on its own, whatever the code.
    Clean,
    /// The harness was terminated by this signal.
    Fault(i32),
}

/// Program and arguments that run the target the way workers will.
#[derive(Debug, Clone)]
pub struct Harness {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Harness {
    /// `afl-qemu-trace <target> [args]`
    pub fn qemu(qemu_trace: &Path, target: &Path, target_args: &[String]) -> Self {
        let mut args = vec![target.as_os_str().to_os_string()];
        args.extend(target_args.iter().map(OsString::from));
        Self {
            program: qemu_trace.to_path_buf(),
            args,
        }
    }

    /// The instrumented target run directly.
    pub fn native(target: &Path, target_args: &[String]) -> Self {
        Self {
            program: target.to_path_buf(),
            args: target_args.iter().map(OsString::from).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run once with [`PREFLIGHT_INPUT`] on stdin, blocking until the harness exits.
    pub fn check(&self, job_id: &str) -> Result<Verdict, PreflightError> {
        self.check_in(job_id, &std::env::temp_dir())
    }

    /// Like [`Harness::check`], with the input file created in `tmp_dir`.
    ///
    /// The input file lives in a `NamedTempFile`, removed on every return path.
    pub fn check_in(&self, job_id: &str, tmp_dir: &Path) -> Result<Verdict, PreflightError> {
        let mut input = NamedTempFile::new_in(tmp_dir).map_err(PreflightError::Input)?;
        input
            .write_all(PREFLIGHT_INPUT)
            .and_then(|_| input.flush())
            .map_err(PreflightError::Input)?;
        let stdin = input.reopen().map_err(PreflightError::Input)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        job_debug!(job_id, "preflight: {:?}", cmd);

        let mut child = herd_proc::spawn(&mut cmd)?;
        let stderr = child
            .stderr
            .take()
            .map(|e| read_background(e, STDERR_TAIL));
        let status = child.wait().map_err(PreflightError::Wait)?;
        let stderr = stderr
            .map(|h| h.wait_finish(Duration::from_millis(500)))
            .unwrap_or_default();

        job_debug!(job_id, "preflight harness {}", describe(&status));
        match fault_signal(&status) {
            Some(sig) => {
                if !stderr.is_empty() {
                    job_debug!(
                        job_id,
                        "preflight stderr:\n{}",
                        String::from_utf8_lossy(&stderr)
                    );
                }
                Ok(Verdict::Fault(sig))
            }
            None => Ok(Verdict::Clean),
        }
    }
}
