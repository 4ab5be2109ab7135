use crate::config::ExecMode;
use herd_proc::{detach, ProcError};
use std::{
    ffi::OsString,
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
};
use thiserror::Error;

/// Input directory argument telling the engine to continue from its own sync state.
pub const RESUME_SENTINEL: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// First worker of the campaign, `-M fuzzer-master`.
    Primary,
    /// Every later worker, `-S fuzzer-<n>`.
    Secondary(u32),
}

impl WorkerRole {
    /// Role of the `n`-th launched worker.
    pub fn nth(n: u32) -> Self {
        if n == 0 {
            WorkerRole::Primary
        } else {
            WorkerRole::Secondary(n)
        }
    }

    /// Instance name, also the worker's directory under `sync/`.
    pub fn name(&self) -> String {
        match self {
            WorkerRole::Primary => "fuzzer-master".to_string(),
            WorkerRole::Secondary(n) => format!("fuzzer-{}", n),
        }
    }

    pub fn flag(&self) -> &'static str {
        match self {
            WorkerRole::Primary => "-M",
            WorkerRole::Secondary(_) => "-S",
        }
    }

    pub fn log_name(&self) -> String {
        format!("{}.log", self.name())
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, WorkerRole::Primary)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Dir(PathBuf),
    Resume,
}

impl InputSource {
    fn arg(&self) -> OsString {
        match self {
            InputSource::Dir(p) => p.as_os_str().to_os_string(),
            InputSource::Resume => OsString::from(RESUME_SENTINEL),
        }
    }
}

/// Everything shared by the invocations of all workers of one campaign.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub engine: PathBuf,
    pub input: InputSource,
    pub sync_dir: PathBuf,
    pub memory: String,
    pub exec_mode: ExecMode,
    /// Exported as `AFL_PATH` to the worker only.
    pub tracer_dir: Option<PathBuf>,
    pub dictionary: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub target: PathBuf,
    pub target_args: Vec<String>,
}

impl WorkerSpec {
    /// Engine command line for a worker in `role`.
    pub fn command(&self, role: WorkerRole) -> Command {
        let mut cmd = Command::new(&self.engine);
        cmd.arg("-i").arg(self.input.arg());
        cmd.arg("-o").arg(&self.sync_dir);
        cmd.arg("-m").arg(&self.memory);
        if self.exec_mode == ExecMode::Qemu {
            cmd.arg("-Q");
        }
        cmd.arg(role.flag()).arg(role.name());
        if let Some(dict) = self.dictionary.as_ref() {
            cmd.arg("-x").arg(dict);
        }
        cmd.args(&self.extra_args);
        cmd.arg("--").arg(&self.target).args(&self.target_args);

        if let Some(tracer_dir) = self.tracer_dir.as_ref() {
            cmd.env("AFL_PATH", tracer_dir);
        }
        cmd
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to open worker log {path}: {source}")]
    Log { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Spawn(#[from] ProcError),
}

/// One launched engine process.
#[derive(Debug)]
pub struct WorkerHandle {
    role: WorkerRole,
    child: Child,
    log_path: PathBuf,
    assist: bool,
}

impl WorkerHandle {
    /// Launch a worker with its stdout and stderr going to `<log_dir>/<role>.log`.
    pub fn spawn(spec: &WorkerSpec, role: WorkerRole, log_dir: &Path) -> Result<Self, WorkerError> {
        let log_path = log_dir.join(role.log_name());
        let log_err = |source: io::Error| WorkerError::Log {
            path: log_path.clone(),
            source,
        };
        let log = File::create(&log_path).map_err(log_err)?;
        let log_dup = log.try_clone().map_err(log_err)?;

        let mut cmd = spec.command(role);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_dup));
        detach(&mut cmd);
        log::debug!("execing: {:?} > {}", cmd, log_path.display());

        let child = herd_proc::spawn(&mut cmd)?;
        Ok(Self {
            role,
            child,
            log_path,
            assist: false,
        })
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Set on the worker reserved for pairing with a symbolic-execution helper.
    pub fn is_assist(&self) -> bool {
        self.assist
    }

    pub(crate) fn mark_assist(&mut self) {
        self.assist = true;
    }

    /// Reaps the process if it exited, so a finished worker never counts as running.
    pub fn is_running(&mut self) -> bool {
        herd_proc::running(&mut self.child)
    }

    pub fn terminate(&mut self) -> Result<ExitStatus, ProcError> {
        herd_proc::terminate(&mut self.child)
    }
}
