//! One fuzzing campaign: a job directory and the pool of workers sharing it.

use crate::{
    arch::{ArchProbe, ElfProbe, ProbeError, HOST_QEMU_ARCH},
    config::{check_extra_args, AssistPolicy, Config, ExecMode},
    corpus::{self, CorpusError},
    crash::{self, CrashSet},
    dict::{self, DictBuilder},
    preflight::{Harness, PreflightError, Verdict},
    stats::CampaignStats,
    worker::{InputSource, WorkerError, WorkerHandle, WorkerRole, WorkerSpec},
};
use std::{
    fs::create_dir_all,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;

pub const INPUT_DIR: &str = "input";
pub const SYNC_DIR: &str = "sync";

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("target faults on trivial input (signal {signal})")]
    EarlyCrashDetected { signal: i32 },
    #[error("preflight check failed: {0}")]
    Preflight(#[from] PreflightError),
    #[error("failed to launch worker: {0}")]
    Spawn(#[from] WorkerError),
    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl From<CorpusError> for CampaignError {
    fn from(e: CorpusError) -> Self {
        match e {
            CorpusError::NoSeeds => CampaignError::Configuration(e.to_string()),
            CorpusError::Write { path, source } | CorpusError::ReadDir { path, source } => {
                CampaignError::Io {
                    context: format!("failed to prepare corpus {}", path.display()),
                    source,
                }
            }
        }
    }
}

/// Result of a successful `start` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The preflight run was killed by `signal`; no worker was launched.
    EarlyCrash { signal: i32 },
}

impl StartOutcome {
    pub fn into_result(self) -> Result<(), CampaignError> {
        match self {
            StartOutcome::Started => Ok(()),
            StartOutcome::EarlyCrash { signal } => {
                Err(CampaignError::EarlyCrashDetected { signal })
            }
        }
    }
}

pub struct Campaign {
    config: Config,
    target_id: String,
    job_dir: PathBuf,
    in_dir: PathBuf,
    out_dir: PathBuf,
    resuming: bool,
    tracer_dir: Option<PathBuf>,
    harness: Harness,
    dict_builder: Option<DictBuilder>,
    dictionary: Option<PathBuf>,
    dict_resolved: bool,
    workers: Vec<WorkerHandle>,
    started: bool,
    active: bool,
    start_time: Option<Instant>,
}

impl Campaign {
    pub fn new(config: Config) -> Result<Self, CampaignError> {
        Self::with_probe(config, &ElfProbe)
    }

    /// Lay out the job directory and seed the corpus. No process is started.
    pub fn with_probe(config: Config, probe: &dyn ArchProbe) -> Result<Self, CampaignError> {
        check_extra_args(&config.extra_args).map_err(CampaignError::Configuration)?;
        let target_id = config.target_id().ok_or_else(|| {
            CampaignError::Configuration(format!(
                "target has no file name: {}",
                config.target.display()
            ))
        })?;
        let job_dir = config.work_dir.join(&target_id);
        let in_dir = job_dir.join(INPUT_DIR);
        let out_dir = job_dir.join(SYNC_DIR);

        let (tracer_dir, harness) = match config.exec_mode {
            ExecMode::Qemu => {
                let arch = match config.tracer_arch.as_ref() {
                    Some(arch) => arch.clone(),
                    None => probe.qemu_arch(&config.target)?,
                };
                let qemu_trace = config.qemu_trace(&arch);
                if !qemu_trace.is_file() {
                    return Err(CampaignError::Configuration(format!(
                        "no qemu tracer for {}: {}",
                        arch,
                        qemu_trace.display()
                    )));
                }
                job_debug!(target_id, "tracer arch: {}", arch);
                let harness = Harness::qemu(&qemu_trace, &config.target, &config.target_args);
                (Some(config.tracer_dir(&arch)), harness)
            }
            ExecMode::Native => {
                match probe.qemu_arch(&config.target) {
                    Ok(arch) if arch != HOST_QEMU_ARCH => job_warn!(
                        target_id,
                        "native target is built for {}, host is {}",
                        arch,
                        HOST_QEMU_ARCH
                    ),
                    Ok(_) => (),
                    Err(e) => job_debug!(target_id, "arch probe: {}", e),
                }
                let harness = Harness::native(&config.target, &config.target_args);
                (None, harness)
            }
        };

        let state = corpus::initialize(&target_id, &in_dir, &config.seeds)?;
        let resuming = state == corpus::CorpusState::Resumed;
        if let Err(e) = create_dir_all(&out_dir) {
            job_warn!(target_id, "unable to create sync dir {}: {}", out_dir.display(), e);
        }

        let dict_builder = if config.create_dictionary {
            Some(DictBuilder::new(
                config.create_dict(),
                config.dict_mem_limit,
                config.dict_timeout,
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            target_id,
            job_dir,
            in_dir,
            out_dir,
            resuming,
            tracer_dir,
            harness,
            dict_builder,
            dictionary: None,
            dict_resolved: false,
            workers: Vec::new(),
            started: false,
            active: false,
            start_time: None,
        })
    }

    /// Preflight check, then `config.job` workers: the primary first, the
    /// optional assist worker second, plain secondaries after that.
    ///
    /// Workers launched earlier through `add_fuzzer` keep their roles and
    /// the new ones continue the numbering.
    pub fn start(&mut self) -> Result<StartOutcome, CampaignError> {
        if self.started {
            return Err(CampaignError::Configuration(
                "campaign already started".to_string(),
            ));
        }

        job_info!(self.target_id, "preflight check: {}", self.harness.program().display());
        if let Verdict::Fault(signal) = self.harness.check(&self.target_id)? {
            job_warn!(
                self.target_id,
                "target faults on trivial input (signal {}), not starting",
                signal
            );
            return Ok(StartOutcome::EarlyCrash { signal });
        }

        self.started = true;
        if let Err(e) = self.launch(self.config.job) {
            job_warn!(self.target_id, "start aborted: {}", e);
            self.kill();
            return Err(e);
        }
        self.start_time = Some(Instant::now());
        job_info!(self.target_id, "{} worker(s) running", self.workers.len());
        Ok(StartOutcome::Started)
    }

    fn launch(&mut self, count: usize) -> Result<(), CampaignError> {
        self.add_fuzzers(count)?;
        if self.config.assist == AssistPolicy::Reserve && self.assist_worker().is_none() {
            if let Some(w) = self.workers.get_mut(1) {
                w.mark_assist();
                job_info!(self.target_id, "{} reserved as assist worker", w.role());
            }
        }
        Ok(())
    }

    /// Launch one more worker, returning its pid. The campaign is active from
    /// its first launched worker until `kill`.
    pub fn add_fuzzer(&mut self) -> Result<u32, CampaignError> {
        if !self.dict_resolved {
            self.dictionary = dict::resolve(
                &self.target_id,
                &dict::dict_path(&self.job_dir, &self.target_id),
                self.resuming,
                self.dict_builder.as_ref(),
                &self.config.target,
            );
            self.dict_resolved = true;
        }

        let role = WorkerRole::nth(self.workers.len() as u32);
        let worker = WorkerHandle::spawn(&self.worker_spec(), role, &self.job_dir)?;
        let pid = worker.pid();
        job_info!(
            self.target_id,
            "{} started, pid: {}, log: {}",
            role,
            pid,
            worker.log_path().display()
        );
        self.workers.push(worker);
        self.active = true;
        Ok(pid)
    }

    pub fn add_fuzzers(&mut self, n: usize) -> Result<(), CampaignError> {
        for _ in 0..n {
            self.add_fuzzer()?;
        }
        Ok(())
    }

    fn worker_spec(&self) -> WorkerSpec {
        let input = if self.resuming {
            InputSource::Resume
        } else {
            InputSource::Dir(self.in_dir.clone())
        };
        WorkerSpec {
            engine: self.config.afl_fuzz(),
            input,
            sync_dir: self.out_dir.clone(),
            memory: self.config.memory.clone(),
            exec_mode: self.config.exec_mode,
            tracer_dir: self.tracer_dir.clone(),
            dictionary: self.dictionary.clone(),
            extra_args: self.config.extra_args.clone(),
            target: self.config.target.clone(),
            target_args: self.config.target_args.clone(),
        }
    }

    /// Terminate every worker one after another and wait for each.
    pub fn kill(&mut self) {
        for w in self.workers.iter_mut() {
            match w.terminate() {
                Ok(status) => job_debug!(
                    self.target_id,
                    "{} {}",
                    w.role(),
                    herd_proc::describe(&status)
                ),
                Err(e) => job_warn!(self.target_id, "failed to stop {}: {}", w.role(), e),
            }
        }
        self.active = false;
    }

    /// True while the campaign is active and at least one worker process exists.
    pub fn alive(&mut self) -> bool {
        self.active
            && self
                .workers
                .iter_mut()
                .any(|w| w.is_running() && herd_proc::is_alive(w.pid()))
    }

    /// Number of tracked workers whose process has not exited.
    pub fn running_workers(&mut self) -> usize {
        self.workers
            .iter_mut()
            .map(|w| w.is_running())
            .filter(|running| *running)
            .count()
    }

    pub fn stats(&self) -> CampaignStats {
        CampaignStats::collect(&self.out_dir)
    }

    pub fn found_crash(&self) -> bool {
        self.stats().found_crash()
    }

    /// Distinct crash inputs over all workers, empty until a worker reports one.
    pub fn crashes(&self) -> CrashSet {
        if !self.found_crash() {
            return CrashSet::default();
        }
        crash::harvest(&self.out_dir)
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn in_dir(&self) -> &Path {
        &self.in_dir
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn dictionary(&self) -> Option<&Path> {
        self.dictionary.as_deref()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn assist_worker(&self) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.is_assist())
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }
}

impl Drop for Campaign {
    fn drop(&mut self) {
        if self.workers.iter_mut().any(|w| w.is_running()) {
            self.kill();
        }
    }
}
